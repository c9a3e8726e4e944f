//! Real-time PS publishing from an H.264/H.265 file and an AAC file.
//!
//! Both streams are timed on a 1024-sample grid: each AAC frame is 1024
//! samples at the file's rate, and each video access unit is treated as
//! 1024 samples at `1024 * 1000 / fps` Hz. One iteration consumes one
//! audio frame, so the wall clock advances `1024 / audio_rate` seconds
//! per iteration.
//!
//! ```text
//! loop:
//!   pack has no video? ──► read one access unit, write header + video PES
//!   read one ADTS frame ──► write audio PES
//!   video_dts < audio_dts? ──► send pack, start a new one
//!   sleep what the wall clock says
//! ```

use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{GbError, Result, ResultExt};
use crate::media::aac::{AdtsReader, SAMPLES_PER_FRAME};
use crate::media::clock::WallClock;
use crate::media::ps::PsPack;
use crate::media::{NalReader, VideoUnit, open_video};
use crate::scope::Scope;
use crate::transport::MediaSender;

/// How often the loop logs its position.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Media files to publish.
#[derive(Debug, Clone)]
pub struct PsConfig {
    /// `.h264` or `.h265` Annex B file.
    pub video: PathBuf,
    /// ADTS AAC file.
    pub audio: PathBuf,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub ps: PsConfig,
    pub ssrc: u32,
    /// `tcp://ip:port` or `udp://ip:port` of the platform's media port.
    pub server_addr: String,
    pub clock_rate: u64,
    pub payload_type: u8,
}

/// Why ingestion stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStop {
    /// A media file ran out.
    EndOfStream,
    /// The governing scope ended.
    ScopeEnded,
}

/// Counters of one ingestion run.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub packs: u64,
    pub rtp_packets: u64,
    pub video_samples: u64,
    pub video_dts: u64,
    pub audio_samples: u64,
    pub audio_dts: u64,
}

impl IngestReport {
    fn log(&self, msg: &'static str) {
        tracing::info!(
            packs = self.packs,
            video_samples = self.video_samples,
            video_dts = self.video_dts,
            video_ms = self.video_dts / 90,
            audio_samples = self.audio_samples,
            audio_dts = self.audio_dts,
            audio_ms = self.audio_dts / 90,
            "{msg}"
        );
    }
}

type PacketHook = Box<dyn FnMut(&PsPack) -> Result<()> + Send>;

/// Publishes one PS stream to a platform.
pub struct PsIngester {
    config: IngesterConfig,
    on_send_packet: Option<PacketHook>,
}

impl PsIngester {
    pub fn new(config: IngesterConfig) -> Self {
        Self {
            config,
            on_send_packet: None,
        }
    }

    pub fn config(&self) -> &IngesterConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut IngesterConfig {
        &mut self.config
    }

    /// Called after every pack is sent. An error stops ingestion.
    pub fn on_send_packet(&mut self, hook: impl FnMut(&PsPack) -> Result<()> + Send + 'static) {
        self.on_send_packet = Some(Box::new(hook));
    }

    /// Publish until a file ends or `scope` does.
    ///
    /// To stop a running ingest, cancel `scope` (or a parent of it) from
    /// another thread or from the packet hook.
    pub fn ingest(&mut self, scope: &Scope) -> Result<(IngestStop, IngestReport)> {
        if self.config.ps.fps == 0 {
            return Err(GbError::Config("fps must be positive".to_string()));
        }
        let scope = scope.child();

        let mut sender = MediaSender::new(
            self.config.ssrc,
            &self.config.server_addr,
            self.config.payload_type,
        );
        sender
            .connect()
            .with_context(|| format!("connect media={}", self.config.server_addr))?;

        let mut video = open_video(&self.config.ps.video)?;
        let audio_path = &self.config.ps.audio;
        let audio_file = File::open(audio_path)
            .map_err(|e| GbError::from(e).wrap(format!("open {}", audio_path.display())))?;
        let mut audio = AdtsReader::new(audio_file)
            .with_context(|| format!("open {}", audio_path.display()))?;

        let audio_rate = u64::from(audio.sample_rate());
        // Video on the AAC grid: one access unit is 1024 samples.
        let video_rate = SAMPLES_PER_FRAME * 1000 / u64::from(self.config.ps.fps);
        tracing::info!(
            tbn = self.config.clock_rate,
            ssrc = self.config.ssrc,
            pt = self.config.payload_type,
            video = %self.config.ps.video.display(),
            codec = %video.codec(),
            fps = self.config.ps.fps,
            video_rate,
            audio = %audio_path.display(),
            audio_rate,
            channels = audio.config().channels,
            "PS media stream"
        );

        let mut report = IngestReport::default();
        let result = self.run(
            &scope,
            &mut sender,
            video.as_mut(),
            &mut audio,
            video_rate,
            audio_rate,
            &mut report,
        );
        report.rtp_packets = sender.packets_sent();
        report.log("ingest done");
        sender.close();

        match result {
            Ok(()) => Ok((IngestStop::ScopeEnded, report)),
            Err(e) if e.is_end_of_stream() => Ok((IngestStop::EndOfStream, report)),
            Err(e) if e.is_cancellation() && scope.is_done() => Ok((IngestStop::ScopeEnded, report)),
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        scope: &Scope,
        sender: &mut MediaSender,
        video: &mut dyn NalReader,
        audio: &mut AdtsReader<File>,
        video_rate: u64,
        audio_rate: u64,
        report: &mut IngestReport,
    ) -> Result<()> {
        let clock_rate = self.config.clock_rate;
        let frame_duration = Duration::from_nanos(1_000_000_000 * SAMPLES_PER_FRAME / audio_rate);
        let mut clock = WallClock::new();
        let mut last_progress = Instant::now();
        let mut pack = PsPack::new();

        while !scope.is_done() {
            if !pack.has_video() {
                write_access_unit(scope, video, &mut pack, clock_rate, video_rate, report)
                    .context("WriteVideo")?;
            }

            let frame = audio.next_frame().context("Read AAC")?;
            report.audio_samples += SAMPLES_PER_FRAME;
            report.audio_dts = clock_rate * report.audio_samples / audio_rate;
            if last_progress.elapsed() > PROGRESS_INTERVAL {
                last_progress = Instant::now();
                report.log("ingest progress");
            }
            pack.write_audio(&frame, report.audio_dts);

            // A pack holds one access unit; audio catches up before it goes.
            if pack.has_video() && report.video_dts < report.audio_dts {
                sender.write_pack(&pack).context("write")?;
                report.packs += 1;
                if let Some(hook) = self.on_send_packet.as_mut() {
                    hook(&pack).context("callback")?;
                }
                pack = PsPack::new();
            }

            let ahead = clock.tick(frame_duration);
            if !ahead.is_zero() {
                scope.sleep(ahead)?;
            }
        }
        Ok(())
    }
}

/// Read parameter sets up to and including the next other unit, then
/// write them as one access unit.
fn write_access_unit(
    scope: &Scope,
    video: &mut dyn NalReader,
    pack: &mut PsPack,
    clock_rate: u64,
    video_rate: u64,
    report: &mut IngestReport,
) -> Result<()> {
    let mut units: Vec<VideoUnit> = Vec::new();
    let mut has_parameter_sets = false;
    loop {
        scope.check()?;
        let unit = video.next_unit()?;
        let last = !unit.parameter_set;
        has_parameter_sets |= unit.parameter_set;
        units.push(unit);
        if last {
            break;
        }
    }

    report.video_samples += SAMPLES_PER_FRAME;
    report.video_dts = clock_rate * report.video_samples / video_rate;

    if has_parameter_sets {
        pack.write_header(video.codec(), report.video_dts);
    } else {
        pack.write_pack_header(report.video_dts);
    }
    for unit in &units {
        pack.write_video(&unit.data, report.video_dts);
    }
    Ok(())
}
