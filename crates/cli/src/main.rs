use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use gb28181::protocol::Method;
use gb28181::scope::recv_within;
use gb28181::transport::build_media_addr;
use gb28181::{
    GbError, GbSession, GbSessionConfig, IngesterConfig, PsConfig, PsIngester, Result, ResultExt,
    Scope, SessionEvent, SipConfig, filter_errors,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "gb-bench",
    about = "Emulate a GB28181 device against a media server"
)]
struct Args {
    /// SIP server address
    #[arg(long, default_value = "tcp://127.0.0.1:5060")]
    sip: String,

    /// Device user (stream) id prefix
    #[arg(long, default_value = "3402000000")]
    stream: String,

    /// Number of random digits appended to the stream id
    #[arg(long, default_value_t = 10)]
    random: usize,

    /// SIP domain
    #[arg(long, default_value = "3402000000")]
    domain: String,

    /// SIP server id
    #[arg(long, default_value = "34020000002000000001")]
    server: String,

    /// Overall timeout of the scenario in ms
    #[arg(long, default_value_t = 11000)]
    timeout: u64,

    /// Media disconnect timeout of the server in ms
    #[arg(long, default_value_t = 2100)]
    media_timeout: u64,

    /// Re-INVITE timeout of the server in ms
    #[arg(long, default_value_t = 1200)]
    reinvite_timeout: u64,

    /// ADTS AAC file to publish
    #[arg(long, default_value = "avatar.aac")]
    audio: PathBuf,

    /// Annex B file to publish; *.h265 selects HEVC
    #[arg(long, default_value = "avatar.h264")]
    video: PathBuf,

    #[arg(long, default_value_t = 25)]
    fps: u32,

    /// Enable debug logs
    #[arg(long)]
    log: bool,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// Register, accept the INVITE and send keepalives
    Session {
        /// Stop after this many keepalives; 0 runs until the timeout
        #[arg(long, default_value_t = 3)]
        heartbeats: u64,
    },
    /// Register, accept the INVITE and publish PS media
    Publish {
        /// Stop after this many PS packs; 0 runs until EOF or the timeout
        #[arg(long, default_value_t = 0)]
        packets: u64,
    },
    /// Hang up after three keepalives and expect no re-INVITE
    Bye,
    /// Unregister after three keepalives and expect no re-INVITE
    Unregister,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.log { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let scope = Scope::timeout(Duration::from_millis(args.timeout));
    let result = run(&args, &scope);
    match filter_errors([result]) {
        Ok(()) => {
            tracing::info!("done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, scope: &Scope) -> Result<()> {
    let sip_config = SipConfig::new(&args.sip, &args.domain, &args.stream, args.random, &args.server);
    let mut session = GbSession::new(
        GbSessionConfig {
            reg_timeout: Duration::from_millis(args.timeout),
            invite_timeout: Duration::from_millis(args.timeout),
        },
        sip_config,
    );
    tracing::info!(config = %session.sip_config(), "start device");

    match args.scenario {
        Scenario::Session { heartbeats } => {
            handshake(&mut session, scope)?;
            if heartbeats == 0 {
                // The overall deadline is how this scenario ends.
                return until_deadline(wait_heartbeats(&session, u64::MAX, scope), scope);
            }
            wait_heartbeats(&session, heartbeats, scope)?;
            session.stop_heartbeat();
            Ok(())
        }
        Scenario::Publish { packets } => publish(args, &mut session, scope, packets),
        Scenario::Bye => {
            handshake(&mut session, scope)?;
            wait_heartbeats(&session, 3, scope)?;
            session.bye(scope)?;
            expect_no_invite(args, &session, scope)
        }
        Scenario::Unregister => {
            handshake(&mut session, scope)?;
            wait_heartbeats(&session, 3, scope)?;
            session.unregister(scope)?;
            expect_no_invite(args, &session, scope)
        }
    }
}

fn handshake(session: &mut GbSession, scope: &Scope) -> Result<()> {
    session.connect(scope).context("connect")?;
    session.register(scope).context("register")?;
    session.invite(scope).context("invite")?;
    Ok(())
}

/// Wait for `n` answered keepalives, failing if the heartbeat stops first.
fn wait_heartbeats(session: &GbSession, n: u64, scope: &Scope) -> Result<()> {
    let events = session.events();
    loop {
        match recv_within(&events, &[scope])? {
            SessionEvent::Heartbeat { count, response, .. } => {
                tracing::info!(count, response = %response.message_id(), "keepalive answered");
                if count >= n {
                    return Ok(());
                }
            }
            SessionEvent::HeartbeatStopped { error: Some(e) } => {
                return Err(GbError::Transport(e).wrap("heartbeat"));
            }
            SessionEvent::HeartbeatStopped { error: None } => return Err(GbError::Cancelled),
        }
    }
}

/// `result` of a step that only ends with `scope`: its cancellation is
/// success, anything else is a real failure.
fn until_deadline(result: Result<()>, scope: &Scope) -> Result<()> {
    match result {
        Err(e) if e.is_cancellation() && scope.is_done() => Ok(()),
        r => r,
    }
}

/// The server releases the device after BYE or un-REGISTER, so no INVITE
/// may arrive within its media and re-INVITE timeouts.
fn expect_no_invite(args: &Args, session: &GbSession, scope: &Scope) -> Result<()> {
    let window = Duration::from_millis(args.media_timeout + args.reinvite_timeout + 1000);
    match session.wait_request(&scope.with_timeout(window), Method::Invite) {
        Ok(req) => Err(GbError::Protocol(format!(
            "should not invite after release, got {}",
            req.message_id()
        ))),
        Err(e) if e.is_deadline_exceeded() && !scope.is_done() => Ok(()),
        Err(e) => Err(e),
    }
}

fn publish(args: &Args, session: &mut GbSession, scope: &Scope, packets: u64) -> Result<()> {
    let ps = PsConfig {
        video: resolve_path(&args.video)?,
        audio: resolve_path(&args.audio)?,
        fps: args.fps,
    };

    handshake(session, scope)?;
    let out = session.output().clone();
    let server_addr = build_media_addr(&args.sip, out.media_port).context("parse")?;

    let mut ingester = PsIngester::new(IngesterConfig {
        ps,
        ssrc: out.ssrc,
        server_addr,
        clock_rate: out.clock_rate,
        payload_type: out.payload_type,
    });

    let run = scope.child();
    if packets > 0 {
        let stop = run.clone();
        let sent = Arc::new(AtomicU64::new(0));
        ingester.on_send_packet(move |_| {
            if sent.fetch_add(1, Ordering::Relaxed) + 1 >= packets {
                stop.cancel();
            }
            Ok(())
        });
    }

    let (stop, report) = ingester.ingest(&run).context("ingest")?;
    tracing::info!(?stop, packs = report.packs, rtp_packets = report.rtp_packets, "publish done");
    Ok(())
}

/// `path` if it opens, else `../path`.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    if std::fs::File::open(path).is_ok() {
        return Ok(path.to_path_buf());
    }
    let parent = Path::new("..").join(path);
    if std::fs::File::open(&parent).is_ok() {
        return Ok(parent);
    }
    Err(GbError::Config(format!(
        "no media file at {} or {}",
        path.display(),
        parent.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_ends_unbounded_session() {
        let scope = Scope::timeout(Duration::ZERO);
        let r = Err(GbError::DeadlineExceeded.wrap("heartbeat"));
        assert!(until_deadline(r, &scope).is_ok());
    }

    #[test]
    fn heartbeat_failure_is_reported() {
        let scope = Scope::timeout(Duration::ZERO);
        let r = Err(GbError::Transport("403 Forbidden".to_string()).wrap("heartbeat"));
        assert!(until_deadline(r, &scope).is_err());

        let running = Scope::timeout(Duration::from_secs(60));
        assert!(until_deadline(Err(GbError::Cancelled), &running).is_err());
    }
}
