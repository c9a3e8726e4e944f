//! In-process GB28181 platform for scenario tests.
//!
//! Speaks just enough SIP over TCP to drive a device through a session:
//!
//! - REGISTER, MESSAGE and BYE are answered `200 OK`.
//! - A REGISTER with a non-zero `Expires` is followed by an INVITE whose
//!   SDP names the media port and a fresh SSRC, unless the device sent
//!   BYE or un-REGISTER earlier. A device that reconnects mid-handshake is
//!   therefore invited again.
//! - A `200 OK` to an INVITE is acknowledged with ACK.
//!
//! A second listener accepts RTP over TCP (RFC 4571 framing) and counts
//! packets per SSRC.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gb28181::protocol::{Method, SipMessage, SipRequest, SipResponse, new_branch, new_call_id, new_tag};
use gb28181::transport::tcp;
use gb28181::{GbSession, GbSessionConfig, PsConfig, Result, ResultExt, Scope, SipConfig};
use parking_lot::Mutex;

pub const DOMAIN: &str = "3402000000";
pub const SERVER: &str = "34020000002000000001";
pub const USER: &str = "3402000000";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Overall bound of one scenario.
pub const CASE_TIMEOUT: Duration = Duration::from_secs(11);

/// How long a test waits to be sure no INVITE comes.
pub const NO_INVITE_WINDOW: Duration = Duration::from_millis(1500);

#[derive(Default)]
struct DeviceRecord {
    registers: u32,
    invites: u32,
    keepalives: u32,
    /// Set by BYE or un-REGISTER; no further INVITE is sent.
    released: bool,
}

#[derive(Default)]
struct PlatformState {
    devices: HashMap<String, DeviceRecord>,
    /// RTP packets received per SSRC.
    media: HashMap<u32, u64>,
    next_ssrc: u32,
    reject_keepalives: bool,
}

#[derive(Clone)]
pub struct MockPlatform {
    sip_port: u16,
    media_port: u16,
    state: Arc<Mutex<PlatformState>>,
}

impl MockPlatform {
    pub fn start() -> Self {
        let sip = TcpListener::bind("127.0.0.1:0").unwrap();
        let media = TcpListener::bind("127.0.0.1:0").unwrap();
        let platform = MockPlatform {
            sip_port: sip.local_addr().unwrap().port(),
            media_port: media.local_addr().unwrap().port(),
            state: Arc::new(Mutex::new(PlatformState {
                next_ssrc: 100_000_001,
                ..Default::default()
            })),
        };

        let p = platform.clone();
        thread::spawn(move || {
            for stream in sip.incoming().flatten() {
                let p = p.clone();
                thread::spawn(move || p.serve_sip(stream));
            }
        });
        let p = platform.clone();
        thread::spawn(move || {
            for stream in media.incoming().flatten() {
                let p = p.clone();
                thread::spawn(move || p.serve_media(stream));
            }
        });
        platform
    }

    pub fn sip_addr(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.sip_port)
    }

    pub fn media_port(&self) -> u16 {
        self.media_port
    }

    pub fn invites(&self, device_id: &str) -> u32 {
        self.state.lock().devices.get(device_id).map_or(0, |d| d.invites)
    }

    pub fn registers(&self, device_id: &str) -> u32 {
        self.state.lock().devices.get(device_id).map_or(0, |d| d.registers)
    }

    pub fn keepalives(&self, device_id: &str) -> u32 {
        self.state.lock().devices.get(device_id).map_or(0, |d| d.keepalives)
    }

    /// Answer MESSAGE with `403 Forbidden` from now on.
    pub fn reject_keepalives(&self) {
        self.state.lock().reject_keepalives = true;
    }

    pub fn media_packets(&self, ssrc: u32) -> u64 {
        self.state.lock().media.get(&ssrc).copied().unwrap_or(0)
    }

    /// Poll until `ssrc` delivered at least `n` packets.
    pub fn wait_media(&self, ssrc: u32, n: u64, timeout: Duration) -> u64 {
        let start = Instant::now();
        loop {
            let got = self.media_packets(ssrc);
            if got >= n || start.elapsed() > timeout {
                return got;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn serve_sip(&self, stream: TcpStream) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        while let Ok(Some(msg)) = tcp::read_message(&mut reader) {
            let replies = match msg {
                SipMessage::Request(req) => self.on_request(&req),
                SipMessage::Response(res) => self.on_response(&res).into_iter().collect(),
            };
            for reply in replies {
                if writer.write_all(reply.as_bytes()).is_err() {
                    return;
                }
            }
        }
    }

    fn on_request(&self, req: &SipRequest) -> Vec<String> {
        let device_id = device_of(req);
        let ok = SipResponse::from_request(req, 200, "OK").serialize();
        let mut state = self.state.lock();
        let next_ssrc = state.next_ssrc;
        let reject_keepalives = state.reject_keepalives;
        let record = state.devices.entry(device_id.clone()).or_default();

        match req.method {
            Method::Register => {
                record.registers += 1;
                if req.headers.expires() == Some(0) {
                    record.released = true;
                    return vec![ok];
                }
                if record.released {
                    return vec![ok];
                }
                record.invites += 1;
                state.next_ssrc += 1;
                vec![ok, self.invite(&device_id, next_ssrc)]
            }
            Method::Message if reject_keepalives => {
                vec![SipResponse::from_request(req, 403, "Forbidden").serialize()]
            }
            Method::Message => {
                record.keepalives += 1;
                vec![ok]
            }
            Method::Bye => {
                record.released = true;
                vec![ok]
            }
            _ => Vec::new(),
        }
    }

    fn on_response(&self, res: &SipResponse) -> Option<String> {
        let (seq, method) = res.cseq()?;
        if method != Method::Invite || res.status_code != 200 {
            return None;
        }
        let mut ack = SipRequest::new(Method::Ack, &format!("sip:device@{DOMAIN}"));
        for name in ["Via", "From", "To", "Call-ID"] {
            if let Some(value) = res.headers.get(name) {
                ack = ack.add_header(name, value);
            }
        }
        Some(ack.add_header("CSeq", &format!("{seq} ACK")).serialize())
    }

    fn invite(&self, device_id: &str, ssrc: u32) -> String {
        let sdp = [
            "v=0".to_string(),
            format!("o={SERVER} 0 0 IN IP4 127.0.0.1"),
            "s=Play".to_string(),
            "c=IN IP4 127.0.0.1".to_string(),
            "t=0 0".to_string(),
            format!("m=video {} TCP/RTP/AVP 96", self.media_port),
            "a=rtpmap:96 PS/90000".to_string(),
            "a=recvonly".to_string(),
            format!("y=0{ssrc}"),
            String::new(),
        ]
        .join("\r\n");

        SipRequest::new(Method::Invite, &format!("sip:{device_id}@{DOMAIN}"))
            .add_header(
                "Via",
                &format!("SIP/2.0/TCP 127.0.0.1:5060;rport;branch={}", new_branch()),
            )
            .add_header("From", &format!("<sip:{SERVER}@{DOMAIN}>;tag={}", new_tag()))
            .add_header("To", &format!("<sip:{device_id}@{DOMAIN}>"))
            .add_header("Call-ID", &new_call_id())
            .add_header("CSeq", "1 INVITE")
            .add_header("Contact", &format!("<sip:{SERVER}@127.0.0.1:5060>"))
            .with_body("Application/SDP", sdp)
            .serialize()
    }

    fn serve_media(&self, mut stream: TcpStream) {
        let mut len = [0u8; 2];
        while stream.read_exact(&mut len).is_ok() {
            let mut packet = vec![0u8; u16::from_be_bytes(len) as usize];
            if stream.read_exact(&mut packet).is_err() || packet.len() < 12 {
                return;
            }
            let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
            *self.state.lock().media.entry(ssrc).or_default() += 1;
        }
    }
}

/// The user part of `From: <sip:user@domain>`.
fn device_of(req: &SipRequest) -> String {
    req.headers
        .get("From")
        .and_then(|from| from.split_once("sip:"))
        .and_then(|(_, rest)| rest.split_once('@'))
        .map(|(user, _)| user.to_string())
        .unwrap_or_default()
}

pub fn sip_config(platform: &MockPlatform) -> SipConfig {
    SipConfig::new(&platform.sip_addr(), DOMAIN, USER, 10, SERVER)
}

pub fn device(sip_config: SipConfig) -> GbSession {
    let mut session = GbSession::new(
        GbSessionConfig {
            reg_timeout: Duration::from_secs(5),
            invite_timeout: Duration::from_secs(5),
        },
        sip_config,
    );
    session.set_heartbeat_interval(HEARTBEAT_INTERVAL);
    session
}

/// Connect, register and accept the INVITE.
pub fn handshake(session: &mut GbSession, scope: &Scope) -> Result<()> {
    session.connect(scope).context("connect")?;
    session.register(scope).context("register")?;
    session.invite(scope).context("invite")?;
    Ok(())
}

/// Write an H.264 file of `access_units` and an AAC file of `frames`.
pub fn media_files(dir: &Path, access_units: usize, frames: usize) -> PsConfig {
    let video = dir.join("avatar.h264");
    let mut f = File::create(&video).unwrap();
    let idr: &[&[u8]] = &[
        &[0x67, 0x42, 0x00, 0x1f],
        &[0x68, 0xce, 0x3c, 0x80],
        &[0x65, 0x88, 0x84, 0x00],
    ];
    for nal in idr {
        f.write_all(&[0, 0, 0, 1]).unwrap();
        f.write_all(nal).unwrap();
    }
    for _ in 1..access_units {
        f.write_all(&[0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x03]).unwrap();
    }

    let audio = dir.join("avatar.aac");
    let mut f = File::create(&audio).unwrap();
    // AAC LC, 44.1 kHz, stereo, 7-byte header and 64 bytes of payload.
    let frame_length = 7 + 64;
    let header = [
        0xFF,
        0xF1,
        (1 << 6) | (4 << 2),
        (2 << 6) | ((frame_length >> 11) & 0x03) as u8,
        ((frame_length >> 3) & 0xFF) as u8,
        (((frame_length & 0x07) << 5) as u8) | 0x1F,
        0xFC,
    ];
    for _ in 0..frames {
        f.write_all(&header).unwrap();
        f.write_all(&[0x21; 64]).unwrap();
    }

    PsConfig {
        video,
        audio,
        fps: 25,
    }
}
