//! Device scenarios against an in-process platform: handshake, dropped
//! handshake steps followed by a reconnect, BYE, un-REGISTER and PS
//! publishing.

mod support;

use std::sync::Arc;
use std::time::Duration;

use gb28181::protocol::Method;
use gb28181::transport::build_media_addr;
use gb28181::{
    DeviceState, GbError, GbSession, IngestStop, IngesterConfig, PsIngester, Scope, SessionEvent,
    filter_errors,
};
use parking_lot::Mutex;
use support::{CASE_TIMEOUT, MockPlatform, NO_INVITE_WINDOW};
use tempfile::TempDir;

/// Block until the heartbeat reported `n` answered keepalives.
fn wait_heartbeats(session: &GbSession, n: u64) {
    let events = session.events();
    loop {
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            SessionEvent::Heartbeat { count, .. } if count >= n => return,
            SessionEvent::Heartbeat { .. } => {}
            SessionEvent::HeartbeatStopped { error } => panic!("heartbeat stopped: {error:?}"),
        }
    }
}

/// Publish from `session` until `stop_after` packs were sent. `on_last`
/// runs in the ingest thread right before it stops.
fn publish(
    session: &GbSession,
    dir: &TempDir,
    scope: &Scope,
    stop_after: usize,
    mut on_last: impl FnMut() -> gb28181::Result<()> + Send + 'static,
) -> gb28181::Result<(IngestStop, usize)> {
    let out = session.output().clone();
    let mut ingester = PsIngester::new(IngesterConfig {
        ps: support::media_files(dir.path(), 500, 2000),
        ssrc: out.ssrc,
        server_addr: build_media_addr(&session.sip_config().addr, out.media_port)?,
        clock_rate: out.clock_rate,
        payload_type: out.payload_type,
    });

    let run = scope.child();
    let stop = run.clone();
    let sent = Arc::new(Mutex::new(0usize));
    let counter = sent.clone();
    ingester.on_send_packet(move |_| {
        let mut n = counter.lock();
        *n += 1;
        if *n == stop_after {
            on_last()?;
            stop.cancel();
        }
        Ok(())
    });

    let (stop, _) = ingester.ingest(&run)?;
    let n = *sent.lock();
    Ok((stop, n))
}

#[test]
fn session_handshake() {
    let platform = MockPlatform::start();
    let scope = Scope::timeout(CASE_TIMEOUT);

    let mut session = support::device(support::sip_config(&platform));
    support::handshake(&mut session, &scope).unwrap();
    assert_eq!(session.state(), DeviceState::Steady);
    assert_eq!(session.output().media_port, platform.media_port());
    assert_eq!(session.output().ssrc, 100_000_001);

    wait_heartbeats(&session, 3);
    session.stop_heartbeat();
    let err = session.heartbeat_scope().unwrap().wait();
    assert!(filter_errors([Err(err)]).is_ok());

    let device_id = session.sip_config().device_id().to_string();
    assert_eq!(device_id.len(), support::USER.len() + 10);
    assert!(platform.keepalives(&device_id) >= 3);
    session.close();
    assert_eq!(session.state(), DeviceState::Terminating);
}

#[test]
fn handshake_steps_are_bounded_by_caller_scope() {
    let platform = MockPlatform::start();
    let mut session = support::device(support::sip_config(&platform));
    let scope = Scope::timeout(CASE_TIMEOUT);
    session.connect(&scope).unwrap();
    session.register(&scope).unwrap();
    // The INVITE is queued already; an ended scope must still win.
    let ended = scope.child();
    ended.cancel();
    let err = session.invite(&ended).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(session.state(), DeviceState::Registered);
}

/// The device disappears at some step, then restarts with the same
/// identity and must get a fresh INVITE.
fn drop_then_reconnect(arm: impl FnOnce(&mut GbSession, Scope)) {
    let platform = MockPlatform::start();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let sip_config = support::sip_config(&platform);
    let device_id = sip_config.device_id().to_string();

    let r0 = {
        let mut session = support::device(sip_config.clone());
        let dropped = scope.child();
        arm(&mut session, dropped.clone());
        support::handshake(&mut session, &dropped)
    };
    assert!(r0.as_ref().is_err_and(GbError::is_cancelled), "{r0:?}");

    let r1 = {
        let mut session = support::device(sip_config);
        support::handshake(&mut session, &scope)
    };
    filter_errors([r0, r1]).unwrap();
    assert_eq!(platform.invites(&device_id), 2);
}

#[test]
fn drop_register_ok() {
    drop_then_reconnect(|session, dropped| {
        session.on_register_done(move |_, _| {
            dropped.cancel();
            Ok(())
        });
    });
}

#[test]
fn drop_invite_request() {
    drop_then_reconnect(|session, dropped| {
        session.on_invite_request(move |_| {
            dropped.cancel();
            Ok(())
        });
    });
}

#[test]
fn drop_invite_ok_ack() {
    drop_then_reconnect(|session, dropped| {
        session.on_invite_ok_ack(move |_, _| {
            dropped.cancel();
            Ok(())
        });
    });
}

#[test]
fn cancelled_after_ack_can_invite_again() {
    let platform = MockPlatform::start();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let mut session = support::device(support::sip_config(&platform));
    session.connect(&scope).unwrap();
    session.register(&scope).unwrap();

    let step = scope.child();
    let cancel = step.clone();
    session.on_invite_ok_ack(move |_, _| {
        cancel.cancel();
        Ok(())
    });
    let err = session.invite(&step).unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(session.state(), DeviceState::Registered);
    assert!(session.heartbeat_scope().is_none());

    // Back in Registered, so the next invite waits for an offer.
    let err = session
        .invite(&scope.with_timeout(Duration::from_millis(200)))
        .unwrap_err();
    assert!(err.is_deadline_exceeded(), "{err}");
}

#[test]
fn failing_hook_fails_the_step() {
    let platform = MockPlatform::start();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let mut session = support::device(support::sip_config(&platform));
    session.on_register_done(|_, _| Err(GbError::Callback("reject".to_string())));

    let err = support::handshake(&mut session, &scope).unwrap_err();
    assert!(matches!(err.root(), GbError::Callback(_)));
    assert!(err.to_string().ends_with("reject"), "{err}");
}

#[test]
fn rejected_heartbeat_terminates_session() {
    let platform = MockPlatform::start();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let mut session = support::device(support::sip_config(&platform));
    support::handshake(&mut session, &scope).unwrap();
    wait_heartbeats(&session, 1);
    platform.reject_keepalives();

    let events = session.events();
    let error = loop {
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            SessionEvent::HeartbeatStopped { error } => break error,
            SessionEvent::Heartbeat { .. } => {}
        }
    };
    assert!(error.unwrap().contains("403"));
    assert_eq!(session.state(), DeviceState::Terminating);

    let sip = session.sip_session().unwrap();
    let err = sip.scope().check().unwrap_err();
    assert!(matches!(err, GbError::Transport(ref r) if r.starts_with("heartbeat")));
    assert!(session.bye(&scope).is_err());
}

#[test]
fn session_bye() {
    let platform = MockPlatform::start();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let mut session = support::device(support::sip_config(&platform));
    support::handshake(&mut session, &scope).unwrap();

    wait_heartbeats(&session, 3);
    session.bye(&scope).unwrap();

    let err = session
        .wait_request(&scope.with_timeout(NO_INVITE_WINDOW), Method::Invite)
        .unwrap_err();
    assert!(err.is_deadline_exceeded(), "should not invite after bye: {err}");
}

#[test]
fn session_unregister() {
    let platform = MockPlatform::start();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let mut session = support::device(support::sip_config(&platform));
    support::handshake(&mut session, &scope).unwrap();

    wait_heartbeats(&session, 3);
    session.unregister(&scope).unwrap();

    let err = session
        .wait_request(&scope.with_timeout(NO_INVITE_WINDOW), Method::Invite)
        .unwrap_err();
    assert!(err.is_deadline_exceeded(), "should not invite after unregister: {err}");
    let device_id = session.sip_config().device_id().to_string();
    assert_eq!(platform.registers(&device_id), 2);
}

#[test]
fn publish_reaches_platform() {
    let platform = MockPlatform::start();
    let dir = TempDir::new().unwrap();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let mut session = support::device(support::sip_config(&platform));
    support::handshake(&mut session, &scope).unwrap();

    let (stop, packs) = publish(&session, &dir, &scope, 10, || Ok(())).unwrap();
    assert_eq!(stop, IngestStop::ScopeEnded);
    assert_eq!(packs, 10);

    let ssrc = session.output().ssrc;
    assert!(platform.wait_media(ssrc, 10, Duration::from_secs(2)) >= 10);
}

#[test]
fn publish_then_reconnect_is_reinvited() {
    let platform = MockPlatform::start();
    let dir = TempDir::new().unwrap();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let sip_config = support::sip_config(&platform);

    {
        let mut session = support::device(sip_config.clone());
        support::handshake(&mut session, &scope).unwrap();
        publish(&session, &dir, &scope, 3, || Ok(())).unwrap();
    }

    let mut session = support::device(sip_config);
    session.connect(&scope).unwrap();
    session.register(&scope).unwrap();
    let invite = session.wait_request(&scope, Method::Invite).unwrap();
    assert!(invite.body.contains("m=video"));
}

/// Publish, release the dialog from inside the ingest loop with
/// `release`, then reconnect and expect silence.
fn publish_release_then_reconnect(release: fn(&gb28181::SipSession, &Scope) -> gb28181::Result<()>) {
    let platform = MockPlatform::start();
    let dir = TempDir::new().unwrap();
    let scope = Scope::timeout(CASE_TIMEOUT);
    let sip_config = support::sip_config(&platform);

    {
        let mut session = support::device(sip_config.clone());
        support::handshake(&mut session, &scope).unwrap();
        let sip = session.sip_session().unwrap().clone();
        let release_scope = scope.clone();
        let (stop, _) = publish(&session, &dir, &scope, 10, move || release(&sip, &release_scope)).unwrap();
        assert_eq!(stop, IngestStop::ScopeEnded);
    }

    let mut session = support::device(sip_config);
    session.connect(&scope).unwrap();
    session.register(&scope).unwrap();
    let err = session
        .wait_request(&scope.with_timeout(NO_INVITE_WINDOW), Method::Invite)
        .unwrap_err();
    assert!(err.is_deadline_exceeded(), "should not invite after release: {err}");
}

#[test]
fn publish_bye() {
    publish_release_then_reconnect(|sip, scope| sip.bye(scope).map(|_| ()));
}

#[test]
fn publish_unregister() {
    publish_release_then_reconnect(|sip, scope| sip.unregister(scope).map(|_| ()));
}
