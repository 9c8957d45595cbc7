//! Two media sessions exchanging audio over loopback without ICE.

use lark_media::{
    CollectSink, MediaConfig, MediaSession, SessionEvent, SessionState, ToneSource, TransportMode,
};
use std::time::{Duration, Instant};

fn drive(session: &mut MediaSession) {
    session.tick(Duration::from_millis(5)).unwrap();
}

fn wait_for_sdp(session: &mut MediaSession) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        drive(session);

        while let Some(event) = session.pop_event() {
            if let SessionEvent::SdpReady(sdp) = event {
                return sdp;
            }
        }

        assert!(Instant::now() < deadline, "no SDP within 5s");
    }
}

/// Rewrite the advertised connection address to loopback so the test does
/// not depend on routable host interfaces
fn to_loopback(sdp: &str) -> String {
    let mut out = String::new();

    for line in sdp.lines() {
        if line.starts_with("c=IN IP4 ") {
            out.push_str("c=IN IP4 127.0.0.1");
        } else if line.starts_with("o=") {
            out.push_str("o=- 1 1 IN IP4 127.0.0.1");
        } else {
            out.push_str(line);
        }

        out.push_str("\r\n");
    }

    out
}

#[test]
fn audio_flows_between_direct_sessions() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut caller = MediaSession::new(MediaConfig::default());
    let mut callee = MediaSession::new(MediaConfig {
        jitter_buffer_ms: 0,
        ..MediaConfig::default()
    });

    caller.set_capture_device(Box::new(ToneSource::new(8000, 440.0)));

    let (sink, received_frames) = CollectSink::new();
    callee.set_playback_device(Box::new(sink));

    // caller gathers and produces the offer
    caller.gather().unwrap();
    let offer = to_loopback(&wait_for_sdp(&mut caller));

    // strip ICE attributes to force direct RTP on the callee side
    let offer: String = offer
        .lines()
        .filter(|line| !line.starts_with("a=ice-") && !line.starts_with("a=candidate:"))
        .map(|line| format!("{line}\r\n"))
        .collect();

    callee.set_remote_sdp(&offer).unwrap();
    assert_eq!(callee.transport_mode(), Some(TransportMode::RtpDirect));

    callee.gather().unwrap();
    let answer = to_loopback(&wait_for_sdp(&mut callee));

    caller.set_remote_sdp(&answer).unwrap();
    assert_eq!(caller.transport_mode(), Some(TransportMode::RtpDirect));

    caller.start().unwrap();
    callee.start().unwrap();

    assert_eq!(caller.state(), SessionState::Connected);
    assert_eq!(callee.state(), SessionState::Connected);

    // pump both sessions until audio arrived at the callee
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        drive(&mut caller);
        drive(&mut callee);

        if !received_frames.lock().unwrap().is_empty() {
            break;
        }

        assert!(Instant::now() < deadline, "no audio within 10s");
    }

    let frames = received_frames.lock().unwrap();

    // decoded tone frames must carry signal
    assert!(frames[0].1.iter().any(|&sample| sample != 0));

    // counters moved on both ends
    assert!(caller.stats().tx_packets > 0);
    assert!(callee.stats().rx_packets > 0);
}

#[test]
fn sdp_ready_fires_exactly_once() {
    let mut session = MediaSession::new(MediaConfig::default());

    session.gather().unwrap();
    wait_for_sdp(&mut session);

    // keep ticking well past the gathering phase
    for _ in 0..20 {
        drive(&mut session);

        while let Some(event) = session.pop_event() {
            assert!(
                !matches!(event, SessionEvent::SdpReady(_)),
                "second SdpReady emitted"
            );
        }
    }

    assert_eq!(session.state(), SessionState::Gathered);
    assert!(session.local_sdp().is_some());
}
