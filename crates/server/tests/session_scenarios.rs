//! End-to-end session scenarios against an in-memory telephony leg and a
//! scripted backend, on a paused clock.

mod common;

use std::time::Duration;

use common::{settle, GatedTenants, Harness, Written};
use voice_relay_backend::Upstream;
use voice_relay_core::{InboundMessage, OutboundMessage, Role, SessionState, TerminationCause};
use voice_relay_server::TranscriptRecord;

/// 40ms of 24kHz backend audio; becomes exactly one 640-byte telephony frame
const BACKEND_FRAME: usize = 1920;

/// 20ms of 24kHz backend audio; half a telephony frame
const SHORT_BACKEND_FRAME: usize = 960;

/// The first caller frame resamples to 1276 bytes, four short of a chunk
const FIRST_CALLER_TAIL: usize = 1276;

fn upstream_audio(sent: Vec<Upstream>) -> Vec<(u64, usize)> {
    sent.into_iter()
        .filter_map(|u| match u {
            Upstream::Audio(frame) => Some((frame.sequence(), frame.len())),
            _ => None,
        })
        .collect()
}

fn telephony_audio(written: &[Written]) -> usize {
    written
        .iter()
        .filter(|w| matches!(w, Written::Message(OutboundMessage::Audio(_))))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_caller_turn_then_whole_assistant_turn() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;
    call.wait_for_state(SessionState::Active).await;

    // Caller speaks three frames
    for _ in 0..3 {
        call.phone.audio();
    }
    let mut forwarded = Vec::new();
    for _ in 0..2 {
        match backend.next_sent().await {
            Some(Upstream::Audio(frame)) => forwarded.push((frame.sequence(), frame.len())),
            other => panic!("expected caller audio, got {:?}", other),
        }
    }
    assert_eq!(forwarded, vec![(0, 1280), (1, 1280)]);

    // Silence: the partial chunk goes out and the floor returns to idle
    match backend.next_sent().await {
        Some(Upstream::Audio(frame)) => {
            assert_eq!(frame.sequence(), 2);
            assert!(frame.len() < 1280);
        }
        other => panic!("expected tail frame, got {:?}", other),
    }

    // Assistant audio is buffered until the boundary
    backend.audio(vec![0u8; BACKEND_FRAME], 24000);
    backend.audio(vec![0u8; BACKEND_FRAME], 24000);
    settle().await;
    assert_eq!(telephony_audio(&call.phone.drain()), 0);

    backend.turn_complete();
    for _ in 0..2 {
        match call.phone.next_non_keepalive().await {
            Some(Written::Message(OutboundMessage::Audio(frame))) => assert_eq!(frame.len(), 640),
            other => panic!("expected assistant audio, got {:?}", other),
        }
    }
    settle().await;
    assert_eq!(telephony_audio(&call.phone.drain()), 0);

    // The floor is free again: new caller audio goes straight through
    call.phone.audio();
    match backend.next_sent().await {
        Some(Upstream::Audio(frame)) => assert_eq!(frame.sequence(), 3),
        other => panic!("expected caller audio, got {:?}", other),
    }

    call.phone.hang_up();
    let summary = call.handle.await.unwrap();
    assert_eq!(summary.cause, TerminationCause::TelephonyDisconnect);
    assert_eq!(summary.final_state, SessionState::Closed);
    assert_eq!(summary.frames.to_backend, 4);
    assert_eq!(summary.frames.to_telephony, 2);
    assert_eq!(summary.call_id.as_deref(), Some("call-1"));
}

#[tokio::test(start_paused = true)]
async fn test_caller_audio_held_behind_assistant_turn() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;

    backend.audio(vec![0u8; BACKEND_FRAME], 24000);
    settle().await;

    // Caller barges in while the assistant holds the floor
    call.phone.audio();
    call.phone.audio();
    settle().await;
    assert!(upstream_audio(backend.drain_sent()).is_empty());

    backend.turn_complete();
    match backend.next_sent().await {
        Some(Upstream::Audio(frame)) => assert_eq!(frame.sequence(), 0),
        other => panic!("expected released caller audio, got {:?}", other),
    }
    // The assistant turn reached the caller before the held audio moved on
    assert_eq!(telephony_audio(&call.phone.drain()), 1);

    call.phone.hang_up();
    call.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_short_first_assistant_frame_takes_floor() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;
    call.wait_for_state(SessionState::Active).await;

    backend.audio(vec![0u8; SHORT_BACKEND_FRAME], 24000);
    settle().await;

    call.phone.audio();
    call.phone.audio();
    settle().await;
    assert!(upstream_audio(backend.drain_sent()).is_empty());

    // The short turn goes out as one frame below the chunk size
    backend.turn_complete();
    match call.phone.next_non_keepalive().await {
        Some(Written::Message(OutboundMessage::Audio(frame))) => {
            assert!(!frame.is_empty() && frame.len() < 640, "got {} bytes", frame.len())
        }
        other => panic!("expected assistant audio, got {:?}", other),
    }

    // Held audio is released, then the caller keeps the floor until silence
    match backend.next_sent().await {
        Some(Upstream::Audio(frame)) => assert_eq!((frame.sequence(), frame.len()), (0, 1280)),
        other => panic!("expected released caller audio, got {:?}", other),
    }
    match backend.next_sent().await {
        Some(Upstream::Audio(frame)) => {
            assert_eq!((frame.sequence(), frame.len()), (1, FIRST_CALLER_TAIL))
        }
        other => panic!("expected caller tail after silence, got {:?}", other),
    }

    call.phone.hang_up();
    let summary = call.handle.await.unwrap();
    assert_eq!(summary.frames.to_backend, 2);
}

#[tokio::test(start_paused = true)]
async fn test_caller_tail_released_after_assistant_turn() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;

    backend.audio(vec![0u8; BACKEND_FRAME], 24000);
    settle().await;

    // Half a backend chunk while the assistant holds the floor
    call.phone.audio();
    settle().await;
    assert!(upstream_audio(backend.drain_sent()).is_empty());

    backend.turn_complete();
    match backend.next_sent().await {
        Some(Upstream::Audio(frame)) => {
            assert_eq!((frame.sequence(), frame.len()), (0, FIRST_CALLER_TAIL))
        }
        other => panic!("expected the caller tail, got {:?}", other),
    }
    assert_eq!(telephony_audio(&call.phone.drain()), 1);

    call.phone.hang_up();
    call.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_short_utterance_is_sent_after_silence() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;
    call.wait_for_state(SessionState::Active).await;

    let spoke = tokio::time::Instant::now();
    call.phone.audio();
    match backend.next_sent().await {
        Some(Upstream::Audio(frame)) => assert_eq!(frame.len(), FIRST_CALLER_TAIL),
        other => panic!("expected the caller tail, got {:?}", other),
    }
    assert_eq!(spoke.elapsed(), Duration::from_millis(500));

    call.phone.hang_up();
    call.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_caller_tail_forwarded_on_hang_up() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;

    call.phone.audio();
    call.phone.send(InboundMessage::Stop {
        reason: Some("callended".to_string()),
    });

    match backend.next_sent().await {
        Some(Upstream::Audio(frame)) => {
            assert_eq!((frame.sequence(), frame.len()), (0, FIRST_CALLER_TAIL))
        }
        other => panic!("expected the caller tail, got {:?}", other),
    }
    assert!(matches!(backend.next_sent().await, Some(Upstream::Closed)));

    let summary = call.handle.await.unwrap();
    assert_eq!(summary.cause, TerminationCause::TelephonyDisconnect);
    assert_eq!(summary.frames.to_backend, 1);
}

#[tokio::test(start_paused = true)]
async fn test_backend_drop_reconnects_once_and_resumes() {
    let harness = Harness::new();
    let mut first = harness.connector.accept_next();
    let mut second = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;
    call.wait_for_state(SessionState::Active).await;

    // Drop in the middle of an assistant turn
    first.audio(vec![0u8; BACKEND_FRAME], 24000);
    settle().await;
    first.disconnect();

    // The partial turn is flushed once the new connection is up
    match call.phone.next_non_keepalive().await {
        Some(Written::Message(OutboundMessage::Audio(_))) => {}
        other => panic!("expected flushed assistant audio, got {:?}", other),
    }
    assert_eq!(harness.connector.connects(), 2);
    assert_eq!(harness.connector.tenants(), vec!["acme", "acme"]);
    assert_eq!(call.state(), SessionState::Active);
    assert!(matches!(first.drain_sent().last(), Some(Upstream::Closed)));

    // Caller audio flows to the new connection
    call.phone.audio();
    call.phone.audio();
    match second.next_sent().await {
        Some(Upstream::Audio(_)) => {}
        other => panic!("expected caller audio on the new connection, got {:?}", other),
    }

    call.phone.hang_up();
    let summary = call.handle.await.unwrap();
    assert_eq!(summary.cause, TerminationCause::TelephonyDisconnect);
    assert_eq!(summary.backend_reconnects, 1);
    assert!(call
        .phone
        .drain()
        .iter()
        .all(|w| !matches!(w, Written::Message(OutboundMessage::Status { .. }))));
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_closes_with_terminal_notice() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    harness.connector.refuse_next("service down");
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;
    backend.disconnect();

    match call.phone.next_non_keepalive().await {
        Some(Written::Message(OutboundMessage::Terminal { code, .. })) => {
            assert_eq!(code, "backend_unavailable")
        }
        other => panic!("expected terminal notice, got {:?}", other),
    }
    assert!(matches!(call.phone.next_non_keepalive().await, Some(Written::Closed)));

    let summary = call.handle.await.unwrap();
    assert!(matches!(summary.cause, TerminationCause::BackendUnavailable(_)));
    assert_eq!(summary.final_state, SessionState::Closed);
    assert_eq!(harness.connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_drop_is_final() {
    let harness = Harness::new();
    let mut first = harness.connector.accept_next();
    let mut second = harness.connector.accept_next();
    let _unused = harness.connector.accept_next();
    let call = harness.call("acme");

    call.phone.start();
    settle().await;
    first.disconnect();
    settle().await;
    assert_eq!(harness.connector.connects(), 2);

    second.disconnect();
    let summary = call.handle.await.unwrap();
    assert!(matches!(summary.cause, TerminationCause::BackendUnavailable(_)));
    assert_eq!(summary.backend_reconnects, 1);
    assert_eq!(harness.connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_leg_gets_one_keepalive_per_idle_period() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;

    assert!(matches!(
        call.phone.next().await,
        Some(Written::Message(OutboundMessage::KeepAlive))
    ));

    // Still idle, but the period is already covered
    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert!(call.phone.drain().is_empty());

    // Real audio resets the timer
    backend.audio(vec![0u8; BACKEND_FRAME], 24000);
    backend.turn_complete();
    assert!(matches!(
        call.phone.next().await,
        Some(Written::Message(OutboundMessage::Audio(_)))
    ));
    assert!(matches!(
        call.phone.next().await,
        Some(Written::Message(OutboundMessage::KeepAlive))
    ));

    call.phone.hang_up();
    let summary = call.handle.await.unwrap();
    assert_eq!(summary.keepalives_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_keepalive_is_idle_timeout() {
    let harness = Harness::new();
    let _backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;
    call.phone.break_writes();

    let summary = call.handle.await.unwrap();
    assert_eq!(summary.cause, TerminationCause::IdleTimeout);
    assert_eq!(summary.final_state, SessionState::Closed);
    assert!(matches!(call.phone.next().await, Some(Written::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_greeting_is_first_turn() {
    let harness = Harness::new();
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("greeter");

    call.phone.start();
    call.phone.expect_connected().await;

    match backend.next_sent().await {
        Some(Upstream::Text(text)) => assert_eq!(text, "Say hello to the caller."),
        other => panic!("expected greeting turn, got {:?}", other),
    }
    assert_eq!(call.state(), SessionState::Greeting);

    // Caller audio during the greeting waits for it
    call.phone.audio();
    call.phone.audio();
    settle().await;
    assert!(upstream_audio(backend.drain_sent()).is_empty());

    backend.audio(vec![0u8; BACKEND_FRAME], 24000);
    backend.turn_complete();
    call.wait_for_state(SessionState::Active).await;
    match backend.next_sent().await {
        Some(Upstream::Audio(_)) => {}
        other => panic!("expected held caller audio, got {:?}", other),
    }
    assert_eq!(telephony_audio(&call.phone.drain()), 1);

    call.phone.hang_up();
    call.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tenant_fails_setup() {
    let mut harness = Harness::new();
    let tenants = GatedTenants::new(harness.tenants.clone());
    let mut call = harness.call_with_tenants("ghost", tenants.clone());

    // The lookup runs before HANDSHAKE
    call.phone.start();
    settle().await;
    assert_eq!(call.state(), SessionState::Init);
    assert!(!call.state.has_changed().unwrap());

    tenants.release();
    let summary = harness.summary().await;
    assert!(matches!(summary.cause, TerminationCause::SetupFailed(_)));
    assert_eq!(summary.final_state, SessionState::Error);
    assert_eq!(harness.connector.connects(), 0);

    match call.phone.next().await {
        Some(Written::Message(OutboundMessage::Terminal { code, .. })) => {
            assert_eq!(code, "setup_failed")
        }
        other => panic!("expected terminal notice, got {:?}", other),
    }
    assert!(matches!(call.phone.next().await, Some(Written::Closed)));
    assert_eq!(call.state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_refused_handshake_is_not_retried() {
    let harness = Harness::new();
    harness.connector.refuse_next("bad key");
    let call = harness.call("acme");

    call.phone.start();
    let summary = call.handle.await.unwrap();
    assert!(matches!(summary.cause, TerminationCause::SetupFailed(_)));
    assert_eq!(harness.connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_before_start() {
    let harness = Harness::new();
    let mut call = harness.call("acme");

    call.phone.hang_up();
    let summary = call.handle.await.unwrap();
    assert_eq!(summary.cause, TerminationCause::TelephonyDisconnect);
    assert_eq!(summary.final_state, SessionState::Closed);
    assert_eq!(harness.connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_start_proceeds_without_stream_id() {
    let harness = Harness::new();
    let _backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    // No start message: the session continues after the start timeout
    call.phone.expect_connected().await;
    assert_eq!(harness.connector.connects(), 1);

    call.phone.hang_up();
    let summary = call.handle.await.unwrap();
    assert_eq!(summary.call_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_known_tenant_enters_handshake_after_lookup() {
    let harness = Harness::new();
    let _backend = harness.connector.accept_next();
    let tenants = GatedTenants::new(harness.tenants.clone());
    let mut call = harness.call_with_tenants("acme", tenants.clone());

    call.phone.start();
    settle().await;
    assert_eq!(call.state(), SessionState::Init);
    assert_eq!(harness.connector.connects(), 0);

    tenants.release();
    call.phone.expect_connected().await;
    assert_eq!(harness.connector.connects(), 1);

    call.phone.hang_up();
    call.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_max_call_duration_says_goodbye_first() {
    let mut harness = Harness::new();
    harness.settings.session.max_call_duration_secs = 5;
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;
    let connected = tokio::time::Instant::now();

    match backend.next_sent().await {
        Some(Upstream::Text(text)) => {
            assert!(text.contains("maximum call duration"), "{}", text)
        }
        other => panic!("expected the exit message turn, got {:?}", other),
    }
    assert_eq!(connected.elapsed(), Duration::from_secs(5));
    assert_eq!(call.state(), SessionState::Active);

    backend.audio(vec![0u8; BACKEND_FRAME], 24000);
    backend.turn_complete();
    match call.phone.next_non_keepalive().await {
        Some(Written::Message(OutboundMessage::Audio(_))) => {}
        other => panic!("expected the spoken exit message, got {:?}", other),
    }
    match call.phone.next_non_keepalive().await {
        Some(Written::Message(OutboundMessage::Terminal { code, .. })) => {
            assert_eq!(code, "max_duration_exceeded")
        }
        other => panic!("expected terminal notice, got {:?}", other),
    }
    assert!(matches!(call.phone.next_non_keepalive().await, Some(Written::Closed)));

    let summary = call.handle.await.unwrap();
    assert_eq!(summary.cause, TerminationCause::MaxDurationExceeded);
    assert_eq!(summary.final_state, SessionState::Closed);
    // Hung up as soon as the message was played, well inside the grace
    assert!(connected.elapsed() < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_silent_backend_hangs_up_after_exit_grace() {
    let mut harness = Harness::new();
    harness.settings.session.caller_inactivity_secs = 2;
    let mut backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;
    let connected = tokio::time::Instant::now();

    // The caller has been speaking Hindi
    backend.transcript(Role::Caller, "नमस्ते, क्या आप मेरी मदद करेंगे");
    settle().await;

    match backend.next_sent().await {
        Some(Upstream::Text(text)) => assert!(text.contains("मिनट"), "{}", text),
        other => panic!("expected the exit message turn, got {:?}", other),
    }

    let summary = call.handle.await.unwrap();
    assert_eq!(summary.cause, TerminationCause::CallerInactive);
    assert_eq!(connected.elapsed(), Duration::from_secs(2 + 3));
}

#[tokio::test(start_paused = true)]
async fn test_zero_exit_grace_hangs_up_at_once() {
    let mut harness = Harness::new();
    harness.settings.session.max_call_duration_secs = 5;
    harness.settings.session.exit_grace_ms = 0;
    let mut backend = harness.connector.accept_next();
    let call = harness.call("acme");

    call.phone.start();
    let summary = call.handle.await.unwrap();
    assert_eq!(summary.cause, TerminationCause::MaxDurationExceeded);
    assert!(backend
        .drain_sent()
        .iter()
        .all(|u| !matches!(u, Upstream::Text(_))));
}

#[tokio::test(start_paused = true)]
async fn test_token_usage_is_summed_per_call() {
    let harness = Harness::new();
    let backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;

    backend.usage(100, 20);
    backend.usage(30, 10);
    settle().await;

    call.phone.hang_up();
    let summary = call.handle.await.unwrap();
    assert_eq!(summary.usage.prompt_tokens, 130);
    assert_eq!(summary.usage.response_tokens, 30);
    assert_eq!(summary.usage.total_tokens, 160);
    assert!(!summary.forced);
}

#[tokio::test(start_paused = true)]
async fn test_transcripts_are_published_in_order() {
    let mut harness = Harness::new();
    let backend = harness.connector.accept_next();
    let mut call = harness.call("acme");

    call.phone.start();
    call.phone.expect_connected().await;

    backend.transcript(Role::Caller, "I want to ");
    backend.transcript(Role::Caller, "check my balance");
    backend.transcript(Role::Assistant, "Sure.");
    backend.turn_complete();
    settle().await;
    call.phone.hang_up();
    call.handle.await.unwrap();

    let mut utterances = Vec::new();
    let mut sequences = Vec::new();
    while let Ok(record) = harness.transcripts.try_recv() {
        match record {
            TranscriptRecord::Event(event) => {
                sequences.push(event.sequence);
                if event.terminal {
                    utterances.push((event.role, event.text));
                }
            }
            TranscriptRecord::Summary(summary) => assert_eq!(summary.transcript_events, 5),
        }
    }
    assert_eq!(sequences, (0..5).collect::<Vec<u64>>());
    assert_eq!(
        utterances,
        vec![
            (Role::Caller, "I want to check my balance".to_string()),
            (Role::Assistant, "Sure.".to_string()),
        ]
    );
}
