use std::time::Duration;

use protocol::{Codec, Msg, parse_msg};

use super::*;
use crate::error::HandlerError;
use crate::transport::{MemoryPeer, memory_pair};

const WAIT: Duration = Duration::from_secs(2);

fn quiet_config() -> SockConfig {
    SockConfig { heartbeat_interval: Duration::ZERO, ..SockConfig::default() }
}

fn test_sock(handlers: Handlers) -> Sock {
    Sock::new(handlers, quiet_config())
}

async fn next_out(peer: &mut MemoryPeer) -> Outbound {
    tokio::time::timeout(WAIT, peer.recv())
        .await
        .expect("timed out waiting for socket output")
        .expect("socket side dropped")
}

async fn next_unit(peer: &mut MemoryPeer) -> Unit {
    match next_out(peer).await {
        Outbound::Unit(unit) => unit,
        other => panic!("expected a unit, got {other:?}"),
    }
}

async fn next_msg(peer: &mut MemoryPeer) -> (Msg, Vec<u8>) {
    let unit = next_unit(peer).await;
    let msg = parse_msg(&unit).expect("valid header");
    let payload = if msg.expects_payload() { next_unit(peer).await.into_bytes() } else { Vec::new() };
    (msg, payload)
}

async fn next_event(events: &mut broadcast::Receiver<SockEvent>) -> SockEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_close(events: &mut broadcast::Receiver<SockEvent>) -> Option<SockError> {
    loop {
        if let SockEvent::Close(err) = next_event(events).await {
            return err;
        }
    }
}

/// Attach an in-memory transport and answer the version handshake.
async fn connect(sock: &Sock) -> MemoryPeer {
    let (transport, mut peer) = memory_pair();
    sock.adopt(transport).expect("adopt");
    assert_eq!(next_unit(&mut peer).await, Unit::Binary(b"01".to_vec()));
    peer.send(Unit::Binary(b"01".to_vec()));
    peer
}

#[allow(clippy::cast_possible_truncation)]
fn peer_send(peer: &MemoryPeer, t: MsgType, id: Option<&str>, name: Option<&str>, wait: u32, payload: &[u8]) {
    let header = Codec::Binary.make_msg(t, id, name, wait, payload.len() as u32).expect("header");
    peer.send(header);
    if !payload.is_empty() {
        peer.send(Unit::Binary(payload.to_vec()));
    }
}

// =============================================================================
// IDS
// =============================================================================

#[test]
fn base36_is_zero_padded_lowercase() {
    assert_eq!(base36(0, 4), "0000");
    assert_eq!(base36(35, 4), "000z");
    assert_eq!(base36(36, 4), "0010");
    assert_eq!(base36(SINGLE_ID_SPACE - 1, 4), "zzzz");
    assert_eq!(base36(46_655, 3), "zzz");
}

#[test]
fn single_ids_wrap_and_skip_pending() {
    let mut state = State::new(quiet_config());
    state.next_op_id = SINGLE_ID_SPACE - 1;
    assert_eq!(state.alloc_single_id().as_deref(), Ok("zzzz"));

    let (tx, _rx) = oneshot::channel();
    state.pending.insert("0000".into(), Pending::Single(tx));
    assert_eq!(state.alloc_single_id().as_deref(), Ok("0001"));
}

#[test]
fn stream_ids_carry_prefix_and_wrap() {
    let mut state = State::new(quiet_config());
    assert_eq!(state.alloc_stream_id().as_deref(), Ok("!000"));
    state.next_stream_id = STREAM_ID_SPACE - 1;
    assert_eq!(state.alloc_stream_id().as_deref(), Ok("!zzz"));
    assert_eq!(state.alloc_stream_id().as_deref(), Ok("!000"));
}

#[tokio::test]
async fn concurrent_requests_get_distinct_ids() {
    let sock = test_sock(Handlers::new());
    let _a = sock.buffer_request("a", b"");
    let _b = sock.buffer_request("b", b"");
    let _s = sock.stream_request("s").expect("stream");
    let _c = sock.buffer_request("c", b"");
    assert_eq!(sock.pending_count(), 4);

    let mut peer = connect(&sock).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (msg, _) = next_msg(&mut peer).await;
        ids.push(msg.id.expect("id"));
    }
    assert_eq!(ids, vec!["0000", "0001", "0002"]);
}

#[test]
fn heartbeat_load_is_scaled_and_clamped() {
    assert_eq!(scale_load(0.0), 0);
    assert_eq!(scale_load(0.5), 32768);
    assert_eq!(scale_load(1.0), 0xFFFF);
    assert_eq!(scale_load(7.0), 0xFFFF);
    assert_eq!(scale_load(-1.0), 0);
}

// =============================================================================
// SEND QUEUE
// =============================================================================

#[tokio::test]
async fn offline_sends_are_flushed_in_fifo_order() {
    let sock = test_sock(Handlers::new());
    sock.buffer_notify("first", b"1").expect("queued");
    let _reply = sock.buffer_request("second", b"2");
    sock.notify("third", &3).expect("queued");
    assert!(!sock.is_open());

    let mut peer = connect(&sock).await;
    let mut order = Vec::new();
    for _ in 0..3 {
        let (msg, payload) = next_msg(&mut peer).await;
        order.push((msg.t, msg.name.expect("name"), payload));
    }
    assert_eq!(
        order,
        vec![
            (MsgType::Notification, "first".to_owned(), b"1".to_vec()),
            (MsgType::SingleRequest, "second".to_owned(), b"2".to_vec()),
            (MsgType::Notification, "third".to_owned(), b"3".to_vec()),
        ]
    );
}

#[tokio::test]
async fn full_send_queue_raises_socket_closed() {
    let sock = test_sock(Handlers::new());
    sock.set_send_buffer_limit(2);
    sock.buffer_notify("a", b"").expect("queued");
    sock.buffer_notify("b", b"").expect("queued");
    assert_eq!(sock.buffer_notify("c", b""), Err(SockError::SocketClosed));

    let err = sock.buffer_request("d", b"").await.expect_err("queue full");
    assert_eq!(err, SockError::SocketClosed);
    assert_eq!(sock.pending_count(), 0);
}

// =============================================================================
// REQUESTS
// =============================================================================

#[tokio::test]
async fn echo_request_resolves_with_response_payload() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let reply = tokio::spawn(sock.buffer_request("echo", b"hi"));
    let (msg, payload) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::SingleRequest);
    assert_eq!(msg.id.as_deref(), Some("0000"));
    assert_eq!(msg.name.as_deref(), Some("echo"));
    assert_eq!(payload, b"hi");

    peer_send(&peer, MsgType::SingleResponse, Some("0000"), None, 0, b"hi");
    let got = tokio::time::timeout(WAIT, reply).await.expect("timely").expect("join");
    assert_eq!(got, Ok(b"hi".to_vec()));
    assert_eq!(sock.pending_count(), 0);
}

#[tokio::test]
async fn json_request_round_trips_values() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let reply = tokio::spawn(sock.request::<_, Vec<u32>>("range", &3));
    let (_, payload) = next_msg(&mut peer).await;
    assert_eq!(payload, b"3");
    peer_send(&peer, MsgType::SingleResponse, Some("0000"), None, 0, b"[0,1,2]");

    let got = tokio::time::timeout(WAIT, reply).await.expect("timely").expect("join");
    assert_eq!(got, Ok(vec![0, 1, 2]));
}

#[tokio::test]
async fn error_response_rejects_with_peer_message() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let reply = tokio::spawn(sock.buffer_request("nope", b""));
    next_msg(&mut peer).await;
    peer_send(&peer, MsgType::ErrorResponse, Some("0000"), None, 0, b"no such operation \"nope\"");

    let err = reply.await.expect("join").expect_err("rejected");
    assert_eq!(err.to_string(), "no such operation \"nope\"");
}

#[tokio::test]
async fn retry_response_rejects_with_wait() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let reply = tokio::spawn(sock.buffer_request("busy", b""));
    next_msg(&mut peer).await;
    peer_send(&peer, MsgType::RetryResponse, Some("0000"), None, 500, b"try later");

    let err = reply.await.expect("join").expect_err("rejected");
    assert_eq!(err, SockError::Retry { wait_ms: 500, message: "try later".into() });
}

#[tokio::test]
async fn responses_for_unknown_ids_are_ignored() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    peer_send(&peer, MsgType::SingleResponse, Some("zzzz"), None, 0, b"stray");
    let reply = tokio::spawn(sock.buffer_request("echo", b""));
    next_msg(&mut peer).await;
    peer_send(&peer, MsgType::SingleResponse, Some("0000"), None, 0, b"ok");

    assert_eq!(reply.await.expect("join"), Ok(b"ok".to_vec()));
    assert!(sock.is_open());
}

// =============================================================================
// HANDLERS
// =============================================================================

#[tokio::test]
async fn inbound_request_is_answered_by_handler() {
    let handlers = Handlers::new();
    handlers.handle_buffer_request("echo", |payload, _| async move { Ok(payload) });
    let sock = test_sock(handlers);
    let mut peer = connect(&sock).await;

    peer_send(&peer, MsgType::SingleRequest, Some("0042"), Some("echo"), 0, b"hi");
    let (msg, payload) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::SingleResponse);
    assert_eq!(msg.id.as_deref(), Some("0042"));
    assert_eq!(payload, b"hi");
}

#[tokio::test]
async fn panicking_handler_answers_internal_error_and_stays_open() {
    let handlers = Handlers::new();
    handlers.handle_buffer_request("boom", |_, _| async move { panic!("boom") });
    handlers.handle_buffer_request("echo", |payload, _| async move { Ok(payload) });
    let sock = test_sock(handlers);
    let mut peer = connect(&sock).await;

    peer_send(&peer, MsgType::SingleRequest, Some("0000"), Some("boom"), 0, b"");
    let (msg, payload) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::ErrorResponse);
    assert_eq!(payload, b"internal error");
    assert!(sock.is_open());

    peer_send(&peer, MsgType::SingleRequest, Some("0001"), Some("echo"), 0, b"still here");
    let (msg, payload) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::SingleResponse);
    assert_eq!(payload, b"still here");
}

#[tokio::test]
async fn handler_error_message_is_sent_back() {
    let handlers = Handlers::new();
    handlers.handle_request("div", |(a, b): (u32, u32), _| async move {
        a.checked_div(b).ok_or_else(|| HandlerError::new("division by zero"))
    });
    let sock = test_sock(handlers);
    let mut peer = connect(&sock).await;

    peer_send(&peer, MsgType::SingleRequest, Some("0000"), Some("div"), 0, b"[1,0]");
    let (msg, payload) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::ErrorResponse);
    assert_eq!(payload, b"division by zero");
}

#[tokio::test]
async fn unknown_operation_without_fallback_is_rejected() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    peer_send(&peer, MsgType::SingleRequest, Some("0000"), Some("nope"), 0, b"");
    let (msg, payload) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::ErrorResponse);
    assert_eq!(payload, b"no such operation \"nope\"");
}

#[tokio::test]
async fn notifications_reach_their_handler() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handlers = Handlers::new();
    handlers.handle_notification("news", move |headline: String, name| {
        let _ = tx.send((name, headline));
    });
    handlers.handle_buffer_notification("crash", |_, _| panic!("listener bug"));
    let sock = test_sock(handlers);
    let peer = connect(&sock).await;

    peer_send(&peer, MsgType::Notification, None, Some("crash"), 0, b"");
    peer_send(&peer, MsgType::Notification, None, Some("news"), 0, br#""hello""#);
    let got = tokio::time::timeout(WAIT, rx.recv()).await.expect("timely");
    assert_eq!(got, Some(("news".to_owned(), "hello".to_owned())));
    assert!(sock.is_open());
}

// =============================================================================
// STREAMS
// =============================================================================

#[tokio::test]
async fn stream_request_writes_request_then_parts_then_terminator() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let mut req = sock.stream_request("upload").expect("stream");
    req.write(b"one").expect("write");
    req.write(b"two").expect("write");
    req.end().expect("end");
    req.write(b"ignored").expect("no-op after end");

    let (first, payload) = next_msg(&mut peer).await;
    assert_eq!(first.t, MsgType::StreamRequest);
    assert_eq!(first.id.as_deref(), Some("!000"));
    assert_eq!(first.name.as_deref(), Some("upload"));
    assert_eq!(payload, b"one");

    let (second, payload) = next_msg(&mut peer).await;
    assert_eq!(second.t, MsgType::StreamRequestPart);
    assert_eq!(second.id.as_deref(), Some("!000"));
    assert_eq!(payload, b"two");

    let (last, payload) = next_msg(&mut peer).await;
    assert_eq!(last.t, MsgType::StreamRequestPart);
    assert_eq!(last.size, 0);
    assert!(payload.is_empty());
    assert!(req.is_ended());
}

#[tokio::test]
async fn stream_responses_arrive_as_data_then_close() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let mut req = sock.stream_request("feed").expect("stream");
    req.write(b"go").expect("write");
    next_msg(&mut peer).await;

    peer_send(&peer, MsgType::StreamResponse, Some("!000"), None, 0, b"a");
    peer_send(&peer, MsgType::StreamResponse, Some("!000"), None, 0, b"b");
    peer_send(&peer, MsgType::StreamResponse, Some("!000"), None, 0, b"");

    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(WAIT, req.recv()).await.expect("timely") {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![StreamEvent::Data(b"a".to_vec()), StreamEvent::Data(b"b".to_vec()), StreamEvent::Close(None)]
    );
    assert_eq!(sock.pending_count(), 0);
}

#[tokio::test]
async fn stream_error_response_closes_with_error() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let mut req = sock.stream_request("feed").expect("stream");
    req.end().expect("end");
    next_msg(&mut peer).await;
    peer_send(&peer, MsgType::ErrorResponse, Some("!000"), None, 0, b"denied");

    let event = tokio::time::timeout(WAIT, req.recv()).await.expect("timely");
    assert_eq!(event, Some(StreamEvent::Close(Some(SockError::Response("denied".into())))));
    assert_eq!(req.recv().await, None);
}

#[tokio::test]
async fn dropping_stream_handle_forgets_request() {
    let sock = test_sock(Handlers::new());
    let req = sock.stream_request("feed").expect("stream");
    assert_eq!(sock.pending_count(), 1);
    drop(req);
    assert_eq!(sock.pending_count(), 0);
}

// =============================================================================
// CLOSING
// =============================================================================

#[tokio::test]
async fn unclean_close_rejects_every_pending_request() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;
    let mut events = sock.subscribe();

    let replies: Vec<_> = (0..3).map(|i| tokio::spawn(sock.buffer_request(&format!("op{i}"), b""))).collect();
    for _ in 0..3 {
        next_msg(&mut peer).await;
    }
    assert_eq!(sock.pending_count(), 3);

    peer.close(Some(1006));
    assert_eq!(next_close(&mut events).await, Some(SockError::CloseStatus(1006)));
    for reply in replies {
        let err = reply.await.expect("join").expect_err("rejected");
        assert_eq!(err, SockError::CloseStatus(1006));
    }
    assert_eq!(sock.pending_count(), 0);
    assert!(!sock.is_connected());
}

#[tokio::test]
async fn clean_peer_close_rejects_with_connection_closed() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;
    let mut events = sock.subscribe();

    let reply = tokio::spawn(sock.buffer_request("slow", b""));
    next_msg(&mut peer).await;
    peer.close(Some(1000));

    assert_eq!(next_close(&mut events).await, None);
    assert_eq!(reply.await.expect("join"), Err(SockError::ConnectionClosed));
}

#[tokio::test]
async fn transport_error_rejects_with_transport_error() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;
    let mut events = sock.subscribe();

    let reply = tokio::spawn(sock.buffer_request("slow", b""));
    next_msg(&mut peer).await;
    peer.fail("connection reset");

    let expected = SockError::Transport("connection reset".into());
    assert_eq!(next_close(&mut events).await, Some(expected.clone()));
    assert_eq!(reply.await.expect("join"), Err(expected));
}

#[tokio::test]
async fn end_on_idle_socket_is_safe_to_repeat() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;
    let mut events = sock.subscribe();

    sock.end();
    assert_eq!(next_out(&mut peer).await, Outbound::Close(NORMAL_CLOSURE));
    assert_eq!(next_close(&mut events).await, None);

    sock.end();
    let after = tokio::time::timeout(WAIT, peer.recv()).await.expect("transport released");
    assert_eq!(after, None);
    assert!(!sock.is_connected());
}

#[tokio::test]
async fn end_with_pending_waits_for_last_response() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let reply = tokio::spawn(sock.buffer_request("slow", b""));
    next_msg(&mut peer).await;
    sock.end();
    assert!(sock.is_connected());

    peer_send(&peer, MsgType::SingleResponse, Some("0000"), None, 0, b"done");
    assert_eq!(reply.await.expect("join"), Ok(b"done".to_vec()));
    assert_eq!(next_out(&mut peer).await, Outbound::Close(NORMAL_CLOSURE));
}

#[tokio::test]
async fn second_end_forces_close_despite_pending() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    let reply = tokio::spawn(sock.buffer_request("slow", b""));
    next_msg(&mut peer).await;
    sock.end();
    sock.end();

    assert_eq!(next_out(&mut peer).await, Outbound::Close(NORMAL_CLOSURE));
    assert_eq!(reply.await.expect("join"), Err(SockError::ConnectionClosed));
}

#[tokio::test]
async fn reset_restarts_single_ids_but_not_stream_ids() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;
    let mut events = sock.subscribe();

    let _first = sock.buffer_request("a", b"");
    let _stream = sock.stream_request("s").expect("stream");
    next_msg(&mut peer).await;
    peer.close(Some(1001));
    next_close(&mut events).await;

    let mut peer = connect(&sock).await;
    let _again = sock.buffer_request("b", b"");
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.id.as_deref(), Some("0000"));

    let mut stream = sock.stream_request("s").expect("stream");
    stream.end().expect("end");
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.id.as_deref(), Some("!001"));
}

#[tokio::test]
async fn requests_issued_while_closing_do_not_reach_next_connection() {
    let sock = test_sock(Handlers::new());
    let _peer = connect(&sock).await;
    let mut events = sock.subscribe();

    sock.end();
    let stale = tokio::spawn(sock.buffer_request("stale", b""));
    sock.buffer_notify("kept", b"").expect("queued");
    assert_eq!(next_close(&mut events).await, None);
    assert_eq!(stale.await.expect("join"), Err(SockError::ConnectionClosed));

    let mut peer = connect(&sock).await;
    let fresh = tokio::spawn(sock.buffer_request("fresh", b""));
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.name.as_deref(), Some("kept"));
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.name.as_deref(), Some("fresh"));
    assert_eq!(msg.id.as_deref(), Some("0000"));

    peer_send(&peer, MsgType::SingleResponse, Some("0000"), None, 0, b"for fresh");
    assert_eq!(fresh.await.expect("join"), Ok(b"for fresh".to_vec()));
}

#[tokio::test]
async fn handler_reply_finishing_while_closing_is_not_sent_to_next_peer() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let handlers = Handlers::new();
    let handler_gate = Arc::clone(&gate);
    handlers.handle_buffer_request("slow", move |_, _| {
        let gate = Arc::clone(&handler_gate);
        let _ = started_tx.send(());
        async move {
            gate.notified().await;
            Ok(b"late".to_vec())
        }
    });
    let sock = test_sock(handlers);
    let mut peer = connect(&sock).await;
    let mut events = sock.subscribe();

    peer_send(&peer, MsgType::SingleRequest, Some("0007"), Some("slow"), 0, b"");
    tokio::time::timeout(WAIT, started.recv()).await.expect("handler started");
    sock.end();
    gate.notify_one();
    assert_eq!(next_out(&mut peer).await, Outbound::Close(NORMAL_CLOSURE));
    assert_eq!(next_close(&mut events).await, None);

    let mut peer = connect(&sock).await;
    sock.buffer_notify("after", b"").expect("sent");
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::Notification);
    assert_eq!(msg.name.as_deref(), Some("after"));
}

#[tokio::test]
async fn second_end_without_transport_settles_queued_requests() {
    let sock = test_sock(Handlers::new());
    let reply = tokio::spawn(sock.buffer_request("never", b""));

    sock.end();
    assert_eq!(sock.pending_count(), 1);
    sock.end();
    assert_eq!(sock.pending_count(), 0);

    let outcome = tokio::time::timeout(WAIT, reply).await.expect("settled").expect("join");
    assert_eq!(outcome, Err(SockError::ConnectionClosed));

    // Nothing stale is flushed once a transport shows up.
    let mut peer = connect(&sock).await;
    sock.buffer_notify("after", b"").expect("sent");
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.name.as_deref(), Some("after"));
}

#[tokio::test]
async fn adopt_while_attached_is_rejected() {
    let sock = test_sock(Handlers::new());
    let _peer = connect(&sock).await;
    let (transport, _other) = memory_pair();
    assert_eq!(sock.adopt(transport), Err(SockError::AlreadyAttached));
}

// =============================================================================
// PROTOCOL ERRORS
// =============================================================================

#[tokio::test]
async fn version_mismatch_sends_protocol_error_and_closes() {
    let sock = test_sock(Handlers::new());
    let mut events = sock.subscribe();
    let (transport, mut peer) = memory_pair();
    sock.adopt(transport).expect("adopt");
    next_unit(&mut peer).await;

    peer.send(Unit::Binary(b"02".to_vec()));
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::ProtocolError);
    assert_eq!(msg.size, ErrorCode::Unsupported.code());
    assert_eq!(next_out(&mut peer).await, Outbound::Close(4001));

    assert_eq!(next_event(&mut events).await, SockEvent::Open);
    assert_eq!(next_close(&mut events).await, Some(SockError::Protocol(ErrorCode::Unsupported)));
}

#[tokio::test]
async fn malformed_header_closes_with_invalid_msg() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;
    let mut events = sock.subscribe();

    peer.send(Unit::Binary(b"x0000".to_vec()));
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::ProtocolError);
    assert_eq!(msg.size, ErrorCode::InvalidMsg.code());
    assert_eq!(next_out(&mut peer).await, Outbound::Close(4002));
    assert_eq!(next_close(&mut events).await, Some(SockError::Protocol(ErrorCode::InvalidMsg)));
}

#[tokio::test]
async fn inbound_stream_request_is_a_protocol_violation() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;

    peer_send(&peer, MsgType::StreamRequest, Some("!000"), Some("upload"), 0, b"x");
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::ProtocolError);
    assert_eq!(next_out(&mut peer).await, Outbound::Close(4002));
}

#[tokio::test]
async fn peer_protocol_error_closes_with_matching_error() {
    let sock = test_sock(Handlers::new());
    let mut peer = connect(&sock).await;
    let mut events = sock.subscribe();

    // The code travels in the size field.
    peer.send(Codec::Binary.make_msg(MsgType::ProtocolError, None, None, 0, 3).expect("header"));

    assert_eq!(next_out(&mut peer).await, Outbound::Close(4003));
    assert_eq!(next_close(&mut events).await, Some(SockError::Protocol(ErrorCode::Timeout)));
}

// =============================================================================
// HEARTBEATS
// =============================================================================

#[tokio::test]
async fn inbound_heartbeat_raises_event() {
    let sock = test_sock(Handlers::new());
    let peer = connect(&sock).await;
    let mut events = sock.subscribe();

    peer.send(Codec::Binary.make_heartbeat_msg(0xFFFF, 1_700_000_000));
    let event = next_event(&mut events).await;
    assert_eq!(
        event,
        SockEvent::Heartbeat { time: UNIX_EPOCH + Duration::from_secs(1_700_000_000), load: 1.0 }
    );
}

#[tokio::test]
async fn send_heartbeat_requires_transport() {
    let sock = test_sock(Handlers::new());
    assert_eq!(sock.send_heartbeat(0.5), Err(SockError::SocketClosed));

    let mut peer = connect(&sock).await;
    sock.send_heartbeat(0.5).expect("sent");
    let (msg, _) = next_msg(&mut peer).await;
    assert_eq!(msg.t, MsgType::Heartbeat);
    assert_eq!(msg.wait, 32768);
    assert!(msg.size > 0);
}

#[tokio::test]
async fn heartbeats_start_after_peer_version() {
    let config = SockConfig { heartbeat_interval: Duration::from_millis(20), ..SockConfig::default() };
    let sock = Sock::new(Handlers::new(), config);
    let mut peer = connect(&sock).await;

    for _ in 0..2 {
        let (msg, _) = next_msg(&mut peer).await;
        assert_eq!(msg.t, MsgType::Heartbeat);
        assert_eq!(msg.wait, 0);
    }
    sock.stop_sending_heartbeats();
}

#[test]
fn heartbeat_interval_below_minimum_is_rejected() {
    let sock = test_sock(Handlers::new());
    assert_eq!(sock.set_heartbeat_interval(Duration::from_millis(5)), Err(SockError::HeartbeatIntervalTooLow));
    assert_eq!(sock.start_sending_heartbeats(), Err(SockError::HeartbeatIntervalTooLow));
    assert_eq!(sock.set_heartbeat_interval(Duration::ZERO), Ok(()));
}

// =============================================================================
// CODECS
// =============================================================================

#[tokio::test]
async fn text_codec_sends_text_units() {
    let config = SockConfig { codec: Codec::Text, ..quiet_config() };
    let sock = Sock::new(Handlers::new(), config);
    sock.buffer_notify("hello", b"{}").expect("queued");

    let (transport, mut peer) = memory_pair();
    sock.adopt(transport).expect("adopt");
    assert_eq!(next_unit(&mut peer).await, Unit::Text("01".into()));
    assert_eq!(next_unit(&mut peer).await, Unit::Text("n005hello00000002".into()));
    assert_eq!(next_unit(&mut peer).await, Unit::Text("{}".into()));
}
