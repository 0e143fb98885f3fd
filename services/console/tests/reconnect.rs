//! Client mirror integration: session establishment, reconnect with backoff,
//! offline queue flushing, deterministic resubscription, and liveness
//! supervision, all against a scripted mock hub.

use console::{client_frame, ClientConfig, ClientEvent, ClientState, PulseClient, ReconnectPolicy};
use pulse_protocol::{ClientAction, Direction, MessageType, ServerEvent, ServerFrame};
use pulse_test_utils::MockHub;
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;

fn fast_config(url: String) -> ClientConfig {
    let mut config = ClientConfig::new(url);
    config.heartbeat_interval = Duration::from_millis(5_000);
    config.heartbeat_timeout = Duration::from_millis(10_000);
    config.reconnect = ReconnectPolicy {
        initial: Duration::from_millis(50),
        multiplier: 1.0,
        max_delay: Duration::from_millis(200),
        max_attempts: 5,
        jitter: false,
    };
    config
}

async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event stream closed")
}

async fn await_matching(
    events: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn wait_until(pred: impl Fn() -> bool) {
    for _ in 0..500 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the timeout");
}

#[tokio::test]
async fn establishes_a_session_and_syncs_subscriptions() {
    let mock = MockHub::start().await.expect("mock hub");
    let client = PulseClient::connect(fast_config(mock.url()));
    let mut events = client.events();

    await_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    client.subscribe(vec![MessageType::Status, MessageType::Stats]);
    let subscribed =
        await_matching(&mut events, |e| matches!(e, ClientEvent::Subscribed { .. })).await;
    let ClientEvent::Subscribed { types } = subscribed else {
        unreachable!()
    };
    assert_eq!(types, vec![MessageType::Status, MessageType::Stats]);

    let received = mock.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].action, ClientAction::Subscribe);
    assert_eq!(
        received[0].payload.as_ref().unwrap()["types"],
        json!(["status", "stats"])
    );
}

#[tokio::test]
async fn resubscribes_with_one_frame_after_a_dropped_transport() {
    let mock = MockHub::start().await.expect("mock hub");
    let client = PulseClient::connect(fast_config(mock.url()));
    let mut events = client.events();

    await_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    client.subscribe(vec![MessageType::Status, MessageType::Stats]);
    await_matching(&mut events, |e| matches!(e, ClientEvent::Subscribed { .. })).await;

    mock.drop_all();
    await_matching(&mut events, |e| {
        matches!(e, ClientEvent::Disconnected { retrying: true })
    })
    .await;
    await_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

    wait_until(|| mock.received().len() >= 2).await;
    let received = mock.received();
    assert_eq!(received.len(), 2, "exactly one frame after reconnect");
    let resubscribe = &received[1];
    assert_eq!(resubscribe.action, ClientAction::Subscribe);
    assert_eq!(
        resubscribe.payload.as_ref().unwrap()["types"],
        json!(["status", "stats"]),
        "the full local set is replayed in a single subscribe frame"
    );
}

#[tokio::test]
async fn offline_frames_flush_fifo_before_the_resubscribe() {
    let mock = MockHub::start().await.expect("mock hub");
    let mut config = fast_config(mock.url());
    config.reconnect.initial = Duration::from_millis(200);
    let client = PulseClient::connect(config);
    let mut events = client.events();

    await_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    client.subscribe(vec![MessageType::Status]);
    await_matching(&mut events, |e| matches!(e, ClientEvent::Subscribed { .. })).await;

    mock.drop_all();
    await_matching(&mut events, |e| {
        matches!(e, ClientEvent::Disconnected { retrying: true })
    })
    .await;

    // Sent while the transport is down: queued offline, flushed on reconnect.
    client.send(client_frame(
        MessageType::System,
        ClientAction::Ack,
        Some(json!({ "n": 1 })),
    ));
    client.send(client_frame(
        MessageType::System,
        ClientAction::Ack,
        Some(json!({ "n": 2 })),
    ));

    await_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    wait_until(|| mock.received().len() >= 4).await;

    let received = mock.received();
    let after_reconnect = &received[1..];
    assert_eq!(after_reconnect.len(), 3);
    assert_eq!(after_reconnect[0].action, ClientAction::Ack);
    assert_eq!(after_reconnect[0].payload.as_ref().unwrap()["n"], 1);
    assert_eq!(after_reconnect[1].action, ClientAction::Ack);
    assert_eq!(after_reconnect[1].payload.as_ref().unwrap()["n"], 2);
    assert_eq!(after_reconnect[2].action, ClientAction::Subscribe);
}

#[tokio::test]
async fn gives_up_after_the_attempt_ceiling() {
    // A port with nothing listening: every connect attempt fails fast.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = fast_config(format!("ws://{addr}/ws"));
    config.reconnect.initial = Duration::from_millis(20);
    config.reconnect.max_attempts = 2;
    let client = PulseClient::connect(config);
    let mut events = client.events();

    let mut retries = 0;
    loop {
        match next_event(&mut events).await {
            ClientEvent::Disconnected { retrying: true } => retries += 1,
            ClientEvent::GaveUp => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(retries, 2, "one disconnect notice per reconnect attempt");
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn policy_close_is_terminal() {
    let mock = MockHub::start().await.expect("mock hub");
    mock.set_reject_new(true);

    let client = PulseClient::connect(fast_config(mock.url()));
    let mut events = client.events();

    await_matching(&mut events, |e| {
        matches!(e, ClientEvent::Disconnected { retrying: false })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.accepted_connections(), 1, "no reconnect after policy close");
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn missing_pongs_drop_the_transport_and_reconnect() {
    let mock = MockHub::start().await.expect("mock hub");
    mock.set_silent(true);

    let mut config = fast_config(mock.url());
    config.heartbeat_interval = Duration::from_millis(50);
    config.heartbeat_timeout = Duration::from_millis(120);
    let client = PulseClient::connect(config);
    let mut events = client.events();

    await_matching(&mut events, |e| {
        matches!(e, ClientEvent::Disconnected { retrying: true })
    })
    .await;
    wait_until(|| mock.accepted_connections() >= 2).await;
    let pings = mock
        .received()
        .iter()
        .filter(|f| f.action == ClientAction::Ping)
        .count();
    assert!(pings >= 1, "liveness pings were sent before the self-close");
}

#[tokio::test]
async fn error_frames_surface_without_triggering_reconnect() {
    let mock = MockHub::start().await.expect("mock hub");
    let client = PulseClient::connect(fast_config(mock.url()));
    let mut events = client.events();
    await_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

    mock.broadcast(&ServerFrame {
        id: "s-err".to_owned(),
        kind: MessageType::Error,
        timestamp: 1,
        direction: Direction::ServerToClient,
        event: ServerEvent::Error,
        data: json!({ "code": "INTERNAL_ERROR", "message": "boom" }),
    });

    let event = await_matching(&mut events, |e| matches!(e, ClientEvent::ServerError(_))).await;
    let ClientEvent::ServerError(data) = event else {
        unreachable!()
    };
    assert_eq!(data.code, "INTERNAL_ERROR");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.accepted_connections(), 1);
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn broadcast_updates_reach_the_event_stream() {
    let mock = MockHub::start().await.expect("mock hub");
    let client = PulseClient::connect(fast_config(mock.url()));
    let mut events = client.events();
    await_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

    mock.broadcast(&ServerFrame {
        id: "s-1".to_owned(),
        kind: MessageType::Status,
        timestamp: 1,
        direction: Direction::ServerToClient,
        event: ServerEvent::StatusUpdate,
        data: json!({ "cpu": 55.0 }),
    });

    let event = await_matching(&mut events, |e| matches!(e, ClientEvent::Update(_))).await;
    let ClientEvent::Update(frame) = event else {
        unreachable!()
    };
    assert_eq!(frame.event, ServerEvent::StatusUpdate);
    assert_eq!(frame.data["cpu"], 55.0);
}

#[tokio::test]
async fn close_ends_the_session_without_retries() {
    let mock = MockHub::start().await.expect("mock hub");
    let client = PulseClient::connect(fast_config(mock.url()));
    let mut events = client.events();
    tokio::time::timeout(
        Duration::from_secs(5),
        client.wait_for_state(ClientState::Connected),
    )
    .await
    .expect("connect");

    client.close();
    await_matching(&mut events, |e| {
        matches!(e, ClientEvent::Disconnected { retrying: false })
    })
    .await;
    assert_eq!(client.state(), ClientState::Disconnected);
}
