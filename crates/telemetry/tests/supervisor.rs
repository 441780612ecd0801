//! Integration tests for `ConnectionSupervisor`.
//!
//! Each test drives a supervisor over an in-memory transport with a paused
//! clock, so backoff sleeps complete instantly while their order and
//! durations stay observable through `SupervisorEvent`s.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use common::{settle, wait_for, MockTransport, Open};
use gridlens_telemetry::messages::ControlMessage;
use gridlens_telemetry::reconnect::RetryPolicy;
use gridlens_telemetry::registry::{Subscription, SubscriptionRegistry};
use gridlens_telemetry::state::ConnectionState;
use gridlens_telemetry::supervisor::{ConnectionSupervisor, SupervisorEvent};
use gridlens_telemetry::TelemetryError;

fn supervisor(transport: Arc<MockTransport>) -> ConnectionSupervisor {
    ConnectionSupervisor::new(transport, RetryPolicy::default())
}

fn is_state(target: ConnectionState) -> impl Fn(&SupervisorEvent) -> bool {
    move |event| matches!(event, SupervisorEvent::StateChanged { to, .. } if *to == target)
}

// ---------------------------------------------------------------------------
// Test: subscribe while disconnected, then connect, sends exactly one subscribe
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pending_subscription_is_sent_once_on_connect() {
    let transport = MockTransport::accepting();
    let supervisor = supervisor(transport.clone());
    let registry = Arc::new(SubscriptionRegistry::new());
    supervisor.set_hook(registry.clone());

    registry.acquire(&Subscription::entity("gpu-1"));
    assert_matches!(
        supervisor.send(&ControlMessage::subscribe(&Subscription::entity("gpu-1"))),
        Err(TelemetryError::NotConnected)
    );

    let mut events = supervisor.subscribe();
    supervisor.connect();
    let mut server = transport.next_server().await;
    wait_for(&mut events, is_state(ConnectionState::Connected)).await;

    assert_eq!(server.next_sent().await, r#"{"type":"subscribe","entityId":"gpu-1"}"#);
    settle(100).await;
    assert!(server.drain_sent().is_empty());
    assert_eq!(transport.opens(), 1);
}

// ---------------------------------------------------------------------------
// Test: max_attempts consecutive failures end in Failed with one fewer retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn exhausted_retries_end_in_failed() {
    let transport = MockTransport::failing();
    let supervisor = supervisor(transport.clone());
    let mut events = supervisor.subscribe();

    supervisor.connect();
    wait_for(&mut events, is_state(ConnectionState::Failed)).await;

    assert_eq!(supervisor.state(), ConnectionState::Failed);
    assert_eq!(transport.opens(), 5);

    // No timer is left behind.
    settle(300_000).await;
    assert_eq!(transport.opens(), 5);
}

#[tokio::test(start_paused = true)]
async fn retry_schedule_doubles_and_stops_after_budget() {
    let transport = MockTransport::failing();
    let supervisor = supervisor(transport.clone());
    let mut events = supervisor.subscribe();

    supervisor.connect();

    let mut delays = Vec::new();
    let terminal = loop {
        match wait_for(&mut events, |e| {
            matches!(
                e,
                SupervisorEvent::RetryScheduled { .. }
                    | SupervisorEvent::Error(TelemetryError::ExhaustedRetries { .. })
            )
        })
        .await
        {
            SupervisorEvent::RetryScheduled { delay, .. } => delays.push(delay),
            other => break other,
        }
    };

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
        ]
    );
    assert_matches!(
        terminal,
        SupervisorEvent::Error(TelemetryError::ExhaustedRetries { attempts: 5 })
    );
}

// ---------------------------------------------------------------------------
// Test: connect() after Failed starts a fresh attempt budget
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn connect_after_failed_restarts() {
    let transport = MockTransport::scripted(&[Open::Fail; 5], Open::Accept);
    let supervisor = supervisor(transport.clone());
    let mut events = supervisor.subscribe();

    supervisor.connect();
    wait_for(&mut events, is_state(ConnectionState::Failed)).await;

    supervisor.connect();
    let _server = transport.next_server().await;
    wait_for(&mut events, is_state(ConnectionState::Connected)).await;
    assert_eq!(transport.opens(), 6);
    assert_eq!(supervisor.retry_state().attempt, 0);
}

// ---------------------------------------------------------------------------
// Test: a successful connection resets the backoff
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn successful_connection_resets_backoff() {
    let transport = MockTransport::scripted(&[Open::Fail, Open::Fail, Open::Accept], Open::Fail);
    let supervisor = supervisor(transport.clone());
    let mut events = supervisor.subscribe();

    supervisor.connect();
    let mut server = transport.next_server().await;
    wait_for(&mut events, is_state(ConnectionState::Connected)).await;
    assert_eq!(supervisor.retry_state().attempt, 0);
    assert_eq!(supervisor.retry_state().next_delay, Duration::from_secs(1));

    // Losing the session starts over from the base delay.
    server.close();
    let event = wait_for(&mut events, |e| matches!(e, SupervisorEvent::RetryScheduled { .. })).await;
    assert_matches!(
        event,
        SupervisorEvent::RetryScheduled { attempt: 1, delay } if delay == Duration::from_secs(1)
    );
}

// ---------------------------------------------------------------------------
// Test: reconnect replays every active subscription in first-subscribe order
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconnect_replays_active_subscriptions() {
    let transport = MockTransport::accepting();
    let supervisor = supervisor(transport.clone());
    let registry = Arc::new(SubscriptionRegistry::new());
    supervisor.set_hook(registry.clone());
    let mut events = supervisor.subscribe();

    registry.acquire(&Subscription::entity("gpu-2"));
    registry.acquire(&Subscription::topic("site-7", "carbon"));

    supervisor.connect();
    let mut first = transport.next_server().await;
    assert_eq!(first.next_sent().await, r#"{"type":"subscribe","entityId":"gpu-2"}"#);
    assert_eq!(
        first.next_sent().await,
        r#"{"type":"subscribe","entityId":"site-7","topic":"carbon"}"#
    );

    first.close();
    wait_for(&mut events, is_state(ConnectionState::Reconnecting)).await;

    let mut second = transport.next_server().await;
    wait_for(&mut events, |e| matches!(e, SupervisorEvent::Reconnected)).await;
    assert_eq!(second.next_sent().await, r#"{"type":"subscribe","entityId":"gpu-2"}"#);
    assert_eq!(
        second.next_sent().await,
        r#"{"type":"subscribe","entityId":"site-7","topic":"carbon"}"#
    );
    settle(100).await;
    assert!(second.drain_sent().is_empty());
}

// ---------------------------------------------------------------------------
// Test: disconnect() cancels a pending retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_retry() {
    let transport = MockTransport::failing();
    let supervisor = supervisor(transport.clone());
    let mut events = supervisor.subscribe();

    supervisor.connect();
    wait_for(&mut events, |e| matches!(e, SupervisorEvent::RetryScheduled { .. })).await;

    supervisor.disconnect();
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    settle(60_000).await;
    assert_eq!(transport.opens(), 1);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Test: connect() while already active does not open a second connection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent_while_active() {
    let transport = MockTransport::accepting();
    let supervisor = supervisor(transport.clone());
    let mut events = supervisor.subscribe();

    supervisor.connect();
    supervisor.connect();
    let _server = transport.next_server().await;
    wait_for(&mut events, is_state(ConnectionState::Connected)).await;
    supervisor.connect();

    settle(1_000).await;
    assert_eq!(transport.opens(), 1);
    assert_eq!(supervisor.state(), ConnectionState::Connected);
}

// ---------------------------------------------------------------------------
// Test: inbound frames are forwarded; control messages reach the server
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn frames_flow_both_ways() {
    let transport = MockTransport::accepting();
    let supervisor = supervisor(transport.clone());
    let mut events = supervisor.subscribe();

    supervisor.connect();
    let mut server = transport.next_server().await;
    wait_for(&mut events, is_state(ConnectionState::Connected)).await;

    server.push(r#"{"type":"pong"}"#);
    let event = wait_for(&mut events, |e| matches!(e, SupervisorEvent::Message(_))).await;
    assert_matches!(event, SupervisorEvent::Message(text) if text == r#"{"type":"pong"}"#);

    supervisor
        .send(&ControlMessage::unsubscribe(&Subscription::entity("gpu-1")))
        .unwrap();
    assert_eq!(server.next_sent().await, r#"{"type":"unsubscribe","entityId":"gpu-1"}"#);
}

// ---------------------------------------------------------------------------
// Test: a dropped session surfaces as a transport error, then Reconnecting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn lost_session_reports_transport_error() {
    let transport = MockTransport::accepting();
    let supervisor = supervisor(transport.clone());
    let mut events = supervisor.subscribe();

    supervisor.connect();
    let mut server = transport.next_server().await;
    wait_for(&mut events, is_state(ConnectionState::Connected)).await;

    server.close();
    wait_for(&mut events, is_state(ConnectionState::Reconnecting)).await;
    let event = wait_for(&mut events, |e| matches!(e, SupervisorEvent::Error(_))).await;
    assert_matches!(event, SupervisorEvent::Error(TelemetryError::Transport(_)));
    assert_matches!(
        supervisor.send(&ControlMessage::subscribe(&Subscription::entity("gpu-1"))),
        Err(TelemetryError::NotConnected)
    );
}
