//! Connection supervisor.
//!
//! [`ConnectionSupervisor`] owns the single logical connection to the
//! telemetry endpoint. `connect()` spawns a supervision task that opens the
//! transport, runs the session (outbound control queue + inbound frames),
//! and on failure backs off according to the [`RetryPolicy`] until the
//! attempt budget is spent. `disconnect()` cancels the task, including any
//! pending retry sleep, under the same lock that guards the state.
//!
//! Everything the supervisor learns is broadcast as a [`SupervisorEvent`].
//! Call [`ConnectionSupervisor::subscribe`] to receive them.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{TelemetryError, TransportError};
use crate::messages::ControlMessage;
use crate::reconnect::{RetryDecision, RetryPolicy, RetryState};
use crate::state::{ConnectionState, Transition};
use crate::transport::{Transport, TransportLink};

/// Broadcast channel capacity for supervisor events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long a clean close may take before the session is dropped anyway.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `shutdown` waits for the supervision task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Something the supervisor notifies with every successful handshake.
pub trait ConnectHook: Send + Sync {
    /// Called once per established session, before any queued control
    /// message goes out. `reconnected` is false only for the very first
    /// connection of this supervisor.
    fn on_connected(&self, link: &LiveLink<'_>, reconnected: bool);
}

/// Write access to an established session.
///
/// Only the supervisor can construct one, and only while a session is up,
/// so nothing holding a `LiveLink` can be talking to a dead connection.
pub struct LiveLink<'a> {
    tx: &'a mpsc::UnboundedSender<String>,
}

impl LiveLink<'_> {
    /// Queue a control message on the live session. Returns `false` if the
    /// session ended in the meantime.
    pub fn send(&self, message: &ControlMessage) -> bool {
        self.tx.send(message.to_json()).is_ok()
    }
}

/// Everything the supervisor reports to its listeners.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A raw inbound text frame.
    Message(String),
    /// A transport failure or the terminal exhausted-retries error.
    Error(TelemetryError),
    /// A session was established after an earlier one.
    Reconnected,
    /// A retry timer was armed.
    RetryScheduled { attempt: u32, delay: Duration },
}

/// Supervises the one connection to the telemetry endpoint.
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    events: broadcast::Sender<SupervisorEvent>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: ConnectionState,
    retry: RetryState,
    /// Outbound queue of the live session; `Some` only while connected.
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<SupervisionTask>,
    hook: Option<Arc<dyn ConnectHook>>,
    ever_connected: bool,
}

struct SupervisionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let retry = RetryState::new(&policy);

        Self {
            shared: Arc::new(Shared {
                transport,
                policy,
                events,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    retry,
                    outbound: None,
                    task: None,
                    hook: None,
                    ever_connected: false,
                }),
            }),
        }
    }

    /// Install the hook run on every successful handshake (the
    /// subscription registry, in practice).
    pub fn set_hook(&self, hook: Arc<dyn ConnectHook>) {
        self.shared.lock().hook = Some(hook);
    }

    /// Subscribe to supervisor events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn retry_state(&self) -> RetryState {
        self.shared.lock().retry.clone()
    }

    pub fn endpoint(&self) -> &str {
        self.shared.transport.endpoint()
    }

    /// Start connecting.
    ///
    /// No-op while a supervision task is alive (connecting, connected or
    /// backing off). From `Disconnected` or `Failed` the retry state is
    /// reset and a fresh task is spawned. Must be called within a Tokio
    /// runtime.
    pub fn connect(&self) {
        let mut inner = self.shared.lock();

        if inner.state.is_active() {
            tracing::debug!(state = %inner.state, "connect() ignored; already active");
            return;
        }

        if !self.shared.transition(&mut inner, Transition::Connect) {
            return;
        }
        inner.retry.reset(&self.shared.policy);

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let task_cancel = cancel.clone();

        tracing::info!(endpoint = %self.endpoint(), "Starting telemetry connection task");
        let handle = tokio::spawn(async move {
            run_supervision(&shared, &task_cancel).await;
            tracing::debug!("Telemetry connection task exited");
        });

        inner.task = Some(SupervisionTask { cancel, handle });
    }

    /// Tear down the connection and cancel any pending retry. Safe to call
    /// from any state.
    pub fn disconnect(&self) {
        let _ = self.stop();
    }

    /// Disconnect and wait (bounded) for the supervision task to exit.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.stop() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
    }

    /// Best-effort send of a control message.
    ///
    /// Fails with [`TelemetryError::NotConnected`] unless the supervisor is
    /// `Connected`; delivery is never guaranteed.
    pub fn send(&self, message: &ControlMessage) -> Result<(), TelemetryError> {
        let inner = self.shared.lock();

        match (&inner.outbound, inner.state) {
            (Some(tx), ConnectionState::Connected) => tx
                .send(message.to_json())
                .map_err(|_| TelemetryError::NotConnected),
            _ => {
                tracing::debug!(?message, state = %inner.state, "Control message not sent; not connected");
                Err(TelemetryError::NotConnected)
            }
        }
    }

    // ---- private helpers ----

    fn stop(&self) -> Option<JoinHandle<()>> {
        let mut inner = self.shared.lock();
        let task = inner.task.take();
        if let Some(task) = &task {
            task.cancel.cancel();
        }
        inner.outbound = None;
        self.shared.transition(&mut inner, Transition::Disconnect);
        task.map(|t| t.handle)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.shared.lock().task.take() {
            task.cancel.cancel();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SupervisorEvent) {
        // Ignore the SendError: it only means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Apply `transition` and broadcast the change. Illegal transitions are
    /// logged and leave the state untouched.
    fn transition(&self, inner: &mut Inner, transition: Transition) -> bool {
        let from = inner.state;
        match from.apply(transition) {
            Some(to) => {
                inner.state = to;
                if from != to {
                    tracing::info!(%from, %to, "Telemetry connection state changed");
                    self.emit(SupervisorEvent::StateChanged { from, to });
                }
                true
            }
            None => {
                tracing::warn!(state = %from, ?transition, "Illegal connection transition ignored");
                false
            }
        }
    }

    /// Record a successful handshake. Returns `false` if the task was
    /// cancelled while the handshake was in flight.
    fn establish(&self, cancel: &CancellationToken, tx: &mpsc::UnboundedSender<String>) -> bool {
        let mut inner = self.lock();
        if cancel.is_cancelled() {
            return false;
        }

        inner.retry.reset(&self.policy);
        inner.outbound = Some(tx.clone());
        self.transition(&mut inner, Transition::Established);

        let reconnected = inner.ever_connected;
        inner.ever_connected = true;

        // Runs under the lock so no concurrent send() can overtake the replay.
        if let Some(hook) = inner.hook.clone() {
            hook.on_connected(&LiveLink { tx }, reconnected);
        }

        if reconnected {
            self.emit(SupervisorEvent::Reconnected);
        }
        true
    }

    /// Record the loss of an established session.
    fn lose(&self, cancel: &CancellationToken, error: TransportError) -> bool {
        let mut inner = self.lock();
        if cancel.is_cancelled() {
            return false;
        }

        tracing::warn!(error = %error, "Telemetry session lost");
        inner.outbound = None;
        self.transition(&mut inner, Transition::Lost);
        self.emit(SupervisorEvent::Error(error.into()));
        true
    }

    /// Count a failed attempt. Returns the delay before the next attempt,
    /// or `None` when the task must stop (cancelled or exhausted).
    fn record_failure(&self, cancel: &CancellationToken) -> Option<Duration> {
        let mut inner = self.lock();
        if cancel.is_cancelled() {
            return None;
        }

        match inner.retry.record_failure(&self.policy) {
            RetryDecision::Retry(delay) => {
                let attempt = inner.retry.attempt;
                self.transition(&mut inner, Transition::AttemptFailed);
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling telemetry reconnect",
                );
                self.emit(SupervisorEvent::RetryScheduled { attempt, delay });
                Some(delay)
            }
            RetryDecision::Exhausted => {
                let attempts = inner.retry.attempt;
                inner.outbound = None;
                inner.task = None;
                self.transition(&mut inner, Transition::Exhausted);
                tracing::error!(attempts, "Giving up on telemetry connection");
                self.emit(SupervisorEvent::Error(TelemetryError::ExhaustedRetries {
                    attempts,
                }));
                None
            }
        }
    }
}

/// Core supervision loop: connect -> run session -> back off -> repeat.
///
/// Runs until cancelled or the retry budget is spent.
async fn run_supervision(shared: &Shared, cancel: &CancellationToken) {
    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = shared.transport.open() => result,
        };

        match attempt {
            Ok(link) => {
                let (tx, rx) = mpsc::unbounded_channel();
                if !shared.establish(cancel, &tx) {
                    return;
                }
                drop(tx);

                let Some(error) = run_session(shared, link, rx, cancel).await else {
                    return;
                };
                if !shared.lose(cancel, error) {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %shared.transport.endpoint(),
                    error = %e,
                    "Telemetry connection attempt failed",
                );
                if cancel.is_cancelled() {
                    return;
                }
                shared.emit(SupervisorEvent::Error(e.into()));
            }
        }

        let Some(delay) = shared.record_failure(cancel) else {
            return;
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Drive one established session until it drops or is cancelled.
///
/// Returns the error that ended the session, or `None` on cancellation.
async fn run_session(
    shared: &Shared,
    link: TransportLink,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> Option<TransportError> {
    let TransportLink {
        mut sink,
        mut stream,
    } = link;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                return None;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(text).await {
                    return Some(e);
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(text)) => shared.emit(SupervisorEvent::Message(text)),
                Some(Err(e)) => return Some(e),
                None => return Some(TransportError::Closed("stream ended".to_string())),
            },
        }
    }
}
