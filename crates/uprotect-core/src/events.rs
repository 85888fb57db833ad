// ── Realtime updates stream ──
//
// Owns the controller's updates socket. Binary packets are decoded and
// republished in arrival order; undecodable packets are dropped. When the
// socket dies the stream backs off and reconnects until stopped. Every
// connection carries a generation number, and nothing is published for a
// generation that `stop()` has retired.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;
use uprotect_api::codec::decode_update_packet;
use uprotect_api::transport::TransportConfig;
use uprotect_api::websocket::{self, Message, ReconnectConfig, WsStream, calculate_backoff};

use crate::bus::{Bus, Notification};
use crate::error::CoreError;

// ── Types ────────────────────────────────────────────────────────────

/// Lifecycle of the updates socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    Closing,
    /// The socket dropped; a reconnect is pending.
    Faulted,
}

/// Where to connect, resolved fresh for every (re)connect.
#[derive(Debug, Clone)]
pub struct WsTarget {
    pub url: Url,
    /// Value for the `Cookie` header of the upgrade request.
    pub cookie: Option<String>,
}

pub type TargetFuture = Pin<Box<dyn Future<Output = Result<WsTarget, CoreError>> + Send>>;

/// Produces the socket target; called once per connection attempt.
pub type TargetResolver = Arc<dyn Fn() -> TargetFuture + Send + Sync>;

// ── EventStream ──────────────────────────────────────────────────────

/// Realtime update stream for one controller.
///
/// Cheaply cloneable; all clones drive the same socket.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<EventStreamInner>,
}

struct EventStreamInner {
    resolver: TargetResolver,
    transport: TransportConfig,
    reconnect: ReconnectConfig,
    bus: Arc<Bus<Notification>>,
    state: watch::Sender<StreamState>,
    /// Guarded so that a retired generation can never publish.
    generation: Mutex<u64>,
    connection: Mutex<Option<Connection>>,
}

struct Connection {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EventStream {
    pub fn new(
        resolver: TargetResolver,
        transport: TransportConfig,
        reconnect: ReconnectConfig,
        bus: Arc<Bus<Notification>>,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            inner: Arc::new(EventStreamInner {
                resolver,
                transport,
                reconnect,
                bus,
                state,
                generation: Mutex::new(0),
                connection: Mutex::new(None),
            }),
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> StreamState {
        *self.inner.state.borrow()
    }

    /// Open the updates socket and keep it open until [`stop`](Self::stop).
    ///
    /// Replaces any socket this stream already owns. Fails if the first
    /// connection cannot be established; later drops are retried in the
    /// background.
    pub async fn launch(&self) -> Result<(), CoreError> {
        self.stop().await;

        let generation = self.inner.next_generation();
        let cancel = CancellationToken::new();
        self.inner.set_state(generation, StreamState::Connecting);

        let ws = match self.inner.open(&cancel).await {
            Ok(ws) => ws,
            Err(e) => {
                self.inner.set_state(generation, StreamState::Idle);
                return Err(e);
            }
        };

        self.inner.set_state(generation, StreamState::Open);
        let task = tokio::spawn(run(
            Arc::clone(&self.inner),
            generation,
            cancel.clone(),
            ws,
        ));

        let mut connection = self.inner.lock_connection();
        if self.inner.current_generation() != generation {
            // stop() raced with the handshake.
            cancel.cancel();
            return Err(CoreError::Stream {
                message: "updates stream stopped while connecting".into(),
            });
        }
        *connection = Some(Connection { cancel, task });
        drop(connection);

        info!("realtime updates stream open");
        Ok(())
    }

    /// Close the socket and cancel any pending reconnect. Idempotent.
    pub async fn stop(&self) {
        let was = self.current_state();
        {
            let mut generation = self.inner.lock_generation();
            *generation += 1;
        }

        let connection = self.inner.lock_connection().take();
        if let Some(connection) = connection {
            self.inner.state.send_replace(StreamState::Closing);
            connection.cancel.cancel();
            if let Err(e) = connection.task.await {
                warn!(error = %e, "updates stream task ended abnormally");
            }
        }

        self.inner.state.send_replace(StreamState::Idle);
        if was != StreamState::Idle {
            debug!("realtime updates stream stopped");
        }
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.inner.current_generation()
    }

    /// Decode and publish one packet received on connection `generation`.
    pub(crate) fn deliver(&self, generation: u64, packet: &[u8]) -> bool {
        self.inner.deliver(generation, packet)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("state", &self.current_state())
            .field("generation", &self.current_generation())
            .finish_non_exhaustive()
    }
}

impl EventStreamInner {
    fn lock_generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        *self.lock_generation()
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.lock_generation();
        *generation += 1;
        *generation
    }

    fn set_state(&self, generation: u64, state: StreamState) {
        let current = self.lock_generation();
        if *current == generation {
            self.state.send_replace(state);
        }
    }

    fn deliver(&self, generation: u64, packet: &[u8]) -> bool {
        let event = match decode_update_packet(packet) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, len = packet.len(), "dropping undecodable update packet");
                return false;
            }
        };

        let current = self.lock_generation();
        if *current != generation {
            trace!("dropping update from retired connection");
            return false;
        }
        trace!(
            model_key = %event.header.model_key,
            action = %event.header.action,
            "realtime update"
        );
        self.bus.publish(Notification::Update(Arc::new(event)));
        true
    }

    /// Resolve the target and connect, giving up if `cancel` fires.
    async fn open(&self, cancel: &CancellationToken) -> Result<WsStream, CoreError> {
        let attempt = async {
            let target = (self.resolver)().await?;
            let ws = websocket::connect(&target.url, target.cookie.as_deref(), &self.transport)
                .await?;
            Ok::<_, CoreError>(ws)
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::Stream {
                message: "updates stream stopped while connecting".into(),
            }),
            result = attempt => result,
        }
    }
}

// ── Background loop ──────────────────────────────────────────────────

/// Read → on drop, back off → reconnect, until cancelled.
async fn run(
    inner: Arc<EventStreamInner>,
    generation: u64,
    cancel: CancellationToken,
    mut ws: WsStream,
) {
    loop {
        let outcome = read_until_closed(&inner, generation, &cancel, &mut ws).await;
        if cancel.is_cancelled() {
            break;
        }
        match outcome {
            Ok(()) => info!("updates socket closed by controller"),
            Err(e) => warn!(error = %e, "updates socket failed"),
        }
        inner.set_state(generation, StreamState::Faulted);
        drop(ws);

        let Some(next) = reconnect(&inner, generation, &cancel).await else {
            break;
        };
        ws = next;
        inner.set_state(generation, StreamState::Open);
        info!("realtime updates stream reconnected");
    }

    debug!(generation, "updates stream loop exiting");
}

/// Back off and reconnect until a socket opens or `cancel` fires.
async fn reconnect(
    inner: &EventStreamInner,
    generation: u64,
    cancel: &CancellationToken,
) -> Option<WsStream> {
    let mut attempt: u32 = 0;
    loop {
        let delay = calculate_backoff(attempt, &inner.reconnect);
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "waiting before reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        inner.set_state(generation, StreamState::Connecting);
        match inner.open(cancel).await {
            Ok(ws) => return Some(ws),
            Err(_) if cancel.is_cancelled() => return None,
            Err(e) => {
                warn!(error = %e, attempt, "reconnect failed");
                inner.set_state(generation, StreamState::Faulted);
            }
        }
        attempt = attempt.saturating_add(1);
    }
}

/// Pump one connection until it closes, fails or is cancelled.
async fn read_until_closed(
    inner: &EventStreamInner,
    generation: u64,
    cancel: &CancellationToken,
    ws: &mut WsStream,
) -> Result<(), uprotect_api::Error> {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Binary(packet))) => {
                    inner.deliver(generation, &packet);
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((1005, String::new()), |f| {
                        (u16::from(f.code), f.reason.as_str().to_owned())
                    });
                    return Err(uprotect_api::Error::WebSocketClosed { code, reason });
                }
                Some(Ok(Message::Text(text))) => {
                    trace!(len = text.len(), "ignoring text frame on updates socket");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(uprotect_api::Error::WebSocketConnect(e.to_string())),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use bytes::Bytes;
    use serde_json::json;
    use uprotect_api::codec::encode_update_packet;
    use uprotect_api::{UpdateAction, UpdateEvent, UpdateHeader, UpdatePayload};

    use super::*;

    fn unreachable_resolver() -> TargetResolver {
        Arc::new(|| -> TargetFuture {
            Box::pin(async {
                Err(CoreError::Transport {
                    message: "no controller in unit tests".into(),
                })
            })
        })
    }

    fn stream() -> (EventStream, Arc<Bus<Notification>>) {
        let bus = Arc::new(Bus::new(16));
        let stream = EventStream::new(
            unreachable_resolver(),
            TransportConfig::default(),
            ReconnectConfig::default(),
            Arc::clone(&bus),
        );
        (stream, bus)
    }

    fn packet(id: &str) -> Bytes {
        let event = UpdateEvent {
            header: UpdateHeader {
                action: UpdateAction::Update,
                id: id.into(),
                model_key: "camera".into(),
                new_update_id: "u-1".into(),
            },
            payload: UpdatePayload::Json(json!({ "isMotionDetected": true })),
        };
        encode_update_packet(&event, false).unwrap()
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (stream, bus) = stream();
        let mut sub = bus.subscribe();
        let generation = stream.current_generation();

        assert!(stream.deliver(generation, &packet("a")));
        assert!(stream.deliver(generation, &packet("b")));

        for expected in ["a", "b"] {
            match sub.recv().await {
                Some(Notification::Update(event)) => assert_eq!(event.header.id, expected),
                other => panic!("unexpected notification: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn undecodable_packets_are_dropped() {
        let (stream, bus) = stream();
        let mut sub = bus.subscribe();
        let generation = stream.current_generation();

        assert!(!stream.deliver(generation, b"\x01\x01\x00\x00garbage"));
        assert!(stream.deliver(generation, &packet("ok")));

        assert!(matches!(sub.recv().await, Some(Notification::Update(_))));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn nothing_published_after_stop() {
        let (stream, bus) = stream();
        let mut sub = bus.subscribe();
        let generation = stream.current_generation();

        assert!(stream.deliver(generation, &packet("before")));
        stream.stop().await;

        for _ in 0..3 {
            assert!(!stream.deliver(generation, &packet("after")));
        }

        assert!(matches!(sub.recv().await, Some(Notification::Update(_))));
        assert!(sub.try_recv().is_none());
        assert_eq!(stream.current_state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn failed_launch_returns_to_idle() {
        let (stream, _bus) = stream();
        let result = stream.launch().await;

        assert!(matches!(result, Err(CoreError::Transport { .. })));
        assert_eq!(stream.current_state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (stream, _bus) = stream();
        stream.stop().await;
        stream.stop().await;
        assert_eq!(stream.current_state(), StreamState::Idle);
    }
}
