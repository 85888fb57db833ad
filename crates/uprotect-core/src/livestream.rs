// ── Livestream ──
//
// One camera channel as fMP4 over a WebSocket. The controller hands out a
// socket URL for the requested camera/channel; the socket then carries a
// plain box stream, which the demuxer splits into one initialization
// segment and a run of `moof`+`mdat` media segments. Livestreams never
// reconnect: when the socket goes away subscribers get a close
// notification and the caller decides whether to start again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;
use uprotect_api::transport::TransportConfig;
use uprotect_api::websocket::{self, Message, WsStream};
use uprotect_api::{ApiRequest, BoxDemuxer, DemuxOutput, ProtectClient, WsEndpoint};

use crate::bus::{Bus, DEFAULT_BUS_CAPACITY, Notification, Subscription};
use crate::error::CoreError;
use crate::executor::Executor;

// ── Types ────────────────────────────────────────────────────────────

/// Progress of a started livestream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Socket open, initialization segment not complete yet.
    AwaitingInit,
    /// Init captured; media segments are flowing.
    Forwarding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivestreamState {
    Idle,
    Requesting,
    Streaming(StreamPhase),
    Stopped,
}

/// Which stream to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivestreamRequest {
    pub camera_id: String,
    pub channel: u32,
    /// Secondary lens on multi-lens cameras.
    pub lens: Option<u32>,
    /// Requested fragment duration.
    pub segment_length: Option<Duration>,
    /// Correlation id; a random UUID is used when absent.
    pub request_id: Option<String>,
}

impl LivestreamRequest {
    pub fn new(camera_id: impl Into<String>, channel: u32) -> Self {
        Self {
            camera_id: camera_id.into(),
            channel,
            lens: None,
            segment_length: None,
            request_id: None,
        }
    }

    pub fn lens(mut self, lens: u32) -> Self {
        self.lens = Some(lens);
        self
    }

    pub fn segment_length(mut self, length: Duration) -> Self {
        self.segment_length = Some(length);
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Query parameters for the `/ws/livestream` endpoint request.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("camera", self.camera_id.clone()),
            ("channel", self.channel.to_string()),
            ("extendedVideoMetadata", "true".to_owned()),
            ("rebroadcast", "true".to_owned()),
        ];
        if let Some(lens) = self.lens {
            params.push(("lens", lens.to_string()));
        }
        if let Some(length) = self.segment_length {
            params.push(("fragmentDurationMillis", length.as_millis().to_string()));
        }
        let request_id = self
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        params.push(("requestId", request_id));
        params
    }
}

// ── Livestream ───────────────────────────────────────────────────────

/// A livestream session for one camera channel at a time.
#[derive(Clone)]
pub struct Livestream {
    inner: Arc<LivestreamInner>,
}

struct LivestreamInner {
    executor: Arc<Executor>,
    transport: TransportConfig,
    bus: Bus<Notification>,
    state: watch::Sender<LivestreamState>,
    init: watch::Sender<Option<Bytes>>,
    generation: Mutex<u64>,
    connection: Mutex<Option<Connection>>,
}

struct Connection {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Livestream {
    pub fn new(executor: Arc<Executor>, transport: TransportConfig) -> Self {
        let (state, _) = watch::channel(LivestreamState::Idle);
        let (init, _) = watch::channel(None);
        Self {
            inner: Arc::new(LivestreamInner {
                executor,
                transport,
                bus: Bus::new(DEFAULT_BUS_CAPACITY),
                state,
                init,
                generation: Mutex::new(0),
                connection: Mutex::new(None),
            }),
        }
    }

    /// Init, segment and close notifications for this stream.
    pub fn subscribe(&self) -> Subscription<Notification> {
        self.inner.bus.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<LivestreamState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> LivestreamState {
        *self.inner.state.borrow()
    }

    /// Request a socket for `request` and start streaming from it.
    ///
    /// Any stream this instance was already running is stopped first.
    pub async fn start(&self, request: LivestreamRequest) -> Result<(), CoreError> {
        self.teardown().await;

        let generation = self.inner.next_generation();
        let cancel = CancellationToken::new();
        self.inner.set_state(generation, LivestreamState::Requesting);

        let ws = match self.inner.open(&request, &cancel).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(camera = %request.camera_id, error = %e, "unable to start livestream");
                self.inner.set_state(generation, LivestreamState::Idle);
                return Err(e);
            }
        };

        self.inner.set_state(
            generation,
            LivestreamState::Streaming(StreamPhase::AwaitingInit),
        );
        let task = tokio::spawn(pump(
            Arc::clone(&self.inner),
            generation,
            cancel.clone(),
            ws,
        ));

        let mut connection = self.inner.lock_connection();
        if self.inner.current_generation() != generation {
            cancel.cancel();
            return Err(CoreError::Stream {
                message: "livestream stopped while connecting".into(),
            });
        }
        *connection = Some(Connection { cancel, task });
        drop(connection);

        info!(
            camera = %request.camera_id,
            channel = request.channel,
            "livestream started"
        );
        Ok(())
    }

    /// Close the socket and drop buffered state. Idempotent; safe before
    /// `start`.
    pub async fn stop(&self) {
        self.teardown().await;
        if self.current_state() != LivestreamState::Idle {
            self.inner.state.send_replace(LivestreamState::Stopped);
        }
    }

    async fn teardown(&self) {
        {
            let mut generation = self.inner.lock_generation();
            *generation += 1;
        }

        let connection = self.inner.lock_connection().take();
        if let Some(connection) = connection {
            connection.cancel.cancel();
            if let Err(e) = connection.task.await {
                warn!(error = %e, "livestream task ended abnormally");
            }
            debug!("livestream socket closed");
        }

        self.inner.init.send_replace(None);
    }

    /// The initialization segment, waiting for it if necessary.
    ///
    /// Once captured, the same bytes are returned immediately on every
    /// call. Fails if the stream ends (or was never started) before the
    /// segment arrives.
    pub async fn init_segment(&self) -> Result<Bytes, CoreError> {
        if let Some(init) = self.cached_init_segment() {
            return Ok(init);
        }

        let mut init = self.inner.init.subscribe();
        let mut state = self.inner.state.subscribe();

        tokio::select! {
            captured = init.wait_for(Option::is_some) => {
                if let Some(bytes) = captured.ok().and_then(|v| v.as_ref().cloned()) {
                    return Ok(bytes);
                }
            }
            _ = state.wait_for(|s| matches!(s, LivestreamState::Idle | LivestreamState::Stopped)) => {}
        }

        self.cached_init_segment().ok_or_else(|| CoreError::Stream {
            message: "livestream ended before its initialization segment arrived".into(),
        })
    }

    /// The initialization segment if it has been captured.
    pub fn cached_init_segment(&self) -> Option<Bytes> {
        self.inner.init.borrow().clone()
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.inner.current_generation()
    }

    pub(crate) fn emit(&self, generation: u64, output: DemuxOutput) -> bool {
        self.inner.emit(generation, output)
    }
}

impl std::fmt::Debug for Livestream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Livestream")
            .field("state", &self.current_state())
            .field("init_captured", &self.inner.init.borrow().is_some())
            .finish_non_exhaustive()
    }
}

impl LivestreamInner {
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

    fn set_state(&self, generation: u64, state: LivestreamState) {
        let current = self.lock_generation();
        if *current == generation {
            self.state.send_replace(state);
        }
    }

    /// Ask the controller for a socket and connect to it.
    async fn open(
        &self,
        request: &LivestreamRequest,
        cancel: &CancellationToken,
    ) -> Result<WsStream, CoreError> {
        let attempt = async {
            let url = self.endpoint(request).await?;
            let cookie = self
                .executor
                .session()
                .load()
                .tokens()
                .map(|t| t.cookie_header().to_owned());
            let ws = websocket::connect(&url, cookie.as_deref(), &self.transport).await?;
            Ok::<_, CoreError>(ws)
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::Stream {
                message: "livestream stopped while connecting".into(),
            }),
            result = attempt => result,
        }
    }

    async fn endpoint(&self, request: &LivestreamRequest) -> Result<Url, CoreError> {
        let params = request.query();
        let url = self
            .executor
            .session()
            .load()
            .client()
            .ws_endpoint_url(WsEndpoint::Livestream, &params);

        let response = self.executor.execute(&ApiRequest::get(url)).await?;
        Ok(ProtectClient::parse_ws_endpoint(&response)?)
    }

    /// Publish one demuxer output for connection `generation`.
    fn emit(&self, generation: u64, output: DemuxOutput) -> bool {
        let current = self.lock_generation();
        if *current != generation {
            trace!("dropping livestream data from retired connection");
            return false;
        }

        match output {
            DemuxOutput::InitSegment(init) => {
                let fresh = self.init.send_if_modified(|slot| {
                    if slot.is_none() {
                        *slot = Some(init.clone());
                        true
                    } else {
                        false
                    }
                });
                if !fresh {
                    return false;
                }
                debug!(len = init.len(), "livestream initialization segment captured");
                self.bus.publish(Notification::LivestreamInit(init));
                self.state
                    .send_replace(LivestreamState::Streaming(StreamPhase::Forwarding));
            }
            DemuxOutput::MediaSegment(segment) => {
                trace!(len = segment.len(), "livestream segment");
                self.bus.publish(Notification::LivestreamSegment(segment));
            }
        }
        true
    }

    /// The socket ended on its own: publish the reason and stop.
    fn finish(&self, generation: u64, reason: String) {
        let current = self.lock_generation();
        if *current != generation {
            return;
        }
        info!(%reason, "livestream closed");
        self.state.send_replace(LivestreamState::Stopped);
        self.bus.publish(Notification::LivestreamClosed(reason));
    }
}

// ── Background pump ──────────────────────────────────────────────────

async fn pump(
    inner: Arc<LivestreamInner>,
    generation: u64,
    cancel: CancellationToken,
    mut ws: WsStream,
) {
    let mut demuxer = BoxDemuxer::new();

    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return;
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Binary(chunk))) => match demuxer.push(&chunk) {
                    Ok(outputs) => {
                        for output in outputs {
                            inner.emit(generation, output);
                        }
                    }
                    Err(e) => {
                        let _ = ws.close(None).await;
                        break format!("livestream demux failed: {e}");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(
                        || "livestream socket closed".to_owned(),
                        |f| format!("livestream socket closed (code {}): {}", u16::from(f.code), f.reason.as_str()),
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("livestream socket error: {e}"),
                None => break "livestream socket ended".to_owned(),
            },
        }
    };

    inner.finish(generation, reason);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use uprotect_api::TokenHeaders;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::session::Session;

    fn livestream() -> Livestream {
        let client =
            ProtectClient::new("nvr.local", &TransportConfig::default(), TokenHeaders::default())
                .unwrap();
        let session = Arc::new(Session::new(client));
        let executor = Arc::new(Executor::new(session, RetryPolicy::default()));
        Livestream::new(executor, TransportConfig::default())
    }

    #[test]
    fn query_carries_optional_params() {
        let request = LivestreamRequest::new("cam-1", 2)
            .lens(1)
            .segment_length(Duration::from_millis(100))
            .request_id("req-7");

        let query = request.query();
        assert_eq!(
            query,
            vec![
                ("camera", "cam-1".to_owned()),
                ("channel", "2".to_owned()),
                ("extendedVideoMetadata", "true".to_owned()),
                ("rebroadcast", "true".to_owned()),
                ("lens", "1".to_owned()),
                ("fragmentDurationMillis", "100".to_owned()),
                ("requestId", "req-7".to_owned()),
            ]
        );
    }

    #[test]
    fn request_id_is_generated() {
        let query = LivestreamRequest::new("cam-1", 0).query();
        let (_, id) = query.iter().find(|(k, _)| *k == "requestId").unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn init_segment_is_cached() {
        let live = livestream();
        let generation = live.current_generation();
        let init = Bytes::from_static(b"ftyp-and-moov");

        assert!(live.emit(generation, DemuxOutput::InitSegment(init.clone())));
        // A second init is ignored.
        assert!(!live.emit(generation, DemuxOutput::InitSegment(Bytes::from_static(b"x"))));

        for _ in 0..5 {
            assert_eq!(live.init_segment().await.unwrap(), init);
        }
        assert_eq!(live.cached_init_segment(), Some(init));
    }

    #[tokio::test]
    async fn init_segment_wakes_waiters() {
        let live = livestream();
        let generation = live.current_generation();
        live.inner
            .state
            .send_replace(LivestreamState::Streaming(StreamPhase::AwaitingInit));

        let waiter = {
            let live = live.clone();
            tokio::spawn(async move { live.init_segment().await })
        };
        tokio::task::yield_now().await;

        live.emit(generation, DemuxOutput::InitSegment(Bytes::from_static(b"init")));
        assert_eq!(waiter.await.unwrap().unwrap(), Bytes::from_static(b"init"));
        assert_eq!(
            live.current_state(),
            LivestreamState::Streaming(StreamPhase::Forwarding)
        );
    }

    #[tokio::test]
    async fn init_segment_fails_when_idle() {
        let live = livestream();
        assert!(matches!(
            live.init_segment().await,
            Err(CoreError::Stream { .. })
        ));
    }

    #[tokio::test]
    async fn nothing_published_after_stop() {
        let live = livestream();
        let mut sub = live.subscribe();
        let generation = live.current_generation();

        assert!(live.emit(generation, DemuxOutput::MediaSegment(Bytes::from_static(b"seg-1"))));
        live.stop().await;
        assert!(!live.emit(generation, DemuxOutput::MediaSegment(Bytes::from_static(b"seg-2"))));

        assert!(matches!(
            sub.recv().await,
            Some(Notification::LivestreamSegment(seg)) if seg == Bytes::from_static(b"seg-1")
        ));
        assert!(sub.try_recv().is_none());
        assert!(live.cached_init_segment().is_none());
    }

    #[tokio::test]
    async fn stop_from_idle_is_safe() {
        let live = livestream();
        live.stop().await;
        live.stop().await;
        assert_eq!(live.current_state(), LivestreamState::Idle);
    }

    #[tokio::test]
    async fn start_without_login_fails_fast() {
        let live = livestream();
        let result = live.start(LivestreamRequest::new("cam-1", 0)).await;
        assert!(matches!(result, Err(CoreError::NotAuthenticated)));
        assert_eq!(live.current_state(), LivestreamState::Idle);
    }
}
