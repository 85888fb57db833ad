// ── Controller facade ──
//
// Ties the session, executor, notification bus and realtime updates
// stream together behind one handle. This is what integrations hold on
// to: log in, bootstrap, listen for updates, start livestreams and push
// configuration changes.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;
use uprotect_api::{ApiEndpoint, ApiRequest, ApiResponse, ProtectClient, WsEndpoint};

use crate::bus::{Bus, DEFAULT_BUS_CAPACITY, Notification, Subscription};
use crate::config::ControllerConfig;
use crate::error::CoreError;
use crate::events::{EventStream, StreamState, TargetFuture, TargetResolver, WsTarget};
use crate::executor::Executor;
use crate::livestream::Livestream;
use crate::model::{self, Bootstrap, DeviceInfo};
use crate::session::{Credentials, Session, SessionState};

/// Optional parameters for [`ProtectController::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Point in time to grab; defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    /// Use the package camera of a two-lens doorbell.
    pub package_camera: bool,
}

// ── ProtectController ────────────────────────────────────────────────

/// Handle to one Protect controller.
///
/// Cheaply cloneable via `Arc<ControllerInner>`.
#[derive(Clone)]
pub struct ProtectController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    session: Arc<Session>,
    executor: Arc<Executor>,
    bus: Arc<Bus<Notification>>,
    events: EventStream,
}

impl ProtectController {
    /// Create a controller handle. Does NOT connect -- call
    /// [`login()`](Self::login) first.
    pub fn new(config: ControllerConfig) -> Result<Self, CoreError> {
        Self::with_updates_target(config, updates_target)
    }

    /// Like [`new()`](Self::new) with a custom way of locating the updates
    /// socket.
    pub(crate) fn with_updates_target(
        config: ControllerConfig,
        resolver: impl FnOnce(Arc<Executor>) -> TargetResolver,
    ) -> Result<Self, CoreError> {
        let client = ProtectClient::new(
            config.url.as_str(),
            &config.transport(),
            config.token_headers.clone(),
        )?;

        let session = Arc::new(Session::new(client));
        let executor = Arc::new(Executor::new(Arc::clone(&session), config.retry));
        let bus = Arc::new(Bus::new(DEFAULT_BUS_CAPACITY));
        let events = EventStream::new(
            resolver(Arc::clone(&executor)),
            config.transport(),
            config.reconnect.clone(),
            Arc::clone(&bus),
        );

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                session,
                executor,
                bus,
                events,
            }),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Subscribe to login, inventory and realtime update notifications.
    pub fn subscribe(&self) -> Subscription<Notification> {
        self.inner.bus.subscribe()
    }

    /// Current session snapshot.
    pub fn session(&self) -> Arc<SessionState> {
        self.inner.session.load()
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.inner.executor
    }

    pub fn events(&self) -> &EventStream {
        &self.inner.events
    }

    // ── Session lifecycle ────────────────────────────────────────────

    /// Log in to the controller at `address`.
    ///
    /// Any previous session is dropped first, so a failed login leaves the
    /// controller unauthenticated. Never fails: the outcome is returned
    /// and published as [`Notification::Login`].
    pub async fn login(&self, address: &str, username: &str, password: SecretString) -> bool {
        self.reset().await;

        let client = match self.client_for(address) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, address, "cannot build client for controller");
                self.inner.session.clear();
                self.inner.bus.publish(Notification::Login(false));
                return false;
            }
        };
        self.inner.session.retarget(Arc::clone(&client));

        match client.login(username, &password).await {
            Ok(tokens) => {
                let credentials = Credentials {
                    username: username.to_owned(),
                    password,
                };
                self.inner
                    .session
                    .install_login(client, credentials, tokens);
                info!(controller = %address, "logged in to Protect controller");
                self.inner.bus.publish(Notification::Login(true));
                true
            }
            Err(e) => {
                warn!(error = %e, controller = %address, "login failed");
                self.inner.bus.publish(Notification::Login(false));
                false
            }
        }
    }

    /// Reuse the current client when `address` points at the same
    /// controller.
    fn client_for(&self, address: &str) -> Result<Arc<ProtectClient>, CoreError> {
        let url = uprotect_api::controller_url(address)?;
        let current = self.inner.session.load();
        if current.client().base_url() == &url {
            return Ok(Arc::clone(current.client()));
        }

        let config = &self.inner.config;
        let client = ProtectClient::new(
            url.as_str(),
            &config.transport(),
            config.token_headers.clone(),
        )?;
        Ok(Arc::new(client))
    }

    /// Fetch the bootstrap and swap it in, then open the realtime updates
    /// socket if it is not running.
    ///
    /// On failure the previous snapshot stays in place. Without a login
    /// this fails without touching the network. A snapshot that arrives
    /// after the session was logged out or replaced is discarded.
    pub async fn fetch_inventory(&self) -> bool {
        let login_epoch = self.inner.session.load().login_epoch();
        match self.fetch_bootstrap().await {
            Ok(bootstrap) => {
                let bootstrap = Arc::new(bootstrap);
                if !self
                    .inner
                    .session
                    .set_inventory(login_epoch, Arc::clone(&bootstrap))
                {
                    debug!("session changed during bootstrap, discarding it");
                    return false;
                }
                debug!(
                    last_update_id = %bootstrap.last_update_id,
                    is_admin = bootstrap.is_admin(),
                    "bootstrap refreshed"
                );
                self.inner
                    .bus
                    .publish(Notification::InventoryUpdated(bootstrap));

                if self.events_state() == StreamState::Idle {
                    if let Err(e) = self.launch_events().await {
                        warn!(error = %e, "realtime updates stream failed to open");
                    }
                }
                true
            }
            Err(CoreError::NotAuthenticated) => {
                debug!("bootstrap requested before login");
                false
            }
            Err(e) => {
                debug!(error = %e, "bootstrap refresh failed");
                false
            }
        }
    }

    async fn fetch_bootstrap(&self) -> Result<Bootstrap, CoreError> {
        let url = self.endpoint_url(ApiEndpoint::Bootstrap);
        let response = self.inner.executor.execute(&ApiRequest::get(url)).await?;
        Ok(response.json()?)
    }

    /// Close the realtime updates socket. Credentials are kept.
    pub async fn reset(&self) {
        self.inner.events.stop().await;
    }

    /// [`reset()`](Self::reset) and forget credentials, tokens, inventory
    /// and privileges.
    pub async fn logout(&self) {
        self.reset().await;
        self.inner.session.clear();
        debug!("logged out");
    }

    // ── Realtime updates ─────────────────────────────────────────────

    /// Open the realtime updates socket. Decoded updates arrive on
    /// [`subscribe()`](Self::subscribe) as [`Notification::Update`].
    pub async fn launch_events(&self) -> Result<(), CoreError> {
        self.inner.events.launch().await
    }

    pub fn events_state(&self) -> StreamState {
        self.inner.events.current_state()
    }

    // ── Snapshot accessors ───────────────────────────────────────────

    /// The current bootstrap, if one has been fetched.
    pub fn bootstrap(&self) -> Option<Arc<Bootstrap>> {
        self.inner.session.load().inventory().cloned()
    }

    /// Whether the logged-in user has administrative privileges.
    pub fn is_admin(&self) -> bool {
        self.inner.session.load().is_admin()
    }

    /// `Controller name [Model]`.
    pub fn name(&self) -> String {
        let state = self.inner.session.load();
        match state.inventory() {
            Some(bootstrap) => bootstrap.nvr.display_name(),
            None => state
                .client()
                .base_url()
                .host_str()
                .unwrap_or_default()
                .to_owned(),
        }
    }

    /// `Name [Model]`, optionally with address and MAC.
    pub fn device_name(&self, device: &Value, name: Option<&str>, with_info: bool) -> String {
        model::device_name(device, name, with_info)
    }

    /// `Controller name [Model] Device name [Model]`.
    pub fn full_name(&self, device: &Value) -> String {
        if DeviceInfo::from_value(device).model_key == "nvr" {
            return self.name();
        }
        format!("{} {}", self.name(), model::device_name(device, None, false))
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Full URL of a named endpoint on the current controller.
    pub fn endpoint_url(&self, endpoint: ApiEndpoint) -> Url {
        self.inner.session.load().client().endpoint_url(endpoint)
    }

    /// Execute an arbitrary request with the session's tokens, re-login
    /// and circuit breaker. Anything other than a read needs an
    /// administrator.
    pub async fn retrieve(&self, request: &ApiRequest) -> Result<ApiResponse, CoreError> {
        if request.is_mutation() {
            self.require_admin("retrieve")?;
        }
        self.inner.executor.execute(request).await
    }

    /// Ask the controller for a livestream or talkback socket URL.
    pub async fn ws_endpoint(
        &self,
        endpoint: WsEndpoint,
        params: &[(&str, String)],
    ) -> Result<Url, CoreError> {
        let url = self
            .inner
            .session
            .load()
            .client()
            .ws_endpoint_url(endpoint, params);
        let response = self.inner.executor.execute(&ApiRequest::get(url)).await?;
        Ok(ProtectClient::parse_ws_endpoint(&response)?)
    }

    /// Fetch a JPEG snapshot from a camera.
    pub async fn snapshot(
        &self,
        camera_id: &str,
        options: &SnapshotOptions,
    ) -> Result<Bytes, CoreError> {
        let mut url = self
            .inner
            .session
            .load()
            .client()
            .device_url(ApiEndpoint::Camera, camera_id);
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.push(if options.package_camera {
                "package-snapshot"
            } else {
                "snapshot"
            });
        }

        let ts = options.timestamp.unwrap_or_else(Utc::now).timestamp_millis();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("ts", &ts.to_string());
            query.append_pair("force", "true");
            if let Some(w) = options.width {
                query.append_pair("w", &w.to_string());
            }
            if let Some(h) = options.height {
                query.append_pair("h", &h.to_string());
            }
        }

        let response = self.inner.executor.execute(&ApiRequest::get(url)).await?;
        Ok(response.body)
    }

    // ── Mutations (admin only) ───────────────────────────────────────

    fn require_admin(&self, operation: &str) -> Result<(), CoreError> {
        if self.is_admin() {
            return Ok(());
        }
        warn!(operation, "refusing change: logged-in user is not an administrator");
        Err(CoreError::PermissionDenied {
            operation: operation.to_owned(),
        })
    }

    /// PATCH a device with a partial configuration and return the
    /// controller's updated copy.
    pub async fn update_device(
        &self,
        model_key: &str,
        id: &str,
        payload: Value,
    ) -> Result<Value, CoreError> {
        self.require_admin("update_device")?;

        let endpoint =
            ApiEndpoint::for_model_key(model_key).ok_or_else(|| CoreError::ValidationFailed {
                message: format!("unsupported device category '{model_key}'"),
            })?;
        let url = self
            .inner
            .session
            .load()
            .client()
            .device_url(endpoint, id);

        debug!(model_key, id, "updating device");
        let response = self
            .inner
            .executor
            .execute(&ApiRequest::patch(url, payload))
            .await?;
        Ok(response.json()?)
    }

    /// Turn on RTSP for every channel of `camera`.
    ///
    /// Returns the camera unchanged, without a request, when every channel
    /// already has RTSP enabled.
    pub async fn enable_rtsp(&self, camera: &Value) -> Result<Value, CoreError> {
        self.require_admin("enable_rtsp")?;

        let info = DeviceInfo::from_value(camera);
        let channels = camera
            .get("channels")
            .and_then(Value::as_array)
            .ok_or_else(|| CoreError::ValidationFailed {
                message: format!("camera '{}' has no channels", info.id),
            })?;

        if channels
            .iter()
            .all(|c| c.get("isRtspEnabled").and_then(Value::as_bool) == Some(true))
        {
            return Ok(camera.clone());
        }

        let channels: Vec<Value> = channels
            .iter()
            .cloned()
            .map(|mut channel| {
                if let Some(obj) = channel.as_object_mut() {
                    obj.insert("isRtspEnabled".into(), Value::Bool(true));
                }
                channel
            })
            .collect();

        self.update_device("camera", &info.id, json!({ "channels": channels }))
            .await
    }

    // ── Livestreams ──────────────────────────────────────────────────

    /// A new livestream bound to this controller's session.
    pub fn create_livestream(&self) -> Livestream {
        Livestream::new(
            Arc::clone(&self.inner.executor),
            self.inner.config.transport(),
        )
    }
}

impl std::fmt::Debug for ProtectController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectController")
            .field("session", &self.inner.session)
            .field("events", &self.inner.events)
            .finish_non_exhaustive()
    }
}

/// Resolve the updates socket: fetch a bootstrap for its `lastUpdateId`
/// and attach the session cookie.
/// Locate the updates socket from the cached bootstrap, fetching one only
/// when none has been stored yet.
fn updates_target(executor: Arc<Executor>) -> TargetResolver {
    Arc::new(move || -> TargetFuture {
        let executor = Arc::clone(&executor);
        Box::pin(async move {
            let state = executor.session().load();
            let client = Arc::clone(state.client());
            let last_update_id = match state.inventory() {
                Some(bootstrap) => bootstrap.last_update_id.clone(),
                None => {
                    let request = ApiRequest::get(client.endpoint_url(ApiEndpoint::Bootstrap));
                    let bootstrap: Bootstrap = executor.execute(&request).await?.json()?;
                    bootstrap.last_update_id
                }
            };

            let cookie = executor
                .session()
                .load()
                .tokens()
                .map(|t| t.cookie_header().to_owned());
            Ok(WsTarget {
                url: client.updates_url(&last_update_id),
                cookie,
            })
        })
    })
}
