// uprotect-core: Session, resilient request execution and realtime streams on top of uprotect-api.

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod livestream;
pub mod model;
pub mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bus::{Bus, Notification, NotificationStream, Subscription};
pub use config::{ControllerConfig, ReconnectConfig, RetryPolicy, TlsVerification, TokenHeaders};
pub use controller::{ProtectController, SnapshotOptions};
pub use error::CoreError;
pub use events::{EventStream, StreamState};
pub use executor::Executor;
pub use livestream::{Livestream, LivestreamRequest, LivestreamState, StreamPhase};
pub use model::{Bootstrap, DeviceInfo, Nvr, User, device_name};
pub use session::{Credentials, Session, SessionState};

// Wire types callers see in notifications and requests.
pub use uprotect_api::{ApiEndpoint, ApiRequest, ApiResponse, UpdateAction, UpdateEvent, WsEndpoint};
