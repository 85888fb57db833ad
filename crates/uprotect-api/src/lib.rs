// uprotect-api: Async Rust client for the UniFi Protect wire protocol (HTTP, realtime updates, livestream)

pub mod auth;
pub mod client;
pub mod codec;
pub mod error;
pub mod fmp4;
pub mod transport;
pub mod websocket;

pub use auth::{ApiEndpoint, AuthTokens, TokenHeaders, WsEndpoint};
pub use client::{ApiRequest, ApiResponse, ProtectClient, controller_url};
pub use codec::{DecodeError, UpdateAction, UpdateEvent, UpdateHeader, UpdatePayload};
pub use error::Error;
pub use fmp4::{BoxDemuxer, DemuxError, DemuxOutput};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::ReconnectConfig;
