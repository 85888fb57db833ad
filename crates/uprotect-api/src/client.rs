// Protect controller HTTP client
//
// Wraps `reqwest::Client` with Protect URL construction, token injection
// and status mapping. It keeps no session state of its own: tokens are
// passed in per request so the caller can swap them atomically and retry
// with fresh ones.

use bytes::Bytes;
use reqwest::header::{COOKIE, HeaderMap};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, trace};
use url::Url;

use crate::auth::{ApiEndpoint, AuthTokens, TokenHeaders, WsEndpoint};
use crate::error::Error;
use crate::transport::TransportConfig;

// ── Request / response ───────────────────────────────────────────────

/// A request against the controller, independent of any session.
///
/// Cheap to clone so it can be replayed after a re-login.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            body: None,
        }
    }

    pub fn patch(url: Url, body: serde_json::Value) -> Self {
        Self {
            method: Method::PATCH,
            url,
            body: Some(body),
        }
    }

    pub fn post(url: Url, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url,
            body: Some(body),
        }
    }

    /// Whether the request changes controller state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

/// A successful (2xx) controller response, fully read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|e| {
            let body = String::from_utf8_lossy(&self.body).into_owned();
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body,
            }
        })
    }
}

#[derive(serde::Deserialize)]
struct WsEndpointResponse {
    url: String,
}

// ── ProtectClient ────────────────────────────────────────────────────

/// Raw HTTP client for a Protect controller.
pub struct ProtectClient {
    http: reqwest::Client,
    base_url: Url,
    transport: TransportConfig,
    token_headers: TokenHeaders,
}

impl ProtectClient {
    /// Create a client for the controller at `address`.
    ///
    /// `address` is a host name or IP (HTTPS is implied), or a full base
    /// URL when the scheme or port needs to be explicit.
    pub fn new(
        address: &str,
        transport: &TransportConfig,
        token_headers: TokenHeaders,
    ) -> Result<Self, Error> {
        let base_url = controller_url(address)?;
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url, transport.clone(), token_headers))
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        base_url: Url,
        transport: TransportConfig,
        token_headers: TokenHeaders,
    ) -> Self {
        Self {
            http,
            base_url,
            transport,
            token_headers,
        }
    }

    /// The controller base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    pub fn token_headers(&self) -> &TokenHeaders {
        &self.token_headers
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Full URL of a named endpoint.
    pub fn endpoint_url(&self, endpoint: ApiEndpoint) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(endpoint.path());
        url
    }

    /// URL of one device: `{category endpoint}/{id}`. The NVR has no id.
    pub fn device_url(&self, endpoint: ApiEndpoint, id: &str) -> Url {
        let mut url = self.endpoint_url(endpoint);
        if endpoint != ApiEndpoint::Nvr {
            if let Ok(mut segs) = url.path_segments_mut() {
                segs.push(id);
            }
        }
        url
    }

    /// URL of a socket-endpoint request, with its query parameters.
    pub fn ws_endpoint_url(&self, endpoint: WsEndpoint, params: &[(&str, String)]) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(endpoint.path());
        if !params.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
        }
        url
    }

    /// Realtime updates socket URL, resuming after `last_update_id`.
    pub fn updates_url(&self, last_update_id: &str) -> Url {
        let mut url = self.endpoint_url(ApiEndpoint::Websocket);
        let secure = self.base_url.scheme() == "https";
        // http(s) -> ws(s) is always a valid scheme change.
        let _ = url.set_scheme(if secure { "wss" } else { "ws" });
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.push("updates");
        }
        url.query_pairs_mut()
            .append_pair("lastUpdateId", last_update_id);
        url
    }

    // ── Authentication ───────────────────────────────────────────────

    /// Authenticate and return the session tokens.
    ///
    /// `POST /api/auth/login`; the controller answers with a session
    /// cookie and a CSRF token header.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<AuthTokens, Error> {
        let url = self.endpoint_url(ApiEndpoint::Login);
        debug!("logging in at {}", url);

        let body = json!({
            "username": username,
            "password": password.expose_secret(),
            "rememberMe": true,
            "token": "",
        });

        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("login failed (HTTP {status}): {}", preview(&body)),
            });
        }

        let tokens = self
            .token_headers
            .extract(resp.headers())
            .ok_or_else(|| Error::Authentication {
                message: "login response carried no session cookie".into(),
            })?;

        debug!("login successful");
        Ok(tokens)
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Send a request with the given session tokens.
    ///
    /// 401/403 map to [`Error::SessionRejected`], any other non-2xx to
    /// [`Error::Api`].
    pub async fn send(
        &self,
        request: &ApiRequest,
        tokens: Option<&AuthTokens>,
    ) -> Result<ApiResponse, Error> {
        debug!("{} {}", request.method, request.url);

        let mut builder = self.http.request(request.method.clone(), request.url.clone());
        if let Some(tokens) = tokens {
            builder = builder.header(COOKIE, tokens.cookie_header());
            if let Some(csrf) = &tokens.csrf {
                builder = builder.header(self.token_headers.csrf.as_str(), csrf.expose_secret());
            }
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(Error::Transport)?;
        let status = resp.status();
        let headers = resp.headers().clone();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            trace!(%status, "session rejected");
            return Err(Error::SessionRejected {
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message: preview(&body).to_owned(),
            });
        }

        let body = resp.bytes().await.map_err(Error::Transport)?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// Extract the socket URL from a `/ws/{kind}` response.
    pub fn parse_ws_endpoint(response: &ApiResponse) -> Result<Url, Error> {
        let parsed: WsEndpointResponse = response.json()?;
        Ok(Url::parse(&parsed.url)?)
    }
}

/// Resolve a controller address to its base URL.
pub fn controller_url(address: &str) -> Result<Url, Error> {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        Ok(Url::parse(address)?)
    } else {
        Ok(Url::parse(&format!("https://{address}"))?)
    }
}

fn preview(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
