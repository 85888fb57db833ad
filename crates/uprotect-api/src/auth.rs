// Session token handling and the controller's endpoint table.
//
// A Protect login answers with a session cookie (`Set-Cookie: TOKEN=...`)
// and a CSRF token header. Both must accompany every later request, and
// the controller may rotate the CSRF token on any response. Header and
// cookie names are configuration, not protocol: they live in
// `TokenHeaders` so a firmware change doesn't need a code change.

use reqwest::header::{HeaderMap, SET_COOKIE};
use secrecy::{ExposeSecret, SecretString};
use strum::{AsRefStr, Display, EnumString};

// ── TokenHeaders ─────────────────────────────────────────────────────

/// Names used to find and send the session tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeaders {
    /// Header carrying the CSRF token on login responses and on requests.
    pub csrf: String,
    /// Header the controller uses to hand out a rotated CSRF token.
    pub updated_csrf: String,
    /// Name of the session cookie. The first cookie is used if absent.
    pub cookie_name: String,
}

impl Default for TokenHeaders {
    fn default() -> Self {
        Self {
            csrf: "x-csrf-token".into(),
            updated_csrf: "x-updated-csrf-token".into(),
            cookie_name: "TOKEN".into(),
        }
    }
}

impl TokenHeaders {
    /// Pull the session tokens out of a login response.
    ///
    /// Returns `None` when the response carries no session cookie.
    pub fn extract(&self, headers: &HeaderMap) -> Option<AuthTokens> {
        let cookie = self.session_cookie(headers)?;
        let csrf = header_str(headers, &self.csrf).map(|s| SecretString::from(s.to_owned()));

        Some(AuthTokens {
            cookie: SecretString::from(cookie),
            csrf,
        })
    }

    /// A rotated CSRF token, if the response carries one.
    pub fn rotated_csrf(&self, headers: &HeaderMap) -> Option<String> {
        header_str(headers, &self.updated_csrf).map(String::from)
    }

    /// `name=value` of the session cookie, attributes stripped.
    fn session_cookie(&self, headers: &HeaderMap) -> Option<String> {
        let pairs: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|pair| pair.contains('='))
            .collect();

        pairs
            .iter()
            .find(|pair| {
                pair.split_once('=')
                    .is_some_and(|(name, _)| name == self.cookie_name)
            })
            .or_else(|| pairs.first())
            .map(|pair| (*pair).to_owned())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

// ── AuthTokens ───────────────────────────────────────────────────────

/// Tokens from a successful login. `Debug` never prints the secrets.
#[derive(Debug, Clone)]
pub struct AuthTokens {
    /// Full `name=value` cookie pair, ready for a `Cookie` header.
    pub cookie: SecretString,
    pub csrf: Option<SecretString>,
}

impl AuthTokens {
    /// Copy of these tokens with the CSRF token replaced.
    pub fn with_csrf(&self, csrf: String) -> Self {
        Self {
            cookie: self.cookie.clone(),
            csrf: Some(SecretString::from(csrf)),
        }
    }

    /// Whether `csrf` equals the token already held.
    pub fn csrf_matches(&self, csrf: &str) -> bool {
        self.csrf
            .as_ref()
            .is_some_and(|held| held.expose_secret() == csrf)
    }

    pub fn cookie_header(&self) -> &str {
        self.cookie.expose_secret()
    }
}

// ── Endpoints ────────────────────────────────────────────────────────

/// Named controller endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ApiEndpoint {
    Bootstrap,
    Camera,
    Chime,
    Light,
    Login,
    Nvr,
    #[strum(serialize = "self")]
    SelfUser,
    Sensor,
    Viewer,
    Websocket,
}

impl ApiEndpoint {
    /// Path relative to the controller root.
    pub fn path(self) -> &'static str {
        match self {
            Self::Bootstrap => "/proxy/protect/api/bootstrap",
            Self::Camera => "/proxy/protect/api/cameras",
            Self::Chime => "/proxy/protect/api/chimes",
            Self::Light => "/proxy/protect/api/lights",
            Self::Login => "/api/auth/login",
            Self::Nvr => "/proxy/protect/api/nvr",
            Self::SelfUser => "/api/users/self",
            Self::Sensor => "/proxy/protect/api/sensors",
            Self::Viewer => "/proxy/protect/api/viewers",
            Self::Websocket => "/proxy/protect/ws",
        }
    }

    /// Endpoint serving devices of a bootstrap `modelKey`.
    pub fn for_model_key(model_key: &str) -> Option<Self> {
        match model_key {
            "camera" => Some(Self::Camera),
            "chime" => Some(Self::Chime),
            "light" => Some(Self::Light),
            "nvr" => Some(Self::Nvr),
            "sensor" => Some(Self::Sensor),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

/// Socket endpoints handed out by `/proxy/protect/api/ws/{kind}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum WsEndpoint {
    /// fMP4 livestream of one camera channel.
    Livestream,
    /// Upload socket for AAC/ADTS audio to a camera speaker.
    Talkback,
}

impl WsEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::Livestream => "/proxy/protect/api/ws/livestream",
            Self::Talkback => "/proxy/protect/api/ws/talkback",
        }
    }
}
