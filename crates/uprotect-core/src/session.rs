// ── Session state ──
//
// Everything a logged-in controller connection knows: the HTTP client for
// its address, credentials, tokens, the bootstrap snapshot and the admin
// flag. The whole value is immutable and replaced wholesale through
// `ArcSwap`, so readers never see tokens from one login next to the
// inventory of another.

use std::sync::Arc;

use arc_swap::ArcSwap;
use secrecy::SecretString;
use uprotect_api::{AuthTokens, ProtectClient};

use crate::model::Bootstrap;

/// Username and password kept for transparent re-login.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// One consistent view of the session.
#[derive(Clone)]
pub struct SessionState {
    client: Arc<ProtectClient>,
    credentials: Option<Credentials>,
    tokens: Option<AuthTokens>,
    auth_epoch: u64,
    login_epoch: u64,
    inventory: Option<Arc<Bootstrap>>,
    is_admin: bool,
}

impl SessionState {
    pub fn client(&self) -> &Arc<ProtectClient> {
        &self.client
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn tokens(&self) -> Option<&AuthTokens> {
        self.tokens.as_ref()
    }

    /// Bumped every time the token set is replaced or cleared.
    pub fn auth_epoch(&self) -> u64 {
        self.auth_epoch
    }

    /// Bumped on login, retarget and logout; a re-login keeps it.
    pub fn login_epoch(&self) -> u64 {
        self.login_epoch
    }

    pub fn inventory(&self) -> Option<&Arc<Bootstrap>> {
        self.inventory.as_ref()
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("controller", &self.client.base_url().as_str())
            .field(
                "username",
                &self.credentials.as_ref().map(|c| c.username.as_str()),
            )
            .field("authenticated", &self.tokens.is_some())
            .field("auth_epoch", &self.auth_epoch)
            .field("login_epoch", &self.login_epoch)
            .field("bootstrapped", &self.inventory.is_some())
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

/// Shared, atomically swapped session.
pub struct Session {
    state: ArcSwap<SessionState>,
}

impl Session {
    /// An unauthenticated session bound to `client`.
    pub fn new(client: ProtectClient) -> Self {
        Self {
            state: ArcSwap::from_pointee(SessionState {
                client: Arc::new(client),
                credentials: None,
                tokens: None,
                auth_epoch: 0,
                login_epoch: 0,
                inventory: None,
                is_admin: false,
            }),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<SessionState> {
        self.state.load_full()
    }

    fn update(&self, f: impl Fn(&mut SessionState)) {
        self.state.rcu(|current| {
            let mut next = SessionState::clone(current);
            f(&mut next);
            next
        });
    }

    /// Install the result of a successful login. Stale inventory goes with
    /// the old tokens.
    pub fn install_login(
        &self,
        client: Arc<ProtectClient>,
        credentials: Credentials,
        tokens: AuthTokens,
    ) {
        self.update(|s| {
            s.client = Arc::clone(&client);
            s.credentials = Some(credentials.clone());
            s.tokens = Some(tokens.clone());
            s.auth_epoch += 1;
            s.login_epoch += 1;
            s.inventory = None;
            s.is_admin = false;
        });
    }

    /// Point the session at another controller, dropping everything tied
    /// to the old one.
    pub fn retarget(&self, client: Arc<ProtectClient>) {
        self.update(|s| {
            s.client = Arc::clone(&client);
            s.credentials = None;
            s.tokens = None;
            s.auth_epoch += 1;
            s.login_epoch += 1;
            s.inventory = None;
            s.is_admin = false;
        });
    }

    /// Replace tokens after a re-login, unless another login already
    /// replaced the ones that were rejected.
    pub fn refresh_tokens(&self, rejected_epoch: u64, tokens: AuthTokens) -> bool {
        let mut applied = false;
        self.state.rcu(|current| {
            applied = current.auth_epoch == rejected_epoch && current.credentials.is_some();
            let mut next = SessionState::clone(current);
            if applied {
                next.tokens = Some(tokens.clone());
                next.auth_epoch += 1;
            }
            next
        });
        applied
    }

    /// Adopt a rotated CSRF token issued for the tokens of `epoch`.
    pub fn rotate_csrf(&self, epoch: u64, csrf: &str) {
        let current = self.state.load();
        let unchanged = current
            .tokens
            .as_ref()
            .is_none_or(|t| t.csrf_matches(csrf));
        if current.auth_epoch != epoch || unchanged {
            return;
        }

        self.update(|s| {
            if s.auth_epoch == epoch {
                s.tokens = s.tokens.as_ref().map(|t| t.with_csrf(csrf.to_owned()));
            }
        });
        tracing::trace!("adopted rotated CSRF token");
    }

    /// Swap in a new bootstrap and the admin flag derived from it, unless
    /// the login it was fetched under has since been replaced or cleared.
    pub fn set_inventory(&self, login_epoch: u64, inventory: Arc<Bootstrap>) -> bool {
        let is_admin = inventory.is_admin();
        let mut applied = false;
        self.state.rcu(|current| {
            applied = current.login_epoch == login_epoch && current.tokens.is_some();
            let mut next = SessionState::clone(current);
            if applied {
                next.inventory = Some(Arc::clone(&inventory));
                next.is_admin = is_admin;
            }
            next
        });
        applied
    }

    /// Forget credentials, tokens, inventory and privileges.
    pub fn clear(&self) {
        self.update(|s| {
            s.credentials = None;
            s.tokens = None;
            s.auth_epoch += 1;
            s.login_epoch += 1;
            s.inventory = None;
            s.is_admin = false;
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.state.load().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;
    use uprotect_api::{TokenHeaders, TransportConfig};

    use super::*;

    fn bare_client() -> ProtectClient {
        ProtectClient::new("nvr.local", &TransportConfig::default(), TokenHeaders::default())
            .unwrap()
    }

    fn client() -> Arc<ProtectClient> {
        Arc::new(bare_client())
    }

    fn tokens(cookie: &str, csrf: &str) -> AuthTokens {
        AuthTokens {
            cookie: SecretString::from(cookie.to_owned()),
            csrf: Some(SecretString::from(csrf.to_owned())),
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "admin".into(),
            password: SecretString::from("hunter2".to_owned()),
        }
    }

    fn inventory(admin: bool) -> Arc<Bootstrap> {
        let perms = if admin {
            json!(["camera:read,write:*"])
        } else {
            json!([])
        };
        Arc::new(
            serde_json::from_value(json!({
                "authUserId": "u1",
                "users": [{ "id": "u1", "allPermissions": perms }]
            }))
            .unwrap(),
        )
    }

    fn logged_in() -> Session {
        let session = Session::new(bare_client());
        session.install_login(client(), credentials(), tokens("TOKEN=a", "c1"));
        session
    }

    fn install_inventory(session: &Session, admin: bool) {
        let epoch = session.load().login_epoch();
        assert!(session.set_inventory(epoch, inventory(admin)));
    }

    #[test]
    fn login_clears_stale_inventory() {
        let session = logged_in();
        install_inventory(&session, true);
        assert!(session.load().is_admin());

        session.install_login(client(), credentials(), tokens("TOKEN=b", "c2"));
        let state = session.load();
        assert!(state.inventory().is_none());
        assert!(!state.is_admin());
        assert_eq!(state.tokens().unwrap().cookie_header(), "TOKEN=b");
    }

    #[test]
    fn refresh_is_keyed_by_epoch() {
        let session = logged_in();
        let epoch = session.load().auth_epoch();

        assert!(session.refresh_tokens(epoch, tokens("TOKEN=b", "c2")));
        // A second caller that saw the same rejection must not apply again.
        assert!(!session.refresh_tokens(epoch, tokens("TOKEN=c", "c3")));

        let state = session.load();
        assert_eq!(state.tokens().unwrap().cookie_header(), "TOKEN=b");
        assert_eq!(state.auth_epoch(), epoch + 1);
    }

    #[test]
    fn csrf_rotation_ignores_stale_epochs() {
        let session = logged_in();
        let epoch = session.load().auth_epoch();

        session.rotate_csrf(epoch, "c9");
        assert!(session.load().tokens().unwrap().csrf_matches("c9"));

        session.rotate_csrf(epoch + 5, "zz");
        assert!(session.load().tokens().unwrap().csrf_matches("c9"));
    }

    #[test]
    fn clear_discards_everything() {
        let session = logged_in();
        install_inventory(&session, true);
        session.clear();

        let state = session.load();
        assert!(!state.is_authenticated());
        assert!(state.credentials().is_none());
        assert!(state.inventory().is_none());
        assert!(!state.is_admin());
    }

    #[test]
    fn inventory_from_a_replaced_login_is_dropped() {
        let session = logged_in();
        let epoch = session.load().login_epoch();

        session.clear();
        assert!(!session.set_inventory(epoch, inventory(true)));
        assert!(session.load().inventory().is_none());
        assert!(!session.load().is_admin());

        session.install_login(client(), credentials(), tokens("TOKEN=b", "c2"));
        assert!(!session.set_inventory(epoch, inventory(true)));
        assert!(!session.load().is_admin());
    }

    #[test]
    fn relogin_keeps_inventory_epoch() {
        let session = logged_in();
        let state = session.load();

        assert!(session.refresh_tokens(state.auth_epoch(), tokens("TOKEN=b", "c2")));
        assert!(session.set_inventory(state.login_epoch(), inventory(false)));
        assert!(session.load().inventory().is_some());
    }

    #[test]
    fn debug_never_prints_secrets() {
        let session = logged_in();
        let out = format!("{session:?}");
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("TOKEN=a"));
        assert!(out.contains("admin"));
    }
}
