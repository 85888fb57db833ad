// ── Bootstrap model ──
//
// The bootstrap document describes every device the controller manages.
// Only the fields the session routes on are typed; everything else rides
// along in `extra` as opaque JSON and is handed to callers untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name shown for a controller that hasn't reported one.
const FALLBACK_CONTROLLER_NAME: &str = "UniFi Protect";

/// Full controller snapshot returned by `/proxy/protect/api/bootstrap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Id of the user the session logged in as.
    pub auth_user_id: String,
    /// Resume point for the realtime updates socket.
    #[serde(default)]
    pub last_update_id: String,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub nvr: Nvr,
    /// Device collections (`cameras`, `lights`, ...) and everything else.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Bootstrap {
    /// The user the session is authenticated as.
    pub fn auth_user(&self) -> Option<&User> {
        self.users.iter().find(|u| u.id == self.auth_user_id)
    }

    /// Whether the authenticated user may change device configuration.
    pub fn is_admin(&self) -> bool {
        self.auth_user().is_some_and(User::can_write_cameras)
    }

    /// Devices of one bootstrap category, by `modelKey` (`camera`, `light`, ...).
    pub fn devices(&self, model_key: &str) -> &[Value] {
        self.extra
            .get(&format!("{model_key}s"))
            .and_then(Value::as_array)
            .map_or(&[], Vec::as_slice)
    }

    /// Look up one device by category and id.
    pub fn device(&self, model_key: &str, id: &str) -> Option<&Value> {
        self.devices(model_key)
            .iter()
            .find(|d| d.get("id").and_then(Value::as_str) == Some(id))
    }
}

/// A controller user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    /// Flattened permission strings, e.g. `camera:create,read,write,delete:*`.
    #[serde(default)]
    pub all_permissions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl User {
    /// Whether any `camera:<actions>:<scope>` grant includes `write`.
    pub fn can_write_cameras(&self) -> bool {
        self.all_permissions.iter().any(|perm| {
            let mut parts = perm.split(':');
            parts.next() == Some("camera")
                && parts
                    .next()
                    .is_some_and(|actions| actions.split(',').any(|a| a.trim() == "write"))
        })
    }
}

/// The NVR entry of the bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nvr {
    #[serde(default)]
    pub id: String,
    pub name: Option<String>,
    pub market_name: Option<String>,
    pub host: Option<String>,
    pub mac: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Nvr {
    /// `Name [Model]`, or whichever half is known.
    pub fn display_name(&self) -> String {
        match (non_empty(self.name.as_deref()), non_empty(self.market_name.as_deref())) {
            (Some(name), Some(market)) => format!("{name} [{market}]"),
            (Some(name), None) => name.to_owned(),
            (None, Some(market)) => market.to_owned(),
            (None, None) => FALLBACK_CONTROLLER_NAME.to_owned(),
        }
    }
}

// ── Device view ──────────────────────────────────────────────────────

/// The handful of device fields used for routing and display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model_key: String,
    pub name: Option<String>,
    pub market_name: Option<String>,
    pub host: Option<String>,
    pub mac: Option<String>,
}

impl DeviceInfo {
    /// Read the routing fields out of an opaque device document.
    ///
    /// Missing or mistyped fields come back empty.
    pub fn from_value(device: &Value) -> Self {
        Self::deserialize(device).unwrap_or_default()
    }
}

/// `Name [Model]`, optionally followed by `(address: ... mac: ...)`.
///
/// `name` overrides the device's own name.
pub fn device_name(device: &Value, name: Option<&str>, with_info: bool) -> String {
    let info = DeviceInfo::from_value(device);
    let market = non_empty(info.market_name.as_deref()).unwrap_or(&info.model_key);
    let name = non_empty(name)
        .or_else(|| non_empty(info.name.as_deref()))
        .unwrap_or(market);

    let mut out = format!("{name} [{market}]");
    if with_info {
        let mut details = Vec::new();
        if let Some(host) = non_empty(info.host.as_deref()) {
            details.push(format!("address: {host}"));
        }
        if let Some(mac) = non_empty(info.mac.as_deref()) {
            details.push(format!("mac: {mac}"));
        }
        if !details.is_empty() {
            out.push_str(&format!(" ({})", details.join(" ")));
        }
    }
    out
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn bootstrap(permissions: &[&str]) -> Bootstrap {
        serde_json::from_value(json!({
            "authUserId": "u1",
            "lastUpdateId": "upd-9",
            "accessKey": "ignored",
            "users": [
                { "id": "u0", "allPermissions": ["camera:create,read,write,delete:*"] },
                { "id": "u1", "allPermissions": permissions, "name": "viewer" }
            ],
            "nvr": { "id": "nvr-1", "name": "Home", "marketName": "UNVR", "host": "10.0.0.2" },
            "cameras": [
                { "id": "cam-1", "modelKey": "camera", "name": "Porch", "marketName": "G4 Pro" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn admin_requires_camera_write() {
        assert!(bootstrap(&["camera:read,write:*"]).is_admin());
        assert!(!bootstrap(&["camera:read:*", "light:read,write:*"]).is_admin());
        assert!(!bootstrap(&[]).is_admin());
    }

    #[test]
    fn admin_is_false_without_matching_user() {
        let mut b = bootstrap(&["camera:write:*"]);
        b.auth_user_id = "nobody".into();
        assert!(!b.is_admin());
    }

    #[test]
    fn unknown_fields_are_kept() {
        let b = bootstrap(&[]);
        assert_eq!(b.last_update_id, "upd-9");
        assert_eq!(b.extra["accessKey"], "ignored");
        assert_eq!(b.users[1].extra["name"], "viewer");

        let round: Value = serde_json::to_value(&b).unwrap();
        assert_eq!(round["cameras"][0]["name"], "Porch");
    }

    #[test]
    fn device_lookup() {
        let b = bootstrap(&[]);
        assert_eq!(b.devices("camera").len(), 1);
        assert!(b.devices("sensor").is_empty());
        assert!(b.device("camera", "cam-1").is_some());
        assert!(b.device("camera", "cam-2").is_none());
    }

    #[test]
    fn device_name_formats() {
        let cam = json!({
            "id": "cam-1",
            "modelKey": "camera",
            "name": "Porch",
            "marketName": "G4 Pro",
            "host": "10.0.0.7",
            "mac": "AABBCCDDEEFF"
        });

        assert_eq!(device_name(&cam, None, false), "Porch [G4 Pro]");
        assert_eq!(device_name(&cam, Some("Front"), false), "Front [G4 Pro]");
        assert_eq!(
            device_name(&cam, None, true),
            "Porch [G4 Pro] (address: 10.0.0.7 mac: AABBCCDDEEFF)"
        );

        let unnamed = json!({ "modelKey": "sensor", "marketName": "UP Sense" });
        assert_eq!(device_name(&unnamed, None, true), "UP Sense [UP Sense]");
    }

    #[test]
    fn nvr_display_name() {
        assert_eq!(bootstrap(&[]).nvr.display_name(), "Home [UNVR]");
        assert_eq!(Nvr::default().display_name(), "UniFi Protect");
    }
}
