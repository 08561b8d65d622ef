//! Client-identity fingerprint.
//!
//! The platform expects requests and the identify payload to carry a
//! base64-encoded JSON blob describing the client. Two shapes are offered:
//! `default` approximates the desktop client, `anonymous` approximates the
//! web client. Both carry per-launch identifiers that the gateway reuses in
//! heartbeat side-channels.

use base64::Engine;
use serde_json::{json, Map, Value};
use uuid::Uuid;

const CLIENT_VERSION: &str = "0.0.115";
const USER_AGENT_WEB: &str = "Mozilla/5.0 (%OS; rv:145.0) Gecko/20100101 Firefox/145.0";
const USER_AGENT_DESKTOP: &str = concat!(
    "Mozilla/5.0 (%OS) AppleWebKit/537.36 (KHTML, like Gecko) discord/",
    "0.0.115",
    " Chrome/138.0.7204.251 Electron/37.6.0 Safari/537.36"
);
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LINUX_UA_STRING: &str = "X11; Linux x86_64";
#[cfg(target_os = "windows")]
const WINDOWS_UA_STRING: &str = "Windows NT %VER; Win64; x64";
#[cfg(target_os = "macos")]
const MACOS_UA_STRING: &str = "Macintosh; Intel Mac OS X %VER";
#[cfg(target_os = "windows")]
const WINDOWS_DEFAULT_VER: &str = "10.0";
#[cfg(target_os = "macos")]
const MACOS_DEFAULT_VER: &str = "15.3";

/// An assembled identity fingerprint.
#[derive(Debug, Clone)]
pub struct ClientProperties {
    data: Map<String, Value>,
    pub user_agent: String,
}

impl ClientProperties {
    /// Desktop-client-shaped properties.
    pub fn default_mode() -> Self {
        let os_version = host_os_version();
        let arch = "x64";

        let mut data = Map::new();
        data.insert("os".into(), json!(os_name()));
        data.insert("browser".into(), json!("Discord Client"));
        data.insert("release_channel".into(), json!("stable"));
        data.insert("os_version".into(), json!(os_version));
        data.insert("os_arch".into(), json!(arch));
        data.insert("app_arch".into(), json!(arch));
        data.insert("system_locale".into(), json!(system_locale()));
        data.insert("has_client_mods".into(), json!(false));
        data.insert("browser_user_agent".into(), json!(""));
        data.insert("browser_version".into(), json!(""));
        data.insert("runtime_environment".into(), json!("native"));
        data.insert("client_build_number".into(), Value::Null);
        data.insert("native_build_number".into(), Value::Null);
        data.insert("client_event_source".into(), Value::Null);
        data.insert("launch_signature".into(), json!(Uuid::new_v4().to_string()));
        data.insert("client_launch_id".into(), json!(Uuid::new_v4().to_string()));
        data.insert(
            "client_heartbeat_session_id".into(),
            json!(Uuid::new_v4().to_string()),
        );
        #[cfg(target_os = "linux")]
        data.insert("window_manager".into(), json!(window_manager()));

        let user_agent = adjust_user_agent_os(USER_AGENT_DESKTOP, Some(os_version.as_str()));
        data.insert("client_version".into(), json!(CLIENT_VERSION));

        let mut properties = Self {
            data,
            user_agent: String::new(),
        };
        properties.set_user_agent(&user_agent);
        properties
    }

    /// Web-client-shaped properties, with most identifying fields blanked.
    pub fn anonymous() -> Self {
        let mut data = Map::new();
        data.insert("os".into(), json!(os_name()));
        data.insert("browser".into(), json!("Mozilla"));
        data.insert("device".into(), json!(""));
        data.insert("system_locale".into(), json!(system_locale()));
        data.insert("browser_user_agent".into(), json!(""));
        data.insert("browser_version".into(), json!(""));
        data.insert("os_version".into(), json!(""));
        data.insert("referrer".into(), json!(""));
        data.insert("referring_domain".into(), json!(""));
        data.insert("referrer_current".into(), json!(""));
        data.insert("referring_domain_current".into(), json!(""));
        data.insert("release_channel".into(), json!("stable"));
        data.insert("client_build_number".into(), Value::Null);
        data.insert("client_event_source".into(), Value::Null);
        data.insert("has_client_mods".into(), json!(false));
        data.insert("launch_signature".into(), json!(Uuid::new_v4().to_string()));
        data.insert("client_launch_id".into(), json!(Uuid::new_v4().to_string()));
        data.insert(
            "client_heartbeat_session_id".into(),
            json!(Uuid::new_v4().to_string()),
        );

        let user_agent = adjust_user_agent_os(USER_AGENT_WEB, None);
        let mut properties = Self {
            data,
            user_agent: String::new(),
        };
        properties.set_user_agent(&user_agent);
        properties
    }

    /// Override the user agent (and the browser version extracted from it).
    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.set_user_agent(user_agent);
        self
    }

    fn set_user_agent(&mut self, user_agent: &str) {
        self.user_agent = user_agent.to_string();
        self.data
            .insert("browser_user_agent".into(), json!(user_agent));
        self.data.insert(
            "browser_version".into(),
            json!(extract_browser_version(user_agent)),
        );
    }

    /// Base64 fingerprint for the `X-Super-Properties` header.
    pub fn encoded(&self) -> String {
        let raw = serde_json::to_string(&Value::Object(self.data.clone())).unwrap_or_default();
        base64::engine::general_purpose::STANDARD.encode(raw)
    }

    /// Properties object for identify, with the gateway-only extras.
    pub fn gateway_value(&self) -> Value {
        let mut data = self.data.clone();
        data.insert("client_app_state".into(), json!("unfocused"));
        data.insert("is_fast_connect".into(), json!(false));
        Value::Object(data)
    }

    pub fn launch_id(&self) -> String {
        self.string_field("client_launch_id")
    }

    pub fn heartbeat_session_id(&self) -> String {
        self.string_field("client_heartbeat_session_id")
    }

    fn string_field(&self, key: &str) -> String {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

fn os_name() -> &'static str {
    #[cfg(target_os = "linux")]
    return "Linux";
    #[cfg(target_os = "windows")]
    return "Windows";
    #[cfg(target_os = "macos")]
    return "Mac OS X";
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    "Linux"
}

fn host_os_version() -> String {
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("uname")
            .arg("-r")
            .output()
            .ok()
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|version| version.trim().to_string())
            .unwrap_or_default()
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|version| version.trim().to_string())
            .unwrap_or_else(|| MACOS_DEFAULT_VER.to_string())
    }
    #[cfg(target_os = "windows")]
    {
        WINDOWS_DEFAULT_VER.to_string()
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        String::new()
    }
}

fn system_locale() -> String {
    std::env::var("LC_ALL")
        .or_else(|_| std::env::var("LANG"))
        .ok()
        .and_then(|locale| locale.split('.').next().map(str::to_string))
        .filter(|locale| !locale.is_empty())
        .unwrap_or_else(|| "en_US".to_string())
}

#[cfg(target_os = "linux")]
fn window_manager() -> String {
    let desktop = std::env::var("XDG_CURRENT_DESKTOP").unwrap_or_else(|_| "unknown".to_string());
    let session = std::env::var("GDMSESSION").unwrap_or_else(|_| "unknown".to_string());
    format!("{desktop},{session}")
}

/// Substitute the `%OS` placeholder for the current platform.
fn adjust_user_agent_os(template: &str, os_version: Option<&str>) -> String {
    #[cfg(target_os = "windows")]
    let os_string = {
        let version = os_version.filter(|v| !v.is_empty()).unwrap_or(WINDOWS_DEFAULT_VER);
        let short: Vec<&str> = version.splitn(3, '.').take(2).collect();
        WINDOWS_UA_STRING.replace("%VER", &short.join("."))
    };
    #[cfg(target_os = "macos")]
    let os_string = {
        let version = os_version.filter(|v| !v.is_empty()).unwrap_or(MACOS_DEFAULT_VER);
        MACOS_UA_STRING.replace("%VER", &version.replace('.', "_"))
    };
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let os_string = {
        let _ = os_version;
        LINUX_UA_STRING.to_string()
    };
    template.replace("%OS", &os_string)
}

/// Pull a version number out of the user agent, by browser marker.
fn extract_browser_version(user_agent: &str) -> String {
    for marker in ["Firefox/", "Opera/"] {
        if user_agent.contains(&marker[..marker.len() - 1]) {
            if let Some(version) = version_after(user_agent, marker) {
                return version;
            }
        }
    }
    if user_agent.contains("Electron") {
        if let Some(version) = version_after(user_agent, "Electron/") {
            return version;
        }
    }
    version_after(user_agent, "Chrome/").unwrap_or_default()
}

fn version_after(user_agent: &str, marker: &str) -> Option<String> {
    let start = user_agent.find(marker)? + marker.len();
    let version: String = user_agent[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    (!version.is_empty()).then_some(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_shape() {
        let properties = ClientProperties::default_mode();
        assert_eq!(properties.data["browser"], "Discord Client");
        assert_eq!(properties.data["client_version"], CLIENT_VERSION);
        assert!(!properties.launch_id().is_empty());
        assert!(!properties.heartbeat_session_id().is_empty());
        assert_ne!(properties.launch_id(), properties.heartbeat_session_id());
        assert!(properties.user_agent.contains("discord/0.0.115"));
    }

    #[test]
    fn test_anonymous_mode_blanks_host_details() {
        let properties = ClientProperties::anonymous();
        assert_eq!(properties.data["browser"], "Mozilla");
        assert_eq!(properties.data["os_version"], "");
        assert!(properties.user_agent.contains("Firefox"));
        assert_eq!(properties.data["browser_version"], "145.0");
    }

    #[test]
    fn test_gateway_value_extras() {
        let value = ClientProperties::anonymous().gateway_value();
        assert_eq!(value["client_app_state"], "unfocused");
        assert_eq!(value["is_fast_connect"], false);
        // The REST fingerprint stays free of gateway extras.
        let encoded = ClientProperties::anonymous().encoded();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let parsed: Value = serde_json::from_slice(&decoded).unwrap();
        assert!(parsed.get("client_app_state").is_none());
    }

    #[test]
    fn test_custom_user_agent_updates_version() {
        let properties = ClientProperties::default_mode()
            .with_user_agent("Mozilla/5.0 (X11; Linux x86_64; rv:140.0) Gecko/20100101 Firefox/140.0");
        assert_eq!(properties.data["browser_version"], "140.0");
        assert!(properties.user_agent.contains("Firefox/140.0"));
    }

    #[test]
    fn test_extract_browser_version() {
        assert_eq!(
            extract_browser_version("Mozilla/5.0 AppleWebKit Chrome/138.0.7204.251 Safari/537.36"),
            "138.0.7204.251"
        );
        assert_eq!(extract_browser_version("unrecognized"), "");
    }
}
