use std::env;
use std::time::Duration;

use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::CallError;
use crate::protocol::ParticipantId;

pub const DEFAULT_SIGNAL_URL: &str = "ws://localhost:8080/signal";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(5000);

pub const ENV_SIGNAL_URL: &str = "PEERCALL_SIGNAL_URL";
pub const ENV_ID: &str = "PEERCALL_ID";
pub const ENV_ICE_SERVERS: &str = "PEERCALL_ICE_SERVERS";
pub const ENV_TURN_USERNAME: &str = "PEERCALL_TURN_USERNAME";
pub const ENV_TURN_CREDENTIAL: &str = "PEERCALL_TURN_CREDENTIAL";
pub const ENV_READY_TIMEOUT_MS: &str = "PEERCALL_READY_TIMEOUT_MS";

/// Runtime configuration for one participant.
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay endpoint (`ws://` or `wss://`)
    pub signal_url: Url,
    /// Our address on the relay
    pub self_id: ParticipantId,
    /// ICE servers handed to every new peer connection
    pub ice_servers: Vec<RTCIceServer>,
    /// Bound on `await_ready`
    pub ready_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // The literal is a valid websocket URL.
            signal_url: Url::parse(DEFAULT_SIGNAL_URL).unwrap_or_else(|_| unreachable!()),
            self_id: ParticipantId::random(),
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                ..Default::default()
            }],
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl Config {
    /// Load configuration from `PEERCALL_*` environment variables.
    pub fn from_env() -> Result<Self, CallError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CallError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup(ENV_SIGNAL_URL).filter(|v| !v.trim().is_empty()) {
            config.signal_url = parse_signal_url(&url)?;
        }
        if let Some(id) = lookup(ENV_ID).filter(|v| !v.trim().is_empty()) {
            config.self_id = ParticipantId::new(id.trim());
        }
        if let Some(servers) = lookup(ENV_ICE_SERVERS) {
            config.ice_servers = parse_ice_servers(
                &servers,
                lookup(ENV_TURN_USERNAME),
                lookup(ENV_TURN_CREDENTIAL),
            );
        }
        if let Some(ms) = lookup(ENV_READY_TIMEOUT_MS) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| CallError::Config(format!("{ENV_READY_TIMEOUT_MS}={ms} is not a number")))?;
            if ms == 0 {
                return Err(CallError::Config(format!("{ENV_READY_TIMEOUT_MS} must be positive")));
            }
            config.ready_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_self_id(mut self, id: impl Into<ParticipantId>) -> Self {
        self.self_id = id.into();
        self
    }

    pub fn with_signal_url(mut self, url: &str) -> Result<Self, CallError> {
        self.signal_url = parse_signal_url(url)?;
        Ok(self)
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// No STUN/TURN; host candidates only.
    pub fn localhost_only(mut self) -> Self {
        self.ice_servers.clear();
        self
    }
}

pub fn parse_signal_url(raw: &str) -> Result<Url, CallError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| CallError::Config(format!("invalid signaling url {raw}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(CallError::Config(format!(
            "signaling url must use ws:// or wss://, got {other}://"
        ))),
    }
}

/// Comma-separated ICE URLs. TURN credentials apply to `turn:`/`turns:` entries only.
pub fn parse_ice_servers(
    raw: &str,
    username: Option<String>,
    credential: Option<String>,
) -> Vec<RTCIceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| {
            let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
            RTCIceServer {
                urls: vec![url.to_string()],
                username: if is_turn { username.clone().unwrap_or_default() } else { String::new() },
                credential: if is_turn { credential.clone().unwrap_or_default() } else { String::new() },
                ..Default::default()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex};

    // Environment tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.signal_url.as_str(), DEFAULT_SIGNAL_URL);
        assert_eq!(config.ready_timeout, Duration::from_millis(5000));
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(config.self_id.as_str().starts_with("user"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_SIGNAL_URL, "wss://relay.example.com/signal"),
            (ENV_ID, " alice "),
            (ENV_READY_TIMEOUT_MS, "250"),
            (ENV_ICE_SERVERS, "stun:stun.example.com:3478, turn:turn.example.com:3478"),
            (ENV_TURN_USERNAME, "u"),
            (ENV_TURN_CREDENTIAL, "p"),
        ]))
        .unwrap();
        assert_eq!(config.signal_url.scheme(), "wss");
        assert_eq!(config.self_id.as_str(), "alice");
        assert_eq!(config.ready_timeout, Duration::from_millis(250));
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers[0].username.is_empty());
        assert_eq!(config.ice_servers[1].username, "u");
        assert_eq!(config.ice_servers[1].credential, "p");
    }

    #[test]
    fn empty_ice_list_disables_stun() {
        let config = Config::from_lookup(lookup_from(&[(ENV_ICE_SERVERS, "")])).unwrap();
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        let http = Config::from_lookup(lookup_from(&[(ENV_SIGNAL_URL, "http://localhost/signal")]));
        assert!(matches!(http, Err(CallError::Config(_))));
        let timeout = Config::from_lookup(lookup_from(&[(ENV_READY_TIMEOUT_MS, "soon")]));
        assert!(matches!(timeout, Err(CallError::Config(_))));
        let zero = Config::from_lookup(lookup_from(&[(ENV_READY_TIMEOUT_MS, "0")]));
        assert!(matches!(zero, Err(CallError::Config(_))));
    }

    #[test]
    fn from_env_reads_process_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var(ENV_ID).ok();
        unsafe {
            env::set_var(ENV_ID, "from-env");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.self_id.as_str(), "from-env");
        unsafe {
            match original {
                Some(value) => env::set_var(ENV_ID, value),
                None => env::remove_var(ENV_ID),
            }
        }
    }
}
