//! Call core configuration.
//!
//! Configuration is loaded from environment variables. TURN credentials
//! are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default public STUN servers.
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Default time a negotiation may take to reach Connected.
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECONDS: u64 = 30;

/// Default call duration tick.
pub const DEFAULT_DURATION_TICK_MILLIS: u64 = 1000;

/// Default session actor mailbox capacity.
pub const DEFAULT_SESSION_MAILBOX_SIZE: usize = 500;

/// Default negotiator actor mailbox capacity.
pub const DEFAULT_NEGOTIATOR_MAILBOX_SIZE: usize = 200;

/// Default bound on remote candidates held before a remote description exists.
pub const DEFAULT_MAX_PENDING_CANDIDATES: usize = 64;

/// Default screen capture frame rate.
pub const DEFAULT_SCREEN_FRAME_RATE: u32 = 30;

/// One ICE server entry handed to every peer connection.
#[derive(Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<SecretString>,
}

impl IceServer {
    /// A credential-less server (STUN, or TURN with open relay).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

impl fmt::Debug for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServer")
            .field("urls", &self.urls)
            .field("username", &self.username)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Call core configuration.
#[derive(Clone)]
pub struct Config {
    /// ICE servers for every peer connection.
    pub ice_servers: Vec<IceServer>,

    /// Deadline for a negotiation to reach Connected (default: 30s).
    pub negotiation_timeout: Duration,

    /// Call duration ticker period (default: 1s).
    pub duration_tick: Duration,

    /// Session actor mailbox capacity.
    pub session_mailbox_size: usize,

    /// Negotiator actor mailbox capacity.
    pub negotiator_mailbox_size: usize,

    /// Remote candidates held per negotiation before a remote description exists.
    pub max_pending_candidates: usize,

    /// Screen capture frame rate.
    pub screen_frame_rate: u32,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("ice_servers", &self.ice_servers)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("duration_tick", &self.duration_tick)
            .field("session_mailbox_size", &self.session_mailbox_size)
            .field("negotiator_mailbox_size", &self.negotiator_mailbox_size)
            .field("max_pending_candidates", &self.max_pending_candidates)
            .field("screen_frame_rate", &self.screen_frame_rate)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS
                .iter()
                .map(|url| IceServer::new(*url))
                .collect(),
            negotiation_timeout: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECONDS),
            duration_tick: Duration::from_millis(DEFAULT_DURATION_TICK_MILLIS),
            session_mailbox_size: DEFAULT_SESSION_MAILBOX_SIZE,
            negotiator_mailbox_size: DEFAULT_NEGOTIATOR_MAILBOX_SIZE,
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
            screen_frame_rate: DEFAULT_SCREEN_FRAME_RATE,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let username = vars
            .get("CALL_TURN_USERNAME")
            .filter(|s| !s.is_empty())
            .cloned();
        let credential = vars
            .get("CALL_TURN_CREDENTIAL")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        if credential.is_some() && username.is_none() {
            return Err(ConfigError::InvalidValue(
                "CALL_TURN_CREDENTIAL requires CALL_TURN_USERNAME".to_string(),
            ));
        }

        let ice_servers = match vars.get("CALL_ICE_SERVERS") {
            Some(raw) => parse_ice_servers(raw, username.as_ref(), credential.as_ref())?,
            None => DEFAULT_ICE_SERVERS
                .iter()
                .map(|url| IceServer::new(*url))
                .collect(),
        };

        let negotiation_timeout_seconds: u64 =
            parse_positive(vars, "CALL_NEGOTIATION_TIMEOUT_SECONDS")?
                .unwrap_or(DEFAULT_NEGOTIATION_TIMEOUT_SECONDS);

        let duration_tick_millis: u64 = parse_positive(vars, "CALL_DURATION_TICK_MILLIS")?
            .unwrap_or(DEFAULT_DURATION_TICK_MILLIS);

        let session_mailbox_size = parse_positive(vars, "CALL_SESSION_MAILBOX_SIZE")?
            .unwrap_or(DEFAULT_SESSION_MAILBOX_SIZE);

        let negotiator_mailbox_size = parse_positive(vars, "CALL_NEGOTIATOR_MAILBOX_SIZE")?
            .unwrap_or(DEFAULT_NEGOTIATOR_MAILBOX_SIZE);

        let max_pending_candidates = vars
            .get("CALL_MAX_PENDING_CANDIDATES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_PENDING_CANDIDATES);

        let screen_frame_rate = vars
            .get("CALL_SCREEN_FRAME_RATE")
            .and_then(|s| s.parse().ok())
            .filter(|rate| *rate > 0)
            .unwrap_or(DEFAULT_SCREEN_FRAME_RATE);

        Ok(Config {
            ice_servers,
            negotiation_timeout: Duration::from_secs(negotiation_timeout_seconds),
            duration_tick: Duration::from_millis(duration_tick_millis),
            session_mailbox_size,
            negotiator_mailbox_size,
            max_pending_candidates,
            screen_frame_rate,
        })
    }
}

/// Comma-separated server list. Bare hosts get a `stun:` scheme.
fn parse_ice_servers(
    raw: &str,
    username: Option<&String>,
    credential: Option<&SecretString>,
) -> Result<Vec<IceServer>, ConfigError> {
    let servers: Vec<IceServer> = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let url = if entry.starts_with("stun:")
                || entry.starts_with("turn:")
                || entry.starts_with("turns:")
            {
                entry.to_string()
            } else {
                format!("stun:{entry}")
            };
            let is_turn = url.starts_with("turn");
            IceServer {
                urls: vec![url],
                username: if is_turn { username.cloned() } else { None },
                credential: if is_turn { credential.cloned() } else { None },
            }
        })
        .collect();

    if servers.is_empty() {
        return Err(ConfigError::InvalidValue(
            "CALL_ICE_SERVERS must list at least one server".to_string(),
        ));
    }
    Ok(servers)
}

fn parse_positive<T>(vars: &HashMap<String, String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = vars.get(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(Some(value)),
        _ => Err(ConfigError::InvalidValue(format!(
            "{name} must be a positive integer, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(
            config.ice_servers.first().unwrap().urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
        assert_eq!(
            config.negotiation_timeout,
            Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECONDS)
        );
        assert_eq!(config.duration_tick, Duration::from_secs(1));
        assert_eq!(config.session_mailbox_size, DEFAULT_SESSION_MAILBOX_SIZE);
        assert_eq!(
            config.negotiator_mailbox_size,
            DEFAULT_NEGOTIATOR_MAILBOX_SIZE
        );
        assert_eq!(config.max_pending_candidates, DEFAULT_MAX_PENDING_CANDIDATES);
        assert_eq!(config.screen_frame_rate, DEFAULT_SCREEN_FRAME_RATE);
    }

    #[test]
    fn test_default_matches_empty_environment() {
        let from_vars = Config::from_vars(&HashMap::new()).unwrap();
        let default = Config::default();

        assert_eq!(format!("{from_vars:?}"), format!("{default:?}"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            (
                "CALL_ICE_SERVERS".to_string(),
                "stun.example.com:3478, turn:relay.example.com:3478".to_string(),
            ),
            ("CALL_TURN_USERNAME".to_string(), "relay-user".to_string()),
            ("CALL_TURN_CREDENTIAL".to_string(), "relay-pass".to_string()),
            (
                "CALL_NEGOTIATION_TIMEOUT_SECONDS".to_string(),
                "10".to_string(),
            ),
            ("CALL_DURATION_TICK_MILLIS".to_string(), "250".to_string()),
            ("CALL_SESSION_MAILBOX_SIZE".to_string(), "64".to_string()),
            ("CALL_NEGOTIATOR_MAILBOX_SIZE".to_string(), "16".to_string()),
            ("CALL_MAX_PENDING_CANDIDATES".to_string(), "8".to_string()),
            ("CALL_SCREEN_FRAME_RATE".to_string(), "15".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let stun = config.ice_servers.first().unwrap();
        assert_eq!(stun.urls, vec!["stun:stun.example.com:3478".to_string()]);
        assert!(stun.username.is_none());
        assert!(stun.credential.is_none());

        let turn = config.ice_servers.get(1).unwrap();
        assert_eq!(turn.urls, vec!["turn:relay.example.com:3478".to_string()]);
        assert_eq!(turn.username.as_deref(), Some("relay-user"));
        assert_eq!(
            turn.credential.as_ref().unwrap().expose_secret(),
            "relay-pass"
        );

        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
        assert_eq!(config.duration_tick, Duration::from_millis(250));
        assert_eq!(config.session_mailbox_size, 64);
        assert_eq!(config.negotiator_mailbox_size, 16);
        assert_eq!(config.max_pending_candidates, 8);
        assert_eq!(config.screen_frame_rate, 15);
    }

    #[test]
    fn test_credential_without_username_rejected() {
        let vars = HashMap::from([("CALL_TURN_CREDENTIAL".to_string(), "secret".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let vars = HashMap::from([(
            "CALL_NEGOTIATION_TIMEOUT_SECONDS".to_string(),
            "0".to_string(),
        )]);

        let result = Config::from_vars(&vars);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue(msg)) if msg.contains("CALL_NEGOTIATION_TIMEOUT_SECONDS")
        ));
    }

    #[test]
    fn test_unparseable_tick_rejected() {
        let vars = HashMap::from([(
            "CALL_DURATION_TICK_MILLIS".to_string(),
            "soon".to_string(),
        )]);

        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let vars = HashMap::from([("CALL_ICE_SERVERS".to_string(), " , ".to_string())]);

        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_debug_redacts_turn_credential() {
        let vars = HashMap::from([
            (
                "CALL_ICE_SERVERS".to_string(),
                "turn:relay.example.com:3478".to_string(),
            ),
            ("CALL_TURN_USERNAME".to_string(), "relay-user".to_string()),
            (
                "CALL_TURN_CREDENTIAL".to_string(),
                "super-secret-pass".to_string(),
            ),
        ]);
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("relay.example.com"));
        assert!(!debug_output.contains("super-secret-pass"));
    }
}
