//! # Broker Configuration
//!
//! Describes how to reach the pub/sub broker and what to do when the
//! connection drops. Authentication is optional: the default deployment talks
//! to an anonymous broker, but credentials can be supplied without touching
//! any transport code.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

/// Wire protocol spoken with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// RESP2, understood by every Redis-compatible broker.
    Resp2,
    /// RESP3, the newest protocol revision.
    #[default]
    Resp3,
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resp2" | "2" => Ok(ProtocolVersion::Resp2),
            "resp3" | "3" => Ok(ProtocolVersion::Resp3),
            other => Err(format!("unknown protocol version '{}'", other)),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Resp2 => write!(f, "resp2"),
            ProtocolVersion::Resp3 => write!(f, "resp3"),
        }
    }
}

/// Optional broker credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username; `None` authenticates as the default user.
    pub username: Option<String>,
    /// Password sent during the handshake.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// # Broker Config
///
/// Endpoint and handshake settings shared by every transport.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Upper bound on the connect handshake. Expiry is reported as a connection error.
    pub connect_timeout: Duration,
    /// Protocol revision requested during the handshake.
    pub protocol: ProtocolVersion,
    /// Credentials, if the broker requires them.
    pub credentials: Option<Credentials>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            connect_timeout: Duration::from_secs(60),
            protocol: ProtocolVersion::default(),
            credentials: None,
        }
    }
}

impl BrokerConfig {
    /// Builds the `redis://` URL for this endpoint, with credentials and protocol.
    pub fn url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("redis://{}:{}/", self.host, self.port))?;

        if let Some(creds) = &self.credentials {
            // set_username/set_password only fail for cannot-be-a-base URLs.
            let _ = url.set_username(creds.username.as_deref().unwrap_or(""));
            let _ = url.set_password(Some(&creds.password));
        }

        url.query_pairs_mut()
            .append_pair("protocol", &self.protocol.to_string());

        Ok(url)
    }

    /// `host:port`, for log lines. Never includes credentials.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// # Reconnect Policy
///
/// What the session manager does after the connection is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Report the loss and stay disconnected; the owner decides what to do.
    #[default]
    Manual,
    /// Reconnect on its own with exponential backoff.
    Auto {
        /// Delay before the first attempt.
        base_delay: Duration,
        /// Cap for the doubled delay.
        max_delay: Duration,
        /// Give up after this many failed attempts; `None` retries forever.
        max_attempts: Option<u32>,
    },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` when no
    /// further attempt should be made.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Manual => None,
            ReconnectPolicy::Auto {
                base_delay,
                max_delay,
                max_attempts,
            } => {
                if attempt == 0 || max_attempts.is_some_and(|max| attempt > max) {
                    return None;
                }
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                Some(base_delay.saturating_mul(factor).min(max_delay))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_credentials_and_protocol() {
        let config = BrokerConfig {
            host: "broker.local".to_string(),
            port: 6380,
            protocol: ProtocolVersion::Resp2,
            credentials: Some(Credentials {
                username: Some("feeder".to_string()),
                password: "p@ss".to_string(),
            }),
            ..Default::default()
        };

        let url = config.url().unwrap();
        assert_eq!(url.host_str(), Some("broker.local"));
        assert_eq!(url.port(), Some(6380));
        assert_eq!(url.username(), "feeder");
        assert!(url.password().is_some());
        assert_eq!(url.query(), Some("protocol=resp2"));
        assert_eq!(config.endpoint(), "broker.local:6380");
    }

    #[test]
    fn anonymous_url_has_no_userinfo() {
        let url = BrokerConfig::default().url().unwrap();
        assert_eq!(url.username(), "");
        assert!(url.password().is_none());
    }

    #[test]
    fn protocol_parses_both_spellings() {
        assert_eq!("RESP2".parse::<ProtocolVersion>(), Ok(ProtocolVersion::Resp2));
        assert_eq!("3".parse::<ProtocolVersion>(), Ok(ProtocolVersion::Resp3));
        assert!("mqttv5".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::Auto {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_attempts: Some(4),
        };

        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(350)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(350)));
        assert_eq!(policy.delay_for(5), None);
        assert_eq!(ReconnectPolicy::Manual.delay_for(1), None);
    }

    #[test]
    fn unbounded_backoff_never_overflows() {
        let policy = ReconnectPolicy::Auto {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(500), Some(Duration::from_secs(60)));
    }
}
