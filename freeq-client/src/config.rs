//! Handshake configuration.
//!
//! Loadable from TOML:
//!
//! ```toml
//! caps = ["away-notify", "server-time"]
//! pass = "hunter2"
//!
//! [me]
//! nick = "bob"
//! ident = "bob"
//! name = "Bob"
//!
//! [sasl]
//! user = "bob"
//! password = "secret"
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::sasl::{Authenticator, Plain, SaslCredentials};
use crate::state::Identity;

/// Derives the next nick to try after a collision.
pub type NewNickFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Configuration for one connection attempt.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Initial identity claimed with NICK/USER.
    pub me: Identity,
    /// Server password, sent as PASS before anything else.
    pub pass: Option<String>,
    /// Capabilities to request, in order.
    pub caps: Vec<String>,
    /// SASL PLAIN credentials. Setting these requests authentication.
    pub sasl: Option<SaslCredentials>,
    /// Custom SASL mechanism; takes precedence over `sasl`.
    #[serde(skip)]
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Reply to CTCP VERSION.
    pub version: String,
    /// When true, outbound lines are never throttled.
    pub flood: bool,
    #[serde(skip)]
    pub new_nick: NewNickFn,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            me: Identity {
                nick: "freeq".to_string(),
                ident: "freeq".to_string(),
                name: "freeq client".to_string(),
                host: String::new(),
            },
            pass: None,
            caps: Vec::new(),
            sasl: None,
            authenticator: None,
            version: format!("freeq-client {}", env!("CARGO_PKG_VERSION")),
            flood: false,
            new_nick: Arc::new(default_new_nick),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("me", &self.me)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("caps", &self.caps)
            .field("sasl", &self.sasl)
            .field("authenticator", &self.authenticator.as_ref().map(|a| a.mechanism().to_string()))
            .field("version", &self.version)
            .field("flood", &self.flood)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn new(nick: &str) -> Self {
        Self {
            me: Identity {
                nick: nick.to_string(),
                ident: nick.to_string(),
                ..Config::default().me
            },
            ..Config::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("can't read {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("bad config file {}", path.display()))
    }

    /// The mechanism to authenticate with, if any.
    pub fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        if let Some(ref custom) = self.authenticator {
            return Some(Arc::clone(custom));
        }
        self.sasl
            .as_ref()
            .map(|creds| Arc::new(Plain::new(creds.clone())) as Arc<dyn Authenticator>)
    }
}

/// Appends `_` to the rejected nick.
pub fn default_new_nick(old: &str) -> String {
    format!("{old}_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_fills_missing_fields() {
        let cfg = Config::from_toml_str(
            r#"
            caps = ["away-notify", "server-time"]

            [me]
            nick = "bob"
            ident = "bobby"
            name = "Bob"

            [sasl]
            user = "bob"
            password = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.me.nick, "bob");
        assert_eq!(cfg.me.ident, "bobby");
        assert!(cfg.me.host.is_empty());
        assert_eq!(cfg.caps, vec!["away-notify", "server-time"]);
        assert!(cfg.sasl.is_some());
        assert_eq!(cfg.authenticator().unwrap().mechanism(), "PLAIN");
        assert!(!cfg.flood);
        assert_eq!((cfg.new_nick)("bob"), "bob_");
    }

    #[test]
    fn empty_toml_is_default() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.me.nick, "freeq");
        assert!(cfg.caps.is_empty());
        assert!(cfg.authenticator().is_none());
        assert!(cfg.version.starts_with("freeq-client "));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(matches!(
            Config::from_toml_str("caps = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn debug_redacts_password() {
        let cfg = Config {
            pass: Some("hunter2".to_string()),
            ..Config::new("bob")
        };
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
