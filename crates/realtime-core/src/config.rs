//! Configuration for channels and calls
//!
//! [`RealtimeConfig`] groups the settings of the two session kinds. Every
//! field has a default matching the production deployment, so an empty
//! configuration file is valid.
//!
//! # Loading
//!
//! Configuration is layered: defaults, then an optional TOML file, then
//! environment variables prefixed with `CONFAB__` (nested keys separated by
//! a double underscore, e.g. `CONFAB__CHANNEL__RECONNECT_DELAY_MS=2000`).
//!
//! ```rust,no_run
//! use confab_realtime_core::config::RealtimeConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RealtimeConfig::load(Some(Path::new("confab.toml")))?;
//! println!("broadcast topic: {}", config.channel.broadcast_topic);
//! # Ok(())
//! # }
//! ```
//!
//! # Building in code
//!
//! ```rust
//! use confab_realtime_core::config::{CallConfig, ChannelConfig, RealtimeConfig};
//! use std::time::Duration;
//!
//! let config = RealtimeConfig {
//!     channel: ChannelConfig::default().with_reconnect_delay(None),
//!     call: CallConfig::default().with_sip_domain("pbx.example.com"),
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.channel.reconnect_delay(), None);
//! assert_eq!(config.call.reconnect_delay(), Some(Duration::from_secs(5)));
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, RealtimeResult};

/// Prefix of environment variables that override file settings
pub const ENV_PREFIX: &str = "CONFAB";

/// Placeholder replaced by the channel key in the personal topic template
pub const KEY_PLACEHOLDER: &str = "{key}";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Message channel settings
    pub channel: ChannelConfig,
    /// Voice call settings
    pub call: CallConfig,
}

impl RealtimeConfig {
    /// Load configuration from an optional file plus the environment
    ///
    /// A missing file is not an error; an unreadable or invalid one is.
    pub fn load(path: Option<&Path>) -> RealtimeResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: RealtimeConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        tracing::debug!(?path, "Loaded realtime configuration");
        Ok(loaded)
    }

    /// Check the configuration for inconsistent values
    pub fn validate(&self) -> RealtimeResult<()> {
        self.channel.validate()?;
        self.call.validate()
    }
}

/// Settings for message channels
///
/// Topic and destination names describe the broker's routing scheme. The
/// personal topic template must contain `{key}`, which is replaced with the
/// channel key when the session subscribes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Topic carrying messages addressed to one conversation
    pub personal_topic_template: String,
    /// Topic shared by every conversation
    pub broadcast_topic: String,
    /// Receiver name that addresses the shared timeline
    pub broadcast_receiver: String,
    /// Destination for messages to the shared timeline
    pub public_destination: String,
    /// Destination for messages to a single conversation
    pub private_destination: String,
    /// Destination for join announcements
    pub join_destination: String,
    /// Flat delay before reconnecting a dropped channel; `None` disables it
    pub reconnect_delay_ms: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            personal_topic_template: "/user/{key}/messages".to_string(),
            broadcast_topic: "/chatroom/telegram".to_string(),
            broadcast_receiver: "Chat chung".to_string(),
            public_destination: "/app/message/public".to_string(),
            private_destination: "/app/private-message".to_string(),
            join_destination: "/app/message".to_string(),
            reconnect_delay_ms: Some(10_000),
        }
    }
}

impl ChannelConfig {
    /// Set the reconnect delay (`None` disables automatic reconnection)
    pub fn with_reconnect_delay(mut self, delay: Option<Duration>) -> Self {
        self.reconnect_delay_ms = delay.map(|d| d.as_millis() as u64);
        self
    }

    /// Set the receiver name that addresses the shared timeline
    pub fn with_broadcast_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.broadcast_receiver = receiver.into();
        self
    }

    /// Reconnect delay as a [`Duration`]
    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay_ms.map(Duration::from_millis)
    }

    /// Personal topic for a channel key
    pub fn personal_topic(&self, key: &str) -> String {
        self.personal_topic_template.replace(KEY_PLACEHOLDER, key)
    }

    fn validate(&self) -> RealtimeResult<()> {
        let required = [
            ("channel.personal_topic_template", &self.personal_topic_template),
            ("channel.broadcast_topic", &self.broadcast_topic),
            ("channel.public_destination", &self.public_destination),
            ("channel.private_destination", &self.private_destination),
            ("channel.join_destination", &self.join_destination),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(RealtimeError::config(format!("{} must not be empty", field)));
            }
        }
        if !self.personal_topic_template.contains(KEY_PLACEHOLDER) {
            return Err(RealtimeError::config(format!(
                "channel.personal_topic_template must contain {}",
                KEY_PLACEHOLDER
            )));
        }
        if self.reconnect_delay_ms == Some(0) {
            return Err(RealtimeError::config(
                "channel.reconnect_delay_ms must be positive",
            ));
        }
        Ok(())
    }
}

/// Settings for voice calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Domain appended to dialed numbers (`sip:<number>@<domain>`)
    pub sip_domain: Option<String>,
    /// ICE servers offered to the media layer
    pub ice_servers: Vec<String>,
    /// Whether calls carry audio
    pub audio: bool,
    /// Whether calls carry video
    pub video: bool,
    /// Flat delay before restarting a dropped signaling link
    pub reconnect_delay_ms: Option<u64>,
    /// Shortest accepted dial string
    pub number_min_digits: usize,
    /// Longest accepted dial string
    pub number_max_digits: usize,
    /// Re-register at startup when the previous run was connected
    pub auto_resume: bool,
    /// File that persists the "was connected" flag; in memory when unset
    pub state_file: Option<PathBuf>,
    /// Buffer size of the broadcast event stream
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            sip_domain: None,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            audio: true,
            video: false,
            reconnect_delay_ms: Some(5_000),
            number_min_digits: 9,
            number_max_digits: 11,
            auto_resume: true,
            state_file: None,
            event_capacity: 256,
        }
    }
}

impl CallConfig {
    /// Set the SIP domain used to build dial targets
    pub fn with_sip_domain(mut self, domain: impl Into<String>) -> Self {
        self.sip_domain = Some(domain.into());
        self
    }

    /// Set the signaling reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Option<Duration>) -> Self {
        self.reconnect_delay_ms = delay.map(|d| d.as_millis() as u64);
        self
    }

    /// Enable or disable auto-resume
    pub fn with_auto_resume(mut self, enabled: bool) -> Self {
        self.auto_resume = enabled;
        self
    }

    /// Persist the registration flag in the given file
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Reconnect delay as a [`Duration`]
    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay_ms.map(Duration::from_millis)
    }

    /// Build the dial target for a validated number
    pub fn dial_target(&self, number: &str) -> String {
        match &self.sip_domain {
            Some(domain) => format!("sip:{}@{}", number, domain),
            None => number.to_string(),
        }
    }

    fn validate(&self) -> RealtimeResult<()> {
        if self.number_min_digits == 0 || self.number_min_digits > self.number_max_digits {
            return Err(RealtimeError::config(format!(
                "call number length range {}..={} is empty",
                self.number_min_digits, self.number_max_digits
            )));
        }
        if self.reconnect_delay_ms == Some(0) {
            return Err(RealtimeError::config("call.reconnect_delay_ms must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(RealtimeError::config("call.event_capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RealtimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel.personal_topic("group-7"), "/user/group-7/messages");
        assert_eq!(config.channel.reconnect_delay(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_dial_target() {
        let call = CallConfig::default();
        assert_eq!(call.dial_target("0912345678"), "0912345678");

        let call = call.with_sip_domain("pbx.example.com");
        assert_eq!(call.dial_target("0912345678"), "sip:0912345678@pbx.example.com");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RealtimeConfig::default();
        config.channel.personal_topic_template = "/user/messages".to_string();
        assert!(matches!(
            config.validate(),
            Err(RealtimeError::Configuration { .. })
        ));

        let mut config = RealtimeConfig::default();
        config.call.number_min_digits = 12;
        assert!(config.validate().is_err());

        let mut config = RealtimeConfig::default();
        config.channel.reconnect_delay_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[channel]\nbroadcast_receiver = \"Lobby\"\nreconnect_delay_ms = 2500\n\n[call]\nsip_domain = \"pbx.example.com\"\nauto_resume = false"
        )
        .unwrap();

        let config = RealtimeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.channel.broadcast_receiver, "Lobby");
        assert_eq!(config.channel.reconnect_delay_ms, Some(2500));
        assert_eq!(config.channel.broadcast_topic, "/chatroom/telegram");
        assert_eq!(config.call.sip_domain.as_deref(), Some("pbx.example.com"));
        assert!(!config.call.auto_resume);
    }

    #[test]
    #[serial]
    fn test_missing_file_falls_back_to_defaults() {
        let config = RealtimeConfig::load(Some(Path::new("/nonexistent/confab.toml"))).unwrap();
        assert_eq!(config, RealtimeConfig::default());
    }
}
