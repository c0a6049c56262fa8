//! Proxy configuration, read from a TOML file.

use crate::{
    connection::ConnectionOptions,
    protocol::{CompressionThreshold, ProtocolVersion, MAX_FRAME_LENGTH, SUPPORTED_VERSIONS},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, io, net::SocketAddr, path::Path, time::Duration};

/// Smallest frame cap that still fits every login packet.
const MIN_FRAME_LENGTH: usize = 256;

const MAX_HIGH_WATER_MARK: usize = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read the configuration: {0}")]
    Io(#[from] io::Error),
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("supported_versions is empty")]
    NoVersions,
    #[error("protocol version {0} is not supported")]
    UnknownVersion(i32),
    #[error("try list names unknown server `{0}`")]
    UnknownTryServer(String),
    #[error("max_frame_length must be between {MIN_FRAME_LENGTH} and {MAX_FRAME_LENGTH}, got {0}")]
    FrameLength(usize),
    #[error("write_high_water_mark must be between 1 and {MAX_HIGH_WATER_MARK}, got {0}")]
    HighWaterMark(usize),
}

/// How the player's identity is passed on to backends.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    /// Backends see the proxy's connection and run in offline mode.
    #[default]
    None,
    /// Address, UUID and properties are appended to the handshake's
    /// server address, separated by NUL characters.
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub bind: SocketAddr,
    pub motd: String,
    pub max_players: u32,
    pub online_mode: bool,
    pub max_frame_length: usize,
    /// Packets at least this large are compressed. Negative disables compression.
    pub compression_threshold: i32,
    pub supported_versions: Vec<i32>,
    pub forwarding: ForwardingMode,
    /// Backend servers by name.
    pub servers: BTreeMap<String, String>,
    /// Servers tried, in order, on join and when a backend drops a player.
    #[serde(rename = "try")]
    pub try_servers: Vec<String>,
    pub connect_timeout_ms: u64,
    pub login_timeout_ms: u64,
    pub switch_timeout_ms: u64,
    /// 0 disables the read timeout.
    pub read_timeout_ms: u64,
    pub write_high_water_mark: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 25577)),
            motd: "A Minecraft relay".to_owned(),
            max_players: 500,
            online_mode: true,
            max_frame_length: MAX_FRAME_LENGTH,
            compression_threshold: 256,
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.id()).collect(),
            forwarding: ForwardingMode::None,
            servers: BTreeMap::new(),
            try_servers: Vec::new(),
            connect_timeout_ms: 5_000,
            login_timeout_ms: 10_000,
            switch_timeout_ms: 30_000,
            read_timeout_ms: 30_000,
            write_high_water_mark: 2 * 1024 * 1024,
        }
    }
}

/// The part of the configuration the protocol core sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSettings {
    pub max_frame_length: usize,
    pub compression_threshold: Option<CompressionThreshold>,
    pub supported_versions: Vec<ProtocolVersion>,
}

impl ProxyConfig {
    /// Loads and validates the configuration at `path`. A missing file
    /// yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match fs_err::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("No configuration at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supported_versions.is_empty() {
            return Err(ConfigError::NoVersions);
        }
        if let Some(&unknown) = self
            .supported_versions
            .iter()
            .find(|&&id| !ProtocolVersion::new(id).is_known())
        {
            return Err(ConfigError::UnknownVersion(unknown));
        }
        if let Some(unknown) = self
            .try_servers
            .iter()
            .find(|name| !self.servers.contains_key(*name))
        {
            return Err(ConfigError::UnknownTryServer(unknown.clone()));
        }
        if !(MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&self.max_frame_length) {
            return Err(ConfigError::FrameLength(self.max_frame_length));
        }
        if !(1..=MAX_HIGH_WATER_MARK).contains(&self.write_high_water_mark) {
            return Err(ConfigError::HighWaterMark(self.write_high_water_mark));
        }
        Ok(())
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        let mut supported_versions: Vec<_> = self
            .supported_versions
            .iter()
            .map(|&id| ProtocolVersion::new(id))
            .collect();
        supported_versions.sort();
        supported_versions.dedup();
        ProtocolSettings {
            max_frame_length: self.max_frame_length,
            compression_threshold: CompressionThreshold::new(self.compression_threshold),
            supported_versions,
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_length: self.max_frame_length,
            read_timeout: (self.read_timeout_ms > 0)
                .then(|| Duration::from_millis(self.read_timeout_ms)),
            write_high_water_mark: self.write_high_water_mark,
        }
    }

    pub fn server_address(&self, name: &str) -> Option<&str> {
        self.servers.get(name).map(String::as_str)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        bind = "127.0.0.1:25565"
        motd = "hello"
        online_mode = false
        compression_threshold = -1
        supported_versions = [765, 47]
        forwarding = "legacy"
        try = ["lobby"]

        [servers]
        lobby = "127.0.0.1:30001"
        games = "127.0.0.1:30002"
    "#;

    #[test]
    fn parses_and_fills_defaults() {
        let config = ProxyConfig::from_toml(EXAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind, "127.0.0.1:25565".parse().unwrap());
        assert_eq!(config.forwarding, ForwardingMode::Legacy);
        assert_eq!(config.try_servers, ["lobby"]);
        assert_eq!(config.server_address("games"), Some("127.0.0.1:30002"));
        assert_eq!(config.max_players, 500);

        let settings = config.protocol_settings();
        assert_eq!(settings.compression_threshold, None);
        assert_eq!(
            settings.supported_versions,
            [ProtocolVersion::V1_8, ProtocolVersion::V1_20_3]
        );
    }

    #[test]
    fn validation() {
        let valid = ProxyConfig::from_toml(EXAMPLE).unwrap();

        let mut config = valid.clone();
        config.supported_versions.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoVersions)));

        let mut config = valid.clone();
        config.supported_versions.push(4);
        assert!(matches!(config.validate(), Err(ConfigError::UnknownVersion(4))));

        let mut config = valid.clone();
        config.try_servers.push("missing".into());
        assert!(matches!(config.validate(), Err(ConfigError::UnknownTryServer(_))));

        let mut config = valid.clone();
        config.max_frame_length = 1 << 22;
        assert!(matches!(config.validate(), Err(ConfigError::FrameLength(_))));

        let mut config = valid;
        config.write_high_water_mark = 0;
        assert!(matches!(config.validate(), Err(ConfigError::HighWaterMark(0))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            ProxyConfig::from_toml("colour = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_means_defaults() {
        let config = ProxyConfig::load(Path::new("/nonexistent/relay.toml")).unwrap();
        assert_eq!(config, ProxyConfig::default());
    }

    #[test]
    fn zero_read_timeout_disables_it() {
        let config = ProxyConfig {
            read_timeout_ms: 0,
            ..ProxyConfig::default()
        };
        assert_eq!(config.connection_options().read_timeout, None);
    }
}
