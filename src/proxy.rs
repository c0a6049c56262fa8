//! Everything the proxy's tasks share: configuration, the packet registry,
//! pluggable collaborators and the live sessions.

use crate::{
    auth::{AuthError, Authenticator, KeyPair, MojangAuthenticator},
    config::{ConfigError, ProtocolSettings, ProxyConfig},
    connection::ConnectionOptions,
    hooks::{NoHooks, ProxyHooks},
    protocol::{PacketRegistry, RegistryError},
    session::SessionManager,
    transport::{Connector, TcpConnector},
};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to generate the login key pair: {0}")]
    Auth(#[from] AuthError),
}

pub struct ProxyContext {
    config: ProxyConfig,
    settings: ProtocolSettings,
    options: ConnectionOptions,
    registry: Arc<PacketRegistry>,
    connector: Box<dyn Connector>,
    authenticator: Box<dyn Authenticator>,
    hooks: Box<dyn ProxyHooks>,
    sessions: SessionManager,
    /// Present in online mode.
    key_pair: Option<KeyPair>,
}

impl ProxyContext {
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn connector(&self) -> &dyn Connector {
        &*self.connector
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        &*self.authenticator
    }

    pub fn hooks(&self) -> &dyn ProxyHooks {
        &*self.hooks
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.key_pair.as_ref()
    }
}

/// Assembles a [`ProxyContext`], defaulting to TCP backends, Mojang's
/// session server and no hooks.
pub struct ProxyBuilder {
    config: ProxyConfig,
    connector: Box<dyn Connector>,
    authenticator: Box<dyn Authenticator>,
    hooks: Box<dyn ProxyHooks>,
}

impl ProxyBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            connector: Box::new(TcpConnector),
            authenticator: Box::new(MojangAuthenticator::new()),
            hooks: Box::new(NoHooks),
        }
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Box::new(connector);
        self
    }

    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Box::new(authenticator);
        self
    }

    pub fn hooks(mut self, hooks: impl ProxyHooks) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn build(self) -> Result<Arc<ProxyContext>, BuildError> {
        self.config.validate()?;
        let settings = self.config.protocol_settings();
        let registry = if settings.supported_versions == PacketRegistry::global().versions() {
            PacketRegistry::global()
        } else {
            Arc::new(PacketRegistry::new(&settings.supported_versions)?)
        };
        let key_pair = if self.config.online_mode {
            tracing::debug!("Generating login key pair");
            Some(KeyPair::generate()?)
        } else {
            None
        };

        Ok(Arc::new(ProxyContext {
            options: self.config.connection_options(),
            config: self.config,
            settings,
            registry,
            connector: self.connector,
            authenticator: self.authenticator,
            hooks: self.hooks,
            sessions: SessionManager::new(),
            key_pair,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_follows_the_configured_versions() {
        let config = ProxyConfig {
            online_mode: false,
            supported_versions: vec![765, 47, 765],
            ..ProxyConfig::default()
        };
        let ctx = ProxyBuilder::new(config).build().unwrap();
        assert_eq!(ctx.registry().versions().len(), 2);
        assert!(ctx.key_pair().is_none());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let config = ProxyConfig {
            supported_versions: Vec::new(),
            ..ProxyConfig::default()
        };
        assert!(matches!(
            ProxyBuilder::new(config).build(),
            Err(BuildError::Config(ConfigError::NoVersions))
        ));
    }
}
