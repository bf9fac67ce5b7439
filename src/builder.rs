use crate::engine::{Engine, EngineConfig, EngineError};
use crate::network::Transport;
use std::sync::Arc;

/// Builder for [`Engine`].
///
/// Provides a fluent API for sizing the runtime and choosing its transport.
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl EngineBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            transport: None,
        }
    }

    /// Sets the number of journal worker threads.
    pub fn journal_workers(mut self, count: usize) -> Self {
        self.config.journal_workers = count;
        self
    }

    /// Sets the number of apply worker threads.
    pub fn apply_workers(mut self, count: usize) -> Self {
        self.config.apply_workers = count;
        self
    }

    /// Sets the peer transport (Required).
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Uses a TCP transport listening on `port`.
    #[cfg(feature = "net")]
    pub fn bind(mut self, port: u16) -> Result<Self, EngineError> {
        let transport = crate::network::tcp::TcpTransport::bind(port)?;
        self.transport = Some(Arc::new(transport));
        Ok(self)
    }

    /// Modifies the configuration via a closure.
    pub fn configure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut EngineConfig),
    {
        f(&mut self.config);
        self
    }

    /// Starts the [`Engine`].
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` if no transport was set, or any
    /// error from [`Engine::start`].
    pub fn build(self) -> Result<Engine, EngineError> {
        let transport = self
            .transport
            .ok_or_else(|| EngineError::InvalidConfig("A transport is required for Engine".to_string()))?;
        Engine::start(self.config, transport)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use std::time::Duration;

    #[test]
    fn test_build_requires_transport() {
        let err = EngineBuilder::new().build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_builder_applies_settings() {
        let network = MemoryNetwork::new();
        let engine = EngineBuilder::new()
            .journal_workers(3)
            .apply_workers(2)
            .configure(|config| {
                config.commit_timeout = Duration::from_secs(1);
                config.raft.heartbeat_interval = Duration::from_millis(20);
            })
            .transport(network.endpoint(7200))
            .build()
            .unwrap();

        assert_eq!(engine.config().journal_workers, 3);
        assert_eq!(engine.config().apply_workers, 2);
        assert_eq!(engine.config().commit_timeout, Duration::from_secs(1));
        assert_eq!(engine.config().raft.heartbeat_interval, Duration::from_millis(20));
        assert_eq!(engine.local_port(), 7200);
        assert_eq!(engine.metrics().instance(), "7200");
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let network = MemoryNetwork::new();
        let err = EngineBuilder::new()
            .configure(|config| config.tick_interval = Duration::ZERO)
            .transport(network.endpoint(7201))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}
