use std::time::Duration;

use relayio_engine::config::EngineConfig;

/// Configuration of the messaging layer and of the engine beneath it.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The inner engine config.
    pub(crate) engine_config: EngineConfig,

    /// How long an emitter waits for an acknowledgement before the ack
    /// completes with a timeout error.
    ///
    /// Defaults to 5 seconds.
    pub(crate) ack_timeout: Duration,

    /// How long a session may stay connected without joining any namespace
    /// before it is closed.
    ///
    /// Defaults to 45 seconds.
    pub(crate) connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            engine_config: EngineConfig {
                req_path: "/socket.io".to_string(),
                ..Default::default()
            },
            ack_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(45),
        }
    }
}
