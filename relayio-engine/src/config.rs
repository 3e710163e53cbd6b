use std::time::Duration;

use crate::service::TransportType;

/// Configuration of the session engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The path the engine answers on.
    /// Defaults to "/relay.io".
    pub req_path: String,

    /// Interval between two server initiated PING packets.
    /// Defaults to 25 seconds.
    pub ping_interval: Duration,

    /// How long the server waits for a PONG before closing the session
    /// with a heartbeat timeout.
    /// Defaults to 20 seconds.
    pub ping_timeout: Duration,

    /// Number of packets that can sit in a session write buffer before
    /// `emit()` starts failing with a buffer full error.
    /// Defaults to 128 packets.
    pub max_buffer_size: usize,

    /// Maximum size in bytes of a long-poll payload, in both directions.
    /// The poll encoder stops batching before this limit would be exceeded.
    /// Defaults to 100kb.
    pub max_payload: u64,

    /// Bitfield of the transports accepted by this server.
    /// Defaults to polling + websocket.
    pub transports: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            req_path: "/relay.io".to_string(),
            ping_interval: Duration::from_millis(25000),
            ping_timeout: Duration::from_millis(20000),
            max_buffer_size: 128,
            max_payload: 1e5 as u64,
            transports: TransportType::Polling as u8 | TransportType::Websocket as u8,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Whether the given transport is accepted by this server.
    pub fn allows(&self, transport: TransportType) -> bool {
        self.transports & transport as u8 != 0
    }
}

pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// The path the engine answers on.
    pub fn req_path(mut self, req_path: String) -> Self {
        self.config.req_path = req_path;
        self
    }

    /// Interval between two server initiated PING packets.
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.config.ping_interval = ping_interval;
        self
    }

    /// How long the server waits for a PONG before closing the session.
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.config.ping_timeout = ping_timeout;
        self
    }

    /// Number of packets that can sit in a session write buffer.
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.config.max_buffer_size = max_buffer_size;
        self
    }

    /// Maximum size in bytes of a long-poll payload.
    pub fn max_payload(mut self, max_payload: u64) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    /// The transports accepted by this server. The array should hold one or
    /// two distinct transports.
    pub fn transports<const N: usize>(mut self, transports: [TransportType; N]) -> Self {
        self.config.transports = transports.into_iter().fold(0, |acc, t| acc | t as u8);
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
