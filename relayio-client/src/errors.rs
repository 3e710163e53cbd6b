#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("engine packet error: {0}")]
    Engine(#[from] relayio_engine::errors::Error),

    #[error("messaging packet error: {0}")]
    Decode(#[from] relayio::errors::Error),

    #[error("ws transport error: {0}")]
    WsTransport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("the server did not answer the handshake with an OPEN packet")]
    BadHandshake,

    #[error("the manager is already open or opening")]
    AlreadyOpen,

    #[error("the connection is closed")]
    Disconnected,

    #[error("every reconnection attempt failed")]
    ReconnectExhausted,
}
