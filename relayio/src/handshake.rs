use std::{sync::Arc, time::SystemTime};

use serde::de::DeserializeOwned;
use serde_json::Value;

use relayio_engine::SessionReq;

/// Everything known about a client at namespace connect time: the handshake
/// http request plus the auth payload carried by the CONNECT packet.
///
/// Authorizers and middlewares decide on this data.
#[derive(Debug)]
pub struct Handshake {
    /// Uri of the handshake request.
    pub uri: http::Uri,
    /// Headers of the handshake request.
    pub headers: http::HeaderMap,
    /// When the namespace connect was issued.
    pub issued: SystemTime,
    /// The auth payload of the CONNECT packet, `Null` when absent.
    pub auth: Value,
}

impl Handshake {
    pub(crate) fn new(auth: Option<String>, req: &Arc<SessionReq>) -> Result<Self, serde_json::Error> {
        let auth = match auth {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Value::Null,
        };
        Ok(Self {
            uri: req.uri.clone(),
            headers: req.headers.clone(),
            issued: SystemTime::now(),
            auth,
        })
    }

    /// Deserializes the auth payload to a concrete type.
    pub fn auth_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.auth.clone())
    }
}
