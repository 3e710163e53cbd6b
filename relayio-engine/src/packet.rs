use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::Error;
use crate::service::TransportType;
use crate::sid::Sid;
use crate::str::Str;

/// A low level engine packet, one per transport frame.
///
/// Text frames carry a single ASCII digit type prefix followed by the
/// payload. Binary payloads travel as raw binary frames on WebSocket and as
/// base64 with a `b` prefix on the polling transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Handshake packet carrying the session parameters.
    Open(OpenPacket),
    /// Session termination, sent by either side.
    Close,
    /// Heartbeat probe. Only the server sends plain PING packets.
    Ping,
    /// Heartbeat reply. Only the client sends plain PONG packets.
    Pong,
    /// PING with a "probe" payload, sent by the client on a fresh WebSocket
    /// to start the transport upgrade.
    PingProbe,
    /// PONG with a "probe" payload, the server half of the upgrade probe.
    PongProbe,
    /// An application message from the layer above.
    Message(Str),
    /// Confirms the transport upgrade after a successful probe.
    Upgrade,
    /// Filler packet, used to release a pending polling request so the
    /// client can finish an upgrade.
    Noop,
    /// An application binary payload.
    Binary(Bytes),
}

impl Packet {
    pub fn is_binary(&self) -> bool {
        matches!(self, Packet::Binary(_))
    }

    /// Upper bound of the encoded size of this packet, used by the poll
    /// encoder to stay under the maxPayload batching limit.
    ///
    /// With `b64` the base64 expansion `ceil(n / 3) * 4` is accounted for.
    pub(crate) fn size_hint(&self, b64: bool) -> usize {
        match self {
            Packet::Open(_) => 160,
            Packet::Close | Packet::Ping | Packet::Pong => 1,
            Packet::PingProbe | Packet::PongProbe => 6,
            Packet::Message(msg) => 1 + msg.len(),
            Packet::Upgrade | Packet::Noop => 1,
            Packet::Binary(data) => {
                if b64 {
                    1 + (data.len() + 2) / 3 * 4
                } else {
                    1 + data.len()
                }
            }
        }
    }
}

/// Serializes a [`Packet`] into its text frame representation.
impl TryInto<String> for Packet {
    type Error = Error;
    fn try_into(self) -> Result<String, Self::Error> {
        let res = match self {
            Packet::Open(open) => "0".to_string() + &serde_json::to_string(&open)?,
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::PingProbe => "2probe".to_string(),
            Packet::PongProbe => "3probe".to_string(),
            Packet::Message(msg) => "4".to_string() + &msg,
            Packet::Upgrade => "5".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Binary(data) => "b".to_string() + &general_purpose::STANDARD.encode(data),
        };
        Ok(res)
    }
}

/// Deserializes a text frame into a [`Packet`].
///
/// Total: any malformed input yields an [`Error`], never a panic.
impl TryFrom<&str> for Packet {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let prefix = *value.as_bytes().first().ok_or(Error::InvalidPacketType)?;
        let data = &value[1..];
        let res = match prefix {
            b'0' => Packet::Open(serde_json::from_str(data)?),
            b'1' => Packet::Close,
            b'2' if data == "probe" => Packet::PingProbe,
            b'2' => Packet::Ping,
            b'3' if data == "probe" => Packet::PongProbe,
            b'3' => Packet::Pong,
            b'4' => Packet::Message(Str::from(data.to_string())),
            b'5' => Packet::Upgrade,
            b'6' => Packet::Noop,
            b'b' => Packet::Binary(general_purpose::STANDARD.decode(data)?.into()),
            _ => return Err(Error::InvalidPacketType),
        };
        Ok(res)
    }
}

impl TryFrom<String> for Packet {
    type Error = Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Packet::try_from(value.as_str())
    }
}

/// The OPEN payload sent back at handshake time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: Sid,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

impl OpenPacket {
    /// A session opened on polling is always offered the websocket upgrade
    /// when the server accepts it; a websocket session has nothing to
    /// upgrade to.
    pub(crate) fn new(transport: TransportType, sid: Sid, config: &EngineConfig) -> Self {
        let upgrades = if transport == TransportType::Polling
            && config.allows(TransportType::Websocket)
        {
            vec!["websocket".to_string()]
        } else {
            vec![]
        };
        OpenPacket {
            sid,
            upgrades,
            ping_interval: config.ping_interval.as_millis() as u64,
            ping_timeout: config.ping_timeout.as_millis() as u64,
            max_payload: config.max_payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_packet_encode() {
        let sid = Sid::new();
        let packet = Packet::Open(OpenPacket::new(
            TransportType::Polling,
            sid,
            &EngineConfig::default(),
        ));
        let encoded: String = packet.try_into().unwrap();
        assert_eq!(
            encoded,
            format!("0{{\"sid\":\"{sid}\",\"upgrades\":[\"websocket\"],\"pingInterval\":25000,\"pingTimeout\":20000,\"maxPayload\":100000}}")
        );
    }

    #[test]
    fn open_packet_decode() {
        let sid = Sid::new();
        let raw = format!("0{{\"sid\":\"{sid}\",\"upgrades\":[\"websocket\"],\"pingInterval\":25000,\"pingTimeout\":20000,\"maxPayload\":100000}}");
        let packet = Packet::try_from(raw.as_str()).unwrap();
        assert_eq!(
            packet,
            Packet::Open(OpenPacket {
                sid,
                upgrades: vec!["websocket".to_string()],
                ping_interval: 25000,
                ping_timeout: 20000,
                max_payload: 100000,
            })
        );
    }

    #[test]
    fn control_packets_roundtrip() {
        for (packet, raw) in [
            (Packet::Close, "1"),
            (Packet::Ping, "2"),
            (Packet::Pong, "3"),
            (Packet::PingProbe, "2probe"),
            (Packet::PongProbe, "3probe"),
            (Packet::Upgrade, "5"),
            (Packet::Noop, "6"),
        ] {
            let encoded: String = packet.clone().try_into().unwrap();
            assert_eq!(encoded, raw);
            assert_eq!(Packet::try_from(raw).unwrap(), packet);
        }
    }

    #[test]
    fn message_packet_roundtrip() {
        let packet = Packet::Message("hello€".into());
        let encoded: String = packet.clone().try_into().unwrap();
        assert_eq!(encoded, "4hello€");
        assert_eq!(Packet::try_from("4hello€").unwrap(), packet);
    }

    #[test]
    fn binary_packet_roundtrip() {
        let packet = Packet::Binary(Bytes::from_static(&[1, 2, 3]));
        let encoded: String = packet.clone().try_into().unwrap();
        assert_eq!(encoded, "bAQID");
        assert_eq!(Packet::try_from("bAQID").unwrap(), packet);
    }

    #[test]
    fn malformed_packets_are_rejected() {
        assert!(Packet::try_from("").is_err());
        assert!(Packet::try_from("9").is_err());
        assert!(Packet::try_from("0{not json").is_err());
        assert!(Packet::try_from("b$$$").is_err());
    }

    #[test]
    fn size_hint_covers_encoded_size() {
        let packets = [
            Packet::Close,
            Packet::PingProbe,
            Packet::Message("hello".into()),
            Packet::Binary(Bytes::from_static(&[1, 2, 3, 4])),
        ];
        for packet in packets {
            let hint = packet.size_hint(true);
            let encoded: String = packet.try_into().unwrap();
            assert!(hint >= encoded.len());
        }
    }
}
