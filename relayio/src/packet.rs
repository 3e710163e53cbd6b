use std::borrow::Cow;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::Error;
use relayio_engine::sid::Sid;

/// A messaging layer packet: a type, a namespace and the type specific data.
///
/// Wire form: `<type digit>[<#attachments>-][<namespace>,][<ack id>][json]`,
/// with the binary attachments of `BinaryEvent`/`BinaryAck` carried on the
/// following engine frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<'a> {
    pub inner: PacketData<'a>,
    pub ns: Cow<'a, str>,
}

/// | Type          | Digit | Usage                                              |
/// |---------------|-------|----------------------------------------------------|
/// | CONNECT       | 0     | Joins a namespace (optionally with an auth payload)|
/// | DISCONNECT    | 1     | Leaves a namespace                                 |
/// | EVENT         | 2     | Named event with arguments                         |
/// | ACK           | 3     | Reply correlated by ack id                         |
/// | CONNECT_ERROR | 4     | Namespace join refused                             |
/// | BINARY_EVENT  | 5     | EVENT with binary attachments                      |
/// | BINARY_ACK    | 6     | ACK with binary attachments                        |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketData<'a> {
    Connect(Option<String>),
    Disconnect,
    Event(Cow<'a, str>, Value, Option<i64>),
    EventAck(Value, i64),
    ConnectError(String),
    BinaryEvent(Cow<'a, str>, BinaryPacket, Option<i64>),
    BinaryAck(BinaryPacket, i64),
}

impl<'a> Packet<'a> {
    /// The CONNECT acknowledgement sent back once a socket joined a
    /// namespace.
    pub fn connect(ns: &'a str, sid: Sid) -> Self {
        let val = serde_json::to_string(&ConnectPacket { sid }).unwrap();
        Self {
            inner: PacketData::Connect(Some(val)),
            ns: Cow::Borrowed(ns),
        }
    }

    pub fn disconnect(ns: &'a str) -> Self {
        Self {
            inner: PacketData::Disconnect,
            ns: Cow::Borrowed(ns),
        }
    }

    /// A CONNECT_ERROR with a message and an optional structured payload.
    pub fn connect_error(ns: &'a str, message: &str, data: Option<Value>) -> Self {
        let body = match data {
            Some(data) => json!({ "message": message, "data": data }),
            None => json!({ "message": message }),
        };
        Self {
            inner: PacketData::ConnectError(body.to_string()),
            ns: Cow::Borrowed(ns),
        }
    }

    pub fn event(ns: impl Into<Cow<'a, str>>, e: impl Into<Cow<'a, str>>, data: Value) -> Self {
        Self {
            inner: PacketData::Event(e.into(), data, None),
            ns: ns.into(),
        }
    }

    pub fn bin_event(
        ns: impl Into<Cow<'a, str>>,
        e: impl Into<Cow<'a, str>>,
        data: Value,
        bin: Vec<Bytes>,
    ) -> Self {
        debug_assert!(!bin.is_empty());
        Self {
            inner: PacketData::BinaryEvent(e.into(), BinaryPacket::outgoing(data, bin), None),
            ns: ns.into(),
        }
    }

    pub fn ack(ns: &'a str, data: Value, ack: i64) -> Self {
        Self {
            inner: PacketData::EventAck(data, ack),
            ns: Cow::Borrowed(ns),
        }
    }

    pub fn bin_ack(ns: &'a str, data: Value, bin: Vec<Bytes>, ack: i64) -> Self {
        debug_assert!(!bin.is_empty());
        Self {
            inner: PacketData::BinaryAck(BinaryPacket::outgoing(data, bin), ack),
            ns: Cow::Borrowed(ns),
        }
    }

    /// Encodes the packet once into its text frame plus the detached binary
    /// attachments, so a broadcast can reuse the frames for every target.
    pub fn into_frames(
        mut self,
    ) -> Result<(relayio_engine::Str, Vec<Bytes>), serde_json::Error> {
        let bin = match self.inner {
            PacketData::BinaryEvent(_, ref mut packet, _)
            | PacketData::BinaryAck(ref mut packet, _) => std::mem::take(&mut packet.bin),
            _ => Vec::new(),
        };
        let msg: String = self.try_into()?;
        Ok((relayio_engine::Str::from(msg), bin))
    }
}

impl PacketData<'_> {
    fn index(&self) -> char {
        match self {
            PacketData::Connect(_) => '0',
            PacketData::Disconnect => '1',
            PacketData::Event(_, _, _) => '2',
            PacketData::EventAck(_, _) => '3',
            PacketData::ConnectError(_) => '4',
            PacketData::BinaryEvent(_, _, _) => '5',
            PacketData::BinaryAck(_, _) => '6',
        }
    }

    /// Sets the ack id on the packet kinds that carry one outbound.
    pub fn set_ack_id(&mut self, ack_id: i64) {
        match self {
            PacketData::Event(_, _, ack) | PacketData::BinaryEvent(_, _, ack) => {
                *ack = Some(ack_id)
            }
            _ => {}
        }
    }

    pub(crate) fn is_binary(&self) -> bool {
        matches!(
            self,
            PacketData::BinaryEvent(_, _, _) | PacketData::BinaryAck(_, _)
        )
    }
}

/// An event payload whose binary blobs travel as separate frames.
///
/// Outgoing, each blob is replaced by a `{"_placeholder":true,"num":i}` node
/// appended to the argument list. Incoming, the placeholders are counted and
/// the packet is held until as many binary frames have arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPacket {
    pub data: Value,
    pub bin: Vec<Bytes>,
    payload_count: usize,
}

/// Counts placeholder nodes anywhere in the value graph. `serde_json::Value`
/// is a tree, so the walk terminates on arbitrary input.
fn count_placeholders(value: &Value) -> usize {
    match value {
        Value::Array(values) => values.iter().map(count_placeholders).sum(),
        Value::Object(map) => {
            if map.get("_placeholder").and_then(Value::as_bool) == Some(true) {
                1
            } else {
                map.values().map(count_placeholders).sum()
            }
        }
        _ => 0,
    }
}

fn is_placeholder(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|o| o.get("_placeholder"))
        .is_some()
}

impl BinaryPacket {
    /// Builds a packet from decoded data: counts the expected attachments
    /// and strips the placeholder arguments.
    pub fn incoming(mut data: Value) -> Self {
        let payload_count = count_placeholders(&data);
        match &mut data {
            Value::Array(args) => args.retain(|arg| !is_placeholder(arg)),
            value if is_placeholder(value) => data = Value::Array(vec![]),
            _ => (),
        }
        Self {
            data,
            bin: Vec::new(),
            payload_count,
        }
    }

    /// Builds a packet to send: appends one placeholder per blob to the
    /// argument list.
    pub fn outgoing(data: Value, bin: Vec<Bytes>) -> Self {
        let mut data = match data {
            Value::Array(args) => Value::Array(args),
            value => Value::Array(vec![value]),
        };
        let payload_count = bin.len();
        if let Value::Array(args) = &mut data {
            for num in 0..payload_count {
                args.push(json!({ "_placeholder": true, "num": num }));
            }
        }
        Self {
            data,
            bin,
            payload_count,
        }
    }

    pub fn add_payload(&mut self, payload: Bytes) {
        self.bin.push(payload);
    }

    pub fn is_complete(&self) -> bool {
        self.payload_count == self.bin.len()
    }

    pub fn payload_count(&self) -> usize {
        self.payload_count
    }
}

impl TryInto<String> for Packet<'_> {
    type Error = serde_json::Error;

    fn try_into(mut self) -> Result<String, Self::Error> {
        use PacketData::*;

        // pre-serialize the payload so the buffer can be sized up front
        let data = match &mut self.inner {
            Event(e, data, _) | BinaryEvent(e, BinaryPacket { data, .. }, _) => {
                // the wire payload is ["<event>", ...args]
                let payload = match data {
                    Value::Array(args) if !args.is_empty() => {
                        args.insert(0, Value::String(e.to_string()));
                        serde_json::to_string(&args)
                    }
                    Value::Array(_) => serde_json::to_string::<(_, [(); 0])>(&(e, [])),
                    value => serde_json::to_string(&(e, value)),
                }?;
                Some(payload)
            }
            EventAck(data, _) | BinaryAck(BinaryPacket { data, .. }, _) => {
                // an ack payload is always an array of arguments
                let payload = match data {
                    Value::Array(_) => serde_json::to_string(&data),
                    Value::Null => Ok("[]".to_string()),
                    value => serde_json::to_string(&[value]),
                }?;
                Some(payload)
            }
            _ => None,
        };

        let mut res = String::with_capacity(
            16 + self.ns.len() + data.as_ref().map(String::len).unwrap_or(0),
        );
        res.push(self.inner.index());

        let push_nsp = |res: &mut String| {
            if !self.ns.is_empty() && self.ns != "/" {
                if !self.ns.starts_with('/') {
                    res.push('/');
                }
                res.push_str(&self.ns);
                res.push(',');
            }
        };

        // binary packets carry the attachment count before the namespace
        if !self.inner.is_binary() {
            push_nsp(&mut res);
        }

        match self.inner {
            PacketData::Connect(Some(data)) => res.push_str(&data),
            PacketData::Connect(None) | PacketData::Disconnect => (),
            PacketData::ConnectError(data) => res.push_str(&data),
            PacketData::Event(_, _, ack) => {
                if let Some(ack) = ack {
                    res.push_str(&ack.to_string());
                }
                res.push_str(&data.unwrap());
            }
            PacketData::EventAck(_, ack) => {
                res.push_str(&ack.to_string());
                res.push_str(&data.unwrap());
            }
            PacketData::BinaryEvent(_, packet, ack) => {
                res.push_str(&packet.payload_count.to_string());
                res.push('-');
                push_nsp(&mut res);
                if let Some(ack) = ack {
                    res.push_str(&ack.to_string());
                }
                res.push_str(&data.unwrap());
            }
            PacketData::BinaryAck(packet, ack) => {
                res.push_str(&packet.payload_count.to_string());
                res.push('-');
                push_nsp(&mut res);
                res.push_str(&ack.to_string());
                res.push_str(&data.unwrap());
            }
        }
        Ok(res)
    }
}

/// Splits a decoded event payload `["<event>", ...args]` into the event name
/// and the argument array.
fn parse_event_payload(data: &str) -> Result<(String, Value), Error> {
    let args = match serde_json::from_str::<Value>(data)? {
        Value::Array(args) => args,
        _ => return Err(Error::InvalidEventName),
    };
    let mut args = args.into_iter();
    let event = match args.next() {
        Some(Value::String(event)) => event,
        _ => return Err(Error::InvalidEventName),
    };
    Ok((event, Value::from_iter(args)))
}

/// Parses an ack payload, which must be a json array.
fn parse_ack_payload(data: &str) -> Result<Value, Error> {
    if data.is_empty() {
        return Err(Error::InvalidPacketType);
    }
    Ok(serde_json::from_str(data)?)
}

impl TryFrom<&str> for Packet<'static> {
    type Error = Error;

    /// Decodes a text frame. Total: malformed input yields an [`Error`];
    /// the separators are all ASCII so the scan works on bytes.
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let index = *value.as_bytes().first().ok_or(Error::InvalidPacketType)?;
        if !(b'0'..=b'6').contains(&index) {
            return Err(Error::InvalidPacketType);
        }
        let mut rest = &value[1..];

        // attachment count, mandatory for binary packets
        let attachments = if index == b'5' || index == b'6' {
            let sep = rest.find('-').ok_or(Error::InvalidPacketType)?;
            let count: usize = rest[..sep].parse().map_err(|_| Error::InvalidPacketType)?;
            if count == 0 {
                return Err(Error::InvalidPacketType);
            }
            rest = &rest[sep + 1..];
            count
        } else {
            0
        };

        // a non default namespace starts with a slash and runs to the first
        // comma (or to the end of the packet for payload-less packets)
        let ns: Cow<'static, str> = if rest.starts_with('/') {
            match rest.find(',') {
                Some(i) => {
                    let ns = rest[..i].to_string();
                    rest = &rest[i + 1..];
                    Cow::Owned(ns)
                }
                None => {
                    let ns = std::mem::take(&mut rest).to_string();
                    Cow::Owned(ns)
                }
            }
        } else {
            Cow::Borrowed("/")
        };

        // ack id: the longest leading run of digits right before the payload
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack = if digits > 0 && matches!(rest.as_bytes().get(digits), Some(b'[') | Some(b'{')) {
            let ack = rest[..digits]
                .parse()
                .map_err(|_| Error::InvalidPacketType)?;
            rest = &rest[digits..];
            Some(ack)
        } else {
            None
        };

        let inner = match index {
            b'0' => PacketData::Connect((!rest.is_empty()).then(|| rest.to_string())),
            b'1' => PacketData::Disconnect,
            b'2' => {
                let (event, args) = parse_event_payload(rest)?;
                PacketData::Event(event.into(), args, ack)
            }
            b'3' => {
                let args = parse_ack_payload(rest)?;
                PacketData::EventAck(args, ack.ok_or(Error::InvalidPacketType)?)
            }
            b'4' => PacketData::ConnectError(rest.to_string()),
            b'5' => {
                let (event, args) = parse_event_payload(rest)?;
                let packet = BinaryPacket::incoming(args);
                if packet.payload_count != attachments {
                    return Err(Error::AttachmentCountMismatch);
                }
                PacketData::BinaryEvent(event.into(), packet, ack)
            }
            b'6' => {
                let packet = BinaryPacket::incoming(parse_ack_payload(rest)?);
                if packet.payload_count != attachments {
                    return Err(Error::AttachmentCountMismatch);
                }
                PacketData::BinaryAck(packet, ack.ok_or(Error::InvalidPacketType)?)
            }
            _ => unreachable!("the packet index was checked above"),
        };

        Ok(Self { inner, ns })
    }
}

/// Payload of the CONNECT acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPacket {
    pub sid: Sid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_roundtrip() {
        let sid = Sid::new();
        let raw = format!("0{}", json!({ "sid": sid }));
        assert_eq!(Packet::try_from(raw.as_str()).unwrap(), Packet::connect("/", sid));
        let encoded: String = Packet::connect("/", sid).try_into().unwrap();
        assert_eq!(encoded, raw);

        let raw = format!("0/admin,{}", json!({ "sid": sid }));
        assert_eq!(
            Packet::try_from(raw.as_str()).unwrap(),
            Packet::connect("/admin", sid)
        );
        let encoded: String = Packet::connect("/admin", sid).try_into().unwrap();
        assert_eq!(encoded, raw);
    }

    #[test]
    fn connect_with_auth_payload() {
        let packet = Packet::try_from("0/admin,{\"token\":\"s3cret\"}").unwrap();
        assert_eq!(packet.ns, "/admin");
        assert_eq!(
            packet.inner,
            PacketData::Connect(Some("{\"token\":\"s3cret\"}".to_string()))
        );
    }

    #[test]
    fn disconnect_roundtrip() {
        assert_eq!(Packet::try_from("1").unwrap(), Packet::disconnect("/"));
        assert_eq!(
            Packet::try_from("1/admin,").unwrap(),
            Packet::disconnect("/admin")
        );
        // some clients drop the trailing comma on payload-less packets
        assert_eq!(
            Packet::try_from("1/admin").unwrap(),
            Packet::disconnect("/admin")
        );
        let encoded: String = Packet::disconnect("/admin").try_into().unwrap();
        assert_eq!(encoded, "1/admin,");
    }

    #[test]
    fn event_roundtrip() {
        let raw = format!("2{}", json!(["event", { "data": "value" }]));
        let packet = Packet::try_from(raw.as_str()).unwrap();
        assert_eq!(packet, Packet::event("/", "event", json!([{ "data": "value" }])));

        let encoded: String = Packet::event("/", "event", json!({ "data": "value" }))
            .try_into()
            .unwrap();
        assert_eq!(encoded, raw);
    }

    #[test]
    fn event_with_ack_and_ns() {
        let raw = format!("2/admin,12{}", json!(["event", 1, 2]));
        let packet = Packet::try_from(raw.as_str()).unwrap();

        let mut expected = Packet::event("/admin", "event", json!([1, 2]));
        expected.inner.set_ack_id(12);
        assert_eq!(packet, expected);

        let mut packet = Packet::event("/admin", "event", json!([1, 2]));
        packet.inner.set_ack_id(12);
        let encoded: String = packet.try_into().unwrap();
        assert_eq!(encoded, raw);
    }

    #[test]
    fn empty_event_payload() {
        let encoded: String = Packet::event("/", "event", json!([])).try_into().unwrap();
        assert_eq!(encoded, format!("2{}", json!(["event", []])));
    }

    #[test]
    fn ack_roundtrip() {
        let raw = "354[\"data\"]";
        assert_eq!(
            Packet::try_from(raw).unwrap(),
            Packet::ack("/", json!(["data"]), 54)
        );
        let encoded: String = Packet::ack("/", json!("data"), 54).try_into().unwrap();
        assert_eq!(encoded, raw);

        let raw = "3/admin,54[\"data\"]";
        assert_eq!(
            Packet::try_from(raw).unwrap(),
            Packet::ack("/admin", json!(["data"]), 54)
        );
    }

    #[test]
    fn ack_without_id_is_rejected() {
        assert!(Packet::try_from("3[\"data\"]").is_err());
    }

    #[test]
    fn connect_error_roundtrip() {
        let raw = format!("4{}", json!({ "message": "Invalid namespace" }));
        let encoded: String = Packet::connect_error("/", "Invalid namespace", None)
            .try_into()
            .unwrap();
        assert_eq!(encoded, raw);

        let raw = format!(
            "4/admin,{}",
            json!({ "message": "auth failed", "data": { "code": 401 } })
        );
        let encoded: String =
            Packet::connect_error("/admin", "auth failed", Some(json!({ "code": 401 })))
                .try_into()
                .unwrap();
        assert_eq!(encoded, raw);
    }

    #[test]
    fn binary_event_roundtrip() {
        let json = json!(["event", { "data": "value" }, { "_placeholder": true, "num": 0 }]);
        let raw = format!("51-{}", json);

        let encoded: String = Packet::bin_event(
            "/",
            "event",
            json!({ "data": "value" }),
            vec![Bytes::from_static(&[1])],
        )
        .try_into()
        .unwrap();
        assert_eq!(encoded, raw);

        let mut packet = Packet::try_from(raw.as_str()).unwrap();
        match packet.inner {
            PacketData::BinaryEvent(ref e, ref mut bin, ack) => {
                assert_eq!(e, "event");
                assert_eq!(ack, None);
                assert_eq!(bin.payload_count(), 1);
                assert!(!bin.is_complete());
                bin.add_payload(Bytes::from_static(&[1]));
                assert!(bin.is_complete());
                assert_eq!(bin.data, json!([{ "data": "value" }]));
            }
            _ => panic!("expected a binary event"),
        }
    }

    #[test]
    fn binary_event_with_ns_and_ack() {
        let json = json!(["event", { "data": "value" }, { "_placeholder": true, "num": 0 }]);
        let raw = format!("51-/admin,254{}", json);
        let mut packet = Packet::bin_event(
            "/admin",
            "event",
            json!({ "data": "value" }),
            vec![Bytes::from_static(&[1])],
        );
        packet.inner.set_ack_id(254);
        let encoded: String = packet.try_into().unwrap();
        assert_eq!(encoded, raw);

        let decoded = Packet::try_from(raw.as_str()).unwrap();
        assert_eq!(decoded.ns, "/admin");
        assert!(matches!(
            decoded.inner,
            PacketData::BinaryEvent(_, _, Some(254))
        ));
    }

    #[test]
    fn binary_ack_roundtrip() {
        let json = json!([{ "data": "value" }, { "_placeholder": true, "num": 0 }]);
        let raw = format!("61-54{}", json);
        let encoded: String = Packet::bin_ack(
            "/",
            json!({ "data": "value" }),
            vec![Bytes::from_static(&[1])],
            54,
        )
        .try_into()
        .unwrap();
        assert_eq!(encoded, raw);

        let decoded = Packet::try_from(raw.as_str()).unwrap();
        assert!(matches!(decoded.inner, PacketData::BinaryAck(_, 54)));
    }

    #[test]
    fn attachment_count_mismatch_is_rejected() {
        // header announces 2 attachments but the payload has one placeholder
        let raw = format!(
            "52-{}",
            json!(["event", { "_placeholder": true, "num": 0 }])
        );
        assert!(matches!(
            Packet::try_from(raw.as_str()),
            Err(Error::AttachmentCountMismatch)
        ));
    }

    #[test]
    fn nested_placeholders_are_counted() {
        let raw = format!(
            "52-{}",
            json!(["event", { "a": { "_placeholder": true, "num": 0 } }, { "_placeholder": true, "num": 1 }])
        );
        let packet = Packet::try_from(raw.as_str()).unwrap();
        match packet.inner {
            PacketData::BinaryEvent(_, bin, _) => assert_eq!(bin.payload_count(), 2),
            _ => panic!("expected a binary event"),
        }
    }

    #[test]
    fn malformed_packets_are_rejected() {
        assert!(Packet::try_from("").is_err());
        assert!(Packet::try_from("7").is_err());
        assert!(Packet::try_from("2{not json").is_err());
        assert!(Packet::try_from("2[42]").is_err()); // event name must be a string
        assert!(Packet::try_from("5-[\"e\"]").is_err()); // empty attachment count
        assert!(Packet::try_from("50-[\"e\"]").is_err()); // zero attachments
    }
}
