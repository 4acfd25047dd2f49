//! Packets carried by the producer pipeline.
//!
//! A [`Packet`] is the unit that gets buffered on disk and handed to the
//! remote send client. The binary framing below is private to the durable
//! queue; it is not a broker wire format.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::core::error::PacketError;

const PACKET_VERSION: u8 = 1;
const MAX_DESTINATION_LEN: usize = 128;

/// Named logical channel a packet is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    name: String,
}

impl Destination {
    /// Builds a topic destination.
    ///
    /// The name doubles as a directory name for the queue, so only
    /// `[A-Za-z0-9_.-]` is accepted and `.`/`..` are rejected.
    pub fn topic(name: impl Into<String>) -> Result<Self, PacketError> {
        let name = name.into();
        let valid_chars = name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
        if name.is_empty()
            || name.len() > MAX_DESTINATION_LEN
            || !valid_chars
            || name == "."
            || name == ".."
        {
            return Err(PacketError::InvalidDestination(name));
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic:{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    id: Uuid,
    destination: Destination,
    payload: Bytes,
    properties: BTreeMap<String, String>,
    created_at: u64,
}

impl Packet {
    pub fn new(destination: Destination, payload: impl Into<Bytes>) -> Self {
        Self::with_properties(destination, payload, BTreeMap::new())
    }

    pub fn with_properties(
        destination: Destination,
        payload: impl Into<Bytes>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination,
            payload: payload.into(),
            properties,
            created_at: current_timestamp(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Encodes the packet into its on-disk representation.
    ///
    /// Layout (little endian):
    /// `version u8 | id [16] | created_at u64 | dest_len u16 | dest |
    ///  prop_count u16 | (key_len u16 | key | val_len u32 | val)* |
    ///  payload_len u32 | payload`
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        buf.put_u8(PACKET_VERSION);
        buf.put_slice(self.id.as_bytes());
        buf.put_u64_le(self.created_at);
        put_str_u16(&mut buf, "destination", self.destination.name())?;

        let prop_count = u16::try_from(self.properties.len()).map_err(|_| PacketError::TooLarge {
            field: "properties",
            len: self.properties.len(),
        })?;
        buf.put_u16_le(prop_count);
        for (key, value) in &self.properties {
            put_str_u16(&mut buf, "property key", key)?;
            put_bytes_u32(&mut buf, "property value", value.as_bytes())?;
        }

        put_bytes_u32(&mut buf, "payload", &self.payload)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, PacketError> {
        ensure(&buf, 1, "version")?;
        let version = buf.get_u8();
        if version != PACKET_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        ensure(&buf, 16 + 8, "header")?;
        let mut id_bytes = [0u8; 16];
        buf.copy_to_slice(&mut id_bytes);
        let id = Uuid::from_bytes(id_bytes);
        let created_at = buf.get_u64_le();

        let name = get_str_u16(&mut buf, "destination")?;
        let destination = Destination::topic(name)?;

        ensure(&buf, 2, "property count")?;
        let prop_count = buf.get_u16_le();
        let mut properties = BTreeMap::new();
        for _ in 0..prop_count {
            let key = get_str_u16(&mut buf, "property key")?;
            let value = get_bytes_u32(&mut buf, "property value")?;
            let value = String::from_utf8(value.to_vec()).map_err(|_| PacketError::InvalidUtf8 {
                field: "property value",
            })?;
            properties.insert(key, value);
        }

        let payload = get_bytes_u32(&mut buf, "payload")?;

        Ok(Self {
            id,
            destination,
            payload,
            properties,
            created_at,
        })
    }

    fn encoded_len_hint(&self) -> usize {
        let props: usize = self
            .properties
            .iter()
            .map(|(k, v)| 2 + k.len() + 4 + v.len())
            .sum();
        1 + 16 + 8 + 2 + self.destination.name().len() + 2 + props + 4 + self.payload.len()
    }
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn ensure(buf: &Bytes, needed: usize, what: &'static str) -> Result<(), PacketError> {
    if buf.remaining() < needed {
        Err(PacketError::Truncated(what))
    } else {
        Ok(())
    }
}

fn put_str_u16(buf: &mut BytesMut, field: &'static str, value: &str) -> Result<(), PacketError> {
    let len = u16::try_from(value.len()).map_err(|_| PacketError::TooLarge {
        field,
        len: value.len(),
    })?;
    buf.put_u16_le(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_bytes_u32(buf: &mut BytesMut, field: &'static str, value: &[u8]) -> Result<(), PacketError> {
    let len = u32::try_from(value.len()).map_err(|_| PacketError::TooLarge {
        field,
        len: value.len(),
    })?;
    buf.put_u32_le(len);
    buf.put_slice(value);
    Ok(())
}

fn get_str_u16(buf: &mut Bytes, field: &'static str) -> Result<String, PacketError> {
    ensure(buf, 2, field)?;
    let len = buf.get_u16_le() as usize;
    ensure(buf, len, field)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidUtf8 { field })
}

fn get_bytes_u32(buf: &mut Bytes, field: &'static str) -> Result<Bytes, PacketError> {
    ensure(buf, 4, field)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len, field)?;
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Destination {
        Destination::topic("orders.v1").unwrap()
    }

    #[test]
    fn destination_rejects_path_like_names() {
        assert!(Destination::topic("").is_err());
        assert!(Destination::topic("..").is_err());
        assert!(Destination::topic("a/b").is_err());
        assert!(Destination::topic("with space").is_err());
        assert!(Destination::topic("x".repeat(129)).is_err());
        assert_eq!(Destination::topic("ok_topic-1").unwrap().name(), "ok_topic-1");
    }

    #[test]
    fn decode_restores_every_field() {
        let mut props = BTreeMap::new();
        props.insert("trace-id".to_string(), "abc".to_string());
        let packet = Packet::with_properties(orders(), "hello", props);

        let decoded = Packet::decode(packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.property("trace-id"), Some("abc"));
    }

    #[test]
    fn truncated_frame_is_an_error_not_a_panic() {
        let encoded = Packet::new(orders(), "payload").encode().unwrap();
        let cut = encoded.slice(..encoded.len() - 3);
        assert_eq!(
            Packet::decode(cut).unwrap_err(),
            PacketError::Truncated("payload")
        );
        assert!(Packet::decode(Bytes::new()).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let encoded = Packet::new(orders(), "x").encode().unwrap();
        let mut raw = encoded.to_vec();
        raw[0] = 9;
        assert_eq!(
            Packet::decode(Bytes::from(raw)).unwrap_err(),
            PacketError::UnsupportedVersion(9)
        );
    }
}
