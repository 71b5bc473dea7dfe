//! MQTT v3.1.1 client codec
//!
//! Only what a QoS 0 subscriber/publisher needs: CONNECT/CONNACK,
//! PUBLISH, SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK, PINGREQ/PINGRESP and
//! DISCONNECT. Both directions are implemented so scripted peers in tests
//! can share the codec.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Maximum remaining length (268,435,455 bytes)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// SUBACK return code for a refused filter
pub const SUBACK_FAILURE: u8 = 0x80;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid packet type
    InvalidPacketType(u8),
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet too large
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Packet too large
    PacketTooLarge,
    /// String too long
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string exceeds maximum length"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect {
        client_id: String,
        keep_alive: u16,
    },
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish {
        topic: String,
        payload: Bytes,
    },
    Subscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

/// Human-readable CONNACK refusal
pub fn connack_reason(return_code: u8) -> &'static str {
    match return_code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

/// Read a Variable Byte Integer from buffer
/// Returns (value, bytes_consumed) or error
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= buf.len() {
            return Err(DecodeError::InsufficientData);
        }
        if pos >= 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a Variable Byte Integer to buffer
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<(), EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
    Ok(())
}

fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

fn read_string(buf: &[u8]) -> Result<(String, usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let total_len = 2 + len;

    if buf.len() < total_len {
        return Err(DecodeError::InsufficientData);
    }

    let s = std::str::from_utf8(&buf[2..total_len]).map_err(|_| DecodeError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket(
            "string contains null character",
        ));
    }

    Ok((s.to_string(), total_len))
}

fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    if s.len() > 65535 {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn string_len(s: &str) -> usize {
    2 + s.len()
}

/// Encode a packet onto `buf`
pub fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect {
            client_id,
            keep_alive,
        } => {
            // protocol name + level + flags + keep alive + client id
            let remaining = string_len(PROTOCOL_NAME) + 1 + 1 + 2 + string_len(client_id);
            buf.put_u8(0x10);
            write_variable_int(buf, remaining as u32)?;
            write_string(buf, PROTOCOL_NAME)?;
            buf.put_u8(PROTOCOL_LEVEL);
            buf.put_u8(CLEAN_SESSION);
            buf.put_u16(*keep_alive);
            write_string(buf, client_id)?;
        }
        Packet::ConnAck {
            session_present,
            return_code,
        } => {
            buf.put_u8(0x20);
            buf.put_u8(2);
            buf.put_u8(u8::from(*session_present));
            buf.put_u8(*return_code);
        }
        Packet::Publish { topic, payload } => {
            // QoS 0: no packet identifier
            let remaining = string_len(topic) + payload.len();
            buf.put_u8(0x30);
            write_variable_int(buf, remaining as u32)?;
            write_string(buf, topic)?;
            buf.put_slice(payload);
        }
        Packet::Subscribe { packet_id, filters } => {
            let remaining = 2 + filters.iter().map(|f| string_len(f) + 1).sum::<usize>();
            buf.put_u8(0x82);
            write_variable_int(buf, remaining as u32)?;
            buf.put_u16(*packet_id);
            for filter in filters {
                write_string(buf, filter)?;
                buf.put_u8(0); // requested QoS 0
            }
        }
        Packet::SubAck {
            packet_id,
            return_codes,
        } => {
            buf.put_u8(0x90);
            write_variable_int(buf, (2 + return_codes.len()) as u32)?;
            buf.put_u16(*packet_id);
            buf.put_slice(return_codes);
        }
        Packet::Unsubscribe { packet_id, filters } => {
            let remaining = 2 + filters.iter().map(|f| string_len(f)).sum::<usize>();
            buf.put_u8(0xA2);
            write_variable_int(buf, remaining as u32)?;
            buf.put_u16(*packet_id);
            for filter in filters {
                write_string(buf, filter)?;
            }
        }
        Packet::UnsubAck { packet_id } => {
            buf.put_u8(0xB0);
            buf.put_u8(2);
            buf.put_u16(*packet_id);
        }
        Packet::PingReq => {
            buf.put_u8(0xC0);
            buf.put_u8(0);
        }
        Packet::PingResp => {
            buf.put_u8(0xD0);
            buf.put_u8(0);
        }
        Packet::Disconnect => {
            buf.put_u8(0xE0);
            buf.put_u8(0);
        }
    }
    Ok(())
}

/// Decode one packet from the front of `buf`
///
/// Returns `Ok(None)` until a complete packet is buffered.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first_byte = buf[0];
    let packet_type = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
        Ok(r) => r,
        Err(DecodeError::InsufficientData) => return Ok(None),
        Err(e) => return Err(e),
    };

    if remaining_length as usize > MAX_REMAINING_LENGTH {
        return Err(DecodeError::PacketTooLarge);
    }

    let total_len = 1 + len_bytes + remaining_length as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload = &buf[1 + len_bytes..total_len];

    let packet = match packet_type {
        1 => decode_connect(payload)?,
        2 => {
            if payload.len() != 2 {
                return Err(DecodeError::MalformedPacket("CONNACK length"));
            }
            Packet::ConnAck {
                session_present: payload[0] & 0x01 != 0,
                return_code: payload[1],
            }
        }
        3 => decode_publish(flags, payload)?,
        8 => {
            if flags != 0x02 {
                return Err(DecodeError::InvalidFlags);
            }
            let packet_id = read_u16(payload)?;
            let mut filters = Vec::new();
            let mut pos = 2;
            while pos < payload.len() {
                let (filter, len) = read_string(&payload[pos..])?;
                pos += len;
                if pos >= payload.len() {
                    return Err(DecodeError::MalformedPacket("missing requested QoS"));
                }
                pos += 1;
                filters.push(filter);
            }
            Packet::Subscribe { packet_id, filters }
        }
        9 => {
            let packet_id = read_u16(payload)?;
            Packet::SubAck {
                packet_id,
                return_codes: payload[2..].to_vec(),
            }
        }
        10 => {
            if flags != 0x02 {
                return Err(DecodeError::InvalidFlags);
            }
            let packet_id = read_u16(payload)?;
            let mut filters = Vec::new();
            let mut pos = 2;
            while pos < payload.len() {
                let (filter, len) = read_string(&payload[pos..])?;
                pos += len;
                filters.push(filter);
            }
            Packet::Unsubscribe { packet_id, filters }
        }
        11 => Packet::UnsubAck {
            packet_id: read_u16(payload)?,
        },
        12 => Packet::PingReq,
        13 => Packet::PingResp,
        14 => Packet::Disconnect,
        _ => return Err(DecodeError::InvalidPacketType(packet_type)),
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(payload: &[u8]) -> Result<Packet, DecodeError> {
    let (protocol_name, mut pos) = read_string(payload)?;
    if protocol_name != PROTOCOL_NAME {
        return Err(DecodeError::MalformedPacket("protocol name"));
    }

    // level + flags + keep alive
    if payload.len() < pos + 4 {
        return Err(DecodeError::InsufficientData);
    }
    pos += 2;
    let keep_alive = read_u16(&payload[pos..])?;
    pos += 2;

    let (client_id, _) = read_string(&payload[pos..])?;
    Ok(Packet::Connect {
        client_id,
        keep_alive,
    })
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let qos = (flags >> 1) & 0x03;
    if qos == 3 {
        return Err(DecodeError::InvalidFlags);
    }

    let (topic, mut pos) = read_string(payload)?;
    if qos > 0 {
        // Packet identifier; we only ever request QoS 0 so it is not acked
        read_u16(&payload[pos..])?;
        pos += 2;
    }

    Ok(Packet::Publish {
        topic,
        payload: Bytes::copy_from_slice(&payload[pos..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encoded(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        encode(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_connect_wire_bytes() {
        let buf = encoded(&Packet::Connect {
            client_id: "bob".into(),
            keep_alive: 60,
        });
        assert_eq!(
            &buf[..],
            &[
                0x10, 15, 0, 4, b'M', b'Q', b'T', b'T', 4, 0x02, 0, 60, 0, 3, b'b', b'o', b'b'
            ]
        );
    }

    #[test]
    fn test_subscribe_wire_bytes() {
        let buf = encoded(&Packet::Subscribe {
            packet_id: 1,
            filters: vec!["w:1".into()],
        });
        assert_eq!(&buf[..], &[0x82, 8, 0, 1, 0, 3, b'w', b':', b'1', 0]);
    }

    #[test]
    fn test_partial_buffer_waits() {
        let buf = encoded(&Packet::Publish {
            topic: "w:301".into(),
            payload: Bytes::from_static(b"hello"),
        });
        for cut in 0..buf.len() {
            assert_eq!(decode(&buf[..cut]).unwrap(), None);
        }
        let (packet, used) = decode(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(
            packet,
            Packet::Publish {
                topic: "w:301".into(),
                payload: Bytes::from_static(b"hello"),
            }
        );
    }

    #[test]
    fn test_two_packets_in_one_buffer() {
        let mut buf = encoded(&Packet::PingResp);
        encode(
            &Packet::SubAck {
                packet_id: 9,
                return_codes: vec![SUBACK_FAILURE],
            },
            &mut buf,
        )
        .unwrap();

        let (first, used) = decode(&buf).unwrap().unwrap();
        assert_eq!(first, Packet::PingResp);
        let (second, _) = decode(&buf[used..]).unwrap().unwrap();
        assert_eq!(
            second,
            Packet::SubAck {
                packet_id: 9,
                return_codes: vec![0x80],
            }
        );
    }

    #[test]
    fn test_qos1_publish_skips_packet_id() {
        // PUBLISH qos1, topic "a", packet id 7, payload "x"
        let raw = [0x32, 6, 0, 1, b'a', 0, 7, b'x'];
        let (packet, _) = decode(&raw).unwrap().unwrap();
        assert_eq!(
            packet,
            Packet::Publish {
                topic: "a".into(),
                payload: Bytes::from_static(b"x"),
            }
        );
    }

    #[test]
    fn test_large_remaining_length() {
        let payload = Bytes::from(vec![b'z'; 300]);
        let buf = encoded(&Packet::Publish {
            topic: "c:clan".into(),
            payload: payload.clone(),
        });
        // 300 + 8 needs two length bytes
        assert_eq!(buf[1] & 0x80, 0x80);
        let (packet, _) = decode(&buf).unwrap().unwrap();
        assert_eq!(
            packet,
            Packet::Publish {
                topic: "c:clan".into(),
                payload,
            }
        );
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(decode(&[0x00, 0x00]), Err(DecodeError::InvalidPacketType(0)));
        assert_eq!(
            decode(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(DecodeError::InvalidRemainingLength)
        );
        assert_eq!(decode(&[0x36, 0x00]), Err(DecodeError::InvalidFlags));
    }

    #[test]
    fn test_connack_reasons() {
        assert_eq!(connack_reason(0), "accepted");
        assert_eq!(connack_reason(5), "not authorized");
        assert_eq!(connack_reason(42), "unknown return code");
    }
}
