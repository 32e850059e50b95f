use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use shared::protocol::{SAP_VERSION, SDP_MIME_TYPE};
use thiserror::Error;

/// Fixed part of the header before the originating address
const FIXED_HEADER_LEN: usize = 4;

/// Failure to lay the SAP structure over a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram too short: {field} needs {needed} bytes, got {len}")]
    Truncated {
        field: &'static str,
        needed: usize,
        len: usize,
    },
    #[error("payload type is not NUL-terminated")]
    UnterminatedPayloadType,
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

/// A well-formed envelope this daemon does not accept.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported SAP version {0}")]
    UnsupportedVersion(u8),
    #[error("IPv6 originating address is not supported")]
    Ipv6Origin,
    #[error("encrypted payloads are not supported")]
    Encrypted,
    #[error("compressed payloads are not supported")]
    Compressed,
    #[error("unexpected payload type {0:?}")]
    WrongPayloadType(String),
}

/// Header flags, byte 0 of the envelope: `V V V A R T E C` from MSB to LSB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SapFlags {
    pub version: u8,
    /// Address type: originating address is IPv6
    pub ipv6: bool,
    pub reserved: bool,
    /// Message type: deletion instead of announcement
    pub deletion: bool,
    pub encrypted: bool,
    pub compressed: bool,
}

impl SapFlags {
    pub fn from_byte(byte: u8) -> Self {
        SapFlags {
            version: (byte >> 5) & 0x07,
            ipv6: byte & 0x10 != 0,
            reserved: byte & 0x08 != 0,
            deletion: byte & 0x04 != 0,
            encrypted: byte & 0x02 != 0,
            compressed: byte & 0x01 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = (self.version & 0x07) << 5;
        if self.ipv6 {
            byte |= 0x10;
        }
        if self.reserved {
            byte |= 0x08;
        }
        if self.deletion {
            byte |= 0x04;
        }
        if self.encrypted {
            byte |= 0x02;
        }
        if self.compressed {
            byte |= 0x01;
        }
        byte
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Announcement,
    Deletion,
}

/// One decoded SAP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SapPacket {
    pub flags: SapFlags,
    /// Authentication header length in bytes
    pub auth_len: u8,
    pub msg_id_hash: u16,
    pub origin: IpAddr,
    /// MIME type of the payload, normally "application/sdp"
    pub payload_type: String,
    /// Session description text
    pub payload: String,
}

impl SapPacket {
    /// Decode a raw datagram. Every offset is checked against `data.len()`
    /// before it is read.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let fixed = slice(data, 0, FIXED_HEADER_LEN, "fixed header")?;
        let flags = SapFlags::from_byte(fixed[0]);
        let auth_len = fixed[1];
        let msg_id_hash = u16::from_be_bytes([fixed[2], fixed[3]]);

        let (origin, origin_end) = if flags.ipv6 {
            let end = FIXED_HEADER_LEN + 16;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(slice(data, FIXED_HEADER_LEN, end, "originating address")?);
            (IpAddr::V6(Ipv6Addr::from(octets)), end)
        } else {
            let end = FIXED_HEADER_LEN + 4;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(slice(data, FIXED_HEADER_LEN, end, "originating address")?);
            (IpAddr::V4(Ipv4Addr::from(octets)), end)
        };

        // The authentication header is skipped without interpretation
        let auth_end = origin_end + auth_len as usize;
        slice(data, origin_end, auth_end, "authentication header")?;

        let rest = &data[auth_end..];
        let type_len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedPayloadType)?;
        let payload_type = std::str::from_utf8(&rest[..type_len])
            .map_err(|_| DecodeError::InvalidUtf8("payload type"))?
            .to_string();

        let body = &rest[type_len + 1..];
        let body_len = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let payload = std::str::from_utf8(&body[..body_len])
            .map_err(|_| DecodeError::InvalidUtf8("payload"))?
            .to_string();

        Ok(SapPacket {
            flags,
            auth_len,
            msg_id_hash,
            origin,
            payload_type,
            payload,
        })
    }

    /// Wire form of the packet. The authentication header is zero-filled.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(24 + self.payload_type.len() + self.payload.len());

        packet.push(self.flags.to_byte());
        packet.push(self.auth_len);
        packet.extend_from_slice(&self.msg_id_hash.to_be_bytes());

        match self.origin {
            IpAddr::V4(addr) => packet.extend_from_slice(&addr.octets()),
            IpAddr::V6(addr) => packet.extend_from_slice(&addr.octets()),
        }

        packet.resize(packet.len() + self.auth_len as usize, 0);

        packet.extend_from_slice(self.payload_type.as_bytes());
        packet.push(0);
        packet.extend_from_slice(self.payload.as_bytes());
        packet.push(0);

        packet
    }

    /// Build an uncompressed, unencrypted announcement or deletion for SDP
    pub fn new_sdp(origin: IpAddr, msg_id_hash: u16, payload: &str, deletion: bool) -> Self {
        SapPacket {
            flags: SapFlags {
                version: SAP_VERSION,
                ipv6: origin.is_ipv6(),
                reserved: false,
                deletion,
                encrypted: false,
                compressed: false,
            },
            auth_len: 0,
            msg_id_hash,
            origin,
            payload_type: SDP_MIME_TYPE.to_string(),
            payload: payload.to_string(),
        }
    }

    /// Check the envelope against what this daemon supports.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.flags.version != SAP_VERSION {
            return Err(ValidationError::UnsupportedVersion(self.flags.version));
        }
        if self.flags.ipv6 {
            return Err(ValidationError::Ipv6Origin);
        }
        if self.flags.encrypted {
            return Err(ValidationError::Encrypted);
        }
        if self.flags.compressed {
            return Err(ValidationError::Compressed);
        }
        if self.payload_type != SDP_MIME_TYPE {
            return Err(ValidationError::WrongPayloadType(self.payload_type.clone()));
        }
        Ok(())
    }

    pub fn kind(&self) -> MessageKind {
        if self.flags.deletion {
            MessageKind::Deletion
        } else {
            MessageKind::Announcement
        }
    }
}

fn slice<'a>(data: &'a [u8], start: usize, end: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
    data.get(start..end).ok_or(DecodeError::Truncated {
        field,
        needed: end,
        len: data.len(),
    })
}
