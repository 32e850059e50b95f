//! SAP (RFC 2974) envelope decoding and validation.

pub mod packet;

pub use packet::{DecodeError, MessageKind, SapFlags, SapPacket, ValidationError};
