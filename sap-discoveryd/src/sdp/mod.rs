//! Session description (RFC 4566) grammar for AES67 / Dante announcements.

pub mod attributes;
pub mod parser;

pub use parser::{parse, SdpError};
