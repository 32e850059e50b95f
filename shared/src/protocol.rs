use std::net::Ipv4Addr;

/// SAP multicast group for IPv4 global scope announcements (RFC 2974)
pub const SAP_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 255);

/// Well-known SAP port
pub const SAP_PORT: u16 = 9875;

/// The only SAP version in use
pub const SAP_VERSION: u8 = 1;

/// Payload type carried by AES67 / Dante announcements
pub const SDP_MIME_TYPE: &str = "application/sdp";

/// Default age after which an unrefreshed stream is dropped
pub const DEFAULT_LIVENESS_WINDOW_SECS: u64 = 60;

/// Default period of the expiry sweep
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3;
