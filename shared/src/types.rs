use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// PTP grandmaster clock identity (EUI-64), e.g. `00-1D-C1-FF-FE-0D-A9-88`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ClockId(pub [u8; 8]);

impl From<ClockId> for String {
    fn from(id: ClockId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ClockId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl FromStr for ClockId {
    type Err = String;

    /// Accepts eight two-digit hex groups separated by `-` or `:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let groups: Vec<&str> = s.split(|c: char| c == '-' || c == ':').collect();
        if groups.len() != 8 {
            return Err(format!("expected 8 hex groups, got {}", groups.len()));
        }

        let mut bytes = [0u8; 8];
        for (slot, group) in bytes.iter_mut().zip(&groups) {
            if group.len() != 2 {
                return Err(format!("invalid hex group {:?}", group));
            }
            let decoded = hex::decode(group).map_err(|e| format!("invalid hex group {:?}: {}", group, e))?;
            *slot = decoded[0];
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.0.iter().map(|b| hex::encode_upper([*b])).collect();
        f.write_str(&groups.join("-"))
    }
}

/// Stream parameters extracted from an announced session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescription {
    /// `a=keywds` tag, e.g. "Dante"
    pub source_type: String,

    /// `s=` session name
    pub source_name: String,

    /// `i=` free text, empty when absent
    pub source_info: String,

    /// `o=` line, kept verbatim
    pub origin: String,

    /// Multicast group the audio is sent to (`c=`)
    pub stream_address: Ipv4Addr,

    /// Multicast TTL from the `c=` line
    pub multicast_ttl: u8,

    pub udp_port: u16,
    pub payload_type: u8,
    pub bit_depth: u8,
    pub sample_rate: u32,
    pub channel_count: u16,

    /// `a=ptime`, milliseconds
    pub packet_time: u32,

    pub ptp_domain: u8,
    pub ptp_gmid: Option<ClockId>,

    /// `a=mediaclk:direct=` offset in RTP clock ticks
    pub clock_offset: u32,
}

impl Default for StreamDescription {
    fn default() -> Self {
        Self {
            source_type: String::new(),
            source_name: String::new(),
            source_info: String::new(),
            origin: String::new(),
            stream_address: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 0,
            udp_port: 0,
            payload_type: 0,
            bit_depth: 0,
            sample_rate: 0,
            channel_count: 0,
            packet_time: 0,
            ptp_domain: 0,
            ptp_gmid: None,
            clock_offset: 0,
        }
    }
}

/// A live stream as stored in the inventory, keyed by the SAP message id hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub hash: u16,

    /// Originating source address from the SAP header, in text form
    pub source_address: String,

    /// Raw description text as announced
    pub sdp: String,

    pub description: StreamDescription,

    /// First time this stream was announced
    pub first_seen: DateTime<Utc>,

    /// Last accepted announcement
    pub last_seen: DateTime<Utc>,
}
