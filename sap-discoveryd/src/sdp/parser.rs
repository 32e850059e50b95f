use std::collections::HashMap;
use std::net::Ipv4Addr;
use shared::types::StreamDescription;
use thiserror::Error;
use super::attributes::{self, number, payload_number};

/// Why a description was rejected. Line numbers are 1-based.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdpError {
    #[error("line {line}: not a key=value line: {text:?}")]
    Malformed { line: usize, text: String },
    #[error("line {line}: unsupported SDP version {value:?}")]
    Version { line: usize, value: String },
    #[error("line {line}: invalid connection {value:?}")]
    Connection { line: usize, value: String },
    #[error("line {line}: session is not permanent (t={value})")]
    NotPermanent { line: usize, value: String },
    #[error("line {line}: invalid media section {value:?}")]
    Media { line: usize, value: String },
    #[error("line {line}: more than one media section")]
    MultipleMedia { line: usize },
    #[error("line {line}: invalid a={name} attribute {value:?}")]
    Attribute {
        line: usize,
        name: &'static str,
        value: String,
    },
    #[error("line {line}: rtpmap payload {rtpmap} does not match media payload {media}")]
    PayloadMismatch { line: usize, rtpmap: u8, media: u8 },
    #[error("missing mandatory {0}= line")]
    Missing(char),
    #[error("stream is not announced as recvonly")]
    Direction,
}

/// `a=` value and the line it came from
struct Attribute<'a> {
    line: usize,
    value: &'a str,
}

/// Parse an announced session description into stream parameters.
///
/// All-or-nothing: the first invalid line rejects the whole description.
pub fn parse(text: &str) -> Result<StreamDescription, SdpError> {
    let mut description = StreamDescription::default();
    let mut attributes: HashMap<&str, Attribute<'_>> = HashMap::new();
    let mut seen_version = false;
    let mut seen_connection = false;
    let mut seen_timing = false;
    let mut media_payload: Option<u8> = None;

    let lines = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .enumerate()
        .map(|(i, l)| (i + 1, l))
        .filter(|(_, l)| !l.is_empty());

    for (line, text) in lines {
        let (key, value) = split_line(line, text)?;

        match key {
            'v' => {
                if value != "0" {
                    return Err(SdpError::Version { line, value: value.to_string() });
                }
                seen_version = true;
            }
            'o' => description.origin = value.to_string(),
            's' => description.source_name = value.to_string(),
            'i' => description.source_info = value.to_string(),
            'c' => {
                let (address, ttl) = parse_connection(value)
                    .ok_or_else(|| SdpError::Connection { line, value: value.to_string() })?;
                description.stream_address = address;
                description.multicast_ttl = ttl;
                seen_connection = true;
            }
            't' => {
                if value != "0 0" {
                    return Err(SdpError::NotPermanent { line, value: value.to_string() });
                }
                seen_timing = true;
            }
            'm' => {
                if media_payload.is_some() {
                    return Err(SdpError::MultipleMedia { line });
                }
                let (port, payload) = parse_media(value)
                    .ok_or_else(|| SdpError::Media { line, value: value.to_string() })?;
                description.udp_port = port;
                description.payload_type = payload;
                media_payload = Some(payload);
            }
            'a' => {
                let (name, value) = value.split_once(':').unwrap_or((value, ""));
                if name.is_empty() {
                    return Err(SdpError::Malformed { line, text: text.to_string() });
                }
                attributes.insert(name, Attribute { line, value });
            }
            // u, e, p, b, z, k, r and anything newer carry nothing we store
            _ => {}
        }
    }

    if !seen_version {
        return Err(SdpError::Missing('v'));
    }
    if !seen_connection {
        return Err(SdpError::Missing('c'));
    }
    if !seen_timing {
        return Err(SdpError::Missing('t'));
    }
    let media_payload = media_payload.ok_or(SdpError::Missing('m'))?;

    if !attributes.contains_key("recvonly")
        || attributes.contains_key("sendrecv")
        || attributes.contains_key("sendonly")
    {
        return Err(SdpError::Direction);
    }

    apply_attributes(&mut description, &attributes, media_payload)?;

    Ok(description)
}

fn apply_attributes(
    description: &mut StreamDescription,
    attrs: &HashMap<&str, Attribute<'_>>,
    media_payload: u8,
) -> Result<(), SdpError> {
    let invalid = |name: &'static str, attr: &Attribute<'_>| SdpError::Attribute {
        line: attr.line,
        name,
        value: attr.value.to_string(),
    };

    if let Some(attr) = attrs.get("rtpmap") {
        let map = attributes::parse_rtpmap(attr.value).ok_or_else(|| invalid("rtpmap", attr))?;
        if map.payload_type != media_payload {
            return Err(SdpError::PayloadMismatch {
                line: attr.line,
                rtpmap: map.payload_type,
                media: media_payload,
            });
        }
        description.bit_depth = map.bit_depth;
        description.sample_rate = map.sample_rate;
        description.channel_count = map.channels;
    }

    // Clocking attributes are informational; a variant we cannot read
    // leaves the default in place
    if let Some(attr) = attrs.get("ts-refclk") {
        match attributes::parse_ts_refclk(attr.value) {
            Some(clock) => {
                description.ptp_gmid = clock.gmid;
                description.ptp_domain = clock.domain;
            }
            None => ignore_attribute("ts-refclk", attr),
        }
    }

    if let Some(attr) = attrs.get("mediaclk") {
        match attributes::parse_mediaclk(attr.value) {
            Some(offset) => description.clock_offset = offset,
            None => ignore_attribute("mediaclk", attr),
        }
    }

    if let Some(attr) = attrs.get("ptime") {
        match attributes::parse_ptime(attr.value) {
            Some(ptime) => description.packet_time = ptime,
            None => ignore_attribute("ptime", attr),
        }
    }

    if let Some(attr) = attrs.get("keywds") {
        description.source_type = attr.value.to_string();
    }

    Ok(())
}

fn ignore_attribute(name: &str, attr: &Attribute<'_>) {
    tracing::info!("line {}: ignoring unsupported a={}:{}", attr.line, name, attr.value);
}

fn split_line(line: usize, text: &str) -> Result<(char, &str), SdpError> {
    let malformed = || SdpError::Malformed { line, text: text.to_string() };

    let (key, value) = text.split_once('=').ok_or_else(malformed)?;
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok((c, value)),
        _ => Err(malformed()),
    }
}

/// `IN IP4 <address>/<ttl>`
fn parse_connection(value: &str) -> Option<(Ipv4Addr, u8)> {
    let mut tokens = value.split(' ');
    let (net, addr_type, address) = (tokens.next()?, tokens.next()?, tokens.next()?);
    if tokens.next().is_some() || !net.eq_ignore_ascii_case("IN") || !addr_type.eq_ignore_ascii_case("IP4") {
        return None;
    }

    let (address, ttl) = address.split_once('/')?;
    Some((address.parse().ok()?, number(ttl)?))
}

/// `audio <port> RTP/AVP <payload>`
fn parse_media(value: &str) -> Option<(u16, u8)> {
    let mut tokens = value.split(' ');
    let (media, port, proto, payload) = (tokens.next()?, tokens.next()?, tokens.next()?, tokens.next()?);
    if tokens.next().is_some() || !media.eq_ignore_ascii_case("audio") || !proto.eq_ignore_ascii_case("RTP/AVP") {
        return None;
    }

    Some((number(port)?, payload_number(payload)?))
}
