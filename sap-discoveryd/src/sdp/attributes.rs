//! Sub-grammars for the `a=` attributes an AES67 sender announces.

use std::str::FromStr;
use shared::types::ClockId;

/// Sample rates accepted in `a=rtpmap`
pub const STANDARD_SAMPLE_RATES: [u32; 7] = [32000, 44100, 48000, 88200, 96000, 176400, 192000];

const PTP_CLOCK_PREFIX: &str = "ptp=";
const PTP_PROFILES: [&str; 3] = ["IEEE1588-2002", "IEEE1588-2008", "IEEE1588-2019"];
const TRACEABLE: &str = "traceable";
const DIRECT_CLOCK_PREFIX: &str = "direct=";

/// `a=rtpmap:<payload> L<bitdepth>/<samplerate>/<channels>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub bit_depth: u8,
    pub sample_rate: u32,
    pub channels: u16,
}

/// `a=ts-refclk:ptp=IEEE1588-20xx:<gmid>[:<domain>]` or `...:traceable`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefClock {
    /// None for a traceable clock
    pub gmid: Option<ClockId>,
    pub domain: u8,
}

pub fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    let (payload, encoding) = value.split_once(' ')?;
    let payload_type = payload_number(payload)?;

    let encoding = encoding
        .strip_prefix('L')
        .or_else(|| encoding.strip_prefix('l'))?;
    let mut parts = encoding.split('/');
    let bit_depth: u8 = number(parts.next()?)?;
    let sample_rate: u32 = number(parts.next()?)?;
    let channels: u16 = number(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }

    if !matches!(bit_depth, 16 | 24) {
        return None;
    }
    if !STANDARD_SAMPLE_RATES.contains(&sample_rate) {
        return None;
    }
    if channels == 0 {
        return None;
    }

    Some(RtpMap {
        payload_type,
        bit_depth,
        sample_rate,
        channels,
    })
}

pub fn parse_ts_refclk(value: &str) -> Option<RefClock> {
    let rest = strip_prefix_ignore_case(value, PTP_CLOCK_PREFIX)?;
    let (profile, clock) = rest.split_once(':')?;
    if !PTP_PROFILES.iter().any(|p| p.eq_ignore_ascii_case(profile)) {
        return None;
    }

    if clock.eq_ignore_ascii_case(TRACEABLE) {
        return Some(RefClock { gmid: None, domain: 0 });
    }

    // The gmid may itself be colon-separated; the domain, when present,
    // is a ninth field
    if let Ok(gmid) = clock.parse::<ClockId>() {
        return Some(RefClock { gmid: Some(gmid), domain: 0 });
    }
    let (gmid, domain) = clock.rsplit_once(':')?;
    Some(RefClock {
        gmid: Some(gmid.parse().ok()?),
        domain: number(domain)?,
    })
}

/// `a=mediaclk:direct=<offset>[ rate=<n>/<d>]`; the offset is a 32-bit RTP
/// timestamp.
pub fn parse_mediaclk(value: &str) -> Option<u32> {
    let rest = strip_prefix_ignore_case(value, DIRECT_CLOCK_PREFIX)?;
    let offset = rest.split(' ').next()?;
    number(offset)
}

/// `a=ptime:<milliseconds>`, fractions truncated
pub fn parse_ptime(value: &str) -> Option<u32> {
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if whole.is_empty() {
        return if frac.is_empty() { None } else { Some(0) };
    }
    number(whole)
}

/// RTP payload type, 0..=127
pub fn payload_number(s: &str) -> Option<u8> {
    number::<u8>(s).filter(|pt| *pt <= 127)
}

/// Unsigned decimal without sign or whitespace
pub fn number<T: FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtpmap() {
        assert_eq!(
            parse_rtpmap("97 L24/48000/2"),
            Some(RtpMap { payload_type: 97, bit_depth: 24, sample_rate: 48000, channels: 2 })
        );
        assert_eq!(parse_rtpmap("96 L16/44100/8").map(|m| m.channels), Some(8));
    }

    #[test]
    fn test_rtpmap_rejects_unsupported_formats() {
        assert!(parse_rtpmap("97 L8/48000/2").is_none());
        assert!(parse_rtpmap("97 L32/48000/2").is_none());
        assert!(parse_rtpmap("97 L24/22050/2").is_none());
        assert!(parse_rtpmap("97 L24/48000").is_none());
        assert!(parse_rtpmap("97 L24/48000/2/1").is_none());
        assert!(parse_rtpmap("97 L24/48000/0").is_none());
        assert!(parse_rtpmap("97 AM824/48000/2").is_none());
        assert!(parse_rtpmap("200 L24/48000/2").is_none());
        assert!(parse_rtpmap("97L24/48000/2").is_none());
    }

    #[test]
    fn test_ts_refclk() {
        let clock = parse_ts_refclk("ptp=IEEE1588-2008:00-1D-C1-FF-FE-0D-A9-88:0").unwrap();
        assert_eq!(clock.gmid.unwrap().to_string(), "00-1D-C1-FF-FE-0D-A9-88");
        assert_eq!(clock.domain, 0);

        let clock = parse_ts_refclk("ptp=IEEE1588-2008:00:1D:C1:FF:FE:0D:A9:88:127").unwrap();
        assert_eq!(clock.gmid.unwrap().0[7], 0x88);
        assert_eq!(clock.domain, 127);
    }

    #[test]
    fn test_ts_refclk_profiles_and_traceable() {
        let clock = parse_ts_refclk("ptp=IEEE1588-2019:00-1D-C1-FF-FE-0D-A9-88:5").unwrap();
        assert_eq!(clock.domain, 5);
        assert!(clock.gmid.is_some());

        let clock = parse_ts_refclk("ptp=IEEE1588-2008:traceable").unwrap();
        assert_eq!(clock, RefClock { gmid: None, domain: 0 });

        // Domain omitted
        let clock = parse_ts_refclk("ptp=IEEE1588-2002:00-1D-C1-FF-FE-0D-A9-88").unwrap();
        assert_eq!(clock.domain, 0);
        assert!(clock.gmid.is_some());
    }

    #[test]
    fn test_ts_refclk_rejections() {
        assert!(parse_ts_refclk("ptp=IEEE802.1AS-2011:00-1D-C1-FF-FE-0D-A9-88").is_none());
        assert!(parse_ts_refclk("ntp=pool.ntp.org").is_none());
        assert!(parse_ts_refclk("ptp=IEEE1588-2008:00-1D-C1-FF-FE-0D-A9-88:x").is_none());
        assert!(parse_ts_refclk("ptp=IEEE1588-2008:00-1D-C1").is_none());
    }

    #[test]
    fn test_mediaclk() {
        assert_eq!(parse_mediaclk("direct=1057709823"), Some(1_057_709_823));
        assert_eq!(parse_mediaclk("direct=0"), Some(0));
        assert_eq!(parse_mediaclk("direct=0 rate=48000/1"), Some(0));
        assert!(parse_mediaclk("direct=-5").is_none());
        assert!(parse_mediaclk("direct=4294967296").is_none());
        assert!(parse_mediaclk("sender").is_none());
    }

    #[test]
    fn test_ptime() {
        assert_eq!(parse_ptime("1"), Some(1));
        assert_eq!(parse_ptime("1.000"), Some(1));
        assert_eq!(parse_ptime("0.250"), Some(0));
        assert_eq!(parse_ptime("4."), Some(4));
        assert_eq!(parse_ptime(".125"), Some(0));
        assert!(parse_ptime("+1").is_none());
        assert!(parse_ptime(".").is_none());
        assert!(parse_ptime("1.2.3").is_none());
        assert!(parse_ptime("").is_none());
    }
}
