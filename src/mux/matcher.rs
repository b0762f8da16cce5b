//! Predicates demultiplexing packets that share one port, per RFC 7983.
//!
//! ```text
//!              +----------------+
//!              | [0..3] -+--> forward to STUN
//!              |         |
//!              | [16..19] -+--> forward to ZRTP
//!              |         |
//!  packet -->  | [20..63] -+--> forward to DTLS
//!              |         |
//!              | [64..79] -+--> forward to TURN Channel
//!              |         |
//!              | [128..191] -+--> forward to RTP/RTCP
//!              +----------------+
//! ```

use std::sync::Arc;

pub type MatchFn = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Matches packets whose first byte lies in `lower..=upper`.
pub fn match_range(lower: u8, upper: u8) -> MatchFn {
    Arc::new(move |buf: &[u8]| match buf.first() {
        Some(b) => *b >= lower && *b <= upper,
        None => false,
    })
}

pub fn match_all() -> MatchFn {
    Arc::new(|_: &[u8]| true)
}

pub fn match_stun() -> MatchFn {
    match_range(0, 3)
}

pub fn match_zrtp() -> MatchFn {
    match_range(16, 19)
}

pub fn match_dtls() -> MatchFn {
    match_range(20, 63)
}

pub fn match_turn() -> MatchFn {
    match_range(64, 79)
}

pub fn match_srtp_or_srtcp() -> MatchFn {
    match_range(128, 191)
}

pub fn match_srtp() -> MatchFn {
    Arc::new(|buf: &[u8]| is_rtp_or_rtcp(buf) && !is_rtcp(buf))
}

pub fn match_srtcp() -> MatchFn {
    Arc::new(|buf: &[u8]| is_rtp_or_rtcp(buf) && is_rtcp(buf))
}

/// Version 2 RTP and RTCP share a first byte of 128..=191.
pub fn is_rtp_or_rtcp(buf: &[u8]) -> bool {
    matches!(buf.first(), Some(b) if (128..=191).contains(b))
}

/// RTCP packet types live in 192..=223 (RFC 5761), RTP payload types never do.
pub fn is_rtcp(buf: &[u8]) -> bool {
    matches!(buf.get(1), Some(b) if (192..=223).contains(b))
}
