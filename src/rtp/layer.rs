use std::str::FromStr;

use crate::config::RID;

/// A track carries at most this many simulcast layers.
pub const MAX_SIMULCAST_LAYERS: usize = 3;

/// Layer slot a published track occupies, derived from its RID.
/// Tracks without a known RID sit in the lowest slot.
pub fn spatial_layer(rid: &str) -> usize {
    RID::from_str(rid).map(usize::from).unwrap_or(0)
}
