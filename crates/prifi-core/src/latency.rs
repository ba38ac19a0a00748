//! Latency probe format.
//!
//! ```text
//! [marker 0xAAAA: u16][client id: u16][send time ms: u64]   (big-endian)
//! ```
//!
//! A client with latency tests enabled fills idle owned slots with a probe.
//! The relay recognizes it, echoes it downstream, and the originating client
//! measures the round trip.
//!
//! A cell is a probe only if it is exactly this layout followed by nothing
//! but zero padding. Application data that merely starts with the marker is
//! ordinary data.

/// Marker in the first two bytes of a probe cell.
pub const LATENCY_MARKER: u16 = 0xAAAA;

pub use prifi_proto::params::LATENCY_PROBE_LEN;

/// Build a probe.
pub fn encode_probe(client_id: u16, sent_at_ms: u64) -> [u8; LATENCY_PROBE_LEN] {
    let mut probe = [0u8; LATENCY_PROBE_LEN];
    probe[0..2].copy_from_slice(&LATENCY_MARKER.to_be_bytes());
    probe[2..4].copy_from_slice(&client_id.to_be_bytes());
    probe[4..12].copy_from_slice(&sent_at_ms.to_be_bytes());
    probe
}

/// Whether a cell is a probe, possibly zero-padded to the cell size.
pub fn is_probe(cell: &[u8]) -> bool {
    cell.len() >= LATENCY_PROBE_LEN
        && u16::from_be_bytes([cell[0], cell[1]]) == LATENCY_MARKER
        && cell[LATENCY_PROBE_LEN..].iter().all(|&b| b == 0)
}

/// Parse `(client id, send time)` from a probe.
pub fn parse_probe(cell: &[u8]) -> Option<(u16, u64)> {
    if !is_probe(cell) {
        return None;
    }
    let client_id = u16::from_be_bytes([cell[2], cell[3]]);
    let mut time = [0u8; 8];
    time.copy_from_slice(&cell[4..12]);
    Some((client_id, u64::from_be_bytes(time)))
}
