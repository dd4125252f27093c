//! Telemetry records and the packet sequencer.
//!
//! Every packet carries a sequence id, a timestamp, and one output of a
//! xoshiro128++ generator whose state is rebound to the backend during the
//! session handshake. The backend advances its own copy of the generator, so
//! dropped or reordered packets are detectable without acknowledgements.
//!
//! JSON field names are the short aliases the backend expects; see the
//! payload structs.

use serde::Serialize;

use crate::timebase;

/// The PRNG state every device boots with, before a session handshake has
/// supplied a real initialization vector.
pub const INITIAL_PRNG_STATE: [u32; 4] = [0xDEAD_BEEF, 0xCAFE_BABE, 0xDEAD_C0DE, 0x8BAD_F00D];

/// Driving essentials: what the pit wall watches live.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EssentialsPacket {
    #[serde(rename = "spd")]
    pub speed: f32,
    #[serde(rename = "temps")]
    pub battery_temps: [f32; 5],
    #[serde(rename = "v")]
    pub voltage: f32,
    #[serde(rename = "wh")]
    pub remaining_wh: f32,
}

/// Firmware health counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticPacket {
    #[serde(rename = "free")]
    pub free_heap: u32,
    #[serde(rename = "alloc")]
    pub allocations: u32,
    #[serde(rename = "frees")]
    pub deallocations: u32,
    #[serde(rename = "perf")]
    pub performance: [u32; 3],
}

/// The periodic record: essentials, position, and health in one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullPacket {
    #[serde(rename = "spd")]
    pub speed: f32,
    #[serde(rename = "temps")]
    pub battery_temps: [f32; 5],
    #[serde(rename = "v")]
    pub voltage: f32,
    #[serde(rename = "wh")]
    pub remaining_wh: f32,
    #[serde(rename = "lon")]
    pub longitude: f32,
    #[serde(rename = "lat")]
    pub latitude: f32,
    #[serde(rename = "free")]
    pub free_heap: u32,
    #[serde(rename = "alloc")]
    pub allocations: u32,
    #[serde(rename = "frees")]
    pub deallocations: u32,
    #[serde(rename = "perf")]
    pub performance: [u32; 3],
}

/// Tagged payload union.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Essentials(EssentialsPacket),
    Diagnostic(DiagnosticPacket),
    Full(FullPacket),
}

/// A sequenced telemetry record, ready for signing and upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    #[serde(rename = "seq")]
    pub sequence_id: u32,
    #[serde(rename = "ts")]
    pub timestamp: i32,
    #[serde(rename = "rng")]
    pub rng_state: u32,
    #[serde(rename = "data")]
    pub data: Payload,
}

/// Stamps, numbers and chains packets. Not thread-safe by itself; the forger
/// wraps it in a mutex.
pub struct PacketSequencer {
    next_seq_id: u32,
    prng_state: [u32; 4],
}

impl Default for PacketSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSequencer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seq_id: 0,
            prng_state: INITIAL_PRNG_STATE,
        }
    }

    /// Number, stamp and chain a payload into a [`Packet`].
    pub fn sequence(&mut self, data: Payload) -> Packet {
        let sequence_id = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);

        #[allow(clippy::cast_possible_truncation)]
        let timestamp = timebase::now() as i32;

        Packet {
            sequence_id,
            timestamp,
            rng_state: xoshiro_next(&mut self.prng_state),
            data,
        }
    }

    /// Rebind to a freshly authenticated session: sequence ids restart at
    /// zero and the generator takes the backend-issued vector.
    pub fn reset(&mut self, iv: [u32; 4]) {
        self.next_seq_id = 0;
        self.prng_state = iv;
    }

    /// Current `(next_seq_id, prng_state)` pair.
    #[must_use]
    pub fn state(&self) -> (u32, [u32; 4]) {
        (self.next_seq_id, self.prng_state)
    }
}

/// One step of xoshiro128++ with rotation constants (7, 9, 11).
pub fn xoshiro_next(s: &mut [u32; 4]) -> u32 {
    let result = s[0].wrapping_add(s[3]).rotate_left(7).wrapping_add(s[0]);

    let t = s[1] << 9;

    s[2] ^= s[0];
    s[3] ^= s[1];
    s[1] ^= s[2];
    s[0] ^= s[3];

    s[2] ^= t;

    s[3] = s[3].rotate_left(11);

    result
}
