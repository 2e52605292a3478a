//! Keep-alive rolling-code generator.
//!
//! The keep-alive payload is five bytes, one per lane. Each lane cycles
//! through a fixed table; the tables are declared compactly as
//! `(repetitions, bytes)` and expanded at construction. Lane cursors start
//! below zero, and a negative cursor emits `0x00` while it climbs, so the
//! lanes enter their tables staggered.

/// Compact per-lane table definitions: each listed byte is emitted
/// `repetitions` times in a row before the lane moves to the next byte.
const LANE_DEFS: [(usize, &[u8]); 5] = [
    (1, &[0x30, 0x60, 0x03, 0x0C, 0x0A]),
    (5, &[0x0A, 0x13, 0x23, 0x45, 0x6D, 0x7C, 0xB4, 0xEF]),
    (5, &[0xF5, 0xEC, 0xDC, 0xBA, 0x92, 0x83, 0x4B, 0x10]),
    (5, &[0xB1, 0x69, 0xE8, 0xD9, 0x98, 0x20, 0x60, 0x88]),
    (5, &[0x4E, 0x96, 0x17, 0x26, 0x67, 0xDF, 0x9F, 0x77]),
];

/// Initial cursor of each lane.
const PRIMING: [i32; 5] = [-1, -3, -3, -2, -2];

/// Five staggered lane cursors over the expanded tables.
pub struct RollingCode {
    lanes: [Vec<u8>; 5],
    cursors: [i32; 5],
}

impl RollingCode {
    /// Expand the tables and prime the cursors.
    #[must_use]
    pub fn new() -> Self {
        let lanes = LANE_DEFS.map(|(repetitions, bytes)| {
            let mut lane = Vec::with_capacity(bytes.len() * repetitions);
            for &byte in bytes {
                lane.extend(std::iter::repeat(byte).take(repetitions));
            }
            lane
        });
        Self {
            lanes,
            cursors: PRIMING,
        }
    }

    /// Emit the next 5-byte keep-alive payload and advance every lane.
    pub fn next_payload(&mut self) -> [u8; 5] {
        let mut payload = [0u8; 5];
        for (idx, slot) in payload.iter_mut().enumerate() {
            let cursor = self.cursors[idx];
            if cursor < 0 {
                self.cursors[idx] = cursor + 1;
            } else {
                *slot = self.lanes[idx][cursor as usize];
                self.cursors[idx] = (cursor + 1) % self.lanes[idx].len() as i32;
            }
        }
        payload
    }

    /// Return every lane to its primed starting cursor.
    pub fn reset(&mut self) {
        self.cursors = PRIMING;
    }
}

impl Default for RollingCode {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expanded_lane_lengths() {
        let rc = RollingCode::new();
        let lengths: Vec<usize> = rc.lanes.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![5, 40, 40, 40, 40]);
    }

    #[test]
    fn lane_one_priming_sequence() {
        let mut rc = RollingCode::new();
        let first_eleven: Vec<u8> = (0..11).map(|_| rc.next_payload()[1]).collect();
        assert_eq!(
            first_eleven,
            vec![0, 0, 0, 0x0A, 0x0A, 0x0A, 0x0A, 0x0A, 0x13, 0x13, 0x13]
        );
    }

    #[test]
    fn lane_zero_enters_its_table_after_one_zero() {
        let mut rc = RollingCode::new();
        assert_eq!(rc.next_payload()[0], 0);
        assert_eq!(rc.next_payload()[0], 0x30);
        assert_eq!(rc.next_payload()[0], 0x60);
    }

    #[test]
    fn lanes_wrap_to_table_start() {
        let mut rc = RollingCode::new();
        // Lane 0: one priming zero, then a 5-entry table.
        let mut seen = Vec::new();
        for _ in 0..11 {
            seen.push(rc.next_payload()[0]);
        }
        assert_eq!(
            seen,
            vec![0, 0x30, 0x60, 0x03, 0x0C, 0x0A, 0x30, 0x60, 0x03, 0x0C, 0x0A]
        );
    }

    #[test]
    fn reset_restores_the_priming_sequence() {
        let mut rc = RollingCode::new();
        let fresh: Vec<[u8; 5]> = (0..8).map(|_| rc.next_payload()).collect();
        for _ in 0..37 {
            let _ = rc.next_payload();
        }
        rc.reset();
        let again: Vec<[u8; 5]> = (0..8).map(|_| rc.next_payload()).collect();
        assert_eq!(fresh, again);
    }
}
