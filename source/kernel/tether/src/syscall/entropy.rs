// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `getrandom` source: a SplitMix64 stream salted with the boot seed and
//! stirred with the counter and caller addresses on every call.
//!
//! Not cryptographic. Every call advances the stream, so two consecutive
//! requests never return the same bytes.

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

#[inline]
const fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[derive(Debug)]
pub struct Entropy {
    state: u64,
    calls: u64,
    /// Whether the random device descriptor is handed out.
    device_open: bool,
}

impl Entropy {
    pub const fn new() -> Self {
        Self { state: 0, calls: 0, device_open: false }
    }

    /// Claims the single device descriptor; false if it is already taken.
    pub fn open_device(&mut self) -> bool {
        !core::mem::replace(&mut self.device_open, true)
    }

    /// Releases the device descriptor; false if it was not open.
    pub fn close_device(&mut self) -> bool {
        core::mem::replace(&mut self.device_open, false)
    }

    pub fn device_open(&self) -> bool {
        self.device_open
    }

    /// Fills `out` and returns its length.
    ///
    /// `counter` and `stack_hint` are folded in once per call; the stream
    /// position alone already makes consecutive calls distinct.
    pub fn fill(&mut self, out: &mut [u8], counter: u64, stack_hint: usize) -> usize {
        if self.calls == 0 {
            self.state = mix(crate::determinism::seed() ^ counter);
        }
        self.calls += 1;
        let stir = mix(counter ^ (out.as_ptr() as u64).rotate_left(17) ^ (stack_hint as u64).rotate_left(41))
            ^ self.calls;
        for chunk in out.chunks_mut(8) {
            self.state = self.state.wrapping_add(GOLDEN_GAMMA);
            let word = mix(self.state) ^ (stir & 0xffff_0000_0000_0000);
            chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
        }
        out.len()
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for Entropy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_calls_differ_even_with_a_frozen_counter() {
        let mut entropy = Entropy::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        entropy.fill(&mut a, 42, 0x4086_0000);
        entropy.fill(&mut b, 42, 0x4086_0000);
        assert_ne!(a, b);
        assert_eq!(entropy.calls(), 2);
    }

    #[test]
    fn fills_odd_lengths_completely() {
        let mut entropy = Entropy::new();
        let mut buf = [0u8; 13];
        assert_eq!(entropy.fill(&mut buf, 7, 0), 13);
        assert!(buf.iter().any(|&b| b != 0));
        assert_eq!(entropy.fill(&mut [], 7, 0), 0);
    }
}
