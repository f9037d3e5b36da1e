//! Random numbers for `random` / `setrandom`.
//!
//! xoshiro128** seeded through splitmix32, so a fixed seed gives the same
//! sequence on every platform.

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Random {
    state: [u32; 4],
}

impl Random {
    /// Seeded generator, or clock-seeded for `None`.
    pub fn new(seed: Option<u32>) -> Self {
        let mut random = Random { state: [0; 4] };
        random.reseed(seed.unwrap_or_else(clock_seed));
        random
    }

    /// `setrandom`: 0 picks an unpredictable seed.
    pub fn reseed(&mut self, seed: u32) {
        let mut x = if seed == 0 { clock_seed() } else { seed };
        for word in &mut self.state {
            x = x.wrapping_add(0x9E37_79B9);
            let mut z = x;
            z = (z ^ (z >> 16)).wrapping_mul(0x85EB_CA6B);
            z = (z ^ (z >> 13)).wrapping_mul(0xC2B2_AE35);
            *word = z ^ (z >> 16);
        }
        if self.state == [0; 4] {
            self.state[0] = 1;
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        let s = &mut self.state;
        let result = s[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);
        let t = s[1] << 9;
        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];
        s[2] ^= t;
        s[3] = s[3].rotate_left(11);
        result
    }

    /// `random L1`: `[0, n)` for positive n, `(n, 0]` for negative n, any
    /// 32-bit value for zero.
    pub fn range(&mut self, n: u32) -> u32 {
        let signed = n as i32;
        match signed {
            0 => self.next_u32(),
            1..=i32::MAX => self.next_u32() % n,
            _ => {
                let bound = signed.unsigned_abs();
                (self.next_u32() % bound).wrapping_neg()
            }
        }
    }
}

fn clock_seed() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    ((nanos as u32) ^ ((nanos >> 32) as u32)) | 1
}

// =============================================================================
// Tests
// =============================================================================
