// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives weight init, table permutation and the per-run seed table, so runs
// are reproducible from a run index alone.

use crate::error::{Result, SimError};

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    /// Restart the stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        *self = Prng::new(seed);
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Convert to [0,1).
        let x = self.next_u32();
        (x as f32) / (u32::MAX as f32 + 1.0)
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u32;
        let v = self.next_u32() % span;
        low + v as usize
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.gen_range_usize(0, i + 1);
            items.swap(i, j);
        }
    }
}

/// Fixed table of per-run random seeds.
///
/// Seed `i` depends only on the base seed and `i`, so a run can be replayed in
/// isolation (or replicated on another process) from its index. The table is
/// capped; asking for an index past the cap is an error rather than a wrap.
#[derive(Debug, Clone)]
pub struct Seeds {
    seeds: Vec<u64>,
}

impl Seeds {
    pub const DEFAULT_BASE: u64 = 0x5EED_0F_C0FFEE;

    pub fn new(cap: usize, base: u64) -> Self {
        let mut rng = Prng::new(base);
        let seeds = (0..cap).map(|_| rng.next_u64() | 1).collect();
        Self { seeds }
    }

    pub fn cap(&self) -> usize {
        self.seeds.len()
    }

    pub fn get(&self, index: usize) -> Result<u64> {
        self.seeds
            .get(index)
            .copied()
            .ok_or(SimError::SeedExhausted {
                index,
                cap: self.seeds.len(),
            })
    }

    /// Reseed `rng` with the seed for run `index`.
    pub fn set(&self, index: usize, rng: &mut Prng) -> Result<u64> {
        let seed = self.get(index)?;
        rng.reseed(seed);
        Ok(seed)
    }
}
