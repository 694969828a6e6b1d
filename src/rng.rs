//! Seeded generator for the per-task start argument.
//!
//! Not cryptographic. XorShift64 is plenty for picking small numbers and keeps
//! a run reproducible when the seed is pinned in the config.

#[derive(Clone, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        // zero is the one state xorshift never leaves
        let seed = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self { state: seed }
    }

    /// Seed from process identity: pid and a code address (ASLR).
    pub fn from_process() -> Self {
        let code = XorShift64::from_process as usize as u64;
        let pid = std::process::id() as u64;
        Self::new(0xCAFE_BABE ^ code ^ pid.rotate_left(32))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Value in `[0, bound)`; `bound == 0` yields 0.
    pub fn below(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        (self.next_u64() % bound as u64) as u32
    }
}
