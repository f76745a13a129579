const MOD_ADLER: u64 = 65521;

/// Adler-32 checksum over a fixed-size window that can slide one byte at a
/// time in O(1).
#[derive(Debug, Clone, Copy)]
pub struct RollingHash {
    a: u64,
    b: u64,
    window: u64,
}

impl RollingHash {
    /// Checksum of `block`; the window size is `block.len()` from here on.
    pub fn over(block: &[u8]) -> Self {
        // Sums stay far below u64::MAX for any block we use, so reduce once.
        let (a, b) = block.iter().fold((1u64, 0u64), |(a, b), &byte| {
            let a = a + byte as u64;
            (a, b + a)
        });
        Self {
            a: a % MOD_ADLER,
            b: b % MOD_ADLER,
            window: block.len() as u64,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u64;
        let inc = incoming as u64;
        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        self.b = (self.b + self.a + 2 * MOD_ADLER - 1 - (self.window * out) % MOD_ADLER) % MOD_ADLER;
    }

    pub fn digest(&self) -> u32 {
        ((self.b as u32) << 16) | self.a as u32
    }
}
