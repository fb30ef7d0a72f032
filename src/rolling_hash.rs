/// Adler32-style rolling hash shared by the block index and the new-content scanner.
///
/// Two sums modulo 65521 packed into 32 bits. Sliding the window one byte is O(1), so a
/// scanner moving `stride` bytes pays `stride` updates instead of rehashing a whole block.
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone, Copy)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window_size: u32,
}

impl RollingHash {
    /// Hash a full window.
    pub fn of(window: &[u8]) -> Self {
        // Accumulate in u64 so the modular reduction happens once at the end.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in window {
            a += byte as u64;
            b += a;
        }
        Self {
            a: (a % MOD_ADLER as u64) as u32,
            b: (b % MOD_ADLER as u64) as u32,
            window_size: (window.len() as u64 % MOD_ADLER as u64) as u32,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let old = outgoing as u32;
        let new = incoming as u32;

        self.a = (self.a + MOD_ADLER - old + new) % MOD_ADLER;
        let weighted = (old * self.window_size) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a + MOD_ADLER - weighted) % MOD_ADLER;
    }

    /// Move the window over `data[start..]` forward by `by` bytes.
    /// The caller guarantees `start + by + window <= data.len()`.
    pub fn slide(&mut self, data: &[u8], start: usize, by: usize, window: usize) {
        for i in start..start + by {
            self.roll(data[i], data[i + window]);
        }
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

pub fn block_hash(block: &[u8]) -> u32 {
    RollingHash::of(block).digest()
}
