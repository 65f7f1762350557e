/// 64 bit Mersenne Twister (MT19937-64), the generator the client uses to expand a key seed.
///
/// All arithmetic is modulo 2^64 with explicit wrapping.
pub struct Mt19937_64 {
    state: [u64; Self::NN],
    index: usize,
}

impl Mt19937_64 {
    const NN: usize = 312;
    const MM: usize = 156;
    const MATRIX_A: u64 = 0xB502_6F5A_A966_19E9;
    const UPPER_MASK: u64 = 0xFFFF_FFFF_8000_0000;
    const LOWER_MASK: u64 = 0x7FFF_FFFF;

    /// the seed used by the reference implementation when the generator is used without seeding
    pub const DEFAULT_SEED: u64 = 5489;

    pub fn new(seed: u64) -> Mt19937_64 {
        let mut state = [0u64; Self::NN];
        state[0] = seed;
        for i in 1..Self::NN {
            let prev = state[i - 1];
            state[i] = 6364136223846793005u64
                .wrapping_mul(prev ^ (prev >> 62))
                .wrapping_add(i as u64);
        }

        Mt19937_64 {
            state,
            index: Self::NN,
        }
    }

    fn twist(&mut self) {
        for k in 0..Self::NN {
            let y = (self.state[k] & Self::UPPER_MASK) | (self.state[(k + 1) % Self::NN] & Self::LOWER_MASK);
            let mag = if y & 1 == 0 { 0 } else { Self::MATRIX_A };
            self.state[k] = self.state[(k + Self::MM) % Self::NN] ^ (y >> 1) ^ mag;
        }
        self.index = 0;
    }

    pub fn next_u64(&mut self) -> u64 {
        if self.index >= Self::NN {
            self.twist();
        }

        let mut x = self.state[self.index];
        self.index += 1;

        x ^= (x >> 29) & 0x5555_5555_5555_5555;
        x ^= (x << 17) & 0x71D6_7FFF_EDA6_0000;
        x ^= (x << 37) & 0xFFF7_EEE0_0000_0000;
        x ^= x >> 43;
        x
    }
}

impl Default for Mt19937_64 {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SEED)
    }
}
