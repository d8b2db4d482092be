use std::hash::Hasher;

use crate::pool::Recycle;

const FNV_OFFSET_BASIS_32: u32 = 0x811c_9dc5;
const FNV_PRIME_32: u32 = 0x0100_0193;

/// FNV-1a (32 bit) state used to route a hostname to its signing worker.
///
/// Not a cryptographic hash; only determinism and spread matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHasher {
    state: u32,
}

impl Default for ShardHasher {
    fn default() -> Self {
        Self {
            state: FNV_OFFSET_BASIS_32,
        }
    }
}

impl ShardHasher {
    pub fn reset(&mut self) {
        self.state = FNV_OFFSET_BASIS_32;
    }

    pub fn sum32(&self) -> u32 {
        self.state
    }

    pub fn shard_of(&mut self, key: &str, shards: usize) -> usize {
        self.reset();
        self.write(key.as_bytes());
        self.sum32() as usize % shards.max(1)
    }
}

impl Hasher for ShardHasher {
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= u32::from(*byte);
            self.state = self.state.wrapping_mul(FNV_PRIME_32);
        }
    }

    fn finish(&self) -> u64 {
        u64::from(self.state)
    }
}

impl Recycle for ShardHasher {
    fn recycle(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use std::hash::Hasher;

    use super::ShardHasher;

    #[test]
    fn matches_fnv1a_reference_vectors() {
        let cases: [(&str, u32); 3] = [
            ("", 0x811c_9dc5),
            ("a", 0xe40c_292c),
            ("foobar", 0xbf9c_f968),
        ];
        for (input, expected) in cases {
            let mut hasher = ShardHasher::default();
            hasher.write(input.as_bytes());
            assert_eq!(hasher.sum32(), expected, "fnv1a({input:?})");
        }
    }

    #[test]
    fn shard_of_resets_state_between_keys() {
        let mut reused = ShardHasher::default();
        let first = reused.shard_of("api.example.com", 8);
        let _ = reused.shard_of("other.example.com", 8);
        let again = reused.shard_of("api.example.com", 8);
        assert_eq!(first, again);

        let mut fresh = ShardHasher::default();
        assert_eq!(fresh.shard_of("api.example.com", 8), first);
    }

    #[test]
    fn single_shard_always_maps_to_zero() {
        let mut hasher = ShardHasher::default();
        assert_eq!(hasher.shard_of("api.example.com", 1), 0);
        assert_eq!(hasher.shard_of("cdn.example.net", 1), 0);
    }
}
