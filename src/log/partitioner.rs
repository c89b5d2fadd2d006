/// Kafka's murmur2 variant, so keys map to the same partition numbers a Kafka
/// default partitioner would pick.
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h: u32 = SEED ^ (length as u32);

    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

/// Partition for a record key. `partitions` must be non-zero.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let positive = (murmur2(key.as_bytes()) & 0x7fff_ffff) as u32;
    positive % partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_same_key_same_partition() {
        for key in ["c1", "customer-42", "", "ünïcödé"] {
            let first = partition_for_key(key, 12);
            for _ in 0..10 {
                assert_eq!(partition_for_key(key, 12), first);
            }
            assert!(first < 12);
        }
    }

    #[test]
    fn test_keys_spread_across_partitions() {
        let used: HashSet<u32> = (0..500)
            .map(|i| partition_for_key(&format!("customer-{}", i), 6))
            .collect();
        assert_eq!(used.len(), 6);
    }

    #[test]
    fn test_tail_lengths_hash_differently() {
        let hashes: HashSet<i32> = ["a", "ab", "abc", "abcd", "abcde"]
            .iter()
            .map(|k| murmur2(k.as_bytes()))
            .collect();
        assert_eq!(hashes.len(), 5);
    }
}
