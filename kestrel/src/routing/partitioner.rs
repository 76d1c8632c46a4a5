//! Murmur3 partitioner: computes the token of a routing key.
//!
//! The hash is the x64 128-bit Murmur3 variant that Cassandra uses, with its
//! quirk kept: tail bytes are sign-extended before mixing. Only the low
//! 64 bits of the result form the token.

use bytes::Buf;

use super::Token;

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

/// Partitioner that maps a routing key to a [`Token`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Partitioner;

impl Murmur3Partitioner {
    /// Hashes a serialized routing key.
    pub fn token(&self, routing_key: &[u8]) -> Token {
        Token::new(murmur3_low_64(routing_key) as i64)
    }
}

#[inline]
fn mix_k1(k1: u64) -> u64 {
    k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2)
}

#[inline]
fn mix_k2(k2: u64) -> u64 {
    k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1)
}

#[inline]
fn fmix(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^ (k >> 33)
}

fn murmur3_low_64(data: &[u8]) -> u64 {
    let mut h1: u64 = 0;
    let mut h2: u64 = 0;

    let mut blocks = data.chunks_exact(16);
    for mut block in &mut blocks {
        let k1 = block.get_u64_le();
        let k2 = block.get_u64_le();

        h1 ^= mix_k1(k1);
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        h2 ^= mix_k2(k2);
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for (i, &byte) in tail.iter().enumerate() {
        // Sign extension, as in Cassandra.
        let byte = byte as i8 as i64 as u64;
        if i < 8 {
            k1 ^= byte << (i * 8);
        } else {
            k2 ^= byte << ((i - 8) * 8);
        }
    }
    if tail.len() > 8 {
        h2 ^= mix_k2(k2);
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(k1);
    }

    let len = data.len() as u64;
    h1 ^= len;
    h2 ^= len;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix(h1);
    h2 = fmix(h2);

    h1.wrapping_add(h2)
}

/// Builds the routing key of a partition key made of several columns.
///
/// A single-column key is used as is; composite keys are encoded as
/// `[u16 length][bytes][0x00]` per component.
pub fn composite_routing_key<'a>(components: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let components: Vec<&[u8]> = components.into_iter().collect();
    if let [single] = components.as_slice() {
        return single.to_vec();
    }

    let mut key = Vec::new();
    for component in components {
        key.extend_from_slice(&(component.len() as u16).to_be_bytes());
        key.extend_from_slice(component);
        key.push(0);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::{composite_routing_key, Murmur3Partitioner};
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn murmur3_matches_cassandra_tokens() {
        setup_tracing();
        for (key, expected) in [
            ("test", -6017608668500074083),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("kremówki", 4354931215268080151),
        ] {
            assert_eq!(
                Murmur3Partitioner.token(key.as_bytes()).value(),
                expected,
                "key {key}"
            );
        }
    }

    #[test]
    fn long_keys_are_hashed_by_blocks() {
        setup_tracing();
        // Longer than one block, with a tail on both halves.
        let key = b"a key that spans two blocks!";
        let token = Murmur3Partitioner.token(key);
        assert_eq!(token, Murmur3Partitioner.token(key));
        assert_ne!(token, Murmur3Partitioner.token(&key[..key.len() - 1]));
    }

    #[test]
    fn composite_keys_are_length_prefixed() {
        assert_eq!(composite_routing_key([&b"abc"[..]]), b"abc".to_vec());
        assert_eq!(
            composite_routing_key([&b"ab"[..], &b"c"[..]]),
            vec![0, 2, b'a', b'b', 0, 0, 1, b'c', 0]
        );
    }
}
