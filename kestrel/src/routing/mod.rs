//! Routing requests to the nodes that own their data.
//!
//! This includes:
//! - token representation,
//! - the Murmur3 partitioner, which computes a token from a routing key,
//! - the token ring and replica location for the supported replication strategies.

pub mod locator;
pub mod partitioner;

/// Token is a result of computing a hash of a partition key.
///
/// It is basically an i64 with one caveat: i64::MIN is not
/// a valid token. It is used to represent infinity.
/// For this reason tokens are normalized: i64::MIN
/// is replaced with i64::MAX.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    /// Creates a new token with given value, normalizing the value if necessary
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    /// The raw value of the token.
    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::Token;

    #[test]
    fn min_value_is_normalized() {
        assert_eq!(Token::new(i64::MIN).value(), i64::MAX);
        assert_eq!(Token::new(-5).value(), -5);
        assert!(Token::new(-5) < Token::new(7));
    }
}
