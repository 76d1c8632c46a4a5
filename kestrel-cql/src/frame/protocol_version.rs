//! Native protocol versions and the order in which they are negotiated.

use std::fmt;

const EXTENSION_FLAG: u8 = 0x40;
const VERSION_MASK: u8 = 0x7F;

/// A version of the native protocol, as carried in the first byte of every frame header.
///
/// Versions are totally ordered by their raw value, which puts every
/// extension-flavoured version (`DSE_V1`, `DSE_V2`) above every standard one
/// and the [`INVALID`](ProtocolVersion::INVALID) sentinel below all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    /// The unset sentinel. Distinct from, and ordered below, every real version.
    pub const INVALID: ProtocolVersion = ProtocolVersion(0);
    pub const V3: ProtocolVersion = ProtocolVersion(0x03);
    pub const V4: ProtocolVersion = ProtocolVersion(0x04);
    /// Still a beta version; only offered when explicitly enabled.
    pub const V5: ProtocolVersion = ProtocolVersion(0x05);
    pub const DSE_V1: ProtocolVersion = ProtocolVersion(EXTENSION_FLAG | 0x01);
    pub const DSE_V2: ProtocolVersion = ProtocolVersion(EXTENSION_FLAG | 0x02);

    /// Wraps a raw header byte. The response direction bit is ignored.
    pub const fn from_raw(raw: u8) -> ProtocolVersion {
        ProtocolVersion(raw & VERSION_MASK)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn lowest_supported() -> ProtocolVersion {
        Self::V3
    }

    /// The version a fresh connection starts negotiating from.
    pub fn highest_supported(extension_enabled: bool) -> ProtocolVersion {
        if extension_enabled {
            Self::DSE_V2
        } else {
            Self::V4
        }
    }

    pub fn is_extension(self) -> bool {
        self.0 & EXTENSION_FLAG != 0
    }

    pub fn is_beta(self) -> bool {
        self == Self::V5
    }

    /// Whether negotiation may start at this version.
    ///
    /// Versions above the highest supported one are valid: the peer will
    /// reject them and negotiation steps down from there.
    pub fn is_valid(self) -> bool {
        self >= Self::lowest_supported()
    }

    /// Whether the driver can actually speak this version.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            Self::V3 | Self::V4 | Self::V5 | Self::DSE_V1 | Self::DSE_V2
        )
    }

    /// The version to retry with after the peer rejected this one.
    ///
    /// Walks `DSE_V2 -> DSE_V1 -> V4 -> V3`. Anything above the top of its
    /// flavour steps to that top first. Returns [`INVALID`](Self::INVALID)
    /// once the lowest supported version has been given up on.
    pub fn previous(self) -> ProtocolVersion {
        if self.is_extension() {
            if self > Self::DSE_V2 {
                Self::DSE_V2
            } else if self == Self::DSE_V2 {
                Self::DSE_V1
            } else {
                Self::V4
            }
        } else if self > Self::V5 {
            Self::V5
        } else if self > Self::lowest_supported() {
            ProtocolVersion(self.0 - 1)
        } else {
            Self::INVALID
        }
    }

    /// Keyspace can be sent per request instead of via `USE`.
    pub fn supports_set_keyspace(self) -> bool {
        self == Self::V5 || self >= Self::DSE_V2
    }

    /// Result metadata ids are exchanged on prepared statements.
    pub fn supports_result_metadata_id(self) -> bool {
        self == Self::V5 || self >= Self::DSE_V2
    }

    /// Query flags are sent as an `[int]` rather than a single byte.
    pub fn uses_int_query_flags(self) -> bool {
        self == Self::V5 || self >= Self::DSE_V2
    }

    /// How many stream ids a single connection may have in flight.
    pub fn max_stream_ids(self) -> usize {
        if self >= Self::V3 {
            32768
        } else {
            128
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::highest_supported(false)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            f.write_str("<invalid>")
        } else if self.is_extension() {
            write!(f, "DSEv{}", self.0 & !EXTENSION_FLAG)
        } else {
            write!(f, "v{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProtocolVersion;

    #[test]
    fn previous_walks_extension_then_standard_versions() {
        let mut version = ProtocolVersion::DSE_V2;
        let mut seen = vec![version];
        loop {
            version = version.previous();
            if version == ProtocolVersion::INVALID {
                break;
            }
            seen.push(version);
        }
        assert_eq!(
            seen,
            vec![
                ProtocolVersion::DSE_V2,
                ProtocolVersion::DSE_V1,
                ProtocolVersion::V4,
                ProtocolVersion::V3,
            ]
        );
    }

    #[test]
    fn versions_above_the_top_step_down_to_it() {
        assert_eq!(
            ProtocolVersion::from_raw(0x45).previous(),
            ProtocolVersion::DSE_V2
        );
        assert_eq!(ProtocolVersion::from_raw(0x09).previous(), ProtocolVersion::V5);
        assert_eq!(ProtocolVersion::V5.previous(), ProtocolVersion::V4);
    }

    #[test]
    fn validity_bounds() {
        assert!(!ProtocolVersion::INVALID.is_valid());
        assert!(!ProtocolVersion::from_raw(2).is_valid());
        assert!(ProtocolVersion::V3.is_valid());
        assert!(ProtocolVersion::from_raw(0x07).is_valid());
        assert!(!ProtocolVersion::from_raw(0x07).is_supported());
        assert_eq!(ProtocolVersion::V3.previous(), ProtocolVersion::INVALID);
    }

    #[test]
    fn ordering_puts_extensions_on_top() {
        assert!(ProtocolVersion::DSE_V1 > ProtocolVersion::V5);
        assert!(ProtocolVersion::INVALID < ProtocolVersion::V3);
        assert_eq!(
            ProtocolVersion::highest_supported(true),
            ProtocolVersion::DSE_V2
        );
        assert_eq!(ProtocolVersion::highest_supported(false), ProtocolVersion::V4);
    }

    #[test]
    fn features_follow_version() {
        assert!(!ProtocolVersion::V4.supports_set_keyspace());
        assert!(ProtocolVersion::V5.supports_set_keyspace());
        assert!(ProtocolVersion::DSE_V2.supports_result_metadata_id());
        assert!(!ProtocolVersion::DSE_V1.supports_result_metadata_id());
        assert_eq!(ProtocolVersion::V4.to_string(), "v4");
        assert_eq!(ProtocolVersion::DSE_V1.to_string(), "DSEv1");
    }

    #[test]
    fn from_raw_drops_direction_bit() {
        assert_eq!(ProtocolVersion::from_raw(0x84), ProtocolVersion::V4);
    }
}
