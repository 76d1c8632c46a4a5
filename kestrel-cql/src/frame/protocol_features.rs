use std::collections::HashMap;

use super::protocol_version::ProtocolVersion;
use super::Compression;

const COMPRESSION_OPTION: &str = "COMPRESSION";

/// Capabilities of a connection, computed once after protocol negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ProtocolFeatures {
    pub version: ProtocolVersion,
    pub set_keyspace: bool,
    pub result_metadata_id: bool,
    pub int_query_flags: bool,
}

impl ProtocolFeatures {
    pub fn for_version(version: ProtocolVersion) -> Self {
        Self {
            version,
            set_keyspace: version.supports_set_keyspace(),
            result_metadata_id: version.supports_result_metadata_id(),
            int_query_flags: version.uses_int_query_flags(),
        }
    }

    /// Whether the peer advertised `compression` in its SUPPORTED response.
    pub fn supports_compression(
        supported: &HashMap<String, Vec<String>>,
        compression: Compression,
    ) -> bool {
        supported
            .get(COMPRESSION_OPTION)
            .is_some_and(|algs| algs.iter().any(|alg| alg == compression.as_str()))
    }
}

impl Default for ProtocolFeatures {
    fn default() -> Self {
        Self::for_version(ProtocolVersion::default())
    }
}
