//! AXDP capability negotiation: what protocol features and compression
//! algorithms a peer supports, and a TTL cache of what's been learned about
//! each station heard so far.

use crate::axdp::{push_tlv, TlvReader};
use crate::compression::CompressionAlgorithm;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const FEATURE_SACK: u32 = 1 << 0;
pub const FEATURE_RESUME: u32 = 1 << 1;
pub const FEATURE_COMPRESSION: u32 = 1 << 2;
pub const FEATURE_EXTENDED_METADATA: u32 = 1 << 3;

const SUB_TLV_PROTO_MIN: u8 = 0x01;
const SUB_TLV_PROTO_MAX: u8 = 0x02;
const SUB_TLV_FEATURES: u8 = 0x03;
const SUB_TLV_COMPRESSION_ALGOS: u8 = 0x04;
const SUB_TLV_MAX_DECOMPRESSED_LEN: u8 = 0x05;
const SUB_TLV_MAX_CHUNK_LEN: u8 = 0x06;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxdpCapability {
    pub proto_min: u8,
    pub proto_max: u8,
    pub features: u32,
    /// Algorithms this station supports, in descending order of preference.
    pub compression_algos: Vec<CompressionAlgorithm>,
    pub max_decompressed_len: u32,
    pub max_chunk_len: u16,
}

impl Default for AxdpCapability {
    fn default() -> Self {
        Self {
            proto_min: 1,
            proto_max: 1,
            features: FEATURE_SACK | FEATURE_RESUME | FEATURE_COMPRESSION,
            compression_algos: vec![CompressionAlgorithm::Lz4],
            max_decompressed_len: 4096,
            max_chunk_len: 128,
        }
    }
}

impl AxdpCapability {
    pub fn has_feature(&self, feature: u32) -> bool {
        self.features & feature != 0
    }

    pub(crate) fn encode_sub_tlvs(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_tlv(&mut out, SUB_TLV_PROTO_MIN, &[self.proto_min]);
        push_tlv(&mut out, SUB_TLV_PROTO_MAX, &[self.proto_max]);
        push_tlv(&mut out, SUB_TLV_FEATURES, &self.features.to_be_bytes());
        let algos: Vec<u8> = self.compression_algos.iter().map(|a| a.as_u8()).collect();
        push_tlv(&mut out, SUB_TLV_COMPRESSION_ALGOS, &algos);
        push_tlv(
            &mut out,
            SUB_TLV_MAX_DECOMPRESSED_LEN,
            &self.max_decompressed_len.to_be_bytes(),
        );
        push_tlv(&mut out, SUB_TLV_MAX_CHUNK_LEN, &self.max_chunk_len.to_be_bytes());
        out
    }

    pub(crate) fn decode_sub_tlvs(data: &[u8]) -> Option<Self> {
        let mut cap = AxdpCapability {
            proto_min: 0,
            proto_max: 0,
            features: 0,
            compression_algos: Vec::new(),
            max_decompressed_len: 0,
            max_chunk_len: 0,
        };
        let mut saw_min = false;
        let mut saw_max = false;
        for (sub_type, value) in TlvReader::new(data) {
            match sub_type {
                SUB_TLV_PROTO_MIN => {
                    if let Some(&b) = value.first() {
                        cap.proto_min = b;
                        saw_min = true;
                    }
                }
                SUB_TLV_PROTO_MAX => {
                    if let Some(&b) = value.first() {
                        cap.proto_max = b;
                        saw_max = true;
                    }
                }
                SUB_TLV_FEATURES => {
                    if let Ok(bytes) = value.try_into() {
                        cap.features = u32::from_be_bytes(bytes);
                    }
                }
                SUB_TLV_COMPRESSION_ALGOS => {
                    cap.compression_algos = value
                        .iter()
                        .filter_map(|&b| CompressionAlgorithm::from_u8(b))
                        .collect();
                }
                SUB_TLV_MAX_DECOMPRESSED_LEN => {
                    if let Ok(bytes) = value.try_into() {
                        cap.max_decompressed_len = u32::from_be_bytes(bytes);
                    }
                }
                SUB_TLV_MAX_CHUNK_LEN => {
                    if let Ok(bytes) = value.try_into() {
                        cap.max_chunk_len = u16::from_be_bytes(bytes);
                    }
                }
                _ => {}
            }
        }
        if !saw_min || !saw_max {
            return None;
        }
        Some(cap)
    }

    /// Negotiate the effective capability in use with a peer, given what we
    /// advertise locally and what they advertised to us. Capability
    /// negotiation is opportunistic: this is only ever consulted to decide
    /// whether to use an optional feature, never to block sending.
    pub fn negotiate(local: &AxdpCapability, remote: &AxdpCapability) -> AxdpCapability {
        let compression_algos: Vec<CompressionAlgorithm> = local
            .compression_algos
            .iter()
            .filter(|algo| remote.compression_algos.contains(algo))
            .copied()
            .collect();
        AxdpCapability {
            proto_min: local.proto_min.max(remote.proto_min),
            proto_max: local.proto_max.min(remote.proto_max),
            features: local.features & remote.features,
            compression_algos,
            max_decompressed_len: local.max_decompressed_len.min(remote.max_decompressed_len),
            max_chunk_len: local.max_chunk_len.min(remote.max_chunk_len),
        }
    }

    /// True if compression should be attempted for a peer with this negotiated
    /// capability: the feature bit must be set and at least one common
    /// algorithm must exist.
    pub fn compression_usable(&self) -> bool {
        self.has_feature(FEATURE_COMPRESSION) && !self.compression_algos.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StationId {
    pub callsign: [u8; 6],
    pub ssid: u8,
}

impl StationId {
    pub fn new(address: &crate::address::Address) -> Self {
        let mut callsign = [b' '; 6];
        let bytes = address.callsign().as_bytes();
        callsign[..bytes.len().min(6)].copy_from_slice(&bytes[..bytes.len().min(6)]);
        Self {
            callsign,
            ssid: address.ssid(),
        }
    }
}

struct CacheEntry {
    capability: AxdpCapability,
    recorded_at: Instant,
}

/// TTL cache of capabilities learned from AXDP traffic, keyed by station.
/// Mutated only by the AXDP receive path (on a capabilities TLV arrival) or
/// explicit eviction; nothing else writes to it.
pub struct CapabilityCache {
    ttl: Duration,
    entries: HashMap<StationId, CacheEntry>,
}

impl CapabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn record(&mut self, station: StationId, capability: AxdpCapability, now: Instant) {
        self.entries.insert(
            station,
            CacheEntry {
                capability,
                recorded_at: now,
            },
        );
    }

    pub fn get(&self, station: &StationId, now: Instant) -> Option<&AxdpCapability> {
        let entry = self.entries.get(station)?;
        if now.duration_since(entry.recorded_at) > self.ttl {
            return None;
        }
        Some(&entry.capability)
    }

    pub fn evict(&mut self, station: &StationId) {
        self.entries.remove(station);
    }

    pub fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.duration_since(entry.recorded_at) <= ttl);
    }

    /// Number of stations currently cached, including any that have not yet
    /// been lazily evicted by `evict_expired`.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_tlv_round_trip() {
        let cap = AxdpCapability::default();
        let encoded = cap.encode_sub_tlvs();
        let decoded = AxdpCapability::decode_sub_tlvs(&encoded).unwrap();
        assert_eq!(decoded, cap);
    }

    #[test]
    fn negotiate_takes_narrowest_proto_range_and_common_features() {
        let local = AxdpCapability {
            proto_min: 1,
            proto_max: 2,
            features: FEATURE_SACK | FEATURE_COMPRESSION,
            compression_algos: vec![CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd],
            max_decompressed_len: 8192,
            max_chunk_len: 200,
        };
        let remote = AxdpCapability {
            proto_min: 1,
            proto_max: 1,
            features: FEATURE_SACK,
            compression_algos: vec![CompressionAlgorithm::Zstd],
            max_decompressed_len: 4096,
            max_chunk_len: 128,
        };
        let negotiated = AxdpCapability::negotiate(&local, &remote);
        assert_eq!(negotiated.proto_min, 1);
        assert_eq!(negotiated.proto_max, 1);
        assert_eq!(negotiated.features, FEATURE_SACK);
        assert_eq!(negotiated.compression_algos, vec![CompressionAlgorithm::Zstd]);
        assert_eq!(negotiated.max_decompressed_len, 4096);
        assert_eq!(negotiated.max_chunk_len, 128);
        assert!(!negotiated.compression_usable());
    }

    #[test]
    fn preserves_local_preference_order_for_common_algorithms() {
        let local = AxdpCapability {
            compression_algos: vec![
                CompressionAlgorithm::Zstd,
                CompressionAlgorithm::Deflate,
                CompressionAlgorithm::Lz4,
            ],
            ..AxdpCapability::default()
        };
        let remote = AxdpCapability {
            compression_algos: vec![CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd],
            ..AxdpCapability::default()
        };
        let negotiated = AxdpCapability::negotiate(&local, &remote);
        assert_eq!(
            negotiated.compression_algos,
            vec![CompressionAlgorithm::Zstd, CompressionAlgorithm::Lz4]
        );
    }

    #[test]
    fn cache_expires_after_ttl() {
        let mut cache = CapabilityCache::new(Duration::from_secs(10));
        let station = StationId {
            callsign: *b"VK7XT ",
            ssid: 0,
        };
        let t0 = Instant::now();
        cache.record(station, AxdpCapability::default(), t0);
        assert!(cache.get(&station, t0).is_some());
        assert!(cache.get(&station, t0 + Duration::from_secs(11)).is_none());
    }
}
