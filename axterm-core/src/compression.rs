//! Optional payload compression (lz4/zstd/deflate) plus a compressibility
//! analyzer used to decide whether compressing a given blob is worthwhile
//! before spending airtime on it.

use std::io::{Read, Write};

/// Absolute per-message decompression cap, independent of any
/// capability-advertised limit; exists purely to bound memory use against a
/// malicious or corrupt `originalLength` claim.
pub const MAX_DECOMPRESSED_LEN_DEFAULT: u64 = 8 * 1024;
/// Cap applied specifically to file-transfer chunk payloads, which are
/// legitimately much larger than a chat message.
pub const MAX_DECOMPRESSED_LEN_FILE_TRANSFER: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
    Deflate,
}

impl CompressionAlgorithm {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => CompressionAlgorithm::None,
            1 => CompressionAlgorithm::Lz4,
            2 => CompressionAlgorithm::Zstd,
            3 => CompressionAlgorithm::Deflate,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
            CompressionAlgorithm::Deflate => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionError {
    /// The algorithm requested isn't available in this build (e.g. the
    /// `zstd` feature is disabled); caller should fall back to another
    /// algorithm the peer also advertised.
    Unavailable,
    /// Decompression produced (or would have produced) more bytes than
    /// `limit` allows - the anti-zip-bomb guarantee.
    SizeMismatch { claimed: u64, limit: u64 },
    Codec(String),
}

/// Compress `input` with `algorithm`, refusing (returning `Ok(None)`) when the
/// compressed form isn't actually smaller than the input - there's no benefit
/// to spending a TLV and CPU time to send something larger or equal in size.
pub fn compress(
    algorithm: CompressionAlgorithm,
    input: &[u8],
) -> Result<Option<Vec<u8>>, CompressionError> {
    let compressed = match algorithm {
        CompressionAlgorithm::None => return Ok(None),
        CompressionAlgorithm::Lz4 => lz4_flex::compress_prepend_size(input),
        CompressionAlgorithm::Zstd => compress_zstd(input)?,
        CompressionAlgorithm::Deflate => compress_deflate(input)?,
    };
    if compressed.len() >= input.len() {
        return Ok(None);
    }
    Ok(Some(compressed))
}

/// Decompress `data`, given the original (claimed) length and an upper bound
/// on what we're willing to allocate/produce. Returns `SizeMismatch` if the
/// claim exceeds `limit`, or if what actually comes out doesn't match the
/// claim - either is treated as a potential zip bomb or corrupt metadata, not
/// trusted blindly.
pub fn decompress(
    algorithm: CompressionAlgorithm,
    data: &[u8],
    claimed_original_length: u64,
    limit: u64,
) -> Result<Vec<u8>, CompressionError> {
    if claimed_original_length > limit {
        return Err(CompressionError::SizeMismatch {
            claimed: claimed_original_length,
            limit,
        });
    }
    let out = match algorithm {
        CompressionAlgorithm::None => data.to_vec(),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CompressionError::Codec(e.to_string()))?,
        CompressionAlgorithm::Zstd => decompress_zstd(data, limit)?,
        CompressionAlgorithm::Deflate => decompress_deflate(data, limit)?,
    };
    if out.len() as u64 != claimed_original_length {
        return Err(CompressionError::SizeMismatch {
            claimed: claimed_original_length,
            limit,
        });
    }
    Ok(out)
}

#[cfg(feature = "zstd")]
fn compress_zstd(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    zstd::stream::encode_all(input, 0).map_err(|e| CompressionError::Codec(e.to_string()))
}

#[cfg(not(feature = "zstd"))]
fn compress_zstd(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    // zstd unavailable in this build - the spec calls for falling back to lz4
    // when the peer's capability negotiation leaves it as the common choice;
    // here at the leaf function we simply report unavailability so the caller
    // can pick a different algorithm.
    let _ = input;
    Err(CompressionError::Unavailable)
}

#[cfg(feature = "zstd")]
fn decompress_zstd(data: &[u8], limit: u64) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = zstd::stream::Decoder::new(data).map_err(|e| CompressionError::Codec(e.to_string()))?;
    read_capped(&mut decoder, limit)
}

#[cfg(not(feature = "zstd"))]
fn decompress_zstd(_data: &[u8], _limit: u64) -> Result<Vec<u8>, CompressionError> {
    Err(CompressionError::Unavailable)
}

fn compress_deflate(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(input)
        .map_err(|e| CompressionError::Codec(e.to_string()))?;
    encoder.finish().map_err(|e| CompressionError::Codec(e.to_string()))
}

fn decompress_deflate(data: &[u8], limit: u64) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    read_capped(&mut decoder, limit)
}

/// Read from `reader` up to `limit + 1` bytes so an over-claim is detected
/// without ever allocating an unbounded buffer.
fn read_capped<R: Read>(reader: &mut R, limit: u64) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    let mut bounded = reader.take(limit + 1);
    bounded
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::Codec(e.to_string()))?;
    if out.len() as u64 > limit {
        return Err(CompressionError::SizeMismatch {
            claimed: out.len() as u64,
            limit,
        });
    }
    Ok(out)
}

const PRECOMPRESSED_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "heic", "avif",
    // audio
    "mp3", "flac", "ogg", "wma", "m4a", "aac", "opus",
    // video
    "mp4", "mov", "avi", "mkv", "webm", "flv", "wmv",
    // archives
    "zip", "gz", "gzip", "7z", "rar", "lz4", "zst", "bz2", "xz", "tar",
    // office documents
    "pdf", "docx", "pptx", "xlsx", "odt", "ods", "odp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Text,
    Image,
    Audio,
    Video,
    Archive,
    Document,
    Binary,
}

fn category_for_extension(ext: &str) -> Option<FileCategory> {
    match ext {
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "heic" | "avif" => {
            Some(FileCategory::Image)
        }
        "mp3" | "flac" | "ogg" | "wma" | "m4a" | "aac" | "opus" => Some(FileCategory::Audio),
        "mp4" | "mov" | "avi" | "mkv" | "webm" | "flv" | "wmv" => Some(FileCategory::Video),
        "zip" | "gz" | "gzip" | "7z" | "rar" | "lz4" | "zst" | "bz2" | "xz" | "tar" => {
            Some(FileCategory::Archive)
        }
        "pdf" | "docx" | "pptx" | "xlsx" | "odt" | "ods" | "odp" => Some(FileCategory::Document),
        "txt" | "md" | "csv" | "json" | "xml" | "log" => Some(FileCategory::Text),
        _ => None,
    }
}

fn precompressed_reason(category: FileCategory, ext: &str) -> String {
    match category {
        FileCategory::Image => format!("'.{ext}' is an already-compressed image format"),
        FileCategory::Audio => format!("'.{ext}' is an already-compressed audio format"),
        FileCategory::Video => format!("'.{ext}' is an already-compressed video format"),
        FileCategory::Archive => format!("'.{ext}' is already an archive/compressed format"),
        FileCategory::Document => {
            format!("'.{ext}' office documents are typically already compressed internally")
        }
        FileCategory::Text | FileCategory::Binary => {
            format!("'.{ext}' files are typically already compressed")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressibilityReport {
    pub estimated_ratio: f64,
    pub is_compressible: bool,
    pub reason: String,
    pub category: FileCategory,
}

/// Estimate whether compressing `sample` is likely to be worthwhile, without
/// actually running a compressor - useful to decide up front whether to even
/// attempt it for a bulk transfer.
pub fn analyze_compressibility(sample: &[u8], filename: Option<&str>) -> CompressibilityReport {
    let category = guess_category(sample, filename);

    if let Some(name) = filename {
        if let Some(ext) = name.rsplit('.').next() {
            let ext = ext.to_ascii_lowercase();
            if PRECOMPRESSED_EXTENSIONS.contains(&ext.as_str()) {
                return CompressibilityReport {
                    estimated_ratio: 1.0,
                    is_compressible: false,
                    reason: precompressed_reason(category, &ext),
                    category,
                };
            }
        }
    }

    if sample.len() < 64 {
        return CompressibilityReport {
            estimated_ratio: 1.0,
            is_compressible: false,
            reason: "sample too small to estimate reliably".to_string(),
            category,
        };
    }

    let entropy = shannon_entropy(&sample[..sample.len().min(4096)]);
    if entropy > 7.5 {
        return CompressibilityReport {
            estimated_ratio: entropy / 8.0,
            is_compressible: false,
            reason: format!("high entropy ({entropy:.2} bits/byte) suggests already-compressed data"),
            category,
        };
    }

    let estimated_ratio = entropy / 8.0;
    if estimated_ratio > 0.9 {
        CompressibilityReport {
            estimated_ratio,
            is_compressible: false,
            reason: format!("estimated savings of only {:.0}%", (1.0 - estimated_ratio) * 100.0),
            category,
        }
    } else {
        let savings = (1.0 - estimated_ratio) * 100.0;
        CompressibilityReport {
            estimated_ratio,
            is_compressible: true,
            reason: format!("estimated savings of {savings:.0}%"),
            category,
        }
    }
}

fn guess_category(sample: &[u8], filename: Option<&str>) -> FileCategory {
    if let Some(name) = filename {
        if let Some(ext) = name.rsplit('.').next() {
            if let Some(category) = category_for_extension(&ext.to_ascii_lowercase()) {
                return category;
            }
        }
    }
    if sample.starts_with(&[0x89, b'P', b'N', b'G']) {
        return FileCategory::Image;
    }
    if sample.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return FileCategory::Image;
    }
    if sample.starts_with(b"GIF8") {
        return FileCategory::Image;
    }
    if sample.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        return FileCategory::Archive;
    }
    if sample.starts_with(&[0x1F, 0x8B]) {
        return FileCategory::Archive;
    }
    let printable = sample
        .iter()
        .filter(|&&b| (0x20..=0x7e).contains(&b) || b == b'\n' || b == b'\t' || b == b'\r')
        .count();
    if sample.is_empty() {
        return FileCategory::Binary;
    }
    if printable as f64 / sample.len() as f64 > 0.85 {
        FileCategory::Text
    } else {
        FileCategory::Binary
    }
}

fn shannon_entropy(sample: &[u8]) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    for &b in sample {
        counts[b as usize] += 1;
    }
    let len = sample.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_refuses_to_expand() {
        let input = b"x";
        let result = compress(CompressionAlgorithm::Deflate, input).unwrap();
        assert!(result.is_none(), "single byte should never shrink");
    }

    #[test]
    fn lz4_round_trip_on_compressible_data() {
        let input = vec![b'a'; 4096];
        let compressed = compress(CompressionAlgorithm::Lz4, &input).unwrap().unwrap();
        assert!(compressed.len() < input.len());
        let decompressed = decompress(
            CompressionAlgorithm::Lz4,
            &compressed,
            input.len() as u64,
            MAX_DECOMPRESSED_LEN_DEFAULT,
        )
        .unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn deflate_round_trip_on_compressible_data() {
        let input = b"the quick brown fox the quick brown fox the quick brown fox".repeat(20);
        let compressed = compress(CompressionAlgorithm::Deflate, &input).unwrap().unwrap();
        let decompressed = decompress(
            CompressionAlgorithm::Deflate,
            &compressed,
            input.len() as u64,
            MAX_DECOMPRESSED_LEN_DEFAULT,
        )
        .unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn decompress_rejects_claim_over_limit() {
        let err = decompress(CompressionAlgorithm::Lz4, &[], 1_000_000, MAX_DECOMPRESSED_LEN_DEFAULT)
            .unwrap_err();
        assert!(matches!(err, CompressionError::SizeMismatch { .. }));
    }

    #[test]
    fn decompress_rejects_mismatched_actual_size() {
        let input = vec![b'z'; 2048];
        let compressed = compress(CompressionAlgorithm::Lz4, &input).unwrap().unwrap();
        let err = decompress(
            CompressionAlgorithm::Lz4,
            &compressed,
            input.len() as u64 + 1,
            MAX_DECOMPRESSED_LEN_DEFAULT,
        )
        .unwrap_err();
        assert!(matches!(err, CompressionError::SizeMismatch { .. }));
    }

    #[test]
    fn precompressed_extension_not_recommended() {
        let report = analyze_compressibility(&vec![1u8; 200], Some("photo.jpg"));
        assert!(!report.is_compressible);
        assert_eq!(report.category, FileCategory::Image);
    }

    #[test]
    fn tiny_sample_not_recommended() {
        let report = analyze_compressibility(b"hi", None);
        assert!(!report.is_compressible);
    }

    #[test]
    fn repetitive_text_is_recommended() {
        let sample = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(4);
        let report = analyze_compressibility(&sample, Some("notes.txt"));
        assert!(report.is_compressible);
        assert_eq!(report.category, FileCategory::Text);
    }

    #[test]
    fn high_entropy_sample_not_recommended() {
        // Pseudo-random but deterministic bytes via a simple LCG, avoiding any
        // forbidden clock/rng source.
        let mut state: u32 = 0x12345678;
        let sample: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1103515245).wrapping_add(12345);
                (state >> 16) as u8
            })
            .collect();
        let report = analyze_compressibility(&sample, None);
        assert!(!report.is_compressible);
    }
}
