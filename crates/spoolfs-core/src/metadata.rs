//! Data model for segmented remote files.
//!
//! A [`FileRecord`] is the authoritative description of one logical file:
//! its decrypted size, its cipher parameters, and either a flat ordered
//! list of [`Segment`]s or a list of [`NestedSource`]s carving the file
//! out of other containers. Records are produced by ingestion, consumed
//! read-only by the read path, and never mutated once observed.

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AES block size in bytes. All CBC arithmetic is in units of this.
pub const AES_BLOCK_SIZE: u64 = 16;

/// On-wire length of an AES-CBC encrypted stream for a given plaintext length.
///
/// CBC output is the plaintext rounded up to the next block boundary.
#[inline]
pub fn encrypted_len(plain_len: u64) -> u64 {
    plain_len.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
}

/// One network-addressable binary blob on the backend.
///
/// `start_offset`/`end_offset` (inclusive) position the segment's body in
/// the *enclosing stream* it belongs to: the raw file, the encrypted blob,
/// or a nested volume. `size == end_offset - start_offset + 1` holds for
/// real segments; synthesized tail patches (see
/// [`patched`](Segment::patched)) may violate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Opaque article identifier handed to the segment pool.
    pub article_id: String,
    /// Newsgroups the article is posted to.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Body size in bytes as reported by ingestion.
    pub size: u64,
    /// First byte of this segment within the enclosing stream.
    pub start_offset: u64,
    /// Last byte (inclusive) of this segment within the enclosing stream.
    pub end_offset: u64,
    /// True for coalesced duplicates synthesized to cover a short tail.
    /// The bytes such a segment yields are undefined content.
    #[serde(default)]
    pub patched: bool,
}

impl Segment {
    /// Number of stream bytes this segment claims to cover.
    #[inline]
    pub fn span(&self) -> u64 {
        self.end_offset - self.start_offset + 1
    }
}

/// Cipher applied to a file's on-wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Encryption {
    /// Plain file, segments concatenate to exactly `size` bytes.
    None,
    /// AES in CBC mode. The on-wire length is `encrypted_len(size)`.
    AesCbc {
        /// Cipher key (16, 24 or 32 bytes).
        #[serde(with = "hex::serde")]
        key: Vec<u8>,
        /// Initialization vector for block 0.
        #[serde(with = "hex::serde")]
        iv: Vec<u8>,
    },
}

impl Encryption {
    /// Whether any cipher is configured.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Encryption::None)
    }
}

/// A slice of a logical file that lives inside another container.
///
/// "Take `inner_length` bytes starting at `inner_offset` from the decrypted
/// inner volume whose full size is `inner_volume_size` and which is stored
/// in `segments` (decrypted with `key`/`iv` if present)."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedSource {
    /// Segments of the inner volume, ordered, in inner-volume coordinates.
    pub segments: Vec<Segment>,
    /// Cipher key of the inner volume, if it is encrypted.
    #[serde(default, with = "opt_hex")]
    pub key: Option<Vec<u8>>,
    /// IV of the inner volume, if it is encrypted.
    #[serde(default, with = "opt_hex")]
    pub iv: Option<Vec<u8>>,
    /// Offset of this file's slice within the decrypted inner volume.
    pub inner_offset: u64,
    /// Number of bytes this source contributes to the logical file.
    pub inner_length: u64,
    /// Full decrypted size of the inner volume.
    pub inner_volume_size: u64,
}

impl NestedSource {
    /// Cipher parameters of the inner volume, if both key and IV are set.
    pub fn cipher(&self) -> Option<(&[u8], &[u8])> {
        match (&self.key, &self.iv) {
            (Some(k), Some(iv)) => Some((k.as_slice(), iv.as_slice())),
            _ => None,
        }
    }
}

/// The authoritative description of one logical file.
///
/// Exactly one of `segments` / `nested_sources` is non-empty; use
/// [`validate`](FileRecord::validate) before handing a record to a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Decrypted, un-nested logical length in bytes.
    pub size: u64,
    /// Cipher applied to the on-wire bytes (flat records only).
    #[serde(default = "Encryption::none")]
    pub encryption: Encryption,
    /// Ordered segments; valid only when `nested_sources` is empty.
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Ordered nested sources; used when the file is carved out of other
    /// containers.
    #[serde(default)]
    pub nested_sources: Vec<NestedSource>,
    /// Opaque provenance handle.
    #[serde(default)]
    pub source_id: String,
    /// Modification time reported by ingestion.
    #[serde(default = "SystemTime::now")]
    pub mtime: SystemTime,
}

impl Encryption {
    fn none() -> Self {
        Encryption::None
    }
}

/// Structural problems detected by [`FileRecord::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// Neither or both of `segments` / `nested_sources` are populated.
    #[error("record must have exactly one of segments or nested_sources")]
    AmbiguousShape,

    /// A real (non-patched) segment's size disagrees with its offsets.
    #[error("segment {article_id} spans {span} bytes but declares size {size}")]
    SegmentSizeMismatch {
        /// Offending article.
        article_id: String,
        /// end - start + 1.
        span: u64,
        /// Declared body size.
        size: u64,
    },

    /// Segments are not ordered and contiguous from offset zero.
    #[error("segment {article_id} starts at {start}, expected {expected}")]
    SegmentGap {
        /// Offending article.
        article_id: String,
        /// Declared start offset.
        start: u64,
        /// Where the previous segment ended.
        expected: u64,
    },

    /// Nested source lengths do not add up to the logical size.
    #[error("nested sources sum to {sum} bytes, record size is {size}")]
    NestedLengthMismatch {
        /// Sum of `inner_length` across sources.
        sum: u64,
        /// Declared logical size.
        size: u64,
    },

    /// A nested source's slice exceeds its inner volume.
    #[error("nested source slice [{offset}, +{length}) exceeds inner volume of {volume} bytes")]
    NestedSliceOutOfBounds {
        /// Slice start within the inner volume.
        offset: u64,
        /// Slice length.
        length: u64,
        /// Inner volume size.
        volume: u64,
    },

    /// An AES key of unsupported length.
    #[error("unsupported AES key length {0} (expected 16, 24 or 32)")]
    BadKeyLength(usize),

    /// An IV that is not one cipher block.
    #[error("IV must be {AES_BLOCK_SIZE} bytes, got {0}")]
    BadIvLength(usize),
}

fn check_cipher(key: &[u8], iv: &[u8]) -> Result<(), RecordError> {
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(RecordError::BadKeyLength(key.len()));
    }
    if iv.len() as u64 != AES_BLOCK_SIZE {
        return Err(RecordError::BadIvLength(iv.len()));
    }
    Ok(())
}

fn check_segments(segments: &[Segment]) -> Result<(), RecordError> {
    let mut expected = 0u64;
    for seg in segments {
        if !seg.patched && seg.span() != seg.size {
            return Err(RecordError::SegmentSizeMismatch {
                article_id: seg.article_id.clone(),
                span: seg.span(),
                size: seg.size,
            });
        }
        if seg.start_offset != expected {
            return Err(RecordError::SegmentGap {
                article_id: seg.article_id.clone(),
                start: seg.start_offset,
                expected,
            });
        }
        expected = seg.end_offset + 1;
    }
    Ok(())
}

impl FileRecord {
    /// On-wire length of the flat stream backing this record.
    ///
    /// Meaningless for nested records, whose wire length is per source.
    pub fn wire_len(&self) -> u64 {
        if self.encryption.is_encrypted() {
            encrypted_len(self.size)
        } else {
            self.size
        }
    }

    /// Whether this record is assembled from nested sources.
    pub fn is_nested(&self) -> bool {
        !self.nested_sources.is_empty()
    }

    /// Check the structural invariants the read path depends on.
    ///
    /// Segment *coverage* (tail shortfall) is deliberately not checked
    /// here; short tails are handled by the reader's patch heuristic.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.segments.is_empty() == self.nested_sources.is_empty() {
            return Err(RecordError::AmbiguousShape);
        }
        if let Encryption::AesCbc { key, iv } = &self.encryption {
            check_cipher(key, iv)?;
        }
        check_segments(&self.segments)?;
        let mut sum = 0u64;
        for src in &self.nested_sources {
            if let Some((key, iv)) = src.cipher() {
                check_cipher(key, iv)?;
            }
            check_segments(&src.segments)?;
            if src.inner_offset + src.inner_length > src.inner_volume_size {
                return Err(RecordError::NestedSliceOutOfBounds {
                    offset: src.inner_offset,
                    length: src.inner_length,
                    volume: src.inner_volume_size,
                });
            }
            sum += src.inner_length;
        }
        if self.is_nested() && sum != self.size {
            return Err(RecordError::NestedLengthMismatch {
                sum,
                size: self.size,
            });
        }
        Ok(())
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (no path separators).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Logical size for files, 0 for directories.
    pub size: u64,
    /// Modification time.
    pub mtime: SystemTime,
}

/// Errors surfaced by a metadata provider.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The provider's own storage failed.
    #[error("metadata backend error: {0}")]
    Backend(String),

    /// A record exists but cannot be decoded.
    #[error("corrupt record for {path}: {reason}")]
    Corrupt {
        /// Logical path of the record.
        path: String,
        /// Decode failure description.
        reason: String,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read-only lookup surface the core consumes from ingestion.
///
/// The core never writes through this interface.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up the record for a logical path. `Ok(None)` means not found.
    async fn stat(&self, path: &str) -> Result<Option<FileRecord>, MetadataError>;

    /// List a directory. `Ok(None)` means the directory does not exist.
    async fn readdir(&self, path: &str) -> Result<Option<Vec<DirEntry>>, MetadataError>;
}

mod opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
