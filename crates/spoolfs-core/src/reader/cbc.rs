//! Block-aligned reads of AES-CBC encrypted streams.
//!
//! CBC lets any block be decrypted independently given the preceding
//! ciphertext block as IV, so a mid-stream read only needs the requested
//! blocks plus one. The encrypted stream is `encrypted_len(plain_len)`
//! bytes on the wire; the final block carries padding that is trimmed
//! against `plain_len`.

use std::ops::Range;

use aes::{Aes128, Aes192, Aes256};
use bytes::Bytes;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::ReaderConfig;
use crate::error::ReadError;
use crate::metadata::{encrypted_len, Segment, AES_BLOCK_SIZE};
use crate::pool::SegmentPool;

use super::segments::read_wire_range;

/// Decrypt a whole-block buffer in place.
fn decrypt_blocks(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), ReadError> {
    if buf.len() % AES_BLOCK_SIZE as usize != 0 {
        return Err(ReadError::Cipher(format!(
            "ciphertext length {} is not block aligned",
            buf.len()
        )));
    }
    let unpad = |e| ReadError::Cipher(format!("decrypt failed: {e}"));
    let init = |e| ReadError::Cipher(format!("cipher init failed: {e}"));
    match key.len() {
        16 => {
            cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(init)?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(unpad)?;
        }
        24 => {
            cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(init)?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(unpad)?;
        }
        32 => {
            cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(init)?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(unpad)?;
        }
        n => return Err(ReadError::Cipher(format!("unsupported key length {n}"))),
    }
    Ok(())
}

/// Read logical (decrypted) bytes `[range.start, range.end)` of an
/// encrypted stream of `plain_len` plaintext bytes stored in `segments`.
///
/// The fetch is aligned outward to cipher blocks; for a non-zero block
/// start the block immediately preceding it is fetched as well and used
/// as the IV (previous-ciphertext-block rule). The decrypted buffer is
/// trimmed back to the requested logical range.
pub(crate) async fn read_cbc_range(
    pool: &dyn SegmentPool,
    segments: &[Segment],
    key: &[u8],
    iv: &[u8],
    plain_len: u64,
    range: Range<u64>,
    cfg: &ReaderConfig,
    token: &CancellationToken,
) -> Result<Bytes, ReadError> {
    let end = range.end.min(plain_len);
    if range.start >= end {
        return Ok(Bytes::new());
    }

    let block_start = (range.start / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    let block_end = encrypted_len(end).min(encrypted_len(plain_len));
    let fetch_start = block_start.saturating_sub(AES_BLOCK_SIZE);
    trace!(
        start = range.start,
        end,
        block_start,
        block_end,
        "cbc-aligned fetch"
    );

    let wire = read_wire_range(pool, segments, fetch_start..block_end, cfg, token).await?;

    let (chain_iv, ciphertext) = if block_start == 0 {
        (iv, &wire[..])
    } else {
        wire.split_at(AES_BLOCK_SIZE as usize)
    };

    let mut plain = ciphertext.to_vec();
    decrypt_blocks(key, chain_iv, &mut plain)?;

    let skip = (range.start - block_start) as usize;
    let take = (end - range.start) as usize;
    Ok(Bytes::from(plain).slice(skip..skip + take))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encrypt_cbc, pattern_bytes, MemoryPool};

    const KEY: [u8; 32] = [0x42; 32];
    const IV: [u8; 16] = [0x24; 16];

    /// Load an encrypted payload into a pool split into `seg_size` pieces.
    fn encrypted_pool(plain: &[u8], seg_size: usize) -> (MemoryPool, Vec<Segment>) {
        let wire = encrypt_cbc(&KEY, &IV, plain);
        let pool = MemoryPool::new();
        let mut segments = Vec::new();
        for (i, chunk) in wire.chunks(seg_size).enumerate() {
            let id = format!("<enc{i}@test>");
            let start = (i * seg_size) as u64;
            segments.push(Segment {
                article_id: id.clone(),
                groups: Vec::new(),
                size: chunk.len() as u64,
                start_offset: start,
                end_offset: start + chunk.len() as u64 - 1,
                patched: false,
            });
            pool.insert(&id, chunk.to_vec());
        }
        (pool, segments)
    }

    async fn read(
        pool: &MemoryPool,
        segments: &[Segment],
        plain_len: u64,
        range: Range<u64>,
    ) -> Result<Bytes, ReadError> {
        read_cbc_range(
            pool,
            segments,
            &KEY,
            &IV,
            plain_len,
            range,
            &ReaderConfig::default(),
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn test_whole_stream_round_trips() {
        let plain = pattern_bytes(1000);
        let (pool, segments) = encrypted_pool(&plain, 256);
        let got = read(&pool, &segments, 1000, 0..1000).await.unwrap();
        assert_eq!(&got[..], &plain[..]);
    }

    #[tokio::test]
    async fn test_unaligned_subrange() {
        // 100 plaintext bytes, 112 on the wire; read [3, 23).
        let plain = pattern_bytes(100);
        let (pool, segments) = encrypted_pool(&plain, 1024);
        let got = read(&pool, &segments, 100, 3..23).await.unwrap();
        assert_eq!(&got[..], &plain[3..23]);
    }

    #[tokio::test]
    async fn test_mid_stream_block_uses_previous_block_iv() {
        let plain = pattern_bytes(4096);
        let (pool, segments) = encrypted_pool(&plain, 512);
        // Start well past block 0 and not on a block boundary.
        let got = read(&pool, &segments, 4096, 1000..1300).await.unwrap();
        assert_eq!(&got[..], &plain[1000..1300]);
    }

    #[tokio::test]
    async fn test_tail_padding_is_trimmed() {
        let plain = pattern_bytes(100);
        let (pool, segments) = encrypted_pool(&plain, 1024);
        let got = read(&pool, &segments, 100, 90..200).await.unwrap();
        // Clamped at plain_len, padding never surfaces.
        assert_eq!(&got[..], &plain[90..100]);
    }

    #[tokio::test]
    async fn test_read_past_end_is_empty() {
        let plain = pattern_bytes(100);
        let (pool, segments) = encrypted_pool(&plain, 1024);
        let got = read(&pool, &segments, 100, 100..128).await.unwrap();
        assert!(got.is_empty());
        assert_eq!(pool.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_aes128_key() {
        let plain = pattern_bytes(64);
        let key = [9u8; 16];
        let wire = encrypt_cbc(&key, &IV, &plain);
        let pool = MemoryPool::new();
        pool.insert("<k@t>", wire.clone());
        let segments = vec![Segment {
            article_id: "<k@t>".to_string(),
            groups: Vec::new(),
            size: wire.len() as u64,
            start_offset: 0,
            end_offset: wire.len() as u64 - 1,
            patched: false,
        }];
        let got = read_cbc_range(
            &pool,
            &segments,
            &key,
            &IV,
            64,
            10..50,
            &ReaderConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(&got[..], &plain[10..50]);
    }
}
