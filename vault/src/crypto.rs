//! Chunk encryption and decryption
//!
//! AES-256-GCM with a 128-bit nonce and a detached 128-bit tag. The
//! ciphertext has exactly the plaintext's length; the tag covers the
//! ciphertext only.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult, Result};
use crate::format::{ChunkHeader, ChunkRecord, LegacyBlob, NONCE_SIZE, TAG_SIZE};
use crate::keys::KeyMaterial;

/// AES-256-GCM with a 16-byte nonce
type ChunkCipher = AesGcm<Aes256, U16>;

const MIB: u64 = 1024 * 1024;

/// Interval between time markers in minutes
pub const MARKER_INTERVAL_MIN: u32 = 3;

/// Estimated segment duration in minutes, one minute per MiB, at least one
pub fn estimate_duration_minutes(size: u64) -> u32 {
    u32::try_from((size / MIB).max(1)).unwrap_or(u32::MAX)
}

/// `HH:MM` markers every three minutes from `00:00` up to `minutes` inclusive
pub fn time_markers(minutes: u32) -> Vec<String> {
    (0..=minutes)
        .step_by(MARKER_INTERVAL_MIN as usize)
        .map(|m| format!("{:02}:{:02}", m / 60, m % 60))
        .collect()
}

fn cipher(key: &KeyMaterial) -> ChunkCipher {
    ChunkCipher::new(GenericArray::from_slice(key.as_bytes()))
}

/// Encrypt `buffer` in place with a fresh nonce, returning nonce and tag
fn seal_in_place(key: &KeyMaterial, buffer: &mut [u8]) -> CryptoResult<([u8; NONCE_SIZE], [u8; TAG_SIZE])> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let tag = cipher(key)
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", buffer)
        .map_err(|e| CryptoError::EncryptionFailed { reason: e.to_string() })?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);
    Ok((nonce, tag_bytes))
}

/// Verify and decrypt `buffer` in place; on failure the buffer is wiped
fn open_in_place(
    key: &KeyMaterial,
    nonce: &[u8; NONCE_SIZE],
    tag: &[u8; TAG_SIZE],
    buffer: &mut [u8],
) -> CryptoResult<()> {
    cipher(key)
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| {
            buffer.fill(0);
            CryptoError::IntegrityFailure
        })
}

/// Source segment details recorded in a chunk header
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub filename: String,
    pub modified: DateTime<Utc>,
}

/// Turns plaintext segments into chunk records
#[derive(Debug, Clone)]
pub struct ChunkEncryptor {
    key: Arc<KeyMaterial>,
}

impl ChunkEncryptor {
    pub fn new(key: Arc<KeyMaterial>) -> Self {
        Self { key }
    }

    /// Encrypt a plaintext segment with a fresh random nonce
    pub fn encrypt(&self, plaintext: Vec<u8>, source: SourceInfo) -> CryptoResult<ChunkRecord> {
        let mut buffer = plaintext;
        let (nonce, tag) = seal_in_place(&self.key, &mut buffer)?;

        let size = buffer.len() as u64;
        let duration_estimate = estimate_duration_minutes(size);
        let header = ChunkHeader {
            original_filename: source.filename,
            timestamp: source.modified,
            plaintext_size: size,
            duration_estimate,
            markers: time_markers(duration_estimate),
        };

        Ok(ChunkRecord { header, nonce, tag, ciphertext: buffer })
    }

    /// Read a segment from disk and encrypt it
    pub fn encrypt_file<P: AsRef<Path>>(&self, path: P) -> Result<ChunkRecord> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| format!("source path has no usable file name: {}", path.display()))?
            .to_string();
        let modified = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());

        let plaintext = fs::read(path)?;
        Ok(self.encrypt(plaintext, SourceInfo { filename, modified })?)
    }

    /// Encrypt into the legacy single-blob layout
    pub fn encrypt_legacy(&self, plaintext: Vec<u8>) -> CryptoResult<LegacyBlob> {
        let mut buffer = plaintext;
        let (nonce, tag) = seal_in_place(&self.key, &mut buffer)?;
        Ok(LegacyBlob { nonce, tag, ciphertext: buffer })
    }
}

/// Verifies and decrypts chunk records and legacy blobs
#[derive(Debug, Clone)]
pub struct ChunkDecryptor {
    key: Arc<KeyMaterial>,
}

impl ChunkDecryptor {
    pub fn new(key: Arc<KeyMaterial>) -> Self {
        Self { key }
    }

    /// Decrypt a chunk, consuming it. Never returns unverified plaintext.
    pub fn decrypt(&self, record: ChunkRecord) -> CryptoResult<Vec<u8>> {
        let mut buffer = record.ciphertext;
        open_in_place(&self.key, &record.nonce, &record.tag, &mut buffer)?;
        Ok(buffer)
    }

    pub fn decrypt_legacy(&self, blob: LegacyBlob) -> CryptoResult<Vec<u8>> {
        let mut buffer = blob.ciphertext;
        open_in_place(&self.key, &blob.nonce, &blob.tag, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Arc<KeyMaterial> {
        Arc::new(KeyMaterial::from_bytes(&[9u8; 32]).unwrap())
    }

    fn source(name: &str) -> SourceInfo {
        SourceInfo { filename: name.to_string(), modified: Utc::now() }
    }

    #[test]
    fn test_roundtrip() {
        let enc = ChunkEncryptor::new(key());
        let dec = ChunkDecryptor::new(key());
        let plaintext = b"segment bytes".to_vec();

        let record = enc.encrypt(plaintext.clone(), source("seg1.mp4")).unwrap();
        assert_eq!(record.ciphertext.len(), plaintext.len());
        assert_ne!(record.ciphertext, plaintext);
        assert_eq!(dec.decrypt(record).unwrap(), plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let enc = ChunkEncryptor::new(key());
        let a = enc.encrypt(vec![0u8; 64], source("a.mp4")).unwrap();
        let b = enc.encrypt(vec![0u8; 64], source("a.mp4")).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tamper_detection() {
        let enc = ChunkEncryptor::new(key());
        let dec = ChunkDecryptor::new(key());
        let record = enc.encrypt(vec![5u8; 100], source("a.mp4")).unwrap();

        let mut flipped = record.clone();
        flipped.ciphertext[42] ^= 0x01;
        assert!(matches!(dec.decrypt(flipped), Err(CryptoError::IntegrityFailure)));

        let mut flipped = record.clone();
        flipped.tag[0] ^= 0x80;
        assert!(matches!(dec.decrypt(flipped), Err(CryptoError::IntegrityFailure)));

        let mut flipped = record;
        flipped.nonce[15] ^= 0x10;
        assert!(matches!(dec.decrypt(flipped), Err(CryptoError::IntegrityFailure)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let record = ChunkEncryptor::new(key()).encrypt(vec![1, 2, 3], source("a.mp4")).unwrap();
        let other = ChunkDecryptor::new(Arc::new(KeyMaterial::generate()));
        assert!(matches!(other.decrypt(record), Err(CryptoError::IntegrityFailure)));
    }

    #[test]
    fn test_empty_plaintext() {
        let record = ChunkEncryptor::new(key()).encrypt(Vec::new(), source("empty.mp4")).unwrap();
        assert_eq!(record.header.plaintext_size, 0);
        assert_eq!(record.header.markers, vec!["00:00"]);
        assert!(ChunkDecryptor::new(key()).decrypt(record).unwrap().is_empty());
    }

    #[test]
    fn test_legacy_roundtrip() {
        let blob = ChunkEncryptor::new(key()).encrypt_legacy(b"old footage".to_vec()).unwrap();
        let parsed = LegacyBlob::parse(&blob.to_bytes()).unwrap();
        assert_eq!(ChunkDecryptor::new(key()).decrypt_legacy(parsed).unwrap(), b"old footage");
    }

    #[test]
    fn test_duration_and_markers() {
        assert_eq!(estimate_duration_minutes(0), 1);
        assert_eq!(estimate_duration_minutes(MIB - 1), 1);
        assert_eq!(estimate_duration_minutes(5 * MIB), 5);

        assert_eq!(time_markers(1), vec!["00:00"]);
        assert_eq!(time_markers(5), vec!["00:00", "00:03"]);
        assert_eq!(time_markers(6), vec!["00:00", "00:03", "00:06"]);
        assert_eq!(time_markers(61).last().unwrap(), "01:00");
    }

    #[test]
    fn test_encrypt_file_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg1.mp4");
        fs::write(&path, vec![7u8; 2 * MIB as usize]).unwrap();

        let record = ChunkEncryptor::new(key()).encrypt_file(&path).unwrap();
        assert_eq!(record.header.original_filename, "seg1.mp4");
        assert_eq!(record.header.plaintext_size, 2 * MIB);
        assert_eq!(record.header.duration_estimate, 2);
        assert_eq!(record.header.markers, vec!["00:00"]);
    }
}
