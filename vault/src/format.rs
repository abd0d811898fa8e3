//! Binary container and chunk format
//!
//! A container is one day header followed by zero or more chunk records,
//! strictly append-only. All integers are big-endian.
//!
//! ```text
//! DayHeader:   [u32 header_len][header JSON]
//! ChunkRecord: [u32 header_len][header JSON][16B nonce][16B tag][ciphertext]
//! ```
//!
//! The ciphertext length always equals `ChunkHeader::plaintext_size`.
//! A legacy single blob is `[16B nonce][16B tag][ciphertext]` with no header.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ContainerError, ContainerResult, CryptoError, CryptoResult};

/// Size of a length prefix in bytes
pub const LEN_PREFIX_SIZE: u64 = 4;

/// Size of a chunk nonce in bytes
pub const NONCE_SIZE: usize = 16;

/// Size of a chunk authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Upper bound accepted for a serialized header
pub const MAX_HEADER_LEN: u32 = 1024 * 1024;

/// Cipher suite recorded in every day header written by this crate
pub const CIPHER_SUITE: &str = "AES-256-GCM-N128";

/// Identifies a container and the encryption parameters of all its chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHeader {
    /// Day key, `YYYY-MM-DD`
    pub date: String,

    pub camera_id: String,

    #[serde(rename = "encryption")]
    pub cipher_suite: String,

    pub created_at: DateTime<Utc>,
}

/// Describes one encrypted segment inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    #[serde(rename = "filename")]
    pub original_filename: String,

    /// Modification time of the source segment
    pub timestamp: DateTime<Utc>,

    /// Authoritative ciphertext length on read
    #[serde(rename = "file_size")]
    pub plaintext_size: u64,

    /// Estimated duration in minutes
    #[serde(rename = "duration_est_min")]
    pub duration_estimate: u32,

    /// `HH:MM` offsets every three minutes
    #[serde(rename = "markers_3min")]
    pub markers: Vec<String>,
}

/// One encrypted segment with its header and cryptographic material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub header: ChunkHeader,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: Vec<u8>,
}

/// A pre-container encrypted file: nonce, tag and ciphertext only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyBlob {
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: Vec<u8>,
}

impl DayHeader {
    pub fn new(date: impl Into<String>, camera_id: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            camera_id: camera_id.into(),
            cipher_suite: CIPHER_SUITE.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Serialize as a length-prefixed frame
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(body.len() + LEN_PREFIX_SIZE as usize);
        write_frame(&mut out, &body)?;
        Ok(out)
    }
}

impl ChunkRecord {
    /// Serialize the whole record, ready for a single append
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        if self.ciphertext.len() as u64 != self.header.plaintext_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ciphertext length does not match header plaintext_size",
            ));
        }
        let header = serde_json::to_vec(&self.header)?;
        let mut out = Vec::with_capacity(
            LEN_PREFIX_SIZE as usize + header.len() + NONCE_SIZE + TAG_SIZE + self.ciphertext.len(),
        );
        write_frame(&mut out, &header)?;
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        Ok(out)
    }

    /// Decode exactly one record from a reader, as stored by the sink
    pub fn read_from<R: Read>(reader: &mut R) -> ContainerResult<Self> {
        let mut prefix = [0u8; LEN_PREFIX_SIZE as usize];
        reader.read_exact(&mut prefix).map_err(|_| truncated(0, 0))?;
        let header_len = u32::from_be_bytes(prefix);
        check_header_len(0, header_len)?;

        let mut header_bytes = vec![0u8; header_len as usize];
        reader.read_exact(&mut header_bytes).map_err(|_| truncated(0, 0))?;
        let header: ChunkHeader = parse_header(0, &header_bytes)?;

        let mut nonce = [0u8; NONCE_SIZE];
        let mut tag = [0u8; TAG_SIZE];
        reader.read_exact(&mut nonce).map_err(|_| truncated(0, 0))?;
        reader.read_exact(&mut tag).map_err(|_| truncated(0, 0))?;

        let mut ciphertext = Vec::new();
        reader
            .take(header.plaintext_size)
            .read_to_end(&mut ciphertext)
            .map_err(|_| truncated(0, 0))?;
        if ciphertext.len() as u64 != header.plaintext_size {
            return Err(truncated(0, 0));
        }

        Ok(Self { header, nonce, tag, ciphertext })
    }
}

impl LegacyBlob {
    /// Split a legacy blob into its parts
    pub fn parse(data: &[u8]) -> CryptoResult<Self> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::BlobTooShort { len: data.len() });
        }
        let mut nonce = [0u8; NONCE_SIZE];
        let mut tag = [0u8; TAG_SIZE];
        nonce.copy_from_slice(&data[..NONCE_SIZE]);
        tag.copy_from_slice(&data[NONCE_SIZE..NONCE_SIZE + TAG_SIZE]);
        Ok(Self {
            nonce,
            tag,
            ciphertext: data[NONCE_SIZE + TAG_SIZE..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "header too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)
}

fn truncated(offset: u64, chunks_decoded: usize) -> ContainerError {
    ContainerError::Truncated { offset, chunks_decoded }
}

fn check_header_len(offset: u64, len: u32) -> ContainerResult<()> {
    if len == 0 {
        return Err(ContainerError::CorruptHeader { offset, reason: "empty header".to_string() });
    }
    if len > MAX_HEADER_LEN {
        return Err(ContainerError::HeaderTooLarge { offset, len });
    }
    Ok(())
}

fn parse_header<T: serde::de::DeserializeOwned>(offset: u64, bytes: &[u8]) -> ContainerResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ContainerError::CorruptHeader {
        offset,
        reason: e.to_string(),
    })
}

/// Position of one chunk record inside a container, without its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    /// Offset of the record's length prefix
    pub offset: u64,
    pub header_len: u32,
    pub header: ChunkHeader,
}

impl ChunkFrame {
    /// Offset of the nonce
    pub fn crypto_offset(&self) -> u64 {
        self.offset + LEN_PREFIX_SIZE + u64::from(self.header_len)
    }

    /// Offset of the first ciphertext byte
    pub fn ciphertext_offset(&self) -> u64 {
        self.crypto_offset() + (NONCE_SIZE + TAG_SIZE) as u64
    }

    /// Offset one past the last byte of the record
    pub fn end_offset(&self) -> u64 {
        self.ciphertext_offset() + self.header.plaintext_size
    }

    /// Encoded length of the whole record
    pub fn record_len(&self) -> u64 {
        self.end_offset() - self.offset
    }
}

/// Result of walking a whole container
#[derive(Debug, Clone)]
pub struct ContainerScan {
    pub day_header: DayHeader,
    pub frames: Vec<ChunkFrame>,
    /// Offset one past the last complete record
    pub valid_len: u64,
    /// Set when the scan stopped before the end of the file
    pub stopped_by: Option<StopReason>,
}

/// Why a container scan ended before reaching the end of the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A trailing record is incomplete
    Truncated { offset: u64 },
    /// A record header could not be decoded
    Corrupt { offset: u64, reason: String },
}

impl ContainerScan {
    pub fn is_clean(&self) -> bool {
        self.stopped_by.is_none()
    }
}

/// Reads a container by trusting only its length prefixes.
///
/// Reads never go past the length known when the reader was created, so a
/// concurrent appender cannot hand the reader a half-written record.
pub struct ContainerReader<R> {
    reader: R,
    limit: u64,
    position: u64,
    first_chunk_offset: u64,
    chunks_decoded: usize,
    day_header: DayHeader,
    done: bool,
}

impl ContainerReader<BufReader<File>> {
    /// Open a container file, bounding reads to its current length
    pub fn open<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let file = File::open(path.as_ref())?;
        let limit = file.metadata()?.len();
        Ok(Self::new(BufReader::new(file), limit)?)
    }
}

impl<R: Read + Seek> ContainerReader<R> {
    /// Wrap a reader positioned anywhere; reads are bounded to `limit` bytes
    pub fn new(mut reader: R, limit: u64) -> ContainerResult<Self> {
        if limit == 0 {
            return Err(ContainerError::MissingDayHeader);
        }
        reader.seek(SeekFrom::Start(0)).map_err(|_| truncated(0, 0))?;

        if limit < LEN_PREFIX_SIZE {
            return Err(truncated(0, 0));
        }
        let header_len = read_u32(&mut reader).map_err(|_| truncated(0, 0))?;
        check_header_len(0, header_len)?;
        if LEN_PREFIX_SIZE + u64::from(header_len) > limit {
            return Err(truncated(0, 0));
        }
        let mut header_bytes = vec![0u8; header_len as usize];
        reader.read_exact(&mut header_bytes).map_err(|_| truncated(0, 0))?;
        let day_header: DayHeader = parse_header(0, &header_bytes)?;

        let first_chunk_offset = LEN_PREFIX_SIZE + u64::from(header_len);
        Ok(Self {
            reader,
            limit,
            position: first_chunk_offset,
            first_chunk_offset,
            chunks_decoded: 0,
            day_header,
            done: false,
        })
    }

    pub fn day_header(&self) -> &DayHeader {
        &self.day_header
    }

    /// Byte length the reader is bounded to
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Offset where the next frame is expected
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn first_chunk_offset(&self) -> u64 {
        self.first_chunk_offset
    }

    /// Resume scanning at a known record boundary
    pub fn resume_at(&mut self, offset: u64) {
        self.position = offset.max(self.first_chunk_offset);
        self.done = false;
    }

    /// Decode the next frame header and skip its payload.
    ///
    /// Returns `None` at a clean end. A truncated or corrupt record is
    /// reported once; the reader then stops.
    pub fn next_frame(&mut self) -> Option<ContainerResult<ChunkFrame>> {
        if self.done || self.position >= self.limit {
            return None;
        }
        let result = self.decode_frame_at(self.position);
        match &result {
            Ok(frame) => {
                self.position = frame.end_offset();
                self.chunks_decoded += 1;
            }
            Err(_) => self.done = true,
        }
        Some(result)
    }

    fn decode_frame_at(&mut self, offset: u64) -> ContainerResult<ChunkFrame> {
        let decoded = self.chunks_decoded;
        let remaining = self.limit - offset;
        if remaining < LEN_PREFIX_SIZE {
            return Err(truncated(offset, decoded));
        }

        self.reader.seek(SeekFrom::Start(offset)).map_err(|_| truncated(offset, decoded))?;
        let header_len = read_u32(&mut self.reader).map_err(|_| truncated(offset, decoded))?;
        check_header_len(offset, header_len)?;
        if LEN_PREFIX_SIZE + u64::from(header_len) > remaining {
            return Err(truncated(offset, decoded));
        }

        let mut header_bytes = vec![0u8; header_len as usize];
        self.reader
            .read_exact(&mut header_bytes)
            .map_err(|_| truncated(offset, decoded))?;
        let header: ChunkHeader = parse_header(offset, &header_bytes)?;

        let frame = ChunkFrame { offset, header_len, header };
        if frame.end_offset() > self.limit {
            return Err(truncated(offset, decoded));
        }
        Ok(frame)
    }

    /// Read the nonce, tag and ciphertext of a frame
    pub fn read_record(&mut self, frame: &ChunkFrame) -> ContainerResult<ChunkRecord> {
        if frame.end_offset() > self.limit {
            return Err(truncated(frame.offset, self.chunks_decoded));
        }
        let (nonce, tag) = self.read_nonce_tag(frame)?;
        let mut ciphertext = vec![0u8; frame.header.plaintext_size as usize];
        self.reader
            .read_exact(&mut ciphertext)
            .map_err(|_| truncated(frame.offset, 0))?;

        Ok(ChunkRecord { header: frame.header.clone(), nonce, tag, ciphertext })
    }

    /// Read only the nonce and tag of a frame, leaving the reader at its ciphertext
    pub fn read_nonce_tag(&mut self, frame: &ChunkFrame) -> ContainerResult<([u8; NONCE_SIZE], [u8; TAG_SIZE])> {
        let err = |_| truncated(frame.offset, 0);
        self.reader.seek(SeekFrom::Start(frame.crypto_offset())).map_err(err)?;

        let mut nonce = [0u8; NONCE_SIZE];
        let mut tag = [0u8; TAG_SIZE];
        self.reader.read_exact(&mut nonce).map_err(err)?;
        self.reader.read_exact(&mut tag).map_err(err)?;
        Ok((nonce, tag))
    }

    /// A reader over the raw encoded bytes of one record
    pub fn raw_record(&mut self, frame: &ChunkFrame) -> io::Result<io::Take<&mut R>> {
        self.reader.seek(SeekFrom::Start(frame.offset))?;
        Ok((&mut self.reader).take(frame.record_len()))
    }

    /// Walk from the first chunk until the frame starting at `offset`.
    ///
    /// Offsets are only trusted when they land on a real record boundary.
    pub fn seek_frame(&mut self, offset: u64) -> ContainerResult<ChunkFrame> {
        self.resume_at(self.first_chunk_offset);
        self.chunks_decoded = 0;
        while let Some(frame) = self.next_frame() {
            let frame = frame?;
            if frame.offset == offset {
                return Ok(frame);
            }
            if frame.offset > offset {
                break;
            }
        }
        Err(ContainerError::NoChunkAtOffset { offset })
    }

    /// Walk every remaining frame and summarize the container
    pub fn scan(mut self) -> ContainerScan {
        let mut frames = Vec::new();
        let mut stopped_by = None;
        while let Some(frame) = self.next_frame() {
            match frame {
                Ok(frame) => frames.push(frame),
                Err(ContainerError::Truncated { offset, .. }) => {
                    stopped_by = Some(StopReason::Truncated { offset });
                }
                Err(e) => {
                    stopped_by = Some(StopReason::Corrupt { offset: self.position, reason: e.to_string() });
                }
            }
        }
        let valid_len = frames.last().map(|f| f.end_offset()).unwrap_or(self.first_chunk_offset);
        ContainerScan { day_header: self.day_header, frames, valid_len, stopped_by }
    }
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; LEN_PREFIX_SIZE as usize];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Day key of a container path such as `2025-06-01.container`
pub fn container_day(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    crate::clock::parse_day_key(stem)?;
    Some(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header(name: &str, size: u64) -> ChunkHeader {
        ChunkHeader {
            original_filename: name.to_string(),
            timestamp: Utc::now(),
            plaintext_size: size,
            duration_estimate: 1,
            markers: vec!["00:00".to_string()],
        }
    }

    fn record(name: &str, payload: &[u8]) -> ChunkRecord {
        ChunkRecord {
            header: header(name, payload.len() as u64),
            nonce: [1u8; NONCE_SIZE],
            tag: [2u8; TAG_SIZE],
            ciphertext: payload.to_vec(),
        }
    }

    fn container(records: &[ChunkRecord]) -> Vec<u8> {
        let mut out = DayHeader::new("2025-06-01", "cam_01").to_bytes().unwrap();
        for r in records {
            out.extend(r.to_bytes().unwrap());
        }
        out
    }

    fn reader(bytes: Vec<u8>) -> ContainerReader<Cursor<Vec<u8>>> {
        let len = bytes.len() as u64;
        ContainerReader::new(Cursor::new(bytes), len).unwrap()
    }

    #[test]
    fn test_header_json_keys() {
        let json = serde_json::to_value(header("seg1.mp4", 10)).unwrap();
        assert_eq!(json["filename"], "seg1.mp4");
        assert_eq!(json["file_size"], 10);
        assert_eq!(json["duration_est_min"], 1);
        assert!(json["markers_3min"].is_array());

        let day = serde_json::to_value(DayHeader::new("2025-06-01", "cam_01")).unwrap();
        assert_eq!(day["encryption"], CIPHER_SUITE);
        assert_eq!(day["date"], "2025-06-01");
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let bytes = record("a.mp4", b"xyz").to_bytes().unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let header: ChunkHeader = serde_json::from_slice(&bytes[4..4 + len]).unwrap();
        assert_eq!(header.original_filename, "a.mp4");
        assert_eq!(&bytes[4 + len..4 + len + 16], &[1u8; 16]);
        assert_eq!(&bytes[bytes.len() - 3..], b"xyz");
    }

    #[test]
    fn test_frames_decode_in_order() {
        let records = vec![record("a.mp4", b"aaaa"), record("b.mp4", b""), record("c.mp4", b"cc")];
        let scan = reader(container(&records)).scan();

        assert!(scan.is_clean());
        let names: Vec<_> = scan.frames.iter().map(|f| f.header.original_filename.as_str()).collect();
        assert_eq!(names, vec!["a.mp4", "b.mp4", "c.mp4"]);
    }

    #[test]
    fn test_truncated_tail_is_reported() {
        let records = vec![record("a.mp4", b"aaaa"), record("b.mp4", b"bbbbbbbb")];
        let mut bytes = container(&records);
        let full_len = bytes.len();
        bytes.truncate(full_len - 3);

        let scan = reader(bytes).scan();
        assert_eq!(scan.frames.len(), 1);
        assert!(matches!(scan.stopped_by, Some(StopReason::Truncated { .. })));
        assert_eq!(scan.valid_len, scan.frames[0].end_offset());
    }

    #[test]
    fn test_partial_length_prefix_is_truncation() {
        let mut bytes = container(&[record("a.mp4", b"aaaa")]);
        bytes.extend_from_slice(&[0, 0]);

        let scan = reader(bytes).scan();
        assert_eq!(scan.frames.len(), 1);
        assert!(matches!(scan.stopped_by, Some(StopReason::Truncated { .. })));
    }

    #[test]
    fn test_read_record_roundtrip() {
        let original = record("a.mp4", b"payload");
        let mut r = reader(container(&[original.clone()]));
        let frame = r.next_frame().unwrap().unwrap();
        assert_eq!(r.read_record(&frame).unwrap(), original);

        let mut raw = Vec::new();
        r.raw_record(&frame).unwrap().read_to_end(&mut raw).unwrap();
        let decoded = ChunkRecord::read_from(&mut Cursor::new(raw)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_seek_frame_requires_boundary() {
        let records = vec![record("a.mp4", b"aaaa"), record("b.mp4", b"bb")];
        let mut r = reader(container(&records));
        let second = r.scan_offsets()[1];

        let frame = r.seek_frame(second).unwrap();
        assert_eq!(frame.header.original_filename, "b.mp4");
        assert!(matches!(r.seek_frame(second + 1), Err(ContainerError::NoChunkAtOffset { .. })));
    }

    #[test]
    fn test_bounded_by_limit() {
        let records = vec![record("a.mp4", b"aaaa"), record("b.mp4", b"bb")];
        let bytes = container(&records);
        let first_end = {
            let mut r = reader(bytes.clone());
            r.next_frame().unwrap().unwrap().end_offset()
        };

        let mut r = ContainerReader::new(Cursor::new(bytes), first_end).unwrap();
        assert!(r.next_frame().unwrap().is_ok());
        assert!(r.next_frame().is_none());
    }

    #[test]
    fn test_empty_and_garbage_containers() {
        assert!(matches!(
            ContainerReader::new(Cursor::new(Vec::new()), 0),
            Err(ContainerError::MissingDayHeader)
        ));

        let mut garbage = 5u32.to_be_bytes().to_vec();
        garbage.extend_from_slice(b"nope!");
        assert!(matches!(
            ContainerReader::new(Cursor::new(garbage), 9),
            Err(ContainerError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_legacy_blob_parse() {
        assert!(matches!(LegacyBlob::parse(&[0u8; 31]), Err(CryptoError::BlobTooShort { len: 31 })));

        let blob = LegacyBlob { nonce: [3; 16], tag: [4; 16], ciphertext: b"abc".to_vec() };
        assert_eq!(LegacyBlob::parse(&blob.to_bytes()).unwrap(), blob);
    }

    #[test]
    fn test_container_day() {
        assert_eq!(container_day(Path::new("/x/2025-06-01.container")), Some("2025-06-01".to_string()));
        assert_eq!(container_day(Path::new("/x/notes.container")), None);
    }

    impl<R: Read + Seek> ContainerReader<R> {
        fn scan_offsets(&mut self) -> Vec<u64> {
            let mut offsets = Vec::new();
            while let Some(Ok(frame)) = self.next_frame() {
                offsets.push(frame.offset);
            }
            offsets
        }
    }
}
