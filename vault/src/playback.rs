//! Range playback of encrypted footage
//!
//! `RangeStreamReader` turns a sealed source into plaintext bytes for an
//! HTTP response. Without a range the verified plaintext is streamed in
//! fixed-size pieces through a bounded channel. With a range the chunk is
//! decrypted into a temporary artifact that is seeked and streamed, and the
//! artifact is removed when the stream is finished or dropped.

use std::fs;
use std::io::{self, Read, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use futures::stream::{self, Stream};
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use crate::crypto::ChunkDecryptor;
use crate::error::{ContainerError, RangeError, RangeResult, Result, VaultError};
use crate::format::{ChunkRecord, ContainerReader, LegacyBlob};
use crate::keys::KeyMaterial;
use crate::sink::{BlobSink, StorageHandle, StoredFormat};

/// File name prefix of decrypted range artifacts
pub const ARTIFACT_PREFIX: &str = ".camvault-playback-";

/// Pieces buffered between the producer and the response body
const CHANNEL_DEPTH: usize = 4;

/// Where the sealed bytes come from
#[derive(Debug, Clone)]
pub enum Source {
    /// A whole legacy blob held in memory
    LegacyBlob(Bytes),
    /// The chunk record starting at `offset` in a local container
    Container { path: PathBuf, offset: u64 },
    /// An object in the blob sink
    Remote { handle: StorageHandle, format: StoredFormat },
}

/// Inclusive byte range over the plaintext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    /// Parse `bytes=<start>-<end>` against a plaintext of `total` bytes.
    ///
    /// An omitted start means 0; an omitted or oversized end means the last
    /// byte. Multiple ranges are not supported.
    pub fn parse(header: &str, total: u64) -> RangeResult<Self> {
        let malformed = || RangeError::Malformed { header: header.to_string() };

        let ranges = header.trim().strip_prefix("bytes=").ok_or_else(malformed)?;
        if ranges.contains(',') {
            return Err(malformed());
        }
        let (start_raw, end_raw) = ranges.split_once('-').ok_or_else(malformed)?;
        let parse_bound = |raw: &str| -> RangeResult<Option<u64>> {
            let raw = raw.trim();
            if raw.is_empty() {
                return Ok(None);
            }
            raw.parse::<u64>().map(Some).map_err(|_| malformed())
        };

        let start = parse_bound(start_raw)?;
        let end = parse_bound(end_raw)?;
        if start.is_none() && end.is_none() {
            return Err(malformed());
        }
        let start = start.unwrap_or(0);
        if end.map_or(false, |end| end < start) {
            return Err(malformed());
        }
        if start >= total {
            return Err(RangeError::Unsatisfiable { start, total });
        }

        let last = total - 1;
        Ok(Self { start, end: end.map_or(last, |end| end.min(last)) })
    }

    /// Number of bytes covered; never zero
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for this range
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Pinned stream of plaintext pieces
pub type PlaybackStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Status, headers and body of one playback
pub struct PlaybackResponse {
    /// Plaintext size of the whole source
    pub total_len: u64,
    /// Set for a partial response
    pub range: Option<ByteRange>,
    pub filename: Option<String>,
    pub body: PlaybackStream,
}

impl PlaybackResponse {
    pub fn status(&self) -> StatusCode {
        if self.range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }

    pub fn content_length(&self) -> u64 {
        self.range.map_or(self.total_len, |r| r.len())
    }

    pub fn content_range(&self) -> Option<String> {
        self.range.map(|r| r.content_range(self.total_len))
    }

    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.content_length()));
        if let Some(value) = self.content_range().and_then(|v| HeaderValue::from_str(&v).ok()) {
            headers.insert(header::CONTENT_RANGE, value);
        }
        headers
    }
}

/// A sealed source loaded into memory, not yet verified
enum Sealed {
    Chunk(ChunkRecord),
    Legacy(LegacyBlob),
}

impl Sealed {
    fn plaintext_len(&self) -> u64 {
        match self {
            Sealed::Chunk(record) => record.header.plaintext_size,
            Sealed::Legacy(blob) => blob.ciphertext.len() as u64,
        }
    }

    fn filename(&self) -> Option<String> {
        match self {
            Sealed::Chunk(record) => Some(record.header.original_filename.clone()),
            Sealed::Legacy(_) => None,
        }
    }

    fn open(self, decryptor: &ChunkDecryptor) -> Result<Vec<u8>> {
        let plaintext = match self {
            Sealed::Chunk(record) => decryptor.decrypt(record)?,
            Sealed::Legacy(blob) => decryptor.decrypt_legacy(blob)?,
        };
        Ok(plaintext)
    }
}

/// Decrypted artifact on disk plus the open handle streaming it.
///
/// Dropping the stream closes the handle and removes the file.
pub struct ArtifactStream {
    inner: ReaderStream<tokio::io::Take<tokio::fs::File>>,
    artifact: Option<TempPath>,
}

impl Stream for ArtifactStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = polled {
            self.release();
        }
        polled
    }
}

impl ArtifactStream {
    fn release(&mut self) {
        if let Some(path) = self.artifact.take() {
            let shown = path.display().to_string();
            match path.close() {
                Ok(()) => debug!("Removed playback artifact {}", shown),
                Err(e) => warn!("Could not remove playback artifact {}: {}", shown, e),
            }
        }
    }
}

impl Drop for ArtifactStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Serves plaintext from sealed sources
#[derive(Clone)]
pub struct RangeStreamReader {
    decryptor: ChunkDecryptor,
    sink: Arc<dyn BlobSink>,
    temp_dir: PathBuf,
    piece_size: usize,
}

impl RangeStreamReader {
    pub fn new(key: Arc<KeyMaterial>, sink: Arc<dyn BlobSink>, temp_dir: PathBuf, piece_size: usize) -> Self {
        Self {
            decryptor: ChunkDecryptor::new(key),
            sink,
            temp_dir,
            piece_size: piece_size.max(1),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Open a source for playback, optionally restricted to a byte range.
    ///
    /// The chunk's tag is verified before the response exists, so an
    /// integrity failure never reaches the client as partial content.
    pub async fn open(&self, source: Source, range: Option<&str>) -> Result<PlaybackResponse> {
        let sink = self.sink.clone();
        let sealed = tokio::task::spawn_blocking(move || load_sealed(sink.as_ref(), source))
            .await
            .map_err(|e| VaultError::Generic(format!("load task failed: {}", e)))??;

        let total_len = sealed.plaintext_len();
        let filename = sealed.filename();
        let range = range.map(|r| ByteRange::parse(r, total_len)).transpose()?;

        let body = match range {
            None => self.stream_verified(sealed).await?,
            Some(range) => self.stream_range(sealed, range).await?,
        };
        Ok(PlaybackResponse { total_len, range, filename, body })
    }

    async fn stream_verified(&self, sealed: Sealed) -> Result<PlaybackStream> {
        let decryptor = self.decryptor.clone();
        let plaintext = tokio::task::spawn_blocking(move || sealed.open(&decryptor))
            .await
            .map_err(|e| VaultError::Generic(format!("decrypt task failed: {}", e)))??;

        let plaintext = Bytes::from(plaintext);
        let piece_size = self.piece_size;
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
        tokio::spawn(async move {
            let mut offset = 0;
            while offset < plaintext.len() {
                let end = (offset + piece_size).min(plaintext.len());
                if tx.send(Ok(plaintext.slice(offset..end))).await.is_err() {
                    debug!("Playback consumer went away after {} bytes", offset);
                    return;
                }
                offset = end;
            }
        });
        Ok(channel_stream(rx))
    }

    async fn stream_range(&self, sealed: Sealed, range: ByteRange) -> Result<PlaybackStream> {
        let decryptor = self.decryptor.clone();
        let temp_dir = self.temp_dir.clone();
        let (artifact, file) = tokio::task::spawn_blocking(move || -> Result<(TempPath, fs::File)> {
            let plaintext = sealed.open(&decryptor)?;
            fs::create_dir_all(&temp_dir)?;
            let mut temp = tempfile::Builder::new()
                .prefix(ARTIFACT_PREFIX)
                .suffix(".mp4")
                .tempfile_in(&temp_dir)?;
            temp.write_all(&plaintext)?;
            temp.flush()?;
            drop(plaintext);
            let file = temp.reopen()?;
            Ok((temp.into_temp_path(), file))
        })
        .await
        .map_err(|e| VaultError::Generic(format!("decrypt task failed: {}", e)))??;

        let mut file = tokio::fs::File::from_std(file);
        file.seek(SeekFrom::Start(range.start)).await?;
        let inner = ReaderStream::with_capacity(file.take(range.len()), self.piece_size);
        Ok(Box::pin(ArtifactStream { inner, artifact: Some(artifact) }))
    }

    /// Stream every chunk of a container in order, verifying each before
    /// any of its bytes are sent. Chunks that fail verification are logged
    /// and skipped; a torn tail ends the stream.
    pub fn stream_container(&self, path: PathBuf) -> Result<PlaybackStream> {
        let mut reader = ContainerReader::open(&path)?;
        let decryptor = self.decryptor.clone();
        let piece_size = self.piece_size;
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);

        tokio::task::spawn_blocking(move || {
            while let Some(frame) = reader.next_frame() {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Stopping playback of {}: {}", path.display(), e);
                        return;
                    }
                };
                let plaintext = match reader.read_record(&frame).map_err(VaultError::from).and_then(|record| {
                    decryptor.decrypt(record).map_err(VaultError::from)
                }) {
                    Ok(plaintext) => Bytes::from(plaintext),
                    Err(e) => {
                        error!(
                            "Skipping chunk {} at offset {} of {}: {}",
                            frame.header.original_filename,
                            frame.offset,
                            path.display(),
                            e
                        );
                        continue;
                    }
                };
                for piece in plaintext.chunks(piece_size) {
                    if tx.blocking_send(Ok(plaintext.slice_ref(piece))).is_err() {
                        debug!("Container playback consumer went away");
                        return;
                    }
                }
            }
        });
        Ok(channel_stream(rx))
    }
}

fn channel_stream(rx: mpsc::Receiver<io::Result<Bytes>>) -> PlaybackStream {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

fn load_sealed(sink: &dyn BlobSink, source: Source) -> Result<Sealed> {
    match source {
        Source::LegacyBlob(bytes) => Ok(Sealed::Legacy(LegacyBlob::parse(&bytes)?)),
        Source::Container { path, offset } => {
            let mut reader = match ContainerReader::open(&path) {
                Ok(reader) => reader,
                Err(VaultError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(VaultError::NotFound { what: path.display().to_string() });
                }
                Err(e) => return Err(e),
            };
            let frame = reader.seek_frame(offset).map_err(|e| match e {
                ContainerError::NoChunkAtOffset { offset } => VaultError::NotFound {
                    what: format!("chunk at offset {} of {}", offset, path.display()),
                },
                other => other.into(),
            })?;
            Ok(Sealed::Chunk(reader.read_record(&frame)?))
        }
        Source::Remote { handle, format } => {
            let mut stream = sink.open_read_stream(&handle)?;
            match format {
                StoredFormat::ChunkRecord => Ok(Sealed::Chunk(ChunkRecord::read_from(&mut stream)?)),
                StoredFormat::LegacyBlob => {
                    let mut data = Vec::new();
                    stream.read_to_end(&mut data)?;
                    Ok(Sealed::Legacy(LegacyBlob::parse(&data)?))
                }
            }
        }
    }
}

/// Remove artifacts left behind by a previous process
pub fn sweep_stale_artifacts(temp_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(temp_dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let is_artifact = entry.file_name().to_str().map_or(false, |n| n.starts_with(ARTIFACT_PREFIX));
        if !is_artifact {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not remove stale artifact {}: {}", entry.path().display(), e),
        }
    }
    removed
}
