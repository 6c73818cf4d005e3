//! Byte stream, hashing, and compression primitives shared by the save
//! engines and the layer facade.

use std::{path::Path, pin::Pin};

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use async_tempfile::TempFile;
use bytes::{Bytes, BytesMut};
use futures_lite::{Stream, StreamExt};
use sha2::{Digest as _, Sha256};
use tap::Pipe;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::instrument;

use crate::{mediatype::Compression, Digest, Error, Result};

/// Convenience alias for a chunk of bytes in a stream.
pub type Chunk = Result<Bytes, std::io::Error>;

/// A boxed byte stream, the currency of every blob read in this crate.
pub type ByteStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// Box a stream of chunks into a [`ByteStream`].
pub fn boxed(stream: impl Stream<Item = Chunk> + Send + 'static) -> ByteStream {
    Box::pin(stream)
}

/// An empty [`ByteStream`].
pub fn empty() -> ByteStream {
    boxed(futures_lite::stream::empty())
}

/// A single-chunk [`ByteStream`] over an in-memory buffer.
pub fn once(bytes: impl Into<Bytes>) -> ByteStream {
    boxed(futures_lite::stream::once(Ok(bytes.into())))
}

/// Stream a file from disk.
pub async fn file_stream(path: &Path) -> Result<ByteStream> {
    let file = tokio::fs::File::open(path).await?;
    Ok(boxed(ReaderStream::new(file)))
}

/// Hash the specified file on disk.
#[instrument]
pub async fn file_digest(path: &Path) -> Result<Digest> {
    let mut hasher = Sha256::new();
    let mut file = tokio::fs::File::open(path).await?;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    loop {
        let n = file.read_buf(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        buffer.clear();
    }

    Ok(Digest::from_hash(hasher.finalize().to_vec()))
}

/// Decompress the stream using gzip.
pub fn gzip_decode(stream: impl Stream<Item = Chunk> + Send + 'static) -> ByteStream {
    boxed(ReaderStream::new(GzipDecoder::new(StreamReader::new(
        stream,
    ))))
}

/// Compress the stream using gzip.
pub fn gzip_encode(stream: impl Stream<Item = Chunk> + Send + 'static) -> ByteStream {
    boxed(ReaderStream::new(GzipEncoder::new(StreamReader::new(
        stream,
    ))))
}

/// Decompress the stream using zstd.
pub fn zstd_decode(stream: impl Stream<Item = Chunk> + Send + 'static) -> ByteStream {
    boxed(ReaderStream::new(ZstdDecoder::new(StreamReader::new(
        stream,
    ))))
}

/// Compress the stream using zstd.
pub fn zstd_encode(stream: impl Stream<Item = Chunk> + Send + 'static) -> ByteStream {
    boxed(ReaderStream::new(ZstdEncoder::new(StreamReader::new(
        stream,
    ))))
}

/// Peel the compression wrapper off a blob stream, yielding the plain tar.
pub fn peel(compression: Compression, stream: ByteStream) -> ByteStream {
    match compression {
        Compression::None => stream,
        Compression::Gzip => gzip_decode(stream),
        Compression::Zstd => zstd_decode(stream),
    }
}

/// Apply a compression wrapper to a plain tar stream.
pub fn compress(compression: Compression, stream: ByteStream) -> ByteStream {
    match compression {
        Compression::None => stream,
        Compression::Gzip => gzip_encode(stream),
        Compression::Zstd => zstd_encode(stream),
    }
}

/// A blob staged on disk along with the digest and size of its bytes.
#[derive(Debug)]
pub struct StagedBlob {
    /// SHA-256 of the staged bytes.
    pub digest: Digest,

    /// Size of the staged bytes.
    pub size: i64,

    file: TempFile,
}

impl StagedBlob {
    /// Stream the staged bytes from disk.
    pub async fn stream(&self) -> Result<ByteStream> {
        file_stream(self.file.file_path()).await
    }

    /// Buffer the staged bytes into memory.
    pub async fn bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(
            tokio::fs::read(self.file.file_path()).await?,
        ))
    }

    /// The on-disk path of the staged bytes.
    pub fn path(&self) -> &Path {
        self.file.file_path()
    }

    /// Split into the on-disk path and the temp file guard that keeps it
    /// alive.
    pub fn into_parts(self) -> (std::path::PathBuf, TempFile) {
        (self.file.file_path().clone(), self.file)
    }
}

/// Sink a stream into a temporary file, hashing and counting as it goes.
///
/// When `expected` is provided the computed digest must match it, or the
/// staging fails with [`Error::DigestMismatch`].
#[instrument(skip(stream, expected))]
pub async fn stage_stream(mut stream: ByteStream, expected: Option<&Digest>) -> Result<StagedBlob> {
    let file = TempFile::new()
        .await
        .map_err(|e| Error::transport(format!("create temp file: {e}")))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();
    let mut size = 0i64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        size += chunk.len() as i64;
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;

    let file = writer.into_inner();
    file.sync_all().await?;

    let digest = Digest::from_hash(hasher.finalize().to_vec());
    if let Some(expected) = expected {
        if expected != &digest {
            return Err(Error::DigestMismatch {
                expected: expected.clone(),
                actual: digest,
            });
        }
    }

    Ok(StagedBlob { digest, size, file })
}

/// Stage the compressed form of an uncompressed tar file on disk.
#[instrument]
pub async fn stage_compressed(path: &Path, compression: Compression) -> Result<StagedBlob> {
    let stream = compress(compression, file_stream(path).await?);
    stage_stream(stream, None).await
}

/// Buffer the contents of a byte stream.
#[instrument(skip(stream))]
pub async fn collect_buf(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    buf.freeze().pipe(Ok)
}

/// Hash the contents of a byte stream, returning the digest and byte count.
#[instrument(skip(stream))]
pub async fn hash_stream(mut stream: ByteStream) -> Result<(Digest, i64)> {
    let mut hasher = Sha256::new();
    let mut size = 0i64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        size += chunk.len() as i64;
    }
    Ok((Digest::from_hash(hasher.finalize().to_vec()), size))
}
