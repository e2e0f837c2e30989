//! Trait abstraction for device byte sources to enable testing

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, UplinkError};

/// Source of raw device bytes in arbitrary chunk sizes
#[async_trait]
pub trait ByteSource: Send {
    /// Read the next chunk
    ///
    /// # Returns
    ///
    /// * `Result<Option<Vec<u8>>>` - Bytes read, or `None` once the source is closed
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Adapter turning any `AsyncRead` (serial stream, socket, file) into a [`ByteSource`]
pub struct ReaderSource<R> {
    reader: R,
    chunk_size: usize,
}

impl<R> ReaderSource<R> {
    /// Wrap `reader`, reading at most `chunk_size` bytes per chunk (at least 1)
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for ReaderSource<R> {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.chunk_size];
        let n = self
            .reader
            .read(&mut buf)
            .await
            .map_err(|e| UplinkError::Device(format!("Read failed: {}", e)))?;

        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}
