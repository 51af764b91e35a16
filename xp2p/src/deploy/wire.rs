//! Line protocol shared by the deploy listener and the deploy client
//!
//! Commands are newline-terminated ASCII lines; the manifest body is sent as
//! raw bytes right after its `MANIFEST-ENC <n>` header.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use crate::errors::Xp2pError;

pub const AUTH: &str = "AUTH";
pub const OK: &str = "OK";
pub const MANIFEST_ENC: &str = "MANIFEST-ENC";
pub const RUN: &str = "RUN";
pub const EXIT: &str = "EXIT";
pub const OUT_BEGIN: &str = "OUT-BEGIN";
pub const OUT_END: &str = "OUT-END";
pub const ERR_BEGIN: &str = "ERR-BEGIN";
pub const ERR_END: &str = "ERR-END";
pub const LINK: &str = "LINK";
pub const DONE: &str = "DONE";

pub const ERR_UNAUTHORIZED: &str = "ERR unauthorized";
pub const ERR_EXPECTED_AUTH: &str = "ERR expected AUTH";
pub const ERR_EXPECTED_MANIFEST: &str = "ERR expected MANIFEST-ENC";
pub const ERR_INVALID_LENGTH: &str = "ERR invalid MANIFEST length";
pub const ERR_READ_BODY: &str = "ERR read MANIFEST-ENC body failed";
pub const ERR_NOT_CONFIGURED: &str = "ERR deploy link not configured";
pub const ERR_LINK_EXPIRED: &str = "ERR link expired";
pub const ERR_HOST_MISMATCH: &str = "ERR host mismatch";
pub const ERR_USER_MISMATCH: &str = "ERR user mismatch";
pub const ERR_PASSWORD_MISMATCH: &str = "ERR password mismatch";
pub const ERR_INVALID_HOST: &str = "ERR invalid host";

/// Largest manifest body accepted
pub const MAX_MANIFEST_LEN: usize = 1 << 20;

/// Largest command line accepted
pub const MAX_LINE_LEN: u64 = 4096;

/// Buffered line stream with a per-operation I/O timeout
pub struct LineStream<S> {
    inner: BufStream<S>,
    io_timeout: Duration,
}

impl<S> LineStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, io_timeout: Duration) -> Self {
        Self {
            inner: BufStream::new(stream),
            io_timeout,
        }
    }

    /// Read one line without its terminator, `None` on clean EOF
    pub async fn read_line(&mut self) -> Result<Option<String>, Xp2pError> {
        let timeout = self.io_timeout;
        let mut buf = String::new();
        let n = with_timeout(
            timeout,
            (&mut self.inner).take(MAX_LINE_LEN).read_line(&mut buf),
        )
        .await?;
        if n == 0 {
            return Ok(None);
        }
        if !buf.ends_with('\n') && n as u64 >= MAX_LINE_LEN {
            return Err(Xp2pError::ProtocolError("line too long".to_string()));
        }
        Ok(Some(buf.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Read exactly `len` raw bytes
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, Xp2pError> {
        let mut buf = vec![0u8; len];
        with_timeout(self.io_timeout, self.inner.read_exact(&mut buf)).await?;
        Ok(buf)
    }

    /// Write one line and flush
    pub async fn write_line(&mut self, line: &str) -> Result<(), Xp2pError> {
        let timeout = self.io_timeout;
        with_timeout(timeout, async {
            self.inner.write_all(line.as_bytes()).await?;
            self.inner.write_all(b"\n").await?;
            self.inner.flush().await
        })
        .await
    }

    /// Write raw bytes and flush
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<(), Xp2pError> {
        let timeout = self.io_timeout;
        with_timeout(timeout, async {
            self.inner.write_all(data).await?;
            self.inner.flush().await
        })
        .await
    }

    /// Write `begin`, every line of `lines`, then `end`
    pub async fn write_segment(
        &mut self,
        begin: &str,
        end: &str,
        lines: &[String],
    ) -> Result<(), Xp2pError> {
        let timeout = self.io_timeout;
        with_timeout(timeout, async {
            self.inner.write_all(begin.as_bytes()).await?;
            self.inner.write_all(b"\n").await?;
            for line in lines {
                self.inner.write_all(line.as_bytes()).await?;
                self.inner.write_all(b"\n").await?;
            }
            self.inner.write_all(end.as_bytes()).await?;
            self.inner.write_all(b"\n").await?;
            self.inner.flush().await
        })
        .await
    }

    /// Read lines up to (not including) `end`, passing each to `on_line`
    pub async fn read_segment(
        &mut self,
        end: &str,
        mut on_line: impl FnMut(&str),
    ) -> Result<(), Xp2pError> {
        loop {
            match self.read_line().await? {
                Some(line) if line == end => return Ok(()),
                Some(line) => on_line(&line),
                None => {
                    return Err(Xp2pError::ProtocolError(format!(
                        "connection closed before {end}"
                    )))
                }
            }
        }
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> Result<(), Xp2pError> {
        with_timeout(self.io_timeout, self.inner.shutdown()).await
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, Xp2pError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Xp2pError::Timeout(format!(
            "no I/O progress within {timeout:?}"
        ))),
    }
}

/// Keeps only the most recent `limit` bytes of appended lines
#[derive(Debug, Clone, Default)]
pub struct BoundedBuffer {
    data: String,
    limit: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: String::new(),
            limit,
        }
    }

    pub fn append_line(&mut self, line: &str) {
        if self.limit == 0 {
            return;
        }
        self.data.push_str(line);
        self.data.push('\n');
        if self.data.len() > self.limit {
            let mut cut = self.data.len() - self.limit;
            while !self.data.is_char_boundary(cut) {
                cut += 1;
            }
            self.data.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }
}
