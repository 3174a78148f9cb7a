//! Line-delimited JSON-RPC transport.
//!
//! Per the design document, framing is mandatory line-delimited UTF-8: one
//! JSON-RPC message per line, LF-terminated. A defensive brace-balancing
//! reader was considered and deliberately not built (Open Question (b)) —
//! children that emit multi-line JSON simply produce unparseable lines,
//! which are logged and skipped like any other malformed line.
//!
//! [`LineTransport`] is generic over any `AsyncWrite`/`AsyncRead` pair so
//! it can run against a child's real stdio pipes in production and against
//! an in-memory `tokio::io::duplex` in tests.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Writes newline-delimited JSON messages to an async sink.
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    #[must_use]
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialises `message` and writes it as a single LF-terminated line.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(message)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Reads newline-delimited text lines from an async source.
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: tokio::io::AsyncRead + Unpin> LineReader<R> {
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Reads the next line, stripping the trailing newline.
    ///
    /// Returns `Ok(None)` on EOF.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = String::new();
        let n = self.inner.read_line(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let mut writer = LineWriter::new(write_half);
        let mut reader = LineReader::new(server);

        writer
            .write_message(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        drop(read_half);

        let line = reader.read_line().await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["method"], "ping");
    }

    #[tokio::test]
    async fn read_line_returns_none_on_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = LineReader::new(server);
        assert!(reader.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multiple_messages_are_separated_by_lines() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"{\"a\":1}\n{\"a\":2}\n")
            .await
            .unwrap();
        let mut reader = LineReader::new(server);
        assert_eq!(reader.read_line().await.unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(reader.read_line().await.unwrap().unwrap(), "{\"a\":2}");
    }
}
