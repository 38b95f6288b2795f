//! Content-Length framing over a child process's standard streams.
//!
//! Each message is an HTTP-style header block terminated by a blank line,
//! with `Content-Length: N` announcing an N-byte JSON body. The reader
//! tolerates arbitrary splits of header and body across reads (everything
//! goes through `BufRead`) and enforces hard caps on both.

use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};

/// Header blocks above this size are rejected outright.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Default body cap; configurable per reader.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("header block exceeds {MAX_HEADER_BYTES} bytes")]
    HeaderTooLarge,
    #[error("body of {0} bytes exceeds cap of {1}")]
    BodyTooLarge(usize, usize),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0}")]
    InvalidContentLength(String),
    #[error("adapter connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("body is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
}

impl FramingError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FramingError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }
}

/// Reads framed messages from one logical stream. Owned by exactly one
/// session's driver; never shared.
pub struct FramedReader<R: Read> {
    reader: BufReader<R>,
    max_body: usize,
}

impl<R: Read> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_body_cap(inner, DEFAULT_MAX_BODY_BYTES)
    }

    pub fn with_body_cap(inner: R, max_body: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_body,
        }
    }

    /// Read a single framed message.
    pub fn read_message(&mut self) -> Result<Value, FramingError> {
        let mut content_length: Option<usize> = None;
        let mut header_bytes = 0usize;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line)?;
            if read_n == 0 {
                return Err(FramingError::ConnectionClosed);
            }
            header_bytes += read_n;
            if header_bytes > MAX_HEADER_BYTES {
                return Err(FramingError::HeaderTooLarge);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(
                    v.trim()
                        .parse()
                        .map_err(|_| FramingError::InvalidContentLength(v.trim().to_string()))?,
                );
            }
        }

        let len = content_length.ok_or(FramingError::MissingContentLength)?;
        if len > self.max_body {
            return Err(FramingError::BodyTooLarge(len, self.max_body));
        }
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FramingError::ConnectionClosed,
                _ => FramingError::Io(e),
            })?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

/// Writes framed messages: exactly one header block and one body per encode.
pub struct FramedWriter<W: Write> {
    writer: W,
}

impl<W: Write> FramedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_message(&mut self, message: &Value) -> Result<(), FramingError> {
        let payload = serde_json::to_vec(message)?;
        write!(self.writer, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    #[test]
    fn round_trip_through_a_buffer() {
        let mut out = Vec::new();
        let message = json!({"seq": 1, "type": "request", "command": "initialize"});
        FramedWriter::new(&mut out).write_message(&message).unwrap();

        let decoded = FramedReader::new(out.as_slice()).read_message().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn consecutive_messages_parse_independently() {
        let mut bytes = frame(r#"{"a":1}"#);
        bytes.extend(frame(r#"{"b":2}"#));
        let mut reader = FramedReader::new(bytes.as_slice());
        assert_eq!(reader.read_message().unwrap(), json!({"a": 1}));
        assert_eq!(reader.read_message().unwrap(), json!({"b": 2}));
    }

    #[test]
    fn extra_headers_are_tolerated() {
        let body = r#"{"ok":true}"#;
        let bytes = format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let decoded = FramedReader::new(bytes.as_bytes()).read_message().unwrap();
        assert_eq!(decoded, json!({"ok": true}));
    }

    #[test]
    fn missing_content_length_is_a_framing_error() {
        let bytes = b"X-Nope: 1\r\n\r\n{}";
        let err = FramedReader::new(bytes.as_slice())
            .read_message()
            .unwrap_err();
        assert!(matches!(err, FramingError::MissingContentLength));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut bytes = Vec::new();
        for _ in 0..2000 {
            bytes.extend_from_slice(b"X-Padding: aaaaaaaaaa\r\n");
        }
        let err = FramedReader::new(bytes.as_slice())
            .read_message()
            .unwrap_err();
        assert!(matches!(err, FramingError::HeaderTooLarge));
    }

    #[test]
    fn oversized_body_is_rejected_before_allocation() {
        let bytes = b"Content-Length: 999999999\r\n\r\n";
        let err = FramedReader::with_body_cap(bytes.as_slice(), 1024)
            .read_message()
            .unwrap_err();
        assert!(matches!(err, FramingError::BodyTooLarge(999999999, 1024)));
    }

    #[test]
    fn eof_mid_body_is_connection_closed() {
        let bytes = b"Content-Length: 100\r\n\r\n{\"trunc";
        let err = FramedReader::new(bytes.as_slice())
            .read_message()
            .unwrap_err();
        assert!(matches!(err, FramingError::ConnectionClosed));
    }
}
