//! Streaming multipart/form-data parser (C3): exposes a restartable-once
//! lazy sequence of parts without ever buffering a whole part body in
//! memory. Grounded on the boundary-scanning algorithm in
//! `mikedilger-mime-multipart/src/lib.rs` (`inner`, `stream_until_token`),
//! adapted from sync `BufRead` to async `tokio::io::AsyncRead` and from
//! `httparse`-parsed `hyper::Headers` to a small hand-rolled header map, to
//! match the hand-rolled-parsing idiom `epheo-kiss` uses for its own request
//! line/header scanning.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Pebkac;

const CHUNK: usize = 16 * 1024;
const MAX_PART_HEADERS: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct PartHeader {
    pub field: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

pub struct MultipartParser<'a, R: AsyncRead + Unpin> {
    reader: &'a mut R,
    boundary: Vec<u8>,
    crlf_boundary: Vec<u8>,
    buf: Vec<u8>,
    started: bool,
    finished: bool,
    body_pending: bool,
}

fn io_err(msg: impl Into<String>) -> Pebkac {
    Pebkac::BadRequest(msg.into())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extracts the `boundary` parameter from a `Content-Type` header value,
/// tolerating an optionally quoted value.
pub fn parse_boundary(content_type: &str) -> Result<Vec<u8>, Pebkac> {
    let lower = content_type.to_ascii_lowercase();
    if !lower.contains("multipart/form-data") {
        return Err(io_err("not a multipart/form-data content-type"));
    }
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(val) = param.strip_prefix("boundary=") {
            let val = val.trim_matches('"');
            let mut boundary = Vec::with_capacity(val.len() + 2);
            boundary.extend_from_slice(b"--");
            boundary.extend_from_slice(val.as_bytes());
            return Ok(boundary);
        }
    }
    Err(io_err("multipart content-type missing boundary parameter"))
}

impl<'a, R: AsyncRead + Unpin> MultipartParser<'a, R> {
    pub fn new(reader: &'a mut R, content_type: &str) -> Result<Self, Pebkac> {
        let boundary = parse_boundary(content_type)?;
        let mut crlf_boundary = Vec::with_capacity(boundary.len() + 2);
        crlf_boundary.extend_from_slice(b"\r\n");
        crlf_boundary.extend_from_slice(&boundary);

        Ok(MultipartParser {
            reader,
            boundary,
            crlf_boundary,
            buf: Vec::new(),
            started: false,
            finished: false,
            body_pending: false,
        })
    }

    async fn fill(&mut self) -> std::io::Result<bool> {
        let mut chunk = vec![0u8; CHUNK];
        let n = self.reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }

    async fn ensure_buffered(&mut self, n: usize) -> Result<(), Pebkac> {
        while self.buf.len() < n {
            if !self.fill().await.map_err(|e| io_err(e.to_string()))? {
                return Err(io_err("multipart body ended unexpectedly"));
            }
        }
        Ok(())
    }

    /// Reads and discards bytes up to and including `token`, returning
    /// everything before it. Used for the CRLF after a boundary and (with a
    /// size cap) for part headers; never used for bodies since it buffers
    /// the skipped bytes in memory.
    async fn read_until(&mut self, token: &[u8], cap: usize) -> Result<Vec<u8>, Pebkac> {
        loop {
            if let Some(pos) = find_subslice(&self.buf, token) {
                let out: Vec<u8> = self.buf.drain(..pos + token.len()).collect();
                return Ok(out[..pos].to_vec());
            }
            if self.buf.len() > cap {
                return Err(io_err("multipart header block too large"));
            }
            if !self.fill().await.map_err(|e| io_err(e.to_string()))? {
                return Err(io_err("multipart body ended before expected token"));
            }
        }
    }

    /// Streams bytes up to (not including) `token` into `sink`, flushing
    /// eagerly so at most `token.len() - 1` extra bytes of slack are ever
    /// held in memory at once — this is what keeps large file uploads from
    /// being buffered whole (spec.md §4.3: "must not buffer the entire
    /// body").
    async fn copy_until<W: AsyncWrite + Unpin>(
        &mut self,
        token: &[u8],
        sink: &mut W,
    ) -> std::io::Result<u64> {
        let mut total = 0u64;
        loop {
            if let Some(pos) = find_subslice(&self.buf, token) {
                sink.write_all(&self.buf[..pos]).await?;
                total += pos as u64;
                self.buf.drain(..pos + token.len());
                sink.flush().await?;
                return Ok(total);
            }

            let safe = self.buf.len().saturating_sub(token.len().saturating_sub(1));
            if safe > 0 {
                sink.write_all(&self.buf[..safe]).await?;
                total += safe as u64;
                self.buf.drain(..safe);
            }

            if !self.fill().await? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "multipart body truncated before closing boundary",
                ));
            }
        }
    }

    async fn drain_current_body(&mut self) -> Result<(), Pebkac> {
        if !self.body_pending {
            return Ok(());
        }
        let mut sink = tokio::io::sink();
        let token = self.crlf_boundary.clone();
        self.copy_until(&token, &mut sink)
            .await
            .map_err(|e| io_err(e.to_string()))?;
        self.body_pending = false;
        Ok(())
    }

    /// Advances to the next part's headers, first draining any unread body
    /// from the previous part. Returns `None` once the closing boundary
    /// (`--boundary--`) is reached.
    pub async fn next_part(&mut self) -> Result<Option<PartHeader>, Pebkac> {
        if self.finished {
            return Ok(None);
        }
        self.drain_current_body().await?;

        if !self.started {
            let boundary = self.boundary.clone();
            self.read_until(&boundary, MAX_PART_HEADERS).await?;
            self.started = true;
        }

        self.ensure_buffered(2).await?;
        if &self.buf[..2] == b"--" {
            self.finished = true;
            return Ok(None);
        }

        let crlf = self.read_until(b"\r\n", 2).await?;
        if !crlf.is_empty() {
            return Err(io_err("malformed multipart boundary line"));
        }

        let header_bytes = self.read_until(b"\r\n\r\n", MAX_PART_HEADERS).await?;
        let header = parse_part_headers(&header_bytes)?;
        self.body_pending = true;
        Ok(Some(header))
    }

    /// Streams the current part's body to `sink`. Must be called at most
    /// once per part, immediately after `next_part`.
    pub async fn copy_part_body<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
    ) -> std::io::Result<u64> {
        let token = self.crlf_boundary.clone();
        let n = self.copy_until(&token, sink).await?;
        self.body_pending = false;
        Ok(n)
    }

    /// Reads the current part's body fully into memory, bounded to
    /// `max_len` bytes (for small fields like `act`/`cppwd`, never for file
    /// parts).
    pub async fn read_part_body_bounded(&mut self, max_len: usize) -> Result<Vec<u8>, Pebkac> {
        let mut sink: Vec<u8> = Vec::new();
        let token = self.crlf_boundary.clone();
        let n = self
            .copy_until(&token, &mut sink)
            .await
            .map_err(|e| io_err(e.to_string()))?;
        self.body_pending = false;
        if n as usize > max_len {
            return Err(io_err("multipart field exceeded maximum length"));
        }
        Ok(sink)
    }

    /// Consumes parts until one named `field` appears and returns its value
    /// as a bounded UTF-8 string; fails if exceeded or absent.
    pub async fn require(&mut self, field: &str, max_len: usize) -> Result<String, Pebkac> {
        loop {
            match self.next_part().await? {
                None => return Err(io_err(format!("missing required field \"{}\"", field))),
                Some(hdr) => {
                    if hdr.field == field {
                        let bytes = self.read_part_body_bounded(max_len).await?;
                        return String::from_utf8(bytes)
                            .map_err(|_| io_err("field value is not valid UTF-8"));
                    }
                }
            }
        }
    }

    /// Drains all remaining parts, discarding their bodies.
    pub async fn drop_rest(&mut self) -> Result<(), Pebkac> {
        while self.next_part().await?.is_some() {
            self.drain_current_body().await?;
        }
        Ok(())
    }
}

fn parse_part_headers(raw: &[u8]) -> Result<PartHeader, Pebkac> {
    let text = std::str::from_utf8(raw).map_err(|_| io_err("part headers are not valid UTF-8"))?;

    let mut map: HashMap<String, String> = HashMap::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            map.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let disposition = map
        .get("content-disposition")
        .ok_or_else(|| io_err("multipart part missing Content-Disposition"))?;

    let field = extract_disposition_param(disposition, "name")
        .ok_or_else(|| io_err("multipart part missing name parameter"))?;
    let filename = extract_disposition_param(disposition, "filename");
    let content_type = map.get("content-type").cloned();

    Ok(PartHeader {
        field,
        filename,
        content_type,
    })
}

/// Extracts `key="value"` (or unquoted `key=value`) from a
/// `Content-Disposition: form-data; key="value"; ...` header value.
fn extract_disposition_param(header: &str, key: &str) -> Option<String> {
    for part in header.split(';').skip(1) {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix(key) {
            let rest = rest.trim_start();
            if let Some(val) = rest.strip_prefix('=') {
                return Some(val.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn body(parts: &[(&str, Option<&str>, &str)], boundary: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, filename, value) in parts {
            out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            match filename {
                Some(fname) => out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                        name, fname
                    )
                    .as_bytes(),
                ),
                None => out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                ),
            }
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        out
    }

    #[tokio::test]
    async fn parses_fields_and_file_parts_in_order() {
        let boundary = "XYZ";
        let raw = body(
            &[("act", None, "bput"), ("file", Some("a.txt"), "hello world")],
            boundary,
        );
        let mut cursor = Cursor::new(raw);
        let ct = format!("multipart/form-data; boundary={}", boundary);
        let mut parser = MultipartParser::new(&mut cursor, &ct).unwrap();

        let first = parser.next_part().await.unwrap().unwrap();
        assert_eq!(first.field, "act");
        assert_eq!(first.filename, None);
        let act = parser.read_part_body_bounded(64).await.unwrap();
        assert_eq!(act, b"bput");

        let second = parser.next_part().await.unwrap().unwrap();
        assert_eq!(second.field, "file");
        assert_eq!(second.filename.as_deref(), Some("a.txt"));
        let mut sink: Vec<u8> = Vec::new();
        let n = parser.copy_part_body(&mut sink).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(sink, b"hello world");

        assert!(parser.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn require_skips_unwanted_fields() {
        let boundary = "ABC";
        let raw = body(
            &[("other", None, "ignored"), ("act", None, "login")],
            boundary,
        );
        let mut cursor = Cursor::new(raw);
        let ct = format!("multipart/form-data; boundary={}", boundary);
        let mut parser = MultipartParser::new(&mut cursor, &ct).unwrap();

        let act = parser.require("act", 64).await.unwrap();
        assert_eq!(act, "login");
    }

    #[tokio::test]
    async fn abandoned_part_body_is_drained_automatically() {
        let boundary = "DEF";
        let raw = body(&[("a", None, "one"), ("b", None, "two")], boundary);
        let mut cursor = Cursor::new(raw);
        let ct = format!("multipart/form-data; boundary={}", boundary);
        let mut parser = MultipartParser::new(&mut cursor, &ct).unwrap();

        let first = parser.next_part().await.unwrap().unwrap();
        assert_eq!(first.field, "a");
        // never read first's body -- next_part must drain it for us
        let second = parser.next_part().await.unwrap().unwrap();
        assert_eq!(second.field, "b");
        let val = parser.read_part_body_bounded(64).await.unwrap();
        assert_eq!(val, b"two");
    }

    #[test]
    fn parse_boundary_rejects_non_multipart_content_type() {
        assert!(parse_boundary("text/plain").is_err());
    }

    #[test]
    fn parse_boundary_extracts_quoted_value() {
        let b = parse_boundary("multipart/form-data; boundary=\"abc123\"").unwrap();
        assert_eq!(b, b"--abc123");
    }
}
