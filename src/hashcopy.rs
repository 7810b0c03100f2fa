//! Hash-while-copy (C4): stream bytes from an async reader into an async
//! writer, folding a SHA-512 digest over every byte, 64 KiB at a time.
//! Grounded on the `hashcopy()` call site in `copyparty/httpcli.py`'s
//! `handle_plain_upload`, and on `jhol-core`'s `Sha256::new()` + `.update()`
//! streaming-hasher usage (generalized here to `Sha512`).

use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CHUNK: usize = 64 * 1024;

/// Copies every byte from `src` to `sink`, returning `(bytes_written,
/// full_sha512_hex)`. Callers display a 56-hex-digit truncation ("SHA-512/224
/// equivalent") as defence against length-extension, per spec.md §4.4.
pub async fn hash_copy<R, W>(src: &mut R, sink: &mut W) -> std::io::Result<(u64, String)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; CHUNK];
    let mut total: u64 = 0;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        sink.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    sink.flush().await?;

    Ok((total, format!("{:x}", hasher.finalize())))
}

/// Truncates a full SHA-512 hex digest to its SHA-512/224-equivalent length
/// for display, matching `sha512[:56]` in `copyparty/httpcli.py`.
pub fn truncate_digest(full_hex: &str) -> &str {
    &full_hex[..full_hex.len().min(56)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn hash_copy_reports_exact_length_and_matching_digest() {
        let input = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut src = Cursor::new(input.clone());
        let mut sink: Vec<u8> = Vec::new();

        let (n, digest) = hash_copy(&mut src, &mut sink).await.unwrap();

        assert_eq!(n as usize, input.len());
        assert_eq!(sink, input);

        let mut hasher = Sha512::new();
        hasher.update(&input);
        assert_eq!(digest, format!("{:x}", hasher.finalize()));
    }

    #[tokio::test]
    async fn hash_copy_handles_empty_input() {
        let mut src = Cursor::new(Vec::<u8>::new());
        let mut sink: Vec<u8> = Vec::new();
        let (n, _digest) = hash_copy(&mut src, &mut sink).await.unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn truncate_digest_caps_at_56_hex_chars() {
        let full = "a".repeat(128);
        assert_eq!(truncate_digest(&full).len(), 56);
        let short = "abcd";
        assert_eq!(truncate_digest(short), "abcd");
    }
}
