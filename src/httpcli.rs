//! HTTP transaction engine (C5): a hand-rolled HTTP/1.1 parser and
//! responder. Grounded on `copyparty/httpcli.py` (`run`, `handle_get`,
//! `tx_file`, `tx_browser`, `handle_post*`, `handle_plain_upload`) for the
//! exact routing/range/upload semantics, and on `epheo-kiss/src/main.rs`'s
//! hand-rolled, allocation-light line/header scanning style (`read_line`
//! loop, `BufReader<&mut TcpStream>` per connection, direct `write_all`
//! responses) for how the parser touches the wire.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha512};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite,
    AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::authsrv::AuthSrv;
use crate::config::Config;
use crate::error::Pebkac;
use crate::hashcopy::truncate_digest;
use crate::multipart::MultipartParser;
use crate::templates;
use crate::vfs::{escapes_root, undot, ANON};

const KEEPALIVE_TIMEOUT_SECS: u64 = 60;
const MAX_HEADER_BLOCK: usize = 64 * 1024;
const MAX_JSON_BODY: u64 = 1024 * 1024;

/// Either a user-facing error to render (caught, logged, `<pre>`-wrapped and
/// sent to the client per spec.md §4.5.7) or a transport failure that
/// closes the connection without attempting a further response.
enum Fault {
    User(Pebkac),
    Io(std::io::Error),
}

impl From<Pebkac> for Fault {
    fn from(e: Pebkac) -> Self {
        Fault::User(e)
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Fault::Io(e)
    }
}

/// Parsed query parameter value: a plain string, or the sentinel `true` for
/// a bare `key` with no `=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Str(String),
    Flag,
}

pub type Query = HashMap<String, QueryValue>;

/// Decodes `%XX` percent-escapes. Invalid escapes pass the raw bytes
/// through unchanged rather than erroring, matching a browser's own
/// leniency when emitting request targets.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encodes everything outside the unreserved set plus `/`, for use
/// in directory-listing hrefs.
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Splits a `Cookie` header into its `key=value` tokens.
pub fn parse_cookie_header(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for tok in raw.split(';') {
        let tok = tok.trim();
        if let Some((k, v)) = tok.split_once('=') {
            out.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    out
}

pub fn parse_query(raw: &str) -> Query {
    let mut out = HashMap::new();
    for tok in raw.split('&') {
        if tok.is_empty() {
            continue;
        }
        match tok.split_once('=') {
            Some((k, v)) => {
                out.insert(k.to_ascii_lowercase(), QueryValue::Str(percent_decode(v)));
            }
            None => {
                out.insert(tok.to_ascii_lowercase(), QueryValue::Flag);
            }
        }
    }
    out
}

pub struct ParsedTarget {
    pub vpath: String,
    pub query: Query,
    pub absolute_urls: bool,
}

/// Splits the request-target on `?`, derives `absolute_urls` from the raw
/// (still-encoded) path's trailing slash, then undots and percent-decodes.
pub fn parse_target(raw_target: &str) -> ParsedTarget {
    let (raw_path, raw_query) = match raw_target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (raw_target, ""),
    };
    let absolute_urls = !raw_path.ends_with('/');
    let vpath = percent_decode(&undot(raw_path));
    ParsedTarget {
        vpath,
        query: parse_query(raw_query),
        absolute_urls,
    }
}

struct RequestLine {
    method: String,
    target: String,
    #[allow(dead_code)]
    version: String,
}

fn parse_request_line(line: &str) -> Result<RequestLine, Pebkac> {
    let tokens: Vec<&str> = line.trim().split(' ').filter(|s| !s.is_empty()).collect();
    if tokens.len() != 3 {
        return Err(Pebkac::BadRequest("malformed request line".into()));
    }
    Ok(RequestLine {
        method: tokens[0].to_string(),
        target: tokens[1].to_string(),
        version: tokens[2].to_string(),
    })
}

async fn read_headers<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<HashMap<String, String>, Pebkac> {
    let mut headers = HashMap::new();
    let mut total = 0usize;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Pebkac::BadRequest(format!("reading headers: {}", e)))?;
        if n == 0 {
            return Err(Pebkac::BadRequest(
                "connection closed while reading headers".into(),
            ));
        }
        total += n;
        if total > MAX_HEADER_BLOCK {
            return Err(Pebkac::BadRequest("header block too large".into()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
    Ok(headers)
}

// ---- a fixed, non-RFC-7231 timestamp format: "%a, %b %d %Y %H:%M:%S GMT" ----
// (day/month order and missing zero-pad differ from `httpdate`'s RFC format,
// per spec.md §4.5.3; civil-calendar math follows Howard Hinnant's
// days_from_civil/civil_from_days algorithm.)

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m as u32, d)
}

pub fn format_http_date(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let days = secs.div_euclid(86400);
    let rem = secs.rem_euclid(86400);
    let (y, m, d) = civil_from_days(days);
    let weekday = ((days.rem_euclid(7)) + 4) % 7;
    format!(
        "{}, {} {:02} {} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[weekday as usize],
        MONTHS[(m - 1) as usize],
        d,
        y,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Strictly parses the format above to epoch seconds, returning `None` on
/// any deviation (REDESIGN FLAG: no byte-exact-string fallback).
pub fn parse_http_date(s: &str) -> Option<i64> {
    let rest = s.trim().split_once(", ")?.1;
    let mut parts = rest.split_whitespace();
    let mon = parts.next()?;
    let day: i64 = parts.next()?.parse().ok()?;
    let year: i64 = parts.next()?.parse().ok()?;
    let time = parts.next()?;
    let gmt = parts.next()?;
    if gmt != "GMT" || parts.next().is_some() {
        return None;
    }
    let month = MONTHS.iter().position(|m| *m == mon)? as i64 + 1;
    let mut t = time.split(':');
    let hh: i64 = t.next()?.parse().ok()?;
    let mm: i64 = t.next()?.parse().ok()?;
    let ss: i64 = t.next()?.parse().ok()?;
    if t.next().is_some() {
        return None;
    }
    Some(days_from_civil(year, month, day) * 86400 + hh * 3600 + mm * 60 + ss)
}

/// Parses `Range: bytes=LOW-HIGH` into an exclusive-upper `[lower, upper)`
/// byte range, per spec.md §4.5.3.
pub fn parse_range(value: &str, filesize: u64) -> Result<(u64, u64), Pebkac> {
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| Pebkac::BadRequest("malformed Range header".into()))?;
    let (low_s, high_s) = spec
        .split_once('-')
        .ok_or_else(|| Pebkac::BadRequest("malformed Range header".into()))?;
    if low_s.is_empty() && high_s.is_empty() {
        return Err(Pebkac::RangeNotSatisfiable("empty range bounds".into()));
    }
    let lower: i64 = if low_s.is_empty() {
        0
    } else {
        low_s
            .parse()
            .map_err(|_| Pebkac::BadRequest("malformed range lower bound".into()))?
    };
    let upper: i64 = if high_s.is_empty() {
        filesize as i64
    } else {
        let high: i64 = high_s
            .parse()
            .map_err(|_| Pebkac::BadRequest("malformed range upper bound".into()))?;
        high + 1
    };
    if lower < 0
        || upper < 0
        || lower as u64 >= filesize
        || upper as u64 > filesize
        || upper <= lower
    {
        return Err(Pebkac::RangeNotSatisfiable(format!(
            "range {}-{} unsatisfiable for size {}",
            lower, upper, filesize
        )));
    }
    Ok((lower as u64, upper as u64))
}

fn breadcrumbs(vpath: &str, _absolute_urls: bool) -> Vec<templates::VpNode> {
    let mut nodes = vec![(String::new(), "/".to_string())];
    let mut acc = String::new();
    for seg in vpath.split('/').filter(|s| !s.is_empty()) {
        acc.push_str(seg);
        acc.push('/');
        nodes.push((format!("/{}", acc), seg.to_string()));
    }
    nodes
}

fn make_href(vpath: &str, name: &str, absolute_urls: bool) -> String {
    if absolute_urls {
        let base = vpath.trim_matches('/');
        if base.is_empty() {
            format!("/{}", percent_encode(name))
        } else {
            format!("/{}/{}", percent_encode(base), percent_encode(name))
        }
    } else {
        percent_encode(name)
    }
}

fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

async fn respond_bytes<W: AsyncWrite + Unpin>(
    w: &mut W,
    code: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
    head_only: bool,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nConnection: Keep-Alive\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        code,
        reason,
        content_type,
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    if !head_only {
        w.write_all(body).await?;
    }
    w.flush().await
}

async fn respond_error<W: AsyncWrite + Unpin>(w: &mut W, err: &Pebkac) -> std::io::Result<()> {
    let (code, reason) = err.status();
    tracing::info!(status = code, message = %err, "request failed");
    let html = templates::render_error(err.message());
    respond_bytes(w, code, reason, "text/html; charset=utf-8", html.as_bytes(), false).await
}

/// Bridges `MultipartParser::copy_part_body`'s push-style sink to
/// hash-while-copy: every write is folded into a running SHA-512 digest
/// before being forwarded to the real sink, the same technique
/// `hashcopy.rs` applies on the pull side.
struct HashingWriter<'w, W> {
    inner: &'w mut W,
    hasher: Sha512,
    total: u64,
}

impl<'w, W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<'w, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut *this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.total += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Drives one accepted TCP connection start to finish.
pub async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, cfg: Arc<Config>, asrv: Arc<AuthSrv>) {
    let _ = stream.set_nodelay(true);
    connection_loop(&mut stream, peer, &cfg, &asrv).await;
}

async fn connection_loop<S>(stream: &mut S, peer: SocketAddr, cfg: &Config, asrv: &AuthSrv)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(64 * 1024, stream);
    loop {
        match handle_one_request(&mut reader, peer, cfg, asrv).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "transport error, closing connection");
                break;
            }
        }
    }
}

async fn handle_one_request<S>(
    reader: &mut BufReader<&mut S>,
    peer: SocketAddr,
    cfg: &Config,
    asrv: &AuthSrv,
) -> std::io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    let n = match timeout(
        Duration::from_secs(KEEPALIVE_TIMEOUT_SECS),
        reader.read_line(&mut line),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => return Ok(false),
    };
    if n == 0 {
        return Ok(false);
    }
    if line.trim().is_empty() {
        return Ok(true);
    }

    let req_line = match parse_request_line(&line) {
        Ok(rl) => rl,
        Err(e) => {
            respond_error(reader.get_mut(), &e).await?;
            return Ok(false);
        }
    };

    let headers = match read_headers(reader).await {
        Ok(h) => h,
        Err(e) => {
            respond_error(reader.get_mut(), &e).await?;
            return Ok(false);
        }
    };

    let keep_alive = headers
        .get("connection")
        .map(|v| !v.eq_ignore_ascii_case("close"))
        .unwrap_or(true);

    let uname = headers
        .get("cookie")
        .map(|raw| parse_cookie_header(raw))
        .and_then(|cookies| cookies.get("cppwd").cloned())
        .map(|v| asrv.resolve_cookie(&percent_decode(&v)))
        .unwrap_or_else(|| ANON.to_string());

    let parsed = parse_target(&req_line.target);
    let method = req_line.method.to_ascii_uppercase();

    tracing::info!(peer = %peer, method = %method, target = %req_line.target, uname = %uname, "request");

    let result: Result<(), Fault> = match method.as_str() {
        "GET" | "HEAD" => {
            dispatch_get(reader.get_mut(), asrv, &uname, parsed, method == "HEAD", &headers).await
        }
        "POST" => dispatch_post(reader, cfg, asrv, &uname, parsed, &headers, peer).await,
        other => Err(Fault::User(Pebkac::BadRequest(format!(
            "unsupported method {}",
            other
        )))),
    };

    match result {
        Ok(()) => {}
        Err(Fault::User(e)) => respond_error(reader.get_mut(), &e).await?,
        Err(Fault::Io(e)) => return Err(e),
    }

    Ok(keep_alive)
}

async fn dispatch_get<W: AsyncWrite + Unpin>(
    w: &mut W,
    asrv: &AuthSrv,
    uname: &str,
    mut parsed: ParsedTarget,
    head_only: bool,
    headers: &HashMap<String, String>,
) -> Result<(), Fault> {
    let trimmed = parsed.vpath.trim_matches('/').to_string();

    if let Some(suffix) = trimmed.strip_prefix(".cpr") {
        let suffix = suffix.trim_start_matches('/');
        if let Some((ctype, bytes)) = templates::asset(suffix) {
            return respond_bytes(w, 200, "OK", ctype, bytes, head_only)
                .await
                .map_err(Fault::Io);
        }
    }

    if trimmed.is_empty() && parsed.query.is_empty() {
        let visible: Vec<String> = asrv.with_vfs(|vfs| {
            let mut names = vfs.user_tree(uname, true, false);
            for n in vfs.user_tree(uname, false, true) {
                if !names.contains(&n) {
                    names.push(n);
                }
            }
            names
        });
        if visible.len() == 1 {
            parsed.vpath = visible[0].clone();
            parsed.absolute_urls = true;
        }
    }

    let vpath = parsed.vpath.trim_matches('/').to_string();
    let (readable, writable) = asrv.with_vfs(|vfs| vfs.can_access(&vpath, uname));
    let want_index = (!readable && !writable) || parsed.query.get("h").is_some();

    if want_index {
        let (read_list, write_list) =
            asrv.with_vfs(|vfs| (vfs.user_tree(uname, true, false), vfs.user_tree(uname, false, true)));
        let html = templates::render_mounts(&read_list, &write_list);
        return respond_bytes(w, 200, "OK", "text/html; charset=utf-8", html.as_bytes(), head_only)
            .await
            .map_err(Fault::Io);
    }

    if readable {
        return serve_browse_or_file(w, asrv, uname, &vpath, parsed.absolute_urls, head_only, headers).await;
    }

    let html = templates::render_browser(&vpath, &breadcrumbs(&vpath, parsed.absolute_urls), &[], true);
    respond_bytes(w, 200, "OK", "text/html; charset=utf-8", html.as_bytes(), head_only)
        .await
        .map_err(Fault::Io)
}

async fn serve_browse_or_file<W: AsyncWrite + Unpin>(
    w: &mut W,
    asrv: &AuthSrv,
    uname: &str,
    vpath: &str,
    absolute_urls: bool,
    head_only: bool,
    headers: &HashMap<String, String>,
) -> Result<(), Fault> {
    let resolved: Result<PathBuf, Pebkac> = asrv.with_vfs(|vfs| {
        let (node, rem) = vfs.get(vpath, uname, true, false)?;
        Ok(node.canonical(&rem))
    });
    let realpath = resolved?;

    let meta = match tokio::fs::metadata(&realpath).await {
        Ok(m) => m,
        Err(_) => {
            return Err(Fault::User(Pebkac::NotFound(format!("{} not found", vpath))));
        }
    };

    if meta.is_file() {
        tx_file(w, &realpath, meta, head_only, headers).await
    } else {
        tx_browser(w, asrv, uname, vpath, absolute_urls, head_only).await
    }
}

async fn tx_browser<W: AsyncWrite + Unpin>(
    w: &mut W,
    asrv: &AuthSrv,
    uname: &str,
    vpath: &str,
    absolute_urls: bool,
    head_only: bool,
) -> Result<(), Fault> {
    let listing: Result<(PathBuf, Vec<String>, Vec<String>, bool), Pebkac> = asrv.with_vfs(|vfs| {
        let (node, rem) = vfs.get(vpath, uname, true, false)?;
        let (root, real, virt) = vfs
            .ls(node, &rem, uname)
            .map_err(|e| Pebkac::NotFound(e.to_string()))?;
        Ok((root, real, virt, node.writable_by(uname)))
    });
    let (root, real_names, virt_names, can_upload) = listing?;

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for name in virt_names {
        dirs.push((name, true, 0u64, None::<SystemTime>));
    }
    for name in real_names {
        let meta = match tokio::fs::metadata(root.join(&name)).await {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime = meta.modified().ok();
        if meta.is_dir() {
            dirs.push((name, true, 0, mtime));
        } else {
            files.push((name, false, meta.len(), mtime));
        }
    }
    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut entries = Vec::with_capacity(dirs.len() + files.len());
    for (name, is_dir, size, mtime) in dirs.into_iter().chain(files) {
        let href_name = if is_dir { format!("{}/", name) } else { name.clone() };
        entries.push(templates::ListEntry {
            margin: if is_dir { "DIR" } else { "" },
            href: make_href(vpath, &href_name, absolute_urls),
            display: href_name,
            size,
            mtime: mtime.map(format_http_date).unwrap_or_default(),
        });
    }

    let crumbs = breadcrumbs(vpath, absolute_urls);
    let html = templates::render_browser(vpath, &crumbs, &entries, can_upload);
    respond_bytes(w, 200, "OK", "text/html; charset=utf-8", html.as_bytes(), head_only)
        .await
        .map_err(Fault::Io)
}

async fn tx_file<W: AsyncWrite + Unpin>(
    w: &mut W,
    realpath: &PathBuf,
    meta: std::fs::Metadata,
    head_only: bool,
    headers: &HashMap<String, String>,
) -> Result<(), Fault> {
    let filesize = meta.len();
    let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
    let last_modified_str = format_http_date(mtime);
    let mtime_secs = mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;

    let mut do_send = true;
    if let Some(raw) = headers.get("if-modified-since") {
        if let Some(client_secs) = parse_http_date(raw) {
            do_send = mtime_secs > client_secs;
        }
    }

    let mime = crate::get_mime_type(&realpath.to_string_lossy());

    if !do_send {
        let head = format!(
            "HTTP/1.1 304 Not Modified\r\nConnection: Keep-Alive\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nLast-Modified: {}\r\n\r\n",
            mime, filesize, last_modified_str
        );
        w.write_all(head.as_bytes()).await?;
        w.flush().await?;
        return Ok(());
    }

    let (status, reason, lower, upper, content_range) = if let Some(range) = headers.get("range") {
        let (lo, hi) = parse_range(range, filesize)?;
        (
            206u16,
            "Partial Content",
            lo,
            hi,
            Some(format!("bytes {}-{}/{}", lo, hi.saturating_sub(1), filesize)),
        )
    } else {
        (200u16, "OK", 0u64, filesize, None)
    };

    let mut head = format!(
        "HTTP/1.1 {} {}\r\nConnection: Keep-Alive\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nLast-Modified: {}\r\n",
        status,
        reason,
        mime,
        upper - lower,
        last_modified_str
    );
    if let Some(cr) = &content_range {
        head.push_str(&format!("Content-Range: {}\r\n", cr));
    }
    head.push_str("\r\n");
    w.write_all(head.as_bytes()).await?;

    if head_only {
        w.flush().await?;
        return Ok(());
    }

    let file = tokio::fs::File::open(realpath).await?;
    let mut buffered = tokio::io::BufReader::with_capacity(64 * 1024, file);
    buffered.seek(std::io::SeekFrom::Start(lower)).await?;

    let mut remaining = upper - lower;
    let mut chunk = [0u8; 4096];
    let mut sent = 0u64;
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let n = buffered.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        if let Err(e) = w.write_all(&chunk[..n]).await {
            tracing::warn!(sent, error = %e, "write failed mid-transmission");
            return Err(Fault::Io(e));
        }
        sent += n as u64;
        remaining -= n as u64;
    }
    w.flush().await?;
    Ok(())
}

async fn dispatch_post<S>(
    reader: &mut BufReader<&mut S>,
    cfg: &Config,
    asrv: &AuthSrv,
    uname: &str,
    parsed: ParsedTarget,
    headers: &HashMap<String, String>,
    peer: SocketAddr,
) -> Result<(), Fault>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let content_type = headers
        .get("content-type")
        .cloned()
        .ok_or_else(|| Pebkac::BadRequest("missing Content-Type".into()))?;
    let content_length: u64 = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Pebkac::BadRequest("missing or invalid Content-Length".into()))?;

    if headers
        .get("expect")
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
    {
        reader
            .get_mut()
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await?;
    }

    let lower_ct = content_type.to_ascii_lowercase();
    if lower_ct.contains("multipart/form-data") {
        handle_multipart_post(reader, cfg, asrv, uname, &parsed, &content_type, content_length, peer).await
    } else if lower_ct.starts_with("text/plain") {
        if content_length > MAX_JSON_BODY {
            return Err(Fault::User(Pebkac::BadRequest("json 2big".into())));
        }
        let charset = charset_of(&content_type);
        let mut limited = (&mut *reader).take(content_length);
        let mut body = Vec::new();
        limited.read_to_end(&mut body).await?;

        let text: std::borrow::Cow<str> = if charset.eq_ignore_ascii_case("utf-8") {
            String::from_utf8(body)
                .map(std::borrow::Cow::Owned)
                .map_err(|e| Fault::User(Pebkac::BadRequest(format!("invalid {} body: {}", charset, e))))?
                .into()
        } else {
            // no example in the corpus pulls in a generic charset-transcoding
            // crate; non-utf-8 charsets get a lossy decode rather than a hard
            // failure, matching the original's `bytes.decode(enc, 'replace')`.
            String::from_utf8_lossy(&body).into_owned().into()
        };

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|_| Fault::User(Pebkac::BadRequest("you POSTed invalid json".into())))?;
        tracing::info!(peer = %peer, bytes = text.len(), charset = %charset, "decoded json post body");

        let html = templates::render_message("json received", &format!("decoded {} bytes of {} json", text.len(), charset), Some(&value.to_string()));
        let head = format!(
            "HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
            html.len()
        );
        reader.get_mut().write_all(head.as_bytes()).await?;
        reader.get_mut().write_all(html.as_bytes()).await?;
        reader.get_mut().flush().await?;
        Ok(())
    } else if lower_ct.starts_with("application/octet-stream") {
        Err(Fault::User(Pebkac::Unimplemented(
            "raw binary upload is reserved and not implemented".into(),
        )))
    } else {
        Err(Fault::User(Pebkac::BadRequest(format!(
            "unsupported content-type: {}",
            content_type
        ))))
    }
}

/// Extracts the `charset=` parameter from a `Content-Type` header value,
/// defaulting to `utf-8` when absent. Mirrors `copyparty/httpcli.py`'s
/// `ctype.split('charset')[1].strip(' =').split(';')[0].strip()`.
fn charset_of(content_type: &str) -> String {
    let lower = content_type.to_ascii_lowercase();
    match lower.split("charset").nth(1) {
        Some(rest) => rest
            .trim_start_matches(|c: char| c == ' ' || c == '=')
            .split(';')
            .next()
            .unwrap_or("utf-8")
            .trim()
            .to_string(),
        None => "utf-8".to_string(),
    }
}

struct UploadSummary {
    files: Vec<(String, u64, String)>,
    vpath: String,
}

async fn handle_multipart_post<S>(
    reader: &mut BufReader<&mut S>,
    cfg: &Config,
    asrv: &AuthSrv,
    uname: &str,
    parsed: &ParsedTarget,
    content_type: &str,
    content_length: u64,
    peer: SocketAddr,
) -> Result<(), Fault>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut limited = (&mut *reader).take(content_length);
    let mut parser = MultipartParser::new(&mut limited, content_type)?;

    let act = parser.require("act", 64).await?;

    match act.as_str() {
        "login" => {
            let pwd = parser.require("cppwd", 64).await?;
            parser.drop_rest().await?;
            let cookie_value = if asrv.check_password(&pwd) { pwd } else { "x".to_string() };
            let ok = cookie_value != "x";
            let html = templates::render_message(
                "login",
                if ok { "login ok" } else { "login failed" },
                None,
            );
            let head = format!(
                "HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nSet-Cookie: cppwd={}; Path=/\r\n\r\n",
                html.len(),
                percent_encode(&cookie_value)
            );
            reader.get_mut().write_all(head.as_bytes()).await?;
            reader.get_mut().write_all(html.as_bytes()).await?;
            reader.get_mut().flush().await?;
            Ok(())
        }
        "bput" => {
            let upload_result =
                handle_plain_upload(&mut parser, cfg, asrv, uname, &parsed.vpath, peer).await;
            write_upload_response(reader.get_mut(), upload_result).await
        }
        other => Err(Fault::User(Pebkac::BadRequest(format!(
            "unknown multipart action: {}",
            other
        )))),
    }
}

async fn handle_plain_upload<R: AsyncRead + Unpin>(
    parser: &mut MultipartParser<'_, R>,
    cfg: &Config,
    asrv: &AuthSrv,
    uname: &str,
    vpath: &str,
    peer: SocketAddr,
) -> Result<UploadSummary, Fault> {
    let resolved: Result<(PathBuf, String), Pebkac> = asrv.with_vfs(|vfs| {
        let (node, rem) = vfs.get(vpath, uname, false, true)?;
        Ok((node.realpath.clone(), rem))
    });
    let (realroot, rem) = resolved?;

    if escapes_root(&rem) {
        return Err(Fault::User(Pebkac::BadRequest(
            "resolved upload path escapes mount root".into(),
        )));
    }

    let dest_dir = if rem.is_empty() { realroot } else { realroot.join(&rem) };
    if !dest_dir.is_dir() {
        return Err(Fault::User(Pebkac::NotFound(
            "upload target directory does not exist".into(),
        )));
    }

    let mut files = Vec::new();
    let mut first_error: Option<String> = None;
    let mut total_bytes: u64 = 0;
    let start = std::time::Instant::now();

    loop {
        let part = match parser.next_part().await {
            Ok(Some(p)) => p,
            Ok(None) => break,
            Err(e) => {
                first_error.get_or_insert(e.to_string());
                break;
            }
        };
        let filename = match &part.filename {
            Some(f) => f.clone(),
            None => continue,
        };
        let safe_name = sanitize_filename(&filename);
        if safe_name.is_empty() {
            first_error.get_or_insert("empty filename in post".to_string());
            continue;
        }

        let mut target = dest_dir.join(&safe_name);
        if target.exists() {
            let suffix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros();
            target = dest_dir.join(format!("{}.{}", safe_name, suffix));
        }
        let mut partial_name = target.as_os_str().to_os_string();
        partial_name.push(".PARTIAL");
        let partial_path = PathBuf::from(partial_name);

        let mut file = match tokio::fs::File::create(&partial_path).await {
            Ok(f) => f,
            Err(e) => {
                first_error.get_or_insert(format!("failed to create {}: {}", partial_path.display(), e));
                continue;
            }
        };

        let mut sink = HashingWriter {
            inner: &mut file,
            hasher: Sha512::new(),
            total: 0,
        };
        let copy_result = parser.copy_part_body(&mut sink).await;
        let total = sink.total;
        let digest = format!("{:x}", sink.hasher.clone().finalize());
        let _ = file.flush().await;

        match copy_result {
            Err(e) => {
                first_error.get_or_insert(e.to_string());
            }
            Ok(_) if total == 0 => {
                first_error.get_or_insert("empty files in post".to_string());
            }
            Ok(_) => match tokio::fs::rename(&partial_path, &target).await {
                Ok(()) => {
                    let display_name = target
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or(&safe_name)
                        .to_string();
                    total_bytes += total;
                    files.push((display_name, total, truncate_digest(&digest).to_string()));
                }
                Err(e) => {
                    first_error.get_or_insert(format!("failed to finalize upload: {}", e));
                }
            },
        }
    }

    let elapsed = start.elapsed().as_secs_f64().max(0.000_001);
    let throughput = (total_bytes as f64 / (1024.0 * 1024.0)) / elapsed;
    write_audit_log(cfg, peer, &files, first_error.as_deref(), total_bytes, throughput).await;

    if files.is_empty() {
        if let Some(msg) = first_error {
            return Err(Fault::User(Pebkac::BadRequest(msg)));
        }
    }

    Ok(UploadSummary {
        files,
        vpath: vpath.to_string(),
    })
}

async fn write_audit_log(
    cfg: &Config,
    peer: SocketAddr,
    files: &[(String, u64, String)],
    error: Option<&str>,
    total_bytes: u64,
    throughput_mib_s: f64,
) {
    if let Err(e) = tokio::fs::create_dir_all(&cfg.upload_log_dir).await {
        tracing::warn!(error = %e, "failed to create upload audit log directory");
        return;
    }
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    let path = cfg.upload_log_dir.join(format!("up.{}.txt", ts));

    let mut line = format!("{}\n", peer);
    match error {
        Some(e) => line.push_str(&format!("status: FAILED: {}\n", e)),
        None => line.push_str("status: OK\n"),
    }
    line.push_str(&format!(
        "bytes={} throughput_mib_s={:.3}\n",
        total_bytes, throughput_mib_s
    ));
    for (name, size, digest) in files {
        line.push_str(&format!("{} {} {}\n", name, size, digest));
    }

    if let Err(e) = tokio::fs::write(&path, line).await {
        tracing::warn!(error = %e, path = %path.display(), "failed to write upload audit log");
    }
}

async fn write_upload_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    summary: Result<UploadSummary, Fault>,
) -> Result<(), Fault> {
    let summary = summary?;
    let mut pre = String::new();
    for (name, size, digest) in &summary.files {
        pre.push_str(&format!("{} {} bytes sha512={}\n", name, size, digest));
    }
    let html = templates::render_message(
        "upload complete",
        &format!("{} file(s) uploaded to {}", summary.files.len(), summary.vpath),
        Some(&pre),
    );
    respond_bytes(w, 200, "OK", "text/html; charset=utf-8", html.as_bytes(), false)
        .await
        .map_err(Fault::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Volume};
    use tokio::io::duplex;

    #[test]
    fn percent_decode_handles_valid_and_invalid_escapes() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_encode("a b/c"), "a%20b/c");
    }

    #[test]
    fn parse_query_distinguishes_flags_from_values() {
        let q = parse_query("h&name=value&empty=");
        assert_eq!(q.get("h"), Some(&QueryValue::Flag));
        assert_eq!(q.get("name"), Some(&QueryValue::Str("value".to_string())));
        assert_eq!(q.get("empty"), Some(&QueryValue::Str(String::new())));
    }

    #[test]
    fn parse_cookie_header_splits_on_first_equals() {
        let c = parse_cookie_header("cppwd=abc=def; other=1");
        assert_eq!(c.get("cppwd").unwrap(), "abc=def");
        assert_eq!(c.get("other").unwrap(), "1");
    }

    #[test]
    fn parse_target_sets_absolute_urls_for_non_slash_terminated_path() {
        let t = parse_target("/pub/a%20b.txt?x=1");
        assert_eq!(t.vpath, "/pub/a b.txt");
        assert!(t.absolute_urls);
        assert_eq!(t.query.get("x"), Some(&QueryValue::Str("1".to_string())));

        let t2 = parse_target("/pub/");
        assert!(!t2.absolute_urls);
    }

    #[test]
    fn http_date_format_and_parse_round_trip() {
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let formatted = format_http_date(t);
        let parsed = parse_http_date(&formatted).unwrap();
        assert_eq!(parsed, 1_700_000_000);
    }

    #[test]
    fn parse_http_date_rejects_malformed_input() {
        assert!(parse_http_date("not a date").is_none());
        assert!(parse_http_date("Mon, 02 Jan 2024 15:04:05 GMT").is_none());
    }

    #[test]
    fn parse_range_single_byte_and_full_file_and_rejections() {
        assert_eq!(parse_range("bytes=0-0", 10).unwrap(), (0, 1));
        assert_eq!(parse_range("bytes=0-9", 10).unwrap(), (0, 10));
        assert_eq!(parse_range("bytes=2-5", 10).unwrap(), (2, 6));
        assert!(parse_range("bytes=-", 10).is_err());
        assert!(parse_range("bytes=10-", 10).is_err());
        assert!(parse_range("bytes=20-30", 10).is_err());
    }

    #[test]
    fn sanitize_filename_strips_path_components_and_control_chars() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("a\nb.txt"), "ab.txt");
    }

    fn test_cfg(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default_for_tests();
        cfg.upload_log_dir = dir.join(".sharebox-uploads");
        cfg.volumes.push(Volume {
            src: dir.to_path_buf(),
            mount: "pub".to_string(),
            readable: vec![ANON.to_string()],
            writable: vec![ANON.to_string()],
        });
        cfg
    }

    #[tokio::test]
    async fn get_existing_file_returns_full_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        let cfg = test_cfg(dir.path());
        let asrv = AuthSrv::new(cfg.clone());

        let (mut client, mut server) = duplex(8192);
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();

        let handle = tokio::spawn(async move {
            connection_loop(&mut server, peer, &cfg, &asrv).await;
        });

        client
            .write_all(b"GET /pub/hello.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("hello world"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ranged_get_returns_206_with_requested_slice() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"ABCDEFGHIJ").unwrap();
        let cfg = test_cfg(dir.path());
        let asrv = AuthSrv::new(cfg.clone());

        let (mut client, mut server) = duplex(8192);
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();

        let handle = tokio::spawn(async move {
            connection_loop(&mut server, peer, &cfg, &asrv).await;
        });

        client
            .write_all(b"GET /pub/data.bin HTTP/1.1\r\nRange: bytes=2-5\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 206 Partial Content"));
        assert!(text.contains("Content-Range: bytes 2-5/10"));
        assert!(text.ends_with("CDEF"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn missing_mount_returns_404() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let asrv = AuthSrv::new(cfg.clone());

        let (mut client, mut server) = duplex(8192);
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();

        let handle = tokio::spawn(async move {
            connection_loop(&mut server, peer, &cfg, &asrv).await;
        });

        client
            .write_all(b"GET /nosuchmount/x HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 404 Not Found"));
        handle.await.unwrap();
    }
}
