//! Static/template surface (C7): embedded `.cpr/*` assets plus the three
//! HTML surfaces the transaction engine renders. Grounded on the template
//! call sites in `copyparty/httpcli.py` (`tpl_mounts`, `tpl_browser`,
//! `tpl_msg`) for which fields each page needs; rendered by direct string
//! building rather than a templating crate, since no example repo in the
//! corpus pulls one in (closest parallel: `epheo-kiss`'s precompiled
//! `HeaderTemplates`, which favors building response bytes directly over
//! indirection through a template engine).

/// Breadcrumb node: `(href, display_name)`.
pub type VpNode = (String, String);

/// One directory-listing row: `(margin, href, display, size, mtime)`.
pub struct ListEntry {
    pub margin: &'static str,
    pub href: String,
    pub display: String,
    pub size: u64,
    pub mtime: String,
}

/// HTML-escapes `s` for safe interpolation into a listing or message page.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

const PAGE_HEAD: &str = "<!doctype html><html><head><meta charset=\"utf-8\">\
<link rel=\"stylesheet\" href=\"/.cpr/style.css\"></head><body>";
const PAGE_TAIL: &str = "</body></html>";

/// Renders the list of mounts visible to the requesting user. Every mount
/// carries a real, non-empty, routable name (`Vfs::get` has no way to match
/// an empty first vpath segment), so hrefs are always `/name/`.
pub fn render_mounts(readable: &[String], writable: &[String]) -> String {
    let mut body = String::new();
    body.push_str("<h1>volumes</h1><ul>");
    for name in readable {
        body.push_str(&format!(
            "<li><a href=\"/{0}/\">{0}</a></li>",
            escape_html(name)
        ));
    }
    for name in writable {
        if readable.contains(name) {
            continue;
        }
        body.push_str(&format!(
            "<li><a href=\"/{0}/\">{0}</a> (upload only)</li>",
            escape_html(name)
        ));
    }
    body.push_str("</ul>");
    format!("{}{}{}", PAGE_HEAD, body, PAGE_TAIL)
}

/// Renders a directory listing: breadcrumbs plus a table of entries.
pub fn render_browser(vdir: &str, vpnodes: &[VpNode], entries: &[ListEntry], can_upload: bool) -> String {
    let mut body = String::new();
    body.push_str("<div class=\"crumbs\">");
    for (href, name) in vpnodes {
        body.push_str(&format!(
            "<a href=\"{}\">{}</a>",
            escape_html(href),
            escape_html(name)
        ));
    }
    body.push_str("</div>");

    body.push_str(&format!("<h1>{}</h1>", escape_html(vdir)));
    if can_upload {
        body.push_str(
            "<form method=\"post\" enctype=\"multipart/form-data\">\
             <input type=\"hidden\" name=\"act\" value=\"bput\">\
             <input type=\"file\" name=\"f\" multiple>\
             <button type=\"submit\">upload</button></form>",
        );
    }

    body.push_str("<table><tr><th></th><th>name</th><th>size</th><th>modified</th></tr>");
    for e in entries {
        body.push_str(&format!(
            "<tr><td>{}</td><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>",
            e.margin,
            escape_html(&e.href),
            escape_html(&e.display),
            e.size,
            escape_html(&e.mtime),
        ));
    }
    body.push_str("</table>");

    format!("{}{}{}", PAGE_HEAD, body, PAGE_TAIL)
}

/// Renders a generic message page (login result, upload result, error).
pub fn render_message(h1: &str, h2: &str, pre: Option<&str>) -> String {
    let mut body = String::new();
    body.push_str(&format!("<h1>{}</h1>", h1));
    body.push_str(&format!("<p>{}</p>", h2));
    if let Some(pre) = pre {
        body.push_str(&format!("<pre>{}</pre>", escape_html(pre)));
    }
    format!("{}{}{}", PAGE_HEAD, body, PAGE_TAIL)
}

/// Renders an error page for a `Pebkac`-kind failure. The body is wrapped
/// in `<pre>` per spec.md §4.5.7 ("its message is delivered to the client
/// wrapped in `<pre>`").
pub fn render_error(message: &str) -> String {
    format!("{}<pre>{}</pre>{}", PAGE_HEAD, escape_html(message), PAGE_TAIL)
}

/// Embedded assets served under `/.cpr/<path>`. Grounded on
/// `copyparty/httpcli.py`'s `os.path.join(E.mod, "web/", self.vpath[5:])`
/// static-asset join, here resolved against an in-binary table instead of
/// a directory on disk.
pub fn asset(path: &str) -> Option<(&'static str, &'static [u8])> {
    match path {
        "style.css" => Some(("text/css; charset=utf-8", include_bytes!("../assets/style.css"))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_neutralizes_markup_characters() {
        assert_eq!(
            escape_html("<script>&\"'</script>"),
            "&lt;script&gt;&amp;&quot;&#x27;&lt;/script&gt;"
        );
    }

    #[test]
    fn render_browser_includes_breadcrumbs_and_rows() {
        let entries = vec![ListEntry {
            margin: "DIR",
            href: "sub/".into(),
            display: "sub".into(),
            size: 0,
            mtime: "2024-01-01 00:00:00".into(),
        }];
        let html = render_browser(
            "pub",
            &[("/".into(), "/".into()), ("/pub/".into(), "pub".into())],
            &entries,
            true,
        );
        assert!(html.contains("sub/"));
        assert!(html.contains("enctype=\"multipart/form-data\""));
    }

    #[test]
    fn asset_lookup_resolves_known_paths_only() {
        assert!(asset("style.css").is_some());
        assert!(asset("does-not-exist.bin").is_none());
    }
}
