//! Virtual filesystem: maps logical mount paths to real directories with
//! per-user read/write ACLs. Grounded on the `AuthSrv.vfs` call sites in
//! `copyparty/httpcli.py` (`get`, `ls`, `can_access`, `user_tree`).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::Pebkac;

pub const ANON: &str = "*";

/// One mount point: a real directory plus the users allowed to read/write
/// it, and optional child overlays (a directory within this mount that is
/// itself backed by a different real directory).
#[derive(Debug, Clone)]
pub struct VfsNode {
    pub name: String,
    pub realpath: PathBuf,
    pub readable: HashSet<String>,
    pub writable: HashSet<String>,
    pub children: BTreeMap<String, VfsNode>,
}

impl VfsNode {
    pub fn new(name: impl Into<String>, realpath: impl Into<PathBuf>) -> Self {
        VfsNode {
            name: name.into(),
            realpath: realpath.into(),
            readable: HashSet::new(),
            writable: HashSet::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn readable_by(&self, uname: &str) -> bool {
        self.readable.contains(uname) || (uname != ANON && self.readable.contains(ANON))
    }

    pub fn writable_by(&self, uname: &str) -> bool {
        self.writable.contains(uname) || (uname != ANON && self.writable.contains(ANON))
    }

    /// The real, on-disk path for `remainder` (a `/`-joined path relative to
    /// this node, already undotted by the caller).
    pub fn canonical(&self, remainder: &str) -> PathBuf {
        if remainder.is_empty() {
            self.realpath.clone()
        } else {
            self.realpath.join(remainder)
        }
    }
}

/// The full set of mounts visible to the server, keyed by top-level name.
#[derive(Debug, Clone, Default)]
pub struct Vfs {
    pub mounts: BTreeMap<String, VfsNode>,
}

/// Split `vpath` into segments, ignoring empty segments (so `"a//b/"` is
/// `["a", "b"]`), matching the permissive joining copyparty performs when it
/// walks vpath component by component.
fn segments(vpath: &str) -> Vec<&str> {
    vpath.split('/').filter(|s| !s.is_empty()).collect()
}

impl Vfs {
    pub fn new() -> Self {
        Vfs::default()
    }

    pub fn add_mount(&mut self, node: VfsNode) {
        self.mounts.insert(node.name.clone(), node);
    }

    /// Resolve `(vpath, uname)`, descending through mount overlays as far as
    /// there is a matching child, and returning the node that owns the rest
    /// of the path plus that remainder (joined with `/`).
    ///
    /// Fails with `Pebkac::Forbidden` if `uname` lacks the requested
    /// capability on the matched node, and with `Pebkac::NotFound` if no
    /// mount matches the first path segment at all.
    pub fn get<'a>(
        &'a self,
        vpath: &str,
        uname: &str,
        want_read: bool,
        want_write: bool,
    ) -> Result<(&'a VfsNode, String), Pebkac> {
        let segs = segments(vpath);
        if segs.is_empty() {
            return Err(Pebkac::NotFound("no mount given".into()));
        }

        let mut node = self
            .mounts
            .get(segs[0])
            .ok_or_else(|| Pebkac::NotFound(format!("no such volume: {}", segs[0])))?;
        let mut idx = 1;

        loop {
            if idx >= segs.len() {
                break;
            }
            match node.children.get(segs[idx]) {
                Some(child) => {
                    node = child;
                    idx += 1;
                }
                None => break,
            }
        }

        if want_read && !node.readable_by(uname) {
            return Err(Pebkac::Forbidden(format!("{} is not readable", vpath)));
        }
        if want_write && !node.writable_by(uname) {
            return Err(Pebkac::Forbidden(format!("{} is not writable", vpath)));
        }

        let remainder = segs[idx..].join("/");
        Ok((node, remainder))
    }

    /// `(readable, writable)` for `(vpath, uname)`, never raising.
    pub fn can_access(&self, vpath: &str, uname: &str) -> (bool, bool) {
        let readable = self.get(vpath, uname, true, false).is_ok();
        let writable = self.get(vpath, uname, false, true).is_ok();
        (readable, writable)
    }

    /// Top-level mount names visible to `uname` for the requested
    /// capability.
    pub fn user_tree(&self, uname: &str, readable: bool, writable: bool) -> Vec<String> {
        self.mounts
            .values()
            .filter(|n| {
                (!readable || n.readable_by(uname)) && (!writable || n.writable_by(uname))
            })
            .map(|n| n.name.clone())
            .collect()
    }

    /// List the real entries under `(node, remainder)` plus the names of any
    /// virtual child mounts that sit directly at that remainder, visible to
    /// `uname`. Returns `(real_root, real_entry_names, virtual_entry_names)`.
    pub fn ls(
        &self,
        node: &VfsNode,
        remainder: &str,
        uname: &str,
    ) -> std::io::Result<(PathBuf, Vec<String>, Vec<String>)> {
        let root = node.canonical(remainder);
        let mut real = Vec::new();
        if root.is_dir() {
            for entry in std::fs::read_dir(&root)? {
                let entry = entry?;
                real.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        let mut target = node;
        for seg in segments(remainder) {
            match target.children.get(seg) {
                Some(child) => target = child,
                None => {
                    return Ok((root, real, Vec::new()));
                }
            }
        }

        let virt = target
            .children
            .values()
            .filter(|c| c.readable_by(uname))
            .map(|c| c.name.clone())
            .collect();

        Ok((root, real, virt))
    }
}

/// Collapse `.`/`..` segments out of a path without ever escaping the root;
/// a leading/trailing `/` is preserved as on input. Grounded on the
/// `undot()` contract described in spec.md §4.5.1.
pub fn undot(path: &str) -> String {
    let leading_slash = path.starts_with('/');
    let trailing_slash = path.len() > 1 && path.ends_with('/');

    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }

    let mut result = String::new();
    if leading_slash {
        result.push('/');
    }
    result.push_str(&out.join("/"));
    if trailing_slash && !result.ends_with('/') {
        result.push('/');
    }
    result
}

/// True if `p` refers to a location at or within `root`, used as a
/// defence-in-depth sanity check against resolver bugs before writing an
/// uploaded file to disk (spec.md §4.5.6: "this is just a sanity check").
pub fn escapes_root(rem: &str) -> bool {
    rem.starts_with('/') || rem.starts_with("../") || rem.contains("/../") || rem == ".."
}

#[allow(dead_code)]
pub fn is_within(root: &Path, candidate: &Path) -> bool {
    candidate.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkvfs() -> Vfs {
        let mut vfs = Vfs::new();
        let mut pub_ = VfsNode::new("pub", "/srv/pub");
        pub_.readable.insert(ANON.to_string());
        pub_.writable.insert(ANON.to_string());
        vfs.add_mount(pub_);

        let mut priv_ = VfsNode::new("priv", "/srv/priv");
        priv_.readable.insert("alice".to_string());
        priv_.writable.insert("alice".to_string());
        vfs.add_mount(priv_);
        vfs
    }

    #[test]
    fn undot_collapses_dotdot_without_escaping_root() {
        assert_eq!(undot("/a/b/../c"), "/a/c");
        assert_eq!(undot("/a/../../b"), "/b");
        assert_eq!(undot("a/./b/"), "a/b/");
        assert_eq!(undot(""), "");
        assert!(!undot("/../../etc/passwd").contains(".."));
    }

    #[test]
    fn can_access_matches_user_tree_for_readable_mounts() {
        let vfs = mkvfs();
        let (readable, _writable) = vfs.can_access("pub", "guest");
        assert!(readable);
        assert!(vfs.user_tree("guest", true, false).contains(&"pub".to_string()));

        let (readable, _writable) = vfs.can_access("priv", "guest");
        assert!(!readable);
        assert!(!vfs.user_tree("guest", true, false).contains(&"priv".to_string()));

        let (readable, writable) = vfs.can_access("priv", "alice");
        assert!(readable && writable);
    }

    #[test]
    fn get_rejects_missing_capability() {
        let vfs = mkvfs();
        let err = vfs.get("priv", "guest", true, false).unwrap_err();
        assert!(matches!(err, Pebkac::Forbidden(_)));
    }

    #[test]
    fn get_resolves_remainder_past_mount_name() {
        let vfs = mkvfs();
        let (node, rem) = vfs.get("pub/a/b.txt", "guest", true, false).unwrap();
        assert_eq!(node.name, "pub");
        assert_eq!(rem, "a/b.txt");
    }

    #[test]
    fn escapes_root_detects_traversal_attempts() {
        assert!(escapes_root("/etc/passwd"));
        assert!(escapes_root("../etc/passwd"));
        assert!(escapes_root("a/../../b"));
        assert!(!escapes_root("a/b/c"));
    }
}
