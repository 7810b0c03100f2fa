//! User table + session table + VFS, reloadable under a single lock.
//! Grounded on `broker_mpw.py`'s `self.asrv.reload()` / `load_sessions()`
//! control-plane calls and `httpcli.py`'s `self.auth.iuser` lookups.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::config::Config;
use crate::vfs::{Vfs, VfsNode, ANON};

/// Builds a `Vfs` from a `Config`'s volume list.
fn build_vfs(cfg: &Config) -> Vfs {
    let mut vfs = Vfs::new();
    for vol in &cfg.volumes {
        let mut node = VfsNode::new(vol.mount.clone(), vol.src.clone());
        for u in &vol.readable {
            node.readable.insert(u.clone());
        }
        for u in &vol.writable {
            node.writable.insert(u.clone());
        }
        vfs.add_mount(node);
    }
    vfs
}

/// Derives this server's ad-hoc session token for `uname`. There is no
/// external session database; the `cppwd` cookie is simply matched against
/// the password table directly (see `AuthSrv::resolve_cookie`), and this
/// token exists so `load_sessions` has something to regenerate without
/// exposing plaintext passwords in the session table itself.
fn session_token(uname: &str, password: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(uname.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

struct Inner {
    vfs: Vfs,
    /// username -> password
    users: HashMap<String, String>,
    /// session token -> username
    iuser: HashMap<String, String>,
}

pub struct AuthSrv {
    cfg: Config,
    inner: RwLock<Inner>,
}

impl AuthSrv {
    pub fn new(cfg: Config) -> Self {
        let vfs = build_vfs(&cfg);
        let users = cfg.users.clone();
        let mut iuser = HashMap::new();
        for (uname, pwd) in &users {
            iuser.insert(session_token(uname, pwd), uname.clone());
        }
        AuthSrv {
            cfg,
            inner: RwLock::new(Inner { vfs, users, iuser }),
        }
    }

    /// Resolve a `cppwd` cookie value to a username: first by session
    /// token, then by direct password match (the ad-hoc deployment case
    /// copyparty itself supports, where `cppwd` *is* the password).
    pub fn resolve_cookie(&self, cppwd: &str) -> String {
        let inner = self.inner.read();
        if let Some(uname) = inner.iuser.get(cppwd) {
            return uname.clone();
        }
        for (uname, pwd) in inner.users.iter() {
            if pwd == cppwd {
                return uname.clone();
            }
        }
        ANON.to_string()
    }

    /// True if `pwd` matches some user's password (used by the login
    /// handler to decide whether to set a real cookie or the `x` sentinel).
    pub fn check_password(&self, pwd: &str) -> bool {
        let inner = self.inner.read();
        inner.users.values().any(|p| p == pwd)
    }

    pub fn with_vfs<R>(&self, f: impl FnOnce(&Vfs) -> R) -> R {
        let inner = self.inner.read();
        f(&inner.vfs)
    }

    /// Rebuild the VFS in place from the current configuration. Mirrors
    /// `AuthSrv.reload()`; logged before/after by the caller.
    pub fn reload(&self) {
        let fresh = build_vfs(&self.cfg);
        let mut inner = self.inner.write();
        inner.vfs = fresh;
    }

    /// Regenerate session tokens for the current user table. Mirrors
    /// `AuthSrv.load_sessions()`, called under the same lock as `reload`.
    pub fn load_sessions(&self) {
        let mut inner = self.inner.write();
        let mut iuser = HashMap::new();
        for (uname, pwd) in inner.users.iter() {
            iuser.insert(session_token(uname, pwd), uname.clone());
        }
        inner.iuser = iuser;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Volume;

    fn test_cfg() -> Config {
        let mut cfg = Config::default_for_tests();
        cfg.users.insert("alice".into(), "hunter2".into());
        cfg.volumes.push(Volume {
            src: "/srv/pub".into(),
            mount: "pub".into(),
            readable: vec![ANON.to_string()],
            writable: vec![ANON.to_string()],
        });
        cfg
    }

    #[test]
    fn resolve_cookie_falls_back_to_plain_password_match() {
        let asrv = AuthSrv::new(test_cfg());
        assert_eq!(asrv.resolve_cookie("hunter2"), "alice");
        assert_eq!(asrv.resolve_cookie("wrong"), ANON);
    }

    #[test]
    fn reload_rebuilds_vfs_from_config() {
        let asrv = AuthSrv::new(test_cfg());
        asrv.with_vfs(|vfs| assert!(vfs.mounts.contains_key("pub")));
        asrv.reload();
        asrv.with_vfs(|vfs| assert!(vfs.mounts.contains_key("pub")));
    }

    #[test]
    fn load_sessions_regenerates_tokens_deterministically() {
        let asrv = AuthSrv::new(test_cfg());
        let before = asrv.resolve_cookie(&session_token("alice", "hunter2"));
        asrv.load_sessions();
        let after = asrv.resolve_cookie(&session_token("alice", "hunter2"));
        assert_eq!(before, after);
        assert_eq!(after, "alice");
    }
}
