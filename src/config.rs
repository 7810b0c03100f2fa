//! Typed startup configuration: CLI flags (via `clap`'s builder API, the
//! style used in `bhuvanprakash-jhol/src/main.rs`) layered over an optional
//! TOML file (`serde`/`toml`, the stack declared by `RMamonts-nfs-mamont`).
//! Built once in `main` and handed to `AuthSrv`/the broker by `Arc` --- no
//! component reaches for an ambient singleton.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 3923;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct Volume {
    pub src: PathBuf,
    pub mount: String,
    pub readable: Vec<String>,
    pub writable: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub workers: usize,
    pub volumes: Vec<Volume>,
    /// username -> password
    pub users: HashMap<String, String>,
    pub quiet: bool,
    /// directory audit logs for uploads are written under.
    pub upload_log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            volumes: Vec::new(),
            users: HashMap::new(),
            quiet: false,
            upload_log_dir: PathBuf::from(".sharebox-uploads"),
        }
    }
}

impl Config {
    #[cfg(test)]
    pub fn default_for_tests() -> Self {
        Config::default()
    }

    /// Parse CLI flags, optionally merging in a TOML file named by `-c`.
    /// CLI flags other than `-c`/`-v` take priority over file values; `-v`
    /// volumes are appended after file volumes.
    pub fn from_args<I, T>(args: I) -> Result<Config, String>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Command::new("sharebox")
            .arg(Arg::new("port").short('p').long("port").value_name("PORT"))
            .arg(
                Arg::new("workers")
                    .short('n')
                    .long("workers")
                    .value_name("N"),
            )
            .arg(
                Arg::new("volume")
                    .short('v')
                    .long("volume")
                    .value_name("SRC:MOUNT:PERMS")
                    .action(ArgAction::Append),
            )
            .arg(Arg::new("config").short('c').long("config").value_name("FILE"))
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .action(ArgAction::SetTrue),
            )
            .get_matches_from(args);

        let mut cfg = if let Some(path) = matches.get_one::<String>("config") {
            FileConfig::load(path)?.into_config()
        } else {
            Config::default()
        };

        if let Some(port) = matches.get_one::<String>("port") {
            cfg.port = port.parse().map_err(|_| format!("bad --port value: {}", port))?;
        }
        if let Some(n) = matches.get_one::<String>("workers") {
            cfg.workers = n.parse().map_err(|_| format!("bad --workers value: {}", n))?;
        }
        if matches.get_flag("quiet") {
            cfg.quiet = true;
        }
        if let Some(vols) = matches.get_many::<String>("volume") {
            for raw in vols {
                cfg.volumes.push(parse_volume_flag(raw)?);
            }
        }

        if cfg.volumes.is_empty() {
            // a mount name must be a routable, non-empty vpath segment --
            // `Vfs::get` rejects an empty first segment outright (vfs.rs),
            // so the zero-config default needs a real name, not "".
            cfg.volumes.push(Volume {
                src: PathBuf::from("./content"),
                mount: "content".to_string(),
                readable: vec!["*".to_string()],
                writable: vec!["*".to_string()],
            });
        }

        Ok(cfg)
    }
}

/// Parses `SRC:MOUNT:PERMS`, e.g. `/srv/pub:pub:rw` or
/// `/srv/priv:priv:alice:rw` (a leading `user:` on the perms segment scopes
/// it to that user instead of anonymous).
fn parse_volume_flag(raw: &str) -> Result<Volume, String> {
    let parts: Vec<&str> = raw.splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(format!(
            "bad --volume value {:?}, expected SRC:MOUNT:PERMS",
            raw
        ));
    }
    let (src, mount, perms) = (parts[0], parts[1], parts[2]);

    let (user, flags) = match perms.split_once(':') {
        Some((u, f)) => (u.to_string(), f),
        None => ("*".to_string(), perms),
    };

    let mut readable = Vec::new();
    let mut writable = Vec::new();
    for flag in flags.chars() {
        match flag {
            'r' => readable.push(user.clone()),
            'w' => writable.push(user.clone()),
            ',' => continue,
            other => return Err(format!("unknown permission flag '{}'", other)),
        }
    }

    Ok(Volume {
        src: PathBuf::from(src),
        mount: mount.to_string(),
        readable,
        writable,
    })
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    server: Option<ServerBlock>,
    #[serde(default)]
    users: HashMap<String, String>,
    #[serde(default)]
    volume: Vec<VolumeBlock>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerBlock {
    port: Option<u16>,
    workers: Option<usize>,
    upload_log_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct VolumeBlock {
    src: PathBuf,
    mount: String,
    #[serde(default)]
    readable: Vec<String>,
    #[serde(default)]
    writable: Vec<String>,
}

impl FileConfig {
    fn load(path: &str) -> Result<FileConfig, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("reading config file {:?}: {}", path, e))?;
        toml::from_str(&text).map_err(|e| format!("parsing config file {:?}: {}", path, e))
    }

    fn into_config(self) -> Config {
        let mut cfg = Config::default();
        if let Some(server) = self.server {
            if let Some(p) = server.port {
                cfg.port = p;
            }
            if let Some(n) = server.workers {
                cfg.workers = n;
            }
            if let Some(dir) = server.upload_log_dir {
                cfg.upload_log_dir = dir;
            }
        }
        cfg.users = self.users;
        cfg.volumes = self
            .volume
            .into_iter()
            .map(|v| Volume {
                src: v.src,
                mount: v.mount,
                readable: v.readable,
                writable: v.writable,
            })
            .collect();
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_volume_flag_with_default_anon_user() {
        let v = parse_volume_flag("/srv/pub:pub:rw").unwrap();
        assert_eq!(v.src, PathBuf::from("/srv/pub"));
        assert_eq!(v.mount, "pub");
        assert_eq!(v.readable, vec!["*"]);
        assert_eq!(v.writable, vec!["*"]);
    }

    #[test]
    fn parses_volume_flag_scoped_to_a_user() {
        let v = parse_volume_flag("/srv/priv:priv:alice:rw").unwrap();
        assert_eq!(v.readable, vec!["alice"]);
        assert_eq!(v.writable, vec!["alice"]);
    }

    #[test]
    fn rejects_malformed_volume_flag() {
        assert!(parse_volume_flag("nocolonshere").is_err());
    }

    #[test]
    fn from_args_falls_back_to_default_content_mount_that_is_actually_routable() {
        let cfg = Config::from_args(["sharebox"]).unwrap();
        assert_eq!(cfg.volumes.len(), 1);
        assert_eq!(cfg.volumes[0].mount, "content");
        assert!(!cfg.volumes[0].mount.is_empty(), "an empty mount name can never match a vpath segment in Vfs::get");

        // the regression this guards against: an empty mount name makes
        // `Vfs::get` unreachable for every vpath, since `segments()` strips
        // empty path components and an empty segment list is always
        // `Err(NotFound)`.
        use crate::vfs::{Vfs, VfsNode, ANON};
        let mut vfs = Vfs::new();
        let mut node = VfsNode::new(cfg.volumes[0].mount.clone(), cfg.volumes[0].src.clone());
        node.readable.insert(ANON.to_string());
        vfs.add_mount(node);
        assert!(vfs.get(&cfg.volumes[0].mount, ANON, true, false).is_ok());
    }

    #[test]
    fn from_args_parses_port_and_workers() {
        let cfg = Config::from_args(["sharebox", "-p", "8080", "-n", "2"]).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.workers, 2);
    }
}
