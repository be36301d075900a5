//! Typed view of the recognized mount options.
//!
//! Parsing the kernel's `-o` string and wiring a mount helper around this
//! is deliberately left to the caller; this module only gives every
//! recognized option a typed home and sane defaults.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use stratofs_castore::ObjectDigest;

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("unrecognized mount option {0:?}")]
    UnknownOption(String),
    #[error("invalid value for {option:?}: {value:?}")]
    InvalidValue { option: String, value: String },
}

/// Everything a mount can be tuned with.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// Local cache directory.
    pub cachedir: PathBuf,
    /// Cache byte budget in MiB; 0 disables eviction.
    pub quota_limit: u64,
    /// Level eviction drains to, in MiB; defaults to half the limit.
    pub quota_threshold: Option<u64>,
    /// Proxy groups: members round-robin, groups fail over.
    pub proxies: Vec<Vec<String>>,
    /// Fully qualified repository name.
    pub repo_name: String,
    /// Per-attempt timeout through a proxy, seconds.
    pub timeout: Duration,
    /// Per-attempt timeout on direct connections, seconds.
    pub timeout_direct: Duration,
    /// Path to the repository public key.
    pub pubkey: Option<PathBuf>,
    /// Upper bound on the manifest TTL, minutes.
    pub max_ttl: Option<Duration>,
    /// Pins the trusted root catalog and disables manifest refresh.
    pub root_hash: Option<ObjectDigest>,
    /// Maximum number of simultaneously open files; 0 means unbounded.
    pub nfiles: u64,
    /// Capacity of each in-memory metadata cache, in entries.
    pub memcache: usize,
    /// Lifetime the kernel may cache attributes and dentries.
    pub kcache_timeout: Duration,
    /// Let the kernel do permission checks against the reported modes.
    pub default_permissions: bool,
    /// Share the cache directory with peer mounts.
    pub shared_cache: bool,
    /// Maintain NFS-exportable inode state.
    pub nfs_source: bool,
    /// Accept manifests without verifying their signature.
    pub ignore_signature: bool,
    pub syslog_level: u8,
    pub logfile: Option<PathBuf>,
    pub tracefile: Option<PathBuf>,
    /// Owner the whole tree is presented as.
    pub uid: u32,
    pub gid: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            cachedir: PathBuf::from("/var/cache/stratofs"),
            quota_limit: 0,
            quota_threshold: None,
            proxies: vec![],
            repo_name: String::new(),
            timeout: Duration::from_secs(5),
            timeout_direct: Duration::from_secs(10),
            pubkey: None,
            max_ttl: None,
            root_hash: None,
            nfiles: 0,
            memcache: 16000,
            kcache_timeout: Duration::from_secs(60),
            default_permissions: false,
            shared_cache: false,
            nfs_source: false,
            ignore_signature: false,
            syslog_level: 3,
            logfile: None,
            tracefile: None,
            uid: 0,
            gid: 0,
        }
    }
}

impl ClientSettings {
    /// Applies one `key[=value]` mount option.
    pub fn apply_option(&mut self, option: &str) -> Result<(), SettingsError> {
        let (key, value) = match option.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (option, None),
        };

        match key {
            "cachedir" => self.cachedir = PathBuf::from(required(key, value)?),
            "quota_limit" => self.quota_limit = parse_num(key, required(key, value)?)?,
            "quota_threshold" => {
                self.quota_threshold = Some(parse_num(key, required(key, value)?)?)
            }
            "proxies" => {
                self.proxies = required(key, value)?
                    .split(';')
                    .filter(|group| !group.is_empty())
                    .map(|group| group.split('|').map(str::to_string).collect())
                    .collect()
            }
            "repo_name" => self.repo_name = required(key, value)?.to_string(),
            "timeout" => {
                self.timeout = Duration::from_secs(parse_num(key, required(key, value)?)?)
            }
            "timeout_direct" => {
                self.timeout_direct = Duration::from_secs(parse_num(key, required(key, value)?)?)
            }
            "pubkey" => self.pubkey = Some(PathBuf::from(required(key, value)?)),
            "max_ttl" => {
                self.max_ttl = Some(Duration::from_secs(
                    60 * parse_num::<u64>(key, required(key, value)?)?,
                ))
            }
            "root_hash" => {
                let value = required(key, value)?;
                self.root_hash =
                    Some(
                        ObjectDigest::from_hex(value).map_err(|_| SettingsError::InvalidValue {
                            option: key.to_string(),
                            value: value.to_string(),
                        })?,
                    )
            }
            "nfiles" => self.nfiles = parse_num(key, required(key, value)?)?,
            "memcache" => self.memcache = parse_num(key, required(key, value)?)?,
            "kcache_timeout" => {
                self.kcache_timeout = Duration::from_secs(parse_num(key, required(key, value)?)?)
            }
            "default_permissions" => self.default_permissions = true,
            "shared_cache" => self.shared_cache = true,
            "nfs_source" => self.nfs_source = true,
            "ignore_signature" => self.ignore_signature = true,
            "syslog_level" => self.syslog_level = parse_num(key, required(key, value)?)?,
            "logfile" => self.logfile = Some(PathBuf::from(required(key, value)?)),
            "tracefile" => self.tracefile = Some(PathBuf::from(required(key, value)?)),
            "uid" => self.uid = parse_num(key, required(key, value)?)?,
            "gid" => self.gid = parse_num(key, required(key, value)?)?,
            _ => return Err(SettingsError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    /// Applies a comma-separated option string.
    pub fn apply_options(&mut self, options: &str) -> Result<(), SettingsError> {
        for option in options.split(',').filter(|o| !o.is_empty()) {
            self.apply_option(option)?;
        }
        Ok(())
    }

    /// The effective eviction threshold in bytes.
    pub fn quota_threshold_bytes(&self) -> u64 {
        const MIB: u64 = 1024 * 1024;
        self.quota_threshold.unwrap_or(self.quota_limit / 2) * MIB
    }

    pub fn quota_limit_bytes(&self) -> u64 {
        self.quota_limit * 1024 * 1024
    }
}

fn required<'v>(key: &str, value: Option<&'v str>) -> Result<&'v str, SettingsError> {
    value.ok_or_else(|| SettingsError::InvalidValue {
        option: key.to_string(),
        value: String::new(),
    })
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.parse().map_err(|_| SettingsError::InvalidValue {
        option: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ClientSettings, SettingsError};

    #[test]
    fn parses_option_string() {
        let mut settings = ClientSettings::default();
        settings
            .apply_options(
                "cachedir=/tmp/cache,quota_limit=1000,proxies=http://p1:3128|http://p2:3128;DIRECT,\
                 timeout=3,default_permissions,uid=123,gid=456,kcache_timeout=10",
            )
            .unwrap();

        assert_eq!("/tmp/cache", settings.cachedir.to_str().unwrap());
        assert_eq!(1000, settings.quota_limit);
        assert_eq!(500 * 1024 * 1024, settings.quota_threshold_bytes());
        assert_eq!(
            vec![
                vec!["http://p1:3128".to_string(), "http://p2:3128".to_string()],
                vec!["DIRECT".to_string()],
            ],
            settings.proxies
        );
        assert_eq!(Duration::from_secs(3), settings.timeout);
        assert!(settings.default_permissions);
        assert_eq!(123, settings.uid);
        assert_eq!(456, settings.gid);
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        let mut settings = ClientSettings::default();
        assert_eq!(
            Err(SettingsError::UnknownOption("frobnicate".into())),
            settings.apply_option("frobnicate=1")
        );
        assert!(matches!(
            settings.apply_option("quota_limit=chunky"),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings.apply_option("root_hash=zz"),
            Err(SettingsError::InvalidValue { .. })
        ));
    }
}
