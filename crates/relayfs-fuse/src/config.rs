//! Bridge configuration.

use crate::error::{BridgeError, Result};
use crate::mount::{parse_mount_options, MountOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable enabling per-operation trace lines.
pub const TRACE_ENV: &str = "RELAYFS_TRACE";
/// Environment variable overriding the handoff channel capacity.
pub const CHANNEL_CAPACITY_ENV: &str = "RELAYFS_CHANNEL_CAPACITY";
/// Environment variable holding comma-separated mount options.
pub const MOUNT_OPTIONS_ENV: &str = "RELAYFS_MOUNT_OPTIONS";
/// Environment variable setting the pending request timeout in seconds.
pub const REQUEST_TIMEOUT_ENV: &str = "RELAYFS_REQUEST_TIMEOUT_SECS";

/// Configuration of one bridge session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Capacity of the kernel-to-handler channel. Submissions beyond it fail
    /// with EIO instead of blocking the kernel thread.
    pub channel_capacity: usize,
    /// How long the kernel may cache name lookups.
    pub entry_ttl: Duration,
    /// How long the kernel may cache attributes.
    pub attr_ttl: Duration,
    /// Byte budget of one readdir reply. fuser does not pass the kernel's
    /// buffer size to readdir.
    pub readdir_buffer_size: u32,
    /// Log every operation at debug level.
    pub trace_ops: bool,
    /// Complete requests pending longer than this with ETIMEDOUT. Off by
    /// default.
    pub request_timeout: Option<Duration>,
    /// Filesystem name shown in the mount table.
    pub fsname: String,
    #[serde(skip)]
    pub mount: MountOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            channel_capacity: 1024,
            entry_ttl: Duration::from_secs(1),
            attr_ttl: Duration::from_secs(1),
            readdir_buffer_size: 4096,
            trace_ops: false,
            request_timeout: None,
            fsname: "relayfs".to_string(),
            mount: MountOptions::default(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with the `RELAYFS_*` environment variables. The
    /// environment is read once, here.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`BridgeConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = BridgeConfig::default();
        if let Some(v) = lookup(TRACE_ENV) {
            config.trace_ops = is_truthy(&v);
        }
        if let Some(v) = lookup(CHANNEL_CAPACITY_ENV) {
            config.channel_capacity = v.trim().parse().map_err(|_| BridgeError::InvalidArgument {
                msg: format!("{}: not a number: {}", CHANNEL_CAPACITY_ENV, v),
            })?;
        }
        if let Some(v) = lookup(REQUEST_TIMEOUT_ENV) {
            let secs: u64 = v.trim().parse().map_err(|_| BridgeError::InvalidArgument {
                msg: format!("{}: not a number: {}", REQUEST_TIMEOUT_ENV, v),
            })?;
            config.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = lookup(MOUNT_OPTIONS_ENV) {
            config.mount = parse_mount_options(&v).map_err(|e| BridgeError::InvalidArgument {
                msg: format!("{}: {}", MOUNT_OPTIONS_ENV, e),
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(BridgeError::InvalidArgument {
                msg: "channel_capacity must be at least 1".into(),
            });
        }
        if self.readdir_buffer_size < 512 {
            return Err(BridgeError::InvalidArgument {
                msg: format!(
                    "readdir_buffer_size {} is too small for one entry",
                    self.readdir_buffer_size
                ),
            });
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(BridgeError::InvalidArgument {
                msg: "request_timeout must be nonzero when set".into(),
            });
        }
        if self.fsname.is_empty() || self.fsname.contains(',') {
            return Err(BridgeError::InvalidArgument {
                msg: format!("invalid fsname {:?}", self.fsname),
            });
        }
        Ok(())
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.entry_ttl, Duration::from_secs(1));
        assert_eq!(config.attr_ttl, Duration::from_secs(1));
        assert!(config.request_timeout.is_none());
        assert!(!config.trace_ops);
    }

    #[test]
    fn test_from_lookup_without_vars_is_default() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_trace_flag_from_env() {
        let config = BridgeConfig::from_lookup(lookup(&[(TRACE_ENV, "1")])).unwrap();
        assert!(config.trace_ops);
        let config = BridgeConfig::from_lookup(lookup(&[(TRACE_ENV, "0")])).unwrap();
        assert!(!config.trace_ops);
    }

    #[test]
    fn test_channel_capacity_from_env() {
        let config =
            BridgeConfig::from_lookup(lookup(&[(CHANNEL_CAPACITY_ENV, "16")])).unwrap();
        assert_eq!(config.channel_capacity, 16);
    }

    #[test]
    fn test_zero_channel_capacity_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[(CHANNEL_CAPACITY_ENV, "0")])).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_bad_number_rejected() {
        let err =
            BridgeConfig::from_lookup(lookup(&[(CHANNEL_CAPACITY_ENV, "lots")])).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_request_timeout_from_env() {
        let config = BridgeConfig::from_lookup(lookup(&[(REQUEST_TIMEOUT_ENV, "30")])).unwrap();
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
        let config = BridgeConfig::from_lookup(lookup(&[(REQUEST_TIMEOUT_ENV, "0")])).unwrap();
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn test_mount_options_from_env() {
        let config =
            BridgeConfig::from_lookup(lookup(&[(MOUNT_OPTIONS_ENV, "allow_other,ro")])).unwrap();
        assert!(config.mount.allow_other);
        assert!(config.mount.ro);
        assert!(BridgeConfig::from_lookup(lookup(&[(MOUNT_OPTIONS_ENV, "bogus")])).is_err());
    }

    #[test]
    fn test_tiny_readdir_buffer_rejected() {
        let config = BridgeConfig {
            readdir_buffer_size: 64,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
