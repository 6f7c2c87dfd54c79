//! Configuration options.
//!
//! The connection-tracking core is configured from a small set of keywords:
//! two init-only sizing parameters for the flow allocator, and two
//! hot-reloadable knobs that tune the expiration engine. A [`ConnTrackConfig`]
//! is parsed once at startup (`load_config`/`default_config`, mirroring the
//! way a host application loads its own runtime configuration); the
//! hot-reloadable subset is then handed to [`HotConfig`], which lives for the
//! tracker's lifetime and can be updated from a config-reload path without
//! tearing down any table.

use crate::error::ConnError;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lower bound (seconds) accepted for `conn_init_timeout`.
pub const IPVS_TIMEOUT_MIN: u64 = 1;
/// Upper bound (seconds) accepted for `conn_init_timeout`.
pub const IPVS_TIMEOUT_MAX: u64 = 24 * 60 * 60;

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> ConnTrackConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: ConnTrackConfig = toml::from_str(&config_str).expect("Invalid config file");
    if let Err(e) = config.validate() {
        log::error!("Invalid conntrack config: {:#?}: {}", config, e);
        panic!("Invalid conntrack config");
    }
    config
}

/// Returns the default configuration.
///
/// ```toml
/// [conntrack]
///     conn_pool_size = 2097152
///     conn_pool_cache = 256
///     conn_init_timeout = 3
///     expire_quiescent_template = false
/// ```
pub fn default_config() -> ConnTrackConfig {
    ConnTrackConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Connection tracking options.
///
/// `conn_pool_size` and `conn_pool_cache` are init-only: they size the
/// allocator's per-socket pool and per-core cache and cannot change once the
/// tracker is built. `conn_init_timeout` and `expire_quiescent_template` are
/// hot-reloadable; see [`HotConfig`].
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnTrackConfig {
    /// Number of flow records in the per-socket pool. Rounded up to a power
    /// of two with a floor of 65,536. Defaults to `2_097_152`.
    #[serde(default = "default_conn_pool_size")]
    pub conn_pool_size: usize,

    /// Number of flow records cached per core. Rounded up to a power of two.
    /// Defaults to `256`.
    #[serde(default = "default_conn_pool_cache")]
    pub conn_pool_cache: usize,

    /// Initial deadline (in seconds) given to a newly constructed flow,
    /// before the protocol layer has had a chance to observe any packets.
    /// Must be strictly between [`IPVS_TIMEOUT_MIN`] and [`IPVS_TIMEOUT_MAX`].
    /// Defaults to `3`.
    #[serde(default = "default_conn_init_timeout")]
    pub conn_init_timeout: u64,

    /// Whether a template whose destination has zero weight should be
    /// proactively invalidated the next time it is checked. Defaults to
    /// `false`.
    #[serde(default = "default_expire_quiescent_template")]
    pub expire_quiescent_template: bool,
}

impl ConnTrackConfig {
    /// Validates the configuration, as `load_config` does on startup and
    /// [`HotConfig::apply`] does on every hot reload.
    pub fn validate(&self) -> Result<(), ConnError> {
        if self.conn_init_timeout <= IPVS_TIMEOUT_MIN || self.conn_init_timeout >= IPVS_TIMEOUT_MAX
        {
            return Err(ConnError::NotSupp);
        }
        Ok(())
    }

    /// Rounds `conn_pool_size` up to a power of two with a 65,536 floor.
    pub fn pool_size(&self) -> usize {
        round_up_pow2(self.conn_pool_size).max(65_536)
    }

    /// Rounds `conn_pool_cache` up to a power of two (minimum 1).
    pub fn pool_cache(&self) -> usize {
        round_up_pow2(self.conn_pool_cache.max(1))
    }
}

fn round_up_pow2(n: usize) -> usize {
    if n <= 1 {
        1
    } else {
        n.next_power_of_two()
    }
}

fn default_conn_pool_size() -> usize {
    2_097_152
}

fn default_conn_pool_cache() -> usize {
    256
}

fn default_conn_init_timeout() -> u64 {
    3
}

fn default_expire_quiescent_template() -> bool {
    false
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        ConnTrackConfig {
            conn_pool_size: default_conn_pool_size(),
            conn_pool_cache: default_conn_pool_cache(),
            conn_init_timeout: default_conn_init_timeout(),
            expire_quiescent_template: default_expire_quiescent_template(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Live, hot-reloadable view of the two reloadable keywords.
///
/// Built once from a [`ConnTrackConfig`] and shared (by reference) across all
/// per-core trackers and the shared template table. A config-reload path
/// calls [`apply`](HotConfig::apply) with a freshly parsed `ConnTrackConfig`;
/// out-of-range values are rejected and logged rather than applied.
#[derive(Debug)]
pub struct HotConfig {
    conn_init_timeout_secs: AtomicU64,
    expire_quiescent_template: AtomicBool,
}

impl HotConfig {
    pub fn new(config: &ConnTrackConfig) -> Self {
        HotConfig {
            conn_init_timeout_secs: AtomicU64::new(config.conn_init_timeout),
            expire_quiescent_template: AtomicBool::new(config.expire_quiescent_template),
        }
    }

    pub fn conn_init_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.conn_init_timeout_secs.load(Ordering::Relaxed))
    }

    pub fn expire_quiescent_template(&self) -> bool {
        self.expire_quiescent_template.load(Ordering::Relaxed)
    }

    /// Applies a freshly parsed config, rejecting it (and logging) if
    /// `conn_init_timeout` falls outside the accepted range.
    pub fn apply(&self, config: &ConnTrackConfig) -> Result<(), ConnError> {
        config.validate().inspect_err(|_| {
            log::error!(
                "Rejected conntrack hot-reload: conn_init_timeout={} out of range",
                config.conn_init_timeout
            );
        })?;
        self.conn_init_timeout_secs
            .store(config.conn_init_timeout, Ordering::Relaxed);
        self.expire_quiescent_template
            .store(config.expire_quiescent_template, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(default_config().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_init_timeout() {
        let mut cfg = default_config();
        cfg.conn_init_timeout = 0;
        assert!(cfg.validate().is_err());
        cfg.conn_init_timeout = IPVS_TIMEOUT_MAX;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pool_sizes_round_to_power_of_two() {
        let mut cfg = default_config();
        cfg.conn_pool_size = 70_000;
        cfg.conn_pool_cache = 200;
        assert_eq!(cfg.pool_size(), 131_072);
        assert_eq!(cfg.pool_cache(), 256);
    }

    #[test]
    fn hot_reload_rejects_bad_value_without_mutating() {
        let cfg = default_config();
        let hot = HotConfig::new(&cfg);
        let before = hot.conn_init_timeout();
        let mut bad = cfg.clone();
        bad.conn_init_timeout = IPVS_TIMEOUT_MAX + 1;
        assert!(hot.apply(&bad).is_err());
        assert_eq!(hot.conn_init_timeout(), before);
    }
}
