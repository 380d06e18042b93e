//! Resolver configuration, a fluent builder in the same style as
//! `ratchet_core::SchedulerConfig`: plain fields, `Default`, chainable setters
//! consuming and returning `Self`. Environment overrides are read once, at
//! `ResolverConfig::default()` construction, mirroring common resolver-library
//! convention.

use std::path::PathBuf;
use std::time::Duration;

/// Resolver tuning knobs: config file locations, per-query expire deadline,
/// and the ephemeral UDP source port range.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    resolv_conf_path: PathBuf,
    hosts_path: PathBuf,
    expire_deadline: Duration,
    source_port_range: (u16, u16),
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let resolv_conf_path = std::env::var("RATCHET_RESOLV_CONF")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/resolv.conf"));
        let hosts_path = std::env::var("RATCHET_HOSTS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/hosts"));

        Self {
            resolv_conf_path,
            hosts_path,
            expire_deadline: Duration::from_secs(30),
            source_port_range: (32768, 60999),
        }
    }
}

impl ResolverConfig {
    pub fn resolv_conf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf_path = path.into();
        self
    }

    pub fn hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_path = path.into();
        self
    }

    pub fn expire_deadline(mut self, deadline: Duration) -> Self {
        self.expire_deadline = deadline;
        self
    }

    pub fn source_port_range(mut self, low: u16, high: u16) -> Self {
        self.source_port_range = (low, high);
        self
    }

    pub(crate) fn resolv_conf(&self) -> &PathBuf {
        &self.resolv_conf_path
    }

    pub(crate) fn hosts(&self) -> &PathBuf {
        &self.hosts_path
    }

    pub(crate) fn expire(&self) -> Duration {
        self.expire_deadline
    }

    pub(crate) fn port_range(&self) -> (u16, u16) {
        self.source_port_range
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_standard_paths_without_env_overrides() {
        let cfg = ResolverConfig::default();
        assert_eq!(cfg.resolv_conf(), &PathBuf::from("/etc/resolv.conf"));
        assert_eq!(cfg.hosts(), &PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn setters_chain() {
        let cfg = ResolverConfig::default()
            .expire_deadline(Duration::from_secs(5))
            .source_port_range(40000, 41000);
        assert_eq!(cfg.expire(), Duration::from_secs(5));
        assert_eq!(cfg.port_range(), (40000, 41000));
    }
}
