//! Server configuration: programmatic defaults, a TOML file layer, and CLI
//! overrides applied on top by the binary.

use crate::error::{Error, Result};
use crate::location::DEFAULT_PORT;
use crate::model::DEFAULT_BUFFER_SIZE;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connections idle longer than this are closed by the dispatcher sweep.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory under which all served trees live.
    pub root: PathBuf,
    /// Readiness-multiplexing loops.
    pub dispatchers: usize,
    /// Threads executing request handling; at least the dispatcher count.
    pub workers: usize,
    pub buffer_size: usize,
    /// Zero disables the idle sweep.
    pub idle_timeout: Duration,
}

impl ServerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let dispatchers = default_dispatchers();
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            root: root.into(),
            dispatchers,
            workers: num_cpus::get().max(dispatchers),
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_dispatchers(mut self, dispatchers: usize) -> Self {
        self.dispatchers = dispatchers;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Overlay the file layer; explicit CLI flags are applied by the caller
    /// afterwards and win.
    pub fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(bind) = file.bind {
            self.bind = bind;
        }
        if let Some(dispatchers) = file.dispatchers {
            self.dispatchers = dispatchers;
        }
        if let Some(workers) = file.workers {
            self.workers = workers;
        }
        if let Some(buffer_size) = file.buffer_size {
            self.buffer_size = buffer_size;
        }
        if let Some(secs) = file.idle_timeout_secs {
            self.idle_timeout = Duration::from_secs(secs);
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.dispatchers == 0 {
            return Err(Error::Config("dispatcher count must be positive".into()));
        }
        if self.workers < self.dispatchers {
            return Err(Error::Config(format!(
                "worker count {} is below the dispatcher count {}",
                self.workers, self.dispatchers
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer size must be positive".into()));
        }
        Ok(())
    }
}

fn default_dispatchers() -> usize {
    (num_cpus::get() / 4).max(1)
}

/// On-disk server configuration, all fields optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub bind: Option<SocketAddr>,
    pub dispatchers: Option<usize>,
    pub workers: Option<usize>,
    pub buffer_size: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::new("/srv/tree");
        config.validate().unwrap();
        assert!(config.workers >= config.dispatchers);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_validate_rejects_bad_counts() {
        assert!(ServerConfig::new(".").with_dispatchers(0).validate().is_err());
        assert!(ServerConfig::new(".")
            .with_dispatchers(4)
            .with_workers(2)
            .validate()
            .is_err());
        assert!(ServerConfig::new(".").with_buffer_size(0).validate().is_err());
    }

    #[test]
    fn test_file_layer_overrides() {
        let file: ConfigFile = toml::from_str(
            r#"
            bind = "0.0.0.0:9100"
            workers = 12
            idle_timeout_secs = 60
            "#,
        )
        .unwrap();

        let mut config = ServerConfig::new(".").with_dispatchers(2);
        config.apply_file(&file);
        assert_eq!(config.bind, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(config.workers, 12);
        assert_eq!(config.dispatchers, 2);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        assert!(toml::from_str::<ConfigFile>("threads = 3").is_err());
    }
}
