use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::remote::Authenticator;

/// Default parallelism for layer upload/download workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default capacity (entries) of the in-memory blob cache.
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Controls the eager pull performed by `Store::open`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutoPull {
    #[default]
    Never,
    Always,
    /// Pull only when no local index exists for the reference.
    Missing,
}

/// Store configuration. Start from [`Options::default`] and chain the
/// builder setters.
#[derive(Clone)]
pub struct Options {
    pub cache_dir: PathBuf,
    pub auto_pull: AutoPull,
    pub concurrency: usize,
    pub compression_enabled: bool,
    /// Compression effort: 1 = fastest, 2 = default, 3 = best.
    pub compression_level: u8,
    pub cache_size: usize,
    /// Key prefixes warmed into the blob cache after open.
    pub prefetch: Vec<String>,
    pub auth: Option<Arc<dyn Authenticator>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            auto_pull: AutoPull::default(),
            concurrency: DEFAULT_CONCURRENCY,
            compression_enabled: false,
            compression_level: 2,
            cache_size: DEFAULT_CACHE_SIZE,
            prefetch: Vec::new(),
            auth: None,
        }
    }
}

impl Options {
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_auto_pull(mut self, mode: AutoPull) -> Self {
        self.auto_pull = mode;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_compression(mut self, enabled: bool, level: u8) -> Self {
        self.compression_enabled = enabled;
        self.compression_level = level;
        self
    }

    #[must_use]
    pub fn with_cache_size(mut self, entries: usize) -> Self {
        self.cache_size = entries;
        self
    }

    #[must_use]
    pub fn with_prefetch(mut self, prefixes: Vec<String>) -> Self {
        self.prefetch = prefixes;
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }
}

/// Resolution order: `CAFS_CACHE_DIR`, `$XDG_DATA_HOME/cafs`,
/// `~/.local/share/cafs`, then `.cafs` as a last resort.
pub fn default_cache_dir() -> PathBuf {
    if let Some(dir) = env::var_os("CAFS_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(xdg) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("cafs");
    }
    if let Some(home) = dirs_next::home_dir() {
        return home.join(".local").join("share").join("cafs");
    }
    PathBuf::from(".cafs")
}

/// Expand a leading `~/` against the user's home directory.
pub(crate) fn expand_path(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn cache_dir_env_override_wins() {
        let previous = env::var_os("CAFS_CACHE_DIR");
        env::set_var("CAFS_CACHE_DIR", "/tmp/cafs-test-root");
        assert_eq!(default_cache_dir(), PathBuf::from("/tmp/cafs-test-root"));
        match previous {
            Some(value) => env::set_var("CAFS_CACHE_DIR", value),
            None => env::remove_var("CAFS_CACHE_DIR"),
        }
    }

    #[test]
    fn tilde_paths_expand_against_home() {
        if let Some(home) = dirs_next::home_dir() {
            assert_eq!(
                expand_path(Path::new("~/cache/cafs")),
                home.join("cache").join("cafs")
            );
        }
        assert_eq!(
            expand_path(Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn builder_setters_compose() {
        let options = Options::default()
            .with_concurrency(0)
            .with_compression(true, 3)
            .with_prefetch(vec!["logs/".to_string()]);
        assert_eq!(options.concurrency, 1, "concurrency is clamped to 1");
        assert!(options.compression_enabled);
        assert_eq!(options.compression_level, 3);
        assert_eq!(options.prefetch, vec!["logs/"]);
        assert_eq!(options.auto_pull, AutoPull::Never);
    }
}
