//! Locations of the runtime's durable state

use std::{
    env,
    path::{Path, PathBuf},
};

/// Environment variable that overrides the state root
pub const ROOT_ENV: &str = "MINIBOX_ROOT";

/// State root used when [ROOT_ENV] is unset
pub const DEFAULT_ROOT: &str = "/var/run/minibox";

/// Directory layout under one state root
///
/// Every command re-reads state from these directories; nothing here is
/// cached in memory beyond the paths themselves.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuntimeConfig {
    root: PathBuf,
}

impl RuntimeConfig {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        RuntimeConfig {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Use `$MINIBOX_ROOT` if set, otherwise [DEFAULT_ROOT]
    pub fn from_env() -> Self {
        match env::var(ROOT_ENV) {
            Ok(s) if !s.is_empty() => RuntimeConfig::new(s),
            _ => RuntimeConfig::new(DEFAULT_ROOT),
        }
    }

    /// Set a random, disposable state root in the system temp directory
    pub fn ephemeral() -> Self {
        let mut path = env::temp_dir();
        path.push(format!(
            "minibox-ephemeral-{}-{}",
            std::process::id(),
            rand::random::<u64>()
        ));
        RuntimeConfig::new(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    pub fn seccomp_dir(&self) -> PathBuf {
        self.root.join("seccomp")
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::from_env()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        let config = RuntimeConfig::new("/state");
        assert_eq!(config.containers_dir(), Path::new("/state/containers"));
        assert_eq!(config.images_dir(), Path::new("/state/images"));
        assert_eq!(config.registry_dir(), Path::new("/state/registry"));
        assert_eq!(config.volumes_dir(), Path::new("/state/volumes"));
        assert_eq!(config.seccomp_dir(), Path::new("/state/seccomp"));
    }

    #[test]
    fn ephemeral_roots_differ() {
        assert_ne!(RuntimeConfig::ephemeral(), RuntimeConfig::ephemeral());
    }
}
