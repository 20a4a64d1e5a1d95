//! Container images: cached root filesystem tarballs and their entry
//! configuration

pub mod archive;
mod builtin;
mod reference;

pub use reference::ImageReference;

use crate::{errors::ImageError, storage::write_file_atomic};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Name of the entry configuration file at the root of every image
pub const CONFIG_FILE: &str = "image-config.json";

pub(crate) const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Entry command and environment stored in an image's `image-config.json`
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

impl ImageConfig {
    /// Read the configuration from an image root, falling back to running
    /// `/bin/sh` with a standard `PATH` when there isn't one
    pub fn load(root: &Path) -> Result<Self, ImageError> {
        let mut config = match fs::read(root.join(CONFIG_FILE)) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("no {} in {:?}, using defaults", CONFIG_FILE, root);
                ImageConfig {
                    name: String::new(),
                    version: "latest".to_owned(),
                    cmd: Vec::new(),
                    env: vec![DEFAULT_PATH.to_owned()],
                }
            }
            Err(e) => return Err(e.into()),
        };
        if config.cmd.is_empty() {
            config.cmd.push("/bin/sh".to_owned());
        }
        Ok(config)
    }

    /// `env` entries split into name and value
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|entry| {
                let mut parts = entry.splitn(2, '=');
                (
                    parts.next().unwrap_or_default().to_owned(),
                    parts.next().unwrap_or_default().to_owned(),
                )
            })
            .filter(|(name, _)| !name.is_empty())
            .collect()
    }
}

/// Local cache of image tarballs, stored as `<name>.tar.gz`
#[derive(Clone, Debug)]
pub struct ImageStore {
    path: PathBuf,
}

impl ImageStore {
    pub fn new(path: PathBuf) -> Self {
        ImageStore { path }
    }

    pub fn tarball_path(&self, reference: &ImageReference) -> PathBuf {
        self.path.join(format!("{}.tar.gz", reference.name()))
    }

    pub fn is_cached(&self, reference: &ImageReference) -> bool {
        self.tarball_path(reference).is_file()
    }

    /// Path to the tarball for this image, synthesizing a built-in image into
    /// the cache if needed
    pub fn ensure(&self, reference: &ImageReference) -> Result<PathBuf, ImageError> {
        let path = self.tarball_path(reference);
        if path.is_file() {
            return Ok(path);
        }
        match builtin::archive(reference.name())? {
            Some(data) => {
                log::info!("creating built-in image {}", reference.name());
                write_file_atomic(&path, &data)?;
                Ok(path)
            }
            None => Err(ImageError::NotFound(reference.to_string())),
        }
    }

    /// Unpack an image into `target`, which becomes the container's root
    /// filesystem
    pub fn materialize(&self, image: &str, target: &Path) -> Result<PathBuf, ImageError> {
        let reference = ImageReference::parse(image)?;
        let tarball = self.ensure(&reference)?;
        log::debug!("extracting {:?} into {:?}", tarball, target);
        let file = fs::File::open(&tarball)?;
        archive::extract(file, target, ImageError::PathTraversal)?;
        Ok(target.to_path_buf())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("minibox-image-{}-{}", tag, rand::random::<u64>()));
        path
    }

    #[test]
    fn materialize_builtin() {
        let store = ImageStore::new(temp_dir("cache"));
        let rootfs = temp_dir("rootfs");
        store.materialize("busybox", &rootfs).unwrap();
        assert!(store.is_cached(&"busybox".parse().unwrap()));

        let shell = fs::read_to_string(rootfs.join("bin/sh")).unwrap();
        assert!(shell.starts_with("#!/bin/sh\n"));
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(rootfs.join("bin/sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        for dir in &["proc", "sys", "dev", "tmp", "usr", "var", "etc"] {
            assert!(rootfs.join(dir).is_dir(), "{}", dir);
        }
        assert!(fs::read_to_string(rootfs.join("etc/os-release"))
            .unwrap()
            .contains("ID=busybox"));

        let config = ImageConfig::load(&rootfs).unwrap();
        assert_eq!(config.name, "busybox");
        assert_eq!(config.version, "1.35.0");
        assert_eq!(config.cmd, vec!["/bin/sh"]);
        assert_eq!(config.env_pairs()[0].0, "PATH");

        fs::remove_dir_all(&rootfs).unwrap();
        fs::remove_dir_all(&store.path).unwrap();
    }

    #[test]
    fn unknown_image() {
        let store = ImageStore::new(temp_dir("cache"));
        match store.materialize("nginx:1.21", &temp_dir("rootfs")) {
            Err(ImageError::NotFound(name)) => assert_eq!(name, "nginx:1.21"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            store.materialize("Not Valid", &temp_dir("rootfs")),
            Err(ImageError::Reference(_))
        ));
    }

    #[test]
    fn default_config() {
        let root = temp_dir("empty");
        let config = ImageConfig::load(&root).unwrap();
        assert_eq!(config.cmd, vec!["/bin/sh"]);
        assert_eq!(
            config.env_pairs(),
            vec![(
                "PATH".to_owned(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_owned()
            )]
        );
    }
}
