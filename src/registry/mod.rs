//! Local image catalog, with simulated pull and push and a small read-only
//! HTTP API

mod server;

pub use server::bind;

use crate::{
    errors::{ImageError, RegistryError},
    image::{ImageReference, ImageStore},
    storage::write_file_atomic,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Catalog entry for one tag of an image, kept as
/// `registry/<name>/<tag>.json`
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    pub tag: String,
    pub size: u64,
    pub digest: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ImageInfo {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// `sha256:<hex>` digest of some content
pub fn content_digest(content: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(content))
}

#[derive(Clone, Debug)]
pub struct Registry {
    path: PathBuf,
    images: ImageStore,
}

impl Registry {
    pub fn new(path: PathBuf, images: ImageStore) -> Self {
        Registry { path, images }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn metadata_path(&self, reference: &ImageReference) -> PathBuf {
        self.path
            .join(reference.name())
            .join(format!("{}.json", reference.tag()))
    }

    /// Record an image in the catalog as if it had been downloaded
    ///
    /// Built-in and cached images are placed in the image cache and described
    /// by their tarball's digest and size. Anything else is recorded with a
    /// digest of the reference alone, since there is nothing to download it
    /// from.
    pub fn pull(&self, image: &str) -> Result<ImageInfo, RegistryError> {
        let reference = ImageReference::parse(image)?;
        log::info!("pulling {}", reference);
        let (size, digest) = match self.images.ensure(&reference) {
            Ok(tarball) => {
                let data = fs::read(&tarball)?;
                (data.len() as u64, content_digest(&data))
            }
            Err(ImageError::NotFound(_)) => {
                log::warn!(
                    "no image data available for {}, recording catalog entry only",
                    reference
                );
                (0, content_digest(reference.to_string().as_bytes()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut labels = BTreeMap::new();
        labels.insert("maintainer".to_owned(), "minibox".to_owned());
        let info = ImageInfo {
            name: reference.name().to_owned(),
            tag: reference.tag().to_owned(),
            size,
            digest,
            created_at: Utc::now(),
            labels,
        };
        self.write(&reference, &info)?;
        Ok(info)
    }

    /// Simulated upload of an image known to the catalog or the image cache
    pub fn push(&self, image: &str) -> Result<ImageInfo, RegistryError> {
        let reference = ImageReference::parse(image)?;
        let info = match self.get(&reference) {
            Ok(info) => info,
            Err(RegistryError::NotFound(_)) if self.images.is_cached(&reference) => {
                let data = fs::read(self.images.tarball_path(&reference))?;
                ImageInfo {
                    name: reference.name().to_owned(),
                    tag: reference.tag().to_owned(),
                    size: data.len() as u64,
                    digest: content_digest(&data),
                    created_at: Utc::now(),
                    labels: BTreeMap::new(),
                }
            }
            Err(e) => return Err(e),
        };
        log::info!("pushed {} ({})", reference, info.digest);
        Ok(info)
    }

    /// Catalog entry for an exact name and tag
    pub fn get(&self, reference: &ImageReference) -> Result<ImageInfo, RegistryError> {
        match fs::read(self.metadata_path(reference)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RegistryError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy a catalog entry under a new name and tag
    pub fn tag(&self, source: &str, target: &str) -> Result<ImageInfo, RegistryError> {
        let source = ImageReference::parse(source)?;
        let target = ImageReference::parse(target)?;
        let mut info = self.get(&source)?;
        info.name = target.name().to_owned();
        info.tag = target.tag().to_owned();
        self.write(&target, &info)?;
        log::info!("tagged {} as {}", source, target);
        Ok(info)
    }

    fn write(&self, reference: &ImageReference, info: &ImageInfo) -> Result<(), RegistryError> {
        let path = self.metadata_path(reference);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_file_atomic(&path, &serde_json::to_vec_pretty(info)?)?;
        log::debug!("wrote catalog entry {:?}", path);
        Ok(())
    }

    /// Every readable catalog entry, sorted by name and tag
    pub fn list(&self) -> Result<Vec<ImageInfo>, RegistryError> {
        let repos = match fs::read_dir(&self.path) {
            Ok(repos) => repos,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut images = Vec::new();
        for repo in repos {
            let repo = repo?;
            if !repo.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(repo.path())? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                match fs::read(&path)
                    .map_err(RegistryError::from)
                    .and_then(|data| Ok(serde_json::from_slice::<ImageInfo>(&data)?))
                {
                    Ok(info) => images.push(info),
                    Err(err) => log::warn!("skipping catalog entry {:?}: {}", path, err),
                }
            }
        }
        images.sort_by(|a, b| (&a.name, &a.tag).cmp(&(&b.name, &b.tag)));
        Ok(images)
    }

    /// Distinct image names in the catalog
    pub fn repositories(&self) -> Result<Vec<String>, RegistryError> {
        let mut names: Vec<String> = self.list()?.into_iter().map(|info| info.name).collect();
        names.dedup();
        Ok(names)
    }

    /// Tags recorded for one image name
    pub fn tags(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|info| info.name == name)
            .map(|info| info.tag)
            .collect())
    }
}
