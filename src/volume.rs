//! Named volumes: host directories that outlive the containers using them

use crate::{
    container::ContainerRecord,
    errors::{ConfigError, VolumeError},
    image::archive,
    isolation::VolumeMount,
    storage::write_file_atomic,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

const RECORD_FILE: &str = "config.json";
const DATA_DIR: &str = "data";

/// Stored description of a volume, kept as `volumes/<id>/config.json`
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub mountpoint: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A `name:container_path[:mode]` request to mount a volume
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSpec {
    pub name: String,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl VolumeSpec {
    /// Parse a volume spec
    ///
    /// The container path must be absolute, and the mode, if present, is
    /// `ro` or `rw`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidVolumeSpec(s.to_owned());
        let parts: Vec<&str> = s.split(':').collect();
        let read_only = match parts.len() {
            2 => false,
            3 => match parts[2] {
                "ro" => true,
                "rw" => false,
                _ => return Err(invalid()),
            },
            _ => return Err(invalid()),
        };
        if !valid_name(parts[0]) || !parts[1].starts_with('/') {
            return Err(invalid());
        }
        Ok(VolumeSpec {
            name: parts[0].to_owned(),
            container_path: PathBuf::from(parts[1]),
            read_only,
        })
    }
}

impl FromStr for VolumeSpec {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VolumeSpec::parse(s)
    }
}

fn valid_name(name: &str) -> bool {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap();
    }
    RE.is_match(name)
}

#[derive(Clone, Debug)]
pub struct VolumeStore {
    path: PathBuf,
}

impl VolumeStore {
    pub fn new(path: PathBuf) -> Self {
        VolumeStore { path }
    }

    fn volume_dir(&self, id: &str) -> PathBuf {
        self.path.join(id)
    }

    /// Make a new, empty volume
    pub fn create(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<Volume, VolumeError> {
        if !valid_name(name) {
            return Err(VolumeError::InvalidName(name.to_owned()));
        }
        if self.list()?.iter().any(|v| v.name == name) || self.volume_dir(name).exists() {
            return Err(VolumeError::AlreadyExists(name.to_owned()));
        }
        let dir = self.volume_dir(name);
        let mountpoint = dir.join(DATA_DIR);
        fs::create_dir_all(&mountpoint)?;
        let volume = Volume {
            id: name.to_owned(),
            name: name.to_owned(),
            driver: "local".to_owned(),
            mountpoint,
            created_at: Utc::now(),
            labels,
        };
        write_file_atomic(&dir.join(RECORD_FILE), &serde_json::to_vec_pretty(&volume)?)?;
        log::info!("created volume {} at {:?}", volume.name, volume.mountpoint);
        Ok(volume)
    }

    /// Every volume with a readable record; corrupt ones are skipped
    pub fn list(&self) -> Result<Vec<Volume>, VolumeError> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut volumes = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let record = entry.path().join(RECORD_FILE);
            match fs::read(&record)
                .map_err(VolumeError::from)
                .and_then(|data| Ok(serde_json::from_slice::<Volume>(&data)?))
            {
                Ok(volume) => volumes.push(volume),
                Err(err) => log::warn!("skipping volume {:?}: {}", entry.file_name(), err),
            }
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    /// Find a volume by name or id
    pub fn get(&self, name_or_id: &str) -> Result<Volume, VolumeError> {
        self.list()?
            .into_iter()
            .find(|v| v.name == name_or_id || v.id == name_or_id)
            .ok_or_else(|| VolumeError::NotFound(name_or_id.to_owned()))
    }

    /// Delete a volume and its data
    ///
    /// Unless `force` is set, this refuses while any running container in
    /// `containers` mounts the volume.
    pub fn remove(
        &self,
        name_or_id: &str,
        force: bool,
        containers: &[ContainerRecord],
    ) -> Result<(), VolumeError> {
        let volume = self.get(name_or_id)?;
        if !force {
            let user = containers.iter().find(|c| {
                c.is_running() && c.volume_names().any(|n| n == volume.name || n == volume.id)
            });
            if let Some(container) = user {
                return Err(VolumeError::InUse {
                    volume: volume.name,
                    container: container.id.to_string(),
                });
            }
        }
        fs::remove_dir_all(self.volume_dir(&volume.id))?;
        log::info!("removed volume {}", volume.name);
        Ok(())
    }

    /// Write the volume's data directory to a `.tar.gz` file
    pub fn backup(&self, name_or_id: &str, backup_path: &Path) -> Result<(), VolumeError> {
        let volume = self.get(name_or_id)?;
        if let Some(parent) = backup_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(backup_path)?;
        archive::pack_dir(&volume.mountpoint, file)?.sync_all()?;
        log::info!("backed up volume {} to {:?}", volume.name, backup_path);
        Ok(())
    }

    /// Unpack a backup made by [VolumeStore::backup()] into the volume's data
    /// directory
    pub fn restore(&self, name_or_id: &str, backup_path: &Path) -> Result<(), VolumeError> {
        let volume = self.get(name_or_id)?;
        let file = match fs::File::open(backup_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VolumeError::BackupNotFound(backup_path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        archive::extract(file, &volume.mountpoint, VolumeError::PathTraversal)?;
        log::info!("restored volume {} from {:?}", volume.name, backup_path);
        Ok(())
    }

    /// Host directory backing a volume spec
    pub fn resolve(&self, spec: &VolumeSpec) -> Result<PathBuf, VolumeError> {
        Ok(self.get(&spec.name)?.mountpoint)
    }

    /// Host-side bind mount for a volume spec
    pub fn mount_for(&self, spec: &VolumeSpec) -> Result<VolumeMount, VolumeError> {
        Ok(VolumeMount {
            source: self.resolve(spec)?,
            target: spec.container_path.clone(),
            read_only: spec.read_only,
        })
    }
}
