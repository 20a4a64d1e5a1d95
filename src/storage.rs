//! Filesystem-backed container metadata
//!
//! Each container owns a directory named after its id, holding a
//! `config.json` record and the `container.log` its process writes to. The
//! record on disk is the only authoritative state. Writers replace the whole
//! file; with concurrent writers the last rename wins, and there is no
//! locking.

use crate::{
    container::{ContainerId, ContainerRecord, ContainerStatus},
    errors::StoreError,
    process,
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

const RECORD_FILE: &str = "config.json";
const LOG_FILE: &str = "container.log";
const ROOTFS_DIR: &str = "rootfs";

#[derive(Clone, Debug)]
pub struct ContainerStore {
    path: PathBuf,
}

impl ContainerStore {
    pub fn new(path: PathBuf) -> Self {
        ContainerStore { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.path.join(id.as_str())
    }

    pub fn record_path(&self, id: &ContainerId) -> PathBuf {
        self.container_dir(id).join(RECORD_FILE)
    }

    pub fn log_path(&self, id: &ContainerId) -> PathBuf {
        self.container_dir(id).join(LOG_FILE)
    }

    pub fn rootfs_path(&self, id: &ContainerId) -> PathBuf {
        self.container_dir(id).join(ROOTFS_DIR)
    }

    /// Is there a state directory for this id, whether or not its record is
    /// readable?
    pub fn exists(&self, id: &ContainerId) -> bool {
        self.container_dir(id).is_dir()
    }

    /// Make the container's directory; idempotent
    pub fn create(&self, id: &ContainerId) -> Result<PathBuf, StoreError> {
        let dir = self.container_dir(id);
        log::debug!("storage create, {:?}", dir);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Persist a record, replacing any previous version in one rename
    pub fn write(&self, record: &ContainerRecord) -> Result<(), StoreError> {
        log::debug!(
            "storage write, {} status={} pid={}",
            record.id,
            record.status,
            record.pid
        );
        let data = serde_json::to_vec_pretty(record)?;
        write_file_atomic(&self.record_path(&record.id), &data)?;
        Ok(())
    }

    pub fn read(&self, id: &ContainerId) -> Result<ContainerRecord, StoreError> {
        let data = match fs::read(self.record_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Every container with a readable, valid record
    ///
    /// Entries that aren't directories, aren't valid ids, or whose record is
    /// missing or corrupt are skipped with a warning rather than failing the
    /// whole listing.
    pub fn list(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let id = match name.to_str().map(ContainerId::parse) {
                Some(Ok(id)) => id,
                _ => {
                    log::warn!("skipping unexpected entry {:?} in container store", name);
                    continue;
                }
            };
            match self.read(&id) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!("skipping container {}: {}", id, err),
            }
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// Correct a record that claims to be running but whose process is gone
    ///
    /// The correction is written back before returning. Records that are
    /// already consistent are returned unchanged, without touching the disk.
    pub fn reconcile(&self, mut record: ContainerRecord) -> Result<ContainerRecord, StoreError> {
        if record.status == ContainerStatus::Running
            && (record.pid == 0 || !process::is_alive(record.pid))
        {
            log::info!(
                "container {} (pid {}) is no longer running, marking stopped",
                record.id,
                record.pid
            );
            record.status = ContainerStatus::Stopped;
            self.write(&record)?;
        }
        Ok(record)
    }

    /// Discard everything stored for a container
    pub fn remove(&self, id: &ContainerId) -> Result<(), StoreError> {
        let dir = self.container_dir(id);
        log::debug!("storage remove, {:?}", dir);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn temp_path_near(dest: &Path) -> PathBuf {
    let pid = std::process::id();
    let ts = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => duration.as_nanos(),
        Err(_) => 0,
    };
    let name = match dest.file_name() {
        Some(name) => format!(".{}.{}.{}.tmp", name.to_string_lossy(), pid, ts),
        None => format!(".{}.{}.tmp", pid, ts),
    };
    dest.with_file_name(name)
}

/// Write a file by way of a temp file in the same directory and a rename
pub(crate) fn write_file_atomic(dest: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = temp_path_near(dest);
    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::mem::drop(file);

        // This part is atomic
        fs::rename(&temp_path, dest)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn temp_store() -> ContainerStore {
        let mut path = std::env::temp_dir();
        path.push(format!("minibox-store-test-{}", rand::random::<u64>()));
        ContainerStore::new(path)
    }

    fn record(store: &ContainerStore, id: &str, pid: u32) -> ContainerRecord {
        let id = ContainerId::parse(id).unwrap();
        ContainerRecord {
            name: id.to_string(),
            log_file: store.log_path(&id),
            id,
            image: "alpine".to_owned(),
            status: ContainerStatus::Running,
            pid,
            created_at: Utc.ymd(2024, 1, 1).and_hms(0, 0, pid % 60),
            volumes: Vec::new(),
            ports: Vec::new(),
            memory: "64m".to_owned(),
            cpu: "10".to_owned(),
            security_profile: "default".to_owned(),
        }
    }

    #[test]
    fn write_then_read() {
        let store = temp_store();
        let rec = record(&store, "one", 1);
        store.create(&rec.id).unwrap();
        store.create(&rec.id).unwrap();
        store.write(&rec).unwrap();
        assert_eq!(store.read(&rec.id).unwrap(), rec);
        assert!(store.exists(&rec.id));
        let leftovers: Vec<_> = fs::read_dir(store.container_dir(&rec.id))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("config.json")]);
        store.remove(&rec.id).unwrap();
        assert!(!store.exists(&rec.id));
        store.remove(&rec.id).unwrap();
        fs::remove_dir_all(store.path()).unwrap();
    }

    #[test]
    fn missing_is_not_found() {
        let store = temp_store();
        let id = ContainerId::parse("ghost").unwrap();
        match store.read(&id) {
            Err(StoreError::NotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_records_are_skipped() {
        let store = temp_store();
        let a = record(&store, "a", 1);
        let c = record(&store, "c", 3);
        for rec in &[&a, &c] {
            store.create(&rec.id).unwrap();
            store.write(rec).unwrap();
        }
        let b = ContainerId::parse("b").unwrap();
        store.create(&b).unwrap();
        fs::write(store.record_path(&b), b"{ not json").unwrap();
        let empty = ContainerId::parse("d").unwrap();
        store.create(&empty).unwrap();
        fs::write(store.path().join("stray-file"), b"").unwrap();

        let ids: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        fs::remove_dir_all(store.path()).unwrap();
    }

    #[test]
    fn reconcile_persists_and_is_idempotent() {
        let store = temp_store();
        let dead = record(&store, "dead", 99_999_999);
        store.create(&dead.id).unwrap();
        store.write(&dead).unwrap();

        let first = store.reconcile(store.read(&dead.id).unwrap()).unwrap();
        assert_eq!(first.status, ContainerStatus::Stopped);
        assert_eq!(store.read(&dead.id).unwrap().status, ContainerStatus::Stopped);
        let second = store.reconcile(store.read(&dead.id).unwrap()).unwrap();
        assert_eq!(second, first);

        let alive = record(&store, "alive", std::process::id());
        store.create(&alive.id).unwrap();
        store.write(&alive).unwrap();
        let checked = store.reconcile(store.read(&alive.id).unwrap()).unwrap();
        assert_eq!(checked.status, ContainerStatus::Running);
        fs::remove_dir_all(store.path()).unwrap();
    }
}
