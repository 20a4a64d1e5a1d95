//! Container lifecycle: run, list, inspect, stop, logs, and exec
//!
//! A container moves from created to running when its isolated process
//! reports that setup succeeded, and from running to stopped when it is
//! stopped or its process is found to be gone. Stopped is final. Every
//! operation starts from the records on disk, so separate invocations of the
//! runtime agree on what exists.

mod builder;
mod init;
mod logs;
mod record;

pub use builder::{RunOptions, RuntimeBuilder, INTERNAL_START};
pub use init::internal_start;
pub use record::{ContainerId, ContainerRecord, ContainerStatus};

use crate::{
    config::{RuntimeConfig, ROOT_ENV},
    errors::{RuntimeError, StoreError},
    image::ImageStore,
    isolation::{Isolation, LaunchEnv, LaunchRequest, ISOLATION_ENV},
    limits::ResourceLimits,
    ports::{self, PortMapping},
    process,
    registry::Registry,
    security::{self, SecurityProfile},
    storage::ContainerStore,
    volume::{VolumeSpec, VolumeStore},
};
use chrono::{SecondsFormat, Utc};
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    process::ExitStatus,
    sync::Arc,
};

/// Entry point for managing containers under one state root
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    store: ContainerStore,
    images: ImageStore,
    volumes: VolumeStore,
    isolation: Arc<dyn Isolation>,
    launcher_program: PathBuf,
    launcher_args: Vec<String>,
}

impl Runtime {
    /// A runtime with default settings, see [RuntimeBuilder::build()]
    pub fn new() -> Result<Self, RuntimeError> {
        RuntimeBuilder::new().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &ContainerStore {
        &self.store
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn volumes(&self) -> &VolumeStore {
        &self.volumes
    }

    pub fn isolation(&self) -> &Arc<dyn Isolation> {
        &self.isolation
    }

    /// The image catalog sharing this runtime's state root
    pub fn registry(&self) -> Registry {
        Registry::new(self.config.registry_dir(), self.images.clone())
    }

    /// Create and start a container
    ///
    /// Returns once the isolated process has reported a successful setup and
    /// the running record is on disk. If anything fails after the container
    /// directory is created, the directory is removed again.
    pub fn run(&self, options: &RunOptions) -> Result<ContainerRecord, RuntimeError> {
        let id = match &options.name {
            Some(name) => ContainerId::parse(name)?,
            None => ContainerId::generate(),
        };
        let volume_specs = options
            .volumes
            .iter()
            .map(|spec| VolumeSpec::parse(spec))
            .collect::<Result<Vec<_>, _>>()?;
        let port_mappings = ports::parse_all(&options.ports)?;
        let profile = SecurityProfile::select(
            &options.security_profile,
            options.privileged,
            options.read_only,
        )?;
        if self.store.exists(&id) {
            return Err(RuntimeError::AlreadyExists(id.to_string()));
        }

        self.store.create(&id)?;
        match self.launch(&id, options, &volume_specs, &port_mappings, profile) {
            Ok(record) => Ok(record),
            Err(err) => {
                log::debug!("launch of {} failed, removing its state: {}", id, err);
                if let Err(cleanup) = self.store.remove(&id) {
                    log::warn!("failed to clean up container {}: {}", id, cleanup);
                }
                Err(err)
            }
        }
    }

    fn launch(
        &self,
        id: &ContainerId,
        options: &RunOptions,
        volume_specs: &[VolumeSpec],
        port_mappings: &[PortMapping],
        profile: SecurityProfile,
    ) -> Result<ContainerRecord, RuntimeError> {
        let log_file = self.store.log_path(id);
        fs::File::create(&log_file)?;
        let rootfs = self
            .images
            .materialize(&options.image, &self.store.rootfs_path(id))?;
        let mounts = volume_specs
            .iter()
            .map(|spec| self.volumes.mount_for(spec))
            .collect::<Result<Vec<_>, _>>()?;

        let limits = ResourceLimits::resolve(&options.memory, &options.cpu);
        if let Err(err) =
            security::seccomp_profile_path(&self.config.seccomp_dir(), &profile.seccomp_profile)
        {
            log::warn!("seccomp profile {}: {}", profile.seccomp_profile, err);
        }
        let group = self.isolation.create_resource_group(&limits);

        let launch_env = LaunchEnv {
            memory: options.memory.clone(),
            cpu: options.cpu.clone(),
            profile: profile.clone(),
            hostname: id.to_string(),
            volumes: mounts,
        };
        let mut env = launch_env.to_env()?;
        env.push((ISOLATION_ENV.to_owned(), self.isolation.name().to_owned()));
        env.push((
            ROOT_ENV.to_owned(),
            self.config.root().to_string_lossy().into_owned(),
        ));
        let mut args = self.launcher_args.clone();
        args.push(rootfs.to_string_lossy().into_owned());

        let pid = self.isolation.spawn(&LaunchRequest {
            program: self.launcher_program.clone(),
            args,
            env,
            log_file: log_file.clone(),
        })?;
        if let Some(group) = group {
            if let Err(err) = group.add_process(pid) {
                log::warn!("failed to add pid {} to {:?}: {}", pid, group.path(), err);
            }
        }
        ports::setup(id.as_str(), port_mappings);

        let record = ContainerRecord {
            id: id.clone(),
            name: options.name.clone().unwrap_or_else(|| id.to_string()),
            image: options.image.clone(),
            status: ContainerStatus::Running,
            pid,
            created_at: Utc::now(),
            volumes: options.volumes.clone(),
            ports: options.ports.clone(),
            memory: options.memory.clone(),
            cpu: options.cpu.clone(),
            log_file,
            security_profile: profile.name,
        };
        if let Err(err) = self.store.write(&record) {
            let _ = process::signal(pid, libc::SIGKILL);
            return Err(err.into());
        }
        log::info!("container {} running with pid {}", id, pid);
        Ok(record)
    }

    /// Every container with a readable record, with liveness reconciled
    pub fn list(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let mut records = Vec::new();
        for record in self.store.list()? {
            records.push(self.store.reconcile(record)?);
        }
        Ok(records)
    }

    /// One container's record, with liveness reconciled
    pub fn inspect(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        let id = ContainerId::parse(id).map_err(|_| StoreError::NotFound(id.to_owned()))?;
        let record = self.store.read(&id)?;
        Ok(self.store.reconcile(record)?)
    }

    /// Stop a running container
    ///
    /// The process gets SIGTERM, then SIGKILL if it is still around after
    /// [process::STOP_GRACE_PERIOD].
    pub async fn stop(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        let mut record = self.inspect(id)?;
        if !record.is_running() {
            return Err(RuntimeError::AlreadyStopped(record.id.to_string()));
        }
        match process::terminate(record.pid, process::STOP_GRACE_PERIOD).await {
            Ok(()) => {}
            Err(RuntimeError::Signal { source, .. })
                if source.raw_os_error() == Some(libc::ESRCH) =>
            {
                log::debug!("pid {} exited before it could be signalled", record.pid);
            }
            Err(err) => return Err(err),
        }
        ports::cleanup(record.id.as_str(), &record.ports);

        record.status = ContainerStatus::Stopped;
        self.store.write(&record)?;
        if let Err(err) = append_stop_marker(&self.store.log_path(&record.id)) {
            log::warn!("failed to append to log for {}: {}", record.id, err);
        }
        log::info!("container {} stopped", record.id);
        Ok(record)
    }

    /// Run a command inside a running container, attached to this terminal
    pub fn exec(&self, id: &str, command: &[String]) -> Result<ExitStatus, RuntimeError> {
        let record = self.inspect(id)?;
        if !record.is_running() {
            return Err(RuntimeError::NotRunning(record.id.to_string()));
        }
        log::debug!("exec {:?} in {} (pid {})", command, record.id, record.pid);
        self.isolation.exec_in(record.pid, command)
    }

    /// Remove a volume, refusing while a running container uses it unless
    /// `force` is set
    pub fn remove_volume(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let containers = self.list()?;
        Ok(self.volumes.remove(name, force, &containers)?)
    }
}

fn append_stop_marker(log_file: &std::path::Path) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(log_file)?;
    write!(
        file,
        "\n[{}] Container stopped\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}
