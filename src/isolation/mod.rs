//! Putting a process into its own namespaces, root filesystem, and resource
//! group
//!
//! There are two backends behind the [Isolation] trait. [NativeIsolation]
//! makes the real Linux system calls and needs root. [SimulatedIsolation]
//! runs the same launch sequence with ordinary child processes, logging the
//! namespace, mount, and cgroup steps instead of performing them. A backend
//! is chosen once, by [detect()], when a [crate::Runtime] is built.

mod launch;
#[cfg(target_os = "linux")] mod mount;
#[cfg(target_os = "linux")] mod native;
mod simulated;

pub use launch::{report_ready, LaunchEnv, LaunchRequest, VolumeMount, READY_FD};
#[cfg(target_os = "linux")]
pub use native::NativeIsolation;
pub use simulated::SimulatedIsolation;

use crate::{
    cgroup::ResourceGroup, errors::ConfigError, errors::RuntimeError, limits::ResourceLimits,
    security::SecurityProfile,
};
use std::{
    env, fmt,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
};

/// Environment variable that forces a backend, `native` or `simulated`
pub const ISOLATION_ENV: &str = "MINIBOX_ISOLATION";

/// Operating system side of the container lifecycle
pub trait Isolation: fmt::Debug + Send + Sync {
    /// Short backend name, for logs
    fn name(&self) -> &'static str;

    /// Create the resource group for containers launched by this process
    ///
    /// Failure is not fatal; the container runs without limits and a warning
    /// is logged.
    fn create_resource_group(&self, limits: &ResourceLimits) -> Option<ResourceGroup>;

    /// Start the re-executed runtime in new namespaces and wait for it to
    /// report readiness on [READY_FD]
    ///
    /// Returns the pid of the started process, as seen from this process.
    fn spawn(&self, request: &LaunchRequest) -> Result<u32, RuntimeError>;

    /// From inside the new namespaces, make `rootfs` the root filesystem
    fn prepare_rootfs(
        &self,
        rootfs: &Path,
        volumes: &[VolumeMount],
        read_only: bool,
    ) -> Result<(), RuntimeError>;

    /// Apply what we can of a security profile to the current process
    ///
    /// Only no-new-privs and the capability bounding set have an effect on
    /// Linux. Seccomp and AppArmor settings are recorded in the log.
    fn apply_security(&self, profile: &SecurityProfile);

    fn set_hostname(&self, hostname: &str) -> Result<(), RuntimeError>;

    /// Where the container's root directory is visible once
    /// [Isolation::prepare_rootfs()] has returned
    fn container_root(&self, rootfs: &Path) -> PathBuf;

    /// Replace the current process with the container's entry command
    ///
    /// Only returns if the command could not be executed.
    fn run_entrypoint(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> RuntimeError;

    /// Run a command inside the namespaces of a running container, with the
    /// terminal attached
    fn exec_in(&self, pid: u32, command: &[String]) -> Result<ExitStatus, RuntimeError>;
}

/// Which isolation backend to use
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsolationKind {
    Native,
    Simulated,
}

impl std::str::FromStr for IsolationKind {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(IsolationKind::Native),
            "simulated" => Ok(IsolationKind::Simulated),
            _ => Err(ConfigError::UnknownIsolation(s.to_owned())),
        }
    }
}

impl IsolationKind {
    /// Does this host have what the native backend needs?
    ///
    /// That means Linux, a `/proc/self/ns` directory, and an effective uid of
    /// 0.
    pub fn probe() -> Self {
        let native = cfg!(target_os = "linux")
            && Path::new("/proc/self/ns/pid").exists()
            && unsafe { libc::geteuid() } == 0;
        if native {
            IsolationKind::Native
        } else {
            IsolationKind::Simulated
        }
    }

    /// [ISOLATION_ENV] if it's set, otherwise [IsolationKind::probe()]
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var(ISOLATION_ENV) {
            Ok(s) if !s.is_empty() => s.parse(),
            _ => Ok(IsolationKind::probe()),
        }
    }

    pub fn build(self) -> Result<Arc<dyn Isolation>, RuntimeError> {
        match self {
            #[cfg(target_os = "linux")]
            IsolationKind::Native => Ok(Arc::new(NativeIsolation::new())),
            #[cfg(not(target_os = "linux"))]
            IsolationKind::Native => Err(RuntimeError::Unsupported("native isolation")),
            IsolationKind::Simulated => Ok(Arc::new(SimulatedIsolation::new())),
        }
    }
}

/// Pick a backend for this process
pub fn detect() -> Result<Arc<dyn Isolation>, RuntimeError> {
    let kind = IsolationKind::from_env()?;
    log::debug!("using {:?} isolation", kind);
    kind.build()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!("native".parse(), Ok(IsolationKind::Native));
        assert_eq!("Simulated".parse(), Ok(IsolationKind::Simulated));
        assert_eq!(
            "chroot".parse::<IsolationKind>(),
            Err(ConfigError::UnknownIsolation("chroot".to_owned()))
        );
    }

    #[test]
    fn probe_needs_root() {
        if unsafe { libc::geteuid() } != 0 {
            assert_eq!(IsolationKind::probe(), IsolationKind::Simulated);
        }
    }
}
