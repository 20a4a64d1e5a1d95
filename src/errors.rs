//! Error types you might see while setting up, running, or inspecting a
//! container

use thiserror::Error;

/// Errors in user-supplied configuration
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// no security profile with this name
    #[error("unknown security profile {0:?}, expected one of default, restricted, privileged")]
    UnknownProfile(String),

    /// no seccomp profile with this name
    #[error("unknown seccomp profile {0:?}")]
    UnknownSeccompProfile(String),

    /// memory limit could not be parsed
    #[error("invalid memory limit {0:?}, expected a number with an optional k, m, or g suffix")]
    InvalidMemoryLimit(String),

    /// cpu limit could not be parsed
    #[error("invalid cpu limit {0:?}, expected a percentage from 0 to 100")]
    InvalidCpuLimit(String),

    /// volume spec is not `name:container_path[:mode]`
    #[error("invalid volume spec {0:?}, expected name:container_path[:mode]")]
    InvalidVolumeSpec(String),

    /// port spec is not `host:container`
    #[error("invalid port spec {0:?}, expected host_port:container_port")]
    InvalidPortSpec(String),

    /// container id is not usable as a directory name
    #[error("invalid container id {0:?}")]
    InvalidContainerId(String),

    /// image reference could not be parsed
    #[error("invalid image reference format: {0:?}")]
    InvalidReferenceFormat(String),

    /// isolation backend name not recognized
    #[error("unknown isolation backend {0:?}, expected native or simulated")]
    UnknownIsolation(String),
}

/// Errors from the on-disk container metadata store
#[derive(Error, Debug)]
pub enum StoreError {
    /// no container with this id
    #[error("container {0:?} not found")]
    NotFound(String),

    /// storage io error
    #[error("storage io error: {0}")]
    IO(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
}

/// Errors during container image preparation
#[derive(Error, Debug)]
pub enum ImageError {
    /// image is not in the local cache and is not a built-in image
    #[error("image {0:?} not found; only cached images and the built-in alpine and busybox images are available")]
    NotFound(String),

    /// archive entry would land outside the extraction directory
    #[error("path traversal detected in archive entry {0:?}")]
    PathTraversal(String),

    /// storage io error
    #[error("storage io error: {0}")]
    Storage(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// image reference error
    #[error("image reference error: {0}")]
    Reference(#[from] ConfigError),
}

/// Errors from the named volume store
#[derive(Error, Debug)]
pub enum VolumeError {
    /// no volume with this name or id
    #[error("volume {0:?} not found")]
    NotFound(String),

    /// a volume with this name already exists
    #[error("volume {0:?} already exists")]
    AlreadyExists(String),

    /// volume is referenced by a running container
    #[error("volume {volume:?} is still in use by container {container:?}")]
    InUse { volume: String, container: String },

    /// backup file does not exist
    #[error("backup file {0:?} not found")]
    BackupNotFound(std::path::PathBuf),

    /// backup archive entry would land outside the volume
    #[error("path traversal detected in backup entry {0:?}")]
    PathTraversal(String),

    /// volume id is not usable as a directory name
    #[error("invalid volume name {0:?}")]
    InvalidName(String),

    /// storage io error
    #[error("storage io error: {0}")]
    IO(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
}

/// Errors from the local image registry
#[derive(Error, Debug)]
pub enum RegistryError {
    /// no metadata for this image and tag
    #[error("image {0} not found in the local registry")]
    NotFound(String),

    /// image reference error
    #[error("image reference error: {0}")]
    Reference(#[from] ConfigError),

    /// image preparation error
    #[error("image error: {0}")]
    Image(#[from] ImageError),

    /// storage io error
    #[error("storage io error: {0}")]
    IO(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// http server error
    #[error("http server error: {0}")]
    Server(#[from] hyper::Error),

    /// catalog lookup task failed
    #[error("catalog task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Errors that occur while launching, controlling, or observing a container
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// container metadata error
    #[error("{0}")]
    Store(#[from] StoreError),

    /// container image error
    #[error("container image error: {0}")]
    Image(#[from] ImageError),

    /// volume error
    #[error("volume error: {0}")]
    Volume(#[from] VolumeError),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// a container with this id already exists
    #[error("container {0:?} already exists")]
    AlreadyExists(String),

    /// container is already stopped
    #[error("container {0:?} is already stopped")]
    AlreadyStopped(String),

    /// container is not running
    #[error("container {0:?} is not running")]
    NotRunning(String),

    /// container has no log file
    #[error("log file for container {0:?} not found")]
    LogNotFound(String),

    /// container directory disappeared while following its logs
    #[error("container {0:?} was removed")]
    ContainerRemoved(String),

    /// operation needs namespace primitives this host lacks
    #[error("{0} is only supported on Linux hosts with namespace support")]
    Unsupported(&'static str),

    /// mount or unmount failed
    #[error("failed to {op} {target:?}: {source}")]
    Mount {
        op: &'static str,
        target: std::path::PathBuf,
        source: std::io::Error,
    },

    /// pivot_root failed
    #[error("pivot_root into {new_root:?} failed: {source}")]
    PivotRoot {
        new_root: std::path::PathBuf,
        source: std::io::Error,
    },

    /// namespace clone failed
    #[error("failed to clone into new namespaces: {0}")]
    Clone(std::io::Error),

    /// signal delivery failed
    #[error("failed to send signal {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: i32,
        source: std::io::Error,
    },

    /// isolated process reported a setup failure, or exited before finishing
    /// setup
    #[error("container failed to start: {0}")]
    LaunchFailed(String),

    /// a required launch-time environment variable was missing or invalid
    #[error("invalid launch environment variable {0}")]
    LaunchEnvironment(&'static str),

    /// argument string contained internal nul byte
    #[error("argument string contained internal nul byte")]
    NulStringError(#[from] std::ffi::NulError),
}

impl RuntimeError {
    /// True for the typed "does not exist" failures, as opposed to I/O or
    /// isolation errors
    pub fn is_not_found(&self) -> bool {
        match self {
            RuntimeError::Store(StoreError::NotFound(_)) => true,
            RuntimeError::Image(ImageError::NotFound(_)) => true,
            RuntimeError::Volume(VolumeError::NotFound(_)) => true,
            RuntimeError::LogNotFound(_) => true,
            _ => false,
        }
    }
}
