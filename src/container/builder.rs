use crate::{
    config::RuntimeConfig,
    container::Runtime,
    errors::RuntimeError,
    image::ImageStore,
    isolation::{self, Isolation},
    storage::ContainerStore,
    volume::VolumeStore,
};
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Name of the hidden subcommand the runtime re-executes itself with
pub const INTERNAL_START: &str = "internal-start";

/// Builder for configuring custom [Runtime] instances
#[derive(Default)]
pub struct RuntimeBuilder {
    config: Option<RuntimeConfig>,
    isolation: Option<Arc<dyn Isolation>>,
    launcher: Option<(PathBuf, Vec<String>)>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Keep all state under this directory instead of the default root
    pub fn root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.config = Some(RuntimeConfig::new(root));
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a specific isolation backend instead of probing the host
    pub fn isolation(mut self, isolation: Arc<dyn Isolation>) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Change the command that gets started inside the new namespaces
    ///
    /// The container's rootfs path is appended to `args`. By default this is
    /// the current executable with an `internal-start` argument.
    pub fn launcher_command<P: AsRef<Path>>(mut self, program: P, args: &[&str]) -> Self {
        self.launcher = Some((
            program.as_ref().to_path_buf(),
            args.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }

    /// Construct a [Runtime] using the settings in this builder
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config.unwrap_or_else(RuntimeConfig::from_env);
        let isolation = match self.isolation {
            Some(isolation) => isolation,
            None => isolation::detect()?,
        };
        let (launcher_program, launcher_args) = match self.launcher {
            Some(launcher) => launcher,
            None => (env::current_exe()?, vec![INTERNAL_START.to_owned()]),
        };
        log::debug!(
            "runtime at {:?} with {} isolation",
            config.root(),
            isolation.name()
        );
        Ok(Runtime {
            store: ContainerStore::new(config.containers_dir()),
            images: ImageStore::new(config.images_dir()),
            volumes: VolumeStore::new(config.volumes_dir()),
            config,
            isolation,
            launcher_program,
            launcher_args,
        })
    }
}

/// Settings for one `run`, starting at [RunOptions::new()]
///
/// Volumes are `name:container_path[:mode]` and ports `host:container`.
/// Memory and cpu limits keep the raw strings given by the user; they are
/// interpreted at launch time, with defaults substituted for values that
/// don't parse.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunOptions {
    pub image: String,
    pub name: Option<String>,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub memory: String,
    pub cpu: String,
    pub security_profile: String,
    pub read_only: bool,
    pub privileged: bool,
}

impl RunOptions {
    pub fn new(image: &str) -> Self {
        RunOptions {
            image: image.to_owned(),
            name: None,
            volumes: Vec::new(),
            ports: Vec::new(),
            memory: "64m".to_owned(),
            cpu: "10".to_owned(),
            security_profile: "default".to_owned(),
            read_only: false,
            privileged: false,
        }
    }

    /// Use this as the container id instead of a random one
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn volume(mut self, spec: &str) -> Self {
        self.volumes.push(spec.to_owned());
        self
    }

    pub fn port(mut self, spec: &str) -> Self {
        self.ports.push(spec.to_owned());
        self
    }

    pub fn memory(mut self, memory: &str) -> Self {
        self.memory = memory.to_owned();
        self
    }

    pub fn cpu(mut self, cpu: &str) -> Self {
        self.cpu = cpu.to_owned();
        self
    }

    pub fn security_profile(mut self, name: &str) -> Self {
        self.security_profile = name.to_owned();
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_defaults() {
        let options = RunOptions::new("alpine")
            .name("web")
            .volume("data:/data")
            .port("8080:80")
            .privileged(true);
        assert_eq!(options.name.as_deref(), Some("web"));
        assert_eq!(options.memory, "64m");
        assert_eq!(options.cpu, "10");
        assert_eq!(options.security_profile, "default");
        assert_eq!(options.volumes, vec!["data:/data"]);
        assert_eq!(options.ports, vec!["8080:80"]);
        assert!(options.privileged && !options.read_only);
    }
}
