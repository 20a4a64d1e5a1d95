use crate::{
    cgroup::{self, ResourceGroup},
    errors::RuntimeError,
    isolation::{
        launch::{exec_entrypoint, install_fd, pipe, wait_ready},
        Isolation, LaunchRequest, VolumeMount, READY_FD,
    },
    limits::ResourceLimits,
    security::SecurityProfile,
};
use std::{
    fs::OpenOptions,
    io,
    os::unix::{io::AsRawFd, process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

/// Isolation for hosts without namespace support, or without root
///
/// The runtime is re-executed as an ordinary child, with the same log
/// redirection and readiness handshake as the native backend, and then
/// replaced by the entry command. Namespace, mount, and cgroup
/// steps are logged and report success.
#[derive(Debug, Default)]
pub struct SimulatedIsolation;

impl SimulatedIsolation {
    pub fn new() -> Self {
        SimulatedIsolation
    }
}

impl Isolation for SimulatedIsolation {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn create_resource_group(&self, limits: &ResourceLimits) -> Option<ResourceGroup> {
        log::info!(
            "simulated: resource group {} with memory.max={} cpu.max={:?}",
            cgroup::group_name(std::process::id()),
            limits.memory_bytes,
            limits.cpu_max()
        );
        None
    }

    fn spawn(&self, request: &LaunchRequest) -> Result<u32, RuntimeError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_file)?;
        let (ready_reader, ready_writer) = pipe()?;
        let ready_fd = ready_writer.as_raw_fd();

        log::info!("simulated: new UTS, PID, mount, network, and IPC namespaces");
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::inherit())
            .stdout(log.try_clone()?)
            .stderr(log);
        unsafe {
            command.pre_exec(move || match install_fd(ready_fd, READY_FD) {
                -1 => Err(io::Error::last_os_error()),
                _ => Ok(()),
            });
        }
        let mut child = command.spawn().map_err(|err| {
            RuntimeError::LaunchFailed(format!(
                "failed to execute {:?}: {}",
                request.program, err
            ))
        })?;
        std::mem::drop(ready_writer);
        log::debug!("spawned pid {} running {:?}", child.id(), request.program);

        if let Err(err) = wait_ready(ready_reader) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }
        Ok(child.id())
    }

    fn prepare_rootfs(
        &self,
        rootfs: &Path,
        volumes: &[VolumeMount],
        read_only: bool,
    ) -> Result<(), RuntimeError> {
        log::info!("simulated: make mounts private, bind {:?} onto itself", rootfs);
        for volume in volumes {
            log::info!(
                "simulated: bind volume {:?} at {:?}{}",
                volume.source,
                volume.target,
                if volume.read_only { " read-only" } else { "" }
            );
        }
        for dir in &["proc", "sys", "tmp"] {
            log::info!("simulated: mount {:?}", rootfs.join(dir));
        }
        log::info!(
            "simulated: pivot_root into {:?}, old root at {:?}",
            rootfs,
            rootfs.join(".pivot_root")
        );
        if read_only {
            log::info!("simulated: remount / read-only");
        }
        Ok(())
    }

    fn apply_security(&self, profile: &SecurityProfile) {
        log::info!(
            "simulated: security profile {}: seccomp={} apparmor={} capabilities={} no_new_privs={} read_only_rootfs={}",
            profile.name,
            profile.seccomp_profile,
            profile.apparmor_profile,
            profile.capabilities.join(","),
            profile.no_new_privs,
            profile.read_only_rootfs
        );
    }

    fn set_hostname(&self, hostname: &str) -> Result<(), RuntimeError> {
        log::info!("simulated: hostname {}", hostname);
        Ok(())
    }

    fn container_root(&self, rootfs: &Path) -> PathBuf {
        rootfs.to_path_buf()
    }

    fn run_entrypoint(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> RuntimeError {
        exec_entrypoint(program, args, env)
    }

    fn exec_in(&self, _pid: u32, _command: &[String]) -> Result<ExitStatus, RuntimeError> {
        Err(RuntimeError::Unsupported("exec"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn temp_log() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("minibox-simulated-test-{}.log", rand::random::<u64>()));
        path
    }

    fn shell(script: &str, log_file: &Path) -> LaunchRequest {
        LaunchRequest {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_owned(), script.to_owned()],
            env: vec![("GREETING".to_owned(), "hello".to_owned())],
            log_file: log_file.to_path_buf(),
        }
    }

    #[test]
    fn spawn_reports_ready() {
        let log = temp_log();
        let isolation = SimulatedIsolation::new();
        let pid = isolation
            .spawn(&shell("echo $GREETING; echo ok >&3; exec 3>&-", &log))
            .unwrap();
        assert!(pid > 0);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while fs::read_to_string(&log).unwrap() != "hello\n" {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        fs::remove_file(&log).unwrap();
    }

    #[test]
    fn spawn_reports_failure() {
        let log = temp_log();
        let isolation = SimulatedIsolation::new();
        match isolation.spawn(&shell("echo 'error: no rootfs' >&3; exit 1", &log)) {
            Err(RuntimeError::LaunchFailed(msg)) => assert_eq!(msg, "no rootfs"),
            other => panic!("unexpected {:?}", other),
        }
        match isolation.spawn(&shell("exit 0", &log)) {
            Err(RuntimeError::LaunchFailed(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        fs::remove_file(&log).unwrap();
    }

    #[test]
    fn exec_is_unsupported() {
        assert!(matches!(
            SimulatedIsolation::new().exec_in(1, &["ls".to_owned()]),
            Err(RuntimeError::Unsupported(_))
        ));
    }
}
