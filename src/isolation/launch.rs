use crate::{errors::RuntimeError, security::SecurityProfile};
use std::{
    env,
    fs::File,
    io::{self, BufRead, BufReader, Write},
    os::unix::{
        io::{FromRawFd, IntoRawFd, RawFd},
        process::CommandExt,
    },
    path::PathBuf,
    process::Command,
};

/// File descriptor the launched process reports readiness on
pub const READY_FD: RawFd = 3;

const READY_OK: &str = "ok";
const READY_ERROR_PREFIX: &str = "error: ";

const ENV_MEMORY: &str = "MINIBOX_MEMORY";
const ENV_CPU: &str = "MINIBOX_CPU";
const ENV_PROFILE: &str = "MINIBOX_PROFILE";
const ENV_SECCOMP: &str = "MINIBOX_SECCOMP";
const ENV_APPARMOR: &str = "MINIBOX_APPARMOR";
const ENV_NO_NEW_PRIVS: &str = "MINIBOX_NO_NEW_PRIVS";
const ENV_READONLY: &str = "MINIBOX_READONLY";
const ENV_CAPABILITIES: &str = "MINIBOX_CAPABILITIES";
const ENV_HOSTNAME: &str = "MINIBOX_HOSTNAME";
const ENV_VOLUMES: &str = "MINIBOX_VOLUMES";

/// Everything needed to start the re-executed runtime for one container
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Added to the inherited environment
    pub env: Vec<(String, String)>,
    /// Receives the process's stdout and stderr
    pub log_file: PathBuf,
}

/// A host directory to bind into the container
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: PathBuf,
    /// Absolute path inside the container
    pub target: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// Settings handed from the launcher to `internal-start` through
/// `MINIBOX_*` environment variables
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchEnv {
    pub memory: String,
    pub cpu: String,
    pub profile: SecurityProfile,
    pub hostname: String,
    pub volumes: Vec<VolumeMount>,
}

impl LaunchEnv {
    /// Volumes are encoded as a JSON list, since host paths may contain any
    /// separator we could pick
    pub fn to_env(&self) -> Result<Vec<(String, String)>, RuntimeError> {
        let volumes = serde_json::to_string(&self.volumes)?;
        Ok(vec![
            (ENV_MEMORY.to_owned(), self.memory.clone()),
            (ENV_CPU.to_owned(), self.cpu.clone()),
            (ENV_PROFILE.to_owned(), self.profile.name.clone()),
            (ENV_SECCOMP.to_owned(), self.profile.seccomp_profile.clone()),
            (ENV_APPARMOR.to_owned(), self.profile.apparmor_profile.clone()),
            (
                ENV_NO_NEW_PRIVS.to_owned(),
                self.profile.no_new_privs.to_string(),
            ),
            (
                ENV_READONLY.to_owned(),
                self.profile.read_only_rootfs.to_string(),
            ),
            (
                ENV_CAPABILITIES.to_owned(),
                self.profile.capabilities.join(","),
            ),
            (ENV_HOSTNAME.to_owned(), self.hostname.clone()),
            (ENV_VOLUMES.to_owned(), volumes),
        ])
    }

    /// Read the settings back from this process's environment
    pub fn from_env() -> Result<Self, RuntimeError> {
        LaunchEnv::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars<F: Fn(&str) -> Option<String>>(var: F) -> Result<Self, RuntimeError> {
        let flag = |key: &'static str| match var(key).as_deref() {
            Some("true") => Ok(true),
            Some("false") | None => Ok(false),
            Some(_) => Err(RuntimeError::LaunchEnvironment(key)),
        };
        let list = |key: &'static str, sep: char| -> Vec<String> {
            var(key)
                .unwrap_or_default()
                .split(sep)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_owned())
                .collect()
        };
        let volumes: Vec<VolumeMount> = match var(ENV_VOLUMES).as_deref() {
            None | Some("") => Vec::new(),
            Some(json) => serde_json::from_str(json)
                .map_err(|_| RuntimeError::LaunchEnvironment(ENV_VOLUMES))?,
        };
        if volumes.iter().any(|v| !v.target.is_absolute()) {
            return Err(RuntimeError::LaunchEnvironment(ENV_VOLUMES));
        }
        let profile = SecurityProfile {
            name: var(ENV_PROFILE).unwrap_or_else(|| "default".to_owned()),
            seccomp_profile: var(ENV_SECCOMP).unwrap_or_default(),
            apparmor_profile: var(ENV_APPARMOR).unwrap_or_default(),
            capabilities: list(ENV_CAPABILITIES, ','),
            no_new_privs: flag(ENV_NO_NEW_PRIVS)?,
            read_only_rootfs: flag(ENV_READONLY)?,
        };
        Ok(LaunchEnv {
            memory: var(ENV_MEMORY).unwrap_or_default(),
            cpu: var(ENV_CPU).unwrap_or_default(),
            hostname: var(ENV_HOSTNAME).ok_or(RuntimeError::LaunchEnvironment(ENV_HOSTNAME))?,
            profile,
            volumes,
        })
    }
}

/// Replace this process with an entry command, given only the image's
/// environment
///
/// Returns the reason if that isn't possible.
pub(crate) fn exec_entrypoint(
    program: &str,
    args: &[String],
    env: &[(String, String)],
) -> RuntimeError {
    let err = Command::new(program)
        .args(args)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k, v)))
        .exec();
    RuntimeError::LaunchFailed(format!("failed to execute {:?}: {}", program, err))
}

/// A pipe with both ends marked close-on-exec
pub(crate) fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    #[cfg(target_os = "linux")]
    let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let result = unsafe {
        let r = libc::pipe(fds.as_mut_ptr());
        if r == 0 {
            libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
            libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
        }
        r
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// Place `fd` at `target` without close-on-exec
///
/// Runs between fork and exec, so it sticks to async-signal-safe calls.
pub(crate) unsafe fn install_fd(fd: RawFd, target: RawFd) -> libc::c_int {
    if fd == target {
        libc::fcntl(fd, libc::F_SETFD, 0)
    } else {
        libc::dup2(fd, target)
    }
}

/// Block until the launched process has either failed or started its entry
/// command
///
/// The process first writes `ok` once setup is done, or an `error: ` line
/// carrying the failure message. After `ok` the pipe stays open until the
/// entry command is executed, which closes it. A later `error: ` line means
/// that exec failed. End-of-file before `ok` means the process went away
/// before finishing its setup.
pub(crate) fn wait_ready(reader: File) -> Result<(), RuntimeError> {
    let mut reader = BufReader::new(reader);
    let mut ready = false;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim_end();
        if let Some(error) = message.strip_prefix(READY_ERROR_PREFIX) {
            return Err(RuntimeError::LaunchFailed(error.to_owned()));
        } else if message == READY_OK && !ready {
            ready = true;
        } else {
            return Err(RuntimeError::LaunchFailed(format!(
                "unexpected readiness message {:?}",
                message
            )));
        }
    }
    match ready {
        true => Ok(()),
        false => Err(RuntimeError::LaunchFailed(
            "process exited before finishing setup".to_owned(),
        )),
    }
}

/// Tell the launcher how setup went
///
/// After `ok` the pipe is left open but marked close-on-exec, so it closes
/// exactly when the entry command replaces this process. Reporting an error
/// closes it. Does nothing if [READY_FD] isn't open, as when
/// `internal-start` is run by hand or after an error was already reported.
pub fn report_ready(outcome: Result<(), &RuntimeError>) {
    if unsafe { libc::fcntl(READY_FD, libc::F_GETFD) } == -1 {
        log::debug!("no readiness pipe on fd {}", READY_FD);
        return;
    }
    let mut file = unsafe { File::from_raw_fd(READY_FD) };
    let message = match outcome {
        Ok(()) => format!("{}\n", READY_OK),
        Err(RuntimeError::LaunchFailed(reason)) => {
            format!("{}{}\n", READY_ERROR_PREFIX, reason.replace('\n', " "))
        }
        Err(err) => format!("{}{}\n", READY_ERROR_PREFIX, err.to_string().replace('\n', " ")),
    };
    if let Err(err) = file.write_all(message.as_bytes()) {
        log::warn!("failed to report readiness: {}", err);
    }
    if outcome.is_ok() {
        let fd = file.into_raw_fd();
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            log::warn!(
                "failed to mark readiness pipe close-on-exec: {}",
                io::Error::last_os_error()
            );
        }
    }
}
