use crate::{
    cgroup::{self, ResourceGroup},
    errors::RuntimeError,
    isolation::{
        launch::{exec_entrypoint, install_fd, pipe, wait_ready},
        mount, Isolation, LaunchRequest, VolumeMount, READY_FD,
    },
    limits::ResourceLimits,
    security::SecurityProfile,
};
use std::{
    env,
    ffi::{CString, OsStr},
    fs::OpenOptions,
    io::{self, Read},
    os::unix::{ffi::OsStrExt, io::AsRawFd},
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

const STACK_SIZE: usize = 1024 * 1024;

const NAMESPACE_FLAGS: libc::c_int = libc::CLONE_NEWUTS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWIPC;

/// Isolation using Linux namespaces, pivot_root and cgroup v2
#[derive(Debug, Default)]
pub struct NativeIsolation;

impl NativeIsolation {
    pub fn new() -> Self {
        NativeIsolation
    }
}

/// Everything the cloned child touches, prepared before the clone so the
/// child only has to make async-signal-safe calls
struct ChildContext {
    program: CString,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    log_fd: libc::c_int,
    ready_fd: libc::c_int,
    error_fd: libc::c_int,
}

extern "C" fn child_main(arg: *mut libc::c_void) -> libc::c_int {
    unsafe {
        let context = &*(arg as *const ChildContext);
        if libc::dup2(context.log_fd, 1) == -1
            || libc::dup2(context.log_fd, 2) == -1
            || install_fd(context.ready_fd, READY_FD) == -1
        {
            report_errno(context.error_fd);
        }
        libc::execve(
            context.program.as_ptr(),
            context.argv.as_ptr(),
            context.envp.as_ptr(),
        );
        report_errno(context.error_fd)
    }
}

unsafe fn report_errno(fd: libc::c_int) -> ! {
    let errno = *libc::__errno_location();
    let bytes = errno.to_ne_bytes();
    libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
    libc::_exit(127)
}

fn cstring<S: AsRef<OsStr>>(s: S) -> Result<CString, RuntimeError> {
    Ok(CString::new(s.as_ref().as_bytes())?)
}

fn reap(pid: libc::pid_t) {
    let mut status = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };
}

impl Isolation for NativeIsolation {
    fn name(&self) -> &'static str {
        "native"
    }

    fn create_resource_group(&self, limits: &ResourceLimits) -> Option<ResourceGroup> {
        let name = cgroup::group_name(std::process::id());
        match ResourceGroup::create(Path::new(cgroup::CGROUP_ROOT), &name, limits) {
            Ok(group) => Some(group),
            Err(err) => {
                log::warn!("failed to set up resource group {}: {}", name, err);
                None
            }
        }
    }

    fn spawn(&self, request: &LaunchRequest) -> Result<u32, RuntimeError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_file)?;
        let (ready_reader, ready_writer) = pipe()?;
        let (mut error_reader, error_writer) = pipe()?;

        let program = cstring(&request.program)?;
        let mut args = vec![program.clone()];
        for arg in &request.args {
            args.push(cstring(arg)?);
        }
        let mut vars = Vec::new();
        for (key, value) in env::vars_os() {
            if request.env.iter().all(|(k, _)| OsStr::new(k) != key) {
                let mut pair = key;
                pair.push("=");
                pair.push(value);
                vars.push(cstring(pair)?);
            }
        }
        for (key, value) in &request.env {
            vars.push(cstring(format!("{}={}", key, value))?);
        }
        let null_terminated = |strings: &[CString]| {
            let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
            ptrs.push(std::ptr::null());
            ptrs
        };
        let context = ChildContext {
            argv: null_terminated(&args),
            envp: null_terminated(&vars),
            program,
            log_fd: log.as_raw_fd(),
            ready_fd: ready_writer.as_raw_fd(),
            error_fd: error_writer.as_raw_fd(),
        };

        let mut stack = vec![0u8; STACK_SIZE];
        let pid = unsafe {
            let stack_top = stack.as_mut_ptr().add(STACK_SIZE) as usize & !0xf;
            libc::clone(
                child_main,
                stack_top as *mut libc::c_void,
                NAMESPACE_FLAGS | libc::SIGCHLD,
                &context as *const ChildContext as *mut libc::c_void,
            )
        };
        if pid == -1 {
            return Err(RuntimeError::Clone(io::Error::last_os_error()));
        }
        std::mem::drop(ready_writer);
        std::mem::drop(error_writer);
        std::mem::drop(log);
        log::debug!("cloned pid {} running {:?}", pid, request.program);

        let mut errno = [0u8; 4];
        match error_reader.read(&mut errno)? {
            0 => {}
            _ => {
                reap(pid);
                let err = io::Error::from_raw_os_error(i32::from_ne_bytes(errno));
                return Err(RuntimeError::LaunchFailed(format!(
                    "failed to execute {:?}: {}",
                    request.program, err
                )));
            }
        }
        if let Err(err) = wait_ready(ready_reader) {
            reap(pid);
            return Err(err);
        }
        Ok(pid as u32)
    }

    fn prepare_rootfs(
        &self,
        rootfs: &Path,
        volumes: &[VolumeMount],
        read_only: bool,
    ) -> Result<(), RuntimeError> {
        mount::prepare_rootfs(rootfs, volumes, read_only)
    }

    fn apply_security(&self, profile: &SecurityProfile) {
        log::info!(
            "applying security profile {}: seccomp={} apparmor={} capabilities={} no_new_privs={} read_only_rootfs={}",
            profile.name,
            profile.seccomp_profile,
            profile.apparmor_profile,
            profile.capabilities.join(","),
            profile.no_new_privs,
            profile.read_only_rootfs
        );
        if !profile.has_all_capabilities() {
            drop_bounding_capabilities(profile.capability_mask());
        }
        if profile.no_new_privs && unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            log::warn!("failed to set no_new_privs: {}", io::Error::last_os_error());
        }
    }

    fn set_hostname(&self, hostname: &str) -> Result<(), RuntimeError> {
        Ok(mount::set_hostname(hostname)?)
    }

    fn container_root(&self, _rootfs: &Path) -> PathBuf {
        PathBuf::from("/")
    }

    fn run_entrypoint(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> RuntimeError {
        exec_entrypoint(program, args, env)
    }

    fn exec_in(&self, pid: u32, command: &[String]) -> Result<ExitStatus, RuntimeError> {
        let status = Command::new("nsenter")
            .arg("-m")
            .arg("-u")
            .arg("-i")
            .arg("-n")
            .arg("-p")
            .arg("-t")
            .arg(pid.to_string())
            .arg("-r")
            .args(command)
            .status()?;
        Ok(status)
    }
}

/// Remove capabilities outside `keep` from the bounding set, so the entry
/// command can't gain them
fn drop_bounding_capabilities(keep: u64) {
    for cap in 0..64 {
        if keep & (1 << cap) != 0 {
            continue;
        }
        if unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINVAL) {
                // past the last capability this kernel knows
                break;
            }
            log::warn!("failed to drop capability {}: {}", cap, err);
        }
    }
}
