//! Named security profiles and their translation into launch settings

use crate::errors::{ConfigError, RuntimeError};
use serde_json::json;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Capability sentinel meaning every capability is retained
pub const ALL_CAPABILITIES: &str = "ALL";

/// A bundle of capability, seccomp, AppArmor, no-new-privs, and read-only
/// root settings applied to a container at launch
///
/// Profiles are built fresh for each launch by [SecurityProfile::select()]
/// and then passed by value; nothing mutates a profile after its overrides
/// have been applied.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub name: String,
    pub seccomp_profile: String,
    pub apparmor_profile: String,
    pub capabilities: Vec<String>,
    pub no_new_privs: bool,
    pub read_only_rootfs: bool,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}

impl SecurityProfile {
    /// The general purpose profile, used when nothing else is asked for
    pub fn default_profile() -> Self {
        SecurityProfile {
            name: "default".to_owned(),
            seccomp_profile: "default".to_owned(),
            apparmor_profile: "minibox-default".to_owned(),
            capabilities: names(&[
                "CHOWN",
                "DAC_OVERRIDE",
                "FSETID",
                "FOWNER",
                "MKNOD",
                "NET_RAW",
                "SETGID",
                "SETUID",
                "SETFCAP",
                "SETPCAP",
                "NET_BIND_SERVICE",
                "SYS_CHROOT",
                "KILL",
                "AUDIT_WRITE",
            ]),
            no_new_privs: true,
            read_only_rootfs: false,
        }
    }

    /// A smaller capability set, a tighter syscall list, and a read-only root
    pub fn restricted() -> Self {
        SecurityProfile {
            name: "restricted".to_owned(),
            seccomp_profile: "restricted".to_owned(),
            apparmor_profile: "minibox-restricted".to_owned(),
            capabilities: names(&[
                "CHOWN",
                "DAC_OVERRIDE",
                "FSETID",
                "FOWNER",
                "NET_BIND_SERVICE",
                "SETGID",
                "SETUID",
            ]),
            no_new_privs: true,
            read_only_rootfs: true,
        }
    }

    /// Everything allowed, nothing confined
    pub fn privileged() -> Self {
        SecurityProfile {
            name: "privileged".to_owned(),
            seccomp_profile: "unconfined".to_owned(),
            apparmor_profile: "unconfined".to_owned(),
            capabilities: names(&[ALL_CAPABILITIES]),
            no_new_privs: false,
            read_only_rootfs: false,
        }
    }

    /// Find a built-in profile by name, ignoring case
    pub fn lookup(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "default" => Ok(SecurityProfile::default_profile()),
            "restricted" => Ok(SecurityProfile::restricted()),
            "privileged" => Ok(SecurityProfile::privileged()),
            _ => Err(ConfigError::UnknownProfile(name.to_owned())),
        }
    }

    /// Build the profile for one launch
    ///
    /// `privileged` replaces whatever profile was named, then `read_only`
    /// forces a read-only root on top of the result.
    pub fn select(name: &str, privileged: bool, read_only: bool) -> Result<Self, ConfigError> {
        let mut profile = if privileged {
            SecurityProfile::privileged()
        } else {
            SecurityProfile::lookup(name)?
        };
        if read_only {
            profile.read_only_rootfs = true;
        }
        Ok(profile)
    }

    pub fn has_all_capabilities(&self) -> bool {
        self.capabilities.iter().any(|c| c == ALL_CAPABILITIES)
    }

    /// Capability names as a bitmask of kernel capability numbers
    ///
    /// `ALL` sets every bit. Names we don't recognize contribute nothing.
    pub fn capability_mask(&self) -> u64 {
        capability_mask(&self.capabilities)
    }
}

impl Default for SecurityProfile {
    fn default() -> Self {
        SecurityProfile::default_profile()
    }
}

/// Kernel capability number for a name like `NET_RAW` or `CAP_NET_RAW`
pub fn capability_number(name: &str) -> Option<u32> {
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("CAP_").unwrap_or(&upper);
    Some(match bare {
        "CHOWN" => 0,
        "DAC_OVERRIDE" => 1,
        "DAC_READ_SEARCH" => 2,
        "FOWNER" => 3,
        "FSETID" => 4,
        "KILL" => 5,
        "SETGID" => 6,
        "SETUID" => 7,
        "SETPCAP" => 8,
        "LINUX_IMMUTABLE" => 9,
        "NET_BIND_SERVICE" => 10,
        "NET_BROADCAST" => 11,
        "NET_ADMIN" => 12,
        "NET_RAW" => 13,
        "IPC_LOCK" => 14,
        "IPC_OWNER" => 15,
        "SYS_MODULE" => 16,
        "SYS_RAWIO" => 17,
        "SYS_CHROOT" => 18,
        "SYS_PTRACE" => 19,
        "SYS_PACCT" => 20,
        "SYS_ADMIN" => 21,
        "SYS_BOOT" => 22,
        "SYS_NICE" => 23,
        "SYS_RESOURCE" => 24,
        "SYS_TIME" => 25,
        "SYS_TTY_CONFIG" => 26,
        "MKNOD" => 27,
        "LEASE" => 28,
        "AUDIT_WRITE" => 29,
        "AUDIT_CONTROL" => 30,
        "SETFCAP" => 31,
        "MAC_OVERRIDE" => 32,
        "MAC_ADMIN" => 33,
        "SYSLOG" => 34,
        "WAKE_ALARM" => 35,
        "BLOCK_SUSPEND" => 36,
        "AUDIT_READ" => 37,
        _ => return None,
    })
}

pub fn capability_mask<S: AsRef<str>>(capabilities: &[S]) -> u64 {
    let mut mask = 0;
    for name in capabilities {
        if name.as_ref() == ALL_CAPABILITIES {
            return u64::MAX;
        }
        if let Some(number) = capability_number(name.as_ref()) {
            mask |= 1 << number;
        }
    }
    mask
}

const DEFAULT_SYSCALLS: &[&str] = &[
    "accept", "access", "arch_prctl", "bind", "brk", "capget", "capset", "chdir", "chmod",
    "chown", "clone", "close", "connect", "dup", "dup2", "dup3", "epoll_create", "epoll_ctl",
    "epoll_wait", "execve", "exit", "exit_group", "faccessat", "fadvise64", "fchdir", "fchmod",
    "fcntl", "fdatasync", "flock", "fork", "fstat", "fstatfs", "fsync", "futex", "getcwd",
    "getdents", "getdents64", "getegid", "geteuid", "getgid", "getpeername", "getpgrp",
    "getpid", "getppid", "getpriority", "getrandom", "getresgid", "getresuid", "getrlimit",
    "getrusage", "getsockname", "getsockopt", "gettid", "gettimeofday", "getuid", "listen",
    "lseek", "madvise", "mkdir", "mknod", "mmap", "mprotect", "munmap", "nanosleep", "open",
    "openat", "pipe", "pipe2", "poll", "prctl", "pread64", "prlimit64", "pwrite64", "read",
    "readlink", "recvfrom", "recvmsg", "rename", "rmdir", "rt_sigaction", "rt_sigprocmask",
    "rt_sigreturn", "rt_sigsuspend", "select", "sendfile", "sendmsg", "sendto",
    "set_robust_list", "set_tid_address", "setgid", "setgroups", "setitimer", "setpgid",
    "setrlimit", "setsid", "setsockopt", "setuid", "sigaltstack", "socket", "socketpair",
    "stat", "statfs", "symlink", "sysinfo", "umask", "uname", "unlink", "vfork", "wait4",
    "write", "writev",
];

const RESTRICTED_SYSCALLS: &[&str] = &[
    "accept", "access", "brk", "close", "dup", "dup2", "dup3", "epoll_create", "epoll_ctl",
    "epoll_wait", "exit", "exit_group", "faccessat", "fchdir", "fcntl", "fdatasync", "flock",
    "fstat", "fstatfs", "fsync", "futex", "getcwd", "getdents", "getdents64", "getegid",
    "geteuid", "getgid", "getpeername", "getpgrp", "getpid", "getppid", "getpriority",
    "getrandom", "getresgid", "getresuid", "getrlimit", "getrusage", "getsockname",
    "getsockopt", "gettid", "gettimeofday", "getuid", "lseek", "madvise", "mmap", "mprotect",
    "munmap", "nanosleep", "open", "openat", "pipe", "pipe2", "poll", "prctl", "pread64",
    "prlimit64", "pwrite64", "read", "readlink", "recvfrom", "recvmsg", "rt_sigaction",
    "rt_sigprocmask", "rt_sigreturn", "rt_sigsuspend", "select", "sendfile", "sendmsg",
    "sendto", "set_robust_list", "set_tid_address", "setitimer", "sigaltstack", "socket",
    "socketpair", "stat", "statfs", "sysinfo", "umask", "uname", "wait4", "write", "writev",
];

fn seccomp_document(syscalls: &[&str]) -> serde_json::Value {
    json!({
        "defaultAction": "SCMP_ACT_ERRNO",
        "architectures": ["SCMP_ARCH_X86_64", "SCMP_ARCH_X86", "SCMP_ARCH_X32"],
        "syscalls": [
            {
                "names": syscalls,
                "action": "SCMP_ACT_ALLOW",
            }
        ],
    })
}

/// Locate the seccomp document for a profile name, writing the built-in
/// documents into `dir` if they are missing
///
/// `unconfined` has no document and yields `None`.
pub fn seccomp_profile_path(dir: &Path, name: &str) -> Result<Option<PathBuf>, RuntimeError> {
    let syscalls = match name {
        "unconfined" => return Ok(None),
        "default" => DEFAULT_SYSCALLS,
        "restricted" => RESTRICTED_SYSCALLS,
        _ => return Err(ConfigError::UnknownSeccompProfile(name.to_owned()).into()),
    };
    let path = dir.join(format!("{}.json", name));
    if !path.exists() {
        fs::create_dir_all(dir)?;
        let document = serde_json::to_vec_pretty(&seccomp_document(syscalls))?;
        fs::write(&path, document)?;
        log::debug!("wrote seccomp profile {:?}", path);
    }
    Ok(Some(path))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(
            SecurityProfile::lookup("Restricted"),
            Ok(SecurityProfile::restricted())
        );
        assert_eq!(
            SecurityProfile::lookup("hardened"),
            Err(ConfigError::UnknownProfile("hardened".to_owned()))
        );
    }

    #[test]
    fn privileged_wins_then_read_only() {
        let profile = SecurityProfile::select("restricted", true, false).unwrap();
        assert_eq!(profile.name, "privileged");
        assert_eq!(profile.capabilities, vec!["ALL".to_owned()]);
        assert_eq!(profile.seccomp_profile, "unconfined");
        assert!(!profile.no_new_privs);
        assert!(!profile.read_only_rootfs);

        let profile = SecurityProfile::select("restricted", true, true).unwrap();
        assert_eq!(profile.name, "privileged");
        assert!(profile.read_only_rootfs);

        let profile = SecurityProfile::select("default", false, true).unwrap();
        assert_eq!(profile.name, "default");
        assert!(profile.read_only_rootfs);

        assert!(SecurityProfile::select("nonsense", true, false).is_ok());
        assert!(SecurityProfile::select("nonsense", false, false).is_err());
    }

    #[test]
    fn capability_masks() {
        assert_eq!(SecurityProfile::privileged().capability_mask(), u64::MAX);
        assert_eq!(capability_mask(&["CHOWN", "KILL"]), 0x21);
        assert_eq!(capability_mask(&["cap_net_raw", "BOGUS"]), 1 << 13);
        let restricted = SecurityProfile::restricted().capability_mask();
        let default = SecurityProfile::default_profile().capability_mask();
        assert_eq!(restricted & default, restricted);
        assert_ne!(restricted, default);
    }

    #[test]
    fn seccomp_documents() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("minibox-seccomp-test-{}", rand::random::<u64>()));
        assert_eq!(seccomp_profile_path(&dir, "unconfined").unwrap(), None);
        let path = seccomp_profile_path(&dir, "restricted").unwrap().unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["defaultAction"], "SCMP_ACT_ERRNO");
        let allowed = doc["syscalls"][0]["names"].as_array().unwrap();
        assert!(allowed.iter().any(|name| name == "read"));
        assert!(!allowed.iter().any(|name| name == "execve"));
        assert!(seccomp_profile_path(&dir, "strict").is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
