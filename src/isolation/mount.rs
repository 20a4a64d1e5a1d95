//! Root filesystem assembly inside a fresh mount namespace

use crate::{errors::RuntimeError, isolation::VolumeMount};
use std::{
    ffi::CString,
    fs, io,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
    ptr,
};

/// Where the previous root is parked during pivot_root, relative to the new
/// root
pub const OLD_ROOT: &str = ".pivot_root";

fn path_to_cstring(path: &Path) -> Result<CString, RuntimeError> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

fn mount(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    op: &'static str,
) -> Result<(), RuntimeError> {
    let target_c = path_to_cstring(target)?;
    let source_c = source.map(CString::new).transpose()?;
    let fstype_c = fstype.map(CString::new).transpose()?;
    let ret = unsafe {
        libc::mount(
            source_c.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            target_c.as_ptr(),
            fstype_c.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            flags,
            ptr::null(),
        )
    };
    if ret != 0 {
        return Err(RuntimeError::Mount {
            op,
            target: target.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn bind(source: &Path, target: &Path, read_only: bool) -> Result<(), RuntimeError> {
    let source_c = path_to_cstring(source)?;
    let target_c = path_to_cstring(target)?;
    let ret = unsafe {
        libc::mount(
            source_c.as_ptr(),
            target_c.as_ptr(),
            ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            ptr::null(),
        )
    };
    if ret != 0 {
        return Err(RuntimeError::Mount {
            op: "bind mount",
            target: target.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    if read_only {
        mount(
            None,
            target,
            None,
            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
            "remount read-only",
        )?;
    }
    Ok(())
}

fn unmount(target: &Path) {
    if let Ok(target_c) = path_to_cstring(target) {
        if unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) } != 0 {
            log::debug!(
                "cleanup unmount of {:?} failed: {}",
                target,
                io::Error::last_os_error()
            );
        }
    }
}

/// Join an absolute container path onto the rootfs without letting `..`
/// climb out of it
fn inside(rootfs: &Path, container_path: &Path) -> PathBuf {
    let mut path = rootfs.to_path_buf();
    for component in container_path.components() {
        if let Component::Normal(part) = component {
            path.push(part);
        }
    }
    path
}

/// Mounts made so far, for unwinding after a failure
struct MountStack {
    mounted: Vec<PathBuf>,
}

impl MountStack {
    fn push(&mut self, target: PathBuf) {
        self.mounted.push(target);
    }

    fn unwind(self) {
        for target in self.mounted.iter().rev() {
            unmount(target);
        }
    }
}

/// Make `rootfs` the root of this mount namespace
///
/// Mounts are made private first, so none of this propagates back to the
/// host. Any failure unmounts what was already mounted before returning.
pub fn prepare_rootfs(
    rootfs: &Path,
    volumes: &[VolumeMount],
    read_only: bool,
) -> Result<(), RuntimeError> {
    mount(
        None,
        Path::new("/"),
        None,
        libc::MS_REC | libc::MS_PRIVATE,
        "make private",
    )?;
    let mut stack = MountStack {
        mounted: Vec::new(),
    };
    match assemble(rootfs, volumes, &mut stack) {
        Ok(()) => {}
        Err(err) => {
            stack.unwind();
            return Err(err);
        }
    }
    if let Err(err) = pivot(rootfs) {
        stack.unwind();
        return Err(err);
    }
    if read_only {
        mount(
            None,
            Path::new("/"),
            None,
            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
            "remount read-only",
        )?;
    }
    Ok(())
}

fn assemble(
    rootfs: &Path,
    volumes: &[VolumeMount],
    stack: &mut MountStack,
) -> Result<(), RuntimeError> {
    // pivot_root needs the new root to be a mount point
    bind(rootfs, rootfs, false)?;
    stack.push(rootfs.to_path_buf());

    for volume in volumes {
        let target = inside(rootfs, &volume.target);
        fs::create_dir_all(&target)?;
        log::debug!("binding volume {:?} at {:?}", volume.source, target);
        bind(&volume.source, &target, volume.read_only)?;
        stack.push(target);
    }

    let special: [(&str, &str, libc::c_ulong); 3] = [
        ("proc", "proc", libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC),
        ("sys", "sysfs", libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC | libc::MS_RDONLY),
        ("tmp", "tmpfs", libc::MS_NOSUID | libc::MS_NODEV),
    ];
    for (dir, fstype, flags) in special.iter() {
        let target = rootfs.join(dir);
        fs::create_dir_all(&target)?;
        mount(Some(fstype), &target, Some(fstype), *flags, "mount")?;
        stack.push(target);
    }
    Ok(())
}

fn pivot(rootfs: &Path) -> Result<(), RuntimeError> {
    let old_root = rootfs.join(OLD_ROOT);
    fs::create_dir_all(&old_root)?;
    let new_root_c = path_to_cstring(rootfs)?;
    let old_root_c = path_to_cstring(&old_root)?;
    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, new_root_c.as_ptr(), old_root_c.as_ptr()) };
    if ret != 0 {
        return Err(RuntimeError::PivotRoot {
            new_root: rootfs.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    std::env::set_current_dir("/")?;

    let parked = Path::new("/").join(OLD_ROOT);
    let parked_c = path_to_cstring(&parked)?;
    if unsafe { libc::umount2(parked_c.as_ptr(), libc::MNT_DETACH) } != 0 {
        return Err(RuntimeError::Mount {
            op: "unmount old root",
            target: parked,
            source: io::Error::last_os_error(),
        });
    }
    fs::remove_dir(&parked)?;
    Ok(())
}

/// Set the UTS namespace hostname
pub fn set_hostname(name: &str) -> io::Result<()> {
    let ret = unsafe { libc::sethostname(name.as_ptr() as *const libc::c_char, name.len()) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn volume_targets_stay_inside() {
        let root = Path::new("/state/containers/web/rootfs");
        assert_eq!(inside(root, Path::new("/data")), root.join("data"));
        assert_eq!(inside(root, Path::new("/a/../../etc")), root.join("a/etc"));
        assert_eq!(inside(root, Path::new("relative/x")), root.join("relative/x"));
    }
}
