//! cgroup v2 resource groups

use crate::limits::ResourceLimits;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Mount point of the unified cgroup hierarchy
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Name of the resource group owned by one launching process
pub fn group_name(launcher_pid: u32) -> String {
    format!("minibox_{}", launcher_pid)
}

/// A cgroup directory with memory and CPU limits written into it
#[derive(Clone, Debug)]
pub struct ResourceGroup {
    path: PathBuf,
}

impl ResourceGroup {
    /// Create (or reuse) the group `name` under `root` and write its limits
    pub fn create(root: &Path, name: &str, limits: &ResourceLimits) -> io::Result<Self> {
        let path = root.join(name);
        log::debug!(
            "creating resource group {:?}, memory.max={} cpu.max={:?}",
            path,
            limits.memory_bytes,
            limits.cpu_max()
        );
        fs::create_dir_all(&path)?;
        fs::write(path.join("memory.max"), limits.memory_bytes.to_string())?;
        fs::write(path.join("cpu.max"), limits.cpu_max())?;
        Ok(ResourceGroup { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move a process into this group
    pub fn add_process(&self, pid: u32) -> io::Result<()> {
        log::debug!("adding pid {} to resource group {:?}", pid, self.path);
        fs::write(self.path.join("cgroup.procs"), pid.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_limits() {
        let mut root = std::env::temp_dir();
        root.push(format!("minibox-cgroup-test-{}", rand::random::<u64>()));
        let limits = ResourceLimits::resolve("128m", "20");
        let group = ResourceGroup::create(&root, &group_name(42), &limits).unwrap();
        assert_eq!(group.path(), root.join("minibox_42"));
        group.add_process(1234).unwrap();
        let read = |name: &str| fs::read_to_string(group.path().join(name)).unwrap();
        assert_eq!(read("memory.max"), "134217728");
        assert_eq!(read("cpu.max"), "20000 100000");
        assert_eq!(read("cgroup.procs"), "1234");
        fs::remove_dir_all(&root).unwrap();
    }
}
