//! The re-executed side of a launch, running inside the new namespaces

use crate::{
    errors::RuntimeError,
    image::ImageConfig,
    isolation::{report_ready, Isolation, LaunchEnv},
};
use std::path::Path;

/// Finish isolating the current process and become the image's entry command
///
/// Settings come from the `MINIBOX_*` environment set by the launcher. The
/// outcome of the setup is reported on the readiness pipe, and so is a
/// failure to execute the entry command. Only returns on failure.
pub fn internal_start(rootfs: &Path, isolation: &dyn Isolation) -> RuntimeError {
    let (program, args, env) = match prepare(rootfs, isolation) {
        Ok(entrypoint) => entrypoint,
        Err(err) => {
            report_ready(Err(&err));
            return err;
        }
    };
    report_ready(Ok(()));
    log::info!("starting entry command {} {:?}", program, args);
    let err = isolation.run_entrypoint(&program, &args, &env);
    report_ready(Err(&err));
    err
}

type Entrypoint = (String, Vec<String>, Vec<(String, String)>);

fn prepare(rootfs: &Path, isolation: &dyn Isolation) -> Result<Entrypoint, RuntimeError> {
    let launch = LaunchEnv::from_env()?;
    log::debug!(
        "internal start in {:?}, memory={:?} cpu={:?} profile={}",
        rootfs,
        launch.memory,
        launch.cpu,
        launch.profile.name
    );
    isolation.prepare_rootfs(rootfs, &launch.volumes, launch.profile.read_only_rootfs)?;
    isolation.apply_security(&launch.profile);
    isolation.set_hostname(&launch.hostname)?;

    let root = isolation.container_root(rootfs);
    let config = ImageConfig::load(&root)?;
    let mut cmd = config.cmd.iter();
    let program = match cmd.next() {
        Some(program) => resolve_program(&root, program),
        None => "/bin/sh".to_owned(),
    };
    let args = cmd.cloned().collect();
    Ok((program, args, config.env_pairs()))
}

/// Absolute programs are looked up under the container root first
fn resolve_program(root: &Path, program: &str) -> String {
    if let Some(relative) = program.strip_prefix('/') {
        let candidate = root.join(relative);
        if candidate.is_file() {
            return candidate.to_string_lossy().into_owned();
        }
    }
    program.to_owned()
}
