//! Demonstration images synthesized on first use

use crate::image::{archive::ArchiveWriter, ImageConfig, DEFAULT_PATH};
use std::io;

struct Builtin {
    name: &'static str,
    version: &'static str,
    banner: &'static str,
    os_release: &'static str,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "alpine",
        version: "3.16.0",
        banner: "Minibox Alpine Demo Shell",
        os_release: "NAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID=3.16.0\nPRETTY_NAME=\"Minibox Alpine Demo\"\n",
    },
    Builtin {
        name: "busybox",
        version: "1.35.0",
        banner: "Minibox Busybox Demo Shell",
        os_release: "NAME=\"Busybox\"\nID=busybox\nVERSION_ID=1.35.0\nPRETTY_NAME=\"Minibox Busybox Demo\"\n",
    },
];

/// Build the `.tar.gz` for a built-in image, if there is one by this name
pub fn archive(name: &str) -> io::Result<Option<Vec<u8>>> {
    let builtin = match BUILTINS.iter().find(|b| b.name == name) {
        Some(builtin) => builtin,
        None => return Ok(None),
    };
    let config = ImageConfig {
        name: builtin.name.to_owned(),
        version: builtin.version.to_owned(),
        cmd: vec!["/bin/sh".to_owned()],
        env: vec![DEFAULT_PATH.to_owned()],
    };
    let shell = format!("#!/bin/sh\necho '{}'\n/bin/sh\n", builtin.banner);

    let mut writer = ArchiveWriter::new(Vec::new());
    writer.dir("bin")?;
    writer.file("bin/sh", 0o755, shell.as_bytes())?;
    writer.dir("etc")?;
    writer.file("etc/os-release", 0o644, builtin.os_release.as_bytes())?;
    for dir in &["proc", "sys", "dev", "tmp", "usr", "var"] {
        writer.dir(dir)?;
    }
    writer.file(
        "image-config.json",
        0o644,
        &serde_json::to_vec(&config).map_err(io::Error::from)?,
    )?;
    Ok(Some(writer.finish()?))
}
