use minibox::{
    container::{RunOptions, Runtime},
    errors::{ConfigError, ImageError, RuntimeError, VolumeError},
    image::{archive::ArchiveWriter, ImageConfig, CONFIG_FILE},
    isolation::SimulatedIsolation,
    process, ContainerStatus,
};
use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Once},
    time::{Duration, Instant},
};
use tokio::time::delay_for;

// Stand-in for the re-executed runtime: report some of the launch
// environment, signal readiness, then idle.
const IDLE: &str = r#"echo "$MINIBOX_HOSTNAME $MINIBOX_ISOLATION $MINIBOX_READONLY"; echo "$1"; echo ok >&3; exec 3>&-; exec sleep 30"#;

fn temp_root() -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut path = std::env::temp_dir();
    path.push(format!("minibox-lifecycle-{}", rand::random::<u64>()));
    path
}

fn runtime(root: &Path, script: &str) -> Runtime {
    Runtime::builder()
        .root(root)
        .isolation(Arc::new(SimulatedIsolation::new()))
        .launcher_command("/bin/sh", &["-c", script, "sh"])
        .build()
        .unwrap()
}

/// A runtime that re-executes the real `minibox` binary, built on first use
fn reexec_runtime(root: &Path) -> Runtime {
    static BUILD: Once = Once::new();
    BUILD.call_once(|| {
        let status = Command::new(env!("CARGO"))
            .arg("build")
            .arg("--quiet")
            .arg("-p")
            .arg("minibox-cli")
            .status()
            .unwrap();
        assert!(status.success());
    });
    Runtime::builder()
        .root(root)
        .isolation(Arc::new(SimulatedIsolation::new()))
        .launcher_command(assert_cmd::cargo::cargo_bin("minibox"), &["internal-start"])
        .build()
        .unwrap()
}

/// Put an image with this entry command in the image cache
fn install_image(root: &Path, name: &str, cmd: &[&str]) {
    let config = ImageConfig {
        name: name.to_owned(),
        version: "1.0".to_owned(),
        cmd: cmd.iter().map(|s| s.to_string()).collect(),
        env: vec!["PATH=/usr/bin:/bin".to_owned()],
    };
    let mut writer = ArchiveWriter::new(Vec::new());
    writer.dir("bin").unwrap();
    writer.dir("tmp").unwrap();
    writer
        .file(CONFIG_FILE, 0o644, &serde_json::to_vec(&config).unwrap())
        .unwrap();
    let images = root.join("images");
    fs::create_dir_all(&images).unwrap();
    fs::write(images.join(format!("{}.tar.gz", name)), writer.finish().unwrap()).unwrap();
}

#[tokio::test]
async fn run_list_stop_logs() {
    let root = temp_root();
    let runtime = runtime(&root, IDLE);

    let record = runtime
        .run(&RunOptions::new("alpine").name("web").port("8080:80"))
        .unwrap();
    assert_eq!(record.status, ContainerStatus::Running);
    assert_eq!(record.name, "web");
    assert_eq!(record.ports, vec!["8080:80"]);
    assert_eq!(record.security_profile, "default");
    assert!(process::is_alive(record.pid));
    assert!(root.join("containers/web/rootfs/bin/sh").is_file());
    assert!(root.join("seccomp/default.json").is_file());

    let listed = runtime.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id.as_str(), "web");
    assert_eq!(listed[0].status, ContainerStatus::Running);

    match runtime.run(&RunOptions::new("alpine").name("web")) {
        Err(RuntimeError::AlreadyExists(id)) => assert_eq!(id, "web"),
        other => panic!("unexpected {:?}", other),
    }

    let stopped = runtime.stop("web").await.unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert!(!process::is_alive(record.pid));
    assert_eq!(runtime.inspect("web").unwrap().status, ContainerStatus::Stopped);
    match runtime.stop("web").await {
        Err(RuntimeError::AlreadyStopped(id)) => assert_eq!(id, "web"),
        other => panic!("unexpected {:?}", other),
    }

    let mut out = Vec::new();
    runtime.logs("web", false, &mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    let rootfs = root.join("containers/web/rootfs");
    assert!(
        text.starts_with(&format!("web simulated false\n{}\n", rootfs.display())),
        "{:?}",
        text
    );
    assert!(text.contains("\n["), "{:?}", text);
    assert!(text.ends_with("] Container stopped\n"), "{:?}", text);

    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn generated_ids_and_profiles() {
    let root = temp_root();
    let runtime = runtime(&root, IDLE);
    let record = runtime
        .run(&RunOptions::new("busybox").security_profile("Restricted"))
        .unwrap();
    assert_eq!(record.id.as_str().len(), 8);
    assert!(record.id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(record.name, record.id.as_str());
    assert_eq!(record.security_profile, "restricted");

    let mut out = Vec::new();
    runtime.logs(record.id.as_str(), false, &mut out).await.unwrap();
    let first_line = String::from_utf8(out).unwrap().lines().next().unwrap().to_owned();
    assert_eq!(first_line, format!("{} simulated true", record.id));

    let privileged = runtime
        .run(
            &RunOptions::new("busybox")
                .name("admin")
                .security_profile("restricted")
                .privileged(true),
        )
        .unwrap();
    assert_eq!(privileged.security_profile, "privileged");

    runtime.stop(record.id.as_str()).await.unwrap();
    runtime.stop("admin").await.unwrap();
    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn configuration_errors_leave_nothing_behind() {
    let root = temp_root();
    let runtime = runtime(&root, IDLE);

    let bad = [
        RunOptions::new("alpine").name("a").volume("data"),
        RunOptions::new("alpine").name("a").port("http"),
        RunOptions::new("alpine").name("a").security_profile("paranoid"),
        RunOptions::new("alpine").name("../a"),
    ];
    for options in &bad {
        assert!(
            matches!(runtime.run(options), Err(RuntimeError::Config(_))),
            "{:?}",
            options
        );
    }
    assert!(!root.join("containers").join("a").exists());

    match runtime.run(&RunOptions::new("nginx").name("a")) {
        Err(RuntimeError::Image(ImageError::NotFound(name))) => assert_eq!(name, "nginx:latest"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!root.join("containers/a").exists());

    match runtime.run(&RunOptions::new("alpine").name("a").volume("missing:/data")) {
        Err(RuntimeError::Volume(VolumeError::NotFound(name))) => assert_eq!(name, "missing"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!root.join("containers/a").exists());
    assert!(runtime.list().unwrap().is_empty());

    match runtime.run(&RunOptions::new("alpine").memory("lots").cpu("most").name("a")) {
        Ok(record) => {
            assert_eq!(record.memory, "lots");
            runtime.stop("a").await.unwrap();
        }
        other => panic!("bad limits should fall back to defaults, got {:?}", other),
    }

    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn failed_setup_is_not_recorded() {
    let root = temp_root();
    let failing = runtime(&root, "echo 'error: pivot_root failed' >&3; exit 1");
    match failing.run(&RunOptions::new("alpine").name("broken")) {
        Err(RuntimeError::LaunchFailed(msg)) => assert_eq!(msg, "pivot_root failed"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!root.join("containers/broken").exists());

    let silent = runtime(&root, "exit 0");
    assert!(matches!(
        silent.run(&RunOptions::new("alpine").name("broken")),
        Err(RuntimeError::LaunchFailed(_))
    ));
    assert!(!root.join("containers/broken").exists());
    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn exited_containers_are_reconciled() {
    let root = temp_root();
    let runtime = runtime(&root, "echo ok >&3; exec 3>&-; exit 0");
    let record = runtime.run(&RunOptions::new("alpine").name("brief")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while process::is_alive(record.pid) {
        assert!(Instant::now() < deadline, "process never exited");
        delay_for(Duration::from_millis(50)).await;
    }
    let listed = runtime.list().unwrap();
    assert_eq!(listed[0].status, ContainerStatus::Stopped);
    let on_disk: serde_json::Value =
        serde_json::from_slice(&fs::read(root.join("containers/brief/config.json")).unwrap())
            .unwrap();
    assert_eq!(on_disk["status"], "stopped");

    assert!(matches!(
        runtime.stop("brief").await,
        Err(RuntimeError::AlreadyStopped(_))
    ));
    assert!(matches!(
        runtime.exec("brief", &["ls".to_owned()]),
        Err(RuntimeError::NotRunning(_))
    ));
    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn lookups_of_missing_containers() {
    let root = temp_root();
    let runtime = runtime(&root, IDLE);
    for result in vec![
        runtime.inspect("ghost").map(|_| ()),
        runtime.stop("ghost").await.map(|_| ()),
        runtime.exec("ghost", &["ls".to_owned()]).map(|_| ()),
        runtime.logs("ghost", false, &mut Vec::new()).await,
    ] {
        match result {
            Err(err) => assert!(err.is_not_found(), "{:?}", err),
            Ok(()) => panic!("found a container that doesn't exist"),
        }
    }
}

#[tokio::test]
async fn exec_needs_namespaces() {
    let root = temp_root();
    let runtime = runtime(&root, IDLE);
    runtime.run(&RunOptions::new("alpine").name("shell")).unwrap();
    match runtime.exec("shell", &["ls".to_owned()]) {
        Err(err @ RuntimeError::Unsupported(_)) => {
            assert!(err.to_string().contains("only supported on Linux"))
        }
        other => panic!("unexpected {:?}", other),
    }
    runtime.stop("shell").await.unwrap();
    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn volumes_in_use() {
    let root = temp_root();
    let runtime = runtime(&root, IDLE);
    let volume = runtime.volumes().create("data", BTreeMap::new()).unwrap();
    fs::write(volume.mountpoint.join("hello.txt"), b"hi").unwrap();

    runtime
        .run(&RunOptions::new("alpine").name("db").volume("data:/var/lib/data:ro"))
        .unwrap();
    match runtime.remove_volume("data", false) {
        Err(RuntimeError::Volume(VolumeError::InUse { volume, container })) => {
            assert_eq!(volume, "data");
            assert_eq!(container, "db");
        }
        other => panic!("unexpected {:?}", other),
    }
    runtime.stop("db").await.unwrap();
    runtime.remove_volume("data", false).unwrap();
    assert!(!volume.mountpoint.exists());
    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn follow_emits_appended_output_once() {
    let root = temp_root();
    let runtime = runtime(&root, "echo first; echo ok >&3; exec 3>&-; exec sleep 30");
    let record = runtime.run(&RunOptions::new("alpine").name("tail")).unwrap();
    let log_path = runtime.store().log_path(&record.id);
    let container_dir = runtime.store().container_dir(&record.id);

    let append = |text: &str| {
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    };
    let mut out = Vec::new();
    let follow = runtime.logs("tail", true, &mut out);
    let writer = async {
        delay_for(Duration::from_millis(350)).await;
        append("second\n");
        delay_for(Duration::from_millis(350)).await;
        append("third\n");
        delay_for(Duration::from_millis(350)).await;
        process::signal(record.pid, libc::SIGKILL).unwrap();
        fs::remove_dir_all(&container_dir).unwrap();
    };
    let (result, ()) = tokio::join!(follow, writer);

    match result {
        Err(RuntimeError::ContainerRemoved(id)) => assert_eq!(id, "tail"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(String::from_utf8(out).unwrap(), "first\nsecond\nthird\n");
    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn entry_command_becomes_the_container_process() {
    let root = temp_root();
    install_image(&root, "sleeper", &["/bin/sleep", "30"]);
    let runtime = reexec_runtime(&root);

    let record = runtime.run(&RunOptions::new("sleeper").name("nap")).unwrap();
    assert_eq!(record.status, ContainerStatus::Running);
    assert!(process::is_alive(record.pid));
    let cmdline = fs::read(format!("/proc/{}/cmdline", record.pid)).unwrap();
    assert_eq!(cmdline, b"/bin/sleep\x0030\x00".to_vec());

    runtime.stop("nap").await.unwrap();
    assert!(!process::is_alive(record.pid));
    assert_eq!(runtime.inspect("nap").unwrap().status, ContainerStatus::Stopped);
    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn missing_entry_command_fails_the_run() {
    let root = temp_root();
    install_image(&root, "broken", &["/definitely/not/here"]);
    let runtime = reexec_runtime(&root);

    match runtime.run(&RunOptions::new("broken").name("ghost")) {
        Err(RuntimeError::LaunchFailed(msg)) => {
            assert!(msg.starts_with("failed to execute \"/definitely/not/here\""), "{}", msg)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!root.join("containers/ghost").exists());
    assert!(runtime.list().unwrap().is_empty());
    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn volumes_reach_the_entry_command() {
    let _ = env_logger::builder().is_test(true).try_init();
    let root = std::env::temp_dir().join(format!("minibox:lifecycle-{}", rand::random::<u64>()));
    install_image(&root, "env", &["/bin/sh", "-c", "echo started; exec sleep 30"]);
    let runtime = reexec_runtime(&root);
    runtime.volumes().create("data", BTreeMap::new()).unwrap();

    let record = runtime
        .run(&RunOptions::new("env").name("mounted").volume("data:/data:ro"))
        .unwrap();
    let log_path = runtime.store().log_path(&record.id);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !fs::read_to_string(&log_path).unwrap().contains("started\n") {
        assert!(Instant::now() < deadline, "entry command never ran");
        delay_for(Duration::from_millis(50)).await;
    }
    runtime.stop("mounted").await.unwrap();
    assert!(!process::is_alive(record.pid));
    fs::remove_dir_all(&root).unwrap();
}
