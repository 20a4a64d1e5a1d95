#[macro_use] extern crate clap;

use chrono::{DateTime, Utc};
use clap::{App, ArgMatches};
use env_logger::{from_env, Env};
use minibox::{
    container::{self, RunOptions, Runtime},
    isolation,
    registry::{self, ImageInfo},
    volume::Volume,
    ContainerRecord,
};
use std::{
    collections::BTreeMap,
    error::Error,
    net::SocketAddr,
    os::unix::process::ExitStatusExt,
    path::Path,
    process::ExitStatus,
};

type CliResult = Result<i32, Box<dyn Error>>;

#[tokio::main]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap_or("warn");
    from_env(Env::default().default_filter_or(log_level)).init();

    let code = match dispatch(&matches).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(matches: &ArgMatches<'_>) -> CliResult {
    match matches.subcommand() {
        ("internal-start", Some(sub)) => internal_start(sub),
        (name, Some(sub)) => {
            let mut builder = Runtime::builder();
            if let Some(root) = matches.value_of("root") {
                builder = builder.root(root);
            }
            let runtime = builder.build()?;
            command(&runtime, name, sub).await
        }
        _ => Err("no command given, try --help".into()),
    }
}

async fn command(runtime: &Runtime, name: &str, sub: &ArgMatches<'_>) -> CliResult {
    match name {
        "run" => run(runtime, sub),
        "ps" => {
            print_containers(&runtime.list()?);
            Ok(0)
        }
        "stop" => {
            let record = runtime.stop(required(sub, "id")?).await?;
            println!("Container {} stopped", record.id);
            Ok(0)
        }
        "logs" => {
            let mut stdout = tokio::io::stdout();
            runtime
                .logs(required(sub, "id")?, sub.is_present("follow"), &mut stdout)
                .await?;
            Ok(0)
        }
        "exec" => {
            let command = string_values(sub, "command");
            let status = runtime.exec(required(sub, "id")?, &command)?;
            Ok(exit_code(status))
        }
        "volume-create" => {
            let labels = label_values(sub, "label");
            let volume = runtime.volumes().create(required(sub, "name")?, labels)?;
            println!("Volume {} created at {}", volume.name, volume.mountpoint.display());
            Ok(0)
        }
        "volume-list" => {
            print_volumes(&runtime.volumes().list()?);
            Ok(0)
        }
        "volume-rm" => {
            let name = required(sub, "name")?;
            runtime.remove_volume(name, sub.is_present("force"))?;
            println!("Volume {} removed", name);
            Ok(0)
        }
        "volume-backup" => {
            let (name, path) = (required(sub, "name")?, required(sub, "path")?);
            runtime.volumes().backup(name, Path::new(path))?;
            println!("Volume {} backed up to {}", name, path);
            Ok(0)
        }
        "volume-restore" => {
            let (name, path) = (required(sub, "name")?, required(sub, "path")?);
            runtime.volumes().restore(name, Path::new(path))?;
            println!("Volume {} restored from {}", name, path);
            Ok(0)
        }
        "registry-start" => {
            let port: u16 = required(sub, "port")?
                .parse()
                .map_err(|_| format!("invalid port {:?}", sub.value_of("port")))?;
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let (local_addr, server) = registry::bind(&addr, runtime.registry())?;
            println!("Local registry listening on http://localhost:{}", local_addr.port());
            println!("Press Ctrl+C to stop");
            server.await?;
            Ok(0)
        }
        "pull" => {
            let info = runtime.registry().pull(required(sub, "image")?)?;
            println!("Pulled {} ({})", info.reference(), info.digest);
            Ok(0)
        }
        "push" => {
            let info = runtime.registry().push(required(sub, "image")?)?;
            println!("Pushed {} ({})", info.reference(), info.digest);
            Ok(0)
        }
        "images" => {
            print_images(&runtime.registry().list()?);
            Ok(0)
        }
        "tag" => {
            let info = runtime
                .registry()
                .tag(required(sub, "source")?, required(sub, "target")?)?;
            println!("Tagged {}", info.reference());
            Ok(0)
        }
        other => Err(format!("unknown command {:?}", other).into()),
    }
}

fn run(runtime: &Runtime, sub: &ArgMatches<'_>) -> CliResult {
    let mut options = RunOptions::new(required(sub, "image")?)
        .read_only(sub.is_present("read_only"))
        .privileged(sub.is_present("privileged"));
    if let Some(name) = sub.value_of("name") {
        options = options.name(name);
    }
    options.volumes = string_values(sub, "volume");
    options.ports = string_values(sub, "port");
    if let Some(memory) = sub.value_of("memory") {
        options = options.memory(memory);
    }
    if let Some(cpu) = sub.value_of("cpu") {
        options = options.cpu(cpu);
    }
    if let Some(profile) = sub.value_of("security_profile") {
        options = options.security_profile(profile);
    }
    let record = runtime.run(&options)?;
    println!("Container {} started with PID {}", record.id, record.pid);
    println!("Security profile: {}", record.security_profile);
    Ok(0)
}

fn internal_start(sub: &ArgMatches<'_>) -> CliResult {
    let isolation = match isolation::detect() {
        Ok(isolation) => isolation,
        Err(err) => {
            isolation::report_ready(Err(&err));
            return Err(err.into());
        }
    };
    let rootfs = Path::new(required(sub, "rootfs")?);
    Err(container::internal_start(rootfs, &*isolation).into())
}

fn required<'a>(matches: &'a ArgMatches<'_>, name: &str) -> Result<&'a str, Box<dyn Error>> {
    matches
        .value_of(name)
        .ok_or_else(|| format!("missing required argument {}", name).into())
}

fn string_values<S: AsRef<str>>(matches: &ArgMatches, name: S) -> Vec<String> {
    matches
        .values_of(name)
        .into_iter()
        .map(|values| values.map(|value| value.to_string()))
        .flatten()
        .collect()
}

fn label_values<S: AsRef<str>>(matches: &ArgMatches, name: S) -> BTreeMap<String, String> {
    string_values(matches, name)
        .iter()
        .map(|label| {
            let mut parts = label.splitn(2, '=');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Elapsed time like `1h2m3s`
fn age(since: DateTime<Utc>) -> String {
    let seconds = Utc::now().signed_duration_since(since).num_seconds().max(0);
    let (h, m, s) = (seconds / 3600, seconds / 60 % 60, seconds % 60);
    if h > 0 {
        format!("{}h{}m{}s ago", h, m, s)
    } else if m > 0 {
        format!("{}m{}s ago", m, s)
    } else {
        format!("{}s ago", s)
    }
}

fn print_containers(records: &[ContainerRecord]) {
    println!(
        "{:<12} {:<15} {:<15} {:<10} {:<10} {:<10} {}",
        "ID", "NAME", "IMAGE", "STATUS", "PID", "PORTS", "CREATED"
    );
    for record in records {
        let ports = match record.ports.is_empty() {
            true => "none".to_string(),
            false => record.ports.join(", "),
        };
        println!(
            "{:<12} {:<15} {:<15} {:<10} {:<10} {:<10} {}",
            record.id.as_str(),
            record.name,
            record.image,
            record.status.as_str(),
            record.pid,
            ports,
            age(record.created_at)
        );
    }
}

fn print_volumes(volumes: &[Volume]) {
    println!(
        "{:<20} {:<20} {:<40} {}",
        "VOLUME NAME", "DRIVER", "MOUNTPOINT", "CREATED"
    );
    for volume in volumes {
        println!(
            "{:<20} {:<20} {:<40} {}",
            volume.name,
            volume.driver,
            volume.mountpoint.display().to_string(),
            age(volume.created_at)
        );
    }
}

fn print_images(images: &[ImageInfo]) {
    println!(
        "{:<30} {:<15} {:<15} {}",
        "REPOSITORY", "TAG", "SIZE", "CREATED"
    );
    for image in images {
        println!(
            "{:<30} {:<15} {:<15} {}",
            image.name,
            image.tag,
            format!("{:.2} MB", image.size as f64 / (1024.0 * 1024.0)),
            age(image.created_at)
        );
    }
}
