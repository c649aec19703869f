//! caravel - daemonless OCI container and pod engine CLI.
//!
//! Thin dispatch layer: global flags assemble an [`EngineConfig`], the
//! subcommand picks the engine operation, reports print as JSON lines.
//! With `--url` (or `CONTAINER_HOST`) every command runs against a remote
//! service instead of the local runtime.
//!
//! ```sh
//! caravel create --name web nginx:latest
//! caravel start web
//! caravel pod create --name p1
//! caravel system service unix:///run/caravel/caravel.sock
//! ```

use caravel::config::EngineConfig;
use caravel::container::store::{LogOptions, RemoveOptions};
use caravel::engine::abi::AbiEngine;
use caravel::engine::tunnel::TunnelEngine;
use caravel::engine::uri::ConnectionUri;
use caravel::engine::{ContainerEngine, ImageEngine};
use caravel::error::{Error, EXIT_ENGINE_FAILURE};
use caravel::image::pull::{PullOptions, PullPolicy};
use caravel::pod::PodCreateOptions;
use caravel::service::{ApiServer, ListenAddr};
use caravel::specgen::ContainerSpec;
use caravel::volume::{VolumeCreateOptions, VolumeFilters};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

fn usage() -> &'static str {
    "usage: caravel [global flags] <command> [args]

commands:
  create | run | start | stop | restart | kill | pause | unpause | init
  rm | wait | exec | logs | top | inspect | diff | port | cp | commit
  export | stats | checkpoint | restore | mount | umount | ps
  container cleanup <id> [--rm] [--exec <session>]
  pod     create|start|stop|kill|pause|unpause|restart|rm|prune|ps|inspect|top|stats|exists
  image   pull|push|list|inspect|rm|tag|untag|tree|history|search|import|load|save|diff|prune|exists
  volume  create|inspect|ls|rm|prune
  version | info | system df | system prune | system service | events

global flags:
  --root <dir> --runroot <dir> --log-level <lvl> --cgroup-manager <m>
  --runtime <bin> --storage-driver <d> --storage-opt <o> --syslog <bool>
  --url <connection-uri>
"
}

/// Parsed global flags plus the remaining argv.
struct Globals {
    config: EngineConfig,
    url: Option<String>,
    rest: Vec<String>,
}

fn parse_globals(args: Vec<String>) -> Result<Globals, String> {
    let mut config = EngineConfig::system();
    let mut url = std::env::var("CONTAINER_HOST").ok().filter(|s| !s.is_empty());
    let mut rest = Vec::new();
    let mut i = 0;

    while i < args.len() {
        let arg = &args[i];
        let mut take_value = |i: &mut usize| -> Result<String, String> {
            *i += 1;
            args.get(*i)
                .cloned()
                .ok_or_else(|| format!("{arg} requires a value"))
        };
        match arg.as_str() {
            "--root" => config.graph_root = take_value(&mut i)?.into(),
            "--runroot" => config.run_root = take_value(&mut i)?.into(),
            "--tmpdir" => config.tmp_dir = take_value(&mut i)?.into(),
            "--log-level" => config.log_level = take_value(&mut i)?,
            "--runtime" => config.runtime = take_value(&mut i)?,
            "--storage-driver" => config.storage_driver = Some(take_value(&mut i)?),
            "--storage-opt" => config.storage_opts.push(take_value(&mut i)?),
            "--cgroup-manager" => {
                config.cgroup_manager = match take_value(&mut i)?.as_str() {
                    "systemd" => caravel::config::CgroupManager::Systemd,
                    "cgroupfs" => caravel::config::CgroupManager::Cgroupfs,
                    other => return Err(format!("unknown cgroup manager: {other}")),
                }
            }
            "--syslog" => {
                config.syslog = take_value(&mut i)? == "true";
            }
            "--url" | "--connection" => url = Some(take_value(&mut i)?),
            "--help" | "-h" => {
                rest.push("help".to_string());
            }
            _ => {
                rest.extend(args[i..].iter().cloned());
                break;
            }
        }
        i += 1;
    }
    Ok(Globals { config, url, rest })
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let globals = match parse_globals(args) {
        Ok(g) => g,
        Err(msg) => {
            eprintln!("Error: {msg}");
            return ExitCode::from(EXIT_ENGINE_FAILURE);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(&globals.config.log_level)
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_ENGINE_FAILURE);
        }
    };

    match runtime.block_on(dispatch(globals)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn dispatch(globals: Globals) -> caravel::Result<ExitCode> {
    let mut rest = globals.rest.clone();
    if rest.is_empty() {
        println!("{}", usage());
        return Ok(ExitCode::from(EXIT_ENGINE_FAILURE));
    }
    let command = rest.remove(0);

    // `system service` always runs the local engine.
    if command == "system" && rest.first().map(String::as_str) == Some("service") {
        return system_service(globals.config, rest.get(1).cloned()).await;
    }

    // Pick transport: remote when a URL is given.
    if let Some(url) = &globals.url {
        if command == "events" {
            return Err(Error::NotImplementedRemote("events streaming"));
        }
        let uri = ConnectionUri::parse(url)?;
        let engine = TunnelEngine::connect(uri).await?;
        return run_command(&engine, &engine, &command, rest).await;
    }
    let engine = AbiEngine::new(globals.config)?;

    // Events streaming needs the live bus, so it runs on the concrete
    // engine rather than the capability trait.
    if command == "events" {
        let mut rx = engine.subscribe_events(caravel::events::EventFilter::default());
        while let Some(event) = rx.recv().await {
            println!("{}", serde_json::to_string(&event)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let result = run_command(engine.as_ref(), engine.as_ref(), &command, rest).await;
    engine.shutdown().await?;
    result
}

async fn system_service(
    config: EngineConfig,
    addr: Option<String>,
) -> caravel::Result<ExitCode> {
    let engine = AbiEngine::new(config.clone())?;
    let listen = match addr.as_deref() {
        None | Some("") => ListenAddr::Unix(ApiServer::default_socket(config.rootless)),
        Some(uri) => match ConnectionUri::parse(uri)? {
            ConnectionUri::Unix { path } => ListenAddr::Unix(path),
            ConnectionUri::Tcp { host, port } => ListenAddr::Tcp(
                format!("{host}:{port}")
                    .parse()
                    .map_err(|e| Error::InvalidArg(format!("invalid listen address: {e}")))?,
            ),
            ConnectionUri::Ssh { .. } => {
                return Err(Error::InvalidArg(
                    "cannot listen on an ssh URI".to_string(),
                ))
            }
        },
    };
    ApiServer::new(engine, listen).run().await?;
    Ok(ExitCode::SUCCESS)
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error: {e}"),
    }
}

/// Prints per-target reports, returning failure when any target failed.
fn report_outcome(reports: &[caravel::reports::ContainerReport]) -> ExitCode {
    let mut failed = false;
    for report in reports {
        match &report.err {
            None => println!("{}", report.id),
            Some(err) => {
                eprintln!("Error: {err}");
                failed = true;
            }
        }
    }
    if failed {
        ExitCode::from(EXIT_ENGINE_FAILURE)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_command(
    containers: &dyn ContainerEngine,
    images: &dyn ImageEngine,
    command: &str,
    mut args: Vec<String>,
) -> caravel::Result<ExitCode> {
    match command {
        "help" => {
            println!("{}", usage());
            Ok(ExitCode::SUCCESS)
        }
        "create" | "run" => {
            let (spec, detach) = parse_create_args(&mut args)?;
            let auto_remove = spec.auto_remove;
            let id = containers.container_create(spec).await?;
            if command == "run" {
                let reports = containers.container_start(&[id.clone()]).await?;
                if reports.iter().any(|r| r.err.is_some()) {
                    return Ok(report_outcome(&reports));
                }
                if !detach {
                    // Foreground run: wait and adopt the container's code.
                    let report = containers.container_wait(&id, &[]).await?;
                    if auto_remove {
                        let _ = containers
                            .container_rm(
                                &[id],
                                RemoveOptions {
                                    ignore: true,
                                    ..Default::default()
                                },
                            )
                            .await;
                    }
                    return Ok(ExitCode::from(report.exit_code.clamp(0, 255) as u8));
                }
            }
            println!("{id}");
            Ok(ExitCode::SUCCESS)
        }
        "start" => Ok(report_outcome(&containers.container_start(&args).await?)),
        "stop" => {
            let timeout = take_flag_value(&mut args, "-t")
                .or_else(|| take_flag_value(&mut args, "--time"))
                .and_then(|v| v.parse().ok());
            let ignore = take_flag(&mut args, "--ignore");
            Ok(report_outcome(
                &containers.container_stop(&args, timeout, ignore).await?,
            ))
        }
        "restart" => {
            let timeout = take_flag_value(&mut args, "-t").and_then(|v| v.parse().ok());
            Ok(report_outcome(
                &containers.container_restart(&args, timeout).await?,
            ))
        }
        "kill" => {
            let signal = take_flag_value(&mut args, "-s")
                .or_else(|| take_flag_value(&mut args, "--signal"))
                .unwrap_or_else(|| "SIGKILL".to_string());
            Ok(report_outcome(
                &containers.container_kill(&args, &signal).await?,
            ))
        }
        "pause" => Ok(report_outcome(&containers.container_pause(&args).await?)),
        "unpause" => Ok(report_outcome(&containers.container_unpause(&args).await?)),
        "init" => {
            for name in &args {
                containers.container_init(name).await?;
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        "rm" => {
            let opts = RemoveOptions {
                force: take_flag(&mut args, "-f") || take_flag(&mut args, "--force"),
                volumes: take_flag(&mut args, "-v") || take_flag(&mut args, "--volumes"),
                ignore: take_flag(&mut args, "--ignore"),
            };
            Ok(report_outcome(&containers.container_rm(&args, opts).await?))
        }
        "wait" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            let report = containers.container_wait(name, &[]).await?;
            println!("{}", report.exit_code);
            Ok(ExitCode::SUCCESS)
        }
        "ps" | "list" => {
            let all = take_flag(&mut args, "-a") || take_flag(&mut args, "--all");
            print_json(&containers.container_list(all).await?);
            Ok(ExitCode::SUCCESS)
        }
        "inspect" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            print_json(&containers.container_inspect(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "logs" => {
            let follow = take_flag(&mut args, "-f") || take_flag(&mut args, "--follow");
            let tail = take_flag_value(&mut args, "--tail").and_then(|v| v.parse().ok());
            let name = args.first().ok_or_else(|| missing("container"))?;
            let opts = LogOptions {
                follow,
                tail,
                ..Default::default()
            };
            for entry in containers.container_logs(name, &opts).await? {
                println!("{}", entry.message);
            }
            Ok(ExitCode::SUCCESS)
        }
        "top" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            print_json(&containers.container_top(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "stats" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            print_json(&containers.container_stats(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "diff" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            for change in containers.container_diff(name).await? {
                println!("{} {}", change.kind, change.path);
            }
            Ok(ExitCode::SUCCESS)
        }
        "port" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            for mapping in containers.container_port(name).await? {
                println!(
                    "{}/{} -> {}",
                    mapping.container_port, mapping.protocol, mapping.host_port
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        "cp" => {
            let (src, dst) = match (args.first(), args.get(1)) {
                (Some(s), Some(d)) => (s.clone(), d.clone()),
                _ => return Err(Error::InvalidArg("cp requires SRC and DST".to_string())),
            };
            containers.container_copy(&src, &dst).await?;
            Ok(ExitCode::SUCCESS)
        }
        "commit" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            let tag = args.get(1).map(String::as_str);
            println!("{}", containers.container_commit(name, tag).await?);
            Ok(ExitCode::SUCCESS)
        }
        "export" => {
            let name = args.first().ok_or_else(|| missing("container"))?.clone();
            let output = take_flag_value(&mut args, "-o")
                .ok_or_else(|| Error::InvalidArg("export requires -o <file>".to_string()))?;
            containers
                .container_export(&name, std::path::Path::new(&output))
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        "checkpoint" => {
            let leave_running = take_flag(&mut args, "--leave-running");
            let name = args.first().ok_or_else(|| missing("container"))?;
            containers.container_checkpoint(name, leave_running).await?;
            println!("{name}");
            Ok(ExitCode::SUCCESS)
        }
        "restore" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            containers.container_restore(name).await?;
            println!("{name}");
            Ok(ExitCode::SUCCESS)
        }
        "mount" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            println!("{}", containers.container_mount(name).await?.display());
            Ok(ExitCode::SUCCESS)
        }
        "umount" | "unmount" => {
            let name = args.first().ok_or_else(|| missing("container"))?;
            containers.container_unmount(name).await?;
            println!("{name}");
            Ok(ExitCode::SUCCESS)
        }
        "exec" => {
            let mut config = caravel::container::exec::ExecConfig {
                attach_stdout: true,
                attach_stderr: true,
                ..Default::default()
            };
            config.tty = take_flag(&mut args, "-t") || take_flag(&mut args, "--tty");
            config.attach_stdin =
                take_flag(&mut args, "-i") || take_flag(&mut args, "--interactive");
            config.user = take_flag_value(&mut args, "-u");
            config.working_dir = take_flag_value(&mut args, "-w");
            while let Some(env) = take_flag_value(&mut args, "-e") {
                if let Some((k, v)) = env.split_once('=') {
                    config.env.insert(k.to_string(), v.to_string());
                }
            }
            let detach = take_flag(&mut args, "-d") || take_flag(&mut args, "--detach");
            if args.is_empty() {
                return Err(Error::InvalidArg(
                    "exec requires a container and a command".to_string(),
                ));
            }
            let container = args.remove(0);
            config.command = args;
            let session = containers.exec_create(&container, config).await?;
            if detach {
                containers.exec_start(&session).await?;
                println!("{session}");
                return Ok(ExitCode::SUCCESS);
            }
            let (exit_code, stdout, stderr) =
                containers.exec_start_attached(&session).await?;
            use std::io::Write;
            std::io::stdout().write_all(&stdout)?;
            std::io::stderr().write_all(&stderr)?;
            Ok(ExitCode::from(exit_code.clamp(0, 255) as u8))
        }
        "attach" => {
            // Non-TTY attach: stream the container's output until it exits,
            // then propagate its exit code.
            let name = args.first().ok_or_else(|| missing("container"))?;
            let entries = containers
                .container_logs(name, &LogOptions::default())
                .await?;
            for entry in entries {
                if entry.stream == "stderr" {
                    eprint!("{}", entry.message);
                } else {
                    print!("{}", entry.message);
                }
            }
            let report = containers.container_wait(name, &[]).await?;
            Ok(ExitCode::from(report.exit_code.clamp(0, 255) as u8))
        }
        "container" => match args.first().map(String::as_str) {
            Some("cleanup") => {
                args.remove(0);
                let rm = take_flag(&mut args, "--rm");
                let exec_session = take_flag_value(&mut args, "--exec");
                let name = args.first().ok_or_else(|| missing("container"))?;
                match exec_session {
                    // `--exec <session>`: the exit command belongs to an
                    // exec session, not the container itself.
                    Some(session) => containers.exec_cleanup(&session, 0).await?,
                    None => containers.container_cleanup(name, rm).await?,
                }
                Ok(ExitCode::SUCCESS)
            }
            _ => {
                // `container X ...` aliases the bare command.
                let sub = args.remove(0);
                Box::pin(run_command(containers, images, &sub, args)).await
            }
        },
        "pod" => run_pod_command(containers, args).await,
        "image" | "images" => run_image_command(containers, images, args).await,
        "volume" => run_volume_command(containers, args).await,
        "version" => {
            print_json(&containers.version().await?);
            Ok(ExitCode::SUCCESS)
        }
        "info" => {
            print_json(&containers.info().await?);
            Ok(ExitCode::SUCCESS)
        }
        "system" => match args.first().map(String::as_str) {
            Some("df") => {
                print_json(&containers.system_df().await?);
                Ok(ExitCode::SUCCESS)
            }
            Some("prune") => {
                print_json(&containers.container_prune().await?);
                print_json(&containers.pod_prune().await?);
                print_json(&images.image_prune(false).await?);
                print_json(&containers.volume_prune(HashMap::new()).await?);
                Ok(ExitCode::SUCCESS)
            }
            _ => Err(Error::InvalidArg(format!(
                "unknown system subcommand: {:?}",
                args.first()
            ))),
        },
        other => Err(Error::InvalidArg(format!("unknown command: {other:?}"))),
    }
}

async fn run_pod_command(
    engine: &dyn ContainerEngine,
    mut args: Vec<String>,
) -> caravel::Result<ExitCode> {
    let sub = if args.is_empty() {
        return Err(missing("pod subcommand"));
    } else {
        args.remove(0)
    };
    match sub.as_str() {
        "create" => {
            let name = take_flag_value(&mut args, "--name");
            let id = engine
                .pod_create(PodCreateOptions {
                    name,
                    ..Default::default()
                })
                .await?;
            println!("{id}");
            Ok(ExitCode::SUCCESS)
        }
        "start" | "stop" | "kill" | "pause" | "unpause" | "restart" => {
            let timeout = take_flag_value(&mut args, "-t").and_then(|v| v.parse().ok());
            let signal = take_flag_value(&mut args, "-s").unwrap_or_else(|| "SIGKILL".into());
            let name = args.first().ok_or_else(|| missing("pod"))?;
            let report = match sub.as_str() {
                "start" => engine.pod_start(name).await,
                "stop" => engine.pod_stop(name, timeout).await,
                "kill" => engine.pod_kill(name, &signal).await,
                "pause" => engine.pod_pause(name).await,
                "unpause" => engine.pod_unpause(name).await,
                _ => engine.pod_restart(name).await,
            };
            match report {
                Ok(report) => {
                    println!("{}", report.id);
                    if report.is_ok() {
                        Ok(ExitCode::SUCCESS)
                    } else {
                        for member in &report.member_errs {
                            if let Some(err) = &member.err {
                                eprintln!("Error: {}: {err}", member.id);
                            }
                        }
                        Ok(ExitCode::from(EXIT_ENGINE_FAILURE))
                    }
                }
                Err(e) if e.is_benign() => {
                    println!("{name}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Err(e),
            }
        }
        "rm" => {
            let force = take_flag(&mut args, "-f") || take_flag(&mut args, "--force");
            let ignore = take_flag(&mut args, "--ignore");
            let name = args.first().ok_or_else(|| missing("pod"))?;
            let report = engine.pod_rm(name, force, ignore).await?;
            println!("{}", report.id);
            Ok(ExitCode::SUCCESS)
        }
        "prune" => {
            print_json(&engine.pod_prune().await?);
            Ok(ExitCode::SUCCESS)
        }
        "ps" | "list" => {
            print_json(&engine.pod_list().await?);
            Ok(ExitCode::SUCCESS)
        }
        "inspect" => {
            let name = args.first().ok_or_else(|| missing("pod"))?;
            print_json(&engine.pod_inspect(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "top" => {
            let name = args.first().ok_or_else(|| missing("pod"))?;
            print_json(&engine.pod_top(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "stats" => {
            let name = args.first().ok_or_else(|| missing("pod"))?;
            print_json(&engine.pod_stats(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "exists" => {
            let name = args.first().ok_or_else(|| missing("pod"))?;
            if engine.pod_exists(name).await?.value {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        other => Err(Error::InvalidArg(format!("unknown pod subcommand: {other:?}"))),
    }
}

async fn run_image_command(
    containers: &dyn ContainerEngine,
    engine: &dyn ImageEngine,
    mut args: Vec<String>,
) -> caravel::Result<ExitCode> {
    let _ = containers;
    let sub = if args.is_empty() {
        "list".to_string()
    } else {
        args.remove(0)
    };
    match sub.as_str() {
        "pull" => {
            let all_tags = take_flag(&mut args, "--all-tags") || take_flag(&mut args, "-a");
            let policy = take_flag_value(&mut args, "--pull-policy").unwrap_or_default();
            let reference = args.first().ok_or_else(|| missing("image"))?;
            let opts = PullOptions {
                policy: PullPolicy::parse(&policy)?,
                all_tags,
                ..Default::default()
            };
            for digest in engine.image_pull(reference, opts).await? {
                println!("{digest}");
            }
            Ok(ExitCode::SUCCESS)
        }
        "push" => {
            let reference = args.first().ok_or_else(|| missing("image"))?;
            println!(
                "{}",
                engine.image_push(reference, PullOptions::default()).await?
            );
            Ok(ExitCode::SUCCESS)
        }
        "list" | "ls" => {
            print_json(&engine.image_list(None).await?);
            Ok(ExitCode::SUCCESS)
        }
        "inspect" => {
            let name = args.first().ok_or_else(|| missing("image"))?;
            print_json(&engine.image_inspect(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "rm" | "rmi" => {
            let force = take_flag(&mut args, "-f") || take_flag(&mut args, "--force");
            let all = take_flag(&mut args, "-a") || take_flag(&mut args, "--all");
            let report = engine.image_remove(&args, force, all).await?;
            for deleted in &report.deleted {
                println!("Deleted: {deleted}");
            }
            for untagged in &report.untagged {
                println!("Untagged: {untagged}");
            }
            for err in &report.errors {
                eprintln!("Error: {err}");
            }
            Ok(ExitCode::from(report.exit_code))
        }
        "tag" => {
            let (reference, target) = two_args(&args, "image tag")?;
            engine.image_tag(&reference, &target).await?;
            Ok(ExitCode::SUCCESS)
        }
        "untag" => {
            let (reference, target) = two_args(&args, "image untag")?;
            engine.image_untag(&reference, &target).await?;
            Ok(ExitCode::SUCCESS)
        }
        "tree" => {
            let what_requires = take_flag(&mut args, "--whatrequires");
            let name = args.first().ok_or_else(|| missing("image"))?;
            for line in engine.image_tree(name, what_requires).await? {
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        }
        "history" => {
            let name = args.first().ok_or_else(|| missing("image"))?;
            print_json(&engine.image_history(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "search" => {
            let limit = take_flag_value(&mut args, "--limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(25);
            let term = args.first().ok_or_else(|| missing("search term"))?;
            print_json(&engine.image_search(term, limit).await?);
            Ok(ExitCode::SUCCESS)
        }
        "import" => {
            let tag = take_flag_value(&mut args, "--tag");
            let path = args.first().ok_or_else(|| missing("tarball"))?;
            println!(
                "{}",
                engine
                    .image_import(std::path::Path::new(path), tag.as_deref())
                    .await?
            );
            Ok(ExitCode::SUCCESS)
        }
        "load" => {
            let input = take_flag_value(&mut args, "-i").ok_or_else(|| missing("-i <file>"))?;
            for name in engine.image_load(std::path::Path::new(&input)).await? {
                println!("Loaded image: {name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        "save" => {
            let output = take_flag_value(&mut args, "-o").ok_or_else(|| missing("-o <file>"))?;
            let name = args.first().ok_or_else(|| missing("image"))?;
            engine
                .image_save(name, std::path::Path::new(&output))
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        "diff" => {
            let name = args.first().ok_or_else(|| missing("image"))?;
            for change in engine.image_diff(name).await? {
                println!("{} {}", change.kind, change.path);
            }
            Ok(ExitCode::SUCCESS)
        }
        "prune" => {
            let all = take_flag(&mut args, "-a") || take_flag(&mut args, "--all");
            print_json(&engine.image_prune(all).await?);
            Ok(ExitCode::SUCCESS)
        }
        "exists" => {
            let name = args.first().ok_or_else(|| missing("image"))?;
            if engine.image_exists(name).await?.value {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        "build" => Err(Error::NotImplemented(
            "image building is delegated to an external builder".to_string(),
        )),
        other => Err(Error::InvalidArg(format!(
            "unknown image subcommand: {other:?}"
        ))),
    }
}

async fn run_volume_command(
    engine: &dyn ContainerEngine,
    mut args: Vec<String>,
) -> caravel::Result<ExitCode> {
    let sub = if args.is_empty() {
        return Err(missing("volume subcommand"));
    } else {
        args.remove(0)
    };
    match sub.as_str() {
        "create" => {
            let volume = engine
                .volume_create(VolumeCreateOptions {
                    name: args.first().cloned(),
                    ..Default::default()
                })
                .await?;
            println!("{}", volume.name);
            Ok(ExitCode::SUCCESS)
        }
        "inspect" => {
            let name = args.first().ok_or_else(|| missing("volume"))?;
            print_json(&engine.volume_inspect(name).await?);
            Ok(ExitCode::SUCCESS)
        }
        "ls" | "list" => {
            print_json(&engine.volume_list(VolumeFilters::default()).await?);
            Ok(ExitCode::SUCCESS)
        }
        "rm" => {
            let force = take_flag(&mut args, "-f") || take_flag(&mut args, "--force");
            let name = args.first().ok_or_else(|| missing("volume"))?;
            engine.volume_rm(name, force).await?;
            println!("{name}");
            Ok(ExitCode::SUCCESS)
        }
        "prune" => {
            print_json(&engine.volume_prune(HashMap::new()).await?);
            Ok(ExitCode::SUCCESS)
        }
        other => Err(Error::InvalidArg(format!(
            "unknown volume subcommand: {other:?}"
        ))),
    }
}

// =============================================================================
// Argument Helpers
// =============================================================================

fn missing(what: &str) -> Error {
    Error::InvalidArg(format!("missing required argument: {what}"))
}

fn two_args(args: &[String], command: &str) -> caravel::Result<(String, String)> {
    match (args.first(), args.get(1)) {
        (Some(a), Some(b)) => Ok((a.clone(), b.clone())),
        _ => Err(Error::InvalidArg(format!(
            "{command} requires two arguments"
        ))),
    }
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|a| a == flag) {
        Some(idx) => {
            args.remove(idx);
            true
        }
        None => false,
    }
}

fn take_flag_value(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let idx = args.iter().position(|a| a == flag)?;
    if idx + 1 >= args.len() {
        return None;
    }
    let value = args.remove(idx + 1);
    args.remove(idx);
    Some(value)
}

/// Parses `create`/`run` flags into a spec plus the detach flag:
/// `--name`, `-e`, `--pod`, `-w`, `--user`, `-t`, `-i`, `--rm`, `-d`,
/// then IMAGE [COMMAND...].
fn parse_create_args(args: &mut Vec<String>) -> caravel::Result<(ContainerSpec, bool)> {
    let mut spec = ContainerSpec {
        name: take_flag_value(args, "--name"),
        ..Default::default()
    };
    while let Some(env) = take_flag_value(args, "-e") {
        if let Some((k, v)) = env.split_once('=') {
            spec.env.insert(k.to_string(), v.to_string());
        }
    }
    spec.pod = take_flag_value(args, "--pod");
    spec.working_dir = take_flag_value(args, "-w");
    spec.user = take_flag_value(args, "--user");
    spec.tty = take_flag(args, "-t") || take_flag(args, "--tty");
    spec.stdin = take_flag(args, "-i") || take_flag(args, "--interactive");
    spec.auto_remove = take_flag(args, "--rm");
    let detach = take_flag(args, "-d") || take_flag(args, "--detach");
    if let Some(rootfs) = take_flag_value(args, "--rootfs") {
        spec.rootfs = Some(rootfs.into());
    } else {
        if args.is_empty() {
            return Err(Error::InvalidArg("create requires an image".to_string()));
        }
        spec.image = Some(args.remove(0));
    }
    spec.command = std::mem::take(args);
    Ok((spec, detach))
}
