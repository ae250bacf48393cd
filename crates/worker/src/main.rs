mod cli;
mod shutdown;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use bundle_worker_core::identity::ensure_identity;
use bundle_worker_engine::{start_worker, WorkerConfig, WorkerEvent, WorkerExit};

use crate::cli::{parse_device_set, Cli};
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownEvent};

fn installed_memory_bytes() -> u64 {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size <= 0 || pages <= 0 {
        return 0;
    }
    (page_size as u64).saturating_mul(pages as u64)
}

fn all_cpus() -> Vec<u32> {
    let n = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (0..n as u32).collect()
}

fn default_code_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let identity = ensure_identity(cli.id.clone(), cli.tag.clone())?;
    let worker_id = identity.id.clone();

    let cpus = if cli.cpuset == "all" {
        all_cpus()
    } else {
        parse_device_set(&cli.cpuset).map_err(|err| anyhow::anyhow!(err))?
    };
    if cpus.is_empty() {
        anyhow::bail!("cpuset must not be empty");
    }
    let gpus = if cli.gpuset == "auto" {
        None
    } else {
        Some(parse_device_set(&cli.gpuset).map_err(|err| anyhow::anyhow!(err))?)
    };

    let worker = start_worker(WorkerConfig {
        server_url: cli.server_url.clone(),
        identity,
        work_dir: cli.work_dir.clone(),
        code_dir: cli.code_dir.clone().unwrap_or_else(default_code_dir),
        cpus,
        gpus,
        memory_bytes: installed_memory_bytes(),
        dependency_quota_bytes: cli.work_dir_quota_bytes,
        image_quota_bytes: cli.image_quota_bytes,
        network_prefix: cli.network_prefix.clone(),
        grace_period: Duration::from_secs(cli.grace_period_secs),
        checkin_retry: WorkerConfig::DEFAULT_CHECKIN_RETRY,
        cleanup_interval: WorkerConfig::DEFAULT_CLEANUP_INTERVAL,
    });
    let mut events = worker.subscribe();

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown_tx);

    println!(
        "bundle-worker {} id={worker_id} server={}",
        env!("CARGO_PKG_VERSION"),
        cli.server_url
    );

    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("Stop requested — finishing live runs, accepting no new ones (press CTRL+C again to exit immediately).");
                        worker.request_drain();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again — exiting immediately.");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    WorkerEvent::Started | WorkerEvent::DrainRequested => {}
                    WorkerEvent::Info { message } => println!("{message}"),
                    WorkerEvent::RunAssigned { uuid } => println!("run {uuid}: assigned"),
                    WorkerEvent::RunStage { uuid, stage } => println!("run {uuid}: {stage}"),
                    WorkerEvent::RunFinished { outcome } => {
                        match outcome.failure_message {
                            Some(message) => {
                                println!("run {}: failed ({message})", outcome.uuid)
                            }
                            None => println!(
                                "run {}: finished (exit code {})",
                                outcome.uuid,
                                outcome
                                    .exit_code
                                    .map(|code| code.to_string())
                                    .unwrap_or_else(|| "unknown".to_string())
                            ),
                        }
                    }
                    WorkerEvent::UpgradeRequested => {
                        println!("Upgrade requested; draining before restart.")
                    }
                    WorkerEvent::Warning { message } => eprintln!("{message}"),
                    WorkerEvent::Error { message } => eprintln!("{message}"),
                    WorkerEvent::Stopped => break,
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    match worker.wait().await? {
        WorkerExit::Clean => Ok(()),
        WorkerExit::Upgrade => std::process::exit(123),
    }
}
