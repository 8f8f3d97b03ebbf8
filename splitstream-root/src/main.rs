use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use std::process;

use splitstream_lib::proc_events::ProcEvent;
use splitstream_lib::split_tunnel::Engine;
use splitstream_lib::{cgroup, config, logging};

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

async fn daemon(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let config = config::read(&args.config_path).await.map_err(|err| {
        tracing::error!(error = ?err, path = ?args.config_path, "unable to read configuration file");
        exitcode::NOINPUT
    })?;

    // the cgroup hierarchy is provisioned by packaging; refuse to run half-blind
    cgroup::verify_cgroup_setup(&config.cgroups).map_err(|err| {
        tracing::error!(error = %err, "cgroup hierarchy is not in place");
        exitcode::UNAVAILABLE
    })?;

    let mut engine = Engine::new(config.cgroups.clone()).map_err(|err| {
        tracing::error!(error = %err, "unable to set up firewall access");
        exitcode::UNAVAILABLE
    })?;

    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    let (event_sender, mut event_receiver) = mpsc::channel::<ProcEvent>(64);

    if let Err(error) = engine
        .initiate_connection(&config.firewall_params(), &config.tunnel, event_sender.clone())
        .await
    {
        // continue without split tunneling; SIGHUP retries
        tracing::error!(%error, "could not start split tunnel session");
    }

    tracing::info!("entering main daemon loop");

    loop {
        tokio::select! {
            Some(_) = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            Some(_) = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            Some(_) = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading configuration");
                match config::read(&args.config_path).await {
                    Ok(config) if engine.is_active() => {
                        engine.update_split_tunnel(&config.firewall_params(), &config.tunnel).await;
                    }
                    Ok(config) => {
                        if let Err(error) = engine
                            .initiate_connection(&config.firewall_params(), &config.tunnel, event_sender.clone())
                            .await
                        {
                            tracing::error!(%error, "could not start split tunnel session");
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, "keeping previous configuration");
                    }
                }
            }
            Some(event) = event_receiver.recv() => {
                engine.handle_proc_event(event);
            }
            else => {
                tracing::error!("unexpected channel closure");
                engine.shutdown_connection().await;
                return Err(exitcode::IOERR);
            }
        }
    }

    engine.shutdown_connection().await;
    Ok(())
}

fn setup_logging(log_file: &Option<std::path::PathBuf>) -> Result<(), exitcode::ExitCode> {
    match log_file {
        Some(log_path) => logging::setup_log_file(log_path).map_err(|err| {
            eprintln!("Failed to open log file {}: {}", log_path.display(), err);
            exitcode::IOERR
        }),
        None => {
            logging::setup_stdout();
            Ok(())
        }
    }
}

/// All engine work is serialized on one thread; the kernel event rate is
/// far below what a single loop handles.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = cli::parse();

    if let Err(code) = setup_logging(&args.log_file) {
        process::exit(code);
    }

    match daemon(args).await {
        Ok(_) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
