//! redostreamd - the redo-log change data capture daemon.
//!
//! One argument: the configuration file. Signals: SIGINT/SIGTERM request
//! a soft stop (drain and checkpoint), SIGUSR1 dumps worker status,
//! SIGUSR2 dumps memory usage.

use anyhow::Context;
use clap::Parser;
use redostream::{Config, Ctx, Supervisor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "redostreamd",
    version,
    about = "Redo-log change data capture daemon"
)]
struct Cli {
    /// Path to the JSON configuration file.
    config: PathBuf,
}

/// The signal handler only records the signal number; the supervisor's
/// wait loop reacts through the weakly held context.
static SIGNAL_CTX: OnceLock<Weak<Ctx>> = OnceLock::new();
static PENDING_SIGNAL: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_signal(signal: libc::c_int) {
    PENDING_SIGNAL.store(signal as u32, Ordering::Release);
}

fn install_signal_handlers(ctx: &Arc<Ctx>) {
    SIGNAL_CTX.set(Arc::downgrade(ctx)).ok();
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler is async-signal-safe; it only stores an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGUSR1, handler);
        libc::signal(libc::SIGUSR2, handler);
    }

    // A small watcher thread translates the recorded signal into context
    // calls, keeping the handler itself minimal.
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(|| loop {
            std::thread::sleep(std::time::Duration::from_millis(100));
            let signal = PENDING_SIGNAL.swap(0, Ordering::AcqRel);
            if signal == 0 {
                continue;
            }
            let Some(ctx) = SIGNAL_CTX.get().and_then(Weak::upgrade) else {
                return;
            };
            match signal as libc::c_int {
                libc::SIGINT | libc::SIGTERM => {
                    info!("stop signal received");
                    ctx.stop_soft();
                }
                libc::SIGUSR1 => ctx.request_status_dump(),
                libc::SIGUSR2 => ctx.request_memory_dump(),
                _ => {}
            }
        })
        .expect("spawn signal watcher");
}

fn init_tracing(log_level: u8, trace_mask: u32) {
    let level = match log_level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        _ => "debug",
    };
    let mut filter = EnvFilter::new(format!("redostream={level},redostreamd={level}"));
    if trace_mask != 0 {
        // Any trace bit raises per-subsystem verbosity to trace.
        filter = EnvFilter::new(format!("redostream=trace,redostreamd={level}"));
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            // The subscriber may not be installed yet (config errors).
            eprintln!("redostreamd: {err:#}");
            error!("{err:#}");
            1
        }
    });
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let handle = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(handle.config.log_level, handle.config.trace);
    info!(
        config = %cli.config.display(),
        source = handle.config.source().name,
        "redostreamd starting"
    );

    let supervisor = Supervisor::new(&handle).context("building the pipeline")?;
    install_signal_handlers(&supervisor.ctx());
    supervisor.run().context("replication failed")?;
    Ok(())
}
