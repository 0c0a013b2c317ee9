use anyhow::Context;
use futures::StreamExt;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{info, warn};
use warden::logger::logs_tracing;
use warden::parse::parser;
use warden::shell::run_shell;
use warden::Supervisor;

const DEFAULT_CONFIG: &str = "config/warden.yml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let cfg = parser(&path)?;
    let guard = logs_tracing(&cfg.log_dir, cfg.level())?;
    info!(config = %path, services = cfg.services.len(), "warden starting");

    let log_dir = cfg.log_dir.clone();
    let services = cfg.services.clone();
    let spawn_timeout = cfg.spawn_timeout_ms;
    let sup = Supervisor::new(Arc::new(cfg));

    for (name, svc) in &services {
        sup.register_service(name, &svc.executable, svc.environment.clone()).await;
    }
    if let Some(ms) = spawn_timeout {
        sup.set_spawn_timeout(Duration::from_millis(ms)).await;
    }
    for (name, _) in services.iter().filter(|(_, svc)| svc.autostart) {
        if let Err(e) = sup.start_service(name, Vec::new()).await {
            warn!(service = %name, error = %e, "autostart failed");
            eprintln!("autostart of `{}` failed: {}", name, e);
        }
    }

    // The signal task only reports; cleanup happens below, on this task.
    let signals = Signals::new([SIGHUP, SIGINT, SIGTERM]).context("failed to install signal handlers")?;
    let handle = signals.handle();
    let (sig_tx, sig_rx) = oneshot::channel();
    let sig_task = tokio::spawn(async move {
        let mut signals = signals;
        if let Some(sig) = signals.next().await {
            let _ = sig_tx.send(sig);
        }
    });

    let shell_sup = sup.clone();
    let rt = Handle::current();
    let mut shell = tokio::task::spawn_blocking(move || run_shell(shell_sup, &log_dir, rt));

    let signalled = tokio::select! {
        res = &mut shell => {
            res.context("shell thread panicked")?.context("shell failed")?;
            false
        }
        Ok(sig) = sig_rx => {
            info!(signal = sig, "signal received, stopping all services");
            true
        }
    };

    handle.close();
    sig_task.abort();
    sup.shutdown().await;
    // Flush queued log lines, the shutdown report included.
    drop(guard);

    if signalled {
        // The shell thread may still be parked in readline; returning would make
        // the runtime wait for it forever.
        std::process::exit(0);
    }
    Ok(())
}
