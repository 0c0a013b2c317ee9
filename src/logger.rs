use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;



/*
    @@@
    @logs_tracing();
    . Creates a daily-rotating log file (<log_dir>/warden.log) behind a non-blocking writer.
    . Installs a fmt subscriber (no ANSI, with target and level) capped at `level`.
    . Returns the guard; dropping it flushes and stops the writer thread.
*/
pub fn logs_tracing(log_dir: &str, level: tracing::Level) -> anyhow::Result<WorkerGuard> {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "warden.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_writer(non_blocking)
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;
    Ok(guard)
}
