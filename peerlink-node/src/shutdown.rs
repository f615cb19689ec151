//! Graceful shutdown coordination.
//!
//! The engine pumps on the main thread, so signals are awaited on a separate
//! thread with its own small runtime and forwarded through [`NetHandle`].

use std::io;
use std::thread;

use peerlink_net::NetHandle;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

/// Shut the engine down when a signal arrives.
pub fn spawn_signal_watcher(net: NetHandle) -> io::Result<thread::JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            match runtime.block_on(wait_for_shutdown_signal()) {
                Ok(()) => net.shutdown(),
                Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
            }
        })
}
