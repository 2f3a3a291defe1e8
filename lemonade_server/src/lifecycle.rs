//! Shutdown plumbing
//! =================
//!
//! Signal handlers must not allocate or take locks, so the handler
//! installed here (via `ctrlc`, which uses a self-pipe internally) only
//! pushes one unit into a channel. A dedicated watcher thread turns that
//! into a `watch` flip that the axum servers use for graceful shutdown; the
//! actual teardown (router unload, lock release) runs on the main thread
//! after the servers drain.

use tokio::sync::watch;

/// Install SIGINT/SIGTERM (console control on Windows) handling. The
/// returned receiver flips to `true` exactly once, on the first signal.
pub fn shutdown_signal() -> Result<watch::Receiver<bool>, String> {
    let (tx, rx) = watch::channel(false);
    let (sig_tx, sig_rx) = std::sync::mpsc::channel::<()>();

    ctrlc::set_handler(move || {
        // async-signal-safe: just a channel push
        let _ = sig_tx.send(());
    })
    .map_err(|e| format!("failed to install signal handler: {e}"))?;

    std::thread::Builder::new()
        .name("shutdown-watcher".into())
        .spawn(move || {
            let _ = sig_rx.recv();
            tracing::info!("shutdown signal received");
            let _ = tx.send(true);
        })
        .map_err(|e| format!("failed to spawn shutdown watcher: {e}"))?;

    Ok(rx)
}

/// Future that resolves when the shutdown flag flips.
pub async fn wait(mut rx: watch::Receiver<bool>) {
    // Err means the sender is gone, which only happens on teardown anyway.
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
