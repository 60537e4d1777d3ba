//! Signal-driven shutdown.
//!
//! The first SIGINT / SIGTERM / SIGHUP cancels the returned token; the
//! pipeline checks it between records and keeps everything committed so
//! far. A repeat signal skips the drain and exits immediately.

use tokio_util::sync::CancellationToken;

/// Spawn the signal listener and hand back the token the pipeline polls.
pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn(listen(token.clone()));
    token
}

async fn listen(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        // Register once so a signal arriving between the two waits is
        // not dropped.
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
        announce_drain();
        token.cancel();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        announce_drain();
        token.cancel();
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
    }

    tracing::warn!("Second signal received, exiting without draining");
    std::process::exit(130);
}

fn announce_drain() {
    tracing::info!("Shutdown requested, finishing in-flight uploads");
    tracing::info!("Send the signal again to exit immediately");
}
