use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wires SIGINT/SIGTERM to the cancellation token driving the plugin.
///
/// Returns a child token that observes the signal; the caller awaits it
/// and then runs the graceful stop sequence. A second signal while the
/// drain is in progress aborts the process immediately.
pub fn install_signal_handlers(cancel: &CancellationToken) -> CancellationToken {
    let observed = cancel.child_token();
    let trigger = cancel.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining in-flight replication");
        trigger.cancel();

        wait_for_signal().await;
        info!("second shutdown signal received, aborting");
        std::process::exit(130);
    });

    observed
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("SIGINT handler installation failed");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation failed")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
