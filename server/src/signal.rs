//! Signal handling for graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Install a SIGINT/SIGTERM handler that invokes `on_shutdown` once.
/// A second signal forces an immediate exit.
pub fn install(on_shutdown: impl Fn() + Send + 'static) {
    let fired = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if fired.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, stopping");
        on_shutdown();
    })
    .expect("failed to set signal handler");
}
