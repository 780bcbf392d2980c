use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;

use anyhow::Context;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGTERM;
use signal_hook::iterator::Handle;
use signal_hook::iterator::Signals;
use tracing::info;

/// Flips `shutdown` on the first SIGINT or SIGTERM.
pub struct SignalHandler {
    handle: Handle,
}

impl SignalHandler {
    pub fn setup(shutdown: Arc<AtomicBool>) -> anyhow::Result<Self> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
        let handle = signals.handle();

        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!(signal = sig, "Received signal, shutting down");
                    shutdown.store(true, Ordering::SeqCst);
                }
            })
            .context("failed to spawn signal handler")?;

        Ok(Self { handle })
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.handle.close();
    }
}
