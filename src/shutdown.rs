//! The process-level cancellation flag.
//!
//! Each role's event loop checks this once per iteration and exits 0 once it is set, instead of
//! being hard-killed by the operator's signal (Section 5's "shutdown is a signal that sets a flag
//! checked each loop iteration").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Installs a `SIGINT`/`SIGTERM` handler that flips the returned flag. Failure to install the
/// handler is not fatal: the process still terminates correctly on a signal, it just does so
/// without running a role's shutdown behavior (flushing the learner's emittable prefix, say).
pub fn install() -> ShutdownFlag {
    let flag = Arc::new(AtomicBool::new(false));
    let for_handler = Arc::clone(&flag);

    if let Err(e) = ctrlc::set_handler(move || {
        for_handler.store(true, Ordering::SeqCst);
    }) {
        warn!("could not install shutdown signal handler: {}", e);
    }

    ShutdownFlag(flag)
}
