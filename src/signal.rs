//! Signal masking for manually-spawned OS threads
//!
//! Grounded on `original_source/src/util/util.cpp`'s `mask_signal`: worker
//! threads block `SIGPIPE` so a write to a closed pipe (hpws stdin, a
//! disconnected control socket peer) can't take the process down, and
//! leave `SIGINT` handling to the main thread's `tokio::signal::ctrl_c`.

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tracing::warn;

/// Block `SIGPIPE` on the calling thread. Call this at the top of any OS
/// thread that does blocking I/O against a pipe or socket the peer may
/// have already closed.
pub fn block_sigpipe() {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGPIPE);
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None) {
        warn!("failed to block SIGPIPE on worker thread: {}", e);
    }
}
