//! Detaching from the controlling terminal for `-d`.

use crate::error::{Error, Result};
use std::io;
use tracing::info;

/// Fork, exit the parent, and start a new session in the child.
///
/// Must run before the tokio runtime is built: only the calling thread
/// survives a fork. The listening socket bound earlier is inherited.
pub fn daemonize() -> Result<()> {
    // SAFETY: the process is still single-threaded at this point.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(Error::setup(
            "forking daemon process",
            io::Error::last_os_error(),
        )),
        0 => {
            // SAFETY: setsid has no memory-safety preconditions.
            if unsafe { libc::setsid() } == -1 {
                return Err(Error::setup(
                    "starting new session",
                    io::Error::last_os_error(),
                ));
            }
            info!(pid = std::process::id(), "Running as daemon");
            Ok(())
        }
        _ => std::process::exit(0),
    }
}
