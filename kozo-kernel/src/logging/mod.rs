//! Kernel logging
//!
//! All diagnostics go through the `log` facade; the sink is a ring
//! buffer plus the early serial console. See [`logger`] and [`buffer`].

pub mod buffer;
pub mod logger;

/// Initialise the serial console and the log facade.
pub fn init() {
    crate::arch::serial::init();
    logger::init();
    log::info!("logging online");
}
