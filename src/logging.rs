use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Console log level:
/// - `0` prints nothing
/// - `1` only critical errors and warnings
/// - `2` verbose lifecycle tracing for debugging
///
/// Messages are emitted through the `log` facade (`warn!` for level 1,
/// `trace!` for level 2), so an installed logger still applies its own
/// filtering on top.
static LOG_LEVEL: AtomicU8 = AtomicU8::new(1);

/// Sets the runtime log level (clamped to `0..=2`).
pub fn set_log_level(level: u8) {
    LOG_LEVEL.store(level.min(2), Ordering::Relaxed);
}

/// Returns the current runtime log level.
pub fn get_log_level() -> u8 {
    LOG_LEVEL.load(Ordering::Relaxed)
}

/// Level-2 lifecycle trace in the `Starting      [Task][name]` format.
pub(crate) fn lifecycle(stage: &str, subject: &dyn fmt::Display) {
    if get_log_level() >= 2 {
        log::trace!("{stage:<12} {subject}");
    }
}

/// Level-1 critical warning.
pub(crate) fn critical(message: fmt::Arguments<'_>) {
    if get_log_level() >= 1 {
        log::warn!("{message}");
    }
}
