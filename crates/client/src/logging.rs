//! Logging macros.
//!
//! Library code logs through `log_info!`/`log_warn!`/`log_error!`/`log_debug!`,
//! which format eagerly and hand the text to `tracing`. The binary installs the
//! `tracing_subscriber` that renders them.

/// Log an info message
pub fn log_info_impl(msg: &str) {
    tracing::info!("{}", msg);
}

/// Log an error message
pub fn log_error_impl(msg: &str) {
    tracing::error!("{}", msg);
}

/// Log a warning message
pub fn log_warn_impl(msg: &str) {
    tracing::warn!("{}", msg);
}

/// Log a debug message
pub fn log_debug_impl(msg: &str) {
    tracing::debug!("{}", msg);
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info_impl(&format!($($arg)*))
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error_impl(&format!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_warn_impl(&format!($($arg)*))
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug_impl(&format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn macros_accept_format_arguments() {
        let topic = "/topic/conversations/c1";
        crate::log_info!("Subscribed to {}", topic);
        crate::log_warn!("Retry {} of {}", 1, 5);
        crate::log_error!("Failed: {err}", err = "boom");
        crate::log_debug!("plain text");
    }
}
