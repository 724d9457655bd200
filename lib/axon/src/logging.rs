//! Structured logging plumbing shared by the whole runtime.
//!
//! Components own a child `Logger` carrying their identity keys and accept
//! `Into<Option<&Logger>>` in constructors so tests can pass `None` and get
//! a discarding logger.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::Config;

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Build the default terminal logger used by binaries.
pub fn terminal() -> Logger {
    let config: sloggers::LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("embedded logger config must parse");

    config.build_logger().expect("terminal logger construction failed")
}

/// A logger that swallows everything. Used as the fallback when a component
/// is constructed without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolve an optional parent logger into a concrete child logger.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L, values: slog::OwnedKV<impl slog::SendSyncRefUnwindSafeKV + 'static>) -> Logger {
    match log.into() {
        Some(log) => log.new(values),
        None => Logger::root(Discard, values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_logger_accepts_records() {
        let log = discard();
        info!(log, "dropped"; "key" => 1);
    }

    #[test]
    fn test_child_from_none() {
        let log = child(None, o!("component" => "test"));
        debug!(log, "still dropped");
    }
}
