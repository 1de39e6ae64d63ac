//! Logger initialization
//!
//! Both binaries log through the `log` facade to **stdout**: the supervisor
//! recognizes child metrics by scanning stdout lines, and container commands
//! already merge stderr into stdout. The `output` level exists for
//! compatibility with the control surface and maps to `debug`.

use std::io::Write;

use anyhow::bail;
use log::LevelFilter;

use crate::Result;

/// Initialize the process logger.
///
/// `level` is one of `output`, `debug`, `info`. When `time_prefix` is false
/// only the severity tag is printed, which keeps child stdout deterministic
/// for the parsing side.
pub fn init(level: &str, time_prefix: bool) -> Result<()> {
    let filter = match level {
        "output" | "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        other => bail!(
            "invalid log level: {}. Possible values: output, debug, info",
            other
        ),
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(filter)
        .target(env_logger::Target::Stdout);

    if time_prefix {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level_tag(record.level()),
                record.args()
            )
        });
    } else {
        builder.format(|buf, record| {
            writeln!(buf, "[{}] {}", level_tag(record.level()), record.args())
        });
    }

    // try_init so tests can call this repeatedly
    let _ = builder.try_init();
    Ok(())
}

fn level_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "error",
        log::Level::Warn => "warning",
        log::Level::Info => "info",
        log::Level::Debug => "debug",
        log::Level::Trace => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_rejects_unknown_level() {
        assert!(init("verbose", true).is_err());
    }

    #[test]
    fn test_init_accepts_known_levels() {
        for level in ["output", "debug", "info"] {
            assert!(init(level, false).is_ok());
        }
    }
}
