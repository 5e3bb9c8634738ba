use std::{fs, path::Path, sync::OnceLock};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;
pub mod writer;

pub use formatter::*;
pub use writer::*;

use crate::configs::LoggingConfig;

pub(crate) static GLOBAL_FILE_WRITER: OnceLock<LineCappedWriter> = OnceLock::new();

/// `println!` that is mirrored into the log file once logging is initialised.
#[macro_export]
macro_rules! log_println {
    () => {{
        std::println!();
        $crate::common::logger::append_to_file_raw("\n");
    }};
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        std::println!("{}", msg);
        $crate::common::logger::append_to_file_raw(&format!("{}\n", msg));
    }};
}

pub fn append_to_file_raw(msg: &str) {
    if let Some(writer) = GLOBAL_FILE_WRITER.get() {
        writer.append(&strip_ansi_escapes(msg));
    }
}

/// Builds the filter directive string: base level, noisy crates muted, then user filters.
fn filter_directives(config: &LoggingConfig) -> String {
    match config.filters.as_deref().map(str::trim) {
        Some(extra) if !extra.is_empty() => format!("{},log=error,{}", config.level, extra),
        _ => format!("{},log=error", config.level),
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the config.
pub fn init(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let stdout_layer = fmt::layer()
        .event_format(EngineFormatter::new(true))
        .with_ansi(true);

    let file_layer = config.file.as_ref().map(|file_config| {
        if let Some(parent) = Path::new(&file_config.path).parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!("Failed to create log directory: {}", e);
            }
        }

        let writer = LineCappedWriter::new(file_config.path.clone(), file_config.max_lines);
        let _ = GLOBAL_FILE_WRITER.set(writer.clone());
        fmt::layer()
            .with_writer(writer)
            .event_format(EngineFormatter::new(false))
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_without_filters() {
        let config = LoggingConfig::default();
        assert_eq!(filter_directives(&config), "info,log=error");
    }

    #[test]
    fn directives_with_filters() {
        let config = LoggingConfig {
            level: "debug".into(),
            filters: Some("radiorelay::audio=trace".into()),
            file: None,
        };
        assert_eq!(
            filter_directives(&config),
            "debug,log=error,radiorelay::audio=trace"
        );
    }
}
