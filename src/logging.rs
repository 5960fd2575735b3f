//! Logger setup: `env_logger` writing to stderr and to a size-rotated file.

use crate::config::LogConfig;
use crate::error::BridgeError;
use env_logger::{Builder, Env, Target};
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// The log file rotates once it grows past this size.
pub const MAX_LOG_BYTES: usize = 10 * 1024 * 1024;
/// Rotated files kept next to the live one (`<log>.1` is the newest).
pub const LOG_BACKUPS: usize = 10;

/// Open `path` for appending, rolling over to `<path>.1`, `<path>.2`, ...
/// once it passes `max_bytes`. Lines are never split across files.
fn rotating_file(path: &Path, max_bytes: usize, backups: usize) -> io::Result<FileRotate<AppendCount>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    // FileRotate swallows open errors; surface them here instead
    OpenOptions::new().create(true).append(true).open(path)?;

    Ok(FileRotate::new(
        path,
        AppendCount::new(backups),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    ))
}

/// Mirrors every log line to stderr.
struct Tee {
    file: FileRotate<AppendCount>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}

/// Install the global logger. `RUST_LOG` overrides the level picked by
/// `-D`.
pub fn init(config: &LogConfig) -> Result<(), BridgeError> {
    let file = rotating_file(&config.path, MAX_LOG_BYTES, LOG_BACKUPS).map_err(|source| {
        BridgeError::LogFile {
            path: config.path.display().to_string(),
            source,
        }
    })?;
    let level = if config.debug { "debug" } else { "info" };

    // Fails only if a logger is already installed, which is harmless
    let _ = Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init();
    Ok(())
}
