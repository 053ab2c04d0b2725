// src/logging.rs
//
// Timestamped logging for the driver and its tools.
//
// `tlog!` writes `HH:MM:SS.mmm <message>` to stderr. Messages carry a bracketed
// component tag ("[cbt_link]", "[controller]", ...). When a log file has been
// attached with `init_file_logging`, every line is mirrored into it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Log file currently mirrored by `tlog!`
#[doc(hidden)]
pub struct LogSink {
    pub file: File,
    pub path: PathBuf,
}

#[doc(hidden)]
pub static LOG_FILE: Mutex<Option<LogSink>> = Mutex::new(None);

const LOG_NAME_FORMAT: &str = "%Y%m%d-%H%M%S-cbt.log";
const LATEST_LINK: &str = "cbt.log";

fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Start mirroring log lines to a new `YYYYMMDD-HHMMSS-cbt.log` in `log_dir`.
///
/// On Unix, `cbt.log` in the same directory is pointed at the new file.
/// Returns the path of the new file.
pub fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("Failed to create log dir: {}", e))?;

    let filename = chrono::Local::now().format(LOG_NAME_FORMAT).to_string();
    let path = log_dir.join(&filename);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Failed to create log file {}: {}", path.display(), e))?;

    #[cfg(unix)]
    {
        let link = log_dir.join(LATEST_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            eprintln!("{} [logging] Failed to update {}: {}", stamp(), LATEST_LINK, e);
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(LogSink {
            file,
            path: path.clone(),
        });
    }

    // Not tlog!: the sink lock was just released and this line belongs on stderr only
    eprintln!("{} [logging] Logging to {}", stamp(), path.display());
    Ok(path)
}

/// Detach the log file, if any.
pub fn stop_file_logging() {
    let detached = LOG_FILE.lock().ok().and_then(|mut guard| guard.take());
    if let Some(sink) = detached {
        eprintln!("{} [logging] Stopped logging to {}", stamp(), sink.path.display());
    }
}

/// Path of the attached log file.
pub fn log_file_path() -> Option<PathBuf> {
    LOG_FILE
        .lock()
        .ok()
        .and_then(|guard| guard.as_ref().map(|sink| sink.path.clone()))
}

/// Timestamped logging macro, mirrored to the log file when one is attached.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!("{} {}", chrono::Local::now().format("%H:%M:%S%.3f"), format_args!($($arg)*));
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(sink) = guard.as_mut() {
                let _ = writeln!(sink.file, "{}", msg);
            }
        }
    }};
}
