use anyhow::Result;
use std::sync::{Mutex, MutexGuard};

pub const FILESTACK_CDN: &str = "https://cdn.filestackcontent.com/";

/// Lock a mutex and return a Result.
/// Finds poison errors and returns them as Anyhow errors.
pub fn lock_mutex<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| anyhow::anyhow!("Mutex poisoned: {}", e))
}

/// Returns `handle_or_url` unchanged when it is already an http(s) URL, otherwise
/// treats it as a Filestack handle and points it at the Filestack CDN.
pub fn build_url(handle_or_url: &str) -> String {
    if handle_or_url.starts_with("https://") || handle_or_url.starts_with("http://") {
        handle_or_url.to_string()
    } else {
        format!("{}{}", FILESTACK_CDN, handle_or_url)
    }
}

/// Human readable byte count, e.g. `1.5 MB`.
pub fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes.max(0), UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
