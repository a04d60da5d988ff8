/// CLI utilities for consistent output formatting
use std::io::IsTerminal;

/// Get a colored prefix
///
/// Returns bright cyan if stdout is a TTY, plain text otherwise.
pub fn kiln_prefix() -> &'static str {
    if std::io::stdout().is_terminal() {
        "\x1b[96m[kiln]\x1b[0m"
    } else {
        "[kiln]"
    }
}

/// Format a byte count for humans ("1.50 MB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
