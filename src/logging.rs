//! Structured logging with timestamps, source locations, and ANSI colour support.
//!
//! Provides the [`clog!`] macro for consistent log output in the format:
//!
//! ```text
//! 20260827T09:15:02.000 - src/consolidate.rs:118 - submit: no match, created primary c-4
//! ```
//!
//! By default log lines go to stderr; call [`set_writer`] to redirect output
//! to any [`std::io::Write`] implementor. Installing a custom writer also
//! disables ANSI colour codes.
//!
//! Contact emails and phone numbers are PII and must never be logged
//! verbatim; use [`email`] and [`phone`] to mask them first.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

use crate::store::ContactId;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize the logging system. Call once at startup before any logging.
/// Detects whether stderr supports ANSI colours.
pub fn init() {
    let is_terminal = io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);
}

/// Replace the log writer. All subsequent [`clog!`] output goes to `w`.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap() = w;
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Colour palette for contact ids — bright, visually distinct colours.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
];

/// Format a contact id with a consistent colour derived from the id itself,
/// so the same contact is easy to follow across log lines.
pub fn contact_id(id: ContactId) -> String {
    if colour_enabled() {
        let colour = ID_COLOURS[(id as usize) % ID_COLOURS.len()];
        format!("{colour}c-{id}{RESET}")
    } else {
        format!("c-{id}")
    }
}

/// Mask an email address for logging: `john@example.com` -> `j***@e***.com`.
pub fn email(addr: &str) -> String {
    match addr.split_once('@') {
        Some((local, domain)) => {
            let l = local.chars().next().map(String::from).unwrap_or_default();
            let (d, tld) = match domain.rsplit_once('.') {
                Some((name, tld)) => (
                    name.chars().next().map(String::from).unwrap_or_default(),
                    format!(".{tld}"),
                ),
                None => (
                    domain.chars().next().map(String::from).unwrap_or_default(),
                    String::new(),
                ),
            };
            format!("{l}***@{d}***{tld}")
        }
        None => "***".to_string(),
    }
}

/// Mask a phone number for logging, keeping only the last four characters.
/// Counted in characters, not bytes; phone values are arbitrary strings.
pub fn phone(number: &str) -> String {
    let count = number.chars().count();
    if count > 4 {
        let tail: String = number.chars().skip(count - 4).collect();
        format!("***{tail}")
    } else {
        "***".to_string()
    }
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y, m, d, hours, minutes, seconds, millis
    )
}

/// Write a single log line to the current writer.
///
/// Called by the [`clog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line to the current writer with timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// clog!("merge: repointed group {} at {}", logging::contact_id(b), logging::contact_id(a));
/// ```
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
