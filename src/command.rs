//! Control command parsing and response rendering.
//!
//! Payloads starting with the command marker are dispatched here; anything
//! else is echoed by the caller and never reaches this module. Commands are
//! matched as case-sensitive literal prefixes on the raw payload, so
//! trailing bytes after the verb (a newline from an interactive client,
//! arguments we do not take) are tolerated and ignored.

use crate::stats::ServerStats;
use chrono::Local;

/// Leading byte that marks a payload as a command.
pub const COMMAND_MARKER: u8 = b'/';

/// Check whether a payload is a command rather than data to echo.
pub fn is_command(payload: &[u8]) -> bool {
    payload.first() == Some(&COMMAND_MARKER)
}

/// A recognized control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Query the current local date-time.
    Time,
    /// Query the connection counters.
    Stats,
    /// Ask the server to stop after the current event batch.
    Shutdown,
    /// Command marker present but no verb matched.
    Unknown,
}

impl Command {
    /// Resolve a command from the leading token of a payload.
    pub fn parse(payload: &[u8]) -> Self {
        if payload.starts_with(b"/time") {
            Command::Time
        } else if payload.starts_with(b"/stats") {
            Command::Stats
        } else if payload.starts_with(b"/shutdown") {
            Command::Shutdown
        } else {
            Command::Unknown
        }
    }

    /// Render the single reply for this command.
    ///
    /// Side effects (clearing the running flag for `Shutdown`) are owned by
    /// the event loop, keeping this rendering pure.
    pub fn response(&self, stats: &ServerStats) -> String {
        match self {
            Command::Time => Local::now().format(TIME_FORMAT).to_string(),
            Command::Stats => stats.render(),
            Command::Shutdown => "shutting down".to_string(),
            Command::Unknown => "unknown command".to_string(),
        }
    }
}

/// Format for the `/time` reply, e.g. `2026-08-07 14:03:59`.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    #[test]
    fn test_is_command() {
        assert!(is_command(b"/time"));
        assert!(is_command(b"/"));
        assert!(!is_command(b"hello"));
        assert!(!is_command(b""));
        assert!(!is_command(b" /time"));
    }

    #[test]
    fn test_parse_exact_verbs() {
        assert_eq!(Command::parse(b"/time"), Command::Time);
        assert_eq!(Command::parse(b"/stats"), Command::Stats);
        assert_eq!(Command::parse(b"/shutdown"), Command::Shutdown);
    }

    #[test]
    fn test_parse_tolerates_trailing_bytes() {
        assert_eq!(Command::parse(b"/time\n"), Command::Time);
        assert_eq!(Command::parse(b"/stats please"), Command::Stats);
        assert_eq!(Command::parse(b"/shutdown now\r\n"), Command::Shutdown);
        // No token separator required either
        assert_eq!(Command::parse(b"/statsfoo"), Command::Stats);
    }

    #[test]
    fn test_parse_is_case_sensitive() {
        assert_eq!(Command::parse(b"/TIME"), Command::Unknown);
        assert_eq!(Command::parse(b"/Stats"), Command::Unknown);
    }

    #[test]
    fn test_parse_unknown_verbs() {
        assert_eq!(Command::parse(b"/bogus"), Command::Unknown);
        assert_eq!(Command::parse(b"/"), Command::Unknown);
        assert_eq!(Command::parse(b"/tim"), Command::Unknown);
    }

    #[test]
    fn test_time_response_format() {
        let stats = ServerStats::new();
        let reply = Command::Time.response(&stats);
        assert!(NaiveDateTime::parse_from_str(&reply, TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_stats_response_reflects_counters() {
        let stats = ServerStats::new();
        stats.record_accept();
        stats.record_accept();
        stats.record_disconnect();

        let reply = Command::Stats.response(&stats);
        assert_eq!(reply, "total_clients=2 current_clients=1");
    }

    #[test]
    fn test_literal_responses() {
        let stats = ServerStats::new();
        assert_eq!(Command::Shutdown.response(&stats), "shutting down");
        assert_eq!(Command::Unknown.response(&stats), "unknown command");
    }
}
