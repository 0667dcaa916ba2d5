//! Foundational low-level utilities shared across sentinel crates.
//!
//! Provides atomic file-write helpers, append-only JSONL logging, and
//! Unix-time utilities used by job record persistence and idle/staleness
//! calculations.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{append_line, write_text_atomic};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn time_utils_round_trip_bounds() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("record.json");
        write_text_atomic(&path, "{\"status\":\"running\"}").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"status\":\"running\"}");
    }

    #[test]
    fn append_line_creates_parent_and_appends() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("nested/events.jsonl");
        append_line(&path, "{\"event\":\"a\"}").expect("first append");
        append_line(&path, "{\"event\":\"b\"}").expect("second append");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"event\":\"a\"}\n{\"event\":\"b\"}\n");
    }
}
