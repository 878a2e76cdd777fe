//! Foundational low-level utilities shared across tern crates.
//!
//! Provides atomic record writes, timestamps, and path sanitising used by the
//! registry, history log, and runtime state directories.

pub mod atomic_io;
pub mod path_utils;
pub mod time_utils;

pub use atomic_io::{read_json_if_exists, write_json_atomic, write_text_atomic};
pub use path_utils::{repository_dir_name, sanitize_for_path};
pub use time_utils::{current_rfc3339, current_unix_timestamp_ms, is_idle_past};

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn unit_is_idle_past_respects_bounds() {
        assert!(!is_idle_past(1_000, 500, 1_499));
        assert!(is_idle_past(1_000, 500, 1_500));
        assert!(!is_idle_past(2_000, 500, 1_000));
    }

    #[test]
    fn unit_sanitize_for_path_replaces_separators() {
        assert_eq!(sanitize_for_path("feature/login fix"), "feature_login_fix");
        assert_eq!(sanitize_for_path(".."), "_");
        assert_eq!(repository_dir_name("owner", "repo"), "owner__repo");
    }

    #[test]
    fn functional_write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("nested").join("sample.txt");
        write_text_atomic(&path, "hello world").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn integration_json_record_round_trips_and_missing_is_none() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("record.json");
        assert!(read_json_if_exists::<BTreeMap<String, u64>>(&path)
            .expect("read missing")
            .is_none());

        let record = BTreeMap::from([("a".to_string(), 1_u64)]);
        write_json_atomic(&path, &record).expect("write");
        let loaded = read_json_if_exists::<BTreeMap<String, u64>>(&path)
            .expect("read")
            .expect("present");
        assert_eq!(loaded, record);
    }

    #[test]
    fn regression_write_text_atomic_rejects_directory_destination() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let error = write_text_atomic(tempdir.path(), "x").expect_err("directory");
        assert!(error.to_string().contains("is a directory"));
    }
}
