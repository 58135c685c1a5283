//! Small helpers shared across modules.

/// Truncate response bodies to a readable length for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in seconds.
pub fn unix_timestamp_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_text_caps_length() {
        let long = "x".repeat(400);
        assert_eq!(compact_text(&long).chars().count(), 180);
    }
}
