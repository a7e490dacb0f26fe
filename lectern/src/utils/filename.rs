//! Local artifact naming.

use chrono::{DateTime, SecondsFormat, Utc};

/// Longest topic fragment carried into a file name.
const MAX_TOPIC_LEN: usize = 50;

/// Replace every character outside `[A-Za-z0-9_-]` with an underscore.
pub fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the local file name for a downloaded artifact:
/// `<sanitized-topic>_<ISO-timestamp>_<externalRecordingId>.mp4`.
pub fn artifact_file_name(
    topic: &str,
    start_time: DateTime<Utc>,
    external_recording_id: &str,
) -> String {
    let topic: String = topic.chars().take(MAX_TOPIC_LEN).collect();
    let stamp = start_time.to_rfc3339_opts(SecondsFormat::Secs, true);
    format!(
        "{}_{}_{}.mp4",
        sanitize_component(&topic),
        sanitize_component(&stamp),
        sanitize_component(external_recording_id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize_replaces_outside_charset() {
        assert_eq!(sanitize_component("Matemáticas Básicas"), "Matem_ticas_B_sicas");
        assert_eq!(sanitize_component("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_component("plain-name_01"), "plain-name_01");
    }

    #[test]
    fn test_artifact_file_name_shape() {
        let start = Utc.with_ymd_and_hms(2025, 8, 18, 10, 30, 0).unwrap();
        let name = artifact_file_name("Matemáticas Básicas", start, "abc123");
        assert_eq!(name, "Matem_ticas_B_sicas_2025-08-18T10_30_00Z_abc123.mp4");
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn test_topic_truncated_to_fifty_chars() {
        let long = "x".repeat(80);
        let start = Utc.with_ymd_and_hms(2025, 8, 18, 10, 30, 0).unwrap();
        let name = artifact_file_name(&long, start, "id");
        let topic_part = name.split('_').next().unwrap();
        assert_eq!(topic_part.len(), 50);
    }
}
