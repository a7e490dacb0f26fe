//! Forum publication: target selection, subject and embed formatting.

use chrono::{DateTime, Utc};

use crate::clients::lms::Forum;

/// The forum recordings are posted into when a course has one.
const PREFERRED_FORUM_NAME: &str = "Clases Grabadas";

/// Announcement-style fallbacks, tried in order.
const ANNOUNCEMENT_NAMES: [&str; 3] = ["Anuncios", "Announcements", "News forum"];

/// Pick the destination forum: "Clases Grabadas" if present, else the
/// course's announcements forum, else the first forum the listing returned.
pub fn choose_forum(forums: &[Forum]) -> Option<&Forum> {
    if let Some(preferred) = forums
        .iter()
        .find(|f| f.name.trim().eq_ignore_ascii_case(PREFERRED_FORUM_NAME))
    {
        return Some(preferred);
    }

    for name in ANNOUNCEMENT_NAMES {
        if let Some(forum) = forums.iter().find(|f| f.name.trim().eq_ignore_ascii_case(name)) {
            return Some(forum);
        }
    }

    forums.first()
}

/// Discussion subject: `<topic> | <yyyy-MM-dd> [<recordingId>]`.
pub fn discussion_subject(topic: &str, date: DateTime<Utc>, external_recording_id: &str) -> String {
    format!(
        "{} | {} [{}]",
        topic,
        date.format("%Y-%m-%d"),
        external_recording_id
    )
}

/// Derive the embeddable preview URL from the stored viewing URL.
pub fn preview_url(view_url: &str) -> String {
    view_url.replace("/view", "/preview")
}

/// Fixed HTML snippet wrapping the preview iframe: a 16:9 responsive box
/// with a transparent overlay masking the pop-out control corner.
pub fn embed_html(preview_url: &str) -> String {
    format!(
        r#"<div style="position:relative;width:100%;padding-bottom:56.25%;height:0;overflow:hidden;">
  <iframe src="{preview_url}" style="position:absolute;top:0;left:0;width:100%;height:100%;border:0;" allow="autoplay; fullscreen" allowfullscreen></iframe>
  <div style="position:absolute;top:0;right:0;width:60px;height:60px;background:transparent;"></div>
</div>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn forum(id: i64, name: &str) -> Forum {
        Forum {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_choose_forum_prefers_clases_grabadas() {
        let forums = vec![
            forum(1, "Anuncios"),
            forum(2, "Clases Grabadas"),
            forum(3, "General"),
        ];
        assert_eq!(choose_forum(&forums).unwrap().id, 2);
    }

    #[test]
    fn test_choose_forum_falls_back_to_announcements() {
        let forums = vec![forum(1, "General"), forum(2, "News forum")];
        assert_eq!(choose_forum(&forums).unwrap().id, 2);

        let forums = vec![forum(5, "Anuncios"), forum(6, "General")];
        assert_eq!(choose_forum(&forums).unwrap().id, 5);
    }

    #[test]
    fn test_choose_forum_defaults_to_first() {
        let forums = vec![forum(7, "Dudas"), forum(8, "General")];
        assert_eq!(choose_forum(&forums).unwrap().id, 7);
        assert!(choose_forum(&[]).is_none());
    }

    #[test]
    fn test_discussion_subject_format() {
        let date = Utc.with_ymd_and_hms(2025, 8, 18, 15, 0, 0).unwrap();
        let subject = discussion_subject("Matemáticas Básicas", date, "abc123");
        assert_eq!(subject, "Matemáticas Básicas | 2025-08-18 [abc123]");
    }

    #[test]
    fn test_preview_url_derivation() {
        assert_eq!(
            preview_url("https://store.test/file/d/xyz/view"),
            "https://store.test/file/d/xyz/preview"
        );
    }

    #[test]
    fn test_embed_html_wraps_preview() {
        let html = embed_html("https://store.test/file/d/xyz/preview");
        assert!(html.contains(r#"src="https://store.test/file/d/xyz/preview""#));
        assert!(html.contains("padding-bottom:56.25%"));
        assert!(html.contains("background:transparent"));
    }
}
