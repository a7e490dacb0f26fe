//! LMS web-service client (form-encoded REST protocol).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::Settings;
use crate::resolver::CourseDirectory;
use crate::{Error, Result};

/// A course as reported by the LMS.
#[derive(Debug, Clone, Deserialize)]
pub struct Course {
    pub id: i64,
    pub fullname: String,
    pub shortname: String,
    #[serde(default)]
    pub displayname: Option<String>,
}

/// A discussion forum within a course.
#[derive(Debug, Clone, Deserialize)]
pub struct Forum {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct CoursesByField {
    #[serde(default)]
    courses: Vec<Course>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    courses: Vec<Course>,
}

#[derive(Debug, Deserialize)]
struct NewDiscussion {
    discussionid: i64,
}

/// LMS web-service client.
pub struct LmsClient {
    client: Client,
    base_url: String,
    token: String,
}

impl LmsClient {
    pub fn new(client: Client, settings: &Settings) -> Self {
        Self {
            client,
            base_url: settings.lms_base_url.trim_end_matches('/').to_string(),
            token: settings.lms_ws_token.clone(),
        }
    }

    /// Invoke a web-service function with form-encoded parameters.
    async fn call(&self, wsfunction: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}/webservice/rest/server.php", self.base_url);

        let mut form: Vec<(&str, String)> = vec![
            ("wstoken", self.token.clone()),
            ("wsfunction", wsfunction.to_string()),
            ("moodlewsrestformat", "json".to_string()),
        ];
        form.extend(params.iter().cloned());

        debug!("lms: calling {}", wsfunction);

        let response = self.client.post(&url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Forum(format!("{wsfunction} returned {status}")));
        }

        let value: Value = response.json().await?;

        // The service reports faults inside a 200 body.
        if let Some(exception) = value.get("exception").and_then(Value::as_str) {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            return Err(Error::Forum(format!("{wsfunction} failed: {exception}: {message}")));
        }

        Ok(value)
    }

    pub async fn all_courses(&self) -> Result<Vec<Course>> {
        let value = self.call("core_course_get_courses", &[]).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn courses_by_field(&self, field: &str, value: &str) -> Result<Vec<Course>> {
        let result = self
            .call(
                "core_course_get_courses_by_field",
                &[("field", field.to_string()), ("value", value.to_string())],
            )
            .await?;
        let parsed: CoursesByField = serde_json::from_value(result)?;
        Ok(parsed.courses)
    }

    pub async fn search_courses(&self, text: &str) -> Result<Vec<Course>> {
        let result = self
            .call(
                "core_course_search_courses",
                &[
                    ("criterianame", "search".to_string()),
                    ("criteriavalue", text.to_string()),
                ],
            )
            .await?;
        let parsed: SearchResult = serde_json::from_value(result)?;
        Ok(parsed.courses)
    }

    pub async fn list_forums(&self, course_id: i64) -> Result<Vec<Forum>> {
        let result = self
            .call(
                "mod_forum_get_forums_by_courses",
                &[("courseids[0]", course_id.to_string())],
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Create a top-level discussion, returning its id.
    pub async fn create_discussion(
        &self,
        forum_id: i64,
        subject: &str,
        message: &str,
    ) -> Result<i64> {
        let result = self
            .call(
                "mod_forum_add_discussion",
                &[
                    ("forumid", forum_id.to_string()),
                    ("subject", subject.to_string()),
                    ("message", message.to_string()),
                ],
            )
            .await?;
        let parsed: NewDiscussion = serde_json::from_value(result)?;
        Ok(parsed.discussionid)
    }
}

#[async_trait]
impl CourseDirectory for LmsClient {
    async fn all_courses(&self) -> Result<Vec<Course>> {
        LmsClient::all_courses(self).await
    }

    async fn courses_by_field(&self, field: &str, value: &str) -> Result<Vec<Course>> {
        LmsClient::courses_by_field(self, field, value).await
    }

    async fn search_courses(&self, text: &str) -> Result<Vec<Course>> {
        LmsClient::search_courses(self, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_list_parses() {
        let value = serde_json::json!([
            {"id": 13, "fullname": "Matemáticas Básicas", "shortname": "MB", "displayname": "Matemáticas Básicas"},
            {"id": 14, "fullname": "Física I", "shortname": "F1"}
        ]);
        let courses: Vec<Course> = serde_json::from_value(value).unwrap();
        assert_eq!(courses.len(), 2);
        assert_eq!(courses[0].id, 13);
        assert!(courses[1].displayname.is_none());
    }

    #[test]
    fn test_discussion_response_parses() {
        let value = serde_json::json!({"discussionid": 991, "warnings": []});
        let parsed: NewDiscussion = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.discussionid, 991);
    }
}
