//! Conferencing-provider API client.
//!
//! Handles OAuth account-credentials token acquisition with lazy refresh,
//! recording enumeration, and the webhook wire types.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use porter::{BearerTokenSource, TransferError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::{Error, Result};

/// Refresh the token once it is within this many seconds of expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Provider API client with a lazily refreshed account token.
pub struct ProviderClient {
    client: Client,
    base_url: String,
    token_url: String,
    account_id: String,
    client_id: String,
    client_secret: String,
    token_cache: Mutex<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl ProviderClient {
    pub fn new(client: Client, settings: &Settings) -> Self {
        Self {
            client,
            base_url: settings.provider_base_url.trim_end_matches('/').to_string(),
            token_url: settings.provider_token_url.clone(),
            account_id: settings.provider_account_id.clone(),
            client_id: settings.provider_client_id.clone(),
            client_secret: settings.provider_client_secret.clone(),
            token_cache: Mutex::new(None),
        }
    }

    /// Current access token, fetching a fresh one when the cache is empty,
    /// expiring within the margin, or `force_refresh` is set.
    pub async fn access_token(&self, force_refresh: bool) -> Result<String> {
        let mut cache = self.token_cache.lock().await;

        if !force_refresh {
            if let Some(cached) = cache.as_ref() {
                if cached.expires_at > Utc::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        debug!("provider: fetching fresh access token (force={})", force_refresh);

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "account_credentials"),
                ("account_id", self.account_id.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::provider(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        let expires_at = Utc::now()
            + ChronoDuration::seconds((token.expires_in - TOKEN_EXPIRY_MARGIN_SECS).max(0));

        *cache = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });

        Ok(token.access_token)
    }

    /// Authorized GET with one forced token refresh on 401/403.
    async fn authorized_get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut force = false;
        loop {
            let token = self.access_token(force).await?;
            let response = self
                .client
                .get(url)
                .bearer_auth(&token)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                if force {
                    return Err(Error::provider(format!("request to {url} rejected with {status}")));
                }
                warn!("provider: {status} from {url}, refreshing token once");
                force = true;
                continue;
            }
            if !response.status().is_success() {
                return Err(Error::provider(format!("request to {url} returned {status}")));
            }

            return Ok(response.json().await?);
        }
    }

    /// Paginated account-wide recording enumeration.
    pub async fn list_recordings(
        &self,
        from: &str,
        to: &str,
        next_page_token: Option<&str>,
    ) -> Result<AccountRecordingsPage> {
        let mut url = format!(
            "{}/accounts/{}/recordings?page_size=300&from={}&to={}",
            self.base_url, self.account_id, from, to
        );
        if let Some(token) = next_page_token {
            url.push_str("&next_page_token=");
            url.push_str(token);
        }
        self.authorized_get_json(&url).await
    }

    /// Recording files for a single meeting.
    pub async fn meeting_recordings(
        &self,
        external_meeting_id: &str,
    ) -> Result<MeetingRecordings> {
        let url = format!("{}/meetings/{}/recordings", self.base_url, external_meeting_id);
        self.authorized_get_json(&url).await
    }
}

#[async_trait]
impl BearerTokenSource for ProviderClient {
    async fn bearer_token(&self, force_refresh: bool) -> std::result::Result<String, TransferError> {
        self.access_token(force_refresh).await.map_err(|e| {
            TransferError::SessionRejected {
                reason: format!("token acquisition failed: {e}"),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Top-level webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
    /// Single-use download token accompanying recording events.
    pub download_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    /// Present only on the URL-validation handshake.
    #[serde(rename = "plainToken")]
    pub plain_token: Option<String>,
    pub object: Option<MeetingRecordings>,
}

/// A meeting's recording listing, shared between the webhook payload and
/// the per-meeting lookup endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeetingRecordings {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub topic: String,
    pub start_time: Option<String>,
    #[serde(default)]
    pub recording_files: Vec<RecordingFile>,
}

/// Account-wide recording page.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountRecordingsPage {
    #[serde(default)]
    pub meetings: Vec<MeetingRecordings>,
    pub next_page_token: Option<String>,
}

/// A single recording file entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordingFile {
    pub id: String,
    pub file_type: Option<String>,
    pub status: Option<String>,
    pub download_url: Option<String>,
    pub file_size: Option<u64>,
    pub recording_type: Option<String>,
}

/// Preference order over recording view types.
fn recording_type_rank(recording_type: Option<&str>) -> u8 {
    match recording_type {
        Some("shared_screen_with_speaker_view") => 0,
        Some("active_speaker") => 1,
        Some("speaker_view") => 2,
        Some("gallery_view") => 3,
        _ => 4,
    }
}

/// Select the best MP4 out of a recording file list: completed MP4 entries
/// with a download URL, preferred by view type, ties broken by larger size.
pub fn pick_best_mp4(files: &[RecordingFile]) -> Option<&RecordingFile> {
    files
        .iter()
        .filter(|f| f.file_type.as_deref() == Some("MP4"))
        .filter(|f| f.download_url.is_some())
        .filter(|f| f.status.as_deref() == Some("completed"))
        .min_by(|a, b| {
            recording_type_rank(a.recording_type.as_deref())
                .cmp(&recording_type_rank(b.recording_type.as_deref()))
                .then_with(|| b.file_size.unwrap_or(0).cmp(&a.file_size.unwrap_or(0)))
        })
}

/// Accept either a JSON string or number for ids the provider emits in
/// both shapes.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp4(id: &str, recording_type: &str, size: u64) -> RecordingFile {
        RecordingFile {
            id: id.into(),
            file_type: Some("MP4".into()),
            status: Some("completed".into()),
            download_url: Some(format!("https://media.provider.test/{id}")),
            file_size: Some(size),
            recording_type: Some(recording_type.into()),
        }
    }

    #[test]
    fn test_pick_best_prefers_view_type_order() {
        let files = vec![
            mp4("gallery", "gallery_view", 900),
            mp4("speaker", "speaker_view", 100),
            mp4("shared", "shared_screen_with_speaker_view", 50),
        ];
        assert_eq!(pick_best_mp4(&files).unwrap().id, "shared");
    }

    #[test]
    fn test_pick_best_breaks_ties_by_size() {
        let files = vec![
            mp4("small", "active_speaker", 10),
            mp4("large", "active_speaker", 500),
        ];
        assert_eq!(pick_best_mp4(&files).unwrap().id, "large");
    }

    #[test]
    fn test_pick_best_skips_non_mp4_and_incomplete() {
        let mut chat = mp4("chat", "shared_screen_with_speaker_view", 10);
        chat.file_type = Some("CHAT".into());
        let mut processing = mp4("processing", "shared_screen_with_speaker_view", 10);
        processing.status = Some("processing".into());
        let mut missing_url = mp4("nourl", "shared_screen_with_speaker_view", 10);
        missing_url.download_url = None;

        let files = vec![chat, processing, missing_url, mp4("good", "gallery_view", 10)];
        assert_eq!(pick_best_mp4(&files).unwrap().id, "good");
    }

    #[test]
    fn test_pick_best_none_when_no_candidates() {
        assert!(pick_best_mp4(&[]).is_none());
    }

    #[test]
    fn test_envelope_accepts_numeric_meeting_id() {
        let json = serde_json::json!({
            "event": "recording.completed",
            "payload": {
                "object": {
                    "id": 94881330838u64,
                    "topic": "Matemáticas Básicas",
                    "recording_files": []
                }
            },
            "download_token": "T"
        });
        let envelope: WebhookEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope.payload.object.unwrap().id, "94881330838");
    }

    #[test]
    fn test_envelope_handshake_payload() {
        let json = serde_json::json!({
            "event": "endpoint.url_validation",
            "payload": {"plainToken": "abc"}
        });
        let envelope: WebhookEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope.payload.plain_token.as_deref(), Some("abc"));
    }
}
