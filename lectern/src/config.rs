//! Environment-driven configuration.

use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Runtime settings, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_address: String,
    pub port: u16,

    /// Temp directory for downloaded artifacts.
    pub downloads_dir: PathBuf,

    pub max_retries_download: u32,
    pub max_retries_upload: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Per-request ceilings; 0 leaves the request unbounded.
    pub download_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub chunk_size_mb: u64,
    pub min_expected_size_mb: u64,
    pub prepublish_delay_ms: u64,
    pub max_concurrent_uploads: usize,

    pub default_course_id: Option<i64>,
    pub courses_cache_ms: u64,

    pub webhook_secret: Option<String>,
    pub webhook_disable_signature: bool,

    /// Local hour at which the preview wakeup job runs.
    pub wakeup_hour: u32,

    // Conferencing provider API.
    pub provider_base_url: String,
    pub provider_token_url: String,
    pub provider_account_id: String,
    pub provider_client_id: String,
    pub provider_client_secret: String,

    // Long-term object store API.
    pub storage_api_base: String,
    pub storage_upload_base: String,
    pub storage_token: String,
    pub storage_root_folder_id: String,

    // LMS web-service API.
    pub lms_base_url: String,
    pub lms_ws_token: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:lectern.db?mode=rwc".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            downloads_dir: PathBuf::from("downloads"),
            max_retries_download: 10,
            max_retries_upload: 10,
            initial_backoff_ms: 30_000,
            max_backoff_ms: 300_000,
            download_timeout_ms: 0,
            upload_timeout_ms: 0,
            chunk_size_mb: 32,
            min_expected_size_mb: 1,
            prepublish_delay_ms: 30_000,
            max_concurrent_uploads: 3,
            default_course_id: None,
            courses_cache_ms: 300_000,
            webhook_secret: None,
            webhook_disable_signature: false,
            wakeup_hour: 2,
            provider_base_url: String::new(),
            provider_token_url: String::new(),
            provider_account_id: String::new(),
            provider_client_id: String::new(),
            provider_client_secret: String::new(),
            storage_api_base: String::new(),
            storage_upload_base: String::new(),
            storage_token: String::new(),
            storage_root_folder_id: String::new(),
            lms_base_url: String::new(),
            lms_ws_token: String::new(),
        }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn var_parse<T: FromStr>(key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Settings {
    /// Load settings from the environment, falling back to defaults for
    /// everything but remote credentials (validated separately).
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_address: var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            port: var_parse("PORT", defaults.port),
            downloads_dir: var("DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.downloads_dir),
            max_retries_download: var_parse("MAX_RETRIES_DOWNLOAD", defaults.max_retries_download),
            max_retries_upload: var_parse("MAX_RETRIES_UPLOAD", defaults.max_retries_upload),
            initial_backoff_ms: var_parse("INITIAL_BACKOFF_MS", defaults.initial_backoff_ms),
            max_backoff_ms: var_parse("MAX_BACKOFF_MS", defaults.max_backoff_ms),
            download_timeout_ms: var_parse("DOWNLOAD_TIMEOUT_MS", defaults.download_timeout_ms),
            upload_timeout_ms: var_parse("UPLOAD_TIMEOUT_MS", defaults.upload_timeout_ms),
            chunk_size_mb: var_parse("CHUNK_SIZE_MB", defaults.chunk_size_mb),
            min_expected_size_mb: var_parse("MIN_EXPECTED_SIZE_MB", defaults.min_expected_size_mb),
            prepublish_delay_ms: var_parse("PREPUBLISH_DELAY_MS", defaults.prepublish_delay_ms),
            max_concurrent_uploads: var_parse(
                "MAX_CONCURRENT_UPLOADS",
                defaults.max_concurrent_uploads,
            ),
            default_course_id: var("DEFAULT_COURSE_ID").and_then(|v| v.parse().ok()),
            courses_cache_ms: var_parse("COURSES_CACHE_MS", defaults.courses_cache_ms),
            webhook_secret: var("WEBHOOK_SECRET"),
            webhook_disable_signature: var_parse("WEBHOOK_DISABLE_SIGNATURE", false),
            wakeup_hour: var_parse("WAKEUP_HOUR", defaults.wakeup_hour),
            provider_base_url: var("PROVIDER_BASE_URL").unwrap_or_default(),
            provider_token_url: var("PROVIDER_TOKEN_URL").unwrap_or_default(),
            provider_account_id: var("PROVIDER_ACCOUNT_ID").unwrap_or_default(),
            provider_client_id: var("PROVIDER_CLIENT_ID").unwrap_or_default(),
            provider_client_secret: var("PROVIDER_CLIENT_SECRET").unwrap_or_default(),
            storage_api_base: var("STORAGE_API_BASE").unwrap_or_default(),
            storage_upload_base: var("STORAGE_UPLOAD_BASE").unwrap_or_default(),
            storage_token: var("STORAGE_TOKEN").unwrap_or_default(),
            storage_root_folder_id: var("STORAGE_ROOT_FOLDER_ID").unwrap_or_default(),
            lms_base_url: var("LMS_BASE_URL").unwrap_or_default(),
            lms_ws_token: var("LMS_WS_TOKEN").unwrap_or_default(),
        }
    }

    /// Fail fast on settings the pipeline cannot run without.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("PROVIDER_BASE_URL", &self.provider_base_url),
            ("PROVIDER_TOKEN_URL", &self.provider_token_url),
            ("PROVIDER_ACCOUNT_ID", &self.provider_account_id),
            ("PROVIDER_CLIENT_ID", &self.provider_client_id),
            ("PROVIDER_CLIENT_SECRET", &self.provider_client_secret),
            ("STORAGE_API_BASE", &self.storage_api_base),
            ("STORAGE_UPLOAD_BASE", &self.storage_upload_base),
            ("STORAGE_TOKEN", &self.storage_token),
            ("STORAGE_ROOT_FOLDER_ID", &self.storage_root_folder_id),
            ("LMS_BASE_URL", &self.lms_base_url),
            ("LMS_WS_TOKEN", &self.lms_ws_token),
        ];

        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(Error::config(format!("{key} is not set")));
            }
        }

        if self.chunk_size_mb == 0 {
            return Err(Error::config("CHUNK_SIZE_MB must be positive"));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(Error::config("MAX_CONCURRENT_UPLOADS must be positive"));
        }
        if self.wakeup_hour > 23 {
            return Err(Error::config("WAKEUP_HOUR must be within 0-23"));
        }

        Ok(())
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn min_expected_bytes(&self) -> u64 {
        self.min_expected_size_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.chunk_size_mb, 32);
        assert_eq!(settings.chunk_size_bytes(), 32 * 1024 * 1024);
        assert_eq!(settings.min_expected_bytes(), 1024 * 1024);
        assert_eq!(settings.max_concurrent_uploads, 3);
        assert_eq!(settings.wakeup_hour, 2);
        assert!(settings.download_timeout_ms == 0);
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let settings = Settings::default();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_complete_settings() {
        let settings = Settings {
            provider_base_url: "https://api.provider.test/v2".into(),
            provider_token_url: "https://auth.provider.test/oauth/token".into(),
            provider_account_id: "acct".into(),
            provider_client_id: "id".into(),
            provider_client_secret: "secret".into(),
            storage_api_base: "https://store.test/api/v3".into(),
            storage_upload_base: "https://store.test/upload/v3".into(),
            storage_token: "token".into(),
            storage_root_folder_id: "root".into(),
            lms_base_url: "https://lms.test".into(),
            lms_ws_token: "wstoken".into(),
            ..Settings::default()
        };
        assert!(settings.validate().is_ok());
    }
}
