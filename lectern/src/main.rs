use std::sync::Arc;
use std::time::{Duration, Instant};

use porter::{ClientOptions, Downloader, RetryPolicy, build_client};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lectern::api::server::{ApiServerConfig, AppState, WebhookAdmission, serve};
use lectern::clients::drive::StorageClient;
use lectern::clients::lms::LmsClient;
use lectern::clients::provider::ProviderClient;
use lectern::config::Settings;
use lectern::database;
use lectern::database::repositories::{
    LicenseRepository, MeetingRepository, RecordingRepository, SqlxLicenseRepository,
    SqlxMeetingRepository, SqlxRecordingRepository,
};
use lectern::pipeline::coordinator::PipelineCoordinator;
use lectern::pipeline::retry_engine::RetryEngine;
use lectern::pipeline::sync::SyncEngine;
use lectern::pipeline::PipelineContext;
use lectern::resolver::{CourseDirectory, CourseResolver};
use lectern::scheduler::{WakeupConfig, WakeupJob};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lectern=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let settings = Settings::from_env();
    settings.validate()?;

    tokio::fs::create_dir_all(&settings.downloads_dir).await?;

    let pool = database::init_pool(&settings.database_url).await?;
    database::run_migrations(&pool).await?;

    let meetings: Arc<dyn MeetingRepository> = Arc::new(SqlxMeetingRepository::new(pool.clone()));
    let recordings: Arc<dyn RecordingRepository> =
        Arc::new(SqlxRecordingRepository::new(pool.clone()));
    let licenses: Arc<dyn LicenseRepository> = Arc::new(SqlxLicenseRepository::new(pool.clone()));

    // Short-request client for API calls; transfer clients follow the
    // configured ceilings (0 leaves them unbounded).
    let api_client = build_client(&ClientOptions::default().with_timeout_ms(30_000))?;
    let download_client =
        build_client(&ClientOptions::default().with_timeout_ms(settings.download_timeout_ms))?;
    let upload_client =
        build_client(&ClientOptions::default().with_timeout_ms(settings.upload_timeout_ms))?;

    let provider = Arc::new(ProviderClient::new(api_client.clone(), &settings));
    let storage = Arc::new(StorageClient::new(
        api_client.clone(),
        upload_client,
        &settings,
    ));
    let lms = Arc::new(LmsClient::new(api_client, &settings));

    let course_directory: Arc<dyn CourseDirectory> = lms.clone() as Arc<dyn CourseDirectory>;
    let resolver = Arc::new(CourseResolver::new(
        course_directory,
        settings.default_course_id,
        Duration::from_millis(settings.courses_cache_ms),
    ));

    let download_policy = RetryPolicy::new("download")
        .with_max_attempts(settings.max_retries_download)
        .with_delays(settings.initial_backoff_ms, settings.max_backoff_ms);
    let token_source: Arc<dyn porter::BearerTokenSource> = provider.clone() as Arc<dyn porter::BearerTokenSource>;
    let downloader = Downloader::new(download_client, download_policy, settings.min_expected_bytes())
        .with_token_source(token_source);

    let ctx = Arc::new(PipelineContext::new(settings.max_concurrent_uploads));

    let coordinator = Arc::new(PipelineCoordinator::new(
        settings.clone(),
        ctx,
        Arc::clone(&meetings),
        Arc::clone(&recordings),
        licenses,
        Arc::clone(&storage),
        Arc::clone(&lms),
        resolver,
        downloader,
    ));

    let retry_engine = Arc::new(RetryEngine::new(
        Arc::clone(&coordinator),
        Arc::clone(&meetings),
        Arc::clone(&recordings),
        Arc::clone(&provider),
        Arc::clone(&storage),
    ));

    let sync_engine = Arc::new(SyncEngine::new(
        Arc::clone(&provider),
        Arc::clone(&meetings),
        Arc::clone(&coordinator),
    ));

    let wakeup = Arc::new(WakeupJob::new(
        Arc::clone(&recordings),
        Arc::clone(&storage),
        WakeupConfig {
            hour: settings.wakeup_hour,
        },
    ));
    let _wakeup_handle = Arc::clone(&wakeup).start();

    let state = AppState {
        start_time: Instant::now(),
        webhook: WebhookAdmission {
            secret: settings.webhook_secret.clone(),
            disable_signature: settings.webhook_disable_signature,
        },
        coordinator: Some(coordinator),
        retry_engine: Some(retry_engine),
        sync_engine: Some(sync_engine),
        recordings: Some(recordings),
    };

    let server_config = ApiServerConfig {
        bind_address: settings.bind_address.clone(),
        port: settings.port,
        enable_cors: false,
    };

    tracing::info!("lectern initialized, starting API server");
    serve(server_config, state).await?;

    Ok(())
}
