use std::sync::Arc;

use twittix_recommendation_api::{
    api::{create_router, AppState},
    config::Config,
    db::{self, Cache},
    services::{
        source::{PgCandidateSource, RecordingSource, SnapshotSource},
        Pipeline, PipelineConfig, RecommendationService,
    },
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    telemetry::init(telemetry::DEFAULT_FILTER)?;

    // A checkout may use at most one attempt's share of the fetch budget
    let pool = db::create_pool(
        &config.database_url,
        config.db_max_connections,
        PipelineConfig::from(&config).attempt_timeout(),
    )?;
    let primary = PgCandidateSource::new(
        pool.clone(),
        config.exclusion_policy()?,
        config.candidate_pool_max,
    );

    let (pipeline, cache_writer) = if config.fallback_cache_enabled {
        let redis_client = db::create_redis_client(&config.redis_url)?;
        let (cache, cache_writer) = Cache::new(redis_client).await;

        let recording = RecordingSource::new(primary, cache.clone(), config.cache_ttl_secs);
        let pipeline = Pipeline::from_config(&config, Arc::new(recording))?
            .with_fallback(Arc::new(SnapshotSource::new(cache)));
        (pipeline, Some(cache_writer))
    } else {
        (Pipeline::from_config(&config, Arc::new(primary))?, None)
    };

    tracing::info!(
        weights = pipeline.weights_version(),
        fallback = config.fallback_cache_enabled,
        pool_max = config.candidate_pool_max,
        "Recommendation pipeline configured"
    );

    let service = RecommendationService::new(Arc::new(pipeline), &config);
    let app = create_router(AppState::new(service));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(cache_writer) = cache_writer {
        cache_writer.shutdown().await;
    }
    pool.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received");
}
