use anyhow::Error;
use clap::Parser;
use std::env;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

use genq::api::{self, AppState};
use genq::cancel::CancellationStore;
use genq::config::Config;
use genq::db::DbHandle;
use genq::gemini::GeminiClient;
use genq::guest::GuestLimiter;
use genq::ledger::CreditLedger;
use genq::pipeline::{Pipeline, PipelineSettings};
use genq::queue::RedisQueue;
use genq::retry::{RetryClient, RetryPolicy};
use genq::storage::SupabaseStorage;
use genq::{flags, server, telemetry};

#[instrument(skip_all)]
async fn setup(config: Config, cancel_token: CancellationToken) -> Result<(), Error> {
    let db = Arc::new(DbHandle::new(&config.connect_url).await?);
    let queue = Arc::new(RedisQueue::connect(&config.redis_url, config.queue_name.clone()).await?);
    let flags = flags::connect_or_offline(&config.redis_url).await;

    let storage = Arc::new(SupabaseStorage::new(
        &config.storage_url,
        config.storage_public_url.as_deref(),
        &config.storage_bucket,
        &config.storage_service_key,
    )?);
    let retry = RetryClient::new(
        Arc::new(GeminiClient::new(config.gemini_endpoint.clone())),
        RetryPolicy::default(),
    );
    let pipeline = Pipeline::new(
        db.clone(),
        CreditLedger::new(db.clone(), "gemini"),
        storage,
        CancellationStore::new(flags.clone()),
        retry,
        PipelineSettings {
            credential: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
            price_per_image: config.image_price,
        },
    );

    let workers = config.num;
    let requeue_processing = config.requeue_processing;
    let listen = config.listen;

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        let pipeline = pipeline.clone();
        let queue = queue.clone();
        tokio::spawn(
            async move {
                if let Err(err) = server::serve(
                    cancel_token.clone(),
                    db,
                    queue,
                    pipeline,
                    workers,
                    requeue_processing,
                )
                .await
                {
                    error!("Error running server: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("server")),
        )
    };

    let api_spawn = {
        let cancel_token = cancel_token.clone();
        let state = AppState {
            queue,
            pipeline,
            guests: GuestLimiter::new(flags),
        };
        tokio::spawn(
            async move {
                if let Err(err) = api::serve(cancel_token.clone(), listen, state).await {
                    error!("Error running HTTP API: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("api")),
        )
    };

    info!("Waiting for shutdown signal");
    server_spawn.await?;
    api_spawn.await?;

    Ok(())
}

async fn wait_for_signal(token: CancellationToken) -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    token.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "genq=debug");
    }

    let config = Config::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let app = tokio::spawn(setup(config, token.clone()));

    let signal_token = token.clone();
    tokio::spawn(async move {
        if let Err(err) = wait_for_signal(signal_token.clone()).await {
            error!("Failed to install signal handlers: {}", err);
            signal_token.cancel();
        }
    });

    let result = app.await?;
    token.cancel();
    info!("Shutting down.");
    telemetry::shutdown();

    result?;
    Ok(())
}
