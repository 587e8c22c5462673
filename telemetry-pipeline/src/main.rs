use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common_kafka::memory::MemoryBroker;
use envconfig::Envconfig;
use health::HealthRegistry;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use telemetry_pipeline::config::{BrokerKind, Config};
use telemetry_pipeline::orchestrator::{BrokerClients, Orchestrator, PipelineStages};
use telemetry_pipeline::server::{router, serve, setup_metrics_recorder, AppState};

async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };
    Ok(())
}

fn init_tracer(sink_url: &str, sampling_rate: f64, service_name: &str) -> anyhow::Result<Tracer> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)?;
    Ok(tracer)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    config.validate().context("invalid configuration")?;

    // stdout at RUST_LOG (default INFO), OpenTelemetry at INFO and above when configured
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    let otel_layer = config
        .otel_url
        .as_deref()
        .map(|url| init_tracer(url, config.otel_sampling_rate, &config.otel_service_name))
        .transpose()
        .context("failed to initialize OpenTelemetry exporter")?
        .map(OpenTelemetryLayer::new)
        .with_filter(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();

    let liveness = HealthRegistry::new("liveness");

    let clients = match config.broker {
        BrokerKind::Kafka => {
            let producer_liveness = liveness
                .register("rdkafka".to_string(), config.liveness_deadline.0);
            BrokerClients::kafka(&config.kafka, &config.consumer, producer_liveness)
                .context("failed to create kafka clients")?
        }
        BrokerKind::Memory => {
            warn!("running against the in-process broker, nothing is persisted");
            BrokerClients::memory(&MemoryBroker::new(config.topic_partitions))
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        clients,
        config.orchestrator_config(),
        PipelineStages::with_min_alert_severity(config.alert_min_severity),
        Some(liveness.clone()),
    ));
    orchestrator
        .start()
        .await
        .context("failed to start pipelines")?;

    let recorder = if config.export_prometheus {
        Some(setup_metrics_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };
    let app = router(
        AppState {
            liveness,
            orchestrator: orchestrator.clone(),
        },
        recorder,
    );
    let server_stop = CancellationToken::new();
    let server = tokio::spawn({
        let bind = config.bind();
        let stop = server_stop.clone();
        async move { serve(app, &bind, stop.cancelled_owned()).await }
    });

    let fatal = tokio::select! {
        signal = shutdown_signal() => {
            signal.context("failed to register signal handlers")?;
            None
        }
        fatal = orchestrator.wait_for_fatal() => fatal,
    };
    if let Some(e) = &fatal {
        error!("pipeline failed, shutting down: {}", e);
    }

    let drained = tokio::time::timeout(config.shutdown_timeout.0, orchestrator.shutdown()).await;
    server_stop.cancel();
    match server.await {
        Ok(Err(e)) => warn!("status server exited with error: {}", e),
        Err(e) => warn!("status server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    match drained {
        Ok(result) => result.context("pipelines did not drain cleanly")?,
        Err(_) => anyhow::bail!(
            "shutdown did not finish within {}ms",
            config.shutdown_timeout.0.as_millis()
        ),
    }
    if let Some(e) = fatal {
        return Err(e).context("pipeline stopped");
    }

    info!("shutdown complete");
    Ok(())
}
