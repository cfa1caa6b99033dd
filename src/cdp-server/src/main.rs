//! CDP unification pipeline, single-process runtime.
//!
//! Wires the ingestion connectors, identity resolver, profile builder, and
//! stream processor over the configured bus backend, and drains everything
//! gracefully on SIGTERM/ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use cdp_bus::{topics, BusConsumer, DeadLetterQueue, EventPublisher};
use cdp_core::config::AppConfig;
use cdp_core::error::{CdpError, CdpResult};
use cdp_core::logging;
use cdp_identity::audit::IdentityAuditLog;
use cdp_identity::resolver::IdentityResolver;
use cdp_ingest::connectors::{
    ClickstreamExtractor, Connector, CrmExtractor, MobileAppExtractor, SourceExtractor,
};
use cdp_profile::builder::ProfileBuilder;
use cdp_profile::segments::SegmentEvaluator;
use cdp_profile::store::InMemoryProfileStore;
use cdp_stream::processor::StreamProcessor;

#[derive(Parser, Debug)]
#[command(name = "cdp-server")]
#[command(about = "Event ingestion and profile unification pipeline")]
#[command(version)]
struct Cli {
    /// Consumer group for the stream processor (overrides config)
    #[arg(long, env = "CDP__PROCESSOR__CONSUMER_GROUP")]
    consumer_group: Option<String>,

    /// Max messages per poll batch (overrides config)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent in-flight messages (overrides config)
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Run only the stream processor, without source connectors
    #[arg(long, default_value_t = false)]
    processor_only: bool,
}

struct BusHandles {
    publisher: Arc<EventPublisher>,
    raw_consumers: Vec<(Arc<dyn SourceExtractor>, Arc<dyn BusConsumer>)>,
    processed_consumer: Arc<dyn BusConsumer>,
}

#[cfg(feature = "kafka")]
fn build_bus(config: &AppConfig) -> CdpResult<BusHandles> {
    use cdp_bus::kafka::{KafkaBackend, KafkaBusConsumer};

    let backend = Arc::new(KafkaBackend::new(&config.bus)?);
    let publisher = Arc::new(EventPublisher::new(backend, &config.bus));

    let crm_extractor =
        CrmExtractor::default().with_daily_limit(config.connectors.crm_daily_api_limit);
    let extractors: Vec<(Arc<dyn SourceExtractor>, &str)> = vec![
        (Arc::new(ClickstreamExtractor), config.connectors.clickstream_group.as_str()),
        (Arc::new(MobileAppExtractor), config.connectors.mobile_app_group.as_str()),
        (Arc::new(crm_extractor), "cdp-crm-cg"),
    ];
    let mut raw_consumers: Vec<(Arc<dyn SourceExtractor>, Arc<dyn BusConsumer>)> = Vec::new();
    for (extractor, group) in extractors {
        let consumer = KafkaBusConsumer::new(&config.bus, extractor.raw_topic(), group)?;
        raw_consumers.push((extractor, Arc::new(consumer)));
    }
    let processed_consumer: Arc<dyn BusConsumer> = Arc::new(KafkaBusConsumer::new(
        &config.bus,
        topics::PROCESSED_INTERACTIONS,
        &config.processor.consumer_group,
    )?);

    Ok(BusHandles {
        publisher,
        raw_consumers,
        processed_consumer,
    })
}

#[cfg(not(feature = "kafka"))]
fn build_bus(config: &AppConfig) -> CdpResult<BusHandles> {
    use cdp_bus::memory::InMemoryBus;

    let bus = InMemoryBus::new();
    let publisher = Arc::new(EventPublisher::new(bus.clone(), &config.bus));

    let crm_extractor =
        CrmExtractor::default().with_daily_limit(config.connectors.crm_daily_api_limit);
    let extractors: Vec<(Arc<dyn SourceExtractor>, &str)> = vec![
        (Arc::new(ClickstreamExtractor), config.connectors.clickstream_group.as_str()),
        (Arc::new(MobileAppExtractor), config.connectors.mobile_app_group.as_str()),
        (Arc::new(crm_extractor), "cdp-crm-cg"),
    ];
    let raw_consumers = extractors
        .into_iter()
        .map(|(extractor, group)| {
            let consumer: Arc<dyn BusConsumer> =
                Arc::new(bus.consumer(extractor.raw_topic(), group));
            (extractor, consumer)
        })
        .collect();
    let processed_consumer: Arc<dyn BusConsumer> = Arc::new(bus.consumer(
        topics::PROCESSED_INTERACTIONS,
        config.processor.consumer_group.clone(),
    ));

    Ok(BusHandles {
        publisher,
        raw_consumers,
        processed_consumer,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        AppConfig::default()
    });
    if let Some(group) = cli.consumer_group {
        config.processor.consumer_group = group;
    }
    if let Some(batch_size) = cli.batch_size {
        config.processor.batch_size = batch_size;
    }
    if let Some(max_concurrency) = cli.max_concurrency {
        config.processor.max_concurrency = max_concurrency;
    }
    config.processor.validate()?;

    logging::init(&config.service_name, &config.environment);
    info!(
        service = %config.service_name,
        environment = %config.environment,
        bootstrap = %config.bus.bootstrap_servers,
        "cdp pipeline starting"
    );

    let handles = build_bus(&config)?;
    let dlq = Arc::new(DeadLetterQueue::new(handles.publisher.clone()));

    let store = InMemoryProfileStore::new();
    let identity_audit = Arc::new(IdentityAuditLog::new());
    let resolver = Arc::new(IdentityResolver::new(store.clone(), identity_audit));
    let builder = Arc::new(ProfileBuilder::new(
        store.clone(),
        Arc::new(SegmentEvaluator::new()),
    ));

    let processor = StreamProcessor::new(
        config.processor.clone(),
        resolver,
        builder,
        store,
        handles.processed_consumer,
        handles.publisher.clone(),
        dlq.clone(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut connector_handles = Vec::new();
    if !cli.processor_only {
        for (extractor, consumer) in handles.raw_consumers {
            let connector = Connector::new(
                extractor,
                consumer,
                handles.publisher.clone(),
                dlq.clone(),
            );
            let batch_size = config.processor.batch_size;
            let poll_timeout = Duration::from_millis(config.processor.poll_timeout_ms);
            let rate_limit_pause =
                Duration::from_secs(config.connectors.rate_limit_pause_secs);
            let mut rx = shutdown_rx.clone();
            connector_handles.push(tokio::spawn(async move {
                loop {
                    if *rx.borrow() {
                        break;
                    }
                    match connector.run_once(batch_size).await {
                        Ok(0) => {
                            tokio::select! {
                                _ = tokio::time::sleep(poll_timeout) => {}
                                _ = rx.changed() => break,
                            }
                        }
                        Ok(_) => {}
                        Err(CdpError::RateLimit(reason)) => {
                            // The batch stays uncommitted; resume polling
                            // once the quota window has moved on.
                            warn!(reason = %reason, "connector rate limited, pausing source");
                            tokio::select! {
                                _ = tokio::time::sleep(rate_limit_pause) => {}
                                _ = rx.changed() => break,
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "connector batch failed");
                            tokio::select! {
                                _ = tokio::time::sleep(poll_timeout) => {}
                                _ = rx.changed() => break,
                            }
                        }
                    }
                }
            }));
        }
    }

    let processor_handle = tokio::spawn(processor.run(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    for handle in connector_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "connector task ended abnormally");
        }
    }
    processor_handle.await??;

    info!("cdp pipeline stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
