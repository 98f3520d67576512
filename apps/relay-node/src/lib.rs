//! Relay runtime node.
//!
//! Opens the SQLite store, registers the bundled channel adapters, picks
//! direct or queued dispatch from the environment, then serves the provider
//! webhook endpoint while the queue consumer and action scheduler run
//! alongside it.

pub mod config;
pub mod http;

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_bus::{DeadLetterPublisher, JetStreamConfig, JetStreamQueue, SharedQueue};
use relay_channels::{ChatApiDefaults, default_factory};
use relay_dispatch::{DispatchConfig, DispatchService, SendConsumer, WebhookReconciler};
use relay_scheduler::{ActionFactory, ActionScheduler, SchedulerConfig};
use relay_store::SqliteRepository;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

pub use config::NodeConfig;
pub use http::{NodeState, build_router};

const DEAD_LETTER_STAGE: &str = "send";

pub async fn run(config: NodeConfig) -> Result<()> {
    let dispatch_config = DispatchConfig::from_env()?;
    let scheduler_config = SchedulerConfig::from_env()?;

    let repo = Arc::new(
        SqliteRepository::open(&config.db_path)
            .with_context(|| format!("open store at {}", config.db_path.display()))?,
    );
    let adapters = Arc::new(
        default_factory(ChatApiDefaults::from_env()?).context("register channel adapters")?,
    );
    info!(channels = ?adapters.channels(), "channel adapters registered");

    let queue = match &config.nats_url {
        Some(url) => Some(connect_queue(url, &config, &dispatch_config).await?),
        None => None,
    };
    let dispatch = match &queue {
        Some(queue) => {
            let consumer = SendConsumer::new(
                repo.clone(),
                adapters.clone(),
                dispatch_config.adapter_timeout,
            )
            .with_dead_letters(DeadLetterPublisher::new(
                DEAD_LETTER_STAGE,
                queue.clone(),
                dispatch_config.dead_letters,
            ));
            queue
                .subscribe(&dispatch_config.send_topic, Arc::new(consumer))
                .await
                .with_context(|| format!("subscribe to {}", dispatch_config.send_topic))?;
            DispatchService::queued(
                repo.clone(),
                adapters.clone(),
                queue.clone(),
                dispatch_config.clone(),
            )
        }
        None => DispatchService::direct(repo.clone(), adapters.clone(), dispatch_config.clone()),
    };
    info!(
        queued = dispatch.is_queued(),
        topic = %dispatch_config.send_topic,
        "dispatch ready"
    );

    let http_client = reqwest::Client::builder()
        .timeout(scheduler_config.action_timeout)
        .build()
        .context("build http client")?;
    let actions = ActionFactory::standard(Arc::new(dispatch), http_client)
        .context("register action executors")?;
    let scheduler = ActionScheduler::new(repo.clone(), Arc::new(actions), scheduler_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    let router = build_router(NodeState {
        reconciler: Arc::new(WebhookReconciler::new(repo, adapters)),
    });
    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("bind {}", config.addr))?;
    info!("relay-node listening on {}", config.addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(err) = scheduler_task.await {
        warn!(error = %err, "scheduler task ended abnormally");
    }
    if let Some(queue) = queue {
        if let Err(err) = queue.disconnect().await {
            warn!(error = %err, "queue disconnect failed");
        }
    }
    Ok(())
}

async fn connect_queue(
    url: &str,
    config: &NodeConfig,
    dispatch: &DispatchConfig,
) -> Result<SharedQueue> {
    let defaults = JetStreamConfig::default();
    let mut subjects = defaults.subjects.clone();
    if !subjects.contains(&dispatch.send_topic) {
        subjects.push(dispatch.send_topic.clone());
    }
    let queue = JetStreamQueue::connect(
        url,
        JetStreamConfig {
            stream: config.stream.clone(),
            subjects,
            redelivery_delay: dispatch.redelivery_delay,
            ..defaults
        },
    )
    .await?;
    Ok(Arc::new(queue))
}
