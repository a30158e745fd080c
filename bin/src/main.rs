#![allow(clippy::cognitive_complexity)]
use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod config;

use config::{
    cli::{self, Parser},
    trace,
};
use leader_election::{
    Driver, Election, ElectionConfig, ElectionResult, MemoryBackend, MemoryDriver, Namespace,
    SessionOptions, Status, Supervisor, SyncDispatcher, Topic, listen,
};
use nats_coordination::{ConnectionState, NatsClient, NatsConfig, NatsDriver};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// `leader.backend` value selecting the in-process driver
const MEMORY_BACKEND: &str = "memory";

fn main() -> Result<()> {
    // `.env` feeds the env vars clap reads below
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.leaderd_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "failed to start leaderd");
                Err(err.into())
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    let instance_id = config.effective_instance_id();
    info!(?instance_id, "using id");

    let document = read_document(&config.config_path)?;
    let election_cfg = ElectionConfig::parse_str(&document).context("invalid leader section")?;
    let namespace = Namespace::new(&config.app_name, &config.env)?;
    info!(election = %namespace, backend = %election_cfg.backend, "leader election namespace");

    let (driver, nats_client) =
        build_driver(&config, &document, &election_cfg, &namespace, &instance_id).await?;

    let election = Election::with_config(
        namespace.key(),
        driver,
        Arc::new(leadership_listeners(instance_id)),
        &election_cfg,
    );
    let status = election.status();
    let supervisor = Supervisor::new(election, &election_cfg);

    let token = CancellationToken::new();
    let monitor = nats_client.clone().map(|client| {
        let interval = client.config().monitor_interval;
        spawn_coordination_monitor_task(client, status, interval, token.clone())
    });
    let mut supervisor_task = tokio::spawn(supervisor.run(token.clone()));

    let result = tokio::select! {
        res = &mut supervisor_task => {
            // stopped on its own, only non-retryable errors get here
            token.cancel();
            flatten(res)
        }
        res = shutdown_signal(token.clone()) => {
            if let Err(err) = res {
                error!(?err, "failed to listen for shutdown signal");
            }
            info!("shutting down, resigning leadership");
            flatten(supervisor_task.await)
        }
    };

    token.cancel();
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }
    if let Some(client) = nats_client {
        client.disconnect().await;
    }
    result
}

/// Log whenever coordination becomes unavailable or comes back. A leader
/// that stays cut off past the session ttl loses leadership through its
/// driver; this only makes the degraded period visible.
fn spawn_coordination_monitor_task(
    client: NatsClient,
    status: Status,
    poll_interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        let mut last = client.state();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("coordination monitor task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let state = client.state();
                    if state != last {
                        log_coordination_change(state, status.is_leader());
                        last = state;
                    }
                }
            }
        }
    })
}

fn log_coordination_change(state: ConnectionState, is_leader: bool) {
    match state {
        ConnectionState::Connected => {
            info!(is_leader, "NATS connection restored - coordination available")
        }
        _ if is_leader => warn!(
            ?state,
            "NATS connection lost while leading - leadership ends unless it recovers within the session ttl"
        ),
        _ => warn!(?state, "NATS connection lost - coordination unavailable"),
    }
}

/// Read the config document. A missing file means every section takes its
/// defaults.
fn read_document(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(document) => Ok(document),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok("{}".to_owned())
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file {}", path.display()))
        }
    }
}

/// Pick the driver named by `leader.backend`: the in-process driver for
/// `memory`, otherwise the NATS connection described by the `nats` section.
async fn build_driver(
    config: &cli::Config,
    document: &str,
    election_cfg: &ElectionConfig,
    namespace: &Namespace,
    instance_id: &str,
) -> Result<(Arc<dyn Driver>, Option<NatsClient>)> {
    let options = SessionOptions::from(election_cfg);
    if election_cfg.backend == MEMORY_BACKEND {
        warn!("using the in-process backend, leadership is not shared with other processes");
        let driver = MemoryDriver::new(MemoryBackend::new(), namespace, options);
        return Ok((Arc::new(driver), None));
    }

    let mut nats_cfg = NatsConfig::parse_str(document).context("invalid nats section")?;
    if let Some(servers) = &config.nats_servers {
        nats_cfg.servers = servers.clone();
    }
    let client = NatsClient::new(nats_cfg);
    client
        .connect()
        .await
        .map_err(|e| anyhow!("NATS connection failed: {e}"))?;

    let driver = NatsDriver::new(client.clone(), namespace, instance_id, options);
    Ok((Arc::new(driver), Some(client)))
}

/// Log every leadership change of this instance.
fn leadership_listeners(instance_id: String) -> SyncDispatcher {
    let dispatcher = SyncDispatcher::new();
    let id = instance_id.clone();
    dispatcher.subscribe(listen(Topic::BecameLeader, move |event| {
        info!(instance_id = %id, election = %event.election, session = %event.session, "this instance is now the active leader");
        Ok(())
    }));
    dispatcher.subscribe(listen(Topic::LostLeadership, move |event| {
        info!(instance_id = %instance_id, election = %event.election, reason = %event.reason, "this instance is on standby");
        Ok(())
    }));
    dispatcher
}

fn flatten(res: Result<ElectionResult<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
