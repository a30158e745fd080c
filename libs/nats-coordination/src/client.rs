//! NATS connection shared by the election drivers of one process.
//!
//! Credentials are resolved from [`NatsConfig`] before the first dial, so a
//! misconfigured host fails at startup instead of campaigning against a
//! server it can never authenticate with. Once connected, async-nats
//! reconnects on its own; [`NatsClient::state`] exposes where it is so the
//! host can report degraded coordination.

use std::{sync::Arc, time::Duration};

use async_nats::{ConnectOptions, Event, connection::State, jetstream};
use leader_election::RetryPolicy;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{Auth, NatsConfig};
use crate::error::{CoordinationError, CoordinationResult};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Health of the coordination connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connected,
    /// Connected once; async-nats is dialing again. Renewals fail meanwhile.
    Reconnecting,
    /// Never connected, or shut down.
    Disconnected,
}

/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct NatsClient {
    config: Arc<NatsConfig>,
    conn: Arc<RwLock<Option<async_nats::Client>>>,
}

impl NatsClient {
    /// Does not dial; see [`connect`](Self::connect).
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config: Arc::new(config),
            conn: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Name of the claims KV bucket.
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Upper bound applied to each KV operation.
    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    async fn connect_options(&self, auth: &Auth) -> CoordinationResult<ConnectOptions> {
        let opts = match auth {
            Auth::None => ConnectOptions::new(),
            Auth::UserPassword { username, password } => {
                ConnectOptions::with_user_and_password(username.clone(), password.clone())
            }
            Auth::Token(token) => ConnectOptions::with_token(token.clone()),
            Auth::Nkey(seed_path) => {
                let seed = tokio::fs::read_to_string(seed_path).await.map_err(|e| {
                    CoordinationError::Config(format!(
                        "failed to read nkey seed file '{}': {e}",
                        seed_path.display()
                    ))
                })?;
                ConnectOptions::with_nkey(seed.trim().to_owned())
            }
            Auth::ClientCert { cert, key } => ConnectOptions::new()
                .add_client_certificate(cert.clone(), key.clone())
                .require_tls(true),
            Auth::CredsFile(path) => ConnectOptions::with_credentials_file(path)
                .await
                .map_err(|e| {
                    CoordinationError::Config(format!(
                        "failed to load credentials file '{}': {e}",
                        path.display()
                    ))
                })?,
        };
        let opts = match &self.config.tls_ca_path {
            Some(ca_path) => opts
                .add_root_certificates(ca_path.clone())
                .require_tls(true),
            None => opts,
        };

        Ok(opts
            .connection_timeout(self.config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .event_callback(|event| async move {
                match event {
                    Event::Disconnected => {
                        warn!("NATS connection lost, claim renewals fail until it is restored")
                    }
                    Event::Connected => info!("NATS connection restored"),
                    other => debug!(event = ?other, "NATS client event"),
                }
            }))
    }

    /// Dial the configured servers.
    ///
    /// Configuration errors return immediately. Failed dials are retried
    /// `connect_retry_max` times with exponential backoff. A no-op when a
    /// connection already exists.
    pub async fn connect(&self) -> CoordinationResult<()> {
        if self.conn.read().is_some() {
            debug!("NATS client already connected");
            return Ok(());
        }
        self.config.validate()?;
        let auth = self.config.auth()?;
        let policy = RetryPolicy {
            max_retries: self.config.connect_retry_max,
            base_delay: CONNECT_RETRY_BASE_DELAY,
        };
        info!(
            servers = ?self.config.servers,
            security_mode = ?self.config.security_mode,
            bucket = %self.config.bucket,
            "connecting to NATS"
        );

        let mut failures = 0u32;
        loop {
            let opts = self.connect_options(&auth).await?;
            let err = match opts.connect(self.config.servers.clone()).await {
                Ok(client) => {
                    *self.conn.write() = Some(client);
                    info!(attempt = failures + 1, "NATS connection established");
                    return Ok(());
                }
                Err(err) => err,
            };
            failures += 1;
            if failures > policy.max_retries {
                error!(attempts = failures, error = %err, "could not connect to NATS");
                return Err(CoordinationError::Transport(format!(
                    "could not connect to NATS after {failures} attempt(s): {err}"
                )));
            }
            let delay = policy.delay(failures).min(MAX_CONNECT_RETRY_DELAY);
            warn!(
                attempt = failures,
                retry_in_ms = delay.as_millis(),
                error = %err,
                "NATS connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.conn.read().as_ref().map(|c| c.connection_state()) {
            Some(State::Connected) => ConnectionState::Connected,
            Some(State::Disconnected | State::Pending) => ConnectionState::Reconnecting,
            None => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn jetstream(&self) -> CoordinationResult<jetstream::Context> {
        self.conn
            .read()
            .clone()
            .map(jetstream::new)
            .ok_or_else(|| CoordinationError::NotConnected("NATS client not connected".into()))
    }

    /// The claims bucket, created when missing.
    ///
    /// A created bucket keeps one revision per key and drops values older
    /// than `session_ttl`, which is what expires a holder that stopped
    /// renewing. An existing bucket is used as is.
    pub async fn claims_store(
        &self,
        session_ttl: Duration,
    ) -> CoordinationResult<jetstream::kv::Store> {
        let js = self.jetstream()?;
        let bucket = self.bucket();
        match js.get_key_value(bucket.to_owned()).await {
            Ok(store) => Ok(store),
            Err(get_err) => {
                debug!(bucket, error = %get_err, "creating claims bucket");
                js.create_key_value(jetstream::kv::Config {
                    bucket: bucket.to_owned(),
                    history: 1,
                    max_age: session_ttl,
                    ..Default::default()
                })
                .await
                .map_err(|create_err| {
                    CoordinationError::Transport(format!(
                        "failed to create claims bucket '{bucket}': {create_err} (get error: {get_err})"
                    ))
                })
            }
        }
    }

    /// Flush pending writes and drop the connection.
    pub async fn disconnect(&self) {
        let Some(conn) = self.conn.write().take() else {
            return;
        };
        if let Err(err) = conn.flush().await {
            debug!(error = %err, "flush before disconnect failed");
        }
        info!("NATS client disconnected");
    }
}

impl std::fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsClient")
            .field("servers", &self.config.servers)
            .field("bucket", &self.config.bucket)
            .field("state", &self.state())
            .finish()
    }
}
