// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::Duration;

use chain_core::{KeySigner, PublicKey, Signer, TrustRoot};
use tracing_subscriber::EnvFilter;

use sequencer::api::AppState;
use sequencer::gossip::{BlockFeed, FollowerConfig, follow_primary};
use sequencer::sequencer_core::{
    Role, SequencerCore, SequencerCoreConfig, SequencerCoreError,
};
use sequencer::storage;

const DEFAULT_MODE: &str = "primary";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DB_PATH: &str = "sequencer.db";
const DEFAULT_QUEUE_CAP: usize = 1024;
const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 100;
const DEFAULT_MAX_ITEMS_PER_TURN: usize = 64;
const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(2);
const DEFAULT_MAX_BODY_BYTES: usize = 128 * 1024;
const DEFAULT_MAX_RANGE_LEN: u64 = 1000;
const DEFAULT_SQLITE_SYNCHRONOUS: &str = "NORMAL";
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_FOLLOWER_STALL_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_FEED_BUFFER_CAP: usize = 1024;
const DEFAULT_METRICS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let (role, trust_root) = config.build_role()?;

    let storage = storage::Storage::open(&config.db_path, &config.sqlite_synchronous)?;
    let (core, handle) = SequencerCore::new(
        role,
        trust_root,
        storage,
        SequencerCoreConfig {
            queue_capacity: config.queue_capacity,
            max_items_per_turn: config.max_items_per_turn,
            idle_poll_interval: config.idle_poll_interval,
            metrics_enabled: config.metrics_enabled,
            metrics_log_interval: config.metrics_log_interval,
        },
    )?;

    // Every node serves what it accepts, so replicas can be chained.
    let feed = BlockFeed::new(config.feed_buffer_capacity);
    feed.attach(&handle);
    let (mut core_join, core_stop) = core.spawn();

    let follower = match (&config.mode, &config.primary_ws_url) {
        (NodeMode::Replica, Some(url)) => Some(tokio::spawn(follow_primary(
            FollowerConfig {
                primary_ws_url: url.clone(),
                reconnect_delay: config.reconnect_delay,
                stall_timeout: config.follower_stall_timeout,
            },
            handle.clone(),
        ))),
        (NodeMode::Replica, None) => {
            tracing::warn!("SEQ_PRIMARY_WS_URL not set; replica will only serve stored blocks");
            None
        }
        (NodeMode::Primary, _) => None,
    };

    let state = Arc::new(AppState {
        sequencer: handle,
        feed,
        db_path: config.db_path.clone(),
        queue_timeout: Duration::from_millis(config.queue_timeout_ms),
        max_range_len: config.max_range_len,
    });

    let app = sequencer::api::router(state, config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;

    tracing::info!(address = %config.http_addr, mode = config.mode.as_str(), "listening");
    let outcome: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        server_result = axum::serve(listener, app) => {
            core_stop.request_shutdown();
            let core_result = core_join.await;
            match core_result {
                Ok(SequencerCoreError::ShutdownRequested) => server_result.map_err(Into::into),
                Ok(err) => Err(format!("sequencer core exited during shutdown: {err}").into()),
                Err(join_err) => {
                    Err(format!("sequencer core join error during shutdown: {join_err}").into())
                }
            }
        }
        core_result = &mut core_join => {
            match core_result {
                Ok(err) => Err(format!("sequencer core exited: {err}").into()),
                Err(join_err) => Err(format!("sequencer core join error: {join_err}").into()),
            }
        }
    };

    if let Some(follower) = follower {
        follower.abort();
    }
    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeMode {
    Primary,
    Replica,
}

impl NodeMode {
    fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "replica" => Ok(Self::Replica),
            other => Err(format!("SEQ_MODE must be 'primary' or 'replica', got '{other}'")),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
        }
    }
}

struct Config {
    mode: NodeMode,
    http_addr: String,
    db_path: String,
    queue_capacity: usize,
    queue_timeout_ms: u64,
    max_items_per_turn: usize,
    idle_poll_interval: Duration,
    max_body_bytes: usize,
    max_range_len: u64,
    sqlite_synchronous: String,
    operator_private_key: Option<String>,
    operator_public_key: Option<String>,
    primary_ws_url: Option<String>,
    reconnect_delay: Duration,
    follower_stall_timeout: Duration,
    feed_buffer_capacity: usize,
    metrics_enabled: bool,
    metrics_log_interval: Duration,
}

impl Config {
    fn from_env() -> Result<Self, String> {
        Ok(Self {
            mode: NodeMode::parse(env_string("SEQ_MODE", DEFAULT_MODE).as_str())?,
            http_addr: env_string("SEQ_HTTP_ADDR", DEFAULT_HTTP_ADDR),
            db_path: env_string("SEQ_DB_PATH", DEFAULT_DB_PATH),
            queue_capacity: env_usize("SEQ_QUEUE_CAP", DEFAULT_QUEUE_CAP).max(1),
            queue_timeout_ms: env_u64("SEQ_QUEUE_TIMEOUT_MS", DEFAULT_QUEUE_TIMEOUT_MS),
            max_items_per_turn: env_usize("SEQ_MAX_ITEMS_PER_TURN", DEFAULT_MAX_ITEMS_PER_TURN)
                .max(1),
            idle_poll_interval: Duration::from_millis(
                env_u64(
                    "SEQ_IDLE_POLL_INTERVAL_MS",
                    DEFAULT_IDLE_POLL_INTERVAL.as_millis() as u64,
                )
                .max(1),
            ),
            max_body_bytes: env_usize("SEQ_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
            max_range_len: env_u64("SEQ_MAX_RANGE_LEN", DEFAULT_MAX_RANGE_LEN).max(1),
            sqlite_synchronous: env_string("SEQ_SQLITE_SYNCHRONOUS", DEFAULT_SQLITE_SYNCHRONOUS),
            operator_private_key: env_optional("SEQ_OPERATOR_PRIVATE_KEY"),
            operator_public_key: env_optional("SEQ_OPERATOR_PUBLIC_KEY"),
            primary_ws_url: env_optional("SEQ_PRIMARY_WS_URL"),
            reconnect_delay: Duration::from_millis(env_u64(
                "SEQ_RECONNECT_DELAY_MS",
                DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            )),
            follower_stall_timeout: Duration::from_millis(
                env_u64(
                    "SEQ_FOLLOWER_STALL_TIMEOUT_MS",
                    DEFAULT_FOLLOWER_STALL_TIMEOUT.as_millis() as u64,
                )
                .max(1),
            ),
            feed_buffer_capacity: env_usize("SEQ_FEED_BUFFER_CAP", DEFAULT_FEED_BUFFER_CAP).max(1),
            metrics_enabled: env_bool("SEQ_METRICS_ENABLED", false),
            metrics_log_interval: Duration::from_millis(
                env_u64(
                    "SEQ_METRICS_LOG_INTERVAL_MS",
                    DEFAULT_METRICS_LOG_INTERVAL.as_millis() as u64,
                )
                .max(1),
            ),
        })
    }

    /// The operator public key comes from `SEQ_OPERATOR_PUBLIC_KEY` when set,
    /// otherwise a primary derives it from its own private key.
    fn build_role(&self) -> Result<(Role, TrustRoot), String> {
        let configured_operator = self
            .operator_public_key
            .as_deref()
            .map(PublicKey::from_hex)
            .transpose()
            .map_err(|err| format!("SEQ_OPERATOR_PUBLIC_KEY: {err}"))?;

        match self.mode {
            NodeMode::Primary => {
                let secret = self
                    .operator_private_key
                    .as_deref()
                    .ok_or_else(|| "SEQ_OPERATOR_PRIVATE_KEY is required in primary mode".to_string())?;
                let signer = KeySigner::from_hex(secret)
                    .map_err(|err| format!("SEQ_OPERATOR_PRIVATE_KEY: {err}"))?;
                let operator = configured_operator.unwrap_or_else(|| signer.public_key());
                tracing::info!(operator = %operator, "primary operator key loaded");
                Ok((Role::Primary(signer), TrustRoot::single(operator)))
            }
            NodeMode::Replica => {
                let operator = configured_operator.ok_or_else(|| {
                    "SEQ_OPERATOR_PUBLIC_KEY is required in replica mode".to_string()
                })?;
                tracing::info!(operator = %operator, "trusting operator key");
                Ok((Role::Replica, TrustRoot::single(operator)))
            }
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
