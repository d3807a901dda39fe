// Throughput benchmark harness

use crate::ipc::client::Client;
use crate::ipc::config::{ClientConfig, ServerConfig};
use crate::ipc::message::{Message, MIMETYPE_BINARY};
use crate::ipc::server::Server;
use crate::ipc::transport::ConnectionUri;
use anyhow::{Context, Result};
use rand::RngCore;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Which side(s) of the connection the benchmark runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BenchmarkMode {
    /// Drive load against an existing server
    Client,
    /// Run an echo server for the benchmark duration
    Server,
    /// Run both in this process
    ClientServer,
}

#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub uri: ConnectionUri,
    pub mode: BenchmarkMode,
    pub message_size: usize,
    pub duration: Duration,
    pub ramp_up: Duration,
    pub connections: usize,
    pub oneway: bool,
    pub encrypt: bool,
}

impl BenchmarkConfig {
    pub fn new(uri: ConnectionUri, mode: BenchmarkMode) -> Self {
        Self {
            uri,
            mode,
            message_size: 1024,
            duration: Duration::from_secs(10),
            ramp_up: Duration::ZERO,
            connections: 1,
            oneway: false,
            encrypt: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BenchmarkResult {
    pub mode: BenchmarkMode,
    pub connections: usize,
    pub message_size: usize,
    pub messages: u64,
    pub bytes: u64,
    pub elapsed_ms: u128,
    pub messages_per_sec: f64,
    pub bytes_per_sec: f64,
}

impl BenchmarkResult {
    fn new(config: &BenchmarkConfig, messages: u64, bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        Self {
            mode: config.mode,
            connections: config.connections,
            message_size: config.message_size,
            messages,
            bytes,
            elapsed_ms: elapsed.as_millis(),
            messages_per_sec: messages as f64 / secs,
            bytes_per_sec: bytes as f64 / secs,
        }
    }
}

impl fmt::Display for BenchmarkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mode:         {:?}", self.mode)?;
        writeln!(f, "Connections:  {}", self.connections)?;
        writeln!(f, "Message size: {} bytes", self.message_size)?;
        writeln!(f, "Messages:     {}", self.messages)?;
        writeln!(f, "Bytes:        {}", self.bytes)?;
        writeln!(f, "Elapsed:      {} ms", self.elapsed_ms)?;
        writeln!(f, "Throughput:   {:.0} msgs/s", self.messages_per_sec)?;
        write!(f, "              {:.2} MB/s", self.bytes_per_sec / (1024.0 * 1024.0))
    }
}

fn echo(msg: Message) -> anyhow::Result<Option<Message>> {
    Ok(Some(msg))
}

async fn start_echo_server(config: &BenchmarkConfig) -> Result<Server> {
    let server_config = ServerConfig::builder(config.uri.clone())
        .max_connections(config.connections.max(1) + 1)
        .encrypt(config.encrypt)
        .build()
        .context("Invalid benchmark server configuration")?;
    Server::with_handler(server_config, echo)
        .await
        .context("Failed to start benchmark server")
}

/// Run a benchmark to completion
pub async fn run(config: BenchmarkConfig) -> Result<BenchmarkResult> {
    if config.connections == 0 {
        anyhow::bail!("benchmark needs at least one connection");
    }
    info!(
        "Starting {:?} benchmark: {} connection(s), {} byte messages, {:?} (+{:?} ramp-up)",
        config.mode, config.connections, config.message_size, config.duration, config.ramp_up
    );

    match config.mode {
        BenchmarkMode::Client => drive_load(&config, config.uri.clone()).await,
        BenchmarkMode::ClientServer => {
            let server = start_echo_server(&config).await?;
            let result = drive_load(&config, server.local_uri().clone()).await;
            server.close().await;
            result
        }
        BenchmarkMode::Server => {
            let server = start_echo_server(&config).await?;
            info!("Benchmark server listening on {}", server.local_uri());
            tokio::time::sleep(config.ramp_up).await;
            let before = server.status().await.handled_requests;
            tokio::time::sleep(config.duration).await;
            let messages = server.status().await.handled_requests - before;
            server.close().await;
            let bytes = messages * config.message_size as u64;
            Ok(BenchmarkResult::new(&config, messages, bytes, config.duration))
        }
    }
}

/// One-way messages sent before waiting for the server to catch up
///
/// The server handles a connection's messages in order, so the answer to a
/// status request confirms every one-way message sent before it.
const ONEWAY_WINDOW: u64 = 128;

fn record(messages: &AtomicU64, bytes: &AtomicU64, count: u64, size: usize) {
    messages.fetch_add(count, Ordering::Relaxed);
    bytes.fetch_add(count * size as u64, Ordering::Relaxed);
}

async fn drive_load(config: &BenchmarkConfig, uri: ConnectionUri) -> Result<BenchmarkResult> {
    let client_config = ClientConfig::new(uri).encrypt(config.encrypt);
    let messages = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let measure_from = start + config.ramp_up;
    let stop_at = measure_from + config.duration;

    let mut workers = Vec::with_capacity(config.connections);
    for _ in 0..config.connections {
        let client = Client::connect(client_config.clone())
            .await
            .context("Failed to connect benchmark client")?;
        let messages = messages.clone();
        let bytes = bytes.clone();
        let size = config.message_size;
        let oneway = config.oneway;

        workers.push(tokio::spawn(async move {
            let mut payload = vec![0u8; size];
            rand::thread_rng().fill_bytes(&mut payload);
            // One-way messages sent since the last barrier, and how many of them count
            let mut in_flight: u64 = 0;
            let mut unconfirmed: u64 = 0;

            while Instant::now() < stop_at {
                let msg = Message::binary("bench", MIMETYPE_BINARY, payload.clone());
                let counted = Instant::now() >= measure_from;
                if oneway {
                    if let Err(e) = client.send_oneway(msg) {
                        warn!("Benchmark request failed: {}", e);
                        break;
                    }
                    in_flight += 1;
                    if counted {
                        unconfirmed += 1;
                    }
                    if in_flight >= ONEWAY_WINDOW {
                        if let Err(e) = client.server_status().await {
                            warn!("Benchmark barrier failed: {}", e);
                            unconfirmed = 0;
                            break;
                        }
                        record(&messages, &bytes, unconfirmed, size);
                        in_flight = 0;
                        unconfirmed = 0;
                    }
                } else {
                    if let Err(e) = client.send(msg, Some(Duration::from_secs(30))).await {
                        warn!("Benchmark request failed: {}", e);
                        break;
                    }
                    if counted {
                        record(&messages, &bytes, 1, size);
                    }
                }
            }

            if in_flight > 0 {
                match client.server_status().await {
                    Ok(_) => record(&messages, &bytes, unconfirmed, size),
                    Err(e) => warn!("Benchmark barrier failed: {}", e),
                }
            }
            client.close();
        }));
    }

    for worker in workers {
        worker.await.context("Benchmark worker failed")?;
    }

    let elapsed = Instant::now().saturating_duration_since(measure_from);
    Ok(BenchmarkResult::new(
        config,
        messages.load(Ordering::Relaxed),
        bytes.load(Ordering::Relaxed),
        elapsed,
    ))
}
