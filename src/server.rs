//! RedVault TCP Server
//!
//! RESP key-value server with append-only log persistence and one tokio task
//! per client connection.

use crate::{
    aof::{AppendOnlyLog, FlushTask, DEFAULT_FLUSH_INTERVAL},
    command::{CommandRegistry, Request},
    error::Result,
    protocol::{RespReader, Value},
    store::{MemoryStore, Store},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncWriteExt, BufWriter},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// RedVault server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub aof_path: PathBuf,
    pub flush_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6379".to_string(),
            aof_path: PathBuf::from("database.aof"),
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL.as_secs(),
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

/// State shared by every connection task
#[derive(Clone)]
struct Context {
    store: MemoryStore,
    registry: Arc<CommandRegistry>,
    aof: Arc<AppendOnlyLog>,
}

impl Context {
    async fn execute(&self, value: Value) -> Value {
        let request = match Request::from_value(&value) {
            Ok(request) => request,
            Err(reply) => return reply,
        };

        let Some(spec) = self.registry.get(&request.name) else {
            warn!(command = %request.name, "unknown command");
            return Value::simple("");
        };

        if let Err(reply) = spec.check_arity(&request.args) {
            return reply;
        }

        if !spec.durable {
            return spec.execute(&self.store, &request.args);
        }

        let (written, reply) = self
            .aof
            .append_with(&value, || spec.execute(&self.store, &request.args))
            .await;
        if let Err(e) = written {
            // The command still runs; the log just misses this record.
            warn!(command = %request.name, error = %e, "failed to append command to log");
        }
        reply
    }
}

/// RedVault TCP server
pub struct RedVaultServer {
    config: ServerConfig,
    ctx: Context,
    shutdown_tx: watch::Sender<bool>,
}

impl RedVaultServer {
    /// Open the log, rebuild the store from it and compact it.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let aof = Arc::new(AppendOnlyLog::open(&config.aof_path)?);
        let store = MemoryStore::new();
        let registry = Arc::new(CommandRegistry::new());

        info!(path = %config.aof_path.display(), "restoring state from append-only log");
        let replayed = aof
            .replay(|record| registry.replay(&store, &record))
            .await?;
        aof.compact(|| store.snapshot()).await?;
        aof.activate().await?;
        info!(records = replayed, keys = store.len(), "state restored");

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            ctx: Context {
                store,
                registry,
                aof,
            },
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &MemoryStore {
        &self.ctx.store
    }

    /// Run one decoded request exactly as a connection would.
    pub async fn execute(&self, request: Value) -> Value {
        self.ctx.execute(request).await
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until [`RedVaultServer::shutdown`].
    ///
    /// On shutdown, stops accepting, waits for every connection task to
    /// finish, stops the background flush, compacts and closes the log.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("RedVault server listening on {}", listener.local_addr()?);

        let flush = FlushTask::spawn(Arc::clone(&self.ctx.aof), self.config.flush_interval());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "client connected");
                            let ctx = self.ctx.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            workers.spawn(async move {
                                if let Err(e) = handle_client(stream, ctx, shutdown_rx).await {
                                    warn!(%addr, error = %e, "closing connection");
                                }
                                debug!(%addr, "client disconnected");
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }

                // Reap finished connection tasks
                Some(_) = workers.join_next(), if !workers.is_empty() => {}

                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        while workers.join_next().await.is_some() {}
        flush.stop().await;

        let compacted = self.ctx.aof.compact(|| self.ctx.store.snapshot()).await;
        if let Err(e) = &compacted {
            error!(error = %e, "final compaction failed");
        }
        self.ctx.aof.close().await?;
        info!("server stopped");

        compacted.map(|_| ())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Handle a single client connection
async fn handle_client(
    stream: TcpStream,
    ctx: Context,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = RespReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let request = tokio::select! {
            result = reader.read_value() => match result? {
                Some(value) => value,
                None => break,
            },
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
        };

        let reply = ctx.execute(request).await;
        writer.write_all(&reply.to_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
