//! Courier delivery server.
//!
//! One Courier instance admits client sockets, tracks their sessions, queues
//! and delivers messages by priority, and shares state with sibling
//! instances through a broker.
//!
//! # Architecture
//!
//! [`ServerDriver`] is the sans-IO core: it consumes [`ServerEvent`]s and
//! returns [`ServerAction`]s, reading time and randomness only through an
//! [`courier_core::Environment`] and storage only through a [`Broker`].
//! [`Server`] is the production runtime that executes those actions with
//! Quinn QUIC and Tokio.
//!
//! # Components
//!
//! - [`lifecycle`]: admission, sessions, heartbeats and reconnection
//! - [`queue`]: prioritized, rate-limited, acknowledged delivery
//! - [`fabric`]: cross-instance pub/sub with dedupe and buffering
//! - [`directory`]: rooms, membership, moderation, presence and typing
//! - [`broker`]: the shared store ([`MemoryBroker`], [`RedbBroker`],
//!   [`ChaoticBroker`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod directory;
mod driver;
mod error;
pub mod fabric;
pub mod lifecycle;
pub mod metrics;
pub mod queue;
pub mod registry;
mod system_env;
mod transport;

use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc, time::Duration};

pub use broker::{Broker, BrokerError, ChaoticBroker, MemoryBroker, RedbBroker};
pub use config::{ConfigError, CourierConfig};
use courier_core::Environment;
use courier_proto::{Frame, FrameHeader};
pub use driver::{LogLevel, ServerAction, ServerDriver, ServerEvent};
pub use error::{DriverError, ServerError};
pub use metrics::MetricsSnapshot;
pub use system_env::SystemEnv;
use tokio::{
    sync::{Mutex, RwLock},
    time::MissedTickBehavior,
};
pub use transport::{QuinnConnection, QuinnTransport, TlsSource};

type SharedDriver<B> = Arc<Mutex<ServerDriver<SystemEnv, B>>>;

/// Live connections and their outbound streams, keyed by socket id.
struct SharedState {
    /// Connections, for closing
    connections: RwLock<HashMap<u64, QuinnConnection>>,
    /// One outbound stream per socket; everything a client receives goes
    /// through it, in order.
    outbound_streams: RwLock<HashMap<u64, Mutex<quinn::SendStream>>>,
}

/// Production runtime settings.
#[derive(Debug, Clone, Default)]
pub struct ServerRuntimeConfig {
    /// Component configuration
    pub courier: CourierConfig,
    /// Certificate source
    pub tls: TlsSource,
}

/// Production Courier server.
///
/// Wraps [`ServerDriver`] with Quinn QUIC transport, Tokio timers and the
/// system environment.
pub struct Server<B: Broker> {
    driver: SharedDriver<B>,
    transport: QuinnTransport,
    env: SystemEnv,
    tick: Duration,
    queue_tick: Duration,
}

impl<B: Broker> Server<B> {
    /// Bind the endpoint and recover messages left unfinished by a previous
    /// run of this instance.
    pub fn bind(config: ServerRuntimeConfig, broker: B) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let tick = Duration::from_millis(config.courier.server.tick_interval_ms);
        let queue_tick = Duration::from_millis(config.courier.server.queue_tick_interval_ms);
        let transport = QuinnTransport::bind(&config.courier.server.bind_address, &config.tls)?;

        let mut driver = ServerDriver::new(env, broker, config.courier);
        let recovered = driver.recover()?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered unfinished messages");
        }

        Ok(Self { driver: Arc::new(Mutex::new(driver)), transport, env, tick, queue_tick })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Current metrics.
    pub async fn metrics(&self) -> MetricsSnapshot {
        self.driver.lock().await.metrics()
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then persist sessions, say goodbye
    /// to every client and close the endpoint.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let server_id = self.driver.lock().await.server_id().to_string();
        tracing::info!(%server_id, addr = %self.transport.local_addr()?, "server starting");

        let shared = Arc::new(SharedState {
            connections: RwLock::new(HashMap::new()),
            outbound_streams: RwLock::new(HashMap::new()),
        });

        let timers = tokio::spawn(run_timers(
            Arc::clone(&self.driver),
            Arc::clone(&shared),
            self.tick,
            self.queue_tick,
        ));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.transport.accept() => match accepted {
                    Some(Ok(conn)) => {
                        let driver = Arc::clone(&self.driver);
                        let shared = Arc::clone(&shared);
                        let socket_id = self.env.random_u64();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket_id, conn, driver, shared).await {
                                tracing::warn!(socket_id, error = %e, "connection error");
                            }
                        });
                    },
                    Some(Err(e)) => tracing::debug!(error = %e, "accept failed"),
                    None => break,
                },
            }
        }

        timers.abort();
        tracing::info!("shutting down");
        {
            let mut driver = self.driver.lock().await;
            let actions = driver.shutdown()?;
            execute_actions(actions, &shared).await?;
        }
        self.transport.close("server shutting down");
        Ok(())
    }
}

/// Drive the heartbeat tick and the queue tick.
async fn run_timers<B: Broker>(
    driver: SharedDriver<B>,
    shared: Arc<SharedState>,
    tick: Duration,
    queue_tick: Duration,
) {
    let mut tick = tokio::time::interval(tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut queue_tick = tokio::time::interval(queue_tick);
    queue_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let event = tokio::select! {
            _ = tick.tick() => ServerEvent::Tick,
            _ = queue_tick.tick() => ServerEvent::QueueTick,
        };

        let mut driver = driver.lock().await;
        match driver.process_event(event) {
            Ok(actions) => {
                if let Err(e) = execute_actions(actions, &shared).await {
                    tracing::error!(error = %e, "failed to execute timer actions");
                }
            },
            Err(e) => tracing::error!(error = %e, "timer event failed"),
        }
    }
}

/// Handle a single QUIC connection.
async fn handle_connection<B: Broker>(
    socket_id: u64,
    conn: QuinnConnection,
    driver: SharedDriver<B>,
    shared: Arc<SharedState>,
) -> Result<(), ServerError> {
    let addr = conn.remote_addr();
    tracing::debug!(socket_id, %addr, "new connection");

    let outbound = conn.open_uni().await?;
    shared.connections.write().await.insert(socket_id, conn.clone());
    shared.outbound_streams.write().await.insert(socket_id, Mutex::new(outbound));

    {
        let mut driver = driver.lock().await;
        let actions =
            driver.process_event(ServerEvent::ConnectionAccepted { socket_id, addr: addr.ip() })?;
        execute_actions(actions, &shared).await?;
    }

    let reason = loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let driver = Arc::clone(&driver);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(socket_id, send, recv, driver, &shared).await {
                        tracing::debug!(socket_id, error = %e, "stream error");
                    }
                });
            },
            Err(e) => break e.to_string(),
        }
    };

    shared.connections.write().await.remove(&socket_id);
    shared.outbound_streams.write().await.remove(&socket_id);

    let mut driver = driver.lock().await;
    let actions = driver.process_event(ServerEvent::ConnectionClosed { socket_id, reason })?;
    execute_actions(actions, &shared).await
}

/// Read frames from one client stream until it ends or desynchronizes.
async fn handle_stream<B: Broker>(
    socket_id: u64,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    driver: SharedDriver<B>,
    shared: &Arc<SharedState>,
) -> Result<(), ServerError> {
    // Replies travel on the outbound stream
    drop(send);

    let mut buf = Vec::with_capacity(4096);
    loop {
        buf.clear();
        buf.resize(FrameHeader::SIZE, 0);
        if let Err(e) = recv.read_exact(&mut buf).await {
            tracing::trace!(socket_id, error = %e, "stream ended");
            break;
        }

        // A bad header leaves no way to find the next frame boundary
        let payload_size = match FrameHeader::from_bytes(&buf) {
            Ok(header) => header.payload_size() as usize,
            Err(e) => {
                return Err(ServerError::Protocol(format!("invalid frame header: {e}")));
            },
        };

        buf.resize(FrameHeader::SIZE + payload_size, 0);
        recv.read_exact(&mut buf[FrameHeader::SIZE..])
            .await
            .map_err(|e| ServerError::Transport(format!("payload read failed: {e}")))?;

        let frame = Frame::decode(&buf).map_err(|e| ServerError::Protocol(e.to_string()))?;

        let mut driver = driver.lock().await;
        match driver.process_event(ServerEvent::FrameReceived { socket_id, frame }) {
            Ok(actions) => execute_actions(actions, shared).await?,
            Err(e) => tracing::warn!(socket_id, error = %e, "frame processing failed"),
        }
    }

    Ok(())
}

/// Execute server actions.
async fn execute_actions(
    actions: Vec<ServerAction>,
    shared: &SharedState,
) -> Result<(), ServerError> {
    for action in actions {
        match action {
            ServerAction::SendToSocket { socket_id, frame } => {
                let bytes = frame.to_vec().map_err(|e| ServerError::Protocol(e.to_string()))?;
                let streams = shared.outbound_streams.read().await;
                match streams.get(&socket_id) {
                    Some(stream) => {
                        if let Err(e) = stream.lock().await.write_all(&bytes).await {
                            tracing::debug!(socket_id, error = %e, "write failed");
                        }
                    },
                    None => tracing::trace!(socket_id, "send to unknown socket"),
                }
            },

            ServerAction::CloseConnection { socket_id, reason } => {
                tracing::debug!(socket_id, %reason, "closing connection");
                if let Some(stream) = shared.outbound_streams.write().await.remove(&socket_id) {
                    // Flush frames queued ahead of the close
                    let _ = stream.into_inner().finish();
                }
                if let Some(conn) = shared.connections.write().await.remove(&socket_id) {
                    conn.close(&reason);
                }
            },

            ServerAction::SessionFailed { socket_id, session_id, user_id } => {
                tracing::info!(socket_id, %session_id, %user_id, "session failed");
            },

            ServerAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Error => tracing::error!("{message}"),
            },
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_config() -> ServerRuntimeConfig {
        let mut config = ServerRuntimeConfig::default();
        config.courier.server.bind_address = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test]
    async fn binds_and_reports_metrics() {
        let server = Server::bind(runtime_config(), MemoryBroker::new()).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let metrics = server.metrics().await;
        assert_eq!(metrics.connections, 0);
        assert_eq!(metrics.server_id, "courier-1");
    }

    #[tokio::test]
    async fn run_until_returns_on_shutdown() {
        let server = Server::bind(runtime_config(), MemoryBroker::new()).unwrap();
        let result = server.run_until(async {}).await;
        assert!(result.is_ok());
    }
}
