use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use statagg_core::protocol::{
    decode_client_message, ClientMessage, RelayMessage, DEFAULT_MAX_FRAME_BYTES,
};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::conn::ConnectionHandle;
use crate::registry::AgentRegistry;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub addr: String,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub write_timeout: Duration,
    pub debug: bool,
}

/// Role a connection settles into after its first identifying message.
/// Stable until the socket closes.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ConnRole {
    Unidentified,
    Agent(String),
    Observer,
}

pub struct RelayHub {
    config: RelayConfig,
    conn_counter: AtomicU64,
    registry: Mutex<AgentRegistry>,
    observers: RwLock<HashMap<u64, ConnectionHandle>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl RelayHub {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            registry: Mutex::new(AgentRegistry::new()),
            observers: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Deliver an event to every observer still open. Peers whose writer
    /// queue is gone are pruned; full queues are skipped, not waited on.
    async fn broadcast(&self, message: &RelayMessage) {
        let observers = self
            .observers
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut closed = Vec::new();
        for observer in observers {
            if !observer.send(message) && !observer.is_open() {
                closed.push(observer.conn_id());
            }
        }
        if !closed.is_empty() {
            let mut observers = self.observers.write().await;
            for conn_id in closed {
                observers.remove(&conn_id);
            }
        }
    }

    async fn handle_message(&self, conn: &ConnectionHandle, role: &mut ConnRole, message: ClientMessage) {
        match message {
            ClientMessage::Register(payload) => {
                if *role == ConnRole::Observer {
                    warn!(
                        event = "role_violation",
                        conn_id = conn.conn_id(),
                        attempted = "register"
                    );
                    return;
                }
                let agent_id = payload.agent_id;
                let registered_ms = now_ms();
                let previous = {
                    let mut registry = self.registry.lock().await;
                    registry.register_agent(&agent_id, conn.clone(), Instant::now(), registered_ms)
                };
                if let Some(previous) = previous {
                    if previous.conn.conn_id() != conn.conn_id() {
                        // Superseded registration is force-closed rather than
                        // left orphaned.
                        warn!(
                            event = "registration_superseded",
                            agent_id = %agent_id,
                            old_conn_id = previous.conn.conn_id(),
                            conn_id = conn.conn_id()
                        );
                        previous.conn.close("superseded");
                    }
                }
                *role = ConnRole::Agent(agent_id.clone());
                info!(
                    event = "agent_registered",
                    conn_id = conn.conn_id(),
                    agent_id = %agent_id
                );
                conn.send(&RelayMessage::RegistrationConfirmed {
                    agent_id: agent_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                });
                self.broadcast(&RelayMessage::AgentConnected {
                    agent_id,
                    timestamp: registered_ms,
                })
                .await;
            }
            ClientMessage::Metrics(report) => {
                let metrics = report.envelope();
                let known = {
                    let mut registry = self.registry.lock().await;
                    registry.record_metrics(
                        &report.agent_id,
                        metrics.clone(),
                        Instant::now(),
                        now_ms(),
                    )
                };
                if !known {
                    debug!(
                        event = "metrics_dropped",
                        conn_id = conn.conn_id(),
                        agent_id = %report.agent_id
                    );
                    return;
                }
                self.broadcast(&RelayMessage::MetricsUpdate {
                    agent_id: report.agent_id,
                    metrics,
                })
                .await;
            }
            ClientMessage::Subscribe => {
                if matches!(role, ConnRole::Agent(_)) {
                    warn!(
                        event = "role_violation",
                        conn_id = conn.conn_id(),
                        attempted = "client_subscribe"
                    );
                    return;
                }
                *role = ConnRole::Observer;
                self.observers
                    .write()
                    .await
                    .insert(conn.conn_id(), conn.clone());
                let agents = self.registry.lock().await.snapshot_all();
                info!(
                    event = "observer_subscribed",
                    conn_id = conn.conn_id(),
                    agents = agents.len()
                );
                conn.send(&RelayMessage::AgentList { agents });
            }
            ClientMessage::Command(request) => {
                let target = self.registry.lock().await.connection(&request.agent_id);
                match target {
                    Some(target) => {
                        info!(
                            event = "command_forwarded",
                            conn_id = conn.conn_id(),
                            agent_id = %request.agent_id
                        );
                        target.send(&RelayMessage::Command {
                            command: request.command,
                            timestamp: now_ms(),
                        });
                    }
                    None => {
                        // No negative acknowledgment on this protocol.
                        debug!(
                            event = "command_dropped",
                            conn_id = conn.conn_id(),
                            agent_id = %request.agent_id
                        );
                    }
                }
            }
            ClientMessage::Unrecognized { raw_type } => {
                warn!(
                    event = "unknown_message",
                    conn_id = conn.conn_id(),
                    r#type = %raw_type
                );
            }
        }
    }

    /// Decode one inbound frame and dispatch it. Malformed payloads are
    /// logged and discarded; the connection stays open.
    async fn handle_frame(&self, conn: &ConnectionHandle, role: &mut ConnRole, data: &[u8]) {
        let message = match decode_client_message(data, DEFAULT_MAX_FRAME_BYTES) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = conn.conn_id(), error = %err);
                return;
            }
        };
        self.handle_message(conn, role, message).await;
    }

    async fn cleanup(&self, conn: &ConnectionHandle, role: &ConnRole) {
        match role {
            ConnRole::Agent(agent_id) => {
                let removed = self
                    .registry
                    .lock()
                    .await
                    .remove_if_connection(agent_id, conn.conn_id());
                if removed.is_some() {
                    info!(
                        event = "agent_disconnected",
                        conn_id = conn.conn_id(),
                        agent_id = %agent_id
                    );
                    self.broadcast(&RelayMessage::AgentDisconnected {
                        agent_id: agent_id.clone(),
                        timestamp: now_ms(),
                    })
                    .await;
                }
            }
            ConnRole::Observer => {
                self.observers.write().await.remove(&conn.conn_id());
                info!(event = "observer_disconnected", conn_id = conn.conn_id());
            }
            ConnRole::Unidentified => {}
        }
    }

    /// One liveness pass: evict every agent silent past the timeout, close
    /// its socket, and tell the observers. Eviction of each agent is atomic
    /// under the registry lock; the fan-out happens after it is released.
    pub async fn sweep_once(&self, now: Instant) {
        let evicted = {
            let mut registry = self.registry.lock().await;
            registry
                .find_stale(now, self.config.stale_after)
                .iter()
                .filter_map(|agent_id| registry.remove_agent(agent_id))
                .collect::<Vec<_>>()
        };
        for entry in evicted {
            warn!(event = "agent_timeout", agent_id = %entry.agent_id);
            entry.conn.close("stale");
            self.broadcast(&RelayMessage::AgentDisconnected {
                agent_id: entry.agent_id,
                timestamp: now_ms(),
            })
            .await;
        }
    }

    pub fn spawn_stale_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_ok() && *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.sweep_once(Instant::now()).await;
                    }
                }
            }
        });
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
            }
        });

        let conn = ConnectionHandle::new(self.next_conn_id(), tx.clone());
        let mut role = ConnRole::Unidentified;
        info!(event = "connection_open", conn_id = conn.conn_id());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(event = "read_error", conn_id = conn.conn_id(), error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "peer_close", conn_id = conn.conn_id());
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.config.debug {
                debug!(
                    event = "message_received",
                    conn_id = conn.conn_id(),
                    raw = %String::from_utf8_lossy(&data)
                );
            }
            self.handle_frame(&conn, &mut role, &data).await;
        }

        self.cleanup(&conn, &role).await;
        drop(tx);
        let _ = write_task.await;
    }
}
