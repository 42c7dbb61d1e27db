use std::collections::HashMap;
use std::time::{Duration, Instant};

use statagg_core::protocol::{AgentSummary, MetricsEnvelope};

use crate::conn::ConnectionHandle;

/// One currently-registered agent.
///
/// Liveness is tracked on the monotonic clock; `last_seen_ms` is the
/// wall-clock value sent on the wire in roster snapshots.
pub struct AgentEntry {
    pub agent_id: String,
    pub conn: ConnectionHandle,
    pub last_seen: Instant,
    pub last_seen_ms: i64,
    pub latest_metrics: Option<MetricsEnvelope>,
}

/// Authoritative agent-id -> entry mapping. Plain sync state; the hub wraps
/// it in a single mutex and these operations are the only mutation surface.
#[derive(Default)]
pub struct AgentRegistry {
    entries: HashMap<String, AgentEntry>,
    // Insertion order of current entries, for stable roster snapshots.
    // Re-registration keeps an agent's original position.
    order: Vec<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the entry for `agent_id` (last-write-wins) and
    /// return the entry it displaced, if any.
    pub fn register_agent(
        &mut self,
        agent_id: &str,
        conn: ConnectionHandle,
        now: Instant,
        now_ms: i64,
    ) -> Option<AgentEntry> {
        let previous = self.entries.insert(
            agent_id.to_string(),
            AgentEntry {
                agent_id: agent_id.to_string(),
                conn,
                last_seen: now,
                last_seen_ms: now_ms,
                latest_metrics: None,
            },
        );
        if previous.is_none() {
            self.order.push(agent_id.to_string());
        }
        previous
    }

    /// Refresh `latest_metrics` and `last_seen` if the agent is known.
    /// Returns whether it was; reports for unknown ids are dropped upstream.
    pub fn record_metrics(
        &mut self,
        agent_id: &str,
        metrics: MetricsEnvelope,
        now: Instant,
        now_ms: i64,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(agent_id) else {
            return false;
        };
        entry.latest_metrics = Some(metrics);
        entry.last_seen = now;
        entry.last_seen_ms = now_ms;
        true
    }

    pub fn remove_agent(&mut self, agent_id: &str) -> Option<AgentEntry> {
        let entry = self.entries.remove(agent_id);
        if entry.is_some() {
            self.order.retain(|id| id != agent_id);
        }
        entry
    }

    /// Remove `agent_id` only if it is still mapped to `conn_id`. A socket
    /// closing after its registration was superseded must not evict the
    /// replacement entry.
    pub fn remove_if_connection(&mut self, agent_id: &str, conn_id: u64) -> Option<AgentEntry> {
        match self.entries.get(agent_id) {
            Some(entry) if entry.conn.conn_id() == conn_id => self.remove_agent(agent_id),
            _ => None,
        }
    }

    pub fn connection(&self, agent_id: &str) -> Option<ConnectionHandle> {
        self.entries.get(agent_id).map(|entry| entry.conn.clone())
    }

    /// Roster snapshot for a fresh subscriber, in insertion order.
    pub fn snapshot_all(&self) -> Vec<AgentSummary> {
        self.order
            .iter()
            .filter_map(|agent_id| self.entries.get(agent_id))
            .map(|entry| AgentSummary {
                agent_id: entry.agent_id.clone(),
                last_seen: entry.last_seen_ms,
                has_metrics: entry.latest_metrics.is_some(),
            })
            .collect()
    }

    /// Every agent silent for strictly longer than `timeout`.
    pub fn find_stale(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|agent_id| self.entries.get(agent_id))
            .filter(|entry| now.duration_since(entry.last_seen) > timeout)
            .map(|entry| entry.agent_id.clone())
            .collect()
    }
}
