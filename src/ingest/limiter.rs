// src/ingest/limiter.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::ingest::types::{Politeness, SourceDescriptor};

#[derive(Debug)]
struct SourceGate {
    interval: Duration,
    // tokio's Mutex queues waiters FIFO, which gives per-source fairness
    next_slot: tokio::sync::Mutex<Option<Instant>>,
}

/// Per-source request pacing shared by every connector call.
#[derive(Debug, Default)]
pub struct PolitenessLimiter {
    gates: Mutex<HashMap<String, Arc<SourceGate>>>,
}

impl PolitenessLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources(sources: &[SourceDescriptor]) -> Self {
        let limiter = Self::new();
        for s in sources {
            limiter.register(&s.id, &s.politeness);
        }
        limiter
    }

    /// (Re)configure a source. Replacing a gate resets its pacing state.
    pub fn register(&self, source_id: &str, politeness: &Politeness) {
        let gate = Arc::new(SourceGate {
            interval: politeness.interval(),
            next_slot: tokio::sync::Mutex::new(None),
        });
        self.gates
            .lock()
            .expect("limiter mutex poisoned")
            .insert(source_id.to_string(), gate);
    }

    fn gate(&self, source_id: &str) -> Arc<SourceGate> {
        let mut gates = self.gates.lock().expect("limiter mutex poisoned");
        gates
            .entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(SourceGate {
                    interval: Politeness::default().interval(),
                    next_slot: tokio::sync::Mutex::new(None),
                })
            })
            .clone()
    }

    /// Wait until the next request to `source_id` is allowed, then claim that slot.
    pub async fn acquire(&self, source_id: &str) {
        let gate = self.gate(source_id);
        let mut next = gate.next_slot.lock().await;
        let now = Instant::now();
        let slot = match *next {
            Some(t) if t > now => {
                tracing::trace!(target: "ingest", source = source_id, wait_ms = (t - now).as_millis() as u64, "politeness wait");
                tokio::time::sleep_until(t).await;
                t
            }
            _ => now,
        };
        *next = Some(slot + gate.interval);
    }

    pub fn interval_of(&self, source_id: &str) -> Duration {
        self.gate(source_id).interval
    }
}
