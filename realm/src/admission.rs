//! Per-client admission control
//!
//! Each connected client owns one [`RateLimitRecord`]. Inbound client messages
//! bump its request counter; reaching the cap puts the client in a penalty
//! state during which every message is answered with `RATE_LIMITED`. Two
//! periodic sweeps run alongside: the window decay resets counters of clients
//! that are not limited, and the penalty sweep releases clients whose penalty
//! has run out.

use crate::config::RateLimitConfig;
use log::{debug, info};
use shared::ConnId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Rate-limit bookkeeping for one client
#[derive(Debug, Clone)]
pub struct RateLimitRecord {
    pub id: ConnId,
    pub request_count: u32,
    /// Set while the client is limited; `None` otherwise
    pub limited_at: Option<Instant>,
    /// Time accumulated in the current window
    pub window_elapsed: Duration,
}

impl RateLimitRecord {
    pub fn new(id: ConnId) -> Self {
        Self {
            id,
            request_count: 0,
            limited_at: None,
            window_elapsed: Duration::ZERO,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limited_at.is_some()
    }

    fn penalty_expired(&self, now: Instant, penalty: Duration) -> bool {
        self.limited_at
            .is_some_and(|at| now.saturating_duration_since(at) > penalty)
    }

    fn release(&mut self) {
        self.limited_at = None;
        self.request_count = 0;
        self.window_elapsed = Duration::ZERO;
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Reply `RATE_LIMITED` and do not forward the message
    Limited,
}

pub struct AdmissionController {
    config: RateLimitConfig,
    records: HashMap<ConnId, RateLimitRecord>,
}

impl AdmissionController {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Starts tracking a newly connected client
    pub fn track(&mut self, id: ConnId) {
        self.records.insert(id.clone(), RateLimitRecord::new(id));
    }

    /// Drops the record of a disconnected client
    pub fn forget(&mut self, id: &ConnId) -> bool {
        self.records.remove(id).is_some()
    }

    pub fn record(&self, id: &ConnId) -> Option<&RateLimitRecord> {
        self.records.get(id)
    }

    /// Decides whether one inbound message from `id` may be forwarded.
    ///
    /// A limited client is rejected without its counter moving. A penalty that
    /// already ran out is released here rather than waiting for the sweep.
    pub fn admit(&mut self, id: &ConnId, now: Instant) -> Admission {
        let config = self.config;
        let record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| RateLimitRecord::new(id.clone()));

        if record.is_limited() {
            if !record.penalty_expired(now, config.penalty) {
                return Admission::Limited;
            }
            record.release();
        }

        record.request_count += 1;
        if record.request_count >= config.max_requests {
            record.limited_at = Some(now);
            info!(
                "Client {} rate limited after {} requests",
                id, record.request_count
            );
            return Admission::Limited;
        }

        Admission::Accepted
    }

    /// Advances every unlimited client's window by one tick, resetting the
    /// counter once the window length has been reached
    pub fn decay(&mut self, tick: Duration) {
        let window = self.config.window;
        for record in self.records.values_mut().filter(|r| !r.is_limited()) {
            record.window_elapsed += tick;
            if record.window_elapsed >= window {
                record.request_count = 0;
                record.window_elapsed = Duration::ZERO;
            }
        }
    }

    /// Releases clients whose penalty ran out. Returns the released ids.
    pub fn expire_penalties(&mut self, now: Instant) -> Vec<ConnId> {
        let penalty = self.config.penalty;
        let mut released = Vec::new();

        for record in self.records.values_mut() {
            if record.penalty_expired(now, penalty) {
                record.release();
                released.push(record.id.clone());
            }
        }

        released
    }

    pub fn limited_count(&self) -> usize {
        self.records.values().filter(|r| r.is_limited()).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Spawns the window decay and penalty sweeps. Abort the handle to stop them.
pub fn spawn_maintenance(admission: Arc<Mutex<AdmissionController>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = *admission.lock().await.config();

        let mut decay_timer = interval(config.window_tick);
        decay_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut penalty_timer = interval(config.penalty);
        penalty_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Both intervals fire immediately once; skip that.
        decay_timer.tick().await;
        penalty_timer.tick().await;

        loop {
            tokio::select! {
                _ = decay_timer.tick() => {
                    admission.lock().await.decay(config.window_tick);
                }
                _ = penalty_timer.tick() => {
                    let released = admission.lock().await.expire_penalties(Instant::now());
                    for id in released {
                        debug!("Client {} penalty expired", id);
                    }
                }
            }
        }
    })
}
