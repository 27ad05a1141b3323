use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::metrics;
use crate::proxy::weight::{DynamicWeight, WeightPolicy};

struct MirrorState {
    alive: bool,
    load: usize,
    weight: f64,
}

pub struct Mirror {
    url: String,
    state: Mutex<MirrorState>,
}

impl Mirror {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: Mutex::new(MirrorState {
                alive: true,
                load: 0,
                weight: 1.0,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn state(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MirrorStatus {
    pub url: String,
    pub alive: bool,
    pub load: usize,
    pub weight: f64,
}

#[derive(Default)]
struct Registry {
    mirrors: Vec<Arc<Mirror>>,
    index: HashMap<String, usize>,
}

/// Weighted least-load choice over a fixed set of mirrors.
///
/// Each mirror has its own lock and at most one of them is held at a time;
/// the list lock is only written during registration.
pub struct UpstreamSelector {
    registry: RwLock<Registry>,
    policy: Box<dyn WeightPolicy>,
    max_resurrections: usize,
}

impl UpstreamSelector {
    pub fn new(max_resurrections: usize) -> Self {
        Self::with_policy(DynamicWeight::default(), max_resurrections)
    }

    pub fn with_policy(policy: impl WeightPolicy + 'static, max_resurrections: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            policy: Box::new(policy),
            max_resurrections,
        }
    }

    pub fn register(&self, url: &str) {
        let url = url.trim().trim_end_matches('/');
        if url.is_empty() {
            return;
        }
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.index.contains_key(url) {
            log::warn!("mirror {url} registered twice, ignoring");
            return;
        }
        let idx = registry.mirrors.len();
        registry.mirrors.push(Arc::new(Mirror::new(url)));
        registry.index.insert(url.to_string(), idx);
    }

    pub fn len(&self) -> usize {
        self.read().mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the alive mirror with the lowest `load / weight` and counts the
    /// new request against it. When nothing is alive every mirror is revived,
    /// at most `max_resurrections` times per call.
    pub fn acquire(&self) -> Option<String> {
        let registry = self.read();
        let mirrors = &registry.mirrors;
        if mirrors.is_empty() {
            return None;
        }
        for round in 0..=self.max_resurrections {
            if round > 0 {
                log::warn!("no alive mirrors, reviving all {}", mirrors.len());
                metrics::record_resurrection();
                for mirror in mirrors {
                    mirror.state().alive = true;
                }
            }
            // The winner can be marked dead between the scan and the claim.
            for _ in 0..=mirrors.len() {
                let Some(idx) = pick(mirrors) else { break };
                let mut state = mirrors[idx].state();
                if state.alive {
                    state.load += 1;
                    return Some(mirrors[idx].url.clone());
                }
            }
        }
        None
    }

    pub fn release(&self, url: &str, elapsed: Duration, bytes: u64) {
        let Some(mirror) = self.find(url) else {
            log::debug!("release for unknown mirror {url}");
            return;
        };
        let mut state = mirror.state();
        state.load = state.load.saturating_sub(1);
        state.weight = self.policy.weight(state.load, elapsed, bytes);
    }

    pub fn mark_dead(&self, url: &str) {
        let Some(mirror) = self.find(url) else {
            log::debug!("mark_dead for unknown mirror {url}");
            return;
        };
        let mut state = mirror.state();
        state.alive = false;
        state.load = 0;
        metrics::record_mirror_dead(url);
    }

    pub fn snapshot(&self) -> Vec<MirrorStatus> {
        self.read()
            .mirrors
            .iter()
            .map(|mirror| {
                let state = mirror.state();
                MirrorStatus {
                    url: mirror.url.clone(),
                    alive: state.alive,
                    load: state.load,
                    weight: state.weight,
                }
            })
            .collect()
    }

    fn find(&self, url: &str) -> Option<Arc<Mirror>> {
        let registry = self.read();
        let url = url.trim_end_matches('/');
        registry.index.get(url).map(|idx| Arc::clone(&registry.mirrors[*idx]))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scans once from a random offset so ties do not always favour the first
/// registered mirror.
fn pick(mirrors: &[Arc<Mirror>]) -> Option<usize> {
    let n = mirrors.len();
    let start = rand::thread_rng().gen_range(0..n);
    let mut best: Option<(usize, f64)> = None;
    for i in 0..n {
        let idx = (start + i) % n;
        let state = mirrors[idx].state();
        if !state.alive {
            continue;
        }
        let ratio = state.load as f64 / state.weight;
        if best.map_or(true, |(_, min)| ratio < min) {
            best = Some((idx, ratio));
        }
    }
    best.map(|(idx, _)| idx)
}
