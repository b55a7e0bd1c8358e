//! Start or stop every jail flagged to boot
//!
//! Jails go in priority order, ascending for start and descending for
//! stop, with ties kept in listing order. Jails sharing a priority are
//! handed to a small worker pool and the next priority waits until the
//! whole group is done. Starts also pass through a token bucket so a
//! large host does not bring everything up in one burst.

use super::LifecycleController;
use crate::config::JailConfig;
use crate::error::{Error, Result};
use crossbeam::channel;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use throttle_machines::token_bucket;

/// Per-jail results of a bulk operation
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub done: Vec<String>,
    /// Already in the requested state
    pub skipped: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl BulkOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Start,
    Stop,
}

/// Longest single sleep while waiting for a start token
const MAX_THROTTLE_WAIT: Duration = Duration::from_secs(60);

/// Token bucket shared by the start workers
struct StartThrottle {
    state: Mutex<(f64, Instant)>,
    epoch: Instant,
    capacity: f64,
    rate: f64,
}

impl StartThrottle {
    fn new(capacity: f64, rate: f64) -> Self {
        let epoch = Instant::now();
        Self {
            state: Mutex::new((capacity, epoch)),
            epoch,
            capacity,
            rate,
        }
    }

    /// Block until a start token is available
    fn wait(&self) {
        loop {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let (tokens, last_refill) = *state;
            let now = Instant::now();
            let now_secs = now.duration_since(self.epoch).as_secs_f64();
            let last_refill_secs = last_refill.duration_since(self.epoch).as_secs_f64();

            let result = token_bucket::check(tokens, last_refill_secs, now_secs, self.capacity, self.rate);
            if result.allowed {
                *state = (result.new_tokens, now);
                return;
            }

            let retry_after = result.retry_after;
            drop(state);
            tracing::debug!(retry_after, "start rate limited");
            std::thread::sleep(throttle_wait(retry_after));
        }
    }
}

/// Sleep for a bucket's retry hint, bounded to a sane range
fn throttle_wait(retry_after: f64) -> Duration {
    Duration::try_from_secs_f64(retry_after.max(0.0))
        .unwrap_or(MAX_THROTTLE_WAIT)
        .min(MAX_THROTTLE_WAIT)
}

fn priority(cfg: &JailConfig) -> u32 {
    cfg.number("priority").unwrap_or(99)
}

/// Group jails by priority in the order the operation visits them
fn ordered(mut jails: Vec<JailConfig>, direction: Direction) -> Vec<(u32, Vec<JailConfig>)> {
    match direction {
        Direction::Start => jails.sort_by_key(priority),
        Direction::Stop => jails.sort_by_key(|cfg| std::cmp::Reverse(priority(cfg))),
    }

    let mut groups: Vec<(u32, Vec<JailConfig>)> = Vec::new();
    for cfg in jails {
        let p = priority(&cfg);
        match groups.last_mut() {
            Some((last, group)) if *last == p => group.push(cfg),
            _ => groups.push((p, vec![cfg])),
        }
    }
    groups
}

/// Reject dependency cycles among the selected jails
fn check_cycles(jails: &[JailConfig]) -> Result<()> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    let mut node = |graph: &mut DiGraph<String, ()>, name: &str| {
        *nodes
            .entry(name.to_string())
            .or_insert_with(|| graph.add_node(name.to_string()))
    };

    for cfg in jails {
        let jail = node(&mut graph, cfg.name());
        for dependency in cfg.get("depends").split_whitespace().filter(|d| *d != "none") {
            let dependency = node(&mut graph, dependency);
            graph.add_edge(dependency, jail, ());
        }
    }

    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        Error::InvalidConfiguration(format!(
            "cyclic dependency involving jail '{}'",
            graph[cycle.node_id()]
        ))
    })
}

impl LifecycleController<'_> {
    /// Start every `boot=on` jail
    pub fn start_all(&self) -> Result<BulkOutcome> {
        self.run_all(Direction::Start)
    }

    /// Stop every `boot=on` jail
    pub fn stop_all(&self) -> Result<BulkOutcome> {
        self.run_all(Direction::Stop)
    }

    fn booting(&self) -> Result<Vec<JailConfig>> {
        let mut jails = Vec::new();
        for loaded in self.store.load_all()? {
            match loaded {
                Ok(cfg) if cfg.record.is_template() => {}
                Ok(cfg) if cfg.is_on("boot") => jails.push(cfg),
                Ok(_) => {}
                Err((record, e)) => {
                    tracing::warn!(jail = %record.name, error = %e, "skipping unreadable jail");
                }
            }
        }
        check_cycles(&jails)?;
        Ok(jails)
    }

    fn run_all(&self, direction: Direction) -> Result<BulkOutcome> {
        let jails = self.booting()?;
        let bulk = &self.ctx.settings().bulk;
        let throttle = StartThrottle::new(bulk.start_burst, bulk.start_rate);
        let outcome = Mutex::new(BulkOutcome::default());

        for (priority, group) in ordered(jails, direction) {
            self.ctx.cancel().check()?;
            let workers = bulk.workers.clamp(1, group.len());
            tracing::info!(?direction, priority, jails = group.len(), workers, "bulk group");

            let (tx, rx) = channel::unbounded();
            for cfg in group {
                tx.send(cfg)
                    .map_err(|_| Error::allocation("bulk worker", "work queue closed"))?;
            }
            drop(tx);

            let throttle = &throttle;
            let outcome = &outcome;
            crossbeam::scope(|scope| {
                for _ in 0..workers {
                    let rx = rx.clone();
                    scope.spawn(move |_| {
                        for cfg in rx.iter() {
                            self.run_one(cfg, direction, throttle, outcome);
                        }
                    });
                }
            })
            .map_err(|_| Error::allocation("bulk worker", "a worker thread panicked"))?;
        }

        Ok(outcome.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    fn run_one(
        &self,
        cfg: JailConfig,
        direction: Direction,
        throttle: &StartThrottle,
        outcome: &Mutex<BulkOutcome>,
    ) {
        let name = cfg.name().to_string();
        let running = self.ctx.host().jail_id(&cfg.record.kernel_name()).is_some();
        let result = match direction {
            Direction::Start if running => None,
            Direction::Start => {
                throttle.wait();
                Some(self.start_config(cfg, &mut Vec::new()))
            }
            Direction::Stop if !running => None,
            Direction::Stop => Some(self.stop_config(&cfg, false)),
        };

        let mut outcome = outcome.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            None => outcome.skipped.push(name),
            Some(Ok(())) => outcome.done.push(name),
            Some(Err(e)) => {
                tracing::error!(jail = %name, ?direction, error = %e, "bulk operation failed");
                outcome.failed.push((name, e));
            }
        }
    }
}
