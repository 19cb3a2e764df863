// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node and global metrics with visitor exposure.
//!
//! Counters and gauges are atomics; rolling counters keep timestamped
//! samples over a configured span and report the sum of the surviving
//! window. A name registry counts references per metric name, so a node
//! can be torn down while another still holds the same entry name.
//!
//! Exposure is by visitor only: [`MetricsStore::visit`] computes derived
//! fields out of band, takes the reader side of the table lock, snapshots
//! everything into a [`MetricsView`] and calls the callback exactly once.

use crate::node::{LinkState, NodeKind, RunState, StateCell};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metric entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    RollingCounter,
}

impl MetricKind {
    /// Type label in the exposure grammar.
    pub fn label(self) -> &'static str {
        match self {
            MetricKind::Counter | MetricKind::RollingCounter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Snapshot of one metric.
#[derive(Debug, Clone)]
pub struct MetricEntry {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub value: u64,
}

/// Standard metric names.
pub mod names {
    pub const SEND_MSGS_TOTAL: &str = "send_msgs_total";
    pub const SEND_MSG_ERRORS_TOTAL: &str = "send_msg_errors_total";
    pub const RECV_MSGS_TOTAL: &str = "recv_msgs_total";
    pub const TAG_READS_TOTAL: &str = "tag_reads_total";
    pub const TAG_READ_ERRORS_TOTAL: &str = "tag_read_errors_total";
    pub const TAG_WRITES_TOTAL: &str = "tag_writes_total";
    pub const GROUP_TIMER_MS: &str = "group_timer_ms";
    pub const TRANS_DATA_5S: &str = "trans_data_5s";
    pub const UPTIME_SECONDS: &str = "uptime_seconds";
    pub const TRANS_DATA_DISPATCHED_TOTAL: &str = "trans_data_dispatched_total";
    pub const TRANS_DATA_DROPPED_TOTAL: &str = "trans_data_dropped_total";
}

/// Span of the standard rolling counters.
pub const ROLLING_SPAN: Duration = Duration::from_secs(5);

struct RollingWindow {
    span: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl RollingWindow {
    fn new(span: Duration) -> RollingWindow {
        RollingWindow {
            span,
            samples: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.span {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, value: u64) {
        let now = Instant::now();
        self.evict(now);
        self.samples.push_back((now, value));
    }

    fn value(&mut self) -> u64 {
        self.evict(Instant::now());
        self.samples.iter().map(|&(_, v)| v).sum()
    }
}

enum Cell {
    Counter(AtomicU64),
    Gauge(AtomicU64),
    Rolling(Mutex<RollingWindow>),
}

impl Cell {
    fn kind(&self) -> MetricKind {
        match self {
            Cell::Counter(_) => MetricKind::Counter,
            Cell::Gauge(_) => MetricKind::Gauge,
            Cell::Rolling(_) => MetricKind::RollingCounter,
        }
    }

    fn value(&self) -> u64 {
        match self {
            Cell::Counter(v) | Cell::Gauge(v) => v.load(Ordering::Relaxed),
            Cell::Rolling(w) => w.lock().value(),
        }
    }
}

/// One node's (or the global) metric block.
#[derive(Default)]
pub struct MetricBlock {
    cells: DashMap<&'static str, Cell>,
}

impl MetricBlock {
    pub fn new() -> MetricBlock {
        MetricBlock::default()
    }

    pub fn define_counter(&self, name: &'static str) {
        self.cells.insert(name, Cell::Counter(AtomicU64::new(0)));
    }

    pub fn define_gauge(&self, name: &'static str) {
        self.cells.insert(name, Cell::Gauge(AtomicU64::new(0)));
    }

    pub fn define_rolling(&self, name: &'static str) {
        self.cells
            .insert(name, Cell::Rolling(Mutex::new(RollingWindow::new(ROLLING_SPAN))));
    }

    /// Add to a counter; unknown names are ignored.
    pub fn add(&self, name: &str, delta: u64) {
        if let Some(cell) = self.cells.get(name) {
            if let Cell::Counter(v) = cell.value() {
                v.fetch_add(delta, Ordering::Relaxed);
            }
        }
    }

    /// Set a gauge.
    pub fn set(&self, name: &str, value: u64) {
        if let Some(cell) = self.cells.get(name) {
            if let Cell::Gauge(v) = cell.value() {
                v.store(value, Ordering::Relaxed);
            }
        }
    }

    /// Record a rolling-counter sample.
    pub fn roll(&self, name: &str, value: u64) {
        if let Some(cell) = self.cells.get(name) {
            if let Cell::Rolling(w) = cell.value() {
                w.lock().record(value);
            }
        }
    }

    /// Current value of one metric.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.cells.get(name).map(|cell| cell.value().value())
    }

    fn snapshot(&self, registry: &MetricsRegistry) -> Vec<MetricEntry> {
        let mut entries: Vec<MetricEntry> = self
            .cells
            .iter()
            .map(|item| MetricEntry {
                name: (*item.key()).to_string(),
                help: registry.help_of(item.key()),
                kind: item.value().kind(),
                value: item.value().value(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

struct MetricDef {
    help: String,
    refs: usize,
}

/// Reference-counted metric name registry.
#[derive(Default)]
pub struct MetricsRegistry {
    defs: Mutex<HashMap<String, MetricDef>>,
}

impl MetricsRegistry {
    pub fn register(&self, name: &str, help: &str) {
        let mut defs = self.defs.lock();
        let def = defs.entry(name.to_string()).or_insert(MetricDef {
            help: help.to_string(),
            refs: 0,
        });
        def.refs += 1;
    }

    /// Drop one reference; the definition is removed when the last
    /// holder unregisters.
    pub fn unregister(&self, name: &str) {
        let mut defs = self.defs.lock();
        if let Some(def) = defs.get_mut(name) {
            def.refs -= 1;
            if def.refs == 0 {
                defs.remove(name);
            }
        }
    }

    pub fn refs_of(&self, name: &str) -> usize {
        self.defs.lock().get(name).map_or(0, |d| d.refs)
    }

    fn help_of(&self, name: &str) -> String {
        self.defs
            .lock()
            .get(name)
            .map_or_else(String::new, |d| d.help.clone())
    }
}

struct NodeSlot {
    kind: NodeKind,
    state: Arc<StateCell>,
    block: Arc<MetricBlock>,
}

/// Snapshot of one node handed to the visitor.
#[derive(Debug, Clone)]
pub struct NodeMetricsView {
    pub node: String,
    pub kind: NodeKind,
    pub running: RunState,
    pub link: LinkState,
    pub entries: Vec<MetricEntry>,
}

/// Node counts by kind and state, computed at visit time.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCounts {
    pub drivers: usize,
    pub apps: usize,
    pub init: usize,
    pub ready: usize,
    pub running: usize,
    pub stopped: usize,
    pub connected: usize,
}

/// Everything the visitor sees.
#[derive(Debug, Clone)]
pub struct MetricsView {
    pub uptime_seconds: u64,
    pub counts: NodeCounts,
    pub global: Vec<MetricEntry>,
    pub nodes: Vec<NodeMetricsView>,
}

const NODE_METRIC_HELP: &[(&str, &str)] = &[
    (names::SEND_MSGS_TOTAL, "Envelopes sent by the node"),
    (names::SEND_MSG_ERRORS_TOTAL, "Envelope sends that failed"),
    (names::RECV_MSGS_TOTAL, "Envelopes received by the node"),
    (names::TAG_READS_TOTAL, "Tags sampled by group polls"),
    (names::TAG_READ_ERRORS_TOTAL, "Tag samples that failed"),
    (names::TAG_WRITES_TOTAL, "Tag write requests handled"),
    (names::GROUP_TIMER_MS, "Duration of the last group poll"),
    (names::TRANS_DATA_5S, "Snapshots produced in the last 5s"),
];

/// The process-wide metrics table: global block plus a per-node map.
pub struct MetricsStore {
    start: Instant,
    registry: MetricsRegistry,
    global: Arc<MetricBlock>,
    nodes: RwLock<HashMap<String, NodeSlot>>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    pub fn new() -> MetricsStore {
        let global = Arc::new(MetricBlock::new());
        global.define_counter(names::TRANS_DATA_DISPATCHED_TOTAL);
        global.define_counter(names::TRANS_DATA_DROPPED_TOTAL);
        let registry = MetricsRegistry::default();
        registry.register(names::UPTIME_SECONDS, "Seconds since the fabric started");
        registry.register(
            names::TRANS_DATA_DISPATCHED_TOTAL,
            "Snapshots dispatched to subscribers",
        );
        registry.register(
            names::TRANS_DATA_DROPPED_TOTAL,
            "Snapshots dropped on full or missing mailboxes",
        );
        MetricsStore {
            start: Instant::now(),
            registry,
            global,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn global(&self) -> Arc<MetricBlock> {
        Arc::clone(&self.global)
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Create the standard metric block for a node.
    pub fn add_node(
        &self,
        name: &str,
        kind: NodeKind,
        state: Arc<StateCell>,
    ) -> Arc<MetricBlock> {
        let block = Arc::new(MetricBlock::new());
        block.define_counter(names::SEND_MSGS_TOTAL);
        block.define_counter(names::SEND_MSG_ERRORS_TOTAL);
        block.define_counter(names::RECV_MSGS_TOTAL);
        if kind == NodeKind::Driver {
            block.define_counter(names::TAG_READS_TOTAL);
            block.define_counter(names::TAG_READ_ERRORS_TOTAL);
            block.define_counter(names::TAG_WRITES_TOTAL);
            block.define_gauge(names::GROUP_TIMER_MS);
            block.define_rolling(names::TRANS_DATA_5S);
        }
        for (metric, help) in NODE_METRIC_HELP {
            if block.get(metric).is_some() {
                self.registry.register(metric, help);
            }
        }
        self.nodes.write().insert(
            name.to_string(),
            NodeSlot {
                kind,
                state,
                block: Arc::clone(&block),
            },
        );
        block
    }

    pub fn del_node(&self, name: &str) {
        if let Some(slot) = self.nodes.write().remove(name) {
            for (metric, _) in NODE_METRIC_HELP {
                if slot.block.get(metric).is_some() {
                    self.registry.unregister(metric);
                }
            }
        }
    }

    pub fn rename_node(&self, old: &str, new: &str) {
        let mut nodes = self.nodes.write();
        if let Some(slot) = nodes.remove(old) {
            nodes.insert(new.to_string(), slot);
        }
    }

    /// Snapshot the whole table and hand it to `cb` exactly once.
    pub fn visit<F: FnOnce(&MetricsView)>(&self, cb: F) {
        // Derived fields are computed before the read lock is taken.
        let uptime_seconds = self.start.elapsed().as_secs();
        let global = self.global.snapshot(&self.registry);

        let nodes = self.nodes.read();
        let mut counts = NodeCounts::default();
        let mut views = Vec::with_capacity(nodes.len());
        for (name, slot) in nodes.iter() {
            match slot.kind {
                NodeKind::Driver => counts.drivers += 1,
                NodeKind::App => counts.apps += 1,
            }
            match slot.state.running() {
                RunState::Init => counts.init += 1,
                RunState::Ready => counts.ready += 1,
                RunState::Running => counts.running += 1,
                RunState::Stopped => counts.stopped += 1,
            }
            if slot.state.link() == LinkState::Connected {
                counts.connected += 1;
            }
            views.push(NodeMetricsView {
                node: name.clone(),
                kind: slot.kind,
                running: slot.state.running(),
                link: slot.state.link(),
                entries: slot.block.snapshot(&self.registry),
            });
        }
        views.sort_by(|a, b| a.node.cmp(&b.node));
        drop(nodes);

        let view = MetricsView {
            uptime_seconds,
            counts,
            global,
            nodes: views,
        };
        cb(&view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let block = MetricBlock::new();
        block.define_counter(names::SEND_MSGS_TOTAL);
        block.define_gauge(names::GROUP_TIMER_MS);
        block.add(names::SEND_MSGS_TOTAL, 2);
        block.add(names::SEND_MSGS_TOTAL, 3);
        block.set(names::GROUP_TIMER_MS, 17);
        assert_eq!(block.get(names::SEND_MSGS_TOTAL), Some(5));
        assert_eq!(block.get(names::GROUP_TIMER_MS), Some(17));
    }

    #[test]
    fn test_rolling_window_evicts() {
        let mut w = RollingWindow::new(Duration::from_millis(30));
        w.record(2);
        w.record(3);
        assert_eq!(w.value(), 5);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(w.value(), 0, "samples past the span must be evicted");
    }

    #[test]
    fn test_registry_refcounts() {
        let reg = MetricsRegistry::default();
        reg.register("m", "help");
        reg.register("m", "help");
        assert_eq!(reg.refs_of("m"), 2);
        reg.unregister("m");
        assert_eq!(reg.refs_of("m"), 1);
        reg.unregister("m");
        assert_eq!(reg.refs_of("m"), 0);
    }

    #[test]
    fn test_visit_counts_nodes_by_kind_and_state() {
        let store = MetricsStore::new();
        let s1 = Arc::new(StateCell::new());
        s1.set_running(RunState::Running);
        s1.set_link(LinkState::Connected);
        let s2 = Arc::new(StateCell::new());
        s2.set_running(RunState::Ready);
        store.add_node("d1", NodeKind::Driver, s1);
        store.add_node("a1", NodeKind::App, s2);

        let mut visits = 0;
        store.visit(|view| {
            visits += 1;
            assert_eq!(view.counts.drivers, 1);
            assert_eq!(view.counts.apps, 1);
            assert_eq!(view.counts.running, 1);
            assert_eq!(view.counts.ready, 1);
            assert_eq!(view.counts.connected, 1);
            assert_eq!(view.nodes.len(), 2);
        });
        assert_eq!(visits, 1);
    }

    #[test]
    fn test_del_node_releases_registry_refs() {
        let store = MetricsStore::new();
        store.add_node("d1", NodeKind::Driver, Arc::new(StateCell::new()));
        store.add_node("d2", NodeKind::Driver, Arc::new(StateCell::new()));
        assert_eq!(store.registry().refs_of(names::TAG_READS_TOTAL), 2);
        store.del_node("d1");
        assert_eq!(store.registry().refs_of(names::TAG_READS_TOTAL), 1);
        store.del_node("d2");
        assert_eq!(store.registry().refs_of(names::TAG_READS_TOTAL), 0);
    }
}
