// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monitor app: renders the metrics table as scrape text.
//!
//! Singleton; runs under the fixed node name `monitor`. Once a second it
//! walks the metrics visitor and rewrites the rendered exposition, which
//! [`rendered`] returns to whatever serves it (the REST surface, a file
//! exporter, tests).
//!
//! Output follows the `# HELP / # TYPE / name{labels} value` line
//! grammar used by common scraping tools.

use crate::error::Result;
use crate::metrics::MetricsView;
use crate::node::NodeKind;
use crate::plugin::{AppPlugin, CachePolicy, Plugin, PluginContext, PluginInstance, PluginModule};
use crate::reactor::TimerKind;
use crate::tag::SharedTransData;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Plugin name in the registry.
pub const PLUGIN_NAME: &str = "monitor";

/// Fixed node name of the singleton instance.
pub const NODE_NAME: &str = "monitor";

const METRIC_PREFIX: &str = "fieldmesh";

static RENDERED: OnceLock<Mutex<String>> = OnceLock::new();

fn slot() -> &'static Mutex<String> {
    RENDERED.get_or_init(|| Mutex::new(String::new()))
}

/// Last rendered exposition text.
pub fn rendered() -> String {
    slot().lock().clone()
}

/// Module descriptor.
pub fn module() -> PluginModule {
    PluginModule {
        name: PLUGIN_NAME,
        version: "1.0.0",
        description: "Metrics exposition in scrape text format",
        schema: r#"{"type":"object"}"#,
        kind: NodeKind::App,
        single: true,
        single_name: NODE_NAME,
        timer_kind: TimerKind::NonBlock,
        cache_policy: CachePolicy::Snapshot,
        constructor: || PluginInstance::App(Box::new(Monitor::new())),
    }
}

struct Monitor {
    ctx: Option<Arc<dyn PluginContext>>,
}

impl Monitor {
    fn new() -> Monitor {
        Monitor { ctx: None }
    }
}

impl Plugin for Monitor {
    fn init(&mut self, ctx: Arc<dyn PluginContext>, _load: bool) -> Result<()> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn setting(&mut self, setting: &str) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(setting)?;
        Ok(())
    }
}

impl AppPlugin for Monitor {
    fn on_trans_data(&mut self, _data: &SharedTransData) -> Result<()> {
        Ok(())
    }

    fn timer_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    fn on_timer(&mut self) {
        if let Some(ctx) = &self.ctx {
            ctx.visit_metrics(&mut |view| {
                *slot().lock() = render(view);
            });
        }
    }
}

/// Render one metrics view as exposition text.
pub fn render(view: &MetricsView) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# HELP {p}_uptime_seconds Seconds since the fabric started",
        p = METRIC_PREFIX
    );
    let _ = writeln!(out, "# TYPE {p}_uptime_seconds gauge", p = METRIC_PREFIX);
    let _ = writeln!(
        out,
        "{p}_uptime_seconds {v}",
        p = METRIC_PREFIX,
        v = view.uptime_seconds
    );

    let _ = writeln!(
        out,
        "# HELP {p}_nodes Node count by kind",
        p = METRIC_PREFIX
    );
    let _ = writeln!(out, "# TYPE {p}_nodes gauge", p = METRIC_PREFIX);
    let _ = writeln!(
        out,
        "{p}_nodes{{kind=\"driver\"}} {v}",
        p = METRIC_PREFIX,
        v = view.counts.drivers
    );
    let _ = writeln!(
        out,
        "{p}_nodes{{kind=\"app\"}} {v}",
        p = METRIC_PREFIX,
        v = view.counts.apps
    );

    let _ = writeln!(
        out,
        "# HELP {p}_running_nodes Nodes in the RUNNING state",
        p = METRIC_PREFIX
    );
    let _ = writeln!(out, "# TYPE {p}_running_nodes gauge", p = METRIC_PREFIX);
    let _ = writeln!(
        out,
        "{p}_running_nodes {v}",
        p = METRIC_PREFIX,
        v = view.counts.running
    );

    for entry in &view.global {
        let _ = writeln!(
            out,
            "# HELP {p}_{n} {h}",
            p = METRIC_PREFIX,
            n = entry.name,
            h = entry.help
        );
        let _ = writeln!(
            out,
            "# TYPE {p}_{n} {t}",
            p = METRIC_PREFIX,
            n = entry.name,
            t = entry.kind.label()
        );
        let _ = writeln!(
            out,
            "{p}_{n} {v}",
            p = METRIC_PREFIX,
            n = entry.name,
            v = entry.value
        );
    }

    // HELP/TYPE once per metric name, then one labelled line per node.
    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    for node in &view.nodes {
        for entry in &node.entries {
            if emitted.insert(entry.name.as_str()) {
                let _ = writeln!(
                    out,
                    "# HELP {p}_{n} {h}",
                    p = METRIC_PREFIX,
                    n = entry.name,
                    h = entry.help
                );
                let _ = writeln!(
                    out,
                    "# TYPE {p}_{n} {t}",
                    p = METRIC_PREFIX,
                    n = entry.name,
                    t = entry.kind.label()
                );
            }
        }
    }
    for node in &view.nodes {
        for entry in &node.entries {
            let _ = writeln!(
                out,
                "{p}_{n}{{node=\"{node}\"}} {v}",
                p = METRIC_PREFIX,
                n = entry.name,
                node = node.node,
                v = entry.value
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricEntry, MetricKind, NodeCounts, NodeMetricsView};
    use crate::node::{LinkState, RunState};

    #[test]
    fn test_render_grammar() {
        let view = MetricsView {
            uptime_seconds: 42,
            counts: NodeCounts {
                drivers: 1,
                apps: 1,
                running: 2,
                ..Default::default()
            },
            global: vec![MetricEntry {
                name: "trans_data_dispatched_total".into(),
                help: "Snapshots dispatched to subscribers".into(),
                kind: MetricKind::Counter,
                value: 7,
            }],
            nodes: vec![NodeMetricsView {
                node: "d1".into(),
                kind: NodeKind::Driver,
                running: RunState::Running,
                link: LinkState::Connected,
                entries: vec![MetricEntry {
                    name: "send_msgs_total".into(),
                    help: "Envelopes sent by the node".into(),
                    kind: MetricKind::Counter,
                    value: 3,
                }],
            }],
        };
        let text = render(&view);
        assert!(text.contains("fieldmesh_uptime_seconds 42"));
        assert!(text.contains("# TYPE fieldmesh_send_msgs_total counter"));
        assert!(text.contains("fieldmesh_send_msgs_total{node=\"d1\"} 3"));
        assert!(text.contains("fieldmesh_nodes{kind=\"driver\"} 1"));
        assert!(text.contains("fieldmesh_trans_data_dispatched_total 7"));
    }
}
