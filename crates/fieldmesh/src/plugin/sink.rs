// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sink app: collects received snapshots into a bounded queue.
//!
//! The queue for a node is obtained with [`output`]; tests and local
//! consumers read snapshots from it. Snapshots that arrive while the
//! queue is full are dropped and counted against the node's send-error
//! metric, mirroring the fabric's drop-not-block policy.

use crate::error::Result;
use crate::metrics::names;
use crate::node::{LinkState, NodeKind};
use crate::plugin::{AppPlugin, CachePolicy, Plugin, PluginContext, PluginInstance, PluginModule};
use crate::reactor::TimerKind;
use crate::tag::SharedTransData;
use crossbeam::channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

/// Plugin name in the registry.
pub const PLUGIN_NAME: &str = "sink";

/// Queue depth per sink node.
pub const SINK_QUEUE_DEPTH: usize = 4096;

static OUTPUTS: OnceLock<DashMap<String, Receiver<SharedTransData>>> = OnceLock::new();

fn outputs() -> &'static DashMap<String, Receiver<SharedTransData>> {
    OUTPUTS.get_or_init(DashMap::new)
}

/// Receiver side of a sink node's queue.
pub fn output(node: &str) -> Option<Receiver<SharedTransData>> {
    outputs().get(node).map(|r| r.value().clone())
}

/// Module descriptor.
pub fn module() -> PluginModule {
    PluginModule {
        name: PLUGIN_NAME,
        version: "1.0.0",
        description: "Snapshot sink with a bounded consumer queue",
        schema: r#"{"type":"object"}"#,
        kind: NodeKind::App,
        single: false,
        single_name: "",
        timer_kind: TimerKind::NonBlock,
        cache_policy: CachePolicy::Snapshot,
        constructor: || PluginInstance::App(Box::new(Sink::new())),
    }
}

struct Sink {
    ctx: Option<Arc<dyn PluginContext>>,
    tx: Option<Sender<SharedTransData>>,
}

impl Sink {
    fn new() -> Sink {
        Sink { ctx: None, tx: None }
    }
}

impl Plugin for Sink {
    fn init(&mut self, ctx: Arc<dyn PluginContext>, _load: bool) -> Result<()> {
        let (tx, rx) = bounded(SINK_QUEUE_DEPTH);
        outputs().insert(ctx.node_name(), rx);
        self.tx = Some(tx);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn uninit(&mut self) -> Result<()> {
        if let Some(ctx) = &self.ctx {
            outputs().remove(&ctx.node_name());
        }
        self.tx = None;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if let Some(ctx) = &self.ctx {
            ctx.set_link_state(LinkState::Connected);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(ctx) = &self.ctx {
            ctx.set_link_state(LinkState::Disconnected);
        }
        Ok(())
    }

    fn setting(&mut self, setting: &str) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(setting)?;
        Ok(())
    }
}

impl AppPlugin for Sink {
    fn on_trans_data(&mut self, data: &SharedTransData) -> Result<()> {
        if let Some(tx) = &self.tx {
            if tx.try_send(Arc::clone(data)).is_err() {
                if let Some(ctx) = &self.ctx {
                    ctx.metric_add(names::SEND_MSG_ERRORS_TOTAL, 1);
                }
            }
        }
        Ok(())
    }
}
