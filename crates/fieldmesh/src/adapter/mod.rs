// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Adapters: the runtime container for one node.
//!
//! An adapter pairs exactly one plugin instance with one reactor and one
//! mailbox. All adapter state transitions run on the reactor thread,
//! driven by envelopes drained from the mailbox in a wake callback;
//! other threads interact with a node only through the bus. The manager
//! keeps an [`Adapter`] handle per node for lifecycle control and
//! lock-free state reads.
//!
//! State machine: `INIT -> READY <-> RUNNING -> STOPPED`. `uninit` stops
//! the plugin and marks the core `STOPPED`; the manager then closes the
//! reactor, joining its thread before the adapter (and with it the
//! plugin instance) is dropped.

pub mod app;
pub mod driver;

use crate::bus::{Bus, Context, Envelope, MsgBody, NodeStateEntry};
use crate::error::{ErrorCode, Result};
use crate::group::GroupSet;
use crate::metrics::{names, MetricBlock, MetricsStore, MetricsView};
use crate::node::{LinkState, NodeKind, RunState, StateCell};
use crate::plugin::{PluginContext, PluginInstance, PluginModule, PluginRegistry};
use crate::reactor::Reactor;
use crate::tag::TransData;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use driver::DispatchRoutes;

/// Handle to one running node, owned by the manager's registry.
pub struct Adapter {
    name: Arc<RwLock<String>>,
    kind: NodeKind,
    plugin_name: String,
    reactor: Mutex<Reactor>,
    state: Arc<StateCell>,
    groups: Option<GroupSet>,
}

impl Adapter {
    /// Spawn the adapter: reactor thread, mailbox, plugin instance and
    /// core, wired together. The node is left in `INIT`; the manager
    /// sends `NODE_INIT` next.
    pub(crate) fn create(
        name: &str,
        module: &PluginModule,
        bus: Bus,
        plugins: &PluginRegistry,
        metrics: &Arc<MetricsStore>,
    ) -> Result<Arc<Adapter>> {
        let kind = module.kind;
        let instance = plugins.instantiate(module.name, kind, name)?;

        let reactor = Reactor::spawn(name).map_err(|e| {
            tracing::error!("node {}: reactor spawn failed: {}", name, e);
            plugins.release(module.name);
            ErrorCode::EInternal
        })?;
        let mailbox = match bus.bind(name, reactor.handle().notifier()) {
            Ok(mbox) => mbox,
            Err(e) => {
                plugins.release(module.name);
                return Err(e);
            }
        };

        let state = Arc::new(StateCell::new());
        let block = metrics.add_node(name, kind, Arc::clone(&state));
        let shared_name = Arc::new(RwLock::new(name.to_string()));
        let handle = reactor.handle();

        let groups = match instance {
            PluginInstance::Driver(plugin) => {
                let groups = GroupSet::new();
                let routes: DispatchRoutes = Arc::new(RwLock::new(HashMap::new()));
                let ctx: Arc<dyn PluginContext> = Arc::new(AdapterCtx {
                    name: Arc::clone(&shared_name),
                    bus: bus.clone(),
                    state: Arc::clone(&state),
                    block: Arc::clone(&block),
                    global: metrics.global(),
                    store: Arc::clone(metrics),
                    routes: Some(Arc::clone(&routes)),
                });
                let core = driver::DriverCore::spawn_state(
                    Arc::clone(&shared_name),
                    plugin,
                    ctx,
                    bus,
                    Arc::clone(&state),
                    groups.clone(),
                    routes,
                    handle.clone(),
                    Arc::clone(&block),
                    metrics.global(),
                    module.timer_kind,
                    module.cache_policy,
                );
                let drain = Arc::clone(&core);
                handle.add_wake(Box::new(move || {
                    while let Some(env) = mailbox.try_recv() {
                        driver::handle(&drain, env);
                    }
                }));
                Some(groups)
            }
            PluginInstance::App(plugin) => {
                let ctx: Arc<dyn PluginContext> = Arc::new(AdapterCtx {
                    name: Arc::clone(&shared_name),
                    bus: bus.clone(),
                    state: Arc::clone(&state),
                    block: Arc::clone(&block),
                    global: metrics.global(),
                    store: Arc::clone(metrics),
                    routes: None,
                });
                let core = app::AppCore::spawn_state(
                    Arc::clone(&shared_name),
                    plugin,
                    ctx,
                    bus,
                    Arc::clone(&state),
                    handle.clone(),
                    Arc::clone(&block),
                );
                let drain = Arc::clone(&core);
                handle.add_wake(Box::new(move || {
                    while let Some(env) = mailbox.try_recv() {
                        app::handle(&drain, env);
                    }
                }));
                None
            }
        };

        Ok(Arc::new(Adapter {
            name: shared_name,
            kind,
            plugin_name: module.name.to_string(),
            reactor: Mutex::new(reactor),
            state,
            groups,
        }))
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn run_state(&self) -> RunState {
        self.state.running()
    }

    pub fn link_state(&self) -> LinkState {
        self.state.link()
    }

    /// Shared group view; `None` for apps.
    pub fn groups(&self) -> Option<&GroupSet> {
        self.groups.as_ref()
    }

    pub fn state_entry(&self) -> NodeStateEntry {
        NodeStateEntry {
            node: self.name(),
            kind: self.kind,
            running: self.run_state(),
            link: self.link_state(),
        }
    }

    pub(crate) fn set_name(&self, new: &str) {
        *self.name.write() = new.to_string();
    }

    /// Close the reactor and join its thread. Called by the manager
    /// after `NODE_UNINIT` has been acknowledged.
    pub(crate) fn shutdown(&self) {
        self.reactor.lock().close();
    }
}

/// The callback table handed to plugins at `init`. Every operation is
/// lock-free with respect to the adapter core, so plugins may call in
/// from inside `group_timer` or any other plugin entry point.
struct AdapterCtx {
    name: Arc<RwLock<String>>,
    bus: Bus,
    state: Arc<StateCell>,
    block: Arc<MetricBlock>,
    global: Arc<MetricBlock>,
    store: Arc<MetricsStore>,
    routes: Option<DispatchRoutes>,
}

impl PluginContext for AdapterCtx {
    fn node_name(&self) -> String {
        self.name.read().clone()
    }

    fn link_state(&self) -> LinkState {
        self.state.link()
    }

    fn set_link_state(&self, state: LinkState) {
        self.state.set_link(state);
    }

    fn publish(&self, mut data: TransData) {
        let Some(routes) = &self.routes else {
            tracing::warn!("publish from an app plugin ignored");
            return;
        };
        let me = self.name.read().clone();
        data.driver = me.clone();
        driver::dispatch_snapshot(
            &self.bus,
            &me,
            routes,
            Arc::new(data),
            &self.block,
            &self.global,
        );
    }

    fn request(&self, driver: &str, body: MsgBody) -> Result<Context> {
        let env = Envelope::new(&self.name.read(), driver, body);
        let context = env.context;
        match self.bus.send(env) {
            Ok(()) => {
                self.block.add(names::SEND_MSGS_TOTAL, 1);
                Ok(context)
            }
            Err(e) => {
                self.block.add(names::SEND_MSG_ERRORS_TOTAL, 1);
                Err(e)
            }
        }
    }

    fn metric_add(&self, name: &'static str, delta: u64) {
        self.block.add(name, delta);
    }

    fn visit_metrics(&self, cb: &mut dyn FnMut(&MetricsView)) {
        self.store.visit(|view| cb(view));
    }
}
