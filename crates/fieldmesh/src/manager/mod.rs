// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The control plane: plugin registry, node registry, subscription table
//! and the procedures that tie them together.
//!
//! The manager serializes every mutation under one lock; node lookups
//! read a lock-free map. It talks to adapters exclusively through the
//! bus: each control method sends a request envelope and blocks on a
//! reply matched by context, which the manager's own reactor thread
//! routes back from its mailbox.
//!
//! Complex procedures carried here: batched driver creation with
//! reverse-order rollback, node deletion with subscription cleanup and
//! `NODE_DELETED` broadcast, dual-notification subscribe (a subscription
//! is not recorded until both the app and the driver acknowledged), and
//! rename cascades across the registry, the subscription table, the
//! store and the affected peers.

use crate::adapter::Adapter;
use crate::bus::{Bus, Envelope, GroupTags, MsgBody, NodeStateEntry};
use crate::error::{ErrorCode, Result};
use crate::group::GROUP_MAX_PER_NODE;
use crate::metrics::{MetricsStore, MetricsView};
use crate::node::{LinkState, NodeKind, RunState};
use crate::persist::{GroupRecord, NodeRecord, Store, SubRecord};
use crate::plugin::{PluginModule, PluginRegistry};
use crate::reactor::{Reactor, TimerKind};
use crate::sub::{SubInfo, SubTable};
use crate::tag::{SharedTransData, Tag};
use crate::time;
use crossbeam::channel::{bounded, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The manager's own mailbox address; reserved, no node may take it.
pub const MANAGER_ADDR: &str = "manager";

/// How long a control request waits for its reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const TIMESTAMP_TICK: Duration = Duration::from_millis(10);

/// Administrative view of one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub kind: NodeKind,
    pub plugin: String,
    pub running: RunState,
    pub link: LinkState,
}

/// Administrative view of one group.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub interval_ms: u64,
    pub tag_count: usize,
    pub timestamp: u64,
}

/// One group inside a batched driver request.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    pub interval_ms: u64,
    pub tags: Vec<Tag>,
}

/// One driver inside an `ADD_DRIVERS` request.
#[derive(Debug, Clone)]
pub struct DriverSpec {
    pub name: String,
    pub plugin: String,
    pub setting: Option<String>,
    pub groups: Vec<GroupSpec>,
}

/// The gateway control plane.
pub struct Manager {
    bus: Bus,
    plugins: PluginRegistry,
    nodes: Arc<DashMap<String, Arc<Adapter>>>,
    lock: Mutex<()>,
    subs: SubTable,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsStore>,
    pending: Arc<DashMap<u64, Sender<Envelope>>>,
    reactor: Mutex<Option<Reactor>>,
    closed: AtomicBool,
}

impl Manager {
    /// Stand up the control plane: bind the manager mailbox, spawn the
    /// control reactor and schedule the global timestamp tick. Failure
    /// to bind the control mailbox is fatal to the caller.
    pub fn new(store: Arc<dyn Store>) -> Result<Manager> {
        time::init();
        let bus = Bus::new();
        let reactor = Reactor::spawn(MANAGER_ADDR).map_err(|e| {
            tracing::error!("manager: control reactor spawn failed: {}", e);
            ErrorCode::EInternal
        })?;
        let mailbox = bus.bind(MANAGER_ADDR, reactor.handle().notifier())?;

        let pending: Arc<DashMap<u64, Sender<Envelope>>> = Arc::new(DashMap::new());
        let nodes: Arc<DashMap<String, Arc<Adapter>>> = Arc::new(DashMap::new());
        let route = Arc::clone(&pending);
        let state_view = Arc::clone(&nodes);
        let reply_bus = bus.clone();
        reactor.handle().add_wake(Box::new(move || {
            while let Some(env) = mailbox.try_recv() {
                if let Some((_, tx)) = route.remove(&env.context) {
                    let _ = tx.send(env);
                    continue;
                }
                // Nodes may query the registry's state with an empty
                // NODES_STATE request; everything else unmatched is
                // dropped.
                if env.kind() == crate::bus::MsgKind::NodesState {
                    let mut states: Vec<NodeStateEntry> =
                        state_view.iter().map(|a| a.state_entry()).collect();
                    states.sort_by(|a, b| a.node.cmp(&b.node));
                    let _ = reply_bus.send(env.reply(MsgBody::NodesState { states }));
                    continue;
                }
                tracing::debug!(
                    "manager: unmatched {:?} from {} (context {})",
                    env.kind(),
                    env.sender,
                    env.context
                );
            }
        }));
        reactor.handle().add_timer(
            TIMESTAMP_TICK,
            TimerKind::NonBlock,
            Box::new(time::tick),
        );

        Ok(Manager {
            bus,
            plugins: PluginRegistry::new(),
            nodes,
            lock: Mutex::new(()),
            subs: SubTable::new(),
            store,
            metrics: Arc::new(MetricsStore::new()),
            pending,
            reactor: Mutex::new(Some(reactor)),
            closed: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Request plumbing
    // ------------------------------------------------------------------

    fn request(&self, to: &str, body: MsgBody) -> Result<Envelope> {
        let env = Envelope::new(MANAGER_ADDR, to, body);
        let context = env.context;
        let (tx, rx) = bounded(1);
        self.pending.insert(context, tx);
        if let Err(e) = self.bus.send(env) {
            self.pending.remove(&context);
            return Err(e);
        }
        match rx.recv_timeout(REQUEST_TIMEOUT) {
            Ok(env) => Ok(env),
            Err(_) => {
                self.pending.remove(&context);
                tracing::warn!("manager: request to {} timed out", to);
                Err(ErrorCode::EInternal)
            }
        }
    }

    fn request_code(&self, to: &str, body: MsgBody) -> Result<()> {
        let resp = self.request(to, body)?;
        match resp.body {
            MsgBody::RespError { error } => error.into_result(),
            MsgBody::UpdateDriverGroupResp { error, .. } => error.into_result(),
            _ => Ok(()),
        }
    }

    /// Fire-and-forget notification.
    fn notify(&self, to: &str, body: MsgBody) {
        if let Err(e) = self.bus.send(Envelope::new(MANAGER_ADDR, to, body)) {
            tracing::debug!("manager: notification to {} dropped: {}", to, e);
        }
    }

    // ------------------------------------------------------------------
    // Plugin registry
    // ------------------------------------------------------------------

    pub fn register_plugin(&self, module: PluginModule) {
        tracing::info!("plugin {} ({:?}) registered", module.name, module.kind);
        self.plugins.add(module);
    }

    /// Register the built-in modules selected by name; an empty filter
    /// selects all of them.
    pub fn register_builtin_plugins(&self, filter: &[String]) {
        for module in crate::plugin::builtin_modules() {
            if filter.is_empty() || filter.iter().any(|n| n == module.name) {
                self.register_plugin(module);
            }
        }
    }

    pub fn unregister_plugin(&self, name: &str) -> Result<()> {
        self.plugins.del(name)
    }

    pub fn plugin(&self, name: &str) -> Result<Arc<PluginModule>> {
        self.plugins.get(name)
    }

    pub fn plugins(&self) -> Vec<Arc<PluginModule>> {
        self.plugins.list()
    }

    // ------------------------------------------------------------------
    // Node registry
    // ------------------------------------------------------------------

    pub fn add_node(
        &self,
        name: &str,
        kind: NodeKind,
        plugin: &str,
        setting: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        self.add_node_locked(name, kind, plugin, setting, false, true)
    }

    fn add_node_locked(
        &self,
        name: &str,
        kind: NodeKind,
        plugin: &str,
        setting: Option<&str>,
        load: bool,
        persist: bool,
    ) -> Result<()> {
        if name.is_empty() || name == MANAGER_ADDR || self.nodes.contains_key(name) {
            return Err(ErrorCode::NodeExist);
        }
        let module = self.plugins.get(plugin)?;
        if module.kind != kind {
            return Err(ErrorCode::PluginTypeNotSupport);
        }
        let adapter = Adapter::create(name, &module, self.bus.clone(), &self.plugins, &self.metrics)?;

        if let Err(e) = self.request_code(name, MsgBody::NodeInit { load }) {
            tracing::error!("node {}: init failed: {}", name, e);
            self.teardown_adapter(&adapter);
            return Err(e);
        }
        if let Some(s) = setting {
            if let Err(e) = self.request_code(
                name,
                MsgBody::SetNodeSetting {
                    setting: s.to_string(),
                },
            ) {
                tracing::error!("node {}: initial setting rejected: {}", name, e);
                let _ = self.request_code(name, MsgBody::NodeUninit);
                self.teardown_adapter(&adapter);
                return Err(e);
            }
        }
        self.nodes.insert(name.to_string(), adapter);
        tracing::info!("node {} created (plugin {}, {:?})", name, plugin, kind);
        if persist {
            self.persist_node(name);
        }
        Ok(())
    }

    /// Release everything a half-created adapter holds.
    fn teardown_adapter(&self, adapter: &Arc<Adapter>) {
        let name = adapter.name();
        adapter.shutdown();
        self.bus.unbind(&name);
        self.plugins.release(adapter.plugin_name());
        self.metrics.del_node(&name);
    }

    pub fn del_node(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock();
        self.del_node_locked(name)
    }

    fn del_node_locked(&self, name: &str) -> Result<()> {
        let adapter = self
            .nodes
            .get(name)
            .map(|a| Arc::clone(a.value()))
            .ok_or(ErrorCode::NodeNotExist)?;
        if let Ok(module) = self.plugins.get(adapter.plugin_name()) {
            if module.single {
                return Err(ErrorCode::NodeNotAllowDelete);
            }
        }

        match adapter.kind() {
            NodeKind::App => {
                // Detach from every driver, then drop the subscriptions.
                for sub in self.subs.subs_of_app(name) {
                    let _ = self.request_code(
                        &sub.driver,
                        MsgBody::UnsubscribeGroup {
                            app: name.to_string(),
                            driver: sub.driver.clone(),
                            group: sub.group.clone(),
                        },
                    );
                }
                for sub in self.subs.unsub_all(name) {
                    let _ = self
                        .store
                        .delete_subscription(&sub.app, &sub.driver, &sub.group);
                }
            }
            NodeKind::Driver => {
                // Every former subscriber learns exactly once.
                for app in self.subs.apps_of_driver(name) {
                    self.notify(
                        &app,
                        MsgBody::NodeDeleted {
                            node: name.to_string(),
                        },
                    );
                }
                for sub in self.subs.del_driver(name) {
                    let _ = self
                        .store
                        .delete_subscription(&sub.app, &sub.driver, &sub.group);
                }
            }
        }

        let _ = self.request_code(name, MsgBody::NodeUninit);
        adapter.shutdown();
        self.bus.unbind(name);
        self.plugins.release(adapter.plugin_name());
        self.metrics.del_node(name);
        self.nodes.remove(name);
        if let Err(e) = self.store.delete_node(name) {
            tracing::warn!("node {}: persist delete failed: {}", name, e);
        }
        tracing::info!("node {} deleted", name);
        Ok(())
    }

    pub fn rename_node(&self, old: &str, new: &str) -> Result<()> {
        let _guard = self.lock.lock();
        if old == new {
            return Ok(());
        }
        if new.is_empty() || new == MANAGER_ADDR || self.nodes.contains_key(new) {
            return Err(ErrorCode::NodeExist);
        }
        let adapter = self
            .nodes
            .get(old)
            .map(|a| Arc::clone(a.value()))
            .ok_or(ErrorCode::NodeNotExist)?;
        if let Ok(module) = self.plugins.get(adapter.plugin_name()) {
            if module.single {
                return Err(ErrorCode::NodeNotAllowDelete);
            }
        }

        self.bus.rebind(old, new)?;
        adapter.set_name(new);
        self.nodes.remove(old);
        self.nodes.insert(new.to_string(), adapter.clone());
        self.metrics.rename_node(old, new);

        match adapter.kind() {
            NodeKind::Driver => {
                let apps = self.subs.apps_of_driver(old);
                self.subs.update_driver_name(old, new);
                for app in apps {
                    self.notify(
                        &app,
                        MsgBody::NodeRenamed {
                            old: old.to_string(),
                            new: new.to_string(),
                        },
                    );
                }
            }
            NodeKind::App => {
                self.subs.update_app_name(old, new);
                let mut drivers: Vec<String> = self
                    .subs
                    .subs_of_app(new)
                    .into_iter()
                    .map(|s| s.driver)
                    .collect();
                drivers.sort();
                drivers.dedup();
                for driver in drivers {
                    self.notify(
                        &driver,
                        MsgBody::NodeRenamed {
                            old: old.to_string(),
                            new: new.to_string(),
                        },
                    );
                }
            }
        }
        if let Err(e) = self.store.rename_node(old, new) {
            tracing::warn!("node {}: persist rename failed: {}", new, e);
        }
        tracing::info!("node {} renamed to {}", old, new);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Result<NodeInfo> {
        self.nodes
            .get(name)
            .map(|a| NodeInfo {
                name: a.name(),
                kind: a.kind(),
                plugin: a.plugin_name().to_string(),
                running: a.run_state(),
                link: a.link_state(),
            })
            .ok_or(ErrorCode::NodeNotExist)
    }

    pub fn nodes(&self, kind: Option<NodeKind>) -> Vec<NodeInfo> {
        let mut out: Vec<NodeInfo> = self
            .nodes
            .iter()
            .filter(|a| kind.map_or(true, |k| a.kind() == k))
            .map(|a| NodeInfo {
                name: a.name(),
                kind: a.kind(),
                plugin: a.plugin_name().to_string(),
                running: a.run_state(),
                link: a.link_state(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn nodes_state(&self) -> Vec<NodeStateEntry> {
        let mut out: Vec<NodeStateEntry> =
            self.nodes.iter().map(|a| a.state_entry()).collect();
        out.sort_by(|a, b| a.node.cmp(&b.node));
        out
    }

    // ------------------------------------------------------------------
    // Node control
    // ------------------------------------------------------------------

    pub fn start_node(&self, name: &str) -> Result<()> {
        self.ensure_node(name)?;
        self.request_code(name, MsgBody::NodeStart)?;
        self.persist_node(name);
        Ok(())
    }

    pub fn stop_node(&self, name: &str) -> Result<()> {
        self.ensure_node(name)?;
        self.request_code(name, MsgBody::NodeStop)?;
        self.persist_node(name);
        Ok(())
    }

    pub fn node_setting(&self, name: &str) -> Result<Option<String>> {
        self.ensure_node(name)?;
        let resp = self.request(name, MsgBody::GetNodeSetting)?;
        match resp.body {
            MsgBody::GetNodeSettingResp { setting } => Ok(setting),
            _ => Err(ErrorCode::EInternal),
        }
    }

    pub fn set_node_setting(&self, name: &str, setting: &str) -> Result<()> {
        self.ensure_node(name)?;
        self.request_code(
            name,
            MsgBody::SetNodeSetting {
                setting: setting.to_string(),
            },
        )?;
        self.persist_node(name);
        Ok(())
    }

    fn ensure_node(&self, name: &str) -> Result<Arc<Adapter>> {
        self.nodes
            .get(name)
            .map(|a| Arc::clone(a.value()))
            .ok_or(ErrorCode::NodeNotExist)
    }

    fn ensure_driver(&self, name: &str) -> Result<Arc<Adapter>> {
        let adapter = self.ensure_node(name)?;
        if adapter.kind() != NodeKind::Driver {
            return Err(ErrorCode::NodeNotExist);
        }
        Ok(adapter)
    }

    fn persist_node(&self, name: &str) {
        let Ok(adapter) = self.ensure_node(name) else {
            return;
        };
        let setting = self.node_setting(name).unwrap_or(None);
        let rec = NodeRecord {
            name: adapter.name(),
            kind: adapter.kind(),
            plugin: adapter.plugin_name().to_string(),
            setting,
            state: adapter.run_state(),
        };
        if let Err(e) = self.store.save_node(&rec) {
            tracing::warn!("node {}: persist failed: {}", name, e);
        }
    }

    // ------------------------------------------------------------------
    // Groups and tags
    // ------------------------------------------------------------------

    pub fn add_group(&self, driver: &str, group: &str, interval_ms: u64) -> Result<()> {
        let _guard = self.lock.lock();
        let adapter = self.ensure_driver(driver)?;
        if let Some(groups) = adapter.groups() {
            if groups.len() >= GROUP_MAX_PER_NODE {
                return Err(ErrorCode::GroupMaxGroups);
            }
        }
        self.request_code(
            driver,
            MsgBody::AddGroup {
                group: group.to_string(),
                interval_ms,
            },
        )?;
        let _ = self.store.save_group(&GroupRecord {
            driver: driver.to_string(),
            name: group.to_string(),
            interval_ms,
        });
        Ok(())
    }

    pub fn del_group(&self, driver: &str, group: &str) -> Result<()> {
        let _guard = self.lock.lock();
        self.ensure_driver(driver)?;
        self.request_code(
            driver,
            MsgBody::DelGroup {
                group: group.to_string(),
            },
        )?;
        for sub in self.subs.del_group(driver, group) {
            self.notify(
                &sub.app,
                MsgBody::UnsubscribeGroup {
                    app: sub.app.clone(),
                    driver: driver.to_string(),
                    group: group.to_string(),
                },
            );
            let _ = self
                .store
                .delete_subscription(&sub.app, &sub.driver, &sub.group);
        }
        let _ = self.store.delete_group(driver, group);
        Ok(())
    }

    pub fn update_group(
        &self,
        driver: &str,
        group: &str,
        new_name: Option<&str>,
        interval_ms: Option<u64>,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        self.ensure_driver(driver)?;
        self.request_code(
            driver,
            MsgBody::UpdateGroup {
                group: group.to_string(),
                new_name: new_name.map(str::to_string),
                interval_ms,
            },
        )?;
        let mut current = group.to_string();
        if let Some(new) = new_name {
            if new != group {
                let entries = self.subs.del_group(driver, group);
                for sub in &entries {
                    self.subs.sub(driver, &sub.app, new, sub.params.as_deref());
                    // Keep the app's local view aligned with the rename.
                    self.notify(
                        &sub.app,
                        MsgBody::UnsubscribeGroup {
                            app: sub.app.clone(),
                            driver: driver.to_string(),
                            group: group.to_string(),
                        },
                    );
                    self.notify(
                        &sub.app,
                        MsgBody::SubscribeGroup {
                            app: sub.app.clone(),
                            driver: driver.to_string(),
                            group: new.to_string(),
                            params: sub.params.clone(),
                        },
                    );
                }
                let _ = self.store.rename_group(driver, group, new);
                current = new.to_string();
            }
        }
        if let Some(ms) = interval_ms {
            let _ = self.store.save_group(&GroupRecord {
                driver: driver.to_string(),
                name: current,
                interval_ms: ms,
            });
        }
        Ok(())
    }

    pub fn groups(&self, driver: &str) -> Result<Vec<GroupInfo>> {
        let adapter = self.ensure_driver(driver)?;
        let groups = adapter.groups().ok_or(ErrorCode::EInternal)?;
        let mut out = Vec::new();
        for name in groups.names() {
            if let Some(g) = groups.get(&name) {
                out.push(GroupInfo {
                    name: g.name(),
                    interval_ms: g.interval().as_millis() as u64,
                    tag_count: g.tag_count(),
                    timestamp: g.timestamp(),
                });
            }
        }
        Ok(out)
    }

    pub fn add_tags(&self, driver: &str, group: &str, tags: Vec<Tag>) -> Result<()> {
        let _guard = self.lock.lock();
        self.ensure_driver(driver)?;
        self.request_code(
            driver,
            MsgBody::AddTags {
                group: group.to_string(),
                tags: tags.clone(),
            },
        )?;
        for tag in &tags {
            let _ = self.store.save_tag(driver, group, tag);
        }
        Ok(())
    }

    pub fn update_tags(&self, driver: &str, group: &str, tags: Vec<Tag>) -> Result<()> {
        let _guard = self.lock.lock();
        self.ensure_driver(driver)?;
        self.request_code(
            driver,
            MsgBody::UpdateTags {
                group: group.to_string(),
                tags: tags.clone(),
            },
        )?;
        for tag in &tags {
            let _ = self.store.save_tag(driver, group, tag);
        }
        Ok(())
    }

    pub fn del_tags(&self, driver: &str, group: &str, names: Vec<String>) -> Result<()> {
        let _guard = self.lock.lock();
        self.ensure_driver(driver)?;
        self.request_code(
            driver,
            MsgBody::DelTags {
                group: group.to_string(),
                names: names.clone(),
            },
        )?;
        for name in &names {
            let _ = self.store.delete_tag(driver, group, name);
        }
        Ok(())
    }

    pub fn tags(&self, driver: &str, group: &str) -> Result<Vec<Tag>> {
        let adapter = self.ensure_driver(driver)?;
        let groups = adapter.groups().ok_or(ErrorCode::EInternal)?;
        let g = groups.get(group).ok_or(ErrorCode::GroupNotExist)?;
        Ok(g.list_tags())
    }

    pub fn query_tags(
        &self,
        driver: &str,
        group: &str,
        name_substr: Option<&str>,
        desc_substr: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let adapter = self.ensure_driver(driver)?;
        let groups = adapter.groups().ok_or(ErrorCode::EInternal)?;
        let g = groups.get(group).ok_or(ErrorCode::GroupNotExist)?;
        Ok(g.query(name_substr, desc_substr))
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn subscribe(
        &self,
        app: &str,
        driver: &str,
        group: &str,
        params: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        self.subscribe_locked(app, driver, group, params, true)
    }

    fn subscribe_locked(
        &self,
        app: &str,
        driver: &str,
        group: &str,
        params: Option<&str>,
        persist: bool,
    ) -> Result<()> {
        let app_adapter = self.ensure_node(app)?;
        if app_adapter.kind() != NodeKind::App {
            return Err(ErrorCode::NodeNotAllowSubscribe);
        }
        let drv_adapter = self.ensure_node(driver)?;
        if drv_adapter.kind() != NodeKind::Driver {
            return Err(ErrorCode::NodeNotAllowSubscribe);
        }
        let groups = drv_adapter.groups().ok_or(ErrorCode::GroupNotExist)?;
        if !groups.contains(group) {
            return Err(ErrorCode::GroupNotExist);
        }

        let mk_body = |update: bool| {
            if update {
                MsgBody::UpdateSubscribeGroup {
                    app: app.to_string(),
                    driver: driver.to_string(),
                    group: group.to_string(),
                    params: params.map(str::to_string),
                }
            } else {
                MsgBody::SubscribeGroup {
                    app: app.to_string(),
                    driver: driver.to_string(),
                    group: group.to_string(),
                    params: params.map(str::to_string),
                }
            }
        };

        let update = self.subs.find(app, driver, group).is_some();
        // Both endpoints must acknowledge before the subscription is
        // considered active.
        self.request_code(app, mk_body(update))?;
        if let Err(e) = self.request_code(driver, mk_body(update)) {
            let _ = self.request_code(
                app,
                MsgBody::UnsubscribeGroup {
                    app: app.to_string(),
                    driver: driver.to_string(),
                    group: group.to_string(),
                },
            );
            return Err(e);
        }
        self.subs.sub(driver, app, group, params);
        if persist {
            let _ = self.store.save_subscription(&SubRecord {
                app: app.to_string(),
                driver: driver.to_string(),
                group: group.to_string(),
                params: params.map(str::to_string),
            });
        }
        Ok(())
    }

    pub fn unsubscribe(&self, app: &str, driver: &str, group: &str) -> Result<()> {
        let _guard = self.lock.lock();
        if self.subs.find(app, driver, group).is_none() {
            // Unsubscribing a missing triple is a successful no-op.
            return Ok(());
        }
        let _ = self.request_code(
            driver,
            MsgBody::UnsubscribeGroup {
                app: app.to_string(),
                driver: driver.to_string(),
                group: group.to_string(),
            },
        );
        let _ = self.request_code(
            app,
            MsgBody::UnsubscribeGroup {
                app: app.to_string(),
                driver: driver.to_string(),
                group: group.to_string(),
            },
        );
        self.subs.unsub(driver, app, group);
        let _ = self.store.delete_subscription(app, driver, group);
        Ok(())
    }

    /// Subscriptions held by one app ("list sub-groups").
    pub fn subscriptions(&self, app: &str) -> Result<Vec<SubInfo>> {
        self.ensure_node(app)?;
        Ok(self.subs.subs_of_app(app))
    }

    pub fn subscribers(&self, driver: &str) -> Vec<SubInfo> {
        self.subs.find_by_driver(driver)
    }

    // ------------------------------------------------------------------
    // Batched driver creation
    // ------------------------------------------------------------------

    /// Create several drivers with their groups and tags in one shot.
    /// Preflights every entry first; on any failure the drivers already
    /// created are torn down again in reverse order.
    pub fn add_drivers(&self, specs: &[DriverSpec]) -> Result<()> {
        let _guard = self.lock.lock();
        for spec in specs {
            let module = self.plugins.get(&spec.plugin)?;
            if module.kind != NodeKind::Driver {
                return Err(ErrorCode::PluginTypeNotSupport);
            }
            if module.single
                && (spec.name != module.single_name || self.plugins.live_count(&spec.plugin) > 0)
            {
                return Err(ErrorCode::LibraryNotAllowCreateInstance);
            }
            if spec.groups.len() > GROUP_MAX_PER_NODE {
                return Err(ErrorCode::GroupMaxGroups);
            }
        }

        let mut added: Vec<String> = Vec::new();
        for spec in specs {
            let result = (|| -> Result<()> {
                if self.nodes.contains_key(&spec.name) {
                    self.del_node_locked(&spec.name)?;
                }
                self.add_node_locked(
                    &spec.name,
                    NodeKind::Driver,
                    &spec.plugin,
                    spec.setting.as_deref(),
                    false,
                    true,
                )?;
                let gtags: Vec<GroupTags> = spec
                    .groups
                    .iter()
                    .map(|g| GroupTags {
                        group: g.name.clone(),
                        interval_ms: g.interval_ms,
                        tags: g.tags.clone(),
                    })
                    .collect();
                if !gtags.is_empty() {
                    self.request_code(&spec.name, MsgBody::AddGtags { groups: gtags })?;
                }
                for g in &spec.groups {
                    let _ = self.store.save_group(&GroupRecord {
                        driver: spec.name.clone(),
                        name: g.name.clone(),
                        interval_ms: g.interval_ms,
                    });
                    for tag in &g.tags {
                        let _ = self.store.save_tag(&spec.name, &g.name, tag);
                    }
                }
                Ok(())
            })();
            match result {
                Ok(()) => added.push(spec.name.clone()),
                Err(e) => {
                    tracing::error!("add_drivers: {} failed: {}; rolling back", spec.name, e);
                    if self.nodes.contains_key(&spec.name) {
                        let _ = self.del_node_locked(&spec.name);
                    }
                    for name in added.iter().rev() {
                        let _ = self.del_node_locked(name);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data plane entry points (REST-facing)
    // ------------------------------------------------------------------

    pub fn read_group(&self, driver: &str, group: &str) -> Result<SharedTransData> {
        self.ensure_driver(driver)?;
        let resp = self.request(
            driver,
            MsgBody::ReadGroup {
                group: group.to_string(),
            },
        )?;
        match resp.body {
            MsgBody::ReadGroupResp { data, error, .. } => {
                error.into_result()?;
                data.ok_or(ErrorCode::EInternal)
            }
            _ => Err(ErrorCode::EInternal),
        }
    }

    pub fn write_tag(
        &self,
        driver: &str,
        group: &str,
        tag: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.ensure_driver(driver)?;
        self.request_code(
            driver,
            MsgBody::WriteTag {
                group: group.to_string(),
                tag: tag.to_string(),
                value,
            },
        )
    }

    pub fn write_tags(
        &self,
        driver: &str,
        group: &str,
        writes: Vec<(String, serde_json::Value)>,
    ) -> Result<()> {
        self.ensure_driver(driver)?;
        self.request_code(
            driver,
            MsgBody::WriteTags {
                group: group.to_string(),
                writes,
            },
        )
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    pub fn visit_metrics<F: FnOnce(&MetricsView)>(&self, cb: F) {
        self.metrics.visit(cb);
    }

    // ------------------------------------------------------------------
    // Boot restore and shutdown
    // ------------------------------------------------------------------

    /// Restore nodes, groups, tags and subscriptions from the store and
    /// start the nodes that were running when the state was saved.
    pub fn load(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let nodes = self.store.load_nodes()?;
        for rec in &nodes {
            if let Err(e) = self.add_node_locked(
                &rec.name,
                rec.kind,
                &rec.plugin,
                rec.setting.as_deref(),
                true,
                false,
            ) {
                tracing::warn!("restore: node {} skipped: {}", rec.name, e);
                continue;
            }
            if rec.kind == NodeKind::Driver {
                let groups = self.store.load_groups(&rec.name)?;
                let mut gtags = Vec::new();
                for g in groups {
                    let tags = self.store.load_tags(&rec.name, &g.name)?;
                    gtags.push(GroupTags {
                        group: g.name,
                        interval_ms: g.interval_ms,
                        tags,
                    });
                }
                if !gtags.is_empty() {
                    if let Err(e) =
                        self.request_code(&rec.name, MsgBody::AddGtags { groups: gtags })
                    {
                        tracing::warn!("restore: groups of {} skipped: {}", rec.name, e);
                    }
                }
            }
        }
        for sub in self.store.load_subscriptions()? {
            if let Err(e) =
                self.subscribe_locked(&sub.app, &sub.driver, &sub.group, sub.params.as_deref(), false)
            {
                tracing::warn!(
                    "restore: subscription {}/{}/{} skipped: {}",
                    sub.app,
                    sub.driver,
                    sub.group,
                    e
                );
            }
        }
        for rec in &nodes {
            if rec.state == RunState::Running && self.nodes.contains_key(&rec.name) {
                if let Err(e) = self.request_code(&rec.name, MsgBody::NodeStart) {
                    tracing::warn!("restore: start of {} failed: {}", rec.name, e);
                }
            }
        }
        Ok(())
    }

    /// Start every node named in the autostart set.
    pub fn autostart(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.start_node(name) {
                tracing::warn!("autostart: {} failed: {}", name, e);
            }
        }
    }

    /// Quiesce all adapters and the control reactor. State stays in the
    /// store; nothing is deleted.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let names: Vec<String> = self.nodes.iter().map(|a| a.name()).collect();
        for name in names {
            let _ = self.request_code(&name, MsgBody::NodeUninit);
            if let Some(adapter) = self.nodes.get(&name) {
                adapter.shutdown();
            }
            self.bus.unbind(&name);
        }
        self.nodes.clear();
        if let Some(mut reactor) = self.reactor.lock().take() {
            reactor.close();
        }
        self.bus.unbind(MANAGER_ADDR);
        tracing::info!("manager shut down");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
