// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol plugins: descriptors, interface traits and the registry.
//!
//! A plugin module is a registered table entry: a static descriptor plus a
//! constructor for instances. Driver plugins implement the southbound
//! device interface (validation, one poll cycle, writes); app plugins
//! consume snapshots and originate commands.
//!
//! Plugins never hold a back-pointer into their adapter. The only way a
//! plugin reaches the fabric is the [`PluginContext`] handed to `init`:
//! link-state reporting, snapshot publication, command origination and
//! metrics.

pub mod monitor;
pub mod sim;
pub mod sink;

use crate::bus::{Context, MsgBody};
use crate::error::{ErrorCode, Result};
use crate::metrics::MetricsView;
use crate::node::{LinkState, NodeKind};
use crate::reactor::TimerKind;
use crate::tag::{SharedTransData, Tag, TagValue, TransData};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// How `READ_GROUP` requests are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve the last poll snapshot; fall back to a fresh device read
    /// only when no snapshot exists yet.
    Snapshot,
    /// Always perform a fresh device read.
    Bypass,
}

/// The read plan a driver polls from: the group revision it was built
/// for, the poll interval, and the static/polled partition of the
/// readable tags.
#[derive(Debug, Clone)]
pub struct PollPlan {
    pub timestamp: u64,
    pub interval: Duration,
    pub static_tags: Vec<Tag>,
    pub polled: Vec<Tag>,
}

/// One write request after native-type conversion.
#[derive(Debug, Clone)]
pub struct TagWrite {
    pub tag: Tag,
    pub value: TagValue,
}

/// Callback table a plugin receives at `init`; its only channel back
/// into the fabric.
pub trait PluginContext: Send + Sync {
    /// Current node name (tracks renames).
    fn node_name(&self) -> String;

    fn link_state(&self) -> LinkState;

    fn set_link_state(&self, state: LinkState);

    /// Publish a spontaneous snapshot to the node's subscribers. Used by
    /// push-mode drivers; polled drivers return samples from
    /// `group_timer` instead.
    fn publish(&self, data: TransData);

    /// Originate a command envelope to a driver; the reply arrives at
    /// this node's mailbox and is matched by the returned context.
    fn request(&self, driver: &str, body: MsgBody) -> Result<Context>;

    /// Bump a node metric.
    fn metric_add(&self, name: &'static str, delta: u64);

    /// Run the metrics visitor (used by the monitor plugin).
    fn visit_metrics(&self, cb: &mut dyn FnMut(&MetricsView));
}

/// Lifecycle interface common to both plugin kinds.
pub trait Plugin: Send {
    /// First call after construction. `load` is true when the node is
    /// being restored from the store at boot.
    fn init(&mut self, ctx: Arc<dyn PluginContext>, load: bool) -> Result<()>;

    /// Last call before the instance is dropped.
    fn uninit(&mut self) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Apply an opaque JSON setting blob.
    fn setting(&mut self, setting: &str) -> Result<()>;
}

/// Southbound device interface.
pub trait DriverPlugin: Plugin {
    /// Check a single tag (address grammar, type support) before it is
    /// committed to a group.
    fn validate_tag(&self, tag: &Tag) -> Result<()>;

    /// Optional whole-set check after per-tag validation.
    fn tag_validator(&self, _tags: &[Tag]) -> Result<()> {
        Ok(())
    }

    /// The read plan of a group changed; rebuild internal state.
    fn group_sync(&mut self, _group: &str, _plan: &PollPlan) -> Result<()> {
        Ok(())
    }

    /// One poll cycle: read the plan's polled tags from the device.
    fn group_timer(&mut self, group: &str, plan: &PollPlan) -> Vec<crate::tag::TagSample>;

    /// Write one tag with a value already converted to its native type.
    fn write_tag(&mut self, group: &str, tag: &Tag, value: TagValue) -> ErrorCode;

    /// Batched write; the default loops over `write_tag`.
    fn write_tags(&mut self, group: &str, writes: &[TagWrite]) -> Vec<ErrorCode> {
        writes
            .iter()
            .map(|w| self.write_tag(group, &w.tag, w.value.clone()))
            .collect()
    }

    /// Notification hooks for committed tag-set changes.
    fn load_tags(&mut self, _group: &str, _tags: &[Tag]) {}
    fn add_tags(&mut self, _group: &str, _tags: &[Tag]) {}
    fn del_tags(&mut self, _group: &str, _names: &[String]) {}
}

/// Northbound consumer interface.
pub trait AppPlugin: Plugin {
    /// A snapshot arrived for one of the node's subscriptions.
    fn on_trans_data(&mut self, data: &SharedTransData) -> Result<()>;

    /// Subscription bookkeeping notifications.
    fn on_subscribed(&mut self, _driver: &str, _group: &str, _params: Option<&str>) {}
    fn on_unsubscribed(&mut self, _driver: &str, _group: &str) {}

    /// A subscribed driver was deleted.
    fn on_node_deleted(&mut self, _node: &str) {}

    /// A reply to a context originated through [`PluginContext::request`].
    fn on_response(&mut self, _context: Context, _body: &MsgBody) {}

    /// Periodic hook; returning `Some` installs a NONBLOCK timer at that
    /// interval while the node runs.
    fn timer_interval(&self) -> Option<Duration> {
        None
    }

    fn on_timer(&mut self) {}
}

/// A constructed plugin instance of either kind.
pub enum PluginInstance {
    Driver(Box<dyn DriverPlugin>),
    App(Box<dyn AppPlugin>),
}

impl PluginInstance {
    pub fn kind(&self) -> NodeKind {
        match self {
            PluginInstance::Driver(_) => NodeKind::Driver,
            PluginInstance::App(_) => NodeKind::App,
        }
    }
}

/// Static descriptor of a plugin module; the single thing a module
/// exports.
#[derive(Clone)]
pub struct PluginModule {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    /// JSON schema of the setting blob, informational.
    pub schema: &'static str,
    pub kind: NodeKind,
    /// At most one live instance process-wide, under `single_name`.
    pub single: bool,
    pub single_name: &'static str,
    /// Scheduling class of the node's group timers.
    pub timer_kind: TimerKind,
    pub cache_policy: CachePolicy,
    pub constructor: fn() -> PluginInstance,
}

impl std::fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModule")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("kind", &self.kind)
            .field("single", &self.single)
            .finish()
    }
}

/// The built-in module table; the boot configuration selects from it.
pub fn builtin_modules() -> Vec<PluginModule> {
    vec![sim::module(), sink::module(), monitor::module()]
}

struct RegEntry {
    module: Arc<PluginModule>,
    live: usize,
}

/// `plugin_name -> descriptor` with singleton and kind enforcement.
#[derive(Default)]
pub struct PluginRegistry {
    entries: DashMap<String, RegEntry>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// Register or replace a module.
    pub fn add(&self, module: PluginModule) {
        self.entries.insert(
            module.name.to_string(),
            RegEntry {
                module: Arc::new(module),
                live: 0,
            },
        );
    }

    /// Remove a module; refused while instances are live.
    pub fn del(&self, name: &str) -> Result<()> {
        let entry = self.entries.get(name).ok_or(ErrorCode::LibraryNotFound)?;
        if entry.live > 0 {
            return Err(ErrorCode::LibraryNotAllowCreateInstance);
        }
        drop(entry);
        self.entries.remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<PluginModule>> {
        self.entries
            .get(name)
            .map(|e| Arc::clone(&e.module))
            .ok_or(ErrorCode::LibraryNotFound)
    }

    pub fn list(&self) -> Vec<Arc<PluginModule>> {
        let mut modules: Vec<Arc<PluginModule>> =
            self.entries.iter().map(|e| Arc::clone(&e.module)).collect();
        modules.sort_by_key(|m| m.name);
        modules
    }

    pub fn live_count(&self, name: &str) -> usize {
        self.entries.get(name).map_or(0, |e| e.live)
    }

    /// Construct an instance for a node, enforcing kind match and the
    /// singleton constraint (one live instance, fixed node name).
    pub fn instantiate(&self, name: &str, kind: NodeKind, node_name: &str) -> Result<PluginInstance> {
        let mut entry = self.entries.get_mut(name).ok_or(ErrorCode::LibraryNotFound)?;
        if entry.module.kind != kind {
            return Err(ErrorCode::PluginTypeNotSupport);
        }
        if entry.module.single {
            if entry.live > 0 {
                return Err(ErrorCode::LibraryNotAllowCreateInstance);
            }
            if node_name != entry.module.single_name {
                return Err(ErrorCode::LibraryNotAllowCreateInstance);
            }
        }
        entry.live += 1;
        Ok((entry.module.constructor)())
    }

    /// Release one instance slot.
    pub fn release(&self, name: &str) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.live = entry.live.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_and_kind_enforcement() {
        let reg = PluginRegistry::new();
        reg.add(sim::module());
        assert!(reg.get("sim").is_ok());
        assert!(matches!(reg.get("ghost"), Err(ErrorCode::LibraryNotFound)));
        assert_eq!(
            reg.instantiate("sim", NodeKind::App, "n1").err(),
            Some(ErrorCode::PluginTypeNotSupport)
        );
        assert!(reg.instantiate("sim", NodeKind::Driver, "n1").is_ok());
        assert_eq!(reg.live_count("sim"), 1);
        reg.release("sim");
        assert_eq!(reg.live_count("sim"), 0);
    }

    #[test]
    fn test_singleton_constraint() {
        let reg = PluginRegistry::new();
        reg.add(monitor::module());
        // wrong name refused
        assert_eq!(
            reg.instantiate("monitor", NodeKind::App, "other").err(),
            Some(ErrorCode::LibraryNotAllowCreateInstance)
        );
        assert!(reg
            .instantiate("monitor", NodeKind::App, monitor::NODE_NAME)
            .is_ok());
        // second instance refused
        assert_eq!(
            reg.instantiate("monitor", NodeKind::App, monitor::NODE_NAME)
                .err(),
            Some(ErrorCode::LibraryNotAllowCreateInstance)
        );
        reg.release("monitor");
        assert!(reg
            .instantiate("monitor", NodeKind::App, monitor::NODE_NAME)
            .is_ok());
    }

    #[test]
    fn test_del_refused_while_live() {
        let reg = PluginRegistry::new();
        reg.add(sim::module());
        let _inst = reg.instantiate("sim", NodeKind::Driver, "d1").unwrap();
        assert_eq!(
            reg.del("sim"),
            Err(ErrorCode::LibraryNotAllowCreateInstance)
        );
        reg.release("sim");
        assert!(reg.del("sim").is_ok());
    }
}
