// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # fieldmesh - industrial IoT gateway runtime fabric
//!
//! fieldmesh polls field devices through southbound driver plugins,
//! holds the acquired values in-process, and fans snapshots out to
//! northbound app plugins. Commands flow the other way: apps read and
//! write individual tags on a driver. Nodes, groups and tags are
//! configured at runtime, persisted, and restored at boot.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         Manager                               |
//! |  plugin registry | node registry | subscriptions | metrics   |
//! +------------------------------+-------------------------------+
//!                                | control envelopes
//!          +---------------------v---------------------+
//!          |                Message bus                 |
//!          |      name-addressed bounded mailboxes      |
//!          +------+--------------------------+----------+
//!                 |                          |
//!        +--------v--------+        +--------v--------+
//!        | Driver adapter  |        |  App adapter    |
//!        | reactor+mailbox |  ----> | reactor+mailbox |
//!        | groups + tags   |  data  | subscriptions   |
//!        | plugin (modbus) |        | plugin (mqtt)   |
//!        +--------+--------+        +--------+--------+
//!                 |                          |
//!            field device              external sink
//! ```
//!
//! One dedicated reactor thread per adapter multiplexes group poll
//! timers, I/O readiness and the mailbox; everything an adapter owns is
//! touched only from that thread. The manager runs its own control
//! reactor and correlates replies by envelope context.
//!
//! ## Quick start
//!
//! ```no_run
//! use fieldmesh::{Manager, MemStore, NodeKind, Tag, TagAttr, TagType};
//! use std::sync::Arc;
//!
//! fn main() -> fieldmesh::Result<()> {
//!     let manager = Manager::new(Arc::new(MemStore::new()))?;
//!     manager.register_builtin_plugins(&[]);
//!
//!     manager.add_node("plc1", NodeKind::Driver, "sim", None)?;
//!     manager.add_group("plc1", "fast", 100)?;
//!     manager.add_tags(
//!         "plc1",
//!         "fast",
//!         vec![Tag::new("speed", "1!400001", TagType::Int16, TagAttr::READ)],
//!     )?;
//!
//!     manager.add_node("cloud", NodeKind::App, "sink", None)?;
//!     manager.subscribe("cloud", "plc1", "fast", None)?;
//!     manager.start_node("plc1")?;
//!     manager.start_node("cloud")?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod bus;
pub mod config;
pub mod error;
pub mod group;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod persist;
pub mod plugin;
pub mod reactor;
pub mod sub;
pub mod tag;
pub mod time;

pub use adapter::Adapter;
pub use bus::{Bus, Context, Envelope, MsgBody, MsgKind};
pub use config::BootConfig;
pub use error::{ErrorCode, Result};
pub use group::{Group, GroupSet};
pub use manager::{DriverSpec, GroupSpec, Manager, NodeInfo};
pub use metrics::{MetricEntry, MetricKind, MetricsView};
pub use node::{LinkState, NodeKind, RunState};
pub use persist::{JsonStore, MemStore, Store};
pub use plugin::{
    AppPlugin, CachePolicy, DriverPlugin, Plugin, PluginContext, PluginModule, PluginRegistry,
    PollPlan,
};
pub use reactor::{Reactor, TimerKind};
pub use tag::{AddressOption, SharedTransData, Tag, TagAttr, TagSample, TagType, TagValue, TransData};
