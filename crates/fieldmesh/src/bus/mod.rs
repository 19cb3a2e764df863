// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed message bus between adapters.
//!
//! Every adapter binds one mailbox under its node name; envelopes carry a
//! tagged-union body whose discriminant is the message kind. Sends are
//! non-blocking: ownership of the envelope transfers into the receiver's
//! bounded queue, and a full or missing mailbox fails the send without
//! ever suspending the caller. Snapshot payloads travel as `Arc` handles,
//! so fanning one poll result out to N subscribers never copies device
//! data.
//!
//! Envelopes from one sender to one receiver are delivered in send order;
//! there is no ordering across senders.

use crate::error::{ErrorCode, Result};
use crate::node::{LinkState, NodeKind, RunState};
use crate::tag::{SharedTransData, Tag};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::reactor::ReactorNotifier;

/// Bounded depth of every mailbox.
pub const MAILBOX_CAPACITY: usize = 1024;

/// Correlates a request with its reply across the bus.
pub type Context = u64;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh correlation context.
pub fn next_context() -> Context {
    NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)
}

/// Tags grouped under a named group, as carried by `ADD_GTAGS`.
#[derive(Debug, Clone)]
pub struct GroupTags {
    pub group: String,
    pub interval_ms: u64,
    pub tags: Vec<Tag>,
}

/// One node's state snapshot inside a `NODES_STATE` report.
#[derive(Debug, Clone)]
pub struct NodeStateEntry {
    pub node: String,
    pub kind: NodeKind,
    pub running: RunState,
    pub link: LinkState,
}

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    NodeInit,
    NodeUninit,
    NodeStart,
    NodeStop,
    GetNodeSetting,
    GetNodeSettingResp,
    SetNodeSetting,
    NodeRenamed,
    NodeDeleted,
    AddGroup,
    DelGroup,
    UpdateGroup,
    UpdateDriverGroupResp,
    AddTags,
    UpdateTags,
    DelTags,
    AddGtags,
    SubscribeGroup,
    UpdateSubscribeGroup,
    UnsubscribeGroup,
    ReadGroup,
    ReadGroupResp,
    WriteTag,
    WriteTags,
    TransData,
    RespError,
    NodesState,
}

impl MsgKind {
    /// Reply kind paired with a request kind; part of the design
    /// contract so both ends agree on how an exchange terminates.
    pub fn response_kind(self) -> Option<MsgKind> {
        match self {
            MsgKind::NodeInit
            | MsgKind::NodeUninit
            | MsgKind::NodeStart
            | MsgKind::NodeStop
            | MsgKind::SetNodeSetting
            | MsgKind::AddGroup
            | MsgKind::DelGroup
            | MsgKind::AddTags
            | MsgKind::UpdateTags
            | MsgKind::DelTags
            | MsgKind::AddGtags
            | MsgKind::SubscribeGroup
            | MsgKind::UpdateSubscribeGroup
            | MsgKind::UnsubscribeGroup
            | MsgKind::WriteTag
            | MsgKind::WriteTags => Some(MsgKind::RespError),
            MsgKind::UpdateGroup => Some(MsgKind::UpdateDriverGroupResp),
            MsgKind::GetNodeSetting => Some(MsgKind::GetNodeSettingResp),
            MsgKind::ReadGroup => Some(MsgKind::ReadGroupResp),
            _ => None,
        }
    }
}

/// Typed envelope body; the variant is the message kind.
#[derive(Debug, Clone)]
pub enum MsgBody {
    NodeInit { load: bool },
    NodeUninit,
    NodeStart,
    NodeStop,
    GetNodeSetting,
    GetNodeSettingResp { setting: Option<String> },
    SetNodeSetting { setting: String },
    NodeRenamed { old: String, new: String },
    NodeDeleted { node: String },

    AddGroup { group: String, interval_ms: u64 },
    DelGroup { group: String },
    UpdateGroup {
        group: String,
        new_name: Option<String>,
        interval_ms: Option<u64>,
    },
    UpdateDriverGroupResp { group: String, error: ErrorCode },

    AddTags { group: String, tags: Vec<Tag> },
    UpdateTags { group: String, tags: Vec<Tag> },
    DelTags { group: String, names: Vec<String> },
    AddGtags { groups: Vec<GroupTags> },

    SubscribeGroup {
        app: String,
        driver: String,
        group: String,
        params: Option<String>,
    },
    UpdateSubscribeGroup {
        app: String,
        driver: String,
        group: String,
        params: Option<String>,
    },
    UnsubscribeGroup {
        app: String,
        driver: String,
        group: String,
    },

    ReadGroup { group: String },
    ReadGroupResp {
        group: String,
        data: Option<SharedTransData>,
        error: ErrorCode,
    },
    WriteTag {
        group: String,
        tag: String,
        value: serde_json::Value,
    },
    WriteTags {
        group: String,
        writes: Vec<(String, serde_json::Value)>,
    },
    TransData { data: SharedTransData },

    RespError { error: ErrorCode },
    NodesState { states: Vec<NodeStateEntry> },
}

impl MsgBody {
    pub fn kind(&self) -> MsgKind {
        match self {
            MsgBody::NodeInit { .. } => MsgKind::NodeInit,
            MsgBody::NodeUninit => MsgKind::NodeUninit,
            MsgBody::NodeStart => MsgKind::NodeStart,
            MsgBody::NodeStop => MsgKind::NodeStop,
            MsgBody::GetNodeSetting => MsgKind::GetNodeSetting,
            MsgBody::GetNodeSettingResp { .. } => MsgKind::GetNodeSettingResp,
            MsgBody::SetNodeSetting { .. } => MsgKind::SetNodeSetting,
            MsgBody::NodeRenamed { .. } => MsgKind::NodeRenamed,
            MsgBody::NodeDeleted { .. } => MsgKind::NodeDeleted,
            MsgBody::AddGroup { .. } => MsgKind::AddGroup,
            MsgBody::DelGroup { .. } => MsgKind::DelGroup,
            MsgBody::UpdateGroup { .. } => MsgKind::UpdateGroup,
            MsgBody::UpdateDriverGroupResp { .. } => MsgKind::UpdateDriverGroupResp,
            MsgBody::AddTags { .. } => MsgKind::AddTags,
            MsgBody::UpdateTags { .. } => MsgKind::UpdateTags,
            MsgBody::DelTags { .. } => MsgKind::DelTags,
            MsgBody::AddGtags { .. } => MsgKind::AddGtags,
            MsgBody::SubscribeGroup { .. } => MsgKind::SubscribeGroup,
            MsgBody::UpdateSubscribeGroup { .. } => MsgKind::UpdateSubscribeGroup,
            MsgBody::UnsubscribeGroup { .. } => MsgKind::UnsubscribeGroup,
            MsgBody::ReadGroup { .. } => MsgKind::ReadGroup,
            MsgBody::ReadGroupResp { .. } => MsgKind::ReadGroupResp,
            MsgBody::WriteTag { .. } => MsgKind::WriteTag,
            MsgBody::WriteTags { .. } => MsgKind::WriteTags,
            MsgBody::TransData { .. } => MsgKind::TransData,
            MsgBody::RespError { .. } => MsgKind::RespError,
            MsgBody::NodesState { .. } => MsgKind::NodesState,
        }
    }
}

/// One message in flight between two mailboxes.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: String,
    pub receiver: String,
    pub context: Context,
    pub body: MsgBody,
}

impl Envelope {
    pub fn new(sender: &str, receiver: &str, body: MsgBody) -> Envelope {
        Envelope {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            context: next_context(),
            body,
        }
    }

    /// Build the reply to this envelope: endpoints swapped, same context.
    pub fn reply(&self, body: MsgBody) -> Envelope {
        Envelope {
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            context: self.context,
            body,
        }
    }

    pub fn kind(&self) -> MsgKind {
        self.body.kind()
    }
}

struct Slot {
    tx: Sender<Envelope>,
    notify: ReactorNotifier,
}

/// Name-addressed mailbox registry; the process-local transport.
#[derive(Clone, Default)]
pub struct Bus {
    slots: Arc<DashMap<String, Slot>>,
}

/// Receiving side of one adapter's mailbox.
pub struct Mailbox {
    rx: Receiver<Envelope>,
}

impl Mailbox {
    /// Non-blocking receive; the reactor's wake callback drains with
    /// this until empty.
    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Bus {
    pub fn new() -> Bus {
        Bus::default()
    }

    /// Bind a mailbox under `name`. The notifier wakes the owner's
    /// reactor on delivery.
    pub fn bind(&self, name: &str, notify: ReactorNotifier) -> Result<Mailbox> {
        if self.slots.contains_key(name) {
            return Err(ErrorCode::NodeExist);
        }
        let (tx, rx) = bounded(MAILBOX_CAPACITY);
        self.slots.insert(name.to_string(), Slot { tx, notify });
        Ok(Mailbox { rx })
    }

    /// Remove a mailbox; queued envelopes are released.
    pub fn unbind(&self, name: &str) {
        self.slots.remove(name);
    }

    /// Re-key a mailbox under a new name, preserving the channel.
    pub fn rebind(&self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.slots.contains_key(new) {
            return Err(ErrorCode::NodeExist);
        }
        let (_, slot) = self.slots.remove(old).ok_or(ErrorCode::NodeNotExist)?;
        self.slots.insert(new.to_string(), slot);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Deliver an envelope to its receiver's mailbox. Never blocks; on
    /// failure the envelope is released and a transient error reported.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let slot = match self.slots.get(&envelope.receiver) {
            Some(slot) => slot,
            None => {
                tracing::debug!(
                    "bus: no mailbox {} for {:?} from {}",
                    envelope.receiver,
                    envelope.kind(),
                    envelope.sender
                );
                return Err(ErrorCode::NodeNotExist);
            }
        };
        match slot.tx.try_send(envelope) {
            Ok(()) => {
                slot.notify.wake();
                Ok(())
            }
            Err(TrySendError::Full(env)) => {
                tracing::warn!(
                    "bus: mailbox {} full, dropping {:?} from {}",
                    env.receiver,
                    env.kind(),
                    env.sender
                );
                Err(ErrorCode::EInternal)
            }
            Err(TrySendError::Disconnected(_)) => Err(ErrorCode::NodeNotExist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    fn notifier() -> (Reactor, ReactorNotifier) {
        let reactor = Reactor::spawn("bus-test").unwrap();
        let notifier = reactor.handle().notifier();
        (reactor, notifier)
    }

    #[test]
    fn test_bind_send_recv() {
        let (_reactor, notify) = notifier();
        let bus = Bus::new();
        let mbox = bus.bind("n1", notify).unwrap();

        bus.send(Envelope::new("m", "n1", MsgBody::NodeStart)).unwrap();
        let env = mbox.try_recv().expect("delivered");
        assert_eq!(env.kind(), MsgKind::NodeStart);
        assert_eq!(env.sender, "m");
    }

    #[test]
    fn test_send_to_unknown_mailbox() {
        let bus = Bus::new();
        let err = bus.send(Envelope::new("m", "ghost", MsgBody::NodeStop));
        assert_eq!(err, Err(ErrorCode::NodeNotExist));
    }

    #[test]
    fn test_double_bind_conflicts() {
        let (_reactor, notify) = notifier();
        let bus = Bus::new();
        let _mbox = bus.bind("n1", notify.clone()).unwrap();
        assert!(matches!(bus.bind("n1", notify), Err(ErrorCode::NodeExist)));
    }

    #[test]
    fn test_full_mailbox_rejects_without_blocking() {
        let (_reactor, notify) = notifier();
        let bus = Bus::new();
        let _mbox = bus.bind("n1", notify).unwrap();
        for _ in 0..MAILBOX_CAPACITY {
            bus.send(Envelope::new("m", "n1", MsgBody::NodeStart)).unwrap();
        }
        let err = bus.send(Envelope::new("m", "n1", MsgBody::NodeStart));
        assert_eq!(err, Err(ErrorCode::EInternal));
    }

    #[test]
    fn test_rebind_preserves_channel() {
        let (_reactor, notify) = notifier();
        let bus = Bus::new();
        let mbox = bus.bind("old", notify).unwrap();
        bus.send(Envelope::new("m", "old", MsgBody::NodeStart)).unwrap();
        bus.rebind("old", "new").unwrap();
        bus.send(Envelope::new("m", "new", MsgBody::NodeStop)).unwrap();

        assert_eq!(mbox.try_recv().unwrap().kind(), MsgKind::NodeStart);
        assert_eq!(mbox.try_recv().unwrap().kind(), MsgKind::NodeStop);
        assert!(!bus.contains("old"));
    }

    #[test]
    fn test_reply_swaps_endpoints_and_keeps_context() {
        let req = Envelope::new("app", "drv", MsgBody::ReadGroup { group: "g".into() });
        let resp = req.reply(MsgBody::RespError {
            error: ErrorCode::Success,
        });
        assert_eq!(resp.sender, "drv");
        assert_eq!(resp.receiver, "app");
        assert_eq!(resp.context, req.context);
    }

    #[test]
    fn test_request_response_pairing_table() {
        assert_eq!(
            MsgKind::UpdateGroup.response_kind(),
            Some(MsgKind::UpdateDriverGroupResp)
        );
        assert_eq!(
            MsgKind::GetNodeSetting.response_kind(),
            Some(MsgKind::GetNodeSettingResp)
        );
        assert_eq!(MsgKind::TransData.response_kind(), None);
    }
}
