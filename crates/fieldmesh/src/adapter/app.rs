// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! App adapter core: snapshot consumption and command origination.
//!
//! The app keeps its own subscription list, fed by the manager's
//! `SUBSCRIBE_GROUP` notifications. Snapshots are handed to the plugin
//! only while the node runs. Replies to commands the plugin originated
//! through its context come back here and are matched to the plugin by
//! envelope context.

use crate::bus::{Bus, Context, Envelope, MsgBody};
use crate::error::ErrorCode;
use crate::metrics::{names, MetricBlock};
use crate::node::{RunState, StateCell};
use crate::plugin::{AppPlugin, PluginContext};
use crate::reactor::{ReactorHandle, TimerId, TimerKind};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

struct AppSub {
    driver: String,
    group: String,
    params: Option<String>,
}

pub(crate) struct AppCore {
    name: Arc<RwLock<String>>,
    plugin: Box<dyn AppPlugin>,
    ctx: Arc<dyn PluginContext>,
    bus: Bus,
    state: RunState,
    cell: Arc<StateCell>,
    setting: Option<String>,
    subs: Vec<AppSub>,
    reactor: ReactorHandle,
    timer: Option<TimerId>,
    block: Arc<MetricBlock>,
}

impl AppCore {
    pub(crate) fn spawn_state(
        name: Arc<RwLock<String>>,
        plugin: Box<dyn AppPlugin>,
        ctx: Arc<dyn PluginContext>,
        bus: Bus,
        cell: Arc<StateCell>,
        reactor: ReactorHandle,
        block: Arc<MetricBlock>,
    ) -> Arc<Mutex<AppCore>> {
        cell.set_running(RunState::Init);
        Arc::new(Mutex::new(AppCore {
            name,
            plugin,
            ctx,
            bus,
            state: RunState::Init,
            cell,
            setting: None,
            subs: Vec::new(),
            reactor,
            timer: None,
            block,
        }))
    }

    fn set_state(&mut self, state: RunState) {
        self.state = state;
        self.cell.set_running(state);
    }

    fn reply(&self, to: &str, context: Context, body: MsgBody) {
        let env = Envelope {
            sender: self.name.read().clone(),
            receiver: to.to_string(),
            context,
            body,
        };
        match self.bus.send(env) {
            Ok(()) => self.block.add(names::SEND_MSGS_TOTAL, 1),
            Err(_) => self.block.add(names::SEND_MSG_ERRORS_TOTAL, 1),
        }
    }

    fn init(&mut self, load: bool) -> ErrorCode {
        if self.state != RunState::Init {
            return ErrorCode::EInternal;
        }
        match self.plugin.init(Arc::clone(&self.ctx), load) {
            Ok(()) => {
                self.set_state(RunState::Ready);
                ErrorCode::Success
            }
            Err(e) => e,
        }
    }

    fn stop(&mut self) -> ErrorCode {
        match self.state {
            RunState::Ready => return ErrorCode::Success,
            RunState::Running => {}
            _ => return ErrorCode::EInternal,
        }
        if let Some(id) = self.timer.take() {
            self.reactor.del_timer(id);
        }
        if let Err(e) = self.plugin.stop() {
            return e;
        }
        self.set_state(RunState::Ready);
        ErrorCode::Success
    }

    fn uninit(&mut self) -> ErrorCode {
        if let Some(id) = self.timer.take() {
            self.reactor.del_timer(id);
        }
        if self.state == RunState::Running {
            let _ = self.plugin.stop();
        }
        let code = match self.plugin.uninit() {
            Ok(()) => ErrorCode::Success,
            Err(e) => e,
        };
        self.set_state(RunState::Stopped);
        code
    }

    fn apply_setting(&mut self, setting: String) -> ErrorCode {
        match self.plugin.setting(&setting) {
            Ok(()) => {
                self.setting = Some(setting);
                ErrorCode::Success
            }
            Err(e) => e,
        }
    }

    fn subscribed(&mut self, driver: &str, group: &str, params: Option<String>) -> ErrorCode {
        match self
            .subs
            .iter_mut()
            .find(|s| s.driver == driver && s.group == group)
        {
            Some(sub) => sub.params = params.clone(),
            None => self.subs.push(AppSub {
                driver: driver.to_string(),
                group: group.to_string(),
                params: params.clone(),
            }),
        }
        self.plugin.on_subscribed(driver, group, params.as_deref());
        ErrorCode::Success
    }

    fn unsubscribed(&mut self, driver: &str, group: &str) -> ErrorCode {
        self.subs.retain(|s| !(s.driver == driver && s.group == group));
        self.plugin.on_unsubscribed(driver, group);
        ErrorCode::Success
    }
}

fn start(c: &mut AppCore, core: &Arc<Mutex<AppCore>>) -> ErrorCode {
    match c.state {
        RunState::Running => return ErrorCode::Success,
        RunState::Ready => {}
        _ => return ErrorCode::EInternal,
    }
    if let Err(e) = c.plugin.start() {
        return e;
    }
    if let Some(interval) = c.plugin.timer_interval() {
        let tick_core = Arc::clone(core);
        let id = c.reactor.add_timer(
            interval,
            TimerKind::NonBlock,
            Box::new(move || {
                let mut c = tick_core.lock();
                if c.state == RunState::Running {
                    c.plugin.on_timer();
                }
            }),
        );
        c.timer = Some(id);
    }
    c.set_state(RunState::Running);
    ErrorCode::Success
}

/// Dispatch one envelope on the reactor thread.
pub(crate) fn handle(core: &Arc<Mutex<AppCore>>, env: Envelope) {
    let Envelope {
        sender,
        context,
        body,
        ..
    } = env;
    let mut guard = core.lock();
    let c = &mut *guard;
    c.block.add(names::RECV_MSGS_TOTAL, 1);
    match body {
        MsgBody::NodeInit { load } => {
            let code = c.init(load);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::NodeStart => {
            let code = start(c, core);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::NodeStop => {
            let code = c.stop();
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::NodeUninit => {
            let code = c.uninit();
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::GetNodeSetting => {
            let setting = c.setting.clone();
            c.reply(&sender, context, MsgBody::GetNodeSettingResp { setting });
        }
        MsgBody::SetNodeSetting { setting } => {
            let code = c.apply_setting(setting);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::SubscribeGroup {
            driver, group, params, ..
        }
        | MsgBody::UpdateSubscribeGroup {
            driver, group, params, ..
        } => {
            let code = c.subscribed(&driver, &group, params);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::UnsubscribeGroup { driver, group, .. } => {
            let code = c.unsubscribed(&driver, &group);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::TransData { data } => {
            if c.state == RunState::Running {
                if let Err(e) = c.plugin.on_trans_data(&data) {
                    tracing::debug!("app {}: sink rejected snapshot: {}", c.name.read(), e);
                }
            }
        }
        MsgBody::NodeDeleted { node } => {
            c.subs.retain(|s| s.driver != node);
            c.plugin.on_node_deleted(&node);
        }
        MsgBody::NodeRenamed { old, new } => {
            for sub in c.subs.iter_mut() {
                if sub.driver == old {
                    sub.driver = new.clone();
                }
            }
        }
        body @ (MsgBody::RespError { .. }
        | MsgBody::ReadGroupResp { .. }
        | MsgBody::GetNodeSettingResp { .. }
        | MsgBody::UpdateDriverGroupResp { .. }
        | MsgBody::NodesState { .. }) => {
            c.plugin.on_response(context, &body);
        }
        other => {
            tracing::warn!(
                "app {}: dropping unexpected {:?} from {}",
                c.name.read(),
                other.kind(),
                sender
            );
        }
    }
}
