// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Driver adapter core: group ownership, poll cycle, write path and
//! validated tag mutation.
//!
//! The poll cycle per group tick:
//! 1. Compare the group's revision stamp against the cached plan and
//!    rebuild the static/polled partition through `group_sync` on
//!    change; an interval change re-arms the group timer immediately.
//! 2. Run the plugin's `group_timer` against the plan.
//! 3. Merge static tag values from the model into the snapshot.
//! 4. Fan the snapshot out to every locally routed subscriber; a failed
//!    enqueue counts against the drop metrics and never stalls the
//!    poll loop.
//!
//! Dispatch routes are fed by `SUBSCRIBE_GROUP`/`UNSUBSCRIBE_GROUP`
//! envelopes from the manager, so the hot path never consults the
//! manager's tables.

use crate::bus::{Bus, Context, Envelope, GroupTags, MsgBody};
use crate::error::{ErrorCode, Result};
use crate::group::{Group, GroupSet};
use crate::metrics::{names, MetricBlock};
use crate::node::{RunState, StateCell};
use crate::plugin::{CachePolicy, DriverPlugin, PluginContext, PollPlan, TagWrite};
use crate::reactor::{ReactorHandle, TimerId, TimerKind};
use crate::tag::{SharedTransData, Tag, TagAttr, TagSample, TagValue, TransData};
use crate::time;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `group -> subscriber apps`, shared between the core and the plugin
/// context so push-mode plugins can publish without locking the core.
pub(crate) type DispatchRoutes = Arc<RwLock<HashMap<String, Vec<String>>>>;

pub(crate) struct DriverCore {
    name: Arc<RwLock<String>>,
    plugin: Box<dyn DriverPlugin>,
    ctx: Arc<dyn PluginContext>,
    bus: Bus,
    state: RunState,
    cell: Arc<StateCell>,
    setting: Option<String>,
    groups: GroupSet,
    routes: DispatchRoutes,
    cache: HashMap<String, SharedTransData>,
    plans: HashMap<String, Arc<PollPlan>>,
    timers: HashMap<String, TimerId>,
    reactor: ReactorHandle,
    block: Arc<MetricBlock>,
    global: Arc<MetricBlock>,
    timer_kind: TimerKind,
    cache_policy: CachePolicy,
}

impl DriverCore {
    #[allow(clippy::too_many_arguments)] // one-time wiring call
    pub(crate) fn spawn_state(
        name: Arc<RwLock<String>>,
        plugin: Box<dyn DriverPlugin>,
        ctx: Arc<dyn PluginContext>,
        bus: Bus,
        cell: Arc<StateCell>,
        groups: GroupSet,
        routes: DispatchRoutes,
        reactor: ReactorHandle,
        block: Arc<MetricBlock>,
        global: Arc<MetricBlock>,
        timer_kind: TimerKind,
        cache_policy: CachePolicy,
    ) -> Arc<Mutex<DriverCore>> {
        cell.set_running(RunState::Init);
        Arc::new(Mutex::new(DriverCore {
            name,
            plugin,
            ctx,
            bus,
            state: RunState::Init,
            cell,
            setting: None,
            groups,
            routes,
            cache: HashMap::new(),
            plans: HashMap::new(),
            timers: HashMap::new(),
            reactor,
            block,
            global,
            timer_kind,
            cache_policy,
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

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

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
        self.remove_timers();
        if let Err(e) = self.plugin.stop() {
            return e;
        }
        self.set_state(RunState::Ready);
        ErrorCode::Success
    }

    fn uninit(&mut self) -> ErrorCode {
        self.remove_timers();
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

    fn remove_timers(&mut self) {
        for (_, id) in self.timers.drain() {
            self.reactor.del_timer(id);
        }
    }

    // ------------------------------------------------------------------
    // Poll plan
    // ------------------------------------------------------------------

    /// Cached plan for a group, rebuilt when the revision stamp moved.
    /// The boolean reports an interval change needing a timer re-arm.
    fn refresh_plan(&mut self, group: &str) -> Option<(Arc<PollPlan>, bool)> {
        let g = self.groups.get(group)?;
        let cached_ts = self.plans.get(group).map_or(0, |p| p.timestamp);
        if !g.is_changed(cached_ts) {
            return Some((Arc::clone(self.plans.get(group)?), false));
        }
        let (static_tags, polled) = Group::split_static(g.readable_tags());
        let plan = Arc::new(PollPlan {
            timestamp: g.timestamp(),
            interval: g.interval(),
            static_tags,
            polled,
        });
        if let Err(e) = self.plugin.group_sync(group, &plan) {
            tracing::warn!("driver {}: group_sync {} failed: {}", self.name.read(), group, e);
        }
        let interval_changed = self
            .plans
            .get(group)
            .map_or(false, |prev| prev.interval != plan.interval);
        self.plans.insert(group.to_string(), Arc::clone(&plan));
        Some((plan, interval_changed))
    }

    /// One device read over the plan, statics merged in.
    fn sample_with_plan(&mut self, group: &str, plan: &PollPlan) -> SharedTransData {
        let t0 = Instant::now();
        let mut samples = self.plugin.group_timer(group, plan);
        self.block
            .set(names::GROUP_TIMER_MS, t0.elapsed().as_millis() as u64);
        self.block.add(names::TAG_READS_TOTAL, samples.len() as u64);
        let errors = samples.iter().filter(|s| !s.error.is_ok()).count() as u64;
        if errors > 0 {
            self.block.add(names::TAG_READ_ERRORS_TOTAL, errors);
        }
        for tag in &plan.static_tags {
            samples.push(match &tag.static_value {
                Some(v) => TagSample::ok(&tag.name, v.clone()),
                None => TagSample::err(&tag.name, ErrorCode::TagNotExist),
            });
        }
        Arc::new(TransData {
            driver: self.name.read().clone(),
            group: group.to_string(),
            timestamp: time::now_us(),
            samples,
        })
    }

    // ------------------------------------------------------------------
    // Group control
    // ------------------------------------------------------------------

    fn del_group(&mut self, group: &str) -> ErrorCode {
        match self.groups.del(group) {
            Ok(()) => {
                if let Some(id) = self.timers.remove(group) {
                    self.reactor.del_timer(id);
                }
                self.plans.remove(group);
                self.cache.remove(group);
                self.routes.write().remove(group);
                ErrorCode::Success
            }
            Err(e) => e,
        }
    }

    // ------------------------------------------------------------------
    // Tag mutation
    // ------------------------------------------------------------------

    fn validate_tags(&self, tags: &[Tag]) -> Result<()> {
        for tag in tags {
            if tag.name.is_empty() {
                return Err(ErrorCode::GroupParameterInvalid);
            }
            if let Some(v) = &tag.static_value {
                if !tag.is_static() || v.tag_type() != tag.ty {
                    return Err(ErrorCode::GroupParameterInvalid);
                }
            }
            self.plugin.validate_tag(tag)?;
        }
        self.plugin.tag_validator(tags)?;
        Ok(())
    }

    fn add_tags(&mut self, group: &str, tags: Vec<Tag>) -> ErrorCode {
        let Some(g) = self.groups.get(group) else {
            return ErrorCode::GroupNotExist;
        };
        if let Err(e) = self.validate_tags(&tags) {
            return e;
        }
        // Pre-check conflicts so the commit below cannot partially fail.
        let mut seen = HashSet::new();
        for tag in &tags {
            if g.find_tag(&tag.name).is_some() || !seen.insert(tag.name.clone()) {
                return ErrorCode::TagNameConflict;
            }
        }
        for tag in &tags {
            let _ = g.add_tag(tag.clone());
        }
        self.plugin.add_tags(group, &tags);
        ErrorCode::Success
    }

    fn update_tags(&mut self, group: &str, tags: Vec<Tag>) -> ErrorCode {
        let Some(g) = self.groups.get(group) else {
            return ErrorCode::GroupNotExist;
        };
        if let Err(e) = self.validate_tags(&tags) {
            return e;
        }
        for tag in &tags {
            if g.find_tag(&tag.name).is_none() {
                return ErrorCode::TagNotExist;
            }
        }
        for tag in &tags {
            let _ = g.update_tag(tag.clone());
        }
        ErrorCode::Success
    }

    fn del_tags(&mut self, group: &str, names: Vec<String>) -> ErrorCode {
        let Some(g) = self.groups.get(group) else {
            return ErrorCode::GroupNotExist;
        };
        for name in &names {
            if g.find_tag(name).is_none() {
                return ErrorCode::TagNotExist;
            }
        }
        for name in &names {
            let _ = g.del_tag(name);
        }
        self.plugin.del_tags(group, &names);
        ErrorCode::Success
    }

    // ------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------

    fn read_group(&mut self, group: &str) -> (Option<SharedTransData>, ErrorCode) {
        if !self.groups.contains(group) {
            return (None, ErrorCode::GroupNotExist);
        }
        if self.cache_policy == CachePolicy::Snapshot {
            if let Some(d) = self.cache.get(group) {
                return (Some(Arc::clone(d)), ErrorCode::Success);
            }
        }
        match self.refresh_plan(group) {
            Some((plan, _)) => {
                let data = self.sample_with_plan(group, &plan);
                self.cache.insert(group.to_string(), Arc::clone(&data));
                (Some(data), ErrorCode::Success)
            }
            None => (None, ErrorCode::GroupNotExist),
        }
    }

    fn write_tag(&mut self, group: &str, tag: &str, value: &serde_json::Value) -> ErrorCode {
        let Some(g) = self.groups.get(group) else {
            return ErrorCode::GroupNotExist;
        };
        let Some(t) = g.find_tag(tag) else {
            return ErrorCode::TagNotExist;
        };
        let v = match TagValue::from_json(t.ty, value) {
            Ok(v) => v,
            Err(e) => return e,
        };
        if t.is_static() {
            // Static tags are written into the model, not the device.
            return match g.set_static_value(tag, v) {
                Ok(()) => ErrorCode::Success,
                Err(e) => e,
            };
        }
        if !t.attr.contains(TagAttr::WRITE) {
            return ErrorCode::GroupParameterInvalid;
        }
        self.block.add(names::TAG_WRITES_TOTAL, 1);
        self.plugin.write_tag(group, &t, v)
    }

    fn write_tags(&mut self, group: &str, writes: &[(String, serde_json::Value)]) -> ErrorCode {
        let Some(g) = self.groups.get(group) else {
            return ErrorCode::GroupNotExist;
        };
        let mut batch: Vec<TagWrite> = Vec::new();
        let mut statics: Vec<(String, TagValue)> = Vec::new();
        for (name, value) in writes {
            let Some(t) = g.find_tag(name) else {
                return ErrorCode::TagNotExist;
            };
            let v = match TagValue::from_json(t.ty, value) {
                Ok(v) => v,
                Err(e) => return e,
            };
            if t.is_static() {
                statics.push((name.clone(), v));
            } else if !t.attr.contains(TagAttr::WRITE) {
                return ErrorCode::GroupParameterInvalid;
            } else {
                batch.push(TagWrite { tag: t, value: v });
            }
        }
        for (name, v) in statics {
            if let Err(e) = g.set_static_value(&name, v) {
                return e;
            }
        }
        if !batch.is_empty() {
            self.block.add(names::TAG_WRITES_TOTAL, batch.len() as u64);
            for code in self.plugin.write_tags(group, &batch) {
                if !code.is_ok() {
                    return code;
                }
            }
        }
        ErrorCode::Success
    }

    // ------------------------------------------------------------------
    // Subscription routing
    // ------------------------------------------------------------------

    fn subscribe(&mut self, app: &str, group: &str) -> ErrorCode {
        if !self.groups.contains(group) {
            return ErrorCode::GroupNotExist;
        }
        let mut routes = self.routes.write();
        let entry = routes.entry(group.to_string()).or_default();
        if !entry.iter().any(|a| a == app) {
            entry.push(app.to_string());
        }
        ErrorCode::Success
    }

    fn unsubscribe(&mut self, app: &str, group: &str) -> ErrorCode {
        let mut routes = self.routes.write();
        if let Some(entry) = routes.get_mut(group) {
            entry.retain(|a| a != app);
            if entry.is_empty() {
                routes.remove(group);
            }
        }
        ErrorCode::Success
    }

    fn peer_renamed(&mut self, old: &str, new: &str) {
        let mut routes = self.routes.write();
        for apps in routes.values_mut() {
            for app in apps.iter_mut() {
                if app == old {
                    *app = new.to_string();
                }
            }
        }
    }

    fn peer_deleted(&mut self, node: &str) {
        let mut routes = self.routes.write();
        for apps in routes.values_mut() {
            apps.retain(|a| a != node);
        }
        routes.retain(|_, apps| !apps.is_empty());
    }
}

/// Fan a snapshot out to the routed subscribers of its group.
pub(crate) fn dispatch_snapshot(
    bus: &Bus,
    driver: &str,
    routes: &DispatchRoutes,
    data: SharedTransData,
    block: &MetricBlock,
    global: &MetricBlock,
) {
    let apps: Vec<String> = routes
        .read()
        .get(&data.group)
        .cloned()
        .unwrap_or_default();
    for app in apps {
        let env = Envelope::new(
            driver,
            &app,
            MsgBody::TransData {
                data: Arc::clone(&data),
            },
        );
        match bus.send(env) {
            Ok(()) => {
                block.add(names::SEND_MSGS_TOTAL, 1);
                global.add(names::TRANS_DATA_DISPATCHED_TOTAL, 1);
            }
            Err(_) => {
                block.add(names::SEND_MSG_ERRORS_TOTAL, 1);
                global.add(names::TRANS_DATA_DROPPED_TOTAL, 1);
            }
        }
    }
    block.roll(names::TRANS_DATA_5S, 1);
}

fn install_group_timer(
    core: &Arc<Mutex<DriverCore>>,
    c: &mut DriverCore,
    group: &str,
    interval: Duration,
) {
    let tick_core = Arc::clone(core);
    let tick_group = group.to_string();
    let id = c.reactor.add_timer(
        interval,
        c.timer_kind,
        Box::new(move || poll_tick(&tick_core, &tick_group)),
    );
    c.timers.insert(group.to_string(), id);
}

fn start(c: &mut DriverCore, core: &Arc<Mutex<DriverCore>>) -> ErrorCode {
    match c.state {
        RunState::Running => return ErrorCode::Success,
        RunState::Ready => {}
        _ => return ErrorCode::EInternal,
    }
    if let Err(e) = c.plugin.start() {
        return e;
    }
    for name in c.groups.names() {
        if let Some(g) = c.groups.get(&name) {
            install_group_timer(core, c, &name, g.interval());
        }
    }
    c.set_state(RunState::Running);
    ErrorCode::Success
}

fn add_group(
    c: &mut DriverCore,
    core: &Arc<Mutex<DriverCore>>,
    group: &str,
    interval_ms: u64,
) -> ErrorCode {
    match c.groups.add(group, interval_ms) {
        Ok(g) => {
            if c.state == RunState::Running && !c.timers.contains_key(group) {
                install_group_timer(core, c, group, g.interval());
            }
            ErrorCode::Success
        }
        Err(e) => e,
    }
}

fn update_group(
    c: &mut DriverCore,
    core: &Arc<Mutex<DriverCore>>,
    group: &str,
    new_name: Option<&str>,
    interval_ms: Option<u64>,
) -> ErrorCode {
    let Some(g) = c.groups.get(group) else {
        return ErrorCode::GroupNotExist;
    };
    if let Some(ms) = interval_ms {
        if let Err(e) = g.set_interval(ms) {
            return e;
        }
    }
    let mut current = group.to_string();
    if let Some(new) = new_name {
        if new != group {
            if let Err(e) = c.groups.rename(group, new) {
                return e;
            }
            // Carry per-group runtime state across the rename.
            if let Some(plan) = c.plans.remove(group) {
                c.plans.insert(new.to_string(), plan);
            }
            if let Some(data) = c.cache.remove(group) {
                c.cache.insert(new.to_string(), data);
            }
            let mut routes = c.routes.write();
            if let Some(apps) = routes.remove(group) {
                routes.insert(new.to_string(), apps);
            }
            drop(routes);
            current = new.to_string();
        }
    }
    if let Some(id) = c.timers.remove(group) {
        c.reactor.del_timer(id);
    }
    if c.state == RunState::Running {
        install_group_timer(core, c, &current, g.interval());
    }
    ErrorCode::Success
}

fn add_gtags(c: &mut DriverCore, core: &Arc<Mutex<DriverCore>>, gtags: Vec<GroupTags>) -> ErrorCode {
    for gt in &gtags {
        if let Err(e) = c.validate_tags(&gt.tags) {
            return e;
        }
    }
    for gt in &gtags {
        let g = match c.groups.add(&gt.group, gt.interval_ms) {
            Ok(g) => g,
            Err(e) => return e,
        };
        for tag in &gt.tags {
            if let Err(e) = g.add_tag(tag.clone()) {
                return e;
            }
        }
        c.plugin.load_tags(&gt.group, &gt.tags);
        if c.state == RunState::Running && !c.timers.contains_key(&gt.group) {
            install_group_timer(core, c, &gt.group, g.interval());
        }
    }
    ErrorCode::Success
}

/// One group timer tick.
pub(crate) fn poll_tick(core: &Arc<Mutex<DriverCore>>, group: &str) {
    let mut guard = core.lock();
    let c = &mut *guard;
    if c.state != RunState::Running {
        return;
    }
    let Some((plan, interval_changed)) = c.refresh_plan(group) else {
        return;
    };
    if interval_changed {
        if let Some(id) = c.timers.remove(group) {
            c.reactor.del_timer(id);
        }
        install_group_timer(core, c, group, plan.interval);
    }
    let data = c.sample_with_plan(group, &plan);
    c.cache.insert(group.to_string(), Arc::clone(&data));
    let driver = data.driver.clone();
    dispatch_snapshot(&c.bus, &driver, &c.routes, data, &c.block, &c.global);
}

/// Dispatch one envelope on the reactor thread.
pub(crate) fn handle(core: &Arc<Mutex<DriverCore>>, env: Envelope) {
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
        MsgBody::AddGroup { group, interval_ms } => {
            let code = add_group(c, core, &group, interval_ms);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::DelGroup { group } => {
            let code = c.del_group(&group);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::UpdateGroup {
            group,
            new_name,
            interval_ms,
        } => {
            let code = update_group(c, core, &group, new_name.as_deref(), interval_ms);
            c.reply(
                &sender,
                context,
                MsgBody::UpdateDriverGroupResp { group, error: code },
            );
        }
        MsgBody::AddTags { group, tags } => {
            let code = c.add_tags(&group, tags);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::UpdateTags { group, tags } => {
            let code = c.update_tags(&group, tags);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::DelTags { group, names } => {
            let code = c.del_tags(&group, names);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::AddGtags { groups } => {
            let code = add_gtags(c, core, groups);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::ReadGroup { group } => {
            let (data, error) = c.read_group(&group);
            c.reply(&sender, context, MsgBody::ReadGroupResp { group, data, error });
        }
        MsgBody::WriteTag { group, tag, value } => {
            let code = c.write_tag(&group, &tag, &value);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::WriteTags { group, writes } => {
            let code = c.write_tags(&group, &writes);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::SubscribeGroup { app, group, .. }
        | MsgBody::UpdateSubscribeGroup { app, group, .. } => {
            let code = c.subscribe(&app, &group);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::UnsubscribeGroup { app, group, .. } => {
            let code = c.unsubscribe(&app, &group);
            c.reply(&sender, context, MsgBody::RespError { error: code });
        }
        MsgBody::NodeRenamed { old, new } => {
            c.peer_renamed(&old, &new);
        }
        MsgBody::NodeDeleted { node } => {
            c.peer_deleted(&node);
        }
        other => {
            tracing::warn!(
                "driver {}: dropping unexpected {:?} from {}",
                c.name.read(),
                other.kind(),
                sender
            );
        }
    }
}
