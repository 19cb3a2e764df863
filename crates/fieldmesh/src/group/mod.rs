// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Polling groups: named tag collections under one driver.
//!
//! Every group guards its tags, interval and revision stamp with a single
//! mutex. Read operations hand out deep copies, so no caller ever holds a
//! reference into locked state. Mutations bump the revision stamp, which
//! drivers use to rebuild their read plans (`change_test`).

use crate::error::{ErrorCode, Result};
use crate::tag::Tag;
use crate::time;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Smallest interval any driver may poll at.
pub const GROUP_INTERVAL_MIN_MS: u64 = 1;

/// Upper bound of groups per node, enforced by the manager's preflight.
pub const GROUP_MAX_PER_NODE: usize = 512;

struct GroupState {
    name: String,
    interval: Duration,
    timestamp: u64,
    tags: BTreeMap<String, Tag>,
}

impl GroupState {
    fn bump(&mut self) {
        self.timestamp = time::now_us().max(self.timestamp + 1);
    }
}

/// A named, ordered collection of tags polled on a common interval.
pub struct Group {
    state: Mutex<GroupState>,
}

impl Group {
    /// Create a group. The interval must be at least
    /// [`GROUP_INTERVAL_MIN_MS`].
    pub fn new(name: &str, interval_ms: u64) -> Result<Group> {
        if name.is_empty() || interval_ms < GROUP_INTERVAL_MIN_MS {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        let mut state = GroupState {
            name: name.to_string(),
            interval: Duration::from_millis(interval_ms),
            timestamp: 0,
            tags: BTreeMap::new(),
        };
        state.bump();
        Ok(Group {
            state: Mutex::new(state),
        })
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    pub fn timestamp(&self) -> u64 {
        self.state.lock().timestamp
    }

    pub fn tag_count(&self) -> usize {
        self.state.lock().tags.len()
    }

    /// Rename in place, preserving identity. Crate-internal; the manager
    /// drives renames so subscription state stays consistent.
    pub(crate) fn set_name(&self, name: &str) {
        let mut s = self.state.lock();
        s.name = name.to_string();
        s.bump();
    }

    /// Change the poll interval. The owning driver re-arms its timer on
    /// the next tick via [`Group::change_test`].
    pub fn set_interval(&self, interval_ms: u64) -> Result<()> {
        if interval_ms < GROUP_INTERVAL_MIN_MS {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        let mut s = self.state.lock();
        s.interval = Duration::from_millis(interval_ms);
        s.bump();
        Ok(())
    }

    /// Add a tag. Fails with `TAG_NAME_CONFLICT` if the name exists; a
    /// failed add does not bump the revision stamp.
    pub fn add_tag(&self, tag: Tag) -> Result<()> {
        let mut s = self.state.lock();
        if s.tags.contains_key(&tag.name) {
            return Err(ErrorCode::TagNameConflict);
        }
        s.tags.insert(tag.name.clone(), tag);
        s.bump();
        Ok(())
    }

    /// Replace an existing tag. Fails with `TAG_NOT_EXIST`.
    pub fn update_tag(&self, tag: Tag) -> Result<()> {
        let mut s = self.state.lock();
        if !s.tags.contains_key(&tag.name) {
            return Err(ErrorCode::TagNotExist);
        }
        s.tags.insert(tag.name.clone(), tag);
        s.bump();
        Ok(())
    }

    /// Remove a tag by name.
    pub fn del_tag(&self, name: &str) -> Result<()> {
        let mut s = self.state.lock();
        if s.tags.remove(name).is_none() {
            return Err(ErrorCode::TagNotExist);
        }
        s.bump();
        Ok(())
    }

    /// Deep copy of one tag.
    pub fn find_tag(&self, name: &str) -> Option<Tag> {
        self.state.lock().tags.get(name).cloned()
    }

    /// Deep copies of all tags.
    pub fn list_tags(&self) -> Vec<Tag> {
        self.state.lock().tags.values().cloned().collect()
    }

    /// Case-sensitive substring query. The description pattern also
    /// matches against the tag name.
    pub fn query(&self, name_substr: Option<&str>, desc_substr: Option<&str>) -> Vec<Tag> {
        let s = self.state.lock();
        s.tags
            .values()
            .filter(|t| match name_substr {
                Some(pat) => t.name.contains(pat),
                None => true,
            })
            .filter(|t| match desc_substr {
                Some(pat) => t.description.contains(pat) || t.name.contains(pat),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Tags that participate in a poll snapshot (READ, SUBSCRIBE or
    /// STATIC).
    pub fn readable_tags(&self) -> Vec<Tag> {
        self.state.lock().tags.values().filter(|t| t.is_readable()).cloned().collect()
    }

    /// Partition readable tags into `(static, polled)`.
    pub fn split_static(readable: Vec<Tag>) -> (Vec<Tag>, Vec<Tag>) {
        readable.into_iter().partition(Tag::is_static)
    }

    /// Store a static value on an existing tag.
    pub fn set_static_value(&self, name: &str, value: crate::tag::TagValue) -> Result<()> {
        let mut s = self.state.lock();
        let tag = s.tags.get_mut(name).ok_or(ErrorCode::TagNotExist)?;
        tag.set_static_value(value)?;
        s.bump();
        Ok(())
    }

    /// `true` if the group changed since the caller's cached revision.
    pub fn is_changed(&self, prev_timestamp: u64) -> bool {
        self.state.lock().timestamp != prev_timestamp
    }

    /// If the group changed since `prev_timestamp`, hand the callback the
    /// new revision, the static/polled partition and the interval.
    pub fn change_test<F>(&self, prev_timestamp: u64, f: F)
    where
        F: FnOnce(u64, Vec<Tag>, Vec<Tag>, Duration),
    {
        let (ts, readable, interval) = {
            let s = self.state.lock();
            if s.timestamp == prev_timestamp {
                return;
            }
            let readable: Vec<Tag> =
                s.tags.values().filter(|t| t.is_readable()).cloned().collect();
            (s.timestamp, readable, s.interval)
        };
        let (static_tags, polled) = Group::split_static(readable);
        f(ts, static_tags, polled, interval);
    }
}

/// Per-driver group registry. Lookups are lock-free; the owning driver
/// adapter and the manager share one handle.
#[derive(Clone, Default)]
pub struct GroupSet {
    groups: Arc<DashMap<String, Arc<Group>>>,
}

impl GroupSet {
    pub fn new() -> GroupSet {
        GroupSet::default()
    }

    /// Create a group, or update the interval of an existing one.
    pub fn add(&self, name: &str, interval_ms: u64) -> Result<Arc<Group>> {
        if let Some(existing) = self.groups.get(name) {
            let g = Arc::clone(existing.value());
            drop(existing);
            g.set_interval(interval_ms)?;
            return Ok(g);
        }
        if self.groups.len() >= GROUP_MAX_PER_NODE {
            return Err(ErrorCode::GroupMaxGroups);
        }
        let group = Arc::new(Group::new(name, interval_ms)?);
        self.groups.insert(name.to_string(), Arc::clone(&group));
        Ok(group)
    }

    pub fn del(&self, name: &str) -> Result<()> {
        self.groups
            .remove(name)
            .map(|_| ())
            .ok_or(ErrorCode::GroupNotExist)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(name).map(|g| Arc::clone(g.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group names in name order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        names.sort();
        names
    }

    /// Rename a group in place, preserving its identity.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.groups.contains_key(new) {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        let (_, group) = self
            .groups
            .remove(old)
            .ok_or(ErrorCode::GroupNotExist)?;
        group.set_name(new);
        self.groups.insert(new.to_string(), group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{TagAttr, TagType, TagValue};

    fn tag(name: &str) -> Tag {
        Tag::new(name, "1!400001", TagType::Int16, TagAttr::READ)
    }

    #[test]
    fn test_add_duplicate_keeps_timestamp() {
        let g = Group::new("g1", 1000).unwrap();
        g.add_tag(tag("t1")).unwrap();
        let ts = g.timestamp();
        assert_eq!(g.add_tag(tag("t1")), Err(ErrorCode::TagNameConflict));
        assert_eq!(g.timestamp(), ts);
        assert_eq!(g.tag_count(), 1);
    }

    #[test]
    fn test_timestamp_strictly_monotonic() {
        let g = Group::new("g1", 1000).unwrap();
        let mut prev = g.timestamp();
        for i in 0..32 {
            g.add_tag(tag(&format!("t{}", i))).unwrap();
            let ts = g.timestamp();
            assert!(ts > prev, "revision must strictly increase");
            prev = ts;
        }
    }

    #[test]
    fn test_update_missing_tag() {
        let g = Group::new("g1", 1000).unwrap();
        assert_eq!(g.update_tag(tag("t1")), Err(ErrorCode::TagNotExist));
    }

    #[test]
    fn test_find_returns_deep_copy() {
        let g = Group::new("g1", 1000).unwrap();
        g.add_tag(tag("t1")).unwrap();
        let mut copy = g.find_tag("t1").unwrap();
        copy.description = "mutated".into();
        assert_eq!(g.find_tag("t1").unwrap().description, "");
    }

    #[test]
    fn test_query_matches_name_and_description() {
        let g = Group::new("g1", 1000).unwrap();
        let mut a = tag("motor_speed");
        a.description = "spindle speed".into();
        let mut b = tag("temp");
        b.description = "oil temperature".into();
        g.add_tag(a).unwrap();
        g.add_tag(b).unwrap();

        assert_eq!(g.query(Some("motor"), None).len(), 1);
        assert_eq!(g.query(None, Some("temperature")).len(), 1);
        // desc pattern also matches the name
        assert_eq!(g.query(None, Some("temp")).len(), 1);
        assert_eq!(g.query(Some("x"), None).len(), 0);
    }

    #[test]
    fn test_readable_and_split_static() {
        let g = Group::new("g1", 1000).unwrap();
        g.add_tag(tag("r1")).unwrap();
        let mut s1 = Tag::new("s1", "1!1", TagType::Float, TagAttr::STATIC);
        s1.set_static_value(TagValue::Float(3.14)).unwrap();
        g.add_tag(s1).unwrap();
        g.add_tag(Tag::new("w1", "1!2", TagType::Int16, TagAttr::WRITE))
            .unwrap();

        let readable = g.readable_tags();
        assert_eq!(readable.len(), 2);
        let (statics, polled) = Group::split_static(readable);
        assert_eq!(statics.len(), 1);
        assert_eq!(polled.len(), 1);
        assert_eq!(statics[0].name, "s1");
    }

    #[test]
    fn test_change_test_fires_only_on_change() {
        let g = Group::new("g1", 1000).unwrap();
        g.add_tag(tag("t1")).unwrap();
        let ts = g.timestamp();

        let mut fired = false;
        g.change_test(ts, |_, _, _, _| fired = true);
        assert!(!fired);

        g.add_tag(tag("t2")).unwrap();
        let mut seen = None;
        g.change_test(ts, |new_ts, statics, polled, interval| {
            seen = Some((new_ts, statics.len(), polled.len(), interval));
        });
        let (new_ts, statics, polled, interval) = seen.expect("must fire");
        assert!(new_ts > ts);
        assert_eq!(statics, 0);
        assert_eq!(polled, 2);
        assert_eq!(interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_interval_floor() {
        assert!(Group::new("g", 0).is_err());
        let g = Group::new("g", 10).unwrap();
        assert_eq!(g.set_interval(0), Err(ErrorCode::GroupParameterInvalid));
    }

    #[test]
    fn test_group_set_add_del_rename() {
        let set = GroupSet::new();
        set.add("g1", 100).unwrap();
        assert!(set.contains("g1"));
        // re-add updates the interval in place
        let g = set.add("g1", 250).unwrap();
        assert_eq!(g.interval(), Duration::from_millis(250));
        assert_eq!(set.len(), 1);

        set.rename("g1", "g2").unwrap();
        assert!(set.contains("g2"));
        assert!(!set.contains("g1"));
        assert_eq!(set.get("g2").unwrap().name(), "g2");

        assert_eq!(set.del("g1"), Err(ErrorCode::GroupNotExist));
        set.del("g2").unwrap();
        assert!(set.is_empty());
    }
}
