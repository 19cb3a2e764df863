// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration persistence, consumed through the [`Store`] interface.
//!
//! The fabric persists nodes, groups, tags and subscriptions and
//! restores them at boot. The store engine itself is external to the
//! core; [`MemStore`] backs the tests and [`JsonStore`] ships with the
//! daemon, keeping the whole state as one JSON document that is
//! rewritten on every mutation.

use crate::error::{ErrorCode, Result};
use crate::node::{NodeKind, RunState};
use crate::tag::Tag;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persisted node row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub kind: NodeKind,
    pub plugin: String,
    #[serde(default)]
    pub setting: Option<String>,
    pub state: RunState,
}

/// Persisted group row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub driver: String,
    pub name: String,
    pub interval_ms: u64,
}

/// Persisted subscription row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRecord {
    pub app: String,
    pub driver: String,
    pub group: String,
    #[serde(default)]
    pub params: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagRecord {
    driver: String,
    group: String,
    tag: Tag,
}

/// The store contract the fabric consumes. Deletes cascade: removing a
/// node removes its groups, tags and subscriptions; removing a group
/// removes its tags and subscriptions.
pub trait Store: Send + Sync {
    fn save_node(&self, rec: &NodeRecord) -> Result<()>;
    fn delete_node(&self, name: &str) -> Result<()>;
    fn rename_node(&self, old: &str, new: &str) -> Result<()>;

    fn save_group(&self, rec: &GroupRecord) -> Result<()>;
    fn delete_group(&self, driver: &str, group: &str) -> Result<()>;
    fn rename_group(&self, driver: &str, old: &str, new: &str) -> Result<()>;

    fn save_tag(&self, driver: &str, group: &str, tag: &Tag) -> Result<()>;
    fn delete_tag(&self, driver: &str, group: &str, tag: &str) -> Result<()>;

    fn save_subscription(&self, rec: &SubRecord) -> Result<()>;
    fn delete_subscription(&self, app: &str, driver: &str, group: &str) -> Result<()>;

    fn load_nodes(&self) -> Result<Vec<NodeRecord>>;
    fn load_groups(&self, driver: &str) -> Result<Vec<GroupRecord>>;
    fn load_tags(&self, driver: &str, group: &str) -> Result<Vec<Tag>>;
    fn load_subscriptions(&self) -> Result<Vec<SubRecord>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    nodes: Vec<NodeRecord>,
    #[serde(default)]
    groups: Vec<GroupRecord>,
    #[serde(default)]
    tags: Vec<TagRecord>,
    #[serde(default)]
    subscriptions: Vec<SubRecord>,
}

impl State {
    fn save_node(&mut self, rec: &NodeRecord) {
        self.nodes.retain(|n| n.name != rec.name);
        self.nodes.push(rec.clone());
    }

    fn delete_node(&mut self, name: &str) {
        self.nodes.retain(|n| n.name != name);
        self.groups.retain(|g| g.driver != name);
        self.tags.retain(|t| t.driver != name);
        self.subscriptions
            .retain(|s| s.driver != name && s.app != name);
    }

    fn rename_node(&mut self, old: &str, new: &str) {
        for n in &mut self.nodes {
            if n.name == old {
                n.name = new.to_string();
            }
        }
        for g in &mut self.groups {
            if g.driver == old {
                g.driver = new.to_string();
            }
        }
        for t in &mut self.tags {
            if t.driver == old {
                t.driver = new.to_string();
            }
        }
        for s in &mut self.subscriptions {
            if s.driver == old {
                s.driver = new.to_string();
            }
            if s.app == old {
                s.app = new.to_string();
            }
        }
    }

    fn save_group(&mut self, rec: &GroupRecord) {
        self.groups
            .retain(|g| !(g.driver == rec.driver && g.name == rec.name));
        self.groups.push(rec.clone());
    }

    fn delete_group(&mut self, driver: &str, group: &str) {
        self.groups
            .retain(|g| !(g.driver == driver && g.name == group));
        self.tags
            .retain(|t| !(t.driver == driver && t.group == group));
        self.subscriptions
            .retain(|s| !(s.driver == driver && s.group == group));
    }

    fn rename_group(&mut self, driver: &str, old: &str, new: &str) {
        for g in &mut self.groups {
            if g.driver == driver && g.name == old {
                g.name = new.to_string();
            }
        }
        for t in &mut self.tags {
            if t.driver == driver && t.group == old {
                t.group = new.to_string();
            }
        }
        for s in &mut self.subscriptions {
            if s.driver == driver && s.group == old {
                s.group = new.to_string();
            }
        }
    }

    fn save_tag(&mut self, driver: &str, group: &str, tag: &Tag) {
        self.tags
            .retain(|t| !(t.driver == driver && t.group == group && t.tag.name == tag.name));
        self.tags.push(TagRecord {
            driver: driver.to_string(),
            group: group.to_string(),
            tag: tag.clone(),
        });
    }

    fn delete_tag(&mut self, driver: &str, group: &str, tag: &str) {
        self.tags
            .retain(|t| !(t.driver == driver && t.group == group && t.tag.name == tag));
    }

    fn save_subscription(&mut self, rec: &SubRecord) {
        self.subscriptions.retain(|s| {
            !(s.app == rec.app && s.driver == rec.driver && s.group == rec.group)
        });
        self.subscriptions.push(rec.clone());
    }

    fn delete_subscription(&mut self, app: &str, driver: &str, group: &str) {
        self.subscriptions
            .retain(|s| !(s.app == app && s.driver == driver && s.group == group));
    }
}

/// In-memory store used by tests.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

impl Store for MemStore {
    fn save_node(&self, rec: &NodeRecord) -> Result<()> {
        self.state.lock().save_node(rec);
        Ok(())
    }

    fn delete_node(&self, name: &str) -> Result<()> {
        self.state.lock().delete_node(name);
        Ok(())
    }

    fn rename_node(&self, old: &str, new: &str) -> Result<()> {
        self.state.lock().rename_node(old, new);
        Ok(())
    }

    fn save_group(&self, rec: &GroupRecord) -> Result<()> {
        self.state.lock().save_group(rec);
        Ok(())
    }

    fn delete_group(&self, driver: &str, group: &str) -> Result<()> {
        self.state.lock().delete_group(driver, group);
        Ok(())
    }

    fn rename_group(&self, driver: &str, old: &str, new: &str) -> Result<()> {
        self.state.lock().rename_group(driver, old, new);
        Ok(())
    }

    fn save_tag(&self, driver: &str, group: &str, tag: &Tag) -> Result<()> {
        self.state.lock().save_tag(driver, group, tag);
        Ok(())
    }

    fn delete_tag(&self, driver: &str, group: &str, tag: &str) -> Result<()> {
        self.state.lock().delete_tag(driver, group, tag);
        Ok(())
    }

    fn save_subscription(&self, rec: &SubRecord) -> Result<()> {
        self.state.lock().save_subscription(rec);
        Ok(())
    }

    fn delete_subscription(&self, app: &str, driver: &str, group: &str) -> Result<()> {
        self.state.lock().delete_subscription(app, driver, group);
        Ok(())
    }

    fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.state.lock().nodes.clone())
    }

    fn load_groups(&self, driver: &str) -> Result<Vec<GroupRecord>> {
        Ok(self
            .state
            .lock()
            .groups
            .iter()
            .filter(|g| g.driver == driver)
            .cloned()
            .collect())
    }

    fn load_tags(&self, driver: &str, group: &str) -> Result<Vec<Tag>> {
        Ok(self
            .state
            .lock()
            .tags
            .iter()
            .filter(|t| t.driver == driver && t.group == group)
            .map(|t| t.tag.clone())
            .collect())
    }

    fn load_subscriptions(&self) -> Result<Vec<SubRecord>> {
        Ok(self.state.lock().subscriptions.clone())
    }
}

/// One-document JSON file store.
pub struct JsonStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl JsonStore {
    /// Open (or create) the store document at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<JsonStore> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                tracing::error!("store {}: corrupt document: {}", path.display(), e);
                ErrorCode::EInternal
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => {
                tracing::error!("store {}: {}", path.display(), e);
                return Err(ErrorCode::EInternal);
            }
        };
        Ok(JsonStore {
            path,
            state: Mutex::new(state),
        })
    }

    fn mutate<F: FnOnce(&mut State)>(&self, f: F) -> Result<()> {
        let mut state = self.state.lock();
        f(&mut state);
        let text = serde_json::to_string_pretty(&*state).map_err(|_| ErrorCode::EInternal)?;
        std::fs::write(&self.path, text).map_err(|e| {
            tracing::error!("store {}: write failed: {}", self.path.display(), e);
            ErrorCode::EInternal
        })
    }
}

impl Store for JsonStore {
    fn save_node(&self, rec: &NodeRecord) -> Result<()> {
        self.mutate(|s| s.save_node(rec))
    }

    fn delete_node(&self, name: &str) -> Result<()> {
        self.mutate(|s| s.delete_node(name))
    }

    fn rename_node(&self, old: &str, new: &str) -> Result<()> {
        self.mutate(|s| s.rename_node(old, new))
    }

    fn save_group(&self, rec: &GroupRecord) -> Result<()> {
        self.mutate(|s| s.save_group(rec))
    }

    fn delete_group(&self, driver: &str, group: &str) -> Result<()> {
        self.mutate(|s| s.delete_group(driver, group))
    }

    fn rename_group(&self, driver: &str, old: &str, new: &str) -> Result<()> {
        self.mutate(|s| s.rename_group(driver, old, new))
    }

    fn save_tag(&self, driver: &str, group: &str, tag: &Tag) -> Result<()> {
        self.mutate(|s| s.save_tag(driver, group, tag))
    }

    fn delete_tag(&self, driver: &str, group: &str, tag: &str) -> Result<()> {
        self.mutate(|s| s.delete_tag(driver, group, tag))
    }

    fn save_subscription(&self, rec: &SubRecord) -> Result<()> {
        self.mutate(|s| s.save_subscription(rec))
    }

    fn delete_subscription(&self, app: &str, driver: &str, group: &str) -> Result<()> {
        self.mutate(|s| s.delete_subscription(app, driver, group))
    }

    fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.state.lock().nodes.clone())
    }

    fn load_groups(&self, driver: &str) -> Result<Vec<GroupRecord>> {
        Ok(self
            .state
            .lock()
            .groups
            .iter()
            .filter(|g| g.driver == driver)
            .cloned()
            .collect())
    }

    fn load_tags(&self, driver: &str, group: &str) -> Result<Vec<Tag>> {
        Ok(self
            .state
            .lock()
            .tags
            .iter()
            .filter(|t| t.driver == driver && t.group == group)
            .map(|t| t.tag.clone())
            .collect())
    }

    fn load_subscriptions(&self) -> Result<Vec<SubRecord>> {
        Ok(self.state.lock().subscriptions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{TagAttr, TagType};

    fn node(name: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            kind: NodeKind::Driver,
            plugin: "sim".to_string(),
            setting: None,
            state: RunState::Ready,
        }
    }

    #[test]
    fn test_delete_node_cascades() {
        let store = MemStore::new();
        store.save_node(&node("d1")).unwrap();
        store
            .save_group(&GroupRecord {
                driver: "d1".into(),
                name: "g1".into(),
                interval_ms: 1000,
            })
            .unwrap();
        let tag = Tag::new("t1", "1!400001", TagType::Int16, TagAttr::READ);
        store.save_tag("d1", "g1", &tag).unwrap();
        store
            .save_subscription(&SubRecord {
                app: "a1".into(),
                driver: "d1".into(),
                group: "g1".into(),
                params: None,
            })
            .unwrap();

        store.delete_node("d1").unwrap();
        assert!(store.load_nodes().unwrap().is_empty());
        assert!(store.load_groups("d1").unwrap().is_empty());
        assert!(store.load_tags("d1", "g1").unwrap().is_empty());
        assert!(store.load_subscriptions().unwrap().is_empty());
    }

    #[test]
    fn test_rename_node_cascades() {
        let store = MemStore::new();
        store.save_node(&node("d1")).unwrap();
        store
            .save_group(&GroupRecord {
                driver: "d1".into(),
                name: "g1".into(),
                interval_ms: 500,
            })
            .unwrap();
        store.rename_node("d1", "d2").unwrap();
        assert_eq!(store.load_nodes().unwrap()[0].name, "d2");
        assert_eq!(store.load_groups("d2").unwrap().len(), 1);
        assert!(store.load_groups("d1").unwrap().is_empty());
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = JsonStore::open(&path).unwrap();
            store.save_node(&node("d1")).unwrap();
            let mut tag = Tag::new("t1", "1!400001", TagType::Float, TagAttr::STATIC);
            tag.set_static_value(crate::tag::TagValue::Float(3.14)).unwrap();
            store.save_tag("d1", "g1", &tag).unwrap();
        }
        let store = JsonStore::open(&path).unwrap();
        let nodes = store.load_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].plugin, "sim");
        let tags = store.load_tags("d1", "g1").unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(
            tags[0].static_value(),
            Some(&crate::tag::TagValue::Float(3.14))
        );
    }
}
