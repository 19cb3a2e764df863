// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The manager's subscription table: `(driver, group) -> [{app, params}]`.
//!
//! This is the control-plane view; drivers keep their own dispatch
//! routes, fed by the manager's subscribe/unsubscribe envelopes. Renames
//! of drivers, apps and groups cascade here in place, preserving the
//! identity of every subscription.

use parking_lot::Mutex;
use std::collections::HashMap;

/// One subscriber of a `(driver, group)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubEntry {
    pub app: String,
    pub params: Option<String>,
}

/// Flattened subscription record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubInfo {
    pub app: String,
    pub driver: String,
    pub group: String,
    pub params: Option<String>,
}

/// Subscription table. All mutations run under the manager's lock; the
/// table's own mutex makes reads safe from any thread.
#[derive(Default)]
pub struct SubTable {
    map: Mutex<HashMap<(String, String), Vec<SubEntry>>>,
}

impl SubTable {
    pub fn new() -> SubTable {
        SubTable::default()
    }

    /// Record a subscription. Idempotent on `(app, driver, group)`; a
    /// repeated call updates `params`. Returns `true` when the entry was
    /// new.
    pub fn sub(&self, driver: &str, app: &str, group: &str, params: Option<&str>) -> bool {
        let mut map = self.map.lock();
        let entries = map
            .entry((driver.to_string(), group.to_string()))
            .or_default();
        match entries.iter_mut().find(|e| e.app == app) {
            Some(entry) => {
                entry.params = params.map(str::to_string);
                false
            }
            None => {
                entries.push(SubEntry {
                    app: app.to_string(),
                    params: params.map(str::to_string),
                });
                true
            }
        }
    }

    /// Remove one subscription; removing a missing triple is a no-op.
    pub fn unsub(&self, driver: &str, app: &str, group: &str) {
        let mut map = self.map.lock();
        let key = (driver.to_string(), group.to_string());
        if let Some(entries) = map.get_mut(&key) {
            entries.retain(|e| e.app != app);
            if entries.is_empty() {
                map.remove(&key);
            }
        }
    }

    /// Remove every subscription held by an app; returns what was
    /// removed.
    pub fn unsub_all(&self, app: &str) -> Vec<SubInfo> {
        let mut map = self.map.lock();
        let mut removed = Vec::new();
        map.retain(|(driver, group), entries| {
            entries.retain(|e| {
                if e.app == app {
                    removed.push(SubInfo {
                        app: e.app.clone(),
                        driver: driver.clone(),
                        group: group.clone(),
                        params: e.params.clone(),
                    });
                    false
                } else {
                    true
                }
            });
            !entries.is_empty()
        });
        removed
    }

    /// Remove every subscription under a driver; returns what was
    /// removed.
    pub fn del_driver(&self, driver: &str) -> Vec<SubInfo> {
        let mut map = self.map.lock();
        let mut removed = Vec::new();
        map.retain(|(d, group), entries| {
            if d == driver {
                for e in entries.iter() {
                    removed.push(SubInfo {
                        app: e.app.clone(),
                        driver: d.clone(),
                        group: group.clone(),
                        params: e.params.clone(),
                    });
                }
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove every subscription of one `(driver, group)`.
    pub fn del_group(&self, driver: &str, group: &str) -> Vec<SubInfo> {
        let mut map = self.map.lock();
        match map.remove(&(driver.to_string(), group.to_string())) {
            Some(entries) => entries
                .into_iter()
                .map(|e| SubInfo {
                    app: e.app,
                    driver: driver.to_string(),
                    group: group.to_string(),
                    params: e.params,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Params of one subscription, if present.
    pub fn find(&self, app: &str, driver: &str, group: &str) -> Option<SubEntry> {
        let map = self.map.lock();
        map.get(&(driver.to_string(), group.to_string()))
            .and_then(|entries| entries.iter().find(|e| e.app == app).cloned())
    }

    /// Unique app names subscribed anywhere under a driver.
    pub fn apps_of_driver(&self, driver: &str) -> Vec<String> {
        let map = self.map.lock();
        let mut apps: Vec<String> = Vec::new();
        for ((d, _), entries) in map.iter() {
            if d == driver {
                for e in entries {
                    if !apps.contains(&e.app) {
                        apps.push(e.app.clone());
                    }
                }
            }
        }
        apps.sort();
        apps
    }

    /// Every subscription under a driver.
    pub fn find_by_driver(&self, driver: &str) -> Vec<SubInfo> {
        let map = self.map.lock();
        let mut out = Vec::new();
        for ((d, group), entries) in map.iter() {
            if d == driver {
                for e in entries {
                    out.push(SubInfo {
                        app: e.app.clone(),
                        driver: d.clone(),
                        group: group.clone(),
                        params: e.params.clone(),
                    });
                }
            }
        }
        out
    }

    /// Every subscription held by an app.
    pub fn subs_of_app(&self, app: &str) -> Vec<SubInfo> {
        let map = self.map.lock();
        let mut out = Vec::new();
        for ((driver, group), entries) in map.iter() {
            for e in entries {
                if e.app == app {
                    out.push(SubInfo {
                        app: e.app.clone(),
                        driver: driver.clone(),
                        group: group.clone(),
                        params: e.params.clone(),
                    });
                }
            }
        }
        out
    }

    /// All subscriptions.
    pub fn all(&self) -> Vec<SubInfo> {
        let map = self.map.lock();
        let mut out = Vec::new();
        for ((driver, group), entries) in map.iter() {
            for e in entries {
                out.push(SubInfo {
                    app: e.app.clone(),
                    driver: driver.clone(),
                    group: group.clone(),
                    params: e.params.clone(),
                });
            }
        }
        out
    }

    /// Rename a driver in place.
    pub fn update_driver_name(&self, old: &str, new: &str) {
        let mut map = self.map.lock();
        let keys: Vec<(String, String)> = map
            .keys()
            .filter(|(d, _)| d == old)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entries) = map.remove(&key) {
                map.insert((new.to_string(), key.1), entries);
            }
        }
    }

    /// Rename an app in place.
    pub fn update_app_name(&self, old: &str, new: &str) {
        let mut map = self.map.lock();
        for entries in map.values_mut() {
            for e in entries.iter_mut() {
                if e.app == old {
                    e.app = new.to_string();
                }
            }
        }
    }

    /// Rename a group of one driver in place.
    pub fn update_group_name(&self, driver: &str, old: &str, new: &str) {
        let mut map = self.map.lock();
        let key = (driver.to_string(), old.to_string());
        if let Some(entries) = map.remove(&key) {
            map.insert((driver.to_string(), new.to_string()), entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_is_idempotent_and_updates_params() {
        let table = SubTable::new();
        assert!(table.sub("d1", "a1", "g1", None));
        assert!(!table.sub("d1", "a1", "g1", Some("topic=x")));
        let entry = table.find("a1", "d1", "g1").unwrap();
        assert_eq!(entry.params.as_deref(), Some("topic=x"));
        assert_eq!(table.all().len(), 1);
    }

    #[test]
    fn test_unsub_missing_is_noop() {
        let table = SubTable::new();
        table.unsub("d1", "a1", "g1");
        assert!(table.all().is_empty());
    }

    #[test]
    fn test_driver_rename_cascades() {
        let table = SubTable::new();
        table.sub("d1", "a1", "g1", None);
        table.update_driver_name("d1", "d1b");
        assert!(table.find("a1", "d1b", "g1").is_some());
        assert!(table.find("a1", "d1", "g1").is_none());
    }

    #[test]
    fn test_app_and_group_rename_cascade() {
        let table = SubTable::new();
        table.sub("d1", "a1", "g1", Some("p"));
        table.update_app_name("a1", "a2");
        assert!(table.find("a2", "d1", "g1").is_some());
        table.update_group_name("d1", "g1", "g2");
        let entry = table.find("a2", "d1", "g2").unwrap();
        assert_eq!(entry.params.as_deref(), Some("p"));
    }

    #[test]
    fn test_del_driver_removes_everything() {
        let table = SubTable::new();
        table.sub("d1", "a1", "g1", None);
        table.sub("d1", "a2", "g2", None);
        table.sub("d2", "a1", "g1", None);
        let removed = table.del_driver("d1");
        assert_eq!(removed.len(), 2);
        assert!(table.find_by_driver("d1").is_empty());
        assert_eq!(table.find_by_driver("d2").len(), 1);
    }

    #[test]
    fn test_apps_of_driver_unique() {
        let table = SubTable::new();
        table.sub("d1", "a1", "g1", None);
        table.sub("d1", "a1", "g2", None);
        table.sub("d1", "a2", "g1", None);
        assert_eq!(table.apps_of_driver("d1"), vec!["a1", "a2"]);
    }

    #[test]
    fn test_unsub_all_reports_removed() {
        let table = SubTable::new();
        table.sub("d1", "a1", "g1", None);
        table.sub("d2", "a1", "g1", None);
        table.sub("d2", "a2", "g1", None);
        let removed = table.unsub_all("a1");
        assert_eq!(removed.len(), 2);
        assert_eq!(table.all().len(), 1);
    }
}
