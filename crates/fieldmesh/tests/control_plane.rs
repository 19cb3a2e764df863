// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane procedures: batched driver creation with rollback,
//! boot restore from the store, the singleton constraint and the
//! metrics visitor.

use fieldmesh::plugin::monitor;
use fieldmesh::{
    DriverSpec, ErrorCode, GroupSpec, Manager, MemStore, NodeKind, RunState, Store, Tag, TagAttr,
    TagType,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn manager_with(store: Arc<MemStore>) -> Manager {
    let manager = Manager::new(store).expect("manager boot");
    manager.register_builtin_plugins(&[]);
    manager
}

fn spec(name: &str, tags: Vec<Tag>) -> DriverSpec {
    DriverSpec {
        name: name.to_string(),
        plugin: "sim".to_string(),
        setting: None,
        groups: vec![GroupSpec {
            name: "g1".to_string(),
            interval_ms: 500,
            tags,
        }],
    }
}

#[test]
fn test_add_drivers_rolls_back_in_reverse_order() {
    let m = manager_with(Arc::new(MemStore::new()));
    let good = Tag::new("ok", "1!400001", TagType::Int16, TagAttr::READ);
    // Missing station separator: rejected by the sim driver's validator.
    let bad = Tag::new("bad", "400001", TagType::Int16, TagAttr::READ);

    let result = m.add_drivers(&[
        spec("batch_d1", vec![good.clone()]),
        spec("batch_d2", vec![bad]),
    ]);
    assert_eq!(result, Err(ErrorCode::GroupParameterInvalid));

    // Both drivers are gone, including the one that had succeeded.
    assert!(matches!(m.node("batch_d1"), Err(ErrorCode::NodeNotExist)));
    assert!(matches!(m.node("batch_d2"), Err(ErrorCode::NodeNotExist)));

    // The same batch without the poison pill goes through.
    m.add_drivers(&[spec("batch_d1", vec![good])]).unwrap();
    assert_eq!(m.tags("batch_d1", "g1").unwrap().len(), 1);
}

#[test]
fn test_add_drivers_preflight_checks_plugin() {
    let m = manager_with(Arc::new(MemStore::new()));
    let result = m.add_drivers(&[DriverSpec {
        name: "pf_d1".to_string(),
        plugin: "ghost".to_string(),
        setting: None,
        groups: Vec::new(),
    }]);
    assert_eq!(result, Err(ErrorCode::LibraryNotFound));

    // An app plugin cannot back a driver node.
    let result = m.add_drivers(&[DriverSpec {
        name: "pf_d2".to_string(),
        plugin: "sink".to_string(),
        setting: None,
        groups: Vec::new(),
    }]);
    assert_eq!(result, Err(ErrorCode::PluginTypeNotSupport));
}

#[test]
fn test_add_drivers_replaces_existing_node() {
    let m = manager_with(Arc::new(MemStore::new()));
    let tag = Tag::new("t", "1!1", TagType::Uint8, TagAttr::READ);
    m.add_drivers(&[spec("rep_d1", vec![tag.clone()])]).unwrap();
    // Same name again: the pre-existing node is deleted first.
    m.add_drivers(&[spec("rep_d1", vec![tag])]).unwrap();
    assert_eq!(m.nodes(Some(NodeKind::Driver)).len(), 1);
}

#[test]
fn test_restore_from_store() {
    let store = Arc::new(MemStore::new());
    {
        let m = manager_with(Arc::clone(&store));
        m.add_node("rst_d1", NodeKind::Driver, "sim", Some(r#"{"station":1}"#))
            .unwrap();
        m.add_group("rst_d1", "g1", 250).unwrap();
        m.add_tags(
            "rst_d1",
            "g1",
            vec![Tag::new("t1", "1!400001", TagType::Int16, TagAttr::READ)],
        )
        .unwrap();
        m.add_node("rst_a1", NodeKind::App, "sink", None).unwrap();
        m.subscribe("rst_a1", "rst_d1", "g1", Some("p=1")).unwrap();
        m.start_node("rst_d1").unwrap();
        m.shutdown();
    }

    // A fresh control plane restores everything from the same store.
    let m = manager_with(store);
    m.load().unwrap();

    let node = m.node("rst_d1").unwrap();
    assert_eq!(node.plugin, "sim");
    assert_eq!(node.running, RunState::Running, "running state restored");
    assert_eq!(m.node("rst_a1").unwrap().kind, NodeKind::App);

    let groups = m.groups("rst_d1").unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].interval_ms, 250);
    assert_eq!(m.tags("rst_d1", "g1").unwrap().len(), 1);

    let subs = m.subscriptions("rst_a1").unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].params.as_deref(), Some("p=1"));

    assert_eq!(m.node_setting("rst_d1").unwrap().as_deref(), Some(r#"{"station":1}"#));
}

#[test]
fn test_singleton_monitor_constraint() {
    let m = manager_with(Arc::new(MemStore::new()));

    // The singleton must run under its fixed name.
    assert_eq!(
        m.add_node("not_monitor", NodeKind::App, "monitor", None),
        Err(ErrorCode::LibraryNotAllowCreateInstance)
    );
    m.add_node(monitor::NODE_NAME, NodeKind::App, "monitor", None)
        .unwrap();
    // No second instance, and the node is delete-protected.
    assert_eq!(
        m.add_node("monitor2", NodeKind::App, "monitor", None),
        Err(ErrorCode::LibraryNotAllowCreateInstance)
    );
    assert_eq!(
        m.del_node(monitor::NODE_NAME),
        Err(ErrorCode::NodeNotAllowDelete)
    );
}

#[test]
fn test_metrics_visitor_and_exposition() {
    let m = manager_with(Arc::new(MemStore::new()));
    m.add_node("met_d1", NodeKind::Driver, "sim", None).unwrap();
    m.add_group("met_d1", "g1", 100).unwrap();
    m.add_tags(
        "met_d1",
        "g1",
        vec![Tag::new("t1", "1!400001", TagType::Int16, TagAttr::READ)],
    )
    .unwrap();
    m.add_node("met_a1", NodeKind::App, "sink", None).unwrap();
    m.subscribe("met_a1", "met_d1", "g1", None).unwrap();
    m.start_node("met_a1").unwrap();
    m.start_node("met_d1").unwrap();

    // Let a few polls happen.
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut dispatched = 0;
    while dispatched == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
        m.visit_metrics(|view| {
            dispatched = view
                .global
                .iter()
                .find(|e| e.name == "trans_data_dispatched_total")
                .map_or(0, |e| e.value);
        });
    }
    assert!(dispatched > 0, "snapshots must be counted");

    let mut visits = 0;
    m.visit_metrics(|view| {
        visits += 1;
        assert_eq!(view.counts.drivers, 1);
        assert_eq!(view.counts.apps, 1);
        assert_eq!(view.counts.running, 2);
        let d1 = view.nodes.iter().find(|n| n.node == "met_d1").unwrap();
        assert!(d1
            .entries
            .iter()
            .any(|e| e.name == "tag_reads_total" && e.value > 0));
        // The exposition renderer accepts any visitor view.
        let text = monitor::render(view);
        assert!(text.contains("# TYPE fieldmesh_tag_reads_total counter"));
        assert!(text.contains("fieldmesh_nodes{kind=\"driver\"} 1"));
    });
    assert_eq!(visits, 1);
}

#[test]
fn test_group_interval_update_and_rename() {
    let m = manager_with(Arc::new(MemStore::new()));
    m.add_node("upd_d1", NodeKind::Driver, "sim", None).unwrap();
    m.add_group("upd_d1", "slow", 5000).unwrap();
    m.add_node("upd_a1", NodeKind::App, "sink", None).unwrap();
    m.subscribe("upd_a1", "upd_d1", "slow", None).unwrap();

    m.update_group("upd_d1", "slow", Some("fast"), Some(100))
        .unwrap();

    let groups = m.groups("upd_d1").unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, "fast");
    assert_eq!(groups[0].interval_ms, 100);

    // The subscription followed the rename.
    let subs = m.subscriptions("upd_a1").unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].group, "fast");

    assert_eq!(
        m.update_group("upd_d1", "ghost", None, Some(10)),
        Err(ErrorCode::GroupNotExist)
    );

    // Deleting the group drops its subscriptions with it.
    m.del_group("upd_d1", "fast").unwrap();
    assert!(m.subscriptions("upd_a1").unwrap().is_empty());
}

#[test]
fn test_stop_node_halts_polling() {
    let m = manager_with(Arc::new(MemStore::new()));
    m.add_node("hlt_d1", NodeKind::Driver, "sim", None).unwrap();
    m.add_group("hlt_d1", "g1", 50).unwrap();
    m.add_tags(
        "hlt_d1",
        "g1",
        vec![Tag::new("t1", "1!400001", TagType::Int16, TagAttr::READ)],
    )
    .unwrap();
    m.start_node("hlt_d1").unwrap();
    assert_eq!(m.node("hlt_d1").unwrap().running, RunState::Running);

    m.stop_node("hlt_d1").unwrap();
    assert_eq!(m.node("hlt_d1").unwrap().running, RunState::Ready);

    // Stopping twice is idempotent; restarting works.
    m.stop_node("hlt_d1").unwrap();
    m.start_node("hlt_d1").unwrap();
    assert_eq!(m.node("hlt_d1").unwrap().running, RunState::Running);
}

#[test]
fn test_store_reflects_deletes() {
    let store = Arc::new(MemStore::new());
    let m = manager_with(Arc::clone(&store));
    m.add_node("st_d1", NodeKind::Driver, "sim", None).unwrap();
    m.add_group("st_d1", "g1", 100).unwrap();
    m.add_node("st_a1", NodeKind::App, "sink", None).unwrap();
    m.subscribe("st_a1", "st_d1", "g1", None).unwrap();
    assert_eq!(store.load_subscriptions().unwrap().len(), 1);

    m.del_node("st_d1").unwrap();
    assert!(store.load_subscriptions().unwrap().is_empty());
    assert!(store.load_groups("st_d1").unwrap().is_empty());
    assert_eq!(store.load_nodes().unwrap().len(), 1);
}
