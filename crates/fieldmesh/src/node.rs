// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node-level vocabulary shared by the bus, plugins and adapters.

use serde::{Deserialize, Serialize};

/// Administrative kind of a node: southbound driver or northbound app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeKind {
    Driver,
    App,
}

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Init,
    Ready,
    Running,
    Stopped,
}

/// Southbound/northbound connection state, reported by the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl RunState {
    fn as_u8(self) -> u8 {
        match self {
            RunState::Init => 0,
            RunState::Ready => 1,
            RunState::Running => 2,
            RunState::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> RunState {
        match v {
            1 => RunState::Ready,
            2 => RunState::Running,
            3 => RunState::Stopped,
            _ => RunState::Init,
        }
    }
}

impl LinkState {
    fn as_u8(self) -> u8 {
        match self {
            LinkState::Disconnected => 0,
            LinkState::Connecting => 1,
            LinkState::Connected => 2,
        }
    }

    fn from_u8(v: u8) -> LinkState {
        match v {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }
}

/// Lock-free mirror of an adapter's states, readable from any thread
/// (metrics visitor, manager) while the reactor thread owns the
/// transitions.
#[derive(Debug, Default)]
pub struct StateCell {
    running: std::sync::atomic::AtomicU8,
    link: std::sync::atomic::AtomicU8,
}

impl StateCell {
    pub fn new() -> StateCell {
        StateCell::default()
    }

    pub fn running(&self) -> RunState {
        RunState::from_u8(self.running.load(std::sync::atomic::Ordering::Acquire))
    }

    pub fn set_running(&self, state: RunState) {
        self.running
            .store(state.as_u8(), std::sync::atomic::Ordering::Release);
    }

    pub fn link(&self) -> LinkState {
        LinkState::from_u8(self.link.load(std::sync::atomic::Ordering::Acquire))
    }

    pub fn set_link(&self, state: LinkState) {
        self.link
            .store(state.as_u8(), std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_round_trip() {
        let cell = StateCell::new();
        assert_eq!(cell.running(), RunState::Init);
        cell.set_running(RunState::Running);
        assert_eq!(cell.running(), RunState::Running);
        cell.set_link(LinkState::Connected);
        assert_eq!(cell.link(), LinkState::Connected);
    }
}
