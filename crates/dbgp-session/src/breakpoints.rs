use std::collections::BTreeMap;

use serde::Serialize;

pub type BreakpointId = u64;

/// A line breakpoint as registered by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub id: BreakpointId,
    /// Path as given by the caller (usually relative to the project root).
    pub local_file: String,
    /// Debuggee path, or `None` when no mapping rule matched.
    pub remote_file: Option<String>,
    pub line: u32,
    pub condition: Option<String>,
    pub installed: bool,
    /// Id the debugger engine assigned when it accepted the breakpoint.
    pub engine_id: Option<String>,
    /// Engine's rejection message, if installation was attempted and failed.
    pub install_error: Option<String>,
}

impl Breakpoint {
    /// Not yet sent to the engine for the current connection.
    pub fn is_pending(&self) -> bool {
        !self.installed && self.install_error.is_none()
    }
}

/// Breakpoints keyed by id. Ids are handed out in increasing order and never
/// reused, so iteration order is registration order.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    next_id: BreakpointId,
    entries: BTreeMap<BreakpointId, Breakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        local_file: String,
        remote_file: Option<String>,
        line: u32,
        condition: Option<String>,
    ) -> Breakpoint {
        self.next_id += 1;
        let breakpoint = Breakpoint {
            id: self.next_id,
            local_file,
            remote_file,
            line,
            condition,
            installed: false,
            engine_id: None,
            install_error: None,
        };
        self.entries.insert(breakpoint.id, breakpoint.clone());
        breakpoint
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.entries.get(&id)
    }

    pub fn list(&self) -> Vec<Breakpoint> {
        self.entries.values().cloned().collect()
    }

    /// Breakpoints still waiting to be sent, in registration order.
    pub fn pending(&self) -> Vec<Breakpoint> {
        self.entries
            .values()
            .filter(|bp| bp.is_pending())
            .cloned()
            .collect()
    }

    pub fn mark_installed(&mut self, id: BreakpointId, engine_id: Option<String>) -> Option<Breakpoint> {
        let bp = self.entries.get_mut(&id)?;
        bp.installed = true;
        bp.engine_id = engine_id;
        bp.install_error = None;
        Some(bp.clone())
    }

    pub fn mark_failed(&mut self, id: BreakpointId, message: String) -> Option<Breakpoint> {
        let bp = self.entries.get_mut(&id)?;
        bp.installed = false;
        bp.engine_id = None;
        bp.install_error = Some(message);
        Some(bp.clone())
    }

    pub fn remove(&mut self, id: BreakpointId) -> Option<Breakpoint> {
        self.entries.remove(&id)
    }

    /// Forget everything the previous connection knew; every breakpoint
    /// becomes pending again.
    pub fn reset_installation(&mut self) {
        for bp in self.entries.values_mut() {
            bp.installed = false;
            bp.engine_id = None;
            bp.install_error = None;
        }
    }

    /// Drop all breakpoints. Ids keep increasing afterwards.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
