//! Breakable locations and active breakpoints.
//!
//! Every executable script line the VM reports becomes a
//! [`BreakableLocation`]: a fixed pairing of a script position and a VM-level
//! code location. Locations live exactly as long as their script. User
//! breakpoints and one-shot step seeds both enable the underlying VM
//! breakpoint request on a location; the table tracks which requests belong
//! to which location so disabling is mechanical.

use std::collections::HashMap;
use std::sync::Arc;

use tern_jdwp::Location;

use crate::script::Script;
use crate::url::ScriptUrl;

/// A 1-based script position. `column` is `None` when the VM reported no
/// column information for the line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScriptLocation {
    pub line: u32,
    pub column: Option<u32>,
}

impl ScriptLocation {
    pub fn new(line: u32, column: Option<u32>) -> Self {
        Self { line, column }
    }
}

#[derive(Clone, Debug)]
pub struct BreakableLocation {
    pub id: String,
    pub script: Arc<Script>,
    pub vm_location: Location,
    pub script_location: ScriptLocation,
}

impl BreakableLocation {
    fn new(script: Arc<Script>, vm_location: Location, script_location: ScriptLocation) -> Self {
        let id = format!(
            "{}:{}:{}",
            script.id(),
            script_location.line,
            script_location.column.unwrap_or(0)
        );
        Self {
            id,
            script,
            vm_location,
            script_location,
        }
    }
}

/// The external view of an enabled breakpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: String,
    pub script_id: String,
    pub location: ScriptLocation,
}

/// One user-visible breakpoint (or one-shot step seed) and the VM requests
/// arming it. A recompiled script line can have several compiled forms, so
/// one breakpoint may hold several requests.
#[derive(Clone, Debug)]
pub struct EnabledBreakpoint {
    pub id: String,
    pub breakable_id: String,
    pub request_ids: Vec<i32>,
    pub vm_locations: Vec<Location>,
    pub one_shot: bool,
}

#[derive(Debug, Default)]
pub struct BreakableLocationTable {
    by_url: HashMap<ScriptUrl, Vec<BreakableLocation>>,
    enabled: HashMap<String, EnabledBreakpoint>,
    next_breakpoint: u64,
}

impl BreakableLocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append locations recovered from one VM class to the script's list.
    /// Recompiled classes contribute additional VM locations for positions
    /// that may already be present; all of them are kept so a breakpoint on
    /// the position can arm every compiled form.
    pub fn add_locations(
        &mut self,
        url: &ScriptUrl,
        script: &Arc<Script>,
        locations: impl IntoIterator<Item = (Location, ScriptLocation)>,
    ) {
        let list = self.by_url.entry(url.clone()).or_default();
        for (vm_location, script_location) in locations {
            if list
                .iter()
                .any(|bl| bl.vm_location == vm_location && bl.script_location == script_location)
            {
                continue;
            }
            list.push(BreakableLocation::new(
                script.clone(),
                vm_location,
                script_location,
            ));
        }
        list.sort_by_key(|bl| (bl.script_location, bl.vm_location.index));
    }

    pub fn for_url(&self, url: &ScriptUrl) -> &[BreakableLocation] {
        self.by_url.get(url).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all(&self) -> impl Iterator<Item = &BreakableLocation> {
        self.by_url.values().flatten()
    }

    /// Exact-match lookup used by `setBreakpoint`. A request without a column
    /// matches the first breakable column on the line.
    pub fn find_exact(&self, url: &ScriptUrl, wanted: ScriptLocation) -> Vec<&BreakableLocation> {
        self.for_url(url)
            .iter()
            .filter(|bl| {
                bl.script_location.line == wanted.line
                    && (wanted.column.is_none() || bl.script_location.column == wanted.column)
            })
            .collect()
    }

    /// All breakable locations of `script_id` in `[from, to)`: every line up
    /// to and including `to.line`, but columns on the end line only strictly
    /// before `to.column`.
    pub fn locations_in_range(
        &self,
        script_id: &str,
        from: ScriptLocation,
        to: Option<ScriptLocation>,
    ) -> Vec<ScriptLocation> {
        let mut out: Vec<ScriptLocation> = self
            .by_url
            .values()
            .flatten()
            .filter(|bl| bl.script.id() == script_id)
            .map(|bl| bl.script_location)
            .filter(|loc| {
                let after_start = loc.line > from.line
                    || (loc.line == from.line
                        && column_of(*loc) >= from.column.map_or(0, |c| c));
                let before_end = match to {
                    None => true,
                    Some(to) => {
                        loc.line < to.line
                            || (loc.line == to.line
                                && to.column.is_some_and(|c| column_of(*loc) < c))
                    }
                };
                after_start && before_end
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn allocate_breakpoint_id(&mut self) -> String {
        self.next_breakpoint += 1;
        format!("bp-{}", self.next_breakpoint)
    }

    pub fn record_enabled(&mut self, breakpoint: EnabledBreakpoint) {
        self.enabled.insert(breakpoint.id.clone(), breakpoint);
    }

    pub fn take_enabled(&mut self, breakpoint_id: &str) -> Option<EnabledBreakpoint> {
        self.enabled.remove(breakpoint_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &EnabledBreakpoint> {
        self.enabled.values()
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }

    /// Remove and return every one-shot breakpoint (step seeds and
    /// pause-at-next-statement arms are cleared wholesale on the next pause).
    pub fn take_one_shots(&mut self) -> Vec<EnabledBreakpoint> {
        let ids: Vec<String> = self
            .enabled
            .values()
            .filter(|bp| bp.one_shot)
            .map(|bp| bp.id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.enabled.remove(&id))
            .collect()
    }

    /// The enabled breakpoint registered for a VM request id, if any.
    pub fn enabled_by_request(&self, request_id: i32) -> Option<&EnabledBreakpoint> {
        self.enabled
            .values()
            .find(|bp| bp.request_ids.contains(&request_id))
    }

    /// The breakable location whose VM location matches, if any.
    pub fn find_by_vm_location(&self, location: &Location) -> Option<&BreakableLocation> {
        self.by_url
            .values()
            .flatten()
            .find(|bl| bl.vm_location == *location)
    }

    pub fn drain_enabled(&mut self) -> Vec<EnabledBreakpoint> {
        self.enabled.drain().map(|(_, bp)| bp).collect()
    }

    pub fn clear(&mut self) {
        self.by_url.clear();
        self.enabled.clear();
    }
}

fn column_of(loc: ScriptLocation) -> u32 {
    loc.column.unwrap_or(1)
}
