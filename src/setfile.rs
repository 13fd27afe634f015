// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;

/// Reference to one tuning-parameter blob: base address and size, as handed
/// over by the setfile loader. The blob itself is external and read-only.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetfileEntry {
    pub base: u64,
    pub size: u32,
}

/// Per-stage scenario → setfile table. Written once at configuration time,
/// read-only thereafter; no frame owns it.
#[derive(Default)]
pub struct SetfileTable {
    entries: HashMap<u32, SetfileEntry>,
}

impl SetfileTable {
    pub fn new() -> SetfileTable {
        SetfileTable::default()
    }

    pub fn load(&mut self, scenario: u32, entry: SetfileEntry) {
        self.entries.insert(scenario, entry);
    }

    pub fn get(&self, scenario: u32) -> Option<SetfileEntry> {
        self.entries.get(&scenario).copied()
    }

    pub fn delete(&mut self, scenario: u32) -> bool {
        self.entries.remove(&scenario).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_lookup_by_scenario() {
        let mut table = SetfileTable::new();
        table.load(2, SetfileEntry { base: 0x4000, size: 256 });
        assert_eq!(table.get(2), Some(SetfileEntry { base: 0x4000, size: 256 }));
        assert_eq!(table.get(3), None);
    }

    #[test]
    fn delete_removes_a_scenario() {
        let mut table = SetfileTable::new();
        table.load(0, SetfileEntry { base: 0x1000, size: 64 });
        assert!(table.delete(0));
        assert!(!table.delete(0));
        assert!(table.get(0).is_none());
    }
}
