// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Set of GUIDs known to be shared by more than one node.
//!
//! Nodes whose GUID is in this set only ever get a dummy registry entry, so that the two
//! colliding devices aren't endlessly probed and confused with each other. Entries never expire
//! on their own.

use crate::node_id::{Generation, Guid};

use alloc::vec::Vec;
use fnv::FnvBuildHasher;
use hashbrown::{hash_map::Entry, HashMap};

#[derive(Debug, Default)]
pub struct DuplicateGuids {
    /// GUID to the last generation in which the collision was seen.
    entries: HashMap<Guid, Generation, FnvBuildHasher>,
}

impl DuplicateGuids {
    pub fn new() -> DuplicateGuids {
        DuplicateGuids::default()
    }

    /// Records a collision. Returns `true` if the GUID wasn't known yet.
    ///
    /// Recording the same GUID again only updates its last-seen generation.
    pub fn record(&mut self, guid: Guid, generation: Generation) -> bool {
        match self.entries.entry(guid) {
            Entry::Occupied(mut e) => {
                *e.get_mut() = generation;
                false
            }
            Entry::Vacant(e) => {
                e.insert(generation);
                true
            }
        }
    }

    pub fn contains(&self, guid: Guid) -> bool {
        self.entries.contains_key(&guid)
    }

    pub fn last_seen(&self, guid: Guid) -> Option<Generation> {
        self.entries.get(&guid).copied()
    }

    /// Forgets about a GUID. Returns `false` if it wasn't known.
    pub fn remove(&mut self, guid: Guid) -> bool {
        self.entries.remove(&guid).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the known duplicates, sorted by GUID.
    pub fn to_vec(&self) -> Vec<(Guid, Generation)> {
        let mut out: Vec<_> = self.entries.iter().map(|(g, gen)| (*g, *gen)).collect();
        out.sort();
        out
    }
}

/// Finds the GUIDs appearing more than once among `guids`, or equal to `local`.
///
/// Invalid GUIDs are ignored.
pub fn find_collisions(guids: impl Iterator<Item = Guid>, local: Guid) -> Vec<Guid> {
    let mut seen = HashMap::<Guid, u32, FnvBuildHasher>::default();
    for guid in guids.filter(|g| g.is_valid()) {
        *seen.entry(guid).or_insert(0) += 1;
    }

    let mut out: Vec<Guid> = seen
        .into_iter()
        .filter(|(guid, count)| *count > 1 || *guid == local)
        .map(|(guid, _)| guid)
        .collect();
    out.sort();
    out
}
