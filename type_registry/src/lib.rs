#![cfg_attr(not(test), no_std)]
//! Type cache registry: the weak, per-type/per-module directory of
//! dependent cache entries, and the invalidation walk that poisons them
//! on mutation.
//!
//! The directory never owns the entries it lists — it threads its
//! dependency list directly through each entry's embedded
//! [`intrusive_linked_list::IntrusiveLinkedList`] node, the same `push` /
//! `pop` / `remove_if` API used elsewhere in the workspace for allocator
//! free-lists. No extra allocation is needed per dependency edge.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use host_iface::EntityId;
use intrusive_linked_list::IntrusiveLinkedList;
use shape_cache::{EntrySlot, FieldCacheEntry, InstanceAttrEntry};

/// Per-type (or per-module) weak cache directory.
pub struct Directory {
    /// Monotonically increasing on every relevant mutation.
    pub invalidate_count: u64,
    /// Back-link to the metatype's own directory id, if this owner is
    /// itself a subclass of a type.
    pub metatype: Option<EntityId>,
    instance_deps: IntrusiveLinkedList,
    field_deps: IntrusiveLinkedList,
}

impl Directory {
    fn new() -> Self {
        Directory {
            invalidate_count: 0,
            metatype: None,
            instance_deps: IntrusiveLinkedList::new(),
            field_deps: IntrusiveLinkedList::new(),
        }
    }
}

/// Process-wide weak map from type/module identity to its [`Directory`].
/// Created lazily on first specialization touching a given owner.
pub struct Registry {
    directories: BTreeMap<EntityId, Directory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Registry {
            directories: BTreeMap::new(),
        }
    }

    /// Returns the directory for `owner`, creating an empty one if none
    /// exists yet.
    pub fn get_or_create(&mut self, owner: EntityId) -> &mut Directory {
        self.directories.entry(owner).or_insert_with(Directory::new)
    }

    /// Looks up the directory for `owner` without creating one.
    #[must_use]
    pub fn find(&self, owner: EntityId) -> Option<&Directory> {
        self.directories.get(&owner)
    }

    #[must_use]
    pub fn invalidate_count(&self, owner: EntityId) -> u64 {
        self.directories.get(&owner).map_or(0, |d| d.invalidate_count)
    }

    /// Records that `entry` depends on `owner`. `entry` must already be
    /// at its final, stable heap address (inside a shadow arena's
    /// table).
    pub fn record_instance_dependency(&mut self, owner: EntityId, entry: &mut InstanceAttrEntry) {
        let ptr = core::ptr::from_mut(entry) as usize;
        let dir = self.get_or_create(owner);
        unsafe { dir.instance_deps.push(ptr) };
    }

    /// Same as [`Registry::record_instance_dependency`] for a
    /// [`FieldCacheEntry`].
    pub fn record_field_dependency(&mut self, owner: EntityId, entry: &mut FieldCacheEntry) {
        let ptr = core::ptr::from_mut(entry) as usize;
        let dir = self.get_or_create(owner);
        unsafe { dir.field_deps.push(ptr) };
    }

    /// Removes a single entry from `owner`'s dependency list without
    /// invalidating it. Called by a shadow arena's `clear` just before it
    /// frees the entry, so the directory can never retain a dangling
    /// link into freed memory.
    pub fn unlink_instance(&mut self, owner: EntityId, entry: &InstanceAttrEntry) {
        if let Some(dir) = self.directories.get_mut(&owner) {
            dir.instance_deps
                .remove_if(core::ptr::from_ref(entry) as usize);
        }
    }

    /// Same as [`Registry::unlink_instance`] for a [`FieldCacheEntry`].
    pub fn unlink_field(&mut self, owner: EntityId, entry: &FieldCacheEntry) {
        if let Some(dir) = self.directories.get_mut(&owner) {
            dir.field_deps
                .remove_if(core::ptr::from_ref(entry) as usize);
        }
    }

    /// Walks every entry that depends on `owner`, poisons it, and returns
    /// the arena sites that must be reverted to the generic opcode.
    /// Idempotent cost-wise: a second call with no intervening
    /// specialization just walks an already-empty list.
    pub fn invalidate(&mut self, owner: EntityId) -> Vec<EntrySlot> {
        let mut sites = Vec::new();
        let Some(dir) = self.directories.get_mut(&owner) else {
            return sites;
        };
        dir.invalidate_count += 1;
        while let Some(addr) = dir.instance_deps.pop() {
            let entry = unsafe { &mut *(addr as *mut InstanceAttrEntry) };
            entry.invalidate();
            if let Some(site) = entry.site {
                sites.push(site);
            }
        }
        while let Some(addr) = dir.field_deps.pop() {
            let entry = unsafe { &mut *(addr as *mut FieldCacheEntry) };
            entry.invalidate();
            if let Some(site) = entry.site {
                sites.push(site);
            }
        }
        sites
    }

    /// The owner itself has been finalized. Every entry that depended on
    /// it must already have been unlinked by its owning arena's `clear`.
    pub fn on_finalized(&mut self, owner: EntityId) {
        self.directories.remove(&owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_iface::{TypeRef, Value};
    use shape_cache::{AccessKind, Shape};

    fn type_ref(id: u64) -> TypeRef {
        TypeRef(Value::from_int(id as i64))
    }

    #[test]
    fn invalidate_count_is_monotonic() {
        let mut reg = Registry::new();
        reg.get_or_create(1);
        assert_eq!(reg.invalidate_count(1), 0);
        reg.invalidate(1);
        reg.invalidate(1);
        assert_eq!(reg.invalidate_count(1), 2);
    }

    #[test]
    fn invalidate_poisons_dependent_entry() {
        let mut reg = Registry::new();
        let ty = type_ref(7);
        let mut entry = InstanceAttrEntry::new("foo".into(), ty, Shape::Slot, AccessKind::Attr);
        reg.record_instance_dependency(7, &mut entry);
        assert!(entry.is_valid());
        let sites = reg.invalidate(7);
        assert!(entry.ty.is_none());
        assert!(sites.is_empty()); // entry.site was never set in this test
        assert_eq!(reg.invalidate_count(7), 1);
    }

    #[test]
    fn unlink_before_free_avoids_dangling_walk() {
        let mut reg = Registry::new();
        let ty = type_ref(3);
        {
            let mut entry = InstanceAttrEntry::new("x".into(), ty, Shape::Slot, AccessKind::Attr);
            reg.record_instance_dependency(3, &mut entry);
            reg.unlink_instance(3, &entry);
        } // entry dropped here; directory must hold no link into it.
        let sites = reg.invalidate(3);
        assert!(sites.is_empty());
    }

    #[test]
    fn find_does_not_allocate_a_missing_directory() {
        let reg = Registry::new();
        assert!(reg.find(42).is_none());
    }
}
