#![cfg_attr(not(test), no_std)]
//! Shadow code arena: the per-code-object owner of every specialized
//! cache site for that code object's bytecode.
//!
//! Table entries whose address is taken for an intrusive dependency link
//! ([`shape_cache::InstanceAttrEntry`], [`shape_cache::FieldCacheEntry`],
//! [`shape_cache::PolymorphicEntry`]) are always boxed, never stored by
//! value in a growable `Vec`: a `Vec` reallocation on growth would move
//! the entry and dangle any address a type directory already holds.
//! Entries nothing ever links to ([`shape_cache::GlobalCacheEntry`], the
//! cast cache) stay unboxed.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use host_iface::{CodeBuffer, EntityId, TypeRef};
use shape_cache::{
    AccessKind, ArenaId, Entry, EntrySlot, FieldCacheEntry, GlobalCacheEntry, InstanceAttrEntry,
    ModuleAttrEntry, PolymorphicEntry, Shape, TableKind,
};
use type_registry::Registry;

/// Once a monomorphic site has missed this many times in a row without a
/// successful specialization sticking, the dispatcher stops trying and
/// reverts the site to the fully generic opcode for good.
pub const RESPECIALIZE_LIMIT: u32 = 50;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Errors a shadow arena's mutating operations can report.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum ArenaError {
    /// A table already holds as many live entries as the bytecode's
    /// single-byte operand can index (256).
    TableFull,
    /// `index` does not name a live slot in the requested table.
    NoSuchSlot,
}

impl core::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ArenaError::TableFull => f.write_str("shadow arena table is full"),
            ArenaError::NoSuchSlot => f.write_str("no live entry at that slot"),
        }
    }
}

impl core::error::Error for ArenaError {}

/// The L1 (monomorphic) cache table holds either an instance-attribute
/// entry or a module-attribute entry at each site, never both.
pub enum L1Slot {
    Instance(Box<InstanceAttrEntry>),
    Module(Box<ModuleAttrEntry>),
}

/// A single code object's shadow cache tables. One arena is created per
/// code object the first time any of its sites is specialized.
pub struct Arena<C: CodeBuffer> {
    id: ArenaId,
    code: C,
    globals: Vec<GlobalCacheEntry>,
    l1_cache: Vec<L1Slot>,
    polymorphic_caches: Vec<Box<PolymorphicEntry>>,
    cast_cache: Vec<TypeRef>,
    field_caches: Vec<Box<FieldCacheEntry>>,
    /// How many times each bytecode offset has been respecialized after
    /// an invalidation reverted it, so a perpetually-invalidated site can
    /// eventually give up.
    respecialize_counts: BTreeMap<usize, u32>,
}

impl<C: CodeBuffer> Arena<C> {
    #[must_use]
    pub fn new(code: C) -> Self {
        Arena {
            id: ArenaId(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed)),
            code,
            globals: Vec::new(),
            l1_cache: Vec::new(),
            polymorphic_caches: Vec::new(),
            cast_cache: Vec::new(),
            field_caches: Vec::new(),
            respecialize_counts: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    #[must_use]
    pub fn code(&self) -> &C {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut C {
        &mut self.code
    }

    /// Installs a new monomorphic instance-attribute entry, linking it
    /// into `registry` under `owner` and recording its site so future
    /// invalidation can find it.
    pub fn push_instance_entry(
        &mut self,
        registry: &mut Registry,
        owner: EntityId,
        mut entry: InstanceAttrEntry,
        ip: usize,
        generic_opcode: u8,
    ) -> Result<usize, ArenaError> {
        if self.l1_cache.len() >= 256 {
            return Err(ArenaError::TableFull);
        }
        let index = self.l1_cache.len();
        entry.owner_id = Some(owner);
        entry.site = Some(EntrySlot {
            arena: self.id,
            table: TableKind::L1,
            index,
            poly_slot: None,
            ip,
            generic_opcode,
        });
        let mut boxed = Box::new(entry);
        registry.record_instance_dependency(owner, &mut boxed);
        self.l1_cache.push(L1Slot::Instance(boxed));
        self.respecialize_counts.remove(&ip);
        Ok(index)
    }

    pub fn push_module_entry(
        &mut self,
        entry: ModuleAttrEntry,
    ) -> Result<usize, ArenaError> {
        if self.l1_cache.len() >= 256 {
            return Err(ArenaError::TableFull);
        }
        let index = self.l1_cache.len();
        self.l1_cache.push(L1Slot::Module(Box::new(entry)));
        Ok(index)
    }

    #[must_use]
    pub fn l1_entry(&self, index: usize) -> Option<&L1Slot> {
        self.l1_cache.get(index)
    }

    pub fn l1_entry_mut(&mut self, index: usize) -> Option<&mut L1Slot> {
        self.l1_cache.get_mut(index)
    }

    pub fn push_global_entry(&mut self, entry: GlobalCacheEntry) -> Result<usize, ArenaError> {
        if self.globals.len() >= 256 {
            return Err(ArenaError::TableFull);
        }
        let index = self.globals.len();
        self.globals.push(entry);
        Ok(index)
    }

    #[must_use]
    pub fn global_entry(&self, index: usize) -> Option<&GlobalCacheEntry> {
        self.globals.get(index)
    }

    pub fn global_entry_mut(&mut self, index: usize) -> Option<&mut GlobalCacheEntry> {
        self.globals.get_mut(index)
    }

    pub fn push_field_entry(
        &mut self,
        registry: &mut Registry,
        owner: EntityId,
        mut entry: FieldCacheEntry,
        ip: usize,
        generic_opcode: u8,
    ) -> Result<usize, ArenaError> {
        if self.field_caches.len() >= 256 {
            return Err(ArenaError::TableFull);
        }
        let index = self.field_caches.len();
        entry.owner_id = Some(owner);
        entry.site = Some(EntrySlot {
            arena: self.id,
            table: TableKind::Field,
            index,
            poly_slot: None,
            ip,
            generic_opcode,
        });
        let mut boxed = Box::new(entry);
        registry.record_field_dependency(owner, &mut boxed);
        self.field_caches.push(boxed);
        self.respecialize_counts.remove(&ip);
        Ok(index)
    }

    #[must_use]
    pub fn field_entry(&self, index: usize) -> Option<&FieldCacheEntry> {
        self.field_caches.get(index)
    }

    pub fn field_entry_mut(&mut self, index: usize) -> Option<&mut FieldCacheEntry> {
        self.field_caches.get_mut(index)
    }

    pub fn push_polymorphic_table(&mut self) -> Result<usize, ArenaError> {
        if self.polymorphic_caches.len() >= 256 {
            return Err(ArenaError::TableFull);
        }
        let index = self.polymorphic_caches.len();
        self.polymorphic_caches.push(Box::new(PolymorphicEntry::new()));
        Ok(index)
    }

    #[must_use]
    pub fn polymorphic_table(&self, index: usize) -> Option<&PolymorphicEntry> {
        self.polymorphic_caches.get(index)
    }

    pub fn polymorphic_table_mut(&mut self, index: usize) -> Option<&mut PolymorphicEntry> {
        self.polymorphic_caches.get_mut(index)
    }

    /// Promotes a monomorphic L1 slot into a fresh polymorphic table,
    /// reusing the existing entry as the table's slot 0 and linking the
    /// new `other` entry alongside it. Returns the polymorphic table's
    /// index; the caller is responsible for rewriting the bytecode to
    /// point at it.
    pub fn promote_to_polymorphic(
        &mut self,
        registry: &mut Registry,
        l1_index: usize,
        other_owner: EntityId,
        mut other: InstanceAttrEntry,
    ) -> Result<usize, ArenaError> {
        let existing = match self.l1_cache.get_mut(l1_index) {
            Some(L1Slot::Instance(entry)) => Box::as_mut(entry),
            _ => return Err(ArenaError::NoSuchSlot),
        };
        if let Some(owner) = existing.owner_id {
            registry.unlink_instance(owner, existing);
        }
        // The site keeps pointing at the same bytecode offset and the same
        // original generic opcode; only the table it indexes changes.
        let (ip, generic_opcode) = existing
            .site
            .map_or((0, 0), |s| (s.ip, s.generic_opcode));
        let existing_owned = core::mem::replace(
            existing,
            InstanceAttrEntry::new(
                alloc::string::String::new().into_boxed_str(),
                TypeRef(host_iface::Value::NULL),
                Shape::Slot,
                AccessKind::Attr,
            ),
        );
        let table_index = self.push_polymorphic_table()?;
        let table = self.polymorphic_caches[table_index].as_mut();
        let (slot0, _) = table.insert(existing_owned);
        if let Some(owner) = table.slots()[slot0].as_ref().and_then(|e| e.owner_id) {
            self.relink_polymorphic_slot(registry, owner, table_index, slot0, ip, generic_opcode);
        }

        other.owner_id = Some(other_owner);
        let (slot1, _evicted) = table.insert(other);
        self.relink_polymorphic_slot(registry, other_owner, table_index, slot1, ip, generic_opcode);

        Ok(table_index)
    }

    /// Inserts a new entry into an already-polymorphic table (a site that
    /// has already promoted past a single monomorphic entry), relinking it
    /// into `registry` and unlinking whichever entry FIFO eviction dropped,
    /// if the table was already at its 4-slot capacity.
    pub fn insert_into_polymorphic(
        &mut self,
        registry: &mut Registry,
        table_index: usize,
        owner: EntityId,
        mut entry: InstanceAttrEntry,
    ) -> Result<usize, ArenaError> {
        let (ip, generic_opcode) = self
            .polymorphic_caches
            .get(table_index)
            .and_then(|t| {
                t.slots()
                    .iter()
                    .flatten()
                    .find_map(|e| e.site.map(|s| (s.ip, s.generic_opcode)))
            })
            .unwrap_or((0, 0));
        entry.owner_id = Some(owner);
        let table = self
            .polymorphic_caches
            .get_mut(table_index)
            .ok_or(ArenaError::NoSuchSlot)?;
        let (slot, evicted) = table.insert(entry);
        if let Some(evicted) = evicted {
            if let Some(evicted_owner) = evicted.owner_id {
                registry.unlink_instance(evicted_owner, &evicted);
            }
        }
        self.relink_polymorphic_slot(registry, owner, table_index, slot, ip, generic_opcode);
        Ok(slot)
    }

    fn relink_polymorphic_slot(
        &mut self,
        registry: &mut Registry,
        owner: EntityId,
        table_index: usize,
        slot: usize,
        ip: usize,
        generic_opcode: u8,
    ) {
        let table = self.polymorphic_caches[table_index].as_mut();
        if let Some(entry) = table.slots_mut()[slot].as_mut() {
            entry.site = Some(EntrySlot {
                arena: self.id,
                table: TableKind::Polymorphic,
                index: table_index,
                poly_slot: Some(slot as u8),
                ip,
                generic_opcode,
            });
            registry.record_instance_dependency(owner, entry);
        }
    }

    pub fn push_cast_entry(&mut self, ty: TypeRef) -> Result<usize, ArenaError> {
        if self.cast_cache.len() >= 256 {
            return Err(ArenaError::TableFull);
        }
        let index = self.cast_cache.len();
        self.cast_cache.push(ty);
        Ok(index)
    }

    #[must_use]
    pub fn cast_entry(&self, index: usize) -> Option<TypeRef> {
        self.cast_cache.get(index).copied()
    }

    /// Rewrites the instruction at `site.ip` back to `site.generic_opcode`,
    /// the fully generic, unspecialized form of the opcode family. Called
    /// once per site an invalidation walk returns.
    pub fn revert_to_generic(&mut self, site: EntrySlot) {
        debug_assert_eq!(site.arena, self.id);
        self.code.write(site.ip, site.generic_opcode, 0);
    }

    /// Records a failed respecialization attempt at `ip`, returning
    /// `true` once the site has exceeded [`RESPECIALIZE_LIMIT`] and
    /// should no longer be retried.
    pub fn bump_respecialize(&mut self, ip: usize) -> bool {
        let count = self.respecialize_counts.entry(ip).or_insert(0);
        *count += 1;
        *count > RESPECIALIZE_LIMIT
    }

    #[must_use]
    pub fn respecialize_count(&self, ip: usize) -> u32 {
        self.respecialize_counts.get(&ip).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn should_give_up(&self, ip: usize) -> bool {
        self.respecialize_count(ip) > RESPECIALIZE_LIMIT
    }

    /// Tears down every table, unlinking every intrusively-linked entry
    /// from `registry` first so the registry never walks into freed
    /// memory. The code object owning this arena is being finalized.
    pub fn clear(mut self, registry: &mut Registry) {
        for slot in &mut self.l1_cache {
            if let L1Slot::Instance(entry) = slot {
                if let Some(owner) = entry.owner_id {
                    registry.unlink_instance(owner, entry);
                }
            }
        }
        for entry in &mut self.field_caches {
            if let Some(owner) = entry.owner_id {
                registry.unlink_field(owner, entry);
            }
        }
        for table in &mut self.polymorphic_caches {
            for entry in table.slots_mut().iter_mut().flatten() {
                if let Some(owner) = entry.owner_id {
                    registry.unlink_instance(owner, entry);
                }
            }
        }
    }
}

/// Converts an arena table entry reference into the generic [`Entry`]
/// view used by invalidation-adjacent code that doesn't care which table
/// it came from.
#[must_use]
pub fn as_entry(slot: &L1Slot) -> Entry {
    match slot {
        L1Slot::Instance(e) => Entry::Instance(InstanceAttrEntry {
            link: intrusive_linked_list::IntrusiveLinkedList::new(),
            name: e.name.clone(),
            ty: e.ty,
            owner_id: e.owner_id,
            descriptor: e.descriptor,
            is_data_descriptor: e.is_data_descriptor,
            shape: e.shape,
            kind: e.kind,
            dict_offset: e.dict_offset,
            split_index: e.split_index,
            keys_id: e.keys_id,
            nentries: e.nentries,
            slot_offset: e.slot_offset,
            site: e.site,
        }),
        L1Slot::Module(e) => Entry::Module(ModuleAttrEntry {
            name: e.name.clone(),
            module_id: e.module_id,
            module_dict_version: e.module_dict_version,
            value: e.value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_iface::Value;

    struct FakeCode {
        units: Vec<(u8, u8)>,
    }

    impl FakeCode {
        fn new(len: usize) -> Self {
            FakeCode {
                units: alloc::vec![(0u8, 0u8); len],
            }
        }
    }

    impl CodeBuffer for FakeCode {
        fn len(&self) -> usize {
            self.units.len()
        }
        fn read(&self, ip: usize) -> (u8, u8) {
            self.units[ip]
        }
        fn write(&mut self, ip: usize, opcode: u8, operand: u8) {
            self.units[ip] = (opcode, operand);
        }
    }

    fn type_ref(id: u64) -> TypeRef {
        TypeRef(Value::from_int(id as i64))
    }

    #[test]
    fn push_instance_entry_links_into_registry() {
        let mut arena = Arena::new(FakeCode::new(4));
        let mut registry = Registry::new();
        let entry = InstanceAttrEntry::new(
            "x".into(),
            type_ref(1),
            Shape::Slot,
            AccessKind::Attr,
        );
        let idx = arena
            .push_instance_entry(&mut registry, 1, entry, 0, 0x10)
            .unwrap();
        assert_eq!(idx, 0);
        let sites = registry.invalidate(1);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].table, TableKind::L1);
    }

    #[test]
    fn clear_unlinks_without_dangling() {
        let mut arena = Arena::new(FakeCode::new(4));
        let mut registry = Registry::new();
        let entry = InstanceAttrEntry::new(
            "y".into(),
            type_ref(2),
            Shape::DictNoDescr,
            AccessKind::Attr,
        );
        arena
            .push_instance_entry(&mut registry, 2, entry, 0, 0x10)
            .unwrap();
        arena.clear(&mut registry);
        let sites = registry.invalidate(2);
        assert!(sites.is_empty());
    }

    #[test]
    fn table_full_after_256_entries() {
        let mut arena = Arena::new(FakeCode::new(1));
        let mut registry = Registry::new();
        for i in 0..256u64 {
            let entry = InstanceAttrEntry::new(
                "z".into(),
                type_ref(i),
                Shape::Slot,
                AccessKind::Attr,
            );
            arena
                .push_instance_entry(&mut registry, i, entry, 0, 0x10)
                .unwrap();
        }
        let overflow = InstanceAttrEntry::new(
            "z".into(),
            type_ref(999),
            Shape::Slot,
            AccessKind::Attr,
        );
        assert_eq!(
            arena.push_instance_entry(&mut registry, 999, overflow, 0, 0x10),
            Err(ArenaError::TableFull)
        );
    }

    #[test]
    fn promote_to_polymorphic_preserves_both_entries() {
        let mut arena = Arena::new(FakeCode::new(4));
        let mut registry = Registry::new();
        let first = InstanceAttrEntry::new(
            "a".into(),
            type_ref(10),
            Shape::DictNoDescr,
            AccessKind::Attr,
        );
        let l1_index = arena
            .push_instance_entry(&mut registry, 10, first, 0, 0x10)
            .unwrap();
        let second = InstanceAttrEntry::new(
            "a".into(),
            type_ref(11),
            Shape::DictNoDescr,
            AccessKind::Attr,
        );
        let table_index = arena
            .promote_to_polymorphic(&mut registry, l1_index, 11, second)
            .unwrap();
        let table = arena.polymorphic_table(table_index).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.slots()[0].as_ref().is_some_and(|e| e.ty == Some(type_ref(10))));
        assert!(table.slots()[1].as_ref().is_some_and(|e| e.ty == Some(type_ref(11))));
    }

    #[test]
    fn respecialize_limit_trips_after_fifty() {
        let mut arena = Arena::new(FakeCode::new(1));
        for _ in 0..RESPECIALIZE_LIMIT {
            assert!(!arena.bump_respecialize(0));
        }
        assert!(arena.bump_respecialize(0));
        assert!(arena.should_give_up(0));
    }
}
