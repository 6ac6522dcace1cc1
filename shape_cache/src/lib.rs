#![cfg_attr(not(test), no_std)]
//! Cache entry kinds: the per-site records a shadow arena stores once a
//! `LOAD_ATTR` / `LOAD_METHOD` / `STORE_ATTR` / `LOAD_GLOBAL` site has been
//! specialized.
//!
//! Each entry is a plain data record; the behaviors that need the object
//! model (`load_attr`, `load_method`, `store_attr`) live in the `fastpath`
//! crate, which matches on [`Entry`] rather than using runtime
//! inheritance. The one behavior that needs no object model at all,
//! `invalidate`, lives here.

extern crate alloc;

use alloc::boxed::Box;
use intrusive_linked_list::IntrusiveLinkedList;

pub use host_iface::{DescriptorKind, KeysId, TypeRef, Value};

/// Which of the seven concrete instance-attribute shapes an entry was
/// specialized for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Shape {
    /// Instance has a (possibly combined) dict, no data descriptor.
    DictNoDescr,
    /// Instance has a dict and a non-data descriptor on the type.
    DictDescr,
    /// Instance uses a split-key dictionary, no descriptor.
    SplitDict,
    /// Split-key dict plus a non-data descriptor on the type.
    SplitDictDescr,
    /// Attribute lives at a fixed offset in the instance.
    Slot,
    /// Instance has no dict; resolution is purely via the type's
    /// descriptor.
    NoDictDescr,
}

/// Whether a specialized site is a `LOAD_ATTR`/`STORE_ATTR` or a
/// `LOAD_METHOD`. Only `DictNoDescr`, `SplitDict` and `NoDictDescr` shapes
/// have a method variant (`DictMethod` / `SplitDictMethod` /
/// `NoDictMethod`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessKind {
    Attr,
    Method,
}

/// Opaque id of a shadow arena, assigned by `shadow_arena::Arena::init`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ArenaId(pub u64);

/// Which arena table an entry lives in, so invalidation knows where to
/// poison / revert the bytecode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TableKind {
    L1,
    Polymorphic,
    Field,
}

/// Where in a shadow arena an entry is installed. Stored inside the entry
/// itself so a type directory's dependency walk, which only ever sees a
/// raw pointer popped off an intrusive list, can tell the arena which
/// bytecode site to revert.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EntrySlot {
    pub arena: ArenaId,
    pub table: TableKind,
    pub index: usize,
    /// Slot within a `PolymorphicEntry`'s 4-element array; meaningful
    /// only when `table == TableKind::Polymorphic`.
    pub poly_slot: Option<u8>,
    /// Bytecode offset of the specialized instruction, so an invalidation
    /// walk can revert it without rescanning the whole code object.
    pub ip: usize,
    /// The fully generic opcode this site was specialized from; recorded
    /// at specialization time so reverting never needs to reconstruct it
    /// (spec.md §3: "the original generic opcode is always recoverable").
    pub generic_opcode: u8,
}

/// A cached instance-attribute resolution.
///
/// # Safety / layout
/// `link` must remain the first field, `#[repr(C)]`: `type_registry`
/// threads a type directory's dependency list through it by writing
/// through a raw `*mut IntrusiveLinkedList` at this entry's address (see
/// `intrusive_linked_list::IntrusiveLinkedList::push`), the same way the
/// donor crate embeds its own free-list nodes in place.
#[repr(C)]
pub struct InstanceAttrEntry {
    pub link: IntrusiveLinkedList,
    pub name: Box<str>,
    /// `None` once invalidated; the guard check in `fastpath` always
    /// misses against `None`.
    pub ty: Option<TypeRef>,
    /// The `type_registry` directory key this entry is linked into,
    /// cached alongside `ty` so an owning arena can unlink the entry on
    /// `clear` without needing a live `Host` to recompute it.
    pub owner_id: Option<host_iface::EntityId>,
    pub descriptor: Option<Value>,
    /// `true` when `descriptor` has both `__get__` and `__set__`: only a
    /// data descriptor's setter runs on `STORE_ATTR`; a non-data
    /// descriptor never participates in a write, which always goes
    /// straight to the instance dict.
    pub is_data_descriptor: bool,
    pub shape: Shape,
    pub kind: AccessKind,
    /// Byte offset of the dict pointer within the instance, or `None` if
    /// it must be located by some other (computed) means.
    pub dict_offset: Option<isize>,
    /// Index into a split dict's values array, or `None` ("computed"/
    /// not applicable for this shape).
    pub split_index: Option<isize>,
    pub keys_id: Option<KeysId>,
    pub nentries: usize,
    /// Byte offset for the `Shape::Slot` case.
    pub slot_offset: isize,
    pub site: Option<EntrySlot>,
}

impl InstanceAttrEntry {
    #[must_use]
    pub fn new(name: Box<str>, ty: TypeRef, shape: Shape, kind: AccessKind) -> Self {
        InstanceAttrEntry {
            link: IntrusiveLinkedList::new(),
            name,
            ty: Some(ty),
            owner_id: None,
            descriptor: None,
            is_data_descriptor: false,
            shape,
            kind,
            dict_offset: None,
            split_index: None,
            keys_id: None,
            nentries: 0,
            slot_offset: 0,
            site: None,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.ty.is_some()
    }

    /// `invalidate` behavior common to every instance-attribute shape:
    /// clear the weak type reference so the guard check in the fast path
    /// misses on next execution.
    pub fn invalidate(&mut self) {
        self.ty = None;
        self.descriptor = None;
    }
}

/// A cached global-name resolution.
/// Invalidated lazily: there is no active walk, the fast path simply
/// compares `entry.module_dict_version` against the dict's current
/// version on every execution.
pub struct ModuleAttrEntry {
    pub name: Box<str>,
    pub module_id: host_iface::EntityId,
    pub module_dict_version: u64,
    pub value: Value,
}

impl ModuleAttrEntry {
    pub fn invalidate(&mut self) {
        self.value = Value::NULL;
        self.module_dict_version = u64::MAX;
    }
}

/// A cached builtin/global lookup, combining the globals and builtins
/// dict version counters into one guard.
pub struct GlobalCacheEntry {
    pub name: Box<str>,
    pub globals_version: u64,
    pub builtins_version: u64,
    pub value: Value,
}

impl GlobalCacheEntry {
    pub fn invalidate(&mut self) {
        self.value = Value::NULL;
        self.globals_version = u64::MAX;
        self.builtins_version = u64::MAX;
    }
}

/// A cached subscript/primitive-field access by fixed byte offset.
/// Linked into a type directory's dependency list the same way as
/// [`InstanceAttrEntry`]; see its doc comment for the layout requirement.
#[repr(C)]
pub struct FieldCacheEntry {
    pub link: IntrusiveLinkedList,
    pub ty: Option<TypeRef>,
    pub owner_id: Option<host_iface::EntityId>,
    pub offset: isize,
    pub field_tag: u8,
    pub site: Option<EntrySlot>,
}

impl FieldCacheEntry {
    #[must_use]
    pub fn new(ty: TypeRef, offset: isize, field_tag: u8) -> Self {
        FieldCacheEntry {
            link: IntrusiveLinkedList::new(),
            ty: Some(ty),
            owner_id: None,
            offset,
            field_tag,
            site: None,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.ty.is_some()
    }

    pub fn invalidate(&mut self) {
        self.ty = None;
    }
}

/// Fixed-capacity (4 slots) polymorphic cache used once a site has
/// observed more than one type. A fifth distinct type evicts the oldest
/// entry, FIFO.
pub struct PolymorphicEntry {
    slots: [Option<InstanceAttrEntry>; 4],
    len: usize,
    cursor: usize,
}

impl Default for PolymorphicEntry {
    fn default() -> Self {
        PolymorphicEntry {
            slots: [None, None, None, None],
            len: 0,
            cursor: 0,
        }
    }
}

impl PolymorphicEntry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn slots(&self) -> &[Option<InstanceAttrEntry>; 4] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Option<InstanceAttrEntry>; 4] {
        &mut self.slots
    }

    /// Finds the (at most one) slot whose `ty` matches `ty`.
    pub fn find_mut(&mut self, ty: TypeRef) -> Option<&mut InstanceAttrEntry> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|e| e.ty == Some(ty))
    }

    /// Inserts a new entry, returning its slot index and, if the array
    /// was already full, the entry evicted to make room (FIFO: the
    /// entry that has been resident longest).
    pub fn insert(&mut self, entry: InstanceAttrEntry) -> (usize, Option<InstanceAttrEntry>) {
        if self.len < self.slots.len() {
            let idx = self.len;
            self.slots[idx] = Some(entry);
            self.len += 1;
            self.cursor = (idx + 1) % self.slots.len();
            (idx, None)
        } else {
            let idx = self.cursor;
            let evicted = self.slots[idx].take();
            self.slots[idx] = Some(entry);
            self.cursor = (self.cursor + 1) % self.slots.len();
            (idx, evicted)
        }
    }

    pub fn invalidate_all(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.invalidate();
        }
    }
}

/// The tagged union of every cache variant a site can hold.
pub enum Entry {
    Instance(InstanceAttrEntry),
    Module(ModuleAttrEntry),
    Global(GlobalCacheEntry),
    Field(FieldCacheEntry),
    Polymorphic(PolymorphicEntry),
}

impl Entry {
    pub fn invalidate(&mut self) {
        match self {
            Entry::Instance(e) => e.invalidate(),
            Entry::Module(e) => e.invalidate(),
            Entry::Global(e) => e.invalidate(),
            Entry::Field(e) => e.invalidate(),
            Entry::Polymorphic(e) => e.invalidate_all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_iface::Value;

    fn type_ref(id: u64) -> TypeRef {
        TypeRef(Value::from_int(id as i64))
    }

    #[test]
    fn polymorphic_fifo_eviction() {
        let mut poly = PolymorphicEntry::new();
        let names = ["a", "b", "c", "d", "e"];
        let mut evicted_types = alloc::vec::Vec::new();
        for (i, name) in names.iter().enumerate() {
            let ty = type_ref(i as u64);
            let entry = InstanceAttrEntry::new((*name).into(), ty, Shape::Slot, AccessKind::Attr);
            let (_, evicted) = poly.insert(entry);
            if let Some(e) = evicted {
                evicted_types.push(e.ty);
            }
        }
        assert_eq!(poly.len(), 4);
        // Fifth insert evicted the first (type 0).
        assert_eq!(evicted_types, alloc::vec![Some(type_ref(0))]);
        assert!(poly.find_mut(type_ref(0)).is_none());
        assert!(poly.find_mut(type_ref(4)).is_some());
    }

    #[test]
    fn instance_entry_invalidate_clears_type() {
        let mut e = InstanceAttrEntry::new(
            "x".into(),
            type_ref(1),
            Shape::DictNoDescr,
            AccessKind::Attr,
        );
        assert!(e.is_valid());
        e.invalidate();
        assert!(!e.is_valid());
    }
}
