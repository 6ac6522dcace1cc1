#![cfg_attr(not(test), no_std)]
//! Public facade: the operations an embedding interpreter calls at each
//! specializable bytecode site, wiring the dispatcher, fast-path handlers,
//! shadow arena and type registry together behind one entry point per
//! opcode family.
//!
//! A [`ShadowCache`] owns one [`type_registry::Registry`] (the process-wide
//! weak dependency directory) and one [`shadow_arena::Arena`] per code
//! object that has had a site specialized. Every public method here reads
//! the instruction currently at `ip`, and dispatches to one of three
//! tiers: the fully generic opcode (first execution, or a site that has
//! given up respecializing), the monomorphic `_CACHED` opcode, or the
//! `_POLY` opcode once a second type has been observed.

extern crate alloc;

use alloc::collections::BTreeMap;

use dispatcher::Classification;
use host_iface::{AccessOp, CodeBuffer, DictRef, Host, TypeRef, Value};
use shadow_arena::{Arena, L1Slot};
use shape_cache::{
    ArenaId, FieldCacheEntry, GlobalCacheEntry, InstanceAttrEntry, ModuleAttrEntry, Shape,
};
use type_registry::Registry;

pub use cache_stats::Counters;
pub use host_iface::ModuleRef;
pub use shape_cache::EntrySlot;

/// Opcode bytes the embedding interpreter patches into its bytecode.
/// Each specializable family has three forms: the fully generic opcode,
/// the monomorphic `_CACHED` form indexing a single-entry slot, and the
/// `_POLY` form indexing a four-way polymorphic table.
pub mod opcode {
    pub const LOAD_ATTR: u8 = 0x01;
    pub const LOAD_ATTR_CACHED: u8 = 0x11;
    pub const LOAD_ATTR_POLY: u8 = 0x12;

    pub const LOAD_METHOD: u8 = 0x02;
    pub const LOAD_METHOD_CACHED: u8 = 0x21;
    pub const LOAD_METHOD_POLY: u8 = 0x22;

    pub const STORE_ATTR: u8 = 0x03;
    pub const STORE_ATTR_CACHED: u8 = 0x31;
    pub const STORE_ATTR_POLY: u8 = 0x32;

    pub const LOAD_GLOBAL: u8 = 0x04;
    pub const LOAD_GLOBAL_CACHED: u8 = 0x41;

    pub const BINARY_SUBSCR: u8 = 0x05;
    pub const BINARY_SUBSCR_CACHED: u8 = 0x51;
}

/// Every failure mode a facade operation can report: a propagated host
/// error, a genuine "no such attribute", or a cache-internal capacity
/// limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError<E> {
    AttributeNotFound,
    Propagated(E),
    NoSuchArena,
    ArenaFull,
}

impl<E: core::fmt::Debug> core::fmt::Display for CacheError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CacheError::AttributeNotFound => f.write_str("no such attribute"),
            CacheError::Propagated(e) => write!(f, "propagated host error: {e:?}"),
            CacheError::NoSuchArena => f.write_str("no shadow arena registered for that code object"),
            CacheError::ArenaFull => f.write_str("shadow arena table is full"),
        }
    }
}

impl<E: core::fmt::Debug> core::error::Error for CacheError<E> {}

/// Which `cache_stats::Opcode` family a generic opcode byte belongs to,
/// so an invalidation walk can decrement the right entry counter.
fn opcode_family(generic_opcode: u8) -> Option<cache_stats::Opcode> {
    match generic_opcode {
        opcode::LOAD_ATTR => Some(cache_stats::Opcode::LoadAttr),
        opcode::LOAD_METHOD => Some(cache_stats::Opcode::LoadMethod),
        opcode::STORE_ATTR => Some(cache_stats::Opcode::StoreAttr),
        opcode::BINARY_SUBSCR => Some(cache_stats::Opcode::BinarySubscr),
        _ => None,
    }
}

fn convert_err<E>(e: fastpath::FastPathError<E>) -> CacheError<E> {
    match e {
        fastpath::FastPathError::AttributeNotFound => CacheError::AttributeNotFound,
        fastpath::FastPathError::Host(err) => CacheError::Propagated(err),
    }
}

/// The outcome of running [`dispatcher::classify`] against a live object:
/// either the site cannot be specialized at all, or a concrete entry ready
/// to install.
enum Specialized {
    Uncacheable,
    Entry(TypeRef, InstanceAttrEntry),
}

fn build_instance_entry<H: Host>(host: &H, owner: Value, name: &str, op: AccessOp) -> Specialized {
    let ty = host.type_of(owner);
    let descriptor = host.lookup_descriptor(ty, name);
    let dict = host.instance_dict(owner);
    let has_instance_dict = dict.is_some();
    let dict_is_split = dict.is_some_and(|d| host.dict_is_split(d));
    let classification = dispatcher::classify(descriptor, op, has_instance_dict, dict_is_split);
    let Some((shape, kind)) = dispatcher::shape_of(classification) else {
        return Specialized::Uncacheable;
    };
    let mut entry = InstanceAttrEntry::new(name.into(), ty, shape, kind);
    if let Classification::Slot(offset) = classification {
        entry.slot_offset = offset;
    }
    if let Some(descr) = descriptor {
        entry.descriptor = Some(descr.value);
        entry.is_data_descriptor = matches!(descr.kind, host_iface::DescriptorKind::Data);
    }
    if let Some(dict) = dict {
        entry.dict_offset = host.instance_dict_offset(ty);
        if matches!(shape, Shape::SplitDict | Shape::SplitDictDescr) {
            #[allow(clippy::cast_possible_wrap)]
            let split_index = host.dict_split_index(dict, name).map(|i| i as isize);
            entry.split_index = split_index;
            entry.keys_id = Some(host.dict_keys_id(dict));
            entry.nentries = host.dict_nentries(dict);
        }
    }
    Specialized::Entry(ty, entry)
}

/// Uncached attribute resolution, run once for an uncacheable site and on
/// every execution thereafter: instance dict first, then the type's
/// descriptor.
fn generic_resolve_attr<H: Host>(host: &H, owner: Value, name: &str) -> Result<Value, CacheError<H::Error>> {
    if let Some(dict) = host.instance_dict(owner) {
        match host.dict_get(dict, name) {
            Ok(Some(v)) => {
                host.incref(v);
                return Ok(v);
            }
            Ok(None) => {}
            Err(e) => return Err(CacheError::Propagated(e)),
        }
    }
    let ty = host.type_of(owner);
    match host.lookup_descriptor(ty, name) {
        Some(d) => host
            .descriptor_get(d.value, owner, ty)
            .map_err(CacheError::Propagated),
        None => Err(CacheError::AttributeNotFound),
    }
}

fn generic_store_attr<H: Host>(
    host: &H,
    owner: Value,
    name: &str,
    value: Value,
) -> Result<(), CacheError<H::Error>> {
    let ty = host.type_of(owner);
    if let Some(d) = host.lookup_descriptor(ty, name) {
        if matches!(d.kind, host_iface::DescriptorKind::Data) {
            return host
                .descriptor_set(d.value, owner, value)
                .map_err(CacheError::Propagated);
        }
    }
    match host.instance_dict(owner) {
        Some(dict) => host.dict_set(dict, name, value).map_err(CacheError::Propagated),
        None => Err(CacheError::AttributeNotFound),
    }
}

fn resolve_global<H: Host>(
    host: &H,
    globals: DictRef,
    builtins: DictRef,
    name: &str,
) -> Result<Value, CacheError<H::Error>> {
    match host.dict_get(globals, name) {
        Ok(Some(v)) => return Ok(v),
        Ok(None) => {}
        Err(e) => return Err(CacheError::Propagated(e)),
    }
    match host.dict_get(builtins, name) {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(CacheError::AttributeNotFound),
        Err(e) => Err(CacheError::Propagated(e)),
    }
}

/// The process-wide inline cache: one [`Registry`] plus one [`Arena`] per
/// code object that has had a site specialized.
pub struct ShadowCache<C: CodeBuffer> {
    registry: Registry,
    arenas: BTreeMap<ArenaId, Arena<C>>,
}

impl<C: CodeBuffer> Default for ShadowCache<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CodeBuffer> ShadowCache<C> {
    #[must_use]
    pub fn new() -> Self {
        ShadowCache {
            registry: Registry::new(),
            arenas: BTreeMap::new(),
        }
    }

    /// Registers `code` as a new shadow arena, returning the id the
    /// caller must pass to every other method touching this code object.
    pub fn init_shadow(&mut self, code: C) -> ArenaId {
        let arena = Arena::new(code);
        let id = arena.id();
        self.arenas.insert(id, arena);
        id
    }

    /// Tears down a code object's shadow arena, unlinking every entry it
    /// still holds from the registry first.
    pub fn clear_shadow(&mut self, id: ArenaId) {
        if let Some(arena) = self.arenas.remove(&id) {
            arena.clear(&mut self.registry);
        }
    }

    /// A point-in-time snapshot of the process-wide counters, indexed per
    /// `cache_stats::Opcode`.
    #[must_use]
    pub fn stats(&self) -> [Counters; 5] {
        cache_stats::GLOBAL.snapshot()
    }

    /// A type (or its instances' split-dict shape) was mutated: walk
    /// every entry that depends on it, poison it, and revert its
    /// bytecode site back to the generic opcode.
    pub fn on_type_modified<H: Host>(&mut self, host: &H, ty: TypeRef) {
        let owner = host.type_id(ty);
        let sites = self.registry.invalidate(owner);
        for site in sites {
            if let Some(arena) = self.arenas.get_mut(&site.arena) {
                arena.revert_to_generic(site);
                arena.bump_respecialize(site.ip);
                if let Some(op) = opcode_family(site.generic_opcode) {
                    cache_stats::GLOBAL.record_entry_freed(op);
                }
            }
        }
    }

    // ---- LOAD_ATTR ---------------------------------------------------

    pub fn load_attr<H: Host>(
        &mut self,
        host: &H,
        id: ArenaId,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<Value, CacheError<H::Error>> {
        let arena = self.arenas.get_mut(&id).ok_or(CacheError::NoSuchArena)?;
        let (op, operand) = arena.code().read(ip);
        match op {
            opcode::LOAD_ATTR_CACHED => {
                Self::monomorphic_load_attr(arena, &mut self.registry, host, operand as usize, ip, owner, name)
            }
            opcode::LOAD_ATTR_POLY => {
                Self::polymorphic_load_attr(arena, &mut self.registry, host, operand as usize, ip, owner, name)
            }
            _ => Self::specialize_load_attr(arena, &mut self.registry, host, ip, owner, name),
        }
    }

    fn specialize_load_attr<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<Value, CacheError<H::Error>> {
        if let Some(m) = host.as_module(owner) {
            return Self::specialize_load_module_attr(arena, host, ip, m, name);
        }
        if arena.should_give_up(ip) {
            return generic_resolve_attr(host, owner, name);
        }
        match build_instance_entry(host, owner, name, AccessOp::LoadAttr) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::LoadAttr);
                generic_resolve_attr(host, owner, name)
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                let index = arena
                    .push_instance_entry(registry, owner_id, entry, ip, opcode::LOAD_ATTR)
                    .map_err(|_| CacheError::ArenaFull)?;
                arena.code_mut().write(ip, opcode::LOAD_ATTR_CACHED, truncate(index));
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::LoadAttr);
                let Some(L1Slot::Instance(stored)) = arena.l1_entry(index) else {
                    return Err(CacheError::NoSuchArena);
                };
                match fastpath::load_attr(host, stored, owner) {
                    fastpath::FastPathOutcome::Hit(v) => Ok(v),
                    fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
                    fastpath::FastPathOutcome::Miss => Err(CacheError::AttributeNotFound),
                }
            }
        }
    }

    fn specialize_load_module_attr<H: Host>(
        arena: &mut Arena<C>,
        host: &H,
        ip: usize,
        m: ModuleRef,
        name: &str,
    ) -> Result<Value, CacheError<H::Error>> {
        let dict = host.module_dict(m);
        let version = host.dict_version(dict);
        let value = match host.dict_get(dict, name) {
            Ok(Some(v)) => v,
            Ok(None) => return Err(CacheError::AttributeNotFound),
            Err(e) => return Err(CacheError::Propagated(e)),
        };
        let entry = ModuleAttrEntry {
            name: name.into(),
            module_id: host.module_id(m),
            module_dict_version: version,
            value,
        };
        let index = arena.push_module_entry(entry).map_err(|_| CacheError::ArenaFull)?;
        arena.code_mut().write(ip, opcode::LOAD_ATTR_CACHED, truncate(index));
        cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::LoadAttr);
        host.incref(value);
        Ok(value)
    }

    fn monomorphic_load_attr<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        index: usize,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<Value, CacheError<H::Error>> {
        match arena.l1_entry(index) {
            Some(L1Slot::Instance(_)) => {
                let Some(L1Slot::Instance(entry)) = arena.l1_entry(index) else {
                    return Err(CacheError::NoSuchArena);
                };
                match fastpath::load_attr(host, entry, owner) {
                    fastpath::FastPathOutcome::Hit(v) => Ok(v),
                    fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
                    fastpath::FastPathOutcome::Miss => {
                        Self::promote_load_attr(arena, registry, host, index, ip, owner, name)
                    }
                }
            }
            Some(L1Slot::Module(_)) => {
                let Some(m) = host.as_module(owner) else {
                    return Self::specialize_load_attr(arena, registry, host, ip, owner, name);
                };
                Self::hit_module_entry(arena, host, index, m)
            }
            None => Err(CacheError::NoSuchArena),
        }
    }

    fn hit_module_entry<H: Host>(
        arena: &mut Arena<C>,
        host: &H,
        index: usize,
        m: ModuleRef,
    ) -> Result<Value, CacheError<H::Error>> {
        let dict = host.module_dict(m);
        let current_version = host.dict_version(dict);
        let Some(L1Slot::Module(entry)) = arena.l1_entry(index) else {
            return Err(CacheError::NoSuchArena);
        };
        let cached_version = entry.module_dict_version;
        match fastpath::load_module_attr(host, entry, m) {
            fastpath::FastPathOutcome::Hit(v) => {
                if current_version != cached_version {
                    if let Some(L1Slot::Module(entry_mut)) = arena.l1_entry_mut(index) {
                        fastpath::refresh_module_entry(entry_mut, current_version, v);
                    }
                }
                Ok(v)
            }
            fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
            fastpath::FastPathOutcome::Miss => Err(CacheError::AttributeNotFound),
        }
    }

    fn promote_load_attr<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        l1_index: usize,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<Value, CacheError<H::Error>> {
        match build_instance_entry(host, owner, name, AccessOp::LoadAttr) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::LoadAttr);
                generic_resolve_attr(host, owner, name)
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                let table_index = dispatcher::promote(arena, registry, l1_index, owner_id, entry)
                    .map_err(|_| CacheError::ArenaFull)?;
                arena.code_mut().write(ip, opcode::LOAD_ATTR_POLY, truncate(table_index));
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::LoadAttr);
                Self::hit_polymorphic_slot(arena, host, table_index, ty, owner)
            }
        }
    }

    fn polymorphic_load_attr<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        table_index: usize,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<Value, CacheError<H::Error>> {
        let ty = host.type_of(owner);
        let hit = arena
            .polymorphic_table(table_index)
            .ok_or(CacheError::NoSuchArena)?
            .slots()
            .iter()
            .flatten()
            .find(|e| e.ty == Some(ty))
            .map(|e| fastpath::load_attr(host, e, owner));
        if let Some(outcome) = hit {
            match outcome {
                fastpath::FastPathOutcome::Hit(v) => return Ok(v),
                fastpath::FastPathOutcome::Err(e) => return Err(convert_err(e)),
                fastpath::FastPathOutcome::Miss => {} // guard tripped; fall through to respecialize
            }
        }
        if arena.should_give_up(ip) {
            return generic_resolve_attr(host, owner, name);
        }
        match build_instance_entry(host, owner, name, AccessOp::LoadAttr) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::LoadAttr);
                generic_resolve_attr(host, owner, name)
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                arena
                    .insert_into_polymorphic(registry, table_index, owner_id, entry)
                    .map_err(|_| CacheError::ArenaFull)?;
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::LoadAttr);
                Self::hit_polymorphic_slot(arena, host, table_index, ty, owner)
            }
        }
    }

    fn hit_polymorphic_slot<H: Host>(
        arena: &Arena<C>,
        host: &H,
        table_index: usize,
        ty: TypeRef,
        owner: Value,
    ) -> Result<Value, CacheError<H::Error>> {
        let Some(entry) = arena
            .polymorphic_table(table_index)
            .and_then(|t| t.slots().iter().flatten().find(|e| e.ty == Some(ty)))
        else {
            return Err(CacheError::AttributeNotFound);
        };
        match fastpath::load_attr(host, entry, owner) {
            fastpath::FastPathOutcome::Hit(v) => Ok(v),
            fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
            fastpath::FastPathOutcome::Miss => Err(CacheError::AttributeNotFound),
        }
    }

    // ---- LOAD_METHOD ---------------------------------------------------

    pub fn load_method<H: Host>(
        &mut self,
        host: &H,
        id: ArenaId,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<(Value, Value), CacheError<H::Error>> {
        let arena = self.arenas.get_mut(&id).ok_or(CacheError::NoSuchArena)?;
        let (op, operand) = arena.code().read(ip);
        match op {
            opcode::LOAD_METHOD_CACHED => {
                Self::monomorphic_load_method(arena, &mut self.registry, host, operand as usize, ip, owner, name)
            }
            opcode::LOAD_METHOD_POLY => {
                Self::polymorphic_load_method(arena, &mut self.registry, host, operand as usize, ip, owner, name)
            }
            _ => Self::specialize_load_method(arena, &mut self.registry, host, ip, owner, name),
        }
    }

    fn specialize_load_method<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<(Value, Value), CacheError<H::Error>> {
        if arena.should_give_up(ip) {
            return generic_resolve_attr(host, owner, name).map(|v| (Value::NULL, v));
        }
        match build_instance_entry(host, owner, name, AccessOp::LoadMethod) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::LoadMethod);
                generic_resolve_attr(host, owner, name).map(|v| (Value::NULL, v))
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                let index = arena
                    .push_instance_entry(registry, owner_id, entry, ip, opcode::LOAD_METHOD)
                    .map_err(|_| CacheError::ArenaFull)?;
                arena.code_mut().write(ip, opcode::LOAD_METHOD_CACHED, truncate(index));
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::LoadMethod);
                let Some(L1Slot::Instance(stored)) = arena.l1_entry(index) else {
                    return Err(CacheError::NoSuchArena);
                };
                match fastpath::load_method(host, stored, owner) {
                    fastpath::FastPathOutcome::Hit(pair) => Ok(pair),
                    fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
                    fastpath::FastPathOutcome::Miss => Err(CacheError::AttributeNotFound),
                }
            }
        }
    }

    fn monomorphic_load_method<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        index: usize,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<(Value, Value), CacheError<H::Error>> {
        let Some(L1Slot::Instance(entry)) = arena.l1_entry(index) else {
            return Err(CacheError::NoSuchArena);
        };
        match fastpath::load_method(host, entry, owner) {
            fastpath::FastPathOutcome::Hit(pair) => Ok(pair),
            fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
            fastpath::FastPathOutcome::Miss => {
                Self::promote_load_method(arena, registry, host, index, ip, owner, name)
            }
        }
    }

    fn promote_load_method<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        l1_index: usize,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<(Value, Value), CacheError<H::Error>> {
        match build_instance_entry(host, owner, name, AccessOp::LoadMethod) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::LoadMethod);
                generic_resolve_attr(host, owner, name).map(|v| (Value::NULL, v))
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                let table_index = dispatcher::promote(arena, registry, l1_index, owner_id, entry)
                    .map_err(|_| CacheError::ArenaFull)?;
                arena.code_mut().write(ip, opcode::LOAD_METHOD_POLY, truncate(table_index));
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::LoadMethod);
                Self::hit_polymorphic_method_slot(arena, host, table_index, ty, owner)
            }
        }
    }

    fn polymorphic_load_method<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        table_index: usize,
        ip: usize,
        owner: Value,
        name: &str,
    ) -> Result<(Value, Value), CacheError<H::Error>> {
        let ty = host.type_of(owner);
        let hit = arena
            .polymorphic_table(table_index)
            .ok_or(CacheError::NoSuchArena)?
            .slots()
            .iter()
            .flatten()
            .find(|e| e.ty == Some(ty))
            .map(|e| fastpath::load_method(host, e, owner));
        if let Some(outcome) = hit {
            match outcome {
                fastpath::FastPathOutcome::Hit(pair) => return Ok(pair),
                fastpath::FastPathOutcome::Err(e) => return Err(convert_err(e)),
                fastpath::FastPathOutcome::Miss => {}
            }
        }
        if arena.should_give_up(ip) {
            return generic_resolve_attr(host, owner, name).map(|v| (Value::NULL, v));
        }
        match build_instance_entry(host, owner, name, AccessOp::LoadMethod) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::LoadMethod);
                generic_resolve_attr(host, owner, name).map(|v| (Value::NULL, v))
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                arena
                    .insert_into_polymorphic(registry, table_index, owner_id, entry)
                    .map_err(|_| CacheError::ArenaFull)?;
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::LoadMethod);
                Self::hit_polymorphic_method_slot(arena, host, table_index, ty, owner)
            }
        }
    }

    fn hit_polymorphic_method_slot<H: Host>(
        arena: &Arena<C>,
        host: &H,
        table_index: usize,
        ty: TypeRef,
        owner: Value,
    ) -> Result<(Value, Value), CacheError<H::Error>> {
        let Some(entry) = arena
            .polymorphic_table(table_index)
            .and_then(|t| t.slots().iter().flatten().find(|e| e.ty == Some(ty)))
        else {
            return Err(CacheError::AttributeNotFound);
        };
        match fastpath::load_method(host, entry, owner) {
            fastpath::FastPathOutcome::Hit(pair) => Ok(pair),
            fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
            fastpath::FastPathOutcome::Miss => Err(CacheError::AttributeNotFound),
        }
    }

    // ---- STORE_ATTR ---------------------------------------------------

    pub fn store_attr<H: Host>(
        &mut self,
        host: &H,
        id: ArenaId,
        ip: usize,
        owner: Value,
        name: &str,
        value: Value,
    ) -> Result<(), CacheError<H::Error>> {
        let arena = self.arenas.get_mut(&id).ok_or(CacheError::NoSuchArena)?;
        let (op, operand) = arena.code().read(ip);
        match op {
            opcode::STORE_ATTR_CACHED => {
                Self::monomorphic_store_attr(arena, &mut self.registry, host, operand as usize, ip, owner, name, value)
            }
            opcode::STORE_ATTR_POLY => {
                Self::polymorphic_store_attr(arena, &mut self.registry, host, operand as usize, ip, owner, name, value)
            }
            _ => Self::specialize_store_attr(arena, &mut self.registry, host, ip, owner, name, value),
        }
    }

    fn specialize_store_attr<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        ip: usize,
        owner: Value,
        name: &str,
        value: Value,
    ) -> Result<(), CacheError<H::Error>> {
        if arena.should_give_up(ip) {
            return generic_store_attr(host, owner, name, value);
        }
        match build_instance_entry(host, owner, name, AccessOp::StoreAttr) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::StoreAttr);
                generic_store_attr(host, owner, name, value)
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                let index = arena
                    .push_instance_entry(registry, owner_id, entry, ip, opcode::STORE_ATTR)
                    .map_err(|_| CacheError::ArenaFull)?;
                arena.code_mut().write(ip, opcode::STORE_ATTR_CACHED, truncate(index));
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::StoreAttr);
                let Some(L1Slot::Instance(stored)) = arena.l1_entry(index) else {
                    return Err(CacheError::NoSuchArena);
                };
                match fastpath::store_attr(host, stored, owner, value) {
                    fastpath::FastPathOutcome::Hit(()) => Ok(()),
                    fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
                    fastpath::FastPathOutcome::Miss => Err(CacheError::AttributeNotFound),
                }
            }
        }
    }

    fn monomorphic_store_attr<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        index: usize,
        ip: usize,
        owner: Value,
        name: &str,
        value: Value,
    ) -> Result<(), CacheError<H::Error>> {
        let Some(L1Slot::Instance(entry)) = arena.l1_entry(index) else {
            return Err(CacheError::NoSuchArena);
        };
        match fastpath::store_attr(host, entry, owner, value) {
            fastpath::FastPathOutcome::Hit(()) => Ok(()),
            fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
            fastpath::FastPathOutcome::Miss => {
                Self::promote_store_attr(arena, registry, host, index, ip, owner, name, value)
            }
        }
    }

    fn promote_store_attr<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        l1_index: usize,
        ip: usize,
        owner: Value,
        name: &str,
        value: Value,
    ) -> Result<(), CacheError<H::Error>> {
        match build_instance_entry(host, owner, name, AccessOp::StoreAttr) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::StoreAttr);
                generic_store_attr(host, owner, name, value)
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                let table_index = dispatcher::promote(arena, registry, l1_index, owner_id, entry)
                    .map_err(|_| CacheError::ArenaFull)?;
                arena.code_mut().write(ip, opcode::STORE_ATTR_POLY, truncate(table_index));
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::StoreAttr);
                Self::hit_polymorphic_store_slot(arena, host, table_index, ty, owner, value)
            }
        }
    }

    fn polymorphic_store_attr<H: Host>(
        arena: &mut Arena<C>,
        registry: &mut Registry,
        host: &H,
        table_index: usize,
        ip: usize,
        owner: Value,
        name: &str,
        value: Value,
    ) -> Result<(), CacheError<H::Error>> {
        let ty = host.type_of(owner);
        let hit = arena
            .polymorphic_table(table_index)
            .ok_or(CacheError::NoSuchArena)?
            .slots()
            .iter()
            .flatten()
            .find(|e| e.ty == Some(ty))
            .map(|e| fastpath::store_attr(host, e, owner, value));
        if let Some(outcome) = hit {
            match outcome {
                fastpath::FastPathOutcome::Hit(()) => return Ok(()),
                fastpath::FastPathOutcome::Err(e) => return Err(convert_err(e)),
                fastpath::FastPathOutcome::Miss => {}
            }
        }
        if arena.should_give_up(ip) {
            return generic_store_attr(host, owner, name, value);
        }
        match build_instance_entry(host, owner, name, AccessOp::StoreAttr) {
            Specialized::Uncacheable => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::StoreAttr);
                generic_store_attr(host, owner, name, value)
            }
            Specialized::Entry(ty, entry) => {
                let owner_id = host.type_id(ty);
                arena
                    .insert_into_polymorphic(registry, table_index, owner_id, entry)
                    .map_err(|_| CacheError::ArenaFull)?;
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::StoreAttr);
                Self::hit_polymorphic_store_slot(arena, host, table_index, ty, owner, value)
            }
        }
    }

    fn hit_polymorphic_store_slot<H: Host>(
        arena: &Arena<C>,
        host: &H,
        table_index: usize,
        ty: TypeRef,
        owner: Value,
        value: Value,
    ) -> Result<(), CacheError<H::Error>> {
        let Some(entry) = arena
            .polymorphic_table(table_index)
            .and_then(|t| t.slots().iter().flatten().find(|e| e.ty == Some(ty)))
        else {
            return Err(CacheError::AttributeNotFound);
        };
        match fastpath::store_attr(host, entry, owner, value) {
            fastpath::FastPathOutcome::Hit(()) => Ok(()),
            fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
            fastpath::FastPathOutcome::Miss => Err(CacheError::AttributeNotFound),
        }
    }

    // ---- LOAD_GLOBAL ---------------------------------------------------

    pub fn load_global<H: Host>(
        &mut self,
        host: &H,
        id: ArenaId,
        ip: usize,
        name: &str,
    ) -> Result<Value, CacheError<H::Error>> {
        let arena = self.arenas.get_mut(&id).ok_or(CacheError::NoSuchArena)?;
        let (op, operand) = arena.code().read(ip);
        let globals = host.globals_dict();
        let builtins = host.builtins_dict();
        let gv = host.dict_version(globals);
        let bv = host.dict_version(builtins);
        if op == opcode::LOAD_GLOBAL_CACHED {
            let index = operand as usize;
            let cached = arena.global_entry(index).ok_or(CacheError::NoSuchArena)?;
            match fastpath::load_global(cached, gv, bv) {
                fastpath::FastPathOutcome::Hit(v) => return Ok(v),
                fastpath::FastPathOutcome::Miss => {}
                fastpath::FastPathOutcome::Err(fastpath::FastPathError::AttributeNotFound) => {
                    return Err(CacheError::AttributeNotFound);
                }
                fastpath::FastPathOutcome::Err(fastpath::FastPathError::Host(never)) => match never {},
            }
            let value = resolve_global(host, globals, builtins, name)?;
            if let Some(entry) = arena.global_entry_mut(index) {
                entry.value = value;
                entry.globals_version = gv;
                entry.builtins_version = bv;
            }
            cache_stats::GLOBAL.record_slight_miss(cache_stats::Opcode::LoadGlobal);
            return Ok(value);
        }
        let value = resolve_global(host, globals, builtins, name)?;
        let entry = GlobalCacheEntry {
            name: name.into(),
            globals_version: gv,
            builtins_version: bv,
            value,
        };
        let index = arena.push_global_entry(entry).map_err(|_| CacheError::ArenaFull)?;
        arena.code_mut().write(ip, opcode::LOAD_GLOBAL_CACHED, truncate(index));
        cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::LoadGlobal);
        Ok(value)
    }

    // ---- BINARY_SUBSCR --------------------------------------------------

    pub fn binary_subscr<H: Host>(
        &mut self,
        host: &H,
        id: ArenaId,
        ip: usize,
        container: Value,
        sub: Value,
    ) -> Result<Value, CacheError<H::Error>> {
        let registry = &mut self.registry;
        let arena = self.arenas.get_mut(&id).ok_or(CacheError::NoSuchArena)?;
        let (op, operand) = arena.code().read(ip);
        if op == opcode::BINARY_SUBSCR_CACHED {
            let entry = arena.field_entry(operand as usize).ok_or(CacheError::NoSuchArena)?;
            match fastpath::binary_subscr(host, entry, container) {
                fastpath::FastPathOutcome::Hit(v) => return Ok(v),
                fastpath::FastPathOutcome::Err(e) => return Err(convert_err(e)),
                fastpath::FastPathOutcome::Miss => {}
            }
        }
        let ty = host.type_of(container);
        match host.subscript_field(ty, sub) {
            Some((offset, field_tag)) if !arena.should_give_up(ip) => {
                let owner_id = host.type_id(ty);
                let entry = FieldCacheEntry::new(ty, offset, field_tag);
                let index = arena
                    .push_field_entry(registry, owner_id, entry, ip, opcode::BINARY_SUBSCR)
                    .map_err(|_| CacheError::ArenaFull)?;
                arena.code_mut().write(ip, opcode::BINARY_SUBSCR_CACHED, truncate(index));
                cache_stats::GLOBAL.record_entry_created(cache_stats::Opcode::BinarySubscr);
                let Some(stored) = arena.field_entry(index) else {
                    return Err(CacheError::NoSuchArena);
                };
                match fastpath::binary_subscr(host, stored, container) {
                    fastpath::FastPathOutcome::Hit(v) => Ok(v),
                    fastpath::FastPathOutcome::Err(e) => Err(convert_err(e)),
                    fastpath::FastPathOutcome::Miss => Err(CacheError::AttributeNotFound),
                }
            }
            _ => {
                cache_stats::GLOBAL.record_uncacheable(cache_stats::Opcode::BinarySubscr);
                host.generic_subscript(container, sub).map_err(CacheError::Propagated)
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn truncate(index: usize) -> u8 {
    index as u8
}

/// A mock [`Host`] and [`CodeBuffer`] for exercising the facade without a
/// real interpreter, used by this crate's own tests.
#[cfg(test)]
pub mod test_support {
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use host_iface::{
        CodeBuffer, Descriptor, DictRef, EntityId, Host, KeysId, ModuleRef, TypeRef, Value,
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MockError;

    struct Dict {
        entries: BTreeMap<Box<str>, Value>,
        version: u64,
        is_split: bool,
        keys_id: u64,
        keys_poisoned: bool,
        split_index: BTreeMap<Box<str>, usize>,
        values: Vec<Value>,
    }

    impl Dict {
        fn new() -> Self {
            Dict {
                entries: BTreeMap::new(),
                version: 0,
                is_split: false,
                keys_id: 2,
                keys_poisoned: false,
                split_index: BTreeMap::new(),
                values: Vec::new(),
            }
        }
    }

    /// A code buffer backed by a plain `Vec` of `(opcode, operand)` units.
    pub struct VecCode(pub Vec<(u8, u8)>);

    impl VecCode {
        #[must_use]
        pub fn new(len: usize) -> Self {
            VecCode(alloc::vec![(0u8, 0u8); len])
        }
    }

    impl CodeBuffer for VecCode {
        fn len(&self) -> usize {
            self.0.len()
        }
        fn read(&self, ip: usize) -> (u8, u8) {
            self.0[ip]
        }
        fn write(&mut self, ip: usize, opcode: u8, operand: u8) {
            self.0[ip] = (opcode, operand);
        }
    }

    /// A minimal, interior-mutable object model standing in for a real
    /// interpreter: objects and types are tagged integers, dicts and
    /// descriptors live in side tables keyed by those integers.
    pub struct MockHost {
        next_id: RefCell<u64>,
        types: RefCell<BTreeMap<u64, u64>>,
        descriptors: RefCell<BTreeMap<(u64, Box<str>), Descriptor>>,
        dicts: RefCell<BTreeMap<u64, Dict>>,
        instance_dicts: RefCell<BTreeMap<u64, u64>>,
        slots: RefCell<BTreeMap<(u64, isize), Value>>,
        modules: RefCell<BTreeMap<u64, u64>>,
        globals: u64,
        builtins: u64,
    }

    impl Default for MockHost {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockHost {
        #[must_use]
        pub fn new() -> Self {
            let mut dicts = BTreeMap::new();
            dicts.insert(1, Dict::new());
            dicts.insert(2, Dict::new());
            MockHost {
                next_id: RefCell::new(100),
                types: RefCell::new(BTreeMap::new()),
                descriptors: RefCell::new(BTreeMap::new()),
                dicts: RefCell::new(dicts),
                instance_dicts: RefCell::new(BTreeMap::new()),
                slots: RefCell::new(BTreeMap::new()),
                modules: RefCell::new(BTreeMap::new()),
                globals: 1,
                builtins: 2,
            }
        }

        #[must_use]
        pub fn type_ref(&self, type_id: u64) -> TypeRef {
            TypeRef(Value::from_int(type_id as i64))
        }

        pub fn new_object(&self, type_id: u64) -> Value {
            let id = {
                let mut n = self.next_id.borrow_mut();
                let v = *n;
                *n += 1;
                v
            };
            self.types.borrow_mut().insert(id, type_id);
            Value::from_int(id as i64)
        }

        pub fn give_dict(&self, obj: Value, dict_id: u64) {
            self.instance_dicts.borrow_mut().insert(obj.as_int() as u64, dict_id);
            self.dicts.borrow_mut().entry(dict_id).or_insert_with(Dict::new);
        }

        pub fn set_descriptor(&self, type_id: u64, name: &str, descr: Descriptor) {
            self.descriptors.borrow_mut().insert((type_id, name.into()), descr);
        }

        pub fn dict_insert(&self, dict_id: u64, name: &str, value: Value) {
            let mut dicts = self.dicts.borrow_mut();
            let dict = dicts.entry(dict_id).or_insert_with(Dict::new);
            dict.entries.insert(name.into(), value);
            dict.version += 1;
            if dict.is_split {
                if let Some(&idx) = dict.split_index.get(name) {
                    dict.values[idx] = value;
                }
            }
        }

        /// Marks `dict_id` as a split-key dict whose keys array contains
        /// exactly `names`, in order.
        pub fn make_split(&self, dict_id: u64, names: &[&str]) {
            let mut dicts = self.dicts.borrow_mut();
            let dict = dicts.entry(dict_id).or_insert_with(Dict::new);
            dict.is_split = true;
            dict.keys_id += 2; // stays even: never collides with the poison bit.
            dict.split_index.clear();
            dict.values.clear();
            for (i, name) in names.iter().enumerate() {
                dict.split_index.insert((*name).into(), i);
                let v = dict.entries.get(*name).copied().unwrap_or(Value::NULL);
                dict.values.push(v);
            }
        }

        /// Marks `dict_id`'s keys identity as poisoned from the host's own
        /// point of view: the dict was rebuilt onto a new (but
        /// same-shaped) keys object, so a cheap identity check can no
        /// longer confirm the split layout directly and the cache must
        /// fall back to `nentries` plus a descriptor.
        pub fn poison_keys(&self, dict_id: u64) {
            let mut dicts = self.dicts.borrow_mut();
            let dict = dicts.entry(dict_id).or_insert_with(Dict::new);
            dict.keys_poisoned = true;
        }

        pub fn new_module(&self, module_id: u64, dict_id: u64) -> ModuleRef {
            self.modules.borrow_mut().insert(module_id, dict_id);
            self.dicts.borrow_mut().entry(dict_id).or_insert_with(Dict::new);
            ModuleRef(Value::from_int(module_id as i64))
        }

        pub fn set_slot(&self, obj: Value, offset: isize, value: Value) {
            let id = obj.as_int() as u64;
            self.slots.borrow_mut().insert((id, offset), value);
        }
    }

    impl Host for MockHost {
        type Error = MockError;

        fn type_of(&self, obj: Value) -> TypeRef {
            let id = obj.as_int() as u64;
            let type_id = *self.types.borrow().get(&id).expect("object has no registered type");
            TypeRef(Value::from_int(type_id as i64))
        }
        fn type_id(&self, ty: TypeRef) -> EntityId {
            ty.0.as_int() as EntityId
        }
        fn module_id(&self, m: ModuleRef) -> EntityId {
            m.0.as_int() as EntityId
        }
        fn as_type_or_module(&self, _obj: Value) -> Option<TypeRef> {
            None
        }
        fn as_module(&self, obj: Value) -> Option<ModuleRef> {
            let id = obj.as_int() as u64;
            self.modules.borrow().contains_key(&id).then_some(ModuleRef(obj))
        }
        fn lookup_descriptor(&self, ty: TypeRef, name: &str) -> Option<Descriptor> {
            let type_id = ty.0.as_int() as u64;
            self.descriptors.borrow().get(&(type_id, name.into())).copied()
        }
        fn supports_weakrefs(&self, _ty: TypeRef) -> bool {
            true
        }
        fn incref(&self, _obj: Value) {}
        fn decref(&self, _obj: Value) {}
        fn instance_dict(&self, obj: Value) -> Option<DictRef> {
            let id = obj.as_int() as u64;
            self.instance_dicts
                .borrow()
                .get(&id)
                .map(|d| DictRef(Value::from_int(*d as i64)))
        }
        fn instance_dict_offset(&self, _ty: TypeRef) -> Option<isize> {
            None
        }
        fn dict_get(&self, dict: DictRef, name: &str) -> Result<Option<Value>, Self::Error> {
            let dict_id = dict.0.as_int() as u64;
            Ok(self.dicts.borrow().get(&dict_id).and_then(|d| d.entries.get(name).copied()))
        }
        fn dict_set(&self, dict: DictRef, name: &str, value: Value) -> Result<(), Self::Error> {
            self.dict_insert(dict.0.as_int() as u64, name, value);
            Ok(())
        }
        fn dict_version(&self, dict: DictRef) -> u64 {
            let dict_id = dict.0.as_int() as u64;
            self.dicts.borrow().get(&dict_id).map_or(0, |d| d.version)
        }
        fn dict_is_split(&self, dict: DictRef) -> bool {
            let dict_id = dict.0.as_int() as u64;
            self.dicts.borrow().get(&dict_id).is_some_and(|d| d.is_split)
        }
        fn dict_split_index(&self, dict: DictRef, name: &str) -> Option<usize> {
            let dict_id = dict.0.as_int() as u64;
            self.dicts.borrow().get(&dict_id).and_then(|d| d.split_index.get(name).copied())
        }
        fn dict_keys_id(&self, dict: DictRef) -> KeysId {
            let dict_id = dict.0.as_int() as u64;
            let dicts = self.dicts.borrow();
            let Some(d) = dicts.get(&dict_id) else {
                return KeysId::new(0);
            };
            let raw = KeysId::new(d.keys_id);
            if d.keys_poisoned {
                raw.poisoned()
            } else {
                raw
            }
        }
        fn dict_nentries(&self, dict: DictRef) -> usize {
            let dict_id = dict.0.as_int() as u64;
            self.dicts.borrow().get(&dict_id).map_or(0, |d| d.values.len())
        }
        fn dict_value_at(&self, dict: DictRef, index: usize) -> Option<Value> {
            let dict_id = dict.0.as_int() as u64;
            self.dicts.borrow().get(&dict_id).and_then(|d| d.values.get(index).copied())
        }
        fn module_dict(&self, m: ModuleRef) -> DictRef {
            let mid = m.0.as_int() as u64;
            let dict_id = *self.modules.borrow().get(&mid).expect("module has no registered dict");
            DictRef(Value::from_int(dict_id as i64))
        }
        fn globals_dict(&self) -> DictRef {
            DictRef(Value::from_int(self.globals as i64))
        }
        fn builtins_dict(&self) -> DictRef {
            DictRef(Value::from_int(self.builtins as i64))
        }
        fn descriptor_get(&self, descr: Value, _owner: Value, _ty: TypeRef) -> Result<Value, Self::Error> {
            Ok(descr)
        }
        fn descriptor_set(&self, _descr: Value, _owner: Value, _value: Value) -> Result<(), Self::Error> {
            Ok(())
        }
        fn slot_get(&self, obj: Value, offset: isize) -> Value {
            let id = obj.as_int() as u64;
            self.slots.borrow().get(&(id, offset)).copied().unwrap_or(Value::NULL)
        }
        fn slot_set(&self, obj: Value, offset: isize, value: Value) {
            let id = obj.as_int() as u64;
            self.slots.borrow_mut().insert((id, offset), value);
        }
        fn subscript_field(&self, _ty: TypeRef, _sub: Value) -> Option<(isize, u8)> {
            None
        }
        fn generic_subscript(&self, _container: Value, _sub: Value) -> Result<Value, Self::Error> {
            Ok(Value::NULL)
        }
    }
}
