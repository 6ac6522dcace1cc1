#![cfg_attr(not(test), no_std)]
//! Fast-path opcode handlers: the short inline sequence each specialized
//! opcode runs once a site has been given a cache entry. Every handler
//! guards on type identity first, resolves according to the entry's
//! shape, and increments the matching `cache_stats` counter.

use cache_stats::Opcode as StatsOpcode;
use host_iface::{DictRef, Host, TypeRef, Value};
use shape_cache::{FieldCacheEntry, GlobalCacheEntry, InstanceAttrEntry, ModuleAttrEntry, Shape};

/// A propagated host error or the cache-level "no such attribute"
/// outcome, distinct from a plain guard miss.
#[derive(Clone, Copy, Debug)]
pub enum FastPathError<E> {
    AttributeNotFound,
    Host(E),
}

/// The result of running a specialized opcode's fast path.
#[derive(Clone, Copy, Debug)]
pub enum FastPathOutcome<T, E> {
    Hit(T),
    Miss,
    Err(FastPathError<E>),
}

fn resolve_slot<H: Host>(host: &H, owner: Value, offset: isize) -> FastPathOutcome<Value, H::Error> {
    let v = host.slot_get(owner, offset);
    if v.is_null() {
        FastPathOutcome::Err(FastPathError::AttributeNotFound)
    } else {
        host.incref(v);
        FastPathOutcome::Hit(v)
    }
}

fn resolve_dict_no_descr<H: Host>(
    host: &H,
    owner: Value,
    entry: &InstanceAttrEntry,
) -> FastPathOutcome<Value, H::Error> {
    let Some(dict) = host.instance_dict(owner) else {
        return FastPathOutcome::Miss;
    };
    match host.dict_get(dict, &entry.name) {
        Ok(Some(v)) => {
            host.incref(v);
            FastPathOutcome::Hit(v)
        }
        Ok(None) => FastPathOutcome::Err(FastPathError::AttributeNotFound),
        Err(e) => FastPathOutcome::Err(FastPathError::Host(e)),
    }
}

fn resolve_dict_descr<H: Host>(
    host: &H,
    owner: Value,
    entry: &InstanceAttrEntry,
) -> FastPathOutcome<Value, H::Error> {
    let Some(dict) = host.instance_dict(owner) else {
        return FastPathOutcome::Miss;
    };
    let descriptor = entry.descriptor;
    match host.dict_get(dict, &entry.name) {
        Ok(Some(v)) => {
            host.incref(v);
            FastPathOutcome::Hit(v)
        }
        Ok(None) => {
            let Some(ty) = entry.ty else {
                return FastPathOutcome::Miss;
            };
            let Some(descr) = descriptor else {
                return FastPathOutcome::Err(FastPathError::AttributeNotFound);
            };
            match host.descriptor_get(descr, owner, ty) {
                Ok(v) => FastPathOutcome::Hit(v),
                Err(e) => FastPathOutcome::Err(FastPathError::Host(e)),
            }
        }
        Err(e) => FastPathOutcome::Err(FastPathError::Host(e)),
    }
}

fn resolve_no_dict_descr<H: Host>(
    host: &H,
    owner: Value,
    entry: &InstanceAttrEntry,
) -> FastPathOutcome<Value, H::Error> {
    let (Some(ty), Some(descr)) = (entry.ty, entry.descriptor) else {
        return FastPathOutcome::Miss;
    };
    match host.descriptor_get(descr, owner, ty) {
        Ok(v) => FastPathOutcome::Hit(v),
        Err(e) => FastPathOutcome::Err(FastPathError::Host(e)),
    }
}

/// Split-dict resolution, covering both `SplitDict` and `SplitDictDescr`
/// shapes. When the dict's keys are the poisoned variant of the cached
/// identity and `nentries` matches, the shape hasn't changed since the
/// last lookup (only possibly re-confirmed as poisoned): a present key
/// (`entry.split_index == Some(idx)`) is read back from the dict, and
/// only a genuine *negative hit* — no such key at specialization time,
/// `entry.split_index == None` — falls back to the type's descriptor.
fn resolve_split_dict<H: Host>(
    host: &H,
    owner: Value,
    entry: &InstanceAttrEntry,
) -> FastPathOutcome<Value, H::Error> {
    let Some(dict) = host.instance_dict(owner) else {
        return FastPathOutcome::Miss;
    };
    let Some(cached_keys) = entry.keys_id else {
        return FastPathOutcome::Miss;
    };
    let current_keys = host.dict_keys_id(dict);
    if current_keys.same_keys(cached_keys) && !current_keys.is_poisoned() {
        let Some(index) = entry.split_index else {
            return FastPathOutcome::Miss;
        };
        #[allow(clippy::cast_sign_loss)]
        return match host.dict_value_at(dict, index as usize) {
            Some(v) => {
                host.incref(v);
                FastPathOutcome::Hit(v)
            }
            None => FastPathOutcome::Err(FastPathError::AttributeNotFound),
        };
    }
    if current_keys.same_keys(cached_keys.poisoned())
        && host.dict_nentries(dict) == entry.nentries
    {
        // The shape hasn't changed, only re-confirmed as poisoned, so the
        // split index (if any) is still valid. A *negative hit* — no such
        // key at specialization time, `entry.split_index == None` — still
        // resolves through the type's descriptor without re-probing the
        // dict. When the key does exist (`Some(idx)`), the key is really
        // there; read it back from the dict rather than substituting the
        // (possibly stale) descriptor value.
        return match entry.split_index {
            #[allow(clippy::cast_sign_loss)]
            Some(idx) => match host.dict_value_at(dict, idx as usize) {
                Some(v) => {
                    host.incref(v);
                    FastPathOutcome::Hit(v)
                }
                None => FastPathOutcome::Err(FastPathError::AttributeNotFound),
            },
            None => match entry.descriptor {
                Some(descr) => match entry.ty {
                    Some(ty) => match host.descriptor_get(descr, owner, ty) {
                        Ok(v) => FastPathOutcome::Hit(v),
                        Err(e) => FastPathOutcome::Err(FastPathError::Host(e)),
                    },
                    None => FastPathOutcome::Miss,
                },
                None => FastPathOutcome::Err(FastPathError::AttributeNotFound),
            },
        };
    }
    FastPathOutcome::Miss
}

/// `LOAD_ATTR` fast path.
pub fn load_attr<H: Host>(
    host: &H,
    entry: &InstanceAttrEntry,
    owner: Value,
) -> FastPathOutcome<Value, H::Error> {
    let Some(ty) = entry.ty else {
        cache_stats::GLOBAL.record_miss(StatsOpcode::LoadAttr);
        return FastPathOutcome::Miss;
    };
    if host.type_of(owner) != ty {
        cache_stats::GLOBAL.record_miss(StatsOpcode::LoadAttr);
        return FastPathOutcome::Miss;
    }
    let result = match entry.shape {
        Shape::Slot => resolve_slot(host, owner, entry.slot_offset),
        Shape::DictNoDescr => resolve_dict_no_descr(host, owner, entry),
        Shape::DictDescr => resolve_dict_descr(host, owner, entry),
        Shape::SplitDict | Shape::SplitDictDescr => resolve_split_dict(host, owner, entry),
        Shape::NoDictDescr => resolve_no_dict_descr(host, owner, entry),
    };
    record_outcome(StatsOpcode::LoadAttr, &result);
    result
}

/// `STORE_ATTR` fast path. Slot shapes write through directly; dict
/// shapes with a data descriptor call `descriptor_set`; plain dict
/// shapes write the dict entry.
pub fn store_attr<H: Host>(
    host: &H,
    entry: &InstanceAttrEntry,
    owner: Value,
    value: Value,
) -> FastPathOutcome<(), H::Error> {
    let Some(ty) = entry.ty else {
        cache_stats::GLOBAL.record_miss(StatsOpcode::StoreAttr);
        return FastPathOutcome::Miss;
    };
    if host.type_of(owner) != ty {
        cache_stats::GLOBAL.record_miss(StatsOpcode::StoreAttr);
        return FastPathOutcome::Miss;
    }
    let result = match entry.shape {
        Shape::Slot => {
            host.incref(value);
            host.slot_set(owner, entry.slot_offset, value);
            FastPathOutcome::Hit(())
        }
        // A data descriptor's setter always wins. A non-data descriptor
        // has no `__set__`; the write goes straight to the instance dict,
        // same as the no-descriptor shapes, and will shadow the
        // descriptor on future reads.
        Shape::DictDescr | Shape::SplitDictDescr if entry.is_data_descriptor => match entry.descriptor {
            Some(descr) => match host.descriptor_set(descr, owner, value) {
                Ok(()) => FastPathOutcome::Hit(()),
                Err(e) => FastPathOutcome::Err(FastPathError::Host(e)),
            },
            None => FastPathOutcome::Miss,
        },
        Shape::DictDescr | Shape::SplitDictDescr | Shape::DictNoDescr | Shape::SplitDict => match host.instance_dict(owner) {
            Some(dict) => match host.dict_set(dict, &entry.name, value) {
                Ok(()) => FastPathOutcome::Hit(()),
                Err(e) => FastPathOutcome::Err(FastPathError::Host(e)),
            },
            None => FastPathOutcome::Miss,
        },
        Shape::NoDictDescr => FastPathOutcome::Miss,
    };
    record_outcome(StatsOpcode::StoreAttr, &result);
    result
}

/// `LOAD_METHOD` fast path: returns `(receiver_or_null, method)`. For an
/// unbound-function shape the receiver is the instance itself; when the
/// entry was not a method-shaped one, behaves like [`load_attr`] with a
/// null receiver (the method has already been bound by a descriptor).
pub fn load_method<H: Host>(
    host: &H,
    entry: &InstanceAttrEntry,
    owner: Value,
) -> FastPathOutcome<(Value, Value), H::Error> {
    let Some(ty) = entry.ty else {
        cache_stats::GLOBAL.record_miss(StatsOpcode::LoadMethod);
        return FastPathOutcome::Miss;
    };
    if host.type_of(owner) != ty {
        cache_stats::GLOBAL.record_miss(StatsOpcode::LoadMethod);
        return FastPathOutcome::Miss;
    }
    let result = match entry.kind {
        shape_cache::AccessKind::Method => match entry.descriptor {
            Some(func) => {
                host.incref(owner);
                host.incref(func);
                FastPathOutcome::Hit((owner, func))
            }
            None => FastPathOutcome::Miss,
        },
        shape_cache::AccessKind::Attr => match load_attr(host, entry, owner) {
            FastPathOutcome::Hit(v) => FastPathOutcome::Hit((Value::NULL, v)),
            FastPathOutcome::Miss => FastPathOutcome::Miss,
            FastPathOutcome::Err(e) => FastPathOutcome::Err(e),
        },
    };
    record_outcome(StatsOpcode::LoadMethod, &result);
    result
}

/// `LOAD_GLOBAL` fast path for a name cached against the (globals,
/// builtins) version pair.
pub fn load_global(entry: &GlobalCacheEntry, globals_version: u64, builtins_version: u64) -> FastPathOutcome<Value, core::convert::Infallible> {
    let hit = entry.globals_version == globals_version && entry.builtins_version == builtins_version;
    if hit {
        cache_stats::GLOBAL.record_hit(StatsOpcode::LoadGlobal);
        FastPathOutcome::Hit(entry.value)
    } else {
        cache_stats::GLOBAL.record_miss(StatsOpcode::LoadGlobal);
        FastPathOutcome::Miss
    }
}

/// `LOAD_ATTR` on a module object: a *slight miss* when only the
/// module's dict version changed is modeled by the caller re-reading and
/// calling [`refresh_module_entry`] rather than falling all the way back
/// to the dispatcher.
pub fn load_module_attr<H: Host>(
    host: &H,
    entry: &ModuleAttrEntry,
    m: host_iface::ModuleRef,
) -> FastPathOutcome<Value, H::Error> {
    let dict = host.module_dict(m);
    let current = host.dict_version(dict);
    if current == entry.module_dict_version {
        cache_stats::GLOBAL.record_hit(StatsOpcode::LoadAttr);
        host.incref(entry.value);
        return FastPathOutcome::Hit(entry.value);
    }
    cache_stats::GLOBAL.record_slight_miss(StatsOpcode::LoadAttr);
    match host.dict_get(dict, &entry.name) {
        Ok(Some(v)) => FastPathOutcome::Hit(v),
        Ok(None) => FastPathOutcome::Err(FastPathError::AttributeNotFound),
        Err(e) => FastPathOutcome::Err(FastPathError::Host(e)),
    }
}

/// Refreshes a module entry after a slight miss: callers re-read the
/// value themselves (since a dict lookup may invoke `__eq__`); this just
/// writes the confirmed version/value back into the entry.
pub fn refresh_module_entry(entry: &mut ModuleAttrEntry, version: u64, value: Value) {
    entry.module_dict_version = version;
    entry.value = value;
}

/// `BINARY_SUBSCR` fast path for a primitive fixed-offset field access.
pub fn binary_subscr<H: Host>(
    host: &H,
    entry: &FieldCacheEntry,
    container: Value,
) -> FastPathOutcome<Value, H::Error> {
    let Some(ty) = entry.ty else {
        cache_stats::GLOBAL.record_miss(StatsOpcode::BinarySubscr);
        return FastPathOutcome::Miss;
    };
    if host.type_of(container) != ty {
        cache_stats::GLOBAL.record_miss(StatsOpcode::BinarySubscr);
        return FastPathOutcome::Miss;
    }
    let v = host.slot_get(container, entry.offset);
    let result = if v.is_null() {
        FastPathOutcome::Err(FastPathError::AttributeNotFound)
    } else {
        host.incref(v);
        FastPathOutcome::Hit(v)
    };
    record_outcome(StatsOpcode::BinarySubscr, &result);
    result
}

fn record_outcome<T, E>(op: StatsOpcode, result: &FastPathOutcome<T, E>) {
    match result {
        FastPathOutcome::Hit(_) => cache_stats::GLOBAL.record_hit(op),
        FastPathOutcome::Miss => cache_stats::GLOBAL.record_miss(op),
        FastPathOutcome::Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_iface::{Descriptor, EntityId};
    use shape_cache::AccessKind;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MockError;

    struct MockHost {
        types: RefCell<BTreeMap<u64, TypeRef>>,
        slots: RefCell<BTreeMap<(u64, isize), Value>>,
    }

    impl MockHost {
        fn new() -> Self {
            MockHost {
                types: RefCell::new(BTreeMap::new()),
                slots: RefCell::new(BTreeMap::new()),
            }
        }

        fn set_type(&self, obj_id: u64, ty: TypeRef) {
            self.types.borrow_mut().insert(obj_id, ty);
        }

        fn set_slot(&self, obj_id: u64, offset: isize, value: Value) {
            self.slots.borrow_mut().insert((obj_id, offset), value);
        }
    }

    fn obj(id: u64) -> Value {
        Value::from_int(id as i64)
    }

    fn type_ref(id: u64) -> TypeRef {
        TypeRef(Value::from_int(id as i64))
    }

    impl Host for MockHost {
        type Error = MockError;

        fn type_of(&self, obj: Value) -> TypeRef {
            let id = obj.as_int() as u64;
            *self.types.borrow().get(&id).unwrap()
        }
        fn type_id(&self, ty: TypeRef) -> EntityId {
            ty.0.as_int() as EntityId
        }
        fn module_id(&self, m: host_iface::ModuleRef) -> EntityId {
            m.0.as_int() as EntityId
        }
        fn as_type_or_module(&self, _obj: Value) -> Option<TypeRef> {
            None
        }
        fn as_module(&self, _obj: Value) -> Option<host_iface::ModuleRef> {
            None
        }
        fn lookup_descriptor(&self, _ty: TypeRef, _name: &str) -> Option<Descriptor> {
            None
        }
        fn supports_weakrefs(&self, _ty: TypeRef) -> bool {
            true
        }
        fn incref(&self, _obj: Value) {}
        fn decref(&self, _obj: Value) {}
        fn instance_dict(&self, _obj: Value) -> Option<DictRef> {
            None
        }
        fn instance_dict_offset(&self, _ty: TypeRef) -> Option<isize> {
            None
        }
        fn dict_get(&self, _dict: DictRef, _name: &str) -> Result<Option<Value>, Self::Error> {
            Ok(None)
        }
        fn dict_set(&self, _dict: DictRef, _name: &str, _value: Value) -> Result<(), Self::Error> {
            Ok(())
        }
        fn dict_version(&self, _dict: DictRef) -> u64 {
            0
        }
        fn dict_is_split(&self, _dict: DictRef) -> bool {
            false
        }
        fn dict_split_index(&self, _dict: DictRef, _name: &str) -> Option<usize> {
            None
        }
        fn dict_keys_id(&self, _dict: DictRef) -> host_iface::KeysId {
            host_iface::KeysId::new(0)
        }
        fn dict_nentries(&self, _dict: DictRef) -> usize {
            0
        }
        fn dict_value_at(&self, _dict: DictRef, _index: usize) -> Option<Value> {
            None
        }
        fn module_dict(&self, _m: host_iface::ModuleRef) -> DictRef {
            DictRef(Value::NULL)
        }
        fn globals_dict(&self) -> DictRef {
            DictRef(Value::NULL)
        }
        fn builtins_dict(&self) -> DictRef {
            DictRef(Value::NULL)
        }
        fn descriptor_get(&self, descr: Value, _owner: Value, _ty: TypeRef) -> Result<Value, Self::Error> {
            Ok(descr)
        }
        fn descriptor_set(&self, _descr: Value, _owner: Value, _value: Value) -> Result<(), Self::Error> {
            Ok(())
        }
        fn slot_get(&self, obj: Value, offset: isize) -> Value {
            let id = obj.as_int() as u64;
            self.slots
                .borrow()
                .get(&(id, offset))
                .copied()
                .unwrap_or(Value::NULL)
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

    #[test]
    fn slot_hit_returns_stored_value() {
        let host = MockHost::new();
        host.set_type(1, type_ref(100));
        host.set_slot(1, 24, Value::from_int(42));
        let entry = InstanceAttrEntry::new(
            "x".into(),
            type_ref(100),
            Shape::Slot,
            AccessKind::Attr,
        );
        let mut entry = entry;
        entry.slot_offset = 24;
        match load_attr(&host, &entry, obj(1)) {
            FastPathOutcome::Hit(v) => assert_eq!(v.as_int(), 42),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn type_mismatch_is_a_guard_miss() {
        let host = MockHost::new();
        host.set_type(1, type_ref(200));
        let entry = InstanceAttrEntry::new(
            "x".into(),
            type_ref(100),
            Shape::Slot,
            AccessKind::Attr,
        );
        assert!(matches!(load_attr(&host, &entry, obj(1)), FastPathOutcome::Miss));
    }

    #[test]
    fn load_global_hits_when_versions_match() {
        let entry = GlobalCacheEntry {
            name: "len".into(),
            globals_version: 3,
            builtins_version: 7,
            value: Value::from_int(1),
        };
        match load_global(&entry, 3, 7) {
            FastPathOutcome::Hit(v) => assert_eq!(v.as_int(), 1),
            other => panic!("expected hit, got {other:?}"),
        }
        assert!(matches!(load_global(&entry, 4, 7), FastPathOutcome::Miss));
    }

    #[test]
    fn store_attr_on_slot_writes_through() {
        let host = MockHost::new();
        host.set_type(1, type_ref(100));
        let mut entry = InstanceAttrEntry::new(
            "x".into(),
            type_ref(100),
            Shape::Slot,
            AccessKind::Attr,
        );
        entry.slot_offset = 8;
        assert!(matches!(
            store_attr(&host, &entry, obj(1), Value::from_int(9)),
            FastPathOutcome::Hit(())
        ));
        assert_eq!(host.slot_get(obj(1), 8).as_int(), 9);
    }

    #[test]
    fn load_method_returns_unbound_function_and_receiver() {
        let host = MockHost::new();
        host.set_type(1, type_ref(100));
        let mut entry = InstanceAttrEntry::new(
            "run".into(),
            type_ref(100),
            Shape::DictNoDescr,
            AccessKind::Method,
        );
        entry.descriptor = Some(Value::from_int(55));
        match load_method(&host, &entry, obj(1)) {
            FastPathOutcome::Hit((receiver, method)) => {
                assert_eq!(receiver.as_int(), 1);
                assert_eq!(method.as_int(), 55);
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }
}
