#![cfg_attr(not(test), no_std)]
//! Host collaborator traits.
//!
//! The cache never touches the interpreter's object model directly; it
//! only ever calls through [`Host`] (and patches bytecode only through
//! [`CodeBuffer`]). An embedding interpreter implements both traits once,
//! over whatever representation it already uses for objects, types,
//! dictionaries and modules.

pub use tagged_value::Value;

/// Opaque identity for a type or module, used to key the weak directory
/// map in `type_registry`. The host is free to derive this however it
/// likes (an allocation address, an interned index, ...) as long as it is
/// stable for the lifetime of the referent and never reused while any
/// cache entry still depends on it.
pub type EntityId = u64;

/// A type object, referenced weakly: the cache never owns a strong
/// reference to it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TypeRef(pub Value);

/// A dictionary, referenced weakly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DictRef(pub Value);

/// A module object, referenced weakly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ModuleRef(pub Value);

/// Identity of a dict's keys object, with the low bit reserved as a
/// "poisoned" marker. A poisoned id marks a previously observed keys
/// shape without retaining a real reference to it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KeysId(u64);

impl KeysId {
    /// Wraps a raw keys-object identity. The low bit of `raw` is
    /// discarded; use [`KeysId::poisoned`] to set the marker explicitly.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        KeysId(raw & !1)
    }

    /// The poisoned variant of this identity: same keys, low bit set.
    #[must_use]
    pub const fn poisoned(self) -> Self {
        KeysId(self.0 | 1)
    }

    #[must_use]
    pub const fn is_poisoned(self) -> bool {
        self.0 & 1 != 0
    }

    /// Compares two ids ignoring the poison marker.
    #[must_use]
    pub const fn same_keys(self, other: KeysId) -> bool {
        (self.0 | 1) == (other.0 | 1)
    }
}

/// How an attribute name resolves on a type, per the metatype's descriptor
/// lookup.
#[derive(Clone, Copy, Debug)]
pub enum DescriptorKind {
    /// Has both `__get__` and `__set__`: always wins over the instance
    /// dict.
    Data,
    /// Has only `__get__` (e.g. a plain function, usable as a bound
    /// method): loses to the instance dict.
    NonData,
    /// Stored at a fixed byte offset within the instance.
    Slot(isize),
}

/// The result of a descriptor lookup on a type.
#[derive(Clone, Copy, Debug)]
pub struct Descriptor {
    pub value: Value,
    pub kind: DescriptorKind,
}

/// Which opcode family a cache site is being specialized for. Carried
/// explicitly because the dispatcher only ever picks a `Method` variant
/// when the *caller* opcode is a method load.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessOp {
    LoadAttr,
    LoadMethod,
    StoreAttr,
}

/// The object model operations the cache consumes. All methods are
/// expected to be cheap and side-effect-free *except* [`Host::descriptor_get`]
/// and [`Host::descriptor_set`], which may run arbitrary user code (a
/// `__get__`/`__set__` override) and [`Host::dict_get`]/[`Host::dict_set`],
/// which may invoke `__eq__` on the key. Fast-path handlers must incref
/// before, and re-validate after, calling either.
pub trait Host {
    /// Propagated verbatim on any object-model failure.
    type Error: core::fmt::Debug;

    fn type_of(&self, obj: Value) -> TypeRef;
    fn type_id(&self, ty: TypeRef) -> EntityId;
    fn module_id(&self, m: ModuleRef) -> EntityId;

    /// `Some(ty)` if `obj` itself is a type whose own attributes resolve
    /// `name` directly (spec.md §4.E step 1, type case).
    fn as_type_or_module(&self, obj: Value) -> Option<TypeRef>;

    /// `Some(m)` if `obj` is itself a module whose own attributes resolve
    /// `name` directly (spec.md §4.E step 1, module case). Disjoint from
    /// [`Host::as_type_or_module`]: an object is never both.
    fn as_module(&self, obj: Value) -> Option<ModuleRef>;

    fn lookup_descriptor(&self, ty: TypeRef, name: &str) -> Option<Descriptor>;
    fn supports_weakrefs(&self, ty: TypeRef) -> bool;

    fn incref(&self, obj: Value);
    fn decref(&self, obj: Value);

    /// The instance's own dict, if it has one (combined or split).
    fn instance_dict(&self, obj: Value) -> Option<DictRef>;
    /// Byte offset of the dict pointer within instances of `ty`, or
    /// `None` if the dict must be located some other (computed) way.
    fn instance_dict_offset(&self, ty: TypeRef) -> Option<isize>;

    fn dict_get(&self, dict: DictRef, name: &str) -> Result<Option<Value>, Self::Error>;
    fn dict_set(&self, dict: DictRef, name: &str, value: Value) -> Result<(), Self::Error>;
    fn dict_version(&self, dict: DictRef) -> u64;
    fn dict_is_split(&self, dict: DictRef) -> bool;
    fn dict_split_index(&self, dict: DictRef, name: &str) -> Option<usize>;
    fn dict_keys_id(&self, dict: DictRef) -> KeysId;
    fn dict_nentries(&self, dict: DictRef) -> usize;
    fn dict_value_at(&self, dict: DictRef, index: usize) -> Option<Value>;

    fn module_dict(&self, m: ModuleRef) -> DictRef;
    fn globals_dict(&self) -> DictRef;
    fn builtins_dict(&self) -> DictRef;

    fn descriptor_get(&self, descr: Value, owner: Value, ty: TypeRef) -> Result<Value, Self::Error>;
    fn descriptor_set(&self, descr: Value, owner: Value, value: Value) -> Result<(), Self::Error>;

    fn slot_get(&self, obj: Value, offset: isize) -> Value;
    fn slot_set(&self, obj: Value, offset: isize, value: Value);

    /// For containers with a fixed primitive layout (e.g. a typed array or
    /// struct-like record), the byte offset and field-type tag `sub`
    /// resolves to within instances of `ty`, if this subscript site is
    /// specializable at all. `None` means `sub`'s resolution depends on
    /// more than the container's type alone, and every execution must go
    /// through [`Host::generic_subscript`].
    fn subscript_field(&self, ty: TypeRef, sub: Value) -> Option<(isize, u8)>;

    /// The full, uncached `container[sub]` operation: run on a site's
    /// first execution and whenever [`Host::subscript_field`] reports the
    /// access isn't specializable.
    fn generic_subscript(&self, container: Value, sub: Value) -> Result<Value, Self::Error>;
}

/// A code object's bytecode: a sequence of two-byte `(opcode, operand)`
/// units, with an in-place rewrite API. Patching a single instruction is
/// safe without additional synchronization only because the interpreter
/// holds an exclusive execution lock while it runs.
pub trait CodeBuffer {
    fn len(&self) -> usize;
    fn read(&self, ip: usize) -> (u8, u8);

    /// Atomically (with respect to any other access from the *same*
    /// thread's instruction stream) rewrites the instruction at `ip`.
    fn write(&mut self, ip: usize, opcode: u8, operand: u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_id_poison_roundtrip() {
        let k = KeysId::new(0xcafe_d00d << 1);
        assert!(!k.is_poisoned());
        let p = k.poisoned();
        assert!(p.is_poisoned());
        assert!(k.same_keys(p));
        assert!(p.same_keys(k));
    }

    #[test]
    fn keys_id_different_keys_do_not_match() {
        let a = KeysId::new(2);
        let b = KeysId::new(4);
        assert!(!a.same_keys(b));
    }
}
