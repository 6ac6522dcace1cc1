#![cfg_attr(not(test), no_std)]
//! Specialization dispatcher: turns a descriptor lookup and a bit of
//! instance shape into the cache-entry variant a site should specialize
//! to, and promotes a monomorphic site to polymorphic when a second type
//! shows up.

extern crate alloc;

pub use host_iface::{AccessOp, Descriptor, DescriptorKind};
use host_iface::{CodeBuffer, EntityId};
use shape_cache::{AccessKind, InstanceAttrEntry, Shape};
use shadow_arena::{Arena, ArenaError};
use type_registry::Registry;

/// Which concrete cache variant a `(descriptor, op, dict shape)` triple
/// resolves to, or `Uncacheable` if none applies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Classification {
    Slot(isize),
    DictNoDescr,
    DictDescr,
    SplitDict,
    SplitDictDescr,
    NoDictDescr,
    DictMethod,
    SplitDictMethod,
    NoDictMethod,
    Uncacheable,
}

/// Pure classifier with no side effects: the tie-break order (Slot >
/// SplitDict > Dict > Descr > Method) falls directly out of the match
/// arm order below, so it can be exercised as a truth table without a
/// live object model.
#[must_use]
pub fn classify(
    descriptor: Option<Descriptor>,
    op: AccessOp,
    has_instance_dict: bool,
    dict_is_split: bool,
) -> Classification {
    match descriptor.map(|d| d.kind) {
        Some(DescriptorKind::Slot(offset)) => Classification::Slot(offset),
        Some(DescriptorKind::Data) => {
            classify_dict_shape(has_instance_dict, dict_is_split, false)
        }
        Some(DescriptorKind::NonData) if op == AccessOp::LoadMethod => {
            classify_dict_shape(has_instance_dict, dict_is_split, true)
        }
        Some(DescriptorKind::NonData) => {
            classify_dict_shape(has_instance_dict, dict_is_split, false)
        }
        None => {
            if !has_instance_dict {
                Classification::Uncacheable
            } else if dict_is_split {
                Classification::SplitDict
            } else {
                Classification::DictNoDescr
            }
        }
    }
}

fn classify_dict_shape(has_instance_dict: bool, dict_is_split: bool, method: bool) -> Classification {
    match (has_instance_dict, dict_is_split, method) {
        (false, _, false) => Classification::NoDictDescr,
        (false, _, true) => Classification::NoDictMethod,
        (true, true, false) => Classification::SplitDictDescr,
        (true, true, true) => Classification::SplitDictMethod,
        (true, false, false) => Classification::DictDescr,
        (true, false, true) => Classification::DictMethod,
    }
}

/// Maps a resolved classification onto the `(Shape, AccessKind)` pair an
/// `InstanceAttrEntry` is constructed with. `None` for `Uncacheable`,
/// which never becomes an entry.
#[must_use]
pub fn shape_of(classification: Classification) -> Option<(Shape, AccessKind)> {
    match classification {
        Classification::Slot(_) => Some((Shape::Slot, AccessKind::Attr)),
        Classification::DictNoDescr => Some((Shape::DictNoDescr, AccessKind::Attr)),
        Classification::DictDescr => Some((Shape::DictDescr, AccessKind::Attr)),
        Classification::SplitDict => Some((Shape::SplitDict, AccessKind::Attr)),
        Classification::SplitDictDescr => Some((Shape::SplitDictDescr, AccessKind::Attr)),
        Classification::NoDictDescr => Some((Shape::NoDictDescr, AccessKind::Attr)),
        Classification::DictMethod => Some((Shape::DictNoDescr, AccessKind::Method)),
        Classification::SplitDictMethod => Some((Shape::SplitDict, AccessKind::Method)),
        Classification::NoDictMethod => Some((Shape::NoDictDescr, AccessKind::Method)),
        Classification::Uncacheable => None,
    }
}

/// Promotes a site already holding a monomorphic `InstanceAttrEntry` to
/// a polymorphic one, inserting `other` alongside the entry already
/// resident at `l1_index`. The caller is responsible for rewriting the
/// bytecode operand to reference the returned polymorphic table index.
pub fn promote<C: CodeBuffer>(
    arena: &mut Arena<C>,
    registry: &mut Registry,
    l1_index: usize,
    other_owner: EntityId,
    other: InstanceAttrEntry,
) -> Result<usize, ArenaError> {
    arena.promote_to_polymorphic(registry, l1_index, other_owner, other)
}
