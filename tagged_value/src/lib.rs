#![cfg_attr(not(test), no_std)]
//! Tagged machine-word value representation.
//!
//! A [`Value`] is a single 64-bit word that is either a pointer to a heap
//! object or a small signed integer, discriminated by the low three bits.
//!
//! # Encoding
//! - bits `0..3` (`tag`): `0` means "heap object pointer" (the word itself
//!   is the pointer, naturally 8-byte aligned so its low three bits are
//!   already zero); `1` means "tagged integer", whose signed value occupies
//!   the remaining 61 bits (sign-extended on decode). Tags `2..=7` are
//!   reserved for tagged floats and are never produced by this crate.
//! - the all-zero word is `Value::NULL`.
//!
//! Every function here is a pure bit operation: no branching on endianness,
//! no sign-extension beyond what the encoding requires.

use core::fmt;
use core::ptr::NonNull;

/// Low bits set on a word carrying a tagged integer.
const INT_TAG: u64 = 1;
/// Mask over the tag field.
const TAG_MASK: u64 = 0b111;
/// Number of bits given to the tag.
const TAG_BITS: u32 = 3;

/// Largest integer representable in the 61 remaining bits.
pub const MAX_TAGGED_INT: i64 = (1i64 << (64 - TAG_BITS - 1)) - 1;
/// Smallest integer representable in the 61 remaining bits.
pub const MIN_TAGGED_INT: i64 = -(1i64 << (64 - TAG_BITS - 1));

/// A machine word carrying either a heap-object pointer or a tagged integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    /// The null value: the all-zero word, decodes as a null object pointer.
    pub const NULL: Value = Value(0);

    /// Encodes a signed integer as a tagged value.
    ///
    /// # Panics
    /// Panics (in debug builds, via `debug_assert!`) if `i` does not fit in
    /// `[MIN_TAGGED_INT, MAX_TAGGED_INT]`. Callers that are not statically
    /// sure the value fits should use [`Value::checked_from_int`] instead
    /// and box the integer on the heap when it returns `None`.
    #[inline]
    #[must_use]
    pub fn from_int(i: i64) -> Self {
        debug_assert!((MIN_TAGGED_INT..=MAX_TAGGED_INT).contains(&i));
        Value(((i as u64) << TAG_BITS) | INT_TAG)
    }

    /// Encodes a signed integer as a tagged value, or `None` if it doesn't
    /// fit in the taggable range (the caller must then allocate a heap
    /// integer instead).
    #[inline]
    #[must_use]
    pub fn checked_from_int(i: i64) -> Option<Self> {
        if (MIN_TAGGED_INT..=MAX_TAGGED_INT).contains(&i) {
            Some(Value(((i as u64) << TAG_BITS) | INT_TAG))
        } else {
            None
        }
    }

    /// Wraps a heap-object pointer. The pointer must be 8-byte aligned so
    /// its low three bits are zero; a null pointer encodes [`Value::NULL`].
    #[inline]
    #[must_use]
    pub fn from_object(ptr: Option<NonNull<()>>) -> Self {
        match ptr {
            None => Value::NULL,
            Some(p) => {
                let word = p.as_ptr() as u64;
                debug_assert!(word & TAG_MASK == 0, "heap pointer must be 8-byte aligned");
                Value(word)
            }
        }
    }

    /// `true` if this word carries a tagged integer.
    #[inline]
    #[must_use]
    pub const fn is_int(self) -> bool {
        self.0 & TAG_MASK == INT_TAG
    }

    /// `true` if this word carries a heap-object pointer (including null).
    #[inline]
    #[must_use]
    pub const fn is_object(self) -> bool {
        self.0 & TAG_MASK == 0
    }

    /// `true` if this is the null value.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Decodes the tagged integer, sign-extended. Undefined result (but not
    /// unsafe) if `is_int()` is false; callers must check first.
    #[inline]
    #[must_use]
    pub const fn as_int(self) -> i64 {
        (self.0 as i64) >> TAG_BITS
    }

    /// Decodes the heap-object pointer, or `None` for the null value.
    /// Returns garbage (but is not unsafe) if `is_object()` is false.
    #[inline]
    #[must_use]
    pub fn as_object(self) -> Option<NonNull<()>> {
        NonNull::new(self.0 as *mut ())
    }

    /// Runs `rc` on the decoded pointer if this value is a non-null heap
    /// object; a no-op for tagged integers and for null. Used by callers
    /// that need to incref a value before running code that might trigger
    /// a GC or invalidate a cache entry.
    #[inline]
    pub fn incref(self, rc: impl FnOnce(NonNull<()>)) -> Self {
        if let Some(p) = self.as_object() {
            rc(p);
        }
        self
    }

    /// Runs `rc` on the decoded pointer if this value is a non-null heap
    /// object; a no-op for tagged integers and for null.
    #[inline]
    pub fn decref(self, rc: impl FnOnce(NonNull<()>)) {
        if let Some(p) = self.as_object() {
            rc(p);
        }
    }

    /// Decrefs (if a heap object) and resets `self` to [`Value::NULL`].
    #[inline]
    pub fn clear(&mut self, rc: impl FnOnce(NonNull<()>)) {
        self.decref(rc);
        *self = Value::NULL;
    }

    /// The raw word, for diagnostics only.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NULL
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Value::Null")
        } else if self.is_int() {
            write!(f, "Value::Int({})", self.as_int())
        } else {
            write!(f, "Value::Ptr({:#x})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        for i in [
            MIN_TAGGED_INT,
            -1,
            0,
            1,
            MAX_TAGGED_INT,
        ] {
            let v = Value::from_int(i);
            assert!(v.is_int());
            assert!(!v.is_object());
            assert_eq!(v.as_int(), i);
        }
    }

    #[test]
    fn out_of_range_must_be_boxed() {
        assert_eq!(Value::checked_from_int(MAX_TAGGED_INT + 1), None);
        assert_eq!(Value::checked_from_int(MIN_TAGGED_INT - 1), None);
        assert!(Value::checked_from_int(MAX_TAGGED_INT).is_some());
    }

    #[test]
    fn null_is_all_zero_and_object() {
        let v = Value::NULL;
        assert!(v.is_null());
        assert!(v.is_object());
        assert!(!v.is_int());
        assert_eq!(v.as_object(), None);
        assert_eq!(Value::from_object(None), v);
    }

    #[test]
    fn object_round_trip() {
        let mut x = 7u64;
        let ptr = NonNull::new(&raw mut x).unwrap().cast::<()>();
        // align_of::<u64>() is 8 on every target this crate runs on.
        let v = Value::from_object(Some(ptr));
        assert!(v.is_object());
        assert!(!v.is_int());
        assert_eq!(v.as_object(), Some(ptr));
        assert_eq!(Value::from_object(v.as_object()), v);
    }

    #[test]
    fn is_int_xor_is_object() {
        let values = [
            Value::NULL,
            Value::from_int(0),
            Value::from_int(-1),
            Value::from_int(MAX_TAGGED_INT),
        ];
        for v in values {
            assert_ne!(v.is_int(), v.is_object());
        }
    }

    #[test]
    fn incref_decref_are_noop_on_int() {
        let v = Value::from_int(42);
        let mut called = false;
        let v = v.incref(|_| called = true);
        assert!(!called);
        v.decref(|_| called = true);
        assert!(!called);
    }

    #[test]
    fn clear_resets_to_null() {
        let mut v = Value::from_int(5);
        v.clear(|_| panic!("must not run for an int"));
        assert!(v.is_null());
    }
}
