//! Zero-copy argument/result views.
//!
//! A rewritten function hands `trap_entry` one `Slot` per receiver,
//! parameter, and result, each borrowing the live local it describes.
//! The dispatcher assembles the slots into an ordered `Object` (and a
//! `Results` wrapper that splits off the trailing error slot when the
//! function's metadata marks its last result as error-typed). Interceptors
//! read and write through the fields; writes land directly in the wrapped
//! function's locals, so they are visible to the caller once the trap
//! returns.
//!
//! Slots are borrows, so a view can never outlive the call it describes —
//! the retention discipline the protocol requires is enforced by the
//! borrow checker rather than convention.

use std::any::Any;
use std::error::Error;

/// Boxed error threaded through interceptors and error-aware result slots.
pub type TrapError = Box<dyn Error + Send + Sync + 'static>;

/// One value cell of a call frame: an optional name plus an optional
/// type-erased pointer to the live storage.
///
/// Absent slots keep the dispatcher's calling convention fixed-arity: `_`
/// parameters, receivers, and parameters whose types cannot be erased to
/// `dyn Any` (anything carrying a lifetime) are passed as `Slot::absent()`
/// rather than omitted.
pub struct Slot<'a> {
    name: &'static str,
    value: Option<&'a mut dyn Any>,
}

impl<'a> Slot<'a> {
    pub fn named<T: Any>(name: &'static str, value: &'a mut T) -> Self {
        Slot {
            name,
            value: Some(value),
        }
    }

    pub fn absent() -> Self {
        Slot {
            name: "",
            value: None,
        }
    }

    /// Absent value, but the field keeps its declared name (used for
    /// receivers and unviewable parameters so the view shape still
    /// matches the declaration).
    pub fn absent_named(name: &'static str) -> Self {
        Slot { name, value: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A named, pointer-backed view of one receiver/argument/result.
pub struct Field<'a> {
    name: &'static str,
    value: Option<&'a mut dyn Any>,
}

impl<'a> Field<'a> {
    pub(crate) fn from_slot(slot: &'a mut Slot<'_>) -> Field<'a> {
        Field {
            name: slot.name,
            value: slot.value.as_deref_mut(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True when the slot carries no value (absent receiver, `_`
    /// parameter, or a parameter whose type could not be erased).
    pub fn is_absent(&self) -> bool {
        self.value.is_none()
    }

    /// Read the value, if present and of type `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.as_deref().and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.as_deref_mut().and_then(|v| v.downcast_mut())
    }

    /// Overwrite the value in place. Returns false when the slot is absent
    /// or `T` does not match the slot's dynamic type; the caller's storage
    /// is untouched in that case.
    pub fn set<T: Any>(&mut self, value: T) -> bool {
        match self.get_mut::<T>() {
            Some(target) => {
                *target = value;
                true
            }
            None => false,
        }
    }
}

/// Ordered view over a call's receiver+arguments or results.
pub struct Object<'a> {
    fields: Vec<Field<'a>>,
}

impl<'a> Object<'a> {
    pub(crate) fn new(fields: Vec<Field<'a>>) -> Self {
        Object { fields }
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field_at(&mut self, index: usize) -> Option<&mut Field<'a>> {
        self.fields.get_mut(index)
    }

    /// Look up a field by declared name. Unnamed fields (`""`) are only
    /// reachable by index.
    pub fn field(&mut self, name: &str) -> Option<&mut Field<'a>> {
        self.fields
            .iter_mut()
            .find(|f| !f.name.is_empty() && f.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field<'a>> {
        self.fields.iter()
    }
}

/// Result view; the error-aware variant carries the trailing error field
/// split off from the ordinary results.
///
/// The error field's dynamic type is always `Option<TrapError>` in the
/// rewritten form, which is what `set_err`/`err_text` go through.
pub struct Results<'a> {
    object: Object<'a>,
    err: Option<Field<'a>>,
}

impl<'a> Results<'a> {
    pub(crate) fn new(object: Object<'a>, err: Option<Field<'a>>) -> Self {
        Results { object, err }
    }

    pub fn has_err_field(&self) -> bool {
        self.err.is_some()
    }

    pub fn err_field(&mut self) -> Option<&mut Field<'a>> {
        self.err.as_mut()
    }

    /// Store an error into the trailing error slot. Returns false when the
    /// function has no error result or the slot is absent.
    pub fn set_err(&mut self, err: TrapError) -> bool {
        match self.err.as_mut() {
            Some(field) => field.set(Some(err)),
            None => false,
        }
    }

    /// Textual form of the current error, if any.
    pub fn err_text(&self) -> Option<String> {
        self.err
            .as_ref()?
            .get::<Option<TrapError>>()?
            .as_ref()
            .map(|e| e.to_string())
    }
}

impl<'a> std::ops::Deref for Results<'a> {
    type Target = Object<'a>;

    fn deref(&self) -> &Object<'a> {
        &self.object
    }
}

impl<'a> std::ops::DerefMut for Results<'a> {
    fn deref_mut(&mut self) -> &mut Object<'a> {
        &mut self.object
    }
}

/// Build an `Object` from a run of slots.
pub(crate) fn object_from_slots<'a>(slots: &'a mut [Slot<'_>]) -> Object<'a> {
    Object::new(slots.iter_mut().map(Field::from_slot).collect())
}
