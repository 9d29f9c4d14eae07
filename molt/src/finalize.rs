use rustc_hash::FxHashSet;

use object::{Class, Field, FinalizationState, Instance, Symbol, Value};

use crate::error::ReloadError;
use crate::isolate::Isolate;

/// Drive `cls` (and its superclass chain) to the finalized state:
/// instance-field offsets assigned walking the chain root-first, instance
/// size computed, state advanced. Deferred with an error while the loader
/// is running.
pub fn ensure_finalized(isolate: &mut Isolate, cls: Value) -> Result<(), ReloadError> {
    // SAFETY: cls references a valid Class.
    match unsafe { cls.as_ref::<Class>() }.finalization() {
        FinalizationState::Finalized | FinalizationState::Prefinalized => return Ok(()),
        FinalizationState::Unfinalized => {}
    }
    if isolate.class_finalization_blocked() {
        return Err(ReloadError::FinalizationBlocked);
    }

    // Collect the superclass chain, leaf first, rejecting cycles.
    let mut chain = Vec::new();
    let mut seen = FxHashSet::default();
    let mut current = cls;
    while current.is_ref() {
        if !seen.insert(current.raw()) {
            // SAFETY: cls references a valid Class.
            let name = unsafe { cls.as_ref::<Class>() }.name_sym();
            return Err(ReloadError::Finalization(format!(
                "Cyclic inheritance in {}",
                isolate.symbols.name(name)
            )));
        }
        chain.push(current);
        // SAFETY: current references a valid Class.
        current = unsafe { current.as_ref::<Class>() }.super_class;
    }

    for &link in chain.iter().rev() {
        finalize_one(isolate, link);
    }
    Ok(())
}

fn finalize_one(isolate: &mut Isolate, cls: Value) {
    // SAFETY: cls references a valid Class.
    let (state, super_class) = unsafe {
        let c = cls.as_ref::<Class>();
        (c.finalization(), c.super_class)
    };
    if state != FinalizationState::Unfinalized {
        return;
    }

    let mut offset = if super_class.is_ref() {
        // SAFETY: the chain is finalized root-first.
        let sup = unsafe { super_class.as_ref::<Class>() };
        debug_assert!(sup.finalization() != FinalizationState::Unfinalized);
        sup.instance_size()
    } else {
        Instance::BASE_WORDS
    };

    // SAFETY: cls references a valid Class; single mutator.
    let fields = unsafe { cls.as_ref::<Class>() }.fields;
    for field in isolate.growable_snapshot(fields) {
        // SAFETY: class field lists hold valid Fields.
        let f = unsafe { field.as_mut::<Field>() };
        if f.is_static() {
            continue;
        }
        f.set_offset(offset);
        offset += 1;
    }

    // SAFETY: cls references a valid Class; single mutator.
    unsafe {
        let c = cls.as_mut::<Class>();
        c.instance_size_words = Value::from_i64(offset as i64);
        c.set_finalization(FinalizationState::Finalized);
    }
}

/// The offset → field-name map of a class, superclass chain included,
/// ordered by offset. This is the layout identity the shape validator
/// compares.
pub fn offset_field_map(isolate: &Isolate, cls: Value) -> Vec<(usize, Symbol)> {
    let mut map = Vec::new();
    let mut current = cls;
    while current.is_ref() {
        // SAFETY: current references a valid Class.
        let (fields, super_class) = unsafe {
            let c = current.as_ref::<Class>();
            (c.fields, c.super_class)
        };
        for field in isolate.growable_snapshot(fields) {
            // SAFETY: class field lists hold valid Fields.
            let f = unsafe { field.as_ref::<Field>() };
            if f.is_static() || !f.has_offset() {
                continue;
            }
            map.push((f.offset(), f.name_sym()));
        }
        current = super_class;
    }
    map.sort_by_key(|&(offset, _)| offset);
    map
}
