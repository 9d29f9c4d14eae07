//! Per-class reconciliation: shape validation, static-state migration,
//! enum canonical-instance replacement, and re-parenting of dead
//! definitions, plus inline-cache resets.

use log::debug;

use object::{Class, ClassId, Field, Function, ICData, Instance, Symbol, Value};

use crate::context::ReloadContext;
use crate::error::ReloadError;
use crate::finalize::{ensure_finalized, offset_field_map};
use crate::isolate::Isolate;
use crate::lookup::{owner_class, resolve_dynamic, resolve_static};

fn class_name(isolate: &Isolate, cls: Value) -> String {
    // SAFETY: cls references a valid Class.
    let sym = unsafe { cls.as_ref::<Class>() }.name_sym();
    isolate.symbols.name(sym).to_owned()
}

// ── Shape validation ──────────────────────────────────────────────────

/// Can `old` be replaced by `new` without changing instance shape? On
/// failure the context records a precise diagnostic and the reload rolls
/// back.
pub fn can_reload(
    isolate: &mut Isolate,
    ctx: &mut ReloadContext,
    old: Value,
    new: Value,
) -> bool {
    // SAFETY: both reference valid Classes.
    let (old_finalized, old_prefinalized) = unsafe {
        let c = old.as_ref::<Class>();
        (c.is_finalized(), c.is_prefinalized())
    };

    if old_finalized {
        if let Err(err) = ensure_finalized(isolate, new) {
            ctx.report_error(isolate, err);
            return false;
        }
    }

    let name = class_name(isolate, old);
    let old_map = offset_field_map(isolate, old);
    let new_map = offset_field_map(isolate, new);

    if old_map.len() != new_map.len() {
        ctx.report_error(
            isolate,
            ReloadError::Shape(format!("Number of instance fields changed in {name}")),
        );
        return false;
    }
    for (&(old_offset, old_name), &(new_offset, new_name)) in
        old_map.iter().zip(new_map.iter())
    {
        if old_name != new_name {
            let error = ReloadError::Shape(format!(
                "Name of instance field changed ('{}' vs '{}') in {name}",
                isolate.symbols.name(old_name),
                isolate.symbols.name(new_name),
            ));
            ctx.report_error(isolate, error);
            return false;
        }
        if old_offset != new_offset {
            let error = ReloadError::Shape(format!(
                "Offset of instance field '{}' changed in {name}",
                isolate.symbols.name(old_name),
            ));
            ctx.report_error(isolate, error);
            return false;
        }
    }

    if old_prefinalized {
        // SAFETY: both reference valid Classes.
        let (new_prefinalized, old_size, new_size) = unsafe {
            (
                new.as_ref::<Class>().is_prefinalized(),
                old.as_ref::<Class>().instance_size(),
                new.as_ref::<Class>().instance_size(),
            )
        };
        if !new_prefinalized {
            ctx.report_error(
                isolate,
                ReloadError::Shape(format!(
                    "Class finalization state changed in {name}"
                )),
            );
            return false;
        }
        if old_size != new_size {
            ctx.report_error(
                isolate,
                ReloadError::Shape(format!("Instance size changed in {name}")),
            );
            return false;
        }
    }

    // SAFETY: both reference valid Classes.
    let (old_native, new_native) = unsafe {
        (
            old.as_ref::<Class>().num_native_fields(),
            new.as_ref::<Class>().num_native_fields(),
        )
    };
    if old_native != new_native {
        ctx.report_error(
            isolate,
            ReloadError::Shape(format!("Number of native fields changed in {name}")),
        );
        return false;
    }

    true
}

// ── Canonical constants ───────────────────────────────────────────────

/// The canonical-constants set is a flat (name, instance) pair list.
pub fn constants_find(isolate: &Isolate, cls: Value, name: Symbol) -> Option<Value> {
    // SAFETY: cls references a valid Class.
    let constants = unsafe { cls.as_ref::<Class>() }.constants;
    let entries = isolate.growable_snapshot(constants);
    for pair in entries.chunks_exact(2) {
        // SAFETY: even slots hold name symbols.
        if unsafe { pair[0].to_symbol() } == name {
            return Some(pair[1]);
        }
    }
    None
}

pub fn constants_insert(isolate: &mut Isolate, cls: Value, name: Symbol, instance: Value) {
    // SAFETY: cls references a valid Class.
    let constants = unsafe { cls.as_ref::<Class>() }.constants;
    isolate.growable_push(constants, Value::from_symbol(name));
    isolate.growable_push(constants, instance);
}

// ── Commit-time reconciliation ────────────────────────────────────────

/// Unify the canonical enum instances of `old` and `new`, keyed by value
/// name. The pre-reload instance stays canonical: it already carries the
/// stable cid, while the instance the loader evaluated carries a slot that
/// compaction is about to reclaim. The loader's instance donates its
/// declaration index and is become-forwarded to the survivor; instances of
/// values new to the enum are re-tagged with the stable cid instead.
pub fn replace_enum(
    isolate: &mut Isolate,
    ctx: &mut ReloadContext,
    new: Value,
    old: Value,
) {
    // SAFETY: both reference valid Classes.
    let (stable_cid, new_constants, old_constants) = unsafe {
        (
            old.as_ref::<Class>().cid(),
            new.as_ref::<Class>().constants,
            old.as_ref::<Class>().constants,
        )
    };

    let new_entries = isolate.growable_snapshot(new_constants);
    for (i, pair) in new_entries.chunks_exact(2).enumerate() {
        // SAFETY: even slots hold name symbols.
        let value_name = unsafe { pair[0].to_symbol() };
        let new_instance = pair[1];
        match constants_find(isolate, old, value_name) {
            Some(old_instance) => {
                // Carry the new declaration order over to the survivor.
                // SAFETY: validated-equivalent layouts; index sits at the
                // first field slot.
                unsafe {
                    let index = new_instance
                        .as_ref::<Instance>()
                        .field_at(Instance::BASE_WORDS);
                    old_instance
                        .as_mut::<Instance>()
                        .set_field_at(Instance::BASE_WORDS, index);
                }
                isolate.growable_set(new_constants, i * 2 + 1, old_instance);
                ctx.add_become_mapping(new_instance, old_instance);
            }
            None => {
                // SAFETY: safepoint operation pending; exclusive access.
                unsafe {
                    object::set_header_cid(
                        new_instance.ref_bits() as *mut u64,
                        stable_cid,
                    );
                }
            }
        }
    }

    let old_entries = isolate.growable_snapshot(old_constants);
    for pair in old_entries.chunks_exact(2) {
        // SAFETY: even slots hold name symbols.
        let value_name = unsafe { pair[0].to_symbol() };
        if constants_find(isolate, new, value_name).is_none() {
            debug!(
                "reload: enum value '{}' removed from {}",
                isolate.symbols.name(value_name),
                class_name(isolate, new),
            );
        }
    }
}

/// Write each old static field's current value into the matching new
/// field's storage cell and enqueue (old field → new field) so the field
/// objects themselves transfer identity.
pub fn copy_static_field_values(
    isolate: &mut Isolate,
    ctx: &mut ReloadContext,
    new: Value,
    old: Value,
) {
    // SAFETY: both reference valid Classes.
    let new_fields = unsafe { new.as_ref::<Class>() }.fields;
    let old_fields = unsafe { old.as_ref::<Class>() }.fields;
    for new_field in isolate.growable_snapshot(new_fields) {
        // SAFETY: class field lists hold valid Fields.
        let nf = unsafe { new_field.as_ref::<Field>() };
        if !nf.is_static() {
            continue;
        }
        let name = nf.name_sym();
        for old_field in isolate.growable_snapshot(old_fields) {
            // SAFETY: class field lists hold valid Fields.
            let of = unsafe { old_field.as_ref::<Field>() };
            if !of.is_static() || of.name_sym() != name {
                continue;
            }
            // SAFETY: exclusive mutator access under the reload.
            unsafe {
                new_field.as_mut::<Field>().static_value = of.static_value;
            }
            ctx.add_become_mapping(old_field, new_field);
        }
    }
}

/// Carry the canonical-constants set over; the constant instances stay
/// valid because the layouts were validated equivalent.
pub fn copy_canonical_constants(new: Value, old: Value) {
    // SAFETY: both reference valid Classes; exclusive mutator access.
    unsafe {
        new.as_mut::<Class>().constants = old.as_ref::<Class>().constants;
    }
}

/// Move the old class's functions and fields onto a fresh patch class
/// that keeps the old script, so Function and Field objects still live on
/// the stack or in closures continue to find their original source.
pub fn patch_fields_and_functions(isolate: &mut Isolate, old: Value) {
    // SAFETY: old references a valid Class.
    let script = unsafe { old.as_ref::<Class>() }.script;
    let patch = isolate.new_patch_class(old, script);

    // SAFETY: old references a valid Class.
    let functions = unsafe { old.as_ref::<Class>() }.functions;
    for func in isolate.growable_snapshot(functions) {
        // SAFETY: class function lists hold valid Functions.
        unsafe { func.as_mut::<Function>().owner = patch };
    }
    // SAFETY: old references a valid Class.
    let fields = unsafe { old.as_ref::<Class>() }.fields;
    for field in isolate.growable_snapshot(fields) {
        // SAFETY: class field lists hold valid Fields.
        unsafe { field.as_mut::<Field>().owner = patch };
    }
}

/// A replaced class must never serve another allocation from its old
/// stub.
pub fn disable_allocation_stub(old: Value) {
    // SAFETY: old references a valid Class; exclusive mutator access.
    unsafe { old.as_mut::<Class>().allocation_stub = Value::NULL };
}

// ── Inline-cache reset ────────────────────────────────────────────────

pub fn ic_clear_entries(ic: Value) {
    // SAFETY: ic references a valid ICData with a growable entries list.
    let entries = unsafe { ic.as_ref::<ICData>() }.entries;
    if entries.is_ref() {
        // SAFETY: entries references a valid GrowableArray.
        unsafe { entries.as_mut::<object::GrowableArray>().set_len(0) };
    }
}

/// Append one (receiver cids…, target) check group.
pub fn ic_add_check(isolate: &mut Isolate, ic: Value, cids: &[ClassId], target: Value) {
    // SAFETY: ic references a valid ICData.
    let entries = unsafe { ic.as_ref::<ICData>() }.entries;
    for &cid in cids {
        isolate.growable_push(entries, Value::from_i64(cid as i64));
    }
    isolate.growable_push(entries, target);
}

/// Every receiver cid currently cached by `ic`.
pub fn ic_cached_cids(isolate: &Isolate, ic: Value) -> Vec<ClassId> {
    // SAFETY: ic references a valid ICData.
    let (arity, entries) = unsafe {
        let data = ic.as_ref::<ICData>();
        (data.num_args_tested(), data.entries)
    };
    let mut cids = Vec::new();
    if arity == 0 {
        return cids;
    }
    let flat = isolate.growable_snapshot(entries);
    for group in flat.chunks_exact(arity + 1) {
        for &slot in &group[..arity] {
            // SAFETY: receiver slots hold cid fixnums.
            cids.push(unsafe { slot.to_i64() } as ClassId);
        }
    }
    cids
}

/// Reset one inline cache. Dynamic caches are emptied (with the fixnum
/// fast-path re-seeded for two-argument `+`, `-` and `==` sites so the
/// corresponding stubs stay usable); static-call caches are rebound by
/// name lookup through the target's owner, which a completed reload has
/// already forwarded into the new world.
pub fn ic_data_reset(isolate: &mut Isolate, ic: Value, is_static_call: bool) {
    if is_static_call {
        // SAFETY: ic references a valid ICData.
        let entries = unsafe { ic.as_ref::<ICData>() }.entries;
        let flat = isolate.growable_snapshot(entries);
        let Some(&old_target) = flat.last() else {
            return; // already reset in an earlier round
        };
        // SAFETY: static-call groups end with the target function.
        let (target_static, selector) = unsafe {
            let f = old_target.as_ref::<Function>();
            (f.is_static(), f.name_sym())
        };
        if !target_static {
            debug!(
                "reload: cannot rebind super-call to '{}'",
                isolate.symbols.name(selector)
            );
            return;
        }
        let cls = owner_class(isolate, old_target);
        let Some(new_target) = resolve_static(isolate, cls, selector) else {
            debug!(
                "reload: cannot rebind static call to '{}'",
                isolate.symbols.name(selector)
            );
            return;
        };
        ic_clear_entries(ic);
        ic_add_check(isolate, ic, &[], new_target);
    } else {
        ic_clear_entries(ic);

        // Keep the static prediction that two-argument + - == sites see
        // fixnum receiver and argument.
        // SAFETY: ic references a valid ICData.
        let (arity, selector) = unsafe {
            let data = ic.as_ref::<ICData>();
            (data.num_args_tested(), data.target_name_sym())
        };
        if arity == 2
            && (selector == isolate.well_known.plus
                || selector == isolate.well_known.minus
                || selector == isolate.well_known.equals)
        {
            let fixnum_class = isolate.store.fixnum_class;
            if let Some(target) = resolve_dynamic(isolate, fixnum_class, selector) {
                // SAFETY: the fixnum class is a valid Class.
                let fixnum_cid = unsafe { fixnum_class.as_ref::<Class>() }.cid();
                ic_add_check(isolate, ic, &[fixnum_cid, fixnum_cid], target);
            }
        }
    }
}
