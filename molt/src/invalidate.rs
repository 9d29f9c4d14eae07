//! Post-commit code-world invalidation: after classes and libraries have
//! been replaced, no compiled code or inline cache may carry stale
//! dispatch decisions into the new world.

use log::debug;

use object::{
    decode_descriptor, header_at, Code, Function, GrowableArray, PcKind,
    Value, CID_FUNCTION,
};

use crate::compiler::{deoptimize_frames, switch_to_lazy_compiled_unoptimized};
use crate::context::ReloadContext;
use crate::isolate::Isolate;
use crate::lookup::owner_library;
use crate::reconcile::ic_data_reset;
use crate::safepoint::{HeapIterationScope, NoSafepointScope};

pub fn invalidate_world(isolate: &mut Isolate, ctx: &ReloadContext) {
    if isolate.flags.trace_reload {
        debug!("reload: invalidating code world");
    }
    reset_megamorphic_caches(isolate);
    deoptimize_frames(isolate);

    {
        let _no_safepoint = NoSafepointScope::enter(isolate.safepoint.clone());
        let _iteration = HeapIterationScope::enter(isolate.safepoint.clone());
        reset_unoptimized_ics_on_stack(isolate);
        mark_all_functions_for_recompilation(isolate, ctx);
    }
}

/// Drop the whole megamorphic table: current optimized code will make no
/// more calls, so letting the caches go is cheaper than clearing each one.
fn reset_megamorphic_caches(isolate: &mut Isolate) {
    isolate.store.megamorphic_cache_table = Value::NULL;
}

/// Reset the inline caches of the unoptimized code every live frame will
/// finish its activation in. For an optimized frame that code must come
/// from the optimized code's own object pool — the function's current
/// unoptimized code may be different (or already cleared) by the time the
/// frame unwinds.
fn reset_unoptimized_ics_on_stack(isolate: &mut Isolate) {
    let frame_codes: Vec<Value> = isolate
        .frames
        .iter()
        .rev()
        .map(|frame| frame.code)
        .collect();

    for code in frame_codes {
        // SAFETY: frame code references a valid Code.
        let (optimized, function, pool) = unsafe {
            let c = code.as_ref::<Code>();
            (c.is_optimized(), c.function, c.object_pool)
        };
        if optimized {
            for entry in isolate.growable_snapshot(pool) {
                if !entry.is_ref() {
                    continue;
                }
                // SAFETY: entry is a heap reference.
                let is_code = unsafe {
                    header_at(entry.ref_bits() as *const u64).cid()
                        == object::CID_CODE
                };
                if !is_code {
                    continue;
                }
                // SAFETY: entry references a valid Code.
                if unsafe { entry.as_ref::<Code>() }.function.raw() == function.raw() {
                    reset_ics(isolate, function, entry);
                }
            }
        } else {
            reset_ics(isolate, function, code);
        }
    }
}

/// Walk `code`'s PC descriptors and reset the ICData recorded for each IC
/// and unoptimized-static call site, fetched from the function's IC data
/// array by deopt id.
fn reset_ics(isolate: &mut Isolate, function: Value, code: Value) {
    if !function.is_ref() {
        return; // stub frames own no caches
    }
    // SAFETY: function references a valid Function.
    let ic_data_array = unsafe { function.as_ref::<Function>() }.ic_data_array;
    if !ic_data_array.is_ref() {
        return; // already cleared in an earlier round
    }
    // SAFETY: code references a valid Code.
    let descriptors = unsafe { code.as_ref::<Code>() }.descriptors;
    for descriptor in isolate.growable_snapshot(descriptors) {
        // SAFETY: descriptor slots hold encoded fixnums.
        let (kind, deopt_id) = decode_descriptor(unsafe { descriptor.to_i64() });
        if deopt_id >= isolate.growable_len(ic_data_array) {
            continue;
        }
        let ic = isolate.growable_at(ic_data_array, deopt_id);
        if !ic.is_ref() {
            continue;
        }
        ic_data_reset(isolate, ic, kind == PcKind::UnoptStaticCall);
    }
}

/// Visit every function in the heap and push it back to the compiler:
/// entry point to the lazy stub (or retained unoptimized code), profile
/// state zeroed. Functions from dirty libraries lose their code and IC
/// arrays entirely; clean-library functions keep their unoptimized code
/// but have every IC cell overwritten with the sentinel so no stale type
/// feedback is consumed on next execution.
fn mark_all_functions_for_recompilation(isolate: &mut Isolate, ctx: &ReloadContext) {
    let mut functions = Vec::new();
    isolate.heap.visit_objects(&mut |obj| {
        // SAFETY: the heap walk yields valid object headers.
        if unsafe { header_at(obj) }.cid() == CID_FUNCTION {
            functions.push(Value::from_ptr(obj));
        }
    });

    for func in functions {
        switch_to_lazy_compiled_unoptimized(isolate, func);

        // SAFETY: func references a valid Function.
        let code = unsafe { func.as_ref::<Function>() }.code;
        debug_assert!(code.is_ref());
        // SAFETY: code references a valid Code.
        let is_stub = unsafe { code.as_ref::<Code>() }.is_stub();

        let library = owner_library(isolate, func);
        let clear_code = ctx.is_dirty(library);

        zero_edge_counters(isolate, func);

        if !is_stub {
            if clear_code {
                // SAFETY: exclusive mutator access.
                unsafe {
                    let f = func.as_mut::<Function>();
                    f.ic_data_array = Value::NULL;
                    f.unoptimized_code = Value::NULL;
                    f.code = isolate.store.lazy_compile_stub;
                }
            } else {
                fill_ic_data_with_sentinels(isolate, func);
            }
        }

        // SAFETY: exclusive mutator access.
        unsafe { func.as_mut::<Function>().zero_counters() };
    }
}

fn zero_edge_counters(isolate: &Isolate, func: Value) {
    // SAFETY: func references a valid Function.
    let unoptimized = unsafe { func.as_ref::<Function>() }.unoptimized_code;
    if !unoptimized.is_ref() {
        return;
    }
    // SAFETY: unoptimized references a valid Code.
    let counters = unsafe { unoptimized.as_ref::<Code>() }.edge_counters;
    if !counters.is_ref() {
        return;
    }
    for i in 0..isolate.growable_len(counters) {
        isolate.growable_set(counters, i, Value::from_i64(0));
    }
}

fn fill_ic_data_with_sentinels(isolate: &Isolate, func: Value) {
    // SAFETY: func references a valid Function.
    let ic_data_array = unsafe { func.as_ref::<Function>() }.ic_data_array;
    if !ic_data_array.is_ref() {
        return;
    }
    // SAFETY: ic_data_array references a valid GrowableArray.
    let len = unsafe { ic_data_array.as_ref::<GrowableArray>() }.len();
    for i in 0..len {
        isolate.growable_set(ic_data_array, i, Value::SENTINEL);
    }
}
