//! One-way bulk identity forwarding ("become").
//!
//! Given parallel arrays `before` and `after`, every root and heap slot
//! that referenced `before[i]` references `after[i]` afterwards. Each
//! forwarded object is rewritten in place into a forwarding corpse: a
//! free-list-shaped header that preserves the original size (so heap
//! iteration still advances correctly) with the target in the first
//! payload word.
//!
//! Validation failures here are fatal: by the time identity is forwarded
//! the reload has been declared committable, so a bad pair is a bug in the
//! reconciler, not a recoverable condition.

use heap::RootProvider;
use object::{forward_to, forwarding_target, header_at, Value};

use crate::context::ReloadContext;
use crate::isolate::Isolate;
use crate::safepoint::SafepointOperationScope;

pub fn forward_identity(
    isolate: &mut Isolate,
    mut context: Option<&mut ReloadContext>,
    before: &mut [Value],
    after: &[Value],
) {
    assert_eq!(before.len(), after.len());
    let _operation = SafepointOperationScope::enter(isolate.safepoint.clone());

    #[cfg(debug_assertions)]
    assert_no_forwarding_targets(isolate, context.as_deref_mut());

    // Set up forwarding corpses.
    for i in 0..before.len() {
        let b = before[i];
        let a = after[i];
        if b.raw() == a.raw() {
            panic!("become: cannot self-forward");
        }
        if !b.is_ref() || !a.is_ref() {
            panic!("become: cannot forward immediates");
        }
        let b_ptr = b.ref_bits() as *mut u64;
        // SAFETY: b and a are live heap references and the safepoint
        // operation grants exclusive heap access.
        unsafe {
            if header_at(b_ptr).is_free_list() {
                panic!("become: cannot forward to multiple targets");
            }
            if header_at(a.ref_bits() as *const u64).is_free_list() {
                panic!("become: no indirect chains of forwarding");
            }
            let size_before = header_at(b_ptr).size_words();
            forward_to(b_ptr, a);
            // Still need to be able to iterate over the corpse.
            debug_assert_eq!(header_at(b_ptr).size_words(), size_before);
        }
    }

    // Follow forwarding pointers through every root and heap slot.
    let mut forward_slot = |slot: &mut Value| {
        if !slot.is_ref() {
            return;
        }
        let ptr = slot.ref_bits() as *const u64;
        // SAFETY: references target live heap objects or corpses.
        unsafe {
            if header_at(ptr).is_free_list() {
                *slot = forwarding_target(ptr);
            }
        }
    };
    isolate.visit_roots(&mut forward_slot);
    if let Some(ctx) = context.as_deref_mut() {
        ctx.visit_pointers(&mut forward_slot);
    }
    isolate.heap.visit_pointers(&mut forward_slot);
    for slot in before.iter_mut() {
        forward_slot(slot);
    }

    #[cfg(debug_assertions)]
    {
        for i in 0..before.len() {
            assert_eq!(before[i].raw(), after[i].raw());
        }
        assert_no_forwarding_targets(isolate, context.as_deref_mut());
    }
}

/// No live root or heap slot may reference a forwarding corpse.
#[cfg(debug_assertions)]
fn assert_no_forwarding_targets(
    isolate: &mut Isolate,
    context: Option<&mut ReloadContext>,
) {
    let mut check = |slot: &mut Value| {
        // SAFETY: references target live heap objects or corpses.
        let forwarding = unsafe { object::is_forwarding_ref(*slot) };
        assert!(!forwarding, "live slot references a forwarding corpse");
    };
    isolate.visit_roots(&mut check);
    if let Some(ctx) = context {
        ctx.visit_pointers(&mut check);
    }
    isolate.heap.visit_pointers(&mut check);
}
