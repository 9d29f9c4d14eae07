use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use object::{Code, Function, Value, CID_CODE};

use crate::isolate::Isolate;

/// Make sure `func` has unoptimized code to fall back to. Does not change
/// which code the function currently runs, except to give a never-compiled
/// function its first entry point.
pub fn ensure_unoptimized_code(isolate: &mut Isolate, func: Value) {
    // SAFETY: func references a valid Function.
    let unoptimized = unsafe { func.as_ref::<Function>().unoptimized_code };
    if unoptimized.is_null() {
        let descriptors = isolate.new_growable();
        let edge_counters = isolate.new_growable();
        let code = isolate.new_code(
            func,
            object::CodeFlags::empty(),
            Value::NULL,
            descriptors,
            edge_counters,
        );
        // SAFETY: exclusive mutator access.
        unsafe {
            let f = func.as_mut::<Function>();
            f.unoptimized_code = code;
            if f.code.is_null() {
                f.code = code;
            }
        }
    }
}

/// Point the function's entry at its unoptimized code, or at the
/// lazy-compile stub if it has none.
pub fn switch_to_lazy_compiled_unoptimized(isolate: &Isolate, func: Value) {
    // SAFETY: func references a valid Function; exclusive mutator access.
    unsafe {
        let f = func.as_mut::<Function>();
        if f.unoptimized_code.is_null() {
            f.code = isolate.store.lazy_compile_stub;
        } else {
            f.code = f.unoptimized_code;
        }
    }
}

/// Walk the stack and make sure every frame's function has compiled
/// unoptimized code to return into. Runs before the checkpoint so the
/// reload never has to compile into the old world.
pub fn switch_stack_to_unoptimized(isolate: &mut Isolate) {
    let functions: Vec<Value> = isolate
        .frames
        .iter()
        .map(|frame| {
            // SAFETY: frame code references a valid Code.
            unsafe { frame.code.as_ref::<Code>().function }
        })
        .collect();
    for func in functions {
        if func.is_ref() {
            ensure_unoptimized_code(isolate, func);
        }
    }
}

/// Mark every optimized frame so execution resumes in unoptimized code
/// when control returns to it.
pub fn deoptimize_frames(isolate: &mut Isolate) {
    for frame in &mut isolate.frames {
        // SAFETY: frame code references a valid Code.
        if unsafe { frame.code.as_ref::<Code>().is_optimized() } {
            frame.pending_deopt = true;
        }
    }
}

/// The unoptimized code a frame running `code` will finish its activation
/// in. For optimized code this must come from the code's own object pool:
/// the function's current unoptimized code may already have been replaced
/// or cleared.
pub fn unoptimized_code_for(isolate: &Isolate, code: Value) -> Option<Value> {
    // SAFETY: code references a valid Code.
    let (optimized, function, pool) = unsafe {
        let c = code.as_ref::<Code>();
        (c.is_optimized(), c.function, c.object_pool)
    };
    if !optimized {
        return Some(code);
    }
    for entry in isolate.growable_snapshot(pool) {
        if !entry.is_ref() {
            continue;
        }
        // SAFETY: entry is a heap reference.
        if unsafe { object::header_at(entry.ref_bits() as *const u64) }.cid() != CID_CODE {
            continue;
        }
        // SAFETY: entry references a valid Code.
        let c = unsafe { entry.as_ref::<Code>() };
        if c.function.raw() == function.raw() && !c.is_optimized() {
            return Some(entry);
        }
    }
    None
}

/// The background optimizing compiler's mutator-side handle. Disabled for
/// the whole FinishReload → Commit window.
pub struct BackgroundCompiler {
    disabled: AtomicU32,
    queue: Mutex<Vec<Value>>,
}

impl BackgroundCompiler {
    pub fn new() -> Self {
        Self {
            disabled: AtomicU32::new(0),
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn disable(&self) {
        self.disabled.fetch_add(1, Ordering::AcqRel);
    }

    pub fn enable(&self) {
        let was = self.disabled.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(was > 0, "enable without matching disable");
    }

    #[inline(always)]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire) > 0
    }

    /// Request an optimizing compile of `func`. Dropped while disabled.
    pub fn enqueue(&self, func: Value) {
        if self.is_disabled() {
            return;
        }
        self.queue.lock().push(func);
    }

    pub fn drain(&self) -> Vec<Value> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for func in self.queue.lock().iter_mut() {
            visitor(func);
        }
    }
}

impl Default for BackgroundCompiler {
    fn default() -> Self {
        Self::new()
    }
}
