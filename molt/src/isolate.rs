use heap::{Heap, HeapSettings, RootProvider};
use object::{
    Array, Class, ClassFlags, ClassId, Code, CodeFlags, Field, FieldFlags,
    FinalizationState, Function, FunctionFlags, GrowableArray, Header,
    ICData, Instance, Library, LibraryFlags, MegamorphicCache, PatchClass,
    Script, Symbol, TypeArguments, Value, CID_ARRAY, CID_CLASS, CID_CODE,
    CID_FIELD, CID_FUNCTION, CID_GROWABLE_ARRAY, CID_IC_DATA, CID_LIBRARY,
    CID_MEGAMORPHIC_CACHE, CID_PATCH_CLASS, CID_SCRIPT, CID_TYPE_ARGUMENTS,
};

use crate::canonical;
use crate::class_table::ClassTable;
use crate::compiler::BackgroundCompiler;
use crate::context::{Loader, ReloadContext};
use crate::error::ReloadError;
use crate::events::{EventSink, NullSink};
use crate::flags::ReloadFlags;
use crate::safepoint::SafepointState;
use crate::symbols::{SymbolTable, WellKnownSymbols};

/// Typed roots of the isolate.
pub struct ObjectStore {
    /// The program's entry library.
    pub root_library: Value,
    /// GrowableArray of all loaded libraries, in index order.
    pub libraries: Value,
    /// Open-addressed canonical type-arguments table (last slot holds the
    /// used count).
    pub canonical_type_arguments: Value,
    /// GrowableArray of megamorphic caches, or NULL when empty.
    pub megamorphic_cache_table: Value,
    /// Source-position-keyed constants cache, or NULL.
    pub compile_time_constants: Value,
    /// The stub every not-yet-compiled function's entry point refers to.
    pub lazy_compile_stub: Value,
    /// Platform class backing fixnum receivers.
    pub fixnum_class: Value,
}

impl ObjectStore {
    fn new() -> Self {
        Self {
            root_library: Value::NULL,
            libraries: Value::NULL,
            canonical_type_arguments: Value::NULL,
            megamorphic_cache_table: Value::NULL,
            compile_time_constants: Value::NULL,
            lazy_compile_stub: Value::NULL,
            fixnum_class: Value::NULL,
        }
    }

    pub fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.root_library);
        visitor(&mut self.libraries);
        visitor(&mut self.canonical_type_arguments);
        visitor(&mut self.megamorphic_cache_table);
        visitor(&mut self.compile_time_constants);
        visitor(&mut self.lazy_compile_stub);
        visitor(&mut self.fixnum_class);
    }
}

/// One activation on the mutator stack. `code` is the compilation the
/// frame is executing; `pending_deopt` marks an optimized frame that must
/// resume in unoptimized code when control returns to it.
pub struct Frame {
    pub code: Value,
    pub pending_deopt: bool,
}

/// A stable reference into the isolate's root vector, usable across a
/// reload (the become sweep forwards it like any other root slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

/// A single-mutator isolate: heap, class table, roots, and at most one
/// reload in flight.
pub struct Isolate {
    pub heap: Heap,
    pub class_table: ClassTable,
    pub store: ObjectStore,
    pub symbols: SymbolTable,
    pub well_known: WellKnownSymbols,
    pub frames: Vec<Frame>,
    pub flags: ReloadFlags,
    pub safepoint: SafepointState,
    pub background_compiler: BackgroundCompiler,
    pub event_sink: Box<dyn EventSink>,
    pub(crate) reload_context: Option<Box<ReloadContext>>,
    handles: Vec<Value>,
    finalization_blocked: u32,
    stack_check_count: u64,
    reload_test_loader: Option<Box<dyn Loader>>,
    next_script_version: i64,
}

impl Isolate {
    pub fn new(flags: ReloadFlags) -> Self {
        let mut isolate = Self {
            heap: Heap::new(HeapSettings::default()),
            class_table: ClassTable::new(),
            store: ObjectStore::new(),
            symbols: SymbolTable::new(),
            well_known: WellKnownSymbols {
                plus: Symbol(0),
                minus: Symbol(0),
                equals: Symbol(0),
                toplevel: Symbol(0),
            },
            frames: Vec::new(),
            flags,
            safepoint: SafepointState::new(),
            background_compiler: BackgroundCompiler::new(),
            event_sink: Box::new(NullSink),
            reload_context: None,
            handles: Vec::new(),
            finalization_blocked: 0,
            stack_check_count: 0,
            reload_test_loader: None,
            next_script_version: 1,
        };
        isolate.well_known = WellKnownSymbols::intern_into(&mut isolate.symbols);
        isolate.bootstrap();
        isolate
    }

    fn bootstrap(&mut self) {
        self.store.libraries = self.new_growable();
        self.store.canonical_type_arguments = canonical::new_canonical_table(self);
        self.store.lazy_compile_stub =
            self.new_code(Value::NULL, CodeFlags::STUB, Value::NULL, Value::NULL, Value::NULL);

        // The platform ("clean") core library backing fixnum receivers.
        let core = self.define_platform_library("molt:core");
        let fixnum_cls = self.define_class(core, "Fixnum", Value::NULL, &[]);
        crate::finalize::ensure_finalized(self, fixnum_cls)
            .expect("bootstrap finalization");
        for selector in ["+", "-", "=="] {
            self.define_function(fixnum_cls, selector, false);
        }
        self.store.fixnum_class = fixnum_cls;
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocate a `size_words` object of class `cid` with every payload
    /// slot initialized to NULL. Objects are at least two words so a
    /// forwarding corpse can store its target.
    pub fn alloc_value(&mut self, cid: ClassId, size_words: usize) -> Value {
        debug_assert!(
            !self.safepoint.in_operation(),
            "allocation during a safepoint operation"
        );
        let size_words = size_words.max(2);
        let obj = self.heap.allocate(size_words);
        // SAFETY: obj points at freshly allocated, exclusively owned
        // storage of size_words words.
        unsafe {
            *obj = Header::new(cid, size_words).raw();
            for i in 1..size_words {
                *obj.add(i) = Value::NULL.raw();
            }
        }
        Value::from_ptr(obj)
    }

    pub fn new_array(&mut self, len: usize) -> Value {
        let value = self.alloc_value(CID_ARRAY, Array::allocation_words(len));
        // SAFETY: freshly allocated array.
        unsafe { value.as_mut::<Array>().length = Value::from_i64(len as i64) };
        value
    }

    pub fn new_growable(&mut self) -> Value {
        let value = self.alloc_value(CID_GROWABLE_ARRAY, GrowableArray::SIZE_WORDS);
        // SAFETY: freshly allocated growable.
        unsafe { value.as_mut::<GrowableArray>().set_len(0) };
        value
    }

    pub fn new_type_arguments(&mut self, types: &[Value]) -> Value {
        let value = self.alloc_value(
            CID_TYPE_ARGUMENTS,
            TypeArguments::allocation_words(types.len()),
        );
        // SAFETY: freshly allocated tuple.
        unsafe {
            let ta = value.as_mut::<TypeArguments>();
            ta.length = Value::from_i64(types.len() as i64);
            for (i, &t) in types.iter().enumerate() {
                ta.set_type_at(i, t);
            }
        }
        value
    }

    pub fn new_script(&mut self, url: Symbol) -> Value {
        let version = self.next_script_version;
        self.next_script_version += 1;
        let value = self.alloc_value(CID_SCRIPT, Script::SIZE_WORDS);
        // SAFETY: freshly allocated script.
        unsafe {
            let script = value.as_mut::<Script>();
            script.url = Value::from_symbol(url);
            script.version = Value::from_i64(version);
        }
        value
    }

    pub fn new_class(
        &mut self,
        name: Symbol,
        library: Value,
        script: Value,
        super_class: Value,
        flags: ClassFlags,
    ) -> Value {
        let functions = self.new_growable();
        let fields = self.new_growable();
        let constants = self.new_growable();
        let value = self.alloc_value(CID_CLASS, Class::SIZE_WORDS);
        // SAFETY: freshly allocated class.
        unsafe {
            let cls = value.as_mut::<Class>();
            cls.name = Value::from_symbol(name);
            cls.library = library;
            cls.script = script;
            cls.super_class = super_class;
            cls.functions = functions;
            cls.fields = fields;
            cls.constants = constants;
            cls.allocation_stub = Value::NULL;
            cls.set_finalization(FinalizationState::Unfinalized);
            cls.flags = Value::from_i64(flags.bits() as i64);
            cls.instance_size_words = Value::from_i64(0);
            cls.num_native_fields = Value::from_i64(0);
            cls.set_cid(0);
        }
        value
    }

    pub fn new_patch_class(&mut self, patched_class: Value, script: Value) -> Value {
        let value = self.alloc_value(CID_PATCH_CLASS, PatchClass::SIZE_WORDS);
        // SAFETY: freshly allocated patch class.
        unsafe {
            let patch = value.as_mut::<PatchClass>();
            patch.patched_class = patched_class;
            patch.script = script;
        }
        value
    }

    pub fn new_library(&mut self, url: Symbol, flags: LibraryFlags) -> Value {
        let dictionary = self.new_growable();
        let value = self.alloc_value(CID_LIBRARY, Library::SIZE_WORDS);
        // SAFETY: freshly allocated library.
        unsafe {
            let lib = value.as_mut::<Library>();
            lib.url = Value::from_symbol(url);
            lib.set_list_index(-1);
            lib.set_library_flags(flags);
            lib.dictionary = dictionary;
            lib.toplevel_class = Value::NULL;
            lib.imports = Value::NULL;
            lib.exports = Value::NULL;
        }
        value
    }

    pub fn new_field(
        &mut self,
        name: Symbol,
        owner: Value,
        flags: FieldFlags,
    ) -> Value {
        let value = self.alloc_value(CID_FIELD, Field::SIZE_WORDS);
        // SAFETY: freshly allocated field.
        unsafe {
            let field = value.as_mut::<Field>();
            field.name = Value::from_symbol(name);
            field.owner = owner;
            field.flags = Value::from_i64(flags.bits() as i64);
            field.offset_words = Value::NULL;
            field.static_value = Value::NULL;
        }
        value
    }

    pub fn new_function(
        &mut self,
        name: Symbol,
        owner: Value,
        flags: FunctionFlags,
    ) -> Value {
        let ic_data_array = self.new_growable();
        let value = self.alloc_value(CID_FUNCTION, Function::SIZE_WORDS);
        // SAFETY: freshly allocated function.
        unsafe {
            let func = value.as_mut::<Function>();
            func.name = Value::from_symbol(name);
            func.owner = owner;
            func.flags = Value::from_i64(flags.bits() as i64);
            func.code = Value::NULL;
            func.unoptimized_code = Value::NULL;
            func.ic_data_array = ic_data_array;
            func.zero_counters();
        }
        value
    }

    pub fn new_code(
        &mut self,
        function: Value,
        flags: CodeFlags,
        object_pool: Value,
        descriptors: Value,
        edge_counters: Value,
    ) -> Value {
        let value = self.alloc_value(CID_CODE, Code::SIZE_WORDS);
        // SAFETY: freshly allocated code.
        unsafe {
            let code = value.as_mut::<Code>();
            code.function = function;
            code.flags = Value::from_i64(flags.bits() as i64);
            code.object_pool = object_pool;
            code.descriptors = descriptors;
            code.edge_counters = edge_counters;
        }
        value
    }

    pub fn new_ic_data(
        &mut self,
        target_name: Symbol,
        owner: Value,
        arity: usize,
    ) -> Value {
        let entries = self.new_growable();
        let value = self.alloc_value(CID_IC_DATA, ICData::SIZE_WORDS);
        // SAFETY: freshly allocated IC data.
        unsafe {
            let ic = value.as_mut::<ICData>();
            ic.target_name = Value::from_symbol(target_name);
            ic.owner = owner;
            ic.arity = Value::from_i64(arity as i64);
            ic.entries = entries;
        }
        value
    }

    /// Allocate an instance of a finalized program class.
    pub fn new_instance_of(&mut self, cls: Value) -> Value {
        // SAFETY: cls references a valid Class.
        let (cid, size) = unsafe {
            let c = cls.as_ref::<Class>();
            debug_assert!(c.is_finalized() || c.is_prefinalized());
            (c.cid(), c.instance_size().max(Instance::BASE_WORDS + 1))
        };
        self.alloc_value(cid, size)
    }

    // ── Growable arrays ───────────────────────────────────────────────

    pub fn growable_len(&self, ga: Value) -> usize {
        // SAFETY: ga references a valid GrowableArray.
        unsafe { ga.as_ref::<GrowableArray>().len() }
    }

    pub fn growable_at(&self, ga: Value, index: usize) -> Value {
        // SAFETY: ga references a valid GrowableArray with a valid backing
        // array of at least len elements.
        unsafe {
            let g = ga.as_ref::<GrowableArray>();
            debug_assert!(index < g.len());
            g.data.as_ref::<Array>().at(index)
        }
    }

    pub fn growable_set(&self, ga: Value, index: usize, value: Value) {
        // SAFETY: as growable_at, plus the mutator holds exclusive access.
        unsafe {
            let g = ga.as_ref::<GrowableArray>();
            debug_assert!(index < g.len());
            g.data.as_mut::<Array>().set_at(index, value);
        }
    }

    pub fn growable_push(&mut self, ga: Value, value: Value) {
        // SAFETY: ga references a valid GrowableArray.
        let (len, capacity) = unsafe {
            let g = ga.as_ref::<GrowableArray>();
            let cap = if g.data.is_ref() {
                g.data.as_ref::<Array>().len()
            } else {
                0
            };
            (g.len(), cap)
        };
        if len == capacity {
            let new_data = self.new_array((capacity * 2).max(4));
            // SAFETY: both arrays valid; the new one is larger.
            unsafe {
                let g = ga.as_mut::<GrowableArray>();
                if g.data.is_ref() {
                    let old = g.data.as_ref::<Array>();
                    let new = new_data.as_mut::<Array>();
                    for i in 0..len {
                        new.set_at(i, old.at(i));
                    }
                }
                g.data = new_data;
            }
        }
        // SAFETY: capacity now exceeds len.
        unsafe {
            let g = ga.as_mut::<GrowableArray>();
            g.data.as_mut::<Array>().set_at(len, value);
            g.set_len(len + 1);
        }
    }

    /// Copy out the contents; loops that allocate or mutate iterate over
    /// the snapshot.
    pub fn growable_snapshot(&self, ga: Value) -> Vec<Value> {
        if !ga.is_ref() {
            return Vec::new();
        }
        let len = self.growable_len(ga);
        (0..len).map(|i| self.growable_at(ga, i)).collect()
    }

    // ── Megamorphic caches ────────────────────────────────────────────

    pub fn new_megamorphic_cache(&mut self, selector: Symbol) -> Value {
        if !self.store.megamorphic_cache_table.is_ref() {
            self.store.megamorphic_cache_table = self.new_growable();
        }
        let buckets = self.new_growable();
        let value =
            self.alloc_value(CID_MEGAMORPHIC_CACHE, MegamorphicCache::SIZE_WORDS);
        // SAFETY: freshly allocated cache.
        unsafe {
            let cache = value.as_mut::<MegamorphicCache>();
            cache.target_name = Value::from_symbol(selector);
            cache.buckets = buckets;
        }
        let table = self.store.megamorphic_cache_table;
        self.growable_push(table, value);
        value
    }

    // ── Handles ───────────────────────────────────────────────────────

    pub fn new_handle(&mut self, value: Value) -> Handle {
        self.handles.push(value);
        Handle(self.handles.len() - 1)
    }

    pub fn deref(&self, handle: Handle) -> Value {
        self.handles[handle.0]
    }

    // ── Frames ────────────────────────────────────────────────────────

    /// Push an activation of `func` (executing its current code).
    pub fn push_frame(&mut self, func: Value) {
        // SAFETY: func references a valid Function.
        let code = unsafe { func.as_ref::<Function>().code };
        debug_assert!(code.is_ref());
        self.frames.push(Frame {
            code,
            pending_deopt: false,
        });
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    // ── Finalization blocking ─────────────────────────────────────────

    pub(crate) fn block_class_finalization(&mut self) {
        self.finalization_blocked += 1;
    }

    pub(crate) fn unblock_class_finalization(&mut self) {
        debug_assert!(self.finalization_blocked > 0);
        self.finalization_blocked -= 1;
    }

    #[inline(always)]
    pub(crate) fn class_finalization_blocked(&self) -> bool {
        self.finalization_blocked > 0
    }

    // ── Dev-mode reload trigger ───────────────────────────────────────

    /// Install the loader the dev-mode trigger (and in-flight test
    /// reloads) consume.
    pub fn set_reload_test_loader(&mut self, loader: Box<dyn Loader>) {
        self.reload_test_loader = Some(loader);
    }

    /// A mutator stack-overflow check. Every `reload_every`-th check
    /// triggers a reload with the installed test loader, optionally only
    /// when the youngest frame runs optimized code.
    pub fn stack_overflow_check(&mut self) -> Option<Result<(), ReloadError>> {
        self.stack_check_count += 1;
        let every = self.flags.reload_every;
        if every == 0 || !self.stack_check_count.is_multiple_of(every) {
            return None;
        }
        if self.flags.reload_every_optimized {
            let top_optimized = self.frames.last().map_or(false, |frame| {
                // SAFETY: frame code references a valid Code.
                unsafe { frame.code.as_ref::<Code>().is_optimized() }
            });
            if !top_optimized {
                return None;
            }
        }
        let mut loader = self.reload_test_loader.take()?;
        Some(self.reload(loader.as_mut()))
    }
}

impl RootProvider for Isolate {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.class_table.visit_roots(visitor);
        self.store.visit_roots(visitor);
        for handle in &mut self.handles {
            visitor(handle);
        }
        for frame in &mut self.frames {
            visitor(&mut frame.code);
        }
        self.background_compiler.visit_roots(visitor);
        if let Some(context) = self.reload_context.as_deref_mut() {
            context.visit_pointers(visitor);
        }
    }
}
