//! Programmatic construction of program images.
//!
//! The parser and resolver are external collaborators; loaders (and the
//! test suite) build libraries, classes, fields, functions and call sites
//! through these methods instead.

use object::{
    encode_descriptor, Class, ClassFlags, Code, CodeFlags, Field, FieldFlags,
    FinalizationState, Function, FunctionFlags, Instance, Library,
    LibraryFlags, PcKind, Symbol, Value,
};

use crate::finalize::ensure_finalized;
use crate::isolate::Isolate;
use crate::lookup::{class_of, lookup_instance_field};
use crate::reconcile::{constants_insert, ic_add_check};

impl Isolate {
    pub fn intern(&mut self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    // ── Libraries ─────────────────────────────────────────────────────

    /// Define a reloadable library with an implicit top-level class and a
    /// fresh script generation.
    pub fn define_library(&mut self, url: &str) -> Value {
        self.define_library_with(url, LibraryFlags::DEBUGGABLE)
    }

    /// Define a platform ("clean") library: preserved across reloads.
    pub fn define_platform_library(&mut self, url: &str) -> Value {
        self.define_library_with(url, LibraryFlags::PLATFORM | LibraryFlags::DEBUGGABLE)
    }

    fn define_library_with(&mut self, url: &str, flags: LibraryFlags) -> Value {
        let url_sym = self.symbols.intern(url);
        let lib = self.new_library(url_sym, flags);
        let script = self.new_script(url_sym);
        let toplevel = self.new_class(
            self.well_known.toplevel,
            lib,
            script,
            Value::NULL,
            ClassFlags::empty(),
        );
        self.class_table.register(toplevel);
        // SAFETY: lib references the freshly allocated Library.
        unsafe { lib.as_mut::<Library>().toplevel_class = toplevel };
        let libraries = self.store.libraries;
        self.growable_push(libraries, lib);
        lib
    }

    pub fn set_root_library(&mut self, lib: Value) {
        self.store.root_library = lib;
    }

    pub fn toplevel_class(&self, lib: Value) -> Value {
        // SAFETY: lib references a valid Library.
        unsafe { lib.as_ref::<Library>() }.toplevel_class
    }

    fn library_script(&self, lib: Value) -> Value {
        let toplevel = self.toplevel_class(lib);
        // SAFETY: the top-level class is a valid Class.
        unsafe { toplevel.as_ref::<Class>() }.script
    }

    /// The script generation a function was defined in.
    pub fn function_script(&self, func: Value) -> Value {
        // SAFETY: func references a valid Function.
        let owner = unsafe { func.as_ref::<Function>() }.owner;
        if !owner.is_ref() {
            return Value::NULL;
        }
        // SAFETY: owner is a Class or PatchClass; dispatch on cid to read
        // the right layout.
        unsafe {
            match object::header_at(owner.ref_bits() as *const u64).cid() {
                object::CID_PATCH_CLASS => {
                    owner.as_ref::<object::PatchClass>().script
                }
                _ => owner.as_ref::<Class>().script,
            }
        }
    }

    // ── Classes and fields ────────────────────────────────────────────

    /// Define a class with the given instance fields (unfinalized; offsets
    /// are assigned when the class is driven to finalized).
    pub fn define_class(
        &mut self,
        lib: Value,
        name: &str,
        super_class: Value,
        instance_fields: &[&str],
    ) -> Value {
        let name_sym = self.symbols.intern(name);
        let script = self.library_script(lib);
        let cls = self.new_class(name_sym, lib, script, super_class, ClassFlags::empty());
        self.class_table.register(cls);
        for field_name in instance_fields {
            let field_sym = self.symbols.intern(field_name);
            let field = self.new_field(field_sym, cls, FieldFlags::empty());
            // SAFETY: cls references a valid Class.
            let fields = unsafe { cls.as_ref::<Class>() }.fields;
            self.growable_push(fields, field);
        }
        // SAFETY: lib references a valid Library.
        let dictionary = unsafe { lib.as_ref::<Library>() }.dictionary;
        self.growable_push(dictionary, cls);
        cls
    }

    pub fn define_static_field(&mut self, owner: Value, name: &str, value: Value) -> Value {
        let name_sym = self.symbols.intern(name);
        let field = self.new_field(name_sym, owner, FieldFlags::STATIC);
        // SAFETY: field references the freshly allocated Field.
        unsafe { field.as_mut::<Field>().static_value = value };
        // SAFETY: owner references a valid Class.
        let fields = unsafe { owner.as_ref::<Class>() }.fields;
        self.growable_push(fields, field);
        field
    }

    /// A top-level static field: owned by the library's top-level class
    /// and listed in the dictionary.
    pub fn define_toplevel_field(&mut self, lib: Value, name: &str, value: Value) -> Value {
        let toplevel = self.toplevel_class(lib);
        let field = self.define_static_field(toplevel, name, value);
        // SAFETY: lib references a valid Library.
        let dictionary = unsafe { lib.as_ref::<Library>() }.dictionary;
        self.growable_push(dictionary, field);
        field
    }

    /// An enum class: one `index` instance field, a canonical instance and
    /// a const static field per value. Enums are shaped at definition, so
    /// the class is finalized immediately.
    pub fn define_enum(&mut self, lib: Value, name: &str, values: &[&str]) -> Value {
        let name_sym = self.symbols.intern(name);
        let script = self.library_script(lib);
        let cls = self.new_class(name_sym, lib, script, Value::NULL, ClassFlags::ENUM);
        self.class_table.register(cls);

        let index_sym = self.symbols.intern("index");
        let index_field = self.new_field(index_sym, cls, FieldFlags::empty());
        // SAFETY: freshly allocated field and class.
        unsafe {
            index_field.as_mut::<Field>().set_offset(Instance::BASE_WORDS);
            let c = cls.as_mut::<Class>();
            c.instance_size_words = Value::from_i64((Instance::BASE_WORDS + 1) as i64);
            c.set_finalization(FinalizationState::Finalized);
        }
        // SAFETY: cls references a valid Class.
        let fields = unsafe { cls.as_ref::<Class>() }.fields;
        self.growable_push(fields, index_field);

        for (i, value_name) in values.iter().enumerate() {
            let instance = self.new_instance_of(cls);
            // SAFETY: the instance has the index slot at BASE_WORDS.
            unsafe {
                instance
                    .as_mut::<Instance>()
                    .set_field_at(Instance::BASE_WORDS, Value::from_i64(i as i64));
            }
            let value_sym = self.symbols.intern(value_name);
            let field = self.new_field(value_sym, cls, FieldFlags::STATIC | FieldFlags::CONST);
            // SAFETY: freshly allocated field.
            unsafe { field.as_mut::<Field>().static_value = instance };
            self.growable_push(fields, field);
            constants_insert(self, cls, value_sym, instance);
        }

        // SAFETY: lib references a valid Library.
        let dictionary = unsafe { lib.as_ref::<Library>() }.dictionary;
        self.growable_push(dictionary, cls);
        cls
    }

    /// Allocate an instance, driving the class to finalized first.
    pub fn new_instance(&mut self, cls: Value) -> Result<Value, crate::error::ReloadError> {
        ensure_finalized(self, cls)?;
        Ok(self.new_instance_of(cls))
    }

    // ── Functions and call sites ──────────────────────────────────────

    /// Define a function with freshly compiled unoptimized code.
    pub fn define_function(&mut self, owner: Value, name: &str, is_static: bool) -> Value {
        let name_sym = self.symbols.intern(name);
        let flags = if is_static {
            FunctionFlags::STATIC
        } else {
            FunctionFlags::empty()
        };
        let func = self.new_function(name_sym, owner, flags);
        let descriptors = self.new_growable();
        let edge_counters = self.new_growable();
        let code = self.new_code(func, CodeFlags::empty(), Value::NULL, descriptors, edge_counters);
        // SAFETY: func references the freshly allocated Function.
        unsafe {
            let f = func.as_mut::<Function>();
            f.unoptimized_code = code;
            f.code = code;
        }
        // SAFETY: owner references a valid Class.
        let functions = unsafe { owner.as_ref::<Class>() }.functions;
        self.growable_push(functions, func);
        func
    }

    /// A top-level (static) function, listed in the library dictionary.
    pub fn define_toplevel_function(&mut self, lib: Value, name: &str) -> Value {
        let toplevel = self.toplevel_class(lib);
        let func = self.define_function(toplevel, name, true);
        // SAFETY: lib references a valid Library.
        let dictionary = unsafe { lib.as_ref::<Library>() }.dictionary;
        self.growable_push(dictionary, func);
        func
    }

    /// Record a dynamic call site in `func`'s unoptimized code. Returns
    /// the site's deopt id.
    pub fn add_ic_call_site(&mut self, func: Value, selector: &str, arity: usize) -> usize {
        let selector_sym = self.symbols.intern(selector);
        let ic = self.new_ic_data(selector_sym, func, arity);
        self.add_call_site(func, ic, PcKind::IcCall)
    }

    /// Record a static call site bound to `target`. Returns the site's
    /// deopt id.
    pub fn add_static_call_site(&mut self, func: Value, target: Value) -> usize {
        // SAFETY: target references a valid Function.
        let selector_sym = unsafe { target.as_ref::<Function>() }.name_sym();
        let ic = self.new_ic_data(selector_sym, func, 0);
        ic_add_check(self, ic, &[], target);
        self.add_call_site(func, ic, PcKind::UnoptStaticCall)
    }

    fn add_call_site(&mut self, func: Value, ic: Value, kind: PcKind) -> usize {
        // SAFETY: func references a valid Function.
        let (ic_data_array, code) = unsafe {
            let f = func.as_ref::<Function>();
            (f.ic_data_array, f.unoptimized_code)
        };
        let deopt_id = self.growable_len(ic_data_array);
        self.growable_push(ic_data_array, ic);
        // SAFETY: code references a valid Code.
        let (descriptors, edge_counters) = unsafe {
            let c = code.as_ref::<Code>();
            (c.descriptors, c.edge_counters)
        };
        self.growable_push(descriptors, Value::from_i64(encode_descriptor(kind, deopt_id)));
        self.growable_push(edge_counters, Value::from_i64(0));
        deopt_id
    }

    pub fn ic_at(&self, func: Value, deopt_id: usize) -> Value {
        // SAFETY: func references a valid Function.
        let ic_data_array = unsafe { func.as_ref::<Function>() }.ic_data_array;
        self.growable_at(ic_data_array, deopt_id)
    }

    /// Produce optimized code for `func` and make it current. The object
    /// pool keeps the unoptimized code the activation falls back to after
    /// deoptimization.
    pub fn optimize_function(&mut self, func: Value) -> Value {
        // SAFETY: func references a valid Function.
        let unoptimized = unsafe { func.as_ref::<Function>() }.unoptimized_code;
        debug_assert!(unoptimized.is_ref());
        let pool = self.new_growable();
        self.growable_push(pool, unoptimized);
        let descriptors = self.new_growable();
        let edge_counters = self.new_growable();
        let code = self.new_code(func, CodeFlags::OPTIMIZED, pool, descriptors, edge_counters);
        // SAFETY: exclusive mutator access.
        unsafe { func.as_mut::<Function>().code = code };
        code
    }

    // ── Observation helpers ───────────────────────────────────────────

    pub fn static_field_value(&self, field: Value) -> Value {
        // SAFETY: field references a valid Field.
        unsafe { field.as_ref::<Field>() }.static_value
    }

    /// Read an instance field by name through the instance's current
    /// class.
    pub fn instance_field(&mut self, instance: Value, name: &str) -> Option<Value> {
        let name_sym = self.symbols.intern(name);
        let cls = class_of(self, instance);
        let field = lookup_instance_field(self, cls, name_sym)?;
        // SAFETY: field references a valid Field with an assigned offset.
        let offset = unsafe { field.as_ref::<Field>() }.offset();
        // SAFETY: the offset is valid for the instance's layout.
        Some(unsafe { instance.as_ref::<Instance>().field_at(offset) })
    }

    /// Write an instance field by name through the instance's current
    /// class.
    pub fn set_instance_field(&mut self, instance: Value, name: &str, value: Value) {
        let name_sym = self.symbols.intern(name);
        let cls = class_of(self, instance);
        let field = lookup_instance_field(self, cls, name_sym)
            .expect("instance field not found");
        // SAFETY: field references a valid Field with an assigned offset.
        let offset = unsafe { field.as_ref::<Field>() }.offset();
        // SAFETY: the offset is valid for the instance's layout.
        unsafe { instance.as_mut::<Instance>().set_field_at(offset, value) };
    }
}
