use object::{
    header_at, Class, Field, Function, Library, PatchClass, Symbol, Value,
    CID_CLASS, CID_FIELD, CID_FUNCTION, CID_PATCH_CLASS,
};

use crate::isolate::Isolate;

/// The class of any value: fixnums dispatch against the platform fixnum
/// class, heap objects against their header cid's class-table entry.
pub fn class_of(isolate: &Isolate, value: Value) -> Value {
    if value.is_fixnum() {
        return isolate.store.fixnum_class;
    }
    debug_assert!(value.is_ref());
    // SAFETY: value is a heap reference.
    let cid = unsafe { header_at(value.ref_bits() as *const u64) }.cid();
    isolate.class_table.at(cid as usize)
}

/// Resolve a dynamic selector against `cls`, walking the superclass chain
/// youngest-first.
pub fn resolve_dynamic(isolate: &Isolate, cls: Value, selector: Symbol) -> Option<Value> {
    let mut current = cls;
    while current.is_ref() {
        // SAFETY: current references a valid Class.
        let (functions, super_class) = unsafe {
            let c = current.as_ref::<Class>();
            (c.functions, c.super_class)
        };
        for func in isolate.growable_snapshot(functions) {
            // SAFETY: class function lists hold valid Functions.
            let f = unsafe { func.as_ref::<Function>() };
            if !f.is_static() && f.name_sym() == selector {
                return Some(func);
            }
        }
        current = super_class;
    }
    None
}

/// Resolve a static selector on `cls` itself (no chain walk).
pub fn resolve_static(isolate: &Isolate, cls: Value, selector: Symbol) -> Option<Value> {
    if !cls.is_ref() {
        return None;
    }
    // SAFETY: cls references a valid Class.
    let functions = unsafe { cls.as_ref::<Class>() }.functions;
    for func in isolate.growable_snapshot(functions) {
        // SAFETY: class function lists hold valid Functions.
        let f = unsafe { func.as_ref::<Function>() };
        if f.is_static() && f.name_sym() == selector {
            return Some(func);
        }
    }
    None
}

/// Find a static field by name on `cls`.
pub fn lookup_static_field(isolate: &Isolate, cls: Value, name: Symbol) -> Option<Value> {
    // SAFETY: cls references a valid Class.
    let fields = unsafe { cls.as_ref::<Class>() }.fields;
    for field in isolate.growable_snapshot(fields) {
        // SAFETY: class field lists hold valid Fields.
        let f = unsafe { field.as_ref::<Field>() };
        if f.is_static() && f.name_sym() == name {
            return Some(field);
        }
    }
    None
}

/// Find an instance field by name walking the superclass chain.
pub fn lookup_instance_field(isolate: &Isolate, cls: Value, name: Symbol) -> Option<Value> {
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
            if !f.is_static() && f.name_sym() == name {
                return Some(field);
            }
        }
        current = super_class;
    }
    None
}

/// Look a named entry up in a library's dictionary.
pub fn library_lookup(isolate: &Isolate, lib: Value, name: Symbol) -> Option<Value> {
    // SAFETY: lib references a valid Library.
    let dictionary = unsafe { lib.as_ref::<Library>() }.dictionary;
    for entry in isolate.growable_snapshot(dictionary) {
        if dictionary_name(entry) == Some(name) {
            return Some(entry);
        }
    }
    None
}

fn dictionary_name(entry: Value) -> Option<Symbol> {
    if !entry.is_ref() {
        return None;
    }
    // SAFETY: entry is a heap reference; the cid selects the layout.
    unsafe {
        match header_at(entry.ref_bits() as *const u64).cid() {
            CID_CLASS => Some(entry.as_ref::<Class>().name_sym()),
            CID_FUNCTION => Some(entry.as_ref::<Function>().name_sym()),
            CID_FIELD => Some(entry.as_ref::<Field>().name_sym()),
            _ => None,
        }
    }
}

/// Subclass test walking the superclass chain.
pub fn is_subclass_of(_isolate: &Isolate, cls: Value, other: Value) -> bool {
    let mut current = cls;
    while current.is_ref() {
        if current.raw() == other.raw() {
            return true;
        }
        // SAFETY: current references a valid Class.
        current = unsafe { current.as_ref::<Class>() }.super_class;
    }
    false
}

/// The class a function belongs to; functions re-parented onto a patch
/// class resolve through it to the class that replaced theirs.
pub fn owner_class(_isolate: &Isolate, func: Value) -> Value {
    // SAFETY: func references a valid Function.
    let owner = unsafe { func.as_ref::<Function>() }.owner;
    if !owner.is_ref() {
        return Value::NULL;
    }
    // SAFETY: owner is a heap reference; the cid selects the layout.
    unsafe {
        match header_at(owner.ref_bits() as *const u64).cid() {
            CID_PATCH_CLASS => owner.as_ref::<PatchClass>().patched_class,
            _ => owner,
        }
    }
}

/// The library a function's owning class lives in.
pub fn owner_library(isolate: &Isolate, func: Value) -> Value {
    let cls = owner_class(isolate, func);
    if !cls.is_ref() {
        return Value::NULL;
    }
    // SAFETY: cls references a valid Class.
    unsafe { cls.as_ref::<Class>() }.library
}
