use molt::{
    canonicalize_type_arguments, class_of, constants_find, ic_add_check,
    ic_cached_cids, is_subclass_of, library_lookup, lookup_static_field,
    resolve_dynamic, type_arguments_equal, Isolate, RecordingSink,
    ReloadError, ReloadEvent, ReloadFlags,
};
use object::{Array, Class, Code, Function, Library, Script, Symbol, Value};

fn new_isolate() -> (Isolate, RecordingSink) {
    let sink = RecordingSink::new();
    let mut isolate = Isolate::new(ReloadFlags::default());
    isolate.event_sink = Box::new(sink.clone());
    (isolate, sink)
}

fn script_version(isolate: &Isolate, func: Value) -> i64 {
    let script = isolate.function_script(func);
    unsafe { script.as_ref::<Script>() }.version()
}

fn class_cid(cls: Value) -> u32 {
    unsafe { cls.as_ref::<Class>() }.cid()
}

fn current_code(func: Value) -> Value {
    unsafe { func.as_ref::<Function>() }.code
}

fn ic_data_array(func: Value) -> Value {
    unsafe { func.as_ref::<Function>() }.ic_data_array
}

fn canonical_entries(isolate: &Isolate) -> Vec<Value> {
    let table = isolate.store.canonical_type_arguments;
    let arr = unsafe { table.as_ref::<Array>() };
    let capacity = arr.len() - 1;
    (0..capacity)
        .map(|i| unsafe { arr.at(i) })
        .filter(|slot| !slot.is_null())
        .collect()
}

/// The observable pre-reload world, for atomicity checks.
struct WorldSnapshot {
    num_cids: usize,
    root_library: u64,
    libraries: Vec<u64>,
    canonical: Vec<u64>,
    static_values: Vec<u64>,
}

fn snapshot(isolate: &Isolate, static_fields: &[Value]) -> WorldSnapshot {
    WorldSnapshot {
        num_cids: isolate.class_table.num_cids(),
        root_library: isolate.store.root_library.raw(),
        libraries: isolate
            .growable_snapshot(isolate.store.libraries)
            .iter()
            .map(|lib| lib.raw())
            .collect(),
        canonical: canonical_entries(isolate)
            .iter()
            .map(|entry| entry.raw())
            .collect(),
        static_values: static_fields
            .iter()
            .map(|&field| isolate.static_field_value(field).raw())
            .collect(),
    }
}

fn assert_world_unchanged(isolate: &Isolate, before: &WorldSnapshot, static_fields: &[Value]) {
    let after = snapshot(isolate, static_fields);
    assert_eq!(after.num_cids, before.num_cids);
    assert_eq!(after.root_library, before.root_library);
    assert_eq!(after.libraries, before.libraries);
    assert_eq!(after.canonical, before.canonical);
    assert_eq!(after.static_values, before.static_values);
}

/// No live root or heap slot references a forwarding corpse.
fn assert_no_forwarders(isolate: &mut Isolate) {
    let mut check = |slot: &mut Value| {
        assert!(!unsafe { object::is_forwarding_ref(*slot) });
    };
    heap::RootProvider::visit_roots(isolate, &mut check);
    isolate.heap.visit_pointers(&mut check);
}

// ── Scenarios ─────────────────────────────────────────────────────────

#[test]
fn function_body_replacement() {
    let (mut isolate, sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let main_v1 = isolate.define_toplevel_function(lib, "main");
    isolate.set_root_library(lib);
    let main_sym = isolate.intern("main");
    let v1_script = script_version(&isolate, main_v1);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    let root = isolate.store.root_library;
    let main_v2 = library_lookup(&isolate, root, main_sym).unwrap();
    assert_ne!(main_v2.raw(), main_v1.raw());
    assert!(script_version(&isolate, main_v2) > v1_script);
    // Dirty-library function: recompiled lazily on next invocation.
    assert_eq!(current_code(main_v2).raw(), isolate.store.lazy_compile_stub.raw());
    assert_eq!(sink.events(), vec![ReloadEvent::success()]);
}

#[test]
fn load_error_rolls_back() {
    let (mut isolate, sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    isolate.define_toplevel_function(lib, "main");
    let value = isolate.define_toplevel_field(lib, "value", Value::from_i64(4));
    isolate.set_root_library(lib);
    let before = snapshot(&isolate, &[value]);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        // Partial image, then a parse failure.
        let lib = iso.define_library("test:main");
        iso.define_class(lib, "Foo", Value::NULL, &["a"]);
        Err(ReloadError::Load("unexpected token".into()))
    };
    let result = isolate.reload(&mut loader);
    assert_eq!(result, Err(ReloadError::Load("unexpected token".into())));

    assert_world_unchanged(&isolate, &before, &[value]);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert!(events[0].error.as_ref().unwrap().contains("unexpected token"));
}

#[test]
fn instance_field_count_change_is_rejected() {
    let (mut isolate, sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let foo_v1 = isolate.define_class(lib, "Foo", Value::NULL, &["a"]);
    let saved = isolate.new_instance(foo_v1).unwrap();
    let saved_cid = unsafe { object::header_at(saved.ref_bits() as *const u64) }.cid();
    isolate.set_root_library(lib);
    let before = snapshot(&isolate, &[]);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_class(lib, "Foo", Value::NULL, &["a", "b"]);
        iso.set_root_library(lib);
        Ok(())
    };
    let result = isolate.reload(&mut loader);
    assert_eq!(
        result,
        Err(ReloadError::Shape("Number of instance fields changed in Foo".into()))
    );

    assert_world_unchanged(&isolate, &before, &[]);
    // The saved instance still answers as the old Foo.
    assert_eq!(class_of(&isolate, saved).raw(), foo_v1.raw());
    assert_eq!(unsafe { object::header_at(saved.ref_bits() as *const u64) }.cid(), saved_cid);
    assert_eq!(sink.events().len(), 1);
}

#[test]
fn instance_field_rename_is_rejected() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let foo = isolate.define_class(lib, "Foo", Value::NULL, &["a"]);
    isolate.new_instance(foo).unwrap();
    isolate.set_root_library(lib);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_class(lib, "Foo", Value::NULL, &["x"]);
        iso.set_root_library(lib);
        Ok(())
    };
    let result = isolate.reload(&mut loader);
    assert_eq!(
        result,
        Err(ReloadError::Shape(
            "Name of instance field changed ('a' vs 'x') in Foo".into()
        ))
    );
}

#[test]
fn static_value_preserved() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let init_v1 = isolate.define_toplevel_function(lib, "init");
    // value = init() evaluated to the "old value" at first load.
    let field_v1 = isolate.define_toplevel_field(lib, "value", Value::from_i64(41));
    isolate.set_root_library(lib);
    let field_handle = isolate.new_handle(field_v1);
    let value_sym = isolate.intern("value");
    let init_sym = isolate.intern("init");
    let v1_script = script_version(&isolate, init_v1);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_function(lib, "init");
        // The new initializer would produce a different value, but the
        // initialized state must win.
        iso.define_toplevel_field(lib, "value", Value::from_i64(99));
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    let root = isolate.store.root_library;
    let toplevel = isolate.toplevel_class(root);
    let field_v2 = lookup_static_field(&isolate, toplevel, value_sym).unwrap();
    // Old field identity forwarded to the new field; old value retained.
    assert_eq!(isolate.deref(field_handle).raw(), field_v2.raw());
    assert_eq!(isolate.static_field_value(field_v2).raw(), Value::from_i64(41).raw());
    // The function body is new.
    let init_v2 = library_lookup(&isolate, root, init_sym).unwrap();
    assert!(script_version(&isolate, init_v2) > v1_script);
}

#[test]
fn toplevel_field_added() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    isolate.define_toplevel_field(lib, "value1", Value::from_i64(10));
    isolate.set_root_library(lib);
    let value1_sym = isolate.intern("value1");
    let value2_sym = isolate.intern("value2");

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_field(lib, "value1", Value::from_i64(10));
        iso.define_toplevel_field(lib, "value2", Value::from_i64(20));
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    let toplevel = isolate.toplevel_class(isolate.store.root_library);
    let value1 = lookup_static_field(&isolate, toplevel, value1_sym).unwrap();
    let value2 = lookup_static_field(&isolate, toplevel, value2_sym).unwrap();
    assert_eq!(isolate.static_field_value(value1).raw(), Value::from_i64(10).raw());
    assert_eq!(isolate.static_field_value(value2).raw(), Value::from_i64(20).raw());
}

#[test]
fn superclass_swap() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let a_v1 = isolate.define_class(lib, "A", Value::NULL, &[]);
    let b_v1 = isolate.define_class(lib, "B", a_v1, &[]);
    let a1 = isolate.new_instance(a_v1).unwrap();
    let b1 = isolate.new_instance(b_v1).unwrap();
    isolate.set_root_library(lib);
    let a_sym = isolate.intern("A");
    let b_sym = isolate.intern("B");

    // Pre-reload: a1 is A but not B; b1 is both.
    assert!(is_subclass_of(&isolate, class_of(&isolate, a1), a_v1));
    assert!(!is_subclass_of(&isolate, class_of(&isolate, a1), b_v1));

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        let b = iso.define_class(lib, "B", Value::NULL, &[]);
        iso.define_class(lib, "A", b, &[]);
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    let root = isolate.store.root_library;
    let a_v2 = library_lookup(&isolate, root, a_sym).unwrap();
    let b_v2 = library_lookup(&isolate, root, b_sym).unwrap();
    // (a1 is A / is B, b1 is A / is B) == (true/true, false/true)
    assert!(is_subclass_of(&isolate, class_of(&isolate, a1), a_v2));
    assert!(is_subclass_of(&isolate, class_of(&isolate, a1), b_v2));
    assert!(!is_subclass_of(&isolate, class_of(&isolate, b1), a_v2));
    assert!(is_subclass_of(&isolate, class_of(&isolate, b1), b_v2));
}

#[test]
fn instance_state_survives_method_change() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let b_v1 = isolate.define_class(lib, "B", Value::NULL, &["field"]);
    let func_v1 = isolate.define_function(b_v1, "func", false);
    let saved = isolate.new_instance(b_v1).unwrap();
    isolate.set_instance_field(saved, "field", Value::from_i64(1));
    isolate.set_root_library(lib);
    let func_sym = isolate.intern("func");
    let v1_script = script_version(&isolate, func_v1);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        let b = iso.define_class(lib, "B", Value::NULL, &["field"]);
        iso.define_function(b, "func", false);
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    // The saved instance keeps its field value but virtual dispatch sees
    // the new method.
    assert_eq!(
        isolate.instance_field(saved, "field").unwrap().raw(),
        Value::from_i64(1).raw()
    );
    let resolved = resolve_dynamic(&isolate, class_of(&isolate, saved), func_sym).unwrap();
    assert_ne!(resolved.raw(), func_v1.raw());
    assert!(script_version(&isolate, resolved) > v1_script);
}

#[test]
fn live_stack_reload_rebinds_static_calls() {
    let (mut isolate, sink) = new_isolate();
    isolate.flags.reload_every = 1;
    isolate.flags.reload_every_optimized = false;

    let lib = isolate.define_library("test:main");
    let helper_v1 = isolate.define_toplevel_function(lib, "helper");
    let alpha_v1 = isolate.define_toplevel_function(lib, "alpha");
    let deopt_id = isolate.add_static_call_site(alpha_v1, helper_v1);
    isolate.set_root_library(lib);
    let helper_sym = isolate.intern("helper");

    // alpha() is mid-execution when the reload triggers.
    isolate.push_frame(alpha_v1);
    let frame_code = isolate.frames[0].code;
    let ic = isolate.ic_at(alpha_v1, deopt_id);

    isolate.set_reload_test_loader(Box::new(
        |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
            let lib = iso.define_library("test:main");
            iso.define_toplevel_function(lib, "helper");
            iso.define_toplevel_function(lib, "alpha");
            iso.set_root_library(lib);
            Ok(())
        },
    ));
    let triggered = isolate.stack_overflow_check();
    assert_eq!(triggered, Some(Ok(())));

    // The in-flight frame still runs its old code...
    assert_eq!(isolate.frames[0].code.raw(), frame_code.raw());
    // ...but its static call site was rebound by name to the new helper.
    let root = isolate.store.root_library;
    let helper_v2 = library_lookup(&isolate, root, helper_sym).unwrap();
    assert_ne!(helper_v2.raw(), helper_v1.raw());
    let entries = isolate.growable_snapshot(unsafe {
        ic.as_ref::<object::ICData>()
    }.entries);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].raw(), helper_v2.raw());
    // The old function's IC array itself was cleared (dirty library).
    assert!(ic_data_array(alpha_v1).is_null());
    assert_eq!(sink.events(), vec![ReloadEvent::success()]);
}

// ── Universal properties ──────────────────────────────────────────────

#[test]
fn cid_stability_across_reload() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let a_v1 = isolate.define_class(lib, "A", Value::NULL, &[]);
    let b_v1 = isolate.define_class(lib, "B", Value::NULL, &[]);
    isolate.set_root_library(lib);
    let (a_cid, b_cid) = (class_cid(a_v1), class_cid(b_v1));
    let a_sym = isolate.intern("A");
    let b_sym = isolate.intern("B");

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_class(lib, "B", Value::NULL, &[]);
        iso.define_class(lib, "A", Value::NULL, &[]);
        iso.define_class(lib, "C", Value::NULL, &[]);
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    let root = isolate.store.root_library;
    let a_v2 = library_lookup(&isolate, root, a_sym).unwrap();
    let b_v2 = library_lookup(&isolate, root, b_sym).unwrap();
    assert_eq!(class_cid(a_v2), a_cid);
    assert_eq!(class_cid(b_v2), b_cid);
    // The table is dense: every slot below the top is valid.
    for cid in object::FIRST_PROGRAM_CID as usize..isolate.class_table.num_cids() {
        assert!(isolate.class_table.has_valid_at(cid));
    }
}

#[test]
fn enum_canonical_instances_preserved() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let color_v1 = isolate.define_enum(lib, "Color", &["red", "green"]);
    isolate.set_root_library(lib);
    let red_sym = isolate.intern("red");
    let blue_sym = isolate.intern("blue");
    let color_sym = isolate.intern("Color");
    let red_field = lookup_static_field(&isolate, color_v1, red_sym).unwrap();
    let red_v1 = isolate.static_field_value(red_field);
    let red_handle = isolate.new_handle(red_v1);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_enum(lib, "Color", &["red", "green", "blue"]);
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    let root = isolate.store.root_library;
    let color_v2 = library_lookup(&isolate, root, color_sym).unwrap();
    assert_eq!(class_cid(color_v2), class_cid(color_v1));

    // The pre-reload canonical instance is still the canonical instance.
    let red_v2 = constants_find(&isolate, color_v2, red_sym).unwrap();
    assert_eq!(red_v2.raw(), red_v1.raw());
    assert_eq!(isolate.deref(red_handle).raw(), red_v2.raw());
    let red_field_v2 = lookup_static_field(&isolate, color_v2, red_sym).unwrap();
    assert_eq!(isolate.static_field_value(red_field_v2).raw(), red_v2.raw());

    // The added value answers as an instance of the surviving cid.
    let blue = constants_find(&isolate, color_v2, blue_sym).unwrap();
    assert_eq!(class_of(&isolate, blue).raw(), color_v2.raw());
}

#[test]
fn no_forwarders_after_commit() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let color = isolate.define_enum(lib, "Color", &["red"]);
    isolate.define_class(lib, "A", Value::NULL, &[]);
    isolate.define_toplevel_field(lib, "value", Value::from_i64(7));
    isolate.define_toplevel_function(lib, "main");
    isolate.new_instance(color).ok();
    isolate.set_root_library(lib);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_enum(lib, "Color", &["red"]);
        iso.define_class(lib, "A", Value::NULL, &[]);
        iso.define_toplevel_field(lib, "value", Value::from_i64(8));
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();
    assert_no_forwarders(&mut isolate);
}

#[test]
fn clean_library_code_kept_dirty_library_code_cleared() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let work = isolate.define_toplevel_function(lib, "work");
    isolate.set_root_library(lib);

    // A call site on a clean-library function, with recorded feedback.
    let plus_sym = isolate.intern("+");
    let fixnum_class = isolate.store.fixnum_class;
    let plus_fn = resolve_dynamic(&isolate, fixnum_class, plus_sym).unwrap();
    let site = isolate.add_ic_call_site(plus_fn, "describe", 1);
    let plus_ic = isolate.ic_at(plus_fn, site);
    ic_add_check(&mut isolate, plus_ic, &[class_cid(fixnum_class)], work);
    let plus_unopt = unsafe { plus_fn.as_ref::<Function>() }.unoptimized_code;

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_function(lib, "work");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    // Clean library: unoptimized code kept, every IC cell sentineled.
    assert_eq!(current_code(plus_fn).raw(), plus_unopt.raw());
    let plus_ics = isolate.growable_snapshot(ic_data_array(plus_fn));
    assert!(!plus_ics.is_empty());
    assert!(plus_ics.iter().all(|cell| cell.is_sentinel()));

    // Dirty library: code and feedback gone, entry via the lazy stub.
    assert_eq!(current_code(work).raw(), isolate.store.lazy_compile_stub.raw());
    assert!(ic_data_array(work).is_null());
    assert!(unsafe { work.as_ref::<Function>() }.unoptimized_code.is_null());
}

#[test]
fn megamorphic_caches_dropped() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    isolate.define_toplevel_function(lib, "main");
    isolate.set_root_library(lib);
    let selector = isolate.intern("spread");
    isolate.new_megamorphic_cache(selector);
    assert!(isolate.store.megamorphic_cache_table.is_ref());

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();
    assert!(isolate.store.megamorphic_cache_table.is_null());
}

#[test]
fn optimized_frame_deopts_and_resets_unoptimized_ics() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let a_cls = isolate.define_class(lib, "A", Value::NULL, &[]);
    let hot = isolate.define_toplevel_function(lib, "hot");
    let site = isolate.add_ic_call_site(hot, "describe", 1);
    let ic = isolate.ic_at(hot, site);
    ic_add_check(&mut isolate, ic, &[class_cid(a_cls)], hot);
    assert_eq!(ic_cached_cids(&isolate, ic), vec![class_cid(a_cls)]);

    let optimized = isolate.optimize_function(hot);
    isolate.push_frame(hot);
    assert_eq!(isolate.frames[0].code.raw(), optimized.raw());
    isolate.set_root_library(lib);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_class(lib, "A", Value::NULL, &[]);
        iso.define_toplevel_function(lib, "hot");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    // The optimized frame resumes unoptimized when control returns to it,
    // and the unoptimized code it will finish in carries no stale
    // feedback.
    assert!(isolate.frames[0].pending_deopt);
    assert!(ic_cached_cids(&isolate, ic).is_empty());
}

#[test]
fn fixnum_fast_path_reseeded_on_stack() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let a_cls = isolate.define_class(lib, "A", Value::NULL, &[]);
    let work = isolate.define_toplevel_function(lib, "work");
    let site = isolate.add_ic_call_site(work, "+", 2);
    let ic = isolate.ic_at(work, site);
    ic_add_check(&mut isolate, ic, &[class_cid(a_cls), class_cid(a_cls)], work);
    isolate.push_frame(work);
    isolate.set_root_library(lib);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_class(lib, "A", Value::NULL, &[]);
        iso.define_toplevel_function(lib, "work");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    // The two-argument "+" site keeps the fixnum fast-path prediction.
    let fixnum_cid = class_cid(isolate.store.fixnum_class);
    assert_eq!(ic_cached_cids(&isolate, ic), vec![fixnum_cid, fixnum_cid]);
    let plus_sym = isolate.intern("+");
    let plus_fn = resolve_dynamic(&isolate, isolate.store.fixnum_class, plus_sym).unwrap();
    let entries = isolate.growable_snapshot(unsafe {
        ic.as_ref::<object::ICData>()
    }.entries);
    assert_eq!(entries.last().unwrap().raw(), plus_fn.raw());
}

// ── Supplemented behavior ─────────────────────────────────────────────

#[test]
fn library_debuggable_preserved() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    isolate.define_toplevel_function(lib, "main");
    unsafe { lib.as_mut::<Library>().set_debuggable(false) };
    isolate.set_root_library(lib);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    let root = isolate.store.root_library;
    assert!(!unsafe { root.as_ref::<Library>() }.is_debuggable());
}

#[test]
fn saved_closure_function_keeps_original_script() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let magic_v1 = isolate.define_toplevel_function(lib, "magic");
    isolate.set_root_library(lib);
    let v1_script = script_version(&isolate, magic_v1);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        // The reloaded source no longer declares magic at all.
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    // The old function, re-parented onto a patch class, still reaches its
    // original script.
    assert_eq!(script_version(&isolate, magic_v1), v1_script);
}

#[test]
fn class_added_in_reload() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    isolate.define_toplevel_function(lib, "main");
    isolate.set_root_library(lib);
    let a_sym = isolate.intern("A");

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_class(lib, "A", Value::NULL, &[]);
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    let root = isolate.store.root_library;
    let a = library_lookup(&isolate, root, a_sym).unwrap();
    assert!(isolate.class_table.has_valid_at(class_cid(a) as usize));
    assert_eq!(isolate.class_table.at(class_cid(a) as usize).raw(), a.raw());
}

#[test]
fn identity_reload_keeps_counts() {
    let sink = RecordingSink::new();
    let mut isolate = Isolate::new(ReloadFlags {
        identity_reload: true,
        ..ReloadFlags::default()
    });
    isolate.event_sink = Box::new(sink.clone());
    let lib = isolate.define_library("test:main");
    isolate.define_class(lib, "A", Value::NULL, &[]);
    isolate.define_toplevel_function(lib, "main");
    isolate.set_root_library(lib);
    let num_cids = isolate.class_table.num_cids();
    let num_libs = isolate.growable_len(isolate.store.libraries);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_class(lib, "A", Value::NULL, &[]);
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    assert_eq!(isolate.class_table.num_cids(), num_cids);
    assert_eq!(isolate.growable_len(isolate.store.libraries), num_libs);
    assert_eq!(sink.events(), vec![ReloadEvent::success()]);
}

#[test]
fn duplicate_type_arguments_merged_by_rehash() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let a_v1 = isolate.define_class(lib, "A", Value::NULL, &[]);
    isolate.set_root_library(lib);
    let a_sym = isolate.intern("A");
    let tuple_v1 = canonicalize_type_arguments(&mut isolate, &[a_v1]);
    assert_eq!(canonical_entries(&isolate).len(), 1);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        let a = iso.define_class(lib, "A", Value::NULL, &[]);
        // The new image canonicalizes its own tuple over the replacement
        // class, leaving an equal-but-distinct entry behind.
        canonicalize_type_arguments(iso, &[a]);
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();

    // After forwarding, the two tuples became equal; the rehash merged
    // them.
    let root = isolate.store.root_library;
    let a_v2 = library_lookup(&isolate, root, a_sym).unwrap();
    let entries = canonical_entries(&isolate);
    assert_eq!(entries.len(), 1);
    let probe = isolate.new_type_arguments(&[a_v2]);
    assert!(type_arguments_equal(entries[0], probe));
    let _ = tuple_v1;
}

#[test]
fn compile_time_constants_cache_cleared() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    isolate.define_toplevel_function(lib, "main");
    isolate.set_root_library(lib);
    isolate.store.compile_time_constants = isolate.new_array(4);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();
    assert!(isolate.store.compile_time_constants.is_null());
}

// ── Controller edges ──────────────────────────────────────────────────

#[test]
fn reload_while_reloading_is_caller_error() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    isolate.define_toplevel_function(lib, "main");
    isolate.set_root_library(lib);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_function(lib, "main");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.start_reload(&mut loader).unwrap();

    let mut second = |_: &mut Isolate, _: Symbol| -> Result<(), ReloadError> { Ok(()) };
    assert_eq!(
        isolate.start_reload(&mut second),
        Err(ReloadError::ReloadInProgress)
    );
    isolate.finish_reload().unwrap();
}

#[test]
fn abort_reload_rolls_back() {
    let (mut isolate, sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let value = isolate.define_toplevel_field(lib, "value", Value::from_i64(3));
    isolate.set_root_library(lib);
    let before = snapshot(&isolate, &[value]);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_field(lib, "value", Value::from_i64(4));
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.start_reload(&mut loader).unwrap();
    isolate.abort_reload(ReloadError::Load("cancelled".into()));

    assert_world_unchanged(&isolate, &before, &[value]);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
}

#[test]
fn reload_without_root_library_is_rejected() {
    let (mut isolate, _sink) = new_isolate();
    let mut loader = |_: &mut Isolate, _: Symbol| -> Result<(), ReloadError> { Ok(()) };
    assert_eq!(isolate.reload(&mut loader), Err(ReloadError::NoRootLibrary));
}

#[test]
fn consecutive_reloads() {
    let (mut isolate, sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    isolate.define_toplevel_function(lib, "main");
    isolate.set_root_library(lib);
    let main_sym = isolate.intern("main");

    for round in 0..3 {
        let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
            let lib = iso.define_library("test:main");
            iso.define_toplevel_function(lib, "main");
            iso.set_root_library(lib);
            Ok(())
        };
        isolate.reload(&mut loader).unwrap();
        let root = isolate.store.root_library;
        let main = library_lookup(&isolate, root, main_sym).unwrap();
        // Bootstrap takes script 1, the original image 2, each round one
        // more.
        assert_eq!(script_version(&isolate, main), round + 3);
    }
    assert_no_forwarders(&mut isolate);
    assert_eq!(sink.events().len(), 3);
}

#[test]
fn background_compiler_disabled_during_finish() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let work = isolate.define_toplevel_function(lib, "work");
    isolate.set_root_library(lib);
    assert!(!isolate.background_compiler.is_disabled());
    isolate.background_compiler.enqueue(work);
    assert_eq!(isolate.background_compiler.drain().len(), 1);

    let mut loader = |iso: &mut Isolate, _root: Symbol| -> Result<(), ReloadError> {
        let lib = iso.define_library("test:main");
        iso.define_toplevel_function(lib, "work");
        iso.set_root_library(lib);
        Ok(())
    };
    isolate.reload(&mut loader).unwrap();
    assert!(!isolate.background_compiler.is_disabled());
}

#[test]
fn frame_code_lookup_through_deopt_pool() {
    let (mut isolate, _sink) = new_isolate();
    let lib = isolate.define_library("test:main");
    let hot = isolate.define_toplevel_function(lib, "hot");
    let unoptimized = unsafe { hot.as_ref::<Function>() }.unoptimized_code;
    let optimized = isolate.optimize_function(hot);
    assert!(unsafe { optimized.as_ref::<Code>() }.is_optimized());

    let through_pool = molt::unoptimized_code_for(&isolate, optimized).unwrap();
    assert_eq!(through_pool.raw(), unoptimized.raw());
    let direct = molt::unoptimized_code_for(&isolate, unoptimized).unwrap();
    assert_eq!(direct.raw(), unoptimized.raw());
}
