use object::{Array, Class, TypeArguments, Value};

use crate::isolate::Isolate;

const INITIAL_CAPACITY: usize = 16;

/// The canonical type-arguments table is an open-addressed array whose
/// last element holds the number of used slots; the capacity (length − 1)
/// is a power of two. The hash of an entry mixes the current cids of the
/// classes it references, so the table must be rebuilt after a reload has
/// moved classes around in the class table.

pub fn new_canonical_table(isolate: &mut Isolate) -> Value {
    let table = isolate.new_array(INITIAL_CAPACITY + 1);
    // SAFETY: freshly allocated array.
    unsafe {
        table
            .as_mut::<Array>()
            .set_at(INITIAL_CAPACITY, Value::from_i64(0));
    }
    table
}

#[inline(always)]
fn combine_hash(hash: u64, value: u64) -> u64 {
    let mut hash = hash.wrapping_add(value);
    hash = hash.wrapping_add(hash << 10);
    hash ^ (hash >> 6)
}

#[inline(always)]
fn finalize_hash(mut hash: u64) -> u64 {
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

fn type_element_cid(element: Value) -> u64 {
    if element.is_ref() {
        // SAFETY: type elements are class references.
        unsafe { element.as_ref::<Class>() }.cid() as u64
    } else {
        0
    }
}

pub fn hash_type_elements(elements: &[Value]) -> u64 {
    let mut hash = combine_hash(0, elements.len() as u64);
    for &element in elements {
        hash = combine_hash(hash, type_element_cid(element));
    }
    finalize_hash(hash)
}

pub fn hash_type_arguments(typeargs: Value) -> u64 {
    // SAFETY: typeargs references a valid TypeArguments.
    unsafe { hash_type_elements(typeargs.as_ref::<TypeArguments>().types()) }
}

fn elements_equal(typeargs: Value, elements: &[Value]) -> bool {
    // SAFETY: typeargs references a valid TypeArguments.
    let existing = unsafe { typeargs.as_ref::<TypeArguments>().types() };
    existing.len() == elements.len()
        && existing
            .iter()
            .zip(elements)
            .all(|(a, b)| a.raw() == b.raw())
}

pub fn type_arguments_equal(a: Value, b: Value) -> bool {
    // SAFETY: both reference valid TypeArguments.
    unsafe { elements_equal(a, b.as_ref::<TypeArguments>().types()) }
}

fn table_parts(table: Value) -> (usize, usize) {
    // SAFETY: the canonical table is a valid Array.
    let arr = unsafe { table.as_ref::<Array>() };
    let capacity = arr.len() - 1;
    debug_assert!(capacity.is_power_of_two());
    // SAFETY: the last slot holds the used count fixnum.
    let used = unsafe { arr.at(capacity).to_i64() } as usize;
    (capacity, used)
}

/// Return the canonical tuple for `elements`, interning a fresh one if the
/// table has no equal entry yet.
pub fn canonicalize_type_arguments(isolate: &mut Isolate, elements: &[Value]) -> Value {
    grow_if_needed(isolate);
    let table = isolate.store.canonical_type_arguments;
    let (capacity, used) = table_parts(table);

    let mut index = (hash_type_elements(elements) as usize) & (capacity - 1);
    loop {
        // SAFETY: the canonical table is a valid Array; index < capacity.
        let slot = unsafe { table.as_ref::<Array>().at(index) };
        if slot.is_null() {
            break;
        }
        if elements_equal(slot, elements) {
            return slot;
        }
        index = (index + 1) & (capacity - 1);
    }

    let fresh = isolate.new_type_arguments(elements);
    // SAFETY: the canonical table is a valid Array; index < capacity.
    unsafe {
        let arr = table.as_mut::<Array>();
        arr.set_at(index, fresh);
        arr.set_at(capacity, Value::from_i64(used as i64 + 1));
    }
    fresh
}

fn grow_if_needed(isolate: &mut Isolate) {
    let table = isolate.store.canonical_type_arguments;
    let (capacity, used) = table_parts(table);
    if (used + 1) * 4 <= capacity * 3 {
        return;
    }

    let new_capacity = capacity * 2;
    let new_table = isolate.new_array(new_capacity + 1);
    for i in 0..capacity {
        // SAFETY: both tables are valid Arrays.
        let element = unsafe { table.as_ref::<Array>().at(i) };
        if element.is_null() {
            continue;
        }
        let mut index = (hash_type_arguments(element) as usize) & (new_capacity - 1);
        // SAFETY: the new table is larger than the old, so probing
        // terminates on a NULL slot.
        unsafe {
            let arr = new_table.as_mut::<Array>();
            while !arr.at(index).is_null() {
                index = (index + 1) & (new_capacity - 1);
            }
            arr.set_at(index, element);
        }
    }
    // SAFETY: the new table is a valid Array.
    unsafe {
        new_table
            .as_mut::<Array>()
            .set_at(new_capacity, Value::from_i64(used as i64));
    }
    isolate.store.canonical_type_arguments = new_table;
}

/// Rebuild the table in a fresh array of the same capacity, re-inserting
/// every element by its freshly computed hash. Replacing old classes with
/// new ones can leave equivalent but distinct tuples behind; an insert
/// that finds an equal entry overwrites it, keeping one of the two.
pub fn rehash_canonical_type_arguments(isolate: &mut Isolate) {
    let table = isolate.store.canonical_type_arguments;
    let (capacity, used) = table_parts(table);

    let new_table = isolate.new_array(capacity + 1);
    for i in 0..capacity {
        // SAFETY: both tables are valid Arrays.
        let element = unsafe { table.as_ref::<Array>().at(i) };
        if element.is_null() {
            continue;
        }
        let mut index = (hash_type_arguments(element) as usize) & (capacity - 1);
        // SAFETY: the new table holds at most as many elements as the old.
        unsafe {
            let arr = new_table.as_mut::<Array>();
            loop {
                let slot = arr.at(index);
                if slot.is_null() || type_arguments_equal(slot, element) {
                    break;
                }
                index = (index + 1) & (capacity - 1);
            }
            arr.set_at(index, element);
        }
    }
    // SAFETY: the new table is a valid Array.
    unsafe {
        new_table
            .as_mut::<Array>()
            .set_at(capacity, Value::from_i64(used as i64));
    }
    isolate.store.canonical_type_arguments = new_table;

    #[cfg(debug_assertions)]
    verify_canonical_type_arguments(isolate);
}

/// No two distinct slots may hold equal tuples.
#[cfg(debug_assertions)]
pub fn verify_canonical_type_arguments(isolate: &Isolate) {
    let table = isolate.store.canonical_type_arguments;
    let (capacity, _) = table_parts(table);
    for i in 0..capacity {
        // SAFETY: the canonical table is a valid Array.
        let a = unsafe { table.as_ref::<Array>().at(i) };
        if a.is_null() {
            continue;
        }
        for j in (i + 1)..capacity {
            // SAFETY: the canonical table is a valid Array.
            let b = unsafe { table.as_ref::<Array>().at(j) };
            if b.is_null() {
                continue;
            }
            assert!(
                !type_arguments_equal(a, b),
                "duplicate canonical type arguments after rehash"
            );
        }
    }
}
