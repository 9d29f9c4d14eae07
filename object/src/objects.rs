use bitflags::bitflags;

use crate::cids::*;
use crate::header::Header;
use crate::value::{Symbol, Value};

// Every layout is a fixed prefix of tagged [`Value`] slots behind the
// header; variable-length layouts (Array, TypeArguments, Instance) carry
// their element slots inline after the prefix. Fixnum-typed slots (ids,
// counters, flag words) still read as tagged values, so a pointer sweep
// can visit every payload word of every object uniformly.

// ── Flag words ────────────────────────────────────────────────────────

/// Finalization state of a class, stored in [`Class::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FinalizationState {
    Unfinalized = 0,
    Prefinalized = 1,
    Finalized = 2,
}

impl FinalizationState {
    #[inline(always)]
    pub fn from_i64(raw: i64) -> Self {
        match raw {
            1 => FinalizationState::Prefinalized,
            2 => FinalizationState::Finalized,
            _ => FinalizationState::Unfinalized,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u64 {
        /// Enum class: canonical instances keyed by value name.
        const ENUM = 1 << 0;
        /// Patched-kind class. Identity compares this bit.
        const PATCH = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LibraryFlags: u64 {
        /// Platform library: never reloaded ("clean").
        const PLATFORM = 1 << 0;
        /// Debugger may stop in this library.
        const DEBUGGABLE = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u64 {
        const STATIC = 1 << 0;
        const CONST = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u64 {
        const STATIC = 1 << 0;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeFlags: u64 {
        const OPTIMIZED = 1 << 0;
        /// Stub code (e.g. the lazy-compile stub); owned by no function.
        const STUB = 1 << 1;
    }
}

#[inline(always)]
fn flags_from(slot: Value) -> u64 {
    // SAFETY: flag slots are always fixnums.
    unsafe { slot.to_i64() as u64 }
}

#[inline(always)]
fn fixnum_from(slot: Value) -> i64 {
    // SAFETY: the slot is always a fixnum.
    unsafe { slot.to_i64() }
}

// ── Class ─────────────────────────────────────────────────────────────

/// A class definition.
///
/// `functions`, `fields` and `constants` are growable arrays; `constants`
/// holds the canonical-constant set as (name symbol, instance) pairs.
/// The stored `id` mirrors the class-table slot the class occupies and is
/// updated when the table moves the class during compaction.
#[repr(C)]
pub struct Class {
    pub header: Header,
    pub name: Value,
    pub library: Value,
    pub script: Value,
    pub super_class: Value,
    pub functions: Value,
    pub fields: Value,
    pub constants: Value,
    pub allocation_stub: Value,
    pub state: Value,
    pub flags: Value,
    pub instance_size_words: Value,
    pub num_native_fields: Value,
    pub id: Value,
}

const _: () = assert!(size_of::<Class>() == 14 * 8);

impl Class {
    pub const SIZE_WORDS: usize = 14;

    #[inline(always)]
    pub fn name_sym(&self) -> Symbol {
        // SAFETY: name is always a symbol fixnum.
        unsafe { self.name.to_symbol() }
    }

    #[inline(always)]
    pub fn cid(&self) -> ClassId {
        fixnum_from(self.id) as ClassId
    }

    #[inline(always)]
    pub fn set_cid(&mut self, cid: ClassId) {
        self.id = Value::from_i64(cid as i64);
    }

    #[inline(always)]
    pub fn finalization(&self) -> FinalizationState {
        FinalizationState::from_i64(fixnum_from(self.state))
    }

    #[inline(always)]
    pub fn set_finalization(&mut self, state: FinalizationState) {
        self.state = Value::from_i64(state as i64);
    }

    #[inline(always)]
    pub fn is_finalized(&self) -> bool {
        self.finalization() == FinalizationState::Finalized
    }

    #[inline(always)]
    pub fn is_prefinalized(&self) -> bool {
        self.finalization() == FinalizationState::Prefinalized
    }

    #[inline(always)]
    pub fn class_flags(&self) -> ClassFlags {
        ClassFlags::from_bits_truncate(flags_from(self.flags))
    }

    #[inline(always)]
    pub fn is_enum(&self) -> bool {
        self.class_flags().contains(ClassFlags::ENUM)
    }

    #[inline(always)]
    pub fn is_patch(&self) -> bool {
        self.class_flags().contains(ClassFlags::PATCH)
    }

    #[inline(always)]
    pub fn instance_size(&self) -> usize {
        fixnum_from(self.instance_size_words) as usize
    }

    #[inline(always)]
    pub fn num_native_fields(&self) -> usize {
        fixnum_from(self.num_native_fields) as usize
    }
}

/// A synthesized owner keeping old functions and fields attached to their
/// original script after their class has been replaced.
#[repr(C)]
pub struct PatchClass {
    pub header: Header,
    pub patched_class: Value,
    pub script: Value,
}

const _: () = assert!(size_of::<PatchClass>() == 3 * 8);

impl PatchClass {
    pub const SIZE_WORDS: usize = 3;
}

// ── Library ───────────────────────────────────────────────────────────

/// A library: a URL, a position in the isolate's libraries list, and a
/// dictionary of named entries (classes, top-level functions and fields).
/// Top-level members hang off an implicit `toplevel_class`.
#[repr(C)]
pub struct Library {
    pub header: Header,
    pub url: Value,
    pub index: Value,
    pub flags: Value,
    pub dictionary: Value,
    pub toplevel_class: Value,
    pub imports: Value,
    pub exports: Value,
}

const _: () = assert!(size_of::<Library>() == 8 * 8);

impl Library {
    pub const SIZE_WORDS: usize = 8;

    #[inline(always)]
    pub fn url_sym(&self) -> Symbol {
        // SAFETY: url is always a symbol fixnum.
        unsafe { self.url.to_symbol() }
    }

    #[inline(always)]
    pub fn list_index(&self) -> i64 {
        fixnum_from(self.index)
    }

    #[inline(always)]
    pub fn set_list_index(&mut self, index: i64) {
        self.index = Value::from_i64(index);
    }

    #[inline(always)]
    pub fn library_flags(&self) -> LibraryFlags {
        LibraryFlags::from_bits_truncate(flags_from(self.flags))
    }

    #[inline(always)]
    pub fn set_library_flags(&mut self, flags: LibraryFlags) {
        self.flags = Value::from_i64(flags.bits() as i64);
    }

    /// Platform libraries are "clean": preserved, not reloaded.
    #[inline(always)]
    pub fn is_platform(&self) -> bool {
        self.library_flags().contains(LibraryFlags::PLATFORM)
    }

    #[inline(always)]
    pub fn is_debuggable(&self) -> bool {
        self.library_flags().contains(LibraryFlags::DEBUGGABLE)
    }

    #[inline(always)]
    pub fn set_debuggable(&mut self, debuggable: bool) {
        let mut flags = self.library_flags();
        flags.set(LibraryFlags::DEBUGGABLE, debuggable);
        self.set_library_flags(flags);
    }
}

// ── Field ─────────────────────────────────────────────────────────────

/// A field. Instance fields get their word offset assigned by class
/// finalization (`offset_words` stays NULL until then); static fields own
/// a value cell.
#[repr(C)]
pub struct Field {
    pub header: Header,
    pub name: Value,
    pub owner: Value,
    pub flags: Value,
    pub offset_words: Value,
    pub static_value: Value,
}

const _: () = assert!(size_of::<Field>() == 6 * 8);

impl Field {
    pub const SIZE_WORDS: usize = 6;

    #[inline(always)]
    pub fn name_sym(&self) -> Symbol {
        // SAFETY: name is always a symbol fixnum.
        unsafe { self.name.to_symbol() }
    }

    #[inline(always)]
    pub fn field_flags(&self) -> FieldFlags {
        FieldFlags::from_bits_truncate(flags_from(self.flags))
    }

    #[inline(always)]
    pub fn is_static(&self) -> bool {
        self.field_flags().contains(FieldFlags::STATIC)
    }

    #[inline(always)]
    pub fn has_offset(&self) -> bool {
        !self.offset_words.is_null()
    }

    #[inline(always)]
    pub fn offset(&self) -> usize {
        debug_assert!(self.has_offset());
        fixnum_from(self.offset_words) as usize
    }

    #[inline(always)]
    pub fn set_offset(&mut self, offset_words: usize) {
        self.offset_words = Value::from_i64(offset_words as i64);
    }
}

// ── Function ──────────────────────────────────────────────────────────

/// A function. `owner` is a [`Class`] or, after its class has been
/// replaced, a [`PatchClass`]. `code` is the current entry point (possibly
/// the lazy-compile stub), `unoptimized_code` the retained unoptimized
/// compilation, `ic_data_array` the deopt-id-indexed inline caches.
#[repr(C)]
pub struct Function {
    pub header: Header,
    pub name: Value,
    pub owner: Value,
    pub flags: Value,
    pub code: Value,
    pub unoptimized_code: Value,
    pub ic_data_array: Value,
    pub usage_counter: Value,
    pub deopt_counter: Value,
}

const _: () = assert!(size_of::<Function>() == 9 * 8);

impl Function {
    pub const SIZE_WORDS: usize = 9;

    #[inline(always)]
    pub fn name_sym(&self) -> Symbol {
        // SAFETY: name is always a symbol fixnum.
        unsafe { self.name.to_symbol() }
    }

    #[inline(always)]
    pub fn is_static(&self) -> bool {
        FunctionFlags::from_bits_truncate(flags_from(self.flags))
            .contains(FunctionFlags::STATIC)
    }

    #[inline(always)]
    pub fn zero_counters(&mut self) {
        self.usage_counter = Value::from_i64(0);
        self.deopt_counter = Value::from_i64(0);
    }
}

// ── Code ──────────────────────────────────────────────────────────────

/// Which kind of call site a PC descriptor records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcKind {
    IcCall,
    UnoptStaticCall,
}

/// Encode a PC descriptor entry as a fixnum payload.
#[inline(always)]
pub fn encode_descriptor(kind: PcKind, deopt_id: usize) -> i64 {
    ((deopt_id as i64) << 1)
        | match kind {
            PcKind::IcCall => 0,
            PcKind::UnoptStaticCall => 1,
        }
}

#[inline(always)]
pub fn decode_descriptor(raw: i64) -> (PcKind, usize) {
    let kind = if raw & 1 == 0 {
        PcKind::IcCall
    } else {
        PcKind::UnoptStaticCall
    };
    (kind, (raw >> 1) as usize)
}

/// A compilation of a function.
///
/// `object_pool` holds tagged references the code embeds; for optimized
/// code this includes the unoptimized code used to finish the activation
/// after deoptimization. `descriptors` is an array of fixnums encoding
/// (kind, deopt id) call-site records, `edge_counters` an array of fixnum
/// profile counters.
#[repr(C)]
pub struct Code {
    pub header: Header,
    pub function: Value,
    pub flags: Value,
    pub object_pool: Value,
    pub descriptors: Value,
    pub edge_counters: Value,
}

const _: () = assert!(size_of::<Code>() == 6 * 8);

impl Code {
    pub const SIZE_WORDS: usize = 6;

    #[inline(always)]
    pub fn code_flags(&self) -> CodeFlags {
        CodeFlags::from_bits_truncate(flags_from(self.flags))
    }

    #[inline(always)]
    pub fn is_optimized(&self) -> bool {
        self.code_flags().contains(CodeFlags::OPTIMIZED)
    }

    #[inline(always)]
    pub fn is_stub(&self) -> bool {
        self.code_flags().contains(CodeFlags::STUB)
    }
}

// ── ICData ────────────────────────────────────────────────────────────

/// A call-site inline cache: observed receiver classes mapped to selected
/// targets. `entries` is an array of check groups, each `arity` receiver
/// cid fixnums followed by the target function (static-call caches store
/// bare target groups with no cids).
#[repr(C)]
pub struct ICData {
    pub header: Header,
    pub target_name: Value,
    pub owner: Value,
    pub arity: Value,
    pub entries: Value,
}

const _: () = assert!(size_of::<ICData>() == 5 * 8);

impl ICData {
    pub const SIZE_WORDS: usize = 5;

    #[inline(always)]
    pub fn target_name_sym(&self) -> Symbol {
        // SAFETY: target_name is always a symbol fixnum.
        unsafe { self.target_name.to_symbol() }
    }

    #[inline(always)]
    pub fn num_args_tested(&self) -> usize {
        fixnum_from(self.arity) as usize
    }
}

/// Global fallback cache for call sites that exceeded IC polymorphism.
/// Reset wholesale on reload by dropping the whole table.
#[repr(C)]
pub struct MegamorphicCache {
    pub header: Header,
    pub target_name: Value,
    pub buckets: Value,
}

const _: () = assert!(size_of::<MegamorphicCache>() == 3 * 8);

impl MegamorphicCache {
    pub const SIZE_WORDS: usize = 3;
}

// ── Script ────────────────────────────────────────────────────────────

/// A source script. `version` distinguishes generations of the same URL
/// across reloads.
#[repr(C)]
pub struct Script {
    pub header: Header,
    pub url: Value,
    pub version: Value,
}

const _: () = assert!(size_of::<Script>() == 3 * 8);

impl Script {
    pub const SIZE_WORDS: usize = 3;

    #[inline(always)]
    pub fn version(&self) -> i64 {
        fixnum_from(self.version)
    }
}

// ── Arrays ────────────────────────────────────────────────────────────

/// A fixed-length array of tagged values. Elements follow the prefix
/// inline.
#[repr(C)]
pub struct Array {
    pub header: Header,
    pub length: Value,
}

const _: () = assert!(size_of::<Array>() == 2 * 8);

impl Array {
    pub const BASE_WORDS: usize = 2;

    #[inline(always)]
    pub const fn allocation_words(len: usize) -> usize {
        Self::BASE_WORDS + len
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        fixnum_from(self.length) as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    fn elements_ptr(&self) -> *const Value {
        // SAFETY: elements immediately follow the fixed prefix.
        unsafe { (self as *const Array).add(1) as *const Value }
    }

    /// # Safety
    ///
    /// The memory after this `Array` must contain `len` valid values.
    #[inline(always)]
    pub unsafe fn elements(&self) -> &[Value] {
        core::slice::from_raw_parts(self.elements_ptr(), self.len())
    }

    /// # Safety
    ///
    /// As [`Array::elements`], plus exclusive access.
    #[inline(always)]
    pub unsafe fn elements_mut(&mut self) -> &mut [Value] {
        core::slice::from_raw_parts_mut(self.elements_ptr() as *mut Value, self.len())
    }

    /// # Safety
    ///
    /// `index` must be `< len` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn at(&self, index: usize) -> Value {
        debug_assert!(index < self.len());
        *self.elements_ptr().add(index)
    }

    /// # Safety
    ///
    /// As [`Array::at`], plus exclusive access.
    #[inline(always)]
    pub unsafe fn set_at(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.len());
        *(self.elements_ptr() as *mut Value).add(index) = value;
    }
}

/// A growable array: a length and a backing [`Array`].
#[repr(C)]
pub struct GrowableArray {
    pub header: Header,
    pub length: Value,
    pub data: Value,
}

const _: () = assert!(size_of::<GrowableArray>() == 3 * 8);

impl GrowableArray {
    pub const SIZE_WORDS: usize = 3;

    #[inline(always)]
    pub fn len(&self) -> usize {
        fixnum_from(self.length) as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        self.length = Value::from_i64(len as i64);
    }
}

/// A canonical tuple of type elements (class references or NULL). Its
/// hash mixes the current cids of the referenced classes, which is why the
/// canonical table keyed by it must be rehashed after a reload.
#[repr(C)]
pub struct TypeArguments {
    pub header: Header,
    pub length: Value,
}

const _: () = assert!(size_of::<TypeArguments>() == 2 * 8);

impl TypeArguments {
    pub const BASE_WORDS: usize = 2;

    #[inline(always)]
    pub const fn allocation_words(len: usize) -> usize {
        Self::BASE_WORDS + len
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        fixnum_from(self.length) as usize
    }

    #[inline(always)]
    fn types_ptr(&self) -> *const Value {
        // SAFETY: elements immediately follow the fixed prefix.
        unsafe { (self as *const TypeArguments).add(1) as *const Value }
    }

    /// # Safety
    ///
    /// The memory after this `TypeArguments` must contain `len` valid
    /// values.
    #[inline(always)]
    pub unsafe fn types(&self) -> &[Value] {
        core::slice::from_raw_parts(self.types_ptr(), self.len())
    }

    /// # Safety
    ///
    /// As [`TypeArguments::types`].
    #[inline(always)]
    pub unsafe fn type_at(&self, index: usize) -> Value {
        debug_assert!(index < self.len());
        *self.types_ptr().add(index)
    }

    /// # Safety
    ///
    /// As [`TypeArguments::types`], plus exclusive access.
    #[inline(always)]
    pub unsafe fn set_type_at(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.len());
        *(self.types_ptr() as *mut Value).add(index) = value;
    }
}

// ── Instance ──────────────────────────────────────────────────────────

/// An ordinary program-class instance: a header followed by field slots at
/// the word offsets assigned by class finalization (offset 0 is the header
/// itself; fields start at offset 1).
#[repr(C)]
pub struct Instance {
    pub header: Header,
}

const _: () = assert!(size_of::<Instance>() == 8);

impl Instance {
    pub const BASE_WORDS: usize = 1;

    #[inline(always)]
    pub fn cid(&self) -> ClassId {
        self.header.cid()
    }

    /// # Safety
    ///
    /// `offset_words` must be a field offset valid for this instance's
    /// class layout.
    #[inline(always)]
    pub unsafe fn field_at(&self, offset_words: usize) -> Value {
        debug_assert!(offset_words >= 1 && offset_words < self.header.size_words());
        *(self as *const Instance as *const Value).add(offset_words)
    }

    /// # Safety
    ///
    /// As [`Instance::field_at`], plus exclusive access.
    #[inline(always)]
    pub unsafe fn set_field_at(&mut self, offset_words: usize, value: Value) {
        debug_assert!(offset_words >= 1 && offset_words < self.header.size_words());
        *(self as *mut Instance as *mut Value).add(offset_words) = value;
    }
}

/// Dead storage: a free-list element, or a forwarding corpse whose `next`
/// holds the forwarding target after a become sweep.
#[repr(C)]
pub struct FreeListElement {
    pub header: Header,
    pub next: Value,
}

const _: () = assert!(size_of::<FreeListElement>() == 2 * 8);

impl FreeListElement {
    pub const SIZE_WORDS: usize = 2;
}
