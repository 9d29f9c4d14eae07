//! In-place, atomic hot reload for a managed-runtime isolate.
//!
//! Given a new program image for a running isolate's libraries, the engine
//! replaces class and library definitions, migrates live instances so they
//! answer as instances of the new definitions, preserves static state,
//! invalidates every compiled-code and inline-cache structure that could
//! carry stale dispatch, and either commits the new world transactionally
//! or rolls back to the pre-reload state.

mod builder;
mod canonical;
mod class_table;
mod compiler;
mod context;
mod error;
mod events;
mod finalize;
mod flags;
mod forward;
mod invalidate;
mod isolate;
mod lookup;
mod reconcile;
mod safepoint;
mod symbols;

pub use canonical::{
    canonicalize_type_arguments, hash_type_arguments,
    rehash_canonical_type_arguments, type_arguments_equal,
};
pub use class_table::ClassTable;
pub use compiler::{
    deoptimize_frames, ensure_unoptimized_code,
    switch_to_lazy_compiled_unoptimized, unoptimized_code_for,
    BackgroundCompiler,
};
pub use context::{Loader, ReloadContext};
pub use error::ReloadError;
pub use events::{EventSink, NullSink, RecordingSink, ReloadEvent};
pub use finalize::{ensure_finalized, offset_field_map};
pub use flags::ReloadFlags;
pub use forward::forward_identity;
pub use isolate::{Frame, Handle, Isolate, ObjectStore};
pub use lookup::{
    class_of, is_subclass_of, library_lookup, lookup_instance_field,
    lookup_static_field, owner_class, owner_library, resolve_dynamic,
    resolve_static,
};
pub use reconcile::{
    constants_find, constants_insert, ic_add_check, ic_cached_cids,
    ic_clear_entries, ic_data_reset,
};
pub use safepoint::{
    HeapIterationScope, NoSafepointScope, SafepointOperationScope,
    SafepointState,
};
pub use symbols::{SymbolTable, WellKnownSymbols};
