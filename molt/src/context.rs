//! The reload context and controller.
//!
//! One reload is one context: created at StartReload, single-use,
//! destroyed at PostCommit or after rollback. The controller drives
//! StartReload → Checkpoint → (loader) → FinishReload → validate →
//! Commit/Rollback → PostCommit, and owns the error channel — exactly one
//! service event leaves a terminal transition.

use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use object::{Class, Library, Symbol, Value};

use crate::canonical::rehash_canonical_type_arguments;
use crate::compiler::switch_stack_to_unoptimized;
use crate::error::ReloadError;
use crate::events::ReloadEvent;
use crate::forward::forward_identity;
use crate::invalidate::invalidate_world;
use crate::isolate::Isolate;
use crate::reconcile::{
    can_reload, copy_canonical_constants, copy_static_field_values,
    disable_allocation_stub, patch_fields_and_functions, replace_enum,
};

/// Produces the new program image for a reload: classes appended to the
/// class table, libraries appended to the isolate's libraries list, the
/// root library re-installed.
pub trait Loader {
    fn load(
        &mut self,
        isolate: &mut Isolate,
        root_library_url: Symbol,
    ) -> Result<(), ReloadError>;
}

impl<F> Loader for F
where
    F: FnMut(&mut Isolate, Symbol) -> Result<(), ReloadError>,
{
    fn load(
        &mut self,
        isolate: &mut Isolate,
        root_library_url: Symbol,
    ) -> Result<(), ReloadError> {
        self(isolate, root_library_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadPhase {
    Checkpointed,
    Validating,
    Committing,
    RollingBack,
}

/// Reload identity of a class: name, owning library URL, patch kind.
/// Names alone would collide across synthetic classes; URLs are unique
/// per isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClassKey {
    name: Symbol,
    library_url: Option<Symbol>,
    is_patch: bool,
}

fn class_key(cls: Value) -> ClassKey {
    // SAFETY: cls references a valid Class.
    let (name, library, is_patch) = unsafe {
        let c = cls.as_ref::<Class>();
        (c.name_sym(), c.library, c.is_patch())
    };
    let library_url = if library.is_ref() {
        // SAFETY: library references a valid Library.
        Some(unsafe { library.as_ref::<Library>() }.url_sym())
    } else {
        None
    };
    ClassKey {
        name,
        library_url,
        is_patch,
    }
}

struct LibraryInfo {
    dirty: bool,
}

/// Per-reload state: the checkpoint image, the identity sets and mapping
/// tables, the dead-cid scratch array, and the error channel.
pub struct ReloadContext {
    phase: ReloadPhase,
    has_error: bool,
    error: Option<ReloadError>,
    saved_num_cids: usize,
    saved_class_table: Vec<Value>,
    num_saved_libs: usize,
    saved_root_library: Value,
    saved_libraries: Value,
    old_classes: FxHashMap<ClassKey, Value>,
    old_libraries: FxHashMap<Symbol, Value>,
    class_map: Vec<(Value, Value)>,
    class_map_keys: FxHashSet<ClassKey>,
    library_map: Vec<(Value, Value)>,
    library_map_keys: FxHashSet<Symbol>,
    become_map: Vec<(Value, Value)>,
    become_keys: FxHashSet<u64>,
    dead_classes: Vec<bool>,
    library_infos: Vec<LibraryInfo>,
}

impl ReloadContext {
    fn new() -> Self {
        Self {
            phase: ReloadPhase::Checkpointed,
            has_error: false,
            error: None,
            saved_num_cids: 0,
            saved_class_table: Vec::new(),
            num_saved_libs: 0,
            saved_root_library: Value::NULL,
            saved_libraries: Value::NULL,
            old_classes: FxHashMap::default(),
            old_libraries: FxHashMap::default(),
            class_map: Vec::new(),
            class_map_keys: FxHashSet::default(),
            library_map: Vec::new(),
            library_map_keys: FxHashSet::default(),
            become_map: Vec::new(),
            become_keys: FxHashSet::default(),
            dead_classes: Vec::new(),
            library_infos: Vec::new(),
        }
    }

    /// Record the first error, emit the error event, keep later errors as
    /// log noise only.
    pub(crate) fn report_error(&mut self, isolate: &mut Isolate, error: ReloadError) {
        if self.has_error {
            debug!("reload: suppressed follow-up error: {error}");
            return;
        }
        self.has_error = true;
        if isolate.flags.trace_reload {
            debug!("reload: error: {error}");
        }
        isolate
            .event_sink
            .reload_event(ReloadEvent::error(error.to_string()));
        self.error = Some(error);
    }

    /// The context's raw pointers are roots while it is alive.
    pub(crate) fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.saved_root_library);
        visitor(&mut self.saved_libraries);
        for entry in &mut self.saved_class_table {
            visitor(entry);
        }
    }

    // ── Checkpoint ────────────────────────────────────────────────────

    fn checkpoint(&mut self, isolate: &mut Isolate) {
        self.checkpoint_classes(isolate);
        self.checkpoint_libraries(isolate);
        // The constants cache is keyed by source positions and may refer
        // to old classes.
        isolate.store.compile_time_constants = Value::NULL;
    }

    fn checkpoint_classes(&mut self, isolate: &mut Isolate) {
        self.saved_num_cids = isolate.class_table.num_cids();
        self.saved_class_table = (0..self.saved_num_cids)
            .map(|cid| isolate.class_table.at(cid))
            .collect();
        for cid in 0..self.saved_num_cids {
            if !isolate.class_table.has_valid_at(cid) {
                continue;
            }
            let cls = isolate.class_table.at(cid);
            let fresh = self.old_classes.insert(class_key(cls), cls).is_none();
            assert!(fresh, "two old classes share a reload identity");
        }
        if isolate.flags.trace_reload {
            debug!("reload: system had {} classes", self.saved_num_cids);
        }
    }

    fn checkpoint_libraries(&mut self, isolate: &mut Isolate) {
        self.saved_root_library = isolate.store.root_library;
        self.saved_libraries = isolate.store.libraries;

        // Keep "clean" platform libraries instead of reloading them;
        // renumber them into a filtered list and orphan the rest.
        let filtered = isolate.new_growable();
        self.num_saved_libs = 0;
        for lib in isolate.growable_snapshot(self.saved_libraries) {
            // SAFETY: the libraries list holds valid Libraries.
            let is_platform = unsafe { lib.as_ref::<Library>() }.is_platform();
            if is_platform {
                let index = isolate.growable_len(filtered) as i64;
                // SAFETY: exclusive mutator access.
                unsafe { lib.as_mut::<Library>().set_list_index(index) };
                isolate.growable_push(filtered, lib);
                self.num_saved_libs += 1;
            } else {
                // SAFETY: exclusive mutator access.
                unsafe { lib.as_mut::<Library>().set_list_index(-1) };
            }
            // SAFETY: the libraries list holds valid Libraries.
            let url = unsafe { lib.as_ref::<Library>() }.url_sym();
            let fresh = self.old_libraries.insert(url, lib).is_none();
            assert!(fresh, "two old libraries share a URL");
        }
        isolate.store.libraries = filtered;
        isolate.store.root_library = Value::NULL;
    }

    // ── Rollback ──────────────────────────────────────────────────────

    fn rollback(&mut self, isolate: &mut Isolate) {
        debug_assert_eq!(self.phase, ReloadPhase::RollingBack);
        if isolate.flags.trace_reload {
            debug!("reload: rolling back");
        }
        self.rollback_classes(isolate);
        self.rollback_libraries(isolate);
    }

    fn rollback_classes(&mut self, isolate: &mut Isolate) {
        assert!(self.saved_num_cids > 0);
        isolate.class_table.drop_above(self.saved_num_cids);
        for cid in 0..self.saved_num_cids {
            isolate.class_table.set_at(cid, self.saved_class_table[cid]);
        }
    }

    fn rollback_libraries(&mut self, isolate: &mut Isolate) {
        if self.saved_libraries.is_ref() {
            isolate.store.libraries = self.saved_libraries;
            for (i, lib) in isolate
                .growable_snapshot(self.saved_libraries)
                .into_iter()
                .enumerate()
            {
                // Restore the indices CheckpointLibraries overwrote.
                // SAFETY: the libraries list holds valid Libraries.
                unsafe { lib.as_mut::<Library>().set_list_index(i as i64) };
            }
        }
        isolate.store.root_library = self.saved_root_library;
        self.saved_root_library = Value::NULL;
        self.saved_libraries = Value::NULL;
    }

    // ── Mapping tables ────────────────────────────────────────────────

    fn build_class_mapping(&mut self, isolate: &Isolate) {
        for cid in self.saved_num_cids..isolate.class_table.num_cids() {
            if !isolate.class_table.has_valid_at(cid) {
                continue;
            }
            let replacement_or_new = isolate.class_table.at(cid);
            match self.old_classes.get(&class_key(replacement_or_new)).copied() {
                Some(old) => self.add_class_mapping(replacement_or_new, old),
                None => {
                    if isolate.flags.identity_reload {
                        panic!("identity reload: no replacement class found");
                    }
                    self.add_class_mapping(replacement_or_new, replacement_or_new);
                }
            }
        }
    }

    fn build_library_mapping(&mut self, isolate: &Isolate) {
        for lib in isolate.growable_snapshot(isolate.store.libraries) {
            // SAFETY: the libraries list holds valid Libraries.
            let (is_platform, url) = unsafe {
                let l = lib.as_ref::<Library>();
                (l.is_platform(), l.url_sym())
            };
            if is_platform {
                continue;
            }
            match self.old_libraries.get(&url).copied() {
                Some(old) => {
                    self.add_library_mapping(lib, old);
                    // Library identity must transfer to the replacement.
                    self.add_become_mapping(old, lib);
                }
                None => self.add_library_mapping(lib, lib),
            }
        }
    }

    fn add_class_mapping(&mut self, replacement_or_new: Value, original: Value) {
        let fresh = self.class_map_keys.insert(class_key(replacement_or_new));
        assert!(fresh, "class mapped twice; identity predicates are broken");
        self.class_map.push((replacement_or_new, original));
    }

    fn add_library_mapping(&mut self, replacement_or_new: Value, original: Value) {
        // SAFETY: replacement references a valid Library.
        let url = unsafe { replacement_or_new.as_ref::<Library>() }.url_sym();
        let fresh = self.library_map_keys.insert(url);
        assert!(fresh, "library mapped twice; identity predicates are broken");
        self.library_map.push((replacement_or_new, original));
    }

    pub(crate) fn add_become_mapping(&mut self, old: Value, new: Value) {
        let fresh = self.become_keys.insert(old.raw());
        assert!(fresh, "object forwarded twice; identity predicates are broken");
        self.become_map.push((old, new));
    }

    // ── Validation ────────────────────────────────────────────────────

    fn validate_reload(&mut self, isolate: &mut Isolate) -> bool {
        debug_assert_eq!(self.phase, ReloadPhase::Validating);
        if self.has_error {
            return false;
        }
        for i in 0..self.class_map.len() {
            let (new, old) = self.class_map[i];
            if new.raw() != old.raw() && !can_reload(isolate, self, old, new) {
                return false;
            }
        }
        true
    }

    // ── Commit ────────────────────────────────────────────────────────

    fn commit(&mut self, isolate: &mut Isolate) {
        debug_assert_eq!(self.phase, ReloadPhase::Committing);
        #[cfg(debug_assertions)]
        self.verify_maps();

        // Step 1: per-class reconciliation.
        for i in 0..self.class_map.len() {
            let (new, old) = self.class_map[i];
            if new.raw() == old.raw() {
                continue;
            }
            // SAFETY: both reference valid Classes.
            let (new_enum, old_enum, new_finalized) = unsafe {
                (
                    new.as_ref::<Class>().is_enum(),
                    old.as_ref::<Class>().is_enum(),
                    new.as_ref::<Class>().is_finalized(),
                )
            };
            assert_eq!(new_enum, old_enum, "enum kind changed across reload");
            if new_enum && new_finalized {
                replace_enum(isolate, self, new, old);
            }
            copy_static_field_values(isolate, self, new, old);
            if !new_enum {
                // Enum canonical sets were just reconciled in place.
                copy_canonical_constants(new, old);
            }
            patch_fields_and_functions(isolate, old);
            disable_allocation_stub(old);
        }

        // Step 2: class-table swap and compaction. Preserved classes keep
        // their cid (heap headers still say it); the new-class suffix is
        // compacted dense.
        self.dead_classes = vec![false; isolate.class_table.num_cids()];
        for i in 0..self.class_map.len() {
            let (new, old) = self.class_map[i];
            if new.raw() == old.raw() {
                continue;
            }
            // SAFETY: new references a valid Class.
            let vacated = unsafe { new.as_ref::<Class>() }.cid() as usize;
            debug_assert!(!self.dead_classes[vacated]);
            self.dead_classes[vacated] = true;
            if isolate.flags.trace_reload {
                // SAFETY: old references a valid Class.
                let old_cid = unsafe { old.as_ref::<Class>() }.cid();
                debug!("reload: replacing cid {old_cid} (slot {vacated} dies)");
            }
            isolate.class_table.replace(old, new);
            self.add_become_mapping(old, new);
        }
        self.compact_class_table(isolate);

        // Step 3: library bits and index assignment.
        for i in 0..self.library_map.len() {
            let (new, old) = self.library_map[i];
            if new.raw() == old.raw() {
                continue;
            }
            // SAFETY: both reference valid Libraries.
            unsafe {
                let debuggable = old.as_ref::<Library>().is_debuggable();
                new.as_mut::<Library>().set_debuggable(debuggable);
            }
        }
        let libs = isolate.growable_snapshot(isolate.store.libraries);
        for (i, lib) in libs.iter().enumerate() {
            // SAFETY: the libraries list holds valid Libraries.
            unsafe { lib.as_mut::<Library>().set_list_index(i as i64) };
        }
        self.library_infos = (0..libs.len())
            .map(|i| LibraryInfo {
                dirty: i >= self.num_saved_libs,
            })
            .collect();

        // Forward identity of everything that was replaced.
        let (mut before, after): (Vec<Value>, Vec<Value>) =
            self.become_map.iter().copied().unzip();
        if isolate.flags.trace_reload {
            debug!("reload: forwarding {} identities", before.len());
        }
        forward_identity(isolate, Some(&mut *self), &mut before, &after);

        if isolate.flags.identity_reload {
            if self.saved_num_cids != isolate.class_table.num_cids() {
                warn!(
                    "identity reload changed class count: {} -> {}",
                    self.saved_num_cids,
                    isolate.class_table.num_cids()
                );
            }
            let saved_lib_count = isolate.growable_len(self.saved_libraries);
            let lib_count = isolate.growable_len(isolate.store.libraries);
            if saved_lib_count != lib_count {
                warn!(
                    "identity reload changed library count: {saved_lib_count} -> {lib_count}"
                );
            }
        }

        // The canonical tuples were hashed under the old class ids, and
        // forwarding can have produced equal-but-distinct tuples.
        rehash_canonical_type_arguments(isolate);
    }

    fn compact_class_table(&mut self, isolate: &mut Isolate) {
        let top = isolate.class_table.num_cids();
        let mut new_top = self.saved_num_cids;
        for free_index in self.saved_num_cids..top {
            // Scan forward until we find a dead slot.
            if !self.dead_classes[free_index] {
                new_top += 1;
                continue;
            }
            for cls_index in (free_index + 1)..top {
                // Scan forward until we find a live class to pull down.
                if self.dead_classes[cls_index] {
                    continue;
                }
                isolate.class_table.move_class(free_index, cls_index);
                self.dead_classes[cls_index] = true;
                new_top += 1;
                break;
            }
        }
        isolate.class_table.drop_above(new_top);
        if isolate.flags.trace_reload {
            debug!("reload: system has {new_top} classes");
        }
    }

    fn post_commit(&mut self, isolate: &mut Isolate) {
        self.saved_root_library = Value::NULL;
        self.saved_libraries = Value::NULL;
        #[cfg(debug_assertions)]
        self.verify_instance_classes(isolate);
        invalidate_world(isolate, self);
        isolate.event_sink.reload_event(ReloadEvent::success());
        if isolate.flags.trace_reload {
            debug!("reload: committed");
        }
    }

    /// Dirty iff the library was reloaded or newly added (its functions
    /// must be recompiled from scratch). Deleted libraries count as dirty.
    pub(crate) fn is_dirty(&self, lib: Value) -> bool {
        if !lib.is_ref() {
            return true;
        }
        // SAFETY: lib references a valid Library.
        let index = unsafe { lib.as_ref::<Library>() }.list_index();
        if index < 0 {
            return true;
        }
        self.library_infos
            .get(index as usize)
            .map_or(true, |info| info.dirty)
    }

    // ── Debug verification ────────────────────────────────────────────

    /// Two distinct old classes must never map to the same new class.
    #[cfg(debug_assertions)]
    fn verify_maps(&self) {
        let mut seen: FxHashMap<u64, u64> = FxHashMap::default();
        for &(new, old) in &self.class_map {
            if let Some(&other_old) = seen.get(&new.raw()) {
                assert_eq!(
                    other_old,
                    old.raw(),
                    "distinct classes both map to one replacement"
                );
            }
            seen.insert(new.raw(), old.raw());
        }
    }

    /// After the swap, compaction and become, no live object may carry a
    /// cid from the reclaimed range.
    #[cfg(debug_assertions)]
    fn verify_instance_classes(&self, isolate: &Isolate) {
        isolate.heap.visit_objects(&mut |obj| {
            // SAFETY: the heap walk yields valid object headers.
            let header = unsafe { object::header_at(obj) };
            let cid = header.cid();
            if cid == object::CID_FREE_LIST || object::is_internal_cid(cid) {
                return;
            }
            assert!(
                isolate.class_table.has_valid_at(cid as usize),
                "live object carries a dead class id"
            );
        });
    }
}

// ── Controller ────────────────────────────────────────────────────────

impl Isolate {
    /// Full reload: StartReload with `loader`, then FinishReload.
    pub fn reload(&mut self, loader: &mut dyn Loader) -> Result<(), ReloadError> {
        self.start_reload(loader)?;
        self.finish_reload()
    }

    /// Switch the stack to unoptimized code, checkpoint, and run the
    /// loader. A loader failure is recorded in the context; the reload
    /// stays checkpointed until [`Isolate::finish_reload`] rolls it back.
    pub fn start_reload(&mut self, loader: &mut dyn Loader) -> Result<(), ReloadError> {
        if self.reload_context.is_some() {
            return Err(ReloadError::ReloadInProgress);
        }
        let root_lib = self.store.root_library;
        if !root_lib.is_ref() {
            return Err(ReloadError::NoRootLibrary);
        }
        // SAFETY: the root library is a valid Library.
        let root_url = unsafe { root_lib.as_ref::<Library>() }.url_sym();

        if self.flags.trace_reload {
            debug!(
                "reload: start, root library '{}'",
                self.symbols.name(root_url)
            );
        }

        switch_stack_to_unoptimized(self);

        let mut context = Box::new(ReloadContext::new());
        context.checkpoint(self);
        self.reload_context = Some(context);

        // Block class finalization attempts while control is out in the
        // loader.
        self.block_class_finalization();
        let result = loader.load(self, root_url);
        self.unblock_class_finalization();

        if let Err(error) = result {
            let mut context = self.reload_context.take().expect("context alive");
            context.report_error(self, error);
            self.reload_context = Some(context);
        }
        Ok(())
    }

    /// Build the mapping tables, validate every replacement pair, and
    /// either commit the new world or roll back to the checkpoint.
    pub fn finish_reload(&mut self) -> Result<(), ReloadError> {
        let mut context = self
            .reload_context
            .take()
            .expect("finish_reload without start_reload");

        // No optimized code may materialize while the world is swapped.
        self.background_compiler.disable();

        context.phase = ReloadPhase::Validating;
        context.build_class_mapping(self);
        context.build_library_mapping(self);

        let result = if context.validate_reload(self) {
            context.phase = ReloadPhase::Committing;
            context.commit(self);
            context.post_commit(self);
            Ok(())
        } else {
            context.phase = ReloadPhase::RollingBack;
            context.rollback(self);
            Err(context
                .error
                .take()
                .unwrap_or_else(|| ReloadError::Load("reload failed".into())))
        };

        self.background_compiler.enable();
        // Dropping the context destroys it; the isolate is Idle again.
        result
    }

    /// Record `error`, roll back, and destroy the context.
    pub fn abort_reload(&mut self, error: ReloadError) {
        let Some(mut context) = self.reload_context.take() else {
            return;
        };
        context.report_error(self, error);
        context.phase = ReloadPhase::RollingBack;
        context.rollback(self);
    }
}
