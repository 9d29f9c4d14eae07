use object::{Class, ClassId, Value, FIRST_PROGRAM_CID};

/// The cid → class mapping.
///
/// Slots below [`FIRST_PROGRAM_CID`] are reserved for runtime-internal
/// layouts and stay empty; program classes occupy the dense suffix. A
/// class present before and after a reload keeps its cid; new classes are
/// appended and compacted downward when replaced slots die.
pub struct ClassTable {
    entries: Vec<Value>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self {
            entries: vec![Value::NULL; FIRST_PROGRAM_CID as usize],
        }
    }

    #[inline(always)]
    pub fn num_cids(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn at(&self, cid: usize) -> Value {
        self.entries[cid]
    }

    #[inline(always)]
    pub fn has_valid_at(&self, cid: usize) -> bool {
        cid < self.entries.len() && self.entries[cid].is_ref()
    }

    /// Append a class, handing it the next free cid.
    pub fn register(&mut self, cls: Value) -> ClassId {
        let cid = self.entries.len() as ClassId;
        self.entries.push(cls);
        // SAFETY: cls references a valid Class.
        unsafe { cls.as_mut::<Class>().set_cid(cid) };
        cid
    }

    /// Overwrite a slot directly. Rollback restores saved entries with
    /// this.
    pub fn set_at(&mut self, cid: usize, value: Value) {
        self.entries[cid] = value;
    }

    /// Install `new` in `old`'s slot; `new` adopts the stable cid. The
    /// slot `new` occupied until now is left to compaction.
    pub fn replace(&mut self, old: Value, new: Value) {
        // SAFETY: both reference valid Classes.
        let cid = unsafe { old.as_ref::<Class>() }.cid();
        debug_assert!(self.has_valid_at(cid as usize));
        self.entries[cid as usize] = new;
        unsafe { new.as_mut::<Class>().set_cid(cid) };
    }

    /// Move the class at `src` down into the dead slot `dst`, updating its
    /// stored cid.
    pub fn move_class(&mut self, dst: usize, src: usize) {
        debug_assert!(dst < src);
        let cls = self.entries[src];
        self.entries[dst] = cls;
        // SAFETY: cls references a valid Class.
        unsafe { cls.as_mut::<Class>().set_cid(dst as ClassId) };
    }

    /// Shrink the table to `top` entries.
    pub fn drop_above(&mut self, top: usize) {
        debug_assert!(top >= FIRST_PROGRAM_CID as usize);
        self.entries.truncate(top);
    }

    pub fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in &mut self.entries {
            visitor(entry);
        }
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}
