mod cids;
mod edges;
mod header;
mod objects;
mod value;

pub use cids::{
    is_internal_cid, ClassId, CID_ARRAY, CID_CLASS, CID_CODE, CID_FIELD,
    CID_FREE_LIST, CID_FUNCTION, CID_GROWABLE_ARRAY, CID_IC_DATA,
    CID_ILLEGAL, CID_LIBRARY, CID_MEGAMORPHIC_CACHE, CID_PATCH_CLASS,
    CID_SCRIPT, CID_TYPE_ARGUMENTS, FIRST_PROGRAM_CID,
};
pub use edges::visit_edges;
pub use header::{
    forward_to, forwarding_target, header_at, is_forwarding_ref,
    set_header_cid, Header,
};
pub use objects::{
    decode_descriptor, encode_descriptor, Array, Class, ClassFlags, Code,
    CodeFlags, Field, FieldFlags, FinalizationState, FreeListElement,
    Function, FunctionFlags, GrowableArray, ICData, Instance, Library,
    LibraryFlags, MegamorphicCache, PatchClass, PcKind, Script,
    TypeArguments,
};
pub use value::{Symbol, Value};
