use crate::cids::CID_FREE_LIST;
use crate::header::header_at;
use crate::Value;

/// Call `visitor` for every payload slot of the object at `obj`.
///
/// Every layout in this runtime stores only tagged [`Value`] words behind
/// its header, so edge enumeration is a uniform walk over the payload;
/// the visitor itself skips fixnums and slot sentinels. Free-list elements
/// and forwarding corpses expose no edges — their payload is a raw next
/// pointer, not a slot.
///
/// # Safety
///
/// `obj` must point to a valid heap object, and no other references to its
/// payload may exist for the duration of the call.
pub unsafe fn visit_edges(obj: *mut u64, visitor: &mut dyn FnMut(&mut Value)) {
    let header = header_at(obj);
    if header.cid() == CID_FREE_LIST {
        return;
    }
    let size = header.size_words();
    debug_assert!(size >= 2);
    for i in 1..size {
        visitor(&mut *(obj.add(i) as *mut Value));
    }
}
