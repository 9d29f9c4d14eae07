mod heap;

pub use heap::{Heap, HeapSettings, RootProvider};
