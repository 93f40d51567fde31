//! # fencepost-core
//!
//! Debugging chunk allocator over a growable arena.
//!
//! The heap hands out blocks carved from fixed-size arena blocks. Small
//! requests share power-of-two divided blocks, larger ones take whole blocks.
//! Every block is described by a slot record threaded through two skip
//! lists: one ordered by address for used blocks, one by size for free ones.
//! Optional fence posts around each user region catch overruns and
//! underruns; optional blank fills catch use of uninitialized or freed
//! memory.
//!
//! ```text
//! ChunkHeap -> Blocks (size classes) -> SkipIndex x2 -> SlotStore -> ArenaSource
//!                     \-> fence (PointerInfo)    EntryAllocator -/
//! ```
//!
//! The crate allocates nothing from the global allocator while serving a
//! request, so the C ABI layer can sit underneath `malloc` itself.

pub mod arena;
pub mod block;
pub mod constants;
mod entry;
pub mod error;
pub mod events;
pub mod fence;
pub mod flags;
pub mod heap;
pub mod options;
mod skiplist;
pub mod slot;
pub mod stats;

pub use arena::{ArenaSource, ExternSpan, Grant, ReservedArena};
pub use error::{ChunkError, Corruption, ErrorCode, FenceSide, c_strerror, strerror};
pub use events::{EventSink, NullSink};
pub use fence::{ByteDump, PointerInfo};
pub use flags::{DebugFlags, TAGS, TOKENS, Tag, Token, tag_flags, token_flag};
pub use heap::{AllocationInfo, ChunkHeap, FreeBlock, HeapConfig};
pub use options::{AddressBreak, Options, OptionsError, TokenStyle};
pub use slot::CallSite;
pub use stats::{CallCounts, HeapStats};
