//! Layout constants shared by the arena, the indexes and the fence translator.

/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_SHIFT: u32 = 12;

/// Granule in which the arena grows and in which divided blocks are carved.
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;

/// Alignment of every user pointer that is not block aligned.
pub const ALLOCATION_ALIGNMENT: usize = 16;

/// Width of the fence below the user region. Equal to the allocation
/// alignment so that fenced user pointers stay aligned.
pub const FENCE_BOTTOM_SIZE: usize = ALLOCATION_ALIGNMENT;

/// Width of the fence above the user region.
pub const FENCE_TOP_SIZE: usize = 8;

pub const FENCE_OVERHEAD_SIZE: usize = FENCE_BOTTOM_SIZE + FENCE_TOP_SIZE;

/// Word repeated across the bottom fence.
pub const FENCE_MAGIC_BOTTOM: u32 = 0xC0C0_AB1B;

/// Word repeated across the top fence.
pub const FENCE_MAGIC_TOP: u32 = 0xFACA_DE69;

/// Smallest user payload a divided block is sized for.
pub const DEFAULT_SMALLEST_ALLOCATION: usize = 16;

/// Smallest divided block; every size class is a power of two at least this.
pub const CHUNK_SMALLEST_BLOCK: usize = FENCE_BOTTOM_SIZE + DEFAULT_SMALLEST_ALLOCATION;

/// Number of forward-link rows in each skip list.
pub const MAX_SKIP_LEVEL: usize = 32;

/// Entry block header, first word.
pub const ENTRY_BLOCK_MAGIC1: u32 = 0xEBEB_1111;
/// Entry block header, last word.
pub const ENTRY_BLOCK_MAGIC2: u32 = 0xEBEB_2222;
/// Written in the final word of every entry block.
pub const ENTRY_BLOCK_MAGIC3: u32 = 0xEBEB_3333;

/// Largest number of arena blocks a single allocation may span.
pub const LARGEST_BLOCK_COUNT: usize = 1 << 18;

/// Largest user size accepted by `allocate`.
pub const LARGEST_ALLOCATION: usize = LARGEST_BLOCK_COUNT * BLOCK_SIZE;

/// Fill byte for fresh allocations when alloc-blank or check-blank is on.
pub const ALLOC_BLANK_CHAR: u8 = 0xDA;

/// Fill byte for released memory when free-blank or check-blank is on.
pub const FREE_BLANK_CHAR: u8 = 0xDF;

/// Call sites with a larger line number are treated as corrupt metadata.
pub const MAX_LINE_NUMBER: u32 = 30_000;
pub const MIN_FILE_LENGTH: usize = 3;
pub const MAX_FILE_LENGTH: usize = 256;

/// Bytes shown around a damaged fence in error reports.
pub const DUMP_SPACE: usize = 20;

/// Slot records are laid out on this granule; slot handles count in it.
pub const SLOT_GRANULE: usize = 8;

/// Largest arena span addressable by a slot handle.
pub const MAX_ARENA_SPAN: usize = (u32::MAX as usize) * SLOT_GRANULE;

/// Number of power-of-two size classes below one block.
pub const SIZE_CLASS_COUNT: usize = BLOCK_SHIFT as usize;
