//! Compile-time tuning constants.

/// Default frame capacity of a [`Dispatcher`](crate::Dispatcher).
///
/// Each delegation pushes one frame, so this bounds how deep a chain of
/// delegating handler sets can go. Non-delegated nesting costs no frames.
/// The bound exists because unbounded recursion on attacker-controlled
/// input is a denial-of-service risk; decoders that need more can
/// instantiate `Dispatcher<N>` with an explicit capacity.
pub const MAX_NESTING: usize = 64;

/// Growth increment used by
/// [`ByteSource::get_full_str`](crate::ByteSource::get_full_str) once the
/// aliasing fast path is exhausted.
///
/// Larger chunks mean fewer `read` calls on the source; smaller chunks mean
/// less overallocation for short tails. 4K matches a page and the common
/// pipe buffer granularity.
pub const READ_CHUNK: usize = 4096;

/// Suggested `max_depth` for [`freeze`](crate::freeze) callers without a
/// better bound.
///
/// Definition graphs produced by real descriptor sets nest far shallower
/// than this; the bound only has to stop runaway traversal of corrupt
/// graphs.
pub const DEFAULT_FREEZE_DEPTH: u32 = 64;

// Frame capacity must hold at least the base frame plus one delegation.
const _: () = assert!(MAX_NESTING >= 2, "MAX_NESTING must be at least 2");
const _: () = assert!(READ_CHUNK > 0, "READ_CHUNK must be non-zero");
