#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  fmt,
  marker::PhantomData,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicU64, Ordering},
};
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, trace};
use spin::{Mutex, MutexGuard};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Allocation granularity. Every chunk spans a whole number of units.
pub const CHUNK_UNIT: usize = 8;

/// Entries of the requirement's own bucket examined before falling back to a
/// strictly larger bucket.
const ALLOC_LOOPS: usize = 3;

/// Largest chunk count addressable by 16-bit header fields (size is stored shifted left by 1).
const SMALL_MAX_CHUNKS: usize = 0x7fff;
/// Largest chunk count addressable by 32-bit header fields.
const BIG_MAX_CHUNKS: usize = 0x7fff_ffff;

// Bookkeeping stored in the body of chunk 0 (byte offsets from the arena start).
// The first 8 bytes are reserved for chunk 0's own header, whatever the width.
const HDR_END_CHUNK: usize = 8;
const HDR_AVAIL_BUCKETS: usize = 12;
const HDR_BUCKETS: usize = 16;
const BUCKET_SLOT_BYTES: usize = 4;

/// Chunk 0 holds the bookkeeping and is never free, so its id marks an empty list.
const NO_CHUNK: ChunkId = 0;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(CHUNK_UNIT.is_power_of_two());
const _: () = assert!(ALLOC_LOOPS >= 1);
const _: () = assert!(HDR_END_CHUNK >= HeaderWidth::Big.header_bytes());
const _: () = assert!(HDR_BUCKETS % BUCKET_SLOT_BYTES == 0);
const _: () = assert!(BIG_MAX_CHUNKS < u32::MAX as usize);
const _: () = assert!(SMALL_MAX_CHUNKS <= (u16::MAX >> 1) as usize);
// Bucket availability is a u32 bitmap.
const _: () = assert!(HeaderWidth::Big.bucket_for(BIG_MAX_CHUNKS) < 31);
// A free-list record (4 fields) fits one unit in the small format.
const _: () = assert!(4 * HeaderWidth::Small.field_bytes() <= CHUNK_UNIT);

// =============================================================================
// Types
// =============================================================================

/// Index of a chunk, in chunk units from the arena start.
type ChunkId = usize;

/// Width of the in-place chunk header fields. Chosen once per heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeaderWidth {
  /// 16-bit fields, 4-byte header. Heaps of at most `0x7fff` chunks.
  Small,
  /// 32-bit fields, 8-byte header. Free chunks of a single unit cannot hold
  /// list links and are kept out of the buckets ("solo" free chunks).
  Big,
}

impl HeaderWidth {
  /// Width picked for a heap of `chunks` units.
  ///
  /// On targets with pointers wider than 32 bits the big format is always used, since a
  /// 4-byte header would leave bodies only 4-byte aligned.
  pub fn for_chunks(chunks: usize) -> Self {
    if cfg!(feature = "small-only") {
      return HeaderWidth::Small;
    }
    if cfg!(feature = "big-only") || usize::BITS > 32 || chunks > SMALL_MAX_CHUNKS {
      HeaderWidth::Big
    } else {
      HeaderWidth::Small
    }
  }

  /// Bytes in front of every chunk body.
  pub const fn header_bytes(self) -> usize {
    match self {
      HeaderWidth::Small => 4,
      HeaderWidth::Big => 8,
    }
  }

  const fn field_bytes(self) -> usize {
    self.header_bytes() / 2
  }

  const fn field_max(self) -> usize {
    match self {
      HeaderWidth::Small => u16::MAX as usize,
      HeaderWidth::Big => u32::MAX as usize,
    }
  }

  const fn max_chunks(self) -> usize {
    match self {
      HeaderWidth::Small => SMALL_MAX_CHUNKS,
      HeaderWidth::Big => BIG_MAX_CHUNKS,
    }
  }

  /// Smallest chunk that still carries one body byte.
  const fn min_chunk_size(self) -> usize {
    chunksz(self.header_bytes() + 1)
  }

  /// Size class of a chunk of `size` units; `size` must be at least `min_chunk_size`.
  const fn bucket_for(self, size: usize) -> usize {
    let usable = size - self.min_chunk_size() + 1;
    (usize::BITS - 1 - usable.leading_zeros()) as usize
  }

  /// Units taken by chunk 0 in a heap of `chunks` units.
  const fn chunk0_size(self, chunks: usize) -> usize {
    chunksz(HDR_BUCKETS + (self.bucket_for(chunks) + 1) * BUCKET_SLOT_BYTES)
  }

  /// Fewest units that hold the bookkeeping chunk plus one minimal free chunk.
  const fn min_heap_chunks(self) -> usize {
    let mut chunks = self.min_chunk_size() + 1;
    loop {
      if self.chunk0_size(chunks) + self.min_chunk_size() <= chunks {
        return chunks;
      }
      chunks += 1;
    }
  }
}

/// Identity of a heap, as seen by listeners. Derived from the arena address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HeapId(usize);

impl HeapId {
  pub const fn new(raw: usize) -> Self {
    Self(raw)
  }

  pub const fn raw(self) -> usize {
    self.0
  }
}

/// Byte counters, in chunk usable bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HeapStats {
  /// `capacity - allocated_bytes`: what is not held by live blocks. Not the usable space
  /// left, since the headers of split-off chunks, solo chunks and aligned-allocation
  /// leftovers all count as free here. See [`Heap::bucket_census`] for the free chunks
  /// themselves.
  pub free_bytes: usize,
  pub allocated_bytes: usize,
  pub max_allocated_bytes: usize,
}

/// Population of one size class.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BucketInfo {
  pub index: usize,
  /// Smallest chunk size (units) filed under this bucket.
  pub min_chunks: usize,
  pub count: usize,
  pub largest_chunks: usize,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
  #[error("heap buffer of {bytes} bytes is too small, {required} bytes are needed")]
  TooSmall { bytes: usize, required: usize },
  #[error("heap buffer of {bytes} bytes exceeds the addressable chunk count")]
  TooLarge { bytes: usize },
  #[error("{chunks} chunks do not fit 16-bit chunk headers")]
  WidthTooNarrow { chunks: usize },
}

/// Logical contents of a chunk header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ChunkHeader {
  size: usize,
  left_size: usize,
  used: bool,
}

/// Header fields, in field-width words from the chunk start. The free-list
/// links only exist while the chunk is free and overlay the body.
#[derive(Clone, Copy)]
#[repr(usize)]
enum Field {
  LeftSize = 0,
  SizeAndUsed = 1,
  FreePrev = 2,
  FreeNext = 3,
}

// =============================================================================
// Chunk Header Codec
// =============================================================================

/// View over the arena bytes. All links are chunk ids relative to `base`.
#[derive(Clone, Copy)]
struct Arena {
  /// Arena start, rounded up to `CHUNK_UNIT`.
  base: NonNull<u8>,
  width: HeaderWidth,
}

impl Arena {
  #[inline]
  fn at(&self, offset: usize) -> *mut u8 {
    // Offsets never pass the end marker's header, which lives in the footer reserve.
    unsafe { self.base.as_ptr().add(offset) }
  }

  #[inline]
  fn field(&self, c: ChunkId, f: Field) -> usize {
    let p = self.at(c * CHUNK_UNIT + f as usize * self.width.field_bytes());
    unsafe {
      match self.width {
        HeaderWidth::Small => p.cast::<u16>().read() as usize,
        HeaderWidth::Big => p.cast::<u32>().read() as usize,
      }
    }
  }

  #[inline]
  fn set_field(&mut self, c: ChunkId, f: Field, value: usize) {
    debug_assert!(value <= self.width.field_max());
    let p = self.at(c * CHUNK_UNIT + f as usize * self.width.field_bytes());
    unsafe {
      match self.width {
        HeaderWidth::Small => p.cast::<u16>().write(value as u16),
        HeaderWidth::Big => p.cast::<u32>().write(value as u32),
      }
    }
  }

  #[inline]
  fn size(&self, c: ChunkId) -> usize {
    self.field(c, Field::SizeAndUsed) >> 1
  }

  #[inline]
  fn used(&self, c: ChunkId) -> bool {
    self.field(c, Field::SizeAndUsed) & 1 != 0
  }

  #[inline]
  fn left_size(&self, c: ChunkId) -> usize {
    self.field(c, Field::LeftSize)
  }

  fn read(&self, c: ChunkId) -> ChunkHeader {
    ChunkHeader {
      size: self.size(c),
      left_size: self.left_size(c),
      used: self.used(c),
    }
  }

  fn write(&mut self, c: ChunkId, header: ChunkHeader) {
    self.set_field(c, Field::SizeAndUsed, (header.size << 1) | header.used as usize);
    self.set_field(c, Field::LeftSize, header.left_size);
  }

  /// Stores a new size. Clears the used bit: callers re-mark used chunks.
  #[inline]
  fn set_size(&mut self, c: ChunkId, size: usize) {
    self.set_field(c, Field::SizeAndUsed, size << 1);
  }

  #[inline]
  fn set_used(&mut self, c: ChunkId, used: bool) {
    let word = self.field(c, Field::SizeAndUsed);
    self.set_field(c, Field::SizeAndUsed, (word & !1) | used as usize);
  }

  #[inline]
  fn set_left_size(&mut self, c: ChunkId, size: usize) {
    self.set_field(c, Field::LeftSize, size);
  }

  #[inline]
  fn prev_free(&self, c: ChunkId) -> ChunkId {
    self.field(c, Field::FreePrev)
  }

  #[inline]
  fn next_free(&self, c: ChunkId) -> ChunkId {
    self.field(c, Field::FreeNext)
  }

  #[inline]
  fn set_prev_free(&mut self, c: ChunkId, prev: ChunkId) {
    self.set_field(c, Field::FreePrev, prev);
  }

  #[inline]
  fn set_next_free(&mut self, c: ChunkId, next: ChunkId) {
    self.set_field(c, Field::FreeNext, next);
  }

  #[inline]
  fn left_chunk(&self, c: ChunkId) -> ChunkId {
    c - self.left_size(c)
  }

  #[inline]
  fn right_chunk(&self, c: ChunkId) -> ChunkId {
    c + self.size(c)
  }

  /// A free chunk too small for list links. Never sits in a bucket.
  #[inline]
  fn is_solo(&self, c: ChunkId) -> bool {
    self.width == HeaderWidth::Big && self.size(c) == 1
  }

  #[inline]
  fn header_bytes(&self) -> usize {
    self.width.header_bytes()
  }

  /// Usable bytes of a chunk of `size` units.
  #[inline]
  fn chunk_bytes(&self, size: usize) -> usize {
    size * CHUNK_UNIT - self.header_bytes()
  }

  /// Units needed to serve `bytes` of body.
  #[inline]
  fn chunks_for(&self, bytes: usize) -> usize {
    chunksz(bytes + self.header_bytes())
  }

  #[inline]
  fn mem(&self, c: ChunkId) -> NonNull<u8> {
    unsafe { self.base.add(c * CHUNK_UNIT + self.header_bytes()) }
  }

  /// Chunk owning a body pointer. Aligned bodies may start past the header by less
  /// than one unit; rounding down to the unit boundary finds the header either way.
  #[inline]
  fn chunk_of(&self, ptr: NonNull<u8>) -> ChunkId {
    (ptr.as_ptr() as usize - self.base.as_ptr() as usize - self.header_bytes()) / CHUNK_UNIT
  }

  /// Bytes from `ptr` to the end of its chunk.
  fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    let c = self.chunk_of(ptr);
    let end = self.base.as_ptr() as usize + self.right_chunk(c) * CHUNK_UNIT;
    end - ptr.as_ptr() as usize
  }

  // Arena bookkeeping words.

  #[inline]
  fn word(&self, offset: usize) -> u32 {
    unsafe { self.at(offset).cast::<u32>().read() }
  }

  #[inline]
  fn set_word(&mut self, offset: usize, value: u32) {
    unsafe { self.at(offset).cast::<u32>().write(value) }
  }

  #[inline]
  fn end_chunk(&self) -> ChunkId {
    self.word(HDR_END_CHUNK) as usize
  }
}

// =============================================================================
// Bucket Index
// =============================================================================

impl Arena {
  #[inline]
  fn avail_buckets(&self) -> u32 {
    self.word(HDR_AVAIL_BUCKETS)
  }

  #[inline]
  fn set_avail_buckets(&mut self, mask: u32) {
    self.set_word(HDR_AVAIL_BUCKETS, mask);
  }

  #[inline]
  fn bucket_head(&self, b: usize) -> ChunkId {
    self.word(HDR_BUCKETS + b * BUCKET_SLOT_BYTES) as usize
  }

  #[inline]
  fn set_bucket_head(&mut self, b: usize, c: ChunkId) {
    self.set_word(HDR_BUCKETS + b * BUCKET_SLOT_BYTES, c as u32);
  }

  #[inline]
  fn bucket_for(&self, size: usize) -> usize {
    self.width.bucket_for(size)
  }

  fn bucket_count(&self) -> usize {
    self.bucket_for(self.end_chunk()) + 1
  }

  fn bucket_min_chunks(&self, b: usize) -> usize {
    (1 << b) + self.width.min_chunk_size() - 1
  }

  fn free_list_remove_bidx(&mut self, c: ChunkId, b: usize) {
    debug_assert!(!self.used(c));
    debug_assert!(self.bucket_head(b) != NO_CHUNK);
    debug_assert!(self.avail_buckets() & (1 << b) != 0);

    if self.next_free(c) == c {
      // Last entry.
      self.set_avail_buckets(self.avail_buckets() & !(1 << b));
      self.set_bucket_head(b, NO_CHUNK);
    } else {
      let first = self.prev_free(c);
      let second = self.next_free(c);
      self.set_bucket_head(b, second);
      self.set_next_free(first, second);
      self.set_prev_free(second, first);
    }
  }

  fn free_list_remove(&mut self, c: ChunkId) {
    if !self.is_solo(c) {
      let b = self.bucket_for(self.size(c));
      self.free_list_remove_bidx(c, b);
    }
  }

  fn free_list_add_bidx(&mut self, c: ChunkId, b: usize) {
    let head = self.bucket_head(b);
    if head == NO_CHUNK {
      debug_assert!(self.avail_buckets() & (1 << b) == 0);
      self.set_avail_buckets(self.avail_buckets() | (1 << b));
      self.set_bucket_head(b, c);
      self.set_prev_free(c, c);
      self.set_next_free(c, c);
    } else {
      debug_assert!(self.avail_buckets() & (1 << b) != 0);
      // Insert in front of the head, i.e. at the tail of the ring.
      let second = head;
      let first = self.prev_free(second);
      self.set_prev_free(c, first);
      self.set_next_free(c, second);
      self.set_next_free(first, c);
      self.set_prev_free(second, c);
    }
  }

  fn free_list_add(&mut self, c: ChunkId) {
    if !self.is_solo(c) {
      let b = self.bucket_for(self.size(c));
      self.free_list_add_bidx(c, b);
    }
  }

  /// Takes a free chunk of at least `need` units off its bucket.
  ///
  /// The requirement's own bucket may hold chunks that are too small, so only a
  /// bounded number of its entries are tried first (rotating the head as we go).
  /// After that, the head of the smallest non-empty larger bucket always fits. With
  /// no larger bucket available, the rest of the own bucket is walked, so `None`
  /// means no free chunk fits.
  fn find_best_fit(&mut self, need: usize) -> Option<ChunkId> {
    if need > self.end_chunk() {
      return None;
    }
    let b = self.bucket_for(need);

    let first = self.bucket_head(b);
    if first != NO_CHUNK {
      let mut loops = ALLOC_LOOPS;
      loop {
        let c = self.bucket_head(b);
        if self.size(c) >= need {
          self.free_list_remove_bidx(c, b);
          return Some(c);
        }
        self.set_bucket_head(b, self.next_free(c));
        loops -= 1;
        if loops == 0 || self.bucket_head(b) == first {
          break;
        }
      }
    }

    let larger = self.avail_buckets() & !low_mask(b + 1);
    if larger != 0 {
      let b = larger.trailing_zeros() as usize;
      let c = self.bucket_head(b);
      self.free_list_remove_bidx(c, b);
      debug_assert!(self.size(c) >= need);
      return Some(c);
    }

    let head = self.bucket_head(b);
    if head == NO_CHUNK {
      return None;
    }
    let mut c = head;
    loop {
      if self.size(c) >= need {
        self.free_list_remove_bidx(c, b);
        return Some(c);
      }
      c = self.next_free(c);
      if c == head {
        return None;
      }
    }
  }

  // Splitting and coalescing. None of these touch the free lists except `free_chunk`.

  /// Splits `lc` at `rc`. Both halves end up marked free.
  fn split_chunks(&mut self, lc: ChunkId, rc: ChunkId) {
    let total = self.size(lc);
    let left = rc - lc;
    let right = total - left;
    self.set_size(lc, left);
    self.set_size(rc, right);
    self.set_left_size(rc, left);
    let after = self.right_chunk(rc);
    self.set_left_size(after, right);
  }

  fn merge_chunks(&mut self, lc: ChunkId, rc: ChunkId) {
    let merged = self.size(lc) + self.size(rc);
    let after = self.right_chunk(rc);
    self.set_size(lc, merged);
    self.set_left_size(after, merged);
  }

  /// Coalesces the free chunk `c` with free neighbours and files the result.
  fn free_chunk(&mut self, mut c: ChunkId) {
    let rc = self.right_chunk(c);
    if !self.used(rc) {
      self.free_list_remove(rc);
      self.merge_chunks(c, rc);
    }

    let lc = self.left_chunk(c);
    if !self.used(lc) {
      self.free_list_remove(lc);
      self.merge_chunks(lc, c);
      c = lc;
    }

    self.free_list_add(c);
  }
}

// =============================================================================
// Heap
// =============================================================================

/// A chunk heap over a caller-supplied buffer.
///
/// Single-threaded: callers sharing a heap serialize access themselves (see [`LockedHeap`]).
pub struct Heap<'a> {
  arena: Arena,
  stats: HeapStats,
  /// Usable bytes of the free chunk created at init.
  capacity: usize,
  listeners: Option<&'a ListenerRegistry>,
  _mem: PhantomData<&'a mut [u8]>,
}

// The heap is the only path to the borrowed buffer.
unsafe impl Send for Heap<'_> {}

impl<'a> Heap<'a> {
  /// Lays out a heap over `mem`, picking the header width from its size.
  pub fn new(mem: &'a mut [u8]) -> Result<Self, HeapError> {
    let width = HeaderWidth::for_chunks(mem.len() / CHUNK_UNIT);
    Self::with_width(mem, width)
  }

  pub fn with_width(mem: &'a mut [u8], width: HeaderWidth) -> Result<Self, HeapError> {
    let bytes = mem.len();
    if bytes / CHUNK_UNIT > BIG_MAX_CHUNKS {
      return Err(HeapError::TooLarge { bytes });
    }

    // Round the start up and the end down, keeping room for the end marker's header.
    let footer = width.header_bytes();
    let start = mem.as_ptr() as usize;
    let lead = align_up(start, CHUNK_UNIT) - start;
    let span = bytes.saturating_sub(footer);
    let end = align_down(start + span, CHUNK_UNIT);
    let heap_sz = (end.saturating_sub(start + lead)) / CHUNK_UNIT;

    let required = lead + width.min_heap_chunks() * CHUNK_UNIT + footer;
    if heap_sz < width.min_heap_chunks() {
      return Err(HeapError::TooSmall { bytes, required });
    }
    if heap_sz > width.max_chunks() {
      return Err(HeapError::WidthTooNarrow { chunks: heap_sz });
    }
    let chunk0_size = width.chunk0_size(heap_sz);
    if chunk0_size + width.min_chunk_size() > heap_sz {
      return Err(HeapError::TooSmall { bytes, required });
    }

    let base = unsafe { NonNull::from(mem).cast::<u8>().add(lead) };
    let mut arena = Arena { base, width };

    arena.set_word(HDR_END_CHUNK, heap_sz as u32);
    arena.set_avail_buckets(0);
    let nb_buckets = arena.bucket_count();
    for b in 0..nb_buckets {
      arena.set_bucket_head(b, NO_CHUNK);
    }

    // Bookkeeping chunk, the free heap, and the end marker.
    arena.write(0, ChunkHeader {
      size: chunk0_size,
      left_size: 0,
      used: true,
    });
    arena.write(chunk0_size, ChunkHeader {
      size: heap_sz - chunk0_size,
      left_size: chunk0_size,
      used: false,
    });
    arena.write(heap_sz, ChunkHeader {
      size: 0,
      left_size: heap_sz - chunk0_size,
      used: true,
    });
    arena.free_list_add(chunk0_size);

    let capacity = arena.chunk_bytes(heap_sz - chunk0_size);
    debug!(
      "heap init at {:p}: {heap_sz} chunks, {width:?} headers, {nb_buckets} buckets, {capacity} bytes free",
      base
    );

    Ok(Self {
      arena,
      stats: HeapStats {
        free_bytes: capacity,
        allocated_bytes: 0,
        max_allocated_bytes: 0,
      },
      capacity,
      listeners: None,
      _mem: PhantomData,
    })
  }

  /// Reports alloc/free events of this heap to `registry`.
  pub fn with_listeners(mut self, registry: &'a ListenerRegistry) -> Self {
    self.listeners = Some(registry);
    self
  }

  pub fn id(&self) -> HeapId {
    HeapId(self.arena.base.as_ptr() as usize)
  }

  pub fn width(&self) -> HeaderWidth {
    self.arena.width
  }

  pub fn header_bytes(&self) -> usize {
    self.arena.header_bytes()
  }

  /// Usable bytes of an empty heap.
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn stats(&self) -> HeapStats {
    self.stats
  }

  pub fn reset_max_allocated(&mut self) {
    self.stats.max_allocated_bytes = self.stats.allocated_bytes;
  }

  /// Whether `ptr` points into the allocatable part of the arena.
  pub fn contains(&self, ptr: *const u8) -> bool {
    let base = self.arena.base.as_ptr() as usize;
    let lo = base + self.arena.right_chunk(0) * CHUNK_UNIT;
    let hi = base + self.arena.end_chunk() * CHUNK_UNIT;
    (lo..hi).contains(&(ptr as usize))
  }

  pub fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    if bytes == 0 || self.size_too_big(bytes) {
      return None;
    }

    let need = self.arena.chunks_for(bytes);
    let c = self.arena.find_best_fit(need)?;

    // Split off the remainder, if any.
    if self.arena.size(c) > need {
      self.arena.split_chunks(c, c + need);
      self.arena.free_list_add(c + need);
    }
    self.arena.set_used(c, true);

    Some(self.commit_alloc(self.arena.mem(c), bytes))
  }

  /// Allocates `bytes` whose address is a multiple of `align`.
  ///
  /// Returns `None` if `align` is not a power of two.
  pub fn aligned_alloc(&mut self, align: usize, bytes: usize) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() {
      return None;
    }
    let hdr = self.arena.header_bytes();
    if align <= hdr {
      return self.alloc(bytes);
    }
    if bytes == 0 || self.size_too_big(bytes) {
      return None;
    }

    // Over-allocate so an aligned body fits; the body may need to move up by
    // at most `align - hdr` bytes past the natural one.
    let padded_bytes = bytes.checked_add(align - hdr)?;
    if self.size_too_big(padded_bytes) {
      return None;
    }
    let padded = self.arena.chunks_for(padded_bytes);
    let c0 = self.arena.find_best_fit(padded)?;

    let base = self.arena.base.as_ptr() as usize;
    let mem = align_up(self.arena.mem(c0).as_ptr() as usize, align);
    let end = align_up(mem + bytes, CHUNK_UNIT);
    let c = (mem - hdr - base) / CHUNK_UNIT;
    let c_end = (end - base) / CHUNK_UNIT;
    debug_assert!(c >= c0 && c < c_end && c_end <= c0 + padded);

    // Give back the unused prefix and suffix.
    if c > c0 {
      self.arena.split_chunks(c0, c);
      self.arena.set_used(c, true);
      self.arena.free_chunk(c0);
    }
    if self.arena.right_chunk(c) > c_end {
      self.arena.split_chunks(c, c_end);
      self.arena.set_used(c, true);
      self.arena.free_chunk(c_end);
    }
    self.arena.set_used(c, true);

    let ptr = unsafe { self.arena.base.add(mem - base) };
    Some(self.commit_alloc(ptr, bytes))
  }

  /// Returns a block to the heap, merging it with free neighbours.
  ///
  /// # Safety
  /// `ptr` must come from this heap and must not have been freed since.
  pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
    let c = self.arena.chunk_of(ptr);
    debug_assert!(self.arena.used(c), "unexpected heap state (double free?) for {ptr:p}");
    debug_assert!(
      self.arena.left_chunk(self.arena.right_chunk(c)) == c,
      "corrupted heap bounds (buffer overflow?) for {ptr:p}"
    );

    let usable = self.arena.usable_size(ptr);
    self.account_free(self.arena.chunk_bytes(self.arena.size(c)));
    trace!("free({ptr:p}) [{usable} bytes]");
    self.notify(Event::Free, ptr, usable);

    self.arena.set_used(c, false);
    self.arena.free_chunk(c);
  }

  /// Resizes a block, keeping its contents up to the smaller of both sizes.
  ///
  /// `None` behaves as [`Heap::alloc`], a size of 0 as [`Heap::free`]. Shrinking, and
  /// growing into a free right neighbour, keep the pointer.
  ///
  /// # Safety
  /// As for [`Heap::free`].
  pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, bytes: usize) -> Option<NonNull<u8>> {
    unsafe { self.aligned_realloc(ptr, 1, bytes) }
  }

  /// [`Heap::realloc`] with an alignment requirement on the result.
  ///
  /// The block stays in place whenever its current address already satisfies `align`.
  /// A non-power-of-two `align` returns `None` and leaves the block untouched.
  ///
  /// # Safety
  /// As for [`Heap::free`].
  pub unsafe fn aligned_realloc(
    &mut self,
    ptr: Option<NonNull<u8>>,
    align: usize,
    bytes: usize,
  ) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() {
      return None;
    }
    let Some(ptr) = ptr else {
      return self.aligned_alloc(align, bytes);
    };
    if bytes == 0 {
      unsafe { self.free(ptr) };
      return None;
    }
    if self.size_too_big(bytes) {
      return None;
    }

    let c = self.arena.chunk_of(ptr);
    let gap = ptr.as_ptr() as usize - self.arena.mem(c).as_ptr() as usize;
    let need = self.arena.chunks_for(bytes + gap);
    let size = self.arena.size(c);

    if ptr.as_ptr() as usize & (align - 1) == 0 {
      if size == need {
        return Some(ptr);
      }
      let rc = self.arena.right_chunk(c);
      if size > need || (!self.arena.used(rc) && size + self.arena.size(rc) >= need) {
        self.resize_in_place(ptr, c, need);
        trace!("realloc({ptr:p}, {bytes}) in place");
        return Some(ptr);
      }
    }

    // Fallback: allocate, copy, free.
    let old_usable = self.arena.usable_size(ptr);
    let moved = self.aligned_alloc(align, bytes)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_usable.min(bytes));
      self.free(ptr);
    }
    trace!("realloc({ptr:p}, {bytes}) moved to {moved:p}");
    Some(moved)
  }

  /// Bytes available at `ptr`, which may exceed the size asked for.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    self.arena.usable_size(ptr)
  }

  #[inline]
  fn size_too_big(&self, bytes: usize) -> bool {
    // Also keeps the chunk arithmetic below clear of overflow.
    bytes / CHUNK_UNIT >= self.arena.end_chunk()
  }

  /// Shrinks `c` to `need` units, or grows it into its free right neighbour.
  fn resize_in_place(&mut self, ptr: NonNull<u8>, c: ChunkId, need: usize) {
    let old_usable = self.arena.usable_size(ptr);
    let old_bytes = self.arena.chunk_bytes(self.arena.size(c));

    if self.arena.size(c) > need {
      self.arena.split_chunks(c, c + need);
      self.arena.set_used(c, true);
      self.arena.free_chunk(c + need);
    } else {
      let rc = self.arena.right_chunk(c);
      let take = need - self.arena.size(c);
      self.arena.free_list_remove(rc);
      if take < self.arena.size(rc) {
        self.arena.split_chunks(rc, rc + take);
        self.arena.free_list_add(rc + take);
      }
      self.arena.merge_chunks(c, rc);
      self.arena.set_used(c, true);
    }

    self.account_free(old_bytes);
    self.account_alloc(self.arena.chunk_bytes(self.arena.size(c)));
    self.notify(Event::Free, ptr, old_usable);
    self.notify(Event::Alloc, ptr, self.arena.usable_size(ptr));
  }

  fn commit_alloc(&mut self, ptr: NonNull<u8>, bytes: usize) -> NonNull<u8> {
    let c = self.arena.chunk_of(ptr);
    self.account_alloc(self.arena.chunk_bytes(self.arena.size(c)));
    let usable = self.arena.usable_size(ptr);
    trace!("alloc({bytes}) -> {ptr:p} [{usable} bytes]");
    self.notify(Event::Alloc, ptr, usable);
    ptr
  }

  fn account_alloc(&mut self, bytes: usize) {
    self.stats.allocated_bytes += bytes;
    self.stats.free_bytes -= bytes;
    self.stats.max_allocated_bytes = self.stats.max_allocated_bytes.max(self.stats.allocated_bytes);
  }

  fn account_free(&mut self, bytes: usize) {
    self.stats.allocated_bytes -= bytes;
    self.stats.free_bytes += bytes;
  }

  fn notify(&self, event: Event, ptr: NonNull<u8>, bytes: usize) {
    if let Some(registry) = self.listeners {
      registry.notify(event, self.id(), ptr, bytes);
    }
  }
}

impl fmt::Debug for Heap<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Heap")
      .field("base", &self.arena.base)
      .field("width", &self.arena.width)
      .field("end_chunk", &self.arena.end_chunk())
      .field("stats", &self.stats)
      .finish()
  }
}

// =============================================================================
// Validation
// =============================================================================

impl Heap<'_> {
  /// Checks every structural invariant of the heap. Diagnostic only: returns
  /// `false` on the first violation and repairs nothing.
  pub fn validate(&self) -> bool {
    match self.check() {
      Ok(()) => true,
      Err(reason) => {
        debug!("heap {:?} failed validation: {reason}", self.id());
        false
      }
    }
  }

  fn check(&self) -> Result<(), &'static str> {
    let a = &self.arena;
    let end = a.end_chunk();
    let nb = a.bucket_count();
    let first = a.right_chunk(0);

    if !a.used(0) || a.left_size(0) != 0 {
      return Err("bookkeeping chunk header damaged");
    }
    if first == 0 || first >= end {
      return Err("bookkeeping chunk size out of range");
    }
    if a.avail_buckets() >> nb != 0 {
      return Err("availability bit set past the last bucket");
    }

    // Linear walk: boundaries, left sizes, coalescing, per-bucket free counts.
    let mut free = BTreeSet::new();
    let mut per_bucket = vec![0usize; nb];
    let mut total = a.size(0);
    let mut prev = 0;
    let mut c = first;
    while c < end {
      let h = a.read(c);
      if h.size == 0 {
        return Err("zero-sized chunk before the end marker");
      }
      if c + h.size > end {
        return Err("chunk runs past the end marker");
      }
      if h.left_size != c - prev {
        return Err("left size does not match the preceding chunk");
      }
      if h.used {
        if a.is_solo(c) {
          return Err("used chunk too small to carry a body");
        }
      } else {
        if !a.used(prev) {
          return Err("adjacent free chunks");
        }
        if !a.is_solo(c) {
          per_bucket[a.bucket_for(h.size)] += 1;
          free.insert(c);
        }
      }
      total += h.size;
      prev = c;
      c += h.size;
    }

    let marker = a.read(end);
    if marker.size != 0 || !marker.used || marker.left_size != end - prev {
      return Err("end marker damaged");
    }
    if total != end {
      return Err("chunk sizes do not add up to the arena");
    }

    // Bucket walk: every listed chunk is a free chunk of that class, listed once.
    for (b, &expected) in per_bucket.iter().enumerate() {
      let head = a.bucket_head(b);
      let avail = a.avail_buckets() & (1 << b) != 0;
      if avail != (head != NO_CHUNK) {
        return Err("availability bit disagrees with bucket head");
      }
      if head == NO_CHUNK {
        if expected != 0 {
          return Err("free chunk missing from its bucket");
        }
        continue;
      }

      let mut n = 0;
      let mut c = head;
      loop {
        if !free.remove(&c) {
          return Err("bucket entry is not a free chunk, or is listed twice");
        }
        if a.bucket_for(a.size(c)) != b {
          return Err("free chunk filed under the wrong bucket");
        }
        let next = a.next_free(c);
        if next < first || next >= end {
          return Err("free list link out of bounds");
        }
        if a.prev_free(next) != c {
          return Err("free list back link broken");
        }
        n += 1;
        c = next;
        if c == head {
          break;
        }
      }
      if n != expected {
        return Err("bucket length disagrees with the chunk walk");
      }
    }

    if !free.is_empty() {
      return Err("free chunk missing from its bucket");
    }
    Ok(())
  }

  /// Population of every bucket.
  pub fn bucket_census(&self) -> Vec<BucketInfo> {
    let a = &self.arena;
    let limit = a.end_chunk();
    (0..a.bucket_count())
      .map(|b| {
        let mut info = BucketInfo {
          index: b,
          min_chunks: a.bucket_min_chunks(b),
          count: 0,
          largest_chunks: 0,
        };
        let head = a.bucket_head(b);
        if head != NO_CHUNK {
          let mut c = head;
          loop {
            info.count += 1;
            info.largest_chunks = info.largest_chunks.max(a.size(c));
            c = a.next_free(c);
            if c == head || info.count > limit {
              break;
            }
          }
        }
        info
      })
      .collect()
  }

  /// Logs the bucket census and usage totals, and every chunk if `dump_chunks`.
  pub fn log_info(&self, dump_chunks: bool) {
    let a = &self.arena;
    let end = a.end_chunk();
    info!(
      "heap {:?}: {end} chunks of {CHUNK_UNIT} bytes, {:?} headers",
      self.id(),
      a.width
    );
    info!("  bucket#    min units        total      largest      largest");
    info!("             threshold       chunks      (units)      (bytes)");
    for bucket in self.bucket_census().iter().filter(|b| b.count > 0) {
      info!(
        "  {:7} {:12} {:12} {:12} {:12}",
        bucket.index,
        bucket.min_chunks,
        bucket.count,
        bucket.largest_chunks,
        a.chunk_bytes(bucket.largest_chunks)
      );
    }

    let mut free_units = 0;
    let mut used_units = 0;
    let mut c = a.right_chunk(0);
    while c < end {
      let h = a.read(c);
      if h.used {
        used_units += h.size;
      } else {
        free_units += h.size;
      }
      if dump_chunks {
        info!(
          "  chunk {c:6}: [{}] size {:6} left {:6}",
          if h.used { '*' } else { '-' },
          h.size,
          h.left_size
        );
      }
      c += h.size;
    }
    let total = (free_units + used_units).max(1);
    info!(
      "  {} free units, {} used units, {}% free, {} bytes allocated (peak {})",
      free_units,
      used_units,
      free_units * 100 / total,
      self.stats.allocated_bytes,
      self.stats.max_allocated_bytes
    );
  }
}

// =============================================================================
// Listeners
// =============================================================================

/// Callback receiving the heap, the block and its usable size.
pub type ListenerFn = dyn Fn(HeapId, NonNull<u8>, usize) + Send;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Event {
  Alloc,
  Free,
}

struct Listener {
  heap_id: HeapId,
  event: Event,
  callback: Box<ListenerFn>,
}

/// Sequence numbers are unique across registries, so a handle never matches a
/// listener of another registry.
static NEXT_LISTENER: AtomicU64 = AtomicU64::new(0);

/// Observers of heap alloc/free events, called in registration order.
///
/// Callbacks run synchronously, inside the heap operation and with the registry
/// locked. They must not call back into the registry or into the reporting heap.
pub struct ListenerRegistry {
  /// Keyed by registration sequence number.
  listeners: Mutex<BTreeMap<u64, Listener>>,
}

/// Registration token, consumed by [`ListenerRegistry::unregister`].
#[must_use]
#[derive(Debug)]
pub struct ListenerHandle(u64);

impl ListenerRegistry {
  pub const fn new() -> Self {
    Self {
      listeners: Mutex::new(BTreeMap::new()),
    }
  }

  /// Calls `callback` after every allocation committed by heap `heap_id`.
  pub fn register_alloc_listener<F>(&self, heap_id: HeapId, callback: F) -> ListenerHandle
  where
    F: Fn(HeapId, NonNull<u8>, usize) + Send + 'static,
  {
    self.register(heap_id, Event::Alloc, Box::new(callback))
  }

  /// Calls `callback` before every free committed by heap `heap_id`.
  pub fn register_free_listener<F>(&self, heap_id: HeapId, callback: F) -> ListenerHandle
  where
    F: Fn(HeapId, NonNull<u8>, usize) + Send + 'static,
  {
    self.register(heap_id, Event::Free, Box::new(callback))
  }

  /// Removes the listener behind `handle`. A handle from another registry matches
  /// nothing here and is dropped.
  pub fn unregister(&self, handle: ListenerHandle) {
    self.listeners.lock().remove(&handle.0);
  }

  /// Number of registered listeners.
  pub fn len(&self) -> usize {
    self.listeners.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn register(&self, heap_id: HeapId, event: Event, callback: Box<ListenerFn>) -> ListenerHandle {
    let seq = NEXT_LISTENER.fetch_add(1, Ordering::Relaxed);
    self.listeners.lock().insert(seq, Listener {
      heap_id,
      event,
      callback,
    });
    ListenerHandle(seq)
  }

  fn notify(&self, event: Event, heap_id: HeapId, ptr: NonNull<u8>, bytes: usize) {
    for listener in self.listeners.lock().values() {
      if listener.event == event && listener.heap_id == heap_id {
        (listener.callback)(heap_id, ptr, bytes);
      }
    }
  }
}

impl Default for ListenerRegistry {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// A heap behind a spinlock, usable as a global allocator.
pub struct LockedHeap {
  heap: Mutex<Option<Heap<'static>>>,
}

impl LockedHeap {
  pub const fn empty() -> Self {
    Self {
      heap: Mutex::new(None),
    }
  }

  pub fn init(&self, mem: &'static mut [u8]) -> Result<(), HeapError> {
    self.install(Heap::new(mem)?);
    Ok(())
  }

  /// Replaces the managed heap. Blocks of a previous heap must not be freed afterwards.
  pub fn install(&self, heap: Heap<'static>) {
    *self.heap.lock() = Some(heap);
  }

  pub fn lock(&self) -> MutexGuard<'_, Option<Heap<'static>>> {
    self.heap.lock()
  }
}

unsafe impl GlobalAlloc for LockedHeap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    self
      .heap
      .lock()
      .as_mut()
      .and_then(|heap| heap.aligned_alloc(layout.align(), layout.size().max(1)))
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    if let Some(heap) = self.heap.lock().as_mut() {
      unsafe { heap.free(ptr) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let mut guard = self.heap.lock();
    let Some(heap) = guard.as_mut() else {
      return null_mut();
    };
    let moved = unsafe { heap.aligned_realloc(NonNull::new(ptr), layout.align(), new_size.max(1)) };
    moved.map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

/// Units covering `bytes`.
#[inline(always)]
const fn chunksz(bytes: usize) -> usize {
  bytes.div_ceil(CHUNK_UNIT)
}

/// Bits `0..n` set; `n` is at most 31.
#[inline(always)]
const fn low_mask(n: usize) -> u32 {
  (1u32 << n) - 1
}
