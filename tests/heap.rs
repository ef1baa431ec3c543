mod common;

use std::ptr::NonNull;

use chunkheap::{CHUNK_UNIT, HeaderWidth, Heap, HeapError};
use common::{Mem, check, fill, init_logger};

/// Asserts the heap is back to a single free chunk spanning its capacity.
fn assert_fully_coalesced(heap: &Heap<'_>) {
  let census = heap.bucket_census();
  let free_chunks: usize = census.iter().map(|b| b.count).sum();
  assert_eq!(free_chunks, 1, "census: {census:?}");
  let largest = census.iter().map(|b| b.largest_chunks).max().unwrap();
  assert_eq!(largest * CHUNK_UNIT - heap.header_bytes(), heap.capacity());
  assert_eq!(heap.stats().free_bytes, heap.capacity());
  assert_eq!(heap.stats().allocated_bytes, 0);
}

#[test]
fn tiny_arena_leaves_a_solo_free_chunk() {
  init_logger();
  let mut mem = Mem::<64>::new();
  let mut heap = Heap::with_width(&mut mem.0, HeaderWidth::Big).unwrap();
  assert!(heap.validate());

  let p = heap.alloc(1).expect("1 byte fits a 64 byte arena");
  assert!(heap.validate());
  // The one-unit remainder cannot carry a body.
  assert!(heap.alloc(1).is_none());
  assert!(heap.validate());

  unsafe { heap.free(p) };
  assert!(heap.validate());
  assert_fully_coalesced(&heap);
}

#[test]
fn realloc_grows_into_trailing_free_space() {
  let mut mem = Mem::<2048>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  let p1 = heap.alloc(64).unwrap();
  let p2 = unsafe { heap.realloc(Some(p1), 128) }.unwrap();
  assert_eq!(p1, p2, "realloc should have expanded in place");
  assert!(unsafe { heap.usable_size(p2) } >= 128);
  assert!(heap.validate());
}

#[test]
fn realloc_moves_when_the_neighbour_is_used() {
  let mut mem = Mem::<2048>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  let p1 = heap.alloc(64).unwrap();
  let _p2 = heap.alloc(64).unwrap();
  fill(p1, 64);

  let moved = unsafe { heap.realloc(Some(p1), 128) }.unwrap();
  assert_ne!(moved, p1);
  assert!(check(moved, 64, p1, 64), "first 64 bytes must survive the move");
  assert!(heap.validate());
}

#[test]
fn fragmenting_fill_then_free_all_coalesces() {
  for width in [HeaderWidth::Small, HeaderWidth::Big] {
    let mut mem = Mem::<1024>::new();
    let mut heap = Heap::with_width(&mut mem.0, width).unwrap();

    let mut blocks = Vec::new();
    let mut size = 1;
    while let Some(p) = heap.alloc(size) {
      blocks.push(p);
      assert!(heap.validate());
      size = size % 13 + 1;
    }
    while let Some(p) = heap.alloc(1) {
      blocks.push(p);
    }
    assert!(blocks.len() > 10);

    // Every other block first, to leave the worst holes, then the rest.
    let (odd, even): (Vec<_>, Vec<_>) = blocks.iter().enumerate().partition(|(i, _)| i % 2 == 1);
    for (_, p) in odd.into_iter().chain(even) {
      unsafe { heap.free(*p) };
      assert!(heap.validate());
    }
    assert_fully_coalesced(&heap);
  }
}

/// Leaves free chunks of `units` each, separated by used blocks, and allocates the rest
/// of the heap. The chunks are freed in order, so each bucket lists them in that order.
fn queue_free_chunks(heap: &mut Heap<'_>, units: &[usize]) -> Vec<NonNull<u8>> {
  let hdr = heap.header_bytes();
  let mut holes = Vec::new();
  for &n in units {
    holes.push(heap.alloc(n * CHUNK_UNIT - hdr).unwrap());
    heap.alloc(1).unwrap();
  }
  let tail = heap.bucket_census().iter().map(|b| b.largest_chunks).max().unwrap();
  heap.alloc(tail * CHUNK_UNIT - hdr).unwrap();
  assert!(heap.bucket_census().iter().all(|b| b.count == 0));

  for &p in &holes {
    unsafe { heap.free(p) };
  }
  assert!(heap.validate());
  holes
}

#[test]
fn alloc_finds_a_fit_queued_behind_too_small_chunks() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::with_width(&mut mem.0, HeaderWidth::Big).unwrap();
  let holes = queue_free_chunks(&mut heap, &[5, 5, 5, 5, 8]);

  let census = heap.bucket_census();
  let listed: Vec<_> = census.iter().filter(|b| b.count > 0).collect();
  assert_eq!(listed.len(), 1, "census: {census:?}");
  assert_eq!((listed[0].count, listed[0].largest_chunks), (5, 8));

  // 56 bytes need 8 units: only the last chunk of the bucket fits.
  assert_eq!(heap.alloc(56), Some(holes[4]));
  assert!(heap.alloc(56).is_none());
  assert!(heap.validate());
}

#[test]
fn too_small_bucket_head_rotates_to_the_next_entry() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::with_width(&mut mem.0, HeaderWidth::Big).unwrap();
  let holes = queue_free_chunks(&mut heap, &[5, 8]);

  assert_eq!(heap.alloc(56), Some(holes[1]));
  // The 5-unit chunk is still listed and still serves a request that fits it.
  assert_eq!(heap.alloc(32), Some(holes[0]));
  assert!(heap.bucket_census().iter().all(|b| b.count == 0));
  assert!(heap.validate());
}

#[test]
fn too_small_bucket_falls_back_to_a_larger_bucket() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::with_width(&mut mem.0, HeaderWidth::Big).unwrap();
  let holes = queue_free_chunks(&mut heap, &[5, 5, 5, 5, 16]);

  assert_eq!(heap.alloc(56), Some(holes[4]));
  let census = heap.bucket_census();
  // Four 5-unit chunks plus the 8 units split off the larger one.
  assert_eq!(census.iter().map(|b| b.count).sum::<usize>(), 5, "census: {census:?}");
  assert!(heap.validate());
}

#[test]
fn growth_into_free_neighbour_keeps_the_pointer() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  let a = heap.alloc(100).unwrap();
  let b = heap.alloc(200).unwrap();
  let _guard = heap.alloc(16).unwrap();
  let x = unsafe { heap.usable_size(a) };
  let y = unsafe { heap.usable_size(b) };
  unsafe { heap.free(b) };
  fill(a, x);

  let limit = x + y + heap.header_bytes();
  let grown = unsafe { heap.realloc(Some(a), limit) }.unwrap();
  assert_eq!(grown, a);
  assert_eq!(unsafe { heap.usable_size(a) }, limit);
  assert!(check(a, x, a, x));
  assert!(heap.validate());
}

#[test]
fn growth_past_the_free_neighbour_moves() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  let a = heap.alloc(100).unwrap();
  let b = heap.alloc(200).unwrap();
  let _guard = heap.alloc(16).unwrap();
  let x = unsafe { heap.usable_size(a) };
  let y = unsafe { heap.usable_size(b) };
  unsafe { heap.free(b) };

  let too_big = x + y + heap.header_bytes() + 1;
  let moved = unsafe { heap.realloc(Some(a), too_big) }.unwrap();
  assert_ne!(moved, a);
  assert!(heap.validate());
}

#[test]
fn shrink_keeps_the_pointer_and_frees_the_tail() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  let a = heap.alloc(400).unwrap();
  let _guard = heap.alloc(16).unwrap();
  let before = heap.stats().allocated_bytes;

  for smaller in [300, 120, 33, 1] {
    let p = unsafe { heap.realloc(Some(a), smaller) }.unwrap();
    assert_eq!(p, a);
    let usable = unsafe { heap.usable_size(p) };
    assert!(usable >= smaller && usable < smaller + 2 * CHUNK_UNIT);
    assert!(heap.validate());
  }
  assert!(heap.stats().allocated_bytes < before);
}

#[test]
fn realloc_edge_cases() {
  let mut mem = Mem::<2048>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  let p = unsafe { heap.realloc(None, 40) }.unwrap();
  assert!(unsafe { heap.usable_size(p) } >= 40);

  // Fits the current chunk: nothing moves.
  let same = unsafe { heap.realloc(Some(p), 35) }.unwrap();
  assert_eq!(same, p);

  assert!(unsafe { heap.realloc(Some(p), 0) }.is_none());
  assert!(heap.validate());
  assert_fully_coalesced(&heap);
}

#[test]
fn usable_size_covers_every_request() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  for n in 1..600 {
    let p = heap.alloc(n).unwrap();
    let usable = unsafe { heap.usable_size(p) };
    assert!(usable >= n);
    assert_eq!(usable % CHUNK_UNIT, (CHUNK_UNIT - heap.header_bytes()) % CHUNK_UNIT);
    fill(p, usable);
    assert!(check(p, usable, p, usable));
    unsafe { heap.free(p) };
  }
  assert!(heap.validate());
  assert_fully_coalesced(&heap);
}

#[test]
fn refuses_empty_and_oversized_requests() {
  let mut mem = Mem::<1024>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  assert!(heap.alloc(0).is_none());
  assert!(heap.alloc(1024).is_none());
  assert!(heap.alloc(usize::MAX).is_none());
  assert!(heap.aligned_alloc(64, 0).is_none());
  assert!(heap.aligned_alloc(1 << 40, 8).is_none());
  assert!(heap.alloc(heap.capacity() + 1).is_none());

  let all = heap.alloc(heap.capacity()).expect("the whole capacity is one block");
  assert!(heap.alloc(1).is_none());
  unsafe { heap.free(all) };
  assert!(heap.validate());
}

#[test]
fn aligned_alloc_honours_every_power_of_two() {
  for width in [HeaderWidth::Small, HeaderWidth::Big] {
    let mut mem = Mem::<8192>::new();
    let mut heap = Heap::with_width(&mut mem.0, width).unwrap();

    let mut live = Vec::new();
    for shift in 0..9 {
      let align = 1usize << shift;
      for bytes in [1, 7, 24, 100] {
        let p = heap.aligned_alloc(align, bytes).unwrap();
        assert_eq!(p.as_ptr() as usize % align, 0, "align {align} bytes {bytes}");
        let usable = unsafe { heap.usable_size(p) };
        assert!(usable >= bytes);
        fill(p, usable);
        assert!(heap.validate());
        live.push((p, usable));
      }
    }

    for &(p, usable) in &live {
      assert!(check(p, usable, p, usable), "block at {p:p} was overwritten");
    }
    for (p, _) in live {
      unsafe { heap.free(p) };
      assert!(heap.validate());
    }
    assert_fully_coalesced(&heap);
  }
}

#[test]
fn aligned_alloc_rejects_non_power_of_two() {
  let mut mem = Mem::<1024>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();
  assert!(heap.aligned_alloc(0, 16).is_none());
  assert!(heap.aligned_alloc(24, 16).is_none());
  assert!(unsafe { heap.aligned_realloc(None, 48, 16) }.is_none());
  assert!(heap.validate());
}

#[test]
fn aligned_realloc_stays_put_when_alignment_already_holds() {
  let mut mem = Mem::<8192>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  let p = heap.aligned_alloc(256, 32).unwrap();
  fill(p, 32);

  // 128 divides 256: growing into the free space after the block needs no move.
  let q = unsafe { heap.aligned_realloc(Some(p), 128, 200) }.unwrap();
  assert_eq!(q, p);
  let r = unsafe { heap.aligned_realloc(Some(q), 256, 16) }.unwrap();
  assert_eq!(r, p);
  assert!(check(r, 16, p, 32));
  assert!(heap.validate());
}

#[test]
fn aligned_realloc_moves_for_a_stricter_alignment() {
  let mut mem = Mem::<8192>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();

  let mut keep = Vec::new();
  let p = loop {
    let p = heap.aligned_alloc(64, 40).unwrap();
    if p.as_ptr() as usize % 512 != 0 {
      break p;
    }
    keep.push(p);
  };
  fill(p, 40);

  let q = unsafe { heap.aligned_realloc(Some(p), 512, 40) }.unwrap();
  assert_ne!(q, p);
  assert_eq!(q.as_ptr() as usize % 512, 0);
  assert!(check(q, 40, p, 40));
  assert!(heap.validate());

  unsafe { heap.free(q) };
  for p in keep {
    unsafe { heap.free(p) };
  }
  assert_fully_coalesced(&heap);
}

#[test]
fn stats_track_allocation_levels() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();
  let capacity = heap.capacity();

  let a = heap.alloc(100).unwrap();
  let b = heap.alloc(300).unwrap();
  let used = unsafe { heap.usable_size(a) + heap.usable_size(b) };
  let stats = heap.stats();
  assert_eq!(stats.allocated_bytes, used);
  assert_eq!(stats.free_bytes + stats.allocated_bytes, capacity);
  assert_eq!(stats.max_allocated_bytes, used);

  unsafe { heap.free(b) };
  let stats = heap.stats();
  assert_eq!(stats.allocated_bytes, unsafe { heap.usable_size(a) });
  assert_eq!(stats.max_allocated_bytes, used);

  heap.reset_max_allocated();
  assert_eq!(heap.stats().max_allocated_bytes, heap.stats().allocated_bytes);

  unsafe { heap.free(a) };
  assert_eq!(heap.stats().allocated_bytes, 0);
  assert_eq!(heap.stats().free_bytes, capacity);
}

#[test]
fn free_bytes_is_capacity_minus_allocations() {
  let mut mem = Mem::<4096>::new();
  let mut heap = Heap::with_width(&mut mem.0, HeaderWidth::Big).unwrap();
  let hdr = heap.header_bytes();

  let a = heap.alloc(10).unwrap();
  let stats = heap.stats();
  assert_eq!(stats.free_bytes, heap.capacity() - stats.allocated_bytes);
  // The split-off remainder spends one header of that on itself.
  let census = heap.bucket_census();
  let remainder = census.iter().map(|b| b.largest_chunks).max().unwrap();
  assert_eq!(remainder * CHUNK_UNIT - hdr, stats.free_bytes - hdr);

  let mut live = vec![a];
  for align in [64, 256, 1024] {
    live.push(heap.aligned_alloc(align, 24).unwrap());
    let stats = heap.stats();
    assert_eq!(stats.free_bytes + stats.allocated_bytes, heap.capacity());
  }
  for p in live {
    unsafe { heap.free(p) };
  }
  assert_fully_coalesced(&heap);
}

#[test]
fn init_rejects_undersized_buffers() {
  let mut mem = Mem::<16>::new();
  let err = Heap::new(&mut mem.0).unwrap_err();
  assert!(matches!(err, HeapError::TooSmall { bytes: 16, .. }), "{err}");

  let mut empty: [u8; 0] = [];
  assert!(matches!(Heap::new(&mut empty), Err(HeapError::TooSmall { .. })));
}

#[test]
fn misaligned_buffers_are_trimmed() {
  let mut mem = Mem::<1024>::new();
  let mut heap = Heap::new(&mut mem.0[3..1001]).unwrap();
  assert!(heap.validate());
  let p = heap.alloc(64).unwrap();
  assert!(heap.contains(p.as_ptr()));
  assert_eq!(p.as_ptr() as usize % CHUNK_UNIT, heap.header_bytes() % CHUNK_UNIT);
  unsafe { heap.free(p) };
  assert_fully_coalesced(&heap);
}

#[test]
fn contains_only_the_allocatable_region() {
  let mut mem = Mem::<1024>::new();
  let start = mem.0.as_ptr();
  let heap = Heap::new(&mut mem.0).unwrap();
  assert!(!heap.contains(start));
  assert!(!heap.contains(start.wrapping_add(1024)));
}

#[test]
fn log_info_walks_the_heap() {
  init_logger();
  let mut mem = Mem::<2048>::new();
  let mut heap = Heap::new(&mut mem.0).unwrap();
  let a = heap.alloc(10).unwrap();
  let _b = heap.alloc(300).unwrap();
  unsafe { heap.free(a) };

  heap.log_info(true);
  let census = heap.bucket_census();
  assert_eq!(census.iter().map(|b| b.count).sum::<usize>(), 2);
  for bucket in census.iter().filter(|b| b.count > 0) {
    assert!(bucket.largest_chunks >= bucket.min_chunks);
  }
}
