#![allow(dead_code)]

use std::ptr::NonNull;

/// Buffer with a known alignment, so chunk arithmetic in tests is exact.
#[repr(C, align(16))]
pub struct Mem<const N: usize>(pub [u8; N]);

impl<const N: usize> Mem<N> {
  pub fn new() -> Box<Self> {
    Box::new(Self([0; N]))
  }
}

pub fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

/// Byte `i` of the pattern owned by the block at `addr` of `size` bytes.
fn pattern_byte(addr: usize, size: usize, i: usize) -> u8 {
  let key = (addr ^ size.rotate_left(17)) as u64 ^ i as u64;
  (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 56) as u8
}

pub fn fill(ptr: NonNull<u8>, size: usize) {
  let addr = ptr.as_ptr() as usize;
  let block = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
  for (i, byte) in block.iter_mut().enumerate() {
    *byte = pattern_byte(addr, size, i);
  }
}

/// Checks the first `len` bytes at `at` against the pattern written by
/// `fill(owner, owner_size)`.
pub fn check(at: NonNull<u8>, len: usize, owner: NonNull<u8>, owner_size: usize) -> bool {
  let addr = owner.as_ptr() as usize;
  let block = unsafe { std::slice::from_raw_parts(at.as_ptr(), len) };
  block
    .iter()
    .enumerate()
    .all(|(i, &byte)| byte == pattern_byte(addr, owner_size, i))
}
