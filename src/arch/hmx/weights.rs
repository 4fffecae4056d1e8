//! Weight stream loading into the weight cache.
//!
//! Plain streams hold one 32-bit word per output channel per row. Compressed
//! streams carry a 128-byte metadata bitmap after the first row and a dense
//! payload split across eight 16-byte lanes.

use std::io;

use log::{debug, trace};

use super::memory::Memory;
use super::observer::{ObserverSlot, WeightRecord};
use super::params::{COLS, WGT_CACHE_MAX};
use super::state::{AcceleratorState, Grid, WeightEntry};
use super::types::Unpack;

const ROW_MASK: u64 = 4 * COLS as u64 - 1;
const LANES: usize = COLS / 4;
const VECTORS: usize = 8;

/// Packing of one weight stream
#[derive(Debug, Clone, Copy)]
pub struct StreamShape {
  pub unpack: Unpack,
  pub output_scale: u32,
  /// XOR applied to every 16-bit float weight
  pub negate: u16,
  pub fp_rate: u32,
}

impl StreamShape {
  pub fn weights_per_word(&self) -> u32 {
    self.unpack.weights_per_word()
  }

  /// Cache rows filled per channel by one stream word
  pub fn rows_per_word(&self) -> usize {
    (self.weights_per_word() / self.output_scale.max(1)) as usize
  }
}

fn put(cache: &mut Grid<WeightEntry>, idx: usize, channel: usize, value: u16, addr: u64, observer: &mut ObserverSlot) {
  if let Some(entry) = cache.get_mut(idx, channel) {
    *entry = WeightEntry { wgt: value, valid: true };
    if let Some(obs) = observer.as_mut() {
      obs.on_weight(&WeightRecord {
        stream_idx: idx,
        channel,
        value,
        addr,
      });
    }
  }
}

/// Unpack one stream word for `channel` into cache rows from `idx` on.
pub fn unpack_word(
  cache: &mut Grid<WeightEntry>,
  shape: &StreamShape,
  raw: u32,
  channel: usize,
  idx: usize,
  addr: u64,
  observer: &mut ObserverSlot,
) {
  if shape.weights_per_word() == 2 {
    for k in 0..2 {
      let value = ((raw >> (16 * k)) & 0xFFFF) as u16 ^ shape.negate;
      put(cache, idx + k, channel, value, addr, observer);
    }
    return;
  }

  let stride = (32 / shape.weights_per_word()) as usize;
  let (mut lo, mut hi) = (idx, idx);
  for shift in (0..8).step_by(stride) {
    for byte in (0..32).step_by(8) {
      let packed = (raw >> byte) as u8 as i8;
      let value = shape.unpack.apply(packed, shift as u32) as i16 as u16;
      if shape.output_scale == 2 && shift == 4 {
        put(cache, hi, channel + COLS, value, addr, observer);
        hi += 1;
      } else {
        put(cache, lo, channel, value, addr, observer);
        lo += 1;
      }
    }
  }
}

/// Fill the weight cache from the stream described by the geometry.
///
/// Returns the first cache row left unfilled. Every row from there on is
/// invalid, except for the float zero padding up to the next rate boundary.
pub fn load_weights(
  state: &mut AcceleratorState,
  shape: &StreamShape,
  mem: &mut dyn Memory,
  observer: &mut ObserverSlot,
) -> io::Result<usize> {
  let start = state.geometry.wgt_addr;
  let end = state.geometry.wgt_end;
  let compressed = state.geometry.compressed;
  let total = state.geometry.compressed_bytes as usize + 1;
  let rows = shape.rows_per_word();
  debug!(
    "[WGT] load {:#x}..={:#x} unpack={:?} scale={} compressed={}",
    start, end, shape.unpack, shape.output_scale, compressed
  );

  let mut idx = 0usize;
  let mut addr = start;
  let mut block = 0usize;
  while addr <= end {
    if compressed {
      let metadata = load_metadata(mem, addr, end)?;
      decompress_block(state, shape, mem, &metadata, addr, end, block, total, observer)?;
      idx = ((block * VECTORS + VECTORS - 1) * rows).min(WGT_CACHE_MAX - 1);
      block += 1;
      addr = ((addr + (total as u64) * 8) & !ROW_MASK) + ROW_MASK + 1;
    } else {
      for channel in 0..COLS {
        let raw = mem.read4(addr)?;
        unpack_word(&mut state.weight_cache, shape, raw, channel, idx, addr, observer);
        addr += 4;
      }
    }
    idx += rows;
  }

  if shape.weights_per_word() == 2 {
    let pad_mask = if shape.fp_rate == 8 { 1 } else { 3 };
    while idx & pad_mask != 0 && idx < WGT_CACHE_MAX {
      for channel in 0..COLS {
        state.weight_cache[(idx, channel)] = WeightEntry { wgt: 0, valid: true };
      }
      idx += 1;
    }
  }

  trace!("[WGT] invalidating rows {}..{}", idx, WGT_CACHE_MAX);
  state.invalidate_weights(idx, COLS * shape.output_scale.max(1) as usize);
  Ok(idx)
}

/// Metadata bitmap of one compressed block, laid out `[vector * 16 + k]`
/// where bit `b` of entry `k` covers payload byte `k * 8 + b`.
///
/// The block holding the last stream row has no metadata and takes every
/// byte.
fn load_metadata(mem: &mut dyn Memory, addr: u64, end: u64) -> io::Result<[u8; 128]> {
  let mut metadata = [0u8; 128];
  if addr == end & !ROW_MASK {
    metadata.fill(0xFF);
    return Ok(metadata);
  }

  let base = addr + 4 * COLS as u64;
  let mut transpose = [0u8; 128];
  for (i, chunk) in transpose.chunks_mut(4).enumerate() {
    let word = mem.read4(base + 4 * i as u64)?;
    chunk.copy_from_slice(&word.to_le_bytes());
  }
  for (byte_idx, bits) in transpose.iter().enumerate() {
    for vector in 0..VECTORS {
      if (bits >> vector) & 1 != 0 {
        metadata[vector * 16 + byte_idx / 8] |= 1 << (byte_idx & 7);
      }
    }
  }
  Ok(metadata)
}

#[allow(clippy::too_many_arguments)]
fn decompress_block(
  state: &mut AcceleratorState,
  shape: &StreamShape,
  mem: &mut dyn Memory,
  metadata: &[u8; 128],
  addr: u64,
  end: u64,
  block: usize,
  total: usize,
  observer: &mut ObserverSlot,
) -> io::Result<()> {
  let rows = shape.rows_per_word();
  // payload offset and bytes taken, per lane
  let mut offset = [0u64; LANES];
  let mut taken = [0usize; LANES];

  for vector in 0..VECTORS {
    let idx = ((block * VECTORS + vector) * rows).min(WGT_CACHE_MAX - 1);
    for lane in 0..LANES {
      let lane_addr = addr + 16 * lane as u64;
      for half in 0..2 {
        let bits = metadata[16 * vector + 2 * lane + half];
        let mut word = 0u32;
        for bit in 0..8 {
          let data_addr = lane_addr + offset[lane];
          let mut byte = 0u8;
          if (bits >> bit) & 1 != 0 && taken[lane] < total {
            let raw = if data_addr > end { 0 } else { mem.read4(data_addr & !3)? };
            byte = (raw >> ((offset[lane] & 3) * 8)) as u8;
            offset[lane] += 1;
            if offset[lane] & 0xF == 0 {
              // skip the metadata after the first row, then the other lanes
              if offset[lane] == 16 {
                offset[lane] += 128;
              }
              offset[lane] += 112;
            }
            taken[lane] += 1;
          }
          word |= u32::from(byte) << ((bit & 3) * 8);
          if bit & 3 == 3 {
            let channel = lane * 4 + half * 2 + bit / 4;
            unpack_word(&mut state.weight_cache, shape, word, channel, idx, data_addr, observer);
            word = 0;
          }
        }
      }
    }
  }
  Ok(())
}
