//! Fixed-width integer helpers.
//!
//! Hardware shifts never trap: a shift by the full width or more yields the
//! fill value. Rust shifts panic in that case, so every variable shift in
//! the engine goes through these.

/// Left shift with zero fill, discarding bits shifted out.
#[inline]
pub fn shl64(x: i64, n: u32) -> i64 {
  x.checked_shl(n).unwrap_or(0)
}

/// Logical left shift on an unsigned word.
#[inline]
pub fn shlu64(x: u64, n: u32) -> u64 {
  x.checked_shl(n).unwrap_or(0)
}

/// Arithmetic right shift, saturating to the sign fill.
#[inline]
pub fn asr64(x: i64, n: u32) -> i64 {
  if n >= 64 {
    x >> 63
  } else {
    x >> n
  }
}

/// Logical right shift on an unsigned word.
#[inline]
pub fn shru64(x: u64, n: u32) -> u64 {
  x.checked_shr(n).unwrap_or(0)
}

/// Mask of the low `n` bits.
#[inline]
pub fn low_mask(n: u32) -> u64 {
  if n >= 64 {
    u64::MAX
  } else {
    (1u64 << n) - 1
  }
}

/// Widening signed multiply.
#[inline]
pub fn mul_wide(a: i64, b: i64) -> i128 {
  i128::from(a) * i128::from(b)
}

/// Zero-extend a 64-bit pattern into the low half of a 128-bit value.
#[inline]
pub fn from_lo(x: i64) -> i128 {
  i128::from(x as u64)
}

/// Sign-extend a 64-bit value.
#[inline]
pub fn from_i64(x: i64) -> i128 {
  i128::from(x)
}

/// Arithmetic right shift of a 128-bit value.
#[inline]
pub fn asr128(x: i128, n: u32) -> i128 {
  if n >= 128 {
    x >> 127
  } else {
    x >> n
  }
}

/// Keep the low 64 bits.
#[inline]
pub fn narrow(x: i128) -> i64 {
  x as i64
}

/// Count of leading ones of a 64-bit pattern.
#[inline]
pub fn leading_ones64(x: i64) -> u32 {
  (x as u64).leading_ones()
}

/// Count of consecutive ones starting at bit `bit` and walking down, over a
/// 32-bit pattern.
pub fn ones_from(src: u32, bit: u32) -> u32 {
  if bit >= 32 {
    return 0;
  }
  let msb = 1u32 << bit;
  let mut s = src;
  let mut count = 0;
  while s & msb != 0 {
    count += 1;
    s <<= 1;
  }
  count
}

/// Leading ones of an 8-bit value.
pub fn leading_ones8(x: u32) -> u32 {
  (x as u8).leading_ones()
}
