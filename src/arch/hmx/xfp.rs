//! Extended floating-point arithmetic.
//!
//! Half-precision products are widened into a signed fixed-point significand
//! with a separate unbiased exponent and status flags. Sums are kept in that
//! form and only rounded once, when a convert packs the result back into a
//! 16-bit encoding.

use serde::{Deserialize, Serialize};

use super::int128::{asr64, leading_ones64, low_mask, ones_from, shl64, shlu64, shru64};
use super::params::AcceleratorParams;
use super::regs::{CvtRs, FloatBias, FpPolicy};

pub const INF_NONE: u8 = 0;
pub const INF_POS: u8 = 1;
pub const INF_NEG: u8 = 2;
pub const NAN: u8 = 3;

pub const FP16_POS_INF: u32 = 0x7C000;
pub const FP16_NEG_INF: u32 = 0xFC000;
pub const BF16_POS_INF: u32 = 0x7F800;
pub const BF16_NEG_INF: u32 = 0xFF800;
pub const FP_POS_ZERO: u32 = 0x00000;
pub const FP_NEG_ZERO: u32 = 0x80000;
pub const FP_NAN: u32 = 0xFFFFF;

/// Sign, exponent and mantissa widths of a packed encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactFormat {
  pub frac: u32,
  pub exp: u32,
}

impl CompactFormat {
  pub const FP16: Self = Self { frac: 10, exp: 5 };
  pub const BF16: Self = Self { frac: 7, exp: 8 };

  pub fn widened(self, extra: u32) -> Self {
    Self { frac: self.frac + extra, exp: self.exp }
  }
}

/// Integer, fraction and exponent widths of an extended value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfpFormat {
  pub int: i32,
  pub frac: i32,
  pub exp: i32,
}

impl XfpFormat {
  pub const fn new(int: i32, frac: i32, exp: i32) -> Self {
    Self { int, frac, exp }
  }

  pub fn bits(&self) -> i32 {
    self.int + self.frac
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfpStatus {
  pub zero: bool,
  /// One of `INF_NONE`, `INF_POS`, `INF_NEG` or `NAN`
  pub inf: u8,
  pub negative: bool,
  pub under: bool,
  pub in0_zero: bool,
  pub in1_zero: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xfp {
  pub status: XfpStatus,
  pub exp: i32,
  pub sig: i64,
  pub fmt: XfpFormat,
  /// Anticipated normalization shift from the last two-input add
  pub lza: u8,
}

impl Xfp {
  fn blank(fmt: XfpFormat) -> Self {
    Self { fmt, ..Default::default() }
  }

  /// Sign as seen by rounding: zeros carry their flag, everything else
  /// also looks at the significand
  fn sign(&self) -> bool {
    if self.status.zero {
      self.status.negative
    } else {
      self.sig < 0 || self.status.negative
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct ExpRange {
  min: i32,
  max: i32,
}

impl ExpRange {
  fn of(bits: i32) -> Self {
    let min = -(1i32 << (bits - 1));
    Self { min, max: -min - 1 }
  }
}

fn shift_amount(base: i32, rel: i32) -> u32 {
  (base - rel).unsigned_abs().min(63)
}

/// Leading-zero anticipation over two aligned addends.
fn anticipate_zeros(a: i64, b: i64, msb_bit: u32) -> u8 {
  let p = a ^ b;
  let g = a & b;
  let z = !(a | b);
  let msb = 1i64 << msb_bit;
  let zeros = p ^ !(z << 1);
  let ones = p ^ !(g << 1);
  let pick = |v: i64| if v & msb != 0 { v } else { !v };
  let lza_z = ones_from(pick(zeros) as u32, msb_bit) as i32 - 1;
  let lza_o = ones_from(pick(ones) as u32, msb_bit) as i32 - 1;
  let lza = if msb & z != 0 {
    lza_z
  } else if msb & g != 0 {
    lza_o
  } else {
    lza_z.max(lza_o)
  };
  lza as u8
}

/// Arithmetic unit configured for one accelerator build.
#[derive(Debug, Clone, Copy)]
pub struct XfpUnit {
  pub acc: XfpFormat,
  pub acc_norm: i32,
  pub cvt_int: i32,
  pub cvt_frac: i32,
  pub inexact: bool,
  pub fp_present: bool,
}

impl XfpUnit {
  /// Operand format of a half-precision multiply
  pub const MULT_IN: XfpFormat = XfpFormat::new(3, 9, 8);

  pub fn new(params: &AcceleratorParams) -> Self {
    Self {
      acc: XfpFormat::new(params.fp_acc_int, params.fp_acc_frac, params.fp_acc_exp),
      acc_norm: params.fp_acc_norm,
      cvt_int: params.xfp_cvt_int,
      cvt_frac: params.xfp_cvt_frac,
      inexact: params.xfp_inexact_enable,
      fp_present: params.fp_present,
    }
  }

  /// Right shift that ORs any discarded bits into the lsb.
  pub fn rsi(&self, x: i64, shift: u32) -> i64 {
    let mask = if self.inexact { low_mask(shift) as i64 } else { 0 };
    asr64(x, shift) | i64::from(x & mask != 0)
  }

  /// A true zero in accumulator format
  pub fn zero(&self) -> Xfp {
    self.from_compact(0, CompactFormat::FP16, self.acc, false, FpPolicy::default())
  }

  pub fn from_compact(
    &self,
    bits: u32,
    input: CompactFormat,
    out: XfpFormat,
    normalize: bool,
    policy: FpPolicy,
  ) -> Xfp {
    let exp_max = (1u32 << input.exp) - 1;
    let exp_bias = 1i32 << (input.exp - 1);
    let range = ExpRange::of(out.exp);

    let raw_exp = (bits >> input.frac) & exp_max;
    let frac = bits & ((1u32 << input.frac) - 1);
    let sign = (bits >> (input.exp + input.frac)) & 1 != 0;
    let denorm = raw_exp < 1;

    let mut x = Xfp::blank(out);
    x.exp = raw_exp as i32 - exp_bias + i32::from(raw_exp == 0);
    let mut mag = (u64::from(!denorm) << input.frac) | u64::from(frac);
    if normalize && denorm {
      let shift = shlu64(mag, 64 - (input.frac + 1)).leading_zeros();
      mag = shlu64(mag, shift);
      x.exp -= shift as i32;
    }

    let sig = if sign { -(mag as i64) } else { mag as i64 };
    let shift = (out.int + out.frac - 2 - input.frac as i32).max(0);
    x.sig = shl64(sig, shift as u32);

    let top = raw_exp == exp_max;
    let inf = if top && frac == 0 {
      if sign {
        INF_NEG
      } else {
        INF_POS
      }
    } else {
      INF_NONE
    };
    let nan = if top && frac != 0 { NAN } else { INF_NONE };

    x.status.zero = raw_exp == 0 && frac == 0;
    x.status.inf = if policy.inf_nan_enable { inf | nan } else { INF_NONE };
    x.status.negative = !x.status.zero && sign;
    if x.status.zero {
      x.exp = range.min;
    }
    x
  }

  /// Round to nearest even and pack.
  ///
  /// The result is 20 bits wide. Without `fp_rnd` the 16-bit encoding sits
  /// in the upper bits and the low nibble is zero; with it the mantissa keeps
  /// four extra bits. A clear `relu` maps every negative result to +0.
  pub fn to_compact(&self, x: &Xfp, fp_frac: u32, fp_exp: u32, rs: CvtRs, policy: FpPolicy) -> u32 {
    let hf16 = fp_exp == 5;
    let relu = rs.relu();
    let range = ExpRange::of(fp_exp as i32);

    let tmp = shl64(x.sig, (64 - x.fmt.bits()) as u32);
    let mut mag = tmp.unsigned_abs();
    let mut exp = x.exp;
    let mut zero = false;
    if mag != 0 {
      let shift = mag.leading_zeros();
      mag = shlu64(mag, shift);
      exp -= shift as i32;
      exp += x.fmt.int - 2;
    } else {
      zero = true;
    }

    let overflow = exp >= range.max;
    let underflow = exp <= range.min;
    let unrecoverable = exp < range.min - fp_frac as i32;
    let sign = x.sign();
    let pos_inf = if hf16 { FP16_POS_INF } else { BF16_POS_INF };
    let neg_inf = if hf16 { FP16_NEG_INF } else { BF16_NEG_INF };
    let signed_zero = || if sign && relu { FP_NEG_ZERO } else { FP_POS_ZERO };

    if x.status.inf == NAN {
      if !relu && !policy.nan_propagate {
        return FP_POS_ZERO;
      }
      return FP_NAN;
    } else if x.status.inf != INF_NONE {
      if x.status.inf == INF_NEG {
        return if relu { neg_inf } else { FP_POS_ZERO };
      }
      return pos_inf;
    } else if overflow && !zero {
      if sign {
        return if relu { neg_inf } else { FP_POS_ZERO };
      }
      return pos_inf;
    } else if x.status.zero || zero || x.status.under {
      return signed_zero();
    }

    if underflow {
      mag = shru64(mag, (range.min - exp + 1) as u32);
    }

    let ulp_bit = 63 - fp_frac;
    let grd_bit = ulp_bit - 1;
    let sticky = mag & low_mask(grd_bit) != 0;
    let grd = (mag >> grd_bit) & 1 != 0;
    let ulp = (mag >> ulp_bit) & 1 != 0;
    let rnd = if ulp { grd } else { sticky && grd };
    let mut mantissa = (mag.wrapping_add(u64::from(rnd) << grd_bit) >> ulp_bit) as u32 & 0xFFFF;

    let exp_bias = 1i32 << (fp_exp - 1);
    let mut fp_exponent = if underflow { -exp_bias } else { exp };
    if underflow {
      if mantissa & (1 << fp_frac) != 0 && !unrecoverable {
        fp_exponent = -exp_bias + 1;
      } else if unrecoverable {
        return signed_zero();
      }
    } else if mantissa == 0 {
      fp_exponent = (fp_exponent + 1).min(range.max);
    }

    mantissa &= (1 << fp_frac) - 1;
    let fp_exponent = ((fp_exponent + exp_bias) as u32) & ((1 << fp_exp) - 1);
    let sign_bit = 15 + 4 * rs.fp_rnd();
    let mut out = (u32::from(sign) << sign_bit) | (fp_exponent << fp_frac) | mantissa;
    if rs.fp_rnd() == 0 {
      out <<= 4;
    }
    if sign && !relu {
      return FP_POS_ZERO;
    }
    out
  }

  /// Renormalize an adder result back into `out`, shifting by at most the
  /// configured normalization limit.
  pub fn normalize(&self, x: &Xfp, out: XfpFormat, use_lza: bool) -> Xfp {
    let range = ExpRange::of(out.exp);
    let extra = x.fmt.int - out.int;
    let mut exp = x.exp + extra;
    let mut sig = x.sig;
    if extra > 0 {
      sig = self.rsi(sig, extra as u32);
    } else if extra < 0 {
      sig = shl64(sig, (-extra) as u32);
    }

    let bits = out.int + x.fmt.frac;
    let temp = shl64(sig, (64 - bits) as u32);
    let lead = if x.status.negative && temp != 0 { temp } else { !temp };
    let wanted = if use_lza { i32::from(x.lza) } else { leading_ones64(lead) as i32 - 1 };
    let mut shift = wanted.clamp(0, self.acc_norm.max(0));
    let headroom = (exp - shift) - range.min;
    if headroom < 0 {
      shift += headroom;
    }
    let shift = shift.max(0);

    let mut y = Xfp::blank(out);
    y.sig = asr64(shl64(temp, shift as u32), (64 - bits) as u32);
    exp -= shift;
    y.status.zero = x.status.zero;
    y.status.inf = x.status.inf;
    y.status.negative = x.status.negative;
    if exp > range.max {
      if y.status.inf == INF_NONE {
        y.status.inf = if y.status.negative { INF_NEG } else { INF_POS };
      }
      exp = range.max;
    }
    y.exp = exp;
    y
  }

  /// Full normalization used on the convert path, narrowing to `out`.
  pub fn cvt_normalize(&self, x: &Xfp, out: XfpFormat) -> Xfp {
    let range = ExpRange::of(out.exp);
    let in_bits = x.fmt.bits();
    let out_bits = out.bits();
    let mut y = Xfp::blank(out);

    if x.sig == 0 {
      y.exp = x.exp - (in_bits - 1) + (x.fmt.int - out.int);
      y.status.zero = x.status.zero;
      y.status.under = x.status.inf == INF_NONE;
      y.status.inf = x.status.inf;
      y.status.negative = x.status.negative;
      return y;
    }

    let neg = x.sig < 0;
    let top = shl64(x.sig, (64 - in_bits) as u32);
    let lead = if neg { top } else { !top };
    let shift = (leading_ones64(lead) as i32 - 1).max(0);
    let normalized = asr64(shl64(top, shift as u32), (64 - in_bits) as u32);

    let narrow = in_bits - out_bits;
    y.sig = if narrow >= 0 {
      self.rsi(normalized, narrow as u32)
    } else {
      shl64(normalized, (-narrow) as u32)
    };
    y.exp = x.exp - shift + (x.fmt.int - out.int);
    y.status.zero = x.status.zero;
    y.status.inf = x.status.inf;
    y.status.negative = x.status.negative;

    if y.exp > range.max {
      if y.status.inf == INF_NONE {
        y.status.inf = if y.status.negative { INF_NEG } else { INF_POS };
      }
      y.exp = range.max;
    } else if y.exp < range.min && y.status.inf == INF_NONE {
      y.exp = range.min;
      y.status.under = true;
    }
    y
  }

  /// Two-operand add, one integer bit wider than `a`.
  pub fn add(&self, a: &Xfp, b: &Xfp) -> Xfp {
    let mut a = *a;
    let mut b = *b;
    let mut out = Xfp::blank(XfpFormat::new(a.fmt.int + 1, a.fmt.frac, a.fmt.exp));

    let a_neg = if a.status.zero || a.status.inf != 0 { a.status.negative } else { a.sig < 0 };
    let b_neg = if b.status.zero || b.status.inf != 0 { b.status.negative } else { b.sig < 0 };
    let zero_sign = a.sig == 0 && b.sig == 0 && a.status.negative && b.status.negative;
    let inf = a.status.inf | b.status.inf;

    if a.status.under {
      a.exp = ExpRange::of(a.fmt.exp).min;
    }
    if b.status.under {
      b.exp = ExpRange::of(b.fmt.exp).min;
    }

    let delta = a.exp - b.exp;
    let (max_sig, min_sig) = if delta <= 0 { (b.sig, a.sig) } else { (a.sig, b.sig) };
    out.exp = if delta <= 0 { b.exp } else { a.exp };
    let shift = delta.unsigned_abs().min(63);

    out.sig = max_sig.wrapping_add(self.rsi(min_sig, shift));
    out.status.inf = inf;
    out.status.under = a.status.under && b.status.under && inf == 0;
    out.status.negative = if inf == 0 {
      (a_neg && b_neg) || zero_sign || out.sig < 0
    } else {
      inf >> 1 != 0
    };
    out
  }

  fn adder(&self, inputs: &[Xfp], extra_bit: u32, fmt: XfpFormat, with_lza: bool) -> Xfp {
    let mut out = Xfp::blank(fmt);
    out.exp = ExpRange::of(fmt.exp).min;

    let mut all_zeros = true;
    let mut all_true_zeros = true;
    let mut any_negative = false;
    let mut inf = INF_NONE;
    for x in inputs {
      all_zeros &= x.sig == 0;
      all_true_zeros &= x.status.zero;
      any_negative |= x.status.negative;
      inf |= x.status.inf;
      out.exp = out.exp.max(x.exp);
    }
    let zero_sign = all_zeros && any_negative;

    let aligned: Vec<i64> =
      inputs.iter().map(|x| self.rsi(x.sig, shift_amount(out.exp, x.exp))).collect();
    let sum = aligned.iter().fold(0i64, |acc, s| acc.wrapping_add(*s));

    if with_lza && aligned.len() >= 2 {
      out.lza = anticipate_zeros(aligned[0], aligned[1], (fmt.frac + fmt.int - 1) as u32);
    }

    out.sig = asr64(sum, extra_bit) | (sum & 1);
    out.status.zero = all_true_zeros;
    out.status.inf = inf;
    out.status.negative = if inf == INF_NONE { zero_sign || out.sig < 0 } else { inf >> 1 != 0 };
    out
  }

  /// Sum a batch of products without intermediate rounding, then fold the
  /// sum into the accumulator using the anticipated normalization shift.
  pub fn n_way_reduce(&self, products: &mut [Xfp], acc: &Xfp) -> Xfp {
    if let Some(first) = products.first() {
      let align = acc.fmt.frac - first.fmt.frac;
      for p in products.iter_mut() {
        p.sig = if align >= 0 { shl64(p.sig, align as u32) } else { asr64(p.sig, (-align) as u32) };
        p.fmt.frac += align;
      }
    }
    let stage1 = self.adder(products, 0, acc.fmt, false);
    let wide = XfpFormat::new(acc.fmt.int + 1, acc.fmt.frac, acc.fmt.exp);
    let stage2 = self.adder(&[*acc, stage1], 0, wide, true);
    self.normalize(&stage2, acc.fmt, true)
  }

  /// Fold one batch of products into an accumulator. With inf/NaN handling
  /// off, a batch whose every activation or every weight was zero leaves
  /// the accumulator untouched.
  pub fn mac_reduce(&self, products: &mut [Xfp], acc: &Xfp, policy: FpPolicy) -> Xfp {
    if !policy.inf_nan_enable {
      let all_in0 = products.iter().all(|p| p.status.in0_zero);
      let all_in1 = products.iter().all(|p| p.status.in1_zero);
      if all_in0 || all_in1 {
        return *acc;
      }
    }
    self.n_way_reduce(products, acc)
  }

  pub fn multiply(&self, a: &Xfp, b: &Xfp, exp_out: i32, policy: FpPolicy) -> Xfp {
    let mut out = Xfp::blank(XfpFormat::new(2 * a.fmt.int - 1, 2 * a.fmt.frac, exp_out));
    out.sig = a.sig.wrapping_mul(b.sig);
    out.exp = a.exp + b.exp;
    out.status.zero = a.status.zero || b.status.zero;
    out.status.negative = a.status.negative != b.status.negative;
    out.status.under = a.status.under || b.status.under;

    let inf_a = a.status.inf == INF_POS || a.status.inf == INF_NEG;
    let inf_b = b.status.inf == INF_POS || b.status.inf == INF_NEG;
    let z_a = a.sig == 0;
    let z_b = b.sig == 0;
    out.status.in0_zero = z_a || a.status.zero;
    out.status.in1_zero = z_b || b.status.zero;

    let signed_inf = if out.status.negative { INF_NEG } else { INF_POS };
    let invalid = if policy.nan_propagate { NAN } else { INF_NONE };
    if a.status.inf == NAN || b.status.inf == NAN {
      out.status.inf = invalid;
    } else if out.status.under && (inf_a || inf_b) {
      out.status.inf = invalid;
    } else if inf_a && inf_b {
      out.status.inf = signed_inf;
    } else if (inf_a && z_b) || (inf_b && z_a) {
      out.status.inf = invalid;
      out.status.zero = !policy.nan_propagate;
    } else if inf_a || inf_b {
      out.status.inf = signed_inf;
    }

    if out.status.zero {
      out.exp = ExpRange::of(exp_out).min;
      out.sig = 0;
    } else if z_a || z_b {
      out.exp = ExpRange::of(exp_out).min;
      out.sig = 0;
      out.status.negative = false;
    }
    out
  }

  /// Minimum (`max == false`) or maximum of two values.
  pub fn cmp(&self, a: &Xfp, b: &Xfp, max: bool, policy: FpPolicy) -> Xfp {
    let (x, y) = if max { (*b, *a) } else { (*a, *b) };

    if a.status.inf != 0 || b.status.inf != 0 {
      if a.status.inf == NAN {
        return if policy.nan_propagate { *a } else { *b };
      } else if b.status.inf == NAN {
        return if policy.nan_propagate { *b } else { *a };
      }
      if a.status.inf == INF_NEG {
        return x;
      } else if b.status.inf == INF_NEG {
        return y;
      }
      return if a.status.inf == INF_POS { y } else { x };
    }

    let neg_a = a.sig < 0;
    let neg_b = b.sig < 0;
    if neg_a != neg_b {
      return if neg_a { x } else { y };
    }
    if a.exp != b.exp {
      let a_smaller_exp = a.exp < b.exp;
      return if neg_a == a_smaller_exp { y } else { x };
    }
    if a.sig <= b.sig {
      x
    } else {
      y
    }
  }

  /// Multiply two 16-bit floating inputs into an extended product.
  pub fn fp_mult(&self, act: u16, wgt: u16, bf16: bool, policy: FpPolicy) -> Xfp {
    if !self.fp_present {
      return self.zero();
    }
    let input = if bf16 { CompactFormat::BF16 } else { CompactFormat::FP16 };
    let policy = FpPolicy { nan_propagate: true, ..policy };
    let a = self.from_compact(u32::from(act), input, Self::MULT_IN, !bf16, policy);
    let b = self.from_compact(u32::from(wgt), input, Self::MULT_IN, !bf16, policy);
    self.multiply(&a, &b, Self::MULT_IN.exp + 1, policy)
  }

  /// Clamp one side of the range to zero before scaling.
  fn shape(&self, x: Xfp, in_shape: u32) -> Xfp {
    let neg = x.sig < 0 || x.status.negative;
    let clear = match in_shape {
      1 => !neg && (x.sig != 0 || x.status.inf != INF_NONE),
      2 => neg,
      _ => false,
    };
    if !clear || x.status.inf == NAN {
      return x;
    }
    let mut y = Xfp::blank(x.fmt);
    y.exp = ExpRange::of(x.fmt.exp).min;
    y.status.zero = true;
    y
  }

  /// Bias, scale and pack one float accumulator.
  ///
  /// `feedback` is the previous 20-bit convert result at this position. It
  /// replaces the scale or the output bias when the control register asks
  /// for it and the min/max selection prefers it.
  pub fn convert(&self, acc: &Xfp, bias: FloatBias, feedback: u32, rs: CvtRs, policy: FpPolicy) -> u32 {
    if !self.fp_present {
      return 0;
    }
    let fp = if rs.fp_type() == 1 { CompactFormat::BF16 } else { CompactFormat::FP16 };
    let decode = FpPolicy::all_enabled();
    let select = FpPolicy { inf_nan_enable: false, nan_propagate: policy.nan_propagate };

    let acc_bias_fmt = XfpFormat::new(self.cvt_int, self.acc.frac, self.acc.exp);
    let acc_bias_bits = (bias.acc_bias() << 5) | bias.acc_bias_extra();
    let acc_bias = self.from_compact(acc_bias_bits, fp.widened(5), acc_bias_fmt, false, decode);

    let wide = fp.widened(4);
    let scale_fmt = XfpFormat::new(self.cvt_int, self.cvt_frac + 1, 8);
    let mut scale = self.from_compact((bias.scale() << 4) | bias.scale_extra(), wide, scale_fmt, false, decode);
    if rs.fb_dst() == 2 {
      let prior = self.from_compact(feedback, wide, scale_fmt, false, decode);
      scale = self.cmp(&scale, &prior, rs.fb_limit(), select);
    }
    scale.fmt.frac -= 1;
    scale.sig >>= 1;

    let biased = self.add(acc, &acc_bias);
    let norm_fmt = XfpFormat::new(self.cvt_int, self.cvt_frac, 8);
    let normalized = self.shape(self.cvt_normalize(&biased, norm_fmt), bias.in_shape());

    scale.fmt.exp += 1;
    let scaled = self.multiply(&normalized, &scale, scale.fmt.exp, decode);

    let out_fmt = XfpFormat::new(self.cvt_int, self.cvt_frac, 8);
    let mut out_bias =
      self.from_compact((bias.out_bias() << 4) | bias.out_bias_extra(), wide, out_fmt, false, decode);
    if rs.fb_dst() == 1 {
      let prior = self.from_compact(feedback, wide, out_fmt, false, decode);
      out_bias = self.cmp(&out_bias, &prior, rs.fb_limit(), select);
    }
    out_bias.sig = shl64(out_bias.sig, (scaled.fmt.frac - out_bias.fmt.frac).max(0) as u32);

    let total = self.add(&scaled, &out_bias);
    self.to_compact(&total, fp.frac + 4 * rs.fp_rnd(), fp.exp, rs, select)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::hmx::regs::BiasReg;

  fn unit() -> XfpUnit {
    XfpUnit::new(&AcceleratorParams::default())
  }

  fn keep_sign() -> CvtRs {
    CvtRs::default().with_relu(true)
  }

  fn half(u: &XfpUnit, bits: u16) -> Xfp {
    u.from_compact(u32::from(bits), CompactFormat::FP16, XfpUnit::MULT_IN, true, FpPolicy::all_enabled())
  }

  fn pack(u: &XfpUnit, x: &Xfp) -> u32 {
    u.to_compact(x, 10, 5, keep_sign(), FpPolicy::all_enabled()) >> 4
  }

  /// The accumulator zero is a true zero at the minimum exponent
  #[test]
  fn test_zero_value() {
    let z = unit().zero();
    assert!(z.status.zero);
    assert_eq!(z.sig, 0);
    assert_eq!(z.exp, -64);
    assert_eq!(z.fmt, XfpFormat::new(8, 22, 7));
  }

  /// Decoding a normal value inserts the hidden bit
  #[test]
  fn test_from_compact_normal() {
    let u = unit();
    let one = half(&u, 0x3C00);
    assert_eq!(one.sig, 1 << 10);
    assert_eq!(one.exp, -1);
    assert!(!one.status.negative);
    let neg = half(&u, 0xBE00);
    assert_eq!(neg.sig, -(0x600));
    assert!(neg.status.negative);
  }

  /// Denormals are left-normalized when requested
  #[test]
  fn test_from_compact_denormal() {
    let u = unit();
    let d = half(&u, 0x0001);
    assert_eq!(d.sig, 1 << 10);
    assert_eq!(d.exp, -15 - 10);
    let raw = u.from_compact(1, CompactFormat::FP16, XfpUnit::MULT_IN, false, FpPolicy::default());
    assert_eq!(raw.sig, 1);
    assert_eq!(raw.exp, -15);
  }

  /// Inf and NaN are only flagged when the policy enables them
  #[test]
  fn test_special_classification() {
    let u = unit();
    assert_eq!(half(&u, 0x7C00).status.inf, INF_POS);
    assert_eq!(half(&u, 0xFC00).status.inf, INF_NEG);
    assert_eq!(half(&u, 0x7E00).status.inf, NAN);
    let off = u.from_compact(0x7C00, CompactFormat::FP16, XfpUnit::MULT_IN, true, FpPolicy::default());
    assert_eq!(off.status.inf, INF_NONE);
  }

  /// Normal values survive a decode and re-encode
  #[test]
  fn test_round_trip_examples() {
    let u = unit();
    for bits in [0x3C00u16, 0x3555, 0x7BFF, 0x0400, 0xC500, 0xFBFF] {
      assert_eq!(pack(&u, &half(&u, bits)), u32::from(bits), "bits {:04x}", bits);
    }
  }

  /// Special results of the pack step
  #[test]
  fn test_to_compact_specials() {
    let u = unit();
    let all = FpPolicy::all_enabled();
    let inf = half(&u, 0x7C00);
    assert_eq!(u.to_compact(&inf, 10, 5, keep_sign(), all), FP16_POS_INF);
    let ninf = half(&u, 0xFC00);
    assert_eq!(u.to_compact(&ninf, 10, 5, keep_sign(), all), FP16_NEG_INF);
    assert_eq!(u.to_compact(&ninf, 10, 5, CvtRs::default(), all), FP_POS_ZERO);
    let nan = half(&u, 0x7E00);
    assert_eq!(u.to_compact(&nan, 10, 5, CvtRs::default(), all), FP_NAN);
    assert_eq!(u.to_compact(&nan, 10, 5, CvtRs::default(), FpPolicy::default()), FP_POS_ZERO);
    let neg = half(&u, 0xC000);
    assert_eq!(u.to_compact(&neg, 10, 5, CvtRs::default(), all), FP_POS_ZERO);
  }

  /// Exponents align before the significands add
  #[test]
  fn test_add() {
    let u = unit();
    let one = half(&u, 0x3C00);
    let sum = u.add(&one, &one);
    assert_eq!(sum.fmt.int, 4);
    assert_eq!(pack(&u, &sum), 0x4000);
    let two = half(&u, 0x4000);
    assert_eq!(pack(&u, &u.add(&one, &two)), 0x4200);
  }

  /// Products carry double-width fractions
  #[test]
  fn test_fp_mult() {
    let u = unit();
    let p = u.fp_mult(0x3E00, 0x4000, false, FpPolicy::all_enabled());
    assert_eq!(p.fmt, XfpFormat::new(5, 18, 9));
    assert_eq!(pack(&u, &p), 0x4200);
  }

  /// Infinity times zero is invalid, or zero when NaNs are suppressed
  #[test]
  fn test_multiply_inf_zero() {
    let u = unit();
    let inf = half(&u, 0x7C00);
    let zero = half(&u, 0x0000);
    let np = FpPolicy::all_enabled();
    let r = u.multiply(&inf, &zero, 9, np);
    assert_eq!(r.status.inf, NAN);
    assert_eq!(r.sig, 0);
    let quiet = FpPolicy { inf_nan_enable: true, nan_propagate: false };
    let r = u.multiply(&inf, &zero, 9, quiet);
    assert_eq!(r.status.inf, INF_NONE);
    assert!(r.status.zero);
    assert!(r.status.in1_zero);
  }

  /// Min and max pick by sign, then exponent, then significand
  #[test]
  fn test_cmp() {
    let u = unit();
    let p = FpPolicy::default();
    let one = half(&u, 0x3C00);
    let two = half(&u, 0x4000);
    let neg = half(&u, 0xC000);
    assert_eq!(u.cmp(&one, &two, false, p), one);
    assert_eq!(u.cmp(&one, &two, true, p), two);
    assert_eq!(u.cmp(&neg, &one, false, p), neg);
    assert_eq!(u.cmp(&neg, &one, true, p), one);
  }

  /// A full batch of unit products accumulates exactly
  #[test]
  fn test_n_way_reduce() {
    let u = unit();
    let policy = FpPolicy::all_enabled();
    let mut products: Vec<Xfp> = (0..8).map(|_| u.fp_mult(0x3C00, 0x3C00, false, policy)).collect();
    let acc = u.n_way_reduce(&mut products, &u.zero());
    assert_eq!(acc.fmt, u.acc);
    assert_eq!(pack(&u, &acc), 0x4800);
  }

  /// All-zero activations leave the accumulator alone when inf/NaN is off
  #[test]
  fn test_mac_reduce_skips_zero_batch() {
    let u = unit();
    let policy = FpPolicy::default();
    let one = u.from_compact(0x3C00, CompactFormat::FP16, u.acc, false, policy);
    let mut products: Vec<Xfp> = (0..8).map(|_| u.fp_mult(0, 0x3C00, false, policy)).collect();
    assert_eq!(u.mac_reduce(&mut products, &one, policy), one);
  }

  /// Zero accumulator with zero bias converts to +0
  #[test]
  fn test_convert_zero() {
    let u = unit();
    let out = u.convert(&u.zero(), BiasReg::default().float(), 0, CvtRs::default(), FpPolicy::default());
    assert_eq!(out, FP_POS_ZERO);
  }

  /// Leading-zero anticipation is exact or one short
  #[test]
  fn test_anticipate_zeros() {
    assert_eq!(anticipate_zeros(0, 1 << 27, 30), 1);
    assert_eq!(shift_amount(-2, -64), 62);
    assert_eq!(shift_amount(5, 500), 63);
  }
}
