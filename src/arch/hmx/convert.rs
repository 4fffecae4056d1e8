//! Accumulator conversion.
//!
//! A convert reads the committed accumulators and the committed bias bank
//! and writes 12-bit fixed codes (or 20-bit float codes) into the spare
//! convert buffer. The buffer reaches memory only at commit.
//!
//! Fixed-point conversion runs in Q31.32: bias, shift by the bias exponent,
//! clip and rectify, multiply by the scale, add the output bias with
//! rounding and saturate to the element range.

use log::{debug, log_enabled, trace, Level};

use super::geometry::OutputTile;
use super::int128::{asr128, from_i64, from_lo, low_mask, mul_wide, narrow, shl64};
use super::observer::{ConvertRecord, ObserverSlot};
use super::operand::CvtOperand;
use super::params::{AcceleratorParams, COLS, ROWS};
use super::regs::{BiasReg, CommitFlags, CvtRs, Feedback, FpPolicy};
use super::state::AcceleratorState;
use super::types::ElementType;
use super::xfp::XfpUnit;

const CVT_WIDTH: u32 = 12;

/// Clamp a converted value to `es` output elements of 12 bits. Without
/// saturation the value is masked instead.
pub fn sat_to_max(x: i64, es: u32, sat: bool) -> u32 {
  let max = (1i64 << (es * CVT_WIDTH)) - 1;
  if sat && x < 0 {
    0
  } else if sat && x > max {
    max as u32
  } else {
    (x & max) as u32
  }
}

/// Shift a biased accumulator by the bias exponent and drop the bits
/// below the fraction.
pub fn acc_shift(biased: i64, exp: u32, sat: bool, frac: u32) -> i64 {
  let shifted = shl64(biased, exp);
  let mut mask = (low_mask(frac + 32) << (32 - frac)) as i64;
  if sat {
    mask |= (0xFFFF_FFFFu64 << 32) as i64;
  }
  shifted & mask
}

/// Collapse the integer part into sign and overflow bits, then apply the
/// 3-bit rectify policy.
pub fn acc_rectify(shifted: i64, zeroing: u32, legacy: bool, biased: i64, es: u32) -> i64 {
  const HIGH: i64 = 0xFFFF_FFFE_0000_0000u64 as i64;
  const OVERFLOW: i64 = 0x2_0000_0000;
  const SIGN: i64 = 0x4_0000_0000;

  let frac = es * CVT_WIDTH;
  let negative = biased < 0;
  let high = shifted & HIGH;
  let overflow = if negative { high == HIGH } else { high != 0 };

  let keep = ((1i64 << (frac + 1)) - 1) << (32 - frac);
  let mut s = shifted & keep;
  if overflow {
    s |= OVERFLOW;
  }
  if negative {
    s |= SIGN;
  }
  if !legacy && s != 0 {
    s |= 1 << (31 - frac);
  }
  if (zeroing >= 4 || (zeroing == 3 && negative)) && !(zeroing == 7 && negative) {
    s &= 0x00FF_FFF0_0000 | keep;
  }
  let s = ((s << 29) >> 29) >> (31 - frac);

  let r = match zeroing {
    1 => s.min(0),
    2 => s.max(0),
    3 if s < 0 => -s - 1,
    3 => s,
    4 if biased != 0 => -s - 1,
    5 if biased < 0 => -s - 1,
    6 if biased > 0 => -s - 1,
    7 if biased != 0 && s >= 0 => -s - 1,
    7 if biased != 0 => s,
    4..=7 => 0,
    _ => s,
  };
  r << (31 - frac)
}

/// Add the output bias at the ulp and drop the fraction.
pub fn acc_bias(scaled: i128, es: u32, out_bias: u32) -> i64 {
  let ulp = 64 - 8 * es - 4;
  let x = scaled.wrapping_add(scaled).wrapping_add(from_lo(shl64(i64::from(out_bias), ulp)));
  narrow(asr128(x, ulp + 4 - (CVT_WIDTH - 8) * es))
}

/// Round at the ulp and drop the fraction.
pub fn acc_rnd(scaled: i128, es: u32, rnd: u32) -> i64 {
  let ulp = 64 - 8 * es - 1;
  let x = scaled.wrapping_add(scaled).wrapping_add(from_i64(shl64(i64::from(rnd), ulp)));
  narrow(asr128(x, ulp + 1 - (CVT_WIDTH - 8) * es))
}

/// Per-element conversion settings taken from a bias slot
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedCvt {
  pub bias32: i64,
  pub exp: u32,
  pub zeroing: u32,
  pub scale: u32,
  /// Output bias, or the rounding bit for 16x8
  pub out_bias: u32,
  pub sat: bool,
  pub legacy: bool,
}

impl FixedCvt {
  fn finish(&self, biased: i64, es: u32, scale_shift: u32) -> i128 {
    let frac = es * CVT_WIDTH;
    let shifted = acc_shift(biased, self.exp, self.sat, frac);
    let rectified = acc_rectify(shifted, self.zeroing, self.legacy, biased, es);
    mul_wide(i64::from(self.scale) << scale_shift, rectified)
  }

  /// 8-bit output from one accumulator
  pub fn u8(&self, acc: i64) -> u32 {
    let biased = acc.wrapping_add(self.bias32);
    let scaled = self.finish(biased, 1, 20);
    sat_to_max(acc_bias(scaled, 1, self.out_bias), 1, self.sat)
  }

  /// 16-bit output from two accumulators weighted 1 and 1/256
  pub fn u16(&self, hl: i64, ll: i64) -> u32 {
    let biased = hl.wrapping_add(ll >> 8).wrapping_add(self.bias32);
    let scaled = self.finish(biased, 2, 20);
    sat_to_max(acc_rnd(scaled, 2, self.out_bias), 2, self.sat)
  }

  /// 16-bit output from four accumulators of a 16x16 product
  pub fn u16x16(&self, hh: i64, hl: i64, lh: i64, ll: i64, bias48: i64) -> u32 {
    let bias48 = (bias48 << 16) >> 16;
    let combined = ll.wrapping_add(lh.wrapping_add(hl).wrapping_add(hh << 8) << 8);
    let biased = combined.wrapping_add(bias48) >> 16;
    let scaled = self.finish(biased, 2, 10);
    sat_to_max(acc_bias(scaled, 2, self.out_bias), 2, self.sat)
  }
}

/// Replace a bias parameter by the previous result when feedback targets it
fn poly_select(rs: CvtRs, target: Feedback, current: u32, feedback: u32) -> u32 {
  if rs.feedback() != target {
    current
  } else if rs.fb_limit() {
    current.max(feedback)
  } else {
    current.min(feedback)
  }
}

fn lo12(v: u32) -> u32 {
  v & 0xFFF
}

fn hi12(v: u32) -> u32 {
  (v >> 8) & 0xFF0
}

struct Converter<'a> {
  state: &'a mut AcceleratorState,
  params: &'a AcceleratorParams,
  unit: &'a XfpUnit,
  observer: &'a mut ObserverSlot,
  op: &'a CvtOperand,
  work: usize,
  bank: usize,
  sel: usize,
  sat: bool,
  usr: FpPolicy,
}

impl Converter<'_> {
  /// Accumulator value of one cell and bank, folding the redundant halves
  fn acc(&self, s: usize, o: usize) -> i64 {
    self.state.accum_fixed[(s, o)].value(self.sel, self.params)
  }

  fn fixed(&self, bias: BiasReg) -> FixedCvt {
    let b = bias.fixed();
    FixedCvt {
      bias32: i64::from(b.bias32()),
      exp: b.exp(),
      zeroing: b.zeroing(),
      scale: b.scale(),
      out_bias: b.out_bias(),
      sat: self.sat,
      legacy: self.params.legacy,
    }
  }

  fn emit(&mut self, s: usize, o: usize, acc: i64, result: u32) {
    if log_enabled!(Level::Trace) {
      trace!("[CVT] [{:02}][{:02}] acc={:#x} -> {:#x}", s, o, acc, result);
    }
    if let Some(obs) = self.observer.as_mut() {
      obs.on_convert(&ConvertRecord {
        element: self.op.element,
        row: s,
        col: o,
        acc,
        result,
      });
    }
  }

  fn body_8x8(&mut self, s: usize, o: usize, bias: BiasReg) {
    let acc = self.acc(s, o);
    let fb = self.state.cvt[self.work][(s, o)];
    let mut c = self.fixed(bias);
    c.out_bias = poly_select(self.op.rs, Feedback::OutBias, c.out_bias, fb);
    c.scale = poly_select(self.op.rs, Feedback::Scale, c.scale, fb);
    let r = c.u8(acc);
    self.state.cvt[self.work][(s, o)] = r;
    self.emit(s, o, acc, r);
  }

  fn body_8x4(&mut self, s: usize, o: usize, bias: BiasReg) {
    let idx = self.sel + if self.op.subchannel_hi { 2 } else { 0 };
    let raw = self.state.accum_fixed[(s, o)].w[idx];
    let acc = if self.params.redundant_acc() {
      i64::from(raw << 4)
    } else {
      i64::from(raw)
    };
    let fb = self.state.cvt[self.work][(s, o)];
    let mut c = self.fixed(bias);
    c.bias32 = i64::from(bias.fixed().bias32() & !0xF);
    c.out_bias = poly_select(self.op.rs, Feedback::OutBias, c.out_bias, fb);
    c.scale = poly_select(self.op.rs, Feedback::Scale, c.scale, fb);
    let r = c.u8(acc);
    self.state.cvt[self.work][(s, o)] = r;
    self.emit(s, o, acc, r);
  }

  fn body_16x8(&mut self, s: usize, o: usize, bias: BiasReg) {
    let ll = self.acc(s, o);
    let hl = self.acc(s + 1, o);
    let mut c = self.fixed(bias);
    c.out_bias = bias.fixed().rnd_bit();
    let r = c.u16(hl, ll) >> 4;
    self.state.cvt[self.work][(s, o)] = lo12(r);
    self.state.cvt[self.work][(s + 1, o)] = hi12(r);
    self.emit(s, o, ll, r);
  }

  fn body_16x16(&mut self, s: usize, o: usize, bias: BiasReg) {
    let rs = self.op.rs;
    let legacy = self.params.legacy;
    let mut ll = self.acc(s, o);
    let mut hl = self.acc(s + 1, o);
    let mut lh = self.acc(s, o + 1);
    let mut hh = self.acc(s + 1, o + 1);

    let ch_sel = rs.fxp16_ch_sel();
    let adj = if ch_sel == 2 && !legacy { 0 } else { 1 };
    if ch_sel != 3 && !legacy {
      if ch_sel == 2 {
        lh = ll;
        hh = hl;
      }
      ll = 0;
      hl = 0;
    }

    let b = bias.fixed();
    let b2 = self.state.bias[(self.bank, o + 1)].fixed();
    let out_bias = ((b2.bias1() << 12) + b.out_bias()) << 2;
    let scale = ((((((b2.sigmsb() ^ 1) << 10) + b2.sig()) << 10) + b.sig()) << 1) + b.siglsb();

    let work = &self.state.cvt[self.work];
    let fb = (((work[(s + 1, o + adj)] & 0xFF0) << 8) | (work[(s, o + adj)] & 0xFFF)) << 2;
    let mut c = self.fixed(bias);
    c.out_bias = poly_select(rs, Feedback::OutBias, out_bias, fb) >> 2;
    c.scale = poly_select(rs, Feedback::Scale, scale, fb);
    let r = c.u16x16(hh, hl, lh, ll, i64::from(b.bias32()) << 16) >> 4;

    let work = &mut self.state.cvt[self.work];
    work[(s, o + adj)] = lo12(r);
    work[(s + 1, o + adj)] = hi12(r);
    if rs.fb_dst() == 0 {
      work[(s, o + 1 - adj)] = 0;
      work[(s + 1, o + 1 - adj)] = 0;
    }
    self.emit(s, o + adj, hh, r);
  }

  fn body_float(&mut self, s: usize, o: usize, bias: BiasReg) {
    let acc = self.state.accum_float[(s, o)].xfp[self.sel];
    let fb = self.state.cvt[self.work][(s, o)];
    let r = self.unit.convert(&acc, bias.float(), fb, self.op.rs, self.usr);
    self.state.cvt[self.work][(s, o)] = r;
    self.emit(s, o, acc.sig, r);
  }
}

/// Convert the committed accumulators of the operand's kind into the spare
/// convert buffer and schedule the write-out. Returns the number of
/// elements converted.
pub fn run_convert(
  state: &mut AcceleratorState,
  params: &AcceleratorParams,
  unit: &XfpUnit,
  op: &CvtOperand,
  observer: &mut ObserverSlot,
) -> usize {
  let element = op.element;
  let kind = element.acc_kind();
  let work = state.seed_cvt();
  state.output = Some(OutputTile::new(op));
  let bank = op.rs.bias_sel().min(state.bias.rows().saturating_sub(1));
  let sel = state.current_bank(kind);
  debug!(
    "[CVT] {:?} bank={} acc={} rs={:#x} work={} direction={:?}",
    element, bank, sel, op.rs.0, work, op.direction
  );

  let mut cv = Converter {
    state,
    params,
    unit,
    observer,
    op,
    work,
    bank,
    sel,
    sat: !op.rs.relu(),
    usr: FpPolicy::from_usr(op.usr),
  };

  let mut count = 0;
  for o in (0..COLS).step_by(element.output_stride()) {
    let bias = cv.state.bias[(bank, o)];
    for s in (0..ROWS).step_by(element.spatial_stride()) {
      match element {
        ElementType::Ub | ElementType::B => cv.body_8x8(s, o, bias),
        ElementType::Ub4 => cv.body_8x4(s, o, bias),
        ElementType::Uh => cv.body_16x8(s, o, bias),
        ElementType::UhUh => cv.body_16x16(s, o, bias),
        ElementType::Fp16 => cv.body_float(s, o, bias),
      }
      count += 1;
    }
  }

  let flags = cv.state.flags_mut(kind);
  flags.set(CommitFlags::ACC_CLEAR, !op.rs.acc_clear());
  flags.set(CommitFlags::CVT_WRITE, true);
  flags.set(CommitFlags::CVT_UPDATE, true);
  flags.set(CommitFlags::CVT_ADVANCE, op.feedback() && element != ElementType::Uh);
  count
}
