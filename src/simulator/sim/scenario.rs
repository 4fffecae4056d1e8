//! TOML scenario scripts: memory preloads, engine ops and expected memory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use log::debug;

use crate::arch::hmx::{
  AccKind, Accelerator, ActBlock, ActOperand, CvtDirection, CvtOperand, CvtRs, ElementType, Format, Memory,
  MultiplyKind, Unpack, WgtBlock, WgtOperand,
};
use crate::simulator::memory::FlatMemory;

fn invalid(msg: String) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn default_count() -> usize {
  1
}

fn default_element() -> ElementType {
  ElementType::Ub
}

fn default_format() -> Format {
  Format::ChannelMajor
}

fn default_act_block() -> ActBlock {
  ActBlock::Block
}

fn default_wgt_block() -> WgtBlock {
  WgtBlock::Normal
}

fn default_unpack() -> Unpack {
  Unpack::Byte
}

fn default_multiply() -> MultiplyKind {
  MultiplyKind::Fxp
}

fn default_output_scale() -> u32 {
  1
}

fn default_direction() -> CvtDirection {
  CvtDirection::After
}

/// Bytes placed in memory before the first op.
///
/// `bytes` (or the little-endian `word`) is written `count` times, `stride`
/// bytes apart; the stride defaults to the pattern length.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryInit {
  pub addr: u64,
  #[serde(default)]
  pub bytes: Vec<u8>,
  #[serde(default)]
  pub word: Option<u32>,
  #[serde(default = "default_count")]
  pub count: usize,
  #[serde(default)]
  pub stride: Option<u64>,
}

impl MemoryInit {
  fn pattern(&self) -> Vec<u8> {
    match self.word {
      Some(w) => w.to_le_bytes().to_vec(),
      None => self.bytes.clone(),
    }
  }

  pub fn apply(&self, mem: &mut FlatMemory) -> io::Result<()> {
    let pattern = self.pattern();
    let stride = self.stride.unwrap_or(pattern.len() as u64);
    for i in 0..self.count as u64 {
      mem.load(self.addr + i * stride, &pattern)?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActArgs {
  pub start: u64,
  pub range: u64,
  #[serde(default = "default_element")]
  pub element: ElementType,
  #[serde(default = "default_format")]
  pub format: Format,
  #[serde(default = "default_act_block")]
  pub block: ActBlock,
}

impl From<&ActArgs> for ActOperand {
  fn from(s: &ActArgs) -> Self {
    Self {
      start: s.start,
      range: s.range,
      element: s.element,
      format: s.format,
      block: s.block,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WgtArgs {
  pub start: u64,
  pub range: u64,
  #[serde(default = "default_wgt_block")]
  pub block: WgtBlock,
  #[serde(default = "default_unpack")]
  pub unpack: Unpack,
  #[serde(default = "default_multiply")]
  pub multiply: MultiplyKind,
  #[serde(default = "default_output_scale")]
  pub output_scale: u32,
  #[serde(default)]
  pub usr: u32,
}

impl From<&WgtArgs> for WgtOperand {
  fn from(s: &WgtArgs) -> Self {
    Self {
      start: s.start,
      range: s.range,
      block: s.block,
      unpack: s.unpack,
      multiply: s.multiply,
      output_scale: s.output_scale,
      usr: s.usr,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CvtArgs {
  pub start: u64,
  pub range: u64,
  #[serde(default = "default_element")]
  pub element: ElementType,
  #[serde(default = "default_format")]
  pub format: Format,
  #[serde(default = "default_direction")]
  pub direction: CvtDirection,
  /// Raw convert control word
  #[serde(default)]
  pub rs: u32,
  #[serde(default)]
  pub usr: u32,
  #[serde(default)]
  pub subchannel_hi: bool,
}

impl From<&CvtArgs> for CvtOperand {
  fn from(s: &CvtArgs) -> Self {
    Self {
      start: s.start,
      range: s.range,
      element: s.element,
      format: s.format,
      direction: s.direction,
      rs: CvtRs(s.rs),
      usr: s.usr,
      subchannel_hi: s.subchannel_hi,
    }
  }
}

/// One engine instruction
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScenarioOp {
  ClearAcc {
    kind: AccKind,
  },
  SwapAcc {
    kind: AccKind,
  },
  LoadBias {
    addr: u64,
    #[serde(default)]
    wide: bool,
    #[serde(default)]
    bank: usize,
  },
  StoreBias {
    addr: u64,
    #[serde(default)]
    wide: bool,
    #[serde(default)]
    bank: usize,
  },
  Mac {
    act: ActArgs,
    wgt: WgtArgs,
  },
  Convert {
    cvt: CvtArgs,
  },
  Rewind,
}

impl ScenarioOp {
  /// Issue the op; the caller commits afterwards
  pub fn execute(&self, acc: &mut Accelerator, mem: &mut dyn Memory) -> io::Result<()> {
    debug!("[SIM] op {}", self.name());
    match self {
      Self::ClearAcc { kind } => acc.clear_acc(*kind),
      Self::SwapAcc { kind } => acc.swap_acc(*kind),
      Self::LoadBias { addr, wide, bank } => acc.load_bias(mem, *addr, *wide, *bank)?,
      Self::StoreBias { addr, wide, bank } => acc.store_bias(*addr, *wide, *bank),
      Self::Mac { act, wgt } => {
        acc.mac(mem, &ActOperand::from(act), &WgtOperand::from(wgt))?;
      },
      Self::Convert { cvt } => {
        acc.convert(&CvtOperand::from(cvt));
      },
      Self::Rewind => acc.rewind(),
    }
    Ok(())
  }

  pub fn name(&self) -> &'static str {
    match self {
      Self::ClearAcc { .. } => "clear_acc",
      Self::SwapAcc { .. } => "swap_acc",
      Self::LoadBias { .. } => "load_bias",
      Self::StoreBias { .. } => "store_bias",
      Self::Mac { .. } => "mac",
      Self::Convert { .. } => "convert",
      Self::Rewind => "rewind",
    }
  }
}

/// Expected memory contents after the last op
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Expectation {
  pub addr: u64,
  #[serde(default)]
  pub byte: Option<u8>,
  #[serde(default)]
  pub half: Option<u16>,
  #[serde(default = "default_count")]
  pub count: usize,
}

impl Expectation {
  /// Number of mismatching elements, with the first one described
  pub fn check(&self, mem: &mut dyn Memory) -> io::Result<(usize, Option<String>)> {
    let mut bad = 0;
    let mut first = None;
    for i in 0..self.count as u64 {
      let (addr, got, want) = match (self.byte, self.half) {
        (Some(b), _) => {
          let addr = self.addr + i;
          (addr, u64::from(mem.read1(addr)?), u64::from(b))
        },
        (None, Some(h)) => {
          let addr = self.addr + 2 * i;
          (addr, u64::from(mem.read2(addr)?), u64::from(h))
        },
        (None, None) => return Err(invalid(format!("expectation at {:#x} names no value", self.addr))),
      };
      if got != want {
        bad += 1;
        if first.is_none() {
          first = Some(format!("{:#x}: expected {:#x}, found {:#x}", addr, want, got));
        }
      }
    }
    Ok((bad, first))
  }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Scenario {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub memory: Vec<MemoryInit>,
  #[serde(default)]
  pub ops: Vec<ScenarioOp>,
  #[serde(default)]
  pub expect: Vec<Expectation>,
}

impl Scenario {
  pub fn parse(text: &str) -> io::Result<Self> {
    toml::from_str(text).map_err(|e| invalid(format!("Failed to parse scenario: {}", e)))
  }

  pub fn load(path: &Path) -> io::Result<Self> {
    let text = fs::read_to_string(path)
      .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("Cannot read scenario {:?}: {}", path, e)))?;
    Self::parse(&text)
  }

  pub fn preload(&self, mem: &mut FlatMemory) -> io::Result<()> {
    for init in &self.memory {
      init.apply(mem)?;
    }
    Ok(())
  }

  /// Check every expectation; fails with the total mismatch count
  pub fn verify(&self, mem: &mut dyn Memory) -> io::Result<usize> {
    let mut checked = 0;
    let mut bad = 0;
    let mut first = None;
    for exp in &self.expect {
      let (n, msg) = exp.check(mem)?;
      checked += exp.count;
      bad += n;
      if first.is_none() {
        first = msg;
      }
    }
    if bad != 0 {
      return Err(invalid(format!(
        "scenario '{}': {} of {} checks failed, first at {}",
        self.name,
        bad,
        checked,
        first.unwrap_or_default()
      )));
    }
    Ok(checked)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SCRIPT: &str = r#"
name = "demo"

[[memory]]
addr = 0x10
bytes = [1, 2]
count = 3
stride = 4

[[memory]]
addr = 0x40
word = 0x6000
count = 2

[[ops]]
op = "swap_acc"
kind = "float"

[[ops]]
op = "mac"
act = { start = 0, range = 3 }
wgt = { start = 0x1000, range = 127, unpack = "nibble" }

[[ops]]
op = "convert"
cvt = { start = 0x2000, range = 0, element = "uh_uh", rs = 1 }

[[expect]]
addr = 0x10
byte = 1
"#;

  /// Operands pick up their defaults
  #[test]
  fn test_parse_scenario() {
    let s = Scenario::parse(SCRIPT).unwrap();
    assert_eq!(s.name, "demo");
    assert_eq!(s.ops.len(), 3);
    assert!(matches!(s.ops[0], ScenarioOp::SwapAcc { kind: AccKind::Float }));
    match &s.ops[1] {
      ScenarioOp::Mac { act, wgt } => {
        let a = ActOperand::from(act);
        assert_eq!(a.element, ElementType::Ub);
        assert_eq!(a.block, ActBlock::Block);
        let w = WgtOperand::from(wgt);
        assert_eq!(w.unpack, Unpack::Nibble);
        assert_eq!(w.output_scale, 1);
      },
      other => panic!("unexpected op {:?}", other),
    }
    match &s.ops[2] {
      ScenarioOp::Convert { cvt } => {
        let c = CvtOperand::from(cvt);
        assert_eq!(c.element, ElementType::UhUh);
        assert!(c.rs.acc_clear());
        assert_eq!(c.direction, CvtDirection::After);
      },
      other => panic!("unexpected op {:?}", other),
    }
  }

  /// Preloads repeat their pattern at the stride
  #[test]
  fn test_preload_and_verify() {
    let s = Scenario::parse(SCRIPT).unwrap();
    let mut mem = FlatMemory::new(0x100);
    s.preload(&mut mem).unwrap();
    assert_eq!(mem.slice(0x10, 10).unwrap(), &[1, 2, 0, 0, 1, 2, 0, 0, 1, 2]);
    assert_eq!(mem.read4(0x44).unwrap(), 0x6000);
    assert_eq!(s.verify(&mut mem).unwrap(), 1);

    mem.write1(0x10, 9).unwrap();
    let err = s.verify(&mut mem).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert!(err.to_string().contains("1 of 1"));
  }

  /// Unknown ops are rejected
  #[test]
  fn test_parse_rejects_unknown_op() {
    let err = Scenario::parse("[[ops]]\nop = \"fly\"\n").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
  }
}
