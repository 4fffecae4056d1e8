use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::warn;
use serde::Serialize;

use crate::arch::hmx::{ConvertRecord, MacRecord, Observer, WeightRecord};

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TraceLine<'a> {
  Mac(&'a MacRecord),
  Weight(&'a WeightRecord),
  Convert(&'a ConvertRecord),
}

/// Observer writing one JSON object per event
pub struct JsonTrace<W: Write> {
  out: W,
  lines: u64,
  failed: bool,
}

impl JsonTrace<BufWriter<File>> {
  pub fn create(path: &Path) -> io::Result<Self> {
    let file = File::create(path)
      .map_err(|e| io::Error::new(e.kind(), format!("Cannot create trace file {:?}: {}", path, e)))?;
    Ok(Self::new(BufWriter::new(file)))
  }
}

impl<W: Write> JsonTrace<W> {
  pub fn new(out: W) -> Self {
    Self {
      out,
      lines: 0,
      failed: false,
    }
  }

  pub fn lines(&self) -> u64 {
    self.lines
  }

  fn emit(&mut self, line: TraceLine) {
    if self.failed {
      return;
    }
    let result = serde_json::to_writer(&mut self.out, &line)
      .map_err(io::Error::from)
      .and_then(|_| self.out.write_all(b"\n"));
    match result {
      Ok(()) => self.lines += 1,
      Err(e) => {
        // Observers cannot fail the engine; stop tracing instead
        warn!("[SIM] trace disabled after write error: {}", e);
        self.failed = true;
      },
    }
  }
}

impl<W: Write> Observer for JsonTrace<W> {
  fn on_mac(&mut self, record: &MacRecord) {
    self.emit(TraceLine::Mac(record));
  }

  fn on_weight(&mut self, record: &WeightRecord) {
    self.emit(TraceLine::Weight(record));
  }

  fn on_convert(&mut self, record: &ConvertRecord) {
    self.emit(TraceLine::Convert(record));
  }
}

impl<W: Write> Drop for JsonTrace<W> {
  fn drop(&mut self) {
    let _ = self.out.flush();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::hmx::{AccKind, ElementType};

  /// Each event becomes one tagged JSON line
  #[test]
  fn test_json_lines() {
    let mut trace = JsonTrace::new(Vec::new());
    trace.on_mac(&MacRecord {
      kind: AccKind::Fixed,
      row: 1,
      col: 2,
      sel: 0,
      input_channel: 3,
      act: 5,
      wgt: 7,
      result: 35,
    });
    trace.on_convert(&ConvertRecord {
      element: ElementType::Ub,
      row: 1,
      col: 2,
      acc: 100,
      result: 1600,
    });
    assert_eq!(trace.lines(), 2);
    let out = String::from_utf8(std::mem::take(&mut trace.out)).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["event"], "mac");
    assert_eq!(first["kind"], "fixed");
    assert_eq!(first["result"], 35);
    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second["event"], "convert");
    assert_eq!(second["element"], "ub");
  }
}
