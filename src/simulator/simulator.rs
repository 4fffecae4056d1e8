use std::io::{self, Result};
use std::path::Path;

use log::info;

use super::config::AppConfig;
use super::memory::FlatMemory;
use super::sim::mode::{SimConfig, StepMode};
use super::sim::scenario::Scenario;
use super::sim::shell::{Command, Shell};
use super::sim::trace::JsonTrace;
use super::utils::log::set_progress;
use crate::arch::hmx::{Accelerator, AcceleratorParams};
use crate::log_info;

/// Outcome of one scenario run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
  pub ops: usize,
  pub bytes_written: usize,
  /// Expectations checked; zero when the run stopped early
  pub checked: usize,
}

pub struct Simulator {
  config: SimConfig,
  memory: FlatMemory,
  accelerator: Accelerator,
  scenario: Scenario,
  next_op: usize,
  bytes_written: usize,
}

impl Simulator {
  /// Build the simulator and load the configured scenario, if any
  pub fn new(app: &AppConfig) -> Result<Self> {
    let config = SimConfig::from(app);
    set_progress(!config.quiet);

    let params = AcceleratorParams::from(&app.hardware);
    let mut accelerator = Accelerator::new(params);
    if let Some(path) = &config.trace_file {
      accelerator.set_observer(Some(Box::new(JsonTrace::create(Path::new(path))?)));
      log_info!("Tracing engine events to {}", path);
    }

    let scenario = if app.simulation.scenario.is_empty() {
      Scenario::default()
    } else {
      Scenario::load(Path::new(&app.simulation.scenario))?
    };

    let mut sim = Self {
      memory: FlatMemory::new(config.memory_size),
      config,
      accelerator,
      scenario: Scenario::default(),
      next_op: 0,
      bytes_written: 0,
    };
    sim.load_scenario(scenario)?;
    Ok(sim)
  }

  /// Replace the scenario and apply its memory preloads
  pub fn load_scenario(&mut self, scenario: Scenario) -> Result<()> {
    scenario.preload(&mut self.memory)?;
    info!(
      "[SIM] scenario '{}': {} preloads, {} ops, {} expectations",
      scenario.name,
      scenario.memory.len(),
      scenario.ops.len(),
      scenario.expect.len()
    );
    self.scenario = scenario;
    self.next_op = 0;
    self.bytes_written = 0;
    Ok(())
  }

  pub fn accelerator(&self) -> &Accelerator {
    &self.accelerator
  }

  pub fn memory(&self) -> &FlatMemory {
    &self.memory
  }

  pub fn memory_mut(&mut self) -> &mut FlatMemory {
    &mut self.memory
  }

  pub fn run(&mut self) -> Result<RunSummary> {
    let finished = match self.config.step_mode {
      StepMode::Continuous => {
        self.run_continuous()?;
        true
      },
      StepMode::Step => self.run_step_mode()?,
    };

    let checked = if finished {
      let checked = self.scenario.verify(&mut self.memory)?;
      log_info!(
        "Scenario '{}' passed: {} ops, {} bytes written, {} checks",
        self.scenario.name,
        self.next_op,
        self.bytes_written,
        checked
      );
      checked
    } else {
      log_info!("Stopped after {} of {} ops", self.next_op, self.scenario.ops.len());
      0
    };

    Ok(RunSummary {
      ops: self.next_op,
      bytes_written: self.bytes_written,
      checked,
    })
  }

  fn run_step_mode(&mut self) -> Result<bool> {
    println!("Step mode - Press Enter to run one op, 'q' to quit");
    let mut shell = Shell::new()?;
    while !self.done() {
      match shell.read_command()? {
        Command::Step(n) => {
          for _ in 0..n {
            if self.done() {
              break;
            }
            self.step()?;
          }
        },
        Command::Continue => self.run_continuous()?,
        Command::Acc(r, c) => self.print_cell(r, c),
        Command::Quit => return Ok(false),
      }
    }
    Ok(true)
  }

  fn run_continuous(&mut self) -> Result<()> {
    while !self.done() {
      self.step()?;
    }
    Ok(())
  }

  fn done(&self) -> bool {
    self.next_op >= self.scenario.ops.len()
  }

  /// Issue the next op and commit it
  pub fn step(&mut self) -> Result<()> {
    let Some(op) = self.scenario.ops.get(self.next_op) else {
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no scenario ops left"));
    };
    op.execute(&mut self.accelerator, &mut self.memory)?;
    let written = self.accelerator.commit(&mut self.memory)?;
    log_info!("op {} ({}) committed, {} bytes written", self.next_op, op.name(), written);
    self.bytes_written += written;
    self.next_op += 1;
    Ok(())
  }

  fn print_cell(&self, row: usize, col: usize) {
    match (self.accelerator.fixed_cell(row, col), self.accelerator.float_cell(row, col)) {
      (Some(fx), Some(fl)) => {
        println!(
          "acc[{}][{}] fixed={:?} value={} float={:?}",
          row,
          col,
          fx.w,
          self.accelerator.fixed_value(row, col).unwrap_or_default(),
          fl.xfp
        );
      },
      _ => eprintln!("Error: cell [{}][{}] is outside the accumulator", row, col),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::hmx::Memory;

  const SCRIPT: &str = r#"
name = "bias"

[[memory]]
addr = 0x100
word = 0x6000
count = 32

[[ops]]
op = "load_bias"
addr = 0x100

[[ops]]
op = "store_bias"
addr = 0x400

[[expect]]
addr = 0x400
byte = 0x00

[[expect]]
addr = 0x401
byte = 0x60
"#;

  fn quiet_config() -> AppConfig {
    let mut app = AppConfig::default();
    app.simulation.quiet = true;
    app.simulation.memory_size = 0x1000;
    app
  }

  /// Ops commit one by one and expectations run at the end
  #[test]
  fn test_run_scenario() {
    let mut sim = Simulator::new(&quiet_config()).unwrap();
    sim.load_scenario(Scenario::parse(SCRIPT).unwrap()).unwrap();
    let summary = sim.run().unwrap();
    assert_eq!(summary.ops, 2);
    assert_eq!(summary.bytes_written, 128);
    assert_eq!(summary.checked, 2);
    assert_eq!(sim.memory_mut().read4(0x47C).unwrap(), 0x6000);
  }

  /// Stepping past the end is an error
  #[test]
  fn test_step_without_ops() {
    let mut sim = Simulator::new(&quiet_config()).unwrap();
    assert!(sim.step().is_err());
    assert_eq!(sim.run().unwrap(), RunSummary::default());
  }
}
