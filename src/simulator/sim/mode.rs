use crate::simulator::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
  Continuous,
  Step,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
  pub quiet: bool,
  pub step_mode: StepMode,
  pub trace_file: Option<String>,
  pub memory_size: usize,
}

impl From<&AppConfig> for SimConfig {
  fn from(config: &AppConfig) -> Self {
    let sim = &config.simulation;
    Self {
      quiet: sim.quiet,
      step_mode: if sim.step_mode { StepMode::Step } else { StepMode::Continuous },
      trace_file: if sim.trace_file.is_empty() { None } else { Some(sim.trace_file.clone()) },
      memory_size: sim.memory_size,
    }
  }
}
