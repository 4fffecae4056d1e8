use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ::config::{Config, Environment};

use crate::arch::hmx::AcceleratorParams;

/// Hardware build parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HardwareSection {
  pub fp_rows: usize,
  pub rate: u32,
  pub fp_rate: u32,
  pub sub_cols: u32,
  pub accum_width: u32,
  pub cvt_width: u32,
  pub fp_acc_int: i32,
  pub fp_acc_frac: i32,
  pub fp_acc_exp: i32,
  pub fp_acc_norm: i32,
  pub parallel_grps: u32,
  pub num_bias_grps: usize,
  pub fp_present: bool,
  pub xfp_inexact_enable: bool,
  pub xfp_cvt_int: i32,
  pub xfp_cvt_frac: i32,
  pub legacy: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mac_budget: Option<u64>,
}

impl Default for HardwareSection {
  fn default() -> Self {
    let p = AcceleratorParams::default();
    Self {
      fp_rows: p.fp_rows,
      rate: p.rate,
      fp_rate: p.fp_rate,
      sub_cols: p.sub_cols,
      accum_width: p.accum_width,
      cvt_width: p.cvt_width,
      fp_acc_int: p.fp_acc_int,
      fp_acc_frac: p.fp_acc_frac,
      fp_acc_exp: p.fp_acc_exp,
      fp_acc_norm: p.fp_acc_norm,
      parallel_grps: p.parallel_grps,
      num_bias_grps: p.num_bias_grps,
      fp_present: p.fp_present,
      xfp_inexact_enable: p.xfp_inexact_enable,
      xfp_cvt_int: p.xfp_cvt_int,
      xfp_cvt_frac: p.xfp_cvt_frac,
      legacy: p.legacy,
      mac_budget: p.mac_budget,
    }
  }
}

impl From<&HardwareSection> for AcceleratorParams {
  fn from(hw: &HardwareSection) -> Self {
    Self {
      fp_rows: hw.fp_rows,
      rate: hw.rate,
      fp_rate: hw.fp_rate,
      sub_cols: hw.sub_cols,
      accum_width: hw.accum_width,
      cvt_width: hw.cvt_width,
      fp_acc_int: hw.fp_acc_int,
      fp_acc_frac: hw.fp_acc_frac,
      fp_acc_exp: hw.fp_acc_exp,
      fp_acc_norm: hw.fp_acc_norm,
      parallel_grps: hw.parallel_grps,
      num_bias_grps: hw.num_bias_grps,
      fp_present: hw.fp_present,
      xfp_inexact_enable: hw.xfp_inexact_enable,
      xfp_cvt_int: hw.xfp_cvt_int,
      xfp_cvt_frac: hw.xfp_cvt_frac,
      legacy: hw.legacy,
      mac_budget: hw.mac_budget,
    }
  }
}

/// Simulation run settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SimulationSection {
  #[serde(default)]
  pub quiet: bool,
  #[serde(default = "default_step_mode")]
  pub step_mode: bool,
  #[serde(default)]
  pub trace_file: String,
  #[serde(default)]
  pub scenario: String,
  #[serde(default = "default_memory_size")]
  pub memory_size: usize,
}

fn default_step_mode() -> bool {
  false
}

fn default_memory_size() -> usize {
  1 << 20
}

impl Default for SimulationSection {
  fn default() -> Self {
    Self {
      quiet: false,
      step_mode: default_step_mode(),
      trace_file: String::new(),
      scenario: String::new(),
      memory_size: default_memory_size(),
    }
  }
}

/// Whole application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppConfig {
  #[serde(default)]
  pub hardware: HardwareSection,
  #[serde(default)]
  pub simulation: SimulationSection,
}

/// Flags taken from the command line
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
  pub quiet: bool,
  pub step: bool,
  pub trace_file: Option<String>,
  pub scenario: Option<String>,
  pub mac_budget: Option<u64>,
}

fn invalid(msg: String) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Load the built-in defaults from default.toml
pub fn load_default_config() -> io::Result<AppConfig> {
  let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
  let config_path = manifest_dir
    .join("src")
    .join("simulator")
    .join("config")
    .join("default.toml");

  load_config_file(&config_path)
}

/// Load a complete configuration from one file
pub fn load_config_file(path: &Path) -> io::Result<AppConfig> {
  let content = read_file(path)?;
  toml::from_str::<AppConfig>(&content).map_err(|e| invalid(format!("Failed to parse TOML config: {}", e)))
}

fn read_file(path: &Path) -> io::Result<String> {
  fs::read_to_string(path)
    .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("Cannot read config file {:?}: {}", path, e)))
}

/// Merge a partial user configuration over a complete one. Only the keys
/// present in `overlay` change.
pub fn merge_config(base: AppConfig, overlay: &toml::Table) -> io::Result<AppConfig> {
  let mut merged = match toml::Value::try_from(&base) {
    Ok(toml::Value::Table(t)) => t,
    Ok(_) => return Err(invalid("config did not serialize to a table".to_string())),
    Err(e) => return Err(invalid(format!("Failed to serialize config: {}", e))),
  };
  merge_tables(&mut merged, overlay);
  toml::Value::Table(merged)
    .try_into::<AppConfig>()
    .map_err(|e| invalid(format!("Failed to merge config: {}", e)))
}

fn merge_tables(base: &mut toml::Table, overlay: &toml::Table) {
  for (key, value) in overlay {
    match (base.get_mut(key), value) {
      (Some(toml::Value::Table(dst)), toml::Value::Table(src)) => merge_tables(dst, src),
      _ => {
        base.insert(key.clone(), value.clone());
      },
    }
  }
}

/// Environment source for `HMX_<SECTION>__<FIELD>` variables
pub fn env_source() -> Environment {
  Environment::with_prefix("HMX")
    .prefix_separator("_")
    .separator("__")
    .try_parsing(true)
}

/// Layer environment variables over the configuration
pub fn apply_env_overrides(base: AppConfig, env: Environment) -> io::Result<AppConfig> {
  let layered = Config::try_from(&base)
    .map_err(|e| invalid(format!("Failed to stage config: {}", e)))?;
  Config::builder()
    .add_source(layered)
    .add_source(env)
    .build()
    .and_then(|c| c.try_deserialize::<AppConfig>())
    .map_err(|e| invalid(format!("Invalid environment override: {}", e)))
}

/// Apply CLI flags over the configuration
pub fn apply_cli_overrides(config: &mut AppConfig, cli: &CliOverrides) {
  if cli.quiet {
    config.simulation.quiet = true;
  }
  if cli.step {
    config.simulation.step_mode = true;
  }
  if let Some(file) = &cli.trace_file {
    config.simulation.trace_file = file.clone();
  }
  if let Some(file) = &cli.scenario {
    config.simulation.scenario = file.clone();
  }
  if let Some(budget) = cli.mac_budget {
    config.hardware.mac_budget = Some(budget);
  }
}

/// Reject parameter combinations the engine cannot model
pub fn validate_config(config: &AppConfig) -> io::Result<()> {
  let hw = &config.hardware;

  if !matches!(hw.fp_rate, 1 | 2 | 4 | 8) {
    return Err(invalid(format!("fp_rate must be 1, 2, 4 or 8, got {}", hw.fp_rate)));
  }
  if hw.sub_cols == 0 {
    return Err(invalid("sub_cols must be at least 1".to_string()));
  }
  if !(2..=32).contains(&hw.accum_width) {
    return Err(invalid(format!("accum_width must be within 2..=32, got {}", hw.accum_width)));
  }
  if hw.parallel_grps == 0 || 32 % hw.parallel_grps != 0 {
    return Err(invalid(format!("parallel_grps must divide 32, got {}", hw.parallel_grps)));
  }
  if !(1..=4).contains(&hw.num_bias_grps) {
    return Err(invalid(format!("num_bias_grps must be within 1..=4, got {}", hw.num_bias_grps)));
  }
  if hw.fp_rows == 0 || hw.fp_rows > 64 {
    return Err(invalid(format!("fp_rows must be within 1..=64, got {}", hw.fp_rows)));
  }
  if !(1..=11).contains(&hw.fp_acc_exp) || hw.fp_acc_frac <= 0 || hw.fp_acc_int <= 0 {
    return Err(invalid("fp_acc_exp, fp_acc_int and fp_acc_frac are out of range".to_string()));
  }
  if hw.mac_budget == Some(0) {
    return Err(invalid("mac_budget must be positive".to_string()));
  }
  if config.simulation.memory_size == 0 {
    return Err(invalid("memory_size cannot be zero".to_string()));
  }

  Ok(())
}

/// Resolve a relative path against `root`
fn resolve_single_path(path_str: &str, root: &Path) -> String {
  if path_str.is_empty() || Path::new(path_str).is_absolute() {
    return path_str.to_string();
  }
  root.join(path_str).to_string_lossy().to_string()
}

/// Load and merge the configuration.
///
/// Order:
/// 1. default.toml
/// 2. the user file, if given
/// 3. `HMX_*` environment variables
/// 4. CLI flags
/// 5. path resolution and validation
pub fn load_and_merge_configs(custom_config_path: Option<&str>, root: &Path, cli: &CliOverrides) -> io::Result<AppConfig> {
  let mut config = load_default_config()?;

  if let Some(custom_path) = custom_config_path {
    let path = PathBuf::from(resolve_single_path(custom_path, root));
    let overlay = read_file(&path)?
      .parse::<toml::Table>()
      .map_err(|e| invalid(format!("Failed to parse TOML config: {}", e)))?;
    config = merge_config(config, &overlay)?;
  }

  config = apply_env_overrides(config, env_source())?;
  apply_cli_overrides(&mut config, cli);

  config.simulation.trace_file = resolve_single_path(&config.simulation.trace_file, root);
  config.simulation.scenario = resolve_single_path(&config.simulation.scenario, root);

  validate_config(&config)?;
  Ok(config)
}
