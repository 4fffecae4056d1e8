use clap::Parser;
use hmx_engine::simulator::config::{load_and_merge_configs, CliOverrides};
use hmx_engine::simulator::utils::log::init_log;
use hmx_engine::simulator::Simulator;
use std::path::PathBuf;

/// hmx - matrix accelerator numeric engine simulator
#[derive(Parser, Debug)]
#[command(name = "hmx")]
#[command(version = "0.1.0")]
#[command(about = "Runs matrix accelerator scenarios against the numeric engine", long_about = None)]
struct Args {
  /// Scenario file to run
  #[arg(long, value_name = "FILE")]
  scenario: Option<String>,

  /// Configuration file merged over the defaults
  #[arg(short, long, value_name = "FILE")]
  config: Option<String>,

  /// Enable step mode (interactive stepping)
  #[arg(short, long)]
  step: bool,

  /// Quiet mode (suppress progress messages)
  #[arg(short, long)]
  quiet: bool,

  /// Write engine events as JSON lines to FILE
  #[arg(long, value_name = "FILE")]
  trace_file: Option<String>,

  /// Elementary MAC dispatches allowed per mac op
  #[arg(long, value_name = "N")]
  mac_budget: Option<u64>,
}

fn main() -> std::io::Result<()> {
  init_log();

  let args = Args::parse();
  let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

  let cli = CliOverrides {
    quiet: args.quiet,
    step: args.step,
    trace_file: args.trace_file,
    scenario: args.scenario,
    mac_budget: args.mac_budget,
  };
  let config = load_and_merge_configs(args.config.as_deref(), &root, &cli)?;

  let mut simulator = Simulator::new(&config)?;
  simulator.run()?;
  Ok(())
}
