//! Console output for the simulator.
//!
//! Engine internals go through `log` and are filtered by `RUST_LOG`. Run
//! progress lines go through `log_info!` and are silenced by `--quiet`.

use std::sync::atomic::{AtomicBool, Ordering};

static PROGRESS: AtomicBool = AtomicBool::new(true);

/// Install the `env_logger` backend. `RUST_LOG` wins; otherwise `info`.
pub fn init_log() {
  let env = env_logger::Env::default().default_filter_or("info");
  let _ = env_logger::Builder::from_env(env).format_timestamp(None).try_init();
}

pub fn set_progress(enabled: bool) {
  PROGRESS.store(enabled, Ordering::Relaxed);
}

pub fn progress_enabled() -> bool {
  PROGRESS.load(Ordering::Relaxed)
}

/// Progress line with a blue `[hmx]` prefix, dropped in quiet runs
#[macro_export]
macro_rules! log_info {
  ($($arg:tt)*) => {
    if $crate::simulator::utils::log::progress_enabled() {
      println!("\x1b[34m[hmx]\x1b[0m {}", format_args!($($arg)*));
    }
  };
}
