//! Process-wide configuration.
//!
//! A plain struct with a `Default` impl, no file-format parsing dependency.
//! Values are read from the process environment in one place at
//! construction time rather than scattered `std::env::var` calls through the
//! codebase.

use std::path::PathBuf;

/// Global runtime configuration. Model API credentials are deliberately not modeled here —
/// they are opaque to the core and read directly by whichever provider
/// needs them.
pub struct RuntimeConfig {
    /// `DESIGN_OUTPUT_DIR` — output directory for generated artifacts.
    pub design_output_dir: PathBuf,
    /// `PROCESS_ID` — stable id used to scope output paths and external
    /// events.
    pub process_id: String,
    /// `UV_USE_IO_URING` — must be `0` on platforms where asynchronous I/O
    /// interacts badly with PTY allocation (a SIGHUP bug surfaces as signal
    /// 1 on exit). The core only reads this to decide whether to warn; it
    /// does not set it.
    pub uv_use_io_uring: bool,
    /// Default silence timeout for a `run_pty` invocation that doesn't
    /// override it explicitly.
    pub default_silence_timeout_ms: u64,
    /// Default PTY dedup sliding-window size.
    pub default_dedup_window_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            design_output_dir: PathBuf::from("design_output"),
            process_id: String::from("magi"),
            uv_use_io_uring: true,
            default_silence_timeout_ms: crate::pty::DEFAULT_SILENCE_TIMEOUT_MS,
            default_dedup_window_size: crate::pty::DEFAULT_WINDOW_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Build a [`RuntimeConfig`] from the process environment, falling back
    /// to [`RuntimeConfig::default`] for anything unset or malformed.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            design_output_dir: std::env::var("DESIGN_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.design_output_dir),
            process_id: std::env::var("PROCESS_ID").unwrap_or(defaults.process_id),
            uv_use_io_uring: std::env::var("UV_USE_IO_URING")
                .map(|v| v != "0")
                .unwrap_or(defaults.uv_use_io_uring),
            default_silence_timeout_ms: defaults.default_silence_timeout_ms,
            default_dedup_window_size: defaults.default_dedup_window_size,
        }
    }

    /// Warn (does not error) if a PTY exited with signal 1 while
    /// `UV_USE_IO_URING` was left enabled — a known SIGHUP interaction.
    pub fn warn_if_io_uring_signal_hup(&self, exit_signal: Option<i32>) {
        if self.uv_use_io_uring && exit_signal == Some(1) {
            log::warn!(
                target: "magi_core::config",
                "PTY subprocess exited on signal 1 with UV_USE_IO_URING enabled; \
                 set UV_USE_IO_URING=0 if this recurs"
            );
        }
    }
}
