//! Unified logging and progress UI.
//!
//! [`Notifier`] wraps `env_logger` (text logs) and `indicatif` (spinners/bars) under a single
//! verbosity switch:
//! - [`VerbosityLevel::Quiet`] → no text logs; a live spinner for status messages and byte
//!   progress bars for blob downloads.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`] → standard logs.
//!
//! Levels map to `env_logger` filters; Quiet suppresses logs (≥ Warn) while rendering
//! spinners/bars via an internal `MultiProgress`.

use env_logger::Env;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Record};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Progress bars, no text logs
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    pub fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    logger: env_logger::Logger,
    multi_progress: Option<Arc<MultiProgress>>,
    active_spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        let logger = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .build();

        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(Arc::new(MultiProgress::new()))
        } else {
            None
        };

        Self {
            verbosity,
            logger,
            multi_progress,
            active_spinner: RefCell::new(None),
        }
    }

    /// A notifier that draws nothing and logs nothing below warnings.
    pub fn hidden() -> Self {
        Self {
            verbosity: VerbosityLevel::Quiet,
            logger: env_logger::Builder::new()
                .filter_level(LevelFilter::Warn)
                .build(),
            multi_progress: None,
            active_spinner: RefCell::new(None),
        }
    }

    fn log(&self, level: Level, message: &str) {
        self.logger.log(
            &Record::builder()
                .args(format_args!("{}", message))
                .level(level)
                .target(module_path!())
                .build(),
        );
    }

    pub fn info(&self, message: &str) {
        match self.verbosity {
            VerbosityLevel::Quiet => {
                // Lazy initialize spinner on first info call
                if self.active_spinner.borrow().is_none() {
                    if let Some(multi_progress) = &self.multi_progress {
                        let spinner = multi_progress.add(ProgressBar::new_spinner());
                        if let Ok(style) =
                            ProgressStyle::default_spinner().template("{spinner:.green} {msg}")
                        {
                            spinner.set_style(style);
                        }
                        spinner.enable_steady_tick(Duration::from_millis(100));

                        *self.active_spinner.borrow_mut() = Some(spinner);
                    }
                }

                if let Some(spinner) = self.active_spinner.borrow().as_ref() {
                    spinner.set_message(message.to_string());
                }
            }
            _ => self.log(Level::Info, message),
        }
    }

    /// Byte-counting bar for a download of `length` bytes (Quiet mode only).
    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(
                Level::Info,
                &format!("{} ({})", message, HumanBytes(length)),
            );
            return None;
        }

        let multi_progress = self.multi_progress.as_ref()?;
        let progress_bar = multi_progress.add(ProgressBar::new(length));
        if let Ok(style) = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {msg}",
            )
        {
            progress_bar.set_style(style.progress_chars("=> "));
        }
        progress_bar.set_message(message.to_string());
        Some(progress_bar)
    }

    /// Clears the status spinner, leaving `message` behind.
    pub fn finish(&self, message: &str) {
        let spinner = self.active_spinner.borrow_mut().take();
        match spinner {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None => self.info(message),
        }
    }
}
