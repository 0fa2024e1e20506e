//! A thin wrapper around `console`'s styled output, silenced by `--quiet`.
//! Kept separate from `log`/`fern` (which write to the rotating log file)
//! because this is user-facing REPL chatter, not diagnostics.

use std::sync::atomic::{AtomicBool, Ordering};

use console::style;

use crate::emoji;

/// Global, silenceable sink for the messages a REPL session prints directly
/// to the user (as opposed to `log::info!`, which goes to the log file).
pub struct ProgressOutput {
    quiet: AtomicBool,
}

impl ProgressOutput {
    pub const fn new() -> Self {
        ProgressOutput { quiet: AtomicBool::new(false) }
    }

    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::SeqCst);
    }

    fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    pub fn info(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("{} {}", emoji::INFO, message);
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("{} {}: {}", emoji::WARN, style("warning").yellow().bold(), message);
        }
    }

    pub fn error(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("{} {}: {}", emoji::ERROR, style("error").red().bold(), message);
        }
    }

    pub fn done(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("{} {}", emoji::DONE, style(message).green());
        }
    }
}

impl Default for ProgressOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_is_off_by_default() {
        let out = ProgressOutput::new();
        assert!(!out.is_quiet());
    }

    #[test]
    fn set_quiet_round_trips() {
        let out = ProgressOutput::new();
        out.set_quiet(true);
        assert!(out.is_quiet());
        out.set_quiet(false);
        assert!(!out.is_quiet());
    }
}
