//! User-facing output sink.
//!
//! Session-level diagnostics go to the [`log`] macros; everything a user of
//! the tool is meant to read (device listings, progress) goes through a
//! [`Reporter`] so embedders can route it wherever they like.

use std::io::{self, Write};

pub trait Reporter {
    /// One finished line of output.
    fn line(&self, message: &str);
    /// Progress of a labelled operation, 0..=100.
    fn progress(&self, label: &str, percent: u32);
}

/// Writes lines to stdout and renders progress as an in-place bar.
#[derive(Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn line(&self, message: &str) {
        println!("{message}");
    }

    fn progress(&self, label: &str, percent: u32) {
        let percent = percent.min(100);
        let filled = (60 * percent / 100) as usize;
        print!(
            "\r{label} {percent:3}% [{}{}]",
            "#".repeat(filled),
            " ".repeat(60 - filled)
        );
        if percent == 100 {
            println!();
        }
        let _ = io::stdout().flush();
    }
}

/// Discards everything. Useful for tests and embedders that only want the
/// result.
#[derive(Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn line(&self, _message: &str) {}
    fn progress(&self, _label: &str, _percent: u32) {}
}
