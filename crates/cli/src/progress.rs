//! Terminal spinner for long saves

use crate::util::format_size;
use cairn_save::SaveProgress;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

/// Spinner on stderr showing files and bytes saved
///
/// Hidden unless stderr is a terminal and no log output is requested, so it
/// never interleaves with log lines.
pub struct SaveSpinner {
    bar: Option<ProgressBar>,
    files: u64,
    bytes: u64,
}

impl SaveSpinner {
    pub fn new(verbose: u8) -> Self {
        let bar = (verbose == 0 && std::io::stderr().is_terminal()).then(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner} saving: {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        Self {
            bar,
            files: 0,
            bytes: 0,
        }
    }

    fn refresh(&self) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{} files, {}", self.files, format_size(self.bytes)));
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl SaveProgress for SaveSpinner {
    fn file_saved(&mut self, _path: &Path, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
        self.refresh();
    }
}

impl Drop for SaveSpinner {
    fn drop(&mut self) {
        self.finish();
    }
}
