//! Overwrite confirmation on the controlling terminal

use std::io::{BufRead, IsTerminal, Write};

use shuttle::{Confirm, FileSummary, NonInteractive, OverwritePrompt};

/// Asks on stderr, reads the answer from stdin
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn is_interactive(&self) -> bool {
        true
    }

    fn confirm_overwrite(&self, prompt: &OverwritePrompt) -> bool {
        let mut stderr = std::io::stderr().lock();
        let shown = writeln!(stderr, "Destination exists: {}", prompt.path.display())
            .and_then(|_| writeln!(stderr, "  existing: {}", describe(prompt.existing.as_ref())))
            .and_then(|_| writeln!(stderr, "  incoming: {}", describe(prompt.incoming.as_ref())))
            .and_then(|_| write!(stderr, "Overwrite? The current version is archived first. [y/N] "))
            .and_then(|_| stderr.flush());
        if shown.is_err() {
            return false;
        }

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => is_yes(&answer),
            Err(_) => false,
        }
    }
}

/// Prompt only when a person can answer
pub fn confirmer(assume_yes: bool) -> Box<dyn Confirm> {
    if assume_yes || !std::io::stdin().is_terminal() {
        Box::new(NonInteractive)
    } else {
        Box::new(TerminalConfirm)
    }
}

fn describe(summary: Option<&FileSummary>) -> String {
    summary.map(ToString::to_string).unwrap_or_else(|| "unknown".to_string())
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
