//! Crash report extraction from guest console output.

use regex::{Regex, RegexSet};
use std::fmt;

/// A structured crash report scraped from a guest console.
#[derive(Debug, Default, Clone)]
pub struct Report {
    pub title: String,
    /// Console tail starting at the oops line.
    pub report: String,
    pub raw_log: Vec<u8>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)?;
        if !self.report.is_empty() {
            write!(f, "\n{}", self.report)?;
        }
        Ok(())
    }
}

const OOPS_PATTERNS: [&str; 14] = [
    r"BUG:",
    r"kernel BUG at",
    r"WARNING:",
    r"INFO: task .* blocked for",
    r"INFO: rcu",
    r"Kernel panic",
    r"general protection fault",
    r"divide error:",
    r"stack segment:",
    r"invalid opcode:",
    r"[Uu]nable to handle",
    r"watchdog: BUG: soft lockup",
    r"KASAN:",
    r"UBSAN:",
];

/// Detects kernel oops markers in console output and extracts a report.
pub struct Reporter {
    oops: RegexSet,
    log_prefix: Regex,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    pub fn new() -> Self {
        Self {
            oops: RegexSet::new(OOPS_PATTERNS).unwrap(),
            log_prefix: Regex::new(r"^(?:<\d+>)?\[\s*\d+\.\d+\]\s*").unwrap(),
        }
    }

    pub fn contains_crash(&self, output: &[u8]) -> bool {
        let text = String::from_utf8_lossy(output);
        text.lines().any(|l| self.oops.is_match(l))
    }

    /// Extract a report from the console log, if it holds an oops. The
    /// title is the first matching line, stripped of the syslog prefix.
    pub fn extract(&self, console: &[u8]) -> Option<Report> {
        let text = String::from_utf8_lossy(console);
        let mut offset = 0;
        for line in text.lines() {
            if self.oops.is_match(line) {
                let title = self.log_prefix.replace(line.trim(), "").into_owned();
                return Some(Report {
                    title,
                    report: text[offset..].to_string(),
                    raw_log: console.to_vec(),
                });
            }
            offset += line.len() + 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_oops_title() {
        let console = b"[    1.000000] booting\n\
[   12.345678] BUG: KASAN: use-after-free in foo+0x12/0x40\n\
[   12.345679] Call Trace:\n";
        let reporter = Reporter::new();
        assert!(reporter.contains_crash(console));
        let report = reporter.extract(console).unwrap();
        assert_eq!(report.title, "BUG: KASAN: use-after-free in foo+0x12/0x40");
        assert!(report.report.contains("Call Trace"));
    }

    #[test]
    fn clean_console_has_no_report() {
        let reporter = Reporter::new();
        assert!(reporter.extract(b"[  1.0] systemd started\n").is_none());
    }
}
