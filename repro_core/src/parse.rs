//! Reproducer log parsing.
//!
//! A reproducer log is line oriented: `#` lines are comments, blank lines
//! separate programs, every other line is one call, optionally followed by
//! a parenthesised property block such as `(fail_nth: 5)`.

use crate::prog::{Call, CallProps, Prog};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no calls")]
    NoCalls,
    #[error("more than one program")]
    MultiplePrograms,
    #[error("bad call '{0}'")]
    BadCall(String),
    #[error("bad call properties '{0}'")]
    BadProps(String),
}

fn props_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\(fail_nth:\s*(-?\d+)\)\s*$").unwrap())
}

/// Parse an execution log into programs. Unparsable call lines are skipped
/// so that a log with foreign annotations still yields its programs.
pub fn parse_log(data: &[u8]) -> Vec<Prog> {
    let text = String::from_utf8_lossy(data);
    let mut progs = Vec::new();
    for group in split_programs(&text) {
        let calls: Vec<Call> = group.iter().filter_map(|l| parse_call(l).ok()).collect();
        if !calls.is_empty() {
            progs.push(Prog::new(calls));
        }
    }
    progs
}

/// Parse exactly one program; stricter than [`parse_log`]: call errors are
/// reported and multi-program input is rejected.
pub fn parse_prog(text: &str) -> Result<Prog, ParseError> {
    let groups = split_programs(text);
    match groups.len() {
        0 => Err(ParseError::NoCalls),
        1 => {
            let mut calls = Vec::with_capacity(groups[0].len());
            for line in &groups[0] {
                calls.push(parse_call(line)?);
            }
            Ok(Prog::new(calls))
        }
        _ => Err(ParseError::MultiplePrograms),
    }
}

fn split_programs(text: &str) -> Vec<Vec<&str>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim_start().starts_with('#') {
            continue;
        }
        if line.trim().is_empty() {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn parse_call(line: &str) -> Result<Call, ParseError> {
    let line = line.trim();
    let mut props = CallProps::default();
    let text = match props_re().captures(line) {
        Some(caps) => {
            let nth: i32 = caps[1]
                .parse()
                .map_err(|_| ParseError::BadProps(line.to_string()))?;
            props.fail_nth = nth.max(0);
            line[..caps.get(0).unwrap().start()].trim_end()
        }
        None => line,
    };
    if text.is_empty() || !text.contains('(') || !text.ends_with(')') {
        return Err(ParseError::BadCall(line.to_string()));
    }
    Ok(Call::new(text, props))
}
