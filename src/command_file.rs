//! Command files: one command per line.
//!
//! ```text
//! # comments and blank lines are ignored
//! smoke --loop --min-loop-time 60000 -- ./run_smoke.sh
//! pair --device dut --device peer \
//!      -- "./run pair.sh"
//! INCLUDE common/nightly.txt
//! ```

use std::path::{Path, PathBuf};

use crate::error::{ConfigError, FleetError, Result};

const INCLUDE_DIRECTIVE: &str = "INCLUDE";

/// A file pulled in by another command file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludedFile {
    pub path: PathBuf,
    pub includes: Vec<IncludedFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCommandFile {
    /// Argument vectors, in file order with includes spliced in place.
    pub commands: Vec<Vec<String>>,
    /// Files directly included, each with its own includes.
    pub includes: Vec<IncludedFile>,
}

pub trait CommandFileParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedCommandFile>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LineCommandFileParser;

impl LineCommandFileParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_file(&self, path: &Path, stack: &mut Vec<PathBuf>) -> Result<ParsedCommandFile> {
        let path = std::fs::canonicalize(path).map_err(|source| FleetError::CommandFile {
            path: path.to_path_buf(),
            source,
        })?;
        if stack.contains(&path) {
            return Err(FleetError::DependencyCycle(path));
        }
        let content = std::fs::read_to_string(&path).map_err(|source| FleetError::CommandFile {
            path: path.clone(),
            source,
        })?;

        stack.push(path.clone());
        let mut parsed = ParsedCommandFile::default();
        for line in logical_lines(&content) {
            let tokens = tokenize(&line).map_err(|source| FleetError::CommandLine {
                command: line.clone(),
                source,
            })?;
            if tokens.is_empty() {
                continue;
            }
            if tokens[0] == INCLUDE_DIRECTIVE {
                if tokens.len() != 2 {
                    return Err(FleetError::CommandLine {
                        command: line.clone(),
                        source: ConfigError::InvalidArgs(
                            "INCLUDE takes exactly one path".to_string(),
                        ),
                    });
                }
                let target = resolve_relative(&path, &tokens[1]);
                let included = self.parse_file(&target, stack)?;
                parsed.commands.extend(included.commands);
                parsed.includes.push(IncludedFile {
                    path: std::fs::canonicalize(&target).unwrap_or(target),
                    includes: included.includes,
                });
            } else {
                parsed.commands.push(tokens);
            }
        }
        stack.pop();

        tracing::debug!(
            path = %path.display(),
            commands = parsed.commands.len(),
            includes = parsed.includes.len(),
            "Parsed command file"
        );
        Ok(parsed)
    }
}

impl CommandFileParser for LineCommandFileParser {
    fn parse(&self, path: &Path) -> Result<ParsedCommandFile> {
        self.parse_file(path, &mut Vec::new())
    }
}

fn resolve_relative(including: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    match including.parent() {
        Some(dir) => dir.join(target),
        None => target.to_path_buf(),
    }
}

/// Join `\`-continued lines and drop comments and blank lines.
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for raw in content.lines() {
        let trimmed = raw.trim_end();
        if let Some(head) = trimmed.strip_suffix('\\') {
            current.push_str(head);
            current.push(' ');
            continue;
        }
        current.push_str(trimmed);
        let line = std::mem::take(&mut current);
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            lines.push(line.to_string());
        }
    }
    let line = current.trim();
    if !line.is_empty() && !line.starts_with('#') {
        lines.push(line.to_string());
    }
    lines
}

/// Split a line into arguments, honouring single and double quotes.
///
/// Inside double quotes and bare words a backslash escapes the next
/// character. Single quotes are literal.
pub fn tokenize(line: &str) -> std::result::Result<Vec<String>, ConfigError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => {
                            return Err(ConfigError::InvalidArgs(
                                "unterminated single quote".to_string(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch) => current.push(ch),
                            None => break,
                        },
                        Some(ch) => current.push(ch),
                        None => {
                            return Err(ConfigError::InvalidArgs(
                                "unterminated double quote".to_string(),
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            '#' if !in_token => break,
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
