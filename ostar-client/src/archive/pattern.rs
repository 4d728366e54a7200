//! Exclude patterns and member filters, both matched as shell globs on archive names.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use glob::{MatchOptions, Pattern};

use crate::error::ArchiveError;

/// `*` and `?` never match a `/`.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile(raw: &str) -> Result<Pattern, glob::PatternError> {
    Pattern::new(raw)
}

#[derive(Clone, Debug)]
struct ExcludePattern {
    pattern: Pattern,
    /// Directory named by a trailing `/**`, which is excluded together with its content.
    directory: Option<Pattern>,
}

impl ExcludePattern {
    fn matches(&self, name: &str) -> bool {
        if self.pattern.matches_with(name, MATCH_OPTIONS) {
            return true;
        }
        match &self.directory {
            Some(dir) => dir.matches_with(name.trim_end_matches('/'), MATCH_OPTIONS),
            None => false,
        }
    }
}

/// Ordered set of exclude patterns.
#[derive(Clone, Debug, Default)]
pub struct ExcludeList {
    patterns: Vec<ExcludePattern>,
}

impl ExcludeList {
    /// Load inline patterns and pattern files.
    ///
    /// Pattern files hold one pattern per line, blank lines and lines starting with `#` are
    /// ignored. Every pattern is validated before anything gets archived.
    pub fn load(inline: &[String], files: &[PathBuf]) -> Result<Self, Error> {
        let mut list = Self::default();

        for raw in inline {
            list.push(raw).map_err(|err| {
                ArchiveError::InvalidExclude(format!(
                    "invalid exclude pattern {:?} - {}",
                    raw, err
                ))
            })?;
        }

        for file in files {
            list.load_file(file)?;
        }

        Ok(list)
    }

    fn load_file(&mut self, file: &Path) -> Result<(), Error> {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read exclude file {:?}", file))?;

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.push(line).map_err(|err| {
                ArchiveError::InvalidExclude(format!(
                    "{}:{}: invalid exclude pattern {:?} - {}",
                    file.display(),
                    index + 1,
                    line,
                    err
                ))
            })?;
        }
        Ok(())
    }

    fn push(&mut self, raw: &str) -> Result<(), glob::PatternError> {
        let pattern = compile(raw)?;
        let directory = match raw.strip_suffix("/**") {
            Some(dir) if !dir.is_empty() => Some(compile(dir)?),
            _ => None,
        };
        self.patterns.push(ExcludePattern { pattern, directory });
        Ok(())
    }

    /// Test an archive relative name against all patterns.
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(name))
    }
}

/// Selects archive members by name on extract and list.
#[derive(Clone, Debug, Default)]
pub struct MemberFilter {
    names: Vec<(String, Option<Pattern>)>,
}

impl MemberFilter {
    /// With `wildcards` each name is a shell glob, otherwise names match exactly.
    ///
    /// A name which is not a valid glob only matches itself.
    pub fn new(names: &[String], wildcards: bool) -> Self {
        let names = names
            .iter()
            .map(|name| {
                let pattern = if wildcards {
                    match compile(name) {
                        Ok(pattern) => Some(pattern),
                        Err(err) => {
                            log::debug!("member {:?} is no valid pattern ({}), exact match", name, err);
                            None
                        }
                    }
                } else {
                    None
                };
                (name.clone(), pattern)
            })
            .collect();
        Self { names }
    }

    /// Whether the entry is selected. An empty filter selects everything.
    pub fn selects(&self, name: &str) -> bool {
        if self.names.is_empty() {
            return true;
        }
        self.names.iter().any(|(exact, pattern)| match pattern {
            Some(pattern) => pattern.matches_with(name, MATCH_OPTIONS),
            None => exact == name,
        })
    }
}
