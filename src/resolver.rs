//! Pattern-based artifact lookup inside the analysis tree.
//!
//! Patterns are ordinary paths whose components may contain `*` (any run of
//! characters) and `?` (a single character). Wildcards never cross a `/` and
//! never match a leading `.`, so scratch directories created by the trim
//! engine stay invisible to lookups.
//!
//! Resolution is read-only and deterministic:
//! - [`TieBreak::First`] picks the lexicographically smallest match.
//! - [`TieBreak::MostRecent`] picks the newest modification time, ties broken
//!   lexicographically.
//! - [`TieBreak::All`] returns every match in lexicographic order.

use std::cmp::Reverse;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ResolveError;

/// How to choose among several matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    First,
    MostRecent,
    All,
}

/// Resolves `pattern` and applies the tie-break.
///
/// `First` and `MostRecent` return exactly one path or fail with
/// [`ResolveError::NotFound`]; `All` may return an empty list.
pub fn resolve(pattern: &Path, tie_break: TieBreak) -> Result<Vec<PathBuf>, ResolveError> {
    let mut matches = expand(pattern)?;
    debug!(
        "Resolved {} -> {} match(es)",
        pattern.display(),
        matches.len()
    );

    match tie_break {
        TieBreak::All => Ok(matches),
        TieBreak::First => matches
            .drain(..)
            .next()
            .map(|p| vec![p])
            .ok_or_else(|| not_found(pattern)),
        TieBreak::MostRecent => {
            let mut stamped = Vec::with_capacity(matches.len());
            for path in matches {
                let modified = path
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                stamped.push((modified, path));
            }
            // Stable sort keeps lexicographic order among equal timestamps.
            stamped.sort_by_key(|(modified, _)| Reverse(*modified));
            stamped
                .into_iter()
                .next()
                .map(|(_, p)| vec![p])
                .ok_or_else(|| not_found(pattern))
        }
    }
}

/// Lexicographically smallest match.
pub fn first(pattern: &Path) -> Result<PathBuf, ResolveError> {
    single(pattern, TieBreak::First)
}

/// Newest match by modification time.
pub fn most_recent(pattern: &Path) -> Result<PathBuf, ResolveError> {
    single(pattern, TieBreak::MostRecent)
}

/// Every match, possibly none.
pub fn all(pattern: &Path) -> Result<Vec<PathBuf>, ResolveError> {
    resolve(pattern, TieBreak::All)
}

fn single(pattern: &Path, tie_break: TieBreak) -> Result<PathBuf, ResolveError> {
    resolve(pattern, tie_break)?
        .pop()
        .ok_or_else(|| not_found(pattern))
}

fn not_found(pattern: &Path) -> ResolveError {
    ResolveError::NotFound {
        pattern: pattern.display().to_string(),
    }
}

/// One wildcard path component compiled to an anchored regex.
struct ComponentMatcher {
    regex: Regex,
    allow_hidden: bool,
}

impl ComponentMatcher {
    fn compile(component: &str, pattern: &Path) -> Result<Self, ResolveError> {
        let mut expr = String::from("^");
        for c in component.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');
        let regex = Regex::new(&expr).map_err(|e| ResolveError::InvalidPattern {
            pattern: pattern.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            regex,
            allow_hidden: component.starts_with('.'),
        })
    }

    fn matches(&self, name: &str) -> bool {
        if !self.allow_hidden && name.starts_with('.') {
            return false;
        }
        self.regex.is_match(name)
    }
}

fn has_wildcard(component: &str) -> bool {
    component.contains('*') || component.contains('?')
}

/// Expands a pattern into the sorted list of existing paths it matches.
fn expand(pattern: &Path) -> Result<Vec<PathBuf>, ResolveError> {
    // Split into the literal base directory and the wildcard tail.
    let mut base = PathBuf::new();
    let mut tail: Vec<String> = Vec::new();
    for component in pattern.components() {
        let text = component.as_os_str().to_string_lossy().to_string();
        let is_literal = tail.is_empty()
            && (matches!(component, Component::RootDir | Component::Prefix(_))
                || !has_wildcard(&text));
        if is_literal {
            base.push(component.as_os_str());
        } else {
            tail.push(text);
        }
    }

    if tail.is_empty() {
        return Ok(if base.exists() { vec![base] } else { Vec::new() });
    }
    if base.as_os_str().is_empty() {
        base = PathBuf::from(".");
    }
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let matchers = tail
        .iter()
        .map(|c| ComponentMatcher::compile(c, pattern))
        .collect::<Result<Vec<_>, _>>()?;
    let depth = matchers.len();

    // Each level is filtered by its own component; only full-depth entries match.
    let walker = WalkDir::new(&base)
        .max_depth(depth)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            let d = entry.depth();
            if d == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            matchers[d - 1].matches(&name)
        });

    let mut matches = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) if entry.depth() == depth => matches.push(entry.into_path()),
            Ok(_) => {}
            // Dangling links and unreadable directories simply do not match.
            Err(e) if e.io_error().is_some() => {
                debug!("Skipping unreadable entry under {}: {}", base.display(), e)
            }
            Err(e) => {
                return Err(ResolveError::Walk {
                    pattern: pattern.display().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
    matches.sort();
    Ok(matches)
}
