//! Path eligibility shared by the watcher and the reconciliation scanner.

use std::path::{Component, Path};

use glob::{MatchOptions, Pattern};

use crate::error::{Result, SyncError};

/// Editor scratch files, OS metadata folders, recycle bins and in-progress
/// sync markers.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "*.tmp",
    "*.temp",
    "*.swp",
    "*.swx",
    "*~",
    "~$*",
    ".~lock.*#",
    "*.part",
    "*.crdownload",
    "*.partial",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "@eaDir",
    "#recycle",
    "#snapshot",
    ".Trash*",
    "$RECYCLE.BIN",
    ".sync",
    "*.!sync",
    ".syncthing.*",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct IgnorePattern {
    pattern: Pattern,
    /// Patterns containing a separator match the root-relative path instead
    /// of a single component name.
    path_scoped: bool,
}

/// Compiled ignore rules. Evaluation is a pure function of the rules and
/// the path.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    patterns: Vec<IgnorePattern>,
    include_hidden: bool,
}

impl ChangeFilter {
    pub fn new<I, S>(patterns: I, include_hidden: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|raw| {
                let raw = raw.as_ref().trim();
                (!raw.is_empty()).then(|| raw.to_string())
            })
            .map(|raw| {
                let trimmed = raw.trim_start_matches('/');
                Pattern::new(trimmed)
                    .map(|pattern| IgnorePattern {
                        pattern,
                        path_scoped: trimmed.contains('/'),
                    })
                    .map_err(|e| {
                        SyncError::InvalidInput(format!(
                            "invalid ignore pattern {raw:?}: {e}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            include_hidden,
        })
    }

    /// Built-in defaults followed by `extra`.
    pub fn with_defaults<I, S>(extra: I, include_hidden: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut all: Vec<String> =
            DEFAULT_IGNORE_PATTERNS.iter().map(|p| p.to_string()).collect();
        all.extend(extra.into_iter().map(|p| p.as_ref().to_string()));
        Self::new(all, include_hidden)
    }

    /// Whether a single file or directory name is excluded on its own.
    pub fn is_ignored_name(&self, name: &str) -> bool {
        if !self.include_hidden && name.starts_with('.') {
            return true;
        }
        self.patterns
            .iter()
            .filter(|p| !p.path_scoped)
            .any(|p| p.pattern.matches_with(name, MATCH_OPTIONS))
    }

    /// Whether `path` under `root` should be tracked. Paths outside `root`
    /// are never eligible.
    pub fn is_eligible(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };

        let mut names = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => match name.to_str() {
                    Some(name) => names.push(name),
                    None => return false,
                },
                Component::CurDir => {}
                _ => return false,
            }
        }

        if names.is_empty() {
            return false;
        }
        if names.iter().any(|name| self.is_ignored_name(name)) {
            return false;
        }

        let joined = names.join("/");
        !self
            .patterns
            .iter()
            .filter(|p| p.path_scoped)
            .any(|p| p.pattern.matches_with(&joined, MATCH_OPTIONS))
    }
}
