//! Path algebra over absolute POSIX-style paths.
//!
//! Pure functions only: no filesystem access and no symlink resolution.
//! Callers hand in already-resolved paths; anything containing a `..`
//! segment is rejected rather than collapsed.

use crate::types::ConflictType;
use crate::{Error, Result};

/// Path comparison rules fixed at service startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathAlgebra {
    case_sensitive: bool,
}

impl Default for PathAlgebra {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PathAlgebra {
    pub const fn new(case_sensitive: bool) -> Self {
        Self { case_sensitive }
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Collapse repeated and trailing slashes, drop `.` segments, reject `..`.
    pub fn normalize(&self, input: &str) -> Result<String> {
        if input.is_empty() {
            return Err(Error::validation("path must not be empty"));
        }
        if input.contains('\0') {
            return Err(Error::validation(format!(
                "path contains a NUL byte: {:?}",
                input
            )));
        }
        if !input.starts_with('/') {
            return Err(Error::validation(format!("path must be absolute: {}", input)));
        }

        let mut normalized = String::with_capacity(input.len());
        for segment in input.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(Error::validation(format!(
                        "path must not contain '..' segments: {}",
                        input
                    )));
                }
                other => {
                    normalized.push('/');
                    normalized.push_str(other);
                }
            }
        }

        if normalized.is_empty() {
            normalized.push('/');
        }
        Ok(normalized)
    }

    /// Form used for overlap arithmetic. Case-folded when comparisons are insensitive.
    pub fn reserved_form(&self, normalized: &str) -> String {
        if self.case_sensitive {
            normalized.to_string()
        } else {
            normalized.to_lowercase()
        }
    }

    /// True iff `child` equals `parent` or lies beneath it.
    pub fn is_within(&self, parent: &str, child: &str) -> bool {
        let parent = self.reserved_form(parent);
        let child = self.reserved_form(child);
        within(&parent, &child)
    }

    /// Classify how `candidate` relates to an `existing` reservation.
    pub fn classify(&self, existing: &str, candidate: &str) -> ConflictType {
        let existing = self.reserved_form(existing);
        let candidate = self.reserved_form(candidate);

        if existing == candidate {
            ConflictType::Exact
        } else if within(&existing, &candidate) {
            ConflictType::DescendantOfExisting
        } else if within(&candidate, &existing) {
            ConflictType::AncestorOfExisting
        } else {
            ConflictType::SiblingNoConflict
        }
    }
}

fn within(parent: &str, child: &str) -> bool {
    if parent == child {
        return true;
    }
    // The root is an ancestor of every absolute path.
    if parent == "/" {
        return child.starts_with('/');
    }
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

/// Normalize with case-sensitive rules.
pub fn normalize(input: &str) -> Result<String> {
    PathAlgebra::default().normalize(input)
}

/// Containment test with case-sensitive rules.
pub fn is_within(parent: &str, child: &str) -> bool {
    PathAlgebra::default().is_within(parent, child)
}

/// Overlap classification with case-sensitive rules.
pub fn classify(existing: &str, candidate: &str) -> ConflictType {
    PathAlgebra::default().classify(existing, candidate)
}
