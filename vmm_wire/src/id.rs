// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// A VM identifier: an ordered sequence of short textual labels.
///
/// Two flat forms exist: the canonical dotted string (`Display`/`FromStr`)
/// and the typed sequence (`labels()`). Equality is sequence equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(Vec<String>);

/// Maximum length of a single label, chosen to match DNS-label conventions
/// used for tap device and FIFO naming.
const MAX_LABEL_LEN: usize = 63;

impl VmId {
    /// The empty identifier, used on the wire to mean "no specific VM"
    /// (e.g. an `Info` request asking for every record).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Builds an identifier from already-validated labels.
    pub fn from_labels(labels: Vec<String>) -> Result<Self, DecodeError> {
        for label in &labels {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(DecodeError::InvalidIdentifier);
            }
        }
        Ok(Self(labels))
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The derived path an FIFO for this identifier lives at, relative to
    /// the runtime directory: `<id>.fifo`.
    pub fn fifo_file_name(&self) -> String {
        format!("{self}.fifo")
    }

    /// True if `self` is `other` or a descendant of `other` in the label
    /// hierarchy -- used for prefix lookups in `Info`.
    pub fn has_prefix(&self, other: &VmId) -> bool {
        self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for VmId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        Self::from_labels(s.split('.').map(str::to_owned).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_from_str() {
        let id: VmId = "prod.web.a".parse().unwrap();
        assert_eq!(id.labels(), &["prod", "web", "a"]);
        assert_eq!(id.to_string(), "prod.web.a");
    }

    #[test]
    fn empty_string_is_root() {
        let id: VmId = "".parse().unwrap();
        assert!(id.is_empty());
    }

    #[test]
    fn rejects_empty_label() {
        let result: Result<VmId, _> = "a..b".parse();
        assert!(matches!(result, Err(DecodeError::InvalidIdentifier)));
    }

    #[test]
    fn equality_is_sequence_equality() {
        let a: VmId = "a.b".parse().unwrap();
        let b = VmId::from_labels(vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn prefix_matching() {
        let parent: VmId = "prod".parse().unwrap();
        let child: VmId = "prod.web".parse().unwrap();
        assert!(child.has_prefix(&parent));
        assert!(!parent.has_prefix(&child));
    }
}
