//! Change detection between a stored and an observed attribute snapshot.
//!
//! [`detect`] is a pure function: no I/O, no clock, no shared state. Everything
//! that decides *whether* something changed lives here, so concurrency and
//! persistence concerns stay in the reconciler.
//!
//! # Comparison rules
//!
//! - Only attributes the observation actually carries are compared. A channel
//!   that did not see the phone says nothing about the phone.
//! - Unset and empty are the same value. Absence of a handle is the empty
//!   string, so "had a handle, now has none" is a change.
//! - Name fields are trimmed before comparison. Nothing is case-folded.
//! - A delta whose old value is empty is a first-sight population: it is
//!   recorded in the ledger but never reported.

use serde::{Deserialize, Serialize};

use crate::types::{Attribute, Attributes};

/// One attribute's old/new value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Delta {
    pub attribute: Attribute,
    /// Normalized stored value; empty when previously unset.
    pub old: String,
    /// Normalized observed value; empty when observed as absent.
    pub new: String,
}

impl Delta {
    pub fn new(attribute: Attribute, old: impl Into<String>, new: impl Into<String>) -> Self {
        Delta {
            attribute,
            old: old.into(),
            new: new.into(),
        }
    }

    /// True when the attribute had no stored value before this delta.
    pub fn is_first_sight(&self) -> bool {
        self.old.is_empty()
    }

    /// True when this delta should reach the observer.
    pub fn is_reportable(&self) -> bool {
        !self.is_first_sight()
    }

    /// The same delta seen from the other side.
    pub fn swapped(&self) -> Delta {
        Delta {
            attribute: self.attribute,
            old: self.new.clone(),
            new: self.old.clone(),
        }
    }
}

/// Computes the ordered list of deltas from `stored` to `observed`.
///
/// Deltas come out in [`Attribute::ALL`] order.
pub fn detect(stored: &Attributes, observed: &Attributes) -> Vec<Delta> {
    Attribute::ALL
        .into_iter()
        .filter_map(|attribute| {
            let new = attribute.normalize(observed.get(attribute)?);
            let old = stored.normalized(attribute);
            (old != new).then(|| Delta::new(attribute, old, new))
        })
        .collect()
}
