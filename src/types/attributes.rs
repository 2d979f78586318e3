//! The tracked attribute set of an identity.
//!
//! Stored snapshots and freshly observed snapshots share one shape: a fixed
//! set of named optional strings. In an observation `None` means "this channel
//! did not observe the field", while `Some("")` means "observed, and empty".
//! In a stored snapshot `None` and `Some("")` are equivalent.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One tracked attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    /// Display first name.
    FirstName,
    /// Display last name.
    LastName,
    /// Public handle (username).
    Handle,
    /// Phone number, when the deployment can see it.
    Phone,
}

impl Attribute {
    /// Every tracked attribute, in report order.
    pub const ALL: [Attribute; 4] = [
        Attribute::FirstName,
        Attribute::LastName,
        Attribute::Handle,
        Attribute::Phone,
    ];

    /// Stable name used in the change ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::FirstName => "first_name",
            Attribute::LastName => "last_name",
            Attribute::Handle => "handle",
            Attribute::Phone => "phone",
        }
    }

    /// Human-readable label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            Attribute::FirstName => "First name",
            Attribute::LastName => "Last name",
            Attribute::Handle => "Handle",
            Attribute::Phone => "Phone",
        }
    }

    /// Name fields are trimmed before comparison; handles and phones are not.
    pub fn is_name(&self) -> bool {
        matches!(self, Attribute::FirstName | Attribute::LastName)
    }

    /// Normalizes a raw value for comparison and storage.
    ///
    /// Trim only. Case is preserved because a case change is itself a change.
    pub fn normalize<'a>(&self, value: &'a str) -> &'a str {
        if self.is_name() { value.trim() } else { value }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of the tracked attributes of one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Attributes {
    /// Creates a snapshot with only the first name observed.
    pub fn named(first: impl Into<String>) -> Self {
        Attributes {
            first: Some(first.into()),
            ..Self::default()
        }
    }

    /// Builder-style setter for the last name.
    pub fn with_last(mut self, last: impl Into<String>) -> Self {
        self.last = Some(last.into());
        self
    }

    /// Builder-style setter for the handle.
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    /// Builder-style setter for the phone.
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Returns the raw value of an attribute.
    pub fn get(&self, attribute: Attribute) -> Option<&str> {
        match attribute {
            Attribute::FirstName => self.first.as_deref(),
            Attribute::LastName => self.last.as_deref(),
            Attribute::Handle => self.handle.as_deref(),
            Attribute::Phone => self.phone.as_deref(),
        }
    }

    /// Sets the value of an attribute.
    pub fn set(&mut self, attribute: Attribute, value: Option<String>) {
        let slot = match attribute {
            Attribute::FirstName => &mut self.first,
            Attribute::LastName => &mut self.last,
            Attribute::Handle => &mut self.handle,
            Attribute::Phone => &mut self.phone,
        };
        *slot = value;
    }

    /// Returns the normalized value with unset folded into the empty string.
    pub fn normalized(&self, attribute: Attribute) -> &str {
        self.get(attribute)
            .map(|v| attribute.normalize(v))
            .unwrap_or("")
    }

    /// True when the snapshot carries enough to register an identity.
    ///
    /// Some listings return stripped-down member records without a first
    /// name; those must be re-fetched before they can stand as observations.
    pub fn is_complete(&self) -> bool {
        self.first.is_some()
    }

    /// Overlays the observed fields of `observed` onto `self`.
    ///
    /// Fields `observed` did not carry keep their stored value. Observed
    /// values are stored normalized.
    pub fn merged_with(&self, observed: &Attributes) -> Attributes {
        let mut merged = self.clone();
        for attribute in Attribute::ALL {
            if let Some(value) = observed.get(attribute) {
                merged.set(attribute, Some(attribute.normalize(value).to_string()));
            }
        }
        merged
    }

    /// Display name as "first last", skipping empty parts.
    pub fn display_name(&self) -> String {
        let first = self.normalized(Attribute::FirstName);
        let last = self.normalized(Attribute::LastName);
        match (first.is_empty(), last.is_empty()) {
            (false, false) => format!("{} {}", first, last),
            (false, true) => first.to_string(),
            (true, false) => last.to_string(),
            (true, true) => String::new(),
        }
    }
}
