//! NewType wrappers for strong typing throughout the orchestrator.
//!
//! These types prevent accidental mixing of semantically different values
//! (e.g., passing an account name where a model config name is expected).

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Macro to generate a NewType wrapper around a database sequence number.
macro_rules! newtype_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    /// Name of a model configuration in the registry (e.g., "ModelConfigAccount1").
    ///
    /// This is what include/exclude filters and ModelRun rows refer to.
    ModelName
);

newtype_string!(
    /// Account a model configuration forecasts (e.g., "Account1").
    AccountName
);

newtype_string!(
    /// Entity within an account, usually a contract/item pair such as "C100:42".
    EntityKey
);

newtype_id!(
    /// Identifier of a forecast run. Allocated from a persisted sequence, so
    /// later runs always carry larger ids.
    RunId
);

newtype_id!(
    /// Identifier of a per-account model run.
    ModelRunId
);

/// A calendar month, rendered and parsed as `YYYYMM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self, Error> {
        if !(1..=12).contains(&month) {
            return Err(Error::Configuration(format!(
                "month must be in range 1 - 12, got {month}"
            )));
        }
        Ok(Self { year, month })
    }

    /// Parse a month in `YYYYMM` format (e.g. "202002" for February 2020).
    pub fn parse(value: &str) -> Result<Self, Error> {
        let trimmed = value.trim();
        if trimmed.len() != 6 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Configuration(format!(
                "'{value}' does not match the format YYYYMM"
            )));
        }
        let year: i32 = trimmed[..4]
            .parse()
            .map_err(|_| Error::Configuration(format!("'{value}' does not match the format YYYYMM")))?;
        let month: u32 = trimmed[4..]
            .parse()
            .map_err(|_| Error::Configuration(format!("'{value}' does not match the format YYYYMM")))?;
        Self::new(year, month)
    }

    /// The month containing today's date (UTC).
    pub fn current() -> Self {
        let today = chrono::Utc::now().date_naive();
        Self {
            year: today.year(),
            month: today.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Shift by a (possibly negative) number of months.
    pub fn add_months(&self, delta: i32) -> Self {
        let index = self.index() + delta;
        Self {
            year: index.div_euclid(12),
            month: (index.rem_euclid(12) + 1) as u32,
        }
    }

    /// Number of months from `self` to `other` (positive if `other` is later).
    pub fn months_until(&self, other: Month) -> i32 {
        other.index() - self.index()
    }

    pub fn as_yyyymm(&self) -> u32 {
        self.year as u32 * 100 + self.month
    }

    fn index(&self) -> i32 {
        self.year * 12 + self.month as i32 - 1
    }
}

impl TryFrom<u32> for Month {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Month::new((value / 100) as i32, value % 100)
    }
}

impl From<Month> for u32 {
    fn from(value: Month) -> Self {
        value.as_yyyymm()
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}
