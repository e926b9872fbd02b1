//! Per-item error policies

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// What a loop does when an item fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Record the error, leave the slot empty, keep going
    #[default]
    Continue,
    /// Record the error and store it in the slot as well, keep going
    Collect,
    /// Stop handing out new items after the first failure and fail the loop
    Raise,
}

impl ErrorPolicy {
    /// Textual name (`continue`, `collect`, `raise`)
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPolicy::Continue => "continue",
            ErrorPolicy::Collect => "collect",
            ErrorPolicy::Raise => "raise",
        }
    }

    /// True when failures are recovered inside the loop
    pub fn isolates_failures(&self) -> bool {
        !matches!(self, ErrorPolicy::Raise)
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(ErrorPolicy::Continue),
            "collect" => Ok(ErrorPolicy::Collect),
            "raise" => Ok(ErrorPolicy::Raise),
            _ => Err(Error::InvalidPolicy {
                value: s.to_string(),
            }),
        }
    }
}
