pub mod eval;
pub mod macro_exp;
pub mod mechanism;
pub mod ptr;
pub mod record;

use std::fmt;

pub use eval::{CheckParams, Evaluator, SpfOutcome, Step};
pub use record::SpfRecord;

/// SPF evaluation result (RFC 7208 Section 2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    /// Sender is authorized.
    Pass,
    /// Sender is NOT authorized.
    Fail,
    /// Weak authorization failure.
    SoftFail,
    /// No assertion made.
    Neutral,
    /// No SPF record found.
    None,
    /// Transient DNS error.
    TempError,
    /// Permanent error (syntax, too many lookups, etc.).
    PermError,
}

impl SpfResult {
    /// The string form used when emitting Received-SPF headers.
    pub fn as_str(self) -> &'static str {
        match self {
            SpfResult::Pass => "Pass",
            SpfResult::Fail => "Fail",
            SpfResult::SoftFail => "SoftFail",
            SpfResult::Neutral => "Neutral",
            SpfResult::None => "None",
            SpfResult::TempError => "TempError",
            SpfResult::PermError => "PermError",
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
