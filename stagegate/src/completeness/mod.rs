//! Multi-source completeness validation.
//!
//! The authoritative expected set for a work unit comes from a
//! [`ReferenceProvider`]; each [`CoverageSource`] is scored independently
//! against it with its own threshold, and entities below a noise floor of
//! signals do not count as present.

mod reference;
mod result;
mod validator;

#[cfg(test)]
pub use reference::MockReferenceProvider;
pub use reference::{CoverageSource, ReferenceProvider};
pub use result::{CompletenessReport, CompletenessResult, CompletenessStatus, SourceCoverage};
pub use validator::CompletenessValidator;
