//! Risk & Fraud Scoring
//!
//! [`RiskProfile`] keeps per-user rolling aggregates; [`scorer::score`] is
//! a pure function over a profile and a proposed transaction, safe to call
//! inline on the request path. Profiles are mutated only through the
//! safety validator, never directly by callers.

pub mod profile;
pub mod scorer;

pub use profile::{ProfileStore, RiskProfile};
pub use scorer::{score, RiskConfig, RiskScore};
