//! GitHub Actions cache service API.
//!
//! The versioned module layout mirrors the service's `api-version` header:
//! new preview versions get a new module rather than in-place edits, so
//! you're not writing backwards-incompatible changes to existing consumers.

pub mod v1;
