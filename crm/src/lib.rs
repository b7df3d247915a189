//! Client for the CRM's v2 REST API.
//!
//! Only the handful of endpoints needed to upsert a person and enroll it in a
//! cadence are covered. Responses are kept as raw JSON next to the few fields
//! we actually read, so callers can pass upstream payloads through unchanged.

pub mod client;
pub mod errors;
pub mod metrics_defs;
pub mod types;

pub use client::{Crm, CrmClient};
pub use errors::CrmError;
pub use types::{
    ApiToken, CadenceId, CreateOutcome, PersonFields, PersonId, Record, UpstreamBody,
};
