//! Upserts a contact in the CRM by email and optionally enrolls it into a
//! cadence, behind a small JSON-over-HTTP API.

pub mod api;
pub mod config;
pub mod errors;
pub mod handler;
pub mod journal;
pub mod metrics_defs;
pub mod poll;
pub mod validation;

#[cfg(test)]
mod testutils;

use crate::api::{ApiError, AppState};
use crate::config::Config;
use crate::handler::EnrollmentHandler;
use crate::journal::Journal;
use crm::CrmClient;
use std::sync::Arc;

pub use errors::EnrollmentError;

/// Builds the handler from `config` and serves the API until shutdown.
pub async fn run(config: Config) -> Result<(), ApiError> {
    config.validate()?;

    let client = CrmClient::new(&config.crm.base_url()?, config.crm.timeout())?;
    let mut handler = EnrollmentHandler::new(Arc::new(client))
        .with_poll_policy(config.creation_poll.policy())
        .with_custom_field_key(config.crm.custom_field_key.clone());

    if let Some(log) = &config.diagnostic_log {
        handler = handler.with_journal(Arc::new(Journal::open(log).await?));
        tracing::info!(path = %log.path.display(), "Writing CRM diagnostic log");
    }

    if config.crm.api_key.is_none() {
        tracing::warn!("No CRM API key configured, requests must supply one in a header");
    }

    let state = AppState::new(handler, config.crm.api_key.clone());
    api::serve(&config.listener, api::router(state, &config.cors)).await
}
