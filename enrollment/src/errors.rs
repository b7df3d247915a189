use crate::validation::ValidationErrors;
use crm::{CrmError, PersonId, UpstreamBody};
use http::StatusCode;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;

/// The step of the enrollment flow a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    Credential,
    Lookup,
    Upsert,
    CreationUnconfirmed,
    MissingId,
    CadenceLookup,
    Enrollment,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Credential => "credential",
            Stage::Lookup => "lookup",
            Stage::Upsert => "upsert",
            Stage::CreationUnconfirmed => "creation_unconfirmed",
            Stage::MissingId => "missing_id",
            Stage::CadenceLookup => "cadence_lookup",
            Stage::Enrollment => "enrollment",
        }
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed or inconclusive CRM call, tagged with the stage it happened in.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamFailure {
    pub stage: Stage,
    pub status: Option<StatusCode>,
    pub body: Option<UpstreamBody>,
    pub message: String,
}

impl UpstreamFailure {
    pub fn from_crm(stage: Stage, error: &CrmError) -> Self {
        UpstreamFailure {
            stage,
            status: error.status(),
            body: error.body().cloned(),
            message: error.to_string(),
        }
    }

    /// Upstream 4xx/5xx statuses are passed through, anything else is a 502.
    pub fn response_status(&self) -> StatusCode {
        match self.status {
            Some(status) if status.is_client_error() || status.is_server_error() => status,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated,
}

impl UpsertAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertAction::Created => "created",
            UpsertAction::Updated => "updated",
        }
    }
}

impl Serialize for UpsertAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A contact that exists in the CRM after this request.
#[derive(Debug, Clone, PartialEq)]
pub struct Persisted {
    pub person_id: PersonId,
    pub action: UpsertAction,
    pub contact: JsonValue,
}

#[derive(thiserror::Error, Debug)]
pub enum EnrollmentError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("{failure}")]
    Upstream {
        failure: UpstreamFailure,
        persisted: Option<Persisted>,
    },

    #[error("cadence {name:?} not found")]
    CadenceNotFound { name: String, persisted: Persisted },

    /// The contact was saved but enrolling it failed.
    #[error("contact {} saved but enrollment failed: {}", persisted.person_id, failure.message)]
    PartialSuccess {
        failure: UpstreamFailure,
        persisted: Persisted,
    },

    #[error("API key not provided")]
    MissingCredential,
}

impl EnrollmentError {
    pub fn upstream(failure: UpstreamFailure) -> Self {
        EnrollmentError::Upstream {
            failure,
            persisted: None,
        }
    }

    /// Error kind tag reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            EnrollmentError::Validation(_) => "validation_error",
            EnrollmentError::Upstream { .. } => "upstream_error",
            EnrollmentError::CadenceNotFound { .. } => "not_found",
            EnrollmentError::PartialSuccess { .. } => "partial_success",
            EnrollmentError::MissingCredential => "internal_error",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            EnrollmentError::Validation(_) => Stage::Validation,
            EnrollmentError::MissingCredential => Stage::Credential,
            EnrollmentError::Upstream { failure, .. }
            | EnrollmentError::PartialSuccess { failure, .. } => failure.stage,
            EnrollmentError::CadenceNotFound { .. } => Stage::CadenceLookup,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EnrollmentError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EnrollmentError::Upstream { failure, .. }
            | EnrollmentError::PartialSuccess { failure, .. } => failure.response_status(),
            EnrollmentError::CadenceNotFound { .. } => StatusCode::NOT_FOUND,
            EnrollmentError::MissingCredential => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn persisted(&self) -> Option<&Persisted> {
        match self {
            EnrollmentError::Upstream { persisted, .. } => persisted.as_ref(),
            EnrollmentError::CadenceNotFound { persisted, .. }
            | EnrollmentError::PartialSuccess { persisted, .. } => Some(persisted),
            EnrollmentError::Validation(_) | EnrollmentError::MissingCredential => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn persisted() -> Persisted {
        Persisted {
            person_id: 42,
            action: UpsertAction::Created,
            contact: json!({"data": {"id": 42}}),
        }
    }

    #[test]
    fn test_upstream_status_passthrough() {
        let mut failure = UpstreamFailure {
            stage: Stage::Lookup,
            status: None,
            body: None,
            message: "timed out".into(),
        };
        assert_eq!(failure.response_status(), StatusCode::BAD_GATEWAY);

        failure.status = Some(StatusCode::OK);
        assert_eq!(failure.response_status(), StatusCode::BAD_GATEWAY);

        failure.status = Some(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(failure.response_status(), StatusCode::TOO_MANY_REQUESTS);

        failure.status = Some(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(failure.response_status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_from_crm_keeps_status_and_body() {
        let error = CrmError::Status {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: UpstreamBody::Json(json!({"errors": {"cadence_id": ["is invalid"]}})),
        };
        let failure = UpstreamFailure::from_crm(Stage::Enrollment, &error);
        assert_eq!(failure.status, Some(StatusCode::UNPROCESSABLE_ENTITY));
        assert_eq!(failure.body, error.body().cloned());
        assert_eq!(
            failure.to_string(),
            "enrollment failed: CRM responded with status 422 Unprocessable Entity"
        );
    }

    #[test]
    fn test_error_classification() {
        let partial = EnrollmentError::PartialSuccess {
            failure: UpstreamFailure {
                stage: Stage::Enrollment,
                status: Some(StatusCode::UNPROCESSABLE_ENTITY),
                body: None,
                message: "rejected".into(),
            },
            persisted: persisted(),
        };
        assert_eq!(partial.kind(), "partial_success");
        assert_eq!(partial.stage(), Stage::Enrollment);
        assert_eq!(partial.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(partial.persisted().map(|p| p.person_id), Some(42));
        assert_eq!(
            partial.to_string(),
            "contact 42 saved but enrollment failed: rejected"
        );

        let not_found = EnrollmentError::CadenceNotFound {
            name: "Welcome".into(),
            persisted: persisted(),
        };
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.stage(), Stage::CadenceLookup);

        let validation = EnrollmentError::from(ValidationErrors::single("email", "is required"));
        assert_eq!(validation.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(validation.persisted().is_none());

        assert_eq!(
            EnrollmentError::MissingCredential.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(EnrollmentError::MissingCredential.kind(), "internal_error");
        assert_eq!(EnrollmentError::MissingCredential.stage(), Stage::Credential);
    }

    #[test]
    fn test_tags_serialize_as_strings() {
        for stage in [Stage::Credential, Stage::CadenceLookup, Stage::CreationUnconfirmed] {
            assert_eq!(serde_json::to_value(stage).unwrap(), stage.as_str());
        }
        assert_eq!(serde_json::to_value(UpsertAction::Updated).unwrap(), "updated");
    }
}
