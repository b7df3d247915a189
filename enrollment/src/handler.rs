use crate::config::DEFAULT_CUSTOM_FIELD_KEY;
use crate::errors::{EnrollmentError, Persisted, Stage, UpsertAction, UpstreamFailure};
use crate::journal::Journal;
use crate::metrics_defs::{CREATION_POLL_ATTEMPTS, LOOKUP_AMBIGUOUS};
use crate::poll::{PollPolicy, Sleeper, TokioSleeper};
use crate::validation::{CadenceRef, ContactRequest};
use crm::{
    ApiToken, CadenceId, CreateOutcome, Crm, CrmError, PersonFields, PersonId, Record,
    UpstreamBody,
};
use http::StatusCode;
use serde_json::{Value as JsonValue, json};
use shared::counter;
use std::sync::Arc;

/// Result of a fully successful request.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrolled {
    pub person_id: PersonId,
    pub action: UpsertAction,
    pub contact: JsonValue,
    /// Present only when enrollment was requested.
    pub cadence_membership: Option<JsonValue>,
}

/// Upserts a contact by email and optionally enrolls it into a cadence.
///
/// Every request runs the same sequence: lookup, create or update, then
/// (optionally) cadence resolution and enrollment. Nothing is retried except
/// the bounded lookup that follows a queued creation.
pub struct EnrollmentHandler {
    crm: Arc<dyn Crm>,
    sleeper: Arc<dyn Sleeper>,
    poll_policy: PollPolicy,
    custom_field_key: String,
    journal: Option<Arc<Journal>>,
}

impl EnrollmentHandler {
    pub fn new(crm: Arc<dyn Crm>) -> Self {
        EnrollmentHandler {
            crm,
            sleeper: Arc::new(TokioSleeper),
            poll_policy: PollPolicy::default(),
            custom_field_key: DEFAULT_CUSTOM_FIELD_KEY.to_string(),
            journal: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_poll_policy(mut self, poll_policy: PollPolicy) -> Self {
        self.poll_policy = poll_policy;
        self
    }

    pub fn with_custom_field_key(mut self, key: impl Into<String>) -> Self {
        self.custom_field_key = key.into();
        self
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Validates `request`, upserts the contact and enrolls it if asked to.
    ///
    /// Validation runs before the credential check so that malformed requests
    /// are reported as such even when no token is configured.
    pub async fn upsert_and_enroll(
        &self,
        token: Option<&ApiToken>,
        request: ContactRequest,
    ) -> Result<Enrolled, EnrollmentError> {
        let contact = request.validate()?;
        let token = token.ok_or(EnrollmentError::MissingCredential)?;
        let fields = contact.person_fields(&self.custom_field_key);

        let existing = self
            .lookup(token, &contact.email, "lookup")
            .await
            .map_err(|e| EnrollmentError::upstream(UpstreamFailure::from_crm(Stage::Lookup, &e)))?;

        let persisted = match existing {
            Some(record) => self.update(token, record.id, &fields).await?,
            None => self.create(token, &contact.email, &fields).await?,
        };

        tracing::info!(
            person_id = persisted.person_id,
            action = persisted.action.as_str(),
            "Contact upserted"
        );

        let cadence_membership = match contact.cadence {
            Some(cadence) => {
                let cadence_id = match cadence {
                    CadenceRef::Id(id) => id,
                    CadenceRef::Name(name) => {
                        self.resolve_cadence(token, name, &persisted).await?
                    }
                };
                Some(self.enroll(token, &persisted, cadence_id).await?)
            }
            None => None,
        };

        Ok(Enrolled {
            person_id: persisted.person_id,
            action: persisted.action,
            contact: persisted.contact,
            cadence_membership,
        })
    }

    /// First match wins when the CRM returns several people for one email.
    async fn lookup(
        &self,
        token: &ApiToken,
        email: &str,
        stage: &str,
    ) -> Result<Option<Record>, CrmError> {
        let result = self.crm.find_people_by_email(token, email).await;
        self.journal(stage, || Some(json!({ "email": email })), &result)
            .await;

        let mut people = result?;
        if people.len() > 1 {
            tracing::warn!(
                matches = people.len(),
                chosen = people[0].id,
                "Several contacts share this email, using the first"
            );
            counter!(LOOKUP_AMBIGUOUS, "kind" => "person").increment(1);
        }
        Ok((!people.is_empty()).then(|| people.swap_remove(0)))
    }

    async fn update(
        &self,
        token: &ApiToken,
        person_id: PersonId,
        fields: &PersonFields,
    ) -> Result<Persisted, EnrollmentError> {
        let result = self.crm.update_person(token, person_id, fields).await;
        self.journal("update", || serde_json::to_value(fields).ok(), &result)
            .await;

        let contact = result
            .map_err(|e| EnrollmentError::upstream(UpstreamFailure::from_crm(Stage::Upsert, &e)))?;

        Ok(Persisted {
            person_id,
            action: UpsertAction::Updated,
            contact,
        })
    }

    async fn create(
        &self,
        token: &ApiToken,
        email: &str,
        fields: &PersonFields,
    ) -> Result<Persisted, EnrollmentError> {
        let result = self.crm.create_person(token, fields).await;
        self.journal("create", || serde_json::to_value(fields).ok(), &result)
            .await;

        let outcome = result
            .map_err(|e| EnrollmentError::upstream(UpstreamFailure::from_crm(Stage::Upsert, &e)))?;

        match outcome {
            CreateOutcome::Created {
                id: Some(person_id),
                payload,
            } => Ok(created(person_id, payload)),
            CreateOutcome::Created { id: None, payload } => {
                tracing::warn!("Create response carried no contact id, looking it up by email");
                match self.lookup(token, email, "missing_id_lookup").await {
                    Ok(Some(record)) => Ok(found(record)),
                    Ok(None) => Err(EnrollmentError::upstream(UpstreamFailure {
                        stage: Stage::MissingId,
                        status: None,
                        body: Some(UpstreamBody::Json(payload)),
                        message: "contact created without an id and not found by email".into(),
                    })),
                    Err(e) => Err(EnrollmentError::upstream(UpstreamFailure::from_crm(
                        Stage::MissingId,
                        &e,
                    ))),
                }
            }
            CreateOutcome::Accepted { payload } => self.await_creation(token, email, payload).await,
        }
    }

    /// Polls the lookup endpoint until a queued creation becomes visible.
    async fn await_creation(
        &self,
        token: &ApiToken,
        email: &str,
        payload: UpstreamBody,
    ) -> Result<Persisted, EnrollmentError> {
        let policy = self.poll_policy;

        for attempt in 1..=policy.max_attempts {
            self.sleeper.sleep(policy.delay).await;
            counter!(CREATION_POLL_ATTEMPTS).increment(1);

            match self.lookup(token, email, "creation_poll").await {
                Ok(Some(record)) => {
                    tracing::debug!(attempt, person_id = record.id, "Queued contact is visible");
                    return Ok(found(record));
                }
                Ok(None) => {
                    tracing::debug!(attempt, "Queued contact not visible yet");
                }
                Err(e) => {
                    return Err(EnrollmentError::upstream(UpstreamFailure::from_crm(
                        Stage::CreationUnconfirmed,
                        &e,
                    )));
                }
            }
        }

        Err(EnrollmentError::upstream(UpstreamFailure {
            stage: Stage::CreationUnconfirmed,
            status: Some(StatusCode::ACCEPTED),
            body: Some(payload),
            message: format!(
                "creation was queued but the contact was not found after {} lookup(s)",
                policy.max_attempts
            ),
        }))
    }

    async fn resolve_cadence(
        &self,
        token: &ApiToken,
        name: String,
        persisted: &Persisted,
    ) -> Result<CadenceId, EnrollmentError> {
        let result = self.crm.find_cadences_by_name(token, &name).await;
        self.journal("cadence_lookup", || Some(json!({ "name": name })), &result)
            .await;

        let cadences = result.map_err(|e| EnrollmentError::Upstream {
            failure: UpstreamFailure::from_crm(Stage::CadenceLookup, &e),
            persisted: Some(persisted.clone()),
        })?;

        let Some(first) = cadences.first() else {
            return Err(EnrollmentError::CadenceNotFound {
                name,
                persisted: persisted.clone(),
            });
        };

        if cadences.len() > 1 {
            tracing::warn!(
                cadence_name = %name,
                matches = cadences.len(),
                chosen = first.id,
                "Several cadences share this name, using the first"
            );
            counter!(LOOKUP_AMBIGUOUS, "kind" => "cadence").increment(1);
        }

        Ok(first.id)
    }

    async fn enroll(
        &self,
        token: &ApiToken,
        persisted: &Persisted,
        cadence_id: CadenceId,
    ) -> Result<JsonValue, EnrollmentError> {
        let person_id = persisted.person_id;
        let result = self
            .crm
            .create_cadence_membership(token, person_id, cadence_id)
            .await;
        self.journal(
            "enrollment",
            || Some(json!({ "person_id": person_id, "cadence_id": cadence_id })),
            &result,
        )
        .await;

        result.map_err(|e| {
            tracing::warn!(person_id, cadence_id, error = %e, "Enrollment failed after upsert");
            EnrollmentError::PartialSuccess {
                failure: UpstreamFailure::from_crm(Stage::Enrollment, &e),
                persisted: persisted.clone(),
            }
        })
    }

    async fn journal<T: Summarize>(
        &self,
        stage: &str,
        request: impl FnOnce() -> Option<JsonValue>,
        result: &Result<T, CrmError>,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };

        let (status, response) = match result {
            Ok(value) => value.summarize(),
            Err(e) => (
                e.status().map(|s| s.as_u16()),
                Some(match e.body() {
                    Some(body) => body.clone().into_json(),
                    None => JsonValue::String(e.to_string()),
                }),
            ),
        };

        journal
            .append(stage, request().as_ref(), status, response.as_ref())
            .await;
    }
}

fn created(person_id: PersonId, contact: JsonValue) -> Persisted {
    Persisted {
        person_id,
        action: UpsertAction::Created,
        contact,
    }
}

// Wraps a looked-up record the way create responses are shaped.
fn found(record: Record) -> Persisted {
    created(record.id, json!({ "data": record.raw }))
}

/// Status and body of a successful CRM call, as written to the journal.
trait Summarize {
    fn summarize(&self) -> (Option<u16>, Option<JsonValue>);
}

impl Summarize for Vec<Record> {
    fn summarize(&self) -> (Option<u16>, Option<JsonValue>) {
        let records = self.iter().map(|r| r.raw.clone()).collect();
        (None, Some(JsonValue::Array(records)))
    }
}

impl Summarize for CreateOutcome {
    fn summarize(&self) -> (Option<u16>, Option<JsonValue>) {
        match self {
            CreateOutcome::Created { payload, .. } => (None, Some(payload.clone())),
            CreateOutcome::Accepted { payload } => (
                Some(StatusCode::ACCEPTED.as_u16()),
                Some(payload.clone().into_json()),
            ),
        }
    }
}

impl Summarize for JsonValue {
    fn summarize(&self) -> (Option<u16>, Option<JsonValue>) {
        (None, Some(self.clone()))
    }
}
