use crate::poll::Sleeper;
use async_trait::async_trait;
use crm::{
    ApiToken, CadenceId, CreateOutcome, Crm, CrmError, PersonFields, PersonId, Record,
    UpstreamBody,
};
use http::StatusCode;
use serde_json::{Value as JsonValue, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum CrmCall {
    FindPeople(String),
    CreatePerson(PersonFields),
    UpdatePerson(PersonId, PersonFields),
    FindCadences(String),
    CreateMembership(PersonId, CadenceId),
}

type Script<T> = Mutex<VecDeque<Result<T, CrmError>>>;

/// In-memory CRM that replays scripted results and records every call.
///
/// Unscripted calls succeed: lookups find nothing, creates return id 42.
#[derive(Default)]
pub struct FakeCrm {
    calls: Mutex<Vec<CrmCall>>,
    tokens: Mutex<Vec<ApiToken>>,
    people: Script<Vec<Record>>,
    creates: Script<CreateOutcome>,
    updates: Script<JsonValue>,
    cadences: Script<Vec<Record>>,
    memberships: Script<JsonValue>,
}

impl FakeCrm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn people(self, result: Result<Vec<Record>, CrmError>) -> Self {
        self.people.lock().unwrap().push_back(result);
        self
    }

    pub fn create(self, result: Result<CreateOutcome, CrmError>) -> Self {
        self.creates.lock().unwrap().push_back(result);
        self
    }

    pub fn update(self, result: Result<JsonValue, CrmError>) -> Self {
        self.updates.lock().unwrap().push_back(result);
        self
    }

    pub fn cadences(self, result: Result<Vec<Record>, CrmError>) -> Self {
        self.cadences.lock().unwrap().push_back(result);
        self
    }

    pub fn membership(self, result: Result<JsonValue, CrmError>) -> Self {
        self.memberships.lock().unwrap().push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<CrmCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&CrmCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn tokens(&self) -> Vec<ApiToken> {
        self.tokens.lock().unwrap().clone()
    }

    fn record(&self, token: &ApiToken, call: CrmCall) {
        self.tokens.lock().unwrap().push(token.clone());
        self.calls.lock().unwrap().push(call);
    }
}

fn next<T>(script: &Script<T>, default: impl FnOnce() -> T) -> Result<T, CrmError> {
    script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Ok(default()))
}

#[async_trait]
impl Crm for FakeCrm {
    async fn find_people_by_email(
        &self,
        token: &ApiToken,
        email: &str,
    ) -> Result<Vec<Record>, CrmError> {
        self.record(token, CrmCall::FindPeople(email.to_string()));
        next(&self.people, Vec::new)
    }

    async fn create_person(
        &self,
        token: &ApiToken,
        fields: &PersonFields,
    ) -> Result<CreateOutcome, CrmError> {
        self.record(token, CrmCall::CreatePerson(fields.clone()));
        next(&self.creates, || created(42))
    }

    async fn update_person(
        &self,
        token: &ApiToken,
        id: PersonId,
        fields: &PersonFields,
    ) -> Result<JsonValue, CrmError> {
        self.record(token, CrmCall::UpdatePerson(id, fields.clone()));
        next(&self.updates, || json!({"data": {"id": id}}))
    }

    async fn find_cadences_by_name(
        &self,
        token: &ApiToken,
        name: &str,
    ) -> Result<Vec<Record>, CrmError> {
        self.record(token, CrmCall::FindCadences(name.to_string()));
        next(&self.cadences, Vec::new)
    }

    async fn create_cadence_membership(
        &self,
        token: &ApiToken,
        person_id: PersonId,
        cadence_id: CadenceId,
    ) -> Result<JsonValue, CrmError> {
        self.record(token, CrmCall::CreateMembership(person_id, cadence_id));
        next(&self.memberships, || {
            json!({"data": {"id": 1, "person_id": person_id, "cadence_id": cadence_id}})
        })
    }
}

pub fn record(id: i64) -> Record {
    Record {
        id,
        raw: json!({"id": id, "email_address": "ann@example.com"}),
    }
}

pub fn created(id: PersonId) -> CreateOutcome {
    CreateOutcome::Created {
        id: Some(id),
        payload: json!({"data": {"id": id}}),
    }
}

pub fn status_error(status: u16, body: JsonValue) -> CrmError {
    CrmError::Status {
        status: StatusCode::from_u16(status).unwrap(),
        body: UpstreamBody::Json(body),
    }
}

/// Records requested delays instead of waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}
