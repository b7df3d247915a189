use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

pub type PersonId = i64;
pub type CadenceId = i64;

/// Bearer token used to authenticate against the CRM.
///
/// The value is only ever written into outbound `Authorization` headers; the
/// `Debug` implementation never prints it.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiToken(String);

impl ApiToken {
    pub fn new<T: Into<String>>(token: T) -> Self {
        ApiToken(token.into())
    }

    /// Returns a token only if the value is non-empty after trimming.
    pub fn non_empty(token: &str) -> Option<Self> {
        let token = token.trim();
        (!token.is_empty()).then(|| ApiToken(token.to_string()))
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken(<redacted>)")
    }
}

/// Person attributes sent on both create and update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersonFields {
    pub first_name: String,
    pub last_name: String,
    pub email_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_crm_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_crm_id: Option<String>,
    #[serde(
        rename = "person_company_website",
        skip_serializing_if = "Option::is_none"
    )]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, String>,
}

/// A record returned by a list endpoint: its numeric id and the untouched JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    pub raw: JsonValue,
}

impl Record {
    pub(crate) fn from_raw(raw: JsonValue) -> Option<Self> {
        let id = raw.get("id").and_then(JsonValue::as_i64)?;
        Some(Record { id, raw })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The person was created synchronously. `id` is `None` when the response
    /// body did not contain a usable `data.id`.
    Created {
        id: Option<PersonId>,
        payload: JsonValue,
    },
    /// HTTP 202: the CRM queued the creation and the id is not known yet.
    Accepted { payload: UpstreamBody },
}

/// A response body captured without assuming it is well-formed.
///
/// Bodies that parse as JSON are kept as JSON, everything else as text, so a
/// malformed error body can always be reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UpstreamBody {
    Json(JsonValue),
    Text(String),
}

impl UpstreamBody {
    pub fn from_text(text: String) -> Self {
        match serde_json::from_str::<JsonValue>(&text) {
            Ok(json) => UpstreamBody::Json(json),
            Err(_) => UpstreamBody::Text(text),
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            UpstreamBody::Json(json) => Some(json),
            UpstreamBody::Text(_) => None,
        }
    }

    pub fn into_json(self) -> JsonValue {
        match self {
            UpstreamBody::Json(json) => json,
            UpstreamBody::Text(text) => JsonValue::String(text),
        }
    }
}

// Envelope used by every list endpoint: `{"data": [...], "metadata": {...}}`.
#[derive(Deserialize)]
pub(crate) struct Listing {
    pub data: Vec<JsonValue>,
}

#[derive(Serialize)]
pub(crate) struct NewCadenceMembership {
    pub person_id: PersonId,
    pub cadence_id: CadenceId,
}
