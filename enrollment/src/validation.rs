use crm::{CadenceId, PersonFields};
use serde::{Deserialize, Serialize};
use url::Url;

/// Body of `POST /create_contact_and_enroll`.
///
/// Every field is optional at the type level so that missing fields are
/// reported together by [`ContactRequest::validate`] instead of failing
/// deserialization on the first one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub owner_crm_id: Option<String>,
    pub account_crm_id: Option<String>,
    pub website: Option<String>,
    pub custom_email_template: Option<String>,
    pub cadence_id: Option<i64>,
    pub cadence_name: Option<String>,
    pub enroll: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldError {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid request: {}", describe(.0))]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationErrors(vec![FieldError::new(field, message)])
    }
}

fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Which cadence to enroll the contact into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CadenceRef {
    Id(CadenceId),
    Name(String),
}

/// A request that passed validation. The email is normalized to lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidContact {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub owner_crm_id: Option<String>,
    pub account_crm_id: Option<String>,
    pub website: Option<Url>,
    pub memo: Option<String>,
    pub cadence: Option<CadenceRef>,
}

impl ValidContact {
    /// The field set sent on both create and update. The memo is stored under
    /// `custom_field_key`.
    pub fn person_fields(&self, custom_field_key: &str) -> PersonFields {
        let mut fields = PersonFields {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email_address: self.email.clone(),
            phone: self.phone.clone(),
            owner_crm_id: self.owner_crm_id.clone(),
            account_crm_id: self.account_crm_id.clone(),
            website: self.website.as_ref().map(Url::to_string),
            ..Default::default()
        };
        if let Some(memo) = &self.memo {
            fields
                .custom_fields
                .insert(custom_field_key.to_string(), memo.clone());
        }
        fields
    }
}

impl ContactRequest {
    /// Checks the request without touching the network. All problems are
    /// collected before returning.
    pub fn validate(self) -> Result<ValidContact, ValidationErrors> {
        let mut errors = Vec::new();

        let first_name = required(&mut errors, "first_name", self.first_name);
        let last_name = required(&mut errors, "last_name", self.last_name);
        let email = required(&mut errors, "email", self.email).and_then(|email| {
            match check_email(&email) {
                Ok(()) => Some(email.to_lowercase()),
                Err(message) => {
                    errors.push(FieldError::new("email", message));
                    None
                }
            }
        });

        let website = optional(self.website).and_then(|raw| match Url::parse(&raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Some(url),
            _ => {
                errors.push(FieldError::new(
                    "website",
                    "must be an absolute http or https URL",
                ));
                None
            }
        });

        if let Some(id) = self.cadence_id
            && id <= 0
        {
            errors.push(FieldError::new("cadence_id", "must be greater than 0"));
        }

        let cadence_name = optional(self.cadence_name);
        let cadence = match (self.cadence_id, cadence_name) {
            (Some(id), _) if id > 0 => Some(CadenceRef::Id(id)),
            (Some(_), _) => None,
            (None, Some(name)) => Some(CadenceRef::Name(name)),
            (None, None) => None,
        };

        let wants_enrollment = self
            .enroll
            .unwrap_or(self.cadence_id.is_some() || cadence.is_some());
        if wants_enrollment && self.cadence_id.is_none() && cadence.is_none() {
            errors.push(FieldError::new(
                "cadence",
                "cadence_id or cadence_name is required for enrollment",
            ));
        }

        match (first_name, last_name, email) {
            (Some(first_name), Some(last_name), Some(email)) if errors.is_empty() => {
                Ok(ValidContact {
                    first_name,
                    last_name,
                    email,
                    phone: optional(self.phone),
                    owner_crm_id: optional(self.owner_crm_id),
                    account_crm_id: optional(self.account_crm_id),
                    website,
                    memo: self.custom_email_template,
                    cadence: cadence.filter(|_| wants_enrollment),
                })
            }
            _ => Err(ValidationErrors(errors)),
        }
    }
}

fn required(errors: &mut Vec<FieldError>, field: &str, value: Option<String>) -> Option<String> {
    let value = optional(value);
    if value.is_none() {
        errors.push(FieldError::new(field, "is required"));
    }
    value
}

// Trims, and treats blank values as absent.
fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_email(email: &str) -> Result<(), &'static str> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err("must contain an @");
    };
    if domain.contains('@') {
        return Err("must contain exactly one @");
    }
    if local.is_empty() || domain.is_empty() {
        return Err("must have text on both sides of the @");
    }
    if !domain.contains('.') {
        return Err("domain must contain a dot");
    }
    Ok(())
}
