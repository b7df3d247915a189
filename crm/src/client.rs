use crate::errors::CrmError;
use crate::metrics_defs::CRM_REQUEST_DURATION;
use crate::types::{
    ApiToken, CadenceId, CreateOutcome, Listing, NewCadenceMembership, PersonFields, PersonId,
    Record, UpstreamBody,
};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use shared::histogram;
use std::time::{Duration, Instant};

/// The CRM operations the enrollment flow depends on.
///
/// Every call is authenticated with the token passed in, so a single client
/// can serve requests carrying different per-request credentials.
#[async_trait]
pub trait Crm: Send + Sync {
    /// Lists people whose email address matches exactly, in upstream order.
    async fn find_people_by_email(
        &self,
        token: &ApiToken,
        email: &str,
    ) -> Result<Vec<Record>, CrmError>;

    async fn create_person(
        &self,
        token: &ApiToken,
        fields: &PersonFields,
    ) -> Result<CreateOutcome, CrmError>;

    /// Returns the raw upstream payload of the updated person.
    async fn update_person(
        &self,
        token: &ApiToken,
        id: PersonId,
        fields: &PersonFields,
    ) -> Result<JsonValue, CrmError>;

    /// Lists cadences with the given name, in upstream order.
    async fn find_cadences_by_name(
        &self,
        token: &ApiToken,
        name: &str,
    ) -> Result<Vec<Record>, CrmError>;

    /// Returns the raw upstream payload of the new membership.
    async fn create_cadence_membership(
        &self,
        token: &ApiToken,
        person_id: PersonId,
        cadence_id: CadenceId,
    ) -> Result<JsonValue, CrmError>;
}

#[derive(Clone)]
pub struct CrmClient {
    client: reqwest::Client,
    base_url: String,
}

impl CrmClient {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, CrmError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(CrmClient {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, CrmError> {
        Ok(Url::parse(&format!("{}/{}", self.base_url, path))?)
    }

    /// Sends the request and captures the status and body.
    ///
    /// The body is read as text first so that a non-JSON or truncated body
    /// never turns into a decode error here. Non-2xx statuses are returned
    /// as-is; callers decide what counts as failure.
    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<(StatusCode, UpstreamBody), CrmError> {
        let started = Instant::now();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                histogram!(CRM_REQUEST_DURATION, "operation" => operation, "status" => "error")
                    .record(started.elapsed().as_secs_f64());
                tracing::warn!(operation, error = %e, "CRM request failed");
                return Err(e.into());
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(text) => UpstreamBody::from_text(text),
            Err(e) => {
                tracing::warn!(operation, error = %e, "Failed to read CRM response body");
                UpstreamBody::Text(String::new())
            }
        };

        histogram!(
            CRM_REQUEST_DURATION,
            "operation" => operation,
            "status" => status.as_u16().to_string()
        )
        .record(started.elapsed().as_secs_f64());
        tracing::debug!(operation, status = status.as_u16(), "CRM request completed");

        Ok((status, body))
    }

    async fn list(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Vec<Record>, CrmError> {
        let (status, body) = self.send(operation, request).await?;
        if !status.is_success() {
            return Err(CrmError::Status { status, body });
        }

        let parsed = match body.as_json() {
            Some(json) => Listing::deserialize(json).map_err(|e| e.to_string()),
            None => Err("body is not JSON".to_string()),
        };

        let listing = match parsed {
            Ok(listing) => listing,
            Err(reason) => {
                return Err(CrmError::UnexpectedShape {
                    status,
                    body,
                    reason,
                });
            }
        };

        let total = listing.data.len();
        let records: Vec<Record> = listing
            .data
            .into_iter()
            .filter_map(Record::from_raw)
            .collect();

        if records.len() != total {
            tracing::warn!(
                operation,
                skipped = total - records.len(),
                "Ignoring records without a numeric id"
            );
        }

        Ok(records)
    }

    async fn write(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<JsonValue, CrmError> {
        let (status, body) = self.send(operation, request).await?;
        if !status.is_success() {
            return Err(CrmError::Status { status, body });
        }
        Ok(body.into_json())
    }
}

#[async_trait]
impl Crm for CrmClient {
    async fn find_people_by_email(
        &self,
        token: &ApiToken,
        email: &str,
    ) -> Result<Vec<Record>, CrmError> {
        let request = self
            .client
            .get(self.endpoint("v2/people.json")?)
            .bearer_auth(token.expose())
            .query(&[("email_addresses[]", email)]);

        self.list("find_people", request).await
    }

    async fn create_person(
        &self,
        token: &ApiToken,
        fields: &PersonFields,
    ) -> Result<CreateOutcome, CrmError> {
        let request = self
            .client
            .post(self.endpoint("v2/people.json")?)
            .bearer_auth(token.expose())
            .json(fields);

        let (status, body) = self.send("create_person", request).await?;

        if status == StatusCode::ACCEPTED {
            return Ok(CreateOutcome::Accepted { payload: body });
        }
        if !status.is_success() {
            return Err(CrmError::Status { status, body });
        }

        let id = body
            .as_json()
            .and_then(|json| json.pointer("/data/id"))
            .and_then(JsonValue::as_i64)
            .filter(|id| *id > 0);

        Ok(CreateOutcome::Created {
            id,
            payload: body.into_json(),
        })
    }

    async fn update_person(
        &self,
        token: &ApiToken,
        id: PersonId,
        fields: &PersonFields,
    ) -> Result<JsonValue, CrmError> {
        let request = self
            .client
            .put(self.endpoint(&format!("v2/people/{id}.json"))?)
            .bearer_auth(token.expose())
            .json(fields);

        self.write("update_person", request).await
    }

    async fn find_cadences_by_name(
        &self,
        token: &ApiToken,
        name: &str,
    ) -> Result<Vec<Record>, CrmError> {
        let request = self
            .client
            .get(self.endpoint("v2/cadences.json")?)
            .bearer_auth(token.expose())
            .query(&[("name[]", name)]);

        self.list("find_cadences", request).await
    }

    async fn create_cadence_membership(
        &self,
        token: &ApiToken,
        person_id: PersonId,
        cadence_id: CadenceId,
    ) -> Result<JsonValue, CrmError> {
        let request = self
            .client
            .post(self.endpoint("v2/cadence_memberships.json")?)
            .bearer_auth(token.expose())
            .json(&NewCadenceMembership {
                person_id,
                cadence_id,
            });

        self.write("create_cadence_membership", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> CrmClient {
        let url = Url::parse(&server.uri()).unwrap();
        CrmClient::new(&url, Duration::from_secs(5)).unwrap()
    }

    fn token() -> ApiToken {
        ApiToken::new("test-token")
    }

    #[tokio::test]
    async fn test_find_people_by_email() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/people.json"))
            .and(query_param("email_addresses[]", "ann@example.com"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": 11, "email_address": "ann@example.com"},
                    {"email_address": "no-id@example.com"},
                    {"id": 12, "email_address": "ann@example.com"}
                ],
                "metadata": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let records = test_client(&server)
            .find_people_by_email(&token(), "ann@example.com")
            .await
            .unwrap();

        // Upstream order is preserved, records without an id are skipped
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![11, 12]);
        assert_eq!(records[0].raw["email_address"], "ann@example.com");
    }

    #[tokio::test]
    async fn test_find_people_error_status_keeps_body() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/people.json"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let err = test_client(&server)
            .find_people_by_email(&token(), "ann@example.com")
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(err.body(), Some(&UpstreamBody::Text("Unauthorized".into())));
    }

    #[tokio::test]
    async fn test_find_people_unexpected_shape() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/people.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = test_client(&server)
            .find_people_by_email(&token(), "ann@example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::UnexpectedShape { .. }));
        assert_eq!(err.status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_create_person_outcomes() {
        let server = MockServer::start().await;
        let fields = PersonFields {
            first_name: "Ann".into(),
            last_name: "Lee".into(),
            email_address: "ann@example.com".into(),
            ..Default::default()
        };

        Mock::given(method("POST"))
            .and(path("/v2/people.json"))
            .and(body_json(json!({
                "first_name": "Ann",
                "last_name": "Lee",
                "email_address": "ann@example.com"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": 42}})))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v2/people.json"))
            .respond_with(ResponseTemplate::new(202))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v2/people.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;

        let client = test_client(&server);

        let created = client.create_person(&token(), &fields).await.unwrap();
        assert_eq!(
            created,
            CreateOutcome::Created {
                id: Some(42),
                payload: json!({"data": {"id": 42}})
            }
        );

        let accepted = client.create_person(&token(), &fields).await.unwrap();
        assert!(matches!(accepted, CreateOutcome::Accepted { .. }));

        let missing_id = client.create_person(&token(), &fields).await.unwrap();
        assert!(matches!(missing_id, CreateOutcome::Created { id: None, .. }));
    }

    #[tokio::test]
    async fn test_create_person_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v2/people.json"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(json!({"errors": {"email_address": ["is invalid"]}})),
            )
            .mount(&server)
            .await;

        let err = test_client(&server)
            .create_person(&token(), &PersonFields::default())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::UNPROCESSABLE_ENTITY));
        assert_eq!(
            err.body().and_then(UpstreamBody::as_json),
            Some(&json!({"errors": {"email_address": ["is invalid"]}}))
        );
    }

    #[tokio::test]
    async fn test_update_person() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/v2/people/7.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": 7}})))
            .expect(1)
            .mount(&server)
            .await;

        let payload = test_client(&server)
            .update_person(&token(), 7, &PersonFields::default())
            .await
            .unwrap();
        assert_eq!(payload, json!({"data": {"id": 7}}));
    }

    #[tokio::test]
    async fn test_cadence_lookup_and_membership() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/cadences.json"))
            .and(query_param("name[]", "Spring Outreach"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 555, "name": "Spring Outreach"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v2/cadence_memberships.json"))
            .and(body_json(json!({"person_id": 42, "cadence_id": 555})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"id": 9001}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let cadences = client
            .find_cadences_by_name(&token(), "Spring Outreach")
            .await
            .unwrap();
        assert_eq!(cadences.len(), 1);
        assert_eq!(cadences[0].id, 555);

        let membership = client
            .create_cadence_membership(&token(), 42, 555)
            .await
            .unwrap();
        assert_eq!(membership["data"]["id"], 9001);
    }

    #[tokio::test]
    async fn test_timeout_is_a_transport_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/people.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let client = CrmClient::new(&url, Duration::from_millis(50)).unwrap();

        let err = client
            .find_people_by_email(&token(), "ann@example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::Transport(_)));
        assert!(err.is_timeout());
        assert_eq!(err.status(), None);
    }
}
