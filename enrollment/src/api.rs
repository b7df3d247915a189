use crate::config::{ConfigValidationError, CorsConfig, Listener as ListenerConfig};
use crate::errors::{EnrollmentError, Stage, UpsertAction};
use crate::handler::{Enrolled, EnrollmentHandler};
use crate::journal::JournalError;
use crate::metrics_defs::{ENROLLMENT_OUTCOME, REQUEST_DURATION};
use crate::validation::{ContactRequest, FieldError, ValidationErrors};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use crm::{ApiToken, CrmError, PersonId, UpstreamBody};
use serde::Serialize;
use serde_json::Value as JsonValue;
use shared::{counter, histogram};
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any as AnyValue, CorsLayer};
use tower_http::trace::TraceLayer;

/// Per-request credential override.
pub const API_KEY_HEADER: &str = "x-salesloft-api-key";
pub const SERVICE_NAME: &str = "cadence-enroller";

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),
    #[error("failed to build CRM client: {0}")]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[derive(Clone)]
pub struct AppState {
    handler: Arc<EnrollmentHandler>,
    default_token: Option<ApiToken>,
}

impl AppState {
    pub fn new(handler: EnrollmentHandler, default_token: Option<ApiToken>) -> Self {
        AppState {
            handler: Arc::new(handler),
            default_token,
        }
    }

    // A non-empty header wins over the configured key.
    fn token(&self, headers: &HeaderMap) -> Option<ApiToken> {
        headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(ApiToken::non_empty)
            .or_else(|| self.default_token.clone())
    }
}

pub fn router(state: AppState, cors: &CorsConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/create_contact_and_enroll", post(create_contact_and_enroll))
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors_layer(cors))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allow_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AnyValue)
        .allow_headers(AnyValue)
}

pub async fn serve(listener: &ListenerConfig, app: Router) -> Result<(), ApiError> {
    let addr = format!("{}:{}", listener.host, listener.port);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Listening for enrollment requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
    })
}

async fn create_contact_and_enroll(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ContactRequest>, JsonRejection>,
) -> Result<EnrollmentResponse, EnrollmentError> {
    let started = Instant::now();

    let result = match payload {
        Ok(Json(request)) => {
            let token = state.token(&headers);
            state
                .handler
                .upsert_and_enroll(token.as_ref(), request)
                .await
        }
        Err(rejection) => Err(ValidationErrors::single("body", rejection.body_text()).into()),
    };

    let outcome = match &result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    counter!(ENROLLMENT_OUTCOME, "outcome" => outcome).increment(1);
    histogram!(REQUEST_DURATION, "outcome" => outcome).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::warn!(
            outcome,
            stage = %e.stage(),
            status = e.status_code().as_u16(),
            error = %e,
            "Enrollment request failed"
        );
    }

    result.map(EnrollmentResponse::from)
}

/// Body shared by every response of the enrollment endpoint.
#[derive(Serialize, Default)]
struct EnrollmentResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    person_id: Option<PersonId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<UpsertAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cadence_membership: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<ErrorDetails>,
}

#[derive(Serialize)]
struct ErrorDetails {
    stage: Stage,
    upstream_status: Option<u16>,
    upstream_body: Option<UpstreamBody>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cadence_name: Option<String>,
}

impl From<Enrolled> for EnrollmentResponse {
    fn from(enrolled: Enrolled) -> Self {
        let message = match enrolled.cadence_membership {
            Some(_) => format!(
                "Contact {} {} and enrolled in cadence",
                enrolled.person_id,
                enrolled.action.as_str()
            ),
            None => format!(
                "Contact {} {}",
                enrolled.person_id,
                enrolled.action.as_str()
            ),
        };

        EnrollmentResponse {
            success: true,
            message,
            person_id: Some(enrolled.person_id),
            action: Some(enrolled.action),
            contact: Some(enrolled.contact),
            cadence_membership: enrolled.cadence_membership,
            ..Default::default()
        }
    }
}

impl IntoResponse for EnrollmentResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

impl IntoResponse for EnrollmentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let stage = self.stage();
        let message = self.to_string();
        let error = Some(self.kind());

        let mut details = ErrorDetails {
            stage,
            upstream_status: None,
            upstream_body: None,
            fields: Vec::new(),
            cadence_name: None,
        };
        let mut persisted = None;

        match self {
            EnrollmentError::Validation(errors) => details.fields = errors.0,
            EnrollmentError::Upstream {
                failure,
                persisted: p,
            } => {
                details.upstream_status = failure.status.map(|s| s.as_u16());
                details.upstream_body = failure.body;
                persisted = p;
            }
            EnrollmentError::PartialSuccess {
                failure,
                persisted: p,
            } => {
                details.upstream_status = failure.status.map(|s| s.as_u16());
                details.upstream_body = failure.body;
                persisted = Some(p);
            }
            EnrollmentError::CadenceNotFound { name, persisted: p } => {
                details.cadence_name = Some(name);
                persisted = Some(p);
            }
            EnrollmentError::MissingCredential => {}
        }

        let body = EnrollmentResponse {
            success: false,
            message,
            error,
            person_id: persisted.as_ref().map(|p| p.person_id),
            action: persisted.as_ref().map(|p| p.action),
            contact: persisted.map(|p| p.contact),
            details: Some(details),
            ..Default::default()
        };

        (status, Json(body)).into_response()
    }
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!(panic = detail, "Request handler panicked");

    let body = serde_json::json!({
        "success": false,
        "message": "Internal server error",
        "error": "internal_error",
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
