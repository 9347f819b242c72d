use core::convert::Infallible;

use bytes::Bytes;
use gym_booking_config::ConfigError;
use gym_booking_core::policy::PolicyError;
use gym_booking_core::types::ParseEnumError;
use gym_booking_core::BookingError;
use gym_booking_database::error::DatabaseError;
use gym_booking_telemetry::TryInitError;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Response, StatusCode};
use http_body_util::Full;
use serde_json::{json, Value};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Booking(#[from] BookingError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("query error: {0}")]
    Query(#[from] serde_urlencoded::de::Error),
    #[error("invalid id: {0}")]
    Id(#[from] uuid::Error),
    #[error("invalid role: {0}")]
    Role(#[from] ParseEnumError),
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("header {0} is missing or not valid")]
    Header(&'static str),
    #[error("no such route")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("webserver error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("IO error: {0}")]
    File(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("{0:?}")]
    Config(#[from] ConfigError),
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TryInitError),
}

impl From<Infallible> for AppError {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

const fn booking_status(error: &BookingError) -> StatusCode {
    match error {
        BookingError::BookingNotFound | BookingError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        BookingError::UserBlocked { .. }
        | BookingError::IneligibleSubscription
        | BookingError::NoActiveMembership
        | BookingError::QuotaExhausted
        | BookingError::TicketExhausted
        | BookingError::RegistrationNotOpen { .. }
        | BookingError::NotPermitted => StatusCode::FORBIDDEN,
        BookingError::AlreadyBooked
        | BookingError::SessionFull
        | BookingError::SwitchWindowClosed
        | BookingError::ConsentMismatch
        | BookingError::InvalidTransition { .. }
        | BookingError::WaitlistEmpty
        | BookingError::ClassNotStarted { .. } => StatusCode::CONFLICT,
        BookingError::NotSameDay | BookingError::SameSession => StatusCode::UNPROCESSABLE_ENTITY,
        BookingError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl AppError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Booking(error) => booking_status(error),
            Self::Json(_) | Self::Query(_) | Self::Id(_) | Self::Role(_) | Self::Body(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Header(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Hyper(_)
            | Self::File(_)
            | Self::Database(_)
            | Self::Config(_)
            | Self::Policy(_)
            | Self::Telemetry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Booking(error) => error.kind(),
            Self::Json(_) | Self::Query(_) | Self::Id(_) | Self::Role(_) | Self::Body(_) => {
                "bad_request"
            }
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Header(_) => "unauthenticated",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            _ => "internal",
        }
    }

    fn body(&self) -> Value {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        match self {
            Self::Booking(BookingError::UserBlocked { until }) => {
                body["until"] = json!(until);
            }
            Self::Booking(BookingError::RegistrationNotOpen { opens_at }) => {
                body["opens_at"] = json!(opens_at);
            }
            Self::Booking(BookingError::ClassNotStarted { starts_at }) => {
                body["starts_at"] = json!(starts_at);
            }
            _ => {}
        }
        body
    }

    #[must_use]
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let body = serde_json::to_vec(&self.body()).unwrap_or_default();
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = self.status();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone as _, Utc};
    use gym_booking_core::StoreError;

    use super::*;

    #[test]
    fn blocked_users_learn_until_when() {
        let until = Utc.with_ymd_and_hms(2026, 5, 7, 12, 0, 0).unwrap();
        let error = AppError::from(BookingError::UserBlocked { until });
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
        let body = error.body();
        assert_eq!(body["error"], "user_blocked");
        assert_eq!(body["until"], "2026-05-07T12:00:00Z");
    }

    #[test]
    fn store_failures_ask_for_a_retry() {
        let error = AppError::from(BookingError::Store(StoreError::new("connection reset")));
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.body()["error"], "store_failure");
    }

    #[test]
    fn policy_conflicts_are_client_errors() {
        for error in [
            BookingError::AlreadyBooked,
            BookingError::SessionFull,
            BookingError::SwitchWindowClosed,
            BookingError::SameSession,
            BookingError::NotPermitted,
            BookingError::ClassNotStarted {
                starts_at: Utc.with_ymd_and_hms(2026, 5, 5, 6, 0, 0).unwrap(),
            },
        ] {
            assert!(AppError::from(error).status().is_client_error());
        }
    }
}
