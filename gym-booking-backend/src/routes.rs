use core::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use gym_booking_core::cancellation::{CancellationOutcome, LateCancellationConsent};
use gym_booking_core::notify::SeatNotifier;
use gym_booking_core::store::BookingStore;
use gym_booking_core::types::{Actor, BookingId, Role, SessionId, UserId};
use gym_booking_core::waitlist::Attendance;
use gym_booking_core::BookingService;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt as _, Full, LengthLimitError, Limited};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::AppError;

/// Set by the gateway in front of the server, which authenticates the caller.
pub const USER_HEADER: &str = "x-user-id";
/// `member` when absent.
pub const ROLE_HEADER: &str = "x-user-role";
/// Larger request bodies are answered with 413 before they are parsed.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Deserialize)]
struct UserPayload {
    user: UserId,
}

#[derive(Deserialize)]
struct ConfirmPayload {
    user: UserId,
    booking: BookingId,
}

#[derive(Deserialize)]
struct SwitchPayload {
    user: UserId,
    to: SessionId,
}

#[derive(Deserialize)]
struct AttendancePayload {
    attendance: Attendance,
}

#[derive(Deserialize)]
struct CatalogQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

#[derive(Deserialize)]
struct UserQuery {
    user: UserId,
}

fn actor(headers: &HeaderMap) -> Result<Actor, AppError> {
    let user = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::Header(USER_HEADER))?
        .parse::<UserId>()?;
    let role = match headers.get(ROLE_HEADER) {
        None => Role::Member,
        Some(value) => value
            .to_str()
            .map_err(|_| AppError::Header(ROLE_HEADER))?
            .parse()?,
    };
    Ok(Actor { user, role })
}

async fn payload<T, B>(body: B) -> Result<T, AppError>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<BoxError>,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|error| {
            if error.is::<LengthLimitError>() {
                AppError::PayloadTooLarge(MAX_BODY_BYTES)
            } else {
                AppError::Body(error.to_string())
            }
        })?
        .to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn query<T: DeserializeOwned>(query: Option<&str>) -> Result<T, AppError> {
    Ok(serde_urlencoded::from_str(query.unwrap_or_default())?)
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>, AppError> {
    let mut response = Response::new(Full::new(Bytes::from(serde_json::to_vec(value)?)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

/// Answers one request. Failures become JSON error responses, so this never fails itself.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn handle<S, N, B>(
    service: Arc<BookingService<S, N>>,
    request: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    S: BookingStore,
    N: SeatNotifier,
    B: Body,
    B::Error: Into<BoxError>,
{
    let response = match route(&service, request).await {
        Ok(response) => response,
        Err(error) => {
            debug!(%error, "request failed");
            error.into_response()
        }
    };
    debug!(status = %response.status(), "answered");
    Ok(response)
}

async fn route<S, N, B>(
    service: &BookingService<S, N>,
    request: Request<B>,
) -> Result<Response<Full<Bytes>>, AppError>
where
    S: BookingStore,
    N: SeatNotifier,
    B: Body,
    B::Error: Into<BoxError>,
{
    let (parts, body) = request.into_parts();
    let segments: Vec<&str> = parts.uri.path().trim_matches('/').split('/').collect();
    match (parts.method.as_str(), segments.as_slice()) {
        ("GET", ["sessions"]) => {
            let range: CatalogQuery = query(parts.uri.query())?;
            json(StatusCode::OK, &service.catalog(range.from, range.to).await?)
        }
        ("POST", ["sessions", session, "bookings"]) => {
            let actor = actor(&parts.headers)?;
            let UserPayload { user } = payload(body).await?;
            let booking = service
                .request_booking(actor, user, session.parse()?)
                .await?;
            json(StatusCode::CREATED, &booking)
        }
        ("GET", ["sessions", session, "bookings"]) => {
            let actor = actor(&parts.headers)?;
            json(
                StatusCode::OK,
                &service.roster(actor, session.parse()?).await?,
            )
        }
        ("POST", ["sessions", session, "cancellation"]) => {
            let actor = actor(&parts.headers)?;
            let UserPayload { user } = payload(body).await?;
            let outcome = service
                .request_cancellation(actor, user, session.parse()?)
                .await?;
            let status = match outcome {
                CancellationOutcome::Cancelled(_) => StatusCode::OK,
                CancellationOutcome::ConfirmationRequired(_) => StatusCode::ACCEPTED,
            };
            json(status, &outcome)
        }
        ("POST", ["sessions", session, "cancellation", "confirm"]) => {
            let actor = actor(&parts.headers)?;
            let ConfirmPayload { user, booking } = payload(body).await?;
            let receipt = service
                .confirm_late_cancellation(
                    actor,
                    user,
                    session.parse()?,
                    LateCancellationConsent { booking },
                )
                .await?;
            json(StatusCode::OK, &receipt)
        }
        ("GET", ["sessions", session, "switch-options"]) => {
            let actor = actor(&parts.headers)?;
            let UserQuery { user } = query(parts.uri.query())?;
            let options = service
                .switch_options(actor, user, session.parse()?)
                .await?;
            json(StatusCode::OK, &options)
        }
        ("POST", ["sessions", session, "switch"]) => {
            let actor = actor(&parts.headers)?;
            let SwitchPayload { user, to } = payload(body).await?;
            let receipt = service.switch(actor, user, session.parse()?, to).await?;
            json(StatusCode::OK, &receipt)
        }
        ("POST", ["sessions", session, "promotion"]) => {
            let actor = actor(&parts.headers)?;
            let promoted = service
                .promote_from_waitlist(actor, session.parse()?)
                .await?;
            json(StatusCode::OK, &promoted)
        }
        ("POST", ["bookings", booking, "attendance"]) => {
            let actor = actor(&parts.headers)?;
            let AttendancePayload { attendance } = payload(body).await?;
            let booking = service
                .mark_attendance(actor, booking.parse()?, attendance)
                .await?;
            json(StatusCode::OK, &booking)
        }
        ("GET", ["users", user, "penalty"]) => {
            let actor = actor(&parts.headers)?;
            json(
                StatusCode::OK,
                &service.penalty_status(actor, user.parse()?).await?,
            )
        }
        ("POST", ["users", user, "penalty", "reset"]) => {
            let actor = actor(&parts.headers)?;
            json(
                StatusCode::OK,
                &service.reset_penalties(actor, user.parse()?).await?,
            )
        }
        (
            _,
            ["sessions"]
            | ["sessions", _, "bookings" | "cancellation" | "switch-options" | "switch" | "promotion"]
            | ["sessions", _, "cancellation", "confirm"]
            | ["bookings", _, "attendance"]
            | ["users", _, "penalty"]
            | ["users", _, "penalty", "reset"],
        ) => Err(AppError::MethodNotAllowed),
        _ => Err(AppError::NotFound),
    }
}
