//! HTTP errors for booking handlers.
//!
//! Every failure leaves the service as `{"code": "...", "message": "..."}`
//! with a matching status. Domain errors pick a status constructor and then
//! narrow the code with [`AppError::with_code`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use slotbook_runtime::StoreError;
use std::fmt;

/// Error returned by HTTP handlers.
///
/// ```ignore
/// async fn get_appointment(id: AppointmentId) -> Result<Json<Appointment>, AppError> {
///     let appointment = store.state(|s| s.appointments.get(&id).cloned()).await
///         .ok_or_else(|| AppError::not_found("Appointment", id))?;
///     Ok(Json(appointment))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    /// Logged for 5xx, never sent to the client
    source: Option<anyhow::Error>,
}

impl AppError {
    fn of(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Replace the machine-readable code, keeping the status.
    ///
    /// `conflict(..).with_code("LOCK_CONFLICT")`
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Attach the underlying failure for the server log.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// HTTP status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// 400
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::of(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 403
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::of(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    /// 404 for `resource` with `id`.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::of(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{resource} with id {id} not found"),
        )
    }

    /// 409
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::of(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// 422
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::of(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
    }

    /// 408
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::of(StatusCode::REQUEST_TIMEOUT, "TIMEOUT", message)
    }

    /// 500
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::of(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", message)
    }

    /// 502, the payment gateway or another upstream failed.
    #[must_use]
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::of(StatusCode::BAD_GATEWAY, "BAD_GATEWAY", message)
    }

    /// 503
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::of(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            let source = self.source.as_ref().map(ToString::to_string);
            tracing::error!(
                status = %self.status,
                code = %self.code,
                message = %self.message,
                source = ?source,
                "Request failed"
            );
        }

        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

/// A missed deadline is a timeout; anything else means the store cannot
/// take work right now.
impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout => Self::timeout("Timed out waiting for the booking engine"),
            StoreError::ShutdownInProgress => Self::unavailable("Server is shutting down"),
            other => Self::unavailable("Booking engine unavailable")
                .with_source(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::bad_request("Invalid date");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Invalid date");
    }

    #[test]
    fn test_not_found() {
        let err = AppError::not_found("Appointment", "123");
        assert_eq!(err.to_string(), "[NOT_FOUND] Appointment with id 123 not found");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation() {
        let err = AppError::validation("Unknown actor");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_with_code_keeps_status() {
        let err = AppError::conflict("Slot is being booked").with_code("LOCK_CONFLICT");
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "LOCK_CONFLICT");
        assert_eq!(err.to_string(), "[LOCK_CONFLICT] Slot is being booked");
    }

    #[test]
    fn test_store_errors_map_to_http() {
        assert_eq!(
            AppError::from(StoreError::Timeout).status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            AppError::from(StoreError::ChannelClosed).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_source_is_kept_off_the_wire() {
        let err = AppError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.to_string().contains("disk"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
