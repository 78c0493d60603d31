//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use slotbook_core::reducer::Reducer;
use slotbook_runtime::{HealthCheck, HealthReport, HealthStatus, Store};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK to indicate the process is running. Dependencies are not
/// checked.
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// One component in a readiness response.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component name
    pub component: String,
    /// `healthy`, `degraded` or `unhealthy`
    pub status: String,
    /// Optional detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Free-form diagnostics
    pub metadata: BTreeMap<String, String>,
}

impl From<&HealthCheck> for ComponentHealth {
    fn from(check: &HealthCheck) -> Self {
        Self {
            component: check.component.clone(),
            status: check.status.to_string(),
            message: check.message.clone(),
            metadata: check.metadata.iter().cloned().collect(),
        }
    }
}

/// Readiness response body.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    /// Worst status across all components
    pub status: String,
    /// Per-component results
    pub checks: Vec<ComponentHealth>,
    /// When the report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&HealthReport> for ReadinessResponse {
    fn from(report: &HealthReport) -> Self {
        Self {
            status: report.status.to_string(),
            checks: report.checks.iter().map(ComponentHealth::from).collect(),
            timestamp: report.timestamp,
        }
    }
}

/// Render a health report.
///
/// - 200 OK: Healthy or Degraded
/// - 503 Service Unavailable: Unhealthy
#[must_use]
pub fn readiness_response(report: &HealthReport) -> (StatusCode, Json<ReadinessResponse>) {
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(ReadinessResponse::from(report)))
}

/// Readiness endpoint backed by a single Store.
///
/// ```text
/// GET /ready
/// ```
pub async fn health_check_with_store<S, A, E, R>(
    State(store): State<Arc<Store<S, A, E, R>>>,
) -> (StatusCode, Json<ReadinessResponse>)
where
    R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
    S: Send + Sync + 'static,
    A: Send + Clone + 'static,
    E: Send + Sync + 'static,
{
    readiness_response(&HealthReport::new(vec![store.health()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotbook_core::{SmallVec, effect::Effect};
    use std::time::Duration;

    #[derive(Clone)]
    struct TestReducer;

    #[derive(Clone, Default)]
    struct TestState;

    #[derive(Clone)]
    struct TestAction;

    #[derive(Clone)]
    struct TestEnv;

    impl Reducer for TestReducer {
        type State = TestState;
        type Action = TestAction;
        type Environment = TestEnv;

        fn reduce(
            &self,
            _state: &mut Self::State,
            _action: Self::Action,
            _env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]> {
            SmallVec::new()
        }
    }

    #[tokio::test]
    async fn test_simple_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_ready_with_healthy_store() {
        let store = Arc::new(Store::new(TestState, TestReducer, TestEnv));

        let (status, Json(body)) = health_check_with_store(State(store)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "healthy");
        assert_eq!(body.checks[0].component, "store");
    }

    #[tokio::test]
    async fn test_not_ready_after_shutdown() {
        let store = Arc::new(Store::new(TestState, TestReducer, TestEnv));
        let _ = store.shutdown(Duration::from_millis(10)).await;

        let (status, Json(body)) = health_check_with_store(State(store)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "unhealthy");
    }
}
