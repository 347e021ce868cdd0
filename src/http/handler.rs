//! Request handler that consults the rate limiter.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, error, instrument};

use crate::ratelimit::RateLimiter;

/// The limiter as shared by request handlers.
pub type SharedLimiter = Arc<dyn RateLimiter>;

/// Build the router: `GET /{caller_id}`.
pub fn router(limiter: SharedLimiter) -> Router {
    Router::new()
        .route("/{caller_id}", get(check_caller))
        .with_state(limiter)
}

/// Admit or reject one action for the caller named in the path.
///
/// Allowed actions get `200`, denied ones `429`, and a limiter failure (for
/// example an unreachable store) `500`.
#[instrument(skip_all)]
pub async fn check_caller(
    State(limiter): State<SharedLimiter>,
    Path(caller_id): Path<String>,
) -> Response {
    match limiter.is_allowed(&caller_id).await {
        Ok(true) => (StatusCode::OK, "Hello World!").into_response(),
        Ok(false) => {
            debug!(caller = %caller_id, limiter = limiter.name(), "Rejecting request over limit");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "Too many requests",
                    "threshold": limiter.threshold(),
                    "time_interval_ms": limiter.time_interval(),
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!(caller = %caller_id, limiter = limiter.name(), error = %e, "Rate limiter failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Rate limiter unavailable" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimitConfig, SlidingWindowSortedSet, SlidingWindowList};
    use crate::store::{MemoryStore, SortedSetStore};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn get_request(caller: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/{}", caller))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_then_rejected() {
        let limiter: SharedLimiter =
            Arc::new(SlidingWindowList::new(LimitConfig::new(2, 60_000).unwrap()).unwrap());
        let app = router(limiter);

        for _ in 0..2 {
            let response = app.clone().oneshot(get_request("alice")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get_request("alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.oneshot(get_request("bob")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_store_failure_maps_to_500() {
        let store = Arc::new(MemoryStore::new());
        let limiter: SharedLimiter = Arc::new(
            SlidingWindowSortedSet::new(LimitConfig::new(2, 60_000).unwrap(), store.clone(), "http")
                .unwrap(),
        );
        SortedSetStore::close(store.as_ref()).await.unwrap();

        let response = router(limiter).oneshot(get_request("alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_root_without_caller_is_not_found() {
        let limiter: SharedLimiter =
            Arc::new(SlidingWindowList::new(LimitConfig::new(2, 60_000).unwrap()).unwrap());

        let response = router(limiter).oneshot(get_request("")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
