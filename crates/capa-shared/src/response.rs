use std::fmt::Debug;

use axum::Json;
use axum::response::{IntoResponse, Redirect, Response};
use http::StatusCode;
use serde::Serialize;
use utoipa::IntoResponses;

/// Wraps a handler's `Result<T, E>` so utoipa can describe both arms of a route while
/// `axum` only ever sees one `IntoResponse` impl. Handlers build one via `.into()` at
/// the end of an otherwise ordinary `Result`-returning function body.
pub struct JsonResponse<T: Serialize, E: Serialize>(Result<T, E>);

impl<T: Serialize, E: Serialize + IntoResponse> JsonResponse<T, E> {
    pub fn new_ok(value: T) -> Self {
        Self(Ok(value))
    }

    pub fn new_error(error: E) -> Self {
        Self(Err(error))
    }
}

impl<T: Serialize, E: Serialize + IntoResponse> IntoResponses for JsonResponse<T, E> {
    fn responses() -> std::collections::BTreeMap<String, utoipa::openapi::RefOr<utoipa::openapi::response::Response>> {
        std::collections::BTreeMap::new()
    }
}

impl<T: Serialize, E: Serialize + IntoResponse + Debug> IntoResponse for JsonResponse<T, E> {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(value) => (StatusCode::OK, Json(value)).into_response(),
            Err(error) => {
                tracing::error!(?error, "request failed");
                error.into_response()
            }
        }
    }
}

impl<T: Serialize, E: Serialize + IntoResponse> From<Result<T, E>> for JsonResponse<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => JsonResponse::new_ok(value),
            Err(error) => JsonResponse::new_error(error),
        }
    }
}

/// Same wrapping trick for handlers whose success path is a 302 redirect — the
/// oauth2 callback endpoint redirects the browser back to the caller-supplied
/// `redirect_uri` on success, but still needs to render `CommonError`'s JSON body on failure.
pub struct RedirectResponse<E: Serialize>(Result<Redirect, E>);

impl<E: Serialize + IntoResponse> RedirectResponse<E> {
    pub fn new_ok(redirect: Redirect) -> Self {
        Self(Ok(redirect))
    }

    pub fn new_error(error: E) -> Self {
        Self(Err(error))
    }
}

impl<E: Serialize + IntoResponse> IntoResponses for RedirectResponse<E> {
    fn responses() -> std::collections::BTreeMap<String, utoipa::openapi::RefOr<utoipa::openapi::response::Response>> {
        std::collections::BTreeMap::new()
    }
}

impl<E: Serialize + IntoResponse + Debug> IntoResponse for RedirectResponse<E> {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(redirect) => redirect.into_response(),
            Err(error) => {
                tracing::error!(?error, "request failed");
                error.into_response()
            }
        }
    }
}

impl<E: Serialize + IntoResponse> From<Result<Redirect, E>> for RedirectResponse<E> {
    fn from(result: Result<Redirect, E>) -> Self {
        match result {
            Ok(redirect) => RedirectResponse::new_ok(redirect),
            Err(error) => RedirectResponse::new_error(error),
        }
    }
}
