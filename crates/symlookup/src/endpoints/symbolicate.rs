use axum::body::Bytes;
use axum::extract;
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Deserialize;

use symlookup_service::symbolication::{
    RequestOptions, SymbolicationRequest, SymbolicationResponse, SymbolicationService,
};

use super::ResponseError;

/// Query parameters of the symbolication request.
#[derive(Debug, Default, Deserialize)]
pub struct SymbolicationRequestQueryParams {
    #[serde(default, rename = "try")]
    pub include_try: Option<String>,
    #[serde(default)]
    pub debug: Option<String>,
}

const INCLUDE_TRY_HEADER: &str = "symbolication-include-try";
const DEBUG_HEADER: &str = "debug";

fn is_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// A flag is set by either its query parameter or its header.
fn flag(query: Option<&str>, headers: &HeaderMap, header: &str) -> bool {
    let from_header = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .is_some_and(is_enabled);
    from_header || query.is_some_and(is_enabled)
}

pub async fn symbolicate_v5(
    extract::State(service): extract::State<SymbolicationService>,
    extract::Query(params): extract::Query<SymbolicationRequestQueryParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SymbolicationResponse>, ResponseError> {
    let request: SymbolicationRequest = serde_json::from_slice(&body)?;
    let options = RequestOptions {
        include_try: flag(params.include_try.as_deref(), &headers, INCLUDE_TRY_HEADER),
        debug: flag(params.debug.as_deref(), &headers, DEBUG_HEADER),
    };

    sentry::configure_scope(|scope| {
        scope.set_tag("request.jobs", request.jobs.len());
        scope.set_tag("request.include_try", options.include_try);
    });

    let response = service.symbolicate(request, options).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut headers = HeaderMap::new();
        assert!(!flag(None, &headers, INCLUDE_TRY_HEADER));
        assert!(flag(Some("1"), &headers, INCLUDE_TRY_HEADER));
        assert!(flag(Some("True"), &headers, INCLUDE_TRY_HEADER));
        assert!(!flag(Some("0"), &headers, INCLUDE_TRY_HEADER));

        headers.insert(INCLUDE_TRY_HEADER, "true".parse().unwrap());
        assert!(flag(None, &headers, INCLUDE_TRY_HEADER));
        assert!(!flag(None, &headers, DEBUG_HEADER));
    }
}
