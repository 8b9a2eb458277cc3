use std::time::Instant;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use symlookup_service::metric;
use symlookup_service::symbolication::SymbolicationService;

mod error;
mod symbolicate;

pub use error::ResponseError;

use symbolicate::symbolicate_v5;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    metric!(timer("requests.duration") = start.elapsed());
    metric!(
        counter("responses.status_code") += 1,
        "status" => response.status().as_str(),
    );
    response
}

pub fn create_app(service: SymbolicationService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(track_metrics));

    let symbolicate_route = post(symbolicate_v5).layer(DefaultBodyLimit::max(5 * 1024 * 1024));
    Router::new()
        .route("/symbolicate/v5", symbolicate_route)
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use reqwest::StatusCode;
    use serde_json::{Value, json};
    use symlookup_service::config::{CacheConfig, Config};
    use symlookup_service::convert::Converter;
    use symlookup_service::test::{FakeParser, fake_symbol_file};
    use symlookup_sources::SourceConfig;
    use symlookup_test::{self as test, Server, SymbolServer};

    use super::*;

    const XUL_ID: &str = "44E4EC8C2F41492B9369D6B9A059577C2";

    fn server(cache_dir: &Path, sources: Vec<SourceConfig>) -> Server {
        let config = Config {
            cache_dir: Some(cache_dir.to_owned()),
            sources: sources.into(),
            caches: CacheConfig {
                pending_poll_interval: Duration::from_millis(10),
                ..CacheConfig::default()
            },
            retry_backoff: Duration::from_millis(1),
            fetch_retries: 1,
            ..Config::default()
        };
        let service =
            SymbolicationService::with_converter(&config, Converter::new(FakeParser::new()))
                .unwrap();
        Server::with_router(create_app(service))
    }

    fn symbol_server() -> SymbolServer {
        let server = SymbolServer::new();
        server.add_file(
            &format!("regular/xul.pdb/{XUL_ID}/xul.sym"),
            fake_symbol_file(&[(0x1000, 0x100, "main")]),
        );
        server.add_file(
            &format!("try/xul.pdb/{XUL_ID}/xul.sym"),
            fake_symbol_file(&[(0x1000, 0x100, "try_main")]),
        );
        server
    }

    fn body() -> Value {
        json!({
            "jobs": [{
                "memoryMap": [["xul.pdb", XUL_ID], ["missing.pdb", "ABCDEF"]],
                "stacks": [[[0, 0x1010], [1, 0x20], [-1, 0x30]]]
            }]
        })
    }

    #[tokio::test]
    async fn test_healthcheck() {
        test::setup();

        let cache_dir = test::tempdir();
        let server = server(cache_dir.path(), vec![]);

        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_symbolicate() {
        test::setup();

        let cache_dir = test::tempdir();
        let symbols = symbol_server();
        let sources = vec![
            symbols.source("regular", "symbols/regular/", false),
            symbols.source("try", "symbols/try/", true),
        ];
        let server = server(cache_dir.path(), sources);
        let client = reqwest::Client::new();

        let response = client
            .post(server.url("/symbolicate/v5"))
            .json(&body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response: Value = response.json().await.unwrap();
        assert_eq!(
            response,
            json!({
                "results": [{
                    "stacks": [[
                        {
                            "frame": 0,
                            "module_offset": "0x1010",
                            "module": "xul.pdb",
                            "function": "main",
                            "function_offset": "0x10"
                        },
                        { "frame": 1, "module_offset": "0x20", "module": "missing.pdb" },
                        { "frame": 2, "module_offset": "0x30" }
                    ]],
                    "found_modules": {
                        "xul.pdb/44E4EC8C2F41492B9369D6B9A059577C2": true,
                        "missing.pdb/ABCDEF": false
                    }
                }]
            })
        );
    }

    #[tokio::test]
    async fn test_symbolicate_try_and_debug() {
        test::setup();

        let cache_dir = test::tempdir();
        let symbols = symbol_server();
        let sources = vec![symbols.source("try", "symbols/try/", true)];
        let server = server(cache_dir.path(), sources);
        let client = reqwest::Client::new();

        let response: Value = client
            .post(server.url("/symbolicate/v5?debug=1"))
            .header("Symbolication-Include-Try", "1")
            .json(&body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response["results"][0]["stacks"][0][0]["function"], "try_main");
        let debug = &response["debug"];
        assert_eq!(debug["modules_looked_up"], 2);
        assert_eq!(debug["modules"][format!("xul.pdb/{XUL_ID}")]["status"], "computed");
        assert_eq!(debug["modules"]["missing.pdb/ABCDEF"]["found"], false);
        assert_eq!(debug["modules"]["missing.pdb/ABCDEF"]["error"], "not found");
    }

    #[tokio::test]
    async fn test_bad_requests() {
        test::setup();

        let cache_dir = test::tempdir();
        let server = server(cache_dir.path(), vec![]);
        let client = reqwest::Client::new();

        let response = client
            .post(server.url("/symbolicate/v5"))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = client
            .post(server.url("/symbolicate/v5"))
            .json(&json!({
                "jobs": [{ "memoryMap": [["xul.pdb", XUL_ID]], "stacks": [[[3, 0x10]]] }]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: error::ApiErrorResponse = response.json().await.unwrap();
        assert_eq!(
            error.detail.as_deref(),
            Some("invalid request: job 0: module index 3 out of range")
        );
    }
}
