//! Helpers for testing the lookup service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp
//!    directory is held for the entire lifetime of the test. When dropped
//!    too early, the store will recreate the directory lazily and the test
//!    might silently leak it. Assign it to a variable in the test function
//!    (e.g. `let _cache_dir = test::tempdir()`).
//!
//!  - When using [`Server`], make sure that the server is held until all
//!    requests to it have been made. If the server is dropped, the ports
//!    remain open and all connections to it will time out. To avoid this,
//!    assign it to a variable: `let server = test::Server::vehicle_api();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{OriginalUri, Path, Request};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this workspace's
///    crates and mutes all other logs (such as hyper or reqwest internals).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("motordata_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a
/// `tokio::test`. It automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Server {
    /// Spawns the given router on an ephemeral localhost port, counting
    /// hits per request URI.
    pub fn with_router(router: Router) -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };
        let router = router.layer(middleware::from_fn(hitcounter));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
        }
    }

    /// Spawns a canned rendition of the upstream vehicle-data APIs.
    ///
    /// Routes (all below `/api/v1`):
    ///  - `tech-specs/:make/:model`, `vehicles/:make/:model` and
    ///    `vehicle-analysis/:registration` respond with a JSON payload
    ///    echoing the request; a make or registration of `missing` responds
    ///    `404` with a JSON `detail`.
    ///  - `tech-specs-lookup` and `repair-times-lookup` (POST) require
    ///    `vehicleData.make`/`.model` and respond `400` with a JSON
    ///    `message` otherwise.
    ///  - `manual/defect/:id`, `manual/section/:id`, `manual/subsection/:id`
    ///    and `manual/all` serve the inspection-manual shapes.
    ///  - `status/:num/*tail` responds with the given status code.
    ///  - `flaky/:fails/*tail` fails with `503` for the first `fails`
    ///    requests per tail, then serves JSON.
    ///  - `delay/:time/*tail` sleeps before serving JSON.
    ///  - `garbage/*tail` serves a body that is not JSON.
    pub fn vehicle_api() -> Self {
        let flaky_counts: Arc<Mutex<BTreeMap<String, usize>>> = Default::default();

        let flaky = {
            let counts = flaky_counts.clone();
            move |Path((fails, tail)): Path<(usize, String)>| {
                let counts = counts.clone();
                async move {
                    let mut counts = counts.lock().unwrap();
                    let seen = counts.entry(tail.clone()).or_default();
                    *seen += 1;
                    if *seen <= fails {
                        (StatusCode::SERVICE_UNAVAILABLE, Json(Value::Null)).into_response()
                    } else {
                        Json(json!({ "path": tail, "attempt": *seen })).into_response()
                    }
                }
            }
        };

        let router = Router::new()
            .route(
                "/api/v1/tech-specs/:make/:model",
                get(|Path((make, model)): Path<(String, String)>| async move {
                    vehicle_payload("specifications", &make, &model)
                }),
            )
            .route(
                "/api/v1/tech-specs-lookup",
                post(|Json(body): Json<Value>| async move { lookup_payload("specifications", body) }),
            )
            .route(
                "/api/v1/vehicles",
                get(|| async {
                    Json(json!({ "vehicles": [{ "make": "ford", "model": "focus" }] }))
                        .into_response()
                }),
            )
            .route(
                "/api/v1/vehicles/:make/:model",
                get(|Path((make, model)): Path<(String, String)>| async move {
                    vehicle_payload("repair_times", &make, &model)
                }),
            )
            .route(
                "/api/v1/repair-times-lookup",
                post(|Json(body): Json<Value>| async move { lookup_payload("repair_times", body) }),
            )
            .route(
                "/api/v1/manual/defect/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "defect": { "id": id, "category": "major" } }))
                }),
            )
            .route(
                "/api/v1/manual/section/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "title": format!("Section {id}"), "subsections": [] }))
                }),
            )
            .route(
                "/api/v1/manual/subsection/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "title": format!("Subsection {id}"), "items": [] }))
                }),
            )
            .route(
                "/api/v1/manual/item/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "item": { "id": id, "title": format!("Item {id}") } }))
                }),
            )
            .route(
                "/api/v1/manual/all",
                get(|| async { Json(json!({ "title": "MOT inspection manual", "sections": [] })) }),
            )
            .route(
                "/api/v1/vehicle-analysis/:registration",
                get(|Path(registration): Path<String>| async move {
                    if registration.eq_ignore_ascii_case("missing") {
                        not_found("no analysis available for this registration")
                    } else {
                        Json(json!({ "registration": registration, "condition": "good" }))
                            .into_response()
                    }
                }),
            )
            .route(
                "/api/v1/status/:num/*tail",
                get(|Path((num, _)): Path<(u16, String)>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route("/api/v1/flaky/:fails/*tail", get(flaky))
            .route(
                "/api/v1/delay/:time/*tail",
                get(|Path((time, tail)): Path<(String, String)>| async move {
                    let duration = humantime::parse_duration(&time).unwrap();
                    tokio::time::sleep(duration).await;

                    Json(json!({ "path": tail }))
                }),
            )
            .route(
                "/api/v1/garbage/*tail",
                get(|Path(tail): Path<String>| async move { tail }),
            );

        Self::with_router(router)
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }

    /// Drains the hit counters, returning the total number of requests.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Drains the hit counters, returning per-URI request counts.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn not_found(detail: &str) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
}

fn vehicle_payload(kind: &str, make: &str, model: &str) -> axum::response::Response {
    if make.eq_ignore_ascii_case("missing") {
        return not_found("no data found for this vehicle");
    }
    Json(json!({
        "make": make,
        "model": model,
        "data_type": kind,
        "data": { "sample": true },
    }))
    .into_response()
}

fn lookup_payload(kind: &str, body: Value) -> axum::response::Response {
    let vehicle = body.get("vehicleData");
    let make = vehicle.and_then(|v| v.get("make")).and_then(Value::as_str);
    let model = vehicle.and_then(|v| v.get("model")).and_then(Value::as_str);

    match (make, model) {
        (Some(make), Some(model)) => vehicle_payload(kind, make, model),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "vehicle make and model are required" })),
        )
            .into_response(),
    }
}
