//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`SourceServer`] or [`Server`], make sure that the server is held until all
//!    requests to it have been made. The server stops serving when it is dropped, and all
//!    connections to it will fail. Assign it to a variable: `let server = SourceServer::new();`.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use reqwest::{StatusCode, Url};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the attrcache crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("attrcache=trace,attrcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Serves the given router on a random local port.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        Self { handle, socket }
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
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Clone, Debug, Default)]
struct SourceState {
    documents: Arc<Mutex<BTreeMap<u32, String>>>,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

async fn count_hits(
    State(state): State<SourceState>,
    OriginalUri(uri): OriginalUri,
    request: Request,
    next: Next,
) -> Response {
    {
        let mut hits = state.hits.lock().unwrap();
        *hits.entry(uri.to_string()).or_default() += 1;
    }

    next.run(request).await
}

async fn serve_source(
    State(state): State<SourceState>,
    extract::Path(id): extract::Path<u32>,
) -> Result<String, StatusCode> {
    let documents = state.documents.lock().unwrap();
    documents.get(&id).cloned().ok_or(StatusCode::NOT_FOUND)
}

/// An HTTP server serving source documents, counting every request it receives.
///
/// Documents are served under `/sources/<id>`. In addition, the server has a few routes to
/// simulate misbehaving remotes:
///
///  - `/respond_statuscode/<code>/<id>` responds with the given status code.
///  - `/delay/<duration>/<path>` waits for the given duration, then redirects to `/<path>`.
#[derive(Debug)]
pub struct SourceServer {
    server: Server,
    state: SourceState,
}

impl SourceServer {
    pub fn new() -> Self {
        let state = SourceState::default();

        let router = Router::new()
            .route("/sources/:id", get(serve_source))
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .layer(middleware::from_fn_with_state(state.clone(), count_hits))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// Serves `document` as the source with the given id.
    pub fn insert(&self, id: u32, document: &str) {
        let mut documents = self.state.documents.lock().unwrap();
        documents.insert(id, document.to_owned());
    }

    /// Returns the number of requests since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_values().sum()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// A source URL template pointing at the documents of this server.
    pub fn url_template(&self) -> String {
        self.url_template_with("sources")
    }

    /// A source URL template pointing at `/<prefix>/{id}` of this server.
    pub fn url_template_with(&self, prefix: &str) -> String {
        format!("http://127.0.0.1:{}/{}/{{id}}", self.server.port(), prefix)
    }
}

impl Default for SourceServer {
    fn default() -> Self {
        Self::new()
    }
}
