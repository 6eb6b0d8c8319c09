//! Http control surface mapped onto the coordinator's task operations.

use crate::analyzer::{Analyzer, INFINITE_REPEAT};
use axum::{
    extract::{Multipart, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{any, get, post},
    Form, Router,
};
use repro_core::parse::parse_log;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
struct AppState {
    analyzer: Arc<Analyzer>,
}

/// Serves json statistics and the task control endpoints.
pub struct Monitor {
    analyzer: Arc<Analyzer>,
}

impl Monitor {
    pub fn new(analyzer: Arc<Analyzer>) -> Self {
        Self { analyzer }
    }

    /// Serve the control surface, blocking the calling thread. The http
    /// runtime is confined to this thread; the rest of the process stays on
    /// plain threads.
    pub fn listen_and_serve(self, addr: &str) -> anyhow::Result<()> {
        log::info!("monitor the results at http://{}", addr);
        let app = Router::new()
            .route("/", get(index))
            .route("/api/stats.json", get(stats_json))
            .route("/api/add_task", post(add_task))
            .route("/api/stop_task", any(stop_task))
            .route("/api/run_task", any(run_task))
            .route("/api/is_running", any(is_running))
            .with_state(AppState {
                analyzer: self.analyzer,
            });

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let addr = addr.to_string();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            axum::serve(listener, app).await?;
            Ok::<(), anyhow::Error>(())
        })
    }
}

/// All replies carry a permissive cors header so external dashboards can
/// query the surface directly.
fn cors(resp: impl IntoResponse) -> Response {
    let mut resp = resp.into_response();
    resp.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    resp
}

fn internal_error<E: std::fmt::Display>(e: E) -> Response {
    cors((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Deserialize)]
struct IdForm {
    id: String,
}

async fn index() -> Response {
    cors(Html(BASE_PAGE))
}

async fn stats_json(State(state): State<AppState>) -> Response {
    match state.analyzer.stats().json() {
        Ok(body) => cors(([(header::CONTENT_TYPE, "application/json")], body)),
        Err(e) => internal_error(e),
    }
}

async fn add_task(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("reproducer") => {
                let data = match field.bytes().await {
                    Ok(data) => data,
                    Err(e) => return internal_error(e),
                };
                let programs = parse_log(&data);
                state.analyzer.add_tasks(&programs, INFINITE_REPEAT);
                return cors(StatusCode::OK);
            }
            Ok(Some(_)) => continue,
            Ok(None) => return internal_error("no reproducer field in request"),
            Err(e) => return internal_error(e),
        }
    }
}

async fn stop_task(State(state): State<AppState>, Form(form): Form<IdForm>) -> Response {
    match state.analyzer.stop_task(&form.id) {
        Ok(()) => cors(StatusCode::OK),
        Err(e) => internal_error(e),
    }
}

async fn run_task(State(state): State<AppState>, Form(form): Form<IdForm>) -> Response {
    match state.analyzer.run_task(&form.id) {
        Ok(()) => cors(StatusCode::OK),
        Err(e) => internal_error(e),
    }
}

async fn is_running(State(state): State<AppState>, Form(form): Form<IdForm>) -> Response {
    cors(state.analyzer.is_running(&form.id).to_string())
}

const BASE_PAGE: &str = r#"
<html>
<body>
<a href="/api/stats.json">show stats</a>
<form action="/api/add_task" method="post" enctype="multipart/form-data">
    <p><input type="file" name="reproducer">
    <p><button type="submit">Submit task</button>
</form>
<div> to stop a task: /api/stop_task?id={task_id}</div>
</body>
</html>
"#;
