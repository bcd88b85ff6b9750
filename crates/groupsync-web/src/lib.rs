//! Axum JSON status API over the group store: import runs, per-system groups and reports.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use groupsync_core::{is_valid_system_name, StoreError};
use groupsync_storage::{FileGroupStore, GroupStore};
use groupsync_sync::{report_markdown, ImporterSettings};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "groupsync-web";

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn GroupStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn GroupStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

impl RunsQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/runs", get(runs_handler))
        .route("/runs/latest", get(latest_run_handler))
        .route("/runs/chart", get(runs_chart_handler))
        .route("/reports/latest.md", get(report_handler))
        .route("/groups/{system}", get(system_groups_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("GROUPSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let settings = ImporterSettings::from_env();
    let store = FileGroupStore::open(&settings.state_dir).await?;
    let state = AppState::new(Arc::new(store));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, state_dir = %settings.state_dir.display(), "serving import status");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    match state.store.list_runs(query.limit()).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn latest_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_runs(1).await {
        Ok(runs) => match runs.into_iter().next() {
            Some(run) => Json(run).into_response(),
            None => not_found("no import runs recorded"),
        },
        Err(err) => store_error(err),
    }
}

async fn runs_chart_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    match state.store.list_runs(query.limit()).await {
        Ok(mut runs) => {
            runs.reverse();
            let x = runs.iter().map(|r| r.started_at.to_rfc3339()).collect::<Vec<_>>();
            let changed = runs.iter().map(|r| r.totals().0 as i64).collect::<Vec<_>>();
            let removed = runs.iter().map(|r| r.totals().1 as i64).collect::<Vec<_>>();
            Json(serde_json::json!({
                "data": [
                    {"type": "bar", "name": "changed", "x": x, "y": changed, "marker": {"color": "#0ea5e9"}},
                    {"type": "bar", "name": "removed", "x": x, "y": removed, "marker": {"color": "#f97316"}}
                ],
                "layout": {
                    "title": "Groups Changed Per Import Run",
                    "barmode": "stack"
                }
            }))
            .into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn report_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    match state.store.list_runs(query.limit()).await {
        Ok(runs) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            report_markdown(&runs),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn system_groups_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(system): AxumPath<String>,
) -> Response {
    if !is_valid_system_name(&system) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("invalid system name {system:?}") })),
        )
            .into_response();
    }
    match state.store.list_groups_by_owner(&system).await {
        Ok(groups) => Json(groups).into_response(),
        Err(err) => store_error(err),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "group store request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use axum::body::Body;
    use chrono::Utc;
    use groupsync_core::{Group, GroupTransaction, Identity, ImportRun, Outcome};
    use groupsync_storage::MemoryGroupStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn seeded_store() -> Arc<MemoryGroupStore> {
        let store = MemoryGroupStore::new();
        let mut eng = Group::manual(
            "ldap/eng",
            BTreeSet::from([Identity::parse("user:alice@example.com").unwrap()]),
            Utc::now(),
        );
        eng.owning_system = Some("ldap".into());
        store
            .apply_transaction(GroupTransaction {
                creates: vec![eng, Group::manual("admins", [], Utc::now())],
                ..GroupTransaction::default()
            })
            .await
            .unwrap();

        let mut run = ImportRun::new(Uuid::new_v4(), Utc::now());
        run.begin().unwrap();
        run.record(
            "tarball:https://groups.example.com/t",
            Outcome::Success {
                groups_changed: 1,
                groups_removed: 0,
                payload_sha256: "ab".into(),
                wiped_systems: vec![],
            },
        )
        .unwrap();
        run.complete(Utc::now()).unwrap();
        store.record_run(&run).await.unwrap();
        Arc::new(store)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let app = app(AppState::new(Arc::new(MemoryGroupStore::new())));
        let (status, body) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn latest_run_is_404_until_a_run_is_recorded() {
        let empty = app(AppState::new(Arc::new(MemoryGroupStore::new())));
        let (status, _) = get(empty, "/runs/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let app = app(AppState::new(seeded_store().await));
        let (status, body) = get(app.clone(), "/runs/latest").await;
        assert_eq!(status, StatusCode::OK);
        let run: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(run["state"], "completed");
        assert_eq!(
            run["per_source_results"]["tarball:https://groups.example.com/t"]["status"],
            "success"
        );

        let (status, body) = get(app, "/runs?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        let runs: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn groups_are_listed_per_owning_system() {
        let app = app(AppState::new(seeded_store().await));
        let (status, body) = get(app.clone(), "/groups/ldap").await;
        assert_eq!(status, StatusCode::OK);
        let groups: Vec<Group> = serde_json::from_str(&body).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "ldap/eng");

        let (status, _) = get(app, "/groups/Not%20A%20System").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handler_smoke_report_and_chart() {
        let app = app(AppState::new(seeded_store().await));
        let (status, body) = get(app.clone(), "/reports/latest.md").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# Group Import Report"));

        let resp = app
            .oneshot(axum::http::Request::builder().uri("/runs/chart").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
    }
}
