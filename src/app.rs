use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::{IdentityBackend, Settings, hosted_config_url, resolve_firebase_api_key};
use crate::downloader::{self, CSV_FILE_NAME, EXPORT_FILE_NAME};
use crate::error::ExportError;
use crate::fetcher::GithubScripts;
use crate::firebase::FirebaseIdentity;
use crate::loader::UploadedFile;
use crate::login::{
    IdentityProvider, LocalIdentity, SESSION_COOKIE, SessionHandle, SessionStore, handle_login,
    handle_logout, handle_signup, require_auth, serve_login_page, serve_signup_page,
};
use crate::pipeline::ComparisonPipeline;
use crate::shell::{SessionShell, Slot, View};
use crate::strategy::StrategyRegistry;

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub struct AppState {
    pub settings: Settings,
    pub identity: Arc<dyn IdentityProvider>,
    pub sessions: SessionStore,
    pub pipeline: Arc<ComparisonPipeline>,
    templates: Handlebars<'static>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        identity: Arc<dyn IdentityProvider>,
        pipeline: ComparisonPipeline,
    ) -> anyhow::Result<Self> {
        let mut templates = Handlebars::new();
        templates.register_template_string("loading", include_str!("./static/loading.html"))?;
        templates.register_template_string("login", include_str!("./static/login.html"))?;
        templates.register_template_string("signup", include_str!("./static/signup.html"))?;
        templates.register_template_string("main", include_str!("./static/main.html"))?;

        let sessions = SessionStore::new(Duration::from_secs(settings.session_ttl_secs));
        Ok(AppState {
            settings,
            identity,
            sessions,
            pipeline: Arc::new(pipeline),
            templates,
        })
    }
}

/// Render one of the page templates
pub fn render_page(state: &AppState, name: &str, data: &Value) -> Html<String> {
    match state.templates.render(name, data) {
        Ok(page) => Html(page),
        Err(e) => {
            log::error!("failed to render {} page: {}", name, e);
            Html("<h1>Something went wrong</h1>".to_string())
        }
    }
}

/// Construct the identity provider and comparison pipeline from settings
pub async fn build_state(settings: Settings) -> anyhow::Result<Arc<AppState>> {
    let identity: Arc<dyn IdentityProvider> = match settings.identity.backend {
        IdentityBackend::Local => {
            log::info!(
                "using local identity store {}",
                settings.identity.users_file.display()
            );
            Arc::new(LocalIdentity::new(
                settings.identity.users_file.clone(),
                Duration::from_secs(settings.identity.token_ttl_secs),
            )?)
        }
        IdentityBackend::Firebase => {
            let url = hosted_config_url(&settings.identity.firebase_project_id);
            let api_key = resolve_firebase_api_key(&settings.identity, &url).await?;
            Arc::new(FirebaseIdentity::new(api_key, &settings.identity)?)
        }
    };

    let mut pipeline = ComparisonPipeline::new(StrategyRegistry::with_builtins());
    if settings.scripts.remote_enabled {
        log::info!(
            "remote scripts enabled from {}/{}",
            settings.scripts.repository.owner,
            settings.scripts.repository.repo
        );
        let source = GithubScripts::new(settings.scripts.repository.clone())?;
        pipeline = pipeline.with_remote_scripts(
            Arc::new(source),
            settings.scripts.sandbox_limits(),
            settings.scripts.catalog.clone(),
        );
    }

    Ok(Arc::new(AppState::new(settings, identity, pipeline)?))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let max_upload = state.settings.max_upload_bytes;

    let protected = Router::new()
        .route("/compare", post(compare_form))
        .route("/clear", post(clear_form))
        .route("/export/xlsx", get(export_xlsx))
        .route("/export/csv", get(export_csv))
        .route("/api/scripts", get(api_scripts))
        .route("/api/me", get(api_me))
        .route("/api/upload/:slot", post(api_upload))
        .route("/api/script", post(api_script))
        .route("/api/compare", post(api_compare))
        .route("/api/clear", post(api_clear))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(serve_index))
        .route("/login", get(serve_login_page).post(handle_login))
        .route("/signup", get(serve_signup_page).post(handle_signup))
        .route("/logout", post(handle_logout))
        .route("/api/state", get(api_state))
        .merge(protected)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload))
        .with_state(state)
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let bind_addr = settings.bind_addr.clone();
    let state = build_state(settings).await?;
    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

fn current_session(state: &AppState, jar: &CookieJar) -> Option<Arc<SessionHandle>> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.validate_session(cookie.value()))
}

#[derive(Serialize)]
struct ScriptOption {
    key: String,
    label: String,
    selected: bool,
}

async fn serve_index(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let Some(session) = current_session(&state, &jar) else {
        return Redirect::to("/login").into_response();
    };

    let (view, snapshot) = {
        let shell = session.shell();
        (shell.view().clone(), shell.snapshot())
    };

    match view {
        View::Loading => render_page(&state, "loading", &json!({})).into_response(),
        View::Unauthenticated => Redirect::to("/login").into_response(),
        View::Authenticated(_) => {
            let scripts: Vec<ScriptOption> = state
                .pipeline
                .scripts()
                .into_iter()
                .map(|info| ScriptOption {
                    selected: snapshot.script.as_deref() == Some(info.key.as_str()),
                    key: info.key,
                    label: info.label,
                })
                .collect();
            let data = json!({
                "state": snapshot,
                "scripts": scripts,
                "processing": snapshot.phase == crate::shell::Phase::Processing,
            });
            render_page(&state, "main", &data).into_response()
        }
    }
}

/// Start a comparison for the session's current inputs
///
/// Returns false when inputs are missing; the shell then carries the
/// validation message.
fn start_compare(state: &AppState, session: &Arc<SessionHandle>) -> bool {
    let Some(started) = session.shell().begin_compare() else {
        return false;
    };

    let generation = started.generation;
    let pipeline = state.pipeline.clone();
    let task_session = session.clone();
    log::info!(
        "session {} starting comparison {} with {}",
        session.id,
        generation,
        started.request.script
    );

    let task = tokio::spawn(async move {
        let progress_session = task_session.clone();
        let outcome = pipeline
            .run(started.request, started.cancel, move |stage| {
                progress_session.shell().progress(generation, stage)
            })
            .await;
        if let Err(e) = &outcome {
            if !e.is_cancelled() {
                log::warn!("comparison {} failed: {}", generation, e);
            }
        }
        task_session.shell().finish(generation, outcome);
    });

    session.shell().attach_task(generation, task.abort_handle());
    true
}

/// Read an uploaded file field; empty file inputs yield `None`
async fn read_file_field(
    field: axum::extract::multipart::Field<'_>,
) -> Result<Option<UploadedFile>, StatusCode> {
    let name = field
        .file_name()
        .map(str::to_string)
        .unwrap_or_default();
    let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
    if name.is_empty() && bytes.is_empty() {
        return Ok(None);
    }
    let name = if name.is_empty() { "upload".to_string() } else { name };
    Ok(Some(UploadedFile::new(name, bytes.to_vec())))
}

/// Form submission from the main page: optional files, script, then run
async fn compare_form(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Arc<SessionHandle>>,
    mut multipart: Multipart,
) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return (StatusCode::BAD_REQUEST, e.body_text()).into_response(),
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file1" | "file2" => {
                let slot = if name == "file1" { Slot::First } else { Slot::Second };
                match read_file_field(field).await {
                    Ok(Some(file)) => session.shell().select_file(slot, file),
                    Ok(None) => {}
                    Err(status) => return status.into_response(),
                }
            }
            "script" => {
                let script = field.text().await.unwrap_or_default();
                session.shell().select_script(&script);
            }
            _ => {}
        }
    }

    start_compare(&state, &session);
    Redirect::to("/").into_response()
}

async fn clear_form(Extension(session): Extension<Arc<SessionHandle>>) -> Redirect {
    session.shell().clear();
    Redirect::to("/")
}

fn export_response(
    result: Result<Vec<u8>, ExportError>,
    content_type: &'static str,
    file_name: &str,
) -> Response {
    match result {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            )
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(ExportError::EmptyGrid) => {
            (StatusCode::CONFLICT, ExportError::EmptyGrid.to_string()).into_response()
        }
        Err(e) => {
            log::error!("export failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn export_xlsx(Extension(session): Extension<Arc<SessionHandle>>) -> Response {
    let grid = session.shell().grid().clone();
    match tokio::task::spawn_blocking(move || downloader::to_xlsx(&grid)).await {
        Ok(result) => export_response(result, XLSX_CONTENT_TYPE, EXPORT_FILE_NAME),
        Err(e) => {
            log::error!("export task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn export_csv(Extension(session): Extension<Arc<SessionHandle>>) -> Response {
    let grid = session.shell().grid().clone();
    let result = downloader::to_csv(&grid).map(String::into_bytes);
    export_response(result, "text/csv; charset=utf-8", CSV_FILE_NAME)
}

/// Current page state; readable without a signed-in session so the
/// loading page can poll it.
async fn api_state(State(state): State<Arc<AppState>>, jar: CookieJar) -> Json<Value> {
    let snapshot = match current_session(&state, &jar) {
        Some(session) => session.shell().snapshot(),
        None => {
            let mut shell = SessionShell::new();
            shell.identity_changed(None);
            shell.snapshot()
        }
    };
    Json(json!(snapshot))
}

async fn api_scripts(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.pipeline.scripts()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email: String,
    uid: String,
    display_name: Option<String>,
    email_verified: bool,
}

async fn api_me(Extension(session): Extension<Arc<SessionHandle>>) -> Response {
    let user = session.shell().user().cloned();
    match user {
        Some(user) => Json(Profile {
            email: user.email,
            uid: user.uid,
            display_name: user.display_name,
            email_verified: user.email_verified,
        })
        .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

fn snapshot_json(session: &SessionHandle) -> Json<Value> {
    Json(json!(session.shell().snapshot()))
}

async fn api_upload(
    Extension(session): Extension<Arc<SessionHandle>>,
    Path(slot): Path<String>,
    mut multipart: Multipart,
) -> Response {
    let Some(slot) = Slot::parse(&slot) else {
        return (StatusCode::NOT_FOUND, "unknown file slot").into_response();
    };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return (StatusCode::BAD_REQUEST, e.body_text()).into_response(),
        };
        match read_file_field(field).await {
            Ok(Some(file)) => {
                log::debug!("session {} selected {} ({} bytes)", session.id, file.name, file.len());
                session.shell().select_file(slot, file);
                return snapshot_json(&session).into_response();
            }
            Ok(None) => continue,
            Err(status) => return status.into_response(),
        }
    }

    (StatusCode::BAD_REQUEST, "no file in upload").into_response()
}

#[derive(Deserialize)]
struct ScriptChoice {
    script: String,
}

async fn api_script(
    Extension(session): Extension<Arc<SessionHandle>>,
    Json(choice): Json<ScriptChoice>,
) -> Json<Value> {
    session.shell().select_script(&choice.script);
    snapshot_json(&session)
}

async fn api_compare(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Arc<SessionHandle>>,
) -> Response {
    let status = if start_compare(&state, &session) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, snapshot_json(&session)).into_response()
}

async fn api_clear(Extension(session): Extension<Arc<SessionHandle>>) -> Json<Value> {
    session.shell().clear();
    snapshot_json(&session)
}
