use std::future::Future;
use std::io;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Form, Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use formbridge_core::codec::parse_message;
use formbridge_core::errors::{ErrorKind, FormError, FormResult};
use formbridge_core::settings::{Settings, SettingsLoader};
use formbridge_core::subject::{subject_from_message, SubjectTemplate};
use formbridge_ipc::daemon_messages::{routes, OpenRequest, ERROR_HEADER, UNKNOWN_ADDON};
use serde::Deserialize;
use tokio::sync::Notify;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::pages::{diagnostic_page, Pages};
use crate::session::{is_unknown_addon, FormSession, HostResponse, SessionId, SessionRegistry};
use crate::submission::{Submission, SubmissionAdapter, SubmissionOutcome};

/// Application state shared with all routes
#[derive(Clone)]
pub struct AppState {
    registry: Arc<SessionRegistry>,
    settings: Arc<Mutex<SettingsLoader>>,
    submitter: Arc<SubmissionAdapter>,
    pages: Arc<Pages>,
    stop: Arc<Notify>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        settings: SettingsLoader,
        submitter: SubmissionAdapter,
        pages: Pages,
    ) -> Self {
        Self {
            registry,
            settings: Arc::new(Mutex::new(settings)),
            submitter: Arc::new(submitter),
            pages: Arc::new(pages),
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Resolves once `POST /stop` has been received.
    pub async fn stop_requested(&self) {
        self.stop.notified().await
    }

    fn settings(&self) -> Settings {
        let mut loader = match self.settings.lock() {
            Ok(loader) => loader,
            Err(poisoned) => poisoned.into_inner(),
        };
        loader.current()
    }
}

/// Error type for HTTP routes, rendered as the diagnostic page.
#[derive(Debug)]
pub struct ApiError {
    error: FormError,
    session: Option<Box<FormSession>>,
}

impl ApiError {
    fn with_session(mut self, session: FormSession) -> Self {
        self.session = Some(Box::new(session));
        self
    }
}

impl From<FormError> for ApiError {
    fn from(error: FormError) -> Self {
        Self {
            error,
            session: None,
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::Codec => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::TransportTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::TransportRefused | ErrorKind::HostRejected => StatusCode::BAD_GATEWAY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let unknown_addon = is_unknown_addon(&self.error);
        let status = if unknown_addon {
            StatusCode::NOT_FOUND
        } else {
            status_for(self.error.kind)
        };
        match self.error.kind {
            ErrorKind::Internal => error!(error = %self.error, "Internal server error"),
            ErrorKind::NotFound => debug!(error = %self.error, "Request for unknown session"),
            _ => warn!(error = %self.error, "Request failed"),
        }

        let page = diagnostic_page(&self.error, self.session.as_deref());
        let mut response = (status, Html(page)).into_response();
        if unknown_addon {
            response
                .headers_mut()
                .insert(ERROR_HEADER, HeaderValue::from_static(UNKNOWN_ADDON));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Edited message text posted by a form
#[derive(Deserialize)]
pub struct FormText {
    #[serde(default)]
    formtext: String,
}

#[derive(Deserialize)]
pub struct ManualCreate {
    form: String,
}

fn is_loopback_origin(origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let host = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .unwrap_or(origin);
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    matches!(host, "127.0.0.1" | "localhost" | "[::1]")
}

/// Build the router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| is_loopback_origin(origin)))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route(routes::OPEN, post(open_session))
        .route("/form/:id", get(view_form))
        .route("/message/:id", get(view_message))
        .route("/save/:id", post(save_message))
        .route("/email/:id", post(email_message))
        .route("/submit/:id", post(submit_message))
        .route("/close/:id", post(close_session))
        .route("/ping/:id", get(ping))
        .route(routes::MANUAL, get(manual))
        .route(routes::MANUAL_CREATE, get(manual_create))
        .route(routes::STOP, post(stop))
        .layer(cors)
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Starting HTTP server");
    let app = router(state);
    axum::Server::from_tcp(listener)
        .map_err(|e| anyhow::anyhow!("Failed to start HTTP server: {}", e))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server failed: {}", e))
}

fn parse_id(id: &str) -> FormResult<SessionId> {
    id.parse()
}

/// Load the host's message file into the session on first use.
async fn ensure_message(state: &AppState, session: FormSession) -> FormResult<FormSession> {
    if session.message.is_some() {
        return Ok(session);
    }
    let Some(path) = session.environment.message_file() else {
        return Ok(session);
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => {
            debug!(session = %session.id, path = %path.display(), "Loaded message file");
            state
                .registry
                .update(session.id, |s| s.message = Some(text))
                .await
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(session = %session.id, path = %path.display(), "Message file is missing");
            Ok(session)
        }
        Err(e) => Err(FormError::from(e).with_context("message_file", path.display().to_string())),
    }
}

fn form_type_of(session: &FormSession) -> FormResult<String> {
    if let Some(form_type) = session.environment.form_type() {
        return Ok(form_type.to_string());
    }
    match &session.message {
        Some(message) => Ok(parse_message(message)?.form_type),
        None => Err(FormError::configuration("session has neither a form type nor a message")),
    }
}

fn rejection_error(response: &HostResponse) -> FormError {
    let mut err = FormError::new(
        ErrorKind::HostRejected,
        format!("the {} rejected the message", response.source),
    );
    if let Some(status) = response.status {
        err = err.with_context("status", status.to_string());
    }
    for (name, value) in &response.headers {
        err = err.with_context(name, value);
    }
    err.with_context("body", &response.body)
}

fn editable(session: &FormSession) -> FormResult<()> {
    if session.is_read_only() {
        return Err(FormError::configuration(format!(
            "session {} is read-only",
            session.id
        )));
    }
    Ok(())
}

async fn open_session(
    State(state): State<AppState>,
    Json(request): Json<OpenRequest>,
) -> ApiResult<Redirect> {
    let id = state.registry.open(&request.args).await?;
    Ok(Redirect::to(&routes::form(&id.to_string())))
}

async fn view_form(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Html<String>> {
    let id = parse_id(&id)?;
    let session = state.registry.get(id).await?;
    let session = ensure_message(&state, session).await?;
    let rendered = async {
        let form_type = form_type_of(&session)?;
        state.pages.render_form(&session, &form_type).await
    }
    .await;
    match rendered {
        Ok(html) => Ok(Html(html)),
        Err(e) => Err(ApiError::from(e).with_session(session)),
    }
}

async fn view_message(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    let session = state.registry.get(id).await?;
    let session = ensure_message(&state, session).await?;
    let text = session.message.unwrap_or_default();
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

async fn save_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Form(form): Form<FormText>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    let session = state.registry.get(id).await?;
    editable(&session).map_err(|e| ApiError::from(e).with_session(session))?;
    state
        .registry
        .update(id, |s| s.message = Some(form.formtext))
        .await?;
    debug!(session = %id, "Saved message edits");
    Ok(StatusCode::NO_CONTENT)
}

/// Mark the session read-only and return the message as mailable text.
async fn email_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Form(form): Form<FormText>,
) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    let session = state.registry.get(id).await?;
    let parsed = match parse_message(&form.formtext) {
        Ok(parsed) => parsed,
        Err(e) => return Err(ApiError::from(e).with_session(session)),
    };
    let template = SubjectTemplate::load(state.pages.forms_dir(), &parsed.form_type);
    let subject = subject_from_message(&parsed, &template);
    let text = form.formtext;
    let body = format!("Subject: {}\r\n\r\n{}", subject, text.replace("\r\n", "\n").replace('\n', "\r\n"));
    state
        .registry
        .update(id, |s| {
            s.message = Some(text);
            s.environment.set_read_only();
        })
        .await?;
    info!(session = %id, %subject, "Prepared message for email");
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

async fn submit_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Form(form): Form<FormText>,
) -> ApiResult<Html<String>> {
    let id = parse_id(&id)?;
    let text = form.formtext;
    let (session, _in_flight) = match state.registry.begin_submission(id, text.clone()).await {
        Ok(started) => started,
        Err(e) => {
            let err = ApiError::from(e);
            return Err(match state.registry.get(id).await {
                Ok(session) => err.with_session(session),
                Err(_) => err,
            });
        }
    };
    let submission = match Submission::prepare(&session, &text, state.pages.forms_dir()) {
        Ok(submission) => submission,
        Err(e) => return Err(ApiError::from(e).with_session(session)),
    };

    let settings = state.settings();
    let outcome = match state.submitter.submit(&submission, &settings).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(ApiError::from(e).with_session(session)),
    };

    match outcome {
        SubmissionOutcome::Delivered { path, response } => {
            let body = response.body.clone();
            let session = state.registry.mark_submitted(id, text, Some(response)).await?;
            info!(session = %id, %path, subject = %submission.subject, "Message submitted");
            let page = state
                .pages
                .submitted(&session, path, &submission.subject, &body)?;
            Ok(Html(page))
        }
        SubmissionOutcome::Rejected { response } => {
            let err = rejection_error(&response);
            let session = state
                .registry
                .update(id, |s| s.from_host_response = Some(response))
                .await?;
            Err(ApiError::from(err).with_session(session))
        }
    }
}

async fn close_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    if !state.registry.close(id).await? {
        debug!(session = %id, "Close of a session that is not open");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Keep-alive only; never answers with content.
async fn ping(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if let Ok(id) = parse_id(&id) {
        if let Err(e) = state.registry.keep_alive(id).await {
            debug!(session = %id, error = %e, "Ping for unknown session");
        }
    }
    StatusCode::NOT_FOUND
}

async fn manual(State(state): State<AppState>) -> ApiResult<Html<String>> {
    let forms = state.pages.list_forms().await?;
    Ok(Html(state.pages.manual(&forms)?))
}

async fn manual_create(
    State(state): State<AppState>,
    Query(query): Query<ManualCreate>,
) -> ApiResult<Redirect> {
    let path = state.pages.form_path(&query.form)?;
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(FormError::configuration(format!("form '{}' is not installed", query.form))
            .with_context("path", path.display().to_string())
            .into());
    }
    let addon = state.settings().manual.addon_name;
    let id = state.registry.open_manual(&addon, &query.form).await?;
    Ok(Redirect::to(&routes::form(&id.to_string())))
}

async fn stop(State(state): State<AppState>) -> &'static str {
    info!("Stop requested");
    state.stop.notify_one();
    "stopping"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemorySnapshotStore, RegistryConfig, SystemClock};
    use crate::submission::test_support::{slow_endpoint, stub_endpoint};
    use formbridge_ipc::daemon_messages::daemon_url;
    use reqwest::redirect::Policy;
    use reqwest::StatusCode;
    use tempfile::TempDir;
    use tokio::test;

    const MESSAGE: &str = "!PacFORMS!\n#T: ics213.html\nMsgNo: [6DM-1]\n10.subject: [Hi]\n!/ADDON!\n";

    struct Harness {
        home: TempDir,
        base: String,
        client: reqwest::Client,
        state: AppState,
    }

    async fn harness(delivery_port: Option<u16>) -> Harness {
        let home = tempfile::tempdir().unwrap();
        let addons = home.path().join("addons");
        let forms = home.path().join("forms");
        std::fs::create_dir_all(&addons).unwrap();
        std::fs::create_dir_all(&forms).unwrap();
        std::fs::write(addons.join("PacFORMS.ini"), "").unwrap();
        std::fs::write(forms.join("ics213.html"), "<html><head></head><body>form</body></html>").unwrap();
        if let Some(port) = delivery_port {
            std::fs::write(
                home.path().join("settings.toml"),
                format!("[delivery]\nport = {}\n", port),
            )
            .unwrap();
        }

        let registry = Arc::new(SessionRegistry::new(
            RegistryConfig::new(addons),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(SystemClock),
        ));
        let state = AppState::new(
            registry,
            SettingsLoader::new(home.path().join("settings.toml")),
            SubmissionAdapter::new(home.path().join("tmp")).unwrap(),
            Pages::new(forms),
        );

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, state.clone(), std::future::pending()));

        Harness {
            home,
            base: daemon_url(port),
            client: reqwest::Client::builder().redirect(Policy::none()).build().unwrap(),
            state,
        }
    }

    impl Harness {
        async fn open(&self, args: &[&str]) -> reqwest::Response {
            let request = OpenRequest {
                args: args.iter().map(|s| s.to_string()).collect(),
            };
            self.client
                .post(format!("{}{}", self.base, routes::OPEN))
                .json(&request)
                .send()
                .await
                .unwrap()
        }

        async fn post_text(&self, path: String, text: &str) -> reqwest::Response {
            self.client
                .post(format!("{}{}", self.base, path))
                .form(&[("formtext", text)])
                .send()
                .await
                .unwrap()
        }
    }

    #[test]
    async fn test_open_redirects_to_form() {
        let h = harness(None).await;
        let response = h.open(&["--addon_name", "PacFORMS", "--filename", "ics213.html"]).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()["location"], "/form/1");

        let page = h
            .client
            .get(format!("{}/form/1", h.base))
            .send()
            .await
            .unwrap();
        assert_eq!(page.status(), StatusCode::OK);
        let html = page.text().await.unwrap();
        assert!(html.contains("window.formbridge"));
        assert!(html.contains(r#""session_id":"1""#));
    }

    #[test]
    async fn test_open_unknown_addon() {
        let h = harness(None).await;
        let response = h.open(&["--addon_name", "Other"]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[ERROR_HEADER], UNKNOWN_ADDON);
    }

    #[test]
    async fn test_open_missing_addon_is_bad_request() {
        let h = harness(None).await;
        let response = h.open(&["--MSG_STATE", "draft"]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(ERROR_HEADER).is_none());
    }

    #[test]
    async fn test_message_loaded_from_message_file() {
        let h = harness(None).await;
        let file = h.home.path().join("msg.txt");
        std::fs::write(&file, MESSAGE).unwrap();
        h.open(&["--addon_name", "PacFORMS", "--MSG_FILENAME", file.to_str().unwrap()])
            .await;

        let text = h
            .client
            .get(format!("{}/message/1", h.base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text, MESSAGE);

        // Form type comes from the message when not given as an argument.
        let page = h.client.get(format!("{}/form/1", h.base)).send().await.unwrap();
        assert_eq!(page.status(), StatusCode::OK);
    }

    #[test]
    async fn test_save_then_read_back() {
        let h = harness(None).await;
        h.open(&["--addon_name", "PacFORMS"]).await;
        let response = h.post_text(routes::save("1"), MESSAGE).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let session = h.state.registry().get(SessionId(1)).await.unwrap();
        assert_eq!(session.message.as_deref(), Some(MESSAGE));
    }

    #[test]
    async fn test_ping_is_always_not_found() {
        let h = harness(None).await;
        h.open(&["--addon_name", "PacFORMS"]).await;
        for id in ["0", "1", "77", "junk"] {
            let response = h
                .client
                .get(format!("{}{}", h.base, routes::ping(id)))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    async fn test_unknown_session_renders_diagnostic() {
        let h = harness(None).await;
        let response = h.client.get(format!("{}/form/9", h.base)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let html = response.text().await.unwrap();
        assert!(html.contains("never existed"));
    }

    #[test]
    async fn test_email_makes_session_read_only() {
        let h = harness(None).await;
        h.open(&["--addon_name", "PacFORMS"]).await;
        let response = h.post_text(routes::email("1"), MESSAGE).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.text().await.unwrap();
        assert!(body.starts_with("Subject: 6DM-1_R_Hi\r\n\r\n"));

        let again = h.post_text(routes::save("1"), MESSAGE).await;
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    async fn test_submit_codec_error() {
        let h = harness(None).await;
        h.open(&["--addon_name", "PacFORMS"]).await;
        let response = h.post_text(routes::submit("1"), "hello\nworld\n").await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        // The edits are kept.
        let session = h.state.registry().get(SessionId(1)).await.unwrap();
        assert_eq!(session.message.as_deref(), Some("hello\nworld\n"));
    }

    #[test]
    async fn test_submit_delivered() {
        let (port, received) = stub_endpoint(axum::http::StatusCode::OK, "ReturnCode: 0").await;
        let h = harness(Some(port)).await;
        h.open(&["--addon_name", "PacFORMS"]).await;

        let response = h.post_text(routes::submit("1"), MESSAGE).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.text().await.unwrap().contains("Message submitted"));
        assert_eq!(received.lock().unwrap().len(), 1);

        let session = h.state.registry().get(SessionId(1)).await.unwrap();
        assert!(session.is_read_only());
    }

    #[test]
    async fn test_double_submit_delivers_once() {
        let port = slow_endpoint(std::time::Duration::from_millis(500)).await;
        let h = harness(Some(port)).await;
        h.open(&["--addon_name", "PacFORMS"]).await;

        let (first, second) = tokio::join!(
            h.post_text(routes::submit("1"), MESSAGE),
            h.post_text(routes::submit("1"), MESSAGE)
        );
        let mut statuses = vec![first.status().as_u16(), second.status().as_u16()];
        statuses.sort();
        assert_eq!(statuses, vec![200, 400]);

        let session = h.state.registry().get(SessionId(1)).await.unwrap();
        assert!(session.is_read_only());
    }

    #[test]
    async fn test_submit_rejected_keeps_session_editable() {
        let (port, _) = stub_endpoint(axum::http::StatusCode::INTERNAL_SERVER_ERROR, "disk full").await;
        let h = harness(Some(port)).await;
        h.open(&["--addon_name", "PacFORMS"]).await;

        let response = h.post_text(routes::submit("1"), MESSAGE).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.text().await.unwrap().contains("disk full"));

        let session = h.state.registry().get(SessionId(1)).await.unwrap();
        assert!(!session.is_read_only());
        assert_eq!(session.from_host_response.unwrap().status, Some(500));
    }

    #[test]
    async fn test_close_twice() {
        let h = harness(None).await;
        h.open(&["--addon_name", "PacFORMS"]).await;
        for _ in 0..2 {
            let response = h
                .client
                .post(format!("{}{}", h.base, routes::close("1")))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
    }

    #[test]
    async fn test_manual_create() {
        let h = harness(None).await;
        let listing = h
            .client
            .get(format!("{}{}", h.base, routes::MANUAL))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(listing.contains("ics213.html"));

        let response = h
            .client
            .get(format!("{}{}?form=ics213.html", h.base, routes::MANUAL_CREATE))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let session = h.state.registry().get(SessionId(1)).await.unwrap();
        assert_eq!(session.environment.addon_name(), "formbridge");

        let missing = h
            .client
            .get(format!("{}{}?form=nope.html", h.base, routes::MANUAL_CREATE))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    async fn test_stop_notifies() {
        let h = harness(None).await;
        let response = h
            .client
            .post(format!("{}{}", h.base, routes::STOP))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::timeout(std::time::Duration::from_secs(5), h.state.stop_requested())
            .await
            .unwrap();
    }

    #[test]
    async fn test_loopback_origin() {
        assert!(is_loopback_origin(&HeaderValue::from_static("http://127.0.0.1:4000")));
        assert!(is_loopback_origin(&HeaderValue::from_static("http://localhost")));
        assert!(!is_loopback_origin(&HeaderValue::from_static("http://example.com")));
    }
}
