use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uphill_core::{
    new_id, DailySummary, EvaluationRequest, ExecutionCreate, ExecutionRecord, Routine,
    RoutineCreate, RoutineEvaluation, RoutineUpdate, UserProfile, ValidationError,
};
use uphill_feedback::{
    aggregate,
    evaluator::RoutineEvaluator,
    model::OpenAiClient,
    AggregateError, FeedbackGenerator,
};
use uphill_storage::{RoutineStore, StorageError};

const GOOGLE_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: String,
    debug: bool,
    insecure_auth: bool,
    google_client_id: Option<String>,
    allowed_origins: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(name = "uphill-server")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Accept the raw bearer token as the user id. Local development only.
    #[arg(long, default_value_t = false)]
    insecure_auth: bool,
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_env_or(&args.addr, "UPHILL_ADDR", "127.0.0.1:8000"),
        db_path: resolve_env_or(&args.db, "UPHILL_DB_PATH", "uphill.db"),
        debug: args.debug,
        insecure_auth: args.insecure_auth || env_true("UPHILL_INSECURE_AUTH"),
        google_client_id: non_empty_env("GOOGLE_CLIENT_ID"),
        allowed_origins: std::env::var("UPHILL_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

fn resolve_env_or(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    match non_empty_env(key) {
        Some(value) => value,
        None => default.to_string(),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("UPHILL_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("dependency failure: {0}")]
    Dependency(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.to_string();
        (self.status(), Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Dependency(err.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<AggregateError> for ApiError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::InvalidDate(err) => ApiError::Validation(err.to_string()),
            AggregateError::Storage(err) => err.into(),
        }
    }
}

/// Claims returned by the identity provider for a verified credential.
#[derive(Debug, Clone, Deserialize)]
struct VerifiedIdentity {
    sub: String,
    #[serde(default)]
    aud: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Identity boundary: validates a bearer credential against Google's
/// tokeninfo endpoint and yields the provider-issued subject id. The
/// insecure mode short-circuits for local development and tests.
enum TokenVerifier {
    Google {
        http: reqwest::Client,
        client_id: Option<String>,
    },
    Insecure,
}

impl TokenVerifier {
    fn from_config(config: &Config) -> Self {
        if config.insecure_auth {
            warn!(event = "insecure_auth_enabled");
            return TokenVerifier::Insecure;
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        TokenVerifier::Google {
            http,
            client_id: config.google_client_id.clone(),
        }
    }

    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, ApiError> {
        if token.trim().is_empty() {
            return Err(ApiError::Unauthenticated("Token must not be empty".to_string()));
        }
        match self {
            TokenVerifier::Insecure => Ok(VerifiedIdentity {
                sub: token.to_string(),
                aud: None,
                email: None,
                name: None,
                picture: None,
            }),
            TokenVerifier::Google { http, client_id } => {
                let response = http
                    .get(format!("{GOOGLE_TOKENINFO_URL}?id_token={token}"))
                    .send()
                    .await
                    .map_err(|err| ApiError::Dependency(err.to_string()))?;
                if !response.status().is_success() {
                    return Err(ApiError::Unauthenticated(
                        "Invalid or expired token".to_string(),
                    ));
                }
                let identity: VerifiedIdentity = response
                    .json()
                    .await
                    .map_err(|_| ApiError::Unauthenticated("Invalid token response".to_string()))?;
                if identity.sub.is_empty() {
                    return Err(ApiError::Unauthenticated(
                        "Token does not contain a subject".to_string(),
                    ));
                }
                if let Some(expected) = client_id {
                    if identity.aud.as_deref() != Some(expected.as_str()) {
                        return Err(ApiError::Unauthenticated(
                            "Token audience mismatch".to_string(),
                        ));
                    }
                }
                Ok(identity)
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthenticated("Authorization header is required".to_string()))?
        .to_str()
        .map_err(|_| ApiError::Unauthenticated("Invalid authorization header".to_string()))?;
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(ApiError::Unauthenticated(
            "Invalid authorization header format. Expected: Bearer <token>".to_string(),
        )),
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<RoutineStore>>,
    verifier: Arc<TokenVerifier>,
    feedback: Arc<FeedbackGenerator<OpenAiClient>>,
    evaluator: Arc<RoutineEvaluator<OpenAiClient>>,
}

impl AppState {
    fn lock_store(&self) -> Result<MutexGuard<'_, RoutineStore>, ApiError> {
        self.store
            .lock()
            .map_err(|_| ApiError::Dependency("store lock poisoned".to_string()))
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, ApiError> {
        let token = bearer_token(headers)?;
        let identity = self.verifier.verify(token).await?;
        Ok(identity.sub)
    }
}

#[derive(Debug, Deserialize)]
struct GoogleLoginRequest {
    id_token: String,
}

#[derive(Debug, Serialize)]
struct GoogleLoginResponse {
    message: String,
    uid: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
    session_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoQuery {
    uid: String,
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: String,
}

#[derive(Debug, Serialize)]
struct DailyFeedbackResponse {
    date: String,
    summary: DailySummary,
    ai_feedback_short: String,
    ai_feedback_full: String,
    recommended_routines: Vec<String>,
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Uphill backend is running" }))
}

async fn health() -> &'static str {
    "ok"
}

async fn google_login(
    State(state): State<AppState>,
    Json(payload): Json<GoogleLoginRequest>,
) -> Result<Json<GoogleLoginResponse>, ApiError> {
    let identity = state.verifier.verify(&payload.id_token).await?;

    let user = UserProfile {
        uid: identity.sub.clone(),
        email: identity.email.clone(),
        name: identity.name.clone(),
        picture: identity.picture.clone(),
        created_at: Utc::now(),
    };
    state.lock_store()?.upsert_user(&user)?;
    info!(event = "google_login", uid = %identity.sub);

    Ok(Json(GoogleLoginResponse {
        message: "Google login success".to_string(),
        uid: identity.sub,
        email: identity.email,
        name: identity.name,
        picture: identity.picture,
        // The verified ID token doubles as the session credential; the
        // bearer middleware accepts exactly this token.
        session_token: payload.id_token,
    }))
}

async fn user_info(
    State(state): State<AppState>,
    Query(query): Query<UserInfoQuery>,
) -> Result<Json<UserProfile>, ApiError> {
    let user = state
        .lock_store()?
        .user(&query.uid)?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok(Json(user))
}

async fn create_routine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RoutineCreate>,
) -> Result<(StatusCode, Json<Routine>), ApiError> {
    let uid = state.authenticate(&headers).await?;
    payload.validate()?;

    let now = Utc::now();
    let routine = Routine {
        id: new_id(),
        owner_id: uid.clone(),
        title: payload.title,
        time_of_day: payload.time_of_day,
        category: payload.category,
        color: payload.color,
        days: payload.days,
        created_at: now,
        updated_at: now,
    };
    state.lock_store()?.insert_routine(&routine)?;
    info!(event = "routine_created", uid = %uid, routine_id = %routine.id);

    Ok((StatusCode::CREATED, Json(routine)))
}

async fn list_routines(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Routine>>, ApiError> {
    let uid = state.authenticate(&headers).await?;
    let routines = state.lock_store()?.routines_for_owner(&uid)?;
    Ok(Json(routines))
}

async fn get_routine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(routine_id): Path<String>,
) -> Result<Json<Routine>, ApiError> {
    let uid = state.authenticate(&headers).await?;
    let routine = state
        .lock_store()?
        .routine(&uid, &routine_id)?
        .ok_or(ApiError::NotFound("Routine not found"))?;
    Ok(Json(routine))
}

async fn update_routine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(routine_id): Path<String>,
    Json(payload): Json<RoutineUpdate>,
) -> Result<Json<Routine>, ApiError> {
    let uid = state.authenticate(&headers).await?;
    payload.validate()?;

    let routine = state
        .lock_store()?
        .update_routine(&uid, &routine_id, &payload, Utc::now())?
        .ok_or(ApiError::NotFound("Routine not found"))?;
    info!(event = "routine_updated", uid = %uid, routine_id = %routine_id);
    Ok(Json(routine))
}

async fn delete_routine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(routine_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let uid = state.authenticate(&headers).await?;
    let deleted = state.lock_store()?.delete_routine(&uid, &routine_id)?;
    if !deleted {
        return Err(ApiError::NotFound("Routine not found"));
    }
    info!(event = "routine_deleted", uid = %uid, routine_id = %routine_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn create_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(routine_id): Path<String>,
    Json(payload): Json<ExecutionCreate>,
) -> Result<(StatusCode, Json<ExecutionRecord>), ApiError> {
    let uid = state.authenticate(&headers).await?;
    payload.validate()?;

    // The date key is fixed at write time from started_at (UTC).
    let date = uphill_core::derived_date(&payload.started_at)?;
    uphill_core::parse_timestamp(&payload.ended_at)?;

    let execution = {
        let store = state.lock_store()?;
        if !store.routine_exists(&uid, &routine_id)? {
            return Err(ApiError::NotFound("Routine not found"));
        }
        let execution = ExecutionRecord {
            id: new_id(),
            owner_id: uid.clone(),
            routine_id,
            routine_title: payload.routine_title,
            started_at: payload.started_at,
            ended_at: payload.ended_at,
            duration_seconds: payload.duration_seconds,
            date,
            created_at: Utc::now(),
        };
        store.insert_execution(&execution)?;
        execution
    };
    info!(
        event = "execution_created",
        uid = %uid,
        routine_id = %execution.routine_id,
        date = %execution.date,
        duration_seconds = execution.duration_seconds
    );

    Ok((StatusCode::CREATED, Json(execution)))
}

async fn daily_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DateQuery>,
) -> Result<Json<DailySummary>, ApiError> {
    let uid = state.authenticate(&headers).await?;
    let summary = aggregate(&*state.lock_store()?, &uid, &query.date)?;
    Ok(Json(summary))
}

async fn daily_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(date): Path<String>,
) -> Result<Json<DailyFeedbackResponse>, ApiError> {
    let uid = state.authenticate(&headers).await?;
    let summary = { aggregate(&*state.lock_store()?, &uid, &date)? };
    // Once the summary exists this endpoint cannot fail: model errors
    // are absorbed into the deterministic fallback.
    let feedback = state.feedback.generate(&summary).await;

    Ok(Json(DailyFeedbackResponse {
        date,
        summary,
        ai_feedback_short: feedback.short,
        ai_feedback_full: feedback.full,
        recommended_routines: feedback.recommendations,
    }))
}

async fn evaluate_routine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<EvaluationRequest>,
) -> Result<(StatusCode, Json<RoutineEvaluation>), ApiError> {
    state.authenticate(&headers).await?;
    let evaluation = state.evaluator.evaluate(&payload).await;
    state.lock_store()?.insert_evaluation(&evaluation)?;
    info!(event = "routine_evaluated", evaluation_id = %evaluation.id, score = evaluation.score);
    Ok((StatusCode::CREATED, Json(evaluation)))
}

async fn list_evaluations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<RoutineEvaluation>>, ApiError> {
    state.authenticate(&headers).await?;
    let evaluations = state.lock_store()?.evaluations()?;
    if evaluations.is_empty() {
        return Err(ApiError::NotFound("No evaluated routines"));
    }
    Ok(Json(evaluations))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(event = "invalid_origin", origin = %origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/auth/google", post(google_login))
        .route("/user/info", get(user_info))
        .route("/routines", post(create_routine).get(list_routines))
        .route("/routines/evaluate", post(evaluate_routine))
        .route("/routines/evaluations", get(list_evaluations))
        .route(
            "/routines/:routine_id",
            get(get_routine).put(update_routine).delete(delete_routine),
        )
        .route("/executions/:routine_id", post(create_execution))
        .route("/executions/daily", get(daily_summary))
        .route("/executions/daily/:date/feedback", get(daily_feedback))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let store = match RoutineStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "store_open_failed", error = %err, path = %config.db_path);
            return;
        }
    };

    let model = match OpenAiClient::from_env() {
        Ok(model) => model,
        Err(err) => {
            warn!(event = "model_client_unavailable", error = %err);
            None
        }
    };
    if model.is_none() {
        info!(event = "model_disabled", detail = "running on deterministic fallback only");
    }

    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        verifier: Arc::new(TokenVerifier::from_config(&config)),
        feedback: Arc::new(FeedbackGenerator::new(model.clone())),
        evaluator: Arc::new(RoutineEvaluator::new(model)),
    };

    let addr: SocketAddr = match config.addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let app = router(state, &config.allowed_origins);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "bind_failed", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(event = "server_start", addr = %config.addr, db = %config.db_path);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_signal");
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(event = "server_error", error = %err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(Mutex::new(
                RoutineStore::open_in_memory().expect("open db"),
            )),
            verifier: Arc::new(TokenVerifier::Insecure),
            feedback: Arc::new(FeedbackGenerator::new(None)),
            evaluator: Arc::new(RoutineEvaluator::new(None)),
        }
    }

    fn auth_headers(uid: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {uid}")).expect("header"),
        );
        headers
    }

    fn stretch_routine() -> RoutineCreate {
        RoutineCreate {
            title: "Stretch".to_string(),
            time_of_day: "07:00".to_string(),
            category: "health".to_string(),
            color: None,
            days: None,
        }
    }

    #[test]
    fn bearer_header_parsing_is_strict_but_case_insensitive() {
        assert!(bearer_token(&HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer a b"),
        );
        assert!(bearer_token(&headers).is_err());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("bearer tok-1"),
        );
        assert_eq!(bearer_token(&headers).expect("token"), "tok-1");
    }

    #[tokio::test]
    async fn requests_without_credentials_are_unauthenticated() {
        let state = test_state();
        let result = create_routine(
            State(state),
            HeaderMap::new(),
            Json(stretch_routine()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn routine_roundtrip_returns_identical_fields() {
        let state = test_state();
        let mut payload = stretch_routine();
        payload.color = Some("#FF5722".to_string());
        payload.days = Some(vec![1, 3, 5]);

        let (status, Json(created)) =
            create_routine(State(state.clone()), auth_headers("user-1"), Json(payload))
                .await
                .expect("create");
        assert_eq!(status, StatusCode::CREATED);

        let Json(fetched) = get_routine(
            State(state),
            auth_headers("user-1"),
            Path(created.id.clone()),
        )
        .await
        .expect("get");
        assert_eq!(fetched, created);
        assert_eq!(fetched.title, "Stretch");
        assert_eq!(fetched.time_of_day, "07:00");
        assert_eq!(fetched.category, "health");
        assert_eq!(fetched.color.as_deref(), Some("#FF5722"));
        assert_eq!(fetched.days, Some(vec![1, 3, 5]));
    }

    #[tokio::test]
    async fn malformed_time_of_day_is_rejected() {
        let state = test_state();
        for time in ["7:00", "24:00", "12:60", "+9:05", "09:+5", "noon"] {
            let mut payload = stretch_routine();
            payload.time_of_day = time.to_string();
            let result =
                create_routine(State(state.clone()), auth_headers("user-1"), Json(payload)).await;
            assert!(matches!(result, Err(ApiError::Validation(_))), "time = {time}");
        }
    }

    #[tokio::test]
    async fn routines_are_isolated_between_users() {
        let state = test_state();
        let (_, Json(created)) = create_routine(
            State(state.clone()),
            auth_headers("user-1"),
            Json(stretch_routine()),
        )
        .await
        .expect("create");

        let result = get_routine(
            State(state.clone()),
            auth_headers("user-2"),
            Path(created.id.clone()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));

        let Json(theirs) = list_routines(State(state), auth_headers("user-2"))
            .await
            .expect("list");
        assert!(theirs.is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_routines() {
        let state = test_state();
        let update = update_routine(
            State(state.clone()),
            auth_headers("user-1"),
            Path("missing".to_string()),
            Json(RoutineUpdate::default()),
        )
        .await;
        assert!(matches!(update, Err(ApiError::NotFound(_))));

        let delete = delete_routine(
            State(state),
            auth_headers("user-1"),
            Path("missing".to_string()),
        )
        .await;
        assert!(matches!(delete, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_returns_no_content_and_removes_the_routine() {
        let state = test_state();
        let (_, Json(created)) = create_routine(
            State(state.clone()),
            auth_headers("user-1"),
            Json(stretch_routine()),
        )
        .await
        .expect("create");

        let status = delete_routine(
            State(state.clone()),
            auth_headers("user-1"),
            Path(created.id.clone()),
        )
        .await
        .expect("delete");
        assert_eq!(status, StatusCode::NO_CONTENT);

        let result = get_routine(State(state), auth_headers("user-1"), Path(created.id)).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn executions_require_an_existing_routine_and_valid_timestamps() {
        let state = test_state();
        let payload = ExecutionCreate {
            routine_title: "Stretch".to_string(),
            started_at: "2026-01-15T07:00:00Z".to_string(),
            ended_at: "2026-01-15T07:05:00Z".to_string(),
            duration_seconds: 300,
        };

        let missing = create_execution(
            State(state.clone()),
            auth_headers("user-1"),
            Path("missing".to_string()),
            Json(payload.clone()),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));

        let (_, Json(routine)) = create_routine(
            State(state.clone()),
            auth_headers("user-1"),
            Json(stretch_routine()),
        )
        .await
        .expect("create routine");

        let mut bad = payload.clone();
        bad.started_at = "yesterday morning".to_string();
        let invalid = create_execution(
            State(state.clone()),
            auth_headers("user-1"),
            Path(routine.id.clone()),
            Json(bad),
        )
        .await;
        assert!(matches!(invalid, Err(ApiError::Validation(_))));

        let mut oversized = payload;
        oversized.duration_seconds = u64::MAX;
        let invalid = create_execution(
            State(state),
            auth_headers("user-1"),
            Path(routine.id),
            Json(oversized),
        )
        .await;
        assert!(matches!(invalid, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn daily_summary_rejects_malformed_dates() {
        let state = test_state();
        let result = daily_summary(
            State(state),
            auth_headers("user-1"),
            Query(DateQuery {
                date: "2026-1-15".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    // The end-to-end scenario: create a routine, log one execution, read
    // the daily summary, then fetch feedback with no model configured.
    #[tokio::test]
    async fn daily_pipeline_from_creation_to_fallback_feedback() {
        let state = test_state();
        let (_, Json(routine)) = create_routine(
            State(state.clone()),
            auth_headers("user-1"),
            Json(stretch_routine()),
        )
        .await
        .expect("create routine");

        let (status, Json(execution)) = create_execution(
            State(state.clone()),
            auth_headers("user-1"),
            Path(routine.id.clone()),
            Json(ExecutionCreate {
                routine_title: "Stretch".to_string(),
                started_at: "2026-01-15T07:00:00Z".to_string(),
                ended_at: "2026-01-15T07:05:00Z".to_string(),
                duration_seconds: 300,
            }),
        )
        .await
        .expect("create execution");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(execution.date, "2026-01-15");

        let Json(summary) = daily_summary(
            State(state.clone()),
            auth_headers("user-1"),
            Query(DateQuery {
                date: "2026-01-15".to_string(),
            }),
        )
        .await
        .expect("summary");
        assert_eq!(summary.total_routines, 1);
        assert_eq!(summary.total_duration_seconds, 300);

        let Json(feedback) = daily_feedback(
            State(state),
            auth_headers("user-1"),
            Path("2026-01-15".to_string()),
        )
        .await
        .expect("feedback");
        assert_eq!(feedback.summary.total_routines, 1);
        assert!(feedback.ai_feedback_short.contains("Stretch"));
        assert!(feedback.ai_feedback_full.contains("5 minutes"));
        assert!(!feedback.recommended_routines.is_empty());
    }

    #[tokio::test]
    async fn feedback_for_an_empty_day_still_succeeds() {
        let state = test_state();
        let Json(feedback) = daily_feedback(
            State(state),
            auth_headers("user-1"),
            Path("2026-01-15".to_string()),
        )
        .await
        .expect("feedback");
        assert_eq!(feedback.summary.total_routines, 0);
        assert!(!feedback.ai_feedback_short.is_empty());
        assert_eq!(feedback.recommended_routines.len(), 3);
    }

    #[tokio::test]
    async fn evaluations_are_persisted_and_listed() {
        let state = test_state();
        let empty = list_evaluations(State(state.clone()), auth_headers("user-1")).await;
        assert!(matches!(empty, Err(ApiError::NotFound(_))));

        let (status, Json(evaluation)) = evaluate_routine(
            State(state.clone()),
            auth_headers("user-1"),
            Json(EvaluationRequest {
                name: "Morning reset".to_string(),
                goal: "Start the day calm".to_string(),
                steps: vec!["Stretch".to_string()],
            }),
        )
        .await
        .expect("evaluate");
        assert_eq!(status, StatusCode::CREATED);
        assert!((1..=5).contains(&evaluation.score));

        let Json(evaluations) = list_evaluations(State(state), auth_headers("user-1"))
            .await
            .expect("list");
        assert_eq!(evaluations.len(), 1);
        assert_eq!(evaluations[0].name, "Morning reset");
    }

    #[tokio::test]
    async fn insecure_login_upserts_a_queryable_user() {
        let state = test_state();
        let Json(login) = google_login(
            State(state.clone()),
            Json(GoogleLoginRequest {
                id_token: "user-1".to_string(),
            }),
        )
        .await
        .expect("login");
        assert_eq!(login.uid, "user-1");
        assert_eq!(login.session_token, "user-1");

        let Json(user) = user_info(
            State(state.clone()),
            Query(UserInfoQuery {
                uid: "user-1".to_string(),
            }),
        )
        .await
        .expect("user info");
        assert_eq!(user.uid, "user-1");

        let missing = user_info(
            State(state),
            Query(UserInfoQuery {
                uid: "nobody".to_string(),
            }),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn empty_tokens_are_rejected() {
        let verifier = TokenVerifier::Insecure;
        assert!(matches!(
            verifier.verify("   ").await,
            Err(ApiError::Unauthenticated(_))
        ));
    }

    #[test]
    fn api_errors_map_to_the_documented_status_codes() {
        assert_eq!(
            ApiError::Unauthenticated("x".to_string()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Validation("x".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Dependency("x".to_string()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
