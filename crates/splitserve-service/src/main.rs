use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::json;
use splitserve_core::{
    analysis_summary_to_json, analyze_events, assign_by_coin, assign_variant, AnalysisPolicy,
    AssignmentMode, ExperimentError, PredictionEventInput, Scorer, ScorerPair,
};
use splitserve_store_sqlite::SqliteEventStore;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const MODEL_SET_VERSION: &str = "model_set.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
    scorers: Option<ScorerPair>,
    assignment_mode: AssignmentMode,
    analysis_policy: AnalysisPolicy,
    score_timeout: Duration,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
    logger: EventLogger,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct PredictRequest {
    #[serde(default)]
    identity: Option<String>,
    features: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    service_contract_version: &'static str,
    status: &'static str,
    assignment_mode: &'static str,
    model_loaded: bool,
    score_timeout_ms: u64,
    operation_timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessChecks {
    schema_version: i64,
    model_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    feature_arity: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    model_not_ready_total: AtomicU64,
    inference_timeout_total: AtomicU64,
    inference_failed_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
    events_scheduled_total: AtomicU64,
    events_logged_total: AtomicU64,
    events_dropped_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    model_not_ready_total: u64,
    inference_timeout_total: u64,
    inference_failed_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
    events_scheduled_total: u64,
    events_logged_total: u64,
    events_dropped_total: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ModelKind {
    Linear,
    Logistic,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelSpec {
    kind: ModelKind,
    weights: Vec<f64>,
    bias: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelSetFile {
    model_set_version: String,
    feature_arity: usize,
    variant_a: ModelSpec,
    variant_b: ModelSpec,
}

#[derive(Debug, Clone)]
struct WeightedModel {
    kind: ModelKind,
    weights: Vec<f64>,
    bias: f64,
}

impl Scorer for WeightedModel {
    fn feature_arity(&self) -> usize {
        self.weights.len()
    }

    fn score(&self, features: &[f64]) -> std::result::Result<f64, ExperimentError> {
        if features.len() != self.weights.len() {
            return Err(ExperimentError::Inference(format!(
                "feature arity mismatch: expected {}, got {}",
                self.weights.len(),
                features.len()
            )));
        }

        let activation: f64 =
            self.weights.iter().zip(features).map(|(weight, value)| weight * value).sum::<f64>()
                + self.bias;
        let prediction = match self.kind {
            ModelKind::Linear => activation,
            ModelKind::Logistic => 1.0 / (1.0 + (-activation).exp()),
        };

        if prediction.is_finite() {
            Ok(prediction)
        } else {
            Err(ExperimentError::Inference(
                "model produced a non-finite prediction".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AssignmentModeArg {
    Sticky,
    Random,
}

impl From<AssignmentModeArg> for AssignmentMode {
    fn from(value: AssignmentModeArg) -> Self {
        match value {
            AssignmentModeArg::Sticky => Self::Sticky,
            AssignmentModeArg::Random => Self::UniformRandom,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "splitserve-service")]
#[command(about = "Local HTTP service for A/B prediction serving")]
struct Args {
    #[arg(long, default_value = "./splitserve.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Model set file; without it the service starts but answers 503.
    #[arg(long)]
    models: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = AssignmentModeArg::Sticky)]
    assignment_mode: AssignmentModeArg,
    #[arg(long, default_value_t = 1000)]
    score_timeout_ms: u64,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn classify_service_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let diagnostic = format!("{err:#}");
        let normalized = diagnostic.to_ascii_lowercase();

        if normalized.contains("validation error")
            || normalized.contains("rejected by validation")
            || normalized.contains("must be")
            || normalized.contains("must contain")
        {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }

        if normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("schema")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        timeout: Duration,
        default_status: StatusCode,
        default_code: &'static str,
        timeout_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> std::result::Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::task::spawn_blocking(op);
        let join_result = tokio::time::timeout(timeout, handle).await.map_err(|_| {
            self.telemetry.record_failure(timeout_code, true);
            Self::failure(
                default_status,
                timeout_code,
                format!("{operation_label} timed out after {} ms", timeout.as_millis()),
                Some(json!({ "timeout_ms": timeout.as_millis() })),
            )
        })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_service_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "model_not_ready" => {
                self.model_not_ready_total.fetch_add(1, Ordering::Relaxed);
            }
            "inference_timeout" => {
                self.inference_timeout_total.fetch_add(1, Ordering::Relaxed);
            }
            "inference_failed" => {
                self.inference_failed_total.fetch_add(1, Ordering::Relaxed);
            }
            "store_unavailable" => {
                self.store_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            model_not_ready_total: self.model_not_ready_total.load(Ordering::Relaxed),
            inference_timeout_total: self.inference_timeout_total.load(Ordering::Relaxed),
            inference_failed_total: self.inference_failed_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
            events_scheduled_total: self.events_scheduled_total.load(Ordering::Relaxed),
            events_logged_total: self.events_logged_total.load(Ordering::Relaxed),
            events_dropped_total: self.events_dropped_total.load(Ordering::Relaxed),
        }
    }
}

/// Deferred event log writer. Prediction responses never wait on the store;
/// appends happen on a dedicated blocking task fed by an unbounded channel.
/// A failed append is counted and logged, never retried.
#[derive(Debug, Clone)]
struct EventLogger {
    tx: tokio::sync::mpsc::UnboundedSender<PredictionEventInput>,
    telemetry: Arc<ServiceTelemetry>,
}

impl EventLogger {
    fn spawn(db_path: PathBuf, telemetry: Arc<ServiceTelemetry>) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PredictionEventInput>();
        let writer_telemetry = Arc::clone(&telemetry);
        tokio::task::spawn_blocking(move || {
            let mut store: Option<SqliteEventStore> = None;
            while let Some(input) = rx.blocking_recv() {
                if store.is_none() {
                    match SqliteEventStore::open(&db_path) {
                        Ok(opened) => store = Some(opened),
                        Err(err) => {
                            writer_telemetry.events_dropped_total.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(
                                request_id = %input.request_id,
                                error = %format!("{err:#}"),
                                "event store unavailable; dropping prediction event"
                            );
                            continue;
                        }
                    }
                }
                if let Some(open) = store.as_mut() {
                    match open.append_event(&input) {
                        Ok(_) => {
                            writer_telemetry.events_logged_total.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            writer_telemetry.events_dropped_total.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(
                                request_id = %input.request_id,
                                error = %format!("{err:#}"),
                                "failed to append prediction event"
                            );
                        }
                    }
                }
            }
        });
        Self { tx, telemetry }
    }

    fn schedule(&self, input: PredictionEventInput) {
        if let Err(err) = self.tx.send(input) {
            self.telemetry.events_dropped_total.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %err, "event log writer is gone; dropping prediction event");
            return;
        }
        self.telemetry.events_scheduled_total.fetch_add(1, Ordering::Relaxed);
    }
}

fn load_model_set(path: &Path) -> Result<ScorerPair> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model set file at {}", path.display()))?;
    let file: ModelSetFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse model set file at {}", path.display()))?;

    if file.model_set_version != MODEL_SET_VERSION {
        bail!(
            "unsupported model set version {:?}; this build serves {MODEL_SET_VERSION}",
            file.model_set_version
        );
    }
    if file.feature_arity == 0 {
        bail!("model set declares feature_arity 0");
    }
    for (label, spec) in [("variant_a", &file.variant_a), ("variant_b", &file.variant_b)] {
        if spec.weights.len() != file.feature_arity {
            bail!(
                "{label} declares {} weights but the model set feature_arity is {}",
                spec.weights.len(),
                file.feature_arity
            );
        }
        if !spec.bias.is_finite() || spec.weights.iter().any(|weight| !weight.is_finite()) {
            bail!("{label} carries non-finite parameters");
        }
    }

    let variant_a = WeightedModel {
        kind: file.variant_a.kind,
        weights: file.variant_a.weights,
        bias: file.variant_a.bias,
    };
    let variant_b = WeightedModel {
        kind: file.variant_b.kind,
        weights: file.variant_b.weights,
        bias: file.variant_b.bias,
    };
    ScorerPair::new(Arc::new(variant_a), Arc::new(variant_b)).map_err(anyhow::Error::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/analysis", get(analysis))
        .route("/v1/predict", post(predict))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let store = SqliteEventStore::open(&args.db)
        .with_context(|| format!("failed to open event store at {}", args.db.display()))?;
    let schema_version = store.schema_version()?;
    drop(store);
    tracing::info!(db = %args.db.display(), schema_version, "event store ready");

    let scorers = match args.models.as_deref() {
        Some(path) => match load_model_set(path) {
            Ok(pair) => {
                tracing::info!(
                    path = %path.display(),
                    feature_arity = pair.feature_arity(),
                    "model set loaded"
                );
                Some(pair)
            }
            Err(err) => {
                tracing::error!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "model set failed to load; /v1/predict will answer model_not_ready"
                );
                None
            }
        },
        None => {
            tracing::warn!("no --models path given; /v1/predict will answer model_not_ready");
            None
        }
    };

    let telemetry = Arc::new(ServiceTelemetry::default());
    let logger = EventLogger::spawn(args.db.clone(), Arc::clone(&telemetry));
    let state = ServiceState {
        db_path: args.db,
        scorers,
        assignment_mode: args.assignment_mode.into(),
        analysis_policy: AnalysisPolicy::default(),
        score_timeout: Duration::from_millis(args.score_timeout_ms),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry,
        logger,
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, mode = state.assignment_mode.as_str(), "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let score_timeout_ms = u64::try_from(state.score_timeout.as_millis()).unwrap_or(u64::MAX);
    let operation_timeout_ms =
        u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        status: "ok",
        assignment_mode: state.assignment_mode.as_str(),
        model_loaded: state.scorers.is_some(),
        score_timeout_ms,
        operation_timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn ready(
    State(state): State<ServiceState>,
) -> std::result::Result<Json<ReadinessResponse>, ServiceFailure> {
    let db_path = state.db_path.clone();
    let schema_version = state
        .run_blocking(
            state.operation_timeout,
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "store_unavailable",
            "readiness_check",
            move || {
                let store = SqliteEventStore::open(&db_path)?;
                store.schema_version()
            },
        )
        .await?;

    let checks = ReadinessChecks {
        schema_version,
        model_loaded: state.scorers.is_some(),
        feature_arity: state.scorers.as_ref().map(ScorerPair::feature_arity),
    };

    if checks.model_loaded {
        return Ok(Json(ReadinessResponse { status: "ready", checks }));
    }

    state.telemetry.record_failure("model_not_ready", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "model_not_ready",
        "model set is not loaded; restart with --models pointing at a valid model set file",
        Some(json!({ "schema_version": schema_version, "model_loaded": false })),
    ))
}

async fn analysis(
    State(state): State<ServiceState>,
) -> std::result::Result<Json<serde_json::Value>, ServiceFailure> {
    let db_path = state.db_path.clone();
    let policy = state.analysis_policy;
    let summary = state
        .run_blocking(
            state.operation_timeout,
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "store_unavailable",
            "analysis",
            move || {
                let store = SqliteEventStore::open(&db_path)?;
                let events = store.list_events()?;
                analyze_events(&events, &policy).map_err(anyhow::Error::from)
            },
        )
        .await?;

    let value = analysis_summary_to_json(&summary).map_err(|err| {
        state.telemetry.record_failure("internal_error", false);
        ServiceState::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
            None,
        )
    })?;
    Ok(Json(value))
}

async fn predict(
    State(state): State<ServiceState>,
    payload: std::result::Result<Json<PredictRequest>, JsonRejection>,
) -> std::result::Result<Json<serde_json::Value>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let Some(pair) = state.scorers.clone() else {
        state.telemetry.record_failure("model_not_ready", false);
        return Err(ServiceState::failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "model_not_ready",
            "model set is not loaded; restart with --models pointing at a valid model set file",
            None,
        ));
    };

    if request.features.len() != pair.feature_arity() {
        state.telemetry.record_failure("validation_error", false);
        return Err(ServiceState::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!(
                "feature vector arity mismatch: expected {}, got {}",
                pair.feature_arity(),
                request.features.len()
            ),
            Some(json!({
                "expected": pair.feature_arity(),
                "actual": request.features.len(),
            })),
        ));
    }

    let request_id = Ulid::new();
    let variant = match state.assignment_mode {
        AssignmentMode::Sticky => {
            let identity = request.identity.as_deref().map(str::trim).unwrap_or("");
            if identity.is_empty() {
                assign_by_coin(request_id)
            } else {
                assign_variant(identity).map_err(|err| {
                    state.telemetry.record_failure("validation_error", false);
                    ServiceState::failure(
                        StatusCode::BAD_REQUEST,
                        "validation_error",
                        err.to_string(),
                        None,
                    )
                })?
            }
        }
        AssignmentMode::UniformRandom => assign_by_coin(request_id),
    };

    let scorer = pair.scorer(variant);
    let features = request.features.clone();
    let started = Instant::now();
    let prediction = state
        .run_blocking(
            state.score_timeout,
            StatusCode::INTERNAL_SERVER_ERROR,
            "inference_failed",
            "inference_timeout",
            "score",
            move || scorer.score(&features).map_err(anyhow::Error::from),
        )
        .await?;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    if !prediction.is_finite() {
        state.telemetry.record_failure("inference_failed", false);
        return Err(ServiceState::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "inference_failed",
            "scorer produced a non-finite prediction",
            None,
        ));
    }

    state.logger.schedule(PredictionEventInput {
        request_id,
        variant,
        input_features: request.features,
        prediction,
        latency_ms,
    });

    Ok(Json(json!({
        "request_id": request_id.to_string(),
        "variant": variant.as_str(),
        "prediction": prediction,
        "latency_ms": latency_ms,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use splitserve_core::VariantLabel;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("splitserve-service-{}.sqlite3", Ulid::new()))
    }

    fn test_state(db_path: &Path, scorers: Option<ScorerPair>, score_timeout_ms: u64) -> ServiceState {
        let telemetry = Arc::new(ServiceTelemetry::default());
        ServiceState {
            db_path: db_path.to_path_buf(),
            scorers,
            assignment_mode: AssignmentMode::Sticky,
            analysis_policy: AnalysisPolicy::default(),
            score_timeout: Duration::from_millis(score_timeout_ms),
            operation_timeout: Duration::from_millis(2500),
            logger: EventLogger::spawn(db_path.to_path_buf(), Arc::clone(&telemetry)),
            telemetry,
        }
    }

    fn shared_linear_pair() -> ScorerPair {
        let model =
            WeightedModel { kind: ModelKind::Linear, weights: vec![0.1, 0.2, 0.3], bias: 0.0 };
        match ScorerPair::new(Arc::new(model.clone()), Arc::new(model)) {
            Ok(pair) => pair,
            Err(err) => panic!("failed to build scorer pair: {err}"),
        }
    }

    fn slow_pair(delay: Duration) -> ScorerPair {
        let model = SleepyScorer { arity: 3, delay };
        let other = SleepyScorer { arity: 3, delay };
        match ScorerPair::new(Arc::new(model), Arc::new(other)) {
            Ok(pair) => pair,
            Err(err) => panic!("failed to build slow scorer pair: {err}"),
        }
    }

    fn failing_pair() -> ScorerPair {
        match ScorerPair::new(
            Arc::new(FailingScorer { arity: 3 }),
            Arc::new(FailingScorer { arity: 3 }),
        ) {
            Ok(pair) => pair,
            Err(err) => panic!("failed to build failing scorer pair: {err}"),
        }
    }

    #[derive(Debug)]
    struct SleepyScorer {
        arity: usize,
        delay: Duration,
    }

    impl Scorer for SleepyScorer {
        fn feature_arity(&self) -> usize {
            self.arity
        }

        fn score(&self, _features: &[f64]) -> std::result::Result<f64, ExperimentError> {
            std::thread::sleep(self.delay);
            Ok(0.5)
        }
    }

    #[derive(Debug)]
    struct FailingScorer {
        arity: usize,
    }

    impl Scorer for FailingScorer {
        fn feature_arity(&self) -> usize {
            self.arity
        }

        fn score(&self, _features: &[f64]) -> std::result::Result<f64, ExperimentError> {
            Err(ExperimentError::Inference("synthetic scorer failure".to_string()))
        }
    }

    async fn get_response(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn post_json(router: Router, uri: &str, body: String) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn error_code(value: &serde_json::Value) -> Option<&str> {
        value.get("error").and_then(|error| error.get("code")).and_then(serde_json::Value::as_str)
    }

    async fn wait_for_event(db_path: &Path, request_id: Ulid) -> splitserve_core::PredictionEvent {
        for _ in 0..200 {
            if let Ok(store) = SqliteEventStore::open(db_path) {
                match store.find_event_by_request_id(request_id) {
                    Ok(Some(event)) => return event,
                    Ok(None) => {}
                    Err(err) => panic!("event lookup failed: {err:#}"),
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("prediction event {request_id} never reached the store");
    }

    // Test IDs: TSRV-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path, Some(shared_linear_pair()), 1000));

        let response = get_response(router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.get("status").and_then(serde_json::Value::as_str), Some("ok"));
        assert_eq!(
            value.get("assignment_mode").and_then(serde_json::Value::as_str),
            Some("sticky")
        );
        assert_eq!(value.get("model_loaded").and_then(serde_json::Value::as_bool), Some(true));
        assert!(value.get("telemetry").is_some());

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-002
    #[tokio::test]
    async fn predict_serves_prediction_and_logs_event_asynchronously() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path, Some(shared_linear_pair()), 1000));

        let body = json!({"identity": "caller-42", "features": [1.0, 2.0, 3.0]}).to_string();
        let response = post_json(router, "/v1/predict", body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let request_id_text = value
            .get("request_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing request_id in response: {value}"))
            .to_string();
        let request_id = match Ulid::from_string(&request_id_text) {
            Ok(id) => id,
            Err(err) => panic!("request_id is not a ulid: {err}"),
        };

        let prediction = value
            .get("prediction")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or_else(|| panic!("missing prediction in response: {value}"));
        assert!((prediction - 1.4).abs() < 1e-9, "prediction={prediction}");

        let latency_ms = value
            .get("latency_ms")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or_else(|| panic!("missing latency_ms in response: {value}"));
        assert!(latency_ms >= 0.0);

        let variant_text = value
            .get("variant")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing variant in response: {value}"))
            .to_string();

        let event = wait_for_event(&db_path, request_id).await;
        assert_eq!(event.variant.as_str(), variant_text);
        assert_eq!(event.input_features, vec![1.0, 2.0, 3.0]);
        assert!((event.prediction - prediction).abs() < 1e-12);
        assert!((event.latency_ms - latency_ms).abs() < 1e-12);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-003
    #[tokio::test]
    async fn predict_assignment_is_sticky_per_identity() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path, Some(shared_linear_pair()), 1000));

        let expected = match assign_variant("caller-42") {
            Ok(variant) => variant.as_str().to_string(),
            Err(err) => panic!("assignment failed: {err}"),
        };

        for _ in 0..2 {
            let body = json!({"identity": "caller-42", "features": [1.0, 2.0, 3.0]}).to_string();
            let response = post_json(router.clone(), "/v1/predict", body).await;
            assert_eq!(response.status(), StatusCode::OK);
            let value = response_json(response).await;
            assert_eq!(
                value.get("variant").and_then(serde_json::Value::as_str),
                Some(expected.as_str())
            );
        }

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-004
    #[tokio::test]
    async fn predict_without_identity_still_assigns_a_variant() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path, Some(shared_linear_pair()), 1000));

        let body = json!({"identity": "   ", "features": [1.0, 2.0, 3.0]}).to_string();
        let blank_response = post_json(router.clone(), "/v1/predict", body).await;
        assert_eq!(blank_response.status(), StatusCode::OK);
        let blank_value = response_json(blank_response).await;
        let variant = blank_value.get("variant").and_then(serde_json::Value::as_str);
        assert!(variant == Some("A") || variant == Some("B"), "variant={variant:?}");

        let body = json!({"features": [1.0, 2.0, 3.0]}).to_string();
        let missing_response = post_json(router, "/v1/predict", body).await;
        assert_eq!(missing_response.status(), StatusCode::OK);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-005
    #[tokio::test]
    async fn predict_rejects_arity_mismatch_without_logging() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path, Some(shared_linear_pair()), 1000);
        let telemetry = Arc::clone(&state.telemetry);
        let router = app(state);

        let body = json!({"identity": "caller-42", "features": [1.0]}).to_string();
        let response = post_json(router, "/v1/predict", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("validation_error"));
        assert_eq!(
            value
                .get("error")
                .and_then(|error| error.get("details"))
                .and_then(|details| details.get("expected"))
                .and_then(serde_json::Value::as_u64),
            Some(3)
        );
        assert_eq!(telemetry.snapshot().validation_error_total, 1);

        let store = match SqliteEventStore::open(&db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open store: {err:#}"),
        };
        match store.count_events() {
            Ok(count) => assert_eq!(count, 0),
            Err(err) => panic!("failed to count events: {err:#}"),
        }

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-006
    #[tokio::test]
    async fn predict_rejects_malformed_json() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path, Some(shared_linear_pair()), 1000);
        let telemetry = Arc::clone(&state.telemetry);
        let router = app(state);

        let response = post_json(router, "/v1/predict", "{not-json".to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("invalid_json"));
        assert_eq!(telemetry.snapshot().invalid_json_total, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-007
    #[tokio::test]
    async fn predict_without_models_answers_model_not_ready() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path, None, 1000));

        let body = json!({"identity": "caller-42", "features": [1.0, 2.0, 3.0]}).to_string();
        let response = post_json(router, "/v1/predict", body).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("model_not_ready"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-008
    #[tokio::test]
    async fn predict_times_out_slow_scorer_without_logging() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path, Some(slow_pair(Duration::from_millis(25))), 1);
        let telemetry = Arc::clone(&state.telemetry);
        let router = app(state);

        let body = json!({"identity": "caller-42", "features": [1.0, 2.0, 3.0]}).to_string();
        let response = post_json(router, "/v1/predict", body).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("inference_timeout"));
        assert!(
            value
                .get("error")
                .and_then(|error| error.get("details"))
                .and_then(|details| details.get("timeout_ms"))
                .is_some(),
            "timeout details missing: {value}"
        );
        assert_eq!(telemetry.snapshot().timeout_total, 1);

        let store = match SqliteEventStore::open(&db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open store: {err:#}"),
        };
        match store.count_events() {
            Ok(count) => assert_eq!(count, 0),
            Err(err) => panic!("failed to count events: {err:#}"),
        }

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-009
    #[tokio::test]
    async fn predict_maps_scorer_failure_to_inference_failed() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path, Some(failing_pair()), 1000);
        let telemetry = Arc::clone(&state.telemetry);
        let router = app(state);

        let body = json!({"identity": "caller-42", "features": [1.0, 2.0, 3.0]}).to_string();
        let response = post_json(router, "/v1/predict", body).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("inference_failed"));
        assert_eq!(telemetry.snapshot().inference_failed_total, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-010
    #[tokio::test]
    async fn ready_reports_ready_with_models_and_store() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path, Some(shared_linear_pair()), 1000));

        let response = get_response(router, "/v1/ready").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(serde_json::Value::as_str), Some("ready"));
        assert_eq!(
            value
                .get("checks")
                .and_then(|checks| checks.get("schema_version"))
                .and_then(serde_json::Value::as_i64),
            Some(1)
        );
        assert_eq!(
            value
                .get("checks")
                .and_then(|checks| checks.get("feature_arity"))
                .and_then(serde_json::Value::as_u64),
            Some(3)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-011
    #[tokio::test]
    async fn ready_answers_model_not_ready_without_models() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path, None, 1000));

        let response = get_response(router, "/v1/ready").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("model_not_ready"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-012
    #[tokio::test]
    async fn ready_answers_store_unavailable_when_db_is_unreachable() {
        let db_path = std::env::temp_dir()
            .join(format!("splitserve-missing-parent-{}/db.sqlite3", Ulid::new()));
        let router = app(test_state(&db_path, Some(shared_linear_pair()), 1000));

        let response = get_response(router, "/v1/ready").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("store_unavailable"));
    }

    // Test IDs: TSRV-013
    #[tokio::test]
    async fn analysis_endpoint_reports_the_current_snapshot() {
        let db_path = unique_temp_db_path();
        {
            let mut store = match SqliteEventStore::open(&db_path) {
                Ok(store) => store,
                Err(err) => panic!("failed to open store: {err:#}"),
            };
            for (variant, latency_ms) in [
                (VariantLabel::A, 10.0),
                (VariantLabel::A, 12.0),
                (VariantLabel::A, 11.0),
                (VariantLabel::B, 50.0),
                (VariantLabel::B, 52.0),
                (VariantLabel::B, 51.0),
            ] {
                let input = PredictionEventInput {
                    request_id: Ulid::new(),
                    variant,
                    input_features: vec![1.0, 2.0, 3.0],
                    prediction: 0.5,
                    latency_ms,
                };
                if let Err(err) = store.append_event(&input) {
                    panic!("failed to seed event: {err:#}");
                }
            }
        }

        let router = app(test_state(&db_path, None, 1000));
        let response = get_response(router, "/v1/analysis").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("artifact_version").and_then(serde_json::Value::as_str),
            Some("analysis_summary.v1")
        );
        assert_eq!(
            value
                .get("groups")
                .and_then(|groups| groups.get("A"))
                .and_then(|group| group.get("request_count"))
                .and_then(serde_json::Value::as_u64),
            Some(3)
        );
        assert_eq!(
            value
                .get("latency_comparison")
                .and_then(|comparison| comparison.get("winner"))
                .and_then(serde_json::Value::as_str),
            Some("A")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-014
    #[tokio::test]
    async fn uniform_random_mode_ignores_identity_for_assignment() {
        let db_path = unique_temp_db_path();
        let mut state = test_state(&db_path, Some(shared_linear_pair()), 1000);
        state.assignment_mode = AssignmentMode::UniformRandom;
        let router = app(state);

        let body = json!({"identity": "caller-42", "features": [1.0, 2.0, 3.0]}).to_string();
        let response = post_json(router, "/v1/predict", body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let variant = value.get("variant").and_then(serde_json::Value::as_str);
        assert!(variant == Some("A") || variant == Some("B"), "variant={variant:?}");

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-015
    #[tokio::test]
    async fn run_blocking_times_out_with_mapped_error_status() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path, None, 1000);

        let result = state
            .run_blocking(
                Duration::from_millis(1),
                StatusCode::INTERNAL_SERVER_ERROR,
                "inference_failed",
                "inference_timeout",
                "unit_timeout_operation",
                || {
                    std::thread::sleep(Duration::from_millis(25));
                    Ok::<_, anyhow::Error>(())
                },
            )
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(err.code, "inference_timeout");
                assert!(
                    err.message.contains("timed out"),
                    "timeout error message must mention timeout: {}",
                    err.message
                );
                assert!(err.details.is_some(), "timeout error should include details");
            }
        }

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-016
    #[tokio::test]
    async fn telemetry_counters_track_success_failure_and_timeout() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path, None, 1000);

        let success = state
            .run_blocking(
                Duration::from_millis(2500),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal_error",
                "telemetry_success",
                || Ok::<_, anyhow::Error>(1_u32),
            )
            .await;
        assert!(success.is_ok(), "expected success path for telemetry test");

        let timeout = state
            .run_blocking(
                Duration::from_millis(1),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal_error",
                "telemetry_timeout",
                || {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok::<_, anyhow::Error>(0_u32)
                },
            )
            .await;
        assert!(timeout.is_err(), "expected timeout path for telemetry test");

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success_total, 1);
        assert_eq!(snapshot.requests_failure_total, 1);
        assert_eq!(snapshot.timeout_total, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSRV-017
    #[test]
    fn model_set_loader_rejects_bad_files() {
        let dir = std::env::temp_dir().join(format!("splitserve-models-{}", Ulid::new()));
        if let Err(err) = std::fs::create_dir_all(&dir) {
            panic!("failed to create temp dir: {err}");
        }

        let good = dir.join("good.json");
        let good_payload = json!({
            "model_set_version": "model_set.v1",
            "feature_arity": 2,
            "variant_a": {"kind": "linear", "weights": [0.5, 0.5], "bias": 0.0},
            "variant_b": {"kind": "logistic", "weights": [1.0, -1.0], "bias": 0.25},
        });
        if let Err(err) = std::fs::write(&good, good_payload.to_string()) {
            panic!("failed to write model set fixture: {err}");
        }
        match load_model_set(&good) {
            Ok(pair) => assert_eq!(pair.feature_arity(), 2),
            Err(err) => panic!("expected model set to load: {err:#}"),
        }

        let wrong_version = dir.join("wrong-version.json");
        let wrong_payload = json!({
            "model_set_version": "model_set.v9",
            "feature_arity": 2,
            "variant_a": {"kind": "linear", "weights": [0.5, 0.5], "bias": 0.0},
            "variant_b": {"kind": "linear", "weights": [0.5, 0.5], "bias": 0.0},
        });
        if let Err(err) = std::fs::write(&wrong_version, wrong_payload.to_string()) {
            panic!("failed to write model set fixture: {err}");
        }
        assert!(load_model_set(&wrong_version).is_err());

        let arity_mismatch = dir.join("arity.json");
        let arity_payload = json!({
            "model_set_version": "model_set.v1",
            "feature_arity": 2,
            "variant_a": {"kind": "linear", "weights": [0.5], "bias": 0.0},
            "variant_b": {"kind": "linear", "weights": [0.5, 0.5], "bias": 0.0},
        });
        if let Err(err) = std::fs::write(&arity_mismatch, arity_payload.to_string()) {
            panic!("failed to write model set fixture: {err}");
        }
        assert!(load_model_set(&arity_mismatch).is_err());

        // 1e999 does not fit in an f64.
        let non_finite = dir.join("non-finite.json");
        let non_finite_payload = concat!(
            "{\"model_set_version\": \"model_set.v1\", \"feature_arity\": 1,",
            " \"variant_a\": {\"kind\": \"linear\", \"weights\": [1e999], \"bias\": 0.0},",
            " \"variant_b\": {\"kind\": \"linear\", \"weights\": [0.5], \"bias\": 0.0}}"
        );
        if let Err(err) = std::fs::write(&non_finite, non_finite_payload) {
            panic!("failed to write model set fixture: {err}");
        }
        assert!(load_model_set(&non_finite).is_err());

        assert!(load_model_set(&dir.join("missing.json")).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    // Test IDs: TSRV-018
    #[test]
    fn weighted_model_scores_linear_and_logistic() {
        let linear =
            WeightedModel { kind: ModelKind::Linear, weights: vec![0.1, 0.2, 0.3], bias: 0.5 };
        match linear.score(&[1.0, 2.0, 3.0]) {
            Ok(value) => assert!((value - 1.9).abs() < 1e-12, "linear score={value}"),
            Err(err) => panic!("linear score failed: {err}"),
        }

        let logistic =
            WeightedModel { kind: ModelKind::Logistic, weights: vec![1.0, 1.0], bias: 0.0 };
        match logistic.score(&[0.0, 0.0]) {
            Ok(value) => assert!((value - 0.5).abs() < 1e-12, "logistic score={value}"),
            Err(err) => panic!("logistic score failed: {err}"),
        }

        assert!(linear.score(&[1.0]).is_err());
    }
}
