//! HTTP surface for ordercore.
//!
//! Three routes sit in front of an [`OrderCore`]:
//!
//! - `POST /api/orders` submits an order (202 created, 200 already existed)
//! - `GET /api/orders/{orderId}` returns the business status and totals
//! - `GET /api/orders/{orderId}/status` returns the orchestration instance status
//!
//! Money leaves this layer as JSON numbers. The stored documents keep exact
//! decimal strings.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use ordercore::{IntakeError, OrderCore, Violation};
use ordercore_types::{
    HistoryStore, InstanceStatus, OrderId, OrderStatus, OrderStatusView, OrderStore,
    RuntimeStatus, Totals, WorkQueue,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Variable naming the listen address.
pub const BIND_ADDR_VAR: &str = "ORDERCORE_BIND_ADDR";
/// Variable holding the PostgreSQL connection string.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// Process level settings of the server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Listen address (default `0.0.0.0:8080`).
    pub bind_addr: SocketAddr,
    /// PostgreSQL backend when set, in-memory backends otherwise.
    pub database_url: Option<String>,
}

impl ServerSettings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Fails if `ORDERCORE_BIND_ADDR` is set but not a socket address.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// See [`ServerSettings::from_env`].
    pub fn from_lookup<L>(lookup: L) -> anyhow::Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let bind_addr = match lookup(BIND_ADDR_VAR) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("{BIND_ADDR_VAR} is not a socket address: {raw}"))?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };
        let database_url = lookup(DATABASE_URL_VAR).filter(|url| !url.trim().is_empty());

        Ok(Self {
            bind_addr,
            database_url,
        })
    }
}

/// Body of a successful `POST /api/orders`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponse {
    /// Id of the submitted order.
    pub order_id: OrderId,
    /// Status of the stored order, `CREATED` for a fresh submission.
    pub order_status: OrderStatus,
}

/// Totals rendered as JSON numbers.
#[derive(Debug, Serialize)]
pub struct TotalsResponse {
    /// Sum of the priced lines.
    #[serde(with = "rust_decimal::serde::float")]
    pub subtotal: Decimal,
    /// Tax on the subtotal.
    #[serde(with = "rust_decimal::serde::float")]
    pub tax: Decimal,
    /// Discount granted on large orders.
    #[serde(with = "rust_decimal::serde::float")]
    pub discount: Decimal,
    /// `subtotal + tax - discount`.
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
}

impl From<Totals> for TotalsResponse {
    fn from(totals: Totals) -> Self {
        Self {
            subtotal: totals.subtotal,
            tax: totals.tax,
            discount: totals.discount,
            total: totals.total,
        }
    }
}

/// Business status. `totals` is `null` until the order is completed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusResponse {
    /// Id of the order.
    pub order_id: OrderId,
    /// Current lifecycle status.
    pub order_status: OrderStatus,
    /// Computed totals of a completed order.
    pub totals: Option<TotalsResponse>,
}

impl From<OrderStatusView> for OrderStatusResponse {
    fn from(view: OrderStatusView) -> Self {
        Self {
            order_id: view.order_id,
            order_status: view.order_status,
            totals: view.totals.map(TotalsResponse::from),
        }
    }
}

/// Runtime status of an orchestration instance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusResponse {
    /// Instance id, equal to the order id.
    pub instance_id: OrderId,
    /// `Running` or `Completed`.
    pub runtime_status: RuntimeStatus,
    /// When the instance was started.
    pub created_time: DateTime<Utc>,
    /// When the last history event was recorded.
    pub last_updated_time: DateTime<Utc>,
    /// Last recorded step of a running instance.
    pub current_step: Option<String>,
    /// Outcome summary of a finished instance.
    pub output: Option<String>,
}

impl From<InstanceStatus> for InstanceStatusResponse {
    fn from(status: InstanceStatus) -> Self {
        Self {
            instance_id: status.instance_id,
            runtime_status: status.runtime_status,
            created_time: status.created_time,
            last_updated_time: status.last_updated_time,
            current_step: status.current_step.map(|step| step.to_string()),
            output: status.output,
        }
    }
}

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human readable message.
    pub error: String,
    /// Field level problems of a rejected submission.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            violations: Vec::new(),
        }
    }
}

/// Failure of a request, mapped onto an HTTP status by [`IntoResponse`].
#[derive(Debug)]
pub enum ApiError {
    /// The path segment is not a valid order id.
    InvalidOrderId(String),
    /// No orchestration instance was ever started for the order.
    InstanceNotFound(OrderId),
    /// Intake rejected or failed the request.
    Intake(IntakeError),
}

impl From<IntakeError> for ApiError {
    fn from(error: IntakeError) -> Self {
        Self::Intake(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::InvalidOrderId(detail) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(format!("Invalid orderId: {detail}")),
            ),
            Self::InstanceNotFound(_) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("Orchestration instance not found"),
            ),
            Self::Intake(IntakeError::InvalidRequest(violations)) => {
                let error = violations.first().map_or_else(
                    || "Invalid order request".to_string(),
                    |violation| violation.message.clone(),
                );
                (StatusCode::BAD_REQUEST, ErrorResponse { error, violations })
            }
            Self::Intake(IntakeError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, ErrorResponse::new("Order not found"))
            }
            Self::Intake(error @ IntakeError::DispatchUnavailable { .. }) => {
                warn!(error = %error, "[api.unavailable] dispatch queue unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::new(error.to_string()),
                )
            }
            Self::Intake(error) => {
                error!(error = %error, "[api.internal_error] request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

fn parse_order_id(raw: String) -> Result<OrderId, ApiError> {
    OrderId::try_new(raw).map_err(|error| ApiError::InvalidOrderId(error.to_string()))
}

/// `POST /api/orders`: 202 for a new order, 200 if it already existed.
///
/// # Errors
///
/// [`ApiError`] carrying the intake failure.
pub async fn submit_order<S, Q, H>(
    State(core): State<OrderCore<S, Q, H>>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmissionResponse>), ApiError>
where
    S: OrderStore + 'static,
    Q: WorkQueue + 'static,
    H: HistoryStore + 'static,
{
    let submission = core.intake().submit_json(&body).await?;
    let status = if submission.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(SubmissionResponse {
            order_id: submission.order.order_id().clone(),
            order_status: submission.order.status(),
        }),
    ))
}

/// `GET /api/orders/{orderId}`.
///
/// # Errors
///
/// [`ApiError`] for malformed or unknown ids.
pub async fn order_status<S, Q, H>(
    State(core): State<OrderCore<S, Q, H>>,
    Path(raw_id): Path<String>,
) -> Result<Json<OrderStatusResponse>, ApiError>
where
    S: OrderStore + 'static,
    Q: WorkQueue + 'static,
    H: HistoryStore + 'static,
{
    let order_id = parse_order_id(raw_id)?;
    let view = core.intake().order_status(&order_id).await?;
    Ok(Json(view.into()))
}

/// `GET /api/orders/{orderId}/status`.
///
/// # Errors
///
/// [`ApiError::InstanceNotFound`] if the order was never dispatched.
pub async fn instance_status<S, Q, H>(
    State(core): State<OrderCore<S, Q, H>>,
    Path(raw_id): Path<String>,
) -> Result<Json<InstanceStatusResponse>, ApiError>
where
    S: OrderStore + 'static,
    Q: WorkQueue + 'static,
    H: HistoryStore + 'static,
{
    let order_id = parse_order_id(raw_id)?;
    match core.intake().instance_status(&order_id).await {
        Ok(status) => Ok(Json(status.into())),
        Err(IntakeError::NotFound(order_id)) => Err(ApiError::InstanceNotFound(order_id)),
        Err(error) => Err(error.into()),
    }
}

/// Build the application router.
pub fn router<S, Q, H>(core: OrderCore<S, Q, H>) -> Router
where
    S: OrderStore + 'static,
    Q: WorkQueue + 'static,
    H: HistoryStore + 'static,
{
    Router::new()
        .route("/api/orders", post(submit_order::<S, Q, H>))
        .route("/api/orders/{order_id}", get(order_status::<S, Q, H>))
        .route(
            "/api/orders/{order_id}/status",
            get(instance_status::<S, Q, H>),
        )
        .with_state(core)
}

/// Serve HTTP and run the dispatch worker until ctrl-c.
///
/// The worker is told to stop once the HTTP server has drained, and its
/// in-flight deliveries finish before this returns.
pub async fn serve<S, Q, H>(core: OrderCore<S, Q, H>, bind_addr: SocketAddr) -> anyhow::Result<()>
where
    S: OrderStore + 'static,
    Q: WorkQueue + 'static,
    H: HistoryStore + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = core.worker();
    let worker_task = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "[server.start] listening");

    axum::serve(listener, router(core))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                error!(error = %error, "[server.signal] could not listen for ctrl-c");
            }
            info!("[server.shutdown] shutting down");
        })
        .await
        .context("http server failed")?;

    let _ = shutdown_tx.send(true);
    worker_task.await.context("dispatch worker panicked")?;
    Ok(())
}
