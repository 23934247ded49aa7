//! A HTTP API for the client interactions with the coordinator.
//!
//! | Route                            | Request                   | Response                      |
//! | -------------------------------- | ------------------------- | ----------------------------- |
//! | `GET /groups`                    |                           | JSON list of group names      |
//! | `GET /groups/{name}/weights`     |                           | bincode encoded weight set    |
//! | `POST /groups/{name}/deltas`     | bincode encoded delta     | empty                         |
//! | `POST /groups/{name}/aggregate`  |                           | JSON aggregation summary      |
//! | `POST /groups/{name}/reset`      |                           | JSON `{"discarded": n}`       |
//! | `GET /groups/{name}/metrics`     |                           | JSON list of metric records   |
//! | `POST /groups/{name}/metrics`    | JSON metric record        | empty                         |
//!
//! A delta can be attributed to a client with the `client_id` query parameter, e.g.
//! `POST /groups/income/deltas?client_id=3`.

use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warp::{
    http::StatusCode,
    reply::{Reply, Response},
    Filter,
};

use raccoon_core::{ClientId, Delta, MetricRecord};

use crate::{
    coordinator::{AggregationCoordinator, CoordinatorError},
    settings::ApiSettings,
};

/// The number of bytes a delta body may exceed the encoding of the largest model by.
const DELTA_BODY_HEADROOM: u64 = 1024;

#[derive(Debug, Default, Deserialize, Serialize)]
struct DeltaQuery {
    client_id: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
/// The response to a reset request.
pub struct ResetSummary {
    pub discarded: usize,
}

#[derive(Debug, Deserialize, Serialize)]
/// The body of every error response.
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

/// Starts a HTTP server at the configured address and serves the coordinator API until the
/// returned future is dropped.
///
/// # Errors
/// Fails if the server can't be bound to the configured address.
pub async fn serve(
    api_settings: ApiSettings,
    coordinator: Arc<AggregationCoordinator>,
) -> Result<(), RestError> {
    let (address, server) =
        warp::serve(routes(coordinator)).try_bind_ephemeral(api_settings.bind_address)?;
    info!("serving the REST API on {}", address);
    server.await;
    Ok(())
}

/// Builds the `warp` filter of the coordinator API.
///
/// Delta bodies are limited to the encoded size of the largest global weights plus some headroom.
pub fn routes(
    coordinator: Arc<AggregationCoordinator>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let delta_limit = delta_body_limit(&coordinator);
    debug!("limiting delta bodies to {} bytes", delta_limit);

    let groups = warp::path!("groups")
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .and_then(handle_groups);

    let weights = warp::path!("groups" / String / "weights")
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .and_then(handle_weights);

    let delta = warp::path!("groups" / String / "deltas")
        .and(warp::post())
        .and(warp::query::<DeltaQuery>())
        .and(warp::body::content_length_limit(delta_limit))
        .and(warp::body::bytes())
        .and(with_coordinator(coordinator.clone()))
        .and_then(handle_delta);

    let aggregate = warp::path!("groups" / String / "aggregate")
        .and(warp::post())
        .and(with_coordinator(coordinator.clone()))
        .and_then(handle_aggregate);

    let reset = warp::path!("groups" / String / "reset")
        .and(warp::post())
        .and(with_coordinator(coordinator.clone()))
        .and_then(handle_reset);

    let list_metrics = warp::path!("groups" / String / "metrics")
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .and_then(handle_list_metrics);

    let log_metric = warp::path!("groups" / String / "metrics")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_coordinator(coordinator))
        .and_then(handle_log_metric);

    groups
        .or(weights)
        .or(delta)
        .or(aggregate)
        .or(reset)
        .or(list_metrics)
        .or(log_metric)
        .recover(handle_reject)
        .with(warp::log("http"))
}

/// Handles and responds to a request for the group names.
async fn handle_groups(coordinator: Arc<AggregationCoordinator>) -> Result<Response, Infallible> {
    Ok(warp::reply::json(&coordinator.group_names()).into_response())
}

/// Handles and responds to a request for the global weights of a group.
async fn handle_weights(
    name: String,
    coordinator: Arc<AggregationCoordinator>,
) -> Result<Response, Infallible> {
    let weights = match coordinator.get_weights(&name) {
        Ok(weights) => weights,
        Err(err) => return Ok(coordinator_error(err)),
    };
    Ok(match bincode::serialize(&*weights) {
        Ok(bytes) => bytes.into_response(),
        Err(err) => {
            error!("failed to serialize the weights of group {}: {}", name, err);
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    })
}

/// Handles and responds to a delta submission.
async fn handle_delta(
    name: String,
    query: DeltaQuery,
    body: Bytes,
    coordinator: Arc<AggregationCoordinator>,
) -> Result<Response, Infallible> {
    let delta: Delta = match bincode::deserialize(&body) {
        Ok(delta) => delta,
        Err(err) => {
            warn!("group {}: failed to decode delta: {}", name, err);
            return Ok(error_reply(
                StatusCode::BAD_REQUEST,
                format!("invalid delta: {}", err),
            ));
        }
    };
    let result = match query.client_id {
        Some(client_id) => coordinator.submit_delta_from(&name, ClientId::new(client_id), delta),
        None => coordinator.submit_delta(&name, delta),
    };
    Ok(match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => coordinator_error(err),
    })
}

/// Handles and responds to an aggregation request.
///
/// The aggregation runs on the blocking thread pool.
async fn handle_aggregate(
    name: String,
    coordinator: Arc<AggregationCoordinator>,
) -> Result<Response, Infallible> {
    let aggregation =
        tokio::task::spawn_blocking(move || coordinator.run_aggregation(&name)).await;
    Ok(match aggregation {
        Ok(Ok(summary)) => warp::reply::json(&summary).into_response(),
        Ok(Err(err)) => coordinator_error(err),
        Err(err) => {
            error!("aggregation task failed: {}", err);
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    })
}

/// Handles and responds to a reset request.
async fn handle_reset(
    name: String,
    coordinator: Arc<AggregationCoordinator>,
) -> Result<Response, Infallible> {
    Ok(match coordinator.reset(&name) {
        Ok(discarded) => warp::reply::json(&ResetSummary { discarded }).into_response(),
        Err(err) => coordinator_error(err),
    })
}

/// Handles and responds to a request for the metrics log of a group.
async fn handle_list_metrics(
    name: String,
    coordinator: Arc<AggregationCoordinator>,
) -> Result<Response, Infallible> {
    Ok(match coordinator.list_metrics(&name) {
        Ok(metrics) => warp::reply::json(&metrics).into_response(),
        Err(err) => coordinator_error(err),
    })
}

/// Handles and responds to a metric record.
async fn handle_log_metric(
    name: String,
    record: MetricRecord,
    coordinator: Arc<AggregationCoordinator>,
) -> Result<Response, Infallible> {
    Ok(match coordinator.log_metric(&name, record) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => coordinator_error(err),
    })
}

/// Gets the maximal accepted size of a delta body.
fn delta_body_limit(coordinator: &AggregationCoordinator) -> u64 {
    let largest = coordinator
        .group_names()
        .iter()
        .filter_map(|name| coordinator.get_weights(name).ok())
        .filter_map(|weights| bincode::serialized_size(&*weights).ok())
        .max()
        .unwrap_or_default();
    largest + DELTA_BODY_HEADROOM
}

/// Converts a coordinator into a `warp` filter.
fn with_coordinator(
    coordinator: Arc<AggregationCoordinator>,
) -> impl Filter<Extract = (Arc<AggregationCoordinator>,), Error = Infallible> + Clone {
    warp::any().map(move || coordinator.clone())
}

/// Maps a coordinator error to its status code.
fn status_code(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::UnknownGroup(_) => StatusCode::NOT_FOUND,
        CoordinatorError::ShapeMismatch(_) | CoordinatorError::InvalidNumeric => {
            StatusCode::BAD_REQUEST
        }
        CoordinatorError::EmptyBuffer => StatusCode::CONFLICT,
        CoordinatorError::RoundBusy => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::Uninitialized(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn coordinator_error(err: CoordinatorError) -> Response {
    error_reply(status_code(&err), err.to_string())
}

fn error_reply(code: StatusCode, message: String) -> Response {
    let body = ErrorBody {
        status: "error".to_string(),
        message,
    };
    warp::reply::with_status(warp::reply::json(&body), code).into_response()
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: warp::Rejection) -> Result<Response, Infallible> {
    Ok(if err.is_not_found() {
        error_reply(StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(err) = err.find::<warp::body::BodyDeserializeError>() {
        error_reply(StatusCode::BAD_REQUEST, err.to_string())
    } else if let Some(err) = err.find::<warp::reject::InvalidQuery>() {
        error_reply(StatusCode::BAD_REQUEST, err.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        error_reply(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload too large".to_string(),
        )
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        error_reply(
            StatusCode::LENGTH_REQUIRED,
            "content length required".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        error_reply(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        )
    } else {
        error!("unhandled rejection: {:?}", err);
        error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    })
}

#[derive(Debug, Error)]
/// Errors of the rest server.
pub enum RestError {
    #[error("failed to bind the REST API: {0}")]
    Bind(#[from] warp::Error),
}
