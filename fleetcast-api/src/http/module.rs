//! Module endpoints
//!
//! Unary operations answer with every instance's response and every failure:
//! the success status when at least one instance answered (or none was
//! targeted), 502 when all targeted instances failed. Streaming operations are
//! Server-Sent Events; closing the connection cancels the remote streams.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use fleetcast_cluster::BroadcastResult;
use fleetcast_proto::Module;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use super::{AppResult, AppState};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `POST /api/v1/module/{name}`: apply the module in the JSON body everywhere
pub async fn apply(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> AppResult<Response> {
    let module: Module = serde_json::from_slice(&body)?;
    let result = state.gateway.apply(&name, module).await?;
    Ok(unary_response(StatusCode::CREATED, result))
}

/// `DELETE /api/v1/module/{name}`
pub async fn delete(State(state): State<AppState>, Path(name): Path<String>) -> AppResult<Response> {
    let result = state.gateway.delete(&name).await?;
    Ok(unary_response(StatusCode::OK, result))
}

/// `GET /api/v1/module/{name}`
pub async fn get(State(state): State<AppState>, Path(name): Path<String>) -> AppResult<Response> {
    let result = state.gateway.get(&name).await?;
    Ok(unary_response(StatusCode::OK, result))
}

/// `GET /api/v1/module?labels[k]=v`: stream matching modules as `module` events
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let modules = state.gateway.list(label_selector(params))?;
    Ok(json_events("module", modules))
}

/// `GET /api/v1/module/{name}/data`: stream telemetry as `data` events
pub async fn watch_data(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let telemetry = state.gateway.watch_data(&name)?;
    Ok(json_events("data", telemetry))
}

/// `GET /api/v1/module/{name}/log`: stream log lines as `log` events
pub async fn watch_log(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let lines = state
        .gateway
        .watch_log(&name)?
        .map(|line| Ok::<_, Infallible>(Event::default().event("log").data(line)));

    Ok(Sse::new(lines).keep_alive(keep_alive()))
}

fn unary_response<T: Serialize>(success: StatusCode, result: BroadcastResult<T>) -> Response {
    let status = if result.all_failed() {
        StatusCode::BAD_GATEWAY
    } else {
        success
    };
    (status, Json(result)).into_response()
}

fn json_events<T, S>(name: &'static str, items: S) -> Sse<impl Stream<Item = Result<Event, axum::Error>>>
where
    T: Serialize,
    S: Stream<Item = T> + Send + 'static,
{
    let events = items.map(move |item| Event::default().event(name).json_data(item));
    Sse::new(events).keep_alive(keep_alive())
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping")
}

/// Collect `labels[<key>]=<value>` query parameters; other parameters are ignored.
fn label_selector(params: Vec<(String, String)>) -> HashMap<String, String> {
    params
        .into_iter()
        .filter_map(|(key, value)| {
            let label = key.strip_prefix("labels[")?.strip_suffix(']')?;
            (!label.is_empty()).then(|| (label.to_string(), value))
        })
        .collect()
}
