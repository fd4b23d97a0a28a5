use std::io::Read;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tiny_http::{Header, Method, Response, Server, StatusCode};

use crate::slots::codec::{decode_query, encode_query, parse_timestamp};
use crate::slots::error::SlotError;
use crate::slots::model::{Interval, IntervalId, Segment};
use crate::slots::mutation::Command;
use crate::slots::storage::KeyValueStorage;
use crate::slots::store::{EditOutcome, IntervalStore};

const MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

pub struct ApiServer {
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start<S>(config: ApiServerConfig, store: Arc<Mutex<IntervalStore<S>>>) -> Result<Self>
    where
        S: KeyValueStorage + Send + 'static,
    {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let http_join = thread::spawn(move || run_server_loop(server, store, stop_for_thread));
        info!("slot API listening on http://{bind}");

        Ok(Self {
            stop,
            http_join: Some(http_join),
        })
    }

    /// Block until the server loop exits.
    pub fn join(mut self) {
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop<S: KeyValueStorage>(
    server: Server,
    store: Arc<Mutex<IntervalStore<S>>>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &store),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiBody {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ApiBody,
}

impl ApiResponse {
    fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => Self {
                status,
                body: ApiBody::Json(value),
            },
            Err(err) => Self::error(500, &format!("failed to encode response: {err}")),
        }
    }

    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: ApiBody::Text(body.to_string()),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: ApiBody::Json(json!({ "error": message })),
        }
    }
}

fn handle_request<S: KeyValueStorage>(
    mut request: tiny_http::Request,
    store: &Arc<Mutex<IntervalStore<S>>>,
) {
    let Some(remote_addr) = request.remote_addr() else {
        let _ = send_text(request, StatusCode(400), "missing remote address");
        return;
    };
    if !is_local_network_ip(remote_addr.ip()) {
        let _ = send_text(request, StatusCode(403), "forbidden: local network only");
        return;
    }

    let mut body = String::new();
    if request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
        .is_err()
    {
        let _ = send_text(request, StatusCode(400), "request body is not valid UTF-8");
        return;
    }

    let method = request.method().clone();
    let url = request.url().to_string();
    let (path, _query) = split_path_query(&url);

    let response = match store.lock() {
        Ok(mut guard) => route(&method, path, &body, &mut guard),
        Err(_) => ApiResponse::error(500, "internal state lock error"),
    };

    let status = StatusCode(response.status);
    let sent = match response.body {
        ApiBody::Json(value) => send_json(request, status, &value),
        ApiBody::Text(text) => send_text(request, status, &text),
    };
    if let Err(err) = sent {
        warn!("failed to send response for {method} {url}: {err:#}");
    }
}

#[derive(Debug, Deserialize)]
struct NewInterval {
    start: String,
    end: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotImport {
    query: String,
}

#[derive(Serialize)]
struct IntervalSegments<'a> {
    interval: &'a Interval,
    segments: Vec<Segment>,
}

/// Dispatch one request against the store. Each call runs to completion
/// while the caller holds the store lock.
pub fn route<S: KeyValueStorage>(
    method: &Method,
    path: &str,
    body: &str,
    store: &mut IntervalStore<S>,
) -> ApiResponse {
    let segments = path
        .trim_end_matches('/')
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();

    match (method, segments.as_slice()) {
        (Method::Get, ["healthz"]) => ApiResponse::text(200, "ok"),
        (Method::Get, ["v1"]) => ApiResponse::json(
            200,
            &json!({
                "intervals_url": "/v1/intervals",
                "segments_url": "/v1/segments",
                "edits_url": "/v1/edits",
                "snapshot_url": "/v1/snapshot",
                "policy": store.segmenter().policy.as_str(),
                "granularity_minutes": store.segmenter().granularity.num_minutes(),
            }),
        ),
        (Method::Get, ["v1", "intervals"]) => {
            let intervals = store.intervals().as_slice();
            ApiResponse::json(
                200,
                &json!({ "count": intervals.len(), "intervals": intervals }),
            )
        }
        (Method::Post, ["v1", "intervals"]) => add_interval(body, store),
        (Method::Delete, ["v1", "intervals", id]) => match parse_id(id) {
            Some(id) => match store.remove(id) {
                Ok(removed) => ApiResponse::json(200, &json!({ "removed": removed })),
                Err(err) => error_response(err),
            },
            None => ApiResponse::error(400, "interval id must be an integer"),
        },
        (Method::Get, ["v1", "intervals", id, "segments"]) => match parse_id(id) {
            Some(id) => match store.segments(id) {
                Some(segments) => {
                    ApiResponse::json(200, &json!({ "id": id, "segments": segments }))
                }
                None => ApiResponse::error(404, "unknown interval"),
            },
            None => ApiResponse::error(400, "interval id must be an integer"),
        },
        (Method::Get, ["v1", "segments"]) => {
            let view = store
                .intervals()
                .iter()
                .map(|interval| IntervalSegments {
                    interval,
                    segments: store.segmenter().segment(interval),
                })
                .collect::<Vec<_>>();
            ApiResponse::json(200, &view)
        }
        (Method::Post, ["v1", "edits"]) => apply_edit(body, store),
        (Method::Get, ["v1", "snapshot"]) => match encode_query(store.intervals()) {
            Ok(query) => ApiResponse::json(200, &json!({ "query": query })),
            Err(err) => ApiResponse::error(500, &format!("{err:#}")),
        },
        (Method::Post, ["v1", "snapshot"]) => import_snapshot(body, store),
        (
            _,
            ["healthz"]
            | ["v1"]
            | ["v1", "intervals"]
            | ["v1", "intervals", _]
            | ["v1", "intervals", _, "segments"]
            | ["v1", "segments"]
            | ["v1", "edits"]
            | ["v1", "snapshot"],
        ) => ApiResponse::text(405, "method not allowed"),
        _ => ApiResponse::text(404, "not found"),
    }
}

fn add_interval<S: KeyValueStorage>(body: &str, store: &mut IntervalStore<S>) -> ApiResponse {
    let input = match serde_json::from_str::<NewInterval>(body) {
        Ok(input) => input,
        Err(err) => return ApiResponse::error(400, &format!("invalid interval: {err}")),
    };
    let (start, end) = match (parse_timestamp(&input.start), parse_timestamp(&input.end)) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(err), _) | (_, Err(err)) => return ApiResponse::error(400, &format!("{err:#}")),
    };

    match store.add(start, end, input.title) {
        Ok(id) => ApiResponse::json(201, &json!({ "id": id })),
        Err(err) => error_response(err),
    }
}

fn apply_edit<S: KeyValueStorage>(body: &str, store: &mut IntervalStore<S>) -> ApiResponse {
    let command = match serde_json::from_str::<Command>(body) {
        Ok(command) => command,
        Err(err) => return ApiResponse::error(400, &format!("invalid edit: {err}")),
    };

    match store.apply(&command) {
        Ok(EditOutcome::Changed { intervals }) => {
            ApiResponse::json(200, &json!({ "applied": true, "intervals": intervals }))
        }
        Ok(EditOutcome::Ignored(reason)) => {
            ApiResponse::json(200, &json!({ "applied": false, "ignored": reason }))
        }
        Err(err) => error_response(err),
    }
}

fn import_snapshot<S: KeyValueStorage>(body: &str, store: &mut IntervalStore<S>) -> ApiResponse {
    let input = match serde_json::from_str::<SnapshotImport>(body) {
        Ok(input) => input,
        Err(err) => return ApiResponse::error(400, &format!("invalid snapshot: {err}")),
    };
    let decoded = match decode_query(&input.query) {
        Ok(decoded) if !decoded.corrupt => decoded,
        Ok(_) => return ApiResponse::error(400, "snapshot is not an event array"),
        Err(err) => return ApiResponse::error(400, &format!("{err:#}")),
    };

    let dropped = decoded.dropped;
    match store.import(decoded.events) {
        Ok(imported) => {
            ApiResponse::json(200, &json!({ "imported": imported, "dropped": dropped }))
        }
        Err(err) => error_response(err),
    }
}

fn error_response(err: SlotError) -> ApiResponse {
    let status = match err {
        SlotError::Overlap { .. } => 409,
        SlotError::InvalidRange { .. } | SlotError::InvalidHour(_) => 400,
        SlotError::Storage(_) => 500,
    };
    ApiResponse::error(status, &format!("{err:#}"))
}

fn parse_id(raw: &str) -> Option<IntervalId> {
    raw.parse::<u64>().ok().map(IntervalId)
}

fn send_json(request: tiny_http::Request, status: StatusCode, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}
