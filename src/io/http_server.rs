//! HTTP endpoint: Prometheus metrics plus read-only inventory views
//!
//! - `GET /metrics` - Prometheus text format
//! - `GET /inventory` - present items, snapshot order
//! - `GET /recommendations` - items ranked by urgency
//! - `GET /sessions` - active capture sessions
//! - `POST /sessions/{place|take}/cancel` - abort the session on a channel
//! - `GET /health`

use crate::domain::types::Channel;
use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS, METRICS_SESSION_MS_BOUNDS,
};
use crate::services::correlator::{CorrelatorHandle, SessionState};
use crate::services::inventory_store::InventoryHandle;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Everything the endpoints read from
#[derive(Clone)]
pub struct HttpState {
    pub site_id: Arc<String>,
    pub metrics: Arc<Metrics>,
    pub inventory: InventoryHandle,
    pub correlator: CorrelatorHandle,
}

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(8192);

    let counters: [(&str, &str, u64); 22] = [
        ("fridge_events_published_total", "Events accepted by the bus", summary.events_published),
        ("fridge_events_dispatched_total", "Events delivered to handlers", summary.events_dispatched),
        ("fridge_events_dropped_total", "Events rejected because the bus queue was full", summary.events_dropped_queue_full),
        ("fridge_events_malformed_total", "Events rejected at the bus boundary", summary.events_malformed),
        ("fridge_handler_failures_total", "Handler errors, panics and timeouts", summary.handler_failures),
        ("fridge_handler_timeouts_total", "Handlers that exceeded the handler timeout", summary.handler_timeouts),
        ("fridge_presses_accepted_total", "Button presses after debouncing", summary.presses_accepted),
        ("fridge_presses_debounced_total", "Button presses collapsed by the debouncer", summary.presses_debounced),
        ("fridge_proximity_edges_total", "Far to near proximity transitions", summary.proximity_edges),
        ("fridge_signals_dropped_total", "Conditioned signals the bus refused", summary.signals_dropped),
        ("fridge_sessions_started_total", "Capture sessions opened", summary.sessions_started),
        ("fridge_sessions_committed_total", "Capture sessions committed", summary.sessions_committed),
        ("fridge_sessions_aborted_total", "Capture sessions aborted", summary.sessions_aborted),
        ("fridge_presses_ignored_total", "Presses on a channel with an active session", summary.presses_ignored_active),
        ("fridge_stale_results_total", "Capture or recognition results for finished sessions", summary.stale_results),
        ("fridge_captures_failed_total", "Camera captures that failed", summary.captures_failed),
        ("fridge_camera_busy_retries_total", "Capture attempts that found the camera busy", summary.camera_busy_retries),
        ("fridge_recognition_attempts_total", "Classifier calls", summary.recognition_attempts),
        ("fridge_recognition_fallbacks_total", "Sessions committed with the unknown fallback", summary.recognition_fallbacks),
        ("fridge_snapshot_failures_total", "Failed snapshot writes", summary.snapshot_failures),
        ("fridge_notifications_sent_total", "Notifications queued to subscribers", summary.notifications_sent),
        ("fridge_subscribers_dropped_total", "Subscribers disconnected for a full or closed queue", summary.subscribers_dropped),
    ];
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, MetricType::Counter, site, val);
    }

    write_metric(&mut output, "fridge_items_present", "Items currently in the fridge", MetricType::Gauge, site, summary.items_present);
    write_metric(&mut output, "fridge_bus_queue_depth", "Events waiting in the bus intake", MetricType::Gauge, site, summary.bus_queue_depth);

    let dispatched: u64 = summary.lat_buckets.iter().sum();
    write_histogram(
        &mut output,
        "fridge_dispatch_latency_us",
        "Queue to dispatch latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_dispatch_latency_us * dispatched,
    );
    write_histogram(
        &mut output,
        "fridge_session_duration_ms",
        "Press to commit or abort duration in milliseconds",
        site,
        &summary.session_duration_buckets,
        &METRICS_SESSION_MS_BOUNDS,
        summary.session_duration_sum_ms,
    );

    output
}

#[derive(Serialize)]
struct SessionJson {
    session_id: String,
    channel: Channel,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_id: Option<String>,
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")),
        Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, &format!("encode failed: {e}")),
    }
}

fn plain(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

fn parse_channel(segment: &str) -> Option<Channel> {
    Channel::ALL.into_iter().find(|c| c.as_str() == segment.to_ascii_lowercase())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: HttpState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let response = match (req.method(), path.as_str()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.metrics.report(), &state.site_id);
            let mut response = plain(StatusCode::OK, &body);
            if let Ok(value) = "text/plain; version=0.0.4; charset=utf-8".parse() {
                response.headers_mut().insert("Content-Type", value);
            }
            response
        }
        (&Method::GET, "/health") => plain(StatusCode::OK, "ok"),
        (&Method::GET, "/inventory") => json_response(StatusCode::OK, &state.inventory.items()),
        (&Method::GET, "/recommendations") => {
            json_response(StatusCode::OK, &state.inventory.recommend(chrono::Utc::now()))
        }
        (&Method::GET, "/sessions") => {
            let sessions: Vec<SessionJson> = state
                .correlator
                .sessions()
                .await
                .into_iter()
                .map(|s| SessionJson {
                    session_id: s.session_id.to_string(),
                    channel: s.channel,
                    state: match s.state {
                        SessionState::AwaitingCapture => "AWAITING_CAPTURE",
                        SessionState::AwaitingRecognition => "AWAITING_RECOGNITION",
                    },
                    image_id: s.image_id,
                })
                .collect();
            json_response(StatusCode::OK, &sessions)
        }
        (&Method::POST, p) if p.starts_with("/sessions/") && p.ends_with("/cancel") => {
            let segment = p.trim_start_matches("/sessions/").trim_end_matches("/cancel");
            match parse_channel(segment) {
                Some(channel) => {
                    let accepted = state.correlator.cancel(channel);
                    info!(channel = %channel, accepted = %accepted, "http_cancel_requested");
                    json_response(
                        if accepted { StatusCode::ACCEPTED } else { StatusCode::SERVICE_UNAVAILABLE },
                        &serde_json::json!({ "ok": accepted, "channel": channel }),
                    )
                }
                None => plain(StatusCode::NOT_FOUND, "unknown channel"),
            }
        }
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Serve until shutdown is signalled
pub async fn start_http_server(
    port: u16,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, site = %state.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_event_published();
        metrics.record_event_dispatched(150);
        metrics.record_session_started();
        metrics.record_session_committed(1200);
        metrics.set_items_present(3);

        let output = format_prometheus_metrics(&metrics.report(), "kitchen");

        assert!(output.contains("fridge_events_published_total{site=\"kitchen\"} 1"));
        assert!(output.contains("fridge_sessions_committed_total{site=\"kitchen\"} 1"));
        assert!(output.contains("fridge_items_present{site=\"kitchen\"} 3"));
        assert!(output.contains("fridge_dispatch_latency_us_bucket{site=\"kitchen\",le=\"+Inf\"} 1"));
        assert!(output.contains("fridge_session_duration_ms_sum{site=\"kitchen\"} 1200"));
        assert!(output.contains("fridge_session_duration_ms_count{site=\"kitchen\"} 1"));
    }

    #[test]
    fn test_parse_channel() {
        assert_eq!(parse_channel("place"), Some(Channel::Place));
        assert_eq!(parse_channel("TAKE"), Some(Channel::Take));
        assert_eq!(parse_channel("door"), None);
    }
}
