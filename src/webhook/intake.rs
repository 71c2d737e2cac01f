//! Webhook intake HTTP boundary
//!
//! Minimal hyper server accepting upstream deliveries: event kind,
//! delivery id, and signature come from headers, the raw body is the
//! signed payload. Responds 202 on enqueue, 429 when the queue is full,
//! and 400-class codes for validation failures.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::adapter::MeshAdapter;
use crate::error::ErrorKind;
use crate::webhook::WebhookEvent;

const EVENT_HEADER: &str = "X-GitHub-Event";
const DELIVERY_HEADER: &str = "X-GitHub-Delivery";
const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Starts the intake server; runs until the task is dropped.
pub async fn start_intake_server(addr: SocketAddr, adapter: Arc<MeshAdapter>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Webhook intake listening");

    loop {
        let (stream, remote) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let adapter = adapter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let adapter = adapter.clone();
                async move { handle_request(req, adapter, Some(remote.ip())).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "Webhook intake connection error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    adapter: Arc<MeshAdapter>,
    remote: Option<IpAddr>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/webhooks") => Ok(handle_delivery(req, adapter, remote).await),
        (&Method::GET, "/healthz") => {
            let health = adapter.health();
            let status = if health.is_healthy() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            Ok(respond(status, &format!("{{\"status\": \"{}\"}}", health)))
        }
        _ => Ok(respond(StatusCode::NOT_FOUND, "{\"message\": \"not found\"}")),
    }
}

async fn handle_delivery(
    req: Request<Incoming>,
    adapter: Arc<MeshAdapter>,
    remote: Option<IpAddr>,
) -> Response<Full<Bytes>> {
    let event_kind = header(&req, EVENT_HEADER);
    let delivery_id = header(&req, DELIVERY_HEADER);
    let signature = header(&req, SIGNATURE_HEADER);

    let (Some(event_kind), Some(delivery_id), Some(signature)) =
        (event_kind, delivery_id, signature)
    else {
        return respond(
            StatusCode::BAD_REQUEST,
            "{\"message\": \"missing event, delivery, or signature header\"}",
        );
    };

    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    let payload = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(e) => {
            error!(error = %e, "Failed to read webhook body");
            return respond(StatusCode::BAD_REQUEST, "{\"message\": \"unreadable body\"}");
        }
    };

    let mut event = WebhookEvent::new(event_kind, delivery_id, payload);
    event.headers = headers;

    debug!(
        delivery_id = %event.delivery_id,
        event = %event.event_kind,
        "Webhook delivery received"
    );

    match adapter.handle_webhook(event, &signature, remote).await {
        Ok(()) => respond(StatusCode::ACCEPTED, "{\"status\": \"accepted\"}"),
        Err(err) => {
            let status = match err.kind {
                ErrorKind::QueueFull => StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::InvalidSignature => StatusCode::UNAUTHORIZED,
                ErrorKind::ReplayDetected => StatusCode::CONFLICT,
                ErrorKind::InvalidSource => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            respond(
                status,
                &format!("{{\"message\": \"{}\"}}", err.kind.as_str()),
            )
        }
    }
}

fn header(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers()
        .get(name)?
        .to_str()
        .ok()
        .map(|v| v.to_string())
}

fn respond(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response builds")
}
