//! Control API and observer event stream.
//!
//! Routes:
//! - `GET /plates`, `POST /plates {plate}`, `PATCH /plates/{plate}`,
//!   `DELETE /plates/{plate}`: registry management;
//! - `POST /detect_plate`: one-shot detection on an uploaded image;
//! - `GET /events`: server-sent events (`plates_list`, `frame`,
//!   `plate_detected`);
//! - `GET /health`.
//!
//! The accept loop polls a non-blocking listener and checks the shutdown
//! flag between accepts. Each connection is served on its own thread so a
//! long-lived event stream never blocks registry calls.

mod request;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::broadcast::{BroadcastEvent, Broadcaster};
use crate::detect::{detect_plate, DetectError};
use crate::recognize::SharedRecognizer;
use crate::registry::{PlateRegistry, RegistryError};

use request::{
    multipart_file, read_request, write_error, write_event_stream_head, write_json,
    write_response, HttpRequest,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EVENT_KEEPALIVE: Duration = Duration::from_secs(15);
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_EVENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// An event-stream observer that accepts no bytes for this long is
    /// disconnected and unsubscribed.
    pub event_write_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5001".to_string(),
            event_write_timeout: DEFAULT_EVENT_WRITE_TIMEOUT,
        }
    }
}

/// Everything request handlers need.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<PlateRegistry>,
    pub recognizer: SharedRecognizer,
    pub broadcaster: Broadcaster,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let listener = TcpListener::bind(self.cfg.addr.as_str())
            .with_context(|| format!("bind api listener on {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("api: listening on http://{}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = self.state;
        let write_timeout = self.cfg.event_write_timeout;
        let join = std::thread::Builder::new()
            .name("plate-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, state, write_timeout, shutdown_thread) {
                    log::error!("api: stopped: {:#}", err);
                }
            })
            .context("spawn api thread")?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    state: ApiState,
    write_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name("plate-api-conn".to_string())
                    .spawn(move || {
                        let served = handle_connection(stream, &state, write_timeout, &shutdown);
                        if let Err(err) = served {
                            log::warn!("api: request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("api: could not spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    state: &ApiState,
    write_timeout: Duration,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(write_timeout))?;

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let _ = write_error(&mut stream, 400, "Malformed request");
            return Err(err);
        }
    };
    log::debug!("api: {} {}", request.method, request.path);

    if request.method == "OPTIONS" {
        return write_response(&mut stream, 204, "text/plain", b"");
    }

    let segments = request.segments();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => write_json(&mut stream, 200, &json!({ "status": "ok" })),
        ("GET", ["plates"]) => match state.registry.broadcast_snapshot() {
            Ok(records) => write_json(&mut stream, 200, &records),
            Err(err) => write_registry_error(&mut stream, err),
        },
        ("POST", ["plates"]) => add_plate(&mut stream, state, &request),
        ("PATCH", ["plates", plate]) => match state.registry.toggle(plate) {
            Ok(_) => write_json(&mut stream, 200, &json!({ "message": "Authorization toggled" })),
            Err(err) => write_registry_error(&mut stream, err),
        },
        ("DELETE", ["plates", plate]) => match state.registry.delete(plate) {
            Ok(()) => write_json(&mut stream, 200, &json!({ "message": "Plate deleted" })),
            Err(err) => write_registry_error(&mut stream, err),
        },
        ("POST", ["detect_plate"]) => detect(&mut stream, state, &request),
        ("GET", ["events"]) => stream_events(stream, state, shutdown),
        (_, ["health"]) | (_, ["plates"]) | (_, ["plates", _]) | (_, ["detect_plate"])
        | (_, ["events"]) => write_error(&mut stream, 405, "Method not allowed"),
        _ => write_error(&mut stream, 404, "Not found"),
    }
}

#[derive(Debug, Deserialize)]
struct AddPlateBody {
    #[serde(default)]
    plate: Option<String>,
}

fn add_plate<W: Write>(stream: &mut W, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let body: AddPlateBody = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(_) => return write_error(stream, 400, "Plate is required"),
    };
    let plate = body.plate.unwrap_or_default();
    match state.registry.add(&plate) {
        Ok(_) => write_json(stream, 200, &json!({ "message": "Plate added" })),
        Err(err) => write_registry_error(stream, err),
    }
}

fn write_registry_error<W: Write>(stream: &mut W, err: RegistryError) -> Result<()> {
    let status = match err {
        RegistryError::InvalidInput | RegistryError::AlreadyExists => 400,
        RegistryError::NotFound => 404,
        RegistryError::Storage(_) => {
            log::error!("api: {}", err);
            500
        }
    };
    write_error(stream, status, &err.to_string())
}

/// Image bytes from a multipart upload or a raw image body.
fn uploaded_image(request: &HttpRequest) -> Option<Vec<u8>> {
    let content_type = request.content_type().unwrap_or_default();
    if content_type == "multipart/form-data" {
        let raw = request.header("content-type").unwrap_or_default();
        return multipart_file(raw, &request.body);
    }
    if request.body.is_empty() {
        None
    } else {
        Some(request.body.clone())
    }
}

fn detect<W: Write>(stream: &mut W, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let Some(image) = uploaded_image(request) else {
        return write_detect_error(stream, DetectError::NoImage);
    };
    match detect_plate(&state.recognizer, &state.registry, &image) {
        Ok(detection) => write_json(stream, 200, &detection),
        Err(err) => write_detect_error(stream, err),
    }
}

fn write_detect_error<W: Write>(stream: &mut W, err: DetectError) -> Result<()> {
    let status = match err {
        DetectError::NoImage | DetectError::InvalidImage(_) => 400,
        DetectError::NoValidPlate => 422,
        DetectError::Recognition(_) => {
            log::warn!("api: {}", err);
            503
        }
    };
    write_error(stream, status, &err.to_string())
}

/// Server-sent event stream. Runs until the client goes away, stalls past the
/// write timeout, or shutdown. Returning drops the subscription.
fn stream_events(mut stream: TcpStream, state: &ApiState, shutdown: &AtomicBool) -> Result<()> {
    let subscription = state.broadcaster.subscribe();
    write_event_stream_head(&mut stream)?;
    let snapshot = state.registry.list().unwrap_or_else(|err| {
        log::warn!("api: initial plates_list unavailable: {}", err);
        Vec::new()
    });
    write_event(&mut stream, &BroadcastEvent::PlatesList(snapshot))?;

    log::debug!("api: event stream opened");
    let mut idle = Duration::ZERO;
    while !shutdown.load(Ordering::SeqCst) {
        let written = match subscription.recv_timeout(EVENT_POLL_INTERVAL) {
            Some(event) => {
                idle = Duration::ZERO;
                write_event(&mut stream, &event)
            }
            None => {
                idle += EVENT_POLL_INTERVAL;
                if idle < EVENT_KEEPALIVE {
                    continue;
                }
                idle = Duration::ZERO;
                write_keepalive(&mut stream)
            }
        };
        // A failed write means the observer disconnected.
        if let Err(err) = written {
            log::debug!("api: event stream closed: {:#}", err);
            break;
        }
    }
    Ok(())
}

fn write_keepalive<W: Write>(stream: &mut W) -> Result<()> {
    stream.write_all(b": keepalive\n\n")?;
    stream.flush()?;
    Ok(())
}

fn write_event<W: Write>(stream: &mut W, event: &BroadcastEvent) -> Result<()> {
    let data = event.data_json()?;
    write!(stream, "event: {}\ndata: {}\n\n", event.name(), data)?;
    stream.flush()?;
    Ok(())
}
