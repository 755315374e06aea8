use crate::capture::{CaptureState, CaptureStatus};
use crate::error::RequestError;
use crate::orchestrator::{Orchestrator, RequestParameters};
use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

const MAX_REQUEST_BYTES: usize = 8192;
const NO_FRAME_BODY: &str = "Failed to grab frame from camera.";
const BUSY_BODY: &str = "server busy";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Request handler threads.
    pub workers: usize,
    /// Accepted connections that may wait for a free handler. Beyond that the
    /// accept thread answers 503 itself.
    pub queue: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8888".to_string(),
            workers: 4,
            queue: 8,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Queued and in-progress requests run to
    /// completion before the workers exit.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        for worker in self.workers.drain(..) {
            worker
                .join()
                .map_err(|_| anyhow!("http worker thread panicked"))?;
        }
        Ok(())
    }
}

/// Snapshot HTTP server.
///
/// - `GET /` and `GET /frame.jpg`: latest frame as JPEG (`detect`, `crop`, `ocr` query flags)
/// - `GET /health`: capture state and counters as JSON
///
/// One accept thread hands connections to a fixed pool of workers over a
/// bounded queue, so a slow detection pass only ties up its own worker. When
/// every worker is busy and the queue is full, new connections get 503.
pub struct ApiServer {
    cfg: ApiConfig,
    orchestrator: Orchestrator,
    status: Arc<CaptureStatus>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, orchestrator: Orchestrator, status: Arc<CaptureStatus>) -> Self {
        Self {
            cfg,
            orchestrator,
            status,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        if self.cfg.workers == 0 {
            return Err(anyhow!("http server needs at least one worker"));
        }
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "http server configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let (conn_tx, conn_rx) = crossbeam_channel::bounded(self.cfg.queue);
        let mut workers = Vec::with_capacity(self.cfg.workers);
        for index in 0..self.cfg.workers {
            let connections = conn_rx.clone();
            let orchestrator = self.orchestrator.clone();
            let status = self.status.clone();
            let worker = std::thread::Builder::new()
                .name(format!("http-worker-{index}"))
                .spawn(move || serve_connections(connections, orchestrator, status))?;
            workers.push(worker);
        }
        drop(conn_rx);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, conn_tx, shutdown_thread) {
                    log::error!("http server stopped: {}", err);
                }
            })?;
        log::info!(
            "serving snapshots on http://{} ({} workers, queue {})",
            addr,
            self.cfg.workers,
            self.cfg.queue
        );

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
            workers,
        })
    }
}

fn run_api(
    listener: TcpListener,
    connections: Sender<(TcpStream, SocketAddr)>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok(connection) => match connections.try_send(connection) {
                Ok(()) => {}
                Err(TrySendError::Full((stream, peer))) => {
                    log::warn!("all http workers busy, refusing {}", peer);
                    if let Err(err) = reject_busy(stream) {
                        log::debug!("failed to refuse {}: {}", peer, err);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(anyhow!("http workers exited"));
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn serve_connections(
    connections: Receiver<(TcpStream, SocketAddr)>,
    orchestrator: Orchestrator,
    status: Arc<CaptureStatus>,
) {
    for (stream, peer) in connections.iter() {
        if let Err(err) = handle_connection(stream, &orchestrator, &status) {
            log::warn!("request from {} rejected: {}", peer, err);
        }
    }
}

fn reject_busy(mut stream: TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    write_response(
        &mut stream,
        503,
        "text/plain; charset=utf-8",
        &[("Retry-After", "1".to_string())],
        BUSY_BODY.as_bytes(),
    )?;
    drain(&mut stream);
    Ok(())
}

#[derive(Debug, Error)]
#[error("request exceeds {MAX_REQUEST_BYTES} bytes")]
struct RequestTooLarge;

#[derive(Serialize)]
struct HealthBody {
    state: CaptureState,
    sequence: u64,
    frames_captured: u64,
    reconnects: u64,
}

fn handle_connection(
    mut stream: TcpStream,
    orchestrator: &Orchestrator,
    status: &CaptureStatus,
) -> Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) if err.downcast_ref::<RequestTooLarge>().is_some() => {
            write_text_response(&mut stream, 413, "request too large")?;
            drain(&mut stream);
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    if request.method != "GET" {
        write_text_response(&mut stream, 405, "method not allowed")?;
        return Ok(());
    }

    match request.path.as_str() {
        "/" | "/frame.jpg" => serve_frame(&mut stream, orchestrator, &request),
        "/health" => {
            let stats = status.stats();
            let body = HealthBody {
                state: stats.state,
                sequence: orchestrator.cache().sequence(),
                frames_captured: stats.frames_captured,
                reconnects: stats.reconnects,
            };
            let payload = serde_json::to_vec(&body)?;
            write_response(&mut stream, 200, "application/json", &[], &payload)
        }
        _ => write_text_response(&mut stream, 404, "not found"),
    }
}

fn serve_frame(
    stream: &mut TcpStream,
    orchestrator: &Orchestrator,
    request: &HttpRequest,
) -> Result<()> {
    let params = RequestParameters::from_query(request.query());
    match orchestrator.handle(params) {
        Ok(response) => {
            let mut headers = vec![("X-Frame-Sequence", response.sequence.to_string())];
            if let Some(text) = response.text.as_deref().map(header_safe) {
                if !text.is_empty() {
                    headers.push(("X-Recognized-Text", text));
                }
            }
            write_response(stream, 200, "image/jpeg", &headers, &response.jpeg)
        }
        Err(RequestError::NoFrameAvailable) => write_text_response(stream, 503, NO_FRAME_BODY),
        Err(err) => {
            log::error!("failed to build frame response: {}", err);
            write_text_response(stream, 500, "internal error")
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(RequestTooLarge.into());
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
    })
}

fn write_text_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(
        stream,
        status,
        "text/plain; charset=utf-8",
        &[],
        body.as_bytes(),
    )
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

/// Read and discard what the client already sent, so closing the socket does
/// not reset the connection before the client reads the response.
fn drain(stream: &mut TcpStream) {
    if stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .is_err()
    {
        return;
    }
    let _ = std::io::copy(
        &mut stream.take(MAX_REQUEST_BYTES as u64 * 4),
        &mut std::io::sink(),
    );
}

/// Keep only printable ASCII so recognised text cannot break the header block.
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
}

impl HttpRequest {
    fn query(&self) -> &str {
        self.raw_path
            .split_once('?')
            .map(|(_, query)| query)
            .unwrap_or("")
    }
}
