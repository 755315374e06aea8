use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use webcam_server::api::{ApiConfig, ApiServer};
use webcam_server::capture::SupervisorConfig;
use webcam_server::detect::IntensityClassifier;
use webcam_server::pipeline::{encode_jpeg, NoopRecognizer};
use webcam_server::{
    CaptureStatus, CaptureSupervisor, FrameCache, Orchestrator, PipelineSettings, SourceOptions,
    VideoSource, VideoSourceDescriptor,
};

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn request(addr: SocketAddr, method: &str, target: &str) -> Response {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    write!(
        stream,
        "{method} {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )
    .expect("write request");
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let body = raw[split + 4..].to_vec();
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    Response {
        status,
        headers,
        body,
    }
}

fn orchestrator(cache: &FrameCache) -> Orchestrator {
    Orchestrator::new(
        cache.clone(),
        Arc::new(IntensityClassifier::new((24, 8), 200)),
        Arc::new(NoopRecognizer),
        PipelineSettings::default(),
    )
}

fn loopback() -> ApiConfig {
    ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        ..ApiConfig::default()
    }
}

#[test]
fn serves_cached_frames_and_errors() {
    let cache = FrameCache::new();
    let api = ApiServer::new(
        loopback(),
        orchestrator(&cache),
        Arc::new(CaptureStatus::new()),
    )
    .spawn()
    .expect("spawn api");

    let unavailable = request(api.addr, "GET", "/");
    assert_eq!(unavailable.status, 503);
    assert_eq!(unavailable.body, b"Failed to grab frame from camera.");

    let frame = RgbImage::from_pixel(160, 120, Rgb([30, 60, 90]));
    cache.publish(frame.clone());
    let expected = encode_jpeg(&frame, 90).expect("encode");

    let plain = request(api.addr, "GET", "/");
    assert_eq!(plain.status, 200);
    assert_eq!(plain.header("Content-Type"), Some("image/jpeg"));
    assert_eq!(plain.header("X-Frame-Sequence"), Some("1"));
    assert_eq!(plain.body, expected);

    // Nothing bright to detect, so cropping falls back to the original frame.
    let cropped = request(api.addr, "GET", "/frame.jpg?detect=1&crop=1");
    assert_eq!(cropped.status, 200);
    assert_eq!(cropped.body, expected);
    assert_eq!(cropped.header("X-Recognized-Text"), None);

    let health = request(api.addr, "GET", "/health");
    assert_eq!(health.status, 200);
    let json: serde_json::Value = serde_json::from_slice(&health.body).expect("health json");
    assert_eq!(json["state"], "disconnected");
    assert_eq!(json["sequence"], 1);

    assert_eq!(request(api.addr, "GET", "/missing").status, 404);
    assert_eq!(request(api.addr, "POST", "/").status, 405);

    api.stop().expect("stop api");
}

#[test]
fn oversized_request_is_rejected() {
    let cache = FrameCache::new();
    let api = ApiServer::new(
        loopback(),
        orchestrator(&cache),
        Arc::new(CaptureStatus::new()),
    )
    .spawn()
    .expect("spawn api");

    let mut stream = TcpStream::connect(api.addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    let padding = "a".repeat(9000);
    write!(stream, "GET /?pad={padding} HTTP/1.1\r\n\r\n").expect("write request");
    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw);
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 413"));

    api.stop().expect("stop api");
}

#[test]
fn end_to_end_with_synthetic_source() {
    let cache = FrameCache::new();
    let source = VideoSource::new(
        VideoSourceDescriptor::Remote {
            uri: "stub://bench?size=160x120".to_string(),
        },
        SourceOptions::default(),
    );
    let supervisor = CaptureSupervisor::new(source, cache.clone(), SupervisorConfig::default())
        .spawn()
        .expect("spawn supervisor");
    let api = ApiServer::new(loopback(), orchestrator(&cache), supervisor.status())
        .spawn()
        .expect("spawn api");

    let start = Instant::now();
    while cache.sequence() == 0 && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(cache.sequence() > 0, "no frame captured");

    let response = request(api.addr, "GET", "/?detect=1");
    assert_eq!(response.status, 200);
    let sequence: u64 = response
        .header("X-Frame-Sequence")
        .and_then(|value| value.parse().ok())
        .expect("sequence header");
    assert!(sequence >= 1);
    let decoded = image::load_from_memory(&response.body).expect("decode jpeg");
    assert_eq!((decoded.width(), decoded.height()), (160, 120));

    let cropped = request(api.addr, "GET", "/?detect=1&crop=1");
    assert_eq!(cropped.status, 200);
    let decoded = image::load_from_memory(&cropped.body).expect("decode jpeg");
    assert!(decoded.width() <= 640 && decoded.height() <= 480);

    let health = request(api.addr, "GET", "/health");
    let json: serde_json::Value = serde_json::from_slice(&health.body).expect("health json");
    assert_eq!(json["state"], "streaming");

    api.stop().expect("stop api");
    supervisor.stop().expect("stop supervisor");
    assert!(!cache.is_live());
}

#[test]
fn busy_workers_refuse_extra_connections() {
    let cache = FrameCache::new();
    let config = ApiConfig {
        workers: 1,
        queue: 0,
        ..loopback()
    };
    let api = ApiServer::new(
        config,
        orchestrator(&cache),
        Arc::new(CaptureStatus::new()),
    )
    .spawn()
    .expect("spawn api");
    std::thread::sleep(Duration::from_millis(200));

    // Occupies the only worker: it waits for a request line that never comes.
    let idle = TcpStream::connect(api.addr).expect("connect idle client");
    std::thread::sleep(Duration::from_millis(300));

    let refused = request(api.addr, "GET", "/health");
    assert_eq!(refused.status, 503);
    assert_eq!(refused.header("Retry-After"), Some("1"));
    assert_eq!(refused.body, b"server busy");

    drop(idle);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(request(api.addr, "GET", "/health").status, 200);

    api.stop().expect("stop api");
}
