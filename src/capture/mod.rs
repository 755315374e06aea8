//! Capture supervisor.
//!
//! The supervisor runs on its own thread, owns the capture handle exclusively,
//! and is the only writer of the `FrameCache`. It loops:
//!
//! 1. No handle: open one (`Connecting`). On failure stay `Disconnected` and
//!    retry after a backoff delay.
//! 2. Handle open (`Streaming`): read a frame and publish it.
//! 3. Read failure (`Degraded`): close and discard the handle, back off, reopen.
//!
//! Source failures never leave this module. Request handlers only observe
//! them as a stale or empty cache, and through `CaptureStatus`.

mod backoff;

pub use backoff::{Backoff, BackoffPolicy};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::FrameCache;
use crate::ingest::{CaptureHandle, FrameSource};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Disconnected,
    Connecting,
    Streaming,
    Degraded,
}

impl CaptureState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Streaming => 2,
            Self::Degraded => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Degraded,
            _ => Self::Disconnected,
        }
    }
}

/// Supervisor state and counters, readable from any thread.
#[derive(Debug)]
pub struct CaptureStatus {
    state: AtomicU8,
    frames_captured: AtomicU64,
    reconnects: AtomicU64,
    open_failures: AtomicU64,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct CaptureStats {
    pub state: CaptureState,
    pub frames_captured: u64,
    pub reconnects: u64,
    pub open_failures: u64,
}

impl CaptureStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CaptureState::Disconnected.as_u8()),
            frames_captured: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            state: self.state(),
            frames_captured: self.frames_captured.load(Ordering::SeqCst),
            reconnects: self.reconnects.load(Ordering::SeqCst),
            open_failures: self.open_failures.load(Ordering::SeqCst),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SupervisorConfig {
    pub backoff: BackoffPolicy,
    /// Consecutive failed attempts (open or read) before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

pub struct CaptureSupervisor<S: FrameSource> {
    source: S,
    cache: FrameCache,
    config: SupervisorConfig,
    status: Arc<CaptureStatus>,
}

impl<S: FrameSource + 'static> CaptureSupervisor<S> {
    pub fn new(source: S, cache: FrameCache, config: SupervisorConfig) -> Self {
        Self {
            source,
            cache,
            config,
            status: Arc::new(CaptureStatus::new()),
        }
    }

    pub fn status(&self) -> Arc<CaptureStatus> {
        self.status.clone()
    }

    /// Start the capture loop on a dedicated thread.
    pub fn spawn(self) -> Result<SupervisorHandle> {
        let status = self.status.clone();
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name("capture-supervisor".into())
            .spawn(move || self.run(shutdown_rx))
            .context("failed to spawn capture supervisor thread")?;
        Ok(SupervisorHandle {
            status,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    /// Run the capture loop on the current thread until `shutdown` fires or is dropped.
    pub fn run(mut self, shutdown: Receiver<()>) {
        let source_name = self.source.name();
        let mut handle: Option<S::Handle> = None;
        let mut backoff = Backoff::new(self.config.backoff);
        let mut failed_attempts = 0u32;
        let mut last_health_log = Instant::now();

        log::info!("capture supervisor started for {}", source_name);

        loop {
            if shutdown_requested(&shutdown) {
                break;
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                let stats = self.status.stats();
                log::info!(
                    "capture health state={:?} frames={} reconnects={} open_failures={} source={}",
                    stats.state,
                    stats.frames_captured,
                    stats.reconnects,
                    stats.open_failures,
                    source_name
                );
                last_health_log = Instant::now();
            }

            if handle.is_none() {
                self.set_state(CaptureState::Connecting);
                match self.source.open() {
                    Ok(opened) => {
                        log::info!("capture source {} opened", source_name);
                        handle = Some(opened);
                        self.set_state(CaptureState::Streaming);
                    }
                    Err(err) => {
                        self.status.open_failures.fetch_add(1, Ordering::SeqCst);
                        self.set_state(CaptureState::Disconnected);
                        failed_attempts = failed_attempts.saturating_add(1);
                        if self.attempts_exhausted(failed_attempts) {
                            log::error!(
                                "capture source {} unavailable after {} attempts: {}",
                                source_name,
                                failed_attempts,
                                err
                            );
                            break;
                        }
                        let delay = backoff.next_delay();
                        log::warn!("{}; retrying in {:?}", err, delay);
                        if wait_for_shutdown(&shutdown, delay) {
                            break;
                        }
                    }
                }
                continue;
            }
            let Some(active) = handle.as_mut() else {
                continue;
            };

            match active.read_frame() {
                Ok(image) => {
                    self.cache.publish(image);
                    self.status.frames_captured.fetch_add(1, Ordering::SeqCst);
                    if failed_attempts > 0 {
                        log::info!("capture source {} recovered", source_name);
                        failed_attempts = 0;
                        backoff.reset();
                    }
                    if self.status.state() != CaptureState::Streaming {
                        self.set_state(CaptureState::Streaming);
                    }
                }
                Err(err) => {
                    self.set_state(CaptureState::Degraded);
                    if let Some(mut failed) = handle.take() {
                        failed.close();
                    }
                    self.status.reconnects.fetch_add(1, Ordering::SeqCst);
                    failed_attempts = failed_attempts.saturating_add(1);
                    if self.attempts_exhausted(failed_attempts) {
                        log::error!(
                            "capture source {} failed {} consecutive times, giving up: {}",
                            source_name,
                            failed_attempts,
                            err
                        );
                        break;
                    }
                    let delay = backoff.next_delay();
                    log::warn!("{}; reconnecting in {:?}", err, delay);
                    if wait_for_shutdown(&shutdown, delay) {
                        break;
                    }
                }
            }
        }

        if let Some(mut active) = handle.take() {
            active.close();
        }
        self.set_state(CaptureState::Disconnected);
        self.cache.mark_stopped();
        log::info!("capture supervisor stopped for {}", source_name);
    }

    fn attempts_exhausted(&self, failed_attempts: u32) -> bool {
        self.config
            .max_reconnect_attempts
            .is_some_and(|max| failed_attempts >= max)
    }

    fn set_state(&self, state: CaptureState) {
        let previous =
            CaptureState::from_u8(self.status.state.swap(state.as_u8(), Ordering::SeqCst));
        if previous != state {
            log::debug!("capture state {:?} -> {:?}", previous, state);
        }
    }
}

/// Handle to a running supervisor thread.
#[derive(Debug)]
pub struct SupervisorHandle {
    status: Arc<CaptureStatus>,
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn status(&self) -> Arc<CaptureStatus> {
        self.status.clone()
    }

    /// Signal shutdown and wait for the handle to be released.
    pub fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("capture supervisor thread panicked"))?;
        }
        Ok(())
    }
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    match shutdown.try_recv() {
        Ok(()) | Err(TryRecvError::Disconnected) => true,
        Err(TryRecvError::Empty) => false,
    }
}

fn wait_for_shutdown(shutdown: &Receiver<()>, delay: Duration) -> bool {
    if delay.is_zero() {
        return shutdown_requested(shutdown);
    }
    match shutdown.recv_timeout(delay) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted source: each entry is one open attempt.
    /// `Err(())` fails the open; `Ok(n)` opens a handle that yields `n` frames then fails.
    struct ScriptedSource {
        script: VecDeque<Result<usize, ()>>,
        closes: Arc<Mutex<usize>>,
    }

    struct ScriptedHandle {
        remaining: usize,
        closes: Arc<Mutex<usize>>,
        closed: bool,
    }

    impl CaptureHandle for ScriptedHandle {
        fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
            if self.remaining == 0 {
                return Err(SourceError::read("scripted", "end of script"));
            }
            self.remaining -= 1;
            Ok(RgbImage::new(2, 2))
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                *self.closes.lock().unwrap() += 1;
            }
        }
    }

    impl FrameSource for ScriptedSource {
        type Handle = ScriptedHandle;

        fn open(&mut self) -> Result<ScriptedHandle, SourceError> {
            match self.script.pop_front() {
                Some(Ok(frames)) => Ok(ScriptedHandle {
                    remaining: frames,
                    closes: self.closes.clone(),
                    closed: false,
                }),
                _ => Err(SourceError::open("scripted", "unavailable")),
            }
        }

        fn name(&self) -> String {
            "scripted".to_string()
        }
    }

    fn fast_config(max_attempts: Option<u32>) -> SupervisorConfig {
        SupervisorConfig {
            backoff: BackoffPolicy {
                initial: Duration::ZERO,
                max: Duration::ZERO,
            },
            max_reconnect_attempts: max_attempts,
        }
    }

    #[test]
    fn gives_up_after_max_attempts_and_stops_cache() {
        let closes = Arc::new(Mutex::new(0));
        let source = ScriptedSource {
            script: VecDeque::from(vec![Ok(3), Err(()), Err(())]),
            closes: closes.clone(),
        };
        let cache = FrameCache::new();
        let supervisor = CaptureSupervisor::new(source, cache.clone(), fast_config(Some(3)));
        let status = supervisor.status();
        let (_tx, rx) = mpsc::channel();

        supervisor.run(rx);

        let stats = status.stats();
        assert_eq!(stats.frames_captured, 3);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.open_failures, 2);
        assert_eq!(stats.state, CaptureState::Disconnected);
        assert_eq!(cache.sequence(), 3);
        assert!(!cache.is_live());
        assert_eq!(*closes.lock().unwrap(), 1);
    }

    #[test]
    fn successful_read_resets_attempt_counter() {
        let source = ScriptedSource {
            script: VecDeque::from(vec![Err(()), Ok(1), Ok(1), Err(()), Err(())]),
            closes: Arc::new(Mutex::new(0)),
        };
        let cache = FrameCache::new();
        let supervisor = CaptureSupervisor::new(source, cache.clone(), fast_config(Some(2)));
        let status = supervisor.status();
        let (_tx, rx) = mpsc::channel();

        supervisor.run(rx);

        assert_eq!(status.stats().frames_captured, 2);
        assert_eq!(cache.sequence(), 2);
    }

    #[test]
    fn dropped_shutdown_sender_stops_loop() {
        let source = ScriptedSource {
            script: VecDeque::new(),
            closes: Arc::new(Mutex::new(0)),
        };
        let supervisor = CaptureSupervisor::new(source, FrameCache::new(), fast_config(None));
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        supervisor.run(rx);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            CaptureState::Disconnected,
            CaptureState::Connecting,
            CaptureState::Streaming,
            CaptureState::Degraded,
        ] {
            assert_eq!(CaptureState::from_u8(state.as_u8()), state);
        }
    }
}
