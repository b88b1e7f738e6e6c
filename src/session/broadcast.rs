//! Broadcast session
//!
//! One encoder, one extractor, one GOP cache and a dynamic set of
//! subscribers. A pump task owns the encoder and moves its output to every
//! subscriber:
//!
//! ```text
//!   ChunkStream ──► UnitExtractor ──► [ lock ─ GopCache.observe ─ queue.push × N ─ unlock ]
//! ```
//!
//! Cache update and fan-out happen in the same critical section that
//! `subscribe` uses to take its snapshot, so a unit is never delivered to a
//! subscriber twice or skipped between snapshot and live stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::process::ExitStatus;
use std::time::SystemTime;

use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use super::config::SessionConfig;
use super::error::SessionError;
use super::state::{SessionState, SessionStatus, StopCause};
use super::subscriber::{SubscriberQueue, Subscription};
use crate::encoder::{ChunkStream, EncoderCommand, EncoderError, EncoderSource, StreamConfig};
use crate::media::{CodedUnit, GopCache, UnitExtractor};
use crate::stats::{SessionCounters, SessionStats};

/// Everything guarded by the fan-out lock
#[derive(Debug)]
struct Fanout {
    cache: GopCache,
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
    next_subscriber_id: u64,
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    id: String,
    stream: StreamConfig,
    config: SessionConfig,
    created_at: SystemTime,
    state: SessionState,
    fanout: Mutex<Fanout>,
    counters: SessionCounters,
    shutdown: Notify,
    /// Encoder until it has been reaped
    encoder: AsyncMutex<Option<EncoderSource>>,
    encoder_pid: Option<u32>,
    pump: Mutex<Option<JoinHandle<()>>>,
    teardown_claimed: AtomicBool,
}

impl SessionInner {
    fn new(
        id: String,
        stream: StreamConfig,
        config: SessionConfig,
        encoder: Option<EncoderSource>,
    ) -> Self {
        let encoder_pid = encoder.as_ref().and_then(EncoderSource::pid);
        let cache = GopCache::with_config(config.gop);
        Self {
            id,
            stream,
            config,
            created_at: SystemTime::now(),
            state: SessionState::new(),
            fanout: Mutex::new(Fanout {
                cache,
                subscribers: HashMap::new(),
                next_subscriber_id: 1,
            }),
            counters: SessionCounters::new(),
            shutdown: Notify::new(),
            encoder: AsyncMutex::new(encoder),
            encoder_pid,
            pump: Mutex::new(None),
            teardown_claimed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn lock_fanout(&self) -> MutexGuard<'_, Fanout> {
        self.fanout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn parameter_sets(&self) -> Vec<CodedUnit> {
        self.lock_fanout().cache.parameter_sets()
    }

    pub(crate) fn remove_subscriber(&self, subscriber: u64) {
        let mut fanout = self.lock_fanout();
        if fanout.subscribers.remove(&subscriber).is_some() {
            let remaining = fanout.subscribers.len();
            drop(fanout);
            tracing::info!(
                session = %self.id,
                subscriber = subscriber,
                subscribers = remaining,
                "Subscriber removed"
            );
        }
    }

    /// Cache and fan out one batch of units
    fn distribute(&self, units: Vec<CodedUnit>) {
        if units.is_empty() {
            return;
        }

        let mut fanout = self.lock_fanout();
        for unit in units {
            self.counters.record_unit(&unit);
            fanout.cache.observe(&unit);

            for (&subscriber, queue) in &fanout.subscribers {
                if queue.push(unit.clone()) {
                    self.counters.record_drop();
                    tracing::debug!(
                        session = %self.id,
                        subscriber = subscriber,
                        "Subscriber queue full, dropped oldest unit"
                    );
                }
            }
        }
    }

    /// Stop the encoder within the grace period and reap it
    ///
    /// Returns `None` if the session never had an encoder.
    async fn stop_encoder(&self) -> Option<Result<ExitStatus, EncoderError>> {
        let mut slot = self.encoder.lock().await;
        Some(slot.as_mut()?.stop(self.config.stop_grace_period).await)
    }

    /// Kill and reap an encoder left behind by an aborted pump
    async fn kill_encoder(&self) {
        let Some(mut encoder) = self.encoder.lock().await.take() else {
            return;
        };
        if encoder.exit_status().is_some() {
            return;
        }
        match encoder.kill().await {
            Ok(status) => {
                tracing::info!(session = %self.id, status = %status, "Encoder killed")
            }
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Failed to reap killed encoder")
            }
        }
    }

    fn stderr_tail(&self) -> Vec<String> {
        match self.encoder.try_lock() {
            Ok(slot) => slot.as_ref().map(EncoderSource::stderr_tail).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Close every queue and mark the session stopped
    fn finish(&self) {
        self.state.advance(SessionStatus::Stopping);

        let queues: Vec<_> = self
            .lock_fanout()
            .subscribers
            .drain()
            .map(|(_, queue)| queue)
            .collect();
        for queue in &queues {
            queue.close();
        }

        if self.state.advance(SessionStatus::Stopped) {
            let cause = self.state.cause();
            tracing::info!(
                session = %self.id,
                cause = ?cause,
                closed_subscribers = queues.len(),
                "Session stopped"
            );
        }
    }
}

/// Handle to a running broadcast session
///
/// Cheap to clone; all clones refer to the same session.
#[derive(Debug, Clone)]
pub struct BroadcastSession {
    inner: Arc<SessionInner>,
}

impl BroadcastSession {
    /// Spawn the encoder and start the pump
    ///
    /// Returns as soon as the process is running; the session is `Starting`
    /// until the first output arrives. Must be called inside a tokio runtime.
    pub fn start(
        id: impl Into<String>,
        stream: StreamConfig,
        command: &EncoderCommand,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let id = id.into();

        let mut encoder = EncoderSource::start(command, config.chunk_channel_capacity).map_err(
            |e| SessionError::StartupFailure {
                session: id.clone(),
                reason: e.to_string(),
            },
        )?;
        let chunks = encoder
            .chunks()
            .ok_or_else(|| SessionError::StartupFailure {
                session: id.clone(),
                reason: "encoder output already taken".into(),
            })?;

        let inner = Arc::new(SessionInner::new(id, stream, config, Some(encoder)));
        let handle = tokio::spawn(run_pump(Arc::clone(&inner), chunks));
        *inner.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(
            session = %inner.id,
            resolution = %inner.stream.resolution(),
            framerate = inner.stream.framerate,
            "Session starting"
        );

        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.inner.stream
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    /// OS process id of the encoder
    pub fn encoder_pid(&self) -> Option<u32> {
        self.inner.encoder_pid
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.status()
    }

    /// Receiver notified on every status change
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.inner.state.watch()
    }

    /// Why the session ended, once it has
    pub fn stop_cause(&self) -> Option<StopCause> {
        self.inner.state.cause()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock_fanout().subscribers.len()
    }

    /// Units a late joiner would receive right now
    pub fn cached_units(&self) -> usize {
        self.inner.lock_fanout().cache.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.counters.snapshot()
    }

    /// Attach a new viewer
    ///
    /// While the session is `Starting` this waits for the first encoder
    /// output, at most `startup_timeout`.
    pub async fn subscribe(&self) -> Result<Subscription, SessionError> {
        if self.status() == SessionStatus::Starting {
            let mut rx = self.inner.state.watch();
            let started = tokio::time::timeout(self.inner.config.startup_timeout, async move {
                rx.wait_for(|status| *status != SessionStatus::Starting)
                    .await
                    .is_ok()
            })
            .await;

            if started.is_err() {
                return Err(SessionError::StartupFailure {
                    session: self.inner.id.clone(),
                    reason: "timed out waiting for encoder output".into(),
                });
            }
        }

        self.try_subscribe()
    }

    /// Attach a new viewer without waiting
    pub fn try_subscribe(&self) -> Result<Subscription, SessionError> {
        let inner = &self.inner;
        let mut fanout = inner.lock_fanout();

        match inner.state.status() {
            SessionStatus::Streaming => {}
            SessionStatus::Starting => {
                return Err(SessionError::StartupFailure {
                    session: inner.id.clone(),
                    reason: "encoder has not produced output yet".into(),
                });
            }
            SessionStatus::Stopping | SessionStatus::Stopped => {
                return Err(match inner.state.cause() {
                    Some(StopCause::StartupFailure { reason }) => SessionError::StartupFailure {
                        session: inner.id.clone(),
                        reason,
                    },
                    _ => SessionError::SessionStopping(inner.id.clone()),
                });
            }
        }

        let snapshot = fanout.cache.snapshot();
        let late_join_units = snapshot.len();
        let gated = snapshot.is_empty();

        let queue = Arc::new(SubscriberQueue::new(
            inner.config.subscriber_queue_capacity + late_join_units,
        ));
        for unit in snapshot {
            queue.push(unit);
        }

        let subscriber = fanout.next_subscriber_id;
        fanout.next_subscriber_id += 1;
        fanout.subscribers.insert(subscriber, Arc::clone(&queue));
        let total = fanout.subscribers.len();
        drop(fanout);

        inner.counters.record_subscriber();
        tracing::info!(
            session = %inner.id,
            subscriber = subscriber,
            subscribers = total,
            late_join_units = late_join_units,
            gated = gated,
            "Subscriber added"
        );

        Ok(Subscription::new(
            subscriber,
            queue,
            Arc::clone(inner),
            gated,
        ))
    }

    /// Stop the session
    ///
    /// Idempotent. Waits up to `stop_grace_period + teardown_margin` for the
    /// pump; past that the pump is aborted and the encoder is killed and
    /// reaped before the session reports `Stopped`.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let deadline = inner.config.stop_deadline();

        if inner.state.advance(SessionStatus::Stopping) {
            inner.state.set_cause(StopCause::Requested);
            tracing::info!(session = %inner.id, "Stopping session");
        }

        if inner.teardown_claimed.swap(true, Ordering::AcqRel) {
            // Someone else is tearing down
            if tokio::time::timeout(deadline, self.wait_stopped())
                .await
                .is_err()
            {
                tracing::warn!(session = %inner.id, "Timed out waiting for concurrent stop");
            }
            return;
        }

        inner.shutdown.notify_one();

        let pump = inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(deadline, &mut pump).await.is_err() {
                tracing::warn!(
                    session = %inner.id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Session pump did not finish in time, aborting"
                );
                pump.abort();
                // Resolves once the pump future has been dropped
                let _ = pump.await;
            }
        }

        inner.kill_encoder().await;
        inner.finish();
    }

    /// Wait until the session reaches `Stopped`
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.state.watch();
        let _ = rx
            .wait_for(|status| *status == SessionStatus::Stopped)
            .await;
    }
}

enum PumpEnd {
    Requested,
    StartupTimeout,
    EncoderEof,
}

async fn run_pump(inner: Arc<SessionInner>, mut chunks: ChunkStream) {
    let mut extractor = UnitExtractor::with_max_unit_size(inner.config.max_unit_bytes);
    let startup = tokio::time::sleep(inner.config.startup_timeout);
    tokio::pin!(startup);
    let mut streaming = false;

    let end = loop {
        tokio::select! {
            biased;

            _ = inner.shutdown.notified() => break PumpEnd::Requested,

            _ = &mut startup, if !streaming => break PumpEnd::StartupTimeout,

            chunk = chunks.next() => match chunk {
                Some(chunk) => {
                    if !streaming {
                        streaming = true;
                        inner.state.advance(SessionStatus::Streaming);
                        tracing::info!(
                            session = %inner.id,
                            pid = ?inner.encoder_pid,
                            "Session streaming"
                        );
                    }
                    inner.counters.record_chunk(chunk.len());
                    inner.distribute(extractor.push(&chunk));
                }
                None => break PumpEnd::EncoderEof,
            },
        }
    };

    if let PumpEnd::StartupTimeout = end {
        inner.state.set_cause(StopCause::StartupFailure {
            reason: format!(
                "no encoder output within {}ms",
                inner.config.startup_timeout.as_millis()
            ),
        });
    }
    inner.state.advance(SessionStatus::Stopping);

    if let PumpEnd::EncoderEof = end {
        if let Some(unit) = extractor.flush() {
            inner.distribute(vec![unit]);
        }
    }

    let exit = inner.stop_encoder().await;
    let stderr = inner.stderr_tail();
    let code = match &exit {
        Some(Ok(status)) => status.code(),
        Some(Err(e)) => {
            tracing::warn!(session = %inner.id, error = %e, "Failed to reap encoder");
            None
        }
        None => None,
    };

    match end {
        PumpEnd::Requested => {}
        PumpEnd::StartupTimeout => {
            tracing::warn!(
                session = %inner.id,
                stderr = ?stderr,
                "Encoder produced no output before the startup timeout"
            );
        }
        PumpEnd::EncoderEof if !streaming => {
            let reason = match &exit {
                Some(Ok(status)) => {
                    format!("encoder exited before producing output ({})", status)
                }
                _ => "encoder exited before producing output".to_string(),
            };
            tracing::warn!(
                session = %inner.id,
                stderr = ?stderr,
                "{}",
                reason
            );
            inner.state.set_cause(StopCause::StartupFailure { reason });
        }
        PumpEnd::EncoderEof => {
            tracing::info!(
                session = %inner.id,
                code = ?code,
                discarded_bytes = extractor.discarded_bytes(),
                "Encoder output ended"
            );
            inner.state.set_cause(StopCause::EncoderExited { code });
        }
    }

    inner.finish();
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::media::GopCacheConfig;

    fn sps() -> CodedUnit {
        CodedUnit::from_nal(&[0x67, 0x42, 0x00, 0x1f])
    }
    fn pps() -> CodedUnit {
        CodedUnit::from_nal(&[0x68, 0xce, 0x3c, 0x80])
    }
    fn idr(tag: u8) -> CodedUnit {
        CodedUnit::from_nal(&[0x65, 0x88, tag])
    }
    fn delta(tag: u8) -> CodedUnit {
        CodedUnit::from_nal(&[0x41, 0x9a, tag])
    }
    fn aud() -> CodedUnit {
        CodedUnit::from_nal(&[0x09, 0xf0])
    }

    /// Session without an encoder, fed by the test
    fn detached(config: SessionConfig) -> BroadcastSession {
        let inner = SessionInner::new("test".into(), StreamConfig::default(), config, None);
        BroadcastSession {
            inner: Arc::new(inner),
        }
    }

    fn streaming(config: SessionConfig) -> BroadcastSession {
        let session = detached(config);
        session.inner.state.advance(SessionStatus::Streaming);
        session
    }

    fn feed(session: &BroadcastSession, units: &[CodedUnit]) {
        session.inner.distribute(units.to_vec());
    }

    fn drain(subscription: &mut Subscription) -> Vec<CodedUnit> {
        std::iter::from_fn(|| subscription.try_recv()).collect()
    }

    /// Units as a `printf` format string of octal escapes
    fn escape(units: &[CodedUnit]) -> String {
        units
            .iter()
            .flat_map(|u| u.payload().iter())
            .map(|b| format!("\\{:03o}", b))
            .collect()
    }

    fn sh(script: String) -> EncoderCommand {
        EncoderCommand::new("sh", ["-c".to_string(), script])
    }

    /// `sh` script that writes the units, then runs `tail`
    fn script(units: &[CodedUnit], tail: &str) -> EncoderCommand {
        sh(format!("printf '{}'; {}", escape(units), tail))
    }

    /// Whether `pid` names a live (non-zombie) process
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            Ok(status) => !status
                .lines()
                .any(|line| line.starts_with("State:") && line.contains('Z')),
            Err(_) => false,
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
            .startup_timeout(Duration::from_secs(5))
            .stop_grace_period(Duration::from_secs(2))
            .teardown_margin(Duration::from_millis(500))
    }

    #[test]
    fn test_late_join_gets_snapshot_then_live() {
        let session = streaming(SessionConfig::default());
        feed(&session, &[sps(), pps(), idr(1), delta(1), delta(2)]);

        let mut sub = session.try_subscribe().unwrap();
        feed(&session, &[delta(3)]);

        assert_eq!(
            drain(&mut sub),
            vec![sps(), pps(), idr(1), delta(1), delta(2), delta(3)]
        );
    }

    #[test]
    fn test_all_subscribers_see_same_order() {
        let session = streaming(SessionConfig::default());
        feed(&session, &[sps(), pps(), idr(1)]);

        let mut early = session.try_subscribe().unwrap();
        feed(&session, &[delta(1), delta(2)]);
        let mut late = session.try_subscribe().unwrap();
        feed(&session, &[idr(2), delta(3)]);

        let expected = vec![sps(), pps(), idr(1), delta(1), delta(2), idr(2), delta(3)];

        assert_eq!(drain(&mut early), expected);
        // Snapshot and live stream join without gap or duplicate
        assert_eq!(drain(&mut late), expected);
    }

    #[test]
    fn test_join_before_key_unit_is_gated() {
        let session = streaming(SessionConfig::default());
        feed(&session, &[sps(), pps(), delta(1)]);

        let mut sub = session.try_subscribe().unwrap();
        feed(&session, &[aud(), delta(2), idr(1), delta(3)]);

        // Slices before the key unit are skipped, cached parameter sets
        // are replayed in front of it
        assert_eq!(drain(&mut sub), vec![sps(), pps(), idr(1), delta(3)]);
    }

    #[test]
    fn test_gated_subscriber_keeps_live_parameter_sets() {
        let session = streaming(SessionConfig::default());

        let mut sub = session.try_subscribe().unwrap();
        feed(&session, &[delta(1), sps(), pps(), idr(1)]);

        assert_eq!(drain(&mut sub), vec![sps(), pps(), idr(1)]);
    }

    #[test]
    fn test_slow_subscriber_drops_oldest_without_blocking_others() {
        let session = streaming(SessionConfig::default().subscriber_queue_capacity(4));
        let mut fast = session.try_subscribe().unwrap();
        let mut slow = session.try_subscribe().unwrap();

        let mut fast_units = Vec::new();
        feed(&session, &[idr(1)]);
        fast_units.extend(drain(&mut fast));
        for tag in 1..=10 {
            feed(&session, &[delta(tag)]);
            fast_units.extend(drain(&mut fast));
        }

        assert_eq!(fast_units.len(), 11);
        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 7);
        assert_eq!(session.stats().units_dropped, 7);

        // The surviving slices follow a gap and are not decodable
        assert!(drain(&mut slow).is_empty());

        feed(&session, &[idr(2), delta(11)]);
        assert_eq!(drain(&mut slow), vec![idr(2), delta(11)]);
    }

    #[test]
    fn test_overflow_resync_replays_parameter_sets() {
        let session = streaming(SessionConfig::default().subscriber_queue_capacity(2));
        feed(&session, &[sps(), pps(), idr(1)]);
        let mut sub = session.try_subscribe().unwrap();
        assert_eq!(drain(&mut sub), vec![sps(), pps(), idr(1)]);

        // Room for the snapshot stays with the queue: 2 + 3 units
        for tag in 1..=6 {
            feed(&session, &[delta(tag)]);
        }
        assert_eq!(sub.dropped(), 1);

        feed(&session, &[idr(2)]);

        assert_eq!(drain(&mut sub), vec![sps(), pps(), idr(2)]);
        assert_eq!(sub.dropped(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unsubscribe_while_fanning_out() {
        let session = streaming(SessionConfig::default().subscriber_queue_capacity(8));
        feed(&session, &[sps(), pps(), idr(0)]);

        let feeder = {
            let session = session.clone();
            tokio::spawn(async move {
                for i in 0..2000u32 {
                    let tag = i as u8;
                    if i % 50 == 0 {
                        feed(&session, &[idr(tag)]);
                    } else {
                        feed(&session, &[delta(tag)]);
                    }
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut viewers = tokio::task::JoinSet::new();
        for round in 0..32 {
            let mut sub = session.try_subscribe().unwrap();
            viewers.spawn(async move {
                for _ in 0..round % 4 {
                    while sub.try_recv().is_some() {}
                    tokio::task::yield_now().await;
                }
                if round % 2 == 0 {
                    sub.unsubscribe();
                }
            });
        }

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(viewer) = viewers.join_next().await {
                viewer.unwrap();
            }
            feeder.await.unwrap();
        })
        .await;

        assert!(finished.is_ok());
        assert_eq!(session.subscriber_count(), 0);
        assert_eq!(session.stats().subscribers_total, 32);
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        let session = streaming(SessionConfig::default());
        let first = session.try_subscribe().unwrap();
        let second = session.try_subscribe().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(session.subscriber_count(), 2);

        drop(first);
        assert_eq!(session.subscriber_count(), 1);

        second.unsubscribe();
        assert_eq!(session.subscriber_count(), 0);
        assert_eq!(session.stats().subscribers_total, 2);
    }

    #[tokio::test]
    async fn test_stop_drains_queue_then_ends() {
        let session = streaming(SessionConfig::default());
        let mut sub = session.try_subscribe().unwrap();
        feed(&session, &[sps(), pps(), idr(1)]);

        session.stop().await;

        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(session.stop_cause(), Some(StopCause::Requested));
        assert_eq!(sub.recv().await, Some(sps()));
        assert_eq!(sub.recv().await, Some(pps()));
        assert_eq!(sub.recv().await, Some(idr(1)));
        assert_eq!(sub.recv().await, None);
        assert!(sub.is_closed());
    }

    #[tokio::test]
    async fn test_subscribe_after_stop_fails() {
        let session = streaming(SessionConfig::default());
        session.stop().await;

        let result = session.subscribe().await;

        assert!(matches!(result, Err(SessionError::SessionStopping(_))));
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_waits_for_streaming() {
        let session = detached(SessionConfig::default());

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.subscribe().await.map(|s| s.id()) })
        };
        tokio::task::yield_now().await;
        assert_eq!(session.status(), SessionStatus::Starting);

        session.inner.state.advance(SessionStatus::Streaming);

        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_times_out_while_starting() {
        let session =
            detached(SessionConfig::default().startup_timeout(Duration::from_millis(50)));

        let result = session.subscribe().await;

        assert!(matches!(result, Err(SessionError::StartupFailure { .. })));
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let session = streaming(SessionConfig::default());

        session.stop().await;
        let started = Instant::now();
        session.stop().await;

        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_gop_cache_limits_apply() {
        let config = SessionConfig::default().gop(GopCacheConfig::default().max_tail_units(2));
        let session = streaming(config);

        feed(&session, &[idr(1), delta(1), delta(2), delta(3)]);

        assert_eq!(session.cached_units(), 3);
        let mut sub = session.try_subscribe().unwrap();
        assert_eq!(drain(&mut sub), vec![idr(1), delta(2), delta(3)]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_encoder_output() {
        let command = script(&[sps(), pps(), idr(1), delta(1)], "exec sleep 30");
        let session =
            BroadcastSession::start("live", StreamConfig::default(), &command, fast_config())
                .unwrap();

        let mut sub = session.subscribe().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Streaming);

        assert_eq!(sub.recv().await, Some(sps()));
        assert_eq!(sub.recv().await, Some(pps()));
        assert_eq!(sub.recv().await, Some(idr(1)));

        session.stop().await;

        // The last unit never saw its end before the stop
        assert_eq!(sub.recv().await, None);
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(session.stop_cause(), Some(StopCause::Requested));
        assert!(session.stats().bytes_received > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_exit_flushes_trailing_unit() {
        let rest = escape(&[sps(), pps(), idr(1), delta(1)]);
        let command = script(&[aud()], &format!("sleep 1; printf '{}'", rest));
        let session =
            BroadcastSession::start("exits", StreamConfig::default(), &command, fast_config())
                .unwrap();

        let mut sub = session.subscribe().await.unwrap();
        let mut received = Vec::new();
        while let Some(unit) = sub.recv().await {
            received.push(unit);
        }

        assert_eq!(received, vec![sps(), pps(), idr(1), delta(1)]);
        session.wait_stopped().await;
        assert_eq!(
            session.stop_cause(),
            Some(StopCause::EncoderExited { code: Some(0) })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_timeout() {
        let command = script(&[], "exec sleep 30");
        let config = fast_config().startup_timeout(Duration::from_millis(200));
        let session =
            BroadcastSession::start("silent", StreamConfig::default(), &command, config).unwrap();

        let result = session.subscribe().await;
        assert!(matches!(result, Err(SessionError::StartupFailure { .. })));

        tokio::time::timeout(Duration::from_secs(5), session.wait_stopped())
            .await
            .unwrap();
        assert!(matches!(
            session.stop_cause(),
            Some(StopCause::StartupFailure { .. })
        ));
        assert!(matches!(
            session.try_subscribe(),
            Err(SessionError::StartupFailure { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_exit_before_output() {
        let command = EncoderCommand::new("sh", ["-c", "exit 1"]);
        let session =
            BroadcastSession::start("dies", StreamConfig::default(), &command, fast_config())
                .unwrap();

        tokio::time::timeout(Duration::from_secs(5), session.wait_stopped())
            .await
            .unwrap();

        match session.stop_cause() {
            Some(StopCause::StartupFailure { reason }) => {
                assert!(reason.contains("before producing output"), "{}", reason)
            }
            other => panic!("unexpected cause: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let command = EncoderCommand::new("/nonexistent/encoder-binary", ["-"]);

        let result =
            BroadcastSession::start("nope", StreamConfig::default(), &command, fast_config());

        assert!(matches!(result, Err(SessionError::StartupFailure { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_stops() {
        let command = script(&[aud()], "exec sleep 30");
        let session =
            BroadcastSession::start("twice", StreamConfig::default(), &command, fast_config())
                .unwrap();
        let _sub = session.subscribe().await.unwrap();

        let started = Instant::now();
        tokio::join!(session.stop(), session.stop());

        assert!(started.elapsed() < fast_config().stop_deadline());
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(session.subscriber_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_bounded_when_encoder_ignores_sigterm() {
        let command = sh(format!(
            "trap '' TERM; printf '{}'; exec sleep 30",
            escape(&[aud()])
        ));
        let config = fast_config()
            .stop_grace_period(Duration::from_millis(200))
            .teardown_margin(Duration::from_millis(500));
        let session =
            BroadcastSession::start("stubborn", StreamConfig::default(), &command, config)
                .unwrap();
        session.subscribe().await.unwrap();

        let started = Instant::now();
        session.stop().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_forced_stop_reaps_encoder_before_stopped() {
        let command = sh(format!(
            "trap '' TERM; printf '{}'; exec sleep 30",
            escape(&[aud()])
        ));
        let config = fast_config()
            .stop_grace_period(Duration::from_millis(300))
            .teardown_margin(Duration::ZERO);
        let session =
            BroadcastSession::start("forced", StreamConfig::default(), &command, config).unwrap();
        session.subscribe().await.unwrap();

        let pid = session.encoder_pid().unwrap();
        assert!(is_running(pid));

        session.stop().await;

        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(!is_running(pid));
    }
}
