//! Pipeline orchestration
//!
//! [`GazePipeline`] wires the stages together:
//!
//! ```text
//! LandmarkFrame -> normalize -> smooth -> scale -> send
//! InferenceResult -> session buffer -> graph
//! ```
//!
//! Session state lives in an explicit [`PipelineContext`] owned by the
//! pipeline. [`PipelineRunner`] drives a pipeline from one task, so every
//! stage is only ever touched from a single context.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::{BufferStrategy, Config, SessionConfig, TrackingConfig};
use crate::error::{ConfigError, SessionError, TrackingError};
use crate::geometry::GeometryNormalizer;
use crate::graph::{ProbabilityGraph, SvgSurface};
use crate::session::{
    AnalysisEntry, SessionBuffer, SessionClient, SessionId, SessionRequest, UserSettings,
};
use crate::smoothing::MetricSmoother;
use crate::tracking::subprocess::TrackerSubprocess;
use crate::tracking::{FrameSize, LandmarkDetector, LandmarkFrame};
use crate::transport::{ConnectionState, InferenceResult, TelemetrySample, TransportHandle};
use crate::{shutdown_requested, AppState, ProbabilityUpdate};

/// Session id and analysis buffer for the current recording
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub session_id: Option<SessionId>,
    pub buffer: SessionBuffer,
}

impl PipelineContext {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            session_id: None,
            buffer: SessionBuffer::new(config.strategy, config.retention),
        }
    }
}

/// Snapshot of the pipeline for the dashboard
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub capture_active: bool,
    pub connection: ConnectionState,
    pub session_id: Option<i64>,
    pub buffered_entries: usize,
    pub latest_probability: Option<f64>,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub samples_sent: u64,
    pub samples_dropped: u64,
    pub alignment: bool,
    pub plotting: bool,
    pub sensitivity: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameStats {
    processed: u64,
    skipped: u64,
    sent: u64,
    dropped: u64,
}

pub struct GazePipeline {
    normalizer: GeometryNormalizer,
    smoother: MetricSmoother,
    smoothing: bool,
    graph: ProbabilityGraph,
    surface: SvgSurface,
    settings: UserSettings,
    session: SessionConfig,
    transport: TransportHandle,
    context: PipelineContext,
    capture_active: bool,
    capture_origin_ms: Option<f64>,
    capture_started_at: Option<DateTime<Utc>>,
    latest_probability: Option<f64>,
    stats: FrameStats,
}

impl GazePipeline {
    pub fn new(config: &Config, transport: TransportHandle) -> Result<Self, ConfigError> {
        let settings = UserSettings {
            affine: config.alignment.enabled,
            plotting: config.graph.enabled,
            ..UserSettings::default()
        };

        Ok(Self {
            normalizer: GeometryNormalizer::new(
                config.alignment.enabled,
                config.alignment.desired_inter_iris_ratio,
            ),
            smoother: MetricSmoother::new(config.smoothing.alpha, config.smoothing.history_capacity)?,
            smoothing: config.smoothing.enabled,
            graph: ProbabilityGraph::new(config.graph.capacity),
            surface: SvgSurface::new(config.graph.width, config.graph.height),
            settings,
            session: config.session.clone(),
            transport,
            context: PipelineContext::new(&config.session),
            capture_active: false,
            capture_origin_ms: None,
            capture_started_at: None,
            latest_probability: None,
            stats: FrameStats::default(),
        })
    }

    /// Apply per-user switches: alignment, graphing, sensitivity and whether
    /// threshold bounds accompany new sessions.
    pub fn apply_settings(&mut self, settings: UserSettings) {
        let mut settings = settings;
        if !settings.sensitivity.is_finite() || settings.sensitivity <= 0.0 {
            tracing::warn!(
                "Ignoring invalid sensitivity {}, keeping {}",
                settings.sensitivity,
                self.settings.sensitivity
            );
            settings.sensitivity = self.settings.sensitivity;
        }

        self.normalizer.set_alignment(settings.affine);
        if !settings.plotting {
            self.clear_graph();
        }
        self.settings = settings;

        tracing::info!(
            "Settings applied (alignment: {}, plotting: {}, min_max: {}, sensitivity: {})",
            settings.affine,
            settings.plotting,
            settings.min_max,
            settings.sensitivity
        );
    }

    pub fn settings(&self) -> UserSettings {
        self.settings
    }

    /// Begin processing frames. The first processed frame becomes time zero.
    pub fn start_capture(&mut self) {
        if self.capture_active {
            return;
        }
        self.capture_active = true;
        self.capture_origin_ms = None;
        self.capture_started_at = Some(Utc::now());
        self.smoother.reset();
        tracing::info!("Capture started");
    }

    /// Stop processing frames. The transport and buffered entries are left
    /// untouched.
    pub fn stop_capture(&mut self) {
        if !self.capture_active {
            return;
        }
        self.capture_active = false;
        tracing::info!(
            "Capture stopped ({} frames, {} skipped, {} samples sent, {} dropped)",
            self.stats.processed,
            self.stats.skipped,
            self.stats.sent,
            self.stats.dropped
        );
    }

    pub fn capture_active(&self) -> bool {
        self.capture_active
    }

    /// Turn one landmark frame into a sample and send it. Returns `None` when
    /// capture is stopped or the frame was skipped.
    pub fn process_frame(&mut self, frame: &LandmarkFrame, size: FrameSize) -> Option<TelemetrySample> {
        if !self.capture_active {
            return None;
        }

        let metric = match self.normalizer.normalize(frame, size) {
            Ok(metric) => metric,
            Err(e) => {
                self.stats.skipped += 1;
                tracing::debug!("Skipping frame: {}", e);
                return None;
            }
        };
        self.stats.processed += 1;

        let metric = if self.smoothing {
            self.smoother.smooth(metric)
        } else {
            metric
        };
        let metric = metric.scaled(self.settings.sensitivity);

        let origin = *self.capture_origin_ms.get_or_insert(metric.timestamp_ms);
        let sample = TelemetrySample::from_metric(&metric, origin);

        if self.transport.send(&sample) {
            self.stats.sent += 1;
            self.context.buffer.record_sample(sample, self.context.session_id);
        } else {
            self.stats.dropped += 1;
        }

        Some(sample)
    }

    /// Record an inbound result and update the graph
    pub fn handle_inference(&mut self, result: &InferenceResult) -> Option<AnalysisEntry> {
        match result.probability() {
            Some(p) => {
                self.latest_probability = Some(p);
                if self.settings.plotting {
                    self.graph.update(p, &mut self.surface);
                }
            }
            None => tracing::debug!("Inference result carries no probability"),
        }

        self.context.buffer.on_inference(result)
    }

    /// Session metadata for a create call made at `now`. Eager sessions
    /// cover the planned duration ahead; retro sessions cover the capture
    /// that already happened.
    pub fn session_request(&self, now: DateTime<Utc>) -> SessionRequest {
        let (start, end) = match self.session.strategy {
            BufferStrategy::Eager => {
                let planned = i64::try_from(self.session.planned_duration_secs).unwrap_or(i64::MAX);
                let end = chrono::Duration::try_seconds(planned)
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);
                (now, end)
            }
            BufferStrategy::Retro => (self.capture_started_at.unwrap_or(now), now),
        };

        SessionRequest::from_config(&self.session, start, end, self.settings.min_max)
    }

    /// Create the session and tag the buffer with its id
    pub async fn create_session(&mut self, client: &SessionClient) -> Result<SessionId, SessionError> {
        let request = self.session_request(Utc::now());
        let id = client.create_session(&request).await?;
        self.assign_session(id);
        Ok(id)
    }

    pub fn assign_session(&mut self, id: SessionId) {
        self.context.session_id = Some(id);
        self.tag_buffer(id);
    }

    /// Retro rewrites everything; eager only fills in entries recorded
    /// while no session existed.
    fn tag_buffer(&mut self, id: SessionId) {
        match self.session.strategy {
            BufferStrategy::Retro => self.context.buffer.assign_session(id),
            BufferStrategy::Eager => self.context.buffer.tag_placeholders(id),
        }
    }

    /// Upload the whole buffer in one batch. Returns the number of entries
    /// sent.
    pub async fn flush(&mut self, client: &SessionClient) -> Result<usize, SessionError> {
        let id = self.context.session_id.ok_or(SessionError::NoSession)?;
        if self.context.buffer.is_empty() {
            return Err(SessionError::EmptyBuffer);
        }
        if self.context.buffer.untagged() > 0 {
            self.tag_buffer(id);
        }

        let count = self.context.buffer.len();
        client.upload_analysis(self.context.buffer.entries()).await?;
        self.context.buffer.mark_uploaded(count);
        Ok(count)
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn graph(&self) -> &ProbabilityGraph {
        &self.graph
    }

    /// Drop the plotted series and blank the surface
    pub fn clear_graph(&mut self) {
        self.graph.clear();
        self.graph.draw(&mut self.surface);
    }

    pub fn graph_svg(&self) -> String {
        self.surface.to_svg()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            capture_active: self.capture_active,
            connection: self.transport.state(),
            session_id: self.context.session_id.map(|s| s.0),
            buffered_entries: self.context.buffer.len(),
            latest_probability: self.latest_probability,
            frames_processed: self.stats.processed,
            frames_skipped: self.stats.skipped,
            samples_sent: self.stats.sent,
            samples_dropped: self.stats.dropped,
            alignment: self.normalizer.alignment_enabled(),
            plotting: self.settings.plotting,
            sensitivity: self.settings.sensitivity,
        }
    }
}

/// Drives a [`GazePipeline`] from a single task until shutdown
pub struct PipelineRunner<D: LandmarkDetector> {
    pipeline: GazePipeline,
    detector: D,
    inference_rx: mpsc::UnboundedReceiver<InferenceResult>,
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
    client: Option<SessionClient>,
    upload_interval: Option<Duration>,
    subprocess: Option<TrackerSubprocess>,
    restart: Option<Duration>,
    restart_at: Option<Instant>,
}

impl<D: LandmarkDetector> PipelineRunner<D> {
    pub fn new(
        pipeline: GazePipeline,
        detector: D,
        inference_rx: mpsc::UnboundedReceiver<InferenceResult>,
        state: Arc<AppState>,
    ) -> Self {
        let shutdown_rx = state.subscribe_shutdown();
        Self {
            pipeline,
            detector,
            inference_rx,
            state,
            shutdown_rx,
            client: None,
            upload_interval: None,
            subprocess: None,
            restart: None,
            restart_at: None,
        }
    }

    pub fn with_client(mut self, client: SessionClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Upload periodically while capturing; zero disables
    pub fn with_upload_interval(mut self, interval: Duration) -> Self {
        self.upload_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Supervise the tracker helper: health-check it and stop it on shutdown
    pub fn with_subprocess(mut self, subprocess: TrackerSubprocess, config: &TrackingConfig) -> Self {
        self.subprocess = Some(subprocess);
        self.restart = config
            .auto_restart
            .then(|| Duration::from_secs(config.restart_delay_secs));
        self
    }

    /// Run until shutdown, then stop capture, persist what was collected and
    /// release the transport and helper. Returns the pipeline for inspection.
    pub async fn run(mut self) -> GazePipeline {
        if self.pipeline.session.strategy == BufferStrategy::Eager {
            if let Some(client) = &self.client {
                if let Err(e) = self.pipeline.create_session(client).await {
                    tracing::error!("Failed to create session: {}", e.message());
                }
            }
        }

        self.pipeline.start_capture();
        self.publish().await;

        let mut upload_tick = self.upload_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        let mut health_tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                result = self.detector.detect(), if self.pipeline.capture_active() => {
                    match result {
                        Ok(Some(frame)) => {
                            let size = self.detector.frame_size();
                            self.pipeline.process_frame(&frame, size);
                        }
                        Ok(None) => tracing::trace!("No face in frame"),
                        Err(TrackingError::Parse(e)) => {
                            tracing::debug!("Skipping malformed landmark packet: {}", e);
                        }
                        Err(e) => {
                            tracing::error!("Landmark receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                Some(result) = self.inference_rx.recv() => {
                    let entry = self.pipeline.handle_inference(&result);
                    if let Some(probability) = result.probability() {
                        self.state.publish_probability(ProbabilityUpdate {
                            probability,
                            variance: result.variance(),
                            acceleration: result.acceleration(),
                            second: entry.map(|e| e.timestamp),
                        });
                    }
                }
                _ = next_tick(&mut upload_tick) => {
                    self.periodic_upload().await;
                }
                _ = health_tick.tick(), if self.subprocess.is_some() => {
                    self.check_subprocess();
                }
                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    tracing::info!("Pipeline shutting down");
                    break;
                }
            }

            self.publish().await;
        }

        self.finish().await;
        self.pipeline
    }

    async fn periodic_upload(&mut self) {
        let Some(client) = &self.client else {
            return;
        };
        if self.pipeline.context().session_id.is_none() || self.pipeline.context().buffer.is_empty() {
            tracing::debug!("Periodic upload skipped: nothing to send yet");
            return;
        }
        match self.pipeline.flush(client).await {
            Ok(count) => tracing::debug!("Periodic upload sent {} entries", count),
            Err(e) => tracing::error!("Periodic upload failed: {}", e.message()),
        }
    }

    /// Runs on the health tick. A restart is scheduled as a deadline so the
    /// loop keeps serving results and shutdown meanwhile.
    fn check_subprocess(&mut self) {
        let Some(sp) = self.subprocess.as_mut() else {
            return;
        };
        if sp.is_running() {
            self.restart_at = None;
            return;
        }
        let Some(delay) = self.restart else {
            return;
        };

        let now = Instant::now();
        match self.restart_at {
            None => {
                tracing::info!("Tracker subprocess exited, restarting in {}s", delay.as_secs());
                self.restart_at = Some(now + delay);
            }
            Some(at) if now >= at => {
                self.restart_at = None;
                if let Err(e) = sp.start() {
                    tracing::error!("Failed to restart tracker: {}", e);
                }
            }
            Some(_) => {}
        }
    }

    async fn finish(&mut self) {
        self.pipeline.stop_capture();

        if let Some(client) = &self.client {
            let has_entries = !self.pipeline.context().buffer.is_empty();

            if self.pipeline.context().session_id.is_none() && has_entries {
                match self.pipeline.create_session(client).await {
                    Ok(id) => tracing::info!("Session {} created", id),
                    Err(e) => tracing::error!("Failed to create session: {}", e.message()),
                }
            }

            if has_entries && self.pipeline.context().session_id.is_some() {
                match self.pipeline.flush(client).await {
                    Ok(count) => tracing::info!("Uploaded {} entries", count),
                    Err(e) => tracing::error!("Failed to upload session data: {}", e.message()),
                }
            }
        } else if !self.pipeline.context().buffer.is_empty() {
            tracing::warn!(
                "No backend configured, discarding {} buffered entries",
                self.pipeline.context().buffer.len()
            );
        }

        self.pipeline.transport().shutdown();
        if let Some(sp) = self.subprocess.as_mut() {
            sp.stop().await;
        }
        self.pipeline.clear_graph();
        self.publish().await;
    }

    async fn publish(&self) {
        self.state.set_status(self.pipeline.status()).await;
        self.state.set_graph_svg(self.pipeline.graph_svg()).await;
    }
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, RetentionPolicy};
    use axum::http::StatusCode;
    use crate::tracking::landmarks::{
        LEFT_EYE_CORNER, LEFT_IRIS_CENTER, NOSE_TIP, RIGHT_EYE_CORNER, RIGHT_IRIS_CENTER,
    };
    use crate::tracking::{CoordinateSpace, LandmarkPoint};
    use crate::transport::testing::{MockConnector, MockRemote};
    use crate::transport::{LinkEvent, MessageHandler, TelemetryTransport};
    use async_trait::async_trait;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn face(ts: f64) -> LandmarkFrame {
        let mut points = vec![LandmarkPoint::new(0.0, 0.0); 478];
        points[LEFT_IRIS_CENTER] = LandmarkPoint::new(0.4, 0.5);
        points[RIGHT_IRIS_CENTER] = LandmarkPoint::new(0.6, 0.5);
        points[NOSE_TIP] = LandmarkPoint::new(0.5, 0.6);
        points[LEFT_EYE_CORNER] = LandmarkPoint::new(0.35, 0.5);
        points[RIGHT_EYE_CORNER] = LandmarkPoint::new(0.65, 0.5);
        LandmarkFrame::new(points, CoordinateSpace::Normalized, ts)
    }

    fn degenerate(ts: f64) -> LandmarkFrame {
        let mut frame = face(ts);
        frame.points[RIGHT_EYE_CORNER] = frame.points[LEFT_EYE_CORNER];
        frame
    }

    fn prob(p: f64) -> InferenceResult {
        InferenceResult::parse(&format!(r#"{{"variance":0.1,"acceleration":0.2,"probability":{}}}"#, p))
            .unwrap()
    }

    const SIZE: FrameSize = FrameSize {
        width: 640.0,
        height: 480.0,
    };

    async fn open_transport(handler: MessageHandler) -> (TransportHandle, MockRemote) {
        let (connector, mut remotes) = MockConnector::new();
        let (handle, _task) =
            TelemetryTransport::spawn("ws://test", Duration::from_millis(3000), connector, handler);
        let remote = remotes.recv().await.unwrap();
        handle.wait_for_state(ConnectionState::Open).await.unwrap();
        (handle, remote)
    }

    async fn pipeline_with(config: &Config) -> (GazePipeline, MockRemote) {
        let (handle, remote) = open_transport(Box::new(|_| {})).await;
        (GazePipeline::new(config, handle).unwrap(), remote)
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    type Backend = (SessionClient, Arc<Mutex<Vec<Value>>>, Arc<Mutex<Vec<AnalysisEntry>>>);

    /// Backend stub recording create bodies and uploaded entries
    async fn backend() -> Backend {
        backend_failing_creates(0).await
    }

    /// Like [`backend`], but the first `failures` create calls return 500
    async fn backend_failing_creates(failures: usize) -> Backend {
        let created = Arc::new(Mutex::new(Vec::new()));
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let (c, u) = (Arc::clone(&created), Arc::clone(&uploaded));
        let remaining = Arc::new(AtomicUsize::new(failures));

        let app = Router::new()
            .route(
                "/createSession",
                post(move |Json(body): Json<Value>| {
                    let c = Arc::clone(&c);
                    let remaining = Arc::clone(&remaining);
                    async move {
                        c.lock().unwrap().push(body);
                        let failing = remaining
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                            .is_ok();
                        if failing {
                            (
                                StatusCode::INTERNAL_SERVER_ERROR,
                                Json(json!({"message": "Database unavailable"})),
                            )
                        } else {
                            (
                                StatusCode::OK,
                                Json(json!({"message": "Session created successfully", "sessionId": "42"})),
                            )
                        }
                    }
                }),
            )
            .route(
                "/updateSessionAnalysis",
                post(move |Json(body): Json<Vec<AnalysisEntry>>| {
                    let u = Arc::clone(&u);
                    async move {
                        u.lock().unwrap().extend(body);
                        Json(json!({"message": "Analysis data inserted successfully"}))
                    }
                }),
            );

        let client = SessionClient::new(&BackendConfig {
            base_url: serve(app).await,
            ..BackendConfig::default()
        })
        .unwrap();
        (client, created, uploaded)
    }

    #[tokio::test]
    async fn test_frame_to_sample() {
        let (mut pipeline, mut remote) = pipeline_with(&Config::default()).await;
        pipeline.start_capture();

        let first = pipeline.process_frame(&face(1000.0), SIZE).unwrap();
        let second = pipeline.process_frame(&face(1250.0), SIZE).unwrap();

        assert!(first.x.abs() < 1e-12);
        assert!((first.y - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(first.second, 0.0);
        assert_eq!(second.second, 0.25);

        let wire: Value = serde_json::from_str(&remote.sent.recv().await.unwrap()).unwrap();
        assert_eq!(wire["second"], 0.0);
        assert_eq!(pipeline.status().samples_sent, 2);
    }

    #[tokio::test]
    async fn test_bad_frames_are_skipped() {
        let (mut pipeline, _remote) = pipeline_with(&Config::default()).await;
        pipeline.start_capture();

        assert!(pipeline.process_frame(&degenerate(0.0), SIZE).is_none());
        let incomplete = LandmarkFrame::new(
            vec![LandmarkPoint::new(0.5, 0.5); 10],
            CoordinateSpace::Normalized,
            0.0,
        );
        assert!(pipeline.process_frame(&incomplete, SIZE).is_none());

        let status = pipeline.status();
        assert_eq!(status.frames_skipped, 2);
        assert_eq!(status.frames_processed, 0);
    }

    #[tokio::test]
    async fn test_stop_capture_leaves_transport_and_buffer() {
        let (mut pipeline, _remote) = pipeline_with(&Config::default()).await;
        pipeline.start_capture();
        pipeline.process_frame(&face(0.0), SIZE);
        pipeline.handle_inference(&prob(0.4));

        pipeline.stop_capture();
        assert!(pipeline.process_frame(&face(10.0), SIZE).is_none());
        assert_eq!(pipeline.context().buffer.len(), 1);
        assert_eq!(pipeline.transport().state(), ConnectionState::Open);

        // late answers to samples already sent are still recorded
        pipeline.handle_inference(&prob(0.5));
        assert_eq!(pipeline.context().buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_settings_gate_graph_and_scale_metrics() {
        let mut config = Config::default();
        config.smoothing.enabled = false;
        let (mut pipeline, _remote) = pipeline_with(&config).await;

        pipeline.apply_settings(UserSettings {
            affine: false,
            min_max: false,
            plotting: false,
            sensitivity: 3.0,
        });
        pipeline.start_capture();

        let sample = pipeline.process_frame(&face(0.0), SIZE).unwrap();
        assert!((sample.y - 1.0).abs() < 1e-9);

        pipeline.handle_inference(&prob(0.8));
        assert!(pipeline.graph().is_empty());
        assert_eq!(pipeline.status().latest_probability, Some(0.8));

        let request = pipeline.session_request(Utc::now());
        assert_eq!(request.var_min, 0.0);
        assert_eq!(request.acc_max, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_sensitivity_is_ignored() {
        let (mut pipeline, _remote) = pipeline_with(&Config::default()).await;
        pipeline.apply_settings(UserSettings {
            sensitivity: f64::NAN,
            ..UserSettings::default()
        });
        assert_eq!(pipeline.settings().sensitivity, 1.0);
    }

    #[tokio::test]
    async fn test_inference_feeds_graph() {
        let (mut pipeline, _remote) = pipeline_with(&Config::default()).await;
        pipeline.start_capture();
        pipeline.process_frame(&face(0.0), SIZE);

        for p in [0.1, 0.2, 0.3] {
            pipeline.handle_inference(&prob(p));
        }
        assert_eq!(pipeline.graph().values().collect::<Vec<_>>(), vec![0.1, 0.2, 0.3]);
        assert!(pipeline.graph_svg().contains("Probability: 30.0%"));
    }

    #[tokio::test]
    async fn test_retro_session_create_and_flush() {
        let (client, created, uploaded) = backend().await;
        let (mut pipeline, _remote) = pipeline_with(&Config::default()).await;
        pipeline.start_capture();

        for (i, p) in [0.2, 0.4, 0.6].into_iter().enumerate() {
            pipeline.process_frame(&face(i as f64 * 100.0), SIZE);
            pipeline.handle_inference(&prob(p));
        }
        assert!(pipeline.context().buffer.entries().iter().all(|e| e.session_id == 0));

        assert_eq!(
            pipeline.flush(&client).await.unwrap_err(),
            SessionError::NoSession
        );

        let id = pipeline.create_session(&client).await.unwrap();
        assert_eq!(id, SessionId(42));
        assert!(pipeline.context().buffer.entries().iter().all(|e| e.session_id == 42));

        assert_eq!(pipeline.flush(&client).await.unwrap(), 3);
        let sent = uploaded.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|e| e.session_id == 42));
        assert_eq!(sent[2].prob, 0.6);

        // retained by default
        assert_eq!(pipeline.context().buffer.len(), 3);

        let body = created.lock().unwrap()[0].clone();
        assert_eq!(body["name"], "Gaze session");
        assert_eq!(body["var_min"], 4.5e-7);
    }

    #[tokio::test]
    async fn test_eager_entries_before_session_uploaded_under_created_id() {
        let (client, _created, uploaded) = backend().await;
        let mut config = Config::default();
        config.session.strategy = BufferStrategy::Eager;
        let (mut pipeline, _remote) = pipeline_with(&config).await;

        pipeline.start_capture();
        pipeline.process_frame(&face(0.0), SIZE);
        pipeline.handle_inference(&prob(0.3));
        assert_eq!(pipeline.context().buffer.untagged(), 1);

        assert_eq!(pipeline.create_session(&client).await.unwrap(), SessionId(42));
        assert_eq!(pipeline.flush(&client).await.unwrap(), 1);

        let ids: Vec<i64> = uploaded.lock().unwrap().iter().map(|e| e.session_id).collect();
        assert_eq!(ids, vec![42]);
    }

    #[tokio::test]
    async fn test_clear_on_success_retention() {
        let (client, _created, uploaded) = backend().await;
        let mut config = Config::default();
        config.session.retention = RetentionPolicy::ClearOnSuccess;
        let (mut pipeline, _remote) = pipeline_with(&config).await;

        pipeline.start_capture();
        pipeline.process_frame(&face(0.0), SIZE);
        pipeline.handle_inference(&prob(0.5));
        pipeline.create_session(&client).await.unwrap();
        pipeline.flush(&client).await.unwrap();
        assert!(pipeline.context().buffer.is_empty());

        pipeline.handle_inference(&prob(0.7));
        pipeline.flush(&client).await.unwrap();
        assert_eq!(uploaded.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_eager_session_tags_at_send_time() {
        let mut config = Config::default();
        config.session.strategy = BufferStrategy::Eager;
        let (mut pipeline, _remote) = pipeline_with(&config).await;

        pipeline.assign_session(SessionId(5));
        pipeline.start_capture();
        pipeline.process_frame(&face(0.0), SIZE);
        let entry = pipeline.handle_inference(&prob(0.9)).unwrap();
        assert_eq!(entry.session_id, 5);

        let now = Utc::now();
        let request = pipeline.session_request(now);
        assert_eq!(request.start_time, now);
        assert_eq!((request.end_time - now).num_seconds(), 600);
    }

    /// Plays back a fixed script, then waits forever
    struct ScriptedDetector {
        script: VecDeque<Result<Option<LandmarkFrame>, TrackingError>>,
    }

    impl ScriptedDetector {
        fn frames(frames: impl IntoIterator<Item = LandmarkFrame>) -> Self {
            Self {
                script: frames.into_iter().map(|f| Ok(Some(f))).collect(),
            }
        }

        fn idle() -> Self {
            Self {
                script: VecDeque::new(),
            }
        }
    }

    #[async_trait]
    impl LandmarkDetector for ScriptedDetector {
        async fn detect(&mut self) -> Result<Option<LandmarkFrame>, TrackingError> {
            match self.script.pop_front() {
                Some(step) => step,
                None => std::future::pending().await,
            }
        }

        fn frame_size(&self) -> FrameSize {
            SIZE
        }
    }

    #[tokio::test]
    async fn test_runner_end_to_end() {
        let (inference_tx, inference_rx) = mpsc::unbounded_channel();
        let (handle, mut remote) = open_transport(Box::new(move |r| {
            let _ = inference_tx.send(r);
        }))
        .await;

        let (client, _created, uploaded) = backend().await;
        let state = AppState::new(Config::default());
        let mut probabilities = state.subscribe_probability();

        let pipeline = GazePipeline::new(&Config::default(), handle.clone()).unwrap();
        let detector = ScriptedDetector::frames((0..3).map(|i| face(1000.0 + i as f64 * 33.0)));
        let runner = PipelineRunner::new(pipeline, detector, inference_rx, Arc::clone(&state))
            .with_client(client);
        let task = tokio::spawn(runner.run());

        for p in [0.25, 0.5, 0.75] {
            let frame: Value = serde_json::from_str(&remote.sent.recv().await.unwrap()).unwrap();
            assert!(frame["x"].is_number());
            remote
                .events
                .send(LinkEvent::Text(json!({"probability": p}).to_string()))
                .unwrap();
            let update = probabilities.recv().await.unwrap();
            assert_eq!(update.probability, p);
        }

        state.shutdown();
        let pipeline = task.await.unwrap();

        assert!(!pipeline.capture_active());
        assert_eq!(pipeline.context().session_id, Some(SessionId(42)));
        assert!(pipeline.graph().is_empty());

        let sent = uploaded.lock().unwrap().clone();
        assert_eq!(sent.iter().map(|e| e.prob).collect::<Vec<_>>(), vec![0.25, 0.5, 0.75]);
        assert!(sent.iter().all(|e| e.session_id == 42));

        handle.wait_for_state(ConnectionState::Closed).await.unwrap();
        let status = state.get_status().await;
        assert_eq!(status.buffered_entries, 3);
        assert!(!status.capture_active);
        let svg = state.graph_svg.read().await.clone();
        assert!(svg.starts_with("<svg"));
        assert!(!svg.contains("Probability"));
        assert!(!svg.contains("polyline"));
    }

    fn inference_forwarder() -> (MessageHandler, mpsc::UnboundedReceiver<InferenceResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_eager_runner_creates_session_at_shutdown_after_failed_start() {
        let mut config = Config::default();
        config.session.strategy = BufferStrategy::Eager;

        let (handler, inference_rx) = inference_forwarder();
        let (handle, mut remote) = open_transport(handler).await;
        let (client, created, uploaded) = backend_failing_creates(1).await;
        let state = AppState::new(config.clone());
        let mut probabilities = state.subscribe_probability();

        let pipeline = GazePipeline::new(&config, handle).unwrap();
        let runner = PipelineRunner::new(
            pipeline,
            ScriptedDetector::frames([face(0.0), face(40.0)]),
            inference_rx,
            Arc::clone(&state),
        )
        .with_client(client);
        let task = tokio::spawn(runner.run());

        for p in [0.6, 0.7] {
            remote.sent.recv().await.unwrap();
            remote
                .events
                .send(LinkEvent::Text(json!({"probability": p}).to_string()))
                .unwrap();
            probabilities.recv().await.unwrap();
        }

        state.shutdown();
        let pipeline = task.await.unwrap();

        assert_eq!(created.lock().unwrap().len(), 2);
        assert_eq!(pipeline.context().session_id, Some(SessionId(42)));
        let sent = uploaded.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.session_id == 42));
    }

    #[tokio::test]
    async fn test_shutdown_before_runner_starts() {
        let (handle, _remote) = open_transport(Box::new(|_| {})).await;
        let (_tx, inference_rx) = mpsc::unbounded_channel();
        let state = AppState::new(Config::default());
        state.shutdown();

        let pipeline = GazePipeline::new(&Config::default(), handle.clone()).unwrap();
        let runner =
            PipelineRunner::new(pipeline, ScriptedDetector::idle(), inference_rx, Arc::clone(&state));

        let pipeline = tokio::time::timeout(Duration::from_secs(3), runner.run())
            .await
            .expect("runner ignored an earlier shutdown");
        assert!(!pipeline.capture_active());
        handle.wait_for_state(ConnectionState::Closed).await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_restart_does_not_block_shutdown() {
        let (handle, _remote) = open_transport(Box::new(|_| {})).await;
        let (_tx, inference_rx) = mpsc::unbounded_channel();
        let state = AppState::new(Config::default());

        let tracking = TrackingConfig {
            auto_restart: true,
            restart_delay_secs: 30,
            ..TrackingConfig::default()
        };
        // never started, so the first health check schedules a restart
        let helper = TrackerSubprocess::new(&tracking);
        let pipeline = GazePipeline::new(&Config::default(), handle).unwrap();
        let runner =
            PipelineRunner::new(pipeline, ScriptedDetector::idle(), inference_rx, Arc::clone(&state))
                .with_subprocess(helper, &tracking);
        let task = tokio::spawn(runner.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        state.shutdown();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("shutdown waited for the restart delay")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_packets_skipped_without_backoff() {
        let (handle, mut remote) = open_transport(Box::new(|_| {})).await;
        let (_tx, inference_rx) = mpsc::unbounded_channel();
        let state = AppState::new(Config::default());

        let mut script: VecDeque<_> = (0..20)
            .map(|i| Err(TrackingError::Parse(format!("bad packet {}", i))))
            .collect();
        script.push_back(Ok(Some(face(0.0))));

        let pipeline = GazePipeline::new(&Config::default(), handle).unwrap();
        let runner = PipelineRunner::new(
            pipeline,
            ScriptedDetector { script },
            inference_rx,
            Arc::clone(&state),
        );

        let started = Instant::now();
        let task = tokio::spawn(runner.run());
        remote.sent.recv().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        state.shutdown();
        let pipeline = task.await.unwrap();
        assert_eq!(pipeline.status().frames_processed, 1);
    }
}
