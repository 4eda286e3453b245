//! Screen firmware REST channel
//!
//! Legacy Wi-Fi firmware exposes a small REST API under `/api/v1`. Every
//! call carries the session token obtained from `connect`. There is no push
//! telemetry; a local poll of `status` stands in for subscriptions and its
//! answers double as heartbeats for the watchdog.

use super::capabilities::{
    AirPurifierCapability, EnclosureCapability, FileTransferCapability, GcodeCapability,
    PrintJobCapability, PrintRequest, ProgressCallback,
};
use super::{
    ChannelEvent, ChannelEventSender, ChannelLifecycle, EventSink, LegacySample, LegacyTelemetry,
    ReadyInfo,
};
use crate::sacp::transfer::TransferProgress;
use crate::watch::{ConnectionWatchConfig, ConnectionWatcher};
use async_trait::async_trait;
use fablink_core::{
    AirPurifierState, ChannelError, ConnectionError, DisconnectReason, EnclosureState, Error,
    HeadType, MachineSeries, Position, Protocol, Result, WorkflowStatus,
};
use parking_lot::{Mutex, RwLock};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Port of the screen's REST API
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// REST channel settings
#[derive(Debug, Clone)]
pub struct HttpChannelConfig {
    /// Machine address.
    pub host: String,
    /// API port.
    pub port: u16,
    /// Token of an earlier session; reusing it skips the confirmation on the screen.
    pub token: Option<String>,
    /// Status poll period.
    pub poll_interval: Duration,
    /// Bound on every request.
    pub request_timeout: Duration,
    /// Status answers act as heartbeats for this watchdog.
    pub watch: ConnectionWatchConfig,
}

impl HttpChannelConfig {
    /// Defaults for `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_HTTP_PORT,
            token: None,
            poll_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            watch: ConnectionWatchConfig::default(),
        }
    }

    /// Root of the API
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/api/v1", self.host, self.port)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    token: String,
    #[serde(default)]
    series: Option<String>,
    #[serde(default)]
    head_type: Option<String>,
}

/// One answer of the status endpoint
///
/// The firmware omits fields that do not apply to the mounted head.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpStatus {
    pub status: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub b: Option<f64>,
    pub homed: Option<bool>,
    pub tool_head: Option<String>,
    pub nozzle_temperature: Option<f64>,
    pub nozzle_target_temperature: Option<f64>,
    pub heated_bed_temperature: Option<f64>,
    pub heated_bed_target_temperature: Option<f64>,
    pub laser_power: Option<f64>,
    pub spindle_speed: Option<u32>,
    pub file_name: Option<String>,
    pub total_lines: Option<u32>,
    pub current_line: Option<u32>,
    pub elapsed_time: Option<u64>,
    pub is_enclosure_door_open: Option<bool>,
    pub led_value: Option<u8>,
    pub fan_speed: Option<u8>,
    pub air_purifier: Option<bool>,
    pub air_purifier_fan_speed: Option<u8>,
}

impl HttpStatus {
    /// Normalize into a legacy telemetry sample
    pub fn to_sample(&self) -> LegacySample {
        let position = match (self.x, self.y, self.z) {
            (Some(x), Some(y), Some(z)) => {
                let mut p = Position::new(x, y, z);
                p.b = self.b.unwrap_or_default();
                Some(p)
            }
            _ => None,
        };
        let pair = |current: Option<f64>, target: Option<f64>| {
            current.map(|c| (c, target.unwrap_or_default()))
        };
        let enclosure = (self.led_value.is_some() || self.is_enclosure_door_open.is_some())
            .then(|| EnclosureState {
                light: self.led_value.unwrap_or_default(),
                fan: self.fan_speed.unwrap_or_default(),
                door_open: self.is_enclosure_door_open.unwrap_or_default(),
                door_detection: false,
            });
        let air_purifier = self.air_purifier.map(|enabled| AirPurifierState {
            enabled,
            fan_speed: self.air_purifier_fan_speed.unwrap_or_default(),
            filter_life: 0,
        });

        LegacySample {
            status: self.status.as_deref().map(WorkflowStatus::from_http),
            position,
            is_homed: self.homed,
            nozzle: pair(self.nozzle_temperature, self.nozzle_target_temperature),
            bed: pair(self.heated_bed_temperature, self.heated_bed_target_temperature),
            laser_power: self.laser_power,
            spindle_speed: self.spindle_speed,
            enclosure,
            air_purifier,
            current_line: self.current_line,
            elapsed_secs: self.elapsed_time,
        }
    }
}

/// Head type from the names the screen uses
fn head_from_http(name: &str) -> HeadType {
    match name.trim().to_ascii_uppercase().as_str() {
        "3DP" | "3D" => HeadType::Printing,
        other => HeadType::from_name(other),
    }
}

/// Name the screen expects in `prepare_print`
fn head_to_http(head: HeadType) -> &'static str {
    match head {
        HeadType::Laser => "Laser",
        HeadType::Cnc => "CNC",
        _ => "3DP",
    }
}

fn http_error(e: reqwest::Error) -> Error {
    ConnectionError::HttpError {
        reason: e.to_string(),
    }
    .into()
}

struct HttpSession {
    token: String,
    head: HeadType,
    poller: Option<JoinHandle<()>>,
}

struct HttpInner {
    config: HttpChannelConfig,
    client: Client,
    sink: EventSink,
    telemetry: LegacyTelemetry,
    watcher: ConnectionWatcher,
    session: Mutex<Option<HttpSession>>,
    last_status: RwLock<Option<HttpStatus>>,
}

impl HttpInner {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url(), path)
    }

    fn token(&self) -> Result<String> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or_else(|| ChannelError::NotOpen.into())
    }

    fn end_session(&self) -> Option<HttpSession> {
        let mut session = self.session.lock().take()?;
        if let Some(poller) = session.poller.take() {
            poller.abort();
        }
        Some(session)
    }

    async fn checked(&self, path: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!("{} answered {}: {}", path, status, body.trim());
        Err(ChannelError::CommandRejected {
            reason: format!("{} answered {}", path, status),
        }
        .into())
    }

    async fn post_form(&self, path: &str, fields: &[(&str, String)]) -> Result<String> {
        let token = self.token()?;
        let mut form: Vec<(&str, String)> = vec![("token", token)];
        form.extend(fields.iter().cloned());
        let response = self
            .client
            .post(self.url(path))
            .form(&form)
            .send()
            .await
            .map_err(http_error)?;
        let response = self.checked(path, response).await?;
        response.text().await.map_err(http_error)
    }

    async fn post_file(
        &self,
        path: &str,
        filename: &str,
        content: Vec<u8>,
        fields: &[(&str, String)],
    ) -> Result<()> {
        let token = self.token()?;
        let mut form = Form::new().text("token", token);
        for (name, value) in fields {
            form = form.text(name.to_string(), value.clone());
        }
        let part = Part::bytes(content).file_name(filename.to_string());
        form = form.part("file", part);
        let response = self
            .client
            .post(self.url(path))
            .multipart(form)
            .send()
            .await
            .map_err(http_error)?;
        self.checked(path, response).await.map(|_| ())
    }

    async fn poll_status(&self) -> Result<HttpStatus> {
        let token = self.token()?;
        let response = self
            .client
            .get(self.url("status"))
            .query(&[("token", token)])
            .send()
            .await
            .map_err(http_error)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ConnectionError::HandshakeRejected {
                reason: "session token revoked".to_string(),
            }
            .into());
        }
        let response = self.checked("status", response).await?;
        response.json::<HttpStatus>().await.map_err(http_error)
    }
}

async fn poll_loop(weak: Weak<HttpInner>) {
    let Some(interval) = weak.upgrade().map(|i| i.config.poll_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match inner.poll_status().await {
            Ok(status) => {
                inner.watcher.heartbeat();
                inner.telemetry.publish(status.to_sample());
                *inner.last_status.write() = Some(status);
            }
            Err(Error::Connection(ConnectionError::HandshakeRejected { reason })) => {
                tracing::error!("Status poll on {} refused: {}", inner.config.host, reason);
                inner.watcher.stop().await;
                inner.sink.closed(DisconnectReason::ConnectionLost(reason));
                inner.session.lock().take();
                return;
            }
            Err(e) => tracing::debug!("Status poll on {} failed: {}", inner.config.host, e),
        }
    }
}

/// Legacy REST channel
pub struct HttpChannel {
    inner: Arc<HttpInner>,
}

impl HttpChannel {
    /// Create a closed channel
    pub fn new(config: HttpChannelConfig, events: ChannelEventSender) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(http_error)?;
        Ok(Self {
            inner: Arc::new(HttpInner {
                watcher: ConnectionWatcher::new(config.watch),
                config,
                client,
                sink: EventSink::new(events),
                telemetry: LegacyTelemetry::new(),
                session: Mutex::new(None),
                last_status: RwLock::new(None),
            }),
        })
    }

    /// Telemetry samples of this channel
    pub fn telemetry(&self) -> LegacyTelemetry {
        self.inner.telemetry.clone()
    }

    /// Token of the open session
    pub fn token(&self) -> Option<String> {
        self.inner.token().ok()
    }

    /// Last answer of the status poll
    pub fn last_status(&self) -> Option<HttpStatus> {
        self.inner.last_status.read().clone()
    }

    /// Fetch the status now
    pub async fn status(&self) -> Result<HttpStatus> {
        self.inner.poll_status().await
    }

    async fn connect(&self) -> Result<ConnectResponse> {
        let inner = &self.inner;
        let mut request = inner.client.post(inner.url("connect"));
        if let Some(token) = &inner.config.token {
            request = request.form(&[("token", token.as_str())]);
        }
        let response = request.send().await.map_err(|e| ConnectionError::FailedToOpen {
            target: inner.config.base_url(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::HandshakeRejected {
                reason: format!("connect answered {}", status),
            }
            .into());
        }
        response
            .json::<ConnectResponse>()
            .await
            .map_err(|e| {
                ConnectionError::HandshakeRejected {
                    reason: format!("unreadable connect answer: {}", e),
                }
                .into()
            })
    }
}

#[async_trait]
impl ChannelLifecycle for HttpChannel {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn is_open(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    async fn connection_open(&self) -> Result<()> {
        self.connection_close_improper().await;
        tracing::info!("Connecting to {}", self.inner.config.base_url());

        let answer = self.connect().await?;
        let series = answer
            .series
            .as_deref()
            .map(MachineSeries::from_name)
            .unwrap_or_default();
        let head = answer
            .head_type
            .as_deref()
            .map(head_from_http)
            .unwrap_or_default();
        *self.inner.session.lock() = Some(HttpSession {
            token: answer.token,
            head,
            poller: None,
        });
        self.inner.sink.arm();
        self.inner.sink.emit(ChannelEvent::Connected);

        if let Err(e) = self.start_heartbeat().await {
            self.inner.sink.disarm();
            self.inner.end_session();
            return Err(e);
        }
        tracing::info!("{} ready: {} with {} head", self.inner.config.host, series, head);
        self.inner.sink.emit(ChannelEvent::Ready(ReadyInfo {
            protocol: Protocol::Http,
            series,
            head_type: head,
            firmware_version: None,
        }));
        Ok(())
    }

    async fn connection_close(&self) -> Result<bool> {
        if !self.is_open() {
            return Ok(false);
        }
        self.stop_heartbeat().await;
        if let Err(e) = self.inner.post_form("disconnect", &[]).await {
            tracing::debug!("Disconnect from {} failed: {}", self.inner.config.host, e);
        }
        self.inner.sink.closed(DisconnectReason::UserRequested);
        Ok(self.inner.end_session().is_some())
    }

    async fn connection_close_improper(&self) {
        self.stop_heartbeat().await;
        if self.inner.end_session().is_some() {
            self.inner.sink.closed(DisconnectReason::UserRequested);
        }
    }

    async fn start_heartbeat(&self) -> Result<()> {
        {
            let mut guard = self.inner.session.lock();
            let Some(session) = guard.as_mut() else {
                return Err(ChannelError::NotOpen.into());
            };
            if session.poller.is_some() {
                return Ok(());
            }
            session.poller = Some(tokio::spawn(poll_loop(Arc::downgrade(&self.inner))));
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .watcher
            .start(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.sink.closed(DisconnectReason::HeartbeatTimeout) {
                    tracing::error!("Status poll of {} went silent", inner.config.host);
                }
                inner.end_session();
            })
            .await
    }

    async fn stop_heartbeat(&self) {
        self.inner.watcher.stop().await;
        let poller = self
            .inner
            .session
            .lock()
            .as_mut()
            .and_then(|s| s.poller.take());
        if let Some(poller) = poller {
            poller.abort();
        }
    }
}

#[async_trait]
impl GcodeCapability for HttpChannel {
    async fn execute_gcode(&self, gcode: &str) -> Result<String> {
        self.inner
            .post_form("execute_code", &[("code", gcode.to_string())])
            .await
    }
}

#[async_trait]
impl FileTransferCapability for HttpChannel {
    async fn upload_file(
        &self,
        filename: &str,
        content: Vec<u8>,
        on_progress: ProgressCallback,
    ) -> Result<()> {
        on_progress(TransferProgress {
            filename: filename.to_string(),
            progress: 0.0,
            decompressing: false,
        });
        self.inner.post_file("upload", filename, content, &[]).await?;
        on_progress(TransferProgress {
            filename: filename.to_string(),
            progress: 1.0,
            decompressing: false,
        });
        Ok(())
    }
}

#[async_trait]
impl PrintJobCapability for HttpChannel {
    async fn start_print(&self, request: &PrintRequest) -> Result<()> {
        let head = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.head)
            .ok_or(ChannelError::NotOpen)?;
        self.inner
            .post_file(
                "prepare_print",
                &request.filename,
                request.content.as_bytes().to_vec(),
                &[("type", head_to_http(head).to_string())],
            )
            .await?;
        self.inner.post_form("start_print", &[]).await.map(|_| ())
    }

    async fn pause_print(&self) -> Result<()> {
        self.inner.post_form("pause_print", &[]).await.map(|_| ())
    }

    async fn resume_print(&self) -> Result<()> {
        self.inner.post_form("resume_print", &[]).await.map(|_| ())
    }

    async fn stop_print(&self) -> Result<()> {
        self.inner.post_form("stop_print", &[]).await.map(|_| ())
    }
}

#[async_trait]
impl EnclosureCapability for HttpChannel {
    async fn set_enclosure_light(&self, intensity: u8) -> Result<()> {
        self.inner
            .post_form("enclosure", &[("led", intensity.to_string())])
            .await
            .map(|_| ())
    }

    async fn set_enclosure_fan(&self, speed: u8) -> Result<()> {
        self.inner
            .post_form("enclosure", &[("fan", speed.to_string())])
            .await
            .map(|_| ())
    }

    async fn set_door_detection(&self, enabled: bool) -> Result<()> {
        self.inner
            .post_form("enclosure", &[("isDoorEnabled", enabled.to_string())])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl AirPurifierCapability for HttpChannel {
    async fn switch_purifier(&self, on: bool) -> Result<()> {
        self.inner
            .post_form("air_purifier_switch", &[("switch", on.to_string())])
            .await
            .map(|_| ())
    }

    async fn set_purifier_speed(&self, level: u8) -> Result<()> {
        self.inner
            .post_form("air_purifier_fan_speed", &[("fan_speed", level.to_string())])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Form as AxumForm, Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Screen {
        reject: AtomicBool,
        silent: AtomicBool,
        forms: parking_lot::Mutex<Vec<(String, HashMap<String, String>)>>,
        files: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    impl Screen {
        fn record(&self, path: &str, form: HashMap<String, String>) {
            self.forms.lock().push((path.to_string(), form));
        }

        fn forms_for(&self, path: &str) -> Vec<HashMap<String, String>> {
            self.forms
                .lock()
                .iter()
                .filter(|(p, _)| p == path)
                .map(|(_, f)| f.clone())
                .collect()
        }
    }

    async fn connect(State(screen): State<Arc<Screen>>) -> impl IntoResponse {
        if screen.reject.load(Ordering::SeqCst) {
            return AxumStatus::FORBIDDEN.into_response();
        }
        Json(serde_json::json!({
            "token": "tok-1",
            "series": "A350",
            "headType": "LASER",
        }))
        .into_response()
    }

    async fn status(
        State(screen): State<Arc<Screen>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        if screen.silent.load(Ordering::SeqCst) {
            return AxumStatus::SERVICE_UNAVAILABLE.into_response();
        }
        if query.get("token").map(String::as_str) != Some("tok-1") {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        Json(serde_json::json!({
            "status": "RUNNING",
            "x": 1.0, "y": 2.0, "z": 3.0,
            "homed": true,
            "laserPower": 40.0,
            "currentLine": 12,
        }))
        .into_response()
    }

    async fn form_endpoint(
        State(screen): State<Arc<Screen>>,
        axum::extract::Path(path): axum::extract::Path<String>,
        AxumForm(form): AxumForm<HashMap<String, String>>,
    ) -> &'static str {
        screen.record(&path, form);
        "ok"
    }

    async fn file_endpoint(State(screen): State<Arc<Screen>>, body: Bytes) -> &'static str {
        screen.files.lock().push(body.to_vec());
        "ok"
    }

    async fn serve(screen: Arc<Screen>) -> u16 {
        let app = Router::new()
            .route("/api/v1/connect", post(connect))
            .route("/api/v1/status", get(status))
            .route("/api/v1/upload", post(file_endpoint))
            .route("/api/v1/prepare_print", post(file_endpoint))
            .route("/api/v1/{path}", post(form_endpoint))
            .with_state(screen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn channel(
        screen: Arc<Screen>,
    ) -> (HttpChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let port = serve(screen).await;
        let mut config = HttpChannelConfig::new("127.0.0.1");
        config.port = port;
        config.poll_interval = Duration::from_millis(30);
        config.request_timeout = Duration::from_secs(2);
        config.watch = ConnectionWatchConfig {
            timeout_ms: 300,
            check_interval_ms: 20,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (HttpChannel::new(config, tx).unwrap(), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_reports_ready() {
        let screen = Arc::new(Screen::default());
        let (channel, mut events) = channel(screen).await;

        channel.connection_open().await.unwrap();
        assert_eq!(channel.token().as_deref(), Some("tok-1"));
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Ready(ReadyInfo {
                protocol: Protocol::Http,
                series: MachineSeries::A350,
                head_type: HeadType::Laser,
                firmware_version: None,
            })
        );
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let screen = Arc::new(Screen::default());
        screen.reject.store(true, Ordering::SeqCst);
        let (channel, _events) = channel(screen).await;

        let err = channel.connection_open().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::HandshakeRejected { .. })
        ));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_poll_publishes_samples() {
        let screen = Arc::new(Screen::default());
        let (channel, _events) = channel(screen).await;
        let mut samples = channel.telemetry().subscribe();
        channel.connection_open().await.unwrap();

        let sample = tokio::time::timeout(Duration::from_secs(2), samples.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.status, Some(WorkflowStatus::Running));
        assert_eq!(sample.position, Some(Position::new(1.0, 2.0, 3.0)));
        assert_eq!(sample.laser_power, Some(40.0));
        assert_eq!(sample.current_line, Some(12));
        assert!(channel.last_status().is_some());
    }

    #[tokio::test]
    async fn test_commands_carry_token() {
        let screen = Arc::new(Screen::default());
        let (channel, _events) = channel(screen.clone()).await;
        channel.connection_open().await.unwrap();

        channel.execute_gcode("G28").await.unwrap();
        channel.switch_purifier(true).await.unwrap();
        let gcode = screen.forms_for("execute_code");
        assert_eq!(gcode[0].get("token").map(String::as_str), Some("tok-1"));
        assert_eq!(gcode[0].get("code").map(String::as_str), Some("G28"));
        let purifier = screen.forms_for("air_purifier_switch");
        assert_eq!(purifier[0].get("switch").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_upload_sends_multipart_file() {
        let screen = Arc::new(Screen::default());
        let (channel, _events) = channel(screen.clone()).await;
        channel.connection_open().await.unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback = Arc::new(move |p| sink.lock().push(p.progress));
        channel
            .upload_file("part.nc", b"G0 X1\n".to_vec(), progress)
            .await
            .unwrap();

        let body = String::from_utf8_lossy(&screen.files.lock()[0]).into_owned();
        assert!(body.contains("part.nc"));
        assert!(body.contains("G0 X1"));
        assert!(body.contains("tok-1"));
        assert_eq!(*seen.lock(), vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_silent_status_times_out() {
        let screen = Arc::new(Screen::default());
        let (channel, mut events) = channel(screen.clone()).await;
        channel.connection_open().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        screen.silent.store(true, Ordering::SeqCst);
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Closed(DisconnectReason::HeartbeatTimeout)
        );
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_close_posts_disconnect_once() {
        let screen = Arc::new(Screen::default());
        let (channel, mut events) = channel(screen.clone()).await;
        channel.connection_open().await.unwrap();

        assert!(channel.connection_close().await.unwrap());
        assert!(!channel.connection_close().await.unwrap());
        assert_eq!(screen.forms_for("disconnect").len(), 1);

        next_event(&mut events).await;
        next_event(&mut events).await;
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Closed(DisconnectReason::UserRequested)
        );
    }

    #[test]
    fn test_head_names() {
        assert_eq!(head_from_http("3DP"), HeadType::Printing);
        assert_eq!(head_from_http("LASER"), HeadType::Laser);
        assert_eq!(head_to_http(HeadType::Cnc), "CNC");
    }
}
