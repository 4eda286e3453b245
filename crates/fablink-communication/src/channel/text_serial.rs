//! Plain G-code serial channel
//!
//! Wraps a [`TextController`]. Position and temperature answers to the idle
//! queries become [`LegacySample`]s; the idle queries double as liveness,
//! so the heartbeat calls are no-ops here. Printing streams the file line by
//! line, each line waiting for its `ok`.

use super::capabilities::{GcodeCapability, PrintJobCapability, PrintRequest};
use super::{
    ChannelEvent, ChannelEventSender, ChannelLifecycle, EventSink, LegacySample, LegacyTelemetry,
    ReadyInfo,
};
use crate::link::LinkOpener;
use crate::text::{TextController, TextControllerConfig, TextEvent};
use async_trait::async_trait;
use fablink_core::{ChannelError, DisconnectReason, Protocol, Result, WorkflowStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

struct PrintStream {
    filename: String,
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Marlin firmware over a serial port
pub struct TextSerialChannel {
    opener: Arc<dyn LinkOpener>,
    controller: Arc<TextController>,
    sink: EventSink,
    telemetry: LegacyTelemetry,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    print: Mutex<Option<PrintStream>>,
}

impl TextSerialChannel {
    /// Create a closed channel
    pub fn new(
        opener: Arc<dyn LinkOpener>,
        config: TextControllerConfig,
        events: ChannelEventSender,
    ) -> Self {
        Self {
            opener,
            controller: Arc::new(TextController::new(config)),
            sink: EventSink::new(events),
            telemetry: LegacyTelemetry::new(),
            forwarder: Mutex::new(None),
            print: Mutex::new(None),
        }
    }

    /// Telemetry samples of this channel
    pub fn telemetry(&self) -> LegacyTelemetry {
        self.telemetry.clone()
    }

    /// The underlying line controller
    pub fn controller(&self) -> &TextController {
        &self.controller
    }

    /// Whether a streamed job is running
    pub fn is_printing(&self) -> bool {
        self.print
            .lock()
            .as_ref()
            .is_some_and(|p| !p.task.is_finished())
    }

    fn spawn_forwarder(&self, mut events: broadcast::Receiver<TextEvent>) -> JoinHandle<()> {
        let sink = self.sink.clone();
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Text event forwarder skipped {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    TextEvent::Pos(position) => telemetry.publish(LegacySample {
                        position: Some(position),
                        ..Default::default()
                    }),
                    TextEvent::Temperature(report) => telemetry.publish(LegacySample {
                        nozzle: report.nozzle,
                        bed: report.bed,
                        ..Default::default()
                    }),
                    TextEvent::Ready(firmware) => {
                        sink.emit(ChannelEvent::Ready(ReadyInfo {
                            protocol: Protocol::PlainText,
                            series: firmware.series,
                            head_type: firmware.head,
                            firmware_version: firmware.version,
                        }));
                    }
                    TextEvent::Closed(reason) => {
                        let reason = reason.unwrap_or_else(|| "closed by peer".to_string());
                        sink.closed(DisconnectReason::ConnectionLost(reason));
                        break;
                    }
                    _ => {}
                }
            }
        })
    }

    fn stop_stream(&self) -> Option<String> {
        let stream = self.print.lock().take()?;
        stream.task.abort();
        Some(stream.filename)
    }

    async fn teardown(&self) -> bool {
        if !self.controller.is_open() {
            return false;
        }
        if let Some(filename) = self.stop_stream() {
            tracing::info!("Abandoned streaming {}", filename);
        }
        self.sink.closed(DisconnectReason::UserRequested);
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
        self.controller.close().await;
        true
    }
}

#[async_trait]
impl ChannelLifecycle for TextSerialChannel {
    fn protocol(&self) -> Protocol {
        Protocol::PlainText
    }

    fn is_open(&self) -> bool {
        self.controller.is_open()
    }

    async fn connection_open(&self) -> Result<()> {
        self.teardown().await;
        tracing::info!("Opening plain text session on {}", self.opener.describe());
        let link = self.opener.open().await?;

        let events = self.controller.subscribe();
        self.sink.arm();
        self.sink.emit(ChannelEvent::Connected);
        *self.forwarder.lock() = Some(self.spawn_forwarder(events));
        if let Err(e) = self.controller.open(link).await {
            self.sink.disarm();
            if let Some(handle) = self.forwarder.lock().take() {
                handle.abort();
            }
            return Err(e);
        }
        Ok(())
    }

    async fn connection_close(&self) -> Result<bool> {
        Ok(self.teardown().await)
    }

    async fn connection_close_improper(&self) {
        self.teardown().await;
    }

    async fn start_heartbeat(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_heartbeat(&self) {}
}

#[async_trait]
impl GcodeCapability for TextSerialChannel {
    async fn execute_gcode(&self, gcode: &str) -> Result<String> {
        Ok(self.controller.execute(gcode).await?.join("\n"))
    }
}

/// Executable part of a G-code line, without comments
fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or_default().trim()
}

async fn stream_lines(
    controller: Arc<TextController>,
    telemetry: LegacyTelemetry,
    filename: String,
    content: String,
    mut paused: watch::Receiver<bool>,
) {
    telemetry.publish(LegacySample {
        status: Some(WorkflowStatus::Running),
        current_line: Some(0),
        ..Default::default()
    });
    for (index, raw) in content.lines().enumerate() {
        let resumed = paused.wait_for(|p| !*p).await.is_ok();
        if !resumed {
            return;
        }
        let line = strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        if let Err(e) = controller.command(line).await {
            tracing::error!("Streaming {} failed at line {}: {}", filename, index + 1, e);
            telemetry.publish(LegacySample {
                status: Some(WorkflowStatus::Idle),
                ..Default::default()
            });
            return;
        }
        telemetry.publish(LegacySample {
            current_line: Some((index + 1) as u32),
            ..Default::default()
        });
    }
    tracing::info!("Finished streaming {}", filename);
    telemetry.publish(LegacySample {
        status: Some(WorkflowStatus::Idle),
        ..Default::default()
    });
}

#[async_trait]
impl PrintJobCapability for TextSerialChannel {
    async fn start_print(&self, request: &PrintRequest) -> Result<()> {
        if !self.controller.is_open() {
            return Err(ChannelError::NotOpen.into());
        }
        if self.is_printing() {
            return Err(ChannelError::CommandRejected {
                reason: "a job is already streaming".to_string(),
            }
            .into());
        }

        let (paused, paused_rx) = watch::channel(false);
        let task = tokio::spawn(stream_lines(
            self.controller.clone(),
            self.telemetry.clone(),
            request.filename.clone(),
            request.content.clone(),
            paused_rx,
        ));
        tracing::info!(
            "Streaming {} ({} lines)",
            request.filename,
            request.metadata.total_lines
        );
        *self.print.lock() = Some(PrintStream {
            filename: request.filename.clone(),
            paused,
            task,
        });
        Ok(())
    }

    async fn pause_print(&self) -> Result<()> {
        self.set_paused(true)
    }

    async fn resume_print(&self) -> Result<()> {
        self.set_paused(false)
    }

    async fn stop_print(&self) -> Result<()> {
        match self.stop_stream() {
            Some(filename) => {
                tracing::info!("Stopped streaming {}", filename);
                self.telemetry.publish(LegacySample {
                    status: Some(WorkflowStatus::Idle),
                    ..Default::default()
                });
                Ok(())
            }
            None => Err(ChannelError::CommandRejected {
                reason: "no job is streaming".to_string(),
            }
            .into()),
        }
    }
}

impl TextSerialChannel {
    fn set_paused(&self, paused: bool) -> Result<()> {
        let guard = self.print.lock();
        let Some(stream) = guard.as_ref().filter(|p| !p.task.is_finished()) else {
            return Err(ChannelError::CommandRejected {
                reason: "no job is streaming".to_string(),
            }
            .into());
        };
        stream.paused.send_replace(paused);
        let status = if paused {
            WorkflowStatus::Paused
        } else {
            WorkflowStatus::Running
        };
        self.telemetry.publish(LegacySample {
            status: Some(status),
            ..Default::default()
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLinkOpener;
    use crate::testing::FakeMarlin;
    use fablink_core::{HeadType, MachineSeries};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel() -> (
        TextSerialChannel,
        Arc<MockLinkOpener>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let opener = Arc::new(MockLinkOpener::new("marlin"));
        let (tx, rx) = mpsc::unbounded_channel();
        let config = TextControllerConfig {
            query_interval: Duration::from_millis(50),
            ready_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_secs(2),
        };
        (TextSerialChannel::new(opener.clone(), config, tx), opener, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ready_carries_identification() {
        let (channel, opener, mut events) = channel();
        let _marlin = FakeMarlin::attach(&opener)
            .with_series(MachineSeries::A350)
            .with_head(HeadType::Laser);

        channel.connection_open().await.unwrap();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Ready(ReadyInfo {
                protocol: Protocol::PlainText,
                series: MachineSeries::A350,
                head_type: HeadType::Laser,
                firmware_version: Some("Snapmaker_V2.2.0".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_idle_queries_publish_samples() {
        let (channel, opener, _events) = channel();
        let marlin = FakeMarlin::attach(&opener);
        marlin.update_profile(|p| p.nozzle = (200.0, 210.0));
        let mut samples = channel.telemetry().subscribe();
        channel.connection_open().await.unwrap();

        let found = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let sample = samples.recv().await.unwrap();
                if sample.nozzle.is_some() {
                    return sample.nozzle;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(found, Some((200.0, 210.0)));
    }

    #[tokio::test]
    async fn test_peer_close_reports_connection_lost() {
        let (channel, opener, mut events) = channel();
        let marlin = FakeMarlin::attach(&opener);
        channel.connection_open().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        assert!(marlin.close().await);
        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::Closed(DisconnectReason::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (channel, opener, mut events) = channel();
        let _marlin = FakeMarlin::attach(&opener);
        channel.connection_open().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        assert!(channel.connection_close().await.unwrap());
        assert!(!channel.connection_close().await.unwrap());
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Closed(DisconnectReason::UserRequested)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_print_streams_without_comments() {
        let (channel, opener, mut events) = channel();
        let marlin = FakeMarlin::attach(&opener);
        channel.connection_open().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        let request = PrintRequest::new("cube.gcode", ";header\nG28 ; home\nG1 X5\n");
        channel.start_print(&request).await.unwrap();
        assert!(marlin.wait_for_line("G1 X5").await.is_some());
        let lines = marlin.lines();
        assert!(lines.iter().any(|l| l == "G28"));
        assert!(!lines.iter().any(|l| l.contains("header")));
    }

    #[tokio::test]
    async fn test_pause_without_job_is_rejected() {
        let (channel, opener, _events) = channel();
        let _marlin = FakeMarlin::attach(&opener);
        channel.connection_open().await.unwrap();
        assert!(channel.pause_print().await.is_err());
        assert!(channel.stop_print().await.is_err());
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("G1 X1 ; move"), "G1 X1");
        assert_eq!(strip_comment(";only comment"), "");
    }
}
