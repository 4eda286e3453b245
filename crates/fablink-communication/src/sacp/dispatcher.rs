//! SACP dispatcher
//!
//! Owns one link. A receive task decodes frames and routes each one to,
//! in order: the pending request with the same tag and sequence, the
//! subscription callbacks for its tag, or the handler registered for
//! machine-initiated requests. Anything else is logged and dropped.
//!
//! Every `send` resolves: with the correlated ack, with a timeout, or with
//! `ConnectionClosed` when the link goes away. Closing clears all
//! subscriptions and handlers and is observable through [`Dispatcher::closed`].

use super::buffer::PayloadWriter;
use super::commands::{system, RESULT_OK};
use super::packet::{CommandTag, FrameDecoder, Packet, PeerId};
use crate::link::{Link, LinkEvent, LinkWriter};
use fablink_core::{ConnectionError, DisconnectReason, ProtocolError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Safety timeout for every request; `None` waits until the link closes.
    pub request_timeout: Option<Duration>,
    /// Consecutive corrupt frames that force a close; 0 never closes.
    pub corruption_threshold: u32,
    /// Address written as sender.
    pub local_peer: PeerId,
    /// Address for requests that do not name one.
    pub default_peer: PeerId,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            corruption_threshold: 32,
            local_peer: PeerId::Host,
            default_peer: PeerId::Controller,
        }
    }
}

/// Why a dispatcher stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// `close` was called.
    Local,
    /// The link closed, with the transport's error text if any.
    Transport(Option<String>),
    /// Too many consecutive corrupt frames.
    Corrupt(u32),
}

impl CloseCause {
    /// Map to the reason reported to callers
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            CloseCause::Local => DisconnectReason::UserRequested,
            CloseCause::Transport(reason) => DisconnectReason::ConnectionLost(
                reason.clone().unwrap_or_else(|| "closed by peer".to_string()),
            ),
            CloseCause::Corrupt(_) => DisconnectReason::CorruptStream,
        }
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCause::Local => write!(f, "closed locally"),
            CloseCause::Transport(Some(reason)) => write!(f, "transport closed: {}", reason),
            CloseCause::Transport(None) => write!(f, "transport closed by peer"),
            CloseCause::Corrupt(count) => write!(f, "{} consecutive corrupt frames", count),
        }
    }
}

/// Handle for one subscription callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sacp-sub-{}", self.0)
    }
}

/// Callback for pushed telemetry
pub type SubscriptionCallback = Arc<dyn Fn(&Packet) + Send + Sync>;
/// Handler for machine-initiated requests; answers with [`Dispatcher::ack`]
pub type RequestHandler = Arc<dyn Fn(&Dispatcher, Packet) + Send + Sync>;

type PendingKey = (CommandTag, u16);
type Waiter = oneshot::Sender<Result<Packet>>;

struct Inner {
    config: DispatcherConfig,
    peer: String,
    sequence: AtomicU16,
    next_subscription: AtomicU64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    writer: Arc<dyn LinkWriter>,
    pending: Mutex<HashMap<PendingKey, Waiter>>,
    subscriptions: RwLock<HashMap<CommandTag, Vec<(SubscriptionId, SubscriptionCallback)>>>,
    handlers: RwLock<HashMap<CommandTag, RequestHandler>>,
    closed: watch::Sender<Option<CloseCause>>,
    is_closed: AtomicBool,
}

impl Inner {
    fn shutdown(&self, cause: CloseCause) {
        if self.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &cause {
            CloseCause::Local => tracing::info!("Dispatcher for {} closed", self.peer),
            CloseCause::Transport(_) => tracing::warn!("Dispatcher for {}: {}", self.peer, cause),
            CloseCause::Corrupt(_) => tracing::error!("Dispatcher for {}: {}", self.peer, cause),
        }

        let reason = cause.to_string();
        let waiters: Vec<Waiter> = self.pending.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(ConnectionError::closed(reason.clone()).into()));
        }
        self.subscriptions.write().clear();
        self.handlers.write().clear();
        self.closed.send_replace(Some(cause));
    }
}

/// Removes a pending entry if the request future is dropped early
struct PendingGuard<'a> {
    inner: &'a Inner,
    key: PendingKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.key);
    }
}

/// Multiplexes requests, subscriptions, and machine requests over one link
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Take ownership of a link and start the receive and write tasks
    pub fn start(link: Link, config: DispatcherConfig) -> Self {
        let Link {
            writer,
            events,
            peer,
        } = link;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);

        let dispatcher = Self {
            inner: Arc::new(Inner {
                config,
                peer,
                sequence: AtomicU16::new(1),
                next_subscription: AtomicU64::new(1),
                outbound,
                writer,
                pending: Mutex::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                closed,
                is_closed: AtomicBool::new(false),
            }),
        };

        tokio::spawn(write_loop(dispatcher.inner.clone(), outbound_rx));
        tokio::spawn(receive_loop(dispatcher.clone(), events));
        tracing::debug!("Dispatcher started for {}", dispatcher.inner.peer);
        dispatcher
    }

    /// Peer description of the underlying link
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Configuration in use
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Whether the dispatcher has stopped
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::SeqCst)
    }

    /// Why the dispatcher stopped, if it has
    pub fn close_cause(&self) -> Option<CloseCause> {
        self.inner.closed.borrow().clone()
    }

    /// Resolves once the dispatcher stops
    pub fn closed(&self) -> impl Future<Output = CloseCause> + Send + 'static {
        wait_closed(self.inner.closed.subscribe())
    }

    /// Requests awaiting an ack
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Local callbacks registered for a tag
    pub fn subscription_count(&self, tag: CommandTag) -> usize {
        self.inner
            .subscriptions
            .read()
            .get(&tag)
            .map_or(0, Vec::len)
    }

    /// Whether a request handler is registered for a tag
    pub fn has_handler(&self, tag: CommandTag) -> bool {
        self.inner.handlers.read().contains_key(&tag)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            let reason = format!("dispatcher for {} is closed", self.inner.peer);
            return Err(ConnectionError::closed(reason).into());
        }
        Ok(())
    }

    fn next_sequence(&self) -> u16 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, frame: Vec<u8>) -> Result<()> {
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| ConnectionError::closed("writer stopped").into())
    }

    /// Send a request and wait for its ack, using the configured timeout
    pub async fn send(&self, tag: CommandTag, receiver: PeerId, payload: Vec<u8>) -> Result<Packet> {
        self.send_with_timeout(tag, receiver, payload, self.inner.config.request_timeout)
            .await
    }

    /// Send a request and wait for its ack with an explicit timeout
    pub async fn send_with_timeout(
        &self,
        tag: CommandTag,
        receiver: PeerId,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Packet> {
        self.ensure_open()?;
        let sequence = self.next_sequence();
        let frame =
            Packet::request(tag, self.inner.config.local_peer, receiver, sequence, payload).encode()?;

        let key = (tag, sequence);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(key, tx);
        let _guard = PendingGuard {
            inner: &self.inner,
            key,
        };
        // A close racing the insert has already drained the table.
        self.ensure_open()?;
        self.enqueue(frame)?;
        tracing::trace!("-> {} seq {} to {}", tag, sequence, self.inner.peer);

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!("{} seq {} timed out after {:?}", tag, sequence, limit);
                    return Err(ProtocolError::RequestTimeout {
                        command_set: tag.command_set,
                        command_id: tag.command_id,
                        timeout_ms: limit.as_millis() as u64,
                    }
                    .into());
                }
            },
            None => rx.await,
        };
        outcome.unwrap_or_else(|_| Err(ConnectionError::closed("dispatcher dropped the request").into()))
    }

    /// Send to the default peer and return the ack body on result code 0
    pub async fn request(&self, tag: CommandTag, payload: Vec<u8>) -> Result<Vec<u8>> {
        let ack = self.send(tag, self.inner.config.default_peer, payload).await?;
        check_result(&ack)?;
        Ok(ack.body().to_vec())
    }

    /// Send a frame without waiting for any ack; returns its sequence
    pub fn post(&self, tag: CommandTag, receiver: PeerId, payload: Vec<u8>) -> Result<u16> {
        self.ensure_open()?;
        let sequence = self.next_sequence();
        let frame =
            Packet::request(tag, self.inner.config.local_peer, receiver, sequence, payload).encode()?;
        self.enqueue(frame)?;
        Ok(sequence)
    }

    /// Answer a machine-initiated request, echoing its sequence
    pub fn ack(&self, original: &Packet, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let frame = original.ack_for(payload).encode()?;
        tracing::trace!("ack {} seq {}", original.tag, original.sequence);
        self.enqueue(frame)
    }

    /// Register a callback for pushes of `tag` and ask the machine to push every `interval_ms`
    ///
    /// The callback is registered before the request goes out so the first
    /// push cannot be missed. If the machine refuses, it is removed again.
    pub async fn subscribe<F>(&self, tag: CommandTag, interval_ms: u16, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscriptions
            .write()
            .entry(tag)
            .or_default()
            .push((id, Arc::new(callback)));

        let payload = PayloadWriter::new()
            .u8(tag.command_set)
            .u8(tag.command_id)
            .u16(interval_ms)
            .finish();
        match self.request(system::SUBSCRIBE, payload).await {
            Ok(_) => {
                tracing::debug!("Subscribed {} to {} every {}ms", id, tag, interval_ms);
                Ok(id)
            }
            Err(e) => {
                self.remove_callback(tag, id);
                Err(e)
            }
        }
    }

    /// Remove a callback; the remote subscription is cancelled with the last one
    ///
    /// Returns false if the id was not registered for `tag`.
    pub async fn unsubscribe(&self, tag: CommandTag, id: SubscriptionId) -> Result<bool> {
        let (found, was_last) = self.remove_callback(tag, id);
        if !found {
            return Ok(false);
        }
        if was_last && !self.is_closed() {
            let payload = PayloadWriter::new()
                .u8(tag.command_set)
                .u8(tag.command_id)
                .finish();
            self.request(system::UNSUBSCRIBE, payload).await?;
            tracing::debug!("Unsubscribed from {}", tag);
        }
        Ok(true)
    }

    fn remove_callback(&self, tag: CommandTag, id: SubscriptionId) -> (bool, bool) {
        let mut subscriptions = self.inner.subscriptions.write();
        let Some(callbacks) = subscriptions.get_mut(&tag) else {
            return (false, false);
        };
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        let found = callbacks.len() != before;
        let now_empty = callbacks.is_empty();
        if now_empty {
            subscriptions.remove(&tag);
        }
        (found, found && now_empty)
    }

    /// Register the handler for machine-initiated requests of `tag`
    ///
    /// Returns true if it replaced an existing handler.
    pub fn set_handler<F>(&self, tag: CommandTag, handler: F) -> bool
    where
        F: Fn(&Dispatcher, Packet) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .insert(tag, Arc::new(handler))
            .is_some()
    }

    /// Remove the handler for `tag`
    pub fn remove_handler(&self, tag: CommandTag) -> bool {
        self.inner.handlers.write().remove(&tag).is_some()
    }

    /// Stop the dispatcher and shut the link down
    pub async fn close(&self) {
        self.inner.shutdown(CloseCause::Local);
        if let Err(e) = self.inner.writer.shutdown().await {
            tracing::debug!("Link shutdown for {} failed: {}", self.inner.peer, e);
        }
    }

    fn route(&self, packet: Packet) {
        let tag = packet.tag;
        tracing::trace!("<- {} seq {} ({:?})", tag, packet.sequence, packet.attribute);

        if packet.is_ack() {
            let waiter = self.inner.pending.lock().remove(&(tag, packet.sequence));
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(packet));
                return;
            }
        }

        let callbacks: Vec<SubscriptionCallback> = self
            .inner
            .subscriptions
            .read()
            .get(&tag)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        if !callbacks.is_empty() {
            for callback in &callbacks {
                callback(&packet);
            }
            return;
        }

        if !packet.is_ack() {
            let handler = self.inner.handlers.read().get(&tag).cloned();
            if let Some(handler) = handler {
                handler(self, packet);
                return;
            }
        }

        tracing::debug!(
            "Dropping unmatched {} seq {} from {}",
            tag,
            packet.sequence,
            self.inner.peer
        );
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Turn a non-zero result byte into an error
pub fn check_result(ack: &Packet) -> Result<()> {
    match ack.result_code() {
        Some(RESULT_OK) => Ok(()),
        Some(code) => Err(ProtocolError::ResultCode {
            command_set: ack.tag.command_set,
            command_id: ack.tag.command_id,
            code,
        }
        .into()),
        None => Err(ProtocolError::MalformedPayload {
            reason: format!("empty ack for {}", ack.tag),
        }
        .into()),
    }
}

async fn wait_closed(mut closed: watch::Receiver<Option<CloseCause>>) -> CloseCause {
    loop {
        if let Some(cause) = closed.borrow_and_update().clone() {
            return cause;
        }
        if closed.changed().await.is_err() {
            return CloseCause::Local;
        }
    }
}

async fn write_loop(inner: Arc<Inner>, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    let closed = wait_closed(inner.closed.subscribe());
    tokio::pin!(closed);
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = inner.writer.write_all(&frame).await {
                    tracing::error!("Write to {} failed: {}", inner.peer, e);
                    inner.shutdown(CloseCause::Transport(Some(e.to_string())));
                    break;
                }
            }
            _ = &mut closed => break,
        }
    }
    let _ = inner.writer.shutdown().await;
}

async fn receive_loop(dispatcher: Dispatcher, mut events: mpsc::Receiver<LinkEvent>) {
    let inner = dispatcher.inner.clone();
    let mut decoder = FrameDecoder::new();
    let mut consecutive_faults = 0u32;
    let closed = wait_closed(inner.closed.subscribe());
    tokio::pin!(closed);

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = &mut closed => return,
        };
        match event {
            Some(LinkEvent::Data(bytes)) => {
                decoder.push(&bytes);
                while let Some(frame) = decoder.next_frame() {
                    match frame {
                        Ok(packet) => {
                            consecutive_faults = 0;
                            dispatcher.route(packet);
                        }
                        Err(fault) => {
                            consecutive_faults += 1;
                            tracing::warn!(
                                "Dropping frame from {}: {} ({} in a row)",
                                inner.peer,
                                fault,
                                consecutive_faults
                            );
                            let threshold = inner.config.corruption_threshold;
                            if threshold > 0 && consecutive_faults >= threshold {
                                inner.shutdown(CloseCause::Corrupt(consecutive_faults));
                                return;
                            }
                        }
                    }
                }
            }
            Some(LinkEvent::Closed(reason)) => {
                inner.shutdown(CloseCause::Transport(reason));
                return;
            }
            None => {
                inner.shutdown(CloseCause::Transport(Some("link reader stopped".to_string())));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockPeer;
    use crate::sacp::commands::{nozzle, print};
    use fablink_core::Error;
    use std::sync::atomic::AtomicUsize;

    /// Hand-driven machine side of a mock link
    struct Machine {
        peer: MockPeer,
        decoder: FrameDecoder,
    }

    impl Machine {
        async fn next_packet(&mut self) -> Packet {
            loop {
                if let Some(frame) = self.decoder.next_frame() {
                    return frame.expect("host wrote a corrupt frame");
                }
                let bytes = self.peer.recv_written().await.expect("host hung up");
                self.decoder.push(&bytes);
            }
        }

        async fn reply(&self, request: &Packet, payload: Vec<u8>) {
            self.peer.push(request.ack_for(payload).encode().unwrap()).await;
        }

        async fn push(&self, packet: Packet) {
            self.peer.push(packet.encode().unwrap()).await;
        }
    }

    fn start(config: DispatcherConfig) -> (Dispatcher, Machine) {
        let (link, peer) = MockPeer::pair("bench");
        let dispatcher = Dispatcher::start(link, config);
        (
            dispatcher,
            Machine {
                peer,
                decoder: FrameDecoder::new(),
            },
        )
    }

    fn machine_push(tag: CommandTag, sequence: u16, payload: Vec<u8>) -> Packet {
        Packet {
            receiver: PeerId::Host,
            sender: PeerId::Controller,
            attribute: crate::sacp::packet::Attribute::Ack,
            sequence,
            tag,
            payload,
        }
    }

    #[tokio::test]
    async fn test_responses_correlate_out_of_order() {
        let (dispatcher, mut machine) = start(DispatcherConfig::default());
        let tag = system::MACHINE_INFO;

        let mut calls = Vec::new();
        for _ in 0..3 {
            let d = dispatcher.clone();
            calls.push(tokio::spawn(async move {
                d.send(tag, PeerId::Controller, vec![]).await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(machine.next_packet().await);
        }
        // Answer newest first; each ack carries its own sequence in the body.
        for request in requests.iter().rev() {
            let seq = request.sequence.to_le_bytes();
            machine.reply(request, vec![0, seq[0], seq[1]]).await;
        }

        for call in calls {
            let ack = call.await.unwrap().unwrap();
            let echoed = u16::from_le_bytes([ack.body()[0], ack.body()[1]]);
            assert_eq!(echoed, ack.sequence);
        }
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_checks_result_code() {
        let (dispatcher, mut machine) = start(DispatcherConfig::default());
        let call = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.request(nozzle::SET_TEMPERATURE, vec![1, 0]).await }
        });
        let request = machine.next_packet().await;
        machine.reply(&request, vec![5]).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.result_code(), Some(5));
        assert!(!dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_request_timeout_does_not_leak() {
        let config = DispatcherConfig {
            request_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let (dispatcher, _machine) = start(config);

        let err = dispatcher
            .send(system::MACHINE_INFO, PeerId::Controller, vec![])
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_future_is_forgotten() {
        let config = DispatcherConfig {
            request_timeout: None,
            ..Default::default()
        };
        let (dispatcher, _machine) = start(config);

        let send = dispatcher.send(system::MACHINE_INFO, PeerId::Controller, vec![]);
        let _ = tokio::time::timeout(Duration::from_millis(20), send).await;
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_close_fails_pending_and_clears_tables() {
        let config = DispatcherConfig {
            request_timeout: None,
            ..Default::default()
        };
        let (dispatcher, mut machine) = start(config);
        dispatcher.set_handler(print::REQUEST_GCODE, |_, _| {});

        let call = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.send(system::MACHINE_INFO, PeerId::Controller, vec![]).await }
        });
        machine.next_packet().await;
        machine.peer.close(Some("connection reset")).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ConnectionClosed { .. })
        ));
        assert_eq!(
            dispatcher.closed().await,
            CloseCause::Transport(Some("connection reset".to_string()))
        );
        assert!(!dispatcher.has_handler(print::REQUEST_GCODE));
        assert!(dispatcher
            .send(system::MACHINE_INFO, PeerId::Controller, vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_subscription_receives_pushes_until_unsubscribed() {
        let (dispatcher, mut machine) = start(DispatcherConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));

        let subscribe = tokio::spawn({
            let d = dispatcher.clone();
            let seen = seen.clone();
            async move {
                d.subscribe(system::HEARTBEAT, 1000, move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }
        });
        let request = machine.next_packet().await;
        assert_eq!(request.tag, system::SUBSCRIBE);
        assert_eq!(request.payload, vec![0x01, 0xa0, 0xe8, 0x03]);
        machine.reply(&request, vec![0]).await;
        let id = subscribe.await.unwrap().unwrap();

        machine.push(machine_push(system::HEARTBEAT, 900, vec![0, 1])).await;
        machine.push(machine_push(system::HEARTBEAT, 901, vec![0, 1])).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let unsubscribe = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.unsubscribe(system::HEARTBEAT, id).await }
        });
        let request = machine.next_packet().await;
        assert_eq!(request.tag, system::UNSUBSCRIBE);
        machine.reply(&request, vec![0]).await;
        assert!(unsubscribe.await.unwrap().unwrap());
        assert_eq!(dispatcher.subscription_count(system::HEARTBEAT), 0);
        assert!(!dispatcher.unsubscribe(system::HEARTBEAT, id).await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_subscription_is_removed() {
        let (dispatcher, mut machine) = start(DispatcherConfig::default());
        let subscribe = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.subscribe(nozzle::INFO, 500, |_| {}).await }
        });
        let request = machine.next_packet().await;
        machine.reply(&request, vec![3]).await;

        assert!(subscribe.await.unwrap().is_err());
        assert_eq!(dispatcher.subscription_count(nozzle::INFO), 0);
    }

    #[tokio::test]
    async fn test_handler_answers_machine_request() {
        let (dispatcher, mut machine) = start(DispatcherConfig::default());
        dispatcher.set_handler(print::REQUEST_GCODE, |d, packet| {
            d.ack(&packet, vec![0, 42]).unwrap();
        });

        let request = Packet::request(
            print::REQUEST_GCODE,
            PeerId::Controller,
            PeerId::Host,
            77,
            vec![],
        );
        machine.push(request).await;

        let ack = machine.next_packet().await;
        assert!(ack.is_ack());
        assert_eq!(ack.sequence, 77);
        assert_eq!(ack.sender, PeerId::Host);
        assert_eq!(ack.receiver, PeerId::Controller);
        assert_eq!(ack.payload, vec![0, 42]);
    }

    #[tokio::test]
    async fn test_unmatched_frames_are_dropped() {
        let (dispatcher, machine) = start(DispatcherConfig::default());
        machine.push(machine_push(nozzle::INFO, 5, vec![0])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_corrupt_stream_forces_close() {
        let config = DispatcherConfig {
            corruption_threshold: 3,
            ..Default::default()
        };
        let (dispatcher, machine) = start(config);

        let mut corrupt = machine_push(nozzle::INFO, 1, vec![0, 1, 2]).encode().unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x5A;
        for _ in 0..3 {
            machine.peer.push(corrupt.clone()).await;
        }

        let cause = tokio::time::timeout(Duration::from_secs(1), dispatcher.closed())
            .await
            .unwrap();
        assert_eq!(cause, CloseCause::Corrupt(3));
        assert_eq!(cause.disconnect_reason(), DisconnectReason::CorruptStream);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !machine.peer.is_shut_down() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_good_frame_resets_corruption_count() {
        let config = DispatcherConfig {
            corruption_threshold: 2,
            ..Default::default()
        };
        let (dispatcher, machine) = start(config);

        let mut corrupt = machine_push(nozzle::INFO, 1, vec![9]).encode().unwrap();
        corrupt[13] ^= 0xFF;
        let good = machine_push(nozzle::INFO, 2, vec![0]).encode().unwrap();
        for _ in 0..3 {
            machine.peer.push(corrupt.clone()).await;
            machine.peer.push(good.clone()).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (dispatcher, machine) = start(DispatcherConfig::default());
        dispatcher.close().await;
        dispatcher.close().await;
        assert_eq!(dispatcher.close_cause(), Some(CloseCause::Local));
        assert!(machine.peer.is_shut_down());
        assert!(dispatcher.post(system::HEARTBEAT, PeerId::Controller, vec![]).is_err());
    }
}
