// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP listener for the relay.
//!
//! The listener owns the receive socket and a single reusable receive buffer. Every datagram is
//! copied out of that buffer into a [`RawFrame`] and offered to each downstream queue without
//! waiting; a full queue costs that queue the frame and nothing else. The receive loop is never
//! slowed down by the sinks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::errors::ListenerError;
use crate::frame::RawFrame;
use crate::queue::{DropCounter, QueueSender};

// Datagrams longer than this are truncated by the socket read. Payloads are opaque so there is
// nothing to reassemble; size the buffer for the largest expected datagram instead.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1024;

// How long close() waits for the receive loop before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the UDP listener
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind, e.g. "127.0.0.1:8888". Port 0 picks a free port.
    pub addr: String,
    /// Size of the receive buffer, in bytes
    pub max_datagram_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8888".to_string(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    Idle = 0,
    Listening = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ListenerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ListenerState::Idle,
            1 => ListenerState::Listening,
            2 => ListenerState::Closing,
            _ => ListenerState::Closed,
        }
    }
}

/// A downstream queue the listener offers every frame to.
pub struct FrameTarget {
    name: &'static str,
    queue: QueueSender<RawFrame>,
    drops: DropCounter,
}

impl FrameTarget {
    pub fn new(name: &'static str, queue: QueueSender<RawFrame>) -> Self {
        Self {
            name,
            queue,
            drops: DropCounter::new(name),
        }
    }

    fn offer(&self, frame: RawFrame) {
        if let Err(rejected) = self.queue.try_enqueue(frame) {
            self.drops.record(&rejected);
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    receive_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Non-empty datagrams read from the socket
    pub received: u64,
    /// Read errors not caused by closing the listener
    pub receive_errors: u64,
    /// Frames rejected per target, in target order
    pub dropped: Vec<(&'static str, u64)>,
}

/// UDP listener with an explicit `Idle → Listening → Closing → Closed` lifecycle.
pub struct Listener {
    config: ListenerConfig,
    state: Arc<AtomicU8>,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    drops: OnceLock<Vec<(&'static str, DropCounter)>>,
}

impl Listener {
    #[must_use]
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            state: Arc::new(AtomicU8::new(ListenerState::Idle as u8)),
            cancel_token: CancellationToken::new(),
            task: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            drops: OnceLock::new(),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Binds the socket and spawns the receive loop. Returns the bound address.
    pub async fn start(&self, targets: Vec<FrameTarget>) -> Result<SocketAddr, ListenerError> {
        match self.state() {
            ListenerState::Idle => {}
            ListenerState::Listening => return Err(ListenerError::AlreadyStarted),
            ListenerState::Closing | ListenerState::Closed => return Err(ListenerError::Closed),
        }

        let bind_error = |source| ListenerError::Bind {
            addr: self.config.addr.clone(),
            source,
        };
        let socket = UdpSocket::bind(&self.config.addr)
            .await
            .map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;

        if let Err(current) = self.state.compare_exchange(
            ListenerState::Idle as u8,
            ListenerState::Listening as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match ListenerState::from(current) {
                ListenerState::Listening => Err(ListenerError::AlreadyStarted),
                _ => Err(ListenerError::Closed),
            };
        }

        let _ = self.drops.set(
            targets
                .iter()
                .map(|target| (target.name, target.drops.clone()))
                .collect(),
        );

        let receive_loop = ReceiveLoop {
            socket,
            targets,
            max_datagram_size: self.config.max_datagram_size.max(1),
            state: Arc::clone(&self.state),
            cancel_token: self.cancel_token.clone(),
            counters: Arc::clone(&self.counters),
        };
        *self.task.lock().await = Some(tokio::spawn(receive_loop.spin()));

        info!("Started listening on UDP {}", local_addr);
        Ok(local_addr)
    }

    /// Stops the receive loop and releases the socket.
    ///
    /// Safe to call any number of times, before or after `start`. Only the first call does work.
    pub async fn close(&self) {
        match self.state.compare_exchange(
            ListenerState::Listening as u8,
            ListenerState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(current) => {
                // Never started: there is no loop or socket, just make start() fail from now on.
                if ListenerState::from(current) == ListenerState::Idle
                    && self
                        .state
                        .compare_exchange(
                            ListenerState::Idle as u8,
                            ListenerState::Closed as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.cancel_token.cancel();
                }
                return;
            }
        }

        info!("Closing UDP listener...");
        self.cancel_token.cancel();

        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!("UDP receive loop did not stop within {:?}, aborting", CLOSE_TIMEOUT);
                task.abort();
            }
        }

        self.state
            .store(ListenerState::Closed as u8, Ordering::Release);
        debug!("UDP listener closed");
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            receive_errors: self.counters.receive_errors.load(Ordering::Relaxed),
            dropped: self
                .drops
                .get()
                .map(|drops| {
                    drops
                        .iter()
                        .map(|(name, counter)| (*name, counter.dropped()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

// Everything the spawned loop owns. Dropping it releases the socket and the queue senders.
struct ReceiveLoop {
    socket: UdpSocket,
    targets: Vec<FrameTarget>,
    max_datagram_size: usize,
    state: Arc<AtomicU8>,
    cancel_token: CancellationToken,
    counters: Arc<Counters>,
}

impl ReceiveLoop {
    async fn spin(self) {
        let mut buf = vec![0u8; self.max_datagram_size];
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((0, src)) => trace!("Ignoring empty datagram from {}", src),
                Ok((amt, src)) => {
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    self.relay(RawFrame::new(&buf[..amt], src));
                }
                Err(e) => {
                    if self.is_closing() {
                        // the listener is shutting down; this read was interrupted on purpose
                        break;
                    }
                    self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to read UDP data: {}", e);
                }
            }
        }
        debug!("UDP receive loop stopped");
    }

    fn relay(&self, frame: RawFrame) {
        if let Some((last, rest)) = self.targets.split_last() {
            for target in rest {
                target.offer(frame.clone());
            }
            last.offer(frame);
        }
    }

    fn is_closing(&self) -> bool {
        matches!(
            ListenerState::from(self.state.load(Ordering::Acquire)),
            ListenerState::Closing | ListenerState::Closed
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::{bounded, QueueReceiver};
    use tracing_test::traced_test;

    fn local_config() -> ListenerConfig {
        ListenerConfig {
            addr: "127.0.0.1:0".to_string(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }

    async fn next_frame(rx: &mut QueueReceiver<RawFrame>) -> RawFrame {
        tokio::time::timeout(Duration::from_secs(2), rx.dequeue())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed")
    }

    async fn wait_for_received(listener: &Listener, count: u64) {
        for _ in 0..200 {
            if listener.stats().received >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("listener did not receive {count} datagrams");
    }

    #[tokio::test]
    async fn test_relays_datagrams_in_order() {
        let (tx, mut rx) = bounded(16);
        let listener = Listener::new(local_config());
        let addr = listener
            .start(vec![FrameTarget::new("test", tx)])
            .await
            .unwrap();
        assert_eq!(listener.state(), ListenerState::Listening);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            client.send_to(payload, addr).await.unwrap();
        }

        assert_eq!(next_frame(&mut rx).await.payload, b"one");
        assert_eq!(next_frame(&mut rx).await.payload, b"two");
        let last = next_frame(&mut rx).await;
        assert_eq!(last.payload, b"three");
        assert_eq!(last.peer, client.local_addr().unwrap());

        listener.close().await;
    }

    #[tokio::test]
    async fn test_fans_out_to_every_target() {
        let (publish_tx, mut publish_rx) = bounded(4);
        let (persist_tx, mut persist_rx) = bounded(4);
        let listener = Listener::new(local_config());
        let addr = listener
            .start(vec![
                FrameTarget::new("publish", publish_tx),
                FrameTarget::new("persist", persist_tx),
            ])
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"\x01\x02\x03", addr).await.unwrap();

        assert_eq!(next_frame(&mut publish_rx).await.payload, vec![1, 2, 3]);
        assert_eq!(next_frame(&mut persist_rx).await.payload, vec![1, 2, 3]);
        listener.close().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_stalling() {
        let (full_tx, mut full_rx) = bounded(1);
        let (open_tx, mut open_rx) = bounded(8);
        let listener = Listener::new(local_config());
        let addr = listener
            .start(vec![
                FrameTarget::new("slow", full_tx),
                FrameTarget::new("fast", open_tx),
            ])
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for payload in [&b"a"[..], b"b", b"c"] {
            client.send_to(payload, addr).await.unwrap();
        }
        wait_for_received(&listener, 3).await;

        // The saturated target lost frames, the other one got all of them.
        let stats = listener.stats();
        assert_eq!(stats.dropped, vec![("slow", 2), ("fast", 0)]);
        assert_eq!(next_frame(&mut full_rx).await.payload, b"a");
        for expected in [&b"a"[..], b"b", b"c"] {
            assert_eq!(next_frame(&mut open_rx).await.payload, expected);
        }
        listener.close().await;
    }

    #[tokio::test]
    async fn test_payload_does_not_alias_receive_buffer() {
        let (tx, mut rx) = bounded(4);
        let listener = Listener::new(local_config());
        let addr = listener
            .start(vec![FrameTarget::new("test", tx)])
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"first-payload", addr).await.unwrap();
        client.send_to(b"XY", addr).await.unwrap();
        wait_for_received(&listener, 2).await;

        assert_eq!(next_frame(&mut rx).await.payload, b"first-payload");
        assert_eq!(next_frame(&mut rx).await.payload, b"XY");
        listener.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_oversized_datagram_is_truncated() {
        let (tx, mut rx) = bounded(4);
        let listener = Listener::new(ListenerConfig {
            addr: "127.0.0.1:0".to_string(),
            max_datagram_size: 4,
        });
        let addr = listener
            .start(vec![FrameTarget::new("test", tx)])
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"abcdefgh", addr).await.unwrap();

        assert_eq!(next_frame(&mut rx).await.payload, b"abcd");
        listener.close().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_close_is_idempotent() {
        let (tx, mut rx) = bounded(4);
        let listener = Listener::new(local_config());
        listener
            .start(vec![FrameTarget::new("test", tx)])
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            listener.close().await;
            listener.close().await;
        })
        .await
        .expect("close blocked");
        assert_eq!(listener.state(), ListenerState::Closed);

        // The loop is gone and took the only sender with it.
        let next = tokio::time::timeout(Duration::from_secs(1), rx.dequeue())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(!logs_contain("Failed to read UDP data"));
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let listener = Listener::new(local_config());
        listener.close().await;
        assert_eq!(listener.state(), ListenerState::Closed);

        let (tx, _rx) = bounded(1);
        let result = listener.start(vec![FrameTarget::new("test", tx)]).await;
        assert!(matches!(result, Err(ListenerError::Closed)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let listener = Listener::new(local_config());
        let (tx, _rx) = bounded(1);
        listener
            .start(vec![FrameTarget::new("test", tx.clone())])
            .await
            .unwrap();
        let result = listener.start(vec![FrameTarget::new("test", tx)]).await;
        assert!(matches!(result, Err(ListenerError::AlreadyStarted)));
        listener.close().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = Listener::new(ListenerConfig {
            addr: taken.local_addr().unwrap().to_string(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        });
        let (tx, _rx) = bounded(1);
        let result = listener.start(vec![FrameTarget::new("test", tx)]).await;
        assert!(matches!(result, Err(ListenerError::Bind { .. })));
        assert_eq!(listener.state(), ListenerState::Idle);
    }
}
