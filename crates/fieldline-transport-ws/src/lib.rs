//! WebSocket-backed pub/sub transport for fieldline.
//!
//! Provides a [`PubSubTransport`] implementation backed by a single outbound
//! WebSocket connection with reconnect/backoff. Registered subscription
//! filters are replayed to the broker after every (re)connect, so callers
//! never re-subscribe manually.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use fieldline_transport::filter::topic_matches;
use fieldline_transport::pubsub::{FrameHandler, PubSubTransport, TransportError};

#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    pub url: String,
    pub reconnect: bool,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub outbound_queue_capacity: usize,
}

impl WsTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: true,
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            outbound_queue_capacity: 1024,
        }
    }
}

/// Frames exchanged with the broker endpoint, JSON-encoded over text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsFrame {
    Publish { topic: String, data: Vec<u8> },
    Subscribe { filter: String },
    Unsubscribe { filter: String },
}

type SubscriptionTable = Arc<Mutex<HashMap<String, FrameHandler>>>;

pub struct WsTransport {
    config: WsTransportConfig,
    subscriptions: SubscriptionTable,
    outbound_tx: Mutex<Option<tokio_mpsc::Sender<WsFrame>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        Self {
            config,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            outbound_tx: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn try_send_control(&self, frame: WsFrame) {
        // Best effort: a miss here is recovered by the replay that runs on
        // every (re)connect.
        let guard = self.outbound_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(frame);
        }
    }
}

impl PubSubTransport for WsTransport {
    fn connect(&self) -> Result<(), TransportError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        let (outbound_tx, outbound_rx) =
            tokio_mpsc::channel::<WsFrame>(self.config.outbound_queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let config = self.config.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        let connected = Arc::clone(&self.connected);
        let handle = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    warn!("ws transport: failed to build tokio runtime: {err}");
                    return;
                }
            };
            runtime.block_on(run_ws_worker(
                config,
                subscriptions,
                connected,
                outbound_rx,
                shutdown_rx,
            ));
        });

        *self.outbound_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(outbound_tx);
        *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);
        *worker = Some(handle);
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        let guard = self.outbound_tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.try_send(WsFrame::Publish {
            topic: topic.to_string(),
            data: payload.to_vec(),
        })
        .map_err(|err| match err {
            tokio_mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            tokio_mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn subscribe(&self, filter: &str, handler: FrameHandler) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            if subscriptions.contains_key(filter) {
                return Err(TransportError::AlreadySubscribed {
                    filter: filter.to_string(),
                });
            }
            subscriptions.insert(filter.to_string(), handler);
        }
        self.try_send_control(WsFrame::Subscribe {
            filter: filter.to_string(),
        });
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            if subscriptions.remove(filter).is_none() {
                return Err(TransportError::NotSubscribed {
                    filter: filter.to_string(),
                });
            }
        }
        self.try_send_control(WsFrame::Unsubscribe {
            filter: filter.to_string(),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn close(&self) -> Result<(), TransportError> {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
        self.outbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = worker.join();
        }
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn dispatch_inbound(subscriptions: &SubscriptionTable, topic: &str, data: &[u8]) {
    let matching: Vec<FrameHandler> = {
        let subscriptions = subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    };
    for handler in matching {
        handler(topic, data);
    }
}

async fn run_ws_worker(
    config: WsTransportConfig,
    subscriptions: SubscriptionTable,
    connected: Arc<AtomicBool>,
    mut outbound_rx: tokio_mpsc::Receiver<WsFrame>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut backoff = config.reconnect_initial;

    'outer: loop {
        tokio::select! {
            _ = &mut shutdown_rx => break 'outer,
            connect_result = connect_async(&config.url) => {
                match connect_result {
                    Ok((stream, _)) => {
                        backoff = config.reconnect_initial;
                        let (mut write, mut read) = stream.split();

                        // Replay every registered filter so subscriptions
                        // survive reconnects without caller involvement.
                        let filters: Vec<String> = {
                            let subscriptions =
                                subscriptions.lock().unwrap_or_else(|e| e.into_inner());
                            subscriptions.keys().cloned().collect()
                        };
                        let mut replay_ok = true;
                        for filter in filters {
                            let frame = WsFrame::Subscribe { filter };
                            let Ok(text) = serde_json::to_string(&frame) else {
                                continue;
                            };
                            if write.send(Message::Text(text)).await.is_err() {
                                replay_ok = false;
                                break;
                            }
                        }

                        if replay_ok {
                            connected.store(true, Ordering::Relaxed);
                            loop {
                                tokio::select! {
                                    _ = &mut shutdown_rx => {
                                        connected.store(false, Ordering::Relaxed);
                                        break 'outer;
                                    }
                                    maybe_out = outbound_rx.recv() => {
                                        match maybe_out {
                                            Some(frame) => {
                                                let Ok(text) = serde_json::to_string(&frame) else {
                                                    continue;
                                                };
                                                if write.send(Message::Text(text)).await.is_err() {
                                                    break;
                                                }
                                            }
                                            None => {
                                                connected.store(false, Ordering::Relaxed);
                                                break 'outer;
                                            }
                                        }
                                    }
                                    maybe_in = read.next() => {
                                        match maybe_in {
                                            Some(Ok(Message::Text(text))) => {
                                                match serde_json::from_str::<WsFrame>(&text) {
                                                    Ok(WsFrame::Publish { topic, data }) => {
                                                        dispatch_inbound(&subscriptions, &topic, &data);
                                                    }
                                                    Ok(_) => {}
                                                    Err(err) => {
                                                        debug!("ws transport: dropping unparseable frame: {err}");
                                                    }
                                                }
                                            }
                                            Some(Ok(Message::Close(_))) => break,
                                            Some(Ok(_)) => {}
                                            Some(Err(_)) | None => break,
                                        }
                                    }
                                }
                            }
                        }
                        connected.store(false, Ordering::Relaxed);
                    }
                    Err(err) => {
                        debug!("ws transport: connect to {} failed: {err}", config.url);
                        connected.store(false, Ordering::Relaxed);
                    }
                }

                if !config.reconnect {
                    break 'outer;
                }

                tokio::select! {
                    _ = &mut shutdown_rx => break 'outer,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = std::cmp::min(backoff.saturating_mul(2), config.reconnect_max);
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use super::{WsFrame, WsTransport, WsTransportConfig};
    use fieldline_transport::pubsub::{PubSubTransport, TransportError};

    #[test]
    fn publish_before_connect_fails() {
        let transport = WsTransport::new(WsTransportConfig::new("ws://127.0.0.1:1"));
        let err = transport
            .publish("devices/d1", b"{}")
            .expect_err("publish without connect should fail");
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn subscriptions_register_before_connect_and_reject_duplicates() {
        let transport = WsTransport::new(WsTransportConfig::new("ws://127.0.0.1:1"));
        transport
            .subscribe("devices/#", Arc::new(|_, _| {}))
            .expect("subscribe should succeed");
        let err = transport
            .subscribe("devices/#", Arc::new(|_, _| {}))
            .expect_err("duplicate subscribe should fail");
        assert!(matches!(err, TransportError::AlreadySubscribed { .. }));
        transport
            .unsubscribe("devices/#")
            .expect("unsubscribe should succeed");
        let err = transport
            .unsubscribe("devices/#")
            .expect_err("second unsubscribe should fail");
        assert!(matches!(err, TransportError::NotSubscribed { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_flow_between_transport_and_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept should succeed");
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("handshake should succeed");
            let (mut write, mut read) = ws.split();

            // First frame is the replayed subscription filter.
            let first = read
                .next()
                .await
                .expect("subscribe frame expected")
                .expect("subscribe frame should read");
            let frame: WsFrame =
                serde_json::from_str(first.to_text().expect("text frame")).expect("frame json");
            assert_eq!(
                frame,
                WsFrame::Subscribe {
                    filter: "devices/#".to_string()
                }
            );

            // Push one broker-originated publish down to the client.
            let inbound = WsFrame::Publish {
                topic: "devices/d1/telemetry".to_string(),
                data: b"{\"v\":1}".to_vec(),
            };
            write
                .send(Message::Text(
                    serde_json::to_string(&inbound).expect("frame json"),
                ))
                .await
                .expect("server send should succeed");

            // Then expect the client's own publish.
            let second = read
                .next()
                .await
                .expect("publish frame expected")
                .expect("publish frame should read");
            let frame: WsFrame =
                serde_json::from_str(second.to_text().expect("text frame")).expect("frame json");
            match frame {
                WsFrame::Publish { topic, .. } => assert_eq!(topic, "devices/d1/commands"),
                other => panic!("expected publish frame, got {other:?}"),
            }
        });

        let transport = WsTransport::new(WsTransportConfig::new(format!("ws://{addr}")));
        let (tx, rx) = mpsc::channel::<(String, Vec<u8>)>();
        transport
            .subscribe(
                "devices/#",
                Arc::new(move |topic, data| {
                    let _ = tx.send((topic.to_string(), data.to_vec()));
                }),
            )
            .expect("subscribe should succeed");
        transport.connect().expect("connect should spawn worker");

        for _ in 0..200 {
            if transport.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(transport.is_connected(), "transport should connect");

        let (topic, data) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("inbound publish expected");
        assert_eq!(topic, "devices/d1/telemetry");
        assert_eq!(data, b"{\"v\":1}".to_vec());

        transport
            .publish("devices/d1/commands", b"{\"cmd\":\"ping\"}")
            .expect("publish should succeed");

        server.await.expect("server task should finish");
        transport.close().expect("close should succeed");
    }
}
