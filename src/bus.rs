//! MQTT session with acknowledged publishing.
//!
//! rumqttc splits a connection into an `AsyncClient`, used to send requests,
//! and an `EventLoop`, which has to be polled to do any network I/O at all.
//! The event loop runs on its own task for the lifetime of the session. It
//! also watches for the packets that complete a QoS 2 exchange, so
//! [`BusSession::publish`] can wait for the broker's PUBCOMP before
//! returning.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

/// How long the event loop waits before polling again after a connection error.
/// rumqttc reconnects on the next poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Capacity of the client's request channel
const REQUEST_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to MQTT broker {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: ConnectionError,
    },
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT session closed before the broker acknowledged the publish")]
    SessionClosed,
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Something that can publish to the bus and wait for delivery.
#[async_trait]
pub trait Publish: Send + Sync {
    /// Publish with QoS 2 ("exactly once") and return once the broker has
    /// acknowledged the message, or the session failed.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

#[async_trait]
impl<T: Publish + ?Sized> Publish for &T {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        (**self).publish(topic, payload).await
    }
}

type Waiter = oneshot::Sender<Result<(), BusError>>;

#[derive(Default)]
struct AckState {
    /// Callers whose publish has been handed to the client but not yet sent
    queued: VecDeque<Waiter>,
    /// Callers whose publish went out with the given packet id
    in_flight: HashMap<u16, Waiter>,
    closed: bool,
}

/// Matches QoS 2 publishes to their PUBCOMP.
///
/// The client sends requests in the order they were submitted, so each
/// `Outgoing::Publish(pkid)` belongs to the oldest queued caller. A pkid that
/// is already in flight is a retransmission after a reconnect and is left
/// alone.
#[derive(Default)]
pub(crate) struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    fn lock(&self) -> MutexGuard<'_, AckState> {
        // A poisoned lock only means another thread panicked mid-update;
        // the queue itself is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self) -> Result<oneshot::Receiver<Result<(), BusError>>, BusError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BusError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        state.queued.push_back(tx);
        Ok(rx)
    }

    /// Forget the most recent registration, for a publish the client refused
    fn unregister_last(&self) {
        self.lock().queued.pop_back();
    }

    fn on_event(&self, event: &Event) {
        let mut state = self.lock();
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if state.in_flight.contains_key(pkid) {
                    debug!(pkid, "retransmitting publish");
                    return;
                }
                match state.queued.pop_front() {
                    Some(waiter) => {
                        state.in_flight.insert(*pkid, waiter);
                    }
                    None => warn!(pkid, "outgoing publish without a waiting caller"),
                }
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                if let Some(waiter) = state.in_flight.remove(&comp.pkid) {
                    // The caller may have gone away, nothing to do then.
                    let _ = waiter.send(Ok(()));
                }
            }
            _ => {}
        }
    }

    /// Fail everyone still waiting and refuse new registrations
    fn close(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.closed = true;
        let waiters: Vec<Waiter> = state
            .queued
            .drain(..)
            .chain(state.in_flight.drain().map(|(_, w)| w))
            .collect();
        for waiter in waiters {
            let _ = waiter.send(Err(BusError::SessionClosed));
        }
    }

    #[cfg(test)]
    fn pending(&self) -> (usize, usize) {
        let state = self.lock();
        (state.queued.len(), state.in_flight.len())
    }
}

/// One connection to the MQTT broker.
pub struct BusSession {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    /// Keeps tracker registration and client submission in the same order
    submit: tokio::sync::Mutex<()>,
    closing: watch::Sender<bool>,
    event_loop: JoinHandle<()>,
}

impl BusSession {
    /// Connect to the broker and wait for it to accept the connection.
    ///
    /// Fails if the first connection attempt fails. Once connected, dropped
    /// connections are re-established in the background.
    pub async fn connect(config: &MqttConfig) -> Result<Self, BusError> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_credentials(&config.username, &config.password);
        // rumqttc rejects keep-alive intervals under 5 seconds
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connect_error = |source| BusError::Connect {
            host: config.host.clone(),
            port: config.port,
            source,
        };

        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "connecting to MQTT broker"
        );
        loop {
            match event_loop.poll().await.map_err(connect_error)? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    info!(code = ?ack.code, "connected to MQTT broker");
                    break;
                }
                event => debug!(?event, "mqtt event before connack"),
            }
        }

        let acks = Arc::new(AckTracker::default());
        let (closing, closing_rx) = watch::channel(false);
        let event_loop = tokio::spawn(run_event_loop(event_loop, acks.clone(), closing_rx));

        Ok(Self {
            client,
            acks,
            submit: tokio::sync::Mutex::new(()),
            closing,
            event_loop,
        })
    }

    /// Disconnect from the broker and stop the event loop task.
    pub async fn shutdown(self) {
        info!("disconnecting from MQTT broker");
        // Only fails when the event loop is already gone.
        let _ = self.closing.send(true);
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request not delivered");
        }
        if let Err(e) = self.event_loop.await {
            warn!(error = %e, "mqtt event loop task failed");
        }
    }
}

#[async_trait]
impl Publish for BusSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let ack = {
            let _order = self.submit.lock().await;
            let ack = self.acks.register()?;
            let mut submission = Submission {
                acks: &self.acks,
                submitted: false,
            };
            self.client.publish(topic, QoS::ExactlyOnce, false, payload).await?;
            submission.submitted = true;
            ack
        };

        debug!(topic, "waiting for publish to complete");
        ack.await.map_err(|_| BusError::SessionClosed)?
    }
}

/// Withdraws a tracker registration whose publish never reached the client,
/// whether the client refused it or the caller was cancelled.
struct Submission<'a> {
    acks: &'a AckTracker,
    submitted: bool,
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        if !self.submitted {
            self.acks.unregister_last();
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    acks: Arc<AckTracker>,
    mut closing: watch::Receiver<bool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("disconnected from MQTT broker");
                break;
            }
            Ok(event) => {
                if let Event::Incoming(Packet::ConnAck(ack)) = &event {
                    info!(code = ?ack.code, "reconnected to MQTT broker");
                }
                acks.on_event(&event);
            }
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                if *closing.borrow() {
                    break;
                }
                warn!(error = %e, retry_in = ?RECONNECT_DELAY, "MQTT connection error");
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = closing.changed() => break,
                }
            }
        }
    }
    acks.close();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Records every publish, optionally failing them all
    #[derive(Default)]
    pub struct RecordingBus {
        pub published: Mutex<Vec<(String, Vec<u8>)>>,
        pub fail: bool,
    }

    impl RecordingBus {
        pub fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        pub fn messages(&self) -> Vec<(String, String)> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, payload)| {
                    (topic.clone(), String::from_utf8(payload.clone()).unwrap())
                })
                .collect()
        }
    }

    #[async_trait]
    impl Publish for RecordingBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            if self.fail {
                return Err(BusError::SessionClosed);
            }
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }
}
