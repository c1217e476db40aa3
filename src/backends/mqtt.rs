//! rumqttc-backed transport.
//!
//! One client connection is shared by every gateway and the backend
//! listeners. The event loop runs in its own task:
//!
//! - `ConnAck`: backoff resets and every registered filter is resubscribed,
//!   so subscriptions survive broker restarts
//! - `Publish`: each matching handler runs in its own task
//! - connection error: wait, then poll again; the wait doubles up to
//!   `reconnect_max_ms`
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let (transport, event_loop) = MqttTransport::start(&config.mqtt, shutdown_rx);
//! transport.subscribe("Parking/+/Mezzi/+", handler).await?;
//! // ...
//! shutdown_tx.send(true)?;
//! event_loop.await?;
//! ```

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::error::TransportError;
use crate::topics;
use crate::traits::{MessageHandler, MqttMessage, Transport};

type Subscriptions = RwLock<Vec<(String, Arc<dyn MessageHandler>)>>;

/// Shared MQTT client.
pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Subscriptions,
}

impl MqttTransport {
    /// Connect to the broker of `config` and spawn the event loop.
    ///
    /// The returned handle completes after `shutdown` flips to true and the
    /// client has disconnected.
    pub fn start(config: &MqttConfig, shutdown: watch::Receiver<bool>) -> (Arc<Self>, JoinHandle<()>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive_secs)));
        if config.has_auth() {
            options.set_credentials(
                config.username.clone().unwrap_or_default(),
                config.password.clone().unwrap_or_default(),
            );
        }

        let (client, event_loop) = AsyncClient::new(options, config.channel_capacity);
        let transport = Arc::new(Self {
            client,
            subscriptions: RwLock::new(Vec::new()),
        });

        let backoff = Backoff::new(
            Duration::from_millis(config.reconnect_min_ms),
            Duration::from_millis(config.reconnect_max_ms),
        );
        info!(host = %config.host, port = config.port, client_id = %config.client_id, "MQTT transport starting");
        let handle = tokio::spawn(Arc::clone(&transport).drive(event_loop, backoff, shutdown));
        (transport, handle)
    }

    /// Distinct registered filters.
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .read_subscriptions()
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.read_subscriptions()
            .iter()
            .filter(|(filter, _)| topics::matches(filter, topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    fn read_subscriptions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, Vec<(String, Arc<dyn MessageHandler>)>> {
        self.subscriptions.read().unwrap_or_else(|p| p.into_inner())
    }

    async fn drive(
        self: Arc<Self>,
        mut event_loop: EventLoop,
        mut backoff: Backoff,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff.reset();
                        let filters = self.filters();
                        info!(filters = filters.len(), "MQTT connected");
                        // Requests go through the client channel, which this
                        // loop drains; never await them here.
                        let client = self.client.clone();
                        tokio::spawn(async move {
                            for filter in filters {
                                if let Err(e) = client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
                                    warn!(%filter, error = %e, "resubscribe failed");
                                }
                            }
                        });
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = MqttMessage::new(publish.topic, publish.payload.to_vec());
                        let handlers = self.handlers_for(&message.topic);
                        if handlers.is_empty() {
                            debug!(topic = %message.topic, "no handler for message");
                        }
                        for handler in handlers {
                            let message = message.clone();
                            tokio::spawn(async move { handler.handle(message).await });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "MQTT connection error");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {}
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request not queued");
        }
        // Flush the disconnect; errors are expected once the socket closes.
        let _ = tokio::time::timeout(Duration::from_secs(1), event_loop.poll()).await;
        info!("MQTT transport stopped");
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        let first = {
            let mut subs = self.subscriptions.write().unwrap_or_else(|p| p.into_inner());
            let first = !subs.iter().any(|(f, _)| f == filter);
            subs.push((filter.to_string(), handler));
            first
        };
        if first {
            self.client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        }
        debug!(%filter, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let removed = {
            let mut subs = self.subscriptions.write().unwrap_or_else(|p| p.into_inner());
            let before = subs.len();
            subs.retain(|(f, _)| f != filter);
            before != subs.len()
        };
        if removed {
            self.client
                .unsubscribe(filter)
                .await
                .map_err(|e| TransportError::Unsubscribe(e.to_string()))?;
        }
        Ok(())
    }
}

/// Capped exponential reconnect delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    /// Delay to wait now; the next one doubles up to the cap.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_backoff(self.current, self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
