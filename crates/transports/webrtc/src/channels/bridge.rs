//! Text channel between the two participants
//!
//! The bridge outlives individual peer connections: each rebuild attaches a
//! fresh channel, while subscribers stay registered. Events from a channel
//! that was already detached are ignored.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Text transport carried by the bridge
#[async_trait]
pub trait TextChannel: Send + Sync {
    fn label(&self) -> String;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl TextChannel for RTCDataChannel {
    fn label(&self) -> String {
        RTCDataChannel::label(self).to_string()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        RTCDataChannel::send_text(self, text)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannelError(format!("Failed to send message: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        RTCDataChannel::close(self)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))
    }
}

/// Callback invoked for every inbound text message
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: BTreeMap<u64, MessageCallback>,
}

/// Registration handle returned by [`DataChannelBridge::subscribe`]
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut subscribers) = registry.lock() {
                subscribers.callbacks.remove(&self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Application text channel over the current peer connection
pub struct DataChannelBridge {
    channel: Mutex<Option<Arc<dyn TextChannel>>>,
    generation: AtomicU64,
    open_tx: watch::Sender<bool>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Default for DataChannelBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl DataChannelBridge {
    pub fn new() -> Self {
        let (open_tx, _) = watch::channel(false);
        Self {
            channel: Mutex::new(None),
            generation: AtomicU64::new(0),
            open_tx,
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
        }
    }

    /// Attach a channel, replacing any previous one
    ///
    /// Returns the attachment generation that event reports must carry.
    pub fn attach(&self, channel: Arc<dyn TextChannel>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Attaching data channel '{}' (generation {})", channel.label(), generation);

        if let Ok(mut slot) = self.channel.lock() {
            *slot = Some(channel);
        }
        self.open_tx.send_replace(false);
        generation
    }

    /// Attach a webrtc data channel and route its events into the bridge
    pub fn attach_rtc(self: &Arc<Self>, channel: Arc<RTCDataChannel>) -> u64 {
        let already_open = channel.ready_state() == RTCDataChannelState::Open;
        let generation = self.attach(channel.clone());
        let label = channel.label().to_string();

        let bridge = Arc::downgrade(self);
        channel.on_open(Box::new(move || {
            let bridge = bridge.clone();
            Box::pin(async move {
                if let Some(bridge) = bridge.upgrade() {
                    bridge.mark_open(generation);
                }
            })
        }));

        let bridge = Arc::downgrade(self);
        channel.on_close(Box::new(move || {
            let bridge = bridge.clone();
            Box::pin(async move {
                if let Some(bridge) = bridge.upgrade() {
                    bridge.mark_closed(generation);
                }
            })
        }));

        let error_label = label.clone();
        channel.on_error(Box::new(move |err| {
            let label = error_label.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", label, err);
            })
        }));

        let bridge = Arc::downgrade(self);
        channel.on_message(Box::new(move |msg| {
            let bridge = bridge.clone();
            let label = label.clone();
            Box::pin(async move {
                let Some(bridge) = bridge.upgrade() else {
                    return;
                };
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => bridge.deliver(generation, text),
                    Err(_) => warn!(
                        "Dropping non-UTF-8 message ({} bytes) on channel '{}'",
                        msg.data.len(),
                        label
                    ),
                }
            })
        }));

        if already_open {
            self.mark_open(generation);
        }
        generation
    }

    pub fn mark_open(&self, generation: u64) {
        if !self.is_current(generation) {
            debug!("Ignoring open event of stale data channel (generation {})", generation);
            return;
        }
        info!("Data channel open");
        self.open_tx.send_replace(true);
    }

    pub fn mark_closed(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        info!("Data channel closed");
        self.open_tx.send_replace(false);
    }

    /// Fan an inbound message out to every subscriber
    pub fn deliver(&self, generation: u64, text: String) {
        if !self.is_current(generation) {
            debug!("Dropping message from stale data channel");
            return;
        }

        let callbacks: Vec<MessageCallback> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.callbacks.values().cloned().collect(),
            Err(_) => return,
        };

        if callbacks.is_empty() {
            debug!("No subscribers for inbound message");
        }
        for callback in callbacks {
            callback(text.clone());
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn is_open(&self) -> bool {
        *self.open_tx.borrow()
    }

    pub fn watch_open(&self) -> watch::Receiver<bool> {
        self.open_tx.subscribe()
    }

    /// Send a text message; returns whether it was handed to the channel
    ///
    /// ```
    /// use roomcall_webrtc::DataChannelBridge;
    ///
    /// # tokio_test::block_on(async {
    /// let bridge = DataChannelBridge::new();
    /// // Nothing attached yet: the message is dropped
    /// assert!(!bridge.send("hello").await);
    /// # });
    /// ```
    pub async fn send(&self, text: impl Into<String>) -> bool {
        let channel = self.channel.lock().ok().and_then(|slot| slot.clone());

        let channel = match channel {
            Some(channel) if self.is_open() => channel,
            _ => {
                warn!("Data channel not open, message not sent");
                return false;
            }
        };

        match channel.send_text(text.into()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send on data channel: {}", e);
                false
            }
        }
    }

    /// Register a callback for inbound messages
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let id = match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.next_id += 1;
                let id = subscribers.next_id;
                subscribers.callbacks.insert(id, Arc::new(callback));
                id
            }
            Err(_) => 0,
        };

        Subscription {
            id,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.callbacks.len())
            .unwrap_or(0)
    }

    /// Close and forget the current channel
    pub async fn detach(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.open_tx.send_replace(false);

        let channel = self.channel.lock().ok().and_then(|mut slot| slot.take());
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("Closing detached data channel: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct FakeChannel {
        sent: Mutex<Vec<String>>,
        closed: AtomicBool,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TextChannel for FakeChannel {
        fn label(&self) -> String {
            "chat".to_string()
        }

        async fn send_text(&self, text: String) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::DataChannelError("transport closed".to_string()));
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn collector(bridge: &DataChannelBridge) -> (Arc<Mutex<Vec<String>>>, Subscription) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let subscription = bridge.subscribe(move |text| sink.lock().unwrap().push(text));
        (received, subscription)
    }

    #[tokio::test]
    async fn test_send_requires_open_channel() {
        let bridge = DataChannelBridge::new();
        assert!(!bridge.send("no channel").await);

        let channel = Arc::new(FakeChannel::default());
        let generation = bridge.attach(channel.clone());
        assert!(!bridge.is_open());
        assert!(!bridge.send("not open yet").await);

        bridge.mark_open(generation);
        assert!(bridge.is_open());
        assert!(bridge.send("hello").await);

        bridge.mark_closed(generation);
        assert!(!bridge.send("after close").await);

        assert_eq!(*channel.sent.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_send_failure_reports_false() {
        let bridge = DataChannelBridge::new();
        let channel = Arc::new(FakeChannel::default());
        let generation = bridge.attach(channel.clone());
        bridge.mark_open(generation);

        channel.fail.store(true, Ordering::SeqCst);
        assert!(!bridge.send("lost").await);
    }

    #[test]
    fn test_fan_out_to_all_subscribers() {
        let bridge = DataChannelBridge::new();
        let generation = bridge.attach(Arc::new(FakeChannel::default()));

        let (first, _a) = collector(&bridge);
        let (second, _b) = collector(&bridge);
        bridge.deliver(generation, "hi".to_string());

        assert_eq!(*first.lock().unwrap(), vec!["hi".to_string()]);
        assert_eq!(*second.lock().unwrap(), vec!["hi".to_string()]);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let bridge = DataChannelBridge::new();
        let generation = bridge.attach(Arc::new(FakeChannel::default()));

        let (received, subscription) = collector(&bridge);
        assert_eq!(bridge.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(bridge.subscriber_count(), 0);

        bridge.deliver(generation, "nobody listens".to_string());
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_unsubscribes() {
        let bridge = DataChannelBridge::new();
        let (_received, subscription) = collector(&bridge);
        subscription.cancel();
        assert_eq!(bridge.subscriber_count(), 0);
    }

    #[test]
    fn test_stale_channel_events_ignored() {
        let bridge = DataChannelBridge::new();
        let old = bridge.attach(Arc::new(FakeChannel::default()));
        let current = bridge.attach(Arc::new(FakeChannel::default()));

        let (received, _subscription) = collector(&bridge);

        bridge.mark_open(old);
        assert!(!bridge.is_open());
        bridge.deliver(old, "late".to_string());
        assert!(received.lock().unwrap().is_empty());

        bridge.mark_open(current);
        assert!(bridge.is_open());
        bridge.mark_closed(old);
        assert!(bridge.is_open());
    }

    #[tokio::test]
    async fn test_detach_closes_and_keeps_subscribers() {
        let bridge = DataChannelBridge::new();
        let channel = Arc::new(FakeChannel::default());
        let generation = bridge.attach(channel.clone());
        bridge.mark_open(generation);
        let mut open = bridge.watch_open();
        let (_received, _subscription) = collector(&bridge);

        bridge.detach().await;

        assert!(channel.closed.load(Ordering::SeqCst));
        assert!(!bridge.is_open());
        assert!(!*open.borrow_and_update());
        assert_eq!(bridge.subscriber_count(), 1);

        // Open event of the detached channel arriving late
        bridge.mark_open(generation);
        assert!(!bridge.is_open());
    }
}
