//! Application data channel
//!
//! The Host opens a single ordered text channel (label `chat`, at most three
//! retransmissions per message); the Guest attaches the channel announced
//! by the peer. [`DataChannelBridge`] hides which side created it.
//!
//! # Example
//!
//! ```ignore
//! let bridge = Arc::new(DataChannelBridge::new());
//! let _subscription = bridge.subscribe(|text| println!("peer: {}", text));
//! bridge.attach_rtc(data_channel);
//! bridge.send("hello").await;
//! ```

mod bridge;

pub use bridge::{DataChannelBridge, MessageCallback, Subscription, TextChannel};
