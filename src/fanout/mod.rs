//! # Notification Fan-out
//!
//! Turns storage-level change events into pushes to live subscribers.
//!
//! Three stages:
//!
//! 1. **Fan-in** ([`merge`]): one forwarding task per change-event channel
//!    copies events into a single merged stream; the stream closes only
//!    once every forwarder has finished.
//! 2. **Transformation** ([`payload`]): each channel tag has its own JSON
//!    payload shape, mapped to the one canonical message. Unknown tags and
//!    malformed payloads drop that notification, never the loop.
//! 3. **Distribution** ([`distributor`]): a single consumer persists each
//!    canonical message and pushes it concurrently to every registered
//!    subscriber, joining those sends before reading the next event.
//!    Per-subscriber delivery order therefore matches merged stream order;
//!    there is no cross-subscriber ordering.
//!
//! Subscriber bookkeeping (registration, offsets, catch-up paging,
//! heartbeats) lives in [`subscribers`].

pub mod distributor;
pub mod merge;
pub mod payload;
pub mod subscribers;

pub use distributor::NewsFanout;
pub use merge::merge_change_streams;
pub use payload::{to_news_message, PushMessage, CHANNEL_TAGS, TG_CHANNEL_MESSAGES, TG_GROUP_MESSAGES, VK_MESSAGES};
pub use subscribers::{SubscriberConnection, SubscriberHandle, SubscriberRegistry};
