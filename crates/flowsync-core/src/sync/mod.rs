//! Flowchart synchronization over direct peer channels
//!
//! - [`protocol`]: JSON wire messages
//! - [`dispatch`]: I/O-free handling of those messages
//! - [`session`]: the task that drives discovery, handshakes and dispatch
//! - [`events`]: status and notifications for the UI

pub mod dispatch;
pub mod events;
pub mod protocol;
pub mod session;

pub use dispatch::{Directive, KeyOrigin, PendingRequestSet, SyncProtocol};
pub use events::{
    ChannelSink, CollabEvent, LocalEdit, NullSink, SessionStatus, StateSink,
    EVENT_CHANNEL_CAPACITY,
};
pub use protocol::{CollabMessage, Envelope};
pub use session::{CollabSession, DATABASE_FILE, UNTITLED_FLOWCHART};
