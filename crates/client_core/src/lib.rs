//! Client-side live list synchronization: reconciles authoritative page
//! snapshots pulled from the store with the advisory mutation events pushed
//! over the event channel, while preserving pagination, ordering, and count
//! invariants.

pub mod cache;
pub mod channel;
pub mod error;
pub mod merge;
pub mod query;
pub mod view;

pub use cache::{CacheState, FilterEval, FilterOutcome, ListSnapshot, OpaqueFilter, SubstringFilter};
pub use channel::{
    ChannelOptions, ConnectionState, EventChannelClient, EventChannelHandle, EventTransport,
    SyncSignal, WebSocketTransport,
};
pub use error::{StoreQueryError, TransportError};
pub use query::{HttpStoreBackend, QueryController, StoreBackend};
pub use view::{ListView, ListViewOptions};
