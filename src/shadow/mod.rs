//! Everything between the light and the remote shadow document.

pub mod backoff;
pub mod coap;
pub mod memory;
pub mod publisher;
pub mod source;
pub mod transport;

pub use publisher::ReportedStatePublisher;
pub use source::{ConnectionState, DesiredStateSource, SourceConfig, SourceError, SourceMode};
pub use transport::{OfflineHook, PayloadCallback, ShadowTopics, ShadowTransport};
