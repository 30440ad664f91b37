use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Invoked with the raw payload of every message on a subscribed topic.
/// Runs on the transport's own task.
pub type PayloadCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked when the transport notices the link went away on its own.
pub type OfflineHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowTopics {
	pub get: String,
	pub update: String,
	pub documents: String,
}

impl ShadowTopics {
	pub fn for_thing(thing_name: &str) -> Self {
		let base = format!("things/{thing_name}/shadow");
		ShadowTopics {
			get: format!("{base}/get"),
			update: format!("{base}/update"),
			documents: format!("{base}/update/documents"),
		}
	}
}

/// Byte-level channel to the shadow store.
#[async_trait]
pub trait ShadowTransport: Send {
	async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError>;

	async fn disconnect(&mut self) -> Result<(), TransportError>;

	/// Deliver `payload` to `topic`, returning the store's acknowledgement
	/// body (empty when the store sends none).
	async fn publish(
		&mut self,
		topic: &str,
		payload: Vec<u8>,
		timeout: Duration,
	) -> Result<Vec<u8>, TransportError>;

	async fn subscribe(&mut self, topic: &str, callback: PayloadCallback) -> Result<(), TransportError>;

	/// One request/response read of `topic`. `None` when the store holds no
	/// document yet.
	async fn fetch_once(&mut self, topic: &str, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

	fn set_offline_hook(&mut self, hook: OfflineHook);
}
