//! In-process shadow store.
//!
//! Behaves like the remote store closely enough to drive the whole agent in
//! tests: updates merge into `desired`/`reported`, subscribers on the
//! documents topic hear about every change, and the link can be dropped or
//! made to refuse connections on demand.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde_json::{json, Map, Value};

use crate::error::TransportError;
use crate::shadow::transport::{OfflineHook, PayloadCallback, ShadowTopics, ShadowTransport};
use crate::states::{encode_desired, DesiredState};

#[derive(Default)]
struct Store {
	desired: Option<Map<String, Value>>,
	reported: Option<Map<String, Value>>,
	version: u64,
	connected: bool,
	refuse_connects: u32,
	reject_fetches: u32,
	connect_attempts: u32,
	fetches: u32,
	queued_fetches: VecDeque<Vec<u8>>,
	subscribers: Vec<(String, PayloadCallback)>,
	published: Vec<(String, Vec<u8>)>,
	offline_hook: Option<OfflineHook>,
}

impl Store {
	fn document(&self) -> Value {
		let mut state = Map::new();
		if let Some(desired) = &self.desired {
			state.insert("desired".into(), Value::Object(desired.clone()));
		}
		if let Some(reported) = &self.reported {
			state.insert("reported".into(), Value::Object(reported.clone()));
		}
		json!({ "state": state, "version": self.version })
	}

	fn callbacks_for(&self, topic: &str) -> Vec<PayloadCallback> {
		self.subscribers
			.iter()
			.filter(|(t, _)| t == topic)
			.map(|(_, cb)| cb.clone())
			.collect()
	}
}

/// Cloneable handle; every clone sees the same store.
#[derive(Clone)]
pub struct MemoryShadow {
	topics: ShadowTopics,
	store: Arc<Mutex<Store>>,
}

impl MemoryShadow {
	pub fn new(thing_name: &str) -> Self {
		MemoryShadow {
			topics: ShadowTopics::for_thing(thing_name),
			store: Arc::default(),
		}
	}

	pub fn topics(&self) -> &ShadowTopics {
		&self.topics
	}

	fn store(&self) -> MutexGuard<'_, Store> {
		self.store.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Write desired fields as a front-end would.
	pub fn set_desired(&self, desired: &DesiredState) {
		let result = encode_desired(desired)
			.map_err(|e| TransportError::Codec(e.to_string()))
			.and_then(|payload| self.apply_update(&payload));
		if let Err(e) = &result {
			warn!("memory shadow: desired update rejected: {e}");
		}
		debug_assert!(result.is_ok(), "desired update rejected: {result:?}");
	}

	/// Make the next fetch return `payload` verbatim.
	pub fn queue_fetch_payload(&self, payload: impl Into<Vec<u8>>) {
		self.store().queued_fetches.push_back(payload.into());
	}

	/// Hand `payload` straight to the subscribers of `topic`.
	pub fn notify_raw(&self, topic: &str, payload: impl Into<Vec<u8>>) {
		let payload = payload.into();
		let callbacks = self.store().callbacks_for(topic);
		for callback in callbacks {
			callback(payload.clone());
		}
	}

	/// Drop the link as if the network went away.
	pub fn go_offline(&self) {
		let hook = {
			let mut store = self.store();
			store.connected = false;
			store.subscribers.clear();
			store.offline_hook.clone()
		};
		if let Some(hook) = hook {
			hook();
		}
	}

	pub fn refuse_next_connects(&self, count: u32) {
		self.store().refuse_connects = count;
	}

	/// Answer the next `count` fetches with a rejection.
	pub fn reject_next_fetches(&self, count: u32) {
		self.store().reject_fetches = count;
	}

	pub fn is_connected(&self) -> bool {
		self.store().connected
	}

	pub fn connect_attempts(&self) -> u32 {
		self.store().connect_attempts
	}

	pub fn fetch_count(&self) -> u32 {
		self.store().fetches
	}

	pub fn subscriber_count(&self) -> usize {
		self.store().subscribers.len()
	}

	pub fn published(&self) -> Vec<(String, Vec<u8>)> {
		self.store().published.clone()
	}

	pub fn desired(&self) -> Option<Value> {
		self.store().desired.clone().map(Value::Object)
	}

	pub fn reported(&self) -> Option<Value> {
		self.store().reported.clone().map(Value::Object)
	}

	/// Merge an update document, as written to the update topic, and
	/// notify document subscribers. Returns the acknowledgement body.
	pub fn apply_update(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
		let update: Value = serde_json::from_slice(payload)
			.map_err(|e| TransportError::Rejected(format!("invalid update document: {e}")))?;
		let state = update
			.get("state")
			.and_then(Value::as_object)
			.ok_or_else(|| TransportError::Rejected("update document has no state".into()))?;

		let (ack, documents, callbacks) = {
			let mut store = self.store();
			let previous = store.document();
			if let Some(Value::Object(fields)) = state.get("desired") {
				merge(store.desired.get_or_insert_with(Map::new), fields);
			}
			if let Some(Value::Object(fields)) = state.get("reported") {
				merge(store.reported.get_or_insert_with(Map::new), fields);
			}
			store.version += 1;
			let current = store.document();
			let ack = serde_json::to_vec(&current).unwrap_or_default();
			let documents = json!({ "previous": previous, "current": current });
			(
				ack,
				serde_json::to_vec(&documents).unwrap_or_default(),
				store.callbacks_for(&self.topics.documents),
			)
		};

		for callback in callbacks {
			callback(documents.clone());
		}
		Ok(ack)
	}
}

/// Shallow merge; `null` removes a field.
fn merge(target: &mut Map<String, Value>, fields: &Map<String, Value>) {
	for (key, value) in fields {
		if value.is_null() {
			target.remove(key);
		} else {
			target.insert(key.clone(), value.clone());
		}
	}
}

#[async_trait]
impl ShadowTransport for MemoryShadow {
	async fn connect(&mut self, _timeout: Duration) -> Result<(), TransportError> {
		let mut store = self.store();
		store.connect_attempts += 1;
		if store.refuse_connects > 0 {
			store.refuse_connects -= 1;
			return Err(TransportError::Disconnected);
		}
		store.connected = true;
		Ok(())
	}

	async fn disconnect(&mut self) -> Result<(), TransportError> {
		let mut store = self.store();
		store.connected = false;
		store.subscribers.clear();
		Ok(())
	}

	async fn publish(
		&mut self,
		topic: &str,
		payload: Vec<u8>,
		_timeout: Duration,
	) -> Result<Vec<u8>, TransportError> {
		{
			let mut store = self.store();
			if !store.connected {
				return Err(TransportError::Disconnected);
			}
			store.published.push((topic.to_string(), payload.clone()));
		}
		if topic != self.topics.update {
			return Err(TransportError::Rejected(format!("cannot publish to {topic}")));
		}
		self.apply_update(&payload)
	}

	async fn subscribe(&mut self, topic: &str, callback: PayloadCallback) -> Result<(), TransportError> {
		let mut store = self.store();
		if !store.connected {
			return Err(TransportError::Disconnected);
		}
		store.subscribers.push((topic.to_string(), callback));
		Ok(())
	}

	async fn fetch_once(&mut self, topic: &str, _timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
		let mut store = self.store();
		if !store.connected {
			return Err(TransportError::Disconnected);
		}
		if topic != self.topics.get {
			return Err(TransportError::Rejected(format!("cannot fetch {topic}")));
		}
		store.fetches += 1;
		if store.reject_fetches > 0 {
			store.reject_fetches -= 1;
			return Err(TransportError::Rejected(format!("fetch of {topic} refused")));
		}
		if let Some(payload) = store.queued_fetches.pop_front() {
			return Ok(Some(payload));
		}
		if store.desired.is_none() && store.reported.is_none() {
			return Ok(None);
		}
		Ok(Some(serde_json::to_vec(&store.document()).unwrap_or_default()))
	}

	fn set_offline_hook(&mut self, hook: OfflineHook) {
		self.store().offline_hook = Some(hook);
	}
}
