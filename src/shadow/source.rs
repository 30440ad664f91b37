//! Desired-state source: owns the transport, the connection state and the
//! reconnect policy, and turns shadow payloads into [`DesiredState`]s.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;

use crate::error::{DecodeError, TransportError};
use crate::shadow::backoff::{Backoff, BackoffPolicy};
use crate::shadow::transport::{PayloadCallback, ShadowTopics, ShadowTransport};
use crate::shutdown::Shutdown;
use crate::states::{decode_desired, DesiredState};

/// Deltas waiting for the reconciliation loop.
const DELTA_QUEUE_DEPTH: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

impl ConnectionState {
	fn as_u8(self) -> u8 {
		match self {
			ConnectionState::Disconnected => 0,
			ConnectionState::Connecting => 1,
			ConnectionState::Connected => 2,
		}
	}

	fn from_u8(value: u8) -> Self {
		match value {
			1 => ConnectionState::Connecting,
			2 => ConnectionState::Connected,
			_ => ConnectionState::Disconnected,
		}
	}
}

/// Connection state shared with the transport's offline hook.
#[derive(Clone, Debug)]
struct SharedConnectionState(Arc<AtomicU8>);

impl SharedConnectionState {
	fn new() -> Self {
		SharedConnectionState(Arc::new(AtomicU8::new(ConnectionState::Disconnected.as_u8())))
	}

	fn get(&self) -> ConnectionState {
		ConnectionState::from_u8(self.0.load(Ordering::Acquire))
	}

	fn set(&self, state: ConnectionState) {
		self.0.store(state.as_u8(), Ordering::Release);
	}
}

/// Held while a reconnect runs; a second reconnect cannot start meanwhile.
struct ReconnectGuard(Arc<AtomicBool>);

impl ReconnectGuard {
	fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
		flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| ReconnectGuard(flag.clone()))
	}
}

impl Drop for ReconnectGuard {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceMode {
	/// Fetch the shadow once per tick.
	Pull,
	/// React to change notifications from the store.
	Push,
}

#[derive(Clone, Debug)]
pub struct SourceConfig {
	pub mode: SourceMode,
	pub operation_timeout: Duration,
	pub connect_timeout: Duration,
	pub backoff: BackoffPolicy,
}

impl Default for SourceConfig {
	fn default() -> Self {
		SourceConfig {
			mode: SourceMode::Pull,
			operation_timeout: Duration::from_secs(5),
			connect_timeout: Duration::from_secs(20),
			backoff: BackoffPolicy::default(),
		}
	}
}

#[derive(Debug, Error)]
pub enum SourceError {
	#[error(transparent)]
	Decode(#[from] DecodeError),
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error("shutting down")]
	Shutdown,
}

pub struct DesiredStateSource<T> {
	transport: T,
	topics: ShadowTopics,
	config: SourceConfig,
	connection: SharedConnectionState,
	reconnecting: Arc<AtomicBool>,
	backoff: Backoff,
	delta_tx: mpsc::Sender<DesiredState>,
	delta_rx: mpsc::Receiver<DesiredState>,
	needs_resync: bool,
}

impl<T: ShadowTransport> DesiredStateSource<T> {
	pub fn new(mut transport: T, topics: ShadowTopics, config: SourceConfig) -> Self {
		let connection = SharedConnectionState::new();
		let hook_state = connection.clone();
		transport.set_offline_hook(Arc::new(move || {
			warn!("shadow: transport went offline");
			hook_state.set(ConnectionState::Disconnected);
		}));

		let (delta_tx, delta_rx) = mpsc::channel(DELTA_QUEUE_DEPTH);
		DesiredStateSource {
			transport,
			topics,
			backoff: Backoff::new(config.backoff),
			config,
			connection,
			reconnecting: Arc::new(AtomicBool::new(false)),
			delta_tx,
			delta_rx,
			needs_resync: false,
		}
	}

	pub fn connection_state(&self) -> ConnectionState {
		self.connection.get()
	}

	pub fn mode(&self) -> SourceMode {
		self.config.mode
	}

	pub fn topics(&self) -> &ShadowTopics {
		&self.topics
	}

	pub fn transport(&self) -> &T {
		&self.transport
	}

	/// Single connection attempt, used at startup.
	pub async fn connect(&mut self) -> Result<(), TransportError> {
		self.connection.set(ConnectionState::Connecting);
		let result = self.establish().await;
		match &result {
			Ok(()) => {
				self.backoff.reset();
				self.connection.set(ConnectionState::Connected);
				info!("shadow: connected ({:?} mode)", self.config.mode);
			}
			Err(_) => self.connection.set(ConnectionState::Disconnected),
		}
		result
	}

	pub async fn disconnect(&mut self) -> Result<(), TransportError> {
		self.connection.set(ConnectionState::Disconnected);
		let timeout = self.config.connect_timeout;
		time::timeout(timeout, self.transport.disconnect())
			.await
			.map_err(|_| TransportError::Timeout)?
	}

	async fn establish(&mut self) -> Result<(), TransportError> {
		let timeout = self.config.connect_timeout;
		time::timeout(timeout, self.transport.connect(timeout))
			.await
			.map_err(|_| TransportError::Timeout)??;

		if self.config.mode == SourceMode::Push {
			let documents = self.topics.documents.clone();
			let callback = delta_callback(self.delta_tx.clone());
			self.transport.subscribe(&documents, callback).await?;
			self.needs_resync = true;
		}
		Ok(())
	}

	/// One reconnect attempt after the current backoff delay. Returns control
	/// to the caller whether or not the attempt succeeded.
	async fn reconnect(&mut self, shutdown: &mut Shutdown) -> Result<(), SourceError> {
		let Some(_guard) = ReconnectGuard::acquire(&self.reconnecting) else {
			debug!("shadow: reconnect already in progress");
			return Err(TransportError::Disconnected.into());
		};

		let delay = self.backoff.next_delay();
		info!(
			"shadow: reconnecting in {:?} (attempt {})",
			delay,
			self.backoff.attempt()
		);
		tokio::select! {
			_ = time::sleep(delay) => {}
			_ = shutdown.wait() => return Err(SourceError::Shutdown),
		}

		if let Err(e) = self.transport.disconnect().await {
			debug!("shadow: dropping stale link failed: {e}");
		}
		self.connect().await.map_err(|e| {
			warn!("shadow: reconnect failed: {e}");
			SourceError::from(e)
		})
	}

	/// Hold off a retry for one operation timeout.
	async fn pause(&self, shutdown: &mut Shutdown) -> Result<(), SourceError> {
		tokio::select! {
			_ = time::sleep(self.config.operation_timeout) => Ok(()),
			_ = shutdown.wait() => Err(SourceError::Shutdown),
		}
	}

	fn observe_failure(&self, err: &TransportError) {
		if err.is_disconnect() {
			self.connection.set(ConnectionState::Disconnected);
		}
	}

	/// Next desired state for the reconciliation loop.
	///
	/// Pull mode fetches the shadow. Push mode drains one queued delta,
	/// waiting at most the operation timeout, and fetches once after every
	/// (re)connect so changes made while offline are not missed. A resync
	/// the store refuses is retried after one operation timeout.
	pub async fn next_desired(&mut self, shutdown: &mut Shutdown) -> Result<Option<DesiredState>, SourceError> {
		if self.connection.get() != ConnectionState::Connected {
			self.reconnect(shutdown).await?;
		}

		match self.config.mode {
			SourceMode::Pull => self.fetch_desired().await,
			SourceMode::Push if self.needs_resync => match self.fetch_desired().await {
				Ok(fetched) => {
					self.needs_resync = false;
					Ok(fetched)
				}
				Err(SourceError::Decode(e)) => {
					// The store answered; a fix to the document arrives as a delta.
					self.needs_resync = false;
					Err(e.into())
				}
				Err(SourceError::Transport(e)) if !e.is_disconnect() => {
					self.pause(shutdown).await?;
					Err(e.into())
				}
				Err(e) => Err(e),
			},
			SourceMode::Push => {
				let wait = self.config.operation_timeout;
				tokio::select! {
					delta = time::timeout(wait, self.delta_rx.recv()) => Ok(delta.ok().flatten()),
					_ = shutdown.wait() => Err(SourceError::Shutdown),
				}
			}
		}
	}

	pub async fn fetch_desired(&mut self) -> Result<Option<DesiredState>, SourceError> {
		let topic = self.topics.get.clone();
		let payload = self
			.transport
			.fetch_once(&topic, self.config.operation_timeout)
			.await
			.map_err(|e| {
				self.observe_failure(&e);
				e
			})?;
		match payload {
			Some(payload) => Ok(decode_desired(&payload)?),
			None => Ok(None),
		}
	}

	/// Send a document to the update topic. Stalls with `Disconnected`
	/// while the link is down instead of queueing.
	pub async fn publish_update(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
		if self.connection.get() != ConnectionState::Connected {
			return Err(TransportError::Disconnected);
		}
		let topic = self.topics.update.clone();
		self.transport
			.publish(&topic, payload, self.config.operation_timeout)
			.await
			.map_err(|e| {
				self.observe_failure(&e);
				e
			})
	}
}

/// Decodes delta documents on the transport's task and queues them.
/// Never touches the light itself.
fn delta_callback(queue: mpsc::Sender<DesiredState>) -> PayloadCallback {
	Arc::new(move |payload: Vec<u8>| match decode_desired(&payload) {
		Ok(Some(desired)) => {
			if let Err(e) = queue.try_send(desired) {
				warn!("shadow: dropping delta: {e}");
			}
		}
		Ok(None) => debug!("shadow: delta without desired state"),
		Err(e) => warn!("shadow: {e}"),
	})
}
