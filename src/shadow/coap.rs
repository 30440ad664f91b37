//! Shadow transport over CoAP/UDP.
//!
//! Topics map to URI paths. Fetches are confirmable GETs, publishes are
//! confirmable PUTs and subscriptions use the Observe option. A single reader
//! task owns the receive side of the socket and routes every datagram either
//! to the request waiting on it or to an observer callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{CoapOption, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType};
use log::{debug, info, trace, warn};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::error::TransportError;
use crate::shadow::transport::{OfflineHook, PayloadCallback, ShadowTransport};

const MAX_DATAGRAM: usize = 1152;
/// Initial retransmission timeout for confirmable messages.
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Exchange {
	Token(Vec<u8>),
	MessageId(u16),
}

type Pending = Arc<Mutex<HashMap<Exchange, oneshot::Sender<Packet>>>>;
type Observers = Arc<Mutex<HashMap<Vec<u8>, PayloadCallback>>>;

struct Link {
	socket: Arc<UdpSocket>,
	pending: Pending,
	observers: Observers,
	reader: JoinHandle<()>,
	message_id: u16,
	token: u32,
}

impl Link {
	fn next_message_id(&mut self) -> u16 {
		self.message_id = self.message_id.wrapping_add(1);
		self.message_id
	}

	fn next_token(&mut self) -> Vec<u8> {
		self.token = self.token.wrapping_add(1);
		self.token.to_be_bytes().to_vec()
	}
}

impl Drop for Link {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

pub struct CoapShadowTransport {
	endpoint: String,
	link: Option<Link>,
	offline_hook: Option<OfflineHook>,
}

impl CoapShadowTransport {
	/// `endpoint` is a `host:port` pair.
	pub fn new(endpoint: impl Into<String>) -> Self {
		CoapShadowTransport {
			endpoint: endpoint.into(),
			link: None,
			offline_hook: None,
		}
	}

	pub fn is_connected(&self) -> bool {
		self.link.as_ref().map_or(false, |link| !link.reader.is_finished())
	}

	async fn open(&self) -> Result<Link, TransportError> {
		let remote = lookup_host(&self.endpoint)
			.await?
			.next()
			.ok_or_else(|| TransportError::Rejected(format!("cannot resolve {}", self.endpoint)))?;
		let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
		let socket = UdpSocket::bind(local).await?;
		socket.connect(remote).await?;
		let socket = Arc::new(socket);

		let pending: Pending = Arc::default();
		let observers: Observers = Arc::default();
		let reader = tokio::spawn(read_loop(
			socket.clone(),
			pending.clone(),
			observers.clone(),
			self.offline_hook.clone(),
		));

		Ok(Link {
			socket,
			pending,
			observers,
			reader,
			message_id: initial_message_id(),
			token: 0,
		})
	}

	async fn request(
		&mut self,
		method: RequestType,
		path: &str,
		payload: Option<Vec<u8>>,
		observe: bool,
		timeout: Duration,
	) -> Result<Packet, TransportError> {
		let link = self.link.as_mut().ok_or(TransportError::Disconnected)?;
		let token = link.next_token();

		let mut packet = Packet::new();
		packet.header.set_type(MessageType::Confirmable);
		packet.header.code = MessageClass::Request(method);
		packet.header.message_id = link.next_message_id();
		packet.set_token(token.clone());
		if observe {
			packet.add_option(CoapOption::Observe, Vec::new());
		}
		for segment in path.split('/').filter(|s| !s.is_empty()) {
			packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
		}
		if let Some(payload) = payload {
			packet.set_content_format(ContentFormat::ApplicationJSON);
			packet.payload = payload;
		}

		exchange(link, &packet, Exchange::Token(token), timeout).await
	}

	/// CoAP ping: an empty confirmable message the peer answers with a reset.
	async fn ping(link: &mut Link, timeout: Duration) -> Result<(), TransportError> {
		let mut packet = Packet::new();
		packet.header.set_type(MessageType::Confirmable);
		packet.header.code = MessageClass::Empty;
		packet.header.message_id = link.next_message_id();
		let id = packet.header.message_id;
		exchange(link, &packet, Exchange::MessageId(id), timeout)
			.await
			.map(|_| ())
	}
}

#[async_trait]
impl ShadowTransport for CoapShadowTransport {
	async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
		self.link = None;
		let attempt = async {
			let mut link = self.open().await?;
			Self::ping(&mut link, timeout).await?;
			Ok::<_, TransportError>(link)
		};
		let link = time::timeout(timeout, attempt)
			.await
			.map_err(|_| TransportError::Timeout)??;
		info!("coap: connected to {}", self.endpoint);
		self.link = Some(link);
		Ok(())
	}

	async fn disconnect(&mut self) -> Result<(), TransportError> {
		if let Some(link) = self.link.take() {
			link.observers.lock().await.clear();
			link.pending.lock().await.clear();
			debug!("coap: disconnected from {}", self.endpoint);
		}
		Ok(())
	}

	async fn publish(
		&mut self,
		topic: &str,
		payload: Vec<u8>,
		timeout: Duration,
	) -> Result<Vec<u8>, TransportError> {
		let response = self
			.request(RequestType::Put, topic, Some(payload), false, timeout)
			.await?;
		if !is_success(&response.header.code) {
			return Err(TransportError::Rejected(format!(
				"PUT {topic}: {:?}",
				response.header.code
			)));
		}
		Ok(response.payload)
	}

	async fn subscribe(&mut self, topic: &str, callback: PayloadCallback) -> Result<(), TransportError> {
		let response = self
			.request(RequestType::Get, topic, None, true, ACK_TIMEOUT * 4)
			.await?;
		if !is_success(&response.header.code) {
			return Err(TransportError::Rejected(format!(
				"observe {topic}: {:?}",
				response.header.code
			)));
		}
		let link = self.link.as_ref().ok_or(TransportError::Disconnected)?;
		link.observers
			.lock()
			.await
			.insert(response.get_token().to_vec(), callback);
		debug!("coap: observing {topic}");
		Ok(())
	}

	async fn fetch_once(&mut self, topic: &str, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
		let response = self
			.request(RequestType::Get, topic, None, false, timeout)
			.await?;
		match &response.header.code {
			MessageClass::Response(ResponseType::NotFound) => Ok(None),
			code if is_success(code) => Ok(Some(response.payload)),
			code => Err(TransportError::Rejected(format!("GET {topic}: {code:?}"))),
		}
	}

	fn set_offline_hook(&mut self, hook: OfflineHook) {
		self.offline_hook = Some(hook);
	}
}

/// How one wait inside [`exchange`] ended.
enum Wait {
	Answered(Packet),
	Closed,
	Retransmit,
	Expired,
	Acknowledged,
	Reset,
}

/// Send a confirmable message and wait for whatever answers `key`,
/// retransmitting with doubling intervals until `timeout` runs out. An empty
/// ACK for a request stops retransmission; the separate response is then
/// awaited until the deadline.
async fn exchange(link: &mut Link, packet: &Packet, key: Exchange, timeout: Duration) -> Result<Packet, TransportError> {
	let bytes = packet
		.to_bytes()
		.map_err(|e| TransportError::Codec(format!("{e:?}")))?;

	let message_id = Exchange::MessageId(packet.header.message_id);
	let (tx, mut rx) = oneshot::channel();
	let mut acked = None;
	{
		let mut pending = link.pending.lock().await;
		pending.insert(key.clone(), tx);
		if key != message_id {
			let (ack_tx, ack_rx) = oneshot::channel();
			pending.insert(message_id.clone(), ack_tx);
			acked = Some(ack_rx);
		}
	}

	let deadline = Instant::now() + timeout;
	let mut interval = ACK_TIMEOUT;
	let result = loop {
		if let Err(e) = link.socket.send(&bytes).await {
			break Err(e.into());
		}
		let now = Instant::now();
		if now >= deadline {
			break Err(TransportError::Timeout);
		}
		let wait = interval.min(deadline - now);
		let ack = async {
			match acked.as_mut() {
				Some(ack) => ack.await.ok(),
				None => std::future::pending().await,
			}
		};
		let outcome = tokio::select! {
			response = time::timeout(wait, &mut rx) => match response {
				Ok(Ok(response)) => Wait::Answered(response),
				Ok(Err(_)) => Wait::Closed,
				Err(_) if Instant::now() >= deadline => Wait::Expired,
				Err(_) => Wait::Retransmit,
			},
			Some(reply) = ack => match reply.header.get_type() {
				MessageType::Reset => Wait::Reset,
				_ => Wait::Acknowledged,
			},
		};
		match outcome {
			Wait::Answered(response) => break Ok(response),
			Wait::Closed => break Err(TransportError::Disconnected),
			Wait::Expired => break Err(TransportError::Timeout),
			Wait::Reset => {
				break Err(TransportError::Rejected(format!(
					"message {} reset by peer",
					packet.header.message_id
				)))
			}
			Wait::Retransmit => {
				trace!("coap: retransmitting message {}", packet.header.message_id);
				interval *= 2;
			}
			Wait::Acknowledged => {
				trace!("coap: message {} acknowledged, awaiting response", packet.header.message_id);
				break match time::timeout_at(deadline, &mut rx).await {
					Ok(Ok(response)) => Ok(response),
					Ok(Err(_)) => Err(TransportError::Disconnected),
					Err(_) => Err(TransportError::Timeout),
				};
			}
		}
	};

	let mut pending = link.pending.lock().await;
	pending.remove(&message_id);
	if result.is_err() {
		pending.remove(&key);
	}
	result
}

async fn read_loop(socket: Arc<UdpSocket>, pending: Pending, observers: Observers, offline: Option<OfflineHook>) {
	let mut buf = vec![0u8; MAX_DATAGRAM];
	loop {
		let len = match socket.recv(&mut buf).await {
			Ok(len) => len,
			Err(e) => {
				warn!("coap: link lost: {e}");
				pending.lock().await.clear();
				if let Some(hook) = &offline {
					hook();
				}
				return;
			}
		};
		let packet = match Packet::from_bytes(&buf[..len]) {
			Ok(packet) => packet,
			Err(e) => {
				debug!("coap: dropping unreadable datagram: {e:?}");
				continue;
			}
		};
		route(&socket, &pending, &observers, packet).await;
	}
}

async fn route(socket: &UdpSocket, pending: &Pending, observers: &Observers, packet: Packet) {
	if matches!(packet.header.code, MessageClass::Empty) {
		// Ping reply, or the empty ack ahead of a separate response.
		let key = Exchange::MessageId(packet.header.message_id);
		if let Some(waiter) = pending.lock().await.remove(&key) {
			let _ = waiter.send(packet);
		}
		return;
	}

	if matches!(packet.header.get_type(), MessageType::Confirmable) {
		acknowledge(socket, packet.header.message_id).await;
	}

	let token = packet.get_token().to_vec();
	if let Some(waiter) = pending.lock().await.remove(&Exchange::Token(token.clone())) {
		let _ = waiter.send(packet);
		return;
	}

	let callback = observers.lock().await.get(&token).cloned();
	match callback {
		Some(callback) if is_success(&packet.header.code) => callback(packet.payload),
		Some(_) => debug!("coap: observe notification with {:?} ignored", packet.header.code),
		None => trace!("coap: unmatched message {}", packet.header.message_id),
	}
}

async fn acknowledge(socket: &UdpSocket, message_id: u16) {
	let mut ack = Packet::new();
	ack.header.set_type(MessageType::Acknowledgement);
	ack.header.code = MessageClass::Empty;
	ack.header.message_id = message_id;
	match ack.to_bytes() {
		Ok(bytes) => {
			if let Err(e) = socket.send(&bytes).await {
				debug!("coap: ack {message_id} not sent: {e}");
			}
		}
		Err(e) => debug!("coap: cannot encode ack: {e:?}"),
	}
}

fn is_success(code: &MessageClass) -> bool {
	matches!(
		code,
		MessageClass::Response(
			ResponseType::Created
				| ResponseType::Deleted
				| ResponseType::Valid
				| ResponseType::Changed
				| ResponseType::Content
		)
	)
}

fn initial_message_id() -> u16 {
	let nanos = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.subsec_nanos())
		.unwrap_or_default();
	(nanos & 0xffff) as u16
}
