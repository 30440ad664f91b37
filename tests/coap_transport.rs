use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coap_lite::{CoapOption, CoapRequest, MessageClass, MessageType, Packet, RequestType, ResponseType};
use shadow_light::error::TransportError;
use shadow_light::shadow::coap::CoapShadowTransport;
use shadow_light::shadow::{ShadowTopics, ShadowTransport};
use shadow_light::states::{decode_desired, PowerState};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

const TIMEOUT: Duration = Duration::from_secs(1);
/// Longer than the client's first retransmission timeout.
const SEPARATE_DELAY: Duration = Duration::from_millis(2500);
const DOCUMENT: &[u8] = br#"{"state":{"desired":{"power_state":"ON","brightness":42,"mode":"WAVE"}}}"#;

#[derive(Default)]
struct ServerState {
	document: Option<Vec<u8>>,
	updates: Vec<Vec<u8>>,
	pings: u32,
	ignore_next_get: bool,
	gets: u32,
	separate_responses: bool,
	deferred: Option<Vec<u8>>,
	observer: Option<(SocketAddr, Vec<u8>)>,
}

/// A shadow endpoint speaking just enough CoAP for the transport.
struct FakeShadow {
	addr: SocketAddr,
	state: Arc<Mutex<ServerState>>,
	notify: mpsc::UnboundedSender<Vec<u8>>,
}

impl FakeShadow {
	async fn start(document: Option<&[u8]>) -> Self {
		let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
		let addr = socket.local_addr().unwrap();
		let state = Arc::new(Mutex::new(ServerState {
			document: document.map(<[u8]>::to_vec),
			..ServerState::default()
		}));
		let (notify, notifications) = mpsc::unbounded_channel();
		tokio::spawn(serve(socket, state.clone(), notifications));
		FakeShadow { addr, state, notify }
	}

	fn transport(&self) -> CoapShadowTransport {
		CoapShadowTransport::new(self.addr.to_string())
	}

	fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
		self.state.lock().unwrap()
	}
}

async fn serve(
	socket: Arc<UdpSocket>,
	state: Arc<Mutex<ServerState>>,
	mut notifications: mpsc::UnboundedReceiver<Vec<u8>>,
) {
	let mut buf = vec![0u8; 1152];
	let mut message_id = 7000u16;
	loop {
		tokio::select! {
			received = socket.recv_from(&mut buf) => {
				let (len, peer) = received.unwrap();
				let packet = Packet::from_bytes(&buf[..len]).unwrap();
				if let Some(reply) = handle(&state, packet, peer) {
					socket.send_to(&reply, peer).await.unwrap();
				}
				let deferred = state.lock().unwrap().deferred.take();
				if let Some(response) = deferred {
					let socket = socket.clone();
					tokio::spawn(async move {
						time::sleep(SEPARATE_DELAY).await;
						socket.send_to(&response, peer).await.unwrap();
					});
				}
			}
			Some(payload) = notifications.recv() => {
				let observer = state.lock().unwrap().observer.clone();
				let Some((peer, token)) = observer else { continue };
				message_id += 1;
				let mut packet = Packet::new();
				packet.header.set_type(MessageType::NonConfirmable);
				packet.header.code = MessageClass::Response(ResponseType::Content);
				packet.header.message_id = message_id;
				packet.set_token(token);
				packet.add_option(CoapOption::Observe, vec![(message_id & 0xff) as u8]);
				packet.payload = payload;
				socket.send_to(&packet.to_bytes().unwrap(), peer).await.unwrap();
			}
		}
	}
}

fn empty(kind: MessageType, message_id: u16) -> Vec<u8> {
	let mut packet = Packet::new();
	packet.header.set_type(kind);
	packet.header.code = MessageClass::Empty;
	packet.header.message_id = message_id;
	packet.to_bytes().unwrap()
}

fn handle(state: &Mutex<ServerState>, packet: Packet, peer: SocketAddr) -> Option<Vec<u8>> {
	let mut state = state.lock().unwrap();
	let message_id = packet.header.message_id;
	if matches!(packet.header.code, MessageClass::Empty) {
		if !matches!(packet.header.get_type(), MessageType::Confirmable) {
			return None;
		}
		state.pings += 1;
		return Some(empty(MessageType::Reset, message_id));
	}

	let observe = packet.get_option(CoapOption::Observe).is_some();
	let token = packet.get_token().to_vec();
	let request = CoapRequest::from_packet(packet, peer);
	let method = *request.get_method();
	let path = request.get_path();
	let payload = request.message.payload.clone();
	let mut response = request.response?;

	match (method, path.as_str()) {
		(RequestType::Get, "things/lamp/shadow/get") => {
			state.gets += 1;
			if state.ignore_next_get {
				state.ignore_next_get = false;
				return None;
			}
			match state.document.clone() {
				Some(document) if state.separate_responses => {
					let mut separate = Packet::new();
					separate.header.set_type(MessageType::Confirmable);
					separate.header.code = MessageClass::Response(ResponseType::Content);
					separate.header.message_id = message_id.wrapping_add(1000);
					separate.set_token(token);
					separate.payload = document;
					state.deferred = Some(separate.to_bytes().unwrap());
					return Some(empty(MessageType::Acknowledgement, message_id));
				}
				Some(document) => {
					response.set_status(ResponseType::Content);
					response.message.payload = document;
				}
				None => response.set_status(ResponseType::NotFound),
			}
		}
		(RequestType::Put, "things/lamp/shadow/reset") => {
			return Some(empty(MessageType::Reset, message_id));
		}
		(RequestType::Put, "things/lamp/shadow/update") => {
			state.updates.push(payload.clone());
			response.set_status(ResponseType::Changed);
			response.message.payload = payload;
		}
		(RequestType::Get, "things/lamp/shadow/update/documents") if observe => {
			state.observer = Some((peer, token));
			response.set_status(ResponseType::Content);
			response.message.add_option(CoapOption::Observe, vec![0]);
		}
		_ => response.set_status(ResponseType::NotFound),
	}
	Some(response.message.to_bytes().unwrap())
}

fn topics() -> ShadowTopics {
	ShadowTopics::for_thing("lamp")
}

#[tokio::test]
async fn connect_pings_then_fetches_the_document() {
	let server = FakeShadow::start(Some(DOCUMENT)).await;
	let mut transport = server.transport();

	transport.connect(TIMEOUT).await.unwrap();
	assert!(transport.is_connected());
	assert_eq!(server.state().pings, 1);

	let payload = transport.fetch_once(&topics().get, TIMEOUT).await.unwrap().unwrap();
	let desired = decode_desired(&payload).unwrap().unwrap();
	assert_eq!(desired.power_state, Some(PowerState::On));
	assert_eq!(desired.brightness.map(|b| b.percent()), Some(42));
}

#[tokio::test]
async fn missing_document_is_not_an_error() {
	let server = FakeShadow::start(None).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();

	assert_eq!(transport.fetch_once(&topics().get, TIMEOUT).await.unwrap(), None);
}

#[tokio::test]
async fn publish_returns_the_acknowledgement_payload() {
	let server = FakeShadow::start(None).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();

	let update = br#"{"state":{"reported":{"power_state":"OFF","brightness":100,"mode":"STATIC"}}}"#.to_vec();
	let ack = transport
		.publish(&topics().update, update.clone(), TIMEOUT)
		.await
		.unwrap();

	assert_eq!(ack, update);
	assert_eq!(server.state().updates, vec![update]);
}

#[tokio::test]
async fn publish_to_unknown_resource_is_rejected() {
	let server = FakeShadow::start(None).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();

	let result = transport
		.publish("things/lamp/shadow/delete", b"{}".to_vec(), TIMEOUT)
		.await;
	assert!(matches!(result, Err(TransportError::Rejected(_))));
}

#[tokio::test]
async fn observe_notifications_reach_the_callback() {
	let server = FakeShadow::start(None).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();

	let (tx, mut rx) = mpsc::unbounded_channel();
	transport
		.subscribe(
			&topics().documents,
			Arc::new(move |payload| {
				let _ = tx.send(payload);
			}),
		)
		.await
		.unwrap();
	assert!(server.state().observer.is_some());

	server.notify.send(DOCUMENT.to_vec()).unwrap();
	let heard = time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
	assert_eq!(heard, DOCUMENT);
}

#[tokio::test]
async fn lost_request_is_retransmitted() {
	let server = FakeShadow::start(Some(DOCUMENT)).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();
	server.state().ignore_next_get = true;

	let started = Instant::now();
	let payload = transport
		.fetch_once(&topics().get, Duration::from_secs(5))
		.await
		.unwrap();

	assert_eq!(payload.as_deref(), Some(DOCUMENT));
	assert!(started.elapsed() >= Duration::from_secs(2));
	assert_eq!(server.state().gets, 2);
}

#[tokio::test]
async fn empty_ack_stops_retransmission_until_the_separate_response() {
	let server = FakeShadow::start(Some(DOCUMENT)).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();
	server.state().separate_responses = true;

	let started = Instant::now();
	let payload = transport
		.fetch_once(&topics().get, Duration::from_secs(5))
		.await
		.unwrap();

	assert_eq!(payload.as_deref(), Some(DOCUMENT));
	assert!(started.elapsed() >= SEPARATE_DELAY);
	assert_eq!(server.state().gets, 1);
}

#[tokio::test]
async fn reset_request_is_rejected_at_once() {
	let server = FakeShadow::start(None).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();

	let started = Instant::now();
	let result = transport
		.publish("things/lamp/shadow/reset", b"{}".to_vec(), Duration::from_secs(5))
		.await;
	assert!(matches!(result, Err(TransportError::Rejected(_))));
	assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn unanswered_request_times_out() {
	let server = FakeShadow::start(Some(DOCUMENT)).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();
	server.state().ignore_next_get = true;

	let result = transport
		.fetch_once(&topics().get, Duration::from_millis(300))
		.await;
	assert!(matches!(result, Err(TransportError::Timeout)));
}

#[tokio::test]
async fn silent_peer_fails_the_connect() {
	let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let mut transport = CoapShadowTransport::new(silent.local_addr().unwrap().to_string());

	let result = transport.connect(Duration::from_millis(300)).await;
	assert!(matches!(result, Err(TransportError::Timeout)));
	assert!(!transport.is_connected());
}

#[tokio::test]
async fn operations_need_a_connection() {
	let mut transport = CoapShadowTransport::new("127.0.0.1:5683");
	assert!(matches!(
		transport.fetch_once(&topics().get, TIMEOUT).await,
		Err(TransportError::Disconnected)
	));

	let server = FakeShadow::start(None).await;
	let mut transport = server.transport();
	transport.connect(TIMEOUT).await.unwrap();
	transport.disconnect().await.unwrap();
	assert!(!transport.is_connected());
	assert!(matches!(
		transport.publish(&topics().update, b"{}".to_vec(), TIMEOUT).await,
		Err(TransportError::Disconnected)
	));
}
