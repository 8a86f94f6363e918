use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use messagebus::binding::{BindKind, BindingSet, RuleBinder};
use messagebus::{
	Bus, BusError, ContentType, ControlAction, ErrorKind, FnListener, Listener, ListenerRef,
	Message, MessageRef, MessageType, Payload, Provider, Service, data_binder, send_data,
	send_reply,
};

fn collecting_listener() -> (ListenerRef, Receiver<MessageRef>) {
	let (tx, rx) = unbounded();
	let listener = FnListener::new(move |message: &MessageRef| {
		let _ = tx.send(message.clone());
	});
	(listener, rx)
}

/// Replies on the caller thread with a name/value response echoing the
/// request's `ping` parameter.
struct EchoService;

impl Provider for EchoService {
	fn create_message(&self) -> Message {
		Message::nv("echo", MessageType::P2P)
	}
}

impl Listener for EchoService {
	fn on_message(&self, request: &MessageRef) {
		let mut response = {
			let req = request.lock();
			let mut r = req.derived();
			r.msg_type = MessageType::Resp;
			r
		};
		let ping = request.lock().param("ping").map(str::to_owned);
		if let Some(ping) = ping {
			response.set_param("pong", &ping);
		}
		send_reply(request, &response.into_ref());
	}
}

impl Service for EchoService {
	fn subject(&self) -> &str {
		"echo"
	}
}

/// Accepts requests and never replies.
struct SilentService;

impl Provider for SilentService {
	fn create_message(&self) -> Message {
		Message::nv("silent", MessageType::P2P)
	}
}

impl Listener for SilentService {
	fn on_message(&self, _request: &MessageRef) {}
}

impl Service for SilentService {
	fn subject(&self) -> &str {
		"silent"
	}
}

/// Replies with a streamed response delivered in two chunks.
struct StreamReplyService;

impl Provider for StreamReplyService {
	fn create_message(&self) -> Message {
		Message::nv("chunks", MessageType::P2P)
	}
}

impl Listener for StreamReplyService {
	fn on_message(&self, request: &MessageRef) {
		let response = {
			let req = request.lock();
			let mut r = req.derived();
			r.msg_type = MessageType::RespStream;
			r.payload = Payload::Stream(Vec::new());
			r.into_ref()
		};
		send_reply(request, &response);
		send_data(&response, b"hello ");
		send_data(&response, b"stream");
		send_data(&response, &[]);
	}
}

impl Service for StreamReplyService {
	fn subject(&self) -> &str {
		"chunks"
	}
}

/// Counts deliveries, ignoring control-action notifications.
struct CountingService {
	ticks: Arc<AtomicUsize>,
}

impl Provider for CountingService {
	fn create_message(&self) -> Message {
		Message::nv("ticker", MessageType::P2P)
	}
}

impl Listener for CountingService {
	fn on_message(&self, request: &MessageRef) {
		if request.lock().control == ControlAction::None {
			self.ticks.fetch_add(1, Ordering::SeqCst);
		}
	}
}

impl Service for CountingService {
	fn subject(&self) -> &str {
		"ticker"
	}
}

/// Posts back an XML string response that flows through the request's
/// data binder.
struct ModelService {
	bus: Arc<Bus>,
	xml: &'static str,
}

impl Provider for ModelService {
	fn create_message(&self) -> Message {
		Message::nv("model", MessageType::P2P)
	}
}

impl Listener for ModelService {
	fn on_message(&self, request: &MessageRef) {
		let response = {
			let req = request.lock();
			let mut r = req.derived();
			r.msg_type = MessageType::RespString;
			r.payload = Payload::Text(self.xml.to_owned());
			r.into_ref()
		};
		self.bus
			.post_response(&response, request)
			.expect("post response");
	}
}

impl Service for ModelService {
	fn subject(&self) -> &str {
		"model"
	}
}

fn wait_for(check: impl Fn() -> bool, timeout: Duration) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if check() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(5));
	}
	check()
}

#[test]
fn sync_send_receives_the_reply() {
	let bus = Bus::new();
	bus.register_service(Arc::new(EchoService)).unwrap();

	let request = bus.create_message("echo", MessageType::Req, true);
	request.lock().set_param("ping", "42");
	let response = bus.send(&request).unwrap();

	let response = response.lock();
	assert_eq!(response.msg_type, MessageType::Resp);
	assert!(!response.is_error());
	assert_eq!(response.param("pong"), Some("42"));
	bus.shutdown();
}

#[test]
fn sync_send_aggregates_a_streamed_reply() {
	let bus = Bus::new();
	bus.register_service(Arc::new(StreamReplyService)).unwrap();

	let request = bus.create_message("chunks", MessageType::Req, true);
	let response = bus.send(&request).unwrap();

	let response = response.lock();
	match &response.payload {
		Payload::Text(text) => assert_eq!(text, "hello stream"),
		other => panic!("expected text payload, got {other:?}"),
	}
	bus.shutdown();
}

#[test]
fn sync_send_to_unknown_subject_is_an_error_response() {
	let bus = Bus::new();
	let request = bus.create_message("nowhere", MessageType::P2P, true);
	let response = bus.send(&request).unwrap();

	let response = response.lock();
	assert_eq!(response.error, ErrorKind::MessageBus);
	assert!(response.error_desc.contains("nowhere"));
	bus.shutdown();
}

#[test]
fn sync_send_times_out_when_the_service_never_replies() {
	let bus = Bus::new();
	bus.register_service(Arc::new(SilentService)).unwrap();

	let request = bus.create_message("silent", MessageType::P2P, true);
	request.lock().timeout = Some(Duration::from_millis(50));

	let started = Instant::now();
	let response = bus.send(&request).unwrap();
	let elapsed = started.elapsed();

	let response = response.lock();
	assert_eq!(response.error, ErrorKind::ExecutionTimeout);
	assert_eq!(response.error_code, 7);
	assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
	bus.shutdown();
}

#[test]
fn send_rejects_non_point_to_point_messages() {
	let bus = Bus::new();
	let message = Message::nv("echo", MessageType::Resp).into_ref();
	assert!(matches!(bus.send(&message), Err(BusError::NotPointToPoint)));
	bus.shutdown();
}

#[test]
fn post_multicasts_to_exact_and_pattern_listeners() {
	let bus = Bus::new();
	let (exact, exact_rx) = collecting_listener();
	let (pattern, pattern_rx) = collecting_listener();
	let (other, other_rx) = collecting_listener();
	bus.register_listener("price.nyse", exact).unwrap();
	bus.register_listener("price\\..*", pattern).unwrap();
	bus.register_listener("volume.nyse", other).unwrap();

	let message = Message::nv("price.nyse", MessageType::Resp).into_ref();
	let receivers = bus.post(&message, None).unwrap();
	assert_eq!(receivers, 2);

	assert!(exact_rx.recv_timeout(Duration::from_secs(1)).is_ok());
	assert!(pattern_rx.recv_timeout(Duration::from_secs(1)).is_ok());
	assert!(other_rx.recv_timeout(Duration::from_millis(100)).is_err());
	bus.shutdown();
}

#[test]
fn post_with_callback_on_p2p_is_invalid() {
	let bus = Bus::new();
	bus.register_service(Arc::new(EchoService)).unwrap();

	let (listener, _rx) = collecting_listener();
	let request = bus.create_message("echo", MessageType::P2P, true);
	assert!(matches!(
		bus.post(&request, Some(listener)),
		Err(BusError::InvalidCallback)
	));
	bus.shutdown();
}

#[test]
fn post_to_unknown_service_reaches_nobody() {
	let bus = Bus::new();
	let request = Message::nv("ghost", MessageType::P2P).into_ref();
	assert_eq!(bus.post(&request, None).unwrap(), 0);
	bus.shutdown();
}

#[test]
fn duplicate_registrations_are_rejected() {
	let bus = Bus::new();
	bus.register_service(Arc::new(EchoService)).unwrap();
	assert!(matches!(
		bus.register_service(Arc::new(EchoService)),
		Err(BusError::DuplicateService(_))
	));

	let (listener, _rx) = collecting_listener();
	bus.register_listener("dup", listener.clone()).unwrap();
	assert!(matches!(
		bus.register_listener("dup", listener),
		Err(BusError::DuplicateListener(_))
	));
	bus.shutdown();
}

#[test]
fn unregistered_listener_no_longer_receives() {
	let bus = Bus::new();
	let (listener, rx) = collecting_listener();
	bus.register_listener("news", listener.clone()).unwrap();

	let message = Message::nv("news", MessageType::Resp).into_ref();
	assert_eq!(bus.post(&message, None).unwrap(), 1);
	assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());

	bus.unregister_listener(&listener);
	let message = Message::nv("news", MessageType::Resp).into_ref();
	assert_eq!(bus.post(&message, None).unwrap(), 0);
	bus.shutdown();
}

#[test]
fn delayed_messages_deliver_in_time_order() {
	let bus = Bus::new();
	let (listener, rx) = collecting_listener();
	bus.register_listener("ordered", listener).unwrap();

	let slow = Message::nv("ordered", MessageType::Resp).into_ref();
	slow.lock().set_param("n", "slow");
	slow.lock().set_delay(Duration::from_millis(120), false, false);

	let fast = Message::nv("ordered", MessageType::Resp).into_ref();
	fast.lock().set_param("n", "fast");
	fast.lock().set_delay(Duration::from_millis(30), false, false);

	bus.post(&slow, None).unwrap();
	bus.post(&fast, None).unwrap();

	let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
	let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
	assert_eq!(first.lock().param("n"), Some("fast"));
	assert_eq!(second.lock().param("n"), Some("slow"));
	bus.shutdown();
}

#[test]
fn equal_post_times_preserve_posting_order() {
	let bus = Bus::new();
	let (listener, rx) = collecting_listener();
	bus.register_listener("fifo", listener).unwrap();

	for n in 0..5 {
		let message = Message::nv("fifo", MessageType::Resp).into_ref();
		message.lock().set_param("n", &n.to_string());
		bus.post(&message, None).unwrap();
	}

	for expected in 0..5 {
		let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
		assert_eq!(received.lock().param("n"), Some(expected.to_string().as_str()));
	}
	bus.shutdown();
}

#[test]
fn polling_subscription_ticks_until_cancelled() {
	let bus = Bus::new();
	let ticks = Arc::new(AtomicUsize::new(0));
	bus.register_service(Arc::new(CountingService { ticks: ticks.clone() }))
		.unwrap();

	let subscription = bus.create_message("ticker", MessageType::P2P, true);
	subscription
		.lock()
		.set_delay(Duration::from_millis(50), true, false);
	let subscription_id = subscription.lock().id();
	assert_eq!(subscription.lock().msg_type, MessageType::P2PSub);
	bus.post(&subscription, None).unwrap();

	let ticked = {
		let ticks = ticks.clone();
		wait_for(move || ticks.load(Ordering::SeqCst) >= 2, Duration::from_secs(2))
	};
	assert!(ticked, "subscription never reached two ticks");

	let cancel = bus.create_message("ticker", MessageType::P2P, true);
	cancel
		.lock()
		.set_control(ControlAction::Cancel, Some(subscription_id));
	bus.post(&cancel, None).unwrap();

	std::thread::sleep(Duration::from_millis(250));
	let after_cancel = ticks.load(Ordering::SeqCst);
	assert_eq!(after_cancel, 2, "subscription kept ticking after cancel");
	bus.shutdown();
}

#[test]
fn suspended_subscription_stops_ticking_until_resumed() {
	let bus = Bus::new();
	let ticks = Arc::new(AtomicUsize::new(0));
	bus.register_service(Arc::new(CountingService { ticks: ticks.clone() }))
		.unwrap();

	let subscription = bus.create_message("ticker", MessageType::P2P, true);
	subscription
		.lock()
		.set_delay(Duration::from_millis(40), true, false);
	let subscription_id = subscription.lock().id();
	bus.post(&subscription, None).unwrap();

	let ticked = {
		let ticks = ticks.clone();
		wait_for(move || ticks.load(Ordering::SeqCst) >= 1, Duration::from_secs(2))
	};
	assert!(ticked);

	let suspend = bus.create_message("ticker", MessageType::P2P, true);
	suspend
		.lock()
		.set_control(ControlAction::Suspend, Some(subscription_id));
	bus.post(&suspend, None).unwrap();
	std::thread::sleep(Duration::from_millis(100));

	let while_suspended = ticks.load(Ordering::SeqCst);
	std::thread::sleep(Duration::from_millis(200));
	// At most one in-flight delivery may land after the suspend.
	assert!(
		ticks.load(Ordering::SeqCst) <= while_suspended + 1,
		"suspended subscription kept ticking"
	);

	let resume = bus.create_message("ticker", MessageType::P2P, true);
	resume
		.lock()
		.set_control(ControlAction::Resume, Some(subscription_id));
	bus.post(&resume, None).unwrap();

	let resumed_from = ticks.load(Ordering::SeqCst);
	let resumed = {
		let ticks = ticks.clone();
		wait_for(
			move || ticks.load(Ordering::SeqCst) > resumed_from,
			Duration::from_secs(2),
		)
	};
	assert!(resumed, "subscription did not resume");

	let cancel = bus.create_message("ticker", MessageType::P2P, true);
	cancel
		.lock()
		.set_control(ControlAction::Cancel, Some(subscription_id));
	bus.post(&cancel, None).unwrap();
	bus.shutdown();
}

#[test]
fn response_stream_unmarshals_into_a_model() {
	let bus = Bus::new();
	bus.register_service(Arc::new(ModelService {
		bus: bus.clone(),
		xml: "<resp><name>n1</name><detail><kind>fast</kind></detail></resp>",
	}))
	.unwrap();

	let (listener, rx) = collecting_listener();
	bus.register_listener("model", listener).unwrap();

	let mut binder = RuleBinder::with_bindings(&BindingSet::new());
	binder.add_value_binding("*/name", "name", false);
	binder.add_binding("*/detail", BindKind::Map, "detail", "");
	binder.add_value_binding("*/detail/kind", "kind", false);

	let request = bus.create_message("model", MessageType::P2P, true);
	request.lock().data_binder = Some(data_binder(binder));
	assert_eq!(bus.post(&request, None).unwrap(), 1);

	let response = rx.recv_timeout(Duration::from_secs(2)).unwrap();
	let response = response.lock();
	assert_eq!(response.msg_type, MessageType::Resp);
	assert_eq!(response.content_type, ContentType::Model);
	let model = response.model().expect("model payload");
	assert_eq!(
		model.read().to_json(),
		r#"{"name":"n1","detail":{"kind":"fast"}}"#
	);
	bus.shutdown();
}

#[test]
fn malformed_response_stream_surfaces_a_service_error() {
	let bus = Bus::new();
	bus.register_service(Arc::new(ModelService {
		bus: bus.clone(),
		xml: "<resp><open>x</close></resp>",
	}))
	.unwrap();

	let (listener, rx) = collecting_listener();
	bus.register_listener("model", listener).unwrap();

	let mut binder = RuleBinder::with_bindings(&BindingSet::new());
	binder.add_value_binding("*/name", "name", false);

	let request = bus.create_message("model", MessageType::P2P, true);
	request.lock().data_binder = Some(data_binder(binder));
	bus.post(&request, None).unwrap();

	let response = rx.recv_timeout(Duration::from_secs(2)).unwrap();
	let response = response.lock();
	assert_eq!(response.error, ErrorKind::Service);
	assert!(response.error_desc.contains("parse error"));
	bus.shutdown();
}

#[test]
fn a_bound_binder_rejects_a_second_response() {
	let bus = Bus::new();
	let (listener, rx) = collecting_listener();
	bus.register_listener("feed", listener).unwrap();

	let mut binder = RuleBinder::with_bindings(&BindingSet::new());
	binder.add_value_binding("*/v", "v", false);
	let shared = data_binder(binder);

	// Simulate another response mid-bind.
	assert!(shared.lock().lock());

	let response = Message::text("feed", MessageType::RespString).into_ref();
	{
		let mut r = response.lock();
		r.payload = Payload::Text("<r><v>1</v></r>".to_owned());
		r.data_binder = Some(shared.clone());
	}
	bus.post(&response, None).unwrap();

	let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
	{
		let delivered = delivered.lock();
		assert_eq!(delivered.error, ErrorKind::Service);
		assert!(delivered.error_desc.contains("still being bound"));
	}

	// Release and retry: the binder is usable again.
	shared.lock().reset();
	let response = Message::text("feed", MessageType::RespString).into_ref();
	{
		let mut r = response.lock();
		r.payload = Payload::Text("<r><v>2</v></r>".to_owned());
		r.data_binder = Some(shared.clone());
	}
	bus.post(&response, None).unwrap();

	let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
	let delivered = delivered.lock();
	assert!(!delivered.is_error());
	assert_eq!(delivered.content_type, ContentType::Model);
	assert_eq!(
		delivered.model().unwrap().read().to_json(),
		r#"{"v":"2"}"#
	);
	bus.shutdown();
}

#[test]
fn provider_supplies_request_messages() {
	let bus = Bus::new();
	bus.register_service(Arc::new(EchoService)).unwrap();

	let provided = bus.create_message("echo", MessageType::Req, true);
	assert_eq!(provided.lock().msg_type, MessageType::P2P);
	assert_eq!(provided.lock().subject, "echo");

	let fallback = bus.create_message("unknown", MessageType::Req, true);
	assert_eq!(fallback.lock().msg_type, MessageType::Req);
	assert_eq!(fallback.lock().content_type, ContentType::NvMap);

	let model_default = bus.create_message("unknown", MessageType::Req, false);
	assert_eq!(model_default.lock().content_type, ContentType::Model);
	bus.shutdown();
}

#[test]
fn subject_callbacks_fire_on_registration() {
	let bus = Bus::new();
	let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
	{
		let seen = seen.clone();
		bus.add_subject_registered_callback(Arc::new(move |subject: &str, is_service: bool| {
			seen.lock().push((subject.to_owned(), is_service));
		}));
	}

	bus.register_service(Arc::new(EchoService)).unwrap();
	let (listener, _rx) = collecting_listener();
	bus.register_listener("plain", listener).unwrap();

	let seen = seen.lock();
	assert!(seen.contains(&("echo".to_owned(), true)));
	assert!(seen.contains(&("plain".to_owned(), false)));
	bus.shutdown();
}

#[test]
fn activity_callbacks_can_veto_posts() {
	let bus = Bus::new();
	let (listener, rx) = collecting_listener();
	bus.register_listener("vetoed", listener).unwrap();

	bus.add_activity_callback(
		MessageType::Resp,
		Arc::new(|message: &MessageRef| message.lock().param("allow") == Some("yes")),
	);

	let blocked = Message::nv("vetoed", MessageType::Resp).into_ref();
	bus.post(&blocked, None).unwrap();
	assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

	let allowed = Message::nv("vetoed", MessageType::Resp).into_ref();
	allowed.lock().set_param("allow", "yes");
	bus.post(&allowed, None).unwrap();
	assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
	bus.shutdown();
}
