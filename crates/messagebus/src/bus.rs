use std::collections::{HashMap, HashSet};

use bus_binding::XmlDriver;
use bus_core::prelude::*;
use parking_lot::{Condvar, Mutex, RwLock};
use regex::Regex;

use crate::error::BusError;
use crate::message::{
	ContentType, DataBinderRef, ErrorKind, Message, MessageRef, MessageType, Payload,
};
use crate::queue::{ActivityCallback, DeliveryQueue};
use crate::service::{ListenerRef, Provider, ReplyForwarder, Service};

// A subject containing any of these unescaped becomes a passive (regex)
// listener registration.
const SEARCH_CHARS: &[char] = &['[', ']', '*', '+', '.'];

/// Notified when a subject gains or loses a registration; the flag tells
/// services apart from plain listeners.
pub type SubjectCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

struct Registration {
	subject: String,
	is_regex: bool,
	listener: ListenerRef,
}

#[derive(Default)]
struct ListenerRegistry {
	all: Vec<Registration>,
	active: HashMap<String, Vec<ListenerRef>>,
	passive: Vec<(Regex, ListenerRef)>,
}

/// The central registry and dispatch surface: services and providers by
/// subject, multicast listeners (exact and pattern), the delivery queue,
/// and the streaming pipeline that unmarshals service responses through a
/// message's data binder.
pub struct Bus {
	providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
	services: RwLock<HashMap<String, Arc<dyn Service>>>,
	service_listeners: RwLock<HashMap<String, ListenerRef>>,
	listeners: RwLock<ListenerRegistry>,
	registered_callbacks: RwLock<Vec<SubjectCallback>>,
	unregistered_callbacks: RwLock<Vec<SubjectCallback>>,
	queue: Arc<DeliveryQueue>,
}

impl Bus {
	pub fn new() -> Arc<Bus> {
		Arc::new(Bus {
			providers: RwLock::new(HashMap::new()),
			services: RwLock::new(HashMap::new()),
			service_listeners: RwLock::new(HashMap::new()),
			listeners: RwLock::new(ListenerRegistry::default()),
			registered_callbacks: RwLock::new(Vec::new()),
			unregistered_callbacks: RwLock::new(Vec::new()),
			queue: Arc::new(DeliveryQueue::new()),
		})
	}

	/// Stop the delivery worker; pending timers are discarded.
	pub fn shutdown(&self) {
		self.queue.stop();
	}

	pub fn add_subject_registered_callback(&self, callback: SubjectCallback) {
		self.registered_callbacks.write().push(callback);
	}

	pub fn add_subject_unregistered_callback(&self, callback: SubjectCallback) {
		self.unregistered_callbacks.write().push(callback);
	}

	pub fn add_activity_callback(&self, msg_type: MessageType, callback: ActivityCallback) {
		self.queue.add_activity_callback(msg_type, callback);
	}

	/// Create a message for a subject. A registered provider supplies
	/// `Req` messages; otherwise a default name/value (or model) message
	/// is returned with subject and type filled in where the provider
	/// left them unset.
	pub fn create_message(
		&self,
		subject: &str,
		msg_type: MessageType,
		default_nv: bool,
	) -> MessageRef {
		let mut message = None;
		if msg_type == MessageType::Req {
			if let Some(provider) = self.providers.read().get(subject) {
				message = Some(provider.create_message());
			}
		}
		let mut message = message.unwrap_or_else(|| {
			if default_nv {
				Message::nv("", MessageType::Unknown)
			} else {
				Message::data("", MessageType::Unknown)
			}
		});
		if message.subject.is_empty() {
			message.subject = subject.to_owned();
		}
		if message.msg_type == MessageType::Unknown {
			message.msg_type = msg_type;
		}
		message.into_ref()
	}

	/// Synchronous point-to-point request: dispatch to the subject's
	/// service on the calling thread and block until the reply callback
	/// completes. A streamed reply is aggregated into a text payload. An
	/// unknown subject or an exceeded `Message::timeout` come back as
	/// error-tagged responses, never as panics or hangs.
	pub fn send(&self, message: &MessageRef) -> Result<MessageRef, BusError> {
		let (msg_type, subject, timeout) = {
			let m = message.lock();
			(m.msg_type, m.subject.clone(), m.timeout)
		};
		if !matches!(msg_type, MessageType::P2P | MessageType::P2PSub) {
			return Err(BusError::NotPointToPoint);
		}

		let service = self.services.read().get(&subject).cloned();
		let Some(service) = service else {
			let mut response = message.lock().derived();
			response.msg_type = MessageType::Resp;
			let err = BusError::UnknownSubject(subject);
			response.set_error(ErrorKind::MessageBus, ErrorKind::MessageBus.code(), &err.to_string());
			return Ok(response.into_ref());
		};

		trace!(%subject, "sync send");
		let rendezvous = Arc::new(Rendezvous::default());
		{
			let rendezvous = rendezvous.clone();
			message.lock().set_reply_callback(Arc::new(
				move |reply: &MessageRef| Rendezvous::on_reply(&rendezvous, reply),
			));
		}
		service.on_message(message);

		match rendezvous.wait(timeout) {
			Some(response) => Ok(response),
			None => {
				debug!(subject = %message.lock().subject, "sync send timed out");
				let mut response = message.lock().derived();
				response.msg_type = MessageType::Resp;
				response.set_error(
					ErrorKind::ExecutionTimeout,
					ErrorKind::ExecutionTimeout.code(),
					&BusError::ExecutionTimeout.to_string(),
				);
				Ok(response.into_ref())
			},
		}
	}

	/// Post a message. Point-to-point kinds go to the owning service
	/// (a reply callback argument is invalid there); everything else fans
	/// out to exact listeners, matching pattern listeners and the optional
	/// caller callback. Returns the receiver count. A response carrying a
	/// data binder is routed through the unmarshalling pipeline.
	pub fn post(
		&self,
		message: &MessageRef,
		callback: Option<ListenerRef>,
	) -> Result<usize, BusError> {
		let (msg_type, subject, has_binder) = {
			let m = message.lock();
			(m.msg_type, m.subject.clone(), m.data_binder.is_some())
		};

		let mut listeners: Vec<ListenerRef> = Vec::new();
		if matches!(msg_type, MessageType::P2P | MessageType::P2PSub) {
			if callback.is_some() {
				return Err(BusError::InvalidCallback);
			}
			match self.service_listeners.read().get(&subject) {
				Some(listener) => listeners.push(listener.clone()),
				None => return Ok(0),
			}
		} else {
			if let Some(callback) = callback {
				listeners.push(callback);
			}
			let registry = self.listeners.read();
			if let Some(active) = registry.active.get(&subject) {
				listeners.extend(active.iter().cloned());
			}
			for (pattern, listener) in &registry.passive {
				if pattern.is_match(&subject) {
					listeners.push(listener.clone());
				}
			}
		}

		if listeners.is_empty() {
			return Ok(0);
		}
		let receivers = listeners.len();
		trace!(%subject, ?msg_type, receivers, "posting");

		if has_binder && matches!(msg_type, MessageType::RespString | MessageType::RespStream) {
			self.bind_response(listeners, message);
		} else {
			multicast(&self.queue, listeners, message);
		}
		Ok(receivers)
	}

	/// Post a response for a request, forwarding to the request's reply
	/// callback when it carries one.
	pub fn post_response(
		&self,
		response: &MessageRef,
		request: &MessageRef,
	) -> Result<usize, BusError> {
		let callback = {
			let req = request.lock();
			(matches!(req.msg_type, MessageType::P2P | MessageType::P2PSub)
				&& req.has_reply_callback())
			.then(|| ReplyForwarder::new(request.clone()))
		};
		self.post(response, callback)
	}

	/// Route response bytes through the message's data binder: lock the
	/// binder, stream chunks through an XML driver into it, and deliver
	/// the finished tree (or an error-tagged response) to the listeners.
	fn bind_response(&self, listeners: Vec<ListenerRef>, message: &MessageRef) {
		let (msg_type, binder) = {
			let m = message.lock();
			(m.msg_type, m.data_binder.clone())
		};
		let Some(binder) = binder else {
			multicast(&self.queue, listeners, message);
			return;
		};
		let pending = Arc::new(PendingResponse {
			queue: self.queue.clone(),
			listeners,
			binder,
			state: Mutex::new(PendingState::default()),
		});

		match msg_type {
			MessageType::RespString => {
				let body = {
					let m = message.lock();
					match &m.payload {
						Payload::Text(text) => text.clone(),
						_ => String::new(),
					}
				};
				if !body.is_empty() {
					PendingResponse::feed(&pending, message, body.as_bytes());
				}
				PendingResponse::feed(&pending, message, &[]);
			},
			MessageType::RespStream => {
				let pipeline = pending.clone();
				message
					.lock()
					.add_data_callback(Arc::new(move |msg: &MessageRef, buf: &[u8]| {
						PendingResponse::feed(&pipeline, msg, buf)
					}));
			},
			_ => {},
		}
	}

	/// Register a service: it becomes the provider and the exclusive
	/// point-to-point listener for its subject.
	pub fn register_service<S: Service + 'static>(&self, service: Arc<S>) -> Result<(), BusError> {
		let subject = service.subject().to_owned();
		{
			let mut services = self.services.write();
			let mut providers = self.providers.write();
			if services.contains_key(&subject) {
				return Err(BusError::DuplicateService(subject));
			}
			if providers.contains_key(&subject) {
				return Err(BusError::DuplicateProvider(subject));
			}
			providers.insert(subject.clone(), service.clone());
			services.insert(subject.clone(), service.clone());
			self.service_listeners
				.write()
				.insert(subject.clone(), service.clone());
		}
		service.initialize();
		info!(%subject, "service registered");
		for callback in self.registered_callbacks.read().iter() {
			callback(&subject, true);
		}
		Ok(())
	}

	pub fn unregister_service(&self, subject: &str) -> Option<Arc<dyn Service>> {
		for callback in self.unregistered_callbacks.read().iter() {
			callback(subject, true);
		}
		let service = {
			let mut services = self.services.write();
			let mut providers = self.providers.write();
			providers.remove(subject);
			self.service_listeners.write().remove(subject);
			services.remove(subject)
		};
		if let Some(service) = &service {
			service.destroy();
			info!(%subject, "service unregistered");
		}
		service
	}

	pub fn service(&self, subject: &str) -> Option<Arc<dyn Service>> {
		self.services.read().get(subject).cloned()
	}

	/// Register a multicast listener. A subject containing unescaped
	/// regex metacharacters (`[]*+.`) becomes a pattern registration
	/// matched against posted subjects.
	pub fn register_listener(
		&self,
		subject: &str,
		listener: ListenerRef,
	) -> Result<(), BusError> {
		let is_regex = is_pattern_subject(subject);
		{
			let mut registry = self.listeners.write();
			if registry
				.all
				.iter()
				.any(|r| r.subject == subject && Arc::ptr_eq(&r.listener, &listener))
			{
				return Err(BusError::DuplicateListener(subject.to_owned()));
			}

			if is_regex {
				let pattern = Regex::new(&format!("^(?:{subject})$"))
					.map_err(|e| BusError::InvalidPattern(e.to_string()))?;
				registry.passive.push((pattern, listener.clone()));
			} else {
				let list = registry.active.entry(subject.to_owned()).or_default();
				list.retain(|l| !Arc::ptr_eq(l, &listener));
				list.push(listener.clone());
			}
			registry.all.push(Registration {
				subject: subject.to_owned(),
				is_regex,
				listener,
			});
		}
		if !is_regex {
			for callback in self.registered_callbacks.read().iter() {
				callback(subject, false);
			}
		}
		Ok(())
	}

	/// Remove every registration (exact and pattern) of a listener.
	pub fn unregister_listener(&self, listener: &ListenerRef) {
		let mut affected: HashSet<String> = HashSet::new();
		{
			let mut registry = self.listeners.write();
			registry.all.retain(|r| {
				if Arc::ptr_eq(&r.listener, listener) {
					if !r.is_regex {
						affected.insert(r.subject.clone());
					}
					false
				} else {
					true
				}
			});
			registry.passive.retain(|(_, l)| !Arc::ptr_eq(l, listener));
			for subject in &affected {
				if let Some(list) = registry.active.get_mut(subject) {
					list.retain(|l| !Arc::ptr_eq(l, listener));
				}
			}
		}
		for callback in self.unregistered_callbacks.read().iter() {
			for subject in &affected {
				callback(subject, false);
			}
		}
	}

	/// Host application going to the background: let every service save
	/// state.
	pub fn pause_services(&self) {
		for service in self.services.read().values() {
			service.pause();
		}
	}

	pub fn resume_services(&self) {
		for service in self.services.read().values() {
			service.resume();
		}
	}
}

fn is_pattern_subject(subject: &str) -> bool {
	let bytes = subject.as_bytes();
	subject.char_indices().any(|(i, ch)| {
		SEARCH_CHARS.contains(&ch) && (i == 0 || bytes[i - 1] != b'\\')
	})
}

/// Fan a finished response out: stream/update responses synchronously
/// (their buffers may borrow caller memory), the rest through the queue.
fn multicast(queue: &Arc<DeliveryQueue>, listeners: Vec<ListenerRef>, message: &MessageRef) {
	let msg_type = message.lock().msg_type;
	if matches!(msg_type, MessageType::RespStream | MessageType::RespUpdate) {
		for listener in &listeners {
			listener.on_message(message);
		}
	} else {
		queue.post(listeners, message.clone());
	}
}

/// Rendezvous between a synchronous sender and the reply callback.
#[derive(Default)]
struct Rendezvous {
	state: Mutex<RendezvousState>,
	cond: Condvar,
}

#[derive(Default)]
struct RendezvousState {
	response: Option<MessageRef>,
	notified: bool,
}

impl Rendezvous {
	fn on_reply(rendezvous: &Arc<Rendezvous>, reply: &MessageRef) {
		let msg_type = reply.lock().msg_type;
		if msg_type == MessageType::RespStream {
			// Collect the stream into a text response; completion is the
			// empty end-of-stream chunk.
			let aggregate = {
				let r = reply.lock();
				let mut text = r.derived();
				text.payload = Payload::Text(String::new());
				text.into_ref()
			};
			rendezvous.state.lock().response = Some(aggregate.clone());
			let rendezvous = rendezvous.clone();
			reply
				.lock()
				.add_data_callback(Arc::new(move |_: &MessageRef, buf: &[u8]| {
					if buf.is_empty() {
						rendezvous.notify();
					} else {
						aggregate.lock().append_text(&String::from_utf8_lossy(buf));
					}
					true
				}));
		} else {
			let mut state = rendezvous.state.lock();
			state.response = Some(reply.clone());
			state.notified = true;
			rendezvous.cond.notify_all();
		}
	}

	fn notify(&self) {
		let mut state = self.state.lock();
		state.notified = true;
		self.cond.notify_all();
	}

	fn wait(&self, timeout: Option<Duration>) -> Option<MessageRef> {
		let deadline = timeout.map(|t| Instant::now() + t);
		let mut state = self.state.lock();
		while !state.notified {
			match deadline {
				Some(deadline) => {
					if self.cond.wait_until(&mut state, deadline).timed_out() {
						break;
					}
				},
				None => self.cond.wait(&mut state),
			}
		}
		if state.notified { state.response.clone() } else { None }
	}
}

/// In-flight unmarshalling of one response through a data binder.
struct PendingResponse {
	queue: Arc<DeliveryQueue>,
	listeners: Vec<ListenerRef>,
	binder: DataBinderRef,
	state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
	started: bool,
	failed: bool,
	driver: Option<XmlDriver>,
}

impl PendingResponse {
	/// Consume one chunk; empty marks end of stream. Returns false once
	/// the pipeline has failed so a streaming producer can stop early.
	fn feed(this: &Arc<Self>, message: &MessageRef, buf: &[u8]) -> bool {
		let mut state = this.state.lock();
		if state.failed {
			return false;
		}

		if buf.is_empty() {
			let root = if state.started {
				let finished = (|| {
					let mut driver = state.driver.take();
					let mut binder = this.binder.lock();
					if let Some(driver) = driver.as_mut() {
						driver.parse(&[], true, &mut *binder)?;
					}
					binder.end_binding()?;
					let root = binder.detach_root();
					binder.reset();
					Ok::<_, bus_binding::BindError>(root)
				})();
				match finished {
					Ok(root) => root,
					Err(err) => {
						state.failed = true;
						drop(state);
						this.deliver_error(message, err.into(), true);
						return false;
					},
				}
			} else {
				None
			};

			let started = state.started;
			drop(state);
			let response = {
				let m = message.lock();
				let mut r = m.derived();
				r.msg_type = MessageType::Resp;
				if started {
					r.payload = Payload::Data(root);
					r.content_type = ContentType::Model;
				}
				r.into_ref()
			};
			multicast(&this.queue, this.listeners.clone(), &response);
			true
		} else {
			if !state.started {
				if !this.binder.lock().lock() {
					state.failed = true;
					drop(state);
					this.deliver_error(message, BusError::BinderLocked, false);
					return false;
				}
				this.binder.lock().begin_binding();
				state.driver = Some(XmlDriver::new());
				state.started = true;
			}

			let parsed = {
				let Some(driver) = state.driver.as_mut() else {
					return false;
				};
				let mut binder = this.binder.lock();
				driver.parse(buf, false, &mut *binder)
			};
			match parsed {
				Ok(()) => true,
				Err(err) => {
					state.failed = true;
					drop(state);
					this.deliver_error(message, err.into(), true);
					false
				},
			}
		}
	}

	fn deliver_error(&self, message: &MessageRef, err: BusError, release_binder: bool) {
		warn!(error = %err, "response unmarshalling failed");
		if release_binder {
			self.binder.lock().reset();
		}
		let response = {
			let m = message.lock();
			let mut r = m.derived();
			r.msg_type = MessageType::Resp;
			r.set_error(ErrorKind::Service, 500, &err.to_string());
			r.into_ref()
		};
		multicast(&self.queue, self.listeners.clone(), &response);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pattern_subjects_are_detected() {
		assert!(is_pattern_subject("price.*"));
		assert!(is_pattern_subject("topic[ab]"));
		assert!(is_pattern_subject("a+b"));
		assert!(!is_pattern_subject("plain-subject"));
		assert!(!is_pattern_subject(r"escaped\.dot"));
		assert!(is_pattern_subject(".leading"));
	}
}
