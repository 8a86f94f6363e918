use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bus_binding::{NodeRef, TreeBinder};
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Messages are shared-ownership handles: any number of listeners may keep
/// one alive, and annotations (errors, control attachments, stream data)
/// mutate it in place.
pub type MessageRef = Arc<Mutex<Message>>;

/// Tree binder attached to a request so the response stream can be
/// unmarshalled into a model.
pub type DataBinderRef = Arc<Mutex<TreeBinder>>;

/// One-shot reply callback installed on a point-to-point message.
pub type MessageCallback = Arc<dyn Fn(&MessageRef) + Send + Sync>;

/// Chunk callback registered on a stream message. Returning false asks the
/// producer to stop. The buffer is only valid for the duration of the
/// call; an empty buffer marks end of stream.
pub type DataCallback = Arc<dyn Fn(&MessageRef, &[u8]) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
	Unknown,
	/// Point-to-point service request.
	P2P,
	/// Point-to-point subscription request (polled re-delivery).
	P2PSub,
	/// Service request created through a provider.
	Req,
	/// Service response.
	Resp,
	/// Service response delivered as one string.
	RespString,
	/// Service response streamed through data callbacks.
	RespStream,
	/// Incremental update pushed by a service.
	RespUpdate,
	Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
	#[default]
	Unknown,
	Xml,
	Json,
	/// An unmarshalled dynamic tree.
	Model,
	NvMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
	#[default]
	None,
	MessageBus,
	MessageTimeout,
	Service,
	ConnectionError,
	ConnectionBreak,
	ConnectionTimeout,
	ExecutionTimeout,
}

impl ErrorKind {
	/// Wire code observable on result messages.
	pub fn code(self) -> i32 {
		match self {
			ErrorKind::None => 0,
			ErrorKind::MessageBus => 1,
			ErrorKind::MessageTimeout => 2,
			ErrorKind::Service => 3,
			ErrorKind::ConnectionError => 4,
			ErrorKind::ConnectionBreak => 5,
			ErrorKind::ConnectionTimeout => 6,
			ErrorKind::ExecutionTimeout => 7,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlAction {
	#[default]
	None,
	Suspend,
	Resume,
	Cancel,
	Remove,
	Add,
}

/// Typed message content; the variant travels with the message instead of
/// an opaque pointer plus downcasts.
#[derive(Default)]
pub enum Payload {
	#[default]
	None,
	/// Name/value parameters.
	Nv(HashMap<String, String>),
	/// An unmarshalled tree.
	Data(Option<NodeRef>),
	/// A growing text buffer.
	Text(String),
	/// Stream fan-out callbacks.
	Stream(Vec<DataCallback>),
}

impl std::fmt::Debug for Payload {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Payload::None => f.write_str("None"),
			Payload::Nv(data) => f.debug_tuple("Nv").field(data).finish(),
			Payload::Data(_) => f.write_str("Data(..)"),
			Payload::Text(data) => f.debug_tuple("Text").field(data).finish(),
			Payload::Stream(cbs) => write!(f, "Stream({} callbacks)", cbs.len()),
		}
	}
}

pub struct Message {
	id: Uuid,
	pub subject: String,
	pub resp_subject: Option<String>,
	pub msg_type: MessageType,
	pub content_type: ContentType,
	delay_ms: i64,
	post_time_ms: i64,
	post_count: u32,
	pub error: ErrorKind,
	pub error_code: i32,
	pub error_desc: String,
	pub meta: HashMap<String, String>,
	pub data_binder: Option<DataBinderRef>,
	pub attachment: Option<MessageRef>,
	pub payload: Payload,
	pub control: ControlAction,
	pub target_msg_id: Option<Uuid>,
	/// Upper bound for a synchronous send; unset waits indefinitely.
	pub timeout: Option<Duration>,
	pub(crate) reply: Option<MessageCallback>,
}

impl Message {
	pub fn new(subject: &str, msg_type: MessageType) -> Self {
		Self {
			id: Uuid::new_v4(),
			subject: subject.to_owned(),
			resp_subject: None,
			msg_type,
			content_type: ContentType::Unknown,
			delay_ms: 0,
			post_time_ms: 0,
			post_count: 0,
			error: ErrorKind::None,
			error_code: 0,
			error_desc: String::new(),
			meta: HashMap::new(),
			data_binder: None,
			attachment: None,
			payload: Payload::None,
			control: ControlAction::None,
			target_msg_id: None,
			timeout: None,
			reply: None,
		}
	}

	pub fn nv(subject: &str, msg_type: MessageType) -> Self {
		let mut message = Self::new(subject, msg_type);
		message.content_type = ContentType::NvMap;
		message.payload = Payload::Nv(HashMap::new());
		message
	}

	pub fn data(subject: &str, msg_type: MessageType) -> Self {
		let mut message = Self::new(subject, msg_type);
		message.content_type = ContentType::Model;
		message.payload = Payload::Data(None);
		message
	}

	pub fn text(subject: &str, msg_type: MessageType) -> Self {
		let mut message = Self::new(subject, msg_type);
		message.payload = Payload::Text(String::new());
		message
	}

	pub fn stream(subject: &str, msg_type: MessageType) -> Self {
		let mut message = Self::new(subject, msg_type);
		message.payload = Payload::Stream(Vec::new());
		message
	}

	/// A fresh message carrying this one's routing, error and binder state.
	/// Used to build responses for a request.
	pub fn derived(&self) -> Self {
		Self {
			id: Uuid::new_v4(),
			subject: self.subject.clone(),
			resp_subject: self.resp_subject.clone(),
			msg_type: self.msg_type,
			content_type: self.content_type,
			delay_ms: self.delay_ms,
			post_time_ms: self.post_time_ms,
			post_count: 0,
			error: self.error,
			error_code: self.error_code,
			error_desc: self.error_desc.clone(),
			meta: self.meta.clone(),
			data_binder: self.data_binder.clone(),
			attachment: None,
			payload: Payload::None,
			control: ControlAction::None,
			target_msg_id: None,
			timeout: None,
			reply: None,
		}
	}

	pub fn into_ref(self) -> MessageRef {
		Arc::new(Mutex::new(self))
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn post_count(&self) -> u32 {
		self.post_count
	}

	pub(crate) fn inc_post_count(&mut self) {
		self.post_count += 1;
	}

	pub fn delay_ms(&self) -> i64 {
		self.delay_ms
	}

	/// Milliseconds until the scheduled post time; zero when due.
	pub fn delay_remaining_ms(&self) -> i64 {
		(self.post_time_ms - now_ms()).max(0)
	}

	pub fn post_time_ms(&self) -> i64 {
		self.post_time_ms
	}

	/// Set the delivery delay. With `poll` a point-to-point message
	/// becomes a polling subscription. Unless `nowait` is given the post
	/// time is scheduled immediately.
	pub fn set_delay(&mut self, delay: Duration, poll: bool, nowait: bool) {
		self.delay_ms = delay.as_millis() as i64;
		if poll && self.msg_type == MessageType::P2P {
			self.msg_type = MessageType::P2PSub;
		}
		if !nowait {
			self.schedule_post();
		}
	}

	pub fn schedule_post(&mut self) {
		self.post_time_ms = now_ms() + self.delay_ms;
	}

	pub fn set_error(&mut self, error: ErrorKind, code: i32, description: &str) {
		self.error = error;
		self.error_code = code;
		self.error_desc = description.to_owned();
	}

	pub fn is_error(&self) -> bool {
		self.error != ErrorKind::None
	}

	/// Associate a subscription control action; the message becomes a
	/// subscription control message.
	pub fn set_control(&mut self, action: ControlAction, target: Option<Uuid>) {
		self.control = action;
		self.msg_type = MessageType::P2PSub;
		self.target_msg_id = target;
	}

	pub fn set_reply_callback(&mut self, callback: MessageCallback) {
		self.reply = Some(callback);
	}

	pub fn has_reply_callback(&self) -> bool {
		self.reply.is_some()
	}

	/// Register a chunk consumer on a stream message.
	pub fn add_data_callback(&mut self, callback: DataCallback) {
		match &mut self.payload {
			Payload::Stream(callbacks) => callbacks.push(callback),
			_ => warn!(subject = %self.subject, "data callback on a non-stream message"),
		}
	}

	/// Name/value parameter accessors for `Nv` payloads.
	pub fn param(&self, name: &str) -> Option<&str> {
		match &self.payload {
			Payload::Nv(data) => data.get(name).map(String::as_str),
			_ => None,
		}
	}

	pub fn set_param(&mut self, name: &str, value: &str) {
		match &mut self.payload {
			Payload::Nv(data) => {
				data.insert(name.to_owned(), value.to_owned());
			},
			Payload::None => {
				self.payload = Payload::Nv(HashMap::from([(name.to_owned(), value.to_owned())]));
			},
			_ => warn!(subject = %self.subject, "parameter on a non-nv message"),
		}
	}

	pub fn append_text(&mut self, chunk: &str) {
		match &mut self.payload {
			Payload::Text(data) => data.push_str(chunk),
			Payload::None => self.payload = Payload::Text(chunk.to_owned()),
			_ => warn!(subject = %self.subject, "text append on a non-text message"),
		}
	}

	pub fn model(&self) -> Option<NodeRef> {
		match &self.payload {
			Payload::Data(node) => node.clone(),
			_ => None,
		}
	}
}

impl std::fmt::Debug for Message {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Message")
			.field("id", &self.id)
			.field("subject", &self.subject)
			.field("msg_type", &self.msg_type)
			.field("content_type", &self.content_type)
			.field("error", &self.error)
			.field("payload", &self.payload)
			.finish_non_exhaustive()
	}
}

/// Fan a chunk out to every data callback of a stream message. An empty
/// buffer marks end of stream. Returns false if any consumer asked to
/// stop. Buffers are borrowed for the call only; consumers copy what they
/// keep.
pub fn send_data(message: &MessageRef, buf: &[u8]) -> bool {
	let callbacks = {
		let guard = message.lock();
		match &guard.payload {
			Payload::Stream(callbacks) => callbacks.clone(),
			_ => {
				warn!(subject = %guard.subject, "send_data on a non-stream message");
				return false;
			},
		}
	};
	let mut keep_going = true;
	for callback in callbacks {
		keep_going &= callback(message, buf);
	}
	keep_going
}

/// Wrap a configured tree binder for attachment to request messages.
pub fn data_binder(binder: TreeBinder) -> DataBinderRef {
	Arc::new(Mutex::new(binder))
}

/// Deliver a response through a request's reply callback, if any.
pub fn send_reply(request: &MessageRef, response: &MessageRef) {
	let callback = request.lock().reply.clone();
	if let Some(callback) = callback {
		callback(response);
	}
}

pub(crate) fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}
