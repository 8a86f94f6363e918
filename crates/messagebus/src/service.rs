use std::sync::Arc;

use bus_binding::BindingSet;

use crate::message::{ContentType, Message, MessageRef, MessageType};

/// Metadata keys set on responses built by services.
pub const META_REQUEST_ID: &str = "REQUEST_ID";
pub const META_SUBSCRIPTION_ID: &str = "SUBSCRIPTION_ID";
pub const META_IS_MODEL_DATA: &str = "IS_MODEL_DATA";

/// Receives messages for the subjects it subscribed to.
pub trait Listener: Send + Sync {
	fn on_message(&self, message: &MessageRef);
}

pub type ListenerRef = Arc<dyn Listener>;

/// Supplies message instances for a subject it owns.
pub trait Provider: Send + Sync {
	fn create_message(&self) -> Message;
}

/// A service exclusively owns one subject, provides its message factory
/// and receives the point-to-point requests addressed to it. Lifecycle is
/// managed by the bus.
pub trait Service: Listener + Provider {
	fn subject(&self) -> &str;

	fn type_tags(&self) -> &[&str] {
		&[]
	}

	fn is_type(&self, tag: &str) -> bool {
		self.type_tags().contains(&tag)
	}

	/// Called when the service is added to the bus.
	fn initialize(&self) {}

	/// Called when the service is removed from the bus.
	fn destroy(&self) {}

	/// Host application moved to the background.
	fn pause(&self) {}

	/// Host application moved back to the foreground.
	fn resume(&self) {}

	/// Attach the declarative binding template configured for this
	/// service.
	fn set_binding_config(&self, _bindings: Arc<BindingSet>) {}
}

/// Fill in a response for a request: routing from the request (or an
/// explicit response subject), plus the request's data binder so the
/// response stream can be unmarshalled.
pub fn init_response(
	request: &MessageRef,
	response: &mut Message,
	msg_type: MessageType,
	content_type: ContentType,
	subject: Option<&str>,
) {
	let req = request.lock();
	response.subject = match subject {
		Some(s) => s.to_owned(),
		None => req.subject.clone(),
	};
	response.msg_type = msg_type;
	response.content_type = content_type;
	response.data_binder = req.data_binder.clone();
}

/// Listener that forwards a response to a request's reply callback. Lets
/// a point-to-point request "listen" for its own response when a service
/// posts it back through the bus.
pub struct ReplyForwarder {
	request: MessageRef,
}

impl ReplyForwarder {
	pub fn new(request: MessageRef) -> ListenerRef {
		Arc::new(Self { request })
	}
}

impl Listener for ReplyForwarder {
	fn on_message(&self, message: &MessageRef) {
		crate::message::send_reply(&self.request, message);
	}
}

/// Listener adapter over a plain closure.
pub struct FnListener<F>(F);

impl<F> FnListener<F>
where
	F: Fn(&MessageRef) + Send + Sync + 'static,
{
	pub fn new(f: F) -> ListenerRef {
		Arc::new(FnListener(f))
	}
}

impl<F> Listener for FnListener<F>
where
	F: Fn(&MessageRef) + Send + Sync,
{
	fn on_message(&self, message: &MessageRef) {
		(self.0)(message)
	}
}
