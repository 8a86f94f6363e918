pub use bus_binding as binding;

pub mod bus;
pub mod config;
pub mod error;
pub mod http;
pub mod message;
pub mod queue;
pub mod service;

pub use bus::{Bus, SubjectCallback};
pub use config::{ConfigLoader, ServiceFactory, ServiceSpec, TokenResolver};
pub use error::BusError;
pub use http::{HttpMethod, HttpService};
pub use message::{
	ContentType, ControlAction, DataBinderRef, DataCallback, ErrorKind, Message, MessageCallback,
	MessageRef, MessageType, Payload, data_binder, send_data, send_reply,
};
pub use queue::{ActivityCallback, DeliveryQueue, MAX_POLL_COUNT};
pub use service::{
	FnListener, Listener, ListenerRef, Provider, ReplyForwarder, Service, init_response,
};
