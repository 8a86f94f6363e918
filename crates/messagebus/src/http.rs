use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use bus_binding::BindingSet;
use itertools::Itertools;
use parking_lot::RwLock;
use reqwest::blocking::Client;
use tracing::{debug, error, warn};

use crate::bus::Bus;
use crate::config::{ServiceFactory, ServiceSpec};
use crate::error::BusError;
use crate::message::{
	ContentType, ControlAction, ErrorKind, Message, MessageRef, MessageType, send_data,
};
use crate::service::{
	META_IS_MODEL_DATA, META_REQUEST_ID, META_SUBSCRIPTION_ID, Listener, Provider, Service,
	init_response,
};

const TOKEN_BEGIN: &str = "{{";
const TOKEN_END: &str = "}}";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
	#[default]
	Get,
	Post,
}

impl HttpMethod {
	fn parse(value: &str) -> HttpMethod {
		if value.eq_ignore_ascii_case("post") { HttpMethod::Post } else { HttpMethod::Get }
	}
}

#[derive(Debug, Clone)]
enum TemplateSegment {
	Literal(String),
	Var(String),
}

/// An HTTP endpoint registered as a bus service. Requests render the
/// configured body template with the message's parameters, the exchange
/// runs on an offload thread, and response bytes stream back through the
/// response message's data callbacks (driving the unmarshalling pipeline
/// when the request carried a binder).
pub struct HttpService {
	subject: String,
	url: String,
	timeout: Duration,
	method: HttpMethod,
	content_type: ContentType,
	headers: Vec<(String, String)>,
	template: String,
	segments: RwLock<Vec<TemplateSegment>>,
	tokens: HashMap<String, String>,
	bindings: RwLock<Option<Arc<BindingSet>>>,
	subscription_enabled: bool,
	client: Client,
	bus: Weak<Bus>,
}

/// The factory registered for `type="http"` service config elements.
pub fn factory() -> ServiceFactory {
	Arc::new(|spec: &ServiceSpec, bus: &Arc<Bus>| {
		let service = HttpService::from_spec(spec, bus)?;
		bus.register_service(Arc::new(service))
	})
}

impl HttpService {
	pub fn from_spec(spec: &ServiceSpec, bus: &Arc<Bus>) -> Result<HttpService, BusError> {
		let timeout = spec
			.http
			.get("timeout")
			.and_then(|v| v.parse().ok())
			.map(Duration::from_secs)
			.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
		let content_type = match spec.http.get("contentType").map(String::as_str) {
			Some("xml") => ContentType::Xml,
			Some("json") => ContentType::Json,
			_ => ContentType::Unknown,
		};
		let client = Client::builder().timeout(timeout).build().map_err(|e| {
			BusError::Service {
				code: ErrorKind::ConnectionError.code(),
				description: format!("cannot build http client: {e}"),
			}
		})?;

		Ok(HttpService {
			subject: spec.name.clone(),
			url: spec.url.clone(),
			timeout,
			method: HttpMethod::parse(
				spec.http.get("httpMethod").map(String::as_str).unwrap_or(""),
			),
			content_type,
			headers: spec.headers.clone(),
			template: spec.template.clone(),
			segments: RwLock::new(Vec::new()),
			tokens: spec.tokens.clone(),
			bindings: RwLock::new(spec.bindings.clone()),
			subscription_enabled: spec.http.get("subscribe").map(String::as_str) == Some("true"),
			client,
			bus: Arc::downgrade(bus),
		})
	}

	pub fn method(&self) -> HttpMethod {
		self.method
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	pub fn content_type(&self) -> ContentType {
		self.content_type
	}

	/// Render the request body: `{{var}}` resolves to a message
	/// parameter, then a configuration token, and stays literal when
	/// neither knows it.
	fn render_body(&self, request: &MessageRef) -> String {
		let request = request.lock();
		let segments = self.segments.read();
		let mut out = String::new();
		for segment in segments.iter() {
			match segment {
				TemplateSegment::Literal(text) => out.push_str(text),
				TemplateSegment::Var(name) => {
					if let Some(value) = request.param(name) {
						out.push_str(value);
					} else if let Some(value) = self.tokens.get(name) {
						out.push_str(value);
					} else {
						out.push_str(TOKEN_BEGIN);
						out.push_str(name);
						out.push_str(TOKEN_END);
					}
				},
			}
		}
		out
	}

	/// Run the exchange on an offload thread, streaming the body through
	/// the response message and closing with the end-of-stream chunk.
	fn execute(&self, response: MessageRef, body: String) {
		let client = self.client.clone();
		let url = self.url.clone();
		let method = self.method;
		let headers = self.headers.clone();
		let subject = self.subject.clone();

		let spawned = thread::Builder::new()
			.name(format!("http-{subject}"))
			.spawn(move || {
				let outcome = exchange(&client, method, &url, &headers, &body, &response);
				if let Err((kind, description)) = outcome {
					warn!(%subject, %description, "http exchange failed");
					response.lock().set_error(kind, kind.code(), &description);
				}
				send_data(&response, &[]);
			});
		if let Err(e) = spawned {
			error!(subject = %self.subject, error = %e, "cannot spawn http worker");
		}
	}
}

fn exchange(
	client: &Client,
	method: HttpMethod,
	url: &str,
	headers: &[(String, String)],
	body: &str,
	response: &MessageRef,
) -> Result<(), (ErrorKind, String)> {
	let transport_err = |e: &reqwest::Error| {
		if e.is_timeout() { ErrorKind::ConnectionTimeout } else { ErrorKind::ConnectionError }
	};

	let mut builder = match method {
		HttpMethod::Get => {
			// A rendered body on a GET request travels as the query
			// string.
			if body.is_empty() {
				client.get(url)
			} else if url.contains('?') {
				client.get(format!("{url}&{body}"))
			} else {
				client.get(format!("{url}?{body}"))
			}
		},
		HttpMethod::Post => client.post(url).body(body.to_owned()),
	};
	for (name, value) in headers {
		builder = builder.header(name.as_str(), value.as_str());
	}

	let mut http_response = builder
		.send()
		.map_err(|e| (transport_err(&e), e.to_string()))?;

	{
		let mut r = response.lock();
		for (name, value) in http_response.headers() {
			if let Ok(value) = value.to_str() {
				r.meta.insert(name.to_string(), value.to_owned());
			}
		}
		let status = http_response.status();
		if !status.is_success() {
			r.set_error(
				ErrorKind::Service,
				i32::from(status.as_u16()),
				&format!("http status {status}"),
			);
		}
	}

	let mut buf = [0u8; 8192];
	loop {
		let n = http_response
			.read(&mut buf)
			.map_err(|e| (ErrorKind::ConnectionBreak, e.to_string()))?;
		if n == 0 {
			break;
		}
		if !send_data(response, &buf[..n]) {
			break;
		}
	}
	Ok(())
}

fn tokenize(template: &str) -> Vec<TemplateSegment> {
	let mut segments = Vec::new();
	let mut i = 0;
	let len = template.len();
	while i < len {
		let Some(j) = template[i..].find(TOKEN_BEGIN).map(|o| i + o) else {
			segments.push(TemplateSegment::Literal(template[i..].to_owned()));
			break;
		};
		let Some(k) = template[j + 2..].find(TOKEN_END).map(|o| j + 2 + o) else {
			segments.push(TemplateSegment::Literal(template[i..].to_owned()));
			break;
		};
		segments.push(TemplateSegment::Literal(template[i..j].to_owned()));
		segments.push(TemplateSegment::Var(template[j + 2..k].to_owned()));
		i = k + 2;
	}
	segments
}

impl Provider for HttpService {
	fn create_message(&self) -> Message {
		Message::nv(&self.subject, MessageType::P2P)
	}
}

impl Listener for HttpService {
	fn on_message(&self, request: &MessageRef) {
		let (control, is_subscription, first_post, resp_subject, has_binder, request_id) = {
			let req = request.lock();
			(
				req.control,
				req.msg_type == MessageType::P2PSub,
				req.post_count() == 0,
				req.resp_subject.clone(),
				req.data_binder.is_some(),
				req.id(),
			)
		};

		if !self.subscription_enabled && !first_post {
			return;
		}
		// Control actions are subscription bookkeeping, not requests.
		if control != ControlAction::None {
			return;
		}
		let Some(bus) = self.bus.upgrade() else {
			warn!(subject = %self.subject, "bus is gone; dropping request");
			return;
		};

		let mut response = Message::stream(&self.subject, MessageType::RespStream);
		init_response(
			request,
			&mut response,
			MessageType::RespStream,
			self.content_type,
			resp_subject.as_deref(),
		);
		let has_bindings = self.bindings.read().is_some();
		response.meta.insert(
			META_IS_MODEL_DATA.to_owned(),
			(has_bindings && has_binder).to_string(),
		);
		response
			.meta
			.insert(META_REQUEST_ID.to_owned(), request_id.to_string());
		if is_subscription && first_post {
			// The receiver needs the subscription id to control it later.
			response
				.meta
				.insert(META_SUBSCRIPTION_ID.to_owned(), request_id.to_string());
		}
		let response = response.into_ref();

		match bus.post_response(&response, request) {
			Ok(receivers) if receivers > 0 => {
				let body = self.render_body(request);
				self.execute(response, body);
			},
			Ok(_) => {
				send_data(&response, &[]);
			},
			Err(err) => {
				warn!(subject = %self.subject, error = %err, "response post failed");
				response.lock().set_error(
					ErrorKind::MessageBus,
					ErrorKind::MessageBus.code(),
					&err.to_string(),
				);
				send_data(&response, &[]);
			},
		}
	}
}

impl Service for HttpService {
	fn subject(&self) -> &str {
		&self.subject
	}

	fn type_tags(&self) -> &[&str] {
		&["http"]
	}

	fn initialize(&self) {
		let segments = tokenize(&self.template);
		debug!(
			subject = %self.subject,
			vars = %segments
				.iter()
				.filter_map(|s| match s {
					TemplateSegment::Var(name) => Some(name.as_str()),
					TemplateSegment::Literal(_) => None,
				})
				.join(","),
			"http service initialized"
		);
		*self.segments.write() = segments;
	}

	fn set_binding_config(&self, bindings: Arc<BindingSet>) {
		*self.bindings.write() = Some(bindings);
	}
}
