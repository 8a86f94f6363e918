use std::collections::HashMap;
use std::path::Path as FsPath;
use std::sync::Arc;

use bus_binding::{BeginFn, BindError, BinderState, BindingSet, EndFn, RuleBinder, Unmarshaller};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::error::BusError;

static TOKEN_PATTERN: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"\$\{[-+_a-zA-Z0-9]+\}").expect("token pattern"));

/// Fallback lookup for `${token}` references not present in the token map.
pub type TokenResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builds and registers a service from its parsed configuration. Keyed by
/// the `type` attribute of the `service` element.
pub type ServiceFactory = Arc<dyn Fn(&ServiceSpec, &Arc<Bus>) -> Result<(), BusError> + Send + Sync>;

/// Everything a `service` config element declares, accumulated while the
/// element is being parsed and handed to the matching factory when it
/// closes.
#[derive(Debug, Clone, Default)]
pub struct ServiceSpec {
	pub name: String,
	pub url: String,
	pub kind: String,
	/// Raw `httpConfig` attributes (timeout, httpMethod, contentType, ..).
	pub http: HashMap<String, String>,
	pub headers: Vec<(String, String)>,
	pub template: String,
	pub bindings: Option<Arc<BindingSet>>,
	/// Snapshot of the loader's token map, for `{{var}}` fallback
	/// resolution at request time.
	pub tokens: HashMap<String, String>,
}

/// Binder state for the configuration vocabulary.
pub struct ConfigState {
	bus: Arc<Bus>,
	factories: HashMap<String, ServiceFactory>,
	tokens: HashMap<String, String>,
	pub spec: Option<ServiceSpec>,
	bindings: Option<BindingSet>,
	registered: Vec<String>,
}

impl BinderState for ConfigState {
	fn reset(&mut self) {
		self.spec = None;
		self.bindings = None;
	}
}

/// Loads service-configuration XML: expands `${token}` references, parses
/// the fixed `messagebus-config` vocabulary through a rule binder, and
/// registers each declared service through its type's factory.
pub struct ConfigLoader {
	bus: Arc<Bus>,
	tokens: HashMap<String, String>,
	resolver: Option<TokenResolver>,
	factories: HashMap<String, ServiceFactory>,
	extra_begin: Vec<(String, BeginFn<ConfigState>)>,
	extra_end: Vec<(String, EndFn<ConfigState>)>,
}

impl ConfigLoader {
	pub fn new(bus: Arc<Bus>) -> Self {
		let mut loader = Self {
			bus,
			tokens: HashMap::new(),
			resolver: None,
			factories: HashMap::new(),
			extra_begin: Vec::new(),
			extra_end: Vec::new(),
		};
		loader.register_factory("http", crate::http::factory());
		loader
	}

	pub fn set_token(&mut self, name: &str, value: &str) {
		self.tokens.insert(name.to_owned(), value.to_owned());
	}

	pub fn set_tokens(&mut self, tokens: HashMap<String, String>) {
		self.tokens.extend(tokens);
	}

	pub fn set_token_resolver(&mut self, resolver: TokenResolver) {
		self.resolver = Some(resolver);
	}

	pub fn register_factory(&mut self, kind: &str, factory: ServiceFactory) {
		self.factories.insert(kind.to_owned(), factory);
	}

	/// Extend the config vocabulary with service-specific rules.
	pub fn add_begin_binding(&mut self, path: &str, callback: BeginFn<ConfigState>) {
		self.extra_begin.push((path.to_owned(), callback));
	}

	pub fn add_end_binding(&mut self, path: &str, callback: EndFn<ConfigState>) {
		self.extra_end.push((path.to_owned(), callback));
	}

	/// Resolve a `${token}` name: the token map first, then the resolver.
	pub fn token(&self, name: &str) -> Option<String> {
		if let Some(value) = self.tokens.get(name) {
			return Some(value.clone());
		}
		self.resolver.as_ref().and_then(|resolve| resolve(name))
	}

	/// Replace `${NAME}` references; unresolved tokens stay literal.
	pub fn expand_tokens(&self, input: &str) -> String {
		TOKEN_PATTERN
			.replace_all(input, |caps: &Captures<'_>| {
				let reference = &caps[0];
				let name = &reference[2..reference.len() - 1];
				self.token(name).unwrap_or_else(|| reference.to_owned())
			})
			.into_owned()
	}

	pub fn load_file(&self, path: impl AsRef<FsPath>) -> Result<Vec<String>, BusError> {
		let path = path.as_ref();
		info!(path = %path.display(), "loading service configuration");
		let content = std::fs::read_to_string(path).map_err(|e| BusError::Service {
			code: 1,
			description: format!("cannot read configuration {}: {e}", path.display()),
		})?;
		self.load_str(&content)
	}

	/// Parse a configuration document and register its services. Returns
	/// the names of the services registered.
	pub fn load_str(&self, xml: &str) -> Result<Vec<String>, BusError> {
		let expanded = self.expand_tokens(xml);

		let state = ConfigState {
			bus: self.bus.clone(),
			factories: self.factories.clone(),
			tokens: self.tokens.clone(),
			spec: None,
			bindings: None,
			registered: Vec::new(),
		};
		let mut binder = RuleBinder::new(state);
		install_rules(&mut binder);
		for (path, callback) in &self.extra_begin {
			binder.add_begin_rule(path, *callback);
		}
		for (path, callback) in &self.extra_end {
			binder.add_end_rule(path, *callback);
		}

		let mut unmarshaller = Unmarshaller::new(binder);
		unmarshaller.parse(expanded.as_bytes(), true)?;

		let binder = unmarshaller.into_handler();
		debug!(services = binder.state.registered.len(), "configuration loaded");
		Ok(binder.state.registered)
	}
}

fn install_rules(binder: &mut RuleBinder<ConfigState>) {
	binder.add_begin_rule("messagebus-config/service", begin_service);
	binder.add_begin_rule("*/httpConfig", begin_http_config);
	binder.add_begin_rule("*/headers/header", begin_header);
	binder.add_end_rule("*/requestTemplate", end_request_template);
	binder.add_begin_rule("*/bindings", begin_bindings);
	binder.add_begin_rule("*/bind", begin_bind);
	binder.add_begin_rule("*/bind/parse", begin_parse_rule);
	binder.add_begin_rule("*/bind/parse/mapping", begin_value_mapping);
	binder.add_end_rule("*/bind", end_bind);
	binder.add_end_rule("*/bindings", end_bindings);
	binder.add_end_rule("messagebus-config/service", end_service);
}

fn begin_service(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	let spec = ServiceSpec {
		name: attrs.get("name").cloned().unwrap_or_default(),
		url: attrs.get("url").cloned().unwrap_or_default(),
		kind: attrs.get("type").cloned().unwrap_or_default(),
		..Default::default()
	};
	debug!(service = %spec.name, kind = %spec.kind, "service configuration started");
	binder.state.spec = Some(spec);
	Ok(())
}

fn begin_http_config(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	if let Some(spec) = binder.state.spec.as_mut() {
		spec.http = attrs.clone();
	}
	Ok(())
}

fn begin_header(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	if let Some(spec) = binder.state.spec.as_mut() {
		spec.headers.push((
			attrs.get("name").cloned().unwrap_or_default(),
			attrs.get("value").cloned().unwrap_or_default(),
		));
	}
	Ok(())
}

fn end_request_template(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	body: &str,
) -> Result<(), BindError> {
	if let Some(spec) = binder.state.spec.as_mut() {
		spec.template = body.to_owned();
	}
	Ok(())
}

fn begin_bindings(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	_attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	binder.state.bindings = Some(BindingSet::new());
	Ok(())
}

fn begin_bind(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	if let Some(bindings) = binder.state.bindings.as_mut() {
		bindings.begin_bind(attrs);
	}
	Ok(())
}

fn begin_parse_rule(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	if let Some(bindings) = binder.state.bindings.as_mut() {
		bindings.begin_parse_rule(attrs);
	}
	Ok(())
}

fn begin_value_mapping(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	if let Some(bindings) = binder.state.bindings.as_mut() {
		bindings.begin_value_mapping(attrs);
	}
	Ok(())
}

fn end_bind(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	_body: &str,
) -> Result<(), BindError> {
	if let Some(bindings) = binder.state.bindings.as_mut() {
		bindings.end_bind();
	}
	Ok(())
}

fn end_bindings(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	_body: &str,
) -> Result<(), BindError> {
	let bindings = binder.state.bindings.take();
	if let Some(spec) = binder.state.spec.as_mut() {
		spec.bindings = bindings.map(Arc::new);
	}
	Ok(())
}

fn end_service(
	binder: &mut RuleBinder<ConfigState>,
	_name: &str,
	_body: &str,
) -> Result<(), BindError> {
	let Some(mut spec) = binder.state.spec.take() else {
		return Ok(());
	};
	spec.tokens = binder.state.tokens.clone();

	let Some(factory) = binder.state.factories.get(&spec.kind).cloned() else {
		warn!(service = %spec.name, kind = %spec.kind, "no factory for service type");
		return Ok(());
	};
	let bus = binder.state.bus.clone();
	match factory(&spec, &bus) {
		Ok(()) => {
			info!(service = %spec.name, "service registered from configuration");
			binder.state.registered.push(spec.name);
			Ok(())
		},
		Err(err) => Err(BindError::Rule(err.to_string())),
	}
}
