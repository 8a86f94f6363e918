use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::error::BindError;
use crate::path::Path;
use crate::xml::ElementHandler;

/// Binder-specific state carried by a [`RuleBinder`]. Callbacks reach it
/// through `binder.state`.
pub trait BinderState: Send {
	fn reset(&mut self) {}
}

impl BinderState for () {}

/// Invoked when an element (or `@attribute` pseudo element) opens and its
/// path matches the rule path.
pub type BeginFn<S> =
	fn(&mut RuleBinder<S>, &str, &HashMap<String, String>) -> Result<(), BindError>;

/// Invoked when an element closes (or, for `@attribute` rules, with the
/// attribute value) and its path matches the rule path.
pub type EndFn<S> = fn(&mut RuleBinder<S>, &str, &str) -> Result<(), BindError>;

struct BeginRule<S> {
	path: Path,
	canonical: String,
	callback: BeginFn<S>,
}

struct EndRule<S> {
	path: Path,
	canonical: String,
	callback: EndFn<S>,
}

/// Streams tokenizer events against a set of path rules. Rules are indexed
/// by the leaf segment of their path; a rule fires when the full current
/// path matches (with wildcards). While the current path is tagged (see
/// [`RuleBinder::skip_parent`]) no rules are evaluated, but path depth is
/// still maintained.
///
/// A binder is single writer: `lock()` guards against two interleaved
/// parses and is released by `reset()`.
pub struct RuleBinder<S> {
	pub state: S,
	current: Path,
	rule_path: Option<String>,
	body: String,
	trim_body: bool,
	add_text: bool,
	body_is_cdata: bool,
	variables: HashMap<String, String>,
	begin_rules: HashMap<String, Vec<BeginRule<S>>>,
	end_rules: HashMap<String, Vec<EndRule<S>>>,
	binding: AtomicBool,
}

impl<S: BinderState> RuleBinder<S> {
	pub fn new(state: S) -> Self {
		Self {
			state,
			current: Path::new(),
			rule_path: None,
			body: String::new(),
			trim_body: true,
			add_text: true,
			body_is_cdata: false,
			variables: HashMap::new(),
			begin_rules: HashMap::new(),
			end_rules: HashMap::new(),
			binding: AtomicBool::new(false),
		}
	}

	pub fn add_begin_rule(&mut self, path: &str, callback: BeginFn<S>) {
		let parsed = Path::from(path);
		self.begin_rules
			.entry(parsed.leaf().to_owned())
			.or_default()
			.push(BeginRule { canonical: parsed.to_string(), path: parsed, callback });
	}

	pub fn add_end_rule(&mut self, path: &str, callback: EndFn<S>) {
		let parsed = Path::from(path);
		self.end_rules
			.entry(parsed.leaf().to_owned())
			.or_default()
			.push(EndRule { canonical: parsed.to_string(), path: parsed, callback });
	}

	/// Attempt to take exclusive use of this binder for one parse. Returns
	/// false when a prior parse is still bound.
	pub fn lock(&self) -> bool {
		self.binding
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
	}

	pub fn is_locked(&self) -> bool {
		self.binding.load(Ordering::SeqCst)
	}

	/// Discard all parse state and release the binding lock.
	pub fn reset(&mut self) {
		self.current.reset();
		self.rule_path = None;
		self.body.clear();
		self.trim_body = true;
		self.add_text = true;
		self.body_is_cdata = false;
		self.variables.clear();
		self.state.reset();
		self.binding.store(false, Ordering::SeqCst);
	}

	/// The path of the rule currently being dispatched, in canonical form.
	pub fn rule_path(&self) -> Option<&str> {
		self.rule_path.as_deref()
	}

	pub fn current_path(&self) -> &Path {
		&self.current
	}

	pub fn current_path_string(&self) -> String {
		self.current.to_string()
	}

	/// Suppress rule evaluation for the remainder of the `level`-th
	/// enclosing element's subtree.
	pub fn skip_parent(&mut self, level: u32) {
		self.current.tag(level);
	}

	pub fn set_trim_body(&mut self, trim: bool) {
		self.trim_body = trim;
	}

	pub fn body(&self) -> &str {
		&self.body
	}

	pub fn variable(&self, name: &str) -> Option<&str> {
		self.variables.get(name).map(String::as_str)
	}

	pub fn set_variable(&mut self, name: &str, value: &str) {
		self.variables.insert(name.to_owned(), value.to_owned());
	}

	fn dispatch_begin(
		&mut self,
		key: &str,
		display: &str,
		attrs: &HashMap<String, String>,
	) -> Result<(), BindError> {
		let matches: Vec<(String, BeginFn<S>)> = match self.begin_rules.get(key) {
			Some(rules) => rules
				.iter()
				.filter(|r| r.path == self.current)
				.map(|r| (r.canonical.clone(), r.callback))
				.collect(),
			None => return Ok(()),
		};
		for (canonical, callback) in matches {
			trace!(path = %self.current, rule = %canonical, "begin rule");
			self.rule_path = Some(canonical);
			let result = callback(self, display, attrs);
			self.rule_path = None;
			result?;
		}
		Ok(())
	}

	fn dispatch_end(&mut self, key: &str, display: &str, body: &str) -> Result<(), BindError> {
		let matches: Vec<(String, EndFn<S>)> = match self.end_rules.get(key) {
			Some(rules) => rules
				.iter()
				.filter(|r| r.path == self.current)
				.map(|r| (r.canonical.clone(), r.callback))
				.collect(),
			None => return Ok(()),
		};
		for (canonical, callback) in matches {
			trace!(path = %self.current, rule = %canonical, "end rule");
			self.rule_path = Some(canonical);
			let result = callback(self, display, body);
			self.rule_path = None;
			result?;
		}
		Ok(())
	}
}

impl<S: BinderState> ElementHandler for RuleBinder<S> {
	fn start_element(
		&mut self,
		name: &str,
		attrs: &HashMap<String, String>,
	) -> Result<(), BindError> {
		self.current.push(name);
		self.body.clear();
		if self.current.is_tagged() {
			return Ok(());
		}

		self.dispatch_begin(name, name, attrs)?;

		for (attr, value) in attrs {
			let pseudo = format!("@{attr}");
			self.current.push(&pseudo);
			self.dispatch_begin(&pseudo, attr, attrs)?;
			self.dispatch_end(&pseudo, attr, value)?;
			self.current.pop();
		}
		Ok(())
	}

	fn end_element(&mut self, name: &str) -> Result<(), BindError> {
		if !self.current.is_tagged() {
			let body = if self.trim_body && !self.body_is_cdata {
				self.body.trim_matches([' ', '\t', '\r', '\n']).to_owned()
			} else {
				std::mem::take(&mut self.body)
			};
			self.dispatch_end(name, name, &body)?;
		}

		self.add_text = true;
		self.body_is_cdata = false;
		self.body.clear();
		self.current.pop();
		Ok(())
	}

	fn characters(&mut self, text: &str) -> Result<(), BindError> {
		if self.add_text {
			self.body.push_str(text);
		}
		Ok(())
	}

	fn start_cdata(&mut self) -> Result<(), BindError> {
		self.body.clear();
		Ok(())
	}

	fn end_cdata(&mut self) -> Result<(), BindError> {
		self.add_text = false;
		self.body_is_cdata = true;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::xml::XmlDriver;

	#[derive(Default)]
	struct Log {
		entries: Vec<String>,
	}

	impl BinderState for Log {
		fn reset(&mut self) {
			self.entries.clear();
		}
	}

	fn begin_log(
		binder: &mut RuleBinder<Log>,
		name: &str,
		attrs: &HashMap<String, String>,
	) -> Result<(), BindError> {
		let mut kv: Vec<String> = attrs.iter().map(|(k, v)| format!("{k}={v}")).collect();
		kv.sort();
		binder.state.entries.push(format!("begin {name} [{}]", kv.join(",")));
		Ok(())
	}

	fn end_log(binder: &mut RuleBinder<Log>, name: &str, body: &str) -> Result<(), BindError> {
		binder.state.entries.push(format!("end {name} '{body}'"));
		Ok(())
	}

	fn begin_skip(
		binder: &mut RuleBinder<Log>,
		name: &str,
		_attrs: &HashMap<String, String>,
	) -> Result<(), BindError> {
		binder.state.entries.push(format!("skip {name}"));
		binder.skip_parent(1);
		Ok(())
	}

	fn parse(binder: &mut RuleBinder<Log>, doc: &str) {
		let mut driver = XmlDriver::new();
		driver.parse(doc.as_bytes(), true, binder).unwrap();
	}

	#[test]
	fn rules_fire_on_matching_paths_only() {
		let mut binder = RuleBinder::new(Log::default());
		binder.add_begin_rule("root/nested1/nested2", begin_log);
		binder.add_end_rule("*/blob1", end_log);

		parse(
			&mut binder,
			r#"<root><nested1><nested2 id="1"/><blob1>x</blob1></nested1></root>"#,
		);
		assert_eq!(binder.state.entries, vec!["begin nested2 [id=1]", "end blob1 'x'"]);
	}

	#[test]
	fn attribute_rules_fire_as_pseudo_segments() {
		let mut binder = RuleBinder::new(Log::default());
		binder.add_end_rule("*/item/@id", end_log);

		parse(&mut binder, r#"<list><item id="7">v</item><item>w</item></list>"#);
		assert_eq!(binder.state.entries, vec!["end id '7'"]);
	}

	#[test]
	fn body_is_trimmed_unless_cdata() {
		let mut binder = RuleBinder::new(Log::default());
		binder.add_end_rule("*/a", end_log);
		binder.add_end_rule("*/b", end_log);

		parse(&mut binder, "<r><a>  padded \n</a><b><![CDATA[  raw  ]]></b></r>");
		assert_eq!(binder.state.entries, vec!["end a 'padded'", "end b '  raw  '"]);
	}

	#[test]
	fn text_after_cdata_is_ignored() {
		let mut binder = RuleBinder::new(Log::default());
		binder.add_end_rule("*/a", end_log);

		parse(&mut binder, "<r><a><![CDATA[kept]]>dropped</a></r>");
		assert_eq!(binder.state.entries, vec!["end a 'kept'"]);
	}

	#[test]
	fn tagging_suppresses_a_subtree() {
		let mut binder = RuleBinder::new(Log::default());
		binder.add_begin_rule("*/skipme", begin_skip);
		binder.add_begin_rule("*/inner", begin_log);
		binder.add_end_rule("*/skipme", end_log);
		binder.add_end_rule("*/after", end_log);

		parse(
			&mut binder,
			"<r><skipme><inner>x</inner></skipme><after>y</after></r>",
		);
		// Nothing inside (or the close of) the tagged element fires; the
		// sibling afterwards does.
		assert_eq!(binder.state.entries, vec!["skip skipme", "end after 'y'"]);
	}

	#[test]
	fn lock_is_exclusive_until_reset() {
		let mut binder = RuleBinder::new(Log::default());
		assert!(binder.lock());
		assert!(!binder.lock());
		binder.reset();
		assert!(binder.lock());
	}

	#[test]
	fn variables_round_trip() {
		let mut binder = RuleBinder::new(Log::default());
		binder.set_variable("k", "v");
		assert_eq!(binder.variable("k"), Some("v"));
		binder.reset();
		assert_eq!(binder.variable("k"), None);
	}
}
