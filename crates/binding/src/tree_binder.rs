use std::collections::HashMap;

use tracing::{error, trace, warn};

use crate::error::BindError;
use crate::path::Path;
use crate::rules::{BinderState, RuleBinder};
use crate::tree::{Kind, Node, NodeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindKind {
	Map,
	List,
	Value,
}

impl BindKind {
	pub fn parse(name: &str) -> BindKind {
		match name {
			"map" => BindKind::Map,
			"list" => BindKind::List,
			_ => BindKind::Value,
		}
	}
}

/// Splits a captured value into several keyed fields: by delimiter, by
/// absolute offset and length, or by taking the remainder. The piece can be
/// rewritten (strip/replace) and translated through a value map.
#[derive(Debug, Clone, Default)]
pub struct ParseRule {
	pub key: String,
	pub offset: Option<usize>,
	pub delim: Option<char>,
	pub length: Option<usize>,
	pub strip: String,
	pub replace: String,
	pub mappings: HashMap<String, String>,
}

/// One binding rule: where in the XML it fires, what node kind it creates
/// and where the node attaches in the tree under construction.
#[derive(Debug, Clone)]
pub struct BindingDesc {
	pub path: String,
	pub key: String,
	pub ref_path: String,
	pub is_index: bool,
	pub kind: BindKind,
	pub parse_rules: Vec<ParseRule>,
}

/// An ordered collection of binding descriptors, built programmatically or
/// from the `bindings/bind[/parse[/mapping]]` configuration vocabulary.
/// Nested `bind` elements accumulate their paths.
#[derive(Debug, Clone, Default)]
pub struct BindingSet {
	bindings: Vec<BindingDesc>,
	path: Path,
	depth: Vec<usize>,
}

impl BindingSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn bindings(&self) -> &[BindingDesc] {
		&self.bindings
	}

	pub fn add(&mut self, desc: BindingDesc) {
		self.bindings.push(desc);
	}

	/// Open a `bind` config element; its path is relative to the enclosing
	/// `bind` elements.
	pub fn begin_bind(&mut self, attrs: &HashMap<String, String>) {
		let rel = Path::from(attrs.get("path").map(String::as_str).unwrap_or(""));
		self.depth.push(rel.length());
		self.path.append(&rel);

		let desc = BindingDesc {
			path: self.path.to_string(),
			key: attrs.get("key").cloned().unwrap_or_default(),
			ref_path: attrs.get("ref").cloned().unwrap_or_default(),
			is_index: attrs.get("index").map(String::as_str) == Some("true"),
			kind: BindKind::parse(attrs.get("type").map(String::as_str).unwrap_or("")),
			parse_rules: Vec::new(),
		};
		trace!(path = %desc.path, kind = ?desc.kind, "binding configured");
		self.bindings.push(desc);
	}

	pub fn end_bind(&mut self) {
		if let Some(depth) = self.depth.pop() {
			for _ in 0..depth {
				self.path.pop();
			}
		}
	}

	pub fn begin_parse_rule(&mut self, attrs: &HashMap<String, String>) {
		let Some(binding) = self.bindings.last_mut() else {
			return;
		};
		binding.parse_rules.push(ParseRule {
			key: attrs.get("key").cloned().unwrap_or_default(),
			offset: attrs.get("offset").and_then(|v| v.parse().ok()),
			delim: attrs.get("delim").and_then(|v| v.chars().next()),
			length: attrs.get("length").and_then(|v| v.parse().ok()),
			strip: attrs.get("strip").cloned().unwrap_or_default(),
			replace: attrs.get("replace").cloned().unwrap_or_default(),
			mappings: HashMap::new(),
		});
	}

	pub fn begin_value_mapping(&mut self, attrs: &HashMap<String, String>) {
		let Some(from) = attrs.get("from") else {
			return;
		};
		if let Some(rule) = self
			.bindings
			.last_mut()
			.and_then(|b| b.parse_rules.last_mut())
		{
			rule.mappings
				.insert(from.clone(), attrs.get("to").cloned().unwrap_or_default());
		}
	}
}

/// Mutable build state of a [`TreeBinder`]: the node stack, the index
/// stack used for keyed list attachment, and the deferred-list bookkeeping.
#[derive(Default)]
pub struct TreeState {
	bindings: HashMap<String, BindingDesc>,
	stack: Vec<NodeRef>,
	root: Option<NodeRef>,
	// Rule path of a list whose attachment is deferred until the next
	// begin/bind event (so an enclosing element can still deliver a body).
	pending_list: Option<String>,
	index: Vec<String>,
	last_bound: String,
}

impl BinderState for TreeState {
	fn reset(&mut self) {
		self.stack.clear();
		self.root = None;
		self.pending_list = None;
		self.index.clear();
		self.last_bound.clear();
	}
}

/// A rule binder whose rules assemble a dynamic tree as directed by a set
/// of [`BindingDesc`]s.
pub type TreeBinder = RuleBinder<TreeState>;

impl RuleBinder<TreeState> {
	pub fn with_bindings(set: &BindingSet) -> TreeBinder {
		let mut binder = RuleBinder::new(TreeState::default());
		for desc in set.bindings() {
			binder.install(desc.clone());
		}
		binder
	}

	pub fn add_binding(&mut self, path: &str, kind: BindKind, key: &str, ref_path: &str) {
		self.install(BindingDesc {
			path: path.to_owned(),
			key: key.to_owned(),
			ref_path: ref_path.to_owned(),
			is_index: false,
			kind,
			parse_rules: Vec::new(),
		});
	}

	pub fn add_value_binding(&mut self, path: &str, key: &str, is_index: bool) {
		self.install(BindingDesc {
			path: path.to_owned(),
			key: key.to_owned(),
			ref_path: String::new(),
			is_index,
			kind: BindKind::Value,
			parse_rules: Vec::new(),
		});
	}

	pub fn install(&mut self, desc: BindingDesc) {
		match desc.kind {
			BindKind::Map => {
				self.add_begin_rule(&desc.path, begin_map);
				self.add_end_rule(&desc.path, end_map);
			},
			BindKind::List => {
				self.add_begin_rule(&desc.path, begin_list);
				self.add_end_rule(&desc.path, end_list);
			},
			BindKind::Value => {
				self.add_end_rule(&desc.path, bind_value);
			},
		}
		// Keyed by the canonical rule path so lookups during dispatch line
		// up with RuleBinder::rule_path().
		let canonical = Path::from(&desc.path).to_string();
		self.state.bindings.insert(canonical, desc);
	}

	/// Start a fresh tree; the root map becomes the binder result.
	pub fn begin_binding(&mut self) {
		let root = Node::create(Kind::Map);
		self.state.stack.push(root.clone());
		self.state.root = Some(root);
		self.state.pending_list = None;
	}

	/// Finalize any deferred list and unwind the stack. The root stays
	/// available through [`RuleBinder::detach_root`].
	pub fn end_binding(&mut self) -> Result<(), BindError> {
		self.flush_pending_list()?;
		self.state.stack.clear();
		Ok(())
	}

	pub fn root(&self) -> Option<NodeRef> {
		self.state.root.clone()
	}

	pub fn detach_root(&mut self) -> Option<NodeRef> {
		self.state.root.take()
	}

	fn flush_pending_list(&mut self) -> Result<(), BindError> {
		if let Some(rule) = self.state.pending_list.take() {
			self.attach_to_parent(&rule)?;
		}
		Ok(())
	}

	/// Pop the finished node and attach it: to the top-of-stack parent, or
	/// along `ref_path` from the root (descending into a list element by
	/// the current index key).
	fn attach_to_parent(&mut self, rule: &str) -> Result<(), BindError> {
		let Some(desc) = self.state.bindings.get(rule).cloned() else {
			warn!(rule, "no binding descriptor for rule path");
			return Ok(());
		};
		let Some(curr) = self.state.stack.pop() else {
			trace!(rule, "empty node stack while attaching");
			return Ok(());
		};

		if desc.ref_path.is_empty() {
			let Some(top) = self.state.stack.last().cloned() else {
				trace!(rule, "no parent node on stack");
				return Ok(());
			};
			let kind = top.read().kind();
			match kind {
				Kind::Map => {
					if !desc.key.is_empty() {
						top.write().add(curr, Some(&desc.key))?;
					}
				},
				Kind::List => top.write().add(curr, None)?,
				_ => {},
			}
		} else if !desc.key.is_empty() {
			let mut node = self.state.root.clone();
			for part in desc.ref_path.split('/').filter(|p| !p.is_empty()) {
				node = match node {
					Some(n) => n.read().get(part),
					None => None,
				};
			}
			if let Some(index) = self.state.index.pop() {
				if !index.is_empty() {
					node = node.and_then(|n| n.read().get(&index));
				}
			}
			match node {
				Some(n) => n.write().add(curr, Some(&desc.key))?,
				None => warn!(rule, reference = %desc.ref_path, "reference target not found"),
			}
		} else {
			error!(rule, "unable to bind referenced node: no binding key provided");
		}
		Ok(())
	}
}

fn begin_map(
	binder: &mut TreeBinder,
	_name: &str,
	_attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	binder.flush_pending_list()?;
	binder.state.stack.push(Node::create(Kind::Map));
	Ok(())
}

fn end_map(binder: &mut TreeBinder, _name: &str, _body: &str) -> Result<(), BindError> {
	let rule = binder.rule_path().unwrap_or_default().to_owned();
	binder.flush_pending_list()?;
	binder.attach_to_parent(&rule)?;
	binder.state.last_bound = binder.current_path_string();
	Ok(())
}

fn begin_list(
	binder: &mut TreeBinder,
	_name: &str,
	_attrs: &HashMap<String, String>,
) -> Result<(), BindError> {
	if binder.state.pending_list.is_some() {
		if binder.state.last_bound == binder.current_path_string() {
			// A repeat of the element that just closed: reopen its list
			// instead of starting a new one.
			binder.state.pending_list = None;
			binder.state.index.push(String::new());
			return Ok(());
		}
		binder.flush_pending_list()?;
	}
	binder.state.stack.push(Node::create(Kind::List));
	binder.state.index.push(String::new());
	Ok(())
}

fn end_list(binder: &mut TreeBinder, _name: &str, body: &str) -> Result<(), BindError> {
	let rule = binder.rule_path().unwrap_or_default().to_owned();

	if !body.is_empty() {
		// A text-only element: the open list collects it as a value.
		if let Some(top) = binder.state.stack.last().cloned() {
			top.write().add_value(body)?;
		}
		binder.state.index.pop();
		binder.state.pending_list = Some(rule);
	} else {
		binder.flush_pending_list()?;
		let Some(curr) = binder.state.stack.pop() else {
			trace!(%rule, "empty node stack closing list element");
			return Ok(());
		};
		let Some(top) = binder.state.stack.last().cloned() else {
			trace!(%rule, "no parent node closing list element");
			return Ok(());
		};
		let kind = top.read().kind();
		if kind == Kind::List {
			let index = binder.state.index.last().cloned().unwrap_or_default();
			if index.is_empty() {
				top.write().add(curr, None)?;
			} else {
				top.write().add(curr, Some(&index))?;
			}
			binder.state.index.pop();
			binder.state.pending_list = Some(rule);
		} else {
			// The list closed directly under a map parent; attach now and
			// leave nothing deferred.
			let key = binder
				.state
				.bindings
				.get(&rule)
				.map(|d| d.key.clone())
				.unwrap_or_default();
			if !key.is_empty() {
				top.write().add(curr, Some(&key))?;
			}
			binder.state.index.pop();
			binder.state.pending_list = None;
		}
	}
	binder.state.last_bound = binder.current_path_string();
	Ok(())
}

fn bind_value(binder: &mut TreeBinder, _name: &str, body: &str) -> Result<(), BindError> {
	binder.flush_pending_list()?;

	let rule = binder.rule_path().unwrap_or_default().to_owned();
	let Some(desc) = binder.state.bindings.get(&rule).cloned() else {
		warn!(%rule, "no binding descriptor for value rule");
		return Ok(());
	};
	let Some(mut curr) = binder.state.stack.last().cloned() else {
		trace!(%rule, "empty node stack binding value");
		return Ok(());
	};

	let parse_value = !desc.parse_rules.is_empty();
	if !desc.key.is_empty() || parse_value {
		if curr.read().kind() == Kind::List {
			// Values inside a repeated list element collect in a fresh
			// record node.
			let record = Node::create(Kind::Map);
			binder.state.stack.push(record.clone());
			curr = record;
		}

		if parse_value {
			apply_parse_rules(&desc.parse_rules, body, &curr)?;
		} else {
			curr.write().set_value(&desc.key, body)?;
		}

		if desc.is_index {
			if let Some(top) = binder.state.index.last_mut() {
				*top = body.to_owned();
			}
		}
	}
	binder.state.last_bound = binder.current_path_string();
	Ok(())
}

fn apply_parse_rules(rules: &[ParseRule], value: &str, node: &NodeRef) -> Result<(), BindError> {
	let len = value.len();
	let mut offset = 0usize;

	for rule in rules {
		if offset >= len {
			break;
		}

		let (start, part_len, next) = if let Some(delim) = rule.delim {
			// A delimiter sitting exactly at the cursor separates the
			// previous field; step over it before scanning.
			let mut from = offset;
			if value[from..].starts_with(delim) {
				from += delim.len_utf8();
			}
			match value[from..].find(delim) {
				Some(i) => (from, i, from + i + delim.len_utf8()),
				None => (from, len - from, len),
			}
		} else if let Some(abs) = rule.offset {
			if abs >= len {
				break;
			}
			let l = rule.length.unwrap_or(len - abs).min(len - abs);
			(abs, l, abs + l)
		} else if let Some(l) = rule.length {
			(offset, l.min(len - offset), offset + l.min(len - offset))
		} else {
			(offset, len - offset, len)
		};

		let part = substring(value, start, part_len);
		let mut parsed = if rule.strip.is_empty() {
			part.to_owned()
		} else {
			part.replace(&rule.strip, &rule.replace)
		};
		if let Some(mapped) = rule.mappings.get(&parsed) {
			parsed = mapped.clone();
		}
		node.write().set_value(&rule.key, &parsed)?;
		offset = next;
	}
	Ok(())
}

fn substring(s: &str, start: usize, len: usize) -> &str {
	let start = floor_boundary(s, start.min(s.len()));
	let end = floor_boundary(s, (start + len).min(s.len()));
	&s[start..end]
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
	while i > 0 && !s.is_char_boundary(i) {
		i -= 1;
	}
	i
}
