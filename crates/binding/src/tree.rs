use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::BindError;

/// Shared handle to a tree node. The finished tree is owned by a response
/// message and read concurrently by however many listeners keep it alive.
pub type NodeRef = Arc<RwLock<Node>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	Null,
	Map,
	List,
	Value,
}

#[derive(Debug, Default)]
pub struct MapNode {
	entries: IndexMap<String, NodeRef>,
}

#[derive(Debug, Default)]
pub struct ListNode {
	items: Vec<NodeRef>,
	// Elements carrying a business key, addressable through get(). Keys are
	// recorded by the binder's index mechanism.
	keyed: HashMap<String, usize>,
}

/// A heterogeneous dynamic tree: ordered maps, lists and string values.
/// Maps preserve insertion order; re-adding an existing key replaces the
/// node in place so key order stays stable.
#[derive(Debug)]
pub enum Node {
	Null,
	Value(String),
	Map(MapNode),
	List(ListNode),
}

impl Node {
	pub fn create(kind: Kind) -> NodeRef {
		Arc::new(RwLock::new(match kind {
			Kind::Null => Node::Null,
			Kind::Map => Node::Map(MapNode::default()),
			Kind::List => Node::List(ListNode::default()),
			Kind::Value => Node::Value(String::new()),
		}))
	}

	pub fn value(value: impl Into<String>) -> NodeRef {
		Arc::new(RwLock::new(Node::Value(value.into())))
	}

	pub fn kind(&self) -> Kind {
		match self {
			Node::Null => Kind::Null,
			Node::Value(_) => Kind::Value,
			Node::Map(_) => Kind::Map,
			Node::List(_) => Kind::List,
		}
	}

	pub fn is_valid(&self) -> bool {
		self.kind() != Kind::Null
	}

	pub fn len(&self) -> usize {
		match self {
			Node::Map(m) => m.entries.len(),
			Node::List(l) => l.items.len(),
			_ => 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn contains_key(&self, key: &str) -> bool {
		match self {
			Node::Map(m) => m.entries.contains_key(key),
			Node::List(l) => l.keyed.contains_key(key),
			_ => false,
		}
	}

	/// Map keys in insertion order; for a list, the recorded element keys.
	pub fn keys(&self) -> Vec<String> {
		match self {
			Node::Map(m) => m.entries.keys().cloned().collect(),
			Node::List(l) => l.keyed.keys().cloned().collect(),
			_ => Vec::new(),
		}
	}

	pub fn get(&self, key: &str) -> Option<NodeRef> {
		match self {
			Node::Map(m) => m.entries.get(key).cloned(),
			Node::List(l) => l.keyed.get(key).and_then(|i| l.items.get(*i)).cloned(),
			_ => None,
		}
	}

	pub fn get_index(&self, index: usize) -> Option<NodeRef> {
		match self {
			Node::List(l) => l.items.get(index).cloned(),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Node::Value(v) => Some(v),
			_ => None,
		}
	}

	/// Attach an existing node. A map requires a key; a list takes an
	/// optional element key that later supports keyed lookup.
	pub fn add(&mut self, node: NodeRef, key: Option<&str>) -> Result<(), BindError> {
		match self {
			Node::Map(m) => {
				let key =
					key.ok_or_else(|| BindError::schema("cannot add a keyless node to a map"))?;
				m.entries.insert(key.to_owned(), node);
				Ok(())
			},
			Node::List(l) => {
				if let Some(key) = key {
					if let Some(&i) = l.keyed.get(key) {
						l.items[i] = node;
					} else {
						l.items.push(node);
						l.keyed.insert(key.to_owned(), l.items.len() - 1);
					}
				} else {
					l.items.push(node);
				}
				Ok(())
			},
			_ => Err(BindError::schema("cannot add a child to a value node")),
		}
	}

	/// Create (or reuse) a keyed child of a map. An existing value node
	/// under the key is replaced; any other existing node is returned.
	pub fn add_child(&mut self, key: &str, kind: Kind) -> Result<NodeRef, BindError> {
		let Node::Map(m) = self else {
			return Err(BindError::schema("cannot add a keyed child to a non-map node"));
		};
		if let Some(existing) = m.entries.get(key) {
			if existing.read().kind() != Kind::Value {
				return Ok(existing.clone());
			}
		}
		let node = Node::create(kind);
		m.entries.insert(key.to_owned(), node.clone());
		Ok(node)
	}

	/// Append a fresh child to a list.
	pub fn add_element(&mut self, kind: Kind) -> Result<NodeRef, BindError> {
		let Node::List(l) = self else {
			return Err(BindError::schema("cannot append an element to a non-list node"));
		};
		let node = Node::create(kind);
		l.items.push(node.clone());
		Ok(node)
	}

	pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), BindError> {
		let Node::Map(m) = self else {
			return Err(BindError::schema("cannot set a key value pair on a non-map node"));
		};
		m.entries.insert(key.to_owned(), Node::value(value));
		Ok(())
	}

	pub fn add_value(&mut self, value: &str) -> Result<(), BindError> {
		let Node::List(l) = self else {
			return Err(BindError::schema("cannot append a value to a non-list node"));
		};
		l.items.push(Node::value(value));
		Ok(())
	}

	/// Minified JSON. Only `"` and `\` are escaped.
	pub fn to_json(&self) -> String {
		let mut out = String::new();
		self.write_json(&mut out, None);
		out
	}

	/// Indented JSON, one key or element per line, four spaces per level.
	pub fn to_json_pretty(&self) -> String {
		let mut out = String::new();
		self.write_json(&mut out, Some(0));
		out
	}

	fn write_json(&self, out: &mut String, level: Option<usize>) {
		match self {
			Node::Null => out.push_str("null"),
			Node::Value(v) => write_escaped(out, v),
			Node::Map(m) => {
				if m.entries.is_empty() {
					out.push_str("{}");
					return;
				}
				out.push('{');
				let inner = level.map(|lvl| lvl + 1);
				for (i, (k, node)) in m.entries.iter().enumerate() {
					if i > 0 {
						out.push(',');
					}
					indent(out, inner);
					write_escaped(out, k);
					out.push(':');
					if level.is_some() {
						out.push(' ');
					}
					node.read().write_json(out, inner);
				}
				indent(out, level);
				out.push('}');
			},
			Node::List(l) => {
				if l.items.is_empty() {
					out.push_str("[]");
					return;
				}
				out.push('[');
				let inner = level.map(|lvl| lvl + 1);
				for (i, node) in l.items.iter().enumerate() {
					if i > 0 {
						out.push(',');
					}
					indent(out, inner);
					node.read().write_json(out, inner);
				}
				indent(out, level);
				out.push(']');
			},
		}
	}
}

fn indent(out: &mut String, level: Option<usize>) {
	if let Some(level) = level {
		out.push('\n');
		for _ in 0..level * 4 {
			out.push(' ');
		}
	}
}

fn write_escaped(out: &mut String, value: &str) {
	out.push('"');
	for ch in value.chars() {
		match ch {
			'"' => out.push_str("\\\""),
			'\\' => out.push_str("\\\\"),
			_ => out.push(ch),
		}
	}
	out.push('"');
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> NodeRef {
		let root = Node::create(Kind::Map);
		{
			let mut r = root.write();
			r.set_value("a", "1").unwrap();
			let list = r.add_child("b", Kind::List).unwrap();
			let mut l = list.write();
			l.add_value("x").unwrap();
			l.add_value("y").unwrap();
		}
		root
	}

	#[test]
	fn minified_json_is_exact() {
		assert_eq!(sample().read().to_json(), r#"{"a":"1","b":["x","y"]}"#);
	}

	#[test]
	fn minified_json_parses_as_json() {
		let text = sample().read().to_json();
		let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
		assert_eq!(parsed["a"], "1");
		assert_eq!(parsed["b"][1], "y");
	}

	#[test]
	fn pretty_json_indents_four_spaces() {
		let expected = "{\n    \"a\": \"1\",\n    \"b\": [\n        \"x\",\n        \"y\"\n    ]\n}";
		assert_eq!(sample().read().to_json_pretty(), expected);
	}

	#[test]
	fn replacing_a_key_keeps_its_position() {
		let root = Node::create(Kind::Map);
		let mut r = root.write();
		r.set_value("first", "1").unwrap();
		r.set_value("second", "2").unwrap();
		r.set_value("first", "one").unwrap();
		assert_eq!(r.keys(), vec!["first", "second"]);
		assert_eq!(r.to_json(), r#"{"first":"one","second":"2"}"#);
	}

	#[test]
	fn value_escaping() {
		let node = Node::value(r#"say "hi" \ bye"#);
		assert_eq!(node.read().to_json(), r#""say \"hi\" \\ bye""#);
	}

	#[test]
	fn schema_violations() {
		let list = Node::create(Kind::List);
		assert!(matches!(
			list.write().set_value("k", "v"),
			Err(BindError::Schema(_))
		));
		let map = Node::create(Kind::Map);
		assert!(matches!(map.write().add_value("v"), Err(BindError::Schema(_))));
		assert!(matches!(
			map.write().add(Node::create(Kind::Map), None),
			Err(BindError::Schema(_))
		));
	}

	#[test]
	fn keyed_list_elements_are_addressable() {
		let list = Node::create(Kind::List);
		{
			let mut l = list.write();
			let a = Node::create(Kind::Map);
			a.write().set_value("id", "A").unwrap();
			l.add(a, Some("A")).unwrap();
			let b = Node::create(Kind::Map);
			b.write().set_value("id", "B").unwrap();
			l.add(b, Some("B")).unwrap();
		}
		let l = list.read();
		assert_eq!(l.len(), 2);
		let b = l.get("B").unwrap();
		assert_eq!(b.read().get("id").unwrap().read().as_str(), Some("B"));
		assert!(l.get("C").is_none());
	}
}
