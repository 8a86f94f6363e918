use std::cmp::Ordering;
use std::fmt;

/// A slash separated element path, as used for rule matching and model
/// references. Two wildcard forms take part in equality:
///
/// * `*` as the first segment of an unrooted path matches any (possibly
///   empty) run of leading segments of the other path;
/// * `?` matches exactly one segment, anywhere.
///
/// A leading `/` makes a path rooted: it only matches paths of the same
/// depth. A path can also be tagged with a depth counter to suspend rule
/// evaluation for the extent of a subtree (see [`Path::tag`]).
#[derive(Debug, Clone, Default)]
pub struct Path {
	segments: Vec<String>,
	rooted: bool,
	tag_depth: u32,
}

impl Path {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from(path: &str) -> Self {
		let mut p = Self::new();
		if path.is_empty() {
			return p;
		}
		p.rooted = path.starts_with('/');
		p.segments
			.extend(path.split('/').filter(|s| !s.is_empty()).map(str::to_owned));
		p
	}

	/// Appends one or more segments. A tagged path gets one level deeper
	/// per call, regardless of how many segments the argument carries.
	pub fn push(&mut self, element: &str) {
		if self.tag_depth > 0 {
			self.tag_depth += 1;
		}
		self.segments
			.extend(element.split('/').filter(|s| !s.is_empty()).map(str::to_owned));
	}

	/// Removes and returns the trailing segment. Unwinds one tag level.
	pub fn pop(&mut self) -> String {
		if self.tag_depth > 0 {
			self.tag_depth -= 1;
		}
		let leaf = self.segments.pop().unwrap_or_default();
		if self.segments.is_empty() {
			self.rooted = false;
		}
		leaf
	}

	pub fn leaf(&self) -> &str {
		self.segments.last().map(String::as_str).unwrap_or("")
	}

	/// Concatenates another path. Appending a rooted path onto an empty
	/// one roots the result; otherwise the other path's root is dropped.
	pub fn append(&mut self, other: &Path) {
		if other.is_empty() {
			return;
		}
		if self.is_empty() && other.rooted {
			self.rooted = true;
		}
		self.segments.extend(other.segments.iter().cloned());
	}

	pub fn tag(&mut self, depth: u32) {
		self.tag_depth = depth;
	}

	pub fn is_tagged(&self) -> bool {
		self.tag_depth > 0
	}

	pub fn tag_depth(&self) -> u32 {
		self.tag_depth
	}

	pub fn is_rooted(&self) -> bool {
		self.rooted
	}

	pub fn is_empty(&self) -> bool {
		self.segments.is_empty() && !self.rooted
	}

	/// Number of non-empty segments.
	pub fn length(&self) -> usize {
		self.segments.len()
	}

	pub fn reset(&mut self) {
		self.segments.clear();
		self.rooted = false;
		self.tag_depth = 0;
	}

	/// Strict lexicographic order on the canonical string form. Equality
	/// here is wildcard-aware and so unfit for ordered containers; store
	/// paths under this ordering instead.
	pub fn canonical_cmp(&self, other: &Path) -> Ordering {
		self.to_string().cmp(&other.to_string())
	}

	// Matching treats the root marker of a rooted path as an extra leading
	// element that only an `*` head can cover.
	fn elem_count(&self) -> usize {
		self.segments.len() + usize::from(self.rooted)
	}

	fn elem(&self, i: usize) -> &str {
		if self.rooted {
			if i == 0 { "" } else { &self.segments[i - 1] }
		} else {
			&self.segments[i]
		}
	}

	fn has_wild_head(&self) -> bool {
		!self.rooted && self.segments.first().map(String::as_str) == Some("*")
	}

	fn is_wild(&self, i: usize) -> bool {
		let s = self.elem(i);
		s == "?" || (i == 0 && !self.rooted && s == "*")
	}

	fn matches(shorter: &Path, longer: &Path) -> bool {
		if shorter.rooted && shorter.elem_count() < longer.elem_count() {
			return false;
		}

		let mut si = shorter.elem_count();
		let mut li = longer.elem_count();
		while si > 0 {
			si -= 1;
			li -= 1;
			if !shorter.is_wild(si) && !longer.is_wild(li) && shorter.elem(si) != longer.elem(li) {
				return false;
			}
		}

		if li > 0 && !shorter.has_wild_head() {
			// The longer path's leftover prefix can only be covered by its
			// own `*` head, e.g. b/c == */b/c.
			return li == 1 && longer.has_wild_head();
		}
		true
	}
}

impl PartialEq for Path {
	fn eq(&self, other: &Self) -> bool {
		if self.is_empty() && other.is_empty() {
			return true;
		}
		if self.is_empty() || other.is_empty() {
			return false;
		}
		if other.elem_count() < self.elem_count() {
			Path::matches(other, self)
		} else {
			Path::matches(self, other)
		}
	}
}

impl fmt::Display for Path {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.rooted {
			f.write_str("/")?;
		}
		f.write_str(&self.segments.join("/"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_and_display_round_trip() {
		for s in ["", "/", "a", "a/b/c", "/a/b/c", "*/c", "a/?/c", "@attr"] {
			let p = Path::from(s);
			let canonical = p.to_string();
			assert_eq!(Path::from(&canonical).to_string(), canonical, "round trip of {s:?}");
		}
	}

	#[test]
	fn push_built_path_round_trips() {
		let mut p = Path::new();
		p.push("a");
		p.push("b/c");
		assert_eq!(p.to_string(), "a/b/c");
		assert!(Path::from(&p.to_string()) == p);
	}

	#[test]
	fn wildcard_matching() {
		let p = Path::from("/a/b/c");
		assert!(Path::from("*/c") == p);
		assert!(Path::from("/a/?/c") == p);
		assert!(!(Path::from("a/b") == p));
		assert!(Path::from("*") == p);
		assert!(Path::from("*") == Path::from("x"));
		assert!(!(Path::from("*/x") == p));
	}

	#[test]
	fn equality_is_reflexive_and_symmetric() {
		let paths = ["a", "/a/b", "a/b/c", "*/c", "a/?/c"];
		for s in paths {
			let p = Path::from(s);
			assert!(p == Path::from(s), "{s:?} reflexive");
		}
		for s in paths {
			for t in paths {
				let (a, b) = (Path::from(s), Path::from(t));
				assert_eq!(a == b, b == a, "{s:?} vs {t:?} symmetric");
			}
		}
	}

	#[test]
	fn rooted_paths_match_exact_depth_only() {
		assert!(Path::from("/a/b") == Path::from("/a/b"));
		assert!(!(Path::from("/a/b") == Path::from("a/b")));
		assert!(!(Path::from("/b/c") == Path::from("/a/b/c")));
		// Without a `*` head a shorter path does not suffix-match.
		assert!(!(Path::from("b/c") == Path::from("/a/b/c")));
		assert!(Path::from("*/b/c") == Path::from("/a/b/c"));
	}

	#[test]
	fn tag_balance() {
		let mut p = Path::from("a/b");
		p.tag(1);
		p.push("c");
		p.push("d");
		assert_eq!(p.tag_depth(), 3);
		p.pop();
		p.pop();
		assert!(p.is_tagged());
		p.pop();
		assert_eq!(p.tag_depth(), 0);
		assert!(!p.is_tagged());
	}

	#[test]
	fn pop_returns_leaf_and_unroots_empty() {
		let mut p = Path::from("/a/b");
		assert_eq!(p.pop(), "b");
		assert_eq!(p.leaf(), "a");
		assert_eq!(p.pop(), "a");
		assert!(p.is_empty());
		assert_eq!(p.pop(), "");
	}

	#[test]
	fn canonical_order_is_lexicographic() {
		let mut paths = [Path::from("b/a"), Path::from("a/b"), Path::from("/a")];
		paths.sort_by(|x, y| x.canonical_cmp(y));
		let ordered: Vec<String> = paths.iter().map(Path::to_string).collect();
		assert_eq!(ordered, vec!["/a", "a/b", "b/a"]);
	}

	#[test]
	fn append_respects_other_root() {
		let mut p = Path::new();
		p.append(&Path::from("/a/b"));
		assert_eq!(p.to_string(), "/a/b");

		let mut q = Path::from("x");
		q.append(&Path::from("/a"));
		assert_eq!(q.to_string(), "x/a");
		assert_eq!(q.length(), 2);
	}
}
