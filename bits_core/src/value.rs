//! Operations over declaration trees (`serde_json::Value`): deep merging and
//! path overrides.
//!
//! Two merge flavours exist. Target inheritance merges lists index-wise so a
//! derived target can patch the second query of a base without restating the
//! first; preset overlays and configuration layers replace lists wholesale.
//!
//! Override paths follow the grammar `key('.'key|'['int']')*` with 1-based
//! indices, e.g. `queries.blocks[2].where.name`. A path is parsed and checked
//! against the tree before anything is written, so a failing override never
//! leaves a half-applied patch behind.

use std::fmt;
use std::str::FromStr;

use serde_json::Map;
use serde_json::Value;

use crate::BitsError;
use crate::BitsResult;
use crate::model::OverrideDecl;

/// Subtrees of a target or preset spec that an override path may name
/// explicitly. Paths starting with anything else address `queries`.
pub const SPEC_SECTIONS: [&str; 5] = ["queries", "context", "compose", "template", "dest"];

/// How two lists meet during a deep merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMerge {
	/// Merge position by position; maps at the same index merge recursively,
	/// anything else is taken from the overlay. Overlay-only positions are
	/// appended and base-only positions are kept.
	IndexWise,
	/// The overlay list replaces the base list.
	Replace,
}

/// Deep-merge `overlay` into `base`. Maps merge key by key, scalars and
/// mismatched kinds are replaced by the overlay.
pub fn merge_into(base: &mut Value, overlay: Value, lists: ListMerge) {
	match (base, overlay) {
		(Value::Object(base_map), Value::Object(overlay_map)) => {
			merge_maps(base_map, overlay_map, lists);
		}
		(Value::Array(base_items), Value::Array(overlay_items)) if lists == ListMerge::IndexWise => {
			for (index, item) in overlay_items.into_iter().enumerate() {
				match base_items.get_mut(index) {
					Some(existing) if existing.is_object() && item.is_object() => {
						merge_into(existing, item, lists);
					}
					Some(existing) => *existing = item,
					None => base_items.push(item),
				}
			}
		}
		(base, overlay) => *base = overlay,
	}
}

/// Deep-merge two maps, see [`merge_into`].
pub fn merge_maps(base: &mut Map<String, Value>, overlay: Map<String, Value>, lists: ListMerge) {
	for (key, value) in overlay {
		match base.get_mut(&key) {
			Some(existing) => merge_into(existing, value, lists),
			None => {
				base.insert(key, value);
			}
		}
	}
}

/// Return `base` deep-merged with `overlay` without touching either input.
pub fn merged(base: &Value, overlay: &Value, lists: ListMerge) -> Value {
	let mut result = base.clone();
	merge_into(&mut result, overlay.clone(), lists);
	result
}

/// Whether a value counts as present for `has`/`missing` predicates.
pub fn is_present(value: &Value) -> bool {
	match value {
		Value::Null => false,
		Value::String(s) => !s.is_empty(),
		Value::Array(items) => !items.is_empty(),
		Value::Object(map) => !map.is_empty(),
		Value::Bool(_) | Value::Number(_) => true,
	}
}

/// String form of a scalar used for loose comparisons (`id: 1` vs `"1"`).
pub fn scalar_key(value: &Value) -> Option<String> {
	match value {
		Value::String(s) => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		Value::Bool(b) => Some(b.to_string()),
		_ => None,
	}
}

/// One step of an override path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
	Key(String),
	/// 1-based list index as written in the path.
	Index(usize),
}

impl fmt::Display for PathSegment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Key(key) => write!(f, "{key}"),
			Self::Index(index) => write!(f, "[{index}]"),
		}
	}
}

/// A parsed override path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverridePath {
	raw: String,
	segments: Vec<PathSegment>,
}

impl OverridePath {
	pub fn parse(raw: &str) -> BitsResult<Self> {
		let malformed = |reason: &str| {
			BitsError::OverridePath {
				path: raw.to_string(),
				reason: reason.to_string(),
			}
		};

		if raw.trim().is_empty() {
			return Err(malformed("path is empty"));
		}

		let mut segments = Vec::new();
		for part in raw.split('.') {
			let key_end = part.find('[').unwrap_or(part.len());
			let (key, mut rest) = part.split_at(key_end);
			if key.is_empty() {
				return Err(malformed("every segment must start with a key"));
			}
			if key.contains(']') {
				return Err(malformed("unbalanced `]`"));
			}
			segments.push(PathSegment::Key(key.to_string()));

			while !rest.is_empty() {
				let Some(inner) = rest.strip_prefix('[') else {
					return Err(malformed("unexpected text after index"));
				};
				let Some(close) = inner.find(']') else {
					return Err(malformed("unbalanced `[`"));
				};
				let index: usize = inner[..close]
					.trim()
					.parse()
					.map_err(|_| malformed("index must be a positive integer"))?;
				if index == 0 {
					return Err(malformed("indices are 1-based"));
				}
				segments.push(PathSegment::Index(index));
				rest = &inner[close + 1..];
			}
		}

		Ok(Self {
			raw: raw.to_string(),
			segments,
		})
	}

	pub fn segments(&self) -> &[PathSegment] {
		&self.segments
	}

	pub fn as_str(&self) -> &str {
		&self.raw
	}

	/// Prefix the path with `queries` unless it already names one of the
	/// [`SPEC_SECTIONS`].
	pub fn within_spec(mut self) -> Self {
		let names_section = matches!(
			self.segments.first(),
			Some(PathSegment::Key(key)) if SPEC_SECTIONS.contains(&key.as_str())
		);
		if !names_section {
			self.segments.insert(0, PathSegment::Key("queries".to_string()));
		}
		self
	}

	fn error(&self, reason: impl Into<String>) -> BitsError {
		BitsError::OverridePath {
			path: self.raw.clone(),
			reason: reason.into(),
		}
	}
}

impl FromStr for OverridePath {
	type Err = BitsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl fmt::Display for OverridePath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.raw)
	}
}

/// What an override does at its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideOp {
	#[default]
	Set,
	/// Deep-merge the value into the addressed node (lists index-wise).
	Merge,
	/// Delete the addressed list element or map key. Missing targets are a
	/// no-op.
	Remove,
}

impl FromStr for OverrideOp {
	type Err = BitsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"set" | "replace" => Ok(Self::Set),
			"merge" => Ok(Self::Merge),
			"remove" | "delete" => Ok(Self::Remove),
			other => Err(BitsError::UnknownOverrideOp(other.to_string())),
		}
	}
}

fn step<'v>(node: &'v Value, segment: &PathSegment) -> Option<&'v Value> {
	match segment {
		PathSegment::Key(key) => node.as_object()?.get(key),
		PathSegment::Index(index) => node.as_array()?.get(index - 1),
	}
}

fn step_mut<'v>(node: &'v mut Value, segment: &PathSegment) -> Option<&'v mut Value> {
	match segment {
		PathSegment::Key(key) => node.as_object_mut()?.get_mut(key),
		PathSegment::Index(index) => node.as_array_mut()?.get_mut(index - 1),
	}
}

/// Check that `path` can be applied to `tree` with `op` without writing
/// anything.
pub fn validate_path(tree: &Value, path: &OverridePath, op: OverrideOp) -> BitsResult<()> {
	let Some((last, parents)) = path.segments.split_last() else {
		return Err(path.error("path is empty"));
	};

	let mut node = tree;
	let mut walked = String::new();
	for segment in parents {
		if !walked.is_empty() && matches!(segment, PathSegment::Key(_)) {
			walked.push('.');
		}
		walked.push_str(&segment.to_string());
		node = step(node, segment)
			.ok_or_else(|| path.error(format!("`{walked}` does not exist")))?;
	}

	match last {
		PathSegment::Key(key) => {
			if !node.is_object() {
				return Err(path.error(format!("cannot set key `{key}` on a non-map value")));
			}
		}
		PathSegment::Index(index) => {
			let Some(items) = node.as_array() else {
				return Err(path.error(format!("cannot index [{index}] into a non-list value")));
			};
			if op != OverrideOp::Remove && *index > items.len() {
				return Err(path.error(format!(
					"index [{index}] is out of range for a list of {} item(s)",
					items.len()
				)));
			}
		}
	}

	Ok(())
}

/// Apply one override to `tree`. The path is validated first.
pub fn apply_path(tree: &mut Value, path: &OverridePath, op: OverrideOp, value: Value) -> BitsResult<()> {
	validate_path(tree, path, op)?;

	let Some((last, parents)) = path.segments.split_last() else {
		return Err(path.error("path is empty"));
	};

	let mut node = tree;
	for segment in parents {
		node = step_mut(node, segment).ok_or_else(|| path.error("path changed during override"))?;
	}

	match (last, op) {
		(PathSegment::Key(key), OverrideOp::Set) => {
			if let Some(map) = node.as_object_mut() {
				map.insert(key.clone(), value);
			}
		}
		(PathSegment::Key(key), OverrideOp::Merge) => {
			if let Some(map) = node.as_object_mut() {
				match map.get_mut(key) {
					Some(existing) => merge_into(existing, value, ListMerge::IndexWise),
					None => {
						map.insert(key.clone(), value);
					}
				}
			}
		}
		(PathSegment::Key(key), OverrideOp::Remove) => {
			if let Some(map) = node.as_object_mut() {
				map.shift_remove(key);
			}
		}
		(PathSegment::Index(index), OverrideOp::Set) => {
			if let Some(slot) = node.as_array_mut().and_then(|items| items.get_mut(index - 1)) {
				*slot = value;
			}
		}
		(PathSegment::Index(index), OverrideOp::Merge) => {
			if let Some(slot) = node.as_array_mut().and_then(|items| items.get_mut(index - 1)) {
				merge_into(slot, value, ListMerge::IndexWise);
			}
		}
		(PathSegment::Index(index), OverrideOp::Remove) => {
			if let Some(items) = node.as_array_mut() {
				if *index <= items.len() {
					items.remove(index - 1);
				}
			}
		}
	}

	Ok(())
}

/// Apply declared overrides, in order, to a spec tree shaped like
/// `{queries, context, compose, template?, dest?}`.
pub fn apply_overrides(tree: &mut Value, overrides: &[OverrideDecl]) -> BitsResult<()> {
	for entry in overrides {
		let path = OverridePath::parse(&entry.path)?.within_spec();
		let op = entry.op()?;
		apply_path(tree, &path, op, entry.value.clone())?;
	}

	Ok(())
}
