use regex::Regex;
use serde_json::Map;
use serde_json::Value;
use uuid::Uuid;

use crate::value::is_present;

/// Opaque identity of an element, generated on creation.
pub type ElementId = Uuid;

/// Identity, name, tags and metadata shared by bits, constants and targets.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementMeta {
	pub id: ElementId,
	pub name: Option<String>,
	pub tags: Vec<String>,
	pub metadata: Map<String, Value>,
}

impl ElementMeta {
	pub fn new(name: Option<String>, tags: Vec<String>, metadata: Map<String, Value>) -> Self {
		Self {
			id: Uuid::new_v4(),
			name,
			tags,
			metadata,
		}
	}
}

/// Common behaviour of everything a [`Collection`](crate::Collection) holds.
pub trait Element {
	fn meta(&self) -> &ElementMeta;

	/// Value of a type-specific field such as `symbol` or `src`.
	fn own_field(&self, _key: &str) -> Option<Value> {
		None
	}

	fn id(&self) -> ElementId {
		self.meta().id
	}

	fn name(&self) -> Option<&str> {
		self.meta().name.as_deref()
	}

	fn tags(&self) -> &[String] {
		&self.meta().tags
	}

	fn metadata(&self) -> &Map<String, Value> {
		&self.meta().metadata
	}

	/// Name for messages: the name, or the id when unnamed.
	fn label(&self) -> String {
		self.name()
			.map_or_else(|| self.id().to_string(), ToString::to_string)
	}

	/// Look up a field by name for `has`/`missing` predicates.
	fn field(&self, key: &str) -> Option<Value> {
		match key {
			"id" => Some(Value::String(self.id().to_string())),
			"name" => self.name().map(|name| Value::String(name.to_string())),
			"tags" => {
				Some(Value::Array(
					self.tags().iter().cloned().map(Value::String).collect(),
				))
			}
			_ => {
				self.own_field(key)
					.or_else(|| self.metadata().get(key).cloned())
			}
		}
	}

	fn has_field(&self, key: &str) -> bool {
		self.field(key).as_ref().is_some_and(is_present)
	}

	/// `pattern` is expected to be anchored at the start already.
	fn matches_name(&self, pattern: &Regex) -> bool {
		self.name().is_some_and(|name| pattern.is_match(name))
	}

	/// All of `tags` must be present. No tags matches everything.
	fn matches_tags(&self, tags: &[String]) -> bool {
		tags.iter().all(|tag| self.tags().contains(tag))
	}

	/// Declared metadata equals `expected`. A null `expected` always matches.
	fn matches_metadata(&self, key: &str, expected: &Value) -> bool {
		expected.is_null() || self.metadata().get(key) == Some(expected)
	}
}
