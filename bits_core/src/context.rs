use std::fmt::Write as _;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;

use crate::bit::Block;
use crate::constant::Constant;
use crate::element::Element;
use crate::element::ElementId;

/// Template variables after resolution.
pub type Context = IndexMap<String, ContextValue>;

/// A resolved context value: plain data, or a block/constant produced by a
/// query.
#[derive(Debug, Clone)]
pub enum ContextValue {
	Null,
	Bool(bool),
	Number(Number),
	String(String),
	List(Vec<ContextValue>),
	Map(Context),
	Block(Arc<Block>),
	Constant(Arc<Constant>),
}

impl ContextValue {
	pub fn as_block(&self) -> Option<&Arc<Block>> {
		match self {
			Self::Block(block) => Some(block),
			_ => None,
		}
	}

	pub fn as_constant(&self) -> Option<&Arc<Constant>> {
		match self {
			Self::Constant(constant) => Some(constant),
			_ => None,
		}
	}

	pub fn as_list(&self) -> Option<&[ContextValue]> {
		match self {
			Self::List(items) => Some(items),
			_ => None,
		}
	}

	pub fn as_map(&self) -> Option<&Context> {
		match self {
			Self::Map(map) => Some(map),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String(value) => Some(value),
			_ => None,
		}
	}

	/// Identity of the element behind a block or constant.
	pub fn element_id(&self) -> Option<ElementId> {
		match self {
			Self::Block(block) => Some(block.bit().id()),
			Self::Constant(constant) => Some(constant.id()),
			_ => None,
		}
	}

	/// Name of the element behind a block or constant.
	pub fn element_name(&self) -> Option<&str> {
		match self {
			Self::Block(block) => block.bit().name(),
			Self::Constant(constant) => constant.name(),
			_ => None,
		}
	}

	/// Stable textual form of the content, used for `by:hash` dedupe.
	pub fn fingerprint(&self) -> String {
		let mut out = String::new();
		self.write_fingerprint(&mut out);
		out
	}

	fn write_fingerprint(&self, out: &mut String) {
		match self {
			Self::Null => out.push_str("null"),
			Self::Bool(value) => {
				let _ = write!(out, "{value}");
			}
			Self::Number(value) => {
				let _ = write!(out, "{value}");
			}
			Self::String(value) => {
				let _ = write!(out, "{value:?}");
			}
			Self::List(items) => {
				out.push('[');
				for item in items {
					item.write_fingerprint(out);
					out.push(',');
				}
				out.push(']');
			}
			Self::Map(map) => write_context_fingerprint(map, out),
			Self::Block(block) => {
				let _ = write!(out, "block({:?}|", block.bit().source());
				write_context_fingerprint(block.context(), out);
				out.push(')');
			}
			Self::Constant(constant) => {
				let _ = write!(out, "constant({:?}={:?})", constant.symbol(), constant.value());
			}
		}
	}
}

fn write_context_fingerprint(context: &Context, out: &mut String) {
	out.push('{');
	for (key, value) in context {
		let _ = write!(out, "{key:?}:");
		value.write_fingerprint(out);
		out.push(',');
	}
	out.push('}');
}

impl From<Value> for ContextValue {
	fn from(value: Value) -> Self {
		match value {
			Value::Null => Self::Null,
			Value::Bool(value) => Self::Bool(value),
			Value::Number(value) => Self::Number(value),
			Value::String(value) => Self::String(value),
			Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
			Value::Object(map) => Self::Map(context_from_map(map)),
		}
	}
}

impl From<&str> for ContextValue {
	fn from(value: &str) -> Self {
		Self::String(value.to_string())
	}
}

impl From<Arc<Block>> for ContextValue {
	fn from(block: Arc<Block>) -> Self {
		Self::Block(block)
	}
}

impl From<Arc<Constant>> for ContextValue {
	fn from(constant: Arc<Constant>) -> Self {
		Self::Constant(constant)
	}
}

/// Convert a plain declaration map into a context.
pub fn context_from_map(map: Map<String, Value>) -> Context {
	map.into_iter()
		.map(|(key, value)| (key, ContextValue::from(value)))
		.collect()
}

/// Deep-merge `overlay` into `base`: maps recurse, everything else is
/// replaced by the overlay.
pub fn merge_context(base: &mut Context, overlay: Context) {
	for (key, value) in overlay {
		match (base.get_mut(&key), value) {
			(Some(ContextValue::Map(existing)), ContextValue::Map(incoming)) => {
				merge_context(existing, incoming);
			}
			(Some(existing), incoming) => *existing = incoming,
			(None, incoming) => {
				base.insert(key, incoming);
			}
		}
	}
}
