use std::fmt;

use serde_json::Value;

use crate::element::Element;
use crate::element::ElementMeta;
use crate::model::ConstantDecl;

/// A named symbol/value pair, e.g. `g = 9.81`.
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
	meta: ElementMeta,
	symbol: String,
	value: String,
}

impl Constant {
	pub fn from_decl(decl: ConstantDecl, common_tags: &[String]) -> Self {
		let ConstantDecl {
			name,
			mut tags,
			symbol,
			value,
			metadata,
		} = decl;
		tags.extend(common_tags.iter().cloned());

		Self {
			meta: ElementMeta::new(name, tags, metadata),
			symbol,
			value,
		}
	}

	pub fn symbol(&self) -> &str {
		&self.symbol
	}

	pub fn value(&self) -> &str {
		&self.value
	}
}

impl Element for Constant {
	fn meta(&self) -> &ElementMeta {
		&self.meta
	}

	fn own_field(&self, key: &str) -> Option<Value> {
		match key {
			"symbol" => Some(Value::String(self.symbol.clone())),
			"value" => Some(Value::String(self.value.clone())),
			_ => None,
		}
	}
}

impl fmt::Display for Constant {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} = {}", self.symbol, self.value)
	}
}
