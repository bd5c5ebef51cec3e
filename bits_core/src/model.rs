//! Serde declarations of a registry document.
//!
//! These mirror what a registry file says, not what it resolves to. Subtrees
//! that take part in deep merges and path overrides (`defaults`, `context`,
//! `queries`, `compose`) stay as `serde_json` maps and are only parsed into
//! [`QuerySpec`]/[`ComposeSpec`] when a query is resolved.

use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::de;
use serde_json::Map;
use serde_json::Value;

use crate::BitsError;
use crate::BitsResult;
use crate::value::OverrideOp;

/// A whole registry file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
	/// Tags appended to every bit, constant and target of this file.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub imports: Vec<ImportDecl>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub bits: Vec<BitDecl>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub constants: Vec<ConstantDecl>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub targets: Vec<TargetDecl>,
}

impl RegistryDocument {
	pub fn target(&self, name: &str) -> Option<&TargetDecl> {
		self.targets
			.iter()
			.find(|target| target.name.as_deref() == Some(name))
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDecl {
	/// Path of the imported registry, relative to the importing file.
	pub registry: String,
}

/// Template source of a bit: one string, or named fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BitSource {
	Single(String),
	Fragments(IndexMap<String, String>),
}

impl Default for BitSource {
	fn default() -> Self {
		Self::Single(String::new())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitDecl {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub author: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub level: Option<i64>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub defaults: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub presets: Vec<PresetDecl>,
	#[serde(default)]
	pub src: BitSource,
	/// Any other keys are kept as metadata.
	#[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetDecl {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
	/// Deprecated lookup key, kept for older registries.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<Value>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub context: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub queries: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub compose: Map<String, Value>,
	#[serde(default, skip_serializing_if = "MergeHints::is_empty")]
	pub merge: MergeHints,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub overrides: Vec<OverrideDecl>,
}

impl PresetDecl {
	/// The name used in messages: `name`, then `label`, then `id`.
	pub fn display_name(&self) -> Option<String> {
		self.name
			.clone()
			.or_else(|| self.label.clone())
			.or_else(|| self.id.as_ref().and_then(crate::value::scalar_key))
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantDecl {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	#[serde(deserialize_with = "scalar_string")]
	pub symbol: String,
	#[serde(deserialize_with = "scalar_string")]
	pub value: String,
	#[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetDecl {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub template: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dest: Option<String>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub context: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub queries: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub compose: Map<String, Value>,
	#[serde(default, skip_serializing_if = "MergeHints::is_empty")]
	pub merge: MergeHints,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub extends: Option<Extends>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub overrides: Vec<OverrideDecl>,
}

impl TargetDecl {
	pub fn bases(&self) -> &[String] {
		match &self.extends {
			Some(Extends::One(base)) => std::slice::from_ref(base),
			Some(Extends::Many(bases)) => bases,
			None => &[],
		}
	}
}

/// `extends: Base` or `extends: [A, other.yaml::B]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Extends {
	One(String),
	Many(Vec<String>),
}

/// Per-section merge policy of a target or preset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeHints {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub queries: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub compose: Option<String>,
}

impl MergeHints {
	pub fn is_empty(&self) -> bool {
		self.context.is_none() && self.queries.is_none() && self.compose.is_none()
	}

	/// The validated policy for `section` (`context`, `queries` or `compose`).
	pub fn policy(&self, section: &str) -> BitsResult<MergePolicy> {
		let declared = match section {
			"context" => self.context.as_deref(),
			"queries" => self.queries.as_deref(),
			"compose" => self.compose.as_deref(),
			_ => None,
		};

		match declared.map(str::trim) {
			None | Some("merge" | "deep") => Ok(MergePolicy::Merge),
			Some("replace") => Ok(MergePolicy::Replace),
			Some(other) => {
				Err(BitsError::UnknownMergePolicy {
					section: section.to_string(),
					policy: other.to_string(),
				})
			}
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
	#[default]
	Merge,
	Replace,
}

/// `{path, value, op?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideDecl {
	pub path: String,
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub value: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub op: Option<String>,
}

impl OverrideDecl {
	pub fn op(&self) -> BitsResult<OverrideOp> {
		self.op
			.as_deref()
			.map_or(Ok(OverrideOp::Set), str::parse)
	}
}

/// What a query name selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
	#[serde(alias = "blocks")]
	Bits,
	Constants,
}

impl QueryKind {
	/// `kind` wins; otherwise the query named `constants` selects constants.
	pub fn for_query(name: &str, declared: Option<Self>) -> Self {
		match declared {
			Some(kind) => kind,
			None if name == "constants" => Self::Constants,
			None => Self::Bits,
		}
	}
}

/// One query of a `queries` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub registry: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<QueryKind>,
	/// Older predicate form, superseded by `where`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub query: Option<WhereClause>,
	#[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
	pub where_clause: Option<WhereClause>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub select: Option<SelectSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub preset: Option<PresetSelector>,
	#[serde(default, rename = "with", skip_serializing_if = "Option::is_none")]
	pub with_clause: Option<WithClause>,
	/// Per-query context, layered under `with.context`.
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub context: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub metadata: Map<String, Value>,
}

impl QuerySpec {
	/// The active predicate: `where` when present, else the legacy `query`.
	pub fn predicate(&self) -> Option<&WhereClause> {
		self.where_clause.as_ref().or(self.query.as_ref())
	}
}

/// A `queries` entry: one spec, or several whose results stay grouped.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEntry {
	One(QuerySpec),
	Many(Vec<QuerySpec>),
}

impl QueryEntry {
	pub fn parse(name: &str, value: &Value) -> BitsResult<Self> {
		let invalid = |error: serde_json::Error| BitsError::InvalidQuery(format!("`{name}`: {error}"));
		match value {
			Value::Array(items) => {
				items
					.iter()
					.map(|item| QuerySpec::deserialize(item).map_err(invalid))
					.collect::<BitsResult<Vec<_>>>()
					.map(Self::Many)
			}
			Value::Object(_) => QuerySpec::deserialize(value).map(Self::One).map_err(invalid),
			Value::Null => Ok(Self::One(QuerySpec::default())),
			other => {
				Err(BitsError::InvalidQuery(format!(
					"`{name}`: expected a query map or a list of query maps, got `{other}`"
				)))
			}
		}
	}

	pub fn specs(&self) -> &[QuerySpec] {
		match self {
			Self::One(spec) => std::slice::from_ref(spec),
			Self::Many(specs) => specs,
		}
	}

	pub fn is_grouped(&self) -> bool {
		matches!(self, Self::Many(_))
	}
}

/// Predicates of a `where` (or legacy `query`) clause. Keys other than the
/// named ones are metadata equality filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
	#[serde(default, alias = "id_", skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub has: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub missing: Vec<String>,
	#[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectSpec {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub indices: Option<Vec<i64>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub k: Option<usize>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub limit: Option<usize>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub offset: Option<usize>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub shuffle: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub seed: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sample: Option<usize>,
}

/// `preset: 2`, `preset: "2"` or `preset: name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PresetSelector {
	Index(i64),
	Name(String),
}

impl fmt::Display for PresetSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Index(index) => write!(f, "{index}"),
			Self::Name(name) => f.write_str(name),
		}
	}
}

/// Explicit per-query overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WithClause {
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub context: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub queries: Map<String, Value>,
}

/// One `compose` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeSpec {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub flatten: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub merge: Option<String>,
	#[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
	pub alias: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dedupe: Option<String>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub shuffle: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub seed: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub limit: Option<usize>,
	/// Present on aggregate entries.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub from: Option<Vec<String>>,
}

impl ComposeSpec {
	/// Parse a `compose` map, keeping declaration order.
	pub fn parse_map(compose: &Map<String, Value>) -> BitsResult<IndexMap<String, Self>> {
		compose
			.iter()
			.map(|(name, value)| {
				let spec = match value {
					Value::Null => Self::default(),
					_ => {
						Self::deserialize(value).map_err(|e| {
							BitsError::InvalidQuery(format!("compose entry `{name}`: {e}"))
						})?
					}
				};
				Ok((name.clone(), spec))
			})
			.collect()
	}
}

/// Accept strings, numbers and booleans and keep their text.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
	D: Deserializer<'de>,
{
	let value = Value::deserialize(deserializer)?;
	crate::value::scalar_key(&value)
		.ok_or_else(|| de::Error::custom(format!("expected a scalar, got `{value}`")))
}
