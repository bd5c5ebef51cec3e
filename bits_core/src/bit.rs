use std::sync::Arc;
use std::sync::OnceLock;

use serde_json::Map;
use serde_json::Value;

use crate::BitsError;
use crate::BitsResult;
use crate::context::Context;
use crate::context::merge_context;
use crate::element::Element;
use crate::element::ElementMeta;
use crate::model::BitDecl;
use crate::model::BitSource;
use crate::model::PresetDecl;
use crate::template::TemplateEngine;

/// Name of the synthetic preset that always returns a bit's own resolved
/// defaults. A declared preset with this name is dropped.
pub const DEFAULT_PRESET: &str = "default";

/// A bit's `defaults`, normalized to `{context, queries, compose}`.
///
/// Both the structured form and the legacy bare map with `blocks`/`constants`
/// arrays end up here; legacy arrays are lifted into `queries`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefaultsSpec {
	pub context: Map<String, Value>,
	pub queries: Map<String, Value>,
	pub compose: Map<String, Value>,
}

impl DefaultsSpec {
	pub fn from_map(defaults: &Map<String, Value>) -> Self {
		let structured = defaults.get("context").is_some_and(Value::is_object)
			&& defaults
				.keys()
				.all(|key| matches!(key.as_str(), "context" | "queries" | "compose"));

		let mut spec = Self {
			queries: object_at(defaults, "queries"),
			compose: object_at(defaults, "compose"),
			..Self::default()
		};

		let context = if structured {
			object_at(defaults, "context")
		} else {
			defaults
				.iter()
				.filter(|(key, _)| !matches!(key.as_str(), "queries" | "compose"))
				.map(|(key, value)| (key.clone(), value.clone()))
				.collect()
		};

		spec.context = lift_legacy_queries(context, &mut spec.queries);
		spec
	}
}

fn object_at(map: &Map<String, Value>, key: &str) -> Map<String, Value> {
	map.get(key)
		.and_then(Value::as_object)
		.cloned()
		.unwrap_or_default()
}

/// Move legacy `blocks`/`constants` arrays out of a context map into
/// `queries`, returning the remaining static context. A query of the same
/// name that already exists wins.
pub fn lift_legacy_queries(
	mut context: Map<String, Value>,
	queries: &mut Map<String, Value>,
) -> Map<String, Value> {
	for key in ["blocks", "constants"] {
		let Some(legacy) = context.shift_remove(key) else {
			continue;
		};

		if queries.contains_key(key) {
			tracing::warn!(query = key, "ignoring legacy `context.{key}`, `queries.{key}` is already declared");
			continue;
		}

		queries.insert(key.to_string(), legacy);
	}

	context
}

/// A reusable template fragment.
#[derive(Debug)]
pub struct Bit {
	meta: ElementMeta,
	source: BitSource,
	defaults: DefaultsSpec,
	presets: Vec<PresetDecl>,
	resolved: OnceLock<Context>,
}

impl Bit {
	/// Build a bit from its declaration, appending the registry's common tags.
	pub fn from_decl(decl: BitDecl, common_tags: &[String]) -> BitsResult<Self> {
		let BitDecl {
			name,
			mut tags,
			author,
			kind,
			level,
			defaults,
			presets,
			src,
			metadata: extra,
		} = decl;

		let label = name.clone().unwrap_or_else(|| "<unnamed>".to_string());
		if matches!(&src, BitSource::Fragments(fragments) if fragments.is_empty()) {
			return Err(BitsError::EmptyFragments { bit: label });
		}

		let presets = presets
			.into_iter()
			.filter(|preset| {
				let reserved = preset.name.as_deref() == Some(DEFAULT_PRESET);
				if reserved {
					tracing::warn!(
						bit = %label,
						"dropping declared preset `{DEFAULT_PRESET}`, the name is reserved for the bit's own defaults"
					);
				}
				!reserved
			})
			.collect();

		let mut metadata = Map::new();
		if let Some(author) = author {
			metadata.insert("author".to_string(), Value::String(author));
		}
		if let Some(kind) = kind {
			metadata.insert("kind".to_string(), Value::String(kind));
		}
		if let Some(level) = level {
			metadata.insert("level".to_string(), Value::from(level));
		}
		metadata.extend(extra);

		tags.extend(common_tags.iter().cloned());

		Ok(Self {
			meta: ElementMeta::new(name, tags, metadata),
			source: src,
			defaults: DefaultsSpec::from_map(&defaults),
			presets,
			resolved: OnceLock::new(),
		})
	}

	pub fn source(&self) -> &BitSource {
		&self.source
	}

	pub fn defaults_spec(&self) -> &DefaultsSpec {
		&self.defaults
	}

	/// Declared presets, without any reserved `default` entry.
	pub fn presets(&self) -> &[PresetDecl] {
		&self.presets
	}

	pub fn fragment_names(&self) -> Vec<&str> {
		match &self.source {
			BitSource::Single(_) => Vec::new(),
			BitSource::Fragments(fragments) => fragments.keys().map(String::as_str).collect(),
		}
	}

	pub fn is_multi_fragment(&self) -> bool {
		matches!(&self.source, BitSource::Fragments(fragments) if fragments.len() > 1)
	}

	/// Defaults after query resolution, once the owning registry has loaded.
	pub fn resolved_defaults(&self) -> Option<&Context> {
		self.resolved.get()
	}

	pub(crate) fn set_resolved_defaults(&self, context: Context) {
		let _ = self.resolved.set(context);
	}

	/// Template source for `part`.
	pub fn fragment(&self, part: Option<&str>) -> BitsResult<&str> {
		match (&self.source, part) {
			(BitSource::Single(src), None) => Ok(src),
			(BitSource::Single(_), Some(part)) => {
				Err(BitsError::TemplateRender(format!(
					"bit `{}` has a single source and no fragment `{part}`",
					self.label()
				)))
			}
			(BitSource::Fragments(fragments), Some(part)) => {
				fragments.get(part).map(String::as_str).ok_or_else(|| {
					BitsError::TemplateRender(format!(
						"bit `{}` has no fragment `{part}`, available fragments: {}",
						self.label(),
						self.fragment_names().join(", ")
					))
				})
			}
			(BitSource::Fragments(fragments), None) => {
				match fragments.values().next() {
					Some(src) if fragments.len() == 1 => Ok(src),
					_ => {
						Err(BitsError::TemplateRender(format!(
							"bit `{}` has several fragments, choose one of: {}",
							self.label(),
							self.fragment_names().join(", ")
						)))
					}
				}
			}
		}
	}

	/// Render `part` with resolved defaults < `context`.
	pub fn render(
		&self,
		engine: &TemplateEngine,
		part: Option<&str>,
		context: &Context,
	) -> BitsResult<String> {
		let source = self.fragment(part)?;
		let mut merged = self.resolved_defaults().cloned().unwrap_or_default();
		merge_context(&mut merged, context.clone());
		engine.render_str(source, &merged)
	}
}

impl Element for Bit {
	fn meta(&self) -> &ElementMeta {
		&self.meta
	}

	fn own_field(&self, key: &str) -> Option<Value> {
		match key {
			"src" => serde_json::to_value(&self.source).ok(),
			"defaults" => {
				let mut defaults = Map::new();
				defaults.insert("context".to_string(), Value::Object(self.defaults.context.clone()));
				defaults.insert("queries".to_string(), Value::Object(self.defaults.queries.clone()));
				Some(Value::Object(defaults))
			}
			"presets" => serde_json::to_value(&self.presets).ok(),
			_ => None,
		}
	}
}

/// A bit bound to one resolved context.
#[derive(Debug, Clone)]
pub struct Block {
	bit: Arc<Bit>,
	context: Context,
	metadata: Map<String, Value>,
}

impl Block {
	pub fn new(bit: Arc<Bit>, context: Context, metadata: Map<String, Value>) -> Self {
		Self {
			bit,
			context,
			metadata,
		}
	}

	pub fn bit(&self) -> &Arc<Bit> {
		&self.bit
	}

	pub fn context(&self) -> &Context {
		&self.context
	}

	pub fn metadata(&self) -> &Map<String, Value> {
		&self.metadata
	}

	pub fn render(&self, engine: &TemplateEngine, part: Option<&str>) -> BitsResult<String> {
		self.bit.render(engine, part, &self.context)
	}

	/// Render with per-call variables layered over the bound context.
	pub fn render_with(
		&self,
		engine: &TemplateEngine,
		part: Option<&str>,
		overrides: Context,
	) -> BitsResult<String> {
		if overrides.is_empty() {
			return self.render(engine, part);
		}

		let mut context = self.context.clone();
		merge_context(&mut context, overrides);
		self.bit.render(engine, part, &context)
	}
}
