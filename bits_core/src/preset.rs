//! Choosing and resolving bit presets.

use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;

use crate::BitsError;
use crate::BitsResult;
use crate::bit::Bit;
use crate::bit::DEFAULT_PRESET;
use crate::context::Context;
use crate::context::merge_context;
use crate::element::Element;
use crate::model::MergePolicy;
use crate::model::PresetDecl;
use crate::model::PresetSelector;
use crate::resolve::Resolver;
use crate::value::ListMerge;
use crate::value::apply_overrides;
use crate::value::merge_maps;
use crate::value::scalar_key;

/// The preset a selector picked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PresetChoice<'a> {
	/// The synthetic `default` preset: the bit's own resolved defaults.
	Defaults,
	Declared(&'a PresetDecl),
}

/// Pick a preset of `bit`.
///
/// Lookup order for names: `default`, then `name`/`label`, then the
/// deprecated `id`, and finally a 1-based index when the text is an integer.
pub fn choose_preset<'a>(bit: &'a Bit, selector: Option<&PresetSelector>) -> BitsResult<PresetChoice<'a>> {
	let Some(selector) = selector else {
		return Ok(PresetChoice::Defaults);
	};

	match selector {
		PresetSelector::Index(index) => by_index(bit, *index),
		PresetSelector::Name(name) => {
			let name = name.trim();
			if name == DEFAULT_PRESET {
				return Ok(PresetChoice::Defaults);
			}

			if let Some(preset) = bit.presets().iter().find(|preset| {
				preset.name.as_deref() == Some(name) || preset.label.as_deref() == Some(name)
			}) {
				return Ok(PresetChoice::Declared(preset));
			}

			if let Some(preset) = bit
				.presets()
				.iter()
				.find(|preset| preset.id.as_ref().and_then(scalar_key).as_deref() == Some(name))
			{
				tracing::warn!(
					bit = %bit.label(),
					preset = name,
					"selecting presets by `id` is deprecated, use `name` instead"
				);
				return Ok(PresetChoice::Declared(preset));
			}

			match name.parse::<i64>() {
				Ok(index) => by_index(bit, index),
				Err(_) => {
					Err(BitsError::PresetNotFound {
						bit: bit.label(),
						selector: name.to_string(),
					})
				}
			}
		}
	}
}

fn by_index(bit: &Bit, index: i64) -> BitsResult<PresetChoice<'_>> {
	let presets = bit.presets();
	usize::try_from(index)
		.ok()
		.filter(|index| *index >= 1)
		.and_then(|index| presets.get(index - 1))
		.map(PresetChoice::Declared)
		.ok_or_else(|| {
			BitsError::PresetOutOfRange {
				bit: bit.label(),
				index,
				count: presets.len(),
			}
		})
}

/// The merged, overridden `{context, queries, compose}` tree of a declared
/// preset, before any query runs.
///
/// The preset's queries are deep-merged onto the bit's default queries with
/// lists replaced wholesale (or replace them outright under
/// `merge: {queries: replace}`), and the preset's overrides are applied to
/// the result.
pub fn preset_tree(bit: &Bit, preset: &PresetDecl) -> BitsResult<Value> {
	let defaults = bit.defaults_spec();
	let selector = preset.display_name().unwrap_or_default();

	let overlay = |section: &str, base: &Map<String, Value>, own: &Map<String, Value>| {
		preset.merge.policy(section).map(|policy| {
			match policy {
				MergePolicy::Replace => own.clone(),
				MergePolicy::Merge => {
					let mut merged = base.clone();
					merge_maps(&mut merged, own.clone(), ListMerge::Replace);
					merged
				}
			}
		})
	};

	let queries = overlay("queries", &defaults.queries, &preset.queries)?;
	let compose = overlay("compose", &defaults.compose, &preset.compose)?;

	if !preset.overrides.is_empty() && queries.is_empty() {
		return Err(BitsError::PresetOverridesWithoutQueries {
			bit: bit.label(),
			selector,
		});
	}

	let mut tree = Map::new();
	tree.insert("context".to_string(), Value::Object(preset.context.clone()));
	tree.insert("queries".to_string(), Value::Object(queries));
	tree.insert("compose".to_string(), Value::Object(compose));
	let mut tree = Value::Object(tree);

	apply_overrides(&mut tree, &preset.overrides)?;
	Ok(tree)
}

fn section(tree: &Value, key: &str) -> Map<String, Value> {
	tree.get(key)
		.and_then(Value::as_object)
		.cloned()
		.unwrap_or_default()
}

/// Resolve the overlay a selector produces for `bit`.
pub(crate) fn resolve_preset(
	resolver: &Resolver<'_>,
	bit: &Arc<Bit>,
	selector: Option<&PresetSelector>,
) -> BitsResult<Context> {
	let preset = match choose_preset(bit, selector)? {
		PresetChoice::Defaults => return resolver.bit_defaults(bit),
		PresetChoice::Declared(preset) => preset,
	};

	let index = bit
		.presets()
		.iter()
		.position(|candidate| std::ptr::eq(candidate, preset));
	let label = preset
		.display_name()
		.or_else(|| index.map(|index| format!("#{}", index + 1)))
		.unwrap_or_default();
	let resolve = || -> BitsResult<Context> {
		let tree = preset_tree(bit, preset)?;
		let mut context = resolver.resolve_context(&section(&tree, "context"))?;
		let variables = resolver.resolve_queries(&section(&tree, "queries"), &section(&tree, "compose"))?;
		merge_context(&mut context, variables);
		Ok(context)
	};

	let frame = format!("{}[{label}]", bit.label());
	resolver.within_preset(bit, index, frame, resolve).map_err(|e| {
		e.context(format!(
			"could not resolve preset `{label}` of bit `{}`",
			bit.label()
		))
	})
}
