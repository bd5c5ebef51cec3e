//! Combining named query results into template variables.
//!
//! Every query name produces one result: a flat list for a single spec, or a
//! list of groups when the name holds several specs. A `compose` entry with
//! the same name shapes that result; entries with `from` aggregate earlier
//! outputs (or raw results) into a new variable.
//!
//! Per entry the pipeline is: flatten (concat or interleave), dedupe,
//! shuffle, limit. With `flatten: false` the groups are kept, dedupe works
//! across all groups and shuffle/limit act on the groups themselves.

use std::collections::HashSet;
use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::str::FromStr;

use indexmap::IndexMap;
use rand::seq::SliceRandom;

use crate::BitsError;
use crate::BitsResult;
use crate::context::Context;
use crate::context::ContextValue;
use crate::model::ComposeSpec;
use crate::query::rng_for;

/// What one query name produced.
#[derive(Debug, Clone)]
pub enum QueryResult {
	Single(Vec<ContextValue>),
	Multi(Vec<Vec<ContextValue>>),
}

impl QueryResult {
	fn groups(&self) -> Vec<Vec<ContextValue>> {
		match self {
			Self::Single(items) => vec![items.clone()],
			Self::Multi(groups) => groups.clone(),
		}
	}

	fn is_multi(&self) -> bool {
		matches!(self, Self::Multi(_))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
	#[default]
	Concat,
	/// Round-robin across groups.
	Interleave,
}

impl FromStr for MergeMode {
	type Err = BitsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"concat" => Ok(Self::Concat),
			"interleave" => Ok(Self::Interleave),
			other => Err(BitsError::UnknownMergeMode(other.to_string())),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedupe {
	ById,
	ByName,
	ByHash,
}

impl FromStr for Dedupe {
	type Err = BitsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"by:id" | "id" => Ok(Self::ById),
			"by:name" | "name" => Ok(Self::ByName),
			"by:hash" | "hash" => Ok(Self::ByHash),
			other => Err(BitsError::UnknownDedupe(other.to_string())),
		}
	}
}

impl Dedupe {
	/// Key of an item, `None` when the item can never be a duplicate.
	fn key(self, item: &ContextValue) -> Option<String> {
		match self {
			Self::ById => {
				item.element_id()
					.map(|id| id.to_string())
					.or_else(|| Some(item.fingerprint()))
			}
			Self::ByName => item.element_name().map(ToString::to_string),
			Self::ByHash => {
				let mut hasher = DefaultHasher::new();
				item.fingerprint().hash(&mut hasher);
				Some(format!("{:016x}", hasher.finish()))
			}
		}
	}
}

/// Flatten groups into one list.
pub fn merge_groups(groups: Vec<Vec<ContextValue>>, mode: MergeMode) -> Vec<ContextValue> {
	match mode {
		MergeMode::Concat => groups.into_iter().flatten().collect(),
		MergeMode::Interleave => {
			let longest = groups.iter().map(Vec::len).max().unwrap_or(0);
			let mut merged = Vec::with_capacity(groups.iter().map(Vec::len).sum());
			for index in 0..longest {
				for group in &groups {
					if let Some(item) = group.get(index) {
						merged.push(item.clone());
					}
				}
			}
			merged
		}
	}
}

fn dedupe_list(items: Vec<ContextValue>, dedupe: Dedupe, seen: &mut HashSet<String>) -> Vec<ContextValue> {
	items
		.into_iter()
		.filter(|item| dedupe.key(item).is_none_or(|key| seen.insert(key)))
		.collect()
}

/// Output of one compose entry before it becomes a context value.
#[derive(Debug, Clone)]
enum Composed {
	Flat(Vec<ContextValue>),
	Grouped(Vec<Vec<ContextValue>>),
}

impl Composed {
	fn groups(&self) -> Vec<Vec<ContextValue>> {
		match self {
			Self::Flat(items) => vec![items.clone()],
			Self::Grouped(groups) => groups.clone(),
		}
	}

	fn into_value(self) -> ContextValue {
		match self {
			Self::Flat(items) => ContextValue::List(items),
			Self::Grouped(groups) => {
				ContextValue::List(groups.into_iter().map(ContextValue::List).collect())
			}
		}
	}
}

fn compose_one(groups: Vec<Vec<ContextValue>>, grouped: bool, spec: &ComposeSpec) -> BitsResult<Composed> {
	let mode = spec
		.merge
		.as_deref()
		.map(MergeMode::from_str)
		.transpose()?
		.unwrap_or_default();
	let dedupe = spec.dedupe.as_deref().map(Dedupe::from_str).transpose()?;
	let flatten = !grouped || spec.flatten.unwrap_or(true);
	let mut rng = spec.shuffle.then(|| rng_for(spec.seed));

	if flatten {
		let mut items = merge_groups(groups, mode);
		if let Some(dedupe) = dedupe {
			items = dedupe_list(items, dedupe, &mut HashSet::new());
		}
		if let Some(rng) = rng.as_mut() {
			items.shuffle(&mut **rng);
		}
		if let Some(limit) = spec.limit {
			items.truncate(limit);
		}
		return Ok(Composed::Flat(items));
	}

	let mut groups = groups;
	if let Some(dedupe) = dedupe {
		let mut seen = HashSet::new();
		groups = groups
			.into_iter()
			.map(|group| dedupe_list(group, dedupe, &mut seen))
			.collect();
	}
	if let Some(rng) = rng.as_mut() {
		groups.shuffle(&mut **rng);
	}
	if let Some(limit) = spec.limit {
		groups.truncate(limit);
	}

	Ok(Composed::Grouped(groups))
}

/// Compose query results into variables.
///
/// Plain entries are processed in query order, each producing the variable
/// named by `as` (default: the query name). Aggregate entries (`from`) run
/// afterwards in declaration order; a source name resolves to an earlier
/// composed output first, then to a raw result, and unresolved sources are
/// skipped.
pub fn compose(
	results: &IndexMap<String, QueryResult>,
	specs: &IndexMap<String, ComposeSpec>,
) -> BitsResult<Context> {
	let default_spec = ComposeSpec::default();
	let mut output = Context::new();
	let mut composed: IndexMap<String, Composed> = IndexMap::new();

	for (name, result) in results {
		let spec = specs
			.get(name)
			.filter(|spec| spec.from.is_none())
			.unwrap_or(&default_spec);
		let value = compose_one(result.groups(), result.is_multi(), spec)
			.map_err(|e| e.context(format!("could not compose `{name}`")))?;
		let alias = spec.alias.clone().unwrap_or_else(|| name.clone());

		output.insert(alias.clone(), value.clone().into_value());
		if alias != *name {
			composed.insert(alias, value.clone());
		}
		composed.insert(name.clone(), value);
	}

	for (name, spec) in specs {
		let Some(sources) = &spec.from else {
			if !results.contains_key(name) {
				tracing::debug!(compose = %name, "compose entry has no matching query");
			}
			continue;
		};

		let mut groups = Vec::new();
		for source in sources {
			if let Some(value) = composed.get(source) {
				groups.extend(value.groups());
			} else if let Some(result) = results.get(source) {
				groups.extend(result.groups());
			} else {
				tracing::warn!(compose = %name, source = %source, "skipping unknown compose source");
			}
		}

		let value = compose_one(groups, true, spec)
			.map_err(|e| e.context(format!("could not compose `{name}`")))?;
		let alias = spec.alias.clone().unwrap_or_else(|| name.clone());

		output.insert(alias.clone(), value.clone().into_value());
		if alias != *name {
			composed.insert(alias, value.clone());
		}
		composed.insert(name.clone(), value);
	}

	Ok(output)
}
