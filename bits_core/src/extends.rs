//! Target inheritance.
//!
//! A target names zero or more bases in `extends`, either local (`Base`) or
//! in another registry (`shared/targets.yaml::Base`). Bases fold left to
//! right: each is deep-merged onto the accumulator (lists index-wise) and its
//! own overrides are applied right after. The derived target's sections are
//! then merged on top, honouring its `merge` policy, and its overrides are
//! applied last.
//!
//! Every `(file, name)` key is resolved at most once per load. Keys being
//! resolved sit on a visit stack, and meeting one of them again is reported
//! as a cycle with the whole chain.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use serde_json::Map;
use serde_json::Value;

use crate::BitsResult;
use crate::ReferenceError;
use crate::bit::lift_legacy_queries;
use crate::model::MergePolicy;
use crate::model::OverrideDecl;
use crate::model::TargetDecl;
use crate::value::ListMerge;
use crate::value::apply_overrides;
use crate::value::merge_into;

/// Separates a registry path from a target name in `extends`.
pub const CROSS_FILE_SEPARATOR: &str = "::";

const SECTIONS: [&str; 3] = ["context", "queries", "compose"];

/// Where the resolver finds target declarations.
pub trait TargetSource {
	/// The declaration of `name` in the registry at `file`.
	fn declaration(&self, file: &Path, name: &str) -> BitsResult<Option<TargetDecl>>;

	/// Resolve a registry reference written in `from`.
	fn locate(&self, from: &Path, reference: &str) -> BitsResult<PathBuf>;
}

/// Identity of a declared target during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
	pub file: PathBuf,
	pub name: String,
}

impl fmt::Display for TargetKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let file = self
			.file
			.file_name()
			.map_or_else(|| self.file.display().to_string(), |name| name.to_string_lossy().to_string());
		write!(f, "{file}{CROSS_FILE_SEPARATOR}{}", self.name)
	}
}

/// A merged target spec: the shape a non-extending target declares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetSpec {
	pub template: Option<String>,
	pub dest: Option<String>,
	pub context: Map<String, Value>,
	pub queries: Map<String, Value>,
	pub compose: Map<String, Value>,
}

impl TargetSpec {
	/// Normalize a declaration: legacy `context.blocks`/`context.constants`
	/// are lifted into `queries`.
	pub fn from_decl(decl: &TargetDecl) -> Self {
		let mut queries = decl.queries.clone();
		let context = lift_legacy_queries(decl.context.clone(), &mut queries);
		Self {
			template: decl.template.clone(),
			dest: decl.dest.clone(),
			context,
			queries,
			compose: decl.compose.clone(),
		}
	}

	fn into_tree(self) -> Value {
		let mut tree = Map::new();
		if let Some(template) = self.template {
			tree.insert("template".to_string(), Value::String(template));
		}
		if let Some(dest) = self.dest {
			tree.insert("dest".to_string(), Value::String(dest));
		}
		tree.insert("context".to_string(), Value::Object(self.context));
		tree.insert("queries".to_string(), Value::Object(self.queries));
		tree.insert("compose".to_string(), Value::Object(self.compose));
		Value::Object(tree)
	}

	fn from_tree(tree: Value) -> Self {
		let Value::Object(mut tree) = tree else {
			return Self::default();
		};
		let mut take_map = |key: &str| {
			match tree.shift_remove(key) {
				Some(Value::Object(map)) => map,
				_ => Map::new(),
			}
		};
		let context = take_map("context");
		let queries = take_map("queries");
		let compose = take_map("compose");
		let take_string = |value: Option<Value>| {
			match value {
				Some(Value::String(text)) => Some(text),
				_ => None,
			}
		};

		Self {
			template: take_string(tree.shift_remove("template")),
			dest: take_string(tree.shift_remove("dest")),
			context,
			queries,
			compose,
		}
	}
}

fn empty_tree() -> Value {
	TargetSpec::default().into_tree()
}

/// Resolves `extends` chains for one registry load.
pub struct ExtendsResolver<'a, S: TargetSource> {
	source: &'a S,
	stack: Vec<TargetKey>,
	resolved: HashMap<TargetKey, (Value, Vec<OverrideDecl>)>,
}

impl<'a, S: TargetSource> ExtendsResolver<'a, S> {
	pub fn new(source: &'a S) -> Self {
		Self {
			source,
			stack: Vec::new(),
			resolved: HashMap::new(),
		}
	}

	/// Resolve a target declared in `file`, including its own overrides.
	pub fn resolve(&mut self, file: &Path, decl: &TargetDecl) -> BitsResult<TargetSpec> {
		let key = decl.name.as_ref().map(|name| {
			TargetKey {
				file: file.to_path_buf(),
				name: name.clone(),
			}
		});

		if let Some(key) = &key {
			self.enter(key)?;
		}
		let result = self.fold(file, decl).and_then(|mut tree| {
			apply_overrides(&mut tree, &decl.overrides)?;
			Ok(tree)
		});
		if key.is_some() {
			self.stack.pop();
		}

		result.map(TargetSpec::from_tree)
	}

	fn enter(&mut self, key: &TargetKey) -> BitsResult<()> {
		if let Some(position) = self.stack.iter().position(|visited| visited == key) {
			let chain = self.stack[position..]
				.iter()
				.chain(std::iter::once(key))
				.map(ToString::to_string)
				.collect::<Vec<_>>()
				.join(" -> ");
			return Err(ReferenceError::TargetCycle { chain }.into());
		}

		self.stack.push(key.clone());
		Ok(())
	}

	fn key_for(&self, from: &Path, reference: &str) -> BitsResult<TargetKey> {
		match reference.rsplit_once(CROSS_FILE_SEPARATOR) {
			Some((file, name)) => {
				Ok(TargetKey {
					file: self.source.locate(from, file.trim())?,
					name: name.trim().to_string(),
				})
			}
			None => {
				Ok(TargetKey {
					file: from.to_path_buf(),
					name: reference.trim().to_string(),
				})
			}
		}
	}

	/// A base's merged spec without its own overrides, plus those overrides.
	fn base(
		&mut self,
		from: &Path,
		derived: &str,
		reference: &str,
	) -> BitsResult<(Value, Vec<OverrideDecl>)> {
		let key = self.key_for(from, reference)?;
		if let Some(resolved) = self.resolved.get(&key) {
			return Ok(resolved.clone());
		}

		self.enter(&key)?;
		let result = self.load_base(&key, derived, reference);
		self.stack.pop();

		let resolved = result?;
		self.resolved.insert(key, resolved.clone());
		Ok(resolved)
	}

	fn load_base(
		&mut self,
		key: &TargetKey,
		derived: &str,
		reference: &str,
	) -> BitsResult<(Value, Vec<OverrideDecl>)> {
		let decl = self.source.declaration(&key.file, &key.name)?.ok_or_else(|| {
			ReferenceError::MissingBase {
				target: derived.to_string(),
				base: reference.to_string(),
				file: key.file.display().to_string(),
			}
		})?;

		tracing::debug!(base = %key, target = derived, "resolving base target");
		let tree = self.fold(&key.file, &decl)?;
		Ok((tree, decl.overrides))
	}

	/// Fold the bases of `decl` and merge its own sections on top. The
	/// declaration's overrides are not applied.
	fn fold(&mut self, file: &Path, decl: &TargetDecl) -> BitsResult<Value> {
		let derived = decl.name.clone().unwrap_or_else(|| "<unnamed>".to_string());
		let mut tree = empty_tree();

		for reference in decl.bases() {
			let (base, overrides) = self.base(file, &derived, reference)?;
			merge_into(&mut tree, base, ListMerge::IndexWise);
			apply_overrides(&mut tree, &overrides)?;
		}

		let own = TargetSpec::from_decl(decl).into_tree();
		let Value::Object(own) = own else {
			return Ok(tree);
		};
		let Some(accumulated) = tree.as_object_mut() else {
			return Ok(tree);
		};

		for (key, value) in own {
			let policy = if SECTIONS.contains(&key.as_str()) {
				decl.merge.policy(&key)?
			} else {
				MergePolicy::Replace
			};

			match (policy, accumulated.get_mut(&key)) {
				(MergePolicy::Merge, Some(existing)) => merge_into(existing, value, ListMerge::IndexWise),
				_ => {
					accumulated.insert(key, value);
				}
			}
		}

		Ok(tree)
	}
}
