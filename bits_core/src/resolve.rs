//! Running queries during a registry load.
//!
//! A [`Resolver`] answers queries against the local collections, imported
//! registries or a registry named by the query itself. It binds matched bits
//! to presets and keeps the stack of presets being resolved, so a preset that
//! leads back to itself fails with a [`ReferenceError`] instead of recursing.

use std::borrow::Cow;
use std::cell::RefCell;
use std::iter;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Map;
use serde_json::Value;

use crate::BitsResult;
use crate::Collection;
use crate::ReferenceError;
use crate::bit::Bit;
use crate::bit::Block;
use crate::bit::DefaultsSpec;
use crate::bit::lift_legacy_queries;
use crate::compose::QueryResult;
use crate::compose::compose;
use crate::constant::Constant;
use crate::context::Context;
use crate::context::ContextValue;
use crate::context::context_from_map;
use crate::context::merge_context;
use crate::element::Element;
use crate::element::ElementId;
use crate::model::ComposeSpec;
use crate::model::QueryEntry;
use crate::model::QueryKind;
use crate::model::QuerySpec;
use crate::preset::resolve_preset;
use crate::query::matching;
use crate::registry::LoadMode;
use crate::registry::Registry;
use crate::registry::RegistryStore;
use crate::registry::locate_registry;

/// Query resolution for one registry load.
///
/// Holds the collections being built, the registry stack of the current
/// load (for import cycle detection) and the dependencies loaded so far.
pub(crate) struct Resolver<'a> {
	path: &'a Path,
	bits: &'a Collection<Bit>,
	constants: &'a Collection<Constant>,
	store: &'a RegistryStore,
	stack: &'a [PathBuf],
	dependencies: RefCell<IndexMap<PathBuf, Arc<Registry>>>,
	presets: RefCell<Vec<PresetFrame>>,
}

/// One bit preset being resolved. `preset` is the index into the bit's
/// declared presets, `None` for its defaults.
struct PresetFrame {
	bit: ElementId,
	preset: Option<usize>,
	label: String,
}

impl<'a> Resolver<'a> {
	pub(crate) fn new(
		path: &'a Path,
		bits: &'a Collection<Bit>,
		constants: &'a Collection<Constant>,
		store: &'a RegistryStore,
		stack: &'a [PathBuf],
		dependencies: IndexMap<PathBuf, Arc<Registry>>,
	) -> Self {
		Self {
			path,
			bits,
			constants,
			store,
			stack,
			dependencies: RefCell::new(dependencies),
			presets: RefCell::new(Vec::new()),
		}
	}

	pub(crate) fn path(&self) -> &Path {
		self.path
	}

	/// Every registry loaded as a dependency so far, in load order.
	pub(crate) fn dependency_paths(&self) -> Vec<PathBuf> {
		self.dependencies.borrow().keys().cloned().collect()
	}

	/// Load `path` as a dependency, once per load.
	pub(crate) fn dependency(&self, path: &Path) -> BitsResult<Arc<Registry>> {
		if let Some(registry) = self.dependencies.borrow().get(path).cloned() {
			return Ok(registry);
		}

		check_import_cycle(self.stack, path)?;
		let registry = self.store.load(path, LoadMode::Dependency, self.stack)?;
		self.dependencies
			.borrow_mut()
			.insert(path.to_path_buf(), registry.clone());
		Ok(registry)
	}

	fn bits_for(&self, registry: Option<&str>) -> BitsResult<Cow<'a, Collection<Bit>>> {
		let Some(reference) = registry else {
			return Ok(Cow::Borrowed(self.bits));
		};

		let path = locate_registry(self.path, reference)?;
		if path == self.path {
			return Ok(Cow::Borrowed(self.bits));
		}

		Ok(Cow::Owned(self.dependency(&path)?.bits()))
	}

	fn constants_for(&self, registry: Option<&str>) -> BitsResult<Cow<'a, Collection<Constant>>> {
		let Some(reference) = registry else {
			return Ok(Cow::Borrowed(self.constants));
		};

		let path = locate_registry(self.path, reference)?;
		if path == self.path {
			return Ok(Cow::Borrowed(self.constants));
		}

		Ok(Cow::Owned(self.dependency(&path)?.constants()))
	}

	/// Run every query of `queries` and compose the results.
	pub(crate) fn resolve_queries(
		&self,
		queries: &Map<String, Value>,
		compose_specs: &Map<String, Value>,
	) -> BitsResult<Context> {
		let mut results = IndexMap::new();

		for (name, entry) in queries {
			let result = self
				.run_query(name, entry)
				.map_err(|e| e.context(format!("could not resolve query `{name}`")))?;
			results.insert(name.clone(), result);
		}

		if results.is_empty() && compose_specs.is_empty() {
			return Ok(Context::new());
		}

		compose(&results, &ComposeSpec::parse_map(compose_specs)?)
	}

	fn run_query(&self, name: &str, entry: &Value) -> BitsResult<QueryResult> {
		let entry = QueryEntry::parse(name, entry)?;
		let mut groups = Vec::with_capacity(entry.specs().len());

		for spec in entry.specs() {
			let items = match QueryKind::for_query(name, spec.kind) {
				QueryKind::Bits => {
					self.blocks(spec)?
						.into_iter()
						.map(ContextValue::Block)
						.collect()
				}
				QueryKind::Constants => {
					self.constants(spec)?
						.into_iter()
						.map(ContextValue::Constant)
						.collect()
				}
			};
			groups.push(items);
		}

		Ok(if entry.is_grouped() {
			QueryResult::Multi(groups)
		} else {
			QueryResult::Single(groups.into_iter().next().unwrap_or_default())
		})
	}

	/// Matched bits bound to their contexts.
	///
	/// Each block's context layers, lowest first: the preset overlay, the
	/// query's own `context`, `with.context`, then variables produced by
	/// `with.queries`.
	pub(crate) fn blocks(&self, spec: &QuerySpec) -> BitsResult<Vec<Arc<Block>>> {
		let bits = self.bits_for(spec.registry.as_deref())?;
		let matched = matching(&bits, spec)?;
		if matched.is_empty() {
			return Ok(Vec::new());
		}

		let query_context = self.resolve_context(&spec.context)?;
		let (with_context, with_variables) = match &spec.with_clause {
			Some(with) => {
				(
					self.resolve_context(&with.context)?,
					self.resolve_queries(&with.queries, &Map::new())?,
				)
			}
			None => (Context::new(), Context::new()),
		};

		matched
			.into_iter()
			.map(|bit| {
				let mut context = resolve_preset(self, &bit, spec.preset.as_ref())?;
				merge_context(&mut context, query_context.clone());
				merge_context(&mut context, with_context.clone());
				merge_context(&mut context, with_variables.clone());
				Ok(Arc::new(Block::new(bit, context, spec.metadata.clone())))
			})
			.collect()
	}

	pub(crate) fn constants(&self, spec: &QuerySpec) -> BitsResult<Vec<Arc<Constant>>> {
		let constants = self.constants_for(spec.registry.as_deref())?;
		matching(&constants, spec)
	}

	/// Resolve a context map; legacy `blocks`/`constants` entries run as
	/// queries and their variables are merged on top of the static values.
	pub(crate) fn resolve_context(&self, context: &Map<String, Value>) -> BitsResult<Context> {
		let mut queries = Map::new();
		let static_context = lift_legacy_queries(context.clone(), &mut queries);
		let mut resolved = context_from_map(static_context);

		if !queries.is_empty() {
			merge_context(&mut resolved, self.resolve_queries(&queries, &Map::new())?);
		}

		Ok(resolved)
	}

	/// The bit's resolved defaults, computing them on first use.
	pub(crate) fn bit_defaults(&self, bit: &Arc<Bit>) -> BitsResult<Context> {
		if let Some(resolved) = bit.resolved_defaults() {
			return Ok(resolved.clone());
		}

		let resolved = self
			.within_preset(bit, None, bit.label(), || self.resolve_defaults(bit.defaults_spec()))
			.map_err(|e| e.context(format!("could not resolve defaults of bit `{}`", bit.label())))?;
		bit.set_resolved_defaults(resolved.clone());
		Ok(resolved)
	}

	/// Run `resolve` with `(bit, preset)` on the resolution stack. Entering a
	/// pair that is already on the stack is a cycle.
	pub(crate) fn within_preset<T>(
		&self,
		bit: &Bit,
		preset: Option<usize>,
		label: String,
		resolve: impl FnOnce() -> BitsResult<T>,
	) -> BitsResult<T> {
		{
			let mut stack = self.presets.borrow_mut();
			if let Some(position) = stack
				.iter()
				.position(|frame| frame.bit == bit.id() && frame.preset == preset)
			{
				let chain = stack[position..]
					.iter()
					.map(|frame| frame.label.clone())
					.chain(iter::once(label))
					.collect::<Vec<_>>()
					.join(" -> ");
				let error = match preset {
					None => ReferenceError::DefaultsCycle { chain },
					Some(_) => ReferenceError::PresetCycle { chain },
				};
				return Err(error.into());
			}
			stack.push(PresetFrame {
				bit: bit.id(),
				preset,
				label,
			});
		}

		let result = resolve();
		self.presets.borrow_mut().pop();
		result
	}

	fn resolve_defaults(&self, defaults: &DefaultsSpec) -> BitsResult<Context> {
		let mut context = context_from_map(defaults.context.clone());
		let variables = self.resolve_queries(&defaults.queries, &defaults.compose)?;
		merge_context(&mut context, variables);
		Ok(context)
	}
}

/// Fail when `path` is already being loaded further up the stack.
pub(crate) fn check_import_cycle(stack: &[PathBuf], path: &Path) -> BitsResult<()> {
	let Some(position) = stack.iter().position(|visited| visited == path) else {
		return Ok(());
	};

	let chain = stack[position..]
		.iter()
		.map(PathBuf::as_path)
		.chain(iter::once(path))
		.map(|path| path.display().to_string())
		.collect::<Vec<_>>()
		.join(" -> ");

	Err(ReferenceError::ImportCycle { chain }.into())
}
