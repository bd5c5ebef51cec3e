//! Registries: one source file's bits, constants and targets, tied to the
//! registries it imports.
//!
//! A [`RegistryStore`] memoizes registries by canonical path. Every call to
//! [`RegistryStore::get`] starts a new load generation and rebuilds the
//! requested registry; dependencies reached during that load are built at
//! most once per generation, so a registry imported along two paths shares
//! its bits with both importers.
//!
//! A load is all-or-nothing. When a rebuild fails the registry is marked
//! [`LoadStatus::Failed`] and keeps serving the collections of its last
//! successful load.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use indexmap::IndexMap;

use crate::BitsError;
use crate::BitsResult;
use crate::Collection;
use crate::bit::Bit;
use crate::compiler::Artifact;
use crate::compiler::CompileOptions;
use crate::compiler::DocumentCompiler;
use crate::config::BitsConfig;
use crate::constant::Constant;
use crate::context::merge_context;
use crate::document;
use crate::element::Element;
use crate::extends::ExtendsResolver;
use crate::extends::TargetSource;
use crate::model::RegistryDocument;
use crate::model::TargetDecl;
use crate::resolve::Resolver;
use crate::resolve::check_import_cycle;
use crate::target::Target;
use crate::target::destination_for;
use crate::template::TemplateEngine;

/// File names looked up, in order, when a registry path is a directory.
pub const REGISTRY_INDEX_CANDIDATES: [&str; 4] = ["index.yml", "index.yaml", "index.md", "bits.yml"];

/// Normalize a registry path: canonicalize it and, for a directory, pick the
/// first index file that exists.
pub fn resolve_registry_path(path: &Path) -> BitsResult<PathBuf> {
	let not_found = || {
		BitsError::RegistryNotFound {
			path: path.display().to_string(),
		}
	};

	let canonical = path.canonicalize().map_err(|_| not_found())?;
	if !canonical.is_dir() {
		return Ok(canonical);
	}

	REGISTRY_INDEX_CANDIDATES
		.iter()
		.map(|candidate| canonical.join(candidate))
		.find(|candidate| candidate.is_file())
		.ok_or_else(not_found)
}

/// Resolve `reference` against the directory of `base_file`. A leading `~/`
/// expands to the home directory.
pub(crate) fn relative_to(base_file: &Path, reference: &str) -> PathBuf {
	if let Some(rest) = reference.strip_prefix("~/") {
		if let Some(home) = std::env::var_os("HOME") {
			return PathBuf::from(home).join(rest);
		}
	}

	let reference = Path::new(reference);
	if reference.is_absolute() {
		return reference.to_path_buf();
	}

	base_file
		.parent()
		.map_or_else(|| reference.to_path_buf(), |dir| dir.join(reference))
}

/// Locate the registry `reference` points to from the file `from`.
pub(crate) fn locate_registry(from: &Path, reference: &str) -> BitsResult<PathBuf> {
	resolve_registry_path(&relative_to(from, reference))
}

/// How much of a registry a load builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
	/// Bits, constants and targets.
	Full,
	/// Bits and constants only; used for imports.
	Dependency,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadStatus {
	#[default]
	Unloaded,
	Loading,
	Loaded,
	/// The last load failed; the collections are from the load before it.
	Failed,
}

#[derive(Debug, Default)]
struct RegistryState {
	status: LoadStatus,
	generation: u64,
	/// Mode of the last successful load.
	mode: Option<LoadMode>,
	document: Option<RegistryDocument>,
	bits: Collection<Bit>,
	constants: Collection<Constant>,
	targets: Collection<Target>,
	dependencies: Vec<PathBuf>,
}

/// Everything one successful load produces.
struct Built {
	document: RegistryDocument,
	bits: Collection<Bit>,
	constants: Collection<Constant>,
	targets: Collection<Target>,
	dependencies: Vec<PathBuf>,
}

/// One registry file and its resolved elements.
#[derive(Debug)]
pub struct Registry {
	path: PathBuf,
	/// Held for a whole load or render.
	load_lock: Mutex<()>,
	state: Mutex<RegistryState>,
}

impl Registry {
	fn new(path: PathBuf) -> Self {
		Self {
			path,
			load_lock: Mutex::new(()),
			state: Mutex::new(RegistryState::default()),
		}
	}

	fn state(&self) -> MutexGuard<'_, RegistryState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn status(&self) -> LoadStatus {
		self.state().status
	}

	/// Local bits followed by imported ones, in import order.
	pub fn bits(&self) -> Collection<Bit> {
		self.state().bits.clone()
	}

	pub fn constants(&self) -> Collection<Constant> {
		self.state().constants.clone()
	}

	/// Resolved targets. Empty for registries loaded as a dependency.
	pub fn targets(&self) -> Collection<Target> {
		self.state().targets.clone()
	}

	/// Canonical paths of every registry this one imported or extended from.
	pub fn dependencies(&self) -> Vec<PathBuf> {
		self.state().dependencies.clone()
	}

	/// The parsed source of the last successful load.
	pub fn document(&self) -> Option<RegistryDocument> {
		self.state().document.clone()
	}

	/// The raw declaration of a target, before `extends` is resolved.
	pub fn declared_target(&self, name: &str) -> Option<TargetDecl> {
		self.state()
			.document
			.as_ref()
			.and_then(|document| document.target(name).cloned())
	}

	/// A resolved target by name.
	pub fn target(&self, name: &str) -> Option<Arc<Target>> {
		self.state().targets.find_by_name(name)
	}

	/// Rebuild from the source file, e.g. after it changed on disk.
	pub fn reload(&self, store: &RegistryStore) -> BitsResult<()> {
		let generation = store.next_generation();
		self.load(store, LoadMode::Full, &[], generation)
	}

	fn is_current(&self, generation: u64) -> bool {
		let state = self.state();
		state.status == LoadStatus::Loaded && state.generation == generation
	}

	fn load(
		&self,
		store: &RegistryStore,
		mode: LoadMode,
		stack: &[PathBuf],
		generation: u64,
	) -> BitsResult<()> {
		let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
		// Reached as an import after a full load: keep building targets so
		// earlier handles do not lose them.
		let mode = match (mode, self.state().mode) {
			(LoadMode::Dependency, Some(LoadMode::Full)) => LoadMode::Full,
			_ => mode,
		};
		self.state().status = LoadStatus::Loading;
		tracing::debug!(path = %self.path.display(), ?mode, "loading registry");

		match build(&self.path, store, mode, stack) {
			Ok(built) => {
				let mut state = self.state();
				state.status = LoadStatus::Loaded;
				state.generation = generation;
				state.mode = Some(mode);
				state.document = Some(built.document);
				state.bits = built.bits;
				state.constants = built.constants;
				state.targets = built.targets;
				state.dependencies = built.dependencies;
				Ok(())
			}
			Err(error) => {
				self.state().status = LoadStatus::Failed;
				tracing::debug!(path = %self.path.display(), "registry load failed");
				Err(BitsError::RegistryLoad {
					path: self.path.display().to_string(),
					source: Box::new(error),
				})
			}
		}
	}

	/// Render and compile every target, in declaration order.
	pub fn render(
		&self,
		engine: &TemplateEngine,
		compiler: &dyn DocumentCompiler,
		options: &CompileOptions,
	) -> BitsResult<Vec<Artifact>> {
		let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
		let targets = self.targets();
		targets
			.iter()
			.map(|target| target.render(engine, compiler, options))
			.collect()
	}

	/// Write the parsed source to `path`, in the format its extension names.
	pub fn dump(&self, path: &Path) -> BitsResult<()> {
		let document = self.document().ok_or_else(|| {
			BitsError::RegistryNotFound {
				path: self.path.display().to_string(),
			}
		})?;
		document::dump(&document, path)
	}
}

/// Add `items` that are not already present. Diamond imports reach the same
/// elements twice.
fn absorb<T: Element>(collection: &mut Collection<T>, items: Collection<T>) -> BitsResult<()> {
	for item in items {
		if !collection.contains_id(item.id()) {
			collection.push(item)?;
		}
	}

	Ok(())
}

fn build(path: &Path, store: &RegistryStore, mode: LoadMode, stack: &[PathBuf]) -> BitsResult<Built> {
	let document = document::parse_file(path, &store.config().variables)?;
	let mut stack = stack.to_vec();
	stack.push(path.to_path_buf());

	let mut bits = Collection::new();
	for decl in document.bits.iter().cloned() {
		bits.push(Arc::new(Bit::from_decl(decl, &document.tags)?))?;
	}
	let local_bits = bits.clone();

	let mut constants = Collection::new();
	for decl in document.constants.iter().cloned() {
		constants.push(Arc::new(Constant::from_decl(decl, &document.tags)))?;
	}

	let mut targets = Collection::new();
	let mut imports = IndexMap::new();
	for import in &document.imports {
		let import_path = locate_registry(path, &import.registry)?;
		if imports.contains_key(&import_path) {
			tracing::warn!(
				registry = %path.display(),
				import = %import.registry,
				"skipping duplicate import"
			);
			continue;
		}

		check_import_cycle(&stack, &import_path)?;
		let registry = store.load(&import_path, LoadMode::Dependency, &stack)?;
		absorb(&mut bits, registry.bits())?;
		absorb(&mut constants, registry.constants())?;
		absorb(&mut targets, registry.targets())?;
		imports.insert(import_path, registry);
	}

	let resolver = Resolver::new(path, &bits, &constants, store, &stack, imports);
	for bit in &local_bits {
		resolver.bit_defaults(bit)?;
	}

	if mode == LoadMode::Full {
		let source = RegistryTargets {
			resolver: &resolver,
			document: &document,
		};
		let mut extends = ExtendsResolver::new(&source);
		let mut local_targets = Collection::new();

		for decl in &document.targets {
			let name = decl.name.as_deref().unwrap_or("<unnamed>");
			let target = build_target(&resolver, &mut extends, store.config(), &document, decl)
				.map_err(|e| e.context(format!("could not resolve target `{name}`")))?;
			local_targets.push(Arc::new(target))?;
		}

		let imported = std::mem::replace(&mut targets, local_targets);
		absorb(&mut targets, imported)?;
	}

	let dependencies = resolver.dependency_paths();
	Ok(Built {
		document,
		bits,
		constants,
		targets,
		dependencies,
	})
}

fn build_target<S: TargetSource>(
	resolver: &Resolver<'_>,
	extends: &mut ExtendsResolver<'_, S>,
	config: &BitsConfig,
	document: &RegistryDocument,
	decl: &TargetDecl,
) -> BitsResult<Target> {
	let path = resolver.path();
	let label = decl.name.clone().unwrap_or_else(|| "target".to_string());
	let spec = extends.resolve(path, decl)?;

	let mut context = resolver.resolve_context(&spec.context)?;
	merge_context(&mut context, resolver.resolve_queries(&spec.queries, &spec.compose)?);

	let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
	let template = spec
		.template
		.map(|template| directory.join(template))
		.or_else(|| config.defaults.template.clone())
		.ok_or_else(|| BitsError::MissingTemplate { target: label.clone() })?;

	let dest_dir = spec
		.dest
		.map(|dest| directory.join(dest))
		.or_else(|| config.defaults.dest.clone())
		.unwrap_or_else(|| directory.clone());
	let dest = destination_for(&dest_dir, path, &label)?;

	let mut tags = decl.tags.clone();
	tags.extend(document.tags.iter().cloned());

	tracing::debug!(target_name = %label, template = %template.display(), "resolved target");
	Ok(Target::new(decl.name.clone(), tags, template, context, dest))
}

/// Target declarations seen from one registry load: the file being loaded
/// answers from its parsed document, other files from their dependency
/// registries.
struct RegistryTargets<'r, 'a> {
	resolver: &'r Resolver<'a>,
	document: &'r RegistryDocument,
}

impl TargetSource for RegistryTargets<'_, '_> {
	fn declaration(&self, file: &Path, name: &str) -> BitsResult<Option<TargetDecl>> {
		if file == self.resolver.path() {
			return Ok(self.document.target(name).cloned());
		}

		Ok(self.resolver.dependency(file)?.declared_target(name))
	}

	fn locate(&self, from: &Path, reference: &str) -> BitsResult<PathBuf> {
		locate_registry(from, reference)
	}
}

/// Process-wide registry cache keyed by canonical path.
#[derive(Debug, Default)]
pub struct RegistryStore {
	config: BitsConfig,
	registries: Mutex<HashMap<PathBuf, Arc<Registry>>>,
	generation: AtomicU64,
}

impl RegistryStore {
	pub fn new(config: BitsConfig) -> Self {
		Self {
			config,
			registries: Mutex::default(),
			generation: AtomicU64::new(0),
		}
	}

	pub fn config(&self) -> &BitsConfig {
		&self.config
	}

	/// Load (or reload) the registry at `path` with its targets. The same
	/// path always yields the same instance.
	pub fn get(&self, path: &Path) -> BitsResult<Arc<Registry>> {
		let path = resolve_registry_path(path)?;
		let registry = self.entry(&path);
		registry.reload(self)?;
		Ok(registry)
	}

	/// The registry for `path` if it was ever requested, without loading it.
	pub fn cached(&self, path: &Path) -> Option<Arc<Registry>> {
		let path = resolve_registry_path(path).ok()?;
		self.registries().get(&path).cloned()
	}

	/// `path` and every registry it depends on, transitively, for watching.
	pub fn watch_paths(&self, path: &Path) -> Vec<PathBuf> {
		let Ok(root) = resolve_registry_path(path) else {
			return vec![path.to_path_buf()];
		};

		let mut seen = vec![root.clone()];
		let mut pending = vec![root];
		while let Some(current) = pending.pop() {
			let Some(registry) = self.registries().get(&current).cloned() else {
				continue;
			};
			for dependency in registry.dependencies() {
				if !seen.contains(&dependency) {
					seen.push(dependency.clone());
					pending.push(dependency);
				}
			}
		}

		seen
	}

	pub(crate) fn load(&self, path: &Path, mode: LoadMode, stack: &[PathBuf]) -> BitsResult<Arc<Registry>> {
		let registry = self.entry(path);
		let generation = self.generation.load(Ordering::SeqCst);
		if registry.is_current(generation) {
			return Ok(registry);
		}

		registry.load(self, mode, stack, generation)?;
		Ok(registry)
	}

	fn next_generation(&self) -> u64 {
		self.generation.fetch_add(1, Ordering::SeqCst) + 1
	}

	fn registries(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<Registry>>> {
		self.registries.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn entry(&self, path: &Path) -> Arc<Registry> {
		self.registries()
			.entry(path.to_path_buf())
			.or_insert_with(|| Arc::new(Registry::new(path.to_path_buf())))
			.clone()
	}
}
