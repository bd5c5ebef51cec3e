use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

use super::*;

pub(crate) fn workspace() -> TempDir {
	tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"))
}

/// Write `content` to `dir/name`, creating parent directories.
pub(crate) fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
	let path = dir.join(name);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap_or_else(|e| panic!("create_dir_all: {e}"));
	}
	std::fs::write(&path, content).unwrap_or_else(|e| panic!("write: {e}"));
	path
}

pub(crate) fn store() -> RegistryStore {
	RegistryStore::new(BitsConfig::default())
}

pub(crate) fn bit(name: &str, tags: &[&str]) -> Arc<Bit> {
	let decl = BitDecl {
		name: Some(name.to_string()),
		tags: tags.iter().map(ToString::to_string).collect(),
		src: BitSource::Single(format!("{name}: \\VAR{{ x }}")),
		..BitDecl::default()
	};
	Arc::new(Bit::from_decl(decl, &[]).unwrap_or_else(|e| panic!("bit: {e}")))
}

pub(crate) fn bits(names: &[&str]) -> Collection<Bit> {
	Collection::from_items(names.iter().map(|name| bit(name, &[])))
		.unwrap_or_else(|e| panic!("collection: {e}"))
}

pub(crate) fn constant(name: &str, symbol: &str, value: &str) -> Arc<Constant> {
	let decl = ConstantDecl {
		name: Some(name.to_string()),
		symbol: symbol.to_string(),
		value: value.to_string(),
		..ConstantDecl::default()
	};
	Arc::new(Constant::from_decl(decl, &[]))
}

pub(crate) fn bit_from(decl: Value) -> Arc<Bit> {
	let decl: BitDecl = serde_json::from_value(decl).unwrap_or_else(|e| panic!("bit decl: {e}"));
	Arc::new(Bit::from_decl(decl, &[]).unwrap_or_else(|e| panic!("bit: {e}")))
}

/// A block of a fresh bit, bound to an empty context.
pub(crate) fn block(name: &str) -> ContextValue {
	ContextValue::Block(Arc::new(Block::new(bit(name, &[]), Context::new(), Map::new())))
}

/// Element names of a list variable, `?` for anything that is not an element.
pub(crate) fn names(value: Option<&ContextValue>) -> Vec<String> {
	value
		.and_then(ContextValue::as_list)
		.unwrap_or_default()
		.iter()
		.map(|item| item.element_name().unwrap_or("?").to_string())
		.collect()
}

/// The first block of a list variable.
pub(crate) fn first_block(context: &Context, name: &str) -> Arc<Block> {
	context
		.get(name)
		.and_then(ContextValue::as_list)
		.and_then(|items| items.first())
		.and_then(ContextValue::as_block)
		.cloned()
		.unwrap_or_else(|| panic!("no block in `{name}`"))
}

pub(crate) fn number(value: Option<&ContextValue>) -> Option<i64> {
	match value {
		Some(ContextValue::Number(number)) => number.as_i64(),
		_ => None,
	}
}

pub(crate) fn names_of<T: Element>(items: &[Arc<T>]) -> Vec<String> {
	items.iter().map(|item| item.label()).collect()
}

/// A map literal as a `serde_json` map.
pub(crate) fn map(value: Value) -> Map<String, Value> {
	match value {
		Value::Object(map) => map,
		other => panic!("expected a map, got {other}"),
	}
}

pub(crate) fn query(value: Value) -> QuerySpec {
	serde_json::from_value(value).unwrap_or_else(|e| panic!("query: {e}"))
}

pub(crate) fn target(value: Value) -> TargetDecl {
	serde_json::from_value(value).unwrap_or_else(|e| panic!("target: {e}"))
}

pub(crate) fn spec_with_queries(name: &str, queries: Value) -> TargetDecl {
	target(json!({ "name": name, "template": "t.tex", "queries": queries }))
}

/// Target declarations kept in memory, keyed by `(file, name)`. References
/// resolve to the path as written.
#[derive(Default)]
pub(crate) struct MemoryTargets {
	targets: HashMap<(PathBuf, String), TargetDecl>,
}

impl MemoryTargets {
	pub(crate) fn with(mut self, file: &str, decl: TargetDecl) -> Self {
		let name = decl.name.clone().unwrap_or_default();
		self.targets.insert((PathBuf::from(file), name), decl);
		self
	}

	pub(crate) fn resolve(&self, file: &str, name: &str) -> BitsResult<TargetSpec> {
		let decl = self
			.targets
			.get(&(PathBuf::from(file), name.to_string()))
			.cloned()
			.unwrap_or_else(|| panic!("no target {file}::{name}"));
		ExtendsResolver::new(self).resolve(Path::new(file), &decl)
	}
}

impl TargetSource for MemoryTargets {
	fn declaration(&self, file: &Path, name: &str) -> BitsResult<Option<TargetDecl>> {
		Ok(self
			.targets
			.get(&(file.to_path_buf(), name.to_string()))
			.cloned())
	}

	fn locate(&self, _from: &Path, reference: &str) -> BitsResult<PathBuf> {
		Ok(PathBuf::from(reference))
	}
}

/// Records what it was asked to compile instead of running LaTeX.
#[derive(Default)]
pub(crate) struct RecordingCompiler {
	pub(crate) calls: Mutex<Vec<(PathBuf, String)>>,
}

impl DocumentCompiler for RecordingCompiler {
	fn compile(&self, text: &str, dest: &Path, _options: &CompileOptions) -> BitsResult<Artifact> {
		self.calls
			.lock()
			.unwrap_or_else(|e| panic!("lock: {e}"))
			.push((dest.to_path_buf(), text.to_string()));
		Ok(Artifact {
			pdf: Some(dest.to_path_buf()),
			..Artifact::default()
		})
	}
}

/// A physics registry used across the registry tests.
pub(crate) const QUESTIONS: &str = r#"
tags: [physics]
constants:
  - name: gravity
    symbol: g
    value: 9.81
    tags: [mechanics]
  - name: light
    symbol: c
    value: '3e8'
    unit: m/s
bits:
  - name: projectile
    tags: [kinematics]
    level: 2
    defaults:
      context:
        speed: 10
      queries:
        constants:
          where: { name: gravity }
    presets:
      - name: fast
        context:
          speed: 30
      - name: slow
        context:
          speed: 2
    src: 'A ball is thrown at \VAR{ speed } m/s.'
  - name: pendulum
    tags: [oscillations]
    defaults:
      length: 1
    src: 'A pendulum of length \VAR{ length } m.'
  - name: two-part
    tags: [kinematics]
    defaults:
      x: 3
    src:
      question: 'Compute \VAR{ x }.'
      answer: '\VAR{ x * 2 }'
targets:
  - name: exam
    template: exam.tex
    dest: out
    context:
      title: Midterm
    queries:
      blocks:
        where: { tags: [kinematics] }
"#;

pub(crate) const EXAM_TEMPLATE: &str = r#"\VAR{ title }
\BLOCK{ for block in blocks }
\VAR{ block.render("question") if block.bit.fragments else block.render() }
\BLOCK{ endfor }
"#;
