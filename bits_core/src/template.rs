//! The `minijinja` environment bits and targets are rendered with.
//!
//! Templates use a LaTeX-friendly syntax so they do not clash with braces in
//! the document body:
//!
//! ```text
//! \BLOCK{ for block in blocks }
//! \VAR{ block.render() }
//! \BLOCK{ endfor }
//! %% if draft
//! %# line comment
//! \#{ inline comment }
//! ```
//!
//! Blocks reach templates as objects with `render()`, `render("part")`,
//! `fragment("part").render()`, `fragments.<part>.render()`, `context`,
//! `metadata` and `bit`. Per-call keyword arguments, e.g.
//! `block.render(scale=2)`, are layered over the block's own context.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use minijinja::AutoEscape;
use minijinja::Environment;
use minijinja::Error;
use minijinja::ErrorKind;
use minijinja::State;
use minijinja::Value;
use minijinja::syntax::SyntaxConfig;
use minijinja::value::Enumerator;
use minijinja::value::Kwargs;
use minijinja::value::Object;
use minijinja::value::from_args;

use crate::BitsError;
use crate::BitsResult;
use crate::bit::Bit;
use crate::bit::Block;
use crate::constant::Constant;
use crate::context::Context;
use crate::context::ContextValue;
use crate::element::Element;

/// Extension point for filters, functions and globals.
pub trait TemplatePlugin: Send + Sync {
	fn name(&self) -> &str;
	fn register(&self, env: &mut Environment<'static>);
}

/// Shared template environment. Cheap to clone.
#[derive(Clone)]
pub struct TemplateEngine {
	env: Arc<Environment<'static>>,
	plugins: Vec<Arc<dyn TemplatePlugin>>,
}

impl fmt::Debug for TemplateEngine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let plugins: Vec<&str> = self.plugins.iter().map(|plugin| plugin.name()).collect();
		f.debug_struct("TemplateEngine")
			.field("plugins", &plugins)
			.finish_non_exhaustive()
	}
}

impl TemplateEngine {
	pub fn new() -> BitsResult<Self> {
		Self::with_plugins(Vec::new())
	}

	pub fn with_plugins(plugins: Vec<Arc<dyn TemplatePlugin>>) -> BitsResult<Self> {
		let env = build_environment(&plugins)?;
		Ok(Self {
			env: Arc::new(env),
			plugins,
		})
	}

	/// Render an inline template such as a bit fragment.
	pub fn render_str(&self, source: &str, context: &Context) -> BitsResult<String> {
		Ok(self.env.render_str(source, self.context_value(context))?)
	}

	/// Render a template file. Includes and imports resolve relative to the
	/// file's directory.
	pub fn render_file(&self, path: &Path, context: &Context) -> BitsResult<String> {
		let load_error = |reason: String| {
			BitsError::TemplateLoad {
				path: path.display().to_string(),
				reason,
			}
		};

		if !path.is_file() {
			return Err(load_error("file not found".to_string()));
		}
		let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
			return Err(load_error("template file name is not valid UTF-8".to_string()));
		};
		let dir = path.parent().unwrap_or_else(|| Path::new("."));

		let mut env = build_environment(&self.plugins)?;
		env.set_loader(minijinja::path_loader(dir));
		let template = env.get_template(name).map_err(|e| load_error(e.to_string()))?;

		Ok(template.render(self.context_value(context))?)
	}

	/// Convert a resolved context into a template value, keeping key order.
	pub fn context_value(&self, context: &Context) -> Value {
		let entries = context
			.iter()
			.map(|(key, value)| (key.clone(), self.value(value)))
			.collect();
		Value::from_object(MapObject(entries))
	}

	fn value(&self, value: &ContextValue) -> Value {
		match value {
			ContextValue::Null => Value::from(()),
			ContextValue::Bool(value) => Value::from(*value),
			ContextValue::Number(number) => {
				if let Some(int) = number.as_i64() {
					Value::from(int)
				} else if let Some(uint) = number.as_u64() {
					Value::from(uint)
				} else {
					Value::from(number.as_f64().unwrap_or_default())
				}
			}
			ContextValue::String(value) => Value::from(value.as_str()),
			ContextValue::List(items) => {
				Value::from(items.iter().map(|item| self.value(item)).collect::<Vec<_>>())
			}
			ContextValue::Map(map) => self.context_value(map),
			ContextValue::Block(block) => {
				Value::from_object(BlockObject {
					block: block.clone(),
					engine: self.clone(),
				})
			}
			ContextValue::Constant(constant) => Value::from_object(ConstantObject(constant.clone())),
		}
	}
}

fn build_environment(plugins: &[Arc<dyn TemplatePlugin>]) -> BitsResult<Environment<'static>> {
	let syntax = SyntaxConfig::builder()
		.block_delimiters("\\BLOCK{", "}")
		.variable_delimiters("\\VAR{", "}")
		.comment_delimiters("\\#{", "}")
		.line_statement_prefix("%%")
		.line_comment_prefix("%#")
		.build()?;

	let mut env = Environment::new();
	env.set_syntax(syntax);
	env.set_trim_blocks(true);
	env.set_keep_trailing_newline(true);
	env.set_auto_escape_callback(|_| AutoEscape::None);
	env.add_filter("floor", floor);
	env.add_filter("ceil", ceil);

	for plugin in plugins {
		tracing::debug!(plugin = plugin.name(), "registering template plugin");
		plugin.register(&mut env);
	}

	Ok(env)
}

fn floor(value: f64) -> i64 {
	value.floor() as i64
}

fn ceil(value: f64) -> i64 {
	value.ceil() as i64
}

fn render_failed(error: &BitsError) -> Error {
	Error::new(ErrorKind::InvalidOperation, error.to_string())
}

/// Split trailing keyword arguments off the positional ones.
fn split_kwargs(args: &[Value]) -> Result<(&[Value], Option<Kwargs>), Error> {
	match args.split_last() {
		Some((last, rest)) if last.is_kwargs() => Ok((rest, Some(Kwargs::try_from(last.clone())?))),
		_ => Ok((args, None)),
	}
}

fn kwargs_context(kwargs: Option<&Kwargs>) -> Result<Context, Error> {
	let mut context = Context::new();
	let Some(kwargs) = kwargs else {
		return Ok(context);
	};
	for key in kwargs.args() {
		let value: Value = kwargs.get(key)?;
		let json = serde_json::to_value(&value)
			.map_err(|e| Error::new(ErrorKind::BadSerialization, e.to_string()))?;
		context.insert(key.to_string(), ContextValue::from(json));
	}
	Ok(context)
}

#[derive(Debug)]
struct MapObject(IndexMap<String, Value>);

impl Object for MapObject {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		self.0.get(key.as_str()?).cloned()
	}

	fn enumerate(self: &Arc<Self>) -> Enumerator {
		Enumerator::Values(self.0.keys().map(|key| Value::from(key.as_str())).collect())
	}
}

#[derive(Debug)]
struct BlockObject {
	block: Arc<Block>,
	engine: TemplateEngine,
}

impl BlockObject {
	fn render_part(&self, part: Option<&str>, kwargs: Option<&Kwargs>) -> Result<Value, Error> {
		let overrides = kwargs_context(kwargs)?;
		self.block
			.render_with(&self.engine, part, overrides)
			.map(Value::from_safe_string)
			.map_err(|e| render_failed(&e))
	}
}

impl Object for BlockObject {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		match key.as_str()? {
			"name" => self.block.bit().name().map(Value::from),
			"bit" => Some(Value::from_object(BitObject(self.block.bit().clone()))),
			"context" => Some(self.engine.context_value(self.block.context())),
			"metadata" => Some(Value::from_serialize(self.block.metadata())),
			"fragments" => Some(Value::from_object(FragmentsObject(self.clone()))),
			_ => None,
		}
	}

	fn enumerate(self: &Arc<Self>) -> Enumerator {
		Enumerator::Str(&["name", "bit", "context", "metadata", "fragments"])
	}

	fn call_method(
		self: &Arc<Self>,
		_state: &State<'_, '_>,
		method: &str,
		args: &[Value],
	) -> Result<Value, Error> {
		match method {
			"render" => {
				let (positional, kwargs) = split_kwargs(args)?;
				let (part,): (Option<&str>,) = from_args(positional)?;
				self.render_part(part, kwargs.as_ref())
			}
			"fragment" => {
				let (name,): (&str,) = from_args(args)?;
				Ok(Value::from_object(FragmentObject {
					block: self.clone(),
					name: name.to_string(),
				}))
			}
			_ => {
				Err(Error::new(
					ErrorKind::UnknownMethod,
					format!("block has no method named {method}"),
				))
			}
		}
	}
}

#[derive(Debug)]
struct FragmentsObject(Arc<BlockObject>);

impl Object for FragmentsObject {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		let name = key.as_str()?;
		self.0
			.block
			.bit()
			.fragment_names()
			.contains(&name)
			.then(|| {
				Value::from_object(FragmentObject {
					block: self.0.clone(),
					name: name.to_string(),
				})
			})
	}

	fn enumerate(self: &Arc<Self>) -> Enumerator {
		Enumerator::Values(
			self.0
				.block
				.bit()
				.fragment_names()
				.into_iter()
				.map(Value::from)
				.collect(),
		)
	}
}

#[derive(Debug)]
struct FragmentObject {
	block: Arc<BlockObject>,
	name: String,
}

impl Object for FragmentObject {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		(key.as_str()? == "name").then(|| Value::from(self.name.as_str()))
	}

	fn call_method(
		self: &Arc<Self>,
		_state: &State<'_, '_>,
		method: &str,
		args: &[Value],
	) -> Result<Value, Error> {
		if method != "render" {
			return Err(Error::new(
				ErrorKind::UnknownMethod,
				format!("fragment has no method named {method}"),
			));
		}

		let (positional, kwargs) = split_kwargs(args)?;
		let () = from_args(positional)?;
		self.block.render_part(Some(&self.name), kwargs.as_ref())
	}
}

#[derive(Debug)]
struct BitObject(Arc<Bit>);

impl Object for BitObject {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		let bit = &self.0;
		match key.as_str()? {
			"name" => bit.name().map(Value::from),
			"id" => Some(Value::from(bit.id().to_string())),
			"tags" => Some(Value::from_serialize(bit.tags())),
			"fragments" => Some(Value::from_serialize(bit.fragment_names())),
			other => bit.metadata().get(other).map(Value::from_serialize),
		}
	}
}

#[derive(Debug)]
struct ConstantObject(Arc<Constant>);

impl Object for ConstantObject {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		let constant = &self.0;
		match key.as_str()? {
			"name" => constant.name().map(Value::from),
			"symbol" => Some(Value::from(constant.symbol())),
			"value" => Some(Value::from(constant.value())),
			"tags" => Some(Value::from_serialize(constant.tags())),
			_ => None,
		}
	}

	fn enumerate(self: &Arc<Self>) -> Enumerator {
		Enumerator::Str(&["name", "symbol", "value", "tags"])
	}

	fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self.0.as_ref(), f)
	}
}
