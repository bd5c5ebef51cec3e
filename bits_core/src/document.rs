//! Reading and writing registry documents.
//!
//! Every format is first parsed into a `serde_json::Value`, `${name}`
//! variables are substituted in string scalars, and the tree is then
//! deserialized into a [`RegistryDocument`].
//!
//! The markdown format keeps the registry header in YAML frontmatter and
//! writes each bit as a YAML header followed by fenced code:
//!
//! ````markdown
//! ---
//! tags: [mechanics]
//! ---
//! name: projectile
//! level: 2
//! ```latex
//! A ball is thrown at \VAR{ speed } m/s.
//! ```
//! ---
//! name: two-part
//! ```latex question
//! Compute \VAR{ x }.
//! ```
//! ```latex answer
//! \VAR{ x * 2 }
//! ```
//! ````

use std::path::Path;
use std::sync::LazyLock;

use indexmap::IndexMap;
use markdown::ParseOptions;
use markdown::mdast::Node;
use regex::Captures;
use regex::Regex;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::BitsError;
use crate::BitsResult;
use crate::config::toml_to_json;
use crate::model::BitDecl;
use crate::model::BitSource;
use crate::model::RegistryDocument;

static VARIABLE: LazyLock<Result<Regex, regex::Error>> =
	LazyLock::new(|| Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}"));

const FRONTMATTER_FENCE: &str = "---";
const SOURCE_LANGUAGE: &str = "latex";

/// Registry file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
	Yaml,
	Json,
	Toml,
	Markdown,
}

impl DocumentFormat {
	pub fn from_extension(extension: &str) -> BitsResult<Self> {
		match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
			"yaml" | "yml" => Ok(Self::Yaml),
			"json" => Ok(Self::Json),
			"toml" => Ok(Self::Toml),
			"md" | "markdown" => Ok(Self::Markdown),
			other => Err(BitsError::UnsupportedFormat(other.to_string())),
		}
	}

	pub fn from_path(path: &Path) -> BitsResult<Self> {
		let extension = path
			.extension()
			.and_then(|ext| ext.to_str())
			.unwrap_or_default();
		Self::from_extension(extension)
	}

	pub fn extension(self) -> &'static str {
		match self {
			Self::Yaml => "yaml",
			Self::Json => "json",
			Self::Toml => "toml",
			Self::Markdown => "md",
		}
	}
}

/// Parse the registry file at `path`.
pub fn parse_file(path: &Path, variables: &IndexMap<String, String>) -> BitsResult<RegistryDocument> {
	let format = DocumentFormat::from_path(path)?;
	let content = std::fs::read_to_string(path)?;
	parse_str(&content, format, &path.display().to_string(), variables)
}

/// Parse registry text in `format`. `path_display` only names the source in
/// errors.
pub fn parse_str(
	content: &str,
	format: DocumentFormat,
	path_display: &str,
	variables: &IndexMap<String, String>,
) -> BitsResult<RegistryDocument> {
	let parse_error = |reason: String| {
		BitsError::RegistryParse {
			path: path_display.to_string(),
			reason,
		}
	};

	let tree = match format {
		DocumentFormat::Yaml => yaml_value(content).map_err(parse_error)?,
		DocumentFormat::Json => serde_json::from_str(content).map_err(|e| parse_error(e.to_string()))?,
		DocumentFormat::Toml => {
			let value: toml::Value = toml::from_str(content).map_err(|e| parse_error(e.to_string()))?;
			toml_to_json(value, path_display)?
		}
		DocumentFormat::Markdown => markdown_value(content).map_err(parse_error)?,
	};

	let tree = match tree {
		Value::Null => Value::Object(Map::new()),
		other => interpolate(other, variables),
	};

	serde_json::from_value(tree).map_err(|e| parse_error(e.to_string()))
}

/// Write `document` to `path` in the format its extension names.
pub fn dump(document: &RegistryDocument, path: &Path) -> BitsResult<()> {
	let format = DocumentFormat::from_path(path)?;
	let content = dump_str(document, format)?;
	if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, content)?;
	Ok(())
}

/// Serialize `document`. TOML output is not supported.
pub fn dump_str(document: &RegistryDocument, format: DocumentFormat) -> BitsResult<String> {
	let dump_error = |reason: String| {
		BitsError::RegistryParse {
			path: format!("<{}>", format.extension()),
			reason,
		}
	};

	match format {
		DocumentFormat::Yaml => serde_yaml_ng::to_string(document).map_err(|e| dump_error(e.to_string())),
		DocumentFormat::Json => {
			serde_json::to_string_pretty(document)
				.map(|json| json + "\n")
				.map_err(|e| dump_error(e.to_string()))
		}
		DocumentFormat::Markdown => markdown_string(document).map_err(dump_error),
		DocumentFormat::Toml => Err(BitsError::UnsupportedFormat("toml (dump)".to_string())),
	}
}

fn yaml_value(content: &str) -> Result<Value, String> {
	if content.trim().is_empty() {
		return Ok(Value::Null);
	}
	serde_yaml_ng::from_str(content).map_err(|e| e.to_string())
}

/// Replace `${name}` in every string scalar. Unknown names stay as written.
pub fn interpolate(value: Value, variables: &IndexMap<String, String>) -> Value {
	let Ok(pattern) = VARIABLE.as_ref() else {
		return value;
	};
	if variables.is_empty() {
		return value;
	}

	match value {
		Value::String(text) if text.contains("${") => {
			let replaced = pattern.replace_all(&text, |captures: &Captures<'_>| {
				variables
					.get(&captures[1])
					.cloned()
					.unwrap_or_else(|| captures[0].to_string())
			});
			Value::String(replaced.into_owned())
		}
		Value::Array(items) => {
			Value::Array(
				items
					.into_iter()
					.map(|item| interpolate(item, variables))
					.collect(),
			)
		}
		Value::Object(map) => {
			Value::Object(
				map.into_iter()
					.map(|(key, item)| (key, interpolate(item, variables)))
					.collect(),
			)
		}
		other => other,
	}
}

/// Split text into sections at lines that are exactly `---`. Lines inside
/// fenced code never split.
fn split_sections(content: &str) -> Vec<String> {
	let mut sections = vec![String::new()];
	let mut open_fence: Option<(char, usize)> = None;

	for line in content.lines() {
		if open_fence.is_none() && line.trim_end() == FRONTMATTER_FENCE {
			sections.push(String::new());
			continue;
		}

		if let Some(current) = sections.last_mut() {
			current.push_str(line);
			current.push('\n');
		}

		open_fence = match (open_fence, code_fence_marker(line)) {
			(None, Some((marker, len, _))) => Some((marker, len)),
			(Some((open, open_len)), Some((marker, len, info)))
				if marker == open && len >= open_len && info.is_empty() =>
			{
				None
			}
			(state, _) => state,
		};
	}

	sections
}

/// A code fence line: its marker character, run length and info string.
fn code_fence_marker(line: &str) -> Option<(char, usize, &str)> {
	let trimmed = line.trim_start_matches(' ');
	if line.len() - trimmed.len() > 3 {
		return None;
	}

	let marker = trimmed.chars().next().filter(|c| matches!(c, '`' | '~'))?;
	let len = trimmed.chars().take_while(|c| *c == marker).count();
	(len >= 3).then(|| (marker, len, trimmed[len..].trim()))
}

fn markdown_value(content: &str) -> Result<Value, String> {
	let sections = split_sections(content);
	let mut sections = sections.into_iter();

	let preamble = sections.next().unwrap_or_default();
	if !preamble.trim().is_empty() {
		return Err("markdown registries must start with `---` frontmatter".to_string());
	}
	let Some(frontmatter) = sections.next() else {
		return Err("markdown registries must start with `---` frontmatter".to_string());
	};

	let mut root = match yaml_value(&frontmatter)? {
		Value::Object(map) => map,
		Value::Null => Map::new(),
		other => return Err(format!("frontmatter must be a map, got `{other}`")),
	};

	let mut bits = Vec::new();
	for section in sections {
		if section.trim().is_empty() {
			continue;
		}
		bits.push(markdown_bit(&section)?);
	}

	if !bits.is_empty() {
		root.insert("bits".to_string(), Value::Array(bits));
	}

	Ok(Value::Object(root))
}

struct CodeFence {
	start: usize,
	fragment: Option<String>,
	value: String,
}

fn code_fences(section: &str) -> Result<Vec<CodeFence>, String> {
	let tree = markdown::to_mdast(section, &ParseOptions::default()).map_err(|e| e.to_string())?;
	let Some(children) = tree.children() else {
		return Ok(Vec::new());
	};

	let fences = children
		.iter()
		.filter_map(|node| {
			match node {
				Node::Code(code) if code.lang.is_some() => {
					Some(CodeFence {
						start: code.position.as_ref().map_or(0, |position| position.start.offset),
						fragment: code
							.meta
							.as_deref()
							.map(str::trim)
							.filter(|meta| !meta.is_empty())
							.map(ToString::to_string),
						value: code.value.clone(),
					})
				}
				_ => None,
			}
		})
		.collect();

	Ok(fences)
}

fn markdown_bit(section: &str) -> Result<Value, String> {
	let fences = code_fences(section)?;
	let Some(first) = fences.first() else {
		return Err(format!("bit section has no ```{SOURCE_LANGUAGE} code block"));
	};

	let header = section.get(..first.start).unwrap_or_default();
	let mut bit = match yaml_value(header)? {
		Value::Object(map) => map,
		Value::Null => Map::new(),
		other => return Err(format!("bit header must be a map, got `{other}`")),
	};

	let src = if fences.len() == 1 && first.fragment.is_none() {
		Value::String(first.value.clone())
	} else {
		let mut fragments = Map::new();
		for fence in &fences {
			let Some(name) = &fence.fragment else {
				return Err("every code block of a multi-fragment bit needs a fragment name".to_string());
			};
			fragments.insert(name.clone(), Value::String(fence.value.clone()));
		}
		Value::Object(fragments)
	};
	bit.insert("src".to_string(), src);

	Ok(Value::Object(bit))
}

/// The frontmatter part of a markdown registry.
#[derive(Serialize)]
struct Frontmatter<'a> {
	#[serde(skip_serializing_if = "<[_]>::is_empty")]
	tags: &'a [String],
	#[serde(skip_serializing_if = "<[_]>::is_empty")]
	imports: &'a [crate::model::ImportDecl],
	#[serde(skip_serializing_if = "<[_]>::is_empty")]
	constants: &'a [crate::model::ConstantDecl],
	#[serde(skip_serializing_if = "<[_]>::is_empty")]
	targets: &'a [crate::model::TargetDecl],
}

fn markdown_string(document: &RegistryDocument) -> Result<String, String> {
	let frontmatter = Frontmatter {
		tags: &document.tags,
		imports: &document.imports,
		constants: &document.constants,
		targets: &document.targets,
	};

	let mut out = String::new();
	out.push_str(FRONTMATTER_FENCE);
	out.push('\n');
	out.push_str(&serde_yaml_ng::to_string(&frontmatter).map_err(|e| e.to_string())?);
	out.push_str(FRONTMATTER_FENCE);
	out.push('\n');

	for (index, bit) in document.bits.iter().enumerate() {
		if index > 0 {
			out.push_str(FRONTMATTER_FENCE);
			out.push('\n');
		}
		out.push_str(&markdown_bit_string(bit)?);
	}

	Ok(out)
}

fn markdown_bit_string(bit: &BitDecl) -> Result<String, String> {
	let mut header = serde_json::to_value(bit).map_err(|e| e.to_string())?;
	if let Some(map) = header.as_object_mut() {
		map.shift_remove("src");
	}

	let mut out = String::new();
	if header.as_object().is_some_and(|map| !map.is_empty()) {
		out.push_str(&serde_yaml_ng::to_string(&header).map_err(|e| e.to_string())?);
	}

	match &bit.src {
		BitSource::Single(src) => push_fence(&mut out, None, src),
		BitSource::Fragments(fragments) => {
			for (name, src) in fragments {
				push_fence(&mut out, Some(name), src);
			}
		}
	}

	Ok(out)
}

/// Write `src` as a fenced block, with a fence longer than any backtick run
/// inside it.
fn push_fence(out: &mut String, fragment: Option<&str>, src: &str) {
	let longest = src.split(|c| c != '`').map(str::len).max().unwrap_or_default();
	let fence = "`".repeat(longest.max(2) + 1);

	out.push_str(&fence);
	out.push_str(SOURCE_LANGUAGE);
	if let Some(fragment) = fragment {
		out.push(' ');
		out.push_str(fragment);
	}
	out.push('\n');
	out.push_str(src);
	out.push('\n');
	out.push_str(&fence);
	out.push('\n');
}
