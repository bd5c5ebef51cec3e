use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::BitsError;
use crate::BitsResult;
use crate::value::ListMerge;
use crate::value::merge_into;

/// Supported config file locations in discovery order (highest precedence
/// first).
pub const CONFIG_FILE_CANDIDATES: [&str; 3] = ["bits.toml", ".bits.toml", ".config/bits.toml"];

/// Older INI configuration, read underneath the TOML file.
pub const LEGACY_CONFIG_FILE: &str = ".bitsrc";

/// Environment variables that override single settings.
pub const ENV_TEMPLATE: &str = "BITS_TEMPLATE";
pub const ENV_DEST: &str = "BITS_DEST";
pub const ENV_BUILD_DIR: &str = "BITS_BUILD_DIR";
pub const ENV_LATEX: &str = "BITS_LATEX";

/// Configuration of a bits project.
///
/// ```toml
/// [defaults]
/// template = "templates/exam.tex"
/// dest = "out"
///
/// [variables]
/// course = "Physics 101"
///
/// [output]
/// pdf = true
/// tex = false
/// build_dir = ".bits/build"
/// keep_intermediates = "errors"
///
/// [latex]
/// command = "pdflatex"
/// args = ["-interaction=nonstopmode"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitsConfig {
	/// Fallbacks for targets that leave `template` or `dest` unset.
	#[serde(default)]
	pub defaults: DefaultsConfig,
	/// Values substituted for `${name}` in registry files.
	#[serde(default)]
	pub variables: IndexMap<String, String>,
	#[serde(default)]
	pub output: OutputConfig,
	#[serde(default)]
	pub latex: LatexConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultsConfig {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub template: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dest: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
	/// Compile to PDF.
	#[serde(default = "default_true")]
	pub pdf: bool,
	/// Write the rendered `.tex` next to the destination.
	#[serde(default)]
	pub tex: bool,
	/// Persistent work directory; a temporary one is used when unset.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub build_dir: Option<PathBuf>,
	/// Where kept intermediates go; defaults to the destination's directory.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub intermediates_dir: Option<PathBuf>,
	#[serde(default)]
	pub keep_intermediates: KeepIntermediates,
}

impl Default for OutputConfig {
	fn default() -> Self {
		Self {
			pdf: true,
			tex: false,
			build_dir: None,
			intermediates_dir: None,
			keep_intermediates: KeepIntermediates::None,
		}
	}
}

/// Which compiler by-products survive a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepIntermediates {
	#[default]
	None,
	Errors,
	All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatexConfig {
	#[serde(default = "default_latex_command")]
	pub command: String,
	#[serde(default = "default_latex_args")]
	pub args: Vec<String>,
}

impl Default for LatexConfig {
	fn default() -> Self {
		Self {
			command: default_latex_command(),
			args: default_latex_args(),
		}
	}
}

fn default_true() -> bool {
	true
}

fn default_latex_command() -> String {
	"pdflatex".to_string()
}

fn default_latex_args() -> Vec<String> {
	vec!["-interaction=nonstopmode".to_string()]
}

impl BitsConfig {
	/// Resolve the config path from known discovery candidates.
	#[must_use]
	pub fn resolve_path(root: &Path) -> Option<PathBuf> {
		CONFIG_FILE_CANDIDATES
			.iter()
			.map(|candidate| root.join(candidate))
			.find(|path| path.is_file())
	}

	/// Load the configuration for `root`: built-in defaults, then
	/// `.bitsrc`, then the first discovered TOML file, then the process
	/// environment.
	pub fn load(root: &Path) -> BitsResult<Self> {
		Self::load_with_env(root, |key| std::env::var(key).ok())
	}

	/// Like [`BitsConfig::load`] with an explicit environment lookup.
	pub fn load_with_env(root: &Path, env: impl Fn(&str) -> Option<String>) -> BitsResult<Self> {
		let mut layered = Value::Object(Map::new());

		let legacy_path = root.join(LEGACY_CONFIG_FILE);
		if legacy_path.is_file() {
			let content = std::fs::read_to_string(&legacy_path)?;
			tracing::debug!(path = %legacy_path.display(), "reading legacy config");
			merge_into(&mut layered, parse_ini(&content)?, ListMerge::Replace);
		}

		if let Some(config_path) = Self::resolve_path(root) {
			let content = std::fs::read_to_string(&config_path)?;
			tracing::debug!(path = %config_path.display(), "reading config");
			merge_into(&mut layered, parse_toml(&content)?, ListMerge::Replace);
		}

		let mut config: Self =
			serde_json::from_value(layered).map_err(|e| BitsError::ConfigParse(e.to_string()))?;
		config.apply_env(env);
		Ok(config)
	}

	/// Parse a single TOML document on top of the defaults.
	pub fn from_toml_str(content: &str) -> BitsResult<Self> {
		serde_json::from_value(parse_toml(content)?).map_err(|e| BitsError::ConfigParse(e.to_string()))
	}

	/// Apply `BITS_*` overrides.
	pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
		let present = |key: &str| env(key).filter(|value| !value.trim().is_empty());

		if let Some(template) = present(ENV_TEMPLATE) {
			self.defaults.template = Some(PathBuf::from(template));
		}
		if let Some(dest) = present(ENV_DEST) {
			self.defaults.dest = Some(PathBuf::from(dest));
		}
		if let Some(build_dir) = present(ENV_BUILD_DIR) {
			self.output.build_dir = Some(PathBuf::from(build_dir));
		}
		if let Some(command) = present(ENV_LATEX) {
			self.latex.command = command;
		}
	}
}

fn parse_toml(content: &str) -> BitsResult<Value> {
	let value: toml::Value = toml::from_str(content).map_err(|e| BitsError::ConfigParse(e.to_string()))?;
	toml_to_json(value, "bits.toml")
}

/// Read `.bitsrc`. The `DEFAULT` section maps to `[defaults]` and boolean
/// words become booleans.
fn parse_ini(content: &str) -> BitsResult<Value> {
	let raw: Value = serde_ini::from_str(content).map_err(|e| BitsError::ConfigParse(e.to_string()))?;
	let Value::Object(sections) = raw else {
		return Ok(Value::Object(Map::new()));
	};

	let mut config = Map::new();
	for (section, entries) in sections {
		let section = match section.as_str() {
			"DEFAULT" | "default" => "defaults".to_string(),
			_ => section.to_ascii_lowercase(),
		};
		let entries = match entries {
			Value::Object(entries) => {
				entries
					.into_iter()
					.map(|(key, value)| (key, ini_scalar(value)))
					.collect()
			}
			_ => continue,
		};
		config.insert(section, Value::Object(entries));
	}

	Ok(Value::Object(config))
}

fn ini_scalar(value: Value) -> Value {
	match value.as_str().map(str::trim) {
		Some("true" | "yes" | "on") => Value::Bool(true),
		Some("false" | "no" | "off") => Value::Bool(false),
		_ => value,
	}
}

/// Convert a `toml::Value` to a `serde_json::Value`.
pub(crate) fn toml_to_json(value: toml::Value, path_display: &str) -> BitsResult<Value> {
	let json = match value {
		toml::Value::String(s) => Value::String(s),
		toml::Value::Integer(i) => Value::from(i),
		toml::Value::Float(f) => {
			Value::Number(serde_json::Number::from_f64(f).ok_or_else(|| {
				BitsError::RegistryParse {
					path: path_display.to_string(),
					reason: format!("`{f}` cannot be represented as a number"),
				}
			})?)
		}
		toml::Value::Boolean(b) => Value::Bool(b),
		toml::Value::Datetime(dt) => Value::String(dt.to_string()),
		toml::Value::Array(arr) => {
			let items: BitsResult<Vec<Value>> = arr
				.into_iter()
				.map(|v| toml_to_json(v, path_display))
				.collect();
			Value::Array(items?)
		}
		toml::Value::Table(table) => {
			let mut map = Map::new();
			for (k, v) in table {
				map.insert(k, toml_to_json(v, path_display)?);
			}
			Value::Object(map)
		}
	};

	Ok(json)
}
