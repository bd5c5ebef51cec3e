use miette::Diagnostic;
use thiserror::Error;

/// Malformed-graph failures: a reference that cannot be followed, or one that
/// leads back to itself.
///
/// These are raised in their specific form first and then wrapped by
/// [`BitsError::Reference`], so a caller unwrapping a
/// [`BitsError::RegistryLoad`] can tell a broken graph apart from a broken
/// declaration via [`BitsError::reference`].
#[derive(Debug, Diagnostic, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReferenceError {
	#[error("target `{target}` extends unknown base `{base}` in {file}")]
	#[diagnostic(
		code(bits::missing_base),
		help("declare the base target, or use `path::Name` to reference another registry")
	)]
	MissingBase {
		target: String,
		base: String,
		file: String,
	},

	#[error("cycle detected in target extends: {chain}")]
	#[diagnostic(code(bits::extends_cycle))]
	TargetCycle { chain: String },

	#[error("cycle detected in registry imports: {chain}")]
	#[diagnostic(code(bits::import_cycle))]
	ImportCycle { chain: String },

	#[error("bit defaults refer back to themselves: {chain}")]
	#[diagnostic(
		code(bits::defaults_cycle),
		help("select a named preset instead of `default` inside the bit's own defaults")
	)]
	DefaultsCycle { chain: String },

	#[error("bit presets refer back to themselves: {chain}")]
	#[diagnostic(
		code(bits::preset_cycle),
		help("a preset's queries cannot select the same bit with the same preset")
	)]
	PresetCycle { chain: String },
}

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum BitsError {
	#[error(transparent)]
	#[diagnostic(code(bits::io_error))]
	Io(#[from] std::io::Error),

	#[error("registry not found: {path}")]
	#[diagnostic(
		code(bits::registry_not_found),
		help("check that the registry path exists, or add an `index.yml` to the directory")
	)]
	RegistryNotFound { path: String },

	#[error("failed to load registry: {path}")]
	#[diagnostic(code(bits::registry_load))]
	RegistryLoad {
		path: String,
		#[source]
		source: Box<BitsError>,
	},

	#[error(transparent)]
	#[diagnostic(transparent)]
	Reference(#[from] ReferenceError),

	#[error("{message}")]
	#[diagnostic(code(bits::context))]
	Context {
		message: String,
		#[source]
		source: Box<BitsError>,
	},

	#[error("failed to parse registry `{path}`: {reason}")]
	#[diagnostic(code(bits::registry_parse))]
	RegistryParse { path: String, reason: String },

	#[error("unsupported registry format: `{0}`")]
	#[diagnostic(
		code(bits::unsupported_format),
		help("supported formats: yaml, yml, json, toml, md")
	)]
	UnsupportedFormat(String),

	#[error("failed to parse config file: {0}")]
	#[diagnostic(
		code(bits::config_parse),
		help("check that bits.toml is valid TOML (or .bitsrc valid INI)")
	)]
	ConfigParse(String),

	#[error("element `{0}` already exists in this collection")]
	#[diagnostic(code(bits::duplicate_element))]
	DuplicateElement(String),

	#[error("element `{0}` not found")]
	#[diagnostic(code(bits::element_not_found))]
	NotFound(String),

	#[error("bit `{bit}` declares an empty fragment map")]
	#[diagnostic(
		code(bits::empty_fragments),
		help("`src` must be a template string or a non-empty map of fragment names to strings")
	)]
	EmptyFragments { bit: String },

	#[error("invalid name pattern `{pattern}`: {reason}")]
	#[diagnostic(code(bits::invalid_pattern))]
	InvalidPattern { pattern: String, reason: String },

	#[error("invalid query: {0}")]
	#[diagnostic(code(bits::invalid_query))]
	InvalidQuery(String),

	#[error("unknown merge mode: `{0}`")]
	#[diagnostic(code(bits::unknown_merge_mode), help("supported merge modes: concat, interleave"))]
	UnknownMergeMode(String),

	#[error("unknown dedupe key: `{0}`")]
	#[diagnostic(code(bits::unknown_dedupe), help("supported keys: by:id, by:name, by:hash"))]
	UnknownDedupe(String),

	#[error("unknown merge policy `{policy}` for `{section}`")]
	#[diagnostic(code(bits::unknown_merge_policy), help("supported policies: merge, replace"))]
	UnknownMergePolicy { section: String, policy: String },

	#[error("unknown override op: `{0}`")]
	#[diagnostic(code(bits::unknown_override_op), help("supported ops: set, merge, remove"))]
	UnknownOverrideOp(String),

	#[error("malformed override path `{path}`: {reason}")]
	#[diagnostic(code(bits::override_path))]
	OverridePath { path: String, reason: String },

	#[error("preset `{selector}` not found for bit `{bit}`")]
	#[diagnostic(code(bits::preset_not_found))]
	PresetNotFound { bit: String, selector: String },

	#[error("preset index {index} is out of range for bit `{bit}` ({count} preset(s))")]
	#[diagnostic(code(bits::preset_out_of_range))]
	PresetOutOfRange {
		bit: String,
		index: i64,
		count: usize,
	},

	#[error("preset `{selector}` of bit `{bit}` has overrides but no queries to apply them to")]
	#[diagnostic(code(bits::preset_overrides))]
	PresetOverridesWithoutQueries { bit: String, selector: String },

	#[error("target destination must be a directory or a `.pdf` file, got `{dest}`")]
	#[diagnostic(code(bits::unsupported_destination))]
	UnsupportedDestination { dest: String },

	#[error("target `{target}` has no template")]
	#[diagnostic(
		code(bits::missing_template),
		help("set `template` on the target or `defaults.template` in bits.toml")
	)]
	MissingTemplate { target: String },

	#[error("failed to load template `{path}`: {reason}")]
	#[diagnostic(code(bits::template_load))]
	TemplateLoad { path: String, reason: String },

	#[error("template rendering failed: {0}")]
	#[diagnostic(code(bits::template_render))]
	TemplateRender(String),

	#[error("{message}: {detail}")]
	#[diagnostic(code(bits::latex), help("check your LaTeX syntax and installed packages"))]
	Compile {
		message: String,
		detail: String,
		log_file: Option<String>,
	},
}

impl BitsError {
	/// Wrap `self` with a context message, keeping it as the cause.
	pub fn context(self, message: impl Into<String>) -> Self {
		Self::Context {
			message: message.into(),
			source: Box::new(self),
		}
	}

	/// Follow load and context wrappers down to a reference error, if the
	/// chain contains one.
	pub fn reference(&self) -> Option<&ReferenceError> {
		match self {
			Self::Reference(reference) => Some(reference),
			Self::RegistryLoad { source, .. } | Self::Context { source, .. } => source.reference(),
			_ => None,
		}
	}

	/// The innermost error of the chain.
	pub fn root_cause(&self) -> &BitsError {
		match self {
			Self::RegistryLoad { source, .. } | Self::Context { source, .. } => source.root_cause(),
			_ => self,
		}
	}
}

impl From<minijinja::Error> for BitsError {
	fn from(error: minijinja::Error) -> Self {
		Self::TemplateRender(error.to_string())
	}
}

pub type BitsResult<T> = Result<T, BitsError>;
pub type AnyError = Box<dyn std::error::Error>;
pub type AnyEmptyResult = Result<(), AnyError>;
pub type AnyResult<T> = Result<T, AnyError>;
