//! Turning rendered target text into documents.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::PoisonError;

use regex::Regex;

use crate::BitsError;
use crate::BitsResult;
use crate::config::KeepIntermediates;
use crate::config::LatexConfig;
use crate::config::OutputConfig;

static LOG_ERRORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
	[
		r"! LaTeX Error: ([^\n\r]*)",
		r"! Package [^\n\r]* Error: ([^\n\r]*)",
		r"! ([^\n\r]*)",
	]
	.iter()
	.filter_map(|pattern| Regex::new(pattern).ok())
	.collect()
});

/// What a compile produces and keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
	pub pdf: bool,
	pub tex: bool,
	pub build_dir: Option<PathBuf>,
	pub intermediates_dir: Option<PathBuf>,
	pub keep_intermediates: KeepIntermediates,
}

impl CompileOptions {
	pub fn from_config(output: &OutputConfig) -> Self {
		Self {
			pdf: output.pdf,
			tex: output.tex,
			build_dir: output.build_dir.clone(),
			intermediates_dir: output.intermediates_dir.clone(),
			keep_intermediates: output.keep_intermediates,
		}
	}
}

/// Files written for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
	pub pdf: Option<PathBuf>,
	pub tex: Option<PathBuf>,
	/// The text was unchanged since the last successful compile to the same
	/// destination, so the compiler did not run.
	pub skipped: bool,
}

/// Compiles rendered text to `dest`.
pub trait DocumentCompiler {
	fn compile(&self, text: &str, dest: &Path, options: &CompileOptions) -> BitsResult<Artifact>;
}

/// Runs a LaTeX engine in a work directory.
#[derive(Debug)]
pub struct LatexCompiler {
	command: String,
	args: Vec<String>,
	/// Hash of the last text successfully compiled to each destination.
	cache: Mutex<HashMap<PathBuf, u64>>,
}

impl Default for LatexCompiler {
	fn default() -> Self {
		Self::from_config(&LatexConfig::default())
	}
}

impl LatexCompiler {
	pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
		Self {
			command: command.into(),
			args,
			cache: Mutex::default(),
		}
	}

	pub fn from_config(config: &LatexConfig) -> Self {
		Self::new(config.command.clone(), config.args.clone())
	}

	fn cached_hash(&self, dest: &Path) -> Option<u64> {
		self.cache
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(dest)
			.copied()
	}

	fn remember(&self, dest: &Path, hash: u64) {
		self.cache
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(dest.to_path_buf(), hash);
	}

	fn run(&self, work_dir: &Path, stem: &str, text: &str, dest: &Path, options: &CompileOptions) -> BitsResult<()> {
		let tex_name = format!("{stem}.tex");
		std::fs::write(work_dir.join(&tex_name), text)?;

		let mut command = Command::new(&self.command);
		command.args(&self.args).arg(&tex_name).current_dir(work_dir);
		if std::env::var_os("TEXMFVAR").is_none() {
			command.env("TEXMFVAR", work_dir);
		}

		let output = command.output()?;
		if output.status.success() {
			ensure_parent(dest)?;
			std::fs::copy(work_dir.join(format!("{stem}.pdf")), dest)?;
			if options.keep_intermediates == KeepIntermediates::All {
				copy_intermediates(work_dir, dest, options)?;
			}
			return Ok(());
		}

		let log_path = work_dir.join(format!("{stem}.log"));
		let detail = std::fs::read_to_string(&log_path)
			.ok()
			.and_then(|log| extract_log_error(&log))
			.unwrap_or_else(|| {
				format!(
					"process exited with status {}",
					output
						.status
						.code()
						.map_or_else(|| "unknown".to_string(), |code| code.to_string())
				)
			});

		let log_file = if log_path.is_file() {
			let preserved = dest.with_file_name(format!("{stem}_latex_error.log"));
			ensure_parent(&preserved)?;
			std::fs::copy(&log_path, &preserved)?;
			Some(preserved.display().to_string())
		} else {
			None
		};

		if options.keep_intermediates != KeepIntermediates::None {
			copy_intermediates(work_dir, dest, options)?;
		}

		Err(BitsError::Compile {
			message: "LaTeX compilation failed".to_string(),
			detail,
			log_file,
		})
	}
}

impl DocumentCompiler for LatexCompiler {
	fn compile(&self, text: &str, dest: &Path, options: &CompileOptions) -> BitsResult<Artifact> {
		let mut artifact = Artifact::default();

		if options.tex {
			let tex = dest.with_extension("tex");
			if std::fs::read_to_string(&tex).ok().as_deref() != Some(text) {
				ensure_parent(&tex)?;
				std::fs::write(&tex, text)?;
			}
			artifact.tex = Some(tex);
		}

		if !options.pdf {
			return Ok(artifact);
		}

		let hash = text_hash(text);
		if self.cached_hash(dest) == Some(hash) {
			tracing::info!(dest = %dest.display(), "no changes detected, skipping compile");
			artifact.skipped = true;
			artifact.pdf = Some(dest.to_path_buf());
			return Ok(artifact);
		}

		let stem = dest
			.file_stem()
			.map_or_else(|| "document".to_string(), |stem| stem.to_string_lossy().to_string());

		match &options.build_dir {
			Some(build_dir) => {
				let work_dir = build_dir.join(&stem);
				if work_dir.exists() {
					std::fs::remove_dir_all(&work_dir)?;
				}
				std::fs::create_dir_all(&work_dir)?;
				self.run(&work_dir, &stem, text, dest, options)?;
			}
			None => {
				let work_dir = tempfile::tempdir()?;
				self.run(work_dir.path(), &stem, text, dest, options)?;
			}
		}

		self.remember(dest, hash);
		artifact.pdf = Some(dest.to_path_buf());
		Ok(artifact)
	}
}

fn text_hash(text: &str) -> u64 {
	let mut hasher = DefaultHasher::new();
	text.hash(&mut hasher);
	hasher.finish()
}

fn ensure_parent(path: &Path) -> BitsResult<()> {
	if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent)?;
	}
	Ok(())
}

/// Copy the work directory's files to `<intermediates_dir>/<stem>/`. The
/// intermediates dir defaults to the destination's directory.
fn copy_intermediates(work_dir: &Path, dest: &Path, options: &CompileOptions) -> BitsResult<()> {
	let root = options
		.intermediates_dir
		.clone()
		.or_else(|| dest.parent().map(Path::to_path_buf))
		.unwrap_or_default();
	let stem = dest.file_stem().unwrap_or_default();
	let out_dir = root.join(stem);
	std::fs::create_dir_all(&out_dir)?;

	for entry in std::fs::read_dir(work_dir)? {
		let entry = entry?;
		if entry.file_type()?.is_file() {
			std::fs::copy(entry.path(), out_dir.join(entry.file_name()))?;
		}
	}

	Ok(())
}

/// The most relevant error line of a LaTeX log: a `LaTeX Error`, then a
/// package error, then any `!` line.
pub fn extract_log_error(log: &str) -> Option<String> {
	LOG_ERRORS.iter().find_map(|pattern| {
		pattern
			.captures(log)
			.and_then(|captures| captures.get(1))
			.map(|message| message.as_str().trim().to_string())
			.filter(|message| !message.is_empty())
	})
}
