use std::path::Path;
use std::path::PathBuf;

use serde_json::Map;

use crate::BitsError;
use crate::BitsResult;
use crate::compiler::Artifact;
use crate::compiler::CompileOptions;
use crate::compiler::DocumentCompiler;
use crate::context::Context;
use crate::element::Element;
use crate::element::ElementMeta;
use crate::template::TemplateEngine;

/// A fully resolved document: template, context and destination.
#[derive(Debug, Clone)]
pub struct Target {
	meta: ElementMeta,
	template: PathBuf,
	context: Context,
	dest: PathBuf,
}

impl Target {
	pub fn new(
		name: Option<String>,
		tags: Vec<String>,
		template: PathBuf,
		context: Context,
		dest: PathBuf,
	) -> Self {
		Self {
			meta: ElementMeta::new(name, tags, Map::new()),
			template,
			context,
			dest,
		}
	}

	pub fn template(&self) -> &Path {
		&self.template
	}

	pub fn context(&self) -> &Context {
		&self.context
	}

	pub fn dest(&self) -> &Path {
		&self.dest
	}

	/// Render the template to text.
	pub fn render_text(&self, engine: &TemplateEngine) -> BitsResult<String> {
		engine
			.render_file(&self.template, &self.context)
			.map_err(|e| e.context(format!("could not render target `{}`", self.label())))
	}

	/// Render and hand the text to `compiler`.
	pub fn render(
		&self,
		engine: &TemplateEngine,
		compiler: &dyn DocumentCompiler,
		options: &CompileOptions,
	) -> BitsResult<Artifact> {
		let text = self.render_text(engine)?;
		tracing::debug!(target_name = %self.label(), dest = %self.dest.display(), "compiling target");
		compiler.compile(&text, &self.dest, options)
	}
}

impl Element for Target {
	fn meta(&self) -> &ElementMeta {
		&self.meta
	}

	fn own_field(&self, key: &str) -> Option<serde_json::Value> {
		match key {
			"template" => Some(self.template.display().to_string().into()),
			"dest" => Some(self.dest.display().to_string().into()),
			_ => None,
		}
	}
}

/// Where a target's output goes.
///
/// A directory becomes `<source-stem>-<name>.pdf` inside it; a `.pdf` path is
/// kept as is; any other suffix is rejected.
pub fn destination_for(dest: &Path, source: &Path, name: &str) -> BitsResult<PathBuf> {
	match dest.extension().and_then(|ext| ext.to_str()) {
		None => {
			let stem = source
				.file_stem()
				.map(|stem| stem.to_string_lossy().to_string())
				.unwrap_or_default();
			Ok(dest.join(format!("{stem}-{name}.pdf")))
		}
		Some(ext) if ext.eq_ignore_ascii_case("pdf") => Ok(dest.to_path_buf()),
		Some(_) => {
			Err(BitsError::UnsupportedDestination {
				dest: dest.display().to_string(),
			})
		}
	}
}
