use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use notify::EventKind;
use notify::event::ModifyKind;

#[derive(Parser)]
#[command(
	author,
	version,
	about = "Build documents from registries of reusable LaTeX bits.",
	long_about = "bits compiles registries of reusable LaTeX fragments (\"bits\"), constants and \
	              targets into documents.\n\nA registry is a YAML, JSON, TOML or markdown file. \
	              Targets select bits with queries, bind them to presets and render a template \
	              with the result.\n\nQuick start:\n  bits list registry.yaml     Show bits, \
	              constants and targets\n  bits build registry.yaml    Render and compile every \
	              target\n  bits convert registry.yaml --fmt md"
)]
pub struct BitsCli {
	#[command(subcommand)]
	pub command: Option<Commands>,

	/// Directory `bits.toml` (or `.bitsrc`) is read from. Defaults to the
	/// current directory.
	#[arg(long, short, global = true)]
	pub root: Option<PathBuf>,

	/// Enable verbose output.
	#[arg(long, short, global = true, default_value_t = false)]
	pub verbose: bool,

	/// Disable colored output.
	#[arg(long, global = true, default_value_t = false)]
	pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Render and compile every target of a registry.
	///
	/// Each target's template is rendered with its resolved context and
	/// handed to the LaTeX compiler. Unchanged targets are skipped when
	/// watching.
	Build {
		/// Registry file, or a directory containing an `index.yml`.
		path: PathBuf,

		/// Also write the rendered `.tex` next to each destination.
		#[arg(long, default_value_t = false)]
		tex: bool,

		/// Skip the LaTeX compiler. Combine with `--tex` to only render.
		#[arg(long, default_value_t = false)]
		no_pdf: bool,

		/// Persistent work directory for the compiler.
		#[arg(long)]
		build_dir: Option<PathBuf>,

		/// Rebuild whenever the registry, one of its dependencies or a
		/// template changes.
		#[arg(long, default_value_t = false)]
		watch: bool,
	},
	/// List the bits, constants and targets of a registry.
	List {
		/// Registry file, or a directory containing an `index.yml`.
		path: PathBuf,
	},
	/// Rewrite a registry in another format.
	///
	/// The output format follows the extension of `--out`, or `--fmt` when
	/// writing next to the source. `${name}` variables are kept as written.
	Convert {
		/// Registry file to read.
		src: PathBuf,

		/// File to write.
		#[arg(long, short, conflicts_with = "fmt")]
		out: Option<PathBuf>,

		/// Format to write next to the source file.
		#[arg(long, value_enum)]
		fmt: Option<ConvertFormat>,
	},
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConvertFormat {
	Yaml,
	Json,
	/// Markdown with YAML frontmatter and one fenced block per fragment.
	Md,
}

impl ConvertFormat {
	pub fn extension(self) -> &'static str {
		match self {
			Self::Yaml => "yaml",
			Self::Json => "json",
			Self::Md => "md",
		}
	}
}

/// The files a watched build reads: registries and templates. Events for
/// anything else, the build's own output included, do not trigger a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
	files: BTreeSet<PathBuf>,
}

impl WatchSet {
	pub fn new(files: impl IntoIterator<Item = PathBuf>) -> Self {
		Self {
			files: files.into_iter().map(|file| normalize(&file)).collect(),
		}
	}

	pub fn contains(&self, path: &Path) -> bool {
		self.files.contains(&normalize(path))
	}

	/// Existing parent directories of the watched files.
	pub fn dirs(&self) -> Vec<PathBuf> {
		self.files
			.iter()
			.filter_map(|file| file.parent())
			.filter(|dir| dir.is_dir())
			.map(Path::to_path_buf)
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect()
	}

	/// Whether `event` changes the content of a watched file.
	pub fn triggers(&self, event: &notify::Event) -> bool {
		let changed = match event.kind {
			EventKind::Modify(ModifyKind::Metadata(_)) => false,
			EventKind::Modify(_) | EventKind::Create(_) => true,
			_ => false,
		};

		changed && event.paths.iter().any(|path| self.contains(path))
	}
}

fn normalize(path: &Path) -> PathBuf {
	path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
