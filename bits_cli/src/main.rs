use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::mpsc;
use std::time::Duration;

use bits_core::Artifact;
use bits_core::BitsConfig;
use bits_core::CompileOptions;
use bits_core::Element;
use bits_core::LatexCompiler;
use bits_core::RegistryStore;
use bits_core::TemplateEngine;
use bits_core::document;
use bits_cli::BitsCli;
use bits_cli::Commands;
use bits_cli::ConvertFormat;
use bits_cli::WatchSet;
use clap::Parser;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

static USE_COLOR: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

fn color_enabled() -> bool {
	USE_COLOR.load(std::sync::atomic::Ordering::Relaxed)
}

/// Apply ANSI color codes only when color is enabled.
macro_rules! colored {
	($text:expr,red) => {
		if color_enabled() {
			format!("{}", $text.red())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,green) => {
		if color_enabled() {
			format!("{}", $text.green())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,bold) => {
		if color_enabled() {
			format!("{}", $text.bold())
		} else {
			format!("{}", $text)
		}
	};
}

fn main() {
	let args = BitsCli::parse();

	// Respect NO_COLOR env var and --no-color flag.
	let use_color = !args.no_color && std::env::var_os("NO_COLOR").is_none();
	if !use_color {
		USE_COLOR.store(false, std::sync::atomic::Ordering::Relaxed);
	}

	miette::set_hook(Box::new(move |_| {
		Box::new(
			miette::MietteHandlerOpts::new()
				.color(use_color)
				.unicode(use_color)
				.build(),
		)
	}))
	.ok();

	init_logging(args.verbose, use_color);

	let result = match &args.command {
		Some(Commands::Build {
			path,
			tex,
			no_pdf,
			build_dir,
			watch,
		}) => {
			let build = BuildArgs {
				path,
				tex: *tex,
				no_pdf: *no_pdf,
				build_dir: build_dir.as_deref(),
			};
			run_build(&args, &build, *watch)
		}
		Some(Commands::List { path }) => run_list(&args, path),
		Some(Commands::Convert { src, out, fmt }) => run_convert(src, out.as_deref(), *fmt),
		None => {
			eprintln!("No subcommand specified. Run `bits --help` for usage.");
			process::exit(1);
		}
	};

	if let Err(e) = result {
		match e.downcast::<bits_core::BitsError>() {
			Ok(bits_err) => {
				let report: miette::Report = (*bits_err).into();
				eprintln!("{report:?}");
			}
			Err(e) => {
				eprintln!("{} {e}", colored!("error:", red));
			}
		}
		process::exit(2);
	}
}

/// `RUST_LOG` wins; otherwise warnings, or debug output with `--verbose`.
fn init_logging(verbose: bool, use_color: bool) {
	let fallback = if verbose { "bits_core=debug,bits=debug" } else { "warn" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_ansi(use_color)
		.without_time()
		.init();
}

fn resolve_root(args: &BitsCli) -> PathBuf {
	args.root
		.clone()
		.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Load the config for the project root. Relative paths in it are taken
/// from the root, not from whichever registry uses them.
fn load_config(root: &Path) -> Result<BitsConfig, Box<dyn std::error::Error>> {
	let mut config = BitsConfig::load(root)?;
	let absolute = |path: &mut Option<PathBuf>| {
		if let Some(path) = path.as_mut().filter(|path| path.is_relative()) {
			*path = root.join(&*path);
		}
	};

	absolute(&mut config.defaults.template);
	absolute(&mut config.defaults.dest);
	absolute(&mut config.output.build_dir);
	absolute(&mut config.output.intermediates_dir);

	Ok(config)
}

fn make_relative(path: &Path, root: &Path) -> String {
	path.strip_prefix(root)
		.unwrap_or(path)
		.display()
		.to_string()
}

struct BuildArgs<'a> {
	path: &'a Path,
	tex: bool,
	no_pdf: bool,
	build_dir: Option<&'a Path>,
}

fn run_build(args: &BitsCli, build: &BuildArgs<'_>, watch: bool) -> Result<(), Box<dyn std::error::Error>> {
	let root = resolve_root(args);
	let config = load_config(&root)?;

	let mut options = CompileOptions::from_config(&config.output);
	options.tex |= build.tex;
	options.pdf &= !build.no_pdf;
	if let Some(build_dir) = build.build_dir {
		options.build_dir = Some(build_dir.to_path_buf());
	}

	let compiler = LatexCompiler::from_config(&config.latex);
	let engine = TemplateEngine::new()?;
	let store = RegistryStore::new(config);
	let context = BuildContext {
		root: &root,
		store: &store,
		engine: &engine,
		compiler: &compiler,
		options: &options,
	};

	let first = context.build_once(build.path, args.verbose);
	if !watch {
		return first;
	}
	if let Err(e) = first {
		eprintln!("{} {e}", colored!("error:", red));
	}

	println!("\nWatching for file changes... (press Ctrl+C to stop)");

	let watch_set = Arc::new(Mutex::new(context.watch_set(build.path)));
	let (tx, rx) = mpsc::channel();
	let filter = Arc::clone(&watch_set);
	let mut watcher =
		notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
			if let Ok(event) = res {
				let triggers = filter
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.triggers(&event);
				if triggers {
					let _ = tx.send(());
				}
			}
		})?;

	use notify::Watcher;
	let mut watched = HashSet::new();
	let dirs = watch_set.lock().unwrap_or_else(PoisonError::into_inner).dirs();
	for directory in dirs {
		watcher.watch(&directory, notify::RecursiveMode::NonRecursive)?;
		watched.insert(directory);
	}

	loop {
		rx.recv()?;
		// Debounce: drain additional events within 200ms.
		while rx.recv_timeout(Duration::from_millis(200)).is_ok() {}

		println!("\nFile change detected, rebuilding...");
		if let Err(e) = context.build_once(build.path, args.verbose) {
			eprintln!("{} {e}", colored!("error:", red));
		}

		// Imports and templates may have changed.
		let next = context.watch_set(build.path);
		for directory in next.dirs() {
			if watched.insert(directory.clone()) {
				tracing::debug!(dir = %directory.display(), "watching new directory");
				watcher.watch(&directory, notify::RecursiveMode::NonRecursive)?;
			}
		}
		*watch_set.lock().unwrap_or_else(PoisonError::into_inner) = next;
	}
}

/// Everything one build needs, kept across watch iterations so the
/// compiler's change cache survives.
struct BuildContext<'a> {
	root: &'a Path,
	store: &'a RegistryStore,
	engine: &'a TemplateEngine,
	compiler: &'a LatexCompiler,
	options: &'a CompileOptions,
}

impl BuildContext<'_> {
	fn build_once(&self, path: &Path, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
		let registry = self.store.get(path)?;
		let artifacts = registry.render(self.engine, self.compiler, self.options)?;

		if artifacts.is_empty() {
			println!("No targets found in {}.", make_relative(registry.path(), self.root));
			return Ok(());
		}

		let mut built = 0;
		for artifact in &artifacts {
			built += usize::from(!artifact.skipped);
			self.report(artifact, verbose);
		}

		println!(
			"{} {built} of {} target(s).",
			colored!("Built", green),
			artifacts.len()
		);

		Ok(())
	}

	fn report(&self, artifact: &Artifact, verbose: bool) {
		if let Some(tex) = &artifact.tex {
			println!("  wrote {}", make_relative(tex, self.root));
		}

		match &artifact.pdf {
			Some(pdf) if artifact.skipped => {
				if verbose {
					println!("  unchanged {}", make_relative(pdf, self.root));
				}
			}
			Some(pdf) => println!("  compiled {}", make_relative(pdf, self.root)),
			None => {}
		}
	}

	/// The registry, its dependencies and its templates.
	fn watch_set(&self, path: &Path) -> WatchSet {
		let mut files = self.store.watch_paths(path);
		if let Some(registry) = self.store.cached(path) {
			files.extend(
				registry
					.targets()
					.iter()
					.map(|target| target.template().to_path_buf()),
			);
		}

		WatchSet::new(files)
	}
}

fn run_list(args: &BitsCli, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
	let root = resolve_root(args);
	let store = RegistryStore::new(load_config(&root)?);
	let registry = store.get(path)?;

	let bits = registry.bits();
	let constants = registry.constants();
	let targets = registry.targets();

	if bits.is_empty() && constants.is_empty() && targets.is_empty() {
		println!("No bits, constants or targets found.");
		return Ok(());
	}

	if !bits.is_empty() {
		println!("{}", colored!("Bits:", bold));
		for bit in &bits {
			let fragments = bit.fragment_names();
			let fragments = if fragments.len() > 1 {
				format!(" ({})", fragments.join(", "))
			} else {
				String::new()
			};
			println!("  {}{fragments} [{}]", bit.label(), bit.tags().join(", "));

			if args.verbose && !bit.presets().is_empty() {
				let presets: Vec<String> = bit
					.presets()
					.iter()
					.enumerate()
					.map(|(index, preset)| {
						preset
							.display_name()
							.unwrap_or_else(|| format!("#{}", index + 1))
					})
					.collect();
				println!("    presets: {}", presets.join(", "));
			}
		}
	}

	if !constants.is_empty() {
		println!("{}", colored!("Constants:", bold));
		for constant in &constants {
			println!("  {} {constant}", constant.label());
		}
	}

	if !targets.is_empty() {
		println!("{}", colored!("Targets:", bold));
		for target in &targets {
			println!(
				"  {} -> {}",
				target.label(),
				make_relative(target.dest(), &root)
			);
			if args.verbose {
				println!("    template: {}", make_relative(target.template(), &root));
			}
		}
	}

	println!(
		"\n{} bit(s), {} constant(s), {} target(s)",
		bits.len(),
		constants.len(),
		targets.len()
	);

	Ok(())
}

fn run_convert(
	src: &Path,
	out: Option<&Path>,
	fmt: Option<ConvertFormat>,
) -> Result<(), Box<dyn std::error::Error>> {
	let out = match (out, fmt) {
		(Some(out), _) => out.to_path_buf(),
		(None, Some(fmt)) => src.with_extension(fmt.extension()),
		(None, None) => return Err("pass either `--out <file>` or `--fmt <format>`".into()),
	};

	if out == src {
		return Err(format!("refusing to overwrite `{}` with itself", src.display()).into());
	}

	let parsed = document::parse_file(src, &Default::default())?;
	document::dump(&parsed, &out)?;
	println!("Wrote {}", out.display());

	Ok(())
}
