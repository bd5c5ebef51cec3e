//! `bits_core` is the resolution engine behind the `bits` command. It compiles
//! registries of reusable LaTeX fragments ("bits"), constants and targets
//! into fully resolved render contexts, and hands each rendered target to a
//! document compiler.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Registry file (YAML / JSON / TOML / Markdown)
//!   → Document (parse, `${var}` interpolation)
//!   → Imports (dependency registries, bits and constants appended)
//!   → Bit defaults (queries resolved once per load)
//!   → Targets (extends folded, overrides applied, queries run and composed)
//!   → Template engine (minijinja with a LaTeX-friendly syntax)
//!   → Document compiler (pdflatex, hash cache, log extraction)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from `bits.toml` and the legacy `.bitsrc`, with environment overrides.
//! - [`document`]: Reading and writing registry files, including the markdown registry format.
//! - [`extends`]: Target inheritance across one or many bases, local or cross-file.
//!
//! ## Key Types
//!
//! - [`RegistryStore`]: Path-keyed cache of loaded registries.
//! - [`Registry`]: One registry file with its bits, constants, targets and dependencies.
//! - [`Bit`]: A template fragment with defaults and named presets.
//! - [`Block`]: A bit bound to a resolved context, as produced by a query.
//! - [`Target`]: A template, its resolved context and its destination.
//! - [`TemplateEngine`]: The shared rendering environment.
//! - [`LatexCompiler`]: The default [`DocumentCompiler`].
//!
//! ## Queries
//!
//! Targets, bit defaults and presets declare `queries`. Each query filters a
//! collection with `where`, picks from the result with `select`, binds every
//! matched bit to a preset and layers `context` and `with` on top:
//!
//! ```yaml
//! queries:
//!   questions:
//!     where: { tags: [kinematics] }
//!     select: { k: 3, shuffle: true, seed: 7 }
//!     preset: hard
//! compose:
//!   all:
//!     from: [questions, extra]
//!     merge: interleave
//!     dedupe: by:name
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bits_core::BitsConfig;
//! use bits_core::CompileOptions;
//! use bits_core::LatexCompiler;
//! use bits_core::RegistryStore;
//! use bits_core::TemplateEngine;
//! use std::path::Path;
//!
//! let config = BitsConfig::load(Path::new(".")).unwrap();
//! let options = CompileOptions::from_config(&config.output);
//! let compiler = LatexCompiler::from_config(&config.latex);
//! let store = RegistryStore::new(config);
//!
//! let registry = store.get(Path::new("registry.yaml")).unwrap();
//! let engine = TemplateEngine::new().unwrap();
//! for artifact in registry.render(&engine, &compiler, &options).unwrap() {
//!     println!("{:?}", artifact.pdf);
//! }
//! ```

pub use bit::*;
pub use collection::*;
pub use compiler::*;
pub use compose::*;
pub use config::*;
pub use constant::*;
pub use context::*;
pub use document::DocumentFormat;
pub use element::*;
pub use error::*;
pub use extends::*;
pub use model::*;
pub use preset::*;
pub use query::*;
pub use registry::*;
pub use target::*;
pub use template::*;
pub use value::*;

mod bit;
mod collection;
mod compiler;
mod compose;
pub mod config;
mod constant;
mod context;
pub mod document;
mod element;
#[allow(unused_assignments)]
mod error;
pub mod extends;
mod model;
mod preset;
mod query;
mod registry;
pub(crate) mod resolve;
mod target;
mod template;
mod value;

#[cfg(test)]
mod __fixtures;
#[cfg(test)]
mod __tests;
