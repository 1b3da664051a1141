//! # ssair: a language-neutral shader SSA intermediate representation.
//!
//! `ssair` sits between shading languages the way an LLVM-style IR sits
//! between source languages and machine backends: front-ends lower
//! WGSL, GLSL or MSL source into one shared [`ir::Module`], a
//! validator checks the result is structurally sound, and back-ends
//! re-render that module as WGSL or MSL source or a SPIR-V binary.
//!
//! ```ignore
//! let opts = front::BuildOptions::default();
//! let module = front::wgsl::parse(src, &opts)?;
//! let diags = validate::validate(&module);
//! assert!(diags.is_empty());
//! let spirv_words = back::spv::emit(&module, &opts)?;
//! ```
//!
//! ## Layout
//!
//! - [`ir`] owns the module: types, constants, globals, functions and
//!   entry points, plus the [`ir::builder::Builder`] façade used to
//!   construct one by hand or from a front-end.
//! - [`front`] holds one sub-module per source dialect
//!   (`front::wgsl`, `front::glsl`, `front::msl`), each exposing a
//!   single `parse` entry point.
//! - [`back`] holds one sub-module per output target (`back::wgsl`,
//!   `back::msl`, `back::spv`), each exposing a single `emit` entry
//!   point.
//! - [`validate`] walks a finished module and reports every structural
//!   problem it finds in one pass, rather than failing at the first.
//! - [`error`] is the shared `anyhow`-based result type plus the
//!   [`error::Diag`] diagnostic record front-ends use to report parse
//!   errors with source spans.
pub mod back;
pub mod error;
pub mod front;
pub mod ir;
pub mod validate;

#[cfg(test)]
mod tests_e2e;

pub use error::{Error, Result};
pub use front::BuildOptions;
pub use ir::builder::Builder;
pub use ir::{Id, Module};
pub use validate::{validate, ValidationDiag};
