//! GLSL front-end entry point: lex, parse, lower (spec.md §4.4).
//!
//! GLSL's grammar carries no stage marker of its own (no `@vertex`-style
//! attribute, no `#pragma` this front-end parses) -- `parse` takes the
//! target [`crate::ir::entry::Stage`] explicitly, the way an external
//! build pipeline already knows which stage a `.vert`/`.frag`/`.comp`
//! file compiles for.
pub mod lexer;
pub mod lower;
pub mod parser;

use crate::error::{anyhow, Result};
use crate::front::BuildOptions;
use crate::ir::entry::Stage;
use crate::ir::Module;

pub fn parse(src: &str, stage: Stage, opts: &BuildOptions) -> Result<Module> {
    let mut parser = parser::Parser::new(src).map_err(|d| anyhow!("{}", d))?;
    let decls = parser.parse_module().map_err(|d| anyhow!("{}", d))?;
    lower::lower(&decls, stage, opts)
}
