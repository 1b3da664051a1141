//! WGSL front-end entry point: lex, parse, lower (spec.md §4.4).
pub mod lexer;
pub mod lower;
pub mod parser;

use crate::error::{anyhow, Result};
use crate::front::BuildOptions;
use crate::ir::Module;

pub fn parse(src: &str, opts: &BuildOptions) -> Result<Module> {
    let mut parser = parser::Parser::new(src).map_err(|d| anyhow!("{}", d))?;
    let decls = parser.parse_module().map_err(|d| anyhow!("{}", d))?;
    lower::lower(&decls, opts)
}
