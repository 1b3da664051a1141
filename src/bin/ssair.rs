//! Command-line driver: reads a WGSL/GLSL/MSL shader, builds it into the
//! IR, validates it, and re-emits it as WGSL, MSL or SPIR-V (spec.md
//! SPEC_FULL §2 "C9"). Argument handling stays hand-rolled rather than
//! reaching for a parsing crate, the way the teacher's own `spirq` binary
//! walked `std::env::args()` directly.
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use ssair::back;
use ssair::error::anyhow;
use ssair::front;
use ssair::front::BuildOptions;
use ssair::ir::entry::Stage;
use ssair::ir::Module;
use ssair::validate;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Lang {
    Wgsl,
    Glsl,
    Msl,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Target {
    Wgsl,
    Msl,
    Spv,
}

struct Args {
    input: PathBuf,
    output: Option<PathBuf>,
    lang: Option<Lang>,
    stage: Option<Stage>,
    emit: Target,
}

fn usage() -> ! {
    eprintln!(
        "usage: ssair <input> --emit <wgsl|msl|spv> [--lang <wgsl|glsl|msl>] [--stage <vertex|fragment|compute>] [-o <output>]"
    );
    process::exit(2);
}

fn parse_args() -> Args {
    let mut input = None;
    let mut output = None;
    let mut lang = None;
    let mut stage = None;
    let mut emit = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--emit" => {
                emit = Some(match it.next().unwrap_or_default().as_str() {
                    "wgsl" => Target::Wgsl,
                    "msl" => Target::Msl,
                    "spv" | "spirv" => Target::Spv,
                    other => {
                        eprintln!("error: unknown --emit target '{}'", other);
                        usage();
                    }
                });
            }
            "--lang" => {
                lang = Some(match it.next().unwrap_or_default().as_str() {
                    "wgsl" => Lang::Wgsl,
                    "glsl" => Lang::Glsl,
                    "msl" => Lang::Msl,
                    other => {
                        eprintln!("error: unknown --lang '{}'", other);
                        usage();
                    }
                });
            }
            "--stage" => {
                stage = Some(match it.next().unwrap_or_default().as_str() {
                    "vertex" | "vert" => Stage::Vertex,
                    "fragment" | "frag" => Stage::Fragment,
                    "compute" | "comp" => Stage::Compute,
                    other => {
                        eprintln!("error: unknown --stage '{}'", other);
                        usage();
                    }
                });
            }
            "-o" | "--output" => {
                output = it.next().map(PathBuf::from);
            }
            _ if input.is_none() => input = Some(PathBuf::from(arg)),
            _ => {
                eprintln!("error: unexpected argument '{}'", arg);
                usage();
            }
        }
    }

    let input = input.unwrap_or_else(|| usage());
    let emit = emit.unwrap_or_else(|| usage());
    Args { input, output, lang, stage, emit }
}

/// Picks the front-end dialect from `--lang`, falling back to the
/// input's file extension the way a build pipeline already associates
/// `.wgsl`/`.vert`/`.frag`/`.comp`/`.metal` with a compiler stage.
fn infer_lang(path: &Path, explicit: Option<Lang>) -> Lang {
    if let Some(l) = explicit {
        return l;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("wgsl") => Lang::Wgsl,
        Some("metal") => Lang::Msl,
        Some("vert") | Some("frag") | Some("comp") | Some("glsl") => Lang::Glsl,
        _ => Lang::Wgsl,
    }
}

fn infer_stage(path: &Path, explicit: Option<Stage>) -> Stage {
    if let Some(s) = explicit {
        return s;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("vert") => Stage::Vertex,
        Some("comp") => Stage::Compute,
        _ => Stage::Fragment,
    }
}

fn build_module(src: &str, lang: Lang, stage: Stage, opts: &BuildOptions) -> ssair::Result<Module> {
    match lang {
        Lang::Wgsl => front::wgsl::parse(src, opts),
        Lang::Glsl => front::glsl::parse(src, stage, opts),
        Lang::Msl => front::msl::parse(src, opts),
    }
}

fn emit_module(module: &Module, target: Target, opts: &BuildOptions) -> ssair::Result<Vec<u8>> {
    match target {
        Target::Wgsl => back::wgsl::emit(module, opts).map(String::into_bytes),
        Target::Msl => back::msl::emit(module, opts).map(String::into_bytes),
        Target::Spv => back::spv::emit(module, opts).map(|words| words.iter().flat_map(|w| w.to_le_bytes()).collect()),
    }
}

fn run() -> ssair::Result<()> {
    let args = parse_args();
    let src = fs::read_to_string(&args.input)
        .map_err(|e| anyhow!("failed to read '{}': {}", args.input.display(), e))?;
    let lang = infer_lang(&args.input, args.lang);
    let stage = infer_stage(&args.input, args.stage);
    let opts = BuildOptions::default();

    log::debug!("building {:?} module from {}", lang, args.input.display());
    let module = build_module(&src, lang, stage, &opts)?;

    let diags = validate::validate(&module);
    if !diags.is_empty() {
        for diag in &diags {
            log::error!("{:?}", diag);
        }
        return Err(anyhow!("{} structural validation error(s)", diags.len()));
    }

    let bytes = emit_module(&module, args.emit, &opts)?;
    match args.output {
        Some(path) => fs::write(&path, &bytes)
            .map_err(|e| anyhow!("failed to write '{}': {}", path.display(), e))?,
        None => {
            use std::io::Write;
            std::io::stdout()
                .write_all(&bytes)
                .map_err(|e| anyhow!("failed to write to stdout: {}", e))?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {:#}", err);
        process::exit(1);
    }
}
