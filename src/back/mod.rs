//! Back-end emitters (spec.md §4.5-§4.7, C6-C8): `spv` serializes a
//! module to a SPIR-V word stream, `wgsl` and `msl` re-render it as
//! source text. Each module exposes a single `emit(module, opts) ->
//! Result<Out>` entry point, matching the crate-level shape SPEC_FULL.md
//! §6 lays out.
pub mod msl;
pub mod spv;
pub mod wgsl;
