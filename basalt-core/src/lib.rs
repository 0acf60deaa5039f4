//! GPU back end for the Basalt image-processing compiler.
//!
//! The crate lowers a typed tensor-kernel IR to SPIR-V compute shaders:
//! `ir` defines the expression and statement trees, `intrinsics` holds the
//! fixed-point idiom recognizer and its inverse lowerings, and `spirv`
//! holds the module builder and the shader emitter producing the compiled
//! module (side-car header plus SPIR-V body) consumed by the host runtime.

pub mod bounds;
pub mod error;
pub mod interp;
pub mod intrinsics;
pub mod ir;
pub mod simplify;
pub mod spirv;

pub use error::{CompilerError, Result};
pub use intrinsics::find::{find_intrinsics, find_intrinsics_stmt};
pub use intrinsics::lower::{lower_intrinsic, lower_intrinsic_reference, lower_intrinsics};
pub use spirv::emitter::{emit_module, ArgKind, Kernel, KernelArg};
pub use spirv::module::CompiledModule;
