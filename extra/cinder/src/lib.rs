//! Cinder: the Vulkan host runtime for Basalt compiled modules.
//!
//! A compiled module is a descriptor-set header followed by a SPIR-V body
//! (see `header`). The runtime parses the header, builds pipeline state
//! per entry point once (`cache`), binds caller buffers and dispatches
//! synchronously (`runtime`). Device memory is handed out as regions
//! suballocated from larger blocks (`allocator`).

pub mod allocator;
pub mod cache;
pub mod context;
pub mod error;
pub mod header;
pub mod runtime;

pub use context::DeviceContext;
pub use error::RuntimeError;
pub use header::{parse_module, EntryPointLayout, ParsedModule};
pub use runtime::DeviceRuntime;
