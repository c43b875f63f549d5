mod gpu;
mod shader;

pub use gpu::WgpuEngine;
