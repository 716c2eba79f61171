mod cancel;
mod engine;
mod report;
mod retry;

pub use cancel::*;
pub use engine::*;
pub use report::*;

#[cfg(test)]
mod mem_backend;
