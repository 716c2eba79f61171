mod hasher;
mod plan;

pub use hasher::*;
pub use plan::*;
