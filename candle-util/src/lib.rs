pub mod candle_dists;
pub mod qdist;

pub use candle_core;
pub use candle_nn;
