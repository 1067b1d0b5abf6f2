mod attention;
mod block;
mod discriminator;
mod generator;
mod init;
pub mod loss;
mod spectral_norm;

pub use attention::*;
pub use block::*;
pub use discriminator::*;
pub use generator::*;
pub use init::*;
pub use loss::{WGanGp, WGanGpInit};
pub use spectral_norm::*;
