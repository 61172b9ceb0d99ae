//! Attribute/identity conditioned blending blocks over `ndarray`.
//!
//! [`AddLayer`] mixes an attribute-modulated and an identity-modulated copy
//! of an instance-normalized feature map; [`AddResBlk`] stacks two of those
//! stages with 3x3 convolutions and a residual path.

pub mod add;
pub mod config;
pub mod error;
pub mod layers;
pub mod params;

pub use add::{AddLayer, AddResBlk, BlendTrace};
pub use config::{BlendSharing, BlockConfig, DEFAULT_ID_CHANNELS};
pub use error::{LayerError, Result};
pub use params::Parameters;
