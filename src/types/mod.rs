//! Value types for device control parameters.

mod effect;
mod hue_saturation;
mod level;

pub use effect::{DeviceMode, Effect, EffectId};
pub use hue_saturation::HueSaturation;
pub use level::Level;
