//! Control commands sent to a device.

use serde_json::{Value, json};

use crate::types::{DeviceMode, EffectId, Level};

/// A single control command.
///
/// Every command maps to one request/acknowledgement exchange with the
/// device. Commands are never retried automatically; a duplicate could make
/// the device flicker.
///
/// ```
/// use pixelair_rs::{Command, Level};
///
/// let cmd = Command::Brightness(Level::create(0.7).unwrap());
/// assert_eq!(cmd.method(), "setBrightness");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Power(bool),
    Brightness(Level),
    Hue(Level),
    Saturation(Level),
    Effect(EffectId),
    Mode(DeviceMode),
}

impl Command {
    /// Wire method name of this command.
    pub fn method(&self) -> &'static str {
        match self {
            Command::Power(_) => "setPower",
            Command::Brightness(_) => "setBrightness",
            Command::Hue(_) => "setHue",
            Command::Saturation(_) => "setSaturation",
            Command::Effect(_) => "setEffect",
            Command::Mode(_) => "setMode",
        }
    }

    /// Wire parameters of this command.
    pub fn params(&self) -> Value {
        match self {
            Command::Power(on) => json!({ "on": on }),
            Command::Brightness(level) => json!({ "brightness": level }),
            Command::Hue(level) => json!({ "hue": level }),
            Command::Saturation(level) => json!({ "saturation": level }),
            Command::Effect(id) => json!({ "effect": id }),
            Command::Mode(mode) => json!({ "mode": mode }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params() {
        assert_eq!(Command::Power(true).params(), json!({"on": true}));
        assert_eq!(
            Command::Effect(EffectId::Manual(2)).params(),
            json!({"effect": "manual:2"})
        );
        assert_eq!(
            Command::Mode(DeviceMode::Scene).params(),
            json!({"mode": "scene"})
        );
        assert_eq!(
            Command::Brightness(Level::new()).params(),
            json!({"brightness": 1.0})
        );
    }
}
