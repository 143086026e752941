//! Device modes and effect identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::errors::Error;

/// Operating mode of a PixelAir device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceMode {
    /// The device cycles through its own animations.
    Auto,
    /// A preset scene is showing.
    Scene,
    /// A manually selected animation is showing.
    Manual,
}

impl DeviceMode {
    /// All modes in protocol order.
    ///
    /// ```
    /// use pixelair_rs::DeviceMode;
    ///
    /// let names: Vec<String> = DeviceMode::all().map(|m| m.to_string()).collect();
    /// assert_eq!(names, ["auto", "scene", "manual"]);
    /// ```
    pub fn all() -> impl Iterator<Item = DeviceMode> {
        DeviceMode::iter()
    }
}

/// Identifier of an effect, as used on the wire: `auto`, `scene:<n>` or
/// `manual:<n>`.
///
/// ```
/// use std::str::FromStr;
/// use pixelair_rs::{DeviceMode, EffectId};
///
/// let id = EffectId::from_str("scene:2").unwrap();
/// assert_eq!(id, EffectId::Scene(2));
/// assert_eq!(id.mode(), DeviceMode::Scene);
/// assert_eq!(id.to_string(), "scene:2");
/// assert!(EffectId::from_str("disco").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, SerializeDisplay, DeserializeFromStr)]
pub enum EffectId {
    #[default]
    Auto,
    Scene(u8),
    Manual(u8),
}

impl EffectId {
    pub fn mode(&self) -> DeviceMode {
        match self {
            EffectId::Auto => DeviceMode::Auto,
            EffectId::Scene(_) => DeviceMode::Scene,
            EffectId::Manual(_) => DeviceMode::Manual,
        }
    }

    /// The effect a device is expected to show after switching to `mode`.
    ///
    /// Staying in the current mode keeps the current effect; otherwise the
    /// first listed effect of that mode is picked.
    pub(crate) fn for_mode(mode: DeviceMode, current: &EffectId, effects: &[Effect]) -> EffectId {
        if current.mode() == mode {
            return *current;
        }
        effects
            .iter()
            .map(|effect| effect.id)
            .find(|id| id.mode() == mode)
            .unwrap_or(match mode {
                DeviceMode::Auto => EffectId::Auto,
                DeviceMode::Scene => EffectId::Scene(0),
                DeviceMode::Manual => EffectId::Manual(0),
            })
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectId::Auto => write!(f, "auto"),
            EffectId::Scene(index) => write!(f, "scene:{index}"),
            EffectId::Manual(index) => write!(f, "manual:{index}"),
        }
    }
}

impl FromStr for EffectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidEffectId(s.to_string());
        let (mode, index) = match s.split_once(':') {
            Some((mode, index)) => (mode, Some(index)),
            None => (s, None),
        };
        let mode = DeviceMode::from_str(mode).map_err(|_| invalid())?;
        match (mode, index) {
            (DeviceMode::Auto, None) => Ok(EffectId::Auto),
            (DeviceMode::Scene, Some(index)) => {
                index.parse().map(EffectId::Scene).map_err(|_| invalid())
            }
            (DeviceMode::Manual, Some(index)) => {
                index.parse().map(EffectId::Manual).map_err(|_| invalid())
            }
            _ => Err(invalid()),
        }
    }
}

/// An entry of a device's effect list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effect {
    pub id: EffectId,
    #[serde(rename = "name")]
    pub display_name: String,
}

impl Effect {
    pub fn new(id: EffectId, display_name: &str) -> Self {
        Effect {
            id,
            display_name: display_name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_id_parse() {
        assert_eq!(EffectId::from_str("auto").unwrap(), EffectId::Auto);
        assert_eq!(EffectId::from_str("manual:7").unwrap(), EffectId::Manual(7));
        assert!(EffectId::from_str("auto:1").is_err());
        assert!(EffectId::from_str("scene").is_err());
        assert!(EffectId::from_str("scene:x").is_err());
    }

    #[test]
    fn test_effect_json_shape() {
        let effect = Effect::new(EffectId::Scene(1), "Sunset");
        let json = serde_json::to_value(&effect).unwrap();
        assert_eq!(json, serde_json::json!({"id": "scene:1", "name": "Sunset"}));
    }

    #[test]
    fn test_for_mode() {
        let effects = vec![
            Effect::new(EffectId::Auto, "Auto"),
            Effect::new(EffectId::Scene(3), "Ocean"),
            Effect::new(EffectId::Manual(1), "Rainbow"),
        ];
        let current = EffectId::Scene(5);
        assert_eq!(
            EffectId::for_mode(DeviceMode::Scene, &current, &effects),
            EffectId::Scene(5)
        );
        assert_eq!(
            EffectId::for_mode(DeviceMode::Manual, &current, &effects),
            EffectId::Manual(1)
        );
        assert_eq!(
            EffectId::for_mode(DeviceMode::Manual, &current, &[]),
            EffectId::Manual(0)
        );
    }
}
