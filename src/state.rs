//! Device state snapshots.

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::types::{DeviceMode, Effect, EffectId, HueSaturation, Level};

/// Snapshot of a device's observable condition.
///
/// `state_counter` is maintained by the device and increases on every
/// device-side mutation. Two snapshots carrying the same counter describe the
/// same device state; locally predicted snapshots keep the counter of the
/// snapshot they were derived from.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub(crate) is_on: bool,
    pub(crate) brightness: Level,
    pub(crate) hue: Level,
    pub(crate) saturation: Level,
    #[serde(rename = "currentEffectId", default)]
    pub(crate) current_effect: EffectId,
    #[serde(rename = "effectList", default)]
    pub(crate) effects: Vec<Effect>,
    #[serde(default)]
    pub(crate) model: Option<String>,
    #[serde(default)]
    pub(crate) firmware_version: Option<String>,
    #[serde(default)]
    pub(crate) nickname: Option<String>,
    pub(crate) state_counter: u64,
}

impl DeviceState {
    /// Check if the device is emitting light.
    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn brightness(&self) -> Level {
        self.brightness
    }

    pub fn hue(&self) -> Level {
        self.hue
    }

    pub fn saturation(&self) -> Level {
        self.saturation
    }

    /// Hue and saturation on the host scale.
    pub fn hs_color(&self) -> HueSaturation {
        HueSaturation::from_levels(self.hue, self.saturation)
    }

    pub fn current_effect(&self) -> &EffectId {
        &self.current_effect
    }

    /// The mode implied by the current effect.
    pub fn mode(&self) -> DeviceMode {
        self.current_effect.mode()
    }

    /// Effects in the order the device lists them.
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Display names of all effects, in device order.
    pub fn effect_list(&self) -> Vec<&str> {
        self.effects
            .iter()
            .map(|effect| effect.display_name.as_str())
            .collect()
    }

    /// Display name of the current effect, if the device listed it.
    pub fn current_effect_name(&self) -> Option<&str> {
        self.effects
            .iter()
            .find(|effect| effect.id == self.current_effect)
            .map(|effect| effect.display_name.as_str())
    }

    /// Look up an effect by display name.
    pub fn find_effect(&self, display_name: &str) -> Option<&Effect> {
        self.effects
            .iter()
            .find(|effect| effect.display_name == display_name)
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn state_counter(&self) -> u64 {
        self.state_counter
    }

    /// True when `other` carries the same counter and the same values, i.e.
    /// observing both is one change, not two.
    pub fn is_redundant_with(&self, other: &Self) -> bool {
        self.state_counter == other.state_counter && self == other
    }

    /// Predict the state after `command` succeeds.
    ///
    /// The counter is left untouched: only the device advances it.
    pub(crate) fn apply_command(&mut self, command: &Command) {
        match command {
            Command::Power(on) => self.is_on = *on,
            Command::Brightness(level) => self.brightness = *level,
            Command::Hue(level) => self.hue = *level,
            Command::Saturation(level) => self.saturation = *level,
            Command::Effect(id) => self.current_effect = *id,
            Command::Mode(mode) => {
                self.current_effect = EffectId::for_mode(*mode, &self.current_effect, &self.effects)
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_state(state_counter: u64) -> DeviceState {
    DeviceState {
        is_on: true,
        brightness: Level::create(0.5).unwrap(),
        hue: Level::create(0.25).unwrap(),
        saturation: Level::new(),
        current_effect: EffectId::Auto,
        effects: vec![
            Effect::new(EffectId::Auto, "Auto"),
            Effect::new(EffectId::Scene(0), "Sunset"),
            Effect::new(EffectId::Manual(0), "Rainbow"),
        ],
        model: Some("Fluora".to_string()),
        firmware_version: Some("2.4.1".to_string()),
        nickname: Some("Living Room Tree".to_string()),
        state_counter,
    }
}
