//! Light-shaped view of a coordinator for host platforms.

use std::sync::Arc;

use log::warn;

use crate::coordinator::{Coordinator, DeviceInfo};
use crate::errors::Error;
use crate::types::{HueSaturation, Level};

type Result<T> = std::result::Result<T, Error>;

/// Optional changes applied by [`LightEntity::turn_on`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOn {
    /// Host scale, 0 to 255.
    pub brightness: Option<u8>,
    pub hs_color: Option<HueSaturation>,
    /// Effect display name, as listed by [`LightEntity::effect_list`].
    pub effect: Option<String>,
}

/// A light entity backed by a [`Coordinator`].
///
/// Reads always come from the coordinator's view; this type keeps no state
/// of its own.
pub struct LightEntity {
    coordinator: Arc<Coordinator>,
    name: String,
}

impl LightEntity {
    pub fn new(coordinator: Arc<Coordinator>, name: &str) -> Self {
        LightEntity {
            coordinator,
            name: name.to_string(),
        }
    }

    pub fn unique_id(&self) -> String {
        format!("{}_light", self.coordinator.identity().mac_address())
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.coordinator.device_info(&self.name)
    }

    pub fn available(&self) -> bool {
        self.coordinator.view().available()
    }

    pub fn is_on(&self) -> bool {
        self.coordinator
            .view()
            .state()
            .is_some_and(|state| state.is_on())
    }

    pub fn brightness(&self) -> Option<u8> {
        self.coordinator
            .view()
            .state()
            .map(|state| state.brightness().to_byte())
    }

    pub fn hs_color(&self) -> Option<HueSaturation> {
        self.coordinator.view().state().map(|state| state.hs_color())
    }

    /// Display name of the running effect.
    pub fn effect(&self) -> Option<String> {
        self.coordinator
            .view()
            .state()
            .and_then(|state| state.current_effect_name().map(String::from))
    }

    pub fn effect_list(&self) -> Option<Vec<String>> {
        self.coordinator.view().state().map(|state| {
            state
                .effect_list()
                .into_iter()
                .map(String::from)
                .collect()
        })
    }

    /// Apply brightness, then color, then effect, then power on. Stops at the
    /// first failing command. Unknown effect names are skipped.
    pub async fn turn_on(&self, options: TurnOn) -> Result<()> {
        if let Some(brightness) = options.brightness {
            self.coordinator
                .set_brightness(Level::from_byte(brightness).value())
                .await?;
        }

        if let Some(color) = options.hs_color {
            self.coordinator.set_hue(color.hue_level().value()).await?;
            self.coordinator
                .set_saturation(color.saturation_level().value())
                .await?;
        }

        if let Some(name) = options.effect {
            let id = self
                .coordinator
                .view()
                .state()
                .and_then(|state| state.find_effect(&name).map(|effect| effect.id));
            match id {
                Some(id) => self.coordinator.set_effect(id).await?,
                None => warn!("{}: no effect named {name:?}", self.unique_id()),
            }
        }

        self.coordinator.turn_on().await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.coordinator.turn_off().await
    }
}
