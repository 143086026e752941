//! Hue and Saturation on the host scale.

use super::Level;

/// Hue and Saturation color representation.
///
/// Host applications express color as:
/// - Hue: The color angle on the color wheel (0-360 degrees)
/// - Saturation: The intensity of the color (0-100 percent)
///
/// Devices use a normalized [`Level`] for both; this type converts between
/// the two.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HueSaturation {
    hue: f32,
    saturation: f32,
}

impl HueSaturation {
    /// Create a new HueSaturation with the given values.
    ///
    /// # Arguments
    ///
    /// * `hue` - Hue angle in degrees (0-360)
    /// * `saturation` - Saturation percentage (0-100)
    ///
    /// Returns `None` if values are outside valid ranges.
    ///
    /// # Examples
    ///
    /// ```
    /// use pixelair_rs::HueSaturation;
    ///
    /// assert!(HueSaturation::create(0.0, 100.0).is_some());
    /// assert!(HueSaturation::create(120.0, 50.0).is_some());
    /// assert!(HueSaturation::create(361.0, 50.0).is_none());
    /// assert!(HueSaturation::create(180.0, 101.0).is_none());
    /// ```
    pub fn create(hue: f32, saturation: f32) -> Option<Self> {
        if (0.0..=360.0).contains(&hue) && (0.0..=100.0).contains(&saturation) {
            Some(HueSaturation { hue, saturation })
        } else {
            None
        }
    }

    /// Build from the device's normalized levels.
    ///
    /// ```
    /// use pixelair_rs::{HueSaturation, Level};
    ///
    /// let hs = HueSaturation::from_levels(Level::create(0.5).unwrap(), Level::new());
    /// assert_eq!(hs.hue(), 180.0);
    /// assert_eq!(hs.saturation(), 100.0);
    /// ```
    pub fn from_levels(hue: Level, saturation: Level) -> Self {
        HueSaturation {
            hue: hue.value() * 360.0,
            saturation: saturation.value() * 100.0,
        }
    }

    /// Get the hue in degrees.
    pub fn hue(&self) -> f32 {
        self.hue
    }

    /// Get the saturation in percent.
    pub fn saturation(&self) -> f32 {
        self.saturation
    }

    pub fn hue_level(&self) -> Level {
        Level::clamped(self.hue / 360.0)
    }

    pub fn saturation_level(&self) -> Level {
        Level::clamped(self.saturation / 100.0)
    }
}
