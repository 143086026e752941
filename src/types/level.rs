//! Normalized levels for brightness, hue and saturation.

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// A normalized device level in `0.0..=1.0`.
///
/// Devices report and accept brightness, hue and saturation on this scale.
/// Host applications usually work on byte or percent scales, see
/// [`Level::from_byte`] and [`Level::to_byte`].
///
/// Values read from the wire are clamped into range.
#[derive(Default, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, PartialOrd)]
#[serde(from = "f32", into = "f32")]
pub struct Level {
    pub(crate) value: f32,
}

impl Level {
    const MIN: f32 = 0.0;
    const MAX: f32 = 1.0;

    /// Full level (1.0).
    pub fn new() -> Self {
        Level { value: Self::MAX }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Returns None if value is outside `0.0..=1.0` or not a number.
    ///
    /// # Examples
    ///
    /// ```
    /// use pixelair_rs::Level;
    ///
    /// assert!(Level::create(0.0).is_some());
    /// assert!(Level::create(0.7).is_some());
    /// assert!(Level::create(1.0).is_some());
    /// assert!(Level::create(1.01).is_none());
    /// assert!(Level::create(f32::NAN).is_none());
    /// ```
    pub fn create(value: f32) -> Option<Self> {
        if Self::is_valid(value) {
            Some(Level { value })
        } else {
            None
        }
    }

    /// Clamps into range; NaN becomes 0.0.
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            return Level { value: Self::MIN };
        }
        Level {
            value: value.clamp(Self::MIN, Self::MAX),
        }
    }

    /// Convert from a 0-255 host scale.
    ///
    /// ```
    /// use pixelair_rs::Level;
    ///
    /// assert_eq!(Level::from_byte(255).value(), 1.0);
    /// assert_eq!(Level::from_byte(0).value(), 0.0);
    /// ```
    pub fn from_byte(value: u8) -> Self {
        Level {
            value: f32::from(value) / 255.0,
        }
    }

    /// Convert to a 0-255 host scale, rounding to the nearest step.
    ///
    /// ```
    /// use pixelair_rs::Level;
    ///
    /// assert_eq!(Level::create(0.5).unwrap().to_byte(), 128);
    /// assert_eq!(Level::from_byte(77).to_byte(), 77);
    /// ```
    pub fn to_byte(&self) -> u8 {
        (self.value * 255.0).round() as u8
    }

    pub(crate) fn checked(name: &'static str, value: f32) -> Result<Self, Error> {
        Self::create(value).ok_or(Error::InvalidLevel { name, value })
    }

    fn is_valid(value: f32) -> bool {
        (Self::MIN..=Self::MAX).contains(&value)
    }
}

impl From<f32> for Level {
    fn from(value: f32) -> Self {
        Level::clamped(value)
    }
}

impl From<Level> for f32 {
    fn from(level: Level) -> Self {
        level.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_are_clamped() {
        let level: Level = serde_json::from_str("1.5").unwrap();
        assert_eq!(level.value(), 1.0);
        let level: Level = serde_json::from_str("-0.2").unwrap();
        assert_eq!(level.value(), 0.0);
        let level: Level = serde_json::from_str("0.25").unwrap();
        assert_eq!(level.value(), 0.25);
        assert_eq!(serde_json::to_string(&level).unwrap(), "0.25");
    }

    #[test]
    fn test_nan_clamps_to_zero() {
        assert_eq!(Level::from(f32::NAN).value(), 0.0);
    }
}
