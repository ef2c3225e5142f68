//! Pulls readings out of upstream payloads and range-checks them before publication.
//!
//! Extraction never invents values: a field the API did not report stays `None`, so an
//! unmeasured zone never shows up as 0 °C or 0 %.

use core::fmt;
use std::error::Error;
use std::ops::RangeInclusive;

use crate::models::tado::{HomePresence, HomeState, Power, Weather, ZoneState};

pub const CELSIUS_RANGE: RangeInclusive<f64> = -50.0..=60.0;
pub const PERCENTAGE_RANGE: RangeInclusive<f64> = 0.0..=100.0;

/// Every numeric field that passes through validation before reaching a gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    MeasuredTemperature,
    TargetTemperature,
    Humidity,
    HeatingPower,
    OutsideTemperature,
    SolarIntensity,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::MeasuredTemperature => "measured_temperature_celsius",
            Field::TargetTemperature => "target_temperature_celsius",
            Field::Humidity => "measured_humidity_percentage",
            Field::HeatingPower => "heating_power_percentage",
            Field::OutsideTemperature => "outside_temperature_celsius",
            Field::SolarIntensity => "solar_intensity_percentage",
        }
    }

    pub fn valid_range(self) -> RangeInclusive<f64> {
        match self {
            Field::MeasuredTemperature | Field::TargetTemperature | Field::OutsideTemperature => CELSIUS_RANGE,
            Field::Humidity | Field::HeatingPower | Field::SolarIntensity => PERCENTAGE_RANGE,
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Field::MeasuredTemperature | Field::TargetTemperature | Field::OutsideTemperature => "°C",
            Field::Humidity | Field::HeatingPower | Field::SolarIntensity => "%",
        }
    }

    /// Range-check `value`; the only way to obtain a [`ValidatedMetric`].
    pub fn check(self, value: f64) -> Result<ValidatedMetric, ValidationError> {
        let range = self.valid_range();
        let reason = if !value.is_finite() {
            "not a finite number".to_string()
        } else if !range.contains(&value) {
            format!(
                "outside valid range [{}, {}] {}",
                range.start(),
                range.end(),
                self.unit()
            )
        } else {
            return Ok(ValidatedMetric { field: self, value });
        };
        Err(ValidationError {
            field: self,
            value,
            reason,
        })
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A reading cleared for publication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatedMetric {
    field: Field,
    value: f64,
}

impl ValidatedMetric {
    pub fn field(&self) -> Field {
        self.field
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: Field,
    pub value: f64,
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} rejected: {}", self.field, self.value, self.reason)
    }
}

impl Error for ValidationError {}

/// Celsius reading plus the Fahrenheit value the API reported alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TemperatureReading {
    pub celsius: Option<f64>,
    pub fahrenheit: Option<f64>,
}

impl TemperatureReading {
    /// Validates Celsius; Fahrenheit is derived and only travels with a valid Celsius value.
    pub fn check(&self, field: Field) -> Option<Result<(ValidatedMetric, Option<f64>), ValidationError>> {
        let celsius = self.celsius?;
        Some(field.check(celsius).map(|valid| (valid, self.fahrenheit)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ZoneReading {
    pub measured_temperature: TemperatureReading,
    pub humidity: Option<f64>,
    pub target_temperature: TemperatureReading,
    pub heating_power: Option<f64>,
    pub window_open: bool,
    pub device_on: Option<bool>,
}

pub fn zone_reading(state: &ZoneState) -> ZoneReading {
    let sensors = state.sensor_data_points.as_ref();
    let inside = sensors.and_then(|s| s.inside_temperature.as_ref());
    let setting = state.setting.as_ref();
    let target = setting.and_then(|s| s.temperature.as_ref());

    ZoneReading {
        measured_temperature: TemperatureReading {
            celsius: inside.and_then(|t| t.celsius),
            fahrenheit: inside.and_then(|t| t.fahrenheit),
        },
        humidity: sensors
            .and_then(|s| s.humidity.as_ref())
            .and_then(|h| h.percentage),
        target_temperature: TemperatureReading {
            celsius: target.and_then(|t| t.celsius),
            fahrenheit: target.and_then(|t| t.fahrenheit),
        },
        heating_power: state
            .activity_data_points
            .as_ref()
            .and_then(|a| a.heating_power.as_ref())
            .and_then(|p| p.percentage),
        window_open: state.open_window.is_some(),
        device_on: setting.and_then(|s| s.power).map(|p| p == Power::On),
    }
}

pub fn resident_present(state: &HomeState) -> Option<bool> {
    state.presence.map(|p| p == HomePresence::Home)
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AmbientReading {
    pub outside_temperature: TemperatureReading,
    pub solar_intensity: Option<f64>,
}

pub fn ambient_reading(weather: &Weather) -> AmbientReading {
    let outside = weather.outside_temperature.as_ref();
    AmbientReading {
        outside_temperature: TemperatureReading {
            celsius: outside.and_then(|t| t.celsius),
            fahrenheit: outside.and_then(|t| t.fahrenheit),
        },
        solar_intensity: weather.solar_intensity.as_ref().and_then(|s| s.percentage),
    }
}
