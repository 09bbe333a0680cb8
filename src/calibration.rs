//! Conversion of raw sensor channel values into calibrated measurements.
//!
//! The station samples a 10-bit ADC for the two gas sensors, the light dependent resistor and
//! the pH probe. Temperature and humidity come from a DHT22 that already reports physical
//! units.
use serde::{Deserialize, Serialize};

use crate::record::SensorValues;

/// Highest value of the 10-bit ADC.
const ADC_MAX: f64 = 1023.0;

const MQ2_A: f64 = 800.0;
const MQ2_B: f64 = -1.5;
const MQ135_A: f64 = 1000.0;
const MQ135_B: f64 = -2.862;

const MQ2_ALARM_PPM: f64 = 30.0;
const MQ135_ALARM_PPM: f64 = 300.0;

const MAX_LUX_SCALE: f64 = 500.0;

const PH_ACIDIC_BELOW_VOLTS: f64 = 1.60;
const PH_BASIC_ABOVE_VOLTS: f64 = 1.65;

const SENSOR_READ_ERROR: &str = "Sensor read error";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
/// Calibration constants of the station hardware.
pub struct Calibration {
    /// Reference voltage of the ADC in volts.
    pub v_ref: f64,
    /// Load resistance of the gas sensor circuits in kΩ.
    pub r_load: f64,
    /// Resistance of the MQ-2 sensor in clean air in kΩ.
    pub r0_mq2: f64,
    /// Resistance of the MQ-135 sensor in clean air in kΩ.
    pub r0_mq135: f64,
    /// Offset subtracted from the reported relative humidity.
    pub humidity_correction: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            v_ref: 3.3,
            r_load: 10.0,
            r0_mq2: 25.0,
            r0_mq135: 25.0,
            humidity_correction: 10.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Uncalibrated values of one sampling round.
pub struct RawSample {
    /// Temperature reported by the DHT22 in celsius.
    pub temperature: Option<f64>,
    /// Relative humidity reported by the DHT22.
    pub humidity: Option<f64>,
    /// ADC value of the MQ-2 analog output.
    pub mq2_adc: u16,
    /// ADC value of the MQ-135 analog output.
    pub mq135_adc: u16,
    /// ADC value of the light dependent resistor.
    pub light_adc: u16,
    /// ADC value of the pH probe.
    pub ph_adc: u16,
}

impl Calibration {
    pub fn voltage(&self, adc: u16) -> f64 {
        f64::from(adc) * self.v_ref / ADC_MAX
    }

    /// Resistance of a gas sensor in kΩ, infinite if no voltage is measured.
    pub fn resistance(&self, adc: u16) -> f64 {
        let v_out = self.voltage(adc);
        if v_out <= 0.0 {
            return f64::INFINITY;
        }
        self.r_load * (self.v_ref / v_out - 1.0)
    }

    pub fn mq2_ppm(&self, adc: u16) -> Option<f64> {
        power_law_ppm(self.resistance(adc), self.r0_mq2, MQ2_A, MQ2_B)
    }

    pub fn mq135_ppm(&self, adc: u16) -> Option<f64> {
        power_law_ppm(self.resistance(adc), self.r0_mq135, MQ135_A, MQ135_B)
    }

    /// Classifies the pH probe voltage into an estimated pH value and a status.
    pub fn ph(&self, adc: u16) -> (f64, &'static str) {
        let voltage = self.voltage(adc);
        if voltage < PH_ACIDIC_BELOW_VOLTS {
            (4.5, "ACIDIC")
        } else if voltage > PH_BASIC_ABOVE_VOLTS {
            (8.5, "BASIC")
        } else {
            (7.0, "NEUTRAL")
        }
    }

    pub fn humidity(&self, humidity: f64) -> f64 {
        (humidity - self.humidity_correction).max(0.0)
    }

    /// Converts a raw sample into calibrated sensor values.
    pub fn apply(&self, sample: &RawSample) -> SensorValues {
        let gas_mq2 = self.mq2_ppm(sample.mq2_adc);
        let gas_mq135 = self.mq135_ppm(sample.mq135_adc);
        let (ph, ph_status) = self.ph(sample.ph_adc);

        SensorValues {
            temperature: sample.temperature,
            humidity: sample.humidity.map(|humidity| self.humidity(humidity)),
            ph: Some(ph),
            ph_status: Some(ph_status.to_string()),
            illuminance: Some(lux(sample.light_adc)),
            gas_mq2,
            gas_mq135,
            mq2_status: Some(mq2_status(gas_mq2).to_string()),
            mq135_status: Some(mq135_status(gas_mq135).to_string()),
        }
    }
}

/// `ppm = a * (rs / r0)^b`, rounded to two decimals.
fn power_law_ppm(rs: f64, r0: f64, a: f64, b: f64) -> Option<f64> {
    let ratio = if r0 > 0.0 { rs / r0 } else { 0.0 };
    if !(ratio > 0.0) {
        return None;
    }
    let ppm = a * ratio.powf(b);
    if !ppm.is_finite() {
        return None;
    }
    Some((ppm * 100.0).round() / 100.0)
}

/// Quadratic mapping of the inverted LDR value, more sensitive in the dark.
pub fn lux(adc: u16) -> f64 {
    let adc = f64::from(adc);
    if adc >= ADC_MAX {
        return 0.0;
    }
    let normalized = (ADC_MAX - adc) / ADC_MAX;
    (normalized * normalized * MAX_LUX_SCALE).max(0.0)
}

pub fn mq2_status(ppm: Option<f64>) -> &'static str {
    match ppm {
        Some(ppm) if ppm >= MQ2_ALARM_PPM => "Gas detected",
        Some(_) => "Safe",
        None => SENSOR_READ_ERROR,
    }
}

pub fn mq135_status(ppm: Option<f64>) -> &'static str {
    match ppm {
        Some(ppm) if ppm >= MQ135_ALARM_PPM => "Poor air (>=300 PPM)",
        Some(_) => "Good air (<300 PPM)",
        None => SENSOR_READ_ERROR,
    }
}
