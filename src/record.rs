//! Module that contains all valid record types for this application.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
/// Named values sampled from the station sensors.
///
/// Every value may be absent if the sensor channel could not be read.
pub struct SensorValues
{
    /// Temperature value in celsius.
    pub temperature: Option<f64>,
    /// Relative humidity value.
    pub humidity: Option<f64>,
    /// Estimated pH value of the water probe.
    pub ph: Option<f64>,
    /// Classification of the pH value.
    pub ph_status: Option<String>,
    /// Illuminance value in lx.
    pub illuminance: Option<f64>,
    /// Flammable gas concentration from the MQ-2 sensor in ppm.
    pub gas_mq2: Option<f64>,
    /// Air quality gas concentration from the MQ-135 sensor in ppm.
    pub gas_mq135: Option<f64>,
    /// Classification of the MQ-2 concentration.
    pub mq2_status: Option<String>,
    /// Classification of the MQ-135 concentration.
    pub mq135_status: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Struct representing environmental data recorded at a specific timestamp.
pub struct Reading
{
    /// Timestamp the reading was recorded.
    timestamp: DateTime<Utc>,
    /// The sampled values.
    #[serde(flatten)]
    pub values: SensorValues,
}

impl Reading {
    /// Creates a reading stamped with the current time.
    pub fn new(values: SensorValues) -> Self {
        Reading::at(Utc::now(), values)
    }

    /// Creates a reading with a known timestamp.
    pub fn at(timestamp: DateTime<Utc>, values: SensorValues) -> Self {
        Reading { timestamp, values }
    }

    /// Timestamp the reading was recorded.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Value for the generic `gas` column of the sensor table, which mirrors the MQ-135 value.
    pub fn gas(&self) -> Option<f64> {
        self.values.gas_mq135
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Result reported by the object detector for a single frame.
pub struct DetectionEvent
{
    /// Label of the detected class.
    pub label: String,
    /// Number of detected objects.
    pub count: i32,
    /// Timestamp the detection was reported.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
/// A record travelling from the socket thread to the telemetry thread.
pub enum Telemetry {
    Reading(Reading),
    Detection(DetectionEvent),
}
