use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

/// One telemetry sample published by a device.
///
/// On the wire this is a JSON object:
///
/// ```text
/// { "userId": "u1", "dId": "device-7", "variable": "relay", "value": 1, "time": 1718000000000 }
/// ```
///
/// `userId` and `time` are optional, the remaining keys are required. Unknown keys
/// are ignored. A `Message` only exists once every present field has the right type,
/// there is no partially populated value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(rename = "dId")]
    device_id: String,
    variable: String,
    value: f64,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<f64>,
}

impl Message {
    /// Builds a message from already typed parts.
    ///
    /// Fails for non-finite numbers, which have no JSON representation.
    pub fn new(
        user_id: Option<String>,
        device_id: impl Into<String>,
        variable: impl Into<String>,
        value: f64,
        time: Option<f64>,
    ) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::Parse("value must be a finite number".to_string()));
        }
        if time.is_some_and(|t| !t.is_finite()) {
            return Err(Error::Parse("time must be a finite number".to_string()));
        }

        Ok(Self {
            user_id,
            device_id: device_id.into(),
            variable: variable.into(),
            value,
            time,
        })
    }

    /// Parses and validates a JSON payload.
    ///
    /// Syntax errors, missing required fields and wrongly typed fields all surface
    /// as [`Error::Parse`] carrying the underlying description.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Canonical JSON form, absent optional fields are omitted.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            error!("Failed to serialize message from {}: {}", self.device_id, e);
            String::new()
        })
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn time(&self) -> Option<f64> {
        self.time
    }

    /// A variable is "on" when its value is non-zero.
    ///
    /// Only the numeric value counts. String sentinels such as `"ON"` are not
    /// interpreted.
    pub fn is_on(&self) -> bool {
        self.value != 0.0
    }

    /// Local date and time of the sample, if it carries a timestamp.
    pub fn formatted_time(&self) -> Option<String> {
        let millis = self.time.filter(|t| *t != 0.0)?;
        let utc = DateTime::from_timestamp_millis(millis as i64)?;
        Some(
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}
