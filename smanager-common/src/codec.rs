//! Wire codec for energy readings.
//!
//! A reading travels as UTF-8 text with exactly four colon-separated fields:
//!
//! ```text
//! <deviceId>:<room>:<deviceType>:<energyConsumption>
//! ```
//!
//! Payloads come straight off the network, so [`decode`] never panics: every
//! malformed input maps to a [`DecodeError`].

use thiserror::Error;

use crate::reading::Reading;

/// Field delimiter of the wire format.
pub const DELIMITER: char = ':';

/// Number of fields in a well-formed payload.
pub const FIELD_COUNT: usize = 4;

/// Errors produced while decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8")]
    InvalidEncoding,

    #[error("Malformed payload: expected 4 fields, found {fields}")]
    MalformedPayload { fields: usize },

    #[error("Invalid energy consumption value: {0:?}")]
    InvalidNumber(String),
}

/// Decode a raw message body into a [`Reading`].
pub fn decode(raw: &[u8]) -> Result<Reading, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidEncoding)?;

    let fields: Vec<&str> = text.split(DELIMITER).collect();
    let [device_id, room, device_type, energy] = fields[..] else {
        return Err(DecodeError::MalformedPayload {
            fields: fields.len(),
        });
    };

    let energy = energy.trim();
    let energy_consumption: f64 = energy
        .parse()
        .map_err(|_| DecodeError::InvalidNumber(energy.to_string()))?;

    // NaN or infinity would poison the running total
    if !energy_consumption.is_finite() {
        return Err(DecodeError::InvalidNumber(energy.to_string()));
    }

    Ok(Reading::new(device_id, room, device_type, energy_consumption))
}

/// Encode a reading into its wire form.
///
/// Uses the shortest representation that parses back to the same `f64`, so
/// `decode(encode(r)) == r` for finite values and delimiter-free fields.
pub fn encode(reading: &Reading) -> String {
    format!(
        "{}{d}{}{d}{}{d}{}",
        reading.device_id,
        reading.room,
        reading.device_type,
        reading.energy_consumption,
        d = DELIMITER
    )
}
