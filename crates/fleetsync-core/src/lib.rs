//! Core domain model for the fleet driver extract: parsed records, driver
//! profiles and the canonical national ID.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fleetsync-core";

/// Minimum number of `;`-separated columns a usable extract line carries.
pub const MIN_COLUMNS: usize = 17;

/// Field delimiter of the extract.
pub const DELIMITER: char = ';';

/// Driver reference code meaning "no driver assigned".
pub const NO_DRIVER_SENTINEL: i64 = 999_999;

/// Literal name the extract uses for a driver still "to be defined".
pub const PLACEHOLDER_DRIVER_NAME: &str = "EM DEFINICAO";

/// Legacy width of the city column in the driver table.
pub const CITY_MAX_CHARS: usize = 25;

/// Client id every driver written by this integration belongs to.
pub const DEFAULT_TENANT_ID: i64 = 269;

/// Eleven-digit national ID in canonical `DDD.DDD.DDD-DD` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NationalId(String);

impl NationalId {
    /// Strips every non-digit and accepts the value only when exactly eleven
    /// digits remain. Anything else is treated as absent.
    pub fn normalize(raw: &str) -> Option<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != 11 {
            return None;
        }
        Some(Self(format!(
            "{}.{}.{}-{}",
            &digits[..3],
            &digits[3..6],
            &digits[6..9],
            &digits[9..]
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for NationalId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::normalize(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("national id must have 11 digits, got {raw:?}"))
        })
    }
}

impl fmt::Display for NationalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutable driver attributes carried by one extract line. These are the
/// columns overwritten on every reappearance of a known driver.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriverProfile {
    pub name: String,
    pub phone: Option<String>,
    pub license: Option<String>,
    pub national_id: Option<NationalId>,
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
}

impl DriverProfile {
    pub fn is_placeholder(&self) -> bool {
        self.name == PLACEHOLDER_DRIVER_NAME
    }
}

/// One parsed line of the extract. Lives only while its line is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRecord {
    pub line_number: usize,
    pub vehicle_id: i64,
    pub vehicle_plate: String,
    pub trailer_plate: String,
    /// Upstream driver code; `None` when blank, non-numeric or the sentinel.
    pub driver_ref: Option<i64>,
    pub driver: DriverProfile,
}

/// Stored driver row as seen by the identity resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCandidate {
    pub driver_id: i64,
    pub name: String,
}

/// Reason a raw line never became an [`ExtractRecord`]. Always line-local.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum LineRejection {
    #[error("layout error: expected at least {expected} columns, got {found}")]
    Layout { expected: usize, found: usize },
    #[error("vehicle identifier is not an integer: {value:?}")]
    IdentityField { value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn national_id_formats_eleven_digits() {
        let id = NationalId::normalize("123.456.789-01").expect("valid id");
        assert_eq!(id.as_str(), "123.456.789-01");
        let id = NationalId::normalize(" 12345678901 ").expect("valid id");
        assert_eq!(id.to_string(), "123.456.789-01");
    }

    #[test]
    fn national_id_normalization_is_idempotent() {
        for raw in ["98765432100", "987.654.321-00", "987 654 321 00", "x9876543210y0"] {
            let once = NationalId::normalize(raw).expect("eleven digits");
            let twice = NationalId::normalize(once.as_str()).expect("still eleven digits");
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn national_id_rejects_wrong_digit_counts() {
        assert_eq!(NationalId::normalize(""), None);
        assert_eq!(NationalId::normalize("   "), None);
        assert_eq!(NationalId::normalize("1234567890"), None);
        assert_eq!(NationalId::normalize("123456789012"), None);
        assert_eq!(NationalId::normalize("ABC.DEF.GHI-JK"), None);
    }

    #[test]
    fn deserialized_national_id_is_canonical() {
        let id: NationalId = serde_json::from_str("\"12345678901\"").expect("eleven digits");
        assert_eq!(id.as_str(), "123.456.789-01");
        assert!(serde_json::from_str::<NationalId>("\"123\"").is_err());

        let json = r#"{
            "name": "A", "phone": null, "license": null,
            "national_id": "987 654 321 00",
            "street": null, "house_number": null, "neighborhood": null,
            "city": null, "state": null
        }"#;
        let profile: DriverProfile = serde_json::from_str(json).expect("profile");
        assert_eq!(
            profile.national_id.as_ref().map(NationalId::as_str),
            Some("987.654.321-00")
        );
    }

    #[test]
    fn rejection_messages_carry_context() {
        let err = LineRejection::Layout {
            expected: 17,
            found: 10,
        };
        assert_eq!(
            err.to_string(),
            "layout error: expected at least 17 columns, got 10"
        );
    }
}
