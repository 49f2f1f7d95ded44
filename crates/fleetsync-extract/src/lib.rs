//! Record reader and field parser for the `;`-delimited vehicle/driver extract.

use fleetsync_core::{
    DriverProfile, ExtractRecord, LineRejection, NationalId, CITY_MAX_CHARS, DELIMITER,
    MIN_COLUMNS, NO_DRIVER_SENTINEL, PLACEHOLDER_DRIVER_NAME,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "fleetsync-extract";

const COL_VEHICLE_ID: usize = 0;
const COL_VEHICLE_PLATE: usize = 1;
const COL_DRIVER_NAME: usize = 4;
const COL_TRAILER_PLATE: usize = 5;
const COL_DRIVER_REF: usize = 6;
const COL_PHONE: usize = 7;
const COL_LICENSE: usize = 9;
const COL_NATIONAL_ID: usize = 10;
const COL_STREET: usize = 12;
const COL_HOUSE_NUMBER: usize = 13;
const COL_NEIGHBORHOOD: usize = 14;
const COL_CITY: usize = 15;
const COL_STATE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedExtract {
    pub text: String,
    pub encoding: TextEncoding,
}

impl DecodedExtract {
    /// Every line with its 1-based line number, blank lines included.
    pub fn lines(&self) -> impl Iterator<Item = (usize, &str)> {
        self.text.lines().enumerate().map(|(idx, line)| (idx + 1, line))
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("extract is empty")]
    Empty,
}

/// Decodes raw extract bytes, trying UTF-8 first and falling back to Latin-1.
pub fn decode_extract(bytes: &[u8]) -> Result<DecodedExtract, DecodeError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

    let decoded = match std::str::from_utf8(bytes) {
        Ok(text) => DecodedExtract {
            text: text.to_string(),
            encoding: TextEncoding::Utf8,
        },
        Err(err) => {
            debug!(valid_up_to = err.valid_up_to(), "extract is not utf-8, decoding as latin-1");
            DecodedExtract {
                // Latin-1 maps every byte to the code point of the same value.
                text: bytes.iter().map(|&b| char::from(b)).collect(),
                encoding: TextEncoding::Latin1,
            }
        }
    };

    if decoded.text.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(decoded)
}

/// Column layout of the extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractLayout {
    pub delimiter: char,
    pub min_columns: usize,
}

impl Default for ExtractLayout {
    fn default() -> Self {
        Self {
            delimiter: DELIMITER,
            min_columns: MIN_COLUMNS,
        }
    }
}

impl ExtractLayout {
    /// Turns one raw line into a typed record or the reason it is skipped.
    pub fn parse_line(&self, line_number: usize, raw: &str) -> Result<ExtractRecord, LineRejection> {
        let cols: Vec<&str> = raw.trim().split(self.delimiter).collect();
        // The field positions below are fixed, so a smaller configured minimum
        // cannot go below the last column read.
        let required = self.min_columns.max(COL_STATE + 1);
        if cols.len() < required {
            return Err(LineRejection::Layout {
                expected: required,
                found: cols.len(),
            });
        }

        let vehicle_token = cols[COL_VEHICLE_ID].trim();
        let vehicle_id = vehicle_token
            .parse::<i64>()
            .map_err(|_| LineRejection::IdentityField {
                value: vehicle_token.to_string(),
            })?;

        let driver_ref = parse_driver_ref(cols[COL_DRIVER_REF]);
        if driver_ref.is_none() && !cols[COL_DRIVER_REF].trim().is_empty() {
            debug!(line = line_number, token = cols[COL_DRIVER_REF], "driver reference treated as absent");
        }

        let national_id = optional_text(cols[COL_NATIONAL_ID]).and_then(|raw_id| {
            let id = NationalId::normalize(&raw_id);
            if id.is_none() {
                warn!(line = line_number, raw = %raw_id, "national id does not have 11 digits, ignoring");
            }
            id
        });

        Ok(ExtractRecord {
            line_number,
            vehicle_id,
            vehicle_plate: cols[COL_VEHICLE_PLATE].trim().to_string(),
            trailer_plate: cols[COL_TRAILER_PLATE].trim().to_string(),
            driver_ref,
            driver: DriverProfile {
                name: driver_name(cols[COL_DRIVER_NAME]),
                phone: optional_text(cols[COL_PHONE]),
                license: optional_text(cols[COL_LICENSE]),
                national_id,
                street: optional_text(cols[COL_STREET]),
                house_number: optional_text(cols[COL_HOUSE_NUMBER]),
                neighborhood: optional_text(cols[COL_NEIGHBORHOOD]),
                city: truncated_city(cols[COL_CITY]),
                state: optional_text(cols[COL_STATE]),
            },
        })
    }
}

/// Outcome of parsing a whole extract without touching the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayoutReport {
    pub total_lines: usize,
    pub parsed: usize,
    pub without_national_id: usize,
    pub placeholder_drivers: usize,
    pub rejected: Vec<(usize, LineRejection)>,
}

impl ExtractLayout {
    pub fn check(&self, extract: &DecodedExtract) -> LayoutReport {
        let mut report = LayoutReport::default();
        for (line_number, raw) in extract.lines() {
            report.total_lines += 1;
            match self.parse_line(line_number, raw) {
                Ok(record) => {
                    report.parsed += 1;
                    if record.driver.national_id.is_none() {
                        report.without_national_id += 1;
                    }
                    if record.driver.is_placeholder() {
                        report.placeholder_drivers += 1;
                    }
                }
                Err(reason) => report.rejected.push((line_number, reason)),
            }
        }
        report
    }
}

fn parse_driver_ref(token: &str) -> Option<i64> {
    let token = token.trim();
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    token
        .parse::<i64>()
        .ok()
        .filter(|code| *code != NO_DRIVER_SENTINEL)
}

fn driver_name(raw: &str) -> String {
    let name = raw.trim();
    if name.is_empty() {
        PLACEHOLDER_DRIVER_NAME.to_string()
    } else {
        name.to_string()
    }
}

fn optional_text(raw: &str) -> Option<String> {
    let value = raw.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn truncated_city(raw: &str) -> Option<String> {
    let head: String = raw.chars().take(CITY_MAX_CHARS).collect();
    optional_text(&head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(fields: &[(usize, &str)]) -> String {
        let mut cols = vec![""; MIN_COLUMNS];
        for (idx, value) in fields {
            cols[*idx] = value;
        }
        cols.join(";")
    }

    fn full_line() -> String {
        line(&[
            (0, "51773"),
            (1, "ABC1D23"),
            (4, "  Joao da Silva "),
            (5, "XYZ9876"),
            (6, "1234"),
            (7, "11 99999-0000"),
            (9, "CNH123"),
            (10, "123.456.789-01"),
            (12, "Rua A"),
            (13, "100"),
            (14, "Centro"),
            (15, "Sao Paulo"),
            (16, "SP"),
        ])
    }

    #[test]
    fn parses_all_fields() {
        let record = ExtractLayout::default()
            .parse_line(3, &full_line())
            .expect("valid line");
        assert_eq!(record.line_number, 3);
        assert_eq!(record.vehicle_id, 51773);
        assert_eq!(record.vehicle_plate, "ABC1D23");
        assert_eq!(record.trailer_plate, "XYZ9876");
        assert_eq!(record.driver_ref, Some(1234));
        assert_eq!(record.driver.name, "Joao da Silva");
        assert_eq!(record.driver.phone.as_deref(), Some("11 99999-0000"));
        assert_eq!(record.driver.license.as_deref(), Some("CNH123"));
        assert_eq!(
            record.driver.national_id.as_ref().map(NationalId::as_str),
            Some("123.456.789-01")
        );
        assert_eq!(record.driver.city.as_deref(), Some("Sao Paulo"));
        assert_eq!(record.driver.state.as_deref(), Some("SP"));
    }

    #[test]
    fn short_line_is_a_layout_error() {
        let raw = vec!["1"; 10].join(";");
        let err = ExtractLayout::default().parse_line(1, &raw).unwrap_err();
        assert_eq!(
            err,
            LineRejection::Layout {
                expected: 17,
                found: 10
            }
        );
    }

    #[test]
    fn non_numeric_vehicle_is_an_identity_error() {
        let raw = line(&[(0, "A12"), (4, "X")]);
        let err = ExtractLayout::default().parse_line(1, &raw).unwrap_err();
        assert_eq!(
            err,
            LineRejection::IdentityField {
                value: "A12".into()
            }
        );
    }

    #[test]
    fn sentinel_and_garbage_driver_refs_are_absent() {
        let layout = ExtractLayout::default();
        for token in ["999999", "", "  ", "12a", "-5"] {
            let raw = line(&[(0, "1"), (4, "X"), (6, token)]);
            let record = layout.parse_line(1, &raw).expect("valid line");
            assert_eq!(record.driver_ref, None, "token {token:?}");
        }
    }

    #[test]
    fn blank_name_becomes_placeholder_and_placeholder_is_kept() {
        let layout = ExtractLayout::default();
        let blank = layout.parse_line(1, &line(&[(0, "1")])).expect("valid");
        assert_eq!(blank.driver.name, PLACEHOLDER_DRIVER_NAME);
        assert!(blank.driver.is_placeholder());

        let literal = layout
            .parse_line(1, &line(&[(0, "1"), (4, " EM DEFINICAO ")]))
            .expect("valid");
        assert_eq!(literal.driver.name, "EM DEFINICAO");
    }

    #[test]
    fn city_is_truncated_then_trimmed() {
        let city = "Sao Jose dos Campos do Norte Paulista";
        let record = ExtractLayout::default()
            .parse_line(1, &line(&[(0, "1"), (15, city)]))
            .expect("valid");
        assert_eq!(record.driver.city.as_deref(), Some("Sao Jose dos Campos do No"));

        let padded = format!("{}X", " ".repeat(25));
        let record = ExtractLayout::default()
            .parse_line(1, &line(&[(0, "1"), (15, &padded)]))
            .expect("valid");
        assert_eq!(record.driver.city, None);
    }

    #[test]
    fn short_national_id_is_dropped() {
        let record = ExtractLayout::default()
            .parse_line(1, &line(&[(0, "1"), (10, "123.456.789-0")]))
            .expect("valid");
        assert_eq!(record.driver.national_id, None);
    }

    #[test]
    fn decode_prefers_utf8_and_falls_back_to_latin1() {
        let utf8 = decode_extract("1;S\u{e3}o Paulo\n".as_bytes()).expect("decodes");
        assert_eq!(utf8.encoding, TextEncoding::Utf8);

        let latin1 = decode_extract(b"1;S\xe3o Paulo\n").expect("decodes");
        assert_eq!(latin1.encoding, TextEncoding::Latin1);
        assert_eq!(latin1.text, "1;S\u{e3}o Paulo\n");
    }

    #[test]
    fn decode_strips_bom_and_rejects_empty() {
        let decoded = decode_extract(b"\xEF\xBB\xBFabc\r\ndef").expect("decodes");
        assert_eq!(decoded.lines().collect::<Vec<_>>(), vec![(1, "abc"), (2, "def")]);
        assert_eq!(decode_extract(b" \n \n"), Err(DecodeError::Empty));
    }
}
