//! Field extraction: OCR text plus the label-anchored rule table.
//!
//! ## Deliberate partial-failure tolerance
//!
//! Each rule matches a fixed label phrase followed by an amount of the form
//! `digits "." two digits`, optionally preceded by a currency symbol. Rules
//! are evaluated independently: OCR noise that mangles one line yields a
//! null for that field and leaves the other two intact. Only a failure of
//! the OCR engine itself is an error, and even that is fatal for this
//! document alone.
//!
//! The rule table is configuration, not control flow — a new bill format
//! is a new set of [`ExtractionRule`]s, versioned independently of this
//! module.

use crate::capability::OcrEngine;
use crate::config::{ChargeField, ExtractionRule};
use crate::error::DocumentError;
use crate::pipeline::rasterize::RasterImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The three independently-nullable monetary fields recognized on one
/// statement, plus the raw OCR text they came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub delivery: Option<f64>,
    pub generation: Option<f64>,
    pub gas: Option<f64>,
    /// Full recognized text, kept for diagnosis of missing fields.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub raw_text: String,
}

struct CompiledRule {
    field: ChargeField,
    pattern: Regex,
}

/// Applies the configured rule table to recognized statement text.
pub struct FieldExtractor {
    rules: Vec<CompiledRule>,
}

impl FieldExtractor {
    pub fn new(rules: &[ExtractionRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| CompiledRule {
                field: rule.field,
                // Label is matched literally; the amount allows an optional
                // currency symbol and requires exactly two decimals.
                pattern: Regex::new(&format!(
                    r"{}\s*\$?(\d+\.\d{{2}})",
                    regex::escape(&rule.label)
                ))
                .expect("escaped label always forms a valid pattern"),
            })
            .collect();
        Self { rules }
    }

    /// Run OCR over the image and parse the monetary fields.
    ///
    /// An OCR engine failure is fatal for this document; missing pattern
    /// matches are not.
    pub async fn extract(
        &self,
        ocr: &dyn OcrEngine,
        image: &RasterImage,
    ) -> Result<ExtractedFields, DocumentError> {
        let text = ocr
            .recognize(&image.image_path)
            .await
            .map_err(|detail| DocumentError::OcrFailed {
                file: image.file_name.clone(),
                detail,
            })?;
        Ok(self.extract_from_text(&text))
    }

    /// Pure rule evaluation over already-recognized text.
    pub fn extract_from_text(&self, text: &str) -> ExtractedFields {
        let mut fields = ExtractedFields {
            raw_text: text.to_string(),
            ..Default::default()
        };

        for rule in &self.rules {
            let amount = rule
                .pattern
                .captures(text)
                .and_then(|caps| caps[1].parse::<f64>().ok());
            if amount.is_none() {
                debug!(field = ?rule.field, "rule did not match OCR text");
            }
            let slot = match rule.field {
                ChargeField::Delivery => &mut fields.delivery,
                ChargeField::Generation => &mut fields.generation,
                ChargeField::Gas => &mut fields.gas,
            };
            if slot.is_none() {
                *slot = amount;
            }
        }
        fields
    }
}
