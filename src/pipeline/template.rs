// src/pipeline/template.rs

//! Placeholder substitution for templated files
//!
//! Templated files are small text files. `DEVICE_NUMBER` and `CUSTOM1`
//! through `CUSTOM3` are replaced literally; an unset custom field becomes an
//! empty string.

use crate::model::DesiredState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValues {
    pub device_number: String,
    pub custom: [String; 3],
}

impl TemplateValues {
    pub fn new(device_number: &str, state: &DesiredState) -> Self {
        let field = |v: &Option<String>| v.clone().unwrap_or_default();
        Self {
            device_number: device_number.to_string(),
            custom: [
                field(&state.custom1),
                field(&state.custom2),
                field(&state.custom3),
            ],
        }
    }

    pub fn apply(&self, content: &str) -> String {
        content
            .replace("DEVICE_NUMBER", &self.device_number)
            .replace("CUSTOM1", &self.custom[0])
            .replace("CUSTOM2", &self.custom[1])
            .replace("CUSTOM3", &self.custom[2])
    }
}
