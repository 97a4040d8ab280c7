//! Versioned export schemas with required and optional columns.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSchema {
    pub name: &'static str,
    pub version: u32,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{schema} v{version}: missing required columns {missing:?} (export has {found:?})")]
    MissingColumns {
        schema: &'static str,
        version: u32,
        missing: Vec<String>,
        found: Vec<String>,
    },
}

impl SourceSchema {
    /// Optional columns may be absent; their fields default on the row structs.
    pub fn check_headers(&self, headers: &[String]) -> Result<(), SchemaError> {
        let missing = self
            .required
            .iter()
            .filter(|required| !headers.iter().any(|h| h == *required))
            .map(|required| required.to_string())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }
        Err(SchemaError::MissingColumns {
            schema: self.name,
            version: self.version,
            missing,
            found: headers.to_vec(),
        })
    }

    pub fn knows_column(&self, column: &str) -> bool {
        self.required.contains(&column) || self.optional.contains(&column)
    }
}
