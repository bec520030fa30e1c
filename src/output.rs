use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::{error::Result, protocol::Reading};

/// How readings are printed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `x,y,z` lines and gesture sentences
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Render a reading as a single line without terminator
///
/// # Errors
///
/// Returns [`crate::DatsError::Json`] if the reading cannot be serialized.
pub fn render(reading: &Reading, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Text => reading.to_string(),
        OutputFormat::Json => serde_json::to_string(reading)?,
    })
}

/// Write a reading as one line and flush, so consumers on a pipe see it at once
///
/// # Errors
///
/// Returns [`crate::DatsError::Io`] if the writer fails.
pub fn write_reading<W: Write>(out: &mut W, reading: &Reading, format: OutputFormat) -> Result<()> {
    writeln!(out, "{}", render(reading, format)?)?;
    out.flush()?;
    Ok(())
}
