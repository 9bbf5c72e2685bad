//! CSV artifact writer and cell textualization
//!
//! The artifact format is stable: header first, one record per row, minimal
//! quoting, `\n` after every record including the last.

use crate::errors::{AppError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use csv::{QuoteStyle, Terminator, Writer, WriterBuilder};

/// Builds one CSV artifact in memory
pub struct CsvArtifact {
    writer: Writer<Vec<u8>>,
    columns: usize,
}

impl CsvArtifact {
    /// Start an artifact with its header record
    pub fn with_header<I, T>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let columns: Vec<T> = columns.into_iter().collect();
        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Necessary)
            .terminator(Terminator::Any(b'\n'))
            .flexible(false)
            .from_writer(Vec::new());
        writer.write_record(&columns)?;

        Ok(Self {
            writer,
            columns: columns.len(),
        })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Append one row; `None` cells are written as empty fields
    pub fn push_row<I>(&mut self, cells: I) -> Result<()>
    where
        I: IntoIterator<Item = Option<String>>,
    {
        let record = cells.into_iter().map(Option::unwrap_or_default);
        self.writer.write_record(record)?;
        Ok(())
    }

    pub fn finish(self) -> Result<String> {
        let bytes = self.writer.into_inner().map_err(|e| AppError::ExecutionFailure {
            message: format!("Failed to flush CSV artifact: {}", e.error()),
        })?;
        String::from_utf8(bytes).map_err(|e| AppError::ExecutionFailure {
            message: format!("CSV artifact is not valid UTF-8: {}", e),
        })
    }
}

/// RFC3339 with second precision, `Z` for UTC
pub fn rfc3339<Tz: chrono::TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render a textual timestamp with a zone offset (`2024-05-01 12:00:00+02`)
pub fn timestamp_with_zone(text: &str) -> Option<String> {
    ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"]
        .iter()
        .find_map(|fmt| DateTime::<FixedOffset>::parse_from_str(text, fmt).ok())
        .map(|at| rfc3339(&at))
}

/// Render a textual zone-less timestamp, read as UTC
pub fn timestamp_without_zone(text: &str) -> Option<String> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|at| rfc3339(&at.and_utc()))
}

/// Render a textual calendar date as midnight UTC
pub fn date(text: &str) -> Option<String> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|at| rfc3339(&at.and_utc()))
}

/// Byte strings are emitted as text; invalid sequences are replaced
pub fn bytes(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Timestamp from `<seconds>.<fraction>` since the Unix epoch
pub fn epoch_seconds(text: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, ""));
    let secs: i64 = secs.parse().ok()?;
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits.parse().ok()?
    };
    // Negative epochs carry the fraction towards zero
    if text.starts_with('-') && nanos > 0 {
        DateTime::from_timestamp(secs - 1, 1_000_000_000 - nanos)
    } else {
        DateTime::from_timestamp(secs, nanos)
    }
}
