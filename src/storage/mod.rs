//! Columnar persistence of book-state rows.
//!
//! Every book mutation is flattened into one [`BookRow`] per price level and
//! streamed through a [`writer::StorageWriter`] into a parquet file. One file
//! holds exactly one session; files live at
//! `<root>/<YYYYMMDD>/<asset>/<asset>_<YYYYMMDD_HHMMSS>_<key>.parquet`.

pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::models::instrument::SOURCE_TZ;

/// Side of the book a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSide {
    Bid,
    Ask,
}

impl RowSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowSide::Bid => "bid",
            RowSide::Ask => "ask",
        }
    }
}

/// One persisted price level of one book state.
#[derive(Debug, Clone, PartialEq)]
pub struct BookRow {
    /// ISO-8601 time of the mutation that produced this row.
    pub timestamp: String,
    pub side: RowSide,
    pub price: f64,
    pub size: f64,
    pub asset_id: String,
    pub market: String,
}

/// Returns the file schema: `(timestamp, side, price, size, asset_id, market)`.
pub fn row_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Utf8, false),
        Field::new("side", DataType::Utf8, false),
        Field::new("price", DataType::Float64, false),
        Field::new("size", DataType::Float64, false),
        Field::new("asset_id", DataType::Utf8, false),
        Field::new("market", DataType::Utf8, false),
    ]))
}

/// Packs rows into a record batch, preserving their order.
///
/// # Errors
///
/// Returns [`RollbookError::Arrow`](crate::RollbookError::Arrow) if the
/// columns do not match the schema.
pub fn rows_to_batch(schema: &SchemaRef, rows: &[BookRow]) -> Result<RecordBatch> {
    let timestamp = StringArray::from_iter_values(rows.iter().map(|r| r.timestamp.as_str()));
    let side = StringArray::from_iter_values(rows.iter().map(|r| r.side.as_str()));
    let price = Float64Array::from_iter_values(rows.iter().map(|r| r.price));
    let size = Float64Array::from_iter_values(rows.iter().map(|r| r.size));
    let asset_id = StringArray::from_iter_values(rows.iter().map(|r| r.asset_id.as_str()));
    let market = StringArray::from_iter_values(rows.iter().map(|r| r.market.as_str()));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(timestamp),
        Arc::new(side),
        Arc::new(price),
        Arc::new(size),
        Arc::new(asset_id),
        Arc::new(market),
    ];
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

/// Computes a fresh destination path for a session opened at `now` and
/// creates its parent directory.
///
/// Date and time components are rendered in the source zone. If a file of
/// that name already exists (two sessions opened within the same second),
/// a `_<n>` suffix is added so every session gets its own file.
///
/// # Errors
///
/// Returns [`RollbookError::Io`](crate::RollbookError::Io) if the directory
/// cannot be created.
pub fn session_file_path(
    root: &Path,
    asset: &str,
    subscription_key: &str,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let local = now.with_timezone(&SOURCE_TZ);
    let day = local.format("%Y%m%d").to_string();
    let stamp = local.format("%Y%m%d_%H%M%S").to_string();

    let folder = root.join(day).join(asset);
    std::fs::create_dir_all(&folder)?;

    let stem = format!("{asset}_{stamp}_{subscription_key}");
    let mut candidate = folder.join(format!("{stem}.parquet"));
    let mut n = 1;
    while candidate.exists() {
        candidate = folder.join(format!("{stem}_{n}.parquet"));
        n += 1;
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_path_follows_layout_in_source_zone() {
        let dir = tempfile::tempdir().unwrap();
        // 03:30 UTC on the 21st is still the 20th in New York.
        let now = Utc.with_ymd_and_hms(2026, 1, 21, 3, 30, 5).unwrap();
        let path = session_file_path(dir.path(), "Solana", "5589", now).unwrap();

        assert_eq!(
            path,
            dir.path()
                .join("20260120")
                .join("Solana")
                .join("Solana_20260120_223005_5589.parquet")
        );
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn session_path_never_reuses_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 20, 15, 0, 0).unwrap();
        let first = session_file_path(dir.path(), "XRP", "k", now).unwrap();
        std::fs::write(&first, b"taken").unwrap();

        let second = session_file_path(dir.path(), "XRP", "k", now).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_k_1.parquet"));
    }

    #[test]
    fn batch_keeps_row_order_and_schema() {
        let schema = row_schema();
        let rows = vec![
            BookRow {
                timestamp: "2026-01-20T10:00:00".into(),
                side: RowSide::Bid,
                price: 0.48,
                size: 30.0,
                asset_id: "k".into(),
                market: "m".into(),
            },
            BookRow {
                timestamp: "2026-01-20T10:00:00".into(),
                side: RowSide::Ask,
                price: 0.52,
                size: 12.5,
                asset_id: "k".into(),
                market: "m".into(),
            },
        ];
        let batch = rows_to_batch(&schema, &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 6);

        let side = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(side.value(0), "bid");
        assert_eq!(side.value(1), "ask");
    }
}
