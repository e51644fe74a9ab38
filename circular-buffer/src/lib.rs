//! Time-bucketed circular buffer.
//!
//! A fixed ring of `rows x columns` samples where each row covers
//! `seconds_per_row` of wall-clock time. Mutations carry a nanosecond
//! timestamp; writing past the newest row advances the window, zeroing every
//! row it sweeps over. Reads and writes addressed outside the window are
//! dropped and reported with a sentinel (`None`, surfaced to scripts as nil).
//!
//! The buffer optionally captures per-cell deltas between emissions, used by
//! the `cbufd` output format to ship only what changed since the last time
//! the buffer was published.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Serialize;
use sluice_output_buffer::OutputError;
use thiserror::Error;

mod text;
mod userdata;

pub use userdata::install;

/// Upper bound on `seconds_per_row`.
pub const MAX_SECONDS_PER_ROW: i64 = 3600;

/// Upper bound on `rows * columns`, the cell count of one matrix.
///
/// Keeps a single script-created buffer within the memory a sandbox is
/// allowed to hold in total (one million 8-byte cells).
pub const MAX_MATRIX_CELLS: usize = 1_048_576;

/// Errors surfaced by circular buffer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// Fewer than two rows requested.
    #[error("rows must be > 1")]
    BadRows,
    /// No columns requested.
    #[error("columns must be > 0")]
    BadColumns,
    /// `seconds_per_row` outside `(0, 3600]`.
    #[error("seconds_per_row is out of range")]
    BadSecondsPerRow,
    /// The matrix would exceed [`MAX_MATRIX_CELLS`].
    #[error("rows * columns exceeds the maximum matrix size")]
    BadDimensions,
    /// Column index outside `[1, columns]`.
    #[error("column out of range")]
    ColumnRange,
    /// Unrecognized aggregation method name.
    #[error("invalid aggregation method '{0}'")]
    BadAggregation(String),
    /// Unrecognized compute function name.
    #[error("invalid compute function '{0}'")]
    BadFunction(String),
    /// Unrecognized output format name.
    #[error("invalid format '{0}'")]
    BadFormat(String),
    /// The cbufd format needs delta tracking enabled at construction.
    #[error("cbufd format requires delta tracking")]
    DeltasDisabled,
    /// Restoration text did not start with a valid time and row.
    #[error("fromstring() invalid time/row")]
    InvalidTimeRow,
    /// Restoration text contained a token that is not a number.
    #[error("fromstring() invalid value")]
    InvalidValue,
    /// Restoration text ran out of cell values.
    #[error("fromstring() too few values")]
    TooFewValues,
    /// Restoration text carried values past the matrix size.
    #[error("fromstring() too many values")]
    TooManyValues,
    /// The shared output buffer refused the emission.
    #[error(transparent)]
    Output(#[from] OutputError),
    /// The JSON header line could not be built.
    #[error("header serialization failed")]
    Header,
}

/// How a column is meant to be folded when graphed or merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Min,
    Max,
    Avg,
    None,
}

impl Aggregation {
    /// The lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Avg => "avg",
            Aggregation::None => "none",
        }
    }
}

impl FromStr for Aggregation {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Aggregation::Sum),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "avg" => Ok(Aggregation::Avg),
            "none" => Ok(Aggregation::None),
            _ => Err(RingError::BadAggregation(s.to_string())),
        }
    }
}

/// Selected textual emission form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Full matrix, oldest row first.
    Cbuf,
    /// Accumulated delta rows only.
    Cbufd,
}

impl OutputFormat {
    /// The lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Cbuf => "cbuf",
            OutputFormat::Cbufd => "cbufd",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cbuf" => Ok(OutputFormat::Cbuf),
            "cbufd" => Ok(OutputFormat::Cbufd),
            _ => Err(RingError::BadFormat(s.to_string())),
        }
    }
}

/// Aggregate computations available over a column range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeFn {
    Sum,
    Avg,
    Sd,
    Min,
    Max,
}

impl FromStr for ComputeFn {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(ComputeFn::Sum),
            "avg" => Ok(ComputeFn::Avg),
            "sd" => Ok(ComputeFn::Sd),
            "min" => Ok(ComputeFn::Min),
            "max" => Ok(ComputeFn::Max),
            _ => Err(RingError::BadFunction(s.to_string())),
        }
    }
}

const COLUMN_NAME_LEN: usize = 15;
const COLUMN_UNIT_LEN: usize = 7;

/// Per-column metadata carried in the emitted header line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnHeader {
    name: String,
    unit: String,
    aggregation: Aggregation,
}

impl ColumnHeader {
    /// Column name after sanitising.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column unit after sanitising.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Column aggregation method.
    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .take(COLUMN_NAME_LEN)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn sanitize_unit(unit: &str) -> String {
    unit.chars()
        .take(COLUMN_UNIT_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '/' || c == '*' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The ring itself.
#[derive(Debug, Clone, PartialEq)]
pub struct CircularBuffer {
    rows: usize,
    columns: usize,
    seconds_per_row: i64,
    current_time: i64,
    current_row: usize,
    headers: Vec<ColumnHeader>,
    values: Vec<f64>,
    format: OutputFormat,
    track_deltas: bool,
    deltas: BTreeMap<i64, Vec<f64>>,
}

impl CircularBuffer {
    /// Allocates a zeroed ring covering `[0, seconds_per_row * (rows - 1)]`.
    pub fn new(
        rows: i64,
        columns: i64,
        seconds_per_row: i64,
        track_deltas: bool,
    ) -> Result<Self, RingError> {
        if rows < 2 {
            return Err(RingError::BadRows);
        }
        if columns < 1 {
            return Err(RingError::BadColumns);
        }
        if seconds_per_row < 1 || seconds_per_row > MAX_SECONDS_PER_ROW {
            return Err(RingError::BadSecondsPerRow);
        }
        let rows = rows as usize;
        let columns = columns as usize;
        if rows.saturating_mul(columns) > MAX_MATRIX_CELLS {
            return Err(RingError::BadDimensions);
        }
        let headers = (1..=columns)
            .map(|i| ColumnHeader {
                name: format!("Column_{i}"),
                unit: "count".to_string(),
                aggregation: Aggregation::Sum,
            })
            .collect();
        Ok(CircularBuffer {
            rows,
            columns,
            seconds_per_row,
            current_time: seconds_per_row * (rows as i64 - 1),
            current_row: rows - 1,
            headers,
            values: vec![0.0; rows * columns],
            format: OutputFormat::Cbuf,
            track_deltas,
            deltas: BTreeMap::new(),
        })
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Seconds covered by one row.
    pub fn seconds_per_row(&self) -> i64 {
        self.seconds_per_row
    }

    /// Newest bucket timestamp, in seconds.
    pub fn current_time(&self) -> i64 {
        self.current_time
    }

    /// Ring index of the newest row.
    pub fn current_row(&self) -> usize {
        self.current_row
    }

    /// Whether delta capture is enabled.
    pub fn tracks_deltas(&self) -> bool {
        self.track_deltas
    }

    /// Column headers.
    pub fn headers(&self) -> &[ColumnHeader] {
        &self.headers
    }

    /// Timestamp quantized down to the nearest row boundary, in seconds.
    fn bucket(&self, ns: f64) -> i64 {
        let t = (ns / 1e9) as i64;
        t - t.rem_euclid(self.seconds_per_row)
    }

    /// Bucket, distance from the newest row in rows, and ring index for a
    /// timestamp. Pure; the window is not advanced.
    fn probe(&self, ns: f64) -> (i64, i64, usize) {
        let bucket = self.bucket(ns);
        let current = self.current_time / self.seconds_per_row;
        let requested = bucket / self.seconds_per_row;
        let delta = requested - current;
        let row = requested.rem_euclid(self.rows as i64) as usize;
        (bucket, delta, row)
    }

    fn clear_rows(&mut self, num_rows: usize) {
        if num_rows >= self.rows {
            self.values.fill(0.0);
            return;
        }
        let mut row = self.current_row;
        for _ in 0..num_rows {
            row += 1;
            if row >= self.rows {
                row = 0;
            }
            let start = row * self.columns;
            self.values[start..start + self.columns].fill(0.0);
        }
    }

    /// Advances the window when the timestamp lands past the newest row and
    /// returns the target ring index, or `None` when the timestamp has
    /// already fallen off the ring.
    fn advance_to(&mut self, ns: f64) -> Option<(usize, i64)> {
        let (bucket, delta, row) = self.probe(ns);
        if delta > 0 {
            self.clear_rows(delta as usize);
            self.current_time = bucket;
            self.current_row = row;
        } else if delta.unsigned_abs() as usize >= self.rows {
            return None;
        }
        Some((row, bucket))
    }

    fn record_delta(&mut self, bucket: i64, column: usize, amount: f64) {
        if !self.track_deltas {
            return;
        }
        let cells = self
            .deltas
            .entry(bucket)
            .or_insert_with(|| vec![0.0; self.columns]);
        cells[column] += amount;
    }

    /// Adds `value` into the addressed cell, advancing the window if needed.
    /// Returns the new cell value, or `None` when the timestamp is outside
    /// the reachable range.
    pub fn add(&mut self, ns: f64, column: usize, value: f64) -> Option<f64> {
        let (row, bucket) = self.advance_to(ns)?;
        let index = row * self.columns + column;
        self.values[index] += value;
        self.record_delta(bucket, column, value);
        Some(self.values[index])
    }

    /// Overwrites the addressed cell, advancing the window if needed.
    pub fn set(&mut self, ns: f64, column: usize, value: f64) -> Option<f64> {
        let (row, bucket) = self.advance_to(ns)?;
        let index = row * self.columns + column;
        let old = self.values[index];
        self.values[index] = value;
        self.record_delta(bucket, column, value - old);
        Some(value)
    }

    /// Reads the addressed cell without advancing the window.
    pub fn get(&self, ns: f64, column: usize) -> Option<f64> {
        let (_, delta, row) = self.probe(ns);
        if delta.unsigned_abs() as usize >= self.rows {
            return None;
        }
        Some(self.values[row * self.columns + column])
    }

    /// Renames a column. The name keeps at most 15 alphanumeric/underscore
    /// characters, the unit at most 7 (alphanumeric, `/` and `*`). Returns
    /// the zero-based column index.
    pub fn set_header(
        &mut self,
        column: usize,
        name: &str,
        unit: Option<&str>,
        aggregation: Option<&str>,
    ) -> Result<usize, RingError> {
        if column >= self.columns {
            return Err(RingError::ColumnRange);
        }
        let aggregation = match aggregation {
            Some(method) => method.parse()?,
            None => Aggregation::Sum,
        };
        self.headers[column] = ColumnHeader {
            name: sanitize_name(name),
            unit: sanitize_unit(unit.unwrap_or("count")),
            aggregation,
        };
        Ok(column)
    }

    /// Selects the textual emission format.
    pub fn set_format(&mut self, format: &str) -> Result<(), RingError> {
        let format = format.parse()?;
        if format == OutputFormat::Cbufd && !self.track_deltas {
            return Err(RingError::DeltasDisabled);
        }
        self.format = format;
        Ok(())
    }

    /// The selected textual emission format.
    pub fn output_format(&self) -> OutputFormat {
        self.format
    }

    /// Folds a column over `[start_ns, end_ns]` (defaulting to the whole
    /// window). Returns `None` when either endpoint falls outside the
    /// window or the range is inverted.
    pub fn compute(
        &self,
        func: ComputeFn,
        column: usize,
        start_ns: Option<f64>,
        end_ns: Option<f64>,
    ) -> Option<f64> {
        let window_start = self.current_time - self.seconds_per_row * (self.rows as i64 - 1);
        let start = match start_ns {
            Some(ns) => self.bucket(ns),
            None => window_start,
        };
        let end = match end_ns {
            Some(ns) => self.bucket(ns),
            None => self.current_time,
        };
        if start > end
            || start < window_start
            || start > self.current_time
            || end < window_start
            || end > self.current_time
        {
            return None;
        }
        let row_count = ((end - start) / self.seconds_per_row + 1) as usize;
        let first = start / self.seconds_per_row;
        let cells: Vec<f64> = (0..row_count)
            .map(|i| {
                let row = (first + i as i64).rem_euclid(self.rows as i64) as usize;
                self.values[row * self.columns + column]
            })
            .collect();
        let value = match func {
            ComputeFn::Sum => cells.iter().sum(),
            ComputeFn::Avg => cells.iter().sum::<f64>() / row_count as f64,
            ComputeFn::Sd => {
                if row_count < 2 {
                    0.0
                } else {
                    let mean = cells.iter().sum::<f64>() / row_count as f64;
                    let variance = cells.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
                        / (row_count as f64 - 1.0);
                    newton_sqrt(variance)
                }
            }
            ComputeFn::Min => cells.iter().fold(f64::INFINITY, |a, &b| a.min(b)),
            ComputeFn::Max => cells.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
        };
        Some(value)
    }
}

/// Square root by Newton's method.
fn newton_sqrt(value: f64) -> f64 {
    if value <= 0.0 {
        return 0.0;
    }
    let mut estimate = value / 2.0;
    if estimate == 0.0 {
        return value;
    }
    for _ in 0..64 {
        let next = (estimate + value / estimate) / 2.0;
        if (next - estimate).abs() <= f64::EPSILON * next {
            return next;
        }
        estimate = next;
    }
    estimate
}
