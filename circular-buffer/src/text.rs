//! Textual forms of the circular buffer.
//!
//! Two families live here: the on-the-wire emission (`cbuf`/`cbufd`, a JSON
//! header line followed by tab-separated rows) and the self-executing
//! restoration fragment consumed by `fromstring` when a preserved sandbox is
//! brought back up.

use serde::Serialize;
use sluice_output_buffer::OutputBuffer;

use crate::{CircularBuffer, ColumnHeader, OutputFormat, RingError};

#[derive(Serialize)]
struct HeaderLine<'a> {
    time: i64,
    rows: usize,
    columns: usize,
    seconds_per_row: i64,
    column_info: &'a [ColumnHeader],
}

impl CircularBuffer {
    fn write_header(&self, out: &mut OutputBuffer) -> Result<(), RingError> {
        let line = HeaderLine {
            time: self.current_time - self.seconds_per_row * (self.rows as i64 - 1),
            rows: self.rows,
            columns: self.columns,
            seconds_per_row: self.seconds_per_row,
            column_info: &self.headers,
        };
        let json = serde_json::to_string(&line).map_err(|_| RingError::Header)?;
        out.push_str(&json)?;
        out.push_byte(b'\n')?;
        Ok(())
    }

    /// Emits the full matrix, oldest row first.
    pub fn write_cbuf(&self, out: &mut OutputBuffer) -> Result<(), RingError> {
        self.write_header(out)?;
        let mut row = self.current_row + 1;
        for _ in 0..self.rows {
            if row >= self.rows {
                row = 0;
            }
            for column in 0..self.columns {
                if column != 0 {
                    out.push_byte(b'\t')?;
                }
                out.push_f64(self.values[row * self.columns + column])?;
            }
            out.push_byte(b'\n')?;
            row += 1;
        }
        Ok(())
    }

    /// Emits only the rows touched since the last emission, each prefixed by
    /// its bucket timestamp, then forgets them.
    pub fn write_cbufd(&mut self, out: &mut OutputBuffer) -> Result<(), RingError> {
        if !self.track_deltas {
            return Err(RingError::DeltasDisabled);
        }
        self.write_header(out)?;
        for (bucket, cells) in &self.deltas {
            out.push_str(&bucket.to_string())?;
            for cell in cells {
                out.push_byte(b'\t')?;
                out.push_f64(*cell)?;
            }
            out.push_byte(b'\n')?;
        }
        self.deltas.clear();
        Ok(())
    }

    /// Emits whichever form `format` selected.
    pub fn write(&mut self, out: &mut OutputBuffer) -> Result<(), RingError> {
        match self.format {
            OutputFormat::Cbuf => self.write_cbuf(out),
            OutputFormat::Cbufd => self.write_cbufd(out),
        }
    }

    /// Emits the self-executing restoration fragment for this buffer bound
    /// to `key` (a global key path inside a preserved sandbox).
    pub fn write_restore_script(
        &self,
        key: &[u8],
        out: &mut OutputBuffer,
    ) -> Result<(), RingError> {
        out.push_str("if ")?;
        out.push_bytes(key)?;
        out.push_str(" == nil then ")?;
        out.push_bytes(key)?;
        out.push_str(&format!(
            " = circular_buffer.new({}, {}, {}{}) end\n",
            self.rows,
            self.columns,
            self.seconds_per_row,
            if self.track_deltas { ", true" } else { "" }
        ))?;
        for (i, header) in self.headers.iter().enumerate() {
            out.push_bytes(key)?;
            out.push_str(&format!(
                ":set_header({}, \"{}\", \"{}\", \"{}\")\n",
                i + 1,
                header.name,
                header.unit,
                header.aggregation.as_str()
            ))?;
        }
        out.push_bytes(key)?;
        out.push_str(&format!(
            ":fromstring(\"{} {}",
            self.current_time, self.current_row
        ))?;
        for value in &self.values {
            out.push_byte(b' ')?;
            out.push_f64(*value)?;
        }
        if self.track_deltas {
            for (bucket, cells) in &self.deltas {
                out.push_str(&format!(" {bucket}"))?;
                for cell in cells {
                    out.push_byte(b' ')?;
                    out.push_f64(*cell)?;
                }
            }
        }
        out.push_str("\")\n")?;
        Ok(())
    }

    /// Restores state from the payload emitted by
    /// [`write_restore_script`](Self::write_restore_script): current time,
    /// current row, exactly `rows * columns` cell values, then — when delta
    /// tracking is on — any number of delta rows of `bucket` plus one value
    /// per column.
    pub fn from_string(&mut self, payload: &str) -> Result<(), RingError> {
        let mut tokens = payload.split_whitespace();
        let time: i64 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or(RingError::InvalidTimeRow)?;
        let row: usize = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or(RingError::InvalidTimeRow)?;
        if row >= self.rows {
            return Err(RingError::InvalidTimeRow);
        }
        self.current_time = time;
        self.current_row = row;
        for i in 0..self.rows * self.columns {
            let token = tokens.next().ok_or(RingError::TooFewValues)?;
            self.values[i] = token.parse().map_err(|_| RingError::InvalidValue)?;
        }
        let rest: Vec<&str> = tokens.collect();
        if rest.is_empty() {
            return Ok(());
        }
        if !self.track_deltas {
            return Err(RingError::TooManyValues);
        }
        if rest.len() % (1 + self.columns) != 0 {
            return Err(RingError::TooFewValues);
        }
        for chunk in rest.chunks(1 + self.columns) {
            let bucket: i64 = chunk[0].parse().map_err(|_| RingError::InvalidValue)?;
            let mut cells = vec![0.0; self.columns];
            for (i, token) in chunk[1..].iter().enumerate() {
                cells[i] = token.parse().map_err(|_| RingError::InvalidValue)?;
            }
            self.deltas.insert(bucket, cells);
        }
        Ok(())
    }

}
