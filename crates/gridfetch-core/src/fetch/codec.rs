//! Row buffer decoding.
//!
//! The pipeline only needs a [`RowDecoder`]. [`ColumnarCodec`] is the
//! reference column-major format shared by bundled backends and tests:
//!
//! ```text
//! "GFC1" | u32 rows | u32 cols | col* | u32 crc32(everything before)
//! col    = u16 name_len | name | u8 kind | cell{rows}
//! cell   = u8 valid | value (only when valid)
//! ```
//!
//! Integers are little-endian. `kind` is one of int64, float64, utf8, bool,
//! or json (a length-prefixed JSON document for mixed or nested values).

use indexmap::IndexSet;
use serde_json::{Number, Value};

use crate::errors::{GridError, GridResult};
use crate::models::Row;

const MAGIC: &[u8; 4] = b"GFC1";

const KIND_INT64: u8 = 0;
const KIND_FLOAT64: u8 = 1;
const KIND_UTF8: u8 = 2;
const KIND_BOOL: u8 = 3;
const KIND_JSON: u8 = 4;

/// Turns a backend row buffer into rows.
pub trait RowDecoder {
    fn decode(&self, buffer: &[u8]) -> GridResult<Vec<Row>>;
}

/// Rows sent as a JSON array of objects.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonRowsDecoder;

impl RowDecoder for JsonRowsDecoder {
    fn decode(&self, buffer: &[u8]) -> GridResult<Vec<Row>> {
        serde_json::from_slice(buffer).map_err(|e| GridError::Decode(e.to_string()))
    }
}

/// Reference column-major codec with a CRC32 trailer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ColumnarCodec;

impl RowDecoder for ColumnarCodec {
    fn decode(&self, buffer: &[u8]) -> GridResult<Vec<Row>> {
        decode_columnar(buffer)
    }
}

impl ColumnarCodec {
    pub fn encode(&self, rows: &[Row]) -> GridResult<Vec<u8>> {
        encode_columnar(rows)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn column_kind<'a>(values: impl Iterator<Item = &'a Value>) -> u8 {
    let mut kind: Option<u8> = None;
    for value in values {
        let this = match value {
            Value::Null => continue,
            Value::Number(n) if n.is_i64() => KIND_INT64,
            Value::Number(_) => KIND_FLOAT64,
            Value::String(_) => KIND_UTF8,
            Value::Bool(_) => KIND_BOOL,
            _ => return KIND_JSON,
        };
        kind = match (kind, this) {
            (None, k) => Some(k),
            (Some(a), b) if a == b => Some(a),
            (Some(KIND_INT64), KIND_FLOAT64) | (Some(KIND_FLOAT64), KIND_INT64) => {
                Some(KIND_FLOAT64)
            }
            _ => return KIND_JSON,
        };
    }
    kind.unwrap_or(KIND_JSON)
}

/// Encode rows column-major. Columns are the union of row keys in first-seen
/// order; a row without a column decodes with a null there.
pub fn encode_columnar(rows: &[Row]) -> GridResult<Vec<u8>> {
    let mut columns: IndexSet<&str> = IndexSet::new();
    for row in rows {
        for name in row.keys() {
            columns.insert(name.as_str());
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    out.extend_from_slice(&(columns.len() as u32).to_le_bytes());

    for name in &columns {
        let name_bytes = name.as_bytes();
        let name_len = u16::try_from(name_bytes.len())
            .map_err(|_| GridError::Decode(format!("column name too long: {name}")))?;
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(name_bytes);

        let null = Value::Null;
        let cells = || rows.iter().map(|row| row.get(*name).unwrap_or(&null));
        let kind = column_kind(cells());
        out.push(kind);

        for cell in cells() {
            if cell.is_null() {
                out.push(0);
                continue;
            }
            out.push(1);
            match kind {
                KIND_INT64 => {
                    let v = cell.as_i64().unwrap_or_default();
                    out.extend_from_slice(&v.to_le_bytes());
                }
                KIND_FLOAT64 => {
                    let v = cell.as_f64().unwrap_or_default();
                    out.extend_from_slice(&v.to_le_bytes());
                }
                KIND_UTF8 => {
                    let s = cell.as_str().unwrap_or_default();
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                KIND_BOOL => out.push(u8::from(cell.as_bool().unwrap_or_default())),
                _ => {
                    let text = serde_json::to_vec(cell)?;
                    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
                    out.extend_from_slice(&text);
                }
            }
        }
    }

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> GridResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                GridError::Decode(format!("buffer truncated while reading {what}"))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> GridResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> GridResult<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> GridResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes8(&mut self, what: &str) -> GridResult<[u8; 8]> {
        let b = self.take(8, what)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(out)
    }
}

pub fn decode_columnar(buffer: &[u8]) -> GridResult<Vec<Row>> {
    if buffer.len() < MAGIC.len() + 12 {
        return Err(GridError::Decode(format!(
            "buffer too short ({} bytes)",
            buffer.len()
        )));
    }
    let (body, trailer) = buffer.split_at(buffer.len() - 4);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(GridError::Decode(format!(
            "checksum mismatch (expected {expected:08x}, got {actual:08x})"
        )));
    }

    let mut r = Reader { buf: body, pos: 0 };
    if r.take(4, "magic")? != MAGIC {
        return Err(GridError::Decode("bad magic".into()));
    }
    let n_rows = r.u32("row count")? as usize;
    let n_cols = r.u32("column count")? as usize;

    // Every cell costs at least one validity byte.
    if n_rows.saturating_mul(n_cols.max(1)) > body.len() {
        return Err(GridError::Decode(format!(
            "{n_rows} rows x {n_cols} columns cannot fit in {} bytes",
            body.len()
        )));
    }

    let mut rows: Vec<Row> = (0..n_rows).map(|_| Row::with_capacity(n_cols)).collect();
    for _ in 0..n_cols {
        let name_len = r.u16("column name length")? as usize;
        let name = std::str::from_utf8(r.take(name_len, "column name")?)
            .map_err(|_| GridError::Decode("column name is not utf-8".into()))?
            .to_string();
        let kind = r.u8("column kind")?;
        for row in rows.iter_mut() {
            let value = if r.u8("validity")? == 0 {
                Value::Null
            } else {
                read_cell(&mut r, kind, &name)?
            };
            row.insert(name.clone(), value);
        }
    }

    if r.pos != body.len() {
        return Err(GridError::Decode(format!(
            "{} trailing bytes after last column",
            body.len() - r.pos
        )));
    }
    Ok(rows)
}

fn read_cell(r: &mut Reader<'_>, kind: u8, column: &str) -> GridResult<Value> {
    match kind {
        KIND_INT64 => Ok(Value::from(i64::from_le_bytes(r.bytes8(column)?))),
        KIND_FLOAT64 => {
            let v = f64::from_le_bytes(r.bytes8(column)?);
            Ok(Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null))
        }
        KIND_UTF8 => {
            let len = r.u32(column)? as usize;
            let s = std::str::from_utf8(r.take(len, column)?)
                .map_err(|_| GridError::Decode(format!("column '{column}' holds invalid utf-8")))?;
            Ok(Value::String(s.to_string()))
        }
        KIND_BOOL => Ok(Value::Bool(r.u8(column)? != 0)),
        KIND_JSON => {
            let len = r.u32(column)? as usize;
            serde_json::from_slice(r.take(len, column)?)
                .map_err(|e| GridError::Decode(format!("column '{column}': {e}")))
        }
        other => Err(GridError::Decode(format!(
            "column '{column}' has unknown kind {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture_rows(start: i64, end: i64) -> Vec<Row> {
        (start..end)
            .map(|i| {
                let mut row = Row::new();
                row.insert("row_num".into(), json!(i));
                row.insert("int_col".into(), json!(i + 10));
                row.insert("str_col".into(), json!(format!("s{i}")));
                row.insert("float_col".into(), json!(i as f64 / 2.0));
                row.insert("flag".into(), json!(i % 2 == 0));
                row
            })
            .collect()
    }

    #[test]
    fn test_int_col_integrity_through_binary_path() {
        let buffer = encode_columnar(&fixture_rows(0, 250)).unwrap();
        let rows = ColumnarCodec.decode(&buffer).unwrap();
        assert_eq!(rows.len(), 250);
        for row in &rows {
            let row_num = row["row_num"].as_i64().unwrap();
            assert_eq!(row["int_col"].as_i64().unwrap(), row_num + 10);
        }
        assert_eq!(rows[3]["str_col"], json!("s3"));
        assert_eq!(rows[3]["float_col"], json!(1.5));
        assert_eq!(rows[4]["flag"], json!(true));
    }

    #[test]
    fn test_column_order_preserved() {
        let rows = ColumnarCodec.decode(&encode_columnar(&fixture_rows(0, 1)).unwrap()).unwrap();
        let names: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(names, vec!["row_num", "int_col", "str_col", "float_col", "flag"]);
    }

    #[test]
    fn test_nulls_and_mixed_columns() {
        let mut a = Row::new();
        a.insert("x".into(), json!(1));
        a.insert("mixed".into(), json!("text"));
        let mut b = Row::new();
        b.insert("x".into(), Value::Null);
        b.insert("mixed".into(), json!({"nested": [1, 2]}));
        let mut c = Row::new();
        c.insert("mixed".into(), json!(3));

        let rows = ColumnarCodec.decode(&encode_columnar(&[a, b, c]).unwrap()).unwrap();
        assert_eq!(rows[0]["x"], json!(1));
        assert_eq!(rows[1]["x"], Value::Null);
        assert_eq!(rows[2]["x"], Value::Null);
        assert_eq!(rows[1]["mixed"], json!({"nested": [1, 2]}));
        assert_eq!(rows[2]["mixed"], json!(3));
    }

    #[test]
    fn test_int_and_float_widen_to_float() {
        let mut a = Row::new();
        a.insert("n".into(), json!(1));
        let mut b = Row::new();
        b.insert("n".into(), json!(2.5));
        let rows = ColumnarCodec.decode(&encode_columnar(&[a, b]).unwrap()).unwrap();
        assert_eq!(rows[0]["n"], json!(1.0));
        assert_eq!(rows[1]["n"], json!(2.5));
    }

    #[test]
    fn test_empty_rows_round_trip() {
        let rows = ColumnarCodec.decode(&encode_columnar(&[]).unwrap()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_corrupted_byte_fails_checksum() {
        let mut buffer = encode_columnar(&fixture_rows(0, 5)).unwrap();
        buffer[10] ^= 0xFF;
        let err = ColumnarCodec.decode(&buffer).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_truncated_buffer_is_decode_error() {
        let buffer = encode_columnar(&fixture_rows(0, 5)).unwrap();
        assert!(matches!(
            ColumnarCodec.decode(&buffer[..6]),
            Err(GridError::Decode(_))
        ));
    }

    #[test]
    fn test_json_rows_decoder() {
        let rows = JsonRowsDecoder
            .decode(br#"[{"a": 1, "b": "x"}, {"a": 2, "b": "y"}]"#)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["b"], json!("y"));
        assert!(JsonRowsDecoder.decode(b"not json").is_err());
    }
}
