//! Type-directed binary codec.
//!
//! Epistemic foundation:
//! - K_i: The file stores no schema; the descriptor drives both directions
//! - K_i: The header carries the descriptor fingerprint so a reader given the
//!   wrong descriptor fails instead of misreading bytes
//! - B_i: The stream may be truncated → trailer with record count

use crate::models::{DataType, Result, StagepointError, TypeDescriptor, Value};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, BufReader, BufWriter, Read, Write};

/// Leading bytes of every checkpoint file.
pub const MAGIC: &[u8; 4] = b"STPT";
/// Format version written after the magic.
pub const FORMAT_VERSION: u8 = 1;

const RECORD_MARKER: u8 = 1;
const END_MARKER: u8 = 0;

/// Check that every type in the descriptor has a binary mapping.
pub fn ensure_serializable(descriptor: &TypeDescriptor) -> Result<()> {
    if let Some(name) = descriptor.root().find_opaque() {
        return Err(StagepointError::TypeMismatch(format!(
            "type '{name}' in {descriptor} has no binary encoding"
        )));
    }
    Ok(())
}

fn write_len<W: Write>(out: &mut W, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        StagepointError::InvalidInput(format!("length {len} exceeds u32 framing"))
    })?;
    out.write_u32::<LittleEndian>(len)
        .map_err(|e| StagepointError::io("writing length", e))
}

/// Encode one value by walking `data_type`.
///
/// The caller is expected to have checked conformance; a mismatch found
/// during encoding is reported as `TypeMismatch`.
pub fn encode_value<W: Write>(out: &mut W, data_type: &DataType, value: &Value) -> Result<()> {
    let io_err = |e| StagepointError::io("encoding value", e);
    match (data_type, value) {
        (DataType::Nullable(_), Value::Null) => out.write_u8(0).map_err(io_err),
        (DataType::Nullable(inner), value) => {
            out.write_u8(1).map_err(io_err)?;
            encode_value(out, inner, value)
        }
        (DataType::Bool, Value::Bool(b)) => out.write_u8(u8::from(*b)).map_err(io_err),
        (DataType::Int32, Value::Int32(v)) => out.write_i32::<LittleEndian>(*v).map_err(io_err),
        (DataType::Int64, Value::Int64(v)) => out.write_i64::<LittleEndian>(*v).map_err(io_err),
        (DataType::Float64, Value::Float64(v)) => {
            out.write_f64::<LittleEndian>(*v).map_err(io_err)
        }
        (DataType::Utf8, Value::Utf8(s)) => {
            write_len(out, s.len())?;
            out.write_all(s.as_bytes()).map_err(io_err)
        }
        (DataType::Binary, Value::Binary(bytes)) => {
            write_len(out, bytes.len())?;
            out.write_all(bytes).map_err(io_err)
        }
        (DataType::List(element), Value::List(items)) => {
            write_len(out, items.len())?;
            for item in items {
                encode_value(out, element, item)?;
            }
            Ok(())
        }
        (DataType::Struct(fields), Value::Struct(values)) if fields.len() == values.len() => {
            for (field, value) in fields.iter().zip(values) {
                encode_value(out, &field.data_type, value)?;
            }
            Ok(())
        }
        (data_type, value) => Err(StagepointError::TypeMismatch(format!(
            "value {value} does not match type {data_type}"
        ))),
    }
}

fn corrupt(context: &str, e: io::Error) -> StagepointError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        StagepointError::Corrupt(format!("unexpected end of data while {context}"))
    } else {
        StagepointError::io(context.to_string(), e)
    }
}

fn read_len<R: Read>(input: &mut R) -> Result<usize> {
    input
        .read_u32::<LittleEndian>()
        .map(|len| len as usize)
        .map_err(|e| corrupt("reading length", e))
}

fn read_bytes<R: Read>(input: &mut R) -> Result<Vec<u8>> {
    let len = read_len(input)?;
    let mut buf = Vec::new();
    input
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| corrupt("reading bytes", e))?;
    if buf.len() != len {
        return Err(StagepointError::Corrupt(format!(
            "expected {len} bytes, found {}",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Decode one value of shape `data_type`.
pub fn decode_value<R: Read>(input: &mut R, data_type: &DataType) -> Result<Value> {
    let value = match data_type {
        DataType::Nullable(inner) => match input.read_u8().map_err(|e| corrupt("reading null tag", e))? {
            0 => Value::Null,
            1 => decode_value(input, inner)?,
            tag => {
                return Err(StagepointError::Corrupt(format!("invalid null tag {tag}")));
            }
        },
        DataType::Bool => match input.read_u8().map_err(|e| corrupt("reading bool", e))? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            b => return Err(StagepointError::Corrupt(format!("invalid bool byte {b}"))),
        },
        DataType::Int32 => Value::Int32(
            input
                .read_i32::<LittleEndian>()
                .map_err(|e| corrupt("reading i32", e))?,
        ),
        DataType::Int64 => Value::Int64(
            input
                .read_i64::<LittleEndian>()
                .map_err(|e| corrupt("reading i64", e))?,
        ),
        DataType::Float64 => Value::Float64(
            input
                .read_f64::<LittleEndian>()
                .map_err(|e| corrupt("reading f64", e))?,
        ),
        DataType::Utf8 => {
            let bytes = read_bytes(input)?;
            Value::Utf8(String::from_utf8(bytes).map_err(|e| {
                StagepointError::Corrupt(format!("invalid utf-8 string: {e}"))
            })?)
        }
        DataType::Binary => Value::Binary(read_bytes(input)?),
        DataType::List(element) => {
            let len = read_len(input)?;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(decode_value(input, element)?);
            }
            Value::List(items)
        }
        DataType::Struct(fields) => {
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                values.push(decode_value(input, &field.data_type)?);
            }
            Value::Struct(values)
        }
        DataType::Opaque(name) => {
            return Err(StagepointError::TypeMismatch(format!(
                "type '{name}' has no binary encoding"
            )));
        }
    };
    Ok(value)
}

/// Sequential writer of records conforming to one descriptor.
pub struct RecordWriter<W: Write> {
    out: BufWriter<W>,
    descriptor: TypeDescriptor,
    count: u64,
}

impl<W: Write> RecordWriter<W> {
    /// Write the header and return a writer for `descriptor`.
    pub fn new(inner: W, descriptor: TypeDescriptor) -> Result<Self> {
        ensure_serializable(&descriptor)?;
        let mut out = BufWriter::new(inner);
        out.write_all(MAGIC)
            .and_then(|_| out.write_u8(FORMAT_VERSION))
            .and_then(|_| out.write_u64::<LittleEndian>(descriptor.fingerprint()))
            .map_err(|e| StagepointError::io("writing header", e))?;
        Ok(Self {
            out,
            descriptor,
            count: 0,
        })
    }

    /// Append one record.
    pub fn write(&mut self, record: &Value) -> Result<()> {
        if !record.conforms_to(self.descriptor.root()) {
            return Err(StagepointError::TypeMismatch(format!(
                "record {record} does not conform to {}",
                self.descriptor
            )));
        }
        self.out
            .write_u8(RECORD_MARKER)
            .map_err(|e| StagepointError::io("writing record marker", e))?;
        encode_value(&mut self.out, self.descriptor.root(), record)?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Write the trailer and flush. Returns the number of records written.
    pub fn finish(mut self) -> Result<u64> {
        self.out
            .write_u8(END_MARKER)
            .and_then(|_| self.out.write_u64::<LittleEndian>(self.count))
            .and_then(|_| self.out.flush())
            .map_err(|e| StagepointError::io("writing trailer", e))?;
        Ok(self.count)
    }
}

/// Sequential reader of records, typed by the descriptor the caller supplies.
pub struct RecordReader<R: Read> {
    input: BufReader<R>,
    descriptor: TypeDescriptor,
    read: u64,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    /// Read and verify the header against `descriptor`.
    pub fn new(inner: R, descriptor: TypeDescriptor) -> Result<Self> {
        ensure_serializable(&descriptor)?;
        let mut input = BufReader::new(inner);

        let mut magic = [0u8; 4];
        input
            .read_exact(&mut magic)
            .map_err(|e| corrupt("reading header", e))?;
        if &magic != MAGIC {
            return Err(StagepointError::Corrupt("not a stagepoint checkpoint".to_string()));
        }
        let version = input.read_u8().map_err(|e| corrupt("reading version", e))?;
        if version != FORMAT_VERSION {
            return Err(StagepointError::Corrupt(format!(
                "unsupported format version {version}"
            )));
        }
        let fingerprint = input
            .read_u64::<LittleEndian>()
            .map_err(|e| corrupt("reading fingerprint", e))?;
        if fingerprint != descriptor.fingerprint() {
            return Err(StagepointError::TypeMismatch(format!(
                "checkpoint was written with a different type than {descriptor}"
            )));
        }

        Ok(Self {
            input,
            descriptor,
            read: 0,
            done: false,
        })
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    fn next_record(&mut self) -> Result<Option<Value>> {
        let marker = self
            .input
            .read_u8()
            .map_err(|e| corrupt("reading record marker", e))?;
        match marker {
            RECORD_MARKER => {
                let value = decode_value(&mut self.input, self.descriptor.root())?;
                self.read += 1;
                Ok(Some(value))
            }
            END_MARKER => {
                let expected = self
                    .input
                    .read_u64::<LittleEndian>()
                    .map_err(|e| corrupt("reading trailer", e))?;
                if expected != self.read {
                    return Err(StagepointError::Corrupt(format!(
                        "trailer records {expected} rows but {} were read",
                        self.read
                    )));
                }
                Ok(None)
            }
            other => Err(StagepointError::Corrupt(format!(
                "invalid record marker {other}"
            ))),
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Field;

    fn write_all(descriptor: &TypeDescriptor, records: &[Value]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = RecordWriter::new(&mut buf, descriptor.clone()).unwrap();
        for record in records {
            writer.write(record).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), records.len() as u64);
        buf
    }

    fn read_all(descriptor: &TypeDescriptor, bytes: &[u8]) -> Result<Vec<Value>> {
        RecordReader::new(bytes, descriptor.clone())?.collect()
    }

    #[test]
    fn test_integer_collection() {
        let desc = TypeDescriptor::scalar(DataType::Int64);
        let records = vec![Value::Int64(10), Value::Int64(20), Value::Int64(30)];
        let bytes = write_all(&desc, &records);
        assert_eq!(read_all(&desc, &bytes).unwrap(), records);
    }

    #[test]
    fn test_nested_record_shape() {
        let desc = TypeDescriptor::new(DataType::Struct(vec![
            Field::new("id", DataType::Int32),
            Field::new("name", DataType::Utf8),
            Field::new("score", DataType::nullable(DataType::Float64)),
            Field::new("tags", DataType::list(DataType::Utf8)),
            Field::new(
                "origin",
                DataType::Struct(vec![
                    Field::new("lat", DataType::Float64),
                    Field::new("raw", DataType::Binary),
                    Field::new("ok", DataType::Bool),
                ]),
            ),
        ]));
        let records = vec![
            Value::record([
                Value::Int32(1),
                Value::Utf8("alpha".into()),
                Value::Float64(0.5),
                Value::List(vec![Value::Utf8("a".into()), Value::Utf8("b".into())]),
                Value::record([
                    Value::Float64(52.1),
                    Value::Binary(vec![0, 255]),
                    Value::Bool(true),
                ]),
            ]),
            Value::record([
                Value::Int32(-2),
                Value::Utf8(String::new()),
                Value::Null,
                Value::List(vec![]),
                Value::record([Value::Float64(-1.0), Value::Binary(vec![]), Value::Bool(false)]),
            ]),
        ];
        let bytes = write_all(&desc, &records);
        assert_eq!(read_all(&desc, &bytes).unwrap(), records);
    }

    #[test]
    fn test_empty_collection() {
        let desc = TypeDescriptor::scalar(DataType::Utf8);
        let bytes = write_all(&desc, &[]);
        assert!(read_all(&desc, &bytes).unwrap().is_empty());
    }

    #[test]
    fn test_nonconforming_record_rejected() {
        let desc = TypeDescriptor::scalar(DataType::Int64);
        let mut writer = RecordWriter::new(Vec::new(), desc).unwrap();
        let err = writer.write(&Value::Utf8("nope".into())).unwrap_err();
        assert!(matches!(err, StagepointError::TypeMismatch(_)));
        assert_eq!(writer.count(), 0);
    }

    #[test]
    fn test_opaque_descriptor_rejected() {
        let desc = TypeDescriptor::record([("shape", DataType::Opaque("Geometry".into()))]);
        let err = RecordWriter::new(Vec::new(), desc).err().unwrap();
        assert!(matches!(err, StagepointError::TypeMismatch(_)));
    }

    #[test]
    fn test_reader_rejects_other_descriptor() {
        let desc = TypeDescriptor::scalar(DataType::Int64);
        let bytes = write_all(&desc, &[Value::Int64(1)]);
        let other = TypeDescriptor::scalar(DataType::Int32);
        let err = read_all(&other, &bytes).unwrap_err();
        assert!(matches!(err, StagepointError::TypeMismatch(_)));
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let desc = TypeDescriptor::scalar(DataType::Int64);
        let bytes = write_all(&desc, &[Value::Int64(1), Value::Int64(2)]);
        // drop the trailer
        let truncated = &bytes[..bytes.len() - 9];
        let err = read_all(&desc, truncated).unwrap_err();
        assert!(matches!(err, StagepointError::Corrupt(_)));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let desc = TypeDescriptor::scalar(DataType::Int64);
        let err = RecordReader::new(&b"NOPE\x01"[..], desc).err().unwrap();
        assert!(matches!(err, StagepointError::Corrupt(_)));
    }
}
