/* encoded_value / encoded_annotation codec.
 *
 * Values are decoded straight to the symbolic [`Value`] model; pool indices are
 * resolved through [`PoolResolver`] on the way in and assigned again through
 * [`PoolIndexer`] on the way out.
 */

use crate::dex::error::DexError;
use crate::dex::pool::{AnnotationBody, FieldRef, MethodRef, Value};
use crate::dex::{read_u1, read_uleb128, write_u1, write_uleb128};

const VALUE_BYTE: u8 = 0x00;
const VALUE_SHORT: u8 = 0x02;
const VALUE_CHAR: u8 = 0x03;
const VALUE_INT: u8 = 0x04;
const VALUE_LONG: u8 = 0x06;
const VALUE_FLOAT: u8 = 0x10;
const VALUE_DOUBLE: u8 = 0x11;
const VALUE_METHOD_TYPE: u8 = 0x15;
const VALUE_METHOD_HANDLE: u8 = 0x16;
const VALUE_STRING: u8 = 0x17;
const VALUE_TYPE: u8 = 0x18;
const VALUE_FIELD: u8 = 0x19;
const VALUE_METHOD: u8 = 0x1a;
const VALUE_ENUM: u8 = 0x1b;
const VALUE_ARRAY: u8 = 0x1c;
const VALUE_ANNOTATION: u8 = 0x1d;
const VALUE_NULL: u8 = 0x1e;
const VALUE_BOOLEAN: u8 = 0x1f;

/// Resolves raw pool indices into symbolic references while reading.
pub(crate) trait PoolResolver
{
    fn string(&self, idx: u32) -> Result<String, DexError>;
    fn type_descriptor(&self, idx: u32) -> Result<String, DexError>;
    fn field(&self, idx: u32) -> Result<FieldRef, DexError>;
    fn method(&self, idx: u32) -> Result<MethodRef, DexError>;
}

/// Maps symbolic references back to indices in the rebuilt pools.
pub(crate) trait PoolIndexer
{
    fn string_idx(&self, s: &str) -> Result<u32, DexError>;
    fn type_idx(&self, descriptor: &str) -> Result<u32, DexError>;
    fn field_idx(&self, field: &FieldRef) -> Result<u32, DexError>;
    fn method_idx(&self, method: &MethodRef) -> Result<u32, DexError>;
}

pub(crate) fn read_value<R: PoolResolver>(
    bytes: &[u8],
    ix: &mut usize,
    resolver: &R,
) -> Result<Value, DexError>
{
    let header = read_u1(bytes, ix)?;
    let value_arg = header >> 5;
    let value_type = header & 0x1f;
    let size = (value_arg + 1) as usize;

    match value_type
    {
        VALUE_BYTE => Ok(Value::Byte(read_u1(bytes, ix)? as i8)),
        VALUE_SHORT => Ok(Value::Short(read_var_signed(bytes, ix, size)? as i16)),
        VALUE_CHAR => Ok(Value::Char(read_var_unsigned(bytes, ix, size)? as u16)),
        VALUE_INT => Ok(Value::Int(read_var_signed(bytes, ix, size)? as i32)),
        VALUE_LONG => Ok(Value::Long(read_var_signed(bytes, ix, size)?)),
        VALUE_FLOAT =>
        {
            let bits = read_var_right_extended(bytes, ix, size, 4)? as u32;
            Ok(Value::Float(f32::from_bits(bits)))
        }
        VALUE_DOUBLE =>
        {
            let bits = read_var_right_extended(bytes, ix, size, 8)?;
            Ok(Value::Double(f64::from_bits(bits)))
        }
        VALUE_METHOD_TYPE | VALUE_METHOD_HANDLE =>
        {
            Err(DexError::new("Method handle constants are not supported"))
        }
        VALUE_STRING =>
        {
            let idx = read_var_unsigned(bytes, ix, size)? as u32;
            Ok(Value::String(resolver.string(idx)?))
        }
        VALUE_TYPE =>
        {
            let idx = read_var_unsigned(bytes, ix, size)? as u32;
            Ok(Value::Type(resolver.type_descriptor(idx)?))
        }
        VALUE_FIELD =>
        {
            let idx = read_var_unsigned(bytes, ix, size)? as u32;
            Ok(Value::Field(resolver.field(idx)?))
        }
        VALUE_METHOD =>
        {
            let idx = read_var_unsigned(bytes, ix, size)? as u32;
            Ok(Value::Method(resolver.method(idx)?))
        }
        VALUE_ENUM =>
        {
            let idx = read_var_unsigned(bytes, ix, size)? as u32;
            Ok(Value::Enum(resolver.field(idx)?))
        }
        VALUE_ARRAY => Ok(Value::Array(read_array(bytes, ix, resolver)?)),
        VALUE_ANNOTATION => Ok(Value::Annotation(read_annotation_body(bytes, ix, resolver)?)),
        VALUE_NULL => Ok(Value::Null),
        VALUE_BOOLEAN => Ok(Value::Boolean(value_arg != 0)),
        _ => Err(DexError::new(&format!("Unknown encoded value type 0x{:02x}", value_type))),
    }
}

pub(crate) fn read_array<R: PoolResolver>(
    bytes: &[u8],
    ix: &mut usize,
    resolver: &R,
) -> Result<Vec<Value>, DexError>
{
    let size = read_uleb128(bytes, ix)? as usize;
    let mut values = Vec::with_capacity(size);
    for _ in 0..size
    {
        values.push(read_value(bytes, ix, resolver)?);
    }
    Ok(values)
}

pub(crate) fn read_annotation_body<R: PoolResolver>(
    bytes: &[u8],
    ix: &mut usize,
    resolver: &R,
) -> Result<AnnotationBody, DexError>
{
    let type_idx = read_uleb128(bytes, ix)?;
    let type_descriptor = resolver.type_descriptor(type_idx)?;
    let size = read_uleb128(bytes, ix)? as usize;
    let mut elements = Vec::with_capacity(size);
    for _ in 0..size
    {
        let name_idx = read_uleb128(bytes, ix)?;
        let name = resolver.string(name_idx)?;
        let value = read_value(bytes, ix, resolver)?;
        elements.push((name, value));
    }
    Ok(AnnotationBody { type_descriptor, elements })
}

pub(crate) fn write_value<I: PoolIndexer>(
    bytes: &mut Vec<u8>,
    value: &Value,
    indexer: &I,
) -> Result<(), DexError>
{
    match value
    {
        Value::Byte(v) =>
        {
            write_u1(bytes, VALUE_BYTE);
            write_u1(bytes, *v as u8);
        }
        Value::Short(v) => write_signed(bytes, VALUE_SHORT, *v as i64),
        Value::Char(v) => write_unsigned(bytes, VALUE_CHAR, *v as u64),
        Value::Int(v) => write_signed(bytes, VALUE_INT, *v as i64),
        Value::Long(v) => write_signed(bytes, VALUE_LONG, *v),
        Value::Float(v) => write_right_extended(bytes, VALUE_FLOAT, (v.to_bits() as u64) << 32, 4),
        Value::Double(v) => write_right_extended(bytes, VALUE_DOUBLE, v.to_bits(), 8),
        Value::String(s) => write_unsigned(bytes, VALUE_STRING, indexer.string_idx(s)? as u64),
        Value::Type(t) => write_unsigned(bytes, VALUE_TYPE, indexer.type_idx(t)? as u64),
        Value::Field(f) => write_unsigned(bytes, VALUE_FIELD, indexer.field_idx(f)? as u64),
        Value::Method(m) => write_unsigned(bytes, VALUE_METHOD, indexer.method_idx(m)? as u64),
        Value::Enum(f) => write_unsigned(bytes, VALUE_ENUM, indexer.field_idx(f)? as u64),
        Value::Array(values) =>
        {
            write_u1(bytes, VALUE_ARRAY);
            write_array(bytes, values, indexer)?;
        }
        Value::Annotation(body) =>
        {
            write_u1(bytes, VALUE_ANNOTATION);
            write_annotation_body(bytes, body, indexer)?;
        }
        Value::Null => write_u1(bytes, VALUE_NULL),
        Value::Boolean(v) => write_u1(bytes, VALUE_BOOLEAN | ((*v as u8) << 5)),
    }
    Ok(())
}

pub(crate) fn write_array<I: PoolIndexer>(
    bytes: &mut Vec<u8>,
    values: &[Value],
    indexer: &I,
) -> Result<(), DexError>
{
    write_uleb128(bytes, values.len() as u32);
    for value in values
    {
        write_value(bytes, value, indexer)?;
    }
    Ok(())
}

pub(crate) fn write_annotation_body<I: PoolIndexer>(
    bytes: &mut Vec<u8>,
    body: &AnnotationBody,
    indexer: &I,
) -> Result<(), DexError>
{
    write_uleb128(bytes, indexer.type_idx(&body.type_descriptor)?);
    write_uleb128(bytes, body.elements.len() as u32);
    for (name, value) in &body.elements
    {
        write_uleb128(bytes, indexer.string_idx(name)?);
        write_value(bytes, value, indexer)?;
    }
    Ok(())
}

// Sign-extended little-endian integer of 1..=8 bytes
fn read_var_signed(bytes: &[u8], ix: &mut usize, size: usize) -> Result<i64, DexError>
{
    let mut result = 0i64;
    for i in 0..size
    {
        result |= (read_u1(bytes, ix)? as i64) << (8 * i);
    }
    if size < 8
    {
        let shift = 64 - 8 * size as u32;
        result = (result << shift) >> shift;
    }
    Ok(result)
}

fn read_var_unsigned(bytes: &[u8], ix: &mut usize, size: usize) -> Result<u64, DexError>
{
    let mut result = 0u64;
    for i in 0..size
    {
        result |= (read_u1(bytes, ix)? as u64) << (8 * i);
    }
    Ok(result)
}

// Floats drop trailing zero bytes, so the encoded bytes fill the HIGH end of
// the bit pattern.
fn read_var_right_extended(bytes: &[u8], ix: &mut usize, size: usize, full: usize) -> Result<u64, DexError>
{
    let mut result = 0u64;
    for i in 0..size
    {
        result |= (read_u1(bytes, ix)? as u64) << (8 * (full - size + i));
    }
    Ok(result)
}

fn write_signed(bytes: &mut Vec<u8>, value_type: u8, v: i64)
{
    let mut size = 8usize;
    while size > 1
    {
        let shift = 64 - 8 * (size - 1) as u32;
        if ((v << shift) >> shift) != v
        {
            break;
        }
        size -= 1;
    }
    write_u1(bytes, (((size - 1) as u8) << 5) | value_type);
    bytes.extend_from_slice(&v.to_le_bytes()[..size]);
}

fn write_unsigned(bytes: &mut Vec<u8>, value_type: u8, v: u64)
{
    let size = std::cmp::max(1, 8 - v.leading_zeros() as usize / 8);
    write_u1(bytes, (((size - 1) as u8) << 5) | value_type);
    bytes.extend_from_slice(&v.to_le_bytes()[..size]);
}

// `bits` carries the pattern left-justified in 64 bits; trailing zero bytes of
// the `full`-byte pattern are trimmed.
fn write_right_extended(bytes: &mut Vec<u8>, value_type: u8, bits: u64, full: usize)
{
    let pattern = bits >> (8 * (8 - full));
    let trailing = std::cmp::min((pattern.trailing_zeros() / 8) as usize, full - 1);
    let size = full - trailing;
    write_u1(bytes, (((size - 1) as u8) << 5) | value_type);
    bytes.extend_from_slice(&pattern.to_le_bytes()[trailing..full]);
}

#[cfg(test)]
mod tests
{
    use super::*;

    struct EmptyPools;

    impl PoolResolver for EmptyPools
    {
        fn string(&self, idx: u32) -> Result<String, DexError>
        {
            Ok(format!("string{}", idx))
        }
        fn type_descriptor(&self, idx: u32) -> Result<String, DexError>
        {
            Ok(format!("Ltype{};", idx))
        }
        fn field(&self, _idx: u32) -> Result<FieldRef, DexError>
        {
            Err(DexError::new("no fields"))
        }
        fn method(&self, _idx: u32) -> Result<MethodRef, DexError>
        {
            Err(DexError::new("no methods"))
        }
    }

    struct ZeroIndexer;

    impl PoolIndexer for ZeroIndexer
    {
        fn string_idx(&self, _s: &str) -> Result<u32, DexError>
        {
            Ok(0)
        }
        fn type_idx(&self, _descriptor: &str) -> Result<u32, DexError>
        {
            Ok(0)
        }
        fn field_idx(&self, _field: &FieldRef) -> Result<u32, DexError>
        {
            Ok(0)
        }
        fn method_idx(&self, _method: &MethodRef) -> Result<u32, DexError>
        {
            Ok(0)
        }
    }

    fn roundtrip(value: Value) -> Value
    {
        let mut buf = vec![];
        write_value(&mut buf, &value, &ZeroIndexer).unwrap();
        let mut ix = 0;
        let out = read_value(&buf, &mut ix, &EmptyPools).unwrap();
        assert_eq!(ix, buf.len());
        out
    }

    #[test]
    fn integers_use_minimal_sign_extended_size()
    {
        let mut buf = vec![];
        write_value(&mut buf, &Value::Int(-1), &ZeroIndexer).unwrap();
        assert_eq!(buf, vec![VALUE_INT, 0xff]);

        let mut buf = vec![];
        write_value(&mut buf, &Value::Int(128), &ZeroIndexer).unwrap();
        // 128 needs two bytes: 0x80 alone would sign-extend negative
        assert_eq!(buf, vec![(1 << 5) | VALUE_INT, 0x80, 0x00]);
    }

    #[test]
    fn integer_roundtrips()
    {
        for v in [0i64, 1, -1, 127, -128, 0x12345678, i64::MIN, i64::MAX]
        {
            assert_eq!(roundtrip(Value::Long(v)), Value::Long(v));
        }
    }

    #[test]
    fn floats_trim_trailing_bytes()
    {
        // 2.0f32 = 0x40000000: only the high byte survives
        let mut buf = vec![];
        write_value(&mut buf, &Value::Float(2.0), &ZeroIndexer).unwrap();
        assert_eq!(buf, vec![VALUE_FLOAT, 0x40]);
        assert_eq!(roundtrip(Value::Float(2.0)), Value::Float(2.0));
        assert_eq!(roundtrip(Value::Double(-0.5)), Value::Double(-0.5));
    }

    #[test]
    fn booleans_pack_into_the_header()
    {
        let mut buf = vec![];
        write_value(&mut buf, &Value::Boolean(true), &ZeroIndexer).unwrap();
        assert_eq!(buf, vec![VALUE_BOOLEAN | (1 << 5)]);
        assert_eq!(roundtrip(Value::Boolean(false)), Value::Boolean(false));
        assert_eq!(roundtrip(Value::Null), Value::Null);
    }

    #[test]
    fn arrays_nest()
    {
        let v = Value::Array(vec![Value::Int(1), Value::Array(vec![Value::Boolean(true)])]);
        assert_eq!(roundtrip(v.clone()), v);
    }
}
