#[macro_use]
pub mod error;

pub mod pool;
pub mod merge;
pub(crate) mod encoded;
pub(crate) mod insns;
pub(crate) mod reader;
pub(crate) mod writer;

use crate::dex::error::DexError;

// Little-endian primitive reads against a shared cursor

pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8, DexError>
{
    if bytes.len() < *ix + 1
    {
        fail!("Unexpected end of stream reading u1 at index {}", *ix);
    }
    let result = bytes[*ix];
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16, DexError>
{
    if bytes.len() < *ix + 2
    {
        fail!("Unexpected end of stream reading u2 at index {}", *ix);
    }
    let result = ((bytes[*ix + 1] as u16) << 8) | (bytes[*ix] as u16);
    *ix += 2;
    Ok(result)
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    if bytes.len() < *ix + 4
    {
        fail!("Unexpected end of stream reading u4 at index {}", *ix);
    }
    let result = ((bytes[*ix + 3] as u32) << 24)
        | ((bytes[*ix + 2] as u32) << 16)
        | ((bytes[*ix + 1] as u32) << 8)
        | (bytes[*ix] as u32);
    *ix += 4;
    Ok(result)
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    if *ix >= bytes.len()
    {
        fail!("Unexpected end of stream reading uleb128 at index {}", *ix);
    }
    let (val, size) = decode_uleb128(&bytes[*ix..]);
    *ix += size;
    Ok(val)
}

pub(crate) fn read_sleb128(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError>
{
    if *ix >= bytes.len()
    {
        fail!("Unexpected end of stream reading sleb128 at index {}", *ix);
    }
    let (val, size) = decode_sleb128(&bytes[*ix..]);
    *ix += size;
    Ok(val)
}

pub(crate) fn read_uleb128p1(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError>
{
    let v = read_uleb128(bytes, ix)?;
    Ok(v as i32 - 1)
}

pub(crate) fn read_x(bytes: &[u8], ix: &mut usize, length: usize) -> Result<Vec<u8>, DexError>
{
    if bytes.len() - *ix < length
    {
        fail!("Unexpected end of stream reading {} bytes at index {}", length, *ix);
    }
    let v = bytes[*ix..*ix + length].to_vec();
    *ix += length;
    Ok(v)
}

pub(crate) fn write_u1(buffer: &mut Vec<u8>, val: u8)
{
    buffer.push(val);
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16)
{
    buffer.extend_from_slice(&val.to_le_bytes());
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32)
{
    buffer.extend_from_slice(&val.to_le_bytes());
}

pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32)
{
    let mut remaining = val;
    loop
    {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining != 0
        {
            byte |= 0x80;
        }
        buffer.push(byte);
        if remaining == 0
        {
            break;
        }
    }
}

pub(crate) fn write_sleb128(buffer: &mut Vec<u8>, val: i32)
{
    let mut remaining = val;
    loop
    {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        let more =
            !((remaining == 0 && (byte & 0x40) == 0) || (remaining == -1 && (byte & 0x40) != 0));
        if more
        {
            byte |= 0x80;
        }
        buffer.push(byte);
        if !more
        {
            break;
        }
    }
}

pub(crate) fn write_uleb128p1(buffer: &mut Vec<u8>, val: i32)
{
    write_uleb128(buffer, (val + 1) as u32);
}

pub(crate) fn decode_uleb128(encoded: &[u8]) -> (u32, usize)
{
    let mut value: u32 = 0;
    let mut shift: u32 = 0;
    let mut count: usize = 0;

    for &byte in encoded
    {
        count += 1;
        let low = (byte & 0x7F) as u32;
        if shift < 32
        {
            value = value.wrapping_add(low.wrapping_shl(shift));
        }
        let cont = (byte & 0x80) != 0;
        shift = shift.saturating_add(7);

        // 32-bit values never need more than 5 bytes
        if !cont || count == 5
        {
            break;
        }
    }

    (value, count)
}

pub(crate) fn decode_sleb128(encoded: &[u8]) -> (i32, usize)
{
    let mut value: i32 = 0;
    let mut shift: u32 = 0;
    let mut count: usize = 0;
    let mut last_byte: u8 = 0;

    for &byte in encoded
    {
        count += 1;
        last_byte = byte;
        let low = (byte & 0x7F) as i32;
        if shift < 32
        {
            value |= low.wrapping_shl(shift);
        }
        let cont = (byte & 0x80) != 0;
        shift = shift.saturating_add(7);
        if !cont || count == 5
        {
            break;
        }
    }

    if (last_byte & 0x40) != 0 && shift < 32
    {
        value |= (-1i32).wrapping_shl(shift);
    }

    (value, count)
}

/// Pads `buffer` with zero bytes up to the given alignment.
pub(crate) fn align_to(buffer: &mut Vec<u8>, alignment: usize)
{
    while buffer.len() % alignment != 0
    {
        buffer.push(0);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn uleb(val: u32) -> Vec<u8>
    {
        let mut buf = Vec::new();
        write_uleb128(&mut buf, val);
        buf
    }

    fn sleb(val: i32) -> Vec<u8>
    {
        let mut buf = Vec::new();
        write_sleb128(&mut buf, val);
        buf
    }

    #[test]
    fn uleb128_encoding()
    {
        assert_eq!(uleb(0), vec![0x00]);
        assert_eq!(uleb(1), vec![0x01]);
        assert_eq!(uleb(127), vec![0x7F]);
        assert_eq!(uleb(128), vec![0x80, 0x01]);
        assert_eq!(uleb(624485), vec![0xE5, 0x8E, 0x26]);
    }

    #[test]
    fn uleb128_decoding()
    {
        for val in [0u32, 1, 127, 128, 16256, 624485, u32::MAX]
        {
            let encoded = uleb(val);
            let (decoded, size) = decode_uleb128(&encoded);
            assert_eq!(decoded, val);
            assert_eq!(size, encoded.len());
        }
    }

    #[test]
    fn sleb128_roundtrip()
    {
        for val in [0i32, 1, -1, 127, -128, -123456, i32::MIN, i32::MAX]
        {
            let encoded = sleb(val);
            let (decoded, size) = decode_sleb128(&encoded);
            assert_eq!(decoded, val);
            assert_eq!(size, encoded.len());
        }
    }

    #[test]
    fn uleb128p1_offsets_by_one()
    {
        let mut buf = Vec::new();
        write_uleb128p1(&mut buf, -1);
        assert_eq!(buf, vec![0x00]);
        let mut ix = 0;
        assert_eq!(read_uleb128p1(&buf, &mut ix).unwrap(), -1);
    }

    #[test]
    fn primitive_reads_check_bounds()
    {
        let bytes = [0x01u8, 0x02];
        let mut ix = 0;
        assert_eq!(read_u2(&bytes, &mut ix).unwrap(), 0x0201);
        assert!(read_u1(&bytes, &mut ix).is_err());
        let mut ix = 0;
        assert!(read_u4(&bytes, &mut ix).is_err());
    }
}
