/* Dalvik instruction stream codec.
 *
 * Instructions are kept as raw code units plus a symbolic reference for the
 * formats that carry a constant-pool index (21c, 22c, 31c, 35c, 3rc). The index
 * slot inside the units is zeroed on decode and re-spliced on encode, so every
 * instruction keeps its original width and branch offsets survive untouched.
 */

use crate::dex::error::DexError;
use crate::dex::pool::{InsnRef, Instruction};

pub(crate) const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
pub(crate) const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
pub(crate) const FILL_ARRAY_DATA_PAYLOAD: u16 = 0x0300;

pub(crate) const OP_INVOKE_VIRTUAL: u8 = 0x6e;
pub(crate) const OP_INVOKE_STATIC: u8 = 0x71;
pub(crate) const OP_INVOKE_INTERFACE: u8 = 0x72;
pub(crate) const OP_INVOKE_VIRTUAL_RANGE: u8 = 0x74;
pub(crate) const OP_INVOKE_STATIC_RANGE: u8 = 0x77;
pub(crate) const OP_INVOKE_INTERFACE_RANGE: u8 = 0x78;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefKind
{
    None,
    String,
    Type,
    Field,
    Method,
}

/// Where the pool index lives inside the code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefSlot
{
    None,
    /// 16-bit index in unit 1 (formats 21c, 22c, 35c, 3rc).
    Unit1,
    /// 32-bit index in units 1..=2 (format 31c).
    Unit1Wide,
}

/// Instruction widths in code units, indexed by opcode. Zero marks gaps in the
/// opcode space and the formats this codec refuses (method handles, call sites).
const WIDTHS: [u8; 256] = build_width_table();

const fn build_width_table() -> [u8; 256]
{
    let mut t = [0u8; 256];
    t[0x00] = 1; // nop (payloads handled separately)
    let mut op = 0x01;
    while op <= 0x0d
    {
        // moves and move-results
        t[op] = match op
        {
            0x02 | 0x05 | 0x08 => 2,
            0x03 | 0x06 | 0x09 => 3,
            _ => 1,
        };
        op += 1;
    }
    t[0x0e] = 1; // return-void
    t[0x0f] = 1;
    t[0x10] = 1;
    t[0x11] = 1;
    t[0x12] = 1; // const/4
    t[0x13] = 2;
    t[0x14] = 3;
    t[0x15] = 2;
    t[0x16] = 2;
    t[0x17] = 3;
    t[0x18] = 5; // const-wide
    t[0x19] = 2;
    t[0x1a] = 2; // const-string
    t[0x1b] = 3; // const-string/jumbo
    t[0x1c] = 2; // const-class
    t[0x1d] = 1;
    t[0x1e] = 1;
    t[0x1f] = 2; // check-cast
    t[0x20] = 2; // instance-of
    t[0x21] = 1;
    t[0x22] = 2; // new-instance
    t[0x23] = 2; // new-array
    t[0x24] = 3; // filled-new-array
    t[0x25] = 3; // filled-new-array/range
    t[0x26] = 3; // fill-array-data
    t[0x27] = 1; // throw
    t[0x28] = 1; // goto
    t[0x29] = 2;
    t[0x2a] = 3;
    t[0x2b] = 3; // packed-switch
    t[0x2c] = 3; // sparse-switch
    op = 0x2d;
    while op <= 0x31
    {
        t[op] = 2; // cmpkind
        op += 1;
    }
    op = 0x32;
    while op <= 0x3d
    {
        t[op] = 2; // if-test / if-testz
        op += 1;
    }
    op = 0x44;
    while op <= 0x51
    {
        t[op] = 2; // aget/aput
        op += 1;
    }
    op = 0x52;
    while op <= 0x6d
    {
        t[op] = 2; // iget/iput/sget/sput
        op += 1;
    }
    op = 0x6e;
    while op <= 0x72
    {
        t[op] = 3; // invoke-kind
        op += 1;
    }
    op = 0x74;
    while op <= 0x78
    {
        t[op] = 3; // invoke-kind/range
        op += 1;
    }
    op = 0x7b;
    while op <= 0x8f
    {
        t[op] = 1; // unop
        op += 1;
    }
    op = 0x90;
    while op <= 0xaf
    {
        t[op] = 2; // binop
        op += 1;
    }
    op = 0xb0;
    while op <= 0xcf
    {
        t[op] = 1; // binop/2addr
        op += 1;
    }
    op = 0xd0;
    while op <= 0xd7
    {
        t[op] = 2; // binop/lit16
        op += 1;
    }
    op = 0xd8;
    while op <= 0xe2
    {
        t[op] = 2; // binop/lit8
        op += 1;
    }
    t
}

pub(crate) fn ref_kind(op: u8) -> RefKind
{
    match op
    {
        0x1a | 0x1b => RefKind::String,
        0x1c | 0x1f | 0x20 | 0x22 | 0x23 | 0x24 | 0x25 => RefKind::Type,
        0x52..=0x6d => RefKind::Field,
        0x6e..=0x72 | 0x74..=0x78 => RefKind::Method,
        _ => RefKind::None,
    }
}

pub(crate) fn ref_slot(op: u8) -> RefSlot
{
    match op
    {
        0x1b => RefSlot::Unit1Wide,
        _ if ref_kind(op) != RefKind::None => RefSlot::Unit1,
        _ => RefSlot::None,
    }
}

/// Width of the instruction starting at `pos`, in code units.
fn width_at(units: &[u16], pos: usize) -> Result<usize, DexError>
{
    let unit = units[pos];
    let op = (unit & 0xff) as u8;

    if op == 0x00 && unit != 0x0000
    {
        // payload pseudo-instruction
        return match unit
        {
            PACKED_SWITCH_PAYLOAD =>
            {
                let size = *units.get(pos + 1).ok_or_else(|| DexError::new("Truncated packed-switch payload"))? as usize;
                Ok(size * 2 + 4)
            }
            SPARSE_SWITCH_PAYLOAD =>
            {
                let size = *units.get(pos + 1).ok_or_else(|| DexError::new("Truncated sparse-switch payload"))? as usize;
                Ok(size * 4 + 2)
            }
            FILL_ARRAY_DATA_PAYLOAD =>
            {
                if pos + 4 > units.len()
                {
                    fail!("Truncated fill-array-data payload at unit {}", pos);
                }
                let element_width = units[pos + 1] as usize;
                let size = (units[pos + 2] as usize) | ((units[pos + 3] as usize) << 16);
                Ok((size * element_width + 1) / 2 + 4)
            }
            _ => Err(DexError::new(&format!("Unknown nop payload 0x{:04x} at unit {}", unit, pos))),
        };
    }

    match op
    {
        0xfa..=0xfd =>
        {
            fail!("Unsupported opcode 0x{:02x} (invoke-polymorphic/custom) at unit {}", op, pos)
        }
        0xfe | 0xff =>
        {
            fail!("Unsupported opcode 0x{:02x} (method handle constant) at unit {}", op, pos)
        }
        _ =>
        {}
    }

    let w = WIDTHS[op as usize] as usize;
    if w == 0
    {
        fail!("Unknown opcode 0x{:02x} at unit {}", op, pos);
    }
    Ok(w)
}

/// Decodes a full instruction stream, resolving pool indices through `resolve`.
pub(crate) fn decode<F>(units: &[u16], mut resolve: F) -> Result<Vec<Instruction>, DexError>
where
    F: FnMut(RefKind, u32) -> Result<InsnRef, DexError>,
{
    let mut out = vec![];
    let mut pos = 0;
    while pos < units.len()
    {
        let w = width_at(units, pos)?;
        if pos + w > units.len()
        {
            fail!("Instruction at unit {} overruns code (width {})", pos, w);
        }
        let mut insn_units = units[pos..pos + w].to_vec();
        let op = (insn_units[0] & 0xff) as u8;
        let kind = ref_kind(op);
        let reference = match ref_slot(op)
        {
            RefSlot::None => InsnRef::None,
            RefSlot::Unit1 =>
            {
                let idx = insn_units[1] as u32;
                insn_units[1] = 0;
                resolve(kind, idx)?
            }
            RefSlot::Unit1Wide =>
            {
                let idx = (insn_units[1] as u32) | ((insn_units[2] as u32) << 16);
                insn_units[1] = 0;
                insn_units[2] = 0;
                resolve(kind, idx)?
            }
        };
        out.push(Instruction { units: insn_units, reference });
        pos += w;
    }
    Ok(out)
}

/// Re-encodes instructions, splicing rebuilt pool indices via `index_of`.
pub(crate) fn encode<F>(instructions: &[Instruction], mut index_of: F) -> Result<Vec<u16>, DexError>
where
    F: FnMut(&InsnRef) -> Result<u32, DexError>,
{
    let mut out = vec![];
    for insn in instructions
    {
        let op = insn.opcode();
        let mut units = insn.units.clone();
        match ref_slot(op)
        {
            RefSlot::None =>
            {}
            RefSlot::Unit1 =>
            {
                let idx = index_of(&insn.reference)?;
                if idx > 0xffff
                {
                    fail!("Pool index {} exceeds 16 bits for opcode 0x{:02x}", idx, op);
                }
                units[1] = idx as u16;
            }
            RefSlot::Unit1Wide =>
            {
                let idx = index_of(&insn.reference)?;
                units[1] = idx as u16;
                units[2] = (idx >> 16) as u16;
            }
        }
        out.extend(units);
    }
    Ok(out)
}
