/* DEX container reader.
 *
 * Parses a classes.dex image into the symbolic DexPool model. All pool indices
 * are resolved eagerly, so nothing in the result depends on the original table
 * layout.
 */

use adler::adler32_slice;
use cesu8::from_java_cesu8;
use log::warn;

use crate::dex::encoded::{read_array, read_annotation_body, PoolResolver};
use crate::dex::error::DexError;
use crate::dex::insns::{self, RefKind};
use crate::dex::pool::*;
use crate::dex::{read_u1, read_u2, read_u4, read_uleb128, read_uleb128p1, read_sleb128};

const HEADER_SIZE: u32 = 0x70;

struct Header
{
    checksum: u32,
    string_ids_size: u32,
    string_ids_off: u32,
    type_ids_size: u32,
    type_ids_off: u32,
    proto_ids_size: u32,
    proto_ids_off: u32,
    field_ids_size: u32,
    field_ids_off: u32,
    method_ids_size: u32,
    method_ids_off: u32,
    class_defs_size: u32,
    class_defs_off: u32,
}

fn read_header(bytes: &[u8]) -> Result<Header, DexError>
{
    if bytes.len() < HEADER_SIZE as usize
    {
        fail!("File too short for a DEX header ({} bytes)", bytes.len());
    }
    if bytes[0..4] != DEX_FILE_MAGIC[0..4]
    {
        fail!("Bad DEX magic");
    }
    if !bytes[4..7].iter().all(|b| b.is_ascii_digit()) || bytes[7] != 0
    {
        fail!("Bad DEX version string");
    }

    let mut ix = 8;
    let checksum = read_u4(bytes, &mut ix)?;
    ix = 36;
    let header_size = read_u4(bytes, &mut ix)?;
    if header_size != HEADER_SIZE
    {
        fail!("Unexpected header size 0x{:x}", header_size);
    }
    let endian_tag = read_u4(bytes, &mut ix)?;
    if endian_tag != ENDIAN_CONSTANT
    {
        fail!("Unsupported endian tag 0x{:08x}", endian_tag);
    }

    ix = 56;
    let string_ids_size = read_u4(bytes, &mut ix)?;
    let string_ids_off = read_u4(bytes, &mut ix)?;
    let type_ids_size = read_u4(bytes, &mut ix)?;
    let type_ids_off = read_u4(bytes, &mut ix)?;
    let proto_ids_size = read_u4(bytes, &mut ix)?;
    let proto_ids_off = read_u4(bytes, &mut ix)?;
    let field_ids_size = read_u4(bytes, &mut ix)?;
    let field_ids_off = read_u4(bytes, &mut ix)?;
    let method_ids_size = read_u4(bytes, &mut ix)?;
    let method_ids_off = read_u4(bytes, &mut ix)?;
    let class_defs_size = read_u4(bytes, &mut ix)?;
    let class_defs_off = read_u4(bytes, &mut ix)?;

    Ok(Header {
        checksum,
        string_ids_size,
        string_ids_off,
        type_ids_size,
        type_ids_off,
        proto_ids_size,
        proto_ids_off,
        field_ids_size,
        field_ids_off,
        method_ids_size,
        method_ids_off,
        class_defs_size,
        class_defs_off,
    })
}

/// The resolved id tables of one DEX file.
struct Tables
{
    strings: Vec<String>,
    types: Vec<String>,
    protos: Vec<MethodProto>,
    fields: Vec<FieldRef>,
    methods: Vec<MethodRef>,
}

impl Tables
{
    fn descriptor(&self, type_idx: u32) -> Result<&str, DexError>
    {
        self.types
            .get(type_idx as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| DexError::new(&format!("Type index {} out of range", type_idx)))
    }
}

impl PoolResolver for Tables
{
    fn string(&self, idx: u32) -> Result<String, DexError>
    {
        self.strings
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| DexError::new(&format!("String index {} out of range", idx)))
    }

    fn type_descriptor(&self, idx: u32) -> Result<String, DexError>
    {
        Ok(self.descriptor(idx)?.to_string())
    }

    fn field(&self, idx: u32) -> Result<FieldRef, DexError>
    {
        self.fields
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| DexError::new(&format!("Field index {} out of range", idx)))
    }

    fn method(&self, idx: u32) -> Result<MethodRef, DexError>
    {
        self.methods
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| DexError::new(&format!("Method index {} out of range", idx)))
    }
}

fn read_mutf8(bytes: &[u8], ix: &mut usize) -> Result<String, DexError>
{
    let _utf16_size = read_uleb128(bytes, ix)?;
    let start = *ix;
    let end = bytes[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or_else(|| DexError::new("Unterminated string data"))?;
    *ix = end + 1;
    match from_java_cesu8(&bytes[start..end])
    {
        Ok(s) => Ok(s.into_owned()),
        Err(_) => Err(DexError::new(&format!("Invalid MUTF-8 string data at 0x{:x}", start))),
    }
}

fn read_type_list(bytes: &[u8], off: u32, tables: &Tables) -> Result<Vec<String>, DexError>
{
    if off == 0
    {
        return Ok(vec![]);
    }
    let mut ix = off as usize;
    let size = read_u4(bytes, &mut ix)?;
    let mut list = Vec::with_capacity(size as usize);
    for _ in 0..size
    {
        let type_idx = read_u2(bytes, &mut ix)? as u32;
        list.push(tables.descriptor(type_idx)?.to_string());
    }
    Ok(list)
}

fn read_tables(bytes: &[u8], header: &Header) -> Result<Tables, DexError>
{
    let mut strings = Vec::with_capacity(header.string_ids_size as usize);
    let mut ix = header.string_ids_off as usize;
    for _ in 0..header.string_ids_size
    {
        let mut data_off = read_u4(bytes, &mut ix)? as usize;
        strings.push(read_mutf8(bytes, &mut data_off)?);
    }

    let mut types = Vec::with_capacity(header.type_ids_size as usize);
    let mut ix = header.type_ids_off as usize;
    for _ in 0..header.type_ids_size
    {
        let descriptor_idx = read_u4(bytes, &mut ix)? as usize;
        let descriptor = strings
            .get(descriptor_idx)
            .ok_or_else(|| DexError::new(&format!("Type descriptor index {} out of range", descriptor_idx)))?;
        types.push(descriptor.clone());
    }

    let mut partial = Tables { strings, types, protos: vec![], fields: vec![], methods: vec![] };

    let mut ix = header.proto_ids_off as usize;
    for _ in 0..header.proto_ids_size
    {
        let _shorty_idx = read_u4(bytes, &mut ix)?;
        let return_type_idx = read_u4(bytes, &mut ix)?;
        let parameters_off = read_u4(bytes, &mut ix)?;
        let parameters = read_type_list(bytes, parameters_off, &partial)?;
        let return_type = partial.descriptor(return_type_idx)?.to_string();
        partial.protos.push(MethodProto { return_type, parameters });
    }

    let mut ix = header.field_ids_off as usize;
    for _ in 0..header.field_ids_size
    {
        let class_idx = read_u2(bytes, &mut ix)? as u32;
        let type_idx = read_u2(bytes, &mut ix)? as u32;
        let name_idx = read_u4(bytes, &mut ix)?;
        partial.fields.push(FieldRef {
            class: partial.descriptor(class_idx)?.to_string(),
            descriptor: partial.descriptor(type_idx)?.to_string(),
            name: partial.string(name_idx)?,
        });
    }

    let mut ix = header.method_ids_off as usize;
    for _ in 0..header.method_ids_size
    {
        let class_idx = read_u2(bytes, &mut ix)? as u32;
        let proto_idx = read_u2(bytes, &mut ix)? as usize;
        let name_idx = read_u4(bytes, &mut ix)?;
        let proto = partial
            .protos
            .get(proto_idx)
            .cloned()
            .ok_or_else(|| DexError::new(&format!("Proto index {} out of range", proto_idx)))?;
        partial.methods.push(MethodRef {
            class: partial.descriptor(class_idx)?.to_string(),
            name: partial.string(name_idx)?,
            proto,
        });
    }

    Ok(partial)
}

fn read_debug_info(bytes: &[u8], off: u32, tables: &Tables) -> Result<DebugInfo, DexError>
{
    let mut ix = off as usize;
    let line_start = read_uleb128(bytes, &mut ix)?;
    let parameters_size = read_uleb128(bytes, &mut ix)?;
    let mut parameter_names = Vec::with_capacity(parameters_size as usize);
    for _ in 0..parameters_size
    {
        let idx = read_uleb128p1(bytes, &mut ix)?;
        parameter_names.push(if idx < 0 { None } else { Some(tables.string(idx as u32)?) });
    }

    let mut bytecode = vec![];
    loop
    {
        let op = read_u1(bytes, &mut ix)?;
        match op
        {
            0x00 => break, // DBG_END_SEQUENCE
            0x01 => bytecode.push(DebugOp::AdvancePc(read_uleb128(bytes, &mut ix)?)),
            0x02 => bytecode.push(DebugOp::AdvanceLine(read_sleb128(bytes, &mut ix)?)),
            0x03 | 0x04 =>
            {
                let register = read_uleb128(bytes, &mut ix)?;
                let name_idx = read_uleb128p1(bytes, &mut ix)?;
                let type_idx = read_uleb128p1(bytes, &mut ix)?;
                let name = if name_idx < 0 { None } else { Some(tables.string(name_idx as u32)?) };
                let descriptor =
                    if type_idx < 0 { None } else { Some(tables.descriptor(type_idx as u32)?.to_string()) };
                if op == 0x03
                {
                    bytecode.push(DebugOp::StartLocal { register, name, descriptor });
                }
                else
                {
                    let sig_idx = read_uleb128p1(bytes, &mut ix)?;
                    let signature =
                        if sig_idx < 0 { None } else { Some(tables.string(sig_idx as u32)?) };
                    bytecode.push(DebugOp::StartLocalExtended { register, name, descriptor, signature });
                }
            }
            0x05 => bytecode.push(DebugOp::EndLocal(read_uleb128(bytes, &mut ix)?)),
            0x06 => bytecode.push(DebugOp::RestartLocal(read_uleb128(bytes, &mut ix)?)),
            0x07 => bytecode.push(DebugOp::SetPrologueEnd),
            0x08 => bytecode.push(DebugOp::SetEpilogueBegin),
            0x09 =>
            {
                let name_idx = read_uleb128p1(bytes, &mut ix)?;
                let name = if name_idx < 0 { None } else { Some(tables.string(name_idx as u32)?) };
                bytecode.push(DebugOp::SetFile(name));
            }
            special => bytecode.push(DebugOp::Special(special)),
        }
    }

    Ok(DebugInfo { line_start, parameter_names, bytecode })
}

fn read_code_item(bytes: &[u8], off: u32, tables: &Tables) -> Result<MethodBody, DexError>
{
    let mut ix = off as usize;
    let registers = read_u2(bytes, &mut ix)?;
    let ins = read_u2(bytes, &mut ix)?;
    let outs = read_u2(bytes, &mut ix)?;
    let tries_size = read_u2(bytes, &mut ix)?;
    let debug_info_off = read_u4(bytes, &mut ix)?;
    let insns_size = read_u4(bytes, &mut ix)?;

    let mut units = Vec::with_capacity(insns_size as usize);
    for _ in 0..insns_size
    {
        units.push(read_u2(bytes, &mut ix)?);
    }

    let instructions = insns::decode(&units, |kind, idx| match kind
    {
        RefKind::String => Ok(InsnRef::String(tables.string(idx)?)),
        RefKind::Type => Ok(InsnRef::Type(tables.descriptor(idx)?.to_string())),
        RefKind::Field => Ok(InsnRef::Field(tables.field(idx)?)),
        RefKind::Method => Ok(InsnRef::Method(tables.method(idx)?)),
        RefKind::None => Ok(InsnRef::None),
    })?;

    let mut tries = vec![];
    if tries_size > 0
    {
        if insns_size % 2 != 0
        {
            let _padding = read_u2(bytes, &mut ix)?;
        }

        let mut raw_tries = Vec::with_capacity(tries_size as usize);
        for _ in 0..tries_size
        {
            let start_addr = read_u4(bytes, &mut ix)?;
            let insn_count = read_u2(bytes, &mut ix)?;
            let handler_off = read_u2(bytes, &mut ix)?;
            raw_tries.push((start_addr, insn_count, handler_off));
        }

        // encoded_catch_handler_list; handler_off values are relative to its start
        let handlers_base = ix;
        let _handlers_size = read_uleb128(bytes, &mut ix)?;

        for (start_addr, insn_count, handler_off) in raw_tries
        {
            let mut hix = handlers_base + handler_off as usize;
            let size = read_sleb128(bytes, &mut hix)?;
            let count = size.unsigned_abs() as usize;
            let mut catches = Vec::with_capacity(count);
            for _ in 0..count
            {
                let type_idx = read_uleb128(bytes, &mut hix)?;
                let addr = read_uleb128(bytes, &mut hix)?;
                catches.push(CatchPair { exception: tables.descriptor(type_idx)?.to_string(), addr });
            }
            let catch_all_addr = if size <= 0 { Some(read_uleb128(bytes, &mut hix)?) } else { None };
            tries.push(TryBlock { start_addr, insn_count, catches, catch_all_addr });
        }
    }

    let debug_info =
        if debug_info_off != 0 { Some(read_debug_info(bytes, debug_info_off, tables)?) } else { None };

    Ok(MethodBody { registers, ins, outs, instructions, tries, debug_info })
}

fn read_annotation_item(bytes: &[u8], off: u32, tables: &Tables) -> Result<Annotation, DexError>
{
    let mut ix = off as usize;
    let visibility = match read_u1(bytes, &mut ix)?
    {
        0x00 => AnnotationVisibility::Build,
        0x01 => AnnotationVisibility::Runtime,
        0x02 => AnnotationVisibility::System,
        v => return Err(DexError::new(&format!("Unknown annotation visibility 0x{:02x}", v))),
    };
    let body = read_annotation_body(bytes, &mut ix, tables)?;
    Ok(Annotation { visibility, body })
}

fn read_annotation_set(bytes: &[u8], off: u32, tables: &Tables) -> Result<Vec<Annotation>, DexError>
{
    if off == 0
    {
        return Ok(vec![]);
    }
    let mut ix = off as usize;
    let size = read_u4(bytes, &mut ix)?;
    let mut annotations = Vec::with_capacity(size as usize);
    for _ in 0..size
    {
        let item_off = read_u4(bytes, &mut ix)?;
        annotations.push(read_annotation_item(bytes, item_off, tables)?);
    }
    Ok(annotations)
}

struct AnnotationsDirectory
{
    class_annotations: Vec<Annotation>,
    field_annotations: Vec<(u32, Vec<Annotation>)>,
    method_annotations: Vec<(u32, Vec<Annotation>)>,
    parameter_annotations: Vec<(u32, Vec<Vec<Annotation>>)>,
}

fn read_annotations_directory(
    bytes: &[u8],
    off: u32,
    tables: &Tables,
) -> Result<AnnotationsDirectory, DexError>
{
    let mut ix = off as usize;
    let class_annotations_off = read_u4(bytes, &mut ix)?;
    let fields_size = read_u4(bytes, &mut ix)?;
    let methods_size = read_u4(bytes, &mut ix)?;
    let parameters_size = read_u4(bytes, &mut ix)?;

    let class_annotations = read_annotation_set(bytes, class_annotations_off, tables)?;

    let mut field_annotations = vec![];
    for _ in 0..fields_size
    {
        let field_idx = read_u4(bytes, &mut ix)?;
        let set_off = read_u4(bytes, &mut ix)?;
        field_annotations.push((field_idx, read_annotation_set(bytes, set_off, tables)?));
    }

    let mut method_annotations = vec![];
    for _ in 0..methods_size
    {
        let method_idx = read_u4(bytes, &mut ix)?;
        let set_off = read_u4(bytes, &mut ix)?;
        method_annotations.push((method_idx, read_annotation_set(bytes, set_off, tables)?));
    }

    let mut parameter_annotations = vec![];
    for _ in 0..parameters_size
    {
        let method_idx = read_u4(bytes, &mut ix)?;
        let ref_list_off = read_u4(bytes, &mut ix)? as usize;
        let mut rix = ref_list_off;
        let size = read_u4(bytes, &mut rix)?;
        let mut sets = Vec::with_capacity(size as usize);
        for _ in 0..size
        {
            let set_off = read_u4(bytes, &mut rix)?;
            sets.push(read_annotation_set(bytes, set_off, tables)?);
        }
        parameter_annotations.push((method_idx, sets));
    }

    Ok(AnnotationsDirectory {
        class_annotations,
        field_annotations,
        method_annotations,
        parameter_annotations,
    })
}

/// Direct methods come first in class_data, so a single position indexes the
/// concatenation of both lists.
fn method_slot(class: &mut ClassDef, pos: usize) -> &mut MethodDef
{
    let direct_count = class.direct_methods.len();
    if pos < direct_count
    {
        &mut class.direct_methods[pos]
    }
    else
    {
        &mut class.virtual_methods[pos - direct_count]
    }
}

fn read_class_def(bytes: &[u8], ix: &mut usize, tables: &Tables) -> Result<ClassDef, DexError>
{
    let class_idx = read_u4(bytes, ix)?;
    let access_flags = read_u4(bytes, ix)?;
    let superclass_idx = read_u4(bytes, ix)?;
    let interfaces_off = read_u4(bytes, ix)?;
    let source_file_idx = read_u4(bytes, ix)?;
    let annotations_off = read_u4(bytes, ix)?;
    let class_data_off = read_u4(bytes, ix)?;
    let static_values_off = read_u4(bytes, ix)?;

    let descriptor = tables.descriptor(class_idx)?.to_string();
    let superclass = if superclass_idx == NO_INDEX
    {
        None
    }
    else
    {
        Some(tables.descriptor(superclass_idx)?.to_string())
    };
    let interfaces = read_type_list(bytes, interfaces_off, tables)?;
    let source_file =
        if source_file_idx == NO_INDEX { None } else { Some(tables.string(source_file_idx)?) };

    let mut class = ClassDef {
        descriptor,
        access_flags: AccessFlags::from_bits_retain(access_flags),
        superclass,
        interfaces,
        source_file,
        annotations: vec![],
        static_fields: vec![],
        instance_fields: vec![],
        direct_methods: vec![],
        virtual_methods: vec![],
    };

    // Id-table positions of this class's members, for annotation attachment
    let mut field_positions: Vec<u32> = vec![];
    let mut method_positions: Vec<u32> = vec![];

    if class_data_off != 0
    {
        let mut cix = class_data_off as usize;
        let static_fields_size = read_uleb128(bytes, &mut cix)?;
        let instance_fields_size = read_uleb128(bytes, &mut cix)?;
        let direct_methods_size = read_uleb128(bytes, &mut cix)?;
        let virtual_methods_size = read_uleb128(bytes, &mut cix)?;

        let mut read_fields = |cix: &mut usize, count: u32, out: &mut Vec<FieldDef>, positions: &mut Vec<u32>| -> Result<(), DexError> {
            let mut field_idx = 0u32;
            for i in 0..count
            {
                let diff = read_uleb128(bytes, cix)?;
                field_idx = if i == 0 { diff } else { field_idx + diff };
                let access = read_uleb128(bytes, cix)?;
                let fr = tables.field(field_idx)?;
                positions.push(field_idx);
                out.push(FieldDef {
                    name: fr.name,
                    descriptor: fr.descriptor,
                    access_flags: AccessFlags::from_bits_retain(access),
                    initial_value: None,
                    annotations: vec![],
                });
            }
            Ok(())
        };

        read_fields(&mut cix, static_fields_size, &mut class.static_fields, &mut field_positions)?;
        read_fields(&mut cix, instance_fields_size, &mut class.instance_fields, &mut field_positions)?;

        let mut read_methods = |cix: &mut usize, count: u32, out: &mut Vec<MethodDef>, positions: &mut Vec<u32>| -> Result<(), DexError> {
            let mut method_idx = 0u32;
            for i in 0..count
            {
                let diff = read_uleb128(bytes, cix)?;
                method_idx = if i == 0 { diff } else { method_idx + diff };
                let access = read_uleb128(bytes, cix)?;
                let code_off = read_uleb128(bytes, cix)?;
                let mr = tables.method(method_idx)?;
                let body = if code_off != 0 { Some(read_code_item(bytes, code_off, tables)?) } else { None };
                positions.push(method_idx);
                out.push(MethodDef {
                    name: mr.name,
                    proto: mr.proto,
                    access_flags: AccessFlags::from_bits_retain(access),
                    body,
                    annotations: vec![],
                    parameter_annotations: vec![],
                });
            }
            Ok(())
        };

        read_methods(&mut cix, direct_methods_size, &mut class.direct_methods, &mut method_positions)?;
        read_methods(&mut cix, virtual_methods_size, &mut class.virtual_methods, &mut method_positions)?;
    }

    if static_values_off != 0
    {
        let mut six = static_values_off as usize;
        let values = read_array(bytes, &mut six, tables)?;
        for (field, value) in class.static_fields.iter_mut().zip(values)
        {
            field.initial_value = Some(value);
        }
    }

    if annotations_off != 0
    {
        let dir = read_annotations_directory(bytes, annotations_off, tables)?;
        class.annotations = dir.class_annotations;

        let static_count = class.static_fields.len();
        for (field_idx, annotations) in dir.field_annotations
        {
            if let Some(pos) = field_positions.iter().position(|&p| p == field_idx)
            {
                let field = if pos < static_count
                {
                    &mut class.static_fields[pos]
                }
                else
                {
                    &mut class.instance_fields[pos - static_count]
                };
                field.annotations = annotations;
            }
        }

        for (method_idx, annotations) in dir.method_annotations
        {
            if let Some(pos) = method_positions.iter().position(|&p| p == method_idx)
            {
                method_slot(&mut class, pos).annotations = annotations;
            }
        }
        for (method_idx, sets) in dir.parameter_annotations
        {
            if let Some(pos) = method_positions.iter().position(|&p| p == method_idx)
            {
                method_slot(&mut class, pos).parameter_annotations = sets;
            }
        }
    }

    Ok(class)
}

pub(crate) fn read_pool(bytes: &[u8]) -> Result<DexPool, DexError>
{
    let header = read_header(bytes)?;

    let computed = adler32_slice(&bytes[12..]);
    if computed != header.checksum
    {
        warn!(
            "DEX checksum mismatch (header 0x{:08x}, computed 0x{:08x})",
            header.checksum, computed
        );
    }

    let tables = read_tables(bytes, &header)?;

    let mut classes = Vec::with_capacity(header.class_defs_size as usize);
    let mut ix = header.class_defs_off as usize;
    for i in 0..header.class_defs_size
    {
        let class = read_class_def(bytes, &mut ix, &tables).map_err(|e| {
            DexError::with_context(e, format!("class_def #{}", i))
        })?;
        classes.push(class);
    }

    Ok(DexPool { classes })
}
