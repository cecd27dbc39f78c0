/* DEX container writer.
 *
 * Rebuilds every id table from the symbolic pool, emits sections in a fixed
 * order, then patches the header and seals the file with the SHA-1 signature
 * and adler32 checksum. Table ordering follows the format rules: strings by
 * UTF-16 code unit order (CESU-8 byte order), types by descriptor, protos by
 * return type then parameters, fields and methods by class/name/type, and
 * class_defs with superclasses and interfaces first.
 */

use std::collections::{BTreeSet, HashMap, HashSet};

use adler::adler32_slice;
use cesu8::to_java_cesu8;
use sha1::{Digest, Sha1};

use crate::dex::encoded::{write_array, write_annotation_body, PoolIndexer};
use crate::dex::error::DexError;
use crate::dex::insns;
use crate::dex::pool::*;
use crate::dex::{align_to, write_u1, write_u2, write_u4, write_uleb128, write_uleb128p1, write_sleb128};

const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_TYPE_LIST: u16 = 0x1001;
const TYPE_ANNOTATION_SET_REF_LIST: u16 = 0x1002;
const TYPE_ANNOTATION_SET_ITEM: u16 = 0x1003;
const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
const TYPE_CODE_ITEM: u16 = 0x2001;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
const TYPE_DEBUG_INFO_ITEM: u16 = 0x2003;
const TYPE_ANNOTATION_ITEM: u16 = 0x2004;
const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;
const TYPE_ANNOTATIONS_DIRECTORY_ITEM: u16 = 0x2006;

/// Rebuilt, sorted id tables with reverse lookup maps.
struct Pools
{
    strings: Vec<String>,
    types: Vec<String>,
    protos: Vec<MethodProto>,
    fields: Vec<FieldRef>,
    methods: Vec<MethodRef>,
    string_map: HashMap<String, u32>,
    type_map: HashMap<String, u32>,
    proto_map: HashMap<MethodProto, u32>,
    field_map: HashMap<FieldRef, u32>,
    method_map: HashMap<MethodRef, u32>,
}

impl PoolIndexer for Pools
{
    fn string_idx(&self, s: &str) -> Result<u32, DexError>
    {
        self.string_map
            .get(s)
            .copied()
            .ok_or_else(|| DexError::new(&format!("String '{}' missing from pool", s)))
    }

    fn type_idx(&self, descriptor: &str) -> Result<u32, DexError>
    {
        self.type_map
            .get(descriptor)
            .copied()
            .ok_or_else(|| DexError::new(&format!("Type '{}' missing from pool", descriptor)))
    }

    fn field_idx(&self, field: &FieldRef) -> Result<u32, DexError>
    {
        self.field_map
            .get(field)
            .copied()
            .ok_or_else(|| DexError::new(&format!("Field {}->{} missing from pool", field.class, field.name)))
    }

    fn method_idx(&self, method: &MethodRef) -> Result<u32, DexError>
    {
        self.method_map
            .get(method)
            .copied()
            .ok_or_else(|| DexError::new(&format!("Method {}->{} missing from pool", method.class, method.name)))
    }
}

impl Pools
{
    fn proto_idx(&self, proto: &MethodProto) -> Result<u32, DexError>
    {
        self.proto_map
            .get(proto)
            .copied()
            .ok_or_else(|| DexError::new(&format!("Proto {} missing from pool", proto.descriptor())))
    }

    fn insn_idx(&self, reference: &InsnRef) -> Result<u32, DexError>
    {
        match reference
        {
            InsnRef::None => Ok(0),
            InsnRef::String(s) => self.string_idx(s),
            InsnRef::Type(t) => self.type_idx(t),
            InsnRef::Field(f) => self.field_idx(f),
            InsnRef::Method(m) => self.method_idx(m),
        }
    }
}

#[derive(Default)]
struct Collector
{
    strings: HashSet<String>,
    types: HashSet<String>,
    protos: HashSet<MethodProto>,
    fields: BTreeSet<FieldRef>,
    methods: BTreeSet<MethodRef>,
}

impl Collector
{
    fn string(&mut self, s: &str)
    {
        if !self.strings.contains(s)
        {
            self.strings.insert(s.to_string());
        }
    }

    fn type_descriptor(&mut self, t: &str)
    {
        self.string(t);
        if !self.types.contains(t)
        {
            self.types.insert(t.to_string());
        }
    }

    fn proto(&mut self, p: &MethodProto)
    {
        self.string(&p.shorty());
        self.type_descriptor(&p.return_type);
        for param in &p.parameters
        {
            self.type_descriptor(param);
        }
        if !self.protos.contains(p)
        {
            self.protos.insert(p.clone());
        }
    }

    fn field(&mut self, f: &FieldRef)
    {
        self.type_descriptor(&f.class);
        self.type_descriptor(&f.descriptor);
        self.string(&f.name);
        self.fields.insert(f.clone());
    }

    fn method(&mut self, m: &MethodRef)
    {
        self.type_descriptor(&m.class);
        self.string(&m.name);
        self.proto(&m.proto);
        self.methods.insert(m.clone());
    }

    fn value(&mut self, v: &Value)
    {
        match v
        {
            Value::String(s) => self.string(s),
            Value::Type(t) => self.type_descriptor(t),
            Value::Field(f) | Value::Enum(f) => self.field(f),
            Value::Method(m) => self.method(m),
            Value::Array(values) =>
            {
                for v in values
                {
                    self.value(v);
                }
            }
            Value::Annotation(body) => self.annotation_body(body),
            _ =>
            {}
        }
    }

    fn annotation_body(&mut self, body: &AnnotationBody)
    {
        self.type_descriptor(&body.type_descriptor);
        for (name, value) in &body.elements
        {
            self.string(name);
            self.value(value);
        }
    }

    fn annotations(&mut self, annotations: &[Annotation])
    {
        for a in annotations
        {
            self.annotation_body(&a.body);
        }
    }

    fn debug_info(&mut self, debug: &DebugInfo)
    {
        for name in debug.parameter_names.iter().flatten()
        {
            self.string(name);
        }
        for op in &debug.bytecode
        {
            match op
            {
                DebugOp::StartLocal { name, descriptor, .. } =>
                {
                    if let Some(n) = name
                    {
                        self.string(n);
                    }
                    if let Some(d) = descriptor
                    {
                        self.type_descriptor(d);
                    }
                }
                DebugOp::StartLocalExtended { name, descriptor, signature, .. } =>
                {
                    if let Some(n) = name
                    {
                        self.string(n);
                    }
                    if let Some(d) = descriptor
                    {
                        self.type_descriptor(d);
                    }
                    if let Some(s) = signature
                    {
                        self.string(s);
                    }
                }
                DebugOp::SetFile(Some(name)) => self.string(name),
                _ =>
                {}
            }
        }
    }

    fn body(&mut self, body: &MethodBody)
    {
        for insn in &body.instructions
        {
            match &insn.reference
            {
                InsnRef::None =>
                {}
                InsnRef::String(s) => self.string(s),
                InsnRef::Type(t) => self.type_descriptor(t),
                InsnRef::Field(f) => self.field(f),
                InsnRef::Method(m) => self.method(m),
            }
        }
        for t in &body.tries
        {
            for c in &t.catches
            {
                self.type_descriptor(&c.exception);
            }
        }
        if let Some(debug) = &body.debug_info
        {
            self.debug_info(debug);
        }
    }

    fn class(&mut self, class: &ClassDef)
    {
        self.type_descriptor(&class.descriptor);
        if let Some(superclass) = &class.superclass
        {
            self.type_descriptor(superclass);
        }
        for i in &class.interfaces
        {
            self.type_descriptor(i);
        }
        if let Some(source) = &class.source_file
        {
            self.string(source);
        }
        self.annotations(&class.annotations);

        for field in class.static_fields.iter().chain(class.instance_fields.iter())
        {
            self.field(&FieldRef::new(&class.descriptor, &field.name, &field.descriptor));
            if let Some(v) = &field.initial_value
            {
                self.value(v);
            }
            self.annotations(&field.annotations);
        }
        for method in class.methods()
        {
            self.method(&method.reference(&class.descriptor));
            self.annotations(&method.annotations);
            for set in &method.parameter_annotations
            {
                self.annotations(set);
            }
            if let Some(body) = &method.body
            {
                self.body(body);
            }
        }
    }
}

fn build_pools(pool: &DexPool) -> Pools
{
    let mut col = Collector::default();
    for class in &pool.classes
    {
        col.class(class);
    }

    let mut strings: Vec<String> = col.strings.into_iter().collect();
    strings.sort_by(|a, b| to_java_cesu8(a).cmp(&to_java_cesu8(b)));
    let string_map: HashMap<String, u32> =
        strings.iter().enumerate().map(|(i, s)| (s.clone(), i as u32)).collect();

    let mut types: Vec<String> = col.types.into_iter().collect();
    types.sort_by_key(|t| string_map[t]);
    let type_map: HashMap<String, u32> =
        types.iter().enumerate().map(|(i, t)| (t.clone(), i as u32)).collect();

    let mut protos: Vec<MethodProto> = col.protos.into_iter().collect();
    protos.sort_by_key(|p| {
        let params: Vec<u32> = p.parameters.iter().map(|t| type_map[t]).collect();
        (type_map[&p.return_type], params)
    });
    let proto_map: HashMap<MethodProto, u32> =
        protos.iter().enumerate().map(|(i, p)| (p.clone(), i as u32)).collect();

    let mut fields: Vec<FieldRef> = col.fields.into_iter().collect();
    fields.sort_by_key(|f| (type_map[&f.class], string_map[&f.name], type_map[&f.descriptor]));
    let field_map: HashMap<FieldRef, u32> =
        fields.iter().enumerate().map(|(i, f)| (f.clone(), i as u32)).collect();

    let mut methods: Vec<MethodRef> = col.methods.into_iter().collect();
    methods.sort_by_key(|m| (type_map[&m.class], string_map[&m.name], proto_map[&m.proto]));
    let method_map: HashMap<MethodRef, u32> =
        methods.iter().enumerate().map(|(i, m)| (m.clone(), i as u32)).collect();

    Pools { strings, types, protos, fields, methods, string_map, type_map, proto_map, field_map, method_map }
}

/// Orders class_defs so that superclasses and implemented interfaces defined in
/// this pool always precede their subclasses.
fn sort_classes(classes: &[ClassDef]) -> Result<Vec<&ClassDef>, DexError>
{
    let mut defined: HashSet<&str> = HashSet::new();
    for class in classes
    {
        if !defined.insert(class.descriptor.as_str())
        {
            fail!("Duplicate class definition {}", class.descriptor);
        }
    }

    let mut emitted: HashSet<&str> = HashSet::new();
    let mut out: Vec<&ClassDef> = vec![];
    let mut remaining: Vec<&ClassDef> = classes.iter().collect();

    while !remaining.is_empty()
    {
        let before = out.len();
        remaining.retain(|class| {
            let ready_super = class
                .superclass
                .as_ref()
                .map_or(true, |s| !defined.contains(s.as_str()) || emitted.contains(s.as_str()));
            let ready_ifaces = class
                .interfaces
                .iter()
                .all(|i| !defined.contains(i.as_str()) || emitted.contains(i.as_str()));
            if ready_super && ready_ifaces
            {
                emitted.insert(class.descriptor.as_str());
                out.push(class);
                false
            }
            else
            {
                true
            }
        });
        if out.len() == before
        {
            fail!("Class hierarchy contains a cycle involving {}", remaining[0].descriptor);
        }
    }

    Ok(out)
}

fn patch_u4(buf: &mut [u8], pos: usize, val: u32)
{
    buf[pos..pos + 4].copy_from_slice(&val.to_le_bytes());
}

/// One class's member lists in canonical class_data order (ascending id).
struct ClassLayout<'a>
{
    class: &'a ClassDef,
    static_fields: Vec<(u32, &'a FieldDef)>,
    instance_fields: Vec<(u32, &'a FieldDef)>,
    direct_methods: Vec<(u32, &'a MethodDef)>,
    virtual_methods: Vec<(u32, &'a MethodDef)>,
}

impl<'a> ClassLayout<'a>
{
    fn build(class: &'a ClassDef, pools: &Pools) -> Result<ClassLayout<'a>, DexError>
    {
        let field_entry = |f: &'a FieldDef| -> Result<(u32, &'a FieldDef), DexError> {
            let idx = pools.field_idx(&FieldRef::new(&class.descriptor, &f.name, &f.descriptor))?;
            Ok((idx, f))
        };
        let method_entry = |m: &'a MethodDef| -> Result<(u32, &'a MethodDef), DexError> {
            let idx = pools.method_idx(&m.reference(&class.descriptor))?;
            Ok((idx, m))
        };

        let mut static_fields: Vec<_> =
            class.static_fields.iter().map(field_entry).collect::<Result<_, _>>()?;
        let mut instance_fields: Vec<_> =
            class.instance_fields.iter().map(field_entry).collect::<Result<_, _>>()?;
        let mut direct_methods: Vec<_> =
            class.direct_methods.iter().map(method_entry).collect::<Result<_, _>>()?;
        let mut virtual_methods: Vec<_> =
            class.virtual_methods.iter().map(method_entry).collect::<Result<_, _>>()?;

        static_fields.sort_by_key(|(idx, _)| *idx);
        instance_fields.sort_by_key(|(idx, _)| *idx);
        direct_methods.sort_by_key(|(idx, _)| *idx);
        virtual_methods.sort_by_key(|(idx, _)| *idx);

        Ok(ClassLayout { class, static_fields, instance_fields, direct_methods, virtual_methods })
    }

    fn methods(&self) -> impl Iterator<Item = &(u32, &'a MethodDef)>
    {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    fn has_annotations(&self) -> bool
    {
        !self.class.annotations.is_empty()
            || self
                .static_fields
                .iter()
                .chain(self.instance_fields.iter())
                .any(|(_, f)| !f.annotations.is_empty())
            || self.methods().any(|(_, m)| {
                !m.annotations.is_empty() || m.parameter_annotations.iter().any(|s| !s.is_empty())
            })
    }
}

fn default_value(descriptor: &str) -> Value
{
    match descriptor.chars().next()
    {
        Some('Z') => Value::Boolean(false),
        Some('B') => Value::Byte(0),
        Some('S') => Value::Short(0),
        Some('C') => Value::Char(0),
        Some('I') => Value::Int(0),
        Some('J') => Value::Long(0),
        Some('F') => Value::Float(0.0),
        Some('D') => Value::Double(0.0),
        _ => Value::Null,
    }
}

/// Static values array: canonical field order, defaults filling the gaps,
/// trailing defaults trimmed.
fn static_values(layout: &ClassLayout) -> Vec<Value>
{
    let mut values: Vec<Value> = layout
        .static_fields
        .iter()
        .map(|(_, f)| f.initial_value.clone().unwrap_or_else(|| default_value(&f.descriptor)))
        .collect();
    while let Some(last) = values.last()
    {
        let (_, field) = layout.static_fields[values.len() - 1];
        if *last == default_value(&field.descriptor)
        {
            values.pop();
        }
        else
        {
            break;
        }
    }
    values
}

fn write_debug_info(buf: &mut Vec<u8>, debug: &DebugInfo, pools: &Pools) -> Result<(), DexError>
{
    write_uleb128(buf, debug.line_start);
    write_uleb128(buf, debug.parameter_names.len() as u32);
    for name in &debug.parameter_names
    {
        match name
        {
            Some(n) => write_uleb128p1(buf, pools.string_idx(n)? as i32),
            None => write_uleb128p1(buf, -1),
        }
    }
    for op in &debug.bytecode
    {
        match op
        {
            DebugOp::AdvancePc(diff) =>
            {
                write_u1(buf, 0x01);
                write_uleb128(buf, *diff);
            }
            DebugOp::AdvanceLine(diff) =>
            {
                write_u1(buf, 0x02);
                write_sleb128(buf, *diff);
            }
            DebugOp::StartLocal { register, name, descriptor } =>
            {
                write_u1(buf, 0x03);
                write_uleb128(buf, *register);
                write_opt_string(buf, name, pools)?;
                write_opt_type(buf, descriptor, pools)?;
            }
            DebugOp::StartLocalExtended { register, name, descriptor, signature } =>
            {
                write_u1(buf, 0x04);
                write_uleb128(buf, *register);
                write_opt_string(buf, name, pools)?;
                write_opt_type(buf, descriptor, pools)?;
                write_opt_string(buf, signature, pools)?;
            }
            DebugOp::EndLocal(register) =>
            {
                write_u1(buf, 0x05);
                write_uleb128(buf, *register);
            }
            DebugOp::RestartLocal(register) =>
            {
                write_u1(buf, 0x06);
                write_uleb128(buf, *register);
            }
            DebugOp::SetPrologueEnd => write_u1(buf, 0x07),
            DebugOp::SetEpilogueBegin => write_u1(buf, 0x08),
            DebugOp::SetFile(name) =>
            {
                write_u1(buf, 0x09);
                write_opt_string(buf, name, pools)?;
            }
            DebugOp::Special(op) => write_u1(buf, *op),
        }
    }
    write_u1(buf, 0x00); // DBG_END_SEQUENCE
    Ok(())
}

fn write_opt_string(buf: &mut Vec<u8>, s: &Option<String>, pools: &Pools) -> Result<(), DexError>
{
    match s
    {
        Some(s) => write_uleb128p1(buf, pools.string_idx(s)? as i32),
        None => write_uleb128p1(buf, -1),
    }
    Ok(())
}

fn write_opt_type(buf: &mut Vec<u8>, t: &Option<String>, pools: &Pools) -> Result<(), DexError>
{
    match t
    {
        Some(t) => write_uleb128p1(buf, pools.type_idx(t)? as i32),
        None => write_uleb128p1(buf, -1),
    }
    Ok(())
}

fn write_code_item(
    buf: &mut Vec<u8>,
    body: &MethodBody,
    debug_info_off: u32,
    pools: &Pools,
) -> Result<(), DexError>
{
    write_u2(buf, body.registers);
    write_u2(buf, body.ins);
    write_u2(buf, body.outs);
    write_u2(buf, body.tries.len() as u16);
    write_u4(buf, debug_info_off);

    let units = insns::encode(&body.instructions, |r| pools.insn_idx(r))?;
    write_u4(buf, units.len() as u32);
    for unit in &units
    {
        write_u2(buf, *unit);
    }

    if !body.tries.is_empty()
    {
        if units.len() % 2 != 0
        {
            write_u2(buf, 0);
        }

        // Serialize each distinct handler once; tries point into the list by
        // byte offset from its start.
        let mut handler_blobs: Vec<Vec<u8>> = vec![];
        let mut try_handler: Vec<usize> = vec![];
        for t in &body.tries
        {
            let mut blob = vec![];
            let size: i32 = if t.catch_all_addr.is_some()
            {
                -(t.catches.len() as i32)
            }
            else
            {
                t.catches.len() as i32
            };
            write_sleb128(&mut blob, size);
            for c in &t.catches
            {
                write_uleb128(&mut blob, pools.type_idx(&c.exception)?);
                write_uleb128(&mut blob, c.addr);
            }
            if let Some(addr) = t.catch_all_addr
            {
                write_uleb128(&mut blob, addr);
            }

            let pos = match handler_blobs.iter().position(|b| *b == blob)
            {
                Some(p) => p,
                None =>
                {
                    handler_blobs.push(blob);
                    handler_blobs.len() - 1
                }
            };
            try_handler.push(pos);
        }

        let mut size_prefix = vec![];
        write_uleb128(&mut size_prefix, handler_blobs.len() as u32);
        let mut blob_offsets = Vec::with_capacity(handler_blobs.len());
        let mut cursor = size_prefix.len();
        for blob in &handler_blobs
        {
            blob_offsets.push(cursor as u16);
            cursor += blob.len();
        }

        for (t, handler) in body.tries.iter().zip(&try_handler)
        {
            write_u4(buf, t.start_addr);
            write_u2(buf, t.insn_count);
            write_u2(buf, blob_offsets[*handler]);
        }
        buf.extend_from_slice(&size_prefix);
        for blob in &handler_blobs
        {
            buf.extend_from_slice(blob);
        }
    }

    Ok(())
}

struct MapBuilder
{
    entries: Vec<(u16, u32, u32)>,
}

impl MapBuilder
{
    fn add(&mut self, item_type: u16, count: usize, offset: u32)
    {
        if count > 0
        {
            self.entries.push((item_type, count as u32, offset));
        }
    }
}

pub(crate) fn write_pool(pool: &DexPool) -> Result<Vec<u8>, DexError>
{
    let pools = build_pools(pool);
    let classes = sort_classes(&pool.classes)?;
    let layouts: Vec<ClassLayout> =
        classes.iter().map(|c| ClassLayout::build(c, &pools)).collect::<Result<_, _>>()?;

    let mut buf: Vec<u8> = vec![0; 0x70];
    let mut map = MapBuilder { entries: vec![(TYPE_HEADER_ITEM, 1, 0)] };

    // --- index tables ---

    let string_ids_off = buf.len() as u32;
    let string_ids_pos = buf.len();
    buf.resize(buf.len() + pools.strings.len() * 4, 0);
    map.add(TYPE_STRING_ID_ITEM, pools.strings.len(), string_ids_off);

    let type_ids_off = buf.len() as u32;
    for t in &pools.types
    {
        write_u4(&mut buf, pools.string_map[t]);
    }
    map.add(TYPE_TYPE_ID_ITEM, pools.types.len(), type_ids_off);

    let proto_ids_off = buf.len() as u32;
    let proto_ids_pos = buf.len();
    for p in &pools.protos
    {
        write_u4(&mut buf, pools.string_map[&p.shorty()]);
        write_u4(&mut buf, pools.type_map[&p.return_type]);
        write_u4(&mut buf, 0); // parameters_off, patched below
    }
    map.add(TYPE_PROTO_ID_ITEM, pools.protos.len(), proto_ids_off);

    let field_ids_off = buf.len() as u32;
    for f in &pools.fields
    {
        write_u2(&mut buf, pools.type_map[&f.class] as u16);
        write_u2(&mut buf, pools.type_map[&f.descriptor] as u16);
        write_u4(&mut buf, pools.string_map[&f.name]);
    }
    map.add(TYPE_FIELD_ID_ITEM, pools.fields.len(), field_ids_off);

    let method_ids_off = buf.len() as u32;
    for m in &pools.methods
    {
        write_u2(&mut buf, pools.type_map[&m.class] as u16);
        write_u2(&mut buf, pools.proto_map[&m.proto] as u16);
        write_u4(&mut buf, pools.string_map[&m.name]);
    }
    map.add(TYPE_METHOD_ID_ITEM, pools.methods.len(), method_ids_off);

    let class_defs_off = buf.len() as u32;
    let class_defs_pos = buf.len();
    for layout in &layouts
    {
        let class = layout.class;
        write_u4(&mut buf, pools.type_map[&class.descriptor]);
        write_u4(&mut buf, class.access_flags.bits());
        match &class.superclass
        {
            Some(s) => write_u4(&mut buf, pools.type_map[s]),
            None => write_u4(&mut buf, NO_INDEX),
        }
        write_u4(&mut buf, 0); // interfaces_off
        match &class.source_file
        {
            Some(s) => write_u4(&mut buf, pools.string_map[s]),
            None => write_u4(&mut buf, NO_INDEX),
        }
        write_u4(&mut buf, 0); // annotations_off
        write_u4(&mut buf, 0); // class_data_off
        write_u4(&mut buf, 0); // static_values_off
    }
    map.add(TYPE_CLASS_DEF_ITEM, layouts.len(), class_defs_off);

    // --- data section ---

    align_to(&mut buf, 4);
    let data_off = buf.len() as u32;

    // type lists, deduplicated by content
    let mut type_lists: HashMap<Vec<u32>, u32> = HashMap::new();
    let mut intern_type_list = |buf: &mut Vec<u8>, descriptors: &[String]| -> Result<u32, DexError> {
        if descriptors.is_empty()
        {
            return Ok(0);
        }
        let key: Vec<u32> = descriptors.iter().map(|d| pools.type_map[d]).collect();
        if let Some(off) = type_lists.get(&key)
        {
            return Ok(*off);
        }
        align_to(buf, 4);
        let off = buf.len() as u32;
        write_u4(buf, key.len() as u32);
        for idx in &key
        {
            write_u2(buf, *idx as u16);
        }
        type_lists.insert(key, off);
        Ok(off)
    };

    let type_lists_off = buf.len() as u32;
    for (i, p) in pools.protos.iter().enumerate()
    {
        let off = intern_type_list(&mut buf, &p.parameters)?;
        patch_u4(&mut buf, proto_ids_pos + i * 12 + 8, off);
    }
    let mut interface_offs: Vec<u32> = Vec::with_capacity(layouts.len());
    for layout in &layouts
    {
        interface_offs.push(intern_type_list(&mut buf, &layout.class.interfaces)?);
    }
    map.add(TYPE_TYPE_LIST, type_lists.len(), type_lists_off);

    // annotation items, deduplicated structurally
    let mut annotation_items: Vec<(Annotation, u32)> = vec![];
    let mut write_annotation_item = |buf: &mut Vec<u8>, a: &Annotation| -> Result<u32, DexError> {
        if let Some((_, off)) = annotation_items.iter().find(|(existing, _)| existing == a)
        {
            return Ok(*off);
        }
        let off = buf.len() as u32;
        let visibility = match a.visibility
        {
            AnnotationVisibility::Build => 0x00,
            AnnotationVisibility::Runtime => 0x01,
            AnnotationVisibility::System => 0x02,
        };
        write_u1(buf, visibility);
        write_annotation_body(buf, &a.body, &pools)?;
        annotation_items.push((a.clone(), off));
        Ok(off)
    };

    let annotation_items_off = buf.len() as u32;
    let mut class_set_offs: Vec<Vec<u32>> = vec![];
    for layout in &layouts
    {
        let mut offs = vec![];
        for a in &layout.class.annotations
        {
            offs.push(write_annotation_item(&mut buf, a)?);
        }
        class_set_offs.push(offs);
    }
    let mut field_set_offs: Vec<Vec<Vec<u32>>> = vec![];
    let mut method_set_offs: Vec<Vec<Vec<u32>>> = vec![];
    let mut param_set_offs: Vec<Vec<Vec<Vec<u32>>>> = vec![];
    for layout in &layouts
    {
        let mut per_field = vec![];
        for (_, f) in layout.static_fields.iter().chain(layout.instance_fields.iter())
        {
            let mut offs = vec![];
            for a in &f.annotations
            {
                offs.push(write_annotation_item(&mut buf, a)?);
            }
            per_field.push(offs);
        }
        field_set_offs.push(per_field);

        let mut per_method = vec![];
        let mut per_param = vec![];
        for (_, m) in layout.methods()
        {
            let mut offs = vec![];
            for a in &m.annotations
            {
                offs.push(write_annotation_item(&mut buf, a)?);
            }
            per_method.push(offs);

            let mut sets = vec![];
            for set in &m.parameter_annotations
            {
                let mut set_offs = vec![];
                for a in set
                {
                    set_offs.push(write_annotation_item(&mut buf, a)?);
                }
                sets.push(set_offs);
            }
            per_param.push(sets);
        }
        method_set_offs.push(per_method);
        param_set_offs.push(per_param);
    }
    map.add(TYPE_ANNOTATION_ITEM, annotation_items.len(), annotation_items_off);

    // annotation_set_items
    let mut annotation_sets: HashMap<Vec<u32>, u32> = HashMap::new();
    let mut intern_set = |buf: &mut Vec<u8>, item_offs: &[u32]| -> u32 {
        if item_offs.is_empty()
        {
            return 0;
        }
        if let Some(off) = annotation_sets.get(item_offs)
        {
            return *off;
        }
        align_to(buf, 4);
        let off = buf.len() as u32;
        write_u4(buf, item_offs.len() as u32);
        for item in item_offs
        {
            write_u4(buf, *item);
        }
        annotation_sets.insert(item_offs.to_vec(), off);
        off
    };

    align_to(&mut buf, 4);
    let annotation_sets_off = buf.len() as u32;
    let class_ann_offs: Vec<u32> =
        class_set_offs.iter().map(|offs| intern_set(&mut buf, offs)).collect();
    let field_ann_offs: Vec<Vec<u32>> = field_set_offs
        .iter()
        .map(|per_field| per_field.iter().map(|offs| intern_set(&mut buf, offs)).collect())
        .collect();
    let method_ann_offs: Vec<Vec<u32>> = method_set_offs
        .iter()
        .map(|per_method| per_method.iter().map(|offs| intern_set(&mut buf, offs)).collect())
        .collect();
    let param_ann_set_offs: Vec<Vec<Vec<u32>>> = param_set_offs
        .iter()
        .map(|per_method| {
            per_method
                .iter()
                .map(|sets| sets.iter().map(|offs| intern_set(&mut buf, offs)).collect())
                .collect()
        })
        .collect();
    map.add(TYPE_ANNOTATION_SET_ITEM, annotation_sets.len(), annotation_sets_off);

    // annotation_set_ref_lists for parameter annotations
    align_to(&mut buf, 4);
    let ref_lists_off = buf.len() as u32;
    let mut ref_list_count = 0usize;
    let mut param_list_offs: Vec<Vec<u32>> = vec![];
    for per_method in &param_ann_set_offs
    {
        let mut offs = vec![];
        for sets in per_method
        {
            if sets.is_empty() || sets.iter().all(|&s| s == 0)
            {
                offs.push(0);
                continue;
            }
            align_to(&mut buf, 4);
            let off = buf.len() as u32;
            write_u4(&mut buf, sets.len() as u32);
            for set in sets
            {
                write_u4(&mut buf, *set);
            }
            ref_list_count += 1;
            offs.push(off);
        }
        param_list_offs.push(offs);
    }
    map.add(TYPE_ANNOTATION_SET_REF_LIST, ref_list_count, ref_lists_off);

    // annotations directories
    align_to(&mut buf, 4);
    let directories_off = buf.len() as u32;
    let mut directory_count = 0usize;
    let mut directory_offs: Vec<u32> = vec![0; layouts.len()];
    for (ci, layout) in layouts.iter().enumerate()
    {
        if !layout.has_annotations()
        {
            continue;
        }
        align_to(&mut buf, 4);
        directory_offs[ci] = buf.len() as u32;
        directory_count += 1;

        let mut fields: Vec<(u32, u32)> = vec![];
        for (fi, (idx, _)) in layout.static_fields.iter().chain(layout.instance_fields.iter()).enumerate()
        {
            let off = field_ann_offs[ci][fi];
            if off != 0
            {
                fields.push((*idx, off));
            }
        }
        let mut methods: Vec<(u32, u32)> = vec![];
        let mut parameters: Vec<(u32, u32)> = vec![];
        for (mi, (idx, _)) in layout.methods().enumerate()
        {
            let off = method_ann_offs[ci][mi];
            if off != 0
            {
                methods.push((*idx, off));
            }
            let off = param_list_offs[ci][mi];
            if off != 0
            {
                parameters.push((*idx, off));
            }
        }

        write_u4(&mut buf, class_ann_offs[ci]);
        write_u4(&mut buf, fields.len() as u32);
        write_u4(&mut buf, methods.len() as u32);
        write_u4(&mut buf, parameters.len() as u32);
        for (idx, off) in fields
        {
            write_u4(&mut buf, idx);
            write_u4(&mut buf, off);
        }
        for (idx, off) in methods
        {
            write_u4(&mut buf, idx);
            write_u4(&mut buf, off);
        }
        for (idx, off) in parameters
        {
            write_u4(&mut buf, idx);
            write_u4(&mut buf, off);
        }
    }
    map.add(TYPE_ANNOTATIONS_DIRECTORY_ITEM, directory_count, directories_off);

    // debug info items
    let debug_infos_off = buf.len() as u32;
    let mut debug_info_count = 0usize;
    let mut debug_offs: Vec<Vec<u32>> = vec![];
    for layout in &layouts
    {
        let mut offs = vec![];
        for (_, m) in layout.methods()
        {
            match m.body.as_ref().and_then(|b| b.debug_info.as_ref())
            {
                Some(debug) =>
                {
                    let off = buf.len() as u32;
                    write_debug_info(&mut buf, debug, &pools)?;
                    debug_info_count += 1;
                    offs.push(off);
                }
                None => offs.push(0),
            }
        }
        debug_offs.push(offs);
    }
    map.add(TYPE_DEBUG_INFO_ITEM, debug_info_count, debug_infos_off);

    // code items
    align_to(&mut buf, 4);
    let code_items_off = buf.len() as u32;
    let mut code_item_count = 0usize;
    let mut code_offs: Vec<Vec<u32>> = vec![];
    for (ci, layout) in layouts.iter().enumerate()
    {
        let mut offs = vec![];
        for (mi, (_, m)) in layout.methods().enumerate()
        {
            match &m.body
            {
                Some(body) =>
                {
                    align_to(&mut buf, 4);
                    let off = buf.len() as u32;
                    write_code_item(&mut buf, body, debug_offs[ci][mi], &pools).map_err(|e| {
                        DexError::with_context(e, format!("method {}->{}", layout.class.descriptor, m.name))
                    })?;
                    code_item_count += 1;
                    offs.push(off);
                }
                None => offs.push(0),
            }
        }
        code_offs.push(offs);
    }
    map.add(TYPE_CODE_ITEM, code_item_count, code_items_off);

    // class_data items
    let class_data_off = buf.len() as u32;
    let mut class_data_count = 0usize;
    let mut class_data_offs: Vec<u32> = vec![0; layouts.len()];
    for (ci, layout) in layouts.iter().enumerate()
    {
        let has_members = !(layout.static_fields.is_empty()
            && layout.instance_fields.is_empty()
            && layout.direct_methods.is_empty()
            && layout.virtual_methods.is_empty());
        if !has_members
        {
            continue;
        }
        class_data_offs[ci] = buf.len() as u32;
        class_data_count += 1;

        write_uleb128(&mut buf, layout.static_fields.len() as u32);
        write_uleb128(&mut buf, layout.instance_fields.len() as u32);
        write_uleb128(&mut buf, layout.direct_methods.len() as u32);
        write_uleb128(&mut buf, layout.virtual_methods.len() as u32);

        for list in [&layout.static_fields, &layout.instance_fields]
        {
            let mut last = 0u32;
            for (i, (idx, f)) in list.iter().enumerate()
            {
                let diff = if i == 0 { *idx } else { *idx - last };
                last = *idx;
                write_uleb128(&mut buf, diff);
                write_uleb128(&mut buf, f.access_flags.bits());
            }
        }
        for (li, list) in [&layout.direct_methods, &layout.virtual_methods].iter().enumerate()
        {
            let base = if li == 0 { 0 } else { layout.direct_methods.len() };
            let mut last = 0u32;
            for (i, (idx, m)) in list.iter().enumerate()
            {
                let diff = if i == 0 { *idx } else { *idx - last };
                last = *idx;
                write_uleb128(&mut buf, diff);
                write_uleb128(&mut buf, m.access_flags.bits());
                write_uleb128(&mut buf, code_offs[ci][base + i]);
            }
        }
    }
    map.add(TYPE_CLASS_DATA_ITEM, class_data_count, class_data_off);

    // encoded arrays (static values)
    let encoded_arrays_off = buf.len() as u32;
    let mut encoded_array_count = 0usize;
    let mut static_values_offs: Vec<u32> = vec![0; layouts.len()];
    for (ci, layout) in layouts.iter().enumerate()
    {
        let values = static_values(layout);
        if values.is_empty()
        {
            continue;
        }
        static_values_offs[ci] = buf.len() as u32;
        encoded_array_count += 1;
        write_array(&mut buf, &values, &pools)?;
    }
    map.add(TYPE_ENCODED_ARRAY_ITEM, encoded_array_count, encoded_arrays_off);

    // string data
    let string_data_off = buf.len() as u32;
    for (i, s) in pools.strings.iter().enumerate()
    {
        let off = buf.len() as u32;
        patch_u4(&mut buf, string_ids_pos + i * 4, off);
        write_uleb128(&mut buf, s.encode_utf16().count() as u32);
        buf.extend_from_slice(&to_java_cesu8(s));
        write_u1(&mut buf, 0);
    }
    map.add(TYPE_STRING_DATA_ITEM, pools.strings.len(), string_data_off);

    // patch class_def rows
    for (ci, _) in layouts.iter().enumerate()
    {
        let row = class_defs_pos + ci * 32;
        patch_u4(&mut buf, row + 12, interface_offs[ci]);
        patch_u4(&mut buf, row + 20, directory_offs[ci]);
        patch_u4(&mut buf, row + 24, class_data_offs[ci]);
        patch_u4(&mut buf, row + 28, static_values_offs[ci]);
    }

    // map list
    align_to(&mut buf, 4);
    let map_off = buf.len() as u32;
    map.add(TYPE_MAP_LIST, 1, map_off);
    write_u4(&mut buf, map.entries.len() as u32);
    for (item_type, count, offset) in &map.entries
    {
        write_u2(&mut buf, *item_type);
        write_u2(&mut buf, 0);
        write_u4(&mut buf, *count);
        write_u4(&mut buf, *offset);
    }

    // --- header ---

    let file_size = buf.len() as u32;
    buf[0..8].copy_from_slice(&DEX_FILE_MAGIC);
    patch_u4(&mut buf, 32, file_size);
    patch_u4(&mut buf, 36, 0x70);
    patch_u4(&mut buf, 40, ENDIAN_CONSTANT);
    patch_u4(&mut buf, 44, 0); // link_size
    patch_u4(&mut buf, 48, 0); // link_off
    patch_u4(&mut buf, 52, map_off);
    patch_u4(&mut buf, 56, pools.strings.len() as u32);
    patch_u4(&mut buf, 60, section_off(pools.strings.len(), string_ids_off));
    patch_u4(&mut buf, 64, pools.types.len() as u32);
    patch_u4(&mut buf, 68, section_off(pools.types.len(), type_ids_off));
    patch_u4(&mut buf, 72, pools.protos.len() as u32);
    patch_u4(&mut buf, 76, section_off(pools.protos.len(), proto_ids_off));
    patch_u4(&mut buf, 80, pools.fields.len() as u32);
    patch_u4(&mut buf, 84, section_off(pools.fields.len(), field_ids_off));
    patch_u4(&mut buf, 88, pools.methods.len() as u32);
    patch_u4(&mut buf, 92, section_off(pools.methods.len(), method_ids_off));
    patch_u4(&mut buf, 96, layouts.len() as u32);
    patch_u4(&mut buf, 100, section_off(layouts.len(), class_defs_off));
    patch_u4(&mut buf, 104, file_size - data_off);
    patch_u4(&mut buf, 108, data_off);

    let mut hasher = Sha1::new();
    hasher.update(&buf[32..]);
    let signature = hasher.finalize();
    buf[12..32].copy_from_slice(&signature);

    let checksum = adler32_slice(&buf[12..]);
    patch_u4(&mut buf, 8, checksum);

    Ok(buf)
}

fn section_off(count: usize, off: u32) -> u32
{
    if count == 0
    {
        0
    }
    else
    {
        off
    }
}
