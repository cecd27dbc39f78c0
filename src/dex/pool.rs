/* In-memory DEX class pool, fully symbolic.
 *
 * Everything index-based in the container format (string/type/proto/field/method
 * ids) is resolved to owned strings and structured references here, so classes can
 * be added, patched and merged freely. The writer rebuilds all constant pools and
 * offsets from scratch.
 */

use bitflags::bitflags;

use crate::dex::error::DexError;
use crate::dex::{reader, writer};

pub const DEX_FILE_MAGIC: [u8; 8] = [0x64, 0x65, 0x78, 0x0a, 0x30, 0x33, 0x39, 0x00];
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const NO_INDEX: u32 = 0xffffffff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

/// A method prototype held as type descriptors rather than proto_id indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodProto
{
    pub return_type: String,
    pub parameters: Vec<String>,
}

impl MethodProto
{
    pub fn new(return_type: &str, parameters: &[&str]) -> Self
    {
        MethodProto {
            return_type: return_type.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Parses a method descriptor such as `(Ljava/lang/String;I)V`.
    pub fn from_descriptor(descriptor: &str) -> Result<MethodProto, DexError>
    {
        let inner = descriptor
            .strip_prefix('(')
            .and_then(|rest| rest.split_once(')'))
            .ok_or_else(|| DexError::new(&format!("Malformed method descriptor '{}'", descriptor)))?;
        let (params, return_type) = inner;
        if return_type.is_empty()
        {
            fail!("Method descriptor '{}' has no return type", descriptor);
        }

        let mut parameters = vec![];
        let mut remaining = params;
        while !remaining.is_empty()
        {
            let param = take_type_descriptor(remaining)
                .ok_or_else(|| DexError::new(&format!("Malformed parameter list in '{}'", descriptor)))?;
            remaining = &remaining[param.len()..];
            parameters.push(param.to_string());
        }

        Ok(MethodProto { return_type: return_type.to_string(), parameters })
    }

    pub fn descriptor(&self) -> String
    {
        let mut s = String::from("(");
        for p in &self.parameters
        {
            s.push_str(p);
        }
        s.push(')');
        s.push_str(&self.return_type);
        s
    }

    /// The shorty form: return then parameters, one character each, with all
    /// reference types collapsed to `L`.
    pub fn shorty(&self) -> String
    {
        let mut s = String::new();
        s.push(shorty_char(&self.return_type));
        for p in &self.parameters
        {
            s.push(shorty_char(p));
        }
        s
    }
}

fn shorty_char(descriptor: &str) -> char
{
    match descriptor.chars().next()
    {
        Some('[') | Some('L') => 'L',
        Some(c) => c,
        None => 'V',
    }
}

/// Splits the leading type descriptor off `s`, or None if it is malformed.
fn take_type_descriptor(s: &str) -> Option<&str>
{
    let mut chars = s.char_indices();
    loop
    {
        let (ix, c) = chars.next()?;
        match c
        {
            '[' => continue,
            'L' =>
            {
                let end = s[ix..].find(';')?;
                return Some(&s[..ix + end + 1]);
            }
            'Z' | 'B' | 'S' | 'C' | 'I' | 'J' | 'F' | 'D' | 'V' => return Some(&s[..ix + 1]),
            _ => return None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef
{
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl FieldRef
{
    pub fn new(class: &str, name: &str, descriptor: &str) -> Self
    {
        FieldRef {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRef
{
    pub class: String,
    pub name: String,
    pub proto: MethodProto,
}

impl MethodRef
{
    pub fn new(class: &str, name: &str, proto: MethodProto) -> Self
    {
        MethodRef { class: class.to_string(), name: name.to_string(), proto }
    }
}

/// The symbolic reference carried by an instruction, if any.
#[derive(Debug, Clone, PartialEq)]
pub enum InsnRef
{
    None,
    String(String),
    Type(String),
    Field(FieldRef),
    Method(MethodRef),
}

/// One decoded Dalvik instruction. `units` holds the raw code units with any
/// pool-index slot zeroed out; the writer splices the rebuilt index back in.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction
{
    pub units: Vec<u16>,
    pub reference: InsnRef,
}

impl Instruction
{
    pub fn from_units(units: Vec<u16>) -> Self
    {
        Instruction { units, reference: InsnRef::None }
    }

    pub fn opcode(&self) -> u8
    {
        (self.units[0] & 0xff) as u8
    }

    /// Width in 16-bit code units.
    pub fn width(&self) -> usize
    {
        self.units.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchPair
{
    pub exception: String,
    pub addr: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TryBlock
{
    pub start_addr: u32,
    pub insn_count: u16,
    pub catches: Vec<CatchPair>,
    pub catch_all_addr: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebugOp
{
    AdvancePc(u32),
    AdvanceLine(i32),
    StartLocal
    {
        register: u32,
        name: Option<String>,
        descriptor: Option<String>,
    },
    StartLocalExtended
    {
        register: u32,
        name: Option<String>,
        descriptor: Option<String>,
        signature: Option<String>,
    },
    EndLocal(u32),
    RestartLocal(u32),
    SetPrologueEnd,
    SetEpilogueBegin,
    SetFile(Option<String>),
    /// Opcodes 0x0a..=0xff advance both line and pc by a packed amount.
    Special(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugInfo
{
    pub line_start: u32,
    pub parameter_names: Vec<Option<String>>,
    pub bytecode: Vec<DebugOp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody
{
    pub registers: u16,
    pub ins: u16,
    pub outs: u16,
    pub instructions: Vec<Instruction>,
    pub tries: Vec<TryBlock>,
    pub debug_info: Option<DebugInfo>,
}

/// An encoded_value, symbolic where the format stores a pool index.
#[derive(Debug, Clone, PartialEq)]
pub enum Value
{
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Type(String),
    Field(FieldRef),
    Method(MethodRef),
    Enum(FieldRef),
    Array(Vec<Value>),
    Annotation(AnnotationBody),
    Null,
    Boolean(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationVisibility
{
    Build,
    Runtime,
    System,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationBody
{
    pub type_descriptor: String,
    pub elements: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation
{
    pub visibility: AnnotationVisibility,
    pub body: AnnotationBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef
{
    pub name: String,
    pub descriptor: String,
    pub access_flags: AccessFlags,
    pub initial_value: Option<Value>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef
{
    pub name: String,
    pub proto: MethodProto,
    pub access_flags: AccessFlags,
    pub body: Option<MethodBody>,
    pub annotations: Vec<Annotation>,
    pub parameter_annotations: Vec<Vec<Annotation>>,
}

impl MethodDef
{
    pub fn reference(&self, class: &str) -> MethodRef
    {
        MethodRef::new(class, &self.name, self.proto.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef
{
    pub descriptor: String,
    pub access_flags: AccessFlags,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub annotations: Vec<Annotation>,
    pub static_fields: Vec<FieldDef>,
    pub instance_fields: Vec<FieldDef>,
    pub direct_methods: Vec<MethodDef>,
    pub virtual_methods: Vec<MethodDef>,
}

impl ClassDef
{
    pub fn new(descriptor: &str, access_flags: AccessFlags, superclass: &str) -> Self
    {
        ClassDef {
            descriptor: descriptor.to_string(),
            access_flags,
            superclass: Some(superclass.to_string()),
            interfaces: vec![],
            source_file: None,
            annotations: vec![],
            static_fields: vec![],
            instance_fields: vec![],
            direct_methods: vec![],
            virtual_methods: vec![],
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDef>
    {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    pub fn methods_mut(&mut self) -> impl Iterator<Item = &mut MethodDef>
    {
        self.direct_methods.iter_mut().chain(self.virtual_methods.iter_mut())
    }
}

/// A pool of classes decoded from (or destined for) one `classes.dex`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DexPool
{
    pub classes: Vec<ClassDef>,
}

impl DexPool
{
    pub fn new() -> Self
    {
        DexPool { classes: vec![] }
    }

    pub fn parse(bytes: &[u8]) -> Result<DexPool, DexError>
    {
        reader::read_pool(bytes)
    }

    pub fn build(&self) -> Result<Vec<u8>, DexError>
    {
        writer::write_pool(self)
    }

    pub fn class(&self, descriptor: &str) -> Option<&ClassDef>
    {
        self.classes.iter().find(|c| c.descriptor == descriptor)
    }

    pub fn class_mut(&mut self, descriptor: &str) -> Option<&mut ClassDef>
    {
        self.classes.iter_mut().find(|c| c.descriptor == descriptor)
    }
}
