//! PDB provider, reading MSF 7.00 program databases with the `pdb` crate
use anyhow::{Result, anyhow, bail};
use std::cell::Cell;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use ::pdb::{
    AddressMap, ClassKind, FallibleIterator, Indirection, MachineType, PrimitiveKind,
    PrimitiveType, ProcedureSymbol, RawString, SymbolData, TypeData, TypeFinder, TypeIndex,
};

use crate::builder::{
    Argument, FieldNode, FunctionNode, GraphBuilder, Primitive, TypeNode, TypeShape, TypeSource,
};
use crate::provider::{ProviderError, load_file};
use crate::symbols::{Architecture, CallingConvention, Header, OriginalFormat, TypeKind, Usym};

/// indices below this are primitives encoded in the index itself
const FIRST_NONPRIMITIVE: u32 = 0x1000;

/// `S_UDT` typedef ids live above the type index space
const TYPEDEF_ID_BASE: u32 = 0x8000_0000;

const MAX_CHAIN_DEPTH: usize = 32;

/// a node of the PDB type graph. typedefs only exist as symbols, so they get
/// their own handle.
#[derive(Debug, Clone)]
pub enum PdbHandle {
    Type(TypeIndex),
    Typedef {
        id: u32,
        name: String,
        target: TypeIndex,
    },
}

pub struct PdbProvider {
    data: Vec<u8>,
}

impl PdbProvider {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        Ok(Self::new(load_file(path)?))
    }

    pub fn create_graph(&self) -> Result<Usym, ProviderError> {
        let mut pdb = ::pdb::PDB::open(Cursor::new(self.data.as_slice()))?;

        let machine_type = pdb
            .debug_information()
            .and_then(|dbi| dbi.machine_type())
            .unwrap_or(MachineType::Unknown);
        let architecture = architecture(machine_type);

        let type_information = pdb.type_information()?;
        let mut finder = type_information.finder();
        let mut roots = Vec::new();
        let mut definitions = HashMap::new();
        {
            let mut iter = type_information.iter();
            while let Some(item) = iter.next()? {
                finder.update(&iter);
                let Ok(data) = item.parse() else {
                    continue;
                };
                match &data {
                    TypeData::Class(c) if !c.properties.forward_reference() => {
                        definitions
                            .entry(key(c.unique_name, c.name))
                            .or_insert(item.index());
                        roots.push(item.index());
                    }
                    TypeData::Union(u) if !u.properties.forward_reference() => {
                        definitions
                            .entry(key(u.unique_name, u.name))
                            .or_insert(item.index());
                        roots.push(item.index());
                    }
                    TypeData::Enumeration(e) if !e.properties.forward_reference() => {
                        definitions
                            .entry(key(e.unique_name, e.name))
                            .or_insert(item.index());
                        roots.push(item.index());
                    }
                    TypeData::Pointer(_) => roots.push(item.index()),
                    _ => {}
                }
            }
        }
        log::debug!("{} type records, {} definitions", roots.len(), definitions.len());

        let source = PdbTypes {
            finder: &finder,
            definitions,
            pointer_size: match machine_type {
                MachineType::Amd64 | MachineType::Arm64 | MachineType::Ia64 => 8,
                _ => 4,
            },
            next_field_id: Cell::new(1),
        };

        let mut builder = GraphBuilder::new(Header::new(OriginalFormat::Pdb, architecture));

        for index in roots {
            if let Err(err) = builder.build_type(&source, &PdbHandle::Type(index)) {
                log::debug!("{:>12} {:#x}: {:#}", "skip type", index.0, err);
            }
        }

        self.extract_typedefs(&mut pdb, &source, &mut builder)?;
        self.extract_functions(&mut pdb, &source, &mut builder)?;

        let graph = builder.finish();
        log::info!(
            "extracted {} types, {} functions",
            graph.type_symbols.len(),
            graph.function_symbols.len()
        );
        Ok(graph)
    }

    /// global `S_UDT` records that name something other than the aggregate
    /// they point at
    fn extract_typedefs<'a>(
        &self,
        pdb: &mut ::pdb::PDB<'a, Cursor<&'a [u8]>>,
        source: &PdbTypes<'_>,
        builder: &mut GraphBuilder,
    ) -> Result<(), ProviderError> {
        let globals = pdb.global_symbols()?;
        let mut symbols = globals.iter();
        let mut next_id = TYPEDEF_ID_BASE;

        while let Some(symbol) = symbols.next()? {
            let Ok(SymbolData::UserDefinedType(udt)) = symbol.parse() else {
                continue;
            };
            let name = udt.name.to_string().into_owned();
            if source.aggregate_name(udt.type_index).as_deref() == Some(name.as_str()) {
                continue;
            }

            let handle = PdbHandle::Typedef {
                id: next_id,
                name,
                target: udt.type_index,
            };
            next_id += 1;

            if let Err(err) = builder.build_type(source, &handle) {
                log::debug!("{:>12} {:#}", "skip typedef", err);
            }
        }

        Ok(())
    }

    /// `S_GPROC32` / `S_LPROC32` of every module
    fn extract_functions<'a>(
        &self,
        pdb: &mut ::pdb::PDB<'a, Cursor<&'a [u8]>>,
        source: &PdbTypes<'_>,
        builder: &mut GraphBuilder,
    ) -> Result<(), ProviderError> {
        let address_map = pdb.address_map()?;
        let dbi = pdb.debug_information()?;
        let mut modules = dbi.modules()?;
        let mut next_id = 1u32;

        while let Some(module) = modules.next()? {
            let info = match pdb.module_info(&module) {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("skip module {}: {}", module.module_name(), err);
                    continue;
                }
            };

            let mut symbols = info.symbols()?;
            while let Some(symbol) = symbols.next()? {
                let Ok(SymbolData::Procedure(procedure)) = symbol.parse() else {
                    continue;
                };
                let node = source.function_node(next_id, &procedure, &address_map);
                builder.build_function(source, node);
                next_id += 1;
            }
        }

        Ok(())
    }
}

fn key(unique_name: Option<RawString<'_>>, name: RawString<'_>) -> String {
    unique_name.unwrap_or(name).to_string().into_owned()
}

fn architecture(machine_type: MachineType) -> Architecture {
    match machine_type {
        MachineType::X86 => Architecture::X86,
        MachineType::Amd64 => Architecture::X86_64,
        MachineType::Arm | MachineType::ArmNT | MachineType::Thumb => Architecture::Arm32,
        MachineType::Arm64 => Architecture::Arm64,
        _ => Architecture::Unknown,
    }
}

/// `CV_call_e`
fn calling_convention(code: u8) -> CallingConvention {
    match code {
        0x00 => CallingConvention::NearC,
        0x04 => CallingConvention::NearFast,
        0x07 => CallingConvention::NearStd,
        0x09 => CallingConvention::NearSys,
        0x0b => CallingConvention::Thiscall,
        0x16 => CallingConvention::ClrCall,
        _ => CallingConvention::Unknown,
    }
}

/// complete definition for a forward reference, looked up by unique name
/// (or plain name). the reference itself when no definition was seen.
fn complete_definition(
    definitions: &HashMap<String, TypeIndex>,
    forward: TypeIndex,
    unique_name: Option<RawString<'_>>,
    name: RawString<'_>,
) -> TypeIndex {
    definitions
        .get(&key(unique_name, name))
        .copied()
        .unwrap_or(forward)
}

/// primitive with its size in bytes
fn primitive_kind(kind: &PrimitiveKind) -> (Primitive, u64) {
    match kind {
        PrimitiveKind::NoType => (Primitive::NoType, 0),
        PrimitiveKind::Void => (Primitive::Void, 0),
        PrimitiveKind::Char | PrimitiveKind::RChar => (Primitive::Char, 1),
        PrimitiveKind::UChar => (Primitive::UInt, 1),
        PrimitiveKind::WChar => (Primitive::WChar, 2),
        PrimitiveKind::RChar16 => (Primitive::Char16, 2),
        PrimitiveKind::RChar32 => (Primitive::Char32, 4),
        PrimitiveKind::I8 => (Primitive::Int, 1),
        PrimitiveKind::U8 => (Primitive::UInt, 1),
        PrimitiveKind::Short | PrimitiveKind::I16 => (Primitive::Int, 2),
        PrimitiveKind::UShort | PrimitiveKind::U16 => (Primitive::UInt, 2),
        PrimitiveKind::Long => (Primitive::Long, 4),
        PrimitiveKind::ULong => (Primitive::ULong, 4),
        PrimitiveKind::I32 | PrimitiveKind::HRESULT => (Primitive::Int, 4),
        PrimitiveKind::U32 => (Primitive::UInt, 4),
        PrimitiveKind::Quad | PrimitiveKind::I64 => (Primitive::Int, 8),
        PrimitiveKind::UQuad | PrimitiveKind::U64 => (Primitive::UInt, 8),
        PrimitiveKind::Octa | PrimitiveKind::I128 => (Primitive::Int, 16),
        PrimitiveKind::UOcta | PrimitiveKind::U128 => (Primitive::UInt, 16),
        PrimitiveKind::F16 => (Primitive::Float, 2),
        PrimitiveKind::F32 | PrimitiveKind::F32PP => (Primitive::Float, 4),
        PrimitiveKind::F48 => (Primitive::Float, 6),
        PrimitiveKind::F64 => (Primitive::Float, 8),
        PrimitiveKind::F80 => (Primitive::Float, 10),
        PrimitiveKind::F128 => (Primitive::Float, 16),
        PrimitiveKind::Bool8 => (Primitive::Bool, 1),
        PrimitiveKind::Bool16 => (Primitive::Bool, 2),
        PrimitiveKind::Bool32 => (Primitive::Bool, 4),
        PrimitiveKind::Bool64 => (Primitive::Bool, 8),
        _ => (Primitive::Other, 0),
    }
}

fn indirection_size(indirection: &Indirection) -> u64 {
    match indirection {
        Indirection::Near16 => 2,
        Indirection::Far32 => 6,
        Indirection::Near64 => 8,
        Indirection::Near128 => 16,
        // near32 and the 16-bit far/huge forms
        _ => 4,
    }
}

/// a primitive index either names a base type or a pointer to one
fn primitive_node(primitive: &PrimitiveType) -> TypeNode<PdbHandle> {
    match &primitive.indirection {
        Some(indirection) => TypeNode {
            name: None,
            length: indirection_size(indirection),
            shape: TypeShape::Pointer,
        },
        None => {
            let (kind, size) = primitive_kind(&primitive.kind);
            TypeNode {
                name: None,
                length: size,
                shape: TypeShape::Base(kind),
            }
        }
    }
}

/// the type stream as a [`TypeSource`]
pub struct PdbTypes<'t> {
    finder: &'t TypeFinder<'t>,
    /// unique name -> complete definition
    definitions: HashMap<String, TypeIndex>,
    pointer_size: u64,
    next_field_id: Cell<u32>,
}

impl<'t> PdbTypes<'t> {
    fn parse(&self, index: TypeIndex) -> Result<TypeData<'t>> {
        Ok(self.finder.find(index)?.parse()?)
    }

    /// follow modifiers, bitfields and forward references to the type that
    /// carries the layout
    fn resolve(&self, mut index: TypeIndex) -> Result<TypeIndex> {
        for _ in 0..MAX_CHAIN_DEPTH {
            if index.0 < FIRST_NONPRIMITIVE {
                return Ok(index);
            }
            match self.parse(index)? {
                TypeData::Modifier(m) => index = m.underlying_type,
                TypeData::Bitfield(b) => index = b.underlying_type,
                TypeData::Class(c) if c.properties.forward_reference() => {
                    return Ok(complete_definition(&self.definitions, index, c.unique_name, c.name));
                }
                TypeData::Union(u) if u.properties.forward_reference() => {
                    return Ok(complete_definition(&self.definitions, index, u.unique_name, u.name));
                }
                TypeData::Enumeration(e) if e.properties.forward_reference() => {
                    return Ok(complete_definition(&self.definitions, index, e.unique_name, e.name));
                }
                _ => return Ok(index),
            }
        }
        bail!("type chain too deep at {:#x}", index.0)
    }

    fn aggregate_name(&self, index: TypeIndex) -> Option<String> {
        let index = self.resolve(index).ok()?;
        if index.0 < FIRST_NONPRIMITIVE {
            return None;
        }
        match self.parse(index).ok()? {
            TypeData::Class(c) => Some(c.name.to_string().into_owned()),
            TypeData::Union(u) => Some(u.name.to_string().into_owned()),
            TypeData::Enumeration(e) => Some(e.name.to_string().into_owned()),
            _ => None,
        }
    }

    fn is_signature(&self, index: TypeIndex) -> bool {
        matches!(
            self.resolve(index).and_then(|i| self.parse(i)),
            Ok(TypeData::Procedure(_) | TypeData::MemberFunction(_))
        )
    }

    /// size of an enum's underlying integer, int-sized when unreadable
    fn primitive_size(&self, index: TypeIndex) -> u64 {
        match self.resolve(index).and_then(|i| self.parse(i)) {
            Ok(TypeData::Primitive(p)) => primitive_node(&p).length,
            _ => 4,
        }
    }

    fn allocate_field_id(&self) -> u32 {
        let id = self.next_field_id.get();
        self.next_field_id.set(id.wrapping_add(1).max(1));
        id
    }

    /// data members of a field list, following continuations
    fn fields(&self, list: Option<TypeIndex>) -> Vec<Option<FieldNode<PdbHandle>>> {
        let mut fields = Vec::new();
        let mut next = list;

        for _ in 0..u16::MAX {
            let Some(index) = next.take() else {
                break;
            };
            let list = match self.parse(index) {
                Ok(TypeData::FieldList(list)) => list,
                Ok(_) => {
                    log::warn!("{:#x} is not a field list", index.0);
                    break;
                }
                Err(err) => {
                    log::warn!("failed to read field list {:#x}: {:#}", index.0, err);
                    break;
                }
            };

            for field in list.fields {
                if let TypeData::Member(m) = field {
                    fields.push(Some(FieldNode {
                        id: self.allocate_field_id(),
                        name: m.name.to_string().into_owned(),
                        offset: i32::try_from(m.offset).unwrap_or(i32::MAX),
                        ty: PdbHandle::Type(m.field_type),
                    }));
                }
            }
            next = list.continuation;
        }

        fields
    }

    fn arguments(&self, list: TypeIndex) -> Vec<Argument<PdbHandle>> {
        match self.parse(list) {
            Ok(TypeData::ArgumentList(list)) => list
                .arguments
                .into_iter()
                .map(|argument| {
                    if argument.0 == 0 {
                        Argument::Untyped(None)
                    } else {
                        Argument::Typed(PdbHandle::Type(argument))
                    }
                })
                .collect(),
            _ => {
                log::warn!("{:#x} is not an argument list", list.0);
                Vec::new()
            }
        }
    }

    fn function_node(
        &self,
        id: u32,
        procedure: &ProcedureSymbol<'_>,
        address_map: &AddressMap<'_>,
    ) -> FunctionNode<PdbHandle> {
        let mut node = FunctionNode {
            id,
            name: procedure.name.to_string().into_owned(),
            return_type: None,
            receiver: None,
            arguments: Vec::new(),
            calling_convention: CallingConvention::Unknown,
            virtual_address: procedure
                .offset
                .to_rva(address_map)
                .map(|rva| u64::from(rva.0))
                .unwrap_or(0),
        };

        match self.parse(procedure.type_index) {
            Ok(TypeData::Procedure(p)) => {
                node.return_type = p.return_type.map(PdbHandle::Type);
                node.arguments = self.arguments(p.argument_list);
                node.calling_convention = calling_convention(p.attributes.calling_convention());
            }
            Ok(TypeData::MemberFunction(m)) => {
                node.return_type = Some(PdbHandle::Type(m.return_type));
                node.receiver = m.this_pointer_type.map(PdbHandle::Type);
                node.arguments = self.arguments(m.argument_list);
                node.calling_convention = calling_convention(m.attributes.calling_convention());
            }
            _ => log::warn!("{:>12} {}: no function type", "function", node.name),
        }

        node
    }
}

impl TypeSource for PdbTypes<'_> {
    type Handle = PdbHandle;

    fn type_id(&self, handle: &PdbHandle) -> Option<u32> {
        match handle {
            PdbHandle::Typedef { id, .. } => Some(*id),
            // T_NOTYPE
            PdbHandle::Type(index) if index.0 == 0 => None,
            PdbHandle::Type(index) => self.resolve(*index).ok().map(|i| i.0),
        }
    }

    fn describe(&self, handle: &PdbHandle) -> Result<TypeNode<PdbHandle>> {
        let index = match handle {
            PdbHandle::Typedef { name, target, .. } => {
                let target = (target.0 != 0 && !self.is_signature(*target))
                    .then_some(PdbHandle::Type(*target));
                return Ok(TypeNode {
                    name: Some(name.clone()),
                    length: 0,
                    shape: TypeShape::Typedef { target },
                });
            }
            PdbHandle::Type(index) => self.resolve(*index)?,
        };

        let node = match self.parse(index)? {
            TypeData::Primitive(p) => primitive_node(&p),
            TypeData::Class(c) => {
                let kind = match c.kind {
                    ClassKind::Class => TypeKind::Class,
                    ClassKind::Struct => TypeKind::Struct,
                    ClassKind::Interface => TypeKind::Interface,
                };
                TypeNode {
                    name: Some(c.name.to_string().into_owned()),
                    length: u64::from(c.size),
                    shape: TypeShape::Aggregate {
                        kind,
                        fields: self.fields(c.fields),
                    },
                }
            }
            TypeData::Union(u) => TypeNode {
                name: Some(u.name.to_string().into_owned()),
                length: u64::from(u.size),
                shape: TypeShape::Aggregate {
                    kind: TypeKind::Union,
                    fields: self.fields(Some(u.fields)),
                },
            },
            TypeData::Enumeration(e) => TypeNode {
                name: Some(e.name.to_string().into_owned()),
                length: self.primitive_size(e.underlying_type),
                shape: TypeShape::Enum,
            },
            TypeData::Pointer(p) => TypeNode {
                name: None,
                length: match u64::from(p.attributes.size()) {
                    0 => self.pointer_size,
                    size => size,
                },
                shape: TypeShape::Pointer,
            },
            TypeData::Array(a) => TypeNode {
                name: None,
                length: a.dimensions.iter().copied().max().map(u64::from).unwrap_or(0),
                shape: TypeShape::Array,
            },
            TypeData::Procedure(_) | TypeData::MemberFunction(_) => {
                bail!("function signature {:#x} is not a type symbol", index.0)
            }
            other => return Err(anyhow!("unsupported type record {:#x}: {:?}", index.0, other)),
        };

        log::trace!(
            "{:>12} {:#x}: {}",
            "pdb type",
            index.0,
            node.name.as_deref().unwrap_or("<anonymous>")
        );
        Ok(node)
    }
}
