//! construction protocol shared by every provider.
//!
//! a provider describes its native type graph through [`TypeSource`], one node
//! at a time. [`GraphBuilder`] turns those nodes into symbols, memoized by id,
//! so every type is visited once no matter how often it is referenced.
use anyhow::{Result, anyhow, bail};
use std::collections::HashSet;

use crate::symbols::{
    CallingConvention, FieldSymbol, FunctionSymbol, Header, TypeKind, TypeSymbol, Usym,
};

/// primitive classification of a base type, independent of the debug format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    NoType,
    Void,
    Char,
    WChar,
    Int,
    UInt,
    Float,
    Bool,
    Long,
    ULong,
    Char8,
    Char16,
    Char32,
    Other,
}

/// canonical name of a base type of `width` bytes
pub fn base_type_name(primitive: Primitive, width: u64) -> &'static str {
    match primitive {
        Primitive::Char => "char",
        Primitive::WChar => "wchar",
        Primitive::Int => match width {
            1 => "int8_t",
            2 => "int16_t",
            4 => "int32_t",
            8 => "int64_t",
            _ => "int",
        },
        Primitive::UInt => match width {
            1 => "uint8_t",
            2 => "uint16_t",
            4 => "uint32_t",
            8 => "uint64_t",
            _ => "uint",
        },
        Primitive::Float => match width {
            8 => "double",
            10 | 12 | 16 => "long double",
            _ => "float",
        },
        Primitive::Bool => "bool",
        Primitive::Long => "long",
        Primitive::ULong => "unsigned long",
        Primitive::Char8 => "char8_t",
        Primitive::Char16 => "char16_t",
        Primitive::Char32 => "char32_t",
        Primitive::NoType | Primitive::Void | Primitive::Other => "void",
    }
}

/// one native type, as reported by a provider
#[derive(Debug, Clone)]
pub struct TypeNode<H> {
    pub name: Option<String>,
    /// size in bytes
    pub length: u64,
    pub shape: TypeShape<H>,
}

#[derive(Debug, Clone)]
pub enum TypeShape<H> {
    Base(Primitive),
    /// struct, class, union or interface. a `None` field could not be read and
    /// becomes a placeholder.
    Aggregate {
        kind: TypeKind,
        fields: Vec<Option<FieldNode<H>>>,
    },
    Enum,
    Pointer,
    /// `None` target for typedefs of function signatures
    Typedef { target: Option<H> },
    Array,
}

#[derive(Debug, Clone)]
pub struct FieldNode<H> {
    pub id: u32,
    pub name: String,
    pub offset: i32,
    pub ty: H,
}

#[derive(Debug, Clone)]
pub enum Argument<H> {
    Typed(H),
    /// an argument the provider reported without a usable type, e.g. a
    /// variadic marker. the handle, if any, is still resolved.
    Untyped(Option<H>),
}

#[derive(Debug, Clone)]
pub struct FunctionNode<H> {
    pub id: u32,
    pub name: String,
    pub return_type: Option<H>,
    /// `this` pointer type for non-static member functions
    pub receiver: Option<H>,
    pub arguments: Vec<Argument<H>>,
    pub calling_convention: CallingConvention,
    pub virtual_address: u64,
}

/// a provider's native type graph
pub trait TypeSource {
    type Handle;

    /// stable id of the type behind `handle`, qualifiers and forward
    /// references already resolved. `None` if no id can be read.
    fn type_id(&self, handle: &Self::Handle) -> Option<u32>;

    fn describe(&self, handle: &Self::Handle) -> Result<TypeNode<Self::Handle>>;
}

/// builds a [`Usym`] from provider nodes
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Usym,
    in_progress: HashSet<u32>,
    pointer_count: usize,
}

impl GraphBuilder {
    pub fn new(header: Header) -> Self {
        Self {
            graph: Usym::new(header),
            ..Self::default()
        }
    }

    pub fn graph(&self) -> &Usym {
        &self.graph
    }

    pub fn finish(self) -> Usym {
        self.graph
    }

    /// true once `id` is either built or currently being built
    pub fn contains_type(&self, id: u32) -> bool {
        self.graph.type_symbols.contains_key(&id) || self.in_progress.contains(&id)
    }

    /// build the type behind `handle` (and everything it needs) and return
    /// its id. already-known ids return immediately.
    pub fn build_type<S: TypeSource>(&mut self, source: &S, handle: &S::Handle) -> Result<u32> {
        let id = source
            .type_id(handle)
            .ok_or_else(|| anyhow!("type has no readable id"))?;
        if id == 0 {
            bail!("type resolves to the reserved id 0");
        }
        if self.contains_type(id) {
            return Ok(id);
        }

        let node = source.describe(handle)?;

        self.in_progress.insert(id);
        let symbol = self.build_symbol(source, id, node);
        self.in_progress.remove(&id);

        log::debug!(
            "{:>12} {:#010x}: {} ({} bytes)",
            format!("{:?}", symbol.kind).to_lowercase(),
            id,
            symbol.name,
            symbol.length
        );
        self.graph.type_symbols.insert(id, symbol);
        Ok(id)
    }

    fn build_symbol<S: TypeSource>(
        &mut self,
        source: &S,
        id: u32,
        node: TypeNode<S::Handle>,
    ) -> TypeSymbol {
        let TypeNode {
            name,
            length,
            shape,
        } = node;
        let mut symbol = TypeSymbol {
            id,
            name: name.unwrap_or_default(),
            length,
            ..TypeSymbol::default()
        };

        match shape {
            TypeShape::Base(primitive) => {
                symbol.kind = TypeKind::Base;
                symbol.name = base_type_name(primitive, length).to_string();
            }
            TypeShape::Aggregate { kind, fields } => {
                symbol.kind = kind;
                let mut built = Vec::with_capacity(fields.len());
                for field in fields {
                    built.push(self.build_field(source, &symbol.name, field));
                }
                if kind != TypeKind::Union {
                    assign_anonymous_unions(&mut built);
                }
                symbol.field_count = u32::try_from(built.len()).unwrap_or(u32::MAX);
                symbol.fields = built;
            }
            TypeShape::Enum => symbol.kind = TypeKind::Enum,
            TypeShape::Array => symbol.kind = TypeKind::Array,
            TypeShape::Pointer => {
                symbol.kind = TypeKind::Pointer;
                symbol.name = format!("pUnk{}", self.pointer_count);
                self.pointer_count += 1;
            }
            TypeShape::Typedef { target } => {
                symbol.kind = TypeKind::Typedef;
                match target {
                    // function signature
                    None => symbol.length = 0,
                    Some(target) => match self.build_type(source, &target) {
                        Ok(source_id) => {
                            symbol.typedef_source = source_id;
                            if let Some(aliased) = self.graph.type_symbols.get(&source_id) {
                                symbol.length = aliased.length;
                            }
                        }
                        Err(err) => {
                            log::warn!(
                                "{:>12} {:#010x}: {}: aliased type unavailable: {:#}",
                                "typedef",
                                id,
                                symbol.name,
                                err
                            );
                        }
                    },
                }
            }
        }

        symbol
    }

    /// a field whose member or type cannot be read becomes a placeholder
    fn build_field<S: TypeSource>(
        &mut self,
        source: &S,
        owner: &str,
        field: Option<FieldNode<S::Handle>>,
    ) -> FieldSymbol {
        let Some(field) = field else {
            log::error!("failed to read a field of {}", owner);
            return FieldSymbol::default();
        };

        match self.build_type(source, &field.ty) {
            Ok(underlying_type_id) => FieldSymbol {
                id: field.id,
                name: field.name,
                underlying_type_id,
                offset: field.offset,
                ..FieldSymbol::default()
            },
            Err(err) => {
                log::error!(
                    "failed to create field symbol {}::{}: {:#}",
                    owner,
                    field.name,
                    err
                );
                FieldSymbol::default()
            }
        }
    }

    /// insert a function symbol. unresolvable return or argument types are
    /// recorded as 0 rather than dropping the function.
    pub fn build_function<S: TypeSource>(
        &mut self,
        source: &S,
        node: FunctionNode<S::Handle>,
    ) -> u32 {
        let FunctionNode {
            id,
            name,
            return_type,
            receiver,
            arguments,
            calling_convention,
            virtual_address,
        } = node;

        if self.graph.function_symbols.contains_key(&id) {
            log::trace!("{:>12} {:#010x}: {} already built", "function", id, name);
            return id;
        }

        let return_type_id = match return_type {
            Some(handle) => self.resolve_signature_type(source, &name, &handle),
            None => 0,
        };

        let mut argument_type_ids = Vec::with_capacity(arguments.len() + 1);
        if let Some(receiver) = receiver {
            argument_type_ids.push(self.resolve_signature_type(source, &name, &receiver));
        }
        for (position, argument) in arguments.into_iter().enumerate() {
            match argument {
                Argument::Typed(handle) => {
                    argument_type_ids.push(self.resolve_signature_type(source, &name, &handle));
                }
                // a leading untyped entry is how an empty `(void)` list shows up
                Argument::Untyped(_) if position == 0 => {}
                Argument::Untyped(Some(handle)) => {
                    argument_type_ids.push(self.resolve_signature_type(source, &name, &handle));
                }
                Argument::Untyped(None) => argument_type_ids.push(0),
            }
        }

        log::debug!(
            "{:>12} {:#010x}: {} ({} args) @ {:#x}",
            "function",
            id,
            name,
            argument_type_ids.len(),
            virtual_address
        );

        let symbol = FunctionSymbol {
            id,
            name,
            return_type_id,
            argument_count: u32::try_from(argument_type_ids.len()).unwrap_or(u32::MAX),
            argument_type_ids,
            calling_convention,
            virtual_address,
        };
        self.graph.function_symbols.insert(id, symbol);
        id
    }

    fn resolve_signature_type<S: TypeSource>(
        &mut self,
        source: &S,
        function: &str,
        handle: &S::Handle,
    ) -> u32 {
        match self.build_type(source, handle) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("{:>12} {}: unresolved signature type: {:#}", "function", function, err);
                0
            }
        }
    }
}

/// mark members that share an offset with a neighbour as overlapping storage.
///
/// each maximal run of adjacent fields at one offset gets its own union id,
/// counted from 0 per type. placeholders break a run.
pub fn assign_anonymous_unions(fields: &mut [FieldSymbol]) {
    let mut union_id = 0;
    let mut in_group = false;

    for i in 1..fields.len() {
        if fields[i - 1].is_placeholder() || fields[i].is_placeholder() {
            if in_group {
                union_id += 1;
                in_group = false;
            }
            continue;
        }

        if fields[i - 1].offset == fields[i].offset {
            for field in &mut fields[i - 1..=i] {
                field.is_anonymous_union = true;
                field.union_id = union_id;
            }
            in_group = true;
        } else if in_group {
            union_id += 1;
            in_group = false;
        }
    }
}
