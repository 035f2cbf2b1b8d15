//! the USYM symbol graph: a header plus id-keyed tables of type symbols and
//! function symbols.
//!
//! ids are assigned by the provider that built the graph. they are opaque and
//! only unique within their own table, a type id and a function id may share
//! the same number. `0` always means "no reference".
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::serializer::{Format, SerializeError, SerializeResult, Serializer};

/// file magic, the bytes `USYM` read as a little-endian u32
pub const MAGIC: u32 = u32::from_le_bytes(*b"USYM");

/// enums with a one-byte wire tag. tags that are out of range decode to
/// `Unknown` instead of failing, so newer files stay readable.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $tag:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(from = "u8", into = "u8")]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $tag,)+
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }

        impl From<u8> for $name {
            fn from(tag: u8) -> Self {
                match tag {
                    $($tag => Self::$variant,)+
                    _ => Self::Unknown,
                }
            }
        }
    };
}

wire_enum! {
    /// debug info format the graph was extracted from
    pub enum OriginalFormat {
        Pdb = 0,
        Dwarf = 1,
        #[default]
        Unknown = 2,
    }
}

wire_enum! {
    pub enum Architecture {
        X86 = 0,
        X86_64 = 1,
        Arm32 = 2,
        Arm64 = 3,
        #[default]
        Unknown = 4,
    }
}

wire_enum! {
    /// closed set of type symbol kinds
    pub enum TypeKind {
        Base = 0,
        Struct = 1,
        Class = 2,
        Union = 3,
        Interface = 4,
        Enum = 5,
        Pointer = 6,
        Typedef = 7,
        Array = 8,
        #[default]
        Unknown = 9,
    }
}

wire_enum! {
    pub enum CallingConvention {
        NearC = 0,
        NearFast = 1,
        NearStd = 2,
        NearSys = 3,
        Thiscall = 4,
        ClrCall = 5,
        #[default]
        Unknown = 6,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub magic: u32,
    pub original_format: OriginalFormat,
    pub architecture: Architecture,
}

impl Header {
    pub fn new(original_format: OriginalFormat, architecture: Architecture) -> Self {
        Self {
            magic: MAGIC,
            original_format,
            architecture,
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new(OriginalFormat::Unknown, Architecture::Unknown)
    }
}

/// shared view over every symbol kind
pub trait Symbol {
    fn id(&self) -> u32;
    fn name(&self) -> &str;
}

/// a type node. serialized field order is the binary wire order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeSymbol {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TypeKind,
    /// size in bytes
    pub length: u64,
    pub field_count: u32,
    /// declaration order
    pub fields: Vec<FieldSymbol>,
    /// aliased type for typedefs, 0 otherwise (and for typedefs of function
    /// signatures)
    pub typedef_source: u32,
}

/// a data member of a type. a field with id 0 is a placeholder for a member
/// that could not be extracted; it keeps `field_count` and positions intact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSymbol {
    #[serde(default)]
    pub id: u32,
    pub name: String,
    pub underlying_type_id: u32,
    /// byte offset in the owning type
    pub offset: i32,
    pub is_anonymous_union: bool,
    /// only meaningful when `is_anonymous_union` is set
    pub union_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSymbol {
    pub id: u32,
    pub name: String,
    pub return_type_id: u32,
    pub argument_count: u32,
    /// the receiver (`this`) comes first for non-static member functions
    pub argument_type_ids: Vec<u32>,
    pub calling_convention: CallingConvention,
    /// load-relative, 0 if unknown
    pub virtual_address: u64,
}

impl TypeSymbol {
    /// equal length, field count, name, fields and typedef source. the kind
    /// and the field ids take no part.
    pub fn structurally_eq(&self, other: &Self) -> bool {
        self.length == other.length
            && self.field_count == other.field_count
            && self.name == other.name
            && self.typedef_source == other.typedef_source
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.structurally_eq(b))
    }

    /// every type id this symbol points at, zeros included
    pub fn type_references(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields
            .iter()
            .map(|f| f.underlying_type_id)
            .chain(std::iter::once(self.typedef_source))
    }

    pub(crate) fn type_references_mut(&mut self) -> impl Iterator<Item = &mut u32> {
        self.fields
            .iter_mut()
            .map(|f| &mut f.underlying_type_id)
            .chain(std::iter::once(&mut self.typedef_source))
    }
}

impl FieldSymbol {
    pub fn is_placeholder(&self) -> bool {
        self.id == 0
    }

    pub fn structurally_eq(&self, other: &Self) -> bool {
        self.underlying_type_id == other.underlying_type_id
            && self.offset == other.offset
            && self.name == other.name
            && self.is_anonymous_union == other.is_anonymous_union
            && self.union_id == other.union_id
    }
}

impl FunctionSymbol {
    /// return type followed by the argument types, zeros included
    pub fn type_references(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.return_type_id).chain(self.argument_type_ids.iter().copied())
    }

    pub(crate) fn type_references_mut(&mut self) -> impl Iterator<Item = &mut u32> {
        std::iter::once(&mut self.return_type_id).chain(self.argument_type_ids.iter_mut())
    }
}

impl Symbol for TypeSymbol {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Symbol for FieldSymbol {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Symbol for FunctionSymbol {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

static EMPTY_TYPE_SYMBOL: TypeSymbol = TypeSymbol {
    id: 0,
    name: String::new(),
    kind: TypeKind::Unknown,
    length: 0,
    field_count: 0,
    fields: Vec::new(),
    typedef_source: 0,
};

static EMPTY_FUNCTION_SYMBOL: FunctionSymbol = FunctionSymbol {
    id: 0,
    name: String::new(),
    return_type_id: 0,
    argument_count: 0,
    argument_type_ids: Vec::new(),
    calling_convention: CallingConvention::Unknown,
    virtual_address: 0,
};

/// the symbol graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usym {
    pub header: Header,
    pub type_symbols: BTreeMap<u32, TypeSymbol>,
    pub function_symbols: BTreeMap<u32, FunctionSymbol>,
    serializer: Option<Format>,
}

impl Usym {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            ..Self::default()
        }
    }

    /// select the codec used by [`Usym::serialize`]
    pub fn set_serializer(&mut self, format: Format) {
        self.serializer = Some(format);
    }

    pub fn serializer(&self) -> Option<Format> {
        self.serializer
    }

    /// deduplicate, verify, then write `<base_output_name>.<ext>` with the
    /// selected codec. deduplication repeats until no pass merges anything.
    /// verification failures are logged but do not stop the write.
    pub fn serialize(&mut self, base_output_name: impl AsRef<Path>) -> SerializeResult {
        let Some(format) = self.serializer else {
            return Err(SerializeError::SerializerUninitialized);
        };

        let removed = self.deduplicate();
        log::debug!("removed {} duplicate type symbols", removed);

        if !self.verify_type_ids() {
            log::warn!("symbol graph has unresolved type references, writing it anyway");
        }

        let mut serializer = Serializer::new(format);
        serializer.setup(base_output_name, Some(&*self));
        serializer.serialize_to_file()
    }

    /// first type with the given name in id order, or an empty symbol with id
    /// 0 when there is none
    pub fn type_symbol_by_name(&self, name: &str) -> &TypeSymbol {
        self.type_symbols
            .values()
            .find(|t| t.name == name)
            .unwrap_or(&EMPTY_TYPE_SYMBOL)
    }

    /// first function with the given name in id order, or an empty symbol with
    /// id 0 when there is none
    pub fn function_symbol_by_name(&self, name: &str) -> &FunctionSymbol {
        self.function_symbols
            .values()
            .find(|f| f.name == name)
            .unwrap_or(&EMPTY_FUNCTION_SYMBOL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_type(id: u32, name: &str) -> TypeSymbol {
        TypeSymbol {
            id,
            name: name.to_string(),
            kind: TypeKind::Struct,
            length: 8,
            ..TypeSymbol::default()
        }
    }

    #[test]
    fn test_magic_is_usym_on_disk() {
        assert_eq!(&MAGIC.to_le_bytes(), b"USYM");
        assert_eq!(Header::default().magic, MAGIC);
    }

    #[test]
    fn test_unknown_wire_tags_decode_to_unknown() {
        assert_eq!(TypeKind::from(3), TypeKind::Union);
        assert_eq!(TypeKind::from(200), TypeKind::Unknown);
        assert_eq!(CallingConvention::from(4), CallingConvention::Thiscall);
        assert_eq!(CallingConvention::from(99), CallingConvention::Unknown);
        assert_eq!(Architecture::from(1), Architecture::X86_64);
        assert_eq!(OriginalFormat::from(7), OriginalFormat::Unknown);
        assert_eq!(u8::from(TypeKind::Array), 8);
    }

    #[test]
    fn test_lookup_by_name_returns_first_in_id_order() {
        let mut graph = Usym::default();
        graph.type_symbols.insert(20, named_type(20, "Point"));
        graph.type_symbols.insert(10, named_type(10, "Point"));
        graph.type_symbols.insert(30, named_type(30, "Rect"));

        assert_eq!(graph.type_symbol_by_name("Point").id, 10);
        assert_eq!(graph.type_symbol_by_name("Rect").id, 30);
    }

    #[test]
    fn test_lookup_by_name_missing_is_empty_sentinel() {
        let mut graph = Usym::default();
        graph.function_symbols.insert(
            5,
            FunctionSymbol {
                id: 5,
                name: "main".to_string(),
                ..FunctionSymbol::default()
            },
        );

        assert_eq!(graph.function_symbol_by_name("main").id, 5);

        let missing = graph.function_symbol_by_name("nope");
        assert_eq!(missing.id, 0);
        assert!(missing.name.is_empty());

        let missing = graph.type_symbol_by_name("nope");
        assert_eq!(missing.id, 0);
        assert!(missing.fields.is_empty());
    }

    #[test]
    fn test_structural_equality_ignores_kind_and_field_ids() {
        let mut a = named_type(1, "S");
        a.fields.push(FieldSymbol {
            id: 100,
            name: "x".to_string(),
            underlying_type_id: 7,
            offset: 0,
            ..FieldSymbol::default()
        });
        a.field_count = 1;

        let mut b = a.clone();
        b.id = 2;
        b.kind = TypeKind::Class;
        b.fields[0].id = 200;
        assert!(a.structurally_eq(&b));

        b.fields[0].offset = 4;
        assert!(!a.structurally_eq(&b));
    }

    #[test]
    fn test_type_references_include_typedef_source() {
        let mut t = named_type(1, "T");
        t.typedef_source = 9;
        t.fields.push(FieldSymbol {
            id: 2,
            underlying_type_id: 3,
            ..FieldSymbol::default()
        });
        let refs: Vec<u32> = t.type_references().collect();
        assert_eq!(refs, vec![3, 9]);
    }
}
