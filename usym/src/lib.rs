//! usym - convert native debug information into the Universal Symbol Format
//!
//! - PDB (MSF 7.00) and DWARF (ELF, Mach-O, PE, object files) inputs
//! - one symbol graph of types, fields and functions keyed by provider ids
//! - duplicate types are merged and references checked before writing
//! - binary (`.usym`) and JSON (`.json`) output, both readable again

pub mod builder;
mod dedup;
pub mod provider;
pub mod serializer;
pub mod symbols;
mod verify;

pub use builder::{GraphBuilder, TypeSource};
pub use provider::{ProviderError, create_graph_from_file};
pub use serializer::{Format, SerializeError, SerializeResult, Serializer, load_from_file};
pub use symbols::{
    Architecture, CallingConvention, FieldSymbol, FunctionSymbol, Header, OriginalFormat, Symbol,
    TypeKind, TypeSymbol, Usym,
};
