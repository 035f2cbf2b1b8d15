//! `.usym` codec: fixed-width little-endian records, `u64` length prefixes.
use anyhow::{Context, Result};
use bincode::Options;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use super::{Codec, check_magic};
use crate::symbols::{FunctionSymbol, Header, TypeSymbol, Usym};

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

#[derive(Debug, Default)]
pub struct BinaryCodec {
    buffer: Vec<u8>,
}

impl Codec for BinaryCodec {
    fn serialize_header(&mut self, header: &Header) -> Result<()> {
        wire_options()
            .serialize_into(&mut self.buffer, header)
            .context("failed to encode header")
    }

    fn serialize_type_symbols(&mut self, type_symbols: &BTreeMap<u32, TypeSymbol>) -> Result<()> {
        let symbols: Vec<&TypeSymbol> = type_symbols.values().collect();
        wire_options()
            .serialize_into(&mut self.buffer, &symbols)
            .context("failed to encode type symbols")
    }

    fn serialize_function_symbols(
        &mut self,
        function_symbols: &BTreeMap<u32, FunctionSymbol>,
    ) -> Result<()> {
        let symbols: Vec<&FunctionSymbol> = function_symbols.values().collect();
        wire_options()
            .serialize_into(&mut self.buffer, &symbols)
            .context("failed to encode function symbols")
    }

    fn write_to_file(&mut self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&self.buffer)?;
        file.flush()
    }
}

pub(super) fn decode(bytes: &[u8]) -> Result<Usym> {
    let mut cursor = bytes;

    let header: Header = wire_options()
        .deserialize_from(&mut cursor)
        .context("truncated header")?;
    check_magic(&header)?;

    let types: Vec<TypeSymbol> = wire_options()
        .deserialize_from(&mut cursor)
        .context("malformed type symbol table")?;
    let functions: Vec<FunctionSymbol> = wire_options()
        .deserialize_from(&mut cursor)
        .context("malformed function symbol table")?;

    if !cursor.is_empty() {
        log::warn!("{} trailing bytes after function symbols", cursor.len());
    }

    let mut graph = Usym::new(header);
    graph.type_symbols = types.into_iter().map(|t| (t.id, t)).collect();
    graph.function_symbols = functions.into_iter().map(|f| (f.id, f)).collect();
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{
        Architecture, CallingConvention, FieldSymbol, OriginalFormat, TypeKind,
    };

    fn encode(graph: &Usym) -> Vec<u8> {
        let mut codec = BinaryCodec::default();
        codec.serialize_header(&graph.header).unwrap();
        codec.serialize_type_symbols(&graph.type_symbols).unwrap();
        codec
            .serialize_function_symbols(&graph.function_symbols)
            .unwrap();
        codec.buffer
    }

    #[test]
    fn test_empty_graph_layout() {
        let graph = Usym::new(Header::new(OriginalFormat::Pdb, Architecture::Arm64));
        let bytes = encode(&graph);

        let mut expected = b"USYM".to_vec();
        expected.push(0); // pdb
        expected.push(3); // arm64
        expected.extend_from_slice(&0u64.to_le_bytes());
        expected.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_type_record_layout() {
        let mut graph = Usym::default();
        graph.type_symbols.insert(
            0x10,
            TypeSymbol {
                id: 0x10,
                name: "S".to_string(),
                kind: TypeKind::Struct,
                length: 4,
                field_count: 1,
                fields: vec![FieldSymbol {
                    id: 0x11,
                    name: "v".to_string(),
                    underlying_type_id: 0x12,
                    offset: -1,
                    is_anonymous_union: true,
                    union_id: 2,
                }],
                typedef_source: 0,
            },
        );
        let bytes = encode(&graph);

        let mut expected = Vec::new();
        expected.extend_from_slice(b"USYM");
        expected.extend_from_slice(&[2, 4]);
        expected.extend_from_slice(&1u64.to_le_bytes()); // type count
        expected.extend_from_slice(&0x10u32.to_le_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.push(b'S');
        expected.push(1); // struct
        expected.extend_from_slice(&4u64.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes()); // fields
        expected.extend_from_slice(&0x11u32.to_le_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.push(b'v');
        expected.extend_from_slice(&0x12u32.to_le_bytes());
        expected.extend_from_slice(&(-1i32).to_le_bytes());
        expected.push(1);
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes()); // typedef source
        expected.extend_from_slice(&0u64.to_le_bytes()); // function count
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_decode_restores_graph() {
        let mut graph = Usym::new(Header::new(OriginalFormat::Dwarf, Architecture::X86));
        graph.function_symbols.insert(
            9,
            FunctionSymbol {
                id: 9,
                name: "Widget::draw".to_string(),
                return_type_id: 0,
                argument_count: 1,
                argument_type_ids: vec![4],
                calling_convention: CallingConvention::Thiscall,
                virtual_address: 0x4010,
            },
        );

        let decoded = decode(&encode(&graph)).unwrap();
        assert_eq!(decoded, graph);
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let graph = Usym::default();
        let bytes = encode(&graph);
        assert!(decode(&bytes[..bytes.len() - 3]).is_err());
    }
}
