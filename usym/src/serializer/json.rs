//! `.json` codec: one object, symbol tables keyed by stringified id,
//! enum values as their numeric tags, 4-space indentation.
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::{Codec, check_magic};
use crate::symbols::{Architecture, FunctionSymbol, Header, OriginalFormat, TypeSymbol, Usym};

#[derive(Debug, Default)]
pub struct JsonCodec {
    document: Map<String, Value>,
}

impl Codec for JsonCodec {
    fn serialize_header(&mut self, header: &Header) -> Result<()> {
        match serde_json::to_value(header)? {
            Value::Object(map) => {
                self.document.extend(map);
                Ok(())
            }
            other => bail!("header encoded as {} instead of an object", other),
        }
    }

    fn serialize_type_symbols(&mut self, type_symbols: &BTreeMap<u32, TypeSymbol>) -> Result<()> {
        let value = serde_json::to_value(type_symbols).context("failed to encode type symbols")?;
        self.document.insert("typeSymbols".to_string(), value);
        Ok(())
    }

    fn serialize_function_symbols(
        &mut self,
        function_symbols: &BTreeMap<u32, FunctionSymbol>,
    ) -> Result<()> {
        let value =
            serde_json::to_value(function_symbols).context("failed to encode function symbols")?;
        self.document.insert("functionSymbols".to_string(), value);
        Ok(())
    }

    fn write_to_file(&mut self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(b"    "));
        self.document.serialize(&mut serializer)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    magic: u32,
    original_format: OriginalFormat,
    architecture: Architecture,
    #[serde(default)]
    type_symbols: BTreeMap<u32, TypeSymbol>,
    #[serde(default)]
    function_symbols: BTreeMap<u32, FunctionSymbol>,
}

pub(super) fn decode(bytes: &[u8]) -> Result<Usym> {
    let document: Document = serde_json::from_slice(bytes).context("malformed USYM json")?;

    let header = Header {
        magic: document.magic,
        original_format: document.original_format,
        architecture: document.architecture,
    };
    check_magic(&header)?;

    let mut graph = Usym::new(header);
    graph.type_symbols = document.type_symbols;
    graph.function_symbols = document.function_symbols;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{FieldSymbol, TypeKind};

    fn sample_graph() -> Usym {
        let mut graph = Usym::new(Header::new(OriginalFormat::Dwarf, Architecture::X86_64));
        graph.type_symbols.insert(
            2,
            TypeSymbol {
                id: 2,
                name: "Point".to_string(),
                kind: TypeKind::Struct,
                length: 8,
                field_count: 1,
                fields: vec![FieldSymbol {
                    id: 3,
                    name: "x".to_string(),
                    underlying_type_id: 1,
                    ..FieldSymbol::default()
                }],
                typedef_source: 0,
            },
        );
        graph
    }

    fn written(graph: &Usym) -> String {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let mut codec = JsonCodec::default();
        codec.serialize_header(&graph.header).unwrap();
        codec.serialize_type_symbols(&graph.type_symbols).unwrap();
        codec
            .serialize_function_symbols(&graph.function_symbols)
            .unwrap();
        codec.write_to_file(&path).unwrap();
        std::fs::read_to_string(&path).unwrap()
    }

    #[test]
    fn test_document_shape() {
        let text = written(&sample_graph());
        let json: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(json["magic"], u32::from_le_bytes(*b"USYM"));
        assert_eq!(json["originalFormat"], 1);
        assert_eq!(json["architecture"], 1);
        assert!(json["functionSymbols"].as_object().unwrap().is_empty());

        let point = &json["typeSymbols"]["2"];
        assert_eq!(point["name"], "Point");
        assert_eq!(point["type"], 1);
        assert_eq!(point["fieldCount"], 1);
        assert_eq!(point["typedefSource"], 0);
        assert_eq!(point["fields"][0]["underlyingTypeId"], 1);
        assert_eq!(point["fields"][0]["isAnonymousUnion"], false);
    }

    #[test]
    fn test_four_space_indent() {
        let text = written(&sample_graph());
        assert!(text.starts_with("{\n    \""));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn test_field_id_is_optional_when_reading() {
        let text = r#"{
            "magic": 1297699669,
            "originalFormat": 0,
            "architecture": 0,
            "typeSymbols": {
                "5": {
                    "id": 5, "name": "S", "type": 1, "length": 4, "fieldCount": 1,
                    "fields": [{"name": "a", "underlyingTypeId": 6, "offset": 0,
                                "isAnonymousUnion": false, "unionId": 0}],
                    "typedefSource": 0
                }
            }
        }"#;
        let graph = decode(text.as_bytes()).unwrap();
        assert_eq!(graph.type_symbols[&5].fields[0].id, 0);
        assert_eq!(graph.type_symbols[&5].fields[0].underlying_type_id, 6);
        assert!(graph.function_symbols.is_empty());
    }

    #[test]
    fn test_decode_restores_graph() {
        let graph = sample_graph();
        let decoded = decode(written(&graph).as_bytes()).unwrap();
        assert_eq!(decoded, graph);
    }
}
