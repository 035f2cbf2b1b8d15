//! shared fixtures for the integration tests
#![allow(dead_code)]

use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use usym::builder::{
    Argument, FieldNode, FunctionNode, GraphBuilder, Primitive, TypeNode, TypeShape, TypeSource,
};
use usym::{Architecture, CallingConvention, Header, OriginalFormat, TypeKind, Usym};

pub fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

/// hand-written type graph, handles are the ids themselves
#[derive(Default)]
pub struct TableSource {
    nodes: HashMap<u32, TypeNode<u32>>,
}

impl TableSource {
    pub fn insert(&mut self, id: u32, name: Option<&str>, length: u64, shape: TypeShape<u32>) {
        self.nodes.insert(
            id,
            TypeNode {
                name: name.map(str::to_string),
                length,
                shape,
            },
        );
    }
}

impl TypeSource for TableSource {
    type Handle = u32;

    fn type_id(&self, handle: &u32) -> Option<u32> {
        self.nodes.contains_key(handle).then_some(*handle)
    }

    fn describe(&self, handle: &u32) -> Result<TypeNode<u32>> {
        self.nodes
            .get(handle)
            .cloned()
            .ok_or_else(|| anyhow!("no type {}", handle))
    }
}

pub const INT32: u32 = 0x10;
pub const FLOAT: u32 = 0x11;
pub const TEST_ENUM1: u32 = 0x20;
pub const TEST_STRUCT1: u32 = 0x30;
pub const TEST_STRUCT1_COPY: u32 = 0x31;
pub const TEST_STRUCT1_PTR: u32 = 0x40;
pub const TEST_CLASS1: u32 = 0x50;
pub const TEST_CLASS1_PTR: u32 = 0x41;
pub const FLOAT_COPY: u32 = 0x12;

fn member(id: u32, name: &str, offset: i32, ty: u32) -> Option<FieldNode<u32>> {
    Some(FieldNode {
        id,
        name: name.to_string(),
        offset,
        ty,
    })
}

/// the sample application's types, with a second copy of `TestStruct1` the
/// way a second compile unit would report it
pub fn sample_source() -> TableSource {
    let mut source = TableSource::default();
    source.insert(INT32, None, 4, TypeShape::Base(Primitive::Int));
    source.insert(FLOAT, None, 4, TypeShape::Base(Primitive::Float));
    source.insert(FLOAT_COPY, None, 4, TypeShape::Base(Primitive::Float));
    source.insert(TEST_ENUM1, Some("TestEnum1"), 4, TypeShape::Enum);
    source.insert(
        TEST_STRUCT1,
        Some("TestStruct1"),
        8,
        TypeShape::Aggregate {
            kind: TypeKind::Struct,
            fields: vec![
                member(0x100, "enumField", 0, TEST_ENUM1),
                member(0x101, "floatField", 4, FLOAT),
            ],
        },
    );
    source.insert(
        TEST_STRUCT1_COPY,
        Some("TestStruct1"),
        8,
        TypeShape::Aggregate {
            kind: TypeKind::Struct,
            fields: vec![
                member(0x110, "enumField", 0, TEST_ENUM1),
                member(0x111, "floatField", 4, FLOAT_COPY),
            ],
        },
    );
    source.insert(TEST_STRUCT1_PTR, None, 8, TypeShape::Pointer);
    source.insert(TEST_CLASS1_PTR, None, 8, TypeShape::Pointer);
    source.insert(
        TEST_CLASS1,
        Some("TestClass1"),
        16,
        TypeShape::Aggregate {
            kind: TypeKind::Class,
            fields: vec![
                member(0x120, "t1", 0, TEST_STRUCT1),
                member(0x121, "p", 8, TEST_STRUCT1_PTR),
            ],
        },
    );
    source
}

/// build the sample graph through the same protocol a provider uses
pub fn sample_graph() -> Usym {
    let source = sample_source();
    let mut builder = GraphBuilder::new(Header::new(OriginalFormat::Pdb, Architecture::X86_64));

    for id in [TEST_CLASS1, TEST_STRUCT1_COPY, FLOAT_COPY] {
        builder.build_type(&source, &id).expect("sample type builds");
    }

    builder.build_function(
        &source,
        FunctionNode {
            id: 1,
            name: "TestClass1::Scale".to_string(),
            return_type: Some(INT32),
            receiver: Some(TEST_CLASS1_PTR),
            arguments: vec![Argument::Typed(INT32)],
            calling_convention: CallingConvention::Thiscall,
            virtual_address: 0x1010,
        },
    );
    builder.build_function(
        &source,
        FunctionNode {
            id: 2,
            name: "make_struct".to_string(),
            return_type: Some(TEST_STRUCT1_COPY),
            receiver: None,
            arguments: vec![Argument::Untyped(None)],
            calling_convention: CallingConvention::NearC,
            virtual_address: 0x1080,
        },
    );

    builder.finish()
}

/// compile the C++ sample into a shared library under `dir`. `None` when no
/// compiler is usable or debug info would not end up in the library itself.
pub fn compile_sample(dir: &Path) -> Option<PathBuf> {
    if !cfg!(target_os = "linux") {
        log::warn!("sample library needs an ELF toolchain, skipping");
        return None;
    }

    let source = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join("sample.cpp");
    let library = dir.join("libsample.so");

    let output = Command::new("c++")
        .args(["-g", "-O0", "-shared", "-fPIC"])
        .arg(&source)
        .arg("-o")
        .arg(&library)
        .output();

    match output {
        Ok(output) if output.status.success() => Some(library),
        Ok(output) => {
            log::warn!(
                "c++ failed, skipping: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            None
        }
        Err(err) => {
            log::warn!("c++ not found in PATH, skipping: {}", err);
            None
        }
    }
}
