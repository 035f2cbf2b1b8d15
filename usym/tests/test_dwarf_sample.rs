mod common;

use common::{compile_sample, init_logger};
use tempfile::TempDir;
use usym::{Format, OriginalFormat, TypeKind, Usym, create_graph_from_file, load_from_file};

fn sample() -> Option<(TempDir, Usym)> {
    init_logger();

    let dir = TempDir::new().unwrap();
    let library = compile_sample(dir.path())?;
    let mut graph = create_graph_from_file(&library).unwrap();
    graph.deduplicate();
    Some((dir, graph))
}

#[test]
fn test_sample_header() {
    let Some((_dir, graph)) = sample() else {
        return;
    };

    assert_eq!(graph.header.magic, u32::from_le_bytes(*b"USYM"));
    assert_eq!(graph.header.original_format, OriginalFormat::Dwarf);
    assert!(graph.verify_type_ids());
}

#[test]
fn test_sample_class_layout() {
    let Some((_dir, graph)) = sample() else {
        return;
    };

    let class = graph.type_symbol_by_name("TestClass1");
    assert_ne!(class.id, 0);
    assert_eq!(class.kind, TypeKind::Class);
    assert_eq!(class.field_count, 2);
    assert_eq!(class.fields[0].name, "t1");
    assert_eq!(class.fields[0].offset, 0);
    assert_eq!(class.fields[1].name, "p");
    assert_eq!(class.fields[1].offset, 8);
    assert!(class.fields.iter().all(|f| !f.is_anonymous_union));

    let t1 = &graph.type_symbols[&class.fields[0].underlying_type_id];
    assert_eq!(t1.name, "TestStruct1");
    assert_eq!(t1.kind, TypeKind::Struct);
    assert_eq!(t1.field_count, 2);
    assert_eq!(t1.length, 8);

    let p = &graph.type_symbols[&class.fields[1].underlying_type_id];
    assert_eq!(p.kind, TypeKind::Pointer);
    assert!(p.name.starts_with("pUnk"));
    assert_eq!(p.length, 8);

    let enum_field = &graph.type_symbols[&t1.fields[0].underlying_type_id];
    assert_eq!(enum_field.name, "TestEnum1");
    assert_eq!(enum_field.kind, TypeKind::Enum);
    assert_eq!(enum_field.length, 4);

    let float_field = &graph.type_symbols[&t1.fields[1].underlying_type_id];
    assert_eq!(float_field.name, "float");
    assert_eq!(float_field.kind, TypeKind::Base);
    assert_eq!(t1.fields[1].offset, 4);
}

#[test]
fn test_sample_union_is_not_regrouped() {
    let Some((_dir, graph)) = sample() else {
        return;
    };

    let overlay = graph.type_symbol_by_name("Overlay");
    assert_eq!(overlay.kind, TypeKind::Union);
    assert_eq!(overlay.field_count, 2);
    assert_eq!(overlay.length, 4);
    assert!(overlay.fields.iter().all(|f| f.offset == 0));
    assert!(overlay.fields.iter().all(|f| !f.is_anonymous_union));
}

#[test]
fn test_sample_typedefs() {
    let Some((_dir, graph)) = sample() else {
        return;
    };

    let test_struct = graph.type_symbol_by_name("TestStruct1");
    let alias = graph.type_symbol_by_name("TestStruct1Alias");
    assert_eq!(alias.kind, TypeKind::Typedef);
    assert_eq!(alias.typedef_source, test_struct.id);
    assert_eq!(alias.length, test_struct.length);

    let callback = graph.type_symbol_by_name("Callback");
    assert_eq!(callback.kind, TypeKind::Typedef);
    assert_eq!(graph.type_symbols[&callback.typedef_source].kind, TypeKind::Pointer);

    // a bare function signature has nothing to alias
    let handler = graph.type_symbol_by_name("Handler");
    assert_eq!(handler.kind, TypeKind::Typedef);
    assert_eq!(handler.typedef_source, 0);
    assert_eq!(handler.length, 0);
}

#[test]
fn test_sample_functions() {
    let Some((_dir, graph)) = sample() else {
        return;
    };

    let int = graph.type_symbol_by_name("int32_t");
    assert_eq!(int.kind, TypeKind::Base);
    assert_eq!(int.length, 4);

    let add = graph.function_symbol_by_name("add_two_ints");
    assert_eq!(add.argument_count, 2);
    assert_eq!(add.argument_type_ids, vec![int.id, int.id]);
    assert_eq!(add.return_type_id, int.id);
    assert_ne!(add.virtual_address, 0);

    let sum = graph.function_symbol_by_name("sum_all");
    assert_eq!(sum.argument_type_ids, vec![int.id, 0]);

    let no_args = graph.function_symbol_by_name("no_args");
    assert_ne!(no_args.id, 0);
    assert_eq!(no_args.argument_count, 0);
    assert_eq!(no_args.return_type_id, 0);

    // out-of-line member definition: name and return type come from the
    // declaration, `this` comes first
    let scale = graph.function_symbol_by_name("Scale");
    assert_ne!(scale.id, 0);
    assert_eq!(scale.return_type_id, int.id);
    assert_eq!(scale.argument_count, 2);
    assert_eq!(graph.type_symbols[&scale.argument_type_ids[0]].kind, TypeKind::Pointer);
    assert_eq!(scale.argument_type_ids[1], int.id);
}

#[test]
fn test_sample_json_reads_back() {
    let Some((dir, mut graph)) = sample() else {
        return;
    };

    graph.set_serializer(Format::Json);
    graph.serialize(dir.path().join("sample")).unwrap();

    let loaded = load_from_file(dir.path().join("sample.json")).unwrap();
    assert_eq!(loaded.header, graph.header);
    assert_eq!(loaded.type_symbols, graph.type_symbols);
    assert_eq!(loaded.function_symbols, graph.function_symbols);
}
