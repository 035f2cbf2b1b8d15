//! duplicate type elimination.
//!
//! providers hand out one id per native type record, so the same type can
//! show up several times (once per compile unit in DWARF, forward/definition
//! pairs in PDB). types are bucketed by a content hash and confirmed
//! structurally, every reference to a dropped id is rewritten to the survivor.
use serde::Serialize;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::symbols::{FieldSymbol, TypeSymbol, Usym};

/// the part of a type that decides equality. ids and the kind are left out.
#[derive(Serialize)]
struct CanonicalType<'a> {
    length: u64,
    field_count: u32,
    name: &'a str,
    fields: Vec<CanonicalField<'a>>,
    typedef_source: u32,
}

#[derive(Serialize)]
struct CanonicalField<'a> {
    underlying_type_id: u32,
    offset: i32,
    name: &'a str,
    is_anonymous_union: bool,
    union_id: u32,
}

impl<'a> From<&'a FieldSymbol> for CanonicalField<'a> {
    fn from(field: &'a FieldSymbol) -> Self {
        Self {
            underlying_type_id: field.underlying_type_id,
            offset: field.offset,
            name: &field.name,
            is_anonymous_union: field.is_anonymous_union,
            union_id: field.union_id,
        }
    }
}

fn content_hash(symbol: &TypeSymbol) -> u64 {
    use bincode::Options;
    use std::collections::hash_map::DefaultHasher;

    let canonical = CanonicalType {
        length: symbol.length,
        field_count: symbol.field_count,
        name: &symbol.name,
        fields: symbol.fields.iter().map(CanonicalField::from).collect(),
        typedef_source: symbol.typedef_source,
    };

    // an empty encoding only widens the bucket, the structural check still
    // decides
    let bytes = bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(&canonical)
        .unwrap_or_default();

    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

impl Usym {
    /// run [`Usym::purge_duplicate_types`] until a pass removes nothing.
    /// returns the total number of removed types.
    pub fn deduplicate(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let pass = self.purge_duplicate_types();
            if pass == 0 {
                break;
            }
            removed += pass;
        }
        removed
    }

    /// single pass: keep the lowest id of every structurally equal group,
    /// rewrite references to the others, then drop them.
    ///
    /// merging types can make their referrers equal, which only the next pass
    /// will see.
    pub fn purge_duplicate_types(&mut self) -> usize {
        let mut buckets: HashMap<u64, Vec<u32>> = HashMap::new();
        let mut replacements: HashMap<u32, u32> = HashMap::new();

        for (&id, symbol) in &self.type_symbols {
            let bucket = buckets.entry(content_hash(symbol)).or_default();
            let survivor = bucket.iter().copied().find(|candidate| {
                self.type_symbols
                    .get(candidate)
                    .is_some_and(|c| c.structurally_eq(symbol))
            });
            match survivor {
                Some(survivor) => {
                    log::trace!(
                        "{:>12} {:#010x} -> {:#010x}: {}",
                        "duplicate",
                        id,
                        survivor,
                        symbol.name
                    );
                    replacements.insert(id, survivor);
                }
                None => bucket.push(id),
            }
        }

        if replacements.is_empty() {
            return 0;
        }

        let rewrite = |reference: &mut u32| {
            if let Some(&survivor) = replacements.get(reference) {
                *reference = survivor;
            }
        };
        for symbol in self.type_symbols.values_mut() {
            symbol.type_references_mut().for_each(rewrite);
        }
        for function in self.function_symbols.values_mut() {
            function.type_references_mut().for_each(rewrite);
        }

        self.type_symbols
            .retain(|id, _| !replacements.contains_key(id));

        log::debug!(
            "dedup pass removed {} types, {} remain",
            replacements.len(),
            self.type_symbols.len()
        );
        replacements.len()
    }
}
