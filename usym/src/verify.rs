//! referential integrity of a symbol graph
use crate::symbols::Usym;

impl Usym {
    /// true when every non-zero type reference resolves to a type symbol and
    /// every type's `field_count` matches its fields. each problem is logged,
    /// the graph is never modified.
    pub fn verify_type_ids(&self) -> bool {
        let mut pure = true;

        for function in self.function_symbols.values() {
            for target in function.type_references() {
                if target != 0 && !self.type_symbols.contains_key(&target) {
                    log::error!(
                        "function {:#010x} {} references missing type {:#010x}",
                        function.id,
                        function.name,
                        target
                    );
                    pure = false;
                }
            }
        }

        for symbol in self.type_symbols.values() {
            for target in symbol.type_references() {
                if target != 0 && !self.type_symbols.contains_key(&target) {
                    log::error!(
                        "type {:#010x} {} references missing type {:#010x}",
                        symbol.id,
                        symbol.name,
                        target
                    );
                    pure = false;
                }
            }

            if symbol.field_count as usize != symbol.fields.len() {
                log::warn!(
                    "type {:#010x} {} declares {} fields but has {}",
                    symbol.id,
                    symbol.name,
                    symbol.field_count,
                    symbol.fields.len()
                );
                pure = false;
            }
        }

        pure
    }
}
