//! DWARF provider for ELF, Mach-O and PE images and relocatable objects
pub mod reader;
mod types;

pub use types::TypeResolver;

use anyhow::Result;
use gimli::{AttributeValue, DebuggingInformationEntry, Dwarf, ReaderOffset, UnitOffset};
use object::Object;
use std::path::Path;

use crate::builder::{Argument, FunctionNode, GraphBuilder};
use crate::provider::{ProviderError, load_file};
use crate::symbols::{Architecture, CallingConvention, Header, OriginalFormat, Usym};
use reader::DwarfReader;
use types::{attr_flag, attr_ref, is_type_tag};

// vendor calling convention codes emitted by clang and gcc for x86
const DW_CC_GNU_BORLAND_FASTCALL_I386: u8 = 0x41;
const DW_CC_BORLAND_STDCALL: u8 = 0xb1;
const DW_CC_BORLAND_MSFASTCALL: u8 = 0xb3;
const DW_CC_BORLAND_THISCALL: u8 = 0xb5;
const DW_CC_BORLAND_FASTCALL: u8 = 0xb6;

type Offset = UnitOffset<usize>;

pub struct DwarfProvider {
    data: Vec<u8>,
}

impl DwarfProvider {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        Ok(Self::new(load_file(path)?))
    }

    /// every type and every subprogram definition of every unit
    pub fn create_graph(&self) -> Result<Usym, ProviderError> {
        let object_file = object::File::parse(&*self.data)?;
        let architecture = architecture(object_file.architecture());
        let load_base = object_file.relative_address_base();

        let dwarf = Dwarf::load(reader::object_section_loader(&object_file))?;
        log::debug!("DWARF data load success");

        let mut builder = GraphBuilder::new(Header::new(OriginalFormat::Dwarf, architecture));
        let mut unit_iter = dwarf.units();
        let mut unit_count = 0;

        while let Some(header) = unit_iter.next()? {
            unit_count += 1;
            log::debug!("processing compilation unit {}", unit_count);

            let unit = match dwarf.unit(header) {
                Ok(unit) => unit,
                Err(err) => {
                    log::error!("skip compilation unit {}: {}", unit_count, err);
                    continue;
                }
            };
            let resolver = TypeResolver::new(&dwarf, &unit);

            if let Err(err) = self.extract_types_from_unit(&resolver, &mut builder) {
                log::error!("types of unit {} are incomplete: {:#}", unit_count, err);
            }
            if let Err(err) =
                self.extract_functions_from_unit(&resolver, &mut builder, architecture, load_base)
            {
                log::error!("functions of unit {} are incomplete: {:#}", unit_count, err);
            }
        }

        let graph = builder.finish();
        log::info!(
            "processed {} compilation units, extracted {} types, {} functions",
            unit_count,
            graph.type_symbols.len(),
            graph.function_symbols.len()
        );
        Ok(graph)
    }

    fn extract_types_from_unit(
        &self,
        resolver: &TypeResolver<DwarfReader>,
        builder: &mut GraphBuilder,
    ) -> Result<()> {
        let mut entries = resolver.unit().entries();

        while let Some((_, entry)) = entries.next_dfs()? {
            if !is_type_tag(entry.tag()) {
                continue;
            }
            // forward declarations are built only when something needs them
            if attr_flag(entry, gimli::DW_AT_declaration) {
                continue;
            }

            if let Err(err) = builder.build_type(resolver, &entry.offset()) {
                log::debug!(
                    "{:>12} {:#010x}: {:#}",
                    "skip type",
                    entry.offset().0.into_u64(),
                    err
                );
            }
        }

        Ok(())
    }

    fn extract_functions_from_unit(
        &self,
        resolver: &TypeResolver<DwarfReader>,
        builder: &mut GraphBuilder,
        architecture: Architecture,
        load_base: u64,
    ) -> Result<()> {
        let mut function_count = 0;
        let mut entries = resolver.unit().entries();

        // DWARF entries are tree-like. subprograms can be nested in namespaces
        // and classes, so walk the whole unit.
        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != gimli::DW_TAG_subprogram {
                continue;
            }

            // skip function declarations (keep only definitions)
            if attr_flag(entry, gimli::DW_AT_declaration) {
                log::trace!("skip function declaration at {:#010x}", entry.offset().0);
                continue;
            }

            // abstract inline instances carry no code
            if entry.attr_value(gimli::DW_AT_low_pc)?.is_none()
                && entry.attr_value(gimli::DW_AT_ranges)?.is_none()
            {
                log::trace!("skip subprogram without code at {:#010x}", entry.offset().0);
                continue;
            }

            let Some(id) = resolver.debug_info_id(entry.offset()) else {
                continue;
            };

            let Some(name) = self.get_function_name(resolver, entry) else {
                log::trace!("skip unnamed function at {:#010x}", entry.offset().0);
                continue;
            };

            let node = self.function_node(resolver, entry, id, name, architecture, load_base)?;
            builder.build_function(resolver, node);
            function_count += 1;
        }

        log::debug!("{:>12} {} functions", "DONE", function_count);
        Ok(())
    }

    fn function_node(
        &self,
        resolver: &TypeResolver<DwarfReader>,
        entry: &DebuggingInformationEntry<DwarfReader>,
        id: u32,
        name: String,
        architecture: Architecture,
        load_base: u64,
    ) -> Result<FunctionNode<Offset>> {
        // out-of-line definitions keep the return type and calling convention
        // on the declaration they refer to
        let declaration = [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin]
            .into_iter()
            .find_map(|attr| attr_ref(entry, attr).ok().flatten())
            .and_then(|offset| resolver.entry_at(offset).ok());

        let return_type = match attr_ref(entry, gimli::DW_AT_type)? {
            Some(ty) => Some(ty),
            None => match &declaration {
                Some(decl) => attr_ref(decl, gimli::DW_AT_type)?,
                None => None,
            },
        };

        let convention = convention_attr(entry)
            .or_else(|| declaration.as_ref().and_then(|decl| convention_attr(decl)));

        let (receiver, arguments) = self.extract_parameters(resolver, entry)?;

        let virtual_address = self
            .low_pc(resolver, entry)?
            .map(|pc| pc.saturating_sub(load_base))
            .unwrap_or(0);

        Ok(FunctionNode {
            id,
            name,
            return_type,
            receiver,
            arguments,
            calling_convention: calling_convention(convention, architecture),
            virtual_address,
        })
    }

    fn low_pc(
        &self,
        resolver: &TypeResolver<DwarfReader>,
        entry: &DebuggingInformationEntry<DwarfReader>,
    ) -> Result<Option<u64>> {
        if let Some(value) = entry.attr_value(gimli::DW_AT_low_pc)? {
            return Ok(resolver.dwarf().attr_address(resolver.unit(), value)?);
        }

        let mut ranges = resolver.dwarf().die_ranges(resolver.unit(), entry)?;
        Ok(ranges.next()?.map(|range| range.begin))
    }

    // attempt to extract the function name from the entry or the entries it
    // refers to, falling back to the linkage name
    fn get_function_name(
        &self,
        resolver: &TypeResolver<DwarfReader>,
        entry: &DebuggingInformationEntry<DwarfReader>,
    ) -> Option<String> {
        if let Some(name) = resolver.entry_name(entry) {
            return Some(name);
        }

        for attr in [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin] {
            let referenced = attr_ref(entry, attr)
                .ok()
                .flatten()
                .and_then(|offset| resolver.entry_at(offset).ok());
            if let Some(name) = referenced.and_then(|r| resolver.entry_name(&r)) {
                log::trace!(
                    "use {} name for subprogram @{:#010x}: {}",
                    attr,
                    entry.offset().0,
                    name
                );
                return Some(name);
            }
        }

        resolver.attr_string(entry, gimli::DW_AT_linkage_name)
    }

    /// parameters are direct children of the subprogram. the receiver is the
    /// `DW_AT_object_pointer` target or a leading artificial parameter, and
    /// `DW_TAG_unspecified_parameters` (`...`) becomes an untyped argument.
    fn extract_parameters(
        &self,
        resolver: &TypeResolver<DwarfReader>,
        func_entry: &DebuggingInformationEntry<DwarfReader>,
    ) -> Result<(Option<Offset>, Vec<Argument<Offset>>)> {
        let mut receiver = None;
        let mut arguments = Vec::new();
        let object_pointer = attr_ref(func_entry, gimli::DW_AT_object_pointer)?;

        let mut tree = resolver.unit().entries_tree(Some(func_entry.offset()))?;
        let func_node = tree.root()?;

        let mut children = func_node.children();
        while let Some(child) = children.next()? {
            let child_entry = child.entry();

            match child_entry.tag() {
                gimli::DW_TAG_formal_parameter => {
                    let ty = attr_ref(child_entry, gimli::DW_AT_type)?;
                    let leading = receiver.is_none() && arguments.is_empty();
                    let is_receiver = leading
                        && (object_pointer == Some(child_entry.offset())
                            || attr_flag(child_entry, gimli::DW_AT_artificial));

                    match (is_receiver, ty) {
                        (true, Some(ty)) => receiver = Some(ty),
                        (false, Some(ty)) => arguments.push(Argument::Typed(ty)),
                        (_, None) => arguments.push(Argument::Untyped(None)),
                    }
                }
                gimli::DW_TAG_unspecified_parameters => arguments.push(Argument::Untyped(None)),
                _ => {
                    log::trace!(
                        "non parameter tag {} @{:#010x}",
                        child_entry.tag(),
                        child_entry.offset().0,
                    );
                }
            }
        }

        Ok((receiver, arguments))
    }
}

fn architecture(architecture: object::Architecture) -> Architecture {
    match architecture {
        object::Architecture::I386 => Architecture::X86,
        object::Architecture::X86_64 => Architecture::X86_64,
        object::Architecture::Arm => Architecture::Arm32,
        object::Architecture::Aarch64 => Architecture::Arm64,
        _ => Architecture::Unknown,
    }
}

fn convention_attr(entry: &DebuggingInformationEntry<DwarfReader>) -> Option<gimli::DwCc> {
    match entry.attr_value(gimli::DW_AT_calling_convention).ok().flatten()? {
        AttributeValue::CallingConvention(cc) => Some(cc),
        other => other
            .udata_value()
            .and_then(|value| u8::try_from(value).ok())
            .map(gimli::DwCc),
    }
}

/// `DW_CC_normal`, absent, and anything unrecognised use the platform C
/// convention
fn calling_convention(convention: Option<gimli::DwCc>, architecture: Architecture) -> CallingConvention {
    match convention.map(|cc| cc.0) {
        Some(DW_CC_BORLAND_STDCALL) => CallingConvention::NearStd,
        Some(DW_CC_BORLAND_MSFASTCALL | DW_CC_BORLAND_FASTCALL | DW_CC_GNU_BORLAND_FASTCALL_I386) => {
            CallingConvention::NearFast
        }
        Some(DW_CC_BORLAND_THISCALL) => CallingConvention::Thiscall,
        _ if architecture == Architecture::Unknown => CallingConvention::Unknown,
        _ => CallingConvention::NearC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_mapping() {
        assert_eq!(architecture(object::Architecture::X86_64), Architecture::X86_64);
        assert_eq!(architecture(object::Architecture::I386), Architecture::X86);
        assert_eq!(architecture(object::Architecture::Aarch64), Architecture::Arm64);
        assert_eq!(architecture(object::Architecture::Riscv64), Architecture::Unknown);
    }

    #[test]
    fn test_calling_convention_mapping() {
        assert_eq!(
            calling_convention(None, Architecture::X86_64),
            CallingConvention::NearC
        );
        assert_eq!(
            calling_convention(Some(gimli::DW_CC_normal), Architecture::Arm64),
            CallingConvention::NearC
        );
        assert_eq!(
            calling_convention(Some(gimli::DwCc(0xb1)), Architecture::X86),
            CallingConvention::NearStd
        );
        assert_eq!(
            calling_convention(Some(gimli::DwCc(0xb5)), Architecture::X86),
            CallingConvention::Thiscall
        );
        assert_eq!(
            calling_convention(None, Architecture::Unknown),
            CallingConvention::Unknown
        );
    }

    #[test]
    fn test_object_without_debug_info_is_empty() {
        // smallest ELF object `object` accepts: just the header
        let mut elf = vec![0u8; 64];
        elf[..4].copy_from_slice(b"\x7fELF");
        elf[4] = 2; // 64-bit
        elf[5] = 1; // little-endian
        elf[6] = 1; // version
        elf[16] = 1; // ET_REL
        elf[18] = 62; // EM_X86_64
        elf[20] = 1; // version
        elf[52] = 64; // e_ehsize

        let graph = DwarfProvider::new(elf).create_graph().unwrap();
        assert_eq!(graph.header.original_format, OriginalFormat::Dwarf);
        assert_eq!(graph.header.architecture, Architecture::X86_64);
        assert!(graph.type_symbols.is_empty());
        assert!(graph.function_symbols.is_empty());
    }
}
