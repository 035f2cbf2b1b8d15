use anyhow::{Result, anyhow, bail};
use gimli::{AttributeValue, DebuggingInformationEntry, DwAt, DwTag, Dwarf, ReaderOffset, Unit, UnitOffset};

use crate::builder::{FieldNode, Primitive, TypeNode, TypeShape, TypeSource};
use crate::symbols::TypeKind;

/// qualifier and typedef chains longer than this are treated as corrupt
const MAX_CHAIN_DEPTH: usize = 32;

/// tags that produce a type symbol when met at any depth of a unit
pub(crate) fn is_type_tag(tag: DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_base_type
            | gimli::DW_TAG_unspecified_type
            | gimli::DW_TAG_structure_type
            | gimli::DW_TAG_class_type
            | gimli::DW_TAG_union_type
            | gimli::DW_TAG_interface_type
            | gimli::DW_TAG_enumeration_type
            | gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_reference_type
            | gimli::DW_TAG_rvalue_reference_type
            | gimli::DW_TAG_ptr_to_member_type
            | gimli::DW_TAG_typedef
            | gimli::DW_TAG_array_type
    )
}

fn is_qualifier_tag(tag: DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type
            | gimli::DW_TAG_atomic_type
            | gimli::DW_TAG_immutable_type
    )
}

fn is_pointer_tag(tag: DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_reference_type
            | gimli::DW_TAG_rvalue_reference_type
            | gimli::DW_TAG_ptr_to_member_type
    )
}

/// check if an attribute is a flag and is true
pub(crate) fn attr_flag<R: gimli::Reader>(entry: &DebuggingInformationEntry<R>, name: DwAt) -> bool {
    let Ok(Some(value)) = entry.attr_value(name) else {
        return false;
    };

    match value {
        AttributeValue::Flag(flag) => flag,
        AttributeValue::Data1(value) => value != 0,
        AttributeValue::Data2(value) => value != 0,
        AttributeValue::Data4(value) => value != 0,
        AttributeValue::Data8(value) => value != 0,
        AttributeValue::Sdata(value) => value != 0,
        AttributeValue::Udata(value) => value != 0,
        _ => false,
    }
}

/// unit-local reference held by `name`. references into other units are not
/// followed.
pub(crate) fn attr_ref<R: gimli::Reader>(
    entry: &DebuggingInformationEntry<R>,
    name: DwAt,
) -> Result<Option<UnitOffset<R::Offset>>> {
    match entry.attr_value(name)? {
        Some(AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
        Some(_) => {
            log::trace!(
                "skip non unit-local {} reference @{:#010x}",
                name,
                entry.offset().0.into_u64()
            );
            Ok(None)
        }
        None => Ok(None),
    }
}

fn byte_size<R: gimli::Reader>(entry: &DebuggingInformationEntry<R>) -> Option<u64> {
    entry
        .attr(gimli::DW_AT_byte_size)
        .ok()
        .flatten()
        .and_then(|attr| attr.udata_value())
}

/// DWARF type entries of one unit as a [`TypeSource`]. handles are unit
/// offsets, ids are the matching `.debug_info` offsets.
pub struct TypeResolver<'dwarf, R: gimli::Reader> {
    dwarf: &'dwarf Dwarf<R>,
    unit: &'dwarf Unit<R>,
}

impl<'dwarf, R: gimli::Reader> TypeResolver<'dwarf, R> {
    pub fn new(dwarf: &'dwarf Dwarf<R>, unit: &'dwarf Unit<R>) -> Self {
        Self { dwarf, unit }
    }

    pub fn dwarf(&self) -> &'dwarf Dwarf<R> {
        self.dwarf
    }

    pub fn unit(&self) -> &'dwarf Unit<R> {
        self.unit
    }

    /// `None` for type-unit entries and offsets past 4 GiB
    pub fn debug_info_id(&self, offset: UnitOffset<R::Offset>) -> Option<u32> {
        let global = offset.to_debug_info_offset(&self.unit.header)?.0.into_u64();
        match u32::try_from(global) {
            Ok(id) => Some(id),
            Err(_) => {
                log::warn!("entry @{:#x} is outside the 32-bit id space", global);
                None
            }
        }
    }

    pub fn entry_at(
        &self,
        offset: UnitOffset<R::Offset>,
    ) -> Result<DebuggingInformationEntry<'dwarf, 'dwarf, R>> {
        let unit: &'dwarf Unit<R> = self.unit;
        let mut entries = unit.entries_at_offset(offset)?;
        let (_, entry) = entries
            .next_dfs()?
            .ok_or_else(|| anyhow!("no entry at offset {:#010x}", offset.0.into_u64()))?;
        Ok(entry.clone())
    }

    pub fn entry_name(&self, entry: &DebuggingInformationEntry<R>) -> Option<String> {
        self.attr_string(entry, gimli::DW_AT_name)
    }

    /// read a string attribute, inline or from `.debug_str`
    pub fn attr_string(&self, entry: &DebuggingInformationEntry<R>, name: DwAt) -> Option<String> {
        let value = entry.attr_value(name).ok().flatten()?;
        let raw = self.dwarf.attr_string(self.unit, value).ok()?;
        match raw.to_string_lossy() {
            Ok(cow) => Some(cow.into_owned()),
            Err(e) => {
                log::warn!("failed to decode string attribute: {:?}", e);
                None
            }
        }
    }

    fn address_size(&self) -> u64 {
        u64::from(self.unit.header.encoding().address_size)
    }

    /// follow const/volatile/restrict/atomic wrappers down to the qualified type
    fn strip_qualifiers(&self, mut offset: UnitOffset<R::Offset>) -> Result<UnitOffset<R::Offset>> {
        for _ in 0..MAX_CHAIN_DEPTH {
            let entry = self.entry_at(offset)?;
            if !is_qualifier_tag(entry.tag()) {
                return Ok(offset);
            }
            offset = attr_ref(&entry, gimli::DW_AT_type)?.ok_or_else(|| {
                anyhow!("qualified void @{:#010x}", offset.0.into_u64())
            })?;
        }
        bail!("qualifier chain too deep @{:#010x}", offset.0.into_u64())
    }

    fn primitive(&self, entry: &DebuggingInformationEntry<R>) -> Primitive {
        let name = self.entry_name(entry).unwrap_or_default();
        let size = byte_size(entry).unwrap_or(0);

        let Ok(Some(AttributeValue::Encoding(encoding))) = entry.attr_value(gimli::DW_AT_encoding)
        else {
            return Primitive::Other;
        };

        match encoding {
            gimli::DW_ATE_signed | gimli::DW_ATE_unsigned if name == "wchar_t" => Primitive::WChar,
            gimli::DW_ATE_signed | gimli::DW_ATE_signed_fixed => Primitive::Int,
            gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_fixed => Primitive::UInt,
            gimli::DW_ATE_signed_char => Primitive::Char,
            // plain char is unsigned on some targets
            gimli::DW_ATE_unsigned_char if name == "char" => Primitive::Char,
            gimli::DW_ATE_unsigned_char => Primitive::UInt,
            gimli::DW_ATE_float => Primitive::Float,
            gimli::DW_ATE_boolean => Primitive::Bool,
            gimli::DW_ATE_UTF => match size {
                1 => Primitive::Char8,
                2 => Primitive::Char16,
                4 => Primitive::Char32,
                _ => Primitive::Other,
            },
            _ => Primitive::Other,
        }
    }

    fn aggregate(
        &self,
        kind: TypeKind,
        offset: UnitOffset<R::Offset>,
    ) -> Result<TypeShape<UnitOffset<R::Offset>>> {
        Ok(TypeShape::Aggregate {
            kind,
            fields: self.extract_fields(offset)?,
        })
    }

    /// non-static data members in declaration order
    fn extract_fields(
        &self,
        offset: UnitOffset<R::Offset>,
    ) -> Result<Vec<Option<FieldNode<UnitOffset<R::Offset>>>>> {
        let mut fields = Vec::new();
        let mut tree = self.unit.entries_tree(Some(offset))?;
        let root = tree.root()?;

        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            // DWARF 4 static members
            if attr_flag(entry, gimli::DW_AT_external) || attr_flag(entry, gimli::DW_AT_declaration)
            {
                continue;
            }
            fields.push(self.extract_field(entry));
        }

        Ok(fields)
    }

    fn extract_field(
        &self,
        entry: &DebuggingInformationEntry<R>,
    ) -> Option<FieldNode<UnitOffset<R::Offset>>> {
        let id = self.debug_info_id(entry.offset())?;
        let name = self.entry_name(entry).unwrap_or_default();

        let ty = match attr_ref(entry, gimli::DW_AT_type) {
            Ok(Some(ty)) => ty,
            _ => {
                log::debug!("{:>12} {:#010x}: {} has no usable type", "member", id, name);
                return None;
            }
        };

        let location = entry
            .attr(gimli::DW_AT_data_member_location)
            .ok()
            .flatten()
            .and_then(|attr| attr.udata_value())
            .or_else(|| {
                entry
                    .attr(gimli::DW_AT_data_bit_offset)
                    .ok()
                    .flatten()
                    .and_then(|attr| attr.udata_value())
                    .map(|bits| bits / 8)
            })
            .unwrap_or(0);

        log::trace!("{:>12} {} @ {}", "member", name, location);
        Some(FieldNode {
            id,
            name,
            offset: i32::try_from(location).unwrap_or(i32::MAX),
            ty,
        })
    }

    /// `None` when the alias is of void or of a function signature
    fn typedef_target(
        &self,
        entry: &DebuggingInformationEntry<R>,
    ) -> Result<Option<UnitOffset<R::Offset>>> {
        let Some(target) = attr_ref(entry, gimli::DW_AT_type)? else {
            return Ok(None);
        };
        let resolved = self.strip_qualifiers(target)?;
        if self.entry_at(resolved)?.tag() == gimli::DW_TAG_subroutine_type {
            return Ok(None);
        }
        Ok(Some(target))
    }

    /// size of the type at `offset`, looking through aliases when the entry
    /// has no `DW_AT_byte_size` of its own
    fn size_of(&self, offset: UnitOffset<R::Offset>, depth: usize) -> u64 {
        if depth > MAX_CHAIN_DEPTH {
            return 0;
        }
        let Ok(entry) = self.entry_at(offset) else {
            return 0;
        };
        if let Some(size) = byte_size(&entry) {
            return size;
        }

        let tag = entry.tag();
        if is_pointer_tag(tag) {
            self.address_size()
        } else if tag == gimli::DW_TAG_typedef || is_qualifier_tag(tag) {
            match attr_ref(&entry, gimli::DW_AT_type) {
                Ok(Some(target)) => self.size_of(target, depth + 1),
                _ => 0,
            }
        } else if tag == gimli::DW_TAG_array_type {
            self.array_size(&entry, depth)
        } else {
            0
        }
    }

    fn array_size(&self, entry: &DebuggingInformationEntry<R>, depth: usize) -> u64 {
        let element_size = match attr_ref(entry, gimli::DW_AT_type) {
            Ok(Some(element)) => self.size_of(element, depth + 1),
            _ => 0,
        };
        let count = self.array_count(entry.offset()).unwrap_or(0);
        element_size.saturating_mul(count)
    }

    /// product of all subrange extents, 0 for flexible arrays
    fn array_count(&self, array_offset: UnitOffset<R::Offset>) -> Result<u64> {
        let mut tree = self.unit.entries_tree(Some(array_offset))?;
        let root = tree.root()?;

        let mut count: u64 = 1;
        let mut dimensions = 0;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            dimensions += 1;

            let extent = if let Some(n) = entry.attr(gimli::DW_AT_count)?.and_then(|a| a.udata_value()) {
                n
            } else if let Some(upper) = entry
                .attr(gimli::DW_AT_upper_bound)?
                .and_then(|a| a.udata_value())
            {
                let lower = entry
                    .attr(gimli::DW_AT_lower_bound)?
                    .and_then(|a| a.udata_value())
                    .unwrap_or(0);
                (upper + 1).saturating_sub(lower)
            } else {
                0
            };
            count = count.saturating_mul(extent);
        }

        Ok(if dimensions == 0 { 0 } else { count })
    }
}

impl<'dwarf, R: gimli::Reader> TypeSource for TypeResolver<'dwarf, R> {
    type Handle = UnitOffset<R::Offset>;

    fn type_id(&self, handle: &Self::Handle) -> Option<u32> {
        match self.strip_qualifiers(*handle) {
            Ok(offset) => self.debug_info_id(offset),
            Err(err) => {
                log::debug!("cannot resolve type @{:#010x}: {:#}", handle.0.into_u64(), err);
                None
            }
        }
    }

    fn describe(&self, handle: &Self::Handle) -> Result<TypeNode<Self::Handle>> {
        let offset = self.strip_qualifiers(*handle)?;
        let entry = self.entry_at(offset)?;
        let name = self.entry_name(&entry);
        let size = byte_size(&entry);

        let (length, shape) = match entry.tag() {
            gimli::DW_TAG_base_type => (size.unwrap_or(0), TypeShape::Base(self.primitive(&entry))),
            gimli::DW_TAG_unspecified_type => (0, TypeShape::Base(Primitive::Void)),
            gimli::DW_TAG_structure_type => (size.unwrap_or(0), self.aggregate(TypeKind::Struct, offset)?),
            gimli::DW_TAG_class_type => (size.unwrap_or(0), self.aggregate(TypeKind::Class, offset)?),
            gimli::DW_TAG_union_type => (size.unwrap_or(0), self.aggregate(TypeKind::Union, offset)?),
            gimli::DW_TAG_interface_type => {
                (size.unwrap_or(0), self.aggregate(TypeKind::Interface, offset)?)
            }
            // int-sized unless stated
            gimli::DW_TAG_enumeration_type => (size.unwrap_or(4), TypeShape::Enum),
            tag if is_pointer_tag(tag) => {
                (size.unwrap_or_else(|| self.address_size()), TypeShape::Pointer)
            }
            gimli::DW_TAG_typedef => (
                0,
                TypeShape::Typedef {
                    target: self.typedef_target(&entry)?,
                },
            ),
            gimli::DW_TAG_array_type => {
                (size.unwrap_or_else(|| self.array_size(&entry, 0)), TypeShape::Array)
            }
            gimli::DW_TAG_subroutine_type => {
                bail!("function signature @{:#010x} is not a type symbol", offset.0.into_u64())
            }
            tag => bail!("unsupported type tag {} @{:#010x}", tag, offset.0.into_u64()),
        };

        log::trace!(
            "{:>12} {:#010x}: {}",
            entry.tag(),
            offset.0.into_u64(),
            name.as_deref().unwrap_or("<anonymous>")
        );

        Ok(TypeNode { name, length, shape })
    }
}
