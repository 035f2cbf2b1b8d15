//! section access for gimli over an `object` file
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection};

pub type DwarfReader = EndianRcSlice<RunTimeEndian>;

/// loader for `gimli::Dwarf::load`. missing sections load as empty, section
/// data is copied out so the reader owns it.
pub fn object_section_loader<'a>(
    object_file: &'a object::File<'_>,
) -> impl Fn(gimli::SectionId) -> Result<DwarfReader, gimli::Error> + 'a {
    let endianness = if object_file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    move |id: gimli::SectionId| {
        let section_name = id.name();
        let section_data = match object_file.section_by_name(section_name) {
            Some(section) => match section.uncompressed_data() {
                Ok(data) => data,
                Err(_) => {
                    log::warn!("decompress section fail, section: {}", section_name);
                    std::borrow::Cow::Borrowed(&[][..])
                }
            },
            None => std::borrow::Cow::Borrowed(&[][..]),
        };

        let rc_data = std::rc::Rc::from(section_data.into_owned());
        Ok(EndianRcSlice::new(rc_data, endianness))
    }
}
