//! debug info providers. each one walks a native format and feeds the
//! [`GraphBuilder`](crate::builder::GraphBuilder).
pub mod dwarf;
pub mod pdb;

use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::symbols::Usym;

pub use self::dwarf::DwarfProvider;
pub use self::pdb::PdbProvider;

/// leading bytes of an MSF 7.00 container
const PDB_SIGNATURE: &[u8] = b"Microsoft C/C++ MSF 7.00";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported debug info source: {0}")]
    UnsupportedFormat(String),
    #[error("object file: {0}")]
    Object(#[from] object::read::Error),
    #[error("DWARF: {0}")]
    Dwarf(#[from] gimli::Error),
    #[error("PDB: {0}")]
    Pdb(#[from] ::pdb::Error),
}

/// read the whole file through a memory map, copied out so the map is
/// released before parsing
pub fn load_file(path: &Path) -> Result<Vec<u8>, ProviderError> {
    log::debug!("load file: {}", path.display());

    let io_error = |source: std::io::Error| ProviderError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_error)?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(io_error)?;
    let data = mmap.to_vec();

    log::debug!("file load success, size: {} bytes", data.len());
    Ok(data)
}

/// build a symbol graph from a PDB, or from any object file `object` can
/// parse that carries DWARF
pub fn create_graph_from_file(path: &Path) -> Result<Usym, ProviderError> {
    let data = load_file(path)?;

    let is_pdb = data.starts_with(PDB_SIGNATURE)
        || path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdb"));

    if is_pdb {
        if !data.starts_with(PDB_SIGNATURE) {
            return Err(ProviderError::UnsupportedFormat(format!(
                "{} is not an MSF 7.00 program database",
                path.display()
            )));
        }
        log::info!("reading PDB {}", path.display());
        return PdbProvider::new(data).create_graph();
    }

    log::info!("reading DWARF from {}", path.display());
    DwarfProvider::new(data).create_graph()
}
