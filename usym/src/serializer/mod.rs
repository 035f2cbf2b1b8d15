//! serialization framework: a [`Format`] picks a [`Codec`], and a
//! [`Serializer`] drives it through header, types, functions and the final
//! write.
mod binary;
mod json;

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::symbols::{FunctionSymbol, Header, TypeSymbol, Usym};

pub use binary::BinaryCodec;
pub use json::JsonCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    Binary,
    #[default]
    Json,
}

impl Format {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "binary" | "usym" => Some(Self::Binary),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }

    /// file extension appended to the output base name
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Binary => "usym",
            Self::Json => "json",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "usym" => Some(Self::Binary),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// a fresh codec for this format
    pub fn codec(&self) -> Box<dyn Codec> {
        match self {
            Self::Binary => Box::new(BinaryCodec::default()),
            Self::Json => Box::new(JsonCodec::default()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("unknown serialization failure")]
    Unknown,
    #[error("no serializer selected for the symbol graph")]
    SerializerUninitialized,
    #[error("no target file, setup was not called or the output name was empty")]
    NoTargetFile,
    #[error("no symbol graph bound to the serializer")]
    NoData,
    #[error("failed to write {}: {source}", path.display())]
    FileCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize header: {0}")]
    HeaderFailed(String),
    #[error("failed to serialize type symbols: {0}")]
    TypeSymbolsFailed(String),
    #[error("failed to serialize function symbols: {0}")]
    FunctionSymbolsFailed(String),
}

pub type SerializeResult = std::result::Result<(), SerializeError>;

/// one output encoding, fed in stage order by [`Serializer`]
pub trait Codec {
    fn serialize_header(&mut self, header: &Header) -> Result<()>;

    fn serialize_type_symbols(&mut self, type_symbols: &BTreeMap<u32, TypeSymbol>) -> Result<()>;

    fn serialize_function_symbols(
        &mut self,
        function_symbols: &BTreeMap<u32, FunctionSymbol>,
    ) -> Result<()>;

    /// flush everything staged so far to `path`
    fn write_to_file(&mut self, path: &Path) -> io::Result<()>;
}

pub struct Serializer<'g> {
    format: Format,
    codec: Box<dyn Codec>,
    target: Option<PathBuf>,
    graph: Option<&'g Usym>,
}

impl<'g> Serializer<'g> {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            codec: format.codec(),
            target: None,
            graph: None,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// bind `<base_output_name>.<extension>` and the graph to write. an empty
    /// base leaves the serializer without a target.
    pub fn setup(&mut self, base_output_name: impl AsRef<Path>, graph: Option<&'g Usym>) {
        let base = base_output_name.as_ref();
        self.target = if base.as_os_str().is_empty() {
            None
        } else {
            let mut target = base.as_os_str().to_owned();
            target.push(".");
            target.push(self.format.extension());
            Some(PathBuf::from(target))
        };
        self.graph = graph;
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    pub fn serialize_to_file(&mut self) -> SerializeResult {
        let Some(target) = self.target.as_deref() else {
            return Err(SerializeError::NoTargetFile);
        };
        let Some(graph) = self.graph else {
            return Err(SerializeError::NoData);
        };

        // stages append, so every run starts from a clean codec
        self.codec = self.format.codec();

        log::debug!(
            "{:>12} {} types, {} functions as {}",
            "serialize",
            graph.type_symbols.len(),
            graph.function_symbols.len(),
            self.format.as_str()
        );

        self.codec
            .serialize_header(&graph.header)
            .map_err(|err| SerializeError::HeaderFailed(format!("{err:#}")))?;
        self.codec
            .serialize_type_symbols(&graph.type_symbols)
            .map_err(|err| SerializeError::TypeSymbolsFailed(format!("{err:#}")))?;
        self.codec
            .serialize_function_symbols(&graph.function_symbols)
            .map_err(|err| SerializeError::FunctionSymbolsFailed(format!("{err:#}")))?;
        self.codec
            .write_to_file(target)
            .map_err(|source| SerializeError::FileCreationFailed {
                path: target.to_path_buf(),
                source,
            })?;

        log::info!("{:>12} {}", "wrote", target.display());
        Ok(())
    }
}

/// read a graph back from a file written by either codec. the codec is chosen
/// by extension, falling back to sniffing the magic.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Usym> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(Format::from_extension)
        .unwrap_or(if bytes.starts_with(b"USYM") {
            Format::Binary
        } else {
            Format::Json
        });

    let graph = match format {
        Format::Binary => binary::decode(&bytes),
        Format::Json => json::decode(&bytes),
    }
    .with_context(|| format!("failed to load {}", path.display()))?;

    Ok(graph)
}

pub(crate) fn check_magic(header: &Header) -> Result<()> {
    if header.magic != crate::symbols::MAGIC {
        bail!("bad magic {:#010x}, not a USYM file", header.magic);
    }
    Ok(())
}
