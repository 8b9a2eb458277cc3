//! Conversion of raw symbol files into lookup tables.
//!
//! The actual file format is handled by a [`SymbolParser`]. Production uses [`SymCacheParser`],
//! which turns any native debug file that `symbolic` understands (Breakpad, ELF, MachO, PDB, ...)
//! into a SymCache.

use std::fmt;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use symbolic::common::{ByteView, SelfCell};
use symbolic::debuginfo::Object;
use symbolic::symcache::{SymCache, SymCacheConverter};
use tempfile::NamedTempFile;

use crate::caching::{CacheEntry, CacheError};

/// The result of looking up an address in a [`LookupTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Name of the function containing the address.
    pub function: String,
    /// Distance of the address from the start of the function.
    pub function_offset: u64,
}

/// A loaded, converted symbol file.
pub trait LookupTable: Send + Sync {
    /// Looks up a module-relative address.
    fn lookup(&self, offset: u64) -> Option<SymbolInfo>;
}

/// A symbol file format.
///
/// Conversion is CPU bound and may take several seconds for large modules. It is only ever called
/// from a blocking context.
pub trait SymbolParser: Send + Sync + 'static {
    /// Converts a raw symbol file into the artifact format, written to `output`.
    ///
    /// Fails with [`CacheError::Malformed`] if the input cannot be parsed.
    fn convert(&self, raw: &[u8], output: &mut dyn Write) -> CacheEntry;

    /// Loads an artifact previously written by [`convert`](Self::convert).
    fn load(&self, data: ByteView<'static>) -> CacheEntry<Arc<dyn LookupTable>>;
}

/// Runs a [`SymbolParser`] off the async runtime.
#[derive(Clone)]
pub struct Converter {
    parser: Arc<dyn SymbolParser>,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter").finish_non_exhaustive()
    }
}

impl Converter {
    pub fn new<P: SymbolParser>(parser: P) -> Self {
        Self {
            parser: Arc::new(parser),
        }
    }

    /// Converts the downloaded file `raw` into `artifact` and loads the result.
    ///
    /// The artifact is fully written and synced to disk before it is loaded, so it can be
    /// persisted into the cache right away.
    pub async fn convert(
        &self,
        raw: NamedTempFile,
        artifact: NamedTempFile,
    ) -> CacheEntry<(NamedTempFile, Arc<dyn LookupTable>)> {
        let parser = self.parser.clone();
        tokio::task::spawn_blocking(move || convert_blocking(&*parser, raw, artifact))
            .await
            .map_err(CacheError::from_std_error)?
    }

    /// Loads an artifact from the cache.
    ///
    /// This blocks on file system I/O.
    pub fn load(&self, path: &Path) -> CacheEntry<Arc<dyn LookupTable>> {
        let data = ByteView::open(path)?;
        self.parser.load(data)
    }
}

fn convert_blocking(
    parser: &dyn SymbolParser,
    raw: NamedTempFile,
    mut artifact: NamedTempFile,
) -> CacheEntry<(NamedTempFile, Arc<dyn LookupTable>)> {
    let data = ByteView::open(raw.path())?;

    let mut writer = BufWriter::new(artifact.as_file_mut());
    parser.convert(&data, &mut writer)?;
    let file = writer.into_inner().map_err(io::Error::from)?;
    file.sync_all()?;

    // the raw download is not needed anymore
    drop(data);
    drop(raw);

    let table = parser.load(ByteView::open(artifact.path())?)?;
    Ok((artifact, table))
}

pub type OwnedSymCache = SelfCell<ByteView<'static>, SymCache<'static>>;

/// Converts native debug files into SymCaches.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymCacheParser;

impl SymbolParser for SymCacheParser {
    fn convert(&self, raw: &[u8], output: &mut dyn Write) -> CacheEntry {
        let object = Object::parse(raw).map_err(|e| {
            tracing::debug!(error = &e as &dyn std::error::Error, "Could not parse symbol file");
            CacheError::Malformed(e.to_string())
        })?;

        let mut converter = SymCacheConverter::new();
        converter.process_object(&object).map_err(|e| {
            let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
            tracing::error!(error = dynerr, "Could not process SymCache");

            CacheError::Malformed(e.to_string())
        })?;

        let mut output = output;
        converter.serialize(&mut output)?;
        Ok(())
    }

    fn load(&self, data: ByteView<'static>) -> CacheEntry<Arc<dyn LookupTable>> {
        let symcache = SelfCell::try_new(data, |p| unsafe {
            SymCache::parse(&*p).map_err(|e| {
                tracing::error!(error = %e, "Failed to load SymCache");
                CacheError::InternalError
            })
        })?;
        Ok(Arc::new(SymCacheTable(symcache)))
    }
}

struct SymCacheTable(OwnedSymCache);

impl LookupTable for SymCacheTable {
    fn lookup(&self, offset: u64) -> Option<SymbolInfo> {
        // Inlined frames come first, the last location is the function the address belongs to.
        let location = self.0.get().lookup(offset).last()?;
        let function = location.function();
        let name = function.name();
        if name.is_empty() {
            return None;
        }

        Some(SymbolInfo {
            function: name.to_owned(),
            function_offset: offset.saturating_sub(function.entry_pc() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BREAKPAD: &str = "\
MODULE Linux x86_64 3249D99D0C4049318610F4E4FB0B69361 libtest.so
FILE 0 src/main.c
FUNC 1000 20 0 main
1000 10 3 0
1010 10 4 0
FUNC 1020 30 0 run_loop
1020 30 12 0
";

    fn tempfile_with(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[tokio::test]
    async fn test_convert_breakpad() {
        let converter = Converter::new(SymCacheParser);
        let raw = tempfile_with(BREAKPAD.as_bytes());
        let artifact = NamedTempFile::new().unwrap();

        let (artifact, table) = converter.convert(raw, artifact).await.unwrap();

        assert_eq!(
            table.lookup(0x1004),
            Some(SymbolInfo {
                function: "main".into(),
                function_offset: 4,
            })
        );
        assert_eq!(
            table.lookup(0x1031),
            Some(SymbolInfo {
                function: "run_loop".into(),
                function_offset: 0x11,
            })
        );
        assert_eq!(table.lookup(0x10), None);

        // the persisted artifact loads to the same table
        let reloaded = converter.load(artifact.path()).unwrap();
        assert_eq!(reloaded.lookup(0x1004), table.lookup(0x1004));
    }

    #[tokio::test]
    async fn test_convert_malformed() {
        let converter = Converter::new(SymCacheParser);
        let raw = tempfile_with(b"this is not a symbol file");
        let artifact = NamedTempFile::new().unwrap();

        let result = converter.convert(raw, artifact).await;
        assert!(matches!(result, Err(CacheError::Malformed(_))));
    }

    #[test]
    fn test_load_garbage() {
        let converter = Converter::new(SymCacheParser);
        let file = tempfile_with(b"garbage");
        assert!(converter.load(file.path()).is_err());
    }
}
