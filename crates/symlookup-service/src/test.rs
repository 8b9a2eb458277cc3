//! Test helpers for the lookup service.
//!
//! [`FakeParser`] stands in for the real symbol file format, so the cache and lookup logic can be
//! tested with tiny hand written symbol files. A fake symbol file looks like this:
//!
//! ```text
//! FAKE
//! FUNC 1000 20 main
//! FUNC 1020 40 run_loop
//! ```
//!
//! where each `FUNC` line has a hexadecimal start address and size, followed by the name.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use symbolic::common::ByteView;

use crate::caching::{CacheEntry, CacheError};
use crate::convert::{LookupTable, SymbolInfo, SymbolParser};

const HEADER: &str = "FAKE";

/// Renders a fake symbol file from `(address, size, name)` triples.
pub fn fake_symbol_file(functions: &[(u64, u64, &str)]) -> String {
    let mut file = format!("{HEADER}\n");
    for (address, size, name) in functions {
        file.push_str(&format!("FUNC {address:x} {size:x} {name}\n"));
    }
    file
}

/// A [`SymbolParser`] for the fake symbol format that counts its conversions.
#[derive(Debug, Clone, Default)]
pub struct FakeParser {
    conversions: Arc<AtomicUsize>,
    delay: Duration,
}

impl FakeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every conversion take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The number of conversions run so far, including failed ones.
    pub fn conversions(&self) -> usize {
        self.conversions.load(Ordering::SeqCst)
    }
}

impl SymbolParser for FakeParser {
    fn convert(&self, raw: &[u8], output: &mut dyn Write) -> CacheEntry {
        self.conversions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let table = FakeTable::parse(raw)?;
        output.write_all(HEADER.as_bytes())?;
        output.write_all(b"\n")?;
        for (address, size, name) in &table.functions {
            writeln!(output, "FUNC {address:x} {size:x} {name}")?;
        }
        Ok(())
    }

    fn load(&self, data: ByteView<'static>) -> CacheEntry<Arc<dyn LookupTable>> {
        let table = FakeTable::parse(&data).map_err(|_| CacheError::InternalError)?;
        Ok(Arc::new(table))
    }
}

#[derive(Debug)]
struct FakeTable {
    functions: Vec<(u64, u64, String)>,
}

impl FakeTable {
    fn parse(raw: &[u8]) -> CacheEntry<Self> {
        let malformed = |reason: &str| CacheError::Malformed(reason.to_owned());

        let text = std::str::from_utf8(raw).map_err(|_| malformed("not utf-8"))?;
        let mut lines = text.lines();
        if lines.next() != Some(HEADER) {
            return Err(malformed("missing header"));
        }

        let mut functions = Vec::new();
        for line in lines.filter(|line| !line.trim().is_empty()) {
            let mut parts = line.splitn(4, ' ');
            let (Some("FUNC"), Some(address), Some(size), Some(name)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(malformed("invalid record"));
            };
            let address = u64::from_str_radix(address, 16).map_err(|_| malformed("address"))?;
            let size = u64::from_str_radix(size, 16).map_err(|_| malformed("size"))?;
            functions.push((address, size, name.to_owned()));
        }
        functions.sort_by_key(|(address, _, _)| *address);

        Ok(Self { functions })
    }
}

impl LookupTable for FakeTable {
    fn lookup(&self, offset: u64) -> Option<SymbolInfo> {
        let index = self
            .functions
            .partition_point(|(address, _, _)| *address <= offset)
            .checked_sub(1)?;
        let (address, size, name) = &self.functions[index];
        (offset < address + size).then(|| SymbolInfo {
            function: name.clone(),
            function_offset: offset - address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_parser() {
        let parser = FakeParser::new();
        let raw = fake_symbol_file(&[(0x1020, 0x40, "run_loop"), (0x1000, 0x20, "main")]);

        let mut artifact = Vec::new();
        parser.convert(raw.as_bytes(), &mut artifact).unwrap();
        assert_eq!(parser.conversions(), 1);

        let table = parser.load(ByteView::from_vec(artifact)).unwrap();
        assert_eq!(
            table.lookup(0x1024),
            Some(SymbolInfo {
                function: "run_loop".into(),
                function_offset: 4,
            })
        );
        assert_eq!(table.lookup(0x1000).unwrap().function, "main");
        assert_eq!(table.lookup(0x1060), None);
        assert_eq!(table.lookup(0x10), None);

        let result = parser.convert(b"MODULE whatever", &mut Vec::new());
        assert!(matches!(result, Err(CacheError::Malformed(_))));
        assert_eq!(parser.conversions(), 2);
    }
}
