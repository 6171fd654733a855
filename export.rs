//! Export and import codecs.
//!
//! The binary format is canonical and round-trips losslessly; JSON and CSV
//! are interchange conveniences and lossy for arbitrary binary data. All
//! multi-byte integers in the binary format use native endianness: dumps are
//! produced and consumed on the same architecture.

use crate::api::Direction;
use crate::error::StoreError;
use crate::store::{Entry, Store, MAX_DATA_LEN};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

/// `"\0KVEVIDX"` read as a little-endian u64.
pub const EXPORT_MAGIC: u64 = 0x5844495645564B00;
pub const EXPORT_VERSION: u32 = 1;

/// Entries between progress callback invocations.
const PROGRESS_INTERVAL: u64 = 100;

/// Dump file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Binary,
    Json,
    Csv,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub start_key: u64,
    pub end_key: u64,
    /// Whether JSON/CSV rows carry `term` and `cmd` columns.
    pub include_metadata: bool,
    pub pretty: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Binary,
            start_key: 0,
            end_key: u64::MAX,
            include_metadata: true,
            pretty: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub format: ExportFormat,
    pub clear_before_import: bool,
    pub skip_duplicates: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Binary,
            clear_before_import: false,
            skip_duplicates: false,
        }
    }
}

/// Cooperative cancellation hook: invoked every 100 entries with the number
/// processed so far; returning `false` stops the operation at that boundary,
/// leaving partial work in place.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64) -> bool;

#[derive(Debug, Serialize, Deserialize)]
struct JsonDocument {
    format: String,
    version: u32,
    entries: Vec<JsonEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonEntry {
    key: u64,
    #[serde(default)]
    term: u64,
    #[serde(default)]
    cmd: u64,
    data: String,
}

impl Store {
    /// Writes the live entries of `[start_key, end_key]` to `path`.
    /// Returns the number of entries exported.
    pub fn export(
        &self,
        path: impl AsRef<Path>,
        options: &ExportOptions,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, StoreError> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        let result = match options.format {
            ExportFormat::Binary => self.export_binary(&mut writer, options, &mut progress),
            ExportFormat::Json => self.export_json(&mut writer, options, &mut progress),
            ExportFormat::Csv => self.export_csv(&mut writer, options, &mut progress),
        };
        writer.flush()?;
        if matches!(result, Err(StoreError::Cancelled)) {
            warn!(path = %path.as_ref().display(), "export cancelled by caller");
        }
        result
    }

    /// Loads entries from a dump produced by [`Store::export`].
    /// Returns the number of entries imported.
    pub fn import(
        &self,
        path: impl AsRef<Path>,
        options: &ImportOptions,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, StoreError> {
        if options.clear_before_import {
            debug!("clearing store before import");
            self.clear()?;
        }
        let file = File::open(path.as_ref())?;
        match options.format {
            ExportFormat::Binary => {
                self.import_binary(BufReader::new(file), options, &mut progress)
            }
            ExportFormat::Json => self.import_json(BufReader::new(file), options, &mut progress),
            ExportFormat::Csv => self.import_csv(BufReader::new(file), options, &mut progress),
        }
    }

    fn export_binary(
        &self,
        writer: &mut (impl Write + Seek),
        options: &ExportOptions,
        progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<u64, StoreError> {
        writer.write_all(&EXPORT_MAGIC.to_ne_bytes())?;
        writer.write_all(&EXPORT_VERSION.to_ne_bytes())?;
        writer.write_all(&0u32.to_ne_bytes())?; // reserved
        // Placeholder for the entry count, patched once the scan is done
        writer.write_all(&0u64.to_ne_bytes())?;

        let mut written = 0u64;
        for entry in self.range(options.start_key..=options.end_key, Direction::Forward)? {
            let entry = entry?;
            writer.write_all(&entry.key.to_ne_bytes())?;
            writer.write_all(&entry.term.to_ne_bytes())?;
            writer.write_all(&entry.cmd.to_ne_bytes())?;
            writer.write_all(&(entry.data.len() as u64).to_ne_bytes())?;
            writer.write_all(&entry.data)?;
            written += 1;
            check_progress(progress, written)?;
        }

        let end = writer.stream_position()?;
        writer.seek(SeekFrom::Start(16))?;
        writer.write_all(&written.to_ne_bytes())?;
        writer.seek(SeekFrom::Start(end))?;
        Ok(written)
    }

    fn export_json(
        &self,
        writer: &mut impl Write,
        options: &ExportOptions,
        progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<u64, StoreError> {
        let (nl, indent) = if options.pretty { ("\n", "  ") } else { ("", "") };
        write!(
            writer,
            "{{{nl}{indent}\"format\": \"kvidx-json\",{nl}{indent}\"version\": 1,{nl}{indent}\"entries\": [{nl}"
        )?;

        let mut written = 0u64;
        for entry in self.range(options.start_key..=options.end_key, Direction::Forward)? {
            let entry = entry?;
            if written > 0 {
                write!(writer, ",{nl}")?;
            }
            write!(writer, "{indent}{indent}{{\"key\": {}", entry.key)?;
            if options.include_metadata {
                write!(writer, ", \"term\": {}, \"cmd\": {}", entry.term, entry.cmd)?;
            }
            write!(writer, ", \"data\": \"{}\"}}", escape_json(&entry.data))?;
            written += 1;
            check_progress(progress, written)?;
        }
        write!(writer, "{nl}{indent}]{nl}}}{nl}")?;
        Ok(written)
    }

    fn export_csv(
        &self,
        writer: &mut impl Write,
        options: &ExportOptions,
        progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<u64, StoreError> {
        if options.include_metadata {
            writer.write_all(b"key,term,cmd,data\n")?;
        } else {
            writer.write_all(b"key,data\n")?;
        }

        let mut written = 0u64;
        for entry in self.range(options.start_key..=options.end_key, Direction::Forward)? {
            let entry = entry?;
            if options.include_metadata {
                write!(writer, "{},{},{},", entry.key, entry.term, entry.cmd)?;
            } else {
                write!(writer, "{},", entry.key)?;
            }
            writer.write_all(&csv_field(&entry.data))?;
            writer.write_all(b"\n")?;
            written += 1;
            check_progress(progress, written)?;
        }
        Ok(written)
    }

    fn import_binary(
        &self,
        mut reader: impl Read,
        options: &ImportOptions,
        progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<u64, StoreError> {
        let magic = read_u64(&mut reader)?;
        if magic != EXPORT_MAGIC {
            return Err(StoreError::InvalidArgument(
                "not a kvidx binary dump (bad magic)".into(),
            ));
        }
        let version = read_u32(&mut reader)?;
        if version != EXPORT_VERSION {
            return Err(StoreError::InvalidArgument(format!(
                "unsupported dump version {version}"
            )));
        }
        let _reserved = read_u32(&mut reader)?;
        let declared = read_u64(&mut reader)?;

        let mut imported = 0u64;
        for processed in 1..=declared {
            let key = read_u64(&mut reader)?;
            let term = read_u64(&mut reader)?;
            let cmd = read_u64(&mut reader)?;
            let data_len = read_u64(&mut reader)?;
            if data_len as usize > MAX_DATA_LEN {
                return Err(StoreError::InvalidArgument(format!(
                    "dump entry for key {key} declares oversized data ({data_len} bytes)"
                )));
            }
            let mut data = vec![0u8; data_len as usize];
            reader.read_exact(&mut data)?;
            if self.import_entry(&Entry::new(key, term, cmd, data), options)? {
                imported += 1;
            }
            check_progress(progress, processed)?;
        }
        Ok(imported)
    }

    fn import_json(
        &self,
        reader: impl Read,
        options: &ImportOptions,
        progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<u64, StoreError> {
        let document: JsonDocument = serde_json::from_reader(reader)?;
        if document.format != "kvidx-json" {
            return Err(StoreError::InvalidArgument(format!(
                "unexpected dump format {:?}",
                document.format
            )));
        }
        if document.version != 1 {
            return Err(StoreError::InvalidArgument(format!(
                "unsupported dump version {}",
                document.version
            )));
        }

        let mut imported = 0u64;
        let mut processed = 0u64;
        for row in document.entries {
            let data = json_string_to_bytes(&row.data)?;
            if self.import_entry(&Entry::new(row.key, row.term, row.cmd, data), options)? {
                imported += 1;
            }
            processed += 1;
            check_progress(progress, processed)?;
        }
        Ok(imported)
    }

    fn import_csv(
        &self,
        mut reader: impl Read,
        options: &ImportOptions,
        progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<u64, StoreError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        let mut records = parse_csv(&raw)?.into_iter();

        let header = records
            .next()
            .ok_or_else(|| StoreError::InvalidArgument("empty csv dump".into()))?;
        let has_metadata = match header.len() {
            4 => true,
            2 => false,
            n => {
                return Err(StoreError::InvalidArgument(format!(
                    "unexpected csv header with {n} columns"
                )))
            }
        };

        let mut imported = 0u64;
        let mut processed = 0u64;
        for record in records {
            let expected = if has_metadata { 4 } else { 2 };
            if record.len() != expected {
                return Err(StoreError::InvalidArgument(format!(
                    "csv record has {} fields, expected {expected}",
                    record.len()
                )));
            }
            let key = parse_u64_field(&record[0])?;
            let (term, cmd, data) = if has_metadata {
                (
                    parse_u64_field(&record[1])?,
                    parse_u64_field(&record[2])?,
                    record[3].clone(),
                )
            } else {
                (0, 0, record[1].clone())
            };
            if self.import_entry(&Entry::new(key, term, cmd, data), options)? {
                imported += 1;
            }
            processed += 1;
            check_progress(progress, processed)?;
        }
        Ok(imported)
    }

    fn import_entry(&self, entry: &Entry, options: &ImportOptions) -> Result<bool, StoreError> {
        match self.insert(entry.key, entry.term, entry.cmd, &entry.data) {
            Ok(()) => Ok(true),
            Err(StoreError::DuplicateKey) if options.skip_duplicates => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn check_progress(
    progress: &mut Option<ProgressFn<'_>>,
    processed: u64,
) -> Result<(), StoreError> {
    if processed % PROGRESS_INTERVAL == 0 {
        if let Some(callback) = progress.as_mut() {
            if !callback(processed) {
                return Err(StoreError::Cancelled);
            }
        }
    }
    Ok(())
}

/// Standard JSON escapes, plus `\uXXXX` for bytes below 32 and for 127.
/// Bytes 128..=255 map to U+0080..U+00FF, which keeps ASCII payloads
/// readable; arbitrary binary is documented as lossy in this format.
fn escape_json(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0..=31 | 127 => {
                out.push_str(&format!("\\u{byte:04x}"));
            }
            _ => out.push(byte as char),
        }
    }
    out
}

fn json_string_to_bytes(text: &str) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let code = ch as u32;
        if code > 0xFF {
            return Err(StoreError::InvalidArgument(format!(
                "non-byte character {ch:?} in data field"
            )));
        }
        out.push(code as u8);
    }
    Ok(out)
}

/// Quotes a CSV field if it contains a comma, quote, CR, or LF, doubling
/// embedded quotes.
fn csv_field(data: &[u8]) -> Vec<u8> {
    let needs_quoting = data
        .iter()
        .any(|&b| matches!(b, b',' | b'"' | b'\r' | b'\n'));
    if !needs_quoting {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len() + 2);
    out.push(b'"');
    for &byte in data {
        if byte == b'"' {
            out.push(b'"');
        }
        out.push(byte);
    }
    out.push(b'"');
    out
}

/// Byte-level CSV record parser for the dialect [`csv_field`] produces.
fn parse_csv(raw: &[u8]) -> Result<Vec<Vec<Vec<u8>>>, StoreError> {
    let mut records = Vec::new();
    let mut fields: Vec<Vec<u8>> = Vec::new();
    let mut field: Vec<u8> = Vec::new();
    let mut in_quotes = false;
    let mut i = 0;

    while i < raw.len() {
        let byte = raw[i];
        if in_quotes {
            if byte == b'"' {
                if raw.get(i + 1) == Some(&b'"') {
                    field.push(b'"');
                    i += 2;
                    continue;
                }
                in_quotes = false;
            } else {
                field.push(byte);
            }
            i += 1;
            continue;
        }
        match byte {
            b'"' if field.is_empty() => in_quotes = true,
            b',' => fields.push(std::mem::take(&mut field)),
            b'\r' => {}
            b'\n' => {
                fields.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut fields));
            }
            _ => field.push(byte),
        }
        i += 1;
    }
    if in_quotes {
        return Err(StoreError::InvalidArgument(
            "unterminated quoted csv field".into(),
        ));
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push(fields);
    }
    Ok(records)
}

fn parse_u64_field(field: &[u8]) -> Result<u64, StoreError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| StoreError::InvalidArgument("malformed numeric csv field".into()))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, StoreError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

fn read_u32(reader: &mut impl Read) -> Result<u32, StoreError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EngineType;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempdir::TempDir;

    fn memory_store() -> Store {
        Store::new("", EngineType::InMemory).unwrap()
    }

    #[test]
    fn binary_roundtrip_preserves_random_payloads() {
        let dir = TempDir::new("kvidx-export-test").unwrap();
        let dump = dir.path().join("dump.kvidx");
        let store = memory_store();

        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut originals = Vec::new();
        for key in 0..50u64 {
            let len = rng.gen_range(0..256);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let entry = Entry::new(key * 3, rng.gen(), rng.gen(), data);
            store
                .insert(entry.key, entry.term, entry.cmd, &entry.data)
                .unwrap();
            originals.push(entry);
        }

        let exported = store
            .export(&dump, &ExportOptions::default(), None)
            .unwrap();
        assert_eq!(exported, 50);

        let restored = memory_store();
        let imported = restored
            .import(&dump, &ImportOptions::default(), None)
            .unwrap();
        assert_eq!(imported, 50);

        for original in &originals {
            let found = restored.get(original.key).unwrap().unwrap();
            assert_eq!(&found, original);
        }
        assert_eq!(restored.key_count().unwrap(), 50);
    }

    #[test]
    fn binary_import_rejects_garbage() {
        let dir = TempDir::new("kvidx-export-test").unwrap();
        let dump = dir.path().join("dump.kvidx");
        std::fs::write(&dump, b"definitely not a dump file").unwrap();

        let store = memory_store();
        let err = store
            .import(&dump, &ImportOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn json_roundtrip_for_textual_data() {
        let dir = TempDir::new("kvidx-export-test").unwrap();
        let dump = dir.path().join("dump.json");
        let store = memory_store();
        store.insert(1, 7, 8, b"plain text").unwrap();
        store.insert(2, 0, 0, b"with \"quotes\" and \\slashes").unwrap();
        store.insert(3, 0, 0, &[0x01, 0x1F, 0x7F, 0x80, 0xFF]).unwrap();

        let options = ExportOptions {
            format: ExportFormat::Json,
            pretty: true,
            ..Default::default()
        };
        assert_eq!(store.export(&dump, &options, None).unwrap(), 3);

        let restored = memory_store();
        let import_options = ImportOptions {
            format: ExportFormat::Json,
            ..Default::default()
        };
        assert_eq!(restored.import(&dump, &import_options, None).unwrap(), 3);

        assert_eq!(restored.get(1).unwrap().unwrap().term, 7);
        assert_eq!(&restored.get(2).unwrap().unwrap().data[..], b"with \"quotes\" and \\slashes");
        assert_eq!(&restored.get(3).unwrap().unwrap().data[..], &[0x01, 0x1F, 0x7F, 0x80, 0xFF]);
    }

    #[test]
    fn json_without_metadata_defaults_term_and_cmd() {
        let dir = TempDir::new("kvidx-export-test").unwrap();
        let dump = dir.path().join("dump.json");
        let store = memory_store();
        store.insert(9, 42, 43, b"meta").unwrap();

        let options = ExportOptions {
            format: ExportFormat::Json,
            include_metadata: false,
            ..Default::default()
        };
        store.export(&dump, &options, None).unwrap();

        let restored = memory_store();
        restored
            .import(
                &dump,
                &ImportOptions {
                    format: ExportFormat::Json,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let entry = restored.get(9).unwrap().unwrap();
        assert_eq!(entry.term, 0);
        assert_eq!(entry.cmd, 0);
        assert_eq!(&entry.data[..], b"meta");
    }

    #[test]
    fn csv_roundtrip_quotes_awkward_fields() {
        let dir = TempDir::new("kvidx-export-test").unwrap();
        let dump = dir.path().join("dump.csv");
        let store = memory_store();
        store.insert(1, 0, 0, b"plain").unwrap();
        store.insert(2, 1, 2, b"comma, quote \" and\nnewline").unwrap();

        let options = ExportOptions {
            format: ExportFormat::Csv,
            ..Default::default()
        };
        assert_eq!(store.export(&dump, &options, None).unwrap(), 2);

        let restored = memory_store();
        let import_options = ImportOptions {
            format: ExportFormat::Csv,
            ..Default::default()
        };
        assert_eq!(restored.import(&dump, &import_options, None).unwrap(), 2);
        assert_eq!(
            &restored.get(2).unwrap().unwrap().data[..],
            b"comma, quote \" and\nnewline"
        );
        assert_eq!(restored.get(2).unwrap().unwrap().term, 1);
    }

    #[test]
    fn progress_callback_cancels_export() {
        let dir = TempDir::new("kvidx-export-test").unwrap();
        let dump = dir.path().join("dump.kvidx");
        let store = memory_store();
        for key in 0..250u64 {
            store.insert(key, 0, 0, b"x").unwrap();
        }

        let mut calls = 0u32;
        let mut cancel_after_first = |_processed: u64| {
            calls += 1;
            calls < 2
        };
        let err = store
            .export(
                &dump,
                &ExportOptions::default(),
                Some(&mut cancel_after_first),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(calls, 2);
    }

    #[test]
    fn import_skip_duplicates_keeps_existing_entries() {
        let dir = TempDir::new("kvidx-export-test").unwrap();
        let dump = dir.path().join("dump.kvidx");
        let source = memory_store();
        source.insert(1, 0, 0, b"from dump").unwrap();
        source.insert(2, 0, 0, b"fresh").unwrap();
        source.export(&dump, &ExportOptions::default(), None).unwrap();

        let target = memory_store();
        target.insert(1, 9, 9, b"already here").unwrap();

        let strict = target.import(&dump, &ImportOptions::default(), None);
        assert!(matches!(strict, Err(StoreError::DuplicateKey)));

        let lenient = ImportOptions {
            skip_duplicates: true,
            ..Default::default()
        };
        assert_eq!(target.import(&dump, &lenient, None).unwrap(), 1);
        assert_eq!(&target.get(1).unwrap().unwrap().data[..], b"already here");
        assert_eq!(&target.get(2).unwrap().unwrap().data[..], b"fresh");
    }
}
