//! CSV streaming, atomic rewrites and the append-only scan output.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use csv::{ByteRecord, StringRecord};
use uuid::Uuid;

/// Column-name index shared by every row of one file.
#[derive(Debug, Clone)]
pub struct Header {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Header {
    pub fn new(record: &StringRecord) -> Self {
        let names: Vec<String> = record.iter().map(|n| n.trim().to_string()).collect();
        let mut index = HashMap::with_capacity(names.len());
        for (pos, name) in names.iter().enumerate() {
            // duplicate header names: the first column wins
            index.entry(name.clone()).or_insert(pos);
        }
        Self { names, index }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }
}

/// One data row projected through its file header.
#[derive(Debug, Clone)]
pub struct Row {
    header: Arc<Header>,
    record: StringRecord,
}

impl Row {
    pub fn new(header: Arc<Header>, record: StringRecord) -> Self {
        Self { header, record }
    }

    /// Build a standalone row from column names and cell values.
    pub fn from_cells(columns: &[&str], cells: &[&str]) -> Self {
        let header = Header::new(&StringRecord::from(columns.to_vec()));
        Self::new(Arc::new(header), StringRecord::from(cells.to_vec()))
    }

    /// Trimmed, non-empty cell value. Missing columns and blank cells are
    /// both reported as `None`.
    pub fn get(&self, column: &str) -> Option<&str> {
        let pos = self.header.position(column)?;
        let value = self.record.get(pos)?.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("nan") {
            None
        } else {
            Some(value)
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.record.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }
}

/// Streams a CSV file in fixed-size chunks of rows.
pub struct ChunkedReader {
    reader: csv::Reader<File>,
    header: Arc<Header>,
    chunk_size: usize,
    path: PathBuf,
    done: bool,
}

impl ChunkedReader {
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(file);
        let header = reader
            .byte_headers()
            .map(|h| StringRecord::from_byte_record_lossy(h.clone()))
            .with_context(|| format!("reading header of {}", path.display()))?;
        Ok(Self {
            reader,
            header: Arc::new(Header::new(&header)),
            chunk_size: chunk_size.max(1),
            path,
            done: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Read every remaining row; only for inputs known to be small.
    pub fn read_all(self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for chunk in self {
            rows.extend(chunk?);
        }
        Ok(rows)
    }
}

impl Iterator for ChunkedReader {
    type Item = Result<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.chunk_size.min(4096));
        let mut raw = ByteRecord::new();
        while chunk.len() < self.chunk_size {
            match self.reader.read_byte_record(&mut raw) {
                Ok(true) => {
                    let record = StringRecord::from_byte_record_lossy(raw.clone());
                    chunk.push(Row::new(self.header.clone(), record));
                }
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(err) => {
                    self.done = true;
                    return Some(
                        Err(err).with_context(|| format!("reading {}", self.path.display())),
                    );
                }
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

/// Rewrite `path` in full via a sibling temp file and an atomic rename.
pub fn write_atomic<I, R>(path: impl AsRef<Path>, header: &[&str], rows: I) -> Result<()>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator,
    R::Item: AsRef<[u8]>,
{
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).with_context(|| format!("creating {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let result = (|| -> Result<()> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(header)
            .with_context(|| format!("writing header to {}", temp_path.display()))?;
        for row in rows {
            writer
                .write_record(row)
                .with_context(|| format!("writing row to {}", temp_path.display()))?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing {}: {}", temp_path.display(), e.error()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", temp_path.display()))?;
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Append-only CSV output. The header is written exactly once, and every
/// appended row is flushed to disk before `append` returns.
#[derive(Debug)]
pub struct AppendSink {
    file: File,
    path: PathBuf,
    offset: u64,
}

impl AppendSink {
    /// Open the output and cut it back to `committed` bytes.
    ///
    /// Anything past the committed offset was written after the last
    /// checkpoint (or torn by a crash) and is discarded. A committed offset of
    /// zero starts a fresh file with a header.
    pub fn open(path: impl AsRef<Path>, header: &[&str], committed: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("inspecting {}", path.display()))?
            .len();
        if committed > len {
            anyhow::bail!(
                "{} is shorter ({len} bytes) than its committed offset {committed}",
                path.display()
            );
        }
        if len != committed {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = len - committed,
                "discarding uncommitted tail of scan output"
            );
            file.set_len(committed)
                .with_context(|| format!("truncating {}", path.display()))?;
        }
        file.seek(SeekFrom::Start(committed))
            .with_context(|| format!("seeking {}", path.display()))?;

        let mut sink = Self {
            file,
            path,
            offset: committed,
        };
        if committed == 0 {
            sink.append(header)?;
        }
        Ok(sink)
    }

    /// Append one row and return the byte offset just past it.
    pub fn append<R>(&mut self, row: R) -> Result<u64>
    where
        R: IntoIterator,
        R::Item: AsRef<[u8]>,
    {
        let mut buf = csv::Writer::from_writer(Vec::new());
        buf.write_record(row)
            .with_context(|| format!("encoding row for {}", self.path.display()))?;
        let bytes = buf
            .into_inner()
            .map_err(|e| anyhow::anyhow!("encoding row: {}", e.error()))?;
        self.file
            .write_all(&bytes)
            .with_context(|| format!("appending to {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("syncing {}", self.path.display()))?;
        self.offset += bytes.len() as u64;
        Ok(self.offset)
    }
}
