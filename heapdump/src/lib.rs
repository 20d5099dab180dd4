//! Heap dump parser library.
//!
//! A heap dump is an NDJSON file describing every object of a managed heap at
//! one instant: a header record, then one `object` record per heap object and
//! one `root` record per root handle. This library parses dumps from any
//! `Read`-able source, validates their internal references and writes them
//! back out.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use heapdump::HeapDump;
//!
//! let file = File::open("app.heapdump").unwrap();
//! let dump = HeapDump::parse(file).unwrap();
//!
//! println!("Runtime: {}", dump.header.runtime);
//! println!("Objects: {}", dump.objects.len());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read, Write};
use thiserror::Error;

/// Format tag every header must carry.
pub const FORMAT: &str = "heapdump";

/// Format version written by [`Header::new`].
pub const VERSION: &str = "1.0";

/// Errors that can occur during heap dump parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error at line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing header record")]
    MissingHeader,

    #[error("header must be first record, found at line {0}")]
    HeaderNotFirst(usize),

    #[error("duplicate header at line {0}")]
    DuplicateHeader(usize),

    #[error("unsupported format '{0}'")]
    UnsupportedFormat(String),

    #[error("duplicate object {id} at line {line}")]
    DuplicateObject { id: u64, line: usize },

    #[error("object {object_id} references non-existent object {referent_id}")]
    InvalidReferent { object_id: u64, referent_id: u64 },

    #[error("root references non-existent object {0}")]
    InvalidRoot(u64),

    #[error("unknown record type '{0}' at line {1}")]
    UnknownRecordType(String, usize),
}

/// Result type for heap dump parsing operations.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Errors that can occur during heap dump writing.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for heap dump writing operations.
pub type WriteResult<T> = std::result::Result<T, WriteError>;

// ============================================================================
// Record types
// ============================================================================

/// Heap dump header record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub format: String,
    pub version: String,
    /// Name of the runtime the heap was captured from.
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    /// Free-form label, e.g. the phase of the application the dump was taken in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Header {
    /// Create a header for the current format version.
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            format: FORMAT.to_string(),
            version: VERSION.to_string(),
            runtime: runtime.into(),
            tool_version: None,
            label: None,
        }
    }
}

/// A single heap object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Identity of the object, unique within the dump.
    pub id: u64,
    pub type_name: String,
    /// Size in bytes. Absent when the runtime could not size the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Whether the runtime's collector tracks this object as a container.
    #[serde(default = "default_true")]
    pub container: bool,
    /// Objects this object refers to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referents: Vec<u64>,
}

fn default_true() -> bool {
    true
}

/// A root handle keeping an object alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ============================================================================
// Record parsing helpers
// ============================================================================

/// Minimal record to determine the record type.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: String,
}

#[derive(Debug, Deserialize)]
struct HeaderRecord {
    #[serde(flatten)]
    header: Header,
}

#[derive(Debug, Deserialize)]
struct ObjectRecord {
    #[serde(flatten)]
    object: Object,
}

#[derive(Debug, Deserialize)]
struct RootRecord {
    #[serde(flatten)]
    root: Root,
}

fn parse_record<'a, T: Deserialize<'a>>(line: &'a str, line_num: usize) -> Result<T> {
    serde_json::from_str(line).map_err(|e| ParseError::Json {
        line: line_num,
        source: e,
    })
}

// ============================================================================
// Main HeapDump type
// ============================================================================

/// A parsed heap dump.
#[derive(Debug, Clone)]
pub struct HeapDump {
    pub header: Header,
    /// Objects keyed by identity.
    pub objects: HashMap<u64, Object>,
    /// Root handles in file order.
    pub roots: Vec<Root>,
}

impl HeapDump {
    /// Create an empty dump with the given header.
    pub fn new(header: Header) -> Self {
        Self {
            header,
            objects: HashMap::new(),
            roots: Vec::new(),
        }
    }

    /// Parse a heap dump from any `Read`-able source.
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        let buf_reader = BufReader::new(reader);
        let mut header: Option<Header> = None;
        let mut objects: HashMap<u64, Object> = HashMap::new();
        let mut roots: Vec<Root> = Vec::new();

        for (line_num, line_result) in buf_reader.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line_result?;

            if line.trim().is_empty() {
                continue;
            }

            let raw: RawRecord = parse_record(&line, line_num)?;

            match raw.record_type.as_str() {
                "header" => {
                    if header.is_some() {
                        return Err(ParseError::DuplicateHeader(line_num));
                    }
                    if line_num != 1 {
                        return Err(ParseError::HeaderNotFirst(line_num));
                    }
                    let record: HeaderRecord = parse_record(&line, line_num)?;
                    if record.header.format != FORMAT {
                        return Err(ParseError::UnsupportedFormat(record.header.format));
                    }
                    header = Some(record.header);
                }
                _ if header.is_none() => {
                    return Err(ParseError::HeaderNotFirst(line_num));
                }
                "object" => {
                    let record: ObjectRecord = parse_record(&line, line_num)?;
                    let id = record.object.id;
                    if objects.insert(id, record.object).is_some() {
                        return Err(ParseError::DuplicateObject { id, line: line_num });
                    }
                }
                "root" => {
                    let record: RootRecord = parse_record(&line, line_num)?;
                    roots.push(record.root);
                }
                other => {
                    return Err(ParseError::UnknownRecordType(other.to_string(), line_num));
                }
            }
        }

        let header = header.ok_or(ParseError::MissingHeader)?;

        let dump = HeapDump {
            header,
            objects,
            roots,
        };

        dump.validate()?;

        Ok(dump)
    }

    /// Check that every referent and root names an object of this dump.
    pub fn validate(&self) -> Result<()> {
        for object in self.objects.values() {
            for &referent_id in &object.referents {
                if !self.objects.contains_key(&referent_id) {
                    return Err(ParseError::InvalidReferent {
                        object_id: object.id,
                        referent_id,
                    });
                }
            }
        }

        for root in &self.roots {
            if !self.objects.contains_key(&root.id) {
                return Err(ParseError::InvalidRoot(root.id));
            }
        }

        Ok(())
    }

    /// Resolve an object ID to its record.
    pub fn resolve_object(&self, id: u64) -> Option<&Object> {
        self.objects.get(&id)
    }

    /// Get all objects of a specific type.
    pub fn objects_of_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a Object> {
        self.objects
            .values()
            .filter(move |o| o.type_name == type_name)
    }

    /// Objects that refer to `id`, in ascending ID order.
    pub fn referrers_of(&self, id: u64) -> Vec<u64> {
        let mut referrers: Vec<u64> = self
            .objects
            .values()
            .filter(|o| o.referents.contains(&id))
            .map(|o| o.id)
            .collect();
        referrers.sort_unstable();
        referrers
    }

    /// IDs of objects reachable from the roots.
    pub fn reachable(&self) -> HashSet<u64> {
        let mut seen: HashSet<u64> = HashSet::new();
        let mut stack: Vec<u64> = self.roots.iter().map(|r| r.id).collect();

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(object) = self.objects.get(&id) {
                stack.extend(object.referents.iter().copied());
            }
        }

        seen
    }

    /// Write this dump to a writer in NDJSON format.
    ///
    /// The header comes first, then objects in ascending ID order, then roots.
    pub fn write<W: Write>(&self, writer: W) -> WriteResult<()> {
        let mut dump_writer = HeapDumpWriter::new(writer);
        dump_writer.write_header(&self.header)?;

        let mut objects: Vec<_> = self.objects.values().collect();
        objects.sort_by_key(|o| o.id);
        for object in objects {
            dump_writer.write_object(object)?;
        }

        for root in &self.roots {
            dump_writer.write_root(root)?;
        }

        Ok(())
    }
}

// ============================================================================
// Writer types
// ============================================================================

/// Helper struct for writing typed records with "type" field.
#[derive(Serialize)]
struct TypedRecord<'a, T: Serialize> {
    #[serde(rename = "type")]
    record_type: &'a str,
    #[serde(flatten)]
    data: &'a T,
}

/// Writer for creating heap dumps incrementally.
///
/// Runtimes can stream their heap out object by object without building a
/// full [`HeapDump`] in memory first.
pub struct HeapDumpWriter<W: Write> {
    writer: W,
}

impl<W: Write> HeapDumpWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a header record. This should be called first.
    pub fn write_header(&mut self, header: &Header) -> WriteResult<()> {
        self.write_record("header", header)
    }

    pub fn write_object(&mut self, object: &Object) -> WriteResult<()> {
        self.write_record("object", object)
    }

    pub fn write_root(&mut self, root: &Root) -> WriteResult<()> {
        self.write_record("root", root)
    }

    fn write_record<T: Serialize>(&mut self, record_type: &str, data: &T) -> WriteResult<()> {
        let typed = TypedRecord { record_type, data };
        let json = serde_json::to_string(&typed)?;
        writeln!(self.writer, "{}", json)?;
        Ok(())
    }

    /// Consume this writer and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn minimal_dump() -> String {
        r#"{"type":"header","format":"heapdump","version":"1.0","runtime":"testvm"}"#.to_string()
    }

    #[test]
    fn parse_minimal_header() {
        let dump = HeapDump::parse(Cursor::new(minimal_dump())).unwrap();

        assert_eq!(dump.header.format, "heapdump");
        assert_eq!(dump.header.version, "1.0");
        assert_eq!(dump.header.runtime, "testvm");
        assert!(dump.objects.is_empty());
        assert!(dump.roots.is_empty());
    }

    #[test]
    fn parse_objects_and_roots() {
        let data = format!(
            "{}\n{}\n{}\n{}",
            minimal_dump(),
            r#"{"type":"object","id":1,"type_name":"list","size":72,"referents":[2]}"#,
            r#"{"type":"object","id":2,"type_name":"int","size":24,"container":false}"#,
            r#"{"type":"root","id":1,"name":"main"}"#
        );
        let dump = HeapDump::parse(Cursor::new(data)).unwrap();

        assert_eq!(dump.objects.len(), 2);
        assert_eq!(dump.objects[&1].type_name, "list");
        assert_eq!(dump.objects[&1].referents, vec![2]);
        assert!(dump.objects[&1].container);
        assert!(!dump.objects[&2].container);
        assert_eq!(dump.objects[&2].size, Some(24));
        assert_eq!(dump.roots[0].name.as_deref(), Some("main"));
    }

    #[test]
    fn size_is_optional() {
        let data = format!(
            "{}\n{}",
            minimal_dump(),
            r#"{"type":"object","id":7,"type_name":"opaque"}"#
        );
        let dump = HeapDump::parse(Cursor::new(data)).unwrap();

        assert_eq!(dump.objects[&7].size, None);
    }

    #[test]
    fn missing_header_fails() {
        let result = HeapDump::parse(Cursor::new(""));

        assert!(matches!(result, Err(ParseError::MissingHeader)));
    }

    #[test]
    fn non_header_first_fails() {
        let data = r#"{"type":"object","id":1,"type_name":"list"}"#;
        let result = HeapDump::parse(Cursor::new(data));

        assert!(matches!(result, Err(ParseError::HeaderNotFirst(1))));
    }

    #[test]
    fn duplicate_header_fails() {
        let data = format!("{}\n{}", minimal_dump(), minimal_dump());
        let result = HeapDump::parse(Cursor::new(data));

        assert!(matches!(result, Err(ParseError::DuplicateHeader(2))));
    }

    #[test]
    fn foreign_format_fails() {
        let data = r#"{"type":"header","format":"pprof","version":"1.0","runtime":"x"}"#;
        let result = HeapDump::parse(Cursor::new(data));

        assert!(matches!(result, Err(ParseError::UnsupportedFormat(f)) if f == "pprof"));
    }

    #[test]
    fn duplicate_object_fails() {
        let data = format!(
            "{}\n{}\n{}",
            minimal_dump(),
            r#"{"type":"object","id":1,"type_name":"list"}"#,
            r#"{"type":"object","id":1,"type_name":"dict"}"#
        );
        let result = HeapDump::parse(Cursor::new(data));

        assert!(matches!(
            result,
            Err(ParseError::DuplicateObject { id: 1, line: 3 })
        ));
    }

    #[test]
    fn invalid_referent_fails() {
        let data = format!(
            "{}\n{}",
            minimal_dump(),
            r#"{"type":"object","id":1,"type_name":"list","referents":[999]}"#
        );
        let result = HeapDump::parse(Cursor::new(data));

        assert!(matches!(
            result,
            Err(ParseError::InvalidReferent {
                object_id: 1,
                referent_id: 999
            })
        ));
    }

    #[test]
    fn invalid_root_fails() {
        let data = format!("{}\n{}", minimal_dump(), r#"{"type":"root","id":5}"#);
        let result = HeapDump::parse(Cursor::new(data));

        assert!(matches!(result, Err(ParseError::InvalidRoot(5))));
    }

    #[test]
    fn json_error_reports_line() {
        let data = format!("{}\n{{not json", minimal_dump());
        let result = HeapDump::parse(Cursor::new(data));

        assert!(matches!(result, Err(ParseError::Json { line: 2, .. })));
    }

    #[test]
    fn unknown_record_type_fails() {
        let data = format!("{}\n{}", minimal_dump(), r#"{"type":"frame","id":1}"#);
        let result = HeapDump::parse(Cursor::new(data));

        assert!(matches!(
            result,
            Err(ParseError::UnknownRecordType(t, 2)) if t == "frame"
        ));
    }

    #[test]
    fn skips_empty_lines() {
        let data = format!("{}\n\n\n", minimal_dump());
        assert!(HeapDump::parse(Cursor::new(data)).is_ok());
    }

    #[test]
    fn referrers_and_reachability() {
        let data = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            minimal_dump(),
            r#"{"type":"object","id":1,"type_name":"frame","referents":[2,3]}"#,
            r#"{"type":"object","id":2,"type_name":"list","referents":[3]}"#,
            r#"{"type":"object","id":3,"type_name":"str","container":false}"#,
            r#"{"type":"object","id":4,"type_name":"list","referents":[3]}"#,
            r#"{"type":"root","id":1}"#
        );
        let dump = HeapDump::parse(Cursor::new(data)).unwrap();

        assert_eq!(dump.referrers_of(3), vec![1, 2, 4]);
        assert_eq!(dump.objects_of_type("list").count(), 2);

        let reachable = dump.reachable();
        assert!(reachable.contains(&3));
        assert!(!reachable.contains(&4));
    }

    #[test]
    fn writer_output_parses_back() {
        let mut writer = HeapDumpWriter::new(Vec::new());
        {
            writer.write_header(&Header::new("testvm")).unwrap();
            writer
                .write_object(&Object {
                    id: 10,
                    type_name: "dict".to_string(),
                    size: Some(232),
                    container: true,
                    referents: vec![11],
                })
                .unwrap();
            writer
                .write_object(&Object {
                    id: 11,
                    type_name: "str".to_string(),
                    size: None,
                    container: false,
                    referents: Vec::new(),
                })
                .unwrap();
            writer
                .write_root(&Root {
                    id: 10,
                    name: None,
                })
                .unwrap();
        }

        let output = writer.into_inner();
        let dump = HeapDump::parse(Cursor::new(output)).unwrap();
        assert_eq!(dump.header.runtime, "testvm");
        assert_eq!(dump.objects.len(), 2);
        assert_eq!(dump.objects[&11].size, None);
        assert_eq!(dump.roots.len(), 1);
        assert_eq!(dump.resolve_object(10).map(|o| o.type_name.as_str()), Some("dict"));
        assert!(dump.resolve_object(12).is_none());
    }
}
