//! Spec & hashing (spec §4.C): typed field descriptors, deterministic
//! recursive hashing of input values (including file contents), and
//! checksum composition.
//!
//! Grounded in `helpers.py::create_checksum`/`hash_function` and
//! `helpers_file.py::hash_file`'s chunked reading, re-expressed with an
//! explicit closed value type per spec §9's "dynamic field typing" note
//! (a sum type, not an untyped record).

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File as StdFile;
use std::io::Read;
use std::path::{Path, PathBuf};

/// The closed set of scalar kinds a field may hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Scalar {
    fn canonical_string(&self) -> String {
        match self {
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => format!("{f:?}"),
            Scalar::Str(s) => s.clone(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

/// A field value: one of the closed value types named in spec §3
/// (`scalar`, `file`, or a `sequence` of either — `sequence-of-scalar` and
/// `sequence-of-file` are both `Value::Sequence` whose elements share a
/// variant; `template-string` fields hold their rendered result as
/// `Value::Scalar(Scalar::Str(_))` once substitution has happened).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Scalar),
    File(PathBuf),
    Sequence(Vec<Value>),
}

impl Value {
    /// Index into nested sequences along successive axes, the Rust analogue
    /// of `numpy.take` applied one axis at a time (spec §4.B: "slice
    /// `inputs[v]`... via take along the input's own axes").
    pub fn index_axes(&self, idx: &[usize]) -> Option<&Value> {
        match idx.split_first() {
            None => Some(self),
            Some((&first, rest)) => match self {
                Value::Sequence(items) => items.get(first)?.index_axes(rest),
                _ => None,
            },
        }
    }

    /// Length along the outermost axis, used when deriving `shape` from an
    /// input's own length (spec §4.A: "introduce a fresh axis of length
    /// `len(input[leaf])`").
    pub fn outer_len(&self) -> usize {
        match self {
            Value::Sequence(items) => items.len(),
            _ => 1,
        }
    }

    /// Render for use in a directory name (spec §4.B `dir_name`).
    pub fn dir_repr(&self) -> String {
        match self {
            Value::Scalar(s) => s.canonical_string(),
            Value::File(p) => p.display().to_string(),
            Value::Sequence(items) => {
                let parts: Vec<String> = items.iter().map(Value::dir_repr).collect();
                format!("[{}]", parts.join(","))
            }
        }
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hash file contents in fixed-size chunks, grounded in
/// `helpers_file.py::hash_file`'s chunked reading (the original reads in
/// `crypto_policy`-sized blocks rather than loading the whole file).
fn hash_file_contents(path: &Path) -> std::io::Result<String> {
    let mut file = StdFile::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

/// Recursive, type-aware hash of a single field value (spec §4.C).
pub fn hash_value(value: &Value) -> Result<String, EngineError> {
    match value {
        Value::Scalar(s) => Ok(hash_bytes(s.canonical_string().as_bytes())),
        Value::File(path) => hash_file_contents(path).map_err(|e| EngineError::CacheCorruption {
            path: path.clone(),
            reason: e.to_string(),
        }),
        Value::Sequence(items) => {
            let mut concatenated = String::new();
            for item in items {
                concatenated.push_str(&hash_value(item)?);
            }
            Ok(hash_bytes(concatenated.as_bytes()))
        }
    }
}

/// The closed set of field value types (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Scalar,
    File,
    SequenceScalar,
    SequenceFile,
    TemplateString,
}

/// Whether an output file field should be hard-linked, copied, or left
/// untouched relative to its source (carried through from the input spec
/// metadata so a `Runnable` can honor it; the actual filesystem operation is
/// out of scope per spec §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CopyFile {
    #[default]
    None,
    Link,
    Copy,
}

/// One named, typed field in an input or output spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub default: Option<Value>,
    pub copyfile: CopyFile,
    /// Format string referencing other field names, e.g. `"{in_file}.out"`.
    pub output_file_template: Option<String>,
    /// Rename on the output side; defaults to `name` when absent.
    pub output_field_name: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            ty,
            default: None,
            copyfile: CopyFile::None,
            output_file_template: None,
            output_field_name: None,
        }
    }

    pub fn exposed_name(&self) -> &str {
        self.output_field_name.as_deref().unwrap_or(&self.name)
    }
}

/// An ordered set of named fields (spec §3: "a spec declares an ordered set
/// of named fields"). Declaration order matters for checksum stability.
pub type Spec = Vec<FieldSpec>;

/// Collect the names of output fields synthesized from `output_file_template`
/// entries on an input spec, preserving declaration order (ported from
/// `helpers.py::output_names_from_inputfields`).
pub fn output_names_from_input_spec(spec: &Spec) -> Vec<String> {
    spec.iter()
        .filter(|f| f.output_file_template.is_some())
        .map(|f| f.exposed_name().to_string())
        .collect()
}

/// A concrete, ordered `field-name -> value` mapping (spec §9: "a single
/// record type driven by spec metadata", replacing the source's dynamic
/// per-spec class synthesis).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Record { fields: Vec::new() }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Lengths of every field, for [`crate::splitter::rpn_to_axes`].
    pub fn lengths(&self) -> std::collections::HashMap<String, usize> {
        self.fields
            .iter()
            .map(|(name, value)| (name.clone(), value.outer_len()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.set(name, value);
        }
        record
    }
}

/// Supplies the environment term of the input hash (spec §4.C: "concatenated
/// with the task class name and the environment fingerprint"). `pydra`
/// itself never implements this half of the hash (see DESIGN.md); the
/// default is a no-op so checksums remain deterministic without inventing a
/// scheme the original doesn't have either.
pub trait EnvFingerprint {
    fn fingerprint(&self) -> String {
        String::new()
    }
}

/// The default, no-op fingerprint.
pub struct NoFingerprint;
impl EnvFingerprint for NoFingerprint {}

/// Hash of the sequence of `(field-name, field-hash)` pairs in declaration
/// order, concatenated with the class name and environment fingerprint
/// (spec §4.C).
pub fn input_hash(
    class_name: &str,
    record: &Record,
    env: &dyn EnvFingerprint,
) -> Result<String, EngineError> {
    let mut hasher = Sha256::new();
    for (name, value) in record.iter() {
        hasher.update(name.as_bytes());
        hasher.update(hash_value(value)?.as_bytes());
    }
    hasher.update(class_name.as_bytes());
    hasher.update(env.fingerprint().as_bytes());
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

/// `checksum = f"{class_name}_{input_hash}"` (spec §4.C).
pub fn checksum(class_name: &str, input_hash: &str) -> String {
    format!("{class_name}_{input_hash}")
}

/// Substitute already-bound scalar input fields into an
/// `output_file_template` (spec §4.C). Placeholders are `{field_name}`.
pub fn render_output_template(template: &str, record: &Record) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let close = template[i..]
                .find('}')
                .map(|off| i + off)
                .ok_or_else(|| EngineError::MalformedSplitter {
                    expr: template.to_string(),
                    reason: "unterminated '{' in output_file_template".into(),
                })?;
            let field_name = &template[i + 1..close];
            let value = record.get(field_name).ok_or_else(|| EngineError::UnknownVariable {
                node: "output_file_template".into(),
                variable: field_name.to_string(),
            })?;
            out.push_str(&value.dir_repr());
            i = close + 1;
        } else {
            let ch = template[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    let _ = chars.peek();
    Ok(out)
}

/// Runtime record (spec §3): peak RSS, peak VMS, peak CPU percent, all
/// optional — mirrors `helpers.py::gather_runtime_info`'s `Runtime` object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub rss_peak_gb: Option<f64>,
    pub vms_peak_gb: Option<f64>,
    pub cpu_peak_percent: Option<f64>,
}

/// `Result` (spec §3): the triple `(output-record, runtime-record,
/// error | none)` persisted as `_result.<ext>` in the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementResult {
    pub output: Record,
    pub runtime: Runtime,
    pub error: Option<String>,
}
