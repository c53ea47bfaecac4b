//! Save/restore of object graphs as directories of named blobs.
//!
//! # Architecture
//!
//! - [`Saver`] and [`Fetcher`] are the two seams between the shared region
//!   and a serialized representation. Senders drive a saver; receivers drive
//!   a fetcher.
//! - [`DeepArchiveSaver`] flattens an object and everything it references
//!   into a top blob plus a [`Directory`] of sub-object and array blobs, each
//!   name saved at most once.
//! - [`DeepArchiveFetcher`] rebuilds the graph from those blobs. Names that
//!   are already resident resolve immediately; the rest are decoded on
//!   demand by a worklist resolver. Names missing everywhere stay pending and
//!   leave their holder incomplete until [`DeepArchiveFetcher::retry`]
//!   succeeds.
//!
//! Every blob starts with a one-byte [`ArchiveFormat`] tag.

pub mod fetcher;
pub mod saver;

pub use fetcher::DeepArchiveFetcher;
pub use saver::DeepArchiveSaver;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::ArchiveError;
use crate::object::{AnyArray, ArrayBuffer, Meta, Object, ObjectType, ScalarType};

/// Serialization used for a blob body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    Bincode,
    Json,
}

impl ArchiveFormat {
    pub fn tag(self) -> u8 {
        match self {
            ArchiveFormat::Bincode => 1,
            ArchiveFormat::Json => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ArchiveError> {
        match tag {
            1 => Ok(ArchiveFormat::Bincode),
            2 => Ok(ArchiveFormat::Json),
            other => Err(ArchiveError::UnknownFormat(other)),
        }
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, ArchiveError> {
        let mut out = vec![self.tag()];
        match self {
            ArchiveFormat::Bincode => bincode::serialize_into(&mut out, value)?,
            ArchiveFormat::Json => serde_json::to_writer(&mut out, value)?,
        }
        Ok(out)
    }
}

/// Decode a tagged blob with whichever format its tag names.
pub fn decode_blob<T: DeserializeOwned>(blob: &[u8]) -> Result<T, ArchiveError> {
    let (&tag, body) = blob.split_first().ok_or(ArchiveError::Empty)?;
    match ArchiveFormat::from_tag(tag)? {
        ArchiveFormat::Bincode => Ok(bincode::deserialize(body)?),
        ArchiveFormat::Json => Ok(serde_json::from_slice(body)?),
    }
}

// ── Records ──────────────────────────────────────────────────────────

/// Serialized body of one object. References are by name only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub name: String,
    pub object_type: ObjectType,
    pub meta: Meta,
    pub attributes: BTreeMap<String, Vec<String>>,
    /// (key, object name)
    pub attachments: Vec<(String, String)>,
    /// (role, object name)
    pub children: Vec<(String, String)>,
    /// (role, array name, element type)
    pub arrays: Vec<(String, String, ScalarType)>,
}

impl ObjectRecord {
    pub fn from_object(obj: &Object) -> Self {
        Self {
            name: obj.name().to_string(),
            object_type: obj.object_type(),
            meta: obj.meta(),
            attributes: obj.attributes(),
            attachments: obj
                .attachment_keys()
                .into_iter()
                .filter_map(|k| obj.attachment(&k).map(|a| (k, a.name().to_string())))
                .collect(),
            children: obj
                .child_roles()
                .into_iter()
                .filter_map(|r| obj.child_name(&r).map(|n| (r, n)))
                .collect(),
            arrays: obj
                .array_roles()
                .into_iter()
                .filter_map(|r| obj.array_ref(&r).map(|(n, t)| (r, n, t)))
                .collect(),
        }
    }
}

/// Serialized body of one array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayRecord {
    pub name: String,
    pub data: ArrayBuffer,
}

// ── Directory ────────────────────────────────────────────────────────

/// One named blob of a saved graph.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_array: bool,
    pub size: usize,
    pub data: Bytes,
}

/// Blobs produced by one save cycle, in the order they were saved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directory {
    pub entries: Vec<DirectoryEntry>,
}

impl Directory {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn contains(&self, name: &str, is_array: bool) -> bool {
        self.entries
            .iter()
            .any(|e| e.name == name && e.is_array == is_array)
    }

    /// Split into (objects, arrays) maps keyed by name.
    pub fn into_maps(self) -> (HashMap<String, Bytes>, HashMap<String, Bytes>) {
        let mut objects = HashMap::new();
        let mut arrays = HashMap::new();
        for entry in self.entries {
            if entry.is_array {
                arrays.insert(entry.name, entry.data);
            } else {
                objects.insert(entry.name, entry.data);
            }
        }
        (objects, arrays)
    }
}

// ── Seams ────────────────────────────────────────────────────────────

/// Sink for serialized objects and arrays. Each name is stored at most once.
pub trait Saver {
    fn save_array(&mut self, name: &str, array: &AnyArray) -> Result<(), ArchiveError>;
    fn save_object(&mut self, name: &str, obj: &Object) -> Result<(), ArchiveError>;
}

/// Invoked once the requested object is resident.
pub type ObjectCompletion = Box<dyn FnOnce(Object) + Send>;
/// Invoked once the requested array is resident.
pub type ArrayCompletion = Box<dyn FnOnce(AnyArray) + Send>;

/// Outcome of a fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The target is resident and the completion handler has run.
    Complete,
    /// The target could not be found yet; the request stays queued.
    Incomplete,
}

impl Resolution {
    pub fn is_complete(self) -> bool {
        self == Resolution::Complete
    }
}

/// Source of objects and arrays by name.
pub trait Fetcher {
    fn request_object(&self, name: &str, on_complete: ObjectCompletion) -> Resolution;
    fn request_array(&self, name: &str, scalar_type: ScalarType, on_complete: ArrayCompletion) -> Resolution;

    fn rename_objects(&self) -> bool {
        false
    }

    fn translate_object_name(&self, name: &str) -> String {
        name.to_string()
    }

    fn translate_array_name(&self, _scalar_type: ScalarType, name: &str) -> String {
        name.to_string()
    }

    fn register_object_name_translation(&self, _archived: &str, _local: &str) {}

    fn register_array_name_translation(&self, _archived: &str, _local: &str) {}
}
