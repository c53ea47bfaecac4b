//! Flattening an object graph into a [`Directory`].

use bytes::Bytes;
use std::collections::{HashSet, VecDeque};

use super::{ArchiveFormat, ArrayRecord, Directory, DirectoryEntry, ObjectRecord, Saver};
use crate::error::ArchiveError;
use crate::object::{AnyArray, Object};

enum Work {
    Object(Object),
    Array(AnyArray),
}

/// Saver that follows every resident reference of the objects it is given.
///
/// The top object passed to [`save`](Self::save) is returned as its own blob;
/// everything it references ends up in the directory.
pub struct DeepArchiveSaver {
    format: ArchiveFormat,
    saved_objects: HashSet<String>,
    saved_arrays: HashSet<String>,
    entries: Vec<DirectoryEntry>,
    queue: VecDeque<Work>,
}

impl Default for DeepArchiveSaver {
    fn default() -> Self {
        Self::new(ArchiveFormat::default())
    }
}

impl DeepArchiveSaver {
    pub fn new(format: ArchiveFormat) -> Self {
        Self {
            format,
            saved_objects: HashSet::new(),
            saved_arrays: HashSet::new(),
            entries: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Serialize `top` and queue-save everything it reaches.
    pub fn save(&mut self, top: &Object) -> Result<Bytes, ArchiveError> {
        self.saved_objects.insert(top.name().to_string());
        let blob = self.encode_object(top)?;
        self.drain()?;
        tracing::debug!(
            object = %top.name(),
            entries = self.entries.len(),
            "object graph saved"
        );
        Ok(blob)
    }

    /// Directory of everything saved besides the top objects.
    pub fn directory(&self) -> Directory {
        Directory {
            entries: self.entries.clone(),
        }
    }

    pub fn into_directory(self) -> Directory {
        Directory {
            entries: self.entries,
        }
    }

    fn drain(&mut self) -> Result<(), ArchiveError> {
        while let Some(work) = self.queue.pop_front() {
            match work {
                Work::Object(obj) => {
                    let name = obj.name().to_string();
                    self.save_object(&name, &obj)?;
                }
                Work::Array(arr) => {
                    let name = arr.name().to_string();
                    self.save_array(&name, &arr)?;
                }
            }
        }
        Ok(())
    }

    /// Encode one object and queue its resident references.
    fn encode_object(&mut self, obj: &Object) -> Result<Bytes, ArchiveError> {
        let record = ObjectRecord::from_object(obj);
        for (key, _) in &record.attachments {
            if let Some(att) = obj.attachment(key) {
                self.queue.push_back(Work::Object(att));
            }
        }
        for (role, _) in &record.children {
            if let Some(child) = obj.child(role) {
                self.queue.push_back(Work::Object(child));
            }
        }
        for (role, _, _) in &record.arrays {
            if let Some(arr) = obj.array(role) {
                self.queue.push_back(Work::Array(arr));
            }
        }
        Ok(Bytes::from(self.format.encode(&record)?))
    }
}

impl Saver for DeepArchiveSaver {
    fn save_array(&mut self, name: &str, array: &AnyArray) -> Result<(), ArchiveError> {
        if !self.saved_arrays.insert(name.to_string()) {
            return Ok(());
        }
        let record = ArrayRecord {
            name: name.to_string(),
            data: array.buffer(),
        };
        let data = Bytes::from(self.format.encode(&record)?);
        self.entries.push(DirectoryEntry {
            name: name.to_string(),
            is_array: true,
            size: data.len(),
            data,
        });
        Ok(())
    }

    fn save_object(&mut self, name: &str, obj: &Object) -> Result<(), ArchiveError> {
        if !self.saved_objects.insert(name.to_string()) {
            return Ok(());
        }
        let data = self.encode_object(obj)?;
        self.entries.push(DirectoryEntry {
            name: name.to_string(),
            is_array: false,
            size: data.len(),
            data,
        });
        Ok(())
    }
}
