//! Rebuilding object graphs from blob directories.
//!
//! Resolution runs as a worklist: every reference that is not yet resident
//! becomes a [`Pending`] entry, and [`DeepArchiveFetcher::resolve`] drains
//! the list, decoding blobs, instantiating objects (which may add further
//! entries) and installing results into their holders. Entries whose name
//! cannot be found are kept for the next [`retry`](DeepArchiveFetcher::retry).

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    decode_blob, ArrayCompletion, ArrayRecord, Directory, Fetcher, ObjectCompletion,
    ObjectRecord, Resolution,
};
use crate::error::ArchiveError;
use crate::object::{AnyArray, Object, ScalarType, SharedRegion};

/// Where a resolved reference goes.
enum Target {
    Child { parent: Object, role: String },
    Attachment { parent: Object, key: String },
    Array { parent: Object, role: String },
    ObjectRequest(ObjectCompletion),
    ArrayRequest(ArrayCompletion),
}

struct Pending {
    /// Name as stored in the archive.
    name: String,
    /// Element type for array references.
    scalar_type: Option<ScalarType>,
    target: Target,
}

impl Pending {
    fn is_array(&self) -> bool {
        self.scalar_type.is_some()
    }
}

enum Resolved {
    Object(Object),
    Array(AnyArray),
}

#[derive(Default)]
struct FetcherState {
    objects: HashMap<String, Bytes>,
    arrays: HashMap<String, Bytes>,
    rename_objects: bool,
    object_translations: HashMap<String, String>,
    array_translations: HashMap<String, String>,
    pending: VecDeque<Pending>,
}

/// Fetcher backed by in-memory `{objects, arrays}` blob maps.
pub struct DeepArchiveFetcher {
    region: SharedRegion,
    state: Mutex<FetcherState>,
}

impl DeepArchiveFetcher {
    pub fn new(region: SharedRegion, directory: Directory) -> Self {
        let (objects, arrays) = directory.into_maps();
        Self::from_maps(region, objects, arrays)
    }

    pub fn from_maps(
        region: SharedRegion,
        objects: HashMap<String, Bytes>,
        arrays: HashMap<String, Bytes>,
    ) -> Self {
        Self {
            region,
            state: Mutex::new(FetcherState {
                objects,
                arrays,
                ..Default::default()
            }),
        }
    }

    /// Give every loaded object and array a fresh local name.
    pub fn set_rename_objects(&self, rename: bool) {
        self.state.lock().rename_objects = rename;
    }

    pub fn add_object_blob(&self, name: impl Into<String>, blob: Bytes) {
        self.state.lock().objects.insert(name.into(), blob);
    }

    pub fn add_array_blob(&self, name: impl Into<String>, blob: Bytes) {
        self.state.lock().arrays.insert(name.into(), blob);
    }

    pub fn add_directory(&self, directory: Directory) {
        let (objects, arrays) = directory.into_maps();
        let mut state = self.state.lock();
        state.objects.extend(objects);
        state.arrays.extend(arrays);
    }

    /// Number of references still waiting for their blob.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Rebuild the top object of a saved graph. The returned object is
    /// incomplete if some reference could not be found.
    pub fn load(&self, top: &[u8]) -> Result<Object, ArchiveError> {
        let record: ObjectRecord = decode_blob(top)?;
        let obj = self.instantiate(record)?;
        self.resolve();
        Ok(obj)
    }

    /// Re-run resolution for everything still pending. Returns how many
    /// references remain unresolved.
    pub fn retry(&self) -> usize {
        self.resolve();
        self.pending_count()
    }

    /// Drain the worklist once. Entries that cannot be resolved are kept.
    fn resolve(&self) {
        let mut deferred = Vec::new();
        loop {
            let item = match self.state.lock().pending.pop_front() {
                Some(item) => item,
                None => break,
            };
            match self.lookup(&item) {
                Ok(Some(resolved)) => self.install(item, resolved),
                Ok(None) => {
                    tracing::error!(
                        name = %item.name,
                        array = item.is_array(),
                        "reference could not be resolved"
                    );
                    deferred.push(item);
                }
                Err(e) => {
                    tracing::error!(name = %item.name, "failed to decode archive blob: {}", e);
                    deferred.push(item);
                }
            }
        }
        self.state.lock().pending.extend(deferred);
    }

    /// Find a resident target, or decode one from the blob maps.
    fn lookup(&self, item: &Pending) -> Result<Option<Resolved>, ArchiveError> {
        match item.scalar_type {
            Some(ty) => {
                let resident = self
                    .resident_array_name(&item.name)
                    .and_then(|local| self.region.array(&local).map(|arr| (local, arr)));
                if let Some((local, arr)) = resident {
                    if arr.scalar_type() != ty {
                        tracing::error!(
                            array = %local,
                            expected = ?ty,
                            actual = ?arr.scalar_type(),
                            "resident array has a different element type"
                        );
                        return Ok(None);
                    }
                    return Ok(Some(Resolved::Array(arr)));
                }
                let blob = self.state.lock().arrays.get(&item.name).cloned();
                match blob {
                    Some(blob) => {
                        let record: ArrayRecord = decode_blob(&blob)?;
                        Ok(Some(Resolved::Array(self.instantiate_array(record)?)))
                    }
                    None => Ok(None),
                }
            }
            None => {
                if let Some(obj) = self
                    .resident_object_name(&item.name)
                    .and_then(|local| self.region.object(&local))
                {
                    return Ok(Some(Resolved::Object(obj)));
                }
                let blob = self.state.lock().objects.get(&item.name).cloned();
                match blob {
                    Some(blob) => {
                        let record: ObjectRecord = decode_blob(&blob)?;
                        Ok(Some(Resolved::Object(self.instantiate(record)?)))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn install(&self, item: Pending, resolved: Resolved) {
        match (item.target, resolved) {
            (Target::Child { parent, role }, Resolved::Object(obj)) => {
                if let Err(e) = parent.resolve_child(&role, &obj) {
                    tracing::error!(object = %parent.name(), "rejected archived reference: {}", e);
                }
            }
            (Target::Attachment { parent, key }, Resolved::Object(obj)) => {
                match parent.add_attachment(&key, &obj) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(object = %parent.name(), key = %key, "attachment already present")
                    }
                    Err(e) => {
                        tracing::error!(object = %parent.name(), "rejected archived attachment: {}", e);
                        return;
                    }
                }
                parent.reference_resolved();
            }
            (Target::Array { parent, role }, Resolved::Array(arr)) => {
                parent.resolve_array(&role, &arr);
            }
            (Target::ObjectRequest(done), Resolved::Object(obj)) => done(obj),
            (Target::ArrayRequest(done), Resolved::Array(arr)) => done(arr),
            _ => {
                tracing::error!(name = %item.name, "resolved reference kind does not match request");
            }
        }
    }

    /// Create an object from its record and queue its references.
    fn instantiate(&self, record: ObjectRecord) -> Result<Object, ArchiveError> {
        let local = self.local_object_name(&record.name);
        let obj = match self
            .region
            .create_object_named(&local, record.object_type, record.meta)
        {
            Ok(obj) => obj,
            // already loaded through another path
            Err(_) => match self.region.object(&local) {
                Some(obj) => return Ok(obj),
                None => return Err(ArchiveError::Unresolved(local)),
            },
        };
        for (key, values) in record.attributes {
            obj.set_attribute_list(&key, values);
        }

        let mut state = self.state.lock();
        for (role, name) in record.children {
            obj.set_pending_child(&role, &name);
            state.pending.push_back(Pending {
                name,
                scalar_type: None,
                target: Target::Child {
                    parent: obj.clone(),
                    role,
                },
            });
        }
        for (key, name) in record.attachments {
            obj.expect_reference();
            state.pending.push_back(Pending {
                name,
                scalar_type: None,
                target: Target::Attachment {
                    parent: obj.clone(),
                    key,
                },
            });
        }
        for (role, name, ty) in record.arrays {
            obj.set_pending_array(&role, &name, ty);
            state.pending.push_back(Pending {
                name,
                scalar_type: Some(ty),
                target: Target::Array {
                    parent: obj.clone(),
                    role,
                },
            });
        }
        drop(state);

        tracing::trace!(archived = %record.name, local = %obj.name(), "object instantiated");
        Ok(obj)
    }

    fn instantiate_array(&self, record: ArrayRecord) -> Result<AnyArray, ArchiveError> {
        let local = self.local_array_name(&record.name);
        match self.region.create_array_named(&local, record.data) {
            Ok(arr) => Ok(arr),
            Err(_) => self
                .region
                .array(&local)
                .ok_or(ArchiveError::Unresolved(local)),
        }
    }

    /// Local name under which an archived object may already be resident.
    /// With renaming on, only names this fetcher translated qualify.
    fn resident_object_name(&self, archived: &str) -> Option<String> {
        let state = self.state.lock();
        match state.object_translations.get(archived) {
            Some(local) => Some(local.clone()),
            None if state.rename_objects => None,
            None => Some(archived.to_string()),
        }
    }

    fn resident_array_name(&self, archived: &str) -> Option<String> {
        let state = self.state.lock();
        match state.array_translations.get(archived) {
            Some(local) => Some(local.clone()),
            None if state.rename_objects => None,
            None => Some(archived.to_string()),
        }
    }

    fn local_object_name(&self, archived: &str) -> String {
        let mut state = self.state.lock();
        if let Some(local) = state.object_translations.get(archived) {
            return local.clone();
        }
        if !state.rename_objects {
            return archived.to_string();
        }
        let local = self.region.create_object_id();
        state
            .object_translations
            .insert(archived.to_string(), local.clone());
        local
    }

    fn local_array_name(&self, archived: &str) -> String {
        let mut state = self.state.lock();
        if let Some(local) = state.array_translations.get(archived) {
            return local.clone();
        }
        if !state.rename_objects {
            return archived.to_string();
        }
        let local = self.region.create_array_id();
        state
            .array_translations
            .insert(archived.to_string(), local.clone());
        local
    }

    fn request(&self, item: Pending, done: &AtomicBool) -> Resolution {
        self.state.lock().pending.push_back(item);
        self.resolve();
        if done.load(Ordering::Acquire) {
            Resolution::Complete
        } else {
            Resolution::Incomplete
        }
    }
}

impl Fetcher for DeepArchiveFetcher {
    fn request_object(&self, name: &str, on_complete: ObjectCompletion) -> Resolution {
        if let Some(obj) = self
            .resident_object_name(name)
            .and_then(|local| self.region.object(&local))
        {
            on_complete(obj);
            return Resolution::Complete;
        }
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let target = Target::ObjectRequest(Box::new(move |obj| {
            flag.store(true, Ordering::Release);
            on_complete(obj)
        }));
        self.request(
            Pending {
                name: name.to_string(),
                scalar_type: None,
                target,
            },
            &done,
        )
    }

    fn request_array(
        &self,
        name: &str,
        scalar_type: ScalarType,
        on_complete: ArrayCompletion,
    ) -> Resolution {
        let resident = self
            .resident_array_name(name)
            .and_then(|local| self.region.array(&local));
        if let Some(arr) = resident {
            if arr.scalar_type() == scalar_type {
                on_complete(arr);
                return Resolution::Complete;
            }
        }
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let target = Target::ArrayRequest(Box::new(move |arr| {
            flag.store(true, Ordering::Release);
            on_complete(arr)
        }));
        self.request(
            Pending {
                name: name.to_string(),
                scalar_type: Some(scalar_type),
                target,
            },
            &done,
        )
    }

    fn rename_objects(&self) -> bool {
        self.state.lock().rename_objects
    }

    fn translate_object_name(&self, name: &str) -> String {
        self.state
            .lock()
            .object_translations
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn translate_array_name(&self, _scalar_type: ScalarType, name: &str) -> String {
        self.state
            .lock()
            .array_translations
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn register_object_name_translation(&self, archived: &str, local: &str) {
        self.state
            .lock()
            .object_translations
            .insert(archived.to_string(), local.to_string());
    }

    fn register_array_name_translation(&self, archived: &str, local: &str) {
        self.state
            .lock()
            .array_translations
            .insert(archived.to_string(), local.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveFormat, DeepArchiveSaver};
    use crate::object::{Meta, ObjectType};

    fn saved_graph(region: &SharedRegion) -> (Object, Bytes, Directory) {
        let grid = region.create_object(ObjectType::UniformGrid, Meta::default());
        grid.set_array("x", region.create_vector_from(vec![1.0f64, 2.0, 3.0]));
        let data = region.create_object(ObjectType::Vec(1), Meta::default().with_block(0, 2));
        data.add_attribute("_species", "temperature");
        data.set_child("grid", &grid).unwrap();
        let mut saver = DeepArchiveSaver::default();
        let blob = saver.save(&data).unwrap();
        (data, blob, saver.into_directory())
    }

    #[test]
    fn test_load_into_fresh_region() {
        let src = SharedRegion::new("src", 1, 0);
        let (orig, blob, dir) = saved_graph(&src);

        let dst = SharedRegion::new("dst", 2, 0);
        let fetcher = DeepArchiveFetcher::new(dst.clone(), dir);
        let loaded = fetcher.load(&blob).unwrap();
        assert!(loaded.is_complete_deep());
        assert_eq!(loaded.name(), orig.name());
        assert_eq!(loaded.attribute("_species"), "temperature");
        let grid = loaded.child("grid").unwrap();
        assert_eq!(grid.vector::<f64>("x").unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(fetcher.pending_count(), 0);
    }

    #[test]
    fn test_resident_names_resolve_without_blobs() {
        let region = SharedRegion::new("r", 1, 0);
        let (orig, _blob, _dir) = saved_graph(&region);
        let fetcher = DeepArchiveFetcher::from_maps(region.clone(), HashMap::new(), HashMap::new());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let res = fetcher.request_object(
            orig.name(),
            Box::new(move |_| flag.store(true, Ordering::SeqCst)),
        );
        assert_eq!(res, Resolution::Complete);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missing_blob_then_retry() {
        let src = SharedRegion::new("src", 1, 0);
        let (_orig, blob, dir) = saved_graph(&src);
        let (objects, arrays) = dir.into_maps();

        let dst = SharedRegion::new("dst", 2, 0);
        let fetcher = DeepArchiveFetcher::from_maps(dst.clone(), HashMap::new(), arrays);
        let loaded = fetcher.load(&blob).unwrap();
        assert!(!loaded.is_complete());
        assert_eq!(fetcher.pending_count(), 1);

        for (name, blob) in objects {
            fetcher.add_object_blob(name, blob);
        }
        assert_eq!(fetcher.retry(), 0);
        assert!(loaded.is_complete_deep());
    }

    #[test]
    fn test_rename_objects_avoids_collisions() {
        let region = SharedRegion::new("r", 1, 0);
        let (orig, blob, dir) = saved_graph(&region);
        let fetcher = DeepArchiveFetcher::new(region.clone(), dir);
        fetcher.set_rename_objects(true);
        let copy = fetcher.load(&blob).unwrap();
        assert_ne!(copy.name(), orig.name());
        assert_eq!(fetcher.translate_object_name(orig.name()), copy.name());
        assert!(copy.is_complete_deep());
        assert!(!copy.child("grid").unwrap().ptr_eq(&orig.child("grid").unwrap()));
    }

    #[test]
    fn test_renamed_load_twice_copies_whole_graph() {
        let region = SharedRegion::new("r", 1, 0);
        let (orig, blob, dir) = saved_graph(&region);
        let orig_grid = orig.child("grid").unwrap();
        let orig_x = orig_grid.array("x").unwrap();

        let mut copies = Vec::new();
        for _ in 0..2 {
            let fetcher = DeepArchiveFetcher::new(region.clone(), dir.clone());
            fetcher.set_rename_objects(true);
            let copy = fetcher.load(&blob).unwrap();
            assert!(copy.is_complete_deep());
            let grid = copy.child("grid").unwrap();
            assert!(!grid.ptr_eq(&orig_grid));
            assert_ne!(grid.name(), orig_grid.name());
            assert_ne!(grid.array("x").unwrap().name(), orig_x.name());
            assert_eq!(grid.vector::<f64>("x").unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
            copies.push(copy);
        }
        assert_ne!(copies[0].name(), copies[1].name());
        assert!(!copies[0]
            .child("grid")
            .unwrap()
            .ptr_eq(&copies[1].child("grid").unwrap()));
    }

    #[test]
    fn test_self_referencing_archive_is_rejected() {
        let region = SharedRegion::new("r", 1, 0);
        let record = ObjectRecord {
            name: "loop".into(),
            object_type: ObjectType::Empty,
            meta: Meta::default(),
            attributes: Default::default(),
            attachments: vec![("me".into(), "loop".into())],
            children: vec![],
            arrays: vec![],
        };
        let blob = ArchiveFormat::Bincode.encode(&record).unwrap();
        let fetcher = DeepArchiveFetcher::from_maps(region.clone(), HashMap::new(), HashMap::new());
        let obj = fetcher.load(&blob).unwrap();
        assert!(!obj.is_complete());
        assert!(!obj.has_attachment("me"));
    }
}
