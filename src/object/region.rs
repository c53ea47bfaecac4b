//! Process-wide registry of named objects and arrays.
//!
//! The region owns every [`ObjectData`] and [`ShmArray`] record. Handles
//! reference records; the last handle to go (or the last explicit `unref`)
//! removes the record from the region while holding the region lock, so a
//! name can never be looked up with a zero refcount.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::array::{AnyArray, ArrayBuffer, Scalar, ScalarType, ShmArray, ShmVector};
use super::data::{Object, ObjectData};
use super::meta::Meta;
use super::ObjectType;
use crate::error::ObjectError;

pub(crate) struct RegionInner {
    pub(crate) name: String,
    module_id: i32,
    rank: i32,
    counter: AtomicU64,
    pub(crate) objects: Mutex<HashMap<String, Arc<ObjectData>>>,
    pub(crate) arrays: Mutex<HashMap<String, Arc<ShmArray>>>,
}

/// Cheaply clonable handle to a shared region.
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<RegionInner>,
}

impl SharedRegion {
    /// Create a region for the given module id and rank. Names generated by
    /// this region embed both.
    pub fn new(name: impl Into<String>, module_id: i32, rank: i32) -> Self {
        let name = name.into();
        tracing::debug!(region = %name, module_id, rank, "shared region created");
        Self {
            inner: Arc::new(RegionInner {
                name,
                module_id,
                rank,
                counter: AtomicU64::new(0),
                objects: Mutex::new(HashMap::new()),
                arrays: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn module_id(&self) -> i32 {
        self.inner.module_id
    }

    pub fn rank(&self) -> i32 {
        self.inner.rank
    }

    /// Fresh object name, unique within this region.
    pub fn create_object_id(&self) -> String {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("m{}id{}r{}OBJ", self.inner.module_id, n, self.inner.rank)
    }

    /// Fresh array name, unique within this region.
    pub fn create_array_id(&self) -> String {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("m{}id{}r{}ARR", self.inner.module_id, n, self.inner.rank)
    }

    // ── Objects ──────────────────────────────────────────────────────

    /// Allocate an object under a fresh name; the returned handle holds the
    /// only reference.
    pub fn create_object(&self, object_type: ObjectType, meta: Meta) -> Object {
        loop {
            let name = self.create_object_id();
            // generated names only collide with explicitly named objects
            if let Ok(obj) = self.create_object_named(&name, object_type, meta) {
                return obj;
            }
        }
    }

    /// Allocate an object under a caller-chosen name.
    pub fn create_object_named(
        &self,
        name: &str,
        object_type: ObjectType,
        meta: Meta,
    ) -> Result<Object, ObjectError> {
        let mut objects = self.inner.objects.lock();
        if objects.contains_key(name) {
            return Err(ObjectError::DuplicateName(name.to_string()));
        }
        let data = Arc::new(ObjectData::new(
            name.to_string(),
            object_type,
            meta,
            Arc::downgrade(&self.inner),
        ));
        objects.insert(name.to_string(), data.clone());
        tracing::trace!(object = %name, ?object_type, "object created");
        Ok(Object::adopt(data))
    }

    /// Look up an object and take a reference to it.
    pub fn object(&self, name: &str) -> Option<Object> {
        let objects = self.inner.objects.lock();
        let data = objects.get(name)?;
        debug_assert!(data.refcount() > 0, "resident object {} has no references", name);
        data.add_ref();
        Some(Object::adopt(data.clone()))
    }

    pub fn contains_object(&self, name: &str) -> bool {
        self.inner.objects.lock().contains_key(name)
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.lock().len()
    }

    // ── Arrays ───────────────────────────────────────────────────────

    pub fn create_vector<T: Scalar>(&self) -> ShmVector<T> {
        self.create_vector_from(Vec::new())
    }

    pub fn create_vector_from<T: Scalar>(&self, values: Vec<T>) -> ShmVector<T> {
        let any = self.create_array(T::wrap(values));
        match any.typed::<T>() {
            Ok(v) => v,
            Err(_) => unreachable!("array created with matching scalar type"),
        }
    }

    /// Allocate an array under a fresh name holding `data`.
    pub fn create_array(&self, data: ArrayBuffer) -> AnyArray {
        let mut data = Some(data);
        loop {
            let name = self.create_array_id();
            match self.insert_array(&name, data.take()) {
                Ok(arr) => return arr,
                Err(back) => data = back,
            }
        }
    }

    /// Allocate an array under a caller-chosen name.
    pub fn create_array_named(&self, name: &str, data: ArrayBuffer) -> Result<AnyArray, ObjectError> {
        self.insert_array(name, Some(data))
            .map_err(|_| ObjectError::DuplicateName(name.to_string()))
    }

    fn insert_array(
        &self,
        name: &str,
        data: Option<ArrayBuffer>,
    ) -> Result<AnyArray, Option<ArrayBuffer>> {
        let mut arrays = self.inner.arrays.lock();
        if arrays.contains_key(name) {
            return Err(data);
        }
        let data = data.unwrap_or_else(|| ArrayBuffer::empty(ScalarType::U8));
        let arr = Arc::new(ShmArray::new(
            name.to_string(),
            data,
            Arc::downgrade(&self.inner),
        ));
        arrays.insert(name.to_string(), arr.clone());
        Ok(AnyArray::adopt(arr))
    }

    /// Look up an array and take a reference to it.
    pub fn array(&self, name: &str) -> Option<AnyArray> {
        let arrays = self.inner.arrays.lock();
        let arr = arrays.get(name)?;
        debug_assert!(arr.refcount() > 0, "resident array {} has no references", name);
        arr.add_ref();
        Some(AnyArray::adopt(arr.clone()))
    }

    pub fn contains_array(&self, name: &str) -> bool {
        self.inner.arrays.lock().contains_key(name)
    }

    pub fn array_count(&self) -> usize {
        self.inner.arrays.lock().len()
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.inner.name)
            .field("objects", &self.object_count())
            .field("arrays", &self.array_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_are_unique() {
        let region = SharedRegion::new("r", 3, 1);
        let a = region.create_object_id();
        let b = region.create_object_id();
        assert_ne!(a, b);
        assert!(a.starts_with("m3id"));
        assert!(a.ends_with("r1OBJ"));
        assert!(region.create_array_id().ends_with("ARR"));
    }

    #[test]
    fn test_lookup_takes_a_reference() {
        let region = SharedRegion::new("r", 1, 0);
        let obj = region.create_object(ObjectType::Points, Meta::default());
        assert_eq!(obj.refcount(), 1);
        let again = region.object(obj.name()).unwrap();
        assert_eq!(obj.refcount(), 2);
        drop(again);
        assert_eq!(obj.refcount(), 1);
    }

    #[test]
    fn test_missing_name_is_not_found() {
        let region = SharedRegion::new("r", 1, 0);
        assert!(region.object("nope").is_none());
        assert!(region.array("nope").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let region = SharedRegion::new("r", 1, 0);
        let _a = region
            .create_object_named("grid", ObjectType::UniformGrid, Meta::default())
            .unwrap();
        let err = region
            .create_object_named("grid", ObjectType::UniformGrid, Meta::default())
            .unwrap_err();
        assert_eq!(err, ObjectError::DuplicateName("grid".into()));
    }

    #[test]
    fn test_named_array() {
        let region = SharedRegion::new("r", 1, 0);
        let arr = region
            .create_array_named("x", ArrayBuffer::F32(vec![1.0]))
            .unwrap();
        assert_eq!(arr.scalar_type(), ScalarType::F32);
        assert!(region.create_array_named("x", ArrayBuffer::U8(vec![])).is_err());
        drop(arr);
        assert!(region.create_array_named("x", ArrayBuffer::U8(vec![])).is_ok());
    }
}
