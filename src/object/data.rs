//! Shared object records and their owning handle.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::array::{AnyArray, Scalar, ScalarType, ShmVector};
use super::meta::Meta;
use super::region::RegionInner;
use super::ObjectType;
use crate::error::ObjectError;

type CompletionHook = Box<dyn FnOnce() + Send>;

/// A reference slot that may still be waiting for its target to arrive.
pub enum Slot<T> {
    Resolved(T),
    Pending(String),
}

impl<T> Slot<T> {
    pub fn resolved(&self) -> Option<&T> {
        match self {
            Slot::Resolved(v) => Some(v),
            Slot::Pending(_) => None,
        }
    }
}

/// Pending array slots remember which element type to fetch.
pub(crate) struct PendingArray {
    pub(crate) name: String,
    pub(crate) scalar_type: ScalarType,
}

/// Shared object record. Reached through [`Object`] handles or explicit
/// [`add_ref`](Self::add_ref)/[`unref`](Self::unref) pairs.
pub struct ObjectData {
    name: String,
    object_type: ObjectType,
    meta: RwLock<Meta>,
    attributes: RwLock<BTreeMap<String, Vec<String>>>,
    attachments: Mutex<BTreeMap<String, Object>>,
    children: Mutex<BTreeMap<String, Slot<Object>>>,
    arrays: Mutex<BTreeMap<String, Result<AnyArray, PendingArray>>>,
    refcount: AtomicUsize,
    unresolved: AtomicUsize,
    completion_hooks: Mutex<Vec<CompletionHook>>,
    region: Weak<RegionInner>,
}

impl ObjectData {
    pub(crate) fn new(
        name: String,
        object_type: ObjectType,
        meta: Meta,
        region: Weak<RegionInner>,
    ) -> Self {
        Self {
            name,
            object_type,
            meta: RwLock::new(meta),
            attributes: RwLock::new(BTreeMap::new()),
            attachments: Mutex::new(BTreeMap::new()),
            children: Mutex::new(BTreeMap::new()),
            arrays: Mutex::new(BTreeMap::new()),
            refcount: AtomicUsize::new(1),
            unresolved: AtomicUsize::new(0),
            completion_hooks: Mutex::new(Vec::new()),
            region,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    // ── Reference counting ───────────────────────────────────────────

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Take an additional reference.
    pub fn add_ref(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference. At zero the object leaves its region and releases
    /// everything it references.
    pub fn unref(&self) -> usize {
        let region = self.region.upgrade();
        let mut objects = region.as_ref().map(|r| r.objects.lock());
        match self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(1) => {
                if let Some(objects) = objects.as_mut() {
                    objects.remove(&self.name);
                }
                drop(objects);
                self.destroy();
                0
            }
            Ok(prev) => prev - 1,
            Err(_) => {
                tracing::error!(object = %self.name, "object refcount underflow");
                debug_assert!(false, "refcount underflow on object {}", self.name);
                0
            }
        }
    }

    fn destroy(&self) {
        let attachments = std::mem::take(&mut *self.attachments.lock());
        let children = std::mem::take(&mut *self.children.lock());
        let arrays = std::mem::take(&mut *self.arrays.lock());
        tracing::trace!(
            object = %self.name,
            attachments = attachments.len(),
            children = children.len(),
            arrays = arrays.len(),
            "object destroyed"
        );
        // dropping the handles releases the references
        drop(attachments);
        drop(children);
        drop(arrays);
    }

    // ── Meta ─────────────────────────────────────────────────────────

    pub fn meta(&self) -> Meta {
        *self.meta.read()
    }

    pub fn set_meta(&self, meta: Meta) {
        *self.meta.write() = meta;
    }

    pub fn update_meta(&self, f: impl FnOnce(&mut Meta)) {
        f(&mut self.meta.write());
    }

    // ── Attributes ───────────────────────────────────────────────────

    /// Append a value to the list stored under `key`.
    pub fn add_attribute(&self, key: &str, value: &str) {
        self.attributes
            .write()
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// Replace the list stored under `key`.
    pub fn set_attribute_list(&self, key: &str, values: Vec<String>) {
        self.attributes.write().insert(key.to_string(), values);
    }

    /// Last value stored under `key`, or an empty string.
    pub fn attribute(&self, key: &str) -> String {
        self.attributes
            .read()
            .get(key)
            .and_then(|l| l.last().cloned())
            .unwrap_or_default()
    }

    pub fn attribute_list(&self, key: &str) -> Vec<String> {
        self.attributes.read().get(key).cloned().unwrap_or_default()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.read().contains_key(key)
    }

    pub fn attribute_keys(&self) -> Vec<String> {
        self.attributes.read().keys().cloned().collect()
    }

    pub fn attributes(&self) -> BTreeMap<String, Vec<String>> {
        self.attributes.read().clone()
    }

    /// Copy attributes from `src`. With `replace` the attribute map and the
    /// placement meta are overwritten; otherwise values are appended per key.
    pub fn copy_attributes(&self, src: &ObjectData, replace: bool) {
        if std::ptr::eq(self, src) {
            return;
        }
        let theirs = src.attributes();
        if replace {
            let src_meta = src.meta();
            self.meta.write().copy_placement(&src_meta);
            *self.attributes.write() = theirs;
        } else {
            let mut mine = self.attributes.write();
            for (key, values) in theirs {
                mine.entry(key).or_default().extend(values);
            }
        }
    }

    // ── Attachments ──────────────────────────────────────────────────

    /// Attach `obj` under `key`. Returns `false` if the key is taken.
    pub fn add_attachment(&self, key: &str, obj: &Object) -> Result<bool, ObjectError> {
        self.check_acyclic(obj)?;
        let mut attachments = self.attachments.lock();
        if attachments.contains_key(key) {
            return Ok(false);
        }
        attachments.insert(key.to_string(), obj.clone());
        Ok(true)
    }

    pub fn attachment(&self, key: &str) -> Option<Object> {
        self.attachments.lock().get(key).cloned()
    }

    pub fn has_attachment(&self, key: &str) -> bool {
        self.attachments.lock().contains_key(key)
    }

    pub fn attachment_keys(&self) -> Vec<String> {
        self.attachments.lock().keys().cloned().collect()
    }

    /// Detach and release the object under `key`.
    pub fn remove_attachment(&self, key: &str) -> bool {
        let removed = self.attachments.lock().remove(key);
        removed.is_some()
    }

    // ── Children and arrays ──────────────────────────────────────────

    /// Link `obj` under `role`, releasing any previous occupant.
    pub fn set_child(&self, role: &str, obj: &Object) -> Result<(), ObjectError> {
        self.check_acyclic(obj)?;
        let old = self
            .children
            .lock()
            .insert(role.to_string(), Slot::Resolved(obj.clone()));
        self.settle_replaced_child(old);
        Ok(())
    }

    pub fn child(&self, role: &str) -> Option<Object> {
        self.children.lock().get(role).and_then(|s| s.resolved().cloned())
    }

    pub fn child_roles(&self) -> Vec<String> {
        self.children.lock().keys().cloned().collect()
    }

    /// Name referenced under `role`, resolved or not.
    pub fn child_name(&self, role: &str) -> Option<String> {
        self.children.lock().get(role).map(|s| match s {
            Slot::Resolved(o) => o.name().to_string(),
            Slot::Pending(n) => n.clone(),
        })
    }

    pub fn set_array(&self, role: &str, array: impl Into<AnyArray>) {
        let old = self
            .arrays
            .lock()
            .insert(role.to_string(), Ok(array.into()));
        if let Some(Err(_)) = old {
            self.reference_resolved();
        }
    }

    pub fn array(&self, role: &str) -> Option<AnyArray> {
        self.arrays
            .lock()
            .get(role)
            .and_then(|s| s.as_ref().ok().cloned())
    }

    pub fn vector<T: Scalar>(&self, role: &str) -> Option<ShmVector<T>> {
        self.array(role).and_then(|a| a.typed::<T>().ok())
    }

    pub fn array_roles(&self) -> Vec<String> {
        self.arrays.lock().keys().cloned().collect()
    }

    /// Name and element type referenced under `role`, resolved or not.
    pub fn array_ref(&self, role: &str) -> Option<(String, ScalarType)> {
        self.arrays.lock().get(role).map(|s| match s {
            Ok(a) => (a.name().to_string(), a.scalar_type()),
            Err(p) => (p.name.clone(), p.scalar_type),
        })
    }

    // ── Lazy resolution ──────────────────────────────────────────────

    pub(crate) fn set_pending_child(&self, role: &str, name: &str) {
        self.unresolved.fetch_add(1, Ordering::AcqRel);
        let old = self
            .children
            .lock()
            .insert(role.to_string(), Slot::Pending(name.to_string()));
        self.settle_replaced_child(old);
    }

    pub(crate) fn set_pending_array(&self, role: &str, name: &str, scalar_type: ScalarType) {
        self.unresolved.fetch_add(1, Ordering::AcqRel);
        let old = self.arrays.lock().insert(
            role.to_string(),
            Err(PendingArray {
                name: name.to_string(),
                scalar_type,
            }),
        );
        if let Some(Err(_)) = old {
            self.reference_resolved();
        }
    }

    /// Announce a reference that is resolved later without a slot
    /// (attachments arriving from an archive).
    pub(crate) fn expect_reference(&self) {
        self.unresolved.fetch_add(1, Ordering::AcqRel);
    }

    /// Fill a pending child slot. Returns `false` if the slot was not pending.
    pub(crate) fn resolve_child(&self, role: &str, obj: &Object) -> Result<bool, ObjectError> {
        self.check_acyclic(obj)?;
        let mut children = self.children.lock();
        if !matches!(children.get(role), Some(Slot::Pending(_))) {
            return Ok(false);
        }
        children.insert(role.to_string(), Slot::Resolved(obj.clone()));
        drop(children);
        self.reference_resolved();
        Ok(true)
    }

    pub(crate) fn resolve_array(&self, role: &str, array: &AnyArray) -> bool {
        let mut arrays = self.arrays.lock();
        if !matches!(arrays.get(role), Some(Err(_))) {
            return false;
        }
        arrays.insert(role.to_string(), Ok(array.clone()));
        drop(arrays);
        self.reference_resolved();
        true
    }

    fn settle_replaced_child(&self, old: Option<Slot<Object>>) {
        if let Some(Slot::Pending(_)) = old {
            self.reference_resolved();
        }
    }

    pub(crate) fn reference_resolved(&self) {
        let prev = self
            .unresolved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        match prev {
            Ok(1) => {
                let hooks = std::mem::take(&mut *self.completion_hooks.lock());
                for hook in hooks {
                    hook();
                }
            }
            Ok(_) => {}
            Err(_) => {
                tracing::error!(object = %self.name, "more references resolved than pending");
                debug_assert!(false, "unresolved underflow on {}", self.name);
            }
        }
    }

    pub fn unresolved_references(&self) -> usize {
        self.unresolved.load(Ordering::Acquire)
    }

    /// All references of this object itself are resident.
    pub fn is_complete(&self) -> bool {
        self.unresolved_references() == 0
    }

    /// This object and everything reachable from it are resident.
    pub fn is_complete_deep(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        let children: Vec<Object> = self
            .children
            .lock()
            .values()
            .filter_map(|s| s.resolved().cloned())
            .collect();
        let attachments: Vec<Object> = self.attachments.lock().values().cloned().collect();
        children
            .iter()
            .chain(attachments.iter())
            .all(|o| o.is_complete_deep())
    }

    /// Run `hook` once all references are resident; immediately if they already are.
    pub fn on_complete(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.completion_hooks.lock();
        if self.is_complete() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    // ── Cycle prevention ─────────────────────────────────────────────

    fn check_acyclic(&self, candidate: &Object) -> Result<(), ObjectError> {
        if candidate.reaches(self) {
            return Err(ObjectError::Cycle {
                parent: self.name.clone(),
                child: candidate.name().to_string(),
            });
        }
        Ok(())
    }

    fn direct_references(&self) -> Vec<Arc<ObjectData>> {
        let mut out: Vec<Arc<ObjectData>> =
            self.attachments.lock().values().map(|o| o.0.clone()).collect();
        out.extend(
            self.children
                .lock()
                .values()
                .filter_map(|s| s.resolved().map(|o| o.0.clone())),
        );
        out
    }
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("name", &self.name)
            .field("type", &self.object_type)
            .field("refcount", &self.refcount())
            .field("unresolved", &self.unresolved_references())
            .finish()
    }
}

/// Owning handle to an [`ObjectData`]: holds one reference for its lifetime.
pub struct Object(pub(crate) Arc<ObjectData>);

impl Object {
    /// Wrap a record whose reference was already counted for this handle.
    pub(crate) fn adopt(data: Arc<ObjectData>) -> Self {
        Object(data)
    }

    /// Whether `target` is this object or reachable through attachments/children.
    fn reaches(&self, target: &ObjectData) -> bool {
        let mut stack = vec![self.0.clone()];
        let mut seen = std::collections::HashSet::new();
        while let Some(cur) = stack.pop() {
            if std::ptr::eq(Arc::as_ptr(&cur), target) {
                return true;
            }
            if !seen.insert(Arc::as_ptr(&cur)) {
                continue;
            }
            stack.extend(cur.direct_references());
        }
        false
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::ops::Deref for Object {
    type Target = ObjectData;

    fn deref(&self) -> &ObjectData {
        &self.0
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        self.0.add_ref();
        Object(self.0.clone())
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.0.unref();
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SharedRegion;
    use std::sync::atomic::AtomicBool;

    fn region() -> SharedRegion {
        SharedRegion::new("test", 1, 0)
    }

    #[test]
    fn test_matched_refs_release_name() {
        let region = region();
        let obj = region.create_object(ObjectType::Points, Meta::default());
        let name = obj.name().to_string();
        assert_eq!(obj.add_ref(), 2);
        assert_eq!(obj.unref(), 1);
        assert!(region.contains_object(&name));
        drop(obj);
        assert!(!region.contains_object(&name));
        assert!(region.object(&name).is_none());
        // explicit recreation makes the name available again
        let again = region
            .create_object_named(&name, ObjectType::Points, Meta::default())
            .unwrap();
        assert!(region.object(again.name()).is_some());
    }

    #[test]
    fn test_attributes() {
        let region = region();
        let obj = region.create_object(ObjectType::Empty, Meta::default());
        assert_eq!(obj.attribute("_species"), "");
        obj.add_attribute("_species", "pressure");
        obj.add_attribute("_species", "p");
        assert_eq!(obj.attribute("_species"), "p");
        assert_eq!(obj.attribute_list("_species"), vec!["pressure", "p"]);
        assert!(obj.has_attribute("_species"));
    }

    #[test]
    fn test_copy_attributes_merge_and_replace() {
        let region = region();
        let src = region.create_object(ObjectType::Empty, Meta::default().with_block(2, 4));
        src.add_attribute("a", "1");
        src.add_attribute("b", "2");
        let dst = region.create_object(ObjectType::Empty, Meta::default());
        dst.add_attribute("a", "0");
        dst.add_attribute("c", "3");

        dst.copy_attributes(&src, false);
        assert_eq!(dst.attribute_list("a"), vec!["0", "1"]);
        assert_eq!(dst.attribute("c"), "3");
        assert_eq!(dst.meta().block, -1);

        dst.copy_attributes(&src, true);
        assert_eq!(dst.attribute_list("a"), vec!["1"]);
        assert!(!dst.has_attribute("c"));
        assert_eq!(dst.meta().block, 2);
    }

    #[test]
    fn test_attachment_holds_reference() {
        let region = region();
        let parent = region.create_object(ObjectType::Empty, Meta::default());
        let child = region.create_object(ObjectType::Points, Meta::default());
        let child_name = child.name().to_string();
        assert!(parent.add_attachment("normals", &child).unwrap());
        assert!(!parent.add_attachment("normals", &child).unwrap());
        drop(child);
        assert!(region.contains_object(&child_name));
        assert!(parent.remove_attachment("normals"));
        assert!(!region.contains_object(&child_name));
    }

    #[test]
    fn test_teardown_cascades() {
        let region = region();
        let grid = region.create_object(ObjectType::UnstructuredGrid, Meta::default());
        let data = region.create_object(ObjectType::Vec(1), Meta::default());
        let x = region.create_vector_from(vec![1.0f32, 2.0]);
        data.set_array("x", x.clone());
        data.set_child("grid", &grid).unwrap();
        drop(grid);
        drop(x);
        assert_eq!(region.object_count(), 2);
        assert_eq!(region.array_count(), 1);
        drop(data);
        assert_eq!(region.object_count(), 0);
        assert_eq!(region.array_count(), 0);
    }

    #[test]
    fn test_cycles_rejected() {
        let region = region();
        let a = region.create_object(ObjectType::Empty, Meta::default());
        let b = region.create_object(ObjectType::Empty, Meta::default());
        assert!(matches!(
            a.add_attachment("self", &a),
            Err(ObjectError::Cycle { .. })
        ));
        a.set_child("next", &b).unwrap();
        assert!(matches!(b.set_child("back", &a), Err(ObjectError::Cycle { .. })));
        assert!(matches!(
            b.add_attachment("back", &a),
            Err(ObjectError::Cycle { .. })
        ));
        // a shared child is a DAG, not a cycle
        let c = region.create_object(ObjectType::Empty, Meta::default());
        a.set_child("shared", &c).unwrap();
        b.set_child("shared", &c).unwrap();
    }

    #[test]
    fn test_pending_references_complete() {
        let region = region();
        let obj = region.create_object(ObjectType::Empty, Meta::default());
        obj.set_pending_child("grid", "remote_grid");
        obj.set_pending_array("x", "remote_x", ScalarType::F32);
        assert!(!obj.is_complete());
        assert_eq!(obj.child_name("grid").as_deref(), Some("remote_grid"));

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        obj.on_complete(move || flag.store(true, Ordering::SeqCst));

        let grid = region.create_object(ObjectType::UniformGrid, Meta::default());
        assert!(obj.resolve_child("grid", &grid).unwrap());
        assert!(!obj.resolve_child("grid", &grid).unwrap());
        assert!(!fired.load(Ordering::SeqCst));

        let x = region.create_vector::<f32>();
        assert!(obj.resolve_array("x", x.as_any()));
        assert!(obj.is_complete());
        assert!(fired.load(Ordering::SeqCst));
    }
}
