//! Named, reference-counted typed buffers living in a [`SharedRegion`].
//!
//! [`ShmArray`] is the shared record; [`AnyArray`] is an owning handle that
//! holds one reference, and [`ShmVector<T>`] is the same handle with the
//! scalar type fixed at compile time.
//!
//! [`SharedRegion`]: super::SharedRegion

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::region::RegionInner;
use crate::error::ObjectError;

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    U8,
    I8,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

/// Type-tagged storage of an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayBuffer {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl ArrayBuffer {
    pub fn empty(ty: ScalarType) -> Self {
        match ty {
            ScalarType::U8 => ArrayBuffer::U8(Vec::new()),
            ScalarType::I8 => ArrayBuffer::I8(Vec::new()),
            ScalarType::U32 => ArrayBuffer::U32(Vec::new()),
            ScalarType::I32 => ArrayBuffer::I32(Vec::new()),
            ScalarType::U64 => ArrayBuffer::U64(Vec::new()),
            ScalarType::I64 => ArrayBuffer::I64(Vec::new()),
            ScalarType::F32 => ArrayBuffer::F32(Vec::new()),
            ScalarType::F64 => ArrayBuffer::F64(Vec::new()),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ArrayBuffer::U8(_) => ScalarType::U8,
            ArrayBuffer::I8(_) => ScalarType::I8,
            ArrayBuffer::U32(_) => ScalarType::U32,
            ArrayBuffer::I32(_) => ScalarType::I32,
            ArrayBuffer::U64(_) => ScalarType::U64,
            ArrayBuffer::I64(_) => ScalarType::I64,
            ArrayBuffer::F32(_) => ScalarType::F32,
            ArrayBuffer::F64(_) => ScalarType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayBuffer::U8(v) => v.len(),
            ArrayBuffer::I8(v) => v.len(),
            ArrayBuffer::U32(v) => v.len(),
            ArrayBuffer::I32(v) => v.len(),
            ArrayBuffer::U64(v) => v.len(),
            ArrayBuffer::I64(v) => v.len(),
            ArrayBuffer::F32(v) => v.len(),
            ArrayBuffer::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element types that can back a [`ShmVector`].
pub trait Scalar: Copy + Default + Send + Sync + 'static {
    const TYPE: ScalarType;

    fn slice(buf: &ArrayBuffer) -> Option<&[Self]>;
    fn vec_mut(buf: &mut ArrayBuffer) -> Option<&mut Vec<Self>>;
    fn wrap(v: Vec<Self>) -> ArrayBuffer;
}

macro_rules! impl_scalar {
    ($t:ty, $variant:ident) => {
        impl Scalar for $t {
            const TYPE: ScalarType = ScalarType::$variant;

            fn slice(buf: &ArrayBuffer) -> Option<&[Self]> {
                match buf {
                    ArrayBuffer::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn vec_mut(buf: &mut ArrayBuffer) -> Option<&mut Vec<Self>> {
                match buf {
                    ArrayBuffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(v: Vec<Self>) -> ArrayBuffer {
                ArrayBuffer::$variant(v)
            }
        }
    };
}

impl_scalar!(u8, U8);
impl_scalar!(i8, I8);
impl_scalar!(u32, U32);
impl_scalar!(i32, I32);
impl_scalar!(u64, U64);
impl_scalar!(i64, I64);
impl_scalar!(f32, F32);
impl_scalar!(f64, F64);

/// Shared array record. Only reachable through handles.
pub struct ShmArray {
    name: String,
    scalar_type: ScalarType,
    data: RwLock<ArrayBuffer>,
    refcount: AtomicUsize,
    region: Weak<RegionInner>,
}

impl ShmArray {
    pub(crate) fn new(name: String, data: ArrayBuffer, region: Weak<RegionInner>) -> Self {
        Self {
            name,
            scalar_type: data.scalar_type(),
            data: RwLock::new(data),
            refcount: AtomicUsize::new(1),
            region,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Snapshot of the contents.
    pub fn buffer(&self) -> ArrayBuffer {
        self.data.read().clone()
    }

    /// Take an additional reference.
    pub fn add_ref(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference; at zero the array leaves its region.
    pub fn unref(&self) -> usize {
        let region = self.region.upgrade();
        let mut arrays = region.as_ref().map(|r| r.arrays.lock());
        match self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(1) => {
                if let Some(arrays) = arrays.as_mut() {
                    arrays.remove(&self.name);
                }
                tracing::trace!(array = %self.name, "array destroyed");
                0
            }
            Ok(prev) => prev - 1,
            Err(_) => {
                tracing::error!(array = %self.name, "array refcount underflow");
                debug_assert!(false, "refcount underflow on array {}", self.name);
                0
            }
        }
    }
}

impl fmt::Debug for ShmArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmArray")
            .field("name", &self.name)
            .field("type", &self.scalar_type)
            .field("len", &self.len())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Owning, type-erased handle to a [`ShmArray`].
pub struct AnyArray(pub(crate) Arc<ShmArray>);

impl AnyArray {
    /// Wrap a record whose reference was already counted for this handle.
    pub(crate) fn adopt(inner: Arc<ShmArray>) -> Self {
        AnyArray(inner)
    }

    /// Typed view; fails when the element type differs.
    pub fn typed<T: Scalar>(&self) -> Result<ShmVector<T>, ObjectError> {
        if self.0.scalar_type != T::TYPE {
            return Err(ObjectError::ScalarMismatch {
                name: self.0.name.clone(),
                actual: self.0.scalar_type,
                requested: T::TYPE,
            });
        }
        Ok(ShmVector {
            array: self.clone(),
            _marker: PhantomData,
        })
    }
}

impl std::ops::Deref for AnyArray {
    type Target = ShmArray;

    fn deref(&self) -> &ShmArray {
        &self.0
    }
}

impl Clone for AnyArray {
    fn clone(&self) -> Self {
        self.0.add_ref();
        AnyArray(self.0.clone())
    }
}

impl Drop for AnyArray {
    fn drop(&mut self) {
        self.0.unref();
    }
}

impl fmt::Debug for AnyArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Owning handle to an array of `T`.
pub struct ShmVector<T: Scalar> {
    array: AnyArray,
    _marker: PhantomData<T>,
}

impl<T: Scalar> ShmVector<T> {
    pub fn name(&self) -> &str {
        self.array.name()
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    pub fn push(&self, value: T) {
        if let Some(v) = T::vec_mut(&mut self.array.0.data.write()) {
            v.push(value);
        }
    }

    pub fn extend_from_slice(&self, values: &[T]) {
        if let Some(v) = T::vec_mut(&mut self.array.0.data.write()) {
            v.extend_from_slice(values);
        }
    }

    pub fn resize(&self, len: usize) {
        if let Some(v) = T::vec_mut(&mut self.array.0.data.write()) {
            v.resize(len, T::default());
        }
    }

    pub fn set(&self, index: usize, value: T) -> bool {
        match T::vec_mut(&mut self.array.0.data.write()).and_then(|v| v.get_mut(index)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Read access to the elements.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [T]> {
        RwLockReadGuard::map(self.array.0.data.read(), |b| {
            T::slice(b).unwrap_or_default()
        })
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.read().to_vec()
    }

    /// Type-erased handle to the same array.
    pub fn as_any(&self) -> &AnyArray {
        &self.array
    }

    pub fn into_any(self) -> AnyArray {
        self.array
    }
}

impl<T: Scalar> Clone for ShmVector<T> {
    fn clone(&self) -> Self {
        Self {
            array: self.array.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Scalar> fmt::Debug for ShmVector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShmVector<{:?}>({:?})", T::TYPE, self.array.name())
    }
}

impl<T: Scalar> From<ShmVector<T>> for AnyArray {
    fn from(v: ShmVector<T>) -> Self {
        v.array
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SharedRegion;

    #[test]
    fn test_buffer_type_tags() {
        let buf = f32::wrap(vec![1.0, 2.0]);
        assert_eq!(buf.scalar_type(), ScalarType::F32);
        assert_eq!(buf.len(), 2);
        assert!(ArrayBuffer::empty(ScalarType::I64).is_empty());
    }

    #[test]
    fn test_vector_grows() {
        let region = SharedRegion::new("test", 1, 0);
        let v = region.create_vector::<i32>();
        v.push(1);
        v.extend_from_slice(&[2, 3]);
        assert_eq!(v.to_vec(), vec![1, 2, 3]);
        v.resize(5);
        assert_eq!(&*v.read(), &[1, 2, 3, 0, 0]);
        assert!(v.set(4, 9));
        assert!(!v.set(10, 9));
        assert_eq!(v.read()[4], 9);
    }

    #[test]
    fn test_typed_view_checks_scalar_type() {
        let region = SharedRegion::new("test", 1, 0);
        let v = region.create_vector::<f64>();
        let any = v.as_any().clone();
        assert!(any.typed::<f64>().is_ok());
        assert!(matches!(
            any.typed::<u8>(),
            Err(ObjectError::ScalarMismatch { .. })
        ));
    }

    #[test]
    fn test_handles_share_one_record() {
        let region = SharedRegion::new("test", 1, 0);
        let v = region.create_vector::<u32>();
        let name = v.name().to_string();
        let w = v.clone();
        assert_eq!(v.as_any().refcount(), 2);
        drop(v);
        assert!(region.contains_array(&name));
        drop(w);
        assert!(!region.contains_array(&name));
    }
}
