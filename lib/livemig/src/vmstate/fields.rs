// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Field bodies: how a field locates its storage inside the parent object
//! and how each element of that storage is encoded.

use std::collections::BTreeMap;

use bitvec::prelude::*;

use super::vmdesc::{FieldDesc, FieldDescWriter, VmsdDesc};
use super::{
    load_state, save_state, save_state_v, Info, VMStateDescription,
    VMStateField, VmResult, VmStateError, VMSTATE_INFO_NULLPTR,
    VMSTATE_INFO_UINT64,
};
use crate::stream::Stream;

/// Number of elements in an array-like field.
pub enum Count<T> {
    Fixed(usize),

    /// Read from an already-populated sibling field.
    Sibling(fn(&T) -> usize),

    /// Sibling value multiplied by a constant.
    Scaled(fn(&T) -> usize, usize),
}

impl<T> Count<T> {
    fn resolve(&self, obj: &T) -> usize {
        match self {
            Count::Fixed(n) => *n,
            Count::Sibling(get) => get(obj),
            Count::Scaled(get, factor) => get(obj).saturating_mul(*factor),
        }
    }
}

pub(crate) trait FieldBody<T: 'static>: Send + Sync {
    fn save(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
        desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult;

    fn load(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
    ) -> VmResult;

    fn compressible(&self) -> bool {
        true
    }
}

/// Encoding of a single element: either a leaf codec or a nested
/// structure.
pub(crate) trait Element<V>: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn is_struct(&self) -> bool {
        false
    }

    fn compressible(&self) -> bool {
        true
    }

    fn put(
        &self,
        f: &mut Stream,
        v: &mut V,
        desc: Option<&mut VmsdDesc>,
    ) -> VmResult;

    fn get(&self, f: &mut Stream, v: &mut V) -> VmResult;
}

impl<V: 'static> Element<V> for &'static Info<V> {
    fn type_name(&self) -> &'static str {
        self.name
    }

    fn put(
        &self,
        f: &mut Stream,
        v: &mut V,
        _desc: Option<&mut VmsdDesc>,
    ) -> VmResult {
        (self.put)(f, v)
    }

    fn get(&self, f: &mut Stream, v: &mut V) -> VmResult {
        (self.get)(f, v)
    }
}

struct StructElem<U: 'static> {
    vmsd: &'static VMStateDescription<U>,
    /// Version to walk the nested description at, when it differs from the
    /// description's own.
    version_id: Option<i32>,
}

impl<U: 'static> Element<U> for StructElem<U> {
    fn type_name(&self) -> &'static str {
        "struct"
    }

    fn is_struct(&self) -> bool {
        true
    }

    fn compressible(&self) -> bool {
        self.vmsd.compressible()
    }

    fn put(
        &self,
        f: &mut Stream,
        v: &mut U,
        desc: Option<&mut VmsdDesc>,
    ) -> VmResult {
        match self.version_id {
            Some(version_id) => save_state_v(f, self.vmsd, v, desc, version_id),
            None => save_state(f, self.vmsd, v, desc),
        }
    }

    fn get(&self, f: &mut Stream, v: &mut U) -> VmResult {
        let version_id = self.version_id.unwrap_or(self.vmsd.version_id);
        load_state(f, self.vmsd, v, version_id)
    }
}

fn put_elem<V>(
    f: &mut Stream,
    elem: &dyn Element<V>,
    v: &mut V,
    w: &mut FieldDescWriter<'_>,
    idx: usize,
) -> VmResult {
    let start = f.transferred();
    if w.wants(idx) && elem.is_struct() {
        let mut nested = VmsdDesc::default();
        elem.put(f, v, Some(&mut nested))?;
        w.element(idx, elem.type_name(), Some(nested), f.transferred() - start);
    } else {
        elem.put(f, v, None)?;
        w.element(idx, elem.type_name(), None, f.transferred() - start);
    }
    Ok(())
}

fn check_capacity(
    field: &'static str,
    count: usize,
    capacity: usize,
) -> VmResult {
    if count > capacity {
        Err(VmStateError::CountOverflow { field, count, capacity })
    } else {
        Ok(())
    }
}

enum Storage<T, V> {
    Single(fn(&mut T) -> &mut V),
    Array(fn(&mut T) -> &mut [V], Count<T>),
    /// Resized to the element count on load.
    Alloc(fn(&mut T) -> &mut Vec<V>, Count<T>, fn() -> V),
    /// Freshly allocated on load.
    Boxed(fn(&mut T) -> &mut Option<Box<V>>, fn() -> V),
    /// Each slot may be null, encoded as the one-byte placeholder.
    Pointers(fn(&mut T) -> &mut [Option<Box<V>>], Count<T>),
}

struct ElemField<T, V: 'static> {
    storage: Storage<T, V>,
    elem: Box<dyn Element<V>>,
}

impl<T: 'static, V: 'static> FieldBody<T> for ElemField<T, V> {
    fn save(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
        desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult {
        let elem = &*self.elem;
        let compress = field.field_exists.is_none() && elem.compressible();
        match &self.storage {
            Storage::Single(access) => {
                let mut w = FieldDescWriter::new(desc, field.name, 1, compress);
                put_elem(f, elem, access(obj), &mut w, 0)
            }
            Storage::Array(access, count) => {
                let n = count.resolve(obj);
                let slice = access(obj);
                check_capacity(field.name, n, slice.len())?;
                let mut w = FieldDescWriter::new(desc, field.name, n, compress);
                for (i, v) in slice[..n].iter_mut().enumerate() {
                    put_elem(f, elem, v, &mut w, i)?;
                }
                Ok(())
            }
            Storage::Alloc(access, count, _) => {
                let n = count.resolve(obj);
                let vec = access(obj);
                check_capacity(field.name, n, vec.len())?;
                let mut w = FieldDescWriter::new(desc, field.name, n, compress);
                for (i, v) in vec[..n].iter_mut().enumerate() {
                    put_elem(f, elem, v, &mut w, i)?;
                }
                Ok(())
            }
            Storage::Boxed(access, _) => {
                let Some(v) = access(obj).as_deref_mut() else {
                    return Err(VmStateError::NullPointer { field: field.name });
                };
                let mut w = FieldDescWriter::new(desc, field.name, 1, compress);
                put_elem(f, elem, v, &mut w, 0)
            }
            Storage::Pointers(access, count) => {
                let n = count.resolve(obj);
                let slice = access(obj);
                check_capacity(field.name, n, slice.len())?;
                let mut w = FieldDescWriter::new(desc, field.name, n, false);
                for (i, slot) in slice[..n].iter_mut().enumerate() {
                    match slot.as_deref_mut() {
                        Some(v) => put_elem(f, elem, v, &mut w, i)?,
                        None => {
                            (VMSTATE_INFO_NULLPTR.put)(f, &())?;
                            w.element(i, VMSTATE_INFO_NULLPTR.name, None, 1);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn load(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
    ) -> VmResult {
        let elem = &*self.elem;
        match &self.storage {
            Storage::Single(access) => elem.get(f, access(obj)),
            Storage::Array(access, count) => {
                let n = count.resolve(obj);
                let slice = access(obj);
                check_capacity(field.name, n, slice.len())?;
                for v in slice[..n].iter_mut() {
                    elem.get(f, v)?;
                    f.error()?;
                }
                Ok(())
            }
            Storage::Alloc(access, count, new) => {
                let n = count.resolve(obj);
                let vec = access(obj);
                vec.clear();
                vec.extend((0..n).map(|_| new()));
                for v in vec.iter_mut() {
                    elem.get(f, v)?;
                    f.error()?;
                }
                Ok(())
            }
            Storage::Boxed(access, new) => {
                let mut v = new();
                elem.get(f, &mut v)?;
                *access(obj) = Some(Box::new(v));
                Ok(())
            }
            Storage::Pointers(access, count) => {
                let n = count.resolve(obj);
                let slice = access(obj);
                check_capacity(field.name, n, slice.len())?;
                // The destination decides which slots are null: a null slot
                // must be matched by the placeholder and is left untouched.
                for slot in slice[..n].iter_mut() {
                    match slot.as_deref_mut() {
                        Some(v) => elem.get(f, v)?,
                        None => (VMSTATE_INFO_NULLPTR.get)(f, &mut ())?,
                    }
                    f.error()?;
                }
                Ok(())
            }
        }
    }

    fn compressible(&self) -> bool {
        !matches!(self.storage, Storage::Pointers(..)) && self.elem.compressible()
    }
}

enum BufferStorage<T> {
    /// `size` of `None` covers the buffer from `start` to its end.
    Inline {
        access: fn(&mut T) -> &mut [u8],
        start: usize,
        size: Option<Count<T>>,
    },
    Alloc { access: fn(&mut T) -> &mut Vec<u8>, size: Count<T> },
}

struct BufferField<T> {
    storage: BufferStorage<T>,
}

fn inline_span<'a, T>(
    obj: &'a mut T,
    access: fn(&mut T) -> &mut [u8],
    start: usize,
    size: &Option<Count<T>>,
) -> (&'a mut [u8], usize) {
    let n = size.as_ref().map(|size| size.resolve(obj));
    let buf = access(obj);
    let n = n.unwrap_or_else(|| buf.len().saturating_sub(start));
    (buf, n)
}

impl<T: 'static> FieldBody<T> for BufferField<T> {
    fn save(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
        desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult {
        let n = match &self.storage {
            BufferStorage::Inline { access, start, size } => {
                let (buf, n) = inline_span(obj, *access, *start, size);
                check_capacity(field.name, start + n, buf.len())?;
                f.put_buffer(&buf[*start..*start + n]);
                n
            }
            BufferStorage::Alloc { access, size } => {
                let n = size.resolve(obj);
                let buf = access(obj);
                check_capacity(field.name, n, buf.len())?;
                f.put_buffer(&buf[..n]);
                n
            }
        };
        FieldDescWriter::new(desc, field.name, 1, true).element(
            0,
            "buffer",
            None,
            n as u64,
        );
        Ok(())
    }

    fn load(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
    ) -> VmResult {
        match &self.storage {
            BufferStorage::Inline { access, start, size } => {
                let (buf, n) = inline_span(obj, *access, *start, size);
                check_capacity(field.name, start + n, buf.len())?;
                f.get_buffer(&mut buf[*start..*start + n]);
            }
            BufferStorage::Alloc { access, size } => {
                let n = size.resolve(obj);
                let buf = access(obj);
                buf.clear();
                buf.resize(n, 0);
                f.get_buffer(buf);
            }
        }
        Ok(())
    }
}

struct UnusedField {
    size: usize,
}

impl<T: 'static> FieldBody<T> for UnusedField {
    fn save(
        &self,
        f: &mut Stream,
        _obj: &mut T,
        field: &VMStateField<T>,
        desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult {
        f.put_buffer(&vec![0u8; self.size]);
        FieldDescWriter::new(desc, field.name, 1, true).element(
            0,
            "unused_buffer",
            None,
            self.size as u64,
        );
        Ok(())
    }

    fn load(
        &self,
        f: &mut Stream,
        _obj: &mut T,
        _field: &VMStateField<T>,
    ) -> VmResult {
        f.skip(self.size);
        Ok(())
    }
}

/// Bit array sent as big-endian 64-bit words, bit 0 in the least
/// significant position of the first word.
struct BitmapField<T> {
    access: fn(&mut T) -> &mut BitVec<u64, Lsb0>,
    count: Count<T>,
}

impl<T: 'static> FieldBody<T> for BitmapField<T> {
    fn save(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
        desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult {
        let n = self.count.resolve(obj);
        let bits = (self.access)(obj);
        check_capacity(field.name, n, bits.len())?;
        let mut words = vec![0u64; n.div_ceil(64)];
        for i in bits[..n].iter_ones() {
            words[i / 64] |= 1 << (i % 64);
        }
        for w in words.iter() {
            f.put_be64(*w);
        }
        FieldDescWriter::new(desc, field.name, 1, true).element(
            0,
            "bitmap",
            None,
            words.len() as u64 * 8,
        );
        Ok(())
    }

    fn load(
        &self,
        f: &mut Stream,
        obj: &mut T,
        _field: &VMStateField<T>,
    ) -> VmResult {
        let n = self.count.resolve(obj);
        let words: Vec<u64> = (0..n.div_ceil(64)).map(|_| f.get_be64()).collect();
        f.error()?;
        let bits = (self.access)(obj);
        if bits.len() < n {
            bits.resize(n, false);
        }
        for i in 0..n {
            bits.set(i, words[i / 64] & (1 << (i % 64)) != 0);
        }
        Ok(())
    }
}

/// No wire presence; exists only to run its existence test.
struct ValidateField;

impl<T: 'static> FieldBody<T> for ValidateField {
    fn save(
        &self,
        _f: &mut Stream,
        _obj: &mut T,
        _field: &VMStateField<T>,
        _desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult {
        Ok(())
    }

    fn load(
        &self,
        _f: &mut Stream,
        _obj: &mut T,
        _field: &VMStateField<T>,
    ) -> VmResult {
        Ok(())
    }

    fn compressible(&self) -> bool {
        false
    }
}

/// A temporary value derived from the parent, walked with its own
/// description and folded back into the parent after load.
struct TmpField<T, U: 'static> {
    vmsd: &'static VMStateDescription<U>,
    export: fn(&T) -> U,
    import: fn(&mut T, U),
}

impl<T: 'static, U: 'static> FieldBody<T> for TmpField<T, U> {
    fn save(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
        desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult {
        let mut tmp = (self.export)(obj);
        let start = f.transferred();
        let mut w = FieldDescWriter::new(desc, field.name, 1, false);
        if w.wants(0) {
            let mut nested = VmsdDesc::default();
            save_state(f, self.vmsd, &mut tmp, Some(&mut nested))?;
            w.element(0, "tmp", Some(nested), f.transferred() - start);
        } else {
            save_state(f, self.vmsd, &mut tmp, None)?;
        }
        Ok(())
    }

    fn load(
        &self,
        f: &mut Stream,
        obj: &mut T,
        _field: &VMStateField<T>,
    ) -> VmResult {
        let mut tmp = (self.export)(obj);
        // Saved at the temporary's own version, so load it at that version.
        load_state(f, self.vmsd, &mut tmp, self.vmsd.version_id)?;
        (self.import)(obj, tmp);
        Ok(())
    }

    fn compressible(&self) -> bool {
        false
    }
}

/// Ordered list of structures: each element is preceded by a 0x01 byte and
/// the list is closed by 0x00.
struct QueueField<T, U: 'static> {
    vmsd: &'static VMStateDescription<U>,
    access: fn(&mut T) -> &mut Vec<U>,
    new: fn() -> U,
    ty: &'static str,
}

impl<T: 'static, U: 'static> FieldBody<T> for QueueField<T, U> {
    fn save(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
        desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult {
        let start = f.transferred();
        for elem in (self.access)(obj).iter_mut() {
            f.put_byte(1);
            save_state(f, self.vmsd, elem, None)?;
        }
        f.put_byte(0);
        FieldDescWriter::new(desc, field.name, 1, false).element(
            0,
            self.ty,
            None,
            f.transferred() - start,
        );
        Ok(())
    }

    fn load(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
    ) -> VmResult {
        let list = (self.access)(obj);
        while f.get_byte() != 0 {
            let mut elem = (self.new)();
            load_state(f, self.vmsd, &mut elem, field.version_id)?;
            list.push(elem);
        }
        f.error()?;
        Ok(())
    }

    fn compressible(&self) -> bool {
        false
    }
}

/// Ordered map: a 32-bit node count, then per node a 0x01 byte, the key and
/// the value, and finally a 0x00 byte.
struct TreeField<T, K: 'static, V: 'static> {
    key: Box<dyn Element<K>>,
    vmsd: &'static VMStateDescription<V>,
    access: fn(&mut T) -> &mut BTreeMap<K, V>,
    new_key: fn() -> K,
    new_val: fn() -> V,
}

impl<T, K, V> FieldBody<T> for TreeField<T, K, V>
where
    T: 'static,
    K: Ord + Clone + 'static,
    V: 'static,
{
    fn save(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
        desc: Option<&mut Vec<FieldDesc>>,
    ) -> VmResult {
        let start = f.transferred();
        let tree = (self.access)(obj);
        let nnodes = u32::try_from(tree.len()).map_err(|_| {
            VmStateError::CountOverflow {
                field: field.name,
                count: tree.len(),
                capacity: u32::MAX as usize,
            }
        })?;
        f.put_be32(nnodes);
        for (key, val) in tree.iter_mut() {
            f.put_byte(1);
            let mut key = key.clone();
            self.key.put(f, &mut key, None)?;
            save_state(f, self.vmsd, val, None)?;
        }
        f.put_byte(0);
        FieldDescWriter::new(desc, field.name, 1, false).element(
            0,
            "gtree",
            None,
            f.transferred() - start,
        );
        Ok(())
    }

    fn load(
        &self,
        f: &mut Stream,
        obj: &mut T,
        field: &VMStateField<T>,
    ) -> VmResult {
        let expected = f.get_be32() as usize;
        f.error()?;
        let tree = (self.access)(obj);
        let mut found = 0;
        while f.get_byte() != 0 {
            found += 1;
            if found > expected {
                return Err(VmStateError::CountMismatch {
                    field: field.name,
                    expected,
                    found,
                });
            }
            let mut key = (self.new_key)();
            self.key.get(f, &mut key)?;
            let mut val = (self.new_val)();
            load_state(f, self.vmsd, &mut val, field.version_id)?;
            tree.insert(key, val);
        }
        f.error()?;
        if found != expected {
            return Err(VmStateError::CountMismatch {
                field: field.name,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn compressible(&self) -> bool {
        false
    }
}

impl<T: 'static> VMStateField<T> {
    fn elements<V: 'static>(
        name: &'static str,
        storage: Storage<T, V>,
        elem: impl Element<V> + 'static,
    ) -> Self {
        Self::from_body(name, ElemField { storage, elem: Box::new(elem) })
    }

    /// A scalar held inline in the parent.
    pub fn single<V: 'static>(
        name: &'static str,
        info: &'static Info<V>,
        access: fn(&mut T) -> &mut V,
    ) -> Self {
        Self::elements(name, Storage::Single(access), info)
    }

    /// An array of scalars; `count` of the leading elements are sent.
    pub fn array<V: 'static>(
        name: &'static str,
        info: &'static Info<V>,
        count: Count<T>,
        access: fn(&mut T) -> &mut [V],
    ) -> Self {
        Self::elements(name, Storage::Array(access, count), info)
    }

    /// A heap array of scalars, reallocated to `count` elements on load.
    pub fn alloc_array<V: Default + 'static>(
        name: &'static str,
        info: &'static Info<V>,
        count: Count<T>,
        access: fn(&mut T) -> &mut Vec<V>,
    ) -> Self {
        Self::elements(name, Storage::Alloc(access, count, V::default), info)
    }

    /// An array of optional scalars where empty slots travel as the null
    /// placeholder.
    pub fn pointer_array<V: 'static>(
        name: &'static str,
        info: &'static Info<V>,
        count: Count<T>,
        access: fn(&mut T) -> &mut [Option<Box<V>>],
    ) -> Self {
        Self::elements(name, Storage::Pointers(access, count), info)
    }

    /// A nested structure held inline.
    pub fn structure<U: 'static>(
        name: &'static str,
        vmsd: &'static VMStateDescription<U>,
        access: fn(&mut T) -> &mut U,
    ) -> Self {
        Self::elements(
            name,
            Storage::Single(access),
            StructElem { vmsd, version_id: None },
        )
    }

    /// A nested structure walked at `struct_version_id` rather than its
    /// description's current version.
    pub fn vstruct<U: 'static>(
        name: &'static str,
        vmsd: &'static VMStateDescription<U>,
        struct_version_id: i32,
        access: fn(&mut T) -> &mut U,
    ) -> Self {
        Self::elements(
            name,
            Storage::Single(access),
            StructElem { vmsd, version_id: Some(struct_version_id) },
        )
    }

    pub fn struct_array<U: 'static>(
        name: &'static str,
        vmsd: &'static VMStateDescription<U>,
        count: Count<T>,
        access: fn(&mut T) -> &mut [U],
    ) -> Self {
        Self::elements(
            name,
            Storage::Array(access, count),
            StructElem { vmsd, version_id: None },
        )
    }

    pub fn struct_alloc_array<U: Default + 'static>(
        name: &'static str,
        vmsd: &'static VMStateDescription<U>,
        count: Count<T>,
        access: fn(&mut T) -> &mut Vec<U>,
    ) -> Self {
        Self::elements(
            name,
            Storage::Alloc(access, count, U::default),
            StructElem { vmsd, version_id: None },
        )
    }

    /// A boxed structure which is allocated afresh on load.
    pub fn struct_pointer<U: Default + 'static>(
        name: &'static str,
        vmsd: &'static VMStateDescription<U>,
        access: fn(&mut T) -> &mut Option<Box<U>>,
    ) -> Self {
        Self::elements(
            name,
            Storage::Boxed(access, U::default),
            StructElem { vmsd, version_id: None },
        )
    }

    pub fn struct_pointer_array<U: 'static>(
        name: &'static str,
        vmsd: &'static VMStateDescription<U>,
        count: Count<T>,
        access: fn(&mut T) -> &mut [Option<Box<U>>],
    ) -> Self {
        Self::elements(
            name,
            Storage::Pointers(access, count),
            StructElem { vmsd, version_id: None },
        )
    }

    /// An inline byte buffer sent whole.
    pub fn buffer(name: &'static str, access: fn(&mut T) -> &mut [u8]) -> Self {
        Self::from_body(
            name,
            BufferField {
                storage: BufferStorage::Inline { access, start: 0, size: None },
            },
        )
    }

    /// `size` bytes of an inline buffer starting at `start`.
    pub fn partial_buffer(
        name: &'static str,
        start: usize,
        size: Count<T>,
        access: fn(&mut T) -> &mut [u8],
    ) -> Self {
        Self::from_body(
            name,
            BufferField {
                storage: BufferStorage::Inline { access, start, size: Some(size) },
            },
        )
    }

    /// A heap buffer whose length comes from a sibling field.
    pub fn vbuffer_alloc(
        name: &'static str,
        size: Count<T>,
        access: fn(&mut T) -> &mut Vec<u8>,
    ) -> Self {
        Self::from_body(
            name,
            BufferField { storage: BufferStorage::Alloc { access, size } },
        )
    }

    /// `size` bytes of padding: zero on save, skipped on load.
    pub fn unused(size: usize) -> Self {
        Self::from_body("unused", UnusedField { size })
    }

    pub fn bitmap(
        name: &'static str,
        count: Count<T>,
        access: fn(&mut T) -> &mut BitVec<u64, Lsb0>,
    ) -> Self {
        Self::from_body(name, BitmapField { access, count })
    }

    /// Fail the save or load unless `test` accepts the object.
    pub fn validate(name: &'static str, test: fn(&T, i32) -> bool) -> Self {
        Self::from_body(name, ValidateField).exists_if(test).must_exist()
    }

    /// Serialize a value computed from the parent by `export`; after load,
    /// `import` folds the value back into the parent.
    pub fn with_tmp<U: 'static>(
        vmsd: &'static VMStateDescription<U>,
        export: fn(&T) -> U,
        import: fn(&mut T, U),
    ) -> Self {
        Self::from_body("tmp", TmpField { vmsd, export, import })
    }

    pub fn qtailq<U: Default + 'static>(
        name: &'static str,
        version_id: i32,
        vmsd: &'static VMStateDescription<U>,
        access: fn(&mut T) -> &mut Vec<U>,
    ) -> Self {
        Self::from_body(
            name,
            QueueField { vmsd, access, new: U::default, ty: "qtailq" },
        )
        .since(version_id)
    }

    pub fn qlist<U: Default + 'static>(
        name: &'static str,
        version_id: i32,
        vmsd: &'static VMStateDescription<U>,
        access: fn(&mut T) -> &mut Vec<U>,
    ) -> Self {
        Self::from_body(
            name,
            QueueField { vmsd, access, new: U::default, ty: "qlist" },
        )
        .since(version_id)
    }

    /// An ordered map with structured keys and values.
    pub fn gtree<K, V>(
        name: &'static str,
        version_id: i32,
        key_vmsd: &'static VMStateDescription<K>,
        val_vmsd: &'static VMStateDescription<V>,
        access: fn(&mut T) -> &mut BTreeMap<K, V>,
    ) -> Self
    where
        K: Ord + Clone + Default + 'static,
        V: Default + 'static,
    {
        Self::from_body(
            name,
            TreeField {
                key: Box::new(StructElem {
                    vmsd: key_vmsd,
                    version_id: Some(version_id),
                }),
                vmsd: val_vmsd,
                access,
                new_key: K::default,
                new_val: V::default,
            },
        )
        .since(version_id)
    }

    /// An ordered map keyed directly by a 64-bit integer.
    pub fn gtree_direct_key<V: Default + 'static>(
        name: &'static str,
        version_id: i32,
        val_vmsd: &'static VMStateDescription<V>,
        access: fn(&mut T) -> &mut BTreeMap<u64, V>,
    ) -> Self {
        Self::from_body(
            name,
            TreeField {
                key: Box::new(&VMSTATE_INFO_UINT64),
                vmsd: val_vmsd,
                access,
                new_key: u64::default,
                new_val: V::default,
            },
        )
        .since(version_id)
    }
}
