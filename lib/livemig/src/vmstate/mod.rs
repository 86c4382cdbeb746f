// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor-driven device state serialization.
//!
//! A [`VMStateDescription`] lists the fields of some type `T` in wire
//! order, along with the version in which each was introduced.  The
//! interpreter ([`save_state`] / [`load_state`]) walks that list against a
//! live object, writing or reading each field with its codec.  Fields carry
//! no tags on the wire: both sides must walk the same descriptor, which is
//! why every layout change is expressed as a version bump.
//!
//! Optional state which only some objects carry is expressed as
//! subsections.  Those are self-describing (a marker byte, the subsection
//! name and its version) so a reader can tell which ones are present.

use thiserror::Error;

use crate::stream::{Stream, StreamError};

mod fields;
pub mod types;
pub mod vmdesc;

pub use fields::Count;
pub use types::*;
use vmdesc::{FieldDesc, VmsdDesc};

/// Marker byte introducing a subsection record.
pub const QEMU_VM_SUBSECTION: u8 = 0x05;

#[derive(Error, Debug)]
pub enum VmStateError {
    #[error("{name}: incoming version {version} is newer than supported version {supported}")]
    VersionTooNew { name: &'static str, version: i32, supported: i32 },

    #[error("{name}: incoming version {version} is older than minimum version {minimum}")]
    VersionTooOld { name: &'static str, version: i32, minimum: i32 },

    #[error("{parent}: unknown subsection {name:?}")]
    UnknownSubsection { parent: &'static str, name: String },

    #[error("{vmsd}/{field}: validation failed")]
    Validation { vmsd: &'static str, field: &'static str },

    #[error("{codec}: loaded value {loaded} does not match {expected}")]
    ValueMismatch { codec: &'static str, loaded: String, expected: String },

    #[error("{codec}: loaded value {loaded} outside of 0..={limit}")]
    OutOfRange { codec: &'static str, loaded: i64, limit: i64 },

    #[error("expected null pointer marker, found {0:#04x}")]
    NotNullMarker(u8),

    #[error("{field}: {count} elements exceed backing storage of {capacity}")]
    CountOverflow { field: &'static str, count: usize, capacity: usize },

    #[error("{field}: element count mismatch, header said {expected}, found {found}")]
    CountMismatch { field: &'static str, expected: usize, found: usize },

    #[error("{field}: cannot save through a null pointer")]
    NullPointer { field: &'static str },

    #[error("{0}: state is not migratable")]
    Unmigratable(&'static str),

    #[error("invalid state: {0}")]
    Invalid(String),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

pub type VmResult<T = ()> = Result<T, VmStateError>;

/// Hook invoked around the field walk.
pub type Hook<T> = fn(&mut T) -> VmResult;

/// Hook invoked after load, with the version found in the stream.
pub type LoadHook<T> = fn(&mut T, i32) -> VmResult;

/// Describes the serialized layout of values of type `T`.
pub struct VMStateDescription<T: 'static> {
    pub name: &'static str,
    pub version_id: i32,
    pub minimum_version_id: i32,
    pub unmigratable: bool,
    pub pre_load: Option<Hook<T>>,
    pub post_load: Option<LoadHook<T>>,
    pub pre_save: Option<Hook<T>>,
    pub post_save: Option<Hook<T>>,

    /// Consulted at save time when this description is used as a
    /// subsection.  Absent means always needed.
    pub needed: Option<fn(&T) -> bool>,

    pub fields: Vec<VMStateField<T>>,
    pub subsections: Vec<&'static VMStateDescription<T>>,
}

impl<T: 'static> VMStateDescription<T> {
    pub fn new(
        name: &'static str,
        version_id: i32,
        minimum_version_id: i32,
    ) -> Self {
        Self {
            name,
            version_id,
            minimum_version_id,
            unmigratable: false,
            pre_load: None,
            post_load: None,
            pre_save: None,
            post_save: None,
            needed: None,
            fields: Vec::new(),
            subsections: Vec::new(),
        }
    }

    pub fn fields(mut self, fields: Vec<VMStateField<T>>) -> Self {
        self.fields = fields;
        self
    }

    pub fn subsections(
        mut self,
        subsections: Vec<&'static VMStateDescription<T>>,
    ) -> Self {
        self.subsections = subsections;
        self
    }

    pub fn needed(mut self, needed: fn(&T) -> bool) -> Self {
        self.needed = Some(needed);
        self
    }

    pub fn pre_save(mut self, hook: Hook<T>) -> Self {
        self.pre_save = Some(hook);
        self
    }

    pub fn post_save(mut self, hook: Hook<T>) -> Self {
        self.post_save = Some(hook);
        self
    }

    pub fn pre_load(mut self, hook: Hook<T>) -> Self {
        self.pre_load = Some(hook);
        self
    }

    pub fn post_load(mut self, hook: LoadHook<T>) -> Self {
        self.post_load = Some(hook);
        self
    }

    pub fn unmigratable(mut self) -> Self {
        self.unmigratable = true;
        self
    }

    fn is_needed(&self, obj: &T) -> bool {
        self.needed.map_or(true, |needed| needed(obj))
    }

    /// Whether arrays of this structure may be described by a single entry.
    pub(crate) fn compressible(&self) -> bool {
        self.subsections.is_empty()
            && self.fields.iter().all(|field| field.compressible())
    }
}

/// One entry of a [`VMStateDescription`].
pub struct VMStateField<T: 'static> {
    pub name: &'static str,

    /// First version of the description which carries this field.
    pub version_id: i32,

    /// Overrides the version test when present.
    pub field_exists: Option<fn(&T, i32) -> bool>,

    /// Absence of the field (on save or load) is an error.
    pub must_exist: bool,

    body: Box<dyn fields::FieldBody<T>>,
}

impl<T: 'static> VMStateField<T> {
    fn from_body(
        name: &'static str,
        body: impl fields::FieldBody<T> + 'static,
    ) -> Self {
        Self {
            name,
            version_id: 0,
            field_exists: None,
            must_exist: false,
            body: Box::new(body),
        }
    }

    /// Only present in streams of version `version_id` and later.
    pub fn since(mut self, version_id: i32) -> Self {
        self.version_id = version_id;
        self
    }

    /// Present whenever `test` says so, regardless of version.
    pub fn exists_if(mut self, test: fn(&T, i32) -> bool) -> Self {
        self.field_exists = Some(test);
        self
    }

    pub fn must_exist(mut self) -> Self {
        self.must_exist = true;
        self
    }

    fn exists(&self, obj: &T, version_id: i32) -> bool {
        match self.field_exists {
            Some(test) => test(obj, version_id),
            None => self.version_id <= version_id,
        }
    }

    fn compressible(&self) -> bool {
        self.field_exists.is_none() && self.body.compressible()
    }
}

/// Serialize `obj` at the description's current version.
pub fn save_state<T>(
    f: &mut Stream,
    vmsd: &VMStateDescription<T>,
    obj: &mut T,
    desc: Option<&mut VmsdDesc>,
) -> VmResult {
    save_state_v(f, vmsd, obj, desc, vmsd.version_id)
}

/// Serialize `obj`, deciding field presence as of `version_id`.
pub fn save_state_v<T>(
    f: &mut Stream,
    vmsd: &VMStateDescription<T>,
    obj: &mut T,
    mut desc: Option<&mut VmsdDesc>,
    version_id: i32,
) -> VmResult {
    if vmsd.unmigratable {
        return Err(VmStateError::Unmigratable(vmsd.name));
    }
    if let Some(pre_save) = vmsd.pre_save {
        pre_save(obj)?;
    }
    if let Some(d) = desc.as_deref_mut() {
        d.vmsd_name = vmsd.name.to_string();
        d.version = version_id;
    }

    let res = save_fields(f, vmsd, obj, desc.as_deref_mut(), version_id)
        .and_then(|_| save_subsections(f, vmsd, obj, desc));

    // Bytes already written stay written; post_save runs either way.
    let post = match vmsd.post_save {
        Some(post_save) => post_save(obj),
        None => Ok(()),
    };
    res.and(post)
}

fn save_fields<T>(
    f: &mut Stream,
    vmsd: &VMStateDescription<T>,
    obj: &mut T,
    mut desc: Option<&mut VmsdDesc>,
    version_id: i32,
) -> VmResult {
    for field in vmsd.fields.iter() {
        if !field.exists(obj, version_id) {
            if field.must_exist {
                return Err(VmStateError::Validation {
                    vmsd: vmsd.name,
                    field: field.name,
                });
            }
            continue;
        }
        let out: Option<&mut Vec<FieldDesc>> =
            desc.as_deref_mut().map(|d| &mut d.fields);
        field.body.save(f, obj, field, out)?;
        f.error()?;
    }
    Ok(())
}

fn save_subsections<T>(
    f: &mut Stream,
    vmsd: &VMStateDescription<T>,
    obj: &mut T,
    mut desc: Option<&mut VmsdDesc>,
) -> VmResult {
    for sub in vmsd.subsections.iter() {
        if !sub.is_needed(obj) {
            continue;
        }
        f.put_byte(QEMU_VM_SUBSECTION);
        f.put_counted_string(sub.name);
        f.put_be32(sub.version_id as u32);
        match desc.as_deref_mut() {
            Some(d) => {
                let mut sub_desc = VmsdDesc::default();
                save_state(f, sub, obj, Some(&mut sub_desc))?;
                d.subsections.push(sub_desc);
            }
            None => save_state(f, sub, obj, None)?,
        }
    }
    Ok(())
}

/// Populate `obj` from a record written at `version_id`.
///
/// On failure the stream's error is latched, and `obj` may have been
/// partially updated.
pub fn load_state<T>(
    f: &mut Stream,
    vmsd: &VMStateDescription<T>,
    obj: &mut T,
    version_id: i32,
) -> VmResult {
    let res = load_state_inner(f, vmsd, obj, version_id);
    if let Err(e) = &res {
        f.set_error(StreamError::Aborted(e.to_string()));
    }
    res
}

fn load_state_inner<T>(
    f: &mut Stream,
    vmsd: &VMStateDescription<T>,
    obj: &mut T,
    version_id: i32,
) -> VmResult {
    if version_id > vmsd.version_id {
        return Err(VmStateError::VersionTooNew {
            name: vmsd.name,
            version: version_id,
            supported: vmsd.version_id,
        });
    }
    if version_id < vmsd.minimum_version_id {
        return Err(VmStateError::VersionTooOld {
            name: vmsd.name,
            version: version_id,
            minimum: vmsd.minimum_version_id,
        });
    }
    if let Some(pre_load) = vmsd.pre_load {
        pre_load(obj)?;
    }

    for field in vmsd.fields.iter() {
        if !field.exists(obj, version_id) {
            if field.must_exist {
                return Err(VmStateError::Validation {
                    vmsd: vmsd.name,
                    field: field.name,
                });
            }
            continue;
        }
        field.body.load(f, obj, field)?;
        f.error()?;
    }

    load_subsections(f, vmsd, obj)?;
    f.error()?;

    if let Some(post_load) = vmsd.post_load {
        post_load(obj, version_id)?;
    }
    Ok(())
}

fn load_subsections<T>(
    f: &mut Stream,
    vmsd: &VMStateDescription<T>,
    obj: &mut T,
) -> VmResult {
    while f.peek_byte(0) == QEMU_VM_SUBSECTION {
        let len = f.peek_byte(1) as usize;

        // Subsection names carry their parent's name as a prefix; anything
        // else belongs to an enclosing description.
        if len < vmsd.name.len() + 1 {
            return Ok(());
        }
        let raw = f.peek_buffer(2, len);
        if raw.len() != len || !raw.starts_with(vmsd.name.as_bytes()) {
            return Ok(());
        }
        let name = String::from_utf8_lossy(&raw).into_owned();
        let sub = vmsd
            .subsections
            .iter()
            .find(|sub| sub.name == name)
            .ok_or_else(|| VmStateError::UnknownSubsection {
                parent: vmsd.name,
                name,
            })?;

        f.skip(2 + len);
        let version_id = f.get_be32() as i32;
        f.error()?;
        load_state(f, sub, obj, version_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
