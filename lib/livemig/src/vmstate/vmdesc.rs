// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON description of saved state.
//!
//! While saving, the interpreter can record what it wrote: one entry per
//! field element with its codec name and encoded size.  The description is
//! a side channel for analysis tools and never influences the wire bytes.

use serde::Serialize;

/// Description of one saved structure.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct VmsdDesc {
    pub vmsd_name: String,
    pub version: i32,
    pub fields: Vec<FieldDesc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subsections: Vec<VmsdDesc>,
}

/// Description of one field element, or of a run of identical elements.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_len: Option<usize>,
    #[serde(rename = "type")]
    pub ty: &'static str,
    #[serde(rename = "struct", skip_serializing_if = "Option::is_none")]
    pub structure: Option<Box<VmsdDesc>>,
    pub size: u64,
}

/// One registered device section in the description of a whole stream.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceDesc {
    pub name: String,
    pub instance_id: u32,
    #[serde(flatten)]
    pub state: VmsdDesc,
}

/// Description of an entire saved stream.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamDesc {
    pub devices: Vec<DeviceDesc>,
}

impl StreamDesc {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Collects the element entries of a single field.
pub(crate) struct FieldDescWriter<'a> {
    out: Option<&'a mut Vec<FieldDesc>>,
    name: &'static str,
    count: usize,
    compress: bool,
    first: Option<usize>,
}

impl<'a> FieldDescWriter<'a> {
    pub(crate) fn new(
        out: Option<&'a mut Vec<FieldDesc>>,
        name: &'static str,
        count: usize,
        compress: bool,
    ) -> Self {
        Self { out, name, count, compress, first: None }
    }

    /// Whether a nested structure description is wanted for element `idx`.
    pub(crate) fn wants(&self, idx: usize) -> bool {
        self.out.is_some() && (idx == 0 || !self.compress)
    }

    /// Record element `idx`.  When the field is compressible only the
    /// first element is kept, and it stands for the whole array.
    pub(crate) fn element(
        &mut self,
        idx: usize,
        ty: &'static str,
        structure: Option<VmsdDesc>,
        size: u64,
    ) {
        if !self.wants(idx) {
            return;
        }
        let Some(out) = self.out.as_deref_mut() else {
            return;
        };
        let multi = self.count > 1;
        let (index, array_len) = match (multi, self.compress) {
            (false, _) => (None, None),
            (true, true) => (None, Some(self.count)),
            (true, false) => (Some(idx), None),
        };
        // Runs of null pointers collapse into one entry.
        if ty == "nullptr" && !self.compress {
            if let Some(prev) = out.last_mut() {
                if prev.ty == "nullptr" && self.first.is_some() {
                    prev.array_len = Some(prev.array_len.unwrap_or(1) + 1);
                    prev.size += size;
                    return;
                }
            }
        }
        self.first.get_or_insert(out.len());
        out.push(FieldDesc {
            name: self.name.to_string(),
            index,
            array_len,
            ty,
            structure: structure.map(Box::new),
            size,
        });
    }
}
