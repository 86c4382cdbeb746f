// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry of saveable state and framing of the main migration stream.
//!
//! Every registered entry owns one section of the stream.  Live entries
//! ([`SaveVmHandlers`]) contribute a START section during setup, PART
//! sections while the guest runs and an END section once it has stopped.
//! Device entries, described by a [`VMStateDescription`], are written once
//! as a FULL section during completion.  Each section is followed by a
//! footer repeating its id so that a reader which lost track of the layout
//! notices immediately.
//!
//! ```text
//! be32 magic, be32 version
//! { u8 type, section header, payload, u8 footer, be32 section_id }*
//! u8 EOF
//! [u8 VMDESCRIPTION, be32 length, JSON]
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use slog::{debug, info, warn, Logger};
use strum::{FromRepr, IntoStaticStr};
use thiserror::Error;

use crate::migrate::{MigrateError, Pending, SaveVmHandlers};
use crate::stream::{Stream, StreamError};
use crate::vmstate::vmdesc::{DeviceDesc, StreamDesc, VmsdDesc};
use crate::vmstate::{self, VMStateDescription, VmResult, VmStateError};

pub const QEMU_VM_FILE_MAGIC: u32 = 0x5145564d;
pub const QEMU_VM_FILE_VERSION: u32 = 0x0000_0003;

/// Leading byte of each record in the main stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
pub enum SectionType {
    Eof = 0x00,
    SectionStart = 0x01,
    SectionPart = 0x02,
    SectionEnd = 0x03,
    SectionFull = 0x04,
    Subsection = 0x05,
    VmDescription = 0x06,
    SectionFooter = 0x7e,
}

#[derive(Debug, Error)]
pub enum SaveVmError {
    #[error("bad stream magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u32),

    #[error("section {idstr:?} instance {instance_id} is already registered")]
    Duplicate { idstr: String, instance_id: u32 },

    #[error("unknown section {idstr:?} instance {instance_id}")]
    UnknownSection { idstr: String, instance_id: u32 },

    #[error("unknown section id {0}")]
    UnknownSectionId(u32),

    #[error("unknown section type {0:#04x}")]
    UnknownSectionType(u8),

    #[error("{idstr:?}: incoming version {version} is newer than supported version {supported}")]
    VersionTooNew { idstr: String, version: i32, supported: i32 },

    #[error("section {section_id}: missing or mismatched footer")]
    BadFooter { section_id: u32 },

    #[error("postcopy is not enabled for this session")]
    PostcopyDisabled,

    #[error("{idstr:?}: {source}")]
    Handler {
        idstr: String,
        #[source]
        source: MigrateError,
    },

    #[error("{idstr:?}: {source}")]
    Device {
        idstr: String,
        #[source]
        source: VmStateError,
    },

    #[error("cannot describe saved state: {0}")]
    Description(#[from] serde_json::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Device state saved in one piece while the guest is stopped.
pub trait DeviceState: Send {
    fn version_id(&self) -> i32;

    fn save(&mut self, f: &mut Stream, desc: Option<&mut VmsdDesc>) -> VmResult;

    fn load(&mut self, f: &mut Stream, version_id: i32) -> VmResult;
}

/// A shared object serialized through its description.
pub struct VmsdDevice<T: 'static> {
    vmsd: &'static VMStateDescription<T>,
    obj: Arc<Mutex<T>>,
}

impl<T: Send + 'static> VmsdDevice<T> {
    pub fn new(vmsd: &'static VMStateDescription<T>, obj: Arc<Mutex<T>>) -> Self {
        Self { vmsd, obj }
    }
}

impl<T: Send + 'static> DeviceState for VmsdDevice<T> {
    fn version_id(&self) -> i32 {
        self.vmsd.version_id
    }

    fn save(&mut self, f: &mut Stream, desc: Option<&mut VmsdDesc>) -> VmResult {
        let mut obj = self.obj.lock().unwrap();
        vmstate::save_state(f, self.vmsd, &mut obj, desc)
    }

    fn load(&mut self, f: &mut Stream, version_id: i32) -> VmResult {
        let mut obj = self.obj.lock().unwrap();
        vmstate::load_state(f, self.vmsd, &mut obj, version_id)
    }
}

enum Handler {
    Live(Box<dyn SaveVmHandlers>),
    Device(Box<dyn DeviceState>),
}

struct Section {
    section_id: u32,
    idstr: String,
    instance_id: u32,
    version_id: i32,
}

impl Section {
    fn put_header(&self, f: &mut Stream, section_type: SectionType) {
        f.put_byte(section_type as u8);
        f.put_be32(self.section_id);
        if matches!(section_type, SectionType::SectionStart | SectionType::SectionFull) {
            f.put_counted_string(&self.idstr);
            f.put_be32(self.instance_id);
            f.put_be32(self.version_id as u32);
        }
    }

    fn put_footer(&self, f: &mut Stream) {
        f.put_byte(SectionType::SectionFooter as u8);
        f.put_be32(self.section_id);
    }

    fn handler_err(&self, source: MigrateError) -> SaveVmError {
        SaveVmError::Handler { idstr: self.idstr.clone(), source }
    }

    fn device_err(&self, source: VmStateError) -> SaveVmError {
        SaveVmError::Device { idstr: self.idstr.clone(), source }
    }
}

struct Entry {
    section: Section,
    handler: Handler,
}

impl Entry {
    fn live(&mut self) -> Option<&mut dyn SaveVmHandlers> {
        match &mut self.handler {
            Handler::Live(h) => Some(h.as_mut()),
            Handler::Device(_) => None,
        }
    }
}

/// All state taking part in one migration, in registration order.
pub struct Registry {
    entries: Vec<Entry>,
    next_section_id: u32,
    max_bandwidth: u64,
    postcopy_enabled: bool,
    in_postcopy: bool,
    log: Logger,
}

impl Registry {
    pub fn new(log: &Logger) -> Self {
        Self {
            entries: Vec::new(),
            next_section_id: 0,
            max_bandwidth: 0,
            postcopy_enabled: false,
            in_postcopy: false,
            log: log.new(slog::o!("component" => "savevm")),
        }
    }

    fn register(
        &mut self,
        idstr: &str,
        instance_id: u32,
        version_id: i32,
        handler: Handler,
    ) -> Result<u32, SaveVmError> {
        if self.find(idstr, instance_id).is_some() {
            return Err(SaveVmError::Duplicate {
                idstr: idstr.to_string(),
                instance_id,
            });
        }
        let section_id = self.next_section_id;
        self.next_section_id += 1;
        debug!(self.log, "registered section";
            "idstr" => idstr,
            "instance_id" => instance_id,
            "section_id" => section_id);
        self.entries.push(Entry {
            section: Section {
                section_id,
                idstr: idstr.to_string(),
                instance_id,
                version_id,
            },
            handler,
        });
        Ok(section_id)
    }

    /// Register a live handler.  Returns the id of its section.
    pub fn register_live(
        &mut self,
        idstr: &str,
        instance_id: u32,
        version_id: i32,
        handler: Box<dyn SaveVmHandlers>,
    ) -> Result<u32, SaveVmError> {
        self.register(idstr, instance_id, version_id, Handler::Live(handler))
    }

    /// Register `obj`, saved through `vmsd` once the guest has stopped.
    pub fn register_vmstate<T: Send + 'static>(
        &mut self,
        idstr: &str,
        instance_id: u32,
        vmsd: &'static VMStateDescription<T>,
        obj: Arc<Mutex<T>>,
    ) -> Result<u32, SaveVmError> {
        self.register_device(idstr, instance_id, Box::new(VmsdDevice::new(vmsd, obj)))
    }

    pub fn register_device(
        &mut self,
        idstr: &str,
        instance_id: u32,
        dev: Box<dyn DeviceState>,
    ) -> Result<u32, SaveVmError> {
        let version_id = dev.version_id();
        self.register(idstr, instance_id, version_id, Handler::Device(dev))
    }

    pub fn unregister(&mut self, idstr: &str, instance_id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| {
            !(e.section.idstr == idstr && e.section.instance_id == instance_id)
        });
        self.entries.len() != before
    }

    fn find(&self, idstr: &str, instance_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.section.idstr == idstr && e.section.instance_id == instance_id)
    }

    /// Bytes which may be written per rate-limit window.  Zero means
    /// unlimited.  The orchestrator opens each window with
    /// [`Stream::reset_rate_limit`].
    pub fn set_max_bandwidth(&mut self, bytes: u64) {
        self.max_bandwidth = bytes;
    }

    pub fn max_bandwidth(&self) -> u64 {
        self.max_bandwidth
    }

    pub fn set_postcopy(&mut self, enabled: bool) {
        self.postcopy_enabled = enabled;
    }

    pub fn in_postcopy(&self) -> bool {
        self.in_postcopy
    }

    /// Write the stream header and every live handler's setup section.
    pub fn save_setup(&mut self, f: &mut Stream) -> Result<(), SaveVmError> {
        f.set_rate_limit(self.max_bandwidth);
        f.put_be32(QEMU_VM_FILE_MAGIC);
        f.put_be32(QEMU_VM_FILE_VERSION);

        for Entry { section, handler } in self.entries.iter_mut() {
            let Handler::Live(h) = handler else { continue };
            if !h.is_active() {
                continue;
            }
            section.put_header(f, SectionType::SectionStart);
            let res = h.save_setup(f);
            section.put_footer(f);
            res.map_err(|e| section.handler_err(e))?;
        }
        f.flush();
        Ok(f.error()?)
    }

    /// One pass over the live handlers.  Returns true once every handler
    /// reports it has nothing left to send before completion.  A pass stops
    /// early when the stream's rate limit has been spent.
    pub fn save_iterate(&mut self, f: &mut Stream) -> Result<bool, SaveVmError> {
        let postcopy = self.in_postcopy;
        let mut all_finished = true;
        for Entry { section, handler } in self.entries.iter_mut() {
            let Handler::Live(h) = handler else { continue };
            if !h.is_active() || !h.is_active_iterate() {
                continue;
            }
            // Once in postcopy only the handlers which support it iterate.
            if postcopy && !h.has_postcopy() {
                continue;
            }
            if f.rate_limit_exceeded() {
                return Ok(false);
            }
            section.put_header(f, SectionType::SectionPart);
            let res = h.save_live_iterate(f);
            section.put_footer(f);
            match res {
                Ok(done) => all_finished &= done,
                Err(e) => return Err(section.handler_err(e)),
            }
        }
        f.error()?;
        Ok(all_finished)
    }

    /// Finish every live handler which completes in precopy, write the
    /// device sections, then the end of stream marker.  With `vmdesc` a
    /// JSON description of the device sections follows the marker.
    pub fn save_complete_precopy(
        &mut self,
        f: &mut Stream,
        vmdesc: bool,
    ) -> Result<(), SaveVmError> {
        let postcopy = self.in_postcopy;
        for Entry { section, handler } in self.entries.iter_mut() {
            let Handler::Live(h) = handler else { continue };
            if !h.is_active() || (postcopy && h.has_postcopy()) {
                continue;
            }
            section.put_header(f, SectionType::SectionEnd);
            let res = h.save_live_complete_precopy(f);
            section.put_footer(f);
            res.map_err(|e| section.handler_err(e))?;
        }

        let mut desc = StreamDesc::default();
        for Entry { section, handler } in self.entries.iter_mut() {
            let Handler::Device(dev) = handler else { continue };
            let mut state = VmsdDesc::default();
            section.put_header(f, SectionType::SectionFull);
            let res = dev.save(f, vmdesc.then_some(&mut state));
            section.put_footer(f);
            res.map_err(|e| section.device_err(e))?;
            desc.devices.push(DeviceDesc {
                name: section.idstr.clone(),
                instance_id: section.instance_id,
                state,
            });
        }

        if postcopy {
            // The remaining sections and the end marker follow later.
            f.flush();
            return Ok(f.error()?);
        }

        f.put_byte(SectionType::Eof as u8);
        if vmdesc {
            let json = desc.to_json()?;
            f.put_byte(SectionType::VmDescription as u8);
            f.put_be32(json.len() as u32);
            f.put_buffer(json.as_bytes());
        }
        f.flush();
        f.error()?;
        info!(self.log, "precopy complete"; "bytes" => f.transferred());
        Ok(())
    }

    /// Finish the handlers which deferred completion to postcopy.
    pub fn save_complete_postcopy(&mut self, f: &mut Stream) -> Result<(), SaveVmError> {
        for Entry { section, handler } in self.entries.iter_mut() {
            let Handler::Live(h) = handler else { continue };
            if !h.is_active() || !h.has_postcopy() {
                continue;
            }
            section.put_header(f, SectionType::SectionEnd);
            let res = h.save_live_complete_postcopy(f);
            section.put_footer(f);
            res.map_err(|e| section.handler_err(e))?;
        }
        f.put_byte(SectionType::Eof as u8);
        f.flush();
        Ok(f.error()?)
    }

    /// Sum of every live handler's estimate.
    pub fn save_pending(&mut self, max_size: u64) -> Pending {
        let mut pending = Pending::default();
        for entry in self.entries.iter_mut() {
            if let Some(h) = entry.live() {
                if h.is_active() {
                    pending += h.save_pending(max_size);
                }
            }
        }
        pending
    }

    pub fn save_cleanup(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Some(h) = entry.live() {
                h.save_cleanup();
            }
        }
        self.in_postcopy = false;
    }

    /// Switch the source to postcopy.  Handlers which support it finish in
    /// [`Registry::save_complete_postcopy`].
    pub fn enter_postcopy(&mut self) -> Result<(), SaveVmError> {
        if !self.postcopy_enabled {
            return Err(SaveVmError::PostcopyDisabled);
        }
        info!(self.log, "entering postcopy");
        self.in_postcopy = true;
        for entry in self.entries.iter_mut() {
            if let Some(h) = entry.live() {
                h.enter_postcopy();
            }
        }
        Ok(())
    }

    /// Notify every live handler that the guest is about to run on the
    /// destination.
    pub fn before_vm_start(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Some(h) = entry.live() {
                h.before_vm_start();
            }
        }
    }

    fn check_footer(f: &mut Stream, section_id: u32) -> Result<(), SaveVmError> {
        let marker = f.get_byte();
        let id = f.get_be32();
        f.error()?;
        if marker != SectionType::SectionFooter as u8 || id != section_id {
            return Err(SaveVmError::BadFooter { section_id });
        }
        Ok(())
    }

    fn load_section(
        &mut self,
        f: &mut Stream,
        idx: usize,
        version_id: i32,
    ) -> Result<(), SaveVmError> {
        let Entry { section, handler } = &mut self.entries[idx];
        match handler {
            Handler::Live(h) => {
                h.load_state(f, version_id).map_err(|e| section.handler_err(e))
            }
            Handler::Device(dev) => {
                dev.load(f, version_id).map_err(|e| section.device_err(e))
            }
        }
    }

    /// Read a whole stream, dispatching each section to the entry
    /// registered under the same id string and instance.
    pub fn load_state(&mut self, f: &mut Stream) -> Result<(), SaveVmError> {
        let magic = f.get_be32();
        let version = f.get_be32();
        f.error()?;
        if magic != QEMU_VM_FILE_MAGIC {
            return Err(SaveVmError::BadMagic(magic));
        }
        if version != QEMU_VM_FILE_VERSION {
            return Err(SaveVmError::UnsupportedVersion(version));
        }

        // Section id on the wire to (entry, version) for PART/END sections.
        let mut sections: BTreeMap<u32, (usize, i32)> = BTreeMap::new();
        loop {
            let raw = f.get_byte();
            f.error()?;
            let section_type = SectionType::from_repr(raw)
                .ok_or(SaveVmError::UnknownSectionType(raw))?;
            match section_type {
                SectionType::SectionStart | SectionType::SectionFull => {
                    let section_id = f.get_be32();
                    let idstr = f.get_counted_string()?;
                    let instance_id = f.get_be32();
                    let version_id = f.get_be32() as i32;
                    f.error()?;

                    let Some(idx) = self.find(&idstr, instance_id) else {
                        return Err(SaveVmError::UnknownSection { idstr, instance_id });
                    };
                    let supported = self.entries[idx].section.version_id;
                    if version_id > supported {
                        return Err(SaveVmError::VersionTooNew {
                            idstr,
                            version: version_id,
                            supported,
                        });
                    }
                    debug!(self.log, "loading section";
                        "type" => <&'static str>::from(section_type),
                        "idstr" => &idstr,
                        "instance_id" => instance_id,
                        "section_id" => section_id,
                        "version" => version_id);
                    sections.insert(section_id, (idx, version_id));
                    self.load_section(f, idx, version_id)?;
                    Self::check_footer(f, section_id)?;
                }
                SectionType::SectionPart | SectionType::SectionEnd => {
                    let section_id = f.get_be32();
                    f.error()?;
                    let Some(&(idx, version_id)) = sections.get(&section_id) else {
                        return Err(SaveVmError::UnknownSectionId(section_id));
                    };
                    self.load_section(f, idx, version_id)?;
                    Self::check_footer(f, section_id)?;
                }
                SectionType::Eof => break,
                other => return Err(SaveVmError::UnknownSectionType(other as u8)),
            }
        }

        // A trailing description is for analysis tools only.
        if !f.at_eof() && f.peek_byte(0) == SectionType::VmDescription as u8 {
            f.skip(1);
            let len = f.get_be32() as usize;
            f.skip(len);
            if f.error().is_err() {
                warn!(self.log, "truncated state description");
            }
        }
        Ok(())
    }
}
