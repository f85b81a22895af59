//! Offline authoring of address spaces and the boot image they are serialized into.
//!
//! An [`Image`] collects objects in allocation order. Object `n` of an image is referenced by
//! `ObjectRef { id: n, generation: 0 }` both while authoring and after the image was loaded into an
//! [`ObjectStore`](crate::store::ObjectStore), which is why loading is a plain copy.
//!
//! # Format
//! All integers are little-endian.
//!
//! | Offset                          | Content                                                          |
//! |---------------------------------|------------------------------------------------------------------|
//! | `0`                             | header page (see [`ImageHeader`])                                |
//! | `PAGE_SIZE`                     | `{kind: u32, bank: u32}` per object, then 16 bytes per root cap  |
//! | `(1 + meta_pages) * PAGE_SIZE`  | one page per object in allocation order                          |
//!
//! A GPT page holds `l2v` in byte 0, its flags in byte 1 (`1` = handler, `2` = background) and its slots
//! from byte 16 onwards.

use crate::builder::BuildError;
use crate::cap::{Capability, Restrictions, Target};
use crate::guard::{Guard, GuardError};
use crate::object::{Gpt, Object, ObjectKind, ObjectRef, ObjectSource};
use crate::store::BankId;
use crate::walk::{self, FaultCode};
use crate::{
    ADDR_BITS, CAPS_PER_PAGE, CAP_SIZE, GPT_BACKGROUND_SLOT, GPT_HANDLER_SLOT, GPT_SLOT_INDEX_BITS,
    GUARD_MATCH_BITS, MAX_L2V, NUM_GPT_SLOTS, PAGE_ADDR_BITS, PAGE_SIZE,
};
use alloc::vec;
use alloc::vec::Vec;
use thiserror_no_std::Error;

const IMAGE_MAGIC: [u8; 8] = *b"gptimage";
const IMAGE_VERSION: u32 = 2;

/// The `l2v` of the root GPT of a fresh address space
pub const ROOT_L2V: u8 = 60;

const GPT_FLAG_HANDLER: u8 = 1 << 0;
const GPT_FLAG_BACKGROUND: u8 = 1 << 1;
const GPT_SLOTS_OFFSET: usize = 16;

const CAP_TYPE_NULL: u8 = 0;
const CAP_TYPE_GPT: u8 = 1;
const CAP_TYPE_PAGE: u8 = 2;
const CAP_TYPE_CAP_PAGE: u8 = 3;
const CAP_TYPE_ENTRY: u8 = 4;

/// Errors that can occur when reading a boot image
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ImageError {
    #[error("The provided buffer did not contain the required magic bytes at the start")]
    InvalidMagic,
    #[error("The image is encoded using version {0} which is not supported")]
    UnsupportedVersion(u32),
    #[error("The image was built for pages of {0} bytes")]
    UnsupportedPageSize(u32),
    #[error("The provided buffer is too small to contain the whole image")]
    Truncated,
    #[error("Object {index} has the unknown kind {kind}")]
    InvalidKind { index: usize, kind: u32 },
    #[error("A capability has the unknown type {0}")]
    InvalidCapabilityType(u8),
    #[error("A capability has the unknown restrictions {0:#x}")]
    InvalidRestrictions(u16),
    #[error("A capability carries an invalid guard: {0}")]
    InvalidGuard(#[from] GuardError),
    #[error("A capability references object {0} which does not exist or has a different kind")]
    DanglingReference(u32),
    #[error("GPT {index} has the invalid l2v {l2v}")]
    InvalidL2v { index: usize, l2v: u8 },
    #[error("The image was built with guards matching {0} bits")]
    InvalidGuardMatchBits(u32),
}

/// The header page at the start of every boot image
#[derive(Debug, Eq, PartialEq)]
pub struct ImageHeader {
    pub version: u32,
    pub page_size: u32,
    pub num_objects: u32,
    pub num_roots: u32,
    /// How many pages of allocation records and root capabilities follow the header
    pub meta_pages: u32,
    /// The [`ImageConfig::guard_match_bits`] the image was authored with
    pub guard_match_bits: u32,
}

impl ImageHeader {
    const SIZE: usize = 32;

    /// Try to read a header from a provided buffer
    pub fn read_from_buffer(buf: &[u8]) -> Result<Self, ImageError> {
        if buf.len() < Self::SIZE {
            return Err(ImageError::Truncated);
        }
        if buf[..8] != IMAGE_MAGIC {
            return Err(ImageError::InvalidMagic);
        }
        let version = read_u32(buf, 8)?;
        if version != IMAGE_VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let page_size = read_u32(buf, 12)?;
        if page_size as usize != PAGE_SIZE {
            return Err(ImageError::UnsupportedPageSize(page_size));
        }
        Ok(Self {
            version,
            page_size,
            num_objects: read_u32(buf, 16)?,
            num_roots: read_u32(buf, 20)?,
            meta_pages: read_u32(buf, 24)?,
            guard_match_bits: read_u32(buf, 28)?,
        })
    }

    fn write_to_buffer(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&IMAGE_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.num_objects.to_le_bytes());
        buf[20..24].copy_from_slice(&self.num_roots.to_le_bytes());
        buf[24..28].copy_from_slice(&self.meta_pages.to_le_bytes());
        buf[28..32].copy_from_slice(&self.guard_match_bits.to_le_bytes());
    }
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, ImageError> {
    let bytes = buf.get(at..at + 4).ok_or(ImageError::Truncated)?;
    let mut raw = [0; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}

/// Serialize a capability into its 16 byte image representation
pub fn encode_cap(cap: &Capability) -> [u8; CAP_SIZE] {
    let mut raw = [0; CAP_SIZE];
    let (ty, obj) = match cap.target() {
        Target::Null => return raw,
        Target::Entry(payload) => {
            raw[0] = CAP_TYPE_ENTRY;
            raw[8..16].copy_from_slice(&payload.to_le_bytes());
            return raw;
        }
        Target::Gpt(obj) => (CAP_TYPE_GPT, obj),
        Target::Page(obj) => (CAP_TYPE_PAGE, obj),
        Target::CapPage(obj) => (CAP_TYPE_CAP_PAGE, obj),
    };
    let guard = cap.guard();
    raw[0] = ty;
    raw[1..3].copy_from_slice(&cap.restrictions().bits().to_le_bytes());
    raw[3] = guard.l2g();
    raw[4..8].copy_from_slice(&(guard.match_value() as u32).to_le_bytes());
    raw[8..12].copy_from_slice(&obj.id.0.to_le_bytes());
    raw[12..16].copy_from_slice(&obj.generation.to_le_bytes());
    raw
}

/// Deserialize a capability from its 16 byte image representation
pub fn decode_cap(raw: &[u8]) -> Result<Capability, ImageError> {
    if raw.len() < CAP_SIZE {
        return Err(ImageError::Truncated);
    }
    let kind = match raw[0] {
        CAP_TYPE_NULL => return Ok(Capability::NULL),
        CAP_TYPE_ENTRY => {
            let mut payload = [0; 8];
            payload.copy_from_slice(&raw[8..16]);
            return Ok(Capability::entry(u64::from_le_bytes(payload)));
        }
        CAP_TYPE_GPT => ObjectKind::Gpt,
        CAP_TYPE_PAGE => ObjectKind::Page,
        CAP_TYPE_CAP_PAGE => ObjectKind::CapPage,
        other => return Err(ImageError::InvalidCapabilityType(other)),
    };
    let restr_bits = u16::from_le_bytes([raw[1], raw[2]]);
    let restr =
        Restrictions::from_bits(restr_bits).ok_or(ImageError::InvalidRestrictions(restr_bits))?;
    let guard = Guard::new(read_u32(raw, 4)? as u64, raw[3])?;
    let obj = ObjectRef::new(read_u32(raw, 8)?, read_u32(raw, 12)?);
    Ok(Capability::memory(kind, obj, restr, guard))
}

/// Parameters of the offline builder
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageConfig {
    /// How many offset bits a single guard absorbs before the builder wraps a subspace in another GPT
    pub guard_match_bits: u8,
    /// Upper bound on the number of objects the image may hold
    pub max_objects: Option<usize>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            guard_match_bits: GUARD_MATCH_BITS,
            max_objects: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct ImageObject {
    bank: BankId,
    object: Object,
}

/// A collection of objects that is authored offline and loaded wholesale at startup
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Image {
    config: ImageConfig,
    objects: Vec<ImageObject>,
    roots: Vec<Capability>,
}

impl Image {
    pub fn new(config: ImageConfig) -> Self {
        Self {
            config,
            objects: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub(crate) fn guard_match_bits(&self) -> u8 {
        self.config.guard_match_bits.clamp(1, GUARD_MATCH_BITS)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterate over all objects in allocation order along with the bank owning them
    pub fn objects(&self) -> impl Iterator<Item = (BankId, &Object)> + '_ {
        self.objects.iter().map(|o| (o.bank, &o.object))
    }

    pub fn object(&self, obj: ObjectRef) -> Option<&Object> {
        if obj.generation != 0 {
            return None;
        }
        self.objects.get(obj.id.0 as usize).map(|o| &o.object)
    }

    fn object_mut(&mut self, obj: ObjectRef) -> Option<&mut Object> {
        if obj.generation != 0 {
            return None;
        }
        self.objects.get_mut(obj.id.0 as usize).map(|o| &mut o.object)
    }

    pub(crate) fn gpt_mut(&mut self, obj: ObjectRef) -> Result<&mut Gpt, BuildError> {
        self.object_mut(obj)
            .and_then(Object::as_gpt_mut)
            .ok_or(BuildError::NotAddressSpace)
    }

    /// Allocate a fresh object of the given kind on behalf of `bank`
    pub fn alloc(&mut self, kind: ObjectKind, bank: BankId) -> Result<ObjectRef, BuildError> {
        if self.config.max_objects.is_some_and(|max| self.objects.len() >= max) {
            return Err(BuildError::Exhausted);
        }
        let index = self.objects.len() as u32;
        self.objects.push(ImageObject {
            bank,
            object: Object::new(kind),
        });
        log::trace!("[image] allocated {kind:?} #{index} for {bank:?}");
        Ok(ObjectRef::new(index, 0))
    }

    /// Allocate a GPT with the given `l2v` and return a capability spanning all of its slots
    pub fn alloc_gpt(&mut self, bank: BankId, l2v: u8) -> Result<Capability, BuildError> {
        if !(PAGE_ADDR_BITS..=MAX_L2V).contains(&l2v) {
            return Err(BuildError::SizeOutOfRange(l2v));
        }
        let obj = self.alloc(ObjectKind::Gpt, bank)?;
        self.gpt_mut(obj)?.l2v = l2v;
        let guard = Guard::span((l2v + GPT_SLOT_INDEX_BITS).min(ADDR_BITS))?;
        Ok(Capability::memory(
            ObjectKind::Gpt,
            obj,
            Restrictions::empty(),
            guard,
        ))
    }

    /// Allocate a data page initialized with `content` followed by zeroes
    pub fn alloc_page(&mut self, bank: BankId, content: &[u8]) -> Result<Capability, BuildError> {
        if content.len() > PAGE_SIZE {
            return Err(BuildError::ContentTooLarge(content.len()));
        }
        let obj = self.alloc(ObjectKind::Page, bank)?;
        let cap = Capability::memory(ObjectKind::Page, obj, Restrictions::empty(), Guard::PAGE);
        self.write_page(cap, 0, content)?;
        Ok(cap)
    }

    pub fn alloc_cap_page(&mut self, bank: BankId) -> Result<Capability, BuildError> {
        let obj = self.alloc(ObjectKind::CapPage, bank)?;
        Ok(Capability::memory(
            ObjectKind::CapPage,
            obj,
            Restrictions::empty(),
            Guard::PAGE,
        ))
    }

    /// Create an empty address space consisting of a root GPT with the largest `l2v` a space starts with
    pub fn new_space(&mut self, bank: BankId) -> Result<Capability, BuildError> {
        let root = self.alloc_gpt(bank, ROOT_L2V)?;
        Ok(root.with_guard(Guard::FULL))
    }

    pub fn write_page(
        &mut self,
        page: Capability,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), BuildError> {
        let Some((ObjectKind::Page, obj)) = page.memory_object() else {
            return Err(BuildError::NotMemory);
        };
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= PAGE_SIZE)
            .ok_or(BuildError::ContentTooLarge(offset.saturating_add(bytes.len())))?;
        match self.object_mut(obj) {
            Some(Object::Page(data)) => {
                data[offset..end].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(BuildError::NotMemory),
        }
    }

    pub fn set_cap(
        &mut self,
        cap_page: Capability,
        index: usize,
        cap: Capability,
    ) -> Result<(), BuildError> {
        let Some((ObjectKind::CapPage, obj)) = cap_page.memory_object() else {
            return Err(BuildError::NotMemory);
        };
        match self.object_mut(obj) {
            Some(Object::CapPage(caps)) if index < CAPS_PER_PAGE => {
                caps[index] = cap;
                Ok(())
            }
            _ => Err(BuildError::NotMemory),
        }
    }

    fn gpt_of(&mut self, gpt: Capability) -> Result<&mut Gpt, BuildError> {
        match gpt.memory_object() {
            Some((ObjectKind::Gpt, obj)) => self.gpt_mut(obj),
            _ => Err(BuildError::NotAddressSpace),
        }
    }

    pub fn set_l2v(&mut self, gpt: Capability, l2v: u8) -> Result<(), BuildError> {
        if !(PAGE_ADDR_BITS..=MAX_L2V).contains(&l2v) {
            return Err(BuildError::SizeOutOfRange(l2v));
        }
        self.gpt_of(gpt)?.l2v = l2v;
        Ok(())
    }

    /// Install `handler` as the fault handler of a GPT, giving up half of its addressable slots
    pub fn set_handler(&mut self, gpt: Capability, handler: Capability) -> Result<(), BuildError> {
        let gpt = self.gpt_of(gpt)?;
        gpt.has_handler = true;
        gpt.slots[GPT_HANDLER_SLOT] = handler;
        Ok(())
    }

    /// Install `background` as the background space of a GPT, giving up half of its addressable slots
    pub fn set_background(
        &mut self,
        gpt: Capability,
        background: Capability,
    ) -> Result<(), BuildError> {
        let gpt = self.gpt_of(gpt)?;
        gpt.has_background = true;
        gpt.slots[GPT_BACKGROUND_SLOT] = background;
        Ok(())
    }

    /// Export a capability so that it can be found again after loading, returning its root index
    pub fn export_root(&mut self, cap: Capability) -> usize {
        self.roots.push(cap);
        self.roots.len() - 1
    }

    pub fn roots(&self) -> &[Capability] {
        &self.roots
    }

    /// Find the leaf `addr` resolves to within `space`
    pub fn resolve(
        &self,
        space: Capability,
        addr: u64,
    ) -> Result<(ObjectKind, ObjectRef, u64), FaultCode> {
        walk::resolve(self, space, addr)
    }

    fn meta_pages(&self) -> usize {
        (self.objects.len() * 8 + self.roots.len() * CAP_SIZE).div_ceil(PAGE_SIZE)
    }

    /// Serialize the image into its boot format
    pub fn to_bytes(&self) -> Vec<u8> {
        let meta_pages = self.meta_pages();
        let mut buf = vec![0; (1 + meta_pages + self.objects.len()) * PAGE_SIZE];

        ImageHeader {
            version: IMAGE_VERSION,
            page_size: PAGE_SIZE as u32,
            num_objects: self.objects.len() as u32,
            num_roots: self.roots.len() as u32,
            meta_pages: meta_pages as u32,
            guard_match_bits: self.guard_match_bits() as u32,
        }
        .write_to_buffer(&mut buf);

        let mut pos = PAGE_SIZE;
        for object in self.objects.iter() {
            let kind = object.object.kind() as u32;
            buf[pos..pos + 4].copy_from_slice(&kind.to_le_bytes());
            buf[pos + 4..pos + 8].copy_from_slice(&object.bank.0.to_le_bytes());
            pos += 8;
        }
        for root in self.roots.iter() {
            buf[pos..pos + CAP_SIZE].copy_from_slice(&encode_cap(root));
            pos += CAP_SIZE;
        }

        for (i, object) in self.objects.iter().enumerate() {
            let page = &mut buf[(1 + meta_pages + i) * PAGE_SIZE..][..PAGE_SIZE];
            match &object.object {
                Object::Gpt(gpt) => {
                    page[0] = gpt.l2v;
                    if gpt.has_handler {
                        page[1] |= GPT_FLAG_HANDLER;
                    }
                    if gpt.has_background {
                        page[1] |= GPT_FLAG_BACKGROUND;
                    }
                    for (j, slot) in gpt.slots.iter().enumerate() {
                        let at = GPT_SLOTS_OFFSET + j * CAP_SIZE;
                        page[at..at + CAP_SIZE].copy_from_slice(&encode_cap(slot));
                    }
                }
                Object::Page(data) => page.copy_from_slice(data.as_slice()),
                Object::CapPage(caps) => {
                    for (j, cap) in caps.iter().enumerate() {
                        page[j * CAP_SIZE..][..CAP_SIZE].copy_from_slice(&encode_cap(cap));
                    }
                }
            }
        }
        buf
    }

    /// Read an image from its boot format, validating every reference it contains
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ImageError> {
        let header = ImageHeader::read_from_buffer(buf)?;
        let num_objects = header.num_objects as usize;
        let num_roots = header.num_roots as usize;
        let meta_pages = header.meta_pages as usize;
        let guard_match_bits = match u8::try_from(header.guard_match_bits) {
            Ok(bits @ 1..=GUARD_MATCH_BITS) => bits,
            _ => return Err(ImageError::InvalidGuardMatchBits(header.guard_match_bits)),
        };
        if num_objects * 8 + num_roots * CAP_SIZE > meta_pages * PAGE_SIZE
            || buf.len() < (1 + meta_pages + num_objects) * PAGE_SIZE
        {
            return Err(ImageError::Truncated);
        }

        let mut objects = Vec::with_capacity(num_objects);
        for index in 0..num_objects {
            let record = PAGE_SIZE + index * 8;
            let kind = match read_u32(buf, record)? {
                1 => ObjectKind::Gpt,
                2 => ObjectKind::Page,
                3 => ObjectKind::CapPage,
                kind => return Err(ImageError::InvalidKind { index, kind }),
            };
            let bank = BankId(read_u32(buf, record + 4)?);
            let page = &buf[(1 + meta_pages + index) * PAGE_SIZE..][..PAGE_SIZE];
            let object = match kind {
                ObjectKind::Gpt => {
                    let l2v = page[0];
                    if !(PAGE_ADDR_BITS..=MAX_L2V).contains(&l2v) {
                        return Err(ImageError::InvalidL2v { index, l2v });
                    }
                    let mut gpt = Gpt::new();
                    gpt.l2v = l2v;
                    gpt.has_handler = page[1] & GPT_FLAG_HANDLER != 0;
                    gpt.has_background = page[1] & GPT_FLAG_BACKGROUND != 0;
                    for (j, slot) in gpt.slots.iter_mut().enumerate() {
                        *slot = decode_cap(&page[GPT_SLOTS_OFFSET + j * CAP_SIZE..])?;
                    }
                    Object::Gpt(gpt)
                }
                ObjectKind::Page => {
                    let mut data = Object::new(ObjectKind::Page);
                    if let Object::Page(content) = &mut data {
                        content.copy_from_slice(page);
                    }
                    data
                }
                ObjectKind::CapPage => {
                    let mut data = Object::new(ObjectKind::CapPage);
                    if let Object::CapPage(caps) = &mut data {
                        for (j, cap) in caps.iter_mut().enumerate() {
                            *cap = decode_cap(&page[j * CAP_SIZE..])?;
                        }
                    }
                    data
                }
            };
            objects.push(ImageObject { bank, object });
        }

        let roots_at = PAGE_SIZE + num_objects * 8;
        let roots = (0..num_roots)
            .map(|i| decode_cap(&buf[roots_at + i * CAP_SIZE..]))
            .collect::<Result<Vec<_>, _>>()?;

        let image = Self {
            config: ImageConfig {
                guard_match_bits,
                ..ImageConfig::default()
            },
            objects,
            roots,
        };
        image.check_references()?;
        Ok(image)
    }

    fn check_references(&self) -> Result<(), ImageError> {
        let check = |cap: &Capability| match cap.memory_object() {
            Some((kind, obj)) if self.object(obj).map(Object::kind) != Some(kind) => {
                Err(ImageError::DanglingReference(obj.id.0))
            }
            _ => Ok(()),
        };
        for object in self.objects.iter() {
            match &object.object {
                Object::Gpt(gpt) => gpt.slots.iter().try_for_each(check)?,
                Object::CapPage(caps) => caps.iter().try_for_each(check)?,
                Object::Page(_) => {}
            }
        }
        self.roots.iter().try_for_each(check)
    }
}

impl Default for Image {
    fn default() -> Self {
        Self::new(ImageConfig::default())
    }
}

impl ObjectSource for Image {
    fn with_gpt<R>(&self, obj: ObjectRef, f: impl FnOnce(&Gpt) -> R) -> Option<R> {
        self.object(obj).and_then(Object::as_gpt).map(f)
    }

    fn kind_of(&self, obj: ObjectRef) -> Option<ObjectKind> {
        self.object(obj).map(Object::kind)
    }
}

static_assertions::const_assert!(GPT_SLOTS_OFFSET + NUM_GPT_SLOTS * CAP_SIZE <= PAGE_SIZE);
