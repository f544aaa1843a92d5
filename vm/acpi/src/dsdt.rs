// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A small AML encoder for building the Differentiated System Description
//! Table (DSDT) and device fragments that live in it.

pub mod helpers;
pub mod objects;
pub mod resources;

pub use helpers::*;
pub use objects::*;
pub use resources::*;

/// An EISA ID such as `PNP0C31`, compressed into a 32-bit integer.
pub struct EisaId(pub [u8; 7]);

impl DsdtObject for EisaId {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        let mut id: [u8; 4] = [0; 4];
        id[0] = (self.0[0] - b'@') << 2 | (self.0[1] - b'@') >> 3;
        id[1] = (self.0[1] & 7) << 5 | (self.0[2] - b'@');
        id[2] = char_to_hex(self.0[3]) << 4 | char_to_hex(self.0[4]);
        id[3] = char_to_hex(self.0[5]) << 4 | char_to_hex(self.0[6]);
        byte_stream.extend_from_slice(&encode_integer(u32::from_le_bytes(id).into()));
    }
}

/// A `Device(<name>) { ... }` node.
pub struct Device {
    name: Vec<u8>,
    objects: Vec<u8>,
}

impl Device {
    pub fn new(name: &[u8]) -> Self {
        Self {
            name: encode_name(name),
            objects: vec![],
        }
    }

    pub fn add_object(&mut self, obj: &impl DsdtObject) {
        obj.append_to_vec(&mut self.objects);
    }
}

impl DsdtObject for Device {
    // ExtOpPrefix + DeviceOp (0x5b 0x82), the package length, the name and
    // then the contained objects.
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        byte_stream.extend_from_slice(&[0x5b, 0x82]);
        byte_stream.extend_from_slice(&encode_package_len(self.name.len() + self.objects.len()));
        byte_stream.extend_from_slice(&self.name);
        byte_stream.extend_from_slice(&self.objects);
    }
}

/// A `Scope(<name>) { ... }` block that devices are emitted into.
pub struct Scope {
    name: Vec<u8>,
    objects: Vec<u8>,
}

impl Scope {
    pub fn new(name: &[u8]) -> Self {
        Self {
            name: encode_name(name),
            objects: vec![],
        }
    }

    pub fn add_object(&mut self, obj: &impl DsdtObject) {
        obj.append_to_vec(&mut self.objects);
    }

    /// Returns true if nothing has been emitted into the scope.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl DsdtObject for Scope {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        byte_stream.push(0x10);
        byte_stream.extend_from_slice(&encode_package_len(self.name.len() + self.objects.len()));
        byte_stream.extend_from_slice(&self.name);
        byte_stream.extend_from_slice(&self.objects);
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionSpace {
    SystemMemory = 0,
    SystemIo = 1,
}

/// `OperationRegion(<name>, <space>, <offset>, <length>)`
pub struct OperationRegion {
    name: Vec<u8>,
    space: RegionSpace,
    offset: u64,
    length: u64,
}

impl OperationRegion {
    pub fn new(name: &[u8], space: RegionSpace, offset: u64, length: u64) -> Self {
        Self {
            name: encode_name(name),
            space,
            offset,
            length,
        }
    }
}

impl DsdtObject for OperationRegion {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        byte_stream.extend_from_slice(&[0x5b, 0x80]);
        byte_stream.extend_from_slice(&self.name);
        byte_stream.push(self.space as u8);
        byte_stream.extend_from_slice(&encode_integer(self.offset));
        byte_stream.extend_from_slice(&encode_integer(self.length));
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldAccessType {
    AnyAcc = 0,
    ByteAcc = 1,
    WordAcc = 2,
    DWordAcc = 3,
    QWordAcc = 4,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldLockRule {
    NoLock = 0,
    Lock = 1,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldUpdateRule {
    Preserve = 0,
    WriteAsOnes = 1,
    WriteAsZeros = 2,
}

/// `Field(<region>, <access>, <lock>, <update>) { <name>, <bits>, ... }`
pub struct Field {
    region: Vec<u8>,
    flags: u8,
    elements: Vec<u8>,
}

impl Field {
    pub fn new(
        region: &[u8],
        access: FieldAccessType,
        lock: FieldLockRule,
        update: FieldUpdateRule,
    ) -> Self {
        Self {
            region: encode_name(region),
            flags: access as u8 | (lock as u8) << 4 | (update as u8) << 5,
            elements: vec![],
        }
    }

    /// Adds a named field unit of `bits` width.
    pub fn add_named_field(&mut self, name: &[u8], bits: usize) {
        self.elements.extend_from_slice(&encode_name_seg(name));
        self.elements.extend_from_slice(&encode_field_len(bits));
    }

    /// Skips `bits` of the region without naming them.
    pub fn add_reserved_field(&mut self, bits: usize) {
        self.elements.push(0);
        self.elements.extend_from_slice(&encode_field_len(bits));
    }
}

impl DsdtObject for Field {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        byte_stream.extend_from_slice(&[0x5b, 0x81]);
        byte_stream.extend_from_slice(&encode_package_len(
            self.region.len() + 1 + self.elements.len(),
        ));
        byte_stream.extend_from_slice(&self.region);
        byte_stream.push(self.flags);
        byte_stream.extend_from_slice(&self.elements);
    }
}
