// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::objects::*;

pub trait ResourceObject {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut byte_stream = Vec::new();
        self.append_to_vec(&mut byte_stream);
        byte_stream
    }
}

/// `Memory32Fixed(ReadWrite|ReadOnly, base, length)`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Memory32Fixed {
    pub is_writeable: bool,
    pub base_address: u32,
    pub length: u32,
}

impl Memory32Fixed {
    pub fn new(base_address: u32, length: u32, is_writeable: bool) -> Self {
        Self {
            is_writeable,
            base_address,
            length,
        }
    }
}

impl ResourceObject for Memory32Fixed {
    // Large resource item 0x86 with a nine byte body.
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        byte_stream.extend_from_slice(&[0x86, 9, 0]);
        byte_stream.push(self.is_writeable.into());
        byte_stream.extend_from_slice(&self.base_address.to_le_bytes());
        byte_stream.extend_from_slice(&self.length.to_le_bytes());
    }
}

/// A `Name(_CRS, ResourceTemplate() { ... })` declaration.
#[derive(Default)]
pub struct CurrentResourceSettings {
    resources: Vec<u8>,
}

impl CurrentResourceSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&mut self, resource: &impl ResourceObject) {
        resource.append_to_vec(&mut self.resources);
    }
}

impl DsdtObject for CurrentResourceSettings {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        let mut resource_bytes = self.resources.clone();
        // End tag with a zero checksum
        resource_bytes.extend_from_slice(&[0x79, 0]);
        NamedObject::new(b"_CRS", &Buffer(resource_bytes)).append_to_vec(byte_stream);
    }
}
