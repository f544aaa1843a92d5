// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::helpers::*;

pub trait DsdtObject {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut byte_stream = Vec::new();
        self.append_to_vec(&mut byte_stream);
        byte_stream
    }
}

/// A `Name(<name>, <object>)` declaration.
pub struct NamedObject {
    name: Vec<u8>,
    object: Vec<u8>,
}

impl NamedObject {
    pub fn new(name: &[u8], object: &impl DsdtObject) -> Self {
        NamedObject {
            name: encode_name(name),
            object: object.to_bytes(),
        }
    }
}

impl DsdtObject for NamedObject {
    // NameOp (0x08) followed by the name and the data object.
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        byte_stream.push(0x08);
        byte_stream.extend_from_slice(&self.name);
        byte_stream.extend_from_slice(&self.object);
    }
}

/// Pre-encoded AML bytes.
pub struct GenericObject<T: AsRef<[u8]>>(pub T);

impl<T> DsdtObject for GenericObject<T>
where
    T: AsRef<[u8]>,
{
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        byte_stream.extend_from_slice(self.0.as_ref());
    }
}

pub struct NamedInteger(NamedObject);

impl NamedInteger {
    pub fn new(name: &[u8], value: u64) -> Self {
        Self(NamedObject::new(
            name,
            &GenericObject(encode_integer(value)),
        ))
    }
}

impl DsdtObject for NamedInteger {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        self.0.append_to_vec(byte_stream);
    }
}

pub struct NamedString(NamedObject);

impl NamedString {
    pub fn new(name: &[u8], value: &[u8]) -> Self {
        Self(NamedObject::new(name, &GenericObject(encode_string(value))))
    }
}

impl DsdtObject for NamedString {
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        self.0.append_to_vec(byte_stream);
    }
}

pub struct Buffer<T: AsRef<[u8]>>(pub T);

impl<T> DsdtObject for Buffer<T>
where
    T: AsRef<[u8]>,
{
    // BufferOp (0x11), the package length, the encoded buffer size and then
    // the content.
    fn append_to_vec(&self, byte_stream: &mut Vec<u8>) {
        let buffer = self.0.as_ref();
        let encoded_len = encode_integer(buffer.len() as u64);
        byte_stream.push(0x11);
        byte_stream.extend_from_slice(&encode_package_len(buffer.len() + encoded_len.len()));
        byte_stream.extend_from_slice(&encoded_len);
        byte_stream.extend_from_slice(buffer);
    }
}
