// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Encodes an ASL name path (e.g. `\_SB.TPM`) into an AML NameString.
///
/// Panics on malformed names; names are expected to be compile-time
/// constants.
pub fn encode_name(name: &[u8]) -> Vec<u8> {
    let mut encoded_name = Vec::new();
    let mut rest = name;
    if let Some((b'\\', tail)) = rest.split_first() {
        encoded_name.push(b'\\');
        rest = tail;
    }
    while let Some((b'^', tail)) = rest.split_first() {
        encoded_name.push(b'^');
        rest = tail;
    }

    let segments: Vec<[u8; 4]> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(|&c| c == b'.').map(encode_name_seg).collect()
    };

    match segments.len() {
        0 => encoded_name.push(0),
        1 => {}
        2 => encoded_name.push(0x2e),
        n => {
            encoded_name.push(0x2f);
            encoded_name.push(u8::try_from(n).expect("name path too long"));
        }
    }
    for seg in segments {
        encoded_name.extend_from_slice(&seg);
    }
    encoded_name
}

/// Encodes a single name segment, padding it to four characters with `_`.
pub fn encode_name_seg(seg: &[u8]) -> [u8; 4] {
    assert!(
        (1..=4).contains(&seg.len()),
        "invalid name segment {:?}",
        seg
    );
    assert!(
        seg[0] == b'_' || seg[0].is_ascii_uppercase(),
        "invalid lead character in {:?}",
        seg
    );
    let mut encoded = [b'_'; 4];
    for (dst, &c) in encoded.iter_mut().zip(seg) {
        assert!(
            c == b'_' || c.is_ascii_uppercase() || c.is_ascii_digit(),
            "invalid name character in {:?}",
            seg
        );
        *dst = c;
    }
    encoded
}

fn length_byte_count(value: usize) -> usize {
    match value {
        0..=0x3f => 1,
        0x40..=0xfff => 2,
        0x1000..=0xf_ffff => 3,
        _ => 4,
    }
}

// Single byte values use the low six bits. Longer values store the count of
// trailing bytes in bits 6-7 and the low nibble in bits 0-3 of the lead byte,
// with the remaining bits following in little-endian order.
fn encode_length_bytes(value: usize, count: usize) -> Vec<u8> {
    if count == 1 {
        return vec![value as u8];
    }
    let mut bytes = Vec::with_capacity(count);
    bytes.push((((count - 1) << 6) | (value & 0xf)) as u8);
    let mut rem = value >> 4;
    for _ in 1..count {
        bytes.push((rem & 0xff) as u8);
        rem >>= 8;
    }
    bytes
}

/// Encodes a PkgLength for an object whose body is `len` bytes long. The
/// encoded value includes the length bytes themselves.
pub fn encode_package_len(len: usize) -> Vec<u8> {
    assert!(len < (1 << 28) - 4);
    let count = (1..=4)
        .find(|&n| length_byte_count(len + n) <= n)
        .unwrap_or(4);
    encode_length_bytes(len + count, count)
}

/// Encodes the bit width of a field list element. Unlike a package length, the
/// width does not include the length bytes.
pub fn encode_field_len(bits: usize) -> Vec<u8> {
    assert!(bits < 1 << 28);
    encode_length_bytes(bits, length_byte_count(bits))
}

/// Encodes an integer constant using the smallest available opcode.
pub fn encode_integer(value: u64) -> Vec<u8> {
    let (prefix, width) = match value {
        // ZeroOp and OneOp
        0 | 1 => return vec![value as u8],
        0x2..=0xff => (0x0a, 1),
        0x100..=0xffff => (0x0b, 2),
        0x1_0000..=0xffff_ffff => (0x0c, 4),
        _ => (0x0e, 8),
    };
    let mut byte_stream = Vec::with_capacity(width + 1);
    byte_stream.push(prefix);
    byte_stream.extend_from_slice(&value.to_le_bytes()[..width]);
    byte_stream
}

pub fn encode_string(value: &[u8]) -> Vec<u8> {
    let mut byte_stream = Vec::with_capacity(value.len() + 2);
    byte_stream.push(0x0d);
    byte_stream.extend_from_slice(value);
    byte_stream.push(0);
    byte_stream
}

pub fn char_to_hex(value: u8) -> u8 {
    match value {
        b'0'..=b'9' => value - b'0',
        b'a'..=b'f' => 10 + value - b'a',
        b'A'..=b'F' => 10 + value - b'A',
        _ => panic!("Unsupported hex char {}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsdt::tests::verify_expected_bytes;

    #[test]
    fn verify_simple_name() {
        verify_expected_bytes(&encode_name(b"TPM"), b"TPM_");
    }

    #[test]
    fn verify_simple_name_with_root() {
        verify_expected_bytes(&encode_name(b"\\TPM"), b"\\TPM_");
    }

    #[test]
    fn verify_simple_name_with_prefix() {
        verify_expected_bytes(&encode_name(b"^TPM"), b"^TPM_");
    }

    #[test]
    fn verify_dual_name() {
        verify_expected_bytes(&encode_name(b"\\_SB.TPM"), b"\\\x2e_SB_TPM_");
    }

    #[test]
    fn verify_multi_name() {
        verify_expected_bytes(
            &encode_name(b"\\_SB.PCI0.ISA.TPM"),
            b"\\\x2f\x04_SB_PCI0ISA_TPM_",
        );
    }

    #[test]
    fn verify_root_only() {
        verify_expected_bytes(&encode_name(b"\\"), b"\\\x00");
    }

    #[test]
    #[should_panic]
    fn reject_lowercase_name() {
        encode_name(b"tpm");
    }

    #[test]
    fn verify_package_len() {
        verify_expected_bytes(&encode_package_len(0), &[1]);
        verify_expected_bytes(&encode_package_len(62), &[63]);
        // 63 bytes of body plus two length bytes
        verify_expected_bytes(&encode_package_len(63), &[0x41, 0x04]);
        verify_expected_bytes(&encode_package_len(0x100), &[0x42, 0x10]);
    }

    #[test]
    fn verify_field_len() {
        verify_expected_bytes(&encode_field_len(8), &[8]);
        verify_expected_bytes(&encode_field_len(32), &[32]);
        verify_expected_bytes(&encode_field_len(0x2d0), &[0x40, 0x2d]);
    }

    #[test]
    fn verify_integers() {
        verify_expected_bytes(&encode_integer(0), &[0]);
        verify_expected_bytes(&encode_integer(1), &[1]);
        verify_expected_bytes(&encode_integer(0xf), &[0x0a, 0x0f]);
        verify_expected_bytes(&encode_integer(0x1000), &[0x0b, 0x00, 0x10]);
        verify_expected_bytes(
            &encode_integer(0xfed4_0000),
            &[0x0c, 0x00, 0x00, 0xd4, 0xfe],
        );
        verify_expected_bytes(
            &encode_integer(0x1_0000_0000),
            &[0x0e, 0, 0, 0, 0, 1, 0, 0, 0],
        );
    }
}
