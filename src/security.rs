//! Node ID restriction from the external IP address (BEP-42).
//!
//! A conforming node derives its ID from its IP: the top 21 bits come from a
//! CRC32C over the masked address mixed with a small random value `r`, and
//! `r` itself sits in the low 3 bits of the last byte.

use std::net::IpAddr;

use crc::{Crc, CRC_32_ISCSI};

use crate::common::Id;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const V4_MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];
const V6_MASK: [u8; 8] = [0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];

/// True iff `id` is a valid node ID for a node at `ip`.
pub fn node_id_is_allowed(ip: &IpAddr, id: &Id) -> bool {
    conform_node_id(ip, id) == *id
}

/// The ID closest to `id` that conforms to BEP-42 for `ip`.
///
/// `r` is supposed to be random, but is taken from the low bits of the last
/// byte of the input ID so that conformance is deterministic and checkable.
pub fn conform_node_id(ip: &IpAddr, id: &Id) -> Id {
    let mut bytes = *id.as_bytes();
    let r = bytes[19] & 0x07;

    let crc = match ip {
        IpAddr::V4(ip) => {
            let mut masked = ip.octets();
            for (b, mask) in masked.iter_mut().zip(V4_MASK) {
                *b &= mask;
            }
            masked[0] |= r << 5;
            CASTAGNOLI.checksum(&masked)
        }
        IpAddr::V6(ip) => {
            let mut masked = ip.octets();
            for (b, mask) in masked.iter_mut().zip(V6_MASK) {
                *b &= mask;
            }
            masked[0] |= r << 5;
            CASTAGNOLI.checksum(&masked)
        }
    };

    bytes[0] = (crc >> 24) as u8;
    bytes[1] = (crc >> 16) as u8;
    bytes[2] = ((crc >> 8) as u8 & 0xf8) | (bytes[2] & 0x07);
    bytes[19] = (bytes[19] & 0xf8) | r;

    Id(bytes)
}
