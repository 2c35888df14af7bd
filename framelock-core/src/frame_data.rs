//! # Tagged-Section Frame State
//!
//! The per-frame state blob broadcast by the emitter is a sequence of
//! self-describing sections, each `[i32 length][16-byte id][data]`,
//! terminated by a zero-length sentinel. Unknown section ids must be
//! skippable so newer emitters can talk to older repeaters.
//!
//! [`SectionWriter`] and [`SectionReader`] are bounds-checked cursors over
//! caller-supplied buffers; the framing is the contract, not any particular
//! memory trick.

use crate::{ClusterError, Result};
use bytes::{Buf, BufMut};
use std::fmt;
use uuid::Uuid;

/// 16-byte identifier tagging one state section inside the frame blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub Uuid);

impl SectionId {
    /// Engine input subsystem state.
    pub const INPUT_STATE: SectionId =
        SectionId(Uuid::from_u128(0x5f3c_1a09_8d42_4b7e_9c61_2e85_70fa_d314));
    /// Engine time subsystem state (delta time, frame clock).
    pub const TIME_STATE: SectionId =
        SectionId(Uuid::from_u128(0xa1b8_44d6_0e27_4f90_8a35_c4de_9b12_76e8));
    /// Cluster-wide input replication state.
    pub const CLUSTER_INPUT_STATE: SectionId =
        SectionId(Uuid::from_u128(0x3e92_7cb1_f560_49a3_b7d8_0164_aef9_2c55));
    /// Deterministic RNG state.
    pub const RANDOM_STATE: SectionId =
        SectionId(Uuid::from_u128(0xc70d_52ea_3b19_4e86_94f2_8ba6_d031_47c9));
    /// Opaque buffer of pending RPC calls latched for this frame.
    pub const RPC_CALLS: SectionId =
        SectionId(Uuid::from_u128(0x84fa_06b3_71c5_4dd2_a2e9_5d07_138c_be61));

    /// Encoded size of a section id in bytes.
    pub const SIZE: usize = 16;
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Size of the `[i32 length][16-byte id]` prefix before section data.
const SECTION_PREFIX: usize = 4 + SectionId::SIZE;
/// Size of the zero-length terminator.
const SENTINEL: usize = 4;

/// Bounds-checked writer building a tagged-section list into a buffer.
///
/// The buffer size is a hard configuration limit; a section that does not
/// fit yields [`ClusterError::BufferTooSmall`] and leaves the writer
/// positioned where it was, it is never renegotiated at runtime.
pub struct SectionWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SectionWriter<'a> {
    /// Starts writing sections at the beginning of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far (excluding the not-yet-written sentinel).
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Appends one section. `save` receives the remaining buffer space
    /// (after the length/id prefix, keeping room for the final sentinel)
    /// and returns how many bytes it wrote.
    ///
    /// A save that writes nothing is rewound and the section omitted
    /// entirely: a zero length on the wire is the sentinel, so an empty
    /// section must never be encoded.
    pub fn write_section<F>(&mut self, id: SectionId, save: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        if self.buf.len() < self.pos + SECTION_PREFIX + SENTINEL {
            return Err(ClusterError::BufferTooSmall {
                section: id,
                needed: SECTION_PREFIX + SENTINEL,
                available: self.buf.len() - self.pos,
            });
        }
        let available = self.buf.len() - self.pos - SECTION_PREFIX - SENTINEL;

        let data_start = self.pos + SECTION_PREFIX;
        let written = save(&mut self.buf[data_start..data_start + available])?;
        debug_assert!(written <= available);
        if written == 0 {
            return Ok(0);
        }

        let mut prefix = &mut self.buf[self.pos..data_start];
        prefix.put_i32_le(written as i32);
        prefix.put_slice(id.0.as_bytes());

        self.pos = data_start + written;
        Ok(written)
    }

    /// Writes the zero-length sentinel and returns the total encoded size.
    pub fn finish(mut self) -> Result<usize> {
        if self.buf.len() < self.pos + SENTINEL {
            return Err(ClusterError::internal(
                "no room left for the section sentinel",
            ));
        }
        let mut tail = &mut self.buf[self.pos..self.pos + SENTINEL];
        tail.put_i32_le(0);
        Ok(self.pos + SENTINEL)
    }
}

/// One decoded section of a frame-state blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'a> {
    pub id: SectionId,
    pub data: &'a [u8],
}

/// Iterator scanning a tagged-section list.
///
/// Yields each section in order and stops exactly at the zero-length
/// sentinel without reading past it. A buffer that ends before a complete
/// length/id prefix (or before the announced data) is a corrupt stream.
pub struct SectionReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> SectionReader<'a> {
    /// Starts scanning sections at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for SectionReader<'a> {
    type Item = Result<Section<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let mut remaining = &self.buf[self.pos..];
        if remaining.len() < 4 {
            self.failed = true;
            return Some(Err(ClusterError::corrupt_stream(
                "state stream ends before a section length",
            )));
        }
        let len = remaining.get_i32_le();
        if len == 0 {
            return None; // sentinel
        }
        if len < 0 {
            self.failed = true;
            return Some(Err(ClusterError::corrupt_stream(format!(
                "negative section length {len}"
            ))));
        }
        let len = len as usize;

        if remaining.len() < SectionId::SIZE {
            self.failed = true;
            return Some(Err(ClusterError::corrupt_stream(
                "state stream ends inside a section id",
            )));
        }
        let mut id_bytes = [0u8; SectionId::SIZE];
        remaining.copy_to_slice(&mut id_bytes);
        let id = SectionId(Uuid::from_bytes(id_bytes));

        if remaining.len() < len {
            self.failed = true;
            return Some(Err(ClusterError::corrupt_stream(format!(
                "section {id} announces {len} bytes but only {} remain",
                remaining.len()
            ))));
        }

        let data_start = self.pos + SECTION_PREFIX;
        let data = &self.buf[data_start..data_start + len];
        self.pos = data_start + len;
        Some(Ok(Section { id, data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn write_blob(sections: &[(SectionId, &[u8])], buf: &mut [u8]) -> usize {
        let mut writer = SectionWriter::new(buf);
        for (id, data) in sections {
            writer
                .write_section(*id, |out| {
                    out[..data.len()].copy_from_slice(data);
                    Ok(data.len())
                })
                .unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn scan_yields_sections_in_order_and_stops_at_sentinel() {
        let mut buf = [0u8; 256];
        let total = write_blob(
            &[
                (SectionId::INPUT_STATE, b"inputs"),
                (SectionId::TIME_STATE, b"ticktock"),
            ],
            &mut buf,
        );

        // Poison the bytes after the sentinel: scanning must never reach them.
        for b in &mut buf[total..] {
            *b = 0xff;
        }

        let sections: Vec<_> = SectionReader::new(&buf)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].id, SectionId::INPUT_STATE);
        assert_eq!(sections[0].data, b"inputs");
        assert_eq!(sections[1].id, SectionId::TIME_STATE);
        assert_eq!(sections[1].data, b"ticktock");
    }

    #[test]
    fn empty_section_is_omitted_and_later_sections_survive() {
        // A zero-length section would read back as the sentinel; the
        // writer must drop it so nothing after it is lost.
        let mut buf = [0u8; 256];
        write_blob(
            &[
                (SectionId::INPUT_STATE, b""),
                (SectionId::RANDOM_STATE, b"entropy"),
                (SectionId::RPC_CALLS, b"calls"),
            ],
            &mut buf,
        );

        let sections: Vec<_> = SectionReader::new(&buf)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].id, SectionId::RANDOM_STATE);
        assert_eq!(sections[0].data, b"entropy");
        assert_eq!(sections[1].id, SectionId::RPC_CALLS);
        assert_eq!(sections[1].data, b"calls");
    }

    #[test]
    fn unknown_ids_are_scannable() {
        let foreign = SectionId(Uuid::from_u128(0xdead_beef));
        let mut buf = [0u8; 128];
        write_blob(
            &[(foreign, b"future data"), (SectionId::TIME_STATE, b"t")],
            &mut buf,
        );

        let sections: Vec<_> = SectionReader::new(&buf)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(sections[0].id, foreign);
        assert_eq!(sections[1].id, SectionId::TIME_STATE);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut buf = [0u8; 128];
        let total = write_blob(&[(SectionId::INPUT_STATE, b"abcdef")], &mut buf);

        // Cut inside the section data.
        let cut = &buf[..total - SENTINEL - 2];
        let result: Result<Vec<_>> = SectionReader::new(cut).collect();
        assert!(matches!(
            result.unwrap_err(),
            ClusterError::CorruptStateStream { .. }
        ));

        // Cut inside the sentinel itself.
        let cut = &buf[..total - 2];
        let result: Result<Vec<_>> = SectionReader::new(cut).collect();
        assert!(result.is_err());
    }

    #[test]
    fn writer_reports_buffer_too_small() {
        let mut buf = [0u8; SECTION_PREFIX + SENTINEL + 4];
        let mut writer = SectionWriter::new(&mut buf);

        let err = writer
            .write_section(SectionId::INPUT_STATE, |out| {
                if out.len() < 16 {
                    return Err(ClusterError::BufferTooSmall {
                        section: SectionId::INPUT_STATE,
                        needed: 16,
                        available: out.len(),
                    });
                }
                Ok(16)
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::BufferTooSmall { .. }));
    }

    proptest! {
        #[test]
        fn arbitrary_sections_round_trip(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64),
                0..8,
            )
        ) {
            let ids = [
                SectionId::INPUT_STATE,
                SectionId::TIME_STATE,
                SectionId::CLUSTER_INPUT_STATE,
                SectionId::RANDOM_STATE,
                SectionId::RPC_CALLS,
            ];
            let sections: Vec<(SectionId, &[u8])> = payloads
                .iter()
                .enumerate()
                .map(|(i, p)| (ids[i % ids.len()], p.as_slice()))
                .collect();

            let mut buf = vec![0u8; 4096];
            let total = write_blob(&sections, &mut buf);

            // Empty sections are omitted on write.
            let expected: Vec<_> = sections
                .iter()
                .filter(|(_, data)| !data.is_empty())
                .collect();
            let decoded: Vec<_> = SectionReader::new(&buf[..total])
                .collect::<Result<Vec<_>>>()
                .unwrap();
            prop_assert_eq!(decoded.len(), expected.len());
            for (dec, (id, data)) in decoded.iter().zip(&expected) {
                prop_assert_eq!(dec.id, *id);
                prop_assert_eq!(dec.data, *data);
            }
        }
    }
}
