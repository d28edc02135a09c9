// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NAL units as handed over by the demuxer, with their headers already parsed.

use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::anyhow;
use bytes::Bytes;
use enumn::N;

use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::Sps;

#[derive(N, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    #[default]
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    /// Set by the transport when packets of this NAL unit were lost.
    pub lost_packets: bool,
}

impl NaluHeader {
    pub fn new(type_: NaluType, ref_idc: u8) -> Self {
        Self {
            ref_idc,
            type_,
            lost_packets: false,
        }
    }

    /// Parses the one-byte NAL unit header.
    pub fn parse(byte: u8) -> anyhow::Result<Self> {
        if byte & 0x80 != 0 {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        let type_ = NaluType::n(byte & 0x1f).ok_or(anyhow!("Broken Data"))?;
        let ref_idc = (byte & 0x60) >> 5;

        Ok(Self::new(type_, ref_idc))
    }

    pub fn idr_pic_flag(&self) -> bool {
        matches!(self.type_, NaluType::SliceIdr)
    }

    pub fn with_lost_packets(mut self) -> Self {
        self.lost_packets = true;
        self
    }
}

/// Supplemental enhancement information the decoder acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    /// Decoding can start at the associated picture. Output is correct starting from the picture
    /// `recovery_frame_cnt` frames later in decoding order.
    RecoveryPoint { recovery_frame_cnt: u32 },
    /// Any other payload type. Ignored.
    Other(u32),
}

/// A coded slice, or the A partition of a data-partitioned slice.
#[derive(Clone, Debug)]
pub struct SliceNal {
    pub header: SliceHeader,
    /// Identifies the slice the B and C partitions belong to. Only meaningful for partition A.
    pub slice_id: u32,
    /// Slice data following the header, for the backend to entropy decode.
    pub data: Bytes,
}

/// The B or C partition of a data-partitioned slice.
#[derive(Clone, Debug)]
pub struct PartitionNal {
    pub slice_id: u32,
    pub redundant_pic_cnt: u8,
    pub data: Bytes,
}

#[derive(Clone, Debug)]
pub enum NaluPayload {
    Slice(Box<SliceNal>),
    Partition(PartitionNal),
    Sps(Rc<Sps>),
    Pps(Rc<Pps>),
    Sei(Vec<SeiMessage>),
    Raw(Bytes),
}

#[derive(Clone, Debug)]
pub struct NalUnit {
    pub header: NaluHeader,
    pub payload: NaluPayload,
}

impl NalUnit {
    /// A complete coded slice, IDR or not.
    pub fn slice(header: SliceHeader, ref_idc: u8, idr: bool, data: Bytes) -> Self {
        let type_ = if idr {
            NaluType::SliceIdr
        } else {
            NaluType::Slice
        };

        Self {
            header: NaluHeader::new(type_, ref_idc),
            payload: NaluPayload::Slice(Box::new(SliceNal {
                header,
                slice_id: 0,
                data,
            })),
        }
    }

    /// Partition A: the slice header and macroblock headers.
    pub fn partition_a(header: SliceHeader, ref_idc: u8, slice_id: u32, data: Bytes) -> Self {
        Self {
            header: NaluHeader::new(NaluType::SliceDpa, ref_idc),
            payload: NaluPayload::Slice(Box::new(SliceNal {
                header,
                slice_id,
                data,
            })),
        }
    }

    /// Partition B: intra residual data.
    pub fn partition_b(slice_id: u32, redundant_pic_cnt: u8, data: Bytes) -> Self {
        Self {
            header: NaluHeader::new(NaluType::SliceDpb, 0),
            payload: NaluPayload::Partition(PartitionNal {
                slice_id,
                redundant_pic_cnt,
                data,
            }),
        }
    }

    /// Partition C: inter residual data.
    pub fn partition_c(slice_id: u32, redundant_pic_cnt: u8, data: Bytes) -> Self {
        Self {
            header: NaluHeader::new(NaluType::SliceDpc, 0),
            payload: NaluPayload::Partition(PartitionNal {
                slice_id,
                redundant_pic_cnt,
                data,
            }),
        }
    }

    pub fn sps(sps: Rc<Sps>) -> Self {
        Self {
            header: NaluHeader::new(NaluType::Sps, 3),
            payload: NaluPayload::Sps(sps),
        }
    }

    pub fn pps(pps: Rc<Pps>) -> Self {
        Self {
            header: NaluHeader::new(NaluType::Pps, 3),
            payload: NaluPayload::Pps(pps),
        }
    }

    pub fn sei(messages: Vec<SeiMessage>) -> Self {
        Self {
            header: NaluHeader::new(NaluType::Sei, 0),
            payload: NaluPayload::Sei(messages),
        }
    }

    /// Any NAL unit the decoder does not interpret beyond its type.
    pub fn raw(type_: NaluType, data: Bytes) -> Self {
        Self {
            header: NaluHeader::new(type_, 0),
            payload: NaluPayload::Raw(data),
        }
    }

    pub fn with_lost_packets(mut self) -> Self {
        self.header = self.header.with_lost_packets();
        self
    }
}

/// Slice data assembled for the backend. Unpartitioned slices only carry `a`.
#[derive(Clone, Debug, Default)]
pub struct SliceData {
    pub a: Bytes,
    pub b: Option<Bytes>,
    pub c: Option<Bytes>,
    pub partitioned: bool,
}

impl SliceData {
    pub fn whole(data: Bytes) -> Self {
        Self {
            a: data,
            ..Default::default()
        }
    }

    pub fn partition_a(data: Bytes) -> Self {
        Self {
            a: data,
            partitioned: true,
            ..Default::default()
        }
    }

    /// Whether the intra residual partition is available.
    pub fn b_present(&self) -> bool {
        !self.partitioned || self.b.is_some()
    }

    /// Whether the inter residual partition is available.
    pub fn c_present(&self) -> bool {
        !self.partitioned || self.c.is_some()
    }
}

/// The demuxer side of the decoder: produces NAL units in decoding order until the end of the
/// stream.
pub trait NaluSource {
    /// Returns the next NAL unit, or `None` at the end of the stream.
    fn next_nalu(&mut self) -> Option<NalUnit>;
}

impl NaluSource for VecDeque<NalUnit> {
    fn next_nalu(&mut self) -> Option<NalUnit> {
        self.pop_front()
    }
}

impl<I: Iterator<Item = NalUnit>> NaluSource for std::iter::Fuse<I> {
    fn next_nalu(&mut self) -> Option<NalUnit> {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nalu_header() {
        let hdr = NaluHeader::parse(0x65).unwrap();
        assert_eq!(hdr.type_, NaluType::SliceIdr);
        assert_eq!(hdr.ref_idc, 3);
        assert!(hdr.idr_pic_flag());

        let hdr = NaluHeader::parse(0x02).unwrap();
        assert_eq!(hdr.type_, NaluType::SliceDpa);
        assert_eq!(hdr.ref_idc, 0);

        assert!(NaluHeader::parse(0x80 | 0x01).is_err());
        // Type 17 is reserved.
        assert!(NaluHeader::parse(0x11).is_err());
    }

    #[test]
    fn partition_presence() {
        let mut data = SliceData::partition_a(Bytes::from_static(&[0]));
        assert!(!data.b_present());
        assert!(!data.c_present());

        data.c = Some(Bytes::new());
        assert!(data.c_present());

        let whole = SliceData::whole(Bytes::new());
        assert!(whole.b_present() && whole.c_present());
    }

    #[test]
    fn source_from_iterator() {
        let mut src = vec![NalUnit::raw(NaluType::AuDelimiter, Bytes::new())]
            .into_iter()
            .fuse();

        assert!(src.next_nalu().is_some());
        assert!(src.next_nalu().is_none());
    }
}
