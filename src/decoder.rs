// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h264;

use std::str::FromStr;

use anyhow::anyhow;
use thiserror::Error;

use crate::backend::BackendError;
use crate::codec::h264::dpb::MmcoError;
use crate::codec::h264::dpb::StorePictureError;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Plane;
use crate::codec::h264::syntax::SliceType;
use crate::Resolution;

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("slice refers to PPS {pps_id}, which is missing or has no valid SPS")]
    NonConformantParameterSet { pps_id: u8 },
    #[error("gap in frame_num: got {frame_num}, expected {expected}")]
    FrameNumGap { frame_num: i32, expected: i32 },
    #[error("RefPicList{list}[num_ref_idx_active_minus1] is 'no reference picture'")]
    ReferenceListExhausted { list: usize },
    #[error("data partitioning is not supported with CABAC")]
    PartitionedCabac,
    #[error(transparent)]
    Store(#[from] StorePictureError),
    #[error(transparent)]
    Mmco(#[from] MmcoError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How pictures missing from the stream are recovered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConcealMode {
    /// Gaps in frame_num are an error unless the stream allows them.
    #[default]
    Off,
    /// Lost frames are copies of the last reference frame.
    FrameCopy,
    /// Lost frames are motion compensated from the last reference frame by the backend.
    MotionCopy,
}

impl FromStr for ConcealMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "off" | "0" => Ok(ConcealMode::Off),
            "copy" | "1" => Ok(ConcealMode::FrameCopy),
            "motion" | "2" => Ok(ConcealMode::MotionCopy),
            _ => Err(anyhow!("unknown concealment mode {:?}", s)),
        }
    }
}

/// Decoder settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    pub conceal_mode: ConcealMode,
    /// Divider applied to picture order counts in the per-picture summary. A synthesized IDR
    /// picture is placed this far after the POC origin.
    pub poc_scale: i32,
    /// POC distance between synthesized reference frames.
    pub ref_poc_gap: i32,
    /// POC distance between synthesized frames and the pictures around them.
    pub poc_gap: i32,
    /// Do not log the per-picture summary.
    pub silent: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            conceal_mode: ConcealMode::Off,
            poc_scale: 2,
            ref_poc_gap: 2,
            poc_gap: 2,
            silent: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A NAL unit has been processed and more may follow.
    Continue,
    /// The source is exhausted. The last picture has been finished and the DPB flushed.
    EndOfStream,
}

/// A picture leaving the decoder, in output order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedPicture {
    pub pic_order_cnt: i32,
    pub frame_num: i32,
    /// `Frame` for frames and woven field pairs, otherwise the parity of a lone field.
    pub field: Field,
    pub slice_type: SliceType,
    pub is_idr: bool,
    /// The picture was synthesized to replace a lost one.
    pub concealed: bool,
    /// The picture is the recovery point announced by an SEI message.
    pub recovery_frame: bool,
    pub resolution: Resolution,
    pub luma: Plane,
    pub chroma: Option<[Plane; 2]>,
}

impl DecodedPicture {
    pub fn new(pic: &PictureData, field: Field, luma: Plane, chroma: Option<[Plane; 2]>) -> Self {
        Self {
            pic_order_cnt: pic.pic_order_cnt,
            frame_num: pic.frame_num,
            field,
            slice_type: pic.slice_type,
            is_idr: matches!(pic.is_idr, IsIdr::Yes { .. }),
            concealed: pic.concealed,
            recovery_frame: pic.recovery_frame,
            resolution: Resolution {
                width: luma.width as u32,
                height: luma.height as u32,
            },
            luma,
            chroma,
        }
    }

    /// CRC32 of the luma samples.
    pub fn luma_crc(&self) -> u32 {
        crc32fast::hash(&self.luma.data)
    }
}

/// Conditions the decoder recovered from without failing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// NAL units dropped: unsupported types, slices before a recovery point, slices referring
    /// to unknown parameter sets, orphan partitions.
    pub skipped_nalus: usize,
    /// B or C partitions that were missing or did not match their A partition.
    pub lost_partitions: usize,
    pub discarded_redundant_slices: usize,
    /// Frames synthesized for gaps in frame_num.
    pub concealed_frames: usize,
    /// Slices whose macroblock data broke off before their end.
    pub lost_slices: usize,
}
