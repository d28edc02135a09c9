// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the macroblock reconstruction backend.
//!
//! A backend entropy decodes macroblocks, reconstructs their samples, runs the deblocking filter
//! and implements the concealment algorithms. The decoder drives it one macroblock at a time and
//! takes care of everything that happens at slice and picture level.

#[cfg(test)]
pub(crate) mod dummy;

use enumn::N;
use thiserror::Error;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::erc::ErcState;
use crate::codec::h264::erc::ObjectRegion;
use crate::codec::h264::nalu::SliceData;
use crate::codec::h264::picture::Picture;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::Sps;
use crate::decoder::h264::ref_lists::RefPicIds;
use crate::decoder::h264::ref_lists::RefPicLists;
use crate::decoder::h264::slice::ColocatedBuffer;
use crate::decoder::h264::slice::SliceStrategy;
use crate::decoder::h264::weights::WeightTables;

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The slice data could not be decoded any further. The rest of the slice is treated as
    /// lost and concealed when the picture is finished.
    #[error("corrupted slice data")]
    Corrupted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// Colour plane of a picture coded with `separate_colour_plane_flag`.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColourPlane {
    Y = 0,
    U = 1,
    V = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MbType {
    #[default]
    Skip,
    Inter,
    Intra16x16,
    IntraNxN,
    IPcm,
}

impl MbType {
    pub fn is_intra(&self) -> bool {
        matches!(self, MbType::Intra16x16 | MbType::IntraNxN | MbType::IPcm)
    }
}

/// Partitioning of one 8x8 quadrant of a macroblock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockMode {
    /// Skipped or direct predicted.
    #[default]
    Copy,
    P16x16,
    P16x8,
    P8x16,
    P8x8,
    P8x4,
    P4x8,
    P4x4,
    Intra,
}

impl BlockMode {
    /// Whether the quadrant is split in blocks smaller than 8x8.
    pub fn is_sub_8x8(&self) -> bool {
        matches!(self, BlockMode::P8x4 | BlockMode::P4x8 | BlockMode::P4x4)
    }
}

/// What the backend reports after decoding one macroblock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MacroblockSummary {
    pub mb_type: MbType,
    pub b8mode: [BlockMode; 4],
    /// The macroblock pair is field decoded. Only meaningful for MBAFF pictures.
    pub mb_field: bool,
    pub qp: i32,
    /// The entropy decoder found the end of the slice data after this macroblock.
    pub end_of_slice: bool,
}

/// Addresses of the neighbouring macroblocks that are available for prediction, i.e. that
/// belong to the current slice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MbNeighbours {
    pub a: Option<usize>,
    pub b: Option<usize>,
    pub c: Option<usize>,
    pub d: Option<usize>,
}

/// Everything the backend needs to decode the macroblock at `mb_addr`.
pub struct MacroblockContext<'a> {
    pub mb_addr: usize,
    /// Position of the macroblock in the picture, in macroblock units.
    pub mb_x: usize,
    pub mb_y: usize,
    pub neighbours: MbNeighbours,
    /// For the bottom macroblock of an MBAFF pair, whether the pair is field decoded.
    pub pair_is_field: bool,
    pub strategy: SliceStrategy,
    pub plane: Option<ColourPlane>,
    pub slice_nr: usize,
    pub header: &'a SliceHeader,
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    pub data: &'a SliceData,
    pub ref_lists: &'a RefPicLists,
    pub ref_pic_ids: &'a RefPicIds,
    pub weights: &'a WeightTables,
    pub colocated: Option<&'a ColocatedBuffer>,
    pub dpb: &'a Dpb,
    /// Active reference counts for lists 0 and 1, relative to frames.
    pub num_ref_idx_active: [usize; 2],
    /// Non-zero coefficient counts of every macroblock, -1 when unknown.
    pub nz_coeff: &'a mut [[i8; 48]],
    /// Which macroblocks may be used for intra prediction.
    pub intra_block: &'a [bool],
}

impl<'a> MacroblockContext<'a> {
    /// Switches the active reference counts to the field lists, which have twice as many
    /// entries. The decoder switches back once the macroblock is decoded.
    pub fn enter_field_macroblock(&mut self) {
        self.num_ref_idx_active = self.num_ref_idx_active.map(|n| n << 1);
    }
}

/// Trait for the sample-level half of an H.264 decoder.
pub trait ReconstructionBackend {
    /// Called when a new SPS becomes active.
    fn new_sequence(&mut self, _sps: &Sps) -> BackendResult<()> {
        Ok(())
    }

    /// Called before the first macroblock of every slice, e.g. to initialize entropy decoding.
    fn start_slice(
        &mut self,
        _header: &SliceHeader,
        _strategy: SliceStrategy,
        _data: &SliceData,
    ) -> BackendResult<()> {
        Ok(())
    }

    /// Decodes and reconstructs one macroblock into `pic`.
    fn decode_macroblock(
        &mut self,
        ctx: &mut MacroblockContext,
        pic: &mut Picture,
    ) -> BackendResult<MacroblockSummary>;

    /// Runs the deblocking filter over `pic`, or over one of its colour planes.
    fn deblock(&mut self, pic: &mut Picture, plane: Option<ColourPlane>) -> BackendResult<()>;

    /// Conceals the lost segments of an intra picture.
    fn conceal_intra_frame(&mut self, pic: &mut Picture, erc: &ErcState) -> BackendResult<()>;

    /// Conceals the lost segments of an inter picture, using the motion of the correctly decoded
    /// regions.
    fn conceal_inter_frame(
        &mut self,
        pic: &mut Picture,
        erc: &ErcState,
        objects: &[ObjectRegion],
        mv_per_mb: i32,
        dpb: &Dpb,
    ) -> BackendResult<()>;

    /// Synthesizes a whole lost frame from `reference` using motion copy.
    fn conceal_lost_frame(
        &mut self,
        pic: &mut Picture,
        reference: &DpbEntry,
        dpb: &Dpb,
    ) -> BackendResult<()>;
}
