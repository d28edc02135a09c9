// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation. It records every call it receives.

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BlockMode;
use crate::backend::ColourPlane;
use crate::backend::MacroblockContext;
use crate::backend::MacroblockSummary;
use crate::backend::MbType;
use crate::backend::ReconstructionBackend;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::erc::ErcState;
use crate::codec::h264::erc::ObjectRegion;
use crate::codec::h264::nalu::SliceData;
use crate::codec::h264::picture::Picture;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::Sps;
use crate::decoder::h264::slice::SliceStrategy;
use crate::decoder::h264::slice::Structure;

/// A macroblock the decoder asked us to reconstruct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DecodedMb {
    pub plane: Option<ColourPlane>,
    pub mb_addr: usize,
    pub slice_nr: usize,
    /// Active reference counts while the macroblock was decoded.
    pub num_ref_idx_active: [usize; 2],
    pub has_colocated: bool,
}

/// A slice the decoder started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StartedSlice {
    pub first_mb_in_slice: u32,
    pub strategy: SliceStrategy,
    pub partitioned: bool,
    pub b_present: bool,
    pub c_present: bool,
}

/// Dummy backend. Slice data starting with a little-endian `u16` makes the slice end after that
/// many macroblocks, otherwise the slice covers the rest of the picture.
#[derive(Default)]
pub(crate) struct Backend {
    pub sequences: usize,
    pub slices: Vec<StartedSlice>,
    pub decoded: Vec<DecodedMb>,
    pub deblocked: Vec<Option<ColourPlane>>,
    pub intra_concealments: usize,
    pub inter_concealments: usize,
    pub lost_frame_concealments: usize,
    /// Report every macroblock pair of MBAFF pictures as field decoded.
    pub field_mbs: bool,
    /// Fail with `Corrupted` once, when this macroblock is reached.
    pub corrupt_at: Option<usize>,
    remaining_mbs: Option<usize>,
}

impl Backend {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Macroblocks decoded for `plane`, in decoding order.
    pub(crate) fn decoded_addrs(&self, plane: Option<ColourPlane>) -> Vec<usize> {
        self.decoded
            .iter()
            .filter(|mb| mb.plane == plane)
            .map(|mb| mb.mb_addr)
            .collect()
    }
}

impl ReconstructionBackend for Backend {
    fn new_sequence(&mut self, _sps: &Sps) -> BackendResult<()> {
        self.sequences += 1;
        Ok(())
    }

    fn start_slice(
        &mut self,
        header: &SliceHeader,
        strategy: SliceStrategy,
        data: &SliceData,
    ) -> BackendResult<()> {
        self.remaining_mbs = match data.a.as_ref() {
            [lo, hi, ..] => Some(usize::from(u16::from_le_bytes([*lo, *hi]))),
            _ => None,
        };

        self.slices.push(StartedSlice {
            first_mb_in_slice: header.first_mb_in_slice,
            strategy,
            partitioned: data.partitioned,
            b_present: data.b_present(),
            c_present: data.c_present(),
        });

        Ok(())
    }

    fn decode_macroblock(
        &mut self,
        ctx: &mut MacroblockContext,
        pic: &mut Picture,
    ) -> BackendResult<MacroblockSummary> {
        if self.corrupt_at == Some(ctx.mb_addr) {
            self.corrupt_at = None;
            return Err(BackendError::Corrupted);
        }

        let mb_field = self.field_mbs && ctx.strategy.structure() == Structure::Mbaff;
        if mb_field {
            ctx.enter_field_macroblock();
        }

        let intra = ctx.header.slice_type.is_intra();
        let (mb_type, b8mode) = if intra {
            (MbType::Intra16x16, [BlockMode::Intra; 4])
        } else {
            (MbType::Inter, [BlockMode::P16x16; 4])
        };

        // Tag the samples with the macroblock address.
        let luma = &mut pic.frame.luma;
        for y in ctx.mb_y * 16..(ctx.mb_y + 1) * 16 {
            if y < luma.height {
                let row = luma.row_mut(y);
                row[ctx.mb_x * 16..(ctx.mb_x + 1) * 16].fill(ctx.mb_addr as u8);
            }
        }

        if !intra {
            let motion = &mut pic.frame.motion;
            for y in ctx.mb_y * 4..(ctx.mb_y + 1) * 4 {
                for x in ctx.mb_x * 4..(ctx.mb_x + 1) * 4 {
                    if y < motion.height_in_blocks {
                        motion.set(0, x, y, [4, -4], 0);
                    }
                }
            }
        }

        self.decoded.push(DecodedMb {
            plane: ctx.plane,
            mb_addr: ctx.mb_addr,
            slice_nr: ctx.slice_nr,
            num_ref_idx_active: ctx.num_ref_idx_active,
            has_colocated: ctx.colocated.is_some(),
        });

        let end_of_slice = match self.remaining_mbs.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };

        Ok(MacroblockSummary {
            mb_type,
            b8mode,
            mb_field,
            qp: 26 + i32::from(ctx.header.slice_qp_delta),
            end_of_slice,
        })
    }

    fn deblock(&mut self, _pic: &mut Picture, plane: Option<ColourPlane>) -> BackendResult<()> {
        self.deblocked.push(plane);
        Ok(())
    }

    fn conceal_intra_frame(&mut self, _pic: &mut Picture, _erc: &ErcState) -> BackendResult<()> {
        self.intra_concealments += 1;
        Ok(())
    }

    fn conceal_inter_frame(
        &mut self,
        _pic: &mut Picture,
        _erc: &ErcState,
        _objects: &[ObjectRegion],
        _mv_per_mb: i32,
        _dpb: &Dpb,
    ) -> BackendResult<()> {
        self.inter_concealments += 1;
        Ok(())
    }

    fn conceal_lost_frame(
        &mut self,
        pic: &mut Picture,
        reference: &DpbEntry,
        _dpb: &Dpb,
    ) -> BackendResult<()> {
        if let Some(frame) = &reference.frame {
            if frame.luma.data.len() == pic.frame.luma.data.len() {
                pic.frame.luma.data.copy_from_slice(&frame.luma.data);
            }
        }

        self.lost_frame_concealments += 1;
        Ok(())
    }
}
