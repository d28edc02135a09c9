// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The macroblock loop of a slice.

use log::trace;
use log::warn;

use crate::backend::BackendError;
use crate::backend::BlockMode;
use crate::backend::ColourPlane;
use crate::backend::MacroblockContext;
use crate::backend::MacroblockSummary;
use crate::backend::MbNeighbours;
use crate::backend::MbType;
use crate::backend::ReconstructionBackend;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::erc::ObjectRegion;
use crate::codec::h264::erc::RegionMode;
use crate::codec::h264::nalu::SliceData;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::MotionField;
use crate::codec::h264::picture::Picture;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::PictureId;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::Sps;
use crate::decoder::h264::ref_lists::RefPicIds;
use crate::decoder::h264::ref_lists::RefPicLists;
use crate::decoder::h264::weights::WeightTables;
use crate::decoder::DecodeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entropy {
    Cavlc,
    Cabac,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Structure {
    Frame,
    Field,
    Mbaff,
}

/// How the macroblocks of a slice are reconstructed. Selected once per slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceStrategy {
    CavlcFrame,
    CavlcField,
    CavlcMbaff,
    CabacFrame,
    CabacField,
    CabacMbaff,
}

impl SliceStrategy {
    pub fn select(pps: &Pps, pic: &PictureData) -> Self {
        let structure = if pic.field != Field::Frame {
            Structure::Field
        } else if pic.mbaff {
            Structure::Mbaff
        } else {
            Structure::Frame
        };

        match (pps.entropy_coding_mode_flag, structure) {
            (false, Structure::Frame) => SliceStrategy::CavlcFrame,
            (false, Structure::Field) => SliceStrategy::CavlcField,
            (false, Structure::Mbaff) => SliceStrategy::CavlcMbaff,
            (true, Structure::Frame) => SliceStrategy::CabacFrame,
            (true, Structure::Field) => SliceStrategy::CabacField,
            (true, Structure::Mbaff) => SliceStrategy::CabacMbaff,
        }
    }

    pub fn entropy(&self) -> Entropy {
        match self {
            SliceStrategy::CavlcFrame | SliceStrategy::CavlcField | SliceStrategy::CavlcMbaff => {
                Entropy::Cavlc
            }
            SliceStrategy::CabacFrame | SliceStrategy::CabacField | SliceStrategy::CabacMbaff => {
                Entropy::Cabac
            }
        }
    }

    pub fn structure(&self) -> Structure {
        match self {
            SliceStrategy::CavlcFrame | SliceStrategy::CabacFrame => Structure::Frame,
            SliceStrategy::CavlcField | SliceStrategy::CabacField => Structure::Field,
            SliceStrategy::CavlcMbaff | SliceStrategy::CabacMbaff => Structure::Mbaff,
        }
    }
}

/// Motion of `RefPicList1[0]`, used by direct prediction in B slices. Lives for one slice.
#[derive(Clone, Debug)]
pub struct ColocatedBuffer {
    pub picture: PictureId,
    pub field: Field,
    pub is_long_term: bool,
    pub motion: MotionField,
}

impl ColocatedBuffer {
    pub fn new(dpb: &Dpb, id: PictureId) -> Option<Self> {
        let entry = dpb.get(id)?;

        Some(Self {
            picture: id,
            field: entry.pic.field,
            is_long_term: matches!(entry.pic.reference(), Reference::LongTerm),
            motion: entry
                .frame
                .as_ref()
                .map(|f| f.motion.clone())
                .unwrap_or_default(),
        })
    }
}

/// Decoding state of one macroblock of the active picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MbState {
    /// Slice the macroblock was decoded by, if any.
    pub slice_nr: Option<usize>,
    pub needs_concealment: bool,
    /// The partition holding the residual of the macroblock is missing.
    pub partition_lost: bool,
    pub mb_field: bool,
    pub qp: i32,
}

impl Default for MbState {
    fn default() -> Self {
        Self {
            slice_nr: None,
            needs_concealment: true,
            partition_lost: false,
            mb_field: false,
            qp: 0,
        }
    }
}

/// Macroblock arrays of one colour plane. Reused from picture to picture.
#[derive(Clone, Debug, Default)]
pub struct PlaneState {
    pub mbs: Vec<MbState>,
    pub num_dec_mb: usize,
    pub nz_coeff: Vec<[i8; 48]>,
    pub intra_block: Vec<bool>,
}

impl PlaneState {
    /// Prepares the arrays for a new picture of `pic_size` macroblocks.
    pub fn reset(&mut self, pic_size: usize, entropy: Entropy, constrained_intra_pred: bool) {
        self.mbs.clear();
        self.mbs.resize(pic_size, Default::default());
        self.num_dec_mb = 0;

        self.nz_coeff.resize(pic_size, [0; 48]);
        if entropy == Entropy::Cavlc {
            self.nz_coeff.iter_mut().for_each(|nz| *nz = [-1; 48]);
        }

        self.intra_block.resize(pic_size, true);
        if constrained_intra_pred {
            self.intra_block.iter_mut().for_each(|b| *b = true);
        }
    }
}

/// Everything a slice needs besides the picture it is decoded into.
pub(super) struct SliceJob<'a> {
    pub header: &'a SliceHeader,
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    pub data: &'a SliceData,
    pub strategy: SliceStrategy,
    pub plane: Option<ColourPlane>,
    pub slice_nr: usize,
    pub ref_lists: &'a RefPicLists,
    pub ref_pic_ids: &'a RefPicIds,
    pub weights: &'a WeightTables,
    pub colocated: Option<&'a ColocatedBuffer>,
    pub dpb: &'a Dpb,
}

/// Concealment object list of the active picture.
pub(super) struct ErcObjects<'a> {
    pub regions: &'a mut [ObjectRegion],
    pub mv_per_mb: &'a mut i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct SliceOutcome {
    pub decoded_mbs: usize,
    /// The slice data broke off before its end.
    pub lost: bool,
}

/// Position of macroblock `mb_addr`, in macroblocks.
pub(super) fn mb_position(mb_addr: usize, width_in_mbs: usize, mbaff: bool) -> (usize, usize) {
    if mbaff {
        let pair = mb_addr / 2;
        (pair % width_in_mbs, (pair / width_in_mbs) * 2 + mb_addr % 2)
    } else {
        (mb_addr % width_in_mbs, mb_addr / width_in_mbs)
    }
}

/// Neighbours of `mb_addr` available for prediction. With MBAFF, neighbours are the top
/// macroblocks of the surrounding pairs.
pub(super) fn neighbours(
    mbs: &[MbState],
    mb_addr: usize,
    width_in_mbs: usize,
    mbaff: bool,
    slice_nr: usize,
) -> MbNeighbours {
    let (unit, scale) = if mbaff {
        (mb_addr / 2, 2)
    } else {
        (mb_addr, 1)
    };
    let x = unit % width_in_mbs;
    let y = unit / width_in_mbs;

    let available = |u: usize| {
        let addr = u * scale;
        mbs.get(addr)
            .filter(|mb| mb.slice_nr == Some(slice_nr))
            .map(|_| addr)
    };

    MbNeighbours {
        a: (x > 0).then(|| unit - 1).and_then(available),
        b: (y > 0).then(|| unit - width_in_mbs).and_then(available),
        c: (y > 0 && x + 1 < width_in_mbs)
            .then(|| unit - width_in_mbs + 1)
            .and_then(available),
        d: (y > 0 && x > 0)
            .then(|| unit - width_in_mbs - 1)
            .and_then(available),
    }
}

fn average_mv(motion: &MotionField, list: usize, x: usize, y: usize) -> [i32; 2] {
    let mut sum = [0i32; 2];
    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
        let mv = motion.mv(list, x + dx, y + dy);
        sum[0] += i32::from(mv[0]);
        sum[1] += i32::from(mv[1]);
    }

    [(sum[0] + 2) / 4, (sum[1] + 2) / 4]
}

/// Records the mode and representative motion of the four 8x8 regions of a macroblock for
/// inter-frame concealment.
pub(super) fn write_erc_objects(
    summary: &MacroblockSummary,
    slice_type: SliceType,
    motion: &MotionField,
    (mb_x, mb_y): (usize, usize),
    mb_addr: usize,
    objects: &mut ErcObjects,
) {
    for (i, &b8mode) in summary.b8mode.iter().enumerate() {
        let Some(region) = objects.regions.get_mut(4 * mb_addr + i) else {
            return;
        };

        let x = 4 * mb_x + (i & 1) * 2;
        let y = 4 * mb_y + (i >> 1) * 2;
        if x + 1 >= motion.width_in_blocks || y + 1 >= motion.height_in_blocks {
            *region = Default::default();
            continue;
        }

        let intra16x16 = summary.mb_type == MbType::Intra16x16;

        if slice_type.is_b() {
            region.mode = if intra16x16 {
                RegionMode::Intra
            } else if b8mode == BlockMode::Intra {
                RegionMode::Intra8x8
            } else {
                RegionMode::InterPred8x8
            };

            if intra16x16 || b8mode == BlockMode::Intra {
                region.mv = [0; 3];
                continue;
            }

            let list = if motion.ref_idx(0, x, y) < 0 { 1 } else { 0 };
            let [mx, my] = average_mv(motion, list, x, y);
            *objects.mv_per_mb += i64::from(mx.abs() + my.abs());
            region.mv = [mx, my, i32::from(motion.ref_idx(list, x, y))];
        } else {
            region.mode = match b8mode {
                _ if intra16x16 => RegionMode::Intra,
                BlockMode::Intra => RegionMode::Intra8x8,
                BlockMode::Copy => RegionMode::InterCopy,
                BlockMode::P16x16 => RegionMode::InterPred,
                _ => RegionMode::InterPred8x8,
            };

            if matches!(b8mode, BlockMode::Copy | BlockMode::Intra) {
                region.mv = [0; 3];
                continue;
            }

            let [mx, my] = if b8mode.is_sub_8x8() {
                average_mv(motion, 0, x, y)
            } else {
                let mv = motion.mv(0, x, y);
                [i32::from(mv[0]), i32::from(mv[1])]
            };
            *objects.mv_per_mb += i64::from(mx.abs() + my.abs());
            region.mv = [mx, my, i32::from(motion.ref_idx(0, x, y))];
        }
    }
}

/// Decodes the macroblocks of one slice into `pic`, until the backend reports the end of the
/// slice data or the picture is complete.
pub(super) fn decode_slice_data<B: ReconstructionBackend>(
    backend: &mut B,
    job: &SliceJob,
    pic: &mut Picture,
    state: &mut PlaneState,
    objects: &mut ErcObjects,
) -> Result<SliceOutcome, DecodeError> {
    let hdr = job.header;
    let mbaff = job.strategy.structure() == Structure::Mbaff;
    let width_in_mbs = pic.width_in_mbs();
    let pic_size = pic.pic_size_in_mbs().min(state.mbs.len());
    let slice_qp = 26 + i32::from(job.pps.pic_init_qp_minus26) + i32::from(hdr.slice_qp_delta);

    let mut num_ref_idx_active = match hdr.slice_type {
        SliceType::P | SliceType::Sp => [hdr.num_ref_idx_l0_active(), 0],
        SliceType::B => [hdr.num_ref_idx_l0_active(), hdr.num_ref_idx_l1_active()],
        SliceType::I | SliceType::Si => [0, 0],
    };

    let mut outcome = SliceOutcome::default();
    let mut mb_addr = hdr.first_mb_in_slice as usize * if mbaff { 2 } else { 1 };

    while mb_addr < pic_size {
        let position = mb_position(mb_addr, width_in_mbs, mbaff);

        state.mbs[mb_addr].slice_nr = Some(job.slice_nr);
        state.mbs[mb_addr].qp = slice_qp;

        let pair_is_field = mbaff && mb_addr % 2 == 1 && state.mbs[mb_addr - 1].mb_field;
        let mut ctx = MacroblockContext {
            mb_addr,
            mb_x: position.0,
            mb_y: position.1,
            neighbours: neighbours(&state.mbs, mb_addr, width_in_mbs, mbaff, job.slice_nr),
            pair_is_field,
            strategy: job.strategy,
            plane: job.plane,
            slice_nr: job.slice_nr,
            header: hdr,
            sps: job.sps,
            pps: job.pps,
            data: job.data,
            ref_lists: job.ref_lists,
            ref_pic_ids: job.ref_pic_ids,
            weights: job.weights,
            colocated: job.colocated,
            dpb: job.dpb,
            num_ref_idx_active,
            nz_coeff: &mut state.nz_coeff,
            intra_block: &state.intra_block,
        };

        let summary = match backend.decode_macroblock(&mut ctx, pic) {
            Ok(summary) => summary,
            Err(BackendError::Corrupted) => {
                warn!(
                    "Slice {} broke off at macroblock {}, the rest is concealed",
                    job.slice_nr, mb_addr
                );
                outcome.lost = true;
                break;
            }
            Err(e) => return Err(e.into()),
        };

        num_ref_idx_active = ctx.num_ref_idx_active;
        if mbaff && summary.mb_field {
            num_ref_idx_active = num_ref_idx_active.map(|n| n >> 1);
        }

        trace!("Decoded macroblock {} ({:?})", mb_addr, summary.mb_type);

        let partition_lost = if summary.mb_type.is_intra() {
            !job.data.b_present()
        } else {
            summary.mb_type != MbType::Skip && !job.data.c_present()
        };

        let mb = &mut state.mbs[mb_addr];
        mb.needs_concealment = partition_lost;
        mb.partition_lost = partition_lost;
        mb.mb_field = mbaff && summary.mb_field;
        mb.qp = summary.qp;
        if mbaff {
            pic.frame.motion.mb_field[mb_addr] = mb.mb_field;
        }

        if job.pps.constrained_intra_pred_flag && !summary.mb_type.is_intra() {
            state.intra_block[mb_addr] = false;
        }

        state.num_dec_mb += 1;
        outcome.decoded_mbs += 1;

        write_erc_objects(
            &summary,
            hdr.slice_type,
            &pic.frame.motion,
            position,
            mb_addr,
            objects,
        );

        mb_addr += 1;

        if summary.end_of_slice && (!mbaff || mb_addr % 2 == 0) {
            break;
        }
    }

    Ok(outcome)
}
