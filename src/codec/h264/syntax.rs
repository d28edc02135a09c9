// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Syntax structures handed over by the bitstream parser.
//!
//! The picture engine does not read bits itself: parameter sets and slice headers arrive already
//! parsed, with inferred values resolved. The builders in this module construct them without a
//! parser, which is how integrators without their own parser and the unit tests feed the decoder.

use std::collections::BTreeMap;
use std::rc::Rc;

use enumn::N;

use crate::codec::h264::picture::Field;

const MAX_PPS_COUNT: usize = 256;
const MAX_SPS_COUNT: usize = 32;

/// The maximum number of frames in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

/// Maximum number of entries of a reference picture list.
pub const MAX_REF_LIST_SIZE: usize = 32;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

impl RefPicListModification {
    /// A short-term modification subtracting `abs_diff_pic_num` from the predicted picture number.
    pub fn subtract(abs_diff_pic_num: u32) -> Self {
        Self {
            modification_of_pic_nums_idc: 0,
            abs_diff_pic_num_minus1: abs_diff_pic_num - 1,
            ..Default::default()
        }
    }

    /// A short-term modification adding `abs_diff_pic_num` to the predicted picture number.
    pub fn add(abs_diff_pic_num: u32) -> Self {
        Self {
            modification_of_pic_nums_idc: 1,
            abs_diff_pic_num_minus1: abs_diff_pic_num - 1,
            ..Default::default()
        }
    }

    /// A long-term modification selecting `long_term_pic_num`.
    pub fn long_term(long_term_pic_num: u32) -> Self {
        Self {
            modification_of_pic_nums_idc: 2,
            long_term_pic_num,
            ..Default::default()
        }
    }

    /// The terminating entry of a modification list.
    pub fn end() -> Self {
        Self {
            modification_of_pic_nums_idc: 3,
            ..Default::default()
        }
    }
}

/// Explicit weighted prediction table (7.3.3.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i16; 32],

    /* if ChromaArrayType != 0 */
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i16; 2]; 32],

    /* if slice_type % 5 == 1 */
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i16; 32],

    /* and if ChromaArrayType != 0 */
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i16; 2]; 32],
}

impl Default for PredWeightTable {
    fn default() -> Self {
        Self {
            luma_log2_weight_denom: 0,
            chroma_log2_weight_denom: 0,
            luma_weight_l0: [0; 32],
            luma_offset_l0: [0; 32],
            chroma_weight_l0: [[0; 2]; 32],
            chroma_offset_l0: [[0; 2]; 32],
            luma_weight_l1: [0; 32],
            luma_offset_l1: [0; 32],
            chroma_weight_l1: [[0; 2]; 32],
            chroma_offset_l1: [[0; 2]; 32],
        }
    }
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer with
/// a special value meaning "no long-term frame indices". Comparisons against a plain index treat
/// that special value as smaller than any index.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

/// One memory management control operation of `dec_ref_pic_marking()`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Operation to apply, per Table 7-9.
    pub memory_management_control_operation: u8,
    /// MMCO 1 and 3: distance to the short-term picture being operated on.
    pub difference_of_pic_nums_minus1: u32,
    /// MMCO 2: long-term picture to mark as unused.
    pub long_term_pic_num: u32,
    /// MMCO 3 and 6: long-term frame index to assign.
    pub long_term_frame_idx: u32,
    /// MMCO 4: new upper bound for long-term frame indices, plus one. Zero means none.
    pub max_long_term_frame_idx_plus1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// IDR only: drop the prior pictures of the DPB without outputting them.
    pub no_output_of_prior_pics_flag: bool,

    /// IDR only: mark the IDR picture as long-term with `LongTermFrameIdx` 0.
    pub long_term_reference_flag: bool,

    /// Selects adaptive (MMCO) marking instead of the sliding window.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// Operations applied when `adaptive_ref_pic_marking_mode_flag` is set.
    pub inner: Vec<RefPicMarkingInner>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Address of the first macroblock in the slice. Counts macroblock pairs in MBAFF frames.
    pub first_mb_in_slice: u32,

    /// Coding type of the slice according to Table 7-6.
    pub slice_type: SliceType,

    /// Picture parameter set in use.
    pub pic_parameter_set_id: u8,

    /// Colour plane carried by this slice when `separate_colour_plane_flag` is set.
    pub colour_plane_id: u8,

    /// Picture identifier, `log2_max_frame_num_minus4 + 4` bits wide in the bitstream.
    pub frame_num: u16,

    /// Whether the slice belongs to a coded field.
    pub field_pic_flag: bool,

    /// Whether the coded field is a bottom field.
    pub bottom_field_flag: bool,

    /// Identifies an IDR picture. Two consecutive IDR access units never share it.
    pub idr_pic_id: u16,

    /// Picture order count modulo `MaxPicOrderCntLsb` for the top field of a frame or for a
    /// field.
    pub pic_order_cnt_lsb: u16,

    /// Picture order count difference between the bottom and top fields of a frame.
    pub delta_pic_order_cnt_bottom: i32,

    /// Differences from the expected picture order count used when `pic_order_cnt_type` is 1.
    pub delta_pic_order_cnt: [i32; 2],

    /// Zero for the primary coded picture, greater than zero for redundant pictures.
    pub redundant_pic_cnt: u8,

    pub direct_spatial_mv_pred_flag: bool,

    pub num_ref_idx_active_override_flag: bool,

    /// Maximum reference index for list 0. Already resolved against the PPS default.
    pub num_ref_idx_l0_active_minus1: u8,

    /// Maximum reference index for list 1. Already resolved against the PPS default.
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,

    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    pub pred_weight_table: PredWeightTable,

    pub dec_ref_pic_marking: RefPicMarking,

    /// Initial QP delta of the slice, see 7-30.
    pub slice_qp_delta: i8,
}

impl SliceHeader {
    /// Returns the field that is coded by this header.
    pub fn field(&self) -> Field {
        if self.field_pic_flag {
            if self.bottom_field_flag {
                Field::Bottom
            } else {
                Field::Top
            }
        } else {
            Field::Frame
        }
    }

    pub fn num_ref_idx_l0_active(&self) -> usize {
        usize::from(self.num_ref_idx_l0_active_minus1) + 1
    }

    pub fn num_ref_idx_l1_active(&self) -> usize {
        usize::from(self.num_ref_idx_l1_active_minus1) + 1
    }

    /// Reference index used by a redundant slice, as signaled by its first list 0 modification.
    pub fn redundant_slice_ref_idx(&self) -> usize {
        if self.redundant_pic_cnt == 0 || self.slice_type.is_i() {
            return 0;
        }

        self.ref_pic_list_modification_l0
            .first()
            .map(|m| m.abs_diff_pic_num_minus1 as usize + 1)
            .unwrap_or(0)
    }
}

pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new(pps: &Pps) -> Self {
        SliceHeaderBuilder(SliceHeader {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            num_ref_idx_l0_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            ..Default::default()
        })
    }

    pub fn slice_type(mut self, type_: SliceType) -> Self {
        self.0.slice_type = type_;
        self
    }

    pub fn first_mb_in_slice(mut self, value: u32) -> Self {
        self.0.first_mb_in_slice = value;
        self
    }

    pub fn frame_num(mut self, value: u16) -> Self {
        self.0.frame_num = value;
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.0.field_pic_flag = !matches!(field, Field::Frame);
        self.0.bottom_field_flag = matches!(field, Field::Bottom);
        self
    }

    pub fn colour_plane_id(mut self, value: u8) -> Self {
        self.0.colour_plane_id = value;
        self
    }

    pub fn pic_order_cnt_lsb(mut self, value: u16) -> Self {
        self.0.pic_order_cnt_lsb = value;
        self
    }

    pub fn delta_pic_order_cnt_bottom(mut self, value: i32) -> Self {
        self.0.delta_pic_order_cnt_bottom = value;
        self
    }

    pub fn delta_pic_order_cnt(mut self, value: [i32; 2]) -> Self {
        self.0.delta_pic_order_cnt = value;
        self
    }

    pub fn idr_pic_id(mut self, value: u16) -> Self {
        self.0.idr_pic_id = value;
        self
    }

    pub fn redundant_pic_cnt(mut self, value: u8) -> Self {
        self.0.redundant_pic_cnt = value;
        self
    }

    pub fn num_ref_idx_active_override_flag(mut self, value: bool) -> Self {
        self.0.num_ref_idx_active_override_flag = value;
        self
    }

    pub fn num_ref_idx_l0_active_minus1(mut self, value: u8) -> Self {
        self = self.num_ref_idx_active_override_flag(true);
        self.0.num_ref_idx_l0_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l0_active(self, value: u8) -> Self {
        self.num_ref_idx_l0_active_minus1(value - 1)
    }

    pub fn num_ref_idx_l1_active_minus1(mut self, value: u8) -> Self {
        self = self.num_ref_idx_active_override_flag(true);
        self.0.num_ref_idx_l1_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l1_active(self, value: u8) -> Self {
        self.num_ref_idx_l1_active_minus1(value - 1)
    }

    pub fn ref_pic_list_modification_l0(mut self, value: Vec<RefPicListModification>) -> Self {
        self.0.ref_pic_list_modification_flag_l0 = true;
        self.0.ref_pic_list_modification_l0 = value;
        self
    }

    pub fn ref_pic_list_modification_l1(mut self, value: Vec<RefPicListModification>) -> Self {
        self.0.ref_pic_list_modification_flag_l1 = true;
        self.0.ref_pic_list_modification_l1 = value;
        self
    }

    pub fn dec_ref_pic_marking(mut self, value: RefPicMarking) -> Self {
        self.0.dec_ref_pic_marking = value;
        self
    }

    pub fn slice_qp_delta(mut self, value: i8) -> Self {
        self.0.slice_qp_delta = value;
        self
    }

    pub fn direct_spatial_mv_pred_flag(mut self, value: bool) -> Self {
        self.0.direct_spatial_mv_pred_flag = value;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
/// See table 7-6 of ITU-T H.264.
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    /// Whether slices of this type only use intra prediction.
    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

impl Default for SliceType {
    fn default() -> Self {
        Self::P
    }
}

#[derive(N, Clone, Copy)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
    High444P = 244,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// Chroma sampling of a picture, derived from `chroma_format_idc` (table 6-1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChromaFormat {
    Monochrome,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    pub fn from_idc(chroma_format_idc: u8) -> Option<Self> {
        match chroma_format_idc {
            0 => Some(Self::Monochrome),
            1 => Some(Self::Yuv420),
            2 => Some(Self::Yuv422),
            3 => Some(Self::Yuv444),
            _ => None,
        }
    }

    /// Returns the size of a chroma macroblock (`MbWidthC`, `MbHeightC`), or `None` for
    /// monochrome pictures.
    pub fn mb_chroma_size(&self) -> Option<(usize, usize)> {
        match self {
            Self::Monochrome => None,
            Self::Yuv420 => Some((8, 8)),
            Self::Yuv422 => Some((8, 16)),
            Self::Yuv444 => Some((16, 16)),
        }
    }
}

/// The subset of the VUI that affects decoded picture buffering.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub bitstream_restriction_flag: bool,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// A H264 Sequence Parameter Set, restricted to the fields the picture engine consumes.
#[derive(Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,

    pub profile_idc: u8,

    /// Together with `level_idc` 11 and the Baseline or Main profiles, selects level 1b.
    pub constraint_set3_flag: bool,

    pub level_idc: Level,

    /// Chroma sampling relative to luma, see clause 6.2.
    pub chroma_format_idc: u8,

    /// Whether the three colour components of a 4:4:4 stream are coded as independent planes.
    pub separate_colour_plane_flag: bool,

    /// `MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4)`.
    pub log2_max_frame_num_minus4: u8,

    /// Picture order count derivation method, see clause 8.2.1.
    pub pic_order_cnt_type: u8,

    /// `MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4)`.
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    pub delta_pic_order_always_zero_flag: bool,

    pub offset_for_non_ref_pic: i32,

    pub offset_for_top_to_bottom_field: i32,

    pub num_ref_frames_in_pic_order_cnt_cycle: u8,

    pub offset_for_ref_frame: [i32; 255],

    /// Size of the sliding window, see clause 8.2.5.3.
    pub max_num_ref_frames: u8,

    /// Whether gaps in `frame_num` are part of the stream rather than losses.
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,

    /// If set, every picture of the sequence is a frame made of frame macroblocks.
    pub frame_mbs_only_flag: bool,

    /// If set, frames may switch between frame and field macroblock pairs.
    pub mb_adaptive_frame_field_flag: bool,

    /// Same as ExpectedDeltaPerPicOrderCntCycle, equation 7-12 of ITU-T H.264.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    pub const fn pic_width_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs_minus1 as u32 + 1
    }

    /// Height of a frame in macroblocks (`FrameHeightInMbs`).
    pub const fn frame_height_in_mbs(&self) -> u32 {
        self.height() / 16
    }

    /// Returns `ChromaArrayType` (7.4.2.1.1).
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Chroma format of the decoded pictures. Independent colour planes decode as 4:4:4.
    pub fn chroma_format(&self) -> ChromaFormat {
        ChromaFormat::from_idc(self.chroma_format_idc).unwrap_or_default()
    }

    /// Same as MaxFrameNum. Equation 7-10.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. Equation 7-11.
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn max_dpb_frames(&self) -> usize {
        let profile = self.profile_idc;
        let mut level = self.level_idc;

        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if matches!(level, Level::L1_1)
            && (profile == Profile::Baseline as u8 || profile == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        };

        // Table A.1
        let max_dpb_mbs = match level {
            Level::L1 | Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 | Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 | Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 | Level::L5_2 => 184320,
            Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
        };

        let frame_size_in_mbs = self.pic_width_in_mbs() * self.frame_height_in_mbs();

        let max_dpb_frames =
            std::cmp::min(max_dpb_mbs / frame_size_in_mbs, DPB_MAX_SIZE as u32) as usize;

        let mut max_dpb_frames = std::cmp::max(max_dpb_frames, self.max_num_ref_frames as usize);

        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            max_dpb_frames = std::cmp::max(1, self.vui_parameters.max_dec_frame_buffering as usize);
        }

        max_dpb_frames
    }

    pub fn max_num_order_frames(&self) -> u32 {
        let vui = &self.vui_parameters;
        let present = self.vui_parameters_present_flag && vui.bitstream_restriction_flag;

        if present {
            vui.max_num_reorder_frames
        } else {
            let profile = self.profile_idc;
            if matches!(profile, 44 | 86 | 100 | 110 | 122 | 244) && self.constraint_set3_flag {
                0
            } else {
                self.max_dpb_frames() as u32
            }
        }
    }
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: 0,
            profile_idc: Profile::High as u8,
            constraint_set3_flag: false,
            level_idc: Level::L4,
            chroma_format_idc: 1,
            separate_colour_plane_flag: false,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 0,
            offset_for_ref_frame: [0; 255],
            max_num_ref_frames: 1,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            expected_delta_per_pic_order_cnt_cycle: 0,
            vui_parameters_present_flag: false,
            vui_parameters: Default::default(),
        }
    }
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    /// Sets the coded size in macroblocks. For streams that may carry fields, `height_in_mbs`
    /// is the frame height and must be even.
    pub fn resolution_in_mbs(mut self, width_in_mbs: u16, height_in_mbs: u16) -> Self {
        let map_units = if self.0.frame_mbs_only_flag {
            height_in_mbs
        } else {
            height_in_mbs / 2
        };

        self.0.pic_width_in_mbs_minus1 = width_in_mbs - 1;
        self.0.pic_height_in_map_units_minus1 = map_units - 1;
        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn separate_colour_plane_flag(mut self, value: bool) -> Self {
        self.0.separate_colour_plane_flag = value;
        if value {
            self.0.chroma_format_idc = 3;
        }
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    /// Must be called before `resolution_in_mbs`, which depends on it.
    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn mb_adaptive_frame_field_flag(mut self, value: bool) -> Self {
        self.0.mb_adaptive_frame_field_flag = value;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn max_frame_num(self, value: u32) -> Self {
        self.log2_max_frame_num_minus4(value.ilog2() as u8 - 4u8)
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn log2_max_pic_order_cnt_lsb_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value;
        self
    }

    pub fn max_pic_order_cnt_lsb(self, value: u32) -> Self {
        self.log2_max_pic_order_cnt_lsb_minus4(value.ilog2() as u8 - 4u8)
    }

    pub fn delta_pic_order_always_zero_flag(mut self, value: bool) -> Self {
        self.0.delta_pic_order_always_zero_flag = value;
        self
    }

    pub fn offset_for_non_ref_pic(mut self, value: i32) -> Self {
        self.0.offset_for_non_ref_pic = value;
        self
    }

    pub fn offset_for_top_to_bottom_field(mut self, value: i32) -> Self {
        self.0.offset_for_top_to_bottom_field = value;
        self
    }

    /// Sets the POC type 1 cycle and derives `ExpectedDeltaPerPicOrderCntCycle` from it.
    pub fn offset_for_ref_frames(mut self, offsets: &[i32]) -> Self {
        let len = std::cmp::min(offsets.len(), 255);
        self.0.num_ref_frames_in_pic_order_cnt_cycle = len as u8;
        self.0.offset_for_ref_frame = [0; 255];
        self.0.offset_for_ref_frame[..len].copy_from_slice(&offsets[..len]);
        self.0.expected_delta_per_pic_order_cnt_cycle = offsets[..len].iter().sum();
        self
    }

    pub fn gaps_in_frame_num_value_allowed_flag(mut self, value: bool) -> Self {
        self.0.gaps_in_frame_num_value_allowed_flag = value;
        self
    }

    /// Sets the VUI bitstream restriction, which overrides the level-derived DPB size.
    pub fn max_dec_frame_buffering(mut self, max_dec_frame_buffering: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_dec_frame_buffering = max_dec_frame_buffering;
        self.0.vui_parameters.max_num_reorder_frames = max_dec_frame_buffering;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}

/// A H264 Picture Parameter Set, restricted to the fields the picture engine consumes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,

    /// SPS this PPS refers to. It is resolved when a picture activates the PPS.
    pub seq_parameter_set_id: u8,

    /// CABAC if set, CAVLC otherwise.
    pub entropy_coding_mode_flag: bool,

    /// Whether `delta_pic_order_cnt_bottom` or `delta_pic_order_cnt[1]` are present in frame
    /// slice headers.
    pub bottom_field_pic_order_in_frame_present_flag: bool,

    pub num_ref_idx_l0_default_active_minus1: u8,

    pub num_ref_idx_l1_default_active_minus1: u8,

    /// Explicit weighted prediction for P and SP slices.
    pub weighted_pred_flag: bool,

    /// 0: default, 1: explicit, 2: implicit weighted prediction for B slices.
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,

    /// Intra macroblocks may only predict from intra-coded neighbours.
    pub constrained_intra_pred_flag: bool,

    /// Whether `redundant_pic_cnt` is present in slice headers and partitions.
    pub redundant_pic_cnt_present_flag: bool,
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: &Sps) -> Self {
        PpsBuilder(Pps {
            seq_parameter_set_id: sps.seq_parameter_set_id,
            ..Default::default()
        })
    }

    pub fn pic_parameter_set_id(mut self, value: u8) -> Self {
        self.0.pic_parameter_set_id = value;
        self
    }

    pub fn entropy_coding_mode_flag(mut self, value: bool) -> Self {
        self.0.entropy_coding_mode_flag = value;
        self
    }

    pub fn bottom_field_pic_order_in_frame_present_flag(mut self, value: bool) -> Self {
        self.0.bottom_field_pic_order_in_frame_present_flag = value;
        self
    }

    pub fn weighted_pred_flag(mut self, value: bool) -> Self {
        self.0.weighted_pred_flag = value;
        self
    }

    pub fn weighted_bipred_idc(mut self, value: u8) -> Self {
        self.0.weighted_bipred_idc = value;
        self
    }

    pub fn pic_init_qp_minus26(mut self, value: i8) -> Self {
        self.0.pic_init_qp_minus26 = value;
        self
    }

    pub fn constrained_intra_pred_flag(mut self, value: bool) -> Self {
        self.0.constrained_intra_pred_flag = value;
        self
    }

    pub fn redundant_pic_cnt_present_flag(mut self, value: bool) -> Self {
        self.0.redundant_pic_cnt_present_flag = value;
        self
    }

    pub fn num_ref_idx_l0_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l0_default_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l0_default_active(self, value: u8) -> Self {
        self.num_ref_idx_l0_default_active_minus1(value - 1)
    }

    pub fn num_ref_idx_l1_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l1_default_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l1_default_active(self, value: u8) -> Self {
        self.num_ref_idx_l1_default_active_minus1(value - 1)
    }

    pub fn build(self) -> Rc<Pps> {
        Rc::new(self.0)
    }
}

/// Parameter sets received so far, indexed by their ids.
///
/// A lookup returning `None` means the id was never received (or was out of range), which the
/// decoder treats as a non-conformant reference.
#[derive(Debug, Default)]
pub struct ParameterSetTable {
    spses: BTreeMap<u8, Rc<Sps>>,
    ppses: BTreeMap<u8, Rc<Pps>>,
}

impl ParameterSetTable {
    pub fn insert_sps(&mut self, sps: Rc<Sps>) {
        if usize::from(sps.seq_parameter_set_id) >= MAX_SPS_COUNT {
            log::warn!("Ignoring SPS with id {}", sps.seq_parameter_set_id);
            return;
        }

        self.spses.insert(sps.seq_parameter_set_id, sps);
    }

    pub fn insert_pps(&mut self, pps: Rc<Pps>) {
        if usize::from(pps.pic_parameter_set_id) >= MAX_PPS_COUNT {
            log::warn!("Ignoring PPS with id {}", pps.pic_parameter_set_id);
            return;
        }

        self.ppses.insert(pps.pic_parameter_set_id, pps);
    }

    pub fn sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.spses.get(&sps_id)
    }

    pub fn pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.ppses.get(&pps_id)
    }

    /// Returns the PPS `pps_id` and the SPS it refers to, if both are valid.
    pub fn active_pair(&self, pps_id: u8) -> Option<(Rc<Pps>, Rc<Sps>)> {
        let pps = self.pps(pps_id)?;
        let sps = self.sps(pps.seq_parameter_set_id)?;

        Some((Rc::clone(pps), Rc::clone(sps)))
    }
}
