// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::syntax::ChromaFormat;
use crate::codec::h264::syntax::RefPicMarking;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::Sps;
use crate::Resolution;

/// Identifies a picture for its whole life in the decoder, from allocation until it leaves the
/// decoded picture buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PictureId(pub u32);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity.
    pub fn opposite(&self) -> Self {
        match *self {
            Field::Frame => Field::Frame,
            Field::Top => Field::Bottom,
            Field::Bottom => Field::Top,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// Header-derived metadata of a picture.
///
/// Most fields are extracted from the first slice header of the picture and kept for reference
/// marking, list construction and output. The samples live separately in a [`DecodedFrame`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureData {
    pub id: PictureId,

    pub pic_order_cnt_type: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,

    pub pic_num: i32,
    pub long_term_pic_num: u32,
    pub frame_num: i32,
    pub frame_num_offset: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: u32,

    /// Coding type of the first slice, possibly replaced by a redundant slice.
    pub slice_type: SliceType,
    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,
    pub(crate) reference: Reference,
    pub ref_pic_marking: RefPicMarking,

    pub field: Field,
    /// Whether the picture was coded as a frame. Stays set on both halves of a split frame.
    pub coded_frame: bool,
    pub mbaff: bool,
    pub chroma_format: ChromaFormat,
    /// Size of the sample planes of this picture. Fields have half the frame height.
    pub coded_resolution: Resolution,
    pub qp: i32,

    // Internal state.
    pub has_mmco_5: bool,
    pub nonexisting: bool,
    pub concealed: bool,
    pub needed_for_output: bool,
    pub recovery_frame: bool,

    pub(crate) other_field: Option<PictureId>,
    pub(crate) is_second_field: bool,
}

impl PictureData {
    /// Instantiates a new `PictureData` from the first slice of a picture. The picture order
    /// count is computed afterwards by the decoder, as it depends on the previous pictures.
    pub fn new_from_slice(id: PictureId, hdr: &SliceHeader, nalu: &NaluHeader, sps: &Sps) -> Self {
        let field = hdr.field();

        let reference = if nalu.ref_idc != 0 {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        let is_idr = if nalu.idr_pic_flag() {
            IsIdr::Yes {
                idr_pic_id: hdr.idr_pic_id,
            }
        } else {
            IsIdr::No
        };

        let (pic_order_cnt_lsb, delta_pic_order_cnt_bottom, delta_pic_order_cnt0, delta_pic_order_cnt1) =
            match sps.pic_order_cnt_type {
                0 => (
                    i32::from(hdr.pic_order_cnt_lsb),
                    hdr.delta_pic_order_cnt_bottom,
                    0,
                    0,
                ),
                1 => (
                    0,
                    0,
                    hdr.delta_pic_order_cnt[0],
                    hdr.delta_pic_order_cnt[1],
                ),
                _ => (0, 0, 0, 0),
            };

        let frame_num = i32::from(hdr.frame_num);
        let pic_num = if matches!(field, Field::Frame) {
            frame_num
        } else {
            2 * frame_num + 1
        };

        let mut coded_resolution = Resolution {
            width: sps.width(),
            height: sps.height(),
        };
        if !matches!(field, Field::Frame) {
            coded_resolution.height /= 2;
        }

        Self {
            id,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0,
            delta_pic_order_cnt1,
            pic_num,
            frame_num,
            slice_type: hdr.slice_type,
            nal_ref_idc: nalu.ref_idc,
            is_idr,
            reference,
            ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            field,
            coded_frame: matches!(field, Field::Frame),
            mbaff: sps.mb_adaptive_frame_field_flag && !hdr.field_pic_flag,
            chroma_format: sps.chroma_format(),
            coded_resolution,
            qp: 26 + i32::from(hdr.slice_qp_delta),
            ..Default::default()
        }
    }

    /// A short-term reference frame standing in for a lost picture. Its samples are produced by
    /// the concealment process; the picture order count is assigned by the caller.
    pub fn new_concealed(id: PictureId, frame_num: i32, idr: bool, sps: &Sps) -> Self {
        Self {
            id,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            frame_num,
            pic_num: frame_num,
            slice_type: if idr { SliceType::I } else { SliceType::B },
            nal_ref_idc: 1,
            is_idr: if idr {
                IsIdr::Yes { idr_pic_id: 0 }
            } else {
                IsIdr::No
            },
            reference: Reference::ShortTerm,
            field: Field::Frame,
            coded_frame: true,
            chroma_format: sps.chroma_format(),
            coded_resolution: Resolution {
                width: sps.width(),
                height: sps.height(),
            },
            concealed: true,
            ..Default::default()
        }
    }

    /// A frame inferred by the frame_num gap process (8.2.5.2). It has no samples and is never
    /// output.
    pub fn new_non_existing(id: PictureId, frame_num: i32, pic_order_cnt_type: u8) -> Self {
        Self {
            id,
            frame_num,
            pic_num: frame_num,
            pic_order_cnt_type,
            nonexisting: true,
            nal_ref_idc: 1,
            field: Field::Frame,
            coded_frame: true,
            reference: Reference::ShortTerm,
            ..Default::default()
        }
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Sets the reference marking of this picture only. Use [`Dpb::set_reference`] to propagate
    /// the marking to a stored complementary field.
    ///
    /// [`Dpb::set_reference`]: crate::codec::h264::dpb::Dpb::set_reference
    pub fn set_reference(&mut self, reference: Reference) {
        debug!(
            "Set reference of picture {:?} (POC {}, {:?}) to {:?}",
            self.id, self.pic_order_cnt, self.field, reference
        );

        self.reference = reference;
    }

    pub fn is_second_field(&self) -> bool {
        self.is_second_field
    }

    /// The complementary field of this picture, if it has been paired.
    pub fn other_field(&self) -> Option<PictureId> {
        self.other_field
    }

    /// Pairs this picture, a second field, with `first_field`.
    pub fn set_first_field_to(&mut self, first_field: &PictureData) {
        self.other_field = Some(first_field.id);
        self.is_second_field = true;

        match first_field.field {
            Field::Top => self.top_field_order_cnt = first_field.top_field_order_cnt,
            Field::Bottom => self.bottom_field_order_cnt = first_field.bottom_field_order_cnt,
            Field::Frame => (),
        }
    }

    /// Pairs this picture, a first field, with `second_field`.
    pub fn set_second_field_to(&mut self, second_field: &PictureData) {
        self.other_field = Some(second_field.id);

        match second_field.field {
            Field::Top => self.top_field_order_cnt = second_field.top_field_order_cnt,
            Field::Bottom => self.bottom_field_order_cnt = second_field.bottom_field_order_cnt,
            Field::Frame => (),
        }
    }

    /// Picture order count of the frame this picture belongs to.
    pub fn frame_poc(&self) -> i32 {
        match (self.field, self.coded_frame || self.other_field.is_some()) {
            (Field::Frame, _) | (_, true) => {
                std::cmp::min(self.top_field_order_cnt, self.bottom_field_order_cnt)
            }
            (Field::Top, false) => self.top_field_order_cnt,
            (Field::Bottom, false) => self.bottom_field_order_cnt,
        }
    }

    /// Split a frame into its top field, which this picture becomes, and its bottom field, which
    /// is returned with identifier `bottom_id`. Both halves keep pointing at the same samples.
    pub fn split_frame(&mut self, bottom_id: PictureId) -> PictureData {
        debug!(
            "Splitting picture {:?} (frame_num {}, POC {}) into two fields",
            self.id, self.frame_num, self.pic_order_cnt
        );

        let mut bottom = self.clone();

        self.field = Field::Top;
        self.pic_order_cnt = self.top_field_order_cnt;
        self.other_field = Some(bottom_id);
        self.is_second_field = false;

        bottom.id = bottom_id;
        bottom.field = Field::Bottom;
        bottom.pic_order_cnt = bottom.bottom_field_order_cnt;
        bottom.other_field = Some(self.id);
        bottom.is_second_field = true;

        bottom
    }

    /// Label used in the per-picture summary.
    pub fn type_label(&self) -> &'static str {
        match self.slice_type {
            SliceType::I if matches!(self.is_idr, IsIdr::Yes { .. }) => "IDR",
            SliceType::I => "I",
            SliceType::P => "P",
            SliceType::Sp => "SP",
            SliceType::Si => "SI",
            SliceType::B if self.is_ref() || self.nal_ref_idc != 0 => "B",
            SliceType::B => "b",
        }
    }
}

/// One 8-bit sample plane.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl Plane {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        &mut self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn fill(&mut self, value: u8) {
        self.data.iter_mut().for_each(|s| *s = value);
    }

    /// Weaves two fields of the same size into a frame twice as high.
    pub fn interleave_fields(top: &Plane, bottom: &Plane) -> Plane {
        let mut frame = Plane::new(top.width, top.height + bottom.height);

        for y in 0..top.height {
            frame.row_mut(2 * y).copy_from_slice(top.row(y));
        }
        for y in 0..bottom.height.min(top.height) {
            frame.row_mut(2 * y + 1).copy_from_slice(bottom.row(y));
        }

        frame
    }
}

/// Motion vectors and reference indices at 4x4 block granularity, plus the field decoding flag
/// of every macroblock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionField {
    pub width_in_blocks: usize,
    pub height_in_blocks: usize,
    pub mv: [Vec<[i16; 2]>; 2],
    /// -1 means the list is not used by the block.
    pub ref_idx: [Vec<i8>; 2],
    pub mb_field: Vec<bool>,
}

impl MotionField {
    pub fn new(width_in_mbs: usize, height_in_mbs: usize) -> Self {
        let width_in_blocks = width_in_mbs * 4;
        let height_in_blocks = height_in_mbs * 4;
        let num_blocks = width_in_blocks * height_in_blocks;

        Self {
            width_in_blocks,
            height_in_blocks,
            mv: [vec![[0; 2]; num_blocks], vec![[0; 2]; num_blocks]],
            ref_idx: [vec![-1; num_blocks], vec![-1; num_blocks]],
            mb_field: vec![false; width_in_mbs * height_in_mbs],
        }
    }

    fn index(&self, x: usize, y: usize) -> usize {
        y * self.width_in_blocks + x
    }

    pub fn mv(&self, list: usize, x: usize, y: usize) -> [i16; 2] {
        self.mv[list][self.index(x, y)]
    }

    pub fn ref_idx(&self, list: usize, x: usize, y: usize) -> i8 {
        self.ref_idx[list][self.index(x, y)]
    }

    pub fn set(&mut self, list: usize, x: usize, y: usize, mv: [i16; 2], ref_idx: i8) {
        let i = self.index(x, y);
        self.mv[list][i] = mv;
        self.ref_idx[list][i] = ref_idx;
    }
}

/// Samples and motion of a decoded frame or field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    pub luma: Plane,
    /// Cb and Cr, absent for monochrome pictures and for the planes of a picture coded with
    /// separate colour planes until they are merged.
    pub chroma: Option<[Plane; 2]>,
    pub motion: MotionField,
}

impl DecodedFrame {
    pub fn new(
        resolution: Resolution,
        chroma_format: ChromaFormat,
        separate_colour_planes: bool,
    ) -> Self {
        let (width_in_mbs, height_in_mbs) = resolution.mbs();
        let (width_in_mbs, height_in_mbs) = (width_in_mbs as usize, height_in_mbs as usize);

        let chroma = match chroma_format.mb_chroma_size() {
            Some((mb_width_c, mb_height_c)) if !separate_colour_planes => {
                let width = width_in_mbs * mb_width_c;
                let height = height_in_mbs * mb_height_c;
                Some([Plane::new(width, height), Plane::new(width, height)])
            }
            _ => None,
        };

        Self {
            luma: Plane::new(width_in_mbs * 16, height_in_mbs * 16),
            chroma,
            motion: MotionField::new(width_in_mbs, height_in_mbs),
        }
    }
}

/// The picture being decoded: its metadata and the buffers slices are reconstructed into.
#[derive(Clone, Debug)]
pub struct Picture {
    pub data: PictureData,
    pub frame: DecodedFrame,
}

impl Picture {
    pub fn new(data: PictureData, separate_colour_planes: bool) -> Self {
        let frame = DecodedFrame::new(
            data.coded_resolution,
            data.chroma_format,
            separate_colour_planes,
        );

        Self { data, frame }
    }

    pub fn width_in_mbs(&self) -> usize {
        self.frame.luma.width / 16
    }

    pub fn height_in_mbs(&self) -> usize {
        self.frame.luma.height / 16
    }

    pub fn pic_size_in_mbs(&self) -> usize {
        self.width_in_mbs() * self.height_in_mbs()
    }
}
