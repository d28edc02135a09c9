// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture lists of a slice.
//!
//! The initial lists are derived once per picture by the DPB. Every slice truncates them to its
//! active size, applies its modification commands (8.2.4.3) and, for MBAFF frames, derives the
//! field lists used by field macroblock pairs (8.4.2.1).

use log::debug;
use log::warn;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::ReferencePicLists;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::PictureId;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::syntax::MaxLongTermFrameIdx;
use crate::codec::h264::syntax::RefPicListModification;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::Sps;
use crate::decoder::DecodeError;

/// The six reference picture lists of a slice. Lists 0 and 1 are `RefPicList0` and
/// `RefPicList1`. For MBAFF frames, lists 2 and 3 are the field lists of top field macroblocks
/// and lists 4 and 5 those of bottom field macroblocks. `None` is "no reference picture".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicLists {
    lists: [Vec<Option<PictureId>>; 6],
}

impl RefPicLists {
    pub fn new(lists: [Vec<Option<PictureId>>; 6]) -> Self {
        Self { lists }
    }

    pub fn list(&self, list: usize) -> &[Option<PictureId>] {
        self.lists.get(list).map(Vec::as_slice).unwrap_or_default()
    }

    /// The first entry of `RefPicList1`, whose motion is used by direct prediction.
    pub fn colocated(&self) -> Option<PictureId> {
        self.lists[1].first().copied().flatten()
    }
}

/// Identifiers of a reference picture derived from its picture order counts. Temporal direct
/// prediction compares them to find which reference a colocated block pointed at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefPicId {
    /// POC times two, plus one for bottom fields.
    pub pic: i32,
    pub frame: i32,
    pub top: i32,
    pub bottom: i32,
}

impl RefPicId {
    fn new(pic: &PictureData) -> Self {
        Self {
            pic: pic.pic_order_cnt * 2 + i32::from(pic.field == Field::Bottom),
            frame: pic.frame_poc() * 2,
            top: pic.top_field_order_cnt * 2,
            bottom: pic.bottom_field_order_cnt * 2 + 1,
        }
    }
}

/// [`RefPicId`]s of every entry of the six lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicIds {
    lists: [Vec<RefPicId>; 6],
}

impl RefPicIds {
    pub fn new(lists: &RefPicLists, dpb: &Dpb, pic: &PictureData, sps: &Sps) -> Self {
        let ids_of = |list: &[Option<PictureId>]| {
            list.iter()
                .map(|id| {
                    id.and_then(|id| dpb.pic(id))
                        .map(RefPicId::new)
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
        };

        let mut ids = Self::default();
        for i in 0..2 {
            ids.lists[i] = ids_of(lists.list(i));
        }

        if !sps.frame_mbs_only_flag && pic.field == Field::Frame {
            for i in 2..6 {
                ids.lists[i] = ids_of(lists.list(i));
            }
        }

        ids
    }

    pub fn list(&self, list: usize) -> &[RefPicId] {
        self.lists.get(list).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Variables needed to resolve modification commands.
struct PicNums {
    curr_pic_num: i32,
    max_pic_num: i32,
    /// `2 * (MaxLongTermFrameIdx + 1)`, the `LongTermPicNumF` of pictures that are not long
    /// term references.
    no_long_term_pic_num: u32,
}

fn pic_num_f(dpb: &Dpb, id: Option<PictureId>, max_pic_num: i32) -> i32 {
    match id.and_then(|id| dpb.pic(id)) {
        Some(pic) if !matches!(pic.reference(), Reference::LongTerm) => pic.pic_num,
        _ => max_pic_num,
    }
}

fn long_term_pic_num_f(dpb: &Dpb, id: Option<PictureId>, no_long_term_pic_num: u32) -> u32 {
    match id.and_then(|id| dpb.pic(id)) {
        Some(pic) if matches!(pic.reference(), Reference::LongTerm) => pic.long_term_pic_num,
        _ => no_long_term_pic_num,
    }
}

/// Inserts `id` at `ref_idx` and removes the later duplicate of it, as the last step of
/// 8.2.4.3.1 and 8.2.4.3.2. `is_duplicate` tells whether an entry designates the same picture.
fn insert_and_compact(
    list: &mut Vec<Option<PictureId>>,
    num_active: usize,
    ref_idx: &mut usize,
    id: Option<PictureId>,
    is_duplicate: impl Fn(Option<PictureId>) -> bool,
) {
    list.insert(*ref_idx, id);
    *ref_idx += 1;

    let mut nidx = *ref_idx;
    for cidx in *ref_idx..=num_active {
        if cidx == list.len() {
            break;
        }

        if !is_duplicate(list[cidx]) {
            list[nidx] = list[cidx];
            nidx += 1;
        }
    }

    list.truncate(num_active);
}

// 8.2.4.3.1 Modification process of reference picture lists for short-term reference pictures
fn short_term_modification(
    dpb: &Dpb,
    list: &mut Vec<Option<PictureId>>,
    num_active: usize,
    nums: &PicNums,
    rplm: &RefPicListModification,
    pic_num_lx_pred: &mut i32,
    ref_idx: &mut usize,
) {
    let abs_diff_pic_num = rplm.abs_diff_pic_num_minus1 as i32 + 1;

    let pic_num_lx_no_wrap = if rplm.modification_of_pic_nums_idc == 0 {
        if *pic_num_lx_pred - abs_diff_pic_num < 0 {
            *pic_num_lx_pred - abs_diff_pic_num + nums.max_pic_num
        } else {
            *pic_num_lx_pred - abs_diff_pic_num
        }
    } else if *pic_num_lx_pred + abs_diff_pic_num >= nums.max_pic_num {
        *pic_num_lx_pred + abs_diff_pic_num - nums.max_pic_num
    } else {
        *pic_num_lx_pred + abs_diff_pic_num
    };

    *pic_num_lx_pred = pic_num_lx_no_wrap;

    let pic_num_lx = if pic_num_lx_no_wrap > nums.curr_pic_num {
        pic_num_lx_no_wrap - nums.max_pic_num
    } else {
        pic_num_lx_no_wrap
    };

    let id = dpb.find_short_term_with_pic_num(pic_num_lx);
    if id.is_none() {
        warn!(
            "No short term reference with pic_num {}, using 'no reference picture'",
            pic_num_lx
        );
    }

    insert_and_compact(list, num_active, ref_idx, id, |entry| {
        pic_num_f(dpb, entry, nums.max_pic_num) == pic_num_lx
    });
}

// 8.2.4.3.2 Modification process of reference picture lists for long-term reference pictures
fn long_term_modification(
    dpb: &Dpb,
    list: &mut Vec<Option<PictureId>>,
    num_active: usize,
    nums: &PicNums,
    rplm: &RefPicListModification,
    ref_idx: &mut usize,
) {
    let long_term_pic_num = rplm.long_term_pic_num;

    let id = dpb.find_long_term_with_long_term_pic_num(long_term_pic_num);
    if id.is_none() {
        warn!(
            "No long term reference with long_term_pic_num {}, using 'no reference picture'",
            long_term_pic_num
        );
    }

    insert_and_compact(list, num_active, ref_idx, id, |entry| {
        long_term_pic_num_f(dpb, entry, nums.no_long_term_pic_num) == long_term_pic_num
    });
}

/// Applies the modification commands of one list. The list must already hold `num_active`
/// entries.
fn modify_list(
    dpb: &Dpb,
    list: &mut Vec<Option<PictureId>>,
    num_active: usize,
    nums: &PicNums,
    modifications: &[RefPicListModification],
) -> Result<(), DecodeError> {
    let mut pic_num_lx_pred = nums.curr_pic_num;
    let mut ref_idx = 0;

    for rplm in modifications {
        if ref_idx >= num_active && rplm.modification_of_pic_nums_idc != 3 {
            warn!(
                "Ignoring modification commands past the {} active entries of the list",
                num_active
            );
            break;
        }

        match rplm.modification_of_pic_nums_idc {
            0 | 1 => short_term_modification(
                dpb,
                list,
                num_active,
                nums,
                rplm,
                &mut pic_num_lx_pred,
                &mut ref_idx,
            ),
            2 => long_term_modification(dpb, list, num_active, nums, rplm, &mut ref_idx),
            3 => break,
            idc => {
                return Err(anyhow::anyhow!(
                    "unexpected modification_of_pic_nums_idc {}",
                    idc
                )
                .into())
            }
        }
    }

    Ok(())
}

/// Resizes an initial list to `num_active` entries, padding with "no reference picture".
fn init_list(initial: &[PictureId], num_active: usize) -> Vec<Option<PictureId>> {
    let mut list: Vec<_> = initial.iter().take(num_active).copied().map(Some).collect();
    list.resize(num_active, None);
    list
}

/// Builds the field lists of MBAFF frames from the frame lists.
fn init_mbaff_lists(lists: &mut RefPicLists, dpb: &Dpb) {
    for j in 0..2 {
        let mut top_mb = Vec::with_capacity(lists.lists[j].len() * 2);
        let mut bottom_mb = Vec::with_capacity(lists.lists[j].len() * 2);

        for &frame in &lists.lists[j] {
            let (top, bottom) = frame.map(|id| dpb.fields_of(id)).unwrap_or_default();
            top_mb.extend([top, bottom]);
            bottom_mb.extend([bottom, top]);
        }

        lists.lists[j + 2] = top_mb;
        lists.lists[j + 4] = bottom_mb;
    }
}

/// Builds the final reference picture lists of a slice of `pic`.
///
/// Fails when the last active entry of `RefPicList1`, or of `RefPicList0` in a conforming
/// stream, is "no reference picture".
pub fn build_slice_lists(
    dpb: &Dpb,
    pic: &PictureData,
    initial: &ReferencePicLists,
    hdr: &SliceHeader,
    sps: &Sps,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    non_conforming_stream: bool,
) -> Result<RefPicLists, DecodeError> {
    let mut lists = RefPicLists::default();

    let num_active = [hdr.num_ref_idx_l0_active(), hdr.num_ref_idx_l1_active()];
    match hdr.slice_type {
        SliceType::P | SliceType::Sp => {
            lists.lists[0] = init_list(&initial.ref_pic_list_p0, num_active[0]);
        }
        SliceType::B => {
            lists.lists[0] = init_list(&initial.ref_pic_list_b0, num_active[0]);
            lists.lists[1] = init_list(&initial.ref_pic_list_b1, num_active[1]);
        }
        SliceType::I | SliceType::Si => return Ok(lists),
    }

    let max_frame_num = sps.max_frame_num() as i32;
    let nums = PicNums {
        curr_pic_num: pic.pic_num,
        max_pic_num: if pic.field == Field::Frame {
            max_frame_num
        } else {
            2 * max_frame_num
        },
        no_long_term_pic_num: 2 * max_long_term_frame_idx.to_value_plus1(),
    };

    if hdr.ref_pic_list_modification_flag_l0 {
        modify_list(
            dpb,
            &mut lists.lists[0],
            num_active[0],
            &nums,
            &hdr.ref_pic_list_modification_l0,
        )?;
    }

    if lists.lists[0].last().map_or(false, Option::is_none) {
        if !non_conforming_stream {
            return Err(DecodeError::ReferenceListExhausted { list: 0 });
        }

        warn!(
            "RefPicList0[{}] is 'no reference picture'",
            num_active[0].saturating_sub(1)
        );
    }

    if hdr.slice_type.is_b() {
        if hdr.ref_pic_list_modification_flag_l1 {
            modify_list(
                dpb,
                &mut lists.lists[1],
                num_active[1],
                &nums,
                &hdr.ref_pic_list_modification_l1,
            )?;
        }

        if lists.lists[1].last().map_or(false, Option::is_none) {
            return Err(DecodeError::ReferenceListExhausted { list: 1 });
        }
    }

    if pic.mbaff {
        init_mbaff_lists(&mut lists, dpb);
    }

    debug!("RefPicList0: {:?}", lists.list(0));
    if hdr.slice_type.is_b() {
        debug!("RefPicList1: {:?}", lists.list(1));
    }

    Ok(lists)
}
