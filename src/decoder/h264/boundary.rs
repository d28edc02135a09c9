// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Detection of the first slice of a picture (7.4.1.2.4).

use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::Sps;

/// The fields of the previous slice header that tell whether a slice continues its picture.
///
/// `None` means no slice has been seen since the snapshot was reset, which makes the next slice
/// start a new picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OldSliceSnapshot {
    pub pps_id: Option<u8>,
    pub frame_num: Option<u16>,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub nal_ref_idc: Option<u8>,
    pub idr_flag: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
}

impl OldSliceSnapshot {
    pub fn from_slice(hdr: &SliceHeader, nalu: &NaluHeader) -> Self {
        let idr_flag = nalu.idr_pic_flag();

        Self {
            pps_id: Some(hdr.pic_parameter_set_id),
            frame_num: Some(hdr.frame_num),
            field_pic_flag: hdr.field_pic_flag,
            bottom_field_flag: hdr.bottom_field_flag,
            nal_ref_idc: Some(nalu.ref_idc),
            idr_flag,
            idr_pic_id: if idr_flag { hdr.idr_pic_id } else { 0 },
            pic_order_cnt_lsb: hdr.pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt: hdr.delta_pic_order_cnt,
        }
    }
}

/// Whether the slice `hdr` starts a new picture. `sps` and `pps` are the parameter sets the
/// slice refers to.
pub fn is_new_picture(
    has_active_picture: bool,
    hdr: &SliceHeader,
    nalu: &NaluHeader,
    sps: &Sps,
    pps: &Pps,
    old: &OldSliceSnapshot,
) -> bool {
    if !has_active_picture {
        return true;
    }

    let idr_flag = nalu.idr_pic_flag();

    let mut result = old.pps_id != Some(hdr.pic_parameter_set_id);
    result |= old.frame_num != Some(hdr.frame_num);
    result |= old.field_pic_flag != hdr.field_pic_flag;
    if hdr.field_pic_flag && old.field_pic_flag {
        result |= old.bottom_field_flag != hdr.bottom_field_flag;
    }

    if let Some(old_ref_idc) = old.nal_ref_idc {
        result |= old_ref_idc != nalu.ref_idc && (old_ref_idc == 0 || nalu.ref_idc == 0);
    }

    result |= old.idr_flag != idr_flag;
    if idr_flag && old.idr_flag {
        result |= old.idr_pic_id != hdr.idr_pic_id;
    }

    let bottom_in_frame = pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag;
    match sps.pic_order_cnt_type {
        0 => {
            result |= old.pic_order_cnt_lsb != hdr.pic_order_cnt_lsb;
            if bottom_in_frame {
                result |= old.delta_pic_order_cnt_bottom != hdr.delta_pic_order_cnt_bottom;
            }
        }
        1 if !sps.delta_pic_order_always_zero_flag => {
            result |= old.delta_pic_order_cnt[0] != hdr.delta_pic_order_cnt[0];
            if bottom_in_frame {
                result |= old.delta_pic_order_cnt[1] != hdr.delta_pic_order_cnt[1];
            }
        }
        _ => (),
    }

    result
}
