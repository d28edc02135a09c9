// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Weighted prediction tables of a slice (8.4.2.3).

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::PictureId;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::PredWeightTable;
use crate::codec::h264::syntax::SliceHeader;
use crate::decoder::h264::ref_lists::RefPicLists;

/// Weights used by bi-predicted blocks when no better ones can be derived.
const DEFAULT_IMPLICIT_WEIGHTS: (i32, i32) = (32, 32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WeightMode {
    /// Plain averaging.
    #[default]
    Default,
    /// Weights and offsets from the slice header.
    Explicit,
    /// Weights derived from the POC distances of the references.
    Implicit,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WeightTables {
    pub mode: WeightMode,
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    pub explicit: Option<PredWeightTable>,
    /// `(w0, w1)` by `[k][ref_idx_l0][ref_idx_l1]`, where `k` is 0 for the frame or field lists
    /// and 1 or 2 for the top or bottom field lists of MBAFF frames.
    implicit: [Vec<Vec<(i32, i32)>>; 3],
}

fn clip3(min: i32, max: i32, value: i32) -> i32 {
    value.clamp(min, max)
}

/// Implicit weights of one pair of references.
fn implicit_weights(cur_poc: i32, ref0: Option<(i32, bool)>, ref1: Option<(i32, bool)>) -> (i32, i32) {
    let ((poc0, long_term0), (poc1, long_term1)) = match ref0.zip(ref1) {
        Some(refs) => refs,
        None => return DEFAULT_IMPLICIT_WEIGHTS,
    };

    let td = clip3(-128, 127, poc1 - poc0);
    if td == 0 || long_term0 || long_term1 {
        return DEFAULT_IMPLICIT_WEIGHTS;
    }

    let tb = clip3(-128, 127, cur_poc - poc0);
    let tx = (16384 + (td / 2).abs()) / td;
    let dist_scale_factor = clip3(-1024, 1023, (tx * tb + 32) >> 6);

    let w1 = dist_scale_factor >> 2;
    if !(-64..=128).contains(&w1) {
        return DEFAULT_IMPLICIT_WEIGHTS;
    }

    (64 - w1, w1)
}

impl WeightTables {
    pub fn new(
        hdr: &SliceHeader,
        pps: &Pps,
        pic: &PictureData,
        lists: &RefPicLists,
        dpb: &Dpb,
    ) -> Self {
        let slice_type = hdr.slice_type;

        let explicit = (pps.weighted_pred_flag && (slice_type.is_p() || slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && slice_type.is_b());
        let implicit = pps.weighted_bipred_idc == 2 && slice_type.is_b();

        if explicit {
            let table = hdr.pred_weight_table.clone();
            return Self {
                mode: WeightMode::Explicit,
                luma_log2_weight_denom: table.luma_log2_weight_denom,
                chroma_log2_weight_denom: table.chroma_log2_weight_denom,
                explicit: Some(table),
                ..Default::default()
            };
        }

        if !implicit {
            return Default::default();
        }

        let mut tables = Self {
            mode: WeightMode::Implicit,
            luma_log2_weight_denom: 5,
            chroma_log2_weight_denom: 5,
            ..Default::default()
        };

        // Frame lists of a frame compare frame POCs, the other lists field POCs.
        let frame = pic.field == Field::Frame;
        let ref_poc = |id: Option<PictureId>, frame_list: bool| {
            let pic = dpb.pic(id?)?;
            let poc = if frame_list {
                pic.frame_poc()
            } else {
                pic.pic_order_cnt
            };

            Some((poc, matches!(pic.reference(), Reference::LongTerm)))
        };

        let cur_poc = if frame {
            pic.frame_poc()
        } else {
            pic.pic_order_cnt
        };
        tables.implicit[0] = Self::build(lists.list(0), lists.list(1), |r0, r1| {
            implicit_weights(cur_poc, ref_poc(r0, frame), ref_poc(r1, frame))
        });

        if pic.mbaff {
            for (k, cur_poc) in [(1, pic.top_field_order_cnt), (2, pic.bottom_field_order_cnt)] {
                tables.implicit[k] = Self::build(lists.list(2 * k), lists.list(2 * k + 1), |r0, r1| {
                    implicit_weights(cur_poc, ref_poc(r0, false), ref_poc(r1, false))
                });
            }
        }

        tables
    }

    fn build(
        list0: &[Option<PictureId>],
        list1: &[Option<PictureId>],
        weights: impl Fn(Option<PictureId>, Option<PictureId>) -> (i32, i32),
    ) -> Vec<Vec<(i32, i32)>> {
        list0
            .iter()
            .map(|&r0| list1.iter().map(|&r1| weights(r0, r1)).collect())
            .collect()
    }

    /// Implicit `(w0, w1)` for the given reference indices of lists `k`.
    pub fn implicit(&self, k: usize, ref_idx_l0: usize, ref_idx_l1: usize) -> (i32, i32) {
        self.implicit
            .get(k)
            .and_then(|t| t.get(ref_idx_l0))
            .and_then(|t| t.get(ref_idx_l1))
            .copied()
            .unwrap_or(DEFAULT_IMPLICIT_WEIGHTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::syntax::PpsBuilder;
    use crate::codec::h264::syntax::SliceHeaderBuilder;
    use crate::codec::h264::syntax::SliceType;
    use crate::codec::h264::syntax::SpsBuilder;

    fn store(dpb: &mut Dpb, poc: i32, reference: Reference) -> PictureId {
        let id = dpb.allocate_id();
        let mut pic = PictureData::new_non_existing(id, 0, 0);
        pic.nonexisting = false;
        pic.top_field_order_cnt = poc;
        pic.bottom_field_order_cnt = poc;
        pic.pic_order_cnt = poc;
        pic.set_reference(reference);
        dpb.add_picture(pic, None, &mut None).unwrap();
        id
    }

    #[test]
    fn implicit_weights_follow_poc_distance() {
        assert_eq!(implicit_weights(4, Some((0, false)), Some((8, false))), (32, 32));
        assert_eq!(implicit_weights(2, Some((0, false)), Some((8, false))), (48, 16));
        // Same POC on both sides.
        assert_eq!(implicit_weights(2, Some((8, false)), Some((8, false))), (32, 32));
        assert_eq!(implicit_weights(2, Some((0, true)), Some((8, false))), (32, 32));
        // Extrapolation beyond the allowed range.
        assert_eq!(implicit_weights(40, Some((0, false)), Some((2, false))), (32, 32));
        assert_eq!(implicit_weights(2, None, Some((8, false))), (32, 32));
    }

    #[test]
    fn slice_tables() {
        let sps = SpsBuilder::new().build();
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);
        let past = store(&mut dpb, 0, Reference::ShortTerm);
        let future = store(&mut dpb, 8, Reference::ShortTerm);

        let pic = PictureData {
            pic_order_cnt: 2,
            top_field_order_cnt: 2,
            bottom_field_order_cnt: 2,
            coded_frame: true,
            ..Default::default()
        };
        let lists = RefPicLists::new([
            vec![Some(past), Some(future)],
            vec![Some(future)],
            vec![],
            vec![],
            vec![],
            vec![],
        ]);

        let pps = PpsBuilder::new(&sps).weighted_bipred_idc(2).build();
        let hdr = SliceHeaderBuilder::new(&pps).slice_type(SliceType::B).build();
        let tables = WeightTables::new(&hdr, &pps, &pic, &lists, &dpb);
        assert_eq!(tables.mode, WeightMode::Implicit);
        assert_eq!(tables.luma_log2_weight_denom, 5);
        assert_eq!(tables.implicit(0, 0, 0), (48, 16));
        assert_eq!(tables.implicit(0, 1, 0), (32, 32));
        // Out of range indices fall back to the default weights.
        assert_eq!(tables.implicit(1, 0, 0), (32, 32));

        // P slices never use implicit weights.
        let hdr = SliceHeaderBuilder::new(&pps).slice_type(SliceType::P).build();
        let tables = WeightTables::new(&hdr, &pps, &pic, &lists, &dpb);
        assert_eq!(tables.mode, WeightMode::Default);

        let pps = PpsBuilder::new(&sps).weighted_pred_flag(true).build();
        let tables = WeightTables::new(&hdr, &pps, &pic, &lists, &dpb);
        assert_eq!(tables.mode, WeightMode::Explicit);
        assert!(tables.explicit.is_some());
    }
}
