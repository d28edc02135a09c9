// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Start of a picture: frame_num gap handling, field pairing, picture order count and the
//! reference marking shared by every stored picture.

use std::rc::Rc;

use anyhow::anyhow;
use log::debug;
use log::trace;
use log::warn;

use crate::backend::ReconstructionBackend;
use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::Picture;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::syntax::MaxLongTermFrameIdx;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::Sps;
use crate::decoder::h264::slice::Entropy;
use crate::decoder::h264::ActivePicture;
use crate::decoder::h264::H264Decoder;
use crate::decoder::ConcealMode;
use crate::decoder::DecodeError;
use crate::decoder::Result;

/// Sample value of frames synthesized without any reference to copy from.
const GREY: u8 = 128;

impl<B: ReconstructionBackend> H264Decoder<B> {
    /// Starts the picture whose first slice is `hdr`, finishing the active one first.
    pub(super) fn begin_picture(
        &mut self,
        nalu: &NaluHeader,
        hdr: &SliceHeader,
        sps: &Rc<Sps>,
        pps: &Rc<Pps>,
    ) -> Result<()> {
        if self.active.is_some() {
            trace!("Slice starts a new picture, finishing the active one");
            self.end_picture()?;
        }

        let frame_num = i32::from(hdr.frame_num);
        let max_frame_num = sps.max_frame_num() as i32;
        if frame_num >= max_frame_num {
            return Err(anyhow!(
                "frame_num {} is not below MaxFrameNum {}",
                frame_num,
                max_frame_num
            )
            .into());
        }

        if nalu.idr_pic_flag() {
            self.pre_frame_num = 0;
        }

        if self.recovery.recovery_point {
            let cnt = self.recovery.recovery_frame_cnt as i32;
            self.recovery.frame_num = Some((frame_num + cnt) % max_frame_num);
        }
        if nalu.idr_pic_flag() {
            self.recovery.frame_num = Some(frame_num);
        }

        let expected = (self.pre_frame_num + 1) % max_frame_num;
        if !self.recovery.recovery_point
            && frame_num != self.pre_frame_num
            && frame_num != expected
        {
            self.handle_frame_num_gap(frame_num, expected, sps)?;
        }

        if nalu.ref_idc != 0 {
            self.pre_frame_num = frame_num;
        }

        let mut data = self.init_current_pic(nalu, hdr, sps, pps)?;

        if self.recovery.frame_num == Some(frame_num) {
            data.recovery_frame = true;
            if self.recovery.poc.is_none() {
                debug!("Recovery frame reached, POC {}", data.frame_poc());
                self.recovery.poc = Some(data.frame_poc());
            }
        }

        if nalu.ref_idc != 0 {
            self.last_ref_pic_poc = data.frame_poc();
        }

        debug!(
            "Decoding picture {:?}: {}, frame_num {}, POC {}, {:?}",
            data.id,
            data.type_label(),
            data.frame_num,
            data.pic_order_cnt,
            data.field
        );

        let separate = sps.separate_colour_plane_flag;
        let pic = Picture::new(data, separate);
        let planes = separate.then(|| {
            Box::new([
                Picture::new(pic.data.clone(), true),
                Picture::new(pic.data.clone(), true),
            ])
        });

        let pic_size = pic.pic_size_in_mbs();
        let entropy = if pps.entropy_coding_mode_flag {
            Entropy::Cabac
        } else {
            Entropy::Cavlc
        };

        let ctx = &mut self.ctx;
        ctx.planes.resize_with(if separate { 3 } else { 1 }, Default::default);
        for plane in &mut ctx.planes {
            plane.reset(pic_size, entropy, pps.constrained_intra_pred_flag);
        }
        ctx.erc.reset(pic_size, pic.width_in_mbs());
        ctx.erc_objects.clear();
        ctx.erc_objects.resize(4 * pic_size, Default::default());
        ctx.erc_mv_per_mb = 0;
        ctx.current_slice_nr = 0;

        match pic.data.field {
            Field::Top => ctx.counters.number *= 2,
            Field::Bottom => ctx.counters.number = ctx.counters.number * 2 + 1,
            Field::Frame => (),
        }

        let initial_lists = self.dpb.build_ref_pic_lists(&pic.data);

        self.active = Some(ActivePicture {
            pic,
            planes,
            sps: Rc::clone(sps),
            pps: Rc::clone(pps),
            initial_lists,
        });

        Ok(())
    }

    fn handle_frame_num_gap(&mut self, frame_num: i32, expected: i32, sps: &Sps) -> Result<()> {
        if sps.gaps_in_frame_num_value_allowed_flag {
            return self.fill_frame_num_gap(frame_num, sps);
        }

        match self.config.conceal_mode {
            ConcealMode::Off => Err(DecodeError::FrameNumGap {
                frame_num,
                expected,
            }),
            mode => {
                warn!(
                    "Pictures lost before frame_num {} (expected {}), concealing them",
                    frame_num, expected
                );

                // Reference lists cannot be formed across a lost IDR picture, so only frame
                // copy is possible there.
                let idr_lost = frame_num < expected;
                let mode = if idr_lost {
                    ConcealMode::FrameCopy
                } else {
                    mode
                };

                self.conceal_lost_frames(frame_num, idr_lost, mode, sps)
            }
        }
    }

    /// Synthesizes the reference frames missing before `frame_num` from the last reference
    /// frame. When `idr_lost` is set, the first synthesized frame stands in for the lost IDR
    /// picture.
    fn conceal_lost_frames(
        &mut self,
        frame_num: i32,
        idr_lost: bool,
        mode: ConcealMode,
        sps: &Sps,
    ) -> Result<()> {
        let max_frame_num = sps.max_frame_num() as i32;

        let mut unused_short_term_frame_num = if idr_lost {
            self.last_ref_pic_poc = -self.config.poc_scale;
            0
        } else {
            (self.pre_frame_num + 1) % max_frame_num
        };
        let mut idr = idr_lost;

        while unused_short_term_frame_num != frame_num {
            let mut data = PictureData::new_concealed(
                self.dpb.allocate_id(),
                unused_short_term_frame_num,
                idr,
                sps,
            );

            let poc = if idr {
                0
            } else {
                self.last_ref_pic_poc + self.config.ref_poc_gap
            };
            data.top_field_order_cnt = poc;
            data.bottom_field_order_cnt = poc;
            data.pic_order_cnt = poc;
            self.last_ref_pic_poc = poc;

            debug!(
                "Concealing lost frame_num {} with POC {} ({:?})",
                unused_short_term_frame_num, poc, mode
            );

            let mut pic = Picture::new(data, false);
            match self.dpb.last_reference_frame().cloned() {
                Some(reference) if mode == ConcealMode::MotionCopy => {
                    self.backend.conceal_lost_frame(&mut pic, &reference, &self.dpb)?;
                }
                Some(reference) => {
                    let copy = self
                        .dpb
                        .output_picture(reference.pic.id)
                        .filter(|copy| copy.luma.data.len() == pic.frame.luma.data.len());

                    if let Some(copy) = copy {
                        pic.frame.luma = copy.luma;
                        pic.frame.chroma = copy.chroma;
                    }
                }
                None => {
                    warn!(
                        "No reference frame to conceal frame_num {} from",
                        unused_short_term_frame_num
                    );
                    pic.frame.luma.fill(GREY);
                    if let Some(chroma) = pic.frame.chroma.as_mut() {
                        chroma.iter_mut().for_each(|plane| plane.fill(GREY));
                    }
                }
            }

            if idr {
                self.drain();
            }

            let Picture { data, frame } = pic;
            self.dpb
                .update_pic_nums(data.frame_num, max_frame_num, &data);
            self.store_picture(data, Some(Rc::new(frame)), sps)?;

            self.pre_frame_num = unused_short_term_frame_num;
            self.loss.push_lost_picture();
            self.stats.concealed_frames += 1;

            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
            idr = false;
        }

        Ok(())
    }

    /// Inserts the "non-existing" frames of 8.2.5.2 for the frame_num values skipped before
    /// `frame_num`.
    fn fill_frame_num_gap(&mut self, frame_num: i32, sps: &Sps) -> Result<()> {
        let max_frame_num = sps.max_frame_num() as i32;
        let mut unused_short_term_frame_num = (self.pre_frame_num + 1) % max_frame_num;

        debug!(
            "Filling frame_num gap from {} to {}",
            unused_short_term_frame_num, frame_num
        );

        while unused_short_term_frame_num != frame_num {
            let mut pic = PictureData::new_non_existing(
                self.dpb.allocate_id(),
                unused_short_term_frame_num,
                sps.pic_order_cnt_type,
            );

            if sps.pic_order_cnt_type != 0 {
                self.compute_pic_order_count(&mut pic, sps)?;
                self.fill_prev_info(&pic);
            }

            self.dpb
                .update_pic_nums(unused_short_term_frame_num, max_frame_num, &pic);
            self.dpb.sliding_window_marking(&mut pic, sps)?;
            self.dpb.remove_unused();

            let bumped = self.dpb.bump_as_needed(&pic);
            self.emit(bumped);

            self.add_to_dpb(pic, None)?;

            self.pre_frame_num = unused_short_term_frame_num;
            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
        }

        Ok(())
    }

    fn init_current_pic(
        &mut self,
        nalu: &NaluHeader,
        hdr: &SliceHeader,
        sps: &Sps,
        pps: &Pps,
    ) -> Result<PictureData> {
        let first_field = self.find_first_field(hdr);

        let mut pic = PictureData::new_from_slice(self.dpb.allocate_id(), hdr, nalu, sps);
        pic.qp += i32::from(pps.pic_init_qp_minus26);

        if let Some(first_field) = &first_field {
            pic.set_first_field_to(first_field);
        }

        self.compute_pic_order_count(&mut pic, sps)?;

        if matches!(pic.is_idr, IsIdr::Yes { .. }) && first_field.is_none() {
            if pic.ref_pic_marking.no_output_of_prior_pics_flag {
                debug!("IDR picture with no_output_of_prior_pics_flag, dropping the DPB");
                self.dpb.clear();
                self.last_field = None;
            } else {
                self.drain();
            }
        }

        self.dpb
            .update_pic_nums(pic.frame_num, sps.max_frame_num() as i32, &pic);

        Ok(pic)
    }

    /// Finds the first field the picture started by `hdr` completes. A field that cannot be
    /// paired is decoded as an unpaired field.
    fn find_first_field(&self, hdr: &SliceHeader) -> Option<PictureData> {
        if !self.dpb.interlaced() {
            return None;
        }

        let prev_field = match &self.last_field {
            Some(last_field) => &last_field.pic,
            None => {
                let last = &self.dpb.entries().last()?.pic;
                // Still waiting for the second field?
                if last.field == Field::Frame || last.other_field().is_some() || last.nonexisting {
                    return None;
                }
                last
            }
        };

        if !hdr.field_pic_flag {
            warn!(
                "Expected the {:?} field complementary to {:?}, got a frame",
                prev_field.field.opposite(),
                prev_field.field
            );
            return None;
        }

        if prev_field.frame_num != i32::from(hdr.frame_num) {
            warn!(
                "The previous field has frame_num {}, the current one {}, not pairing them",
                prev_field.frame_num, hdr.frame_num
            );
            return None;
        }

        if hdr.field() == prev_field.field {
            warn!("Got two {:?} fields in a row, not pairing them", prev_field.field);
            return None;
        }

        Some(prev_field.clone())
    }

    pub(super) fn compute_pic_order_count(&self, pic: &mut PictureData, sps: &Sps) -> Result<()> {
        let idr = matches!(pic.is_idr, IsIdr::Yes { .. });

        match pic.pic_order_cnt_type {
            // 8.2.1.1
            0 => {
                let prev = &self.prev_ref_pic_info;
                let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) = if idr {
                    (0, 0)
                } else if prev.has_mmco_5 {
                    if prev.field != Field::Bottom {
                        (0, prev.top_field_order_cnt)
                    } else {
                        (0, 0)
                    }
                } else {
                    (prev.pic_order_cnt_msb, prev.pic_order_cnt_lsb)
                };

                let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();

                pic.pic_order_cnt_msb = if pic.pic_order_cnt_lsb < prev_pic_order_cnt_lsb
                    && prev_pic_order_cnt_lsb - pic.pic_order_cnt_lsb >= max_pic_order_cnt_lsb / 2
                {
                    prev_pic_order_cnt_msb + max_pic_order_cnt_lsb
                } else if pic.pic_order_cnt_lsb > prev_pic_order_cnt_lsb
                    && pic.pic_order_cnt_lsb - prev_pic_order_cnt_lsb > max_pic_order_cnt_lsb / 2
                {
                    prev_pic_order_cnt_msb - max_pic_order_cnt_lsb
                } else {
                    prev_pic_order_cnt_msb
                };

                if pic.field != Field::Bottom {
                    pic.top_field_order_cnt = pic.pic_order_cnt_msb + pic.pic_order_cnt_lsb;
                }

                match pic.field {
                    Field::Frame => {
                        pic.bottom_field_order_cnt =
                            pic.top_field_order_cnt + pic.delta_pic_order_cnt_bottom
                    }
                    Field::Bottom => {
                        pic.bottom_field_order_cnt = pic.pic_order_cnt_msb + pic.pic_order_cnt_lsb
                    }
                    Field::Top => (),
                }
            }

            // 8.2.1.2
            1 => {
                pic.frame_num_offset = self.frame_num_offset(pic, sps);

                let cycle = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
                let mut abs_frame_num = if cycle != 0 {
                    pic.frame_num_offset + pic.frame_num
                } else {
                    0
                };

                if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected_pic_order_cnt = 0;
                if abs_frame_num > 0 {
                    let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / cycle;
                    let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % cycle;

                    expected_pic_order_cnt =
                        pic_order_cnt_cycle_cnt * sps.expected_delta_per_pic_order_cnt_cycle;
                    expected_pic_order_cnt += sps.offset_for_ref_frame
                        [..=frame_num_in_pic_order_cnt_cycle as usize]
                        .iter()
                        .sum::<i32>();
                }

                if pic.nal_ref_idc == 0 {
                    expected_pic_order_cnt += sps.offset_for_non_ref_pic;
                }

                match pic.field {
                    Field::Frame => {
                        pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
                        pic.bottom_field_order_cnt = pic.top_field_order_cnt
                            + sps.offset_for_top_to_bottom_field
                            + pic.delta_pic_order_cnt1;
                    }
                    Field::Top => {
                        pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
                    }
                    Field::Bottom => {
                        pic.bottom_field_order_cnt = expected_pic_order_cnt
                            + sps.offset_for_top_to_bottom_field
                            + pic.delta_pic_order_cnt0;
                    }
                }
            }

            // 8.2.1.3
            2 => {
                pic.frame_num_offset = self.frame_num_offset(pic, sps);

                let temp_pic_order_cnt = if idr {
                    0
                } else if pic.nal_ref_idc == 0 {
                    2 * (pic.frame_num_offset + pic.frame_num) - 1
                } else {
                    2 * (pic.frame_num_offset + pic.frame_num)
                };

                match pic.field {
                    Field::Frame => {
                        pic.top_field_order_cnt = temp_pic_order_cnt;
                        pic.bottom_field_order_cnt = temp_pic_order_cnt;
                    }
                    Field::Top => pic.top_field_order_cnt = temp_pic_order_cnt,
                    Field::Bottom => pic.bottom_field_order_cnt = temp_pic_order_cnt,
                }
            }

            other => return Err(anyhow!("invalid pic_order_cnt_type {}", other).into()),
        }

        pic.pic_order_cnt = match pic.field {
            Field::Frame => std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt),
            Field::Top => pic.top_field_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt,
        };

        Ok(())
    }

    /// `FrameNumOffset` of POC types 1 and 2.
    fn frame_num_offset(&self, pic: &PictureData, sps: &Sps) -> i32 {
        let prev_frame_num_offset = if self.prev_pic_info.has_mmco_5 {
            0
        } else {
            self.prev_pic_info.frame_num_offset
        };

        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            0
        } else if self.prev_pic_info.frame_num > pic.frame_num {
            prev_frame_num_offset + sps.max_frame_num() as i32
        } else {
            prev_frame_num_offset
        }
    }

    /// Marks the references of the DPB once `pic` is decoded (8.2.5).
    pub(super) fn reference_pic_marking(&mut self, pic: &mut PictureData, sps: &Sps) -> Result<()> {
        // 8.2.5.1
        if matches!(pic.is_idr, IsIdr::Yes { .. }) && !pic.is_second_field() {
            self.dpb.mark_all_as_unused_for_ref();

            if pic.ref_pic_marking.long_term_reference_flag {
                pic.set_reference(Reference::LongTerm);
                pic.long_term_frame_idx = 0;
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            } else {
                pic.set_reference(Reference::ShortTerm);
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }

            return Ok(());
        }

        if pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            self.max_long_term_frame_idx = self
                .dpb
                .handle_memory_management_ops(pic, self.max_long_term_frame_idx)?;
        } else {
            self.dpb.sliding_window_marking(pic, sps)?;
        }

        Ok(())
    }

    pub(super) fn fill_prev_ref_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_ref_pic_info;

        prev.has_mmco_5 = pic.has_mmco_5;
        prev.top_field_order_cnt = pic.top_field_order_cnt;
        prev.pic_order_cnt_msb = pic.pic_order_cnt_msb;
        prev.pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
        prev.field = pic.field;
    }

    pub(super) fn fill_prev_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_pic_info;

        prev.frame_num = pic.frame_num;
        prev.has_mmco_5 = pic.has_mmco_5;
        prev.frame_num_offset = pic.frame_num_offset;
    }
}
