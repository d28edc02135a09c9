// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End of a picture: concealment of the lost macroblocks, deblocking, reassembly of MBAFF
//! field pairs and the handoff to the DPB or the output queue.

use std::rc::Rc;

use log::debug;
use log::info;
use log::warn;

use crate::backend::ColourPlane;
use crate::backend::ReconstructionBackend;
use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::picture::DecodedFrame;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::Picture;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Plane;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::Sps;
use crate::decoder::h264::ActivePicture;
use crate::decoder::h264::H264Decoder;
use crate::decoder::Result;

/// What the per-picture summary reports about a finished picture.
struct PictureReport {
    label: &'static str,
    field: Field,
    poc: i32,
    frame_num: i32,
    qp: i32,
    luma_crc: u32,
    /// I, SI and P pictures and references count as numbered pictures, the rest as B pictures.
    numbered: bool,
}

impl PictureReport {
    fn new(pic: &Picture) -> Self {
        let data = &pic.data;

        Self {
            label: data.type_label(),
            field: data.field,
            poc: data.frame_poc(),
            frame_num: data.frame_num,
            qp: data.qp,
            luma_crc: crc32fast::hash(&pic.frame.luma.data),
            numbered: matches!(data.slice_type, SliceType::I | SliceType::Si | SliceType::P)
                || data.is_ref(),
        }
    }
}

/// Swaps rows `y0..y0 + 2 * height` of a field decoded macroblock pair from one field after the
/// other to interleaved.
fn interleave_pair_rows(plane: &mut Plane, x0: usize, y0: usize, width: usize, height: usize) {
    if x0 + width > plane.width || y0 + 2 * height > plane.height {
        return;
    }

    let rows: Vec<Vec<u8>> = (y0..y0 + 2 * height)
        .map(|y| plane.row(y)[x0..x0 + width].to_vec())
        .collect();

    for (y, (top, bottom)) in rows[..height].iter().zip(&rows[height..]).enumerate() {
        plane.row_mut(y0 + 2 * y)[x0..x0 + width].copy_from_slice(top);
        plane.row_mut(y0 + 2 * y + 1)[x0..x0 + width].copy_from_slice(bottom);
    }
}

/// Rewrites the field decoded macroblock pairs of an MBAFF frame, which the backend
/// reconstructs top field over bottom field, in frame order.
pub(super) fn mbaff_post_process(frame: &mut DecodedFrame) {
    let width_in_mbs = frame.luma.width / 16;
    let height_in_mbs = frame.luma.height / 16;
    if width_in_mbs == 0 || height_in_mbs == 0 {
        return;
    }

    let num_pairs = frame.motion.mb_field.len() / 2;
    for pair in 0..num_pairs {
        if !frame.motion.mb_field[2 * pair] {
            continue;
        }

        let x = pair % width_in_mbs;
        let y = pair / width_in_mbs;

        interleave_pair_rows(&mut frame.luma, x * 16, y * 32, 16, 16);

        if let Some(chroma) = frame.chroma.as_mut() {
            for plane in chroma.iter_mut() {
                let mb_width = plane.width / width_in_mbs;
                let mb_height = plane.height / height_in_mbs;
                interleave_pair_rows(plane, x * mb_width, y * 2 * mb_height, mb_width, mb_height);
            }
        }
    }
}

impl<B: ReconstructionBackend> H264Decoder<B> {
    /// Finishes the active picture, if any, and hands it to the DPB.
    pub(super) fn end_picture(&mut self) -> Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };

        debug!(
            "Finishing picture {:?} (POC {}, {:?})",
            active.pic.data.id, active.pic.data.pic_order_cnt, active.pic.data.field
        );

        if !active.pic.data.mbaff {
            self.conceal_picture(&mut active.pic)?;
        }

        self.deblock(&mut active)?;

        if active.pic.data.mbaff {
            mbaff_post_process(&mut active.pic.frame);
        }

        if active.pic.data.field != Field::Frame {
            self.ctx.counters.number /= 2;
        }

        let report = PictureReport::new(&active.pic);
        let ActivePicture { pic, sps, .. } = active;
        let Picture { data, frame } = pic;

        self.store_picture(data, Some(Rc::new(frame)), &sps)?;

        if self.last_has_mmco_5 {
            self.pre_frame_num = 0;
        }

        self.report_picture(&report);

        self.ctx.current_slice_nr = 0;
        self.old_slice = Default::default();

        Ok(())
    }

    /// Splits the luma plane in runs of decoded and lost macroblocks and conceals the lost ones.
    fn conceal_picture(&mut self, pic: &mut Picture) -> Result<()> {
        let Some(state) = self.ctx.planes.first() else {
            return Ok(());
        };
        let mbs = &state.mbs;
        let Some(last) = mbs.len().checked_sub(1) else {
            return Ok(());
        };

        let erc = &mut self.ctx.erc;
        erc.start_segment(0);
        for (mb_addr, pair) in mbs.windows(2).enumerate() {
            if pair[0].needs_concealment != pair[1].needs_concealment {
                erc.stop_segment(mb_addr);
                if pair[0].needs_concealment {
                    erc.mark_current_segment_lost();
                } else {
                    erc.mark_current_segment_ok();
                }
                erc.start_segment(mb_addr + 1);
            }
        }

        erc.stop_segment(last);
        if mbs[last].needs_concealment {
            erc.mark_current_segment_lost();
        } else {
            erc.mark_current_segment_ok();
        }

        let lost = erc.num_corrupted_segments();
        if lost == 0 {
            return Ok(());
        }

        warn!(
            "Concealing {} lost segments of picture {:?} (frame_num {})",
            lost, pic.data.id, pic.data.frame_num
        );

        if pic.data.slice_type.is_intra() {
            self.backend.conceal_intra_frame(pic, erc)?;
        } else {
            let mv_per_mb = self.ctx.erc_mv_per_mb / mbs.len() as i64;
            self.backend.conceal_inter_frame(
                pic,
                erc,
                &self.ctx.erc_objects,
                mv_per_mb as i32,
                &self.dpb,
            )?;
        }

        Ok(())
    }

    /// Runs the deblocking filter. The colour planes of a picture coded with separate planes are
    /// filtered one by one, then merged into a single picture.
    fn deblock(&mut self, active: &mut ActivePicture) -> Result<()> {
        match active.planes.take() {
            Some(planes) => {
                let [mut u, mut v] = *planes;

                self.backend.deblock(&mut active.pic, Some(ColourPlane::Y))?;
                self.backend.deblock(&mut u, Some(ColourPlane::U))?;
                self.backend.deblock(&mut v, Some(ColourPlane::V))?;

                active.pic.frame.chroma = Some([u.frame.luma, v.frame.luma]);
            }
            None => self.backend.deblock(&mut active.pic, None)?,
        }

        Ok(())
    }

    fn report_picture(&mut self, report: &PictureReport) {
        let counters = &mut self.ctx.counters;

        let label = match report.field {
            Field::Top => {
                counters.first_field_label = Some(report.label);
                return;
            }
            Field::Bottom => format!(
                "{}{}",
                counters.first_field_label.take().unwrap_or_default(),
                report.label
            ),
            Field::Frame => report.label.to_string(),
        };

        if !self.config.silent {
            info!(
                "{:05} ({:>6}) POC {:>5} pic_num {:>5} QP {:>2}",
                counters.frames,
                label,
                report.poc.checked_div(self.config.poc_scale).unwrap_or(report.poc),
                report.frame_num,
                report.qp
            );
        }
        debug!("Luma CRC32 of picture {}: {:08x}", counters.frames, report.luma_crc);

        if report.numbered {
            counters.number += 1;
        } else {
            counters.b_frames += 1;
        }
        counters.frames += 1;
    }

    /// Applies reference marking to a decoded or synthesized picture and stores it in the DPB,
    /// or queues it for output if the DPB does not need it.
    pub(super) fn store_picture(
        &mut self,
        mut pic: PictureData,
        frame: Option<Rc<DecodedFrame>>,
        sps: &Sps,
    ) -> Result<()> {
        if pic.is_ref() {
            self.reference_pic_marking(&mut pic, sps)?;
            if !pic.concealed {
                self.fill_prev_ref_info(&pic);
            }
        }

        if !pic.concealed {
            self.fill_prev_info(&pic);
        }
        self.last_has_mmco_5 = pic.has_mmco_5;

        self.dpb.remove_unused();

        if pic.has_mmco_5 {
            // C.4.5.3 clause 3: output everything before the current picture.
            self.drain();
        }

        let bumped = self.dpb.bump_as_needed(&pic);
        self.emit(bumped);

        // C.4.5.1, C.4.5.2
        if self.dpb.is_second_field_of_complementary_ref_pair(&pic)
            || pic.is_ref()
            || self.dpb.has_empty_frame_buffer()
        {
            self.add_to_dpb(pic, frame)
        } else {
            self.add_to_ready_queue(pic, frame);
            Ok(())
        }
    }

    /// Stores `pic` in the DPB. Frames of interlaced streams are stored as their two fields.
    pub(super) fn add_to_dpb(
        &mut self,
        mut pic: PictureData,
        frame: Option<Rc<DecodedFrame>>,
    ) -> Result<()> {
        let completes_last_field = self
            .last_field
            .as_ref()
            .map_or(true, |last| pic.other_field() == Some(last.pic.id));
        if !completes_last_field {
            self.flush_last_field();
        }

        if self.dpb.interlaced() && pic.field == Field::Frame {
            let bottom = pic.split_frame(self.dpb.allocate_id());
            self.dpb.add_picture(pic, frame.clone(), &mut self.last_field)?;
            self.dpb.add_picture(bottom, frame, &mut self.last_field)?;
        } else {
            self.dpb.add_picture(pic, frame, &mut self.last_field)?;
        }

        Ok(())
    }

    /// Outputs a picture the DPB does not keep. A first field waits for its second field.
    fn add_to_ready_queue(&mut self, pic: PictureData, frame: Option<Rc<DecodedFrame>>) {
        let entry = DpbEntry { pic, frame };

        if entry.pic.field == Field::Frame {
            self.flush_last_field();
            self.emit(entry.output(None));
            return;
        }

        match self.last_field.take() {
            Some(mut first)
                if entry.pic.is_second_field() && entry.pic.other_field() == Some(first.pic.id) =>
            {
                first.pic.set_second_field_to(&entry.pic);
                self.emit(first.output(Some(&entry)));
            }
            last_field => {
                self.last_field = last_field;
                self.flush_last_field();

                if entry.pic.is_second_field() {
                    self.emit(entry.output(None));
                } else {
                    self.last_field = Some(entry);
                }
            }
        }
    }

    /// Outputs the cached first field on its own.
    fn flush_last_field(&mut self) {
        if let Some(last_field) = self.last_field.take() {
            warn!(
                "{:?} field with POC {} was never paired",
                last_field.pic.field, last_field.pic.pic_order_cnt
            );
            self.emit(last_field.output(None));
        }
    }
}
