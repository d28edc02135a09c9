// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use anyhow::Context;
use log::debug;
use thiserror::Error;

use crate::codec::h264::picture::DecodedFrame;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::PictureId;
use crate::codec::h264::picture::Plane;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::syntax::MaxLongTermFrameIdx;
use crate::codec::h264::syntax::RefPicMarkingInner;
use crate::codec::h264::syntax::Sps;
use crate::decoder::DecodedPicture;

type DpbPicRefList<'a> = Vec<&'a DpbEntry>;

/// Initial reference picture lists, as produced by 8.2.4.2. Derived from the pictures currently
/// in the DPB, before any modification is applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencePicLists {
    /// Reference picture list for P slices.
    pub ref_pic_list_p0: Vec<PictureId>,
    /// Reference picture list 0 for B slices.
    pub ref_pic_list_b0: Vec<PictureId>,
    /// Reference picture list 1 for B slices.
    pub ref_pic_list_b1: Vec<PictureId>,
}

/// A picture stored in the DPB.
///
/// `frame` is `None` for non-existing pictures. Both halves of a split frame share the same
/// samples.
#[derive(Clone, Debug)]
pub struct DpbEntry {
    pub pic: PictureData,
    pub frame: Option<Rc<DecodedFrame>>,
}

impl DpbEntry {
    /// Builds the displayable picture of this entry. A field is woven with `other_field` when
    /// given, otherwise it is output alone.
    pub fn output(&self, other_field: Option<&DpbEntry>) -> Option<DecodedPicture> {
        let frame = self.frame.as_ref()?;

        if self.pic.coded_frame {
            return Some(DecodedPicture::new(
                &self.pic,
                Field::Frame,
                frame.luma.clone(),
                frame.chroma.clone(),
            ));
        }

        let other = other_field.and_then(|o| o.frame.as_ref().map(|f| (o, f)));

        match other {
            Some((other, other_frame)) => {
                let (top, bottom) = match self.pic.field {
                    Field::Bottom => (other_frame, frame),
                    _ => (frame, other_frame),
                };

                let luma = Plane::interleave_fields(&top.luma, &bottom.luma);
                let chroma = top.chroma.as_ref().zip(bottom.chroma.as_ref()).map(|(t, b)| {
                    [
                        Plane::interleave_fields(&t[0], &b[0]),
                        Plane::interleave_fields(&t[1], &b[1]),
                    ]
                });

                let mut pic = self.pic.clone();
                pic.pic_order_cnt = std::cmp::min(self.pic.pic_order_cnt, other.pic.pic_order_cnt);
                Some(DecodedPicture::new(&pic, Field::Frame, luma, chroma))
            }
            None => Some(DecodedPicture::new(
                &self.pic,
                self.pic.field,
                frame.luma.clone(),
                frame.chroma.clone(),
            )),
        }
    }
}

pub struct Dpb {
    /// Pictures in storage order. Every entry is addressed by its `PictureId`.
    entries: Vec<DpbEntry>,
    /// The maximum number of frames that can be stored.
    max_num_pics: usize,
    /// Upper bound on the number of frames that may precede any frame in decoding order and
    /// follow it in output order.
    max_num_reorder_frames: usize,
    /// Whether we're decoding in interlaced mode. Frames are split into their two fields when
    /// stored, which makes reference marking easier.
    interlaced: bool,
    next_id: u32,
}

#[derive(Debug, Error)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
    #[error("picture is second field but first field doesn't exist")]
    NoFirstField,
}

#[derive(Debug, Error)]
pub enum MmcoError {
    #[error("could not find a ShortTerm picture to mark in the DPB")]
    NoShortTermPic,
    #[error("could not find a LongTerm picture to mark in the DPB")]
    NoLongTermPic,
    #[error("a ShortTerm picture was expected to be marked for MMCO=3")]
    ExpectedMarked,
    #[error("picture cannot be marked as nonexisting for MMCO=3")]
    ExpectedExisting,
    #[error("unknown MMCO={0}")]
    Unknown(u8),
}

impl Dpb {
    /// Returns an iterator over the H264 pictures stored in the DPB.
    fn pictures(&self) -> impl Iterator<Item = &PictureData> {
        self.entries.iter().map(|e| &e.pic)
    }

    fn pictures_mut(&mut self) -> impl Iterator<Item = &mut PictureData> {
        self.entries.iter_mut().map(|e| &mut e.pic)
    }

    /// Returns a fresh identifier for a picture about to be decoded.
    pub fn allocate_id(&mut self) -> PictureId {
        let id = PictureId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Returns the length of the DPB.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the whole DPB entries.
    pub fn entries(&self) -> &[DpbEntry] {
        &self.entries
    }

    pub fn get(&self, id: PictureId) -> Option<&DpbEntry> {
        self.entries.iter().find(|e| e.pic.id == id)
    }

    fn get_mut(&mut self, id: PictureId) -> Option<&mut DpbEntry> {
        self.entries.iter_mut().find(|e| e.pic.id == id)
    }

    pub fn pic(&self, id: PictureId) -> Option<&PictureData> {
        self.get(id).map(|e| &e.pic)
    }

    /// Set the DPB's limits in terms of maximum number or pictures.
    pub fn set_limits(&mut self, max_num_pics: usize, max_num_reorder_frames: usize) {
        self.max_num_pics = max_num_pics;
        self.max_num_reorder_frames = max_num_reorder_frames;
    }

    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    // Returns the number of reference frames, counting the first field only if
    // dealing with interlaced content.
    pub fn num_ref_frames(&self) -> usize {
        self.pictures()
            .filter(|p| p.is_ref() && !p.is_second_field())
            .count()
    }

    pub fn interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn set_interlaced(&mut self, interlaced: bool) {
        self.interlaced = interlaced;
    }

    /// Sets the reference marking of `id`, and of its complementary field if
    /// `apply_to_other_field` is set.
    pub fn set_reference(&mut self, id: PictureId, reference: Reference, apply_to_other_field: bool) {
        let other_field = match self.get_mut(id) {
            Some(entry) => {
                entry.pic.set_reference(reference);
                entry.pic.other_field()
            }
            None => return,
        };

        if apply_to_other_field {
            if let Some(other) = other_field.and_then(|o| self.get_mut(o)) {
                other.pic.set_reference(reference);
            }
        }
    }

    /// Whether `pic` is the second field of a complementary reference field pair.
    pub fn is_second_field_of_complementary_ref_pair(&self, pic: &PictureData) -> bool {
        pic.is_ref()
            && pic.is_second_field()
            && pic
                .other_field()
                .and_then(|o| self.pic(o))
                .map(|o| o.is_ref())
                .unwrap_or(false)
    }

    /// Find the short term reference picture with the lowest `frame_num_wrap`
    /// value.
    pub fn find_short_term_lowest_frame_num_wrap(&self) -> Option<PictureId> {
        self.pictures()
            .filter(|p| matches!(p.reference(), Reference::ShortTerm))
            .min_by_key(|p| p.frame_num_wrap)
            .map(|p| p.id)
    }

    /// Mark all pictures in the DPB as unused for reference.
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for picture in self.pictures_mut() {
            picture.set_reference(Reference::None);
        }
    }

    /// Remove unused pictures from the DPB. A picture is not going to be used
    /// anymore if it's a) not a reference and b) not needed for output
    pub fn remove_unused(&mut self) {
        self.entries.retain(|entry| {
            let pic = &entry.pic;
            let discard = !pic.is_ref() && !pic.needed_for_output;

            if discard {
                log::debug!("Removing unused picture {:?} (POC {})", pic.id, pic.pic_order_cnt);
            }

            !discard
        });
    }

    /// Find a short term reference picture with the given `pic_num` value.
    pub fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<PictureId> {
        let found = self
            .pictures()
            .find(|p| matches!(p.reference(), Reference::ShortTerm) && p.pic_num == pic_num)
            .map(|p| p.id);

        log::debug!("find_short_term_with_pic_num: {}, found {:?}", pic_num, found);

        found
    }

    /// Find a long term reference picture with the given `long_term_pic_num`
    /// value.
    pub fn find_long_term_with_long_term_pic_num(&self, long_term_pic_num: u32) -> Option<PictureId> {
        let found = self
            .pictures()
            .find(|p| {
                matches!(p.reference(), Reference::LongTerm)
                    && p.long_term_pic_num == long_term_pic_num
            })
            .map(|p| p.id);

        log::debug!(
            "find_long_term_with_long_term_pic_num: {}, found {:?}",
            long_term_pic_num,
            found
        );

        found
    }

    /// The most recently stored reference picture that has samples.
    pub fn last_reference_frame(&self) -> Option<&DpbEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.pic.is_ref() && !e.pic.nonexisting && e.frame.is_some())
    }

    /// Store a picture and its samples in the DPB.
    fn store_picture(
        &mut self,
        mut pic: PictureData,
        frame: Option<Rc<DecodedFrame>>,
    ) -> Result<(), StorePictureError> {
        let max_pics = if self.interlaced {
            self.max_num_pics * 2
        } else {
            self.max_num_pics
        };

        if self.entries.len() >= max_pics {
            return Err(StorePictureError::DpbIsFull);
        }

        // C.4.2. Decoding of gaps in frame_num and storage of "non-existing"
        // pictures
        pic.needed_for_output = !pic.nonexisting;

        if pic.is_second_field() {
            let first_field = pic
                .other_field()
                .and_then(|id| self.get_mut(id))
                .ok_or(StorePictureError::NoFirstField)?;
            first_field.pic.set_second_field_to(&pic);
            pic.set_first_field_to(&first_field.pic);
        }

        debug!(
            "Stored picture {:?} POC {:?}, field {:?}, the DPB length is {:?}",
            pic.id,
            pic.pic_order_cnt,
            pic.field,
            self.entries.len()
        );

        self.entries.push(DpbEntry { pic, frame });

        Ok(())
    }

    /// Add `pic` and its samples to the DPB, storing first the cached first field `last_field`
    /// if `pic` completes it.
    pub fn add_picture(
        &mut self,
        pic: PictureData,
        frame: Option<Rc<DecodedFrame>>,
        last_field: &mut Option<DpbEntry>,
    ) -> Result<(), StorePictureError> {
        if self.interlaced {
            let completes_last_field = pic
                .other_field()
                .zip(last_field.as_ref().map(|f| f.pic.id))
                .map_or(false, |(other_field, last_field)| other_field == last_field);

            if completes_last_field {
                if let Some(last_field) = last_field.take() {
                    self.store_picture(last_field.pic, last_field.frame)?;
                }
            }
        }

        self.store_picture(pic, frame)
    }

    /// Whether the DPB has an empty slot for a new picture.
    pub fn has_empty_frame_buffer(&self) -> bool {
        if !self.interlaced {
            self.entries.len() < self.max_num_pics
        } else {
            let count = self
                .pictures()
                .filter(|pic| {
                    !pic.is_second_field()
                        && (matches!(pic.field, Field::Frame) || pic.other_field().is_some())
                })
                .count();

            count < self.max_num_pics
        }
    }

    /// Whether the DPB needs bumping, as described by clauses 1, 4, 5, 6 of
    /// C.4.5.3 "Bumping" process.
    pub fn needs_bumping(&self, to_insert: &PictureData) -> bool {
        // Clauses 2 (IDR) and 3 (MMCO 5) are handled by the caller. The others only apply to a
        // full DPB: a non-existing frame or a non-IDR reference needs room, and a non-reference
        // picture waits for the pictures that precede it in output order.
        if self.has_empty_frame_buffer() {
            return false;
        }

        if to_insert.nonexisting {
            return true;
        }

        let non_idr_ref = to_insert.is_ref() && matches!(to_insert.is_idr, IsIdr::No);
        if non_idr_ref {
            return true;
        }

        let lowest_poc = match self.find_lowest_poc_for_bumping() {
            Some(entry) => entry.pic.pic_order_cnt,
            None => return false,
        };

        !self.is_second_field_of_complementary_ref_pair(to_insert)
            && to_insert.pic_order_cnt > lowest_poc
    }

    /// Find the lowest POC in the DPB that can be bumped.
    fn find_lowest_poc_for_bumping(&self) -> Option<&DpbEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                let pic = &entry.pic;

                if !pic.needed_for_output {
                    return false;
                }

                match pic.field {
                    // Progressive frames in the DPB are fully decoded.
                    Field::Frame => true,
                    // Only return the first field of fully decoded interlaced frames.
                    Field::Top | Field::Bottom => {
                        !pic.is_second_field() && pic.other_field().is_some()
                    }
                }
            })
            .min_by_key(|entry| entry.pic.pic_order_cnt)
    }

    /// Builds the displayable picture for `id`, weaving it with its complementary field if it has
    /// one.
    pub fn output_picture(&self, id: PictureId) -> Option<DecodedPicture> {
        let entry = self.get(id)?;
        let other = if entry.pic.coded_frame {
            None
        } else {
            entry.pic.other_field().and_then(|o| self.get(o))
        };

        entry.output(other)
    }

    /// Bump the dpb, returning a picture as per the bumping process described in C.4.5.3.
    /// Note that this picture will still be referenced by its pair, if any.
    fn bump(&mut self) -> Option<Option<DecodedPicture>> {
        let id = self.find_lowest_poc_for_bumping()?.pic.id;
        let output = self.output_picture(id);

        let other_field = self.get_mut(id).and_then(|entry| {
            debug!("Bumping picture {:?} (POC {}) from the dpb", id, entry.pic.pic_order_cnt);
            entry.pic.needed_for_output = false;
            entry.pic.other_field()
        });

        if let Some(other) = other_field.and_then(|o| self.get_mut(o)) {
            other.pic.needed_for_output = false;
        }

        Some(output)
    }

    /// Outputs every picture still waiting for output, in output order, then empties the DPB.
    pub fn flush(&mut self) -> Vec<DecodedPicture> {
        debug!("Flushing the DPB.");

        let mut pics = vec![];

        while let Some(pic) = self.bump() {
            pics.extend(pic);
        }

        self.clear();

        pics
    }

    /// Clears the DPB, dropping all the pictures.
    pub fn clear(&mut self) {
        debug!("Clearing the DPB");

        self.entries.clear();
    }

    /// Returns an iterator of short term refs.
    pub fn short_term_refs_iter(&self) -> impl Iterator<Item = &DpbEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.pic.reference(), Reference::ShortTerm))
    }

    /// Returns an iterator of long term refs.
    pub fn long_term_refs_iter(&self) -> impl Iterator<Item = &DpbEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.pic.reference(), Reference::LongTerm))
    }

    /// Computes `FrameNumWrap`, `PicNum` and `LongTermPicNum` of every reference picture with
    /// respect to `current_pic` (8.2.4.1).
    pub fn update_pic_nums(&mut self, frame_num: i32, max_frame_num: i32, current_pic: &PictureData) {
        for pic in self.pictures_mut() {
            if !pic.is_ref() {
                continue;
            }

            if *pic.reference() == Reference::LongTerm {
                pic.long_term_pic_num = if current_pic.field == Field::Frame {
                    pic.long_term_frame_idx
                } else if current_pic.field == pic.field {
                    2 * pic.long_term_frame_idx + 1
                } else {
                    2 * pic.long_term_frame_idx
                };
            } else {
                pic.frame_num_wrap = if pic.frame_num > frame_num {
                    pic.frame_num - max_frame_num
                } else {
                    pic.frame_num
                };

                pic.pic_num = if current_pic.field == Field::Frame {
                    pic.frame_num_wrap
                } else if pic.field == current_pic.field {
                    2 * pic.frame_num_wrap + 1
                } else {
                    2 * pic.frame_num_wrap
                };
            }
        }
    }

    /// Bumps the DPB if needed. DPB bumping is described on C.4.5.3.
    pub fn bump_as_needed(&mut self, current_pic: &PictureData) -> Vec<DecodedPicture> {
        let mut pics = vec![];
        while self.needs_bumping(current_pic) && self.len() >= self.max_num_reorder_frames {
            match self.bump() {
                Some(pic) => pics.extend(pic),
                None => return pics,
            }
            self.remove_unused();
        }

        pics
    }

    // 8.2.5.3
    pub fn sliding_window_marking(&mut self, pic: &mut PictureData, sps: &Sps) -> anyhow::Result<()> {
        // A second field inherits the short-term marking of its first field.
        let first_field_is_short_term = pic
            .other_field()
            .and_then(|o| self.pic(o))
            .map(|o| matches!(o.reference(), Reference::ShortTerm))
            .unwrap_or(false);

        if pic.is_second_field() && first_field_is_short_term {
            pic.set_reference(Reference::ShortTerm);
            return Ok(());
        }

        let mut num_ref_pics = self.num_ref_frames();
        let max_num_ref_frames = usize::from(std::cmp::max(1, sps.max_num_ref_frames));

        if num_ref_pics < max_num_ref_frames {
            return Ok(());
        }

        while num_ref_pics >= max_num_ref_frames {
            let to_unmark = self
                .find_short_term_lowest_frame_num_wrap()
                .context("Could not find a ShortTerm picture to unmark in the DPB")?;

            self.set_reference(to_unmark, Reference::None, true);
            num_ref_pics -= 1;
        }

        self.remove_unused();

        Ok(())
    }

    pub fn mmco_op_1(&mut self, pic: &PictureData, marking: &RefPicMarkingInner) -> Result<(), MmcoError> {
        let pic_num_x = pic.pic_num - (marking.difference_of_pic_nums_minus1 as i32 + 1);

        log::debug!("MMCO op 1 for pic_num_x {}", pic_num_x);
        log::trace!("Dpb state before MMCO=1: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic)?;

        self.set_reference(to_mark, Reference::None, matches!(pic.field, Field::Frame));

        Ok(())
    }

    pub fn mmco_op_2(&mut self, pic: &PictureData, marking: &RefPicMarkingInner) -> Result<(), MmcoError> {
        log::debug!("MMCO op 2 for long_term_pic_num {}", marking.long_term_pic_num);
        log::trace!("Dpb state before MMCO=2: {:#?}", self);

        let to_mark = self
            .find_long_term_with_long_term_pic_num(marking.long_term_pic_num)
            .ok_or(MmcoError::NoLongTermPic)?;

        self.set_reference(to_mark, Reference::None, matches!(pic.field, Field::Frame));

        Ok(())
    }

    pub fn mmco_op_3(&mut self, pic: &PictureData, marking: &RefPicMarkingInner) -> Result<(), MmcoError> {
        let pic_num_x = pic.pic_num - (marking.difference_of_pic_nums_minus1 as i32 + 1);

        log::debug!("MMCO op 3 for pic_num_x {}", pic_num_x);
        log::trace!("Dpb state before MMCO=3: {:#?}", self);

        let to_mark_as_long = self
            .find_short_term_with_pic_num(pic_num_x)
            .and_then(|id| self.pic(id))
            .ok_or(MmcoError::NoShortTermPic)?;

        if !matches!(to_mark_as_long.reference(), Reference::ShortTerm) {
            return Err(MmcoError::ExpectedMarked);
        }

        if to_mark_as_long.nonexisting {
            return Err(MmcoError::ExpectedExisting);
        }

        let to_mark_as_long_id = to_mark_as_long.id;
        let to_mark_as_long_other_field = to_mark_as_long.other_field();
        let long_term_frame_idx = marking.long_term_frame_idx;

        let holder = self
            .pictures()
            .find(|p| {
                matches!(p.reference(), Reference::LongTerm)
                    && p.long_term_frame_idx == long_term_frame_idx
            })
            .map(|p| (p.id, p.field, p.other_field()));

        if let Some((holder_id, holder_field, holder_other_field)) = holder {
            let is_frame = matches!(holder_field, Field::Frame);

            let is_complementary_field_pair = holder_other_field
                .and_then(|o| self.pic(o))
                .map(|o| {
                    matches!(o.reference(), Reference::LongTerm)
                        && o.long_term_frame_idx == long_term_frame_idx
                })
                .unwrap_or(false);

            // The previous holder of long_term_frame_idx loses it, unless it is the other field
            // of picNumX.
            if is_frame || is_complementary_field_pair {
                self.set_reference(holder_id, Reference::None, true);
            } else {
                let not_part_of_pic_x = holder_other_field != Some(to_mark_as_long_id)
                    && to_mark_as_long_other_field != Some(holder_id);

                if not_part_of_pic_x {
                    self.set_reference(holder_id, Reference::None, false);
                }
            }
        }

        let is_frame = matches!(pic.field, Field::Frame);
        self.set_reference(to_mark_as_long_id, Reference::LongTerm, is_frame);

        let other_field = self.get_mut(to_mark_as_long_id).and_then(|entry| {
            entry.pic.long_term_frame_idx = long_term_frame_idx;
            entry.pic.other_field()
        });

        if let Some(other_field) = other_field.and_then(|o| self.get_mut(o)) {
            if matches!(other_field.pic.reference(), Reference::LongTerm) {
                other_field.pic.long_term_frame_idx = long_term_frame_idx;

                log::debug!(
                    "Assigned long_term_frame_idx {} to other_field {:?}",
                    long_term_frame_idx,
                    other_field.pic.id
                );
            }
        }

        Ok(())
    }

    /// Returns the new `max_long_term_frame_idx`.
    pub fn mmco_op_4(&mut self, marking: &RefPicMarkingInner) -> MaxLongTermFrameIdx {
        let max_long_term_frame_idx =
            MaxLongTermFrameIdx::from_value_plus1(marking.max_long_term_frame_idx_plus1);

        log::debug!("MMCO op 4, max_long_term_frame_idx: {:?}", max_long_term_frame_idx);
        log::trace!("Dpb state before MMCO=4: {:#?}", self);

        for dpb_pic in self
            .pictures_mut()
            .filter(|pic| matches!(pic.reference(), Reference::LongTerm))
            .filter(|pic| max_long_term_frame_idx < pic.long_term_frame_idx)
        {
            dpb_pic.set_reference(Reference::None);
        }

        max_long_term_frame_idx
    }

    /// Returns the new `max_long_term_frame_idx`.
    pub fn mmco_op_5(&mut self, pic: &mut PictureData) -> MaxLongTermFrameIdx {
        log::debug!("MMCO op 5, marking all pictures in the DPB as unused for reference");
        log::trace!("Dpb state before MMCO=5: {:#?}", self);

        self.mark_all_as_unused_for_ref();

        pic.has_mmco_5 = true;

        // After the decoding of the current picture and the processing of the
        // memory management control operations, the picture shall be inferred
        // to have had frame_num equal to 0.
        pic.frame_num = 0;

        // tempPicOrderCnt is set equal to PicOrderCnt(CurrPic), and the field
        // order counts of the current picture are made relative to it.
        match pic.field {
            Field::Top => {
                pic.top_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Frame => {
                pic.top_field_order_cnt -= pic.pic_order_cnt;
                pic.bottom_field_order_cnt -= pic.pic_order_cnt;
                pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
            }
        }

        MaxLongTermFrameIdx::NoLongTermFrameIndices
    }

    pub fn mmco_op_6(&mut self, pic: &mut PictureData, marking: &RefPicMarkingInner) {
        let long_term_frame_idx = marking.long_term_frame_idx;

        log::debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);
        log::trace!("Dpb state before MMCO=6: {:#?}", self);

        let holder = self
            .pictures()
            .find(|p| {
                matches!(p.reference(), Reference::LongTerm)
                    && p.long_term_frame_idx == long_term_frame_idx
            })
            .map(|p| (p.id, p.field, p.other_field()));

        // A frame or complementary field pair already holding the index loses it
        // along with both of its fields. A lone field holding it loses it too.
        if let Some((holder_id, holder_field, holder_other_field)) = holder {
            let is_frame = matches!(holder_field, Field::Frame);

            let is_complementary_ref_field_pair = holder_other_field
                .and_then(|o| self.pic(o))
                .map(|o| {
                    matches!(o.reference(), Reference::LongTerm)
                        && o.long_term_frame_idx == long_term_frame_idx
                })
                .unwrap_or(false);

            self.set_reference(
                holder_id,
                Reference::None,
                is_frame || is_complementary_ref_field_pair,
            );
        }

        let first_field = pic.other_field().filter(|_| pic.is_second_field());
        let is_second_ref_field = first_field
            .and_then(|o| self.pic(o))
            .map(|o| matches!(o.reference(), Reference::LongTerm))
            .unwrap_or(false);

        pic.set_reference(Reference::LongTerm);
        pic.long_term_frame_idx = long_term_frame_idx;

        if is_second_ref_field {
            if let Some(first_field) = first_field.and_then(|o| self.get_mut(o)) {
                first_field.pic.set_reference(Reference::LongTerm);
                first_field.pic.long_term_frame_idx = long_term_frame_idx;
            }
        }
    }

    /// Runs the adaptive memory control operations of `pic` (8.2.5.4) and returns the resulting
    /// `MaxLongTermFrameIdx`.
    pub fn handle_memory_management_ops(
        &mut self,
        pic: &mut PictureData,
        mut max_long_term_frame_idx: MaxLongTermFrameIdx,
    ) -> Result<MaxLongTermFrameIdx, MmcoError> {
        let markings = pic.ref_pic_marking.clone();

        for marking in &markings.inner {
            match marking.memory_management_control_operation {
                0 => break,
                1 => self.mmco_op_1(pic, marking)?,
                2 => self.mmco_op_2(pic, marking)?,
                3 => self.mmco_op_3(pic, marking)?,
                4 => max_long_term_frame_idx = self.mmco_op_4(marking),
                5 => max_long_term_frame_idx = self.mmco_op_5(pic),
                6 => self.mmco_op_6(pic, marking),
                other => return Err(MmcoError::Unknown(other)),
            }
        }

        Ok(max_long_term_frame_idx)
    }

    fn debug_ref_list(ref_pic_list: &[&DpbEntry], ref_pic_list_name: &str) {
        debug!(
            "{}: (ShortTerm|LongTerm, (POC|PicNum|LongTermPicNum), field) {:?}",
            ref_pic_list_name,
            ref_pic_list
                .iter()
                .map(|e| {
                    let p = &e.pic;
                    match p.reference() {
                        Reference::LongTerm => ("LongTerm", p.long_term_pic_num as i32, p.field),
                        _ => ("ShortTerm", p.pic_order_cnt, p.field),
                    }
                })
                .collect::<Vec<_>>()
        );
    }

    fn sort_pic_num_descending(pics: &mut [&DpbEntry]) {
        pics.sort_by_key(|e| std::cmp::Reverse(e.pic.pic_num));
    }

    fn sort_frame_num_wrap_descending(pics: &mut [&DpbEntry]) {
        pics.sort_by_key(|e| std::cmp::Reverse(e.pic.frame_num_wrap));
    }

    fn sort_long_term_pic_num_ascending(pics: &mut [&DpbEntry]) {
        pics.sort_by_key(|e| e.pic.long_term_pic_num);
    }

    fn sort_long_term_frame_idx_ascending(pics: &mut [&DpbEntry]) {
        pics.sort_by_key(|e| e.pic.long_term_frame_idx);
    }

    fn sort_poc_descending(pics: &mut [&DpbEntry]) {
        pics.sort_by_key(|e| std::cmp::Reverse(e.pic.pic_order_cnt));
    }

    fn sort_poc_ascending(pics: &mut [&DpbEntry]) {
        pics.sort_by_key(|e| e.pic.pic_order_cnt);
    }

    // RefPicList1 must differ from RefPicList0 when it has more than one entry.
    fn swap_b1_if_needed(b0: &DpbPicRefList, b1: &mut DpbPicRefList) {
        if b1.len() > 1
            && b0.len() == b1.len()
            && b0.iter().zip(b1.iter()).all(|(x0, x1)| x0.pic.id == x1.pic.id)
        {
            b1.swap(0, 1);
        }
    }

    /// Copies from refFrameList(XShort|Long)Term into RefPicListX as per 8.2.4.2.5. Used when
    /// building the reference list for fields in interlaced decoding.
    fn init_ref_field_pic_list<'a>(
        mut field: Field,
        reference_type: Reference,
        ref_frame_list: &mut DpbPicRefList<'a>,
        ref_pic_list: &mut DpbPicRefList<'a>,
    ) {
        // Missing or unmarked fields are skipped, the next field of the wanted parity is used.
        ref_frame_list.retain(|e| !e.pic.nonexisting && *e.pic.reference() == reference_type);

        while let Some(position) = ref_frame_list.iter().position(|e| {
            let found = e.pic.field == field;

            if found {
                field = field.opposite();
            }

            found
        }) {
            let pic = ref_frame_list.remove(position);
            ref_pic_list.push(pic);
        }

        ref_pic_list.append(ref_frame_list);
    }

    /// 8.2.4.2.1 Initialization process for the reference picture list for P
    /// and SP slices in frames
    fn build_ref_pic_list_p(&self) -> DpbPicRefList {
        let mut ref_pic_list_p0: Vec<_> = self
            .short_term_refs_iter()
            .filter(|e| !e.pic.is_second_field())
            .collect();

        Self::sort_pic_num_descending(&mut ref_pic_list_p0);

        let num_short_term_refs = ref_pic_list_p0.len();

        ref_pic_list_p0.extend(self.long_term_refs_iter().filter(|e| !e.pic.is_second_field()));
        Self::sort_long_term_pic_num_ascending(&mut ref_pic_list_p0[num_short_term_refs..]);

        Self::debug_ref_list(&ref_pic_list_p0, "ref_pic_list_p0");

        ref_pic_list_p0
    }

    /// 8.2.4.2.2 Initialization process for the reference picture list for P
    /// and SP slices in fields
    fn build_ref_field_pic_list_p(&self, cur_pic: &PictureData) -> DpbPicRefList {
        let mut ref_pic_list_p0 = vec![];

        let mut ref_frame_list_0_short_term: Vec<_> = self.short_term_refs_iter().collect();
        Self::sort_frame_num_wrap_descending(&mut ref_frame_list_0_short_term);

        let mut ref_frame_list_long_term: Vec<_> = self.long_term_refs_iter().collect();
        Self::sort_long_term_frame_idx_ascending(&mut ref_frame_list_long_term);

        // 8.2.4.2.5
        Self::init_ref_field_pic_list(
            cur_pic.field,
            Reference::ShortTerm,
            &mut ref_frame_list_0_short_term,
            &mut ref_pic_list_p0,
        );
        Self::init_ref_field_pic_list(
            cur_pic.field,
            Reference::LongTerm,
            &mut ref_frame_list_long_term,
            &mut ref_pic_list_p0,
        );

        Self::debug_ref_list(&ref_pic_list_p0, "ref_field_pic_list_p0");

        ref_pic_list_p0
    }

    // 8.2.4.2.3 Initialization process for reference picture lists for B slices
    // in frames
    fn build_ref_pic_list_b(&self, cur_pic: &PictureData) -> (DpbPicRefList, DpbPicRefList) {
        let mut short_term_refs: Vec<_> = self
            .short_term_refs_iter()
            .filter(|e| !e.pic.is_second_field())
            .collect();

        // Non-existing frames have no POC with pic_order_cnt_type 0.
        if cur_pic.pic_order_cnt_type == 0 {
            short_term_refs.retain(|e| !e.pic.nonexisting);
        }

        let mut ref_pic_list_b0 = vec![];
        let mut ref_pic_list_b1 = vec![];
        let mut remaining = vec![];
        // b0 contains three inner lists of pictures, i.e. [[0] [1] [2]]
        // [0]: short term pictures with POC < current, sorted by descending POC.
        // [1]: short term pictures with POC > current, sorted by ascending POC.
        // [2]: long term pictures sorted by ascending long_term_pic_num
        for &entry in &short_term_refs {
            if entry.pic.pic_order_cnt < cur_pic.pic_order_cnt {
                ref_pic_list_b0.push(entry);
            } else {
                remaining.push(entry);
            }
        }

        Self::sort_poc_descending(&mut ref_pic_list_b0);
        Self::sort_poc_ascending(&mut remaining);
        ref_pic_list_b0.append(&mut remaining);

        let mut long_term_refs: Vec<_> = self
            .long_term_refs_iter()
            .filter(|e| !e.pic.nonexisting)
            .filter(|e| !e.pic.is_second_field())
            .collect();
        Self::sort_long_term_pic_num_ascending(&mut long_term_refs);

        ref_pic_list_b0.extend(long_term_refs.clone());

        // b1 contains three inner lists of pictures, i.e. [[0] [1] [2]]
        // [0]: short term pictures with POC > current, sorted by ascending POC.
        // [1]: short term pictures with POC < current, sorted by descending POC.
        // [2]: long term pictures sorted by ascending long_term_pic_num
        for &entry in &short_term_refs {
            if entry.pic.pic_order_cnt > cur_pic.pic_order_cnt {
                ref_pic_list_b1.push(entry);
            } else {
                remaining.push(entry);
            }
        }

        Self::sort_poc_ascending(&mut ref_pic_list_b1);
        Self::sort_poc_descending(&mut remaining);

        ref_pic_list_b1.extend(remaining);
        ref_pic_list_b1.extend(long_term_refs);

        Self::swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

        Self::debug_ref_list(&ref_pic_list_b0, "ref_pic_list_b0");
        Self::debug_ref_list(&ref_pic_list_b1, "ref_pic_list_b1");

        (ref_pic_list_b0, ref_pic_list_b1)
    }

    /// 8.2.4.2.4 Initialization process for reference picture lists for B
    /// slices in fields
    fn build_ref_field_pic_list_b(&self, cur_pic: &PictureData) -> (DpbPicRefList, DpbPicRefList) {
        let mut ref_pic_list_b0 = vec![];
        let mut ref_pic_list_b1 = vec![];
        let mut ref_frame_list_0_short_term = vec![];
        let mut ref_frame_list_1_short_term = vec![];

        let mut remaining = vec![];

        let mut short_term_refs: Vec<_> = self.short_term_refs_iter().collect();

        if cur_pic.pic_order_cnt_type == 0 {
            short_term_refs.retain(|e| !e.pic.nonexisting);
        }

        // refFrameList0ShortTerm is comprised of two inner lists, [[0] [1]]
        // [0]: short term pictures with POC <= current, sorted by descending POC
        // [1]: short term pictures with POC > current, sorted by ascending POC
        for &entry in &short_term_refs {
            if entry.pic.pic_order_cnt <= cur_pic.pic_order_cnt {
                ref_frame_list_0_short_term.push(entry);
            } else {
                remaining.push(entry);
            }
        }

        Self::sort_poc_descending(&mut ref_frame_list_0_short_term);
        Self::sort_poc_ascending(&mut remaining);
        ref_frame_list_0_short_term.append(&mut remaining);

        // refFrameList1ShortTerm is comprised of two inner lists, [[0] [1]]
        // [0]: short term pictures with POC > current, sorted by ascending POC
        // [1]: short term pictures with POC <= current, sorted by descending POC
        for &entry in &short_term_refs {
            if entry.pic.pic_order_cnt > cur_pic.pic_order_cnt {
                ref_frame_list_1_short_term.push(entry);
            } else {
                remaining.push(entry);
            }
        }

        Self::sort_poc_ascending(&mut ref_frame_list_1_short_term);
        Self::sort_poc_descending(&mut remaining);
        ref_frame_list_1_short_term.append(&mut remaining);

        // refFrameListLongTerm: long term pictures sorted by ascending
        // LongTermFrameIdx.
        let mut ref_frame_list_long_term: Vec<_> = self
            .long_term_refs_iter()
            .filter(|e| !e.pic.nonexisting)
            .collect();

        Self::sort_long_term_frame_idx_ascending(&mut ref_frame_list_long_term);
        let mut ref_frame_list_long_term_1 = ref_frame_list_long_term.clone();

        // 8.2.4.2.5
        let field = cur_pic.field;
        Self::init_ref_field_pic_list(
            field,
            Reference::ShortTerm,
            &mut ref_frame_list_0_short_term,
            &mut ref_pic_list_b0,
        );
        Self::init_ref_field_pic_list(
            field,
            Reference::LongTerm,
            &mut ref_frame_list_long_term,
            &mut ref_pic_list_b0,
        );

        Self::init_ref_field_pic_list(
            field,
            Reference::ShortTerm,
            &mut ref_frame_list_1_short_term,
            &mut ref_pic_list_b1,
        );
        Self::init_ref_field_pic_list(
            field,
            Reference::LongTerm,
            &mut ref_frame_list_long_term_1,
            &mut ref_pic_list_b1,
        );

        Self::swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

        Self::debug_ref_list(&ref_pic_list_b0, "ref_field_pic_list_b0");
        Self::debug_ref_list(&ref_pic_list_b1, "ref_field_pic_list_b1");

        (ref_pic_list_b0, ref_pic_list_b1)
    }

    /// Returns the initial lists of reference pictures for `pic`.
    pub fn build_ref_pic_lists(&self, pic: &PictureData) -> ReferencePicLists {
        let num_refs = self
            .pictures()
            .filter(|p| p.is_ref() && !p.nonexisting)
            .count();

        // Nothing to build from: the lists stay empty and the slice decides whether that is
        // an error.
        if num_refs == 0 {
            return Default::default();
        }

        let (ref_pic_list_p0, (ref_pic_list_b0, ref_pic_list_b1)) =
            if matches!(pic.field, Field::Frame) {
                (self.build_ref_pic_list_p(), self.build_ref_pic_list_b(pic))
            } else {
                (
                    self.build_ref_field_pic_list_p(pic),
                    self.build_ref_field_pic_list_b(pic),
                )
            };

        let to_ids = |refs: DpbPicRefList| refs.into_iter().map(|e| e.pic.id).collect();

        ReferencePicLists {
            ref_pic_list_p0: to_ids(ref_pic_list_p0),
            ref_pic_list_b0: to_ids(ref_pic_list_b0),
            ref_pic_list_b1: to_ids(ref_pic_list_b1),
        }
    }

    /// Returns the top and bottom fields making up the reference frame `id`.
    pub fn fields_of(&self, id: PictureId) -> (Option<PictureId>, Option<PictureId>) {
        let pic = match self.pic(id) {
            Some(pic) => pic,
            None => return (None, None),
        };

        match pic.field {
            Field::Frame => (Some(id), Some(id)),
            Field::Top => (Some(id), pic.other_field()),
            Field::Bottom => (pic.other_field(), Some(id)),
        }
    }
}

impl Default for Dpb {
    fn default() -> Self {
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
            max_num_reorder_frames: Default::default(),
            interlaced: Default::default(),
            next_id: 0,
        }
    }
}

impl std::fmt::Debug for Dpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|e| (e.pic.id, e.pic.pic_order_cnt, e.pic.field, *e.pic.reference()))
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .field("interlaced", &self.interlaced)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::syntax::SpsBuilder;

    fn frame(dpb: &mut Dpb, frame_num: i32, poc: i32, reference: Reference) -> PictureData {
        let mut pic = PictureData {
            id: dpb.allocate_id(),
            frame_num,
            pic_num: frame_num,
            frame_num_wrap: frame_num,
            pic_order_cnt: poc,
            top_field_order_cnt: poc,
            bottom_field_order_cnt: poc,
            coded_frame: true,
            nal_ref_idc: 1,
            ..Default::default()
        };
        pic.set_reference(reference);
        pic
    }

    fn store(dpb: &mut Dpb, pic: PictureData) -> PictureId {
        let id = pic.id;
        dpb.add_picture(pic, Some(Rc::new(DecodedFrame::default())), &mut None)
            .unwrap();
        id
    }

    #[test]
    fn p_list_orders_by_descending_pic_num() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let a = frame(&mut dpb, 0, 0, Reference::ShortTerm);
        let a = store(&mut dpb, a);
        let b = frame(&mut dpb, 2, 4, Reference::ShortTerm);
        let b = store(&mut dpb, b);
        let c = frame(&mut dpb, 1, 2, Reference::ShortTerm);
        let c = store(&mut dpb, c);

        let cur = frame(&mut dpb, 3, 6, Reference::ShortTerm);
        let lists = dpb.build_ref_pic_lists(&cur);
        assert_eq!(lists.ref_pic_list_p0, vec![b, c, a]);
    }

    #[test]
    fn b_lists_split_around_current_poc() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let past = frame(&mut dpb, 0, 0, Reference::ShortTerm);
        let past = store(&mut dpb, past);
        let future = frame(&mut dpb, 1, 8, Reference::ShortTerm);
        let future = store(&mut dpb, future);

        let cur = frame(&mut dpb, 2, 4, Reference::None);
        let lists = dpb.build_ref_pic_lists(&cur);
        assert_eq!(lists.ref_pic_list_b0, vec![past, future]);
        assert_eq!(lists.ref_pic_list_b1, vec![future, past]);
    }

    #[test]
    fn b1_swapped_when_equal_to_b0() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let a = frame(&mut dpb, 0, 0, Reference::ShortTerm);
        let a = store(&mut dpb, a);
        let b = frame(&mut dpb, 1, 2, Reference::ShortTerm);
        let b = store(&mut dpb, b);

        // Both references precede the current picture, so the initial lists are identical.
        let cur = frame(&mut dpb, 2, 10, Reference::None);
        let lists = dpb.build_ref_pic_lists(&cur);
        assert_eq!(lists.ref_pic_list_b0, vec![b, a]);
        assert_eq!(lists.ref_pic_list_b1, vec![a, b]);
    }

    #[test]
    fn sliding_window_unmarks_oldest() {
        let sps = SpsBuilder::new().max_num_ref_frames(2).build();
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let a = frame(&mut dpb, 0, 0, Reference::ShortTerm);
        let a = store(&mut dpb, a);
        let b = frame(&mut dpb, 1, 2, Reference::ShortTerm);
        let b = store(&mut dpb, b);

        let mut cur = frame(&mut dpb, 2, 4, Reference::ShortTerm);
        dpb.sliding_window_marking(&mut cur, &sps).unwrap();

        assert!(!dpb.pic(a).unwrap().is_ref());
        assert!(dpb.pic(b).unwrap().is_ref());
        assert_eq!(dpb.num_ref_frames(), 1);
    }

    #[test]
    fn mmco_unmarks_and_promotes() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let a = frame(&mut dpb, 0, 0, Reference::ShortTerm);
        let a = store(&mut dpb, a);
        let b = frame(&mut dpb, 1, 2, Reference::ShortTerm);
        let b = store(&mut dpb, b);

        let mut cur = frame(&mut dpb, 2, 4, Reference::ShortTerm);
        cur.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        cur.ref_pic_marking.inner = vec![
            // picNumX = 2 - 2 = 0
            RefPicMarkingInner {
                memory_management_control_operation: 1,
                difference_of_pic_nums_minus1: 1,
                ..Default::default()
            },
            // picNumX = 2 - 1 = 1
            RefPicMarkingInner {
                memory_management_control_operation: 3,
                difference_of_pic_nums_minus1: 0,
                long_term_frame_idx: 0,
                ..Default::default()
            },
        ];

        let max_idx = dpb
            .handle_memory_management_ops(&mut cur, MaxLongTermFrameIdx::Idx(1))
            .unwrap();

        assert_eq!(max_idx, MaxLongTermFrameIdx::Idx(1));
        assert!(!dpb.pic(a).unwrap().is_ref());
        assert_eq!(*dpb.pic(b).unwrap().reference(), Reference::LongTerm);
    }

    fn long_term(dpb: &mut Dpb, frame_num: i32, long_term_frame_idx: u32) -> PictureId {
        let mut pic = frame(dpb, frame_num, frame_num * 2, Reference::LongTerm);
        pic.long_term_frame_idx = long_term_frame_idx;
        pic.long_term_pic_num = long_term_frame_idx;
        store(dpb, pic)
    }

    fn mmco(cur: &mut PictureData, markings: Vec<RefPicMarkingInner>) {
        cur.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        cur.ref_pic_marking.inner = markings;
    }

    #[test]
    fn mmco_2_unmarks_long_term_picture() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let a = long_term(&mut dpb, 0, 0);
        let b = long_term(&mut dpb, 1, 1);

        let mut cur = frame(&mut dpb, 2, 4, Reference::ShortTerm);
        mmco(
            &mut cur,
            vec![RefPicMarkingInner {
                memory_management_control_operation: 2,
                long_term_pic_num: 1,
                ..Default::default()
            }],
        );

        dpb.handle_memory_management_ops(&mut cur, MaxLongTermFrameIdx::Idx(1))
            .unwrap();

        assert_eq!(*dpb.pic(a).unwrap().reference(), Reference::LongTerm);
        assert!(!dpb.pic(b).unwrap().is_ref());

        // Nothing holds long_term_pic_num 1 anymore.
        assert!(matches!(
            dpb.handle_memory_management_ops(&mut cur, MaxLongTermFrameIdx::Idx(1)),
            Err(MmcoError::NoLongTermPic)
        ));
    }

    #[test]
    fn mmco_4_drops_indices_above_the_new_maximum() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let ids: Vec<_> = (0..3).map(|idx| long_term(&mut dpb, idx as i32, idx)).collect();

        let mut cur = frame(&mut dpb, 3, 6, Reference::ShortTerm);
        mmco(
            &mut cur,
            vec![RefPicMarkingInner {
                memory_management_control_operation: 4,
                max_long_term_frame_idx_plus1: 2,
                ..Default::default()
            }],
        );

        let max_idx = dpb
            .handle_memory_management_ops(&mut cur, MaxLongTermFrameIdx::Idx(2))
            .unwrap();

        assert_eq!(max_idx, MaxLongTermFrameIdx::Idx(1));
        assert!(dpb.pic(ids[0]).unwrap().is_ref());
        assert!(dpb.pic(ids[1]).unwrap().is_ref());
        assert!(!dpb.pic(ids[2]).unwrap().is_ref());

        // No long term indices at all.
        mmco(
            &mut cur,
            vec![RefPicMarkingInner {
                memory_management_control_operation: 4,
                max_long_term_frame_idx_plus1: 0,
                ..Default::default()
            }],
        );

        let max_idx = dpb.handle_memory_management_ops(&mut cur, max_idx).unwrap();

        assert_eq!(max_idx, MaxLongTermFrameIdx::NoLongTermFrameIndices);
        assert_eq!(dpb.long_term_refs_iter().count(), 0);
    }

    #[test]
    fn mmco_6_marks_current_picture_as_long_term() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let holder = long_term(&mut dpb, 0, 0);

        let mut cur = frame(&mut dpb, 1, 2, Reference::ShortTerm);
        mmco(
            &mut cur,
            vec![RefPicMarkingInner {
                memory_management_control_operation: 6,
                long_term_frame_idx: 0,
                ..Default::default()
            }],
        );

        dpb.handle_memory_management_ops(&mut cur, MaxLongTermFrameIdx::Idx(0))
            .unwrap();

        // The previous holder of index 0 loses it.
        assert!(!dpb.pic(holder).unwrap().is_ref());
        assert_eq!(*cur.reference(), Reference::LongTerm);
        assert_eq!(cur.long_term_frame_idx, 0);
    }

    #[test]
    fn mmco_5_resets_current_picture() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        let a = frame(&mut dpb, 0, 0, Reference::ShortTerm);
        let a = store(&mut dpb, a);

        let mut cur = frame(&mut dpb, 3, 6, Reference::ShortTerm);
        cur.top_field_order_cnt = 6;
        cur.bottom_field_order_cnt = 7;
        let max_idx = dpb.mmco_op_5(&mut cur);

        assert_eq!(max_idx, MaxLongTermFrameIdx::NoLongTermFrameIndices);
        assert!(!dpb.pic(a).unwrap().is_ref());
        assert!(cur.has_mmco_5);
        assert_eq!(cur.frame_num, 0);
        assert_eq!((cur.top_field_order_cnt, cur.bottom_field_order_cnt), (0, 1));
    }

    #[test]
    fn flush_outputs_in_poc_order() {
        let mut dpb = Dpb::default();
        dpb.set_limits(4, 0);

        for (frame_num, poc) in [(0, 0), (1, 8), (2, 4)] {
            let pic = frame(&mut dpb, frame_num, poc, Reference::ShortTerm);
            store(&mut dpb, pic);
        }

        let pocs: Vec<_> = dpb.flush().iter().map(|p| p.pic_order_cnt).collect();
        assert_eq!(pocs, vec![0, 4, 8]);
        assert!(dpb.is_empty());
    }

    #[test]
    fn bumping_when_full() {
        let mut dpb = Dpb::default();
        dpb.set_limits(2, 0);

        for (frame_num, poc) in [(0, 0), (1, 2)] {
            let pic = frame(&mut dpb, frame_num, poc, Reference::None);
            store(&mut dpb, pic);
        }

        // Bumping stops as soon as a frame buffer is freed.
        let cur = frame(&mut dpb, 2, 4, Reference::None);
        assert!(dpb.needs_bumping(&cur));

        let bumped = dpb.bump_as_needed(&cur);
        assert_eq!(bumped.len(), 1);
        assert_eq!(bumped[0].pic_order_cnt, 0);
    }

    #[test]
    fn second_field_pairs_with_first() {
        let mut dpb = Dpb::default();
        dpb.set_interlaced(true);
        dpb.set_limits(2, 0);

        let mut top = frame(&mut dpb, 0, 0, Reference::ShortTerm);
        top.field = Field::Top;
        top.coded_frame = false;
        let top_id = top.id;
        dpb.add_picture(top.clone(), None, &mut None).unwrap();

        let mut bottom = frame(&mut dpb, 0, 1, Reference::ShortTerm);
        bottom.field = Field::Bottom;
        bottom.coded_frame = false;
        bottom.set_first_field_to(&top);
        let bottom_id = bottom.id;
        dpb.add_picture(bottom, None, &mut None).unwrap();

        assert_eq!(dpb.pic(top_id).unwrap().other_field(), Some(bottom_id));
        assert_eq!(dpb.fields_of(top_id), (Some(top_id), Some(bottom_id)));
        assert_eq!(dpb.num_ref_frames(), 1);
    }
}
