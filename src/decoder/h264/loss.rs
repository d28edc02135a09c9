// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tracking of reference pictures that were not decoded correctly, to choose between primary
//! and redundant coded slices.

use log::debug;

use crate::codec::h264::syntax::SliceHeader;

/// Number of past pictures whose correctness is remembered.
pub const LOSS_WINDOW: usize = 17;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LossState {
    /// Correctness of the most recent pictures, most recent first.
    ref_flag: [bool; LOSS_WINDOW],
    primary_correct: bool,
    redundant_correct: bool,
    /// frame_num of the last slice that completed.
    previous_frame_num: Option<u16>,
}

impl Default for LossState {
    fn default() -> Self {
        Self {
            ref_flag: [true; LOSS_WINDOW],
            primary_correct: true,
            redundant_correct: true,
            previous_frame_num: None,
        }
    }
}

impl LossState {
    pub fn ref_flags(&self) -> &[bool; LOSS_WINDOW] {
        &self.ref_flag
    }

    pub fn primary_correct(&self) -> bool {
        self.primary_correct
    }

    pub fn redundant_correct(&self) -> bool {
        self.redundant_correct
    }

    /// Updates the correctness of the slice being received from the correctness of its
    /// references. Runs before the slice is matched against the active picture.
    pub fn track_slice(&mut self, hdr: &SliceHeader) {
        if hdr.redundant_pic_cnt == 0 {
            self.primary_correct = true;
            self.redundant_correct = true;

            if !hdr.slice_type.is_i() {
                let num_refs = hdr.num_ref_idx_l0_active().min(LOSS_WINDOW);
                if self.ref_flag[..num_refs].iter().any(|correct| !correct) {
                    debug!("Primary slice refers to an incorrect picture");
                    self.primary_correct = false;
                }
            }
        } else if !hdr.slice_type.is_i() {
            let ref_idx = hdr.redundant_slice_ref_idx();
            if !self.ref_flag.get(ref_idx).copied().unwrap_or(true) {
                debug!("Redundant slice refers to an incorrect picture");
                self.redundant_correct = false;
            }
        }
    }

    /// Whether `hdr`, a redundant slice, is not needed because the primary slice of the same
    /// picture was correct.
    pub fn should_discard_redundant(&self, hdr: &SliceHeader) -> bool {
        hdr.redundant_pic_cnt != 0
            && self.previous_frame_num == Some(hdr.frame_num)
            && self.primary_correct
    }

    /// Whether `hdr`, a redundant slice, stands in for a primary slice that cannot be trusted.
    pub fn replaces_primary(&self, hdr: &SliceHeader) -> bool {
        hdr.redundant_pic_cnt != 0 && !self.primary_correct && self.redundant_correct
    }

    /// Records the correctness of a slice once it has been decoded.
    pub fn complete_slice(&mut self, hdr: &SliceHeader) {
        let redundant_of_same_picture =
            hdr.redundant_pic_cnt != 0 && self.previous_frame_num == Some(hdr.frame_num);

        if !redundant_of_same_picture {
            self.ref_flag.copy_within(0..LOSS_WINDOW - 1, 1);
        }

        self.ref_flag[0] = if hdr.redundant_pic_cnt == 0 {
            self.primary_correct
        } else {
            self.redundant_correct
        };

        self.previous_frame_num = Some(hdr.frame_num);
    }

    /// Records a picture that was lost entirely.
    pub fn push_lost_picture(&mut self) {
        self.ref_flag.copy_within(0..LOSS_WINDOW - 1, 1);
        self.ref_flag[0] = false;
    }
}
