// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bookkeeping for macroblock-level error concealment.
//!
//! The decoder splits every finished picture into runs of correctly decoded and lost
//! macroblocks and records, for each 8x8 region, the coding mode and motion the concealment
//! algorithms can borrow from. The algorithms themselves are provided by the backend.

use log::trace;

/// State of one 8x8 luma block, or of the chroma block of a macroblock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockCondition {
    #[default]
    Empty,
    Corrupted,
    Ok,
}

/// A run of consecutive macroblocks that were either all decoded or all lost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub start_mb: usize,
    pub end_mb: usize,
    pub corrupted: bool,
}

/// Per-picture concealment state.
#[derive(Clone, Debug, Default)]
pub struct ErcState {
    width_in_mbs: usize,
    segments: Vec<Segment>,
    current_segment: usize,
    current_segment_corrupted: bool,
    num_corrupted_segments: usize,
    y_condition: Vec<BlockCondition>,
    u_condition: Vec<BlockCondition>,
    v_condition: Vec<BlockCondition>,
}

impl ErcState {
    /// Prepares the state for a picture of `pic_size_in_mbs` macroblocks.
    pub fn reset(&mut self, pic_size_in_mbs: usize, width_in_mbs: usize) {
        self.width_in_mbs = width_in_mbs;
        self.segments.clear();
        self.current_segment = 0;
        self.current_segment_corrupted = false;
        self.num_corrupted_segments = 0;

        self.y_condition.clear();
        self.y_condition.resize(pic_size_in_mbs * 4, BlockCondition::Empty);
        self.u_condition.clear();
        self.u_condition.resize(pic_size_in_mbs, BlockCondition::Empty);
        self.v_condition.clear();
        self.v_condition.resize(pic_size_in_mbs, BlockCondition::Empty);
    }

    /// Index of 8x8 luma block `block` (0..4, raster order) of macroblock `mb`.
    fn y_block(&self, mb: usize, block: usize) -> usize {
        let width_in_mbs = self.width_in_mbs.max(1);
        let row = (mb / width_in_mbs) * 2 + block / 2;
        let col = (mb % width_in_mbs) * 2 + block % 2;

        row * 2 * width_in_mbs + col
    }

    pub fn start_segment(&mut self, mb: usize) {
        self.current_segment_corrupted = false;

        if self.segments.len() <= self.current_segment {
            self.segments
                .resize(self.current_segment + 1, Default::default());
        }

        self.segments[self.current_segment] = Segment {
            start_mb: mb,
            end_mb: mb,
            corrupted: false,
        };
    }

    pub fn stop_segment(&mut self, mb: usize) {
        if let Some(segment) = self.segments.get_mut(self.current_segment) {
            segment.end_mb = mb;
        }

        self.current_segment += 1;
    }

    fn set_last_segment(&mut self, condition: BlockCondition) -> Option<Segment> {
        let segment = *self.segments.get(self.current_segment.checked_sub(1)?)?;

        for mb in segment.start_mb..=segment.end_mb {
            for block in 0..4 {
                let i = self.y_block(mb, block);
                if let Some(y) = self.y_condition.get_mut(i) {
                    *y = condition;
                }
            }

            if let Some(u) = self.u_condition.get_mut(mb) {
                *u = condition;
            }
            if let Some(v) = self.v_condition.get_mut(mb) {
                *v = condition;
            }
        }

        Some(segment)
    }

    /// Marks the segment that was just stopped as lost.
    pub fn mark_current_segment_lost(&mut self) {
        if !self.current_segment_corrupted {
            self.num_corrupted_segments += 1;
            self.current_segment_corrupted = true;
        }

        if let Some(segment) = self.set_last_segment(BlockCondition::Corrupted) {
            trace!("Segment {}..={} lost", segment.start_mb, segment.end_mb);
            self.segments[self.current_segment - 1].corrupted = true;
        }
    }

    /// Marks the segment that was just stopped as correctly decoded.
    pub fn mark_current_segment_ok(&mut self) {
        if self.set_last_segment(BlockCondition::Ok).is_some() {
            self.segments[self.current_segment - 1].corrupted = false;
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments[..self.current_segment.min(self.segments.len())]
    }

    pub fn num_corrupted_segments(&self) -> usize {
        self.num_corrupted_segments
    }

    pub fn y_condition(&self, mb: usize, block: usize) -> BlockCondition {
        self.y_condition
            .get(self.y_block(mb, block))
            .copied()
            .unwrap_or_default()
    }

    pub fn chroma_condition(&self, mb: usize) -> (BlockCondition, BlockCondition) {
        (
            self.u_condition.get(mb).copied().unwrap_or_default(),
            self.v_condition.get(mb).copied().unwrap_or_default(),
        )
    }
}

/// How an 8x8 region was coded, from the concealment point of view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegionMode {
    #[default]
    Intra,
    Intra8x8,
    InterCopy,
    InterPred,
    InterPred8x8,
}

/// Coding mode and representative motion of one 8x8 region of a macroblock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectRegion {
    pub mode: RegionMode,
    /// Horizontal and vertical motion, then the reference index.
    pub mv: [i32; 3],
}
