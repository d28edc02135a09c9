// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture and slice orchestration for block-based H.264 decoders.
//!
//! This crate turns parsed slice headers and per-macroblock reconstruction results into a stream
//! of finished, reference-managed pictures. Entropy decoding, sample prediction, the deblocking
//! filter and the error concealment pixel algorithms are provided by a
//! [`ReconstructionBackend`](backend::ReconstructionBackend); everything around them (picture
//! boundaries, reference lists, loss tracking, picture lifecycle and finalization) lives here.

pub mod backend;
pub mod codec;
pub mod decoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns the number of 16x16 macroblocks needed to cover this resolution.
    pub fn mbs(&self) -> (u32, u32) {
        ((self.width + 15) / 16, (self.height + 15) / 16)
    }
}
