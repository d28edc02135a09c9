// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The H.264 picture engine.
//!
//! [`H264Decoder`] consumes parsed NAL units, detects picture boundaries, derives the reference
//! lists of every slice, drives the backend macroblock by macroblock and hands finished pictures
//! to the DPB, which releases them in output order.

pub mod boundary;
mod finalize;
mod lifecycle;
pub mod loss;
pub mod ref_lists;
pub mod slice;
pub mod weights;

use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::anyhow;
use bytes::Bytes;
use log::debug;
use log::trace;
use log::warn;

use crate::backend::ColourPlane;
use crate::backend::ReconstructionBackend;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::dpb::ReferencePicLists;
use crate::codec::h264::erc::ErcState;
use crate::codec::h264::erc::ObjectRegion;
use crate::codec::h264::nalu::NalUnit;
use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::NaluPayload;
use crate::codec::h264::nalu::NaluSource;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu::PartitionNal;
use crate::codec::h264::nalu::SeiMessage;
use crate::codec::h264::nalu::SliceData;
use crate::codec::h264::nalu::SliceNal;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::Picture;
use crate::codec::h264::syntax::MaxLongTermFrameIdx;
use crate::codec::h264::syntax::ParameterSetTable;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::Sps;
use crate::decoder::h264::boundary::is_new_picture;
use crate::decoder::h264::boundary::OldSliceSnapshot;
use crate::decoder::h264::loss::LossState;
use crate::decoder::h264::ref_lists::build_slice_lists;
use crate::decoder::h264::ref_lists::RefPicIds;
use crate::decoder::h264::slice::decode_slice_data;
use crate::decoder::h264::slice::ColocatedBuffer;
use crate::decoder::h264::slice::ErcObjects;
use crate::decoder::h264::slice::PlaneState;
use crate::decoder::h264::slice::SliceJob;
use crate::decoder::h264::slice::SliceStrategy;
use crate::decoder::h264::weights::WeightTables;
use crate::decoder::DecodeError;
use crate::decoder::DecodeStatus;
use crate::decoder::DecodedPicture;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderStats;
use crate::decoder::Result;

/// Stream-wide variables from the previous reference picture, used by the POC type 0
/// computation.
#[derive(Copy, Clone, Debug)]
struct PrevReferencePicInfo {
    has_mmco_5: bool,
    top_field_order_cnt: i32,
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
    field: Field,
}

impl Default for PrevReferencePicInfo {
    fn default() -> Self {
        Self {
            has_mmco_5: Default::default(),
            top_field_order_cnt: Default::default(),
            pic_order_cnt_msb: Default::default(),
            pic_order_cnt_lsb: Default::default(),
            field: Field::Frame,
        }
    }
}

/// Stream-wide variables from the previous picture, used by the POC type 1 and 2 computations.
#[derive(Copy, Clone, Debug, Default)]
struct PrevPicInfo {
    frame_num: i32,
    frame_num_offset: i32,
    has_mmco_5: bool,
}

/// Running picture counters, reported in the per-picture summary.
#[derive(Clone, Debug, Default)]
struct PictureCounters {
    /// Reference or I/P pictures. Doubled while a field is being decoded.
    number: usize,
    /// Non-reference B pictures.
    b_frames: usize,
    /// Every finished frame or field pair.
    frames: usize,
    /// Label of the first field of the pair being decoded.
    first_field_label: Option<&'static str>,
}

/// Per-picture decoding context, reused from picture to picture.
#[derive(Default)]
struct DecoderContext {
    /// Macroblock state of the luma plane, or of the Y, U and V planes when they are coded
    /// separately.
    planes: Vec<PlaneState>,
    erc: ErcState,
    /// Four regions per macroblock.
    erc_objects: Vec<ObjectRegion>,
    /// Sum of the motion of every inter macroblock.
    erc_mv_per_mb: i64,
    current_slice_nr: usize,
    counters: PictureCounters,
}

/// Recovery point bookkeeping.
#[derive(Clone, Debug, Default)]
struct RecoveryState {
    /// A recovery point SEI message announced the next picture as a random access point.
    recovery_point: bool,
    /// Decoding has started, from an IDR picture or a recovery point.
    found: bool,
    recovery_frame_cnt: u32,
    /// The stream did not start with an IDR picture.
    non_conforming_stream: bool,
    /// frame_num of the picture at which the output is correct again.
    frame_num: Option<i32>,
    poc: Option<i32>,
    /// The recovery frame has been output.
    output_started: bool,
}

/// The picture being decoded.
struct ActivePicture {
    pic: Picture,
    /// U and V planes of a picture coded with separate colour planes. `pic` holds the Y plane.
    planes: Option<Box<[Picture; 2]>>,
    sps: Rc<Sps>,
    pps: Rc<Pps>,
    /// Initial reference lists, identical for every slice of the picture.
    initial_lists: ReferencePicLists,
}

impl ActivePicture {
    fn plane_mut(&mut self, plane: Option<ColourPlane>) -> &mut Picture {
        match (plane, self.planes.as_mut()) {
            (Some(ColourPlane::U), Some(planes)) => &mut planes[0],
            (Some(ColourPlane::V), Some(planes)) => &mut planes[1],
            _ => &mut self.pic,
        }
    }
}

pub struct H264Decoder<B: ReconstructionBackend> {
    backend: B,
    config: DecoderConfig,
    params: ParameterSetTable,
    active_sps: Option<Rc<Sps>>,
    dpb: Dpb,
    ctx: DecoderContext,

    /// Header fields of the last decoded slice.
    old_slice: OldSliceSnapshot,
    loss: LossState,

    prev_ref_pic_info: PrevReferencePicInfo,
    prev_pic_info: PrevPicInfo,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    /// frame_num of the last reference picture, the base of gap detection.
    pre_frame_num: i32,
    /// POC of the last reference picture, the base of synthesized frames.
    last_ref_pic_poc: i32,
    /// The last finished picture carried a memory_management_control_operation 5.
    last_has_mmco_5: bool,
    recovery: RecoveryState,

    /// A NAL unit read ahead while looking for data partitions.
    pending_nalu: Option<NalUnit>,
    active: Option<ActivePicture>,
    /// A non-reference first field waiting for its second field.
    last_field: Option<DpbEntry>,
    ready_queue: VecDeque<DecodedPicture>,
    stats: DecoderStats,
}

impl<B: ReconstructionBackend> H264Decoder<B> {
    pub fn new(backend: B, config: DecoderConfig) -> Self {
        Self {
            backend,
            config,
            params: Default::default(),
            active_sps: None,
            dpb: Default::default(),
            ctx: Default::default(),
            old_slice: Default::default(),
            loss: Default::default(),
            prev_ref_pic_info: Default::default(),
            prev_pic_info: Default::default(),
            max_long_term_frame_idx: MaxLongTermFrameIdx::NoLongTermFrameIndices,
            pre_frame_num: 0,
            last_ref_pic_poc: 0,
            last_has_mmco_5: false,
            recovery: Default::default(),
            pending_nalu: None,
            active: None,
            last_field: None,
            ready_queue: Default::default(),
            stats: Default::default(),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn dpb(&self) -> &Dpb {
        &self.dpb
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Whether a picture has been started and not finished yet.
    pub fn has_active_picture(&self) -> bool {
        self.active.is_some()
    }

    /// POC of the recovery frame announced by a recovery point, once it has been decoded.
    pub fn recovery_poc(&self) -> Option<i32> {
        self.recovery.poc
    }

    /// Returns the next picture in output order, if one is ready.
    pub fn next_picture(&mut self) -> Option<DecodedPicture> {
        self.ready_queue.pop_front()
    }

    /// Processes the next NAL unit of `source`. When the source is exhausted, the last picture
    /// is finished and every picture left in the DPB is made available through
    /// [`next_picture`](Self::next_picture).
    pub fn decode_next<S: NaluSource>(&mut self, source: &mut S) -> Result<DecodeStatus> {
        let nalu = match self.pending_nalu.take().or_else(|| source.next_nalu()) {
            Some(nalu) => nalu,
            None => {
                debug!("End of stream");
                self.flush()?;
                return Ok(DecodeStatus::EndOfStream);
            }
        };

        self.handle_nalu(nalu, source)?;

        Ok(DecodeStatus::Continue)
    }

    /// Decodes `source` until its end and returns every picture in output order.
    pub fn decode_stream<S: NaluSource>(&mut self, source: &mut S) -> Result<Vec<DecodedPicture>> {
        let mut pictures = vec![];

        loop {
            let status = self.decode_next(source)?;
            pictures.extend(self.ready_queue.drain(..));

            if status == DecodeStatus::EndOfStream {
                return Ok(pictures);
            }
        }
    }

    /// Finishes the active picture and outputs every picture still held by the decoder.
    pub fn flush(&mut self) -> Result<()> {
        self.end_picture()?;
        self.drain();

        Ok(())
    }

    fn handle_nalu<S: NaluSource>(&mut self, nalu: NalUnit, source: &mut S) -> Result<()> {
        let header = nalu.header;
        trace!("Handling NAL unit {:?} (nal_ref_idc {})", header.type_, header.ref_idc);

        match (header.type_, nalu.payload) {
            (NaluType::Slice | NaluType::SliceIdr, NaluPayload::Slice(slice)) => {
                let SliceNal { header: hdr, data, .. } = *slice;
                self.process_slice(&header, &hdr, SliceData::whole(data))
            }

            (NaluType::SliceDpa, NaluPayload::Slice(slice)) => {
                if !self.starts_decoding(&header) {
                    self.stats.skipped_nalus += 1;
                    return Ok(());
                }

                let SliceNal {
                    header: hdr,
                    slice_id,
                    data,
                } = *slice;
                let data = self.read_partitions(&hdr, slice_id, data, source);
                self.process_slice(&header, &hdr, data)
            }

            (NaluType::SliceDpb | NaluType::SliceDpc, _) => {
                warn!("Discarding {:?} without a matching partition A", header.type_);
                self.stats.skipped_nalus += 1;
                Ok(())
            }

            (NaluType::Sps, NaluPayload::Sps(sps)) => {
                debug!("Received SPS {}", sps.seq_parameter_set_id);
                self.params.insert_sps(sps);
                Ok(())
            }

            (NaluType::Pps, NaluPayload::Pps(pps)) => {
                debug!("Received PPS {}", pps.pic_parameter_set_id);
                self.params.insert_pps(pps);
                Ok(())
            }

            (NaluType::Sei, NaluPayload::Sei(messages)) => {
                for message in messages {
                    match message {
                        SeiMessage::RecoveryPoint { recovery_frame_cnt } => {
                            debug!("Recovery point, recovery_frame_cnt {}", recovery_frame_cnt);
                            self.recovery.recovery_point = true;
                            self.recovery.recovery_frame_cnt = recovery_frame_cnt;
                        }
                        SeiMessage::Other(payload_type) => {
                            trace!("Ignoring SEI message of type {}", payload_type)
                        }
                    }
                }
                Ok(())
            }

            (
                NaluType::AuDelimiter
                | NaluType::SeqEnd
                | NaluType::StreamEnd
                | NaluType::FillerData,
                _,
            ) => Ok(()),

            (type_, _) => {
                warn!("Skipping NAL unit of type {:?}", type_);
                self.stats.skipped_nalus += 1;
                Ok(())
            }
        }
    }

    /// Collects the B and C partitions that follow partition A `slice_id`. The first NAL unit
    /// that does not belong to the slice is kept for the next call to `decode_next`.
    fn read_partitions<S: NaluSource>(
        &mut self,
        hdr: &SliceHeader,
        slice_id: u32,
        a: Bytes,
        source: &mut S,
    ) -> SliceData {
        let mut data = SliceData::partition_a(a);

        let partition_data = |nalu: &NalUnit, type_: NaluType| -> Option<Bytes> {
            if nalu.header.type_ != type_ || nalu.header.lost_packets {
                return None;
            }

            match &nalu.payload {
                NaluPayload::Partition(PartitionNal {
                    slice_id: id,
                    redundant_pic_cnt,
                    data,
                }) if *id == slice_id && *redundant_pic_cnt == hdr.redundant_pic_cnt => {
                    Some(data.clone())
                }
                _ => None,
            }
        };

        let next = match source.next_nalu() {
            Some(nalu) if nalu.header.type_ == NaluType::SliceDpb => {
                match partition_data(&nalu, NaluType::SliceDpb) {
                    Some(b) => {
                        data.b = Some(b);
                        source.next_nalu()
                    }
                    None => {
                        // B and C are lost together when B does not belong to this slice.
                        warn!("Partition B does not match slice {}, dropping it", slice_id);
                        self.stats.lost_partitions += 2;
                        self.stats.skipped_nalus += 1;
                        return data;
                    }
                }
            }
            other => {
                self.stats.lost_partitions += 1;
                other
            }
        };

        match next {
            Some(nalu) if nalu.header.type_ == NaluType::SliceDpc => {
                match partition_data(&nalu, NaluType::SliceDpc) {
                    Some(c) => data.c = Some(c),
                    None => {
                        warn!("Partition C does not match slice {}, dropping it", slice_id);
                        self.stats.lost_partitions += 1;
                        self.stats.skipped_nalus += 1;
                    }
                }
            }
            other => {
                self.stats.lost_partitions += 1;
                self.pending_nalu = other;
            }
        }

        if !data.b_present() || !data.c_present() {
            debug!(
                "Slice {} is missing partitions (B: {}, C: {})",
                slice_id,
                data.b_present(),
                data.c_present()
            );
        }

        data
    }

    /// Whether a slice may be decoded: decoding only starts at an IDR picture or a recovery
    /// point.
    fn starts_decoding(&mut self, nalu: &NaluHeader) -> bool {
        let idr = nalu.idr_pic_flag();

        if self.recovery.recovery_point || idr {
            if !self.recovery.found {
                self.recovery.non_conforming_stream = !idr;
                if !idr {
                    warn!("Decoding does not start with an IDR picture");
                }
            }
            self.recovery.found = true;
        }

        if !self.recovery.found {
            trace!("Skipping slice before the first random access point");
        }

        self.recovery.found
    }

    fn process_slice(
        &mut self,
        nalu: &NaluHeader,
        hdr: &SliceHeader,
        data: SliceData,
    ) -> Result<()> {
        if nalu.type_ != NaluType::SliceDpa && !self.starts_decoding(nalu) {
            self.stats.skipped_nalus += 1;
            return Ok(());
        }

        let Some((pps, sps)) = self.params.active_pair(hdr.pic_parameter_set_id) else {
            warn!(
                "{}",
                DecodeError::NonConformantParameterSet {
                    pps_id: hdr.pic_parameter_set_id
                }
            );
            if nalu.ref_idc != 0 {
                self.recovery.found = false;
            }
            self.stats.skipped_nalus += 1;
            return Ok(());
        };

        if data.partitioned && pps.entropy_coding_mode_flag {
            return Err(DecodeError::PartitionedCabac);
        }

        self.activate_sps(&sps)?;

        self.loss.track_slice(hdr);

        if is_new_picture(self.active.is_some(), hdr, nalu, &sps, &pps, &self.old_slice) {
            self.begin_picture(nalu, hdr, &sps, &pps)?;
        }
        self.recovery.recovery_point = false;

        if self.loss.should_discard_redundant(hdr) {
            debug!("Discarding redundant slice of frame_num {}", hdr.frame_num);
            self.stats.discarded_redundant_slices += 1;
            return Ok(());
        }

        if self.loss.replaces_primary(hdr) {
            debug!("Redundant slice replaces its incorrect primary slice");
            if let Some(active) = self.active.as_mut() {
                active.pic.data.slice_type = hdr.slice_type;
            }
        }

        self.loss.complete_slice(hdr);
        self.decode_slice(hdr, &data)?;

        self.old_slice = OldSliceSnapshot::from_slice(hdr, nalu);
        self.ctx.current_slice_nr += 1;

        Ok(())
    }

    /// Makes `sps` the active SPS, flushing the DPB if it replaces another one.
    fn activate_sps(&mut self, sps: &Rc<Sps>) -> Result<()> {
        if self.active_sps.as_deref() == Some(sps.as_ref()) {
            return Ok(());
        }

        debug!(
            "Activating SPS {} ({}x{})",
            sps.seq_parameter_set_id,
            sps.width(),
            sps.height()
        );

        self.end_picture()?;
        self.drain();

        let max_dpb_frames = sps.max_dpb_frames();
        let max_num_order_frames = sps.max_num_order_frames() as usize;
        let max_num_reorder_frames = if max_num_order_frames > max_dpb_frames {
            0
        } else {
            max_num_order_frames
        };

        self.dpb.set_limits(max_dpb_frames, max_num_reorder_frames);
        self.dpb.set_interlaced(!sps.frame_mbs_only_flag);
        self.backend.new_sequence(sps)?;
        self.active_sps = Some(Rc::clone(sps));

        Ok(())
    }

    fn decode_slice(&mut self, hdr: &SliceHeader, data: &SliceData) -> Result<()> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| anyhow!("slice without an active picture"))?;
        let sps = Rc::clone(&active.sps);
        let pps = Rc::clone(&active.pps);

        let plane = if sps.separate_colour_plane_flag {
            let plane = ColourPlane::n(hdr.colour_plane_id)
                .ok_or_else(|| anyhow!("invalid colour_plane_id {}", hdr.colour_plane_id))?;
            Some(plane)
        } else {
            None
        };

        let ref_lists = build_slice_lists(
            &self.dpb,
            &active.pic.data,
            &active.initial_lists,
            hdr,
            &sps,
            self.max_long_term_frame_idx,
            self.recovery.non_conforming_stream,
        )?;
        let ref_pic_ids = RefPicIds::new(&ref_lists, &self.dpb, &active.pic.data, &sps);
        let weights = WeightTables::new(hdr, &pps, &active.pic.data, &ref_lists, &self.dpb);
        let colocated = if hdr.slice_type.is_b() {
            ref_lists
                .colocated()
                .and_then(|id| ColocatedBuffer::new(&self.dpb, id))
        } else {
            None
        };
        let strategy = SliceStrategy::select(&pps, &active.pic.data);

        trace!(
            "Slice {} of picture {:?}: {:?}, first_mb_in_slice {}",
            self.ctx.current_slice_nr,
            active.pic.data.id,
            hdr.slice_type,
            hdr.first_mb_in_slice
        );

        self.backend.start_slice(hdr, strategy, data)?;

        let job = SliceJob {
            header: hdr,
            sps: &sps,
            pps: &pps,
            data,
            strategy,
            plane,
            slice_nr: self.ctx.current_slice_nr,
            ref_lists: &ref_lists,
            ref_pic_ids: &ref_pic_ids,
            weights: &weights,
            colocated: colocated.as_ref(),
            dpb: &self.dpb,
        };

        let plane_idx = plane.map_or(0, |p| p as usize);
        let state = self
            .ctx
            .planes
            .get_mut(plane_idx)
            .ok_or_else(|| anyhow!("no macroblock state for plane {}", plane_idx))?;

        // Concealment only looks at the luma plane.
        let mut scratch_mv = 0;
        let mut objects = if plane_idx == 0 {
            ErcObjects {
                regions: &mut self.ctx.erc_objects,
                mv_per_mb: &mut self.ctx.erc_mv_per_mb,
            }
        } else {
            ErcObjects {
                regions: &mut [],
                mv_per_mb: &mut scratch_mv,
            }
        };

        let outcome = decode_slice_data(
            &mut self.backend,
            &job,
            active.plane_mut(plane),
            state,
            &mut objects,
        )?;

        if outcome.lost {
            self.stats.lost_slices += 1;
        }

        Ok(())
    }

    /// Outputs every picture of the DPB and empties it.
    fn drain(&mut self) {
        let pics = self.dpb.flush();
        self.emit(pics);

        if let Some(last_field) = self.last_field.take() {
            self.emit(last_field.output(None));
        }
    }

    /// Queues pictures for output. Pictures of a stream that did not start with an IDR picture
    /// are dropped until the recovery frame is output.
    fn emit(&mut self, pics: impl IntoIterator<Item = DecodedPicture>) {
        for pic in pics {
            if pic.recovery_frame {
                self.recovery.output_started = true;
            }

            if self.recovery.non_conforming_stream && !self.recovery.output_started {
                debug!("Dropping picture with POC {} before the recovery frame", pic.pic_order_cnt);
                continue;
            }

            self.ready_queue.push_back(pic);
        }
    }
}

#[cfg(test)]
mod tests;
