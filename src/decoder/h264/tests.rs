// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::backend::dummy::Backend;
use crate::backend::ColourPlane;
use crate::codec::h264::nalu::NalUnit;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu::SeiMessage;
use crate::codec::h264::picture::Field;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::PpsBuilder;
use crate::codec::h264::syntax::RefPicMarking;
use crate::codec::h264::syntax::RefPicMarkingInner;
use crate::codec::h264::syntax::SliceHeaderBuilder;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::Sps;
use crate::codec::h264::syntax::SpsBuilder;
use crate::decoder::h264::H264Decoder;
use crate::decoder::ConcealMode;
use crate::decoder::DecodeError;
use crate::decoder::DecodeStatus;
use crate::decoder::DecodedPicture;
use crate::decoder::DecoderConfig;

fn decoder(conceal_mode: ConcealMode) -> H264Decoder<Backend> {
    let _ = env_logger::try_init();

    H264Decoder::new(
        Backend::new(),
        DecoderConfig {
            conceal_mode,
            ..Default::default()
        },
    )
}

/// Slice data making the dummy backend end the slice after `mbs` macroblocks.
fn mbs(mbs: u16) -> Bytes {
    Bytes::copy_from_slice(&mbs.to_le_bytes())
}

fn header(pps: &Pps, slice_type: SliceType, frame_num: u16, poc_lsb: u16) -> SliceHeaderBuilder {
    SliceHeaderBuilder::new(pps)
        .slice_type(slice_type)
        .frame_num(frame_num)
        .pic_order_cnt_lsb(poc_lsb)
}

fn idr(pps: &Pps) -> NalUnit {
    NalUnit::slice(header(pps, SliceType::I, 0, 0).build(), 3, true, Bytes::new())
}

/// A reference P frame with a POC of twice its frame_num.
fn p(pps: &Pps, frame_num: u16) -> NalUnit {
    NalUnit::slice(
        header(pps, SliceType::P, frame_num, frame_num * 2).build(),
        1,
        false,
        Bytes::new(),
    )
}

fn stream(sps: &Rc<Sps>, pps: &Rc<Pps>, slices: Vec<NalUnit>) -> VecDeque<NalUnit> {
    let mut nalus = VecDeque::from([NalUnit::sps(Rc::clone(sps)), NalUnit::pps(Rc::clone(pps))]);
    nalus.extend(slices);
    nalus
}

fn pocs(pictures: &[DecodedPicture]) -> Vec<i32> {
    pictures.iter().map(|pic| pic.pic_order_cnt).collect()
}

/// Feeds `count` NAL units of `source` to the decoder.
fn feed(decoder: &mut H264Decoder<Backend>, source: &mut VecDeque<NalUnit>, count: usize) {
    for _ in 0..count {
        assert_eq!(decoder.decode_next(source).unwrap(), DecodeStatus::Continue);
    }
}

#[test]
fn pictures_are_output_in_poc_order() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();

    // Decoding order I0 P4 B2, with the B frame not used for reference.
    let b = NalUnit::slice(
        header(&pps, SliceType::B, 2, 2)
            .direct_spatial_mv_pred_flag(true)
            .build(),
        0,
        false,
        Bytes::new(),
    );
    let mut source = stream(
        &sps,
        &pps,
        vec![
            idr(&pps),
            NalUnit::slice(header(&pps, SliceType::P, 1, 4).build(), 1, false, Bytes::new()),
            b,
        ],
    );

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pocs(&pictures), vec![0, 2, 4]);
    assert!(pictures[0].is_idr);
    assert_eq!(pictures[1].slice_type, SliceType::B);
    assert_eq!(decoder.backend().sequences, 1);
    assert_eq!(decoder.backend().deblocked, vec![None; 3]);

    // The B frame has its co-located picture.
    let last = decoder.backend().decoded.last().unwrap();
    assert_eq!(last.num_ref_idx_active, [1, 1]);
    assert!(last.has_colocated);
}

#[test]
fn slices_of_a_picture_share_it() {
    let sps = SpsBuilder::new().resolution_in_mbs(2, 2).build();
    let pps = PpsBuilder::new(&sps).build();

    let first = NalUnit::slice(header(&pps, SliceType::I, 0, 0).build(), 3, true, mbs(2));
    let second = NalUnit::slice(
        header(&pps, SliceType::I, 0, 0).first_mb_in_slice(2).build(),
        3,
        true,
        Bytes::new(),
    );
    let mut source = stream(&sps, &pps, vec![first, second]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 1);
    let backend = decoder.backend();
    assert_eq!(backend.decoded_addrs(None), vec![0, 1, 2, 3]);
    let slice_nrs: Vec<_> = backend.decoded.iter().map(|mb| mb.slice_nr).collect();
    assert_eq!(slice_nrs, vec![0, 0, 1, 1]);
    assert_eq!(backend.deblocked.len(), 1);
    assert_eq!(backend.intra_concealments, 0);

    // The dummy backend tags each macroblock with its address.
    let luma = &pictures[0].luma;
    assert_eq!(luma.row(0)[0], 0);
    assert_eq!(luma.row(0)[16], 1);
    assert_eq!(luma.row(16)[0], 2);
    assert_eq!(luma.row(31)[31], 3);
}

#[test]
fn new_picture_finishes_the_active_one_once() {
    let sps = SpsBuilder::new().resolution_in_mbs(2, 2).build();
    let pps = PpsBuilder::new(&sps).build();

    // The first picture only receives half of its macroblocks.
    let partial = NalUnit::slice(header(&pps, SliceType::I, 0, 0).build(), 3, true, mbs(2));
    let mut source = stream(&sps, &pps, vec![partial, p(&pps, 1)]);

    let mut decoder = decoder(ConcealMode::Off);
    feed(&mut decoder, &mut source, 3);
    assert!(decoder.has_active_picture());
    assert!(decoder.backend().deblocked.is_empty());
    assert_eq!(decoder.dpb().len(), 0);

    feed(&mut decoder, &mut source, 1);
    assert!(decoder.has_active_picture());
    assert_eq!(decoder.backend().deblocked.len(), 1);
    assert_eq!(decoder.backend().intra_concealments, 1);
    assert_eq!(decoder.dpb().len(), 1);

    assert_eq!(decoder.decode_next(&mut source).unwrap(), DecodeStatus::EndOfStream);
    assert!(!decoder.has_active_picture());
    assert_eq!(decoder.backend().deblocked.len(), 2);
    assert_eq!(decoder.next_picture().map(|pic| pic.pic_order_cnt), Some(0));
    assert_eq!(decoder.next_picture().map(|pic| pic.pic_order_cnt), Some(2));
    assert_eq!(decoder.next_picture(), None);
}

#[test]
fn finished_pictures_are_stored_in_the_dpb() {
    let sps = SpsBuilder::new().max_num_ref_frames(2).build();
    let pps = PpsBuilder::new(&sps).pic_init_qp_minus26(-4).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps), p(&pps, 1), p(&pps, 2)]);

    let mut decoder = decoder(ConcealMode::Off);
    feed(&mut decoder, &mut source, 3);
    assert_eq!(decoder.dpb().len(), 0);

    feed(&mut decoder, &mut source, 1);
    assert_eq!(decoder.dpb().len(), 1);

    feed(&mut decoder, &mut source, 1);
    assert_eq!(decoder.dpb().len(), 2);

    decoder.end_picture().unwrap();
    assert_eq!(decoder.dpb().len(), 3);
    assert!(!decoder.has_active_picture());
    assert!(decoder.dpb().entries().iter().all(|entry| entry.pic.qp == 22));
}

#[test]
fn interlaced_frames_take_two_dpb_entries() {
    let sps = SpsBuilder::new()
        .frame_mbs_only_flag(false)
        .resolution_in_mbs(1, 2)
        .build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps)]);

    let mut decoder = decoder(ConcealMode::Off);
    feed(&mut decoder, &mut source, 3);
    decoder.end_picture().unwrap();
    assert_eq!(decoder.dpb().len(), 2);

    decoder.flush().unwrap();
    let pic = decoder.next_picture().unwrap();
    assert_eq!(pic.field, Field::Frame);
    assert_eq!(pic.luma.height, 32);
    assert_eq!(decoder.next_picture(), None);
}

#[test]
fn field_pairs_are_woven() {
    let sps = SpsBuilder::new()
        .frame_mbs_only_flag(false)
        .resolution_in_mbs(1, 2)
        .build();
    let pps = PpsBuilder::new(&sps).build();

    let top = NalUnit::slice(
        header(&pps, SliceType::I, 0, 0).field(Field::Top).build(),
        3,
        true,
        Bytes::new(),
    );
    let bottom = NalUnit::slice(
        header(&pps, SliceType::I, 0, 1).field(Field::Bottom).build(),
        3,
        false,
        Bytes::new(),
    );
    let mut source = stream(&sps, &pps, vec![top, bottom]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 1);
    assert_eq!(pictures[0].field, Field::Frame);
    assert_eq!(pictures[0].pic_order_cnt, 0);
    assert_eq!(pictures[0].luma.height, 32);
    assert_eq!(decoder.backend().deblocked.len(), 2);
}

#[test]
fn mbaff_field_pairs_are_reordered() {
    let sps = SpsBuilder::new()
        .frame_mbs_only_flag(false)
        .mb_adaptive_frame_field_flag(true)
        .resolution_in_mbs(1, 2)
        .build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps)]);

    let mut decoder = decoder(ConcealMode::Off);
    decoder.backend_mut().field_mbs = true;
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 1);
    // Macroblock 0 holds the top field and macroblock 1 the bottom field.
    let luma = &pictures[0].luma;
    assert_eq!(luma.row(0)[0], 0);
    assert_eq!(luma.row(1)[0], 1);
    assert_eq!(luma.row(16)[0], 0);
    assert_eq!(luma.row(31)[0], 1);
}

#[test]
fn frame_num_gap_without_concealment_fails() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps), p(&pps, 1), p(&pps, 3)]);

    let mut decoder = decoder(ConcealMode::Off);
    let result = decoder.decode_stream(&mut source);

    assert!(matches!(
        result,
        Err(DecodeError::FrameNumGap {
            frame_num: 3,
            expected: 2
        })
    ));
    assert_eq!(decoder.stats().concealed_frames, 0);
}

#[test]
fn frame_num_gap_is_concealed_with_frame_copies() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps), p(&pps, 1), p(&pps, 3)]);

    let mut decoder = decoder(ConcealMode::FrameCopy);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(decoder.stats().concealed_frames, 1);
    assert_eq!(pocs(&pictures), vec![0, 2, 4, 6]);

    let concealed: Vec<_> = pictures.iter().filter(|pic| pic.concealed).collect();
    assert_eq!(concealed.len(), 1);
    assert_eq!(concealed[0].frame_num, 2);
    assert_eq!(concealed[0].luma, pictures[1].luma);
    assert_eq!(decoder.backend().lost_frame_concealments, 0);
}

#[test]
fn frame_num_gap_is_concealed_by_the_backend() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps), p(&pps, 1), p(&pps, 4)]);

    let mut decoder = decoder(ConcealMode::MotionCopy);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(decoder.stats().concealed_frames, 2);
    assert_eq!(decoder.backend().lost_frame_concealments, 2);
    assert_eq!(pictures.iter().filter(|pic| pic.concealed).count(), 2);
}

#[test]
fn lost_idr_picture_is_replaced() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    // The IDR picture preceding the second P1 is missing.
    let mut source = stream(
        &sps,
        &pps,
        vec![idr(&pps), p(&pps, 1), p(&pps, 2), p(&pps, 1)],
    );

    let mut decoder = decoder(ConcealMode::MotionCopy);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(decoder.stats().concealed_frames, 1);
    // Only frame copy is possible across a lost IDR picture.
    assert_eq!(decoder.backend().lost_frame_concealments, 0);
    assert_eq!(pocs(&pictures), vec![0, 2, 4, 0, 2]);
    assert!(pictures[3].concealed);
    assert!(pictures[3].is_idr);
    assert_eq!(pictures[3].frame_num, 0);
}

#[test]
fn allowed_gaps_are_filled_with_non_existing_frames() {
    let sps = SpsBuilder::new()
        .gaps_in_frame_num_value_allowed_flag(true)
        .max_num_ref_frames(3)
        .build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps), p(&pps, 3)]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    // Non-existing frames are never output.
    assert_eq!(pocs(&pictures), vec![0, 6]);
    assert_eq!(decoder.stats().concealed_frames, 0);
}

#[test]
fn poc_type_1_follows_the_offset_cycle() {
    let sps = SpsBuilder::new()
        .pic_order_cnt_type(1)
        .offset_for_ref_frames(&[2, 6])
        .build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps), p(&pps, 1), p(&pps, 2), p(&pps, 3)]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pocs(&pictures), vec![0, 2, 8, 10]);
}

#[test]
fn poc_type_2_follows_decoding_order() {
    let sps = SpsBuilder::new().pic_order_cnt_type(2).build();
    let pps = PpsBuilder::new(&sps).build();
    let non_ref = NalUnit::slice(header(&pps, SliceType::P, 2, 0).build(), 0, false, Bytes::new());
    let mut source = stream(&sps, &pps, vec![idr(&pps), p(&pps, 1), non_ref]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pocs(&pictures), vec![0, 2, 3]);
}

#[test]
fn mmco_5_resets_poc_and_frame_num() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();

    let marking = RefPicMarking {
        adaptive_ref_pic_marking_mode_flag: true,
        inner: vec![RefPicMarkingInner {
            memory_management_control_operation: 5,
            ..Default::default()
        }],
        ..Default::default()
    };
    let mmco5 = NalUnit::slice(
        header(&pps, SliceType::P, 1, 2).dec_ref_pic_marking(marking).build(),
        1,
        false,
        Bytes::new(),
    );
    // Frame numbering restarts after the memory_management_control_operation 5.
    let next = NalUnit::slice(header(&pps, SliceType::P, 1, 4).build(), 1, false, Bytes::new());
    let mut source = stream(&sps, &pps, vec![idr(&pps), mmco5, next]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pocs(&pictures), vec![0, 0, 4]);
    assert_eq!(pictures[1].frame_num, 0);
}

#[test]
fn decoding_starts_at_an_idr_picture() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![p(&pps, 5), idr(&pps), p(&pps, 1)]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pocs(&pictures), vec![0, 2]);
    assert_eq!(decoder.stats().skipped_nalus, 1);
    assert_eq!(decoder.backend().slices.len(), 2);
}

#[test]
fn recovery_point_starts_decoding() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let sei = NalUnit::sei(vec![
        SeiMessage::Other(5),
        SeiMessage::RecoveryPoint {
            recovery_frame_cnt: 1,
        },
    ]);
    let mut source = stream(&sps, &pps, vec![sei, p(&pps, 3), p(&pps, 4)]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    // Both pictures are decoded, only the recovery frame and what follows is output.
    assert_eq!(decoder.backend().slices.len(), 2);
    assert_eq!(pictures.len(), 1);
    assert_eq!(pictures[0].frame_num, 4);
    assert!(pictures[0].recovery_frame);
    assert_eq!(decoder.recovery_poc(), Some(8));
}

fn recovery_point() -> NalUnit {
    NalUnit::sei(vec![SeiMessage::RecoveryPoint {
        recovery_frame_cnt: 0,
    }])
}

#[test]
fn exhausted_list_0_fails_in_conforming_streams() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    // Two active references while the DPB only holds the IDR picture.
    let p1 = NalUnit::slice(
        header(&pps, SliceType::P, 1, 2).num_ref_idx_l0_active(2).build(),
        1,
        false,
        Bytes::new(),
    );
    let mut source = stream(&sps, &pps, vec![idr(&pps), p1]);

    let mut decoder = decoder(ConcealMode::Off);
    let result = decoder.decode_stream(&mut source);

    assert!(matches!(
        result,
        Err(DecodeError::ReferenceListExhausted { list: 0 })
    ));
}

#[test]
fn exhausted_list_0_is_tolerated_after_a_recovery_point() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let p4 = NalUnit::slice(
        header(&pps, SliceType::P, 4, 8).num_ref_idx_l0_active(2).build(),
        1,
        false,
        Bytes::new(),
    );
    let mut source = stream(&sps, &pps, vec![recovery_point(), p(&pps, 3), p4]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(decoder.backend().slices.len(), 2);
    assert_eq!(pocs(&pictures), vec![6, 8]);
}

#[test]
fn exhausted_list_1_always_fails() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let i0 = NalUnit::slice(header(&pps, SliceType::I, 0, 0).build(), 1, false, Bytes::new());
    let b = NalUnit::slice(
        header(&pps, SliceType::B, 1, 2)
            .direct_spatial_mv_pred_flag(true)
            .num_ref_idx_l1_active(2)
            .build(),
        0,
        false,
        Bytes::new(),
    );
    // Starting at a recovery point makes the stream non-conforming.
    let mut source = stream(&sps, &pps, vec![recovery_point(), i0, b]);

    let mut decoder = decoder(ConcealMode::Off);
    let result = decoder.decode_stream(&mut source);

    assert!(matches!(
        result,
        Err(DecodeError::ReferenceListExhausted { list: 1 })
    ));
}

#[test]
fn slices_with_unknown_pps_are_skipped() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let missing = PpsBuilder::new(&sps).pic_parameter_set_id(3).build();
    let mut source = stream(&sps, &pps, vec![idr(&missing), idr(&pps)]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 1);
    assert_eq!(decoder.stats().skipped_nalus, 1);
}

#[test]
fn stream_control_nalus_are_ignored() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(
        &sps,
        &pps,
        vec![
            NalUnit::raw(NaluType::AuDelimiter, Bytes::new()),
            idr(&pps),
            NalUnit::raw(NaluType::FillerData, Bytes::from_static(&[0xff; 4])),
            NalUnit::raw(NaluType::SliceExt, Bytes::new()),
            NalUnit::raw(NaluType::SeqEnd, Bytes::new()),
        ],
    );

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 1);
    // Only the unsupported extension slice counts as skipped.
    assert_eq!(decoder.stats().skipped_nalus, 1);
}

#[test]
fn new_sps_flushes_the_dpb() {
    let small = SpsBuilder::new().build();
    let large = SpsBuilder::new().resolution_in_mbs(2, 2).build();
    let pps = PpsBuilder::new(&small).build();

    let mut source = stream(&small, &pps, vec![idr(&pps), NalUnit::sps(large), idr(&pps)]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(decoder.backend().sequences, 2);
    assert_eq!(pictures.len(), 2);
    assert_eq!(pictures[0].resolution.width, 16);
    assert_eq!(pictures[1].resolution.width, 32);
}

#[test]
fn redundant_slices_of_correct_pictures_are_discarded() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).redundant_pic_cnt_present_flag(true).build();
    let redundant = NalUnit::slice(
        header(&pps, SliceType::I, 0, 0).redundant_pic_cnt(1).build(),
        3,
        true,
        Bytes::new(),
    );
    let mut source = stream(&sps, &pps, vec![idr(&pps), redundant]);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 1);
    assert_eq!(decoder.stats().discarded_redundant_slices, 1);
    assert_eq!(decoder.backend().slices.len(), 1);
}

#[test]
fn corrupted_slice_is_concealed() {
    let sps = SpsBuilder::new().resolution_in_mbs(2, 2).build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(&sps, &pps, vec![idr(&pps)]);

    let mut decoder = decoder(ConcealMode::Off);
    decoder.backend_mut().corrupt_at = Some(2);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 1);
    assert_eq!(decoder.stats().lost_slices, 1);
    assert_eq!(decoder.backend().decoded_addrs(None), vec![0, 1]);
    assert_eq!(decoder.backend().intra_concealments, 1);
    assert_eq!(decoder.backend().inter_concealments, 0);
}

#[test]
fn data_partitions_are_assembled() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let dpa = NalUnit::partition_a(header(&pps, SliceType::P, 1, 2).build(), 1, 7, Bytes::new());
    let mut source = stream(
        &sps,
        &pps,
        vec![
            idr(&pps),
            dpa,
            NalUnit::partition_b(7, 0, Bytes::new()),
            NalUnit::partition_c(7, 0, Bytes::new()),
        ],
    );

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 2);
    let slice = &decoder.backend().slices[1];
    assert!(slice.partitioned && slice.b_present && slice.c_present);
    assert_eq!(decoder.stats().lost_partitions, 0);
    assert_eq!(decoder.backend().inter_concealments, 0);
}

#[test]
fn missing_partition_c_is_concealed() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let dpa = NalUnit::partition_a(header(&pps, SliceType::P, 1, 2).build(), 1, 0, Bytes::new());
    let mut source = stream(
        &sps,
        &pps,
        vec![
            idr(&pps),
            dpa,
            NalUnit::partition_b(0, 0, Bytes::new()),
            p(&pps, 2),
        ],
    );

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    // The P slice read while looking for partition C is still decoded.
    assert_eq!(pocs(&pictures), vec![0, 2, 4]);
    assert_eq!(decoder.backend().slices.len(), 3);

    let slice = &decoder.backend().slices[1];
    assert!(slice.partitioned && slice.b_present && !slice.c_present);
    assert_eq!(decoder.stats().lost_partitions, 1);
    // The inter macroblocks of the partitioned slice lost their residual.
    assert_eq!(decoder.backend().inter_concealments, 1);
}

#[test]
fn mismatched_partition_b_drops_b_and_c() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let dpa = NalUnit::partition_a(header(&pps, SliceType::P, 1, 2).build(), 1, 0, Bytes::new());
    let mut source = stream(
        &sps,
        &pps,
        vec![idr(&pps), dpa, NalUnit::partition_b(1, 0, Bytes::new())],
    );

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 2);
    let slice = &decoder.backend().slices[1];
    assert!(!slice.b_present && !slice.c_present);

    let stats = decoder.stats();
    assert_eq!(stats.lost_partitions, 2);
    assert_eq!(stats.skipped_nalus, 1);
}

#[test]
fn partition_with_lost_packets_is_dropped() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let dpa = NalUnit::partition_a(header(&pps, SliceType::P, 1, 2).build(), 1, 0, Bytes::new());
    let mut source = stream(
        &sps,
        &pps,
        vec![
            idr(&pps),
            dpa,
            NalUnit::partition_b(0, 0, Bytes::new()),
            NalUnit::partition_c(0, 0, Bytes::new()).with_lost_packets(),
        ],
    );

    let mut decoder = decoder(ConcealMode::Off);
    decoder.decode_stream(&mut source).unwrap();

    let slice = &decoder.backend().slices[1];
    assert!(slice.b_present && !slice.c_present);

    let stats = decoder.stats();
    assert_eq!(stats.lost_partitions, 1);
    assert_eq!(stats.skipped_nalus, 1);
}

#[test]
fn orphan_partitions_are_skipped() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).build();
    let mut source = stream(
        &sps,
        &pps,
        vec![
            idr(&pps),
            NalUnit::partition_b(0, 0, Bytes::new()),
            NalUnit::partition_c(0, 0, Bytes::new()),
        ],
    );

    let mut decoder = decoder(ConcealMode::Off);
    decoder.decode_stream(&mut source).unwrap();

    assert_eq!(decoder.stats().skipped_nalus, 2);
}

#[test]
fn partitions_with_cabac_are_rejected() {
    let sps = SpsBuilder::new().build();
    let pps = PpsBuilder::new(&sps).entropy_coding_mode_flag(true).build();
    let dpa = NalUnit::partition_a(header(&pps, SliceType::P, 1, 2).build(), 1, 0, Bytes::new());
    let mut source = stream(&sps, &pps, vec![idr(&pps), dpa]);

    let mut decoder = decoder(ConcealMode::Off);
    let result = decoder.decode_stream(&mut source);

    assert!(matches!(result, Err(DecodeError::PartitionedCabac)));
}

#[test]
fn separate_colour_planes_are_merged() {
    let sps = SpsBuilder::new().separate_colour_plane_flag(true).build();
    let pps = PpsBuilder::new(&sps).build();
    let planes = (0..3)
        .map(|colour_plane_id| {
            NalUnit::slice(
                header(&pps, SliceType::I, 0, 0)
                    .colour_plane_id(colour_plane_id)
                    .build(),
                3,
                true,
                Bytes::new(),
            )
        })
        .collect();
    let mut source = stream(&sps, &pps, planes);

    let mut decoder = decoder(ConcealMode::Off);
    let pictures = decoder.decode_stream(&mut source).unwrap();

    assert_eq!(pictures.len(), 1);
    let backend = decoder.backend();
    for plane in [ColourPlane::Y, ColourPlane::U, ColourPlane::V] {
        assert_eq!(backend.decoded_addrs(Some(plane)), vec![0]);
    }
    assert_eq!(
        backend.deblocked,
        vec![
            Some(ColourPlane::Y),
            Some(ColourPlane::U),
            Some(ColourPlane::V)
        ]
    );

    let chroma = pictures[0].chroma.as_ref().unwrap();
    assert_eq!(chroma[0].width, 16);
    assert_eq!(chroma[1].height, 16);
}
