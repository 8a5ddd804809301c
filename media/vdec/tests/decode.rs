// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end decoding of dummy streams through the public decoder API.

use bytes::BytesMut;
use vdec::backend::PictureType;
use vdec::backend::SliceHeader;
use vdec::decoder::DegradePictures;
use vdec::decoder::FrameSkip;
use vdec::decoder::OutputOrder;
use vdec::dummy::chroma_values;
use vdec::dummy::StreamWriter;
use vdec::mem_record::allocate_blocks;
use vdec::negotiate::Requirements;
use vdec::pool::DisplayBuffer;
use vdec::pool::Holders;
use vdec::Cause;
use vdec::Codec;
use vdec::ColorFormat;
use vdec::DecodeInput;
use vdec::DecodeOutput;
use vdec::DecodeParams;
use vdec::Decoder;
use vdec::DecoderConfig;
use vdec::Resolution;
use vdec::Severity;

const BASE: u64 = 0x1000_0000;
const W: u16 = 64;
const H: u16 = 32;
const TOTAL_MBS: u32 = 8;

fn config() -> DecoderConfig {
    DecoderConfig::new(Codec::H264, W as u32, H as u32)
        .with_ref_frames(1)
        .with_reorder_frames(0)
}

fn init(config: &DecoderConfig) -> Decoder {
    let mut decoder = Decoder::dummy();
    let records = Decoder::fill_mem_records(config).unwrap();
    decoder
        .init(config, allocate_blocks(&records, BASE))
        .unwrap();
    decoder
}

/// Host output buffers sized from the decoder's buffer info.
fn host_planes(decoder: &Decoder) -> Vec<Vec<u8>> {
    let info = decoder.get_buffer_info().unwrap();
    info.min_output_sizes[..info.num_output_buffers]
        .iter()
        .map(|&size| vec![0u8; size as usize])
        .collect()
}

fn decode_into(decoder: &mut Decoder, stream: &[u8], planes: &mut [Vec<u8>]) -> DecodeOutput {
    let output = planes.iter_mut().map(|p| p.as_mut_slice()).collect();
    decoder
        .decode(DecodeInput::new(stream).with_output(output))
        .unwrap()
}

fn decode(decoder: &mut Decoder, stream: &[u8]) -> DecodeOutput {
    let mut planes = host_planes(decoder);
    decode_into(decoder, stream, &mut planes)
}

/// Feeds `stream` until it is consumed, returning every call's result.
fn decode_all(decoder: &mut Decoder, stream: &[u8]) -> Vec<DecodeOutput> {
    let mut outputs = Vec::new();
    let mut pos = 0;
    while pos < stream.len() {
        let out = decode(decoder, &stream[pos..]);
        assert!(out.is_success(), "{:?}", out);
        assert!(out.bytes_consumed > 0);
        pos += out.bytes_consumed;
        outputs.push(out);
    }
    outputs
}

/// Flushes the decoder, returning the pictures that came out.
fn drain(decoder: &mut Decoder) -> Vec<DecodeOutput> {
    decoder.flush().unwrap();
    let mut outputs = Vec::new();
    loop {
        let out = decode(decoder, &[]);
        assert!(out.is_success());
        assert_eq!(out.bytes_consumed, 0);
        if !out.output_present {
            return outputs;
        }
        outputs.push(out);
    }
}

fn slice(picture_type: PictureType, poc: i32, first_mb: u32, num_mbs: u32) -> SliceHeader {
    SliceHeader {
        picture_type,
        is_reference: picture_type != PictureType::B,
        first_slice: first_mb == 0,
        poc,
        first_mb,
        num_mbs,
        ..Default::default()
    }
}

#[test]
fn overlapping_blocks_fail_init_until_corrected() {
    let config = config();
    let records = Decoder::fill_mem_records(&config).unwrap();
    let mut blocks = allocate_blocks(&records, BASE);
    // The second block starts on the last byte of the first.
    blocks[1].base = blocks[0].base + blocks[0].record.size - 1;

    let mut decoder = Decoder::dummy();
    let err = decoder.init(&config, blocks).unwrap_err();
    assert_eq!(err.cause(), Cause::MemRecOverlap);
    assert!(!decoder.is_initialized());

    decoder
        .init(&config, allocate_blocks(&records, BASE))
        .unwrap();
    assert!(decoder.is_initialized());
    assert_eq!(decoder.mem_records().unwrap(), records);
}

#[test]
fn oversized_unit_is_discarded() {
    let config = config();
    let max_unit_size = Requirements::resolve(&config).unwrap().max_unit_size;
    let mut decoder = init(&config);
    let stream = StreamWriter::new()
        .sequence(W, H)
        .filler(max_unit_size + 1)
        .build();

    let out = decode(&mut decoder, &stream);
    assert!(out.failed);
    let err = out.error.unwrap();
    assert_eq!(err.cause(), Cause::UnitTooLarge);
    assert!(err.severity().contains(Severity::CORRUPTED_DATA));
    assert_eq!(out.bytes_consumed, stream.len());

    // The stream continues after the discarded unit.
    let picture = StreamWriter::new()
        .picture(PictureType::I, true, 0, TOTAL_MBS, 40)
        .build();
    let out = decode(&mut decoder, &picture);
    assert!(out.is_success());
    assert!(out.output_present);
}

#[test]
fn oversized_unit_abandons_picture_in_flight() {
    let config = config();
    let max_unit_size = Requirements::resolve(&config).unwrap().max_unit_size;
    let mut decoder = init(&config);
    let stream = StreamWriter::new()
        .sequence(W, H)
        .slice(&slice(PictureType::I, 0, 0, 4), &[10])
        .filler(max_unit_size + 1)
        .build();

    let out = decode(&mut decoder, &stream);
    assert!(out.failed);
    assert_eq!(out.bytes_consumed, stream.len());
    assert!(!out.output_present);
    assert!(decoder.holders().unwrap().iter().all(|h| h.is_empty()));
}

#[test]
fn flush_outputs_every_buffered_picture() {
    let config = DecoderConfig::new(Codec::H264, W as u32, H as u32)
        .with_ref_frames(1)
        .with_reorder_frames(3);
    let mut decoder = init(&config);
    let stream = StreamWriter::new()
        .sequence(W, H)
        .picture(PictureType::I, true, 0, TOTAL_MBS, 20)
        .picture(PictureType::P, true, 6, TOTAL_MBS, 60)
        .picture(PictureType::B, false, 2, TOTAL_MBS, 40)
        .build();

    let outputs = decode_all(&mut decoder, &stream);
    assert_eq!(outputs.len(), 3);
    assert!(outputs.iter().all(|o| !o.output_present));

    let mut luma = Vec::new();
    decoder.flush().unwrap();
    for _ in 0..3 {
        let mut planes = host_planes(&decoder);
        let out = decode_into(&mut decoder, &[], &mut planes);
        assert!(out.is_success());
        assert!(out.output_present);
        luma.push((out.picture_type.unwrap(), planes[0][0]));
    }
    assert_eq!(
        luma,
        vec![
            (PictureType::I, 20),
            (PictureType::B, 40),
            (PictureType::P, 60)
        ]
    );
    let out = decode(&mut decoder, &[]);
    assert!(out.is_success());
    assert!(!out.output_present);

    // Flush mode is over: empty input is an error again.
    let mut planes = host_planes(&decoder);
    let output = planes.iter_mut().map(|p| p.as_mut_slice()).collect();
    let err = decoder
        .decode(DecodeInput::new(&[]).with_output(output))
        .unwrap_err();
    assert_eq!(err.cause(), Cause::NumBytesInvalid);
}

#[test]
fn shared_buffer_release_is_idempotent() {
    let config = config()
        .with_shared_display_buffers(true)
        .with_extra_display_buffers(1);
    let mut decoder = init(&config);
    let capacity = decoder.holders().unwrap().len();
    assert_eq!(capacity, 3);

    let sizes = ColorFormat::Yuv420P.min_plane_sizes(W as u32, H as u32);
    let buffers: Vec<DisplayBuffer> = (0..capacity)
        .map(|_| {
            DisplayBuffer::new(
                sizes
                    .iter()
                    .map(|&s| BytesMut::zeroed(s as usize))
                    .collect(),
            )
        })
        .collect();
    assert_eq!(decoder.set_display_frame(buffers.clone()).unwrap(), capacity);

    let stream = StreamWriter::new()
        .sequence(W, H)
        .picture(PictureType::I, true, 0, TOTAL_MBS, 77)
        .build();
    // Every buffer is still with the host.
    let err = decoder
        .decode(DecodeInput::new(&stream))
        .unwrap_err();
    assert_eq!(err.cause(), Cause::ReferenceBufferUnavailable);

    for id in 0..capacity {
        decoder.release_display_frame(id).unwrap();
    }
    let out = decoder.decode(DecodeInput::new(&stream)).unwrap();
    assert!(out.is_success());
    assert!(out.output_present);
    let id = out.buffer_id.unwrap();
    // The picture was reconstructed straight into the host buffer.
    assert!(buffers[id].planes[0].lock()[..W as usize].iter().all(|&b| b == 77));

    let holders = decoder.holders().unwrap();
    assert_eq!(holders[id], Holders::REFERENCE | Holders::DISPLAY);
    decoder.release_display_frame(id).unwrap();
    assert_eq!(decoder.holders().unwrap()[id], Holders::REFERENCE);
    decoder.release_display_frame(id).unwrap();
    assert_eq!(decoder.holders().unwrap()[id], Holders::REFERENCE);

    assert_eq!(
        decoder.release_display_frame(capacity).unwrap_err().cause(),
        Cause::InvalidBufferId
    );
}

#[test]
fn shared_semi_planar_interleaves_into_host_buffer() {
    let config = config()
        .with_output_format(ColorFormat::Yuv420SpVu)
        .with_shared_display_buffers(true);
    let mut decoder = init(&config);
    let capacity = decoder.holders().unwrap().len();
    let sizes = ColorFormat::Yuv420SpVu.min_plane_sizes(W as u32, H as u32);
    let buffers: Vec<DisplayBuffer> = (0..capacity)
        .map(|_| {
            DisplayBuffer::new(vec![
                BytesMut::zeroed(sizes[0] as usize),
                BytesMut::zeroed(sizes[1] as usize),
            ])
        })
        .collect();
    decoder.set_display_frame(buffers.clone()).unwrap();
    for id in 0..capacity {
        decoder.release_display_frame(id).unwrap();
    }

    let stream = StreamWriter::new()
        .sequence(W, H)
        .picture(PictureType::I, true, 0, TOTAL_MBS, 100)
        .build();
    let out = decoder.decode(DecodeInput::new(&stream)).unwrap();
    let id = out.buffer_id.unwrap();
    let (cb, cr) = chroma_values(100);
    let chroma = buffers[id].planes[1].lock();
    assert_eq!(&chroma[..4], &[cr, cb, cr, cb]);
}

#[test]
fn undersized_display_buffers_are_rejected() {
    let config = config().with_shared_display_buffers(true);
    let mut decoder = init(&config);
    let buffers = vec![DisplayBuffer::new(vec![BytesMut::zeroed(16)])];
    assert_eq!(
        decoder.set_display_frame(buffers).unwrap_err().cause(),
        Cause::OutputBufferTooSmall
    );
}

#[test]
fn mpeg2_outputs_in_presentation_order() {
    let config = DecoderConfig::new(Codec::Mpeg2, W as u32, H as u32);
    let mut decoder = init(&config);
    let stream = StreamWriter::new()
        .sequence(W, H)
        .picture(PictureType::I, true, 0, TOTAL_MBS, 10)
        .picture(PictureType::P, true, 4, TOTAL_MBS, 30)
        .picture(PictureType::B, false, 2, TOTAL_MBS, 20)
        .picture(PictureType::P, true, 6, TOTAL_MBS, 40)
        .build();

    let mut order: Vec<_> = decode_all(&mut decoder, &stream)
        .into_iter()
        .filter(|o| o.output_present)
        .map(|o| o.picture_type.unwrap())
        .collect();
    order.extend(drain(&mut decoder).iter().map(|o| o.picture_type.unwrap()));
    assert_eq!(
        order,
        vec![
            PictureType::I,
            PictureType::B,
            PictureType::P,
            PictureType::P
        ]
    );
}

#[test]
fn decode_order_converts_progressively() {
    let config = DecoderConfig::new(Codec::H264, W as u32, 48)
        .with_ref_frames(1)
        .with_reorder_frames(0);
    let mut decoder = init(&config);
    decoder
        .set_params(DecodeParams {
            output_order: OutputOrder::Decode,
            ..Default::default()
        })
        .unwrap();
    // Three macroblock rows: the top one is final once the second is deblocked.
    let stream = StreamWriter::new()
        .sequence(W, 48)
        .slice(&slice(PictureType::I, 0, 0, 4), &[50])
        .slice(&slice(PictureType::I, 0, 4, 4), &[150])
        .slice(&slice(PictureType::I, 0, 8, 4), &[150])
        .build();
    let mut planes = host_planes(&decoder);
    let out = decode_into(&mut decoder, &stream, &mut planes);
    assert!(out.is_success());
    assert!(out.output_present);
    let stride = W as usize;
    assert_eq!(planes[0][0], 50);
    // The edge between the first two rows is too strong to filter.
    assert_eq!(planes[0][15 * stride], 50);
    assert_eq!(planes[0][16 * stride], 150);
    assert_eq!(planes[0][47 * stride + stride - 1], 150);
}

#[test]
fn worker_threads_produce_identical_pictures() {
    let stream = StreamWriter::new()
        .sequence(W, H)
        .slice(&slice(PictureType::I, 0, 0, 4), &[100])
        .slice(&slice(PictureType::I, 0, 4, 4), &[108])
        .slice(&slice(PictureType::P, 2, 0, 3), &[90])
        .build();

    let mut results = Vec::new();
    for cores in 1..=3 {
        let mut decoder = init(&config());
        decoder.set_num_cores(cores).unwrap();
        let mut planes = host_planes(&decoder);
        let mut pos = 0;
        let mut pictures = Vec::new();
        while pos < stream.len() {
            let out = decode_into(&mut decoder, &stream[pos..], &mut planes);
            pos += out.bytes_consumed;
            if out.output_present {
                pictures.push(planes.clone());
            }
        }
        results.push(pictures);
    }
    assert_eq!(results[0].len(), 2);
    // Rows 15 and 16 were smoothed across the weak edge.
    assert_eq!(results[0][0][0][15 * W as usize], 104);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], results[2]);
}

#[test]
fn skip_deblock_leaves_edges() {
    let mut decoder = init(&config());
    decoder
        .set_degrade(1, DegradePictures::All)
        .unwrap();
    let stream = StreamWriter::new()
        .sequence(W, H)
        .slice(&slice(PictureType::I, 0, 0, 4), &[100])
        .slice(&slice(PictureType::I, 0, 4, 4), &[108])
        .build();
    let mut planes = host_planes(&decoder);
    decode_into(&mut decoder, &stream, &mut planes);
    assert_eq!(planes[0][15 * W as usize], 100);
    assert_eq!(planes[0][16 * W as usize], 108);
}

#[test]
fn non_reference_b_pictures_can_be_skipped() {
    let mut decoder = init(&config());
    decoder
        .set_params(DecodeParams {
            frame_skip: FrameSkip::NonReferenceB,
            ..Default::default()
        })
        .unwrap();
    let stream = StreamWriter::new()
        .sequence(W, H)
        .picture(PictureType::B, false, 0, TOTAL_MBS, 20)
        .build();
    let out = decode(&mut decoder, &stream);
    assert!(out.is_success());
    assert_eq!(out.bytes_consumed, stream.len());
    assert!(!out.output_present);
    assert_eq!(out.error.unwrap().cause(), Cause::FrameSkipped);
    assert_eq!(decoder.get_status().unwrap().frames_decoded, 0);
}

#[test]
fn overlapping_slice_is_dropped() {
    let mut decoder = init(&config());
    let stream = StreamWriter::new()
        .sequence(W, H)
        .slice(&slice(PictureType::I, 0, 0, 4), &[30])
        .slice(
            &SliceHeader {
                first_slice: false,
                ..slice(PictureType::I, 0, 2, 2)
            },
            &[200],
        )
        .slice(&slice(PictureType::I, 0, 4, 4), &[30])
        .build();
    let mut planes = host_planes(&decoder);
    let out = decode_into(&mut decoder, &stream, &mut planes);
    assert!(out.is_success());
    assert!(out.output_present);
    assert!(planes[0].iter().all(|&b| b == 30));
}

#[test]
fn resolution_change_drains_then_restarts() {
    let mut decoder = init(&config());
    let first = StreamWriter::new()
        .sequence(W, H)
        .picture(PictureType::I, true, 0, TOTAL_MBS, 20)
        .build();
    decode_all(&mut decoder, &first);

    let second = StreamWriter::new()
        .sequence(48, 32)
        .picture(PictureType::I, true, 0, 6, 20)
        .build();
    let out = decode(&mut decoder, &second);
    assert!(out.failed);
    assert_eq!(out.bytes_consumed, 0);
    let err = out.error.unwrap();
    assert_eq!(err.cause(), Cause::ResolutionChanged);
    assert!(err.is_resolution_change());
    assert!(!err.needs_renegotiation());

    assert!(drain(&mut decoder).is_empty());
    let out = decode(&mut decoder, &second);
    assert!(out.is_success());
    assert!(out.output_present);
    assert_eq!(out.resolution, Some(Resolution::new(48, 32)));
}

#[test]
fn oversized_stream_needs_renegotiation() {
    let mut decoder = init(&config());
    let stream = StreamWriter::new()
        .sequence(W * 2, H)
        .picture(PictureType::I, true, 0, TOTAL_MBS * 2, 20)
        .build();
    let out = decode(&mut decoder, &stream);
    assert!(out.failed);
    let err = out.error.unwrap();
    assert_eq!(err.cause(), Cause::ActualResolutionGreaterThanInit);
    assert!(err.needs_renegotiation());
    assert!(err.is_fatal());
    assert!(!err.is_resolution_change());
}

#[test]
fn reset_forgets_the_stream() {
    let mut decoder = init(&config());
    let stream = StreamWriter::new()
        .sequence(W, H)
        .picture(PictureType::I, true, 0, TOTAL_MBS, 20)
        .build();
    decode_all(&mut decoder, &stream);
    assert!(decoder.holders().unwrap().iter().any(|h| !h.is_empty()));

    decoder.reset().unwrap();
    assert!(decoder.holders().unwrap().iter().all(|h| h.is_empty()));
    let status = decoder.get_status().unwrap();
    assert_eq!(status.resolution, None);
    assert_eq!(status.frames_decoded, 0);

    // Slices need a new sequence header.
    let picture = StreamWriter::new()
        .picture(PictureType::I, true, 0, TOTAL_MBS, 20)
        .build();
    let out = decode(&mut decoder, &picture);
    assert_eq!(out.error.unwrap().cause(), Cause::InvalidParamSet);
    assert!(!out.output_present);
}

#[test]
fn chunked_input_is_consumed_monotonically() {
    let mut writer = StreamWriter::new();
    writer.sequence(W, H);
    for i in 0..6 {
        let picture_type = if i == 0 { PictureType::I } else { PictureType::P };
        writer.picture(picture_type, true, 2 * i, TOTAL_MBS, 10 + i as u8);
    }
    let stream = writer.build();

    let mut decoder = init(&config());
    let mut pending = Vec::new();
    let mut fed = 0;
    let mut outputs = Vec::new();
    for chunk in stream.chunks(7) {
        pending.extend_from_slice(chunk);
        fed += chunk.len();
        let out = decode(&mut decoder, &pending);
        assert!(out.bytes_consumed <= pending.len());
        if out.failed {
            assert_eq!(out.bytes_consumed, 0);
            assert!(out
                .error
                .unwrap()
                .severity()
                .contains(Severity::INSUFFICIENT_DATA));
        }
        pending.drain(..out.bytes_consumed);
        if out.output_present {
            outputs.push(out.picture_type.unwrap());
        }
    }
    assert_eq!(fed, stream.len());
    while !pending.is_empty() {
        let out = decode(&mut decoder, &pending);
        assert!(out.bytes_consumed > 0);
        pending.drain(..out.bytes_consumed);
        if out.output_present {
            outputs.push(out.picture_type.unwrap());
        }
    }
    assert_eq!(outputs.len(), 6);
}

#[test]
fn pool_holders_stay_consistent() {
    let config = DecoderConfig::new(Codec::H264, W as u32, H as u32)
        .with_ref_frames(2)
        .with_reorder_frames(1);
    let req = Requirements::resolve(&config).unwrap();
    let mut decoder = init(&config);
    let mut writer = StreamWriter::new();
    writer.sequence(W, H);
    let types = [PictureType::I, PictureType::P, PictureType::B, PictureType::P];
    for (i, &t) in types.iter().cycle().take(20).enumerate() {
        writer.picture(t, t != PictureType::B, i as i32, TOTAL_MBS, i as u8);
    }
    let stream = writer.build();

    let mut pos = 0;
    while pos < stream.len() {
        let out = decode(&mut decoder, &stream[pos..]);
        assert!(out.is_success());
        pos += out.bytes_consumed;
        let holders = decoder.holders().unwrap();
        assert_eq!(holders.len(), req.pool_capacity);
        let references = holders
            .iter()
            .filter(|h| h.contains(Holders::REFERENCE))
            .count();
        assert!(references <= req.reference_window);
        // Host-buffer mode never leaves pictures with the host or mid-decode between calls.
        assert!(holders.iter().all(|h| !h.contains(Holders::IO)));
        let queued = holders
            .iter()
            .filter(|h| h.contains(Holders::DISPLAY))
            .count();
        assert!(queued <= req.display_depth);
    }
    assert_eq!(drain(&mut decoder).len(), req.display_depth);
    assert!(decoder.holders().unwrap().iter().all(|h| h.is_empty()));
}
