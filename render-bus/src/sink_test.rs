use std::io::{Seek, SeekFrom, Write};

use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{ChunkedSink, SEGMENT_SIZE, SinkWriter, shared};

fn apply(model: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if model.len() < offset + data.len() {
        model.resize(offset + data.len(), 0);
    }
    model[offset..offset + data.len()].copy_from_slice(data);
}

#[test]
fn test_sequential_writes_concatenate() {
    let mut sink = ChunkedSink::with_segment_size(8);
    sink.write(0, b"hello ").unwrap();
    sink.write(6, b"segmented ").unwrap();
    sink.write(16, b"world").unwrap();
    assert_eq!(sink.len(), 21);
    assert_eq!(sink.segment_count(), 3);
    let out = sink.finalize().unwrap();
    assert_eq!(&out[..], b"hello segmented world");
}

#[test]
fn test_write_straddling_boundary() {
    let mut sink = ChunkedSink::with_segment_size(16);
    let data: Vec<u8> = (0..40).collect();
    sink.write(10, &data).unwrap();

    let mut model = Vec::new();
    apply(&mut model, 10, &data);
    assert_eq!(sink.len(), 50);
    assert_eq!(sink.finalize().unwrap().to_vec(), model);
}

#[test]
fn test_gaps_read_back_as_zero() {
    let mut sink = ChunkedSink::with_segment_size(16);
    sink.write(0, &[1, 2, 3]).unwrap();
    sink.write(40, &[9]).unwrap();

    let out = sink.finalize().unwrap();
    assert_eq!(out.len(), 41);
    assert_eq!(&out[..3], &[1, 2, 3]);
    assert!(out[3..40].iter().all(|b| *b == 0));
    assert_eq!(out[40], 9);
}

#[test]
fn test_descending_writes() {
    let mut sink = ChunkedSink::with_segment_size(4);
    let mut model = Vec::new();
    for i in (0..10u8).rev() {
        let chunk = [i; 3];
        sink.write(i as u64 * 3, &chunk).unwrap();
        apply(&mut model, i as usize * 3, &chunk);
    }
    assert_eq!(sink.finalize().unwrap().to_vec(), model);
}

#[test]
fn test_interior_segments_freeze() {
    let mut sink = ChunkedSink::with_segment_size(8);
    sink.write(0, &[7u8; 8 * 4 + 2]).unwrap();
    assert_eq!(sink.segment_count(), 5);
    // first and last stay open
    assert_eq!(sink.frozen_segments(), 3);

    sink.write(9, &[1, 1]).unwrap();
    assert_eq!(sink.frozen_segments(), 3);

    let out = sink.finalize().unwrap();
    assert_eq!(&out[8..12], &[7, 1, 1, 7]);
}

#[test]
fn test_random_writes_match_model() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for segment_size in [1usize, 3, 16, 64] {
        let mut sink = ChunkedSink::with_segment_size(segment_size);
        let mut model = Vec::new();
        for _ in 0..300 {
            let offset = rng.gen_range(0..512usize);
            let len = rng.gen_range(1..48usize);
            let data: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            sink.write(offset as u64, &data).unwrap();
            apply(&mut model, offset, &data);
            assert_eq!(sink.len(), model.len() as u64);
        }
        assert_eq!(
            sink.finalize().unwrap().to_vec(),
            model,
            "segment size {}",
            segment_size
        );
    }
}

#[test]
fn test_empty_sink_finalizes_empty() {
    let sink = ChunkedSink::new();
    assert!(sink.is_empty());
    assert!(sink.finalize().unwrap().is_empty());
}

#[test]
fn test_writer_patches_header() {
    let sink = shared(ChunkedSink::with_segment_size(16));
    let mut writer = SinkWriter::new(sink.clone());
    writer.write_all(&[0u8; 4]).unwrap();
    writer.write_all(&[0xAA; 30]).unwrap();
    assert_eq!(writer.position(), 34);

    writer.seek(SeekFrom::Start(0)).unwrap();
    writer.write_all(&34u32.to_be_bytes()).unwrap();
    assert_eq!(writer.seek(SeekFrom::End(0)).unwrap(), 34);
    assert_eq!(writer.seek(SeekFrom::Current(-2)).unwrap(), 32);
    assert!(writer.seek(SeekFrom::Current(-100)).is_err());
    drop(writer);

    let sink = std::sync::Arc::try_unwrap(sink)
        .ok()
        .unwrap()
        .into_inner()
        .unwrap();
    let out = sink.finalize().unwrap();
    assert_eq!(&out[..4], &34u32.to_be_bytes());
    assert!(out[4..].iter().all(|b| *b == 0xAA));
}

#[test]
fn test_full_size_segment_boundary() {
    let mut sink = ChunkedSink::new();
    let offset = SEGMENT_SIZE as u64 - 3;
    sink.write(offset, &[1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(sink.segment_count(), 2);
    assert_eq!(sink.len(), SEGMENT_SIZE as u64 + 3);

    let out = sink.finalize().unwrap();
    assert_eq!(out.len(), SEGMENT_SIZE + 3);
    assert_eq!(&out[SEGMENT_SIZE - 3..], &[1, 2, 3, 4, 5, 6]);
    assert_eq!(out[0], 0);
}
