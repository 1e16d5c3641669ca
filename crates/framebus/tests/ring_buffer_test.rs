use framebus::{BufferError, BusConfig, Frame, FrameShape, Origin, RingBuffer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Temporary shm directory plus a semaphore namespace unique to this test.
fn test_config() -> (TempDir, BusConfig) {
    let dir = tempdir().unwrap();
    let config = BusConfig {
        shm_dir: dir.path().to_path_buf(),
        namespace: format!(
            "fbit{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ),
        read_timeout: Duration::from_millis(50),
        ..BusConfig::default()
    };
    (dir, config)
}

fn uniform(shape: FrameShape, value: u8) -> Frame {
    Frame::from_elem(shape.dim(), value)
}

#[test]
fn test_write_then_force_read_round_trip() {
    let (_dir, config) = test_config();
    let shape = FrameShape::rgb(48, 64);
    let mut writer = RingBuffer::create(&config, "cam", shape).unwrap();
    let mut reader = RingBuffer::attach(&config, "cam", shape).unwrap();

    let frame = Frame::from_shape_fn(shape.dim(), |(y, x, c)| (y + x * 2 + c * 40) as u8);
    writer.write(&frame).unwrap();

    assert_eq!(reader.force_read().unwrap(), Some(frame.clone()));
    // Reading does not consume anything for other readers
    assert_eq!(writer.force_read().unwrap(), Some(frame));

    writer.unlink().unwrap();
}

#[test]
fn test_attach_missing_buffer_is_not_found() {
    let (_dir, config) = test_config();
    let result = RingBuffer::attach(&config, "ghost", FrameShape::rgb(4, 4));
    assert!(matches!(result, Err(BufferError::NotFound(_))));
}

#[test]
fn test_attach_with_wrong_shape_is_rejected() {
    let (_dir, config) = test_config();
    let mut writer = RingBuffer::create(&config, "cam", FrameShape::rgb(4, 4)).unwrap();
    let result = RingBuffer::attach(&config, "cam", FrameShape::rgb(8, 8));
    assert!(matches!(result, Err(BufferError::SizeMismatch { .. })));
    writer.unlink().unwrap();
}

#[test]
fn test_shape_mismatch_leaves_slots_unchanged() {
    let (_dir, config) = test_config();
    let shape = FrameShape::rgb(8, 8);
    let mut buffer = RingBuffer::create(&config, "cam", shape).unwrap();

    buffer.write(&uniform(shape, 42)).unwrap();
    let sequence = buffer.sequence().unwrap();
    let index = buffer.write_index().unwrap();

    let wrong = Frame::from_elem((8, 9, 3), 200);
    match buffer.write(&wrong) {
        Err(BufferError::ShapeMismatch { expected, actual }) => {
            assert_eq!(expected, shape);
            assert_eq!(actual, FrameShape::rgb(8, 9));
        }
        other => panic!("Expected ShapeMismatch, got {other:?}"),
    }

    assert_eq!(buffer.sequence().unwrap(), sequence);
    assert_eq!(buffer.write_index().unwrap(), index);
    assert_eq!(buffer.force_read().unwrap(), Some(uniform(shape, 42)));

    buffer.unlink().unwrap();
}

#[test]
fn test_create_with_other_size_leaves_live_writer_alone() {
    let (_dir, config) = test_config();
    let shape = FrameShape::rgb(4, 4);
    let mut writer = RingBuffer::create(&config, "cam", shape).unwrap();
    writer.write(&uniform(shape, 10)).unwrap();

    assert!(matches!(
        RingBuffer::create(&config, "cam", FrameShape::rgb(8, 8)),
        Err(BufferError::SizeMismatch { .. })
    ));

    writer.write(&uniform(shape, 200)).unwrap();
    writer.write(&uniform(shape, 201)).unwrap();

    let (mut reader, inferred) = RingBuffer::blind_attach(&config, "cam").unwrap();
    assert_eq!(inferred.shape, shape);
    assert_eq!(reader.sequence().unwrap(), 3);
    assert_eq!(reader.force_read().unwrap(), Some(uniform(shape, 201)));

    writer.unlink().unwrap();
}

#[test]
fn test_unlink_twice_from_two_handles() {
    let (_dir, config) = test_config();
    let shape = FrameShape::rgb(4, 4);
    let mut owner = RingBuffer::create(&config, "cam", shape).unwrap();
    let mut other = RingBuffer::attach(&config, "cam", shape).unwrap();

    owner.unlink().unwrap();
    owner.unlink().unwrap();
    other.unlink().unwrap();
    other.unlink().unwrap();

    assert!(!RingBuffer::exists(&config, "cam"));
    assert!(!RingBuffer::unlink_by_name(&config, "cam").unwrap());
}

#[test]
fn test_stalled_writer_keeps_serving_last_frame() {
    let (_dir, config) = test_config();
    let shape = FrameShape::rgb(16, 16);
    let mut writer = RingBuffer::create(&config, "cam", shape).unwrap();
    let mut reader = RingBuffer::attach(&config, "cam", shape).unwrap();

    writer.write(&uniform(shape, 77)).unwrap();
    let written_at = reader.last_write().unwrap();

    for _ in 0..20 {
        thread::sleep(Duration::from_millis(5));
        assert_eq!(reader.force_read().unwrap(), Some(uniform(shape, 77)));
    }

    // Recency stays observable so callers can apply their own staleness policy
    assert_eq!(reader.last_write(), Some(written_at));
    assert!(written_at.elapsed().unwrap() >= Duration::from_millis(100));

    writer.unlink().unwrap();
}

#[test]
fn test_read_delivers_new_frames_across_handles() {
    let (_dir, config) = test_config();
    let shape = FrameShape::rgb(4, 4);
    let mut writer = RingBuffer::create(&config, "cam", shape).unwrap();
    let mut reader = RingBuffer::attach(&config, "cam", shape).unwrap();

    assert_eq!(reader.read().unwrap(), None);

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        writer.write(&uniform(shape, 9)).unwrap();
        writer
    });

    let mut received = None;
    for _ in 0..20 {
        if let Some(frame) = reader.read().unwrap() {
            received = Some(frame);
            break;
        }
    }
    assert_eq!(received, Some(uniform(shape, 9)));
    assert_eq!(reader.read().unwrap(), None);

    let mut writer = handle.join().unwrap();
    writer.unlink().unwrap();
}

#[test]
fn test_concurrent_force_reads_never_tear() {
    let (_dir, mut config) = test_config();
    config.lock_timeout = Duration::from_secs(5);
    let shape = FrameShape::rgb(120, 160);
    let mut writer = RingBuffer::create(&config, "cam", shape).unwrap();
    writer.write(&uniform(shape, 0)).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let config = config.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reader = RingBuffer::attach(&config, "cam", shape).unwrap();
                let mut reads = 0usize;
                loop {
                    let frame = reader.force_read().unwrap().unwrap();
                    let first = frame[[0, 0, 0]];
                    assert!(
                        frame.iter().all(|&b| b == first),
                        "Frame mixes pixels from two writes"
                    );
                    reads += 1;
                    if done.load(Ordering::SeqCst) {
                        return reads;
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            })
        })
        .collect();

    for value in 1..=200u8 {
        writer.write(&uniform(shape, value)).unwrap();
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(writer.force_read().unwrap(), Some(uniform(shape, 200)));

    writer.unlink().unwrap();
}

#[test]
fn test_black_then_white_seen_by_independent_readers() {
    let (_dir, config) = test_config();
    let shape = FrameShape::rgb(480, 640);
    let mut writer = RingBuffer::create(&config, "cam", shape).unwrap();

    writer.write(&uniform(shape, 0)).unwrap();
    writer.write(&uniform(shape, 255)).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let (mut reader, inferred) = RingBuffer::blind_attach(&config, "cam").unwrap();
                assert_eq!(inferred.shape, shape);
                assert!(matches!(reader.origin(), Origin::BlindAttached(_)));
                barrier.wait();
                reader.force_read().unwrap().unwrap()
            })
        })
        .collect();

    for reader in readers {
        let frame = reader.join().unwrap();
        assert!(frame.iter().all(|&b| b == 255));
    }

    writer.unlink().unwrap();
}

#[test]
fn test_recreate_after_unlink_starts_empty() {
    let (_dir, config) = test_config();
    let shape = FrameShape::rgb(4, 4);
    let mut first = RingBuffer::create(&config, "cam", shape).unwrap();
    first.write(&uniform(shape, 50)).unwrap();
    first.unlink().unwrap();

    let mut second = RingBuffer::create(&config, "cam", shape).unwrap();
    assert_eq!(second.origin(), Origin::Created);
    assert_eq!(second.sequence().unwrap(), 0);
    assert_eq!(second.force_read().unwrap(), None);
    second.unlink().unwrap();
}
