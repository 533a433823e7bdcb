use burnr_core::device::{BlockDevice, FileBlockDevice, IoOp, MemoryBlockDevice};
use burnr_core::error::StreamError;
use burnr_core::watchdog::timeout_watchdog;
use burnr_core::write_behind::WriteBehindStream;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

#[test]
fn random_sized_writes_land_in_order() {
    let mut rng = StdRng::seed_from_u64(42);
    for block_size in [512usize, 666, 4096] {
        let device = Arc::new(MemoryBlockDevice::new(64, block_size));
        let image = random_bytes(block_size * 50 + 17, block_size as u64);
        let mut stream = WriteBehindStream::new(device.clone(), 4, 3, None).unwrap();

        let mut rest = &image[..];
        while !rest.is_empty() {
            let n = rng.gen_range(1..=3 * block_size).min(rest.len());
            stream.write(&rest[..n]).unwrap();
            rest = &rest[n..];
        }
        stream.close().unwrap();

        let contents = device.contents();
        assert_eq!(&contents[..image.len()], &image[..]);
        assert!(contents[image.len()..].iter().all(|&b| b == 0));

        let writes: Vec<_> = device
            .journal()
            .into_iter()
            .filter(|(op, _, _)| *op == IoOp::Write)
            .collect();
        for pair in writes.windows(2) {
            let (_, first, blocks) = pair[0];
            assert_eq!(pair[1].1, first + blocks, "block size {block_size}");
        }
    }
}

#[test]
fn overflow_fails_exactly_at_capacity() {
    let device = Arc::new(MemoryBlockDevice::new(8, 512));
    let capacity = device.capacity();
    let mut stream = WriteBehindStream::new(device.clone(), 2, 2, None).unwrap();

    stream.write(&vec![1u8; capacity as usize - 10]).unwrap();
    match stream.write(&[2u8; 20]) {
        Err(StreamError::NoSpace { offset }) => assert_eq!(offset, capacity),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(stream.position(), capacity);
    assert!(matches!(stream.write(&[3u8]), Err(StreamError::NoSpace { .. })));
    stream.close().unwrap();

    let contents = device.contents();
    assert_eq!(contents[capacity as usize - 11], 1);
    assert!(contents[capacity as usize - 10..].iter().all(|&b| b == 2));
}

#[test]
fn filling_the_device_exactly_succeeds() {
    let device = Arc::new(MemoryBlockDevice::new(6, 4096));
    let image = random_bytes(device.capacity() as usize, 7);
    let mut stream = WriteBehindStream::new(device.clone(), 4, 2, None).unwrap();
    stream.write(&image).unwrap();
    stream.close().unwrap();
    assert_eq!(device.contents(), image);
}

#[test]
fn std_write_all_reports_storage_full() {
    let device = Arc::new(MemoryBlockDevice::new(4, 512));
    let mut stream = WriteBehindStream::new(device, 2, 2, None).unwrap();
    let err = stream.write_all(&[0u8; 4096]).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::StorageFull);
    assert!(err.to_string().contains("No space left on device"));
    assert_eq!(stream.position(), 2048);
}

#[test]
fn seek_resumes_a_write_in_place() {
    let device = Arc::new(MemoryBlockDevice::new(32, 512));
    let image = random_bytes(512 * 30, 9);

    let mut first = WriteBehindStream::new(device.clone(), 4, 2, None).unwrap();
    first.write(&image[..512 * 12]).unwrap();
    first.close().unwrap();

    let resume = 512 * 8;
    let mut second = WriteBehindStream::new(device.clone(), 4, 2, None).unwrap();
    assert_eq!(second.seek(resume as u64).unwrap(), resume as u64);
    second.write(&image[resume..]).unwrap();
    second.close().unwrap();

    assert_eq!(&device.contents()[..image.len()], &image[..]);
}

#[test]
fn unaligned_seek_preserves_neighbouring_bytes() {
    let device = Arc::new(MemoryBlockDevice::new(4, 666));
    device.fill_with(|_| 0xEE);
    let mut stream = WriteBehindStream::new(device.clone(), 2, 2, None).unwrap();

    stream.seek(1000).unwrap();
    stream.write(&[0x11; 50]).unwrap();
    stream.close().unwrap();

    let contents = device.contents();
    assert!(contents[..1000].iter().all(|&b| b == 0xEE));
    assert!(contents[1000..1050].iter().all(|&b| b == 0x11));
    assert!(contents[1050..].iter().all(|&b| b == 0xEE));
}

#[test]
fn device_failure_is_reported_with_the_confirmed_offset() {
    let device = Arc::new(MemoryBlockDevice::new(64, 512));
    device.fail_from_block(24, "device unplugged");
    let mut stream = WriteBehindStream::new(device.clone(), 8, 2, None).unwrap();

    let image = random_bytes(512 * 64, 11);
    let err = image
        .chunks(4096)
        .try_for_each(|chunk| stream.write(chunk))
        .and_then(|()| stream.flush())
        .unwrap_err();

    assert!(matches!(err, StreamError::Device { block: 24, .. }));
    assert_eq!(stream.confirmed(), 512 * 24);
    assert_eq!(&device.contents()[..512 * 24], &image[..512 * 24]);
    stream.close().unwrap();
}

#[test]
fn stalled_device_trips_the_watchdog() {
    let device = Arc::new(MemoryBlockDevice::new(64, 512));
    device.stall_at_block(16, Duration::from_secs(2));

    let started = Instant::now();
    let result: Result<(), StreamError> = timeout_watchdog(Duration::from_millis(150), |watchdog| {
        let mut stream = WriteBehindStream::new(device.clone(), 8, 2, Some(watchdog.clone())).unwrap();
        for _ in 0..64 {
            stream.write(&[0u8; 512])?;
        }
        stream.flush()
    });

    assert!(matches!(result, Err(StreamError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[test]
fn file_backed_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&vec![0u8; 4096 * 16]).unwrap();
    file.flush().unwrap();

    let device = Arc::new(FileBlockDevice::open(file.path(), Some(4096)).unwrap());
    let image = random_bytes(4096 * 10 + 99, 13);
    let mut stream = WriteBehindStream::new(device, 4, 2, None).unwrap();
    stream.write(&image).unwrap();
    stream.close().unwrap();

    let on_disk = std::fs::read(file.path()).unwrap();
    assert_eq!(&on_disk[..image.len()], &image[..]);
    assert!(on_disk[image.len()..].iter().all(|&b| b == 0));
}
