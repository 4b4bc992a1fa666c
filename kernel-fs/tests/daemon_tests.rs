//! 周期写回与预读守护例程测试

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{pattern, MockBlockDevice, StdSemaphore, StdSleeper};
use kernel_fs::{read_ahead, write_behind, BufferCache, SECTOR_SZ, WRITE_BEHIND_INTERVAL};

fn spawn_write_behind(cache: &Arc<BufferCache>, interval: Duration) -> thread::JoinHandle<()> {
    let cache = cache.clone();
    thread::spawn(move || write_behind(&cache, &StdSleeper, interval))
}

fn spawn_read_ahead(
    cache: &Arc<BufferCache>,
    signal: &Arc<StdSemaphore>,
) -> thread::JoinHandle<()> {
    let cache = cache.clone();
    let signal = signal.clone();
    thread::spawn(move || read_ahead(&cache, signal))
}

/// 轮询直到条件成立，超时返回 false
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn test_default_interval_is_one_second() {
    assert_eq!(WRITE_BEHIND_INTERVAL, Duration::from_secs(1));
}

#[test]
fn test_write_behind_flushes_dirty_sectors() {
    let device = MockBlockDevice::new(64);
    let cache = Arc::new(BufferCache::with_capacity(device.clone(), 8));
    let daemon = spawn_write_behind(&cache, Duration::from_millis(5));

    cache.write_at(4, &pattern(4), 0);
    assert!(wait_until(Duration::from_secs(5), || device.raw(4) == pattern(4).to_vec()));

    cache.shutdown();
    daemon.join().unwrap();
}

#[test]
fn test_read_ahead_warms_cache() {
    let device = MockBlockDevice::new(64);
    let cache = Arc::new(BufferCache::with_capacity(device.clone(), 8));
    let daemon = spawn_read_ahead(&cache, &StdSemaphore::new());

    cache.request_read_ahead(20);
    cache.request_read_ahead(21);
    assert!(wait_until(Duration::from_secs(5), || {
        cache.is_cached(20) && cache.is_cached(21)
    }));
    assert_eq!(cache.pending_read_ahead(), 0);

    cache.shutdown();
    daemon.join().unwrap();
    assert_eq!(device.reads(), 2);
}

#[test]
fn test_read_ahead_blocks_until_woken() {
    let device = MockBlockDevice::new(64);
    let cache = Arc::new(BufferCache::with_capacity(device.clone(), 8));
    let signal = StdSemaphore::new();
    let daemon = spawn_read_ahead(&cache, &signal);

    // 队列为空：守护例程阻塞在信号量上，不空转
    assert!(wait_until(Duration::from_secs(5), || signal.waiting() == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(signal.downs(), 1);
    assert_eq!(device.reads(), 0);

    cache.request_read_ahead(20);
    assert!(wait_until(Duration::from_secs(5), || cache.is_cached(20)));
    assert!(wait_until(Duration::from_secs(5), || signal.waiting() == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(signal.downs(), 2);
    assert_eq!(device.reads(), 1);

    cache.shutdown();
    daemon.join().unwrap();
    assert_eq!(signal.waiting(), 0);
}

#[test]
fn test_read_ahead_sees_requests_queued_before_start() {
    let device = MockBlockDevice::new(64);
    let cache = Arc::new(BufferCache::with_capacity(device.clone(), 8));
    cache.request_read_ahead(30);
    cache.request_read_ahead(31);

    let signal = StdSemaphore::new();
    let daemon = spawn_read_ahead(&cache, &signal);
    assert!(wait_until(Duration::from_secs(5), || {
        cache.is_cached(30) && cache.is_cached(31)
    }));

    cache.shutdown();
    daemon.join().unwrap();
}

#[test]
fn test_read_ahead_exits_when_shut_down_before_start() {
    let device = MockBlockDevice::new(64);
    let cache = Arc::new(BufferCache::with_capacity(device.clone(), 8));
    cache.shutdown();
    spawn_read_ahead(&cache, &StdSemaphore::new()).join().unwrap();
    assert_eq!(device.reads(), 0);
}

#[test]
fn test_shutdown_stops_both_daemons() {
    let device = MockBlockDevice::new(64);
    let cache = Arc::new(BufferCache::with_capacity(device, 8));
    let writer = spawn_write_behind(&cache, Duration::from_millis(5));
    let reader = spawn_read_ahead(&cache, &StdSemaphore::new());
    thread::sleep(Duration::from_millis(20));

    cache.shutdown();
    assert!(cache.is_shut_down());
    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn test_write_behind_never_tears_concurrent_reads() {
    let device = MockBlockDevice::new(64);
    for sector in 8..24u32 {
        device.set_raw(sector, &[sector as u8; SECTOR_SZ]);
    }
    let cache = Arc::new(BufferCache::with_capacity(device.clone(), 8));
    let daemon = spawn_write_behind(&cache, Duration::from_millis(1));
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let cache = cache.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut value = 0u8;
            while !stop.load(Ordering::SeqCst) {
                for sector in 0..4u32 {
                    cache.write_at(sector, &[value; SECTOR_SZ], 0);
                }
                value = value.wrapping_add(1);
            }
        })
    };
    let readers: Vec<_> = (0..3u32)
        .map(|r| {
            let cache = cache.clone();
            thread::spawn(move || {
                let mut buf = [0u8; SECTOR_SZ];
                for i in 0..2000u32 {
                    let sector = 8 + (r * 5 + i) % 16;
                    cache.read_at(sector, &mut buf, 0);
                    assert!(buf.iter().all(|&b| b == sector as u8), "torn read of {}", sector);
                    cache.read_at(i % 4, &mut buf, 0);
                    assert!(buf.iter().all(|&b| b == buf[0]), "torn read of {}", i % 4);
                }
            })
        })
        .collect();

    for reader in readers {
        reader.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    writer.join().unwrap();
    cache.shutdown();
    daemon.join().unwrap();

    cache.flush_all();
    for sector in 0..4u32 {
        let raw = device.raw(sector);
        assert!(raw.iter().all(|&b| b == raw[0]), "torn sector {} on disk", sector);
    }
}
