//! 缓冲缓存的后台守护例程
//!
//! 本 crate 不创建线程：内核为每个例程各起一个线程，
//! 并通过 `Sleeper` 与 `Semaphore` 提供阻塞能力。

use alloc::sync::Arc;
use core::time::Duration;

use crate::block_cache::BufferCache;

/// 周期写回的默认间隔
pub const WRITE_BEHIND_INTERVAL: Duration = Duration::from_secs(1);

/// 调度器提供的定时睡眠
pub trait Sleeper: Send + Sync {
    /// 睡眠至少 `duration`
    fn sleep(&self, duration: Duration);
}

/// 调度器提供的计数信号量
pub trait Semaphore: Send + Sync {
    /// 计数为 0 时阻塞当前线程，否则减一
    fn down(&self);

    /// 计数加一，唤醒一个等待者
    fn up(&self);
}

/// 周期写回：每隔 `interval` 把所有脏槽写回设备，直到缓存被关闭
pub fn write_behind(cache: &BufferCache, sleeper: &dyn Sleeper, interval: Duration) {
    log::info!("write-behind daemon started, interval {:?}", interval);
    while !cache.is_shut_down() {
        cache.flush_all();
        sleeper.sleep(interval);
    }
    log::info!("write-behind daemon stopped");
}

/// 预读：在 `signal` 上阻塞等待请求，按 FIFO 顺序把扇区装入缓存，直到缓存被关闭
pub fn read_ahead(cache: &BufferCache, signal: Arc<dyn Semaphore>) {
    cache.attach_read_ahead(Arc::clone(&signal));
    log::info!("read-ahead daemon started");
    loop {
        signal.down();
        if cache.is_shut_down() {
            break;
        }
        if let Some(sector) = cache.next_read_ahead() {
            cache.prefetch(sector);
        }
    }
    log::info!("read-ahead daemon stopped");
}
