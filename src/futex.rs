//! Futex-обёртки для serial-слов, живущих в shared-маппингах.
//!
//! Операции shared (без FUTEX_PRIVATE_FLAG): ждущий и будящий — разные
//! процессы, слово лежит в mmap-файле. Ожидание — с относительным таймаутом.
//! Вне Linux — деградация в опрос со сном (для тестов и портируемости).

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Результат ожидания: слово могло измениться, либо истёк таймаут.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexWait {
    /// Разбудили, слово отличается от ожидаемого, либо сравнение не прошло
    /// сразу — вызывающий перечитывает слово и решает сам.
    Woken,
    TimedOut,
}

#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    let ts;
    let ts_ptr = match timeout {
        Some(d) => {
            ts = libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => std::ptr::null(),
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            0usize,
            0u32,
        )
    };
    if rc == 0 {
        return FutexWait::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ETIMEDOUT) => FutexWait::TimedOut,
        // EAGAIN: слово уже != expected; EINTR: перечитать и, если надо,
        // заснуть снова — решает вызывающий цикл.
        _ => FutexWait::Woken,
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            0usize,
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    let started = Instant::now();
    let tick = Duration::from_millis(1);
    loop {
        if word.load(Ordering::Acquire) != expected {
            return FutexWait::Woken;
        }
        if let Some(t) = timeout {
            if started.elapsed() >= t {
                return FutexWait::TimedOut;
            }
        }
        std::thread::sleep(tick);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake_all(_word: &AtomicU32) {}
