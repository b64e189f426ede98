//! Display surface and background tasks
//!
//! The interpreter draws into a [`Display`] that it shares with a refresh
//! thread. The refresh thread wakes every 15 ms, services at most one
//! mailbox request (resize, title, fullscreen) and presents the current
//! frame. For MODE 7 the display carries a second frame with flashing
//! characters hidden and the refresh thread alternates between the two.
//!
//! A second thread keeps a monotonic centisecond counter for `TIME`.
//! Both threads are omitted in headless mode, where requests are applied
//! synchronously and the clock is read from [`Instant`] directly.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{ErrorKind, Result};

/// Mailbox value once a request has been carried out
const MAILBOX_OK: i32 = -1;
/// Mailbox value when a request failed
const MAILBOX_FAILED: i32 = -2;
/// Mailbox value when nothing is pending
const MAILBOX_IDLE: i32 = -3;

const REFRESH_INTERVAL: Duration = Duration::from_millis(15);
const CLOCK_INTERVAL: Duration = Duration::from_millis(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest surface the refresh task will create
pub const MAX_SURFACE: (usize, usize) = (4096, 4096);

/// Flash cadence: visible for the first 64 of every 96 centiseconds
pub fn flash_visible(centiseconds: u64) -> bool {
    centiseconds % 96 < 64
}

/// When the display is updated from the write bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRefresh {
    On = 0,
    Off = 1,
    /// Off until an error is reported, then on
    OnError = 2,
}

impl AutoRefresh {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => AutoRefresh::Off,
            2 => AutoRefresh::OnError,
            _ => AutoRefresh::On,
        }
    }
}

/// Work for the refresh task
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Resize { width: usize, height: usize, mode: u32 },
    Title(String),
    FullScreen(bool),
}

impl Request {
    fn code(&self) -> i32 {
        match self {
            Request::Resize { mode, .. } => *mode as i32,
            Request::Title(_) => 0x1000,
            Request::FullScreen(_) => 0x1001,
        }
    }
}

/// The screen as the user sees it: RGB pixels at window resolution
#[derive(Debug, Clone)]
pub struct Display {
    pub width: usize,
    pub height: usize,
    /// Pixels as 0xRRGGBB
    pub pixels: Vec<u32>,
    /// Alternate frame with flashing characters hidden
    pub flash_off: Option<Vec<u32>>,
    /// Last presented frame
    pub front: Vec<u32>,
    pub title: String,
    pub fullscreen: bool,
    pub mode: u32,
    /// Frames presented since start
    pub frames: u64,
}

impl Display {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
            flash_off: None,
            front: vec![0; width * height],
            title: String::from("Matrix Brandy Basic VI"),
            fullscreen: false,
            mode: 0,
            frames: 0,
        }
    }

    fn apply(&mut self, request: &Request) -> bool {
        match request {
            Request::Resize { width, height, mode } => {
                if *width == 0 || *height == 0 || *width > MAX_SURFACE.0 || *height > MAX_SURFACE.1 {
                    return false;
                }
                self.width = *width;
                self.height = *height;
                self.mode = *mode;
                self.pixels = vec![0; width * height];
                self.front = vec![0; width * height];
                self.flash_off = None;
            }
            Request::Title(title) => self.title = title.clone(),
            Request::FullScreen(on) => self.fullscreen = *on,
        }
        true
    }

    /// Copy the frame for the current flash phase to the front surface
    pub fn present(&mut self, centiseconds: u64) {
        let source = match &self.flash_off {
            Some(off) if !flash_visible(centiseconds) => off,
            _ => &self.pixels,
        };
        if self.front.len() == source.len() {
            self.front.copy_from_slice(source);
        } else {
            self.front = source.clone();
        }
        self.frames += 1;
    }
}

struct Shared {
    display: Mutex<Display>,
    busy: AtomicBool,
    autorefresh: AtomicU8,
    mailbox: AtomicI32,
    request: Mutex<Option<Request>>,
    /// Set when the write bank has changed since the last present
    dirty: AtomicBool,
    stop: AtomicBool,
    ticks: AtomicU64,
}

/// Handle owned by the interpreter
pub struct Video {
    shared: Arc<Shared>,
    epoch: Instant,
    /// Added to the raw clock so that `TIME=` can set it
    offset: AtomicI64,
    headless: bool,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Video {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Video").field("headless", &self.headless).finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic on another thread leaves the pixels usable
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Video {
    fn with_shared(width: usize, height: usize, headless: bool) -> Self {
        let shared = Arc::new(Shared {
            display: Mutex::new(Display::new(width, height)),
            busy: AtomicBool::new(false),
            autorefresh: AtomicU8::new(AutoRefresh::On as u8),
            mailbox: AtomicI32::new(MAILBOX_IDLE),
            request: Mutex::new(None),
            dirty: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        });
        Self { shared, epoch: Instant::now(), offset: AtomicI64::new(0), headless, threads: Vec::new() }
    }

    /// Synchronous video with no background threads
    pub fn headless(width: usize, height: usize) -> Self {
        Self::with_shared(width, height, true)
    }

    /// Start the clock and refresh threads
    pub fn start(width: usize, height: usize) -> Self {
        let mut video = Self::with_shared(width, height, false);
        let epoch = video.epoch;

        let clock = Arc::clone(&video.shared);
        video.threads.push(thread::spawn(move || {
            while !clock.stop.load(Ordering::Relaxed) {
                let cs = epoch.elapsed().as_millis() as u64 / 10;
                clock.ticks.store(cs, Ordering::Relaxed);
                thread::sleep(CLOCK_INTERVAL);
            }
        }));

        let refresh = Arc::clone(&video.shared);
        video.threads.push(thread::spawn(move || refresh_task(&refresh)));
        debug!(width, height, "video threads started");
        video
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    fn raw_centiseconds(&self) -> u64 {
        if self.headless {
            self.epoch.elapsed().as_millis() as u64 / 10
        } else {
            self.shared.ticks.load(Ordering::Relaxed)
        }
    }

    /// Monotonic centiseconds since start
    pub fn monotonic(&self) -> u64 {
        self.raw_centiseconds()
    }

    /// Value of `TIME`
    pub fn time(&self) -> i64 {
        self.raw_centiseconds() as i64 + self.offset.load(Ordering::Relaxed)
    }

    /// `TIME = t`
    pub fn set_time(&self, t: i64) {
        self.offset.store(t - self.raw_centiseconds() as i64, Ordering::Relaxed);
    }

    pub fn autorefresh(&self) -> AutoRefresh {
        AutoRefresh::from_u8(self.shared.autorefresh.load(Ordering::Relaxed))
    }

    pub fn set_autorefresh(&self, mode: AutoRefresh) {
        trace!(?mode, "autorefresh");
        self.shared.autorefresh.store(mode as u8, Ordering::Relaxed);
    }

    /// An error was reported: `OnError` refresh turns back on
    pub fn error_occurred(&self) {
        if self.autorefresh() == AutoRefresh::OnError {
            self.set_autorefresh(AutoRefresh::On);
            self.refresh_now();
        }
    }

    /// Run `f` on the display while holding the busy flag
    pub fn with_display<R>(&self, f: impl FnOnce(&mut Display) -> R) -> R {
        while self.shared.busy.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        let mut display = lock(&self.shared.display);
        let result = f(&mut display);
        self.shared.dirty.store(true, Ordering::Release);
        if self.headless && self.autorefresh() == AutoRefresh::On {
            let cs = self.raw_centiseconds();
            display.present(cs);
        }
        result
    }

    /// Read the display without marking it changed
    pub fn snapshot<R>(&self, f: impl FnOnce(&Display) -> R) -> R {
        f(&lock(&self.shared.display))
    }

    /// Present the display now, whatever the refresh mode (`*Refresh`)
    pub fn refresh_now(&self) {
        let cs = self.raw_centiseconds();
        lock(&self.shared.display).present(cs);
        self.shared.dirty.store(false, Ordering::Release);
    }

    /// Hand a request to the refresh task and wait for it to finish
    pub fn request(&self, request: Request) -> Result<()> {
        debug!(?request, "video request");
        if self.headless {
            let ok = lock(&self.shared.display).apply(&request);
            return if ok { Ok(()) } else { Err(ErrorKind::BadModeSc.into()) };
        }
        let code = request.code();
        *lock(&self.shared.request) = Some(request);
        self.shared.mailbox.store(code, Ordering::Release);
        let started = Instant::now();
        loop {
            match self.shared.mailbox.load(Ordering::Acquire) {
                MAILBOX_OK => {
                    self.shared.mailbox.store(MAILBOX_IDLE, Ordering::Release);
                    return Ok(());
                }
                MAILBOX_FAILED => {
                    self.shared.mailbox.store(MAILBOX_IDLE, Ordering::Release);
                    return Err(ErrorKind::BadModeSc.into());
                }
                _ if started.elapsed() > REQUEST_TIMEOUT => {
                    warn!(code, "refresh task did not answer");
                    *lock(&self.shared.request) = None;
                    self.shared.mailbox.store(MAILBOX_IDLE, Ordering::Release);
                    return Err(ErrorKind::BadModeSc.into());
                }
                _ => thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

fn refresh_task(shared: &Shared) {
    let epoch = Instant::now();
    while !shared.stop.load(Ordering::Relaxed) {
        if shared.mailbox.load(Ordering::Acquire) >= 0 {
            let request = lock(&shared.request).take();
            let ok = match request {
                Some(request) => lock(&shared.display).apply(&request),
                None => false,
            };
            trace!(ok, "mailbox serviced");
            shared.mailbox.store(if ok { MAILBOX_OK } else { MAILBOX_FAILED }, Ordering::Release);
        }
        let refresh = AutoRefresh::from_u8(shared.autorefresh.load(Ordering::Relaxed)) == AutoRefresh::On;
        let flashing = lock(&shared.display).flash_off.is_some();
        if refresh && (shared.dirty.swap(false, Ordering::AcqRel) || flashing) {
            shared.busy.store(true, Ordering::Release);
            let cs = epoch.elapsed().as_millis() as u64 / 10;
            lock(&shared.display).present(cs);
            shared.busy.store(false, Ordering::Release);
        }
        thread::sleep(REFRESH_INTERVAL);
    }
}

impl Drop for Video {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_resize() {
        let video = Video::headless(640, 512);
        video.request(Request::Resize { width: 1280, height: 1024, mode: 27 }).unwrap();
        video.snapshot(|d| {
            assert_eq!((d.width, d.height, d.mode), (1280, 1024, 27));
            assert_eq!(d.pixels.len(), 1280 * 1024);
        });
        let err = video.request(Request::Resize { width: 0, height: 10, mode: 99 }).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadModeSc);
    }

    #[test]
    fn test_threaded_mailbox() {
        let video = Video::start(64, 32);
        video.request(Request::Title("Test".into())).unwrap();
        video.request(Request::Resize { width: 32, height: 16, mode: 1 }).unwrap();
        video.snapshot(|d| {
            assert_eq!(d.title, "Test");
            assert_eq!(d.width, 32);
        });
    }

    #[test]
    fn test_time_offset() {
        let video = Video::headless(8, 8);
        video.set_time(100_000);
        let t = video.time();
        assert!((100_000..100_050).contains(&t));
        assert!(video.monotonic() < 100);
    }

    #[test]
    fn test_flash_phase() {
        let mut d = Display::new(1, 1);
        d.pixels[0] = 0xFF;
        d.flash_off = Some(vec![0x00]);
        d.present(10);
        assert_eq!(d.front[0], 0xFF);
        d.present(70);
        assert_eq!(d.front[0], 0x00);
        assert_eq!(d.frames, 2);
    }

    #[test]
    fn test_autorefresh_on_error() {
        let video = Video::headless(4, 4);
        video.set_autorefresh(AutoRefresh::OnError);
        video.with_display(|d| d.pixels[0] = 0x123456);
        video.snapshot(|d| assert_eq!(d.front[0], 0));
        video.error_occurred();
        assert_eq!(video.autorefresh(), AutoRefresh::On);
        video.snapshot(|d| assert_eq!(d.front[0], 0x123456));
    }
}
