//! Boot arbitration and upgrade control.
//!
//! The controller owns the application storage backend and decides
//! between launching the resident image and accepting a new one. All
//! of its state, including every backend access it originates, is
//! serialised by one internal mutex; only the downloader body inside
//! [`Bootloader::upgrade`] runs unlocked, re-acquiring the mutex per
//! chunk through the [`Sink`].

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::devices::image::{self, AppDescriptor, AppInfo, SCAN_CHUNK_SIZE};
use crate::error::Error;
use crate::hal::storage::StorageBackend;
use crate::hal::time::{Clock, Microseconds, Milliseconds};

/// Bootloader states. Some of them are commands to the outer logic:
/// `ReadyToBoot` means the application should be started now.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootState {
    NoAppToBoot,
    BootDelay,
    BootCancelled,
    AppUpgradeInProgress,
    ReadyToBoot,
}

impl BootState {
    pub const fn as_str(self) -> &'static str {
        match self {
            BootState::NoAppToBoot => "NoAppToBoot",
            BootState::BootDelay => "BootDelay",
            BootState::BootCancelled => "BootCancelled",
            BootState::AppUpgradeInProgress => "AppUpgradeInProgress",
            BootState::ReadyToBoot => "ReadyToBoot",
        }
    }
}

/// Write side of the upgrade path. Implementations receive the image
/// back to back, in order, starting at offset zero.
pub trait DownloadSink {
    fn handle_chunk(&mut self, chunk: &[u8]) -> Result<(), Error>;
}

/// A firmware loading protocol, transferring an image from somewhere
/// remote into the sink. An error from the sink aborts the transfer
/// and is surfaced unchanged.
pub trait Downloader {
    fn download(&mut self, sink: &mut dyn DownloadSink) -> Result<(), Error>;
}

struct Inner<S> {
    backend: S,
    state: BootState,
    /// Present iff the last scan found an authentic descriptor. Cached
    /// because a full scan can take seconds on slow storage.
    cached_app_info: Option<AppInfo>,
    boot_delay_started_at: Microseconds,
    /// Scratch for scan reads. Kept off the stack deliberately.
    scan_chunk: [u8; SCAN_CHUNK_SIZE],
}

/// Main bootloader controller.
pub struct Bootloader<S, C, M>
where
    S: StorageBackend,
    C: Clock,
    M: RawMutex,
{
    inner: Mutex<M, RefCell<Inner<S>>>,
    clock: C,
    max_image_size: u32,
    boot_delay: Milliseconds,
}

impl<S, C, M> Bootloader<S, C, M>
where
    S: StorageBackend,
    C: Clock,
    M: RawMutex,
    Error: From<S::Error>,
{
    /// Takes ownership of the backend and performs the initial scan.
    /// Boot delay timing is measured from this moment.
    ///
    /// `max_image_size` matters beyond bounds checking: without it a
    /// signature collision in storage could force a CRC pass over an
    /// absurd declared size.
    pub fn new(backend: S, clock: C, max_image_size: u32, boot_delay: Milliseconds) -> Self {
        let mut inner = Inner {
            backend,
            state: BootState::NoAppToBoot,
            cached_app_info: None,
            boot_delay_started_at: Microseconds(0),
            scan_chunk: [0; SCAN_CHUNK_SIZE],
        };
        let now = clock.now();
        Self::verify_and_update(&mut inner, max_image_size, now, BootState::BootDelay);
        Bootloader { inner: Mutex::new(RefCell::new(inner)), clock, max_image_size, boot_delay }
    }

    /// Re-scans the storage and moves to `state_on_success` or
    /// `NoAppToBoot` accordingly, refreshing the cached app info.
    fn verify_and_update(
        inner: &mut Inner<S>,
        max_image_size: u32,
        now: Microseconds,
        state_on_success: BootState,
    ) {
        let Inner { backend, scan_chunk, .. } = &mut *inner;
        match image::locate_descriptor(backend, max_image_size, scan_chunk) {
            Some((AppDescriptor { app_info }, _offset)) => {
                inner.cached_app_info = Some(app_info);
                inner.state = state_on_success;
                // Only meaningful when the new state is BootDelay.
                inner.boot_delay_started_at = now;
            }
            None => {
                inner.cached_app_info = None;
                inner.state = BootState::NoAppToBoot;
            }
        }
    }

    /// Current state, with the `BootDelay` → `ReadyToBoot` promotion
    /// applied lazily against the moment the delay started.
    pub fn state(&self) -> BootState {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.state == BootState::BootDelay
                && self.clock.now() - inner.boot_delay_started_at
                    >= Microseconds::from(self.boot_delay)
            {
                inner.state = BootState::ReadyToBoot;
            }
            inner.state
        })
    }

    /// Info about the resident application, if an authentic one was
    /// found by the last scan.
    pub fn app_info(&self) -> Option<AppInfo> {
        self.inner.lock(|cell| cell.borrow().cached_app_info)
    }

    /// Switches to `BootCancelled`, if allowed; otherwise a no-op.
    pub fn cancel_boot(&self) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            match inner.state {
                BootState::BootDelay | BootState::ReadyToBoot => {
                    inner.state = BootState::BootCancelled;
                }
                BootState::NoAppToBoot
                | BootState::BootCancelled
                | BootState::AppUpgradeInProgress => {}
            }
        })
    }

    /// Switches to `ReadyToBoot`, if allowed; otherwise a no-op.
    pub fn request_boot(&self) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            match inner.state {
                BootState::BootDelay | BootState::BootCancelled => {
                    inner.state = BootState::ReadyToBoot;
                }
                BootState::NoAppToBoot
                | BootState::AppUpgradeInProgress
                | BootState::ReadyToBoot => {}
            }
        })
    }

    /// Runs a complete application update: storage preparation, the
    /// download itself, finalisation and the closing re-scan.
    ///
    /// Success means the procedure ran to completion, not that the
    /// downloaded image verifies; callers that need a launchable image
    /// must inspect [`Bootloader::state`] afterwards.
    pub fn upgrade<D>(&self, downloader: &mut D) -> Result<(), Error>
    where
        D: Downloader + ?Sized,
    {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            match inner.state {
                BootState::BootDelay | BootState::BootCancelled | BootState::NoAppToBoot => {}
                BootState::ReadyToBoot | BootState::AppUpgradeInProgress => {
                    return Err(Error::InvalidState);
                }
            }
            inner.state = BootState::AppUpgradeInProgress;
            // Invalidate before the storage can change underneath it.
            inner.cached_app_info = None;

            if let Err(e) = inner.backend.begin_upgrade() {
                // The backend may already have modified the storage.
                let now = self.clock.now();
                Self::verify_and_update(
                    &mut inner,
                    self.max_image_size,
                    now,
                    BootState::BootCancelled,
                );
                return Err(e.into());
            }
            Ok(())
        })?;

        // The long-running step happens without the lock so protocol
        // IO can progress; the sink re-locks for each chunk.
        let mut sink = Sink { bootloader: self, offset: 0 };
        let download_result = downloader.download(&mut sink);

        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            debug_assert_eq!(BootState::AppUpgradeInProgress, inner.state);
            let now = self.clock.now();

            if let Err(error) = download_result {
                // Finalise the backend regardless; its error is
                // irrelevant next to the download failure.
                let _ = inner.backend.end_upgrade(false);
                Self::verify_and_update(
                    &mut inner,
                    self.max_image_size,
                    now,
                    BootState::BootCancelled,
                );
                return Err(error);
            }

            if let Err(e) = inner.backend.end_upgrade(true) {
                Self::verify_and_update(
                    &mut inner,
                    self.max_image_size,
                    now,
                    BootState::BootCancelled,
                );
                return Err(e.into());
            }

            Self::verify_and_update(&mut inner, self.max_image_size, now, BootState::BootDelay);
            Ok(())
        })
    }
}

/// Streams downloaded chunks into the backend, tracking the write
/// offset and enforcing the image size bound. Each chunk is written
/// under the controller's lock.
pub struct Sink<'a, S, C, M>
where
    S: StorageBackend,
    C: Clock,
    M: RawMutex,
{
    bootloader: &'a Bootloader<S, C, M>,
    offset: usize,
}

impl<S, C, M> DownloadSink for Sink<'_, S, C, M>
where
    S: StorageBackend,
    C: Clock,
    M: RawMutex,
    Error: From<S::Error>,
{
    fn handle_chunk(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.bootloader.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if self.offset + chunk.len() > self.bootloader.max_image_size as usize {
                return Err(Error::ImageTooLarge);
            }
            let written = inner.backend.write(self.offset, chunk)?;
            if written != chunk.len() {
                return Err(Error::StorageWriteFailure);
            }
            self.offset += written;
            Ok(())
        })
    }
}
