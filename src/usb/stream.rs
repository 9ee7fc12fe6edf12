//! Asynchronous bulk-in transfer ring.
//!
//! The safe `rusb` surface has no asynchronous transfer API, so the ring is
//! built directly on the `libusb1-sys` FFI it re-exports. A fixed set of
//! bulk-in transfers is kept in flight; each completion hands the frame to
//! the user callback and resubmits itself until the ring is cancelled.
//!
//! Completions are only dispatched while someone pumps
//! [UsbDevice::handle_events], so the callback runs on whichever thread does
//! the pumping and never concurrently with itself.

use std::os::raw::{c_int, c_void};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rusb::ffi;

use super::UsbDevice;
use crate::error::{Error, Result};

/// Bulk-in endpoint the ADC data arrives on.
pub const DEFAULT_ENDPOINT: u8 = 0x81;

/// Default size of one transfer frame, in bytes.
pub const DEFAULT_FRAME_SIZE: usize = 65536;

/// Default number of transfers kept in flight.
pub const DEFAULT_RING_DEPTH: usize = 16;

/// How long to wait for cancelled transfers to reach terminal status.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Called with each completed frame. Must not block, and must not re-enter
/// start/stop on the same device.
pub type StreamCallback = Box<dyn FnMut(&[u8]) + Send>;

struct RingShared {
    callback: Mutex<StreamCallback>,
    cancel: AtomicBool,
    /// Transfers currently submitted to the transport.
    active: AtomicUsize,
    bytes_delivered: AtomicU64,
    failed_transfers: AtomicUsize,
}

/// A ring of in-flight bulk-in transfers feeding a callback.
pub struct TransferRing {
    device: Arc<UsbDevice>,
    transfers: Vec<*mut ffi::libusb_transfer>,
    buffers: Vec<Box<[u8]>>,
    shared: Box<RingShared>,
    submitted: bool,
}

// Raw transfer pointers are only touched by the thread that owns the ring
// and pumps handle_events.
unsafe impl Send for TransferRing {}

fn libusb_error(rc: c_int) -> rusb::Error {
    use ffi::constants::*;
    match rc {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    unsafe {
        let shared = &*((*transfer).user_data as *const RingShared);
        let status = (*transfer).status;
        let cancelled = shared.cancel.load(Ordering::Acquire);

        if status == ffi::constants::LIBUSB_TRANSFER_COMPLETED && !cancelled {
            let length = (*transfer).actual_length as usize;
            let data = slice::from_raw_parts((*transfer).buffer, length);
            shared
                .bytes_delivered
                .fetch_add(length as u64, Ordering::Relaxed);
            {
                let mut callback = shared
                    .callback
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                (*callback)(data);
            }
            // the callback may have requested cancellation indirectly
            if !shared.cancel.load(Ordering::Acquire) {
                if ffi::libusb_submit_transfer(transfer) == 0 {
                    return;
                }
                shared.failed_transfers.fetch_add(1, Ordering::Relaxed);
            }
        } else if status != ffi::constants::LIBUSB_TRANSFER_COMPLETED
            && status != ffi::constants::LIBUSB_TRANSFER_CANCELLED
        {
            shared.failed_transfers.fetch_add(1, Ordering::Relaxed);
        }

        // terminal: this transfer leaves the ring
        shared.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TransferRing {
    /// Allocate a ring of `ring_depth` transfers of `frame_size` bytes each.
    /// Zero selects the default for either. Nothing is submitted yet.
    pub fn new(
        device: Arc<UsbDevice>,
        endpoint: u8,
        frame_size: usize,
        ring_depth: usize,
        callback: StreamCallback,
    ) -> Result<TransferRing> {
        let frame_size = if frame_size == 0 {
            DEFAULT_FRAME_SIZE
        } else {
            frame_size
        };
        let ring_depth = if ring_depth == 0 {
            DEFAULT_RING_DEPTH
        } else {
            ring_depth
        };

        let shared = Box::new(RingShared {
            callback: Mutex::new(callback),
            cancel: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            bytes_delivered: AtomicU64::new(0),
            failed_transfers: AtomicUsize::new(0),
        });

        let mut transfers: Vec<*mut ffi::libusb_transfer> = Vec::with_capacity(ring_depth);
        let mut buffers: Vec<Box<[u8]>> = Vec::with_capacity(ring_depth);
        for _ in 0..ring_depth {
            let mut buffer = vec![0u8; frame_size].into_boxed_slice();
            let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
            if transfer.is_null() {
                for t in &transfers {
                    unsafe { ffi::libusb_free_transfer(*t) };
                }
                return Err(Error::Usb(rusb::Error::NoMem));
            }
            unsafe {
                (*transfer).dev_handle = device.handle().as_raw();
                (*transfer).flags = 0;
                (*transfer).endpoint = endpoint;
                (*transfer).transfer_type = ffi::constants::LIBUSB_TRANSFER_TYPE_BULK;
                (*transfer).timeout = 0;
                (*transfer).length = frame_size as c_int;
                (*transfer).buffer = buffer.as_mut_ptr();
                (*transfer).callback = transfer_callback;
                (*transfer).user_data = &*shared as *const RingShared as *mut c_void;
            }
            buffers.push(buffer);
            transfers.push(transfer);
        }

        Ok(TransferRing {
            device,
            transfers,
            buffers,
            shared,
            submitted: false,
        })
    }

    /// Submit every transfer in the ring. Idempotent while submitted.
    pub fn submit(&mut self) -> Result<()> {
        if self.submitted {
            return Ok(());
        }
        self.shared.cancel.store(false, Ordering::Release);
        for (i, &transfer) in self.transfers.iter().enumerate() {
            self.shared.active.fetch_add(1, Ordering::AcqRel);
            let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
            if rc != 0 {
                self.shared.active.fetch_sub(1, Ordering::AcqRel);
                self.shared.cancel.store(true, Ordering::Release);
                for &t in &self.transfers[..i] {
                    unsafe { ffi::libusb_cancel_transfer(t) };
                }
                self.drain();
                return Err(Error::Usb(libusb_error(rc)));
            }
        }
        self.submitted = true;
        Ok(())
    }

    /// Cancel all in-flight transfers and wait for them to reach terminal
    /// status. Idempotent.
    pub fn cancel(&mut self) -> Result<()> {
        if !self.submitted {
            return Ok(());
        }
        self.shared.cancel.store(true, Ordering::Release);
        for &transfer in &self.transfers {
            // NOT_FOUND just means the transfer already completed
            unsafe { ffi::libusb_cancel_transfer(transfer) };
        }
        let drained = self.drain();
        self.submitted = false;
        if drained {
            Ok(())
        } else {
            Err(Error::Usb(rusb::Error::Timeout))
        }
    }

    /// Pump events until no transfer is active, or the deadline passes.
    fn drain(&self) -> bool {
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while self.shared.active.load(Ordering::Acquire) > 0 {
            if Instant::now() > deadline {
                return false;
            }
            let _ = self.device.handle_events(Duration::from_millis(100));
        }
        true
    }

    /// Total bytes handed to the callback since the last reset.
    pub fn bytes_delivered(&self) -> u64 {
        self.shared.bytes_delivered.load(Ordering::Relaxed)
    }

    /// Transfers that completed with an error since the last reset.
    pub fn failed_transfers(&self) -> usize {
        self.shared.failed_transfers.load(Ordering::Relaxed)
    }

    /// Clear the delivery and failure counters.
    pub fn reset_status(&self) {
        self.shared.bytes_delivered.store(0, Ordering::Relaxed);
        self.shared.failed_transfers.store(0, Ordering::Relaxed);
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }
}

impl Drop for TransferRing {
    fn drop(&mut self) {
        if self.submitted {
            let _ = self.cancel();
        }
        if self.shared.active.load(Ordering::Acquire) > 0 {
            // a transfer never reached terminal status; freeing it now
            // would hand libusb dangling buffer and user_data pointers,
            // so leak the ring instead
            log::warn!("leaking transfer ring: transfers still active after drain");
            std::mem::forget(std::mem::take(&mut self.buffers));
            let dead_callback: StreamCallback = Box::new(|_| {});
            let dead = Box::new(RingShared {
                callback: Mutex::new(dead_callback),
                cancel: AtomicBool::new(true),
                active: AtomicUsize::new(0),
                bytes_delivered: AtomicU64::new(0),
                failed_transfers: AtomicUsize::new(0),
            });
            std::mem::forget(std::mem::replace(&mut self.shared, dead));
            return;
        }
        for &transfer in &self.transfers {
            unsafe { ffi::libusb_free_transfer(transfer) };
        }
    }
}
