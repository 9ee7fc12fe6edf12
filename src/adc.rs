//! ADC sample-rate control and the streaming pipeline.
//!
//! The ADC itself is clocked by the synthesizer's first output; this
//! module owns the sample-rate bookkeeping, the asynchronous transfer
//! ring, and the start/stop vendor commands that arm and halt the FX3's
//! GPIF engine.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::usb::stream::{StreamCallback, TransferRing, DEFAULT_ENDPOINT};
use crate::usb::{ControlBus, UsbDevice, VendorRequest};

/// Timeout for synchronous bulk reads.
const SYNC_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// The ADC half of the receiver: sample rate plus the bulk data path.
pub struct Adc {
    usb: Arc<UsbDevice>,
    sample_rate: Option<u32>,
    ring: Option<TransferRing>,
}

impl Adc {
    pub fn new(usb: Arc<UsbDevice>) -> Adc {
        Adc {
            usb,
            sample_rate: None,
            ring: None,
        }
    }

    /// Desired sample rate, in samples per second.
    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            return Err(Error::InvalidArgument("sample rate must be non-zero"));
        }
        self.sample_rate = Some(sample_rate);
        Ok(())
    }

    /// Allocate the asynchronous transfer ring. `frame_size` bytes per
    /// transfer, `num_frames` transfers in flight; zero picks the default
    /// for either. Nothing is submitted until [start][Adc::start].
    pub fn open_async(
        &mut self,
        frame_size: usize,
        num_frames: usize,
        callback: StreamCallback,
    ) -> Result<()> {
        if self.ring.as_ref().is_some_and(|ring| ring.is_submitted()) {
            return Err(Error::Busy);
        }
        let ring = TransferRing::new(
            self.usb.clone(),
            DEFAULT_ENDPOINT,
            frame_size,
            num_frames,
            callback,
        )?;
        self.ring = Some(ring);
        Ok(())
    }

    /// True once [open_async][Adc::open_async] has set up the ring.
    pub fn is_async_ready(&self) -> bool {
        self.ring.is_some()
    }

    /// Submit the whole ring, then start the GPIF engine.
    pub fn start(&mut self) -> Result<()> {
        let ring = self
            .ring
            .as_mut()
            .ok_or(Error::InvalidArgument("async parameters not set"))?;
        ring.submit()?;
        self.usb
            .vendor_write(VendorRequest::StartFx3, 0, 0, &[])?;
        Ok(())
    }

    /// Stop the GPIF engine and retire all in-flight transfers.
    ///
    /// No callback runs after this returns. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(ring) = self.ring.as_mut() {
            ring.cancel()?;
        }
        self.usb.vendor_write(VendorRequest::StopFx3, 0, 0, &[])?;
        Ok(())
    }

    /// Pump completions; the stream callback runs inside this call.
    pub fn handle_events(&self, timeout: Duration) -> Result<()> {
        self.usb.handle_events(timeout)
    }

    /// Bytes handed to the callback since the last
    /// [reset_status][Adc::reset_status].
    pub fn bytes_delivered(&self) -> u64 {
        self.ring.as_ref().map_or(0, TransferRing::bytes_delivered)
    }

    /// Transfers that completed with an error since the last reset.
    pub fn failed_transfers(&self) -> usize {
        self.ring.as_ref().map_or(0, TransferRing::failed_transfers)
    }

    /// Clear the accumulated transfer counters.
    pub fn reset_status(&mut self) {
        if let Some(ring) = self.ring.as_ref() {
            ring.reset_status();
        }
    }

    /// Blocking bulk read into `data`. Returns bytes transferred.
    pub fn read_sync(&self, data: &mut [u8]) -> Result<usize> {
        self.usb.read_bulk(DEFAULT_ENDPOINT, data, SYNC_READ_TIMEOUT)
    }
}
