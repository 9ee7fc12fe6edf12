//! Host-side driver for FX3-bridged wideband SDR receivers, such as the
//! BBRF103, HF103, RX-666 and RX888.
//!
//! The receivers pair a Cypress FX3 USB 3.0 bridge with a wideband ADC, a
//! dual-output clock synthesizer, and (on most boards) an R820T2 silicon
//! tuner for the VHF path. The FX3 ships blank: on first open the driver
//! uploads a firmware image to the boot-loader, waits for the device to
//! re-enumerate, and carries on.
//!
//! [Device] is the entry point:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let mut device = rf103::Device::open(0, Some("rx888.img".as_ref()))?;
//! device.set_rf_mode(rf103::RfMode::Hf)?;
//! device.set_sample_rate(2_000_000)?;
//! device.set_async_params(0, 0, |frame| {
//!     // 16-bit little-endian ADC samples
//!     let _ = frame;
//! })?;
//! device.start_streaming()?;
//! for _ in 0..100 {
//!     device.handle_events(Duration::from_millis(500))?;
//! }
//! device.stop_streaming()?;
//! # Ok::<(), rf103::Error>(())
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod usb;
pub use usb::{count_devices, list_devices, DeviceInfo, DeviceList, Gpio};

pub mod adc;
pub mod clock;
pub mod firmware;
pub mod tuner;

mod device;
pub use device::{Device, Led, RfMode, Status};

#[cfg(test)]
pub(crate) mod testing;
