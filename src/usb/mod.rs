//! USB transport for FX3-bridged receivers.
//!
//! The FX3 bridge enumerates either as a bare Cypress boot-loader (before
//! firmware is transferred) or as the streaming device. This module handles
//! enumeration against the known identity table, opening and claiming the
//! control interface, the vendor control requests the firmware understands,
//! and the GPIO / I2C primitives everything else is built from.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use crate::error::{Error, Result};
use crate::firmware;

pub mod gpio;
pub use gpio::Gpio;

pub mod stream;

/// Interface claimed on the FX3.
const CONTROL_INTERFACE: u8 = 0;

/// Timeout for vendor control requests.
const VENDOR_TIMEOUT: Duration = Duration::from_secs(1);

/// USB identity of one receiver flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UsbId {
    vid: u16,
    pid: u16,
    needs_firmware: bool,
}

/// Identities this driver knows how to open.
const USB_IDS: [UsbId; 2] = [
    // Cypress FX3 boot-loader
    UsbId {
        vid: 0x04b4,
        pid: 0x00f3,
        needs_firmware: true,
    },
    // FX3 running the streamer firmware
    UsbId {
        vid: 0x04b4,
        pid: 0x00f1,
        needs_firmware: false,
    },
];

fn lookup(vid: u16, pid: u16) -> Option<UsbId> {
    USB_IDS.iter().copied().find(|id| id.vid == vid && id.pid == pid)
}

/// Vendor control request opcodes understood by the streamer firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VendorRequest {
    /// Start the GPIF engine and stream ADC data.
    StartFx3 = 0xaa,
    /// Stop the GPIF engine.
    StopFx3 = 0xab,
    /// Read device model information.
    TestFx3 = 0xac,
    /// Write to the I2C bus.
    I2cWriteFx3 = 0xba,
    /// Set the GPIO lines from the shadow byte.
    GpioFx3 = 0xbc,
    /// Read from the I2C bus.
    I2cReadFx3 = 0xbe,
    /// Reset the FX3 back into the boot-loader.
    ResetFx3 = 0xcc,
    /// Pause streaming without tearing down the GPIF engine.
    PauseFx3 = 0xdd,
}

/// Raw control-transfer access to a receiver.
///
/// The clock synthesizer, tuner, and firmware loader are all generic over
/// this, so their register traffic can be checked without hardware.
pub trait ControlBus {
    /// Host-to-device vendor control transfer. Returns bytes written.
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Device-to-host vendor control transfer. Returns bytes read.
    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Issue a vendor request carrying outbound data. Short writes are
    /// transport errors.
    fn vendor_write(
        &self,
        request: VendorRequest,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<()> {
        let n = self.control_write(request as u8, value, index, data, VENDOR_TIMEOUT)?;
        if n != data.len() {
            return Err(Error::Usb(rusb::Error::Io));
        }
        Ok(())
    }

    /// Issue a vendor request expecting inbound data. Short reads are
    /// transport errors.
    fn vendor_read(
        &self,
        request: VendorRequest,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<()> {
        let n = self.control_read(request as u8, value, index, data, VENDOR_TIMEOUT)?;
        if n != data.len() {
            return Err(Error::Usb(rusb::Error::Io));
        }
        Ok(())
    }

    /// Write `data` to register `reg` of the I2C device at `addr`.
    fn i2c_write(&self, addr: u8, reg: u8, data: &[u8]) -> Result<()> {
        self.vendor_write(VendorRequest::I2cWriteFx3, addr as u16, reg as u16, data)
    }

    /// Read `data.len()` bytes starting at register `reg` of the I2C device
    /// at `addr`.
    fn i2c_read(&self, addr: u8, reg: u8, data: &mut [u8]) -> Result<()> {
        self.vendor_read(VendorRequest::I2cReadFx3, addr as u16, reg as u16, data)
    }
}

impl<B: ControlBus + ?Sized> ControlBus for &B {
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        (**self).control_write(request, value, index, data, timeout)
    }

    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        (**self).control_read(request, value, index, data, timeout)
    }
}

impl<B: ControlBus + ?Sized> ControlBus for Arc<B> {
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        (**self).control_write(request, value, index, data, timeout)
    }

    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        (**self).control_read(request, value, index, data, timeout)
    }
}

impl ControlBus for DeviceHandle<Context> {
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        Ok(self.write_control(request_type, request, value, index, data, timeout)?)
    }

    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        Ok(self.read_control(request_type, request, value, index, data, timeout)?)
    }
}

/// Identity and descriptor strings for one attached receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    /// True when the device is still in boot-loader mode and needs a
    /// firmware image before it can stream.
    pub needs_firmware: bool,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

/// An owned list of attached receivers.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    infos: Vec<DeviceInfo>,
}

impl DeviceList {
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceInfo> {
        self.infos.get(index)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, DeviceInfo> {
        self.infos.iter()
    }
}

impl core::ops::Index<usize> for DeviceList {
    type Output = DeviceInfo;

    fn index(&self, index: usize) -> &DeviceInfo {
        &self.infos[index]
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a DeviceInfo;
    type IntoIter = core::slice::Iter<'a, DeviceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.infos.iter()
    }
}

/// Count attached receivers matching the identity table.
pub fn count_devices() -> Result<usize> {
    let context = Context::new()?;
    let mut count = 0;
    for device in context.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if lookup(desc.vendor_id(), desc.product_id()).is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// List attached receivers with their descriptor strings.
///
/// A probe failure on one candidate (e.g. missing permissions) leaves its
/// strings empty; the other entries are unaffected.
pub fn list_devices() -> Result<DeviceList> {
    let context = Context::new()?;
    let mut infos = Vec::new();
    for device in context.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        let Some(id) = lookup(desc.vendor_id(), desc.product_id()) else {
            continue;
        };

        let mut info = DeviceInfo {
            vendor_id: id.vid,
            product_id: id.pid,
            needs_firmware: id.needs_firmware,
            manufacturer: String::new(),
            product: String::new(),
            serial_number: String::new(),
        };

        match device.open() {
            Ok(handle) => {
                info.manufacturer = handle
                    .read_manufacturer_string_ascii(&desc)
                    .unwrap_or_default();
                info.product = handle.read_product_string_ascii(&desc).unwrap_or_default();
                info.serial_number = handle
                    .read_serial_number_string_ascii(&desc)
                    .unwrap_or_default();
            }
            Err(e) => {
                log::warn!(
                    "cannot open {:04x}:{:04x} to read strings: {}",
                    id.vid,
                    id.pid,
                    e
                );
            }
        }

        infos.push(info);
    }
    Ok(DeviceList { infos })
}

/// An open, claimed receiver.
#[derive(Debug)]
pub struct UsbDevice {
    context: Context,
    handle: DeviceHandle<Context>,
    gpio: Mutex<u8>,
}

/// Find and claim the `index`th matching device.
fn find(context: &Context, index: usize) -> Result<(DeviceHandle<Context>, bool)> {
    let mut count = 0;
    for device in context.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        let Some(id) = lookup(desc.vendor_id(), desc.product_id()) else {
            continue;
        };
        if count != index {
            count += 1;
            continue;
        }

        let mut handle = device.open()?;
        match handle.kernel_driver_active(CONTROL_INTERFACE) {
            Ok(true) => return Err(Error::Busy),
            Ok(false) => {}
            // not a concept on this platform
            Err(rusb::Error::NotSupported) => {}
            Err(e) => return Err(e.into()),
        }
        handle.claim_interface(CONTROL_INTERFACE).map_err(|e| match e {
            rusb::Error::Busy => Error::Busy,
            e => e.into(),
        })?;
        return Ok((handle, id.needs_firmware));
    }
    Err(Error::NotFound(index))
}

impl UsbDevice {
    /// Open the `index`th matching receiver.
    ///
    /// If the device is still in boot-loader mode, `firmware` is validated
    /// and transferred, the bus is rescanned after the device re-enumerates,
    /// and the same index is re-opened as the streamer. `initial_gpio` is
    /// pushed as the whole GPIO shadow once the device is up.
    pub fn open(index: usize, firmware: Option<&[u8]>, initial_gpio: Gpio) -> Result<UsbDevice> {
        let context = Context::new()?;
        let (mut handle, needs_firmware) = find(&context, index)?;

        if needs_firmware {
            let image = firmware.ok_or(Error::BadFirmware(
                "device is in boot-loader mode and no image was provided",
            ))?;
            firmware::load(&handle, image)?;
            drop(handle);

            // the device drops off the bus and re-enumerates as the
            // streamer; give it a few rescans to come back
            let mut found = Err(Error::NotFound(index));
            for _ in 0..5 {
                found = find(&context, index);
                if found.is_ok() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(500));
            }
            let (h, still_bootloader) = found?;
            if still_bootloader {
                return Err(Error::BadFirmware("device is still in boot-loader mode"));
            }
            handle = h;
        }

        let device = UsbDevice {
            context,
            handle,
            gpio: Mutex::new(0),
        };
        device.gpio_set(initial_gpio, Gpio::from(0xff))?;
        Ok(device)
    }

    pub(crate) fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    /// Pump the transport's event loop once, dispatching any completed bulk
    /// transfers to their callbacks.
    pub fn handle_events(&self, timeout: Duration) -> Result<()> {
        Ok(self.context.handle_events(Some(timeout))?)
    }

    /// Update the GPIO lines selected by `mask` to `pattern`, leaving the
    /// others untouched. The whole shadow byte is pushed to the device.
    pub fn gpio_set(&self, pattern: Gpio, mask: Gpio) -> Result<Gpio> {
        let mut shadow = self.gpio.lock().unwrap_or_else(PoisonError::into_inner);
        let new = gpio::apply(*shadow, pattern, mask);
        self.vendor_write(VendorRequest::GpioFx3, new as u16, 0, &[])?;
        *shadow = new;
        Ok(Gpio::from(new))
    }

    /// Turn the given GPIO lines on.
    pub fn gpio_on(&self, bits: Gpio) -> Result<Gpio> {
        self.gpio_set(bits, bits)
    }

    /// Turn the given GPIO lines off.
    pub fn gpio_off(&self, bits: Gpio) -> Result<Gpio> {
        self.gpio_set(Gpio::new(), bits)
    }

    /// Toggle the given GPIO lines.
    pub fn gpio_toggle(&self, bits: Gpio) -> Result<Gpio> {
        let mut shadow = self.gpio.lock().unwrap_or_else(PoisonError::into_inner);
        let new = *shadow ^ bits.bits();
        self.vendor_write(VendorRequest::GpioFx3, new as u16, 0, &[])?;
        *shadow = new;
        Ok(Gpio::from(new))
    }

    /// Blocking bulk-in read.
    pub fn read_bulk(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.read_bulk(endpoint, data, timeout)?)
    }
}

impl ControlBus for UsbDevice {
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.handle.control_write(request, value, index, data, timeout)
    }

    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.handle.control_read(request, value, index, data, timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_table() {
        assert_eq!(lookup(0x04b4, 0x00f3).map(|id| id.needs_firmware), Some(true));
        assert_eq!(lookup(0x04b4, 0x00f1).map(|id| id.needs_firmware), Some(false));
        assert_eq!(lookup(0x04b4, 0x00f2), None);
        assert_eq!(lookup(0x1d50, 0x00f1), None);
    }

    #[test]
    fn vendor_opcodes() {
        assert_eq!(VendorRequest::StartFx3 as u8, 0xaa);
        assert_eq!(VendorRequest::StopFx3 as u8, 0xab);
        assert_eq!(VendorRequest::TestFx3 as u8, 0xac);
        assert_eq!(VendorRequest::I2cWriteFx3 as u8, 0xba);
        assert_eq!(VendorRequest::GpioFx3 as u8, 0xbc);
        assert_eq!(VendorRequest::I2cReadFx3 as u8, 0xbe);
        assert_eq!(VendorRequest::ResetFx3 as u8, 0xcc);
        assert_eq!(VendorRequest::PauseFx3 as u8, 0xdd);
    }
}
