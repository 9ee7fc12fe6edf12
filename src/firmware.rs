//! FX3 firmware images and the boot-loader upload protocol.
//!
//! An image is a `CY` header followed by load sections and an entry/checksum
//! trailer, all little-endian 32-bit words:
//!
//! ```text
//! 'C' 'Y' 0x1c 0xb0
//! [ loadSz secStart loadSz*payload ]*   terminated by loadSz == 0
//! entryAddr checksum
//! ```
//!
//! The checksum is the wrapping 32-bit sum of every payload word. The
//! boot-loader accepts the image through vendor request `0xa0`, one section
//! at a time, then jumps to the entry address with a zero-length transfer.

use std::time::Duration;

use nom::bytes::complete::take;
use nom::number::complete::le_u32;

use crate::error::{Error, Result};
use crate::usb::ControlBus;

/// Image header: 'C', 'Y', I2C configuration 0x1c, binary image type 0xb0.
pub const IMAGE_MAGIC: [u8; 4] = [b'C', b'Y', 0x1c, 0xb0];

/// Smallest plausible image; anything shorter is rejected outright.
pub const MIN_IMAGE_SIZE: usize = 10240;

/// Boot-loader firmware-load vendor request.
const LOAD_REQUEST: u8 = 0xa0;

/// Largest payload per control transfer.
const MAX_WRITE_SIZE: usize = 2 * 1024;

/// Timeout for each upload transfer.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the boot-loader gets to settle before the entry-point jump.
const PRE_JUMP_DELAY: Duration = Duration::from_secs(1);

/// One load section: `data` goes to `address` in device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section<'a> {
    pub address: u32,
    /// Section payload; always a whole number of 32-bit words.
    pub data: &'a [u8],
}

/// A validated firmware image, borrowing the raw file bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image<'a> {
    pub sections: Vec<Section<'a>>,
    pub entry: u32,
    pub checksum: u32,
}

impl<'a> Image<'a> {
    /// Parse and validate a raw image file.
    ///
    /// Rejects short files, bad headers, sections that run into the
    /// trailer, and checksum mismatches. A file longer than the accounted
    /// range is accepted with a warning.
    pub fn parse(bytes: &'a [u8]) -> Result<Image<'a>> {
        if bytes.len() < MIN_IMAGE_SIZE {
            return Err(Error::BadFirmware("too small"));
        }
        if bytes[..4] != IMAGE_MAGIC {
            return Err(Error::BadFirmware("header"));
        }

        let mut rest = &bytes[4..];
        let mut sections = Vec::new();
        loop {
            let (r, load_sz) = word(rest)?;
            if load_sz == 0 {
                rest = r;
                break;
            }
            let (r, address) = word(r)?;
            let byte_len = (load_sz as usize)
                .checked_mul(4)
                .ok_or(Error::BadFirmware("section bounds"))?;
            // the payload must leave room for the terminator and trailer
            if byte_len + 12 > r.len() {
                return Err(Error::BadFirmware("section bounds"));
            }
            let (r, data) = take::<_, _, nom::error::Error<&[u8]>>(byte_len)(r)
                .map_err(|_| Error::BadFirmware("section bounds"))?;
            sections.push(Section { address, data });
            rest = r;
        }
        let (rest, entry) = word(rest)?;
        let (rest, checksum) = word(rest)?;

        if !rest.is_empty() {
            log::warn!("image file longer than expected ({} trailing bytes)", rest.len());
        }

        let image = Image {
            sections,
            entry,
            checksum,
        };
        let computed = image.payload_checksum();
        if computed != image.checksum {
            return Err(Error::BadChecksum {
                computed,
                expected: image.checksum,
            });
        }
        Ok(image)
    }

    /// Wrapping 32-bit sum over every payload word.
    pub fn payload_checksum(&self) -> u32 {
        let mut sum = 0u32;
        for section in &self.sections {
            for w in section.data.chunks_exact(4) {
                sum = sum.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
            }
        }
        sum
    }
}

fn word(input: &[u8]) -> Result<(&[u8], u32)> {
    le_u32::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::BadFirmware("truncated"))
}

/// Assemble an image file, mostly useful for tooling and tests.
///
/// The trailer checksum is computed from the payload, and the file is
/// padded out to [MIN_IMAGE_SIZE] so it passes validation.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    sections: Vec<(u32, Vec<u32>)>,
    entry: u32,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder::default()
    }

    /// Append a section of `words` loaded at `address`. An empty section
    /// is dropped; a zero length is how the section list terminates, so
    /// it cannot be represented.
    pub fn section(mut self, address: u32, words: &[u32]) -> ImageBuilder {
        if !words.is_empty() {
            self.sections.push((address, words.to_vec()));
        }
        self
    }

    /// Set the entry address jumped to after the last section.
    pub fn entry(mut self, address: u32) -> ImageBuilder {
        self.entry = address;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut bytes = IMAGE_MAGIC.to_vec();
        let mut checksum = 0u32;
        for (address, words) in &self.sections {
            bytes.extend((words.len() as u32).to_le_bytes());
            bytes.extend(address.to_le_bytes());
            for w in words {
                bytes.extend(w.to_le_bytes());
                checksum = checksum.wrapping_add(*w);
            }
        }
        bytes.extend(0u32.to_le_bytes());
        bytes.extend(self.entry.to_le_bytes());
        bytes.extend(checksum.to_le_bytes());
        bytes.resize(bytes.len().max(MIN_IMAGE_SIZE), 0);
        bytes
    }
}

/// Validate `image_bytes` and upload them to a device in boot-loader mode.
pub fn load<B: ControlBus>(bus: &B, image_bytes: &[u8]) -> Result<()> {
    let image = Image::parse(image_bytes)?;
    transfer(bus, &image)
}

/// Upload a validated image and jump to its entry point.
pub fn transfer<B: ControlBus>(bus: &B, image: &Image) -> Result<()> {
    for section in &image.sections {
        log::debug!(
            "loading {} bytes at {:#010x}",
            section.data.len(),
            section.address
        );
        for chunk in section.data.chunks(MAX_WRITE_SIZE) {
            let n = bus.control_write(
                LOAD_REQUEST,
                (section.address & 0xffff) as u16,
                (section.address >> 16) as u16,
                chunk,
                TRANSFER_TIMEOUT,
            )?;
            if n != chunk.len() {
                return Err(Error::BadFirmware("short write during section transfer"));
            }
        }
    }

    std::thread::sleep(PRE_JUMP_DELAY);

    // the device may reset before acknowledging the jump, so a failure
    // here is not fatal
    let jump = bus.control_write(
        LOAD_REQUEST,
        (image.entry & 0xffff) as u16,
        (image.entry >> 16) as u16,
        &[],
        TRANSFER_TIMEOUT,
    );
    if let Err(e) = jump {
        log::warn!("entry-point transfer failed (device may have reset): {}", e);
    }

    Ok(())
}
