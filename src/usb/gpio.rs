//! The FX3 GPIO shadow register.
//!
//! The bridge exposes a single byte of GPIO state, set as a whole with the
//! [GpioFx3][super::VendorRequest::GpioFx3] vendor request. The host keeps a
//! shadow copy so individual bits can be flipped without a read-back path.

use bitfield_struct::bitfield;

/// GPIO lines on the receiver, as wired to the FX3.
#[bitfield(u8)]
#[derive(PartialEq, Eq, Hash)]
pub struct Gpio {
    /// Red status LED.
    pub led_red: bool,
    /// Yellow status LED.
    pub led_yellow: bool,
    /// Blue status LED.
    pub led_blue: bool,
    /// HF attenuator select, low bit.
    pub sel0: bool,
    /// HF attenuator select, high bit.
    pub sel1: bool,
    /// Shut down the analog front end.
    pub shutdown: bool,
    /// Inject dither into the ADC quantizer.
    pub dither: bool,
    /// XOR the ADC output stream with the on-chip PRBS sequence.
    pub random: bool,
}

impl Gpio {
    /// All three LED lines.
    pub const LEDS: Gpio = Gpio::new()
        .with_led_red(true)
        .with_led_yellow(true)
        .with_led_blue(true);

    /// Both HF attenuator select lines.
    pub const ATTENUATOR: Gpio = Gpio::new().with_sel0(true).with_sel1(true);

    /// The raw shadow byte.
    pub fn bits(self) -> u8 {
        self.into()
    }
}

impl core::ops::BitOr for Gpio {
    type Output = Gpio;

    fn bitor(self, other: Gpio) -> Gpio {
        Gpio::from(self.bits() | other.bits())
    }
}

/// New shadow value with the lines in `mask` set from `pattern` and
/// everything else untouched.
pub(crate) fn apply(shadow: u8, pattern: Gpio, mask: Gpio) -> u8 {
    (shadow & !mask.bits()) | (pattern.bits() & mask.bits())
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck_macros::quickcheck;

    #[test]
    fn bit_assignments() {
        assert_eq!(Gpio::new().with_led_red(true).bits(), 0x01);
        assert_eq!(Gpio::new().with_led_yellow(true).bits(), 0x02);
        assert_eq!(Gpio::new().with_led_blue(true).bits(), 0x04);
        assert_eq!(Gpio::new().with_sel0(true).bits(), 0x08);
        assert_eq!(Gpio::new().with_sel1(true).bits(), 0x10);
        assert_eq!(Gpio::new().with_shutdown(true).bits(), 0x20);
        assert_eq!(Gpio::new().with_dither(true).bits(), 0x40);
        assert_eq!(Gpio::new().with_random(true).bits(), 0x80);
    }

    #[test]
    fn masks() {
        assert_eq!(Gpio::LEDS.bits(), 0x07);
        assert_eq!(Gpio::ATTENUATOR.bits(), 0x18);
        assert_eq!((Gpio::LEDS | Gpio::ATTENUATOR).bits(), 0x1f);
    }

    #[quickcheck]
    fn update_touches_only_the_mask(shadow: u8, pattern: u8, mask: u8) -> bool {
        let updated = apply(shadow, Gpio::from(pattern), Gpio::from(mask));
        let reverted = apply(updated, Gpio::new(), Gpio::from(mask));
        updated & !mask == shadow & !mask
            && updated & mask == pattern & mask
            && reverted & !mask == shadow & !mask
            && reverted & mask == 0
    }
}
