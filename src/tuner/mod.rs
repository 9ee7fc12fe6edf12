//! Driver for the R820T2 silicon tuner on the VHF path.
//!
//! The tuner hangs off the FX3's I2C bus. The driver keeps a 32-byte
//! shadow of the register file plus a dirty mask, so field updates can be
//! batched and flushed as contiguous register runs.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::usb::{ControlBus, VendorRequest};

pub mod registers;
use self::registers::{bitrev, Field, REGISTERS};

/// 7-bit I2C address of the tuner.
pub const TUNER_ADDR: u8 = 0x1a;

// the FX3 firmware takes the shifted 8-bit form on the wire
const ADDR_READ: u8 = TUNER_ADDR << 1;
const ADDR_WRITE: u8 = TUNER_ADDR << 1;

/// Tuner reference crystal, driven from the clock synthesizer's second
/// output.
pub const DEFAULT_XTAL_FREQUENCY: u32 = 32_000_000;

/// Intermediate frequency the ADC sees.
pub const DEFAULT_IF_FREQUENCY: u32 = 7_000_000;

/// LO frequency used while calibrating the IF filter.
const CALIBRATION_LO_FREQUENCY: f64 = 88e6;

const CALIBRATION_ATTEMPTS: usize = 5;

/// Ask the FX3 whether a tuner is fitted.
///
/// An error here almost always means older firmware with no tuner support,
/// so it reads as "no tuner" rather than a failure.
pub fn probe<B: ControlBus>(bus: &B) -> bool {
    let mut data = [0u8; 4];
    match bus.vendor_read(VendorRequest::TestFx3, 0, 0, &mut data) {
        Ok(()) => data[0] == 0,
        Err(_) => false,
    }
}

/// PLL divider solution for one LO frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PllParams {
    refdiv: u8,
    sel_div: u8,
    ni2c: u8,
    si2c: u8,
    /// Set to disable the fractional part of the PLL.
    pw_sdm: bool,
    sdm: u16,
}

/// RF multiplexer and tracking filter solution for one RF frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MuxParams {
    open_d: u8,
    rfmux: u8,
    rffilt: u8,
    tf_nch: u8,
    tf_lp: u8,
}

fn compute_pll_parameters(xtal_frequency: u32, refdiv: u8, frequency: f64) -> Result<PllParams> {
    const MIN_VCO_FREQUENCY: f64 = 1.77e9;
    const MAX_SEL_DIV: u8 = 5;
    const MIN_MULTIPLIER: f64 = 13.0;
    const MAX_MULTIPLIER: f64 = MIN_MULTIPLIER + 128.0;
    const FRAC_PRECISION: u32 = 65536;

    // VCO output divider
    let mut sel_div = 0u8;
    let mut vco_frequency = frequency * 2.0;
    while sel_div <= MAX_SEL_DIV && vco_frequency < MIN_VCO_FREQUENCY {
        sel_div += 1;
        vco_frequency *= 2.0;
    }
    if sel_div > MAX_SEL_DIV {
        return Err(Error::FrequencyTooLow(frequency));
    }

    // feedback multiplier against the (possibly divided) reference
    let refdiv_factor = if refdiv == 0 { 1.0 } else { 2.0 };
    let multiplier = vco_frequency / (refdiv_factor * xtal_frequency as f64);
    if !(MIN_MULTIPLIER..MAX_MULTIPLIER).contains(&multiplier) {
        return Err(Error::FrequencyOutOfRange(frequency));
    }

    let scaled = (multiplier * FRAC_PRECISION as f64 + 0.5) as u32;
    let mut mult_int = scaled / FRAC_PRECISION;
    let mut mult_frac = scaled % FRAC_PRECISION;

    // keep the sigma-delta modulator away from integer and half-integer
    // boundaries, where it spurs
    const MARGIN: u32 = FRAC_PRECISION / 128;
    const LOWER_HALF: u32 = FRAC_PRECISION / 2 - MARGIN / 2;
    const UPPER_HALF: u32 = FRAC_PRECISION / 2 + MARGIN / 2;
    if mult_frac < MARGIN {
        mult_frac = 0;
    } else if mult_frac > FRAC_PRECISION - MARGIN {
        mult_int += 1;
        mult_frac = 0;
    } else if mult_frac < FRAC_PRECISION / 2 && mult_frac > LOWER_HALF {
        mult_frac = LOWER_HALF;
    } else if mult_frac > FRAC_PRECISION / 2 && mult_frac < UPPER_HALF {
        mult_frac = UPPER_HALF;
    }

    Ok(PllParams {
        refdiv,
        sel_div,
        ni2c: ((mult_int - 13) / 4) as u8,
        si2c: ((mult_int - 13) % 4) as u8,
        pw_sdm: mult_frac == 0,
        sdm: mult_frac as u16,
    })
}

fn compute_mux_parameters(frequency: f64) -> MuxParams {
    // largest band whose start is at or below the frequency
    let mut row = &registers::BAND_TABLE[0];
    for candidate in &registers::BAND_TABLE[1..] {
        if frequency < candidate.lower_frequency {
            break;
        }
        row = candidate;
    }

    MuxParams {
        open_d: row.open_d >> 3,
        rfmux: (row.rf_mux_ploy & 0xc0) >> 6,
        rffilt: row.rf_mux_ploy & 0x03,
        tf_nch: (row.tf_c & 0xf0) >> 4,
        tf_lp: row.tf_c & 0x0f,
    }
}

/// A register-shadow driver for the tuner.
#[derive(Debug)]
pub struct Tuner<B> {
    bus: B,
    xtal_frequency: u32,
    if_frequency: u32,
    registers: [u8; REGISTERS],
    dirty: u32,
}

impl<B: ControlBus> Tuner<B> {
    /// Bring the tuner up: program the init vector, calibrate the IF
    /// filter, then read the whole register file back into the shadow.
    pub fn open(bus: B) -> Result<Tuner<B>> {
        let mut tuner = Tuner {
            bus,
            xtal_frequency: DEFAULT_XTAL_FREQUENCY,
            if_frequency: DEFAULT_IF_FREQUENCY,
            registers: registers::INIT_REGISTERS,
            dirty: 0,
        };
        tuner.write_registers(registers::WRITE_MASK)?;
        tuner.calibrate()?;
        tuner.read_registers(registers::READ_MASK)?;
        Ok(tuner)
    }

    pub fn xtal_frequency(&self) -> u32 {
        self.xtal_frequency
    }

    pub fn set_xtal_frequency(&mut self, xtal_frequency: u32) {
        self.xtal_frequency = xtal_frequency;
    }

    pub fn if_frequency(&self) -> u32 {
        self.if_frequency
    }

    pub fn set_if_frequency(&mut self, if_frequency: u32) {
        self.if_frequency = if_frequency;
    }

    /// Tune to `frequency` Hz: select the RF band, then lock the LO at
    /// `frequency + IF`.
    pub fn set_frequency(&mut self, frequency: f64) -> Result<()> {
        self.set_mux(frequency)?;
        self.set_pll(frequency + self.if_frequency as f64)
    }

    /// Tune using an odd LO harmonic, for frequencies beyond the PLL's
    /// fundamental range.
    pub fn set_harmonic_frequency(&mut self, frequency: f64, harmonic: u32) -> Result<()> {
        if harmonic == 0 || harmonic % 2 == 0 {
            return Err(Error::InvalidArgument("harmonic must be odd"));
        }
        self.set_mux(frequency)?;
        self.set_pll((frequency + self.if_frequency as f64) / harmonic as f64)
    }

    /// Gains the LNA can be set to, in dB.
    pub fn lna_gains(&self) -> &'static [i32] {
        &registers::LNA_GAINS
    }

    /// Gains the mixer can be set to, in dB.
    pub fn mixer_gains(&self) -> &'static [i32] {
        &registers::MIXER_GAINS
    }

    /// Gains the VGA can be set to, in dB.
    pub fn vga_gains(&self) -> &'static [i32] {
        &registers::VGA_GAINS
    }

    /// Set the LNA gain to `gain` dB, which must be one of [lna_gains][Self::lna_gains].
    pub fn set_lna_gain(&mut self, gain: i32) -> Result<()> {
        let code = registers::LNA_GAINS
            .iter()
            .position(|g| *g == gain)
            .ok_or(Error::InvalidArgument("not a supported LNA gain"))?;
        self.write_value(registers::LNA_GAIN, code as u8)
    }

    /// Hand LNA gain control to the AGC.
    pub fn set_lna_agc(&mut self, agc: bool) -> Result<()> {
        // the mode bit is "manual"
        self.write_value(registers::LNA_GAIN_MODE, if agc { 0 } else { 1 })
    }

    /// Set the mixer gain to `gain` dB, which must be one of
    /// [mixer_gains][Self::mixer_gains].
    pub fn set_mixer_gain(&mut self, gain: i32) -> Result<()> {
        let code = registers::MIXER_GAINS
            .iter()
            .position(|g| *g == gain)
            .ok_or(Error::InvalidArgument("not a supported mixer gain"))?;
        self.write_value(registers::MIX_GAIN, code as u8)
    }

    /// Hand mixer gain control to the AGC.
    pub fn set_mixer_agc(&mut self, agc: bool) -> Result<()> {
        self.write_value(registers::MIXGAIN_MODE, if agc { 1 } else { 0 })
    }

    /// Set the VGA gain to `gain` dB, which must be one of [vga_gains][Self::vga_gains].
    pub fn set_vga_gain(&mut self, gain: i32) -> Result<()> {
        let code = registers::VGA_GAINS
            .iter()
            .position(|g| *g == gain)
            .ok_or(Error::InvalidArgument("not a supported VGA gain"))?;
        self.write_value(registers::VGA_CODE, code as u8)
    }

    /// Bandwidths the IF filter can be programmed to, in Hz.
    pub fn if_bandwidths(&self) -> Vec<u32> {
        registers::IF_BANDWIDTH_TABLE
            .iter()
            .map(|row| row.bandwidth)
            .collect()
    }

    /// Program the IF filter to `bandwidth` Hz, which must be one of
    /// [if_bandwidths][Self::if_bandwidths].
    pub fn set_if_bandwidth(&mut self, bandwidth: u32) -> Result<()> {
        let row = registers::IF_BANDWIDTH_TABLE
            .iter()
            .find(|row| row.bandwidth == bandwidth)
            .ok_or(Error::Unsupported("not a supported IF bandwidth"))?;

        self.set_value(registers::FILT_CODE, row.reg_filt & 0x0f);
        self.set_value(registers::FILT_BW, (row.reg_bw & 0xe0) >> 5);
        self.set_value(registers::HPF, row.reg_bw & 0x0f);
        self.flush()
    }

    /// Power down the analog blocks, leaving the I2C interface alive.
    pub fn standby(&mut self) -> Result<()> {
        for (reg, value) in registers::STANDBY_REGISTERS {
            self.registers[reg as usize] = value;
            self.dirty |= 1 << reg;
        }
        self.flush()
    }

    /// Select the RF multiplexer and tracking filter for `frequency` Hz.
    pub fn set_mux(&mut self, frequency: f64) -> Result<()> {
        let params = compute_mux_parameters(frequency);
        self.apply_mux_parameters(&params)
    }

    /// Lock the LO PLL at `frequency` Hz.
    pub fn set_pll(&mut self, frequency: f64) -> Result<()> {
        let params = compute_pll_parameters(self.xtal_frequency, registers::REFDIV_PRESET, frequency)?;
        log::debug!("tuner pll {} Hz -> {:?}", frequency, params);
        self.apply_pll_parameters(&params)
    }

    fn apply_pll_parameters(&mut self, params: &PllParams) -> Result<()> {
        // PLL autotune at 128 kHz while acquiring
        self.write_value(registers::PLL_AUTO_CLK, 0)?;
        self.write_value(registers::VCO_CURRENT, 4)?;

        self.set_value(registers::REFDIV, params.refdiv);
        self.set_value(registers::SEL_DIV, params.sel_div);
        self.set_value(registers::PW_SDM, params.pw_sdm as u8);
        self.set_value(registers::SI2C, params.si2c);
        self.set_value(registers::NI2C, params.ni2c);
        self.set_value(registers::SDM_INL, (params.sdm & 0xff) as u8);
        self.set_value(registers::SDM_INH, (params.sdm >> 8) as u8);
        self.flush()?;

        std::thread::sleep(Duration::from_millis(1));
        let mut vco_indicator = self.read_value(registers::VCO_INDICATOR)?;

        // not locked: try a higher VCO current
        if vco_indicator & 0x40 == 0 {
            self.write_value(registers::VCO_CURRENT, 3)?;
            std::thread::sleep(Duration::from_millis(1));
            vco_indicator = self.read_value(registers::VCO_INDICATOR)?;
        }
        if vco_indicator & 0x40 == 0 {
            log::warn!("unable to get the tuner PLL to lock");
        }

        // back to 8 kHz autotune for tracking
        self.write_value(registers::PLL_AUTO_CLK, 2)
    }

    fn apply_mux_parameters(&mut self, params: &MuxParams) -> Result<()> {
        self.set_value(registers::OPEN_D, params.open_d);
        self.set_value(registers::RFMUX, params.rfmux);
        self.set_value(registers::RFFILT, params.rffilt);
        self.set_value(registers::TF_NCH, params.tf_nch);
        self.set_value(registers::TF_LP, params.tf_lp);

        // internal crystal, no added capacitance
        self.set_value(registers::XTAL_DRIVE, 0);
        self.set_value(registers::CAPX, 0);
        // mixer buffer on, high current, image gain adjustment min
        self.set_value(registers::PWD_AMP, 1);
        self.set_value(registers::PW0_AMP, 0);
        self.set_value(registers::IMR_G, 0);
        // IF filter on, high current, image phase adjustment min
        self.set_value(registers::PWD_IFFILT, 0);
        self.set_value(registers::PW1_IFFILT, 0);
        self.set_value(registers::IMR_P, 0);

        self.flush()
    }

    /// Run the IF filter calibration until the filter code comes back
    /// sane, up to five attempts.
    fn calibrate(&mut self) -> Result<()> {
        for _ in 0..CALIBRATION_ATTEMPTS {
            self.write_value(registers::FILT_CAP, 0)?;
            self.write_value(registers::CALI_CLK, 1)?;
            // xtal cap 0pF for the PLL
            self.write_value(registers::CAPX, 1)?;

            self.set_pll(CALIBRATION_LO_FREQUENCY)?;

            self.write_value(registers::CAL_TRIGGER, 1)?;
            std::thread::sleep(Duration::from_millis(2));
            self.write_value(registers::CAL_TRIGGER, 0)?;

            self.write_value(registers::CALI_CLK, 0)?;

            let cal_code = self.read_value(registers::FIL_CAL_CODE)?;
            if cal_code != 0 && cal_code != 0x0f {
                return Ok(());
            }
        }
        Err(Error::CalibrationFailed)
    }

    /// Value of a field in the shadow, without touching the device.
    pub fn get_value(&self, field: Field) -> u8 {
        field.extract(&self.registers)
    }

    /// Update a field in the shadow only, marking its register dirty.
    pub fn set_value(&mut self, field: Field, value: u8) {
        field.insert(&mut self.registers, value);
        self.dirty |= 1 << field.reg;
    }

    /// Update a field and write its register to the device immediately.
    pub fn write_value(&mut self, field: Field, value: u8) -> Result<()> {
        self.set_value(field, value);
        let reg = field.reg as usize;
        self.bus
            .i2c_write(ADDR_WRITE, field.reg, &self.registers[reg..reg + 1])?;
        self.dirty &= !(1 << field.reg);
        Ok(())
    }

    /// Read a field back from the device.
    ///
    /// The read path is only reliable from register 0, so this refreshes
    /// the whole shadow prefix up to the field's register.
    pub fn read_value(&mut self, field: Field) -> Result<u8> {
        let end = field.reg as usize + 1;
        self.bus
            .i2c_read(ADDR_READ, 0, &mut self.registers[..end])?;
        for reg in &mut self.registers[..end] {
            *reg = bitrev(*reg);
        }
        self.dirty &= !(((1u64 << end) - 1) as u32);
        Ok(field.extract(&self.registers))
    }

    /// Refresh every register named in `mask` (and anything below it,
    /// since reads start at register 0).
    pub fn read_registers(&mut self, mask: u32) -> Result<()> {
        let mask = mask & registers::READ_MASK;
        if mask == 0 {
            return Ok(());
        }
        let end = 32 - mask.leading_zeros() as usize;
        self.bus
            .i2c_read(ADDR_READ, 0, &mut self.registers[..end])?;
        for reg in &mut self.registers[..end] {
            *reg = bitrev(*reg);
        }
        self.dirty &= !(((1u64 << end) - 1) as u32);
        Ok(())
    }

    /// Flush all dirty registers to the device.
    pub fn flush(&mut self) -> Result<()> {
        self.write_registers(self.dirty)
    }

    /// Write every writable register named in `mask`, batching contiguous
    /// runs into single transfers.
    pub fn write_registers(&mut self, mask: u32) -> Result<()> {
        let mask = mask & registers::WRITE_MASK;
        let mut from: Option<usize> = None;
        for i in 0..=REGISTERS {
            let set = i < REGISTERS && mask & (1 << i) != 0;
            if set {
                from.get_or_insert(i);
            } else if let Some(start) = from.take() {
                self.bus
                    .i2c_write(ADDR_WRITE, start as u8, &self.registers[start..i])?;
            }
        }
        self.dirty &= !mask;
        Ok(())
    }

    #[cfg(test)]
    fn bus(&self) -> &B {
        &self.bus
    }
}

#[cfg(test)]
mod test {
    use super::registers::*;
    use super::*;
    use crate::testing::MockBus;

    use std::cell::RefCell;
    use std::rc::Rc;

    use quickcheck_macros::quickcheck;

    /// A simulated tuner behind the mock bus: writes land in a register
    /// file, reads come back bit-reversed like the real part.
    fn sim_bus(regs: Rc<RefCell<[u8; REGISTERS]>>) -> MockBus {
        let write_regs = regs.clone();
        let read_regs = regs;
        MockBus::new()
            .on_write(move |write| {
                if write.request == VendorRequest::I2cWriteFx3 as u8
                    && write.value == ADDR_WRITE as u16
                {
                    let start = write.index as usize;
                    let mut regs = write_regs.borrow_mut();
                    for (i, byte) in write.data.iter().enumerate() {
                        // the status registers ignore writes, including
                        // the calibration code readout
                        if (5..REGISTERS).contains(&(start + i)) {
                            regs[start + i] = *byte;
                        }
                    }
                }
            })
            .on_read(move |request, value, index, buf| {
                if request == VendorRequest::I2cReadFx3 as u8 && value == ADDR_READ as u16 {
                    let regs = read_regs.borrow();
                    let start = index as usize;
                    for (i, out) in buf.iter_mut().enumerate() {
                        *out = bitrev(regs[(start + i) % REGISTERS]);
                    }
                } else {
                    buf.fill(0);
                }
                Ok(buf.len())
            })
    }

    fn healthy_chip() -> Rc<RefCell<[u8; REGISTERS]>> {
        let mut regs = [0u8; REGISTERS];
        regs[0x02] = 0x40; // PLL locked
        regs[0x04] = 0x04; // plausible filter calibration code
        Rc::new(RefCell::new(regs))
    }

    #[test]
    fn open_programs_init_vector_and_syncs() {
        let regs = healthy_chip();
        let tuner = Tuner::open(sim_bus(regs.clone())).unwrap();

        // the shadow ends up agreeing with the device
        assert_eq!(tuner.registers, *regs.borrow());
        assert_eq!(tuner.dirty, 0);
        // calibration must leave the trigger deasserted
        assert_eq!(tuner.get_value(CAL_TRIGGER), 0);
    }

    #[test]
    fn calibration_gives_up_after_five_attempts() {
        let regs = healthy_chip();
        regs.borrow_mut()[0x04] = 0x0f; // calibration never converges
        let bus = sim_bus(regs);

        let err = match Tuner::open(bus) {
            Err(e) => e,
            Ok(_) => panic!("open should fail"),
        };
        assert!(matches!(err, Error::CalibrationFailed));
    }

    #[test]
    fn pll_programs_expected_dividers() {
        let regs = healthy_chip();
        let mut tuner = Tuner::open(sim_bus(regs)).unwrap();

        // 100 MHz RF with a 7 MHz IF: LO at 107 MHz
        tuner.set_frequency(100e6).unwrap();

        assert_eq!(tuner.get_value(SEL_DIV), 4);
        assert_eq!(tuner.get_value(NI2C), 10);
        assert_eq!(tuner.get_value(SI2C), 0);
        assert_eq!(tuner.get_value(SDM_INL), 0x00);
        assert_eq!(tuner.get_value(SDM_INH), 0x80);
        assert_eq!(tuner.get_value(PW_SDM), 0);
        assert_eq!(tuner.get_value(REFDIV), REFDIV_PRESET);
        // autotune back at 8 kHz, nothing left unflushed
        assert_eq!(tuner.get_value(PLL_AUTO_CLK), 2);
        assert_eq!(tuner.dirty, 0);
    }

    #[test]
    fn pll_rejects_out_of_range() {
        assert!(matches!(
            compute_pll_parameters(32_000_000, 1, 20e6),
            Err(Error::FrequencyTooLow(_))
        ));
        assert!(matches!(
            compute_pll_parameters(32_000_000, 1, 5e9),
            Err(Error::FrequencyOutOfRange(_))
        ));
    }

    #[test]
    fn pll_integer_lo() {
        // 88 MHz calibration LO: VCO 2.816 GHz, M = 44 exactly
        let params = compute_pll_parameters(32_000_000, 1, 88e6).unwrap();
        assert_eq!(params.sel_div, 4);
        assert_eq!(params.ni2c, 7);
        assert_eq!(params.si2c, 3);
        assert!(params.pw_sdm);
        assert_eq!(params.sdm, 0);
    }

    #[test]
    fn boundary_spur_snapping() {
        // M = 50.005: fraction 328/65536, inside the low margin
        let params = compute_pll_parameters(32_000_000, 1, 100.01e6).unwrap();
        assert_eq!(params.sdm, 0);
        assert!(params.pw_sdm);
        assert_eq!(params.ni2c, 9);
        assert_eq!(params.si2c, 1);

        // M = 50.4999: just below half, snapped down to the guard value
        let params = compute_pll_parameters(32_000_000, 1, 100.9998e6).unwrap();
        assert_eq!(params.sdm, 32512);

        // M = 50.5001: just above half, snapped up
        let params = compute_pll_parameters(32_000_000, 1, 101.0002e6).unwrap();
        assert_eq!(params.sdm, 33024);

        // M = 50.999: almost integer, carried into the integer part
        let params = compute_pll_parameters(32_000_000, 1, 101.998e6).unwrap();
        assert_eq!(params.sdm, 0);
        assert!(params.pw_sdm);
        assert_eq!(params.ni2c, 9);
        assert_eq!(params.si2c, 2);
    }

    #[quickcheck]
    fn pll_encoding_reconstructs_multiplier(frequency: u32) -> bool {
        // LO anywhere from 30 MHz to 1.8 GHz
        let frequency = 30e6 + (frequency % 1_770_000_000) as f64;
        let params = match compute_pll_parameters(32_000_000, 1, frequency) {
            Ok(params) => params,
            Err(_) => return false,
        };

        let encoded =
            13.0 + 4.0 * params.ni2c as f64 + params.si2c as f64 + params.sdm as f64 / 65536.0;
        let vco = frequency * 2f64.powi(params.sel_div as i32 + 1);
        let multiplier = vco / (2.0 * 32e6);
        // within rounding plus the boundary-spur snap margin
        params.sel_div <= 5 && (encoded - multiplier).abs() <= 513.0 / 65536.0
    }

    #[test]
    fn mux_band_selection() {
        let params = compute_mux_parameters(100e6);
        assert_eq!(params.open_d, 0);
        assert_eq!(params.rfmux, 0);
        assert_eq!(params.rffilt, 2);
        assert_eq!(params.tf_nch, 3);
        assert_eq!(params.tf_lp, 4);

        // below the second band: the first row
        let params = compute_mux_parameters(10e6);
        assert_eq!(params.open_d, 1);
        assert_eq!(params.tf_nch, 0xd);
        assert_eq!(params.tf_lp, 0xf);

        // beyond the last row: stays on the last row
        let params = compute_mux_parameters(900e6);
        assert_eq!(params.rfmux, 1);
        assert_eq!(params.rffilt, 0);
        assert_eq!(params.tf_nch, 0);
        assert_eq!(params.tf_lp, 0);
    }

    #[test]
    fn if_bandwidth_bytes() {
        let regs = healthy_chip();
        let mut tuner = Tuner::open(sim_bus(regs.clone())).unwrap();
        let writes_before = tuner.bus().writes().len();

        tuner.set_if_bandwidth(2_200_000).unwrap();

        assert_eq!(tuner.get_value(FILT_CODE), 0x0f);
        assert_eq!(regs.borrow()[0x0a] & 0x0f, 0x0f);
        assert_eq!(regs.borrow()[0x0b], 0x8f);

        // flushed as one contiguous run over registers 0x0a..=0x0b
        let writes = tuner.bus().writes();
        assert_eq!(writes.len(), writes_before + 1);
        let flush = &writes[writes_before];
        assert_eq!(flush.index, 0x0a);
        assert_eq!(flush.data, vec![regs.borrow()[0x0a], 0x8f]);
    }

    #[test]
    fn unknown_bandwidth_is_unsupported() {
        let regs = healthy_chip();
        let mut tuner = Tuner::open(sim_bus(regs)).unwrap();
        assert!(matches!(
            tuner.set_if_bandwidth(2_000_000),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn gain_staging() {
        let regs = healthy_chip();
        let mut tuner = Tuner::open(sim_bus(regs)).unwrap();

        tuner.set_lna_gain(24).unwrap();
        assert_eq!(tuner.get_value(LNA_GAIN), 12);
        assert!(matches!(
            tuner.set_lna_gain(7),
            Err(Error::InvalidArgument(_))
        ));

        tuner.set_mixer_gain(9).unwrap();
        assert_eq!(tuner.get_value(MIX_GAIN), 9);

        tuner.set_vga_gain(15).unwrap();
        assert_eq!(tuner.get_value(VGA_CODE), 15);

        // AGC flips the mode bits; LNA's is inverted ("manual")
        tuner.set_lna_agc(true).unwrap();
        assert_eq!(tuner.get_value(LNA_GAIN_MODE), 0);
        tuner.set_lna_agc(false).unwrap();
        assert_eq!(tuner.get_value(LNA_GAIN_MODE), 1);
        tuner.set_mixer_agc(true).unwrap();
        assert_eq!(tuner.get_value(MIXGAIN_MODE), 1);
    }

    #[test]
    fn standby_table() {
        let regs = healthy_chip();
        let mut tuner = Tuner::open(sim_bus(regs.clone())).unwrap();

        tuner.standby().unwrap();
        assert_eq!(tuner.dirty, 0);
        for (reg, value) in STANDBY_REGISTERS {
            assert_eq!(regs.borrow()[reg as usize], value, "register {:#04x}", reg);
        }
    }

    #[test]
    fn harmonic_tuning() {
        let regs = healthy_chip();
        let mut tuner = Tuner::open(sim_bus(regs)).unwrap();

        assert!(matches!(
            tuner.set_harmonic_frequency(1.2e9, 2),
            Err(Error::InvalidArgument(_))
        ));

        // LO = (1.2 GHz + 7 MHz) / 3, well inside the fundamental range
        tuner.set_harmonic_frequency(1.2e9, 3).unwrap();
        let expected =
            compute_pll_parameters(32_000_000, REFDIV_PRESET, (1.2e9 + 7e6) / 3.0).unwrap();
        assert_eq!(tuner.get_value(SEL_DIV), expected.sel_div);
        assert_eq!(tuner.get_value(NI2C), expected.ni2c);
    }

    #[test]
    fn dirty_mask_batches() {
        let regs = healthy_chip();
        let mut tuner = Tuner::open(sim_bus(regs)).unwrap();
        let writes_before = tuner.bus().writes().len();

        // two separated registers dirty: 0x05 and 0x07
        tuner.set_value(LNA_GAIN, 3);
        tuner.set_value(MIX_GAIN, 5);
        tuner.set_value(PWD_MIX, 1);
        assert_eq!(tuner.dirty, (1 << 0x05) | (1 << 0x07));

        tuner.flush().unwrap();
        assert_eq!(tuner.dirty, 0);

        let writes = tuner.bus().writes();
        assert_eq!(writes.len(), writes_before + 2);
        assert_eq!(writes[writes_before].index, 0x05);
        assert_eq!(writes[writes_before].data.len(), 1);
        assert_eq!(writes[writes_before + 1].index, 0x07);
        assert_eq!(writes[writes_before + 1].data.len(), 1);
    }

    #[test]
    fn probe_reads_model_byte() {
        let bus = MockBus::new().on_read(|request, _, _, buf| {
            assert_eq!(request, VendorRequest::TestFx3 as u8);
            buf.fill(0);
            Ok(buf.len())
        });
        assert!(probe(&bus));

        let bus = MockBus::new().on_read(|_, _, _, buf| {
            buf.fill(1);
            Ok(buf.len())
        });
        assert!(!probe(&bus));

        let bus = MockBus::new().on_read(|_, _, _, _| Err(Error::Usb(rusb::Error::Pipe)));
        assert!(!probe(&bus));
    }

    #[test]
    fn read_clears_dirty_prefix() {
        let regs = healthy_chip();
        let mut tuner = Tuner::open(sim_bus(regs)).unwrap();

        tuner.set_value(LNA_GAIN, 3); // register 0x05
        tuner.set_value(SDM_INL, 9); // register 0x15
        let _ = tuner.read_value(FIL_CAL_CODE).unwrap(); // reads 0..=0x04

        // the read only covered registers below 0x05, so both survive
        assert_eq!(tuner.dirty, (1 << 0x05) | (1 << 0x15));

        tuner.read_registers(1 << 0x05).unwrap();
        assert_eq!(tuner.dirty, 1 << 0x15);
    }
}
