//! The Si5351 dual-output clock synthesizer.
//!
//! Output 0 clocks the ADC, output 1 feeds the tuner crystal input. Each
//! output is synthesized as
//!
//! ```text
//! f_out = f_xtal * (a + b/c) / (OUT * 2^R)
//! ```
//!
//! where `a + b/c` is the fractional feedback multisynth, `OUT` an even
//! integer output divider, and `R` a power-of-two post divider that pushes
//! sub-megahertz outputs back into the multisynth's range. Register
//! encodings follow the manufacturer's application note.

use crate::error::{Error, Result};
use crate::usb::ControlBus;

/// I2C address of the synthesizer.
pub const SI5351_ADDR: u8 = 0x60;

/// Crystal frequency on the receiver board.
pub const DEFAULT_XTAL_FREQUENCY: f64 = 27e6;

const REG_CLK_BASE: u8 = 16;
const REG_MSNA_BASE: u8 = 26;
const REG_MSNB_BASE: u8 = 34;
const REG_MS0_BASE: u8 = 42;
const REG_MS1_BASE: u8 = 50;
const REG_PLL_RESET: u8 = 177;
const REG_CRYSTAL_LOAD: u8 = 183;

/// 10 pF crystal load capacitance, reserved bits as documented.
const CRYSTAL_LOAD_10PF: u8 = 0xd2;

const CLK_POWERDOWN: u8 = 0x80;
const CLK_INT_MODE: u8 = 0x40;
const CLK_SRC_PLL_B: u8 = 0x20;
const CLK_SRC_MULTISYNTH: u8 = 0x0c;
const CLK_DRIVE_8MA: u8 = 0x03;

const PLL_RESET_A: u8 = 0x20;
const PLL_RESET_B: u8 = 0x80;

/// The VCO must stay at or below this.
const MAX_VCO_FREQUENCY: f64 = 900e6;

/// Below this the R divider takes over.
const MIN_MS_FREQUENCY: f64 = 1e6;

const MAX_R_DIVIDER: u8 = 7;
const MIN_OUTPUT_DIVIDER: u32 = 4;
const MAX_OUTPUT_DIVIDER: u32 = 2048;

/// Feedback fraction denominator limit (20 bits).
const MAX_DENOMINATOR: u32 = 1_048_575;

/// The two synthesizer outputs and what they drive on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockOutput {
    /// Output 0: the ADC sample clock, from PLL A.
    Adc,
    /// Output 1: the tuner reference clock, from PLL B.
    Tuner,
}

impl ClockOutput {
    pub fn index(self) -> u8 {
        match self {
            ClockOutput::Adc => 0,
            ClockOutput::Tuner => 1,
        }
    }
}

/// Divider solution for one output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ClockPlan {
    pub r_divider: u8,
    pub output_divider: u32,
    pub fb_int: u32,
    pub fb_num: u32,
    pub fb_den: u32,
}

impl ClockPlan {
    /// The feedback factor `a + b/c` this plan realizes.
    pub fn feedback(&self) -> f64 {
        self.fb_int as f64 + self.fb_num as f64 / self.fb_den as f64
    }
}

/// Driver for the synthesizer, owning its I2C traffic.
#[derive(Debug)]
pub struct ClockSynth<B> {
    bus: B,
    xtal_frequency: f64,
    correction: f64,
}

impl<B: ControlBus> ClockSynth<B> {
    /// Open the synthesizer: set the crystal load and power down all eight
    /// clock channels until something is requested.
    pub fn open(bus: B, xtal_frequency: f64, correction: f64) -> Result<ClockSynth<B>> {
        let synth = ClockSynth {
            bus,
            xtal_frequency,
            correction,
        };
        synth.write_reg(REG_CRYSTAL_LOAD, &[CRYSTAL_LOAD_10PF])?;
        synth.power_down_all()?;
        Ok(synth)
    }

    /// Power down every clock channel.
    pub fn power_down(&self) -> Result<()> {
        self.power_down_all()
    }

    /// Power everything down and give the bus back.
    pub fn close(self) -> Result<B> {
        self.power_down_all()?;
        Ok(self.bus)
    }

    pub fn xtal_frequency(&self) -> f64 {
        self.xtal_frequency
    }

    /// Frequency-correction factor, near 1.0.
    pub fn correction(&self) -> f64 {
        self.correction
    }

    pub fn set_correction(&mut self, correction: f64) -> Result<()> {
        if !(correction.is_finite() && correction > 0.0) {
            return Err(Error::InvalidArgument("correction must be positive"));
        }
        self.correction = correction;
        Ok(())
    }

    /// Program `output` to `frequency` Hz and enable it.
    pub fn set_clock(&self, output: ClockOutput, frequency: f64) -> Result<()> {
        let plan = self.plan(frequency)?;
        log::debug!(
            "clock {}: {} Hz -> fb {}+{}/{}, out {}, r {}",
            output.index(),
            frequency,
            plan.fb_int,
            plan.fb_num,
            plan.fb_den,
            plan.output_divider,
            plan.r_divider
        );
        self.apply(output, &plan)
    }

    /// Disable `output`.
    pub fn disable_clock(&self, output: ClockOutput) -> Result<()> {
        self.write_reg(REG_CLK_BASE + output.index(), &[CLK_POWERDOWN])
    }

    /// Compute the divider solution for `frequency` Hz.
    pub(crate) fn plan(&self, frequency: f64) -> Result<ClockPlan> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(Error::InvalidArgument("frequency must be positive"));
        }

        // push sub-megahertz requests up with the R divider
        let mut r_divider = 0u8;
        let mut f_r = frequency;
        if frequency < MIN_MS_FREQUENCY {
            while f_r <= MIN_MS_FREQUENCY {
                if r_divider == MAX_R_DIVIDER {
                    return Err(Error::FrequencyTooLow(frequency));
                }
                r_divider += 1;
                f_r *= 2.0;
            }
        }

        // largest even output divider keeping the VCO at or below its limit
        let mut output_divider = (MAX_VCO_FREQUENCY / f_r) as u32 & !1;
        if output_divider > MAX_OUTPUT_DIVIDER {
            output_divider = MAX_OUTPUT_DIVIDER;
        }
        if output_divider < MIN_OUTPUT_DIVIDER {
            return Err(Error::FrequencyTooHigh(frequency));
        }

        let xtal = self.xtal_frequency / self.correction;
        let feedback = output_divider as f64 * f_r / xtal;
        let (fb_int, fb_num, fb_den) = best_rational(feedback, MAX_DENOMINATOR);

        Ok(ClockPlan {
            r_divider,
            output_divider,
            fb_int,
            fb_num,
            fb_den,
        })
    }

    fn apply(&self, output: ClockOutput, plan: &ClockPlan) -> Result<()> {
        let (fb_base, ms_base, reset_bit, src_bit) = match output {
            ClockOutput::Adc => (REG_MSNA_BASE, REG_MS0_BASE, PLL_RESET_A, 0),
            ClockOutput::Tuner => (REG_MSNB_BASE, REG_MS1_BASE, PLL_RESET_B, CLK_SRC_PLL_B),
        };

        // feedback multisynth: a + b/c
        let c = plan.fb_den as u64;
        let b = plan.fb_num as u64;
        let scaled = 128 * b / c;
        let fb_p1 = (128 * plan.fb_int as u64 + scaled - 512) as u32;
        let fb_p2 = (128 * b - c * scaled) as u32;
        let fb_p3 = plan.fb_den;
        self.write_reg(fb_base, &multisynth_bytes(fb_p1, fb_p2, fb_p3, 0))?;

        // output multisynth: an even integer, so b = 0, c = 1
        let out_p1 = 128 * plan.output_divider - 512;
        self.write_reg(ms_base, &multisynth_bytes(out_p1, 0, 1, plan.r_divider))?;

        // latch: pulse the PLL reset, then point the output at its multisynth
        self.write_reg(REG_PLL_RESET, &[reset_bit])?;
        let control = CLK_INT_MODE | CLK_SRC_MULTISYNTH | CLK_DRIVE_8MA | src_bit;
        self.write_reg(REG_CLK_BASE + output.index(), &[control])?;
        Ok(())
    }

    fn power_down_all(&self) -> Result<()> {
        for channel in 0..8 {
            self.write_reg(REG_CLK_BASE + channel, &[CLK_POWERDOWN])?;
        }
        Ok(())
    }

    fn write_reg(&self, reg: u8, data: &[u8]) -> Result<()> {
        self.bus.i2c_write(SI5351_ADDR, reg, data)
    }
}

/// Pack a multisynth parameter group into its eight registers.
///
/// The R divider shares a byte with the top bits of P1, and the high
/// nibbles of P3 and P2 share another.
fn multisynth_bytes(p1: u32, p2: u32, p3: u32, r_divider: u8) -> [u8; 8] {
    [
        ((p3 >> 8) & 0xff) as u8,
        (p3 & 0xff) as u8,
        (((p1 >> 16) & 0x03) as u8) | (r_divider << 5),
        ((p1 >> 8) & 0xff) as u8,
        (p1 & 0xff) as u8,
        ((((p3 >> 16) & 0x0f) << 4) | ((p2 >> 16) & 0x0f)) as u8,
        ((p2 >> 8) & 0xff) as u8,
        (p2 & 0xff) as u8,
    ]
}

/// Best rational approximation of `value` with denominator at most
/// `max_denominator`, as `(integer, numerator, denominator)`.
///
/// Walks the continued-fraction convergents of `value`, checking the
/// semiconvergents of each term, and keeps the closest fraction whose
/// denominator fits.
fn best_rational(value: f64, max_denominator: u32) -> (u32, u32, u32) {
    const EPSILON: f64 = 1e-5;
    const MAX_ITERATIONS: usize = 100;

    // p/q convergents, seeded so p_n = a_n*p1 + p0
    let mut p0: u64 = 0;
    let mut p1: u64 = 1;
    let mut q0: u64 = 1;
    let mut q1: u64 = 0;

    let mut best = (value as u64, 1u64);
    let mut best_error = (value - value.trunc()).abs();

    let mut x = value;
    for _ in 0..MAX_ITERATIONS {
        let term = x.trunc() as u64;

        // semiconvergents m*p1 + p0 for m in ceil(term/2)..=term
        let mut m = term / 2 + term % 2;
        while m <= term {
            let p = m * p1 + p0;
            let q = m * q1 + q0;
            if q > 0 && q <= max_denominator as u64 {
                let error = (value - p as f64 / q as f64).abs();
                if error < best_error {
                    best = (p, q);
                    best_error = error;
                }
            }
            m += 1;
        }

        let p = term * p1 + p0;
        let q = term * q1 + q0;
        p0 = p1;
        p1 = p;
        q0 = q1;
        q1 = q;

        if q1 > max_denominator as u64 {
            break;
        }
        let frac = x - term as f64;
        if frac < EPSILON {
            break;
        }
        x = 1.0 / frac;
    }

    let (p, q) = best;
    ((p / q) as u32, (p % q) as u32, q as u32)
}
