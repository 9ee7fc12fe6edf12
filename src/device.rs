//! The receiver facade.
//!
//! A [Device] owns the transport, the clock synthesizer, the streaming
//! pipeline, and (on the VHF path) the tuner, and sequences them so the
//! individual drivers never see each other.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::adc::Adc;
use crate::clock::{ClockOutput, ClockSynth};
use crate::error::{Error, Result};
use crate::tuner::{self, Tuner};
use crate::usb::{ControlBus, Gpio, UsbDevice, VendorRequest};

/// Lifecycle state of a receiver handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Closed; only good for dropping.
    Off,
    /// Open and configurable.
    Ready,
    /// Bulk data is flowing.
    Streaming,
    /// A control-path failure left the device inconsistent; only
    /// [close][Device::close] is valid.
    Failed,
}

/// Which RF input feeds the ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RfMode {
    /// No input selected yet.
    #[default]
    None,
    /// Direct sampling of the VLF port.
    Vlf,
    /// Direct sampling of the HF antenna through the step attenuator.
    Hf,
    /// The silicon tuner's IF output.
    Vhf,
}

/// Status LEDs on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Led {
    Red,
    Yellow,
    Blue,
}

impl Led {
    fn gpio(self) -> Gpio {
        match self {
            Led::Red => Gpio::new().with_led_red(true),
            Led::Yellow => Gpio::new().with_led_yellow(true),
            Led::Blue => Gpio::new().with_led_blue(true),
        }
    }
}

/// GPIO pattern for an HF attenuation step; the mask is
/// [Gpio::ATTENUATOR].
fn attenuation_pattern(db: u32) -> Result<Gpio> {
    match db {
        0 => Ok(Gpio::new().with_sel1(true)),
        10 => Ok(Gpio::new().with_sel0(true).with_sel1(true)),
        20 => Ok(Gpio::new().with_sel0(true)),
        _ => Err(Error::InvalidArgument("attenuation must be 0, 10 or 20 dB")),
    }
}

/// An open receiver.
pub struct Device {
    usb: Arc<UsbDevice>,
    clock: ClockSynth<Arc<UsbDevice>>,
    tuner: Option<Tuner<Arc<UsbDevice>>>,
    adc: Adc,
    has_tuner: bool,
    status: Status,
    rf_mode: RfMode,
}

impl Device {
    /// Open the `index`th attached receiver.
    ///
    /// `firmware_path` names the FX3 image to upload if the device is
    /// still in boot-loader mode; it is only read in that case but there
    /// is no way to know beforehand, so pass it whenever you have one.
    pub fn open(index: usize, firmware_path: Option<&Path>) -> Result<Device> {
        let image = match firmware_path {
            Some(path) => Some(std::fs::read(path)?),
            None => None,
        };
        let usb = Arc::new(UsbDevice::open(index, image.as_deref(), Gpio::new())?);

        let clock = ClockSynth::open(
            usb.clone(),
            crate::clock::DEFAULT_XTAL_FREQUENCY,
            1.0,
        )?;
        let has_tuner = tuner::probe(&usb);
        log::debug!("device {} open, tuner fitted: {}", index, has_tuner);

        Ok(Device {
            adc: Adc::new(usb.clone()),
            usb,
            clock,
            tuner: None,
            has_tuner,
            status: Status::Ready,
            rf_mode: RfMode::None,
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn rf_mode(&self) -> RfMode {
        self.rf_mode
    }

    /// Whether the receiver has a tuner for the VHF path.
    pub fn has_tuner(&self) -> bool {
        self.has_tuner
    }

    fn require(&self, status: Status) -> Result<()> {
        if self.status == status {
            Ok(())
        } else {
            Err(Error::State(self.status))
        }
    }

    fn require_open(&self) -> Result<()> {
        match self.status {
            Status::Ready | Status::Streaming => Ok(()),
            Status::Off | Status::Failed => Err(Error::State(self.status)),
        }
    }

    fn fail<T>(&mut self, error: Error) -> Result<T> {
        self.status = Status::Failed;
        Err(error)
    }

    /// Shut the receiver down. Streaming is stopped and the front end
    /// powered off, best effort; the handle is unusable afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.status == Status::Off {
            return Err(Error::State(Status::Off));
        }
        if self.status == Status::Streaming {
            let _ = self.adc.stop();
        }
        if let Some(mut tuner) = self.tuner.take() {
            let _ = tuner.standby();
        }
        let _ = self.clock.power_down();
        self.status = Status::Off;
        Ok(())
    }

    /// Reset the FX3 back into its boot-loader, abandoning the running
    /// firmware. The handle is closed afterwards; re-open (with an image)
    /// to use the device again.
    pub fn reset(&mut self) -> Result<()> {
        self.require_open()?;
        if self.status == Status::Streaming {
            let _ = self.adc.stop();
        }
        // the FX3 drops off the bus as soon as it takes the request, so
        // an I/O failure on this one is expected
        let _ = self
            .usb
            .vendor_write(VendorRequest::ResetFx3, 0, 0, &[]);
        self.status = Status::Off;
        Ok(())
    }

    /// Select which RF input feeds the ADC.
    ///
    /// Switching to [Vhf][RfMode::Vhf] brings the tuner up, which needs
    /// its reference clock running first; switching away tears the tuner
    /// down.
    pub fn set_rf_mode(&mut self, mode: RfMode) -> Result<()> {
        self.require(Status::Ready)?;

        match mode {
            RfMode::Vhf => {
                if !self.has_tuner {
                    return Err(Error::Unsupported("no tuner fitted"));
                }
                if self.tuner.is_none() {
                    let xtal = tuner::DEFAULT_XTAL_FREQUENCY as f64;
                    if let Err(e) = self.clock.set_clock(ClockOutput::Tuner, xtal) {
                        return self.fail(e);
                    }
                    match Tuner::open(self.usb.clone()) {
                        Ok(tuner) => self.tuner = Some(tuner),
                        Err(e) => return self.fail(e),
                    }
                }
                self.usb.gpio_set(Gpio::new(), Gpio::ATTENUATOR)?;
            }
            RfMode::Hf | RfMode::Vlf => {
                if let Some(mut tuner) = self.tuner.take() {
                    let _ = tuner.standby();
                    let _ = self.clock.disable_clock(ClockOutput::Tuner);
                }
                // default to 0 dB attenuation on the direct path
                self.usb.gpio_set(attenuation_pattern(0)?, Gpio::ATTENUATOR)?;
            }
            RfMode::None => {
                if let Some(mut tuner) = self.tuner.take() {
                    let _ = tuner.standby();
                    let _ = self.clock.disable_clock(ClockOutput::Tuner);
                }
            }
        }

        self.rf_mode = mode;
        Ok(())
    }

    pub fn led_on(&mut self, led: Led) -> Result<()> {
        self.require_open()?;
        self.usb.gpio_on(led.gpio())?;
        Ok(())
    }

    pub fn led_off(&mut self, led: Led) -> Result<()> {
        self.require_open()?;
        self.usb.gpio_off(led.gpio())?;
        Ok(())
    }

    pub fn led_toggle(&mut self, led: Led) -> Result<()> {
        self.require_open()?;
        self.usb.gpio_toggle(led.gpio())?;
        Ok(())
    }

    /// Inject dither into the ADC quantizer.
    pub fn adc_dither(&mut self, on: bool) -> Result<()> {
        self.require_open()?;
        let dither = Gpio::new().with_dither(true);
        self.usb.gpio_set(if on { dither } else { Gpio::new() }, dither)?;
        Ok(())
    }

    /// XOR the ADC output with the on-chip PRBS randomizer.
    ///
    /// Only the framing changes on the wire; undoing the XOR is the
    /// consumer's job.
    pub fn adc_randomizer(&mut self, on: bool) -> Result<()> {
        self.require_open()?;
        let random = Gpio::new().with_random(true);
        self.usb.gpio_set(if on { random } else { Gpio::new() }, random)?;
        Ok(())
    }

    /// Set the HF step attenuator: 0, 10 or 20 dB.
    pub fn set_hf_attenuation(&mut self, db: u32) -> Result<()> {
        self.require_open()?;
        let pattern = attenuation_pattern(db)?;
        self.usb.gpio_set(pattern, Gpio::ATTENUATOR)?;
        Ok(())
    }

    /// Adjust the synthesizer's frequency-correction factor.
    pub fn set_frequency_correction(&mut self, correction: f64) -> Result<()> {
        self.require(Status::Ready)?;
        self.clock.set_correction(correction)
    }

    /// Set the ADC sample rate, in samples per second. Takes effect at
    /// [start_streaming][Device::start_streaming].
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        self.require(Status::Ready)?;
        // make sure the synthesizer can actually produce it
        self.clock.plan(sample_rate as f64).map(|_| ())?;
        self.adc.set_sample_rate(sample_rate)
    }

    /// Configure the asynchronous pipeline: `num_frames` transfers of
    /// `frame_size` bytes (zero picks the defaults) feeding `callback`.
    ///
    /// The callback runs inside [handle_events][Device::handle_events];
    /// it must not block or call back into this handle.
    pub fn set_async_params<F>(
        &mut self,
        frame_size: usize,
        num_frames: usize,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.require(Status::Ready)?;
        self.adc.open_async(frame_size, num_frames, Box::new(callback))
    }

    /// Start streaming: program the ADC clock, arm the pipeline, start
    /// the GPIF engine.
    pub fn start_streaming(&mut self) -> Result<()> {
        self.require(Status::Ready)?;
        let sample_rate = self
            .adc
            .sample_rate()
            .ok_or(Error::InvalidArgument("sample rate not set"))?;
        if !self.adc.is_async_ready() {
            return Err(Error::InvalidArgument("async parameters not set"));
        }

        if let Err(e) = self.clock.set_clock(ClockOutput::Adc, sample_rate as f64) {
            return self.fail(e);
        }
        if let Err(e) = self.adc.start() {
            return self.fail(e);
        }
        self.status = Status::Streaming;
        Ok(())
    }

    /// Pump transfer completions; stream callbacks run inside this call.
    pub fn handle_events(&mut self, timeout: Duration) -> Result<()> {
        self.require_open()?;
        self.adc.handle_events(timeout)
    }

    /// Stop streaming. No callback runs after this returns. Calling it
    /// again once stopped is a no-op.
    pub fn stop_streaming(&mut self) -> Result<()> {
        match self.status {
            Status::Ready => Ok(()),
            Status::Streaming => {
                if let Err(e) = self.adc.stop() {
                    return self.fail(e);
                }
                self.status = Status::Ready;
                Ok(())
            }
            status => Err(Error::State(status)),
        }
    }

    /// Bytes delivered to the stream callback since the last
    /// [reset_status][Device::reset_status].
    pub fn bytes_delivered(&self) -> u64 {
        self.adc.bytes_delivered()
    }

    /// Transfers that completed with an error since the last reset.
    pub fn failed_transfers(&self) -> usize {
        self.adc.failed_transfers()
    }

    /// Clear the accumulated transfer counters.
    pub fn reset_status(&mut self) -> Result<()> {
        self.require_open()?;
        self.adc.reset_status();
        Ok(())
    }

    /// Blocking bulk read into `data`; returns bytes transferred.
    pub fn read_sync(&mut self, data: &mut [u8]) -> Result<usize> {
        self.require_open()?;
        self.adc.read_sync(data)
    }

    fn tuner_mut(&mut self) -> Result<&mut Tuner<Arc<UsbDevice>>> {
        self.tuner
            .as_mut()
            .ok_or(Error::Unsupported("tuner not active; select VHF mode first"))
    }

    /// Tune the VHF path to `frequency` Hz.
    pub fn set_frequency(&mut self, frequency: f64) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.set_frequency(frequency)
    }

    /// Tune the VHF path using an odd LO harmonic.
    pub fn set_harmonic_frequency(&mut self, frequency: f64, harmonic: u32) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.set_harmonic_frequency(frequency, harmonic)
    }

    /// Program the tuner's IF filter bandwidth, in Hz.
    pub fn set_if_bandwidth(&mut self, bandwidth: u32) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.set_if_bandwidth(bandwidth)
    }

    /// Set the tuner LNA gain, in dB.
    pub fn set_lna_gain(&mut self, gain: i32) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.set_lna_gain(gain)
    }

    /// Hand the tuner LNA gain to the AGC.
    pub fn set_lna_agc(&mut self, agc: bool) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.set_lna_agc(agc)
    }

    /// Set the tuner mixer gain, in dB.
    pub fn set_mixer_gain(&mut self, gain: i32) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.set_mixer_gain(gain)
    }

    /// Hand the tuner mixer gain to the AGC.
    pub fn set_mixer_agc(&mut self, agc: bool) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.set_mixer_agc(agc)
    }

    /// Set the tuner VGA gain, in dB.
    pub fn set_vga_gain(&mut self, gain: i32) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.set_vga_gain(gain)
    }

    /// Put the tuner into standby without tearing it down.
    pub fn tuner_standby(&mut self) -> Result<()> {
        self.require_open()?;
        self.tuner_mut()?.standby()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.status != Status::Off {
            let _ = self.close();
        }
    }
}
