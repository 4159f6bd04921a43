use core::convert::TryFrom;
use core::fmt;
use core::mem;
use core::time::Duration;
use embedded_hal::digital::blocking::{InputPin, IoPin, OutputPin};
use embedded_hal::digital::PinState;
use log::{debug, trace};

use crate::Measurement;

/// The number of falling edges in a complete response.
///
/// The sensor pulls the line low once to acknowledge the start pulse, once more at the end of its
/// preamble, and then once at the end of every one of the 40 data bits.
pub const EDGE_COUNT: usize = 42;

const FRAME_BYTES: usize = 5;

/// The largest step between consecutive timestamps that still counts as moving forward.
const MAX_EDGE_GAP_US: u32 = u32::MAX / 2;

/// Why a read failed, ordered by where in the protocol the failure is detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// The line was never observed high after driving it high, so something is holding the bus.
    BusBusy,
    /// The sensor never answered the start pulse.
    SyncTimeout,
    /// The sensor started answering but stopped before all edges were seen.
    DataTimeout,
    /// A full frame was captured but its checksum byte does not match the payload.
    ChecksumMismatch,
}

impl ErrorKind {
    /// The numeric status code for this failure, as printed by simple status consoles.
    pub fn code(&self) -> u8 {
        match self {
            ErrorKind::BusBusy => 1,
            ErrorKind::SyncTimeout => 4,
            ErrorKind::DataTimeout => 5,
            ErrorKind::ChecksumMismatch => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::BusBusy => write!(f, "bus busy"),
            ErrorKind::SyncTimeout => write!(f, "no response from sensor"),
            ErrorKind::DataTimeout => write!(f, "timed out while receiving data"),
            ErrorKind::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<TIoError> {
    /// Wrapped error from the HAL.
    Wrapped(TIoError),
    /// Invalid argument was provided.
    InvalidArgument,
    /// The sensor did not produce a valid frame. Retrying on a later cycle may succeed.
    Protocol(ErrorKind),
    /// A previous HAL error consumed the pin while changing its direction.
    Detached,
}

impl<TIoError> From<TIoError> for Error<TIoError> {
    fn from(error: TIoError) -> Error<TIoError> {
        Error::Wrapped(error)
    }
}

impl<TIoError> fmt::Display for Error<TIoError>
where
    TIoError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Wrapped(err) => write!(f, "IO error: {:?}", err),
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::Protocol(kind) => write!(f, "Bad read: {}", kind),
            Error::Detached => write!(f, "Pin lost after a failed direction change"),
        }
    }
}

/// The decoding scale used by the connected sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Variant {
    /// Whole units: humidity and temperature are the high byte of each field.
    Dht11,
    /// Fixed point: each 16-bit field is in units of 1/256.
    Dht22,
}

impl Variant {
    pub const SEN11301P: Variant = Variant::Dht11;
    pub const RHT01: Variant = Variant::Dht11;
    pub const AM2302: Variant = Variant::Dht22;
    pub const SEN51035P: Variant = Variant::Dht22;
    pub const RHT02: Variant = Variant::Dht22;
    pub const RHT03: Variant = Variant::Dht22;

    /// Converts a verified frame into physical units.
    pub fn measurement(&self, frame: &Frame) -> Measurement {
        match self {
            Variant::Dht11 => Measurement {
                humidity: frame.bytes[0] as f32,
                temperature: frame.bytes[2] as f32,
            },
            Variant::Dht22 => Measurement {
                humidity: frame.humidity_raw() as f32 / 256.0,
                temperature: frame.temperature_raw() as f32 / 256.0,
            },
        }
    }
}

/// Timing used while talking to the sensor.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// How long to wait for the line to read high before giving up with [`ErrorKind::BusBusy`].
    pub bus_release_timeout: Duration,
    /// How long the line is held low to wake the sensor.
    pub start_pulse: Duration,
    /// The longest gap allowed between two falling edges (or between releasing the line and the
    /// first edge) before the capture stops.
    pub edge_timeout: Duration,
    /// Falling edges at least this far apart decode as a `1` bit.
    pub one_threshold: Duration,
}

pub const DEFAULT_OPTIONS: Options = Options {
    bus_release_timeout: Duration::from_micros(250),
    start_pulse: Duration::from_millis(2),
    edge_timeout: Duration::from_millis(20),
    one_threshold: Duration::from_micros(100),
};

impl Default for Options {
    fn default() -> Options {
        DEFAULT_OPTIONS
    }
}

impl Options {
    fn to_timing(&self) -> Option<Timing> {
        let timing = Timing {
            bus_release_timeout_us: micros(self.bus_release_timeout)?,
            start_pulse: self.start_pulse,
            edge_timeout_us: micros(self.edge_timeout)?,
            one_threshold_us: micros(self.one_threshold)?,
        };
        if self.start_pulse == Duration::ZERO || timing.one_threshold_us >= timing.edge_timeout_us
        {
            return None;
        }
        Some(timing)
    }
}

/// Non-zero whole microseconds that fit the clock's tick type.
fn micros(duration: Duration) -> Option<u32> {
    match u32::try_from(duration.as_micros()) {
        Ok(0) | Err(_) => None,
        Ok(us) => Some(us),
    }
}

#[derive(Clone, Copy, Debug)]
struct Timing {
    bus_release_timeout_us: u32,
    start_pulse: Duration,
    edge_timeout_us: u32,
    one_threshold_us: u32,
}

/// The five bytes sent by the sensor: humidity (high, low), temperature (high, low), checksum.
///
/// A `Frame` can only be built from bytes whose checksum matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    bytes: [u8; FRAME_BYTES],
}

impl Frame {
    pub fn from_bytes(bytes: [u8; FRAME_BYTES]) -> Result<Frame, ErrorKind> {
        // The last 8 bits of the payload sum should match the checksum byte.
        let sum = bytes[..4].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        if sum != bytes[4] {
            return Err(ErrorKind::ChecksumMismatch);
        }
        Ok(Frame { bytes })
    }

    pub fn bytes(&self) -> &[u8; FRAME_BYTES] {
        &self.bytes
    }

    pub fn humidity_raw(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn temperature_raw(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }
}

/// Falling-edge timestamps captured from one response, in microsecond clock ticks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawSample {
    timestamps: [u32; EDGE_COUNT],
    len: usize,
}

impl RawSample {
    fn new() -> RawSample {
        RawSample {
            timestamps: [0; EDGE_COUNT],
            len: 0,
        }
    }

    /// Builds a sample from previously captured timestamps. Anything past [`EDGE_COUNT`] is
    /// dropped.
    ///
    /// Returns `None` if the timestamps go backwards. Consecutive timestamps may wrap around
    /// `u32::MAX`, so any step of more than half the tick range is treated as going backwards.
    pub fn from_timestamps(timestamps: &[u32]) -> Option<RawSample> {
        let mut sample = RawSample::new();
        for &timestamp in timestamps.iter().take(EDGE_COUNT) {
            if let Some(&previous) = sample.timestamps().last() {
                if timestamp.wrapping_sub(previous) > MAX_EDGE_GAP_US {
                    return None;
                }
            }
            sample.push(timestamp);
        }
        Some(sample)
    }

    fn push(&mut self, timestamp: u32) {
        self.timestamps[self.len] = timestamp;
        self.len += 1;
    }

    pub fn timestamps(&self) -> &[u32] {
        &self.timestamps[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_complete(&self) -> bool {
        self.len == EDGE_COUNT
    }

    /// Classifies the capture and decodes its data bits.
    ///
    /// Edges 2 through 41 each close one data bit. The gap from the previous edge covers the
    /// fixed low period plus the variable high period, so a gap of at least `one_threshold_us`
    /// is a `1`. Bits are packed most-significant first.
    pub fn decode(&self, one_threshold_us: u32) -> Result<Frame, ErrorKind> {
        if self.is_empty() {
            return Err(ErrorKind::SyncTimeout);
        }
        if !self.is_complete() {
            return Err(ErrorKind::DataTimeout);
        }

        let mut bytes = [0u8; FRAME_BYTES];
        for (bit, edges) in self.timestamps.windows(2).skip(1).enumerate() {
            let width = edges[1].wrapping_sub(edges[0]);
            let byte = &mut bytes[bit / 8];
            *byte <<= 1;
            if width >= one_threshold_us {
                *byte |= 1;
            }
        }
        trace!("dht frame: {:02X?}", bytes);
        Frame::from_bytes(bytes)
    }
}

#[derive(Debug)]
enum Line<TInputPin, TOutputPin> {
    Input(TInputPin),
    Output(TOutputPin),
    Detached,
}

/// A DHT11 or DHT22 sensor on a single bidirectional line.
#[derive(Debug)]
pub struct PulseSensor<TInputPin, TOutputPin, TimeFn>
where
    TimeFn: Fn() -> u32,
{
    line: Line<TInputPin, TOutputPin>,
    variant: Variant,
    now_us: TimeFn,
    timing: Timing,
}

impl<TInputPin, TOutputPin, TError, TimeFn> PulseSensor<TInputPin, TOutputPin, TimeFn>
where
    TInputPin: InputPin<Error = TError> + IoPin<TInputPin, TOutputPin, Error = TError>,
    TOutputPin: OutputPin<Error = TError>
        + InputPin<Error = TError>
        + IoPin<TInputPin, TOutputPin, Error = TError>,
    TimeFn: Fn() -> u32,
{
    /// Constructs a sensor that reads from the given pin. No I/O is performed.
    ///
    /// The output pin must also be readable (eg. an open-drain output) so that the bus can be
    /// checked before the start pulse.
    ///
    /// The provided `now_us` closure must return a monotonic microsecond tick. It may wrap around
    /// `u32::MAX`. If `options` is `None` then [`DEFAULT_OPTIONS`] is used. Options with a zero
    /// duration, a duration that does not fit in `u32` microseconds, or a `one_threshold` that is
    /// not below `edge_timeout` are rejected with [`Error::InvalidArgument`].
    pub fn new(
        pin: TOutputPin,
        variant: Variant,
        now_us: TimeFn,
        options: Option<Options>,
    ) -> Result<PulseSensor<TInputPin, TOutputPin, TimeFn>, Error<TError>> {
        let timing = options
            .unwrap_or(DEFAULT_OPTIONS)
            .to_timing()
            .ok_or(Error::InvalidArgument)?;
        Ok(PulseSensor {
            line: Line::Output(pin),
            variant,
            now_us,
            timing,
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Reads one measurement from the sensor.
    ///
    /// The start pulse is timed with the provided `delay_fn`, which needs to be capable of
    /// millisecond precision or better. The response is then captured with interrupts disabled
    /// through `critical_section`; this blocking portion lasts about 4-5ms for a healthy sensor
    /// and never longer than one `edge_timeout` past the last edge.
    ///
    /// Every failure is returned as-is; there are no internal retries. The DHT11 needs at least
    /// 1 second between reads and the DHT22 at least 2 seconds.
    pub async fn read<DelayFn, EmptyFuture>(
        &mut self,
        delay_fn: DelayFn,
    ) -> Result<Measurement, Error<TError>>
    where
        DelayFn: Fn(Duration) -> EmptyFuture,
        EmptyFuture: core::future::Future<Output = ()>,
    {
        let mut output_pin = self.take_output_pin()?;
        if let Err(err) = self.request_data(&mut output_pin) {
            self.line = Line::Output(output_pin);
            return Err(err);
        }
        delay_fn(self.timing.start_pulse).await;

        let now_us = &self.now_us;
        let edge_timeout_us = self.timing.edge_timeout_us;
        let captured = critical_section::with(|_cs| {
            if let Err(err) = output_pin.set_high() {
                return Err((Some(output_pin), Error::Wrapped(err)));
            }
            // The HAL consumes the pin here, so a failure loses it.
            let input_pin = output_pin
                .into_input_pin()
                .map_err(|err| (None, Error::Wrapped(err)))?;
            let sample = capture_edges(&input_pin, now_us, edge_timeout_us);
            Ok((input_pin, sample))
        });
        let (input_pin, sample) = match captured {
            Ok(captured) => captured,
            Err((output_pin, err)) => {
                if let Some(output_pin) = output_pin {
                    self.line = Line::Output(output_pin);
                }
                return Err(err);
            }
        };
        self.line = Line::Input(input_pin);

        let sample = sample?;
        let frame = sample
            .decode(self.timing.one_threshold_us)
            .map_err(|kind| {
                debug!("dht read failed after {} edges: {}", sample.len(), kind);
                Error::Protocol(kind)
            })?;
        Ok(self.variant.measurement(&frame))
    }

    fn take_output_pin(&mut self) -> Result<TOutputPin, Error<TError>> {
        match mem::replace(&mut self.line, Line::Detached) {
            Line::Output(pin) => Ok(pin),
            Line::Input(pin) => Ok(pin.into_output_pin(PinState::High)?),
            Line::Detached => Err(Error::Detached),
        }
    }

    /// Checks that the bus is idle, then starts the wake-up pulse.
    fn request_data(&self, output_pin: &mut TOutputPin) -> Result<(), Error<TError>> {
        output_pin.set_high()?;
        let start = (self.now_us)();
        while output_pin.is_low()? {
            if (self.now_us)().wrapping_sub(start) > self.timing.bus_release_timeout_us {
                debug!("dht bus held low");
                return Err(Error::Protocol(ErrorKind::BusBusy));
            }
        }
        output_pin.set_low()?;
        Ok(())
    }
}

/// Records the time of every high-to-low transition until all edges are seen or the line stays
/// quiet for `edge_timeout_us`.
#[inline]
fn capture_edges<TInput, TError, TimeFn>(
    input_pin: &TInput,
    now_us: &TimeFn,
    edge_timeout_us: u32,
) -> Result<RawSample, Error<TError>>
where
    TInput: InputPin<Error = TError>,
    TimeFn: Fn() -> u32,
{
    let mut sample = RawSample::new();
    let mut last_edge = now_us();
    let mut was_high = true;
    while sample.len() < EDGE_COUNT && now_us().wrapping_sub(last_edge) < edge_timeout_us {
        let is_high = input_pin.is_high()?;
        if is_high != was_high {
            if !is_high {
                last_edge = now_us();
                sample.push(last_edge);
            }
            was_high = is_high;
        }
    }
    Ok(sample)
}
