use core::fmt;
use embedded_hal::i2c::blocking::{Write, WriteRead};
use log::trace;

use crate::Measurement;

/// The default 7-bit I2C address of the HTS221.
pub const DEFAULT_ADDRESS: u8 = 0x5F;
/// The fixed value of the `WHO_AM_I` register.
pub const WHO_AM_I_VALUE: u8 = 0xBC;

const WHO_AM_I: u8 = 0x0F;
const AV_CONF: u8 = 0x10;
const CTRL_REG1: u8 = 0x20;
const CTRL_REG2: u8 = 0x21;
const HUMIDITY_OUT_L: u8 = 0x28;
const CALIBRATION_START: u8 = 0x30;

/// Set on a register address to read several registers in one transfer.
const AUTO_INCREMENT: u8 = 0x80;

/// 32 humidity samples and 64 temperature samples per output.
const AV_CONF_AVERAGING: u8 = 0x3F;
/// Powered on, block data update, 1Hz output rate.
const CTRL_REG1_ACTIVE: u8 = 0x85;
const CTRL_REG1_POWER_DOWN: u8 = 0x00;

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<TIoError> {
    /// Wrapped error from the I2C driver.
    Wrapped(TIoError),
    /// The calibration registers describe a flat line, so no reading can be converted.
    BadCalibration,
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
            Error::BadCalibration => write!(f, "Bad calibration data"),
        }
    }
}

/// A linear mapping from raw output counts to physical units, fixed by two factory reference
/// points.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Line {
    out0: i16,
    value0: f32,
    slope: f32,
}

impl Line {
    fn through(out0: i16, value0: f32, out1: i16, value1: f32) -> Option<Line> {
        if out0 == out1 {
            return None;
        }
        Some(Line {
            out0,
            value0,
            slope: (value1 - value0) / (out1 as f32 - out0 as f32),
        })
    }

    fn apply(&self, raw: i16) -> f32 {
        (raw as f32 - self.out0 as f32) * self.slope + self.value0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Calibration {
    humidity: Line,
    temperature: Line,
}

impl Calibration {
    /// Parses the 16 calibration registers starting at `0x30`.
    fn from_registers(buf: &[u8; 16]) -> Option<Calibration> {
        let h0_rh = buf[0] as f32 / 2.0;
        let h1_rh = buf[1] as f32 / 2.0;
        let h0_out = i16::from_le_bytes([buf[0x6], buf[0x7]]);
        let h1_out = i16::from_le_bytes([buf[0xA], buf[0xB]]);

        // T0 and T1 share their two most significant bits in register 0x35.
        let t0_degc = ((((buf[5] & 0x3) as u16) << 8) | buf[2] as u16) as f32 / 8.0;
        let t1_degc = ((((buf[5] & 0xC) as u16) << 6) | buf[3] as u16) as f32 / 8.0;
        let t0_out = i16::from_le_bytes([buf[0xC], buf[0xD]]);
        let t1_out = i16::from_le_bytes([buf[0xE], buf[0xF]]);

        let calibration = Calibration {
            humidity: Line::through(h0_out, h0_rh, h1_out, h1_rh)?,
            temperature: Line::through(t0_out, t0_degc, t1_out, t1_degc)?,
        };
        trace!(
            "hts221 calibration: h0 {}={} h1 {}={}, t0 {}={} t1 {}={}",
            h0_rh,
            h0_out,
            h1_rh,
            h1_out,
            t0_degc,
            t0_out,
            t1_degc,
            t1_out
        );
        Some(calibration)
    }
}

/// An HTS221 whose factory calibration has been loaded.
#[derive(Debug)]
pub struct Hts221<TI2c> {
    i2c: TI2c,
    address: u8,
    calibration: Calibration,
}

impl<TI2c, TError> Hts221<TI2c>
where
    TI2c: Write<Error = TError> + WriteRead<Error = TError>,
{
    /// Configures output averaging, loads the calibration coefficients, and powers the device on.
    ///
    /// The calibration is read once here and kept for the lifetime of the driver.
    pub fn new(i2c: TI2c, address: u8) -> Result<Hts221<TI2c>, Error<TError>> {
        let mut i2c = i2c;
        i2c.write(address, &[AV_CONF, AV_CONF_AVERAGING])?;

        let mut buf = [0u8; 16];
        i2c.write_read(address, &[AUTO_INCREMENT | CALIBRATION_START], &mut buf)?;
        let calibration = Calibration::from_registers(&buf).ok_or(Error::BadCalibration)?;

        i2c.write(address, &[CTRL_REG2, 0x00])?;
        i2c.write(address, &[CTRL_REG1, CTRL_REG1_ACTIVE])?;
        Ok(Hts221 {
            i2c,
            address,
            calibration,
        })
    }

    /// Reads the identification register. A genuine HTS221 returns [`WHO_AM_I_VALUE`].
    pub fn who_am_i(&mut self) -> Result<u8, Error<TError>> {
        let mut buf = [0u8; 1];
        self.i2c.write_read(self.address, &[WHO_AM_I], &mut buf)?;
        Ok(buf[0])
    }

    /// Reads the latest humidity and temperature outputs.
    pub fn read(&mut self) -> Result<Measurement, Error<TError>> {
        let mut buf = [0u8; 4];
        self.i2c
            .write_read(self.address, &[AUTO_INCREMENT | HUMIDITY_OUT_L], &mut buf)?;
        let humidity_out = i16::from_le_bytes([buf[0], buf[1]]);
        let temperature_out = i16::from_le_bytes([buf[2], buf[3]]);
        Ok(Measurement {
            humidity: self.calibration.humidity.apply(humidity_out),
            temperature: self.calibration.temperature.apply(temperature_out),
        })
    }

    /// Powers the device down and returns the bus.
    pub fn release(mut self) -> Result<TI2c, Error<TError>> {
        self.i2c
            .write(self.address, &[CTRL_REG1, CTRL_REG1_POWER_DOWN])?;
        Ok(self.i2c)
    }
}
