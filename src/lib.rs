#![no_std]

use core::fmt;

/// Driver for the single-wire, pulse-timed DHT11 and DHT22 sensor family.
pub mod dhtxx;
/// Driver for the HTS221 I2C humidity and temperature sensor.
///
/// Refer to [this datasheet](https://www.st.com/resource/en/datasheet/hts221.pdf) for more
/// information about the device.
pub mod hts221;

/// A single temperature and relative humidity reading.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurement {
    /// Degrees Celsius.
    pub temperature: f32,
    /// Percent relative humidity.
    pub humidity: f32,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RH: {:.2}%, T: {:.2}\u{00B0}C",
            self.humidity, self.temperature
        )
    }
}
