use super::concurrent;
use embedded_hal::digital::blocking::{InputPin, IoPin, OutputPin};
use embedded_hal::digital::PinState;

/// Every level read takes this long on the simulated clock.
const SAMPLE_PERIOD_US: u32 = 1;

#[derive(Debug, PartialEq)]
pub enum Error {
    /// Returned once after [`Pin::fail_next_release`].
    Injected,
}

/// A bidirectional pin on a simulated microsecond clock.
///
/// While an output, the pin reads back what it drives unless something else holds the bus low. Once switched to
/// an input it replays the next queued waveform, measured from the moment of the switch, and idles
/// high afterwards. The last waveform repeats once the queue is exhausted.
#[derive(Debug)]
pub struct Pin {
    name: &'static str,
    waveforms: Vec<Vec<(bool, u32)>>,
    responses: usize,
    bus_low_until: Option<u32>,
    fail_release: bool,
    is_input: bool,
    driven_high: bool,
    released_at: u32,
}

impl Pin {
    pub fn new(name: &'static str) -> Pin {
        concurrent::set_clock(name, 0);
        concurrent::set_named_value(name, 0);
        Pin {
            name: name,
            waveforms: vec![Vec::new()],
            responses: 0,
            bus_low_until: None,
            fail_release: false,
            is_input: false,
            driven_high: true,
            released_at: 0,
        }
    }

    /// Starts the simulated clock at the given tick.
    pub fn set_clock(&mut self, now_us: u32) {
        concurrent::set_clock(self.name, now_us);
    }

    /// Sets the `(level, duration_us)` segments the sensor drives after the line is released.
    pub fn set_waveform(&mut self, waveform: Vec<(bool, u32)>) {
        self.waveforms = vec![waveform];
    }

    /// Queues a waveform for the read after the ones already set.
    pub fn add_waveform(&mut self, waveform: Vec<(bool, u32)>) {
        self.waveforms.push(waveform);
    }

    fn current_waveform(&self) -> &[(bool, u32)] {
        let index = std::cmp::min(self.responses, self.waveforms.len()) - 1;
        &self.waveforms[index]
    }

    /// Holds the bus low forever.
    pub fn hold_bus_low(&mut self) {
        self.bus_low_until = Some(u32::MAX);
    }

    /// Holds the bus low until the simulated clock has advanced by `duration_us` from now.
    pub fn hold_bus_low_for(&mut self, duration_us: u32) {
        self.bus_low_until = Some(concurrent::get_clock(self.name).wrapping_add(duration_us));
    }

    /// Makes the next `set_high` that releases a driven-low line fail.
    pub fn fail_next_release(&mut self) {
        self.fail_release = true;
    }

    fn is_bus_held_low(&self, now: u32) -> bool {
        match self.bus_low_until {
            Some(u32::MAX) => true,
            Some(until) => now < until,
            None => false,
        }
    }

    fn sample(&self) -> bool {
        let now = concurrent::get_and_advance_clock(self.name, SAMPLE_PERIOD_US);
        if !self.is_input {
            return self.driven_high && !self.is_bus_held_low(now);
        }
        let mut offset = now.wrapping_sub(self.released_at);
        for &(level, duration) in self.current_waveform().iter() {
            if offset < duration {
                return level;
            }
            offset -= duration;
        }
        true
    }
}

/// The simulated clock of the named pin, for use as a driver's time source.
pub fn now_us(name: &str) -> u32 {
    concurrent::get_clock(name)
}

/// How many times the named pin has been switched to an input.
pub fn input_switches(name: &str) -> usize {
    concurrent::get_named_value(name)
}

impl InputPin for Pin {
    type Error = Error;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(self.sample())
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(!self.sample())
    }
}

impl OutputPin for Pin {
    type Error = Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.driven_high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        if self.fail_release && !self.driven_high {
            self.fail_release = false;
            return Err(Error::Injected);
        }
        self.driven_high = true;
        Ok(())
    }
}

impl IoPin<Pin, Pin> for Pin {
    type Error = Error;

    fn into_input_pin(mut self) -> Result<Pin, Self::Error> {
        self.is_input = true;
        self.responses += 1;
        self.released_at = concurrent::get_clock(self.name);
        concurrent::increment_named_value(self.name);
        Ok(self)
    }

    fn into_output_pin(mut self, state: PinState) -> Result<Pin, Self::Error> {
        self.is_input = false;
        self.driven_high = match state {
            PinState::High => true,
            PinState::Low => false,
        };
        Ok(self)
    }
}
