//! DHT11 climate sensor and PCF8591 ADC drivers
//!
//! Both are plain embedded-hal 1.0 drivers so the pins and bus can be
//! anything esp-hal hands out.

use embassy_time::Timer;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::i2c::I2c;
use thiserror_no_std::Error;

use probe_core::sensors::{AnalogSample, ClimateSample, SensorSource};

// ---------------------------------------------------------------------------
// DHT11
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum Dht11Error<E: core::fmt::Debug> {
    #[error("Sensor did not answer")]
    NoResponse,
    #[error("Timed out inside the data burst")]
    Timeout,
    #[error("Checksum mismatch")]
    Checksum,
    #[error("Pin error: {0:?}")]
    Pin(E),
}

/// Single-wire DHT11 on an open-drain pin with an external pull-up.
///
/// The 18 ms start pulse is awaited. The 40 bit answer is bit-banged and
/// blocks for about 5 ms.
pub struct Dht11<P, D> {
    pin: P,
    delay: D,
}

impl<P, D> Dht11<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pub fn new(mut pin: P, delay: D) -> Self {
        // Idle high
        let _ = pin.set_high();
        Self { pin, delay }
    }

    /// Microseconds spent until the line leaves `level`, bounded by `limit`
    fn measure(&mut self, level: bool, limit: u32) -> Result<u32, Dht11Error<P::Error>> {
        let mut elapsed = 0;
        while self.pin.is_high().map_err(Dht11Error::Pin)? == level {
            if elapsed >= limit {
                return Err(Dht11Error::Timeout);
            }
            self.delay.delay_us(1);
            elapsed += 1;
        }
        Ok(elapsed)
    }

    async fn read_frame(&mut self) -> Result<[u8; 5], Dht11Error<P::Error>> {
        // Start signal: at least 18 ms low, then release
        self.pin.set_low().map_err(Dht11Error::Pin)?;
        Timer::after_millis(18).await;
        self.pin.set_high().map_err(Dht11Error::Pin)?;

        self.read_answer()
    }

    fn read_answer(&mut self) -> Result<[u8; 5], Dht11Error<P::Error>> {

        // Response: ~80 us low then ~80 us high
        let answered = self
            .measure(true, 60)
            .and_then(|_| self.measure(false, 100))
            .and_then(|_| self.measure(true, 100));
        if answered.is_err() {
            return Err(Dht11Error::NoResponse);
        }

        let mut data = [0u8; 5];
        for bit in 0..40 {
            self.measure(false, 70)?;
            // 26-28 us high is a zero, 70 us a one
            let high = self.measure(true, 100)?;
            if high > 40 {
                data[bit / 8] |= 0x80 >> (bit % 8);
            }
        }

        let sum = data[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != data[4] {
            return Err(Dht11Error::Checksum);
        }
        Ok(data)
    }
}

impl<P, D> SensorSource for Dht11<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    type Sample = ClimateSample;
    type Error = Dht11Error<P::Error>;

    fn name(&self) -> &'static str {
        "dht11"
    }

    async fn sample(&mut self) -> Result<ClimateSample, Self::Error> {
        let data = self.read_frame().await?;

        let humidity = f32::from(data[0]) + f32::from(data[1]) / 10.0;
        let magnitude = f32::from(data[2]) + f32::from(data[3] & 0x7F) / 10.0;
        let temperature = if data[3] & 0x80 != 0 {
            -magnitude
        } else {
            magnitude
        };

        Ok(ClimateSample {
            temperature,
            humidity,
        })
    }
}

// ---------------------------------------------------------------------------
// PCF8591
// ---------------------------------------------------------------------------

pub const PCF8591_ADDRESS: u8 = 0x48;

/// Control byte: auto-increment, four single-ended inputs starting at AIN0
const AUTO_INCREMENT: u8 = 0x04;

/// 8-bit ADC with the light sensor on AIN0 and the soil probe on AIN1
pub struct Pcf8591<I> {
    i2c: I,
    address: u8,
}

impl<I: I2c> Pcf8591<I> {
    pub fn new(i2c: I) -> Self {
        Self {
            i2c,
            address: PCF8591_ADDRESS,
        }
    }

    /// All four channels
    pub fn read_all(&mut self) -> Result<[u8; 4], I::Error> {
        // The first byte is the result of the previous conversion
        let mut buf = [0u8; 5];
        self.i2c
            .write_read(self.address, &[AUTO_INCREMENT], &mut buf)?;
        Ok([buf[1], buf[2], buf[3], buf[4]])
    }
}

impl<I: I2c> SensorSource for Pcf8591<I> {
    type Sample = AnalogSample;
    type Error = I::Error;

    fn name(&self) -> &'static str {
        "pcf8591"
    }

    async fn sample(&mut self) -> Result<AnalogSample, I::Error> {
        let [ain0, ain1, _, _] = self.read_all()?;
        Ok(AnalogSample {
            light_raw: ain0,
            soil_raw: ain1,
        })
    }
}
