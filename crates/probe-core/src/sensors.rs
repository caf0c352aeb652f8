//! Sensor aggregation
//!
//! The probe carries two independent sources: a climate sensor (temperature
//! and relative humidity) and a two-channel 8-bit ADC (light and soil
//! moisture). Each source is sampled at its own interval. Values stay `None`
//! until the first successful sample so "no reading yet" can never be mistaken
//! for a real zero.

use embassy_time::{Duration, Instant};
use log::{debug, warn};

use crate::config::ProbeConfig;

/// A polled sensor. Waits inside `sample` (conversion delays, start pulses)
/// should be awaited rather than spun so the rest of the tick keeps running.
#[allow(async_fn_in_trait)]
pub trait SensorSource {
    type Sample: Copy;
    type Error: core::fmt::Debug;

    fn name(&self) -> &'static str;

    async fn sample(&mut self) -> Result<Self::Sample, Self::Error>;
}

/// Temperature in °C and relative humidity in %
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateSample {
    pub temperature: f32,
    pub humidity: f32,
}

/// Raw 8-bit ADC channels. Higher raw values mean darker / drier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogSample {
    pub light_raw: u8,
    pub soil_raw: u8,
}

impl AnalogSample {
    pub fn light_level(&self) -> f32 {
        inverted_percent(self.light_raw)
    }

    pub fn soil_moisture(&self) -> f32 {
        inverted_percent(self.soil_raw)
    }
}

/// Map an inverted 8-bit reading onto 0..=100 %. Exact at both ends.
pub fn inverted_percent(raw: u8) -> f32 {
    f32::from(u8::MAX - raw) * 100.0 / f32::from(u8::MAX)
}

/// A sample together with the instant it was taken
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamped<T> {
    pub value: T,
    pub taken_at: Instant,
}

/// One complete set of readings, ready to be streamed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub temperature: f32,
    pub humidity: f32,
    pub soil_moisture: f32,
    pub light_level: f32,
}

/// A source plus its sampling schedule and latest reading
pub struct SampledSource<S: SensorSource> {
    source: S,
    interval: Duration,
    last_attempt: Option<Instant>,
    latest: Option<Timestamped<S::Sample>>,
}

impl<S: SensorSource> SampledSource<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self {
            source,
            interval,
            last_attempt: None,
            latest: None,
        }
    }

    /// Sample the source if its interval has elapsed. A failed read keeps the
    /// previous reading and is retried one interval later.
    pub async fn poll(&mut self, now: Instant) {
        let due = self
            .last_attempt
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            return;
        }

        self.last_attempt = Some(now);
        match self.source.sample().await {
            Ok(value) => {
                if self.latest.is_none() {
                    debug!("{}: first sample received", self.source.name());
                }
                self.latest = Some(Timestamped {
                    value,
                    taken_at: now,
                });
            }
            Err(e) => warn!("{}: read failed: {:?}", self.source.name(), e),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.latest.is_some()
    }

    pub fn latest(&self) -> Option<&Timestamped<S::Sample>> {
        self.latest.as_ref()
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

/// Uniform ready/value view over both sources
pub struct SensorAggregator<C, A>
where
    C: SensorSource<Sample = ClimateSample>,
    A: SensorSource<Sample = AnalogSample>,
{
    climate: SampledSource<C>,
    analog: SampledSource<A>,
}

impl<C, A> SensorAggregator<C, A>
where
    C: SensorSource<Sample = ClimateSample>,
    A: SensorSource<Sample = AnalogSample>,
{
    pub fn new(climate: C, analog: A, config: &ProbeConfig) -> Self {
        Self {
            climate: SampledSource::new(climate, config.climate_interval()),
            analog: SampledSource::new(analog, config.analog_interval()),
        }
    }

    pub async fn poll(&mut self, now: Instant) {
        self.climate.poll(now).await;
        self.analog.poll(now).await;
    }

    pub fn is_climate_ready(&self) -> bool {
        self.climate.is_ready()
    }

    pub fn is_analog_ready(&self) -> bool {
        self.analog.is_ready()
    }

    pub fn all_ready(&self) -> bool {
        self.is_climate_ready() && self.is_analog_ready()
    }

    pub fn climate(&self) -> Option<&Timestamped<ClimateSample>> {
        self.climate.latest()
    }

    pub fn analog(&self) -> Option<&Timestamped<AnalogSample>> {
        self.analog.latest()
    }

    pub fn temperature(&self) -> Option<f32> {
        self.climate().map(|s| s.value.temperature)
    }

    pub fn humidity(&self) -> Option<f32> {
        self.climate().map(|s| s.value.humidity)
    }

    pub fn soil_moisture(&self) -> Option<f32> {
        self.analog().map(|s| s.value.soil_moisture())
    }

    pub fn light_level(&self) -> Option<f32> {
        self.analog().map(|s| s.value.light_level())
    }

    /// All four values, or `None` while either source has not reported yet.
    pub fn measurement(&self) -> Option<Measurement> {
        let climate = self.climate()?.value;
        let analog = self.analog()?.value;
        Some(Measurement {
            temperature: climate.temperature,
            humidity: climate.humidity,
            soil_moisture: analog.soil_moisture(),
            light_level: analog.light_level(),
        })
    }

    pub fn climate_source_mut(&mut self) -> &mut C {
        self.climate.source_mut()
    }

    pub fn analog_source_mut(&mut self) -> &mut A {
        self.analog.source_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::{block_on, yield_now};

    struct FixedClimate {
        reads: u32,
        fail: bool,
    }

    impl SensorSource for FixedClimate {
        type Sample = ClimateSample;
        type Error = ();

        fn name(&self) -> &'static str {
            "climate"
        }

        async fn sample(&mut self) -> Result<ClimateSample, ()> {
            self.reads += 1;
            if self.fail {
                return Err(());
            }
            Ok(ClimateSample {
                temperature: 21.5,
                humidity: 40.0 + self.reads as f32,
            })
        }
    }

    struct FixedAnalog(AnalogSample);

    impl SensorSource for FixedAnalog {
        type Sample = AnalogSample;
        type Error = ();

        fn name(&self) -> &'static str {
            "analog"
        }

        async fn sample(&mut self) -> Result<AnalogSample, ()> {
            Ok(self.0)
        }
    }

    /// Yields to the executor while the line settles, as the DHT11 start
    /// pulse does
    struct SettlingClimate {
        waits: u32,
    }

    impl SensorSource for SettlingClimate {
        type Sample = ClimateSample;
        type Error = ();

        fn name(&self) -> &'static str {
            "settling"
        }

        async fn sample(&mut self) -> Result<ClimateSample, ()> {
            for _ in 0..3 {
                yield_now().await;
                self.waits += 1;
            }
            Ok(ClimateSample {
                temperature: 19.0,
                humidity: 55.0,
            })
        }
    }

    fn aggregator(fail: bool) -> SensorAggregator<FixedClimate, FixedAnalog> {
        SensorAggregator::new(
            FixedClimate { reads: 0, fail },
            FixedAnalog(AnalogSample {
                light_raw: 0,
                soil_raw: 255,
            }),
            &ProbeConfig::default(),
        )
    }

    #[test]
    fn test_inverted_percent_endpoints_are_exact() {
        assert_eq!(inverted_percent(0), 100.0);
        assert_eq!(inverted_percent(255), 0.0);
        assert!((inverted_percent(128) - 49.8039).abs() < 0.001);
    }

    #[test]
    fn test_values_absent_before_first_sample() {
        let sensors = aggregator(false);

        assert!(!sensors.all_ready());
        assert_eq!(sensors.temperature(), None);
        assert_eq!(sensors.light_level(), None);
        assert_eq!(sensors.measurement(), None);
    }

    #[test]
    fn test_first_poll_samples_both_sources() {
        let mut sensors = aggregator(false);
        block_on(sensors.poll(Instant::from_millis(10)));

        assert!(sensors.all_ready());
        assert_eq!(sensors.temperature(), Some(21.5));
        assert_eq!(sensors.light_level(), Some(100.0));
        assert_eq!(sensors.soil_moisture(), Some(0.0));
        assert_eq!(
            sensors.climate().map(|s| s.taken_at),
            Some(Instant::from_millis(10))
        );
    }

    #[test]
    fn test_sources_respect_their_own_interval() {
        let mut sensors = aggregator(false);
        block_on(sensors.poll(Instant::from_millis(0)));
        block_on(sensors.poll(Instant::from_millis(600)));

        // Analog interval (500 ms) elapsed, climate interval (1000 ms) did not
        assert_eq!(sensors.climate_source_mut().reads, 1);
        assert_eq!(
            sensors.analog().map(|s| s.taken_at),
            Some(Instant::from_millis(600))
        );

        block_on(sensors.poll(Instant::from_millis(1000)));
        assert_eq!(sensors.climate_source_mut().reads, 2);
        assert_eq!(sensors.humidity(), Some(42.0));
    }

    #[test]
    fn test_failed_read_is_not_ready() {
        let mut sensors = aggregator(true);
        block_on(sensors.poll(Instant::from_millis(0)));

        assert!(!sensors.is_climate_ready());
        assert!(sensors.is_analog_ready());
        assert!(!sensors.all_ready());
        assert_eq!(sensors.measurement(), None);
    }

    #[test]
    fn test_sample_may_yield_while_settling() {
        let mut sensors = SensorAggregator::new(
            SettlingClimate { waits: 0 },
            FixedAnalog(AnalogSample {
                light_raw: 0,
                soil_raw: 255,
            }),
            &ProbeConfig::default(),
        );
        block_on(sensors.poll(Instant::from_millis(0)));

        assert_eq!(sensors.climate_source_mut().waits, 3);
        assert_eq!(sensors.temperature(), Some(19.0));
        assert_eq!(sensors.humidity(), Some(55.0));
    }
}
