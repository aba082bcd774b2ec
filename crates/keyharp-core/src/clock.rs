// Clock synchronization.
//
// Maintains a best-effort offset between the local clock and a reference
// network time source so independent instances can start a performance in
// unison. The playback scheduler reads the published offset; only the
// synchronizer writes it.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use tracing::info;

/// Samples averaged per synchronization.
const SYNC_SAMPLES: u32 = 4;

/// Microseconds of wall-clock time since the Unix epoch.
pub fn wall_now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// The published clock-offset estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockOffset {
    pub offset_us: i64,
    pub max_deviation_us: i64,
    pub last_sync: Option<Instant>,
}

/// Read-mostly shared cell: many readers in the playback scheduler, one
/// writer in the synchronizer.
#[derive(Clone, Default)]
pub struct SharedClock {
    inner: Arc<RwLock<ClockOffset>>,
}

impl SharedClock {
    pub fn new() -> SharedClock {
        SharedClock::default()
    }

    pub fn get(&self) -> ClockOffset {
        *self.inner.read().unwrap()
    }

    pub fn offset_us(&self) -> i64 {
        self.inner.read().unwrap().offset_us
    }

    pub fn is_synced(&self) -> bool {
        self.inner.read().unwrap().last_sync.is_some()
    }

    fn set(&self, offset: ClockOffset) {
        *self.inner.write().unwrap() = offset;
    }
}

/// One reference-clock sample.
#[derive(Debug, Clone, Copy)]
pub struct TimeSample {
    pub offset_us: i64,
    pub uncertainty_us: i64,
}

/// Seam to the reference time source.
pub trait TimeSource: Send + Sync {
    fn query(&self, server: &str) -> Result<TimeSample>;
}

/// SNTP-backed time source.
pub struct SntpTimeSource {
    timeout: Duration,
}

impl SntpTimeSource {
    pub fn new(timeout: Duration) -> SntpTimeSource {
        SntpTimeSource { timeout }
    }
}

impl TimeSource for SntpTimeSource {
    fn query(&self, server: &str) -> Result<TimeSample> {
        let mut client = rsntp::SntpClient::new();
        client.set_timeout(self.timeout);
        let result = client.synchronize(server)?;
        let offset_us = (result.clock_offset().as_secs_f64() * 1e6) as i64;
        // The protocol gives no root distance here; half the round trip
        // bounds the one-way error.
        let uncertainty_us = (result.round_trip_delay().as_secs_f64() * 0.5e6) as i64;
        Ok(TimeSample {
            offset_us,
            uncertainty_us,
        })
    }
}

/// Queries the reference several times, averages the offsets, keeps the
/// worst uncertainty, and publishes the result.
pub struct ClockSync {
    clock: SharedClock,
    source: Box<dyn TimeSource>,
    cooldown: Duration,
}

impl ClockSync {
    pub fn new(clock: SharedClock, source: Box<dyn TimeSource>, cooldown: Duration) -> ClockSync {
        ClockSync {
            clock,
            source,
            cooldown,
        }
    }

    /// Synchronize against `server`. Inside the cooldown window this fails
    /// without touching the published offset; so does any failed query.
    pub fn sync(&self, server: &str) -> Result<ClockOffset> {
        if let Some(last) = self.clock.get().last_sync
            && last.elapsed() < self.cooldown
        {
            bail!("time already synchronized");
        }

        let mut offset_sum = 0i64;
        let mut max_deviation = 0i64;
        for _ in 0..SYNC_SAMPLES {
            let sample = self.source.query(server)?;
            offset_sum += sample.offset_us;
            max_deviation = max_deviation.max(sample.uncertainty_us);
        }

        let published = ClockOffset {
            offset_us: offset_sum / SYNC_SAMPLES as i64,
            max_deviation_us: max_deviation,
            last_sync: Some(Instant::now()),
        };
        self.clock.set(published);
        info!(
            offset_us = published.offset_us,
            max_deviation_us = published.max_deviation_us,
            "clock synchronized"
        );
        Ok(published)
    }
}
