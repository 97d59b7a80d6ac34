//! What the embedding application exposes to the guest.
//!
//! [`EmbedderHost`] is the single seam through which the syscall shim reaches
//! the outside world for anything that is not a file: environment variables,
//! clocks, entropy, local time, the working directory and the standard
//! output streams. [`SystemHost`] is the default implementation backed by the
//! host process.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Datelike, Local, Offset, TimeZone, Timelike};

use sqlite_wasm_common::HostConfig;

use crate::logging::{GuestStream, LoggingHost};

/// Broken-down local time, laid out like C's `struct tm` minus `tm_zone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    /// Seconds (0..=60).
    pub sec: i32,
    /// Minutes (0..=59).
    pub min: i32,
    /// Hours (0..=23).
    pub hour: i32,
    /// Day of the month (1..=31).
    pub mday: i32,
    /// Month (0..=11).
    pub mon: i32,
    /// Years since 1900.
    pub year: i32,
    /// Day of the week (0..=6, Sunday is 0).
    pub wday: i32,
    /// Day of the year (0..=365).
    pub yday: i32,
    /// 1 if daylight saving time is in effect, 0 if not, -1 if unknown.
    pub isdst: i32,
    /// Seconds east of UTC.
    pub gmtoff: i32,
}

/// Time zone description for `_tzset_js`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeZoneInfo {
    /// Standard-time offset in seconds west of UTC.
    pub timezone: i64,
    /// Non-zero if the zone observes daylight saving time.
    pub daylight: i32,
    /// Standard-time zone name, e.g. `UTC+0100`.
    pub std_name: String,
    /// Daylight-time zone name.
    pub dst_name: String,
}

impl TimeZoneInfo {
    /// Derive zone info from the UTC offsets (seconds east) in effect on
    /// January 1st and July 1st.
    pub fn from_offsets(winter_east: i32, summer_east: i32) -> Self {
        let winter_west_min = -winter_east / 60;
        let summer_west_min = -summer_east / 60;
        let std_west_min = winter_west_min.max(summer_west_min);

        let winter_name = zone_name(winter_west_min);
        let summer_name = zone_name(summer_west_min);
        let (std_name, dst_name) = if summer_west_min < winter_west_min {
            (winter_name, summer_name)
        } else {
            (summer_name, winter_name)
        };

        Self {
            timezone: i64::from(std_west_min) * 60,
            daylight: i32::from(winter_west_min != summer_west_min),
            std_name,
            dst_name,
        }
    }
}

fn zone_name(west_minutes: i32) -> String {
    let sign = if west_minutes >= 0 { '-' } else { '+' };
    let abs = west_minutes.unsigned_abs();
    format!("UTC{sign}{:02}{:02}", abs / 60, abs % 60)
}

/// Host services available to the guest.
pub trait EmbedderHost: Send + Sync {
    /// Environment variables reported by `environ_get`.
    fn environment(&self) -> Vec<(String, String)>;

    /// Time since the Unix epoch.
    fn wall_clock(&self) -> Duration;

    /// Time since an arbitrary fixed point; never decreases.
    fn monotonic_clock(&self) -> Duration;

    /// Fill `buf` with random bytes.
    fn fill_entropy(&self, buf: &mut [u8]) -> io::Result<()>;

    /// Break `epoch_secs` down into local time.
    fn local_time(&self, epoch_secs: i64) -> LocalTime;

    /// Describe the local time zone.
    fn timezone(&self) -> TimeZoneInfo;

    /// Directory relative paths resolve against.
    fn current_dir(&self) -> io::Result<PathBuf>;

    /// Receive guest writes to fd 1.
    fn write_stdout(&self, data: &[u8]);

    /// Receive guest writes to fd 2.
    fn write_stderr(&self, data: &[u8]);
}

/// [`EmbedderHost`] backed by the host process.
#[derive(Debug, Clone)]
pub struct SystemHost {
    config: HostConfig,
    started: Instant,
}

impl SystemHost {
    /// Create a host configured by `config`.
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
        }
    }

    fn offset_at(epoch_secs: i64) -> i32 {
        Local
            .timestamp_opt(epoch_secs, 0)
            .earliest()
            .map_or(0, |dt| dt.offset().fix().local_minus_utc())
    }

    fn year_offsets(year: i32) -> (i32, i32) {
        let offset_on = |month| {
            Local
                .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .earliest()
                .map_or(0, |dt| dt.offset().fix().local_minus_utc())
        };
        (offset_on(1), offset_on(7))
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl EmbedderHost for SystemHost {
    fn environment(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = if self.config.inherit_env {
            std::env::vars()
                .filter(|(key, _)| !self.config.env.contains_key(key))
                .collect()
        } else {
            Vec::new()
        };
        vars.extend(self.config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    fn wall_clock(&self) -> Duration {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
    }

    fn monotonic_clock(&self) -> Duration {
        self.started.elapsed()
    }

    fn fill_entropy(&self, buf: &mut [u8]) -> io::Result<()> {
        getrandom::getrandom(buf).map_err(io::Error::other)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn local_time(&self, epoch_secs: i64) -> LocalTime {
        let dt: DateTime<Local> = Local
            .timestamp_opt(epoch_secs, 0)
            .earliest()
            .unwrap_or_else(|| DateTime::<chrono::Utc>::UNIX_EPOCH.with_timezone(&Local));

        let gmtoff = dt.offset().fix().local_minus_utc();
        let (winter, summer) = Self::year_offsets(dt.year());
        let isdst = i32::from(winter != summer && gmtoff == winter.max(summer));

        LocalTime {
            sec: dt.second() as i32,
            min: dt.minute() as i32,
            hour: dt.hour() as i32,
            mday: dt.day() as i32,
            mon: dt.month0() as i32,
            year: dt.year() - 1900,
            wday: dt.weekday().num_days_from_sunday() as i32,
            yday: dt.ordinal0() as i32,
            isdst,
            gmtoff,
        }
    }

    fn timezone(&self) -> TimeZoneInfo {
        let now = i64::try_from(self.wall_clock().as_secs()).unwrap_or(i64::MAX);
        let year = Local
            .timestamp_opt(now, 0)
            .earliest()
            .map_or(1970, |dt| dt.year());
        let (winter, summer) = Self::year_offsets(year);
        TimeZoneInfo::from_offsets(winter, summer)
    }

    fn current_dir(&self) -> io::Result<PathBuf> {
        match &self.config.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir(),
        }
    }

    fn write_stdout(&self, data: &[u8]) {
        if self.config.forward_stdio {
            LoggingHost::log_stream(GuestStream::Stdout, data);
        }
    }

    fn write_stderr(&self, data: &[u8]) {
        if self.config.forward_stdio {
            LoggingHost::log_stream(GuestStream::Stderr, data);
        }
    }
}

impl SystemHost {
    /// UTC offset in seconds east at `epoch_secs`.
    pub fn utc_offset(epoch_secs: i64) -> i32 {
        Self::offset_at(epoch_secs)
    }
}
