use std::thread;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use regex::Captures;

use crate::error::ReplError;

/// `(year, month, mday, hour, minute, second, weekday, yearday)`
pub const LOCALTIME_PATTERN: &str =
    r"\((\d+), (\d+), (\d+), (\d+), (\d+), (\d+), (\d+), (\d+)\)";

pub const GET_LOCALTIME: &str = "print(watch.rtc.get_localtime())";

/// Block until the local clock ticks over to a new second and return it.
pub fn next_second() -> NaiveDateTime {
    let start = Local::now().second();
    loop {
        let now = Local::now();
        if now.second() != start {
            return now.naive_local().with_nanosecond(0).unwrap_or(now.naive_local());
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Statement that sets the device clock to `t`.
///
/// Weekday counts from Monday = 0, yearday from 1.
pub fn set_localtime_command(t: &NaiveDateTime) -> String {
    format!(
        "watch.rtc.set_localtime(({}, {}, {}, {}, {}, {}, {}, {}))",
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
        t.weekday().num_days_from_monday(),
        t.ordinal()
    )
}

/// Build a timestamp from a match of [`LOCALTIME_PATTERN`].
pub fn parse_localtime(caps: &Captures<'_>) -> Result<NaiveDateTime, ReplError> {
    let field = |i: usize| -> Result<u32, ReplError> {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .ok_or_else(|| ReplError::Protocol(format!("bad clock field {i}")))
    };
    let year = i32::try_from(field(1)?)
        .map_err(|_| ReplError::Protocol("clock year out of range".to_string()))?;
    NaiveDate::from_ymd_opt(year, field(2)?, field(3)?)
        .and_then(|d| d.and_hms_opt(field(4).ok()?, field(5).ok()?, field(6).ok()?))
        .ok_or_else(|| ReplError::Protocol(format!("invalid clock reading {:?}", &caps[0])))
}
