//! # Platform Clock
//!
//! Wall-clock helpers on top of the `GetTime`/`SetTime` runtime services.

use crate::gateway::RuntimeServices;
use crate::gateway::convention::PhysCallGate;
use crate::gateway::ffi::{Time, TimeCapabilities};
use log::error;
use uefi::Status;

/// Seconds since 1970-01-01 00:00:00 for a proleptic Gregorian date.
///
/// `mon` is 1-based. Out-of-range fields are accepted and roll over, so
/// `23:59:60` equals `00:00:00` of the next day. `None` for anything before
/// the epoch, including the all-zero time of an unset clock.
#[must_use]
pub fn mktime(year: u32, mon: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<u64> {
    let (year, mon) = (i64::from(year), i64::from(mon));

    // Shift the year to start in March so the leap day is the last day.
    let (year, mon) = if mon <= 2 { (year - 1, mon + 10) } else { (year, mon - 2) };

    let days = year.div_euclid(4) - year.div_euclid(100) + year.div_euclid(400) + 367 * mon / 12
        + i64::from(day)
        + year * 365
        - 719_499;
    let secs = ((days * 24 + i64::from(hour)) * 60 + i64::from(min)) * 60 + i64::from(sec);
    u64::try_from(secs).ok()
}

/// Converts firmware time to seconds since the Unix epoch; `None` before it.
#[must_use]
pub fn to_unix_seconds(time: &Time) -> Option<u64> {
    mktime(
        u32::from(time.year),
        u32::from(time.month),
        u32::from(time.day),
        u32::from(time.hour),
        u32::from(time.minute),
        u32::from(time.second),
    )
}

/// Reads the platform clock as seconds since the Unix epoch.
///
/// # Errors
/// The firmware status if the clock could not be read, `DEVICE_ERROR` if it
/// reports a time before the epoch.
pub fn wallclock_seconds<G: PhysCallGate>(runtime: &RuntimeServices<G>) -> Result<u64, Status> {
    let mut time = Time::default();
    let mut caps = TimeCapabilities::default();
    let status = runtime.get_time(&mut time, Some(&mut caps));
    if status != Status::SUCCESS {
        error!("EFI: can't read time (status={status:?})");
        return Err(status);
    }

    to_unix_seconds(&time).ok_or_else(|| {
        error!(
            "EFI: clock reports {:04}-{:02}-{:02}, before the epoch",
            time.year, time.month, time.day
        );
        Status::DEVICE_ERROR
    })
}

/// Updates minutes and seconds of the platform clock from `now` (seconds
/// since the epoch), leaving the hour alone.
///
/// If the platform clock runs in a time zone offset by half an hour, the
/// minutes are shifted by 30 to match.
///
/// # Errors
/// The firmware status if the clock could not be read or written.
pub fn set_rtc_mmss<G: PhysCallGate>(runtime: &RuntimeServices<G>, now: u64) -> Result<(), Status> {
    let mut time = Time::default();
    let mut caps = TimeCapabilities::default();
    let status = runtime.get_time(&mut time, Some(&mut caps));
    if status != Status::SUCCESS {
        error!("EFI: can't read time (status={status:?})");
        return Err(status);
    }

    time.minute = mmss_minutes(now, time.minute);
    time.second = u8::try_from(now % 60).unwrap_or_default();

    let status = runtime.set_time(&time);
    if status != Status::SUCCESS {
        error!("EFI: can't write time (status={status:?})");
        return Err(status);
    }
    Ok(())
}

/// Minutes of `now` as they should appear on a clock currently showing
/// `clock_minute`.
#[allow(clippy::cast_possible_truncation)]
const fn mmss_minutes(now: u64, clock_minute: u8) -> u8 {
    let mut minutes = (now / 60) % 60;
    let drift = (minutes + 60 - (clock_minute as u64 % 60)) % 60;
    if ((drift + 15) / 30) & 1 != 0 {
        minutes += 30;
    }
    (minutes % 60) as u8
}
