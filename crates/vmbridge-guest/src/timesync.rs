//! Guest clock alignment.
//!
//! Two mechanisms keep guest time sane. The host periodically calls the
//! `SyncTime` RPC with its own wall clock and the guest steps its clock
//! when the drift exceeds 100 ms. This covers laptop sleep, where the VM
//! clock stops with the host but resumes behind it. Independently, a
//! background task compares the wall clock against the RTC device and
//! steps the clock when they diverge by more than two seconds, which
//! covers hypervisors that update the RTC but not the paravirtual clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::TimeZone;

use vmbridge_common::constants::{
    RTC_CHECK_INTERVAL_SECS, RTC_SKEW_THRESHOLD_SECS, TIME_SYNC_THRESHOLD_MS,
};

/// Result of one `SyncTime` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSyncOutcome {
    /// The clock was stepped.
    pub adjusted: bool,
    /// Measured guest−host drift in milliseconds, reported either way.
    pub drift_ms: i64,
    /// Failure detail when stepping was needed but did not succeed.
    pub error: Option<String>,
}

/// Decides whether a drift warrants stepping the clock.
#[must_use]
pub fn needs_adjustment(drift_ms: i64) -> bool {
    drift_ms.abs() > TIME_SYNC_THRESHOLD_MS
}

/// Measured drift between the local clock and a host timestamp, in
/// milliseconds. Positive means the guest is ahead.
#[must_use]
pub fn drift_ms(now: SystemTime, host_time: SystemTime) -> i64 {
    match now.duration_since(host_time) {
        Ok(ahead) => i64::try_from(ahead.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

/// Handles one `SyncTime` request: measures drift against the host clock
/// and steps the guest clock when the threshold is exceeded.
#[must_use]
pub fn sync_to_host(host_time: SystemTime) -> TimeSyncOutcome {
    let drift = drift_ms(SystemTime::now(), host_time);
    if !needs_adjustment(drift) {
        return TimeSyncOutcome { adjusted: false, drift_ms: drift, error: None };
    }

    tracing::info!(drift_ms = drift, "stepping clock to host time");
    match set_system_clock(host_time) {
        Ok(()) => TimeSyncOutcome { adjusted: true, drift_ms: drift, error: None },
        Err(e) => TimeSyncOutcome {
            adjusted: false,
            drift_ms: drift,
            error: Some(e),
        },
    }
}

fn set_system_clock(to: SystemTime) -> Result<(), String> {
    let since_epoch = to
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "host time predates the epoch".to_owned())?;
    let spec = nix::sys::time::TimeSpec::new(
        i64::try_from(since_epoch.as_secs()).map_err(|_| "host time out of range".to_owned())?,
        i64::from(since_epoch.subsec_nanos()),
    );
    nix::time::clock_settime(nix::time::ClockId::CLOCK_REALTIME, spec)
        .map_err(|e| format!("clock_settime: {e}"))
}

/// Raw `struct rtc_time` as filled by the RTC_RD_TIME ioctl.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct RtcTime {
    pub tm_sec: libc::c_int,
    pub tm_min: libc::c_int,
    pub tm_hour: libc::c_int,
    pub tm_mday: libc::c_int,
    pub tm_mon: libc::c_int,
    pub tm_year: libc::c_int,
    pub tm_wday: libc::c_int,
    pub tm_yday: libc::c_int,
    pub tm_isdst: libc::c_int,
}

#[cfg(target_os = "linux")]
nix::ioctl_read!(rtc_rd_time, b'p', 0x09, RtcTime);

/// Converts an RTC reading (UTC calendar fields) into a [`SystemTime`].
#[must_use]
pub fn rtc_to_system_time(rtc: &RtcTime) -> Option<SystemTime> {
    let datetime = chrono::Utc
        .with_ymd_and_hms(
            rtc.tm_year + 1900,
            u32::try_from(rtc.tm_mon).ok()? + 1,
            u32::try_from(rtc.tm_mday).ok()?,
            u32::try_from(rtc.tm_hour).ok()?,
            u32::try_from(rtc.tm_min).ok()?,
            u32::try_from(rtc.tm_sec).ok()?,
        )
        .single()?;
    let secs = datetime.timestamp();
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs()))
}

/// Reads the RTC device once.
#[cfg(target_os = "linux")]
fn read_rtc(device: &std::path::Path) -> Option<SystemTime> {
    use std::os::fd::AsRawFd;

    let file = std::fs::File::open(device).ok()?;
    let mut rtc = RtcTime::default();
    // SAFETY: RTC_RD_TIME fills the rtc_time struct we hand it; the fd is
    // open for the duration of the call.
    let result = unsafe { rtc_rd_time(file.as_raw_fd(), &raw mut rtc) };
    if result.is_err() {
        return None;
    }
    rtc_to_system_time(&rtc)
}

/// Periodically steps the wall clock to the RTC when they diverge.
///
/// Runs forever; exits only when no RTC device is present.
#[cfg(target_os = "linux")]
pub async fn fix_system_time_skew() {
    let device = std::path::Path::new("/dev/rtc");
    if !device.exists() {
        tracing::info!("no RTC device; skew fixer not running");
        return;
    }

    let mut interval =
        tokio::time::interval(Duration::from_secs(RTC_CHECK_INTERVAL_SECS));
    loop {
        let _ = interval.tick().await;
        let Some(rtc_time) = read_rtc(device) else { continue };
        let skew_ms = drift_ms(SystemTime::now(), rtc_time);
        if skew_ms.abs() > RTC_SKEW_THRESHOLD_SECS * 1000 {
            tracing::info!(skew_ms, "fixSystemTimeSkew: stepping clock to RTC");
            if let Err(e) = set_system_clock(rtc_time) {
                tracing::warn!(error = %e, "fixSystemTimeSkew failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn small_drift_is_left_alone() {
        assert!(!needs_adjustment(0));
        assert!(!needs_adjustment(100));
        assert!(!needs_adjustment(-100));
    }

    #[test]
    fn large_drift_is_adjusted() {
        assert!(needs_adjustment(101));
        assert!(needs_adjustment(-101));
        assert!(needs_adjustment(86_400_000));
    }

    #[test]
    fn drift_sign_reports_guest_ahead() {
        let host = UNIX_EPOCH + Duration::from_secs(1000);
        let guest_ahead = host + Duration::from_millis(250);
        let guest_behind = host - Duration::from_millis(250);
        assert_eq!(drift_ms(guest_ahead, host), 250);
        assert_eq!(drift_ms(guest_behind, host), -250);
    }

    #[test]
    fn in_threshold_sync_does_not_touch_clock() {
        // A host time within 100 ms of now must never attempt settime, so
        // this is safe to run unprivileged.
        let outcome = sync_to_host(SystemTime::now());
        assert!(!outcome.adjusted);
        assert!(outcome.error.is_none());
        assert!(outcome.drift_ms.abs() <= TIME_SYNC_THRESHOLD_MS);
    }

    #[test]
    fn rtc_conversion_matches_calendar() {
        let rtc = RtcTime {
            tm_sec: 30,
            tm_min: 15,
            tm_hour: 12,
            tm_mday: 1,
            tm_mon: 7, // August, zero-based
            tm_year: 126, // 2026, years since 1900
            ..RtcTime::default()
        };
        let time = rtc_to_system_time(&rtc).unwrap();
        let secs = time.duration_since(UNIX_EPOCH).unwrap().as_secs();
        // 2026-08-01T12:15:30Z
        assert_eq!(secs, 1_785_586_530);
    }

    #[test]
    fn rtc_nonsense_is_rejected() {
        let rtc = RtcTime { tm_mon: 42, ..RtcTime::default() };
        assert!(rtc_to_system_time(&rtc).is_none());
    }
}
