//! Renewal eligibility
//!
//! Only challenges with a relative timeout are renewable: a fixed absolute
//! deadline is not extendable, and each grant pushes the expiry out by at
//! most one timeout window. Rejecting instances that still have a full
//! window left is what prevents unbounded extension by repeated calls.

use chrono::{DateTime, Duration, Utc};

use crate::errors::{Error, Result};

/// Decide whether a renewal at `now` is allowed and compute the new expiry.
///
/// `timeout` is the challenge's relative TTL, `challenge_until` its absolute
/// cap (the new expiry never passes it), `instance_until` the instance's
/// current expiry.
pub fn renew_until(
    timeout: Option<Duration>,
    challenge_until: Option<DateTime<Utc>>,
    instance_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let timeout = timeout.ok_or_else(|| {
        Error::RenewNotAllowed("challenge has a fixed deadline, not a renewable timeout".to_string())
    })?;
    let until = instance_until.ok_or_else(|| {
        Error::RenewNotAllowed("instance does not expire".to_string())
    })?;

    let remaining = until - now;
    if remaining <= Duration::zero() {
        return Err(Error::InstanceExpired);
    }
    if remaining >= timeout {
        return Err(Error::RenewNotAllowed(format!(
            "not eligible yet: {}s remaining of a {}s window",
            remaining.num_seconds(),
            timeout.num_seconds()
        )));
    }

    let mut renewed = until + timeout;
    if let Some(cap) = challenge_until {
        renewed = renewed.min(cap);
    }
    Ok(renewed)
}
