//! Historical activity download.
//!
//! ```text
//! host                                  band
//!  │ enable notify: fetch, activity-data  │
//!  │ ── fetch ← 01 01 <since> 00 17 ────► │
//!  │ ◄── fetch: 10 01 01 … <start> ────── │   (or 10 02 04: nothing recorded)
//!  │ ── fetch ← 02 ─────────────────────► │
//!  │ ◄── activity-data: idx [?? ?? st hr]* │   repeated
//!  │ ◄── fetch: 10 02 01 ──────────────── │   end of transfer (any payload)
//!  │ disable notify: fetch, activity-data │
//! ```

use chrono::{Duration, NaiveDateTime};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{decode_start_time, encode_fetch_trigger, ActivityDecoder};
use crate::error::{BandError, Result};
use crate::protocol::{FETCH_CMD_CONFIRM, FETCH_RESP_FINISHED, FETCH_RESP_NO_DATA};
use crate::session::{BandServices, Session, Shared};
use crate::transport::Transport;
use crate::types::{ActivityRecord, SessionState};

/// How far before the newest stored record the next fetch starts.
pub const RESUME_OVERLAP_HOURS: i64 = 3;

/// Look-back used when nothing has been stored yet.
pub const FIRST_FETCH_DAYS: i64 = 1;

/// Where the next history fetch should start.
///
/// The overlap with already stored minutes is harmless because stores replace
/// records with the same timestamp.
pub fn resume_point(last_stored: Option<NaiveDateTime>, now: NaiveDateTime) -> NaiveDateTime {
    match last_stored {
        Some(last) => last - Duration::hours(RESUME_OVERLAP_HOURS),
        None => now - Duration::days(FIRST_FETCH_DAYS),
    }
}

impl<T: Transport> Session<T> {
    /// Download activity recorded since `since`.
    ///
    /// Records are stamped from the start time the band reports, one minute
    /// per chunk.  Notifications on both fetch characteristics are disabled
    /// before this returns, unless the link itself was lost.
    pub async fn fetch_since(&self, since: NaiveDateTime) -> Result<Vec<ActivityRecord>> {
        let _guard = self.begin_operation(Some(SessionState::Fetching))?;
        let services = self.services()?;
        info!("fetching activity since {since}");

        let result = run_fetch(&self.shared, &services, since).await;

        let cleanup = if self.state() == SessionState::Disconnected {
            Ok(())
        } else {
            disable_notifications(&self.shared, &services).await
        };

        match (result, cleanup) {
            (Ok(records), Ok(())) => {
                info!("fetched {} activity record(s)", records.len());
                Ok(records)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), cleanup) => {
                if let Err(c) = cleanup {
                    warn!("fetch cleanup failed: {c}");
                }
                Err(e)
            }
        }
    }
}

async fn run_fetch<T: Transport>(
    shared: &Shared<T>,
    services: &BandServices,
    since: NaiveDateTime,
) -> Result<Vec<ActivityRecord>> {
    let fetch = services.fetch;
    let activity = services.activity_data;

    shared.set_notifications(fetch, true).await?;
    shared.set_notifications(activity, true).await?;
    shared.clear_queue(fetch);
    shared.clear_queue(activity);

    shared.write(fetch, &encode_fetch_trigger(since)).await?;
    let ack = shared.expect_notification(fetch, "fetch start time").await?;
    if ack == FETCH_RESP_NO_DATA {
        info!("no activity recorded since {since}");
        return Ok(Vec::new());
    }
    let start = decode_start_time(&ack)?;
    debug!("band starts transfer at {start}");

    shared.write(fetch, &FETCH_CMD_CONFIRM).await?;

    let mut decoder = ActivityDecoder::new(start, shared.config.empty_chunk_policy);
    let end = {
        let reader = read_activity(shared, activity, &mut decoder);
        tokio::pin!(reader);
        tokio::select! {
            biased;
            err = &mut reader => Err(err),
            end = shared.next_notification(fetch) => end,
        }
    }?;
    // Any notification on the fetch characteristic ends the transfer.
    if !end.starts_with(&FETCH_RESP_FINISHED) {
        debug!("unusual end-of-transfer marker {end:02x?}");
    }

    // Payloads that raced the end-of-transfer marker.
    let mut late = 0;
    while let Some(data) = shared.try_notification(activity) {
        decoder.feed(&data);
        late += 1;
    }
    if late > 0 {
        debug!("decoded {late} activity packet(s) queued behind end of transfer");
    }
    debug!("transfer ended, next minute would be {}", decoder.cursor());

    Ok(decoder.into_records())
}

/// Feed activity-data notifications into `decoder` until reading fails.
async fn read_activity<T: Transport>(
    shared: &Shared<T>,
    activity: Uuid,
    decoder: &mut ActivityDecoder,
) -> BandError {
    loop {
        match shared.next_notification(activity).await {
            Ok(data) => decoder.feed(&data),
            Err(e) => return e,
        }
    }
}

async fn disable_notifications<T: Transport>(
    shared: &Shared<T>,
    services: &BandServices,
) -> Result<()> {
    let fetch = shared.set_notifications(services.fetch, false).await;
    let activity = shared.set_notifications(services.activity_data, false).await;
    fetch.and(activity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 5, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_resume_point_overlaps_last_record() {
        assert_eq!(resume_point(Some(at(2, 10, 15)), at(3, 0, 0)), at(2, 7, 15));
    }

    #[test]
    fn test_resume_point_without_history() {
        assert_eq!(resume_point(None, at(3, 12, 0)), at(2, 12, 0));
    }
}
