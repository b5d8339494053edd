//! Lease renewal for claimed aggregator jobs.
//!
//! A claimed job holds the single-flight slot only while its `last_heartbeat`
//! is younger than `JOB_LEASE_SECS`. The renewal period never exceeds half
//! the lease.

use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Renewal period for a lease of `lease_secs`, never below one second.
pub fn renewal_period(interval_secs: u64, lease_secs: u64) -> Duration {
    let ceiling = (lease_secs / 2).max(1);
    Duration::from_secs(interval_secs.clamp(1, ceiling))
}

async fn renew_lease(pool: &PgPool, job_id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE job_records SET last_heartbeat = now()
         WHERE job_id = $1 AND status = 'claimed'",
    )
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Keeps the lease on `job_id` alive until the returned sender is dropped.
pub fn spawn_lease_renewal(
    pool: PgPool,
    job_id: Uuid,
    interval_secs: u64,
    lease_secs: u64,
) -> watch::Sender<()> {
    let (stop_tx, mut stop_rx) = watch::channel(());
    let period = renewal_period(interval_secs, lease_secs);
    if period.as_secs() < interval_secs {
        warn!(
            "HEARTBEAT_INTERVAL_SECS {} does not fit JOB_LEASE_SECS {}, renewing every {:?}",
            interval_secs, lease_secs, period
        );
    }

    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticks.tick() => match renew_lease(&pool, job_id).await {
                    Ok(true) => debug!("Lease renewed for job {}", job_id),
                    Ok(false) => {
                        debug!("Job {} is no longer claimed, stopping renewal", job_id);
                        break;
                    }
                    Err(e) => warn!("Lease renewal failed for job {}: {}", job_id, e),
                },
                _ = stop_rx.changed() => {
                    debug!("Lease renewal stopped for job {}", job_id);
                    break;
                }
            }
        }
    });

    stop_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_stays_within_half_the_lease() {
        assert_eq!(renewal_period(30, 300), Duration::from_secs(30));
        assert_eq!(renewal_period(200, 300), Duration::from_secs(150));
        assert_eq!(renewal_period(0, 300), Duration::from_secs(1));
        assert_eq!(renewal_period(30, 1), Duration::from_secs(1));
    }
}
