//! Behavior-driven tests for the shared rate budget.
//!
//! Time is paused so window arithmetic is exact: the runtime advances the
//! clock only while every task is asleep.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chemgate_core::{
    ActiveTimeCap, GatewayConfig, GatewayError, LimiterSpec, RateBudget, ServiceFamily,
    WindowQuota,
};
use tokio::time::Instant;

fn budget(quotas: Vec<WindowQuota>, active_cap: Option<ActiveTimeCap>) -> Arc<RateBudget> {
    Arc::new(RateBudget::new().with_limiter(
        ServiceFamily::PubChem,
        LimiterSpec::new(quotas, active_cap).expect("valid limiter spec"),
    ))
}

fn two_active_seconds_per_ten() -> Option<ActiveTimeCap> {
    Some(ActiveTimeCap {
        max_active: Duration::from_secs(2),
        window: Duration::from_secs(10),
        call_reserve: Duration::from_secs(1),
    })
}

/// Largest total call time inside any window of length `window`.
///
/// The total only changes slope where a window edge meets a span edge, so
/// those placements are enough to check.
fn max_active_in_any_window(spans: &[(Instant, Instant)], window: Duration) -> Duration {
    let edges = spans.iter().flat_map(|(start, end)| [*start, *end]);
    let window_starts: Vec<Instant> = edges
        .clone()
        .chain(edges.filter_map(|edge| edge.checked_sub(window)))
        .collect();
    window_starts
        .iter()
        .map(|from| {
            let to = *from + window;
            spans
                .iter()
                .map(|(start, end)| (*end).min(to).saturating_duration_since((*start).max(*from)))
                .sum::<Duration>()
        })
        .max()
        .unwrap_or_default()
}

/// Largest number of admissions inside any window of length `window`.
fn max_in_any_window(admissions: &[Instant], window: Duration) -> usize {
    admissions
        .iter()
        .map(|start| {
            admissions
                .iter()
                .filter(|at| **at >= *start && **at < *start + window)
                .count()
        })
        .max()
        .unwrap_or(0)
}

// =============================================================================
// Sliding-window safety
// =============================================================================

#[tokio::test(start_paused = true)]
async fn burst_of_admissions_never_exceeds_any_configured_window() {
    // Given: a limiter allowing 5 calls per second and 12 per minute
    let quotas = vec![WindowQuota::per_second(5), WindowQuota::per_minute(12)];
    let budget = budget(quotas.clone(), None);

    // When: 30 admissions are requested as fast as possible
    let mut admissions = Vec::new();
    for _ in 0..30 {
        let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        admissions.push(permit.admitted_at());
    }

    // Then: no sliding window of either length holds more than its maximum
    for quota in &quotas {
        assert!(
            max_in_any_window(&admissions, quota.window) <= quota.max_calls as usize,
            "window {:?} exceeded",
            quota.window
        );
    }
    // And: the per-minute ceiling is what paces the later calls
    assert!(admissions[29] - admissions[0] >= Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn concurrent_workers_share_one_budget_safely() {
    // Given: four workers sharing one budget of 5 calls per second
    let budget = budget(vec![WindowQuota::per_second(5)], None);
    let admissions = Arc::new(Mutex::new(Vec::new()));

    // When: each worker issues ten admissions
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let budget = Arc::clone(&budget);
            let admissions = Arc::clone(&admissions);
            tokio::spawn(async move {
                for _ in 0..10 {
                    let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
                    admissions.lock().expect("lock").push(permit.admitted_at());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.expect("worker finished");
    }

    // Then: all 40 calls were admitted, never more than 5 in any second
    let admissions = admissions.lock().expect("lock").clone();
    assert_eq!(admissions.len(), 40);
    assert!(max_in_any_window(&admissions, Duration::from_secs(1)) <= 5);
}

#[tokio::test(start_paused = true)]
async fn active_time_cap_delays_calls_until_old_activity_expires() {
    // Given: at most 2 seconds of call time per 10-second window
    let budget = budget(
        vec![WindowQuota::per_second(100)],
        two_active_seconds_per_ten(),
    );
    let start = Instant::now();

    // When: two calls each stay active for one second
    for _ in 0..2 {
        let _permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    // Then: the next call waits until its one-second reserve fits the window
    let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
    assert_eq!(permit.admitted_at() - start, Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn concurrent_long_calls_respect_the_active_time_cap() {
    // Given: 2 active seconds per 10-second window and a generous call quota
    let cap = Duration::from_secs(2);
    let window = Duration::from_secs(10);
    let budget = budget(vec![WindowQuota::per_second(10)], two_active_seconds_per_ten());
    let spans = Arc::new(Mutex::new(Vec::new()));

    // When: eight workers each hold a call open for one second
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let budget = Arc::clone(&budget);
            let spans = Arc::clone(&spans);
            tokio::spawn(async move {
                let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
                tokio::time::sleep(Duration::from_secs(1)).await;
                spans
                    .lock()
                    .expect("lock")
                    .push((permit.admitted_at(), Instant::now()));
            })
        })
        .collect();
    for worker in workers {
        worker.await.expect("worker finished");
    }

    // Then: only two calls started together, and no window saw more than 2 s
    let spans = spans.lock().expect("lock").clone();
    assert_eq!(spans.len(), 8);
    let first = spans.iter().map(|(start, _)| *start).min().expect("spans");
    assert_eq!(spans.iter().filter(|(start, _)| *start == first).count(), 2);
    let busiest = max_active_in_any_window(&spans, window);
    assert!(busiest <= cap, "{busiest:?} active in one window");
}

// =============================================================================
// Deadlines and configuration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn admission_wait_is_cut_short_by_a_deadline() {
    // Given: a budget already exhausted for this second
    let budget = budget(vec![WindowQuota::per_second(1)], None);
    let _first = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
    let start = Instant::now();

    // When: the next admission may wait at most 300 ms
    let error = budget
        .admit_until(ServiceFamily::PubChem, Some(start + Duration::from_millis(300)))
        .await
        .expect_err("deadline reached first");

    // Then: it reports an admission timeout at the deadline
    assert!(matches!(
        error,
        GatewayError::AdmissionTimeout {
            family: ServiceFamily::PubChem,
            ..
        }
    ));
    assert_eq!(Instant::now() - start, Duration::from_millis(300));
    assert!(error.retryable());
}

#[tokio::test(start_paused = true)]
async fn service_families_have_independent_budgets() {
    // Given: the default budgets built from configuration
    let budget = RateBudget::from_config(&GatewayConfig::default()).expect("valid limits");
    let start = Instant::now();

    // When: the PubChem budget is used up for this second
    for _ in 0..5 {
        let _permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
    }

    // Then: E-utilities calls are still admitted immediately
    let permit = budget.admit(ServiceFamily::Eutils).await.expect("admitted");
    assert_eq!(permit.admitted_at(), start);

    // And: the next PubChem call waits for the second to roll over
    let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
    assert_eq!(permit.admitted_at() - start, Duration::from_secs(1));
}

#[tokio::test]
async fn unconfigured_family_is_a_configuration_error() {
    let budget = RateBudget::new();

    let error = budget
        .admit(ServiceFamily::Eutils)
        .await
        .expect_err("no limiter");

    assert_eq!(error.code(), "gateway.config");
}
