//! Multi-window admission control shared by every outbound call.
//!
//! A [`RateBudget`] holds one [`Limiter`] per [`ServiceFamily`]. Each limiter
//! enforces a set of sliding-window call quotas plus an optional cap on the
//! cumulative active time of admitted calls. Callers receive an
//! [`AdmissionPermit`]; dropping the permit records the call's active span.
//!
//! Under an active-time cap every in-flight call is charged at least
//! [`ActiveTimeCap::call_reserve`], so concurrent callers cannot all be
//! admitted while nothing has finished yet. The cap holds for any window as
//! long as no call outlives its reserve; a call that does delays later
//! admissions until its overrun has left the window.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::{GatewayConfig, RateLimits};
use crate::error::{GatewayError, ValidationError};

/// Endpoint family sharing one outbound budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceFamily {
    /// NCBI E-utilities.
    Eutils,
    /// PubChem gateways (PUG, PUG REST, PUG View, list gateway, SDQ, downloads).
    PubChem,
}

impl ServiceFamily {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eutils => "eutils",
            Self::PubChem => "pubchem",
        }
    }
}

impl Display for ServiceFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most `max_calls` admissions inside any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowQuota {
    pub max_calls: u32,
    pub window: Duration,
}

impl WindowQuota {
    pub const fn per_second(max_calls: u32) -> Self {
        Self {
            max_calls,
            window: Duration::from_secs(1),
        }
    }

    pub const fn per_minute(max_calls: u32) -> Self {
        Self {
            max_calls,
            window: Duration::from_secs(60),
        }
    }
}

/// At most `max_active` cumulative call time inside any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTimeCap {
    pub max_active: Duration,
    pub window: Duration,
    /// Time charged for a call that is still in flight, and the most a single
    /// call is expected to run. Clamped to `max_active`.
    pub call_reserve: Duration,
}

/// Constraints enforced by one limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSpec {
    quotas: Vec<WindowQuota>,
    active_cap: Option<ActiveTimeCap>,
}

impl LimiterSpec {
    pub fn new(
        quotas: Vec<WindowQuota>,
        active_cap: Option<ActiveTimeCap>,
    ) -> Result<Self, ValidationError> {
        if quotas.is_empty() {
            return Err(ValidationError::ZeroLimit { field: "quotas" });
        }
        for quota in &quotas {
            if quota.max_calls == 0 {
                return Err(ValidationError::ZeroLimit { field: "max_calls" });
            }
            if quota.window.is_zero() {
                return Err(ValidationError::ZeroLimit { field: "window" });
            }
        }
        if let Some(cap) = active_cap {
            if cap.max_active.is_zero() {
                return Err(ValidationError::ZeroLimit { field: "max_active" });
            }
            if cap.window.is_zero() {
                return Err(ValidationError::ZeroLimit { field: "active_window" });
            }
            if cap.call_reserve.is_zero() {
                return Err(ValidationError::ZeroLimit { field: "call_reserve" });
            }
        }
        let active_cap = active_cap.map(|cap| ActiveTimeCap {
            call_reserve: cap.call_reserve.min(cap.max_active),
            ..cap
        });
        Ok(Self { quotas, active_cap })
    }

    /// Limits from configuration; `call_reserve` is normally the request
    /// timeout, which bounds how long any call can stay active.
    pub fn from_limits(
        limits: &RateLimits,
        call_reserve: Duration,
    ) -> Result<Self, ValidationError> {
        let mut quotas = vec![WindowQuota::per_second(limits.calls_per_second)];
        if let Some(per_minute) = limits.calls_per_minute {
            quotas.push(WindowQuota::per_minute(per_minute));
        }
        let active_cap = limits
            .active_seconds_per_minute
            .map(|seconds| ActiveTimeCap {
                max_active: Duration::from_secs(seconds),
                window: Duration::from_secs(60),
                call_reserve,
            });
        Self::new(quotas, active_cap)
    }

    pub fn quotas(&self) -> &[WindowQuota] {
        &self.quotas
    }

    pub fn active_cap(&self) -> Option<ActiveTimeCap> {
        self.active_cap
    }

    fn widest_window(&self) -> Duration {
        self.quotas
            .iter()
            .map(|quota| quota.window)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Default)]
struct WindowState {
    /// Admission instants, oldest first.
    calls: VecDeque<Instant>,
    /// Admission instant of every call still holding its permit.
    in_flight: BTreeMap<u64, Instant>,
    /// `(admitted_at, finished_at)` of completed calls, in finishing order.
    finished: VecDeque<(Instant, Instant)>,
    next_ticket: u64,
}

/// Why an admission has to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Blocked {
    /// Time after which the window constraints may allow the call.
    retry_in: Option<Duration>,
    /// Only an in-flight call finishing can free enough active time.
    needs_release: bool,
}

impl WindowState {
    fn evict(&mut self, now: Instant, spec: &LimiterSpec) {
        let widest = spec.widest_window();
        while self
            .calls
            .front()
            .is_some_and(|admitted| *admitted + widest <= now)
        {
            self.calls.pop_front();
        }
        match spec.active_cap {
            Some(cap) => {
                while self
                    .finished
                    .front()
                    .is_some_and(|(_, finished)| *finished + cap.window <= now)
                {
                    self.finished.pop_front();
                }
            }
            None => self.finished.clear(),
        }
    }

    /// `Ok` when a call may start now, otherwise how to wait.
    fn check(&self, now: Instant, spec: &LimiterSpec) -> Result<(), Blocked> {
        let mut retry_in: Option<Duration> = None;
        let mut needs_release = false;
        let mut extend = |until: Duration| {
            retry_in = Some(retry_in.map_or(until, |current| current.max(until)));
        };

        for quota in &spec.quotas {
            let in_window = self
                .calls
                .iter()
                .rev()
                .take_while(|admitted| **admitted + quota.window > now)
                .count();
            let max = quota.max_calls as usize;
            if in_window >= max {
                // Once the entry `max` places from the newest expires, the
                // window holds `max - 1` calls and one more fits.
                let blocking = self.calls[self.calls.len() - max];
                extend((blocking + quota.window).saturating_duration_since(now));
            }
        }

        if let Some(cap) = spec.active_cap {
            let window_start = now.checked_sub(cap.window);
            let spent: Duration = self
                .finished
                .iter()
                .map(|(start, end)| overlap(*start, *end, window_start))
                .sum();
            let reserved: Duration = self
                .in_flight
                .values()
                .map(|admitted| overlap(*admitted, now, window_start).max(cap.call_reserve))
                .sum();
            if spent + reserved + cap.call_reserve > cap.max_active {
                match cap.max_active.checked_sub(reserved + cap.call_reserve) {
                    Some(target) => extend(self.drain_time(now, cap.window, target)),
                    None => needs_release = true,
                }
            }
        }

        if retry_in.is_none() && !needs_release {
            return Ok(());
        }
        Err(Blocked {
            retry_in: retry_in.map(|wait| wait.max(Duration::from_millis(1))),
            needs_release,
        })
    }

    /// Shortest wait after which finished calls occupy at most `target` of
    /// the trailing `window`.
    fn drain_time(&self, now: Instant, window: Duration, target: Duration) -> Duration {
        // Each span as (end, start) measured backwards from `now`. Waiting `t`
        // leaves a window that reaches back `window - t` from `now`.
        let spans: Vec<(Duration, Duration)> = self
            .finished
            .iter()
            .map(|(start, end)| {
                (
                    now.saturating_duration_since(*end),
                    now.saturating_duration_since(*start),
                )
            })
            .collect();
        let spent_within = |reach: Duration| -> Duration {
            spans
                .iter()
                .map(|(end_ago, start_ago)| (*start_ago).min(reach).saturating_sub(*end_ago))
                .sum()
        };

        let mut points: Vec<Duration> = spans
            .iter()
            .flat_map(|(end_ago, start_ago)| [*end_ago, *start_ago])
            .filter(|point| *point < window)
            .chain([window, Duration::ZERO])
            .collect();
        points.sort_unstable_by(|a, b| b.cmp(a));
        points.dedup();

        let mut upper = window;
        for point in points {
            let spent = spent_within(point);
            if spent <= target {
                // Between `point` and `upper` usage grows by one second per
                // second for every span covering the whole segment.
                let covering = spans
                    .iter()
                    .filter(|(end_ago, start_ago)| *end_ago <= point && *start_ago >= upper)
                    .count();
                let reach = match u32::try_from(covering) {
                    Ok(0) | Err(_) => point,
                    Ok(covering) => (point + (target - spent) / covering).min(upper),
                };
                return window.saturating_sub(reach);
            }
            upper = point;
        }
        window
    }
}

/// Part of `[start, end]` after `window_start`.
fn overlap(start: Instant, end: Instant, window_start: Option<Instant>) -> Duration {
    let from = window_start.map_or(start, |window_start| start.max(window_start));
    end.saturating_duration_since(from)
}

/// Sliding-window limiter for a single service family.
#[derive(Debug)]
pub struct Limiter {
    family: ServiceFamily,
    spec: LimiterSpec,
    state: Mutex<WindowState>,
    released: Notify,
}

impl Limiter {
    fn new(family: ServiceFamily, spec: LimiterSpec) -> Self {
        Self {
            family,
            spec,
            state: Mutex::new(WindowState::default()),
            released: Notify::new(),
        }
    }

    pub const fn family(&self) -> ServiceFamily {
        self.family
    }

    pub fn spec(&self) -> &LimiterSpec {
        &self.spec
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the admission and returns its `(ticket, admitted_at)` when
    /// every constraint allows it. The clock is read under the lock so
    /// admissions are stored in order.
    fn try_admit(&self) -> Result<(u64, Instant), Blocked> {
        let mut state = self.lock();
        let now = Instant::now();
        state.evict(now, &self.spec);
        state.check(now, &self.spec)?;

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.calls.push_back(now);
        state.in_flight.insert(ticket, now);
        Ok((ticket, now))
    }

    fn release(&self, ticket: u64) {
        {
            let mut state = self.lock();
            let finished_at = Instant::now();
            if let Some(admitted_at) = state.in_flight.remove(&ticket) {
                if self.spec.active_cap.is_some() {
                    state.finished.push_back((admitted_at, finished_at));
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// Proof of admission for one outbound call.
///
/// Dropping the permit records the call's active time against the limiter.
#[must_use = "the call is accounted as active until the permit is dropped"]
#[derive(Debug)]
pub struct AdmissionPermit {
    limiter: Arc<Limiter>,
    ticket: u64,
    admitted_at: Instant,
}

impl AdmissionPermit {
    pub fn family(&self) -> ServiceFamily {
        self.limiter.family
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.limiter.release(self.ticket);
    }
}

/// Process-wide outbound budget, one limiter per service family.
///
/// Construct it once and share it (`Arc<RateBudget>`) with every component
/// that talks to the remote service.
#[derive(Debug, Default)]
pub struct RateBudget {
    limiters: BTreeMap<ServiceFamily, Arc<Limiter>>,
}

impl RateBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limiter(mut self, family: ServiceFamily, spec: LimiterSpec) -> Self {
        self.limiters
            .insert(family, Arc::new(Limiter::new(family, spec)));
        self
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, ValidationError> {
        let call_reserve = Duration::from_millis(config.request_timeout_ms);
        Ok(Self::new()
            .with_limiter(
                ServiceFamily::Eutils,
                LimiterSpec::from_limits(&config.eutils_limits, call_reserve)?,
            )
            .with_limiter(
                ServiceFamily::PubChem,
                LimiterSpec::from_limits(&config.pubchem_limits, call_reserve)?,
            ))
    }

    pub fn limiter(&self, family: ServiceFamily) -> Option<&Arc<Limiter>> {
        self.limiters.get(&family)
    }

    /// Waits until a call to `family` is admissible, then records it.
    pub async fn admit(&self, family: ServiceFamily) -> Result<AdmissionPermit, GatewayError> {
        self.admit_until(family, None).await
    }

    /// Like [`admit`](Self::admit), but gives up with
    /// [`GatewayError::AdmissionTimeout`] once `deadline` passes.
    pub async fn admit_until(
        &self,
        family: ServiceFamily,
        deadline: Option<Instant>,
    ) -> Result<AdmissionPermit, GatewayError> {
        let limiter = self.limiters.get(&family).cloned().ok_or_else(|| {
            GatewayError::config(format!("no rate limiter configured for '{family}'"))
        })?;
        let requested_at = Instant::now();

        loop {
            // Registered before checking so a release in between is not missed.
            let released = limiter.released.notified();
            let blocked = match limiter.try_admit() {
                Ok((ticket, admitted_at)) => {
                    drop(released);
                    return Ok(AdmissionPermit {
                        limiter,
                        ticket,
                        admitted_at,
                    });
                }
                Err(blocked) => blocked,
            };

            let now = Instant::now();
            if let Some(deadline) = deadline.filter(|deadline| now >= *deadline) {
                let waited = deadline.saturating_duration_since(requested_at);
                warn!(%family, waited_ms = waited.as_millis() as u64, "admission deadline reached");
                return Err(GatewayError::AdmissionTimeout { family, waited });
            }

            let retry_at = blocked.retry_in.map(|wait| now + wait);
            let wake_at = match (retry_at, deadline) {
                (Some(retry_at), Some(deadline)) => Some(retry_at.min(deadline)),
                (retry_at, deadline) => retry_at.or(deadline),
            };
            debug!(
                %family,
                wait_ms = wake_at.map(|at| at.saturating_duration_since(now).as_millis() as u64),
                needs_release = blocked.needs_release,
                "rate budget exhausted, waiting"
            );

            match wake_at {
                Some(wake_at) if blocked.needs_release => {
                    tokio::select! {
                        () = released => {}
                        () = tokio::time::sleep_until(wake_at) => {}
                    }
                }
                Some(wake_at) => tokio::time::sleep_until(wake_at).await,
                None => released.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(quotas: Vec<WindowQuota>, active_cap: Option<ActiveTimeCap>) -> RateBudget {
        RateBudget::new().with_limiter(
            ServiceFamily::PubChem,
            LimiterSpec::new(quotas, active_cap).expect("valid spec"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_quota_immediately_then_waits_for_oldest_entry() {
        let budget = budget(vec![WindowQuota::per_second(4)], None);
        let start = Instant::now();

        for _ in 0..4 {
            let _permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        }
        assert_eq!(Instant::now(), start);

        let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        assert_eq!(permit.admitted_at() - start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn minute_quota_applies_on_top_of_second_quota() {
        let budget = budget(
            vec![WindowQuota::per_second(5), WindowQuota::per_minute(6)],
            None,
        );
        let start = Instant::now();
        let mut admitted = Vec::new();

        for _ in 0..7 {
            let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
            admitted.push(permit.admitted_at() - start);
        }

        assert_eq!(admitted[4], Duration::ZERO);
        assert_eq!(admitted[5], Duration::from_secs(1));
        assert_eq!(admitted[6], Duration::from_secs(60));
    }

    fn two_seconds_per_ten() -> Option<ActiveTimeCap> {
        Some(ActiveTimeCap {
            max_active: Duration::from_secs(2),
            window: Duration::from_secs(10),
            call_reserve: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn active_time_cap_blocks_until_busy_calls_leave_the_window() {
        let budget = budget(vec![WindowQuota::per_second(10)], two_seconds_per_ten());
        let start = Instant::now();

        for _ in 0..2 {
            let _permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        // The window must shed one second before a third reserve fits.
        let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        assert_eq!(permit.admitted_at() - start, Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_calls_hold_their_reserve() {
        let budget = Arc::new(budget(vec![WindowQuota::per_second(10)], two_seconds_per_ten()));
        let start = Instant::now();

        let first = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        let second = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        let waiter = {
            let budget = Arc::clone(&budget);
            tokio::spawn(async move {
                budget
                    .admit(ServiceFamily::PubChem)
                    .await
                    .map(|permit| permit.admitted_at())
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());
        drop(first);
        drop(second);

        // Half a second of each finished call must leave the window first.
        let admitted_at = waiter.await.expect("task").expect("admitted");
        assert_eq!(admitted_at - start, Duration::from_millis(10_500));
    }

    #[tokio::test(start_paused = true)]
    async fn call_longer_than_the_window_still_counts() {
        let budget = budget(vec![WindowQuota::per_second(10)], two_seconds_per_ten());
        let start = Instant::now();

        let long = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        tokio::time::sleep(Duration::from_secs(15)).await;
        drop(long);

        // Its last ten seconds fill the window; the next reserve fits once
        // only one second of it remains inside.
        let permit = budget.admit(ServiceFamily::PubChem).await.expect("admitted");
        assert_eq!(permit.admitted_at() - start, Duration::from_secs(24));
    }

    #[test]
    fn reserve_is_clamped_to_the_cap() {
        let spec = LimiterSpec::new(
            vec![WindowQuota::per_second(1)],
            Some(ActiveTimeCap {
                max_active: Duration::from_secs(2),
                window: Duration::from_secs(10),
                call_reserve: Duration::from_secs(30),
            }),
        )
        .expect("valid spec");

        assert_eq!(
            spec.active_cap().map(|cap| cap.call_reserve),
            Some(Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_a_pending_admission() {
        let budget = budget(vec![WindowQuota::per_minute(1)], None);
        let _first = budget.admit(ServiceFamily::PubChem).await.expect("admitted");

        let deadline = Instant::now() + Duration::from_secs(5);
        let error = budget
            .admit_until(ServiceFamily::PubChem, Some(deadline))
            .await
            .expect_err("minute quota cannot clear before the deadline");

        match error {
            GatewayError::AdmissionTimeout { family, waited } => {
                assert_eq!(family, ServiceFamily::PubChem);
                assert_eq!(waited, Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unconfigured_family_is_a_config_error_not_a_bypass() {
        let budget = budget(vec![WindowQuota::per_second(1)], None);
        let error = budget
            .admit(ServiceFamily::Eutils)
            .await
            .expect_err("no eutils limiter");
        assert!(matches!(error, GatewayError::Config { .. }));
    }

    #[test]
    fn spec_rejects_zero_quotas() {
        let error = LimiterSpec::new(vec![WindowQuota::per_second(0)], None)
            .expect_err("zero calls per second");
        assert_eq!(error, ValidationError::ZeroLimit { field: "max_calls" });
    }

    #[test]
    fn spec_from_limits_includes_every_configured_constraint() {
        let spec = LimiterSpec::from_limits(&RateLimits::pubchem_default(), Duration::from_secs(30))
            .expect("valid");

        assert_eq!(
            spec.quotas(),
            &[WindowQuota::per_second(5), WindowQuota::per_minute(400)]
        );
        assert_eq!(
            spec.active_cap(),
            Some(ActiveTimeCap {
                max_active: Duration::from_secs(300),
                window: Duration::from_secs(60),
                call_reserve: Duration::from_secs(30),
            })
        );
    }
}
