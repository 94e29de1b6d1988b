//! Due-time bookkeeping for the scheduler loop.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use crate::db::{ProbeTarget, TargetId};

/// Pending entries ordered by due time, then target identity.
#[derive(Debug, Default)]
pub struct ScheduleState {
    queue: BTreeSet<(DateTime<Utc>, TargetId)>,
    due: HashMap<TargetId, DateTime<Utc>>,
    in_flight: HashSet<TargetId>,
    targets: HashMap<TargetId, ProbeTarget>,
}

/// What a registry refresh changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(36500))
}

impl ScheduleState {
    /// Replace the target snapshot.
    ///
    /// Targets seen for the first time become due after `jitter(target)`,
    /// capped by their interval. Removed targets lose their pending entry.
    /// A pending entry further out than a shortened interval is pulled in.
    pub fn reconcile(
        &mut self,
        snapshot: Vec<ProbeTarget>,
        now: DateTime<Utc>,
        mut jitter: impl FnMut(&ProbeTarget) -> Duration,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let next: HashMap<TargetId, ProbeTarget> = snapshot.into_iter().map(|t| (t.id, t)).collect();

        let gone: Vec<TargetId> = self.targets.keys().filter(|id| !next.contains_key(id)).copied().collect();
        for id in gone {
            self.cancel_pending(id);
            summary.removed += 1;
        }

        for (id, target) in &next {
            let latest = now + to_chrono(target.interval);
            match self.due.get(id).copied() {
                Some(due) if due > latest => self.schedule(*id, latest),
                Some(_) => {}
                None if self.in_flight.contains(id) => {}
                None => {
                    let delay = jitter(target).min(target.interval);
                    self.schedule(*id, now + to_chrono(delay));
                    if !self.targets.contains_key(id) {
                        summary.added += 1;
                    }
                }
            }
        }

        self.targets = next;
        summary
    }

    /// Make a target known without waiting for the next refresh.
    pub fn track(&mut self, target: ProbeTarget) {
        self.targets.insert(target.id, target);
    }

    fn schedule(&mut self, id: TargetId, at: DateTime<Utc>) {
        self.cancel_pending(id);
        self.queue.insert((at, id));
        self.due.insert(id, at);
    }

    /// Drop a target's pending entry, if any.
    pub fn cancel_pending(&mut self, id: TargetId) {
        if let Some(at) = self.due.remove(&id) {
            self.queue.remove(&(at, id));
        }
    }

    /// Earliest pending due time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(at, _)| *at)
    }

    /// Whether some entry is due at `now`.
    pub fn has_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due().is_some_and(|at| at <= now)
    }

    /// Pop the earliest due target and mark it in flight.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<ProbeTarget> {
        while let Some(&(at, id)) = self.queue.first() {
            if at > now {
                return None;
            }
            self.queue.pop_first();
            self.due.remove(&id);

            let Some(target) = self.targets.get(&id) else {
                continue;
            };
            if self.in_flight.insert(id) {
                return Some(target.clone());
            }
        }
        None
    }

    /// Mark a target in flight. Returns false if it already was.
    pub fn begin(&mut self, id: TargetId) -> bool {
        self.in_flight.insert(id)
    }

    /// Finish a run and schedule the next one from the completion time.
    ///
    /// Targets no longer in the snapshot are not rescheduled.
    pub fn complete(&mut self, id: TargetId, completed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.in_flight.remove(&id);
        let interval = self.targets.get(&id)?.interval;
        let at = completed_at + to_chrono(interval);
        self.schedule(id, at);
        Some(at)
    }

    /// Release a target that was popped but never ran.
    pub fn abandon(&mut self, id: TargetId, now: DateTime<Utc>) {
        self.in_flight.remove(&id);
        if self.targets.contains_key(&id) {
            self.schedule(id, now);
        }
    }

    #[cfg(test)]
    pub fn is_in_flight(&self, id: TargetId) -> bool {
        self.in_flight.contains(&id)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn known(&self) -> usize {
        self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RenderParams, RequestTemplate};
    use chrono::TimeZone;

    fn target(provider_id: i64, model_id: i64, interval_secs: u64) -> ProbeTarget {
        ProbeTarget {
            id: TargetId::new(provider_id, model_id),
            provider_name: format!("p{}", provider_id),
            model_display_name: format!("m{}", model_id),
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(5),
            render: RenderParams {
                base_url: "http://localhost".to_string(),
                auth_token: String::new(),
                model_name: "m".to_string(),
                prompt: "ping".to_string(),
                system_prompt: String::new(),
            },
            template: RequestTemplate::default(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn no_jitter(_: &ProbeTarget) -> Duration {
        Duration::ZERO
    }

    #[test]
    fn test_completion_schedules_from_completion_time() {
        let mut state = ScheduleState::default();
        state.reconcile(vec![target(1, 1, 300)], t0(), no_jitter);

        let popped = state.pop_due(t0()).unwrap();
        assert!(state.is_in_flight(popped.id));

        let completed = t0() + ChronoDuration::seconds(7);
        let next = state.complete(popped.id, completed).unwrap();
        assert_eq!(next, completed + ChronoDuration::seconds(300));
        assert_eq!(state.next_due(), Some(next));
        assert!(!state.is_in_flight(popped.id));
    }

    #[test]
    fn test_due_order_then_identity() {
        let mut state = ScheduleState::default();
        state.reconcile(
            vec![target(2, 1, 60), target(1, 2, 60), target(1, 1, 60)],
            t0(),
            no_jitter,
        );

        let order: Vec<TargetId> = std::iter::from_fn(|| state.pop_due(t0())).map(|t| t.id).collect();
        assert_eq!(
            order,
            vec![TargetId::new(1, 1), TargetId::new(1, 2), TargetId::new(2, 1)]
        );
    }

    #[test]
    fn test_not_due_yet() {
        let mut state = ScheduleState::default();
        state.reconcile(vec![target(1, 1, 60)], t0(), |_| Duration::from_millis(500));

        assert!(!state.has_due(t0()));
        assert!(state.pop_due(t0()).is_none());
        assert!(state.pop_due(t0() + ChronoDuration::seconds(1)).is_some());
    }

    #[test]
    fn test_jitter_is_capped_by_interval() {
        let mut state = ScheduleState::default();
        state.reconcile(vec![target(1, 1, 1)], t0(), |_| Duration::from_secs(30));
        assert_eq!(state.next_due(), Some(t0() + ChronoDuration::seconds(1)));
    }

    #[test]
    fn test_removed_target_is_not_rescheduled() {
        let mut state = ScheduleState::default();
        state.reconcile(vec![target(1, 1, 60), target(2, 2, 60)], t0(), no_jitter);
        let running = state.pop_due(t0()).unwrap();

        let summary = state.reconcile(vec![target(2, 2, 60)], t0(), no_jitter);
        assert_eq!(summary, ReconcileSummary { added: 0, removed: 1 });

        assert_eq!(state.complete(running.id, t0()), None);
        assert_eq!(state.queued(), 1);
    }

    #[test]
    fn test_in_flight_target_is_not_queued_twice() {
        let mut state = ScheduleState::default();
        state.reconcile(vec![target(1, 1, 60)], t0(), no_jitter);
        let running = state.pop_due(t0()).unwrap();

        state.reconcile(vec![target(1, 1, 60)], t0(), no_jitter);
        assert_eq!(state.queued(), 0);
        assert!(!state.begin(running.id));
    }

    #[test]
    fn test_shortened_interval_pulls_entry_in() {
        let mut state = ScheduleState::default();
        state.reconcile(vec![target(1, 1, 600)], t0(), no_jitter);
        let running = state.pop_due(t0()).unwrap();
        state.complete(running.id, t0());

        state.reconcile(vec![target(1, 1, 60)], t0(), no_jitter);
        assert_eq!(state.next_due(), Some(t0() + ChronoDuration::seconds(60)));
    }

    #[test]
    fn test_cancel_pending_replaces_entry() {
        let mut state = ScheduleState::default();
        state.reconcile(vec![target(1, 1, 60)], t0(), no_jitter);
        let id = TargetId::new(1, 1);

        state.cancel_pending(id);
        assert!(state.begin(id));
        assert_eq!(state.queued(), 0);

        let completed = t0() + ChronoDuration::seconds(3);
        state.complete(id, completed);
        assert_eq!(state.queued(), 1);
        assert_eq!(state.next_due(), Some(completed + ChronoDuration::seconds(60)));
    }
}
