//! Applies window rules to the dispatch engine.
//!
//! Every enabled rule gets a timer task that sleeps until the rule's next
//! boundary and re-evaluates it. Rules are also evaluated on startup and on
//! every create/update. The last rule evaluated wins; there is no merging.

use super::{ScheduleError, ScheduleRule, ScheduleRuleInput};
use crate::dispatch::DispatchControl;
use crate::events::{DaemonEvent, EventBus};
use crate::store::{JobStore, StoreError};
use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of local wall-clock time.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Longest single sleep in a timer task, so wall-clock jumps are noticed.
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(15 * 60);

pub struct WindowScheduler {
    store: Arc<dyn JobStore>,
    control: Arc<dyn DispatchControl>,
    events: EventBus,
    clock: Clock,
    timers: Mutex<HashMap<i64, JoinHandle<()>>>,
    activity: Mutex<HashMap<i64, bool>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn local_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

impl WindowScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        control: Arc<dyn DispatchControl>,
        events: EventBus,
    ) -> Arc<Self> {
        Self::with_clock(store, control, events, local_clock())
    }

    pub fn with_clock(
        store: Arc<dyn JobStore>,
        control: Arc<dyn DispatchControl>,
        events: EventBus,
        clock: Clock,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            control,
            events,
            clock,
            timers: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
        })
    }

    /// Evaluate every enabled rule in id order and arm their timers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), ScheduleError> {
        let rules = self.store.list_schedule_rules()?;
        let enabled = rules.iter().filter(|r| r.active).count();
        info!(rules = rules.len(), enabled, "Starting window scheduler");

        for rule in rules.into_iter().filter(|r| r.active) {
            self.evaluate_rule(&rule);
            self.arm_timer(&rule);
        }
        Ok(())
    }

    pub fn list_rules(&self) -> Result<Vec<ScheduleRule>, ScheduleError> {
        Ok(self.store.list_schedule_rules()?)
    }

    pub fn create_rule(
        self: &Arc<Self>,
        input: ScheduleRuleInput,
    ) -> Result<ScheduleRule, ScheduleError> {
        input.validate()?;
        let rule = self.store.create_schedule_rule(&input)?;
        info!(rule_id = rule.id, start = %rule.start, end = %rule.end, "Schedule rule created");
        self.apply_rule_change(&rule);
        Ok(rule)
    }

    pub fn update_rule(
        self: &Arc<Self>,
        id: i64,
        input: ScheduleRuleInput,
    ) -> Result<ScheduleRule, ScheduleError> {
        input.validate()?;
        let rule = self
            .store
            .update_schedule_rule(id, &input)
            .map_err(|e| not_found_or(e, id))?;
        info!(rule_id = id, active = rule.active, "Schedule rule updated");
        self.apply_rule_change(&rule);
        Ok(rule)
    }

    /// Delete a rule and cancel its timer. The dispatch state is left as is.
    pub fn delete_rule(&self, id: i64) -> Result<(), ScheduleError> {
        self.store
            .delete_schedule_rule(id)
            .map_err(|e| not_found_or(e, id))?;
        self.cancel_timer(id);
        lock(&self.activity).remove(&id);
        info!(rule_id = id, "Schedule rule deleted");
        Ok(())
    }

    fn apply_rule_change(self: &Arc<Self>, rule: &ScheduleRule) {
        self.cancel_timer(rule.id);
        if rule.active {
            self.evaluate_rule(rule);
            self.arm_timer(rule);
        } else {
            lock(&self.activity).remove(&rule.id);
        }
    }

    /// Evaluate one rule at the current clock time and push the result to dispatch.
    ///
    /// Returns whether the window is open.
    pub fn evaluate_rule(&self, rule: &ScheduleRule) -> bool {
        let now = (self.clock)();
        let active = rule.is_active_at(now);

        if active {
            self.control.resume();
            self.control
                .set_concurrency_limit(rule.concurrency_limit.max(1) as usize);
        } else {
            self.control.pause();
        }

        let previous = lock(&self.activity).insert(rule.id, active);
        if previous != Some(active) {
            info!(rule_id = rule.id, active, "Schedule window changed");
            self.events.emit(DaemonEvent::ScheduleActivityChanged {
                rule_id: rule.id,
                active,
            });
        } else {
            debug!(rule_id = rule.id, active, "Schedule rule evaluated");
        }
        active
    }

    /// Last evaluated activity of a rule, if it has been evaluated.
    pub fn rule_activity(&self, id: i64) -> Option<bool> {
        lock(&self.activity).get(&id).copied()
    }

    fn arm_timer(self: &Arc<Self>, rule: &ScheduleRule) {
        let weak = Arc::downgrade(self);
        let rule_id = rule.id;
        let handle = tokio::spawn(run_timer(weak, rule_id));
        if let Some(old) = lock(&self.timers).insert(rule_id, handle) {
            old.abort();
        }
    }

    fn cancel_timer(&self, id: i64) {
        if let Some(handle) = lock(&self.timers).remove(&id) {
            handle.abort();
        }
    }

    /// Cancel every timer task.
    pub fn shutdown(&self) {
        for (_, handle) in lock(&self.timers).drain() {
            handle.abort();
        }
    }
}

impl Drop for WindowScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn not_found_or(err: StoreError, id: i64) -> ScheduleError {
    match err {
        StoreError::NotFound(_) => ScheduleError::NotFound(id),
        other => ScheduleError::Store(other),
    }
}

/// Sleep until each boundary of the rule and re-evaluate it, until the rule is
/// removed, disabled or the scheduler is dropped.
async fn run_timer(scheduler: Weak<WindowScheduler>, rule_id: i64) {
    loop {
        let (rule, target) = {
            let Some(s) = scheduler.upgrade() else { return };
            let rule = match s.store.get_schedule_rule(rule_id) {
                Ok(Some(rule)) if rule.active => rule,
                Ok(_) => return,
                Err(e) => {
                    warn!(rule_id, error = %e, "Failed to load schedule rule for timer");
                    return;
                }
            };
            let Some(target) = rule.next_boundary((s.clock)()) else {
                return;
            };
            (rule, target)
        };
        debug!(rule_id, next = %target, "Schedule timer armed");

        loop {
            let now = match scheduler.upgrade() {
                Some(s) => (s.clock)(),
                None => return,
            };
            if now >= target {
                break;
            }
            let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining.min(MAX_TIMER_SLEEP)).await;
        }

        match scheduler.upgrade() {
            Some(s) => {
                s.evaluate_rule(&rule);
            }
            None => return,
        }
    }
}
