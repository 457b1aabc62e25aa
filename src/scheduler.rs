//! The priority-queue scheduler: coalesces due-time tasks per `(kind,
//! target)`, retries failed tasks with exponential backoff, and can be
//! driven by a virtual clock for tests (§4.6).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{SCHEDULER_BASE_BACKOFF, SCHEDULER_MAX_BACKOFF};
use crate::domain::{UnixTime, ZoneId};

//----------- TaskKind / TaskTarget --------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Enforce,
    Resalt,
    Signconf,
    KeyGenerate,
    DsTransition,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskTarget {
    Zone(ZoneId),
    Policy(Box<str>),
}

/// The coalescing key: tasks sharing a `(kind, target)` are the same task.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TaskKey(TaskKind, TaskTarget);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub target: TaskTarget,
    pub kind: TaskKind,
    pub due: UnixTime,
    pub backoff_count: u32,
}

//----------- VirtualClock ------------------------------------------------------------

/// A clock the scheduler reads `now()` from. In production this tracks the
/// wall clock; tests substitute [`VirtualClock::set`] to leap forward
/// without sleeping.
#[derive(Debug, Default)]
pub struct VirtualClock {
    wall: bool,
    set_to: AtomicU64,
}

impl VirtualClock {
    pub fn wall_clock() -> Self {
        VirtualClock { wall: true, set_to: AtomicU64::new(0) }
    }

    pub fn virtual_at(now: UnixTime) -> Self {
        VirtualClock { wall: false, set_to: AtomicU64::new(now.0) }
    }

    pub fn now(&self) -> UnixTime {
        if self.wall {
            UnixTime::now()
        } else {
            UnixTime(self.set_to.load(Ordering::SeqCst))
        }
    }

    /// Only meaningful on a virtual clock; advances "now" for every waiter.
    pub fn advance_to(&self, now: UnixTime) {
        self.set_to.store(now.0, Ordering::SeqCst);
    }
}

//----------- Scheduler ----------------------------------------------------------------

struct QueueEntry {
    due: UnixTime,
    id: TaskId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.id).cmp(&(other.due, other.id))
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    heap: BinaryHeap<Reverse<QueueEntry>>,
    tasks: foldhash::HashMap<TaskId, Task>,
    by_key: foldhash::HashMap<TaskKey, TaskId>,
}

/// The scheduler's priority queue and coalescing table. The worker pool
/// that drains it lives in [`crate::units::scheduler_unit`]; this type is
/// the pure data structure so it can be unit-tested without Tokio.
pub struct Scheduler {
    inner: Mutex<Inner>,
    pub clock: VirtualClock,
}

impl Scheduler {
    pub fn new(clock: VirtualClock) -> Self {
        Scheduler { inner: Mutex::new(Inner::default()), clock }
    }

    /// Enqueue a task to run at `due`. If a task with the same `(kind,
    /// target)` is already pending, its due-time becomes `min(existing,
    /// due)` and no duplicate is created.
    pub fn enqueue(&self, kind: TaskKind, target: TaskTarget, due: UnixTime) -> TaskId {
        let mut inner = self.inner.lock().unwrap();
        let key = TaskKey(kind, target.clone());

        if let Some(&id) = inner.by_key.get(&key) {
            let task = inner.tasks.get_mut(&id).expect("by_key entries always have a task");
            if due < task.due {
                task.due = due;
                task.backoff_count = 0;
                inner.heap.push(Reverse(QueueEntry { due, id }));
            }
            return id;
        }

        let id = TaskId(inner.next_id);
        inner.next_id += 1;
        inner.heap.push(Reverse(QueueEntry { due, id }));
        inner.tasks.insert(id, Task { id, target, kind, due, backoff_count: 0 });
        inner.by_key.insert(key, id);
        id
    }

    /// Advance every pending task of `kind` to due `now` (the "flush" command).
    pub fn flush_kind(&self, kind: TaskKind, now: UnixTime) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.kind == kind)
            .map(|t| t.id)
            .collect();
        for id in ids {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.due = now;
                inner.heap.push(Reverse(QueueEntry { due: now, id }));
            }
        }
    }

    /// Pop the next task due at or before `now`, if any. The task remains
    /// tracked in `by_key`-coalescing limbo until [`Self::complete`] or
    /// [`Self::defer`] is called, so a re-enqueue while it's running still
    /// coalesces against it.
    pub fn pop_ready(&self, now: UnixTime) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let Reverse(entry) = inner.heap.peek()?;
            if entry.due > now {
                return None;
            }
            let Reverse(entry) = inner.heap.pop().unwrap();
            let Some(task) = inner.tasks.get(&entry.id) else {
                // Stale heap entry left behind by a coalesced update.
                continue;
            };
            if task.due != entry.due {
                // This entry predates a coalesced due-time update; skip it,
                // the fresher entry is still in the heap.
                continue;
            }
            return Some(task.clone());
        }
    }

    /// Mark a task's run as successful: it leaves the queue entirely until
    /// something re-enqueues it.
    pub fn complete(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.remove(&id) {
            inner.by_key.remove(&TaskKey(task.kind, task.target));
        }
    }

    /// Re-queue a task that returned a retryable error, backing off
    /// exponentially from `now`.
    pub fn defer(&self, id: TaskId, now: UnixTime) {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(&id) else { return };
        task.backoff_count += 1;
        let backoff = backoff_duration(task.backoff_count);
        task.due = now + backoff;
        let due = task.due;
        inner.heap.push(Reverse(QueueEntry { due, id }));
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }
}

fn backoff_duration(backoff_count: u32) -> Duration {
    let factor = 1u64.checked_shl(backoff_count.min(20)).unwrap_or(u64::MAX);
    SCHEDULER_BASE_BACKOFF
        .checked_mul(factor as u32)
        .unwrap_or(SCHEDULER_MAX_BACKOFF)
        .min(SCHEDULER_MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescing_keeps_the_minimum_due_time() {
        let sched = Scheduler::new(VirtualClock::virtual_at(UnixTime(0)));
        let zone = ZoneId(1);
        let first = sched.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone), UnixTime(100));
        let second = sched.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone), UnixTime(50));
        let third = sched.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone), UnixTime(200));

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(sched.pending_count(), 1);

        let task = sched.pop_ready(UnixTime(50)).unwrap();
        assert_eq!(task.due, UnixTime(50));
    }

    #[test]
    fn backoff_grows_exponentially_and_saturates() {
        let sched = Scheduler::new(VirtualClock::virtual_at(UnixTime(0)));
        let id = sched.enqueue(TaskKind::KeyGenerate, TaskTarget::Policy("default".into()), UnixTime(0));
        let first_run_time = UnixTime(0);

        let mut due = UnixTime(0);
        for k in 1..=5 {
            sched.defer(id, first_run_time);
            let lower_bound = first_run_time + Duration::from_secs(SCHEDULER_BASE_BACKOFF.as_secs() * (2u64.pow(k) - 1));
            let task = sched.pop_ready(UnixTime(u64::MAX)).unwrap();
            due = task.due;
            assert!(due >= lower_bound, "backoff {k}: {due:?} should be >= {lower_bound:?}");
            sched.enqueue(TaskKind::KeyGenerate, TaskTarget::Policy("default".into()), due);
        }
        assert!(due.saturating_sub(UnixTime(0)) <= SCHEDULER_MAX_BACKOFF * 2);
    }

    #[test]
    fn pop_ready_respects_due_time() {
        let sched = Scheduler::new(VirtualClock::virtual_at(UnixTime(0)));
        sched.enqueue(TaskKind::Enforce, TaskTarget::Zone(ZoneId(1)), UnixTime(1000));
        assert!(sched.pop_ready(UnixTime(500)).is_none());
        assert!(sched.pop_ready(UnixTime(1000)).is_some());
    }

    #[test]
    fn complete_removes_the_task_so_a_fresh_enqueue_gets_a_new_id() {
        let sched = Scheduler::new(VirtualClock::virtual_at(UnixTime(0)));
        let zone = ZoneId(7);
        let id = sched.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone), UnixTime(10));
        sched.pop_ready(UnixTime(10));
        sched.complete(id);
        assert_eq!(sched.pending_count(), 0);
        let new_id = sched.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone), UnixTime(20));
        assert_ne!(id, new_id);
    }
}
