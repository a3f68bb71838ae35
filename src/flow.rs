//! Flow-controlled descriptor pools.
//!
//! A [`FlowControlPool`] is a descriptor pool that additionally performs
//! admission control: when the number of available descriptors sinks through
//! per-priority stop thresholds, upstream traffic classes are paused through
//! an external callback, and resumed as frees lift availability back over the
//! start thresholds. The admission policy is chosen once at construction:
//! [`AcCascade`] pauses one access category at a time, ordered lowest
//! priority first; [`GlobalThreshold`] collapses to a single stop/start pair
//! that pauses everything at once.
//!
//! Locking discipline: one mutex guards the free list, the counters and the
//! flow status together. `AcCascade` collects transitions under the lock and
//! invokes the pause callback *after* releasing it, since the callback may
//! re-enter the allocator. `GlobalThreshold` invokes under the lock; its
//! stop-all/start-all callback is terminal for the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use tracing::{debug, warn};

use crate::errors::Error;
use crate::hint::unlikely;
use crate::id::DescId;
use crate::pool::{DescChain, DescGuard, DescFlags, FreeList, PoolCore, PoolStats, TxDesc};

/// Traffic priority levels, lowest first. Background shares the best-effort
/// level; it is the first class paused and the last resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCategory {
    BestEffort = 0,
    Video = 1,
    Voice = 2,
    HighPriority = 3,
}

pub const NUM_AC: usize = 4;

impl AccessCategory {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Pool status, worst to best. The status uniquely determines which access
/// categories are currently paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Every category paused.
    FullPaused,
    /// Voice and everything below paused.
    VoicePaused,
    /// Video and best-effort paused.
    VideoPaused,
    /// Best-effort/background paused.
    BestEffortPaused,
    Unpaused,
    /// Freshly re-created after a reset; the next threshold evaluation
    /// replaces it rather than trusting stale state.
    UnpausedReattach,
    /// Not admitting; frees still accepted.
    Inactive,
    /// Pending deferred teardown.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    Stop(AccessCategory),
    Start(AccessCategory),
    StopAll,
    StartAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    TrafficClass(AccessCategory),
    GlobalControl,
}

/// Backpressure callback into the network stack. Invoked exactly once per
/// threshold boundary crossing, never redundantly within a state.
pub trait PauseHook: Send + Sync {
    fn notify(&self, pool_id: u8, action: QueueAction, reason: PauseReason);
}

impl<F> PauseHook for F
where
    F: Fn(u8, QueueAction, PauseReason) + Send + Sync,
{
    fn notify(&self, pool_id: u8, action: QueueAction, reason: PauseReason) {
        self(pool_id, action, reason)
    }
}

/// One state-machine step: the status to enter and the callback to fire.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub next: FlowStatus,
    pub action: QueueAction,
    pub reason: PauseReason,
}

/// Admission policy seam. A policy only ever steps the status one level per
/// call; batch operations iterate until the thresholds and the status agree,
/// firing one callback per level crossed.
pub trait AdmissionPolicy: Send + Sync + 'static {
    /// Evaluates a worsening crossing after an allocation.
    fn step_down(&self, status: FlowStatus, avail: usize) -> Option<Transition>;
    /// Evaluates an improving crossing after a free.
    fn step_up(&self, status: FlowStatus, avail: usize) -> Option<Transition>;
    /// Whether pause callbacks run after the pool lock is released.
    fn deferred_callbacks(&self) -> bool;
}

/// Per-access-category stop/start thresholds on the available-descriptor
/// count.
#[derive(Debug, Clone, Copy)]
pub struct AcThresholds {
    stop: [usize; NUM_AC],
    start: [usize; NUM_AC],
}

impl AcThresholds {
    /// Thresholds indexed `[BestEffort, Video, Voice, HighPriority]`.
    /// Start must exceed stop for every category, and stop thresholds must
    /// not increase with priority (lower classes pause first).
    pub fn new(stop: [usize; NUM_AC], start: [usize; NUM_AC]) -> Result<Self, Error> {
        for ac in 0..NUM_AC {
            if start[ac] <= stop[ac] {
                return Err(Error::BadConfig("start threshold must exceed stop threshold"));
            }
        }
        for w in stop.windows(2) {
            if w[0] < w[1] {
                return Err(Error::BadConfig(
                    "stop thresholds must not increase with priority",
                ));
            }
        }
        Ok(Self { stop, start })
    }
}

/// Per-category cascading admission: one category pauses or resumes per
/// boundary crossing, lowest priority first on the way down and last on the
/// way back up.
pub struct AcCascade {
    thresholds: AcThresholds,
}

impl AcCascade {
    pub fn new(thresholds: AcThresholds) -> Self {
        Self { thresholds }
    }
}

impl AdmissionPolicy for AcCascade {
    fn step_down(&self, status: FlowStatus, avail: usize) -> Option<Transition> {
        use AccessCategory::*;
        let (ac, next) = match status {
            FlowStatus::Unpaused | FlowStatus::UnpausedReattach => {
                (BestEffort, FlowStatus::BestEffortPaused)
            }
            FlowStatus::BestEffortPaused => (Video, FlowStatus::VideoPaused),
            FlowStatus::VideoPaused => (Voice, FlowStatus::VoicePaused),
            FlowStatus::VoicePaused => (HighPriority, FlowStatus::FullPaused),
            _ => return None,
        };
        (avail <= self.thresholds.stop[ac.index()]).then_some(Transition {
            next,
            action: QueueAction::Stop(ac),
            reason: PauseReason::TrafficClass(ac),
        })
    }

    fn step_up(&self, status: FlowStatus, avail: usize) -> Option<Transition> {
        use AccessCategory::*;
        let (ac, next) = match status {
            FlowStatus::FullPaused => (HighPriority, FlowStatus::VoicePaused),
            FlowStatus::VoicePaused => (Voice, FlowStatus::VideoPaused),
            FlowStatus::VideoPaused => (Video, FlowStatus::BestEffortPaused),
            FlowStatus::BestEffortPaused => (BestEffort, FlowStatus::Unpaused),
            _ => return None,
        };
        (avail > self.thresholds.start[ac.index()]).then_some(Transition {
            next,
            action: QueueAction::Start(ac),
            reason: PauseReason::TrafficClass(ac),
        })
    }

    fn deferred_callbacks(&self) -> bool {
        true
    }
}

/// Single global stop/start pair: crossing the stop threshold pauses every
/// traffic class in one callback.
pub struct GlobalThreshold {
    stop: usize,
    start: usize,
}

impl GlobalThreshold {
    pub fn new(stop: usize, start: usize) -> Result<Self, Error> {
        if start <= stop {
            return Err(Error::BadConfig("start threshold must exceed stop threshold"));
        }
        Ok(Self { stop, start })
    }
}

impl AdmissionPolicy for GlobalThreshold {
    fn step_down(&self, status: FlowStatus, avail: usize) -> Option<Transition> {
        match status {
            FlowStatus::Unpaused | FlowStatus::UnpausedReattach if avail <= self.stop => {
                Some(Transition {
                    next: FlowStatus::FullPaused,
                    action: QueueAction::StopAll,
                    reason: PauseReason::GlobalControl,
                })
            }
            _ => None,
        }
    }

    fn step_up(&self, status: FlowStatus, avail: usize) -> Option<Transition> {
        match status {
            FlowStatus::FullPaused if avail > self.start => Some(Transition {
                next: FlowStatus::Unpaused,
                action: QueueAction::StartAll,
                reason: PauseReason::GlobalControl,
            }),
            _ => None,
        }
    }

    fn deferred_callbacks(&self) -> bool {
        false
    }
}

/// Outcome of a free against a flow-controlled pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    Freed,
    /// The pool was pending teardown and this free returned the last
    /// outstanding descriptor; the owner should release the pool now.
    Quiesced,
}

/// Per-category pause statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PauseStats {
    pub paused: bool,
    pub max_pause: Duration,
}

struct FlowState {
    list: FreeList,
    status: FlowStatus,
    paused_at: [Option<Instant>; NUM_AC],
    max_pause: [Duration; NUM_AC],
}

type Events = ArrayVec<Transition, NUM_AC>;

pub struct FlowControlPool<T: Default = TxDesc> {
    core: PoolCore<T>,
    state: Mutex<FlowState>,
    policy: Box<dyn AdmissionPolicy>,
    hook: Arc<dyn PauseHook>,
    no_desc_drops: AtomicU64,
}

impl<T: Default> FlowControlPool<T> {
    pub fn new(
        pool_id: u8,
        capacity: usize,
        page_size: usize,
        policy: impl AdmissionPolicy,
        hook: impl PauseHook + 'static,
    ) -> Result<Self, Error> {
        let core = PoolCore::build(pool_id, capacity, page_size, false)?;
        let list = FreeList::new(core.capacity(), core.elems_per_page());
        debug!(pool = pool_id, capacity, "flow-controlled pool ready");
        Ok(Self {
            core,
            state: Mutex::new(FlowState {
                list,
                status: FlowStatus::Unpaused,
                paused_at: [None; NUM_AC],
                max_pause: [Duration::ZERO; NUM_AC],
            }),
            policy: Box::new(policy),
            hook: Arc::new(hook),
            no_desc_drops: AtomicU64::new(0),
        })
    }

    /// Pops one descriptor, stepping the pause state machine if availability
    /// crossed a stop threshold. `None` while `Invalid`, `Inactive` or
    /// exhausted; all three bump the drop counter.
    pub fn allocate_one(&self) -> Option<DescId> {
        let mut st = self.state.lock().unwrap();
        if matches!(st.status, FlowStatus::Invalid | FlowStatus::Inactive) {
            self.no_desc_drops.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let Some(flat) = st.list.pop() else {
            self.no_desc_drops.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.core.mark_allocated(flat);
        let id = self.core.id_of(flat);
        let events = self.step_down_all(&mut st);
        settle_reattach(&mut st, &events);
        self.dispatch(st, events);
        Some(id)
    }

    /// Atomic batch allocation. A batch that drops availability through more
    /// than one threshold fires one callback per level crossed, in order.
    pub fn allocate_many(&self, n: usize) -> Result<DescChain, Error> {
        debug_assert!(n <= self.core.capacity(), "batch larger than pool");
        let mut st = self.state.lock().unwrap();
        if matches!(st.status, FlowStatus::Invalid | FlowStatus::Inactive) {
            self.no_desc_drops.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Insufficient {
                requested: n,
                available: 0,
            });
        }
        let mut flats = Vec::with_capacity(n);
        if unlikely(!st.list.pop_many(n, &mut flats)) {
            self.no_desc_drops.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Insufficient {
                requested: n,
                available: st.list.free_count(),
            });
        }
        let chain = flats
            .into_iter()
            .map(|flat| {
                self.core.mark_allocated(flat);
                self.core.id_of(flat)
            })
            .collect::<Vec<_>>();
        let events = self.step_down_all(&mut st);
        settle_reattach(&mut st, &events);
        self.dispatch(st, events);
        Ok(DescChain::from_ids(chain))
    }

    /// Returns one descriptor, stepping the resume machinery or completing a
    /// deferred teardown.
    pub fn free_one(&self, id: DescId) -> Result<FreeOutcome, Error> {
        let flat = self.core.validate_id(id)?;
        let mut st = self.state.lock().unwrap();
        if unlikely(!self.core.clear(flat)) {
            debug_assert!(false, "free of unallocated descriptor {:#x}", id.raw());
            warn!(pool = self.core.pool_id(), id = id.raw(), "double free ignored");
            return Ok(FreeOutcome::Freed);
        }
        st.list.push(flat);
        self.finish_free(st)
    }

    /// Bulk return under one lock acquisition.
    pub fn free_many(&self, ids: &[DescId]) -> Result<FreeOutcome, Error> {
        let mut flats = Vec::with_capacity(ids.len());
        for id in ids {
            flats.push(self.core.validate_id(*id)?);
        }
        let mut st = self.state.lock().unwrap();
        for (flat, id) in flats.into_iter().zip(ids) {
            if unlikely(!self.core.clear(flat)) {
                debug_assert!(false, "free of unallocated descriptor {:#x}", id.raw());
                warn!(pool = self.core.pool_id(), id = id.raw(), "double free ignored");
                continue;
            }
            st.list.push(flat);
        }
        self.finish_free(st)
    }

    fn finish_free(&self, mut st: MutexGuard<'_, FlowState>) -> Result<FreeOutcome, Error> {
        if st.status == FlowStatus::Invalid {
            if st.list.free_count() == self.core.capacity() {
                // Deferred teardown: the last outstanding descriptor is home.
                st.status = FlowStatus::Inactive;
                drop(st);
                debug!(pool = self.core.pool_id(), "deferred teardown complete");
                return Ok(FreeOutcome::Quiesced);
            }
            return Ok(FreeOutcome::Freed);
        }
        let events = self.step_up_all(&mut st);
        settle_reattach(&mut st, &events);
        self.dispatch(st, events);
        Ok(FreeOutcome::Freed)
    }

    fn step_down_all(&self, st: &mut FlowState) -> Events {
        let mut out = Events::new();
        let now = Instant::now();
        while let Some(tr) = self.policy.step_down(st.status, st.list.free_count()) {
            debug!(
                pool = self.core.pool_id(),
                from = ?st.status,
                to = ?tr.next,
                avail = st.list.free_count(),
                "pausing"
            );
            st.status = tr.next;
            match tr.reason {
                PauseReason::TrafficClass(ac) => st.paused_at[ac.index()] = Some(now),
                PauseReason::GlobalControl => st.paused_at = [Some(now); NUM_AC],
            }
            if out.try_push(tr).is_err() {
                break;
            }
        }
        out
    }

    fn step_up_all(&self, st: &mut FlowState) -> Events {
        let mut out = Events::new();
        let now = Instant::now();
        while let Some(tr) = self.policy.step_up(st.status, st.list.free_count()) {
            debug!(
                pool = self.core.pool_id(),
                from = ?st.status,
                to = ?tr.next,
                avail = st.list.free_count(),
                "resuming"
            );
            st.status = tr.next;
            match tr.reason {
                PauseReason::TrafficClass(ac) => record_resume(st, ac.index(), now),
                PauseReason::GlobalControl => {
                    for i in 0..NUM_AC {
                        record_resume(st, i, now);
                    }
                }
            }
            if out.try_push(tr).is_err() {
                break;
            }
        }
        out
    }

    /// Fires the collected callbacks with the locking discipline the policy
    /// asked for.
    fn dispatch(&self, guard: MutexGuard<'_, FlowState>, events: Events) {
        if events.is_empty() {
            return;
        }
        if self.policy.deferred_callbacks() {
            drop(guard);
            for e in &events {
                self.hook.notify(self.core.pool_id(), e.action, e.reason);
            }
        } else {
            for e in &events {
                self.hook.notify(self.core.pool_id(), e.action, e.reason);
            }
            drop(guard);
        }
    }

    /// Begins teardown. Returns true if the pool was already quiescent (it is
    /// now `Inactive` and may be released); otherwise the pool enters
    /// `Invalid` and the free that returns the last descriptor reports
    /// [`FreeOutcome::Quiesced`].
    pub fn mark_invalid(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.list.allocated_count() == 0 {
            st.status = FlowStatus::Inactive;
            true
        } else {
            debug!(
                pool = self.core.pool_id(),
                outstanding = st.list.allocated_count(),
                "teardown deferred"
            );
            st.status = FlowStatus::Invalid;
            false
        }
    }

    /// Stops admitting without tearing down; frees are still accepted.
    pub fn deactivate(&self) {
        self.state.lock().unwrap().status = FlowStatus::Inactive;
    }

    /// Brings a pool back after a reset event. The pause state is wiped and
    /// thresholds are re-evaluated immediately instead of trusting whatever
    /// the pool believed before the reset.
    pub fn reattach(&self) {
        let mut st = self.state.lock().unwrap();
        st.status = FlowStatus::UnpausedReattach;
        st.paused_at = [None; NUM_AC];
        let events = self.step_down_all(&mut st);
        self.dispatch(st, events);
    }

    /// Exclusive access to an allocated descriptor's payload.
    pub fn descriptor(&self, id: DescId) -> Result<DescGuard<'_, T>, Error> {
        let flat = self.core.validate_id(id)?;
        let inner = unsafe { self.core.slot(flat).borrow_mut() };
        if unlikely(!inner.flags.contains(DescFlags::ALLOCATED)) {
            debug_assert!(false, "access to unallocated descriptor {:#x}", id.raw());
            return Err(Error::IdOutOfRange { id: id.raw() });
        }
        Ok(DescGuard::from_slot(inner))
    }

    pub fn status(&self) -> FlowStatus {
        self.state.lock().unwrap().status
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock().unwrap();
        PoolStats {
            capacity: self.core.capacity(),
            free: st.list.free_count(),
            allocated: st.list.allocated_count(),
        }
    }

    pub fn pause_stats(&self) -> [PauseStats; NUM_AC] {
        let st = self.state.lock().unwrap();
        let mut out = [PauseStats::default(); NUM_AC];
        for i in 0..NUM_AC {
            out[i] = PauseStats {
                paused: st.paused_at[i].is_some(),
                max_pause: st.max_pause[i],
            };
        }
        out
    }

    pub fn no_desc_drops(&self) -> u64 {
        self.no_desc_drops.load(Ordering::Relaxed)
    }

    pub fn pool_id(&self) -> u8 {
        self.core.pool_id()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub(crate) fn validate_id(&self, id: DescId) -> Result<(), Error> {
        self.core.validate_id(id).map(|_| ())
    }
}

fn record_resume(st: &mut FlowState, idx: usize, now: Instant) {
    if let Some(t0) = st.paused_at[idx].take() {
        let paused_for = now.saturating_duration_since(t0);
        st.max_pause[idx] = st.max_pause[idx].max(paused_for);
    }
}

/// A reattached pool whose re-evaluation produced no crossing settles back to
/// plain `Unpaused`.
fn settle_reattach(st: &mut FlowState, events: &Events) {
    if events.is_empty() && st.status == FlowStatus::UnpausedReattach {
        st.status = FlowStatus::Unpaused;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    type Event = (u8, QueueAction, PauseReason);

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<StdMutex<Vec<Event>>>,
    }

    impl Recorder {
        fn hook(&self) -> impl PauseHook + 'static {
            let events = self.events.clone();
            move |pool: u8, action: QueueAction, reason: PauseReason| {
                events.lock().unwrap().push((pool, action, reason));
            }
        }

        fn take(&self) -> Vec<Event> {
            mem::take(&mut *self.events.lock().unwrap())
        }
    }

    fn elem_page(elems: usize) -> usize {
        elems * mem::size_of::<crate::slot::SlotCell<crate::pool::Desc<TxDesc>>>()
    }

    fn cascade_pool(pool_id: u8, capacity: usize, rec: &Recorder) -> FlowControlPool {
        let thresholds = AcThresholds::new([80, 60, 40, 20], [85, 65, 45, 25]).unwrap();
        FlowControlPool::new(
            pool_id,
            capacity,
            elem_page(32),
            AcCascade::new(thresholds),
            rec.hook(),
        )
        .unwrap()
    }

    use AccessCategory::*;

    #[test]
    fn cascade_visits_every_state_in_order() {
        let rec = Recorder::default();
        let pool = cascade_pool(0, 100, &rec);

        let mut held = Vec::new();
        let mut visited = Vec::new();
        for _ in 0..100 {
            held.push(pool.allocate_one().unwrap());
            let s = pool.status();
            if visited.last() != Some(&s) {
                visited.push(s);
            }
        }
        assert_eq!(
            visited,
            vec![
                FlowStatus::Unpaused,
                FlowStatus::BestEffortPaused,
                FlowStatus::VideoPaused,
                FlowStatus::VoicePaused,
                FlowStatus::FullPaused,
            ]
        );
        let stops: Vec<_> = rec.take();
        assert_eq!(
            stops,
            vec![
                (0, QueueAction::Stop(BestEffort), PauseReason::TrafficClass(BestEffort)),
                (0, QueueAction::Stop(Video), PauseReason::TrafficClass(Video)),
                (0, QueueAction::Stop(Voice), PauseReason::TrafficClass(Voice)),
                (0, QueueAction::Stop(HighPriority), PauseReason::TrafficClass(HighPriority)),
            ]
        );

        for id in held.drain(..) {
            pool.free_one(id).unwrap();
        }
        assert_eq!(pool.status(), FlowStatus::Unpaused);
        let starts: Vec<_> = rec.take();
        assert_eq!(
            starts,
            vec![
                (0, QueueAction::Start(HighPriority), PauseReason::TrafficClass(HighPriority)),
                (0, QueueAction::Start(Voice), PauseReason::TrafficClass(Voice)),
                (0, QueueAction::Start(Video), PauseReason::TrafficClass(Video)),
                (0, QueueAction::Start(BestEffort), PauseReason::TrafficClass(BestEffort)),
            ]
        );
    }

    #[test]
    fn thresholds_fire_exactly_at_the_boundary() {
        let rec = Recorder::default();
        let pool = cascade_pool(1, 100, &rec);

        // Down to avail = 80: exactly one stop, for best effort.
        let mut held: Vec<_> = (0..20).map(|_| pool.allocate_one().unwrap()).collect();
        assert_eq!(
            rec.take(),
            vec![(1, QueueAction::Stop(BestEffort), PauseReason::TrafficClass(BestEffort))]
        );

        // Down to avail = 60: exactly one more, for video.
        held.extend((0..20).map(|_| pool.allocate_one().unwrap()));
        assert_eq!(
            rec.take(),
            vec![(1, QueueAction::Stop(Video), PauseReason::TrafficClass(Video))]
        );

        // Freeing up to avail = 66 crosses video's start threshold (65).
        for id in held.drain(..6) {
            pool.free_one(id).unwrap();
        }
        assert_eq!(
            rec.take(),
            vec![(1, QueueAction::Start(Video), PauseReason::TrafficClass(Video))]
        );
        assert_eq!(pool.status(), FlowStatus::BestEffortPaused);

        // Up to avail = 86 crosses best effort's start threshold (85).
        for id in held.drain(..20) {
            pool.free_one(id).unwrap();
        }
        assert_eq!(
            rec.take(),
            vec![(1, QueueAction::Start(BestEffort), PauseReason::TrafficClass(BestEffort))]
        );
        assert_eq!(pool.status(), FlowStatus::Unpaused);

        for id in held {
            pool.free_one(id).unwrap();
        }
        assert!(rec.take().is_empty());
    }

    #[test]
    fn batch_crossing_fires_one_callback_per_level() {
        let rec = Recorder::default();
        let pool = cascade_pool(2, 100, &rec);

        // One batch takes avail from 100 to 50: through stop[BE]=80 and
        // stop[VI]=60, but not stop[VO]=40.
        let chain = pool.allocate_many(50).unwrap();
        assert_eq!(pool.status(), FlowStatus::VideoPaused);
        assert_eq!(
            rec.take(),
            vec![
                (2, QueueAction::Stop(BestEffort), PauseReason::TrafficClass(BestEffort)),
                (2, QueueAction::Stop(Video), PauseReason::TrafficClass(Video)),
            ]
        );

        // Returning the batch lifts avail back to 100: both categories
        // resume, highest priority first.
        let ids: Vec<_> = chain.into_iter().collect();
        pool.free_many(&ids).unwrap();
        assert_eq!(pool.status(), FlowStatus::Unpaused);
        assert_eq!(
            rec.take(),
            vec![
                (2, QueueAction::Start(Video), PauseReason::TrafficClass(Video)),
                (2, QueueAction::Start(BestEffort), PauseReason::TrafficClass(BestEffort)),
            ]
        );
    }

    #[test]
    fn global_policy_collapses_to_two_states() {
        let rec = Recorder::default();
        let pool: FlowControlPool = FlowControlPool::new(
            3,
            100,
            elem_page(32),
            GlobalThreshold::new(20, 30).unwrap(),
            rec.hook(),
        )
        .unwrap();

        let mut held: Vec<_> = (0..80).map(|_| pool.allocate_one().unwrap()).collect();
        assert_eq!(pool.status(), FlowStatus::FullPaused);
        assert_eq!(
            rec.take(),
            vec![(3, QueueAction::StopAll, PauseReason::GlobalControl)]
        );

        // Further allocations do not re-notify.
        held.push(pool.allocate_one().unwrap());
        assert!(rec.take().is_empty());

        // Not resumed until avail exceeds the start threshold: 19 + 11 = 30
        // is still not past start = 30.
        for id in held.drain(..11) {
            pool.free_one(id).unwrap();
        }
        assert_eq!(pool.status(), FlowStatus::FullPaused);
        assert!(rec.take().is_empty());

        for id in held.drain(..1) {
            pool.free_one(id).unwrap();
        }
        assert_eq!(pool.status(), FlowStatus::Unpaused);
        assert_eq!(
            rec.take(),
            vec![(3, QueueAction::StartAll, PauseReason::GlobalControl)]
        );

        for id in held {
            pool.free_one(id).unwrap();
        }
    }

    #[test]
    fn exhausted_and_inactive_allocations_count_drops() {
        let rec = Recorder::default();
        let thresholds = AcThresholds::new([3, 2, 1, 0], [6, 5, 4, 3]).unwrap();
        let pool: FlowControlPool = FlowControlPool::new(
            4,
            8,
            elem_page(8),
            AcCascade::new(thresholds),
            rec.hook(),
        )
        .unwrap();

        let held: Vec<_> = (0..8).map(|_| pool.allocate_one().unwrap()).collect();
        assert!(pool.allocate_one().is_none());
        assert!(pool.allocate_one().is_none());
        assert_eq!(pool.no_desc_drops(), 2);

        pool.free_many(&held).unwrap();
        pool.deactivate();
        assert!(pool.allocate_one().is_none());
        assert_eq!(pool.no_desc_drops(), 3);
    }

    #[test]
    fn deferred_teardown_quiesces_on_last_free() {
        let rec = Recorder::default();
        let pool = cascade_pool(5, 100, &rec);
        let held: Vec<_> = (0..3).map(|_| pool.allocate_one().unwrap()).collect();

        assert!(!pool.mark_invalid());
        assert_eq!(pool.status(), FlowStatus::Invalid);
        assert!(pool.allocate_one().is_none());

        assert_eq!(pool.free_one(held[0]).unwrap(), FreeOutcome::Freed);
        assert_eq!(pool.free_one(held[1]).unwrap(), FreeOutcome::Freed);
        assert_eq!(pool.free_one(held[2]).unwrap(), FreeOutcome::Quiesced);
        assert_eq!(pool.status(), FlowStatus::Inactive);

        // An already-quiescent pool tears down immediately.
        let other = cascade_pool(6, 100, &rec);
        assert!(other.mark_invalid());
    }

    #[test]
    fn reattach_reevaluates_thresholds() {
        let rec = Recorder::default();
        let thresholds = AcThresholds::new([4, 2, 1, 0], [6, 4, 3, 2]).unwrap();
        let pool: FlowControlPool = FlowControlPool::new(
            7,
            10,
            elem_page(10),
            AcCascade::new(thresholds),
            rec.hook(),
        )
        .unwrap();

        // avail = 4 pauses best effort on the way down.
        let held: Vec<_> = (0..6).map(|_| pool.allocate_one().unwrap()).collect();
        assert_eq!(pool.status(), FlowStatus::BestEffortPaused);
        rec.take();

        pool.deactivate();
        assert!(pool.allocate_one().is_none());

        // Reattach with avail still at the stop boundary: the pause is
        // re-announced rather than trusted from before the reset.
        pool.reattach();
        assert_eq!(pool.status(), FlowStatus::BestEffortPaused);
        assert_eq!(
            rec.take(),
            vec![(7, QueueAction::Stop(BestEffort), PauseReason::TrafficClass(BestEffort))]
        );

        pool.free_many(&held).unwrap();
        rec.take();

        // Reattach with a healthy pool: no events, settles on first use.
        pool.deactivate();
        pool.reattach();
        assert_eq!(pool.status(), FlowStatus::UnpausedReattach);
        assert!(rec.take().is_empty());
        let id = pool.allocate_one().unwrap();
        assert_eq!(pool.status(), FlowStatus::Unpaused);
        pool.free_one(id).unwrap();
    }

    #[test]
    fn pause_durations_are_recorded() {
        let rec = Recorder::default();
        let pool = cascade_pool(8, 100, &rec);

        let held: Vec<_> = (0..20).map(|_| pool.allocate_one().unwrap()).collect();
        assert!(pool.pause_stats()[BestEffort.index()].paused);

        thread::sleep(Duration::from_millis(5));
        pool.free_many(&held).unwrap();

        let stats = pool.pause_stats();
        assert!(!stats[BestEffort.index()].paused);
        assert!(stats[BestEffort.index()].max_pause >= Duration::from_millis(5));
        assert_eq!(stats[Video.index()].max_pause, Duration::ZERO);
    }

    #[test]
    fn capacity_invariant_holds_under_flow_control() {
        let rec = Recorder::default();
        let pool = cascade_pool(9, 100, &rec);
        let mut held = Vec::new();
        for i in 0..400usize {
            if i % 3 != 2 {
                if let Some(id) = pool.allocate_one() {
                    held.push(id);
                }
            } else if let Some(id) = held.pop() {
                pool.free_one(id).unwrap();
            }
            let s = pool.stats();
            assert_eq!(s.free + s.allocated, s.capacity);
        }
    }

    #[test]
    fn rejects_inverted_thresholds() {
        assert!(AcThresholds::new([80, 60, 40, 20], [80, 65, 45, 25]).is_err());
        assert!(AcThresholds::new([60, 80, 40, 20], [85, 85, 45, 25]).is_err());
        assert!(GlobalThreshold::new(30, 30).is_err());
    }
}
