//! Resource accounter: transactional reservations over the resource tree.
//!
//! The accounter keeps one committed view plus a small set of open
//! candidate views. A new view shares the committed ledger through an
//! `Arc` and clones it on its first write, so opening a view costs one
//! reference count.
//!
//! Lock order: tree → committed → views → view → retired → power.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use bbque_core::{ResourcePath, WorkloadId};

use crate::binding::{self, ResourceBinding};
use crate::error::{AccountError, AccountResult};
use crate::ledger::{Ledger, Reservation};
use crate::power::PowerSetting;
use crate::tree::{DEGRADATION_HISTORY, Resource, ResourceTree};

/// Retired tokens remembered for typed finalizer errors.
const RETIRED_MEMORY: u64 = 1024;

/// Opaque handle to one reservation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ViewToken(u64);

impl fmt::Display for ViewToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Retired {
    Adopted,
    Discarded,
    Invalidated,
}

struct OpenView {
    label: String,
    ledger: Arc<Ledger>,
}

struct Committed {
    token: ViewToken,
    ledger: Arc<Ledger>,
}

/// Multi-view reservation ledger.
pub struct ResourceAccounter {
    tree: RwLock<ResourceTree>,
    committed: RwLock<Committed>,
    views: Mutex<HashMap<ViewToken, Arc<Mutex<OpenView>>>>,
    retired: Mutex<HashMap<ViewToken, Retired>>,
    power: Mutex<BTreeMap<ResourcePath, PowerSetting>>,
    next_token: AtomicU64,
    max_views: usize,
}

impl ResourceAccounter {
    /// Create an accounter with an empty tree and an empty committed view.
    pub fn new(max_views: usize) -> Self {
        Self {
            tree: RwLock::new(ResourceTree::new()),
            committed: RwLock::new(Committed {
                token: ViewToken(0),
                ledger: Arc::new(Ledger::default()),
            }),
            views: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
            power: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
            max_views: max_views.max(1),
        }
    }

    // ── Resource tree ──────────────────────────────────────────

    /// Register a resource, replacing the capacity of a known path.
    ///
    /// Reservations that no longer fit are reported, not evicted.
    pub fn register_resource(
        &self,
        path: &str,
        model: Option<&str>,
        capacity: u64,
    ) -> AccountResult<ResourcePath> {
        let path = ResourcePath::parse(path)?;
        let mut tree = write(&self.tree);
        tree.register(&path, model.map(str::to_string), capacity)?;
        self.warn_infeasible(&tree, &path);
        Ok(path)
    }

    pub fn get(&self, path: &ResourcePath) -> Option<Resource> {
        read(&self.tree).get(path).cloned()
    }

    /// Nodes matching `pattern` at its own depth, in path order.
    pub fn list(&self, pattern: &ResourcePath) -> Vec<Resource> {
        read(&self.tree).list(pattern).into_iter().cloned().collect()
    }

    /// Leaves equal to or below `pattern`, in path order.
    pub fn leaves(&self, pattern: &ResourcePath) -> Vec<Resource> {
        read(&self.tree).leaves(pattern).into_iter().cloned().collect()
    }

    /// Take `amount` of a resource out of service for future bookings.
    pub fn set_offline(&self, path: &ResourcePath, amount: u64) -> AccountResult<()> {
        let mut tree = write(&self.tree);
        let resource = tree.get_mut(path)?;
        resource.offline = amount.min(resource.capacity);
        let fully_off = resource.is_offline();
        info!(%path, offline = resource.offline, "resource set offline");
        drop(tree);

        if fully_off {
            self.enqueue_power_setting(path, PowerSetting::offline());
        }
        Ok(())
    }

    pub fn clear_offline(&self, path: &ResourcePath) -> AccountResult<()> {
        let mut tree = write(&self.tree);
        let resource = tree.get_mut(path)?;
        let was_off = resource.is_offline();
        resource.offline = 0;
        info!(%path, "resource back online");
        drop(tree);

        if was_off {
            self.enqueue_power_setting(path, PowerSetting::online());
        }
        Ok(())
    }

    /// Append a degradation sample (percent, clamped to 100).
    pub fn notify_degradation(&self, path: &ResourcePath, percent: u8) -> AccountResult<()> {
        let mut tree = write(&self.tree);
        let resource = tree.get_mut(path)?;
        resource.degradation.push_back(percent.min(100));
        while resource.degradation.len() > DEGRADATION_HISTORY {
            resource.degradation.pop_front();
        }
        info!(%path, percent, "resource degradation notified");
        Ok(())
    }

    pub fn set_high_performance(&self, path: &ResourcePath, high: bool) -> AccountResult<()> {
        write(&self.tree).get_mut(path)?.high_performance = high;
        Ok(())
    }

    /// False for unknown paths.
    pub fn is_high_performance(&self, path: &ResourcePath) -> bool {
        read(&self.tree)
            .get(path)
            .is_some_and(|r| r.high_performance)
    }

    // ── Views ──────────────────────────────────────────────────

    /// Open a candidate view branched from the committed one.
    pub fn open_view(&self, label: &str) -> AccountResult<ViewToken> {
        let committed = read(&self.committed);
        let mut views = lock(&self.views);
        if views.len() >= self.max_views {
            warn!(label, open = views.len(), "view limit reached");
            return Err(AccountError::TooManyViews(self.max_views));
        }

        let token = ViewToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        views.insert(
            token,
            Arc::new(Mutex::new(OpenView {
                label: label.to_string(),
                ledger: Arc::clone(&committed.ledger),
            })),
        );
        debug!(%token, label, base = %committed.token, "view opened");
        Ok(token)
    }

    pub fn committed_token(&self) -> ViewToken {
        read(&self.committed).token
    }

    /// Tokens of the open candidate views, sorted.
    pub fn open_views(&self) -> Vec<ViewToken> {
        let mut tokens: Vec<ViewToken> = lock(&self.views).keys().copied().collect();
        tokens.sort();
        tokens
    }

    /// Promote `token` to committed. Every other open view is invalidated.
    pub fn adopt(&self, token: ViewToken) -> AccountResult<()> {
        let mut committed = write(&self.committed);
        if committed.token == token {
            return Err(AccountError::AlreadyAdopted(token));
        }

        let mut views = lock(&self.views);
        let Some(view) = views.remove(&token) else {
            drop(views);
            return Err(self.retired_error(token));
        };
        let (label, ledger) = {
            let view = lock(&view);
            (view.label.clone(), Arc::clone(&view.ledger))
        };
        let invalidated: Vec<ViewToken> = views.drain().map(|(t, _)| t).collect();
        drop(views);

        let previous = std::mem::replace(&mut *committed, Committed { token, ledger });
        drop(committed);

        let mut retired = lock(&self.retired);
        retired.entry(previous.token).or_insert(Retired::Adopted);
        retired.insert(token, Retired::Adopted);
        for t in &invalidated {
            retired.insert(*t, Retired::Invalidated);
        }
        let horizon = token.0.saturating_sub(RETIRED_MEMORY);
        retired.retain(|t, _| t.0 >= horizon);

        info!(
            %token,
            label,
            previous = %previous.token,
            invalidated = invalidated.len(),
            "view adopted"
        );
        Ok(())
    }

    /// Release an open view without promoting it.
    pub fn discard(&self, token: ViewToken) -> AccountResult<()> {
        if self.committed_token() == token {
            return Err(AccountError::CommittedView(token));
        }
        let removed = lock(&self.views).remove(&token);
        match removed {
            Some(view) => {
                lock(&self.retired).insert(token, Retired::Discarded);
                debug!(%token, label = %lock(&view).label, "view discarded");
                Ok(())
            }
            None => Err(self.retired_error(token)),
        }
    }

    // ── Reservations ───────────────────────────────────────────

    /// Free amount on the leaves matched by `pattern` in view `token`.
    pub fn available(&self, pattern: &ResourcePath, token: ViewToken) -> AccountResult<u64> {
        let tree = read(&self.tree);
        let leaves = tree.leaves(pattern);
        if leaves.is_empty() {
            return Err(AccountError::BadPath(pattern.to_string()));
        }
        self.with_ledger(token, |ledger| {
            leaves
                .iter()
                .map(|r| r.effective_capacity().saturating_sub(ledger.used(&r.path)))
                .sum()
        })
    }

    /// Amount reserved on the leaves matched by `pattern` in view `token`.
    pub fn used(&self, pattern: &ResourcePath, token: ViewToken) -> AccountResult<u64> {
        let tree = read(&self.tree);
        let leaves = tree.leaves(pattern);
        self.with_ledger(token, |ledger| leaves.iter().map(|r| ledger.used(&r.path)).sum())
    }

    pub fn used_by(
        &self,
        workload: WorkloadId,
        pattern: &ResourcePath,
        token: ViewToken,
    ) -> AccountResult<u64> {
        let tree = read(&self.tree);
        let leaves = tree.leaves(pattern);
        self.with_ledger(token, |ledger| {
            leaves.iter().map(|r| ledger.used_by(workload, &r.path)).sum()
        })
    }

    /// Reserve every entry of `binding` for `workload` in view `token`.
    ///
    /// Entries are applied in path order. On the first failure the entries
    /// already applied by this call are rolled back.
    pub fn book(
        &self,
        workload: WorkloadId,
        binding: &ResourceBinding,
        token: ViewToken,
    ) -> AccountResult<()> {
        if binding.is_empty() {
            return Err(AccountError::EmptyBinding(workload));
        }
        let tree = read(&self.tree);
        self.with_view_mut(token, |ledger| {
            let mut applied: Vec<(ResourcePath, u64)> = Vec::with_capacity(binding.len());
            for (path, amount) in binding.iter() {
                if let Err(e) = check_request(&tree, ledger, workload, path, amount) {
                    for (path, previous) in applied.iter().rev() {
                        ledger.set(workload, path, *previous);
                    }
                    debug!(%workload, %token, error = %e, "booking rolled back");
                    return Err(e);
                }
                let previous = ledger.set(workload, path, amount);
                applied.push((path.clone(), previous));
            }
            debug!(%workload, %token, entries = applied.len(), "resources booked");
            Ok(())
        })
    }

    /// Remove every reservation of `workload` in view `token`.
    pub fn release(&self, workload: WorkloadId, token: ViewToken) -> AccountResult<()> {
        self.with_view_mut(token, |ledger| {
            let removed = ledger.remove_workload(workload);
            if !removed.is_empty() {
                debug!(%workload, %token, entries = removed.len(), "resources released");
            }
            Ok(())
        })
    }

    /// Replace the reservations of `workload` in `token` with the ones it
    /// holds in the committed view.
    pub fn revert_to_committed(&self, workload: WorkloadId, token: ViewToken) -> AccountResult<()> {
        let binding = self.committed_binding(workload);
        self.release(workload, token)?;
        if binding.is_empty() {
            return Ok(());
        }
        self.book(workload, &binding, token)
    }

    /// What `workload` holds in the committed view.
    pub fn committed_binding(&self, workload: WorkloadId) -> ResourceBinding {
        let committed = read(&self.committed);
        let mut binding = ResourceBinding::new();
        if let Some(holdings) = committed.ledger.holdings(workload) {
            for (path, amount) in holdings {
                binding.bind(path.clone(), *amount);
            }
        }
        binding
    }

    pub fn reservations(&self, token: ViewToken) -> AccountResult<Vec<Reservation>> {
        self.with_ledger(token, Ledger::reservations)
    }

    /// Shared snapshot of a view's ledger.
    pub fn snapshot(&self, token: ViewToken) -> AccountResult<Arc<Ledger>> {
        if let Some(ledger) = self.committed_ledger_if(token) {
            return Ok(ledger);
        }
        let view = self.open_view_handle(token)?;
        let ledger = Arc::clone(&lock(&view).ledger);
        Ok(ledger)
    }

    /// Structural comparison of two bindings.
    pub fn is_reshuffling(&self, prev: &ResourceBinding, next: &ResourceBinding) -> bool {
        binding::is_reshuffling(prev, next)
    }

    // ── Power management ───────────────────────────────────────

    pub fn enqueue_power_setting(&self, path: &ResourcePath, setting: PowerSetting) {
        debug!(%path, online = setting.online, "power setting queued");
        lock(&self.power).insert(path.clone(), setting);
    }

    /// Drain the queued power settings in path order.
    pub fn take_power_settings(&self) -> Vec<(ResourcePath, PowerSetting)> {
        std::mem::take(&mut *lock(&self.power)).into_iter().collect()
    }

    /// Log a usage table of view `token`.
    pub fn status(&self, token: ViewToken) {
        let tree = read(&self.tree);
        let result = self.with_ledger(token, |ledger| {
            for r in tree.iter().filter(|r| r.leaf) {
                debug!(
                    %token,
                    path = %r.path,
                    used = ledger.used(&r.path),
                    capacity = r.effective_capacity(),
                    offline = r.offline,
                    degradation = r.degradation(),
                    "resource usage"
                );
            }
        });
        if let Err(e) = result {
            warn!(%token, error = %e, "status unavailable");
        }
    }

    // ── Internal helpers ───────────────────────────────────────

    fn committed_ledger_if(&self, token: ViewToken) -> Option<Arc<Ledger>> {
        let committed = read(&self.committed);
        (committed.token == token).then(|| Arc::clone(&committed.ledger))
    }

    fn open_view_handle(&self, token: ViewToken) -> AccountResult<Arc<Mutex<OpenView>>> {
        let handle = lock(&self.views).get(&token).cloned();
        handle.ok_or_else(|| self.retired_error(token))
    }

    fn with_ledger<R>(&self, token: ViewToken, f: impl FnOnce(&Ledger) -> R) -> AccountResult<R> {
        if let Some(ledger) = self.committed_ledger_if(token) {
            return Ok(f(&ledger));
        }
        let view = self.open_view_handle(token)?;
        let view = lock(&view);
        Ok(f(&view.ledger))
    }

    fn with_view_mut<R>(
        &self,
        token: ViewToken,
        f: impl FnOnce(&mut Ledger) -> AccountResult<R>,
    ) -> AccountResult<R> {
        if self.committed_token() == token {
            return Err(AccountError::CommittedView(token));
        }
        let view = self.open_view_handle(token)?;
        let mut view = lock(&view);
        f(Arc::make_mut(&mut view.ledger))
    }

    fn retired_error(&self, token: ViewToken) -> AccountError {
        match lock(&self.retired).get(&token) {
            Some(Retired::Adopted) => AccountError::AlreadyAdopted(token),
            Some(Retired::Discarded) => AccountError::AlreadyClosed(token),
            Some(Retired::Invalidated) => AccountError::Invalidated(token),
            None => AccountError::UnknownView(token),
        }
    }

    fn warn_infeasible(&self, tree: &ResourceTree, path: &ResourcePath) {
        let Some(resource) = tree.get(path) else { return };
        let capacity = resource.effective_capacity();

        let committed = read(&self.committed);
        let mut ledgers = vec![(committed.token, Arc::clone(&committed.ledger))];
        drop(committed);
        let handles: Vec<(ViewToken, Arc<Mutex<OpenView>>)> = lock(&self.views)
            .iter()
            .map(|(t, v)| (*t, Arc::clone(v)))
            .collect();
        for (token, view) in handles {
            ledgers.push((token, Arc::clone(&lock(&view).ledger)));
        }

        for (token, ledger) in ledgers {
            let used = ledger.used(path);
            if used > capacity {
                warn!(%path, %token, used, capacity, "reservations exceed new capacity");
            }
        }
    }
}

fn check_request(
    tree: &ResourceTree,
    ledger: &Ledger,
    workload: WorkloadId,
    path: &ResourcePath,
    amount: u64,
) -> AccountResult<()> {
    let resource = tree
        .get(path)
        .filter(|r| r.leaf)
        .ok_or_else(|| AccountError::BadPath(path.to_string()))?;
    if resource.is_offline() {
        return Err(AccountError::Offline { path: path.clone() });
    }
    let others = ledger.used(path) - ledger.used_by(workload, path);
    let available = resource.effective_capacity().saturating_sub(others);
    if amount > available {
        return Err(AccountError::NotEnough {
            path: path.clone(),
            requested: amount,
            available,
        });
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ResourcePath {
        p.parse().unwrap()
    }

    fn make_accounter() -> ResourceAccounter {
        let ra = ResourceAccounter::new(4);
        for pe in 0..4 {
            ra.register_resource(&format!("sys0.cpu0.pe{pe}"), None, 100)
                .unwrap();
        }
        ra.register_resource("sys0.mem0", Some("dram"), 1024).unwrap();
        ra
    }

    fn pes(amounts: &[(u32, u64)]) -> ResourceBinding {
        let mut binding = ResourceBinding::new();
        for (pe, amount) in amounts {
            binding.bind(path(&format!("sys0.cpu0.pe{pe}")), *amount);
        }
        binding
    }

    const A: WorkloadId = WorkloadId { pid: 100, sub: None };
    const B: WorkloadId = WorkloadId { pid: 200, sub: None };

    #[test]
    fn book_and_available() {
        let ra = make_accounter();
        let v = ra.open_view("test").unwrap();
        assert_eq!(ra.available(&path("sys0.cpu0.pe"), v).unwrap(), 400);

        ra.book(A, &pes(&[(0, 100), (1, 50)]), v).unwrap();
        assert_eq!(ra.available(&path("sys0.cpu0.pe"), v).unwrap(), 250);
        assert_eq!(ra.available(&path("sys0.cpu0.pe1"), v).unwrap(), 50);
        assert_eq!(ra.used_by(A, &path("sys0.cpu0"), v).unwrap(), 150);

        // The committed view is untouched until adopt.
        let committed = ra.committed_token();
        assert_eq!(ra.available(&path("sys0.cpu0.pe"), committed).unwrap(), 400);
    }

    #[test]
    fn failed_booking_leaves_view_unchanged() {
        let ra = make_accounter();
        let v = ra.open_view("test").unwrap();
        ra.book(B, &pes(&[(2, 80)]), v).unwrap();
        let before = ra.reservations(v).unwrap();

        let err = ra
            .book(A, &pes(&[(0, 100), (1, 100), (2, 30)]), v)
            .unwrap_err();
        assert_eq!(
            err,
            AccountError::NotEnough {
                path: path("sys0.cpu0.pe2"),
                requested: 30,
                available: 20,
            }
        );
        assert_eq!(ra.reservations(v).unwrap(), before);
    }

    #[test]
    fn bad_path_and_empty_binding() {
        let ra = make_accounter();
        let v = ra.open_view("test").unwrap();
        let inner = ResourceBinding::new().with(path("sys0.cpu0"), 10);
        assert!(matches!(ra.book(A, &inner, v), Err(AccountError::BadPath(_))));
        let unknown = ResourceBinding::new().with(path("sys0.gpu0"), 10);
        assert!(matches!(ra.book(A, &unknown, v), Err(AccountError::BadPath(_))));
        assert_eq!(
            ra.book(A, &ResourceBinding::new(), v),
            Err(AccountError::EmptyBinding(A))
        );
    }

    #[test]
    fn rebooking_replaces_prior_amount() {
        let ra = make_accounter();
        let v = ra.open_view("test").unwrap();
        ra.book(A, &pes(&[(0, 100)]), v).unwrap();
        // Same workload, same path: replacement, not accumulation.
        ra.book(A, &pes(&[(0, 60)]), v).unwrap();
        assert_eq!(ra.used(&path("sys0.cpu0.pe0"), v).unwrap(), 60);
    }

    #[test]
    fn release_frees_everything() {
        let ra = make_accounter();
        let v = ra.open_view("test").unwrap();
        ra.book(A, &pes(&[(0, 100), (3, 10)]), v).unwrap();
        ra.release(A, v).unwrap();
        assert_eq!(ra.used(&path("sys0"), v).unwrap(), 0);
    }

    #[test]
    fn views_are_isolated() {
        let ra = make_accounter();
        let v1 = ra.open_view("policy").unwrap();
        let v2 = ra.open_view("test").unwrap();
        let before = ra.snapshot(v2).unwrap();

        ra.book(A, &pes(&[(0, 100)]), v1).unwrap();
        assert_eq!(*ra.snapshot(v2).unwrap(), *before);
        assert_eq!(ra.available(&path("sys0.cpu0.pe0"), v2).unwrap(), 100);
    }

    #[test]
    fn adopt_swaps_and_invalidates_others() {
        let ra = make_accounter();
        let initial = ra.committed_token();
        let v1 = ra.open_view("policy").unwrap();
        let v2 = ra.open_view("test").unwrap();
        ra.book(A, &pes(&[(0, 100)]), v1).unwrap();

        ra.adopt(v1).unwrap();
        assert_eq!(ra.committed_token(), v1);
        assert_eq!(ra.used(&path("sys0.cpu0.pe0"), v1).unwrap(), 100);
        assert!(ra.open_views().is_empty());

        assert_eq!(ra.adopt(v1), Err(AccountError::AlreadyAdopted(v1)));
        assert_eq!(ra.discard(v2), Err(AccountError::Invalidated(v2)));
        assert_eq!(ra.adopt(initial), Err(AccountError::AlreadyAdopted(initial)));
        assert!(matches!(
            ra.available(&path("sys0.cpu0.pe0"), initial),
            Err(AccountError::AlreadyAdopted(_))
        ));
    }

    #[test]
    fn discard_twice_is_typed_error() {
        let ra = make_accounter();
        let v = ra.open_view("test").unwrap();
        ra.discard(v).unwrap();
        assert_eq!(ra.discard(v), Err(AccountError::AlreadyClosed(v)));
        assert_eq!(ra.adopt(v), Err(AccountError::AlreadyClosed(v)));
        let committed = ra.committed_token();
        assert_eq!(ra.discard(committed), Err(AccountError::CommittedView(committed)));
        assert_eq!(
            ra.discard(ViewToken(999)),
            Err(AccountError::UnknownView(ViewToken(999)))
        );
    }

    #[test]
    fn view_limit() {
        let ra = ResourceAccounter::new(2);
        ra.open_view("a").unwrap();
        ra.open_view("b").unwrap();
        assert_eq!(ra.open_view("c"), Err(AccountError::TooManyViews(2)));
    }

    #[test]
    fn booking_into_committed_view_rejected() {
        let ra = make_accounter();
        let committed = ra.committed_token();
        assert_eq!(
            ra.book(A, &pes(&[(0, 10)]), committed),
            Err(AccountError::CommittedView(committed))
        );
    }

    #[test]
    fn offline_keeps_existing_reservations() {
        let ra = make_accounter();
        let v = ra.open_view("sched").unwrap();
        ra.book(A, &pes(&[(0, 50)]), v).unwrap();
        ra.adopt(v).unwrap();

        ra.set_offline(&path("sys0.cpu0.pe0"), 100).unwrap();
        let next = ra.open_view("sched").unwrap();
        assert_eq!(ra.available(&path("sys0.cpu0.pe0"), next).unwrap(), 0);
        assert_eq!(ra.used_by(A, &path("sys0.cpu0.pe0"), next).unwrap(), 50);
        assert!(matches!(
            ra.book(B, &pes(&[(0, 10)]), next),
            Err(AccountError::Offline { .. })
        ));

        let settings = ra.take_power_settings();
        assert_eq!(settings, vec![(path("sys0.cpu0.pe0"), PowerSetting::offline())]);
        assert!(ra.take_power_settings().is_empty());

        ra.clear_offline(&path("sys0.cpu0.pe0")).unwrap();
        assert_eq!(ra.available(&path("sys0.cpu0.pe0"), next).unwrap(), 50);
    }

    #[test]
    fn partial_offline_reduces_capacity() {
        let ra = make_accounter();
        ra.set_offline(&path("sys0.cpu0.pe1"), 40).unwrap();
        let v = ra.open_view("sched").unwrap();
        assert_eq!(ra.available(&path("sys0.cpu0.pe1"), v).unwrap(), 60);
        assert!(matches!(
            ra.book(A, &pes(&[(1, 70)]), v),
            Err(AccountError::NotEnough { available: 60, .. })
        ));
        assert!(ra.take_power_settings().is_empty());
    }

    #[test]
    fn revert_restores_committed_holdings() {
        let ra = make_accounter();
        let v = ra.open_view("sched").unwrap();
        ra.book(A, &pes(&[(0, 100)]), v).unwrap();
        ra.adopt(v).unwrap();

        let next = ra.open_view("sched").unwrap();
        ra.release(A, next).unwrap();
        ra.book(A, &pes(&[(1, 100), (2, 100)]), next).unwrap();
        ra.revert_to_committed(A, next).unwrap();
        assert_eq!(ra.committed_binding(A), pes(&[(0, 100)]));
        assert_eq!(ra.used(&path("sys0.cpu0.pe"), next).unwrap(), 100);
        assert_eq!(ra.used(&path("sys0.cpu0.pe0"), next).unwrap(), 100);
    }

    #[test]
    fn degradation_history_is_bounded() {
        let ra = make_accounter();
        let pe = path("sys0.cpu0.pe0");
        for pct in 0..20u8 {
            ra.notify_degradation(&pe, pct * 10).unwrap();
        }
        let resource = ra.get(&pe).unwrap();
        assert_eq!(resource.degradation.len(), DEGRADATION_HISTORY);
        assert_eq!(resource.degradation(), 100);
    }

    #[test]
    fn capacity_replacement_keeps_reservations() {
        let ra = make_accounter();
        let v = ra.open_view("sched").unwrap();
        ra.book(A, &pes(&[(0, 80)]), v).unwrap();
        ra.register_resource("sys0.cpu0.pe0", None, 50).unwrap();
        assert_eq!(ra.used(&path("sys0.cpu0.pe0"), v).unwrap(), 80);
        assert_eq!(ra.available(&path("sys0.cpu0.pe0"), v).unwrap(), 0);
    }

    #[test]
    fn concurrent_readers_see_whole_views() {
        let ra = Arc::new(make_accounter());
        let v = ra.open_view("sched").unwrap();
        ra.book(A, &pes(&[(0, 100), (1, 100), (2, 100), (3, 100)]), v)
            .unwrap();

        let reader = {
            let ra = Arc::clone(&ra);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let token = ra.committed_token();
                    if let Ok(used) = ra.used(&path("sys0.cpu0.pe"), token) {
                        assert!(used == 0 || used == 400, "partial view: {used}");
                    }
                }
            })
        };
        ra.adopt(v).unwrap();
        reader.join().unwrap();
    }
}
