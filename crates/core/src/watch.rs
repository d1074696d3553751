//! Live subscriptions that follow the fact graph as it grows.
//!
//! A watch runs a [`Query`] from an anchor fact, reports every result through
//! its add handler, and from then on keeps the result set current: when a new
//! fact arrives, the engine consults the query's [`Inverse`]s to find out
//! whether this watch is affected and which results appear or disappear. No
//! watch is ever re-executed in full.
//!
//! Nested subscriptions spawn one child watch per result of their parent.
//! A child lives exactly as long as the parent result it was spawned from.
//!
//! The engine is single-writer: one fact's cascade, including every child
//! spawned or stopped along the way, completes before the next fact is
//! looked at. Handlers cannot call back into the engine; they publish through
//! a [`Publisher`], whose facts are queued and processed after the current
//! cascade.
//!
//! ```rust
//! use factwatch::{Fact, MemoryStore, Query, Subscription, WatchEngine};
//! use std::sync::{Arc, Mutex};
//!
//! let mut engine = WatchEngine::new(MemoryStore::new());
//! let chores = Fact::new().with("name", "Chores");
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! let tasks = Subscription::new(Query::new().successor("list"), move |task| {
//!     sink.lock().unwrap().push(task.clone());
//! });
//! engine.watch(chores.clone(), tasks).unwrap();
//!
//! engine.fact(Fact::new().with("list", chores).with("description", "Trash")).unwrap();
//! assert_eq!(seen.lock().unwrap().len(), 1);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::query::segment::terminal_successor;
use crate::query::{invert, segment, Inverse, Query};
use crate::store::FactStore;
use crate::{Fact, FactwatchError, Result, Value};

/// Callback invoked with a result fact.
pub type Handler = Arc<dyn Fn(&Fact) + Send + Sync>;

/// What to watch: a query, its handlers, and subscriptions nested under each
/// result.
#[derive(Clone)]
pub struct Subscription {
    query: Query,
    on_added: Handler,
    on_removed: Option<Handler>,
    nested: Vec<Arc<Subscription>>,
}

impl Subscription {
    pub fn new(query: Query, on_added: impl Fn(&Fact) + Send + Sync + 'static) -> Self {
        Self {
            query,
            on_added: Arc::new(on_added),
            on_removed: None,
            nested: Vec::new(),
        }
    }

    pub fn on_removed(mut self, handler: impl Fn(&Fact) + Send + Sync + 'static) -> Self {
        self.on_removed = Some(Arc::new(handler));
        self
    }

    /// Watch `child` from every result of this subscription.
    pub fn nest(mut self, child: Subscription) -> Self {
        self.nested.push(Arc::new(child));
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("query", &self.query.to_string())
            .field("has_on_removed", &self.on_removed.is_some())
            .field("nested", &self.nested)
            .finish()
    }
}

/// Stable handle to a watch. Never reused within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(usize);

/// Queues facts for an engine from inside handlers.
#[derive(Clone)]
pub struct Publisher {
    queue: Arc<Mutex<VecDeque<Fact>>>,
}

impl Publisher {
    /// Queue `fact`. It is processed once the engine finishes its current
    /// cascade, or on the next call into the engine.
    pub fn publish(&self, fact: Fact) -> Result<()> {
        lock_queue(&self.queue)?.push_back(fact);
        Ok(())
    }
}

fn lock_queue(queue: &Mutex<VecDeque<Fact>>) -> Result<MutexGuard<'_, VecDeque<Fact>>> {
    queue
        .lock()
        .map_err(|_| FactwatchError::Internal("publish queue lock poisoned".into()))
}

/// Derived, query-only data shared by every watch on the same query.
#[derive(Debug)]
struct QueryPlan {
    inverses: Vec<Inverse>,
    /// The query walked from a result back to the anchor. A candidate is a
    /// result exactly when this reaches the anchor.
    reversed: Query,
    /// Roles closing a segment; a new fact without any of them cannot
    /// trigger an inverse.
    trigger_roles: BTreeSet<String>,
}

impl QueryPlan {
    fn new(query: &Query) -> Self {
        let trigger_roles = segment(query)
            .iter()
            .filter_map(|s| terminal_successor(s).map(str::to_string))
            .collect();
        Self {
            inverses: invert(query),
            reversed: query.reversed(),
            trigger_roles,
        }
    }

    fn may_be_affected_by(&self, fact: &Fact) -> bool {
        self.trigger_roles
            .iter()
            .any(|role| fact.field(role).is_some_and(Value::is_predecessor))
    }
}

struct WatchRecord {
    anchor: Fact,
    subscription: Arc<Subscription>,
    plan: Arc<QueryPlan>,
    nested: Vec<Arc<Subscription>>,
    results: Vec<Fact>,
    /// Child watches with the result each was spawned from.
    children: Vec<(Fact, WatchId)>,
    parent: Option<WatchId>,
}

/// The subscription engine over one fact store.
pub struct WatchEngine<S> {
    store: S,
    /// Live watches. Ids increase with creation, so iteration order is
    /// creation order.
    watches: BTreeMap<WatchId, WatchRecord>,
    next_id: usize,
    plans: HashMap<String, Arc<QueryPlan>>,
    gauge: Arc<AtomicUsize>,
    queue: Arc<Mutex<VecDeque<Fact>>>,
}

impl<S> WatchEngine<S> {
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Counter of live watches: incremented once per watch started, child
    /// watches included, and decremented once per watch stopped.
    pub fn gauge(&self) -> Arc<AtomicUsize> {
        self.gauge.clone()
    }

    pub fn publisher(&self) -> Publisher {
        Publisher {
            queue: self.queue.clone(),
        }
    }

    pub fn is_active(&self, id: WatchId) -> bool {
        self.record(id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.watches.len()
    }

    pub fn anchor(&self, id: WatchId) -> Option<&Fact> {
        self.record(id).map(|r| &r.anchor)
    }

    /// Current results of a watch, in the order they were added.
    pub fn results(&self, id: WatchId) -> Option<&[Fact]> {
        self.record(id).map(|r| r.results.as_slice())
    }

    /// Child watches spawned from the results of `id`.
    pub fn children(&self, id: WatchId) -> Vec<WatchId> {
        self.record(id)
            .map(|r| r.children.iter().map(|(_, child)| *child).collect())
            .unwrap_or_default()
    }

    /// Stop a watch and all of its descendants. Stopping an inactive watch
    /// does nothing.
    pub fn stop(&mut self, id: WatchId) {
        let parent = self.record(id).and_then(|r| r.parent);
        if let Some(parent) = parent.and_then(|p| self.record_mut(p)) {
            parent.children.retain(|(_, child)| *child != id);
        }
        self.stop_tree(id);
    }

    /// Stop every watch.
    pub fn stop_all(&mut self) {
        let ids: Vec<WatchId> = self.watches.keys().copied().collect();
        for id in ids {
            self.stop_tree(id);
        }
    }

    fn record(&self, id: WatchId) -> Option<&WatchRecord> {
        self.watches.get(&id)
    }

    fn record_mut(&mut self, id: WatchId) -> Option<&mut WatchRecord> {
        self.watches.get_mut(&id)
    }

    fn stop_tree(&mut self, id: WatchId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(record) = self.watches.remove(&id) else {
                continue;
            };
            self.gauge.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(watch = id.0, "watch stopped");
            pending.extend(record.children.into_iter().map(|(_, child)| child));
        }
    }
}

impl<S: FactStore> WatchEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_gauge(store, Arc::new(AtomicUsize::new(0)))
    }

    /// Create an engine that reports live watches on an external counter.
    pub fn with_gauge(store: S, gauge: Arc<AtomicUsize>) -> Self {
        Self {
            store,
            watches: BTreeMap::new(),
            next_id: 0,
            plans: HashMap::new(),
            gauge,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Start watching `subscription` from `anchor`.
    ///
    /// The add handler fires once per initial result before this returns.
    pub fn watch(&mut self, anchor: Fact, subscription: Subscription) -> Result<WatchId> {
        let id = self.spawn(anchor, Arc::new(subscription), None)?;
        self.drain()?;
        Ok(id)
    }

    /// Attach `subscription` under every current and future result of
    /// `parent`.
    pub fn nest(&mut self, parent: WatchId, subscription: Subscription) -> Result<()> {
        let subscription = Arc::new(subscription);
        let results = {
            let record = self
                .record_mut(parent)
                .ok_or_else(|| FactwatchError::NotFound(format!("watch {}", parent.0)))?;
            record.nested.push(subscription.clone());
            record.results.clone()
        };
        for result in results {
            self.spawn_child(parent, result, subscription.clone())?;
        }
        self.drain()
    }

    /// Add a fact to the graph and update every affected watch.
    ///
    /// Facts already in the store are ignored. Predecessors the store has
    /// not seen are added first, each with its own cascade.
    pub fn fact(&mut self, fact: Fact) -> Result<()> {
        lock_queue(&self.queue)?.push_back(fact);
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            let next = lock_queue(&self.queue)?.pop_front();
            let Some(fact) = next else {
                return Ok(());
            };
            let saved = self.store.save(&fact)?;
            if saved.is_empty() {
                tracing::debug!(hash = %fact.hash(), "fact already known");
                continue;
            }
            for new_fact in &saved {
                tracing::debug!(hash = %new_fact.hash(), "fact added");
                self.cascade(new_fact)?;
            }
        }
    }

    fn cascade(&mut self, fact: &Fact) -> Result<()> {
        // Watches spawned during this cascade seed from a store that already
        // holds `fact`, so only the ones alive now need visiting.
        let ids: Vec<WatchId> = self.watches.keys().copied().collect();

        for id in ids {
            let Some(record) = self.record(id) else {
                continue;
            };
            let plan = record.plan.clone();
            let anchor = record.anchor.clone();
            if !plan.may_be_affected_by(fact) {
                continue;
            }

            for inverse in &plan.inverses {
                if !self.is_active(id) {
                    break;
                }
                let anchors = self.store.execute_query(fact, &inverse.affected)?;
                if !anchors.contains(&anchor) {
                    continue;
                }
                tracing::trace!(
                    watch = id.0,
                    affected = %inverse.affected,
                    "inverse matched"
                );
                // Inverses through an existential find candidates by way of
                // the guard, not the anchor, so each one is checked against
                // the whole query before the result set changes.
                if let Some(added) = &inverse.added {
                    for result in self.store.execute_query(fact, added)? {
                        if !self.has_result(id, &result)
                            && self.satisfies(&plan, &anchor, &result)?
                        {
                            self.add_result(id, result)?;
                        }
                    }
                }
                if let Some(removed) = &inverse.removed {
                    for result in self.store.execute_query(fact, removed)? {
                        if self.has_result(id, &result)
                            && !self.satisfies(&plan, &anchor, &result)?
                        {
                            self.remove_result(id, &result);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn has_result(&self, id: WatchId, result: &Fact) -> bool {
        self.record(id).is_some_and(|r| r.results.contains(result))
    }

    /// Whether `candidate` is currently a result of the plan's query from
    /// `anchor`.
    fn satisfies(&self, plan: &QueryPlan, anchor: &Fact, candidate: &Fact) -> Result<bool> {
        Ok(self
            .store
            .execute_query(candidate, &plan.reversed)?
            .contains(anchor))
    }

    fn plan_for(&mut self, query: &Query) -> Arc<QueryPlan> {
        self.plans
            .entry(query.to_string())
            .or_insert_with(|| Arc::new(QueryPlan::new(query)))
            .clone()
    }

    fn spawn(
        &mut self,
        anchor: Fact,
        subscription: Arc<Subscription>,
        parent: Option<WatchId>,
    ) -> Result<WatchId> {
        let plan = self.plan_for(&subscription.query);
        let id = WatchId(self.next_id);
        self.next_id += 1;
        self.watches.insert(
            id,
            WatchRecord {
                anchor: anchor.clone(),
                nested: subscription.nested.clone(),
                subscription: subscription.clone(),
                plan,
                results: Vec::new(),
                children: Vec::new(),
                parent,
            },
        );
        self.gauge.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            watch = id.0,
            parent = parent.map(|p| p.0),
            query = %subscription.query,
            "watch started"
        );

        let initial = match self.store.execute_query(&anchor, &subscription.query) {
            Ok(initial) => initial,
            Err(e) => {
                self.stop_tree(id);
                return Err(e);
            }
        };
        for result in initial {
            self.add_result(id, result)?;
        }
        Ok(id)
    }

    fn spawn_child(
        &mut self,
        parent: WatchId,
        result: Fact,
        subscription: Arc<Subscription>,
    ) -> Result<()> {
        let child = self.spawn(result.clone(), subscription, Some(parent))?;
        match self.record_mut(parent) {
            Some(record) => record.children.push((result, child)),
            // The parent went away while the child was seeding.
            None => self.stop_tree(child),
        }
        Ok(())
    }

    fn add_result(&mut self, id: WatchId, result: Fact) -> Result<()> {
        let Some(record) = self.record_mut(id) else {
            return Ok(());
        };
        if record.results.contains(&result) {
            return Ok(());
        }
        record.results.push(result.clone());
        let on_added = record.subscription.on_added.clone();
        let nested = record.nested.clone();

        on_added(&result);
        for subscription in nested {
            if !self.is_active(id) {
                break;
            }
            self.spawn_child(id, result.clone(), subscription)?;
        }
        Ok(())
    }

    fn remove_result(&mut self, id: WatchId, result: &Fact) {
        let Some(record) = self.record_mut(id) else {
            return;
        };
        let Some(position) = record.results.iter().position(|r| r == result) else {
            return;
        };
        record.results.remove(position);
        let (spawned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut record.children)
            .into_iter()
            .partition(|(from, _)| from == result);
        record.children = kept;
        let on_removed = record.subscription.on_removed.clone();

        for (_, child) in spawned {
            self.stop_tree(child);
        }
        if let Some(on_removed) = on_removed {
            on_removed(result);
        }
    }
}

impl<S> Drop for WatchEngine<S> {
    fn drop(&mut self) {
        self.stop_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Fact>>>);

    impl Recorder {
        fn handler(&self) -> impl Fn(&Fact) + Send + Sync + 'static {
            let seen = self.0.clone();
            move |fact: &Fact| seen.lock().unwrap().push(fact.clone())
        }

        fn take(&self) -> Vec<Fact> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn q(s: &str) -> Query {
        s.parse().unwrap()
    }

    fn chores() -> Fact {
        Fact::new().with("name", "Chores")
    }

    fn trash() -> Fact {
        Fact::new()
            .with("list", chores())
            .with("description", "Take out the trash")
    }

    fn completed(task: Fact) -> Fact {
        Fact::new().with("type", "Completed").with("task", task)
    }

    #[test]
    fn initial_results_are_reported_before_watch_returns() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        engine.fact(trash()).unwrap();

        let added = Recorder::default();
        let id = engine
            .watch(chores(), Subscription::new(q("S.list"), added.handler()))
            .unwrap();
        assert_eq!(added.take(), vec![trash()]);
        assert_eq!(engine.results(id).unwrap(), &[trash()]);
    }

    #[test]
    fn open_task_added_then_removed_on_completion() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        let added = Recorder::default();
        let removed = Recorder::default();
        let subscription = Subscription::new(
            q(r#"S.list N(S.task F.type="Completed")"#),
            added.handler(),
        )
        .on_removed(removed.handler());
        let id = engine.watch(chores(), subscription).unwrap();
        assert!(added.take().is_empty());

        engine.fact(trash()).unwrap();
        assert_eq!(added.take(), vec![trash()]);

        engine.fact(trash()).unwrap();
        assert!(added.take().is_empty());

        engine.fact(completed(trash())).unwrap();
        assert_eq!(removed.take(), vec![trash()]);
        assert!(engine.results(id).unwrap().is_empty());
    }

    #[test]
    fn facts_for_other_anchors_are_ignored() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        let added = Recorder::default();
        engine
            .watch(chores(), Subscription::new(q("S.list"), added.handler()))
            .unwrap();

        let errands = Fact::new().with("name", "Errands");
        engine
            .fact(Fact::new().with("list", errands).with("description", "Post"))
            .unwrap();
        assert!(added.take().is_empty());
    }

    #[test]
    fn predecessor_after_successor_reports_the_predecessor() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        let user = Fact::new().with("type", "User").with("publicKey", "X");
        let project = Fact::new().with("type", "Project").with("name", "Apollo");
        let added = Recorder::default();
        engine
            .watch(
                user.clone(),
                Subscription::new(q("S.user P.project"), added.handler()),
            )
            .unwrap();

        engine
            .fact(
                Fact::new()
                    .with("type", "Member")
                    .with("user", user)
                    .with("project", project.clone()),
            )
            .unwrap();
        assert_eq!(added.take(), vec![project]);
    }

    #[test]
    fn nested_watches_follow_parent_results() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        let tasks = Recorder::default();
        let completions = Recorder::default();
        let subscription = Subscription::new(
            q(r#"S.list N(S.task F.type="Archived")"#),
            tasks.handler(),
        )
        .nest(Subscription::new(
            q(r#"S.task F.type="Completed""#),
            completions.handler(),
        ));
        let gauge = engine.gauge();
        let id = engine.watch(chores(), subscription).unwrap();
        assert_eq!(gauge.load(Ordering::Relaxed), 1);

        engine.fact(trash()).unwrap();
        assert_eq!(tasks.take(), vec![trash()]);
        assert_eq!(engine.children(id).len(), 1);
        assert_eq!(gauge.load(Ordering::Relaxed), 2);

        engine.fact(completed(trash())).unwrap();
        assert_eq!(completions.take(), vec![completed(trash())]);

        // Archiving removes the task and stops its child watch.
        let archived = Fact::new().with("type", "Archived").with("task", trash());
        engine.fact(archived).unwrap();
        assert!(engine.children(id).is_empty());
        assert_eq!(gauge.load(Ordering::Relaxed), 1);

        let again = Fact::new()
            .with("type", "Completed")
            .with("task", trash())
            .with("by", "someone");
        engine.fact(again).unwrap();
        assert!(completions.take().is_empty());
    }

    #[test]
    fn nest_attaches_to_existing_results() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        engine.fact(completed(trash())).unwrap();
        let id = engine
            .watch(chores(), Subscription::new(q("S.list"), |_| {}))
            .unwrap();

        let completions = Recorder::default();
        engine
            .nest(
                id,
                Subscription::new(q(r#"S.task F.type="Completed""#), completions.handler()),
            )
            .unwrap();
        assert_eq!(completions.take(), vec![completed(trash())]);
        assert_eq!(engine.children(id).len(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_recursive() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let mut engine = WatchEngine::with_gauge(MemoryStore::new(), gauge.clone());
        engine.fact(trash()).unwrap();
        let added = Recorder::default();
        let subscription = Subscription::new(q("S.list"), added.handler())
            .nest(Subscription::new(q("S.task"), |_| {}));
        let id = engine.watch(chores(), subscription).unwrap();
        let child = engine.children(id)[0];
        assert_eq!(gauge.load(Ordering::Relaxed), 2);

        engine.stop(id);
        assert!(!engine.is_active(id));
        assert!(!engine.is_active(child));
        assert_eq!(gauge.load(Ordering::Relaxed), 0);

        engine.stop(id);
        assert_eq!(gauge.load(Ordering::Relaxed), 0);

        added.take();
        engine
            .fact(Fact::new().with("list", chores()).with("description", "Dishes"))
            .unwrap();
        assert!(added.take().is_empty());
    }

    #[test]
    fn stopping_a_child_detaches_it() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        engine.fact(trash()).unwrap();
        let subscription = Subscription::new(q("S.list"), |_| {})
            .nest(Subscription::new(q("S.task"), |_| {}));
        let id = engine.watch(chores(), subscription).unwrap();
        let child = engine.children(id)[0];

        engine.stop(child);
        assert!(engine.children(id).is_empty());
        assert!(engine.is_active(id));
    }

    #[test]
    fn dropping_the_engine_releases_the_gauge() {
        let gauge = Arc::new(AtomicUsize::new(0));
        {
            let mut engine = WatchEngine::with_gauge(MemoryStore::new(), gauge.clone());
            engine
                .watch(chores(), Subscription::new(q("S.list"), |_| {}))
                .unwrap();
            assert_eq!(gauge.load(Ordering::Relaxed), 1);
        }
        assert_eq!(gauge.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn handlers_publish_through_the_queue() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        let publisher = engine.publisher();
        // Every new task is completed right away.
        let subscription = Subscription::new(q("S.list"), move |task| {
            publisher.publish(completed(task.clone())).unwrap();
        });
        engine.watch(chores(), subscription).unwrap();

        let completions = Recorder::default();
        let id = engine
            .watch(
                trash(),
                Subscription::new(q(r#"S.task F.type="Completed""#), completions.handler()),
            )
            .unwrap();
        engine.fact(trash()).unwrap();
        assert_eq!(completions.take(), vec![completed(trash())]);
        assert_eq!(engine.results(id).unwrap().len(), 1);
    }

    #[test]
    fn unknown_predecessors_cascade_first() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        let user = Fact::new().with("type", "User").with("publicKey", "X");
        let lists = Recorder::default();
        engine
            .watch(user.clone(), Subscription::new(q("S.from"), lists.handler()))
            .unwrap();

        let list = Fact::new().with("name", "Chores").with("from", user);
        let task = Fact::new().with("list", list.clone());
        engine.fact(task).unwrap();
        assert_eq!(lists.take(), vec![list]);
    }

    #[test]
    fn nest_on_stopped_watch_is_not_found() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        let id = engine
            .watch(chores(), Subscription::new(q("S.list"), |_| {}))
            .unwrap();
        engine.stop(id);
        let err = engine
            .nest(id, Subscription::new(q("S.task"), |_| {}))
            .unwrap_err();
        assert!(matches!(err, FactwatchError::NotFound(_)));
    }

    #[test]
    fn stopped_watches_release_their_records() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        engine.fact(trash()).unwrap();
        let mut previous = None;
        for _ in 0..50 {
            let subscription = Subscription::new(q("S.list"), |_| {})
                .nest(Subscription::new(q("S.task"), |_| {}));
            let id = engine.watch(chores(), subscription).unwrap();
            assert!(previous.map_or(true, |p| p < id));
            engine.stop(id);
            previous = Some(id);
        }
        assert!(engine.watches.is_empty());
        assert_eq!(engine.active_count(), 0);

        // Later facts have nothing left to visit, and old ids stay dead.
        engine
            .fact(Fact::new().with("list", chores()).with("description", "Dishes"))
            .unwrap();
        let id = engine
            .watch(chores(), Subscription::new(q("S.list"), |_| {}))
            .unwrap();
        assert!(previous.is_some_and(|p| p < id && !engine.is_active(p)));
        assert_eq!(engine.watches.len(), 1);
    }

    #[test]
    fn guard_on_a_shared_predecessor_only_adds_results_of_the_anchor() {
        let mut engine = WatchEngine::new(MemoryStore::new());
        let a = Fact::new().with("name", "A");
        let b = Fact::new().with("name", "B");
        let owner = Fact::new().with("name", "O");
        let xa = Fact::new().with("a", a.clone()).with("owner", owner.clone());
        let xb = Fact::new().with("a", b).with("owner", owner.clone());
        engine.fact(xa.clone()).unwrap();
        engine.fact(xb).unwrap();

        let added = Recorder::default();
        let query = q("S.a E(P.owner S.flag)");
        let id = engine
            .watch(a.clone(), Subscription::new(query.clone(), added.handler()))
            .unwrap();
        assert!(added.take().is_empty());

        engine.fact(Fact::new().with("flag", owner)).unwrap();
        assert_eq!(added.take(), vec![xa]);
        assert_eq!(
            engine.results(id).unwrap(),
            engine.store().execute_query(&a, &query).unwrap().as_slice()
        );
    }
}
