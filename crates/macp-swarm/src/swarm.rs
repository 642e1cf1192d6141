//! The swarm: address-keyed registry of connected agents.

use crate::agent::{
    AgentFactory, AgentHandle, AgentInfo, AgentSession, DisconnectCallback, LocalAgent,
    RadioAgent,
};
use crate::report::ParallelReport;
use macp_types::{AgentAddress, MacpResult, TaskResult};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the membership event channel.
const EVENT_CAPACITY: usize = 256;

/// Membership change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmEvent {
    /// An agent was registered (link not yet open).
    Added(AgentAddress),
    /// An agent's link opened.
    Connected(AgentAddress),
    /// An agent left the swarm, by request or because its link dropped.
    Removed(AgentAddress),
}

/// One address space: address → handle.
pub(crate) struct AgentSet<H> {
    space: &'static str,
    agents: RwLock<HashMap<AgentAddress, Arc<H>>>,
}

impl<H: AgentSession> AgentSet<H> {
    fn new(space: &'static str) -> Self {
        Self {
            space,
            agents: RwLock::new(HashMap::new()),
        }
    }

    fn insert_if_absent(&self, agent: Arc<H>) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let address = agent.address();
        if agents.contains_key(&address) {
            return false;
        }
        agents.insert(address, agent);
        true
    }

    fn remove(&self, address: AgentAddress) -> Option<Arc<H>> {
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&address)
    }

    fn get(&self, address: AgentAddress) -> Option<Arc<H>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .cloned()
    }

    fn contains(&self, address: AgentAddress) -> bool {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&address)
    }

    fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Frozen view of the membership, ordered by address.
    fn snapshot(&self) -> Vec<Arc<H>> {
        let mut agents: Vec<Arc<H>> = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        agents.sort_by_key(|agent| agent.address());
        agents
    }

    fn single<R>(&self, address: AgentAddress, f: impl FnOnce(&H) -> R) -> Option<R> {
        let agent = self.get(address)?;
        Some(f(&agent))
    }

    fn sequential<A>(
        &self,
        args: Option<&HashMap<AgentAddress, A>>,
        mut f: impl FnMut(&H, Option<&A>),
    ) {
        for agent in self.snapshot() {
            let extra = args.and_then(|args| args.get(&agent.address()));
            f(&agent, extra);
        }
    }

    /// Spawn one task per agent, join them all, and collect failures.
    async fn run_parallel<A, F, Fut>(
        &self,
        f: F,
        mut args: Option<HashMap<AgentAddress, A>>,
    ) -> ParallelReport
    where
        A: Send + 'static,
        F: Fn(Arc<H>, Option<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let agents = self.snapshot();
        let report = ParallelReport::new(agents.len());
        let f = Arc::new(f);

        let mut addresses = Vec::with_capacity(agents.len());
        let mut handles = Vec::with_capacity(agents.len());
        for agent in agents {
            let address = agent.address();
            let extra = args.as_mut().and_then(|args| args.remove(&address));
            let f = Arc::clone(&f);
            let report = report.clone();
            addresses.push(address);
            let space = self.space;
            handles.push(tokio::spawn(async move {
                let task = AssertUnwindSafe(async move { f(agent, extra).await });
                match task.catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => report.record(address, e),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(space, address = %address, "Parallel agent task panicked: {message}");
                        report.record(address, format!("task panicked: {message}").into());
                    }
                }
            }));
        }

        let results = futures::future::join_all(handles).await;
        for (address, result) in addresses.into_iter().zip(results) {
            if let Err(e) = result {
                warn!(space = self.space, address = %address, "Parallel agent task aborted");
                report.record(address, Box::new(e));
            }
        }
        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Registry of all agents known to the base station.
///
/// Holds two address spaces, radio-attached agents and their co-located
/// local processes, and is the only owner of the handles in them. Callers
/// get `Arc` clones that stay valid for the duration of a task even if the
/// agent is removed meanwhile; sends through a removed agent's link fail
/// and are reported like any other task failure.
pub struct Swarm {
    network: AgentSet<RadioAgent>,
    local: AgentSet<LocalAgent>,
    /// Serializes membership changes across both address spaces.
    membership: Mutex<()>,
    events: broadcast::Sender<SwarmEvent>,
}

impl Default for Swarm {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            network: AgentSet::new("network"),
            local: AgentSet::new("local"),
            membership: Mutex::new(()),
            events,
        }
    }
}

impl Swarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to membership changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SwarmEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // -- membership --

    /// Register the agent at `address` using handles built by `factory`.
    ///
    /// Returns `false` without side effects if the address is already taken
    /// or the factory fails. The link is not opened.
    pub fn add_agent(&self, address: AgentAddress, factory: &dyn AgentFactory) -> bool {
        let _guard = self.membership.lock().unwrap_or_else(|e| e.into_inner());
        if self.network.contains(address) {
            debug!(address = %address, "Agent already registered");
            return false;
        }

        let bundle = match factory.construct(address) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to construct agent");
                return false;
            }
        };

        let has_local = bundle.local.is_some();
        self.network.insert_if_absent(Arc::new(bundle.radio));
        if let Some(local) = bundle.local {
            if !self.local.insert_if_absent(Arc::new(local)) {
                warn!(address = %address, "Stale local agent already registered");
            }
        }
        info!(address = %address, local = has_local, "Added agent");
        self.emit(SwarmEvent::Added(address));
        true
    }

    /// Remove both handles for `address` under the membership lock.
    fn take_agent(
        &self,
        address: AgentAddress,
    ) -> (Option<Arc<RadioAgent>>, Option<Arc<LocalAgent>>) {
        let _guard = self.membership.lock().unwrap_or_else(|e| e.into_inner());
        (self.network.remove(address), self.local.remove(address))
    }

    /// Close the agent's link and remove it from both address spaces.
    ///
    /// Idempotent: removing an absent agent does nothing.
    pub async fn remove_agent(&self, address: AgentAddress) {
        let (radio, local) = self.take_agent(address);
        if radio.is_none() && local.is_none() {
            return;
        }
        if let Some(radio) = radio {
            if radio.is_link_open() {
                if let Err(e) = radio.link().close().await {
                    warn!(address = %address, error = %e, "Failed to close link");
                }
            }
        }
        if let Some(local) = local {
            local.shutdown().await;
        }
        info!(address = %address, "Removed agent");
        self.emit(SwarmEvent::Removed(address));
    }

    /// Tear down an agent whose link dropped, unless the handle was already
    /// replaced.
    fn handle_link_lost(&self, address: AgentAddress, agent: &Weak<RadioAgent>, uri: &str) {
        let local = {
            let _guard = self.membership.lock().unwrap_or_else(|e| e.into_inner());
            match (self.network.get(address), agent.upgrade()) {
                (Some(current), Some(agent)) if Arc::ptr_eq(&current, &agent) => {}
                _ => return,
            }
            self.network.remove(address);
            self.local.remove(address)
        };
        if let Some(local) = local {
            local.terminate();
        }
        info!(address = %address, uri, "Link lost, removed agent");
        self.emit(SwarmEvent::Removed(address));
    }

    /// Open the link of the agent at `address`.
    ///
    /// The first time a link is opened, a disconnect observer is registered
    /// that removes the agent once the link drops. Returns `false` if the
    /// agent is unknown or the attempt failed.
    pub async fn open_link(self: &Arc<Self>, address: AgentAddress) -> bool {
        let Some(agent) = self.network.get(address) else {
            warn!(address = %address, "Cannot open link of unknown agent");
            return false;
        };
        if agent.is_link_open() {
            return true;
        }

        if agent.claim_disconnect_observer() {
            let swarm = Arc::downgrade(self);
            let handle = Arc::downgrade(&agent);
            let observer: Arc<DisconnectCallback> = Arc::new(move |uri: &str| {
                if let Some(swarm) = swarm.upgrade() {
                    swarm.handle_link_lost(address, &handle, uri);
                }
            });
            agent.link().add_disconnect_callback(observer);
        }

        match agent.link().open().await {
            Ok(()) => {
                info!(address = %address, uri = agent.uri(), "Link opened");
                self.emit(SwarmEvent::Connected(address));
                true
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to open link");
                false
            }
        }
    }

    /// Close the link of the agent at `address`, if it is open.
    ///
    /// The agent's disconnect observer then removes it from the swarm.
    pub async fn close_link(&self, address: AgentAddress) {
        let Some(agent) = self.network.get(address) else {
            return;
        };
        if !agent.is_link_open() {
            return;
        }
        if let Err(e) = agent.link().close().await {
            warn!(address = %address, error = %e, "Failed to close link");
        } else {
            info!(address = %address, "Link closed");
        }
    }

    // -- introspection --

    pub fn contains(&self, address: AgentAddress) -> bool {
        self.network.contains(address)
    }

    pub fn contains_local(&self, address: AgentAddress) -> bool {
        self.local.contains(address)
    }

    /// Number of radio-attached agents.
    pub fn len(&self) -> usize {
        self.network.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Addresses of the radio-attached agents, ascending.
    pub fn addresses(&self) -> Vec<AgentAddress> {
        self.network
            .snapshot()
            .iter()
            .map(|agent| agent.address())
            .collect()
    }

    pub fn local_addresses(&self) -> Vec<AgentAddress> {
        self.local
            .snapshot()
            .iter()
            .map(|agent| agent.address())
            .collect()
    }

    pub fn is_link_open(&self, address: AgentAddress) -> bool {
        self.single(address, |agent| agent.is_link_open())
            .unwrap_or(false)
    }

    /// Every registered handle across both address spaces.
    pub fn handles(&self) -> Vec<AgentHandle> {
        let mut handles: Vec<AgentHandle> = self
            .network
            .snapshot()
            .into_iter()
            .map(AgentHandle::Radio)
            .collect();
        handles.extend(self.local.snapshot().into_iter().map(AgentHandle::Local));
        handles
    }

    pub fn agent_info(&self) -> Vec<AgentInfo> {
        self.network
            .snapshot()
            .iter()
            .map(|agent| AgentInfo {
                address: agent.address(),
                uri: agent.uri().to_string(),
                link_open: agent.is_link_open(),
                has_local_process: self.local.contains(agent.address()),
                added_at: agent.added_at(),
            })
            .collect()
    }

    // -- network execution primitives --

    /// Run `f` against the radio agent at `address`. `None` if absent.
    pub fn single<R>(&self, address: AgentAddress, f: impl FnOnce(&RadioAgent) -> R) -> Option<R> {
        self.network.single(address, f)
    }

    /// Run `f` against every radio agent, one at a time.
    pub fn sequential(&self, mut f: impl FnMut(&RadioAgent)) {
        self.network.sequential::<()>(None, |agent, _| f(agent));
    }

    /// Like [`sequential`](Self::sequential) with a per-agent argument.
    pub fn sequential_with<A>(
        &self,
        args: &HashMap<AgentAddress, A>,
        f: impl FnMut(&RadioAgent, Option<&A>),
    ) {
        self.network.sequential(Some(args), f);
    }

    /// Run `f` concurrently for every radio agent and wait for all of them.
    /// Failures are logged and swallowed.
    pub async fn parallel<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<RadioAgent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.parallel_with(move |agent, _: Option<()>| f(agent), None)
            .await;
    }

    /// Like [`parallel`](Self::parallel), handing each task the argument
    /// keyed by its agent's address, if any.
    pub async fn parallel_with<A, F, Fut>(&self, f: F, args: Option<HashMap<AgentAddress, A>>)
    where
        A: Send + 'static,
        F: Fn(Arc<RadioAgent>, Option<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.network
            .run_parallel(f, args)
            .await
            .log_swallowed(self.network.space);
    }

    /// Run `f` concurrently for every radio agent; once all tasks finished,
    /// fail with [`MacpError::AggregateTaskFailure`] if any of them failed.
    ///
    /// [`MacpError::AggregateTaskFailure`]: macp_types::MacpError::AggregateTaskFailure
    pub async fn parallel_or_fail<F, Fut>(&self, f: F) -> MacpResult<()>
    where
        F: Fn(Arc<RadioAgent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.parallel_or_fail_with(move |agent, _: Option<()>| f(agent), None)
            .await
    }

    pub async fn parallel_or_fail_with<A, F, Fut>(
        &self,
        f: F,
        args: Option<HashMap<AgentAddress, A>>,
    ) -> MacpResult<()>
    where
        A: Send + 'static,
        F: Fn(Arc<RadioAgent>, Option<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.network.run_parallel(f, args).await.into_result()
    }

    // -- local execution primitives --

    pub fn single_local<R>(
        &self,
        address: AgentAddress,
        f: impl FnOnce(&LocalAgent) -> R,
    ) -> Option<R> {
        self.local.single(address, f)
    }

    pub fn sequential_local(&self, mut f: impl FnMut(&LocalAgent)) {
        self.local.sequential::<()>(None, |agent, _| f(agent));
    }

    pub fn sequential_local_with<A>(
        &self,
        args: &HashMap<AgentAddress, A>,
        f: impl FnMut(&LocalAgent, Option<&A>),
    ) {
        self.local.sequential(Some(args), f);
    }

    pub async fn parallel_local<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<LocalAgent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.parallel_local_with(move |agent, _: Option<()>| f(agent), None)
            .await;
    }

    pub async fn parallel_local_with<A, F, Fut>(
        &self,
        f: F,
        args: Option<HashMap<AgentAddress, A>>,
    ) where
        A: Send + 'static,
        F: Fn(Arc<LocalAgent>, Option<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.local
            .run_parallel(f, args)
            .await
            .log_swallowed(self.local.space);
    }

    pub async fn parallel_local_or_fail<F, Fut>(&self, f: F) -> MacpResult<()>
    where
        F: Fn(Arc<LocalAgent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.parallel_local_or_fail_with(move |agent, _: Option<()>| f(agent), None)
            .await
    }

    pub async fn parallel_local_or_fail_with<A, F, Fut>(
        &self,
        f: F,
        args: Option<HashMap<AgentAddress, A>>,
    ) -> MacpResult<()>
    where
        A: Send + 'static,
        F: Fn(Arc<LocalAgent>, Option<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.local.run_parallel(f, args).await.into_result()
    }

    /// Remove every agent, closing links and stopping local processes.
    pub async fn shutdown(&self) {
        let mut addresses = self.addresses();
        for address in self.local_addresses() {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        for address in addresses {
            self.remove_agent(address).await;
        }
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("network", &self.addresses())
            .field("local", &self.local_addresses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedFactory;
    use macp_types::config::IpcConfig;
    use macp_types::{MacpError, TaskError};
    use std::error::Error as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn addr(raw: u8) -> AgentAddress {
        AgentAddress::agent(raw).unwrap()
    }

    fn fast_ipc() -> IpcConfig {
        IpcConfig {
            poll_interval_ms: 10,
            ..IpcConfig::default()
        }
    }

    async fn connected_swarm(factory: &SimulatedFactory, raws: &[u8]) -> Arc<Swarm> {
        let swarm = Swarm::new();
        for raw in raws {
            assert!(swarm.add_agent(addr(*raw), factory));
            assert!(swarm.open_link(addr(*raw)).await);
        }
        swarm
    }

    #[tokio::test]
    async fn test_add_agent_rejects_duplicate() {
        let factory = SimulatedFactory::new();
        let swarm = Swarm::new();
        assert!(swarm.add_agent(addr(1), &factory));
        assert!(!swarm.add_agent(addr(1), &factory));
        assert_eq!(swarm.len(), 1);
        assert!(!swarm.is_link_open(addr(1)));
    }

    #[tokio::test]
    async fn test_add_agent_with_local_process() {
        let factory = SimulatedFactory::with_local_processes(&fast_ipc());
        let swarm = Swarm::new();
        assert!(swarm.add_agent(addr(4), &factory));
        assert!(swarm.contains_local(addr(4)));
        assert_eq!(swarm.local_addresses(), vec![addr(4)]);

        swarm.remove_agent(addr(4)).await;
        assert!(!swarm.contains(addr(4)));
        assert!(!swarm.contains_local(addr(4)));
    }

    #[tokio::test]
    async fn test_open_link_failure_keeps_agent() {
        let factory = SimulatedFactory::new();
        let swarm = Swarm::new();
        swarm.add_agent(addr(2), &factory);
        factory.link(addr(2)).unwrap().set_fail_open(true);

        assert!(!swarm.open_link(addr(2)).await);
        assert!(swarm.contains(addr(2)));
        assert!(!swarm.open_link(addr(9)).await);
    }

    #[tokio::test]
    async fn test_link_loss_removes_agent() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[1, 2]).await;
        let mut events = swarm.subscribe();

        factory.link(addr(1)).unwrap().drop_connection();

        assert_eq!(swarm.addresses(), vec![addr(2)]);
        assert_eq!(events.recv().await.unwrap(), SwarmEvent::Removed(addr(1)));
    }

    #[tokio::test]
    async fn test_stale_disconnect_does_not_remove_replacement() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[3]).await;
        let old_link = factory.link(addr(3)).unwrap();

        swarm.remove_agent(addr(3)).await;
        assert!(swarm.add_agent(addr(3), &factory));
        assert!(swarm.open_link(addr(3)).await);

        // Old link firing again must not evict the new handle.
        old_link.drop_connection();
        assert!(swarm.contains(addr(3)));
    }

    #[tokio::test]
    async fn test_close_link_removes_agent_via_observer() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[5]).await;
        swarm.close_link(addr(5)).await;
        assert!(!swarm.contains(addr(5)));
    }

    #[tokio::test]
    async fn test_remove_agent_idempotent() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[6]).await;
        swarm.remove_agent(addr(6)).await;
        swarm.remove_agent(addr(6)).await;
        assert!(swarm.is_empty());
    }

    #[tokio::test]
    async fn test_single_absent_returns_none() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[1]).await;
        assert_eq!(swarm.single(addr(1), |a| a.address()), Some(addr(1)));
        assert_eq!(swarm.single(addr(2), |a| a.address()), None);
    }

    #[tokio::test]
    async fn test_sequential_visits_in_address_order() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[3, 1, 2]).await;
        let mut seen = Vec::new();
        swarm.sequential(|agent| seen.push(agent.address().value()));
        assert_eq!(seen, vec![1, 2, 3]);

        let args = HashMap::from([(addr(2), "two")]);
        let mut with = Vec::new();
        swarm.sequential_with(&args, |agent, arg| with.push((agent.address().value(), arg.copied())));
        assert_eq!(with, vec![(1, None), (2, Some("two")), (3, None)]);
    }

    #[tokio::test]
    async fn test_parallel_swallows_failures() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[1, 2, 3]).await;
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        swarm
            .parallel(move |agent| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if agent.address().value() == 2 {
                        return Err(TaskError::from("agent 2 failed"));
                    }
                    Ok::<(), TaskError>(())
                }
            })
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_parallel_or_fail_waits_for_all() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[1, 2, 3, 4]).await;
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let err = swarm
            .parallel_or_fail(move |agent| {
                let counter = counter.clone();
                async move {
                    if agent.address().value() == 1 {
                        return Err(TaskError::from("agent 1 failed"));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), TaskError>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        match &err {
            MacpError::AggregateTaskFailure { failed, total, .. } => {
                assert_eq!((*failed, *total), (1, 4));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.source().unwrap().to_string(), "agent 1 failed");
    }

    #[tokio::test]
    async fn test_parallel_with_hands_out_arguments() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[1, 2]).await;
        let args = HashMap::from([(addr(1), vec![0xAAu8])]);

        swarm
            .parallel_or_fail_with(
                |agent, payload: Option<Vec<u8>>| async move {
                    if let Some(payload) = payload {
                        agent.send(0x09, 0, payload)?;
                    }
                    Ok::<(), TaskError>(())
                },
                Some(args),
            )
            .await
            .unwrap();

        assert_eq!(factory.link(addr(1)).unwrap().sent_packets().len(), 1);
        assert!(factory.link(addr(2)).unwrap().sent_packets().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_records_panics() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[1]).await;
        let result = swarm
            .parallel_or_fail(|agent| async move {
                if agent.address().value() == 1 {
                    panic!("task blew up");
                }
                Ok::<(), TaskError>(())
            })
            .await;
        match result {
            Err(err @ MacpError::AggregateTaskFailure { failed: 1, .. }) => {
                assert_eq!(err.source().unwrap().to_string(), "task panicked: task blew up");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_recorded_in_order_of_occurrence() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[1, 2]).await;
        let err = swarm
            .parallel_or_fail(|agent| async move {
                if agent.address().value() == 1 {
                    panic!("agent 1 panicked first");
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<(), TaskError>(TaskError::from("agent 2 failed later"))
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.source().unwrap().to_string(),
            "task panicked: agent 1 panicked first"
        );
    }

    #[tokio::test]
    async fn test_parallel_on_empty_swarm_is_ok() {
        let swarm = Swarm::new();
        swarm
            .parallel_or_fail(|_agent| async move { Ok::<(), TaskError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_removal_during_parallel_keeps_handle_alive() {
        let factory = SimulatedFactory::new();
        let swarm = connected_swarm(&factory, &[1, 2]).await;

        let remover = swarm.clone();
        let result = swarm
            .parallel_or_fail(move |agent| {
                let remover = remover.clone();
                async move {
                    if agent.address().value() == 1 {
                        remover.remove_agent(agent.address()).await;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    agent.send(0x09, 0, vec![0x01])?;
                    Ok::<(), TaskError>(())
                }
            })
            .await;

        // The removed agent's link is closed, so only its send fails.
        match result {
            Err(MacpError::AggregateTaskFailure { failed, total, .. }) => {
                assert_eq!((failed, total), (1, 2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(swarm.addresses(), vec![addr(2)]);
    }

    #[tokio::test]
    async fn test_local_primitives() {
        let factory = SimulatedFactory::with_local_processes(&fast_ipc());
        let swarm = connected_swarm(&factory, &[1, 2]).await;

        let mut seen = Vec::new();
        swarm.sequential_local(|agent| seen.push(agent.address().value()));
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(swarm.single_local(addr(2), |a| a.address()), Some(addr(2)));

        swarm
            .parallel_local_or_fail(|agent| async move {
                agent.send_packet(vec![0x01, 0x20, 0x00])?;
                Ok::<(), TaskError>(())
            })
            .await
            .unwrap();
        swarm.shutdown().await;
        assert!(swarm.is_empty());
        assert_eq!(swarm.local_len(), 0);
    }

    #[tokio::test]
    async fn test_agent_info_and_events() {
        let factory = SimulatedFactory::new();
        let swarm = Swarm::new();
        let mut events = swarm.subscribe();
        swarm.add_agent(addr(7), &factory);
        swarm.open_link(addr(7)).await;

        assert_eq!(events.recv().await.unwrap(), SwarmEvent::Added(addr(7)));
        assert_eq!(events.recv().await.unwrap(), SwarmEvent::Connected(addr(7)));

        let info = swarm.agent_info();
        assert_eq!(info.len(), 1);
        assert!(info[0].link_open);
        assert!(!info[0].has_local_process);
        assert_eq!(swarm.handles().len(), 1);
    }
}
