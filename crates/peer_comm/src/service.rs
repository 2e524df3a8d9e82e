//! CommService — the peer-identity-aware session layer.
//!
//! [`CommService`] owns at most one [`TransportNode`]. The node is built
//! lazily by the first caller that needs it (the background supervisor
//! started with [`CommService::start`] or any session operation):
//!
//! - no bootstrap label configured: the node is built in [`NodeMode::Anchor`]
//! - otherwise the label is resolved through the directory to a dialable
//!   `/.../p2p/<pk-id>` address and the node is built in [`NodeMode::Joining`]
//!
//! Session operations make one synchronous initialization attempt and fail
//! with [`CommError::NotInitialized`] if it does not succeed. Only the
//! supervisor retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::peer_address;
use crate::config::{
    BOOTSTRAP_NODE_KEY, ConfigSource, DEFAULT_RETRY_INTERVAL, LISTEN_ADDRESS_KEY,
    RETRY_INTERVAL_KEY,
};
use crate::directory::EndpointResolver;
use crate::driver::{Metrics, NodeFactory, NodeMode, PrivateKeySource, Shutdown, TransportNode};
use crate::error::CommError;
use crate::identity::{Identity, PortName, PublicKeyId};
use crate::message::Message;
use crate::node::WsNodeFactory;
use crate::session::SessionHandle;

/// The communication service.
pub struct CommService {
    keys: Arc<dyn PrivateKeySource>,
    resolver: Arc<dyn EndpointResolver>,
    config: Arc<dyn ConfigSource>,
    default_identity: Identity,
    metrics: Arc<Metrics>,
    factory: Arc<dyn NodeFactory>,
    retry_interval: Duration,
    /// The transport node, once built. Never replaced afterwards.
    node: RwLock<Option<Arc<dyn TransportNode>>>,
    shutdown: Shutdown,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CommService {
    /// Create a service backed by WebSocket transport nodes.
    ///
    /// The retry interval is read from `fsc.p2p.retryInterval` (seconds) and
    /// defaults to ten seconds.
    pub fn new(
        keys: Arc<dyn PrivateKeySource>,
        resolver: Arc<dyn EndpointResolver>,
        config: Arc<dyn ConfigSource>,
        default_identity: Identity,
        metrics: Arc<Metrics>,
    ) -> Self {
        let retry_interval = config
            .get_string(RETRY_INTERVAL_KEY)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_INTERVAL);

        Self {
            keys,
            resolver,
            config,
            default_identity,
            metrics,
            factory: Arc::new(WsNodeFactory),
            retry_interval,
            node: RwLock::new(None),
            shutdown: Shutdown::new(),
            supervisor: parking_lot::Mutex::new(None),
        }
    }

    /// Use a different transport node implementation.
    pub fn with_factory(mut self, factory: Arc<dyn NodeFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Override the pause between failed initialization attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn default_identity(&self) -> &Identity {
        &self.default_identity
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Whether the transport node has been built.
    pub async fn is_initialized(&self) -> bool {
        self.node.read().await.is_some()
    }

    /// Mode of the transport node, if it has been built.
    pub async fn mode(&self) -> Option<NodeMode> {
        self.node.read().await.as_ref().map(|node| node.mode())
    }

    /// Start the background supervisor. Returns immediately.
    ///
    /// The supervisor retries initialization every retry interval until it
    /// succeeds, then drives the node's run loop until [`shutdown`](Self::shutdown).
    /// Calling `start` while a supervisor is alive is a no-op. Must be called
    /// from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.supervisor.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Communication service already started");
            return;
        }

        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.signal();
        *slot = Some(tokio::spawn(async move {
            let node = loop {
                if shutdown.is_cancelled() {
                    return;
                }
                info!("Starting communication service...");
                match service.ensure_initialized().await {
                    Ok(node) => break node,
                    Err(e) => {
                        error!(
                            "Failed to initialize communication service [{e}], retrying in {:?}",
                            service.retry_interval
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(service.retry_interval) => {}
                            _ = shutdown.cancelled() => {
                                info!("Communication service shut down before initialization");
                                return;
                            }
                        }
                    }
                }
            };

            if let Err(e) = node.run(shutdown).await {
                error!("Transport node terminated: {e}");
            }
        }));
    }

    /// Stop the transport node.
    ///
    /// Makes one initialization attempt; if that fails there is nothing to
    /// stop and a warning is logged.
    pub async fn stop(&self) {
        match self.ensure_initialized().await {
            Ok(node) => node.stop().await,
            Err(e) => warn!("Communication service not ready [{e}], cannot stop"),
        }
    }

    /// Cancel the supervisor and the node run loop, wait for the supervisor
    /// to exit, and stop the node if one was built.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Communication supervisor ended abnormally: {e}");
            }
        }

        let node = self.node.read().await.clone();
        if let Some(node) = node {
            node.stop().await;
        }
    }

    /// Open a session with a freshly allocated id.
    pub async fn new_session(
        &self,
        caller: &Identity,
        context_id: &str,
        endpoint: Option<&str>,
        target: &PublicKeyId,
    ) -> Result<SessionHandle, CommError> {
        let node = self.ready().await?;
        node.new_session(caller, context_id, endpoint, target).await
    }

    /// Open (or join) the session with the given id.
    pub async fn new_session_with_id(
        &self,
        session_id: &str,
        context_id: &str,
        endpoint: Option<&str>,
        target: &PublicKeyId,
        caller: &Identity,
        initial: Option<Message>,
    ) -> Result<SessionHandle, CommError> {
        let node = self.ready().await?;
        node.new_session_with_id(session_id, context_id, endpoint, target, caller, initial)
            .await
    }

    /// The node's control session.
    pub async fn master_session(&self) -> Result<SessionHandle, CommError> {
        let node = self.ready().await?;
        node.master_session().await
    }

    /// Drop the session with exactly this id. Never fails.
    pub async fn delete_sessions(&self, session_id: &str) {
        match self.ensure_initialized().await {
            Ok(node) => node.delete_sessions(session_id).await,
            Err(e) => warn!(
                "Communication service not ready [{e}], cannot delete session {session_id}"
            ),
        }
    }

    /// Currently reachable addresses of `identity`.
    ///
    /// Not tracked yet: always empty.
    pub async fn addresses(&self, identity: &Identity) -> Result<Vec<String>, CommError> {
        debug!("Address lookup for {identity} is not supported, returning none");
        Ok(Vec::new())
    }

    async fn ready(&self) -> Result<Arc<dyn TransportNode>, CommError> {
        self.ensure_initialized()
            .await
            .map_err(CommError::not_initialized)
    }

    /// Return the transport node, building it if this is the first success.
    async fn ensure_initialized(&self) -> Result<Arc<dyn TransportNode>, CommError> {
        {
            let node = self.node.read().await;
            if let Some(node) = node.as_ref() {
                return Ok(Arc::clone(node));
            }
        }

        let mut slot = self.node.write().await;
        if let Some(node) = slot.as_ref() {
            return Ok(Arc::clone(node));
        }

        let node = self.build_node().await?;
        *slot = Some(Arc::clone(&node));
        Ok(node)
    }

    async fn build_node(&self) -> Result<Arc<dyn TransportNode>, CommError> {
        let listen = self
            .config
            .get_string(LISTEN_ADDRESS_KEY)
            .ok_or_else(|| CommError::ConfigurationMissing(LISTEN_ADDRESS_KEY.to_string()))?;

        match self.config.get_string(BOOTSTRAP_NODE_KEY) {
            None => {
                info!("New p2p bootstrap node [{listen}]");
                self.factory
                    .anchor(&listen, Arc::clone(&self.keys), Arc::clone(&self.metrics))
                    .await
                    .map_err(|e| {
                        construction_error(
                            format!("failed to initialize bootstrap p2p node [{listen}]"),
                            e,
                        )
                    })
            }
            Some(label) => {
                let bootstrap = self.bootstrap_address(&label)?;
                info!("New p2p node [{listen}, {bootstrap}]");
                self.factory
                    .joining(
                        &listen,
                        &bootstrap,
                        Arc::clone(&self.keys),
                        Arc::clone(&self.metrics),
                    )
                    .await
                    .map_err(|e| {
                        construction_error(
                            format!("failed to initialize p2p node [{listen}, {bootstrap}]"),
                            e,
                        )
                    })
            }
        }
    }

    /// Resolve a bootstrap label to `<p2p endpoint>/p2p/<pk-id>`.
    fn bootstrap_address(&self, label: &str) -> Result<String, CommError> {
        let identity = self.resolver.identity_for_label(label).map_err(|e| {
            directory_error(
                format!("failed to get p2p bootstrap node's resolver entry [{label}]"),
                e,
            )
        })?;
        let resolved = self.resolver.resolve(&identity).map_err(|e| {
            directory_error(
                format!("failed to resolve bootstrap node id [{label}:{identity}]"),
                e,
            )
        })?;
        let endpoint = resolved.endpoint(PortName::P2P)?;
        peer_address(endpoint, &resolved.pk_id)
    }
}

fn directory_error(context: String, err: CommError) -> CommError {
    match err {
        CommError::DirectoryResolution(msg) => {
            CommError::DirectoryResolution(format!("{context}: {msg}"))
        }
        other => CommError::DirectoryResolution(format!("{context}: {other}")),
    }
}

fn construction_error(context: String, err: CommError) -> CommError {
    match err {
        CommError::TransportConstruction(msg) => {
            CommError::TransportConstruction(format!("{context}: {msg}"))
        }
        other => CommError::TransportConstruction(format!("{context}: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::directory::{ResolvedEndpoint, StaticResolver};
    use crate::driver::{ShutdownSignal, StaticKey};
    use crate::node::WsNode;
    use crate::session::{Session, SessionInfo};

    const WAIT: Duration = Duration::from_secs(5);

    // -- fakes --------------------------------------------------------------

    struct FakeSession(SessionInfo);

    #[async_trait]
    impl Session for FakeSession {
        fn info(&self) -> SessionInfo {
            self.0.clone()
        }
        async fn send(&self, _payload: Vec<u8>) -> Result<(), CommError> {
            Ok(())
        }
        async fn send_error(&self, _payload: Vec<u8>) -> Result<(), CommError> {
            Ok(())
        }
        async fn receive(&self) -> Option<Message> {
            None
        }
        async fn close(&self) {}
    }

    struct FakeNode {
        mode: NodeMode,
        runs: AtomicUsize,
        run_exits: AtomicUsize,
        stops: AtomicUsize,
        deleted: parking_lot::Mutex<Vec<String>>,
    }

    impl FakeNode {
        fn new(mode: NodeMode) -> Self {
            Self {
                mode,
                runs: AtomicUsize::new(0),
                run_exits: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                deleted: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    fn fake_info(id: &str, context_id: &str, caller: &Identity, target: &PublicKeyId) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            context_id: context_id.to_string(),
            endpoint: None,
            caller: caller.clone(),
            target_pk_id: target.clone(),
        }
    }

    #[async_trait]
    impl TransportNode for FakeNode {
        fn mode(&self) -> NodeMode {
            self.mode
        }
        async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), CommError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            shutdown.cancelled().await;
            self.run_exits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        async fn new_session(
            &self,
            caller: &Identity,
            context_id: &str,
            _endpoint: Option<&str>,
            target: &PublicKeyId,
        ) -> Result<SessionHandle, CommError> {
            Ok(Arc::new(FakeSession(fake_info("fresh", context_id, caller, target))))
        }
        async fn new_session_with_id(
            &self,
            session_id: &str,
            context_id: &str,
            _endpoint: Option<&str>,
            target: &PublicKeyId,
            caller: &Identity,
            _initial: Option<Message>,
        ) -> Result<SessionHandle, CommError> {
            Ok(Arc::new(FakeSession(fake_info(session_id, context_id, caller, target))))
        }
        async fn master_session(&self) -> Result<SessionHandle, CommError> {
            Ok(Arc::new(FakeSession(fake_info(
                crate::session::MASTER_SESSION_ID,
                "",
                &Identity::default(),
                &PublicKeyId::default(),
            ))))
        }
        async fn delete_sessions(&self, session_id: &str) {
            self.deleted.lock().push(session_id.to_string());
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        built: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
        bootstrap: parking_lot::Mutex<Option<String>>,
        nodes: parking_lot::Mutex<Vec<Arc<FakeNode>>>,
    }

    impl FakeFactory {
        fn build(&self, mode: NodeMode) -> Result<Arc<dyn TransportNode>, CommError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CommError::TransportConstruction("rejected".to_string()));
            }
            self.built.fetch_add(1, Ordering::SeqCst);
            let node = Arc::new(FakeNode::new(mode));
            self.nodes.lock().push(Arc::clone(&node));
            Ok(node)
        }

        fn built(&self) -> usize {
            self.built.load(Ordering::SeqCst)
        }

        fn node(&self) -> Arc<FakeNode> {
            Arc::clone(&self.nodes.lock()[0])
        }
    }

    #[async_trait]
    impl NodeFactory for FakeFactory {
        async fn anchor(
            &self,
            _listen_address: &str,
            _keys: Arc<dyn PrivateKeySource>,
            _metrics: Arc<Metrics>,
        ) -> Result<Arc<dyn TransportNode>, CommError> {
            tokio::time::sleep(self.delay).await;
            self.build(NodeMode::Anchor)
        }
        async fn joining(
            &self,
            _listen_address: &str,
            bootstrap: &str,
            _keys: Arc<dyn PrivateKeySource>,
            _metrics: Arc<Metrics>,
        ) -> Result<Arc<dyn TransportNode>, CommError> {
            tokio::time::sleep(self.delay).await;
            *self.bootstrap.lock() = Some(bootstrap.to_string());
            self.build(NodeMode::Joining)
        }
    }

    // -- helpers ------------------------------------------------------------

    fn config(entries: &[(&str, &str)]) -> Arc<dyn ConfigSource> {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(map)
    }

    fn peer_entry(name: &str, p2p: Option<&str>, pk: &str) -> ResolvedEndpoint {
        let mut endpoints = HashMap::new();
        endpoints.insert(PortName::View, "10.0.0.5:8080".to_string());
        if let Some(addr) = p2p {
            endpoints.insert(PortName::P2P, addr.to_string());
        }
        ResolvedEndpoint {
            identity: Identity::from(name),
            endpoints,
            pk_id: PublicKeyId::from(pk),
        }
    }

    fn service(
        config: Arc<dyn ConfigSource>,
        resolver: Arc<StaticResolver>,
        factory: Arc<FakeFactory>,
    ) -> Arc<CommService> {
        Arc::new(
            CommService::new(
                Arc::new(StaticKey::new(b"secret".to_vec())),
                resolver,
                config,
                Identity::from("me"),
                Arc::new(Metrics::new()),
            )
            .with_factory(factory)
            .with_retry_interval(Duration::from_millis(20)),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // -- initialization -----------------------------------------------------

    #[tokio::test]
    async fn test_anchor_mode_without_bootstrap_label() {
        let factory = Arc::new(FakeFactory::default());
        let svc = service(
            config(&[
                (LISTEN_ADDRESS_KEY, "127.0.0.1:9000"),
                ("fsc.p2p.somethingElse", "peerA"),
            ]),
            Arc::new(StaticResolver::new()),
            factory.clone(),
        );

        assert!(!svc.is_initialized().await);
        svc.master_session().await.unwrap();
        assert_eq!(svc.mode().await, Some(NodeMode::Anchor));
        assert_eq!(factory.built(), 1);
    }

    #[tokio::test]
    async fn test_joining_mode_resolves_bootstrap_address() {
        let factory = Arc::new(FakeFactory::default());
        let resolver = Arc::new(StaticResolver::new());
        resolver.bind("peerA", peer_entry("peerA-id", Some("10.0.0.5:9000"), "QmPeerA"));

        let svc = service(
            config(&[
                (LISTEN_ADDRESS_KEY, "127.0.0.1:9001"),
                (BOOTSTRAP_NODE_KEY, "peerA"),
            ]),
            resolver,
            factory.clone(),
        );

        let session = svc
            .new_session(&Identity::from("me"), "ctx", None, &PublicKeyId::from("x"))
            .await
            .unwrap();
        assert_eq!(session.info().context_id, "ctx");
        assert_eq!(svc.mode().await, Some(NodeMode::Joining));
        assert_eq!(
            factory.bootstrap.lock().as_deref(),
            Some("/ip4/10.0.0.5/tcp/9000/p2p/QmPeerA")
        );
    }

    #[tokio::test]
    async fn test_bootstrap_not_resolved_again_after_success() {
        let factory = Arc::new(FakeFactory::default());
        let resolver = Arc::new(StaticResolver::new());
        resolver.bind("peerA", peer_entry("peerA-id", Some("10.0.0.5:9000"), "QmPeerA"));
        let svc = service(
            config(&[
                (LISTEN_ADDRESS_KEY, "127.0.0.1:9001"),
                (BOOTSTRAP_NODE_KEY, "peerA"),
            ]),
            resolver.clone(),
            factory.clone(),
        );
        svc.master_session().await.unwrap();
        assert_eq!(factory.built(), 1);

        assert!(resolver.unbind("peerA").is_some());
        assert!(resolver.is_empty());

        svc.master_session().await.unwrap();
        svc.new_session(&Identity::from("me"), "ctx", None, &PublicKeyId::from("x"))
            .await
            .unwrap();
        svc.delete_sessions("missing").await;
        assert_eq!(factory.built(), 1);
        assert_eq!(svc.mode().await, Some(NodeMode::Joining));
    }

    #[tokio::test]
    async fn test_unresolvable_label_fails_until_directory_fixed() {
        let factory = Arc::new(FakeFactory::default());
        let resolver = Arc::new(StaticResolver::new());
        let svc = service(
            config(&[
                (LISTEN_ADDRESS_KEY, "127.0.0.1:9002"),
                (BOOTSTRAP_NODE_KEY, "peerA"),
            ]),
            resolver.clone(),
            factory.clone(),
        );

        for _ in 0..3 {
            let err = match svc.master_session().await {
                Err(e) => e,
                Ok(_) => panic!("master session without a node"),
            };
            assert!(matches!(err, CommError::NotInitialized { .. }));
            assert!(matches!(err.root(), CommError::DirectoryResolution(_)));
        }
        let err = svc
            .new_session_with_id("s", "ctx", None, &PublicKeyId::from("x"), &Identity::from("me"), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err.root(), CommError::DirectoryResolution(_)));
        assert_eq!(factory.built(), 0);
        assert!(!svc.is_initialized().await);

        resolver.bind("peerA", peer_entry("peerA-id", Some("10.0.0.5:9000"), "QmPeerA"));
        svc.master_session().await.unwrap();
        assert_eq!(factory.built(), 1);
    }

    #[tokio::test]
    async fn test_identity_without_directory_entry() {
        struct LabelOnly;
        impl EndpointResolver for LabelOnly {
            fn identity_for_label(&self, _label: &str) -> Result<Identity, CommError> {
                Ok(Identity::from("orphan"))
            }
            fn resolve(&self, identity: &Identity) -> Result<crate::directory::ResolvedEndpoint, CommError> {
                Err(CommError::DirectoryResolution(format!("no entry for {identity}")))
            }
        }

        let factory = Arc::new(FakeFactory::default());
        let svc = CommService::new(
            Arc::new(StaticKey::new(b"k".to_vec())),
            Arc::new(LabelOnly),
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1"), (BOOTSTRAP_NODE_KEY, "peerA")]),
            Identity::from("me"),
            Arc::new(Metrics::new()),
        )
        .with_factory(factory.clone());

        let err = svc.master_session().await.err().unwrap();
        match err.root() {
            CommError::DirectoryResolution(msg) => assert!(msg.contains("orphan")),
            other => panic!("Expected DirectoryResolution, got {other:?}"),
        }
        assert_eq!(factory.built(), 0);
    }

    #[tokio::test]
    async fn test_missing_p2p_role() {
        let factory = Arc::new(FakeFactory::default());
        let resolver = Arc::new(StaticResolver::new());
        resolver.bind("peerA", peer_entry("peerA-id", None, "QmPeerA"));
        let svc = service(
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1"), (BOOTSTRAP_NODE_KEY, "peerA")]),
            resolver,
            factory.clone(),
        );

        let err = svc.master_session().await.err().unwrap();
        assert!(matches!(err.root(), CommError::EndpointRoleMissing { .. }));
        assert_eq!(factory.built(), 0);
    }

    #[tokio::test]
    async fn test_missing_listen_address() {
        let factory = Arc::new(FakeFactory::default());
        let svc = service(config(&[]), Arc::new(StaticResolver::new()), factory.clone());

        let err = svc.master_session().await.err().unwrap();
        match err.root() {
            CommError::ConfigurationMissing(key) => assert_eq!(key, LISTEN_ADDRESS_KEY),
            other => panic!("Expected ConfigurationMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_construction_failure_is_retryable() {
        let factory = Arc::new(FakeFactory::default());
        factory.fail.store(true, Ordering::SeqCst);
        let svc = service(
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1")]),
            Arc::new(StaticResolver::new()),
            factory.clone(),
        );

        let err = svc.master_session().await.err().unwrap();
        assert!(matches!(err.root(), CommError::TransportConstruction(_)));
        assert!(!svc.is_initialized().await);

        factory.fail.store(false, Ordering::SeqCst);
        svc.master_session().await.unwrap();
        assert_eq!(factory.built(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_build_one_node() {
        let factory = Arc::new(FakeFactory {
            delay: Duration::from_millis(50),
            ..FakeFactory::default()
        });
        let svc = service(
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1")]),
            Arc::new(StaticResolver::new()),
            factory.clone(),
        );
        svc.start();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let svc = Arc::clone(&svc);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    svc.master_session().await.map(|_| ())
                } else {
                    svc.new_session(&Identity::from("me"), "ctx", None, &PublicKeyId::from("p"))
                        .await
                        .map(|_| ())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(factory.built(), 1);
        svc.shutdown().await;
    }

    // -- stop / delete / addresses -----------------------------------------

    #[tokio::test]
    async fn test_stop_before_initialization_is_noop() {
        let factory = Arc::new(FakeFactory::default());
        let svc = service(
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1"), (BOOTSTRAP_NODE_KEY, "ghost")]),
            Arc::new(StaticResolver::new()),
            factory.clone(),
        );

        svc.stop().await;
        svc.delete_sessions("anything").await;
        assert_eq!(factory.built(), 0);
        assert!(factory.nodes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_delete_forward_to_node() {
        let factory = Arc::new(FakeFactory::default());
        let svc = service(
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1")]),
            Arc::new(StaticResolver::new()),
            factory.clone(),
        );

        svc.delete_sessions("s-1").await;
        svc.delete_sessions("unknown").await;
        svc.stop().await;

        let node = factory.node();
        assert_eq!(*node.deleted.lock(), vec!["s-1".to_string(), "unknown".to_string()]);
        assert_eq!(node.stops.load(Ordering::SeqCst), 1);
        assert_eq!(factory.built(), 1);
    }

    #[tokio::test]
    async fn test_addresses_is_empty() {
        let svc = service(
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1")]),
            Arc::new(StaticResolver::new()),
            Arc::new(FakeFactory::default()),
        );
        assert!(svc.addresses(&Identity::from("anyone")).await.unwrap().is_empty());
    }

    #[test]
    fn test_retry_interval_from_config() {
        let svc = CommService::new(
            Arc::new(StaticKey::new(b"k".to_vec())),
            Arc::new(StaticResolver::new()),
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1"), (RETRY_INTERVAL_KEY, "3")]),
            Identity::from("me"),
            Arc::new(Metrics::new()),
        );
        assert_eq!(svc.retry_interval(), Duration::from_secs(3));
        assert_eq!(svc.default_identity(), &Identity::from("me"));

        let fallback = CommService::new(
            Arc::new(StaticKey::new(b"k".to_vec())),
            Arc::new(StaticResolver::new()),
            config(&[(RETRY_INTERVAL_KEY, "soon")]),
            Identity::from("me"),
            Arc::new(Metrics::new()),
        );
        assert_eq!(fallback.retry_interval(), DEFAULT_RETRY_INTERVAL);
    }

    // -- supervisor ---------------------------------------------------------

    #[tokio::test]
    async fn test_supervisor_retries_then_runs_node() {
        let factory = Arc::new(FakeFactory::default());
        let resolver = Arc::new(StaticResolver::new());
        let svc = service(
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1"), (BOOTSTRAP_NODE_KEY, "peerA")]),
            resolver.clone(),
            factory.clone(),
        );

        svc.start();
        svc.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(factory.built(), 0);

        resolver.bind("peerA", peer_entry("peerA-id", Some("10.0.0.5:9000"), "QmPeerA"));
        wait_until(|| factory.built() == 1).await;
        let node = factory.node();
        wait_until(|| node.runs.load(Ordering::SeqCst) == 1).await;

        svc.shutdown().await;
        assert_eq!(node.run_exits.load(Ordering::SeqCst), 1);
        assert_eq!(node.stops.load(Ordering::SeqCst), 1);
        assert_eq!(factory.built(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_retry_loop() {
        let factory = Arc::new(FakeFactory::default());
        let svc = Arc::new(
            CommService::new(
                Arc::new(StaticKey::new(b"k".to_vec())),
                Arc::new(StaticResolver::new()),
                config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:1"), (BOOTSTRAP_NODE_KEY, "ghost")]),
                Identity::from("me"),
                Arc::new(Metrics::new()),
            )
            .with_factory(factory.clone()),
        );
        assert_eq!(svc.retry_interval(), DEFAULT_RETRY_INTERVAL);

        svc.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(WAIT, svc.shutdown())
            .await
            .expect("shutdown interrupts the backoff sleep");
        assert_eq!(factory.built(), 0);
        assert!(!svc.is_initialized().await);
    }

    // -- end to end over WebSockets ----------------------------------------

    #[tokio::test]
    async fn test_joining_service_talks_to_anchor() {
        let anchor = Arc::new(
            WsNode::bind(
                NodeMode::Anchor,
                "127.0.0.1:0",
                None,
                Arc::new(StaticKey::new(b"anchor".to_vec())),
                Arc::new(Metrics::new()),
            )
            .await
            .unwrap(),
        );
        let anchor_shutdown = Shutdown::new();
        let anchor_run = {
            let anchor = Arc::clone(&anchor);
            let signal = anchor_shutdown.signal();
            tokio::spawn(async move { anchor.run(signal).await })
        };

        let mut endpoints = HashMap::new();
        endpoints.insert(PortName::P2P, anchor.endpoint().to_string());
        let resolver = Arc::new(StaticResolver::new());
        resolver.bind(
            "anchor",
            ResolvedEndpoint {
                identity: Identity::from("anchor-id"),
                endpoints,
                pk_id: anchor.pk_id().clone(),
            },
        );

        let svc = Arc::new(CommService::new(
            Arc::new(StaticKey::new(b"joiner".to_vec())),
            resolver,
            config(&[(LISTEN_ADDRESS_KEY, "127.0.0.1:0"), (BOOTSTRAP_NODE_KEY, "anchor")]),
            Identity::from("joiner-id"),
            Arc::new(Metrics::new()),
        ));
        svc.start();

        let caller = svc.default_identity().clone();
        let session = svc
            .new_session(&caller, "ctx", Some(anchor.endpoint()), anchor.pk_id())
            .await
            .unwrap();
        assert_eq!(svc.mode().await, Some(NodeMode::Joining));
        session.send(b"hello anchor".to_vec()).await.unwrap();

        let master = anchor.master_session().await.unwrap();
        let msg = tokio::time::timeout(WAIT, master.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, b"hello anchor");
        assert_eq!(msg.caller, caller);
        assert!(svc.metrics().snapshot().messages_sent >= 1);

        svc.shutdown().await;
        anchor_shutdown.trigger();
        tokio::time::timeout(WAIT, anchor_run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
