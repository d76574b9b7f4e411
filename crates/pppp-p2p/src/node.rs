//! P2P node implementation.

use std::any::TypeId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pppp_protocol::Metadata;
use pppp_storage::{
    generate_hash, AnyStore, Codec, CodecRegistry, IdentityHash, Persist, Persisted,
    PropertyCodec, ReplicationSink, Store,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionContext;
use crate::{
    session, Connection, ConnectionSet, ConnectionSpy, NoOpConnectionSpy, NodeConfig, P2pError,
    Result, Role, TransformPipeline, TransformStage,
};

/// Creates the store for one registered type.
///
/// Receives the node's codecs and the sink that replicates loud mutations
/// to every connection. The returned store must hold the type it was
/// registered for. [`Node::store`] only finds stores of type [`Store<T>`].
pub type StoreFactory = fn(Arc<CodecRegistry>, Arc<dyn ReplicationSink>) -> Arc<dyn AnyStore>;

fn make_store<T: Persist>(
    codecs: Arc<CodecRegistry>,
    sink: Arc<dyn ReplicationSink>,
) -> Arc<dyn AnyStore> {
    Arc::new(Store::<T>::new(codecs, Some(sink)))
}

/// State shared by the node handle, the acceptor and every session.
pub(crate) struct NodeShared {
    pub(crate) config: NodeConfig,
    pub(crate) codecs: Arc<CodecRegistry>,
    /// Stores in registration order.
    pub(crate) stores: Vec<Arc<dyn AnyStore>>,
    pub(crate) connections: Arc<ConnectionSet>,
    pub(crate) pipeline: Arc<TransformPipeline>,
    pub(crate) spy: Arc<dyn ConnectionSpy>,
    pub(crate) cancel: CancellationToken,
    next_id: AtomicU64,
}

impl NodeShared {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            set: Arc::downgrade(&self.connections),
            spy: self.spy.clone(),
            pipeline: self.pipeline.clone(),
            ping_timeout: self.config.ping_timeout(),
        }
    }

    pub(crate) fn store_for(&self, ty: TypeId) -> Option<Arc<dyn AnyStore>> {
        self.stores.iter().find(|s| s.object_type() == ty).cloned()
    }
}

/// Builder for a [`Node`].
pub struct NodeBuilder {
    config: NodeConfig,
    spy: Arc<dyn ConnectionSpy>,
    pipeline: TransformPipeline,
    codecs: CodecRegistry,
    stores: Vec<(TypeId, StoreFactory)>,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self {
            config: NodeConfig::default(),
            spy: Arc::new(NoOpConnectionSpy),
            pipeline: TransformPipeline::new(),
            codecs: CodecRegistry::new(),
            stores: Vec::new(),
        }
    }
}

impl NodeBuilder {
    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the listen port. Zero picks an ephemeral port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the host to bind.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the version announced during the handshake.
    #[must_use]
    pub fn version(mut self, version: i32) -> Self {
        self.config.version = Some(version);
        self
    }

    /// Sets the connection spy.
    #[must_use]
    pub fn spy(mut self, spy: impl ConnectionSpy) -> Self {
        self.spy = Arc::new(spy);
        self
    }

    /// Appends a transform stage.
    pub fn stage(mut self, stage: impl TransformStage) -> Result<Self> {
        self.pipeline.add(stage)?;
        Ok(self)
    }

    /// Registers `T` with a [`PropertyCodec`] under `tag`.
    pub fn register<T: Persist>(self, tag: u8) -> Result<Self> {
        self.register_with::<T>(PropertyCodec::<T>::new(tag))
    }

    /// Registers `T` with a custom codec.
    pub fn register_with<T: Persist>(mut self, codec: impl Codec) -> Result<Self> {
        self.codecs.register(codec)?;
        let ty = TypeId::of::<T>();
        if !self.stores.iter().any(|(t, _)| *t == ty) {
            self.stores.push((ty, make_store::<T>));
        }
        Ok(self)
    }

    /// Replaces the store created for the registered type `T`.
    pub fn store_factory<T: Persist>(mut self, factory: StoreFactory) -> Result<Self> {
        let ty = TypeId::of::<T>();
        let entry = self
            .stores
            .iter_mut()
            .find(|(t, _)| *t == ty)
            .ok_or(P2pError::NotRegistered(T::TYPE_NAME))?;
        entry.1 = factory;
        Ok(self)
    }

    /// Binds the listener and starts accepting peers.
    pub async fn build(self) -> Result<Node> {
        self.config.validate()?;
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;

        let codecs = Arc::new(self.codecs);
        let connections = Arc::new(ConnectionSet::new());
        let sink: Arc<dyn ReplicationSink> = connections.clone();
        let mut stores = Vec::with_capacity(self.stores.len());
        for (ty, factory) in &self.stores {
            let store = factory(codecs.clone(), sink.clone());
            if store.object_type() != *ty {
                return Err(P2pError::Configuration(format!(
                    "store factory built a store of {}",
                    store.type_name()
                )));
            }
            stores.push(store);
        }

        let shared = Arc::new(NodeShared {
            config: self.config,
            codecs,
            stores,
            connections,
            pipeline: Arc::new(self.pipeline),
            spy: self.spy,
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(shared.clone(), listener));
        info!(
            listen_addr = %local_addr,
            stores = shared.stores.len(),
            stages = ?shared.pipeline.keys(),
            "node started"
        );

        Ok(Node { shared, local_addr })
    }
}

async fn accept_loop(shared: Arc<NodeShared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let max = shared.config.max_connections;
                if shared.connections.len() >= max {
                    warn!(peer = %addr, max, "refusing connection, limit reached");
                    drop(stream);
                    continue;
                }
                debug!(peer = %addr, "accepted transport");
                tokio::spawn(session::establish(
                    shared.clone(),
                    stream,
                    addr.ip().to_string(),
                    addr.port(),
                    Role::Inbound,
                    None,
                ));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    debug!("acceptor stopped");
}

/// A replication node: typed stores plus the connections they replicate over.
///
/// Cloning a `Node` yields another handle to the same node.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
    local_addr: SocketAddr,
}

impl Node {
    /// Starts building a node.
    #[must_use]
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The node configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// The store for `T`.
    pub fn store<T: Persist>(&self) -> Result<Arc<Store<T>>> {
        self.shared
            .store_for(TypeId::of::<T>())
            .and_then(|store| store.into_any().downcast::<Store<T>>().ok())
            .ok_or(P2pError::NotRegistered(T::TYPE_NAME))
    }

    /// Loudly inserts `obj` into its store and returns its identity hash.
    ///
    /// An object too large for one frame is still stored locally. Its
    /// CREATION and snapshot entry are dropped with a warning, so peers
    /// never receive it.
    pub fn persist<T: Persist>(&self, obj: T) -> Result<IdentityHash> {
        let hash = generate_hash(&obj);
        self.store::<T>()?.insert(obj)?;
        Ok(hash)
    }

    /// Loudly inserts `obj` and returns a handle whose property writes
    /// replicate as hinted CHANGE messages.
    pub fn persist_handle<T: Persist>(&self, obj: T) -> Result<Persisted<T>> {
        Ok(Persisted::insert(self.store::<T>()?, obj)?)
    }

    /// Computes the identity hash a store would use for `obj`.
    #[must_use]
    pub fn generate_hash<T: Persist>(&self, obj: &T) -> IdentityHash {
        generate_hash(obj)
    }

    /// Dials a peer and completes the handshake.
    pub async fn connect_to(
        &self,
        host: &str,
        port: u16,
        metadata: Option<Metadata>,
    ) -> Result<Arc<Connection>> {
        let max = self.shared.config.max_connections;
        if self.shared.connections.len() >= max {
            return Err(P2pError::MaxConnections(max));
        }
        let stream = tokio::time::timeout(
            self.shared.config.handshake_timeout(),
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| P2pError::Timeout("connect"))??;
        debug!(peer = %host, port, "dialed peer");

        session::establish(
            self.shared.clone(),
            stream,
            host.to_string(),
            port,
            Role::Outbound,
            metadata,
        )
        .await
    }

    /// The open connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.connections.snapshot()
    }

    /// Quietly empties every store.
    pub fn invalidate(&self) {
        for store in &self.shared.stores {
            store.clear_quietly();
        }
        info!("stores invalidated");
    }

    /// Stops accepting peers and disconnects every connection.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        for connection in self.shared.connections.snapshot() {
            connection.disconnect();
        }
        info!(listen_addr = %self.local_addr, "node stopped");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("listen_addr", &self.local_addr)
            .field("stores", &self.shared.stores.len())
            .field("connections", &self.shared.connections.len())
            .field("codecs", &self.shared.codecs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pppp_protocol::{Value, ValueKind};
    use pppp_storage::Property;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Item {
        name: String,
    }

    impl Persist for Item {
        const TYPE_NAME: &'static str = "Item";

        fn properties() -> Vec<Property<Self>> {
            vec![Property::identity(
                "name",
                ValueKind::Text,
                |i: &Item| Value::from(i.name.as_str()),
                |i: &mut Item, v| {
                    i.name = v.try_into()?;
                    Ok(())
                },
            )]
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Label {
        text: String,
    }

    impl Persist for Label {
        const TYPE_NAME: &'static str = "Label";

        fn properties() -> Vec<Property<Self>> {
            vec![Property::identity(
                "text",
                ValueKind::Text,
                |l: &Label| Value::from(l.text.as_str()),
                |l: &mut Label, v| {
                    l.text = v.try_into()?;
                    Ok(())
                },
            )]
        }
    }

    async fn local_node() -> Node {
        Node::builder()
            .host("127.0.0.1")
            .port(0)
            .register::<Item>(1)
            .unwrap()
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn node_start_stop() {
        let node = local_node().await;
        assert_ne!(node.local_addr().port(), 0);
        assert!(node.connections().is_empty());
        node.shutdown();
    }

    #[tokio::test]
    async fn persist_and_lookup() {
        let node = local_node().await;
        let item = Item {
            name: "first".into(),
        };
        let hash = node.persist(item.clone()).unwrap();
        assert_eq!(hash, node.generate_hash(&item));

        let store = node.store::<Item>().unwrap();
        assert_eq!(store.get(hash), Some(item));

        node.invalidate();
        assert!(store.is_empty());
        node.shutdown();
    }

    #[tokio::test]
    async fn unregistered_type_is_an_error() {
        let node = Node::builder()
            .host("127.0.0.1")
            .port(0)
            .build()
            .await
            .unwrap();
        assert!(matches!(
            node.store::<Item>(),
            Err(P2pError::NotRegistered("Item"))
        ));
        node.shutdown();
    }

    #[test]
    fn duplicate_tags_rejected_at_registration() {
        let result = Node::builder()
            .register::<Item>(1)
            .and_then(|b| b.register::<Item>(1));
        assert!(matches!(
            result,
            Err(P2pError::Storage(pppp_storage::StorageError::DuplicateTag(1)))
        ));
    }

    fn unreplicated_items(
        codecs: Arc<CodecRegistry>,
        _sink: Arc<dyn ReplicationSink>,
    ) -> Arc<dyn AnyStore> {
        Arc::new(Store::<Item>::new(codecs, None))
    }

    #[tokio::test]
    async fn store_factory_replaces_the_default_store() {
        let node = Node::builder()
            .host("127.0.0.1")
            .port(0)
            .register::<Item>(1)
            .and_then(|b| b.store_factory::<Item>(unreplicated_items))
            .unwrap()
            .build()
            .await
            .unwrap();

        let hash = node
            .persist(Item {
                name: "local".into(),
            })
            .unwrap();
        let store = node.store::<Item>().unwrap();
        assert!(store.contains_hash(hash));
        assert!(format!("{store:?}").contains("replicating: false"));
        node.shutdown();
    }

    #[test]
    fn store_factory_needs_a_registered_type() {
        let result = Node::builder().store_factory::<Item>(unreplicated_items);
        assert!(matches!(result, Err(P2pError::NotRegistered("Item"))));
    }

    #[tokio::test]
    async fn store_factory_must_build_the_registered_type() {
        let result = Node::builder()
            .host("127.0.0.1")
            .port(0)
            .register::<Item>(1)
            .and_then(|b| b.register::<Label>(2))
            .and_then(|b| b.store_factory::<Label>(unreplicated_items))
            .unwrap()
            .build()
            .await;
        assert!(matches!(
            result,
            Err(P2pError::Configuration(_))
        ));
    }
}
