//! Endpoint assembly and lifecycle.
//!
//! [`Endpoint`] collects handlers, routes, behaviors, satellites, and startup
//! tasks. [`Endpoint::start`] freezes them into pipelines, creates and starts
//! the pumps, and runs the startup tasks; [`RunningEndpoint::stop`] unwinds
//! the same steps in reverse.

use std::sync::Arc;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use courier_core::transport::{
    CriticalError, MessagePump, PushRuntimeSettings, ReceiveSettings, TransportInfrastructure,
    TransportTransactionMode,
};
use courier_core::{Extensions, Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{PipelineError, RoutingError};
use crate::handlers::{HandlerRegistry, InvokeHandlersTerminator, MessageHandler};
use crate::operations::{MessageOperations, MessagePipelines};
use crate::pipeline::behaviors::{
    CausationHeadersBehavior, DeserializeMessageBehavior, OutgoingHeadersBehavior,
};
use crate::pipeline::{
    Behavior, IncomingContext, OutgoingContext, Pipeline, SubscriptionContext, Terminator,
};
use crate::receive::{
    DefaultRecoverabilityPolicy, MainPipelineExecutor, RecoverabilityPolicy, SatelliteDefinition,
    SatellitePipelineExecutor,
};
use crate::routing::{PublishRouting, PublisherTable, RoutingTerminator, UnicastRoutingTable};
use crate::session::MessageSession;
use crate::subscriptions::{
    InMemorySubscriptionStorage, MessageDrivenSubscribeTerminator,
    MessageDrivenUnsubscribeTerminator, NativeSubscribeTerminator, NativeUnsubscribeTerminator,
    SubscriptionReceiverBehavior, SubscriptionRetrySettings, SubscriptionStorage,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Endpoint-level settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Logical endpoint name; also the default input queue.
    pub endpoint_name: String,
    /// Overrides the input queue name.
    pub input_queue: Option<String>,
    pub error_queue: String,
    /// A send-only endpoint creates no receivers and cannot subscribe.
    pub send_only: bool,
    /// Cap on concurrent deliveries of the main queue. `None` uses
    /// [`PushRuntimeSettings::default`].
    pub concurrency_limit: Option<usize>,
    /// Retries after the first failed attempt before a message is moved to
    /// the error queue.
    pub immediate_retries: u32,
    pub purge_on_startup: bool,
    /// Transaction mode for all receivers. `None` uses the transport's preferred mode.
    pub transaction_mode: Option<TransportTransactionMode>,
    /// Endpoint-wide retry policy for subscription control messages.
    pub subscription_retry: SubscriptionRetrySettings,
}

impl EndpointConfig {
    #[must_use]
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            ..Self::default()
        }
    }

    /// Allows at most `max` deliveries of the main queue to be processed at once.
    #[must_use]
    pub fn limit_message_processing_concurrency_to(mut self, max: usize) -> Self {
        self.concurrency_limit = Some(max);
        self
    }

    #[must_use]
    pub fn send_only(mut self) -> Self {
        self.send_only = true;
        self
    }

    /// The input queue's logical name.
    #[must_use]
    pub fn input_queue(&self) -> &str {
        self.input_queue.as_deref().unwrap_or(&self.endpoint_name)
    }

    fn push_runtime_settings(&self) -> PushRuntimeSettings {
        self.concurrency_limit
            .map_or_else(PushRuntimeSettings::default, PushRuntimeSettings::new)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            endpoint_name: "courier".to_string(),
            input_queue: None,
            error_queue: "error".to_string(),
            send_only: false,
            concurrency_limit: None,
            immediate_retries: 5,
            purge_on_startup: false,
            transaction_mode: None,
            subscription_retry: SubscriptionRetrySettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// FeatureStartupTask
// ---------------------------------------------------------------------------

/// Hook run once the endpoint is receiving, and again when it stops.
#[async_trait]
pub trait FeatureStartupTask: Send + Sync {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Called after every pump started.
    ///
    /// # Errors
    ///
    /// A failure aborts the start; pumps already running are stopped.
    async fn on_start(&self, session: &MessageSession, cancellation: CancellationToken) -> anyhow::Result<()>;

    /// Called before the pumps stop, in reverse registration order.
    ///
    /// # Errors
    ///
    /// Failures are logged; the remaining tasks and the shutdown still run.
    async fn on_stop(&self, session: &MessageSession) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// An endpoint being configured.
pub struct Endpoint {
    config: EndpointConfig,
    transport: Arc<dyn TransportInfrastructure>,
    handlers: HandlerRegistry,
    routes: Arc<UnicastRoutingTable>,
    publishers: Arc<PublisherTable>,
    subscription_storage: Arc<dyn SubscriptionStorage>,
    incoming_behaviors: Vec<Arc<dyn Behavior<IncomingContext>>>,
    outgoing_behaviors: Vec<Arc<dyn Behavior<OutgoingContext>>>,
    startup_tasks: Vec<Arc<dyn FeatureStartupTask>>,
    satellites: Vec<SatelliteDefinition>,
    recoverability: Option<Arc<dyn RecoverabilityPolicy>>,
    critical_error: CriticalError,
}

impl Endpoint {
    #[must_use]
    pub fn new(config: EndpointConfig, transport: Arc<dyn TransportInfrastructure>) -> Self {
        Self {
            config,
            transport,
            handlers: HandlerRegistry::new(),
            routes: Arc::new(UnicastRoutingTable::new()),
            publishers: Arc::new(PublisherTable::new()),
            subscription_storage: Arc::new(InMemorySubscriptionStorage::new()),
            incoming_behaviors: Vec::new(),
            outgoing_behaviors: Vec::new(),
            startup_tasks: Vec::new(),
            satellites: Vec::new(),
            recoverability: None,
            critical_error: CriticalError::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Registers a handler for messages of type `M`.
    pub fn register_handler<M, H>(&mut self, handler: H) -> &mut Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.handlers.register::<M, H>(handler);
        self
    }

    /// Command routes used when a send names no destination.
    #[must_use]
    pub fn routes(&self) -> &UnicastRoutingTable {
        &self.routes
    }

    /// Publisher addresses used by message-driven subscriptions.
    #[must_use]
    pub fn publishers(&self) -> &PublisherTable {
        &self.publishers
    }

    /// Replaces the in-memory subscriber storage used for message-driven publish.
    pub fn use_subscription_storage(&mut self, storage: Arc<dyn SubscriptionStorage>) -> &mut Self {
        self.subscription_storage = storage;
        self
    }

    /// Appends a behavior to the incoming pipeline, after the built-in ones.
    pub fn register_incoming_behavior(&mut self, behavior: impl Behavior<IncomingContext> + 'static) -> &mut Self {
        self.incoming_behaviors.push(Arc::new(behavior));
        self
    }

    /// Appends a behavior to the send, publish, and reply pipelines.
    pub fn register_outgoing_behavior(&mut self, behavior: impl Behavior<OutgoingContext> + 'static) -> &mut Self {
        self.outgoing_behaviors.push(Arc::new(behavior));
        self
    }

    pub fn register_startup_task(&mut self, task: Arc<dyn FeatureStartupTask>) -> &mut Self {
        self.startup_tasks.push(task);
        self
    }

    pub fn register_satellite(&mut self, satellite: SatelliteDefinition) -> &mut Self {
        self.satellites.push(satellite);
        self
    }

    /// Replaces the default recoverability policy of the main queue.
    pub fn use_recoverability(&mut self, policy: Arc<dyn RecoverabilityPolicy>) -> &mut Self {
        self.recoverability = Some(policy);
        self
    }

    /// Callback invoked when a pump cannot continue.
    pub fn on_critical_error(&mut self, critical_error: CriticalError) -> &mut Self {
        self.critical_error = critical_error;
        self
    }

    /// Builds the pipelines, starts every pump, then runs the startup tasks.
    ///
    /// # Errors
    ///
    /// Fails if the transport does not support the configured transaction
    /// mode, a receiver cannot be created or started, or a startup task fails.
    pub async fn start(self) -> anyhow::Result<RunningEndpoint> {
        let Self {
            config,
            transport,
            handlers,
            routes,
            publishers,
            subscription_storage,
            incoming_behaviors,
            outgoing_behaviors,
            startup_tasks,
            satellites,
            recoverability,
            critical_error,
        } = self;

        let capabilities = transport.capabilities().clone();
        let transaction_mode = config
            .transaction_mode
            .unwrap_or_else(|| capabilities.preferred_transaction_mode());
        if !capabilities.supports_transaction_mode(transaction_mode) {
            anyhow::bail!("the transport does not support transaction mode {transaction_mode:?}");
        }

        let local_address =
            (!config.send_only).then(|| transport.to_transport_address(config.input_queue()));
        let dispatcher = transport.dispatcher();
        let error_queue = transport.to_transport_address(&config.error_queue);
        let main_settings = local_address.as_ref().map(|address| ReceiveSettings {
            id: "Main".to_string(),
            local_address: address.clone(),
            error_queue: error_queue.clone(),
            use_publish_subscribe: capabilities.supports_native_pubsub,
            purge_on_startup: config.purge_on_startup,
            required_transaction_mode: transaction_mode,
        });
        let native_manager = match &main_settings {
            Some(settings) => transport.subscription_manager(&config.endpoint_name, settings)?,
            None => None,
        };

        // ---- Outgoing pipelines ----

        let publish_routing = if capabilities.supports_native_pubsub {
            PublishRouting::Native
        } else {
            PublishRouting::MessageDriven(Arc::clone(&subscription_storage))
        };
        let routing: Arc<dyn Terminator<OutgoingContext>> = Arc::new(RoutingTerminator::new(
            Arc::clone(&dispatcher),
            capabilities.clone(),
            routes,
            publish_routing,
        ));
        let mut outgoing: Vec<Arc<dyn Behavior<OutgoingContext>>> = vec![
            Arc::new(OutgoingHeadersBehavior::new(
                config.endpoint_name.clone(),
                local_address.clone(),
            )),
            Arc::new(CausationHeadersBehavior),
        ];
        outgoing.extend(outgoing_behaviors);
        let outgoing_pipeline = |name| {
            Pipeline::builder(name)
                .register_all(outgoing.iter().cloned())
                .terminate_with_shared(Arc::clone(&routing))
        };

        let (subscribe, unsubscribe): (
            Arc<dyn Terminator<SubscriptionContext>>,
            Arc<dyn Terminator<SubscriptionContext>>,
        ) = match (&local_address, native_manager) {
            (None, _) => (Arc::new(SendOnlySubscriptions), Arc::new(SendOnlySubscriptions)),
            (Some(_), Some(manager)) if capabilities.supports_native_pubsub => (
                Arc::new(NativeSubscribeTerminator::new(Arc::clone(&manager))),
                Arc::new(NativeUnsubscribeTerminator::new(manager)),
            ),
            (Some(address), manager) => (
                Arc::new(MessageDrivenSubscribeTerminator::new(
                    manager.clone(),
                    Arc::clone(&publishers),
                    Arc::clone(&dispatcher),
                    address.clone(),
                    config.endpoint_name.clone(),
                )),
                Arc::new(MessageDrivenUnsubscribeTerminator::new(
                    manager,
                    Arc::clone(&publishers),
                    Arc::clone(&dispatcher),
                    address.clone(),
                    config.endpoint_name.clone(),
                )),
            ),
        };

        let operations = Arc::new(MessageOperations::new(
            MessagePipelines {
                send: outgoing_pipeline("send"),
                publish: outgoing_pipeline("publish"),
                reply: outgoing_pipeline("reply"),
                subscribe: Pipeline::builder("subscribe").terminate_with_shared(subscribe),
                unsubscribe: Pipeline::builder("unsubscribe").terminate_with_shared(unsubscribe),
            },
            Arc::clone(&dispatcher),
            local_address.clone(),
        ));

        let root = Extensions::root();
        root.set_shared(Arc::clone(&operations));
        root.set(config.subscription_retry);
        let cancellation = CancellationToken::new();
        let session = MessageSession::new(root, cancellation.clone());
        let state = Arc::new(ArcSwap::from_pointee(EndpointState::Starting));

        // ---- Receivers ----

        let mut pumps: Vec<(Arc<dyn MessagePump>, PushRuntimeSettings)> = Vec::new();
        if let Some(settings) = main_settings {
            let address = settings.local_address.clone();

            let mut incoming: Vec<Arc<dyn Behavior<IncomingContext>>> = Vec::new();
            if !capabilities.supports_native_pubsub {
                incoming.push(Arc::new(SubscriptionReceiverBehavior::new(Arc::clone(
                    &subscription_storage,
                ))));
            }
            incoming.push(Arc::new(DeserializeMessageBehavior));
            incoming.extend(incoming_behaviors);
            let incoming_pipeline = Pipeline::builder("incoming")
                .register_all(incoming)
                .terminate_with(InvokeHandlersTerminator::new(Arc::new(handlers)));

            let recoverability = recoverability.unwrap_or_else(|| {
                Arc::new(DefaultRecoverabilityPolicy::new(
                    config.immediate_retries,
                    error_queue.clone(),
                ))
            });

            let main = transport
                .create_receiver(settings)
                .await
                .with_context(|| format!("creating the receiver for `{address}`"))?;
            main.init(
                Arc::new(MainPipelineExecutor::new(
                    Arc::new(incoming_pipeline),
                    Arc::clone(&operations),
                    Arc::clone(&dispatcher),
                    recoverability,
                )),
                critical_error.clone(),
            )
            .await?;
            pumps.push((main, config.push_runtime_settings()));

            for satellite in &satellites {
                let queue = transport.to_transport_address(&satellite.queue);
                let pump = transport
                    .create_receiver(ReceiveSettings {
                        id: satellite.name.clone(),
                        local_address: queue.clone(),
                        error_queue: error_queue.clone(),
                        use_publish_subscribe: false,
                        purge_on_startup: config.purge_on_startup,
                        required_transaction_mode: transaction_mode,
                    })
                    .await
                    .with_context(|| format!("creating the receiver for satellite `{}`", satellite.name))?;
                pump.init(
                    Arc::new(SatellitePipelineExecutor::new(
                        satellite,
                        Arc::clone(&operations),
                        Arc::clone(&dispatcher),
                    )),
                    critical_error.clone(),
                )
                .await?;
                pumps.push((pump, satellite.runtime_settings));
            }
        }

        let mut started = Vec::with_capacity(pumps.len());
        for (pump, settings) in pumps {
            if let Err(err) = pump.start(settings).await {
                stop_pumps(&started).await;
                return Err(err).with_context(|| format!("starting receiver `{}`", pump.settings().id));
            }
            started.push(pump);
        }

        let running = RunningEndpoint {
            name: config.endpoint_name,
            session,
            pumps: started,
            startup_tasks,
            transport,
            cancellation,
            state,
        };

        for task in &running.startup_tasks {
            if let Err(err) = task
                .on_start(&running.session, running.cancellation.child_token())
                .await
            {
                stop_pumps(&running.pumps).await;
                running.cancellation.cancel();
                return Err(err).with_context(|| format!("startup task `{}` failed", task.name()));
            }
        }

        running.state.store(Arc::new(EndpointState::Running));
        info!(
            endpoint = %running.name,
            receivers = running.pumps.len(),
            "endpoint started"
        );
        Ok(running)
    }
}

async fn stop_pumps(pumps: &[Arc<dyn MessagePump>]) {
    for pump in pumps {
        if let Err(err) = pump.stop().await {
            warn!(receiver = %pump.settings().id, error = %err, "failed to stop receiver");
        }
    }
}

/// Subscription terminator of send-only endpoints.
struct SendOnlySubscriptions;

#[async_trait]
impl Terminator<SubscriptionContext> for SendOnlySubscriptions {
    async fn terminate(&self, _context: &mut SubscriptionContext) -> Result<(), PipelineError> {
        Err(RoutingError::SendOnly.into())
    }
}

// ---------------------------------------------------------------------------
// RunningEndpoint
// ---------------------------------------------------------------------------

/// Lifecycle state of a started endpoint.
///
/// State machine: Starting -> Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A started endpoint.
pub struct RunningEndpoint {
    name: String,
    session: MessageSession,
    pumps: Vec<Arc<dyn MessagePump>>,
    startup_tasks: Vec<Arc<dyn FeatureStartupTask>>,
    transport: Arc<dyn TransportInfrastructure>,
    cancellation: CancellationToken,
    state: Arc<ArcSwap<EndpointState>>,
}

impl RunningEndpoint {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session for sending, publishing, and subscribing outside of handlers.
    #[must_use]
    pub fn session(&self) -> &MessageSession {
        &self.session
    }

    #[must_use]
    pub fn state(&self) -> EndpointState {
        **self.state.load()
    }

    /// Runs the stop hooks, drains the pumps, and shuts the transport down.
    ///
    /// # Errors
    ///
    /// Fails only if the transport cannot shut down; stop-hook and pump
    /// failures are logged.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.state.store(Arc::new(EndpointState::Stopping));
        info!(endpoint = %self.name, "stopping endpoint");

        for task in self.startup_tasks.iter().rev() {
            if let Err(err) = task.on_stop(&self.session).await {
                warn!(task = task.name(), error = %err, "startup task failed to stop");
            }
        }

        stop_pumps(&self.pumps).await;
        self.cancellation.cancel();
        self.transport.shutdown().await?;

        self.state.store(Arc::new(EndpointState::Stopped));
        info!(endpoint = %self.name, "endpoint stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::transport::{
        Dispatcher, MessageProcessor, TransportCapabilities,
    };
    use courier_core::{MessageType, TransportError};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::dispatch::testing::RecordingDispatcher;
    use crate::options::{SendOptions, SubscriptionOptions};
    use crate::session::MessageOps;

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakePump {
        settings: ReceiveSettings,
        log: Log,
        started_with: Mutex<Option<PushRuntimeSettings>>,
    }

    #[async_trait]
    impl MessagePump for FakePump {
        fn settings(&self) -> &ReceiveSettings {
            &self.settings
        }

        async fn init(
            &self,
            _processor: Arc<dyn MessageProcessor>,
            _critical_error: CriticalError,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn start(&self, limitations: PushRuntimeSettings) -> Result<(), TransportError> {
            *self.started_with.lock() = Some(limitations);
            self.log.lock().push(format!("pump-start:{}", self.settings.local_address));
            Ok(())
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.log.lock().push(format!("pump-stop:{}", self.settings.local_address));
            Ok(())
        }
    }

    struct FakeTransport {
        capabilities: TransportCapabilities,
        dispatcher: Arc<RecordingDispatcher>,
        pumps: Mutex<Vec<Arc<FakePump>>>,
        log: Log,
    }

    impl FakeTransport {
        fn new(log: Log) -> Self {
            Self {
                capabilities: TransportCapabilities {
                    transaction_modes: vec![TransportTransactionMode::ReceiveOnly],
                    supports_delayed_delivery: false,
                    supports_ttbr: false,
                    supports_native_pubsub: false,
                },
                dispatcher: Arc::new(RecordingDispatcher::default()),
                pumps: Mutex::new(Vec::new()),
                log,
            }
        }

        fn started_with(&self, queue: &str) -> Option<PushRuntimeSettings> {
            self.pumps
                .lock()
                .iter()
                .find(|p| p.settings.local_address == queue)
                .and_then(|p| *p.started_with.lock())
        }
    }

    #[async_trait]
    impl TransportInfrastructure for FakeTransport {
        fn capabilities(&self) -> &TransportCapabilities {
            &self.capabilities
        }

        fn dispatcher(&self) -> Arc<dyn Dispatcher> {
            self.dispatcher.clone()
        }

        async fn create_receiver(
            &self,
            settings: ReceiveSettings,
        ) -> Result<Arc<dyn MessagePump>, TransportError> {
            let pump = Arc::new(FakePump {
                settings,
                log: self.log.clone(),
                started_with: Mutex::new(None),
            });
            self.pumps.lock().push(pump.clone());
            Ok(pump)
        }
    }

    struct RecordingTask {
        log: Log,
    }

    #[async_trait]
    impl FeatureStartupTask for RecordingTask {
        async fn on_start(&self, _session: &MessageSession, _cancellation: CancellationToken) -> anyhow::Result<()> {
            self.log.lock().push("task-start".into());
            Ok(())
        }

        async fn on_stop(&self, _session: &MessageSession) -> anyhow::Result<()> {
            self.log.lock().push("task-stop".into());
            Ok(())
        }
    }

    struct NoopSatellite;

    #[async_trait]
    impl crate::receive::SatelliteHandler for NoopSatellite {
        async fn handle(
            &self,
            _message: &courier_core::transport::IncomingMessage,
            _context: &crate::session::HandlerContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct PlaceOrder;
    impl Message for PlaceOrder {}

    #[tokio::test]
    async fn concurrency_limit_applies_to_the_input_queue_only() {
        let log: Log = Arc::default();
        let transport = Arc::new(FakeTransport::new(log.clone()));
        let mut endpoint = Endpoint::new(
            EndpointConfig::new("sales").limit_message_processing_concurrency_to(10),
            transport.clone(),
        );
        endpoint.register_satellite(SatelliteDefinition {
            name: "audit".into(),
            queue: "sales.audit".into(),
            runtime_settings: PushRuntimeSettings::new(1),
            recoverability: Arc::new(DefaultRecoverabilityPolicy::new(0, "error")),
            handler: Arc::new(NoopSatellite),
        });

        let running = endpoint.start().await.unwrap();

        assert_eq!(
            transport.started_with("sales").and_then(|s| s.max_concurrency()),
            Some(10)
        );
        assert_eq!(
            transport.started_with("sales.audit").and_then(|s| s.max_concurrency()),
            Some(1)
        );
        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn startup_tasks_run_inside_the_pump_lifetime() {
        let log: Log = Arc::default();
        let transport = Arc::new(FakeTransport::new(log.clone()));
        let mut endpoint = Endpoint::new(EndpointConfig::new("sales"), transport);
        endpoint.register_startup_task(Arc::new(RecordingTask { log: log.clone() }));

        let running = endpoint.start().await.unwrap();
        assert_eq!(running.state(), EndpointState::Running);
        running.stop().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["pump-start:sales", "task-start", "task-stop", "pump-stop:sales"]
        );
    }

    #[tokio::test]
    async fn send_only_endpoint_sends_but_cannot_subscribe() {
        let log: Log = Arc::default();
        let transport = Arc::new(FakeTransport::new(log));
        let endpoint = Endpoint::new(EndpointConfig::new("client").send_only(), transport.clone());
        endpoint.routes().route::<PlaceOrder>("sales");

        let running = endpoint.start().await.unwrap();
        assert!(transport.pumps.lock().is_empty());

        running
            .session()
            .send(&PlaceOrder, &SendOptions::new())
            .await
            .unwrap();
        assert_eq!(transport.dispatcher.destinations(), vec!["sales"]);

        let err = running
            .session()
            .subscribe(MessageType::new("OrderPlaced"), &SubscriptionOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Routing(RoutingError::SendOnly)));
        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_transaction_mode_fails_to_start() {
        let transport = Arc::new(FakeTransport::new(Arc::default()));
        let mut config = EndpointConfig::new("sales");
        config.transaction_mode = Some(TransportTransactionMode::TransactionScope);

        let result = Endpoint::new(config, transport).start().await;
        assert!(result.is_err());
    }

    mod over_learning_transport {
        use std::path::Path;
        use std::time::Duration;

        use courier_core::headers;
        use courier_core::Headers;

        use super::*;
        use crate::handlers::MessageHandler;
        use crate::learning::{LearningTransport, LearningTransportInfrastructure};
        use crate::options::PublishOptions;
        use crate::session::HandlerContext;

        #[derive(Serialize, Deserialize)]
        struct SubmitOrder {
            id: u32,
        }
        impl Message for SubmitOrder {}

        #[derive(Serialize, Deserialize)]
        struct OrderAccepted {
            id: u32,
        }
        impl Message for OrderAccepted {}

        struct AcceptOrders;

        #[async_trait]
        impl MessageHandler<SubmitOrder> for AcceptOrders {
            async fn handle(&self, message: SubmitOrder, context: &HandlerContext) -> anyhow::Result<()> {
                context
                    .publish(&OrderAccepted { id: message.id }, &PublishOptions::new())
                    .await?;
                Ok(())
            }
        }

        struct RecordAccepted(Arc<Mutex<Vec<u32>>>);

        #[async_trait]
        impl MessageHandler<OrderAccepted> for RecordAccepted {
            async fn handle(&self, message: OrderAccepted, _context: &HandlerContext) -> anyhow::Result<()> {
                self.0.lock().push(message.id);
                Ok(())
            }
        }

        struct RejectOrders;

        #[async_trait]
        impl MessageHandler<SubmitOrder> for RejectOrders {
            async fn handle(&self, _message: SubmitOrder, _context: &HandlerContext) -> anyhow::Result<()> {
                anyhow::bail!("payment service unavailable")
            }
        }

        fn transport(root: &Path) -> Arc<LearningTransportInfrastructure> {
            let mut transport = LearningTransport::with_storage_directory(root);
            transport.poll_interval = Duration::from_millis(10);
            Arc::new(transport.initialize().unwrap())
        }

        async fn eventually(condition: impl Fn() -> bool) {
            for _ in 0..500 {
                if condition() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("condition not met in time");
        }

        async fn start_client(transport: &Arc<LearningTransportInfrastructure>) -> RunningEndpoint {
            let client = Endpoint::new(EndpointConfig::new("client").send_only(), transport.clone());
            client.routes().route::<SubmitOrder>("sales");
            client.start().await.unwrap()
        }

        #[tokio::test]
        async fn command_handled_and_event_delivered_to_subscriber() {
            let dir = tempfile::tempdir().unwrap();
            let transport = transport(dir.path());
            let accepted = Arc::new(Mutex::new(Vec::new()));

            let mut sales = Endpoint::new(EndpointConfig::new("sales"), transport.clone());
            sales.register_handler(AcceptOrders);
            let sales = sales.start().await.unwrap();

            let mut billing = Endpoint::new(EndpointConfig::new("billing"), transport.clone());
            billing.register_handler(RecordAccepted(accepted.clone()));
            let billing = billing.start().await.unwrap();
            billing
                .session()
                .subscribe(MessageType::of::<OrderAccepted>(), &SubscriptionOptions::new())
                .await
                .unwrap();

            let client = start_client(&transport).await;
            client
                .session()
                .send(&SubmitOrder { id: 42 }, &SendOptions::new())
                .await
                .unwrap();

            eventually(|| *accepted.lock() == vec![42]).await;
            for endpoint in [client, billing, sales] {
                endpoint.stop().await.unwrap();
            }
        }

        #[tokio::test]
        async fn failing_message_ends_up_in_the_error_queue() {
            let dir = tempfile::tempdir().unwrap();
            let transport = transport(dir.path());

            let mut config = EndpointConfig::new("sales");
            config.immediate_retries = 1;
            let mut sales = Endpoint::new(config, transport.clone());
            sales.register_handler(RejectOrders);
            let sales = sales.start().await.unwrap();

            let client = start_client(&transport).await;
            client
                .session()
                .send(&SubmitOrder { id: 7 }, &SendOptions::new())
                .await
                .unwrap();

            let error_queue = dir.path().join("error");
            let failed_file = || {
                std::fs::read_dir(&error_queue)
                    .ok()?
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .find(|path| path.to_string_lossy().ends_with(".metadata.txt"))
            };
            eventually(|| failed_file().is_some()).await;
            client.stop().await.unwrap();
            sales.stop().await.unwrap();

            let path = failed_file().unwrap();
            let failed: Headers = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
            assert_eq!(failed[headers::FAILED_QUEUE], "sales");
            assert_eq!(failed[headers::PROCESSING_ATTEMPTS], "2");
            assert!(failed[headers::EXCEPTION_MESSAGE].contains("payment service unavailable"));
            assert!(std::fs::read_dir(dir.path().join("sales"))
                .unwrap()
                .filter_map(Result::ok)
                .all(|entry| !entry.path().to_string_lossy().ends_with(".metadata.txt")));
        }
    }
}
