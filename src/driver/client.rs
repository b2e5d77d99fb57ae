//! WebSocket driver for node agent communication
//!
//! Provides the concrete driver with:
//! - Registration on every (re)connect
//! - Callback dispatch for agent messages
//! - Automatic reconnection with exponential backoff
//! - A per-connection writer task so callbacks can always send

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;

use super::traits::{DispatchPolicy, DriverHandle, DriverStatus, Executor, ExecutorDriver};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    ExecutorShutdownMessage, FrameworkMessageBody, Message, MessageEnvelope,
    RegisterExecutorRequest, StatusUpdateMessage, PROTOCOL_VERSION,
};
use crate::types::TaskStatus;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the node agent driver
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// WebSocket URL of the node agent
    pub url: String,

    /// Executor ID sent on registration
    pub executor_id: String,

    /// Executor name sent on registration
    pub executor_name: String,

    /// Framework the executor works for
    pub framework_id: Option<String>,

    /// How launch callbacks are dispatched
    pub dispatch: DispatchPolicy,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,

    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,

    /// Outbound frame queue size
    pub outbound_queue_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5051/executor".to_string(),
            executor_id: "executor".to_string(),
            executor_name: "node-executor".to_string(),
            framework_id: None,
            dispatch: DispatchPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0, // Infinite
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            outbound_queue_size: 100,
        }
    }
}

impl DriverConfig {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            url: config.agent.url.clone(),
            executor_id: config.executor.executor_id(),
            executor_name: config.executor.display_name(),
            framework_id: config.agent.framework_id.clone(),
            dispatch: config.executor.dispatch,
            connect_timeout: config.connect_timeout(),
            max_reconnect_attempts: config.agent.max_reconnect_attempts,
            initial_reconnect_delay: Duration::from_millis(config.agent.reconnect_interval_ms),
            max_reconnect_delay: Duration::from_millis(config.agent.max_reconnect_delay_ms),
            ..Default::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Driver Link
// ─────────────────────────────────────────────────────────────────

/// A frame for the writer task, with an optional write receipt
struct Outbound {
    frame: WsMessage,
    reply: Option<oneshot::Sender<Result<()>>>,
}

/// The outbound half handed to executor callbacks.
///
/// Holds the current connection's writer queue; between connections there
/// is none and every send fails with [`Error::NotConnected`].
pub struct DriverLink {
    executor_id: String,
    outbound: RwLock<Option<mpsc::Sender<Outbound>>>,
}

impl DriverLink {
    fn new(executor_id: String) -> Self {
        Self {
            executor_id,
            outbound: RwLock::new(None),
        }
    }

    fn attach(&self, tx: mpsc::Sender<Outbound>) {
        *self.outbound.write() = Some(tx);
    }

    fn detach(&self) {
        *self.outbound.write() = None;
    }

    /// Queue a raw frame and wait until it has been written
    async fn send_frame(&self, frame: WsMessage) -> Result<()> {
        let tx = self.outbound.read().clone().ok_or(Error::NotConnected)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Outbound {
            frame,
            reply: Some(reply_tx),
        })
        .await
        .map_err(|_| Error::NotConnected)?;

        reply_rx
            .await
            .map_err(|_| Error::connection_lost("connection closed before the frame was written"))?
    }

    /// Send a protocol message
    async fn send(&self, msg: Message) -> Result<()> {
        let json = MessageEnvelope::new(msg)
            .to_json()
            .map_err(|e| Error::ProtocolMalformed {
                message: e.to_string(),
            })?;
        self.send_frame(WsMessage::Text(json)).await
    }
}

#[async_trait]
impl ExecutorDriver for DriverLink {
    async fn send_status_update(&self, status: TaskStatus) -> Result<()> {
        debug!(task_id = %status.task_id, state = %status.state, "Sending status update");
        self.send(Message::StatusUpdate(StatusUpdateMessage {
            executor_id: self.executor_id.clone(),
            status,
        }))
        .await
    }

    async fn send_framework_message(&self, data: String) -> Result<()> {
        self.send(Message::ExecutorMessage(FrameworkMessageBody { data })).await
    }
}

/// Own the sink for one connection and write queued frames in order
async fn run_writer<S>(mut write: S, mut rx: mpsc::Receiver<Outbound>)
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    while let Some(Outbound { frame, reply }) = rx.recv().await {
        let closing = matches!(frame, WsMessage::Close(_));
        let result = write.send(frame).await.map_err(Error::from);
        let failed = result.is_err();

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        if failed || closing {
            break;
        }
    }
    debug!("Writer task finished");
}

// ─────────────────────────────────────────────────────────────────
// Node Agent Driver
// ─────────────────────────────────────────────────────────────────

/// How a single connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// The agent closed the connection or the stream ended
    Closed,
    /// The agent asked the executor to shut down
    Shutdown,
    /// `stop` or `abort` was called locally
    Stopped,
}

/// Everything the driver loop needs, shared with spawned launches
struct DriverContext {
    config: DriverConfig,
    url: Url,
    executor: Arc<dyn Executor>,
    link: Arc<DriverLink>,
    handle: DriverHandle,
    stop: CancellationToken,
    aborting: Arc<AtomicBool>,
}

impl DriverContext {
    fn stopped_status(&self) -> DriverStatus {
        if self.aborting.load(Ordering::SeqCst) {
            DriverStatus::Aborted
        } else {
            DriverStatus::Stopped
        }
    }

    async fn send_executor_shutdown(&self, reason: String) {
        let msg = Message::ExecutorShutdown(ExecutorShutdownMessage {
            executor_id: self.config.executor_id.clone(),
            reason,
            abandoned_tasks: self.executor.active_tasks(),
        });
        if let Err(e) = self.link.send(msg).await {
            warn!(error = %e, "Failed to send shutdown notification");
        }
        let _ = self.link.send_frame(WsMessage::Close(None)).await;
    }

    /// Local `stop` or `abort` while connected. A stop drains the executor
    /// and says goodbye; an abort just drops the connection.
    async fn stop_locally(&self) -> ConnectionEnd {
        if !self.aborting.load(Ordering::SeqCst) {
            info!("Driver stop requested");
            self.executor.shutdown(&self.handle).await;
            self.send_executor_shutdown("driver stopped".to_string()).await;
        }
        ConnectionEnd::Stopped
    }
}

/// Driver connecting an [`Executor`] to a node agent over WebSocket
pub struct NodeAgentDriver {
    config: DriverConfig,
    url: Url,
    executor: Arc<dyn Executor>,
    link: Arc<DriverLink>,
    status: Arc<watch::Sender<DriverStatus>>,
    stop: CancellationToken,
    aborting: Arc<AtomicBool>,
}

impl NodeAgentDriver {
    /// Create a driver. The URL is checked here, not on start.
    pub fn new(config: DriverConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| Error::connection_failed(&config.url, format!("invalid URL: {}", e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::connection_failed(
                &config.url,
                "URL scheme must be ws or wss",
            ));
        }

        let (status, _) = watch::channel(DriverStatus::NotStarted);

        Ok(Self {
            link: Arc::new(DriverLink::new(config.executor_id.clone())),
            config,
            url,
            executor,
            status: Arc::new(status),
            stop: CancellationToken::new(),
            aborting: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start the driver loop. A driver can only be started once.
    pub fn start(&self) -> Result<DriverStatus> {
        let started = self.status.send_if_modified(|status| {
            if *status == DriverStatus::NotStarted {
                *status = DriverStatus::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(Error::driver_state(self.status(), "start"));
        }

        let link: Arc<DriverLink> = self.link.clone();
        let ctx = Arc::new(DriverContext {
            config: self.config.clone(),
            url: self.url.clone(),
            executor: self.executor.clone(),
            handle: link,
            link: self.link.clone(),
            stop: self.stop.clone(),
            aborting: self.aborting.clone(),
        });
        let status = self.status.clone();
        let span = info_span!("driver", executor_id = %self.config.executor_id);

        tokio::spawn(
            async move {
                let final_status = run_driver_loop(ctx).await;
                status.send_replace(final_status);
                info!(status = %final_status, "Driver loop terminated");
            }
            .instrument(span),
        );

        info!(url = %self.url, "Driver started");
        Ok(DriverStatus::Running)
    }

    /// Block until the driver has stopped or aborted
    pub async fn join(&self) -> DriverStatus {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_finished() || status == DriverStatus::NotStarted {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Notify the agent, close the connection and wait for the loop to end
    pub async fn stop(&self) -> DriverStatus {
        if self.mark_finished_if_unstarted(DriverStatus::Stopped) {
            return DriverStatus::Stopped;
        }
        self.stop.cancel();
        self.join().await
    }

    /// Drop the connection without notifying the agent
    pub async fn abort(&self) -> DriverStatus {
        if self.mark_finished_if_unstarted(DriverStatus::Aborted) {
            return DriverStatus::Aborted;
        }
        self.aborting.store(true, Ordering::SeqCst);
        self.stop.cancel();
        self.join().await
    }

    fn mark_finished_if_unstarted(&self, next: DriverStatus) -> bool {
        self.status.send_if_modified(|status| {
            if *status == DriverStatus::NotStarted {
                *status = next;
                true
            } else {
                false
            }
        })
    }

    pub fn status(&self) -> DriverStatus {
        *self.status.borrow()
    }

    /// Outbound handle, the same one passed to every callback
    pub fn handle(&self) -> DriverHandle {
        self.link.clone()
    }
}

// ─────────────────────────────────────────────────────────────────
// Driver Loop
// ─────────────────────────────────────────────────────────────────

/// Main driver loop with reconnection logic
async fn run_driver_loop(ctx: Arc<DriverContext>) -> DriverStatus {
    // Create exponential backoff for reconnection
    let mut backoff = ExponentialBackoff {
        initial_interval: ctx.config.initial_reconnect_delay,
        max_interval: ctx.config.max_reconnect_delay,
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    };
    let mut attempts: u32 = 0;

    loop {
        if ctx.stop.is_cancelled() {
            return ctx.stopped_status();
        }

        info!(url = %ctx.url, "Connecting to node agent");

        let connect = tokio::select! {
            result = tokio::time::timeout(ctx.config.connect_timeout, connect_async(ctx.url.as_str())) => result,
            _ = ctx.stop.cancelled() => return ctx.stopped_status(),
        };

        match connect {
            Ok(Ok((ws_stream, _response))) => {
                info!("WebSocket connection established");

                let (write, read) = ws_stream.split();
                let mut registered = false;
                let result = handle_connection(&ctx, write, read, &mut registered).await;

                // Only a connection that got as far as registration resets the retry budget
                if registered {
                    backoff.reset();
                    attempts = 0;
                }

                match result {
                    Ok(ConnectionEnd::Shutdown) => return DriverStatus::Stopped,
                    Ok(ConnectionEnd::Stopped) => return ctx.stopped_status(),
                    Ok(ConnectionEnd::Closed) => info!("Connection closed by node agent"),
                    Err(e) if e.is_fatal() => {
                        error!(error = %e.format_for_log(), "Fatal driver error");
                        ctx.executor.error(&ctx.handle, &e.to_string()).await;
                        return DriverStatus::Aborted;
                    }
                    Err(e) => warn!(error = %e, "Connection error"),
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to connect to node agent");
            }
            Err(_) => {
                let err = Error::ConnectionTimeout {
                    url: ctx.url.to_string(),
                    timeout_secs: ctx.config.connect_timeout.as_secs(),
                };
                warn!(error = %err, "Connection attempt timed out");
            }
        }

        attempts += 1;
        if ctx.config.max_reconnect_attempts > 0 && attempts >= ctx.config.max_reconnect_attempts {
            error!(
                attempts = attempts,
                max = ctx.config.max_reconnect_attempts,
                "Max reconnection attempts reached"
            );
            ctx.executor
                .error(&ctx.handle, "max reconnection attempts reached")
                .await;
            return DriverStatus::Aborted;
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or(ctx.config.max_reconnect_delay);

        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempts,
            "Waiting before reconnection"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.stop.cancelled() => return ctx.stopped_status(),
        }
    }
}

/// Handle an active WebSocket connection
async fn handle_connection<S, R>(
    ctx: &Arc<DriverContext>,
    write: S,
    read: R,
    registered: &mut bool,
) -> Result<ConnectionEnd>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin + Send + 'static,
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let (out_tx, out_rx) = mpsc::channel(ctx.config.outbound_queue_size);
    let writer = tokio::spawn(run_writer(write, out_rx).in_current_span());
    ctx.link.attach(out_tx);

    let result = run_session(ctx, read, registered).await;

    ctx.link.detach();
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        warn!("Writer task did not finish after disconnect");
    }

    let dropped = matches!(result, Ok(ConnectionEnd::Closed) | Err(_));
    if *registered && dropped {
        ctx.executor.disconnected(&ctx.handle).await;
    }

    result
}

/// Register, then read and dispatch agent messages until the connection ends
async fn run_session<R>(
    ctx: &Arc<DriverContext>,
    mut read: R,
    registered: &mut bool,
) -> Result<ConnectionEnd>
where
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let register_msg = Message::RegisterExecutor(RegisterExecutorRequest {
        executor_id: ctx.config.executor_id.clone(),
        framework_id: ctx.config.framework_id.clone(),
        name: ctx.config.executor_name.clone(),
        executor_version: env!("CARGO_PKG_VERSION").to_string(),
    });
    ctx.link.send(register_msg).await?;
    debug!("Sent registration request");

    loop {
        tokio::select! {
            msg = read.next() => {
                let envelope = match msg {
                    Some(Ok(WsMessage::Text(text))) => MessageEnvelope::from_json(&text),
                    Some(Ok(WsMessage::Binary(data))) => MessageEnvelope::from_json_bytes(&data),
                    Some(Ok(WsMessage::Ping(data))) => {
                        // Fire and forget; a failed pong surfaces as a read error
                        let _ = ctx.link.send_frame(WsMessage::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(frame = ?frame, "Received close frame");
                        return Ok(ConnectionEnd::Closed);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        return Err(Error::connection_lost(e.to_string()));
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return Ok(ConnectionEnd::Closed);
                    }
                };

                match envelope {
                    Ok(envelope) => {
                        if let Some(end) = dispatch_message(ctx, envelope, registered).await? {
                            return Ok(end);
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to parse message"),
                }
            }

            _ = ctx.stop.cancelled() => return Ok(ctx.stop_locally().await),
        }
    }
}

/// Deliver one agent message to the executor
async fn dispatch_message(
    ctx: &Arc<DriverContext>,
    envelope: MessageEnvelope,
    registered: &mut bool,
) -> Result<Option<ConnectionEnd>> {
    debug!(message_type = %envelope.payload.type_name(), "Received message");

    match envelope.payload {
        Message::Registered(reg) => {
            PROTOCOL_VERSION.check_compatible(&reg.agent_version)?;
            *registered = true;
            info!(agent_version = %reg.agent_version, "Registration acknowledged");
            ctx.executor
                .registered(&ctx.handle, &reg.executor_info, &reg.framework_info, &reg.node_info)
                .await;
        }

        Message::Reregistered(rereg) => {
            *registered = true;
            info!("Re-registration acknowledged");
            ctx.executor.reregistered(&ctx.handle, &rereg.node_info).await;
        }

        Message::LaunchTask(launch) => {
            let executor = ctx.executor.clone();
            let handle = ctx.handle.clone();
            let mut running = tokio::spawn(
                async move { executor.launch_task(&handle, launch.task).await }.in_current_span(),
            );

            // Serial dispatch holds further agent messages until the launch
            // ends, but a local stop still gets through and drains it.
            if ctx.config.dispatch == DispatchPolicy::Serial {
                tokio::select! {
                    result = &mut running => {
                        if let Err(e) = result {
                            error!(error = %e, "Launch callback panicked");
                        }
                    }
                    _ = ctx.stop.cancelled() => return Ok(Some(ctx.stop_locally().await)),
                }
            }
        }

        Message::KillTask(kill) => {
            info!(task_id = %kill.task_id, reason = ?kill.reason, "Kill requested by node agent");
            ctx.executor.kill_task(&ctx.handle, &kill.task_id).await;
        }

        Message::FrameworkMessage(body) => {
            ctx.executor.framework_message(&ctx.handle, &body.data).await;
        }

        Message::Shutdown(request) => {
            let reason = request
                .reason
                .unwrap_or_else(|| "shutdown requested by node agent".to_string());
            info!(reason = %reason, "Shutdown requested by node agent");

            ctx.executor.shutdown(&ctx.handle).await;
            ctx.send_executor_shutdown(reason).await;
            return Ok(Some(ConnectionEnd::Shutdown));
        }

        Message::StatusUpdateAck(ack) => {
            debug!(task_id = %ack.task_id, uuid = %ack.uuid, "Status update acknowledged");
        }

        Message::Error(err) => {
            warn!(code = %err.code, message = %err.message, "Node agent reported an error");
            ctx.executor.error(&ctx.handle, &err.message).await;
        }

        other => {
            warn!(message_type = %other.type_name(), "Unexpected message from node agent");
        }
    }

    Ok(None)
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use crate::executor::{SleepRunner, TaskExecutor};
    use crate::protocol::{
        LaunchTaskMessage, ProtocolVersion, RegisteredMessage, ReregisteredMessage, ShutdownRequest,
    };
    use crate::types::{
        CommandInfo, ExecutorInfo, FrameworkInfo, NodeInfo, TaskId, TaskInfo, TaskState,
    };
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    type AgentSocket = WebSocketStream<TcpStream>;

    /// Records which callbacks fired
    #[derive(Default)]
    struct CallbackRecorder {
        calls: Mutex<Vec<String>>,
        active: Mutex<Vec<TaskId>>,
    }

    impl CallbackRecorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Executor for CallbackRecorder {
        async fn registered(&self, _: &DriverHandle, _: &ExecutorInfo, _: &FrameworkInfo, node: &NodeInfo) {
            self.calls.lock().push(format!("registered:{}", node.hostname));
        }
        async fn reregistered(&self, _: &DriverHandle, node: &NodeInfo) {
            self.calls.lock().push(format!("reregistered:{}", node.hostname));
        }
        async fn disconnected(&self, _: &DriverHandle) {
            self.calls.lock().push("disconnected".to_string());
        }
        async fn launch_task(&self, _: &DriverHandle, task: TaskInfo) {
            self.calls.lock().push(format!("launch:{}", task.task_id));
        }
        async fn kill_task(&self, _: &DriverHandle, task_id: &TaskId) {
            self.calls.lock().push(format!("kill:{}", task_id));
        }
        async fn framework_message(&self, _: &DriverHandle, message: &str) {
            self.calls.lock().push(format!("message:{}", message));
        }
        async fn shutdown(&self, _: &DriverHandle) {
            self.calls.lock().push("shutdown".to_string());
        }
        async fn error(&self, _: &DriverHandle, message: &str) {
            self.calls.lock().push(format!("error:{}", message));
        }
        fn active_tasks(&self) -> Vec<TaskId> {
            self.active.lock().clone()
        }
    }

    fn test_config(url: String) -> DriverConfig {
        DriverConfig {
            url,
            executor_id: "exec-test".to_string(),
            executor_name: "test".to_string(),
            connect_timeout: Duration::from_secs(2),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn registered(version: ProtocolVersion, hostname: &str) -> Message {
        Message::Registered(RegisteredMessage {
            executor_info: ExecutorInfo {
                executor_id: "exec-test".to_string(),
                ..Default::default()
            },
            framework_info: FrameworkInfo {
                framework_id: "fw-1".to_string(),
                name: "batch".to_string(),
                ..Default::default()
            },
            node_info: NodeInfo {
                node_id: "n-1".to_string(),
                hostname: hostname.to_string(),
                port: None,
            },
            agent_version: version,
        })
    }

    async fn agent_send(ws: &mut AgentSocket, msg: Message) {
        let json = MessageEnvelope::new(msg).to_json().unwrap();
        ws.send(WsMessage::Text(json)).await.unwrap();
    }

    async fn agent_recv(ws: &mut AgentSocket) -> Message {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return MessageEnvelope::from_json(&text).unwrap().payload;
                }
                Some(Ok(_)) => continue,
                other => panic!("Agent expected a message, got {:?}", other),
            }
        }
    }

    async fn bind_agent() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> AgentSocket {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    fn launch(task_id: &str) -> Message {
        Message::LaunchTask(LaunchTaskMessage {
            task: TaskInfo::new(task_id, "noop", CommandInfo::shell("noop")),
        })
    }

    async fn agent_recv_status(ws: &mut AgentSocket) -> (String, TaskState) {
        match agent_recv(ws).await {
            Message::StatusUpdate(update) => (update.status.task_id.to_string(), update.status.state),
            other => panic!("Expected STATUS_UPDATE, got {}", other.type_name()),
        }
    }

    async fn join_within(driver: &NodeAgentDriver, secs: u64) -> DriverStatus {
        tokio::time::timeout(Duration::from_secs(secs), driver.join())
            .await
            .expect("driver did not finish in time")
    }

    #[test]
    fn test_config_default() {
        let config = DriverConfig::default();
        assert_eq!(config.max_reconnect_attempts, 0);
        assert_eq!(config.dispatch, DispatchPolicy::Concurrent);
    }

    #[test]
    fn test_config_from_executor_config() {
        let mut config = ExecutorConfig::default();
        config.executor.id = Some("exec-9".to_string());
        config.agent.reconnect_interval_ms = 250;

        let driver_config = DriverConfig::from_config(&config);
        assert_eq!(driver_config.executor_id, "exec-9");
        assert_eq!(driver_config.initial_reconnect_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_non_websocket_url() {
        let executor = Arc::new(CallbackRecorder::default());
        let result = NodeAgentDriver::new(test_config("http://localhost:1".to_string()), executor);
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let executor = Arc::new(CallbackRecorder::default());
        let driver = NodeAgentDriver::new(test_config("ws://127.0.0.1:1".to_string()), executor).unwrap();

        let status = TaskStatus::new(TaskId::from("t-1"), TaskState::Running);
        let err = driver.handle().send_status_update(status).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_listener, url) = bind_agent().await;
        let executor = Arc::new(CallbackRecorder::default());
        let driver = NodeAgentDriver::new(test_config(url), executor).unwrap();

        assert_eq!(driver.start().unwrap(), DriverStatus::Running);
        assert!(matches!(driver.start(), Err(Error::DriverState { .. })));
        assert_eq!(driver.abort().await, DriverStatus::Aborted);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let executor = Arc::new(CallbackRecorder::default());
        let driver = NodeAgentDriver::new(test_config("ws://127.0.0.1:1".to_string()), executor).unwrap();

        assert_eq!(driver.stop().await, DriverStatus::Stopped);
        assert!(driver.start().is_err());
    }

    #[tokio::test]
    async fn test_max_reconnect_attempts_aborts() {
        let (listener, url) = bind_agent().await;
        drop(listener);

        let executor = Arc::new(CallbackRecorder::default());
        let mut config = test_config(url);
        config.max_reconnect_attempts = 2;
        let driver = NodeAgentDriver::new(config, executor.clone()).unwrap();

        driver.start().unwrap();
        assert_eq!(join_within(&driver, 10).await, DriverStatus::Aborted);
        assert_eq!(executor.calls(), vec!["error:max reconnection attempts reached"]);
    }

    #[tokio::test]
    async fn test_incompatible_agent_aborts() {
        let (listener, url) = bind_agent().await;
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            agent_recv(&mut ws).await;
            agent_send(&mut ws, registered(ProtocolVersion::new(2, 0, 0), "node-a")).await;
            let _ = ws.next().await;
        });

        let executor = Arc::new(CallbackRecorder::default());
        let driver = NodeAgentDriver::new(test_config(url), executor.clone()).unwrap();
        driver.start().unwrap();

        assert_eq!(join_within(&driver, 10).await, DriverStatus::Aborted);
        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("error:Node agent speaks protocol"));
    }

    #[tokio::test]
    async fn test_full_task_lifecycle() {
        let (listener, url) = bind_agent().await;
        let agent = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let mut seen = Vec::new();

            match agent_recv(&mut ws).await {
                Message::RegisterExecutor(reg) => assert_eq!(reg.executor_id, "exec-test"),
                other => panic!("Expected REGISTER_EXECUTOR, got {}", other.type_name()),
            }
            agent_send(&mut ws, registered(PROTOCOL_VERSION, "node-a")).await;
            agent_send(
                &mut ws,
                Message::LaunchTask(LaunchTaskMessage {
                    task: TaskInfo::new("t-1", "noop", CommandInfo::shell("noop")),
                }),
            )
            .await;

            for _ in 0..2 {
                match agent_recv(&mut ws).await {
                    Message::StatusUpdate(update) => {
                        seen.push((update.status.task_id.to_string(), update.status.state))
                    }
                    other => panic!("Expected STATUS_UPDATE, got {}", other.type_name()),
                }
            }

            agent_send(&mut ws, Message::Shutdown(ShutdownRequest::default())).await;
            match agent_recv(&mut ws).await {
                Message::ExecutorShutdown(msg) => assert_eq!(msg.executor_id, "exec-test"),
                other => panic!("Expected EXECUTOR_SHUTDOWN, got {}", other.type_name()),
            }
            seen
        });

        let executor = Arc::new(TaskExecutor::new(Arc::new(SleepRunner::new(Duration::ZERO))));
        let driver = NodeAgentDriver::new(test_config(url), executor.clone()).unwrap();
        driver.start().unwrap();

        assert_eq!(join_within(&driver, 10).await, DriverStatus::Stopped);
        let seen = agent.await.unwrap();
        assert_eq!(
            seen,
            vec![
                ("t-1".to_string(), TaskState::Running),
                ("t-1".to_string(), TaskState::Finished),
            ]
        );
        assert_eq!(executor.tasks_launched(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_fires_disconnected_and_reregisters() {
        let (listener, url) = bind_agent().await;
        tokio::spawn(async move {
            let mut first = accept(&listener).await;
            agent_recv(&mut first).await;
            agent_send(&mut first, registered(PROTOCOL_VERSION, "node-a")).await;
            agent_send(
                &mut first,
                Message::FrameworkMessage(FrameworkMessageBody { data: "ping".into() }),
            )
            .await;
            // Wait for the executor to have handled the message, then drop
            tokio::time::sleep(Duration::from_millis(100)).await;
            first.close(None).await.unwrap();

            let mut second = accept(&listener).await;
            agent_recv(&mut second).await;
            agent_send(
                &mut second,
                Message::Reregistered(ReregisteredMessage {
                    node_info: NodeInfo {
                        node_id: "n-1".to_string(),
                        hostname: "node-a".to_string(),
                        port: None,
                    },
                }),
            )
            .await;
            agent_send(&mut second, Message::Shutdown(ShutdownRequest::default())).await;
            agent_recv(&mut second).await;
        });

        let executor = Arc::new(CallbackRecorder::default());
        let driver = NodeAgentDriver::new(test_config(url), executor.clone()).unwrap();
        driver.start().unwrap();

        assert_eq!(join_within(&driver, 10).await, DriverStatus::Stopped);
        assert_eq!(
            executor.calls(),
            vec![
                "registered:node-a",
                "message:ping",
                "disconnected",
                "reregistered:node-a",
                "shutdown",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_notifies_agent() {
        let (listener, url) = bind_agent().await;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            agent_recv(&mut ws).await;
            agent_send(&mut ws, registered(PROTOCOL_VERSION, "node-a")).await;
            let _ = tx.send(agent_recv(&mut ws).await);
        });

        let executor = Arc::new(CallbackRecorder::default());
        let driver = NodeAgentDriver::new(test_config(url), executor.clone()).unwrap();
        driver.start().unwrap();

        // Let registration complete before stopping
        for _ in 0..500 {
            if !executor.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(driver.stop().await, DriverStatus::Stopped);
        match rx.await.unwrap() {
            Message::ExecutorShutdown(msg) => assert_eq!(msg.reason, "driver stopped"),
            other => panic!("Expected EXECUTOR_SHUTDOWN, got {}", other.type_name()),
        }
        assert_eq!(executor.calls(), vec!["registered:node-a", "shutdown"]);
    }

    #[tokio::test]
    async fn test_serial_dispatch_runs_launches_in_order() {
        let (listener, url) = bind_agent().await;
        let agent = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            agent_recv(&mut ws).await;
            agent_send(&mut ws, registered(PROTOCOL_VERSION, "node-a")).await;
            agent_send(&mut ws, launch("t-1")).await;
            agent_send(&mut ws, launch("t-2")).await;

            let mut seen = Vec::new();
            for _ in 0..4 {
                seen.push(agent_recv_status(&mut ws).await);
            }
            agent_send(&mut ws, Message::Shutdown(ShutdownRequest::default())).await;
            agent_recv(&mut ws).await;
            seen
        });

        let executor = Arc::new(TaskExecutor::new(Arc::new(SleepRunner::new(Duration::from_millis(20)))));
        let mut config = test_config(url);
        config.dispatch = DispatchPolicy::Serial;
        let driver = NodeAgentDriver::new(config, executor.clone()).unwrap();
        driver.start().unwrap();

        assert_eq!(join_within(&driver, 10).await, DriverStatus::Stopped);
        assert_eq!(
            agent.await.unwrap(),
            vec![
                ("t-1".to_string(), TaskState::Running),
                ("t-1".to_string(), TaskState::Finished),
                ("t-2".to_string(), TaskState::Running),
                ("t-2".to_string(), TaskState::Finished),
            ]
        );
        assert_eq!(executor.tasks_launched(), 2);
    }

    /// Stop the driver while a long task runs and collect what the agent sees
    async fn stop_while_task_runs(dispatch: DispatchPolicy) -> (Vec<(String, TaskState)>, Vec<TaskId>) {
        let (listener, url) = bind_agent().await;
        let (running_tx, running_rx) = oneshot::channel();
        let agent = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            agent_recv(&mut ws).await;
            agent_send(&mut ws, registered(PROTOCOL_VERSION, "node-a")).await;
            agent_send(&mut ws, launch("t-1")).await;

            let mut seen = vec![agent_recv_status(&mut ws).await];
            let _ = running_tx.send(());
            loop {
                match agent_recv(&mut ws).await {
                    Message::StatusUpdate(update) => {
                        seen.push((update.status.task_id.to_string(), update.status.state))
                    }
                    Message::ExecutorShutdown(msg) => return (seen, msg.abandoned_tasks),
                    other => panic!("Unexpected {}", other.type_name()),
                }
            }
        });

        let executor = Arc::new(
            TaskExecutor::new(Arc::new(SleepRunner::new(Duration::from_secs(30))))
                .with_shutdown_grace(Duration::from_millis(100)),
        );
        let mut config = test_config(url);
        config.dispatch = dispatch;
        let driver = NodeAgentDriver::new(config, executor).unwrap();
        driver.start().unwrap();

        running_rx.await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), driver.stop())
            .await
            .expect("stop blocked behind the running task");
        assert_eq!(status, DriverStatus::Stopped);
        agent.await.unwrap()
    }

    #[tokio::test]
    async fn test_stop_during_serial_launch_kills_task() {
        let (seen, abandoned) = stop_while_task_runs(DispatchPolicy::Serial).await;
        assert_eq!(
            seen,
            vec![
                ("t-1".to_string(), TaskState::Running),
                ("t-1".to_string(), TaskState::Killed),
            ]
        );
        assert!(abandoned.is_empty());
    }

    #[tokio::test]
    async fn test_stop_during_concurrent_launch_kills_task() {
        let (seen, abandoned) = stop_while_task_runs(DispatchPolicy::Concurrent).await;
        assert_eq!(
            seen,
            vec![
                ("t-1".to_string(), TaskState::Running),
                ("t-1".to_string(), TaskState::Killed),
            ]
        );
        assert!(abandoned.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_reports_tasks_still_active() {
        let (listener, url) = bind_agent().await;
        let agent = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            agent_recv(&mut ws).await;
            agent_send(&mut ws, registered(PROTOCOL_VERSION, "node-a")).await;
            agent_send(&mut ws, Message::Shutdown(ShutdownRequest::default())).await;
            match agent_recv(&mut ws).await {
                Message::ExecutorShutdown(msg) => msg.abandoned_tasks,
                other => panic!("Expected EXECUTOR_SHUTDOWN, got {}", other.type_name()),
            }
        });

        let executor = Arc::new(CallbackRecorder::default());
        executor.active.lock().push(TaskId::from("t-7"));
        let driver = NodeAgentDriver::new(test_config(url), executor).unwrap();
        driver.start().unwrap();

        assert_eq!(join_within(&driver, 10).await, DriverStatus::Stopped);
        assert_eq!(agent.await.unwrap(), vec![TaskId::from("t-7")]);
    }
}
