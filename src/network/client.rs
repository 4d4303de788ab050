//! Harmony Tuning Client
//!
//! Connects an application to a Harmony server, declares its tuning
//! variables and exchanges values and performance reports.

use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionError};
use super::{resolve_host, NetworkConfig};
use crate::binding::{BindingError, PullMode, VarHandle, VariableTable};
use crate::config::{server_from_env, ConfigError};
use crate::protocol::{CodecError, Message, MessageKind, Payload, VarDef, VarKind, VarValue};

/// Name of the single value carried by a performance report
const PERFORMANCE_VAR: &str = "perf";

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Binding error: {0}")]
    Binding(#[from] BindingError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server rejected {0}")]
    Rejected(MessageKind),

    #[error("Expected {expected} reply, got {got}")]
    UnexpectedReply {
        expected: MessageKind,
        got: MessageKind,
    },

    #[error("Not registered")]
    NotRegistered,

    #[error("Connection timeout")]
    Timeout,
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        ClientError::Connection(ConnectionError::Protocol(e))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The server accepted the registration
    Registered { client_id: u32, server_addr: SocketAddr },
    /// New values from the server are waiting in the shadow slots
    ShadowUpdated { timestamp: u32, count: usize },
    /// The session ended
    Disconnected { reason: String },
}

/// Harmony Tuning Client
pub struct TuningClient<S = TcpStream> {
    /// Connection to the server
    conn: Connection<S>,
    /// How server values reach the live variables
    mode: PullMode,
    /// Id assigned by the server
    client_id: Option<u32>,
    /// Locally bound variables
    vars: VariableTable,
    /// Timestamp of the values currently live
    timestamp: u32,
    /// Timestamp of the values waiting in the shadow slots
    staged: u32,
    /// Set once the connection can no longer pair requests with replies
    closed: bool,
    /// Event sender
    event_tx: mpsc::Sender<ClientEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl TuningClient {
    /// Connect to a server by address
    pub async fn connect(
        server_addr: SocketAddr,
        config: &NetworkConfig,
        mode: PullMode,
    ) -> ClientResult<Self> {
        tracing::info!("Connecting to {}", server_addr);

        let stream = match tokio::time::timeout(
            config.connect_timeout(),
            TcpStream::connect(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout),
        };
        stream.set_nodelay(true)?;

        let conn = Connection::new(stream, server_addr)
            .with_max_frame_size(config.max_frame_size)
            .with_read_timeout(config.read_timeout());
        Ok(Self::from_connection(conn, mode))
    }

    /// Connect to the server named by `HARMONY_S_HOST` and `HARMONY_S_PORT`
    pub async fn connect_from_env(config: &NetworkConfig, mode: PullMode) -> ClientResult<Self> {
        let target = server_from_env()?;
        let addr = resolve_host(&target.host, target.port).await?;
        Self::connect(addr, config, mode).await
    }
}

impl<S> TuningClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established connection
    pub fn from_connection(conn: Connection<S>, mode: PullMode) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            conn,
            mode,
            client_id: None,
            vars: VariableTable::new(),
            timestamp: 0,
            staged: 0,
            closed: false,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn mode(&self) -> PullMode {
        self.mode
    }

    /// Timestamp of the values currently live
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn variables(&self) -> &VariableTable {
        &self.vars
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Register with the server, optionally resuming an existing session
    ///
    /// Passing the id of a live session moves that session onto this
    /// connection and binds the variables it already holds. The application
    /// name is sent once registration succeeds.
    pub async fn register(
        &mut self,
        app_name: Option<&str>,
        existing_id: Option<u32>,
    ) -> ClientResult<u32> {
        let signal_mode = self.mode == PullMode::Signal;
        let request = Message::client_reg(signal_mode, existing_id.unwrap_or(0));
        let reply = self.exchange(&request, MessageKind::Confirm).await?;

        let client_id = match reply.payload() {
            Payload::Registration { client_id, .. } => *client_id,
            _ => {
                return Err(ClientError::UnexpectedReply {
                    expected: MessageKind::Confirm,
                    got: reply.kind(),
                })
            }
        };
        self.client_id = Some(client_id);
        tracing::info!("Registered as client {} ({:?} mode)", client_id, self.mode);

        if existing_id.is_some() {
            self.adopt_session().await?;
        }

        if let Some(name) = app_name {
            let describe = Message::description(MessageKind::AppDescr, name)?;
            self.exchange(&describe, MessageKind::Confirm).await?;
        }

        self.emit(ClientEvent::Registered {
            client_id,
            server_addr: self.conn.remote_addr(),
        });
        Ok(client_id)
    }

    /// Declare a variable to the server and bind it locally
    pub async fn add_variable(&mut self, name: &str, kind: VarKind) -> ClientResult<VarHandle> {
        self.registered()?;
        let handle = self.vars.bind(name, kind)?;

        // The reply must name the variable we just bound, or the binding is undone.
        let declared = match self.declare(name, kind).await {
            Ok((timestamp, values)) => self
                .vars
                .apply_all(&values)
                .map(|_| timestamp)
                .map_err(ClientError::from),
            Err(e) => Err(e),
        };
        let timestamp = match declared {
            Ok(timestamp) => timestamp,
            Err(e) => {
                self.vars.unbind_last();
                return Err(e);
            }
        };
        self.timestamp = timestamp;
        self.staged = timestamp;
        tracing::debug!("Bound {} {}", kind, name);
        Ok(handle)
    }

    async fn declare(&mut self, name: &str, kind: VarKind) -> ClientResult<(u32, Vec<VarDef>)> {
        let request = Message::description(MessageKind::VarDescr, format!("{} {}", kind, name))?;
        let reply = self.exchange(&request, MessageKind::VarSet).await?;
        update_payload(reply)
    }

    /// Bind every variable a resumed session already holds
    async fn adopt_session(&mut self) -> ClientResult<()> {
        let request = Message::update(MessageKind::VarReq, 0, Vec::new())?;
        let reply = self.exchange(&request, MessageKind::VarReq).await?;
        let (timestamp, values) = update_payload(reply)?;

        for var in &values {
            if self.vars.handle(&var.name).is_err() {
                self.vars.bind_value(&var.name, var.value.clone())?;
            }
        }
        self.vars.apply_all(&values)?;
        self.timestamp = timestamp;
        self.staged = timestamp;
        tracing::debug!("Resumed session holds {} variables", values.len());
        Ok(())
    }

    pub fn handle(&self, name: &str) -> ClientResult<VarHandle> {
        Ok(self.vars.handle(name)?)
    }

    pub fn int(&self, handle: VarHandle) -> ClientResult<i32> {
        let var = self.vars.get(handle)?;
        var.value.as_int().ok_or_else(|| mismatch(var, VarKind::Integer))
    }

    pub fn str(&self, handle: VarHandle) -> ClientResult<&str> {
        let var = self.vars.get(handle)?;
        var.value.as_str().ok_or_else(|| mismatch(var, VarKind::String))
    }

    pub fn set_int(&mut self, handle: VarHandle, value: i32) -> ClientResult<()> {
        Ok(self.vars.set(handle, VarValue::Integer(value))?)
    }

    pub fn set_str(&mut self, handle: VarHandle, value: &str) -> ClientResult<()> {
        Ok(self.vars.set(handle, VarValue::String(value.to_string()))?)
    }

    /// Send every live value to the server
    ///
    /// The server's answer lands in the shadow slots.
    pub async fn push_all(&mut self) -> ClientResult<usize> {
        self.registered()?;
        let request = Message::update(MessageKind::VarSet, self.timestamp, self.vars.snapshot())?;
        let reply = self.exchange(&request, MessageKind::VarSet).await?;
        let (timestamp, values) = update_payload(reply)?;

        // The server now holds our point unless its strategy already moved on.
        if self.matches_live(&values) {
            self.timestamp = timestamp;
        }
        self.stage(timestamp, &values)
    }

    /// Bring server values into the live variables
    ///
    /// In request mode this asks the server for fresh values. In signal mode
    /// it applies whatever was already staged.
    pub async fn pull_all(&mut self) -> ClientResult<usize> {
        self.registered()?;
        match self.mode {
            PullMode::Signal => {
                self.vars.pull_all();
                self.timestamp = self.staged;
                Ok(self.vars.len())
            }
            PullMode::Request => {
                let request = Message::update(MessageKind::VarReq, self.timestamp, Vec::new())?;
                let reply = self.exchange(&request, MessageKind::VarReq).await?;
                let (timestamp, values) = update_payload(reply)?;
                let count = self.vars.apply_all(&values)?;
                self.timestamp = timestamp;
                self.staged = timestamp;
                Ok(count)
            }
        }
    }

    /// Report performance for the live point
    ///
    /// Values the server wants tried next are staged in the shadow slots.
    pub async fn report_performance(&mut self, performance: i32) -> ClientResult<usize> {
        self.registered()?;
        let report = vec![VarDef::integer(PERFORMANCE_VAR, performance)];
        let request = Message::update(MessageKind::PerfUpdate, self.timestamp, report)?;
        let reply = self.exchange(&request, MessageKind::PerfUpdate).await?;
        let (timestamp, values) = update_payload(reply)?;
        self.stage(timestamp, &values)
    }

    /// End the session and close the connection
    pub async fn unregister(&mut self) -> ClientResult<()> {
        let client_id = self.registered()?;
        self.exchange(&Message::client_unreg(client_id), MessageKind::Confirm)
            .await?;
        self.client_id = None;
        self.closed = true;

        if let Err(e) = self.conn.close().await {
            tracing::debug!("Close after unregister failed: {}", e);
        }
        tracing::info!("Client {} unregistered", client_id);

        self.emit(ClientEvent::Disconnected {
            reason: "unregistered".to_string(),
        });
        Ok(())
    }

    /// Send a request and check the reply kind
    async fn exchange(
        &mut self,
        request: &Message,
        expected: MessageKind,
    ) -> ClientResult<Message> {
        if self.closed {
            return Err(ClientError::Connection(ConnectionError::Closed));
        }

        let reply = match self.conn.request(request).await {
            Ok(reply) => reply,
            Err(e) => {
                // Replies can no longer be paired with requests.
                if !e.is_recoverable() {
                    self.closed = true;
                    self.emit(ClientEvent::Disconnected {
                        reason: e.to_string(),
                    });
                }
                return Err(e.into());
            }
        };

        match reply.kind() {
            kind if kind == expected => Ok(reply),
            MessageKind::Fail => {
                tracing::warn!("Server rejected {}", request.kind());
                Err(ClientError::Rejected(request.kind()))
            }
            got => Err(ClientError::UnexpectedReply { expected, got }),
        }
    }

    fn stage(&mut self, timestamp: u32, values: &[VarDef]) -> ClientResult<usize> {
        let count = self.vars.stage_all(values)?;
        self.staged = timestamp;
        self.emit(ClientEvent::ShadowUpdated { timestamp, count });
        Ok(count)
    }

    fn matches_live(&self, values: &[VarDef]) -> bool {
        values.iter().all(|v| {
            self.vars
                .by_name(&v.name)
                .map(|live| live.value == v.value)
                .unwrap_or(false)
        })
    }

    fn registered(&self) -> ClientResult<u32> {
        self.client_id.ok_or(ClientError::NotRegistered)
    }

    fn emit(&self, event: ClientEvent) {
        if self.event_tx.try_send(event).is_err() {
            tracing::trace!("Client event dropped");
        }
    }
}

/// Timestamp and records of an update-shaped reply
fn update_payload(reply: Message) -> ClientResult<(u32, Vec<VarDef>)> {
    let kind = reply.kind();
    match reply.into_payload() {
        Payload::Update { timestamp, vars } => Ok((timestamp, vars)),
        _ => Err(CodecError::UnsupportedKind(kind).into()),
    }
}

fn mismatch(var: &VarDef, expected: VarKind) -> ClientError {
    ClientError::Binding(BindingError::TypeMismatch {
        name: var.name.clone(),
        expected,
        found: var.kind(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Server, ServerEvent};
    use crate::session::{ClientId, HoldStrategy, SearchStrategy};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Bumps every integer after each performance report
    #[derive(Default)]
    struct BumpStrategy {
        pending: bool,
    }

    impl SearchStrategy for BumpStrategy {
        fn name(&self) -> &str {
            "bump"
        }

        fn performance_reported(
            &mut self,
            _client: ClientId,
            _point: &[VarDef],
            _performance: i32,
        ) {
            self.pending = true;
        }

        fn next_values(&mut self, _client: ClientId, current: &[VarDef]) -> Vec<VarDef> {
            if !std::mem::take(&mut self.pending) {
                return Vec::new();
            }
            current
                .iter()
                .filter_map(|v| v.value.as_int().map(|i| VarDef::integer(v.name.clone(), i + 1)))
                .collect()
        }
    }

    fn local_config() -> NetworkConfig {
        NetworkConfig::new(0).with_bind_address("127.0.0.1")
    }

    async fn started(strategy: Box<dyn SearchStrategy>) -> (Server, SocketAddr) {
        let mut server = Server::new(local_config(), strategy);
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn client(addr: SocketAddr, mode: PullMode) -> TuningClient {
        TuningClient::connect(addr, &local_config(), mode).await.unwrap()
    }

    #[tokio::test]
    async fn test_requires_registration() {
        let (_server, addr) = started(Box::new(HoldStrategy)).await;
        let mut tuner = client(addr, PullMode::Request).await;

        let err = tuner.add_variable("x", VarKind::Integer).await.unwrap_err();
        assert!(matches!(err, ClientError::NotRegistered));
        assert!(tuner.variables().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_declare() {
        let (mut server, addr) = started(Box::new(HoldStrategy)).await;
        let mut server_events = server.take_event_receiver().unwrap();
        let mut tuner = client(addr, PullMode::Request).await;
        let mut events = tuner.take_event_receiver().unwrap();

        let id = tuner.register(Some("gemm"), None).await.unwrap();
        assert_ne!(id, 0);
        assert_eq!(tuner.client_id(), Some(id));
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Registered { client_id, .. }) if client_id == id
        ));

        let x = tuner.add_variable("x", VarKind::Integer).await.unwrap();
        let s = tuner.add_variable("s", VarKind::String).await.unwrap();
        assert_eq!(tuner.int(x).unwrap(), 0);
        assert_eq!(tuner.str(s).unwrap(), "");
        assert!(tuner.int(s).is_err());

        // The server saw both the registration and the application name.
        let mut registered = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), server_events.recv()).await
        {
            if let ServerEvent::Session { .. } = event {
                registered = true;
            }
        }
        assert!(registered);
    }

    #[tokio::test]
    async fn test_duplicate_declaration_is_unbound() {
        let (_server, addr) = started(Box::new(HoldStrategy)).await;
        let mut tuner = client(addr, PullMode::Request).await;
        tuner.register(None, None).await.unwrap();
        tuner.add_variable("x", VarKind::Integer).await.unwrap();

        let err = tuner.add_variable("x", VarKind::String).await.unwrap_err();
        assert!(matches!(err, ClientError::Binding(BindingError::DuplicateVariable(_))));
        assert_eq!(tuner.variables().len(), 1);
    }

    #[tokio::test]
    async fn test_push_then_pull_round_trip() {
        let (_server, addr) = started(Box::new(HoldStrategy)).await;
        let mut tuner = client(addr, PullMode::Request).await;
        tuner.register(None, None).await.unwrap();
        let x = tuner.add_variable("x", VarKind::Integer).await.unwrap();
        let s = tuner.add_variable("s", VarKind::String).await.unwrap();

        tuner.set_int(x, 42).unwrap();
        tuner.set_str(s, "blocked").unwrap();
        assert_eq!(tuner.push_all().await.unwrap(), 2);
        let pushed_at = tuner.timestamp();
        assert!(pushed_at > 0);

        tuner.set_int(x, 7).unwrap();
        tuner.pull_all().await.unwrap();
        assert_eq!(tuner.int(x).unwrap(), 42);
        assert_eq!(tuner.str(s).unwrap(), "blocked");
        assert_eq!(tuner.timestamp(), pushed_at);
    }

    #[tokio::test]
    async fn test_signal_mode_stages_until_pull() {
        let (_server, addr) = started(Box::new(BumpStrategy::default())).await;
        let mut tuner = client(addr, PullMode::Signal).await;
        let mut events = tuner.take_event_receiver().unwrap();
        tuner.register(None, None).await.unwrap();
        let x = tuner.add_variable("x", VarKind::Integer).await.unwrap();
        let before = tuner.timestamp();

        assert_eq!(tuner.report_performance(100).await.unwrap(), 1);
        assert_eq!(tuner.int(x).unwrap(), 0);
        assert_eq!(tuner.variables().get(x).unwrap().shadow, VarValue::Integer(1));

        let mut staged = None;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::ShadowUpdated { timestamp, count } = event {
                staged = Some((timestamp, count));
            }
        }
        let (timestamp, count) = staged.unwrap();
        assert_eq!(count, 1);
        assert!(timestamp > before);

        tuner.pull_all().await.unwrap();
        assert_eq!(tuner.int(x).unwrap(), 1);
        assert_eq!(tuner.timestamp(), timestamp);
    }

    #[tokio::test]
    async fn test_request_mode_pulls_from_server() {
        let (_server, addr) = started(Box::new(BumpStrategy::default())).await;
        let mut tuner = client(addr, PullMode::Request).await;
        tuner.register(None, None).await.unwrap();
        let x = tuner.add_variable("x", VarKind::Integer).await.unwrap();

        tuner.report_performance(5).await.unwrap();
        assert_eq!(tuner.int(x).unwrap(), 0);
        tuner.pull_all().await.unwrap();
        assert_eq!(tuner.int(x).unwrap(), 1);

        // A report against the new point moves the session again.
        tuner.report_performance(4).await.unwrap();
        tuner.pull_all().await.unwrap();
        assert_eq!(tuner.int(x).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resume_session_on_new_connection() {
        let (_server, addr) = started(Box::new(HoldStrategy)).await;
        let mut first = client(addr, PullMode::Request).await;
        let id = first.register(None, None).await.unwrap();
        let x = first.add_variable("x", VarKind::Integer).await.unwrap();
        first.set_int(x, 9).unwrap();
        first.push_all().await.unwrap();

        let mut second = client(addr, PullMode::Request).await;
        assert_eq!(second.register(None, Some(id)).await.unwrap(), id);
        drop(first);

        // The resumed session brings x along with its stored value.
        let x = second.handle("x").unwrap();
        assert_eq!(second.int(x).unwrap(), 9);
        assert_eq!(second.pull_all().await.unwrap(), 1);
        assert_eq!(second.int(x).unwrap(), 9);

        second.set_int(x, 11).unwrap();
        second.push_all().await.unwrap();
        let y = second.add_variable("y", VarKind::String).await.unwrap();
        assert_eq!(second.str(y).unwrap(), "");
    }

    /// Serve one scripted reply per request, after the given delay
    fn scripted(
        replies: Vec<(u64, Message)>,
        read_timeout: Option<Duration>,
    ) -> TuningClient<DuplexStream> {
        let addr: SocketAddr = "127.0.0.1:1977".parse().unwrap();
        let (near, far) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let mut server = Connection::new(far, addr);
            for (delay_ms, reply) in replies {
                if server.recv().await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if server.send(&reply).await.is_err() {
                    break;
                }
            }
        });

        let conn = Connection::new(near, addr).with_read_timeout(read_timeout);
        TuningClient::from_connection(conn, PullMode::Request)
    }

    fn declared(name: &str) -> Message {
        Message::update(MessageKind::VarSet, 0, vec![VarDef::integer(name, 0)]).unwrap()
    }

    fn values(timestamp: u32, vars: Vec<VarDef>) -> Message {
        Message::update(MessageKind::VarReq, timestamp, vars).unwrap()
    }

    #[tokio::test]
    async fn test_late_reply_closes_client() {
        let mut tuner = scripted(
            vec![
                (0, Message::confirm(0, 1)),
                (0, declared("x")),
                (300, values(1, vec![VarDef::integer("x", 1)])),
                (0, values(2, vec![VarDef::integer("x", 2)])),
            ],
            Some(Duration::from_millis(100)),
        );
        tuner.register(None, None).await.unwrap();
        let x = tuner.add_variable("x", VarKind::Integer).await.unwrap();

        let err = tuner.pull_all().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(ConnectionError::Timeout)));
        assert!(tuner.is_closed());

        // The late reply must never be taken as the answer to a later request.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = tuner.pull_all().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(ConnectionError::Closed)));
        assert_eq!(tuner.int(x).unwrap(), 0);
        assert_eq!(tuner.timestamp(), 0);
    }

    #[tokio::test]
    async fn test_declaration_reply_for_other_name_unbinds() {
        let mut tuner = scripted(
            vec![
                (0, Message::confirm(0, 1)),
                (0, declared("y")),
            ],
            None,
        );
        tuner.register(None, None).await.unwrap();

        let err = tuner.add_variable("x", VarKind::Integer).await.unwrap_err();
        assert!(matches!(err, ClientError::Binding(BindingError::UnknownVariable(_))));
        assert!(tuner.variables().is_empty());
        assert!(tuner.handle("x").is_err());
    }

    #[tokio::test]
    async fn test_whitespace_name_never_reaches_server() {
        let (_server, addr) = started(Box::new(HoldStrategy)).await;
        let mut tuner = client(addr, PullMode::Request).await;
        tuner.register(None, None).await.unwrap();

        let err = tuner.add_variable("my var", VarKind::String).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Binding(BindingError::Invalid(CodecError::WhitespaceInName(_)))
        ));
        assert!(tuner.variables().is_empty());

        // Nothing was declared, so the session stays usable.
        let my = tuner.add_variable("my", VarKind::Integer).await.unwrap();
        tuner.set_int(my, 3).unwrap();
        assert_eq!(tuner.push_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (server, addr) = started(Box::new(HoldStrategy)).await;
        let mut tuner = client(addr, PullMode::Request).await;
        let mut events = tuner.take_event_receiver().unwrap();
        tuner.register(Some("app"), None).await.unwrap();

        tuner.unregister().await.unwrap();
        assert_eq!(tuner.client_id(), None);
        assert!(matches!(tuner.push_all().await, Err(ClientError::NotRegistered)));

        let mut disconnected = false;
        while let Ok(event) = events.try_recv() {
            disconnected |= matches!(event, ClientEvent::Disconnected { .. });
        }
        assert!(disconnected);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TuningClient::connect(addr, &local_config(), PullMode::Request).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
