//! Request handling
//!
//! Every request a client sends gets exactly one response. Failures are
//! scoped to the request: the reply becomes FAIL and the session goes on.

use crate::protocol::{CodecError, Message, MessageKind, Payload, VarDef, VarKind, VarValue};

use super::{
    ClientId, ConnId, RegistryError, SearchStrategy, SessionError, SessionEvent, SessionRegistry,
    SessionResult,
};

/// What the server should do after handling one request
#[derive(Debug)]
pub struct Outcome {
    /// Reply to send back on the same connection
    pub response: Message,
    /// Events to publish
    pub events: Vec<SessionEvent>,
    /// Close the connection after replying
    pub close: bool,
}

impl Outcome {
    fn reply(response: Message) -> Self {
        Self {
            response,
            events: Vec::new(),
            close: false,
        }
    }

    fn with_event(mut self, event: SessionEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Owns the registry and strategy; one request is handled at a time
pub struct SessionHandler {
    registry: SessionRegistry,
    strategy: Box<dyn SearchStrategy>,
}

impl SessionHandler {
    pub fn new(max_clients: u32, strategy: Box<dyn SearchStrategy>) -> Self {
        tracing::debug!("Session handler using '{}' strategy", strategy.name());
        Self {
            registry: SessionRegistry::new(max_clients),
            strategy,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Handle one decoded request from `conn`
    pub fn handle(&mut self, conn: ConnId, message: Message) -> Outcome {
        let kind = message.kind();
        match self.dispatch(conn, message) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("{} {} rejected: {}", conn, kind, e);
                Outcome::reply(Message::fail())
            }
        }
    }

    /// Answer a frame that arrived whole but could not be decoded
    pub fn reject(&mut self, conn: ConnId, error: &CodecError) -> Outcome {
        tracing::warn!("{} sent an undecodable message: {}", conn, error);
        Outcome::reply(Message::fail())
    }

    /// The connection went away; unregister whichever client it carried
    pub fn disconnect(&mut self, conn: ConnId) -> Option<SessionEvent> {
        let (client, entry) = self.registry.disconnect(conn)?;
        self.strategy.client_revoked(client);
        tracing::info!("{} dropped with {}", client, conn);
        Some(SessionEvent::Revoked {
            client,
            app_name: entry.app_name,
        })
    }

    fn dispatch(&mut self, conn: ConnId, message: Message) -> SessionResult<Outcome> {
        let kind = message.kind();
        match (kind, message.into_payload()) {
            (MessageKind::ClientReg, Payload::Registration { param, client_id }) => {
                self.register(conn, param, client_id)
            }
            (MessageKind::ClientUnreg, Payload::Registration { client_id, .. }) => {
                self.unregister(conn, client_id)
            }
            (MessageKind::AppDescr, Payload::Description { text }) => {
                let client = self.registry.lookup_client(conn)?;
                tracing::info!("{} describes application '{}'", client, text);
                self.registry.set_app_name(client, text)?;
                Ok(Outcome::reply(Message::confirm(1, client.as_u32())))
            }
            (MessageKind::VarDescr, Payload::Description { text }) => self.declare(conn, &text),
            (MessageKind::VarSet, Payload::Update { vars, .. }) => self.set(conn, vars),
            (MessageKind::VarReq, Payload::Update { vars, .. }) => {
                let client = self.registry.lookup_client(conn)?;
                self.update_reply(MessageKind::VarReq, client, &vars)
                    .map(Outcome::reply)
            }
            (MessageKind::PerfUpdate, Payload::Update { timestamp, vars }) => {
                self.performance(conn, timestamp, &vars)
            }
            (kind, _) => Err(SessionError::Unsupported(kind)),
        }
    }

    fn register(&mut self, conn: ConnId, param: u32, client_id: u32) -> SessionResult<Outcome> {
        let signal_mode = param != 0;
        let registration = self.registry.register_client(signal_mode, client_id, conn)?;
        let client = registration.id;
        let response = Message::confirm(param, client.as_u32());

        let event = match registration.migrated_from {
            Some(from) => {
                tracing::info!("{} migrated from {} to {}", client, from, conn);
                SessionEvent::Migrated {
                    client,
                    from,
                    to: conn,
                }
            }
            None => {
                tracing::info!("{} registered on {} (signal mode: {})", client, conn, signal_mode);
                SessionEvent::Registered {
                    client,
                    signal_mode,
                }
            }
        };
        Ok(Outcome::reply(response).with_event(event))
    }

    fn unregister(&mut self, conn: ConnId, client_id: u32) -> SessionResult<Outcome> {
        let client = match ClientId::new(client_id) {
            None => self.registry.lookup_client(conn)?,
            Some(id) if self.registry.lookup_socket(id)? == conn => id,
            Some(_) => return Err(RegistryError::UnknownClient(client_id).into()),
        };

        let entry = self.registry.unregister_client(client)?;
        self.strategy.client_revoked(client);
        tracing::info!("{} unregistered", client);

        let mut outcome = Outcome::reply(Message::confirm(0, client.as_u32())).with_event(
            SessionEvent::Revoked {
                client,
                app_name: entry.app_name,
            },
        );
        outcome.close = true;
        Ok(outcome)
    }

    fn declare(&mut self, conn: ConnId, text: &str) -> SessionResult<Outcome> {
        let client = self.registry.lookup_client(conn)?;
        let var = parse_declaration(text)?;
        var.validate()?;

        self.registry.register_variable(client, var.clone())?;
        self.strategy.variable_registered(client, &var);
        tracing::debug!("{} declared {} {} = {}", client, var.kind(), var.name, var.value);

        let timestamp = self.registry.timestamp(client)?;
        let name = var.name.clone();
        let response = Message::update(MessageKind::VarSet, timestamp, vec![var])?;
        Ok(Outcome::reply(response).with_event(SessionEvent::VariableRegistered { client, name }))
    }

    fn set(&mut self, conn: ConnId, vars: Vec<VarDef>) -> SessionResult<Outcome> {
        let client = self.registry.lookup_client(conn)?;
        self.registry.set_values(client, &vars)?;
        self.advance(client)?;
        self.update_reply(MessageKind::VarSet, client, &vars)
            .map(Outcome::reply)
    }

    fn performance(
        &mut self,
        conn: ConnId,
        timestamp: u32,
        vars: &[VarDef],
    ) -> SessionResult<Outcome> {
        let client = self.registry.lookup_client(conn)?;
        let performance = vars
            .iter()
            .find_map(|v| v.value.as_int())
            .ok_or(SessionError::MissingPerformance)?;

        // Reports stamped before the last value change describe an old point.
        let stale = timestamp < self.registry.timestamp(client)?;
        if stale {
            tracing::debug!("{} sent a stale report (timestamp {})", client, timestamp);
        } else {
            let point = self.registry.variables(client)?.to_vec();
            self.strategy.performance_reported(client, &point, performance);
            self.advance(client)?;
        }

        let response = self.update_reply(MessageKind::PerfUpdate, client, &[])?;
        Ok(Outcome::reply(response).with_event(SessionEvent::PerformanceReported {
            client,
            performance,
            stale,
        }))
    }

    /// Let the strategy move the session to a new point
    fn advance(&mut self, client: ClientId) -> SessionResult<()> {
        let current = self.registry.variables(client)?.to_vec();
        let next = self.strategy.next_values(client, &current);
        if !next.is_empty() && self.registry.set_values(client, &next)? {
            tracing::debug!(
                "{} moved to a new point (timestamp {})",
                client,
                self.registry.timestamp(client)?
            );
        }
        Ok(())
    }

    /// Update message carrying current values for the named variables, or all of them
    fn update_reply(
        &self,
        kind: MessageKind,
        client: ClientId,
        requested: &[VarDef],
    ) -> SessionResult<Message> {
        let vars = if requested.is_empty() {
            self.registry.variables(client)?.to_vec()
        } else {
            self.registry
                .values(client, requested.iter().map(|v| v.name.as_str()))?
        };
        let timestamp = self.registry.timestamp(client)?;
        Ok(Message::update(kind, timestamp, vars)?)
    }
}

/// Parse `[int|str] <name> [initial]`; a bare name declares an integer
pub fn parse_declaration(text: &str) -> SessionResult<VarDef> {
    let invalid = || SessionError::InvalidDeclaration(text.to_string());

    let (first, rest) = split_token(text.trim());
    let (kind, name, initial) = match first {
        "int" if !rest.is_empty() => {
            let (name, initial) = split_token(rest);
            (VarKind::Integer, name, initial)
        }
        "str" if !rest.is_empty() => {
            let (name, initial) = split_token(rest);
            (VarKind::String, name, initial)
        }
        name if rest.is_empty() => (VarKind::Integer, name, ""),
        _ => return Err(invalid()),
    };

    if name.is_empty() {
        return Err(invalid());
    }

    let value = match kind {
        _ if initial.is_empty() => kind.default_value(),
        VarKind::Integer => VarValue::Integer(initial.parse().map_err(|_| invalid())?),
        VarKind::String => VarValue::String(initial.to_string()),
    };
    Ok(VarDef::new(name, value))
}

fn split_token(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}
