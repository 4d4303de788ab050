//! Session registry
//!
//! Server-side bookkeeping for every registered client: id allocation, the
//! bidirectional client/connection mapping, and each client's variables.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use thiserror::Error;

use crate::protocol::{VarDef, VarKind, VarValue};

/// Identifier assigned to a registered client; never zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u32);

impl ClientId {
    /// Wrap a wire value; zero means "no id" and yields `None`
    pub fn new(id: u32) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Identifier of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown client id {0}")]
    UnknownClient(u32),

    #[error("No client registered on {0}")]
    UnknownConnection(ConnId),

    #[error("{client} has no variable named {name:?}")]
    UnknownVariable { client: ClientId, name: String },

    #[error("{client} already registered a variable named {name:?}")]
    DuplicateVariable { client: ClientId, name: String },

    #[error("Variable {name:?} is {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: VarKind,
        found: VarKind,
    },

    #[error("{0} is already registered as {1}")]
    AlreadyRegistered(ConnId, ClientId),

    #[error("Client id pool exhausted")]
    OutOfIds,
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Everything the server knows about one client
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// Connection currently bound to this client
    pub conn: ConnId,
    /// Whether the client pulls staged values locally instead of requesting them
    pub signal_mode: bool,
    /// Application name from APP_DESCR
    pub app_name: Option<String>,
    /// Registered variables in declaration order
    pub variables: Vec<VarDef>,
    /// Bumped whenever a stored value changes
    pub timestamp: u32,
}

impl ClientEntry {
    fn new(conn: ConnId, signal_mode: bool) -> Self {
        Self {
            conn,
            signal_mode,
            app_name: None,
            variables: Vec::new(),
            timestamp: 0,
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }
}

/// Result of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: ClientId,
    /// Connection the client was bound to before a migration
    pub migrated_from: Option<ConnId>,
}

/// Client and variable bookkeeping owned by the server
#[derive(Debug)]
pub struct SessionRegistry {
    free_ids: BTreeSet<u32>,
    by_conn: HashMap<ConnId, ClientId>,
    clients: HashMap<ClientId, ClientEntry>,
}

impl SessionRegistry {
    /// Create a registry handing out ids `1..=max_clients`
    pub fn new(max_clients: u32) -> Self {
        Self {
            free_ids: (1..=max_clients).collect(),
            by_conn: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Register a client on `conn`
    ///
    /// `existing_id == 0` allocates a fresh id. Any other value migrates that
    /// client onto `conn`, keeping its variables and releasing the old mapping.
    pub fn register_client(
        &mut self,
        signal_mode: bool,
        existing_id: u32,
        conn: ConnId,
    ) -> RegistryResult<Registration> {
        if let Some(&bound) = self.by_conn.get(&conn) {
            if bound.as_u32() != existing_id {
                return Err(RegistryError::AlreadyRegistered(conn, bound));
            }
        }

        let Some(id) = ClientId::new(existing_id) else {
            let raw = self.free_ids.pop_first().ok_or(RegistryError::OutOfIds)?;
            let id = ClientId(raw);
            self.clients.insert(id, ClientEntry::new(conn, signal_mode));
            self.by_conn.insert(conn, id);
            return Ok(Registration {
                id,
                migrated_from: None,
            });
        };

        let entry = self
            .clients
            .get_mut(&id)
            .ok_or(RegistryError::UnknownClient(existing_id))?;
        let previous = std::mem::replace(&mut entry.conn, conn);
        entry.signal_mode = signal_mode;

        if previous == conn {
            return Ok(Registration {
                id,
                migrated_from: None,
            });
        }
        self.by_conn.remove(&previous);
        self.by_conn.insert(conn, id);
        Ok(Registration {
            id,
            migrated_from: Some(previous),
        })
    }

    /// Remove a client and return its id to the pool
    pub fn unregister_client(&mut self, id: ClientId) -> RegistryResult<ClientEntry> {
        let entry = self
            .clients
            .remove(&id)
            .ok_or(RegistryError::UnknownClient(id.as_u32()))?;
        self.by_conn.remove(&entry.conn);
        self.free_ids.insert(id.as_u32());
        Ok(entry)
    }

    /// Unregister whichever client is bound to `conn`, if any
    pub fn disconnect(&mut self, conn: ConnId) -> Option<(ClientId, ClientEntry)> {
        let id = self.lookup_client(conn).ok()?;
        let entry = self.unregister_client(id).ok()?;
        Some((id, entry))
    }

    pub fn lookup_socket(&self, id: ClientId) -> RegistryResult<ConnId> {
        self.entry(id).map(|e| e.conn)
    }

    pub fn lookup_client(&self, conn: ConnId) -> RegistryResult<ClientId> {
        self.by_conn
            .get(&conn)
            .copied()
            .ok_or(RegistryError::UnknownConnection(conn))
    }

    pub fn entry(&self, id: ClientId) -> RegistryResult<&ClientEntry> {
        self.clients
            .get(&id)
            .ok_or(RegistryError::UnknownClient(id.as_u32()))
    }

    fn entry_mut(&mut self, id: ClientId) -> RegistryResult<&mut ClientEntry> {
        self.clients
            .get_mut(&id)
            .ok_or(RegistryError::UnknownClient(id.as_u32()))
    }

    pub fn set_app_name(&mut self, id: ClientId, name: impl Into<String>) -> RegistryResult<()> {
        self.entry_mut(id)?.app_name = Some(name.into());
        Ok(())
    }

    /// Append a variable to the client's list; names are unique per client
    pub fn register_variable(&mut self, id: ClientId, var: VarDef) -> RegistryResult<()> {
        let entry = self.entry_mut(id)?;
        if entry.position(&var.name).is_some() {
            return Err(RegistryError::DuplicateVariable {
                client: id,
                name: var.name,
            });
        }
        entry.variables.push(var);
        Ok(())
    }

    pub fn variables(&self, id: ClientId) -> RegistryResult<&[VarDef]> {
        self.entry(id).map(|e| e.variables.as_slice())
    }

    pub fn timestamp(&self, id: ClientId) -> RegistryResult<u32> {
        self.entry(id).map(|e| e.timestamp)
    }

    /// Current records for the given names, in the order asked
    pub fn values<'a, I>(&self, id: ClientId, names: I) -> RegistryResult<Vec<VarDef>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let entry = self.entry(id)?;
        names
            .into_iter()
            .map(|name| {
                entry
                    .position(name)
                    .map(|i| entry.variables[i].clone())
                    .ok_or_else(|| RegistryError::UnknownVariable {
                        client: id,
                        name: name.to_string(),
                    })
            })
            .collect()
    }

    /// Store new values; the session timestamp advances if anything changed
    ///
    /// All names and kinds are checked before any value is written.
    pub fn set_values(&mut self, id: ClientId, updates: &[VarDef]) -> RegistryResult<bool> {
        let entry = self.entry_mut(id)?;
        let mut targets = Vec::with_capacity(updates.len());
        for update in updates {
            let i = entry
                .position(&update.name)
                .ok_or_else(|| RegistryError::UnknownVariable {
                    client: id,
                    name: update.name.clone(),
                })?;
            let expected = entry.variables[i].kind();
            if expected != update.kind() {
                return Err(RegistryError::TypeMismatch {
                    name: update.name.clone(),
                    expected,
                    found: update.kind(),
                });
            }
            targets.push((i, &update.value));
        }

        let mut changed = false;
        for (i, value) in targets {
            let var = &mut entry.variables[i];
            if var.value != *value {
                set_both(var, value.clone());
                changed = true;
            }
        }
        if changed {
            entry.timestamp = entry.timestamp.wrapping_add(1);
        }
        Ok(changed)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn available_ids(&self) -> usize {
        self.free_ids.len()
    }
}

fn set_both(var: &mut VarDef, value: VarValue) {
    var.shadow = value.clone();
    var.value = value;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(reg: &mut SessionRegistry, conn: u64) -> ClientId {
        reg.register_client(false, 0, ConnId(conn)).unwrap().id
    }

    #[test]
    fn test_first_id_is_nonzero() {
        let mut reg = SessionRegistry::new(4);
        let id = registered(&mut reg, 1);
        assert_eq!(id.as_u32(), 1);
        assert_eq!(reg.lookup_socket(id), Ok(ConnId(1)));
        assert_eq!(reg.lookup_client(ConnId(1)), Ok(id));
    }

    #[test]
    fn test_ids_are_distinct() {
        let mut reg = SessionRegistry::new(16);
        let ids: BTreeSet<_> = (0..16).map(|c| registered(&mut reg, c)).collect();
        assert_eq!(ids.len(), 16);
        assert_eq!(
            reg.register_client(false, 0, ConnId(99)),
            Err(RegistryError::OutOfIds)
        );
        assert_eq!(
            reg.lookup_client(ConnId(99)),
            Err(RegistryError::UnknownConnection(ConnId(99)))
        );
    }

    #[test]
    fn test_id_reuse_after_unregister() {
        let mut reg = SessionRegistry::new(1);
        let id = registered(&mut reg, 1);
        reg.unregister_client(id).unwrap();
        assert_eq!(reg.lookup_client(ConnId(1)), Err(RegistryError::UnknownConnection(ConnId(1))));

        let again = registered(&mut reg, 2);
        assert_eq!(again, id);
        assert_eq!(reg.available_ids(), 0);
    }

    #[test]
    fn test_unregister_twice_is_unknown_client() {
        let mut reg = SessionRegistry::new(4);
        let id = registered(&mut reg, 1);
        reg.unregister_client(id).unwrap();
        assert_eq!(
            reg.unregister_client(id).unwrap_err(),
            RegistryError::UnknownClient(id.as_u32())
        );
        assert_eq!(reg.available_ids(), 4);
    }

    #[test]
    fn test_migration_preserves_variables() {
        let mut reg = SessionRegistry::new(4);
        let id = registered(&mut reg, 1);
        reg.register_variable(id, VarDef::integer("x", 3)).unwrap();
        reg.register_variable(id, VarDef::string("s", "a")).unwrap();
        let before = reg.variables(id).unwrap().to_vec();

        let moved = reg.register_client(true, id.as_u32(), ConnId(2)).unwrap();
        assert_eq!(moved.id, id);
        assert_eq!(moved.migrated_from, Some(ConnId(1)));
        assert_eq!(reg.variables(id).unwrap(), &before[..]);
        assert_eq!(reg.lookup_socket(id), Ok(ConnId(2)));
        assert!(reg.lookup_client(ConnId(1)).is_err());
        assert!(reg.entry(id).unwrap().signal_mode);

        // The stale connection closing afterwards must not drop the client.
        assert!(reg.disconnect(ConnId(1)).is_none());
        assert_eq!(reg.client_count(), 1);
    }

    #[test]
    fn test_migration_to_unknown_id() {
        let mut reg = SessionRegistry::new(4);
        assert_eq!(
            reg.register_client(false, 42, ConnId(1)),
            Err(RegistryError::UnknownClient(42))
        );
    }

    #[test]
    fn test_second_registration_on_same_connection() {
        let mut reg = SessionRegistry::new(4);
        let id = registered(&mut reg, 1);
        assert_eq!(
            reg.register_client(false, 0, ConnId(1)),
            Err(RegistryError::AlreadyRegistered(ConnId(1), id))
        );
        let same = reg.register_client(false, id.as_u32(), ConnId(1)).unwrap();
        assert_eq!(same.migrated_from, None);
    }

    #[test]
    fn test_duplicate_variable() {
        let mut reg = SessionRegistry::new(4);
        let id = registered(&mut reg, 1);
        reg.register_variable(id, VarDef::integer("x", 0)).unwrap();
        assert!(matches!(
            reg.register_variable(id, VarDef::string("x", "")),
            Err(RegistryError::DuplicateVariable { .. })
        ));

        // Same name under another client is fine.
        let other = registered(&mut reg, 2);
        reg.register_variable(other, VarDef::integer("x", 0)).unwrap();
    }

    #[test]
    fn test_set_values_bumps_timestamp_only_on_change() {
        let mut reg = SessionRegistry::new(4);
        let id = registered(&mut reg, 1);
        reg.register_variable(id, VarDef::integer("x", 0)).unwrap();

        assert!(!reg.set_values(id, &[VarDef::integer("x", 0)]).unwrap());
        assert_eq!(reg.timestamp(id), Ok(0));
        assert!(reg.set_values(id, &[VarDef::integer("x", 5)]).unwrap());
        assert_eq!(reg.timestamp(id), Ok(1));
        assert_eq!(reg.values(id, ["x"]).unwrap(), vec![VarDef::integer("x", 5)]);
    }

    #[test]
    fn test_set_values_is_all_or_nothing() {
        let mut reg = SessionRegistry::new(4);
        let id = registered(&mut reg, 1);
        reg.register_variable(id, VarDef::integer("x", 0)).unwrap();

        let err = reg
            .set_values(id, &[VarDef::integer("x", 1), VarDef::integer("y", 1)])
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownVariable { .. }));
        let err = reg.set_values(id, &[VarDef::string("x", "no")]).unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
        assert_eq!(reg.values(id, ["x"]).unwrap()[0].value, VarValue::Integer(0));
    }

    #[test]
    fn test_unknown_lookups() {
        let reg = SessionRegistry::new(4);
        let ghost = ClientId::new(3).unwrap();
        assert_eq!(reg.lookup_socket(ghost), Err(RegistryError::UnknownClient(3)));
        assert!(reg.values(ghost, ["x"]).is_err());
        assert_eq!(ClientId::new(0), None);
    }
}
