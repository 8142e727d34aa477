// Motor registry
//
// Maps motor IDs to their shared state and transport session. The registry is
// an ordinary value owned by the runtime and handed to the control loop as an
// Arc; nothing here is global.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{info, warn};

use super::protocol::MotorId;
use super::session::{LinkStatus, SessionError, TransportSession};
use super::state::MotorState;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Motor {0} is already registered")]
    AlreadyRegistered(MotorId),

    #[error("Motor {0} is not registered")]
    NotFound(MotorId),

    #[error("Port {base_port} + motor {id} is out of range")]
    PortOutOfRange { id: MotorId, base_port: u16 },

    #[error("Motor {id}: {source}")]
    Session {
        id: MotorId,
        #[source]
        source: SessionError,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Read-side view of a registered motor.
///
/// Cloning is cheap; the handle never owns the worker threads, so holding
/// one does not keep a link alive.
#[derive(Debug, Clone)]
pub struct MotorHandle {
    id: MotorId,
    state: Arc<MotorState>,
    status: Arc<LinkStatus>,
}

impl MotorHandle {
    pub fn id(&self) -> MotorId {
        self.id
    }

    pub fn state(&self) -> &MotorState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// True if both handles point at the same registration. A motor that was
    /// deregistered and registered again under the same id is a different one.
    pub fn same_registration(&self, other: &MotorHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

struct Entry {
    handle: MotorHandle,
    session: Mutex<TransportSession>,
}

impl Entry {
    fn session(&self) -> MutexGuard<'_, TransportSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of motors keyed by ID
#[derive(Default)]
pub struct MotorRegistry {
    motors: RwLock<BTreeMap<MotorId, Arc<Entry>>>,
}

impl MotorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: MotorId) -> Result<Arc<Entry>> {
        self.motors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Create state and an unconnected session for `id`.
    ///
    /// Registering an ID twice is rejected; deregister first to replace it.
    pub fn register(&self, id: MotorId) -> Result<MotorHandle> {
        let mut motors = self.motors.write().unwrap_or_else(PoisonError::into_inner);
        if motors.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        let state = Arc::new(MotorState::new(id));
        let session = TransportSession::new(Arc::clone(&state));
        let handle = MotorHandle {
            id,
            state,
            status: session.status(),
        };
        motors.insert(
            id,
            Arc::new(Entry {
                handle: handle.clone(),
                session: Mutex::new(session),
            }),
        );
        info!(motor_id = id, "Registered motor");
        Ok(handle)
    }

    pub fn get(&self, id: MotorId) -> Option<MotorHandle> {
        self.entry(id).ok().map(|entry| entry.handle.clone())
    }

    /// Connect one motor's session to `host:port`
    pub fn connect(&self, id: MotorId, host: &str, port: u16) -> Result<()> {
        let entry = self.entry(id)?;
        let mut session = entry.session();
        session
            .connect(host, port)
            .map_err(|source| RegistryError::Session { id, source })
    }

    /// Connect every registered motor on `base_port + id`.
    ///
    /// Keeps going after a failure and reports every motor that could not
    /// be connected.
    pub fn connect_all(
        &self,
        host: &str,
        base_port: u16,
    ) -> std::result::Result<(), Vec<(MotorId, RegistryError)>> {
        let mut failures = Vec::new();

        for id in self.ids() {
            let Some(port) = base_port.checked_add(u16::from(id)) else {
                warn!(motor_id = id, base_port, "Motor port out of range");
                failures.push((id, RegistryError::PortOutOfRange { id, base_port }));
                continue;
            };

            match self.connect(id, host, port) {
                Ok(()) => info!(motor_id = id, port, "Motor connected"),
                Err(e) => {
                    warn!(motor_id = id, "Failed to connect motor: {}", e);
                    failures.push((id, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }

    pub fn disconnect(&self, id: MotorId) -> Result<()> {
        self.entry(id)?.session().disconnect();
        Ok(())
    }

    pub fn disconnect_all(&self) {
        let entries: Vec<Arc<Entry>> = self
            .motors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for entry in entries {
            entry.session().disconnect();
        }
    }

    /// Remove a motor, stopping its link first
    pub fn deregister(&self, id: MotorId) -> Result<()> {
        let entry = self
            .motors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(RegistryError::NotFound(id))?;

        entry.session().disconnect();
        info!(motor_id = id, "Deregistered motor");
        Ok(())
    }

    /// Registered IDs in ascending order
    pub fn ids(&self) -> Vec<MotorId> {
        self.motors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn handles(&self) -> Vec<MotorHandle> {
        self.motors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Visit every registered motor without allocating.
    ///
    /// Holds the registry read lock for the duration, so `f` must not call
    /// back into `register`/`deregister`.
    pub fn for_each(&self, mut f: impl FnMut(&MotorHandle)) {
        let motors = self.motors.read().unwrap_or_else(PoisonError::into_inner);
        for entry in motors.values() {
            f(&entry.handle);
        }
    }

    pub fn len(&self) -> usize {
        self.motors.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MotorRegistry {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// A port on localhost that is guaranteed to refuse connections
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_register_and_get() {
        let registry = MotorRegistry::new();
        let handle = registry.register(4).unwrap();
        assert_eq!(handle.id(), 4);
        assert!(!handle.is_connected());

        handle.state().set_torque(2.0);
        let again = registry.get(4).unwrap();
        assert_eq!(again.state().torque(), 2.0);
        assert!(registry.get(5).is_none());
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let registry = MotorRegistry::new();
        let first = registry.register(1).unwrap();
        first.state().set_torque(0.75);

        match registry.register(1) {
            Err(RegistryError::AlreadyRegistered(1)) => {}
            other => panic!("expected AlreadyRegistered, got {:?}", other.map(|h| h.id())),
        }
        // The original entry is untouched
        assert_eq!(registry.get(1).unwrap().state().torque(), 0.75);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregister_after_deregister() {
        let registry = MotorRegistry::new();
        let old = registry.register(2).unwrap();
        old.state().set_torque(1.0);
        assert!(old.same_registration(&registry.get(2).unwrap()));
        registry.deregister(2).unwrap();
        assert!(registry.get(2).is_none());

        let fresh = registry.register(2).unwrap();
        assert_eq!(fresh.state().torque(), 0.0);
        assert!(!old.same_registration(&fresh));
    }

    #[test]
    fn test_unknown_motor() {
        let registry = MotorRegistry::new();
        assert!(matches!(
            registry.connect(9, "127.0.0.1", 6000),
            Err(RegistryError::NotFound(9))
        ));
        assert!(matches!(registry.deregister(9), Err(RegistryError::NotFound(9))));
        assert!(matches!(registry.disconnect(9), Err(RegistryError::NotFound(9))));
    }

    #[test]
    fn test_connect_refused_is_reported() {
        let registry = MotorRegistry::new();
        registry.register(0).unwrap();
        let port = closed_port();

        let err = registry.connect(0, "127.0.0.1", port).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Session {
                id: 0,
                source: SessionError::Connect { .. }
            }
        ));
        assert!(!registry.get(0).unwrap().is_connected());
    }

    #[test]
    fn test_connect_all_collects_failures() {
        let registry = MotorRegistry::new();
        registry.register(0).unwrap();
        registry.register(1).unwrap();

        let failures = registry.connect_all("127.0.0.1", u16::MAX).unwrap_err();
        let ids: Vec<MotorId> = failures.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!(matches!(
            failures[1].1,
            RegistryError::PortOutOfRange { id: 1, base_port: u16::MAX }
        ));
    }

    #[test]
    fn test_ids_sorted() {
        let registry = MotorRegistry::new();
        for id in [7, 2, 5] {
            registry.register(id).unwrap();
        }
        assert_eq!(registry.ids(), vec![2, 5, 7]);

        let mut seen = Vec::new();
        registry.for_each(|handle| seen.push(handle.id()));
        assert_eq!(seen, vec![2, 5, 7]);
    }
}
