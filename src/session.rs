use bytes::Bytes;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use strum_macros::Display;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use crate::store::{KeyedStore, Release, StoreError};

pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_CREDENTIAL: &str = "password";
pub const ADMIN_USER_ID: UserId = 0;

pub type UserId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Key of the session in the session store.
    pub fn key(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub username: String,
    pub credential: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry {
    pub owner: UserId,
    pub value: Bytes,
    pub updated_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TableKind {
    Accounts,
    Sessions,
    Data,
}

/// Release for the shared tables, logging every value that leaves them.
#[derive(Debug, Clone, Copy)]
pub struct TableRelease {
    kind: TableKind,
}

impl TableRelease {
    pub fn new(kind: TableKind) -> Self {
        Self { kind }
    }
}

impl Release<Account> for TableRelease {
    fn release(&mut self, account: Account) {
        debug!(
            table = %self.kind,
            user_id = account.user_id,
            "Released account {}",
            account.username
        );
    }
}

impl Release<Session> for TableRelease {
    fn release(&mut self, session: Session) {
        debug!(
            table = %self.kind,
            user_id = session.user_id,
            "Released session {}",
            session.session_id
        );
    }
}

impl Release<DataEntry> for TableRelease {
    fn release(&mut self, entry: DataEntry) {
        debug!(
            table = %self.kind,
            owner = entry.owner,
            bytes = entry.value.len(),
            "Released data entry"
        );
    }
}

pub type AccountStore = KeyedStore<Account, TableRelease>;
pub type SessionStore = KeyedStore<Session, TableRelease>;
pub type DataStore = KeyedStore<DataEntry, TableRelease>;

#[derive(Debug, ThisError, PartialEq)]
pub enum SessionError {
    #[error("session error; no session ids left to issue")]
    SessionIdsExhausted,
    #[error("session error; no user ids left to assign")]
    UserIdsExhausted,
    #[error("session error; invalid credentials for {0}")]
    InvalidCredentials(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inserts the fixed administrative account. Fails if an account with the same username exists.
pub fn bootstrap_default_account(accounts: &mut AccountStore) -> Result<(), SessionError> {
    let account = Account {
        username: DEFAULT_ADMIN_USERNAME.to_string(),
        credential: DEFAULT_ADMIN_CREDENTIAL.to_string(),
        user_id: ADMIN_USER_ID,
    };

    accounts.insert(DEFAULT_ADMIN_USERNAME, account)?;
    info!("Created default account {}", DEFAULT_ADMIN_USERNAME);

    Ok(())
}

/// Shared server state handed to every client handler: the session-id counter and the account,
/// session and data tables, all behind a single mutex.
///
/// The tables are only reachable through [`SessionManager::lock`], so every read and mutation is
/// serialized with session-id issuance.
pub struct SessionManager {
    tables: Mutex<Tables>,
}

pub struct Tables {
    next_session_id: u32,
    next_user_id: UserId,
    pub accounts: AccountStore,
    pub sessions: SessionStore,
    pub data: DataStore,
}

/// Number of values released per table at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownSummary {
    pub accounts: usize,
    pub sessions: usize,
    pub data: usize,
}

impl SessionManager {
    pub fn new(bucket_count: usize, session_start: u32) -> Result<SessionManager, SessionError> {
        let tables = Tables {
            next_session_id: session_start,
            next_user_id: ADMIN_USER_ID + 1,
            accounts: KeyedStore::new(bucket_count, TableRelease::new(TableKind::Accounts))?,
            sessions: KeyedStore::new(bucket_count, TableRelease::new(TableKind::Sessions))?,
            data: KeyedStore::new(bucket_count, TableRelease::new(TableKind::Data))?,
        };

        Ok(SessionManager {
            tables: Mutex::new(tables),
        })
    }

    pub fn lock(&self) -> SessionManagerLocked<'_> {
        let tables = self.tables.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("Shared tables lock was poisoned by a panicking handler");
            poisoned.into_inner()
        });

        SessionManagerLocked { tables }
    }

    pub fn issue_session_id(&self) -> Result<SessionId, SessionError> {
        self.lock().issue_session_id()
    }

    pub fn bootstrap_default_account(&self) -> Result<(), SessionError> {
        bootstrap_default_account(&mut self.lock().accounts)
    }

    /// Releases every remaining account, session and data value.
    pub fn destroy(self) -> TeardownSummary {
        let tables = self
            .tables
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        let summary = TeardownSummary {
            accounts: tables.accounts.destroy(),
            sessions: tables.sessions.destroy(),
            data: tables.data.destroy(),
        };

        info!(
            accounts = summary.accounts,
            sessions = summary.sessions,
            data = summary.data,
            "Released shared tables"
        );

        summary
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

/// Exclusive access to the shared tables. The lock is released when the guard is dropped.
pub struct SessionManagerLocked<'a> {
    tables: MutexGuard<'a, Tables>,
}

impl<'a> SessionManagerLocked<'a> {
    /// Returns the current counter value and advances it.
    pub fn issue_session_id(&mut self) -> Result<SessionId, SessionError> {
        let id = self.tables.next_session_id;
        self.tables.next_session_id = id
            .checked_add(1)
            .ok_or(SessionError::SessionIdsExhausted)?;

        Ok(SessionId(id))
    }

    pub fn create_account(
        &mut self,
        username: &str,
        credential: &str,
    ) -> Result<UserId, SessionError> {
        let key = Bytes::copy_from_slice(username.as_bytes());
        if self.tables.accounts.contains(&key) {
            return Err(StoreError::DuplicateKey(key).into());
        }

        let user_id = self.tables.next_user_id;
        let next_user_id = user_id
            .checked_add(1)
            .ok_or(SessionError::UserIdsExhausted)?;

        let account = Account {
            username: username.to_string(),
            credential: credential.to_string(),
            user_id,
        };
        self.tables.accounts.insert(key, account)?;
        self.tables.next_user_id = next_user_id;

        Ok(user_id)
    }

    /// Looks up the account and, if the credential matches, opens a new session for it.
    pub fn authenticate(
        &mut self,
        username: &str,
        credential: &str,
    ) -> Result<SessionId, SessionError> {
        let user_id = match self.tables.accounts.find(username.as_bytes()) {
            Some(account) if account.credential == credential => account.user_id,
            _ => return Err(SessionError::InvalidCredentials(username.to_string())),
        };

        let session_id = self.issue_session_id()?;
        let session = Session {
            session_id,
            user_id,
            created_at: SystemTime::now(),
        };
        self.tables.sessions.insert(session_id.key(), session)?;

        Ok(session_id)
    }

    pub fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.tables.sessions.find(&session_id.key())
    }

    pub fn end_session(&mut self, session_id: SessionId) -> Result<(), SessionError> {
        self.tables.sessions.remove(&session_id.key())?;
        Ok(())
    }

    /// Removes the account and ends all of its sessions, returning how many sessions were ended.
    pub fn delete_account(&mut self, username: &str) -> Result<usize, SessionError> {
        let user_id = self
            .tables
            .accounts
            .find(username.as_bytes())
            .map(|account| account.user_id)
            .ok_or_else(|| StoreError::NotFound(Bytes::copy_from_slice(username.as_bytes())))?;

        self.tables.accounts.remove(username.as_bytes())?;
        let ended = self
            .tables
            .sessions
            .remove_where(|_, session| session.user_id == user_id);

        Ok(ended)
    }
}

impl<'a> Deref for SessionManagerLocked<'a> {
    type Target = Tables;

    fn deref(&self) -> &Self::Target {
        &self.tables
    }
}

impl<'a> DerefMut for SessionManagerLocked<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    const SESSION_START: u32 = 1000;

    fn manager() -> SessionManager {
        SessionManager::new(16, SESSION_START).unwrap()
    }

    #[test]
    fn concurrent_session_ids_are_unique_and_contiguous() {
        let manager = Arc::new(manager());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    (0..250)
                        .map(|_| manager.issue_session_id().unwrap().0)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            let issued = handle.join().unwrap();
            // Each thread observes strictly increasing ids.
            assert!(issued.windows(2).all(|pair| pair[0] < pair[1]));
            ids.extend(issued);
        }

        let unique: BTreeSet<u32> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 2000);
        assert_eq!(
            unique,
            (SESSION_START..SESSION_START + 2000).collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn session_ids_do_not_wrap() {
        let manager = SessionManager::new(4, u32::MAX - 1).unwrap();

        assert_eq!(manager.issue_session_id(), Ok(SessionId(u32::MAX - 1)));
        assert_eq!(
            manager.issue_session_id(),
            Err(SessionError::SessionIdsExhausted)
        );
    }

    #[test]
    fn second_bootstrap_is_rejected() {
        let manager = manager();

        manager.bootstrap_default_account().unwrap();
        let err = manager.bootstrap_default_account().unwrap_err();

        assert_eq!(
            err,
            SessionError::Store(StoreError::DuplicateKey(Bytes::from(DEFAULT_ADMIN_USERNAME)))
        );

        let tables = manager.lock();
        assert_eq!(tables.accounts.len(), 1);
        assert_eq!(
            tables.accounts.find(DEFAULT_ADMIN_USERNAME.as_bytes()).map(|a| a.user_id),
            Some(ADMIN_USER_ID)
        );
    }

    #[test]
    fn authenticate_opens_session() {
        let manager = manager();
        manager.bootstrap_default_account().unwrap();

        let mut tables = manager.lock();
        let session_id = tables
            .authenticate(DEFAULT_ADMIN_USERNAME, DEFAULT_ADMIN_CREDENTIAL)
            .unwrap();

        assert_eq!(session_id, SessionId(SESSION_START));
        assert_eq!(
            tables.session(session_id).map(|s| s.user_id),
            Some(ADMIN_USER_ID)
        );
        assert_eq!(
            tables.authenticate(DEFAULT_ADMIN_USERNAME, "wrong"),
            Err(SessionError::InvalidCredentials(DEFAULT_ADMIN_USERNAME.to_string()))
        );
        assert_eq!(
            tables.authenticate("nobody", "password"),
            Err(SessionError::InvalidCredentials("nobody".to_string()))
        );

        tables.end_session(session_id).unwrap();
        assert!(tables.session(session_id).is_none());
        assert!(tables.end_session(session_id).is_err());
    }

    #[test]
    fn delete_account_ends_its_sessions() {
        let manager = manager();
        let mut tables = manager.lock();

        let alice = tables.create_account("alice", "secret").unwrap();
        tables.create_account("bob", "hunter2").unwrap();
        assert_eq!(alice, ADMIN_USER_ID + 1);

        tables.authenticate("alice", "secret").unwrap();
        tables.authenticate("alice", "secret").unwrap();
        let bob_session = tables.authenticate("bob", "hunter2").unwrap();

        assert_eq!(tables.delete_account("alice"), Ok(2));
        assert_eq!(tables.sessions.len(), 1);
        assert!(tables.session(bob_session).is_some());
        assert!(tables.delete_account("alice").is_err());
    }

    #[test]
    fn concurrent_account_creation_loses_no_updates() {
        let manager = Arc::new(manager());

        let handles: Vec<_> = ["carol", "dave"]
            .into_iter()
            .map(|username| {
                let manager = manager.clone();
                thread::spawn(move || manager.lock().create_account(username, "pw").unwrap())
            })
            .collect();

        let mut user_ids: Vec<UserId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        user_ids.sort();

        let tables = manager.lock();
        assert_eq!(user_ids, vec![1, 2]);
        assert_eq!(tables.accounts.len(), 2);
        assert!(tables.accounts.contains(b"carol"));
        assert!(tables.accounts.contains(b"dave"));
    }

    #[test]
    fn destroy_releases_every_table() {
        let manager = manager();
        manager.bootstrap_default_account().unwrap();

        {
            let mut tables = manager.lock();
            tables.create_account("erin", "pw").unwrap();
            tables.authenticate("erin", "pw").unwrap();
            let session = tables.authenticate("erin", "pw").unwrap();
            tables.end_session(session).unwrap();
            tables
                .data
                .insert(
                    "greeting",
                    DataEntry {
                        owner: 1,
                        value: Bytes::from("hello"),
                        updated_at: SystemTime::now(),
                    },
                )
                .unwrap();
        }

        let summary = manager.destroy();

        assert_eq!(
            summary,
            TeardownSummary {
                accounts: 2,
                sessions: 1,
                data: 1,
            }
        );
    }
}
