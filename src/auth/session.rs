use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::Session;

/// Creates a session for an account. `ttl_secs` is applied once; sessions
/// expire by absolute epoch comparison, there is no sliding renewal.
pub fn issue_session(store: &dyn Store, subject_uuid: Uuid, ttl_secs: i64) -> Result<Session> {
    let account = store.get_account(subject_uuid)?.ok_or(Error::NotFound)?;
    if account.deactivated {
        return Err(Error::Unauthorized);
    }

    let now = Utc::now();
    let session = Session {
        uuid: Uuid::new_v4(),
        subject_uuid,
        created: now,
        expire: now + Duration::seconds(ttl_secs),
    };
    store.create_session(&session)?;
    Ok(session)
}

/// Resolves a session uuid to a live session. Expired sessions are removed
/// and reported as `Unauthorized`.
pub fn authenticate_session(store: &dyn Store, session_uuid: Uuid) -> Result<Session> {
    let session = store.get_session(session_uuid)?.ok_or(Error::Unauthorized)?;
    if session.expire <= Utc::now() {
        store.delete_session(session_uuid)?;
        return Err(Error::Unauthorized);
    }
    Ok(session)
}

/// Log-out: removes the session regardless of its expiry.
pub fn revoke_session(store: &dyn Store, session_uuid: Uuid) -> Result<()> {
    if !store.delete_session(session_uuid)? {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn purge_expired_sessions(store: &dyn Store) -> Result<usize> {
    let purged = store.delete_expired_sessions(Utc::now())?;
    if purged > 0 {
        tracing::info!(purged, "purged expired sessions");
    }
    Ok(purged)
}
