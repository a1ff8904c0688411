//! Process-wide lifecycle registry.
//!
//! # Responsibility
//! - Map each resolved `DatabaseIdentity` to one shared `Database`.
//! - Hold the optional process-wide default database.
//!
//! # Invariants
//! - Lookups through this module never create two lifecycles for one identity.
//! - A closed lifecycle is released from both its keyed slot and the default
//!   slot, so the next lookup constructs a fresh one.
//! - A released lifecycle reopens only after reclaiming a vacant keyed slot.

use crate::config::{DatabaseConfig, DatabaseIdentity};
use crate::db::DbResult;
use crate::lifecycle::Database;
use log::debug;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static REGISTRY: Lazy<Mutex<RegistryState>> = Lazy::new(|| Mutex::new(RegistryState::default()));

#[derive(Default)]
struct RegistryState {
    by_identity: HashMap<DatabaseIdentity, Arc<Database>>,
    default: Option<Arc<Database>>,
}

/// Returns the lifecycle registered for `config`'s identity, creating it on
/// first lookup. Later configs for the same identity reuse the first one's
/// migration settings.
pub fn get_or_create(config: DatabaseConfig) -> DbResult<Arc<Database>> {
    let mut state = lock();
    get_or_create_locked(&mut state, config)
}

/// Returns the process-wide default database, registering `config` as the
/// default when the slot is empty.
pub fn default_database(config: DatabaseConfig) -> DbResult<Arc<Database>> {
    let mut state = lock();
    if let Some(existing) = &state.default {
        return Ok(Arc::clone(existing));
    }

    let database = get_or_create_locked(&mut state, config)?;
    state.default = Some(Arc::clone(&database));
    debug!(
        "event=registry_default module=registry status=set target={}",
        database.identity().label()
    );
    Ok(database)
}

/// Returns the current default database without creating one.
pub fn current_default() -> Option<Arc<Database>> {
    lock().default.clone()
}

/// Returns the lifecycle registered for `identity`, if any.
pub fn lookup(identity: &DatabaseIdentity) -> Option<Arc<Database>> {
    lock().by_identity.get(identity).cloned()
}

/// Registers `database` for its identity if the slot is vacant.
///
/// Returns false when a different instance already owns the identity.
pub(crate) fn claim(database: &Arc<Database>) -> bool {
    let mut state = lock();
    match state.by_identity.get(database.identity()) {
        Some(current) => Arc::ptr_eq(current, database),
        None => {
            state
                .by_identity
                .insert(database.identity().clone(), Arc::clone(database));
            debug!(
                "event=registry_claim module=registry status=ok target={}",
                database.identity().label()
            );
            true
        }
    }
}

pub(crate) fn release(database: &Database) {
    let mut state = lock();
    let is_default = state
        .default
        .as_deref()
        .is_some_and(|current| std::ptr::eq(current, database));
    if is_default {
        state.default = None;
    }

    let is_registered = state
        .by_identity
        .get(database.identity())
        .is_some_and(|current| std::ptr::eq(current.as_ref(), database));
    if is_registered {
        state.by_identity.remove(database.identity());
    }

    if is_default || is_registered {
        debug!(
            "event=registry_release module=registry status=ok target={} default={}",
            database.identity().label(),
            is_default
        );
    }
}

fn get_or_create_locked(
    state: &mut RegistryState,
    config: DatabaseConfig,
) -> DbResult<Arc<Database>> {
    let identity = config.identity()?;
    if let Some(existing) = state.by_identity.get(&identity) {
        return Ok(Arc::clone(existing));
    }

    let database = Database::new_shared(config, identity.clone());
    state.by_identity.insert(identity, Arc::clone(&database));
    Ok(database)
}

fn lock() -> MutexGuard<'static, RegistryState> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}
