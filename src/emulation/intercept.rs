//! Redirection of the runtime's method-resolution boundary.
//!
//! Protected stubs call a shared lookup routine that asks the runtime which method is calling
//! it. The runtime answers by mapping an opaque frame handle to a method identity; during
//! recovery that identity is a runtime thunk (`InvokeMethod`) rather than the stub. The
//! [`Interceptor`] sits at that boundary and, while armed, substitutes the stub's identity for
//! the thunk's exactly once.
//!
//! # States
//!
//! - Idle: the slot is empty and every event passes through.
//! - Armed: the slot holds an identity and the thread allowed to consume it.
//!
//! [`Interceptor::arm`] enters a critical section and returns an [`ArmGuard`]; dropping the guard
//! empties the slot and leaves the section, so the interceptor is Idle again whether the lookup
//! succeeded or not.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread::{self, ThreadId},
};

use log::debug;

use crate::{metadata::token::Token, Error, Result};

/// Name of the runtime frame whose resolution is redirected.
pub const DEFAULT_SENTINEL: &str = "InvokeMethod";

static GLOBAL: OnceLock<Arc<Interceptor>> = OnceLock::new();

/// Identity of a method as seen at the resolution boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    /// Token of the method in its module
    pub token: Token,
    /// Full name of the declaring type
    pub declaring_type: String,
    /// Method name
    pub name: String,
}

impl MethodIdentity {
    /// Create an identity.
    #[must_use]
    pub fn new(token: Token, declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        MethodIdentity {
            token,
            declaring_type: declaring_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} ({})", self.declaring_type, self.name, self.token)
    }
}

/// Outcome of the post-resolution hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostHookResult {
    /// Keep the identity the runtime computed
    Keep,
    /// Replace it with the armed identity
    Replace(MethodIdentity),
}

/// Observable state of an [`Interceptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptionState {
    /// Nothing armed
    Idle,
    /// An identity waits to be consumed
    Armed,
}

#[derive(Debug)]
struct Slot {
    identity: MethodIdentity,
    owner: ThreadId,
}

/// The interception slot and its critical section.
#[derive(Debug)]
pub struct Interceptor {
    sentinel: String,
    section: Mutex<()>,
    holder: Mutex<Option<ThreadId>>,
    slot: Mutex<Option<Slot>>,
    redirections: AtomicUsize,
}

impl Default for Interceptor {
    fn default() -> Self {
        Interceptor::new(DEFAULT_SENTINEL)
    }
}

impl Interceptor {
    /// Create a private interceptor redirecting frames named `sentinel`.
    #[must_use]
    pub fn new(sentinel: impl Into<String>) -> Self {
        Interceptor {
            sentinel: sentinel.into(),
            section: Mutex::new(()),
            holder: Mutex::new(None),
            slot: Mutex::new(None),
            redirections: AtomicUsize::new(0),
        }
    }

    /// The process-wide interceptor, created on first use.
    pub fn global() -> Arc<Interceptor> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Interceptor::default())))
    }

    /// The frame name this interceptor redirects.
    #[must_use]
    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> InterceptionState {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            InterceptionState::Armed
        } else {
            InterceptionState::Idle
        }
    }

    /// How many events were redirected so far.
    #[must_use]
    pub fn redirections(&self) -> usize {
        self.redirections.load(Ordering::Relaxed)
    }

    /// Enter the critical section and arm the slot with `identity`.
    ///
    /// Only events raised on `owner` can consume the slot. Blocks while another thread holds the
    /// section.
    ///
    /// # Errors
    /// Returns [`Error::InterceptorReentered`] if the calling thread already holds the section,
    /// and [`Error::LockError`] if a lock is poisoned.
    pub fn arm(&self, identity: MethodIdentity, owner: ThreadId) -> Result<ArmGuard<'_>> {
        let caller = thread::current().id();
        if *self.holder.lock().map_err(|_| Error::LockError)? == Some(caller) {
            return Err(Error::InterceptorReentered);
        }

        let section = self.section.lock().map_err(|_| Error::LockError)?;
        *self.holder.lock().map_err(|_| Error::LockError)? = Some(caller);
        debug!("Armed interceptor with {identity}");
        *self.slot.lock().map_err(|_| Error::LockError)? = Some(Slot { identity, owner });

        Ok(ArmGuard {
            interceptor: self,
            _section: section,
        })
    }

    /// The resolution boundary: returns the identity the runtime should report for `computed`.
    pub fn resolve(&self, computed: MethodIdentity) -> MethodIdentity {
        match self.post_hook(&computed) {
            PostHookResult::Keep => computed,
            PostHookResult::Replace(identity) => identity,
        }
    }

    /// Decide whether `computed` is replaced, consuming the slot if it is.
    pub fn post_hook(&self, computed: &MethodIdentity) -> PostHookResult {
        if computed.name != self.sentinel {
            return PostHookResult::Keep;
        }

        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let current = thread::current().id();
        match slot.take() {
            Some(armed) if armed.owner == current => {
                self.redirections.fetch_add(1, Ordering::Relaxed);
                PostHookResult::Replace(armed.identity)
            }
            other => {
                *slot = other;
                PostHookResult::Keep
            }
        }
    }

    fn disarm(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Holds the critical section while a lookup runs. Dropping it returns the interceptor to Idle.
#[must_use = "the interceptor is disarmed as soon as the guard is dropped"]
pub struct ArmGuard<'a> {
    interceptor: &'a Interceptor,
    _section: MutexGuard<'a, ()>,
}

impl fmt::Debug for ArmGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArmGuard").finish_non_exhaustive()
    }
}

impl Drop for ArmGuard<'_> {
    fn drop(&mut self) {
        self.interceptor.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::TableId;

    fn stub() -> MethodIdentity {
        MethodIdentity::new(Token::from_parts(TableId::MethodDef, 4), "Sample.Program", "Run")
    }

    fn thunk() -> MethodIdentity {
        MethodIdentity::new(Token::default(), "System.RuntimeMethodHandle", DEFAULT_SENTINEL)
    }

    #[test]
    fn armed_slot_is_consumed_once() {
        let interceptor = Interceptor::default();
        let guard = interceptor.arm(stub(), thread::current().id()).unwrap();
        assert_eq!(interceptor.state(), InterceptionState::Armed);

        assert_eq!(interceptor.resolve(thunk()), stub());
        assert_eq!(interceptor.state(), InterceptionState::Idle);
        assert_eq!(interceptor.resolve(thunk()), thunk());
        assert_eq!(interceptor.redirections(), 1);
        drop(guard);
    }

    #[test]
    fn other_names_pass_through() {
        let interceptor = Interceptor::default();
        let _guard = interceptor.arm(stub(), thread::current().id()).unwrap();
        let other = MethodIdentity::new(Token::default(), "System.Object", "ToString");
        assert_eq!(interceptor.post_hook(&other), PostHookResult::Keep);
        assert_eq!(interceptor.state(), InterceptionState::Armed);
    }

    #[test]
    fn idle_passes_through() {
        let interceptor = Interceptor::default();
        assert_eq!(interceptor.resolve(thunk()), thunk());
    }

    #[test]
    fn guard_drop_disarms() {
        let interceptor = Interceptor::default();
        {
            let _guard = interceptor.arm(stub(), thread::current().id()).unwrap();
        }
        assert_eq!(interceptor.state(), InterceptionState::Idle);
        assert_eq!(interceptor.resolve(thunk()), thunk());
    }

    #[test]
    fn reentrant_arm_fails() {
        let interceptor = Interceptor::default();
        let _guard = interceptor.arm(stub(), thread::current().id()).unwrap();
        assert!(matches!(
            interceptor.arm(stub(), thread::current().id()),
            Err(Error::InterceptorReentered)
        ));
    }

    #[test]
    fn foreign_thread_does_not_consume() {
        let interceptor = Arc::new(Interceptor::default());
        let _guard = interceptor.arm(stub(), thread::current().id()).unwrap();

        let worker = Arc::clone(&interceptor);
        let seen = thread::spawn(move || worker.resolve(thunk())).join().unwrap();
        assert_eq!(seen, thunk());
        assert_eq!(interceptor.state(), InterceptionState::Armed);
    }

    #[test]
    fn custom_sentinel() {
        let interceptor = Interceptor::new("Dispatch");
        assert_eq!(interceptor.sentinel(), "Dispatch");
        let _guard = interceptor.arm(stub(), thread::current().id()).unwrap();
        assert_eq!(interceptor.resolve(thunk()), thunk());
        let dispatch = MethodIdentity::new(Token::default(), "Host", "Dispatch");
        assert_eq!(interceptor.resolve(dispatch), stub());
    }

    #[test]
    fn global_is_shared() {
        assert!(Arc::ptr_eq(&Interceptor::global(), &Interceptor::global()));
    }
}
