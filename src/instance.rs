//! Instance handles and per-instance lifecycle bookkeeping

use crate::component::Component;
use crate::error::{InjectionError, Result};
use crate::loader::TypeBinding;
use crate::type_key::TypeKey;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Instance
// =============================================================================

/// Counter for instance ids (lock-free)
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(1);

struct InstanceCell {
    id: u64,
    type_key: TypeKey,
    object: Arc<dyn Component>,
    binding: Arc<TypeBinding>,
}

/// Handle to an object managed by the engine.
///
/// Clones share the same object. Equality and hashing follow reference
/// identity: two handles are equal only when they come from the same
/// [`Instance::new`] call.
#[derive(Clone)]
pub struct Instance(Arc<InstanceCell>);

impl Instance {
    /// Wrap a component created outside of the engine
    pub fn new(type_key: TypeKey, object: Arc<dyn Component>, binding: Arc<TypeBinding>) -> Self {
        Self(Arc::new(InstanceCell {
            id: INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed),
            type_key,
            object,
            binding,
        }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Concrete type of the instance
    #[inline]
    pub fn type_key(&self) -> &TypeKey {
        &self.0.type_key
    }

    #[inline]
    pub fn object(&self) -> &Arc<dyn Component> {
        &self.0.object
    }

    #[inline]
    pub fn binding(&self) -> &Arc<TypeBinding> {
        &self.0.binding
    }

    /// Borrow the object as its concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        let object: &dyn Component = self.0.object.as_ref();
        object.as_any().downcast_ref::<T>()
    }

    /// Share the object as its concrete type
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0.object).into_any_arc().downcast::<T>().ok()
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Instance {}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.type_key.short_name(), self.0.id)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.0.id)
            .field("type", &self.0.type_key.as_str())
            .finish()
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle state of an instance; never regresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    UnResolved,
    Resolving,
    Initializing,
    Initialized,
}

/// Why an instance stopped before reaching `Initialized`
#[derive(Debug, Clone)]
pub(crate) enum Halt {
    Cancelled,
    Failed(InjectionError),
}

#[derive(Debug)]
pub(crate) struct Progress {
    state: LifecycleState,
    halt: Option<Halt>,
}

/// A need recorded while resolving
#[derive(Debug, Clone)]
pub(crate) struct Need {
    pub dependency: Instance,
    pub ignore_initialization: bool,
}

/// Per-instance runtime bookkeeping
pub(crate) struct InstanceData {
    progress: watch::Sender<Progress>,
    needs: Mutex<Vec<Need>>,
    token: CancellationToken,
}

impl InstanceData {
    pub(crate) fn new(token: CancellationToken) -> Self {
        let (progress, _) = watch::channel(Progress {
            state: LifecycleState::UnResolved,
            halt: None,
        });
        Self {
            progress,
            needs: Mutex::new(Vec::new()),
            token,
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.progress.borrow().state
    }

    /// Move forward to `state`; returns `false` if already there or beyond
    pub(crate) fn advance(&self, state: LifecycleState) -> bool {
        self.progress.send_if_modified(|progress| {
            if progress.state < state {
                progress.state = state;
                true
            } else {
                false
            }
        })
    }

    /// Stop before initialization completes; the first halt wins
    pub(crate) fn halt(&self, halt: Halt) {
        self.progress.send_if_modified(|progress| {
            if progress.halt.is_none() && progress.state < LifecycleState::Initialized {
                progress.halt = Some(halt);
                true
            } else {
                false
            }
        });
    }

    /// Record a need; a later lookup of the same dependency overrides the flag
    pub(crate) fn record_need(&self, dependency: Instance, ignore_initialization: bool) {
        let mut needs = self.needs.lock().unwrap_or_else(PoisonError::into_inner);
        match needs.iter_mut().find(|need| need.dependency == dependency) {
            Some(need) => need.ignore_initialization = ignore_initialization,
            None => needs.push(Need {
                dependency,
                ignore_initialization,
            }),
        }
    }

    pub(crate) fn needs(&self) -> Vec<Need> {
        self.needs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn milestone(&self, instance: &Instance, target: LifecycleState) -> Milestone {
        Milestone {
            receiver: self.progress.subscribe(),
            target,
            instance: instance.to_string(),
        }
    }
}

/// Awaitable lifecycle milestone of one instance.
///
/// The "resolved" milestone is reached when the instance enters
/// [`LifecycleState::Initializing`], the "initialized" one when it enters
/// [`LifecycleState::Initialized`]. Waiting fails if the instance is disposed
/// first or its initialization fails.
#[derive(Clone)]
pub struct Milestone {
    receiver: watch::Receiver<Progress>,
    target: LifecycleState,
    instance: String,
}

impl Milestone {
    fn name(&self) -> &'static str {
        match self.target {
            LifecycleState::Initialized => "initialized",
            _ => "resolved",
        }
    }

    fn cancelled(&self) -> InjectionError {
        InjectionError::Cancelled {
            instance: self.instance.clone(),
            milestone: self.name().to_string(),
        }
    }

    /// Whether the milestone is already reached
    pub fn is_reached(&self) -> bool {
        self.receiver.borrow().state >= self.target
    }

    /// Wait until the milestone is reached
    pub async fn wait(mut self) -> Result<()> {
        loop {
            let (reached, halt) = {
                let progress = self.receiver.borrow_and_update();
                (progress.state >= self.target, progress.halt.clone())
            };
            if reached {
                return Ok(());
            }
            match halt {
                Some(Halt::Cancelled) => return Err(self.cancelled()),
                Some(Halt::Failed(error)) => return Err(error),
                None => {}
            }

            if self.receiver.changed().await.is_err() {
                return if self.receiver.borrow().state >= self.target {
                    Ok(())
                } else {
                    Err(self.cancelled())
                };
            }
        }
    }
}

impl fmt::Debug for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Milestone")
            .field("instance", &self.instance)
            .field("milestone", &self.name())
            .field("reached", &self.is_reached())
            .finish()
    }
}
