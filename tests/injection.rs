//! End-to-end: weave a module, load it, run the injection engine

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tree_injector::attributes::{self, module_interface, needs, owns, owns_all};
use tree_injector::metadata::{FieldDef, ModuleDef, ModuleImage, TypeDef, TypeRef};
use tree_injector::{
    weave, Asserter, BuildHook, Component, Dependency, Disposable, FactoryCreator, HookError,
    Initializable, Inject, InjectionContext, InjectionError, Instance, LifecycleState, ModuleSet,
    Updatable, WeaveOutcome,
};

type Log = Arc<Mutex<Vec<&'static str>>>;

fn game(name: &str) -> TypeRef {
    TypeRef::new("Game", name)
}

#[derive(Default)]
struct Recorder {
    errors: Mutex<Vec<InjectionError>>,
}

impl Recorder {
    fn errors(&self) -> Vec<InjectionError> {
        self.errors.lock().unwrap().clone()
    }
}

impl Asserter for Recorder {
    fn fail(&self, error: &InjectionError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

fn run(module: &ModuleDef, register: impl FnOnce(&FactoryCreator)) -> (InjectionContext, Arc<Recorder>) {
    let mut modules = ModuleSet::new();
    modules.load(module).unwrap();

    let creator = FactoryCreator::from_modules(&modules).unwrap();
    register(&creator);

    let recorder = Arc::new(Recorder::default());
    let context = InjectionContext::with_asserter(
        Arc::new(modules.type_resolver()),
        Arc::new(creator),
        recorder.clone(),
    );
    (context, recorder)
}

async fn settle(context: &InjectionContext, instance: &Instance) -> Result<(), InjectionError> {
    timeout(Duration::from_secs(5), context.initialized(instance).unwrap().wait())
        .await
        .expect("initialization timed out")
}

fn child_of_type(context: &InjectionContext, owner: &Instance, type_name: &str) -> Instance {
    context
        .children(Some(owner))
        .into_iter()
        .find(|child| child.type_key().as_str() == type_name)
        .unwrap_or_else(|| panic!("{owner} owns no {type_name}"))
}

// =============================================================================
// Scene: module owns system, system owns leaf, leaf needs system
// =============================================================================

#[derive(Default)]
struct Scene;
impl Inject for Scene {}
impl Component for Scene {}

struct System {
    log: Log,
    gate: Option<Arc<Notify>>,
}

impl Inject for System {}

#[async_trait]
impl Initializable for System {
    async fn initialize(&self, _token: CancellationToken) -> Result<(), HookError> {
        match &self.gate {
            Some(gate) => gate.notified().await,
            None => sleep(Duration::from_millis(30)).await,
        }
        self.log.lock().unwrap().push("system");
        Ok(())
    }
}

impl Component for System {
    fn as_initializable(&self) -> Option<&dyn Initializable> {
        Some(self)
    }
}

struct Leaf {
    system: Dependency,
    log: Log,
}

impl Inject for Leaf {
    fn inject(&self, field: &str, dependency: Instance) -> bool {
        match field {
            "system" => self.system.set(dependency),
            _ => false,
        }
    }
}

#[async_trait]
impl Initializable for Leaf {
    async fn initialize(&self, _token: CancellationToken) -> Result<(), HookError> {
        self.log.lock().unwrap().push("leaf");
        Ok(())
    }
}

impl Component for Leaf {
    fn as_initializable(&self) -> Option<&dyn Initializable> {
        Some(self)
    }
}

fn scene_module(ignore_initialization: bool) -> ModuleDef {
    ModuleDef::new("Game")
        .with_type(TypeDef::interface("Game.ISystem"))
        .with_type(
            TypeDef::class("Game.Scene")
                .implementing(module_interface())
                .with_attribute(owns(game("Game.ISystem"))),
        )
        .with_type(
            TypeDef::class("Game.System")
                .implementing(game("Game.ISystem"))
                .with_attribute(owns(game("Game.Leaf"))),
        )
        .with_type(
            TypeDef::class("Game.Leaf").with_field(
                FieldDef::new("system", game("Game.ISystem")).with_attribute(needs(ignore_initialization)),
            ),
        )
}

fn register_scene(creator: &FactoryCreator, log: &Log, gate: Option<Arc<Notify>>) {
    let system_log = log.clone();
    let leaf_log = log.clone();
    creator
        .register_default::<Scene>("Game.Scene")
        .register("Game.System", move || System {
            log: system_log.clone(),
            gate: gate.clone(),
        })
        .register("Game.Leaf", move || Leaf {
            system: Dependency::new(),
            log: leaf_log.clone(),
        });
}

#[tokio::test]
async fn test_leaf_initializes_after_its_system() {
    let mut module = scene_module(false);
    assert_eq!(weave(&mut module).unwrap(), WeaveOutcome::Modified);

    let log = Log::default();
    let (context, recorder) = run(&module, |creator| register_scene(creator, &log, None));

    let scene = context.get_instance(attributes::MODULE, None).unwrap();
    let system = child_of_type(&context, &scene, "Game.System");
    let leaf = child_of_type(&context, &system, "Game.Leaf");

    assert_eq!(leaf.downcast_ref::<Leaf>().unwrap().system.get(), Some(&system));

    settle(&context, &leaf).await.unwrap();
    settle(&context, &scene).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["system", "leaf"]);
    assert_eq!(context.state(&system), Some(LifecycleState::Initialized));
    assert!(recorder.errors().is_empty());
}

#[tokio::test]
async fn test_ignored_need_initializes_concurrently() {
    let mut module = scene_module(true);
    weave(&mut module).unwrap();

    let log = Log::default();
    let gate = Arc::new(Notify::new());
    let (context, _) = run(&module, |creator| register_scene(creator, &log, Some(gate.clone())));

    let scene = context.get_instance(attributes::MODULE, None).unwrap();
    let system = child_of_type(&context, &scene, "Game.System");
    let leaf = child_of_type(&context, &system, "Game.Leaf");

    // the system is still blocked in its initialize hook
    settle(&context, &leaf).await.unwrap();
    assert_eq!(context.state(&system), Some(LifecycleState::Initializing));
    assert_eq!(*log.lock().unwrap(), vec!["leaf"]);

    gate.notify_one();
    settle(&context, &system).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["leaf", "system"]);
}

#[tokio::test]
async fn test_woven_image_runs_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Game.json");
    ModuleImage {
        module: scene_module(false),
        symbols: None,
    }
    .write(&path)
    .unwrap();

    let hook = BuildHook::new();
    assert_eq!(hook.on_compilation_finished(&path, &[]).unwrap(), WeaveOutcome::Modified);
    assert!(hook.on_compilation_finished(&path, &[]).unwrap_err().is_already_processed());

    let mut modules = ModuleSet::new();
    modules.load_image(&path).unwrap();
    let creator = FactoryCreator::from_modules(&modules).unwrap();
    let log = Log::default();
    register_scene(&creator, &log, None);

    let context = InjectionContext::new(Arc::new(modules.type_resolver()), Arc::new(creator));
    let scene = context.get_instance(attributes::MODULE, None).unwrap();
    let system = child_of_type(&context, &scene, "Game.System");
    let leaf = child_of_type(&context, &system, "Game.Leaf");

    settle(&context, &leaf).await.unwrap();
    assert_eq!(context.len(), 3);
}

// =============================================================================
// Ambiguous resolution
// =============================================================================

#[derive(Default)]
struct Weapon;
impl Inject for Weapon {}
impl Component for Weapon {}

fn armory_module() -> ModuleDef {
    let mut module = ModuleDef::new("Game")
        .with_type(TypeDef::interface("Game.IWeapon"))
        .with_type(TypeDef::class("Game.Sword").implementing(game("Game.IWeapon")))
        .with_type(TypeDef::class("Game.Bow").implementing(game("Game.IWeapon")))
        .with_type(TypeDef::class("Game.Armory").with_attribute(owns_all(game("Game.IWeapon"))));
    weave(&mut module).unwrap();
    module
}

fn register_armory(creator: &FactoryCreator) {
    creator
        .register_default::<Weapon>("Game.Armory")
        .register_default::<Weapon>("Game.Sword")
        .register_default::<Weapon>("Game.Bow");
}

#[tokio::test]
async fn test_ambiguous_request_names_type() {
    let (context, recorder) = run(&armory_module(), register_armory);

    let err = context.get_instance("Game.IWeapon", None).unwrap_err();
    assert!(matches!(err, InjectionError::AmbiguousImplementation { .. }));
    assert!(err.to_string().contains("Game.IWeapon"));
    assert_eq!(recorder.errors(), vec![err]);
    assert!(context.is_empty());
}

#[tokio::test]
async fn test_owns_all_creates_every_implementation() {
    let (context, recorder) = run(&armory_module(), register_armory);

    let armory = context.get_instance("Game.Armory", None).unwrap();
    let mut weapons: Vec<String> = context
        .children(Some(&armory))
        .iter()
        .map(|weapon| weapon.type_key().to_string())
        .collect();
    weapons.sort();
    assert_eq!(weapons, vec!["Game.Bow".to_string(), "Game.Sword".to_string()]);

    let again = context.get_instances("Game.IWeapon", Some(&armory)).unwrap();
    assert_eq!(again.len(), 2);
    assert_eq!(context.len(), 3);
    assert!(recorder.errors().is_empty());
}

// =============================================================================
// Update loops
// =============================================================================

#[derive(Default)]
struct Ticker {
    ticks: AtomicUsize,
    cancelled: AtomicBool,
    stopped: Notify,
}

impl Inject for Ticker {}

#[async_trait]
impl Updatable for Ticker {
    async fn update(&self, token: CancellationToken) -> Result<(), HookError> {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.cancelled.store(true, Ordering::SeqCst);
                    self.stopped.notify_one();
                    return Err(HookError::Cancelled);
                }
                _ = sleep(Duration::from_millis(2)) => {
                    self.ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}

impl Component for Ticker {
    fn as_updatable(&self) -> Option<&dyn Updatable> {
        Some(self)
    }
}

#[tokio::test]
async fn test_update_loop_observes_cancellation_on_dispose() {
    let mut module = ModuleDef::new("Game")
        .with_type(
            TypeDef::class("Game.Arena")
                .implementing(module_interface())
                .with_attribute(owns(game("Game.Ticker"))),
        )
        .with_type(TypeDef::class("Game.Ticker"));
    weave(&mut module).unwrap();

    let (context, recorder) = run(&module, |creator| {
        creator
            .register_default::<Scene>("Game.Arena")
            .register_default::<Ticker>("Game.Ticker");
    });

    let arena = context.get_instance(attributes::MODULE, None).unwrap();
    let ticker = child_of_type(&context, &arena, "Game.Ticker");
    settle(&context, &arena).await.unwrap();
    settle(&context, &ticker).await.unwrap();

    let object = ticker.downcast_arc::<Ticker>().unwrap();
    timeout(Duration::from_secs(5), async {
        while object.ticks.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("update loop never ticked");

    context.dispose_instance(&arena).unwrap();

    timeout(Duration::from_secs(5), object.stopped.notified())
        .await
        .expect("update loop never stopped");
    assert!(object.cancelled.load(Ordering::SeqCst));
    assert!(context.is_empty());
    assert!(recorder.errors().is_empty());
}

// =============================================================================
// Cycles
// =============================================================================

#[derive(Default)]
struct Peer {
    other: Dependency,
}

impl Inject for Peer {
    fn inject(&self, field: &str, dependency: Instance) -> bool {
        match field {
            "other" => self.other.set(dependency),
            _ => false,
        }
    }
}

impl Component for Peer {}

#[tokio::test]
async fn test_needs_cycle_cites_both_instances() {
    let mut module = ModuleDef::new("Game")
        .with_type(TypeDef::interface("Game.IA"))
        .with_type(TypeDef::interface("Game.IB"))
        .with_type(
            TypeDef::class("Game.Loop")
                .implementing(module_interface())
                .with_attribute(owns(game("Game.IA")))
                .with_attribute(owns(game("Game.IB"))),
        )
        .with_type(
            TypeDef::class("Game.A")
                .implementing(game("Game.IA"))
                .with_field(FieldDef::new("other", game("Game.IB")).with_attribute(needs(false))),
        )
        .with_type(
            TypeDef::class("Game.B")
                .implementing(game("Game.IB"))
                .with_field(FieldDef::new("other", game("Game.IA")).with_attribute(needs(false))),
        );
    weave(&mut module).unwrap();

    let (context, recorder) = run(&module, |creator| {
        creator
            .register_default::<Scene>("Game.Loop")
            .register_default::<Peer>("Game.A")
            .register_default::<Peer>("Game.B");
    });

    let root = context.get_instance(attributes::MODULE, None).unwrap();
    let a = child_of_type(&context, &root, "Game.A");
    let b = child_of_type(&context, &root, "Game.B");
    assert_eq!(a.downcast_ref::<Peer>().unwrap().other.get(), Some(&b));

    match settle(&context, &a).await.unwrap_err() {
        InjectionError::DependencyCycle { chain } => {
            assert!(chain.contains(&a.to_string()), "{chain}");
            assert!(chain.contains(&b.to_string()), "{chain}");
        }
        other => panic!("unexpected error: {other}"),
    }

    let errors = recorder.errors();
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|error| matches!(error, InjectionError::DependencyCycle { .. })));
}

// =============================================================================
// Disposal isolation
// =============================================================================

#[derive(Default)]
struct Fragile;
impl Inject for Fragile {}

impl Disposable for Fragile {
    fn dispose(&self) -> Result<(), HookError> {
        panic!("fragile dispose");
    }
}

impl Component for Fragile {
    fn as_disposable(&self) -> Option<&dyn Disposable> {
        Some(self)
    }
}

struct Sturdy {
    disposals: Arc<AtomicUsize>,
}

impl Inject for Sturdy {}

impl Disposable for Sturdy {
    fn dispose(&self) -> Result<(), HookError> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Component for Sturdy {
    fn as_disposable(&self) -> Option<&dyn Disposable> {
        Some(self)
    }
}

#[tokio::test]
async fn test_panicking_dispose_does_not_stop_siblings() {
    let mut module = ModuleDef::new("Game")
        .with_type(
            TypeDef::class("Game.Shelf")
                .implementing(module_interface())
                .with_attribute(owns(game("Game.Fragile")))
                .with_attribute(owns(game("Game.Sturdy"))),
        )
        .with_type(TypeDef::class("Game.Fragile"))
        .with_type(TypeDef::class("Game.Sturdy"));
    weave(&mut module).unwrap();

    let disposals = Arc::new(AtomicUsize::new(0));
    let counter = disposals.clone();
    let (context, recorder) = run(&module, move |creator| {
        creator
            .register_default::<Scene>("Game.Shelf")
            .register_default::<Fragile>("Game.Fragile")
            .register("Game.Sturdy", move || Sturdy {
                disposals: counter.clone(),
            });
    });

    let shelf = context.get_instance(attributes::MODULE, None).unwrap();
    assert_eq!(context.children(Some(&shelf)).len(), 2);

    context.dispose_instance(&shelf).unwrap();

    assert_eq!(disposals.load(Ordering::SeqCst), 1);
    assert!(context.is_empty());
    assert!(recorder.errors().is_empty());
}
