//! Integration tests for plugframe.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use plugframe::{
    Context, ContextConfig, DescriptorBuilder, Error, ExtensionDecl, ExtensionPointDecl,
    PluginContext, PluginDescriptor, PluginLifecycle, PluginState, ReconfigFlags,
    RegistryConfig, RunMode, RunStatus, StaticLoader,
};

type Log = Arc<Mutex<Vec<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Runtime that logs its lifecycle calls.
struct Logged {
    log: Log,
}

impl PluginLifecycle for Logged {
    fn on_start(&mut self, ctx: &PluginContext<'_>) -> plugframe::Result<()> {
        self.log.lock().push(format!("start {}", ctx.plugin_id()));
        Ok(())
    }

    fn on_stop(&mut self, ctx: &PluginContext<'_>) -> plugframe::Result<()> {
        self.log.lock().push(format!("stop {}", ctx.plugin_id()));
        Ok(())
    }
}

fn logging_context(log: &Log) -> Context {
    init_tracing();
    let log = log.clone();
    let loader = StaticLoader::new().with("logged", move || Logged { log: log.clone() });
    Context::with_loader(ContextConfig::default(), Arc::new(loader)).unwrap()
}

fn plugin(id: &str, version: &str, requires: &[(&str, &str)]) -> PluginDescriptor {
    let mut builder = DescriptorBuilder::new(id, version).runtime("logged");
    for (dep, req) in requires {
        builder = builder.requires(*dep, *req);
    }
    builder.build().unwrap()
}

#[test]
fn test_start_activates_closure_in_order() {
    let log = Log::default();
    let ctx = logging_context(&log);
    ctx.install_plugin(plugin("a", "1.0.0", &[("b", "^1")])).unwrap();
    ctx.install_plugin(plugin("b", "1.0.0", &[("c", "^1")])).unwrap();
    ctx.install_plugin(plugin("c", "1.0.0", &[])).unwrap();
    ctx.install_plugin(plugin("unrelated", "1.0.0", &[])).unwrap();

    ctx.start("a").unwrap();

    assert_eq!(*log.lock(), vec!["start c", "start b", "start a"]);
    assert_eq!(
        ctx.active_plugins(),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
    assert_eq!(ctx.plugin_state("unrelated"), PluginState::Installed);
}

#[test]
fn test_missing_dependency_leaves_plugin_installed() {
    let log = Log::default();
    let ctx = logging_context(&log);
    ctx.install_plugin(plugin("b", "1.0.0", &[("c", "^1")])).unwrap();

    let err = ctx.start("b").unwrap_err();
    match err {
        Error::UnsatisfiedDependency {
            ref plugin,
            ref dependency,
            ..
        } => {
            assert_eq!(plugin, "b");
            assert_eq!(dependency, "c");
        }
        ref other => panic!("unexpected error: {}", other),
    }

    assert_eq!(ctx.plugin_state("b"), PluginState::Installed);
    assert!(ctx.plugin_info("b").unwrap().last_error.is_some());
    assert!(log.lock().is_empty());
}

#[test]
fn test_incompatible_version_is_unsatisfied() {
    let log = Log::default();
    let ctx = logging_context(&log);
    ctx.install_plugin(plugin("c", "2.0.0", &[])).unwrap();
    ctx.install_plugin(plugin("b", "1.0.0", &[("c", "^1")])).unwrap();

    assert!(matches!(
        ctx.start("b"),
        Err(Error::UnsatisfiedDependency { .. })
    ));
    assert_eq!(ctx.plugin_state("c"), PluginState::Installed);
}

#[test]
fn test_cycle_leaves_both_installed() {
    let log = Log::default();
    let ctx = logging_context(&log);
    ctx.install_plugin(plugin("a", "1.0.0", &[("b", "*")])).unwrap();
    ctx.install_plugin(plugin("b", "1.0.0", &[("a", "*")])).unwrap();

    let err = ctx.start("a").unwrap_err();
    assert!(err.is_structural());
    match err {
        Error::CyclicDependency { cycle } => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(ctx.plugin_state("a"), PluginState::Installed);
    assert_eq!(ctx.plugin_state("b"), PluginState::Installed);
}

#[test]
fn test_optional_dependency() {
    let log = Log::default();
    let ctx = logging_context(&log);
    let host = DescriptorBuilder::new("host", "1.0.0")
        .runtime("logged")
        .optionally_requires("addon", "^1")
        .build()
        .unwrap();
    ctx.install_plugin(host).unwrap();

    ctx.start("host").unwrap();
    assert_eq!(*log.lock(), vec!["start host"]);

    ctx.stop("host").unwrap();
    log.lock().clear();
    ctx.install_plugin(plugin("addon", "1.0.0", &[])).unwrap();
    ctx.start("host").unwrap();
    assert_eq!(*log.lock(), vec!["start addon", "start host"]);
}

/// Registers a recurring run function counting its invocations.
struct Ticker {
    ticks: Arc<AtomicUsize>,
}

impl PluginLifecycle for Ticker {
    fn on_start(&mut self, ctx: &PluginContext<'_>) -> plugframe::Result<()> {
        let ticks = self.ticks.clone();
        ctx.register_run_function(RunMode::Recurring, move |_| {
            ticks.fetch_add(1, Ordering::SeqCst);
            RunStatus::Continue
        })?;
        Ok(())
    }
}

#[test]
fn test_recurring_run_function_stops_with_owner() {
    init_tracing();
    let ticks = Arc::new(AtomicUsize::new(0));
    let factory_ticks = ticks.clone();
    let loader = StaticLoader::new().with("ticker", move || Ticker {
        ticks: factory_ticks.clone(),
    });
    let ctx = Context::with_loader(ContextConfig::default(), Arc::new(loader)).unwrap();
    ctx.install_plugin(
        DescriptorBuilder::new("x", "1.0.0")
            .runtime("ticker")
            .build()
            .unwrap(),
    )
    .unwrap();
    ctx.start("x").unwrap();

    assert!(ctx.run_step().unwrap());
    assert!(ctx.run_step().unwrap());
    assert_eq!(ticks.load(Ordering::SeqCst), 2);

    ctx.stop("x").unwrap();
    assert_eq!(ctx.pending_run_functions(), 0);
    assert!(!ctx.run_step().unwrap());
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

#[test]
fn test_run_function_ordering_and_reregistration() {
    init_tracing();
    let log = Log::default();
    let ctx = Context::new(ContextConfig::default()).unwrap();
    ctx.install_plugin(DescriptorBuilder::new("p", "1.0.0").build().unwrap())
        .unwrap();
    ctx.start("p").unwrap();

    let handle = ctx.plugin_context("p");
    let first = log.clone();
    handle
        .register_run_function(RunMode::Once, move |pctx| {
            first.lock().push("one".to_string());
            let third = first.clone();
            pctx.register_run_function(RunMode::Once, move |_| {
                third.lock().push("three".to_string());
                RunStatus::Done
            })
            .unwrap();
            RunStatus::Done
        })
        .unwrap();
    let second = log.clone();
    handle
        .register_run_function(RunMode::Once, move |_| {
            second.lock().push("two".to_string());
            RunStatus::Continue
        })
        .unwrap();

    assert!(ctx.run_step().unwrap());
    assert_eq!(*log.lock(), vec!["one", "two"]);

    assert!(!ctx.run_step().unwrap());
    assert_eq!(*log.lock(), vec!["one", "two", "three"]);
}

#[test]
fn test_nested_run_step_returns_immediately() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = Context::new(ContextConfig::default()).unwrap();
    ctx.install_plugin(DescriptorBuilder::new("p", "1.0.0").build().unwrap())
        .unwrap();
    ctx.start("p").unwrap();

    let counter = calls.clone();
    ctx.plugin_context("p")
        .register_run_function(RunMode::Recurring, move |pctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            pctx.context().run_step().unwrap();
            RunStatus::Done
        })
        .unwrap();

    assert_eq!(ctx.run_until_idle().unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_run_function_rejected_when_stopped() {
    let ctx = Context::new(ContextConfig::default()).unwrap();
    ctx.install_plugin(DescriptorBuilder::new("p", "1.0.0").build().unwrap())
        .unwrap();

    let err = ctx.plugin_context("p")
        .register_run_function(RunMode::Once, |_| RunStatus::Done)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[test]
fn test_cancel_run_function() {
    let ctx = Context::new(ContextConfig::default()).unwrap();
    ctx.install_plugin(DescriptorBuilder::new("p", "1.0.0").build().unwrap())
        .unwrap();
    ctx.start("p").unwrap();

    let handle = ctx.plugin_context("p")
        .register_run_function(RunMode::Recurring, |_| RunStatus::Continue)
        .unwrap();
    assert_eq!(ctx.pending_run_functions(), 1);
    assert!(ctx.cancel_run_function(handle));
    assert_eq!(ctx.run_until_idle().unwrap(), 0);
}

#[test]
fn test_stop_never_leaves_active_dependent() {
    let log = Log::default();
    let ctx = Arc::new(logging_context(&log));
    ctx.install_plugin(plugin("base", "1.0.0", &[])).unwrap();
    ctx.install_plugin(plugin("mid", "1.0.0", &[("base", "*")])).unwrap();
    ctx.install_plugin(plugin("top", "1.0.0", &[("mid", "*")])).unwrap();
    ctx.install_plugin(plugin("side", "1.0.0", &[("base", "*")])).unwrap();
    ctx.start("top").unwrap();
    ctx.start("side").unwrap();

    let violated = Arc::new(AtomicBool::new(false));
    let weak: Weak<Context> = Arc::downgrade(&ctx);
    let flag = violated.clone();
    ctx.on_event(move |event| {
        let Some(ctx) = weak.upgrade() else {
            return;
        };
        if event.new == PluginState::Stopping {
            let active_dependent = ctx.dependents(&event.plugin).iter().any(|d| ctx.is_active(d));
            if active_dependent {
                flag.store(true, Ordering::SeqCst);
            }
        }
    });

    ctx.stop("base").unwrap();

    assert!(!violated.load(Ordering::SeqCst));
    assert!(ctx.active_plugins().is_empty());
    let log = log.lock();
    let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
    assert!(position("stop top") < position("stop mid"));
    assert!(position("stop mid") < position("stop base"));
    assert!(position("stop side") < position("stop base"));
}

#[test]
fn test_destroy_is_idempotent() {
    let log = Log::default();
    let ctx = logging_context(&log);
    ctx.install_plugin(plugin("b", "1.0.0", &[])).unwrap();
    ctx.install_plugin(plugin("a", "1.0.0", &[("b", "*")])).unwrap();
    ctx.start("a").unwrap();
    log.lock().clear();

    ctx.destroy().unwrap();
    assert_eq!(*log.lock(), vec!["stop a", "stop b"]);
    assert!(ctx.plugins().is_empty());

    ctx.destroy().unwrap();
    assert_eq!(log.lock().len(), 2);
    assert!(matches!(
        ctx.install_plugin(plugin("c", "1.0.0", &[])),
        Err(Error::ContextDestroyed)
    ));
}

#[test]
fn test_drop_stops_plugins() {
    let log = Log::default();
    {
        let ctx = logging_context(&log);
        ctx.install_plugin(plugin("a", "1.0.0", &[])).unwrap();
        ctx.start("a").unwrap();
    }
    assert_eq!(*log.lock(), vec!["start a", "stop a"]);
}

#[test]
fn test_upgrade_round_trip() {
    let log = Log::default();
    let ctx = Arc::new(logging_context(&log));
    ctx.install_plugin(plugin("b", "1.0.0", &[])).unwrap();
    ctx.install_plugin(plugin("a", "1.0.0", &[("b", ">=1")])).unwrap();
    ctx.start("a").unwrap();

    let violated = Arc::new(AtomicBool::new(false));
    let weak = Arc::downgrade(&ctx);
    let flag = violated.clone();
    ctx.on_event(move |event| {
        let Some(ctx) = weak.upgrade() else {
            return;
        };
        if ctx.is_active("a") && !ctx.is_active("b") {
            flag.store(true, Ordering::SeqCst);
        }
        if event.plugin == "b" && event.new == PluginState::Uninstalled && ctx.is_active("a") {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let flags = ReconfigFlags::new().with_restart_active_on_upgrade(true);
    let report = ctx.upgrade_plugin_with(plugin("b", "2.0.0", &[]), flags).unwrap();

    assert!(!violated.load(Ordering::SeqCst));
    assert_eq!(report.upgraded, vec!["b".to_string()]);
    assert_eq!(report.stopped, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(report.restarted, vec!["b".to_string(), "a".to_string()]);
    assert!(report.is_clean());

    assert!(ctx.is_active("a"));
    assert!(ctx.is_active("b"));
    assert_eq!(ctx.lookup("b").unwrap().version.to_string(), "2.0.0");
}

#[test]
fn test_upgrade_breaking_dependents() {
    let log = Log::default();
    let ctx = logging_context(&log);
    ctx.install_plugin(plugin("b", "1.0.0", &[])).unwrap();
    ctx.install_plugin(plugin("a", "1.0.0", &[("b", "^1")])).unwrap();
    ctx.start("a").unwrap();

    let flags = ReconfigFlags::new().with_restart_active_on_upgrade(true);
    let report = ctx.upgrade_plugin_with(plugin("b", "2.0.0", &[]), flags).unwrap();

    assert_eq!(report.restarted, vec!["b".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].plugin, "a");
    assert!(ctx.is_active("b"));
    assert!(!ctx.is_active("a"));
}

/// Fails its own activation.
struct Refusing;

impl PluginLifecycle for Refusing {
    fn on_start(&mut self, _ctx: &PluginContext<'_>) -> plugframe::Result<()> {
        Err(Error::plugin("not today"))
    }
}

#[test]
fn test_activation_failure_is_contained() {
    init_tracing();
    let log = Log::default();
    let factory_log = log.clone();
    let loader = StaticLoader::new()
        .with("logged", move || Logged {
            log: factory_log.clone(),
        })
        .with("refusing", || Refusing);
    let ctx = Context::with_loader(ContextConfig::default(), Arc::new(loader)).unwrap();

    ctx.install_plugin(plugin("sibling", "1.0.0", &[])).unwrap();
    ctx.install_plugin(
        DescriptorBuilder::new("target", "1.0.0")
            .runtime("refusing")
            .requires("sibling", "*")
            .build()
            .unwrap(),
    )
    .unwrap();

    let err = ctx.start("target").unwrap_err();
    assert!(matches!(err, Error::ActivationFailed { ref plugin, .. } if plugin == "target"));

    assert!(ctx.is_active("sibling"));
    assert_eq!(ctx.plugin_state("target"), PluginState::Resolved);
    let info = ctx.plugin_info("target").unwrap();
    assert!(info.last_error.unwrap().contains("not today"));
}

/// Reads startup arguments and extension contributions while starting.
struct Inspector {
    seen: Log,
}

impl PluginLifecycle for Inspector {
    fn on_start(&mut self, ctx: &PluginContext<'_>) -> plugframe::Result<()> {
        let mut seen = self.seen.lock();
        seen.extend(ctx.args().iter().cloned());
        for ext in ctx.extensions("menu") {
            seen.push(format!(
                "{} {}",
                ext.id.unwrap_or_default(),
                ext.config.get("label").cloned().unwrap_or_default()
            ));
        }
        Ok(())
    }
}

#[test]
fn test_args_and_extensions() {
    init_tracing();
    let seen = Log::default();
    let factory_seen = seen.clone();
    let loader = StaticLoader::new().with("inspector", move || Inspector {
        seen: factory_seen.clone(),
    });
    let config = ContextConfig::new().with_args(["--initial"]);
    let ctx = Context::with_loader(config, Arc::new(loader)).unwrap();
    ctx.set_args(["--profile", "dev"]).unwrap();

    ctx.install_plugin(
        DescriptorBuilder::new("ui", "1.0.0")
            .runtime("inspector")
            .extension_point(ExtensionPointDecl::new("menu"))
            .build()
            .unwrap(),
    )
    .unwrap();
    ctx.install_plugin(
        DescriptorBuilder::new("files", "1.0.0")
            .requires("ui", "^1")
            .extension(
                ExtensionDecl::new("ui.menu")
                    .with_id("open")
                    .with_config("label", "Open"),
            )
            .build()
            .unwrap(),
    )
    .unwrap();

    assert!(ctx.extension_point("ui.menu").is_some());
    assert_eq!(ctx.extensions("ui.menu").len(), 1);

    ctx.start("ui").unwrap();
    assert_eq!(*seen.lock(), vec!["--profile", "dev", "files.open Open"]);

    assert!(matches!(
        ctx.set_args(["--late"]),
        Err(Error::InvalidState { .. })
    ));

    ctx.uninstall_plugin("files").unwrap();
    assert!(ctx.extensions("ui.menu").is_empty());
}

#[test]
fn test_uninstall_in_use_by_dependents() {
    let log = Log::default();
    let ctx = logging_context(&log);
    ctx.install_plugin(plugin("b", "1.0.0", &[])).unwrap();
    ctx.install_plugin(plugin("a", "1.0.0", &[("b", "*")])).unwrap();
    ctx.start("a").unwrap();

    let err = ctx
        .uninstall_plugin_with("b", ReconfigFlags::new().with_cascade_stop(false))
        .unwrap_err();
    assert!(matches!(err, Error::InUseByDependents { .. }));
    assert!(ctx.is_active("a") && ctx.is_active("b"));

    assert!(matches!(ctx.uninstall("b"), Err(Error::PluginActive(_))));
}

#[test]
fn test_registry_full() {
    let config = ContextConfig::new().with_registry(RegistryConfig::new().with_max_plugins(1));
    let ctx = Context::new(config).unwrap();
    ctx.install_plugin(DescriptorBuilder::new("a", "1.0.0").build().unwrap())
        .unwrap();

    let err = ctx
        .install_plugin(DescriptorBuilder::new("b", "1.0.0").build().unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::RegistryFull(1)));
}

/// Installs and starts another plugin from inside its own activation.
struct Spawner;

impl PluginLifecycle for Spawner {
    fn on_start(&mut self, ctx: &PluginContext<'_>) -> plugframe::Result<()> {
        let context = ctx.context();
        context.install_plugin(DescriptorBuilder::new("child", "1.0.0").build()?)?;
        context.start("child")
    }
}

#[test]
fn test_reentrant_calls_from_plugin_code() {
    init_tracing();
    let loader = StaticLoader::new().with("spawner", || Spawner);
    let ctx = Context::with_loader(ContextConfig::default(), Arc::new(loader)).unwrap();
    ctx.install_plugin(
        DescriptorBuilder::new("parent", "1.0.0")
            .runtime("spawner")
            .build()
            .unwrap(),
    )
    .unwrap();

    ctx.start("parent").unwrap();

    assert!(ctx.is_active("parent"));
    assert!(ctx.is_active("child"));
}

#[test]
fn test_lifecycle_events() {
    let log = Log::default();
    let ctx = logging_context(&log);
    let events = Log::default();
    let sink = events.clone();
    ctx.on_event(move |event| {
        sink.lock()
            .push(format!("{} {}", event.plugin, event.event_name()));
    });

    ctx.install_plugin(plugin("a", "1.0.0", &[])).unwrap();
    ctx.start("a").unwrap();
    ctx.uninstall_plugin("a").unwrap();

    assert_eq!(
        *events.lock(),
        vec![
            "a installed",
            "a resolved",
            "a starting",
            "a started",
            "a stopping",
            "a stopped",
            "a uninstalled",
        ]
    );
}

#[test]
fn test_listener_drives_context_while_others_subscribe() {
    let log = Log::default();
    let ctx = Arc::new(logging_context(&log));
    let weak = Arc::downgrade(&ctx);
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    ctx.on_event(move |event| {
        if event.plugin != "a" || event.new != PluginState::Installed {
            return;
        }
        if flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(ctx) = weak.upgrade() else {
            return;
        };
        let subscriber = ctx.clone();
        std::thread::spawn(move || subscriber.on_event(|_| {}))
            .join()
            .unwrap();
        ctx.on_event(|_| {});
        ctx.install_plugin(plugin("b", "1.0.0", &[])).unwrap();
    });

    ctx.install_plugin(plugin("a", "1.0.0", &[])).unwrap();

    assert!(fired.load(Ordering::SeqCst));
    assert!(ctx.lookup("b").is_some());
}

#[test]
fn test_transitive_missing_dependency_spares_siblings() {
    let log = Log::default();
    let ctx = logging_context(&log);
    ctx.install_plugin(plugin("a", "1.0.0", &[("b", "*"), ("d", "*")])).unwrap();
    ctx.install_plugin(plugin("b", "1.0.0", &[])).unwrap();
    ctx.install_plugin(plugin("d", "1.0.0", &[("x", "*")])).unwrap();

    let err = ctx.start("a").unwrap_err();
    assert!(matches!(err, Error::DependencyStartFailed { ref dependency, .. } if dependency == "d"));

    assert!(ctx.is_active("b"));
    assert_eq!(*log.lock(), vec!["start b"]);
    assert!(ctx
        .plugin_info("d")
        .unwrap()
        .last_error
        .unwrap()
        .contains("requires x"));
    assert_eq!(ctx.plugin_state("d"), PluginState::Installed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers() {
    init_tracing();
    let ctx = Arc::new(Context::new(ContextConfig::default()).unwrap());
    ctx.install_plugin(DescriptorBuilder::new("shared", "1.0.0").build().unwrap())
        .unwrap();

    let mut tasks = Vec::new();
    for n in 0..8 {
        let ctx = ctx.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let id = format!("worker-{}", n);
            let descriptor = DescriptorBuilder::new(id.as_str(), "1.0.0")
                .requires("shared", "^1")
                .build()
                .unwrap();
            ctx.install_plugin(descriptor).unwrap();
            for _ in 0..10 {
                ctx.start(&id).unwrap();
                assert!(ctx.is_active("shared"));
                ctx.run_step().unwrap();
                ctx.stop(&id).unwrap();
            }
            id
        }));
    }

    let mut finished = Vec::new();
    for task in tasks {
        finished.push(task.await.unwrap());
    }

    assert_eq!(finished.len(), 8);
    assert_eq!(ctx.plugins().len(), 9);
    for id in finished {
        assert_eq!(ctx.plugin_state(&id), PluginState::Resolved);
    }
    assert!(ctx.is_active("shared"));
}

#[cfg(feature = "serde")]
mod scan_tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write_plugin(collection: &Path, dir: &str, id: &str, version: &str, requires: Option<&str>) {
        let path = collection.join(dir);
        fs::create_dir_all(&path).unwrap();
        let mut content = format!("id = \"{}\"\nversion = \"{}\"\n", id, version);
        if let Some(dep) = requires {
            content.push_str(&format!("\n[[dependencies]]\nid = \"{}\"\nversion = \"*\"\n", dep));
        }
        fs::write(path.join("plugin.toml"), content).unwrap();
    }

    #[test]
    fn test_scan_installs_highest_version() {
        init_tracing();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_plugin(first.path(), "core", "core", "1.0.0", None);
        write_plugin(first.path(), "app", "app", "1.0.0", Some("core"));
        write_plugin(second.path(), "core-next", "core", "1.2.0", None);
        fs::create_dir_all(second.path().join("empty")).unwrap();

        let config = ContextConfig::new()
            .with_collection(first.path())
            .with_collection(second.path());
        let ctx = Context::new(config).unwrap();

        let report = ctx.scan_plugins().unwrap();
        let mut installed = report.installed.clone();
        installed.sort();
        assert_eq!(installed, vec!["app".to_string(), "core".to_string()]);
        assert_eq!(ctx.lookup("core").unwrap().version.to_string(), "1.2.0");

        let info = ctx.plugin_info("app").unwrap();
        assert_eq!(info.collection.as_deref(), Some(first.path()));

        let report = ctx.scan_plugins().unwrap();
        assert!(report.is_noop());
    }

    #[test]
    fn test_scan_upgrades_when_enabled() {
        init_tracing();
        let collection = tempfile::tempdir().unwrap();
        write_plugin(collection.path(), "core", "core", "1.0.0", None);
        write_plugin(collection.path(), "app", "app", "1.0.0", Some("core"));

        let ctx = Context::new(ContextConfig::new().with_collection(collection.path())).unwrap();
        ctx.scan_plugins().unwrap();
        ctx.start("app").unwrap();

        write_plugin(collection.path(), "core", "core", "2.0.0", None);
        let report = ctx.scan_plugins().unwrap();
        assert!(report.upgraded.is_empty());
        assert_eq!(ctx.lookup("core").unwrap().version.to_string(), "1.0.0");

        write_plugin(collection.path(), "core", "core", "2.1.0", None);
        let flags = ReconfigFlags::new()
            .with_upgrade(true)
            .with_restart_active_on_upgrade(true);
        let report = ctx.scan_plugins_with(flags).unwrap();

        assert_eq!(report.upgraded, vec!["core".to_string()]);
        assert_eq!(ctx.lookup("core").unwrap().version.to_string(), "2.1.0");
        assert!(ctx.is_active("app"));
        assert!(ctx.is_active("core"));
    }

    #[test]
    fn test_skipped_upgrade_is_offered_again() {
        init_tracing();
        let collection = tempfile::tempdir().unwrap();
        write_plugin(collection.path(), "p", "p", "1.0.0", None);

        let ctx = Context::new(ContextConfig::new().with_collection(collection.path())).unwrap();
        ctx.scan_plugins().unwrap();

        write_plugin(collection.path(), "p", "p", "2.0.0", None);
        let report = ctx.scan_plugins().unwrap();
        assert!(report.upgraded.is_empty());
        assert_eq!(ctx.lookup("p").unwrap().version.to_string(), "1.0.0");

        let flags = ReconfigFlags::new().with_upgrade(true);
        let report = ctx.scan_plugins_with(flags).unwrap();
        assert_eq!(report.upgraded, vec!["p".to_string()]);
        assert_eq!(ctx.lookup("p").unwrap().version.to_string(), "2.0.0");

        assert!(ctx.scan_plugins_with(flags).unwrap().is_noop());
    }

    #[test]
    fn test_scan_skips_broken_descriptors() {
        init_tracing();
        let collection = tempfile::tempdir().unwrap();
        write_plugin(collection.path(), "good", "good", "1.0.0", None);
        let broken = collection.path().join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("plugin.toml"), "id = \n").unwrap();

        let ctx = Context::new(ContextConfig::new().with_collection(collection.path())).unwrap();
        let report = ctx.scan_plugins().unwrap();

        assert_eq!(report.installed, vec!["good".to_string()]);
    }

    #[test]
    fn test_context_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plugframe.toml");
        fs::write(
            &file,
            "args = [\"--safe\"]\n\n[flags]\ncascade_stop = false\n",
        )
        .unwrap();

        let config = ContextConfig::from_file(&file).unwrap();
        assert!(!config.flags.cascade_stop);

        let ctx = Context::new(config).unwrap();
        assert_eq!(ctx.args().to_vec(), vec!["--safe".to_string()]);
    }

    #[test]
    fn test_descriptor_from_toml() {
        let descriptor = PluginDescriptor::from_toml(
            r#"
id = "org.example.a"
version = "1.4.0"
runtime = "a::main"

[[dependencies]]
id = "org.example.b"
version = "^2"

[[extensions]]
point = "org.example.b.menu"
id = "open"

[extensions.config]
label = "Open"
"#,
        )
        .unwrap();

        assert_eq!(descriptor.version.to_string(), "1.4.0");
        assert_eq!(descriptor.runtime.as_deref(), Some("a::main"));
        assert!(descriptor.dependency("org.example.b").unwrap().matches(&semver::Version::new(2, 1, 0)));
        assert_eq!(descriptor.extensions[0].config["label"], "Open");
    }
}

#[cfg(feature = "metrics-prometheus")]
mod metrics_tests {
    use super::*;
    use plugframe::MetricsConfig;

    #[test]
    fn test_metrics_track_failures_and_runs() {
        init_tracing();
        let loader = StaticLoader::new().with("refusing", || Refusing);
        let config = ContextConfig::new().with_metrics(MetricsConfig::new().with_prefix("it"));
        let ctx = Context::with_loader(config, Arc::new(loader)).unwrap();

        ctx.install_plugin(DescriptorBuilder::new("ok", "1.0.0").build().unwrap())
            .unwrap();
        ctx.install_plugin(
            DescriptorBuilder::new("bad", "1.0.0")
                .runtime("refusing")
                .build()
                .unwrap(),
        )
        .unwrap();

        ctx.start("ok").unwrap();
        assert!(ctx.start("bad").is_err());
        ctx.plugin_context("ok")
            .register_run_function(RunMode::Once, |_| RunStatus::Done)
            .unwrap();
        ctx.run_until_idle().unwrap();

        let metrics = ctx.metrics().unwrap();
        assert_eq!(metrics.activations_total(), 1);
        assert_eq!(metrics.activation_failures_total(), 1);
        assert_eq!(metrics.run_calls_total(), 1);
        assert_eq!(metrics.active_plugins(), 1);
    }
}
