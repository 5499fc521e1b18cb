//! The configurator serving and syncing config over an isolated bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use microbus_config::ConfigProperty;
use microbus_configurator::Configurator;
use microbus_connector::Connector;
use microbus_core::Deployment;
use microbus_transport::{MemoryBus, Transport};

fn attach(con: &Connector, bus: &Arc<dyn Transport>) {
    con.set_transport(Arc::clone(bus)).unwrap();
    con.set_deployment(Deployment::Testing).unwrap();
}

fn configurator(bus: &Arc<dyn Transport>, yaml: &str) -> Configurator {
    let cfg = Configurator::new();
    cfg.set_config_dir(None);
    cfg.load_yaml(yaml).unwrap();
    attach(cfg.connector(), bus);
    cfg
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_services_fetch_values_at_startup() {
    let bus: Arc<dyn Transport> = Arc::new(MemoryBus::new());
    let cfg = configurator(
        &bus,
        "www.example.com:\n  aaa: 111\nexample.com:\n  aaa: xxx\n  bbb: 222\nall:\n  ccc: 333\n",
    );
    cfg.connector().startup().await.unwrap();

    let svc = Connector::new("www.example.com");
    attach(&svc, &bus);
    for name in ["aaa", "bbb", "ccc", "ddd"] {
        svc.define_config(ConfigProperty::new(name, "default", "str").unwrap())
            .unwrap();
    }
    svc.startup().await.unwrap();
    assert_eq!(svc.config("aaa"), "111");
    assert_eq!(svc.config("bbb"), "222");
    assert_eq!(svc.config("ccc"), "333");
    assert_eq!(svc.config("ddd"), "default");

    svc.shutdown().await.unwrap();
    cfg.connector().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_value_fails_startup() {
    let bus: Arc<dyn Transport> = Arc::new(MemoryBus::new());
    let cfg = configurator(&bus, "strict.example:\n  count: eleven\n");
    cfg.connector().startup().await.unwrap();

    let svc = Connector::new("strict.example");
    attach(&svc, &bus);
    svc.define_config(ConfigProperty::new("Count", "1", "int [1,10]").unwrap())
        .unwrap();
    let err = svc.startup().await.unwrap_err();
    assert_eq!(err.kind(), microbus_core::ErrorKind::ConfigInvalid);

    cfg.connector().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refresh_pushes_changes() {
    let bus: Arc<dyn Transport> = Arc::new(MemoryBus::new());
    let cfg = configurator(&bus, "live.example:\n  color: red\n");
    cfg.connector().startup().await.unwrap();

    let svc = Connector::new("live.example");
    attach(&svc, &bus);
    svc.define_config(ConfigProperty::new("Color", "white", "set red|green|blue").unwrap())
        .unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changes);
    svc.on_config_changed(move |_ctx, changed| {
        let counter = Arc::clone(&counter);
        async move {
            if changed.contains("color") {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    });
    svc.startup().await.unwrap();
    assert_eq!(svc.config("color"), "red");

    cfg.load_yaml("live.example:\n  color: green\n").unwrap();
    cfg.refresh(&cfg.connector().lifetime()).await.unwrap();
    assert!(eventually(|| svc.config("color") == "green").await);
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    // Invalid values are ignored on refresh
    cfg.load_yaml("live.example:\n  color: purple\n").unwrap();
    cfg.refresh(&cfg.connector().lifetime()).await.unwrap();
    assert_eq!(svc.config("color"), "green");

    // Removed values revert to the default
    cfg.load_yaml("live.example:\n  color: ''\n").unwrap();
    cfg.refresh(&cfg.connector().lifetime()).await.unwrap();
    assert!(eventually(|| svc.config("color") == "white").await);

    svc.shutdown().await.unwrap();
    cfg.connector().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_peers_converge() {
    let bus: Arc<dyn Transport> = Arc::new(MemoryBus::new());
    let older = configurator(&bus, "example.com:\n  foo: old\n");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = configurator(&bus, "example.com:\n  foo: new\n  bar: baz\n");

    older.connector().startup().await.unwrap();
    newer.connector().startup().await.unwrap();
    assert!(eventually(|| older.repository().equals(&newer.repository())).await);
    assert_eq!(older.value("example.com", "foo").as_deref(), Some("new"));

    older.connector().shutdown().await.unwrap();
    newer.connector().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_newer_peer_answers_older_broadcast() {
    let bus: Arc<dyn Transport> = Arc::new(MemoryBus::new());
    let older = configurator(&bus, "example.com:\n  foo: old\n");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = configurator(&bus, "example.com:\n  foo: new\n");

    // The newer one starts first, so the older one announces itself last
    newer.connector().startup().await.unwrap();
    older.connector().startup().await.unwrap();
    assert!(eventually(|| older.value("example.com", "foo").as_deref() == Some("new")).await);
    assert!(newer.repository().equals(&older.repository()));

    older.connector().shutdown().await.unwrap();
    newer.connector().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_config_files_are_loaded_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "all:\n  foo: base\n  bar: base\n").unwrap();
    std::fs::write(dir.path().join("config.local.yaml"), "all:\n  bar: local\n").unwrap();

    let bus: Arc<dyn Transport> = Arc::new(MemoryBus::new());
    let cfg = Configurator::new();
    cfg.set_config_dir(Some(dir.path()));
    attach(cfg.connector(), &bus);
    cfg.connector().startup().await.unwrap();

    assert_eq!(cfg.value("any.host", "foo").as_deref(), Some("base"));
    assert_eq!(cfg.value("any.host", "bar").as_deref(), Some("local"));
    cfg.connector().shutdown().await.unwrap();
}
