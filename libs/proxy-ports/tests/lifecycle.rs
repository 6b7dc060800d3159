//! End-to-end lifecycle tests: allocate → ack → checkpoint → restart →
//! restore, through the public API only.

use std::sync::Arc;
use std::time::Duration;

use npa_proxy_ports::{
    DatapathUpdater, MockDatapath, ParserType, Protocol, ProxyConfig, ProxyPortManager, ProxyType,
    RedirectSpec, CHECKPOINT_FILENAME,
};

fn config_for(state_dir: &std::path::Path, min_port: u16, max_port: u16) -> ProxyConfig {
    ProxyConfig {
        min_port,
        max_port,
        state_dir: state_dir.to_path_buf(),
        restore_age_limit: Duration::from_secs(900),
        checkpoint_min_interval: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn restart_restores_allocations_from_checkpoint() {
    let state_dir = tempfile::tempdir().unwrap();

    // First agent run: a static DNS listener and an acked CRD listener.
    let datapath = Arc::new(MockDatapath::new());
    let manager = Arc::new(ProxyPortManager::new(
        config_for(state_dir.path(), 44000, 44100),
        Arc::clone(&datapath) as Arc<dyn DatapathUpdater>,
    ));
    manager.start();

    manager.register_static_listener("dns-egress", ProxyType::Dns, false, 3535);
    let crd_port = manager.allocate_crd_proxy_port("crd-listener").unwrap();
    manager.ack_proxy_port("crd-listener").await.unwrap();

    manager.shutdown().await;
    assert!(state_dir.path().join(CHECKPOINT_FILENAME).exists());

    // Second agent run against the same state directory. The datapath
    // still carries the rules from before the restart.
    let manager2 = Arc::new(ProxyPortManager::new(
        config_for(state_dir.path(), 44000, 44100),
        Arc::clone(&datapath) as Arc<dyn DatapathUpdater>,
    ));
    manager2.start();

    // Restored entries are known but not yet re-acked.
    assert_eq!(manager2.get_proxy_port("crd-listener"), Some(0));
    let pp = manager2
        .find(ProxyType::Crd, "crd-listener", false)
        .unwrap();
    assert!(!pp.configured);
    assert_eq!(pp.n_redirects, 0);
    assert_eq!(pp.rules_port, crd_port);

    // Static listeners restore their fixed port directly.
    let dns = manager2.find(ProxyType::Dns, "dns-egress", false).unwrap();
    assert!(dns.is_static);
    assert_eq!(dns.port, 3535);

    // Policy re-evaluation re-binds through the normal path, reusing
    // the committed port so datapath rules stay stable.
    let rebound = manager2.allocate_crd_proxy_port("crd-listener").unwrap();
    assert_eq!(rebound, crd_port);
    manager2.ack_proxy_port("crd-listener").await.unwrap();

    manager2.shutdown().await;
}

#[tokio::test]
async fn stale_checkpoint_restores_nothing() {
    let state_dir = tempfile::tempdir().unwrap();
    let datapath = Arc::new(MockDatapath::new());

    let manager = Arc::new(ProxyPortManager::new(
        config_for(state_dir.path(), 44100, 44200),
        Arc::clone(&datapath) as Arc<dyn DatapathUpdater>,
    ));
    manager.start();
    manager.allocate_crd_proxy_port("crd-listener").unwrap();
    manager.shutdown().await;

    // Same file, but now trusted for no time at all.
    let mut config = config_for(state_dir.path(), 44100, 44200);
    config.restore_age_limit = Duration::ZERO;
    let manager2 = Arc::new(ProxyPortManager::new(
        config,
        Arc::clone(&datapath) as Arc<dyn DatapathUpdater>,
    ));
    manager2.start();

    assert_eq!(manager2.get_proxy_port("crd-listener"), None);
    manager2.shutdown().await;
}

#[tokio::test]
async fn redirect_transaction_round_trip() {
    let state_dir = tempfile::tempdir().unwrap();
    let datapath = Arc::new(MockDatapath::new());
    let manager = Arc::new(ProxyPortManager::new(
        config_for(state_dir.path(), 44200, 44300),
        Arc::clone(&datapath) as Arc<dyn DatapathUpdater>,
    ));
    manager.start();

    let crd_port = manager.allocate_crd_proxy_port("my-listener").unwrap();

    let spec = RedirectSpec {
        parser_type: ParserType::Crd,
        listener_name: Some("my-listener".to_string()),
        ingress: false,
        port: 9090,
        protocol: Protocol::Tcp,
    };
    let update = manager
        .create_or_update_redirect(&spec, "ep1:egress:TCP:9090")
        .await
        .unwrap();
    assert_eq!(update.port, crd_port);
    (update.finalize)();

    // The datapath saw exactly one rule for the listener's port.
    assert_eq!(
        datapath.get_proxy_ports().get("my-listener"),
        Some(&crd_port)
    );

    manager.shutdown().await;
}
