use ovpn_steward_lib::server::{Protocol, ServerPaths, ServerRecord};

use std::fs;

#[test]
fn record_survives_a_persist_reload_cycle() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = ServerPaths::new(tmp.path(), "c0ffee00deadbeef");
    fs::create_dir_all(paths.root())?;

    let record = ServerRecord {
        id: "c0ffee00deadbeef".to_string(),
        name: "edge-fra1".to_string(),
        network: "10.44.0.0/21".to_string(),
        interface: "tun3".to_string(),
        port: 1197,
        protocol: Protocol::Tcp,
        local_networks: vec!["192.168.7.0/24".to_string(), "10.99.0.0/16".to_string()],
        public_address: "fra1.vpn.example.net".to_string(),
        otp_auth: true,
        lzo_compression: true,
        debug: true,
        organizations: vec!["org-b".to_string(), "org-a".to_string()],
        primary_organization: Some("org-b".to_string()),
        primary_user: Some("server_c0ffee00deadbeef".to_string()),
    };
    record.save(&paths)?;

    let reloaded = ServerRecord::load(&paths)?;
    assert_eq!(reloaded, record);
    // membership order is part of the contract
    assert_eq!(
        reloaded.organizations,
        vec!["org-b".to_string(), "org-a".to_string()]
    );
    Ok(())
}

#[test]
fn unset_primary_pair_stays_unset_across_reload() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = ServerPaths::new(tmp.path(), "0011223344556677");
    fs::create_dir_all(paths.root())?;

    let record = ServerRecord {
        id: "0011223344556677".to_string(),
        name: "bare".to_string(),
        network: "10.8.0.0/24".to_string(),
        interface: "tun0".to_string(),
        port: 1194,
        protocol: Protocol::Udp,
        local_networks: Vec::new(),
        public_address: "vpn.example.com".to_string(),
        otp_auth: false,
        lzo_compression: false,
        debug: false,
        organizations: Vec::new(),
        primary_organization: None,
        primary_user: None,
    };
    record.save(&paths)?;

    let content = fs::read_to_string(paths.record())?;
    assert!(!content.contains("primary_organization"));
    assert!(!content.contains("primary_user"));

    let reloaded = ServerRecord::load(&paths)?;
    assert_eq!(reloaded, record);
    Ok(())
}
