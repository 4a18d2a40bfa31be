use rand::{SeedableRng as _, rngs::StdRng};

use super::*;

const EXAMPLE: &str = r#"
datadir = "data"
genesis = "fake:3"

[rpc]
enabled = true
listen = "0.0.0.0:18545"

[validator]
id = 2
event_key = "keys/event.key"
bls_key = "/etc/sonic/bls.key"

[channels]
batches = 16
"#;

#[test]
fn parses_example_with_defaults() {
    let config = Config::from_toml(EXAMPLE).unwrap();
    assert_eq!(config.genesis.as_deref(), Some("fake:3"));
    assert_eq!(config.rpc.listen.port(), 18545);
    assert_eq!(config.validator.as_ref().unwrap().id, 2);
    assert_eq!(config.channels.batches, 16);
    assert_eq!(config.channels.events, ChannelsConfig::default().events);
    assert_eq!(config.shutdown.drain_deadline(), Duration::from_secs(10));
    assert!(config.emitter.enabled);
    assert!(!config.txpool.allow_unprotected);
}

#[test]
fn file_paths_are_resolved_against_the_config_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sonic.toml");
    std::fs::write(&path, EXAMPLE).unwrap();

    let config = Config::read_from_file(&path).unwrap();
    assert_eq!(config.datadir, dir.path().join("data"));
    let validator = config.validator.unwrap();
    assert_eq!(validator.event_key, dir.path().join("keys/event.key"));
    assert_eq!(validator.bls_key, PathBuf::from("/etc/sonic/bls.key"));
}

#[test]
fn toml_roundtrip() {
    let mut config = Config::new("/var/lib/sonic");
    config.validator = Some(ValidatorConfig {
        id: 1,
        event_key: "event.key".into(),
        bls_key: "bls.key".into(),
    });
    assert_eq!(Config::from_toml(&config.to_toml().unwrap()).unwrap(), config);
}

#[test]
fn rejects_invalid_configs() {
    assert!(Config::from_toml("datadir = \"x\"\nunknown = 1").is_err());
    assert!(Config::from_toml("datadir = \"x\"\n[channels]\nevents = 0").is_err());
    assert!(Config::from_toml("datadir = \"x\"\n[channels]\nadmitted = 0").is_err());
    assert!(
        Config::from_toml("datadir = \"x\"\n[validator]\nid = 0\nevent_key = \"a\"\nbls_key = \"b\"")
            .is_err()
    );
}

#[test]
fn key_files_roundtrip() {
    let dir = tempfile::tempdir().unwrap();

    let event = EventKey::random();
    event.write_to_file(dir.path().join("event.key")).unwrap();
    let read = EventKey::read_from_file(dir.path().join("event.key")).unwrap();
    assert_eq!(read.address(), event.address());

    let bls = BlsKey::from(BlsSecretKey::random(&mut StdRng::seed_from_u64(7)));
    bls.write_to_file(dir.path().join("bls.key")).unwrap();
    let read = BlsKey::read_from_file(dir.path().join("bls.key")).unwrap();
    assert_eq!(read.public_key(), bls.public_key());
}

#[test]
fn malformed_key_files_are_rejected() {
    assert!(EventKey::try_from_hex("0xzz").is_err());
    assert!(EventKey::try_from_hex(&"00".repeat(32)).is_err());
    assert!(BlsKey::try_from_hex("0x0102").is_err());
}
