use prov_core::{ClientConfig, ConfigFile, Error, MapEnv};
use tempfile::TempDir;

fn no_env() -> MapEnv {
    MapEnv::default()
}

#[test]
fn load_returns_defaults_when_no_config_file() {
    let tmp = TempDir::new().unwrap();
    let file = ConfigFile::load(&tmp.path().join("config.toml")).unwrap();
    assert_eq!(file, ConfigFile::default());

    let config = ClientConfig::resolve(&[], &no_env(), &file).unwrap();
    assert_eq!(config.host.origin(), "http://localhost");
    assert_eq!(config.api_version, "1.0");
    assert!(config.http_headers.is_empty());
}

#[test]
fn load_parses_full_config() {
    let tmp = TempDir::new().unwrap();
    let toml = r#"
host = "https://build.example.com/prov"
api_version = "1.3"

[http_headers]
X-Team = "infra"
"#;
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, toml).unwrap();

    let file = ConfigFile::load(&path).unwrap();
    let config = ClientConfig::resolve(&[], &no_env(), &file).unwrap();

    assert_eq!(config.host.origin(), "https://build.example.com");
    assert_eq!(config.api_path("/engine"), "/prov/v1.3/engine");
    assert_eq!(
        config.http_headers.get("X-Team").map(String::as_str),
        Some("infra")
    );
}

#[test]
fn malformed_config_file_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "host = [").unwrap();

    let err = ConfigFile::load(&path).unwrap_err();
    assert!(matches!(err, Error::ConfigParse { .. }), "got: {err}");
}

#[test]
fn host_flag_beats_environment_and_file() {
    let env = MapEnv::new([("PROV_HOST", "tcp://env-host:2375")]);
    let file = ConfigFile {
        host: Some("http://file-host".to_owned()),
        ..Default::default()
    };
    let config =
        ClientConfig::resolve(&["https://flag-host:443".to_owned()], &env, &file).unwrap();
    assert_eq!(config.host.origin(), "https://flag-host:443");
}

#[test]
fn environment_beats_file() {
    let env = MapEnv::new([
        ("PROV_HOST", "tcp://env-host:2375"),
        ("PROV_API_VERSION", "2.1"),
    ]);
    let file = ConfigFile {
        host: Some("http://file-host".to_owned()),
        api_version: Some("1.1".to_owned()),
        ..Default::default()
    };
    let config = ClientConfig::resolve(&[], &env, &file).unwrap();
    assert_eq!(config.host.origin(), "http://env-host:2375");
    assert_eq!(config.api_version, "2.1");
}

#[test]
fn empty_environment_values_fall_through() {
    let env = MapEnv::new([("PROV_HOST", ""), ("PROV_API_VERSION", "")]);
    let config = ClientConfig::resolve(&[], &env, &ConfigFile::default()).unwrap();
    assert_eq!(config.host.origin(), "http://localhost");
    assert_eq!(config.api_version, "1.0");
}

#[test]
fn multiple_hosts_are_rejected() {
    let hosts = vec!["http://a".to_owned(), "http://b".to_owned()];
    let err = ClientConfig::resolve(&hosts, &no_env(), &ConfigFile::default()).unwrap_err();
    assert!(matches!(err, Error::MultipleHosts { count: 2 }));
    assert!(err.to_string().contains("only one -H"), "got: {err}");
}

#[test]
fn invalid_host_is_rejected() {
    let err = ClientConfig::resolve(&["nonsense".to_owned()], &no_env(), &ConfigFile::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidHost { .. }));
}

#[test]
fn default_path_prefers_environment() {
    let env = MapEnv::new([("PROV_CONFIG", "/etc/prov/config.toml")]);
    assert_eq!(
        ConfigFile::default_path(&env),
        Some(std::path::PathBuf::from("/etc/prov/config.toml"))
    );
}
