//! Unit tests for `Settings::from_env`. They mutate process environment
//! variables, so every test holds `ENV_LOCK` for its whole body.

use super::Settings;
use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const VARS: [&str; 8] = [
    "TELESMTP_HOSTNAME",
    "TELESMTP_BIND_ADDRESS",
    "TELESMTP_PORT",
    "TELESMTP_VALID_DOMAINS",
    "TELESMTP_MAILBOX_DIR",
    "TELESMTP_FORWARD_COMMAND",
    "TELESMTP_IDLE_TIMEOUT_SECS",
    "TELESMTP_DISPATCH_CAPACITY",
];

fn clear_test_env_vars() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
fn test_defaults_with_required_domains() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_test_env_vars();
    env::set_var("TELESMTP_VALID_DOMAINS", "ictrek.nl, localhost,,127.0.0.1");

    let settings = Settings::from_env().expect("Config loading failed with only required vars set");

    assert_eq!(settings.valid_domains, vec!["ictrek.nl", "localhost", "127.0.0.1"]);
    assert_eq!(settings.hostname, "localhost");
    assert_eq!(settings.bind_address, "0.0.0.0");
    assert_eq!(settings.port, 2525);
    assert_eq!(settings.mailbox_dir, PathBuf::from("mailboxes"));
    assert_eq!(settings.forward_command, None);
    assert_eq!(settings.idle_timeout_secs, 300);
    assert_eq!(settings.dispatch_capacity, 1);

    clear_test_env_vars();
}

#[test]
fn test_all_values_from_env() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_test_env_vars();
    env::set_var("TELESMTP_VALID_DOMAINS", "example.org");
    env::set_var("TELESMTP_HOSTNAME", "mx.example.org");
    env::set_var("TELESMTP_BIND_ADDRESS", "127.0.0.1");
    env::set_var("TELESMTP_PORT", "2526");
    env::set_var("TELESMTP_MAILBOX_DIR", "/var/mail/telesmtp");
    env::set_var("TELESMTP_FORWARD_COMMAND", "./forward.py");
    env::set_var("TELESMTP_IDLE_TIMEOUT_SECS", "30");
    env::set_var("TELESMTP_DISPATCH_CAPACITY", "8");

    let settings = Settings::from_env().expect("Config loading failed when all vars were set");

    assert_eq!(settings.hostname, "mx.example.org");
    assert_eq!(settings.bind_address, "127.0.0.1");
    assert_eq!(settings.port, 2526);
    assert_eq!(settings.mailbox_dir, PathBuf::from("/var/mail/telesmtp"));
    assert_eq!(settings.forward_command.as_deref(), Some("./forward.py"));
    assert_eq!(settings.idle_timeout_secs, 30);
    assert_eq!(settings.dispatch_capacity, 8);

    clear_test_env_vars();
}

#[test]
fn test_missing_domains_is_an_error() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_test_env_vars();

    let err = Settings::from_env().unwrap_err();
    assert!(err.to_string().contains("TELESMTP_VALID_DOMAINS"));

    env::set_var("TELESMTP_VALID_DOMAINS", " , ");
    let err = Settings::from_env().unwrap_err();
    assert!(err.to_string().contains("at least one domain"));

    clear_test_env_vars();
}

#[test]
fn test_invalid_numbers_name_the_variable() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_test_env_vars();
    env::set_var("TELESMTP_VALID_DOMAINS", "example.org");

    env::set_var("TELESMTP_PORT", "not-a-port");
    let err_msg = Settings::from_env().unwrap_err().to_string();
    assert!(err_msg.contains("TELESMTP_PORT"));
    assert!(err_msg.contains("not-a-port"));
    env::remove_var("TELESMTP_PORT");

    env::set_var("TELESMTP_IDLE_TIMEOUT_SECS", "0");
    assert!(Settings::from_env().is_err());
    env::remove_var("TELESMTP_IDLE_TIMEOUT_SECS");

    env::set_var("TELESMTP_DISPATCH_CAPACITY", "0");
    assert!(Settings::from_env().is_err());

    clear_test_env_vars();
}

#[test]
fn test_blank_forward_command_disables_forwarding() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_test_env_vars();
    env::set_var("TELESMTP_VALID_DOMAINS", "example.org");
    env::set_var("TELESMTP_FORWARD_COMMAND", "   ");

    let settings = Settings::from_env().unwrap();
    assert_eq!(settings.forward_command, None);

    clear_test_env_vars();
}

#[test]
fn test_hostname_override_and_domain_check() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_test_env_vars();
    env::set_var("TELESMTP_VALID_DOMAINS", "ictrek.nl");
    env::set_var("TELESMTP_HOSTNAME", "from-env");

    let settings = Settings::from_env().unwrap().with_hostname("from-cli");
    assert_eq!(settings.hostname, "from-cli");
    assert!(settings.accepts_domain("ictrek.nl"));
    assert!(!settings.accepts_domain("Ictrek.nl"));

    clear_test_env_vars();
}
