use crate::Config;

/// A config mirroring `local.env.example`, for unit tests that need one
/// without touching the environment.
pub(crate) fn example_config() -> Config {
    Config {
        home: "/home/wemix".into(),
        node_name: "gwemix".into(),
        node_rpc_url: "http://127.0.0.1:8588".into(),
        node_args: String::new(),
        log: "wemixvisor=info".into(),
        force_stdout: false,
        pretty_print: false,
        poll_interval_ms: 5000,
        shutdown_grace_ms: 30_000,
        restart_after_upgrade: true,
        restart_delay_ms: 5000,
        allow_download_binaries: false,
        download_urls: String::new(),
        unsafe_skip_checksum: false,
        custom_pre_upgrade: String::new(),
        pre_upgrade_max_retries: 3,
        unsafe_skip_backup: false,
        backup_retention_hours: 168,
        validator_mode: false,
    }
}
