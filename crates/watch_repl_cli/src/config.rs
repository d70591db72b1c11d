use std::time::Duration;

use watch_repl::{ReplConfig, ReplError};

pub const DEFAULT_TRANSPORT: &str = "pynus";

/// Settings taken from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub transport: String,
    pub transport_args: Vec<String>,
    pub device: Option<String>,
    pub timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: DEFAULT_TRANSPORT.to_string(),
            transport_args: Vec::new(),
            device: None,
            timeout: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ReplError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ReplError> {
        let mut settings = Settings::default();
        if let Some(t) = get("WATCH_REPL_TRANSPORT").filter(|t| !t.trim().is_empty()) {
            settings.transport = t.trim().to_string();
        }
        if let Some(args) = get("WATCH_REPL_TRANSPORT_ARGS") {
            settings.transport_args = args.split_whitespace().map(str::to_string).collect();
        }
        settings.device = get("WATCH_REPL_DEVICE").filter(|d| !d.trim().is_empty());
        if let Some(secs) = get("WATCH_REPL_TIMEOUT") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                ReplError::Config(format!("WATCH_REPL_TIMEOUT must be whole seconds, got {secs:?}"))
            })?;
            settings.timeout = Some(Duration::from_secs(secs));
        }
        Ok(settings)
    }

    /// Program and arguments for the transport bridge.
    ///
    /// A device given on the command line wins over the environment.
    pub fn transport_command(&self, device: Option<&str>) -> (String, Vec<String>) {
        let mut args = self.transport_args.clone();
        if let Some(device) = device.or(self.device.as_deref()) {
            args.push("--device".to_string());
            args.push(device.to_string());
        }
        (self.transport.clone(), args)
    }

    pub fn repl_config(&self, timeout: Option<Duration>, verbose: bool) -> ReplConfig {
        let mut cfg = ReplConfig {
            verbose,
            ..ReplConfig::default()
        };
        if let Some(t) = timeout.or(self.timeout) {
            cfg.expect_timeout = t;
            cfg.sync_timeout = t;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ReplError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        assert_eq!(settings(&[]).unwrap(), Settings::default());
    }

    #[test]
    fn reads_all_variables() {
        let s = settings(&[
            ("WATCH_REPL_TRANSPORT", "/opt/pynus/pynus.py"),
            ("WATCH_REPL_TRANSPORT_ARGS", "--adapter hci1"),
            ("WATCH_REPL_DEVICE", "AA:BB:CC:DD:EE:FF"),
            ("WATCH_REPL_TIMEOUT", "15"),
        ])
        .unwrap();
        assert_eq!(s.transport, "/opt/pynus/pynus.py");
        assert_eq!(s.transport_args, vec!["--adapter", "hci1"]);
        assert_eq!(s.device.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(s.timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn bad_timeout_is_config_error() {
        let err = settings(&[("WATCH_REPL_TIMEOUT", "soon")]).unwrap_err();
        assert!(matches!(err, ReplError::Config(_)));
    }

    #[test]
    fn command_line_device_overrides_env() {
        let s = settings(&[("WATCH_REPL_DEVICE", "env-dev")]).unwrap();
        let (program, args) = s.transport_command(Some("cli-dev"));
        assert_eq!(program, "pynus");
        assert_eq!(args, vec!["--device", "cli-dev"]);
        assert_eq!(s.transport_command(None).1, vec!["--device", "env-dev"]);
    }

    #[test]
    fn timeout_flag_overrides_env() {
        let s = settings(&[("WATCH_REPL_TIMEOUT", "20")]).unwrap();
        let cfg = s.repl_config(Some(Duration::from_secs(3)), true);
        assert_eq!(cfg.expect_timeout, Duration::from_secs(3));
        assert!(cfg.verbose);
        assert_eq!(s.repl_config(None, false).sync_timeout, Duration::from_secs(20));
    }
}
