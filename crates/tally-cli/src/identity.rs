//! Acting identity and tenant resolution for CLI commands.
//!
//! Caller: `--as` flag > `TALLY_USER` env > `caller_id` in the user config.
//! Tenant: `--tenant` flag > `TALLY_TENANT` env > [`DEFAULT_TENANT`].
//! Mutating commands require a caller; read-only commands do not.

use std::env;

use anyhow::{Result, bail};
use tally_core::config::UserConfig;
use tally_core::model::Actor;

pub const DEFAULT_TENANT: &str = "default";

/// Environment reader, swappable in tests.
trait EnvReader {
    fn get(&self, key: &str) -> Option<String>;
}

struct RealEnv;

impl EnvReader for RealEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

fn resolve_caller_with(
    flag: Option<&str>,
    user: &UserConfig,
    env: &dyn EnvReader,
) -> Option<String> {
    flag.filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .or_else(|| env.get("TALLY_USER"))
        .or_else(|| user.caller_id.clone())
}

fn resolve_tenant_with(flag: Option<&str>, env: &dyn EnvReader) -> String {
    flag.filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .or_else(|| env.get("TALLY_TENANT"))
        .unwrap_or_else(|| DEFAULT_TENANT.to_string())
}

pub fn resolve_tenant(flag: Option<&str>) -> String {
    resolve_tenant_with(flag, &RealEnv)
}

/// Resolve the acting identity for a mutating command.
///
/// # Errors
///
/// Fails when no caller id is configured anywhere.
pub fn require_actor(flag: Option<&str>, user: &UserConfig) -> Result<Actor> {
    let Some(caller_id) = resolve_caller_with(flag, user, &RealEnv) else {
        bail!(
            "no acting identity: pass --as <caller-id>, set TALLY_USER, \
             or set caller_id in ~/.config/tally/config.toml"
        );
    };
    Ok(actor_for(caller_id, user))
}

fn actor_for(caller_id: String, user: &UserConfig) -> Actor {
    // The display name and number only apply to the configured identity.
    let configured = user.caller_id.as_deref() == Some(caller_id.as_str());
    let display_name = user
        .display_name
        .clone()
        .filter(|_| configured)
        .unwrap_or_else(|| caller_id.clone());
    let actor = Actor::new(caller_id, display_name);
    match user.human_number {
        Some(number) if configured => actor.with_human_number(number),
        _ => actor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeEnv(HashMap<&'static str, &'static str>);

    impl EnvReader for FakeEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).map(ToString::to_string)
        }
    }

    fn user(caller_id: Option<&str>) -> UserConfig {
        UserConfig {
            caller_id: caller_id.map(str::to_string),
            display_name: Some("Ana Souza".into()),
            human_number: Some(7),
            ..UserConfig::default()
        }
    }

    #[test]
    fn flag_wins() {
        let env = FakeEnv(HashMap::from([("TALLY_USER", "u-env")]));
        let caller = resolve_caller_with(Some("u-flag"), &user(Some("u-cfg")), &env);
        assert_eq!(caller.as_deref(), Some("u-flag"));
    }

    #[test]
    fn env_beats_user_config() {
        let env = FakeEnv(HashMap::from([("TALLY_USER", "u-env")]));
        let caller = resolve_caller_with(None, &user(Some("u-cfg")), &env);
        assert_eq!(caller.as_deref(), Some("u-env"));
    }

    #[test]
    fn empty_flag_is_ignored() {
        let env = FakeEnv(HashMap::new());
        let caller = resolve_caller_with(Some("  "), &user(Some("u-cfg")), &env);
        assert_eq!(caller.as_deref(), Some("u-cfg"));
        assert!(resolve_caller_with(None, &user(None), &env).is_none());
    }

    #[test]
    fn tenant_defaults() {
        let env = FakeEnv(HashMap::from([("TALLY_TENANT", "acme")]));
        assert_eq!(resolve_tenant_with(None, &env), "acme");
        assert_eq!(resolve_tenant_with(Some("globex"), &env), "globex");
        assert_eq!(
            resolve_tenant_with(None, &FakeEnv(HashMap::new())),
            DEFAULT_TENANT
        );
    }

    #[test]
    fn configured_identity_keeps_profile() {
        let actor = actor_for("u-cfg".into(), &user(Some("u-cfg")));
        assert_eq!(actor.display_name, "Ana Souza");
        assert_eq!(actor.human_number, Some(7));

        let other = actor_for("u-other".into(), &user(Some("u-cfg")));
        assert_eq!(other.display_name, "u-other");
        assert_eq!(other.human_number, None);
    }
}
