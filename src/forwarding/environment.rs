//! Environment Inheritance
//!
//! An environment may `extends` another one. Target fields (kubeconfig,
//! context, bind address) are layered from the top-level `defaults`
//! through every ancestor down to the environment itself, the nearest
//! setting winning. Namespaces come from the nearest environment in the
//! chain that declares any.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use super::error::ForwardError;
use super::spec::DEFAULT_BIND_ADDRESS;
use crate::config::{ConfigFile, EnvironmentConfig, NamespaceConfig};

/// An environment with `defaults` and `extends` applied
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveEnvironment<'a> {
    pub name: &'a str,
    pub context: String,
    pub kubeconfig: Option<PathBuf>,
    pub bind_address: Ipv4Addr,
    pub namespaces: &'a BTreeMap<String, NamespaceConfig>,
}

/// Flatten the inheritance chain of `name`.
///
/// Fails with `UnknownEnvironment` when `name` is not declared,
/// `InvalidExtends` when the chain names itself, an undeclared environment
/// or loops, and `InvalidDeclaration` when no context is set anywhere.
pub fn effective_environment<'a>(
    config: &'a ConfigFile,
    name: &str,
) -> Result<EffectiveEnvironment<'a>, ForwardError> {
    let chain = inheritance_chain(config, name)?;
    let (env_name, own) = chain[0];

    let target = chain
        .iter()
        .rev()
        .fold(config.defaults.clone(), |acc, &(_, env)| acc.merged(&env.target()));

    let namespaces = chain
        .iter()
        .map(|&(_, env)| &env.namespaces)
        .find(|namespaces| !namespaces.is_empty())
        .unwrap_or(&own.namespaces);

    let context = match target.context {
        Some(context) if !context.trim().is_empty() => context,
        _ => {
            return Err(ForwardError::InvalidDeclaration {
                context: format!("environments.{}.context", env_name),
                reason: "no kubeconfig context set (here, in an extended environment or in defaults)"
                    .to_string(),
            })
        }
    };

    Ok(EffectiveEnvironment {
        name: env_name,
        context,
        kubeconfig: target.kubeconfig,
        bind_address: target.bind_address.unwrap_or(DEFAULT_BIND_ADDRESS),
        namespaces,
    })
}

/// `name` followed by its ancestors, nearest first
fn inheritance_chain<'a>(
    config: &'a ConfigFile,
    name: &str,
) -> Result<Vec<(&'a str, &'a EnvironmentConfig)>, ForwardError> {
    let (first_name, first) = config
        .environments
        .get_key_value(name)
        .ok_or_else(|| ForwardError::UnknownEnvironment(name.to_string()))?;
    let mut chain = vec![(first_name.as_str(), first)];

    loop {
        let (current_name, current) = chain[chain.len() - 1];
        let Some(parent) = current.extends.as_deref() else {
            return Ok(chain);
        };

        let invalid = |reason: String| ForwardError::InvalidExtends {
            context: format!("environments.{}.extends", current_name),
            reason,
        };
        if parent == current_name {
            return Err(invalid("environment cannot extend itself".to_string()));
        }
        let Some((parent_name, parent_env)) = config.environments.get_key_value(parent) else {
            return Err(invalid(format!("references unknown environment '{}'", parent)));
        };
        if let Some(start) = chain.iter().position(|(seen, _)| *seen == parent) {
            let mut cycle: Vec<&str> = chain[start..].iter().map(|(seen, _)| *seen).collect();
            cycle.push(parent);
            return Err(invalid(format!(
                "cyclic environment inheritance: {}",
                cycle.join(" -> ")
            )));
        }
        chain.push((parent_name.as_str(), parent_env));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetDefaults;
    use crate::forwarding::ErrorKind;

    fn env(extends: Option<&str>, context: Option<&str>) -> EnvironmentConfig {
        EnvironmentConfig {
            extends: extends.map(str::to_string),
            context: context.map(str::to_string),
            ..Default::default()
        }
    }

    fn config(envs: Vec<(&str, EnvironmentConfig)>) -> ConfigFile {
        let mut config = ConfigFile::default();
        for (name, env) in envs {
            config.environments.insert(name.to_string(), env);
        }
        config
    }

    fn with_namespace(mut env: EnvironmentConfig, namespace: &str) -> EnvironmentConfig {
        env.namespaces
            .insert(namespace.to_string(), NamespaceConfig::default());
        env
    }

    #[test]
    fn test_standalone_environment() {
        let config = config(vec![("dev", with_namespace(env(None, Some("dev-ctx")), "ns1"))]);

        let effective = effective_environment(&config, "dev").unwrap();
        assert_eq!(effective.name, "dev");
        assert_eq!(effective.context, "dev-ctx");
        assert_eq!(effective.bind_address, DEFAULT_BIND_ADDRESS);
        assert!(effective.kubeconfig.is_none());
        assert!(effective.namespaces.contains_key("ns1"));
    }

    #[test]
    fn test_child_inherits_namespaces_and_overrides_context() {
        let mut base = with_namespace(env(None, Some("base-ctx")), "ns1");
        base.bind_address = Some(Ipv4Addr::UNSPECIFIED);
        let config = config(vec![
            ("base", base),
            ("staging", env(Some("base"), Some("staging-ctx"))),
        ]);

        let effective = effective_environment(&config, "staging").unwrap();
        assert_eq!(effective.name, "staging");
        assert_eq!(effective.context, "staging-ctx");
        assert_eq!(effective.bind_address, Ipv4Addr::UNSPECIFIED);
        assert!(effective.namespaces.contains_key("ns1"));
    }

    #[test]
    fn test_own_namespaces_replace_inherited() {
        let config = config(vec![
            ("base", with_namespace(env(None, Some("base-ctx")), "ns1")),
            ("dev", with_namespace(env(Some("base"), None), "ns2")),
        ]);

        let effective = effective_environment(&config, "dev").unwrap();
        assert_eq!(effective.context, "base-ctx");
        assert_eq!(effective.namespaces.keys().collect::<Vec<_>>(), vec!["ns2"]);
    }

    #[test]
    fn test_top_level_defaults_are_the_last_fallback() {
        let mut config = config(vec![
            ("base", env(None, None)),
            ("dev", env(Some("base"), None)),
        ]);
        config.defaults = TargetDefaults {
            kubeconfig: Some(PathBuf::from("/etc/kube/config")),
            context: Some("shared-ctx".into()),
            bind_address: Some(Ipv4Addr::new(127, 0, 0, 2)),
        };

        let effective = effective_environment(&config, "dev").unwrap();
        assert_eq!(effective.context, "shared-ctx");
        assert_eq!(effective.kubeconfig, Some(PathBuf::from("/etc/kube/config")));
        assert_eq!(effective.bind_address, Ipv4Addr::new(127, 0, 0, 2));
    }

    #[test]
    fn test_missing_or_empty_context() {
        let none = config(vec![("dev", env(None, None))]);
        let err = effective_environment(&none, "dev").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDeclaration);
        assert!(err.to_string().contains("environments.dev.context"));

        let blank = config(vec![("dev", env(None, Some("")))]);
        assert_eq!(
            effective_environment(&blank, "dev").unwrap_err().kind(),
            ErrorKind::InvalidDeclaration
        );
    }

    #[test]
    fn test_extends_errors() {
        let unknown = config(vec![("dev", env(None, Some("dev-ctx")))]);
        assert_eq!(
            effective_environment(&unknown, "prod").unwrap_err().kind(),
            ErrorKind::UnknownEnvironment
        );

        let itself = config(vec![("dev", env(Some("dev"), Some("dev-ctx")))]);
        let err = effective_environment(&itself, "dev").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidExtends);
        assert!(err.to_string().contains("cannot extend itself"));

        let dangling = config(vec![("dev", env(Some("base"), Some("dev-ctx")))]);
        let err = effective_environment(&dangling, "dev").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidExtends);
        assert!(err.to_string().contains("unknown environment 'base'"));
    }

    #[test]
    fn test_cycle_is_named() {
        let config = config(vec![
            ("a", env(Some("b"), Some("ctx"))),
            ("b", env(Some("c"), None)),
            ("c", env(Some("a"), None)),
        ]);

        match effective_environment(&config, "a").unwrap_err() {
            ForwardError::InvalidExtends { context, reason } => {
                assert_eq!(context, "environments.c.extends");
                assert_eq!(reason, "cyclic environment inheritance: a -> b -> c -> a");
            }
            other => panic!("Expected InvalidExtends, got {:?}", other),
        }
    }
}
