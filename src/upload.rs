//! Upload of the output tree to object storage and CDN invalidation.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use clap::ValueEnum;
use serde::Deserialize;
use tracing::info;

use crate::error::{ConfigError, PublishError};

/// Deployment targets. Anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Environment {
    Production,
    Staging,
    Review,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Review => "review",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EnvironmentSecrets {
    pub s3_bucket: String,
    pub distribution_id: String,
}

/// Contents of the secrets file.
#[derive(Debug, Clone, Deserialize)]
pub struct Secrets {
    /// Key prefix the output tree is published under
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentSecrets>,
}

fn default_prefix() -> String {
    "data/regions".to_string()
}

impl Secrets {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn environment(&self, env: Environment) -> Result<&EnvironmentSecrets, PublishError> {
        self.environments
            .get(env.as_str())
            .ok_or_else(|| PublishError::MissingEnvironment(env.to_string()))
    }
}

/// An external command with its arguments, never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn run(&self) -> Result<(), PublishError> {
        info!("Running: {}", self);
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .map_err(|source| PublishError::Spawn {
                command: self.to_string(),
                source,
            })?;
        if !status.success() {
            return Err(PublishError::Failed {
                command: self.to_string(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('*') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

pub struct Publisher {
    root: PathBuf,
    prefix: String,
    target: EnvironmentSecrets,
}

impl Publisher {
    pub fn new(root: impl Into<PathBuf>, secrets: &Secrets, env: Environment) -> Result<Self, PublishError> {
        Ok(Self {
            root: root.into(),
            prefix: secrets.prefix.trim_matches('/').to_string(),
            target: secrets.environment(env)?.clone(),
        })
    }

    /// Sync then invalidate, in that order.
    pub fn commands(&self) -> Vec<ExternalCommand> {
        let source = format!("{}/", self.root.display().to_string().trim_end_matches('/'));
        let destination = format!("s3://{}/{}/", self.target.s3_bucket, self.prefix);
        let paths = format!("/{}/*", self.prefix);
        vec![
            ExternalCommand::new(
                "aws",
                &["s3", "sync", &source, &destination, "--exclude", ".DS_Store"],
            ),
            ExternalCommand::new(
                "aws",
                &[
                    "cloudfront",
                    "create-invalidation",
                    "--distribution-id",
                    &self.target.distribution_id,
                    "--paths",
                    &paths,
                ],
            ),
        ]
    }

    /// Run every command, stopping at the first failure.
    pub fn publish(&self) -> Result<(), PublishError> {
        for command in self.commands() {
            command.run()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRETS: &str = r#"
        prefix = "/data/trase-regions/"

        [environments.staging]
        s3_bucket = "regions-staging"
        distribution_id = "E2EXAMPLE"
    "#;

    fn secrets() -> Secrets {
        toml::from_str(SECRETS).unwrap()
    }

    #[test]
    fn test_environment_is_a_closed_set() {
        assert_eq!(Environment::from_str("staging", true).unwrap(), Environment::Staging);
        assert_eq!(Environment::from_str("production", true).unwrap(), Environment::Production);
        assert!(Environment::from_str("dev", true).is_err());
    }

    #[test]
    fn test_commands() {
        let publisher = Publisher::new("data/", &secrets(), Environment::Staging).unwrap();
        let commands = publisher.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0].to_string(),
            "aws s3 sync data/ s3://regions-staging/data/trase-regions/ --exclude .DS_Store"
        );
        assert_eq!(
            commands[1].to_string(),
            "aws cloudfront create-invalidation --distribution-id E2EXAMPLE --paths \"/data/trase-regions/*\""
        );
    }

    #[test]
    fn test_missing_environment() {
        let err = Publisher::new("data", &secrets(), Environment::Production).err().unwrap();
        assert!(matches!(err, PublishError::MissingEnvironment(env) if env == "production"));
    }

    #[test]
    fn test_default_prefix() {
        let secrets: Secrets = toml::from_str("").unwrap();
        assert_eq!(secrets.prefix, "data/regions");
        assert!(secrets.environments.is_empty());
    }

    #[test]
    fn test_failing_command_is_reported() {
        let command = ExternalCommand::new("false", &[]);
        assert!(matches!(command.run(), Err(PublishError::Failed { .. })));
    }
}
