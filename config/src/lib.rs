//! # ECS Exporter Configuration
//!
//! Layered configuration, lowest to highest precedence:
//!
//! 1. Built-in defaults
//! 2. The YAML file passed with `--config`
//! 3. `ECS_EXPORTER_*` environment variables, e.g. `ECS_EXPORTER_AWS_REGION`
//! 4. Command line flags that were given explicitly

#[macro_use]
extern crate tracing;

mod args;

pub use args::Args;
use eyre::{
    bail,
    Context as _,
    Result,
};
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Duration,
};

pub const ENV_PREFIX: &str = "ECS_EXPORTER";

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9222";
const DEFAULT_TELEMETRY_PATH: &str = "/metrics";
const DEFAULT_CLUSTER_FILTER: &str = ".*";
const DEFAULT_COLLECT_TIMEOUT: &str = "10s";
const DEFAULT_MAX_CONCURRENCY: u64 = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub listen_address: String,
    pub telemetry_path: String,
    #[serde(default)]
    pub aws_region: String,
    #[serde(default)]
    pub aws_endpoint: Option<url::Url>,
    pub cluster_filter: String,
    #[serde(default)]
    pub disable_container_instance_metrics: bool,
    #[serde(default)]
    pub instance_cpu_metrics: bool,
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub collect_timeout: Duration,
    pub max_concurrency: usize,
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    /// Builds and validates the configuration from all layers, reading the process environment.
    pub fn new(args: Args) -> Result<Self> {
        Self::from_sources(args, None)
    }

    /// Like [`Config::new`], with `env` standing in for the process environment when given.
    pub fn from_sources(args: Args, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("listen_address", DEFAULT_LISTEN_ADDRESS)?
            .set_default("telemetry_path", DEFAULT_TELEMETRY_PATH)?
            .set_default("cluster_filter", DEFAULT_CLUSTER_FILTER)?
            .set_default("collect_timeout", DEFAULT_COLLECT_TIMEOUT)?
            .set_default("max_concurrency", DEFAULT_MAX_CONCURRENCY)?;

        if let Some(path) = &args.config {
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true)
                    .source(env),
            )
            .add_source(args);

        let cfg: Self = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        cfg.validate()?;
        cfg.log_notable_settings();

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.aws_region.trim().is_empty() {
            bail!("An AWS region is required, pass it with --aws.region or {ENV_PREFIX}_AWS_REGION");
        }
        regex::Regex::new(&self.cluster_filter)
            .with_context(|| format!("Invalid cluster filtering regex: {}", self.cluster_filter))?;
        if self.max_concurrency == 0 {
            bail!("Max concurrency must be greater than zero");
        }
        if self.collect_timeout.is_zero() {
            bail!("Collect timeout must be greater than zero");
        }
        if !self.telemetry_path.starts_with('/') {
            bail!("Telemetry path must start with '/', got {:?}", self.telemetry_path);
        }
        self.socket_addr()?;
        Ok(())
    }

    /// The listen address as a socket address. A bare `:port` listens on all interfaces.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let address = match self.listen_address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.listen_address.clone(),
        };
        address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen_address))
    }

    pub fn container_instance_metrics(&self) -> bool {
        !self.disable_container_instance_metrics
    }

    fn log_notable_settings(&self) {
        if self.cluster_filter != DEFAULT_CLUSTER_FILTER {
            warn!(filter = %self.cluster_filter, "Cluster filter enabled");
        }
        if self.disable_container_instance_metrics {
            warn!("Cluster container instance metrics disabled");
        }
    }
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(&value).map_err(serde::de::Error::custom)
}

fn serialize_duration<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;
    use pretty_assertions::assert_eq;

    fn args(flags: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("ecs-exporter").chain(flags.iter().copied())).unwrap()
    }

    fn load(flags: &[&str], env: &[(&str, &str)]) -> Result<Config> {
        let env = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_sources(args(flags), Some(env))
    }

    #[test]
    fn defaults() {
        let cfg = load(&["--aws.region", "eu-west-1"], &[]).unwrap();
        assert_eq!(
            cfg,
            Config {
                listen_address: "0.0.0.0:9222".to_string(),
                telemetry_path: "/metrics".to_string(),
                aws_region: "eu-west-1".to_string(),
                aws_endpoint: None,
                cluster_filter: ".*".to_string(),
                disable_container_instance_metrics: false,
                instance_cpu_metrics: false,
                collect_timeout: Duration::from_secs(10),
                max_concurrency: 10,
                debug: false,
            }
        );
        assert!(cfg.container_instance_metrics());
    }

    #[test]
    fn flags() {
        let cfg = load(
            &[
                "--aws.region",
                "us-east-1",
                "--aws.cluster-filter",
                "^prod-.*",
                "--metrics.disable-cinstances",
                "--collect.timeout",
                "1m 30s",
                "--collect.max-concurrency",
                "3",
                "--web.listen-address",
                ":9000",
                "--aws.endpoint-url",
                "http://localhost:4566",
                "--debug",
            ],
            &[],
        )
        .unwrap();

        assert_eq!(cfg.cluster_filter, "^prod-.*");
        assert!(!cfg.container_instance_metrics());
        assert_eq!(cfg.collect_timeout, Duration::from_secs(90));
        assert_eq!(cfg.max_concurrency, 3);
        assert_eq!(cfg.socket_addr().unwrap(), "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.aws_endpoint.unwrap().as_str(), "http://localhost:4566/");
        assert!(cfg.debug);
    }

    #[test]
    fn missing_region() {
        let err = load(&[], &[]).unwrap_err();
        assert!(err.to_string().contains("AWS region"), "{err}");
    }

    #[test]
    fn invalid_settings() {
        for flags in [
            &["--aws.region", "eu-west-1", "--aws.cluster-filter", "["][..],
            &["--aws.region", "eu-west-1", "--collect.max-concurrency", "0"][..],
            &["--aws.region", "eu-west-1", "--collect.timeout", "0s"][..],
            &["--aws.region", "eu-west-1", "--web.telemetry-path", "metrics"][..],
            &["--aws.region", "eu-west-1", "--web.listen-address", "nowhere"][..],
        ] {
            assert!(load(flags, &[]).is_err(), "{flags:?} should be rejected");
        }
    }

    #[test]
    fn invalid_duration_flag() {
        let result = Args::try_parse_from(["ecs-exporter", "--collect.timeout", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn environment_below_flags() {
        let env = [
            ("ECS_EXPORTER_AWS_REGION", "eu-central-1"),
            ("ECS_EXPORTER_MAX_CONCURRENCY", "4"),
            ("ECS_EXPORTER_COLLECT_TIMEOUT", "5s"),
        ];

        let cfg = load(&[], &env).unwrap();
        assert_eq!(cfg.aws_region, "eu-central-1");
        assert_eq!(cfg.max_concurrency, 4);
        assert_eq!(cfg.collect_timeout, Duration::from_secs(5));

        let cfg = load(&["--aws.region", "eu-west-1"], &env).unwrap();
        assert_eq!(cfg.aws_region, "eu-west-1");
        assert_eq!(cfg.max_concurrency, 4);
    }

    #[test]
    fn file_below_environment() {
        let dir = temp_dir::TempDir::with_prefix("ecs-exporter-config").unwrap();
        let path = dir.child("config.yaml");
        std::fs::write(
            &path,
            "aws_region: ap-southeast-2\ncluster_filter: cluster[0-9]\nmax_concurrency: 2\ninstance_cpu_metrics: true\n",
        )
        .unwrap();
        let path = path.to_str().unwrap().to_string();

        let cfg = load(&["--config", &path], &[]).unwrap();
        assert_eq!(cfg.aws_region, "ap-southeast-2");
        assert_eq!(cfg.cluster_filter, "cluster[0-9]");
        assert_eq!(cfg.max_concurrency, 2);
        assert!(cfg.instance_cpu_metrics);

        let cfg = load(&["--config", &path], &[("ECS_EXPORTER_MAX_CONCURRENCY", "8")]).unwrap();
        assert_eq!(cfg.max_concurrency, 8);
    }

    #[test]
    fn missing_config_file() {
        assert!(load(&["--aws.region", "eu-west-1", "--config", "/nonexistent/ecs-exporter.yaml"], &[]).is_err());
    }
}
