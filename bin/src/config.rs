//! leaderd host configuration

pub mod cli {
    //! Parse from either cli or env var

    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "leaderd-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/var/lib/leaderd/config.yaml";
    /// default application name, the first namespace component
    pub static DEFAULT_APP_NAME: &str = "leaderd";
    /// default log level. Can use this argument or LEADERD_LOG env var
    pub const DEFAULT_LEADERD_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";

    use std::path::PathBuf;

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "leaderd", bin_name = "leaderd", about, long_about = None)]
    /// parses from cli & environment var. leaderd will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to the config document holding the `leader` and `nats` sections
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// application name, instances with the same name and env contend for leadership
        #[clap(long, env, value_parser, default_value = DEFAULT_APP_NAME)]
        pub app_name: String,
        /// deployment environment, may be empty
        #[clap(long, env = "APP_ENV", value_parser, default_value = "")]
        pub env: String,
        /// ID of this instance, recorded as the claim holder. Generated when unset
        #[clap(long, env, value_parser)]
        pub instance_id: Option<String>,
        /// comma separated NATS servers, overrides `nats.servers` from the config document
        #[clap(long, env, value_parser, value_delimiter = ',')]
        pub nats_servers: Option<Vec<String>>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_LEADERD_LOG)]
        pub leaderd_log: String,
        /// log output format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
    }

    impl Config {
        /// Configured instance id, or a random one.
        pub fn effective_instance_id(&self) -> String {
            match self.instance_id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => id.to_owned(),
                _ => format!("leaderd-{}", uuid::Uuid::new_v4().simple()),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_cli_defaults() {
            let config = Config::try_parse_from(["leaderd"]).unwrap();
            assert_eq!(config.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
            assert_eq!(config.app_name, DEFAULT_APP_NAME);
            assert_eq!(config.env, "");
            assert_eq!(config.leaderd_log, DEFAULT_LEADERD_LOG);
            assert_eq!(config.log_format, DEFAULT_LOG_FORMAT);
            assert_eq!(config.threads, None);
        }

        #[test]
        fn test_cli_args() {
            let config = Config::try_parse_from([
                "leaderd",
                "--app-name",
                "billing",
                "--env",
                "prod",
                "--instance-id",
                "host-a",
                "--nats-servers",
                "nats://a:4222,nats://b:4222",
                "--threads",
                "2",
            ])
            .unwrap();
            assert_eq!(config.app_name, "billing");
            assert_eq!(config.env, "prod");
            assert_eq!(config.effective_instance_id(), "host-a");
            assert_eq!(
                config.nats_servers,
                Some(vec!["nats://a:4222".to_owned(), "nats://b:4222".to_owned()])
            );
            assert_eq!(config.threads, Some(2));
        }

        #[test]
        fn test_generated_instance_id() {
            let config = Config::try_parse_from(["leaderd", "--instance-id", " "]).unwrap();
            let id = config.effective_instance_id();
            assert!(id.starts_with("leaderd-"));
            assert_ne!(id, config.effective_instance_id());
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Tracing setup applied at startup
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(leaderd_log: &str, log_frmt: &str) -> Result<Self> {
            // Log level comes from LEADERD_LOG
            let filter = EnvFilter::try_new(leaderd_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("async_nats=warn".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
