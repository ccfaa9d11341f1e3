//! Shell commands understood by the node firmware.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use vlc_lab_abstract::RunConfig;

const CLIENT: &str = "udp_latency_client";
const SERVER: &str = "udp_latency_server";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("'{command}' takes {expected} arguments, got {found}")]
    WrongArgumentCount {
        command: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid value '{value}' for argument {name}")]
    InvalidArgument { name: &'static str, value: String },
}

/// Start command written to one of the nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    /// Sending node: send every `interval_us` until `runtime_us` has elapsed.
    LatencyClient {
        runtime_us: u64,
        payload_size_bytes: u32,
        interval_us: u64,
        random_payload: bool,
    },
    /// Receiving node: listen until no packet arrived for `timeout_us`.
    LatencyServer {
        timeout_us: u64,
        payload_size_bytes: u32,
        random_payload: bool,
    },
}

impl NodeCommand {
    pub fn client(config: &RunConfig) -> Self {
        NodeCommand::LatencyClient {
            runtime_us: config.runtime_us,
            payload_size_bytes: config.payload_size_bytes,
            interval_us: config.interval_us,
            random_payload: config.random_payload,
        }
    }

    pub fn server(config: &RunConfig, timeout: Duration) -> Self {
        NodeCommand::LatencyServer {
            timeout_us: u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX),
            payload_size_bytes: config.payload_size_bytes,
            random_payload: config.random_payload,
        }
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeCommand::LatencyClient {
                runtime_us,
                payload_size_bytes,
                interval_us,
                random_payload,
            } => write!(
                f,
                "{CLIENT} {runtime_us} {payload_size_bytes} {interval_us} {}",
                u8::from(*random_payload)
            ),
            NodeCommand::LatencyServer {
                timeout_us,
                payload_size_bytes,
                random_payload,
            } => write!(
                f,
                "{SERVER} {timeout_us} {payload_size_bytes} {}",
                u8::from(*random_payload)
            ),
        }
    }
}

fn number<T: FromStr>(name: &'static str, value: &str) -> Result<T, CommandError> {
    value.parse().map_err(|_| CommandError::InvalidArgument {
        name,
        value: value.to_string(),
    })
}

fn flag(name: &'static str, value: &str) -> Result<bool, CommandError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(CommandError::InvalidArgument {
            name,
            value: value.to_string(),
        }),
    }
}

impl FromStr for NodeCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = words.split_first() else {
            return Err(CommandError::UnknownCommand(String::new()));
        };

        match name {
            CLIENT => {
                if args.len() != 4 {
                    return Err(CommandError::WrongArgumentCount {
                        command: CLIENT,
                        expected: 4,
                        found: args.len(),
                    });
                }
                Ok(NodeCommand::LatencyClient {
                    runtime_us: number("runtime_us", args[0])?,
                    payload_size_bytes: number("payload size", args[1])?,
                    interval_us: number("interval_us", args[2])?,
                    random_payload: flag("random", args[3])?,
                })
            }
            SERVER => {
                if args.len() != 3 {
                    return Err(CommandError::WrongArgumentCount {
                        command: SERVER,
                        expected: 3,
                        found: args.len(),
                    });
                }
                Ok(NodeCommand::LatencyServer {
                    timeout_us: number("timeout_us", args[0])?,
                    payload_size_bytes: number("payload size", args[1])?,
                    random_payload: flag("random", args[2])?,
                })
            }
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}
