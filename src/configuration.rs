//! Per-command configuration built from an argument vector.
//!
//! The scheduler treats a [`Configuration`] as opaque apart from the command
//! options it needs for scheduling (loop mode, loop delay, invocation timeout)
//! and the device requirements it allocates against.

use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use rand::Rng;

use crate::device::DeviceRequirement;
use crate::error::ConfigError;

/// Name given to the device slot of a single-device configuration.
pub const DEFAULT_DEVICE_NAME: &str = "default";

/// Scheduling-related options of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Re-enqueue the command after each dispatch.
    pub loop_mode: bool,
    /// Delay before a looping command becomes ready again, in milliseconds.
    pub min_loop_time_ms: u64,
    /// When set, the loop delay is sampled uniformly from
    /// `[min_loop_time_ms, max_random_loop_time_ms]`.
    pub max_random_loop_time_ms: Option<u64>,
    /// Hard limit on a single invocation, zero for none.
    pub invocation_timeout_ms: u64,
}

impl CommandOptions {
    /// Delay applied before the next loop iteration becomes ready.
    ///
    /// A maximum below the minimum is a configuration mistake: it is logged
    /// and the minimum is used.
    pub fn loop_delay(&self) -> Duration {
        let min = self.min_loop_time_ms;
        match self.max_random_loop_time_ms {
            Some(max) if max < min => {
                tracing::error!(
                    min_loop_time_ms = min,
                    max_random_loop_time_ms = max,
                    "Max random loop time is below min loop time, using min"
                );
                Duration::from_millis(min)
            }
            Some(max) => {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(min..=max))
            }
            None => Duration::from_millis(min),
        }
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        if self.invocation_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.invocation_timeout_ms))
        }
    }
}

/// One named device slot of a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub requirement: DeviceRequirement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub name: String,
    /// The argument vector this configuration was built from.
    pub args: Vec<String>,
    pub options: CommandOptions,
    /// Device slots in declared order.
    pub device_configs: Vec<DeviceConfig>,
    /// What the invocation actually runs.
    pub command_line: Vec<String>,
}

impl Configuration {
    /// A single-device configuration with default options.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            args: vec![name.clone()],
            name,
            options: CommandOptions::default(),
            device_configs: vec![DeviceConfig {
                name: DEFAULT_DEVICE_NAME.to_string(),
                requirement: DeviceRequirement::any(),
            }],
            command_line: Vec::new(),
        }
    }

    pub fn is_loop_mode(&self) -> bool {
        self.options.loop_mode
    }

    pub fn is_multi_device(&self) -> bool {
        self.device_configs.len() > 1
    }
}

/// Turns an argument vector into a [`Configuration`].
pub trait ConfigurationFactory: Send + Sync {
    fn create_configuration(&self, args: &[String]) -> Result<Configuration, ConfigError>;
}

#[derive(Parser, Debug)]
#[command(
    name = "command",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct CommandArgs {
    /// Configuration name
    config: String,

    /// Re-enqueue the command after every run
    #[arg(long = "loop")]
    loop_mode: bool,

    #[arg(long, default_value_t = 0)]
    min_loop_time: u64,

    #[arg(long)]
    max_random_loop_time: Option<u64>,

    #[arg(long, default_value_t = 0)]
    invocation_timeout: u64,

    /// Declare a named device slot; repeat for multi-device commands
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Serial of the device to run on, bound to device slots by position
    #[arg(short = 's', long = "serial")]
    serials: Vec<String>,

    #[arg(long)]
    product: Option<String>,

    /// Run against placeholder devices
    #[arg(long)]
    null_device: bool,

    /// Command line run by the invocation
    #[arg(last = true)]
    command_line: Vec<String>,
}

/// Factory parsing scheduler flags with clap.
///
/// ```text
/// <config> [--loop] [--min-loop-time MS] [--max-random-loop-time MS]
///          [--invocation-timeout MS] [--device NAME]... [-s SERIAL]...
///          [--product P] [--null-device] [-- command line...]
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgsConfigurationFactory;

impl ArgsConfigurationFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ConfigurationFactory for ArgsConfigurationFactory {
    fn create_configuration(&self, args: &[String]) -> Result<Configuration, ConfigError> {
        let parsed = CommandArgs::try_parse_from(args).map_err(|e| match e.kind() {
            ErrorKind::MissingRequiredArgument => ConfigError::MissingName,
            _ => ConfigError::InvalidArgs(
                e.to_string()
                    .lines()
                    .next()
                    .unwrap_or("unparseable arguments")
                    .trim_start_matches("error: ")
                    .to_string(),
            ),
        })?;

        let names = if parsed.devices.is_empty() {
            vec![DEFAULT_DEVICE_NAME.to_string()]
        } else {
            parsed.devices
        };
        if parsed.serials.len() > names.len() {
            return Err(ConfigError::SerialMismatch(
                parsed.serials.len(),
                names.len(),
            ));
        }

        let device_configs = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| DeviceConfig {
                name,
                requirement: DeviceRequirement {
                    serial: parsed.serials.get(i).cloned(),
                    product: parsed.product.clone(),
                    placeholder: parsed.null_device,
                },
            })
            .collect();

        Ok(Configuration {
            name: parsed.config,
            args: args.to_vec(),
            options: CommandOptions {
                loop_mode: parsed.loop_mode,
                min_loop_time_ms: parsed.min_loop_time,
                max_random_loop_time_ms: parsed.max_random_loop_time,
                invocation_timeout_ms: parsed.invocation_timeout,
            },
            device_configs,
            command_line: parsed.command_line,
        })
    }
}

/// Insert `extra` into `args` ahead of any `--` separator so appended flags
/// stay flags instead of becoming part of the command line.
pub fn append_extra_args(args: &mut Vec<String>, extra: &[String]) {
    match args.iter().position(|a| a == "--") {
        Some(pos) => {
            args.splice(pos..pos, extra.iter().cloned());
        }
        None => args.extend(extra.iter().cloned()),
    }
}
