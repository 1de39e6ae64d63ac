//! CLI parsing and experiment configuration
//!
//! Two parsers, one per binary. The workload generator takes scalar flags
//! that map straight onto `EngineParams`. The supervisor takes per-variant
//! instance counts plus comma-separated list flags that are expanded to the
//! instance count: a list must have either exactly one element (repeated)
//! or exactly `num` elements.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};

use crate::params::{EngineKind, EngineParams, MAX_IODEPTH};
use crate::Result;

/// blkload - raw block I/O load generator
#[derive(Parser, Debug)]
#[command(name = "blkload")]
#[command(version, about, long_about = None)]
#[command(rename_all = "snake_case")]
pub struct LoadCli {
    /// Log level (output,debug,info)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print date and time in each log line
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub log_time_prefix: bool,

    /// Socket used to control the experiment
    #[arg(long, default_value = "")]
    pub socket: String,

    /// Duration of the experiment in seconds (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    pub duration: u32,

    /// Workload file name
    #[arg(long)]
    pub filename: String,

    /// Create the workload file
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub create_file: bool,

    /// Delete the workload file on exit, if created
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub delete_file: bool,

    /// File size in MiB (required when creating; adopted from the file
    /// otherwise)
    #[arg(long, default_value_t = 0)]
    pub filesize: u64,

    /// I/O engine
    #[arg(long, value_enum, default_value = "posix")]
    pub io_engine: EngineKind,

    /// Number of requests in flight
    #[arg(long, default_value_t = 1)]
    pub iodepth: u32,

    /// Block size in KiB
    #[arg(long, default_value_t = 4)]
    pub block_size: u64,

    /// Blocks written before a fdatasync (0 = no flush)
    #[arg(long, default_value_t = 0)]
    pub flush_blocks: u64,

    /// Writes/reads ratio (0-1)
    #[arg(long, default_value_t = 0.0)]
    pub write_ratio: f64,

    /// Random access ratio (0-1)
    #[arg(long, default_value_t = 0.0)]
    pub random_ratio: f64,

    /// Same as --o_direct=true --o_dsync=true (backward compatibility)
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub direct_io: bool,

    /// Open the file with O_DIRECT
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub o_direct: bool,

    /// Synchronous writes (O_DSYNC or RWF_DSYNC, depending on the engine)
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub o_dsync: bool,

    /// Statistics interval in seconds
    #[arg(long, default_value_t = 5)]
    pub stats_interval: u32,

    /// Start in wait mode
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub wait: bool,

    /// Script of commands. Syntax: "time1:command1=value1;time2:command2=value2"
    #[arg(long, default_value = "")]
    pub command_script: String,
}

impl LoadCli {
    pub fn validate(&self) -> Result<()> {
        if self.filename.is_empty() {
            bail!("--filename must not be empty");
        }
        if self.create_file && self.filesize < 10 {
            bail!("--filesize must be >= 10 MiB when creating the file");
        }
        if self.block_size < 4 {
            bail!("--block_size must be >= 4 KiB");
        }
        if self.iodepth == 0 || self.iodepth > MAX_IODEPTH {
            bail!("--iodepth must be in 1..{}", MAX_IODEPTH);
        }
        if self.io_engine == EngineKind::Posix && self.iodepth > 1 {
            bail!("io_engine posix only supports iodepth 1");
        }
        if !(0.0..=1.0).contains(&self.write_ratio) {
            bail!("--write_ratio must be in [0,1]");
        }
        if !(0.0..=1.0).contains(&self.random_ratio) {
            bail!("--random_ratio must be in [0,1]");
        }
        if self.stats_interval == 0 {
            bail!("--stats_interval must be > 0");
        }
        if !self.socket.is_empty() && std::path::Path::new(&self.socket).exists() {
            bail!("socket path \"{}\" already exists", self.socket);
        }
        parse_command_script(&self.command_script)?;
        Ok(())
    }

    /// Build the shared parameter block, applying the `direct_io` alias.
    pub fn to_params(&self) -> Arc<EngineParams> {
        let o_direct = self.o_direct || self.direct_io;
        let o_dsync = self.o_dsync || self.direct_io;
        Arc::new(EngineParams::new(
            self.filename.clone(),
            self.io_engine,
            self.create_file,
            self.delete_file,
            o_direct,
            o_dsync,
            self.stats_interval,
            self.duration,
            self.filesize,
            self.block_size,
            self.iodepth,
            self.write_ratio,
            self.random_ratio,
            self.flush_blocks,
            self.wait,
        ))
    }

    /// One-line summary of every parameter, logged at startup.
    pub fn summary(&self) -> String {
        format!(
            "--log_level=\"{}\" --log_time_prefix=\"{}\" --socket=\"{}\" --duration=\"{}\" \
             --filename=\"{}\" --create_file=\"{}\" --delete_file=\"{}\" --filesize=\"{}\" \
             --io_engine=\"{}\" --iodepth=\"{}\" --block_size=\"{}\" --flush_blocks=\"{}\" \
             --write_ratio=\"{}\" --random_ratio=\"{}\" --o_direct=\"{}\" --o_dsync=\"{}\" \
             --stats_interval=\"{}\" --wait=\"{}\" --command_script=\"{}\"",
            self.log_level,
            self.log_time_prefix,
            self.socket,
            self.duration,
            self.filename,
            self.create_file,
            self.delete_file,
            self.filesize,
            self.io_engine,
            self.iodepth,
            self.block_size,
            self.flush_blocks,
            self.write_ratio,
            self.random_ratio,
            self.o_direct,
            self.o_dsync,
            self.stats_interval,
            self.wait,
            self.command_script,
        )
    }
}

/// One scheduled entry of a `--command_script`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    pub time_s: u64,
    pub command: String,
}

/// Parse `"t1:cmd1;t2:cmd2"`, where a time is `N`, `Ns` or `Nm`.
pub fn parse_command_script(script: &str) -> Result<VecDeque<ScriptCommand>> {
    let mut commands = VecDeque::new();
    if script.is_empty() {
        return Ok(commands);
    }

    for entry in script.split(';') {
        let (time_str, command) = entry
            .split_once(':')
            .with_context(|| format!("Invalid command in command_script: {}", entry))?;

        let time_str = time_str.trim();
        let (digits, unit) = match time_str.strip_suffix(&['s', 'm'][..]) {
            Some(digits) => (digits, &time_str[time_str.len() - 1..]),
            None => (time_str, "s"),
        };
        let mut time_s: u64 = digits
            .parse()
            .with_context(|| format!("Invalid time: {}", time_str))?;
        if unit == "m" {
            time_s *= 60;
        }

        commands.push_back(ScriptCommand {
            time_s,
            command: command.trim().to_string(),
        });
    }
    Ok(commands)
}

/// ioduel - experiment supervisor
#[derive(Parser, Debug, Clone)]
#[command(name = "ioduel")]
#[command(version, about, long_about = None)]
#[command(rename_all = "snake_case")]
pub struct SupervisorCli {
    /// Log level (output,debug,info)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print date and time in each log line
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub log_time_prefix: bool,

    /// Duration of the experiment in minutes
    #[arg(long)]
    pub duration: u32,

    /// Warm-up period in minutes (stats suppressed)
    #[arg(long, default_value_t = 0)]
    pub warm_period: u32,

    /// Statistics interval of every workload in seconds
    #[arg(long, default_value_t = 5)]
    pub stats_interval: u32,

    /// Align the report phases of all instances
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub sync_stats: bool,

    /// Unix socket of the command server (empty disables it)
    #[arg(long, default_value = "")]
    pub socket: String,

    /// Commands fed to the command server at startup
    #[arg(long, default_value = "")]
    pub commands: String,

    /// Container image holding the workload binaries
    #[arg(long, default_value = "ioduel-workloads")]
    pub container_image: String,

    /// Extra parameters passed to the container runtime
    #[arg(long, default_value = "")]
    pub container_params: String,

    /// Connect to a local performance counter daemon
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub perfmon: bool,

    /// TCP port of the performance counter daemon
    #[arg(long, default_value_t = 18087)]
    pub perfmon_port: u16,

    // === KV benchmark instances ===
    /// Number of KV benchmark instances
    #[arg(long, default_value_t = 0)]
    pub num_kv: u32,

    /// Database directories (list)
    #[arg(long, default_value = "")]
    pub kv_path: String,

    /// Benchmark names: readwhilewriting, readrandomwriterandom, mixgraph (list)
    #[arg(long, default_value = "readwhilewriting")]
    pub kv_benchmark: String,

    /// Number of keys (list)
    #[arg(long, default_value = "50000000")]
    pub kv_num_keys: String,

    /// Block cache sizes in bytes (list)
    #[arg(long, default_value = "268435456")]
    pub kv_cache_size: String,

    /// Benchmark threads (list)
    #[arg(long, default_value = "9")]
    pub kv_threads: String,

    /// Read percentage for readrandomwriterandom (list)
    #[arg(long, default_value = "90")]
    pub kv_readwritepercent: String,

    /// Sine cycles for mixgraph (list)
    #[arg(long, default_value = "1")]
    pub kv_sine_cycles: String,

    /// Sine shift in minutes for mixgraph (list)
    #[arg(long, default_value = "0")]
    pub kv_sine_shift: String,

    /// Extra benchmark parameters (list)
    #[arg(long, default_value = "")]
    pub kv_params: String,

    /// Bulkload and compact the databases before the run
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub kv_create: bool,

    /// Options file copied into each KV container
    #[arg(long, default_value = "")]
    pub kv_config_file: String,

    // === client simulator instances ===
    /// Number of client simulator instances
    #[arg(long, default_value_t = 0)]
    pub num_sim: u32,

    /// Database directories (list)
    #[arg(long, default_value = "")]
    pub sim_path: String,

    /// Workload spec name or file (list)
    #[arg(long, default_value = "workloadb")]
    pub sim_workload: String,

    /// Record counts (list)
    #[arg(long, default_value = "50000000")]
    pub sim_num_keys: String,

    /// Client threads (list)
    #[arg(long, default_value = "5")]
    pub sim_threads: String,

    /// Startup sleep in minutes (list)
    #[arg(long, default_value = "0")]
    pub sim_sleep: String,

    /// Extra simulator parameters (list)
    #[arg(long, default_value = "")]
    pub sim_params: String,

    /// Load the simulator databases before the run
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub sim_create: bool,

    /// Collect per-column-family reports over the simulator socket
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub sim_socket: bool,

    // === raw I/O instances ===
    /// Number of raw I/O load instances
    #[arg(long, default_value_t = 0)]
    pub num_load: u32,

    /// Workload directories (list)
    #[arg(long, default_value = "")]
    pub load_dir: String,

    /// Workload file names inside each directory (list)
    #[arg(long, default_value = "workload.dat")]
    pub load_file: String,

    /// Block sizes in KiB (list)
    #[arg(long, default_value = "4")]
    pub load_block_size: String,

    /// I/O engines, empty for the generator default (list)
    #[arg(long, default_value = "")]
    pub load_io_engine: String,

    /// iodepth values, empty for the generator default (list)
    #[arg(long, default_value = "")]
    pub load_iodepth: String,

    /// O_DIRECT values, empty for the generator default (list)
    #[arg(long, default_value = "")]
    pub load_o_direct: String,

    /// O_DSYNC values, empty for the generator default (list)
    #[arg(long, default_value = "")]
    pub load_o_dsync: String,

    /// Command scripts (list)
    #[arg(long, default_value = "")]
    pub load_script: String,

    /// Extra generator parameters (list)
    #[arg(long, default_value = "")]
    pub load_params: String,
}

/// Per-instance settings of one KV benchmark container
#[derive(Debug, Clone)]
pub struct KvInstance {
    pub path: String,
    pub benchmark: String,
    pub num_keys: String,
    pub cache_size: String,
    pub threads: String,
    pub readwritepercent: String,
    pub sine_cycles: u32,
    pub sine_shift: u32,
    pub params: String,
}

/// Per-instance settings of one client simulator container
#[derive(Debug, Clone)]
pub struct SimInstance {
    pub path: String,
    pub workload: String,
    pub num_keys: String,
    pub threads: String,
    pub sleep_min: u32,
    pub params: String,
}

/// Per-instance settings of one raw I/O container
#[derive(Debug, Clone)]
pub struct LoadInstance {
    pub dir: String,
    pub file: String,
    pub block_size: String,
    pub io_engine: String,
    pub iodepth: String,
    pub o_direct: String,
    pub o_dsync: String,
    pub script: String,
    pub params: String,
}

/// Fully expanded supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub cli: SupervisorCli,
    pub kv: Vec<KvInstance>,
    pub sim: Vec<SimInstance>,
    pub load: Vec<LoadInstance>,
}

impl SupervisorCli {
    pub fn validate(&self) -> Result<()> {
        if self.duration == 0 {
            bail!("--duration must be >= 1 minute");
        }
        if self.stats_interval == 0 {
            bail!("--stats_interval must be > 0");
        }
        Ok(())
    }

    /// Expand every list flag to its instance count.
    pub fn expand(&self) -> Result<SupervisorConfig> {
        let kv_path = expand_list("kv_path", &self.kv_path, self.num_kv)?;
        let kv_benchmark = expand_list("kv_benchmark", &self.kv_benchmark, self.num_kv)?;
        let kv_num_keys = expand_list("kv_num_keys", &self.kv_num_keys, self.num_kv)?;
        let kv_cache_size = expand_list("kv_cache_size", &self.kv_cache_size, self.num_kv)?;
        let kv_threads = expand_list("kv_threads", &self.kv_threads, self.num_kv)?;
        let kv_rwp = expand_list(
            "kv_readwritepercent",
            &self.kv_readwritepercent,
            self.num_kv,
        )?;
        let kv_sine_cycles = expand_list("kv_sine_cycles", &self.kv_sine_cycles, self.num_kv)?;
        let kv_sine_shift = expand_list("kv_sine_shift", &self.kv_sine_shift, self.num_kv)?;
        let kv_params = expand_list("kv_params", &self.kv_params, self.num_kv)?;

        let mut kv = Vec::new();
        for i in 0..self.num_kv as usize {
            if kv_path[i].is_empty() {
                bail!("--kv_path is required for every KV instance");
            }
            kv.push(KvInstance {
                path: kv_path[i].clone(),
                benchmark: kv_benchmark[i].clone(),
                num_keys: kv_num_keys[i].clone(),
                cache_size: kv_cache_size[i].clone(),
                threads: kv_threads[i].clone(),
                readwritepercent: kv_rwp[i].clone(),
                sine_cycles: parse_u32("kv_sine_cycles", &kv_sine_cycles[i])?,
                sine_shift: parse_u32("kv_sine_shift", &kv_sine_shift[i])?,
                params: kv_params[i].clone(),
            });
        }

        let sim_path = expand_list("sim_path", &self.sim_path, self.num_sim)?;
        let sim_workload = expand_list("sim_workload", &self.sim_workload, self.num_sim)?;
        let sim_num_keys = expand_list("sim_num_keys", &self.sim_num_keys, self.num_sim)?;
        let sim_threads = expand_list("sim_threads", &self.sim_threads, self.num_sim)?;
        let sim_sleep = expand_list("sim_sleep", &self.sim_sleep, self.num_sim)?;
        let sim_params = expand_list("sim_params", &self.sim_params, self.num_sim)?;

        let mut sim = Vec::new();
        for i in 0..self.num_sim as usize {
            if sim_path[i].is_empty() {
                bail!("--sim_path is required for every simulator instance");
            }
            sim.push(SimInstance {
                path: sim_path[i].clone(),
                workload: sim_workload[i].clone(),
                num_keys: sim_num_keys[i].clone(),
                threads: sim_threads[i].clone(),
                sleep_min: parse_u32("sim_sleep", &sim_sleep[i])?,
                params: sim_params[i].clone(),
            });
        }

        let load_dir = expand_list("load_dir", &self.load_dir, self.num_load)?;
        let load_file = expand_list("load_file", &self.load_file, self.num_load)?;
        let load_block_size = expand_list("load_block_size", &self.load_block_size, self.num_load)?;
        let load_io_engine = expand_list("load_io_engine", &self.load_io_engine, self.num_load)?;
        let load_iodepth = expand_list("load_iodepth", &self.load_iodepth, self.num_load)?;
        let load_o_direct = expand_list("load_o_direct", &self.load_o_direct, self.num_load)?;
        let load_o_dsync = expand_list("load_o_dsync", &self.load_o_dsync, self.num_load)?;
        let load_script = expand_list("load_script", &self.load_script, self.num_load)?;
        let load_params = expand_list("load_params", &self.load_params, self.num_load)?;

        let mut load = Vec::new();
        for i in 0..self.num_load as usize {
            if load_dir[i].is_empty() {
                bail!("--load_dir is required for every raw I/O instance");
            }
            load.push(LoadInstance {
                dir: load_dir[i].clone(),
                file: load_file[i].clone(),
                block_size: load_block_size[i].clone(),
                io_engine: load_io_engine[i].clone(),
                iodepth: load_iodepth[i].clone(),
                o_direct: load_o_direct[i].clone(),
                o_dsync: load_o_dsync[i].clone(),
                script: load_script[i].clone(),
                params: load_params[i].clone(),
            });
        }

        Ok(SupervisorConfig {
            cli: self.clone(),
            kv,
            sim,
            load,
        })
    }
}

fn parse_u32(name: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .with_context(|| format!("invalid value in the list {}: \"{}\"", name, value))
}

/// Expand a comma-separated list to exactly `num` elements: a single element
/// is repeated, `num` elements pass through, anything else is an error.
pub fn expand_list(name: &str, src: &str, num: u32) -> Result<Vec<String>> {
    let num = num as usize;
    if num == 0 {
        return Ok(Vec::new());
    }
    let values: Vec<String> = src.split(',').map(|s| s.trim().to_string()).collect();
    if values.len() == num {
        Ok(values)
    } else if values.len() == 1 {
        Ok(vec![values[0].clone(); num])
    } else {
        bail!(
            "the list {} must have either one element or {}",
            name,
            num
        );
    }
}
