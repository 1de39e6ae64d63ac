//! Experiment tasks
//!
//! One task wraps one long-lived workload container: it builds the container
//! command, pipes the child's stdout through a per-variant line handler that
//! extracts named metrics into an insertion-ordered record, and exposes the
//! child's command socket. Three variants share the plumbing:
//!
//! - `KvBench`: the KV store's own benchmark driver
//! - `ClientSim`: the client simulator harness, optionally merging the
//!   store's socket report into each record
//! - `BlkLoad`: the raw I/O generator, with report-phase alignment

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;
use serde_json::Value;

use crate::config::SupervisorConfig;
use crate::util::time::{Clock, TimeSync};
use crate::util::tmpdir::TmpDir;
use crate::Result;

pub type JsonMap = serde_json::Map<String, Value>;

const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

/// One spawned child process with its stdout/stderr reader threads
pub struct ChildProcess {
    pid: u32,
    child: Mutex<Child>,
}

impl ChildProcess {
    pub fn spawn(
        task_name: &str,
        command: &str,
        stdout_handler: Arc<dyn Fn(&str) + Send + Sync>,
    ) -> Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn child of task {}", task_name))?;
        let pid = child.id();

        let stdout = child.stdout.take().expect("stdout piped");
        {
            let name = task_name.to_string();
            thread::Builder::new()
                .name(format!("{}-stdout", task_name))
                .spawn(move || {
                    for line in BufReader::new(stdout).lines() {
                        match line {
                            Ok(line) => stdout_handler(&line),
                            Err(err) => {
                                debug!("{}: stdout reader finished ({})", name, err);
                                break;
                            }
                        }
                    }
                })
                .context("failed to spawn stdout reader")?;
        }

        let stderr = child.stderr.take().expect("stderr piped");
        {
            let name = task_name.to_string();
            thread::Builder::new()
                .name(format!("{}-stderr", task_name))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        warn!("Task {}, stderr: {}", name, line);
                    }
                })
                .context("failed to spawn stderr reader")?;
        }

        Ok(ChildProcess {
            pid,
            child: Mutex::new(child),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_active(&self) -> bool {
        match self.child.lock().unwrap().try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => false,
        }
    }

    pub fn kill(&self) {
        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// State shared between a task and its stdout handler closure
pub struct TaskCore {
    pub name: String,
    pub container_name: String,
    pub clock: Arc<Clock>,
    pub warm_period_s: u64,
    pub tmpdir: Arc<TmpDir>,
    pub tsync: Option<Arc<TimeSync>>,
    pub primary: bool,
    pub socket_name: Option<String>,
    stop: AtomicBool,
    data: Mutex<JsonMap>,
    process: Mutex<Option<ChildProcess>>,
}

impl TaskCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        container_name: String,
        clock: Arc<Clock>,
        warm_period_s: u64,
        tmpdir: Arc<TmpDir>,
        tsync: Option<Arc<TimeSync>>,
        primary: bool,
        socket_name: Option<String>,
    ) -> Arc<Self> {
        Arc::new(TaskCore {
            name,
            container_name,
            clock,
            warm_period_s,
            tmpdir,
            tsync,
            primary,
            socket_name,
            stop: AtomicBool::new(false),
            data: Mutex::new(JsonMap::new()),
            process: Mutex::new(None),
        })
    }

    pub fn insert(&self, key: String, value: String) {
        self.data.lock().unwrap().insert(key, Value::String(value));
    }

    pub fn take_data(&self) -> JsonMap {
        std::mem::take(&mut *self.data.lock().unwrap())
    }

    /// Emit the accumulated record as `Task <name>, STATS: {json}`, but only
    /// after the warm period; the record is cleared either way.
    pub fn print(&self) {
        let mut map = self.take_data();
        self.print_map(&mut map);
    }

    pub fn print_map(&self, map: &mut JsonMap) {
        if map.is_empty() {
            warn!("no data in task {}", self.name);
        }
        let clock_s = self.clock.s();
        if clock_s > self.warm_period_s {
            let mut record = JsonMap::new();
            record.insert(
                "time".to_string(),
                Value::String(format!("{}", clock_s - self.warm_period_s)),
            );
            for (key, value) in map.iter() {
                if key != "time" {
                    record.insert(key.clone(), value.clone());
                }
            }
            info!(
                "Task {}, STATS: {}",
                self.name,
                Value::Object(record).to_string()
            );
        }
        map.clear();
    }

    pub fn set_process(&self, process: ChildProcess) {
        *self.process.lock().unwrap() = Some(process);
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.lock().unwrap().as_ref().map(|p| p.pid())
    }

    pub fn is_active(&self) -> bool {
        if self.stop.load(Ordering::Relaxed) {
            return false;
        }
        match self.process.lock().unwrap().as_ref() {
            Some(process) => process.is_active(),
            None => false,
        }
    }

    /// Send one command to the child over its Unix socket and collect the
    /// reply lines.
    pub fn send_command(&self, command: &str) -> Result<String> {
        let socket_name = match &self.socket_name {
            Some(name) => name,
            None => bail!("experiment does not implement a command socket"),
        };
        if self.stop.load(Ordering::Relaxed) {
            bail!("not active");
        }

        let socket_path = self.tmpdir.container_dir(&self.container_name)?.join(socket_name);
        debug!("initiating socket client: {}", socket_path.display());

        let mut stream = UnixStream::connect(&socket_path)
            .with_context(|| format!("can't connect to {}", socket_path.display()))?;
        stream.set_read_timeout(Some(COMMAND_REPLY_TIMEOUT))?;
        stream.write_all(command.as_bytes())?;

        let mut reply = String::new();
        match stream.read_to_string(&mut reply) {
            Ok(_) => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err).context("socket read error"),
        }
        Ok(reply.trim_end().to_string())
    }

    /// Remove the backing container by name and release the child handle.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let output = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .output();
        if let Err(err) = output {
            warn!("failed to remove container {}: {}", self.container_name, err);
        }
        if let Some(process) = self.process.lock().unwrap().take() {
            process.kill();
        }
    }
}

/// Common surface of the three workload variants
pub trait ExperimentTask: Send + Sync {
    fn core(&self) -> &Arc<TaskCore>;

    /// One-time foreground creation step before `start` (database bulkload,
    /// workload file creation). Default: nothing to create.
    fn create_resources(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()>;

    fn name(&self) -> &str {
        &self.core().name
    }

    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    fn send_command(&self, params: &str) -> Result<String> {
        self.core().send_command(params)
    }

    fn shutdown(&self) {
        self.core().shutdown()
    }
}

/// Run a foreground shell command; used by the creation steps.
fn run_shell(description: &str, command: &str) -> Result<()> {
    info!("{}. Command:\n{}", description, command);
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .with_context(|| format!("failed to run: {}", description))?;
    if !status.success() {
        bail!("{} error ({})", description, status);
    }
    Ok(())
}

lazy_static! {
    static ref RE_KV_THREAD: Regex = Regex::new(
        r"thread ([0-9]+): \(([0-9.]+),([0-9.]+)\) ops and \(([0-9.]+),([0-9.]+)\) ops/second in \(([0-9.]+),([0-9.]+)\) seconds"
    )
    .unwrap();
    static ref RE_KV_WRITES: Regex = Regex::new(
        r"Interval writes: ([0-9.]+[KMGT]*) writes, ([0-9.]+[KMGT]*) keys, ([0-9.]+[KMGT]*) commit groups, ([0-9.]+[KMGT]*) writes per commit group, ingest: ([0-9.]+) [KMGT]*B, ([0-9.]+) [KMGT]*B/s"
    )
    .unwrap();
    static ref RE_KV_WAL: Regex = Regex::new(
        r"Interval WAL: ([0-9.]+[KMGT]*) writes, ([0-9.]+[KMGT]*) syncs, ([0-9.]+[KMGT]*) writes per sync, written: ([0-9.]+) [KMGT]*B, ([0-9.]+) [KMGT]*B/s"
    )
    .unwrap();
    static ref RE_KV_STALL: Regex =
        Regex::new(r"Interval stall: ([0-9:.]+) H:M:S, ([0-9.]+) percent").unwrap();
    static ref RE_SIM_STATUS: Regex = Regex::new(
        r"[0-9]{4}-[0-9]{2}-[0-9]{2} +[0-9:]+ +[0-9]+ +sec: +([0-9]+) +operations; +([0-9.,]+) +current[^\[]*(.*)"
    )
    .unwrap();
    static ref RE_SIM_GROUP: Regex = Regex::new(r"\[([^:\]]+): *([^\]]+)\] *(\[.*)?").unwrap();
    static ref RE_LOAD_STATS: Regex = Regex::new(r"STATS: \{[^,]+, ([^\}]+)\}").unwrap();
    static ref RE_SOCKET_REPORT: Regex = Regex::new(r"socket_server.json: (.*)").unwrap();
}

// ---------------------------------------------------------------------------
// KV benchmark task

pub struct KvBench {
    config: Arc<SupervisorConfig>,
    index: usize,
    core: Arc<TaskCore>,
    /// Per-interval accumulation of the per-thread ops lines
    ops_accum: Arc<Mutex<(u64, f64)>>,
}

impl KvBench {
    pub fn new(
        config: Arc<SupervisorConfig>,
        index: usize,
        clock: Arc<Clock>,
        tmpdir: Arc<TmpDir>,
        tsync: Option<Arc<TimeSync>>,
        primary: bool,
    ) -> Self {
        let core = TaskCore::new(
            format!("kvbench[{}]", index),
            format!("kv_{}", index),
            clock,
            config.cli.warm_period as u64 * 60,
            tmpdir,
            tsync,
            primary,
            None,
        );
        KvBench {
            config,
            index,
            core,
            ops_accum: Arc::new(Mutex::new((0, 0.0))),
        }
    }

    fn instance(&self) -> &crate::config::KvInstance {
        &self.config.kv[self.index]
    }

    fn docker_cmd(&self) -> Result<String> {
        let cli = &self.config.cli;
        let mut cmd = format!(
            "docker run --name=\"{}\" -t --rm \\\n\
             \x20 --ulimit nofile=1048576:1048576 \\\n\
             \x20 -v \"{}\":/workdata \\\n\
             \x20 -v {}:/tmp/host \\\n",
            self.core.container_name,
            self.instance().path,
            self.core
                .tmpdir
                .container_dir(&self.core.container_name)?
                .display(),
        );
        if !cli.kv_config_file.is_empty() {
            let copy = self
                .core
                .tmpdir
                .file_copy(std::path::Path::new(&cli.kv_config_file))?;
            cmd += &format!("  -v \"{}\":/kvstore.options \\\n", copy.display());
        }
        if !cli.container_params.is_empty() {
            cmd += &format!("  {} \\\n", cli.container_params);
        }
        cmd += &format!("  {} \\\n", cli.container_image);
        Ok(cmd)
    }

    fn const_params(&self) -> String {
        let cli = &self.config.cli;
        let inst = self.instance();
        let mut ret = format!(
            "    --db=\"/workdata\" \\\n\
             \x20   --wal_dir=\"/workdata\" \\\n\
             \x20   --num={} \\\n\
             \x20   --key_size=20 \\\n\
             \x20   --value_size=400 \\\n\
             \x20   --block_size={} \\\n\
             \x20   --cache_size={} \\\n\
             \x20   --verify_checksum=1 \\\n\
             \x20   --bloom_bits=10 \\\n\
             \x20   --open_files=-1 \\\n",
            inst.num_keys,
            8 * 1024,
            inst.cache_size,
        );
        if !cli.kv_config_file.is_empty() {
            ret += "    --options_file=\"/kvstore.options\" \\\n";
        }
        ret
    }

    fn params_w(&self) -> String {
        self.const_params()
            + "    --level0_file_num_compaction_trigger=4 \\\n\
               \x20   --level0_stop_writes_trigger=20 \\\n\
               \x20   --max_background_compactions=16 \\\n\
               \x20   --max_write_buffer_number=8 \\\n\
               \x20   --max_background_flushes=7 \\\n"
    }

    fn run_cmd(&self) -> Result<String> {
        let cli = &self.config.cli;
        let inst = self.instance();
        let duration_s = cli.duration * 60;

        let benchmark_params = match inst.benchmark.as_str() {
            "readwhilewriting" => String::new(),
            "readrandomwriterandom" => {
                format!("    --readwritepercent={} \\\n", inst.readwritepercent)
            }
            "mixgraph" => {
                // stretch the sine period over the experiment duration
                let sine_b =
                    0.000073 * 24.0 * 60.0 * (inst.sine_cycles as f64 / cli.duration as f64);
                let sine_c = sine_b * inst.sine_shift as f64 * 60.0;
                format!(
                    "    --mix_get_ratio=0.83 \\\n\
                     \x20   --mix_put_ratio=0.14 \\\n\
                     \x20   --mix_seek_ratio=0.03 \\\n\
                     \x20   --sine_mix_rate_interval_milliseconds=5000 \\\n\
                     \x20   --sine_b={} \\\n\
                     \x20   --sine_c={} \\\n",
                    sine_b, sine_c
                )
            }
            other => bail!("invalid benchmark name: \"{}\"", other),
        };

        Ok(self.docker_cmd()?
            + &format!(
                "  kv_bench --benchmarks={} \\\n\
                 \x20   --duration={} \\\n",
                inst.benchmark, duration_s
            )
            + &self.params_w()
            + &format!(
                "    --use_existing_db=true \\\n\
                 \x20   --threads={} \\\n\
                 \x20   --perf_level=2 \\\n\
                 \x20   --stats_interval_seconds={} \\\n\
                 \x20   --stats_per_interval=1 \\\n\
                 \x20   --sync=1 \\\n\
                 \x20   --merge_operator=\"put\" \\\n\
                 \x20   --seed=$( date +%s ) \\\n",
                inst.threads, cli.stats_interval
            )
            + &benchmark_params
            + &format!("    {} 2>&1 ", inst.params))
    }

    fn stdout_handler(core: &Arc<TaskCore>, accum: &Arc<Mutex<(u64, f64)>>, line: &str) {
        info!("Task {}, stdout: {}", core.name, line);

        if let Some(cm) = RE_KV_THREAD.captures(line) {
            let mut accum = accum.lock().unwrap();
            accum.0 += cm[2].parse::<f64>().unwrap_or(0.0) as u64;
            accum.1 += cm[4].parse::<f64>().unwrap_or(0.0);
            core.insert("ops".to_string(), format!("{}", accum.0));
            core.insert("ops_per_s".to_string(), format!("{:.1}", accum.1));
            core.insert(format!("ops[{}]", &cm[1]), cm[2].to_string());
            core.insert(format!("ops_per_s[{}]", &cm[1]), cm[4].to_string());
        }
        if let Some(cm) = RE_KV_WRITES.captures(line) {
            core.insert("writes".to_string(), cm[1].to_string());
            core.insert("written_keys".to_string(), cm[2].to_string());
            core.insert("written_commit_groups".to_string(), cm[3].to_string());
            // the byte-rate capture is the authoritative ingest metric
            core.insert("ingest_MBps".to_string(), cm[6].to_string());
        }
        if let Some(cm) = RE_KV_WAL.captures(line) {
            core.insert("WAL_writes".to_string(), cm[1].to_string());
            core.insert("WAL_syncs".to_string(), cm[2].to_string());
            core.insert("WAL_written_MB".to_string(), cm[4].to_string());
            core.insert("WAL_written_MBps".to_string(), cm[5].to_string());
        }
        if let Some(cm) = RE_KV_STALL.captures(line) {
            core.insert("stall".to_string(), cm[1].to_string());
            core.insert("stall_percent".to_string(), cm[2].to_string());

            // the stall line closes one stats interval
            if core.primary {
                if let Some(tsync) = &core.tsync {
                    tsync.new_report();
                }
            }
            core.print();
            *accum.lock().unwrap() = (0, 0.0);
        }
    }
}

impl ExperimentTask for KvBench {
    fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    fn create_resources(&self) -> Result<()> {
        if !self.config.cli.kv_create {
            return Ok(());
        }
        let stats_params = "    --statistics=0 \\\n\
                            \x20   --stats_per_interval=1 \\\n\
                            \x20   --stats_interval_seconds=60 \\\n\
                            \x20   --histogram=1 \\\n";
        let bulkload = self.docker_cmd()?
            + "  kv_bench --benchmarks=fillrandom \\\n\
               \x20   --use_existing_db=0 \\\n\
               \x20   --disable_auto_compactions=1 \\\n\
               \x20   --sync=0 \\\n"
            + &self.const_params()
            + "    --threads=1 \\\n\
               \x20   --memtablerep=vector \\\n\
               \x20   --allow_concurrent_memtable_write=false \\\n\
               \x20   --disable_wal=1 \\\n\
               \x20   --seed=$( date +%s ) \\\n"
            + stats_params
            + "    2>&1 ";
        run_shell(&format!("Bulkload {}", self.core.name), &bulkload)?;

        let compact = self.docker_cmd()?
            + "  kv_bench --benchmarks=compact \\\n\
               \x20   --use_existing_db=1 \\\n\
               \x20   --disable_auto_compactions=1 \\\n\
               \x20   --sync=0 \\\n"
            + &self.params_w()
            + "    --threads=1 \\\n"
            + stats_params
            + "    2>&1 ";
        run_shell(&format!("Compact {}", self.core.name), &compact)
    }

    fn start(&self) -> Result<()> {
        let cmd = self.run_cmd()?;
        info!("Executing {}. Command:\n{}", self.core.name, cmd);
        let core = self.core.clone();
        let accum = self.ops_accum.clone();
        let handler: Arc<dyn Fn(&str) + Send + Sync> =
            Arc::new(move |line| KvBench::stdout_handler(&core, &accum, line));
        let process = ChildProcess::spawn(&self.core.name, &cmd, handler)?;
        self.core.set_process(process);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client simulator task

pub struct ClientSim {
    config: Arc<SupervisorConfig>,
    index: usize,
    core: Arc<TaskCore>,
    /// Metrics captured from the status line, waiting for the socket report
    pending: Arc<Mutex<JsonMap>>,
}

impl ClientSim {
    pub fn new(
        config: Arc<SupervisorConfig>,
        index: usize,
        clock: Arc<Clock>,
        tmpdir: Arc<TmpDir>,
        tsync: Option<Arc<TimeSync>>,
        primary: bool,
    ) -> Self {
        let socket_name = if config.cli.sim_socket {
            Some("kvstore.sock".to_string())
        } else {
            None
        };
        let core = TaskCore::new(
            format!("clientsim[{}]", index),
            format!("sim_{}", index),
            clock,
            config.cli.warm_period as u64 * 60,
            tmpdir,
            tsync,
            primary,
            socket_name,
        );
        ClientSim {
            config,
            index,
            core,
            pending: Arc::new(Mutex::new(JsonMap::new())),
        }
    }

    fn instance(&self) -> &crate::config::SimInstance {
        &self.config.sim[self.index]
    }

    fn docker_cmd(&self, sleep_min: u32) -> Result<String> {
        let cli = &self.config.cli;
        let mut cmd = format!(
            "docker run --name=\"{}\" -t --rm \\\n\
             \x20 --ulimit nofile=1048576:1048576 \\\n\
             \x20 -v \"{}\":/workdata \\\n\
             \x20 -v {}:/tmp/host \\\n",
            self.core.container_name,
            self.instance().path,
            self.core
                .tmpdir
                .container_dir(&self.core.container_name)?
                .display(),
        );
        if cli.sim_socket {
            cmd += "  -e KVSTORE_REPORT_SOCKET=/tmp/host/kvstore.sock \\\n";
        }
        if sleep_min > 0 {
            cmd += &format!("  -e SIM_SLEEP={}m \\\n", sleep_min);
        }
        if !cli.container_params.is_empty() {
            cmd += &format!("  {} \\\n", cli.container_params);
        }
        cmd += &format!("  {} \\\n", cli.container_image);
        Ok(cmd)
    }

    fn const_params(&self) -> String {
        let inst = self.instance();
        format!(
            "    -P \"{}\" \\\n\
             \x20   -p kvstore.dir=\"/workdata\" \\\n\
             \x20   -p recordcount={} \\\n",
            inst.workload, inst.num_keys
        )
    }

    fn run_cmd(&self) -> Result<String> {
        let cli = &self.config.cli;
        let inst = self.instance();
        let mut cmd = self.docker_cmd(inst.sleep_min)?
            + "  client_sim run -s \\\n"
            + &self.const_params()
            + &format!(
                "    -p operationcount=0 \\\n\
                 \x20   -p status.interval={} \\\n\
                 \x20   -threads {} \\\n",
                cli.stats_interval, inst.threads
            );
        if !inst.params.is_empty() {
            cmd += &format!("    {} \\\n", inst.params);
        }
        cmd += "    2>&1 ";
        Ok(cmd)
    }

    fn stdout_handler(core: &Arc<TaskCore>, pending: &Arc<Mutex<JsonMap>>, socket: bool, line: &str) {
        info!("Task {}, stdout: {}", core.name, line);

        let cm = match RE_SIM_STATUS.captures(line) {
            Some(cm) => cm,
            None => return,
        };
        core.insert("ops".to_string(), cm[1].to_string());
        core.insert("ops_per_s".to_string(), cm[2].replace(',', "."));

        // bracketed groups: [READ: Count=1, Max=2, ...] [UPDATE: ...]
        let mut rest = cm.get(3).map(|m| m.as_str().to_string()).unwrap_or_default();
        while !rest.is_empty() {
            let gm = match RE_SIM_GROUP.captures(&rest) {
                Some(gm) => gm,
                None => break,
            };
            let prefix = gm[1].to_string();
            for item in gm[2].split(", ") {
                if let Some((key, value)) = item.split_once('=') {
                    core.insert(format!("{}_{}", prefix, key), value.replace(',', "."));
                }
            }
            rest = gm.get(3).map(|m| m.as_str().to_string()).unwrap_or_default();
        }

        if core.primary {
            if let Some(tsync) = &core.tsync {
                tsync.new_report();
            }
        }

        if socket {
            // hold the record until the store's socket report arrives
            *pending.lock().unwrap() = core.take_data();
            match core.send_command("report column_family=usertable output=socket") {
                Ok(reply) => Self::socket_handler(core, pending, &reply),
                Err(err) => {
                    error!(
                        "output handler exception from {} (socket client): {:#}",
                        core.name, err
                    );
                }
            }
        } else {
            core.print();
        }
    }

    fn socket_handler(core: &Arc<TaskCore>, pending: &Arc<Mutex<JsonMap>>, reply: &str) {
        match RE_SOCKET_REPORT.captures(reply) {
            Some(cm) => match serde_json::from_str::<Value>(&cm[1]) {
                Ok(report) => {
                    let mut record = pending.lock().unwrap();
                    record.insert("socket_report".to_string(), report);
                    core.print_map(&mut record);
                }
                Err(err) => {
                    error!(
                        "invalid socket report json in task {}: {}",
                        core.name, err
                    );
                }
            },
            None => {
                info!("Task {}, socket output: {}", core.name, reply.replace('\n', " "));
            }
        }
    }
}

impl ExperimentTask for ClientSim {
    fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    fn create_resources(&self) -> Result<()> {
        if !self.config.cli.sim_create {
            return Ok(());
        }
        let cmd = self.docker_cmd(0)?
            + "  client_sim load -s \\\n"
            + &self.const_params()
            + "    2>&1 ";
        run_shell(&format!("Bulkload {}", self.core.name), &cmd)
    }

    fn start(&self) -> Result<()> {
        let cmd = self.run_cmd()?;
        info!("Executing {}. Command:\n{}", self.core.name, cmd);
        let core = self.core.clone();
        let pending = self.pending.clone();
        let socket = self.config.cli.sim_socket;
        let handler: Arc<dyn Fn(&str) + Send + Sync> =
            Arc::new(move |line| ClientSim::stdout_handler(&core, &pending, socket, line));
        let process = ChildProcess::spawn(&self.core.name, &cmd, handler)?;
        self.core.set_process(process);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raw I/O task

pub struct BlkLoad {
    config: Arc<SupervisorConfig>,
    index: usize,
    core: Arc<TaskCore>,
    last_shift_request: Arc<Mutex<Instant>>,
}

impl BlkLoad {
    pub fn new(
        config: Arc<SupervisorConfig>,
        index: usize,
        clock: Arc<Clock>,
        tmpdir: Arc<TmpDir>,
        tsync: Option<Arc<TimeSync>>,
        primary: bool,
    ) -> Self {
        let core = TaskCore::new(
            format!("blkload[{}]", index),
            format!("load_{}", index),
            clock,
            config.cli.warm_period as u64 * 60,
            tmpdir,
            tsync,
            primary,
            Some("blkload.sock".to_string()),
        );
        BlkLoad {
            config,
            index,
            core,
            last_shift_request: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn instance(&self) -> &crate::config::LoadInstance {
        &self.config.load[self.index]
    }

    fn run_cmd(&self) -> Result<String> {
        let cli = &self.config.cli;
        let inst = self.instance();
        let mut cmd = format!(
            "docker run --name=\"{}\" -t --rm \\\n\
             \x20 -v \"{}\":/workdata \\\n\
             \x20 -v {}:/tmp/host \\\n",
            self.core.container_name,
            inst.dir,
            self.core
                .tmpdir
                .container_dir(&self.core.container_name)?
                .display(),
        );
        if !cli.container_params.is_empty() {
            cmd += &format!("  {} \\\n", cli.container_params);
        }
        cmd += &format!("  {} \\\n", cli.container_image);
        cmd += &format!(
            "  blkload \\\n\
             \x20   --duration={} \\\n\
             \x20   --stats_interval={} \\\n\
             \x20   --log_time_prefix=false \\\n\
             \x20   --filename=\"/workdata/{}\" \\\n\
             \x20   --create_file=false \\\n\
             \x20   --block_size={} \\\n",
            cli.duration * 60,
            cli.stats_interval,
            inst.file,
            inst.block_size,
        );
        if !inst.io_engine.is_empty() {
            cmd += &format!("    --io_engine=\"{}\" \\\n", inst.io_engine);
        }
        if !inst.iodepth.is_empty() {
            cmd += &format!("    --iodepth=\"{}\" \\\n", inst.iodepth);
        }
        if !inst.o_direct.is_empty() {
            cmd += &format!("    --o_direct=\"{}\" \\\n", inst.o_direct);
        }
        if !inst.o_dsync.is_empty() {
            cmd += &format!("    --o_dsync=\"{}\" \\\n", inst.o_dsync);
        }
        cmd += &format!(
            "    --command_script=\"{}\" \\\n\
             \x20   --socket=/tmp/host/blkload.sock \\\n\
             \x20   {} 2>&1 ",
            inst.script, inst.params
        );
        Ok(cmd)
    }

    fn stdout_handler(
        core: &Arc<TaskCore>,
        last_shift: &Arc<Mutex<Instant>>,
        sync_stats: bool,
        stats_interval: u32,
        line: &str,
    ) {
        info!("Task {}, stdout: {}", core.name, line);

        let cm = match RE_LOAD_STATS.captures(line) {
            Some(cm) => cm,
            None => return,
        };
        let clock_s = core.clock.s();
        if clock_s <= core.warm_period_s {
            return;
        }
        info!(
            "Task {}, STATS: {{\"time\":\"{}\", {}}}",
            core.name,
            clock_s - core.warm_period_s,
            &cm[1]
        );

        let tsync = match (&core.tsync, sync_stats) {
            (Some(tsync), true) => tsync,
            _ => return,
        };
        if core.primary {
            tsync.new_report();
            return;
        }

        let shift = tsync.get_time_shift(&core.name);
        if shift == 0 {
            return;
        }
        // rate-limit the shift requests to one per two intervals
        let mut last = last_shift.lock().unwrap();
        if last.elapsed().as_secs() <= (stats_interval * 2) as u64 {
            return;
        }
        *last = Instant::now();
        drop(last);

        match core.send_command(&format!("shift_report_time {}", shift)) {
            Ok(reply) => info!("return from experiment {}: {}", core.name, reply),
            Err(err) => error!("shift request to {} failed: {:#}", core.name, err),
        }
    }
}

impl ExperimentTask for BlkLoad {
    fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    fn start(&self) -> Result<()> {
        let cmd = self.run_cmd()?;
        info!("Executing {}. Command:\n{}", self.core.name, cmd);
        let core = self.core.clone();
        let last_shift = self.last_shift_request.clone();
        let sync_stats = self.config.cli.sync_stats;
        let stats_interval = self.config.cli.stats_interval;
        let handler: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |line| {
            BlkLoad::stdout_handler(&core, &last_shift, sync_stats, stats_interval, line)
        });
        let process = ChildProcess::spawn(&self.core.name, &cmd, handler)?;
        self.core.set_process(process);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorCli;
    use clap::Parser;

    fn test_core(name: &str, warm_s: u64, primary: bool) -> Arc<TaskCore> {
        TaskCore::new(
            name.to_string(),
            format!("{}_c", name),
            Arc::new(Clock::new()),
            warm_s,
            Arc::new(TmpDir::new().unwrap()),
            Some(Arc::new(TimeSync::new(1))),
            primary,
            None,
        )
    }

    fn test_config(args: &[&str]) -> Arc<SupervisorConfig> {
        let mut full = vec!["ioduel", "--duration", "10"];
        full.extend_from_slice(args);
        Arc::new(SupervisorCli::parse_from(full).expand().unwrap())
    }

    #[test]
    fn test_kv_thread_line_parsed() {
        let core = test_core("kvbench[0]", 0, false);
        let accum = Arc::new(Mutex::new((0u64, 0.0f64)));
        KvBench::stdout_handler(
            &core,
            &accum,
            "thread 3: (1200,34000) ops and (120.5,113.9) ops/second in (9.96,298.44) seconds",
        );
        let data = core.take_data();
        assert_eq!(data["ops"], "1200");
        assert_eq!(data["ops_per_s"], "120.5");
        assert_eq!(data["ops[3]"], "1200");
        assert_eq!(data["ops_per_s[3]"], "120.5");
    }

    #[test]
    fn test_kv_writes_line_keeps_byte_rate_capture() {
        let core = test_core("kvbench[0]", 0, false);
        let accum = Arc::new(Mutex::new((0u64, 0.0f64)));
        KvBench::stdout_handler(
            &core,
            &accum,
            "Interval writes: 125K writes, 125K keys, 61K commit groups, \
             2.0 writes per commit group, ingest: 53.46 MB, 5.83 MB/s",
        );
        let data = core.take_data();
        assert_eq!(data["writes"], "125K");
        assert_eq!(data["written_keys"], "125K");
        assert!(!data.contains_key("ingest_MB"));
        assert_eq!(data["ingest_MBps"], "5.83");
    }

    #[test]
    fn test_kv_wal_line_parsed() {
        let core = test_core("kvbench[0]", 0, false);
        let accum = Arc::new(Mutex::new((0u64, 0.0f64)));
        KvBench::stdout_handler(
            &core,
            &accum,
            "Interval WAL: 125K writes, 125K syncs, 1.00 writes per sync, \
             written: 0.06 GB, 6.59 MB/s",
        );
        let data = core.take_data();
        assert_eq!(data["WAL_writes"], "125K");
        assert_eq!(data["WAL_syncs"], "125K");
        assert_eq!(data["WAL_written_MB"], "0.06");
        assert_eq!(data["WAL_written_MBps"], "6.59");
    }

    #[test]
    fn test_kv_stall_line_closes_interval() {
        let core = test_core("kvbench[0]", 0, true);
        let accum = Arc::new(Mutex::new((7u64, 1.0f64)));
        KvBench::stdout_handler(
            &core,
            &accum,
            "Interval stall: 00:00:1.653 H:M:S, 16.5 percent",
        );
        // the record was printed and cleared, the accumulators reset
        assert!(core.take_data().is_empty());
        assert_eq!(*accum.lock().unwrap(), (0, 0.0));
    }

    #[test]
    fn test_sim_status_line_prints_and_clears() {
        // without the socket the record is emitted immediately
        let core = test_core("clientsim[0]", 0, false);
        let pending = Arc::new(Mutex::new(JsonMap::new()));
        ClientSim::stdout_handler(
            &core,
            &pending,
            false,
            "2020-05-31 12:37:56:062 40 sec: 8898270 operations; 181027 current ops/sec; \
             est completion in 5 second [READ: Count=452553, Max=2329, Avg=19,59]",
        );
        assert!(core.take_data().is_empty());
    }

    #[test]
    fn test_sim_bracket_groups_extracted() {
        let core = test_core("clientsim[0]", 1_000_000, false);
        let pending = Arc::new(Mutex::new(JsonMap::new()));
        ClientSim::stdout_handler(
            &core,
            &pending,
            false,
            "2020-05-31 12:37:56:062 40 sec: 8898270 operations; 181027,5 current ops/sec; \
             est completion in 5 second [READ: Count=452553, Max=2329, Avg=19,59] \
             [UPDATE: Count=452135, Avg=87,65]",
        );
        let data = core.take_data();
        assert_eq!(data["ops"], "8898270");
        assert_eq!(data["ops_per_s"], "181027.5");
        assert_eq!(data["READ_Count"], "452553");
        assert_eq!(data["READ_Avg"], "19.59");
        assert_eq!(data["UPDATE_Count"], "452135");
        assert_eq!(data["UPDATE_Avg"], "87.65");
    }

    #[test]
    fn test_socket_report_merged() {
        let core = test_core("clientsim[0]", 0, false);
        let pending = Arc::new(Mutex::new(JsonMap::new()));
        pending
            .lock()
            .unwrap()
            .insert("ops".to_string(), Value::String("5".to_string()));
        ClientSim::socket_handler(
            &core,
            &pending,
            "socket_server.json: {\"usertable\": {\"stall\": 0}}",
        );
        // merged record printed and cleared
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_load_stats_line_matched() {
        let cm = RE_LOAD_STATS
            .captures("[info] STATS: {\"time\":\"12\", \"total_MiB/s\":\"55.00\", \"wait\":\"false\"}")
            .unwrap();
        assert_eq!(&cm[1], "\"total_MiB/s\":\"55.00\", \"wait\":\"false\"");
    }

    #[test]
    fn test_blkload_command_contains_socket_and_script() {
        let config = test_config(&[
            "--num_load",
            "1",
            "--load_dir",
            "/mnt/work",
            "--load_script",
            "0:wait=false;10m:write_ratio=0.5",
        ]);
        let task = BlkLoad::new(
            config,
            0,
            Arc::new(Clock::new()),
            Arc::new(TmpDir::new().unwrap()),
            None,
            false,
        );
        let cmd = task.run_cmd().unwrap();
        assert!(cmd.contains("--socket=/tmp/host/blkload.sock"));
        assert!(cmd.contains("--command_script=\"0:wait=false;10m:write_ratio=0.5\""));
        assert!(cmd.contains("--filename=\"/workdata/workload.dat\""));
        assert!(cmd.contains("docker run --name=\"load_0\""));
    }

    #[test]
    fn test_kvbench_command_selects_benchmark() {
        let config = test_config(&[
            "--num_kv",
            "1",
            "--kv_path",
            "/mnt/db",
            "--kv_benchmark",
            "readrandomwriterandom",
        ]);
        let task = KvBench::new(
            config,
            0,
            Arc::new(Clock::new()),
            Arc::new(TmpDir::new().unwrap()),
            None,
            false,
        );
        let cmd = task.run_cmd().unwrap();
        assert!(cmd.contains("--benchmarks=readrandomwriterandom"));
        assert!(cmd.contains("--readwritepercent=90"));
        assert!(cmd.contains("--duration=600"));
    }

    #[test]
    fn test_kvbench_rejects_unknown_benchmark() {
        let config = test_config(&["--num_kv", "1", "--kv_path", "/mnt/db", "--kv_benchmark", "fillseq"]);
        let task = KvBench::new(
            config,
            0,
            Arc::new(Clock::new()),
            Arc::new(TmpDir::new().unwrap()),
            None,
            false,
        );
        assert!(task.run_cmd().is_err());
    }
}
