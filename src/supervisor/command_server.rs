//! Interactive command server
//!
//! A line-based mini-language over a Unix-domain socket. A received block is
//! split into lines, each line into `#`-separated commands processed left to
//! right with a shared scheduled time:
//!
//! ```text
//! test                 reply ok with echoed parameters
//! help                 print the command help
//! list-exp             list the task names
//! list-cmd             list every issued command
//! list-sched           list only commands still in the future
//! cancel N             cancel scheduled command N
//! Ns / Nm              schedule at N sec/min after the warm-up period
//! 0Ns / 0Nm            schedule at N from experiment start
//! +Ns / +Nm            schedule at N from now
//! <name> <params>      dispatch params to task <name> ('*' wildcard allowed)
//! ```
//!
//! Every dispatch spawns one worker that polls until the scheduled time,
//! honors cancellation, and forwards the params to the task's command
//! socket. A schedule already in the past aborts the rest of the line.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use lazy_static::lazy_static;
use log::{debug, error, info};
use regex::Regex;

use super::task::ExperimentTask;
use crate::util::time::Clock;
use crate::Result;

const DISPATCH_POLL: Duration = Duration::from_millis(300);
const SOCKET_BUFFER_SIZE: usize = 4096;

lazy_static! {
    static ref RE_SCHEDULE: Regex = Regex::new(r"^(\+?)([0-9]+)([sm])$").unwrap();
    static ref RE_WILDCARD: Regex = Regex::new(r"^([^\*]*)\*([^\*]*)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Scheduled,
    Canceled,
    Running,
    Finished,
    Failed,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            CommandStatus::Scheduled => "scheduled",
            CommandStatus::Canceled => "canceled",
            CommandStatus::Running => "running",
            CommandStatus::Finished => "finished",
            CommandStatus::Failed => "failed",
        };
        write!(f, "{}", tag)
    }
}

/// One issued command, kept for list-cmd/list-sched
#[derive(Debug, Clone)]
pub struct ScheduledCommand {
    pub name: String,
    pub params: String,
    pub time_issued: u64,
    pub time_sched: u64,
    pub status: CommandStatus,
}

struct ServerInner {
    stop: AtomicBool,
    clock: Arc<Clock>,
    warm_period_s: u64,
    tasks: HashMap<String, Arc<dyn ExperimentTask>>,
    msg_count: AtomicU32,
    commands: Mutex<BTreeMap<u32, ScheduledCommand>>,
    canceled: Mutex<HashSet<u32>>,
}

pub struct CommandServer {
    inner: Arc<ServerInner>,
    accept_thread: Option<thread::JoinHandle<()>>,
    arg_thread: Option<thread::JoinHandle<()>>,
    socket_path: Option<String>,
}

impl CommandServer {
    /// Start the server. `tasks` is a read-only name->task map; the server
    /// never owns or mutates the tasks themselves.
    pub fn new(
        socket_path: &str,
        tasks: HashMap<String, Arc<dyn ExperimentTask>>,
        clock: Arc<Clock>,
        warm_period_s: u64,
    ) -> Result<Self> {
        let inner = Arc::new(ServerInner {
            stop: AtomicBool::new(false),
            clock,
            warm_period_s,
            tasks,
            msg_count: AtomicU32::new(0),
            commands: Mutex::new(BTreeMap::new()),
            canceled: Mutex::new(HashSet::new()),
        });

        let accept_thread = if socket_path.is_empty() {
            None
        } else {
            info!("initiating command socket: {}", socket_path);
            let listener = UnixListener::bind(socket_path)
                .with_context(|| format!("failed to bind command socket {}", socket_path))?;
            listener.set_nonblocking(true)?;
            let inner = inner.clone();
            Some(
                thread::Builder::new()
                    .name("command-server".to_string())
                    .spawn(move || accept_loop(listener, inner))
                    .context("failed to spawn command server thread")?,
            )
        };

        Ok(CommandServer {
            inner,
            accept_thread,
            arg_thread: None,
            socket_path: if socket_path.is_empty() {
                None
            } else {
                Some(socket_path.to_string())
            },
        })
    }

    /// Feed the `--commands` flag through the same parser, in the background.
    pub fn run_initial_commands(&mut self, commands: &str) {
        if commands.is_empty() {
            return;
        }
        let inner = self.inner.clone();
        let commands = commands.to_string();
        self.arg_thread = thread::Builder::new()
            .name("command-args".to_string())
            .spawn(move || parse_and_execute(&inner, &commands, None))
            .ok();
    }

    #[cfg(test)]
    fn command_status(&self, n: u32) -> Option<CommandStatus> {
        self.inner.commands.lock().unwrap().get(&n).map(|c| c.status)
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.arg_thread.take() {
            let _ = handle.join();
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn accept_loop(listener: UnixListener, inner: Arc<ServerInner>) {
    while !inner.stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                let inner = inner.clone();
                let _ = thread::Builder::new()
                    .name("command-client".to_string())
                    .spawn(move || {
                        if let Err(err) = serve_client(stream, &inner) {
                            error!("command client error: {:#}", err);
                        }
                    });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                error!("command socket accept error: {}", err);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn serve_client(mut stream: UnixStream, inner: &Arc<ServerInner>) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    let mut buffer = [0u8; SOCKET_BUFFER_SIZE];
    let n = stream.read(&mut buffer).context("socket read error")?;
    let message = String::from_utf8_lossy(&buffer[..n]).into_owned();

    let stream = Mutex::new(stream);
    parse_and_execute(inner, &message, Some(&stream));
    Ok(())
}

enum ReplyKind {
    Info,
    Error,
}

/// Log the command output and echo it to the socket client, if any.
fn reply(
    kind: ReplyKind,
    count: u32,
    stream: Option<&Mutex<UnixStream>>,
    text: &str,
) {
    match kind {
        ReplyKind::Info => info!("output command [{}]: {}", count, text),
        ReplyKind::Error => error!("output command [{}]: {}", count, text),
    }
    if let Some(stream) = stream {
        let prefix = match kind {
            ReplyKind::Info => "",
            ReplyKind::Error => "ERROR: ",
        };
        let mut stream = stream.lock().unwrap();
        let _ = stream.write_all(format!("{}{}\n", prefix, text).as_bytes());
    }
}

fn parse_and_execute(inner: &Arc<ServerInner>, message: &str, stream: Option<&Mutex<UnixStream>>) {
    // dispatch workers borrow the reply stream, so they are scoped: the
    // connection stays open until every dispatched command finished
    thread::scope(|scope| {
        // schedule shared by all commands of the received block; 0 = immediate
        let mut command_time = 0u64;

        for line in message.lines() {
            info!("command line received: {}", line);

            'items: for item in line.split('#') {
                if inner.stop.load(Ordering::Relaxed) {
                    return;
                }
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let count = inner.msg_count.fetch_add(1, Ordering::Relaxed) + 1;
                info!("processing command [{}]: {}", count, item);

                let (cmd_name, cmd_params) = match item.split_once(char::is_whitespace) {
                    Some((name, params)) => (name, params.trim()),
                    None => (item, ""),
                };

                match cmd_name {
                    "test" => {
                        reply(
                            ReplyKind::Info,
                            count,
                            stream,
                            &format!(
                                "test OK! parameters: {}\ncurrent time = {}\ncommand_time = {}",
                                cmd_params,
                                inner.clock.s(),
                                command_time
                            ),
                        );
                    }
                    "help" => {
                        reply(
                            ReplyKind::Info,
                            count,
                            stream,
                            "Help:\n\
                             \ttest        - response test\n\
                             \tlist-exp    - list the running experiments\n\
                             \tlist-cmd    - list the issued commands\n\
                             \tlist-sched  - list the scheduled commands\n\
                             \tNs or Nm    - set the next experiment commands to be N seconds or N minutes after the warm-up period\n\
                             \t0Ns or 0Nm  - set the next experiment commands to be N seconds or N minutes after the begin of the experiment\n\
                             \t+Ns or +Nm  - set the next experiment commands to be N seconds or N minutes from now\n\
                             \tcancel N    - cancel scheduled command [N]\n\
                             \t{experiment_name} {command} {parameters...} - send a command and parameters to the experiment",
                        );
                    }
                    "list-exp" => {
                        let mut names: Vec<&str> =
                            inner.tasks.keys().map(|s| s.as_str()).collect();
                        names.sort_unstable();
                        reply(
                            ReplyKind::Info,
                            count,
                            stream,
                            &format!("list of experiments: {}", names.join(", ")),
                        );
                    }
                    "list-cmd" | "list-sched" => {
                        let issued = cmd_name == "list-cmd";
                        let now = inner.clock.s();
                        let mut out = format!("Current time: {}", now);
                        out += if issued {
                            "\nIssued commands:"
                        } else {
                            "\nScheduled commands:"
                        };
                        let commands = inner.commands.lock().unwrap();
                        let mut reported = 0;
                        for (n, cmd) in commands.iter() {
                            if issued || cmd.time_sched >= now {
                                out += &format!(
                                    "\n\t{:>3}: issued_time:{:<6} sched_time:{:<6} [{}] : {} {}",
                                    n,
                                    cmd.time_issued,
                                    cmd.time_sched,
                                    cmd.status,
                                    cmd.name,
                                    cmd.params
                                );
                                reported += 1;
                            }
                        }
                        if reported == 0 {
                            out += "\n\t(empty)";
                        }
                        drop(commands);
                        reply(ReplyKind::Info, count, stream, &out);
                    }
                    "cancel" => {
                        handle_cancel(inner, count, cmd_params, stream);
                    }
                    _ => {
                        if let Some(cm) = RE_SCHEDULE.captures(cmd_name) {
                            let mut t: u64 = cm[2].parse().unwrap_or(0);
                            if &cm[3] == "m" {
                                t *= 60;
                            }
                            if &cm[1] == "+" {
                                t += inner.clock.s();
                            } else if !cm[2].starts_with('0') {
                                t += inner.warm_period_s;
                            }
                            let now = inner.clock.s();
                            if t >= now {
                                command_time = t;
                                reply(
                                    ReplyKind::Info,
                                    count,
                                    stream,
                                    &format!(
                                        "scheduling the next commands to time = {}",
                                        command_time
                                    ),
                                );
                            } else {
                                reply(
                                    ReplyKind::Error,
                                    count,
                                    stream,
                                    &format!(
                                        "Schedule time {} is inferior than current time {}. \
                                         Canceling the subsequent commands in this line.",
                                        t, now
                                    ),
                                );
                                break 'items;
                            }
                        } else {
                            dispatch_experiment_command(
                                inner,
                                count,
                                cmd_name,
                                cmd_params,
                                command_time,
                                stream,
                                scope,
                            );
                        }
                    }
                }
            }
        }
    });
    debug!("command parser and executor terminated");
}

fn handle_cancel(
    inner: &Arc<ServerInner>,
    count: u32,
    params: &str,
    stream: Option<&Mutex<UnixStream>>,
) {
    let number: u32 = match params.trim().parse() {
        Ok(n) => n,
        Err(_) => {
            reply(
                ReplyKind::Error,
                count,
                stream,
                &format!("invalid command number: {}", params),
            );
            return;
        }
    };

    let now = inner.clock.s();
    let mut commands = inner.commands.lock().unwrap();
    match commands.get_mut(&number) {
        None => {
            drop(commands);
            reply(
                ReplyKind::Error,
                count,
                stream,
                &format!("command number {} not found", number),
            );
        }
        Some(target) => {
            if now < target.time_sched {
                target.status = CommandStatus::Canceled;
                let name = target.name.clone();
                commands.insert(
                    count,
                    ScheduledCommand {
                        name: "cancel".to_string(),
                        params: params.to_string(),
                        time_issued: now,
                        time_sched: now,
                        status: CommandStatus::Finished,
                    },
                );
                inner.canceled.lock().unwrap().insert(number);
                drop(commands);
                reply(
                    ReplyKind::Info,
                    count,
                    stream,
                    &format!("canceling command = {} ({})", number, name),
                );
            } else {
                drop(commands);
                reply(
                    ReplyKind::Error,
                    count,
                    stream,
                    &format!("command number {} already executed", number),
                );
            }
        }
    }
}

fn dispatch_experiment_command<'scope, 'env>(
    inner: &'env Arc<ServerInner>,
    count: u32,
    cmd_name: &str,
    cmd_params: &str,
    command_time: u64,
    stream: Option<&'env Mutex<UnixStream>>,
    scope: &'scope thread::Scope<'scope, 'env>,
) {
    // exact match first, then a single-'*' prefix/suffix wildcard
    let mut selected: Vec<(String, Arc<dyn ExperimentTask>)> = Vec::new();
    if let Some(task) = inner.tasks.get(cmd_name) {
        selected.push((cmd_name.to_string(), task.clone()));
    } else if let Some(cm) = RE_WILDCARD.captures(cmd_name) {
        let prefix = cm[1].to_string();
        let suffix = cm[2].to_string();
        for (name, task) in inner.tasks.iter() {
            if name.starts_with(&prefix) && name.ends_with(&suffix) {
                selected.push((name.clone(), task.clone()));
            }
        }
        selected.sort_by(|a, b| a.0.cmp(&b.0));
    }

    if selected.is_empty() {
        reply(
            ReplyKind::Error,
            count,
            stream,
            &format!("invalid command or experiment name: {}", cmd_name),
        );
        return;
    }

    let now = inner.clock.s();
    let time_sched = if command_time > 0 { command_time } else { now };
    inner.commands.lock().unwrap().insert(
        count,
        ScheduledCommand {
            name: cmd_name.to_string(),
            params: cmd_params.to_string(),
            time_issued: now,
            time_sched,
            status: CommandStatus::Scheduled,
        },
    );

    for (task_name, task) in selected {
        let params = cmd_params.to_string();
        scope.spawn(move || {
            debug!("command [{}] dispatch thread initiated", count);
            while inner.clock.s() < time_sched && !inner.stop.load(Ordering::Relaxed) {
                thread::sleep(DISPATCH_POLL);
            }
            if inner.stop.load(Ordering::Relaxed) {
                return;
            }
            if inner.canceled.lock().unwrap().contains(&count) {
                return;
            }
            set_status(inner, count, CommandStatus::Running);
            match task.send_command(&params) {
                Ok(result) => {
                    set_status(inner, count, CommandStatus::Finished);
                    reply(
                        ReplyKind::Info,
                        count,
                        stream,
                        &format!("return from experiment {}: {}", task_name, result),
                    );
                }
                Err(err) => {
                    set_status(inner, count, CommandStatus::Failed);
                    reply(
                        ReplyKind::Error,
                        count,
                        stream,
                        &format!("return from experiment {}: {:#}", task_name, err),
                    );
                }
            }
            debug!("command [{}] dispatch thread finished", count);
        });
    }
}

fn set_status(inner: &Arc<ServerInner>, count: u32, status: CommandStatus) {
    if let Some(cmd) = inner.commands.lock().unwrap().get_mut(&count) {
        // a cancel that raced the dispatch keeps its terminal state
        if cmd.status != CommandStatus::Canceled {
            cmd.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::task::TaskCore;
    use crate::util::tmpdir::TmpDir;

    /// Task stub recording the commands it receives
    struct RecordingTask {
        core: Arc<TaskCore>,
        received: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingTask {
        fn new(name: &str) -> (Arc<dyn ExperimentTask>, Arc<Mutex<Vec<String>>>) {
            let received = Arc::new(Mutex::new(Vec::new()));
            let task = Arc::new(RecordingTask {
                core: TaskCore::new(
                    name.to_string(),
                    format!("{}_c", name),
                    Arc::new(Clock::new()),
                    0,
                    Arc::new(TmpDir::new().unwrap()),
                    None,
                    false,
                    None,
                ),
                received: received.clone(),
            });
            (task, received)
        }
    }

    impl ExperimentTask for RecordingTask {
        fn core(&self) -> &Arc<TaskCore> {
            &self.core
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn send_command(&self, params: &str) -> Result<String> {
            self.received.lock().unwrap().push(params.to_string());
            Ok("ok".to_string())
        }
    }

    fn server_with_tasks(
        names: &[&str],
    ) -> (CommandServer, HashMap<String, Arc<Mutex<Vec<String>>>>) {
        let mut tasks: HashMap<String, Arc<dyn ExperimentTask>> = HashMap::new();
        let mut recorders = HashMap::new();
        for name in names {
            let (task, received) = RecordingTask::new(name);
            tasks.insert(name.to_string(), task);
            recorders.insert(name.to_string(), received);
        }
        let server = CommandServer::new("", tasks, Arc::new(Clock::new()), 0).unwrap();
        (server, recorders)
    }

    #[test]
    fn test_immediate_dispatch() {
        let (server, recorders) = server_with_tasks(&["at_0"]);
        parse_and_execute(&server.inner, "at_0 stop", None);
        assert_eq!(*recorders["at_0"].lock().unwrap(), vec!["stop"]);
        assert_eq!(server.command_status(1), Some(CommandStatus::Finished));
    }

    #[test]
    fn test_wildcard_dispatch() {
        let (server, recorders) = server_with_tasks(&["at_0", "at_1", "kv_0"]);
        parse_and_execute(&server.inner, "at_* wait=true", None);
        assert_eq!(*recorders["at_0"].lock().unwrap(), vec!["wait=true"]);
        assert_eq!(*recorders["at_1"].lock().unwrap(), vec!["wait=true"]);
        assert!(recorders["kv_0"].lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_name_reports_error() {
        let (server, recorders) = server_with_tasks(&["at_0"]);
        parse_and_execute(&server.inner, "nosuch stop", None);
        assert!(recorders["at_0"].lock().unwrap().is_empty());
        assert!(server.inner.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_schedule_in_past_aborts_line() {
        let (server, recorders) = server_with_tasks(&["at_0"]);
        // warm_period 0 and 0-prefixed schedule: time 0 is "now" at best;
        // wait until the clock passed 1s so "01s" lies in the past
        thread::sleep(Duration::from_millis(2100));
        parse_and_execute(&server.inner, "01s # at_0 stop", None);
        assert!(recorders["at_0"].lock().unwrap().is_empty());
    }

    #[test]
    fn test_schedule_now_dispatches() {
        let (server, recorders) = server_with_tasks(&["at_0"]);
        // +0s schedules exactly at the current time, which must dispatch
        parse_and_execute(&server.inner, "+0s # at_0 stop", None);
        assert_eq!(*recorders["at_0"].lock().unwrap(), vec!["stop"]);
    }

    #[test]
    fn test_cancel_before_schedule() {
        let (server, recorders) = server_with_tasks(&["at_0"]);
        let inner = server.inner.clone();
        let worker = thread::spawn(move || {
            parse_and_execute(&inner, "+2s # at_0 stop", None);
        });
        // give the dispatch worker time to be registered, then cancel it
        thread::sleep(Duration::from_millis(300));
        parse_and_execute(&server.inner, "cancel 2", None);
        worker.join().unwrap();
        assert!(recorders["at_0"].lock().unwrap().is_empty());
        assert_eq!(server.command_status(2), Some(CommandStatus::Canceled));
    }

    #[test]
    fn test_cancel_after_execution_reports_already_executed() {
        let (server, recorders) = server_with_tasks(&["at_0"]);
        parse_and_execute(&server.inner, "at_0 stop", None);
        thread::sleep(Duration::from_millis(1100));
        parse_and_execute(&server.inner, "cancel 1", None);
        // outcome of command 1 unchanged
        assert_eq!(*recorders["at_0"].lock().unwrap(), vec!["stop"]);
        assert_eq!(server.command_status(1), Some(CommandStatus::Finished));
    }

    #[test]
    fn test_hash_separated_commands_share_schedule() {
        let (server, recorders) = server_with_tasks(&["at_0", "at_1"]);
        parse_and_execute(&server.inner, "+0s # at_0 stop # at_1 stop", None);
        assert_eq!(*recorders["at_0"].lock().unwrap(), vec!["stop"]);
        assert_eq!(*recorders["at_1"].lock().unwrap(), vec!["stop"]);
    }
}
