//! The framer/dispatcher and the command handlers, folded into one `Agent`
//! that owns every piece of mutable state: the process registry, the
//! completed-pid list, the monitor's registered set and snapshot, and the
//! autopoll armed flag.
//!
//! The single-execution-context model is realized by giving `Agent` a
//! single owner — the `run` loop below — and driving stdin reads, the
//! autopoll ticker, and resize signals off one `tokio::select!`, rather
//! than spawning separate tasks that would need a mutex or channel to
//! share this state. Only one branch's handler body ever runs at a time,
//! and it runs to completion (including any awaits inside it) before the
//! loop polls again, so plain `&mut self` gives the same serialization a
//! lock would without needing one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;

use crate::core::pty_process::current_winsize;
use crate::core::{AgentError, FatalError, Monitor, PtyProcess};
use crate::protocol::{RequestAccumulator, Writer};

pub struct Agent {
    processes: HashMap<i32, PtyProcess>,
    completed_tx: UnboundedSender<i32>,
    completed_rx: UnboundedReceiver<i32>,
    monitor: Monitor,
    autopoll_armed: bool,
    autopoll_interval: Duration,
    writer: Arc<Writer>,
}

impl Agent {
    pub fn new(writer: Arc<Writer>, autopoll_interval: Duration) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            processes: HashMap::new(),
            completed_tx,
            completed_rx,
            monitor: Monitor::new(),
            autopoll_armed: false,
            autopoll_interval,
            writer,
        }
    }

    /// Emits `abort <reason>` and exits the process with a non-zero status.
    /// The dedicated fatal path for protocol and argument errors. Never
    /// returns.
    fn fatal(&self, reason: impl Into<FatalError>) -> ! {
        let reason = reason.into();
        log::error!("fatal: {reason}");
        self.writer.abort(&reason.0);
        std::process::exit(1);
    }

    /// Drains the completed-pid list: cleans up and removes each finished
    /// process, then emits `%terminate <pid> <rc>`.
    async fn drain_completed(&mut self) {
        while let Ok(pid) = self.completed_rx.try_recv() {
            if let Some(mut process) = self.processes.remove(&pid) {
                let rc = process.cleanup().await;
                self.writer.terminate(pid, rc);
            }
        }
    }

    fn propagate_resize(&self) {
        let size = current_winsize();
        for process in self.processes.values() {
            process.resize(size);
        }
    }

    async fn handle_login(&mut self, id: u64, args: &[String]) {
        let Some(cwd) = args.first() else {
            self.fatal("login requires a cwd argument");
        };
        let extra_args = args[1..].to_vec();

        self.writer.begin(id);
        match PtyProcess::spawn_login(id, cwd, &extra_args, self.writer.clone(), self.completed_tx.clone()) {
            Ok(process) => {
                let pid = process.pid;
                self.processes.insert(pid, process);
                self.writer.payload(pid.to_string());
                self.writer.end(id, 0);
            }
            Err(e) => {
                log::warn!("login: spawn failed: {e}");
                self.writer.end(id, 1);
            }
        }
    }

    async fn handle_run(&mut self, id: u64, args: &[String]) {
        let Some(command) = args.first() else {
            self.fatal("run requires a command argument");
        };

        self.writer.begin(id);
        match PtyProcess::spawn_run(id, command, self.writer.clone(), self.completed_tx.clone()) {
            Ok(process) => {
                let pid = process.pid;
                self.processes.insert(pid, process);
                self.writer.payload(pid.to_string());
                self.writer.end(id, 0);
            }
            Err(e) => {
                log::warn!("run: spawn failed: {e}");
                self.writer.end(id, 1);
            }
        }
    }

    fn handle_send(&mut self, id: u64, args: &[String]) {
        let (Some(pid_str), Some(data_b64)) = (args.first(), args.get(1)) else {
            self.fatal("send requires a pid and a base64 payload");
        };
        let pid: i32 = pid_str
            .parse()
            .map_err(AgentError::InvalidPid)
            .unwrap_or_else(|e| self.fatal(format!("send: {e}")));
        let data = BASE64
            .decode(data_b64)
            .map_err(AgentError::from)
            .unwrap_or_else(|e| self.fatal(format!("send: {e}")));

        self.writer.begin(id);
        match self.processes.get_mut(&pid) {
            Some(process) => {
                if let Err(e) = process.write(&data).map_err(AgentError::from) {
                    log::warn!("send: {e}");
                }
                self.writer.end(id, 0);
            }
            None => {
                log::debug!("send: {}", AgentError::ProcessNotFound(pid));
                self.writer.end(id, 1);
            }
        }
    }

    fn handle_kill(&mut self, id: u64, args: &[String]) {
        let Some(pid_str) = args.first() else {
            self.fatal("kill requires a pid argument");
        };
        let pid: i32 = pid_str
            .parse()
            .map_err(AgentError::InvalidPid)
            .unwrap_or_else(|e| self.fatal(format!("kill: {e}")));

        self.writer.begin(id);
        match self.processes.get(&pid) {
            Some(process) => {
                process.signal(libc::SIGTERM);
                self.writer.end(id, 0);
            }
            None => {
                log::debug!("kill: {}", AgentError::ProcessNotFound(pid));
                self.writer.end(id, 1);
            }
        }
    }

    fn handle_register(&mut self, id: u64, args: &[String]) {
        let Some(pid_str) = args.first() else {
            self.fatal("register requires a pid argument");
        };
        let pid: i64 = pid_str
            .parse()
            .map_err(AgentError::InvalidPid)
            .unwrap_or_else(|e| self.fatal(format!("register: {e}")));

        self.writer.begin(id);
        self.monitor.register(pid);
        self.writer.end(id, 0);
    }

    fn handle_deregister(&mut self, id: u64, args: &[String]) {
        let Some(pid_str) = args.first() else {
            self.fatal("deregister requires a pid argument");
        };
        let pid: i64 = pid_str
            .parse()
            .map_err(AgentError::InvalidPid)
            .unwrap_or_else(|e| self.fatal(format!("deregister: {e}")));

        self.writer.begin(id);
        self.monitor.deregister(pid);
        self.writer.end(id, 0);
    }

    async fn handle_poll(&mut self, id: u64) {
        self.writer.begin(id);
        match self.monitor.poll().await {
            Some(diff) => {
                for line in &diff {
                    self.writer.payload(line);
                }
                self.writer.end(id, 0);
            }
            None => self.writer.end(id, 1),
        }
    }

    /// Arms autopoll (idempotent). There's always exactly one ticker alive
    /// for the agent's lifetime (see `run` below), so "create the
    /// background task on first invocation" collapses to just setting the
    /// flag — there is no second task to create.
    fn handle_autopoll(&mut self, id: u64) {
        self.writer.begin(id);
        self.autopoll_armed = true;
        self.writer.end(id, 0);
    }

    fn handle_reset(&mut self, id: u64) {
        self.writer.begin(id);
        self.monitor.reset();
        self.autopoll_armed = false;
        self.writer.end(id, 0);
    }

    fn handle_quit(&mut self, id: u64) {
        self.writer.begin(id);
        self.writer.end(id, 0);
    }

    /// Runs one autopoll tick: no-op while idle; while armed,
    /// polls once and, only on a non-empty diff, emits the
    /// `%autopoll`/`%end` frame and disarms.
    async fn autopoll_tick(&mut self) {
        if !self.autopoll_armed {
            return;
        }
        let Some(diff) = self.monitor.poll().await else {
            return;
        };
        if diff.is_empty() {
            return;
        }
        let autopoll_id: u64 = rand::random();
        self.writer.autopoll(autopoll_id, &diff);
        self.autopoll_armed = false;
    }

    /// Dispatches one fully-assembled request. Returns `true` if the
    /// mainloop should stop after this request.
    async fn dispatch(&mut self, args: Vec<String>) -> bool {
        let identifier: u64 = rand::random();
        let verb = args[0].as_str();
        let rest = &args[1..];

        let should_quit = match verb {
            "login" => {
                self.handle_login(identifier, rest).await;
                false
            }
            "run" => {
                self.handle_run(identifier, rest).await;
                false
            }
            "send" => {
                self.handle_send(identifier, rest);
                false
            }
            "kill" => {
                self.handle_kill(identifier, rest);
                false
            }
            "register" => {
                self.handle_register(identifier, rest);
                false
            }
            "deregister" => {
                self.handle_deregister(identifier, rest);
                false
            }
            "poll" => {
                self.handle_poll(identifier).await;
                false
            }
            "autopoll" => {
                self.handle_autopoll(identifier);
                false
            }
            "reset" => {
                self.handle_reset(identifier);
                false
            }
            "quit" => {
                self.handle_quit(identifier);
                true
            }
            other => self.fatal(format!("unrecognized command: {other}")),
        };

        self.drain_completed().await;
        should_quit
    }

    /// The mainloop: reads and assembles requests from stdin, dispatches
    /// them, ticks autopoll, and propagates terminal resizes, all on one
    /// execution context. Returns the process exit status.
    pub async fn run(mut self) -> i32 {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let mut acc = RequestAccumulator::new();

        let mut ticker = tokio::time::interval(self.autopoll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut resize_signal = match signal(SignalKind::window_change()) {
            Ok(s) => Some(s),
            Err(e) => {
                log::warn!("could not install SIGWINCH handler: {e}");
                None
            }
        };

        loop {
            tokio::select! {
                biased;

                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            log::warn!("stdin read failed: {e}");
                            break;
                        }
                    };
                    let Some(args) = acc.feed(&line) else { continue };
                    if args.is_empty() {
                        continue;
                    }
                    if self.dispatch(args).await {
                        self.writer.set_quitting();
                        return 0;
                    }
                }

                _ = ticker.tick() => {
                    self.autopoll_tick().await;
                }

                _ = async {
                    match resize_signal.as_mut() {
                        Some(s) => { s.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.propagate_resize();
                }
            }
        }

        0
    }
}
