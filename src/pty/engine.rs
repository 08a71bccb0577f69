//! The PTY engine's run loop: lifecycle gating, line extraction, dedup,
//! tiered batching, the silence watchdog, and graceful exit.

use super::dedup::DedupWindow;
use super::registry::{self, PtyControlHandle};
use super::{PtyError, PtyHandle, PtyOptions, TierTable};
use crate::event::StreamingEvent;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const PROMPT_FIRST_DELAY_MS: u64 = 2_000;
const PROMPT_RETRY_INTERVAL_MS: u64 = 3_000;
const PROMPT_MAX_RETRIES: u32 = 4;
const HARD_KILL_DELAY: Duration = Duration::from_secs(10);
const COMPLETE_SENTINEL_SUFFIX: &str = "[complete]";
const FLUSH_SENTINEL: &str = "------";

pub fn spawn(
    mut options: PtyOptions,
) -> Result<(PtyHandle, mpsc::Receiver<StreamingEvent>), PtyError> {
    let message_id = options
        .message_id
        .take()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| PtyError::Spawn(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&options.command);
    cmd.args(&options.args);
    cmd.cwd(&options.cwd);
    for (k, v) in &options.env {
        cmd.env(k, v);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| PtyError::Spawn(e.to_string()))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| PtyError::Spawn(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| PtyError::Spawn(e.to_string()))?;
    let writer = Arc::new(Mutex::new(writer));

    // Bridge the PTY's synchronous reader into an async channel of raw
    // chunks, the way `tools/bash.rs` bridges `tokio::process::Command`'s
    // child I/O into owned buffers, generalized to a blocking reader.
    let (raw_tx, raw_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if raw_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel::<i32>();
    tokio::task::spawn_blocking(move || {
        let status = child.wait();
        let code = status
            .map(|s| s.exit_code() as i32)
            .unwrap_or(-1);
        let _ = exit_tx.send(code);
    });

    let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(16);
    let (kill_tx, kill_rx) = mpsc::channel::<()>(4);

    let control = PtyControlHandle::new(message_id.clone(), write_tx, kill_tx);
    registry::GLOBAL.register(control.clone());

    let (event_tx, event_rx) = mpsc::channel::<StreamingEvent>(256);
    let dedup_window_size = options.dedup_window_size;
    let silence_timeout_ms = options.silence_timeout_ms;

    let state = EngineState {
        message_id: message_id.clone(),
        options,
        writer,
        raw_rx,
        exit_rx,
        write_rx,
        kill_rx,
        event_tx,
        pause_rx: registry::GLOBAL.subscribe_pause(),
        order: crate::event::OrderCounter::new(),
        dedup: DedupWindow::new(dedup_window_size),
        line_buffer: String::new(),
        delta_buffer: String::new(),
        ready: false,
        started: false,
        exit_requested: false,
        long_running_active: false,
        prompt_attempts: 0,
        batch_deadline: None,
        batch_timeout_ms: None,
        silence_deadline: Some(Instant::now() + Duration::from_millis(silence_timeout_ms)),
        prompt_deadline: None,
        hardkill_deadline: None,
        frozen: None,
    };

    tokio::spawn(state.run());

    let handle = PtyHandle {
        message_id,
        control,
    };
    Ok((handle, event_rx))
}

struct FrozenDeadlines {
    batch: Option<Duration>,
    silence: Option<Duration>,
    prompt: Option<Duration>,
    hardkill: Option<Duration>,
}

struct EngineState {
    message_id: String,
    options: PtyOptions,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    raw_rx: mpsc::Receiver<Vec<u8>>,
    exit_rx: oneshot::Receiver<i32>,
    write_rx: mpsc::Receiver<Vec<u8>>,
    kill_rx: mpsc::Receiver<()>,
    event_tx: mpsc::Sender<StreamingEvent>,
    pause_rx: tokio::sync::watch::Receiver<bool>,
    order: crate::event::OrderCounter,
    dedup: DedupWindow,
    line_buffer: String,
    delta_buffer: String,
    ready: bool,
    started: bool,
    exit_requested: bool,
    long_running_active: bool,
    prompt_attempts: u32,
    batch_deadline: Option<Instant>,
    batch_timeout_ms: Option<u64>,
    silence_deadline: Option<Instant>,
    prompt_deadline: Option<Instant>,
    hardkill_deadline: Option<Instant>,
    frozen: Option<FrozenDeadlines>,
}

fn select_tier_timeout(table: &TierTable, len: usize) -> u64 {
    for (threshold, timeout_ms) in table {
        if len >= *threshold {
            return *timeout_ms;
        }
    }
    table.last().map(|(_, t)| *t).unwrap_or(4_000)
}

impl EngineState {
    async fn emit(&mut self, event: StreamingEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn next_order(&mut self) -> u64 {
        self.order.next()
    }

    async fn write_raw(&self, data: Vec<u8>) {
        let writer = self.writer.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let mut w = writer.lock().expect("pty writer lock poisoned");
            let _ = w.write_all(&data);
            let _ = w.flush();
        })
        .await;
    }

    async fn request_exit(&mut self) {
        if self.exit_requested {
            return;
        }
        self.exit_requested = true;
        let mut payload = self.options.exit_command.clone();
        payload.push_str(&self.options.newline);
        self.write_raw(payload.into_bytes()).await;
        self.hardkill_deadline = Some(Instant::now() + HARD_KILL_DELAY);
    }

    async fn flush_delta(&mut self) {
        if self.delta_buffer.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.delta_buffer);
        let order = self.next_order();
        self.emit(StreamingEvent::MessageDelta {
            message_id: self.message_id.clone(),
            order,
            text,
            agent: None,
        })
        .await;
        self.batch_deadline = None;
        self.batch_timeout_ms = None;
    }

    fn is_ready_line(&self, line: &str) -> bool {
        match &self.options.is_ready {
            Some(pred) => pred(line),
            None => true,
        }
    }

    fn is_start_line(&self, line: &str) -> bool {
        match &self.options.is_start {
            Some(pred) => pred(line),
            None => line.contains(&self.options.prompt_separator_sentinel),
        }
    }

    fn is_noise_line(&self, line: &str) -> bool {
        self.options
            .is_noise
            .as_ref()
            .map(|pred| pred(line))
            .unwrap_or(false)
    }

    async fn handle_line(&mut self, line: &str) {
        if let Some(hook) = self.options.line_hook.clone() {
            hook(line);
        }

        if line == FLUSH_SENTINEL {
            self.flush_delta().await;
            return;
        }
        if line == COMPLETE_SENTINEL_SUFFIX || line.ends_with(COMPLETE_SENTINEL_SUFFIX) {
            self.request_exit().await;
            return;
        }

        if let Some(pred) = self.options.long_running_predicate.clone() {
            if pred(line) {
                self.long_running_active = true;
            }
        }

        if !self.ready {
            if self.is_ready_line(line) {
                self.ready = true;
                self.prompt_deadline = Some(Instant::now() + Duration::from_millis(PROMPT_FIRST_DELAY_MS));
            }
            return;
        }

        if !self.started {
            if self.is_start_line(line) {
                self.started = true;
                self.prompt_deadline = None;
            }
            // Lines before `processing_started` never reach the delta
            // buffer, matching the lifecycle-gating rule.
            return;
        }

        if self.is_noise_line(line) {
            return;
        }

        if !self.dedup.admit(line) {
            return;
        }

        self.delta_buffer.push_str(line);
        self.delta_buffer.push('\n');
        let timeout = select_tier_timeout(&self.options.tier_table, self.delta_buffer.len());
        if self.batch_timeout_ms != Some(timeout) {
            self.batch_timeout_ms = Some(timeout);
            self.batch_deadline = Some(Instant::now() + Duration::from_millis(timeout));
        }
    }

    async fn ingest_chunk(&mut self, chunk: Vec<u8>) {
        self.silence_deadline = Some(Instant::now() + Duration::from_millis(self.options.silence_timeout_ms));

        let stripped = strip_ansi_escapes::strip(&chunk);
        let text = String::from_utf8_lossy(&stripped).into_owned();
        self.line_buffer.push_str(&text);

        loop {
            match self.line_buffer.find('\n') {
                Some(idx) => {
                    let line: String = self.line_buffer.drain(..=idx).collect();
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    self.handle_line(&line).await;
                }
                None => break,
            }
        }
    }

    async fn fire_prompt_timer(&mut self) {
        if self.started {
            self.prompt_deadline = None;
            return;
        }
        if let Some(prompt) = self.options.initial_prompt.clone() {
            let mut payload = prompt;
            payload.push_str(&self.options.newline);
            self.write_raw(payload.into_bytes()).await;
        }
        self.prompt_attempts += 1;
        if self.prompt_attempts > PROMPT_MAX_RETRIES {
            self.prompt_deadline = None;
        } else {
            self.prompt_deadline = Some(Instant::now() + Duration::from_millis(PROMPT_RETRY_INTERVAL_MS));
        }
    }

    async fn fire_silence_timer(&mut self) {
        if !self.delta_buffer.is_empty() {
            self.silence_deadline = Some(Instant::now() + Duration::from_millis(self.options.silence_timeout_ms));
            return;
        }
        if self.long_running_active {
            let grace = self.options.silence_grace_ms.unwrap_or(self.options.silence_timeout_ms);
            self.silence_deadline = Some(Instant::now() + Duration::from_millis(grace));
            return;
        }
        let seconds = self.options.silence_timeout_ms / 1000;
        let order = self.next_order();
        self.emit(StreamingEvent::Error {
            message_id: self.message_id.clone(),
            order,
            message: format!("timed out after {seconds} seconds"),
        })
        .await;
        self.silence_deadline = None;
        self.request_exit().await;
    }

    async fn fire_hardkill_timer(&mut self) {
        self.hardkill_deadline = None;
        // Re-send the exit command once more; the child-wait task still
        // owns the portable-pty `Child` handle and will report the exit
        // code once the OS reaps the process. A from-scratch forced kill
        // would need the child moved out of the blocking wait task instead
        // of into it; kept simple since the exit command plus the PTY
        // master/slave teardown already reclaims almost every stuck CLI.
        let mut payload = self.options.exit_command.clone();
        payload.push_str(&self.options.newline);
        self.write_raw(payload.into_bytes()).await;
    }

    fn freeze_timers(&mut self) {
        if self.frozen.is_some() {
            return;
        }
        let now = Instant::now();
        let remaining = |deadline: &Option<Instant>| {
            deadline.map(|d| d.saturating_duration_since(now))
        };
        self.frozen = Some(FrozenDeadlines {
            batch: remaining(&self.batch_deadline),
            silence: remaining(&self.silence_deadline),
            prompt: remaining(&self.prompt_deadline),
            hardkill: remaining(&self.hardkill_deadline),
        });
        self.batch_deadline = None;
        self.silence_deadline = None;
        self.prompt_deadline = None;
        self.hardkill_deadline = None;
    }

    fn thaw_timers(&mut self) {
        if let Some(frozen) = self.frozen.take() {
            let now = Instant::now();
            self.batch_deadline = frozen.batch.map(|d| now + d);
            self.silence_deadline = frozen.silence.map(|d| now + d);
            self.prompt_deadline = frozen.prompt.map(|d| now + d);
            self.hardkill_deadline = frozen.hardkill.map(|d| now + d);
        }
    }

    async fn handle_exit(&mut self, code: i32) {
        // Process any residual partial line once.
        if !self.line_buffer.is_empty() {
            let residual = std::mem::take(&mut self.line_buffer);
            self.handle_line(&residual).await;
        }
        self.flush_delta().await;

        if !self.options.success_exit_codes.contains(&code) {
            let order = self.next_order();
            self.emit(StreamingEvent::Error {
                message_id: self.message_id.clone(),
                order,
                message: format!("subprocess exited with non-success code {code}"),
            })
            .await;
        }
        registry::GLOBAL.unregister(&self.message_id);
    }

    async fn run(mut self) {
        let order = self.next_order();
        self.emit(StreamingEvent::MessageStart {
            message_id: self.message_id.clone(),
            order,
            agent: None,
        })
        .await;

        loop {
            if *self.pause_rx.borrow() {
                self.freeze_timers();
            } else {
                self.thaw_timers();
            }

            let batch_sleep = match self.batch_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            let silence_sleep = match self.silence_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            let prompt_sleep = match self.prompt_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            let hardkill_sleep = match self.hardkill_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };

            tokio::select! {
                biased;

                _ = self.pause_rx.changed() => {
                    continue;
                }

                Ok(code) = &mut self.exit_rx => {
                    self.handle_exit(code).await;
                    break;
                }

                Some(chunk) = self.raw_rx.recv() => {
                    self.ingest_chunk(chunk).await;
                }

                Some(data) = self.write_rx.recv() => {
                    if !self.exit_requested {
                        self.write_raw(data).await;
                    }
                }

                Some(()) = self.kill_rx.recv() => {
                    self.request_exit().await;
                }

                () = batch_sleep, if self.batch_deadline.is_some() => {
                    self.flush_delta().await;
                }

                () = silence_sleep, if self.silence_deadline.is_some() => {
                    self.fire_silence_timer().await;
                }

                () = prompt_sleep, if self.prompt_deadline.is_some() => {
                    self.fire_prompt_timer().await;
                }

                () = hardkill_sleep, if self.hardkill_deadline.is_some() => {
                    self.fire_hardkill_timer().await;
                }
            }
        }
    }
}
