//! Module process monitoring
//!
//! Pumps a module's stdout into its record channel, turns stderr lines into
//! notifications, watches for stalled or exited modules and stops the process
//! on request.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::module::process::spawner::{describe_exit, ModuleProcess};
use crate::module::traits::{ModuleState, Record};
use crate::severity::{Notification, Notifier, Severity};

/// Time given to the stderr pump to catch up once the process is gone
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// One decoded module output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// Line content without the terminator
    Line(Bytes),
    /// A line longer than the limit was discarded
    Oversized,
}

/// LF-delimited line decoder with a length limit
///
/// Unlike a failing codec, an overlong line is reported as
/// [`OutputLine::Oversized`] and decoding resumes after its terminator.
#[derive(Debug)]
pub struct OutputCodec {
    max_len: usize,
    discarding: bool,
}

impl OutputCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            discarding: false,
        }
    }

    fn finish_line(&self, mut line: Bytes) -> OutputLine {
        if line.last() == Some(&b'\n') {
            line.truncate(line.len() - 1);
        }
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.len() > self.max_len {
            OutputLine::Oversized
        } else {
            OutputLine::Line(line)
        }
    }
}

impl Decoder for OutputCodec {
    type Item = OutputLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<OutputLine>, io::Error> {
        match memchr::memchr(b'\n', buf) {
            Some(pos) => {
                let line = buf.split_to(pos + 1).freeze();
                if self.discarding {
                    self.discarding = false;
                    return Ok(Some(OutputLine::Oversized));
                }
                Ok(Some(self.finish_line(line)))
            }
            None => {
                // Allow one extra byte for a trailing CR
                if buf.len() > self.max_len + 1 {
                    self.discarding = true;
                    buf.clear();
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<OutputLine>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(OutputLine::Oversized));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split().freeze();
        Ok(Some(self.finish_line(line)))
    }
}

/// Relayed form of a module line: the line plus CRLF
pub fn to_record(line: &[u8]) -> Record {
    let mut record = BytesMut::with_capacity(line.len() + 2);
    record.extend_from_slice(line);
    record.extend_from_slice(b"\r\n");
    record.freeze()
}

/// Split an optional `<N>` syslog prefix off a module notification line
///
/// Lines without a prefix are `Information`; a numeric prefix outside 0..7 is
/// `Unknown`.
pub fn parse_module_notification(line: &str) -> (Severity, &str) {
    let Some(rest) = line.strip_prefix('<') else {
        return (Severity::Information, line);
    };
    let Some(end) = rest.find('>') else {
        return (Severity::Information, line);
    };
    let digits = &rest[..end];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (Severity::Information, line);
    }
    let severity = digits
        .parse::<u8>()
        .ok()
        .and_then(Severity::from_level)
        .unwrap_or(Severity::Unknown);
    (severity, rest[end + 1..].trim_start())
}

/// Module process monitor
///
/// One monitor drives one module process for its whole life.
#[derive(Debug, Clone)]
pub struct ModuleProcessMonitor {
    notifier: Notifier,
    /// Longest accepted record line
    max_record_len: usize,
    /// Report a module silent for this long
    data_timeout: Option<Duration>,
    /// Time between SIGTERM and kill when stopping
    stop_grace: Duration,
}

impl ModuleProcessMonitor {
    pub fn new(notifier: Notifier, max_record_len: usize, stop_grace: Duration) -> Self {
        Self {
            notifier,
            max_record_len,
            data_timeout: None,
            stop_grace,
        }
    }

    /// Enable the data watchdog (`Duration::ZERO` disables it)
    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Monitor a module until it exits or `stop` is cancelled
    ///
    /// Records go to `records` in the order the module wrote them. Returns the
    /// module's final state.
    pub async fn run(
        &self,
        mut process: ModuleProcess,
        records: mpsc::Sender<Record>,
        stop: CancellationToken,
    ) -> ModuleState {
        let name = process.module_name.clone();

        let stderr_pump = process.take_stderr().map(|stderr| {
            tokio::spawn(pump_notifications(
                name.clone(),
                stderr,
                self.notifier.clone(),
                self.max_record_len,
            ))
        });

        let state = match process.take_stdout() {
            Some(stdout) => {
                self.pump_records(&mut process, stdout, &records, &stop)
                    .await
            }
            None => {
                self.stop_process(&mut process).await;
                ModuleState::Failed("no output stream".to_string())
            }
        };
        drop(records);

        if let Some(mut pump) = stderr_pump {
            if tokio::time::timeout(STDERR_DRAIN, &mut pump).await.is_err() {
                pump.abort();
            }
        }

        state
    }

    async fn pump_records<R>(
        &self,
        process: &mut ModuleProcess,
        stdout: R,
        records: &mpsc::Sender<Record>,
        stop: &CancellationToken,
    ) -> ModuleState
    where
        R: AsyncRead + Unpin,
    {
        let name = process.module_name.clone();
        let mut lines = FramedRead::new(stdout, OutputCodec::new(self.max_record_len));
        let mut deadline = self.data_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let watchdog_at = deadline;
            let watchdog = async move {
                match watchdog_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = stop.cancelled() => {
                    self.stop_process(process).await;
                    return ModuleState::Stopped;
                }
                _ = watchdog => {
                    self.notifier.error(format!("{} no data received", name));
                    deadline = self.data_timeout.map(|timeout| Instant::now() + timeout);
                }
                line = lines.next() => match line {
                    Some(Ok(OutputLine::Line(line))) => {
                        deadline = self.data_timeout.map(|timeout| Instant::now() + timeout);
                        if line.is_empty() {
                            continue;
                        }
                        tokio::select! {
                            sent = records.send(to_record(&line)) => {
                                if sent.is_err() {
                                    // Relay side is gone, nobody consumes this module any more
                                    self.stop_process(process).await;
                                    return ModuleState::Stopped;
                                }
                            }
                            _ = stop.cancelled() => {
                                self.stop_process(process).await;
                                return ModuleState::Stopped;
                            }
                        }
                    }
                    Some(Ok(OutputLine::Oversized)) => {
                        self.notifier.warning(format!(
                            "Module {} sent a record longer than {} bytes, dropped.",
                            name, self.max_record_len
                        ));
                    }
                    Some(Err(e)) => {
                        self.notifier
                            .warning(format!("Can't read data from module {}.\n{}", name, e));
                        return self.reap(process).await;
                    }
                    None => return self.reap(process).await,
                }
            }
        }
    }

    /// Collect the exit status of a module whose output ended
    async fn reap(&self, process: &mut ModuleProcess) -> ModuleState {
        let name = process.module_name.clone();

        let status = match tokio::time::timeout(self.stop_grace, process.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.notifier.error(format!("Module {} lost.\n{}", name, e));
                return ModuleState::Failed(e.to_string());
            }
            Err(_) => {
                // Output closed but the process lingers
                self.stop_process(process).await;
                self.notifier
                    .error(format!("Module {} closed its output and was stopped.", name));
                return ModuleState::Failed("output closed".to_string());
            }
        };

        if status.success() {
            self.notifier.info(format!("Module {} finished.", name));
            ModuleState::Stopped
        } else {
            let exit = describe_exit(&status);
            self.notifier
                .error(format!("Module {} exited with status {}.", name, exit));
            ModuleState::Failed(format!("exit status {}", exit))
        }
    }

    /// SIGTERM, then kill after the grace period
    async fn stop_process(&self, process: &mut ModuleProcess) {
        let name = process.module_name.clone();
        self.notifier.debug(format!("Stopping module {}", name));

        process.terminate();
        match tokio::time::timeout(self.stop_grace, process.wait()).await {
            Ok(_) => {}
            Err(_) => {
                self.notifier.warning(format!(
                    "Module {} did not stop within {} ms, killing it.",
                    name,
                    self.stop_grace.as_millis()
                ));
                process.kill().await;
            }
        }
    }
}

/// Forward a module's stderr lines as notifications
async fn pump_notifications<R>(name: String, stderr: R, notifier: Notifier, max_len: usize)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stderr, OutputCodec::new(max_len));
    while let Some(Ok(line)) = lines.next().await {
        let OutputLine::Line(line) = line else {
            continue;
        };
        let text = String::from_utf8_lossy(&line);
        let (severity, message) = parse_module_notification(&text);
        if message.is_empty() {
            continue;
        }
        notifier.emit(Notification::new(severity, format!("{}: {}", name, message)));
    }
}
