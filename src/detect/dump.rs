//! Reading the effective FPM configuration from `php-fpm -tt`

use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::process::ProcessInfo;
use super::FpmConfig;
use crate::error::{Error, Result};

/// Directives dumped by FPM, keyed by name
pub type RawConfig = BTreeMap<String, String>;

static NOTICE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[.*?\] NOTICE:[ \t]*(.*)$").expect("valid regex"));

static SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[([^\]]+)\]$").expect("valid regex"));

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Re-run `process` with `flag`, parse the dump and fill `config`.
///
/// Returns every parsed directive, including those not mapped onto `config`.
pub fn extract(
    process: &ProcessInfo,
    config: &mut FpmConfig,
    flag: &str,
    deadline: Duration,
) -> Result<RawConfig> {
    let mut args = process.invocation().ok_or_else(|| {
        Error::Extraction(format!("command line of process {} is unreadable", process.pid))
    })?;
    args.push(flag.to_string());

    let output = run_dump(&args, deadline)?;
    let text = String::from_utf8_lossy(&output);
    let raw = parse_dump(&text);
    debug!("Parsed {} directives from process {}", raw.len(), process.pid);

    let pools = parse_pools(&text);
    match pools.iter().rev().find(|(_, d)| d.contains_key("listen")) {
        Some((name, directives)) => {
            debug!("Using pool [{}]", name);
            apply_directives(directives, config);
        }
        None => apply_directives(&raw, config),
    }
    Ok(raw)
}

/// Run `args` and return stdout followed by stderr.
///
/// The child is killed once `deadline` passes. Output still held open by
/// a surviving grandchild counts against the same deadline.
pub fn run_dump(args: &[String], deadline: Duration) -> Result<Vec<u8>> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| Error::Extraction("empty command line".to_string()))?;

    debug!("Running {} {}", program, rest.join(" "));
    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Extraction(format!("cannot run {}: {}", program, e)))?;

    let (tx, rx) = mpsc::channel();
    let mut pipes = 0;
    if let Some(stdout) = child.stdout.take() {
        drain(Pipe::Stdout, stdout, tx.clone());
        pipes += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        drain(Pipe::Stderr, stderr, tx.clone());
        pipes += 1;
    }
    drop(tx);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if started.elapsed() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Extraction(format!(
                    "{} did not finish within {:?}",
                    program, deadline
                )));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(Error::Extraction(format!(
                    "cannot wait for {}: {}",
                    program, e
                )))
            }
        }
    };

    let (mut output, errors) = collect(&rx, pipes, started + deadline).ok_or_else(|| {
        Error::Extraction(format!(
            "output of {} still open after {:?}",
            program, deadline
        ))
    })?;
    output.extend(errors);

    if !status.success() {
        let tail = String::from_utf8_lossy(&output);
        return Err(Error::Extraction(format!(
            "{} exited with {}: {}",
            program,
            status,
            tail.trim()
        )));
    }

    Ok(output)
}

#[derive(Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

fn drain<R: Read + Send + 'static>(pipe: Pipe, mut reader: R, tx: Sender<(Pipe, Vec<u8>)>) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send((pipe, buf));
    });
}

/// Wait for `pipes` drained buffers until `until`, returning stdout and stderr.
///
/// `None` when the deadline passes first. The drain threads are left behind
/// and exit once the last writer closes the pipe.
fn collect(
    rx: &Receiver<(Pipe, Vec<u8>)>,
    pipes: usize,
    until: Instant,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    for _ in 0..pipes {
        let remaining = until.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((Pipe::Stdout, buf)) => stdout = buf,
            Ok((Pipe::Stderr, buf)) => stderr = buf,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    Some((stdout, stderr))
}

/// Parse `key = value` lines, dropping the `[date] NOTICE:` log prefix.
///
/// Values of `undefined` are skipped. A later occurrence of a key replaces
/// an earlier one, so with several pools the flat view mixes their
/// directives. [`parse_pools`] keeps them apart.
pub fn parse_dump(output: &str) -> RawConfig {
    let mut directives = RawConfig::new();
    for line in output.lines() {
        if let Some((key, value)) = directive(strip_notice(line)) {
            directives.insert(key.to_string(), value.to_string());
        }
    }
    directives
}

/// Parse the dump into `[section]` blocks, in dump order.
///
/// Directives before the first header land in a section named `""`.
pub fn parse_pools(output: &str) -> Vec<(String, RawConfig)> {
    let mut pools: Vec<(String, RawConfig)> = Vec::new();

    for line in output.lines() {
        let line = strip_notice(line).trim();
        if let Some(name) = SECTION.captures(line).and_then(|c| c.get(1)) {
            pools.push((name.as_str().to_string(), RawConfig::new()));
            continue;
        }
        if let Some((key, value)) = directive(line) {
            if pools.is_empty() {
                pools.push((String::new(), RawConfig::new()));
            }
            if let Some((_, directives)) = pools.last_mut() {
                directives.insert(key.to_string(), value.to_string());
            }
        }
    }

    pools
}

fn strip_notice(line: &str) -> &str {
    match NOTICE_PREFIX.captures(line).and_then(|c| c.get(1)) {
        Some(rest) => rest.as_str(),
        None => line,
    }
}

fn directive(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(" = ")?;
    let key = key.trim();
    let value = value.trim();
    (!key.is_empty() && value != "undefined").then_some((key, value))
}

/// Copy the directives we care about onto `config`
pub fn apply_directives(raw: &RawConfig, config: &mut FpmConfig) {
    if let Some(listen) = raw.get("listen") {
        config.set_listen(listen.clone());
    }
    if let Some(user) = raw.get("user") {
        config.php_user = Some(user.clone());
    }
    if let Some(group) = raw.get("group") {
        config.php_group = Some(group.clone());
    }
    if let Some(owner) = raw.get("listen.owner") {
        config.listen_owner = Some(owner.clone());
    }
    if let Some(group) = raw.get("listen.group") {
        config.listen_group = Some(group.clone());
    }
}
