use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, SystemTime},
};

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

enum Event {
    Changed,
}

/// Why the watcher invoked its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    fn of(path: &Path) -> Option<Fingerprint> {
        let metadata = fs::metadata(path).ok()?;
        Some(Fingerprint {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

/// Re-runs an action whenever the watched file settles after a change.
#[derive(Debug)]
pub struct Watcher {
    path: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
    stop: Arc<AtomicBool>,
}

impl Watcher {
    pub fn new(path: PathBuf, poll_interval: Duration, debounce: Duration) -> Watcher {
        Watcher {
            path,
            poll_interval,
            debounce,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the returned flag makes [`Watcher::run`] return.
    #[cfg(test)]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Runs `action` once at startup, then once per debounced change of the
    /// watched file. Action errors are logged and do not end the loop.
    ///
    /// Returns only after the stop flag is set. The CLI never sets it, so
    /// `score-stats watch` runs until the process is interrupted.
    pub fn run<F>(&self, mut action: F)
    where
        F: FnMut(Trigger) -> Result<()>,
    {
        // poller baseline must exist before the startup run
        let receiver = self.spawn_poller();
        self.fire(&mut action, Trigger::Startup);

        while let Ok(Event::Changed) = receiver.recv() {
            loop {
                match receiver.recv_timeout(self.debounce) {
                    Ok(Event::Changed) => debug!("absorbing change burst"),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            info!("file modified: {}", self.path.display());
            self.fire(&mut action, Trigger::Modified);
        }
        info!("stopped watching {}", self.path.display());
    }

    fn fire<F>(&self, action: &mut F, trigger: Trigger)
    where
        F: FnMut(Trigger) -> Result<()>,
    {
        if let Err(e) = action(trigger) {
            error!("{:?} run failed: {:#}", trigger, e);
        }
    }

    fn spawn_poller(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        let path = self.path.clone();
        let poll_interval = self.poll_interval;
        let stop = Arc::clone(&self.stop);
        let mut last = Fingerprint::of(&path);

        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(poll_interval);
                let current = Fingerprint::of(&path);
                if current == last {
                    continue;
                }
                last = current;
                if current.is_none() {
                    warn!("{} disappeared", path.display());
                    continue;
                }
                if tx.send(Event::Changed).is_err() {
                    break;
                }
            }
        });

        rx
    }
}

/// Runs `argv` to completion, logging its captured output.
pub fn run_command(argv: &[String]) -> Result<()> {
    let (program, args) = argv.split_first().context("empty command")?;
    info!("running {}", argv.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("unable to start `{}`", program))?;

    if !output.status.success() {
        bail!(
            "`{}` failed with {}: {}",
            argv.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    info!("`{}` completed successfully", argv.join(" "));
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        info!("output:\n{}", stdout.trim());
    }
    Ok(())
}
