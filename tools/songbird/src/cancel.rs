use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::ProcessRunner;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CancelState {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Shared cancellation flag observed by the control thread at every suspension point.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that flipped the flag.
    pub fn cancel(&self, reason: &str) -> bool {
        let first = !self.inner.flag.swap(true, Ordering::SeqCst);
        if first {
            if let Ok(mut slot) = self.inner.reason.lock() {
                *slot = Some(reason.to_string());
            }
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn check(&self) -> Result<(), SongbirdError> {
        if self.is_cancelled() {
            return Err(SongbirdError::Cancelled(
                self.reason().unwrap_or_else(|| "interrupted".to_string()),
            ));
        }
        Ok(())
    }
}

/// Signal-side half of cancellation: flag the session and stop in-flight children.
/// Safe to call any number of times.
pub fn handle_interrupt(cancel: &CancelToken, runner: &dyn ProcessRunner, reason: &str) -> bool {
    let first = cancel.cancel(reason);
    let killed = runner.kill_all();
    append_run_log(
        "warn",
        "session.interrupt.received",
        json!({
            "reason": reason,
            "first": first,
            "killed_children": killed,
        }),
    );
    first
}

/// Registers SIGINT/SIGTERM listeners on a dedicated thread.
#[cfg(unix)]
pub fn install_interrupt_handler(
    cancel: CancelToken,
    runner: Arc<dyn ProcessRunner>,
) -> Result<(), SongbirdError> {
    use tokio::signal::unix::{signal, SignalKind};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SongbirdError::Io(e.to_string()))?;
    // Register while the runtime is entered so no signal slips through before the thread polls.
    let (mut interrupt, mut terminate) = {
        let _guard = runtime.enter();
        let interrupt =
            signal(SignalKind::interrupt()).map_err(|e| SongbirdError::Io(e.to_string()))?;
        let terminate =
            signal(SignalKind::terminate()).map_err(|e| SongbirdError::Io(e.to_string()))?;
        (interrupt, terminate)
    };

    std::thread::Builder::new()
        .name("songbird-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    let reason = tokio::select! {
                        received = interrupt.recv() => match received {
                            Some(()) => "SIGINT",
                            None => break,
                        },
                        received = terminate.recv() => match received {
                            Some(()) => "SIGTERM",
                            None => break,
                        },
                    };
                    handle_interrupt(&cancel, runner.as_ref(), reason);
                }
            });
        })
        .map_err(|e| SongbirdError::Io(e.to_string()))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn install_interrupt_handler(
    cancel: CancelToken,
    runner: Arc<dyn ProcessRunner>,
) -> Result<(), SongbirdError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SongbirdError::Io(e.to_string()))?;
    std::thread::Builder::new()
        .name("songbird-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    handle_interrupt(&cancel, runner.as_ref(), "CTRL_C");
                }
            });
        })
        .map_err(|e| SongbirdError::Io(e.to_string()))?;
    Ok(())
}
