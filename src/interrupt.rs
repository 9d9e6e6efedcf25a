use crate::error::{AppError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, warn};

/// Shared flag raised by Ctrl-C.
///
/// Long operations poll it at safe points (between disks, between machines)
/// and unwind with [`AppError::Interrupted`], so snapshot guards still run.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// A flag that is only raised through [`Interrupt::trigger`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Watches for Ctrl-C on a background thread.
    ///
    /// The first signal raises the flag; a second one exits immediately.
    pub fn install() -> Self {
        let interrupt = Self::new();
        let watcher = interrupt.clone();

        let spawned = thread::Builder::new()
            .name("ctrl-c".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Cannot start signal watcher: {}", e);
                        return;
                    }
                };

                runtime.block_on(async move {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    warn!("Interrupt received, cleaning up (press Ctrl-C again to force exit)");
                    watcher.trigger();

                    if tokio::signal::ctrl_c().await.is_ok() {
                        error!("Forced exit, snapshots may be left on the host");
                        std::process::exit(130);
                    }
                });
            });

        if let Err(e) = spawned {
            error!("Cannot spawn signal watcher: {}", e);
        }
        interrupt
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(AppError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let copy = interrupt.clone();
        assert!(interrupt.check().is_ok());

        copy.trigger();
        assert!(interrupt.is_triggered());
        assert!(matches!(interrupt.check(), Err(AppError::Interrupted)));
    }
}
