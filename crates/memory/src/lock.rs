use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

use {fd_lock::RwLock, tokio::sync::oneshot, tracing::debug};

use crate::error::{MemoryError, Result};

/// Lock file at the vault root guarding reindex against concurrent writers.
pub const LEASE_FILE: &str = ".echovault.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Saves and deletes; any number may hold it together.
    Shared,
    /// Reindex; excludes every other holder.
    Exclusive,
}

/// A held vault-wide advisory lock. Released on drop.
///
/// `fd-lock` guards borrow their lock, so the guard lives on a blocking
/// thread that parks until this handle is dropped.
#[derive(Debug)]
pub struct VaultLease {
    mode: LeaseMode,
    _release: oneshot::Sender<()>,
}

impl VaultLease {
    pub async fn acquire(vault_root: &Path, mode: LeaseMode) -> Result<Self> {
        let path = vault_root.join(LEASE_FILE);
        let (acquired_tx, acquired_rx) = oneshot::channel::<io::Result<()>>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let root = vault_root.to_path_buf();
        let lock_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let file = match open_lock_file(&root, &lock_path) {
                Ok(file) => file,
                Err(e) => {
                    let _ = acquired_tx.send(Err(e));
                    return;
                },
            };
            let mut lock = RwLock::new(file);
            match mode {
                LeaseMode::Shared => match lock.read() {
                    Ok(_guard) => park(acquired_tx, release_rx),
                    Err(e) => {
                        let _ = acquired_tx.send(Err(e));
                    },
                },
                LeaseMode::Exclusive => match lock.write() {
                    Ok(_guard) => park(acquired_tx, release_rx),
                    Err(e) => {
                        let _ = acquired_tx.send(Err(e));
                    },
                },
            }
        });

        match acquired_rx.await {
            Ok(Ok(())) => {
                debug!(?mode, path = %path.display(), "vault lease acquired");
                Ok(Self {
                    mode,
                    _release: release_tx,
                })
            },
            Ok(Err(e)) => Err(MemoryError::persistence(path, e)),
            Err(_) => Err(MemoryError::persistence(
                path,
                io::Error::other("lease thread exited before acquiring the lock"),
            )),
        }
    }

    pub fn mode(&self) -> LeaseMode {
        self.mode
    }
}

fn open_lock_file(root: &Path, path: &Path) -> io::Result<File> {
    std::fs::create_dir_all(root)?;
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

fn park(acquired_tx: oneshot::Sender<io::Result<()>>, release_rx: oneshot::Receiver<()>) {
    // Caller gave up waiting; drop the guard right away.
    if acquired_tx.send(Ok(())).is_err() {
        return;
    }
    let _ = release_rx.blocking_recv();
}
