use std::collections::{BTreeMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::{SshClient, SshCommandResult, SshError, SshOutputStream, SshTarget};

#[derive(Default)]
struct PoolState {
    active: usize,
    in_flight: HashSet<(String, String)>,
    seen: BTreeMap<String, SshTarget>,
}

/// Bounds concurrent remote sessions and serialises work per (node, scope).
///
/// At most one lease exists for a given (host, scope) key at any time, so the
/// same step can never run twice concurrently on the same node.
pub struct SessionPool {
    max_sessions: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl SessionPool {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions: max_sessions.max(1),
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Blocks until a session slot is free and no other lease holds `(target, scope)`.
    pub fn acquire(&self, target: &SshTarget, scope: &str) -> SessionLease<'_> {
        let key = (target.connection_id(), scope.to_string());
        let mut state = self.lock();
        while state.active >= self.max_sessions || state.in_flight.contains(&key) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.active += 1;
        state.in_flight.insert(key.clone());
        state
            .seen
            .entry(target.connection_id())
            .or_insert_with(|| target.clone());
        SessionLease {
            pool: self,
            target: target.clone(),
            key,
        }
    }

    /// Closes every multiplexed connection opened through this pool.
    pub fn shutdown(&self, client: &dyn SshClient) {
        let targets: Vec<SshTarget> = {
            let mut state = self.lock();
            std::mem::take(&mut state.seen).into_values().collect()
        };
        for target in targets {
            debug!(host = %target.host, "closing ssh session");
            client.close(&target);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &(String, String)) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        state.in_flight.remove(key);
        drop(state);
        self.released.notify_all();
    }
}

pub struct SessionLease<'a> {
    pool: &'a SessionPool,
    target: SshTarget,
    key: (String, String),
}

impl SessionLease<'_> {
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    pub fn execute(
        &self,
        client: &dyn SshClient,
        command: &str,
        timeout: Duration,
    ) -> Result<SshCommandResult, SshError> {
        client.execute(&self.target, command, timeout)
    }

    pub fn execute_streaming(
        &self,
        client: &dyn SshClient,
        command: &str,
        timeout: Duration,
        on_output: &mut dyn FnMut(SshOutputStream, &str),
    ) -> Result<SshCommandResult, SshError> {
        client.execute_streaming(&self.target, command, timeout, on_output)
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn target(host: &str) -> SshTarget {
        SshTarget {
            host: host.to_string(),
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            password: None,
        }
    }

    #[test]
    fn same_key_waits_for_release() {
        let pool = Arc::new(SessionPool::new(4));
        let lease = pool.acquire(&target("10.0.0.1"), "install");

        let (tx, rx) = mpsc::channel();
        let worker = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let _lease = pool.acquire(&target("10.0.0.1"), "install");
                let _ = tx.send(());
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(lease);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        worker.join().expect("worker");
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn different_scopes_run_together() {
        let pool = SessionPool::new(4);
        let first = pool.acquire(&target("10.0.0.1"), "a");
        let second = pool.acquire(&target("10.0.0.1"), "b");
        assert_eq!(pool.active(), 2);
        drop(first);
        drop(second);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn never_exceeds_max_sessions() {
        let pool = Arc::new(SessionPool::new(2));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|index| {
                let pool = Arc::clone(&pool);
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _lease = pool.acquire(&target(&format!("10.0.0.{index}")), "step");
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn shutdown_closes_each_seen_target_once() {
        struct Recorder(Mutex<Vec<String>>);
        impl SshClient for Recorder {
            fn execute(
                &self,
                _target: &SshTarget,
                _command: &str,
                _timeout: Duration,
            ) -> Result<SshCommandResult, SshError> {
                Ok(SshCommandResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                })
            }

            fn close(&self, target: &SshTarget) {
                self.0.lock().expect("lock").push(target.host.clone());
            }
        }

        let pool = SessionPool::new(2);
        drop(pool.acquire(&target("10.0.0.1"), "a"));
        drop(pool.acquire(&target("10.0.0.1"), "b"));
        drop(pool.acquire(&target("10.0.0.2"), "a"));

        let recorder = Recorder(Mutex::new(Vec::new()));
        pool.shutdown(&recorder);
        assert_eq!(
            recorder.0.into_inner().expect("lock"),
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
        );
    }
}
