use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::CommandSpec;
use crate::error::ResolutionError;

/// Tiempo máximo esperando que un proceso muera tras SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const WARM_TIMEOUT: Duration = Duration::from_secs(15);

/// Identifica el conjunto de procesos lanzados para resolver un track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

struct ManagedProcess {
    label: String,
    pid: Option<u32>,
    child: Child,
    stderr_tail: StderrTail,
}

impl ManagedProcess {
    fn signal_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // InvalidInput: el proceso ya terminó
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("⚠️ No se pudo matar {} (pid {:?}): {}", self.label, self.pid, e);
            }
        }
    }
}

#[derive(Default)]
struct AttemptEntry {
    processes: Vec<ManagedProcess>,
    retired: bool,
}

/// Cómo terminó un proceso recolectado por
/// [`ProcessSupervisor::terminate_processes`].
#[derive(Debug)]
pub struct ProcessExit {
    pub label: String,
    pub status: Option<ExitStatus>,
    pub stderr: Vec<String>,
}

impl ProcessExit {
    /// Código de salida si el proceso terminó por sí mismo con error.
    pub fn failure_code(&self) -> Option<i32> {
        self.status
            .and_then(|status| status.code())
            .filter(|code| *code != 0)
    }
}

/// Proceso recién lanzado. La salida estándar queda disponible para quien
/// lo lanzó; el `Child` lo conserva el supervisor.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub label: String,
    stdout: Option<ChildStdout>,
}

impl ProcessHandle {
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }
}

/// Lanza, registra y termina procesos externos agrupados por intento.
pub struct ProcessSupervisor {
    attempts: DashMap<AttemptId, AttemptEntry>,
    next_attempt: AtomicU64,
    stderr_tail_lines: usize,
}

impl ProcessSupervisor {
    pub fn new(stderr_tail_lines: usize) -> Arc<Self> {
        Arc::new(Self {
            attempts: DashMap::new(),
            next_attempt: AtomicU64::new(1),
            stderr_tail_lines: stderr_tail_lines.max(1),
        })
    }

    /// Abre un intento nuevo. El guard termina sus procesos al soltarse.
    pub fn begin_attempt(self: &Arc<Self>) -> AttemptGuard {
        let id = AttemptId(self.next_attempt.fetch_add(1, Ordering::Relaxed));
        self.attempts.insert(id, AttemptEntry::default());
        debug!("🆕 Intento de resolución {}", id);

        AttemptGuard {
            supervisor: Arc::clone(self),
            id,
        }
    }

    /// Lanza `spec` bajo `attempt` con stdout y stderr en pipe.
    ///
    /// Falla con [`ResolutionError::Superseded`] si el intento ya fue
    /// retirado por [`kill_attempt`](Self::kill_attempt).
    pub fn spawn(
        &self,
        attempt: AttemptId,
        spec: &CommandSpec,
        stdin: Stdio,
    ) -> Result<ProcessHandle, ResolutionError> {
        let mut entry = self
            .attempts
            .get_mut(&attempt)
            .ok_or(ResolutionError::Superseded)?;
        if entry.retired {
            return Err(ResolutionError::Superseded);
        }

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResolutionError::ToolUnavailable {
                tool: spec.label.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(
                spec.label.clone(),
                stderr,
                stderr_tail.clone(),
                self.stderr_tail_lines,
            ));
        }
        let stdout = child.stdout.take();

        debug!("🚀 {} lanzado (pid {:?}) en intento {}", spec.label, pid, attempt);
        entry.processes.push(ManagedProcess {
            label: spec.label.clone(),
            pid,
            child,
            stderr_tail,
        });

        Ok(ProcessHandle {
            pid,
            label: spec.label.clone(),
            stdout,
        })
    }

    /// Retira el intento y envía SIGKILL a todos sus procesos.
    ///
    /// La señal se envía antes de retornar; la recolección es asíncrona.
    /// Retorna cuántos procesos se señalaron.
    pub fn kill_attempt(&self, attempt: AttemptId) -> usize {
        let processes = match self.attempts.get_mut(&attempt) {
            Some(mut entry) => {
                entry.retired = true;
                std::mem::take(&mut entry.processes)
            }
            None => return 0,
        };

        let count = processes.len();
        for mut process in processes {
            process.signal_kill();
        }
        if count > 0 {
            info!("🛑 Intento {} cancelado: {} procesos terminados", attempt, count);
        }
        count
    }

    /// Mata los procesos actuales del intento y espera su salida, sin
    /// retirarlo: se pueden lanzar procesos nuevos después.
    pub async fn terminate_processes(&self, attempt: AttemptId) -> Vec<ProcessExit> {
        let processes = match self.attempts.get_mut(&attempt) {
            Some(mut entry) => std::mem::take(&mut entry.processes),
            None => return Vec::new(),
        };

        let mut exits = Vec::with_capacity(processes.len());
        for mut process in processes {
            process.signal_kill();
            let status = match tokio::time::timeout(REAP_TIMEOUT, process.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("💀 {} (pid {:?}) terminó: {}", process.label, process.pid, status);
                    Some(status)
                }
                Ok(Err(e)) => {
                    warn!("⚠️ Error esperando a {}: {}", process.label, e);
                    None
                }
                Err(_) => {
                    warn!("⚠️ {} no terminó tras SIGKILL", process.label);
                    None
                }
            };
            let stderr = process.stderr_tail.lock().iter().cloned().collect();
            exits.push(ProcessExit {
                label: process.label,
                status,
                stderr,
            });
        }
        exits
    }

    /// Procesos del intento que siguen vivos.
    pub fn live_processes(&self, attempt: AttemptId) -> usize {
        self.attempts
            .get_mut(&attempt)
            .map(|mut entry| {
                entry
                    .processes
                    .iter_mut()
                    .map(|p| matches!(p.child.try_wait(), Ok(None)))
                    .filter(|alive| *alive)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Últimas líneas de stderr de los procesos del intento, para diagnóstico.
    pub fn stderr_tail(&self, attempt: AttemptId) -> Vec<String> {
        self.attempts
            .get(&attempt)
            .map(|entry| {
                entry
                    .processes
                    .iter()
                    .flat_map(|p| {
                        let tail = p.stderr_tail.lock();
                        tail.iter()
                            .map(|line| format!("{}: {}", p.label, line))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Intentos registrados (abiertos o retirados pero aún no soltados).
    pub fn open_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Lanza una invocación barata para precalentar la herramienta y la descarta.
    pub fn warm(&self, spec: &CommandSpec) -> JoinHandle<bool> {
        let spec = spec.clone();
        tokio::spawn(async move {
            let output = Command::new(&spec.program)
                .args(&spec.args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output();

            match tokio::time::timeout(WARM_TIMEOUT, output).await {
                Ok(Ok(output)) if output.status.success() => {
                    let version = String::from_utf8_lossy(&output.stdout);
                    info!(
                        "✅ {} versión: {}",
                        spec.label,
                        version.lines().next().unwrap_or("?").trim()
                    );
                    true
                }
                Ok(Ok(output)) => {
                    warn!("⚠️ {} respondió con {}", spec.label, output.status);
                    false
                }
                Ok(Err(e)) => {
                    warn!("❌ {} no encontrado: {}", spec.label, e);
                    false
                }
                Err(_) => {
                    warn!("⏰ {} no respondió al precalentar", spec.label);
                    false
                }
            }
        })
    }

    fn release(&self, attempt: AttemptId) {
        if let Some((_, entry)) = self.attempts.remove(&attempt) {
            let count = entry.processes.len();
            for mut process in entry.processes {
                process.signal_kill();
            }
            if count > 0 {
                debug!("🧹 Intento {} liberado con {} procesos vivos", attempt, count);
            }
        }
    }
}

/// Handle propio de un intento; al soltarse termina sus procesos.
pub struct AttemptGuard {
    supervisor: Arc<ProcessSupervisor>,
    id: AttemptId,
}

impl AttemptGuard {
    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

impl fmt::Debug for AttemptGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttemptGuard").field(&self.id).finish()
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.supervisor.release(self.id);
    }
}

async fn drain_stderr(label: String, stderr: ChildStderr, tail: StderrTail, limit: usize) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!("[{}] {}", label, line);
        let mut tail = tail.lock();
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
